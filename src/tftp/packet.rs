//! TFTP packets (RFC 1350) with option extension (RFC 2347, 2348, 2349).

use std::fmt::{self, Display, Formatter};

use log::warn;
use num_enum::{FromPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use thiserror::Error;

/// Largest block size accepted through the `blksize` option.
pub(crate) const MAX_BLOCK_SIZE: u16 = 65464;
pub(crate) const MIN_BLOCK_SIZE: u16 = 8;
pub(crate) const DEFAULT_BLOCK_SIZE: u16 = 512;

#[derive(Error, Debug, Eq, PartialEq)]
pub(crate) enum PacketError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),

    #[error("unrecognized opcode: {0}")]
    UnknownOpcode(u16),

    #[error("unterminated string")]
    Unterminated,

    #[error("malformed option {key}={value}")]
    MalformedOption { key: String, value: String },
}

pub(crate) type Result<T> = std::result::Result<T, PacketError>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    OptionAck = 6,
}

impl From<TryFromPrimitiveError<Opcode>> for PacketError {
    fn from(e: TryFromPrimitiveError<Opcode>) -> Self {
        PacketError::UnknownOpcode(e.number)
    }
}

/// Codes outside RFC 1350 read as `NotDefined`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub(crate) enum ErrorCode {
    #[num_enum(default)]
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

/// Options a client may request in an RRQ. Unknown options are ignored.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct TransferOptions {
    pub block_size: Option<u16>,
    pub timeout: Option<u8>,
    pub transfer_size: Option<u64>,
}

impl TransferOptions {
    fn push(&mut self, key: &str, value: &str) -> Result<()> {
        let malformed = || PacketError::MalformedOption {
            key: key.into(),
            value: value.into(),
        };
        // Option names are case-insensitive.
        match key.to_ascii_lowercase().as_str() {
            "blksize" => self.block_size = Some(value.parse().map_err(|_| malformed())?),
            "timeout" => self.timeout = Some(value.parse().map_err(|_| malformed())?),
            "tsize" => self.transfer_size = Some(value.parse().map_err(|_| malformed())?),
            _ => warn!("ignoring unsupported TFTP option {}={}", key, value),
        }
        Ok(())
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut push = |key: &str, value: String| {
            push_string(&mut bytes, key);
            push_string(&mut bytes, &value);
        };

        if let Some(block_size) = self.block_size {
            push("blksize", block_size.to_string());
        }
        if let Some(timeout) = self.timeout {
            push("timeout", timeout.to_string());
        }
        if let Some(transfer_size) = self.transfer_size {
            push("tsize", transfer_size.to_string());
        }
        bytes
    }

    pub fn is_empty(&self) -> bool {
        self.block_size.is_none() && self.timeout.is_none() && self.transfer_size.is_none()
    }
}

impl Display for TransferOptions {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut strings = Vec::new();
        if let Some(block_size) = self.block_size {
            strings.push(format!("blksize={}", block_size));
        }
        if let Some(timeout) = self.timeout {
            strings.push(format!("timeout={}", timeout));
        }
        if let Some(transfer_size) = self.transfer_size {
            strings.push(format!("tsize={}", transfer_size));
        }
        write!(f, "{}", strings.join(" "))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Packet {
    ReadRequest {
        filename: String,
        mode: String,
        options: TransferOptions,
    },
    WriteRequest {
        filename: String,
        mode: String,
    },
    Data {
        block: u16,
        data: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    OptionAck {
        options: TransferOptions,
    },
}

impl Packet {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < 2 {
            return Err(PacketError::Truncated(buffer.len()));
        }
        let opcode = Opcode::try_from_primitive(u16::from_be_bytes([buffer[0], buffer[1]]))?;
        let mut rest = &buffer[2..];

        let packet = match opcode {
            Opcode::ReadRequest => {
                let filename = eat_string(&mut rest)?;
                let mode = eat_string(&mut rest)?;
                let mut options = TransferOptions::default();
                while !rest.is_empty() {
                    let key = eat_string(&mut rest)?;
                    let value = eat_string(&mut rest)?;
                    options.push(&key, &value)?;
                }
                Packet::ReadRequest {
                    filename,
                    mode,
                    options,
                }
            }
            Opcode::WriteRequest => {
                let filename = eat_string(&mut rest)?;
                let mode = eat_string(&mut rest)?;
                Packet::WriteRequest { filename, mode }
            }
            Opcode::Data => Packet::Data {
                block: eat_u16(&mut rest, buffer.len())?,
                data: rest.to_vec(),
            },
            Opcode::Ack => Packet::Ack {
                block: eat_u16(&mut rest, buffer.len())?,
            },
            Opcode::Error => {
                let code = ErrorCode::from(eat_u16(&mut rest, buffer.len())?);
                // Some clients omit the terminating NUL of the message.
                let message = eat_string(&mut rest)
                    .unwrap_or_else(|_| String::from_utf8_lossy(rest).into_owned());
                Packet::Error { code, message }
            }
            Opcode::OptionAck => {
                let mut options = TransferOptions::default();
                while !rest.is_empty() {
                    let key = eat_string(&mut rest)?;
                    let value = eat_string(&mut rest)?;
                    options.push(&key, &value)?;
                }
                Packet::OptionAck { options }
            }
        };
        Ok(packet)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => {
                bytes.extend_from_slice(&(Opcode::ReadRequest as u16).to_be_bytes());
                push_string(&mut bytes, filename);
                push_string(&mut bytes, mode);
                bytes.extend(options.to_bytes());
            }
            Packet::WriteRequest { filename, mode } => {
                bytes.extend_from_slice(&(Opcode::WriteRequest as u16).to_be_bytes());
                push_string(&mut bytes, filename);
                push_string(&mut bytes, mode);
            }
            Packet::Data { block, data } => {
                bytes.extend_from_slice(&(Opcode::Data as u16).to_be_bytes());
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                bytes.extend_from_slice(&(Opcode::Ack as u16).to_be_bytes());
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                bytes.extend_from_slice(&(Opcode::Error as u16).to_be_bytes());
                bytes.extend_from_slice(&(*code as u16).to_be_bytes());
                push_string(&mut bytes, message);
            }
            Packet::OptionAck { options } => {
                bytes.extend_from_slice(&(Opcode::OptionAck as u16).to_be_bytes());
                bytes.extend(options.to_bytes());
            }
        }
        bytes
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Packet::ReadRequest {
                filename,
                mode,
                options,
            } => write!(f, "RRQ {} ({}) {}", filename, mode, options),
            Packet::WriteRequest { filename, mode } => write!(f, "WRQ {} ({})", filename, mode),
            Packet::Data { block, data } => {
                write!(f, "DATA block {} ({} bytes)", block, data.len())
            }
            Packet::Ack { block } => write!(f, "ACK block {}", block),
            Packet::Error { code, message } => write!(f, "ERROR {:?} {}", code, message),
            Packet::OptionAck { options } => write!(f, "OACK {}", options),
        }
    }
}

fn eat_string(buffer: &mut &[u8]) -> Result<String> {
    let end = buffer
        .iter()
        .position(|b| *b == 0)
        .ok_or(PacketError::Unterminated)?;
    let string = String::from_utf8_lossy(&buffer[..end]).into_owned();
    *buffer = &buffer[end + 1..];
    Ok(string)
}

fn eat_u16(buffer: &mut &[u8], total: usize) -> Result<u16> {
    if buffer.len() < 2 {
        return Err(PacketError::Truncated(total));
    }
    let value = u16::from_be_bytes([buffer[0], buffer[1]]);
    *buffer = &buffer[2..];
    Ok(value)
}

fn push_string(bytes: &mut Vec<u8>, string: &str) {
    bytes.extend_from_slice(string.as_bytes());
    bytes.push(0);
}

// =============================================================================
// Unit Tests
// =============================================================================
