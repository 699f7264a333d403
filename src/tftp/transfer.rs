//! One read transfer, served from its own socket (its own transfer ID).

use std::{
    cmp,
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use super::{
    packet::{
        ErrorCode, Packet, TransferOptions, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE,
        MIN_BLOCK_SIZE,
    },
    LISTEN_POLL,
};

/// Default wait for an acknowledgement before a block is sent again.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
/// Longest `timeout` option agreed to. Longer requests are left out of the
/// OACK and the default applies.
const MAX_TIMEOUT_SECS: u8 = 10;
/// Sends of the same packet before the transfer is given up.
const MAX_ATTEMPTS: u32 = 5;

#[derive(Error, Debug)]
pub(crate) enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("client aborted the transfer: {code:?} {message}")]
    Aborted { code: ErrorCode, message: String },

    #[error("no acknowledgement for block {block} after {attempts} attempts")]
    TimedOut { block: u16, attempts: u32 },

    #[error("server is stopping")]
    Stopped,
}

type Result<T> = std::result::Result<T, TransferError>;

/// Options the server agrees to, given what the client asked for.
///
/// The block size is clamped to the range of RFC 2348, a timeout is accepted
/// up to [`MAX_TIMEOUT_SECS`], and a requested transfer size is answered with
/// the actual size of the file.
pub(crate) fn negotiate(requested: &TransferOptions, file_size: u64) -> TransferOptions {
    TransferOptions {
        block_size: requested
            .block_size
            .map(|size| size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)),
        timeout: requested
            .timeout
            .filter(|t| (1..=MAX_TIMEOUT_SECS).contains(t)),
        transfer_size: requested.transfer_size.map(|_| file_size),
    }
}

pub(crate) struct Transfer {
    socket: UdpSocket,
    peer: SocketAddr,
    data: Vec<u8>,
    options: TransferOptions,
    timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl Transfer {
    /// Binds a fresh socket on `local` for talking to `peer`.
    pub fn new(
        local: SocketAddr,
        peer: SocketAddr,
        data: Vec<u8>,
        requested: &TransferOptions,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(local.ip(), 0))?;
        socket.connect(peer)?;
        let options = negotiate(requested, data.len() as u64);
        let timeout = options
            .timeout
            .map(|t| Duration::from_secs(t.into()))
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(Transfer {
            socket,
            peer,
            data,
            options,
            timeout,
            stop,
        })
    }

    /// Sends the whole file, retransmitting unacknowledged packets.
    pub fn run(self) -> Result<()> {
        if !self.options.is_empty() {
            debug!("TFTP {}: OACK {}", self.peer, self.options);
            let oack = Packet::OptionAck {
                options: self.options.clone(),
            };
            self.send_until_acked(&oack, 0)?;
        }

        let block_size = usize::from(self.options.block_size.unwrap_or(DEFAULT_BLOCK_SIZE));
        let mut block: u16 = 0;
        let mut offset = 0;
        loop {
            // Block numbers wrap around for files beyond 65535 blocks.
            block = block.wrapping_add(1);
            let end = cmp::min(offset + block_size, self.data.len());
            let packet = Packet::Data {
                block,
                data: self.data[offset..end].to_vec(),
            };
            self.send_until_acked(&packet, block)?;

            // A block shorter than the block size ends the transfer, which
            // may take an empty one.
            if end - offset < block_size {
                break;
            }
            offset = end;
        }

        info!("TFTP: sent {} bytes to {}", self.data.len(), self.peer);
        Ok(())
    }

    fn send_until_acked(&self, packet: &Packet, block: u16) -> Result<()> {
        let bytes = packet.to_bytes();
        let mut buffer = [0u8; 1024];

        for attempt in 1..=MAX_ATTEMPTS {
            if self.stopping() {
                return Err(TransferError::Stopped);
            }
            trace!("TFTP {}: {} (attempt {})", self.peer, packet, attempt);
            self.socket.send(&bytes)?;

            // Wait for the matching ACK until the attempt's deadline, in
            // slices short enough to notice a stop. Duplicate ACKs of earlier
            // blocks are ignored rather than answered, to stay clear of the
            // sorcerer's apprentice syndrome, and do not extend the deadline.
            let deadline = Instant::now() + self.timeout;
            loop {
                if self.stopping() {
                    return Err(TransferError::Stopped);
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                self.socket
                    .set_read_timeout(Some(cmp::min(remaining, LISTEN_POLL)))?;

                let size = match self.socket.recv(&mut buffer) {
                    Ok(size) => size,
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => return Err(e.into()),
                };
                match Packet::parse(&buffer[..size]) {
                    Ok(Packet::Ack { block: acked }) if acked == block => return Ok(()),
                    Ok(Packet::Ack { block: acked }) => {
                        trace!("TFTP {}: stale ACK {}", self.peer, acked)
                    }
                    Ok(Packet::Error { code, message }) => {
                        return Err(TransferError::Aborted { code, message })
                    }
                    Ok(other) => warn!("TFTP {}: unexpected {}", self.peer, other),
                    Err(e) => warn!("TFTP {}: dropping malformed packet: {}", self.peer, e),
                }
            }
        }

        Err(TransferError::TimedOut {
            block,
            attempts: MAX_ATTEMPTS,
        })
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
