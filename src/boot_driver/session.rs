//! The serial session the driver talks through.
//!
//! [`SerialSession`] is the seam between the dialogue logic and the actual
//! port, so the state machine can be run against a scripted fake in tests.
//! [`SerialPortSession`] is the implementation on top of `serialport`.

use std::{fmt, io};

use hexplay::HexViewBuilder;
use log::{log_enabled, trace, Level::Trace};
use serialport::SerialPort;

// =============================================================================
// Public Interface
// =============================================================================

/// A line-oriented duplex channel to the device console.
///
/// Reads never discard data: bytes that are not ASCII are passed through in
/// an escaped form (see [`decode`]).
pub trait SerialSession: Send {
    /// Reads the next line, including its line break when one was received.
    ///
    /// Returns `Ok(Some(""))` when the read timed out with nothing received,
    /// a partial line when it timed out in the middle of one, and `Ok(None)`
    /// once the session is closed.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Number of bytes that can be read right now without blocking.
    fn bytes_waiting(&mut self) -> io::Result<usize>;

    /// Everything received so far, without waiting for a line break.
    fn read_available(&mut self) -> io::Result<String>;

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Decodes raw console bytes.
///
/// ASCII comes through unchanged. Any other byte is written as a `\xNN`
/// escape, so the text around it still reads normally and nothing is lost.
/// The Linux kernel is known to print such bytes right after initializing
/// its 8250 serial driver.
pub fn decode(bytes: &[u8]) -> String {
    if bytes.is_ascii() {
        return bytes.iter().map(|b| char::from(*b)).collect();
    }

    if log_enabled!(Trace) {
        let view = HexViewBuilder::new(bytes)
            .address_offset(0)
            .row_width(16)
            .finish();
        trace!("undecodable console bytes:\n{}", view);
    }

    let mut text = String::with_capacity(bytes.len() + 16);
    for b in bytes {
        if b.is_ascii() {
            text.push(char::from(*b));
        } else {
            text.push_str(&format!("\\x{:02x}", b));
        }
    }
    text
}

/// A [`SerialSession`] over an open `serialport` port.
///
/// Bytes read past the end of a line are kept for the next call. The port
/// is closed when the session is dropped.
pub struct SerialPortSession {
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialPortSession {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        SerialPortSession {
            port,
            pending: Vec::new(),
        }
    }

    fn take_pending(&mut self, upto: usize) -> String {
        let bytes: Vec<u8> = self.pending.drain(..upto).collect();
        decode(&bytes)
    }
}

impl SerialSession for SerialPortSession {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                return Ok(Some(self.take_pending(pos + 1)));
            }

            let mut chunk = [0u8; 256];
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    let all = self.pending.len();
                    return Ok(Some(self.take_pending(all)));
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                    // Like a readline with a timeout: hand out whatever we
                    // have, possibly nothing.
                    let all = self.pending.len();
                    return Ok(Some(self.take_pending(all)));
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn bytes_waiting(&mut self) -> io::Result<usize> {
        let available = self.port.bytes_to_read()?;
        Ok(self.pending.len() + available as usize)
    }

    fn read_available(&mut self) -> io::Result<String> {
        let available = self.port.bytes_to_read()? as usize;
        if available > 0 {
            let mut buf = vec![0u8; available];
            self.port.read_exact(&mut buf)?;
            self.pending.extend_from_slice(&buf);
        }
        let all = self.pending.len();
        Ok(self.take_pending(all))
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }
}

impl fmt::Debug for SerialPortSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_fmt_serialport!(self.port, f).finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        assert_eq!(decode(b"br-lan: link becomes ready\r\n"), "br-lan: link becomes ready\r\n");
    }

    #[test]
    fn non_ascii_is_escaped_not_dropped() {
        let text = decode(b"Serial: 8250\xea\x90 ok\n");
        assert_eq!(text, "Serial: 8250\\xea\\x90 ok\n");
    }
}
