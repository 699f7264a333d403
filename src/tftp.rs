//! A read-only TFTP server for the recovery image.
//!
//! The service copies the image into a directory it serves from, listens on
//! the given address and answers read requests for files in that directory.
//! Each transfer runs on its own thread and socket. Write requests are
//! refused.

mod packet;
mod transfer;

use std::{
    fs,
    net::{SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use packet::{ErrorCode, Packet};
use transfer::Transfer;

/// How often the listener checks whether it should stop.
const LISTEN_POLL: Duration = Duration::from_millis(200);

// =============================================================================
// Public Interface
// =============================================================================

pub struct TftpTransferService {
    root: PathBuf,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TftpTransferService {
    /// Creates a stopped service serving from `root`, which must exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        TftpTransferService {
            root: root.into(),
            stop: Arc::new(AtomicBool::new(false)),
            listener: None,
            local_addr: None,
        }
    }

    /// Copies `source` into the served directory and starts listening on
    /// `bind`. Returns the address actually bound, which differs from `bind`
    /// when port 0 was asked for.
    pub fn start(&mut self, source: &Path, bind: SocketAddr) -> Result<SocketAddr> {
        if self.is_running() {
            warn!("TFTP server already running, restarting it");
            self.stop();
        }

        let name = source.file_name().ok_or_else(|| Error::TftpFile {
            path: source.to_path_buf(),
            reason: "not a file".into(),
        })?;
        fs::copy(source, self.root.join(name)).map_err(|e| Error::TftpFile {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;

        let socket = UdpSocket::bind(bind).map_err(|source| Error::TftpBind { addr: bind, source })?;
        socket.set_read_timeout(Some(LISTEN_POLL))?;
        let local_addr = socket.local_addr()?;

        self.stop = Arc::new(AtomicBool::new(false));
        let root = self.root.clone();
        let stop = Arc::clone(&self.stop);
        let listener = thread::Builder::new()
            .name("tftp".into())
            .spawn(move || listen(socket, root, stop))?;

        info!(
            "TFTP server listening on {}, serving {}",
            local_addr,
            name.to_string_lossy()
        );
        self.listener = Some(listener);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stops listening and waits for the listener to exit. Transfers still
    /// in flight are stopped too. Calling it again does nothing.
    pub fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            self.stop.store(true, Ordering::SeqCst);
            if listener.join().is_err() {
                warn!("TFTP listener thread panicked");
            }
            info!("TFTP server stopped");
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for TftpTransferService {
    fn drop(&mut self) {
        self.stop();
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn listen(socket: UdpSocket, root: PathBuf, stop: Arc<AtomicBool>) {
    let mut buffer = [0u8; 2048];
    let mut transfers: Vec<JoinHandle<()>> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer) {
            Ok((size, peer)) => {
                if let Some(handle) = handle_request(&socket, &buffer[..size], peer, &root, &stop)
                {
                    transfers.push(handle);
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => warn!("TFTP receive failed: {}", e),
        }
        transfers.retain(|t| !t.is_finished());
    }

    for transfer in transfers {
        let _ = transfer.join();
    }
}

/// Answers a request arriving on the listening socket. Returns the handle of
/// the transfer thread when one was started.
fn handle_request(
    socket: &UdpSocket,
    request: &[u8],
    peer: SocketAddr,
    root: &Path,
    stop: &Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let packet = match Packet::parse(request) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("TFTP: dropping malformed request from {}: {}", peer, e);
            return None;
        }
    };
    debug!("TFTP {}: {}", peer, packet);

    match packet {
        Packet::ReadRequest {
            filename,
            mode,
            options,
        } => {
            if !mode.eq_ignore_ascii_case("octet") {
                debug!("TFTP {}: serving {} in octet mode", peer, mode);
            }
            let data = match resolve(root, &filename).and_then(|path| fs::read(path).ok()) {
                Some(data) => data,
                None => {
                    warn!("TFTP {}: file {} not found", peer, filename);
                    reply_error(socket, peer, ErrorCode::FileNotFound, "file not found");
                    return None;
                }
            };
            info!("TFTP: {} requested {} ({} bytes)", peer, filename, data.len());

            let local = match socket.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    warn!("TFTP: {}", e);
                    return None;
                }
            };
            let stop = Arc::clone(stop);
            let spawned = thread::Builder::new()
                .name("tftp-transfer".into())
                .spawn(move || {
                    let result =
                        Transfer::new(local, peer, data, &options, stop).and_then(|t| t.run());
                    if let Err(e) = result {
                        warn!("TFTP transfer to {} failed: {}", peer, e);
                    }
                });
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!("TFTP: could not start transfer: {}", e);
                    None
                }
            }
        }
        Packet::WriteRequest { .. } => {
            reply_error(socket, peer, ErrorCode::AccessViolation, "read-only server");
            None
        }
        _ => {
            reply_error(socket, peer, ErrorCode::IllegalOperation, "expected a request");
            None
        }
    }
}

/// Maps a requested name onto a plain file of the served directory.
fn resolve(root: &Path, filename: &str) -> Option<PathBuf> {
    let name = filename.trim_start_matches('/');
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
        return None;
    }
    let path = root.join(name);
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

fn reply_error(socket: &UdpSocket, peer: SocketAddr, code: ErrorCode, message: &str) {
    let packet = Packet::Error {
        code,
        message: message.into(),
    };
    if let Err(e) = socket.send_to(&packet.to_bytes(), peer) {
        debug!("TFTP: could not send error to {}: {}", peer, e);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
