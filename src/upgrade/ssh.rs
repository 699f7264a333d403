//! [`UpgradeTransport`](super::UpgradeTransport) over `ssh2`.
//!
//! The recovery image runs Dropbear with an empty root password, so no
//! credential is ever offered: asking the server for its authentication
//! methods performs the `none` authentication, which is all it takes. Files
//! are copied with SCP since the image has no SFTP subsystem.

use std::{
    fs::File,
    io::{Read, Write},
    net::{IpAddr, SocketAddr, TcpStream},
    path::Path,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use retry::{delay, retry, OperationResult};
use ssh2::Session;

use super::{CommandOutput, UpgradeTransport};
use crate::{
    error::{Error, Result},
    signal::CancelFlag,
};

const SSH_PORT: u16 = 22;
const USER: &str = "root";
/// Upper bound of a single TCP connection attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Public Interface
// =============================================================================

/// SSH transport logging in as `root` without a password.
pub struct Ssh2Transport {
    timeout: Duration,
    session: Option<Session>,
    cancel: CancelFlag,
}

impl Ssh2Transport {
    /// `timeout` bounds every blocking operation, connection included.
    pub fn new(timeout: Duration) -> Self {
        Ssh2Transport {
            timeout,
            session: None,
            cancel: CancelFlag::new(),
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "SSH session is not connected",
            ))
        })
    }
}

impl UpgradeTransport for Ssh2Transport {
    fn connect(&mut self, host: IpAddr, cancel: &CancelFlag) -> Result<()> {
        self.cancel = cancel.clone();
        let address = SocketAddr::new(host, SSH_PORT);
        let stream = connect_tcp(&address, self.timeout, cancel)?;
        debug!("Established TCP connection with {}.", address);

        let mut session = Session::new()?;
        session.set_timeout(self.timeout.as_millis() as u32);
        session.set_tcp_stream(stream);
        session.handshake()?;

        // Querying the methods performs the `none` authentication.
        let methods = session.auth_methods(USER)?;
        if !session.authenticated() {
            debug!("Server offered authentication methods: {}", methods);
            return Err(Error::SshAuthentication {
                user: USER.into(),
                host: host.to_string(),
            });
        }

        info!("Logged in to {} as {}.", host, USER);
        self.session = Some(session);
        Ok(())
    }

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()> {
        let mut file = File::open(local)?;
        let size = file.metadata()?.len();
        let session = self.session()?;

        let mut channel = session.scp_send(Path::new(remote), 0o644, size, None)?;

        let pb = ProgressBar::new(size);
        pb.set_style(ProgressStyle::default_bar()
            .template("[AF] ⏩ Uploading [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .progress_chars("=>-"));

        let mut chunk = vec![0u8; 32 * 1024];
        loop {
            if self.cancel.is_cancelled() {
                pb.abandon();
                return Err(Error::Cancelled);
            }
            let bytes_in = file.read(&mut chunk)?;
            if bytes_in == 0 {
                break;
            }
            channel.write_all(&chunk[..bytes_in])?;
            pb.inc(bytes_in as u64);
        }
        pb.finish_with_message("[AF] Firmware uploaded");

        channel.send_eof()?;
        channel.wait_eof()?;
        channel.close()?;
        channel.wait_close()?;
        Ok(())
    }

    fn execute(&mut self, command: &str) -> Result<CommandOutput> {
        let session = self.session()?;
        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        // A successful sysupgrade closes all sessions under our feet, so
        // whatever was read until then is what counts.
        let mut stdout = Vec::new();
        if let Err(e) = channel.read_to_end(&mut stdout) {
            warn!("Reading remote stdout stopped early: {}", e);
        }
        let mut stderr = Vec::new();
        if let Err(e) = channel.stderr().read_to_end(&mut stderr) {
            warn!("Reading remote stderr stopped early: {}", e);
        }

        let exit_status = match channel.wait_close() {
            Ok(()) => channel.exit_status().ok(),
            Err(e) => {
                debug!("Remote channel did not close cleanly: {}", e);
                None
            }
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "done", None) {
                debug!("SSH disconnect failed: {}", e);
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// sshd on the recovery image may take a moment to accept connections after
/// the address is assigned. Retrying stops as soon as `cancel` is raised.
fn connect_tcp(address: &SocketAddr, timeout: Duration, cancel: &CancelFlag) -> Result<TcpStream> {
    let attempt_timeout = timeout.min(CONNECT_ATTEMPT_TIMEOUT);
    let result = retry(delay::Fixed::from_millis(2000).take(5), || {
        if cancel.is_cancelled() {
            return OperationResult::Err(None);
        }
        debug!("Trying to connect to {}", address);
        match TcpStream::connect_timeout(address, attempt_timeout) {
            Ok(stream) => OperationResult::Ok(stream),
            Err(e) => OperationResult::Retry(Some(e)),
        }
    });
    match result {
        Ok(stream) => Ok(stream),
        Err(retry::Error::Operation { error: None, .. }) => {
            debug!("Gave up connecting to {}: cancelled", address);
            Err(Error::Cancelled)
        }
        Err(retry::Error::Operation {
            error: Some(error),
            total_delay,
            tries,
        }) => {
            warn!(
                "Failed to connect to {} after {:?} and {} tries: {}",
                address, total_delay, tries, error
            );
            Err(error.into())
        }
        Err(retry::Error::Internal(reason)) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            reason,
        ))),
    }
}
