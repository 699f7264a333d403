//! The SSH side of a flashing run.
//!
//! [`SshUpgradeClient`] waits for the serial driver to declare the device
//! reachable, then uploads the firmware image and starts `sysupgrade` on it.
//! The transport is abstracted behind [`UpgradeTransport`]; the real one is
//! [`Ssh2Transport`].

mod ssh;

use std::{net::IpAddr, path::Path, time::Duration};

use log::{debug, info, warn};

use crate::{
    error::Result,
    signal::{CancelFlag, Readiness, ReadinessSignal},
};

pub use ssh::Ssh2Transport;

// =============================================================================
// Public Interface
// =============================================================================

/// Where the firmware image is copied on the device.
pub const FIRMWARE_REMOTE_PATH: &str = "/tmp/firmware.bin";

/// Printed on standard error by `sysupgrade` once it starts flashing.
pub const UPGRADE_STARTED_MARKER: &str = "Commencing upgrade";

/// How a remote upgrade went, judged from its output.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpgradeOutcome {
    Succeeded,
    /// Carries the captured standard error.
    Failed(String),
}

impl UpgradeOutcome {
    pub fn classify(stderr: &str) -> Self {
        if stderr.contains(UPGRADE_STARTED_MARKER) {
            UpgradeOutcome::Succeeded
        } else {
            UpgradeOutcome::Failed(stderr.trim().to_string())
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UpgradeOutcome::Succeeded)
    }
}

/// What a remote command printed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Not available when the device dropped the connection first, which
    /// `sysupgrade` does on success.
    pub exit_status: Option<i32>,
}

/// A connection to the device able to copy a file and run a command.
pub trait UpgradeTransport: Send {
    /// Connects to `host`. Gives up early once `cancel` is raised, which
    /// later blocking calls on the connection also watch.
    fn connect(&mut self, host: IpAddr, cancel: &CancelFlag) -> Result<()>;

    fn upload(&mut self, local: &Path, remote: &str) -> Result<()>;

    fn execute(&mut self, command: &str) -> Result<CommandOutput>;

    /// Releases the connection. Never fails; problems are only logged.
    fn close(&mut self);
}

/// The remote command flashing the image at [`FIRMWARE_REMOTE_PATH`].
///
/// `sysupgrade --test` only validates the image and does not reboot, so the
/// dry-run variant reboots explicitly to leave the device as it found it.
pub fn upgrade_command(dry_run: bool) -> String {
    if dry_run {
        format!("sysupgrade --test -n {} && reboot", FIRMWARE_REMOTE_PATH)
    } else {
        format!("sysupgrade -n {}", FIRMWARE_REMOTE_PATH)
    }
}

/// Uploads the firmware and starts the upgrade once the device is ready.
pub struct SshUpgradeClient<T> {
    transport: T,
    readiness: ReadinessSignal,
    cancel: CancelFlag,
    dry_run: bool,
    poll_interval: Duration,
}

impl<T: UpgradeTransport> SshUpgradeClient<T> {
    pub fn new(transport: T, readiness: ReadinessSignal, cancel: CancelFlag, dry_run: bool) -> Self {
        SshUpgradeClient {
            transport,
            readiness,
            cancel,
            dry_run,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Blocks until the readiness signal is set, then runs the upgrade.
    ///
    /// Returns `Ok(None)` without touching the transport when the signal was
    /// aborted or the run cancelled before the device became ready, and
    /// `Ok(None)` as well when cancelled between two steps of the upgrade.
    /// Once connected, the transport is closed on every path.
    pub fn run(&mut self, firmware: &Path, device: IpAddr) -> Result<Option<UpgradeOutcome>> {
        info!("Waiting for the device to become reachable over SSH.");
        loop {
            if self.cancel.is_cancelled() {
                debug!("Upgrade cancelled before the device was ready.");
                return Ok(None);
            }
            match self.readiness.wait_timeout(self.poll_interval) {
                Readiness::Pending => continue,
                Readiness::Aborted => {
                    info!("Serial boot did not complete, skipping the upgrade.");
                    return Ok(None);
                }
                Readiness::Ready => break,
            }
        }

        let result = self.upgrade(firmware, device);
        self.transport.close();
        result
    }

    fn upgrade(&mut self, firmware: &Path, device: IpAddr) -> Result<Option<UpgradeOutcome>> {
        info!("Connecting to {} over SSH.", device);
        match self.transport.connect(device, &self.cancel) {
            Err(e) if self.cancel.is_cancelled() => {
                debug!("Connection given up: {}", e);
                return Ok(cancelled("connecting"));
            }
            connected => connected?,
        }
        if self.cancel.is_cancelled() {
            return Ok(cancelled("uploading"));
        }

        info!("Uploading {} to {}.", firmware.display(), FIRMWARE_REMOTE_PATH);
        match self.transport.upload(firmware, FIRMWARE_REMOTE_PATH) {
            Err(e) if self.cancel.is_cancelled() => {
                debug!("Upload given up: {}", e);
                return Ok(cancelled("uploading"));
            }
            uploaded => uploaded?,
        }
        if self.cancel.is_cancelled() {
            return Ok(cancelled("upgrading"));
        }

        let command = upgrade_command(self.dry_run);
        info!("Starting upgrade: {}", command);
        let output = self.transport.execute(&command)?;
        if !output.stdout.trim().is_empty() {
            debug!("sysupgrade stdout: {}", output.stdout.trim());
        }
        debug!("sysupgrade stderr: {}", output.stderr.trim());

        let outcome = UpgradeOutcome::classify(&output.stderr);
        match &outcome {
            UpgradeOutcome::Succeeded => info!("Upgrade started."),
            UpgradeOutcome::Failed(reason) => warn!("Upgrade did not start: {}", reason),
        }
        Ok(Some(outcome))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn cancelled(step: &str) -> Option<UpgradeOutcome> {
    info!("Upgrade cancelled before {}.", step);
    None
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, thread};

    use super::*;
    use crate::fake::FakeTransport;

    const DEVICE: &str = "192.168.1.254";

    fn client(transport: FakeTransport, readiness: &ReadinessSignal, dry_run: bool) -> SshUpgradeClient<FakeTransport> {
        SshUpgradeClient::new(transport, readiness.clone(), CancelFlag::new(), dry_run)
    }

    #[test]
    fn commencing_marker_means_success() {
        assert_eq!(
            UpgradeOutcome::classify("Saving config files...\nCommencing upgrade. Closing all shell sessions.\n"),
            UpgradeOutcome::Succeeded
        );
    }

    #[test]
    fn anything_else_is_a_failure_with_the_output() {
        let outcome = UpgradeOutcome::classify("Image check failed.\n");
        assert_eq!(outcome, UpgradeOutcome::Failed("Image check failed.".into()));
        assert!(!outcome.is_success());
        assert!(!UpgradeOutcome::classify("").is_success());
    }

    #[test]
    fn dry_run_validates_and_reboots() {
        assert_eq!(upgrade_command(false), "sysupgrade -n /tmp/firmware.bin");
        assert_eq!(
            upgrade_command(true),
            "sysupgrade --test -n /tmp/firmware.bin && reboot"
        );
    }

    #[test]
    fn aborted_readiness_touches_nothing() {
        let transport = FakeTransport::new("Commencing upgrade");
        let calls = transport.calls();
        let readiness = ReadinessSignal::new();
        let mut client = client(transport, &readiness, false);

        let waiter = thread::spawn(move || client.run(&PathBuf::from("fw.bin"), DEVICE.parse().unwrap()));
        readiness.abort();

        assert_eq!(waiter.join().unwrap().unwrap(), None);
        assert!(calls.all().is_empty());
    }

    #[test]
    fn cancellation_while_pending_touches_nothing() {
        let transport = FakeTransport::new("Commencing upgrade");
        let calls = transport.calls();
        let cancel = CancelFlag::new();
        let mut client = SshUpgradeClient::new(transport, ReadinessSignal::new(), cancel.clone(), false);

        cancel.cancel();

        assert_eq!(
            client.run(Path::new("fw.bin"), DEVICE.parse().unwrap()).unwrap(),
            None
        );
        assert!(calls.all().is_empty());
    }

    #[test]
    fn ready_device_gets_uploaded_and_upgraded() {
        let transport = FakeTransport::new("Commencing upgrade. Closing all shell sessions.");
        let calls = transport.calls();
        let readiness = ReadinessSignal::new();
        readiness.set_ready();

        let outcome = client(transport, &readiness, false)
            .run(Path::new("fw.bin"), DEVICE.parse().unwrap())
            .unwrap();

        assert_eq!(outcome, Some(UpgradeOutcome::Succeeded));
        assert_eq!(
            calls.all(),
            vec![
                "connect 192.168.1.254",
                "upload fw.bin /tmp/firmware.bin",
                "exec sysupgrade -n /tmp/firmware.bin",
                "close",
            ]
        );
    }

    #[test]
    fn transport_is_closed_after_a_failure() {
        let transport = FakeTransport::new("").refusing_connection();
        let calls = transport.calls();
        let readiness = ReadinessSignal::new();
        readiness.set_ready();

        let result = client(transport, &readiness, true).run(Path::new("fw.bin"), DEVICE.parse().unwrap());

        assert!(result.is_err());
        assert_eq!(calls.names(), vec!["connect", "close"]);
    }

    #[test]
    fn cancellation_while_connecting_stops_the_upgrade() {
        let transport = FakeTransport::new("Commencing upgrade").cancelling_on_connect();
        let calls = transport.calls();
        let readiness = ReadinessSignal::new();
        readiness.set_ready();

        let outcome = client(transport, &readiness, false)
            .run(Path::new("fw.bin"), DEVICE.parse().unwrap())
            .unwrap();

        assert_eq!(outcome, None);
        assert_eq!(calls.names(), vec!["connect", "close"]);
    }

    #[test]
    fn dry_run_sends_the_test_command() {
        let transport = FakeTransport::new("Image check passed");
        let calls = transport.calls();
        let readiness = ReadinessSignal::new();
        readiness.set_ready();

        let outcome = client(transport, &readiness, true)
            .run(Path::new("fw.bin"), DEVICE.parse().unwrap())
            .unwrap();

        assert_eq!(outcome, Some(UpgradeOutcome::Failed("Image check passed".into())));
        assert!(calls
            .all()
            .contains(&"exec sysupgrade --test -n /tmp/firmware.bin && reboot".to_string()));
    }
}
