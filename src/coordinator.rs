//! Runs one flashing session end to end.
//!
//! The [`Coordinator`] owns everything scoped to a run: the network plan, the
//! TFTP service, the readiness signal and the cancellation flag handed to the
//! units. The serial driver and the SSH client run on their own threads; the
//! coordinator polls them instead of blocking on a join, so an operator
//! interrupt is noticed right away.

use std::{
    net::SocketAddr,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use crate::{
    boot_driver::{SerialBootDriver, SerialSession, Termination},
    error::{Error, Result},
    network::{IpInterface, NetworkPlan},
    settings::Settings,
    signal::{CancelFlag, Readiness, ReadinessSignal},
    tftp::TftpTransferService,
    upgrade::{SshUpgradeClient, UpgradeOutcome, UpgradeTransport},
};

/// How often the coordinator looks at its units.
const JOIN_POLL: Duration = Duration::from_millis(50);

// =============================================================================
// Public Interface
// =============================================================================

/// How the units of a completed run ended.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunReport {
    /// How the serial driver stopped.
    pub termination: Termination,
    /// `None` when the upgrade never started.
    pub upgrade: Option<UpgradeOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.termination != Termination::Cancelled
            && self.upgrade.as_ref().map_or(false, UpgradeOutcome::is_success)
    }
}

pub struct Coordinator {
    settings: Settings,
    plan: NetworkPlan,
}

impl Coordinator {
    /// Validates the settings and computes the network plan. Fails before
    /// anything touches the device.
    pub fn new(settings: Settings) -> Result<Self> {
        let boot_file = settings
            .initramfs
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::TftpFile {
                path: settings.initramfs.clone(),
                reason: "not a file".into(),
            })?;
        let local: IpInterface = settings.local_ip.parse()?;
        let device = match &settings.device_ip {
            Some(device) => Some(device.parse::<IpInterface>()?),
            None => None,
        };
        let plan = NetworkPlan::new(local, device, boot_file)?;
        info!(
            "Local address {}, device address {}, boot file {}",
            plan.local(),
            plan.device(),
            plan.boot_file()
        );
        Ok(Coordinator { settings, plan })
    }

    pub fn plan(&self) -> &NetworkPlan {
        &self.plan
    }

    /// Runs both units to completion.
    ///
    /// Raising `cancel` winds the run down and makes it return
    /// [`Error::Cancelled`], unless a unit already failed, in which case that
    /// failure is returned. The TFTP service is stopped on every path.
    pub fn run<S, T>(&self, session: S, transport: T, cancel: &CancelFlag) -> Result<RunReport>
    where
        S: SerialSession + 'static,
        T: UpgradeTransport + 'static,
    {
        let root = tempfile::Builder::new().prefix("apflash").tempdir()?;
        let mut tftp = TftpTransferService::new(root.path());

        let result = self.supervise(&mut tftp, session, transport, cancel);

        tftp.stop();
        result
    }

    fn supervise<S, T>(
        &self,
        tftp: &mut TftpTransferService,
        session: S,
        transport: T,
        cancel: &CancelFlag,
    ) -> Result<RunReport>
    where
        S: SerialSession + 'static,
        T: UpgradeTransport + 'static,
    {
        let bind = SocketAddr::new(self.plan.local().addr(), self.settings.tftp_port);
        tftp.start(&self.settings.initramfs, bind)?;

        let readiness = ReadinessSignal::new();
        // The units get their own flag, so the coordinator can stop them
        // without mistaking it for an operator interrupt.
        let abort = CancelFlag::new();

        let driver = SerialBootDriver::new(
            session,
            self.plan.clone(),
            readiness.clone(),
            abort.clone(),
            &self.settings,
        );
        let serial = spawn("serial", move || driver.run())?;

        let mut client = SshUpgradeClient::new(
            transport,
            readiness.clone(),
            abort.clone(),
            self.settings.dry_run,
        );
        let firmware = self.settings.firmware.clone();
        let device = self.plan.device().addr();
        let ssh = match spawn("ssh", move || client.run(&firmware, device)) {
            Ok(ssh) => ssh,
            Err(e) => {
                abort.cancel();
                readiness.abort();
                join_within(serial, "serial", self.settings.timing.shutdown_grace);
                return Err(e);
            }
        };

        let mut units = Units {
            serial: Some(serial),
            ssh: Some(ssh),
            termination: None,
            upgrade: None,
            failure: None,
        };
        let user_cancelled = self.wait(&mut units, &readiness, cancel);

        // Wind down whatever is left.
        abort.cancel();
        if readiness.abort() {
            debug!("Readiness aborted during wind-down");
        }
        units.finish(self.settings.timing.shutdown_grace);

        if let Some(failure) = units.failure {
            error!("Run failed: {}", failure);
            return Err(failure);
        }
        if user_cancelled {
            warn!("Run cancelled by the operator");
            return Err(Error::Cancelled);
        }
        Ok(RunReport {
            termination: units.termination.unwrap_or(Termination::Cancelled),
            upgrade: units.upgrade,
        })
    }

    /// Polls both units until they are done, one of them fails, or the
    /// operator cancels. Returns whether the operator cancelled.
    fn wait(&self, units: &mut Units, readiness: &ReadinessSignal, cancel: &CancelFlag) -> bool {
        loop {
            if cancel.is_cancelled() {
                return true;
            }

            if units.serial.as_ref().map_or(false, JoinHandle::is_finished) {
                units.join_serial();
                if units.failure.is_some() {
                    return false;
                }
                // The device will never become ready now.
                if readiness.get() == Readiness::Pending {
                    readiness.abort();
                }
            }

            if units.ssh.as_ref().map_or(false, JoinHandle::is_finished) {
                units.join_ssh();
                if units.failure.is_some() {
                    return false;
                }
            }

            if units.serial.is_none() && units.ssh.is_none() {
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The two unit threads and what they reported.
struct Units {
    serial: Option<JoinHandle<Result<Termination>>>,
    ssh: Option<JoinHandle<Result<Option<UpgradeOutcome>>>>,
    termination: Option<Termination>,
    upgrade: Option<UpgradeOutcome>,
    /// The first failure wins.
    failure: Option<Error>,
}

impl Units {
    fn join_serial(&mut self) {
        if let Some(handle) = self.serial.take() {
            match handle.join() {
                Ok(Ok(termination)) => self.termination = Some(termination),
                Ok(Err(e)) => self.fail(e),
                Err(_) => self.fail(Error::WorkerPanicked("serial")),
            }
        }
    }

    fn join_ssh(&mut self) {
        if let Some(handle) = self.ssh.take() {
            match handle.join() {
                Ok(Ok(Some(UpgradeOutcome::Failed(reason)))) => {
                    self.upgrade = Some(UpgradeOutcome::Failed(reason.clone()));
                    self.fail(Error::UpgradeFailed(reason));
                }
                Ok(Ok(outcome)) => self.upgrade = outcome,
                Ok(Err(e)) => self.fail(e),
                Err(_) => self.fail(Error::WorkerPanicked("ssh")),
            }
        }
    }

    fn fail(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        } else {
            debug!("Ignoring subsequent failure: {}", error);
        }
    }

    /// Joins the remaining units, giving each the grace period to notice the
    /// abort. A unit stuck in a blocking call is left behind.
    fn finish(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.serial.as_ref().map_or(false, JoinHandle::is_finished) {
                self.join_serial();
            }
            if self.ssh.as_ref().map_or(false, JoinHandle::is_finished) {
                self.join_ssh();
            }
            if self.serial.is_none() && self.ssh.is_none() {
                return;
            }
            thread::sleep(JOIN_POLL);
        }
        if self.serial.take().is_some() {
            warn!("Serial unit did not stop within {:?}, leaving it behind", grace);
        }
        if self.ssh.take().is_some() {
            warn!("SSH unit did not stop within {:?}, leaving it behind", grace);
        }
    }
}

fn spawn<F, R>(name: &str, unit: F) -> Result<JoinHandle<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Ok(thread::Builder::new().name(name.into()).spawn(unit)?)
}

fn join_within<R>(handle: JoinHandle<R>, name: &str, grace: Duration) {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{} unit did not stop within {:?}, leaving it behind", name, grace);
            return;
        }
        thread::sleep(JOIN_POLL);
    }
    let _ = handle.join();
}

// =============================================================================
// Unit Tests
// =============================================================================
