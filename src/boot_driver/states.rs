//! States for the serial boot driver state machine.
//!
//! This modules is private and restricted to the
//! [`boot_driver`](crate::boot_driver) scope. The public interface of the
//! driver is provided by [`boot_driver`](crate::boot_driver).
//!
//! ```ignore
//! use super::states::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::{
    cmp, fmt, io, thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use super::events::*;
use super::markers::*;
use super::session::SerialSession;
use super::state_machine::{BootState, Termination};
use crate::{
    error::{Error, Result},
    network::NetworkPlan,
    settings::Timing,
    signal::{CancelFlag, ReadinessSignal},
};

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// During this call, the state reads the console until it sees what it
    /// is waiting for, then requests a transition to a `new state` by
    /// returning the appropriate `event`. The `event` is consumed to create
    /// the `new state` using the corresponding [`From`] trait implementation.
    fn run(&mut self, console: &mut Console) -> Event;
}

// Console =====================================================================

/// Data shared by all the states: the session and everything the dialogue
/// needs to know about the run.
pub(crate) struct Console {
    pub session: Box<dyn SerialSession>,
    pub plan: NetworkPlan,
    pub readiness: ReadinessSignal,
    pub cancel: CancelFlag,
    pub timing: Timing,
    pub dry_run: bool,
    pub max_retries: u32,
}

impl Console {
    pub fn keep_running(&self) -> bool {
        self.cancel.keep_running()
    }

    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let line = self.session.read_line()?;
        if let Some(ref text) = line {
            if !text.is_empty() {
                debug!("{}", text.trim_end());
            }
        }
        Ok(line)
    }

    pub fn read_available(&mut self) -> io::Result<String> {
        let text = self.session.read_available()?;
        debug!("{}", text.trim_end());
        Ok(text)
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        debug!(">>> {:?}", String::from_utf8_lossy(bytes));
        self.session.write_all(bytes)
    }

    pub fn send_line(&mut self, text: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(b'\n');
        self.send(&bytes)
    }

    /// Sleeps for `duration` unless the run gets cancelled in the meantime.
    /// Returns `false` when cancelled.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while self.keep_running() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(cmp::min(deadline - now, Duration::from_millis(100)));
        }
        false
    }

    /// Reads lines until `on_line` returns an event, the session closes or
    /// the run is cancelled.
    pub fn scan<F>(&mut self, state: BootState, mut on_line: F) -> Event
    where
        F: FnMut(&mut Console, &str) -> Option<Event>,
    {
        while self.keep_running() {
            match self.read_line() {
                Ok(Some(line)) if line.is_empty() => thread::sleep(self.timing.poll_interval),
                Ok(Some(line)) => {
                    if let Some(event) = on_line(self, &line) {
                        return event;
                    }
                }
                Ok(None) => return closed(state),
                Err(e) => return Event::fail(e),
            }
        }
        Event::terminate(Termination::Cancelled)
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("plan", &self.plan)
            .field("readiness", &self.readiness.get())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

// AwaitingInterrupt State =====================================================

/// The initial state. Waits for the bootloader to finish loading the JFFS2
/// partition, which is the moment it accepts the interrupt key.
///
///  * **[`InterruptSentEvent`] => [`LoggingInState`]**
#[derive(Debug)]
pub(crate) struct AwaitingInterruptState {}
impl Runnable for AwaitingInterruptState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Awaiting interrupt");
        console.scan(BootState::AwaitingInterrupt, |console, line| {
            if !(line.contains(JFFS2_LOAD_COMPLETE) || line.contains(JFFS2_LOAD_ERROR)) {
                return None;
            }
            info!("JFFS2 load done. Sending interrupt key.");
            if !console.pause(console.timing.interrupt_delay) {
                return Some(Event::terminate(Termination::Cancelled));
            }
            Some(match console.send(INTERRUPT_KEY) {
                Ok(()) => Event::InterruptSent(InterruptSentEvent {}),
                Err(e) => Event::fail(e),
            })
        })
    }
}

// LoggingIn State =============================================================

/// Sends the credentials once the login window opens and waits for the
/// password to be echoed back.
///
///  * **[`CredentialsSentEvent`] => [`VerifyingLoginState`]**
#[derive(Debug)]
pub(crate) struct LoggingInState {}
impl Runnable for LoggingInState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Logging in");
        console.scan(BootState::LoggingIn, |console, line| {
            if line.contains(LOGIN_WINDOW) {
                info!("Attempting to log in.");
                match send_credentials(console) {
                    Ok(true) => None,
                    Ok(false) => Some(Event::terminate(Termination::Cancelled)),
                    Err(e) => Some(Event::fail(e)),
                }
            } else if line.contains(PASSWORD_ECHO) {
                info!("Checking if login was successful.");
                if !console.pause(console.timing.login_delay) {
                    return Some(Event::terminate(Termination::Cancelled));
                }
                Some(Event::CredentialsSent(CredentialsSentEvent {}))
            } else {
                None
            }
        })
    }
}

// VerifyingLogin State ========================================================

/// Checks that the bootloader prompt follows the login.
///
/// The prompt is not followed by a line break, so this state reads whatever
/// is buffered once there is at least the prompt's worth of it. Anything
/// that does not contain the prompt is a failed login.
///
///  * **[`LoggedInEvent`] => [`ConfiguringBootEnvState`]**
#[derive(Debug)]
pub(crate) struct VerifyingLoginState {}
impl Runnable for VerifyingLoginState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Verifying login");
        while console.keep_running() {
            let waiting = match console.session.bytes_waiting() {
                Ok(waiting) => waiting,
                Err(e) => return Event::fail(e),
            };
            if waiting >= PROMPT.len() {
                let chars = match console.read_available() {
                    Ok(chars) => chars,
                    Err(e) => return Event::fail(e),
                };
                if chars.contains(PROMPT) {
                    info!("U-Boot login successful!");
                    return Event::LoggedIn(LoggedInEvent {});
                }
                return Event::fail(Error::LoginFailed {
                    expected: PROMPT.into(),
                    found: chars.trim().into(),
                });
            }
            thread::sleep(console.timing.poll_interval);
        }
        Event::terminate(Termination::Cancelled)
    }
}

// ConfiguringBootEnv State ====================================================

/// Makes sure the bootloader boots OpenWrt from flash after the upgrade.
///
/// An existing `boot_openwrt` variable must hold exactly the expected
/// command; anything else means the device is not in the state we think it
/// is and nothing gets written. A missing variable is written together with
/// `bootcmd` and persisted with `saveenv` (skipped in dry-run mode).
///
///  * **[`BootEnvReadyEvent`] => [`NetworkBootingState`]**
#[derive(Debug)]
pub(crate) struct ConfiguringBootEnvState {}
impl Runnable for ConfiguringBootEnvState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Configuring boot environment");
        match configure_boot_env(console) {
            Ok(true) => Event::BootEnvReady(BootEnvReadyEvent {}),
            Ok(false) => Event::terminate(Termination::Cancelled),
            Err(e) => Event::fail(e),
        }
    }
}

// NetworkBooting State ========================================================

/// Points U-Boot at our TFTP server and boots the recovery image from it.
///
/// When a transfer times out U-Boot prints `Retry count exceeded` and starts
/// again by itself; each occurrence is a transition back into this state with
/// one more retry, up to the configured bound.
///
///  * **[`RetryNetworkBootEvent`] => [`NetworkBootingState`]**
///  * **[`KernelLoadingEvent`] => [`AwaitingBridgeUpState`]**
#[derive(Debug)]
pub(crate) struct NetworkBootingState {
    pub retries: u32,
}
impl Runnable for NetworkBootingState {
    fn run(&mut self, console: &mut Console) -> Event {
        if self.retries == 0 {
            info!("=> Network booting");
            if let Err(e) = issue_network_boot(console) {
                return Event::fail(e);
            }
        } else {
            info!("=> Network booting (retry #{})", self.retries);
        }

        let retries = self.retries;
        console.scan(BootState::NetworkBooting, |console, line| {
            if line.contains(TFTP_RETRY_EXCEEDED) {
                warn!(
                    "Failed booting from TFTP (attempt #{}): {}",
                    retries,
                    line.trim_end()
                );
                if retries >= console.max_retries {
                    if let Err(e) = console.send(CTRL_C) {
                        warn!("Could not stop the TFTP boot: {}", e);
                    }
                    return Some(Event::fail(Error::TftpRetriesExceeded { retries }));
                }
                Some(Event::RetryNetworkBoot(RetryNetworkBootEvent {
                    retries: retries + 1,
                }))
            } else if line.contains(WRONG_IMAGE_FORMAT) {
                error!("TFTP boot found wrong image format");
                Some(Event::fail(Error::ImageRejected {
                    marker: WRONG_IMAGE_FORMAT.into(),
                }))
            } else if line.contains(MISSING_KERNEL) {
                error!("Unable to boot initramfs file. Check you provided the correct file.");
                Some(Event::fail(Error::ImageRejected {
                    marker: MISSING_KERNEL.into(),
                }))
            } else if line.contains(KERNEL_BOOTING) || line.contains(KERNEL_LOADING) {
                info!("Recovery image loaded, booting it.");
                Some(Event::KernelLoading(KernelLoadingEvent {}))
            } else {
                None
            }
        })
    }
}

// AwaitingBridgeUp State ======================================================

/// Waits for the recovery image to bring up `br-lan`.
///
/// The link goes up, down and up again while the bridge is being created,
/// and the address may still be unreachable right after the bridge reports
/// ready, hence the settle delay.
///
///  * **[`BridgeUpEvent`] => [`AddressAssignedState`]**
#[derive(Debug)]
pub(crate) struct AwaitingBridgeUpState {}
impl Runnable for AwaitingBridgeUpState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Awaiting bridge");
        console.scan(BootState::AwaitingBridgeUp, |console, line| {
            if !line.contains(BRIDGE_READY) {
                return None;
            }
            info!("br-lan is ready.");
            if !console.pause(console.timing.bridge_settle) {
                return Some(Event::terminate(Termination::Cancelled));
            }
            Some(Event::BridgeUp(BridgeUpEvent {}))
        })
    }
}

// AddressAssigned State =======================================================

/// Replaces the recovery image's default address with the temporary one and
/// releases the SSH upgrade.
///
///  * **[`AddressConfiguredEvent`] => [`AwaitingUpgradeCompleteState`]**
#[derive(Debug)]
pub(crate) struct AddressAssignedState {}
impl Runnable for AddressAssignedState {
    fn run(&mut self, console: &mut Console) -> Event {
        let device = *console.plan.device();
        info!("=> Assigning address {}", device);

        let family = if device.is_ipv4() { "-4" } else { "-6" };
        let commands = [
            String::new(),
            format!("ip address del {} dev {}", RECOVERY_DEFAULT_ADDRESS, BRIDGE),
            format!("ip address add {} dev {}", device, BRIDGE),
            format!("ip {} address show", family),
        ];
        for command in commands.iter() {
            if let Err(e) = console.send_line(command) {
                return Event::fail(e);
            }
        }
        if !console.pause(console.timing.address_settle) {
            return Event::terminate(Termination::Cancelled);
        }

        console.readiness.set_ready();
        info!("Device is reachable at {}.", device.addr());
        Event::AddressConfigured(AddressConfiguredEvent {})
    }
}

// AwaitingUpgradeComplete State ===============================================

/// Follows the console while the upgrade runs, until the device restarts.
///
///  * **[`TerminateEvent`] => [`TerminatedState`]**
#[derive(Debug)]
pub(crate) struct AwaitingUpgradeCompleteState {}
impl Runnable for AwaitingUpgradeCompleteState {
    fn run(&mut self, console: &mut Console) -> Event {
        info!("=> Awaiting upgrade completion");
        console.scan(BootState::AwaitingUpgradeComplete, |_, line| {
            if line.contains(UPGRADE_COMPLETED) {
                info!("Flashing successful.");
                None
            } else if line.contains(RESTARTING) {
                info!("Reboot detected. Stopping serial connection.");
                Some(Event::terminate(Termination::RebootDetected))
            } else {
                None
            }
        })
    }
}

// Terminal States =============================================================

/// The driver stopped without error.
#[derive(Debug)]
pub(crate) struct TerminatedState {
    pub termination: Termination,
}

/// The driver stopped on a fatal condition.
#[derive(Debug)]
pub(crate) struct FailedState {
    pub error: Error,
}

// =============================================================================
// Private stuff
// =============================================================================

fn closed(state: BootState) -> Event {
    if state == BootState::AwaitingUpgradeComplete {
        // The upgrade is out of our hands at this point.
        Event::terminate(Termination::SessionClosed)
    } else {
        Event::fail(Error::SessionClosed { state })
    }
}

/// Returns `Ok(false)` when cancelled before the password went out.
fn send_credentials(console: &mut Console) -> io::Result<bool> {
    if !console.pause(console.timing.login_delay) {
        return Ok(false);
    }
    console.send(USERNAME)?;
    if !console.pause(console.timing.login_delay) {
        return Ok(false);
    }
    console.send(PASSWORD)?;
    Ok(true)
}

/// Returns `Ok(false)` when cancelled half-way.
fn configure_boot_env(console: &mut Console) -> Result<bool> {
    console.send(PRINTENV)?;
    if !console.pause(console.timing.env_dump_wait) {
        return Ok(false);
    }
    let dump = console.read_available()?;

    if let Some(existing) = find_env_value(&dump, BOOT_KEY) {
        debug!("Found existing U-Boot {} parameter. Verifying.", BOOT_KEY);
        if existing != BOOT_COMMAND {
            return Err(Error::UnexpectedBootConfig {
                key: BOOT_KEY.into(),
                found: existing.into(),
                expected: BOOT_COMMAND.into(),
            });
        }
        debug!("Existing U-Boot {} parameter looks good.", BOOT_KEY);
        return Ok(true);
    }

    info!("Did not find {} in U-Boot parameters. Setting it.", BOOT_KEY);
    console.send_line(&format!("setenv {} \"{}\"", BOOT_KEY, BOOT_COMMAND))?;
    if !console.pause(console.timing.setenv_delay) {
        return Ok(false);
    }
    console.send(BOOTCMD)?;
    if !console.pause(console.timing.setenv_delay) {
        return Ok(false);
    }

    if console.dry_run {
        info!("dryrun: Skipping saveenv");
        return Ok(true);
    }

    console.send(SAVEENV)?;
    if !console.pause(console.timing.persist_wait) {
        return Ok(false);
    }
    let output = console.read_available()?;
    if !output.contains(PERSIST_CONFIRMED) {
        return Err(Error::PersistFailed {
            marker: PERSIST_CONFIRMED.into(),
            output: output.trim().into(),
        });
    }
    Ok(true)
}

/// Finds `key=value` at the start of a line of a `printenv` dump.
fn find_env_value<'a>(dump: &'a str, key: &str) -> Option<&'a str> {
    dump.lines()
        .map(|line| line.trim_end_matches('\r'))
        .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
}

fn issue_network_boot(console: &mut Console) -> io::Result<()> {
    let plan = console.plan.clone();
    let device = plan.device();
    let server = plan.local().addr();

    console.send_line(&format!("setenv ipaddr {}", device.addr()))?;
    console.send_line(&format!("setenv netmask {}", device.netmask()))?;
    console.send_line(&format!("setenv serverip {}", server))?;
    console.send_line(&format!("setenv gatewayip {}", server))?;
    info!("Starting TFTP Boot.");
    console.send_line(&format!(
        "tftpboot {} {}:{}; bootm",
        LOAD_ADDRESS,
        server,
        plan.boot_file()
    ))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeSession;

    fn console(session: FakeSession, cancel: &CancelFlag) -> Console {
        Console {
            session: Box::new(session),
            plan: NetworkPlan::new("192.168.1.10/24".parse().unwrap(), None, "initramfs.bin")
                .unwrap(),
            readiness: ReadinessSignal::new(),
            cancel: cancel.clone(),
            timing: Timing::immediate(),
            dry_run: false,
            max_retries: 2,
        }
    }

    #[test]
    fn no_credentials_after_cancellation() {
        let cancel = CancelFlag::new();
        let session = FakeSession::new(Vec::<String>::new());
        let writes = session.writes();
        let mut console = console(session, &cancel);
        cancel.cancel();

        assert!(!send_credentials(&mut console).unwrap());
        assert!(writes.all().is_empty());
    }

    #[test]
    fn password_is_held_back_when_cancelled_after_the_username() {
        let cancel = CancelFlag::new();
        let session = FakeSession::new(Vec::<String>::new()).cancelling_after(1, &cancel);
        let writes = session.writes();
        let mut console = console(session, &cancel);

        assert!(!send_credentials(&mut console).unwrap());
        assert_eq!(writes.all(), vec![USERNAME.to_vec()]);
    }

    #[test]
    fn bootcmd_is_held_back_when_cancelled_after_setenv() {
        let cancel = CancelFlag::new();
        let session = FakeSession::new(vec!["printenv\r\nbaudrate=115200\r\n"])
            .cancelling_after(2, &cancel);
        let writes = session.writes();
        let mut console = console(session, &cancel);

        assert!(!configure_boot_env(&mut console).unwrap());
        let written = writes.text();
        assert_eq!(written.len(), 2);
        assert!(written[1].starts_with("setenv boot_openwrt"));
        assert_eq!(writes.count(BOOTCMD), 0);
        assert_eq!(writes.count(SAVEENV), 0);
    }

    #[test]
    fn finds_env_values_at_line_start_only() {
        let dump = "printenv\r\n\
                    bootcmd=run boot_openwrt\r\n\
                    boot_openwrt=bootm 0x0\r\n\
                    baudrate=115200\r\n";
        assert_eq!(find_env_value(dump, "boot_openwrt"), Some("bootm 0x0"));
        assert_eq!(find_env_value(dump, "bootcmd"), Some("run boot_openwrt"));
        assert_eq!(find_env_value(dump, "boot"), None);
        assert_eq!(find_env_value(dump, "ethaddr"), None);
    }
}
