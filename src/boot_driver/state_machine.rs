//! Serial boot driver state machine.
//!
//! The driver reads the device console line by line and reacts to a fixed
//! set of markers. Each state waits for its own markers, sends its commands
//! and fires the event that moves the machine forward. Transitions are
//! strictly forward, except for `NetworkBooting` which may re-enter itself a
//! bounded number of times while U-Boot retries the TFTP transfer.
//!
//! ```text
//!  AwaitingInterrupt --InterruptSent--> LoggingIn --CredentialsSent-->
//!  VerifyingLogin --LoggedIn--> ConfiguringBootEnv --BootEnvReady-->
//!  NetworkBooting --KernelLoading--> AwaitingBridgeUp --BridgeUp-->
//!  AddressAssigned --AddressConfigured--> AwaitingUpgradeComplete
//!
//!  NetworkBooting --RetryNetworkBoot--> NetworkBooting
//!  (any state) --Terminate--> Terminated
//!  (any state) --Fail--> Failed
//! ```

use std::sync::mpsc::Sender;

use log::{error, info};

use super::events::*;
use super::session::SerialSession;
use super::states::*;
use crate::{
    error::Result,
    network::NetworkPlan,
    settings::Settings,
    signal::{CancelFlag, ReadinessSignal},
};

// =============================================================================
// Public Interface
// =============================================================================

/// Label of the state the driver is in, as reported to observers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootState {
    AwaitingInterrupt,
    LoggingIn,
    VerifyingLogin,
    ConfiguringBootEnv,
    NetworkBooting,
    AwaitingBridgeUp,
    AddressAssigned,
    AwaitingUpgradeComplete,
    Terminated,
    Failed,
}

/// Why the driver stopped without an error.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Termination {
    /// The device restarted after the upgrade.
    RebootDetected,
    /// The console went away once the upgrade was under way.
    SessionClosed,
    /// The run was cancelled.
    Cancelled,
}

/// Drives the device from its stock bootloader to a running recovery image
/// with a known address, then follows the console until the upgrade reboots
/// it.
///
/// The driver owns the session for the duration of [`run`](Self::run); the
/// session is dropped, and the port closed, when it returns.
pub struct SerialBootDriver {
    console: Console,
    transitions: Option<Sender<BootState>>,
}

impl SerialBootDriver {
    pub fn new<S>(
        session: S,
        plan: NetworkPlan,
        readiness: ReadinessSignal,
        cancel: CancelFlag,
        settings: &Settings,
    ) -> Self
    where
        S: SerialSession + 'static,
    {
        SerialBootDriver {
            console: Console {
                session: Box::new(session),
                plan,
                readiness,
                cancel,
                timing: settings.timing.clone(),
                dry_run: settings.dry_run,
                max_retries: settings.max_tftp_retries,
            },
            transitions: None,
        }
    }

    /// Reports every state entered, retries included, on `transitions`.
    pub fn with_transitions(mut self, transitions: Sender<BootState>) -> Self {
        self.transitions = Some(transitions);
        self
    }

    /// Runs the state machine event loop until it reaches `Terminated` or
    /// `Failed`.
    pub fn run(self) -> Result<Termination> {
        let SerialBootDriver {
            console,
            transitions,
        } = self;
        let emit = |state: BootState| {
            if let Some(tx) = &transitions {
                // Nobody listening is fine.
                let _ = tx.send(state);
            }
        };

        let mut sm = DriverStates::AwaitingInterrupt(DriverSM::new(console));
        emit(sm.label());
        loop {
            sm = sm.step();
            emit(sm.label());
            match sm {
                DriverStates::Terminated(sm) => {
                    info!("Serial driver stopped: {:?}", sm.state.termination);
                    return Ok(sm.state.termination);
                }
                DriverStates::Failed(sm) => {
                    error!("Serial driver failed: {}", sm.state.error);
                    return Err(sm.state.error);
                }
                running => sm = running,
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine. The console is the data shared by all states; the
/// type parameter holds the current state.
#[derive(Debug)]
struct DriverSM<S> {
    console: Console,
    state: S,
}

impl<S: Runnable> DriverSM<S> {
    fn run(&mut self) -> Event {
        self.state.run(&mut self.console)
    }
}

impl<S> DriverSM<S> {
    /// Moves the console over to the state created from `event`.
    fn transition<E, N: From<E>>(self, event: E) -> DriverSM<N> {
        DriverSM {
            console: self.console,
            state: event.into(),
        }
    }
}

/// The state machine starts in the `AwaitingInterruptState`.
impl DriverSM<AwaitingInterruptState> {
    fn new(console: Console) -> Self {
        DriverSM {
            console,
            state: AwaitingInterruptState {},
        }
    }
}

/// An enum wrapper around the states of the driver state machine.
enum DriverStates {
    AwaitingInterrupt(DriverSM<AwaitingInterruptState>),
    LoggingIn(DriverSM<LoggingInState>),
    VerifyingLogin(DriverSM<VerifyingLoginState>),
    ConfiguringBootEnv(DriverSM<ConfiguringBootEnvState>),
    NetworkBooting(DriverSM<NetworkBootingState>),
    AwaitingBridgeUp(DriverSM<AwaitingBridgeUpState>),
    AddressAssigned(DriverSM<AddressAssignedState>),
    AwaitingUpgradeComplete(DriverSM<AwaitingUpgradeCompleteState>),
    Terminated(DriverSM<TerminatedState>),
    Failed(DriverSM<FailedState>),
}

/// Every running state accepts `Terminate` and `Fail` on top of its own
/// transitions; anything else is a programming error.
macro_rules! step_state {
    ($sm:ident, { $($event:ident => $next:ident),* $(,)? }) => {{
        let mut sm = $sm;
        let event = sm.run();
        match event {
            $(Event::$event(ev) => DriverStates::$next(sm.transition(ev)),)*
            Event::Terminate(ev) => DriverStates::Terminated(sm.transition(ev)),
            Event::Fail(ev) => DriverStates::Failed(sm.transition(ev)),
            #[allow(unreachable_patterns)]
            _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
        }
    }};
}

impl DriverStates {
    /// The unit of work in the state machine event loop: runs the current
    /// state and takes the transition its event asks for.
    fn step(self) -> Self {
        match self {
            DriverStates::AwaitingInterrupt(sm) => {
                step_state!(sm, { InterruptSent => LoggingIn })
            }
            DriverStates::LoggingIn(sm) => {
                step_state!(sm, { CredentialsSent => VerifyingLogin })
            }
            DriverStates::VerifyingLogin(sm) => {
                step_state!(sm, { LoggedIn => ConfiguringBootEnv })
            }
            DriverStates::ConfiguringBootEnv(sm) => {
                step_state!(sm, { BootEnvReady => NetworkBooting })
            }
            DriverStates::NetworkBooting(sm) => step_state!(sm, {
                RetryNetworkBoot => NetworkBooting,
                KernelLoading => AwaitingBridgeUp,
            }),
            DriverStates::AwaitingBridgeUp(sm) => {
                step_state!(sm, { BridgeUp => AddressAssigned })
            }
            DriverStates::AddressAssigned(sm) => {
                step_state!(sm, { AddressConfigured => AwaitingUpgradeComplete })
            }
            DriverStates::AwaitingUpgradeComplete(sm) => step_state!(sm, {}),
            DriverStates::Terminated(_) | DriverStates::Failed(_) => {
                unreachable!("the state machine cannot step out of a terminal state")
            }
        }
    }

    fn label(&self) -> BootState {
        match self {
            DriverStates::AwaitingInterrupt(_) => BootState::AwaitingInterrupt,
            DriverStates::LoggingIn(_) => BootState::LoggingIn,
            DriverStates::VerifyingLogin(_) => BootState::VerifyingLogin,
            DriverStates::ConfiguringBootEnv(_) => BootState::ConfiguringBootEnv,
            DriverStates::NetworkBooting(_) => BootState::NetworkBooting,
            DriverStates::AwaitingBridgeUp(_) => BootState::AwaitingBridgeUp,
            DriverStates::AddressAssigned(_) => BootState::AddressAssigned,
            DriverStates::AwaitingUpgradeComplete(_) => BootState::AwaitingUpgradeComplete,
            DriverStates::Terminated(_) => BootState::Terminated,
            DriverStates::Failed(_) => BootState::Failed,
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<InterruptSentEvent> for LoggingInState {
    fn from(_: InterruptSentEvent) -> LoggingInState {
        LoggingInState {}
    }
}

impl From<CredentialsSentEvent> for VerifyingLoginState {
    fn from(_: CredentialsSentEvent) -> VerifyingLoginState {
        VerifyingLoginState {}
    }
}

impl From<LoggedInEvent> for ConfiguringBootEnvState {
    fn from(_: LoggedInEvent) -> ConfiguringBootEnvState {
        ConfiguringBootEnvState {}
    }
}

impl From<BootEnvReadyEvent> for NetworkBootingState {
    fn from(_: BootEnvReadyEvent) -> NetworkBootingState {
        NetworkBootingState { retries: 0 }
    }
}

impl From<RetryNetworkBootEvent> for NetworkBootingState {
    fn from(event: RetryNetworkBootEvent) -> NetworkBootingState {
        NetworkBootingState {
            retries: event.retries,
        }
    }
}

impl From<KernelLoadingEvent> for AwaitingBridgeUpState {
    fn from(_: KernelLoadingEvent) -> AwaitingBridgeUpState {
        AwaitingBridgeUpState {}
    }
}

impl From<BridgeUpEvent> for AddressAssignedState {
    fn from(_: BridgeUpEvent) -> AddressAssignedState {
        AddressAssignedState {}
    }
}

impl From<AddressConfiguredEvent> for AwaitingUpgradeCompleteState {
    fn from(_: AddressConfiguredEvent) -> AwaitingUpgradeCompleteState {
        AwaitingUpgradeCompleteState {}
    }
}

impl From<TerminateEvent> for TerminatedState {
    fn from(event: TerminateEvent) -> TerminatedState {
        TerminatedState {
            termination: event.termination,
        }
    }
}

impl From<FailEvent> for FailedState {
    fn from(event: FailEvent) -> FailedState {
        FailedState { error: event.error }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::*;
    use crate::{
        error::{Error, ErrorKind},
        fake::{FakeSession, Writes},
        settings::{SettingsBuilder, Timing},
        signal::Readiness,
    };

    const EXPECTED_ENV: &str = "boot_openwrt=setenv bootargs; cp.b 0xee000000 0x1000000 0x1000000; bootm 0x1000000";

    fn settings(dry_run: bool) -> Settings {
        SettingsBuilder::new()
            .dry_run(dry_run)
            .max_tftp_retries(2)
            .timing(Timing::immediate())
            .finalize()
    }

    fn plan() -> NetworkPlan {
        NetworkPlan::new("192.168.1.10/24".parse().unwrap(), None, "initramfs.bin").unwrap()
    }

    /// Lines up to and including a successful login.
    fn login_script() -> Vec<String> {
        vec![
            "U-Boot 2009.11 (Enterasys)\r\n".into(),
            "### JFFS2 load complete: 4096 bytes loaded\r\n".into(),
            "Press x to abort autoboot [30s timeout]\r\n".into(),
            "username: admin\r\n".into(),
            "password: new2day\r\n".into(),
            "\r\nBoot (PRI)-> ".into(),
        ]
    }

    /// A `printenv` dump holding the expected boot command.
    fn env_dump_ok() -> String {
        format!(
            "printenv\r\nbootcmd=run boot_openwrt\r\n{}\r\nbaudrate=115200\r\n",
            EXPECTED_ENV
        )
    }

    struct Run {
        result: Result<Termination>,
        states: Vec<BootState>,
        writes: Writes,
        readiness: ReadinessSignal,
    }

    fn drive(session: FakeSession, settings: &Settings) -> Run {
        let writes = session.writes();
        let readiness = ReadinessSignal::new();
        let (tx, rx) = mpsc::channel();
        let result = SerialBootDriver::new(
            session,
            plan(),
            readiness.clone(),
            CancelFlag::new(),
            settings,
        )
        .with_transitions(tx)
        .run();
        Run {
            result,
            states: rx.try_iter().collect(),
            writes,
            readiness,
        }
    }

    fn count(states: &[BootState], state: BootState) -> usize {
        states.iter().filter(|s| **s == state).count()
    }

    #[test]
    fn full_run_reaches_reboot() {
        let mut script = login_script();
        script.push(env_dump_ok());
        script.extend(
            [
                "TFTP from server 192.168.1.10; our IP address is 192.168.1.254\r\n",
                "Loading: #################\r\n",
                "## Booting kernel from FIT Image at 01000000 ...\r\n",
                "[   12.3] br-lan: port 1(eth0) entered forwarding state\r\n",
                "[   13.1] br-lan: link becomes ready\r\n",
                "Commencing upgrade. Closing all shell sessions.\r\n",
                "Upgrade completed\r\n",
                "[  101.0] reboot: Restarting system\r\n",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        let run = drive(FakeSession::new(script), &settings(false));

        assert_eq!(run.result.unwrap(), Termination::RebootDetected);
        assert_eq!(
            run.states,
            vec![
                BootState::AwaitingInterrupt,
                BootState::LoggingIn,
                BootState::VerifyingLogin,
                BootState::ConfiguringBootEnv,
                BootState::NetworkBooting,
                BootState::AwaitingBridgeUp,
                BootState::AddressAssigned,
                BootState::AwaitingUpgradeComplete,
                BootState::Terminated,
            ]
        );
        assert_eq!(run.readiness.get(), Readiness::Ready);

        let lines = run.writes.text();
        assert!(lines.contains(&"setenv ipaddr 192.168.1.254\n".to_string()));
        assert!(lines.contains(&"setenv netmask 255.255.255.0\n".to_string()));
        assert!(lines.contains(&"setenv serverip 192.168.1.10\n".to_string()));
        assert!(lines.contains(&"setenv gatewayip 192.168.1.10\n".to_string()));
        assert!(lines
            .contains(&"tftpboot 0x1000000 192.168.1.10:initramfs.bin; bootm\n".to_string()));
        assert!(lines.contains(&"ip address del 192.168.1.1 dev br-lan\n".to_string()));
        assert!(lines.contains(&"ip address add 192.168.1.254/24 dev br-lan\n".to_string()));
        assert!(lines.contains(&"ip -4 address show\n".to_string()));
        // The environment was already correct.
        assert_eq!(run.writes.count(b"saveenv\n"), 0);
    }

    #[test]
    fn interrupt_key_is_sent_exactly_once() {
        let script = vec![
            "### JFFS2 LOAD ERROR: no partition\r\n".to_string(),
            "some noise\r\n".to_string(),
        ];
        let run = drive(FakeSession::new(script), &settings(false));

        assert_eq!(run.writes.count(b"x"), 1);
        assert_eq!(run.writes.all().len(), 1);
        match run.result {
            Err(Error::SessionClosed { state }) => assert_eq!(state, BootState::LoggingIn),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn wrong_prompt_is_a_failed_login() {
        let mut script = login_script();
        script.pop();
        script.push("\r\nLogin incorrect\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        let error = run.result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
        assert!(matches!(error, Error::LoginFailed { .. }));
        assert_eq!(run.states.last(), Some(&BootState::Failed));
        assert_eq!(run.readiness.get(), Readiness::Pending);
    }

    #[test]
    fn mismatching_boot_env_is_left_untouched() {
        let mut script = login_script();
        script.push("printenv\r\nboot_openwrt=bootm 0xee000000\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        match run.result {
            Err(Error::UnexpectedBootConfig { key, found, .. }) => {
                assert_eq!(key, "boot_openwrt");
                assert_eq!(found, "bootm 0xee000000");
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!run.writes.text().iter().any(|l| l.starts_with("setenv")));
        assert_eq!(run.writes.count(b"saveenv\n"), 0);
    }

    #[test]
    fn missing_boot_env_is_written_and_persisted() {
        let mut script = login_script();
        script.push("printenv\r\nbaudrate=115200\r\n".into());
        script.push("Saving Environment to Flash...\r\nWriting to Flash... done\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        let lines = run.writes.text();
        let setenv = lines
            .iter()
            .position(|l| {
                l == "setenv boot_openwrt \"setenv bootargs; cp.b 0xee000000 0x1000000 0x1000000; bootm 0x1000000\"\n"
            })
            .expect("boot_openwrt written");
        let bootcmd = lines
            .iter()
            .position(|l| l == "setenv bootcmd \"run boot_openwrt\"\n")
            .expect("bootcmd written");
        let saveenv = lines
            .iter()
            .position(|l| l == "saveenv\n")
            .expect("saveenv sent");
        assert!(setenv < bootcmd && bootcmd < saveenv);
        assert!(run.states.contains(&BootState::NetworkBooting));
    }

    #[test]
    fn unconfirmed_saveenv_fails() {
        let mut script = login_script();
        script.push("printenv\r\nbaudrate=115200\r\n".into());
        script.push("Flash is write protected\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        assert!(matches!(run.result, Err(Error::PersistFailed { .. })));
        assert!(!run.states.contains(&BootState::NetworkBooting));
    }

    #[test]
    fn dry_run_does_not_persist() {
        let mut script = login_script();
        script.push("printenv\r\nbaudrate=115200\r\n".into());

        let run = drive(FakeSession::new(script), &settings(true));

        assert_eq!(run.writes.count(b"saveenv\n"), 0);
        assert!(run.writes.count(b"setenv bootcmd \"run boot_openwrt\"\n") == 1);
        assert!(run.states.contains(&BootState::NetworkBooting));
    }

    #[test]
    fn tftp_retries_are_bounded() {
        let mut script = login_script();
        script.push(env_dump_ok());
        for _ in 0..3 {
            script.push("Retry count exceeded; starting again\r\n".into());
        }
        script.push("## Booting kernel from FIT Image at 01000000 ...\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        match run.result {
            Err(Error::TftpRetriesExceeded { retries }) => assert_eq!(retries, 2),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(count(&run.states, BootState::NetworkBooting), 3);
        assert_eq!(run.states.last(), Some(&BootState::Failed));
        assert!(!run.states.contains(&BootState::AwaitingBridgeUp));
        // The boot commands go out once, the final give-up stops U-Boot.
        assert_eq!(run.writes.count(b"setenv ipaddr 192.168.1.254\n"), 1);
        assert_eq!(run.writes.count(b"\x03"), 1);
    }

    #[test]
    fn retry_then_boot_succeeds() {
        let mut script = login_script();
        script.push(env_dump_ok());
        script.push("Retry count exceeded; starting again\r\n".into());
        script.push("## Loading kernel from FIT Image at 01000000 ...\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        assert_eq!(count(&run.states, BootState::NetworkBooting), 2);
        assert!(run.states.contains(&BootState::AwaitingBridgeUp));
        assert_eq!(run.writes.count(b"\x03"), 0);
    }

    #[test]
    fn rejected_image_is_fatal() {
        let mut script = login_script();
        script.push(env_dump_ok());
        script.push("Wrong Image Format for bootm command\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        match run.result {
            Err(error @ Error::ImageRejected { .. }) => {
                assert_eq!(error.kind(), ErrorKind::ProtocolMismatch)
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn missing_kernel_is_fatal() {
        let mut script = login_script();
        script.push(env_dump_ok());
        script.push("Retry count exceeded; starting again\r\n".into());
        script.push("ERROR: can't get kernel image!\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        match run.result {
            Err(Error::ImageRejected { marker }) => {
                assert_eq!(marker, "ERROR: can't get kernel image!")
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(run.states.last(), Some(&BootState::Failed));
        assert_eq!(run.readiness.get(), Readiness::Pending);
    }

    #[test]
    fn bare_prompt_completes_the_login() {
        let mut script = login_script();
        script.pop();
        script.push("Boot (PRI)->".into());
        script.push(env_dump_ok());

        let run = drive(FakeSession::new(script), &settings(false));

        assert_eq!(count(&run.states, BootState::ConfiguringBootEnv), 1);
        match run.result {
            Err(Error::SessionClosed { state }) => assert_eq!(state, BootState::NetworkBooting),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn closing_after_readiness_is_not_an_error() {
        let mut script = login_script();
        script.push(env_dump_ok());
        script.push("## Booting kernel from FIT Image at 01000000 ...\r\n".into());
        script.push("br-lan: link becomes ready\r\n".into());

        let run = drive(FakeSession::new(script), &settings(false));

        assert_eq!(run.result.unwrap(), Termination::SessionClosed);
        assert_eq!(run.readiness.get(), Readiness::Ready);
    }

    #[test]
    fn cancellation_stops_an_idle_driver() {
        let session = FakeSession::new(Vec::<String>::new()).idle();
        let cancel = CancelFlag::new();
        let driver = SerialBootDriver::new(
            session,
            plan(),
            ReadinessSignal::new(),
            cancel.clone(),
            &settings(false),
        );

        let handle = thread::spawn(move || driver.run());
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        assert_eq!(handle.join().unwrap().unwrap(), Termination::Cancelled);
    }
}
