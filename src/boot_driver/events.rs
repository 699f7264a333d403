//! Events for the serial boot driver state machine.
//!
//! This modules is private and restricted to the
//! [`boot_driver`](crate::boot_driver) scope.
//!
//! ```ignore
//! use super::events::*;
//! ```
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use super::state_machine::Termination;
use crate::error::Error;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Fired from `AwaitingInterrupt` once the interrupt key has been sent.
#[derive(Debug)]
pub(crate) struct InterruptSentEvent {}

/// Fired from `LoggingIn` once the credentials have been sent and echoed back.
#[derive(Debug)]
pub(crate) struct CredentialsSentEvent {}

/// Fired from `VerifyingLogin` when the bootloader prompt showed up.
#[derive(Debug)]
pub(crate) struct LoggedInEvent {}

/// Fired from `ConfiguringBootEnv` once the persistent boot command is known
/// to be in place.
#[derive(Debug)]
pub(crate) struct BootEnvReadyEvent {}

/// Fired from `NetworkBooting` when U-Boot gave up on a TFTP transfer and
/// starts again. Carries the number of retries seen so far.
#[derive(Debug)]
pub(crate) struct RetryNetworkBootEvent {
    pub retries: u32,
}

/// Fired from `NetworkBooting` once U-Boot started loading the kernel.
#[derive(Debug)]
pub(crate) struct KernelLoadingEvent {}

/// Fired from `AwaitingBridgeUp` once `br-lan` is ready and settled.
#[derive(Debug)]
pub(crate) struct BridgeUpEvent {}

/// Fired from `AddressAssigned` once the temporary address is configured and
/// the readiness signal is set.
#[derive(Debug)]
pub(crate) struct AddressConfiguredEvent {}

/// Fired from any state when the driver stops without an error: the device
/// rebooted, the session closed after the upgrade, or the run was
/// cancelled.
#[derive(Debug)]
pub(crate) struct TerminateEvent {
    pub termination: Termination,
}

/// Fired from any state on a fatal condition.
#[derive(Debug)]
pub(crate) struct FailEvent {
    pub error: Error,
}

// Events enum ==================================================================

/// Events that can be triggered within the serial boot driver state machine.
#[derive(Debug)]
pub(crate) enum Event {
    InterruptSent(InterruptSentEvent),
    CredentialsSent(CredentialsSentEvent),
    LoggedIn(LoggedInEvent),
    BootEnvReady(BootEnvReadyEvent),
    RetryNetworkBoot(RetryNetworkBootEvent),
    KernelLoading(KernelLoadingEvent),
    BridgeUp(BridgeUpEvent),
    AddressConfigured(AddressConfiguredEvent),
    Terminate(TerminateEvent),
    Fail(FailEvent),
}

impl Event {
    pub(crate) fn fail(error: impl Into<Error>) -> Self {
        Event::Fail(FailEvent {
            error: error.into(),
        })
    }

    pub(crate) fn terminate(termination: Termination) -> Self {
        Event::Terminate(TerminateEvent { termination })
    }
}
