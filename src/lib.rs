//! Apflash flashes OpenWrt onto Enterasys WS-AP3710i access points without
//! opening them up, using nothing but the serial console and the network.
//!
//! A run goes through three cooperating units:
//!
//! * The [`SerialBootDriver`] talks to U-Boot on the serial console: it
//!   interrupts the boot, logs in, makes sure the device will boot OpenWrt
//!   from flash afterwards, and network boots an OpenWrt recovery image.
//!   Once the recovery image is up it assigns the device a temporary address.
//! * The [`TftpTransferService`] serves the recovery image to U-Boot.
//! * The [`SshUpgradeClient`] waits until the device has its address, then
//!   uploads the firmware image and runs `sysupgrade`.
//!
//! The [`Coordinator`] ties them together. The SSH client is gated by a
//! one-shot [`ReadinessSignal`]; a shared [`CancelFlag`] stops every unit
//! when one of them fails or the operator interrupts the run.
//!
//! The serial dialogue is implemented as a state machine in terms of
//! **states** and **transitions** between them:
//!
//! * It can only be in one state at any time.
//! * Each state can have its own associated data if needed, and all states
//!   share the console they talk through.
//! * Transitions are triggered via typed **events**. Only explicitly defined
//!   transitions are permitted, and mismatches are caught at compile time.
//! * Transitioning from one state to another consumes the original state.
//!
//! Transitions leverage `rust`'s `From` and `Into` pattern: a state defines
//! how to create itself from the event leading to it.

mod boot_driver;
mod coordinator;
mod error;
mod network;
mod settings;
mod signal;
mod tftp;
mod upgrade;
mod utils;

#[cfg(test)]
mod fake;

pub use boot_driver::{
    decode, BootState, SerialBootDriver, SerialPortSession, SerialSession, Termination,
};
pub use coordinator::{Coordinator, RunReport};
pub use error::{Error, ErrorKind, Result};
pub use network::{IpInterface, NetworkPlan};
pub use settings::{Settings, SettingsBuilder, Timing};
pub use signal::{CancelFlag, Readiness, ReadinessSignal};
pub use tftp::TftpTransferService;
pub use upgrade::{
    upgrade_command, CommandOutput, Ssh2Transport, SshUpgradeClient, UpgradeOutcome,
    UpgradeTransport, FIRMWARE_REMOTE_PATH, UPGRADE_STARTED_MARKER,
};
pub use utils::{find_serial_port, open_and_setup_port, open_session, PROBED_PORTS};
