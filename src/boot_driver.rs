//! The serial side of a flashing run.
//!
//! [`SerialBootDriver`] walks the device from its stock U-Boot to a running
//! OpenWrt recovery image with a temporary address, and signals the
//! [`ReadinessSignal`](crate::signal::ReadinessSignal) once SSH can take over.
//!
//! The dialogue is implemented as a typestate machine, see the private
//! `state_machine`, `states` and `events` modules.

#[macro_use]
mod macros;

mod events;
mod markers;
mod session;
mod state_machine;
mod states;

pub use session::{decode, SerialPortSession, SerialSession};
pub use state_machine::{BootState, SerialBootDriver, Termination};
