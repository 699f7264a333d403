//! Helper functions to deal with serial ports.

mod ports;

pub use ports::{find_serial_port, open_and_setup_port, open_session, PROBED_PORTS};
