//! Serial port device manipulation.

use log::{debug, info, warn};
use serialport::SerialPort;

use crate::{
    boot_driver::SerialPortSession,
    error::{Error, Result},
    settings::Settings,
};

//==============================================================================
// Public Interface
//==============================================================================

/// Port names tried, in order, when none was given. `COM1` comes last as it
/// nearly always exists.
pub const PROBED_PORTS: [&str; 6] = ["/dev/ttyUSB1", "/dev/ttyUSB0", "COM4", "COM3", "COM2", "COM1"];

/// Opens the port named in `settings`, or the first of [`PROBED_PORTS`] that
/// opens, and wraps it in a session.
pub fn open_session(settings: &Settings) -> Result<SerialPortSession> {
    let port = match &settings.path {
        Some(path) => open_and_setup_port(settings, path)?,
        None => find_serial_port(settings)?,
    };
    Ok(SerialPortSession::new(port))
}

/// Tries [`PROBED_PORTS`] in order. Ports that do not exist are skipped; any
/// other failure, such as a port being busy, is returned right away.
pub fn find_serial_port(settings: &Settings) -> Result<Box<dyn SerialPort>> {
    for path in PROBED_PORTS.iter() {
        debug!("Probing serial port {}", path);
        match open_port(settings, path) {
            Ok(port) => {
                info!("Found serial port {}", path);
                return configure(port, settings);
            }
            Err(e) if is_missing(&e) => debug!("{}: {}", path, e),
            Err(e) => return Err(e.into()),
        }
    }
    Err(serialport::Error::new(
        serialport::ErrorKind::NoDevice,
        format!("none of {} could be opened", PROBED_PORTS.join(", ")),
    )
    .into())
}

/// Opens `path`, retrying for a few seconds in case the adapter was just
/// plugged in, and applies `settings` to it.
pub fn open_and_setup_port(settings: &Settings, path: &str) -> Result<Box<dyn SerialPort>> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(delay::Fixed::from_millis(1000).take(4), |index| {
        debug!("Trying to connect {} (#{})", path, index);
        open_port(settings, path)
    });
    match result {
        Ok(port) => configure(port, settings),
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            warn!(
                "Failed to open {} after {:?} and {} tries: {}",
                path, total_delay, tries, error,
            );
            Err(error.into())
        }
        Err(retry::Error::Internal(reason)) => Err(serialport::Error::new(
            serialport::ErrorKind::Unknown,
            format!("internal error while retrying to open the port: {}", reason),
        )
        .into()),
    }
}

//==============================================================================
// Private stuff
//==============================================================================

fn open_port(settings: &Settings, path: &str) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, settings.baud_rate)
        .data_bits(settings.data_bits)
        .stop_bits(settings.stop_bits)
        .parity(settings.parity)
        .flow_control(settings.flow_control)
        .timeout(settings.read_timeout)
        .open()
}

fn configure(mut port: Box<dyn SerialPort>, settings: &Settings) -> Result<Box<dyn SerialPort>> {
    // Re-apply the settings, some drivers ignore them on open.
    port.set_baud_rate(settings.baud_rate)?;
    port.set_data_bits(settings.data_bits)?;
    port.set_stop_bits(settings.stop_bits)?;
    port.set_parity(settings.parity)?;
    port.set_flow_control(settings.flow_control)?;
    port.set_timeout(settings.read_timeout)?;

    let baud_rate = port.baud_rate()?;
    info!(
        "Connected to {} at {} baud",
        port.name().unwrap_or_default(),
        baud_rate
    );
    debug!("data_bits    : {:#?}", port.data_bits()?);
    debug!("stop_bits    : {:#?}", port.stop_bits()?);
    debug!("parity       : {:#?}", port.parity()?);
    debug!("flow control : {:#?}", port.flow_control()?);

    if baud_rate != settings.baud_rate {
        return Err(Error::Serial(serialport::Error::new(
            serialport::ErrorKind::InvalidInput,
            format!(
                "failed to set the baud rate to {} (port reports {}), it is probably not a valid one",
                settings.baud_rate, baud_rate
            ),
        )));
    }
    Ok(port)
}

fn is_missing(error: &serialport::Error) -> bool {
    match error.kind() {
        serialport::ErrorKind::NoDevice => true,
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => true,
        _ => error.description.contains("No such file or directory"),
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
