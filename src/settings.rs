//! Settings for a flashing run: serial port, images, addressing and timing.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::{path::PathBuf, time::Duration};

pub use serialport::{DataBits, FlowControl, Parity, StopBits};

// =============================================================================
// Public Interface
// =============================================================================

/// Every fixed delay used while talking to the device.
///
/// The defaults are tuned for a U-Boot console at 115200 baud. Tests use
/// [`Timing::immediate`] so scripted dialogues run without waiting.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Timing {
    /// Pause between two polls of the serial line.
    pub poll_interval: Duration,
    /// Pause before sending the interrupt key once the bootloader is ready
    /// for it.
    pub interrupt_delay: Duration,
    /// Pause around sending the login credentials.
    pub login_delay: Duration,
    /// Time given to `printenv` to dump the whole environment.
    pub env_dump_wait: Duration,
    /// Pause after each `setenv` while writing the boot environment.
    pub setenv_delay: Duration,
    /// Time given to `saveenv` to write the flash.
    pub persist_wait: Duration,
    /// Time the bridge needs to settle after it first reports ready.
    pub bridge_settle: Duration,
    /// Time given to the `ip` commands before the device is declared ready.
    pub address_settle: Duration,
    /// How long the coordinator waits for a unit to stop once asked to.
    pub shutdown_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            poll_interval: Duration::from_millis(10),
            interrupt_delay: Duration::from_millis(500),
            login_delay: Duration::from_millis(100),
            env_dump_wait: Duration::from_secs(1),
            setenv_delay: Duration::from_millis(500),
            persist_wait: Duration::from_secs(2),
            bridge_settle: Duration::from_secs(2),
            address_settle: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Timing {
    /// No delays at all, except a short shutdown grace.
    pub fn immediate() -> Self {
        Timing {
            poll_interval: Duration::from_millis(1),
            interrupt_delay: Duration::ZERO,
            login_delay: Duration::ZERO,
            env_dump_wait: Duration::ZERO,
            setenv_delay: Duration::ZERO,
            persist_wait: Duration::ZERO,
            bridge_settle: Duration::ZERO,
            address_settle: Duration::ZERO,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Groups all settings of a flashing run and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// The port name, usually the device path. When not set, a fixed list of
    /// common port names is probed.
    pub path: Option<String>,
    /// The baud rate in symbols-per-second.
    pub baud_rate: u32,
    /// Number of bits used to represent a character sent on the line.
    pub data_bits: DataBits,
    /// The type of signalling to use for controlling data transfer.
    pub flow_control: FlowControl,
    /// The type of parity to use for error checking.
    pub parity: Parity,
    /// Number of bits to use to signal the end of a character.
    pub stop_bits: StopBits,
    /// How long a single read on the serial port may block.
    pub read_timeout: Duration,

    /// The recovery image the device boots over TFTP.
    pub initramfs: PathBuf,
    /// The firmware image flashed over SSH.
    pub firmware: PathBuf,
    /// Local address (with optional prefix) serving TFTP.
    pub local_ip: String,
    /// Temporary device address (with optional prefix). Defaults to the
    /// broadcast address of the local network minus one.
    pub device_ip: Option<String>,

    /// Skip every step that makes a persistent change on the device.
    pub dry_run: bool,
    /// UDP port of the TFTP server.
    pub tftp_port: u16,
    /// How many times a failed TFTP boot is retried before giving up.
    pub max_tftp_retries: u32,
    /// Timeout applied to every blocking SSH operation.
    pub ssh_timeout: Duration,
    pub timing: Timing,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```ignore
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyUSB0")
///     .local_ip("192.168.1.10/24")
///     .finalize();
/// ```
#[derive(Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            path: None,
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: Duration::from_secs(2),
            initramfs: PathBuf::from("initramfs-kernel.bin"),
            firmware: PathBuf::from("sysupgrade.bin"),
            local_ip: "192.168.1.10/24".into(),
            device_ip: None,
            dry_run: false,
            tftp_port: 69,
            max_tftp_retries: 2,
            ssh_timeout: Duration::from_secs(30),
            timing: Timing::default(),
            _private_use_builder: (),
        }
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values and no path for the
    /// port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to the serial port
    pub fn path<'a>(mut self, path: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.path = Some(path.into().into_owned());
        self
    }

    /// Set the baud rate in symbols-per-second
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.settings.baud_rate = baud_rate;
        self
    }

    /// Set the number of bits used to represent a character sent on the line
    pub fn data_bits(mut self, data_bits: DataBits) -> Self {
        self.settings.data_bits = data_bits;
        self
    }

    /// Set the type of signalling to use for controlling data transfer
    pub fn flow_control(mut self, flow_control: FlowControl) -> Self {
        self.settings.flow_control = flow_control;
        self
    }

    /// Set the type of parity to use for error checking
    pub fn parity(mut self, parity: Parity) -> Self {
        self.settings.parity = parity;
        self
    }

    /// Set the number of bits to use to signal the end of a character
    pub fn stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.settings.stop_bits = stop_bits;
        self
    }

    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.settings.read_timeout = read_timeout;
        self
    }

    /// Set the path to the recovery image booted over TFTP
    pub fn initramfs(mut self, initramfs: impl Into<PathBuf>) -> Self {
        self.settings.initramfs = initramfs.into();
        self
    }

    /// Set the path to the firmware image flashed over SSH
    pub fn firmware(mut self, firmware: impl Into<PathBuf>) -> Self {
        self.settings.firmware = firmware.into();
        self
    }

    pub fn local_ip<'a>(mut self, local_ip: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.local_ip = local_ip.into().into_owned();
        self
    }

    pub fn device_ip<'a>(mut self, device_ip: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.device_ip = Some(device_ip.into().into_owned());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.settings.dry_run = dry_run;
        self
    }

    pub fn tftp_port(mut self, tftp_port: u16) -> Self {
        self.settings.tftp_port = tftp_port;
        self
    }

    pub fn max_tftp_retries(mut self, max_tftp_retries: u32) -> Self {
        self.settings.max_tftp_retries = max_tftp_retries;
        self
    }

    pub fn ssh_timeout(mut self, ssh_timeout: Duration) -> Self {
        self.settings.ssh_timeout = ssh_timeout;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.settings.timing = timing;
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            path: None,
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: Duration::from_secs(2),
            initramfs: PathBuf::from("initramfs-kernel.bin"),
            firmware: PathBuf::from("sysupgrade.bin"),
            local_ip: "192.168.1.10/24".into(),
            device_ip: None,
            dry_run: false,
            tftp_port: 69,
            max_tftp_retries: 2,
            ssh_timeout: Duration::from_secs(30),
            timing: Timing::default(),
            _private_use_builder: (),
        }
    )
}

#[test]
fn path() {
    let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
    assert_eq!(settings.path.unwrap(), "/dev/ttyUSB0");
}

#[test]
fn baud_rate() {
    let baud_rate = 57_600;
    let settings = SettingsBuilder::new().baud_rate(baud_rate).finalize();
    assert_eq!(settings.baud_rate, baud_rate);
}

#[test]
fn parity() {
    let parity = Parity::Even;
    let settings = SettingsBuilder::new().parity(parity).finalize();
    assert_eq!(settings.parity, parity);
}

#[test]
fn images() {
    let settings = SettingsBuilder::new()
        .initramfs("/tmp/openwrt-initramfs-kernel.bin")
        .firmware("/tmp/openwrt-squashfs-sysupgrade.bin")
        .finalize();
    assert_eq!(
        settings.initramfs,
        PathBuf::from("/tmp/openwrt-initramfs-kernel.bin")
    );
    assert_eq!(
        settings.firmware,
        PathBuf::from("/tmp/openwrt-squashfs-sysupgrade.bin")
    );
}

#[test]
fn addresses() {
    let settings = SettingsBuilder::new()
        .local_ip("10.0.0.1/8")
        .device_ip("10.0.0.2")
        .finalize();
    assert_eq!(settings.local_ip, "10.0.0.1/8");
    assert_eq!(settings.device_ip.unwrap(), "10.0.0.2");
}

#[test]
fn dry_run_and_retries() {
    let settings = SettingsBuilder::new()
        .dry_run(true)
        .max_tftp_retries(5)
        .tftp_port(6969)
        .finalize();
    assert!(settings.dry_run);
    assert_eq!(settings.max_tftp_retries, 5);
    assert_eq!(settings.tftp_port, 6969);
}

#[test]
fn immediate_timing_has_no_dialogue_delays() {
    let timing = Timing::immediate();
    assert_eq!(timing.env_dump_wait, Duration::ZERO);
    assert_eq!(timing.bridge_settle, Duration::ZERO);
    assert!(timing.shutdown_grace > Duration::ZERO);
}
