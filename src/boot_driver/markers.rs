//! The fixed vocabulary of the Enterasys U-Boot console and of the OpenWrt
//! recovery image. Markers are matched case-sensitively as substrings.

// Interrupt ===================================================================

/// Printed by the stock firmware's bootloader once the JFFS2 load finished.
pub(crate) const JFFS2_LOAD_COMPLETE: &str = "### JFFS2 load complete";
/// Printed instead when an OpenWrt image is installed.
pub(crate) const JFFS2_LOAD_ERROR: &str = "### JFFS2 LOAD ERROR";
pub(crate) const INTERRUPT_KEY: &[u8] = b"x";

// Login =======================================================================

pub(crate) const LOGIN_WINDOW: &str = "[30s timeout]";
pub(crate) const USERNAME: &[u8] = b"admin\n";
pub(crate) const PASSWORD: &[u8] = b"new2day\n";
/// Echo of the password line, after which the prompt follows.
pub(crate) const PASSWORD_ECHO: &str = "password: new2day";
/// The prompt is not followed by a line break.
pub(crate) const PROMPT: &str = "Boot (PRI)->";

// Boot environment ============================================================

pub(crate) const PRINTENV: &[u8] = b"printenv\n";
pub(crate) const BOOT_KEY: &str = "boot_openwrt";
pub(crate) const BOOT_COMMAND: &str =
    "setenv bootargs; cp.b 0xee000000 0x1000000 0x1000000; bootm 0x1000000";
pub(crate) const BOOTCMD: &[u8] = b"setenv bootcmd \"run boot_openwrt\"\n";
pub(crate) const SAVEENV: &[u8] = b"saveenv\n";
pub(crate) const PERSIST_CONFIRMED: &str = "Writing to Flash";

// Network boot ================================================================

pub(crate) const LOAD_ADDRESS: &str = "0x1000000";
pub(crate) const TFTP_RETRY_EXCEEDED: &str = "Retry count exceeded";
pub(crate) const WRONG_IMAGE_FORMAT: &str = "Wrong Image Format for bootm command";
pub(crate) const MISSING_KERNEL: &str = "ERROR: can't get kernel image!";
/// U-Boot v2009.x
pub(crate) const KERNEL_BOOTING: &str = "## Booting kernel from FIT Image at";
/// U-Boot v2013.07 and newer
pub(crate) const KERNEL_LOADING: &str = "## Loading kernel from FIT Image at";
pub(crate) const CTRL_C: &[u8] = b"\x03";

// Recovery image ==============================================================

pub(crate) const BRIDGE_READY: &str = "br-lan: link becomes ready";
pub(crate) const BRIDGE: &str = "br-lan";
pub(crate) const RECOVERY_DEFAULT_ADDRESS: &str = "192.168.1.1";
pub(crate) const UPGRADE_COMPLETED: &str = "Upgrade completed";
pub(crate) const RESTARTING: &str = "reboot: Restarting system";
