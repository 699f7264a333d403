//! Addressing for a flashing run.
//!
//! The run needs two addresses on the same link: the local one, where the
//! TFTP server listens, and the temporary one given to the device once the
//! recovery image is up. Both are written as `address/prefix` (the prefix is
//! optional and then defaults to a single host).

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use log::warn;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

// IpInterface =================================================================

/// An address together with the prefix length of its network.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IpInterface {
    addr: IpAddr,
    prefix: u8,
}

impl IpInterface {
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = max_prefix(&addr);
        if prefix > max {
            return Err(Error::InvalidAddress {
                input: format!("{}/{}", addr, prefix),
                reason: format!("prefix length must not exceed {}", max),
            });
        }
        Ok(IpInterface { addr, prefix })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn max_prefix(&self) -> u8 {
        max_prefix(&self.addr)
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// The netmask, in the notation U-Boot's `netmask` variable expects.
    pub fn netmask(&self) -> IpAddr {
        from_bits(&self.addr, self.mask_bits())
    }

    /// The first address of the network.
    pub fn network(&self) -> IpAddr {
        from_bits(&self.addr, to_bits(&self.addr) & self.mask_bits())
    }

    /// The last address of the network (the broadcast address for IPv4).
    pub fn broadcast(&self) -> IpAddr {
        let bits = to_bits(&self.addr);
        from_bits(&self.addr, bits | (!self.mask_bits() & self.all_ones()))
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        addr.is_ipv4() == self.addr.is_ipv4()
            && to_bits(addr) & self.mask_bits() == to_bits(&self.addr) & self.mask_bits()
    }

    fn all_ones(&self) -> u128 {
        match self.addr {
            IpAddr::V4(_) => u128::from(u32::MAX),
            IpAddr::V6(_) => u128::MAX,
        }
    }

    fn mask_bits(&self) -> u128 {
        let host_bits = u32::from(self.max_prefix() - self.prefix);
        let host_mask = 1u128.checked_shl(host_bits).map_or(u128::MAX, |v| v - 1);
        self.all_ones() & !host_mask
    }
}

impl FromStr for IpInterface {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidAddress {
            input: input.to_owned(),
            reason: reason.to_owned(),
        };

        let (addr, prefix) = match input.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (input.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid("not an IP address"))?;
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .map_err(|_| invalid("prefix length is not a number"))?,
            None => max_prefix(&addr),
        };
        IpInterface::new(addr, prefix)
    }
}

impl fmt::Display for IpInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

// NetworkPlan =================================================================

/// Addresses and boot file for one run. Built once, read-only afterwards.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NetworkPlan {
    local: IpInterface,
    device: IpInterface,
    boot_file: String,
}

impl NetworkPlan {
    /// Builds the plan from the operator's input.
    ///
    /// A single-host prefix is widened (/24 for IPv4, /64 for IPv6) since it
    /// usually means the prefix was forgotten. When no device address is
    /// given, the device gets the last usable address of the local network:
    /// the broadcast address minus one, on the same prefix.
    pub fn new(
        local: IpInterface,
        device: Option<IpInterface>,
        boot_file: impl Into<String>,
    ) -> Result<Self> {
        let local = fix_prefix(local)?;
        let device = match device {
            Some(device) => fix_prefix(device)?,
            None => {
                let last = predecessor(&local.broadcast());
                IpInterface::new(last, local.prefix())?
            }
        };

        if local.addr() == device.addr() {
            return Err(Error::InvalidNetworkPlan(format!(
                "local address {} and device address {} are identical",
                local, device
            )));
        }
        if local.is_ipv4() != device.is_ipv4() {
            return Err(Error::InvalidNetworkPlan(format!(
                "local address {} and device address {} are not of the same family",
                local, device
            )));
        }
        if !local.contains(&device.addr()) {
            warn!(
                "Device address {} is outside of the local network {}/{}",
                device,
                local.network(),
                local.prefix()
            );
        }

        Ok(NetworkPlan {
            local,
            device,
            boot_file: boot_file.into(),
        })
    }

    /// Where the TFTP server listens; also the device's server and gateway.
    pub fn local(&self) -> &IpInterface {
        &self.local
    }

    /// The temporary address of the device.
    pub fn device(&self) -> &IpInterface {
        &self.device
    }

    /// The name the device asks for over TFTP.
    pub fn boot_file(&self) -> &str {
        &self.boot_file
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn fix_prefix(interface: IpInterface) -> Result<IpInterface> {
    let max = interface.max_prefix();
    if interface.prefix() == max {
        let widened = if interface.is_ipv4() { 24 } else { 64 };
        warn!(
            "Received too small network prefix {} for {}. Assuming {}/{}.",
            interface.prefix(),
            interface,
            interface.addr(),
            widened
        );
        IpInterface::new(interface.addr(), widened)
    } else if interface.prefix() == max - 1 {
        Err(Error::InvalidNetworkPlan(format!(
            "too small prefix for {}, requires space for at least two addresses plus broadcast",
            interface
        )))
    } else {
        Ok(interface)
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn to_bits(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(*v4)),
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn from_bits(family: &IpAddr, bits: u128) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

fn predecessor(addr: &IpAddr) -> IpAddr {
    from_bits(addr, to_bits(addr).wrapping_sub(1))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(s: &str) -> IpInterface {
        s.parse().unwrap()
    }

    #[test]
    fn parses_with_and_without_prefix() {
        assert_eq!(iface("192.168.1.10/24").prefix(), 24);
        assert_eq!(iface("192.168.1.10").prefix(), 32);
        assert_eq!(iface("fd00::1").prefix(), 128);
    }

    #[test]
    fn rejects_garbage() {
        assert!("192.168.1/24".parse::<IpInterface>().is_err());
        assert!("192.168.1.1/33".parse::<IpInterface>().is_err());
        assert!("192.168.1.1/abc".parse::<IpInterface>().is_err());
    }

    #[test]
    fn netmask_network_and_broadcast() {
        let i = iface("10.1.2.3/20");
        assert_eq!(i.netmask().to_string(), "255.255.240.0");
        assert_eq!(i.network().to_string(), "10.1.0.0");
        assert_eq!(i.broadcast().to_string(), "10.1.15.255");
    }

    #[test]
    fn ipv4_host_prefix_is_widened_to_24() {
        let plan = NetworkPlan::new(iface("192.168.1.10/32"), None, "initramfs.bin").unwrap();
        assert_eq!(plan.local().prefix(), 24);
        assert_eq!(plan.device().to_string(), "192.168.1.254/24");
    }

    #[test]
    fn ipv6_host_prefix_is_widened_to_64() {
        let plan = NetworkPlan::new(iface("fd00::10"), None, "initramfs.bin").unwrap();
        assert_eq!(plan.local().prefix(), 64);
        assert_eq!(
            plan.device().addr().to_string(),
            "fd00::ffff:ffff:ffff:fffe"
        );
    }

    #[test]
    fn device_defaults_to_broadcast_minus_one() {
        let plan = NetworkPlan::new(iface("172.16.0.1/30"), None, "f").unwrap();
        assert_eq!(plan.device().to_string(), "172.16.0.2/30");
    }

    #[test]
    fn rejects_prefix_without_room_for_two_hosts() {
        let err = NetworkPlan::new(iface("192.168.1.10/31"), None, "f").unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkPlan(_)));

        let err = NetworkPlan::new(
            iface("192.168.1.10/24"),
            Some(iface("192.168.1.20/31")),
            "f",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkPlan(_)));
    }

    #[test]
    fn rejects_identical_addresses() {
        let err = NetworkPlan::new(
            iface("192.168.1.254/24"),
            Some(iface("192.168.1.254/24")),
            "f",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkPlan(_)));

        // The default device address collides with the local one.
        assert!(NetworkPlan::new(iface("192.168.1.254/24"), None, "f").is_err());
    }

    #[test]
    fn explicit_device_address_is_kept() {
        let plan = NetworkPlan::new(
            iface("192.168.1.10/24"),
            Some(iface("192.168.1.20")),
            "f",
        )
        .unwrap();
        assert_eq!(plan.device().to_string(), "192.168.1.20/24");
        assert_eq!(plan.boot_file(), "f");
    }
}
