//! IPVS data types and identity keys.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use common::{Error, Result};

/// Address family of a service and its destinations.
///
/// The family decides the address width on the wire: 4 bytes for `Inet`,
/// 16 bytes for `Inet6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    /// Kernel AF_* value.
    pub const fn raw(self) -> u16 {
        match self {
            AddressFamily::Inet => libc::AF_INET as u16,
            AddressFamily::Inet6 => libc::AF_INET6 as u16,
        }
    }

    pub fn from_raw(af: u16) -> Result<Self> {
        match af as i32 {
            libc::AF_INET => Ok(AddressFamily::Inet),
            libc::AF_INET6 => Ok(AddressFamily::Inet6),
            _ => Err(Error::UnsupportedAf(af)),
        }
    }

    /// The family an address belongs to.
    pub fn from_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    /// Address width on the wire.
    pub const fn addr_len(self) -> usize {
        match self {
            AddressFamily::Inet => 4,
            AddressFamily::Inet6 => 16,
        }
    }

    /// The all-zero address of this family.
    pub const fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "inet"),
            AddressFamily::Inet6 => write!(f, "inet6"),
        }
    }
}

/// L4 protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Kernel IPPROTO_* value.
    pub const fn raw(self) -> u16 {
        match self {
            Protocol::Tcp => libc::IPPROTO_TCP as u16,
            Protocol::Udp => libc::IPPROTO_UDP as u16,
        }
    }

    pub fn from_raw(proto: u16) -> Result<Self> {
        match proto as i32 {
            libc::IPPROTO_TCP => Ok(Protocol::Tcp),
            libc::IPPROTO_UDP => Ok(Protocol::Udp),
            _ => Err(Error::decode(format!("unsupported protocol {proto}"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// IPVS scheduling algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnection,
    WeightedLeastConnection,
    SourceHashing,
    MaglevHashing,
    Other(String),
}

impl Scheduler {
    /// Map a kernel scheduler name onto the known set.
    pub fn from_name(name: &str) -> Self {
        match name {
            "rr" => Scheduler::RoundRobin,
            "wrr" => Scheduler::WeightedRoundRobin,
            "lc" => Scheduler::LeastConnection,
            "wlc" => Scheduler::WeightedLeastConnection,
            "sh" => Scheduler::SourceHashing,
            "mh" => Scheduler::MaglevHashing,
            other => Scheduler::Other(other.to_string()),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::WeightedLeastConnection
    }
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheduler::RoundRobin => write!(f, "rr"),
            Scheduler::WeightedRoundRobin => write!(f, "wrr"),
            Scheduler::LeastConnection => write!(f, "lc"),
            Scheduler::WeightedLeastConnection => write!(f, "wlc"),
            Scheduler::SourceHashing => write!(f, "sh"),
            Scheduler::MaglevHashing => write!(f, "mh"),
            Scheduler::Other(s) => write!(f, "{}", s),
        }
    }
}

/// How packets are delivered to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwdMethod {
    /// NAT (masquerading)
    Masq,
    /// Local node delivery
    Local,
    /// IP-in-IP tunnel
    Tunnel,
    /// Direct routing (L2)
    DirectRoute,
}

impl FwdMethod {
    /// Forwarding bits within a destination's connection flags.
    pub const MASK: u32 = 0x7;

    /// Kernel IP_VS_CONN_F_* value.
    pub const fn raw(self) -> u32 {
        match self {
            FwdMethod::Masq => 0,
            FwdMethod::Local => 1,
            FwdMethod::Tunnel => 2,
            FwdMethod::DirectRoute => 3,
        }
    }

    pub fn from_raw(flags: u32) -> Result<Self> {
        match flags & Self::MASK {
            0 => Ok(FwdMethod::Masq),
            1 => Ok(FwdMethod::Local),
            2 => Ok(FwdMethod::Tunnel),
            3 => Ok(FwdMethod::DirectRoute),
            other => Err(Error::decode(format!("unsupported forwarding method {other}"))),
        }
    }
}

impl FromStr for FwdMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "masq" => Ok(FwdMethod::Masq),
            "local" => Ok(FwdMethod::Local),
            "tunnel" => Ok(FwdMethod::Tunnel),
            "droute" => Ok(FwdMethod::DirectRoute),
            other => Err(Error::config(format!("invalid forwarding method {other:?}"))),
        }
    }
}

impl fmt::Display for FwdMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwdMethod::Masq => write!(f, "masq"),
            FwdMethod::Local => write!(f, "local"),
            FwdMethod::Tunnel => write!(f, "tunnel"),
            FwdMethod::DirectRoute => write!(f, "droute"),
        }
    }
}

/// Service flags together with the mask of bits being set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceFlags {
    pub flags: u32,
    pub mask: u32,
}

impl ServiceFlags {
    pub const PERSISTENT: u32 = 0x1;
    pub const HASHED: u32 = 0x2;
    pub const ONE_PACKET: u32 = 0x4;

    /// Flags that set and unmask the given bits.
    pub const fn new(flags: u32) -> Self {
        ServiceFlags { flags, mask: flags }
    }
}

/// Canonical identity of a virtual service.
///
/// Two spellings of the same identity compare equal: `IpAddr` keeps a single
/// canonical representation, so `::1` and `0:0:0:0:0:0:0:1` produce the same
/// key. The `Display` rendering is the stable string form used in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Addr {
        af: AddressFamily,
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
    },
    Fwmark {
        af: AddressFamily,
        mark: u32,
    },
}

impl ServiceId {
    pub fn af(&self) -> AddressFamily {
        match self {
            ServiceId::Addr { af, .. } | ServiceId::Fwmark { af, .. } => *af,
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        match self {
            ServiceId::Addr { protocol, .. } => Some(*protocol),
            ServiceId::Fwmark { .. } => None,
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Addr {
                af,
                protocol,
                addr,
                port,
            } => write!(f, "{}-{}://{}:{}", af.raw(), protocol.raw(), addr, port),
            ServiceId::Fwmark { af, mark } => write!(f, "{}-fwmark://#{}", af.raw(), mark),
        }
    }
}

/// An IPVS virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: ServiceId,
    pub scheduler: Scheduler,
    pub flags: ServiceFlags,
    /// Persistence timeout in seconds.
    pub timeout: u32,
    /// v4 netmask or v6 prefix length for persistence granularity.
    pub netmask: u32,
}

impl Service {
    pub fn af(&self) -> AddressFamily {
        self.id.af()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Canonical identity of a destination within its parent service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestId {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for DestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// An IPVS destination (real server). The address family is inherited from
/// the parent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: IpAddr,
    pub port: u16,
    pub fwd_method: FwdMethod,
    pub weight: u32,
    pub upper_threshold: u32,
    pub lower_threshold: u32,
}

impl Destination {
    pub fn id(&self) -> DestId {
        DestId {
            addr: self.addr,
            port: self.port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Kernel IPVS version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Decode the packed version the kernel reports.
    pub const fn from_code(code: u32) -> Self {
        Version {
            major: (code >> 16) & 0xff,
            minor: (code >> 8) & 0xff,
            patch: code & 0xff,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Kernel-side IPVS information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Info {
    pub version: Version,
    pub conn_tab_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_id_string_form() {
        let id = ServiceId::Addr {
            af: AddressFamily::Inet,
            protocol: Protocol::Tcp,
            addr: "10.0.0.1".parse().unwrap(),
            port: 80,
        };
        assert_eq!(id.to_string(), "2-6://10.0.0.1:80");

        let id = ServiceId::Fwmark {
            af: AddressFamily::Inet,
            mark: 10,
        };
        assert_eq!(id.to_string(), "2-fwmark://#10");
    }

    #[test]
    fn service_id_canonicalizes_v6_spellings() {
        let a = ServiceId::Addr {
            af: AddressFamily::Inet6,
            protocol: Protocol::Tcp,
            addr: "::1".parse().unwrap(),
            port: 80,
        };
        let b = ServiceId::Addr {
            af: AddressFamily::Inet6,
            protocol: Protocol::Tcp,
            addr: "0:0:0:0:0:0:0:1".parse().unwrap(),
            port: 80,
        };
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "10-6://::1:80");
    }

    #[test]
    fn fwd_method_names_round_trip() {
        for name in ["masq", "local", "tunnel", "droute"] {
            let method: FwdMethod = name.parse().unwrap();
            assert_eq!(method.to_string(), name);
            assert_eq!(FwdMethod::from_raw(method.raw()).unwrap(), method);
        }
        assert!("nat".parse::<FwdMethod>().is_err());
    }

    #[test]
    fn fwd_method_masks_connection_flags() {
        // fwd bits ride inside the full connection flags word
        assert_eq!(FwdMethod::from_raw(0x0100 | 2).unwrap(), FwdMethod::Tunnel);
    }

    #[test]
    fn version_from_code() {
        let version = Version::from_code((1 << 16) | (2 << 8) | 1);
        assert_eq!(version.to_string(), "1.2.1");
    }

    #[test]
    fn address_family_raw_values() {
        assert_eq!(AddressFamily::Inet.raw(), 2);
        assert_eq!(AddressFamily::Inet6.raw(), 10);
        assert!(AddressFamily::from_raw(3).is_err());
    }

    #[test]
    fn scheduler_names() {
        assert_eq!(Scheduler::from_name("wrr"), Scheduler::WeightedRoundRobin);
        assert_eq!(
            Scheduler::from_name("sed"),
            Scheduler::Other("sed".to_string())
        );
        assert_eq!(Scheduler::from_name("sed").to_string(), "sed");
    }
}
