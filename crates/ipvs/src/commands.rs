//! IPVS generic netlink commands and attribute identifiers.
//!
//! Values follow include/uapi/linux/ip_vs.h.

/// IPVS generic netlink commands.
///
/// GET_* dumps are answered with the corresponding NEW_* command, and
/// GET_INFO with SET_INFO.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpvsCommand {
    /// Add a virtual service
    NewService = 1,
    /// Modify a virtual service
    SetService = 2,
    /// Delete a virtual service
    DelService = 3,
    /// Dump virtual services
    GetService = 4,
    /// Add a destination to a service
    NewDest = 5,
    /// Modify a destination
    SetDest = 6,
    /// Delete a destination from a service
    DelDest = 7,
    /// Dump destinations of a service
    GetDest = 8,
    /// Reply command for GET_INFO
    SetInfo = 14,
    /// Get IPVS version and connection table size
    GetInfo = 15,
    /// Flush all virtual services
    Flush = 17,
}

impl IpvsCommand {
    pub(crate) fn from_raw(cmd: u8) -> Option<Self> {
        Some(match cmd {
            1 => IpvsCommand::NewService,
            2 => IpvsCommand::SetService,
            3 => IpvsCommand::DelService,
            4 => IpvsCommand::GetService,
            5 => IpvsCommand::NewDest,
            6 => IpvsCommand::SetDest,
            7 => IpvsCommand::DelDest,
            8 => IpvsCommand::GetDest,
            14 => IpvsCommand::SetInfo,
            15 => IpvsCommand::GetInfo,
            17 => IpvsCommand::Flush,
            _ => return None,
        })
    }
}

impl From<IpvsCommand> for u8 {
    fn from(cmd: IpvsCommand) -> u8 {
        cmd as u8
    }
}

/// Top-level attributes of an IPVS message.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpvsCmdAttr {
    /// Service description (nested)
    Service = 1,
    /// Destination description (nested)
    Dest = 2,
}

/// Attributes nested under IPVS_CMD_ATTR_SERVICE.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum IpvsSvcAttr {
    /// Address family (AF_INET or AF_INET6)
    Af = 1,
    /// IP protocol (IPPROTO_TCP or IPPROTO_UDP)
    Protocol = 2,
    /// Virtual address (4 or 16 bytes by family)
    Addr = 3,
    /// Virtual port, big-endian
    Port = 4,
    /// Firewall mark
    Fwmark = 5,
    /// Scheduler name, nul-terminated
    SchedName = 6,
    /// Flags and mask packed as two u32 values
    Flags = 7,
    /// Persistence timeout
    Timeout = 8,
    /// Persistence netmask / prefix length
    Netmask = 9,
    /// Service statistics (nested)
    Stats = 10,
    /// Persistence engine name
    PeName = 11,
    /// 64-bit service statistics (nested)
    Stats64 = 12,
}

/// Attributes nested under IPVS_CMD_ATTR_DEST.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum IpvsDestAttr {
    /// Real server address
    Addr = 1,
    /// Real server port, big-endian
    Port = 2,
    /// Forwarding method (connection flags)
    FwdMethod = 3,
    /// Destination weight
    Weight = 4,
    /// Upper connection threshold
    UThresh = 5,
    /// Lower connection threshold
    LThresh = 6,
    /// Active connection count
    ActiveConns = 7,
    /// Inactive connection count
    InactConns = 8,
    /// Persistent connection count
    PersistConns = 9,
    /// Destination statistics (nested)
    Stats = 10,
    /// Destination address family
    AddrFamily = 11,
}

/// Top-level attributes of a GET_INFO reply.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpvsInfoAttr {
    /// Packed IPVS version
    Version = 1,
    /// Connection hash table size
    ConnTabSize = 2,
}
