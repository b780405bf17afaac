//! IPVS netlink message packing and unpacking.
//!
//! Everything the kernel is willing to reject lives here: attribute layout,
//! address-family-dependent address widths, and byte ordering. The rest of
//! the crate only ever sees [`Service`] and [`Destination`] records.

use crate::commands::{IpvsCmdAttr, IpvsCommand, IpvsDestAttr, IpvsInfoAttr, IpvsSvcAttr};
use crate::types::{
    AddressFamily, Destination, FwdMethod, Info, Protocol, Scheduler, Service, ServiceFlags,
    ServiceId, Version,
};
// the netlink trait impls below need the prelude Result in scope
use common::Error;
use netlink_packet_generic::{GenlFamily, GenlHeader};
use netlink_packet_utils::{
    nla::{Nla, NlaBuffer, NlasIterator},
    parsers::{parse_u16, parse_u32},
    DecodeError, Parseable, ParseableParametrized,
};
use std::convert::TryInto;
use std::net::IpAddr;

// Import Emitable from utils for use in implementations
use netlink_packet_utils::Emitable as UtilsEmitable;

/// IPVS generic netlink message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpvsMessage {
    pub cmd: IpvsCommand,
    pub nlas: Vec<IpvsNla>,
}

impl IpvsMessage {
    pub fn new(cmd: IpvsCommand) -> Self {
        Self {
            cmd,
            nlas: Vec::new(),
        }
    }

    pub fn with_nlas(cmd: IpvsCommand, nlas: Vec<IpvsNla>) -> Self {
        Self { cmd, nlas }
    }
}

/// Top-level IPVS netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpvsNla {
    /// Service description (nested attributes)
    Service(Vec<SvcNla>),
    /// Destination description (nested attributes)
    Dest(Vec<DestNla>),
    /// Info attributes; only ever produced by GET_INFO replies
    Info(Vec<InfoNla>),
    /// Unknown/unsupported attribute
    Other(u16, Vec<u8>),
}

/// Service-level netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvcNla {
    /// Address family, host order
    Af(u16),
    /// IP protocol, host order
    Protocol(u16),
    /// Raw address bytes; width depends on the address family
    Addr(Vec<u8>),
    /// Port in host order; emitted big-endian
    Port(u16),
    /// Firewall mark
    Fwmark(u32),
    /// Scheduler name, nul-terminated on the wire
    SchedName(String),
    /// Flags and mask packed as two u32 values
    Flags(ServiceFlags),
    /// Persistence timeout
    Timeout(u32),
    /// Persistence netmask
    Netmask(u32),
    /// Unknown/unsupported attribute
    Other(u16, Vec<u8>),
}

/// Destination-level netlink attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestNla {
    /// Raw address bytes; width follows the parent service's family
    Addr(Vec<u8>),
    /// Port in host order; emitted big-endian
    Port(u16),
    /// Forwarding method (connection flags)
    FwdMethod(u32),
    /// Weight
    Weight(u32),
    /// Upper connection threshold
    UThresh(u32),
    /// Lower connection threshold
    LThresh(u32),
    /// Unknown/unsupported attribute
    Other(u16, Vec<u8>),
}

/// GET_INFO reply attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoNla {
    /// Packed IPVS version
    Version(u32),
    /// Connection table size
    ConnTabSize(u32),
    /// Unknown/unsupported attribute
    Other(u16, Vec<u8>),
}

fn nested_len<T: Nla>(nlas: &[T]) -> usize {
    nlas.iter().map(|nla| nla.buffer_len()).sum()
}

fn emit_nested<T: Nla>(nlas: &[T], buffer: &mut [u8]) {
    let mut offset = 0;
    for nla in nlas {
        let len = nla.buffer_len();
        nla.emit(&mut buffer[offset..offset + len]);
        offset += len;
    }
}

impl Nla for IpvsNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Service(nlas) => nested_len(nlas),
            Self::Dest(nlas) => nested_len(nlas),
            Self::Info(nlas) => nested_len(nlas),
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Service(_) => IpvsCmdAttr::Service as u16,
            Self::Dest(_) => IpvsCmdAttr::Dest as u16,
            // info attributes only appear at the top level of replies and
            // are never emitted
            Self::Info(_) => 0,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Service(nlas) => emit_nested(nlas, buffer),
            Self::Dest(nlas) => emit_nested(nlas, buffer),
            Self::Info(nlas) => emit_nested(nlas, buffer),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for SvcNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Af(_) => 2,
            Self::Protocol(_) => 2,
            Self::Addr(bytes) => bytes.len(),
            Self::Port(_) => 2,
            Self::Fwmark(_) => 4,
            Self::SchedName(s) => s.len() + 1, // nul-terminated
            Self::Flags(_) => 8,               // flags then mask
            Self::Timeout(_) => 4,
            Self::Netmask(_) => 4,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Af(_) => IpvsSvcAttr::Af as u16,
            Self::Protocol(_) => IpvsSvcAttr::Protocol as u16,
            Self::Addr(_) => IpvsSvcAttr::Addr as u16,
            Self::Port(_) => IpvsSvcAttr::Port as u16,
            Self::Fwmark(_) => IpvsSvcAttr::Fwmark as u16,
            Self::SchedName(_) => IpvsSvcAttr::SchedName as u16,
            Self::Flags(_) => IpvsSvcAttr::Flags as u16,
            Self::Timeout(_) => IpvsSvcAttr::Timeout as u16,
            Self::Netmask(_) => IpvsSvcAttr::Netmask as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Af(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Protocol(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Addr(bytes) => buffer.copy_from_slice(bytes),
            Self::Port(v) => buffer.copy_from_slice(&v.to_be_bytes()),
            Self::Fwmark(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::SchedName(s) => {
                buffer[..s.len()].copy_from_slice(s.as_bytes());
                buffer[s.len()] = 0;
            }
            Self::Flags(f) => {
                buffer[..4].copy_from_slice(&f.flags.to_ne_bytes());
                buffer[4..8].copy_from_slice(&f.mask.to_ne_bytes());
            }
            Self::Timeout(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Netmask(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for DestNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Addr(bytes) => bytes.len(),
            Self::Port(_) => 2,
            Self::FwdMethod(_) => 4,
            Self::Weight(_) => 4,
            Self::UThresh(_) => 4,
            Self::LThresh(_) => 4,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Addr(_) => IpvsDestAttr::Addr as u16,
            Self::Port(_) => IpvsDestAttr::Port as u16,
            Self::FwdMethod(_) => IpvsDestAttr::FwdMethod as u16,
            Self::Weight(_) => IpvsDestAttr::Weight as u16,
            Self::UThresh(_) => IpvsDestAttr::UThresh as u16,
            Self::LThresh(_) => IpvsDestAttr::LThresh as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Addr(bytes) => buffer.copy_from_slice(bytes),
            Self::Port(v) => buffer.copy_from_slice(&v.to_be_bytes()),
            Self::FwdMethod(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Weight(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::UThresh(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::LThresh(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl Nla for InfoNla {
    fn value_len(&self) -> usize {
        match self {
            Self::Version(_) => 4,
            Self::ConnTabSize(_) => 4,
            Self::Other(_, bytes) => bytes.len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Version(_) => IpvsInfoAttr::Version as u16,
            Self::ConnTabSize(_) => IpvsInfoAttr::ConnTabSize as u16,
            Self::Other(kind, _) => *kind,
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Version(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::ConnTabSize(v) => buffer.copy_from_slice(&v.to_ne_bytes()),
            Self::Other(_, bytes) => buffer.copy_from_slice(bytes),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for SvcNla {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            x if x == IpvsSvcAttr::Af as u16 => Self::Af(
                parse_u16(payload).map_err(|_| DecodeError::from("invalid address family"))?,
            ),
            x if x == IpvsSvcAttr::Protocol as u16 => Self::Protocol(
                parse_u16(payload).map_err(|_| DecodeError::from("invalid protocol"))?,
            ),
            x if x == IpvsSvcAttr::Addr as u16 => Self::Addr(payload.to_vec()),
            x if x == IpvsSvcAttr::Port as u16 => Self::Port(u16::from_be_bytes(
                payload
                    .try_into()
                    .map_err(|_| DecodeError::from("invalid port"))?,
            )),
            x if x == IpvsSvcAttr::Fwmark as u16 => Self::Fwmark(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid fwmark"))?,
            ),
            x if x == IpvsSvcAttr::SchedName as u16 => {
                let s = std::str::from_utf8(payload)
                    .map_err(|_| DecodeError::from("invalid scheduler name"))?
                    .trim_end_matches('\0')
                    .to_string();
                Self::SchedName(s)
            }
            x if x == IpvsSvcAttr::Flags as u16 => {
                if payload.len() < 8 {
                    return Err(DecodeError::from("truncated service flags"));
                }
                let flags = parse_u32(&payload[..4])
                    .map_err(|_| DecodeError::from("invalid service flags"))?;
                let mask = parse_u32(&payload[4..8])
                    .map_err(|_| DecodeError::from("invalid service flags mask"))?;
                Self::Flags(ServiceFlags { flags, mask })
            }
            x if x == IpvsSvcAttr::Timeout as u16 => Self::Timeout(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid timeout"))?,
            ),
            x if x == IpvsSvcAttr::Netmask as u16 => Self::Netmask(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid netmask"))?,
            ),
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for DestNla {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            x if x == IpvsDestAttr::Addr as u16 => Self::Addr(payload.to_vec()),
            x if x == IpvsDestAttr::Port as u16 => Self::Port(u16::from_be_bytes(
                payload
                    .try_into()
                    .map_err(|_| DecodeError::from("invalid port"))?,
            )),
            x if x == IpvsDestAttr::FwdMethod as u16 => Self::FwdMethod(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid forwarding method"))?,
            ),
            x if x == IpvsDestAttr::Weight as u16 => Self::Weight(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid weight"))?,
            ),
            x if x == IpvsDestAttr::UThresh as u16 => Self::UThresh(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid upper threshold"))?,
            ),
            x if x == IpvsDestAttr::LThresh as u16 => Self::LThresh(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid lower threshold"))?,
            ),
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>> for InfoNla {
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            x if x == IpvsInfoAttr::Version as u16 => Self::Version(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid version"))?,
            ),
            x if x == IpvsInfoAttr::ConnTabSize as u16 => Self::ConnTabSize(
                parse_u32(payload).map_err(|_| DecodeError::from("invalid conn table size"))?,
            ),
            kind => Self::Other(kind, payload.to_vec()),
        })
    }
}

impl UtilsEmitable for IpvsMessage {
    fn buffer_len(&self) -> usize {
        self.nlas.iter().map(UtilsEmitable::buffer_len).sum()
    }

    fn emit(&self, buffer: &mut [u8]) {
        let mut offset = 0;
        for nla in &self.nlas {
            let len = UtilsEmitable::buffer_len(nla);
            UtilsEmitable::emit(nla, &mut buffer[offset..offset + len]);
            offset += len;
        }
    }
}

impl GenlFamily for IpvsMessage {
    fn family_name() -> &'static str {
        "IPVS"
    }

    fn version(&self) -> u8 {
        1
    }

    fn command(&self) -> u8 {
        self.cmd as u8
    }
}

impl ParseableParametrized<[u8], GenlHeader> for IpvsMessage {
    fn parse_with_param(buf: &[u8], header: GenlHeader) -> Result<Self, DecodeError> {
        let cmd = IpvsCommand::from_raw(header.cmd)
            .ok_or_else(|| DecodeError::from("unknown IPVS command"))?;

        let mut nlas = Vec::new();
        match cmd {
            // info replies carry their attributes at the top level
            IpvsCommand::GetInfo | IpvsCommand::SetInfo => {
                let mut info = Vec::new();
                for nla in NlasIterator::new(buf) {
                    info.push(InfoNla::parse(&nla?)?);
                }
                nlas.push(IpvsNla::Info(info));
            }
            _ => {
                for nla in NlasIterator::new(buf) {
                    let nla = nla?;
                    match nla.kind() {
                        x if x == IpvsCmdAttr::Service as u16 => {
                            let mut svc = Vec::new();
                            for inner in NlasIterator::new(nla.value()) {
                                svc.push(SvcNla::parse(&inner?)?);
                            }
                            nlas.push(IpvsNla::Service(svc));
                        }
                        x if x == IpvsCmdAttr::Dest as u16 => {
                            let mut dest = Vec::new();
                            for inner in NlasIterator::new(nla.value()) {
                                dest.push(DestNla::parse(&inner?)?);
                            }
                            nlas.push(IpvsNla::Dest(dest));
                        }
                        kind => nlas.push(IpvsNla::Other(kind, nla.value().to_vec())),
                    }
                }
            }
        }

        Ok(Self { cmd, nlas })
    }
}

/// Encode an address for the wire: 4 bytes for `Inet`, 16 for `Inet6`.
fn pack_addr(af: AddressFamily, addr: &IpAddr) -> common::Result<Vec<u8>> {
    match (af, addr) {
        (AddressFamily::Inet, IpAddr::V4(v4)) => Ok(v4.octets().to_vec()),
        (AddressFamily::Inet6, IpAddr::V6(v6)) => Ok(v6.octets().to_vec()),
        _ => Err(Error::bad_address(format!(
            "address {addr} does not match family {af}"
        ))),
    }
}

/// Decode an address from the wire.
///
/// The kernel replies with the full 16-byte nf_inet_addr union regardless of
/// family, so a v4 address may arrive padded; the leading 4 bytes carry it.
fn unpack_addr(af: AddressFamily, raw: &[u8]) -> common::Result<IpAddr> {
    match af {
        AddressFamily::Inet if raw.len() >= 4 => {
            let octets: [u8; 4] = raw[..4]
                .try_into()
                .map_err(|_| Error::bad_address("short v4 address"))?;
            Ok(IpAddr::from(octets))
        }
        AddressFamily::Inet6 if raw.len() >= 16 => {
            let octets: [u8; 16] = raw[..16]
                .try_into()
                .map_err(|_| Error::bad_address("short v6 address"))?;
            Ok(IpAddr::from(octets))
        }
        _ => Err(Error::bad_address(format!(
            "{} address bytes for family {af}",
            raw.len()
        ))),
    }
}

impl Service {
    /// Pack this service to netlink attributes.
    ///
    /// With `full` unset only the identifying attributes are emitted, which
    /// is what destination operations and deletions send.
    pub(crate) fn to_nlas(&self, full: bool) -> common::Result<Vec<SvcNla>> {
        let mut nlas = match &self.id {
            ServiceId::Fwmark { af, mark } => {
                if *mark == 0 {
                    return Err(Error::IncompleteIdentity);
                }
                vec![SvcNla::Af(af.raw()), SvcNla::Fwmark(*mark)]
            }
            ServiceId::Addr {
                af,
                protocol,
                addr,
                port,
            } => {
                if *port == 0 {
                    return Err(Error::IncompleteIdentity);
                }
                vec![
                    SvcNla::Af(af.raw()),
                    SvcNla::Protocol(protocol.raw()),
                    SvcNla::Addr(pack_addr(*af, addr)?),
                    SvcNla::Port(*port),
                ]
            }
        };

        if full {
            nlas.push(SvcNla::SchedName(self.scheduler.to_string()));
            nlas.push(SvcNla::Flags(self.flags));
            nlas.push(SvcNla::Timeout(self.timeout));
            nlas.push(SvcNla::Netmask(self.netmask));
        }

        Ok(nlas)
    }

    /// Unpack a service from netlink attributes. Unknown attributes are
    /// skipped; the identity attributes must be present.
    pub(crate) fn from_nlas(nlas: &[SvcNla]) -> common::Result<Service> {
        let mut af = None;
        let mut protocol = None;
        let mut addr_raw: Option<&[u8]> = None;
        let mut port = 0u16;
        let mut fwmark = 0u32;
        let mut scheduler = Scheduler::default();
        let mut flags = ServiceFlags::default();
        let mut timeout = 0u32;
        let mut netmask = 0u32;

        for nla in nlas {
            match nla {
                SvcNla::Af(v) => af = Some(*v),
                SvcNla::Protocol(v) => protocol = Some(*v),
                SvcNla::Addr(bytes) => addr_raw = Some(bytes),
                SvcNla::Port(v) => port = *v,
                SvcNla::Fwmark(v) => fwmark = *v,
                SvcNla::SchedName(s) => scheduler = Scheduler::from_name(s),
                SvcNla::Flags(f) => flags = *f,
                SvcNla::Timeout(v) => timeout = *v,
                SvcNla::Netmask(v) => netmask = *v,
                SvcNla::Other(..) => {}
            }
        }

        let af = AddressFamily::from_raw(
            af.ok_or_else(|| Error::decode("service without address family"))?,
        )?;

        let id = if fwmark > 0 {
            ServiceId::Fwmark { af, mark: fwmark }
        } else {
            let protocol = Protocol::from_raw(
                protocol.ok_or_else(|| Error::decode("service without protocol"))?,
            )?;
            let raw = addr_raw.ok_or_else(|| Error::decode("service without address"))?;
            ServiceId::Addr {
                af,
                protocol,
                addr: unpack_addr(af, raw)?,
                port,
            }
        };

        Ok(Service {
            id,
            scheduler,
            flags,
            timeout,
            netmask,
        })
    }
}

impl Destination {
    /// Pack this destination to netlink attributes. The address family comes
    /// from the parent service.
    pub(crate) fn to_nlas(&self, af: AddressFamily, full: bool) -> common::Result<Vec<DestNla>> {
        let mut nlas = vec![
            DestNla::Addr(pack_addr(af, &self.addr)?),
            DestNla::Port(self.port),
        ];

        if full {
            nlas.push(DestNla::FwdMethod(self.fwd_method.raw()));
            nlas.push(DestNla::Weight(self.weight));
            nlas.push(DestNla::UThresh(self.upper_threshold));
            nlas.push(DestNla::LThresh(self.lower_threshold));
        }

        Ok(nlas)
    }

    /// Unpack a destination from netlink attributes.
    pub(crate) fn from_nlas(af: AddressFamily, nlas: &[DestNla]) -> common::Result<Destination> {
        let mut addr_raw: Option<&[u8]> = None;
        let mut port = 0u16;
        let mut fwd_method = FwdMethod::Masq;
        let mut weight = 0u32;
        let mut upper_threshold = 0u32;
        let mut lower_threshold = 0u32;

        for nla in nlas {
            match nla {
                DestNla::Addr(bytes) => addr_raw = Some(bytes),
                DestNla::Port(v) => port = *v,
                DestNla::FwdMethod(v) => fwd_method = FwdMethod::from_raw(*v)?,
                DestNla::Weight(v) => weight = *v,
                DestNla::UThresh(v) => upper_threshold = *v,
                DestNla::LThresh(v) => lower_threshold = *v,
                DestNla::Other(..) => {}
            }
        }

        let raw = addr_raw.ok_or_else(|| Error::decode("destination without address"))?;

        Ok(Destination {
            addr: unpack_addr(af, raw)?,
            port,
            fwd_method,
            weight,
            upper_threshold,
            lower_threshold,
        })
    }
}

impl Info {
    pub(crate) fn from_nlas(nlas: &[InfoNla]) -> common::Result<Info> {
        let mut version = None;
        let mut conn_tab_size = 0u32;

        for nla in nlas {
            match nla {
                InfoNla::Version(v) => version = Some(Version::from_code(*v)),
                InfoNla::ConnTabSize(v) => conn_tab_size = *v,
                InfoNla::Other(..) => {}
            }
        }

        Ok(Info {
            version: version.ok_or_else(|| Error::decode("info reply without version"))?,
            conn_tab_size,
        })
    }
}
