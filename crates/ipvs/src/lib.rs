//! IPVS (IP Virtual Server) kernel table management via netlink.
//!
//! This crate provides a typed interface to Linux IPVS through direct
//! generic netlink syscalls, with no CGo or libnl dependencies.
//!
//! # Example
//!
//! ```no_run
//! use ipvs::Client;
//!
//! # fn main() -> common::Result<()> {
//! let mut client = Client::new()?;
//!
//! let info = client.get_info()?;
//! println!("IPVS version: {}", info.version);
//!
//! for service in client.list_services()? {
//!     println!("service: {}", service);
//!     for dest in client.list_dests(&service)? {
//!         println!("  -> {} weight {}", dest, dest.weight);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod commands;
mod messages;
mod netlink;
mod types;

pub use types::{
    AddressFamily, DestId, Destination, FwdMethod, Info, Protocol, Scheduler, Service,
    ServiceFlags, ServiceId, Version,
};

use commands::IpvsCommand;
use common::{Error, Result};
use messages::{IpvsMessage, IpvsNla};
use netlink::NetlinkSocket;

/// Typed IPVS client over a generic netlink socket.
///
/// Created with [`Client::new`], which resolves the IPVS family ID. All
/// mutating operations wait for the kernel acknowledgment and surface the
/// kernel errno on rejection. The client is not concurrency-safe.
pub struct Client {
    socket: NetlinkSocket,
}

impl Client {
    /// Open the netlink transport.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The netlink socket cannot be created
    /// - The IPVS kernel module is not loaded
    /// - Insufficient permissions (requires CAP_NET_ADMIN)
    pub fn new() -> Result<Self> {
        let socket = NetlinkSocket::new()?;
        Ok(Self { socket })
    }

    /// Replace the underlying socket after a transport failure, preserving
    /// the debug setting.
    pub fn reopen(&mut self) -> Result<()> {
        let debug = self.socket.debug();
        let mut socket = NetlinkSocket::new()?;
        socket.set_debug(debug);
        self.socket = socket;
        Ok(())
    }

    /// Get the IPVS family ID.
    pub fn family_id(&self) -> u16 {
        self.socket.family_id()
    }

    /// Enable or disable transport tracing.
    pub fn set_debug(&mut self, on: bool) {
        self.socket.set_debug(on);
    }

    /// Get the IPVS version and connection table size from the kernel.
    pub fn get_info(&mut self) -> Result<Info> {
        let reply = self.socket.query(IpvsMessage::new(IpvsCommand::GetInfo))?;
        for nla in &reply.nlas {
            if let IpvsNla::Info(info) = nla {
                return Info::from_nlas(info);
            }
        }
        Err(Error::decode("info reply without info attributes"))
    }

    /// Flush all services and destinations from the kernel.
    pub fn flush(&mut self) -> Result<()> {
        self.socket.execute(IpvsMessage::new(IpvsCommand::Flush))
    }

    /// Add a virtual service.
    pub fn new_service(&mut self, service: &Service) -> Result<()> {
        self.service_op(IpvsCommand::NewService, service, true)
    }

    /// Modify a virtual service's settings.
    pub fn set_service(&mut self, service: &Service) -> Result<()> {
        self.service_op(IpvsCommand::SetService, service, true)
    }

    /// Delete a virtual service. Attached destinations are removed by the
    /// kernel as part of the deletion.
    pub fn del_service(&mut self, service: &Service) -> Result<()> {
        self.service_op(IpvsCommand::DelService, service, false)
    }

    /// Add a destination to a service.
    pub fn new_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.dest_op(IpvsCommand::NewDest, service, dest, true)
    }

    /// Modify a destination of a service.
    pub fn set_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.dest_op(IpvsCommand::SetDest, service, dest, true)
    }

    /// Delete a destination from a service.
    pub fn del_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.dest_op(IpvsCommand::DelDest, service, dest, false)
    }

    /// Dump all virtual services.
    pub fn list_services(&mut self) -> Result<Vec<Service>> {
        let replies = self.socket.dump(IpvsMessage::new(IpvsCommand::GetService))?;

        let mut services = Vec::new();
        for reply in replies {
            for nla in &reply.nlas {
                if let IpvsNla::Service(svc) = nla {
                    services.push(Service::from_nlas(svc)?);
                }
            }
        }
        Ok(services)
    }

    /// Dump the destinations of a service.
    pub fn list_dests(&mut self, service: &Service) -> Result<Vec<Destination>> {
        let msg = IpvsMessage::with_nlas(
            IpvsCommand::GetDest,
            vec![IpvsNla::Service(service.to_nlas(false)?)],
        );
        let replies = self.socket.dump(msg)?;

        let mut dests = Vec::new();
        for reply in replies {
            for nla in &reply.nlas {
                if let IpvsNla::Dest(dest) = nla {
                    dests.push(Destination::from_nlas(service.af(), dest)?);
                }
            }
        }
        Ok(dests)
    }

    fn service_op(&mut self, cmd: IpvsCommand, service: &Service, full: bool) -> Result<()> {
        let nlas = vec![IpvsNla::Service(service.to_nlas(full)?)];
        self.socket.execute(IpvsMessage::with_nlas(cmd, nlas))
    }

    fn dest_op(
        &mut self,
        cmd: IpvsCommand,
        service: &Service,
        dest: &Destination,
        full: bool,
    ) -> Result<()> {
        let nlas = vec![
            IpvsNla::Service(service.to_nlas(false)?),
            IpvsNla::Dest(dest.to_nlas(service.af(), full)?),
        ];
        self.socket.execute(IpvsMessage::with_nlas(cmd, nlas))
    }
}
