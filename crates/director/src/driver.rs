//! IPVS synchronization driver: destination merging and kernel programming.
//!
//! The driver owns the netlink transport, a merge table collapsing
//! overlapping destination contributions onto single kernel entries, and a
//! reference-counted service table. Frontends never talk to the kernel
//! directly; everything funnels through here so the table and the kernel
//! stay in lockstep.

use std::collections::HashMap;
use std::net::IpAddr;

use common::Result;
use ipvs::{Client, DestId, Destination, FwdMethod, Scheduler, Service, ServiceId};
use tracing::{debug, info};

use crate::config::Config;
use crate::routes::Routes;

/// Kernel operations the driver issues.
///
/// [`ipvs::Client`] is the production implementation; tests substitute an
/// in-memory fake that mirrors the kernel table.
pub trait IpvsTransport {
    fn get_info(&mut self) -> Result<ipvs::Info>;
    fn flush(&mut self) -> Result<()>;
    fn new_service(&mut self, service: &Service) -> Result<()>;
    fn set_service(&mut self, service: &Service) -> Result<()>;
    fn del_service(&mut self, service: &Service) -> Result<()>;
    fn new_dest(&mut self, service: &Service, dest: &Destination) -> Result<()>;
    fn set_dest(&mut self, service: &Service, dest: &Destination) -> Result<()>;
    fn del_dest(&mut self, service: &Service, dest: &Destination) -> Result<()>;
    fn list_services(&mut self) -> Result<Vec<Service>>;
    fn list_dests(&mut self, service: &Service) -> Result<Vec<Destination>>;
    /// Replace the transport after a collapse.
    fn reopen(&mut self) -> Result<()>;
}

impl IpvsTransport for Client {
    fn get_info(&mut self) -> Result<ipvs::Info> {
        Client::get_info(self)
    }

    fn flush(&mut self) -> Result<()> {
        Client::flush(self)
    }

    fn new_service(&mut self, service: &Service) -> Result<()> {
        Client::new_service(self, service)
    }

    fn set_service(&mut self, service: &Service) -> Result<()> {
        Client::set_service(self, service)
    }

    fn del_service(&mut self, service: &Service) -> Result<()> {
        Client::del_service(self, service)
    }

    fn new_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        Client::new_dest(self, service, dest)
    }

    fn set_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        Client::set_dest(self, service, dest)
    }

    fn del_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        Client::del_dest(self, service, dest)
    }

    fn list_services(&mut self) -> Result<Vec<Service>> {
        Client::list_services(self)
    }

    fn list_dests(&mut self, service: &Service) -> Result<Vec<Destination>> {
        Client::list_dests(self, service)
    }

    fn reopen(&mut self) -> Result<()> {
        Client::reopen(self)
    }
}

/// Composite merge key: one kernel destination per (service, dest) identity.
type MergeKey = (ServiceId, DestId);

/// Opaque ticket for a merged destination.
///
/// Only valid as input to `adjust`/`down` on the driver that issued it, and
/// only while the underlying table entry is alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestHandle {
    key: MergeKey,
    id: u64,
}

struct MergeEntry {
    id: u64,
    dest: Destination,
}

struct ServiceEntry {
    service: Service,
    refs: usize,
}

/// The IPVS synchronization driver.
pub struct IpvsDriver<T = Client> {
    transport: T,
    routes: Routes,

    // deduplicate overlapping destinations
    dests: HashMap<MergeKey, MergeEntry>,
    // reference-counted kernel services
    services: HashMap<ServiceId, ServiceEntry>,

    // global defaults
    fwd_method: FwdMethod,
    scheduler: Scheduler,

    next_handle: u64,
}

impl IpvsDriver<Client> {
    /// Open the kernel transport and build a driver with the configured
    /// defaults.
    pub fn setup(config: &Config, routes: Routes) -> Result<Self> {
        let fwd_method: FwdMethod = config.fwd_method.parse()?;
        let scheduler = Scheduler::from_name(&config.sched_name);

        let mut client = Client::new()?;
        if config.debug {
            client.set_debug(true);
        }

        let ipvs_info = client.get_info()?;
        info!(
            version = %ipvs_info.version,
            conn_tab_size = ipvs_info.conn_tab_size,
            "connected to IPVS"
        );

        Ok(Self::with_transport(client, routes, fwd_method, scheduler))
    }
}

impl<T: IpvsTransport> IpvsDriver<T> {
    /// Build a driver over an already-open transport.
    pub fn with_transport(
        transport: T,
        routes: Routes,
        fwd_method: FwdMethod,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            transport,
            routes,
            dests: HashMap::new(),
            services: HashMap::new(),
            fwd_method,
            scheduler,
            next_handle: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The scheduler used for services whose record does not name one.
    pub fn default_scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Resolve the forwarding method for a backend: record override, then
    /// route table, then the configured default.
    pub fn resolve_fwd_method(&self, addr: &IpAddr, record: Option<FwdMethod>) -> FwdMethod {
        record
            .or_else(|| self.routes.fwd_method_for(addr))
            .unwrap_or(self.fwd_method)
    }

    /// Begin initial config sync by flushing the kernel state.
    ///
    /// After this the kernel and the merge table both hold nothing, matching
    /// the empty projection the frontends start from.
    pub fn sync(&mut self) -> Result<()> {
        self.transport.flush()?;
        self.services.clear();
        self.dests.clear();
        info!("flushed kernel IPVS state");
        Ok(())
    }

    /// Reopen the transport after a collapse. Kernel state is unknown until
    /// the next `sync`.
    pub fn reopen(&mut self) -> Result<()> {
        self.transport.reopen()
    }

    /// Create a fresh frontend projector bound to this driver.
    pub fn new_frontend(&self) -> crate::frontend::Frontend {
        crate::frontend::Frontend::new()
    }

    /// Take a reference on a service, creating it in the kernel on first
    /// use.
    pub fn up_service(&mut self, service: &Service) -> Result<()> {
        if let Some(entry) = self.services.get_mut(&service.id) {
            entry.refs += 1;
            debug!(service = %service.id, refs = entry.refs, "service reference added");
            return Ok(());
        }

        info!(service = %service.id, scheduler = %service.scheduler, "new service");
        self.transport.new_service(service)?;
        self.services.insert(
            service.id.clone(),
            ServiceEntry {
                service: service.clone(),
                refs: 1,
            },
        );
        Ok(())
    }

    /// Push changed settings for an existing service identity.
    pub(crate) fn reconfigure_service(&mut self, service: &Service) -> Result<()> {
        let Some(entry) = self.services.get_mut(&service.id) else {
            panic!("reconfigure of unknown service {}", service.id);
        };

        info!(service = %service.id, scheduler = %service.scheduler, "reconfiguring service");
        self.transport.set_service(service)?;
        entry.service = service.clone();
        Ok(())
    }

    /// Drop a reference on a service, deleting it from the kernel with the
    /// last one. The kernel removes attached destinations as part of the
    /// deletion; the merge table is purged to match.
    pub fn down_service(&mut self, id: &ServiceId) -> Result<()> {
        let Some(entry) = self.services.get_mut(id) else {
            panic!("release of unknown service {id}");
        };

        if entry.refs > 1 {
            entry.refs -= 1;
            debug!(service = %id, refs = entry.refs, "service reference dropped");
            return Ok(());
        }

        let service = entry.service.clone();
        info!(service = %id, "deleting service");
        self.transport.del_service(&service)?;
        self.clear_service(id);
        self.services.remove(id);
        Ok(())
    }

    /// Bring up a service destination with the given weight, merging onto an
    /// existing kernel entry if one is already present.
    pub fn up(&mut self, service: &Service, mut dest: Destination, weight: u32) -> Result<DestHandle> {
        let key: MergeKey = (service.id.clone(), dest.id());

        match self.dests.get_mut(&key) {
            None => {
                dest.weight = weight;
                debug!(service = %key.0, dest = %key.1, weight, "new destination");

                self.transport.new_dest(service, &dest)?;

                let id = self.next_handle;
                self.next_handle += 1;
                self.dests.insert(key.clone(), MergeEntry { id, dest });

                Ok(DestHandle { key, id })
            }
            Some(entry) => {
                entry.dest.weight += weight;
                debug!(
                    service = %key.0, dest = %key.1,
                    add = weight, total = entry.dest.weight,
                    "merging destination"
                );

                if let Err(err) = self.transport.set_dest(service, &entry.dest) {
                    entry.dest.weight -= weight;
                    return Err(err);
                }

                let id = entry.id;
                Ok(DestHandle { key, id })
            }
        }
    }

    /// Update an existing destination with a weight delta.
    ///
    /// `handle` must be the exact ticket returned by `up` for a live entry,
    /// and the resulting weight must stay positive; anything else is a
    /// projector bug and aborts the process.
    pub fn adjust(&mut self, service: &Service, handle: &DestHandle, delta: i32) -> Result<()> {
        let entry = Self::entry_mut(&mut self.dests, handle);

        let old = entry.dest.weight;
        let new = i64::from(old) + i64::from(delta);
        if new <= 0 {
            panic!(
                "weight adjustment to {new} for destination {} of {}",
                handle.key.1, handle.key.0
            );
        }
        entry.dest.weight = new as u32;
        debug!(
            service = %handle.key.0, dest = %handle.key.1,
            delta, total = entry.dest.weight,
            "adjusting destination"
        );

        if let Err(err) = self.transport.set_dest(service, &entry.dest) {
            entry.dest.weight = old;
            return Err(err);
        }
        Ok(())
    }

    /// Bring down a service destination by the given weight, unmerging or
    /// deleting the kernel entry as the aggregate reaches zero.
    ///
    /// Withdrawing more weight than was contributed is a projector bug and
    /// aborts the process.
    pub fn down(&mut self, service: &Service, handle: &DestHandle, weight: u32) -> Result<()> {
        let entry = Self::entry_mut(&mut self.dests, handle);

        if entry.dest.weight > weight {
            entry.dest.weight -= weight;
            debug!(
                service = %handle.key.0, dest = %handle.key.1,
                sub = weight, total = entry.dest.weight,
                "unmerging destination"
            );

            if let Err(err) = self.transport.set_dest(service, &entry.dest) {
                entry.dest.weight += weight;
                return Err(err);
            }
            Ok(())
        } else if entry.dest.weight < weight {
            panic!(
                "withdrawing weight {weight} exceeds contribution total {} for destination {} of {}",
                entry.dest.weight, handle.key.1, handle.key.0
            );
        } else {
            debug!(service = %handle.key.0, dest = %handle.key.1, "deleting destination");

            self.transport.del_dest(service, &entry.dest)?;
            self.dests.remove(&handle.key);
            Ok(())
        }
    }

    /// Purge the merge table entries of a service being torn down. No kernel
    /// operations are issued; deleting the service drops its destinations.
    pub fn clear_service(&mut self, id: &ServiceId) {
        self.dests.retain(|key, _| key.0 != *id);
    }

    /// The weight currently programmed for a merged destination, if any.
    pub fn merged_weight(&self, service: &ServiceId, dest: &DestId) -> Option<u32> {
        self.dests
            .get(&(service.clone(), dest.clone()))
            .map(|entry| entry.dest.weight)
    }

    /// Dump the kernel table to stdout. Diagnostic only; the merge table is
    /// not consulted.
    pub fn print(&mut self) -> Result<()> {
        let services = self.transport.list_services()?;

        println!("{:<5} {:>30} {}", "Prot", "Addr:Port", "Scheduler");
        for service in services {
            match &service.id {
                ServiceId::Addr {
                    protocol,
                    addr,
                    port,
                    ..
                } => println!(
                    "{:<5} {:>30} {}",
                    protocol.to_string(),
                    format!("{addr}:{port}"),
                    service.scheduler
                ),
                ServiceId::Fwmark { mark, .. } => {
                    println!("{:<5} {:>30} {}", "FWM", format!("#{mark}"), service.scheduler)
                }
            }

            for dest in self.transport.list_dests(&service)? {
                println!(
                    "{:<5} {:>30} {} weight {}",
                    "",
                    format!("{}:{}", dest.addr, dest.port),
                    dest.fwd_method,
                    dest.weight
                );
            }
        }
        Ok(())
    }

    fn entry_mut<'a>(
        dests: &'a mut HashMap<MergeKey, MergeEntry>,
        handle: &DestHandle,
    ) -> &'a mut MergeEntry {
        match dests.get_mut(&handle.key) {
            Some(entry) if entry.id == handle.id => entry,
            Some(entry) => panic!(
                "destination handle {} for {} is stale: entry {} is current",
                handle.id, handle.key.1, entry.id
            ),
            None => panic!(
                "no merged destination for {} of {}",
                handle.key.1, handle.key.0
            ),
        }
    }
}
