//! Frontend projection of declarative services onto the kernel table.
//!
//! One logical frontend can expand to several kernel services: one per
//! (address family, protocol) pair its record speaks for. Every update is
//! diffed against the frontend's own prior projection, and the differences
//! become merger calls on the driver.

use std::collections::HashMap;
use std::net::IpAddr;

use common::Result;
use ipvs::{
    AddressFamily, DestId, Destination, FwdMethod, Protocol, Scheduler, Service, ServiceFlags,
    ServiceId,
};
use tracing::debug;

use crate::driver::{DestHandle, IpvsDriver, IpvsTransport};
use crate::events::{ServerRecord, ServiceRecord};

/// The (address family, protocol) matrix a declarative frontend can project
/// onto.
const PROJECTIONS: [(AddressFamily, Protocol); 4] = [
    (AddressFamily::Inet, Protocol::Tcp),
    (AddressFamily::Inet6, Protocol::Tcp),
    (AddressFamily::Inet, Protocol::Udp),
    (AddressFamily::Inet6, Protocol::Udp),
];

type ProjectionKey = (AddressFamily, Protocol);

/// One logical frontend's projection state.
pub struct Frontend {
    projections: HashMap<ProjectionKey, Projection>,
}

struct Projection {
    service: Service,
    dests: HashMap<DestId, Contribution>,
}

struct Contribution {
    dest: Destination,
    weight: u32,
    handle: DestHandle,
}

impl Frontend {
    pub fn new() -> Self {
        Self {
            projections: HashMap::new(),
        }
    }

    /// Reconcile this frontend against new declarative state.
    ///
    /// Kernel operations are ordered so that a service exists before its
    /// destinations do, and destinations are gone before their service is.
    /// On a transport error the projection keeps whatever was applied, so
    /// the next call re-diffs from reality.
    pub fn apply<T: IpvsTransport>(
        &mut self,
        driver: &mut IpvsDriver<T>,
        record: Option<&ServiceRecord>,
        servers: &HashMap<String, ServerRecord>,
    ) -> Result<()> {
        for key in PROJECTIONS {
            let desired = record.and_then(|r| project_service(r, key, driver));
            self.apply_projection(driver, key, desired, servers)?;
        }
        Ok(())
    }

    /// Withdraw every contribution this frontend has made.
    pub fn withdraw<T: IpvsTransport>(&mut self, driver: &mut IpvsDriver<T>) -> Result<()> {
        let no_servers = HashMap::new();
        for key in PROJECTIONS {
            self.apply_projection(driver, key, None, &no_servers)?;
        }
        Ok(())
    }

    fn apply_projection<T: IpvsTransport>(
        &mut self,
        driver: &mut IpvsDriver<T>,
        key: ProjectionKey,
        desired: Option<Service>,
        servers: &HashMap<String, ServerRecord>,
    ) -> Result<()> {
        match (self.projections.remove(&key), desired) {
            (None, None) => Ok(()),
            (None, Some(service)) => self.bring_up(driver, key, service, servers),
            (Some(prior), None) => self.tear_down(driver, key, prior),
            (Some(prior), Some(service)) if prior.service.id != service.id => {
                debug!(
                    old = %prior.service.id, new = %service.id,
                    "frontend identity changed"
                );
                self.tear_down(driver, key, prior)?;
                self.bring_up(driver, key, service, servers)
            }
            (Some(prior), Some(service)) => self.update(driver, key, prior, service, servers),
        }
    }

    fn bring_up<T: IpvsTransport>(
        &mut self,
        driver: &mut IpvsDriver<T>,
        key: ProjectionKey,
        service: Service,
        servers: &HashMap<String, ServerRecord>,
    ) -> Result<()> {
        driver.up_service(&service)?;

        let mut projection = Projection {
            service,
            dests: HashMap::new(),
        };
        let result = sync_dests(driver, &mut projection, key, servers);
        self.projections.insert(key, projection);
        result
    }

    fn tear_down<T: IpvsTransport>(
        &mut self,
        driver: &mut IpvsDriver<T>,
        key: ProjectionKey,
        mut prior: Projection,
    ) -> Result<()> {
        // destinations go down before their service does
        if let Err(err) = down_dests(driver, &mut prior) {
            self.projections.insert(key, prior);
            return Err(err);
        }

        if let Err(err) = driver.down_service(&prior.service.id) {
            self.projections.insert(key, prior);
            return Err(err);
        }
        Ok(())
    }

    fn update<T: IpvsTransport>(
        &mut self,
        driver: &mut IpvsDriver<T>,
        key: ProjectionKey,
        mut prior: Projection,
        service: Service,
        servers: &HashMap<String, ServerRecord>,
    ) -> Result<()> {
        if prior.service != service {
            if let Err(err) = driver.reconfigure_service(&service) {
                self.projections.insert(key, prior);
                return Err(err);
            }
            prior.service = service;
        }

        let result = sync_dests(driver, &mut prior, key, servers);
        self.projections.insert(key, prior);
        result
    }
}

impl Default for Frontend {
    fn default() -> Self {
        Self::new()
    }
}

/// Project a frontend record onto one (family, protocol) service, if the
/// record speaks for that pair.
fn project_service<T: IpvsTransport>(
    record: &ServiceRecord,
    (af, protocol): ProjectionKey,
    driver: &IpvsDriver<T>,
) -> Option<Service> {
    let addr: IpAddr = match af {
        AddressFamily::Inet => IpAddr::from(record.ipv4?),
        AddressFamily::Inet6 => IpAddr::from(record.ipv6?),
    };
    let port = match protocol {
        Protocol::Tcp => record.tcp?,
        Protocol::Udp => record.udp?,
    };
    if port == 0 {
        return None;
    }

    let scheduler = record
        .sched
        .as_deref()
        .map(Scheduler::from_name)
        .unwrap_or_else(|| driver.default_scheduler().clone());

    let (flags, timeout) = match record.persistence {
        Some(seconds) => (ServiceFlags::new(ServiceFlags::PERSISTENT), seconds),
        None => (ServiceFlags::default(), 0),
    };

    Some(Service {
        id: ServiceId::Addr {
            af,
            protocol,
            addr,
            port,
        },
        scheduler,
        flags,
        timeout,
        netmask: 0,
    })
}

/// Project a server record onto one (family, protocol) destination, if the
/// record speaks for that pair. Servers with weight zero are not projected.
fn project_dest<T: IpvsTransport>(
    server: &ServerRecord,
    (af, protocol): ProjectionKey,
    driver: &IpvsDriver<T>,
) -> Result<Option<Destination>> {
    let addr: IpAddr = match af {
        AddressFamily::Inet => match server.ipv4 {
            Some(v4) => IpAddr::from(v4),
            None => return Ok(None),
        },
        AddressFamily::Inet6 => match server.ipv6 {
            Some(v6) => IpAddr::from(v6),
            None => return Ok(None),
        },
    };
    let port = match protocol {
        Protocol::Tcp => server.tcp,
        Protocol::Udp => server.udp,
    };
    let Some(port) = port.filter(|p| *p > 0) else {
        return Ok(None);
    };

    let weight = server.weight.unwrap_or(1);
    if weight == 0 {
        return Ok(None);
    }

    let record_method = match server.fwd_method.as_deref() {
        Some(name) => Some(name.parse::<FwdMethod>()?),
        None => None,
    };
    let fwd_method = driver.resolve_fwd_method(&addr, record_method);

    Ok(Some(Destination {
        addr,
        port,
        fwd_method,
        weight,
        upper_threshold: server.upper_threshold.unwrap_or(0),
        lower_threshold: server.lower_threshold.unwrap_or(0),
    }))
}

/// Diff a projection's destination set against the desired one and emit the
/// merger calls: new backends up, vanished backends down, changed weights
/// adjusted. Two servers landing on the same destination identity fold their
/// weights into one contribution.
fn sync_dests<T: IpvsTransport>(
    driver: &mut IpvsDriver<T>,
    projection: &mut Projection,
    key: ProjectionKey,
    servers: &HashMap<String, ServerRecord>,
) -> Result<()> {
    let mut desired: HashMap<DestId, Destination> = HashMap::new();
    for server in servers.values() {
        if let Some(dest) = project_dest(server, key, driver)? {
            desired
                .entry(dest.id())
                .and_modify(|d| d.weight += dest.weight)
                .or_insert(dest);
        }
    }

    // new backends
    for (id, dest) in &desired {
        if !projection.dests.contains_key(id) {
            let weight = dest.weight;
            let handle = driver.up(&projection.service, dest.clone(), weight)?;
            projection.dests.insert(
                id.clone(),
                Contribution {
                    dest: dest.clone(),
                    weight,
                    handle,
                },
            );
        }
    }

    // vanished backends
    let gone: Vec<DestId> = projection
        .dests
        .keys()
        .filter(|id| !desired.contains_key(*id))
        .cloned()
        .collect();
    for id in gone {
        let Some(contribution) = projection.dests.remove(&id) else {
            continue;
        };
        if let Err(err) = driver.down(
            &projection.service,
            &contribution.handle,
            contribution.weight,
        ) {
            projection.dests.insert(id, contribution);
            return Err(err);
        }
    }

    // changed backends
    for (id, dest) in &desired {
        let Some(contribution) = projection.dests.get(id) else {
            continue;
        };

        let settings_changed = contribution.dest.fwd_method != dest.fwd_method
            || contribution.dest.upper_threshold != dest.upper_threshold
            || contribution.dest.lower_threshold != dest.lower_threshold;

        if settings_changed {
            // the merger tracks weight only; replace the contribution
            let Some(old) = projection.dests.remove(id) else {
                continue;
            };
            if let Err(err) = driver.down(&projection.service, &old.handle, old.weight) {
                projection.dests.insert(id.clone(), old);
                return Err(err);
            }
            let handle = driver.up(&projection.service, dest.clone(), dest.weight)?;
            projection.dests.insert(
                id.clone(),
                Contribution {
                    dest: dest.clone(),
                    weight: dest.weight,
                    handle,
                },
            );
        } else if contribution.weight != dest.weight {
            let delta = dest.weight as i32 - contribution.weight as i32;
            let handle = contribution.handle.clone();
            driver.adjust(&projection.service, &handle, delta)?;

            let Some(contribution) = projection.dests.get_mut(id) else {
                continue;
            };
            contribution.weight = dest.weight;
            contribution.dest.weight = dest.weight;
        }
    }

    Ok(())
}

/// Down every contribution of a projection, leaving the ones a transport
/// error interrupts.
fn down_dests<T: IpvsTransport>(
    driver: &mut IpvsDriver<T>,
    projection: &mut Projection,
) -> Result<()> {
    let ids: Vec<DestId> = projection.dests.keys().cloned().collect();
    for id in ids {
        let Some(contribution) = projection.dests.remove(&id) else {
            continue;
        };
        if let Err(err) = driver.down(
            &projection.service,
            &contribution.handle,
            contribution.weight,
        ) {
            projection.dests.insert(id, contribution);
            return Err(err);
        }
    }
    Ok(())
}
