//! In-memory transport double mirroring the kernel IPVS table.
// each test binary uses a different slice of this module
#![allow(dead_code)]

use common::{Error, Result};
use director::IpvsTransport;
use ipvs::{DestId, Destination, Info, Service, ServiceId, Version};
use std::collections::BTreeMap;

pub const ENOENT: i32 = 2;
pub const EEXIST: i32 = 17;

/// One kernel operation, as observed by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    NewService(String),
    SetService(String),
    DelService(String),
    NewDest(String, String, u32),
    SetDest(String, String, u32),
    DelDest(String, String),
    Flush,
}

/// Failure to inject into the next operation.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Kernel(i32),
    Io,
}

pub struct KernelService {
    pub service: Service,
    pub dests: BTreeMap<String, Destination>,
}

/// Fake transport: a kernel table keyed by the canonical identity strings,
/// plus a log of every operation issued.
#[derive(Default)]
pub struct FakeTransport {
    pub services: BTreeMap<String, KernelService>,
    pub ops: Vec<Op>,
    pub fail_next: Option<Failure>,
    pub reopened: usize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(&self, id: &ServiceId) -> Option<&Service> {
        self.services.get(&id.to_string()).map(|s| &s.service)
    }

    pub fn dest_weight(&self, id: &ServiceId, dest: &DestId) -> Option<u32> {
        self.services
            .get(&id.to_string())
            .and_then(|s| s.dests.get(&dest.to_string()))
            .map(|d| d.weight)
    }

    pub fn dest(&self, id: &ServiceId, dest: &DestId) -> Option<&Destination> {
        self.services
            .get(&id.to_string())
            .and_then(|s| s.dests.get(&dest.to_string()))
    }

    pub fn dest_count(&self, id: &ServiceId) -> usize {
        self.services
            .get(&id.to_string())
            .map(|s| s.dests.len())
            .unwrap_or(0)
    }

    /// Service identities and destination weights, for state comparisons.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, u32>> {
        self.services
            .iter()
            .map(|(id, svc)| {
                let dests = svc
                    .dests
                    .iter()
                    .map(|(did, d)| (did.clone(), d.weight))
                    .collect();
                (id.clone(), dests)
            })
            .collect()
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next.take() {
            Some(Failure::Kernel(errno)) => Err(Error::KernelReject { errno }),
            Some(Failure::Io) => Err(Error::Netlink("socket send failed".to_string())),
            None => Ok(()),
        }
    }
}

impl IpvsTransport for FakeTransport {
    fn get_info(&mut self) -> Result<Info> {
        Ok(Info {
            version: Version::from_code((1 << 16) | (2 << 8) | 1),
            conn_tab_size: 4096,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.take_failure()?;
        self.services.clear();
        self.ops.push(Op::Flush);
        Ok(())
    }

    fn new_service(&mut self, service: &Service) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        if self.services.contains_key(&key) {
            return Err(Error::KernelReject { errno: EEXIST });
        }
        self.services.insert(
            key.clone(),
            KernelService {
                service: service.clone(),
                dests: BTreeMap::new(),
            },
        );
        self.ops.push(Op::NewService(key));
        Ok(())
    }

    fn set_service(&mut self, service: &Service) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        let Some(entry) = self.services.get_mut(&key) else {
            return Err(Error::KernelReject { errno: ENOENT });
        };
        entry.service = service.clone();
        self.ops.push(Op::SetService(key));
        Ok(())
    }

    fn del_service(&mut self, service: &Service) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        // deleting a service drops its destinations with it
        if self.services.remove(&key).is_none() {
            return Err(Error::KernelReject { errno: ENOENT });
        }
        self.ops.push(Op::DelService(key));
        Ok(())
    }

    fn new_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        let Some(entry) = self.services.get_mut(&key) else {
            return Err(Error::KernelReject { errno: ENOENT });
        };
        let dest_key = dest.id().to_string();
        if entry.dests.contains_key(&dest_key) {
            return Err(Error::KernelReject { errno: EEXIST });
        }
        entry.dests.insert(dest_key.clone(), dest.clone());
        self.ops.push(Op::NewDest(key, dest_key, dest.weight));
        Ok(())
    }

    fn set_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        let Some(entry) = self.services.get_mut(&key) else {
            return Err(Error::KernelReject { errno: ENOENT });
        };
        let dest_key = dest.id().to_string();
        if !entry.dests.contains_key(&dest_key) {
            return Err(Error::KernelReject { errno: ENOENT });
        }
        entry.dests.insert(dest_key.clone(), dest.clone());
        self.ops.push(Op::SetDest(key, dest_key, dest.weight));
        Ok(())
    }

    fn del_dest(&mut self, service: &Service, dest: &Destination) -> Result<()> {
        self.take_failure()?;
        let key = service.id.to_string();
        let Some(entry) = self.services.get_mut(&key) else {
            return Err(Error::KernelReject { errno: ENOENT });
        };
        let dest_key = dest.id().to_string();
        if entry.dests.remove(&dest_key).is_none() {
            return Err(Error::KernelReject { errno: ENOENT });
        }
        self.ops.push(Op::DelDest(key, dest_key));
        Ok(())
    }

    fn list_services(&mut self) -> Result<Vec<Service>> {
        Ok(self.services.values().map(|s| s.service.clone()).collect())
    }

    fn list_dests(&mut self, service: &Service) -> Result<Vec<Destination>> {
        let Some(entry) = self.services.get(&service.id.to_string()) else {
            return Err(Error::KernelReject { errno: ENOENT });
        };
        Ok(entry.dests.values().cloned().collect())
    }

    fn reopen(&mut self) -> Result<()> {
        self.reopened += 1;
        Ok(())
    }
}
