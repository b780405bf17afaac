//! The reconciliation task: desired state plus the single driver loop.
//!
//! All configuration events funnel into one task that owns the driver; the
//! merge table and the netlink socket are never touched from anywhere else.

use std::collections::HashMap;

use common::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::driver::{IpvsDriver, IpvsTransport};
use crate::events::{ConfigEvent, ServerRecord, ServiceRecord};
use crate::frontend::Frontend;

/// Desired state of one logical service.
struct ServiceState {
    record: Option<ServiceRecord>,
    servers: HashMap<String, ServerRecord>,
    frontend: Frontend,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            record: None,
            servers: HashMap::new(),
            frontend: Frontend::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.record.is_none() && self.servers.is_empty()
    }
}

/// Owns the driver and the desired model; applies events serially.
pub struct Director<T> {
    driver: IpvsDriver<T>,
    services: HashMap<String, ServiceState>,
}

impl<T: IpvsTransport> Director<T> {
    pub fn new(driver: IpvsDriver<T>) -> Self {
        Self {
            driver,
            services: HashMap::new(),
        }
    }

    pub fn driver(&self) -> &IpvsDriver<T> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut IpvsDriver<T> {
        &mut self.driver
    }

    /// Flush the kernel and start from an empty projection. The desired
    /// model is kept; projections are rebuilt on the next apply.
    pub fn sync(&mut self) -> Result<()> {
        self.driver.sync()?;
        for state in self.services.values_mut() {
            state.frontend = self.driver.new_frontend();
        }
        Ok(())
    }

    /// Apply one configuration event: record it in the desired model and
    /// reconcile the affected frontend.
    pub fn handle_event(&mut self, event: ConfigEvent) -> Result<()> {
        match event {
            ConfigEvent::ServiceAdded { service, record }
            | ConfigEvent::ServiceChanged { service, record } => {
                info!(service = %service, "service configured");
                self.services
                    .entry(service.clone())
                    .or_insert_with(ServiceState::new)
                    .record = Some(record);
                self.apply(&service)
            }
            ConfigEvent::ServiceRemoved { service } => {
                info!(service = %service, "service removed");
                if let Some(state) = self.services.get_mut(&service) {
                    state.record = None;
                }
                self.apply(&service)
            }
            ConfigEvent::ServerAdded {
                service,
                server,
                record,
            }
            | ConfigEvent::ServerChanged {
                service,
                server,
                record,
            } => {
                info!(service = %service, server = %server, "server configured");
                self.services
                    .entry(service.clone())
                    .or_insert_with(ServiceState::new)
                    .servers
                    .insert(server, record);
                self.apply(&service)
            }
            ConfigEvent::ServerRemoved { service, server } => {
                info!(service = %service, server = %server, "server removed");
                if let Some(state) = self.services.get_mut(&service) {
                    state.servers.remove(&server);
                }
                self.apply(&service)
            }
        }
    }

    /// Reopen the transport, flush the kernel, and replay the desired model.
    pub fn resync(&mut self) -> Result<()> {
        self.driver.reopen()?;
        self.sync()?;
        let names: Vec<String> = self.services.keys().cloned().collect();
        for name in names {
            self.apply(&name)?;
        }
        Ok(())
    }

    /// Run the reconciliation task until the event source closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<ConfigEvent>) {
        info!("director task started");

        while let Some(event) = events.recv().await {
            if let Err(err) = self.handle_event(event) {
                if err.is_fatal() {
                    error!(error = %err, "transport collapsed, resynchronizing");
                    if let Err(err) = self.resync() {
                        error!(error = %err, "resynchronization failed, stopping");
                        return;
                    }
                } else {
                    warn!(error = %err, "event failed, continuing");
                }
            }
        }

        info!("director task stopped");
    }

    fn apply(&mut self, name: &str) -> Result<()> {
        let Some(state) = self.services.get_mut(name) else {
            return Ok(());
        };

        let result = state
            .frontend
            .apply(&mut self.driver, state.record.as_ref(), &state.servers);

        if result.is_ok() && state.is_empty() {
            self.services.remove(name);
        }
        result
    }
}
