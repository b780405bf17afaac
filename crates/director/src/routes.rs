//! Route table for resolving per-backend forwarding methods.
//!
//! Backends are matched by longest prefix; a matching route can pin the
//! forwarding method used to reach them (e.g. tunnel to remote subnets,
//! direct route on the local segment).

use common::{Error, Result};
use ipnet::IpNet;
use ipvs::FwdMethod;
use std::net::IpAddr;

use crate::config::RouteConfig;

/// A configured route.
#[derive(Debug, Clone)]
pub struct Route {
    pub prefix: IpNet,
    pub fwd_method: Option<FwdMethod>,
}

/// Read-only route table shared with the projectors.
#[derive(Debug, Clone, Default)]
pub struct Routes {
    routes: Vec<Route>,
}

impl Routes {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    /// Build the table from configuration entries.
    pub fn from_config(entries: &[RouteConfig]) -> Result<Self> {
        let mut routes = Vec::with_capacity(entries.len());
        for entry in entries {
            let prefix: IpNet = entry
                .prefix
                .parse()
                .map_err(|e| Error::config(format!("route prefix {:?}: {e}", entry.prefix)))?;
            let fwd_method = match entry.fwd_method.as_deref() {
                Some(name) => Some(name.parse::<FwdMethod>()?),
                None => None,
            };
            routes.push(Route { prefix, fwd_method });
        }
        Ok(Self::new(routes))
    }

    /// The forwarding method pinned for an address, from the most specific
    /// matching route.
    pub fn fwd_method_for(&self, addr: &IpAddr) -> Option<FwdMethod> {
        self.routes
            .iter()
            .filter(|route| route.prefix.contains(addr))
            .max_by_key(|route| route.prefix.prefix_len())
            .and_then(|route| route.fwd_method)
    }
}
