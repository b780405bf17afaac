//! Declarative configuration events consumed by the director.
//!
//! The source of these events (a watched key-value store, a file, a test) is
//! outside this crate; only the shapes are fixed here. Records are the JSON
//! payloads the source publishes per service and per server.

use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr};

/// One logical frontend as published by the configuration source.
///
/// The addresses and ports present decide which (family, protocol) kernel
/// services the frontend projects onto.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct ServiceRecord {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub tcp: Option<u16>,
    pub udp: Option<u16>,
    /// Scheduler name; the configured default applies when absent.
    pub sched: Option<String>,
    /// Session persistence timeout in seconds.
    pub persistence: Option<u32>,
}

/// One backend server as published by the configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
pub struct ServerRecord {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub tcp: Option<u16>,
    pub udp: Option<u16>,
    /// Contribution weight; defaults to 1.
    pub weight: Option<u32>,
    /// Forwarding method override; routes and the configured default apply
    /// when absent.
    pub fwd_method: Option<String>,
    pub upper_threshold: Option<u32>,
    pub lower_threshold: Option<u32>,
}

/// Configuration stream events, applied in the order received.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConfigEvent {
    ServiceAdded {
        service: String,
        record: ServiceRecord,
    },
    ServiceChanged {
        service: String,
        record: ServiceRecord,
    },
    ServiceRemoved {
        service: String,
    },
    ServerAdded {
        service: String,
        server: String,
        record: ServerRecord,
    },
    ServerChanged {
        service: String,
        server: String,
        record: ServerRecord,
    },
    ServerRemoved {
        service: String,
        server: String,
    },
}
