//! Control plane of the cluster load balancer.
//!
//! Translates a declarative model of frontends and their backend servers
//! into the kernel's IPVS configuration and keeps the two in sync as the
//! model changes. Destinations referenced by several frontends are merged
//! onto single kernel entries with summed weights.

pub mod config;
pub mod director;
pub mod driver;
pub mod events;
pub mod frontend;
pub mod routes;

pub use config::Config;
pub use director::Director;
pub use driver::{DestHandle, IpvsDriver, IpvsTransport};
pub use events::{ConfigEvent, ServerRecord, ServiceRecord};
pub use frontend::Frontend;
pub use routes::{Route, Routes};
