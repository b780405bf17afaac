//! Startup configuration for the director.

use common::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enable netlink transport tracing.
    pub debug: bool,

    /// Default forwarding method for destinations whose record and route
    /// leave it open: one of "masq", "tunnel", "droute", "local".
    pub fwd_method: String,

    /// Default scheduler for services whose record omits one.
    pub sched_name: String,

    /// Routes pinning forwarding methods for backend subnets.
    pub routes: Vec<RouteConfig>,
}

/// One configured route.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub fwd_method: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            fwd_method: "masq".to_string(),
            sched_name: "wlc".to_string(),
            routes: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the given file, or defaults when none is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                tracing::info!("loading configuration from {}", path.display());
                Self::load_from_file(path)
            }
            None => {
                tracing::info!("no configuration file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::config(format!("{}: {e}", path.as_ref().display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(!config.debug);
        assert_eq!(config.fwd_method, "masq");
        assert_eq!(config.sched_name, "wlc");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn valid_yaml_parsing() {
        let yaml = r#"
debug: true
fwd_method: droute
sched_name: wrr

routes:
  - prefix: "10.0.0.0/8"
    fwd_method: tunnel
  - prefix: "192.168.0.0/16"
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.debug);
        assert_eq!(config.fwd_method, "droute");
        assert_eq!(config.sched_name, "wrr");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].fwd_method.as_deref(), Some("tunnel"));
        assert_eq!(config.routes[1].fwd_method, None);
    }

    #[test]
    fn minimal_yaml_uses_defaults() {
        let yaml = "debug: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.debug);
        assert_eq!(config.fwd_method, "masq");
        assert_eq!(config.sched_name, "wlc");
    }
}
