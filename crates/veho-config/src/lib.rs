//! # veho-config
//!
//! The JSON configuration object consumed by the routing core, endpoint
//! engine and service discovery. The core never authors configuration; it
//! reads one file resolved through `VSOMEIP_CONFIGURATION` (the environment
//! variable names are kept for deployment compatibility with existing
//! SOME/IP installations).
//!
//! Recognized sections: `unicast`, `logging`, `applications`, `services`,
//! `routing`, `service-discovery`, `security`.

mod sections;

pub use sections::{
    ApplicationConfig, DebounceConfig, EventConfig, EventgroupConfig, LoggingConfig,
    ReliableConfig, SdConfig, SecurityConfig, ServiceConfig, UpdateWhitelist,
};

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use veho_types::{ClientId, InstanceId, ServiceId};

/// Environment variable naming the configuration file.
pub const ENV_CONFIGURATION: &str = "VSOMEIP_CONFIGURATION";
/// Environment variable naming the application when none is passed in code.
pub const ENV_APPLICATION_NAME: &str = "VSOMEIP_APPLICATION_NAME";

/// Configuration errors, all rejected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration {path}: {source}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON or misses required fields.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The same client id is statically assigned to two applications.
    #[error("client id {0:#06x} assigned to both \"{1}\" and \"{2}\"")]
    DuplicateClientId(ClientId, String, String),

    /// The same (service, instance) is configured twice.
    #[error("service {0:#06x}.{1:#06x} configured twice")]
    DuplicateService(ServiceId, InstanceId),

    /// The service discovery protocol is not supported.
    #[error("unsupported service discovery protocol \"{0}\"")]
    UnsupportedSdProtocol(String),
}

/// Complete configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Host IP bound for all network endpoints.
    #[serde(default)]
    pub unicast: Option<IpAddr>,
    /// Logging settings, forwarded to the logging collaborator.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static client id allocations.
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
    /// Statically configured services with their eventgroups.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    /// Name of the application that runs as routing host.
    #[serde(default)]
    pub routing: Option<String>,
    /// Service discovery settings.
    #[serde(default, rename = "service-discovery")]
    pub service_discovery: SdConfig,
    /// Security settings consumed by the policy gateway.
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Config {
    /// Load the configuration from an explicit path.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load the configuration from `VSOMEIP_CONFIGURATION`, falling back to
    /// defaults when the variable is unset.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(ENV_CONFIGURATION) {
            Ok(path) => Self::load_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Reject inconsistent configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids: HashMap<ClientId, &str> = HashMap::new();
        for app in &self.applications {
            if let Some(id) = app.id {
                if let Some(previous) = ids.insert(id, app.name.as_str()) {
                    return Err(ConfigError::DuplicateClientId(
                        id,
                        previous.to_string(),
                        app.name.clone(),
                    ));
                }
            }
        }
        let mut services = HashMap::new();
        for service in &self.services {
            if services.insert((service.service, service.instance), ()).is_some() {
                return Err(ConfigError::DuplicateService(service.service, service.instance));
            }
        }
        if self.service_discovery.protocol != "udp" {
            return Err(ConfigError::UnsupportedSdProtocol(
                self.service_discovery.protocol.clone(),
            ));
        }
        Ok(())
    }

    /// Statically assigned client id for an application name, if any.
    pub fn static_client_id(&self, name: &str) -> Option<ClientId> {
        self.applications
            .iter()
            .find(|app| app.name == name)
            .and_then(|app| app.id)
    }

    /// Configured service entry for a (service, instance), if any.
    pub fn find_service(&self, service: ServiceId, instance: InstanceId) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.service == service && s.instance == instance)
    }

    /// True if the named application is the configured routing host.
    pub fn is_routing_host(&self, name: &str) -> bool {
        self.routing.as_deref() == Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "unicast": "192.168.1.9",
        "logging": { "level": "debug", "console": true },
        "applications": [
            { "name": "hello_service", "id": 4660 },
            { "name": "hello_client", "id": 4661 }
        ],
        "services": [
            {
                "service": 4369,
                "instance": 8738,
                "unreliable": 30509,
                "reliable": { "port": 30510, "enable-magic-cookies": true },
                "major": 1,
                "minor": 0,
                "eventgroups": [
                    { "eventgroup": 1, "events": [ { "event": 32769, "is_field": true } ] }
                ]
            }
        ],
        "routing": "hello_service",
        "service-discovery": {
            "enable": true,
            "multicast": "224.244.224.245",
            "port": 30490,
            "protocol": "udp",
            "initial_delay_min": 10,
            "initial_delay_max": 100,
            "repetitions_base_delay": 200,
            "repetitions_max": 3,
            "cyclic_offer_delay": 2000,
            "ttl": 3
        }
    }"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = serde_json::from_str(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.static_client_id("hello_service"), Some(0x1234));
        assert!(config.is_routing_host("hello_service"));
        assert!(!config.is_routing_host("hello_client"));

        let service = config.find_service(0x1111, 0x2222).expect("configured service");
        assert_eq!(service.unreliable, Some(30509));
        let reliable = service.reliable.as_ref().expect("reliable port");
        assert_eq!(reliable.port, 30510);
        assert!(reliable.enable_magic_cookies);
        assert_eq!(service.eventgroups.len(), 1);
        assert!(service.eventgroups[0].events[0].is_field);
    }

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        config.validate().expect("defaults are valid");
        assert!(config.service_discovery.enable);
        assert_eq!(config.service_discovery.port, 30490);
        assert_eq!(config.service_discovery.multicast, "224.244.224.245");
    }

    #[test]
    fn test_duplicate_static_client_id_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "applications": [
                { "name": "a", "id": 10 },
                { "name": "b", "id": 10 }
            ] }"#,
        )
        .expect("parse");
        let err = config.validate().expect_err("duplicate id");
        assert!(matches!(err, ConfigError::DuplicateClientId(10, _, _)));
    }

    #[test]
    fn test_unsupported_sd_protocol_rejected() {
        let config: Config = serde_json::from_str(
            r#"{ "service-discovery": { "protocol": "tcp" } }"#,
        )
        .expect("parse");
        let err = config.validate().expect_err("tcp discovery is not specified");
        assert!(matches!(err, ConfigError::UnsupportedSdProtocol(_)));
    }
}
