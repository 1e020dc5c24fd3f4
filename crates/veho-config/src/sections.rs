//! Section structures of the configuration object.

use serde::{Deserialize, Serialize};

use veho_types::{
    ClientId, EventId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId,
    DEFAULT_MAJOR, DEFAULT_MINOR,
};

/// `logging` section. The core forwards these to the logging collaborator;
/// only `level` has an effect inside the core (subscriber filter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log to the console.
    #[serde(default = "default_true")]
    pub console: bool,
    /// Log file path, if file logging is wanted.
    #[serde(default)]
    pub file: Option<String>,
    /// Forward to DLT.
    #[serde(default)]
    pub dlt: bool,
    /// Level: "trace" | "debug" | "info" | "warning" | "error" | "fatal".
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// One `applications` entry: a static client id allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// Statically assigned client id. Dynamic allocation when absent.
    #[serde(default)]
    pub id: Option<ClientId>,
}

/// Reliable (stream) port settings of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliableConfig {
    /// TCP port the service listens on.
    pub port: u16,
    /// Prepend a magic cookie to each send batch for resynchronization.
    #[serde(default, rename = "enable-magic-cookies")]
    pub enable_magic_cookies: bool,
}

/// One `services` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service id.
    pub service: ServiceId,
    /// Instance id.
    pub instance: InstanceId,
    /// Stream port settings, if the service is reachable reliably.
    #[serde(default)]
    pub reliable: Option<ReliableConfig>,
    /// Datagram port, if the service is reachable unreliably.
    #[serde(default)]
    pub unreliable: Option<u16>,
    /// Interface major version.
    #[serde(default = "default_major")]
    pub major: MajorVersion,
    /// Interface minor version.
    #[serde(default = "default_minor")]
    pub minor: MinorVersion,
    /// Eventgroups provided by the service.
    #[serde(default)]
    pub eventgroups: Vec<EventgroupConfig>,
}

/// One eventgroup of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventgroupConfig {
    /// Eventgroup id.
    pub eventgroup: EventgroupId,
    /// Events contained in the group.
    #[serde(default)]
    pub events: Vec<EventConfig>,
}

/// One event within an eventgroup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Event id (top bit set).
    pub event: EventId,
    /// Field semantics: cache the last value, replay on subscribe.
    #[serde(default)]
    pub is_field: bool,
    /// Prefer the reliable transport for notifications.
    #[serde(default)]
    pub is_reliable: bool,
    /// Cyclic emission period in milliseconds (0 = none).
    #[serde(default)]
    pub cycle: u64,
    /// Provider-side debounce applied to every subscriber of this event.
    #[serde(default)]
    pub debounce: Option<DebounceConfig>,
}

/// Debounce settings of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Minimum gap between deliveries in milliseconds; -1 disables
    /// delivery entirely.
    #[serde(default)]
    pub interval: i64,
    /// Deliver only when the value changed.
    #[serde(default, rename = "on-change")]
    pub on_change: bool,
}

/// `service-discovery` section with the SOME/IP-SD timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdConfig {
    /// Service discovery on/off.
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Multicast group for SD traffic.
    #[serde(default = "default_sd_multicast")]
    pub multicast: String,
    /// SD port.
    #[serde(default = "default_sd_port")]
    pub port: u16,
    /// SD transport; only "udp" is specified.
    #[serde(default = "default_sd_protocol")]
    pub protocol: String,
    /// Lower bound of the initial offer/find delay (ms).
    #[serde(default = "default_initial_delay_min")]
    pub initial_delay_min: u64,
    /// Upper bound of the initial offer/find delay (ms).
    #[serde(default = "default_initial_delay_max")]
    pub initial_delay_max: u64,
    /// Base delay of the repetition phase (ms), doubled per run.
    #[serde(default = "default_repetitions_base_delay", rename = "repetitions_base_delay")]
    pub repetition_base_delay: u64,
    /// Number of repetition-phase runs.
    #[serde(default = "default_repetitions_max", rename = "repetitions_max")]
    pub repetition_max: u8,
    /// Period of the cyclic announce phase (ms).
    #[serde(default = "default_cyclic_offer_delay")]
    pub cyclic_offer_delay: u64,
    /// TTL announced in offer/subscribe entries (seconds).
    #[serde(default = "default_sd_ttl")]
    pub ttl: u32,
    /// Lower bound of the delay before answering a multicast FIND (ms).
    #[serde(default)]
    pub request_response_delay_min: u64,
    /// Upper bound of the delay before answering a multicast FIND (ms).
    #[serde(default = "default_request_response_delay_max")]
    pub request_response_delay_max: u64,
}

/// `security` section consumed by the policy gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Policy enforcement on/off.
    #[serde(default)]
    pub enable: bool,
    /// Check peer credentials on the local socket.
    #[serde(default)]
    pub check_credentials: bool,
    /// Policy entries, opaque to the core (interpreted by the gateway).
    #[serde(default)]
    pub policies: Vec<serde_json::Value>,
    /// Whitelist constraining who may update policies at runtime.
    #[serde(default, rename = "security-update-whitelist")]
    pub update_whitelist: UpdateWhitelist,
}

/// `security-update-whitelist` subsection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateWhitelist {
    /// Uids allowed to push policy updates.
    #[serde(default)]
    pub uids: Vec<u32>,
    /// Services allowed in pushed policies.
    #[serde(default)]
    pub services: Vec<ServiceId>,
    /// Enforce the whitelist.
    #[serde(default, rename = "check-whitelist")]
    pub check_whitelist: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console: true,
            file: None,
            dlt: false,
            level: default_log_level(),
        }
    }
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            enable: true,
            multicast: default_sd_multicast(),
            port: default_sd_port(),
            protocol: default_sd_protocol(),
            initial_delay_min: default_initial_delay_min(),
            initial_delay_max: default_initial_delay_max(),
            repetition_base_delay: default_repetitions_base_delay(),
            repetition_max: default_repetitions_max(),
            cyclic_offer_delay: default_cyclic_offer_delay(),
            ttl: default_sd_ttl(),
            request_response_delay_min: 0,
            request_response_delay_max: default_request_response_delay_max(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_major() -> MajorVersion {
    DEFAULT_MAJOR
}

fn default_minor() -> MinorVersion {
    DEFAULT_MINOR
}

fn default_sd_multicast() -> String {
    veho_types::SD_DEFAULT_MULTICAST.to_string()
}

fn default_sd_port() -> u16 {
    veho_types::SD_DEFAULT_PORT
}

fn default_sd_protocol() -> String {
    "udp".to_string()
}

fn default_initial_delay_min() -> u64 {
    0
}

fn default_initial_delay_max() -> u64 {
    3000
}

fn default_repetitions_base_delay() -> u64 {
    10
}

fn default_repetitions_max() -> u8 {
    3
}

fn default_cyclic_offer_delay() -> u64 {
    1000
}

fn default_sd_ttl() -> u32 {
    0xFFFFFF
}

fn default_request_response_delay_max() -> u64 {
    1500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sd_defaults() {
        let sd = SdConfig::default();
        assert!(sd.enable);
        assert_eq!(sd.protocol, "udp");
        assert_eq!(sd.initial_delay_max, 3000);
        assert_eq!(sd.repetition_max, 3);
        assert_eq!(sd.cyclic_offer_delay, 1000);
        assert_eq!(sd.ttl, 0xFFFFFF);
    }

    #[test]
    fn test_event_defaults() {
        let event: EventConfig = serde_json::from_str(r#"{ "event": 32769 }"#).expect("parse");
        assert!(!event.is_field);
        assert!(!event.is_reliable);
        assert_eq!(event.cycle, 0);
        assert!(event.debounce.is_none());
    }

    #[test]
    fn test_event_debounce_section() {
        let event: EventConfig = serde_json::from_str(
            r#"{ "event": 32770, "debounce": { "interval": 150, "on-change": true } }"#,
        )
        .expect("parse");
        let debounce = event.debounce.expect("debounce configured");
        assert_eq!(debounce.interval, 150);
        assert!(debounce.on_change);
    }

    #[test]
    fn test_whitelist_section() {
        let sec: SecurityConfig = serde_json::from_str(
            r#"{
                "enable": true,
                "check_credentials": true,
                "security-update-whitelist": {
                    "uids": [ 1000 ],
                    "services": [ 4369 ],
                    "check-whitelist": true
                }
            }"#,
        )
        .expect("parse");
        assert!(sec.enable);
        assert!(sec.update_whitelist.check_whitelist);
        assert_eq!(sec.update_whitelist.uids, vec![1000]);
        assert_eq!(sec.update_whitelist.services, vec![0x1111]);
    }
}
