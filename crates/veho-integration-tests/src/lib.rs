//! Shared helpers for the end-to-end tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use veho_config::Config;
use veho_routing::{Application, HostOptions, Runtime};

/// A per-test scratch directory for queue sockets.
pub fn test_base_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("veho-it-{}-{name}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    dir
}

/// A configuration for host-local scenarios: discovery disabled, one
/// service with a field eventgroup plus a provider-debounced event, static
/// client ids for deterministic request ids.
pub fn local_config() -> Arc<Config> {
    let json = serde_json::json!({
        "applications": [
            { "name": "hello_service", "id": 0x0077 },
            { "name": "hello_client", "id": 0x0010 }
        ],
        "services": [
            {
                "service": 0x1111,
                "instance": 0x2222,
                "major": 1,
                "minor": 0,
                "eventgroups": [
                    { "eventgroup": 1, "events": [ { "event": 0x8001, "is_field": true } ] },
                    {
                        "eventgroup": 2,
                        "events": [
                            {
                                "event": 0x8002,
                                "debounce": { "interval": 150, "on-change": true }
                            }
                        ]
                    }
                ]
            }
        ],
        "routing": "hello_service",
        "service-discovery": { "enable": false, "port": 0 }
    });
    let config: Config = serde_json::from_value(json).expect("test config parses");
    config.validate().expect("test config is valid");
    Arc::new(config)
}

/// A runtime rooted in its own scratch directory.
pub fn test_runtime(test_name: &str, config: Arc<Config>) -> Runtime {
    let options = HostOptions { base_dir: test_base_dir(test_name), ..HostOptions::default() };
    Runtime::with_options(config, options)
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// Wait until the application sees the service as available.
pub async fn wait_available(app: &Application, service: u16, instance: u16) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if app.is_available(service, instance) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
