//! Process identity attached to every exported signal.
//!
//! # Responsibilities
//! - Service name, version, and deployment environment from config
//! - Extra attributes from `OTEL_RESOURCE_ATTRIBUTES` (read by the SDK builder)
//! - Process, OS, host, and container facts gathered once at startup

use std::fs;

use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;

use crate::config::TelemetryConfig;

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

/// Service identity plus every detector. Explicit identity wins over env.
pub fn service_resource(cfg: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_attributes(detected_attributes())
        .with_service_name(cfg.service_name.clone())
        .with_attributes([
            KeyValue::new(SERVICE_VERSION, cfg.service_version.clone()),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT, cfg.environment.clone()),
        ])
        .build()
}

/// Process, OS, host and container attributes.
pub fn detected_attributes() -> Vec<KeyValue> {
    let exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();

    let mut attributes = vec![
        KeyValue::new("process.pid", i64::from(std::process::id())),
        KeyValue::new("process.executable.name", exe),
        KeyValue::new("process.runtime.name", "rust"),
        KeyValue::new("os.type", std::env::consts::OS),
        KeyValue::new("host.arch", std::env::consts::ARCH),
    ];
    if let Some(name) = hostname() {
        attributes.push(KeyValue::new("host.name", name));
    }
    if let Some(id) = fs::read_to_string("/proc/self/cgroup").ok().and_then(|c| container_id(&c)) {
        attributes.push(KeyValue::new("container.id", id));
    }
    attributes
}

fn hostname() -> Option<String> {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return Some(name);
        }
    }
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Extract a 64-hex-digit container id from cgroup contents.
fn container_id(cgroup: &str) -> Option<String> {
    for line in cgroup.lines() {
        let last = line.rsplit('/').next().unwrap_or_default();
        let candidate = last
            .trim_start_matches("docker-")
            .trim_start_matches("cri-containerd-")
            .trim_end_matches(".scope");
        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(candidate.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::{Key, Value};

    #[test]
    fn test_service_identity_from_config() {
        let cfg = TelemetryConfig {
            service_name: "users-api".into(),
            service_version: "1.0.0".into(),
            environment: "test".into(),
            ..TelemetryConfig::default()
        };
        let resource = service_resource(&cfg);

        assert_eq!(resource.get(&Key::from_static_str(SERVICE_NAME)), Some(Value::from("users-api")));
        assert_eq!(resource.get(&Key::from_static_str(SERVICE_VERSION)), Some(Value::from("1.0.0")));
        assert_eq!(resource.get(&Key::from_static_str(DEPLOYMENT_ENVIRONMENT)), Some(Value::from("test")));
        assert!(resource.get(&Key::from_static_str("process.pid")).is_some());
    }

    #[test]
    fn test_detectors_add_process_and_os() {
        let attributes = detected_attributes();
        assert!(attributes.iter().any(|kv| kv.key.as_str() == "process.pid"));
        assert!(attributes.contains(&KeyValue::new("os.type", std::env::consts::OS)));
    }

    #[test]
    fn test_container_id_from_cgroup() {
        let id = "a".repeat(64);
        let cgroup = format!("0::/system.slice/docker-{}.scope\n", id);
        assert_eq!(container_id(&cgroup), Some(id));
        assert_eq!(container_id("0::/user.slice\n"), None);
    }
}
