//! Operator configuration.
//!
//! An INI file read once at startup, every key falling back to a
//! documented default rather than failing when the file or key is absent.
//! `generate.*` sections belong to a separate manifest-generation tool and
//! are parsed-and-ignored so a config file shared with that tool still
//! loads here.

use std::env;
use std::path::Path;

use ini::Ini;

use crate::error::{Error, Result};

const DEFAULT_CONFIG_PATH: &str = "operator.conf";
const NAMESPACE_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// `[operator]` section of the config file, with every key defaulted.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub name: String,
    pub pending_remove_interval_seconds: f64,
    pub metrics_update_interval_seconds: f64,
    pub metrics_port: u16,
    pub webhook_port: u16,
    pub cert_path: String,
    pub key_path: String,
    pub leader_acquire_interval_seconds: f64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            name: "kuroboros-operator".to_string(),
            pending_remove_interval_seconds: 5.0,
            metrics_update_interval_seconds: 5.0,
            metrics_port: 8080,
            webhook_port: 443,
            cert_path: "/etc/tls/tls.crt".to_string(),
            key_path: "/etc/tls/tls.key".to_string(),
            leader_acquire_interval_seconds: 10.0,
        }
    }
}

impl OperatorConfig {
    /// Reads `KUROBOROS_CONFIG` (default `operator.conf`). A missing file
    /// is not an error: every key simply keeps its default, matching
    /// `configparser`'s `fallback=` behaviour in the original.
    pub fn load() -> Result<Self> {
        let path = env::var("KUROBOROS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        if !path.exists() {
            return Ok(config);
        }
        let ini = Ini::load_from_file(path)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;

        if let Some(section) = ini.section(Some("operator")) {
            if let Some(v) = section.get("name") {
                config.name = v.to_string();
            }
            if let Some(v) = section.get("pending_remove_interval_seconds") {
                config.pending_remove_interval_seconds = parse_f64(v)?;
            }
            if let Some(v) = section.get("metrics_update_interval_seconds") {
                config.metrics_update_interval_seconds = parse_f64(v)?;
            }
            if let Some(v) = section.get("metrics_port") {
                config.metrics_port = parse_u16(v)?;
            }
            if let Some(v) = section.get("webhook_port") {
                config.webhook_port = parse_u16(v)?;
            }
            if let Some(v) = section.get("cert_path") {
                config.cert_path = v.to_string();
            }
            if let Some(v) = section.get("key_path") {
                config.key_path = v.to_string();
            }
            if let Some(v) = section.get("leader_acquire_interval_seconds") {
                config.leader_acquire_interval_seconds = parse_f64(v)?;
            }
        }
        // `generate.*` sections are reserved for the manifest-generation
        // collaborator; intentionally not read here.
        Ok(config)
    }
}

fn parse_f64(v: &str) -> Result<f64> {
    v.parse()
        .map_err(|_| Error::Config(format!("expected a float, got `{v}`")))
}

fn parse_u16(v: &str) -> Result<u16> {
    v.parse()
        .map_err(|_| Error::Config(format!("expected a port number, got `{v}`")))
}

/// The namespace the operator itself runs in, used for its leader-election
/// lease. Falls back to `default` when the service-account namespace file
/// is absent (e.g. running outside a cluster).
pub fn operator_namespace() -> String {
    std::fs::read_to_string(NAMESPACE_FILE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_file_absent() {
        let config = OperatorConfig::load_from(Path::new("/nonexistent/operator.conf")).unwrap();
        assert_eq!(config.name, "kuroboros-operator");
        assert_eq!(config.metrics_port, 8080);
    }

    #[test]
    fn ini_values_override_defaults() {
        let mut file = tempfile();
        writeln!(
            file.1,
            "[operator]\nname = widget-operator\nmetrics_port = 9100\n"
        )
        .unwrap();
        let config = OperatorConfig::load_from(&file.0).unwrap();
        assert_eq!(config.name, "widget-operator");
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.webhook_port, 443);
    }

    #[test]
    fn unknown_generate_sections_are_ignored() {
        let mut file = tempfile();
        writeln!(file.1, "[generate.crd]\nfoo = bar\n[operator]\nname = x\n").unwrap();
        let config = OperatorConfig::load_from(&file.0).unwrap();
        assert_eq!(config.name, "x");
    }

    fn tempfile() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!(
            "kuroboros-test-{}-{}.conf",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
