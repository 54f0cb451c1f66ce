//! Controller configuration
//!
//! Loaded from YAML or JSON (comments allowed) at `~/.glbc/config.yaml` unless
//! a path is given. Every field has a default so an empty file is valid for
//! `--fake-cloud` runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryConfig;

pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com";
pub const DEFAULT_ACCESS_TOKEN_ENV: &str = "GCE_ACCESS_TOKEN";
pub const DEFAULT_STATUS_ADDR: &str = "127.0.0.1:8086";
pub const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

/// Default config file location: ~/.glbc/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".glbc")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Provider project owning every resource
    pub project: String,
    /// Zone of the cluster's instance group
    pub zone: String,
    /// Suffix appended to every resource name; empty for none
    pub cluster_name: String,
    /// Cluster-wide default backend port for ingresses without one
    pub default_backend_port: Option<u16>,
    pub health_check_path: String,
    pub compute_endpoint: String,
    /// Environment variable holding a bearer token for the compute API
    pub access_token_env: String,
    /// Bound on a single provider call
    pub call_timeout_secs: u64,
    /// Bound on a whole sync cycle
    pub cycle_deadline_secs: u64,
    pub resync_interval_secs: u64,
    /// Address of the diagnostics server
    pub status_addr: String,
    pub retry: RetrySettings,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: String::new(),
            cluster_name: String::new(),
            default_backend_port: None,
            health_check_path: DEFAULT_HEALTH_CHECK_PATH.to_string(),
            compute_endpoint: DEFAULT_COMPUTE_ENDPOINT.to_string(),
            access_token_env: DEFAULT_ACCESS_TOKEN_ENV.to_string(),
            call_timeout_secs: 30,
            cycle_deadline_secs: 600,
            resync_interval_secs: 30,
            status_addr: DEFAULT_STATUS_ADDR.to_string(),
            retry: RetrySettings::default(),
        }
    }
}

/// Backoff for failed sync cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 0 retries until the next resync tick
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: s.max_attempts,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_multiplier: s.backoff_multiplier,
        }
    }
}

impl ControllerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from(&self.retry)
    }

    /// Check the config; `real_cloud` additionally requires a project and zone.
    pub fn validate(&self, real_cloud: bool) -> Result<(), ConfigError> {
        if real_cloud && self.project.is_empty() {
            return Err(ConfigError::Invalid("project must be set".into()));
        }
        if real_cloud && self.zone.is_empty() {
            return Err(ConfigError::Invalid("zone must be set".into()));
        }
        if self.cluster_name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "cluster_name '{}' must not contain '/'",
                self.cluster_name
            )));
        }
        if self.call_timeout_secs == 0 || self.cycle_deadline_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.resync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "resync_interval_secs must be non-zero".into(),
            ));
        }
        if !self.health_check_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "health_check_path '{}' must start with '/'",
                self.health_check_path
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Pure parsing
// ============================================================================

/// Strip `//` and `/* */` comments outside of string literals.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }
        if c == '\\' && in_string {
            result.push(c);
            escape_next = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            result.push(c);
            continue;
        }
        if !in_string && c == '/' {
            match chars.peek() {
                Some('/') => {
                    for nc in chars.by_ref() {
                        if nc == '\n' {
                            result.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for nc in chars.by_ref() {
                        if prev == '*' && nc == '/' {
                            break;
                        }
                        prev = nc;
                    }
                    continue;
                }
                _ => {}
            }
        }
        result.push(c);
    }

    result
}

/// Parse a document as JSON (comments allowed) when `path` ends in `.json` or
/// `.jsonc`, YAML otherwise.
pub fn parse_document<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T, String> {
    let is_json = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("json") | Some("jsonc")
    );
    if is_json {
        serde_json::from_str(&strip_jsonc_comments(content)).map_err(|e| e.to_string())
    } else if content.trim().is_empty() {
        serde_yaml::from_str("{}").map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

/// Load a config file, expanding `~` in the path.
pub fn load_config_file(path: &str) -> Result<ControllerConfig, ConfigError> {
    let expanded = shellexpand::tilde(path);
    let path = Path::new(expanded.as_ref());
    let content = std::fs::read_to_string(path)?;
    parse_document(path, &content).map_err(ConfigError::ParseError)
}

/// Load the given config file, or the default one if it exists, or defaults.
pub fn load_or_default(path: Option<&str>) -> Result<ControllerConfig, ConfigError> {
    match path {
        Some(p) => load_config_file(p),
        None => {
            let default = default_config_path();
            if default.exists() {
                load_config_file(&default.to_string_lossy())
            } else {
                Ok(ControllerConfig::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn temp_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = temp_file(
            ".yaml",
            r#"
project: my-project
zone: us-central1-b
cluster_name: uid1
default_backend_port: 30001
retry:
  max_attempts: 2
"#,
        );
        let cfg = load_config_file(&file.path().to_string_lossy()).unwrap();
        assert_eq!(cfg.project, "my-project");
        assert_eq!(cfg.default_backend_port, Some(30001));
        assert_eq!(cfg.retry.max_attempts, 2);
        // untouched fields keep their defaults
        assert_eq!(cfg.retry.initial_delay_ms, 500);
        assert_eq!(cfg.health_check_path, "/");
        assert!(cfg.validate(true).is_ok());
    }

    #[test]
    fn test_load_jsonc_config() {
        let file = temp_file(
            ".json",
            r#"{
                // comment
                "zone": "europe-west1-d", /* inline */
                "compute_endpoint": "http://localhost:9000"
            }"#,
        );
        let cfg = load_config_file(&file.path().to_string_lossy()).unwrap();
        assert_eq!(cfg.zone, "europe-west1-d");
        assert_eq!(cfg.compute_endpoint, "http://localhost:9000");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let file = temp_file(".yaml", "");
        let cfg = load_config_file(&file.path().to_string_lossy()).unwrap();
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = load_config_file("/nonexistent/glbc.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_validation() {
        let cfg = ControllerConfig::default();
        assert!(cfg.validate(false).is_ok());
        assert!(matches!(cfg.validate(true), Err(ConfigError::Invalid(_))));

        let cfg = ControllerConfig {
            cluster_name: "a/b".into(),
            ..Default::default()
        };
        assert!(cfg.validate(false).is_err());

        let cfg = ControllerConfig {
            call_timeout_secs: 0,
            ..Default::default()
        };
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn test_strip_jsonc_keeps_strings() {
        let input = r#"{"url": "http://x//y", /* c */ "a": 1 // tail
}"#;
        let stripped = strip_jsonc_comments(input);
        assert!(stripped.contains("http://x//y"));
        assert!(!stripped.contains("tail"));
        let v: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_retry_settings_conversion() {
        let retry = RetryConfig::from(&RetrySettings::default());
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
    }
}
