use serde::{Deserialize, Serialize};
use std::path::Path;
use std::fs;
use anyhow::Result;

use crate::framing::DEFAULT_MAX_FRAME_BYTES;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rectify: RectifyConfig,
    /// Rectification rules, applied in this order.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Largest accepted frame content in bytes (default 16 MiB). Larger frames end the session.
    pub max_frame_bytes: Option<usize>,
    /// Trace-level logging with hex dumps of every frame (same as --verbose).
    pub verbose: Option<bool>,
    /// Optional HTTP listen address for metrics and health (e.g. "127.0.0.1:9090"). Endpoints: GET /metrics (Prometheus), GET /health (liveness), GET /ready (readiness).
    pub metrics_listen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// ldap://host:port, ldap://:port, host:port or :port
    pub url: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            url: ":3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Directory server every session is proxied to. Same forms as the listen URL.
    pub url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: ":4000".to_string(),
        }
    }
}

/// Which directions run frames through the rule table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectifyConfig {
    #[serde(default = "default_true")]
    pub client_to_server: bool,
    #[serde(default)]
    pub server_to_client: bool,
}

impl Default for RectifyConfig {
    fn default() -> Self {
        Self {
            client_to_server: true,
            server_to_client: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// One rectification rule as written in the config file. Byte strings are hex; whitespace and
/// ':' separators are ignored so dumps can be pasted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub label: String,
    pub pattern: String,
    pub replacement: String,
    /// Send the rectified message back to its sender instead of forwarding it.
    #[serde(default)]
    pub reply_to_sender: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            upstream: UpstreamConfig::default(),
            rectify: RectifyConfig::default(),
            rules: vec![],
            max_frame_bytes: None,
            verbose: Some(false),
            metrics_listen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.listen.url, ":3000");
        assert_eq!(config.upstream.url, ":4000");
        assert!(config.rectify.client_to_server);
        assert!(!config.rectify.server_to_client);
        assert!(config.rules.is_empty());
        assert_eq!(config.max_frame_bytes(), DEFAULT_MAX_FRAME_BYTES);
        assert_eq!(config.verbose, Some(false));
    }

    #[test]
    fn test_config_from_str() {
        let yaml = r#"
listen:
  url: "ldap://0.0.0.0:3389"
upstream:
  url: "ldap://ldap1.example.com:389"
rectify:
  client_to_server: true
  server_to_client: true
max_frame_bytes: 65536
verbose: true
metrics_listen: "127.0.0.1:9090"
rules:
  - label: "subschema"
    pattern: "63 33 04 00"
    replacement: "64 26 04 00"
    reply_to_sender: true
  - label: "rename"
    pattern: "6f 75 3d 61"
    replacement: "6f 75 3d 62"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, "ldap://0.0.0.0:3389");
        assert_eq!(config.upstream.url, "ldap://ldap1.example.com:389");
        assert!(config.rectify.server_to_client);
        assert_eq!(config.max_frame_bytes(), 65536);
        assert_eq!(config.verbose, Some(true));
        assert_eq!(config.metrics_listen, Some("127.0.0.1:9090".to_string()));
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].label, "subschema");
        assert!(config.rules[0].reply_to_sender);
        assert_eq!(config.rules[1].label, "rename");
        assert!(!config.rules[1].reply_to_sender);
    }

    #[test]
    fn test_config_from_str_minimal() {
        let yaml = r#"
upstream:
  url: "ldap://localhost:389"
"#;
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.listen.url, ":3000");
        assert_eq!(config.upstream.url, "ldap://localhost:389");
        assert_eq!(config.rectify, RectifyConfig::default());
        assert!(config.rules.is_empty());
        assert_eq!(config.metrics_listen, None);
    }

    #[test]
    fn test_config_rectify_partial() {
        let yaml = r#"
rectify:
  server_to_client: true
"#;
        let config = Config::from_str(yaml).unwrap();
        assert!(config.rectify.client_to_server);
        assert!(config.rectify.server_to_client);
    }

    #[test]
    fn test_config_from_file() {
        let yaml = r#"
listen:
  url: "ldap://127.0.0.1:1389"
upstream:
  url: ":389"
rules:
  - label: "a"
    pattern: "41"
    replacement: "04 01 42"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.listen.url, "ldap://127.0.0.1:1389");
        assert_eq!(config.upstream.url, ":389");
        assert_eq!(config.rules[0].replacement, "04 01 42");
    }

    #[test]
    fn test_config_from_str_invalid_yaml() {
        let yaml = "invalid: yaml: content: [";
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_rule_missing_pattern() {
        let yaml = r#"
rules:
  - label: "broken"
    replacement: "00"
"#;
        assert!(Config::from_str(yaml).is_err());
    }

    #[test]
    fn test_config_from_file_nonexistent() {
        assert!(Config::from_file("/nonexistent/path/config.yaml").is_err());
    }
}
