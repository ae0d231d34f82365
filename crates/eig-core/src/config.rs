//! Gateway configuration loaded from a YAML registry file.
//!
//! # Format
//! ```yaml
//! server:
//!   port: 8008
//!   http_port: 8080
//!   max_clients: 256
//!   read_timeout_ms: 30000
//!   write_timeout_ms: 30000
//!   queue_depth: 1024
//! models:
//!   - id: squeezenet-v1
//!     engine: models/squeezenet-v1.eng
//!     concurrency: 2
//! ```
//!
//! `EIG_PORT` and `EIG_HTTP_PORT` override the file values; CLI flags
//! override both.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Configuration errors surfaced before the server starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level registry: server knobs plus the model table.
#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Listener and per-connection limits.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port for the binary inference protocol.
    pub port: u16,
    /// HTTP port for health and metrics.
    pub http_port: u16,
    /// Maximum simultaneous client connections.
    pub max_clients: usize,
    /// Per-frame read budget in milliseconds.
    pub read_timeout_ms: u64,
    /// Per-response write budget in milliseconds.
    pub write_timeout_ms: u64,
    /// Listen backlog depth.
    pub queue_depth: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8008,
            http_port: 8080,
            max_clients: 256,
            read_timeout_ms: 30_000,
            write_timeout_ms: 30_000,
            queue_depth: 1024,
        }
    }
}

/// One registered model.
#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    /// Registry key; unique across the file.
    pub id: String,
    /// Path to the serialized engine artifact.
    pub engine: PathBuf,
    /// Number of execution contexts to preallocate.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

impl GatewayConfig {
    /// Loads and validates a registry file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Parses and validates a registry from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.id.is_empty() {
                return Err(ConfigError::Invalid("model id must be non-empty".into()));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
            if model.concurrency == 0 {
                return Err(ConfigError::Invalid(format!(
                    "model '{}': concurrency must be >= 1",
                    model.id
                )));
            }
        }
        if self.server.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be >= 1".into()));
        }
        Ok(())
    }

    /// Applies `EIG_PORT` / `EIG_HTTP_PORT` on top of the file values.
    /// Unparsable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_port("EIG_PORT") {
            self.server.port = port;
        }
        if let Some(port) = env_port("EIG_HTTP_PORT") {
            self.server.http_port = port;
        }
    }
}

fn env_port(name: &str) -> Option<u16> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u16>() {
        Ok(port) => Some(port),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable port override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
server:
  port: 9009
  http_port: 9090
  max_clients: 32
  read_timeout_ms: 1000
  write_timeout_ms: 2000
  queue_depth: 64
models:
  - id: resnet
    engine: /models/resnet.eng
    concurrency: 4
  - id: ssd
    engine: /models/ssd.eng
"#;

    #[test]
    fn parses_full_registry() {
        let cfg = GatewayConfig::from_str(FULL).unwrap();
        assert_eq!(cfg.server.port, 9009);
        assert_eq!(cfg.server.http_port, 9090);
        assert_eq!(cfg.server.max_clients, 32);
        assert_eq!(cfg.server.queue_depth, 64);
        assert_eq!(cfg.models.len(), 2);
        assert_eq!(cfg.models[0].concurrency, 4);
        // concurrency defaults to 1 when omitted
        assert_eq!(cfg.models[1].concurrency, 1);
    }

    #[test]
    fn server_section_is_optional() {
        let cfg = GatewayConfig::from_str("models: []").unwrap();
        assert_eq!(cfg.server.port, 8008);
        assert_eq!(cfg.server.http_port, 8080);
        assert_eq!(cfg.server.max_clients, 256);
        assert_eq!(cfg.server.read_timeout_ms, 30_000);
    }

    #[test]
    fn rejects_duplicate_model_ids() {
        let text = r#"
models:
  - id: m
    engine: a.eng
  - id: m
    engine: b.eng
"#;
        let err = GatewayConfig::from_str(text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let text = r#"
models:
  - id: m
    engine: a.eng
    concurrency: 0
"#;
        assert!(GatewayConfig::from_str(text).is_err());
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = GatewayConfig::from_file(Path::new("/nonexistent/models.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn env_overrides_replace_file_ports() {
        let mut cfg = GatewayConfig::from_str(FULL).unwrap();
        // SAFETY: test-local env mutation; no other test reads these vars.
        unsafe {
            std::env::set_var("EIG_PORT", "7007");
            std::env::set_var("EIG_HTTP_PORT", "not-a-port");
        }
        cfg.apply_env_overrides();
        assert_eq!(cfg.server.port, 7007);
        // unparsable override is ignored
        assert_eq!(cfg.server.http_port, 9090);
        unsafe {
            std::env::remove_var("EIG_PORT");
            std::env::remove_var("EIG_HTTP_PORT");
        }
    }
}
