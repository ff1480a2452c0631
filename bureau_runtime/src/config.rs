//! Bridge configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Configuration for a `Bureau` and the sessions it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Interface the session listeners bind on.
    pub host: String,
    /// First port tried when binding a session.
    pub start_port: u16,
    /// Last port tried (inclusive).
    pub max_port: u16,
    /// Bound on each wait for an agent message.
    pub reply_timeout_ms: u64,
    /// Bound on the wait for an agent to connect. `None` waits forever.
    pub ready_timeout_ms: Option<u64>,
    /// Bytes scanned for a string terminator.
    pub strlen_max_scan: u64,
    /// Symbolic bytes tolerated while scanning for a terminator.
    pub strlen_max_symbolic: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            start_port: 5555,
            max_port: 65535,
            reply_timeout_ms: 30_000,
            ready_timeout_ms: None,
            strlen_max_scan: 4096,
            strlen_max_symbolic: 1,
        }
    }
}

impl BridgeConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Override fields from environment variables.
    ///
    /// Recognised variables:
    /// - `BUREAU_HOST`
    /// - `BUREAU_START_PORT`, `BUREAU_MAX_PORT`
    /// - `BUREAU_REPLY_TIMEOUT_MS`, `BUREAU_READY_TIMEOUT_MS`
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(host) = lookup("BUREAU_HOST") {
            self.host = host;
        }
        if let Some(v) = lookup("BUREAU_START_PORT") {
            self.start_port = parse_var("BUREAU_START_PORT", &v)?;
        }
        if let Some(v) = lookup("BUREAU_MAX_PORT") {
            self.max_port = parse_var("BUREAU_MAX_PORT", &v)?;
        }
        if let Some(v) = lookup("BUREAU_REPLY_TIMEOUT_MS") {
            self.reply_timeout_ms = parse_var("BUREAU_REPLY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("BUREAU_READY_TIMEOUT_MS") {
            self.ready_timeout_ms = Some(parse_var("BUREAU_READY_TIMEOUT_MS", &v)?);
        }
        Ok(self)
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port_range(mut self, start_port: u16, max_port: u16) -> Self {
        self.start_port = start_port;
        self.max_port = max_port;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start_port > self.max_port {
            return Err(BridgeError::Config(format!(
                "start_port {} is above max_port {}",
                self.start_port, self.max_port
            )));
        }
        if self.reply_timeout_ms == 0 {
            return Err(BridgeError::Config("reply_timeout_ms must be positive".into()));
        }
        if self.strlen_max_scan == 0 {
            return Err(BridgeError::Config("strlen_max_scan must be positive".into()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BridgeError::Config(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.start_port, 5555);
        assert_eq!(config.max_port, 65535);
        assert_eq!(config.strlen_max_scan, 4096);
        assert_eq!(config.strlen_max_symbolic, 1);
        assert_eq!(config.ready_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"start_port": 6000, "reply_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.start_port, 6000);
        assert_eq!(config.max_port, 65535);
        assert_eq!(config.reply_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_json_field_is_rejected() {
        assert!(serde_json::from_str::<BridgeConfig>(r#"{"port": 1}"#).is_err());
    }

    #[test]
    fn overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("BUREAU_HOST", "0.0.0.0"),
            ("BUREAU_START_PORT", "7000"),
            ("BUREAU_READY_TIMEOUT_MS", "1500"),
        ]
        .into_iter()
        .collect();
        let config = BridgeConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.start_port, 7000);
        assert_eq!(config.ready_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn bad_override_is_config_error() {
        let err = BridgeConfig::default()
            .with_overrides(|k| (k == "BUREAU_MAX_PORT").then(|| "70000".to_string()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn inverted_range_fails_validation() {
        let config = BridgeConfig::default().with_port_range(6000, 5999);
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }
}
