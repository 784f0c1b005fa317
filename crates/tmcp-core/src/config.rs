//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML table is a valid config.
//!
//! ```toml
//! [resolver]
//! freshness_secs = 300
//!
//! [session]
//! reorder_window = 64
//! handshake_timeout_ms = 10000
//! connect_timeout_ms = 10000
//! outbound_queue_depth = 256
//! max_payload_bytes = 1048576
//! shutdown_grace_ms = 5000
//!
//! [registry]
//! did_publish_url = "https://did.teaspoon.world/add-vid"
//! did_publish_history_url = "https://did.teaspoon.world/add-history/{did}"
//! did_web_format = "did:web:did.teaspoon.world:endpoint:{name}"
//! client_placeholder_address = "tmcpclient://"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub registry: RegistrySettings,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolver.validate()?;
        self.session.validate()?;
        self.registry.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// How long a resolved peer document is served from cache.
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

fn default_freshness_secs() -> u64 {
    300
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness_secs(),
        }
    }
}

impl ResolverConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.freshness_secs == 0 {
            return Err(ConfigError("resolver.freshness_secs must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Out-of-order envelopes buffered before a gap is abandoned.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// Largest plaintext accepted for sealing.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Bound on how long shutdown waits for sessions to close.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_reorder_window() -> usize {
    64
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue_depth() -> usize {
    256
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reorder_window: default_reorder_window(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            outbound_queue_depth: default_outbound_queue_depth(),
            max_payload_bytes: default_max_payload_bytes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reorder_window == 0 {
            return Err(ConfigError("session.reorder_window must be at least 1".into()));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError("session.outbound_queue_depth must be at least 1".into()));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError("session.max_payload_bytes must be at least 1".into()));
        }
        if self.handshake_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError("session timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

/// Where and how DID documents are published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default = "default_did_publish_url")]
    pub did_publish_url: String,

    /// `{did}` is replaced with the published DID.
    #[serde(default = "default_did_publish_history_url")]
    pub did_publish_history_url: String,

    /// `{name}` is replaced with the identity's registry name.
    #[serde(default = "default_did_web_format")]
    pub did_web_format: String,

    /// Address advertised by identities that only dial out.
    #[serde(default = "default_client_placeholder_address")]
    pub client_placeholder_address: String,
}

fn default_did_publish_url() -> String {
    "https://did.teaspoon.world/add-vid".to_string()
}

fn default_did_publish_history_url() -> String {
    "https://did.teaspoon.world/add-history/{did}".to_string()
}

fn default_did_web_format() -> String {
    "did:web:did.teaspoon.world:endpoint:{name}".to_string()
}

fn default_client_placeholder_address() -> String {
    "tmcpclient://".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            did_publish_url: default_did_publish_url(),
            did_publish_history_url: default_did_publish_history_url(),
            did_web_format: default_did_web_format(),
            client_placeholder_address: default_client_placeholder_address(),
        }
    }
}

impl RegistrySettings {
    pub fn did_for_name(&self, name: &str) -> String {
        self.did_web_format.replace("{name}", name)
    }

    pub fn history_url(&self, did: &str) -> String {
        self.did_publish_history_url.replace("{did}", did)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.did_web_format.starts_with("did:") || !self.did_web_format.contains("{name}") {
            return Err(ConfigError(
                "registry.did_web_format must start with \"did:\" and contain {name}".into(),
            ));
        }
        if !self.did_publish_history_url.contains("{did}") {
            return Err(ConfigError(
                "registry.did_publish_history_url must contain {did}".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = BridgeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.resolver.freshness(), Duration::from_secs(300));
        assert_eq!(config.session.reorder_window, 64);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [session]
            reorder_window = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.session.reorder_window, 8);
        assert_eq!(config.session.handshake_timeout_ms, 10_000);
        assert_eq!(config.registry, RegistrySettings::default());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = BridgeConfig::default();
        config.session.reorder_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_did_format() {
        let settings = RegistrySettings::default();
        assert_eq!(
            settings.did_for_name("demo-server"),
            "did:web:did.teaspoon.world:endpoint:demo-server"
        );
        assert_eq!(
            settings.history_url("did:web:x"),
            "https://did.teaspoon.world/add-history/did:web:x"
        );
    }
}
