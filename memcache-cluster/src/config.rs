//! Tunables consumed by transports, nodes, locators and the dispatcher.
//!
//! Everything has a default so a JSON file only needs the fields it
//! changes:
//!
//! ```json
//! {
//!   "servers": ["10.0.0.1:11211", "10.0.0.2:11211"],
//!   "locator": "ketama",
//!   "replicas": 1,
//!   "node": { "pool_size": 4, "transport": { "queue_length": 64 } }
//! }
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::request::CallbackPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of in-flight requests on one connection.
    pub queue_length: usize,
    /// How long `try_send` waits for a free pending slot. Zero fails immediately.
    pub queue_timeout_ms: u64,
    pub dead_retry_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub shutdown_poll_interval_ms: u64,
    pub shutdown_poll_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue_length: 1000,
            queue_timeout_ms: 0,
            dead_retry_interval_ms: 1000,
            connect_timeout_ms: 1000,
            shutdown_poll_interval_ms: 1000,
            shutdown_poll_attempts: 5,
        }
    }
}

impl TransportConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn dead_retry_interval(&self) -> Duration {
        Duration::from_millis(self.dead_retry_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub pool_size: usize,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    RoundRobin,
    #[default]
    Ketama,
    #[value(name = "vbucket")]
    #[serde(rename = "vbucket")]
    VBucket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub servers: Vec<SocketAddr>,
    pub locator: LocatorKind,
    /// Digest used to place Ketama points; only `md5` is supported.
    pub ketama_hash: String,
    pub replicas: usize,
    pub callback_policy: CallbackPolicy,
    pub send_timeout_ms: u64,
    pub credentials: Option<Credentials>,
    pub node: NodeConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            locator: LocatorKind::default(),
            ketama_hash: "md5".to_string(),
            replicas: 0,
            callback_policy: CallbackPolicy::default(),
            send_timeout_ms: 1000,
            credentials: None,
            node: NodeConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.pool_size == 0 {
            return Err(Error::Config("node.pool_size must be at least 1".into()));
        }
        if self.node.transport.queue_length == 0 {
            return Err(Error::Config("node.transport.queue_length must be at least 1".into()));
        }
        if !self.ketama_hash.eq_ignore_ascii_case("md5") {
            return Err(Error::Config(format!(
                "unsupported ketama hash '{}', expected md5",
                self.ketama_hash
            )));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ClusterConfig::from_json("{}").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert_eq!(config.node.pool_size, 2);
        assert_eq!(config.node.transport.dead_retry_interval(), Duration::from_secs(1));
        assert_eq!(config.locator, LocatorKind::Ketama);
    }

    #[test]
    fn partial_documents_merge_with_defaults() {
        let config = ClusterConfig::from_json(
            r#"{
                "servers": ["127.0.0.1:11211"],
                "locator": "vbucket",
                "replicas": 2,
                "callback_policy": "all_ok",
                "credentials": { "user": "bucket", "password": "pw" },
                "node": { "transport": { "queue_length": 8 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.servers, vec!["127.0.0.1:11211".parse().unwrap()]);
        assert_eq!(config.locator, LocatorKind::VBucket);
        assert_eq!(config.replicas, 2);
        assert_eq!(config.callback_policy, CallbackPolicy::AllOk);
        assert_eq!(config.credentials.unwrap().zone, "");
        assert_eq!(config.node.transport.queue_length, 8);
        assert_eq!(config.node.transport.shutdown_poll_attempts, 5);
        assert_eq!(config.node.pool_size, 2);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ClusterConfig::from_json(r#"{ "node": { "pool_size": 0 } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{ "ketama_hash": "sha1" }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::from_json(r#"{ "locator": "random" }"#),
            Err(Error::Config(_))
        ));
    }
}
