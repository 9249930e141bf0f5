//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node configuration, loadable from a JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port to bind the endpoint to
    #[serde(default)]
    pub port: Option<u16>,

    /// Master daemon URL
    #[serde(default)]
    pub master_url: Option<String>,

    /// Announced host name, used in handshakes
    #[serde(default)]
    pub host: String,
}

impl NodeConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<NodeConfig> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Overlay CLI arguments over the file configuration
    pub fn merge_cli(mut self, port: Option<u16>, master_url: Option<String>) -> Self {
        if port.is_some() {
            self.port = port;
        }
        if master_url.is_some() {
            self.master_url = master_url;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert!(config.port.is_none());
        assert!(config.master_url.is_none());
    }

    #[test]
    fn test_parse_json() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"port": 9000, "master_url": "ws://m:9000"}"#).unwrap();
        assert_eq!(config.port, Some(9000));
        assert_eq!(config.master_url.as_deref(), Some("ws://m:9000"));
    }

    #[test]
    fn test_merge_cli_overrides() {
        let config = NodeConfig {
            port: Some(1),
            ..Default::default()
        };
        let merged = config.merge_cli(Some(2), Some("ws://x:1".into()));
        assert_eq!(merged.port, Some(2));
        assert_eq!(merged.master_url.as_deref(), Some("ws://x:1"));
    }

    #[test]
    fn test_merge_cli_keeps_file_values() {
        let config = NodeConfig {
            port: Some(1),
            master_url: Some("ws://file:1".into()),
            ..Default::default()
        };
        let merged = config.merge_cli(None, None);
        assert_eq!(merged.port, Some(1));
        assert_eq!(merged.master_url.as_deref(), Some("ws://file:1"));
    }
}
