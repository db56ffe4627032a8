//! Configuration record (spec §3) and its loader. The CLI/REST API
//! surfaces that consume a parsed `Config` are out of scope; only the
//! shape of the record and how it is read from disk are specified here.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen_addr: String,
    #[serde(default)]
    pub socks: SocksConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SocksConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApiConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TunnelConfig {
    /// If set, the last SSH hop is asked to reverse-forward this
    /// address back to `Config::listen_addr` (spec §4.8).
    pub listen_addr: Option<String>,
    #[serde(default)]
    pub nodes: Vec<SshNodeConfig>,
    /// Host-key verification is off by default to match the agent's
    /// own certificate-pinning trust model (see DESIGN.md); set this
    /// to require strict verification instead.
    #[serde(default)]
    pub insecure_host_keys: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshNodeConfig {
    pub host: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_parses_a_full_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{
                "listen_addr": "0.0.0.0:8443",
                "socks": {"enable": true, "addr": "127.0.0.1:1080"},
                "tunnel": {
                    "listen_addr": "10.0.0.1:8443",
                    "nodes": [{"host": "jump.example.com:22", "username": "op", "password": "hunter2"}],
                    "insecure_host_keys": true
                },
                "api": {"enable": true, "addr": "127.0.0.1:8080"}
            }"#,
        )
        .await
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8443");
        assert!(config.socks.enable);
        assert_eq!(config.socks.addr, "127.0.0.1:1080");
        assert_eq!(config.tunnel.nodes.len(), 1);
        assert_eq!(config.tunnel.nodes[0].host, "jump.example.com:22");
        assert!(config.tunnel.insecure_host_keys);
        assert!(config.api.enable);
    }

    #[tokio::test]
    async fn load_defaults_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"listen_addr": "0.0.0.0:8443"}"#)
            .await
            .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert!(!config.socks.enable);
        assert!(config.tunnel.nodes.is_empty());
        assert!(!config.api.enable);
    }

    #[tokio::test]
    async fn load_missing_file_is_a_read_error() {
        let err = Config::load("/nonexistent/path/config.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn load_invalid_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, b"not json at all").await.unwrap();

        let err = Config::load(&path).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
