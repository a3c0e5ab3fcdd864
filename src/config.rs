//! Proxy configuration.
//!
//! A running proxy is bound to one `Config` snapshot. It is supplied by
//! whoever embeds the crate (a settings UI, a JSON file, tests) and is never
//! mutated afterwards.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::vless::Identifier;

/// Transport security for the upstream WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// Plain `ws://` unless the port is 443
    #[default]
    None,
    /// Always `wss://`
    Tls,
}

/// Upstream server and local listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User identifier, conventionally rendered as a UUID
    pub identifier: String,

    /// Remote server host
    pub server: String,

    /// Remote server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket request path, may carry a query string
    #[serde(default = "default_path")]
    pub path: String,

    /// TLS server name override (defaults to `server`)
    #[serde(default)]
    pub sni_host: Option<String>,

    /// WebSocket Host header override (defaults to `server`)
    #[serde(default)]
    pub ws_host: Option<String>,

    /// Transport security
    #[serde(default)]
    pub security: Security,

    /// Accept any server certificate
    #[serde(default)]
    pub allow_untrusted_certificate: bool,

    /// Local bind address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Local bind port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Transport handshake timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    443
}

fn default_path() -> String {
    "/".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    1080
}

fn default_connect_timeout() -> u64 {
    crate::HANDSHAKE_TIMEOUT_SECS
}

impl Config {
    /// Create a configuration with defaults for everything but the upstream.
    pub fn new(identifier: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            identifier: identifier.into(),
            server: server.into(),
            port,
            path: default_path(),
            sni_host: None,
            ws_host: None,
            security: Security::default(),
            allow_untrusted_certificate: false,
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    /// Load a JSON configuration file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("invalid config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// TLS server name, falling back to the server host.
    pub fn sni_host(&self) -> &str {
        non_empty(self.sni_host.as_deref()).unwrap_or(&self.server)
    }

    /// WebSocket Host header, falling back to the server host.
    pub fn ws_host(&self) -> &str {
        non_empty(self.ws_host.as_deref()).unwrap_or(&self.server)
    }

    /// Whether the upstream connection is TLS-wrapped.
    pub fn uses_tls(&self) -> bool {
        self.security == Security::Tls || self.port == 443
    }

    /// Transport handshake timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `addr:port` the dispatcher binds to.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::config("server cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port cannot be zero"));
        }
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::config("connect_timeout_secs cannot be zero"));
        }
        self.identifier.parse::<Identifier>()?;
        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn test_config_defaults() {
        let json = format!(r#"{{"identifier": "{}", "server": "edge.example.com"}}"#, ID);
        let config: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config.port, 443);
        assert_eq!(config.path, "/");
        assert_eq!(config.security, Security::None);
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.connect_timeout(), Duration::from_secs(15));
        assert!(config.uses_tls());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_overrides() {
        let mut config = Config::new(ID, "1.2.3.4", 80);
        assert_eq!(config.sni_host(), "1.2.3.4");
        assert_eq!(config.ws_host(), "1.2.3.4");

        config.sni_host = Some("sni.example.com".into());
        config.ws_host = Some(String::new());
        assert_eq!(config.sni_host(), "sni.example.com");
        assert_eq!(config.ws_host(), "1.2.3.4");
        assert!(!config.uses_tls());

        config.security = Security::Tls;
        assert!(config.uses_tls());
    }

    #[test]
    fn test_security_serialization() {
        let json = format!(
            r#"{{"identifier": "{}", "server": "a", "security": "tls", "port": 8443}}"#,
            ID
        );
        let config: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config.security, Security::Tls);
        assert_eq!(config.port, 8443);
    }

    #[test]
    fn test_validation() {
        assert!(Config::new(ID, "", 443).validate().is_err());
        assert!(Config::new(ID, "a", 0).validate().is_err());

        let err = Config::new("not-a-uuid", "a", 443).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));
    }
}
