//! Bridge configuration, loaded from a TOML file.
//!
//! Every section is optional and falls back to its defaults.
//!
//! ```toml
//! [[astm_listen]]
//! port = 12001
//! version = "LIS01_A"
//!
//! [[astm_listen]]
//! port = 12011
//! version = "E1381_95"
//!
//! [http_listen]
//! port = 8442
//!
//! [forward_http]
//! uri = "https://localhost:8443"
//! username = "lab"
//! password = "secret"
//!
//! [forward_astm]
//! host_name = "localhost"
//! port = 12001
//! version = "LIS01_A"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AstmError, Result};
use crate::types::AstmVersion;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// ASTM listeners, one per port and profile.
    #[serde(default = "default_astm_listeners")]
    pub astm_listen: Vec<AstmListenConfig>,

    #[serde(default)]
    pub http_listen: HttpListenConfig,

    /// Where messages received over ASTM are posted.
    #[serde(default)]
    pub forward_http: HttpForwardConfig,

    /// Where messages received over HTTP are sent.
    #[serde(default)]
    pub forward_astm: AstmForwardConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// Loads and validates configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AstmError::config(&path_str, e.to_string()))?;
        let config = Self::parse(&content, &path_str)?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Parses and validates configuration from a string.
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, origin: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AstmError::config(origin, e.to_string()))?;
        config.validate().map_err(|reason| AstmError::config(origin, reason))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        for listener in &self.astm_listen {
            if listener.port == 0 {
                return Err("astm_listen.port must not be 0".into());
            }
        }
        if self.http_listen.port == 0 {
            return Err("http_listen.port must not be 0".into());
        }
        if self.forward_http.uri.trim().is_empty() {
            return Err("forward_http.uri must not be empty".into());
        }
        if self.forward_astm.host_name.trim().is_empty() {
            return Err("forward_astm.host_name must not be empty".into());
        }
        if self.forward_astm.port == 0 {
            return Err("forward_astm.port must not be 0".into());
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AstmError::config("<serialized>", e.to_string()))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            astm_listen: default_astm_listeners(),
            http_listen: HttpListenConfig::default(),
            forward_http: HttpForwardConfig::default(),
            forward_astm: AstmForwardConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_astm_listeners() -> Vec<AstmListenConfig> {
    vec![
        AstmListenConfig {
            port: 12001,
            ..AstmListenConfig::default()
        },
        AstmListenConfig {
            port: 12011,
            version: AstmVersion::E1381_95,
            ..AstmListenConfig::default()
        },
    ]
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstmListenConfig {
    #[serde(default = "default_bind_address")]
    pub address: String,
    #[serde(default = "default_astm_port")]
    pub port: u16,
    #[serde(default)]
    pub version: AstmVersion,
}

fn default_astm_port() -> u16 {
    12001
}

impl AstmListenConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for AstmListenConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: default_astm_port(),
            version: AstmVersion::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpListenConfig {
    #[serde(default = "default_bind_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_port() -> u16 {
    8442
}

impl HttpListenConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for HttpListenConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpForwardConfig {
    #[serde(default = "default_forward_uri")]
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_forward_uri() -> String {
    "https://localhost:8443".to_owned()
}

impl Default for HttpForwardConfig {
    fn default() -> Self {
        Self {
            uri: default_forward_uri(),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AstmForwardConfig {
    #[serde(default = "default_forward_host")]
    pub host_name: String,
    #[serde(default = "default_astm_port")]
    pub port: u16,
    #[serde(default)]
    pub version: AstmVersion,
}

fn default_forward_host() -> String {
    "localhost".to_owned()
}

impl Default for AstmForwardConfig {
    fn default() -> Self {
        Self {
            host_name: default_forward_host(),
            port: default_astm_port(),
            version: AstmVersion::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_owned()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
