//! 文件配置
//!
//! TOML 配置转换为一层 [`OptionSet`]，可以像用户选项一样参与合并。
//!
//! ```toml
//! [service]
//! name = "greeter"
//! version = "1.0.0"
//! address = "0.0.0.0:9090"
//!
//! [service.metadata]
//! zone = "cn-east"
//!
//! [registry]
//! ttl_secs = 60
//! interval_secs = 30
//!
//! [tls]
//! ca = "certs/ca.pem"
//! cert = "certs/server.pem"
//! key = "certs/server.key"
//! verification = "mutual"
//!
//! [runtime]
//! handle_signal = true
//! shutdown_timeout_ms = 5000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, RuntimeError};
use crate::runtime::{OptionSet, options};
use crate::transport::{PeerVerification, SecurityContextBuilder};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub runtime: Option<RuntimeSection>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub name: Option<String>,
    pub version: Option<String>,
    pub address: Option<SocketAddr>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegistryConfig {
    pub ttl_secs: Option<u64>,
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub verification: PeerVerification,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeSection {
    pub handle_signal: Option<bool>,
    pub shutdown_timeout_ms: Option<u64>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RuntimeError::config(format!("invalid config: {}", e)))
    }

    /// 转换为选项层；只输出文件中出现的键
    pub fn into_options(self) -> Result<OptionSet> {
        let mut set = OptionSet::new();

        let service = self.service;
        if let Some(name) = service.name {
            set.push(options::name(name));
        }
        if let Some(version) = service.version {
            set.push(options::version(version));
        }
        if let Some(address) = service.address {
            set.push(options::address(address));
        }
        if !service.metadata.is_empty() {
            set.push(options::metadata(service.metadata));
        }

        if let Some(registry) = self.registry {
            if let Some(ttl) = registry.ttl_secs {
                set.push(options::register_ttl(Duration::from_secs(ttl)));
            }
            if let Some(interval) = registry.interval_secs {
                set.push(options::register_interval(Duration::from_secs(interval)));
            }
        }

        if let Some(tls) = self.tls {
            let mut builder = SecurityContextBuilder::from_pem_files(&tls.ca, &tls.cert, &tls.key)
                .map_err(|e| RuntimeError::config(e.to_string()))?
                .verification(tls.verification);
            if let Some(server_name) = tls.server_name {
                builder = builder.server_name(server_name);
            }
            let context = builder.build().map_err(|e| RuntimeError::config(e.to_string()))?;
            set.push(options::security(Arc::new(context)));
        }

        if let Some(runtime) = self.runtime {
            if let Some(enabled) = runtime.handle_signal {
                set.push(options::handle_signal(enabled));
            }
            if let Some(ms) = runtime.shutdown_timeout_ms {
                set.push(options::shutdown_timeout(Duration::from_millis(ms)));
            }
        }

        Ok(set)
    }
}
