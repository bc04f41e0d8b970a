// ── Keystone Gateway: Configuration ─────────────────────────────────────────
// TOML file on disk, OS-appropriate default path via `dirs`, with
// environment-variable overrides for the pieces an operator most commonly
// needs to flip without editing the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_PORT: u16 = 8045;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamProxyConfig {
    pub enabled: bool,
    pub url: String,
}

impl Default for UpstreamProxyConfig {
    fn default() -> Self {
        UpstreamProxyConfig { enabled: false, url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub upstream_proxy: UpstreamProxyConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig { upstream_proxy: UpstreamProxyConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEndpoint {
    pub enabled: bool,
    pub url: String,
}

impl Default for LocalEndpoint {
    fn default() -> Self {
        LocalEndpoint { enabled: false, url: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAiConfig {
    pub ollama: LocalEndpoint,
    pub lmstudio: LocalEndpoint,
}

impl Default for LocalAiConfig {
    fn default() -> Self {
        LocalAiConfig {
            ollama: LocalEndpoint { enabled: false, url: "http://localhost:11434".into() },
            lmstudio: LocalEndpoint { enabled: false, url: "http://localhost:1234".into() },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub port: u16,
    pub auth_token: Option<String>,
    pub proxy: ProxyConfig,
    pub local_ai: LocalAiConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            port: DEFAULT_PORT,
            auth_token: None,
            proxy: ProxyConfig::default(),
            local_ai: LocalAiConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Default config file location: `<config dir>/keystone-gateway/config.toml`.
    pub fn default_path() -> GatewayResult<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| GatewayError::Config("could not determine OS config directory".into()))?;
        Ok(base.join("keystone-gateway").join("config.toml"))
    }

    /// Loads config from `path` if present, otherwise returns defaults.
    /// Then applies environment-variable overrides.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| GatewayError::Config(format!("{}: {e}", path.display())))?
        } else {
            GatewayConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("KEYSTONE_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Ok(token) = std::env::var("KEYSTONE_AUTH_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Ok(url) = std::env::var("KEYSTONE_UPSTREAM_PROXY_URL") {
            self.proxy.upstream_proxy.enabled = true;
            self.proxy.upstream_proxy.url = url;
        }
        if let Ok(url) = std::env::var("KEYSTONE_OLLAMA_URL") {
            self.local_ai.ollama.enabled = true;
            self.local_ai.ollama.url = url;
        }
        if let Ok(url) = std::env::var("KEYSTONE_LMSTUDIO_URL") {
            self.local_ai.lmstudio.enabled = true;
            self.local_ai.lmstudio.url = url;
        }
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.port == 0 {
            return Err(GatewayError::Config("port must be nonzero".into()));
        }
        if self.proxy.upstream_proxy.enabled && self.proxy.upstream_proxy.url.is_empty() {
            return Err(GatewayError::Config("proxy.upstream_proxy.enabled requires a url".into()));
        }
        if self.local_ai.ollama.enabled && self.local_ai.ollama.url.is_empty() {
            return Err(GatewayError::Config("local_ai.ollama.enabled requires a url".into()));
        }
        if self.local_ai.lmstudio.enabled && self.local_ai.lmstudio.url.is_empty() {
            return Err(GatewayError::Config("local_ai.lmstudio.enabled requires a url".into()));
        }
        Ok(())
    }
}
