//! Configuration for the capture server
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! The `[capture]` table carries the core settings; see
//! [`capture_core::CaptureConfig`].

use capture_core::CaptureConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for the capture server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Caller identity configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Capture core configuration
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

/// Bearer token verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret; every request is rejected while unset
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Expected `iss` claim; not checked when unset
    #[serde(default)]
    pub issuer: Option<String>,

    /// Expected `aud` claim
    #[serde(default = "default_audience")]
    pub audience: String,
}

fn default_audience() -> String {
    "authenticated".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            issuer: None,
            audience: default_audience(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) {
        if let Some(host) = env_non_empty("CAPTURE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_non_empty("CAPTURE_HTTP_PORT").and_then(|p| p.parse().ok()) {
            self.server.http_port = port;
        }
        if let Some(secret) = env_non_empty("SUPABASE_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Some(url) = env_non_empty("SUPABASE_URL") {
            self.auth.issuer = Some(issuer_for(&url));
        }
        self.capture.apply_env();
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<Self> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                let mut config = Self::from_file(p)?;
                config.apply_env();
                return Ok(config);
            }
        }
        Ok(Self::from_env())
    }

    /// Socket address string to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

/// `{project url}/auth/v1`
pub fn issuer_for(project_url: &str) -> String {
    format!("{}/auth/v1", project_url.trim().trim_end_matches('/'))
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
