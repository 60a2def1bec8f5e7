//! Configuration data structures for apiman.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. Every
//! section has defaults so a minimal config only needs to declare its APIs.
use serde::{Deserialize, Serialize};

use crate::core::{api::ApiSpec, input::DEFAULT_MAX_FORM_BYTES};

fn default_listen_addr() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_admin_addr() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_organization() -> String {
    "dispatch".to_string()
}

/// Which driver the controller reconciles APIs against.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayDriver {
    /// The embedded router served on `listen_addr`
    #[default]
    Local,
    /// An external Kong admin API
    Kong,
}

/// What the local gateway does when a request uses the wrong protocol for its API.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolMismatchPolicy {
    /// Write the 400 and keep processing the request (historical behavior)
    #[default]
    Continue,
    /// Return the 400 immediately
    Reject,
}

/// Kong admin API connection settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct KongConfig {
    /// Base URL of the Kong admin API
    pub host: String,
    /// `host:port` Kong uses to reach the function manager
    pub upstream: String,
}

impl Default for KongConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8001".to_string(),
            upstream: "localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub driver: GatewayDriver,
    pub protocol_mismatch: ProtocolMismatchPolicy,
    /// Parse limit for urlencoded and multipart bodies
    pub max_form_bytes: usize,
    pub kong: KongConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            driver: GatewayDriver::Local,
            protocol_mismatch: ProtocolMismatchPolicy::Continue,
            max_form_bytes: DEFAULT_MAX_FORM_BYTES,
            kong: KongConfig::default(),
        }
    }
}

/// Where functions are executed
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FunctionManagerConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for FunctionManagerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    /// Humantime duration between full resync passes, e.g. `"60s"` or `"5m"`
    pub resync_period: String,
    /// Number of per-key worker queues
    pub workers: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period: "60s".to_string(),
            workers: 1,
        }
    }
}

impl ControllerConfig {
    pub fn resync_period(&self) -> eyre::Result<std::time::Duration> {
        humantime::parse_duration(&self.resync_period)
            .map_err(|e| eyre::eyre!("invalid resync_period '{}': {}", self.resync_period, e))
    }
}

/// Certificate and key for serving the local gateway over HTTPS
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ManagerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
    /// Organization that declared APIs belong to
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub function_manager: FunctionManagerConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub apis: Vec<ApiSpec>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            organization: default_organization(),
            gateway: GatewayConfig::default(),
            function_manager: FunctionManagerConfig::default(),
            controller: ControllerConfig::default(),
            tls: None,
            logging: LoggingConfig::default(),
            apis: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }
}

/// Fluent construction of a [`ManagerConfig`], mostly for embedding and tests.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn admin_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.admin_addr = addr.into();
        self
    }

    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.config.organization = organization.into();
        self
    }

    pub fn driver(mut self, driver: GatewayDriver) -> Self {
        self.config.gateway.driver = driver;
        self
    }

    pub fn protocol_mismatch(mut self, policy: ProtocolMismatchPolicy) -> Self {
        self.config.gateway.protocol_mismatch = policy;
        self
    }

    pub fn function_manager(mut self, url: impl Into<String>) -> Self {
        self.config.function_manager.url = url.into();
        self
    }

    pub fn resync_period(mut self, period: impl Into<String>) -> Self {
        self.config.controller.resync_period = period.into();
        self
    }

    pub fn tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn api(mut self, spec: ApiSpec) -> Self {
        self.config.apis.push(spec);
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}
