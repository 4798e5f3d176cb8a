//! Application settings: TOML file merged with CLI overrides.
use std::collections::HashMap;

use serde::Deserialize;

use crate::cli::Cli;
use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub console: ConsoleSettings,
    pub pxgrid: PxGridSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

/// Network-analytics console connection and reconciliation policy.
#[derive(Clone, Debug, Deserialize)]
pub struct ConsoleSettings {
    // Console management host (IP or DNS name)
    pub host: String,

    pub user: String,
    pub password: String,

    // Re-authenticate after this many seconds; keep below the console's
    // session timeout
    #[serde(default = "default_reauth_seconds")]
    pub reauth_seconds: i64,

    // Max console API calls per second before events are shed
    #[serde(default = "default_max_call_rate")]
    pub max_call_rate: f64,

    // Parent group for tags with no explicit override
    #[serde(default = "default_parent_group")]
    pub default_parent_group: String,

    // SGT name -> parent group name
    #[serde(default)]
    pub parent_groups: HashMap<String, String>,

    // Consoles often run self-signed management certificates
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// pxGrid control-plane identity and certificates.
#[derive(Clone, Debug, Deserialize)]
pub struct PxGridSettings {
    // pxGrid PSN hosts; the first reachable one is used
    pub hosts: Vec<String>,

    // Agent account registered with the pxGrid controller
    pub nodename: String,
    #[serde(default)]
    pub node_description: String,
    pub password: String,

    // Client certificate pair (PEM; the key must be unencrypted PKCS#8)
    pub client_cert: String,
    pub client_key: String,

    // pxGrid server certificate, trusted as a root
    pub server_cert: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheSettings {
    // Minimum seconds between stale sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: i64,

    // An entry is stale once unconfirmed for this long
    #[serde(default = "default_stale_after")]
    pub stale_after_seconds: i64,

    // When false, stale IPs are logged but left in the console and cache
    #[serde(default = "default_remove_stale")]
    pub remove_stale: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval(),
            stale_after_seconds: default_stale_after(),
            remove_stale: default_remove_stale(),
        }
    }
}

fn default_reauth_seconds() -> i64 {
    1500
}

fn default_max_call_rate() -> f64 {
    20.0
}

fn default_parent_group() -> String {
    "TAGS".to_string()
}

fn default_sweep_interval() -> i64 {
    1800
}

fn default_stale_after() -> i64 {
    36000
}

fn default_remove_stale() -> bool {
    true
}

impl Settings {
    /// Load the TOML file, then let CLI/env overrides win for credentials.
    pub fn load(cli: &Cli) -> Result<Self> {
        let raw = std::fs::read_to_string(&cli.config).map_err(|err| {
            config_error!("cannot read {}: {}", cli.config.display(), err)
        })?;
        let mut settings = Self::parse(&raw)?;
        settings.apply_overrides(cli);
        settings.validate()?;
        Ok(settings)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| config_error!("invalid configuration: {}", err))
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(user) = &cli.console_user {
            self.console.user = user.clone();
        }
        if let Some(password) = &cli.console_password {
            self.console.password = password.clone();
        }
        if let Some(password) = &cli.pxgrid_password {
            self.pxgrid.password = password.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.console.host.is_empty() {
            return Err(config_error!("console.host must be set"));
        }
        if self.console.user.is_empty() || self.console.password.is_empty() {
            return Err(config_error!(
                "console credentials must be set in the config file or on the command line"
            ));
        }
        if self.console.max_call_rate <= 0.0 {
            return Err(config_error!("console.max_call_rate must be positive"));
        }
        if self.pxgrid.hosts.is_empty() {
            return Err(config_error!("pxgrid.hosts must list at least one PSN"));
        }
        if self.pxgrid.nodename.is_empty() || self.pxgrid.password.is_empty() {
            return Err(config_error!("pxgrid node credentials must be set"));
        }
        Ok(())
    }

    /// Parent group a new tag should be created under.
    pub fn parent_group_for(&self, tag_name: &str) -> &str {
        self.console
            .parent_groups
            .get(tag_name)
            .map(String::as_str)
            .unwrap_or(&self.console.default_parent_group)
    }

    /// Every parent group named in the config, overrides plus default.
    pub fn configured_parent_groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = vec![&self.console.default_parent_group];
        groups.extend(self.console.parent_groups.values().map(String::as_str));
        groups
    }
}
