//! Gateway configuration file handling.
//!
//! The configuration lives in a TOML file under the user's config directory
//! (`~/.config/signalk-mqtt-gw/config.toml` on Linux). A file with default
//! values is written on first start so there is always something to edit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::forwarding::{DebounceMode, PathSpec};
use crate::ingress::NonNumericPolicy;
use crate::mqtt::RemoteOptions;

const CONFIG_DIR: &str = "signalk-mqtt-gw";
const CONFIG_FILE: &str = "config.toml";

/// One path to forward and the minimum number of seconds between sends.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PathInterval {
    pub path: String,
    pub interval: f64,
    #[serde(default)]
    pub mode: DebounceMode,
}

impl PathInterval {
    pub fn min_interval(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.interval)
            .map_err(|e| eyre!("Invalid interval {} for path {}: {}", self.interval, self.path, e))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Identity of this vessel, used for the `vessels.<self_id>` context and
    /// as the remote client id.
    pub self_id: String,
    /// Run the local broker and feed what clients publish into the bus.
    pub run_local_server: bool,
    pub port: u16,
    /// Forward the configured paths to the remote broker.
    pub send_to_remote: bool,
    /// `mqtt://` or `mqtts://` url of the remote broker.
    pub remote_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Reject self-signed and invalid server certificates.
    pub reject_unauthorized: bool,
    pub paths: Vec<PathInterval>,
    /// Upper bound for messages buffered while the remote broker is away.
    /// Unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued_messages: Option<usize>,
    pub non_numeric_payload: NonNumericPolicy,
    pub reconnect_period_secs: u64,
    pub keep_alive_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            self_id: "self".to_string(),
            run_local_server: false,
            port: 1883,
            send_to_remote: false,
            remote_host: "mqtt://somehost".to_string(),
            username: None,
            password: None,
            reject_unauthorized: false,
            paths: vec![PathInterval {
                path: "navigation.position".to_string(),
                interval: 60.0,
                mode: DebounceMode::default(),
            }],
            max_queued_messages: None,
            non_numeric_payload: NonNumericPolicy::default(),
            reconnect_period_secs: 60,
            keep_alive_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn context(&self) -> String {
        format!("vessels.{}", self.self_id)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| eyre!("Failed to parse configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.self_id.trim().is_empty() {
            return Err(eyre!("self_id must not be empty"));
        }
        for entry in &self.paths {
            if entry.path.trim().is_empty() {
                return Err(eyre!("Forwarded path must not be empty"));
            }
            entry.min_interval()?;
        }
        Ok(())
    }

    /// One spec per configured path. Fails on an interval that is negative,
    /// not finite or too large for a [`Duration`].
    pub fn path_specs(&self) -> Result<Vec<PathSpec>> {
        self.paths
            .iter()
            .map(|entry| {
                Ok(PathSpec::new(entry.path.clone(), entry.min_interval()?).with_mode(entry.mode))
            })
            .collect()
    }

    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            url: self.remote_host.clone(),
            client_id: self.self_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            reject_unauthorized: self.reject_unauthorized,
            reconnect_period: Duration::from_secs(self.reconnect_period_secs),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }

    /// Reads the file at `path`, writing the defaults there first if it does
    /// not exist.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No configuration at {}, writing defaults", path.display());
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&raw)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize configuration: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }
}

/// `<config dir>/signalk-mqtt-gw/config.toml`, falling back to the working
/// directory when no config dir is known.
pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}
