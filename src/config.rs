use crate::logging;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Serialize, Default, Clone, Debug, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub workspace: WorkspaceSettings,
}

/// Where the proxy's management API lives and how to authenticate to it.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    /// Bounds connecting and control calls. Statements are not limited.
    pub timeout_secs: u64,
    /// Interval between polls of an asynchronous ETL step.
    pub poll_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("http://127.0.0.1:8989/v1"),
            user: String::from("admin"),
            password: String::from("mariadb"),
            timeout_secs: 10,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct WorkspaceSettings {
    pub storage_dir: PathBuf,
    pub etl_concurrency: usize,
    pub probe_after_idle_secs: u64,
    pub history_max_entries: usize,
    pub cancel_timeout_secs: u64,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            storage_dir: Config::get_config_dir().join("storage"),
            etl_concurrency: 4,
            probe_after_idle_secs: 300,
            history_max_entries: 1000,
            cancel_timeout_secs: 5,
        }
    }
}

impl WorkspaceSettings {
    pub fn probe_after_idle(&self) -> Duration {
        Duration::from_secs(self.probe_after_idle_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub api: ApiConfig,
    pub workspace: WorkspaceSettings,
}

impl Config {
    fn get_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("querydeck")
    }

    /// Reads `path`, writing the defaults there first if it does not exist.
    fn load_config(path: &Path) -> Result<ConfigFile> {
        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).context("Failed to create config directory")?;
            }

            let default_config = ConfigFile::default();
            let toml_string = toml::to_string_pretty(&default_config)
                .context("Failed to serialize default config")?;

            std::fs::write(path, toml_string).context("Failed to write config file")?;

            Ok(default_config)
        }
    }

    pub fn new() -> Self {
        Self::from_path(&Self::get_config_dir().join("config.toml"))
    }

    pub fn from_path(path: &Path) -> Self {
        let config_file = Self::load_config(path).unwrap_or_else(|err| {
            logging::error(&format!("Error loading config: {:#}", err));
            ConfigFile::default()
        });

        Self {
            api: config_file.api,
            workspace: config_file.workspace,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let config_file = ConfigFile {
            api: self.api.clone(),
            workspace: self.workspace.clone(),
        };

        let toml_string =
            toml::to_string_pretty(&config_file).context("Failed to serialize config")?;

        std::fs::write(path, toml_string).context("Failed to write config file")?;

        Ok(())
    }
}
