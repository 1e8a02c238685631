//! Configuration snapshot for the agent.
//!
//! Loaded once at startup from a TOML file and handed to both actors as an
//! immutable snapshot; there are no configuration globals. Every field has
//! a default so a missing file still yields a runnable (lab) setup.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;

/// Update server endpoints and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Login endpoint; POST form `username`/`password`.
    #[serde(default = "default_login_url")]
    pub login_url: String,

    /// Manifest endpoint; POST form `node-id`/`node-os`/`current-version`.
    #[serde(default = "default_update_url")]
    pub update_url: String,

    /// File endpoint; POST form `node-id`/`node-os`/`version`/`filename`.
    #[serde(default = "default_download_url")]
    pub download_url: String,

    #[serde(default = "default_username")]
    pub username: String,

    #[serde(default = "default_password")]
    pub password: String,

    /// Pattern locating the session token in the login response headers.
    /// Capture group 1 is the token; the whole match is the cookie pair
    /// replayed on subsequent requests.
    #[serde(default = "default_session_pattern")]
    pub session_pattern: String,
}

fn default_login_url() -> String {
    "http://localhost:9001/login".to_string()
}

fn default_update_url() -> String {
    "http://localhost:9001/softwareupdate/checkforupdate".to_string()
}

fn default_download_url() -> String {
    "http://localhost:9001/softwareupdate/getfile".to_string()
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "admin".to_string()
}

fn default_session_pattern() -> String {
    "PLAY_SESSION=([^;]+)".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            update_url: default_update_url(),
            download_url: default_download_url(),
            username: default_username(),
            password: default_password(),
            session_pattern: default_session_pattern(),
        }
    }
}

/// Identity this device reports to the update server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,

    #[serde(default = "default_node_os")]
    pub os: String,
}

fn default_node_id() -> String {
    "node-0".to_string()
}

fn default_node_os() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            os: default_node_os(),
        }
    }
}

/// Update cycle cadence and filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Seconds between manifest polls.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Scratch directory fetched files land in before being moved live.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Top-level directory of the main application's live tree. Updated
    /// paths outside it belong to the agent itself and need the
    /// rename-aside / copy-into-place treatment.
    #[serde(default = "default_app_dir")]
    pub app_dir: String,

    /// Persisted command script; its existence at boot means an update was
    /// interrupted.
    #[serde(default = "default_command_file")]
    pub command_file: PathBuf,

    /// Append-only completion log next to the script.
    #[serde(default = "default_command_log")]
    pub command_log: PathBuf,

    #[serde(default = "default_pre_update_script")]
    pub pre_update_script: String,

    #[serde(default = "default_post_update_script")]
    pub post_update_script: String,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("temp-download")
}

fn default_app_dir() -> String {
    "app".to_string()
}

fn default_command_file() -> PathBuf {
    PathBuf::from("update.cmd")
}

fn default_command_log() -> PathBuf {
    PathBuf::from("update.cmd.log")
}

fn default_pre_update_script() -> String {
    "pre-update.sh".to_string()
}

fn default_post_update_script() -> String {
    "post-update.sh".to_string()
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            staging_dir: default_staging_dir(),
            app_dir: default_app_dir(),
            command_file: default_command_file(),
            command_log: default_command_log(),
            pre_update_script: default_pre_update_script(),
            post_update_script: default_post_update_script(),
        }
    }
}

/// Local control socket of the main application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

fn default_control_port() -> u16 {
    3103
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control_port: default_control_port(),
        }
    }
}

/// Facts detected at startup rather than configured.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    /// Version currently installed, reported to the server when polling.
    pub package_version: String,

    /// File name of the agent's own binary; update directives targeting it
    /// compile to the self-replacing pair ordered last.
    pub module_name: String,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        Self {
            package_version: env!("CARGO_PKG_VERSION").to_string(),
            module_name: "outpostd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(skip)]
    pub info: RuntimeInfo,
}

impl Config {
    /// Load the snapshot from a TOML file and fill in the detected facts.
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&text)?;
        config.detect_runtime();
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load the snapshot, falling back to defaults if the file is absent
    /// or unreadable.
    pub fn load_or_default(path: &Path) -> Config {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("using default configuration: {}", e);
                let mut config = Config::default();
                config.detect_runtime();
                config
            }
        }
    }

    /// Detect the installed package version and our own binary name.
    ///
    /// The version comes from a `VERSION` file in the working directory,
    /// written by the post-update script; a fresh install without one
    /// reports the compiled-in crate version.
    fn detect_runtime(&mut self) {
        match fs::read_to_string("VERSION") {
            Ok(text) => {
                let version = text.trim();
                if !version.is_empty() {
                    self.info.package_version = version.to_string();
                }
            }
            Err(_) => {
                warn!(
                    "no VERSION file; reporting compiled-in version {}",
                    self.info.package_version
                );
            }
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(name) = exe.file_name().and_then(|n| n.to_str()) {
                self.info.module_name = name.to_string();
            }
        }
    }
}
