use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}, time::Duration};

use sshfwd::{ForwardConfig, Forwarder};

/// Defaults read from `<config_dir>/sshfwd/config.json`. Command-line flags
/// win over anything set here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub timeout_secs: Option<u64>,
    pub allow_password_prompt: bool,
    pub identity_file: Option<PathBuf>,
    pub ssh_program: Option<PathBuf>,
    pub probe_interval_ms: Option<u64>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let contents = fs::read_to_string(path)
            .context("Failed to read config file")?;
        let settings: Settings = serde_json::from_str(&contents)
            .context("Failed to parse config file")?;

        Ok(settings)
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sshfwd");

        Ok(config_dir.join("config.json"))
    }

    /// Fill in whatever the compact address string can't express.
    pub fn apply(&self, config: &mut ForwardConfig) {
        if let Some(secs) = self.timeout_secs {
            config.timeout = Duration::from_secs(secs);
        }
        if self.allow_password_prompt {
            config.allow_password_prompt = true;
        }
        if config.identity_file.is_none() {
            config.identity_file = self.identity_file.clone();
        }
    }

    pub fn forwarder(&self) -> Forwarder {
        let mut forwarder = Forwarder::new();
        if let Some(program) = &self.ssh_program {
            forwarder = forwarder.program(program);
        }
        if let Some(ms) = self.probe_interval_ms {
            forwarder = forwarder.probe_interval(Duration::from_millis(ms));
        }
        forwarder
    }
}
