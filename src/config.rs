//! Configuration file loading.
//!
//! The file is TOML with an optional `[settings]` table, feeding the
//! [`SettingsBuilder`](crate::SettingsBuilder), and one `[[boards]]` entry per
//! board:
//!
//! ```toml
//! [settings]
//! image_tmpdir = "/var/www/images/tmp"
//! image_url = "http://10.0.0.1/images/tmp"
//!
//! [[boards]]
//! hostname = "panda01"
//! family = "generic"
//! console = { kind = "command", command = "telnet localhost 7001" }
//! power = { kind = "ipmi", host = "10.0.0.5" }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use serde::Deserialize;

use crate::board::Board;
use crate::error::{Error, Result};
use crate::settings::{Settings, SettingsBuilder, Timeouts};

/// Everything loaded from a configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub boards: Vec<Board>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config> {
        let raw: RawConfig = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let settings = raw.settings.unwrap_or_default().into_settings();

        let mut seen = std::collections::HashSet::new();
        for board in &raw.boards {
            if !seen.insert(board.hostname.as_str()) {
                return Err(Error::Config(format!(
                    "board `{}` is defined more than once",
                    board.hostname
                )));
            }
        }

        Ok(Config {
            settings,
            boards: raw.boards,
        })
    }

    /// Look a board up by its hostname.
    pub fn board(&self, hostname: &str) -> Result<&Board> {
        self.boards
            .iter()
            .find(|b| b.hostname == hostname)
            .ok_or_else(|| Error::Config(format!("no board named `{}`", hostname)))
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawConfig {
    settings: Option<RawSettings>,
    #[serde(default)]
    boards: Vec<Board>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSettings {
    image_tmpdir: Option<PathBuf>,
    image_url: Option<String>,
    cache_dir: Option<PathBuf>,
    server_ip: Option<String>,
    use_sudo: Option<bool>,
    media_create: Option<String>,
    hwpack_replace: Option<String>,
    image_size: Option<String>,
    download_attempts: Option<usize>,
    timeouts: Option<RawTimeouts>,
}

/// Timeouts in seconds.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTimeouts {
    command: Option<u64>,
    status_probe: Option<u64>,
    boot: Option<u64>,
    prompt: Option<u64>,
    format: Option<u64>,
    transfer: Option<u64>,
    network: Option<u64>,
}

impl RawSettings {
    fn into_settings(self) -> Settings {
        let mut builder = SettingsBuilder::new();
        if let Some(dir) = self.image_tmpdir {
            builder = builder.image_tmpdir(dir);
        }
        if let Some(url) = self.image_url {
            builder = builder.image_url(url);
        }
        if let Some(dir) = self.cache_dir {
            builder = builder.cache_dir(dir);
        }
        if let Some(ip) = self.server_ip {
            builder = builder.server_ip(ip);
        }
        if let Some(use_sudo) = self.use_sudo {
            builder = builder.use_sudo(use_sudo);
        }
        if let Some(tool) = self.media_create {
            builder = builder.media_create(tool);
        }
        if let Some(tool) = self.hwpack_replace {
            builder = builder.hwpack_replace(tool);
        }
        if let Some(size) = self.image_size {
            builder = builder.image_size(size);
        }
        if let Some(attempts) = self.download_attempts {
            builder = builder.download_attempts(attempts);
        }
        if let Some(raw) = self.timeouts {
            builder = builder.timeouts(raw.into_timeouts());
        }
        builder.finalize()
    }
}

impl RawTimeouts {
    fn into_timeouts(self) -> Timeouts {
        let defaults = Timeouts::default();
        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        Timeouts {
            command: secs(self.command, defaults.command),
            status_probe: secs(self.status_probe, defaults.status_probe),
            boot: secs(self.boot, defaults.boot),
            prompt: secs(self.prompt, defaults.prompt),
            format: secs(self.format, defaults.format),
            transfer: secs(self.transfer, defaults.transfer),
            network: secs(self.network, defaults.network),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
