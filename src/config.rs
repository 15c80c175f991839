//! Client configuration, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::{flags, multiplex};

pub const DEFAULT_VALIDATION_FILE: &str = "Config/BaseEngine.ini";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `+`-separated candidate hosts, tried in order.
    pub hosts: String,
    /// Directory the cooked files are mirrored into.
    pub local_root: PathBuf,
    pub platforms: Vec<String>,
    pub project_name: String,
    pub engine_dir: String,
    pub project_dir: String,
    /// Extra directories the server should include in its listing.
    pub directories: Vec<String>,
    /// Seconds between heartbeats; negative disables them.
    pub heartbeat_frequency: f32,
    pub multichannel: bool,
    pub bandwidth_latency_product: u64,
    /// Server keeps its cook between sessions and reports what is already cooked.
    pub precooked_iterative: bool,
    /// File force-synced at bootstrap to prove the connection works.
    pub validation_file: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: "127.0.0.1".into(),
            local_root: PathBuf::from("cooked"),
            platforms: vec!["Linux".into()],
            project_name: String::new(),
            engine_dir: "Engine".into(),
            project_dir: String::new(),
            directories: Vec::new(),
            heartbeat_frequency: 5.0,
            multichannel: false,
            bandwidth_latency_product: multiplex::DEFAULT_BANDWIDTH_LATENCY_PRODUCT,
            precooked_iterative: false,
            validation_file: DEFAULT_VALIDATION_FILE.into(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(path, text).with_context(|| format!("writing config {}", path.display()))
    }

    /// Flags sent with GetFileList. Streaming clients add their own bit.
    pub fn connection_flags(&self) -> u32 {
        if self.precooked_iterative {
            flags::PRECOOKED_ITERATIVE
        } else {
            flags::NONE
        }
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_frequency >= 0.0
    }

    /// Time between periodic heartbeats. `None` when they are disabled or the
    /// frequency is too large to represent, in which case they never fire.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        if !self.heartbeat_enabled() {
            return None;
        }
        Duration::try_from_secs_f32(self.heartbeat_frequency).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = ClientConfig::from_toml_str(
            r#"
            hosts = "tcp://cookbox:41899+http://fallback"
            multichannel = true
            heartbeat_frequency = -1.0
            "#,
        )
        .unwrap();
        assert!(cfg.multichannel);
        assert!(!cfg.heartbeat_enabled());
        assert_eq!(cfg.validation_file, DEFAULT_VALIDATION_FILE);
        assert_eq!(cfg.connection_flags(), flags::NONE);
    }

    #[test]
    fn save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("cookfs.toml");
        let cfg = ClientConfig {
            precooked_iterative: true,
            project_name: "Shooter".into(),
            ..ClientConfig::default()
        };
        cfg.save(&path).unwrap();
        let loaded = ClientConfig::load(&path).unwrap();
        assert_eq!(loaded.project_name, "Shooter");
        assert_eq!(loaded.connection_flags(), flags::PRECOOKED_ITERATIVE);
    }

    #[test]
    fn heartbeat_interval_bounds() {
        let with = |heartbeat_frequency| ClientConfig {
            heartbeat_frequency,
            ..ClientConfig::default()
        };
        assert_eq!(with(2.5).heartbeat_interval(), Some(Duration::from_millis(2500)));
        assert_eq!(with(0.0).heartbeat_interval(), Some(Duration::ZERO));
        assert_eq!(with(-1.0).heartbeat_interval(), None);
        assert_eq!(with(f32::NAN).heartbeat_interval(), None);
        assert_eq!(with(f32::INFINITY).heartbeat_interval(), None);
        assert_eq!(with(1e30).heartbeat_interval(), None);

        let cfg = ClientConfig::from_toml_str("heartbeat_frequency = inf").unwrap();
        assert!(cfg.heartbeat_enabled());
        assert_eq!(cfg.heartbeat_interval(), None);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(ClientConfig::from_toml_str("multichannel = \"yes\"").is_err());
    }
}
