use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tandem_session::SessionConfig;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/tandem.toml";

/// Settings for `tandem demo` when flags are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Rounds in the demo campaign.
    pub rounds: u32,
    /// Session seed for the scripted simulation.
    pub seed: u64,
    /// Simulation ticks per round.
    pub ticks_per_round: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            rounds: 3,
            seed: 0x7A4D_E11A,
            ticks_per_round: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub demo: DemoConfig,
    pub session: SessionConfig,
}

impl AppConfig {
    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    AppConfig::default()
                }
            },
            Err(err) => {
                if path != Path::new(DEFAULT_CONFIG_PATH)
                    || err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!("Config not found at {}. Using defaults", path.display());
                }
                AppConfig::default()
            }
        }
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("tandem-missing-config/none.toml");
        assert_eq!(AppConfig::load_from_path(&path), AppConfig::default());
    }

    #[test]
    fn invalid_file_uses_defaults() {
        let dir = std::env::temp_dir().join(format!("tandem-bad-config-{}", std::process::id()));
        let path = dir.join("tandem.toml");
        fs::create_dir_all(&dir).unwrap();
        fs::write(&path, "demo = 5").unwrap();
        assert_eq!(AppConfig::load_from_path(&path), AppConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = std::env::temp_dir().join(format!("tandem-config-{}", std::process::id()));
        let path = dir.join("nested/tandem.toml");
        let mut config = AppConfig::default();
        config.demo.rounds = 5;
        config.session.heartbeat_interval_ms = 400;
        config.session.ice.stun_servers = vec!["stun.example.org:3478".into()];
        config.save_to_path(&path).expect("save");
        assert_eq!(AppConfig::load_from_path(&path), config);
    }
}
