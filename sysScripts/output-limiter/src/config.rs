//! `[output_limiter]` section of `~/.config/rust-dotfiles/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VolumeConfig {
    pub enabled: bool,
    pub sink: String,
    pub max_level: i32,
    pub interval_ms: u64,
    pub steps: u32,
    pub show_ui: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sink: "@DEFAULT_AUDIO_SINK@".to_string(),
            max_level: 15,
            interval_ms: 250,
            steps: 9,
            show_ui: true,
        }
    }
}

impl VolumeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BrightnessConfig {
    pub enabled: bool,
    /// Backlight device under `/sys/class/backlight`; first one found when unset.
    pub device: Option<String>,
    /// Lowest value the channel writes; keeps the panel from going dark.
    pub min: i32,
    pub interval_ms: u64,
    pub steps: u32,
    pub mode_schema: String,
    pub mode_key: String,
    /// Command run when the user confirms the permission prompt.
    pub grant_command: Option<String>,
    pub exit_on_decline: bool,
    pub icon: String,
}

impl Default for BrightnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: None,
            min: 1,
            interval_ms: 500,
            steps: 9,
            mode_schema: "org.gnome.settings-daemon.plugins.power".to_string(),
            mode_key: "ambient-enabled".to_string(),
            grant_command: None,
            exit_on_decline: true,
            icon: "display-brightness-symbolic".to_string(),
        }
    }
}

impl BrightnessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    pub volume: VolumeConfig,
    pub brightness: BrightnessConfig,
}

#[derive(Deserialize, Debug, Default)]
struct GlobalConfig {
    #[serde(default)]
    output_limiter: LimiterConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot find home dir")?;
    Ok(home.join(".config/rust-dotfiles/config.toml"))
}

/// Loads the limiter section. A missing file or section gives the defaults.
pub fn load_config(path: &Path) -> Result<LimiterConfig> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(LimiterConfig::default());
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file from path: {}", path.display()))?;
    parse_config(&config_str)
}

pub fn parse_config(config_str: &str) -> Result<LimiterConfig> {
    let config: GlobalConfig =
        toml::from_str(config_str).context("Failed to parse config.toml. Check for syntax errors.")?;
    Ok(config.output_limiter)
}
