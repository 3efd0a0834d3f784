//! Device system-settings service: screen brightness and its mode flag.
//!
//! The Linux backend keeps brightness in the sysfs backlight class and the
//! "automatic brightness" flag in GNOME's ambient light setting.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::error::SettingError;

/// Value of [`SettingKey::ScreenBrightnessMode`] when brightness is manual.
pub const BRIGHTNESS_MODE_MANUAL: i32 = 0;
/// Value of [`SettingKey::ScreenBrightnessMode`] when the device adjusts brightness itself.
pub const BRIGHTNESS_MODE_AUTOMATIC: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    ScreenBrightness,
    ScreenBrightnessMode,
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingKey::ScreenBrightness => write!(f, "screen_brightness"),
            SettingKey::ScreenBrightnessMode => write!(f, "screen_brightness_mode"),
        }
    }
}

#[async_trait]
pub trait SystemSettings: Send + Sync {
    /// Whether this process may write system settings.
    async fn can_write(&self) -> bool;
    async fn get_int(&self, key: SettingKey) -> Result<i32, SettingError>;
    async fn put_int(&self, key: SettingKey, value: i32) -> Result<(), SettingError>;
}

/// Backlight under `/sys/class/backlight/<device>` plus a `gsettings` boolean
/// standing in for the brightness mode.
pub struct SysfsSettings {
    device_dir: PathBuf,
    mode_schema: String,
    mode_key: String,
}

impl SysfsSettings {
    pub const BACKLIGHT_ROOT: &'static str = "/sys/class/backlight";

    /// Opens `device` under `root`, or the first device found when `device` is `None`.
    pub fn open(
        root: &Path,
        device: Option<&str>,
        mode_schema: impl Into<String>,
        mode_key: impl Into<String>,
    ) -> Result<Self> {
        let device_dir = match device {
            Some(name) => root.join(name),
            None => first_backlight(root)?,
        };
        if !device_dir.join("brightness").exists() {
            anyhow::bail!("No backlight brightness file in {}", device_dir.display());
        }
        Ok(Self {
            device_dir,
            mode_schema: mode_schema.into(),
            mode_key: mode_key.into(),
        })
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    pub fn brightness_path(&self) -> PathBuf {
        self.device_dir.join("brightness")
    }

    /// Highest raw brightness the device accepts.
    pub fn max_brightness(&self) -> Result<i32> {
        let path = self.device_dir.join("max_brightness");
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        raw.trim()
            .parse::<i32>()
            .with_context(|| format!("Invalid max_brightness in {}", path.display()))
    }

    async fn read_mode(&self) -> Result<i32, SettingError> {
        let out = gsettings(&["get", &self.mode_schema, &self.mode_key]).await?;
        if !out.status.success() {
            return Err(SettingError::NotFound(SettingKey::ScreenBrightnessMode));
        }
        match String::from_utf8_lossy(&out.stdout).trim() {
            "true" => Ok(BRIGHTNESS_MODE_AUTOMATIC),
            "false" => Ok(BRIGHTNESS_MODE_MANUAL),
            other => Err(SettingError::Parse {
                command: "gsettings get",
                output: other.to_string(),
            }),
        }
    }

    async fn write_mode(&self, value: i32) -> Result<(), SettingError> {
        let flag = if value == BRIGHTNESS_MODE_AUTOMATIC { "true" } else { "false" };
        let out = gsettings(&["set", &self.mode_schema, &self.mode_key, flag]).await?;
        if !out.status.success() {
            return Err(SettingError::Command {
                command: "gsettings set",
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn first_backlight(root: &Path) -> Result<PathBuf> {
    let mut devices: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to list {}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    devices.sort();
    devices
        .into_iter()
        .next()
        .with_context(|| format!("No backlight device found in {}", root.display()))
}

/// Runs `gsettings`, reporting a missing binary as a missing mode key.
async fn gsettings(args: &[&str]) -> Result<std::process::Output, SettingError> {
    Command::new("gsettings")
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => SettingError::NotFound(SettingKey::ScreenBrightnessMode),
            _ => SettingError::Io(e),
        })
}

fn map_write_err(err: io::Error) -> SettingError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => SettingError::PermissionDenied(SettingKey::ScreenBrightness),
        _ => SettingError::Io(err),
    }
}

#[async_trait]
impl SystemSettings for SysfsSettings {
    async fn can_write(&self) -> bool {
        OpenOptions::new()
            .write(true)
            .open(self.brightness_path())
            .is_ok()
    }

    async fn get_int(&self, key: SettingKey) -> Result<i32, SettingError> {
        match key {
            SettingKey::ScreenBrightness => {
                let raw = fs::read_to_string(self.brightness_path()).map_err(|e| match e.kind() {
                    io::ErrorKind::NotFound => SettingError::NotFound(key),
                    _ => SettingError::Io(e),
                })?;
                raw.trim().parse::<i32>().map_err(|_| SettingError::Parse {
                    command: "read brightness",
                    output: raw.trim().to_string(),
                })
            }
            SettingKey::ScreenBrightnessMode => self.read_mode().await,
        }
    }

    async fn put_int(&self, key: SettingKey, value: i32) -> Result<(), SettingError> {
        match key {
            SettingKey::ScreenBrightness => {
                let mut file = OpenOptions::new()
                    .write(true)
                    .open(self.brightness_path())
                    .map_err(map_write_err)?;
                writeln!(file, "{}", value).map_err(map_write_err)?;
                Ok(())
            }
            SettingKey::ScreenBrightnessMode => self.write_mode(value).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_backlight(name: &str, brightness: i32, max: i32) -> TempDir {
        let root = tempfile::tempdir().unwrap();
        let dev = root.path().join(name);
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("brightness"), format!("{}\n", brightness)).unwrap();
        fs::write(dev.join("max_brightness"), format!("{}\n", max)).unwrap();
        root
    }

    #[test]
    fn open_picks_first_device_when_unnamed() {
        let root = fake_backlight("intel_backlight", 120, 255);
        fs::create_dir_all(root.path().join("zz_other")).unwrap();
        let settings = SysfsSettings::open(root.path(), None, "schema", "key").unwrap();
        assert!(settings.device_dir().ends_with("intel_backlight"));
        assert_eq!(settings.max_brightness().unwrap(), 255);
    }

    #[test]
    fn open_rejects_missing_device() {
        let root = fake_backlight("intel_backlight", 120, 255);
        assert!(SysfsSettings::open(root.path(), Some("acpi_video0"), "schema", "key").is_err());
    }

    #[tokio::test]
    async fn brightness_round_trips_through_sysfs() {
        let root = fake_backlight("intel_backlight", 120, 255);
        let settings = SysfsSettings::open(root.path(), None, "schema", "key").unwrap();
        assert!(settings.can_write().await);
        assert_eq!(settings.get_int(SettingKey::ScreenBrightness).await.unwrap(), 120);
        settings.put_int(SettingKey::ScreenBrightness, 42).await.unwrap();
        assert_eq!(settings.get_int(SettingKey::ScreenBrightness).await.unwrap(), 42);
    }

    #[test]
    fn permission_errors_map_to_setting_permission_denied() {
        let err = map_write_err(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, SettingError::PermissionDenied(SettingKey::ScreenBrightness)));
    }
}
