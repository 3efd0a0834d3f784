//! Device audio service: the media stream the volume channel drives.

use async_trait::async_trait;
use notify_rust::{Hint, Notification};
use tokio::process::Command;

use crate::error::SettingError;

/// Flags passed along with a level change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    /// Show the desktop's volume feedback for this change.
    pub show_ui: bool,
}

/// Level-based view of one audio stream. Levels run from 0 to `max_level()`.
#[async_trait]
pub trait AudioService: Send + Sync {
    async fn current_level(&self) -> Result<i32, SettingError>;
    async fn set_level(&self, level: i32, flags: VolumeFlags) -> Result<(), SettingError>;
    fn max_level(&self) -> i32;
}

/// PipeWire sink controlled through WirePlumber's `wpctl`.
///
/// `wpctl` reports a fractional volume (`Volume: 0.40`, optionally followed by
/// `[MUTED]`); it is mapped onto `0..=max_level` integer levels.
pub struct WpctlAudio {
    sink: String,
    max_level: i32,
}

impl WpctlAudio {
    pub fn new(sink: impl Into<String>, max_level: i32) -> Self {
        Self {
            sink: sink.into(),
            max_level: max_level.max(1),
        }
    }

    fn show_feedback(&self, level: i32) {
        let percent = level * 100 / self.max_level;
        let icon = if level == 0 {
            "audio-volume-muted-symbolic"
        } else {
            "audio-volume-high-symbolic"
        };
        // notify-rust blocks on D-Bus, keep it off the runtime thread.
        std::thread::spawn(move || {
            if let Err(e) = Notification::new()
                .summary("Volume")
                .body(&format!("{}%", percent))
                .icon(icon)
                .hint(Hint::CustomInt("value".to_string(), percent))
                .hint(Hint::Transient(true))
                .show()
            {
                log::warn!("Failed to show volume feedback: {}", e);
            }
        });
    }
}

/// Parses `wpctl get-volume` output into the fractional volume.
pub fn parse_wpctl_volume(output: &str) -> Option<f64> {
    output
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<f64>().ok())
}

/// Maps a fractional volume onto an integer level.
pub fn fraction_to_level(fraction: f64, max_level: i32) -> i32 {
    (fraction * f64::from(max_level)).round() as i32
}

#[async_trait]
impl AudioService for WpctlAudio {
    async fn current_level(&self) -> Result<i32, SettingError> {
        let out = Command::new("wpctl")
            .arg("get-volume")
            .arg(&self.sink)
            .output()
            .await?;
        if !out.status.success() {
            return Err(SettingError::Command {
                command: "wpctl get-volume",
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let fraction = parse_wpctl_volume(&stdout).ok_or_else(|| SettingError::Parse {
            command: "wpctl get-volume",
            output: stdout.trim().to_string(),
        })?;
        Ok(fraction_to_level(fraction, self.max_level))
    }

    async fn set_level(&self, level: i32, flags: VolumeFlags) -> Result<(), SettingError> {
        let fraction = f64::from(level) / f64::from(self.max_level);
        let out = Command::new("wpctl")
            .arg("set-volume")
            .arg(&self.sink)
            .arg(format!("{:.4}", fraction))
            .output()
            .await?;
        if !out.status.success() {
            return Err(SettingError::Command {
                command: "wpctl set-volume",
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        if flags.show_ui {
            self.show_feedback(level);
        }
        Ok(())
    }

    fn max_level(&self) -> i32 {
        self.max_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_muted_output() {
        assert_eq!(parse_wpctl_volume("Volume: 0.40\n"), Some(0.40));
        assert_eq!(parse_wpctl_volume("Volume: 1.00 [MUTED]\n"), Some(1.0));
        assert_eq!(parse_wpctl_volume("garbage"), None);
        assert_eq!(parse_wpctl_volume(""), None);
    }

    #[test]
    fn fraction_maps_to_nearest_level() {
        assert_eq!(fraction_to_level(0.40, 15), 6);
        assert_eq!(fraction_to_level(0.4667, 15), 7);
        assert_eq!(fraction_to_level(0.0, 15), 0);
        assert_eq!(fraction_to_level(1.0, 15), 15);
    }
}
