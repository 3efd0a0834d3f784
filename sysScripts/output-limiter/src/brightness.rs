//! Screen brightness as a [`SettingChannel`].
//!
//! Writes go through the system-settings capability check. Every successful
//! write also turns automatic brightness off, otherwise the device would
//! override the manual value right away.

use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;

use crate::channel::SettingChannel;
use crate::error::{SettingError, WriteError};
use crate::permission::PermissionGate;
use crate::settings::{
    BRIGHTNESS_MODE_AUTOMATIC, BRIGHTNESS_MODE_MANUAL, SettingKey, SystemSettings,
};

pub struct BrightnessChannel<S, G> {
    settings: S,
    gate: G,
    min: i32,
    max: i32,
    last: AtomicI32,
}

impl<S: SystemSettings, G: PermissionGate> BrightnessChannel<S, G> {
    pub fn new(settings: S, gate: G, min: i32, max: i32) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self {
            settings,
            gate,
            min,
            max,
            last: AtomicI32::new(min),
        }
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }

    /// Forces the brightness mode to manual when it is automatic.
    ///
    /// A device without the mode key is treated as manual.
    async fn disable_auto_mode(&self) {
        match self.settings.get_int(SettingKey::ScreenBrightnessMode).await {
            Ok(BRIGHTNESS_MODE_AUTOMATIC) => {
                match self
                    .settings
                    .put_int(SettingKey::ScreenBrightnessMode, BRIGHTNESS_MODE_MANUAL)
                    .await
                {
                    Ok(()) => log::info!("Auto brightness overridden to manual"),
                    Err(e) => log::warn!("Failed to disable auto brightness: {}", e),
                }
            }
            Ok(_) => {}
            Err(SettingError::NotFound(key)) => {
                log::debug!("No {} on this device, treating auto brightness as off", key);
            }
            Err(e) => log::warn!("Could not read brightness mode: {}", e),
        }
    }

    fn deny(&self) -> WriteError {
        self.gate.request_permission();
        WriteError::PermissionDenied
    }
}

#[async_trait]
impl<S: SystemSettings, G: PermissionGate> SettingChannel for BrightnessChannel<S, G> {
    fn name(&self) -> &str {
        "brightness"
    }

    fn min(&self) -> i32 {
        self.min
    }

    fn max(&self) -> i32 {
        self.max
    }

    async fn read(&self) -> i32 {
        let value = self.read_raw().await.clamp(self.min, self.max);
        self.last.store(value, Ordering::Relaxed);
        value
    }

    async fn read_raw(&self) -> i32 {
        match self.settings.get_int(SettingKey::ScreenBrightness).await {
            Ok(value) => value,
            Err(e) => {
                let last = self.last.load(Ordering::Relaxed);
                log::warn!("Could not read brightness ({}), using last value {}", e, last);
                last
            }
        }
    }

    async fn write(&self, value: i32) -> Result<(), WriteError> {
        let target = self.clamp(value);
        if !self.settings.can_write().await {
            return Err(self.deny());
        }
        match self.settings.put_int(SettingKey::ScreenBrightness, target).await {
            Ok(()) => {}
            Err(SettingError::PermissionDenied(_)) => return Err(self.deny()),
            Err(e) => return Err(e.into()),
        }
        self.last.store(target, Ordering::Relaxed);
        log::debug!("Brightness set to {}", target);
        self.disable_auto_mode().await;
        Ok(())
    }

    async fn is_writable(&self) -> bool {
        self.settings.can_write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySettings, RecordingGate};

    fn channel(settings: MemorySettings) -> BrightnessChannel<MemorySettings, RecordingGate> {
        BrightnessChannel::new(settings, RecordingGate::default(), 0, 255)
    }

    #[tokio::test]
    async fn denied_write_requests_permission_once_and_keeps_value() {
        let ch = channel(MemorySettings::new(120).with_write_permission(false));
        assert_eq!(ch.write(50).await, Err(WriteError::PermissionDenied));
        assert_eq!(ch.gate().requests(), 1);
        assert_eq!(ch.read().await, 120);
    }

    #[tokio::test]
    async fn write_disables_auto_mode() {
        let ch = channel(MemorySettings::new(120).with_auto_mode(true));
        ch.write(80).await.unwrap();
        assert_eq!(ch.read().await, 80);
        assert_eq!(
            ch.settings().get_int(SettingKey::ScreenBrightnessMode).await.unwrap(),
            BRIGHTNESS_MODE_MANUAL
        );
    }

    #[tokio::test]
    async fn missing_mode_key_does_not_fail_write() {
        let ch = channel(MemorySettings::new(120).without_mode_key());
        ch.write(90).await.unwrap();
        assert_eq!(ch.read().await, 90);
        assert_eq!(ch.gate().requests(), 0);
    }

    #[tokio::test]
    async fn writes_clamp_into_range() {
        let ch = BrightnessChannel::new(MemorySettings::new(120), RecordingGate::default(), 10, 200);
        ch.write(1600).await.unwrap();
        assert_eq!(ch.read().await, 200);
        ch.write(0).await.unwrap();
        assert_eq!(ch.read().await, 10);
    }

    #[tokio::test]
    async fn panel_below_min_reads_as_min() {
        let ch = BrightnessChannel::new(MemorySettings::new(0), RecordingGate::default(), 1, 255);
        assert_eq!(ch.read().await, 1);
        assert_eq!(ch.read_raw().await, 0);
    }

    #[tokio::test]
    async fn denial_from_the_device_also_requests_permission() {
        let settings = MemorySettings::new(120);
        settings.deny_next_write();
        let ch = channel(settings);
        assert_eq!(ch.write(60).await, Err(WriteError::PermissionDenied));
        assert_eq!(ch.gate().requests(), 1);
        assert_eq!(ch.read().await, 120);
    }
}
