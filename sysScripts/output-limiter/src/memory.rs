//! In-memory device services.
//!
//! Used by `run --dry-run` and by tests. Clones share state, so a test can keep
//! one handle to play the "external actor" while the channel owns another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::audio::{AudioService, VolumeFlags};
use crate::error::SettingError;
use crate::permission::PermissionGate;
use crate::settings::{BRIGHTNESS_MODE_AUTOMATIC, BRIGHTNESS_MODE_MANUAL, SettingKey, SystemSettings};

const FLAGS_NONE: u8 = 0;
const FLAGS_QUIET: u8 = 1;
const FLAGS_SHOW_UI: u8 = 2;

#[derive(Debug)]
struct AudioState {
    max: i32,
    level: AtomicI32,
    set_calls: AtomicUsize,
    last_flags: AtomicU8,
}

#[derive(Debug, Clone)]
pub struct MemoryAudio {
    state: Arc<AudioState>,
}

impl MemoryAudio {
    pub fn new(max: i32, level: i32) -> Self {
        Self {
            state: Arc::new(AudioState {
                max,
                level: AtomicI32::new(level),
                set_calls: AtomicUsize::new(0),
                last_flags: AtomicU8::new(FLAGS_NONE),
            }),
        }
    }

    /// Changes the level behind the channel's back (hardware keys, other apps).
    pub fn set_external(&self, level: i32) {
        self.state.level.store(level, Ordering::SeqCst);
    }

    pub fn level(&self) -> i32 {
        self.state.level.load(Ordering::SeqCst)
    }

    pub fn set_calls(&self) -> usize {
        self.state.set_calls.load(Ordering::SeqCst)
    }

    pub fn last_flags(&self) -> Option<VolumeFlags> {
        match self.state.last_flags.load(Ordering::SeqCst) {
            FLAGS_QUIET => Some(VolumeFlags { show_ui: false }),
            FLAGS_SHOW_UI => Some(VolumeFlags { show_ui: true }),
            _ => None,
        }
    }
}

#[async_trait]
impl AudioService for MemoryAudio {
    async fn current_level(&self) -> Result<i32, SettingError> {
        Ok(self.level())
    }

    async fn set_level(&self, level: i32, flags: VolumeFlags) -> Result<(), SettingError> {
        self.state.level.store(level, Ordering::SeqCst);
        self.state.set_calls.fetch_add(1, Ordering::SeqCst);
        let flags = if flags.show_ui { FLAGS_SHOW_UI } else { FLAGS_QUIET };
        self.state.last_flags.store(flags, Ordering::SeqCst);
        Ok(())
    }

    fn max_level(&self) -> i32 {
        self.state.max
    }
}

#[derive(Debug)]
struct SettingsState {
    brightness: AtomicI32,
    mode: AtomicI32,
    has_mode_key: AtomicBool,
    can_write: AtomicBool,
    deny_next_write: AtomicBool,
    writes: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct MemorySettings {
    state: Arc<SettingsState>,
}

impl MemorySettings {
    pub fn new(brightness: i32) -> Self {
        Self {
            state: Arc::new(SettingsState {
                brightness: AtomicI32::new(brightness),
                mode: AtomicI32::new(BRIGHTNESS_MODE_MANUAL),
                has_mode_key: AtomicBool::new(true),
                can_write: AtomicBool::new(true),
                deny_next_write: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn with_write_permission(self, granted: bool) -> Self {
        self.set_write_permission(granted);
        self
    }

    pub fn with_auto_mode(self, auto: bool) -> Self {
        let mode = if auto { BRIGHTNESS_MODE_AUTOMATIC } else { BRIGHTNESS_MODE_MANUAL };
        self.state.mode.store(mode, Ordering::SeqCst);
        self
    }

    pub fn without_mode_key(self) -> Self {
        self.state.has_mode_key.store(false, Ordering::SeqCst);
        self
    }

    /// Grants or revokes the write capability at runtime.
    pub fn set_write_permission(&self, granted: bool) {
        self.state.can_write.store(granted, Ordering::SeqCst);
    }

    /// Makes the next brightness write fail as if the device refused it,
    /// even though `can_write` reports true.
    pub fn deny_next_write(&self) {
        self.state.deny_next_write.store(true, Ordering::SeqCst);
    }

    pub fn set_external(&self, brightness: i32) {
        self.state.brightness.store(brightness, Ordering::SeqCst);
    }

    pub fn brightness(&self) -> i32 {
        self.state.brightness.load(Ordering::SeqCst)
    }

    /// Number of accepted brightness writes.
    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SystemSettings for MemorySettings {
    async fn can_write(&self) -> bool {
        self.state.can_write.load(Ordering::SeqCst)
    }

    async fn get_int(&self, key: SettingKey) -> Result<i32, SettingError> {
        match key {
            SettingKey::ScreenBrightness => Ok(self.brightness()),
            SettingKey::ScreenBrightnessMode => {
                if self.state.has_mode_key.load(Ordering::SeqCst) {
                    Ok(self.state.mode.load(Ordering::SeqCst))
                } else {
                    Err(SettingError::NotFound(key))
                }
            }
        }
    }

    async fn put_int(&self, key: SettingKey, value: i32) -> Result<(), SettingError> {
        if !self.state.can_write.load(Ordering::SeqCst)
            || self.state.deny_next_write.swap(false, Ordering::SeqCst)
        {
            return Err(SettingError::PermissionDenied(key));
        }
        match key {
            SettingKey::ScreenBrightness => {
                self.state.brightness.store(value, Ordering::SeqCst);
                self.state.writes.fetch_add(1, Ordering::SeqCst);
            }
            SettingKey::ScreenBrightnessMode => {
                if !self.state.has_mode_key.load(Ordering::SeqCst) {
                    return Err(SettingError::NotFound(key));
                }
                self.state.mode.store(value, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Gate that only counts requests. `run --dry-run` logs them instead of notifying.
#[derive(Debug, Clone, Default)]
pub struct RecordingGate {
    requests: Arc<AtomicUsize>,
}

impl RecordingGate {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl PermissionGate for RecordingGate {
    fn request_permission(&self) {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        log::info!("Permission requested ({} so far)", n);
    }
}
