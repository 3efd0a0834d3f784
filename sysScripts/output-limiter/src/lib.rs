//! Output Limiter (output-limiter)
//!
//! Keeps media volume and screen brightness where you put them.
//! 1. Each setting is a `SettingChannel` over a device service (`wpctl`, sysfs backlight).
//! 2. A `LockController` captures a channel's value and re-asserts it on a fixed interval,
//!    undoing hardware keys, other apps and stray slider drags.
//! 3. Brightness writes are gated on write permission and switch auto brightness off.

pub mod audio;
pub mod brightness;
pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod lock;
pub mod memory;
pub mod permission;
pub mod settings;
pub mod volume;

pub use channel::SettingChannel;
pub use error::{ControllerError, SettingError, WriteError};
pub use lock::{ControllerEvent, LockController, LockState};
