//! Typed errors for channels, device services and lock controllers.
//!
//! Out-of-range values are not an error anywhere in this crate: channels clamp
//! them into the device range before writing.

use std::io;

use thiserror::Error;

use crate::settings::SettingKey;

/// Failure of a [`SettingChannel::write`](crate::channel::SettingChannel::write).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The system-settings write capability is not granted.
    #[error("write permission for system settings is not granted")]
    PermissionDenied,
    /// The device service refused or failed the write.
    #[error("device rejected write: {0}")]
    Device(String),
}

/// Errors reported by the device services behind a channel.
#[derive(Debug, Error)]
pub enum SettingError {
    /// The device reports no value for the key.
    #[error("setting '{0}' not found")]
    NotFound(SettingKey),
    #[error("permission denied writing '{0}'")]
    PermissionDenied(SettingKey),
    #[error("device i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected output from {command}: {output:?}")]
    Parse {
        command: &'static str,
        output: String,
    },
    #[error("{command} exited with {status}: {stderr}")]
    Command {
        command: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

impl From<SettingError> for WriteError {
    fn from(err: SettingError) -> Self {
        match err {
            SettingError::PermissionDenied(_) => WriteError::PermissionDenied,
            other => WriteError::Device(other.to_string()),
        }
    }
}

/// Errors returned by a [`LockController`](crate::lock::LockController).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    /// User input was rejected because the channel is locked.
    #[error("{0} is locked")]
    Locked(String),
    #[error(transparent)]
    Write(#[from] WriteError),
    /// The controller task is no longer running.
    #[error("lock controller for {0} has shut down")]
    Closed(String),
}
