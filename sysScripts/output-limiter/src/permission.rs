//! Permission gate for brightness writes.

use notify_rust::{Notification, Timeout, Urgency};

/// Asks the user to grant the system-settings write capability.
///
/// Called by the brightness channel whenever a write is refused.
pub trait PermissionGate: Send + Sync {
    fn request_permission(&self);
}

/// Desktop notification explaining how to unlock the backlight.
pub struct NotifyGate {
    icon: String,
    device: String,
}

impl NotifyGate {
    pub fn new(icon: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            icon: icon.into(),
            device: device.into(),
        }
    }

    fn body(&self) -> String {
        format!(
            "Brightness control needs write access to {}.\n\
             Add your user to the 'video' group or install a backlight udev rule.\n\
             Auto brightness will also be disabled.",
            self.device
        )
    }
}

impl PermissionGate for NotifyGate {
    fn request_permission(&self) {
        log::warn!("Requesting write permission for {}", self.device);
        let body = self.body();
        let icon = self.icon.clone();
        std::thread::spawn(move || {
            if let Err(e) = Notification::new()
                .summary("Permission Request")
                .body(&body)
                .icon(&icon)
                .urgency(Urgency::Critical)
                .show()
            {
                log::warn!("Failed to show permission notification: {}", e);
            }
        });
    }
}

/// What the user chose in the startup permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Grant,
    Exit,
    /// The notification server could not show the prompt.
    Unavailable,
}

/// Maps a notification action id to the user's choice.
///
/// Dismissing the prompt counts as declining.
pub fn outcome_for_action(action: &str) -> PromptOutcome {
    match action {
        "grant" => PromptOutcome::Grant,
        _ => PromptOutcome::Exit,
    }
}

/// Shows the blocking "Grant / Exit" prompt. Run it on a blocking thread.
pub fn prompt_blocking(icon: &str, device: &str) -> PromptOutcome {
    let handle = Notification::new()
        .summary("Permission Request")
        .body(&format!(
            "In order to control brightness, write access to {} is required.\n\
             Auto brightness will also be disabled.",
            device
        ))
        .icon(icon)
        .urgency(Urgency::Critical)
        .timeout(Timeout::Never)
        .action("grant", "Confirm")
        .action("exit", "Exit")
        .show();
    match handle {
        Ok(handle) => {
            let mut outcome = PromptOutcome::Exit;
            handle.wait_for_action(|action| outcome = outcome_for_action(action));
            outcome
        }
        Err(e) => {
            log::warn!("Failed to show permission prompt: {}", e);
            PromptOutcome::Unavailable
        }
    }
}
