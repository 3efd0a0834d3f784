//! Headless host for the two limiters.
//!
//! Commands arrive one per line on stdin; `SIGUSR1` / `SIGUSR2` toggle the
//! volume / brightness lock so a bar or keybinding can drive the daemon.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

use crate::channel::{SettingChannel, step_size};
use crate::error::ControllerError;
use crate::lock::{ControllerEvent, LockController, LockState};

// --- Channels & Signals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    Volume,
    Brightness,
}

impl ChannelId {
    /// Signal that toggles this channel's lock in a running daemon.
    pub fn toggle_signal(self) -> SignalKind {
        match self {
            ChannelId::Volume => SignalKind::user_defined1(),
            ChannelId::Brightness => SignalKind::user_defined2(),
        }
    }

    /// `kill` spelling of [`ChannelId::toggle_signal`].
    pub fn kill_signal(self) -> &'static str {
        match self {
            ChannelId::Volume => "-USR1",
            ChannelId::Brightness => "-USR2",
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Volume => write!(f, "volume"),
            ChannelId::Brightness => write!(f, "brightness"),
        }
    }
}

impl FromStr for ChannelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "volume" | "vol" => Ok(ChannelId::Volume),
            "brightness" | "bri" => Ok(ChannelId::Brightness),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// PIDs from `pgrep` output that belong to a daemon, i.e. everything but `own_pid`.
///
/// `pgrep -x output-limiter` also lists the `toggle` invocation asking.
pub fn daemon_pids(pgrep_output: &str, own_pid: u32) -> Vec<u32> {
    pgrep_output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .collect()
}

// --- Commands ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Toggle(ChannelId),
    Lock(ChannelId),
    Unlock(ChannelId),
    Set(ChannelId, i32),
    Up(ChannelId),
    Down(ChannelId),
    Status,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let channel = |i: usize| -> Result<ChannelId, String> {
            words
                .get(i)
                .ok_or_else(|| format!("'{}' needs a channel", words[0]))?
                .parse()
        };
        match words.first().copied() {
            None => Err("empty command".to_string()),
            Some("status") => Ok(Command::Status),
            Some("quit") | Some("exit") => Ok(Command::Quit),
            Some("toggle") => Ok(Command::Toggle(channel(1)?)),
            Some("lock") => Ok(Command::Lock(channel(1)?)),
            Some("unlock") => Ok(Command::Unlock(channel(1)?)),
            Some("up") => Ok(Command::Up(channel(1)?)),
            Some("down") => Ok(Command::Down(channel(1)?)),
            Some("set") => {
                let id = channel(1)?;
                let value = words
                    .get(2)
                    .ok_or_else(|| "'set' needs a value".to_string())?
                    .parse::<i32>()
                    .map_err(|e| format!("bad value: {}", e))?;
                Ok(Command::Set(id, value))
            }
            Some(other) => Err(format!("unknown command '{}'", other)),
        }
    }
}

// --- Status (Waybar) ---

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChannelStatus {
    pub name: String,
    pub value: i32,
    pub min: i32,
    pub max: i32,
    /// `None` when no controller is attached (one-shot `status`).
    pub lock: Option<LockState>,
}

/// Waybar custom-module payload with the per-channel details attached.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusReport {
    pub text: String,
    pub tooltip: String,
    pub class: String,
    pub channels: Vec<ChannelStatus>,
}

/// Snapshot of one channel for the status report.
pub async fn channel_status(channel: &dyn SettingChannel, lock: Option<LockState>) -> ChannelStatus {
    ChannelStatus {
        name: channel.name().to_string(),
        value: channel.read().await,
        min: channel.min(),
        max: channel.max(),
        lock,
    }
}

/// Builds the Waybar payload: a lock icon per locked channel, class `locked`
/// when any lock is engaged.
pub fn build_report(channels: Vec<ChannelStatus>) -> StatusReport {
    let locked = channels
        .iter()
        .any(|c| c.lock.map(|l| l.engaged()).unwrap_or(false));
    let text = channels
        .iter()
        .map(|c| {
            let icon = match c.lock {
                Some(l) if l.engaged() => "🔒",
                _ => "",
            };
            format!("{} {} {}", c.name, c.value, icon).trim_end().to_string()
        })
        .collect::<Vec<_>>()
        .join("  ");
    let tooltip = channels
        .iter()
        .map(|c| match c.lock.and_then(|l| l.captured_value()) {
            Some(v) => format!("{}: {}/{} (locked at {})", c.name, c.value, c.max, v),
            None => format!("{}: {}/{}", c.name, c.value, c.max),
        })
        .collect::<Vec<_>>()
        .join("\n");
    StatusReport {
        text,
        tooltip,
        class: if locked { "locked" } else { "unlocked" }.to_string(),
        channels,
    }
}

// --- Limiter ---

struct Slot {
    channel: Arc<dyn SettingChannel>,
    controller: LockController,
    steps: u32,
}

/// Controllers for whichever channels are enabled.
pub struct Limiter {
    volume: Option<Slot>,
    brightness: Option<Slot>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done(String),
    Status(StatusReport),
    Quit,
}

impl Default for Limiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Limiter {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            volume: None,
            brightness: None,
            events_tx,
            events_rx,
        }
    }

    /// Starts a lock controller for `channel` and routes its events into the limiter.
    pub fn attach(&mut self, id: ChannelId, channel: Arc<dyn SettingChannel>, interval: Duration, steps: u32) {
        let (controller, mut events) = LockController::spawn(channel.clone(), interval);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        let slot = Slot {
            channel,
            controller,
            steps,
        };
        let old = match id {
            ChannelId::Volume => self.volume.replace(slot),
            ChannelId::Brightness => self.brightness.replace(slot),
        };
        if let Some(old) = old {
            tokio::spawn(old.controller.shutdown());
        }
    }

    /// Controller for `id`, if that channel is enabled.
    pub fn controller(&self, id: ChannelId) -> Option<&LockController> {
        self.slot(id).map(|s| &s.controller)
    }

    fn slot(&self, id: ChannelId) -> Option<&Slot> {
        match id {
            ChannelId::Volume => self.volume.as_ref(),
            ChannelId::Brightness => self.brightness.as_ref(),
        }
    }

    fn require(&self, id: ChannelId) -> Result<&Slot, String> {
        self.slot(id).ok_or_else(|| format!("{} is disabled", id))
    }

    /// Next controller event, once one is available.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        self.events_rx.recv().await
    }

    /// Status of every enabled channel, with its lock state.
    pub async fn status(&self) -> StatusReport {
        let mut channels = Vec::new();
        for slot in [&self.volume, &self.brightness].into_iter().flatten() {
            let lock = Some(slot.controller.state());
            channels.push(channel_status(slot.channel.as_ref(), lock).await);
        }
        build_report(channels)
    }

    /// Runs one command. Rejections come back as `Err` with a user-facing message.
    pub async fn execute(&self, command: Command) -> Result<Reply, String> {
        let describe = |id: ChannelId, state: LockState| match state.captured_value() {
            Some(v) => format!("{} locked at {}", id, v),
            None => format!("{} unlocked", id),
        };
        let err = |e: ControllerError| e.to_string();
        match command {
            Command::Status => Ok(Reply::Status(self.status().await)),
            Command::Quit => Ok(Reply::Quit),
            Command::Toggle(id) => {
                let state = self.require(id)?.controller.toggle().await.map_err(err)?;
                Ok(Reply::Done(describe(id, state)))
            }
            Command::Lock(id) | Command::Unlock(id) => {
                let engage = matches!(command, Command::Lock(_));
                let state = self.require(id)?.controller.set_engaged(engage).await.map_err(err)?;
                Ok(Reply::Done(describe(id, state)))
            }
            Command::Set(id, value) => {
                let slot = self.require(id)?;
                slot.controller.user_write(value).await.map_err(err)?;
                Ok(Reply::Done(format!("{} set to {}", id, slot.channel.clamp(value))))
            }
            Command::Up(id) | Command::Down(id) => {
                let slot = self.require(id)?;
                let step = step_size(slot.channel.min(), slot.channel.max(), slot.steps);
                let delta = if matches!(command, Command::Up(_)) { step } else { -step };
                let value = slot.controller.step(delta).await.map_err(err)?;
                Ok(Reply::Done(format!("{} set to {}", id, value)))
            }
        }
    }

    /// Shuts every controller down, cancelling their timers.
    pub async fn shutdown(self) {
        for slot in [self.volume, self.brightness].into_iter().flatten() {
            slot.controller.shutdown().await;
        }
    }
}

// --- Mode: Daemon ---

/// Prints a reply on stdout: plain text, or JSON for `status`.
fn print_reply(reply: &Reply) -> Result<()> {
    match reply {
        Reply::Done(message) => println!("{}", message),
        Reply::Status(report) => println!("{}", serde_json::to_string(report)?),
        Reply::Quit => {}
    }
    Ok(())
}

/// Handles SIGUSR1 / SIGUSR2. Failures are logged, never fatal.
async fn toggle_from_signal(limiter: &Limiter, id: ChannelId) {
    match limiter.execute(Command::Toggle(id)).await {
        Ok(reply) => {
            if let Err(e) = print_reply(&reply) {
                log::warn!("Failed to print reply: {}", e);
            }
        }
        Err(e) => log::warn!("Toggle {} failed: {}", id, e),
    }
}

/// Serves commands and signals until `quit`, SIGTERM or SIGINT.
pub async fn serve(mut limiter: Limiter, read_stdin: bool) -> Result<()> {
    let mut usr1 = signal(ChannelId::Volume.toggle_signal()).context("Failed to listen for SIGUSR1")?;
    let mut usr2 = signal(ChannelId::Brightness.toggle_signal()).context("Failed to listen for SIGUSR2")?;
    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut int = signal(SignalKind::interrupt()).context("Failed to listen for SIGINT")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = read_stdin;
    log::info!("Output limiter running");

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Command>() {
                        Ok(command) => match limiter.execute(command).await {
                            Ok(Reply::Quit) => break,
                            Ok(reply) => print_reply(&reply)?,
                            Err(e) => println!("error: {}", e),
                        },
                        Err(e) => {
                            log::debug!("Rejected command line {:?}", line);
                            println!("error: {}", e);
                        }
                    }
                }
                Ok(None) => {
                    log::debug!("stdin closed, continuing on signals only");
                    stdin_open = false;
                }
                Err(e) => {
                    log::warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            _ = usr1.recv() => toggle_from_signal(&limiter, ChannelId::Volume).await,
            _ = usr2.recv() => toggle_from_signal(&limiter, ChannelId::Brightness).await,
            Some(event) = limiter.next_event() => match event {
                ControllerEvent::Corrected { channel, from, to } => {
                    log::debug!("{} drift corrected ({} -> {})", channel, from, to);
                }
                ControllerEvent::PermissionRequired { channel } => {
                    log::warn!("{} lock paused until write permission is restored", channel);
                }
            },
            _ = term.recv() => break,
            _ = int.recv() => break,
        }
    }

    log::info!("Shutting down");
    limiter.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VolumeFlags;
    use crate::brightness::BrightnessChannel;
    use crate::memory::{MemoryAudio, MemorySettings, RecordingGate};
    use crate::volume::VolumeChannel;

    #[test]
    fn parses_commands() {
        assert_eq!("toggle volume".parse(), Ok(Command::Toggle(ChannelId::Volume)));
        assert_eq!("lock bri".parse(), Ok(Command::Lock(ChannelId::Brightness)));
        assert_eq!("set volume 7".parse(), Ok(Command::Set(ChannelId::Volume, 7)));
        assert_eq!("  down   brightness ".parse(), Ok(Command::Down(ChannelId::Brightness)));
        assert_eq!("status".parse(), Ok(Command::Status));
        assert_eq!("exit".parse(), Ok(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!("".parse::<Command>().is_err());
        assert!("toggle".parse::<Command>().is_err());
        assert!("toggle bass".parse::<Command>().is_err());
        assert!("set volume".parse::<Command>().is_err());
        assert!("set volume loud".parse::<Command>().is_err());
        assert!("reboot".parse::<Command>().is_err());
    }

    #[test]
    fn report_marks_locked_channels() {
        let report = build_report(vec![
            ChannelStatus {
                name: "volume".into(),
                value: 7,
                min: 0,
                max: 15,
                lock: Some(LockState::default()),
            },
            ChannelStatus {
                name: "brightness".into(),
                value: 120,
                min: 1,
                max: 255,
                lock: None,
            },
        ]);
        assert_eq!(report.class, "unlocked");
        assert_eq!(report.tooltip, "volume: 7/15\nbrightness: 120/255");
    }

    fn limiter_with_memory() -> (Limiter, MemoryAudio, MemorySettings) {
        let audio = MemoryAudio::new(15, 7);
        let settings = MemorySettings::new(120);
        let mut limiter = Limiter::new();
        limiter.attach(
            ChannelId::Volume,
            Arc::new(VolumeChannel::new(audio.clone(), VolumeFlags::default())),
            Duration::from_millis(250),
            9,
        );
        limiter.attach(
            ChannelId::Brightness,
            Arc::new(BrightnessChannel::new(settings.clone(), RecordingGate::default(), 1, 255)),
            Duration::from_millis(500),
            9,
        );
        (limiter, audio, settings)
    }

    #[tokio::test(start_paused = true)]
    async fn step_commands_move_by_one_slider_step() {
        let (limiter, audio, settings) = limiter_with_memory();
        limiter.execute(Command::Up(ChannelId::Volume)).await.unwrap();
        assert_eq!(audio.level(), 9);
        limiter.execute(Command::Down(ChannelId::Brightness)).await.unwrap();
        assert_eq!(settings.brightness(), 120 - step_size(1, 255, 9));
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn step_commands_are_rejected_while_locked() {
        let (limiter, audio, _settings) = limiter_with_memory();
        limiter.execute(Command::Lock(ChannelId::Volume)).await.unwrap();
        let err = limiter.execute(Command::Up(ChannelId::Volume)).await.unwrap_err();
        assert_eq!(err, "volume is locked");
        assert_eq!(audio.level(), 7);
        limiter.shutdown().await;
    }

    #[test]
    fn daemon_pids_skip_the_caller() {
        assert_eq!(daemon_pids("4121\n4388\n", 4388), vec![4121]);
        assert_eq!(daemon_pids("4121\n4388\n5002\n", 4388), vec![4121, 5002]);
    }

    #[test]
    fn only_the_caller_means_no_daemon() {
        assert!(daemon_pids("4388\n", 4388).is_empty());
        assert!(daemon_pids("", 4388).is_empty());
        assert!(daemon_pids("  \nnot-a-pid\n", 4388).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn locked_channel_rejects_set_and_reports_in_status() {
        let (limiter, audio, _settings) = limiter_with_memory();
        limiter.execute(Command::Lock(ChannelId::Volume)).await.unwrap();
        let err = limiter.execute(Command::Set(ChannelId::Volume, 2)).await.unwrap_err();
        assert_eq!(err, "volume is locked");
        assert_eq!(audio.level(), 7);

        match limiter.execute(Command::Status).await.unwrap() {
            Reply::Status(report) => {
                assert_eq!(report.class, "locked");
                assert_eq!(report.channels[0].lock.and_then(|l| l.captured_value()), Some(7));
            }
            other => panic!("unexpected reply {:?}", other),
        }
        limiter.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_channel_is_reported() {
        let mut limiter = Limiter::new();
        limiter.attach(
            ChannelId::Volume,
            Arc::new(VolumeChannel::new(MemoryAudio::new(15, 7), VolumeFlags::default())),
            Duration::from_millis(250),
            9,
        );
        let err = limiter.execute(Command::Toggle(ChannelId::Brightness)).await.unwrap_err();
        assert_eq!(err, "brightness is disabled");
        limiter.shutdown().await;
    }
}
