//! Output Limiter (output-limiter)
//!
//! Usage:
//!   output-limiter [run] [--dry-run] [--no-stdin]  => Daemon: locks, stdin commands, signal toggles.
//!   output-limiter status                          => Prints JSON for Waybar.
//!   output-limiter toggle <volume|brightness>      => Signals the running daemon to flip a lock.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use output_limiter::audio::{VolumeFlags, WpctlAudio};
use output_limiter::brightness::BrightnessChannel;
use output_limiter::channel::SettingChannel;
use output_limiter::config::{self, BrightnessConfig, LimiterConfig};
use output_limiter::host::{self, ChannelId, Limiter};
use output_limiter::memory::{MemoryAudio, MemorySettings, RecordingGate};
use output_limiter::permission::{self, NotifyGate, PromptOutcome};
use output_limiter::settings::{SysfsSettings, SystemSettings};
use output_limiter::volume::VolumeChannel;

const PROCESS_NAME: &str = "output-limiter";

// --- CLI ---

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Run the limiter daemon.
    Run {
        /// Use in-memory devices instead of wpctl and sysfs.
        #[arg(long)]
        dry_run: bool,
        /// Ignore stdin; only signals drive the locks.
        #[arg(long)]
        no_stdin: bool,
    },
    /// Print the current levels as Waybar JSON.
    Status,
    /// Toggle a lock in the running daemon.
    Toggle {
        #[arg(value_parser = parse_channel)]
        channel: ChannelId,
    },
}

/// clap value parser for `toggle <channel>`.
fn parse_channel(s: &str) -> Result<ChannelId, String> {
    s.parse()
}

// --- Device Wiring ---

/// Opens the configured backlight, or the first one found.
fn open_sysfs(config: &BrightnessConfig) -> Result<SysfsSettings> {
    SysfsSettings::open(
        Path::new(SysfsSettings::BACKLIGHT_ROOT),
        config.device.as_deref(),
        config.mode_schema.clone(),
        config.mode_key.clone(),
    )
}

/// Volume channel over the configured `wpctl` sink.
fn volume_channel(config: &LimiterConfig) -> Arc<dyn SettingChannel> {
    let audio = WpctlAudio::new(config.volume.sink.clone(), config.volume.max_level);
    let flags = VolumeFlags {
        show_ui: config.volume.show_ui,
    };
    Arc::new(VolumeChannel::new(audio, flags))
}

/// Returns `None` when brightness cannot be controlled this session.
/// Exits the process when the user declines the permission prompt.
async fn brightness_channel(config: &BrightnessConfig) -> Result<Option<Arc<dyn SettingChannel>>> {
    let settings = match open_sysfs(config) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Brightness disabled: {:#}", e);
            return Ok(None);
        }
    };
    let max = settings.max_brightness()?;
    let device = settings.brightness_path().display().to_string();

    if !settings.can_write().await {
        let icon = config.icon.clone();
        let prompt_device = device.clone();
        let outcome = tokio::task::spawn_blocking(move || permission::prompt_blocking(&icon, &prompt_device))
            .await
            .context("Permission prompt thread failed")?;
        match outcome {
            PromptOutcome::Grant => run_grant_command(config.grant_command.as_deref()).await,
            PromptOutcome::Exit if config.exit_on_decline => {
                log::error!("Brightness permission declined, exiting");
                std::process::exit(1);
            }
            PromptOutcome::Exit => log::warn!("Brightness permission declined, writes will be refused"),
            PromptOutcome::Unavailable => {
                log::warn!("Brightness disabled: could not ask for write permission");
                return Ok(None);
            }
        }
    }

    let gate = NotifyGate::new(config.icon.clone(), device);
    Ok(Some(Arc::new(BrightnessChannel::new(settings, gate, config.min, max))))
}

/// Runs the user's `grant_command` (e.g. a udev rule installer) through `sh -c`.
async fn run_grant_command(command: Option<&str>) {
    let Some(command) = command else {
        log::info!("No grant_command configured, waiting for permission to be granted");
        return;
    };
    match tokio::process::Command::new("sh").arg("-c").arg(command).status().await {
        Ok(status) if status.success() => log::info!("Grant command succeeded"),
        Ok(status) => log::warn!("Grant command exited with {}", status),
        Err(e) => log::warn!("Failed to run grant command: {}", e),
    }
}

/// Attaches a controller for each enabled channel.
/// `dry_run` swaps the devices for in-memory ones.
async fn build_limiter(config: &LimiterConfig, dry_run: bool) -> Result<Limiter> {
    let mut limiter = Limiter::new();
    if config.volume.enabled {
        let channel: Arc<dyn SettingChannel> = if dry_run {
            let audio = MemoryAudio::new(config.volume.max_level, config.volume.max_level / 2);
            Arc::new(VolumeChannel::new(audio, VolumeFlags::default()))
        } else {
            volume_channel(config)
        };
        limiter.attach(ChannelId::Volume, channel, config.volume.interval(), config.volume.steps);
    }
    if config.brightness.enabled {
        let channel: Option<Arc<dyn SettingChannel>> = if dry_run {
            let settings = MemorySettings::new(128).with_auto_mode(true);
            Some(Arc::new(BrightnessChannel::new(
                settings,
                RecordingGate::default(),
                config.brightness.min,
                255,
            )))
        } else {
            brightness_channel(&config.brightness).await?
        };
        if let Some(channel) = channel {
            limiter.attach(
                ChannelId::Brightness,
                channel,
                config.brightness.interval(),
                config.brightness.steps,
            );
        }
    }
    Ok(limiter)
}

// --- Mode: Status (Read-Only) ---

/// Prints the current levels as Waybar JSON. Never writes.
async fn run_status(config: &LimiterConfig) -> Result<()> {
    let mut channels = Vec::new();
    if config.volume.enabled {
        channels.push(host::channel_status(volume_channel(config).as_ref(), None).await);
    }
    if config.brightness.enabled {
        match open_sysfs(&config.brightness) {
            Ok(settings) => {
                let max = settings.max_brightness()?;
                let channel = BrightnessChannel::new(settings, RecordingGate::default(), config.brightness.min, max);
                channels.push(host::channel_status(&channel, None).await);
            }
            Err(e) => log::warn!("Skipping brightness: {:#}", e),
        }
    }
    let report = host::build_report(channels);
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

// --- Mode: Toggle ---

/// Sends the channel's toggle signal to the running daemon.
///
/// `pkill -x` would signal this process as well, so the daemon PIDs are
/// looked up with `pgrep` and signalled one by one.
fn run_toggle(channel: ChannelId) -> Result<()> {
    let output = Command::new("pgrep")
        .arg("-x")
        .arg(PROCESS_NAME)
        .output()
        .context("Failed to run pgrep")?;
    // Exit 1 only means "no match".
    if !output.status.success() && output.status.code() != Some(1) {
        return Err(anyhow!(
            "pgrep failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let pids = host::daemon_pids(&String::from_utf8_lossy(&output.stdout), std::process::id());
    if pids.is_empty() {
        return Err(anyhow!("{} is not running", PROCESS_NAME));
    }
    for pid in pids {
        let status = Command::new("kill")
            .arg(channel.kill_signal())
            .arg(pid.to_string())
            .status()
            .context("Failed to run kill")?;
        if !status.success() {
            return Err(anyhow!("Failed to signal {} (pid {})", PROCESS_NAME, pid));
        }
    }
    Ok(())
}

// --- Main ---

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = config::load_config(&config::config_path()?)?;

    match args.command.unwrap_or(Mode::Run {
        dry_run: false,
        no_stdin: false,
    }) {
        Mode::Run { dry_run, no_stdin } => {
            let limiter = build_limiter(&config, dry_run).await?;
            host::serve(limiter, !no_stdin).await?;
        }
        Mode::Status => run_status(&config).await?,
        Mode::Toggle { channel } => run_toggle(channel)?,
    }
    Ok(())
}
