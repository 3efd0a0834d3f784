//! Lock controller: captures a channel's value and re-asserts it on a timer.
//!
//! Each controller is one tokio task that owns the [`LockState`], the channel
//! and, while locked, the correction interval. Toggles, user writes and timer
//! ticks are all handled on that task, one at a time. Unlocking drops the
//! interval, so an unlocked controller never wakes up.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::channel::SettingChannel;
use crate::error::{ControllerError, WriteError};

/// `captured_value` is `Some` exactly when the lock is engaged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockState {
    engaged: bool,
    captured_value: Option<i32>,
}

impl LockState {
    pub fn engaged(&self) -> bool {
        self.engaged
    }

    pub fn captured_value(&self) -> Option<i32> {
        self.captured_value
    }

    fn locked_at(value: i32) -> Self {
        Self {
            engaged: true,
            captured_value: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A tick found drift and wrote the captured value back.
    Corrected { channel: String, from: i32, to: i32 },
    /// A correction was refused for lack of permission. Emitted once per
    /// denial; correction resumes by itself once the channel is writable.
    PermissionRequired { channel: String },
}

enum Request {
    Toggle(oneshot::Sender<LockState>),
    SetEngaged(bool, oneshot::Sender<LockState>),
    UserWrite(i32, oneshot::Sender<Result<(), ControllerError>>),
    Step(i32, oneshot::Sender<Result<i32, ControllerError>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct LockController {
    name: String,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<LockState>,
    task: Option<JoinHandle<()>>,
}

impl LockController {
    /// Starts the controller task for `channel`, unlocked.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// carries [`ControllerEvent`]s; dropping it is fine.
    pub fn spawn(
        channel: Arc<dyn SettingChannel>,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let name = channel.name().to_string();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LockState::default());

        let actor = LockActor {
            channel,
            period: interval.max(Duration::from_millis(1)),
            state: LockState::default(),
            ticker: None,
            awaiting_permission: false,
            state_tx,
            events: event_tx,
        };
        let task = tokio::spawn(actor.run(req_rx));

        let controller = Self {
            name,
            requests: req_tx,
            state: state_rx,
            task: Some(task),
        };
        (controller, event_rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lock state.
    pub fn state(&self) -> LockState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LockState> {
        self.state.clone()
    }

    pub async fn toggle(&self) -> Result<LockState, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Toggle(tx))?;
        rx.await.map_err(|_| self.closed())
    }

    pub async fn set_engaged(&self, engaged: bool) -> Result<LockState, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::SetEngaged(engaged, tx))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Writes a user-chosen value. Rejected with [`ControllerError::Locked`]
    /// while the lock is engaged.
    pub async fn user_write(&self, value: i32) -> Result<(), ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::UserWrite(value, tx))?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Moves the value by `delta` from what the device reports now and
    /// returns the clamped result. Rejected while locked, like
    /// [`LockController::user_write`].
    pub async fn step(&self, delta: i32) -> Result<i32, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Step(delta, tx))?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Stops the task and its timer, then waits for it to exit.
    pub async fn shutdown(mut self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Lock controller for {} ended abnormally: {}", self.name, e);
                }
            }
        }
    }

    fn send(&self, request: Request) -> Result<(), ControllerError> {
        self.requests.send(request).map_err(|_| self.closed())
    }

    fn closed(&self) -> ControllerError {
        ControllerError::Closed(self.name.clone())
    }
}

impl Drop for LockController {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct LockActor {
    channel: Arc<dyn SettingChannel>,
    period: Duration,
    state: LockState,
    ticker: Option<Interval>,
    awaiting_permission: bool,
    state_tx: watch::Sender<LockState>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl LockActor {
    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => {
                        if !self.handle(request).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = next_tick(&mut self.ticker) => self.correct().await,
            }
        }
        self.ticker = None;
        log::debug!("Lock controller for {} stopped", self.channel.name());
    }

    /// Returns `false` once the controller should stop.
    async fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Toggle(reply) => {
                let engage = !self.state.engaged();
                self.set_engaged(engage).await;
                let _ = reply.send(self.state);
            }
            Request::SetEngaged(engage, reply) => {
                self.set_engaged(engage).await;
                let _ = reply.send(self.state);
            }
            Request::UserWrite(value, reply) => {
                let result = if self.state.engaged() {
                    Err(ControllerError::Locked(self.channel.name().to_string()))
                } else {
                    self.channel.write(value).await.map_err(ControllerError::from)
                };
                let _ = reply.send(result);
            }
            Request::Step(delta, reply) => {
                let _ = reply.send(self.step(delta).await);
            }
            Request::Shutdown(ack) => {
                self.disengage();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    async fn step(&self, delta: i32) -> Result<i32, ControllerError> {
        if self.state.engaged() {
            return Err(ControllerError::Locked(self.channel.name().to_string()));
        }
        let current = self.channel.read().await;
        let target = self.channel.clamp(current.saturating_add(delta));
        self.channel.write(target).await?;
        Ok(target)
    }

    async fn set_engaged(&mut self, engage: bool) {
        if engage == self.state.engaged() {
            return;
        }
        if engage {
            let value = self.channel.read().await;
            self.state = LockState::locked_at(value);
            let mut ticker = time::interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
            self.state_tx.send_replace(self.state);
            log::info!("Locked {} at {}", self.channel.name(), value);
        } else {
            self.disengage();
            log::info!("Unlocked {}", self.channel.name());
        }
    }

    fn disengage(&mut self) {
        self.ticker = None;
        self.awaiting_permission = false;
        self.state = LockState::default();
        self.state_tx.send_replace(self.state);
    }

    async fn correct(&mut self) {
        let Some(target) = self.state.captured_value() else {
            return;
        };
        if self.awaiting_permission {
            if !self.channel.is_writable().await {
                return;
            }
            self.awaiting_permission = false;
            log::info!("Write permission for {} restored, resuming correction", self.channel.name());
        }

        // Raw, so a device parked outside [min, max] still counts as drift.
        let live = self.channel.read_raw().await;
        if live == target {
            log::trace!("{} holds at {}", self.channel.name(), target);
            return;
        }
        match self.channel.write(target).await {
            Ok(()) => {
                log::info!("Corrected {} drift {} -> {}", self.channel.name(), live, target);
                let _ = self.events.send(ControllerEvent::Corrected {
                    channel: self.channel.name().to_string(),
                    from: live,
                    to: target,
                });
            }
            Err(WriteError::PermissionDenied) => {
                log::warn!("Correction of {} denied, waiting for permission", self.channel.name());
                self.awaiting_permission = true;
                let _ = self.events.send(ControllerEvent::PermissionRequired {
                    channel: self.channel.name().to_string(),
                });
            }
            Err(e) => log::warn!("Correction of {} failed: {}", self.channel.name(), e),
        }
    }
}

/// Resolves on the next tick, or never when there is no timer.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::VolumeFlags;
    use crate::memory::MemoryAudio;
    use crate::volume::VolumeChannel;

    const TICK: Duration = Duration::from_millis(250);

    fn volume(max: i32, level: i32) -> (MemoryAudio, Arc<dyn SettingChannel>) {
        let audio = MemoryAudio::new(max, level);
        let channel: Arc<dyn SettingChannel> = Arc::new(VolumeChannel::new(audio.clone(), VolumeFlags::default()));
        (audio, channel)
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_captures_and_releases() {
        let (_audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        assert_eq!(ctl.state(), LockState::default());

        let locked = ctl.toggle().await.unwrap();
        assert!(locked.engaged());
        assert_eq!(locked.captured_value(), Some(7));
        assert_eq!(ctl.state(), locked);

        let unlocked = ctl.toggle().await.unwrap();
        assert_eq!(unlocked, LockState::default());
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn set_engaged_does_not_recapture() {
        let (audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        ctl.set_engaged(true).await.unwrap();
        audio.set_external(3);
        let state = ctl.set_engaged(true).await.unwrap();
        assert_eq!(state.captured_value(), Some(7));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_write_rejected_while_locked() {
        let (audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        ctl.toggle().await.unwrap();
        assert_eq!(
            ctl.user_write(12).await,
            Err(ControllerError::Locked("volume".to_string()))
        );
        assert_eq!(audio.level(), 7);

        ctl.toggle().await.unwrap();
        ctl.user_write(12).await.unwrap();
        assert_eq!(audio.level(), 12);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn step_reads_and_writes_on_the_controller_task() {
        let (audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        assert_eq!(ctl.step(2).await, Ok(9));
        audio.set_external(14);
        assert_eq!(ctl.step(2).await, Ok(15));
        assert_eq!(ctl.step(-20).await, Ok(0));
        assert_eq!(audio.level(), 0);

        ctl.toggle().await.unwrap();
        assert_eq!(ctl.step(3).await, Err(ControllerError::Locked("volume".to_string())));
        assert_eq!(audio.level(), 0);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_correction_before_first_interval() {
        let (audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        ctl.toggle().await.unwrap();
        audio.set_external(3);
        time::sleep(TICK / 2).await;
        assert_eq!(audio.level(), 3);
        time::sleep(TICK).await;
        assert_eq!(audio.level(), 7);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_request_queue() {
        let (_audio, channel) = volume(15, 7);
        let (ctl, _events) = LockController::spawn(channel, TICK);
        let requests = ctl.requests.clone();
        ctl.shutdown().await;
        assert!(requests.is_closed());
    }
}
