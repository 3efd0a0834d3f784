use std::sync::atomic::{AtomicI32, Ordering};

use async_trait::async_trait;

use crate::audio::{AudioService, VolumeFlags};
use crate::channel::SettingChannel;
use crate::error::WriteError;

/// Media volume as a [`SettingChannel`]. No permission is needed to write it.
pub struct VolumeChannel<A> {
    audio: A,
    flags: VolumeFlags,
    last: AtomicI32,
}

impl<A: AudioService> VolumeChannel<A> {
    pub fn new(audio: A, flags: VolumeFlags) -> Self {
        Self {
            audio,
            flags,
            last: AtomicI32::new(0),
        }
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }
}

#[async_trait]
impl<A: AudioService> SettingChannel for VolumeChannel<A> {
    fn name(&self) -> &str {
        "volume"
    }

    fn min(&self) -> i32 {
        0
    }

    fn max(&self) -> i32 {
        self.audio.max_level()
    }

    async fn read(&self) -> i32 {
        let level = self.read_raw().await.clamp(self.min(), self.max());
        self.last.store(level, Ordering::Relaxed);
        level
    }

    /// An over-amplified sink (`wpctl` above 1.0) reads above `max` here.
    async fn read_raw(&self) -> i32 {
        match self.audio.current_level().await {
            Ok(level) => level,
            Err(e) => {
                let last = self.last.load(Ordering::Relaxed);
                log::warn!("Could not read volume ({}), using last level {}", e, last);
                last
            }
        }
    }

    async fn write(&self, value: i32) -> Result<(), WriteError> {
        let target = self.clamp(value);
        if self.read_raw().await == target {
            return Ok(());
        }
        self.audio.set_level(target, self.flags).await?;
        self.last.store(target, Ordering::Relaxed);
        log::debug!("Volume set to {}", target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryAudio;

    fn channel(max: i32, level: i32) -> VolumeChannel<MemoryAudio> {
        VolumeChannel::new(MemoryAudio::new(max, level), VolumeFlags::default())
    }

    #[tokio::test]
    async fn write_then_read_round_trips_inside_range() {
        let ch = channel(15, 0);
        for v in ch.min()..=ch.max() {
            ch.write(v).await.unwrap();
            assert_eq!(ch.read().await, v);
        }
    }

    #[tokio::test]
    async fn out_of_range_writes_clamp() {
        let ch = channel(15, 5);
        ch.write(40).await.unwrap();
        assert_eq!(ch.read().await, 15);
        ch.write(-3).await.unwrap();
        assert_eq!(ch.read().await, 0);
    }

    #[tokio::test]
    async fn writing_current_level_is_a_no_op() {
        let ch = channel(15, 7);
        ch.write(7).await.unwrap();
        assert_eq!(ch.audio().set_calls(), 0);
        ch.write(8).await.unwrap();
        assert_eq!(ch.audio().set_calls(), 1);
    }

    #[tokio::test]
    async fn over_amplified_sink_reads_as_max_and_is_pulled_back() {
        // 1.5 on a 15-step sink.
        let ch = channel(15, 22);
        assert_eq!(ch.read().await, 15);
        assert_eq!(ch.read_raw().await, 22);
        ch.write(15).await.unwrap();
        assert_eq!(ch.audio().set_calls(), 1);
        assert_eq!(ch.audio().level(), 15);
    }

    #[tokio::test]
    async fn write_forwards_flags() {
        let ch = VolumeChannel::new(MemoryAudio::new(15, 3), VolumeFlags { show_ui: true });
        ch.write(9).await.unwrap();
        assert_eq!(ch.audio().last_flags(), Some(VolumeFlags { show_ui: true }));
    }
}
