//! The `SettingChannel` contract shared by volume and brightness.

use async_trait::async_trait;

use crate::error::WriteError;

/// One readable/writable numeric device setting.
///
/// `read` never fails: implementations fall back to the last value they saw
/// when the device cannot be queried. `write` clamps into `[min, max]`.
#[async_trait]
pub trait SettingChannel: Send + Sync {
    /// Short name used in logs and status output ("volume", "brightness").
    fn name(&self) -> &str;
    fn min(&self) -> i32;
    fn max(&self) -> i32;

    /// Current value, clamped into `[min, max]`.
    async fn read(&self) -> i32;
    async fn write(&self, value: i32) -> Result<(), WriteError>;

    /// Device value as reported, before clamping. Differs from `read` only
    /// when the device sits outside `[min, max]`.
    async fn read_raw(&self) -> i32 {
        self.read().await
    }

    /// Capability check without side effects.
    async fn is_writable(&self) -> bool {
        true
    }

    fn clamp(&self, value: i32) -> i32 {
        clamp_to(value, self.min(), self.max())
    }
}

/// Clamps `value` into `[min, max]`, logging when the input was out of range.
pub fn clamp_to(value: i32, min: i32, max: i32) -> i32 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        log::debug!("Clamped {} into [{}, {}] -> {}", value, min, max, clamped);
    }
    clamped
}

/// Size of one slider step for a range split by `steps` intermediate stops.
///
/// A slider with `steps = 9` has 11 positions, so the range is cut into 10
/// equal moves. Never returns less than 1.
pub fn step_size(min: i32, max: i32, steps: u32) -> i32 {
    let span = i64::from(max) - i64::from(min);
    let moves = i64::from(steps) + 1;
    let size = (span + moves - 1) / moves;
    size.clamp(1, i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_snaps_to_nearest_bound() {
        assert_eq!(clamp_to(-4, 0, 15), 0);
        assert_eq!(clamp_to(99, 0, 15), 15);
        assert_eq!(clamp_to(7, 0, 15), 7);
    }

    #[test]
    fn step_size_covers_range_in_steps_plus_one_moves() {
        assert_eq!(step_size(0, 15, 9), 2);
        assert_eq!(step_size(0, 100, 9), 10);
        assert_eq!(step_size(1, 255, 9), 26);
    }

    #[test]
    fn step_size_is_at_least_one() {
        assert_eq!(step_size(0, 3, 9), 1);
        assert_eq!(step_size(5, 5, 0), 1);
    }
}
