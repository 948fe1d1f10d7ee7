//! 100-nanosecond tick arithmetic.
//!
//! Every timestamp and duration in the renderer is expressed in 100-ns
//! ticks (`10_000_000` per second), matching the resolution media sources
//! deliver sample times in. Frame counts convert to and from ticks through
//! the sample rate without intermediate rounding loss.

use std::sync::OnceLock;
use std::time::Instant;

/// A point in time or a duration, in 100-ns ticks.
pub type RefTime = i64;

/// Ticks per second.
pub const TICKS_PER_SEC: i64 = 10_000_000;

/// Ticks per millisecond.
pub const TICKS_PER_MS: i64 = 10_000;

/// `value * numerator / denominator` without intermediate overflow.
///
/// Rounds toward negative infinity, so converting a positive duration
/// never overshoots the true value.
#[inline]
pub fn mul_div(value: i64, numerator: i64, denominator: i64) -> i64 {
    debug_assert!(denominator != 0);
    let wide = i128::from(value) * i128::from(numerator);
    (wide.div_euclid(i128::from(denominator))) as i64
}

/// Convert a frame count at `rate` Hz to 100-ns ticks.
#[inline]
pub fn frames_to_ticks(frames: u64, rate: u32) -> RefTime {
    mul_div(frames as i64, TICKS_PER_SEC, i64::from(rate))
}

/// Convert 100-ns ticks to a frame count at `rate` Hz.
///
/// Negative inputs clamp to zero frames.
#[inline]
pub fn ticks_to_frames(ticks: RefTime, rate: u32) -> u64 {
    if ticks <= 0 {
        return 0;
    }
    mul_div(ticks, i64::from(rate), TICKS_PER_SEC) as u64
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic process counter in 100-ns ticks.
///
/// All clocks in the renderer (the graph clock and every endpoint clock
/// implementation) read this counter so that device timestamps and host
/// timestamps live on the same timebase.
#[inline]
pub fn counter() -> RefTime {
    let elapsed = epoch().elapsed();
    elapsed.as_secs() as i64 * TICKS_PER_SEC + i64::from(elapsed.subsec_nanos()) / 100
}
