//! The graph reference clock.
//!
//! Hosts read playback time from this clock. While *unslaved* it runs off
//! the process monotonic counter plus an offset. While *slaved* to a
//! device clock it reports
//!
//! ```text
//! time = position / frequency + audio_start + (counter - capture_time)
//! ```
//!
//! extrapolating from the device position captured at `capture_time` (the
//! extrapolation term is withheld until the device has actually moved).
//! Every slaved reading also refreshes the offset, so unslaving never
//! steps the clock; a last-value guard keeps readings monotonic even if
//! the device clock misbehaves.

use std::sync::Arc;

use parking_lot::Mutex;
use salida_core::{time, RefTime, TICKS_PER_SEC};
use salida_device::EndpointClock;

struct ClockState {
    audio_clock: Option<Arc<dyn EndpointClock>>,
    audio_start: RefTime,
    counter_offset: RefTime,
    last: RefTime,
}

/// Monotonic reference clock, optionally slaved to a device clock.
pub struct GraphClock {
    state: Mutex<ClockState>,
}

impl Default for GraphClock {
    fn default() -> GraphClock {
        GraphClock::new()
    }
}

impl GraphClock {
    /// An unslaved clock starting at the current counter.
    pub fn new() -> GraphClock {
        GraphClock {
            state: Mutex::new(ClockState {
                audio_clock: None,
                audio_start: 0,
                counter_offset: 0,
                last: 0,
            }),
        }
    }

    /// Current time in 100-ns ticks; never decreases.
    pub fn time(&self) -> RefTime {
        let mut state = self.state.lock();
        let counter = time::counter();

        let mut now = state.counter_offset + counter;
        if let Some(clock) = state.audio_clock.clone() {
            if let (Ok(frequency), Ok((position, capture))) = (clock.frequency(), clock.position())
            {
                let clock_time = time::mul_div(position as i64, TICKS_PER_SEC, frequency as i64)
                    + state.audio_start
                    + if position > 0 { counter - capture } else { 0 };
                state.counter_offset = clock_time - counter;
                now = clock_time;
            }
        }

        if now < state.last {
            now = state.last;
        } else {
            state.last = now;
        }
        now
    }

    /// Follow `clock`, anchored so that device position zero reads as
    /// `audio_start`. Idempotent.
    pub fn slave(&self, clock: Arc<dyn EndpointClock>, audio_start: RefTime) {
        tracing::debug!(audio_start, "slaving graph clock to audio");
        let mut state = self.state.lock();
        state.audio_clock = Some(clock);
        state.audio_start = audio_start;
    }

    /// Return to the free-running counter, continuing from the last slaved
    /// reading. Idempotent.
    pub fn unslave(&self) {
        tracing::debug!("unslaving graph clock from audio");
        self.state.lock().audio_clock = None;
    }

    /// Whether the clock currently follows a device clock.
    pub fn is_slaved(&self) -> bool {
        self.state.lock().audio_clock.is_some()
    }
}
