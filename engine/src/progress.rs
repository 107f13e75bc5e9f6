use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Telemetry published to the play session while generation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub playing: bool,
    pub audio_completed: bool,
    pub duration: f64,
    pub progress_percent: f64,
    pub position_samples: u64,
    pub underflow_events_since_last: u64,
}

/// Tick interval: fast enough for a smooth seek bar, slow enough to stay
/// out of the audio thread's way.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(330);

/// Coalescing holder between the pump's per-callback signals and the
/// periodic tick. The pump may signal far faster than the tick; only the
/// latest snapshot goes out.
#[derive(Debug, Default)]
pub struct ProgressEmitter {
    latest_position: u64,
    latest_underflows: u64,
    underflows_at_last_emit: u64,
    dirty: bool,
}

impl ProgressEmitter {
    pub fn note(&mut self, position_samples: u64, underflow_events: u64) {
        self.latest_position = position_samples;
        self.latest_underflows = underflow_events;
        self.dirty = true;
    }

    /// Build the update for one tick, or `None` when nothing new arrived
    /// since the previous one.
    pub fn take(&mut self, total_samples: u64, sample_rate_hz: u32) -> Option<ProgressUpdate> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        let since_last = self
            .latest_underflows
            .saturating_sub(self.underflows_at_last_emit);
        self.underflows_at_last_emit = self.latest_underflows;
        let duration = total_samples as f64 / sample_rate_hz as f64;
        let percent = if total_samples > 0 {
            (self.latest_position as f64 / total_samples as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        Some(ProgressUpdate {
            playing: true,
            audio_completed: false,
            duration,
            progress_percent: percent,
            position_samples: self.latest_position,
            underflow_events_since_last: since_last,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
