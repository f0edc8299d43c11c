use std::sync::Arc;

use crate::core::audio::AudioClock;

/// How the audio-time anchor of a freshly started clock is chosen.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClockStart {
    /// Start `ms` from the current audio time (negative clock readings until then).
    Delay(f64),
    /// Start at an absolute audio-clock time, in seconds.
    At(f64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ClockState {
    Idle,
    Running { start_audio_sec: f64 },
    Paused,
}

/// Elapsed performance time derived from the audio subsystem's clock:
/// `(audio_now - start) * 1000 + offset`. Wall time is never consulted.
pub struct GigClock {
    source: Arc<dyn AudioClock>,
    state: ClockState,
    offset_ms: f64,
}

impl std::fmt::Debug for GigClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GigClock")
            .field("state", &self.state)
            .field("offset_ms", &self.offset_ms)
            .finish_non_exhaustive()
    }
}

impl GigClock {
    pub fn new(source: Arc<dyn AudioClock>) -> Self {
        Self {
            source,
            state: ClockState::Idle,
            offset_ms: 0.0,
        }
    }

    pub fn start(&mut self, offset_ms: f64, start: ClockStart) {
        let start_audio_sec = match start {
            ClockStart::Delay(delay_ms) => self.source.current_time_sec() + delay_ms / 1000.0,
            ClockStart::At(sec) => sec,
        };
        self.offset_ms = offset_ms;
        self.state = ClockState::Running { start_audio_sec };
    }

    /// Milliseconds since start, honoring the offset. Frozen while paused;
    /// just the offset before the clock has started.
    pub fn now(&self) -> f64 {
        match self.state {
            ClockState::Running { start_audio_sec } => {
                (self.source.current_time_sec() - start_audio_sec) * 1000.0 + self.offset_ms
            }
            ClockState::Idle | ClockState::Paused => self.offset_ms,
        }
    }

    pub fn pause(&mut self) {
        if let ClockState::Running { .. } = self.state {
            self.offset_ms = self.now();
            self.state = ClockState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ClockState::Paused {
            self.state = ClockState::Running {
                start_audio_sec: self.source.current_time_sec(),
            };
        }
    }

    /// Freezes the clock at its current reading for good (until restarted).
    pub fn stop(&mut self) {
        self.offset_ms = self.now();
        self.state = ClockState::Idle;
    }
}
