use rand::rngs::StdRng;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc::UnboundedSender;

use crate::game::session::Note;
use crate::game::setlist::SongMeta;

/* ============================== Public API ============================== */

/// Token identifying one song-load request. Only the most recently issued
/// token is current; anything carrying an older one is stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The audio subsystem's own clock. Gameplay time is derived from this and
/// never from wall time.
pub trait AudioClock: Send + Sync {
    fn current_time_sec(&self) -> f64;
}

/// Synchronous transport controls used from the frame loop.
pub trait AudioTransport {
    fn pause_transport(&self);
    fn resume_transport(&self);
    /// Stops whatever source is playing. A stopped source never reports `Ended`.
    fn stop(&self);
    fn is_running(&self) -> bool;
}

/// Where inside a decoded buffer playback should start and how long it runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BufferCue {
    pub offset_ms: f64,
    pub delay_ms: f64,
    pub duration_ms: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedBuffer {
    pub filename: String,
    pub duration_ms: f64,
    pub sample_rate: u32,
}

/// Completion notifications from the audio subsystem. They arrive between
/// frame ticks, in any order relative to them.
#[derive(Clone, Debug, PartialEq)]
pub enum PlaybackEvent {
    Ended { request: RequestId, song_index: usize },
    DurationResolved { request: RequestId, duration_ms: f64 },
}

/// Handed to a playback source so it can report natural end (and, optionally,
/// its authoritative length) tagged with the request that started it.
#[derive(Clone, Debug)]
pub struct EndedHandle {
    request: RequestId,
    song_index: usize,
    events: UnboundedSender<PlaybackEvent>,
}

impl EndedHandle {
    pub fn new(request: RequestId, song_index: usize, events: UnboundedSender<PlaybackEvent>) -> Self {
        Self { request, song_index, events }
    }

    pub const fn request(&self) -> RequestId {
        self.request
    }

    pub fn resolve_duration(&self, duration_ms: f64) {
        let _ = self.events.send(PlaybackEvent::DurationResolved {
            request: self.request,
            duration_ms,
        });
    }

    pub fn fire(self) {
        let _ = self.events.send(PlaybackEvent::Ended {
            request: self.request,
            song_index: self.song_index,
        });
    }
}

/// Full audio collaborator consumed by the playback orchestrator.
///
/// Each `play_*` call is exactly one rung of the fallback ladder and resolves
/// `true` iff playback actually started. Starting a new source replaces the
/// current one; the replaced source must not fire its `EndedHandle`.
pub trait AudioBackend: AudioClock + AudioTransport + Send + Sync + 'static {
    /// Unlocks/starts the audio clock. `false` means the clock is locked and
    /// no playback may be attempted.
    fn ensure_clock_active(&self) -> impl Future<Output = bool> + Send;

    fn fetch_asset(&self, filename: &str) -> impl Future<Output = Result<Vec<u8>, String>> + Send;

    fn decode_asset(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> impl Future<Output = Result<DecodedBuffer, String>> + Send;

    fn play_buffer(
        &self,
        buffer: &DecodedBuffer,
        cue: BufferCue,
        ended: EndedHandle,
    ) -> impl Future<Output = bool> + Send;

    fn play_synthesized(
        &self,
        notes: &[Note],
        delay_sec: f64,
        ended: EndedHandle,
    ) -> impl Future<Output = bool> + Send;

    fn play_procedural(
        &self,
        song: &SongMeta,
        delay_sec: f64,
        ended: EndedHandle,
        rng: &mut StdRng,
    ) -> impl Future<Output = bool> + Send;
}

/* ============================== Test support ============================== */
