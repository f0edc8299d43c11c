use log::{debug, info, warn};
use rand::Rng;
use rand::rngs::StdRng;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::audio::{
    AudioBackend, AudioClock, AudioTransport, BufferCue, DecodedBuffer, EndedHandle,
};
use crate::game::session::Note;
use crate::game::setlist::SongMeta;

// Release tail the synthesizer keeps ringing after the last note.
const SYNTH_RELEASE_MS: f64 = 2_000.0;
const SIM_SAMPLE_RATE: u32 = 44_100;
const GROOVES: [&str; 4] = ["straight", "shuffle", "half-time", "four-on-the-floor"];

/// A fake asset in the simulated asset store.
#[derive(Clone, Debug, PartialEq)]
pub struct SimAsset {
    pub duration_ms: f64,
    pub fetch_delay: Duration,
    pub decode_delay: Duration,
    /// Fetches fine but fails to decode.
    pub corrupt: bool,
}

impl SimAsset {
    pub const fn new(duration_ms: f64) -> Self {
        Self {
            duration_ms,
            fetch_delay: Duration::from_millis(30),
            decode_delay: Duration::from_millis(20),
            corrupt: false,
        }
    }
}

#[derive(Debug)]
struct ActiveSource {
    ended: EndedHandle,
    ends_at_sec: f64,
    paused_remaining_sec: Option<f64>,
}

#[derive(Debug, Default)]
struct Transport {
    active: Option<ActiveSource>,
    running: bool,
}

/// Headless audio backend on tokio's clock. Sources "play" for their length
/// and report their end from [`SimAudio::pump`].
#[derive(Debug)]
pub struct SimAudio {
    epoch: Instant,
    assets: FxHashMap<String, SimAsset>,
    synth_available: bool,
    locked: AtomicBool,
    transport: Mutex<Transport>,
}

impl Default for SimAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimAudio {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            assets: FxHashMap::default(),
            synth_available: true,
            locked: AtomicBool::new(false),
            transport: Mutex::new(Transport::default()),
        }
    }

    pub fn with_asset(mut self, filename: &str, asset: SimAsset) -> Self {
        self.assets.insert(filename.to_string(), asset);
        self
    }

    pub fn with_synth(mut self, available: bool) -> Self {
        self.synth_available = available;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_source(&self, ended: EndedHandle, length_sec: f64) {
        let ends_at_sec = self.current_time_sec() + length_sec.max(0.0);
        let mut t = self.lock();
        if let Some(old) = t.active.take() {
            debug!("SimAudio: source {} replaced by {}", old.ended.request(), ended.request());
        }
        t.active = Some(ActiveSource {
            ended,
            ends_at_sec,
            paused_remaining_sec: None,
        });
        t.running = true;
    }

    /// Fires the active source's end if it has played out. Returns whether
    /// an end was reported.
    pub fn pump(&self) -> bool {
        let now = self.current_time_sec();
        let finished = {
            let mut t = self.lock();
            let due = t
                .active
                .as_ref()
                .is_some_and(|a| a.paused_remaining_sec.is_none() && now >= a.ends_at_sec);
            if due {
                t.running = false;
                t.active.take()
            } else {
                None
            }
        };
        match finished {
            Some(source) => {
                debug!("SimAudio: source {} ended", source.ended.request());
                source.ended.fire();
                true
            }
            None => false,
        }
    }

    /// Pumps forever at `period`. Spawn it next to the gig.
    pub async fn run_pump(self: Arc<Self>, period: Duration) {
        let mut tick = tokio::time::interval(period);
        loop {
            tick.tick().await;
            self.pump();
        }
    }
}

impl AudioClock for SimAudio {
    fn current_time_sec(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl AudioTransport for SimAudio {
    fn pause_transport(&self) {
        let now = self.current_time_sec();
        let mut t = self.lock();
        if let Some(a) = t.active.as_mut()
            && a.paused_remaining_sec.is_none()
        {
            a.paused_remaining_sec = Some((a.ends_at_sec - now).max(0.0));
        }
        t.running = false;
    }

    fn resume_transport(&self) {
        let now = self.current_time_sec();
        let mut t = self.lock();
        if let Some(a) = t.active.as_mut()
            && let Some(remaining) = a.paused_remaining_sec.take()
        {
            a.ends_at_sec = now + remaining;
        }
        t.running = t.active.is_some();
    }

    fn stop(&self) {
        let mut t = self.lock();
        if let Some(a) = t.active.take() {
            debug!("SimAudio: stopped source {}", a.ended.request());
        }
        t.running = false;
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }
}

impl AudioBackend for SimAudio {
    async fn ensure_clock_active(&self) -> bool {
        let unlocked = !self.locked.load(Ordering::Relaxed);
        if !unlocked {
            warn!("SimAudio: audio clock is locked");
        }
        unlocked
    }

    async fn fetch_asset(&self, filename: &str) -> Result<Vec<u8>, String> {
        let Some(asset) = self.assets.get(filename) else {
            return Err(format!("asset '{filename}' not found"));
        };
        tokio::time::sleep(asset.fetch_delay).await;
        if asset.corrupt {
            Ok(vec![0xde, 0xad])
        } else {
            Ok(asset.duration_ms.to_le_bytes().to_vec())
        }
    }

    async fn decode_asset(&self, filename: &str, bytes: Vec<u8>) -> Result<DecodedBuffer, String> {
        let delay = self
            .assets
            .get(filename)
            .map_or(Duration::ZERO, |a| a.decode_delay);
        tokio::time::sleep(delay).await;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("'{filename}' is not decodable audio ({} bytes)", bytes.len()))?;
        let duration_ms = f64::from_le_bytes(raw);
        if !duration_ms.is_finite() || duration_ms <= 0.0 {
            return Err(format!("'{filename}' decodes to no audio"));
        }
        Ok(DecodedBuffer {
            filename: filename.to_string(),
            duration_ms,
            sample_rate: SIM_SAMPLE_RATE,
        })
    }

    async fn play_buffer(&self, buffer: &DecodedBuffer, cue: BufferCue, ended: EndedHandle) -> bool {
        if cue.duration_ms <= 0.0 || cue.offset_ms >= buffer.duration_ms {
            return false;
        }
        let length_ms = cue.duration_ms.min(buffer.duration_ms - cue.offset_ms);
        info!(
            "SimAudio: buffer '{}' at {:.0}ms for {:.0}ms (delay {:.0}ms)",
            buffer.filename, cue.offset_ms, length_ms, cue.delay_ms
        );
        self.start_source(ended, (cue.delay_ms + length_ms) / 1000.0);
        true
    }

    async fn play_synthesized(&self, notes: &[Note], delay_sec: f64, ended: EndedHandle) -> bool {
        if !self.synth_available {
            return false;
        }
        let Some(last) = notes.last() else {
            return false;
        };
        let length_ms = last.time + SYNTH_RELEASE_MS;
        info!("SimAudio: synthesizing {} notes ({length_ms:.0}ms)", notes.len());
        ended.resolve_duration(length_ms);
        self.start_source(ended, delay_sec + length_ms / 1000.0);
        true
    }

    async fn play_procedural(
        &self,
        song: &SongMeta,
        delay_sec: f64,
        ended: EndedHandle,
        rng: &mut StdRng,
    ) -> bool {
        if song.duration_ms <= 0.0 {
            return false;
        }
        let groove = GROOVES[rng.random_range(0..GROOVES.len())];
        info!(
            "SimAudio: procedural '{}' at {:.0} bpm, {groove} groove",
            song.title, song.bpm
        );
        self.start_source(ended, delay_sec + song.duration_ms / 1000.0);
        true
    }
}
