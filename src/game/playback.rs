use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;

use crate::app::GigHost;
use crate::core::audio::{
    AudioBackend, AudioClock, BufferCue, EndedHandle, PlaybackEvent, RequestId,
};
use crate::game::clock::{ClockStart, GigClock};
use crate::game::session::{Note, PhaseEvent, Session};
use crate::game::setlist::{
    self, ExcerptWindow, SongEntry, chart_duration_ms, chart_notes, generate_procedural_notes,
    resolve_excerpt,
};

/* ============================== Request tokens ============================== */

/// Monotonic source of [`RequestId`]s. Async work compares its own id with
/// the latest one at every suspension point and quietly gives up when stale.
#[derive(Clone, Debug, Default)]
pub struct RequestGate {
    latest: Arc<AtomicU64>,
}

impl RequestGate {
    pub fn issue(&self) -> RequestId {
        RequestId(self.latest.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn latest(&self) -> RequestId {
        RequestId(self.latest.load(Ordering::SeqCst))
    }

    #[inline(always)]
    pub fn is_current(&self, request: RequestId) -> bool {
        self.latest.load(Ordering::SeqCst) == request.0
    }

    /// Makes every outstanding request stale.
    pub fn invalidate(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }
}

/* ============================== Load results ============================== */

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoadSettings {
    pub fetch_timeout: Duration,
    pub decode_timeout: Duration,
    pub lead_in_ms: f64,
    pub seed: u64,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(8),
            decode_timeout: Duration::from_secs(8),
            lead_in_ms: 2_000.0,
            seed: 0x5eed_ca11,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Buffer,
    Synthesized,
    Procedural,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadedSong {
    pub source: SourceKind,
    pub notes: Vec<Note>,
    /// Length estimate available when playback starts.
    pub duration_ms: f64,
    /// Length of the audio actually queued, when the source knows it.
    pub authoritative_duration_ms: Option<f64>,
    /// Audio-clock time (s) at which note time 0 is heard.
    pub start_time_sec: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadError {
    /// A newer request took over; the result must be dropped silently.
    Superseded,
    AudioLocked,
    NoPlayableSource { title: String },
    /// The load task died before producing an outcome.
    LoaderFailed { title: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => write!(f, "Song load was superseded"),
            Self::AudioLocked => write!(f, "Audio is locked. Tap to enable sound and try again."),
            Self::NoPlayableSource { title } => {
                write!(f, "Could not start '{title}': no playable audio source.")
            }
            Self::LoaderFailed { title } => {
                write!(f, "Could not start '{title}': the song loader stopped unexpectedly.")
            }
        }
    }
}

impl std::error::Error for LoadError {}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadOutcome {
    pub request: RequestId,
    pub song_index: usize,
    pub result: Result<LoadedSong, LoadError>,
}

/* ============================== Load job ============================== */

/// One pass down the fallback ladder for one setlist entry. Runs detached from
/// the session; its result is applied by [`PlaybackOrchestrator::complete_load`].
#[derive(Debug)]
pub struct LoadJob {
    request: RequestId,
    song_index: usize,
    song: SongEntry,
    gate: RequestGate,
    events: UnboundedSender<PlaybackEvent>,
    settings: LoadSettings,
}

impl LoadJob {
    pub const fn request(&self) -> RequestId {
        self.request
    }

    pub const fn song_index(&self) -> usize {
        self.song_index
    }

    pub async fn run<B: AudioBackend>(self, audio: Arc<B>) -> LoadOutcome {
        let result = self.resolve(audio.as_ref()).await;
        if let Err(LoadError::Superseded) = result {
            debug!(
                "Load of '{}' (request {}) abandoned: superseded by {}",
                self.song.title,
                self.request,
                self.gate.latest()
            );
        }
        LoadOutcome {
            request: self.request,
            song_index: self.song_index,
            result,
        }
    }

    fn ensure_current(&self) -> Result<(), LoadError> {
        if self.gate.is_current(self.request) {
            Ok(())
        } else {
            Err(LoadError::Superseded)
        }
    }

    fn ended_handle(&self) -> EndedHandle {
        EndedHandle::new(self.request, self.song_index, self.events.clone())
    }

    fn rng(&self) -> StdRng {
        let seed = self.song.seed.unwrap_or_else(|| {
            self.settings.seed ^ (self.song_index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15)
        });
        StdRng::seed_from_u64(seed)
    }

    #[inline(always)]
    fn lead_in_sec(&self) -> f64 {
        self.settings.lead_in_ms.max(0.0) / 1000.0
    }

    /// Timeline notes for the window, or a generated chart when there are none.
    fn notes_for(&self, window: ExcerptWindow) -> Vec<Note> {
        let notes = chart_notes(&self.song, window);
        if !notes.is_empty() {
            return notes;
        }
        debug!("'{}' has no timeline in its excerpt; generating a chart", self.song.title);
        generate_procedural_notes(&self.song.meta(window.duration_ms), &mut self.rng())
    }

    async fn resolve<B: AudioBackend>(&self, audio: &B) -> Result<LoadedSong, LoadError> {
        self.ensure_current()?;
        let unlocked = audio.ensure_clock_active().await;
        self.ensure_current()?;
        if !unlocked {
            return Err(LoadError::AudioLocked);
        }
        if let Some(song) = self.try_buffer(audio).await? {
            return Ok(song);
        }
        if let Some(song) = self.try_synthesized(audio).await? {
            return Ok(song);
        }
        if let Some(song) = self.try_procedural(audio).await? {
            return Ok(song);
        }
        Err(LoadError::NoPlayableSource {
            title: self.song.title.clone(),
        })
    }

    async fn try_buffer<B: AudioBackend>(&self, audio: &B) -> Result<Option<LoadedSong>, LoadError> {
        let title = &self.song.title;
        let Some(filename) = self.song.filename.as_deref() else {
            debug!("'{title}' has no rendered asset");
            return Ok(None);
        };

        let fetched = timeout(self.settings.fetch_timeout, audio.fetch_asset(filename)).await;
        self.ensure_current()?;
        let bytes = match fetched {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("Buffer source unavailable for '{title}': {e}");
                return Ok(None);
            }
            Err(_) => {
                warn!(
                    "Fetching '{filename}' timed out after {:?}",
                    self.settings.fetch_timeout
                );
                return Ok(None);
            }
        };

        let decoded = timeout(self.settings.decode_timeout, audio.decode_asset(filename, bytes)).await;
        self.ensure_current()?;
        let buffer = match decoded {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => {
                warn!("Decoding '{filename}' failed: {e}");
                return Ok(None);
            }
            Err(_) => {
                warn!(
                    "Decoding '{filename}' timed out after {:?}",
                    self.settings.decode_timeout
                );
                return Ok(None);
            }
        };

        let window = resolve_excerpt(&self.song, buffer.duration_ms);
        if window.duration_ms <= 0.0 {
            warn!("'{filename}' leaves an empty excerpt for '{title}'");
            return Ok(None);
        }
        let notes = self.notes_for(window);
        let cue = BufferCue {
            offset_ms: window.start_ms,
            delay_ms: self.settings.lead_in_ms.max(0.0),
            duration_ms: window.duration_ms,
        };
        let start_time_sec = audio.current_time_sec() + self.lead_in_sec();
        let started = audio.play_buffer(&buffer, cue, self.ended_handle()).await;
        self.ensure_current()?;
        if !started {
            warn!("Buffer playback of '{filename}' did not start");
            return Ok(None);
        }
        info!(
            "Playing '{title}' from buffer [{:.0}ms +{:.0}ms], {} notes",
            window.start_ms,
            window.duration_ms,
            notes.len()
        );
        Ok(Some(LoadedSong {
            source: SourceKind::Buffer,
            duration_ms: chart_duration_ms(&notes, 0.0),
            notes,
            authoritative_duration_ms: Some(window.duration_ms),
            start_time_sec,
        }))
    }

    async fn try_synthesized<B: AudioBackend>(&self, audio: &B) -> Result<Option<LoadedSong>, LoadError> {
        let title = &self.song.title;
        let window = resolve_excerpt(&self.song, self.song.duration_ms);
        let notes = chart_notes(&self.song, window);
        if notes.is_empty() {
            debug!("'{title}' has no symbolic timeline to synthesize");
            return Ok(None);
        }
        let start_time_sec = audio.current_time_sec() + self.lead_in_sec();
        let started = audio
            .play_synthesized(&notes, self.lead_in_sec(), self.ended_handle())
            .await;
        self.ensure_current()?;
        if !started {
            warn!("Synthesized playback of '{title}' did not start");
            return Ok(None);
        }
        info!("Playing '{title}' via synthesis, {} notes", notes.len());
        Ok(Some(LoadedSong {
            source: SourceKind::Synthesized,
            duration_ms: chart_duration_ms(&notes, 0.0),
            notes,
            authoritative_duration_ms: None,
            start_time_sec,
        }))
    }

    async fn try_procedural<B: AudioBackend>(&self, audio: &B) -> Result<Option<LoadedSong>, LoadError> {
        let title = &self.song.title;
        let meta = self.song.meta(self.song.duration_ms);
        let mut rng = self.rng();
        let notes = generate_procedural_notes(&meta, &mut rng);
        if notes.is_empty() {
            warn!("Procedural generation produced no notes for '{title}'");
            return Ok(None);
        }
        let start_time_sec = audio.current_time_sec() + self.lead_in_sec();
        let started = audio
            .play_procedural(&meta, self.lead_in_sec(), self.ended_handle(), &mut rng)
            .await;
        self.ensure_current()?;
        if !started {
            warn!("Procedural playback of '{title}' did not start");
            return Ok(None);
        }
        info!("Playing '{title}' procedurally, {} notes", notes.len());
        Ok(Some(LoadedSong {
            source: SourceKind::Procedural,
            duration_ms: chart_duration_ms(&notes, meta.duration_ms),
            notes,
            authoritative_duration_ms: None,
            start_time_sec,
        }))
    }
}

/* ============================== Orchestrator ============================== */

#[derive(Debug)]
pub enum Advance {
    /// Nothing to do (stale trigger, finished session, or result applied).
    Idle,
    /// Run this job and feed its outcome back through `complete_load`.
    Load(LoadJob),
    /// No songs left; completion detection takes over.
    SetlistComplete,
    /// The first song could not start; the gig never begins.
    Aborted,
}

#[derive(Debug)]
pub struct PlaybackOrchestrator {
    setlist: Vec<SongEntry>,
    gate: RequestGate,
    events: UnboundedSender<PlaybackEvent>,
    settings: LoadSettings,
    // A length reported before its load result was applied.
    pending_duration: Option<(RequestId, f64)>,
}

impl PlaybackOrchestrator {
    pub fn new(setlist: Vec<SongEntry>, settings: LoadSettings, events: UnboundedSender<PlaybackEvent>) -> Self {
        Self {
            setlist,
            gate: RequestGate::default(),
            events,
            settings,
            pending_duration: None,
        }
    }

    pub const fn gate(&self) -> &RequestGate {
        &self.gate
    }

    pub fn setlist(&self) -> &[SongEntry] {
        &self.setlist
    }

    /// Begins setlist entry `index`, or wraps up the setlist past its end.
    pub fn advance(&mut self, session: &mut Session, clock: &GigClock, index: usize) -> Advance {
        if session.has_submitted_results() || session.is_game_over() {
            debug!("Not advancing to song {index}: session already over");
            return Advance::Idle;
        }
        let Some(song) = self.setlist.get(index) else {
            self.finish_setlist(session, clock);
            return Advance::SetlistComplete;
        };
        let request = self.gate.issue();
        session.transition(PhaseEvent::SongLoading);
        info!(
            "Loading song {}/{}: '{}' (request {request})",
            index + 1,
            self.setlist.len(),
            song.title
        );
        Advance::Load(LoadJob {
            request,
            song_index: index,
            song: song.clone(),
            gate: self.gate.clone(),
            events: self.events.clone(),
            settings: self.settings,
        })
    }

    fn finish_setlist(&mut self, session: &mut Session, clock: &GigClock) {
        session.setlist_complete = true;
        if session.song_transitioning() {
            session.transition(PhaseEvent::SongReady);
        }
        // A frozen clock may never reach the old target; pull it down so the
        // next tick completes the gig.
        let now = clock.now();
        if now < session.total_duration {
            info!(
                "Setlist complete; snapping total duration {:.0}ms -> {:.0}ms",
                session.total_duration, now
            );
            session.total_duration = now;
        } else {
            info!("Setlist complete");
        }
    }

    /// Applies a finished load if it is still the current request.
    pub fn complete_load(
        &mut self,
        session: &mut Session,
        clock: &mut GigClock,
        host: &mut dyn GigHost,
        outcome: LoadOutcome,
    ) -> Advance {
        if !self.gate.is_current(outcome.request) {
            debug!(
                "Discarding stale load result for song {} (request {}, latest {})",
                outcome.song_index,
                outcome.request,
                self.gate.latest()
            );
            return Advance::Idle;
        }
        if session.has_submitted_results() || session.is_game_over() {
            debug!("Discarding load result: session already over");
            return Advance::Idle;
        }

        match outcome.result {
            Ok(loaded) => {
                let index = outcome.song_index;
                session.replace_notes(loaded.notes, loaded.duration_ms);
                if let Some(authoritative) = loaded.authoritative_duration_ms {
                    session.revise_total_duration(authoritative);
                }
                if let Some((request, duration_ms)) = self.pending_duration.take()
                    && request == outcome.request
                {
                    session.revise_total_duration(duration_ms);
                }
                session.current_song = Some(index);
                session.on_final_song = index + 1 >= self.setlist.len();
                session.setlist_complete = false;
                session.songs_started += 1;
                // Toxic expiry is in gig-clock time; carry what is left across the restart.
                let toxic_left_ms = session.toxic.end_time - clock.now();
                clock.start(0.0, ClockStart::At(loaded.start_time_sec));
                if session.is_toxic_mode() {
                    session.toxic.end_time = clock.now() + toxic_left_ms;
                }
                session.transition(PhaseEvent::SongReady);
                info!(
                    "Song {} ready ({:?}): {} notes, {:.0}ms",
                    index + 1,
                    loaded.source,
                    session.notes.len(),
                    session.total_duration
                );
                Advance::Idle
            }
            Err(LoadError::Superseded) => Advance::Idle,
            Err(e) => {
                error!("Song {} failed to initialize: {e}", outcome.song_index + 1);
                host.report_error(&e.to_string());
                if session.songs_started == 0 {
                    Advance::Aborted
                } else {
                    self.advance(session, clock, outcome.song_index + 1)
                }
            }
        }
    }

    /// Reacts to a completion callback from the audio subsystem.
    pub fn on_playback_event(&mut self, session: &mut Session, clock: &GigClock, event: PlaybackEvent) -> Advance {
        match event {
            PlaybackEvent::Ended { request, song_index } => {
                if session.has_submitted_results() || session.is_game_over() {
                    debug!("Ignoring end of song {song_index}: session already over");
                    return Advance::Idle;
                }
                if !self.gate.is_current(request) {
                    debug!("Ignoring stale end of song {song_index} (request {request})");
                    return Advance::Idle;
                }
                info!("Song {} ended naturally", song_index + 1);
                session.playback_ended = true;
                self.advance(session, clock, song_index + 1)
            }
            PlaybackEvent::DurationResolved { request, duration_ms } => {
                if !self.gate.is_current(request) || session.has_submitted_results() {
                    return Advance::Idle;
                }
                if session.song_transitioning() {
                    self.pending_duration = Some((request, duration_ms));
                } else {
                    session.revise_total_duration(duration_ms);
                }
                Advance::Idle
            }
        }
    }

    /// Moves past the current song when its audio never reported an end.
    pub fn skip_overrun_song(&mut self, session: &mut Session, clock: &GigClock) -> Advance {
        let Some(index) = session.current_song else {
            return Advance::Idle;
        };
        warn!("Song {} overran its duration without ending; advancing", index + 1);
        self.advance(session, clock, index + 1)
    }

    pub fn song_count(&self) -> usize {
        self.setlist.len()
    }
}

/// The setlist-level estimate of how long the gig runs, for progress displays.
pub fn estimated_setlist_ms(setlist: &[SongEntry]) -> f64 {
    setlist
        .iter()
        .map(|s| resolve_excerpt(s, s.duration_ms).duration_ms)
        .sum::<f64>()
        + setlist.len() as f64 * setlist::NOTE_TAIL_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::testing::RecordingHost;
    use crate::core::audio::{AudioTransport, DecodedBuffer};
    use crate::game::modifiers::Modifiers;
    use crate::game::session::{Phase, ToxicMode};
    use crate::game::setlist::{Excerpt, SongMeta, TimelineNote};
    use std::sync::Mutex;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    #[derive(Clone, Debug)]
    enum Step {
        Ok,
        Fail,
        Hang,
    }

    #[derive(Debug)]
    struct ScriptedAudio {
        unlocked: bool,
        fetch: Step,
        decode: Step,
        buffer_ms: f64,
        buffer_plays: bool,
        synth_plays: bool,
        procedural_plays: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl Default for ScriptedAudio {
        fn default() -> Self {
            Self {
                unlocked: true,
                fetch: Step::Ok,
                decode: Step::Ok,
                buffer_ms: 30_000.0,
                buffer_plays: true,
                synth_plays: true,
                procedural_plays: true,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScriptedAudio {
        fn log(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        async fn step(step: &Step) -> Result<(), String> {
            match step {
                Step::Ok => Ok(()),
                Step::Fail => Err("scripted failure".into()),
                Step::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    impl AudioClock for ScriptedAudio {
        fn current_time_sec(&self) -> f64 {
            10.0
        }
    }

    impl AudioTransport for ScriptedAudio {
        fn pause_transport(&self) {}
        fn resume_transport(&self) {}
        fn stop(&self) {}
        fn is_running(&self) -> bool {
            true
        }
    }

    impl AudioBackend for ScriptedAudio {
        async fn ensure_clock_active(&self) -> bool {
            self.unlocked
        }

        async fn fetch_asset(&self, _filename: &str) -> Result<Vec<u8>, String> {
            self.log("fetch");
            Self::step(&self.fetch).await.map(|()| vec![0u8; 16])
        }

        async fn decode_asset(&self, filename: &str, _bytes: Vec<u8>) -> Result<DecodedBuffer, String> {
            self.log("decode");
            Self::step(&self.decode).await?;
            Ok(DecodedBuffer {
                filename: filename.to_string(),
                duration_ms: self.buffer_ms,
                sample_rate: 44_100,
            })
        }

        async fn play_buffer(&self, _buffer: &DecodedBuffer, _cue: BufferCue, _ended: EndedHandle) -> bool {
            self.log("buffer");
            self.buffer_plays
        }

        async fn play_synthesized(&self, _notes: &[Note], _delay_sec: f64, _ended: EndedHandle) -> bool {
            self.log("synth");
            self.synth_plays
        }

        async fn play_procedural(
            &self,
            _song: &SongMeta,
            _delay_sec: f64,
            _ended: EndedHandle,
            _rng: &mut StdRng,
        ) -> bool {
            self.log("procedural");
            self.procedural_plays
        }
    }

    fn song_with_timeline(title: &str) -> SongEntry {
        SongEntry {
            title: title.into(),
            filename: Some(format!("{title}.ogg")),
            duration_ms: 12_000.0,
            bpm: 120.0,
            excerpt: Some(Excerpt { start_ms: 1_000.0, duration_ms: Some(10_000.0) }),
            timeline: (1..10)
                .map(|i| TimelineNote {
                    time_ms: 1_000.0 + f64::from(i) * 500.0,
                    lane: (i % 3) as usize,
                    pitch: None,
                    velocity: None,
                })
                .collect(),
            seed: None,
        }
    }

    struct Rig {
        orchestrator: PlaybackOrchestrator,
        session: Session,
        clock: GigClock,
        host: RecordingHost,
        events: UnboundedReceiver<PlaybackEvent>,
    }

    fn rig(setlist: Vec<SongEntry>, audio: &Arc<ScriptedAudio>) -> Rig {
        let (tx, rx) = unbounded_channel();
        let settings = LoadSettings {
            fetch_timeout: Duration::from_millis(500),
            decode_timeout: Duration::from_millis(500),
            ..LoadSettings::default()
        };
        Rig {
            orchestrator: PlaybackOrchestrator::new(setlist, settings, tx),
            session: Session::new(Modifiers::default()),
            clock: GigClock::new(audio.clone()),
            host: RecordingHost::default(),
            events: rx,
        }
    }

    fn expect_job(advance: Advance) -> LoadJob {
        match advance {
            Advance::Load(job) => job,
            other => panic!("expected a load job, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_rung_wins_when_available() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        assert!(r.session.song_transitioning(), "loading while the job runs");

        let outcome = job.run(audio.clone()).await;
        let loaded = outcome.result.clone().expect("buffer load succeeds");
        assert_eq!(loaded.source, SourceKind::Buffer, "first rung");
        assert_eq!(loaded.notes.len(), 9, "timeline inside the excerpt");
        assert!((loaded.start_time_sec - 12.0).abs() < 1e-9, "audio time + lead-in");
        assert_eq!(audio.calls(), vec!["fetch", "decode", "buffer"], "no later rung tried");

        let v = r.session.notes_version;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);
        assert_eq!(r.session.phase, Phase::Playing, "song is playing");
        assert_eq!(r.session.notes_version, v + 1, "notes version bumped");
        assert!((r.session.total_duration - 10_000.0).abs() < 1e-9, "revised up to the excerpt");
        assert!(r.session.on_final_song, "single-song setlist");
        assert!((r.clock.now() + 2_000.0).abs() < 1e-9, "clock started behind the lead-in");
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_falls_through_to_synthesis() {
        let audio = Arc::new(ScriptedAudio { fetch: Step::Hang, ..ScriptedAudio::default() });
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let outcome = job.run(audio.clone()).await;
        let loaded = outcome.result.expect("synthesis succeeds");
        assert_eq!(loaded.source, SourceKind::Synthesized, "second rung");
        assert_eq!(audio.calls(), vec!["fetch", "synth"], "decode skipped after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn decode_timeout_and_missing_timeline_reach_procedural() {
        let audio = Arc::new(ScriptedAudio { decode: Step::Hang, ..ScriptedAudio::default() });
        let mut song = song_with_timeline("a");
        song.timeline.clear();
        let mut r = rig(vec![song], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let loaded = job.run(audio.clone()).await.result.expect("procedural succeeds");
        assert_eq!(loaded.source, SourceKind::Procedural, "third rung");
        assert!(!loaded.notes.is_empty(), "generated chart");
        assert_eq!(audio.calls(), vec!["fetch", "decode", "procedural"], "rung order");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_ladder_is_reported_once_and_aborts() {
        let audio = Arc::new(ScriptedAudio {
            fetch: Step::Fail,
            synth_plays: false,
            procedural_plays: false,
            ..ScriptedAudio::default()
        });
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let outcome = job.run(audio.clone()).await;
        assert_eq!(
            outcome.result,
            Err(LoadError::NoPlayableSource { title: "a".into() }),
            "all rungs failed"
        );
        let next = r
            .orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);
        assert!(matches!(next, Advance::Aborted), "first song failing aborts, got {next:?}");
        assert_eq!(r.host.errors.len(), 1, "surfaced once");
        assert!(r.session.notes.is_empty(), "no notes assigned");
    }

    #[tokio::test(start_paused = true)]
    async fn locked_audio_never_attempts_playback() {
        let audio = Arc::new(ScriptedAudio { unlocked: false, ..ScriptedAudio::default() });
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let outcome = job.run(audio.clone()).await;
        assert_eq!(outcome.result, Err(LoadError::AudioLocked), "locked");
        assert!(audio.calls().is_empty(), "no fetch or play attempted");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_job_abandons_and_stale_result_is_discarded() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a"), song_with_timeline("b")], &audio);
        let first = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let second = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 1));

        let stale = first.run(audio.clone()).await;
        assert_eq!(stale.result, Err(LoadError::Superseded), "stale job gives up");
        assert!(audio.calls().is_empty(), "stale job never touched the audio");

        let fresh = second.run(audio.clone()).await;
        // A stale success arriving after the fresh one must not clobber it.
        let mut late = fresh.clone();
        late.request = RequestId(fresh.request.0 - 1);
        late.song_index = 0;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, fresh);
        let notes_before = r.session.notes.clone();
        let version = r.session.notes_version;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, late);
        assert_eq!(r.session.notes, notes_before, "stale result ignored");
        assert_eq!(r.session.notes_version, version, "no version bump");
        assert_eq!(r.session.current_song, Some(1), "current song unchanged");
    }

    #[tokio::test(start_paused = true)]
    async fn ended_event_chains_unless_session_is_over() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a"), song_with_timeline("b")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let request = job.request();
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);

        let stale = PlaybackEvent::Ended { request: RequestId(request.0 + 7), song_index: 0 };
        assert!(
            matches!(r.orchestrator.on_playback_event(&mut r.session, &r.clock, stale), Advance::Idle),
            "unknown request is ignored"
        );

        let ended = PlaybackEvent::Ended { request, song_index: 0 };
        let next = r.orchestrator.on_playback_event(&mut r.session, &r.clock, ended.clone());
        let job = expect_job(next);
        assert_eq!(job.song_index(), 1, "chains to the next entry");

        r.session.transition(PhaseEvent::Finalize);
        let again = PlaybackEvent::Ended { request: job.request(), song_index: 1 };
        assert!(
            matches!(r.orchestrator.on_playback_event(&mut r.session, &r.clock, again), Advance::Idle),
            "no chaining after results were submitted"
        );
        assert!(r.events.try_recv().is_err(), "scripted backend never fires on its own");
    }

    #[tokio::test(start_paused = true)]
    async fn last_song_end_snaps_duration_to_frozen_clock() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let request = job.request();
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);
        // ScriptedAudio time is fixed at 10s; the clock started 2s in the future.
        r.clock.pause();
        let frozen = r.clock.now();
        assert!(frozen < r.session.total_duration, "frozen below the target");

        let next = r
            .orchestrator
            .on_playback_event(&mut r.session, &r.clock, PlaybackEvent::Ended { request, song_index: 0 });
        assert!(matches!(next, Advance::SetlistComplete), "no more songs, got {next:?}");
        assert!(r.session.setlist_complete, "flagged");
        assert!(r.session.playback_ended, "natural end recorded");
        assert!((r.session.total_duration - frozen).abs() < 1e-9, "snapped to the clock");
    }

    #[tokio::test(start_paused = true)]
    async fn later_song_failure_skips_ahead() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a"), song_with_timeline("b")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);

        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 1));
        let failed = LoadOutcome {
            request: job.request(),
            song_index: 1,
            result: Err(LoadError::NoPlayableSource { title: "b".into() }),
        };
        let next = r
            .orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, failed);
        assert!(matches!(next, Advance::SetlistComplete), "skipped past the end, got {next:?}");
        assert_eq!(r.host.errors.len(), 1, "reported");
        assert!(!r.session.song_transitioning(), "not left loading");
    }

    #[tokio::test(start_paused = true)]
    async fn toxic_mode_keeps_its_remaining_time_across_songs() {
        let audio = Arc::new(ScriptedAudio::default());
        let mut r = rig(vec![song_with_timeline("a"), song_with_timeline("b")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);

        // 15s into song a, toxic mode activated at 12s: 7s left.
        r.clock.start(15_000.0, ClockStart::At(10.0));
        r.session.toxic = ToxicMode { active: true, end_time: 22_000.0 };

        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 1));
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);

        let now = r.clock.now();
        assert!((now + 2_000.0).abs() < 1e-9, "song b starts after the lead-in, got {now}");
        assert!(r.session.toxic.active, "still toxic");
        assert!(
            (r.session.toxic.end_time - (now + 7_000.0)).abs() < 1e-9,
            "7s left on the new clock, got {}",
            r.session.toxic.end_time
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duration_resolution_only_for_current_request() {
        let audio = Arc::new(ScriptedAudio { fetch: Step::Fail, ..ScriptedAudio::default() });
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let request = job.request();
        let outcome = job.run(audio.clone()).await;
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);
        let before = r.session.total_duration;

        r.orchestrator.on_playback_event(
            &mut r.session,
            &r.clock,
            PlaybackEvent::DurationResolved { request: RequestId(request.0 + 1), duration_ms: before + 5_000.0 },
        );
        assert!((r.session.total_duration - before).abs() < f64::EPSILON, "stale ignored");

        r.orchestrator.on_playback_event(
            &mut r.session,
            &r.clock,
            PlaybackEvent::DurationResolved { request, duration_ms: before + 5_000.0 },
        );
        assert!((r.session.total_duration - (before + 5_000.0)).abs() < 1e-9, "revised upward");
    }

    #[tokio::test(start_paused = true)]
    async fn duration_reported_during_load_applies_to_that_song() {
        let audio = Arc::new(ScriptedAudio { fetch: Step::Fail, ..ScriptedAudio::default() });
        let mut r = rig(vec![song_with_timeline("a")], &audio);
        let job = expect_job(r.orchestrator.advance(&mut r.session, &r.clock, 0));
        let request = job.request();
        let outcome = job.run(audio.clone()).await;
        r.orchestrator.on_playback_event(
            &mut r.session,
            &r.clock,
            PlaybackEvent::DurationResolved { request, duration_ms: 9_000.0 },
        );
        r.orchestrator
            .complete_load(&mut r.session, &mut r.clock, &mut r.host, outcome);
        assert!((r.session.total_duration - 9_000.0).abs() < 1e-9, "early report kept, got {}", r.session.total_duration);
    }

    #[test]
    fn gate_issues_monotonic_tokens() {
        let gate = RequestGate::default();
        let a = gate.issue();
        let b = gate.issue();
        assert!(b > a, "monotonic");
        assert!(gate.is_current(b) && !gate.is_current(a), "only latest is current");
        gate.invalidate();
        assert!(!gate.is_current(b), "invalidate stales everything");
    }

    #[test]
    fn setlist_estimate_sums_excerpts() {
        let songs = vec![song_with_timeline("a"), song_with_timeline("b")];
        let est = estimated_setlist_ms(&songs);
        assert!((est - (20_000.0 + 2.0 * setlist::NOTE_TAIL_MS)).abs() < 1e-9, "got {est}");
    }
}
