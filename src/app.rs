use crate::core::audio::{AudioBackend, AudioClock, PlaybackEvent, RequestId};
use crate::core::input::InputSource;
use crate::game::clock::GigClock;
use crate::game::gameplay::{self, FinalizeTrigger, FrameAction, FrameCoordinator};
use crate::game::modifiers::Modifiers;
use crate::game::playback::{
    Advance, LoadError, LoadOutcome, LoadSettings, PlaybackOrchestrator, estimated_setlist_ms,
};
use crate::game::scoring::HitOutcome;
use crate::game::session::{Failsafe, Session};
use crate::game::setlist::SongEntry;
use crate::game::stage_stats::GigSummary;

use log::{debug, error, info, warn};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};

/* -------------------- host collaborator -------------------- */

/// What the embedding application provides: an error toast and the scene
/// transition that receives the results.
pub trait GigHost {
    fn report_error(&mut self, message: &str);
    fn gig_finished(&mut self, summary: &GigSummary);
}

/// Host that only logs. Keeps the results for whoever runs the gig.
#[derive(Debug, Default)]
pub struct LogHost {
    pub summary: Option<GigSummary>,
    pub errors: Vec<String>,
}

impl GigHost for LogHost {
    fn report_error(&mut self, message: &str) {
        error!("{message}");
        self.errors.push(message.to_string());
    }

    fn gig_finished(&mut self, summary: &GigSummary) {
        info!("Results ready: score {}", summary.score);
        self.summary = Some(*summary);
    }
}

/* -------------------- settings -------------------- */

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GigSettings {
    pub frame_period: Duration,
    pub failsafe_delay: Duration,
    pub load: LoadSettings,
}

impl Default for GigSettings {
    fn default() -> Self {
        Self {
            frame_period: Duration::from_micros(16_667),
            failsafe_delay: Duration::from_millis(3_000),
            load: LoadSettings::default(),
        }
    }
}

/* -------------------- gig -------------------- */

/// One performance attempt: the session and everything that drives it.
pub struct Gig<B: AudioBackend, H: GigHost> {
    session: Session,
    clock: GigClock,
    frame: FrameCoordinator,
    orchestrator: PlaybackOrchestrator,
    audio: Arc<B>,
    host: H,
    settings: GigSettings,
    loads: JoinSet<LoadOutcome>,
    load_tasks: FxHashMap<task::Id, (RequestId, usize)>,
    events: UnboundedReceiver<PlaybackEvent>,
    failsafe_tx: UnboundedSender<()>,
    failsafe_rx: UnboundedReceiver<()>,
    aborted: bool,
}

impl<B: AudioBackend, H: GigHost> Gig<B, H> {
    pub fn new(setlist: Vec<SongEntry>, modifiers: Modifiers, audio: Arc<B>, host: H, settings: GigSettings) -> Self {
        let (events_tx, events) = unbounded_channel();
        let (failsafe_tx, failsafe_rx) = unbounded_channel();
        let clock_source: Arc<dyn AudioClock> = audio.clone();
        Self {
            session: Session::new(modifiers),
            clock: GigClock::new(clock_source),
            frame: FrameCoordinator::new(),
            orchestrator: PlaybackOrchestrator::new(setlist, settings.load, events_tx),
            audio,
            host,
            settings,
            loads: JoinSet::new(),
            load_tasks: FxHashMap::default(),
            events,
            failsafe_tx,
            failsafe_rx,
            aborted: false,
        }
    }

    pub const fn session(&self) -> &Session {
        &self.session
    }

    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Kicks off the first song. Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        info!(
            "Starting gig with {} song(s), about {:.0}s of music",
            self.orchestrator.song_count(),
            estimated_setlist_ms(self.orchestrator.setlist()) / 1000.0
        );
        for lane in &self.session.lanes {
            debug!(
                "Lane '{}' on {} ({:.0}ms window, color {:?})",
                lane.id, lane.input_key, lane.hit_window_ms, lane.color
            );
        }
        let advance = self.orchestrator.advance(&mut self.session, &self.clock, 0);
        self.apply_advance(advance);
    }

    fn apply_advance(&mut self, advance: Advance) {
        match advance {
            Advance::Load(job) => {
                let audio = self.audio.clone();
                let key = (job.request(), job.song_index());
                let handle = self.loads.spawn(job.run(audio));
                self.load_tasks.insert(handle.id(), key);
            }
            Advance::Aborted => {
                warn!("Gig aborted: the opening song could not start");
                self.aborted = true;
                self.orchestrator.gate().invalidate();
            }
            Advance::SetlistComplete | Advance::Idle => {}
        }
    }

    pub fn on_load_complete(&mut self, outcome: LoadOutcome) {
        let advance = self.orchestrator.complete_load(
            &mut self.session,
            &mut self.clock,
            &mut self.host,
            outcome,
        );
        self.apply_advance(advance);
    }

    /// A load task that died without an outcome counts as a failed load.
    fn on_load_task_failed(&mut self, err: JoinError) {
        let Some((request, song_index)) = self.load_tasks.remove(&err.id()) else {
            error!("Untracked load task failed: {err}");
            return;
        };
        error!("Load task for song {} failed: {err}", song_index + 1);
        let title = self
            .orchestrator
            .setlist()
            .get(song_index)
            .map(|s| s.title.clone())
            .unwrap_or_default();
        self.on_load_complete(LoadOutcome {
            request,
            song_index,
            result: Err(LoadError::LoaderFailed { title }),
        });
    }

    pub fn on_playback_event(&mut self, event: PlaybackEvent) {
        let advance = self
            .orchestrator
            .on_playback_event(&mut self.session, &self.clock, event);
        self.apply_advance(advance);
    }

    pub fn register_input(&mut self, lane: usize, pressed: bool) -> Option<HitOutcome> {
        let outcome = gameplay::register_input(
            &mut self.session,
            &self.clock,
            self.audio.as_ref(),
            lane,
            pressed,
        );
        self.arm_failsafe();
        outcome
    }

    pub fn update(&mut self, delta_ms: f64) -> FrameAction {
        let action = self.frame.update(
            &mut self.session,
            &mut self.clock,
            self.audio.as_ref(),
            &mut self.host,
            delta_ms,
        );
        if action == FrameAction::SongOverrun {
            let advance = self
                .orchestrator
                .skip_overrun_song(&mut self.session, &self.clock);
            self.apply_advance(advance);
        }
        self.arm_failsafe();
        action
    }

    /// Player quit: results are submitted first so in-flight chaining stops.
    pub fn quit(&mut self) -> bool {
        let finalized = gameplay::finalize(
            &mut self.session,
            &mut self.clock,
            self.audio.as_ref(),
            &mut self.host,
            FinalizeTrigger::Quit,
        );
        self.orchestrator.gate().invalidate();
        finalized
    }

    fn arm_failsafe(&mut self) {
        if self.session.failsafe != Failsafe::Requested {
            return;
        }
        self.session.failsafe = Failsafe::Scheduled;
        let delay = self.settings.failsafe_delay;
        let tx = self.failsafe_tx.clone();
        info!("Game over: forcing results in {delay:?}");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
    }

    fn fire_failsafe(&mut self) {
        if self.session.failsafe != Failsafe::Scheduled {
            return;
        }
        self.session.failsafe = Failsafe::Fired;
        gameplay::finalize(
            &mut self.session,
            &mut self.clock,
            self.audio.as_ref(),
            &mut self.host,
            FinalizeTrigger::Failsafe,
        );
    }

    /// Runs the gig to completion. `None` when it never got going.
    pub async fn run<I: InputSource>(&mut self, input: &mut I) -> Option<GigSummary> {
        self.start();
        let mut ticker = tokio::time::interval(self.settings.frame_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        while !self.session.has_submitted_results() && !self.aborted {
            tokio::select! {
                Some(joined) = self.loads.join_next_with_id(), if !self.loads.is_empty() => match joined {
                    Ok((id, outcome)) => {
                        self.load_tasks.remove(&id);
                        self.on_load_complete(outcome);
                    }
                    Err(e) => self.on_load_task_failed(e),
                },
                Some(event) = self.events.recv() => self.on_playback_event(event),
                Some(()) = self.failsafe_rx.recv() => self.fire_failsafe(),
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let delta_ms = now.duration_since(last_frame).as_secs_f64() * 1000.0;
                    last_frame = now;
                    for ev in input.poll(&self.session, self.clock.now()) {
                        self.register_input(ev.lane, ev.pressed);
                    }
                    self.update(delta_ms);
                }
            }
        }

        if !self.loads.is_empty() {
            debug!("Abandoning {} in-flight load(s)", self.loads.len());
            self.loads.abort_all();
        }
        self.load_tasks.clear();
        if self.aborted {
            return None;
        }
        self.session.summary
    }
}
