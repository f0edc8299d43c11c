use log::{debug, info};

use crate::app::GigHost;
use crate::core::audio::AudioTransport;
use crate::game::clock::GigClock;
use crate::game::scoring::{self, HitOutcome};
use crate::game::session::{PhaseEvent, Session};
use crate::game::stage_stats::build_snapshot;

/// How long a non-final song may run past its duration without the audio
/// reporting an end before the coordinator moves on.
pub const SONG_OVERRUN_GRACE_MS: f64 = 2_000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// The gig was finalized during this tick.
    Finished,
    /// The current (non-final) song overran without an end event.
    SongOverrun,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizeTrigger {
    Completed,
    Failsafe,
    Quit,
}

/* ============================== Finalize ============================== */

/// One-shot end of the gig. Returns `false` (and does nothing) when results
/// were already submitted.
pub fn finalize(
    session: &mut Session,
    clock: &mut GigClock,
    audio: &dyn AudioTransport,
    host: &mut dyn GigHost,
    trigger: FinalizeTrigger,
) -> bool {
    if !session.transition(PhaseEvent::Finalize) {
        debug!("Finalize via {trigger:?} ignored: results already submitted");
        return false;
    }
    clock.stop();
    audio.stop();
    let summary = build_snapshot(session.score, &session.stats, session.toxic_time_total);
    session.summary = Some(summary);
    info!(
        "Gig finalized via {:?}: score {}, perfect {}, misses {}, max combo {}, game over {}",
        trigger,
        summary.score,
        summary.perfect_hits,
        summary.misses,
        summary.max_combo,
        session.is_game_over()
    );
    host.gig_finished(&summary);
    true
}

/* ============================== Input ============================== */

#[inline(always)]
pub fn accepts_input(session: &Session, audio: &dyn AudioTransport) -> bool {
    !session.song_transitioning()
        && !session.is_game_over()
        && !session.has_submitted_results()
        && session.pause_requests.is_empty()
        && audio.is_running()
}

/// Lane press/release from the input subsystem. Press state always reaches
/// `Lane::active`; only accepted presses are judged.
pub fn register_input(
    session: &mut Session,
    clock: &GigClock,
    audio: &dyn AudioTransport,
    lane_index: usize,
    pressed: bool,
) -> Option<HitOutcome> {
    let lane = session.lanes.get_mut(lane_index)?;
    lane.active = pressed;
    if !pressed || !accepts_input(session, audio) {
        return None;
    }
    let outcome = scoring::handle_hit(session, lane_index, clock.now());
    if outcome.game_over() {
        audio.stop();
    }
    Some(outcome)
}

/* ============================== Miss sweep ============================== */

/// Marks every live note whose window has fully elapsed as missed and moves
/// the cursor over the terminal prefix. Returns the number of new misses.
pub fn sweep_misses(session: &mut Session, now: f64) -> u32 {
    let window = session.resolved.miss_window_ms;
    let mut misses = 0u32;
    let mut leading = true;
    let mut index = session.next_miss_check_index;
    while index < session.notes.len() {
        let note = &mut session.notes[index];
        if note.time > now + window {
            break;
        }
        if !note.is_terminal() && note.time + window < now {
            note.visible = false;
            misses += 1;
        }
        if leading && note.is_terminal() {
            session.next_miss_check_index = index + 1;
        } else {
            leading = false;
        }
        index += 1;
    }
    misses
}

/* ============================== Frame ============================== */

#[derive(Debug, Default)]
pub struct FrameCoordinator {
    was_paused: bool,
}

impl FrameCoordinator {
    pub const fn new() -> Self {
        Self { was_paused: false }
    }

    pub fn update(
        &mut self,
        session: &mut Session,
        clock: &mut GigClock,
        audio: &dyn AudioTransport,
        host: &mut dyn GigHost,
        delta_ms: f64,
    ) -> FrameAction {
        if session.song_transitioning() || session.has_submitted_results() {
            return FrameAction::Continue;
        }

        if !session.pause_requests.is_empty() || session.is_game_over() {
            if !self.was_paused {
                self.was_paused = true;
                clock.pause();
                audio.pause_transport();
                session.transition(PhaseEvent::Pause);
                debug!("Frame loop paused at {:.1}ms", clock.now());
            }
            return FrameAction::Continue;
        }
        if self.was_paused {
            self.was_paused = false;
            audio.resume_transport();
            clock.resume();
            session.transition(PhaseEvent::Resume);
            debug!("Frame loop resumed at {:.1}ms", clock.now());
        }

        let now = clock.now();
        session.elapsed = now;
        session.progress = if session.total_duration > 0.0 {
            (now / session.total_duration * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        if session.is_toxic_mode() {
            if now > session.toxic.end_time {
                scoring::end_toxic_mode(session, "expired");
            } else {
                session.toxic_time_total += delta_ms.max(0.0);
            }
        }

        if completion_reached(session, now) {
            finalize(session, clock, audio, host, FinalizeTrigger::Completed);
            return FrameAction::Finished;
        }

        let misses = sweep_misses(session, now);
        if misses > 0 {
            debug!("MISS sweep: {misses} note(s) at {now:.1}ms");
            if scoring::handle_miss(session, misses, false).game_over {
                audio.stop();
            }
        }

        if !session.on_final_song
            && !session.setlist_complete
            && !session.playback_ended
            && now >= session.total_duration + SONG_OVERRUN_GRACE_MS
        {
            return FrameAction::SongOverrun;
        }
        FrameAction::Continue
    }
}

/// Any one of: the clock reached the end; the audio ended and the clock is
/// within a miss window of the end; every note is swept and the clock is
/// within a miss window of the end. Only armed for the last song.
fn completion_reached(session: &Session, now: f64) -> bool {
    if !(session.on_final_song || session.setlist_complete) {
        return false;
    }
    let total = session.total_duration;
    let near_end = now >= total - session.resolved.miss_window_ms;
    let all_swept = session.next_miss_check_index >= session.notes.len();
    now >= total || (session.playback_ended && near_end) || (all_swept && near_end)
}
