use bitflags::bitflags;
use log::debug;

use crate::game::modifiers::Modifiers;
use crate::game::stage_stats::GigSummary;
use crate::game::timing_windows;

pub const LANE_COUNT: usize = 3;
pub const GUITAR_LANE: usize = 0;
pub const DRUM_LANE: usize = 1;
pub const BASS_LANE: usize = 2;

pub const MAX_HEALTH: f64 = 100.0;
pub const MAX_OVERLOAD: f64 = 100.0;

#[derive(Clone, Debug, PartialEq)]
pub struct Lane {
    pub id: &'static str,
    pub input_key: &'static str,
    pub color: [f32; 4],
    pub hit_window_ms: f64,
    /// Press state for rendering only; input handling toggles it directly.
    pub active: bool,
}

fn default_lanes() -> [Lane; LANE_COUNT] {
    [
        Lane {
            id: "guitar",
            input_key: "ArrowLeft",
            color: [0.91, 0.25, 0.52, 1.0],
            hit_window_ms: timing_windows::BASE_HIT_WINDOW_MS,
            active: false,
        },
        Lane {
            id: "drums",
            input_key: "ArrowDown",
            color: [0.25, 0.78, 0.96, 1.0],
            hit_window_ms: timing_windows::BASE_HIT_WINDOW_MS,
            active: false,
        },
        Lane {
            id: "bass",
            input_key: "ArrowRight",
            color: [0.55, 0.92, 0.30, 1.0],
            hit_window_ms: timing_windows::BASE_HIT_WINDOW_MS,
            active: false,
        },
    ]
}

#[derive(Clone, Debug, PartialEq)]
pub struct Note {
    /// Gig-clock relative time in ms.
    pub time: f64,
    pub lane_index: usize,
    pub visible: bool,
    pub hit: bool,
    pub original_pitch: Option<u8>,
    pub velocity: Option<u8>,
}

impl Note {
    pub const fn new(time: f64, lane_index: usize) -> Self {
        Self {
            time,
            lane_index,
            visible: true,
            hit: false,
            original_pitch: None,
            velocity: None,
        }
    }

    /// Hit or missed. A terminal note is never revisited.
    #[inline(always)]
    pub const fn is_terminal(&self) -> bool {
        self.hit || !self.visible
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GigStats {
    pub perfect_hits: u32,
    pub misses: u32,
    pub max_combo: u32,
    pub peak_hype: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ToxicMode {
    pub active: bool,
    pub end_time: f64,
}

/// Values the engine derives from [`Modifiers`]; rewritten on every
/// `apply_modifiers`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedModifiers {
    pub lane_score_mult: [f64; LANE_COUNT],
    pub drum_multiplier: f64,
    pub miss_window_ms: f64,
    pub crowd_decay: f64,
}

impl Default for ResolvedModifiers {
    fn default() -> Self {
        Self {
            lane_score_mult: [1.0; LANE_COUNT],
            drum_multiplier: 1.0,
            miss_window_ms: timing_windows::BASE_HIT_WINDOW_MS,
            crowd_decay: 1.0,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PauseRequest: u8 {
        const EXPLICIT = 1 << 0;
        const MODAL = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// A song is being resolved; input is ignored.
    Loading,
    Playing,
    Paused,
    /// Health reached zero; waiting for the failsafe to finalize.
    GameOver,
    /// Results submitted. Terminal.
    Ended { game_over: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    SongLoading,
    SongReady,
    Pause,
    Resume,
    HealthDepleted,
    Finalize,
}

impl Phase {
    pub const fn next(self, event: PhaseEvent) -> Option<Self> {
        use PhaseEvent as E;
        match (self, event) {
            (Self::Ended { .. }, _) => None,
            (Self::GameOver, E::Finalize) => Some(Self::Ended { game_over: true }),
            (Self::GameOver, _) => None,
            (_, E::Finalize) => Some(Self::Ended { game_over: false }),
            (_, E::HealthDepleted) => Some(Self::GameOver),
            (Self::Loading | Self::Playing | Self::Paused, E::SongLoading) => Some(Self::Loading),
            (Self::Loading, E::SongReady) => Some(Self::Playing),
            (Self::Playing, E::Pause) => Some(Self::Paused),
            (Self::Paused, E::Resume) => Some(Self::Playing),
            (Self::Playing | Self::Paused, E::SongReady)
            | (Self::Loading | Self::Paused, E::Pause)
            | (Self::Loading | Self::Playing, E::Resume) => None,
        }
    }
}

/// One-shot safety net armed when health reaches zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Failsafe {
    #[default]
    Idle,
    Requested,
    Scheduled,
    Fired,
}

/// The single mutable record of a performance attempt. Renderers only read it;
/// the one exception is [`Lane::active`].
#[derive(Clone, Debug)]
pub struct Session {
    pub lanes: [Lane; LANE_COUNT],
    pub notes: Vec<Note>,
    /// Bumped whenever `notes` is replaced, so consumers can tell "new chart"
    /// apart from "no chart yet".
    pub notes_version: u32,
    pub next_miss_check_index: usize,

    pub score: u64,
    pub combo: u32,
    pub health: f64,
    pub overload: f64,
    pub toxic: ToxicMode,
    pub toxic_time_total: f64,
    pub accuracy: f64,
    pub stats: GigStats,

    pub phase: Phase,
    pub pause_requests: PauseRequest,
    pub failsafe: Failsafe,

    pub total_duration: f64,
    duration_revised: bool,
    pub elapsed: f64,
    pub progress: f64,

    pub current_song: Option<usize>,
    pub songs_started: u32,
    pub on_final_song: bool,
    pub playback_ended: bool,
    pub setlist_complete: bool,

    pub modifiers: Modifiers,
    pub resolved: ResolvedModifiers,
    pub summary: Option<GigSummary>,
}

impl Session {
    pub fn new(modifiers: Modifiers) -> Self {
        let mut session = Self {
            lanes: default_lanes(),
            notes: Vec::new(),
            notes_version: 0,
            next_miss_check_index: 0,
            score: 0,
            combo: 0,
            health: MAX_HEALTH,
            overload: 0.0,
            toxic: ToxicMode::default(),
            toxic_time_total: 0.0,
            accuracy: 0.0,
            stats: GigStats::default(),
            phase: Phase::Loading,
            pause_requests: PauseRequest::empty(),
            failsafe: Failsafe::Idle,
            total_duration: 0.0,
            duration_revised: false,
            elapsed: 0.0,
            progress: 0.0,
            current_song: None,
            songs_started: 0,
            on_final_song: false,
            playback_ended: false,
            setlist_complete: false,
            modifiers,
            resolved: ResolvedModifiers::default(),
            summary: None,
        };
        session.apply_modifiers();
        session
    }

    /// Recomputes lane windows and the resolved multipliers from `modifiers`.
    pub fn apply_modifiers(&mut self) {
        let m = &self.modifiers;
        let mut lane_score_mult = [1.0; LANE_COUNT];
        lane_score_mult[GUITAR_LANE] = m.guitar_score_mult;
        lane_score_mult[DRUM_LANE] = m.drum_multiplier;
        lane_score_mult[BASS_LANE] = m.bass_score_mult;
        for (index, lane) in self.lanes.iter_mut().enumerate() {
            lane.hit_window_ms = timing_windows::lane_hit_window_ms(index, m);
        }
        self.resolved = ResolvedModifiers {
            lane_score_mult,
            drum_multiplier: m.drum_multiplier,
            miss_window_ms: timing_windows::miss_window_ms(&self.lanes),
            crowd_decay: m.effective_crowd_decay(),
        };
    }

    pub fn transition(&mut self, event: PhaseEvent) -> bool {
        match self.phase.next(event) {
            Some(next) => {
                debug!("Session phase {:?} -> {:?} on {:?}", self.phase, next, event);
                self.phase = next;
                true
            }
            None => {
                debug!("Ignored {:?} in phase {:?}", event, self.phase);
                false
            }
        }
    }

    #[inline(always)]
    pub const fn song_transitioning(&self) -> bool {
        matches!(self.phase, Phase::Loading)
    }

    #[inline(always)]
    pub const fn is_game_over(&self) -> bool {
        matches!(self.phase, Phase::GameOver | Phase::Ended { game_over: true })
    }

    #[inline(always)]
    pub const fn has_submitted_results(&self) -> bool {
        matches!(self.phase, Phase::Ended { .. })
    }

    #[inline(always)]
    pub const fn is_toxic_mode(&self) -> bool {
        self.toxic.active
    }

    /// Replaces the chart wholesale and rewinds the miss cursor.
    pub fn replace_notes(&mut self, notes: Vec<Note>, total_duration: f64) {
        self.notes = notes;
        self.next_miss_check_index = 0;
        self.notes_version = self.notes_version.wrapping_add(1);
        self.total_duration = total_duration.max(0.0);
        self.duration_revised = false;
        self.playback_ended = false;
        self.elapsed = 0.0;
        self.progress = 0.0;
    }

    /// Raises `total_duration` to the authoritative audio length. Applies at most
    /// once per song and never lowers it.
    pub fn revise_total_duration(&mut self, authoritative_ms: f64) -> bool {
        if self.duration_revised || !authoritative_ms.is_finite() {
            return false;
        }
        if authoritative_ms <= self.total_duration {
            return false;
        }
        debug!(
            "Total duration revised {:.0}ms -> {:.0}ms",
            self.total_duration, authoritative_ms
        );
        self.total_duration = authoritative_ms;
        self.duration_revised = true;
        true
    }

    pub fn recompute_accuracy(&mut self) {
        let attempts = self.stats.perfect_hits + self.stats.misses;
        self.accuracy = if attempts == 0 {
            0.0
        } else {
            f64::from(self.stats.perfect_hits) / f64::from(attempts)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ended_is_a_write_once_latch() {
        let mut s = Session::new(Modifiers::default());
        assert!(s.transition(PhaseEvent::SongReady), "loading -> playing");
        assert!(s.transition(PhaseEvent::Finalize), "playing -> ended");
        assert!(s.has_submitted_results(), "ended must report submitted results");
        for ev in [
            PhaseEvent::SongLoading,
            PhaseEvent::SongReady,
            PhaseEvent::Pause,
            PhaseEvent::Resume,
            PhaseEvent::HealthDepleted,
            PhaseEvent::Finalize,
        ] {
            assert!(!s.transition(ev), "ended must reject {ev:?}");
        }
        assert_eq!(s.phase, Phase::Ended { game_over: false }, "phase unchanged");
    }

    #[test]
    fn game_over_only_leaves_through_finalize() {
        let mut s = Session::new(Modifiers::default());
        s.transition(PhaseEvent::SongReady);
        assert!(s.transition(PhaseEvent::HealthDepleted), "playing -> game over");
        assert!(!s.transition(PhaseEvent::HealthDepleted), "second depletion is rejected");
        assert!(!s.transition(PhaseEvent::Resume), "no resume out of game over");
        assert!(s.is_game_over(), "still game over");
        assert!(s.transition(PhaseEvent::Finalize), "game over -> ended");
        assert!(s.is_game_over(), "ended after game over keeps the flag");
        assert!(s.has_submitted_results(), "and is submitted");
    }

    #[test]
    fn pause_and_resume_only_from_matching_phase() {
        let mut s = Session::new(Modifiers::default());
        assert!(!s.transition(PhaseEvent::Pause), "cannot pause while loading");
        s.transition(PhaseEvent::SongReady);
        assert!(s.transition(PhaseEvent::Pause), "playing -> paused");
        assert!(!s.transition(PhaseEvent::Pause), "already paused");
        assert!(s.transition(PhaseEvent::Resume), "paused -> playing");
    }

    #[test]
    fn total_duration_revises_upward_once() {
        let mut s = Session::new(Modifiers::default());
        s.replace_notes(vec![Note::new(1000.0, 0)], 5000.0);
        assert!(!s.revise_total_duration(4000.0), "never downward");
        assert!(s.revise_total_duration(6000.0), "first upward revision applies");
        assert!(!s.revise_total_duration(7000.0), "only once per song");
        assert!((s.total_duration - 6000.0).abs() < f64::EPSILON, "got {}", s.total_duration);

        s.replace_notes(Vec::new(), 1000.0);
        assert!(s.revise_total_duration(2000.0), "new song rearms the revision");
    }

    #[test]
    fn replacing_notes_resets_cursor_and_bumps_version() {
        let mut s = Session::new(Modifiers::default());
        s.replace_notes(vec![Note::new(0.0, 0), Note::new(10.0, 1)], 100.0);
        s.next_miss_check_index = 2;
        let v = s.notes_version;
        s.replace_notes(vec![Note::new(5.0, 2)], 100.0);
        assert_eq!(s.next_miss_check_index, 0, "cursor rewinds");
        assert_eq!(s.notes_version, v + 1, "version bumps");
    }

    #[test]
    fn changing_modifiers_recomputes_lane_windows() {
        let mut s = Session::new(Modifiers::default());
        s.modifiers = Modifiers {
            hit_window_bonus: 50.0,
            drum_multiplier: 2.0,
            ..Modifiers::default()
        };
        s.apply_modifiers();
        assert!((s.lanes[DRUM_LANE].hit_window_ms - 200.0).abs() < 1e-9, "bonus applied");
        assert!((s.resolved.miss_window_ms - 200.0).abs() < 1e-9, "miss window follows");
        assert!((s.resolved.lane_score_mult[DRUM_LANE] - 2.0).abs() < 1e-9, "drum multiplier resolved");
    }

    #[test]
    fn accuracy_is_zero_without_attempts() {
        let mut s = Session::new(Modifiers::default());
        s.recompute_accuracy();
        assert!(s.accuracy.abs() < f64::EPSILON, "no attempts yet");
        s.stats.perfect_hits = 3;
        s.stats.misses = 1;
        s.recompute_accuracy();
        assert!((s.accuracy - 0.75).abs() < 1e-9, "got {}", s.accuracy);
    }
}
