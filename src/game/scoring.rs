use log::{debug, info};

use crate::game::life::{self, TOXIC_MODE_DURATION_MS};
use crate::game::session::{Failsafe, MAX_HEALTH, MAX_OVERLOAD, Note, PhaseEvent, Session, ToxicMode};

pub const BASE_HIT_POINTS: f64 = 100.0;
pub const COMBO_BONUS_PER_STEP: f64 = 10.0;
pub const TOXIC_MULTIPLIER: f64 = 4.0;
pub const GUESTLIST_MULTIPLIER: f64 = 1.2;
pub const PERFEKTIONIST_MULTIPLIER: f64 = 1.15;
pub const PERFEKTIONIST_ACCURACY: f64 = 0.85;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MissOutcome {
    /// This call drove health to zero and flipped the session into game over.
    pub game_over: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HitOutcome {
    Hit {
        note_index: usize,
        points: u64,
        toxic_activated: bool,
    },
    /// No candidate in the window; counted as an empty hit.
    Empty(MissOutcome),
    /// Lane index out of range.
    Rejected,
}

impl HitOutcome {
    pub const fn game_over(&self) -> bool {
        matches!(self, Self::Empty(MissOutcome { game_over: true }))
    }
}

/// Picks the lane's live note closest to `now` within `window` ms.
/// Ties go to the earliest index. Requires `notes` sorted by time.
pub fn select_hit_candidate(notes: &[Note], lane_index: usize, now: f64, window: f64) -> Option<usize> {
    let first = notes.partition_point(|n| n.time < now - window);
    let mut best: Option<(usize, f64)> = None;
    for (index, note) in notes.iter().enumerate().skip(first) {
        if note.time > now + window {
            break;
        }
        if note.lane_index != lane_index || note.is_terminal() {
            continue;
        }
        let delta = (note.time - now).abs();
        match best {
            Some((_, best_delta)) if delta >= best_delta => {}
            _ => best = Some((index, delta)),
        }
    }
    best.map(|(index, _)| index)
}

fn activate_toxic_mode(session: &mut Session, now: f64) {
    session.toxic = ToxicMode {
        active: true,
        end_time: now + TOXIC_MODE_DURATION_MS,
    };
    session.overload = 0.0;
    info!("TOXIC MODE: active until {:.0}ms", session.toxic.end_time);
}

pub fn end_toxic_mode(session: &mut Session, reason: &str) {
    if session.toxic.active {
        session.toxic.active = false;
        info!("TOXIC MODE: ended ({reason})");
    }
}

pub fn handle_hit(session: &mut Session, lane_index: usize, now: f64) -> HitOutcome {
    let Some(lane) = session.lanes.get(lane_index) else {
        debug!("Hit on unknown lane {lane_index} ignored");
        return HitOutcome::Rejected;
    };
    let window = lane.hit_window_ms;

    let Some(note_index) = select_hit_candidate(&session.notes, lane_index, now, window) else {
        debug!("EMPTY HIT: lane {lane_index} at {now:.1}ms");
        return HitOutcome::Empty(handle_miss(session, 1, true));
    };
    session.notes[note_index].hit = true;

    let toxic = session.is_toxic_mode();
    let mut points = BASE_HIT_POINTS * session.resolved.lane_score_mult[lane_index];
    points += f64::from(session.combo) * COMBO_BONUS_PER_STEP;
    if toxic {
        points *= TOXIC_MULTIPLIER;
    }
    if session.modifiers.guestlist {
        points *= GUESTLIST_MULTIPLIER;
    }
    if session.modifiers.has_perfektionist && session.accuracy > PERFEKTIONIST_ACCURACY {
        points *= PERFEKTIONIST_MULTIPLIER;
    }
    let points = points.floor().max(0.0) as u64;

    session.score = session.score.saturating_add(points);
    session.combo = session.combo.saturating_add(1);
    session.stats.max_combo = session.stats.max_combo.max(session.combo);
    session.stats.perfect_hits = session.stats.perfect_hits.saturating_add(1);
    session.health = (session.health + life::health_regen(toxic)).min(MAX_HEALTH);

    let mut toxic_activated = false;
    if !toxic && session.modifiers.toxic_mode {
        session.overload = (session.overload + life::OVERLOAD_GAIN_HIT).min(MAX_OVERLOAD);
        session.stats.peak_hype = session.stats.peak_hype.max(session.overload);
        if session.overload >= MAX_OVERLOAD {
            activate_toxic_mode(session, now);
            toxic_activated = true;
        }
    }
    session.recompute_accuracy();

    debug!(
        "HIT: lane {lane_index}, note {note_index}, err {:.1}ms, +{points}, combo {}",
        now - session.notes[note_index].time,
        session.combo
    );
    HitOutcome::Hit {
        note_index,
        points,
        toxic_activated,
    }
}

/// Applies `count` misses at once. Empty hits (presses with nothing to hit)
/// are cheaper and do not count towards `stats.misses`.
pub fn handle_miss(session: &mut Session, count: u32, is_empty_hit: bool) -> MissOutcome {
    if count == 0 || session.has_submitted_results() {
        return MissOutcome::default();
    }
    if !is_empty_hit {
        end_toxic_mode(session, "missed note");
    }
    session.combo = 0;
    session.overload = (session.overload - life::overload_penalty(count, is_empty_hit)).max(0.0);
    let penalty = life::health_penalty(count, is_empty_hit, session.resolved.crowd_decay);
    session.health = (session.health - penalty).max(0.0);

    if !is_empty_hit {
        session.stats.misses = session.stats.misses.saturating_add(count);
        session.recompute_accuracy();
    }

    let mut outcome = MissOutcome::default();
    if session.health <= 0.0 && session.transition(PhaseEvent::HealthDepleted) {
        session.failsafe = Failsafe::Requested;
        outcome.game_over = true;
        info!("Health depleted. Game over.");
    }
    outcome
}
