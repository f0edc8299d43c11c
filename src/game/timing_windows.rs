// Shared hit window definitions to keep scoring, the miss-sweep and completion
// detection in agreement.

use crate::game::modifiers::Modifiers;
use crate::game::session::{GUITAR_LANE, Lane};

// All windows are in milliseconds and symmetric around the note time.
pub const BASE_HIT_WINDOW_MS: f64 = 150.0;

/// Effective window for a lane: base plus the modifier bonus, with the guitar
/// lane additionally divided by its difficulty.
#[inline(always)]
pub fn lane_hit_window_ms(lane_index: usize, modifiers: &Modifiers) -> f64 {
    let mut window = BASE_HIT_WINDOW_MS + modifiers.hit_window_bonus;
    if lane_index == GUITAR_LANE {
        window /= modifiers.effective_guitar_difficulty();
    }
    window
}

/// The widest lane window. A note further than this in the future cannot be
/// late yet, and completion checks use it as their tolerance.
#[inline(always)]
pub fn miss_window_ms(lanes: &[Lane]) -> f64 {
    lanes
        .iter()
        .map(|l| l.hit_window_ms)
        .fold(0.0, f64::max)
}
