use serde::{Deserialize, Serialize};

use crate::game::session::GigStats;

/// Results handed to the hosting economy/persistence layer when a gig ends.
/// Field names on the wire are fixed.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GigSummary {
    pub score: u64,
    pub misses: u32,
    pub perfect_hits: u32,
    pub max_combo: u32,
    pub peak_hype: f64,
    pub toxic_time_total: f64,
}

pub fn build_snapshot(score: u64, stats: &GigStats, toxic_time_total: f64) -> GigSummary {
    GigSummary {
        score,
        misses: stats.misses,
        perfect_hits: stats.perfect_hits,
        max_combo: stats.max_combo,
        peak_hype: stats.peak_hype,
        toxic_time_total,
    }
}
