// Health and overload deltas. Health and overload both live in [0, 100].

pub const HEALTH_REGEN_HIT: f64 = 2.0;
pub const HEALTH_REGEN_HIT_TOXIC: f64 = 1.0;
pub const HEALTH_LOSS_MISS: f64 = 2.0;
pub const HEALTH_LOSS_EMPTY_HIT: f64 = 1.0;

pub const OVERLOAD_GAIN_HIT: f64 = 4.0;
pub const OVERLOAD_LOSS_MISS: f64 = 5.0;
pub const OVERLOAD_LOSS_EMPTY_HIT: f64 = 2.0;

// Crowd decay never scales a penalty below this.
pub const MIN_CROWD_DECAY: f64 = 0.1;

pub const TOXIC_MODE_DURATION_MS: f64 = 10_000.0;

#[inline(always)]
pub const fn health_regen(toxic: bool) -> f64 {
    if toxic { HEALTH_REGEN_HIT_TOXIC } else { HEALTH_REGEN_HIT }
}

#[inline(always)]
pub fn health_penalty(count: u32, is_empty_hit: bool, crowd_decay: f64) -> f64 {
    let per = if is_empty_hit { HEALTH_LOSS_EMPTY_HIT } else { HEALTH_LOSS_MISS };
    per * f64::from(count) * crowd_decay.max(MIN_CROWD_DECAY)
}

#[inline(always)]
pub fn overload_penalty(count: u32, is_empty_hit: bool) -> f64 {
    let per = if is_empty_hit { OVERLOAD_LOSS_EMPTY_HIT } else { OVERLOAD_LOSS_MISS };
    per * f64::from(count)
}
