use serde::{Deserialize, Serialize};

use crate::game::life::MIN_CROWD_DECAY;

pub const MAX_HIT_WINDOW_BONUS_MS: f64 = 150.0;
pub const MAX_MULTIPLIER: f64 = 10.0;
pub const MIN_GUITAR_DIFFICULTY: f64 = 0.1;

/// Multipliers supplied by the hosting context. Read-only for the engine;
/// derived values go to `Session::resolved`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Modifiers {
    /// Added to every lane's base hit window, in ms. Range [0, 150].
    pub hit_window_bonus: f64,
    /// Score multiplier for the drum lane. Range (0, 10].
    pub drum_multiplier: f64,
    /// Score multiplier for the guitar lane. Range (0, 10].
    pub guitar_score_mult: f64,
    /// Score multiplier for the bass lane. Range (0, 10].
    pub bass_score_mult: f64,
    /// x1.2 on every hit.
    pub guestlist: bool,
    /// x1.15 on hits while accuracy is above 85%.
    pub has_perfektionist: bool,
    /// Scales health loss. Range [0, 10]; never applied below 0.1.
    pub crowd_decay: f64,
    /// Divides the guitar lane's hit window. Range (0, 10]; never applied below 0.1.
    pub guitar_difficulty: f64,
    /// When false, hits build no overload and toxic mode never starts.
    pub toxic_mode: bool,
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            hit_window_bonus: 0.0,
            drum_multiplier: 1.0,
            guitar_score_mult: 1.0,
            bass_score_mult: 1.0,
            guestlist: false,
            has_perfektionist: false,
            crowd_decay: 1.0,
            guitar_difficulty: 1.0,
            toxic_mode: true,
        }
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64, min_inclusive: bool) -> Result<(), String> {
    let above_min = if min_inclusive { value >= min } else { value > min };
    if value.is_finite() && above_min && value <= max {
        Ok(())
    } else {
        let open = if min_inclusive { '[' } else { '(' };
        Err(format!("modifier '{name}' = {value} is outside {open}{min}, {max}]"))
    }
}

impl Modifiers {
    /// Parses and validates a modifier map. Unknown keys are an error.
    pub fn from_json(text: &str) -> Result<Self, String> {
        let modifiers: Self =
            serde_json::from_str(text).map_err(|e| format!("invalid modifiers: {e}"))?;
        modifiers.validate()?;
        Ok(modifiers)
    }

    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read modifiers {}: {e}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<(), String> {
        check_range("hitWindowBonus", self.hit_window_bonus, 0.0, MAX_HIT_WINDOW_BONUS_MS, true)?;
        check_range("drumMultiplier", self.drum_multiplier, 0.0, MAX_MULTIPLIER, false)?;
        check_range("guitarScoreMult", self.guitar_score_mult, 0.0, MAX_MULTIPLIER, false)?;
        check_range("bassScoreMult", self.bass_score_mult, 0.0, MAX_MULTIPLIER, false)?;
        check_range("crowdDecay", self.crowd_decay, 0.0, MAX_MULTIPLIER, true)?;
        check_range("guitarDifficulty", self.guitar_difficulty, 0.0, MAX_MULTIPLIER, false)?;
        Ok(())
    }

    #[inline(always)]
    pub fn effective_crowd_decay(&self) -> f64 {
        self.crowd_decay.max(MIN_CROWD_DECAY)
    }

    #[inline(always)]
    pub fn effective_guitar_difficulty(&self) -> f64 {
        self.guitar_difficulty.max(MIN_GUITAR_DIFFICULTY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let m = Modifiers::from_json(r#"{ "guestlist": true }"#).expect("valid modifiers");
        assert!(m.guestlist, "explicit key applied");
        assert!((m.drum_multiplier - 1.0).abs() < f64::EPSILON, "default kept");
        assert!(m.toxic_mode, "toxic mode defaults on");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Modifiers::from_json(r#"{ "hitWindowBonus": 10, "laserShow": 2 }"#)
            .expect_err("unknown key must fail");
        assert!(err.contains("laserShow"), "error names the key: {err}");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let err = Modifiers::from_json(r#"{ "guitarDifficulty": 0 }"#)
            .expect_err("zero difficulty must fail");
        assert!(err.contains("guitarDifficulty"), "got {err}");
        assert!(
            Modifiers::from_json(r#"{ "hitWindowBonus": -5 }"#).is_err(),
            "negative bonus must fail"
        );
    }

    #[test]
    fn crowd_decay_is_floored_when_applied() {
        let m = Modifiers {
            crowd_decay: 0.0,
            ..Modifiers::default()
        };
        assert!(m.validate().is_ok(), "zero decay is a legal setting");
        assert!((m.effective_crowd_decay() - 0.1).abs() < f64::EPSILON, "floored to 0.1");
    }
}
