use serde::{Deserialize, Serialize};

use crate::config::GradingConfig;

/// Canonical floor threshold when nothing else is configured
pub const DEFAULT_FLOOR_THRESHOLD: f64 = 5.0;

/// Inputs for one final-grade calculation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeInput {
    pub raw_points: f64,
    #[serde(default)]
    pub max_points: f64,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub bonus: f64,
    /// Falls back to the configured policy when absent
    #[serde(default)]
    pub floor_threshold: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub final_grade: f64,
    pub percentage: f64,
}

/// Grade Calculator
///
/// The single place where a final grade is derived from earned points.
/// Every other component (engine, mailer, summaries, API) goes through it.
///
/// Rule:
///   raw < threshold  → raw + bonus           (no penalty for struggling submissions)
///   raw >= threshold → max(raw - penalty + bonus, threshold)
///   result is never negative
#[derive(Debug, Clone)]
pub struct GradeCalculator {
    floor_threshold: f64,
    max_penalty: f64,
}

impl GradeCalculator {
    pub fn new(config: &GradingConfig) -> Self {
        Self {
            floor_threshold: non_negative(config.floor_threshold),
            max_penalty: non_negative(config.max_penalty),
        }
    }

    pub fn floor_threshold(&self) -> f64 {
        self.floor_threshold
    }

    pub fn max_penalty(&self) -> f64 {
        self.max_penalty
    }

    /// Resolve an optional per-activity override against the policy default
    pub fn threshold_for(&self, activity_override: Option<f64>) -> f64 {
        match activity_override {
            Some(t) if t.is_finite() => t.max(0.0),
            _ => self.floor_threshold,
        }
    }

    pub fn calculate(&self, input: &GradeInput) -> GradeResult {
        let threshold = self.threshold_for(input.floor_threshold);
        GradeResult {
            final_grade: compute_final_grade(input.raw_points, input.penalty, input.bonus, threshold),
            percentage: percentage(input.raw_points, input.max_points),
        }
    }
}

impl Default for GradeCalculator {
    fn default() -> Self {
        Self::new(&GradingConfig::default())
    }
}

/// Compute the final grade from earned points, penalty, bonus and floor threshold.
///
/// Non-finite or negative inputs are normalized to 0 instead of failing, so a
/// partially filled correction still yields a grade.
pub fn compute_final_grade(raw_points: f64, penalty: f64, bonus: f64, floor_threshold: f64) -> f64 {
    let total = non_negative(raw_points);
    let penalty = non_negative(penalty);
    let bonus = non_negative(bonus);
    let threshold = non_negative(floor_threshold);

    let grade = if total < threshold {
        (total + bonus).max(total)
    } else {
        (total - penalty + bonus).max(threshold)
    };

    grade.max(0.0)
}

/// Share of the maximum earned, in [0, 100]. Zero when there is no maximum.
pub fn percentage(raw_points: f64, max_points: f64) -> f64 {
    if !max_points.is_finite() || max_points <= 0.0 {
        return 0.0;
    }
    let raw = non_negative(raw_points);
    (raw / max_points * 100.0).clamp(0.0, 100.0)
}

/// Finite and positive, otherwise 0
pub fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_penalty_above_threshold() {
        assert_eq!(compute_final_grade(18.0, 3.0, 0.0, 5.0), 15.0);
    }

    #[test]
    fn test_penalty_ignored_below_threshold() {
        assert_eq!(compute_final_grade(3.0, 10.0, 0.0, 5.0), 3.0);
    }

    #[test]
    fn test_penalty_floored_at_threshold() {
        assert_eq!(compute_final_grade(7.0, 3.0, 0.0, 5.0), 5.0);
    }

    #[test]
    fn test_never_submitted_shortcut() {
        assert_eq!(compute_final_grade(20.0, 15.0, 0.0, 5.0), 5.0);
    }

    #[test]
    fn test_all_zero() {
        assert_eq!(compute_final_grade(0.0, 0.0, 0.0, 0.0), 0.0);
        assert_eq!(percentage(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_bonus_below_threshold() {
        assert_eq!(compute_final_grade(4.0, 0.0, 2.0, 5.0), 6.0);
    }

    #[test]
    fn test_bonus_and_penalty_above_threshold() {
        assert_eq!(compute_final_grade(12.0, 4.0, 1.5, 5.0), 9.5);
    }

    #[test]
    fn test_invalid_adjustments_treated_as_zero() {
        assert_eq!(compute_final_grade(12.0, -4.0, 0.0, 5.0), 12.0);
        assert_eq!(compute_final_grade(12.0, f64::NAN, f64::INFINITY, 5.0), 12.0);
        assert_eq!(compute_final_grade(f64::NAN, 2.0, 0.0, 5.0), 0.0);
        assert_eq!(compute_final_grade(-3.0, 0.0, 0.0, 5.0), 0.0);
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(10.0, 20.0), 50.0);
        assert_eq!(percentage(25.0, 20.0), 100.0);
        assert_eq!(percentage(5.0, f64::NAN), 0.0);
        assert_eq!(percentage(5.0, -1.0), 0.0);
    }

    #[test]
    fn test_calculator_uses_policy_and_override() {
        let calc = GradeCalculator::new(&GradingConfig {
            floor_threshold: 6.0,
            max_penalty: 15.0,
        });
        let mut input = GradeInput {
            raw_points: 8.0,
            max_points: 20.0,
            penalty: 5.0,
            bonus: 0.0,
            floor_threshold: None,
        };
        assert_eq!(calc.calculate(&input).final_grade, 6.0);
        assert_eq!(calc.calculate(&input).percentage, 40.0);

        input.floor_threshold = Some(5.0);
        assert_eq!(calc.calculate(&input).final_grade, 5.0);

        input.floor_threshold = Some(f64::NAN);
        assert_eq!(calc.calculate(&input).final_grade, 6.0);
    }

    proptest! {
        #[test]
        fn prop_penalty_monotonic_and_floored(
            threshold in 0.0f64..10.0,
            extra in 0.0f64..30.0,
            p1 in 0.0f64..30.0,
            p2 in 0.0f64..30.0,
            bonus in 0.0f64..5.0,
        ) {
            let total = threshold + extra;
            let (lo, hi) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };
            let g_lo = compute_final_grade(total, lo, bonus, threshold);
            let g_hi = compute_final_grade(total, hi, bonus, threshold);
            prop_assert!(g_hi <= g_lo);
            prop_assert!(g_hi >= threshold);
        }

        #[test]
        fn prop_no_penalty_below_threshold(
            threshold in 0.1f64..10.0,
            frac in 0.0f64..1.0,
            penalty in 0.0f64..50.0,
            bonus in 0.0f64..5.0,
        ) {
            let total = threshold * frac * 0.999;
            prop_assert!(compute_final_grade(total, penalty, bonus, threshold) >= total);
        }

        #[test]
        fn prop_non_negative(
            raw in -50.0f64..50.0,
            penalty in -50.0f64..50.0,
            bonus in -50.0f64..50.0,
            threshold in -10.0f64..10.0,
        ) {
            prop_assert!(compute_final_grade(raw, penalty, bonus, threshold) >= 0.0);
        }

        #[test]
        fn prop_percentage_bounds(max in 0.001f64..100.0, frac in 0.0f64..1.0) {
            let p = percentage(max * frac, max);
            prop_assert!((0.0..=100.0).contains(&p));
        }

        #[test]
        fn prop_idempotent(
            raw in 0.0f64..40.0,
            penalty in 0.0f64..20.0,
            bonus in 0.0f64..5.0,
            threshold in 0.0f64..10.0,
        ) {
            let a = compute_final_grade(raw, penalty, bonus, threshold);
            let b = compute_final_grade(raw, penalty, bonus, threshold);
            prop_assert_eq!(a.to_bits(), b.to_bits());
        }
    }
}
