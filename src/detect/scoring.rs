//! Confidence policy
//!
//! Confidence is always a weighted average of sub-scores in [0, 1], never a
//! product, so one weak sub-score lowers the result without collapsing it.

use chrono::{DateTime, Utc};

/// Weighted average of `(score, weight)` pairs, clamped to [0, 1]
pub fn weighted_confidence(parts: &[(f64, f64)]) -> f64 {
    let total_weight: f64 = parts.iter().map(|(_, w)| w.max(0.0)).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }

    let sum: f64 = parts
        .iter()
        .map(|(score, w)| score.clamp(0.0, 1.0) * w.max(0.0))
        .sum();

    (sum / total_weight).clamp(0.0, 1.0)
}

/// 1.0 for evidence seen now, falling linearly to 0.0 at the lookback edge
pub fn recency_score(last_seen: DateTime<Utc>, now: DateTime<Utc>, lookback_days: u32) -> f64 {
    if lookback_days == 0 {
        return 1.0;
    }
    let age_days = ((now - last_seen).num_seconds().max(0)) as f64 / 86_400.0;
    (1.0 - age_days / lookback_days as f64).clamp(0.0, 1.0)
}

/// Mean and population standard deviation
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// How consistent a delay is relative to its size
///
/// Delays shorter than `min_tolerance` are scored as if they were
/// `min_tolerance` long, so a 1s chain with 1s of jitter is not punished
/// as 100% variance.
pub fn timing_consistency(std: f64, mean: f64, min_tolerance: f64) -> f64 {
    let scale = mean.max(min_tolerance);
    if scale <= 0.0 {
        return 1.0;
    }
    1.0 - (std / scale).min(1.0)
}

/// Support sub-score: 1.0 at twice the minimum count
pub fn support_score(count: usize, min_count: usize) -> f64 {
    if min_count == 0 {
        return 1.0;
    }
    (count as f64 / (2.0 * min_count as f64)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_weighted_not_multiplicative() {
        // A product would give 0.09; the weighted average keeps the score usable
        let c = weighted_confidence(&[(0.9, 0.5), (0.1, 0.3), (1.0, 0.2)]);
        assert!((c - 0.68).abs() < 1e-9);
        assert_eq!(weighted_confidence(&[]), 0.0);
        assert_eq!(weighted_confidence(&[(2.0, 1.0)]), 1.0);
    }

    #[test]
    fn test_recency() {
        let now = Utc::now();
        assert_eq!(recency_score(now, now, 14), 1.0);
        assert!((recency_score(now - Duration::days(7), now, 14) - 0.5).abs() < 1e-9);
        assert_eq!(recency_score(now - Duration::days(30), now, 14), 0.0);
        assert_eq!(recency_score(now + Duration::hours(1), now, 14), 1.0);
    }

    #[test]
    fn test_timing_consistency_floor() {
        assert_eq!(timing_consistency(0.0, 30.0, 5.0), 1.0);
        assert!((timing_consistency(1.0, 1.0, 5.0) - 0.8).abs() < 1e-9);
        assert_eq!(timing_consistency(50.0, 30.0, 5.0), 0.0);
    }

    #[test]
    fn test_mean_std() {
        let (mean, std) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(mean, 5.0);
        assert_eq!(std, 2.0);
        assert_eq!(support_score(5, 5), 0.5);
        assert_eq!(support_score(20, 5), 1.0);
    }
}
