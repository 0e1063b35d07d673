//! Circular statistics for time-of-day values
//!
//! Times are minutes since local midnight, treated as angles on a 24h
//! circle so 23:50 and 00:10 are 20 minutes apart and average to midnight.

use std::f64::consts::TAU;

pub const MINUTES_PER_DAY: f64 = 1440.0;

/// Summary of a set of times of day
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircularStats {
    /// Circular mean in [0, 1440)
    pub mean_minute: f64,
    /// Mean resultant length R in [0, 1]; 1 means all samples coincide
    pub resultant_length: f64,
    /// Circular standard deviation, `sqrt(-2 ln R)`, in minutes
    pub std_minutes: f64,
}

fn to_angle(minute: f64) -> f64 {
    minute / MINUTES_PER_DAY * TAU
}

fn to_minute(angle: f64) -> f64 {
    (angle / TAU * MINUTES_PER_DAY).rem_euclid(MINUTES_PER_DAY)
}

/// Circular mean and spread; `None` for an empty slice
pub fn circular_stats(minutes: &[f64]) -> Option<CircularStats> {
    if minutes.is_empty() {
        return None;
    }

    let n = minutes.len() as f64;
    let (sin_sum, cos_sum) = minutes.iter().fold((0.0, 0.0), |(s, c), m| {
        let angle = to_angle(*m);
        (s + angle.sin(), c + angle.cos())
    });

    let mean_sin = sin_sum / n;
    let mean_cos = cos_sum / n;
    let r = mean_sin.hypot(mean_cos).min(1.0);

    let std_radians = (-2.0 * r.max(1e-12).ln()).max(0.0).sqrt();
    let std_minutes = std_radians / TAU * MINUTES_PER_DAY;

    Some(CircularStats {
        mean_minute: to_minute(mean_sin.atan2(mean_cos)),
        resultant_length: r,
        std_minutes,
    })
}

/// Shortest distance between two times of day, in minutes
pub fn circular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(MINUTES_PER_DAY);
    d.min(MINUTES_PER_DAY - d)
}

/// Signed offset of `value` from `reference`, in (-720, 720]
pub fn signed_offset(value: f64, reference: f64) -> f64 {
    let d = (value - reference).rem_euclid(MINUTES_PER_DAY);
    if d > MINUTES_PER_DAY / 2.0 {
        d - MINUTES_PER_DAY
    } else {
        d
    }
}

/// Group times of day into clusters separated by gaps wider than `max_gap`
///
/// Gaps are measured around the circle, so a cluster may span midnight.
/// Returns indices into `minutes`; every index appears in exactly one
/// cluster.
pub fn circular_clusters(minutes: &[f64], max_gap: f64) -> Vec<Vec<usize>> {
    let n = minutes.len();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| minutes[*a].total_cmp(&minutes[*b]));

    let gap_after = |i: usize| -> f64 {
        if i + 1 < n {
            minutes[order[i + 1]] - minutes[order[i]]
        } else {
            minutes[order[0]] + MINUTES_PER_DAY - minutes[order[n - 1]]
        }
    };

    let Some(first_cut) = (0..n).find(|&i| gap_after(i) > max_gap) else {
        // No gap anywhere: one cluster around the whole circle
        return vec![order];
    };

    let start = (first_cut + 1) % n;
    let mut clusters = Vec::new();
    let mut current = Vec::new();
    for step in 0..n {
        let i = (start + step) % n;
        current.push(order[i]);
        if gap_after(i) > max_gap {
            clusters.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        clusters.push(current);
    }

    clusters
}
