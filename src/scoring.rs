//! Score normalization: min-max, robust (median/IQR) and sigmoid scaling

use serde::{Deserialize, Serialize};

/// Spread below which a score list is treated as constant
const DEGENERATE_SPREAD: f64 = 1e-6;
/// Raw scores are clipped to this magnitude before exponentiation
const SIGMOID_CLIP: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    MinMax,
    Robust,
    Sigmoid {
        steepness: f64,
        /// Inflection point; the 75th percentile of the input when unset
        midpoint: Option<f64>,
    },
}

/// Normalize a score list with the chosen method. Empty in, empty out.
pub fn normalize(scores: &[f64], method: Normalization) -> Vec<f64> {
    match method {
        Normalization::MinMax => minmax(scores),
        Normalization::Robust => robust(scores),
        Normalization::Sigmoid { steepness, midpoint } => sigmoid(scores, steepness, midpoint),
    }
}

/// Linear rescale to [0,1]. A constant list maps to 0.5 everywhere.
pub fn minmax(scores: &[f64]) -> Vec<f64> {
    let Some((min, max)) = bounds(scores) else {
        return Vec::new();
    };
    let range = max - min;
    if range < DEGENERATE_SPREAD {
        return vec![0.5; scores.len()];
    }
    scores.iter().map(|s| (s - min) / range).collect()
}

/// Center on the median, scale by the IQR, then min-max into [0,1].
///
/// Fewer than four scores, or an IQR below 1e-6, fall back to [`minmax`].
pub fn robust(scores: &[f64]) -> Vec<f64> {
    if scores.len() < 4 {
        return minmax(scores);
    }
    let sorted = sorted_copy(scores);
    let iqr = percentile_sorted(&sorted, 75.0) - percentile_sorted(&sorted, 25.0);
    if iqr < DEGENERATE_SPREAD {
        return minmax(scores);
    }
    let median = percentile_sorted(&sorted, 50.0);
    let scaled: Vec<f64> = scores.iter().map(|s| (s - median) / iqr).collect();
    minmax(&scaled)
}

/// Logistic squash `1 / (1 + e^(-a(x - b)))`, bounded asymptotically by (0,1)
pub fn sigmoid(scores: &[f64], steepness: f64, midpoint: Option<f64>) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let midpoint = midpoint.unwrap_or_else(|| percentile(scores, 75.0));
    scores
        .iter()
        .map(|s| {
            let x = s.clamp(-SIGMOID_CLIP, SIGMOID_CLIP);
            1.0 / (1.0 + (-steepness * (x - midpoint)).exp())
        })
        .collect()
}

/// Percentile with linear interpolation between closest ranks
pub fn percentile(scores: &[f64], pct: f64) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    percentile_sorted(&sorted_copy(scores), pct)
}

fn percentile_sorted(sorted: &[f64], pct: f64) -> f64 {
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn sorted_copy(scores: &[f64]) -> Vec<f64> {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

fn bounds(scores: &[f64]) -> Option<(f64, f64)> {
    if scores.is_empty() {
        return None;
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some((min, max))
}
