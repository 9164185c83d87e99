//! Median statistics over historical event samples.

use serde::Serialize;

/// Where an estimate value came from.
///
/// `Default` is a genuine "no data" sentinel: zero is a valid measured
/// value and must never be conflated with absence of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EstimateSource {
    /// Median over at least the configured minimum sample count.
    Measured,
    /// Configured fallback used because too few samples exist.
    Default,
}

/// Duration/cost estimate for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StageEstimate {
    pub duration_s: f64,
    pub cost_usd: f64,
    pub duration_source: EstimateSource,
    pub cost_source: EstimateSource,
    pub duration_samples: usize,
    pub cost_samples: usize,
}

/// Median of a sample set, or `None` when empty.
///
/// Even-length inputs return the mean of the two middle values.
pub fn median(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid])
    } else {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    }
}

/// Median with a minimum-sample gate: below `min_samples` the measured
/// value is discarded in favor of the caller's default.
pub fn gated_median(samples: &[f64], min_samples: usize, default: f64) -> (f64, EstimateSource) {
    if samples.len() < min_samples {
        return (default, EstimateSource::Default);
    }
    match median(samples) {
        Some(value) => (value, EstimateSource::Measured),
        None => (default, EstimateSource::Default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_sample_count() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn median_of_even_sample_count_averages_middle() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn median_of_empty_is_none() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn gated_median_falls_back_below_min_samples() {
        let (value, source) = gated_median(&[10.0], 3, 42.0);
        assert_eq!(value, 42.0);
        assert_eq!(source, EstimateSource::Default);
    }

    #[test]
    fn gated_median_uses_measured_at_min_samples() {
        let (value, source) = gated_median(&[10.0, 20.0, 30.0], 3, 42.0);
        assert_eq!(value, 20.0);
        assert_eq!(source, EstimateSource::Measured);
    }

    #[test]
    fn measured_zero_is_not_treated_as_missing() {
        let (value, source) = gated_median(&[0.0, 0.0, 0.0], 3, 42.0);
        assert_eq!(value, 0.0);
        assert_eq!(source, EstimateSource::Measured);
    }
}
