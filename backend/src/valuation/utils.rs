//! Numeric helpers shared by the pipeline stages

/// Median of a slice (mean of the two middle values for even lengths)
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Outcome of a max-relative-deviation computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deviation {
    /// Fewer than one value
    Empty,
    /// Mean is zero, the ratio is undefined
    ZeroMean,
    Value { mean: f64, max_relative: f64 },
}

/// Largest |v - mean| / |mean| over the values
pub fn max_relative_deviation(values: &[f64]) -> Deviation {
    let avg = match mean(values) {
        Some(avg) => avg,
        None => return Deviation::Empty,
    };
    if avg == 0.0 {
        return Deviation::ZeroMean;
    }
    let max_relative = values
        .iter()
        .map(|v| (v - avg).abs() / avg.abs())
        .fold(0.0_f64, f64::max);
    Deviation::Value { mean: avg, max_relative }
}

/// Percentile with linear interpolation between closest ranks.
///
/// For sorted values x[0..n) and p in [0, 1], the rank is h = (n - 1) * p and
/// the result is x[floor(h)] + (h - floor(h)) * (x[floor(h) + 1] - x[floor(h)]).
/// Ties need no special handling: equal order statistics interpolate to the
/// same value. This matches the default method of most statistics packages
/// (Hyndman-Fan type 7), not nearest-rank.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&p) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(percentile_sorted(&sorted, p))
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// p25, p50 and p75 in one sort
pub fn quartiles(values: &[f64]) -> Option<(f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some((
        percentile_sorted(&sorted, 0.25),
        percentile_sorted(&sorted, 0.50),
        percentile_sorted(&sorted, 0.75),
    ))
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let values = [480_000.0, 400_000.0, 450_000.0, 420_000.0];
        // h = 1.5 -> halfway between 420k and 450k; nearest-rank would give 420k
        assert_eq!(percentile(&values, 0.5), Some(435_000.0));
        assert_eq!(percentile(&values, 0.25), Some(415_000.0));
        assert_eq!(percentile(&values, 0.75), Some(457_500.0));
        assert_eq!(percentile(&values, 0.0), Some(400_000.0));
        assert_eq!(percentile(&values, 1.0), Some(480_000.0));
    }

    #[test]
    fn test_percentile_with_ties_and_single_value() {
        assert_eq!(percentile(&[200.0, 200.0, 200.0, 300.0], 0.5), Some(200.0));
        assert_eq!(percentile(&[250.0], 0.75), Some(250.0));
        assert_eq!(percentile(&[], 0.5), None);
        assert_eq!(percentile(&[1.0], 1.5), None);
    }

    #[test]
    fn test_quartiles_match_percentile() {
        let values = [400_000.0, 420_000.0, 450_000.0, 480_000.0];
        assert_eq!(quartiles(&values), Some((415_000.0, 435_000.0, 457_500.0)));
    }

    #[test]
    fn test_max_relative_deviation() {
        match max_relative_deviation(&[470_000.0, 485_000.0, 475_000.0]) {
            Deviation::Value { mean, max_relative } => {
                assert!((mean - 476_666.67).abs() < 0.01);
                assert!((max_relative - 0.0175).abs() < 0.0001);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(max_relative_deviation(&[]), Deviation::Empty);
        assert_eq!(max_relative_deviation(&[5.0, -5.0]), Deviation::ZeroMean);
    }

    #[test]
    fn test_single_value_has_zero_deviation() {
        assert_eq!(
            max_relative_deviation(&[410_000.0]),
            Deviation::Value { mean: 410_000.0, max_relative: 0.0 }
        );
    }
}
