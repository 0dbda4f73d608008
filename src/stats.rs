//! Cycle statistics.
//!
//! Mean response time (MRT) and Bessel-corrected sample standard deviation
//! over the per-probe samples of one cycle.

/// Arithmetic mean; 0 for an empty series.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation with Bessel's correction (divisor n - 1).
///
/// Defined as 0 when fewer than two samples exist.
pub fn sample_std_dev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let variance =
        samples.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std_fixture() {
        let samples = [10.0, 20.0, 30.0];
        assert_eq!(mean(&samples), 20.0);
        assert!((sample_std_dev(&samples) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_std_is_zero_below_two_samples() {
        assert_eq!(sample_std_dev(&[]), 0.0);
        assert_eq!(sample_std_dev(&[5.0]), 0.0);
    }

    #[test]
    fn test_mean_of_empty_series() {
        assert_eq!(mean(&[]), 0.0);
    }

    #[test]
    fn test_std_of_identical_samples() {
        assert_eq!(sample_std_dev(&[4.2, 4.2, 4.2, 4.2]), 0.0);
    }
}
