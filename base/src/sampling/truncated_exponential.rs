//! Truncated exponential warp, density ∝ exp(rate·x) on an interval.

use crate::math::*;
use crate::rng::Sampler;

/// Below this value of |rate|·(hi − lo) the density is uniform to within
/// roundoff; switch to the flat limit to keep sample and pdf consistent.
const UNIFORM_LIMIT: Float = 1e-9;

/// Warps a uniform variate to a sample of the density ∝ exp(rate·x) on
/// `[lo, hi]`. A rate of zero degenerates to uniform sampling.
///
/// * `rate` - Exponent slope; either sign.
/// * `lo`   - Lower bound.
/// * `hi`   - Upper bound.
/// * `u`    - Uniform variate on [0, 1).
pub fn sample_truncated_exponential(rate: Float, lo: Float, hi: Float, u: Float) -> Float {
    debug_assert!(lo < hi);
    let span = hi - lo;
    if !(abs(rate) * span > UNIFORM_LIMIT) {
        return lo + u * span;
    }

    // Invert the CDF anchored at the heavy end so the exponentials stay ≤ 1.
    let x = if rate > 0.0 {
        hi + (u + (1.0 - u) * (rate * (lo - hi)).exp()).ln() / rate
    } else {
        lo + ((1.0 - u) + u * (rate * (hi - lo)).exp()).ln() / rate
    };
    clamp(x, lo, hi)
}

/// Returns the density of the truncated exponential warp at `x`, zero
/// outside `[lo, hi]`.
///
/// * `rate` - Exponent slope; either sign.
/// * `lo`   - Lower bound.
/// * `hi`   - Upper bound.
/// * `x`    - Evaluation point.
pub fn truncated_exponential_pdf(rate: Float, lo: Float, hi: Float, x: Float) -> Float {
    if x < lo || x > hi || !(lo < hi) {
        return 0.0;
    }
    let span = hi - lo;
    if !(abs(rate) * span > UNIFORM_LIMIT) {
        return 1.0 / span;
    }

    // pdf = rate·e^(rate·x) / (e^(rate·hi) − e^(rate·lo)), rewritten about
    // the heavy end with expm1 so neither exponential overflows.
    if rate > 0.0 {
        rate * (rate * (x - hi)).exp() / (-(rate * (lo - hi)).exp_m1())
    } else {
        -rate * (rate * (x - lo)).exp() / (-(rate * (hi - lo)).exp_m1())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{Rng, Sampler as _};

    fn integrate_pdf(rate: Float, lo: Float, hi: Float, n: usize) -> Float {
        let h = (hi - lo) / n as Float;
        (0..n)
            .map(|i| {
                let x0 = lo + i as Float * h;
                let f0 = truncated_exponential_pdf(rate, lo, hi, x0);
                let fm = truncated_exponential_pdf(rate, lo, hi, x0 + 0.5 * h);
                let f1 = truncated_exponential_pdf(rate, lo, hi, x0 + h);
                h / 6.0 * (f0 + 4.0 * fm + f1)
            })
            .sum()
    }

    #[test]
    fn pdf_normalizes() {
        for &rate in &[-40.0, -3.0, -1e-12, 0.0, 0.7, 25.0] {
            let total = integrate_pdf(rate, -1.0, 0.0, 4000);
            assert!((total - 1.0).abs() < 1e-6, "rate {rate}: {total}");
        }
    }

    #[test]
    fn extreme_rates_stay_finite() {
        let x = sample_truncated_exponential(-800.0, -1.0, 0.0, 0.5);
        assert!((-1.0..=0.0).contains(&x));
        assert!(truncated_exponential_pdf(-800.0, -1.0, 0.0, x).is_finite());
    }

    #[test]
    fn cdf_round_trip() {
        // P(X ≤ x) recomputed from the sampled quantile matches the input.
        let (rate, lo, hi) = (2.5, -1.0, 0.5);
        for i in 1..50 {
            let u = i as Float / 50.0;
            let x = sample_truncated_exponential(rate, lo, hi, u);
            let cdf = ((rate * x).exp() - (rate * lo).exp())
                / ((rate * hi).exp() - (rate * lo).exp());
            assert!((cdf - u).abs() < 1e-10);
        }
    }

    #[test]
    fn samples_follow_the_slope() {
        // Positive rate piles samples near the upper bound.
        let mut rng = Rng::new(9);
        let n = 20_000;
        let mean: Float = (0..n)
            .map(|_| sample_truncated_exponential(6.0, 0.0, 1.0, rng.next_1d()))
            .sum::<Float>()
            / n as Float;
        assert!(mean > 0.75);
    }
}
