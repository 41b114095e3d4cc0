//! Truncated normal distribution.

use crate::math::*;
use crate::rng::Sampler;

/// Beyond this standardized lower bound the inverse-CDF map collapses onto
/// the clamped end of the erf table; switch to tail rejection sampling.
const TAIL_SHIFT: Float = 4.0;

/// erfc(z/√2) underflows past this standardized bound; switch the
/// normalizer to log space.
const ERFC_UNDERFLOW: Float = 37.0;

/// Draws a sample from a normal distribution with the given mean and
/// standard deviation, restricted to `[lo, hi]`. Either bound may be
/// infinite. Degenerate inputs collapse to the clamped mean.
///
/// * `mean`    - Mean of the parent normal.
/// * `stddev`  - Standard deviation of the parent normal.
/// * `lo`      - Lower truncation bound.
/// * `hi`      - Upper truncation bound.
/// * `sampler` - Random source.
pub fn sample_truncated_normal(
    mean: Float,
    stddev: Float,
    lo: Float,
    hi: Float,
    sampler: &mut dyn Sampler,
) -> Float {
    debug_assert!(lo <= hi);
    if !(lo < hi) {
        return lo;
    }
    if stddev.is_infinite() && stddev > 0.0 {
        // flat limit; meaningful only on a finite interval
        if lo.is_finite() && hi.is_finite() {
            return lo + sampler.next_1d() * (hi - lo);
        }
        return clamp(mean, lo, hi);
    }
    if !(stddev > 0.0) || !stddev.is_finite() || !mean.is_finite() {
        return clamp(mean, lo, hi);
    }

    let a = (lo - mean) / stddev;
    let b = (hi - mean) / stddev;

    // Mirror so the mass sits at nonnegative standardized values.
    let z = if b <= 0.0 {
        -sample_standardized(-b, -a, sampler)
    } else {
        sample_standardized(a, b, sampler)
    };

    clamp(mean + stddev * z, lo, hi)
}

/// Returns the density of the truncated normal at `x`, zero outside
/// `[lo, hi]`. Shares its normalizer with the sampling routine.
///
/// * `mean`   - Mean of the parent normal.
/// * `stddev` - Standard deviation of the parent normal.
/// * `lo`     - Lower truncation bound.
/// * `hi`     - Upper truncation bound.
/// * `x`      - Evaluation point.
pub fn truncated_normal_pdf(mean: Float, stddev: Float, lo: Float, hi: Float, x: Float) -> Float {
    if x < lo || x > hi || !x.is_finite() || !(lo < hi) {
        return 0.0;
    }
    if stddev.is_infinite() && stddev > 0.0 {
        // flat limit, matching the sampler
        if lo.is_finite() && hi.is_finite() {
            return 1.0 / (hi - lo);
        }
        return 0.0;
    }
    if !(stddev > 0.0) || !stddev.is_finite() {
        return 0.0;
    }

    let a = (lo - mean) / stddev;
    let b = (hi - mean) / stddev;
    let z = (x - mean) / stddev;

    let log_pdf = -0.5 * z * z - LN_SQRT_TWO_PI - stddev.ln() - log_gauss_mass(a, b);
    let pdf = log_pdf.exp();
    if pdf.is_finite() {
        pdf
    } else {
        0.0
    }
}

/// Samples the standard normal restricted to `[a, b]` with `b > 0`.
fn sample_standardized(a: Float, b: Float, sampler: &mut dyn Sampler) -> Float {
    if a > TAIL_SHIFT {
        sample_tail(a, b, sampler)
    } else {
        // Inverse CDF; the bounds keep Φ(a), Φ(b) well separated from 1.
        let fa = gauss_cdf(a);
        let fb = gauss_cdf(b);
        let u = sampler.next_1d();
        let p = fa + u * (fb - fa);
        let z = SQRT_TWO * erf_inv(2.0 * p - 1.0);
        clamp(z, a, b)
    }
}

/// Robert's exponential rejection sampler for the far upper tail `a > 4`.
fn sample_tail(a: Float, b: Float, sampler: &mut dyn Sampler) -> Float {
    let lambda = 0.5 * (a + (a * a + 4.0).sqrt());
    for _ in 0..1000 {
        let (u1, u2) = sampler.next_2d();
        let z = a - (1.0 - u1).ln() / lambda;
        if z > b {
            continue;
        }
        let d = z - lambda;
        if u2 <= (-0.5 * d * d).exp() {
            return z;
        }
    }
    // Statistically unreachable; the density is pinned at the bound anyway.
    a
}

/// Standard normal CDF Φ(z).
#[inline]
fn gauss_cdf(z: Float) -> Float {
    0.5 * erfc(-z / SQRT_TWO)
}

/// Standard normal survival function Q(z) = 1 − Φ(z).
#[inline]
fn gauss_tail(z: Float) -> Float {
    0.5 * erfc(z / SQRT_TWO)
}

/// ln Q(z), finite well past the point where Q itself underflows.
fn log_gauss_tail(z: Float) -> Float {
    if z == INFINITY {
        return -INFINITY;
    }
    if z < ERFC_UNDERFLOW {
        gauss_tail(z).ln()
    } else {
        let z2 = z * z;
        -0.5 * z2 - z.ln() - LN_SQRT_TWO_PI + (-1.0 / z2 + 3.0 / (z2 * z2)).ln_1p()
    }
}

/// ln(Φ(b) − Φ(a)) for `a < b`, stable when both bounds sit in one tail.
fn log_gauss_mass(a: Float, b: Float) -> Float {
    // Flip to the positive side for precision.
    let (a, b) = if b <= 0.0 { (-b, -a) } else { (a, b) };

    if a < ERFC_UNDERFLOW {
        let mass = gauss_tail(a) - gauss_tail(b);
        if mass > 0.0 {
            return mass.ln();
        }
    }
    let la = log_gauss_tail(a);
    let lb = log_gauss_tail(b);
    la + (-((lb - la).exp())).ln_1p()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Rng;

    /// Simpson quadrature of the pdf over a finite interval.
    fn integrate_pdf(mean: Float, sd: Float, lo: Float, hi: Float, n: usize) -> Float {
        let h = (hi - lo) / n as Float;
        let mut sum = 0.0;
        for i in 0..n {
            let x0 = lo + i as Float * h;
            let f0 = truncated_normal_pdf(mean, sd, lo, hi, x0);
            let fm = truncated_normal_pdf(mean, sd, lo, hi, x0 + 0.5 * h);
            let f1 = truncated_normal_pdf(mean, sd, lo, hi, x0 + h);
            sum += h / 6.0 * (f0 + 4.0 * fm + f1);
        }
        sum
    }

    #[test]
    fn pdf_normalizes_on_finite_interval() {
        assert!((integrate_pdf(0.3, 1.2, -1.0, 2.0, 4000) - 1.0).abs() < 1e-6);
        assert!((integrate_pdf(-4.0, 0.5, 0.0, 3.0, 4000) - 1.0).abs() < 1e-6);
        assert!((integrate_pdf(10.0, 2.0, -1.0, 0.5, 4000) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pdf_vanishes_outside_bounds() {
        assert_eq!(truncated_normal_pdf(0.0, 1.0, -1.0, 1.0, 1.5), 0.0);
        assert_eq!(truncated_normal_pdf(0.0, 1.0, -1.0, 1.0, -2.0), 0.0);
        assert_eq!(truncated_normal_pdf(0.0, -1.0, -1.0, 1.0, 0.0), 0.0);
    }

    #[test]
    fn samples_respect_bounds() {
        let mut rng = Rng::new(11);
        for _ in 0..5000 {
            let x = sample_truncated_normal(0.5, 2.0, -1.0, 1.0, &mut rng);
            assert!((-1.0..=1.0).contains(&x));
            assert!(truncated_normal_pdf(0.5, 2.0, -1.0, 1.0, x) > 0.0);
        }
    }

    #[test]
    fn far_tail_sampling_stays_usable() {
        // Mean dozens of deviations below the admissible interval.
        let mut rng = Rng::new(23);
        for _ in 0..2000 {
            let x = sample_truncated_normal(-50.0, 1.0, 0.0, INFINITY, &mut rng);
            assert!(x >= 0.0);
            let pdf = truncated_normal_pdf(-50.0, 1.0, 0.0, INFINITY, x);
            assert!(pdf.is_finite() && pdf > 0.0);
        }
    }

    #[test]
    fn sample_mean_tracks_analytic_mean() {
        // E[X] = μ + σ (φ(a) − φ(b)) / (Φ(b) − Φ(a))
        let (mean, sd, lo, hi) = (0.0, 1.0, -1.0, 2.0);
        let phi = |z: Float| (-0.5 * z * z).exp() / (SQRT_TWO * PI.sqrt());
        let mass = gauss_cdf(hi) - gauss_cdf(lo);
        let expect = mean + sd * (phi(lo) - phi(hi)) / mass;

        let mut rng = Rng::new(5);
        let n = 200_000;
        let sum: Float = (0..n)
            .map(|_| sample_truncated_normal(mean, sd, lo, hi, &mut rng))
            .sum();
        assert!((sum / n as Float - expect).abs() < 5e-3);
    }

    #[test]
    fn degenerate_stddev_collapses_to_clamped_mean() {
        let mut rng = Rng::new(1);
        assert_eq!(sample_truncated_normal(5.0, 0.0, -1.0, 1.0, &mut rng), 1.0);
        assert_eq!(sample_truncated_normal(-5.0, 0.0, -1.0, 1.0, &mut rng), -1.0);
    }
}
