//! Bracketed scalar root finding.

use super::{abs, max, Float};
use std::fmt;

/// Failure modes of the bracketed search. All of them are recoverable for
/// callers that can report "no sample".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootError {
    /// The function evaluated to a non-finite value inside the bracket.
    NonFiniteEvaluation,

    /// The endpoint values do not straddle zero.
    NotBracketed,

    /// The iteration cap was reached before the tolerance was met.
    IterationLimit,
}

impl fmt::Display for RootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFiniteEvaluation => write!(f, "non-finite function evaluation"),
            Self::NotBracketed => write!(f, "endpoints do not bracket a root"),
            Self::IterationLimit => write!(f, "iteration limit reached"),
        }
    }
}

/// Finds a root of `f` on `[lo, hi]`, where `f(lo)` and `f(hi)` have
/// opposite signs, and returns the final bracketing interval.
///
/// Uses the Illinois variant of false position with a bisection safeguard.
/// The search stops once the bracket width drops below the requested number
/// of significant bits relative to the root's magnitude.
///
/// * `f`        - Continuous scalar function.
/// * `lo`       - Lower bracket endpoint.
/// * `hi`       - Upper bracket endpoint.
/// * `tol_bits` - Significant bits of agreement required of the bracket.
/// * `max_iter` - Hard cap on function evaluations.
pub fn find_root_bracketed<F>(
    f: F,
    lo: Float,
    hi: Float,
    tol_bits: u32,
    max_iter: usize,
) -> Result<(Float, Float), RootError>
where
    F: Fn(Float) -> Float,
{
    let (mut a, mut b) = (lo, hi);
    let mut fa = f(a);
    let mut fb = f(b);
    if !fa.is_finite() || !fb.is_finite() {
        return Err(RootError::NonFiniteEvaluation);
    }
    if fa == 0.0 {
        return Ok((a, a));
    }
    if fb == 0.0 {
        return Ok((b, b));
    }
    if fa.signum() == fb.signum() {
        return Err(RootError::NotBracketed);
    }

    let rel_tol = (2.0 as Float).powi(-(tol_bits as i32));
    // keeps the endpoint value fresh on the side the secant step neglects
    let mut stale_side = 0i32;

    for _ in 0..max_iter {
        let width = abs(b - a);
        let scale = max(abs(a), abs(b));
        if width <= rel_tol * scale || width <= Float::MIN_POSITIVE {
            return Ok((a, b));
        }

        let mut c = (a * fb - b * fa) / (fb - fa);
        if !c.is_finite() || c <= a.min(b) || c >= a.max(b) {
            c = 0.5 * (a + b);
        }
        let fc = f(c);
        if !fc.is_finite() {
            return Err(RootError::NonFiniteEvaluation);
        }
        if fc == 0.0 {
            return Ok((c, c));
        }

        if fa.signum() != fc.signum() {
            b = c;
            fb = fc;
            if stale_side == -1 {
                fa *= 0.5;
            }
            stale_side = -1;
        } else {
            a = c;
            fa = fc;
            if stale_side == 1 {
                fb *= 0.5;
            }
            stale_side = 1;
        }
    }

    Err(RootError::IterationLimit)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_cubic_root() {
        let f = |x: Float| x * x * x - 2.0;
        let (a, b) = find_root_bracketed(f, 0.0, 10.0, 30, 200).unwrap();
        let root = 0.5 * (a + b);
        assert!((root - 2f64.powf(1.0 / 3.0)).abs() < 1e-8);
    }

    #[test]
    fn finds_offset_cdf_style_root() {
        // monotone, flat near zero, the shape the length sampler inverts
        let f = |x: Float| 1.0 - (-x).exp() - 0.75;
        let (a, b) = find_root_bracketed(f, 0.0, 1000.0, 20, 500).unwrap();
        let root = 0.5 * (a + b);
        assert!((root - 4f64.ln()).abs() < 1e-4);
    }

    #[test]
    fn rejects_unbracketed_interval() {
        let f = |x: Float| x * x + 1.0;
        assert_eq!(
            find_root_bracketed(f, -1.0, 1.0, 20, 100),
            Err(RootError::NotBracketed)
        );
    }

    #[test]
    fn reports_non_finite_evaluations() {
        let f = |x: Float| if x > 0.5 { Float::NAN } else { x - 1.0 };
        assert_eq!(
            find_root_bracketed(f, 0.0, 1.0, 20, 100),
            Err(RootError::NonFiniteEvaluation)
        );
    }

    #[test]
    fn exact_endpoint_root() {
        let f = |x: Float| x - 3.0;
        assert_eq!(find_root_bracketed(f, 3.0, 10.0, 20, 100), Ok((3.0, 3.0)));
    }
}
