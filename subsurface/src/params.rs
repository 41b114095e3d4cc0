//! Shape parameters of the anisotropic propagator.

use crate::OpticalParameters;
use base::math::*;

/// Length-dependent coefficients of the propagator.
///
/// C, D, E, F weight the exponent terms of the monopole; `z` is the
/// auxiliary combination Z = E²/F − 2D (dimensionless, in terms of
/// t = exp(−2ps): Z = 6t/(1 − t²)), kept separately because forming it from
/// the rescaled E, F, D would cancel catastrophically.
///
/// E and F are dimensionful: they carry factors of p = μ·σs/2 and p² so
/// they apply directly to the displacement vector R rather than to the
/// dimensionless r of the derivation.
#[derive(Copy, Clone, Debug)]
pub struct ShapeParameters {
    /// Exponent offset C = 3/ps. Independent of R, u0, uL, so purely a
    /// normalization term; keeping it here stops the normalization constant
    /// from leaving the exponent range at small ps.
    pub c: f64,

    /// Direction-coupling coefficient D ≥ 0 (dimensionless).
    pub d: f64,

    /// Displacement-direction coupling coefficient E ≥ 0 (units 1/length).
    pub e: f64,

    /// Displacement-squared coefficient F ≥ 0 (units 1/length²).
    pub f: f64,

    /// Z = E²/F − 2D ≥ 0, evaluated in the numerically benign form of the
    /// active regime.
    pub z: f64,
}

/// Optical depth below which the power-series regime is used (at least 8
/// digits of accuracy there).
const SERIES_PS: f64 = 0.3;

/// Optical depth above which t = exp(−2ps) < 1e-8 may be set to zero
/// exactly, except inside Z which keeps the full expression.
const ASYMPTOTIC_PS: f64 = 9.0;

/// Computes the shape parameters for the given path length.
///
/// Three regimes in the optical depth ps = p·s avoid the ill-conditioned
/// exact formulas near ps = 0 and the vanishing t at large ps.
///
/// Preconditions (violations are programming errors, checked in debug
/// builds only): μ ∈ (0, 1], σs > 0, s ≥ 0.
///
/// * `params` - Medium parameters.
/// * `length` - Path length s.
pub fn compute_shape_parameters(params: &OpticalParameters, length: Float) -> ShapeParameters {
    debug_assert!(length >= 0.0);
    debug_assert!(params.mu > 0.0 && params.mu <= 1.0);
    debug_assert!(params.sigma_s > 0.0);

    let p = 0.5 * params.mu * params.sigma_s;
    let s = length;
    let ps = p * s;
    let ps2 = ps * ps;
    let ps3 = ps2 * ps;
    let ps5 = ps2 * ps3;

    let t = (-2.0 * ps).exp();
    let t2 = t * t;

    let c = 3.0 / ps;
    let (d, mut e, mut f, z);
    if ps < SERIES_PS {
        // (t > 0.5)
        d = 1.5 / ps - 0.1 * ps + 13. / 1050. * ps3 - 11. / 7875. * ps5;
        e = (4.5 / ps + 0.3 * ps - 3. / 350. * ps3) / ps;
        f = (4.5 / ps + 1.8 * ps - 3. / 350. * ps3) / ps2;
        // well-conditioned in this regime in terms of E, F, D
        z = e * e / f - 2.0 * d;
    } else if ps > ASYMPTOTIC_PS {
        // t < 1e-8, so t = 0 may be substituted exactly
        let tmp = 1.0 / (ps - 1.0);
        d = 0.75 * tmp;
        e = 1.50 * tmp;
        f = 1.50 * tmp;
        // full expression in terms of t is stable for large ps
        z = 6.0 * t / (1.0 - t2);
    } else {
        // exact solutions, in a ps range safe from numerical problems
        d = 0.75 * (1.0 - 4.0 * ps * t - t2) / (ps - 1.0 + 2.0 * t - (ps + 1.0) * t2);
        e = 1.50 * (1.0 - t) / (ps - 1.0 + (ps + 1.0) * t);
        f = 1.50 * (1.0 + t) / (ps - 1.0 + (ps + 1.0) * t);
        z = 6.0 * t / (1.0 - t2);
    }
    // from dimensionless to dimensionful (displacement vector R instead of r)
    e *= p;
    f *= p * p;

    debug_assert!(c >= 0.0);
    debug_assert!(d >= 0.0);
    debug_assert!(e >= 0.0);
    debug_assert!(f >= 0.0);
    debug_assert!(z >= 0.0);

    ShapeParameters { c, d, e, f, z }
}

/// Optical depth below which the normalization constant switches to its
/// own power series; the closed form would overflow the exponentials.
const NORMALIZATION_SERIES_PS: f64 = 0.006;

/// Z below which Z/(exp(Z) − 1) switches to a 4-term series to avoid the
/// 0/0 limit (small Z corresponds to large ps).
const Z_SERIES_LIMIT: f64 = 0.002;

/// Combines the propagator's Gaussian normalization with the exp(−σa·s)
/// absorption factor.
///
/// * `params` - Medium parameters.
/// * `length` - Path length s.
pub fn absorption_and_normalization_constant(params: &OpticalParameters, length: Float) -> f64 {
    let p = 0.5 * params.sigma_s * params.mu;
    let ps = p * length;

    let result;
    if ps < NORMALIZATION_SERIES_PS {
        // protect against overflows in the exp()'s
        let c0 = 81. / 32.;
        let c1 = 891. / 320.;
        let c2 = 8721. / 6400.;
        let c3 = -374841. / 448000.;
        result = p * p * p * SQRT_TWO * PI.powf(-2.5) * (-params.sigma_a * length).exp()
            * ps.powf(-11. / 2.)
            * (c0 + c1 * ps + c2 * ps * ps + c3 * ps * ps * ps);
    } else {
        let sp = compute_shape_parameters(params, length);
        let z = sp.z;
        let z_over_exp_min_one = if z < Z_SERIES_LIMIT {
            1.0 + 0.5 * z + 1. / 12. * z * z - 1. / 720. * z * z * z * z
        } else {
            z / (z.exp() - 1.0)
        };
        result = 0.25 / PI.powf(2.5) * (sp.c - sp.d - params.sigma_a * length).exp()
            * sp.f.sqrt()
            * sp.f
            * z_over_exp_min_one;
    }

    #[cfg(debug_assertions)]
    if !result.is_finite() || result < 0.0 {
        warn!(
            "problem with analytical normalization at ps {:e}: {:e}",
            ps, result
        );
    }

    result
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn media() -> impl Strategy<Value = OpticalParameters> {
        (0.01f64..100.0, 0.0f64..10.0, 0.01f64..1.0, 0.8f64..2.0)
            .prop_map(|(sigma_s, sigma_a, mu, eta)| OpticalParameters::new(sigma_s, sigma_a, mu, eta))
    }

    proptest! {
        #[test]
        fn shape_parameters_are_nonnegative(
            params in media(),
            ps in 1e-6f64..100.0,
        ) {
            let s = ps / params.p();
            let sp = compute_shape_parameters(&params, s);
            prop_assert!(sp.c >= 0.0);
            prop_assert!(sp.d >= 0.0);
            prop_assert!(sp.e >= 0.0);
            prop_assert!(sp.f >= 0.0);
            prop_assert!(sp.z >= 0.0);
        }

        #[test]
        fn normalization_is_finite_and_nonnegative(
            params in media(),
            ps in 1e-5f64..50.0,
        ) {
            let s = ps / params.p();
            let n = absorption_and_normalization_constant(&params, s);
            prop_assert!(n.is_finite());
            prop_assert!(n >= 0.0);
        }
    }

    /// Relative agreement of the regime branches where they hand over.
    fn relative_gap(params: &OpticalParameters, ps: f64, pick: fn(&ShapeParameters) -> f64) -> f64 {
        let p = params.p();
        let below = compute_shape_parameters(params, ps * (1.0 - 1e-12) / p);
        let above = compute_shape_parameters(params, ps * (1.0 + 1e-12) / p);
        let (lo, hi) = (pick(&below), pick(&above));
        ((hi - lo) / lo).abs()
    }

    #[test]
    fn regime_branches_agree_at_series_boundary() {
        let params = OpticalParameters::new(2.0, 0.1, 0.7, 1.3);
        for pick in [
            (|sp: &ShapeParameters| sp.d) as fn(&ShapeParameters) -> f64,
            |sp| sp.e,
            |sp| sp.f,
            |sp| sp.z,
        ] {
            assert!(relative_gap(&params, 0.3, pick) < 1e-6);
        }
    }

    #[test]
    fn regime_branches_agree_at_asymptotic_boundary() {
        let params = OpticalParameters::new(2.0, 0.1, 0.7, 1.3);
        for pick in [
            (|sp: &ShapeParameters| sp.d) as fn(&ShapeParameters) -> f64,
            |sp| sp.e,
            |sp| sp.f,
            |sp| sp.z,
        ] {
            assert!(relative_gap(&params, 9.0, pick) < 1e-6);
        }
    }

    #[test]
    fn normalization_series_matches_closed_form_at_boundary() {
        let params = OpticalParameters::new(1.0, 0.5, 0.5, 1.0);
        let p = params.p();
        let below = absorption_and_normalization_constant(&params, 0.006 * (1.0 - 1e-12) / p);
        let above = absorption_and_normalization_constant(&params, 0.006 * (1.0 + 1e-12) / p);
        assert!(((above - below) / below).abs() < 1e-5);
    }

    #[test]
    fn z_series_matches_exact_ratio_at_boundary() {
        // pick lengths around Z = 0.002, i.e. t ≈ Z/6
        let params = OpticalParameters::new(1.0, 0.0, 1.0, 1.0);
        let p = params.p();
        // Z = 6t/(1−t²) = 0.002 → ps = −ln(t)/2 with t ≈ 1/3000
        let ps = -(0.002f64 / 6.0).ln() / 2.0;
        let below = absorption_and_normalization_constant(&params, (ps - 1e-6) / p);
        let above = absorption_and_normalization_constant(&params, (ps + 1e-6) / p);
        assert!(((above - below) / below).abs() < 1e-4);
    }
}
