//! Entry-direction sampling.
//!
//! The dipole-level sampler mixes a real-source and a virtual-source
//! boundary-aware monopole sampler with a cosine-hemisphere safety
//! strategy. The boundary-aware monopole itself is either the analytic
//! effective-BRDF form or a mixture of two parameterizations of the
//! propagator's directional factor exp(dot(H, u0)).

use crate::eval::cancellation_check;
use crate::params::compute_shape_parameters;
use crate::virtual_source::{
    real_source_weight, tentative_virtual_source_displacement, TangentPlaneMode,
};
use crate::{OpticalParameters, DIRECTION_MIN_MU};
use base::geometry::*;
use base::math::*;
use base::rng::Sampler;
use base::sampling::{
    cosine_hemisphere_pdf, cosine_sample_hemisphere, sample_truncated_exponential,
    sample_truncated_normal, truncated_exponential_pdf, truncated_normal_pdf,
};

/// Mixture weight of the `orig` parameterization against `bis` inside the
/// boundary-aware monopole sampler.
const DIRECTION_ORIG_WEIGHT: Float = 0.5;

/// Sample the dipole direction as a simple cosine-weighted hemisphere with
/// this weight. This improves robustness in case we would severely
/// undersample the transport with the dedicated importance samplers (e.g.
/// by underestimating the width of a sharp peak).
const DIRECTION_HEMI_WEIGHT: Float = 0.05;

/// Relative pdf mismatch tolerated by the verification-build self-checks.
#[cfg(debug_assertions)]
const PDF_CONSISTENCY_TOLERANCE: Float = 1e-3;

// ----------------------------------------------------------------------------
// Cosine-hemisphere safety strategy
// ----------------------------------------------------------------------------

/// Samples an incoming direction (into the medium) on the cosine-weighted
/// hemisphere below `n`.
fn sample_hemisphere_inward(n: &Normal3f, sampler: &mut dyn Sampler) -> (Vector3f, Float) {
    let mut hemi = cosine_sample_hemisphere(sampler.next_2d());
    let pdf = cosine_hemisphere_pdf(hemi.z);
    hemi.z = -hemi.z; // pointing inwards
    let (s_axis, t_axis) = coordinate_system(n);
    let d = s_axis * hemi.x + t_axis * hemi.y + *n * hemi.z;
    (d, pdf)
}

/// Density of the inward cosine-hemisphere strategy.
fn pdf_hemisphere_inward(n: &Normal3f, d: &Vector3f) -> Float {
    INV_PI * abs(d.dot(n))
}

// ----------------------------------------------------------------------------
// Polar/azimuth warps of the `bis` parameterization
// ----------------------------------------------------------------------------

/// Strategy weights of the polar warp: Laplace, exponential, uniform. The
/// Laplace component switches off when the azimuthal coupling is
/// negligible.
fn exp_sin_cos_weights(a: f64) -> (f64, f64, f64) {
    if a < EPSILON {
        (0.00, 0.98, 0.02)
    } else {
        (0.49, 0.49, 0.02)
    }
}

/// Laplace approximation of exp(a·sinθ + b·cosθ) on d(cosθ), with a
/// doubled deviation for safety.
fn exp_sin_cos_laplace_fit(a: f64, b: f64) -> (f64, f64) {
    let mean = b / (a * a + b * b).sqrt();
    let var = 0.5 * (1.0 - mean * mean).powf(1.5) / a;
    let stddev_safety_factor = 2.0;
    (mean, stddev_safety_factor * var.sqrt())
}

/// Density of the blended polar warp at `cos_theta` ∈ [−1, 0].
fn exp_sin_cos_d_cos_pdf(a: f64, b: f64, cos_theta: f64) -> f64 {
    let (laplace_weight, exp_weight, uniform_weight) = exp_sin_cos_weights(a);
    let laplace_pdf = if laplace_weight == 0.0 {
        0.0
    } else {
        let (mean, stddev) = exp_sin_cos_laplace_fit(a, b);
        truncated_normal_pdf(mean, stddev, -1.0, 0.0, cos_theta)
    };
    let exp_pdf = truncated_exponential_pdf(b, -1.0, 0.0, cos_theta);
    let uniform_pdf = 1.0;
    laplace_weight * laplace_pdf + exp_weight * exp_pdf + uniform_weight * uniform_pdf
}

/// Samples cosθ ∈ [−1, 0] with weight exp(a·sinθ + b·cosθ); requires
/// a ≥ 0. Returns the cosine and its blended density.
fn sample_exp_sin_cos_d_cos(a: f64, b: f64, sampler: &mut dyn Sampler) -> (f64, f64) {
    debug_assert!(a >= -EPSILON);
    let (laplace_weight, exp_weight, _uniform_weight) = exp_sin_cos_weights(a);

    let u = sampler.next_1d();
    let cos_theta = if u < laplace_weight {
        let (mean, stddev) = exp_sin_cos_laplace_fit(a, b);
        sample_truncated_normal(mean, stddev, -1.0, 0.0, sampler)
    } else if u < laplace_weight + exp_weight {
        // exponential approximation: |b| >> a
        sample_truncated_exponential(b, -1.0, 0.0, sampler.next_1d())
    } else {
        -sampler.next_1d()
    };

    (cos_theta, exp_sin_cos_d_cos_pdf(a, b, cos_theta))
}

/// Truncated-normal fit for sampling φ with weight exp(a·cosφ): expand
/// cosφ to second order around φ = 0 for a > 0 (cosφ → +1) and around
/// φ = π otherwise. `None` when the deviation collapses to zero.
fn exp_cos_phi_fit(a: f64) -> Option<(f64, f64, f64, f64)> {
    let phi_orig_sd = 1.0 / abs(a).sqrt();
    // we are less precise for high stddev
    let stddev_safety_factor = if phi_orig_sd > 1.5 { 1.8 } else { 1.1 };
    let phi_sd = stddev_safety_factor * phi_orig_sd;
    if phi_sd == 0.0 {
        return None;
    }
    let (phi_mean, phi_lo, phi_hi) = if a > 0.0 {
        (0.0, -PI, PI)
    } else {
        (PI, 0.0, TWO_PI)
    };
    Some((phi_mean, phi_sd, phi_lo, phi_hi))
}

/// Mixture weight of the uniform component of the azimuth warp.
const PHI_UNIFORM_WEIGHT: f64 = 0.10;

/// Mixture weight of the truncated-normal component of the azimuth warp.
const PHI_TRUNCNORM_WEIGHT: f64 = 0.90;

/// Density of the azimuth warp at `phi`; accepts angles one period below
/// the fit window (as produced by atan2).
fn exp_cos_d_phi_pdf(a: f64, phi: f64) -> f64 {
    let Some((phi_mean, phi_sd, phi_lo, phi_hi)) = exp_cos_phi_fit(a) else {
        return 0.0;
    };
    let mut phi_for_pdf = phi;
    if phi_for_pdf < phi_lo {
        phi_for_pdf += TWO_PI;
    }
    debug_assert!(phi_lo <= phi_for_pdf && phi_for_pdf <= phi_hi);
    PHI_TRUNCNORM_WEIGHT * truncated_normal_pdf(phi_mean, phi_sd, phi_lo, phi_hi, phi_for_pdf)
        + PHI_UNIFORM_WEIGHT * INV_TWO_PI
}

/// Samples φ with weight exp(a·cosφ). Returns the angle and its blended
/// density, or `None` when the fit degenerates.
fn sample_exp_cos_d_phi(a: f64, sampler: &mut dyn Sampler) -> Option<(f64, f64)> {
    let (phi_mean, phi_sd, phi_lo, phi_hi) = exp_cos_phi_fit(a)?;
    let phi = if sampler.next_1d() < PHI_UNIFORM_WEIGHT {
        phi_lo + sampler.next_1d() * (phi_hi - phi_lo)
    } else {
        sample_truncated_normal(phi_mean, phi_sd, phi_lo, phi_hi, sampler)
    };
    let pdf = exp_cos_d_phi_pdf(a, phi);
    Some((phi, pdf))
}

// ----------------------------------------------------------------------------
// Effective-BRDF form (coincident entry and exit points)
// ----------------------------------------------------------------------------

/// Frame and exponent coefficients shared by the BRDF sample and pdf
/// routines. The polar angle follows a truncated normal in cosθ from the
/// bivariate expansion of the propagator exponent.
struct BrdfKernel {
    x: Vector3f,
    y: Vector3f,
    z: Vector3f,
    a: f64,
    cos_mean: f64,
    cos_sd: f64,
}

fn brdf_kernel(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> Option<BrdfKernel> {
    // n0 == nl is not guaranteed here: when sampling the virtual direction
    // the normal arrives mirrored.
    debug_assert!(abs(ul.length() - 1.0) < SHADOW_EPSILON);
    debug_assert!(r.is_finite());
    debug_assert!(s.is_finite() && s >= 0.0);

    // frame about the admissible-hemisphere normal:
    let z = *n0;
    let mut x_unnorm = *ul - z * z.dot(ul);
    if x_unnorm.length() <= EPSILON {
        // any frame will do; a goes to 0 and the sampling turns uniform
        // where needed (e.g. the azimuth)
        x_unnorm = coordinate_system(&z).0;
    }
    let x = x_unnorm.normalize();
    let y = x.cross(&z);
    debug_assert!(abs(x.dot(&y)) < EPSILON);
    debug_assert!(abs(x.dot(&z)) < EPSILON);
    debug_assert!(abs(y.dot(&z)) < EPSILON);

    // outgoing direction in incident orientation; the only displacement
    // should be along the normal
    let woi = -*ul;
    debug_assert!(r.is_zero() || abs(r.dot(n0)) > 0.999 * r.length());

    let sp = compute_shape_parameters(params, s);

    let mut a = 0.5 * sp.z * woi.dot(&x);
    cancellation_check(sp.d * woi.dot(&z), sp.e * r.dot(&z));
    let b = sp.d * woi.dot(&z) + sp.e * r.dot(&z);
    let c = 0.25 * sp.e * sp.e / sp.f;

    if abs(a) < 1e-4 {
        // lets the deviations go to infinity (plain uniform sampling),
        // which sidesteps pdf inconsistencies near the threshold
        a = 0.0;
    }

    let cos_sd = 1.0 / (2.0 * c + abs(a)).sqrt();
    debug_assert!(cos_sd >= 0.0);
    if cos_sd == 0.0 {
        return None;
    }
    let cos_mean = b * square(cos_sd);
    Some(BrdfKernel { x, y, z, a, cos_mean, cos_sd })
}

/// Samples the entry direction of the effective BRDF.
fn sample_direction_brdf(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
    sampler: &mut dyn Sampler,
) -> Option<(Vector3f, Float)> {
    let k = brdf_kernel(params, n0, ul, r, s)?;

    let cos_theta = sample_truncated_normal(k.cos_mean, k.cos_sd, -1.0, 0.0, sampler);
    let cos_theta_pdf = truncated_normal_pdf(k.cos_mean, k.cos_sd, -1.0, 0.0, cos_theta);
    let sin_theta = safe_sqrt(1.0 - square(cos_theta));

    let phi_sd = 1.0 / (abs(k.a) * sin_theta).sqrt();
    if phi_sd == 0.0 {
        return None;
    }
    let (phi_mean, phi_lo, phi_hi) = if k.a > 0.0 {
        (0.0, -PI, PI)
    } else {
        (PI, 0.0, TWO_PI)
    };
    let phi = sample_truncated_normal(phi_mean, phi_sd, phi_lo, phi_hi, sampler);
    let phi_pdf = truncated_normal_pdf(phi_mean, phi_sd, phi_lo, phi_hi, phi);

    let (sin_phi, cos_phi) = sincos(phi);
    let u0 = k.x * (cos_phi * sin_theta) + k.y * (sin_phi * sin_theta) + k.z * cos_theta;
    debug_assert!(abs(u0.length() - 1.0) < SHADOW_EPSILON);

    let pdf = cos_theta_pdf * phi_pdf;
    if !pdf.is_finite() || pdf < 0.0 {
        warn!("problematic effective-BRDF direction pdf: {:e}", pdf);
        return None;
    }
    if pdf == 0.0 {
        return None;
    }

    #[cfg(debug_assertions)]
    {
        let check = pdf_direction_brdf(params, &u0, n0, ul, r, s);
        if abs(pdf - check) / pdf > PDF_CONSISTENCY_TOLERANCE {
            warn!(
                "inconsistent effective-BRDF pdfs: {:e} vs {:e}, rel {:e}",
                pdf,
                check,
                (pdf - check) / pdf
            );
        }
    }
    Some((u0, pdf))
}

/// Density of the effective-BRDF direction sampler at `u0`.
fn pdf_direction_brdf(
    params: &OpticalParameters,
    u0: &Vector3f,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> Float {
    let Some(k) = brdf_kernel(params, n0, ul, r, s) else {
        return 0.0;
    };

    let cos_theta_raw = u0.dot(&k.z);
    debug_assert!(-1.0 - EPSILON <= cos_theta_raw && cos_theta_raw <= EPSILON);
    let cos_theta = clamp(cos_theta_raw, -1.0, 0.0);
    let cos_theta_pdf = truncated_normal_pdf(k.cos_mean, k.cos_sd, -1.0, 0.0, cos_theta);
    let sin_theta = safe_sqrt(1.0 - square(cos_theta));

    let phi_sd = 1.0 / (abs(k.a) * sin_theta).sqrt();
    if phi_sd == 0.0 {
        return 0.0;
    }
    let (phi_mean, phi_lo, phi_hi) = if k.a > 0.0 {
        (0.0, -PI, PI)
    } else {
        (PI, 0.0, TWO_PI)
    };
    let mut phi = (u0.dot(&k.y)).atan2(u0.dot(&k.x));
    if phi < phi_lo {
        phi += TWO_PI;
    }
    debug_assert!(phi_lo <= phi && phi <= phi_hi);
    let phi_pdf = truncated_normal_pdf(phi_mean, phi_sd, phi_lo, phi_hi, phi);

    let pdf = cos_theta_pdf * phi_pdf;
    if !pdf.is_finite() || pdf < 0.0 {
        warn!("problematic effective-BRDF direction pdf: {:e}", pdf);
        return 0.0;
    }
    pdf
}

// ----------------------------------------------------------------------------
// `orig` parameterization: polar axis along H
// ----------------------------------------------------------------------------

/// Geometry of the admissible polar/azimuth region in the frame of the
/// (regularized) concentration vector H, shared by the `orig` sample and
/// pdf routines.
///
/// The relevant propagator factor is exp(dot(H, u0)) with H = E·R − D·uL,
/// i.e. an exponential in the cosine about Ĥ. Entry directions must not
/// come from within the medium, so the polar range is clamped to the
/// admissible hemisphere and the azimuth to a wedge whose cutoff follows
/// from the angle between Ĥ and the normal; when Ĥ is nearly colinear
/// with the normal the frame is built about the normal instead.
struct OrigBounds {
    lhl: f64,
    hnorm: Vector3f,
    projection_dir: Vector3f,
    badly_conditioned: bool,
    min_cos: f64,
    max_cos: f64,
    phi_cutoff_slope: f64,
}

fn orig_bounds(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> OrigBounds {
    let sp = compute_shape_parameters(params, s);

    let h = sp.e * *r - sp.d * *ul;
    let lhl_raw = h.length();
    debug_assert!(lhl_raw.is_finite());
    let hnorm = h / lhl_raw;

    // regularization
    let lhl = min(lhl_raw, 1.0 / DIRECTION_MIN_MU);

    // If we are badly conditioned, pick coordinates around n0 instead of
    // trying to set up a frame about H.
    let badly_conditioned = abs(n0.dot(&hnorm)) > 1.0 - EPSILON;

    if badly_conditioned {
        OrigBounds {
            lhl,
            hnorm,
            projection_dir: *n0,
            badly_conditioned,
            min_cos: -1.0,
            max_cos: 0.0, // only incoming directions
            phi_cutoff_slope: Float::NAN,
        }
    } else {
        let exact_sin = n0.dot(&hnorm);
        let tmp_cos = clamp(safe_sqrt(1.0 - square(exact_sin)), -1.0, 1.0);
        let tmp_sin = safe_sqrt(1.0 - square(tmp_cos)); // detour for rounding
        let (min_cos, max_cos, phi_cutoff_slope);
        if hnorm.dot(n0) < 0.0 {
            // H points to the incoming side of the boundary
            min_cos = -tmp_cos;
            max_cos = 1.0;
            phi_cutoff_slope = tmp_sin / min_cos;
        } else {
            min_cos = -1.0;
            max_cos = tmp_cos;
            phi_cutoff_slope = tmp_sin / max_cos;
        }
        OrigBounds {
            lhl,
            hnorm,
            projection_dir: hnorm,
            badly_conditioned,
            min_cos,
            max_cos,
            phi_cutoff_slope,
        }
    }
}

/// Density of the polar cosine in the `orig` parameterization. Three
/// regimes: a second-order expansion for |H| → 0, a saturated exponential
/// for large |H| where the exact normalizer overflows, and the exact
/// normalized exponential otherwise.
fn orig_cos_theta_pdf(lhl: f64, min_cos: f64, max_cos: f64, cos_theta: f64) -> f64 {
    if lhl < EPSILON {
        let d = max_cos - min_cos;
        (1.0 + 0.5 * (2.0 * cos_theta - min_cos - max_cos) * lhl
            + 1. / 12.
                * (square(max_cos)
                    + square(min_cos)
                    + 4.0 * min_cos * max_cos
                    + 6.0 * cos_theta * (cos_theta - min_cos - max_cos))
                * lhl
                * lhl)
            / d
    } else if lhl > LOG_REDUCED_PRECISION / 2.0 {
        lhl * (lhl * (cos_theta - max_cos)).exp()
    } else {
        lhl / ((max_cos * lhl).exp() - (min_cos * lhl).exp()) * (lhl * cos_theta).exp()
    }
}

/// Azimuth wedge admitted at the given polar cosine.
fn orig_phi_bounds(bounds: &OrigBounds, cos_theta: f64, sin_theta: f64) -> (f64, f64) {
    if bounds.badly_conditioned {
        (-PI_OVER_TWO, PI + PI_OVER_TWO)
    } else {
        // height of the cutoff on the phi slice circle, rescaled to a unit
        // circle; below −1 the whole 2π range is admissible (safe_asin
        // clamps for us)
        let h = bounds.phi_cutoff_slope * cos_theta;
        let h_unit_circle = if sin_theta == 0.0 { -1.0 } else { h / sin_theta };
        debug_assert!(h_unit_circle.is_finite());
        debug_assert!(h_unit_circle <= 1.0 + SHADOW_EPSILON);
        let min_phi = safe_asin(h_unit_circle);
        (min_phi, PI - min_phi)
    }
}

/// Azimuth frame: φ = 0 is perpendicular to H and n0, "down" (negative
/// heights) towards the normal, so "up" points at incoming directions.
fn orig_phi_frame(bounds: &OrigBounds, n0: &Normal3f) -> (Vector3f, Vector3f) {
    if bounds.badly_conditioned {
        // any frame perpendicular to the projection axis will do (the
        // cosine bounds span the full admissible range already)
        let (s_axis, t_axis) = coordinate_system(&bounds.projection_dir);
        (s_axis, t_axis)
    } else {
        let up_dir = -(*n0 - bounds.hnorm * n0.dot(&bounds.hnorm)).normalize();
        let zero_phi_dir = up_dir.cross(&bounds.hnorm);
        (up_dir, zero_phi_dir)
    }
}

/// Samples the `orig` parameterization.
fn sample_direction_monopole_orig(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
    sampler: &mut dyn Sampler,
) -> Option<(Vector3f, Float)> {
    debug_assert!(abs(ul.length() - 1.0) < SHADOW_EPSILON);
    debug_assert!(r.is_finite());
    debug_assert!(s.is_finite() && s >= 0.0);

    let bounds = orig_bounds(params, n0, ul, r, s);
    debug_assert!(bounds.min_cos >= -1.0 && bounds.min_cos <= 0.0);
    debug_assert!(bounds.max_cos >= 0.0 && bounds.max_cos <= 1.0);
    let (lhl, min_cos, max_cos) = (bounds.lhl, bounds.min_cos, bounds.max_cos);

    let cos_theta;
    if lhl < EPSILON {
        // expansion in small |H|, up to second order; stays within bounds
        let d = max_cos - min_cos;
        let d2 = d * d;
        let d3 = d * d2;
        let u = sampler.next_1d();
        cos_theta = clamp(
            min_cos + d * u - 0.5 * u * (u - 1.0) * d2 * lhl
                + 1. / 6. * (2.0 * u - 1.0) * (u - 1.0) * u * d3 * lhl * lhl,
            min_cos,
            max_cos,
        );
    } else if lhl > LOG_REDUCED_PRECISION / 2.0 {
        // expansion in large |H|
        let raw = max_cos + sampler.next_1d().ln() / lhl;
        if raw < min_cos {
            // *insanely* unlikely (the pdf below would cut off to zero, but
            // the universe dies of heat death first)
            warn!(
                "saturated polar sample escaped its bounds: cos {:e} < min {:e}",
                raw, min_cos
            );
        }
        cos_theta = clamp(raw, min_cos, max_cos);
    } else {
        let u = sampler.next_1d();
        cos_theta = clamp(
            (((1.0 - u) * (min_cos * lhl).exp() + u * (max_cos * lhl).exp()).ln()) / lhl,
            min_cos,
            max_cos,
        );
    }
    let cos_theta_pdf = orig_cos_theta_pdf(lhl, min_cos, max_cos, cos_theta);
    debug_assert!(cos_theta_pdf.is_finite() && cos_theta_pdf > 0.0);
    let sin_theta = safe_sqrt(1.0 - cos_theta * cos_theta);

    let (min_phi, max_phi) = orig_phi_bounds(&bounds, cos_theta, sin_theta);
    debug_assert!((-PI_OVER_TWO..=PI_OVER_TWO).contains(&min_phi));
    debug_assert!((PI_OVER_TWO..=PI + PI_OVER_TWO).contains(&max_phi));
    if max_phi == min_phi {
        return None;
    }
    let phi = min_phi + (max_phi - min_phi) * sampler.next_1d();
    let phi_pdf = 1.0 / (max_phi - min_phi);
    debug_assert!(phi_pdf.is_finite() && phi_pdf > 0.0);
    // For perfect sampling phi_pdf would be weighted by how the wedge size
    // varies with cos_theta; that is a lower-order effect swamped by the
    // exponential factor.

    let (up_dir, zero_phi_dir) = orig_phi_frame(&bounds, n0);
    debug_assert!(abs(up_dir.length() - 1.0) < SHADOW_EPSILON);
    debug_assert!(abs(zero_phi_dir.length() - 1.0) < SHADOW_EPSILON);

    let (sin_phi, cos_phi) = sincos(phi);
    let u0 = (up_dir * sin_phi + zero_phi_dir * cos_phi) * sin_theta
        + bounds.projection_dir * cos_theta;
    debug_assert!(abs(u0.length() - 1.0) < SHADOW_EPSILON);

    if u0.dot(n0) >= 0.0 {
        // can happen through roundoff on the wedge boundary
        warn!("constructed a non-incoming entry direction; rejecting the sample");
        return None;
    }

    let pdf = cos_theta_pdf * phi_pdf;
    debug_assert!(pdf >= 0.0);
    if pdf == 0.0 {
        warn!("underflow in the `orig` direction sampler pdf");
        return None;
    }

    #[cfg(debug_assertions)]
    {
        let check = pdf_direction_monopole_orig(params, &u0, n0, ul, r, s);
        if abs((pdf - check) / pdf) > PDF_CONSISTENCY_TOLERANCE {
            warn!(
                "inconsistent `orig` pdfs: {:e} vs {:e}, rel {:e}; cos {:e}, |H| {:e}",
                pdf,
                check,
                (pdf - check) / pdf,
                cos_theta,
                lhl
            );
        }
    }
    Some((u0, pdf))
}

/// Density of the `orig` parameterization at `u0`.
fn pdf_direction_monopole_orig(
    params: &OpticalParameters,
    u0: &Vector3f,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> Float {
    if u0.dot(n0) >= 0.0 {
        return 0.0;
    }
    // now cos_theta and phi lie correctly within their bounds

    let bounds = orig_bounds(params, n0, ul, r, s);
    let cos_theta = clamp(bounds.projection_dir.dot(u0), -1.0, 1.0);
    debug_assert!(bounds.min_cos - SHADOW_EPSILON <= cos_theta);
    debug_assert!(cos_theta <= bounds.max_cos + SHADOW_EPSILON);
    let sin_theta = safe_sqrt(1.0 - cos_theta * cos_theta);

    let cos_theta_pdf = orig_cos_theta_pdf(bounds.lhl, bounds.min_cos, bounds.max_cos, cos_theta);
    debug_assert!(cos_theta_pdf.is_finite() && cos_theta_pdf >= 0.0);

    let (min_phi, max_phi) = orig_phi_bounds(&bounds, cos_theta, sin_theta);
    if !(max_phi > min_phi) {
        return 0.0;
    }
    cos_theta_pdf / (max_phi - min_phi)
}

// ----------------------------------------------------------------------------
// `bis` parameterization: polar axis along the normal
// ----------------------------------------------------------------------------

/// Frame and exponent coefficients of the `bis` parameterization: a frame
/// about the admissible-hemisphere normal with exp(a·sinθ·cosφ + b·cosθ)
/// as the target weight, H regularized to its maximum magnitude.
///
/// The practical difference to `orig` is small, so either would suffice on
/// its own; they are combined anyway.
struct BisKernel {
    x: Vector3f,
    y: Vector3f,
    z: Vector3f,
    a: f64,
    b: f64,
}

fn bis_kernel(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> BisKernel {
    let sp = compute_shape_parameters(params, s);

    let z = *n0;
    let mut h = sp.e * *r - sp.d * *ul;

    // regularize |H| if needed
    if h.length() > 1.0 / DIRECTION_MIN_MU {
        h *= 1.0 / DIRECTION_MIN_MU / h.length();
    }

    let mut x_unnorm = h - z * z.dot(&h);
    if x_unnorm.length() <= EPSILON * h.length() {
        // any frame will do; a goes to 0 and the sampling turns uniform
        // where needed (e.g. the azimuth)
        x_unnorm = coordinate_system(&z).0;
    }
    let x = x_unnorm.normalize();
    let y = x.cross(&z);
    debug_assert!(abs(x.dot(&y)) < EPSILON);
    debug_assert!(abs(x.dot(&z)) < EPSILON);
    debug_assert!(abs(y.dot(&z)) < EPSILON);

    let mut a = h.dot(&x);
    let b = h.dot(&z);
    if a < 0.0 {
        // can happen through roundoff
        if a < -EPSILON * h.length() {
            warn!("numerical instabilities in the `bis` frame, a: {:e}, b: {:e}", a, b);
        }
        a = 0.0;
    }
    debug_assert!(b.is_finite());
    if abs(a) < 1e-4 {
        // lets the deviations go to infinity (plain uniform sampling),
        // which sidesteps pdf inconsistencies near the threshold
        a = 0.0;
    }
    BisKernel { x, y, z, a, b }
}

/// Samples the `bis` parameterization.
fn sample_direction_monopole_bis(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
    sampler: &mut dyn Sampler,
) -> Option<(Vector3f, Float)> {
    debug_assert!(abs(ul.length() - 1.0) < SHADOW_EPSILON);
    debug_assert!(r.is_finite());
    debug_assert!(s.is_finite() && s >= 0.0);

    let k = bis_kernel(params, n0, ul, r, s);

    let (cos_theta, cos_theta_pdf) = sample_exp_sin_cos_d_cos(k.a, k.b, sampler);
    let sin_theta = safe_sqrt(1.0 - square(cos_theta));

    // azimuth weight: exp(a·sinθ·cosφ)
    let phi_cte = abs(k.a) * sin_theta;
    let (phi, phi_pdf) = sample_exp_cos_d_phi(phi_cte, sampler)?;
    if phi_pdf == 0.0 {
        return None;
    }

    let (sin_phi, cos_phi) = sincos(phi);
    let u0 = k.x * (cos_phi * sin_theta) + k.y * (sin_phi * sin_theta) + k.z * cos_theta;
    debug_assert!(abs(u0.length() - 1.0) < SHADOW_EPSILON);

    let pdf = cos_theta_pdf * phi_pdf;
    if !pdf.is_finite() || pdf < 0.0 {
        warn!("problematic `bis` direction pdf: {:e}", pdf);
        return None;
    }
    if pdf == 0.0 {
        return None;
    }

    #[cfg(debug_assertions)]
    {
        let check = pdf_direction_monopole_bis(params, &u0, n0, ul, r, s);
        if abs(pdf - check) / pdf > PDF_CONSISTENCY_TOLERANCE {
            warn!(
                "inconsistent `bis` pdfs: {:e} vs {:e}, rel {:e}",
                pdf,
                check,
                (pdf - check) / pdf
            );
        }
    }
    Some((u0, pdf))
}

/// Density of the `bis` parameterization at `u0`.
fn pdf_direction_monopole_bis(
    params: &OpticalParameters,
    u0: &Vector3f,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
) -> Float {
    let k = bis_kernel(params, n0, ul, r, s);

    let cos_theta_raw = u0.dot(&k.z);
    debug_assert!(-1.0 - EPSILON <= cos_theta_raw && cos_theta_raw <= EPSILON);
    let cos_theta = clamp(cos_theta_raw, -1.0, 0.0);
    let cos_theta_pdf = exp_sin_cos_d_cos_pdf(k.a, k.b, cos_theta);
    let sin_theta = safe_sqrt(1.0 - square(cos_theta));

    let phi_cte = abs(k.a) * sin_theta;
    let phi = (u0.dot(&k.y)).atan2(u0.dot(&k.x));
    let phi_pdf = exp_cos_d_phi_pdf(phi_cte, phi);
    if phi_pdf == 0.0 {
        return 0.0;
    }

    let pdf = cos_theta_pdf * phi_pdf;
    if !pdf.is_finite() || pdf < 0.0 {
        warn!("problematic `bis` direction pdf: {:e}", pdf);
        return 0.0;
    }
    pdf
}

// ----------------------------------------------------------------------------
// Boundary-aware monopole sampler
// ----------------------------------------------------------------------------

/// Samples an entry direction from the boundary-aware monopole: the
/// analytic effective-BRDF form, or a 0.5/0.5 mixture of the `orig` and
/// `bis` parameterizations.
fn sample_direction_boundary_aware_monopole(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
    use_effective_brdf: bool,
    sampler: &mut dyn Sampler,
) -> Option<(Vector3f, Float)> {
    if use_effective_brdf {
        return sample_direction_brdf(params, n0, ul, r, s, sampler);
    }

    let (u0, p1, p2) = if sampler.next_1d() < DIRECTION_ORIG_WEIGHT {
        let (u0, p1) = sample_direction_monopole_orig(params, n0, ul, r, s, sampler)?;
        let p2 = pdf_direction_monopole_bis(params, &u0, n0, ul, r, s);
        (u0, p1, p2)
    } else {
        let (u0, p2) = sample_direction_monopole_bis(params, n0, ul, r, s, sampler)?;
        let p1 = pdf_direction_monopole_orig(params, &u0, n0, ul, r, s);
        (u0, p1, p2)
    };
    Some((u0, p1 * DIRECTION_ORIG_WEIGHT + p2 * (1.0 - DIRECTION_ORIG_WEIGHT)))
}

/// Density of the boundary-aware monopole sampler at `u0`.
fn pdf_direction_boundary_aware_monopole(
    params: &OpticalParameters,
    u0: &Vector3f,
    n0: &Normal3f,
    ul: &Vector3f,
    r: &Vector3f,
    s: Float,
    use_effective_brdf: bool,
) -> Float {
    if use_effective_brdf {
        return pdf_direction_brdf(params, u0, n0, ul, r, s);
    }

    let p1 = pdf_direction_monopole_orig(params, u0, n0, ul, r, s);
    let p2 = pdf_direction_monopole_bis(params, u0, n0, ul, r, s);
    p1 * DIRECTION_ORIG_WEIGHT + p2 * (1.0 - DIRECTION_ORIG_WEIGHT)
}

// ----------------------------------------------------------------------------
// Dipole-level mixture
// ----------------------------------------------------------------------------

/// Draws an entry direction for a dipole query: a real-source and a
/// virtual-source boundary-aware monopole sampler weighted by the
/// real-source weight, plus a cosine-hemisphere robustness floor. Returns
/// the direction and its balance-heuristic mixture density.
///
/// * `params`             - Medium parameters.
/// * `n0`                 - Entry surface normal.
/// * `ul`                 - Internal exit direction.
/// * `nl`                 - Exit surface normal.
/// * `r`                  - Real displacement.
/// * `s`                  - Path length.
/// * `tangent_mode`       - Tangent-plane convention.
/// * `use_effective_brdf` - Coincident entry/exit form.
/// * `sampler`            - Random source.
#[allow(clippy::too_many_arguments)]
pub fn sample_direction_dipole(
    params: &OpticalParameters,
    n0: &Normal3f,
    ul: &Vector3f,
    nl: &Normal3f,
    r: &Vector3f,
    s: Float,
    tangent_mode: TangentPlaneMode,
    use_effective_brdf: bool,
    sampler: &mut dyn Sampler,
) -> Option<(Vector3f, Float)> {
    let (r_virt, n0_effective) =
        tentative_virtual_source_displacement(params, n0, nl, r, tangent_mode)?;
    debug_assert!(r_virt.is_finite());
    let real_weight = real_source_weight(params, ul, r, &r_virt, s);

    let mut p_real = None;
    let mut p_virt = None;
    let u0;
    let u = sampler.next_1d();
    if u <= (1.0 - DIRECTION_HEMI_WEIGHT) * real_weight {
        let (dir, pdf) = sample_direction_boundary_aware_monopole(
            params,
            n0,
            ul,
            r,
            s,
            use_effective_brdf,
            sampler,
        )?;
        u0 = dir;
        p_real = Some(pdf);
    } else if u <= 1.0 - DIRECTION_HEMI_WEIGHT {
        let n0_virt = n0.mirror(&n0_effective);
        let (dir_virt, pdf) = sample_direction_boundary_aware_monopole(
            params,
            &n0_virt,
            ul,
            &r_virt,
            s,
            use_effective_brdf,
            sampler,
        )?;
        p_virt = Some(pdf);
        // don't forget to transform back to the real entry direction
        u0 = dir_virt.mirror(&n0_effective);
    } else {
        let (dir, _) = sample_hemisphere_inward(n0, sampler);
        u0 = dir;
    }

    let p_real = p_real.unwrap_or_else(|| {
        pdf_direction_boundary_aware_monopole(params, &u0, n0, ul, r, s, use_effective_brdf)
    });
    let p_virt = p_virt.unwrap_or_else(|| {
        // Transform to the virtual direction to get the matching density,
        // with a mirrored normal so the admissible hemisphere maps onto
        // the correct side of the actual boundary.
        let u0_virt = u0.mirror(&n0_effective);
        let n0_virt = n0.mirror(&n0_effective);
        pdf_direction_boundary_aware_monopole(
            params,
            &u0_virt,
            &n0_virt,
            ul,
            &r_virt,
            s,
            use_effective_brdf,
        )
    });
    let p_hemi = pdf_hemisphere_inward(n0, &u0);

    let pdf = (1.0 - DIRECTION_HEMI_WEIGHT)
        * (real_weight * p_real + (1.0 - real_weight) * p_virt)
        + DIRECTION_HEMI_WEIGHT * p_hemi;
    Some((u0, pdf))
}

/// Re-evaluates the dipole direction mixture density at `u0`.
///
/// * `params`             - Medium parameters.
/// * `u0`                 - The entry direction.
/// * `n0`                 - Entry surface normal.
/// * `ul`                 - Internal exit direction.
/// * `nl`                 - Exit surface normal.
/// * `r`                  - Real displacement.
/// * `s`                  - Path length.
/// * `tangent_mode`       - Tangent-plane convention.
/// * `use_effective_brdf` - Coincident entry/exit form.
#[allow(clippy::too_many_arguments)]
pub fn pdf_direction_dipole(
    params: &OpticalParameters,
    u0: &Vector3f,
    n0: &Normal3f,
    ul: &Vector3f,
    nl: &Normal3f,
    r: &Vector3f,
    s: Float,
    tangent_mode: TangentPlaneMode,
    use_effective_brdf: bool,
) -> Float {
    let Some((r_virt, n0_effective)) =
        tentative_virtual_source_displacement(params, n0, nl, r, tangent_mode)
    else {
        return 0.0;
    };
    debug_assert!(r_virt.is_finite());
    let real_weight = real_source_weight(params, ul, r, &r_virt, s);

    let p_real =
        pdf_direction_boundary_aware_monopole(params, u0, n0, ul, r, s, use_effective_brdf);

    let u0_virt = u0.mirror(&n0_effective);
    let n0_virt = n0.mirror(&n0_effective);
    let p_virt = pdf_direction_boundary_aware_monopole(
        params,
        &u0_virt,
        &n0_virt,
        ul,
        &r_virt,
        s,
        use_effective_brdf,
    );

    let p_hemi = pdf_hemisphere_inward(n0, u0);

    (1.0 - DIRECTION_HEMI_WEIGHT) * (real_weight * p_real + (1.0 - real_weight) * p_virt)
        + DIRECTION_HEMI_WEIGHT * p_hemi
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use base::rng::Rng;

    fn params() -> OpticalParameters {
        OpticalParameters::new(1.0, 0.2, 0.5, 1.3)
    }

    fn geometry() -> (Vector3f, Vector3f, Vector3f) {
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let ul = Vector3f::new(0.3, 0.1, 0.8).normalize();
        let r = Vector3f::new(1.2, -0.4, 0.0);
        (n0, ul, r)
    }

    #[test]
    fn orig_sample_matches_pdf() {
        let p = params();
        let (n0, ul, r) = geometry();
        let mut rng = Rng::new(31);
        for s in [0.2, 1.5, 12.0] {
            for _ in 0..2000 {
                if let Some((u0, pdf)) =
                    sample_direction_monopole_orig(&p, &n0, &ul, &r, s, &mut rng)
                {
                    assert!(u0.dot(&n0) < 0.0);
                    let check = pdf_direction_monopole_orig(&p, &u0, &n0, &ul, &r, s);
                    assert!(
                        (pdf - check).abs() <= 1e-3 * pdf,
                        "s={s} pdf={pdf} check={check}"
                    );
                }
            }
        }
    }

    #[test]
    fn bis_sample_matches_pdf() {
        let p = params();
        let (n0, ul, r) = geometry();
        let mut rng = Rng::new(32);
        for s in [0.2, 1.5, 12.0] {
            for _ in 0..2000 {
                if let Some((u0, pdf)) =
                    sample_direction_monopole_bis(&p, &n0, &ul, &r, s, &mut rng)
                {
                    let check = pdf_direction_monopole_bis(&p, &u0, &n0, &ul, &r, s);
                    assert!(
                        (pdf - check).abs() <= 1e-3 * pdf,
                        "s={s} pdf={pdf} check={check}"
                    );
                }
            }
        }
    }

    #[test]
    fn brdf_sample_matches_pdf() {
        let p = params();
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let ul = Vector3f::new(0.3, 0.1, 0.8).normalize();
        let r = Vector3f::ZERO;
        let mut rng = Rng::new(33);
        for s in [0.2, 1.5, 12.0] {
            for _ in 0..2000 {
                if let Some((u0, pdf)) = sample_direction_brdf(&p, &n0, &ul, &r, s, &mut rng) {
                    let check = pdf_direction_brdf(&p, &u0, &n0, &ul, &r, s);
                    assert!(
                        (pdf - check).abs() <= 1e-3 * pdf,
                        "s={s} pdf={pdf} check={check}"
                    );
                }
            }
        }
    }

    #[test]
    fn dipole_sample_matches_pdf() {
        let p = params();
        let (n0, ul, r) = geometry();
        let mut rng = Rng::new(34);
        let mut checked = 0;
        for s in [0.4, 3.0] {
            for _ in 0..2000 {
                if let Some((u0, pdf)) = sample_direction_dipole(
                    &p,
                    &n0,
                    &ul,
                    &n0,
                    &r,
                    s,
                    TangentPlaneMode::FrisvadEtAl,
                    false,
                    &mut rng,
                ) {
                    let check = pdf_direction_dipole(
                        &p,
                        &u0,
                        &n0,
                        &ul,
                        &n0,
                        &r,
                        s,
                        TangentPlaneMode::FrisvadEtAl,
                        false,
                    );
                    assert!(
                        (pdf - check).abs() <= 1e-3 * pdf,
                        "s={s} pdf={pdf} check={check}"
                    );
                    checked += 1;
                }
            }
        }
        assert!(checked > 3000);
    }

    /// Quadrature of the dipole direction density over the admissible
    /// hemisphere dot(u0, n0) < 0.
    fn integrate_direction_pdf(p: &OpticalParameters, s: Float) -> Float {
        let (n0, ul, r) = geometry();
        let n_theta = 400;
        let n_phi = 800;
        let mut total = 0.0;
        for i in 0..n_theta {
            // cosθ ∈ (−1, 0): measure d(cosθ) dφ
            let cos_theta = -((i as Float + 0.5) / n_theta as Float);
            let sin_theta = safe_sqrt(1.0 - cos_theta * cos_theta);
            for j in 0..n_phi {
                let phi = TWO_PI * (j as Float + 0.5) / n_phi as Float;
                let u0 = Vector3f::new(
                    sin_theta * phi.cos(),
                    sin_theta * phi.sin(),
                    cos_theta,
                );
                total += pdf_direction_dipole(
                    p,
                    &u0,
                    &n0,
                    &ul,
                    &n0,
                    &r,
                    s,
                    TangentPlaneMode::FrisvadEtAl,
                    false,
                );
            }
        }
        total * (1.0 / n_theta as Float) * (TWO_PI / n_phi as Float)
    }

    #[test]
    fn dipole_direction_pdf_normalizes() {
        let p = params();
        for s in [0.5, 3.0] {
            let total = integrate_direction_pdf(&p, s);
            assert!((total - 1.0).abs() < 0.01, "s={s}: {total}");
        }
    }

    #[test]
    fn sampled_directions_are_incoming() {
        let p = params();
        let (n0, ul, r) = geometry();
        let mut rng = Rng::new(35);
        for _ in 0..2000 {
            if let Some((u0, pdf)) = sample_direction_dipole(
                &p,
                &n0,
                &ul,
                &n0,
                &r,
                1.0,
                TangentPlaneMode::FrisvadEtAl,
                false,
                &mut rng,
            ) {
                assert!(u0.dot(&n0) <= 0.0);
                assert!((u0.length() - 1.0).abs() < 1e-9);
                assert!(pdf > 0.0);
            }
        }
    }
}
