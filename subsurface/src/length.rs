//! Free-path length sampling.
//!
//! Three strategies, each a paired sample/pdf routine: a ballistic
//! short-limit fit, a diffusive long-limit CDF inversion, and plain
//! absorption sampling. `sample_length_dipole` mixes them with fixed
//! weights under the balance heuristic.

use crate::params::compute_shape_parameters;
use crate::virtual_source::{tentative_virtual_source_displacement, TangentPlaneMode};
use crate::OpticalParameters;
use base::geometry::*;
use base::math::roots::find_root_bracketed;
use base::math::*;
use base::rng::Sampler;
use base::sampling::{sample_truncated_normal, truncated_normal_pdf};

/// Strategy weights, must sum to one.
pub const LENGTH_SAMPLE_W1: Float = 0.5; // short length limit
pub const LENGTH_SAMPLE_W2: Float = 0.5; // long length limit
pub const LENGTH_SAMPLE_W3: Float = 0.0; // absorption

/// Below this fitted mean-to-deviation ratio the truncated-normal tail is
/// numerically unreachable; sampling falls back to the uniform backup.
const MEAN_TAIL_CUTOFF: Float = if std::mem::size_of::<Float>() == 4 { -1e4 } else { -1e7 };

/// Variance-inflation factor of the safety fit in the marginalized
/// short-limit sampler.
const MARG_SAFETY_FACTOR: Float = 3.0;

/// Mixture weight of the safety fit.
const MARG_SAFETY_WEIGHT: Float = 0.3;

/// Span of the uniform backup strategy, in units of optical depth.
const MARG_UNIFORM_SPAN: Float = 2.0;

/// Samples the free-path length from the absorption factor alone.
///
/// This is the safest bet at infinity (the tail is certainly heavier than
/// the target distribution), but extremely high variance is possible for
/// high albedo materials. Disabled (no sample) when σa = 0.
///
/// * `params`  - Medium parameters.
/// * `sampler` - Random source.
pub fn sample_length_absorption(
    params: &OpticalParameters,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    if params.sigma_a == 0.0 {
        return None;
    }
    let u = 1.0 - sampler.next_1d(); // (0, 1]: keeps the length finite
    let s = -u.ln() / params.sigma_a;
    let pdf = params.sigma_a * (-params.sigma_a * s).exp();
    debug_assert!(s.is_finite() && s >= 0.0);
    debug_assert!(pdf.is_finite());
    Some((s, pdf))
}

/// Density of the absorption strategy; identically zero when σa = 0.
///
/// * `params` - Medium parameters.
/// * `s`      - Path length.
pub fn pdf_length_absorption(params: &OpticalParameters, s: Float) -> Float {
    if params.sigma_a == 0.0 {
        return 0.0;
    }
    let pdf = params.sigma_a * (-params.sigma_a * s).exp();
    debug_assert!(pdf.is_finite());
    pdf
}

// ----------------------------------------------------------------------------
// Short length limit
// ----------------------------------------------------------------------------

/// Truncated-normal fit of the transformed length variable.
struct LengthFit {
    mean: f64,
    stddev: f64,
}

/// Fits mean and standard deviation of t = (ps)^(−3) for the ballistic
/// peak with a known entry direction; requires a nonzero rescaled
/// transport distance.
///
/// The mean is the root of a cubic polynomial; both branches are
/// transcriptions of symbolic-algebra output and must keep their exact
/// operation order.
fn short_limit_known_u0_fit(
    r: f64,
    cos_theta_0l: f64,
    u0_dot_ul: f64,
) -> LengthFit {
    let mut mean;
    if r > 1e-4 {
        // full expression is sufficiently stable
        let t1 = 0.1e1 / r;
        let t2 = cos_theta_0l * cos_theta_0l;
        let t3 = t2 * cos_theta_0l;
        let t5 = 0.3e1f64.sqrt();
        let t8 = u0_dot_ul * u0_dot_ul;
        let t18 = r * r;
        let t25 = -108.0 * r * u0_dot_ul * cos_theta_0l + 96.0 * t3 * r
            - 216.0 * r * cos_theta_0l
            - 4.0 * t2 * t8
            - 16.0 * t2 * u0_dot_ul
            + 4.0 * t8 * u0_dot_ul
            + 243.0 * t18
            - 16.0 * t2
            + 24.0 * t8
            + 48.0 * u0_dot_ul
            + 32.0;
        let t26 = t25.sqrt();
        let t34 = (12.0 * t26 * t5 - (72.0 * cos_theta_0l * u0_dot_ul) + (324.0 * r)
            + (64.0 * t3)
            - (144.0 * cos_theta_0l))
            .cbrt();
        let t35 = t34 * t1;
        let t42 = 1.0 / t34 * t1 * (-4.0 * t2 + 3.0 * u0_dot_ul + 6.0);
        let t44 = cos_theta_0l * t1;
        let t46 = t35 / 18.0 + 2.0 / 9.0 * (t44 - t42);
        let t47 = t46 * t46;
        mean = 1.0 / 9.0 / t18
            * (6.0 * cos_theta_0l * t47 * r - u0_dot_ul * t46 - t35 / 9.0
                + 4.0 / 9.0 * (t42 - t44)
                + 1.0);
    } else {
        // short r limit: first nontrivial order expansion
        let t1 = 3.0f64.sqrt();
        let t3 = (u0_dot_ul + 2.0) * (u0_dot_ul + 2.0);
        let t4 = cos_theta_0l * cos_theta_0l;
        let t7 = (t3 * (-t4 + u0_dot_ul + 2.0)).sqrt();
        let t14 = 24.0 * t1 * t7 - 72.0 * cos_theta_0l * (-8.0 / 9.0 * t4 + u0_dot_ul + 2.0);
        let t15 = t14.cbrt();
        let t16 = t15 * t15;
        let t28 = -8.0 / 3.0 * t4 + u0_dot_ul + 2.0;
        let t35 = t4 * t4;
        let t41 = u0_dot_ul * u0_dot_ul;
        let t48 = r * r;
        mean = ((48.0 * t4 * cos_theta_0l + (-36.0 * u0_dot_ul - 72.0) * cos_theta_0l) * t16
            + 36.0 * (-4.0 / 3.0 * t4 + u0_dot_ul + 2.0) * t28 * t15
            - 72.0 * t1 * t28 * t7
            + cos_theta_0l
                * ((768.0 * t35) + ((-1152.0 * u0_dot_ul - 2304.0) * t4) + t15 * t14 + (360.0 * t41)
                    + (1440.0 * u0_dot_ul)
                    + 1440.0))
            / (t16 * t48 * r * 486.0);
    }
    if !mean.is_finite() || mean <= 0.0 {
        // This usually happens for small to negative u0_dot_ul and
        // cos_theta_0l, at which point there is no large ballistic peak
        // anyway. Any choice is better than no choice, so push s to r:
        mean = 1.0 / (r * r * r);
    }
    debug_assert!(mean.is_finite() && mean > 0.0);

    let mean113 = mean.powf(11. / 3.);
    let mean53 = mean.powf(5. / 3.);
    let mean73 = mean.powf(7. / 3.);
    let mean2 = mean * mean;
    let real_stddev;
    if r < 1e-4 {
        // short r limit expansion
        real_stddev = (((-54.0 * r * cos_theta_0l + 12.0 * u0_dot_ul * u0_dot_ul
            + 48.0 * u0_dot_ul
            + 48.0)
            * mean.powf(8. / 3.))
            / 27.0
            + (18.0 * u0_dot_ul + 36.0) * mean73 / 27.0
            + (8.0 * u0_dot_ul * u0_dot_ul * u0_dot_ul + 48.0 * u0_dot_ul * u0_dot_ul
                + (-72.0 * r * cos_theta_0l + 96.0) * u0_dot_ul
                - 144.0 * r * cos_theta_0l
                + 64.0)
                * mean
                * mean
                * mean
                / 27.0
            + mean * mean)
            .sqrt();
    } else {
        real_stddev = ((3.0 * mean113)
            / (3.0 * mean53 + 6.0 * mean73 * r * cos_theta_0l - (2.0 * u0_dot_ul + 4.0) * mean2))
            .sqrt();
    }
    let stddev_safety_factor = 2.0;
    let mut stddev = stddev_safety_factor * real_stddev;
    if !stddev.is_finite() || stddev <= 0.0 {
        stddev = mean; // heuristic!
    }
    debug_assert!(stddev.is_finite() && stddev > 0.0);

    LengthFit { mean, stddev }
}

/// Samples the ballistic short-length peak with a known entry direction.
fn sample_length_short_limit_known_u0(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    u0: &Vector3f,
    ul: &Vector3f,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    let p = params.p();
    let l_rl = r_vec.length();
    let r = l_rl * p;
    if r == 0.0 {
        return None;
    }
    let cos_theta_0l =
        clamp(r_vec.dot(u0) / l_rl, -1.0, 1.0) + clamp(r_vec.dot(ul) / l_rl, -1.0, 1.0);
    let fit = short_limit_known_u0_fit(r, cos_theta_0l, u0.dot(ul));

    let mut t = 0.0;
    for _ in 0..100 {
        t = sample_truncated_normal(fit.mean, fit.stddev, 0.0, INFINITY, sampler);
        if t != 0.0 {
            break;
        }
    }
    if t == 0.0 {
        return None;
    }
    let ps = t.powf(-1. / 3.);
    let s = ps / p;
    debug_assert!(s.is_finite() && s > 0.0);

    let t_pdf = truncated_normal_pdf(fit.mean, fit.stddev, 0.0, INFINITY, t);
    // transform from pdf(t = (ps)^(-3)) to pdf(ps) and then back to p != 1
    if !(t_pdf > 0.0) {
        return None;
    }
    let pdf = t_pdf * 3.0 / (ps * ps * ps * ps) * p;
    Some((s, pdf))
}

/// Density of the known-direction short-limit strategy at `s`.
fn pdf_length_short_limit_known_u0(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    u0: &Vector3f,
    ul: &Vector3f,
    s: Float,
) -> Float {
    let p = params.p();
    let l_rl = r_vec.length();
    let r = l_rl * p;
    if r == 0.0 {
        return 0.0;
    }
    let cos_theta_0l =
        clamp(r_vec.dot(u0) / l_rl, -1.0, 1.0) + clamp(r_vec.dot(ul) / l_rl, -1.0, 1.0);
    let fit = short_limit_known_u0_fit(r, cos_theta_0l, u0.dot(ul));

    let ps = p * s;
    let t = 1.0 / (ps * ps * ps);
    let t_pdf = truncated_normal_pdf(fit.mean, fit.stddev, 0.0, INFINITY, t);
    // the jacobian blows up at s = 0, where t_pdf vanishes
    if !(t_pdf > 0.0) {
        return 0.0;
    }
    t_pdf * 3.0 / (ps * ps * ps * ps) * p
}

/// Truncated-normal fit of t = (ps)^(−5/2) for the short-limit sampler
/// marginalized over the entry direction, with the variance inflated by
/// `safety_factor` (the mean in ps held fixed). A `uniform_backup` weight
/// of one disables the fit entirely.
struct MargFit {
    uniform_backup: Float,
    mean: f64,
    stddev: f64,
}

fn short_limit_marginal_fit(r: f64, cos_theta: f64, safety_factor: Float) -> MargFit {
    let r2 = r * r;
    let disabled = MargFit { uniform_backup: 1.0, mean: -1.0, stddev: -1.0 };

    let d = (25.0 * cos_theta * (cos_theta + 1.0) - 25.0 - 30.0 * r2) / 225.0;
    if d <= 0.0 {
        return disabled;
    }
    let t_mean25 = ((cos_theta + 1.0) / 3.0 + d.sqrt()) / r; // t_mean^(2/5)
    if t_mean25 <= 0.0 {
        return disabled;
    }
    let t_mean = t_mean25 * t_mean25 * t_mean25.sqrt(); // t_mean25^(5/2)
    let t_mean45 = square(t_mean25); // t_mean^(4/5)
    let t_mean85 = square(t_mean45); // t_mean^(8/5)
    let t_var = 125.0 * t_mean85
        / (135.0 * r2 * t_mean45 + 90.0 * r * (cos_theta + 1.0) * t_mean25
            - 54.0 * r2
            - 45.0 * (cos_theta + 2.0));
    if !(t_var > 0.0) {
        warn!("unexpected variance in marginalized short-limit fit: {:e}", t_var);
        return disabled;
    }

    let mut fit = if safety_factor == 1.0 {
        MargFit { uniform_backup: 1e-2, mean: t_mean, stddev: t_var.sqrt() }
    } else {
        // Adjust mean and variance for the safety factor, an approximate
        // rescaling of the variance in ps with the mean in ps kept constant.
        let t_mean2 = t_mean * t_mean;
        let t_mean4 = t_mean2 * t_mean2;
        let tmp2 = 1764.0 * square((safety_factor - 7. / 6.) * t_var)
            + (2450.0 - 2800.0 * safety_factor) * t_var * t_mean2
            + 625.0 * t_mean4;
        let tmp = if tmp2 > 0.0 { tmp2.sqrt() } else { 0.0 };
        let new_mean = t_mean
            * (475.0 * t_mean2 - 868.0 * safety_factor * t_var + 931.0 * t_var - 19.0 * tmp)
            / (350.0 * t_mean2 + (686.0 - 588.0 * safety_factor) * t_var - 14.0 * tmp);
        let new_var = t_var * (7. / 2. - 3.0 * safety_factor) + 25. / 14. * t_mean2 - tmp / 14.0;
        if !tmp.is_finite() || !new_mean.is_finite() || !(new_var > 0.0) {
            // can happen: keep the original fit and raise the uniform
            // backup weight as a safety measure
            MargFit { uniform_backup: 0.3, mean: t_mean, stddev: t_var.sqrt() }
        } else {
            MargFit { uniform_backup: 1e-2, mean: new_mean, stddev: new_var.sqrt() }
        }
    };

    if fit.mean / fit.stddev < MEAN_TAIL_CUTOFF {
        // Sampling would nearly always give t = 0 exactly, i.e. infinite
        // optical depth; only the uniform backup can still act.
        fit.uniform_backup = 1.0;
    }
    fit
}

/// Draws an optical depth from one marginalized fit (or its uniform
/// backup) and returns it with the fitted t value.
fn marg_fit_sample(fit: &MargFit, sampler: &mut dyn Sampler) -> Option<Float> {
    if fit.uniform_backup == 1.0 || sampler.next_1d() < fit.uniform_backup {
        Some(MARG_UNIFORM_SPAN * sampler.next_1d())
    } else {
        let mut t = 0.0;
        for _ in 0..100 {
            t = sample_truncated_normal(fit.mean, fit.stddev, 0.0, INFINITY, sampler);
            if t != 0.0 {
                break;
            }
        }
        if t == 0.0 {
            return None;
        }
        Some(t.powf(-2. / 5.))
    }
}

/// Density in ps of one marginalized fit, including its uniform backup.
fn marg_fit_pdf(fit: &MargFit, ps: Float) -> Float {
    let t = ps.powf(-5. / 2.);
    let t_pdf = if fit.uniform_backup == 1.0 {
        0.0
    } else {
        truncated_normal_pdf(fit.mean, fit.stddev, 0.0, INFINITY, t)
    };
    let uniform_pdf = if ps < MARG_UNIFORM_SPAN { 1.0 / MARG_UNIFORM_SPAN } else { 0.0 };
    // the t-to-ps jacobian blows up at ps = 0, where t_pdf vanishes
    let fitted = if t_pdf > 0.0 {
        t_pdf * 5.0 / 2.0 * ps.powf(-7. / 2.)
    } else {
        0.0
    };
    fit.uniform_backup * uniform_pdf + (1.0 - fit.uniform_backup) * fitted
}

/// Samples the short-length peak marginalized over the entry direction:
/// the plain fit blended with a variance-inflated safety fit.
fn sample_length_short_limit_marginal(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    ul: &Vector3f,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    let p = params.p();
    let l_rl = r_vec.length();
    let r = l_rl * p;
    // Not sensible without a ballistic displacement; the r = 0 case occurs
    // for an effective BRDF and needs the dedicated sampler.
    if r == 0.0 {
        return None;
    }
    let cos_theta = clamp(r_vec.dot(ul) / l_rl, -1.0, 1.0);

    let fit_orig = short_limit_marginal_fit(r, cos_theta, 1.0);
    let fit_safety = short_limit_marginal_fit(r, cos_theta, MARG_SAFETY_FACTOR);

    let ps = if sampler.next_1d() < MARG_SAFETY_WEIGHT {
        marg_fit_sample(&fit_safety, sampler)?
    } else {
        marg_fit_sample(&fit_orig, sampler)?
    };
    let s = ps / p;
    debug_assert!(s >= 0.0);

    let pdf = (MARG_SAFETY_WEIGHT * marg_fit_pdf(&fit_safety, ps)
        + (1.0 - MARG_SAFETY_WEIGHT) * marg_fit_pdf(&fit_orig, ps))
        * p; // ps-to-s jacobian
    if !(pdf > 0.0) {
        return None;
    }
    Some((s, pdf))
}

/// Density of the marginalized short-limit strategy at `s`.
fn pdf_length_short_limit_marginal(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    ul: &Vector3f,
    s: Float,
) -> Float {
    let p = params.p();
    let l_rl = r_vec.length();
    let r = l_rl * p;
    if r == 0.0 {
        return 0.0;
    }
    let cos_theta = clamp(r_vec.dot(ul) / l_rl, -1.0, 1.0);

    let fit_orig = short_limit_marginal_fit(r, cos_theta, 1.0);
    let fit_safety = short_limit_marginal_fit(r, cos_theta, MARG_SAFETY_FACTOR);

    let ps = s * p;
    (MARG_SAFETY_WEIGHT * marg_fit_pdf(&fit_safety, ps)
        + (1.0 - MARG_SAFETY_WEIGHT) * marg_fit_pdf(&fit_orig, ps))
        * p
}

/// Samples the ballistic short-length peak. With a known entry direction
/// the peak is fitted in t = (ps)^(−3); marginalized over the entry
/// direction it is fitted in t = (ps)^(−5/2) with a safety blend.
///
/// * `params`  - Medium parameters.
/// * `r_vec`   - Displacement driving the strategy (real displacement).
/// * `u0`      - Internal entry direction if known.
/// * `ul`      - Internal exit direction.
/// * `sampler` - Random source.
pub fn sample_length_short_limit(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    u0: Option<&Vector3f>,
    ul: &Vector3f,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    match u0 {
        Some(u0) => sample_length_short_limit_known_u0(params, r_vec, u0, ul, sampler),
        None => sample_length_short_limit_marginal(params, r_vec, ul, sampler),
    }
}

/// Density of the short-limit strategy at `s`.
///
/// * `params` - Medium parameters.
/// * `r_vec`  - Displacement driving the strategy.
/// * `u0`     - Internal entry direction if known.
/// * `ul`     - Internal exit direction.
/// * `s`      - Path length.
pub fn pdf_length_short_limit(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    u0: Option<&Vector3f>,
    ul: &Vector3f,
    s: Float,
) -> Float {
    match u0 {
        Some(u0) => pdf_length_short_limit_known_u0(params, r_vec, u0, ul, s),
        None => pdf_length_short_limit_marginal(params, r_vec, ul, s),
    }
}

// ----------------------------------------------------------------------------
// Long length limit
// ----------------------------------------------------------------------------

/// CDF of the diffusive long-length limit in the rescaled depth ps, built
/// from complementary-error-function sums. Arguments past ±3 use an
/// asymptotic series: the closed form multiplies a huge exp() into a
/// vanishing erfc() there and loses every digit.
fn long_limit_cdf(ps: f64, sa: f64, sb: f64, c: f64) -> f64 {
    let erf_diff_arg = (sa * ps + sb) / ps.sqrt();
    let erf_sum_arg = (sa * ps - sb) / ps.sqrt();
    let erf_diff;
    let erf_sum;
    if erf_diff_arg > 3.0 {
        let x = erf_diff_arg;
        let x2 = x * x;
        let x3 = x2 * x;
        let x5 = x3 * x2;
        erf_diff = (1.0 / x - 0.5 / x3 + 0.75 / x5) * (4.0 * sa * sb - x2).exp() / PI.sqrt();
    } else {
        erf_diff = c * (1.0 - erf(erf_diff_arg));
    }
    if erf_sum_arg < -3.0 {
        let x = erf_sum_arg;
        let x2 = x * x;
        let x3 = x2 * x;
        let x5 = x3 * x2;
        erf_sum = (-1.0 / x + 0.5 / x3 - 0.75 / x5) / x2.exp() / PI.sqrt();
    } else {
        erf_sum = 1.0 + erf(erf_sum_arg);
    }
    let the_cdf = 0.5 * (erf_diff + erf_sum);
    if the_cdf <= -EPSILON || the_cdf >= 1.0 + EPSILON {
        warn!(
            "invalid long-limit cdf: {:e} (diff {:e}, sum {:e}, C {:e})",
            the_cdf, erf_diff, erf_sum, c
        );
    }
    clamp(the_cdf, 0.0, 1.0)
}

/// The quadratic-form pivot β of the long-limit CDF; nonpositive values
/// mean the diffusive tail carries no displacement information.
fn long_limit_beta(params: &OpticalParameters, r_vec: &Vector3f, ul: &Vector3f) -> Float {
    let p = params.p();
    let r_p1 = *r_vec * p;
    let r2_minus_r_dot_ul = r_p1.length_squared() - r_p1.dot(ul);
    3. / 2. * r2_minus_r_dot_ul
}

/// Samples the diffusive long-length tail by inverting its closed-form CDF
/// with a bracketed root search. Falls back to the absorption strategy
/// when the pivot β ≤ 0; bracketing or root-search failure yields no
/// sample.
///
/// * `params`  - Medium parameters.
/// * `r_vec`   - Displacement driving the strategy (real or virtual).
/// * `ul`      - Internal exit direction.
/// * `sampler` - Random source.
pub fn sample_length_long_limit(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    ul: &Vector3f,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    let p = params.p();
    if p == 0.0 {
        return None;
    }
    let beta = long_limit_beta(params, r_vec, ul);
    if beta <= 0.0 {
        return sample_length_absorption(params, sampler);
    }
    let b = beta;
    let a = params.sigma_a / p;
    debug_assert!(a >= 0.0);
    let sa = a.sqrt();
    let sb = b.sqrt();
    let c = (4.0 * sa * sb).exp();

    let u = sampler.next_1d();
    let target = |ps: f64| long_limit_cdf(ps, sa, sb, c) - u;

    // Bracket the root.
    let lo = 0.0;
    let t_lo = target(lo);
    if !t_lo.is_finite() || t_lo > 0.0 {
        warn!("long-limit target(lo) did something weird: {:e}", t_lo);
        return None;
    }
    let mut hi = 1000.0 / a;
    if !target(hi).is_finite() {
        warn!("long-limit target(hi) not finite: {:e}", target(hi));
        return None;
    }
    while target(hi) < 0.0 && hi < 1e4 * 1000.0 / a {
        hi *= 3.0; // look further if we don't have the zero crossing bracketed
    }
    if !target(hi).is_finite() || target(hi) < 0.0 {
        warn!("could not find a suitable long-limit target(hi): {:e}", target(hi));
        return None;
    }

    let s = match find_root_bracketed(target, lo, hi, 15, 1000) {
        Ok((r_lo, r_hi)) => {
            let s_p1 = 0.5 * (r_lo + r_hi);
            let s = s_p1 / p;
            if !s.is_finite() {
                warn!("non-finite long-limit length: {:e}", s);
                return None;
            }
            s
        }
        Err(e) => {
            warn!("long-limit root search failed (sA {:e}, sB {:e}): {}", sa, sb, e);
            return None;
        }
    };
    let pdf = pdf_length_long_limit(params, r_vec, ul, s);
    if pdf == 0.0 {
        return None;
    }
    Some((s, pdf))
}

/// Density of the long-limit strategy at `s`; absorption density when the
/// pivot β ≤ 0.
///
/// * `params` - Medium parameters.
/// * `r_vec`  - Displacement driving the strategy.
/// * `ul`     - Internal exit direction.
/// * `s`      - Path length.
pub fn pdf_length_long_limit(
    params: &OpticalParameters,
    r_vec: &Vector3f,
    ul: &Vector3f,
    s: Float,
) -> Float {
    let p = params.p();
    if p == 0.0 {
        return 0.0;
    }
    let beta = long_limit_beta(params, r_vec, ul);
    if beta <= 0.0 {
        return pdf_length_absorption(params, s);
    }
    let s_p1 = s * p;
    let a_p1 = params.sigma_a / p;
    let pdf_p1 = (beta / PI).sqrt() / (s_p1 * s_p1.sqrt())
        * (-beta / s_p1 - a_p1 * s_p1 + 2.0 * (beta * a_p1).sqrt()).exp();
    if !pdf_p1.is_finite() {
        return 0.0;
    }
    pdf_p1 * p
}

// ----------------------------------------------------------------------------
// Dipole mixture
// ----------------------------------------------------------------------------

/// Draws a free-path length for a dipole query and returns it with its
/// importance weight 1/(w1·p1 + w2·p2 + w3·p3) under the balance
/// heuristic.
///
/// The long-limit strategy feeds on the real or the virtual displacement
/// with equal probability; its density is averaged over both regardless of
/// which was drawn. The short-limit strategy always uses the real
/// displacement.
///
/// * `params`       - Medium parameters.
/// * `ul`           - Internal exit direction.
/// * `nl`           - Exit surface normal.
/// * `r_vec`        - Real displacement.
/// * `u0`           - Internal entry direction if already known.
/// * `n0`           - Entry surface normal.
/// * `tangent_mode` - Tangent-plane convention.
/// * `sampler`      - Random source.
#[allow(clippy::too_many_arguments)]
pub fn sample_length_dipole(
    params: &OpticalParameters,
    ul: &Vector3f,
    nl: &Normal3f,
    r_vec: &Vector3f,
    u0: Option<&Vector3f>,
    n0: &Normal3f,
    tangent_mode: TangentPlaneMode,
    sampler: &mut dyn Sampler,
) -> Option<(Float, Float)> {
    let (r_virt, _) = tentative_virtual_source_displacement(params, n0, nl, r_vec, tangent_mode)?;

    // For displacement-dependent strategies that don't model the dipole
    // themselves: pick which displacement feeds them.
    let (r_effective, r_other) = if sampler.next_1d() < 0.5 {
        (*r_vec, r_virt)
    } else {
        (r_virt, *r_vec)
    };

    let mut p1 = None;
    let mut p2 = None;
    let mut p3 = None;
    let s;
    let u = sampler.next_1d();
    if u < LENGTH_SAMPLE_W1 {
        let (drawn, pdf) = sample_length_short_limit(params, r_vec, u0, ul, sampler)?;
        s = drawn;
        p1 = Some(pdf);
    } else if u < LENGTH_SAMPLE_W1 + LENGTH_SAMPLE_W2 {
        let (drawn, pdf) = sample_length_long_limit(params, &r_effective, ul, sampler)?;
        s = drawn;
        p2 = Some(pdf);
    } else {
        let (drawn, pdf) = sample_length_absorption(params, sampler)?;
        s = drawn;
        p3 = Some(pdf);
    }

    let p1 = p1.unwrap_or_else(|| {
        if LENGTH_SAMPLE_W1 == 0.0 {
            0.0
        } else {
            pdf_length_short_limit(params, r_vec, u0, ul, s)
        }
    });
    let mut p2 = p2.unwrap_or_else(|| {
        if LENGTH_SAMPLE_W2 == 0.0 {
            0.0
        } else {
            pdf_length_long_limit(params, &r_effective, ul, s)
        }
    });
    let p3 = p3.unwrap_or_else(|| {
        if LENGTH_SAMPLE_W3 == 0.0 {
            0.0
        } else {
            pdf_length_absorption(params, s)
        }
    });

    // Account for the probability of having sampled from the other
    // displacement.
    if LENGTH_SAMPLE_W2 != 0.0 {
        p2 = 0.5 * (p2 + pdf_length_long_limit(params, &r_other, ul, s));
    }

    let mixture = LENGTH_SAMPLE_W1 * p1 + LENGTH_SAMPLE_W2 * p2 + LENGTH_SAMPLE_W3 * p3;
    if !(mixture > 0.0) {
        return None;
    }
    Some((s, 1.0 / mixture))
}

/// Re-evaluates the length mixture density at `s` for a length that
/// originated elsewhere.
///
/// * `params`       - Medium parameters.
/// * `ul`           - Internal exit direction.
/// * `nl`           - Exit surface normal.
/// * `r_vec`        - Real displacement.
/// * `u0`           - Internal entry direction if known.
/// * `n0`           - Entry surface normal.
/// * `tangent_mode` - Tangent-plane convention.
/// * `s`            - Path length.
#[allow(clippy::too_many_arguments)]
pub fn pdf_length_dipole(
    params: &OpticalParameters,
    ul: &Vector3f,
    nl: &Normal3f,
    r_vec: &Vector3f,
    u0: Option<&Vector3f>,
    n0: &Normal3f,
    tangent_mode: TangentPlaneMode,
    s: Float,
) -> Float {
    debug_assert!(s >= 0.0);
    let Some((r_virt, _)) =
        tentative_virtual_source_displacement(params, n0, nl, r_vec, tangent_mode)
    else {
        return 0.0;
    };

    let p1 = if LENGTH_SAMPLE_W1 == 0.0 {
        0.0
    } else {
        pdf_length_short_limit(params, r_vec, u0, ul, s)
    };
    let p2 = if LENGTH_SAMPLE_W2 == 0.0 {
        0.0
    } else {
        0.5 * (pdf_length_long_limit(params, r_vec, ul, s)
            + pdf_length_long_limit(params, &r_virt, ul, s))
    };
    let p3 = if LENGTH_SAMPLE_W3 == 0.0 {
        0.0
    } else {
        pdf_length_absorption(params, s)
    };
    LENGTH_SAMPLE_W1 * p1 + LENGTH_SAMPLE_W2 * p2 + LENGTH_SAMPLE_W3 * p3
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
