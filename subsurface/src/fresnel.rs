//! Boundary refraction and Fresnel quantities.

use base::geometry::*;
use base::math::*;

/// Unpolarized Fresnel reflectance of a dielectric boundary.
///
/// Returns the reflectance together with the cosine of the transmitted
/// angle; the latter carries the sign convention of the transmitted side
/// (negative when the incident direction is on the outside). On total
/// internal reflection the reflectance is 1 and the cosine 0.
///
/// * `cos_theta_i` - Signed cosine between incident direction and normal.
/// * `eta`         - Relative index of refraction (interior / exterior).
pub fn fresnel_dielectric(cos_theta_i: Float, eta: Float) -> (Float, Float) {
    if eta == 1.0 {
        return (0.0, -cos_theta_i);
    }

    // Snell's law: squared sine of the transmitted angle.
    let scale = if cos_theta_i > 0.0 { 1.0 / eta } else { eta };
    let cos_theta_t_sqr = 1.0 - (1.0 - cos_theta_i * cos_theta_i) * (scale * scale);

    // Total internal reflection.
    if cos_theta_t_sqr <= 0.0 {
        return (1.0, 0.0);
    }

    let abs_cos_i = abs(cos_theta_i);
    let abs_cos_t = cos_theta_t_sqr.sqrt();

    let rs = (abs_cos_i - eta * abs_cos_t) / (abs_cos_i + eta * abs_cos_t);
    let rp = (eta * abs_cos_i - abs_cos_t) / (eta * abs_cos_i + abs_cos_t);

    let cos_theta_t = if cos_theta_i > 0.0 { -abs_cos_t } else { abs_cos_t };

    (0.5 * (rs * rs + rp * rp), cos_theta_t)
}

/// Refracts `wi` across the boundary with normal `n`, keeping the result on
/// the opposite side of the surface from `wi`.
///
/// Returns the transmitted direction together with the Fresnel reflectance,
/// or `None` on total internal reflection. At η = 1 the direction passes
/// through unchanged (up to sign convention) with reflectance 0.
///
/// * `wi`  - Unit direction pointing away from the surface.
/// * `n`   - Boundary normal.
/// * `eta` - Relative index of refraction (interior / exterior).
pub fn refract(wi: &Vector3f, n: &Normal3f, eta: Float) -> Option<(Vector3f, Float)> {
    let cos_theta_i = wi.dot(n);
    let (f, cos_theta_t) = fresnel_dielectric(cos_theta_i, eta);

    if f == 1.0 {
        return None;
    }

    let eta_dir = if cos_theta_t < 0.0 { 1.0 / eta } else { eta };
    let wt = *n * (eta_dir * cos_theta_i + cos_theta_t) - *wi * eta_dir;
    Some((wt, f))
}

/// Evaluate first moment of the Fresnel reflectance function.
///
/// * `eta` - Index of refraction of the scattering medium.
pub fn fresnel_moment_1(eta: Float) -> Float {
    let eta2 = eta * eta;
    let eta3 = eta2 * eta;
    let eta4 = eta3 * eta;
    let eta5 = eta4 * eta;
    if eta < 1.0 {
        0.45966 - 1.73965 * eta + 3.37668 * eta2 - 3.904945 * eta3 + 2.49277 * eta4 - 0.68441 * eta5
    } else {
        -4.61686 + 11.1136 * eta - 10.4646 * eta2 + 5.11455 * eta3 - 1.27198 * eta4 + 0.12746 * eta5
    }
}

/// Evaluate second moment of the Fresnel reflectance function.
///
/// * `eta` - Index of refraction of the scattering medium.
pub fn fresnel_moment_2(eta: Float) -> Float {
    let eta2 = eta * eta;
    let eta3 = eta2 * eta;
    let eta4 = eta3 * eta;
    let eta5 = eta4 * eta;
    if eta < 1.0 {
        0.27614 - 0.87350 * eta + 1.12077 * eta2 - 0.65095 * eta3 + 0.07883 * eta4 + 0.04860 * eta5
    } else {
        let r_eta = 1.0 / eta;
        let r_eta2 = r_eta * r_eta;
        let r_eta3 = r_eta2 * r_eta;
        -547.033 + 45.3087 * r_eta3 - 218.725 * r_eta2 + 458.843 * r_eta + 404.557 * eta
            - 189.519 * eta2
            + 54.9327 * eta3
            - 9.00603 * eta4
            + 0.63942 * eta5
    }
}

/// Diffuse Fresnel reflectance: the incidence-averaged reflectance of a
/// dielectric boundary under a uniform radiance field.
///
/// Uses the Egan–Hilgeman fit below η = 1 and the d'Eon–Irving fit above,
/// each where it is the more accurate of the two.
///
/// * `eta` - Relative index of refraction.
pub fn fresnel_diffuse_reflectance(eta: Float) -> Float {
    if eta < 1.0 {
        -1.4399 * (eta * eta) + 0.7099 * eta + 0.6681 + 0.0636 / eta
    } else {
        let inv_eta = 1.0 / eta;
        let inv_eta2 = inv_eta * inv_eta;
        let inv_eta3 = inv_eta2 * inv_eta;
        let inv_eta4 = inv_eta3 * inv_eta;
        let inv_eta5 = inv_eta4 * inv_eta;
        0.919317 - 3.4793 * inv_eta + 6.75335 * inv_eta2 - 7.80989 * inv_eta3
            + 4.98554 * inv_eta4
            - 1.36881 * inv_eta5
    }
}

/// The boundary constant A(η) of d'Eon and Irving, built from the first two
/// Fresnel moments.
///
/// * `eta` - Relative index of refraction.
pub fn deon_a(eta: Float) -> Float {
    (1.0 + 3.0 * fresnel_moment_2(eta)) / (1.0 - 2.0 * fresnel_moment_1(eta))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_matched_boundary_is_transparent() {
        let n = Vector3f::new(0.0, 0.0, 1.0);
        let wi = Vector3f::new(0.3, -0.2, 0.933).normalize();
        let (wt, f) = refract(&wi, &n, 1.0).unwrap();
        assert_eq!(f, 0.0);
        assert!((wt + wi).length() < 1e-12);
    }

    #[test]
    fn refraction_bends_toward_the_denser_side() {
        let n = Vector3f::new(0.0, 0.0, 1.0);
        let wi = Vector3f::new(0.6, 0.0, 0.8); // outside, 36.87° off normal
        let (wt, f) = refract(&wi, &n, 1.5).unwrap();
        assert!((wt.length() - 1.0).abs() < 1e-12);
        // transmitted continues into the medium
        assert!(wt.z < 0.0);
        // Snell: sinθt = sinθi/η
        assert!((wt.x.hypot(wt.y) - 0.6 / 1.5).abs() < 1e-12);
        assert!(f > 0.0 && f < 1.0);
    }

    #[test]
    fn total_internal_reflection_is_reported() {
        let n = Vector3f::new(0.0, 0.0, 1.0);
        // leaving a denser medium at a grazing angle: relative η < 1 and
        // the incident direction on the interior side
        let wi = Vector3f::new(0.9, 0.0, -0.435_889_894_354_067_4);
        assert!(refract(&wi, &n, 1.5).is_none());
    }

    #[test]
    fn normal_incidence_reflectance() {
        let (f, _) = fresnel_dielectric(1.0, 1.5);
        // ((η−1)/(η+1))² = 0.04
        assert!((f - 0.04).abs() < 1e-12);
    }

    #[test]
    fn fresnel_reflectance_is_reciprocal() {
        // crossing the boundary forward or backward reflects equally
        for &eta in &[1.2, 1.5, 2.0] {
            let cos_i: Float = 0.8;
            let (f_in, cos_t) = fresnel_dielectric(cos_i, eta);
            let (f_out, _) = fresnel_dielectric(cos_t, eta);
            assert!((f_in - f_out).abs() < 1e-12);
        }
    }

    #[test]
    fn diffuse_reflectance_matches_published_values() {
        // classical dipole papers quote Fdr(1/1.3) regimes in [0, 1)
        let fdr = fresnel_diffuse_reflectance(1.0 / 1.3);
        assert!(fdr > 0.0 && fdr < 1.0);
        // continuity across η = 1 within fit error
        let lo = fresnel_diffuse_reflectance(0.9999);
        let hi = fresnel_diffuse_reflectance(1.0001);
        assert!((lo - hi).abs() < 0.02);
    }

    #[test]
    fn deon_a_grows_with_index_contrast() {
        let a_low = deon_a(1.0);
        let a_high = deon_a(1.5);
        assert!(a_high > a_low);
        assert!(a_low > 0.0);
    }
}
