//! Transport kernel evaluation.

use crate::fresnel::refract;
use crate::params::{absorption_and_normalization_constant, compute_shape_parameters};
use crate::virtual_source::{build_virtual_source, TangentPlaneMode, ZvMode};
use crate::{OpticalParameters, DIRECTION_MIN_MU};
use base::geometry::*;
use base::math::*;

/// Which dipole components participate in an evaluation. The single-source
/// modes exist for diagnostics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DipoleComponents {
    /// Full dipole: real minus virtual source.
    RealAndVirtual,

    /// Real source only.
    RealOnly,

    /// Virtual source only (positive sign).
    VirtualOnly,
}

/// Exponent terms larger than this trigger the cancellation check before
/// they are combined.
const CANCELLATION_TERM_LIMIT: f64 = 1e3;

/// Relative magnitude below which a combined exponent is considered to have
/// lost all of its significant digits.
const CANCELLATION_EPSILON: f64 = 1e-6;

/// Flags catastrophic cancellation between two exponent terms. Pure
/// observability: logs a warning and never changes any result.
pub(crate) fn cancellation_check(t1: f64, t2: f64) {
    let sum = t1 + t2;
    let magnitude = max(t1.abs(), t2.abs());
    if sum.abs() < CANCELLATION_EPSILON * magnitude {
        warn!(
            "catastrophic cancellation in propagator exponent: {:e} + {:e} = {:e}",
            t1, t2, sum
        );
    }
}

/// Evaluates the transport amplitude between an entry and an exit
/// configuration with external (unrefracted) directions.
///
/// Returns 0 for rejected geometry (exit direction not outward, entry
/// direction not inward, failed refraction, degenerate virtual source).
/// With `reciprocal` set, the result is the transmittance-weighted average
/// of the forward and time-reversed configurations, which is exactly
/// symmetric under configuration reversal for any η.
///
/// * `params`                   - Medium parameters.
/// * `n0`                       - Entry surface normal.
/// * `u0_external`              - External entry direction (propagation).
/// * `nl`                       - Exit surface normal.
/// * `ul_external`              - External exit direction (propagation).
/// * `r`                        - Displacement from entry to exit point.
/// * `length`                   - Path length s.
/// * `reject_internal_incoming` - Reject entries through the tangent plane.
/// * `reciprocal`               - Symmetrize over configuration reversal.
/// * `tangent_mode`             - Tangent-plane convention.
/// * `zv_mode`                  - Virtual-source-height model.
/// * `use_effective_brdf`       - Coincident entry/exit (plane-source) form.
/// * `components`               - Dipole components to evaluate.
#[allow(clippy::too_many_arguments)]
pub fn eval_dipole(
    params: &OpticalParameters,
    n0: &Normal3f,
    u0_external: &Vector3f,
    nl: &Normal3f,
    ul_external: &Vector3f,
    r: &Vector3f,
    length: Float,
    reject_internal_incoming: bool,
    reciprocal: bool,
    tangent_mode: TangentPlaneMode,
    zv_mode: ZvMode,
    use_effective_brdf: bool,
    components: DipoleComponents,
) -> Float {
    // If reciprocal is requested, nl should be finite and ul_external
    // should point along nl.
    debug_assert!(!reciprocal || nl.is_finite());
    debug_assert!(!reciprocal || ul_external.dot(nl) >= -EPSILON);
    if nl.is_finite() && ul_external.dot(nl) <= 0.0 {
        // clamp to protect against roundoff errors
        return 0.0;
    }

    // Reject incoming directions that come from within the actual geometry,
    // i.e. w.r.t. the true local normal instead of the modified tangent
    // plane normal.
    if u0_external.dot(n0) >= 0.0 {
        return 0.0;
    }

    // Handle the η ≠ 1 case by refracting the external directions to
    // internal ones. Directions keep pointing along the propagation of
    // light, unlike the reflected convention of local scattering models.
    let entry = refract(&-*u0_external, n0, params.eta);
    let exit = refract(ul_external, nl, params.eta);
    let (u0, ul, fresnel_transmittance) = match (entry, exit) {
        (Some((u0, f0)), Some((ul_refr, fl))) => (u0, -ul_refr, (1.0 - f0) * (1.0 - fl)),
        _ => {
            if params.eta > 1.0 {
                warn!(
                    "could not refract, which is weird because we have a higher ior (eta={})",
                    params.eta
                );
            }
            return 0.0;
        }
    };

    let Some(vs) = build_virtual_source(
        params,
        n0,
        &u0,
        nl,
        r,
        reject_internal_incoming,
        tangent_mode,
        zv_mode,
    ) else {
        return 0.0;
    };

    // Effective BRDF?
    if use_effective_brdf {
        debug_assert!((*n0 - *nl).length() < EPSILON); // same point -> same normal
        let rv_z = vs.r_virt.dot(nl);
        #[cfg(debug_assertions)]
        {
            let l_rv = vs.r_virt.length();
            debug_assert!(rv_z <= 0.0); // points into the medium
            // the only displacement should be in the normal direction:
            debug_assert!(l_rv == 0.0 || abs((l_rv - abs(rv_z)) / l_rv) < SHADOW_EPSILON);
        }

        return fresnel_transmittance
            * (eval_plane_source(params, &u0, &ul, nl, 0.0, length)
                - eval_plane_source(params, &vs.u0_virt, &ul, nl, rv_z, length));
    }

    // Full BSSRDF
    let real = match components {
        DipoleComponents::RealAndVirtual | DipoleComponents::RealOnly => {
            eval_monopole(params, &u0, &ul, r, length)
        }
        DipoleComponents::VirtualOnly => 0.0,
    };
    let virt = match components {
        DipoleComponents::RealAndVirtual | DipoleComponents::VirtualOnly => {
            eval_monopole(params, &vs.u0_virt, &ul, &vs.r_virt, length)
        }
        DipoleComponents::RealOnly => 0.0,
    };
    let transport = match components {
        DipoleComponents::RealAndVirtual => real - virt,
        DipoleComponents::RealOnly => real,
        DipoleComponents::VirtualOnly => virt, // note: positive sign
    };

    if reciprocal {
        let transport_reversed = eval_dipole(
            params,
            nl,
            &-*ul_external,
            n0,
            &-*u0_external,
            &-*r,
            length,
            reject_internal_incoming,
            false,
            tangent_mode,
            zv_mode,
            use_effective_brdf,
            components,
        );
        0.5 * (transport * fresnel_transmittance + transport_reversed)
    } else {
        transport * fresnel_transmittance
    }
}

/// Evaluates the unbounded-medium propagator between internal directions.
///
/// The concentration |H| of the directional factor is clamped to
/// 1/`DIRECTION_MIN_MU`, consistent with the regularization used by the
/// direction samplers.
///
/// * `params` - Medium parameters.
/// * `u0`     - Internal entry direction (unit).
/// * `ul`     - Internal exit direction (unit).
/// * `r`      - Displacement from source to exit point.
/// * `length` - Path length s.
pub fn eval_monopole(
    params: &OpticalParameters,
    u0: &Vector3f,
    ul: &Vector3f,
    r: &Vector3f,
    length: Float,
) -> Float {
    debug_assert!(abs(u0.length() - 1.0) < EPSILON);
    debug_assert!(abs(ul.length() - 1.0) < EPSILON);

    let sp = compute_shape_parameters(params, length);

    // We regularized the sampling of u0, so we should be consistent here.
    let h = sp.e * *r - sp.d * *ul;
    let l_h = h.length();
    let h_norm = h / l_h;
    let l_h_reg = min(l_h, 1.0 / DIRECTION_MIN_MU);
    let cos_theta = clamp(u0.dot(&h_norm), -1.0, 1.0);

    let n = absorption_and_normalization_constant(params, length);
    let e_r_dot_ul = sp.e * r.dot(ul);
    let f_r_sqr = sp.f * r.length_squared();
    let g = n * (-sp.c + e_r_dot_ul + l_h_reg * cos_theta - f_r_sqr).exp();
    // Non-regularized:
    // g = n * exp(-c - d*dot(u0,ul) + e*(dot(r,u0) + dot(r,ul)) - f*r²)

    // We only care about cancellations if the terms are large; otherwise
    // exp(epsilon) ~= 1 anyway.
    if abs(e_r_dot_ul) > CANCELLATION_TERM_LIMIT {
        cancellation_check(-sp.c, e_r_dot_ul);
    }
    if abs(l_h_reg * cos_theta) > CANCELLATION_TERM_LIMIT {
        cancellation_check(-sp.c + e_r_dot_ul, l_h_reg * cos_theta);
    }
    if abs(f_r_sqr) > CANCELLATION_TERM_LIMIT {
        cancellation_check(-sp.c + e_r_dot_ul + l_h_reg * cos_theta, -f_r_sqr);
    }

    if !g.is_finite() || g < 0.0 {
        #[cfg(debug_assertions)]
        warn!(
            "invalid G in eval_monopole(): {:e}; C {:e} D {:e} E {:e} F {:e} Rsq {:e} u0dotuL {:e}",
            g,
            sp.c,
            sp.d,
            sp.e,
            sp.f,
            r.length_squared(),
            u0.dot(ul),
        );
        return 0.0;
    }
    g
}

/// Evaluates the propagator for a source spread uniformly over an infinite
/// plane at signed offset `rz` from the boundary. Used by the
/// effective-BRDF path.
///
/// * `params` - Medium parameters.
/// * `u0`     - Internal entry direction (unit).
/// * `ul`     - Internal exit direction (unit).
/// * `n`      - Plane normal.
/// * `rz`     - Signed source plane offset along `n`.
/// * `length` - Path length s.
pub fn eval_plane_source(
    params: &OpticalParameters,
    u0: &Vector3f,
    ul: &Vector3f,
    n: &Normal3f,
    rz: Float,
    length: Float,
) -> Float {
    debug_assert!(abs(u0.length() - 1.0) < EPSILON);
    debug_assert!(abs(ul.length() - 1.0) < EPSILON);

    let sp = compute_shape_parameters(params, length);

    let u0z = u0.dot(n);
    let ulz = ul.dot(n);
    let u0_dot_ul = u0.dot(ul);

    let result = absorption_and_normalization_constant(params, length) * PI / sp.f
        * (sp.e * sp.e / 4.0 / sp.f * (2.0 + 2.0 * u0_dot_ul - square(u0z + ulz))
            - sp.d * u0_dot_ul
            - sp.c
            + sp.e * rz * (u0z + ulz)
            - sp.f * rz * rz)
            .exp();

    if !result.is_finite() {
        warn!("non-finite plane source result {:e}", result);
        return 0.0;
    }
    result
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelSettings;
    use float_cmp::assert_approx_eq;

    fn params() -> OpticalParameters {
        OpticalParameters::new(1.0, 0.0, 0.5, 1.0)
    }

    fn straight_through_config() -> crate::BoundaryConfiguration {
        // R = 0, entry straight down, exit straight up
        let n = Vector3f::new(0.0, 0.0, 1.0);
        crate::BoundaryConfiguration {
            r: Vector3f::ZERO,
            n0: n,
            nl: n,
            u0: -n,
            ul: n,
        }
    }

    #[test]
    fn rejects_outgoing_entry_direction() {
        let p = params();
        let mut cfg = straight_through_config();
        cfg.u0 = Vector3f::new(0.0, 0.0, 1.0); // not inward
        assert_eq!(cfg.eval(&p, 1.0, &KernelSettings::default()), 0.0);
    }

    #[test]
    fn rejects_inward_exit_direction() {
        let p = params();
        let mut cfg = straight_through_config();
        cfg.ul = Vector3f::new(0.0, 0.0, -1.0);
        assert_eq!(cfg.eval(&p, 1.0, &KernelSettings::default()), 0.0);
    }

    #[test]
    fn rejects_total_internal_reflection() {
        // relative index below 1 and a grazing entry: refraction fails
        let p = OpticalParameters::new(1.0, 0.0, 0.5, 0.5);
        let mut cfg = straight_through_config();
        cfg.u0 = Vector3f::new(0.98, 0.0, -0.198_997_487_421_324).normalize();
        assert_eq!(cfg.eval(&p, 1.0, &KernelSettings::default()), 0.0);
    }

    #[test]
    fn monopole_is_positive_for_plain_configurations() {
        let p = params();
        let u0 = Vector3f::new(0.0, 0.0, -1.0);
        let ul = Vector3f::new(0.0, 0.0, 1.0);
        let r = Vector3f::new(0.5, 0.0, 0.0);
        for s in [0.1, 1.0, 10.0] {
            let g = eval_monopole(&p, &u0, &ul, &r, s);
            assert!(g.is_finite() && g >= 0.0, "s={s}: {g}");
        }
    }

    #[test]
    fn effective_brdf_equals_plane_source_difference() {
        let p = params();
        let cfg = straight_through_config();
        let mut settings = KernelSettings {
            use_effective_brdf: true,
            tangent_mode: TangentPlaneMode::FrisvadEtAl,
            ..KernelSettings::default()
        };
        settings.reject_internal_incoming = false;

        let s = 1.7;
        let got = cfg.eval(&p, s, &settings);

        // η = 1: no refraction, unit transmittance; the virtual offset is
        // the classic-diffusion extrapolation height
        let vs = build_virtual_source(
            &p,
            &cfg.n0,
            &cfg.u0,
            &cfg.nl,
            &cfg.r,
            false,
            settings.tangent_mode,
            settings.zv_mode,
        )
        .unwrap();
        let rv_z = vs.r_virt.dot(&cfg.nl);
        let want = eval_plane_source(&p, &cfg.u0, &cfg.ul, &cfg.nl, 0.0, s)
            - eval_plane_source(&p, &vs.u0_virt, &cfg.ul, &cfg.nl, rv_z, s);
        assert_approx_eq!(f64, got, want, epsilon = 1e-9);
    }

    #[test]
    fn reciprocal_evaluation_is_exactly_symmetric() {
        for eta in [1.0, 1.33, 1.6] {
            let p = OpticalParameters::new(2.0, 0.3, 0.6, eta);
            let n0 = Vector3f::new(0.0, 0.0, 1.0);
            let nl = Vector3f::new(0.2, 0.0, 1.0).normalize();
            let cfg = crate::BoundaryConfiguration {
                r: Vector3f::new(0.4, 0.1, 0.05),
                n0,
                nl,
                u0: Vector3f::new(0.3, -0.2, -0.8).normalize(),
                ul: (nl + Vector3f::new(0.1, 0.2, 0.0)).normalize(),
            };
            let settings = KernelSettings {
                reciprocal: true,
                ..KernelSettings::default()
            };
            for s in [0.3, 2.0, 12.0] {
                let fwd = cfg.eval(&p, s, &settings);
                let rev = cfg.reversed().eval(&p, s, &settings);
                assert_eq!(fwd, rev, "eta={eta} s={s}");
            }
        }
    }
}
