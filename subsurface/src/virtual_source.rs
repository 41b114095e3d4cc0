//! Virtual source construction for the dipole boundary condition.

use crate::fresnel::{deon_a, fresnel_diffuse_reflectance};
use crate::params::compute_shape_parameters;
use crate::OpticalParameters;
use base::geometry::*;
use base::math::*;

/// Convention for the effective tangent plane at the entry point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TangentPlaneMode {
    /// Modified tangent plane of the directional dipole model of Frisvad
    /// et al., built from the displacement and the entry normal.
    FrisvadEtAl,

    /// Like `FrisvadEtAl`, but built on the summed entry and exit normals;
    /// gives reciprocity as a bonus.
    FrisvadEtAlWithMeanNormal,

    /// Use the entry normal unmodified.
    UnmodifiedIncoming,

    /// Use the exit normal unmodified.
    UnmodifiedOutgoing,
}

/// Extrapolation formula for the height of the mirrored source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ZvMode {
    /// Frisvad et al.: diffuse mean free path scaled by the reduced albedo.
    FrisvadEtAl,

    /// The "better dipole" diffusion coefficient.
    BetterDipole,

    /// Classical diffusion with the diffuse Fresnel reflectance. The only
    /// mode independent of the entry direction.
    ClassicDiffusion,
}

/// A mirrored source satisfying the diffusion boundary condition. Derived
/// per query; holds no identity beyond the call that produced it.
#[derive(Copy, Clone, Debug)]
pub struct VirtualSource {
    /// Mirrored entry direction.
    pub u0_virt: Vector3f,

    /// Displacement from the virtual source to the exit point.
    pub r_virt: Vector3f,

    /// The effective normal the mirror was built on.
    pub n0_effective: Normal3f,
}

/// Chooses the effective entry normal for the requested tangent-plane
/// convention. `None` marks the degenerate geometry (zero cross product or
/// non-finite result).
fn effective_normal(
    n0: &Normal3f,
    nl: &Normal3f,
    r: &Vector3f,
    tangent_mode: TangentPlaneMode,
) -> Option<Normal3f> {
    let n0_effective = match tangent_mode {
        TangentPlaneMode::FrisvadEtAl => {
            if r.length() == 0.0 {
                *n0
            } else {
                if n0.cross(r).length() == 0.0 {
                    return None;
                }
                let n = r.normalize().cross(&n0.cross(r).normalize());
                debug_assert!(n.dot(n0) > -EPSILON);
                n
            }
        }
        TangentPlaneMode::FrisvadEtAlWithMeanNormal => {
            let sum_normal = *n0 + *nl;
            if r.length() == 0.0 {
                *n0
            } else {
                if sum_normal.cross(r).length() == 0.0 {
                    return None;
                }
                r.normalize().cross(&sum_normal.cross(r).normalize())
            }
        }
        TangentPlaneMode::UnmodifiedIncoming => *n0,
        TangentPlaneMode::UnmodifiedOutgoing => *nl,
    };

    if !n0_effective.is_finite() {
        warn!("non-finite effective entry normal: {:?}", n0_effective);
        return None;
    }
    debug_assert!(abs(n0_effective.length() - 1.0) < EPSILON);
    Some(n0_effective)
}

/// Extrapolation distance zv of the mirrored source. `None` when the
/// reduced coefficients degenerate to zero.
fn extrapolation_distance(params: &OpticalParameters, zv_mode: ZvMode) -> Option<Float> {
    let sigma_sp = params.reduced_scattering();
    let sigma_tp = params.reduced_extinction();

    let zv = match zv_mode {
        ZvMode::FrisvadEtAl => {
            if sigma_tp == 0.0 || sigma_sp == 0.0 {
                return None;
            }
            let d = 1.0 / (3.0 * sigma_tp);
            let alpha_p = sigma_sp / sigma_tp;
            let d_e = 2.131 * d / alpha_p.sqrt();
            let a = deon_a(params.eta);
            2.0 * a * d_e
        }
        ZvMode::BetterDipole => {
            if sigma_tp == 0.0 {
                return None;
            }
            let d = (2.0 * params.sigma_a + sigma_sp) / (3.0 * square(sigma_tp));
            let a = deon_a(params.eta);
            4.0 * a * d
        }
        ZvMode::ClassicDiffusion => {
            if sigma_tp == 0.0 {
                return None;
            }
            let fdr = fresnel_diffuse_reflectance(1.0 / params.eta);
            let a = (1.0 + fdr) / (1.0 - fdr);
            let d = 1.0 / (3.0 * sigma_tp);
            4.0 * a * d
        }
    };
    Some(zv)
}

/// Builds the mirrored source for a dipole query.
///
/// Returns `None` on degenerate tangent geometry, degenerate reduced
/// coefficients, or (when `reject_internal_incoming` is set) an entry
/// direction that exits through the effective tangent plane.
///
/// Note that without `reject_internal_incoming` the virtual source may
/// point into the half space and cross the real source beam.
///
/// * `params`                   - Medium parameters.
/// * `n0`                       - Entry surface normal.
/// * `u0`                       - Internal entry direction.
/// * `nl`                       - Exit surface normal.
/// * `r`                        - Displacement from entry to exit point.
/// * `reject_internal_incoming` - Reject entry directions from inside.
/// * `tangent_mode`             - Tangent-plane convention.
/// * `zv_mode`                  - Virtual-source-height model.
#[allow(clippy::too_many_arguments)]
pub fn build_virtual_source(
    params: &OpticalParameters,
    n0: &Normal3f,
    u0: &Vector3f,
    nl: &Normal3f,
    r: &Vector3f,
    reject_internal_incoming: bool,
    tangent_mode: TangentPlaneMode,
    zv_mode: ZvMode,
) -> Option<VirtualSource> {
    let n0_effective = effective_normal(n0, nl, r, tangent_mode)?;

    if reject_internal_incoming && n0_effective.dot(u0) > 0.0 {
        return None;
    }

    let zv = extrapolation_distance(params, zv_mode)?;

    let r_virt = *r - zv * n0_effective;
    let u0_virt = u0.mirror(&n0_effective);
    Some(VirtualSource {
        u0_virt,
        r_virt,
        n0_effective,
    })
}

/// Convenience form usable before the entry direction is known: forces the
/// classic-diffusion height (the only model independent of `u0`) and never
/// rejects. Returns the virtual displacement and the effective normal.
///
/// * `params`       - Medium parameters.
/// * `n0`           - Entry surface normal.
/// * `nl`           - Exit surface normal.
/// * `r`            - Displacement from entry to exit point.
/// * `tangent_mode` - Tangent-plane convention.
pub fn tentative_virtual_source_displacement(
    params: &OpticalParameters,
    n0: &Normal3f,
    nl: &Normal3f,
    r: &Vector3f,
    tangent_mode: TangentPlaneMode,
) -> Option<(Vector3f, Normal3f)> {
    let n0_effective = effective_normal(n0, nl, r, tangent_mode)?;
    let zv = extrapolation_distance(params, ZvMode::ClassicDiffusion)?;
    let r_virt = *r - zv * n0_effective;
    debug_assert!(r_virt.is_finite());
    Some((r_virt, n0_effective))
}

/// Relative weight of the real source against the virtual one when both
/// can drive a sampling strategy: ratio/(ratio + 1) on the propagator's
/// amplitude ratio at the two displacements, clamped to 1 when the ratio
/// overflows.
///
/// * `params` - Medium parameters.
/// * `ul`     - Internal exit direction.
/// * `r`      - Real displacement.
/// * `r_virt` - Virtual displacement.
/// * `s`      - Path length.
pub fn real_source_weight(
    params: &OpticalParameters,
    ul: &Vector3f,
    r: &Vector3f,
    r_virt: &Vector3f,
    s: Float,
) -> Float {
    let sp = compute_shape_parameters(params, s);
    let ratio = (sp.e * (*r - *r_virt).dot(ul)
        - sp.f * (r.length_squared() - r_virt.length_squared()))
    .exp();
    let weight = if (ratio + 1.0).is_infinite() {
        1.0
    } else {
        ratio / (ratio + 1.0)
    };
    debug_assert!((0.0..=1.0).contains(&weight));
    weight
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> OpticalParameters {
        OpticalParameters::new(1.0, 0.1, 0.5, 1.3)
    }

    #[test]
    fn frisvad_normal_is_unit_and_spans_displacement_plane() {
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let nl = Vector3f::new(0.0, 0.1, 1.0).normalize();
        let r = Vector3f::new(1.0, 0.3, -0.1);
        for mode in [
            TangentPlaneMode::FrisvadEtAl,
            TangentPlaneMode::FrisvadEtAlWithMeanNormal,
        ] {
            let n = effective_normal(&n0, &nl, &r, mode).unwrap();
            assert!((n.length() - 1.0).abs() < EPSILON);
            // the effective normal is orthogonal to the displacement
            assert!(n.dot(&r).abs() < EPSILON * r.length());
        }
    }

    #[test]
    fn zero_displacement_falls_back_to_entry_normal() {
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let nl = Vector3f::new(1.0, 0.0, 0.0);
        let n = effective_normal(&n0, &nl, &Vector3f::ZERO, TangentPlaneMode::FrisvadEtAl).unwrap();
        assert_eq!(n, n0);
    }

    #[test]
    fn colinear_displacement_is_degenerate() {
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let r = Vector3f::new(0.0, 0.0, 2.0); // parallel to n0
        assert!(effective_normal(&n0, &n0, &r, TangentPlaneMode::FrisvadEtAl).is_none());
    }

    #[test]
    fn unmodified_modes_pass_normals_through() {
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let nl = Vector3f::new(0.0, 1.0, 0.0);
        let r = Vector3f::new(1.0, 2.0, 3.0);
        assert_eq!(
            effective_normal(&n0, &nl, &r, TangentPlaneMode::UnmodifiedIncoming).unwrap(),
            n0
        );
        assert_eq!(
            effective_normal(&n0, &nl, &r, TangentPlaneMode::UnmodifiedOutgoing).unwrap(),
            nl
        );
    }

    #[test]
    fn all_height_models_are_positive() {
        for mode in [ZvMode::FrisvadEtAl, ZvMode::BetterDipole, ZvMode::ClassicDiffusion] {
            let zv = extrapolation_distance(&params(), mode).unwrap();
            assert!(zv > 0.0, "{mode:?}: {zv}");
        }
    }

    #[test]
    fn mirror_construction_is_consistent() {
        let p = params();
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let u0 = Vector3f::new(0.3, 0.1, -0.948_683_298_050_513_7);
        let r = Vector3f::new(0.5, 0.2, 0.0);
        let vs = build_virtual_source(
            &p,
            &n0,
            &u0,
            &n0,
            &r,
            true,
            TangentPlaneMode::FrisvadEtAl,
            ZvMode::ClassicDiffusion,
        )
        .unwrap();
        // the mirrored direction reflects back to the original
        assert!((vs.u0_virt.mirror(&vs.n0_effective) - u0).length() < 1e-12);
        // displacement moved against the effective normal
        let zv = extrapolation_distance(&p, ZvMode::ClassicDiffusion).unwrap();
        assert!((vs.r_virt - (r - zv * vs.n0_effective)).length() < 1e-12);
    }

    #[test]
    fn internal_incoming_direction_is_rejected() {
        let p = params();
        let n0 = Vector3f::new(0.0, 0.0, 1.0);
        let outgoing = Vector3f::new(0.0, 0.0, 1.0); // leaves through the plane
        let r = Vector3f::ZERO;
        assert!(build_virtual_source(
            &p,
            &n0,
            &outgoing,
            &n0,
            &r,
            true,
            TangentPlaneMode::UnmodifiedIncoming,
            ZvMode::ClassicDiffusion,
        )
        .is_none());
    }

    #[test]
    fn real_source_weight_is_a_probability() {
        let p = params();
        let ul = Vector3f::new(0.0, 0.0, 1.0);
        let r = Vector3f::new(0.4, 0.0, 0.0);
        let (r_virt, _) = tentative_virtual_source_displacement(
            &p,
            &Vector3f::new(0.0, 0.0, 1.0),
            &Vector3f::new(0.0, 0.0, 1.0),
            &r,
            TangentPlaneMode::FrisvadEtAl,
        )
        .unwrap();
        for s in [0.05, 0.5, 5.0, 50.0] {
            let w = real_source_weight(&p, &ul, &r, &r_virt, s);
            assert!((0.0..=1.0).contains(&w));
        }
    }
}
