//! Analytic anisotropic-dipole transport kernel for subsurface scattering.
//!
//! Evaluates the radiance transport contribution between an entry and an
//! exit configuration on a translucent boundary, and provides matched
//! importance samplers for the free-path length and the entry direction.
//! Every operation is a pure function over an immutable
//! [`OpticalParameters`] value; queries may run concurrently as long as
//! each thread owns its own random source.

#[macro_use]
extern crate log;

pub mod direction;
pub mod eval;
pub mod fresnel;
pub mod length;
pub mod params;
pub mod virtual_source;

use base::geometry::*;
use base::math::Float;
use base::rng::Sampler;

// Re-export.
pub use eval::DipoleComponents;
pub use params::ShapeParameters;
pub use virtual_source::{TangentPlaneMode, ZvMode};

/// Lower bound on the directional spread 1/|H| of the propagator's
/// exponential-cosine factor; the concentration |H| is clamped to the
/// inverse of this before it enters any exponent or polar sampler.
pub const DIRECTION_MIN_MU: Float = 0.02;

/// Optical description of a scattering medium. Constructed once per medium
/// and passed by reference into every transport query.
#[derive(Copy, Clone, Debug)]
pub struct OpticalParameters {
    /// Scattering coefficient `σs` > 0, the probability of an
    /// out-scattering event per unit distance.
    pub sigma_s: Float,

    /// Absorption coefficient `σa` ≥ 0, the probability density that light
    /// is absorbed per unit distance.
    pub sigma_a: Float,

    /// Mean cosine `μ` ∈ (0, 1] of the phase function.
    pub mu: Float,

    /// Relative index of refraction `η` > 0 (interior over exterior).
    pub eta: Float,
}

impl OpticalParameters {
    /// Create a new `OpticalParameters`.
    ///
    /// * `sigma_s` - Scattering coefficient `σs` > 0.
    /// * `sigma_a` - Absorption coefficient `σa` ≥ 0.
    /// * `mu`      - Mean cosine `μ` ∈ (0, 1].
    /// * `eta`     - Relative index of refraction `η` > 0.
    pub fn new(sigma_s: Float, sigma_a: Float, mu: Float, eta: Float) -> Self {
        debug_assert!(sigma_s > 0.0);
        debug_assert!(sigma_a >= 0.0);
        debug_assert!(mu > 0.0 && mu <= 1.0);
        debug_assert!(eta > 0.0);
        Self { sigma_s, sigma_a, mu, eta }
    }

    /// The scale parameter p = μ·σs/2 that converts path length into the
    /// dimensionless optical depth ps.
    #[inline]
    pub(crate) fn p(&self) -> Float {
        0.5 * self.mu * self.sigma_s
    }

    /// Reduced scattering coefficient σs' = μ·σs.
    #[inline]
    pub(crate) fn reduced_scattering(&self) -> Float {
        self.sigma_s * self.mu
    }

    /// Reduced extinction coefficient σt' = σs' + σa.
    #[inline]
    pub(crate) fn reduced_extinction(&self) -> Float {
        self.reduced_scattering() + self.sigma_a
    }
}

/// Mode selection for a transport query. The selectors are closed
/// enumerations, so an unrecognized mode is unrepresentable rather than a
/// runtime error.
#[derive(Copy, Clone, Debug)]
pub struct KernelSettings {
    /// Reject entry directions that enter through the effective tangent
    /// plane from inside the medium.
    pub reject_internal_incoming: bool,

    /// Evaluate the symmetrized average of the forward and time-reversed
    /// configurations.
    pub reciprocal: bool,

    /// Tangent-plane convention for the effective entry normal.
    pub tangent_mode: TangentPlaneMode,

    /// Extrapolation formula for the virtual source height.
    pub zv_mode: ZvMode,

    /// Use the effective-BRDF form (coincident entry and exit points).
    pub use_effective_brdf: bool,

    /// Which dipole components participate in the evaluation.
    pub components: DipoleComponents,
}

impl Default for KernelSettings {
    fn default() -> Self {
        Self {
            reject_internal_incoming: true,
            reciprocal: false,
            tangent_mode: TangentPlaneMode::FrisvadEtAlWithMeanNormal,
            zv_mode: ZvMode::ClassicDiffusion,
            use_effective_brdf: false,
            components: DipoleComponents::RealAndVirtual,
        }
    }
}

/// One entry/exit configuration on the medium boundary. Directions follow
/// the propagation convention (not the reflected convention of local
/// scattering models) and must be unit length.
#[derive(Copy, Clone, Debug)]
pub struct BoundaryConfiguration {
    /// Displacement from the entry point to the exit point.
    pub r: Vector3f,

    /// Entry surface normal.
    pub n0: Normal3f,

    /// Exit surface normal.
    pub nl: Normal3f,

    /// Unit entry direction (external side).
    pub u0: Vector3f,

    /// Unit exit direction (external side).
    pub ul: Vector3f,
}

impl BoundaryConfiguration {
    /// Returns the time-reversed configuration: entry and exit swap roles,
    /// all directions and the displacement flip.
    pub fn reversed(&self) -> Self {
        Self {
            r: -self.r,
            n0: self.nl,
            nl: self.n0,
            u0: -self.ul,
            ul: -self.u0,
        }
    }

    /// Evaluates the transport amplitude for this configuration at the
    /// given path length.
    ///
    /// * `params`   - Medium parameters.
    /// * `length`   - Path length s ≥ 0.
    /// * `settings` - Mode selection.
    pub fn eval(&self, params: &OpticalParameters, length: Float, settings: &KernelSettings) -> Float {
        eval::eval_dipole(
            params,
            &self.n0,
            &self.u0,
            &self.nl,
            &self.ul,
            &self.r,
            length,
            settings.reject_internal_incoming,
            settings.reciprocal,
            settings.tangent_mode,
            settings.zv_mode,
            settings.use_effective_brdf,
            settings.components,
        )
    }

    /// Draws a free-path length for this configuration. Returns the length
    /// together with its importance weight (reciprocal mixture density), or
    /// `None` when the configuration admits no sample.
    ///
    /// * `params`                - Medium parameters.
    /// * `entry_direction_known` - Condition the sampler on `u0`.
    /// * `settings`              - Mode selection (tangent plane only).
    /// * `sampler`               - Random source.
    pub fn sample_length(
        &self,
        params: &OpticalParameters,
        entry_direction_known: bool,
        settings: &KernelSettings,
        sampler: &mut dyn Sampler,
    ) -> Option<(Float, Float)> {
        let u0 = entry_direction_known.then_some(&self.u0);
        length::sample_length_dipole(
            params,
            &self.ul,
            &self.nl,
            &self.r,
            u0,
            &self.n0,
            settings.tangent_mode,
            sampler,
        )
    }

    /// Re-evaluates the mixture density of a free-path length that was
    /// obtained elsewhere.
    ///
    /// * `params`                - Medium parameters.
    /// * `entry_direction_known` - Condition the density on `u0`.
    /// * `settings`              - Mode selection (tangent plane only).
    /// * `s`                     - The path length.
    pub fn pdf_length(
        &self,
        params: &OpticalParameters,
        entry_direction_known: bool,
        settings: &KernelSettings,
        s: Float,
    ) -> Float {
        let u0 = entry_direction_known.then_some(&self.u0);
        length::pdf_length_dipole(
            params,
            &self.ul,
            &self.nl,
            &self.r,
            u0,
            &self.n0,
            settings.tangent_mode,
            s,
        )
    }

    /// Draws an entry direction for this configuration at the given path
    /// length. Returns the direction with its mixture density, or `None`
    /// when the configuration admits no sample. The stored `u0` is not
    /// consulted.
    ///
    /// * `params`   - Medium parameters.
    /// * `s`        - The path length.
    /// * `settings` - Mode selection.
    /// * `sampler`  - Random source.
    pub fn sample_direction(
        &self,
        params: &OpticalParameters,
        s: Float,
        settings: &KernelSettings,
        sampler: &mut dyn Sampler,
    ) -> Option<(Vector3f, Float)> {
        direction::sample_direction_dipole(
            params,
            &self.n0,
            &self.ul,
            &self.nl,
            &self.r,
            s,
            settings.tangent_mode,
            settings.use_effective_brdf,
            sampler,
        )
    }

    /// Re-evaluates the mixture density of an entry direction obtained
    /// elsewhere.
    ///
    /// * `params`   - Medium parameters.
    /// * `u0`       - The entry direction.
    /// * `s`        - The path length.
    /// * `settings` - Mode selection.
    pub fn pdf_direction(
        &self,
        params: &OpticalParameters,
        u0: &Vector3f,
        s: Float,
        settings: &KernelSettings,
    ) -> Float {
        direction::pdf_direction_dipole(
            params,
            u0,
            &self.n0,
            &self.ul,
            &self.nl,
            &self.r,
            s,
            settings.tangent_mode,
            settings.use_effective_brdf,
        )
    }
}
