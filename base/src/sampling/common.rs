//! Common sampling functions.

use crate::geometry::*;
use crate::math::*;

/// Uniformly sample a direction on the hemisphere about `(0, 0, 1)`.
///
/// * `u` - The random sample point.
pub fn uniform_sample_hemisphere(u: (Float, Float)) -> Vector3f {
    let z = u.0;
    let r = max(0.0, 1.0 - z * z).sqrt();
    let phi = TWO_PI * u.1;
    Vector3f::new(r * phi.cos(), r * phi.sin(), z)
}

/// Returns the PDF for uniformly sampling a direction from a hemisphere.
#[inline]
pub fn uniform_hemisphere_pdf() -> Float {
    INV_TWO_PI
}

/// Sample a point on a unit disk by mapping from a unit square to the unit
/// circle. The concentric mapping takes points in [-1, 1]^2 to unit disk by
/// uniformly mapping concentric squares to concentric circles.
///
/// * `u` - The random sample point.
pub fn concentric_sample_disk(u: (Float, Float)) -> (Float, Float) {
    // Map uniform random numbers to [-1,1]^2.
    let ox = 2.0 * u.0 - 1.0;
    let oy = 2.0 * u.1 - 1.0;

    // Handle degeneracy at the origin.
    if ox == 0.0 && oy == 0.0 {
        return (0.0, 0.0);
    }

    // Apply concentric mapping to point.
    let (r, theta) = if abs(ox) > abs(oy) {
        (ox, PI * 0.25 * (oy / ox))
    } else {
        (oy, PI_OVER_TWO - PI * 0.25 * (ox / oy))
    };

    (r * theta.cos(), r * theta.sin())
}

/// Sample a direction on the hemisphere about `(0, 0, 1)` using
/// cosine-weighted sampling.
///
/// * `u` - The random sample point.
#[inline]
pub fn cosine_sample_hemisphere(u: (Float, Float)) -> Vector3f {
    let (dx, dy) = concentric_sample_disk(u);
    let z = max(0.0, 1.0 - dx * dx - dy * dy).sqrt();
    Vector3f::new(dx, dy, z)
}

/// Returns the PDF for cosine-weighted sampling a direction from a
/// hemisphere.
///
/// * `cos_theta` - Cosine between the direction and the hemisphere axis.
#[inline]
pub fn cosine_hemisphere_pdf(cos_theta: Float) -> Float {
    cos_theta * INV_PI
}

/// Weight samples using the balance heuristic.
///
/// * `nf`    - Number of samples taken from `f_pdf`.
/// * `f_pdf` - First sampling distribution.
/// * `ng`    - Number of samples taken from `g_pdf`.
/// * `g_pdf` - Second sampling distribution.
#[inline]
pub fn balance_heuristic(nf: Int, f_pdf: Float, ng: Int, g_pdf: Float) -> Float {
    (nf as Float * f_pdf) / (nf as Float * f_pdf + ng as Float * g_pdf)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::{Rng, Sampler};

    #[test]
    fn hemisphere_samples_lie_in_upper_hemisphere() {
        let mut rng = Rng::new(3);
        for _ in 0..1000 {
            let u = rng.next_2d();
            let d = uniform_sample_hemisphere(u);
            assert!(d.z >= 0.0);
            assert!((d.length() - 1.0).abs() < 1e-12);

            let c = cosine_sample_hemisphere(u);
            assert!(c.z >= 0.0);
            assert!((c.length() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn cosine_pdf_integrates_to_one() {
        // ∫ cosθ/π over the hemisphere = ∫0^1 2 c dc = 1
        let n = 10_000;
        let mut sum = 0.0;
        for i in 0..n {
            let cos_theta = (i as Float + 0.5) / n as Float;
            sum += cosine_hemisphere_pdf(cos_theta) * TWO_PI / n as Float;
        }
        assert!((sum - 1.0).abs() < 1e-3);
    }

    #[test]
    fn balance_heuristic_partitions_unity() {
        let w1 = balance_heuristic(1, 0.25, 3, 0.5);
        let w2 = balance_heuristic(3, 0.5, 1, 0.25);
        assert!((w1 + w2 - 1.0).abs() < 1e-12);
    }
}
