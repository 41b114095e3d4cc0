//! Geometry

mod vector3;

// Re-export.
pub use vector3::*;
