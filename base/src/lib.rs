//! Foundation crate: scalar math, geometry, random numbers and the shared
//! sampling primitives used by the subsurface transport kernel.

#[macro_use]
extern crate hexf;

pub mod geometry;
pub mod math;
pub mod rng;
pub mod sampling;
