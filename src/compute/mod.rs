//! Compute module - Grid model and diffusion backends.

mod grid;
mod stencil;

pub mod gpu;

pub use grid::*;
pub use stencil::*;
