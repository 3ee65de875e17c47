//! Schema module - Run parameters for heat diffusion simulations.

mod config;

pub use config::*;
