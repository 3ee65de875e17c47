//! Heat diffusion - iterative 2D heat diffusion on a GPU compute device.
//!
//! A uniform grid starts with a fixed heat source along row 0 and is
//! advanced by an explicit-Euler stencil kernel compiled at runtime from
//! WGSL source. Two device buffers are ping-ponged across iterations on a
//! single in-order queue; the host only blocks on the final readback.
//!
//! # Architecture
//!
//! - `schema`: Run parameters and their validation
//! - `compute`: Host grid model, CPU reference stencil, and the `gpu` driver
//!
//! # Example
//!
//! ```rust,no_run
//! use heat_diffusion::{
//!     compute::{GridStats, gpu::{Simulation, load_program_source}},
//!     schema::SimulationParams,
//! };
//!
//! let params = SimulationParams {
//!     width: 256,
//!     height: 256,
//!     iterations: 500,
//!     ..Default::default()
//! };
//! let source = load_program_source("kernel.wgsl")?;
//! let grid = pollster::block_on(Simulation::run(params, &source))?;
//!
//! println!("Total heat after 500 steps: {}", GridStats::from_grid(&grid).total_heat);
//! # Ok::<(), heat_diffusion::compute::gpu::GpuError>(())
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::gpu::{GpuError, Simulation};
pub use compute::{CpuDiffusion, Grid, GridStats};
pub use schema::SimulationParams;
