//! GPU Compute Backend for heat diffusion
//!
//! Runs the diffusion kernel on a WebGPU (wgpu) device.

mod buffers;
mod context;
mod program;
mod simulation;

use std::path::PathBuf;

pub use buffers::GridBuffers;
pub use context::SimulationContext;
pub use program::{DiffusionProgram, KERNEL_ENTRY_POINT, load_program_source, validate_source};
pub use simulation::{DriverState, Simulation};

use crate::schema::ConfigError;

/// Error type for GPU operations.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,

    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(#[from] wgpu::RequestDeviceError),

    #[error("Invalid simulation parameters: {0}")]
    Config(#[from] ConfigError),

    #[error(
        "Tile size {tile_size} exceeds device limits \
         ({max_dimension} per dimension, {max_invocations} invocations per work-group)"
    )]
    InvalidTileSize {
        tile_size: u32,
        max_dimension: u32,
        max_invocations: u32,
    },

    #[error("Cannot allocate {requested} byte grid buffer (device limit {limit} bytes)")]
    BufferAllocation { requested: u64, limit: u64 },

    #[error("Device failed to allocate grid buffers: {0}")]
    DeviceAllocation(String),

    #[error("Failed to read kernel source {}: {source}", path.display())]
    FileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Kernel program failed to build:\n{0}")]
    ProgramBuild(String),

    #[error("Kernel dispatch rejected: {0}")]
    KernelDispatch(String),

    #[error("Buffer mapping failed: {0}")]
    BufferMap(#[from] wgpu::BufferAsyncError),

    #[error("Waiting for device failed: {0}")]
    Poll(#[from] wgpu::PollError),

    #[error("Readback was dropped before the device answered")]
    ReadbackChannel,

    #[error("Read back {actual} cells, expected {expected}")]
    ReadbackSize { expected: usize, actual: usize },

    #[error("Simulation is {actual}, expected {expected}")]
    InvalidState {
        expected: DriverState,
        actual: DriverState,
    },
}
