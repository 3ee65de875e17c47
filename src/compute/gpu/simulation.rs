//! Simulation driver - runs the diffusion kernel for a fixed number of steps.
//!
//! The driver advances through
//! `Uninitialized → DeviceReady → ProgramBuilt → BuffersAllocated → Iterating → Finalized`.
//! The first failing transition moves it to `Aborted`, and every later call
//! is rejected.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use super::buffers::check_buffer_size;
use super::{DiffusionProgram, GpuError, GridBuffers, SimulationContext, load_program_source};
use crate::compute::Grid;
use crate::schema::SimulationParams;

/// Lifecycle of a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialized,
    DeviceReady,
    ProgramBuilt,
    BuffersAllocated,
    Iterating,
    Finalized,
    Aborted,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::DeviceReady => "device ready",
            Self::ProgramBuilt => "program built",
            Self::BuffersAllocated => "buffers allocated",
            Self::Iterating => "iterating",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// GPU heat diffusion driver.
///
/// Owns the [`SimulationContext`] and every resource built from it.
pub struct Simulation {
    params: SimulationParams,
    state: DriverState,
    context: Option<SimulationContext>,
    program: Option<DiffusionProgram>,
    buffers: Option<GridBuffers>,
}

impl Simulation {
    /// Create a driver for `params`. No device work happens yet.
    pub fn new(params: SimulationParams) -> Result<Self, GpuError> {
        params.validate()?;
        Ok(Self {
            params,
            state: DriverState::Uninitialized,
            context: None,
            program: None,
            buffers: None,
        })
    }

    /// Run every stage and return the final grid.
    pub async fn run(params: SimulationParams, source: &str) -> Result<Grid, GpuError> {
        let mut simulation = Self::new(params)?;
        simulation.acquire_device().await?;
        simulation.build_program(source)?;
        simulation.allocate_buffers()?;
        simulation.iterate()?;
        simulation.finalize()
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Device context, once acquired.
    pub fn context(&self) -> Option<&SimulationContext> {
        self.context.as_ref()
    }

    /// `Uninitialized → DeviceReady`.
    pub async fn acquire_device(&mut self) -> Result<(), GpuError> {
        let result = match self.expect_state(DriverState::Uninitialized) {
            Ok(()) => SimulationContext::acquire().await,
            Err(e) => Err(e),
        };
        let context = self.transition(DriverState::DeviceReady, result)?;
        self.context = Some(context);
        Ok(())
    }

    /// `DeviceReady → ProgramBuilt`, compiling `source`.
    pub fn build_program(&mut self, source: &str) -> Result<(), GpuError> {
        let tile_size = self.params.tile_size;
        let result = self
            .expect_state(DriverState::DeviceReady)
            .and_then(|()| self.require_context())
            .and_then(|context| DiffusionProgram::build(context, source, tile_size));
        let program = self.transition(DriverState::ProgramBuilt, result)?;
        self.program = Some(program);
        Ok(())
    }

    /// `DeviceReady → ProgramBuilt`, compiling the kernel file at `path`.
    pub fn build_program_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), GpuError> {
        let source = self
            .expect_state(DriverState::DeviceReady)
            .and_then(|()| load_program_source(path));
        let source = match source {
            Ok(source) => source,
            Err(e) => return Err(self.abort(e)),
        };
        self.build_program(&source)
    }

    /// `ProgramBuilt → BuffersAllocated`.
    ///
    /// Both host grids hold the initial condition; one seeds each device
    /// buffer. The grid size is checked against the device limits before
    /// any host memory is allocated.
    pub fn allocate_buffers(&mut self) -> Result<(), GpuError> {
        let result = self.expect_state(DriverState::ProgramBuilt).and_then(|()| {
            let context = self.require_context()?;
            let program = self.require_program()?;
            check_buffer_size(&context.limits(), self.params.grid_bytes())?;

            let previous = Grid::initialized(self.params.width, self.params.height);
            let current = Grid::initialized(self.params.width, self.params.height);
            GridBuffers::allocate(context, program, &previous, &current)
        });
        let buffers = self.transition(DriverState::BuffersAllocated, result)?;
        self.buffers = Some(buffers);
        Ok(())
    }

    /// `BuffersAllocated → Iterating`.
    ///
    /// Enqueues exactly `iterations` steps without waiting on the device.
    /// Each step dispatches the kernel from the previous buffer into the
    /// current one, then copies current back over previous.
    pub fn iterate(&mut self) -> Result<(), GpuError> {
        let result = self
            .expect_state(DriverState::BuffersAllocated)
            .and_then(|()| self.enqueue_iterations());
        self.transition(DriverState::Iterating, result)
    }

    /// `Iterating → Finalized`, reading the current buffer back.
    ///
    /// Device buffers are released once the grid is on the host.
    pub fn finalize(&mut self) -> Result<Grid, GpuError> {
        let result = self.expect_state(DriverState::Iterating).and_then(|()| {
            let context = self.require_context()?;
            let buffers = self.require_buffers()?;
            let start = Instant::now();
            let grid = buffers.read_current(context)?;
            log::info!("Read back {} cells in {:.2?}", grid.len(), start.elapsed());
            Ok(grid)
        });
        let grid = self.transition(DriverState::Finalized, result)?;
        self.buffers = None;
        Ok(grid)
    }

    fn enqueue_iterations(&self) -> Result<(), GpuError> {
        let context = self.require_context()?;
        let program = self.require_program()?;
        let buffers = self.require_buffers()?;

        let (workgroups_x, workgroups_y) = self.params.workgroup_counts();
        let max_groups = context.limits().max_compute_workgroups_per_dimension;
        if workgroups_x > max_groups || workgroups_y > max_groups {
            return Err(GpuError::KernelDispatch(format!(
                "{}x{} work-groups exceed the device limit of {} per dimension",
                workgroups_x, workgroups_y, max_groups
            )));
        }

        log::info!(
            "Enqueuing {} iterations over {}x{} work-groups",
            self.params.iterations,
            workgroups_x,
            workgroups_y
        );

        for count in 0..self.params.iterations {
            let mut encoder =
                context
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("Iteration Encoder"),
                    });

            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Diffusion Pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &buffers.bind_group, &[]);
                pass.dispatch_workgroups(workgroups_x, workgroups_y, 1);
            }

            // Current -> previous for the next iteration
            encoder.copy_buffer_to_buffer(
                &buffers.current,
                0,
                &buffers.previous,
                0,
                buffers.bytes(),
            );

            context.queue.submit(std::iter::once(encoder.finish()));
            log::trace!("Submitted iteration {}", count + 1);
        }

        Ok(())
    }

    fn expect_state(&self, expected: DriverState) -> Result<(), GpuError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GpuError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn transition<T>(
        &mut self,
        next: DriverState,
        result: Result<T, GpuError>,
    ) -> Result<T, GpuError> {
        match result {
            Ok(value) => {
                log::debug!("Simulation {} -> {}", self.state, next);
                self.state = next;
                Ok(value)
            }
            Err(e) => Err(self.abort(e)),
        }
    }

    fn abort(&mut self, error: GpuError) -> GpuError {
        log::error!("Simulation aborted while {}: {}", self.state, error);
        self.state = DriverState::Aborted;
        self.program = None;
        self.buffers = None;
        error
    }

    fn require_context(&self) -> Result<&SimulationContext, GpuError> {
        self.context.as_ref().ok_or(GpuError::InvalidState {
            expected: DriverState::DeviceReady,
            actual: self.state,
        })
    }

    fn require_program(&self) -> Result<&DiffusionProgram, GpuError> {
        self.program.as_ref().ok_or(GpuError::InvalidState {
            expected: DriverState::ProgramBuilt,
            actual: self.state,
        })
    }

    fn require_buffers(&self) -> Result<&GridBuffers, GpuError> {
        self.buffers.as_ref().ok_or(GpuError::InvalidState {
            expected: DriverState::BuffersAllocated,
            actual: self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::gpu::validate_source;
    use crate::compute::{CpuDiffusion, HEAT_SOURCE};

    const REFERENCE_KERNEL: &str = include_str!("../../../kernel.wgsl");

    fn params(size: usize, tile_size: u32, iterations: u32) -> SimulationParams {
        SimulationParams {
            width: size,
            height: size,
            tile_size,
            iterations,
            print_result: false,
        }
    }

    /// Run on the GPU, or return `None` if this machine has no usable device.
    fn run_gpu(params: SimulationParams) -> Option<Grid> {
        match pollster::block_on(Simulation::run(params, REFERENCE_KERNEL)) {
            Ok(grid) => Some(grid),
            Err(GpuError::NoAdapter) | Err(GpuError::DeviceRequest(_)) => {
                eprintln!("Skipping GPU test: no adapter available");
                None
            }
            Err(e) => panic!("GPU simulation failed: {:?}", e),
        }
    }

    fn max_abs_diff(a: &Grid, b: &Grid) -> f32 {
        a.as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max)
    }

    #[test]
    fn test_new_rejects_invalid_params() {
        assert!(matches!(
            Simulation::new(params(0, 16, 1)),
            Err(GpuError::Config(_))
        ));
    }

    #[test]
    fn test_out_of_order_call_aborts() {
        let mut simulation = Simulation::new(params(8, 4, 1)).unwrap();
        assert_eq!(simulation.state(), DriverState::Uninitialized);

        match simulation.build_program(REFERENCE_KERNEL) {
            Err(GpuError::InvalidState { expected, actual }) => {
                assert_eq!(expected, DriverState::DeviceReady);
                assert_eq!(actual, DriverState::Uninitialized);
            }
            other => panic!("expected InvalidState, got {:?}", other.err()),
        }
        assert_eq!(simulation.state(), DriverState::Aborted);

        assert!(matches!(
            pollster::block_on(simulation.acquire_device()),
            Err(GpuError::InvalidState { .. })
        ));
        assert_eq!(simulation.state(), DriverState::Aborted);
    }

    #[test]
    fn test_missing_kernel_file_aborts() {
        let Some(mut simulation) = acquired(params(8, 4, 1)) else {
            return;
        };

        let dir = tempfile::tempdir().unwrap();
        let result = simulation.build_program_from_file(dir.path().join("missing.wgsl"));
        assert!(matches!(result, Err(GpuError::FileIo { .. })));
        assert_eq!(simulation.state(), DriverState::Aborted);
        assert!(simulation.allocate_buffers().is_err());
    }

    #[test]
    fn test_broken_kernel_aborts() {
        let Some(mut simulation) = acquired(params(8, 4, 1)) else {
            return;
        };

        let result = simulation.build_program("fn diffusion( {");
        assert!(matches!(result, Err(GpuError::ProgramBuild(_))));
        assert_eq!(simulation.state(), DriverState::Aborted);
    }

    #[test]
    fn test_gpu_zero_iterations_is_identity() {
        let Some(grid) = run_gpu(params(16, 4, 0)) else {
            return;
        };
        assert_eq!(grid, Grid::initialized(16, 16));
    }

    #[test]
    fn test_gpu_single_step_4x4() {
        let Some(grid) = run_gpu(params(4, 1, 1)) else {
            return;
        };

        let mut out = Vec::new();
        grid.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], "");
        for line in &lines[..4] {
            assert_eq!(line.split(',').count(), 4);
        }

        for col in 0..4 {
            assert_eq!(grid.get(0, col), HEAT_SOURCE);
            assert!((grid.get(1, col) - 20.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_gpu_max_never_grows() {
        let mut previous_max = Grid::initialized(8, 8).max_value();
        for iterations in 1..=10 {
            let Some(grid) = run_gpu(params(8, 4, iterations)) else {
                return;
            };
            let max = grid.as_slice().iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            assert!(max <= previous_max + 1e-4, "{} > {}", max, previous_max);
            previous_max = max;
        }
    }

    #[test]
    fn test_gpu_deterministic() {
        let Some(first) = run_gpu(params(64, 8, 20)) else {
            return;
        };
        let Some(second) = run_gpu(params(64, 8, 20)) else {
            return;
        };
        assert!(max_abs_diff(&first, &second) <= 1e-5);
    }

    #[test]
    fn test_gpu_cpu_equivalence() {
        let steps = 20;
        let Some(gpu_grid) = run_gpu(params(32, 8, steps)) else {
            return;
        };

        let mut cpu_grid = Grid::initialized(32, 32);
        CpuDiffusion::new(32, 32).run(&mut cpu_grid, steps);

        let diff = max_abs_diff(&gpu_grid, &cpu_grid);
        assert!(diff < 1e-3, "GPU/CPU mismatch: max diff {:.6}", diff);
    }

    #[test]
    fn test_gpu_pads_partial_tiles() {
        let params = SimulationParams {
            width: 10,
            height: 6,
            tile_size: 4,
            iterations: 5,
            print_result: false,
        };
        let Some(gpu_grid) = run_gpu(params) else {
            return;
        };

        let mut cpu_grid = Grid::initialized(10, 6);
        CpuDiffusion::new(10, 6).run(&mut cpu_grid, 5);

        assert_eq!(gpu_grid.width(), 10);
        assert_eq!(gpu_grid.height(), 6);
        assert!(max_abs_diff(&gpu_grid, &cpu_grid) < 1e-3);
    }

    #[test]
    fn test_oversized_tile_rejected() {
        let Some(mut simulation) = acquired(params(64, 64, 1)) else {
            return;
        };

        // 64x64 = 4096 invocations, above every device's work-group limit
        let result = simulation.build_program(REFERENCE_KERNEL);
        assert!(matches!(result, Err(GpuError::InvalidTileSize { .. })));
        assert_eq!(simulation.state(), DriverState::Aborted);
    }

    /// Acquire a device, or return `None` if this machine has none.
    fn acquired(params: SimulationParams) -> Option<Simulation> {
        let mut simulation = Simulation::new(params).unwrap();
        match pollster::block_on(simulation.acquire_device()) {
            Ok(()) => Some(simulation),
            Err(GpuError::NoAdapter) | Err(GpuError::DeviceRequest(_)) => {
                eprintln!("Skipping GPU test: no adapter available");
                None
            }
            Err(e) => panic!("Failed to acquire device: {:?}", e),
        }
    }

    #[test]
    fn test_oversized_grid_is_allocation_failure() {
        let Some(mut simulation) = acquired(params(60_000, 16, 1)) else {
            return;
        };
        simulation.build_program(REFERENCE_KERNEL).unwrap();

        match simulation.allocate_buffers() {
            Err(GpuError::BufferAllocation { requested, limit }) => {
                assert_eq!(requested, simulation.params().grid_bytes());
                assert!(limit < requested);
            }
            other => panic!("expected BufferAllocation, got {:?}", other.err()),
        }
        assert_eq!(simulation.state(), DriverState::Aborted);
    }

    #[test]
    fn test_extra_binding_is_build_failure() {
        let Some(mut simulation) = acquired(params(8, 4, 1)) else {
            return;
        };

        // Valid WGSL with the expected bindings, plus a binding the pipeline
        // layout does not provide.
        let source = REFERENCE_KERNEL
            .replace(
                "const ALPHA: f32 = 0.2;",
                "const ALPHA: f32 = 0.2;\n@group(0) @binding(3) var<storage, read> extra: array<f32>;",
            )
            .replace("let c = previous[i];", "let c = previous[i] + extra[0] * 0.0;");
        assert!(validate_source(&source).is_ok());

        let result = simulation.build_program(&source);
        assert!(matches!(result, Err(GpuError::ProgramBuild(_))));
        assert_eq!(simulation.state(), DriverState::Aborted);
    }
}
