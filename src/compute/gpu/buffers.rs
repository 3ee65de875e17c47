//! Device-resident grid buffers.

use wgpu::util::DeviceExt;

use super::{DiffusionProgram, GpuError, SimulationContext};
use crate::compute::Grid;

/// Uniform buffer struct for the diffusion shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct GridDims {
    width: u32,
    height: u32,
    _pad0: u32,
    _pad1: u32,
}

/// The ping-pong pair of grid buffers plus a staging buffer for readback.
///
/// Created once per run and reused by every iteration.
pub struct GridBuffers {
    pub(crate) previous: wgpu::Buffer,
    pub(crate) current: wgpu::Buffer,
    staging: wgpu::Buffer,
    _dims: wgpu::Buffer,
    pub(crate) bind_group: wgpu::BindGroup,
    width: usize,
    height: usize,
    bytes: u64,
}

/// Check that one grid buffer of `bytes` fits the device limits.
pub(crate) fn check_buffer_size(limits: &wgpu::Limits, bytes: u64) -> Result<(), GpuError> {
    let limit = limits
        .max_buffer_size
        .min(u64::from(limits.max_storage_buffer_binding_size));
    if bytes == 0 || bytes > limit {
        return Err(GpuError::BufferAllocation {
            requested: bytes,
            limit,
        });
    }
    Ok(())
}

impl GridBuffers {
    /// Upload `previous` and `current` into fresh device buffers and bind
    /// them to `program`. Both grids must have the same dimensions.
    pub(crate) fn allocate(
        context: &SimulationContext,
        program: &DiffusionProgram,
        previous: &Grid,
        current: &Grid,
    ) -> Result<Self, GpuError> {
        debug_assert_eq!(previous.len(), current.len(), "grid size mismatch");

        let width = previous.width();
        let height = previous.height();
        let bytes = std::mem::size_of_val(previous.as_slice()) as u64;

        check_buffer_size(&context.limits(), bytes)?;

        let device = &context.device;
        let scope = device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let grid_usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;

        let previous_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Previous Grid Buffer"),
            contents: bytemuck::cast_slice(previous.as_slice()),
            usage: grid_usage,
        });
        let current_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Current Grid Buffer"),
            contents: bytemuck::cast_slice(current.as_slice()),
            usage: grid_usage,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let dims = GridDims {
            width: width as u32,
            height: height as u32,
            _pad0: 0,
            _pad1: 0,
        };
        let dims_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Grid Dims"),
            contents: bytemuck::bytes_of(&dims),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Diffusion Bind Group"),
            layout: &program.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: previous_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: current_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: dims_buffer.as_entire_binding(),
                },
            ],
        });

        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(GpuError::DeviceAllocation(error.to_string()));
        }

        log::debug!("Allocated two {} byte grid buffers ({}x{})", bytes, width, height);

        Ok(Self {
            previous: previous_buffer,
            current: current_buffer,
            staging,
            _dims: dims_buffer,
            bind_group,
            width,
            height,
            bytes,
        })
    }

    /// Size of one grid buffer in bytes.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Blocking read of the current buffer.
    ///
    /// Submitted after all previously enqueued work, so the result reflects
    /// every iteration.
    pub fn read_current(&self, context: &SimulationContext) -> Result<Grid, GpuError> {
        let mut encoder = context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.current, 0, &self.staging, 0, self.bytes);
        context.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = self.staging.slice(..);

        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });

        context.device.poll(wgpu::PollType::wait_indefinitely())?;
        rx.recv().map_err(|_| GpuError::ReadbackChannel)??;

        let data = {
            let mapped = buffer_slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&mapped).to_vec()
        };
        self.staging.unmap();

        let actual = data.len();
        Grid::from_vec(self.width, self.height, data).ok_or(GpuError::ReadbackSize {
            expected: self.width * self.height,
            actual,
        })
    }
}
