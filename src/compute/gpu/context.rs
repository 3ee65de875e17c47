//! Device acquisition.

use super::GpuError;

/// Device and command queue shared by the program and buffers of one run.
///
/// The queue executes submissions in order, which is what orders each
/// iteration's dispatch and copy against the next.
pub struct SimulationContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
}

impl SimulationContext {
    /// Acquire the first suitable adapter on any backend, then a device and
    /// queue on it.
    pub async fn acquire() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| GpuError::NoAdapter)?;

        let info = adapter.get_info();
        log::info!("Using adapter {} ({:?})", info.name, info.backend);

        // Grid size and tile size are bounded by what the adapter supports,
        // not by the conservative defaults.
        let supported = adapter.limits();
        let required_limits = wgpu::Limits {
            max_buffer_size: supported.max_buffer_size,
            max_storage_buffer_binding_size: supported.max_storage_buffer_binding_size,
            max_compute_invocations_per_workgroup: supported
                .max_compute_invocations_per_workgroup,
            max_compute_workgroup_size_x: supported.max_compute_workgroup_size_x,
            max_compute_workgroup_size_y: supported.max_compute_workgroup_size_y,
            ..wgpu::Limits::default()
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Heat Diffusion GPU"),
                required_features: wgpu::Features::empty(),
                required_limits,
                ..Default::default()
            })
            .await?;

        Ok(Self {
            device,
            queue,
            info,
        })
    }

    /// Limits granted to the device.
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Human readable adapter name.
    pub fn adapter_name(&self) -> &str {
        &self.info.name
    }

    /// Backend the adapter runs on.
    pub fn backend(&self) -> wgpu::Backend {
        self.info.backend
    }
}
