//! Kernel source loading and compilation.

use std::fs;
use std::path::Path;

use naga::valid::{Capabilities, ValidationFlags, Validator};

use super::{GpuError, SimulationContext};

/// Name of the compute entry point the kernel source must expose.
pub const KERNEL_ENTRY_POINT: &str = "diffusion";

/// Pipeline-overridable constant carrying the work-group edge length.
const TILE_SIZE_CONSTANT: &str = "tile_size";

/// Read a kernel source file into memory.
pub fn load_program_source(path: impl AsRef<Path>) -> Result<String, GpuError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| GpuError::FileIo {
        path: path.to_path_buf(),
        source,
    })?;
    log::debug!("Loaded {} bytes of kernel source from {}", source.len(), path.display());
    Ok(source)
}

/// Parse and validate WGSL source, and check that its interface matches the
/// pipeline built by [`DiffusionProgram::build`].
///
/// wgpu treats an invalid shader module as an uncaptured device error, so
/// compile failures are caught here where they can be reported.
pub fn validate_source(source: &str) -> Result<(), GpuError> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| GpuError::ProgramBuild(e.emit_to_string(source)))?;

    Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .map_err(|e| GpuError::ProgramBuild(e.emit_to_string(source)))?;

    check_interface(&module)
}

/// Binding slot expected by the pipeline layout.
#[derive(Clone, Copy)]
enum Slot {
    ReadOnlyStorage,
    WritableStorage,
    Uniform,
}

const EXPECTED_BINDINGS: [(u32, Slot, &str); 3] = [
    (0, Slot::ReadOnlyStorage, "var<storage, read> array<f32>"),
    (1, Slot::WritableStorage, "var<storage, read_write> array<f32>"),
    (2, Slot::Uniform, "var<uniform> grid dimensions"),
];

fn check_interface(module: &naga::Module) -> Result<(), GpuError> {
    let has_entry = module
        .entry_points
        .iter()
        .any(|ep| ep.name == KERNEL_ENTRY_POINT && ep.stage == naga::ShaderStage::Compute);
    if !has_entry {
        return Err(GpuError::ProgramBuild(format!(
            "no compute entry point named `{}`",
            KERNEL_ENTRY_POINT
        )));
    }

    let has_tile_size = module
        .overrides
        .iter()
        .any(|(_, o)| o.name.as_deref() == Some(TILE_SIZE_CONSTANT));
    if !has_tile_size {
        return Err(GpuError::ProgramBuild(format!(
            "no `override {}: u32` to size work-groups",
            TILE_SIZE_CONSTANT
        )));
    }

    for (binding, slot, expected) in EXPECTED_BINDINGS {
        let space = module
            .global_variables
            .iter()
            .find(|(_, var)| {
                var.binding
                    .as_ref()
                    .is_some_and(|b| b.group == 0 && b.binding == binding)
            })
            .map(|(_, var)| var.space);

        let matches = match (slot, space) {
            (Slot::ReadOnlyStorage, Some(naga::AddressSpace::Storage { access })) => {
                !access.contains(naga::StorageAccess::STORE)
            }
            (Slot::WritableStorage, Some(naga::AddressSpace::Storage { access })) => {
                access.contains(naga::StorageAccess::STORE)
            }
            (Slot::Uniform, Some(naga::AddressSpace::Uniform)) => true,
            _ => false,
        };
        if !matches {
            return Err(GpuError::ProgramBuild(format!(
                "@group(0) @binding({}) must be {}",
                binding, expected
            )));
        }
    }

    Ok(())
}

/// Compiled diffusion kernel and the layout of its bindings.
///
/// Bindings: 0 = previous grid (read), 1 = current grid (write),
/// 2 = grid dimensions (uniform).
pub struct DiffusionProgram {
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) bind_group_layout: wgpu::BindGroupLayout,
}

impl DiffusionProgram {
    /// Compile `source` for work-groups of `tile_size × tile_size`.
    pub fn build(
        context: &SimulationContext,
        source: &str,
        tile_size: u32,
    ) -> Result<Self, GpuError> {
        check_tile_size(&context.limits(), tile_size)?;
        validate_source(source)?;

        let device = &context.device;

        // Anything naga let through but wgpu still rejects is captured here
        // instead of reaching the panicking uncaptured-error handler.
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Diffusion Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });

        let bind_group_layout = create_diffusion_bind_group_layout(device);

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Diffusion Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Diffusion Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(KERNEL_ENTRY_POINT),
            compilation_options: wgpu::PipelineCompilationOptions {
                constants: &[(TILE_SIZE_CONSTANT, f64::from(tile_size))],
                ..Default::default()
            },
            cache: None,
        });

        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(GpuError::ProgramBuild(error.to_string()));
        }

        log::info!("Built kernel `{}` with {}x{} tiles", KERNEL_ENTRY_POINT, tile_size, tile_size);

        Ok(Self {
            pipeline,
            bind_group_layout,
        })
    }
}

fn check_tile_size(limits: &wgpu::Limits, tile_size: u32) -> Result<(), GpuError> {
    let max_dimension = limits
        .max_compute_workgroup_size_x
        .min(limits.max_compute_workgroup_size_y);
    let max_invocations = limits.max_compute_invocations_per_workgroup;

    let fits = tile_size > 0
        && tile_size <= max_dimension
        && tile_size
            .checked_mul(tile_size)
            .is_some_and(|n| n <= max_invocations);

    if fits {
        Ok(())
    } else {
        Err(GpuError::InvalidTileSize {
            tile_size,
            max_dimension,
            max_invocations,
        })
    }
}

fn create_diffusion_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("Diffusion Bind Group Layout"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: true },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const REFERENCE_KERNEL: &str = include_str!("../../../kernel.wgsl");

    #[test]
    fn test_reference_kernel_validates() {
        validate_source(REFERENCE_KERNEL).unwrap();
    }

    #[test]
    fn test_syntax_error_is_build_failure() {
        let broken = REFERENCE_KERNEL.replace("fn diffusion(", "fn diffusion((");
        assert!(matches!(
            validate_source(&broken),
            Err(GpuError::ProgramBuild(_))
        ));
    }

    fn expect_build_failure(source: &str, needle: &str) {
        match validate_source(source) {
            Err(GpuError::ProgramBuild(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {}", msg)
            }
            other => panic!("expected build failure, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_entry_point() {
        let renamed = REFERENCE_KERNEL.replace("fn diffusion(", "fn relax(");
        expect_build_failure(&renamed, "no compute entry point");
        expect_build_failure(&renamed, "diffusion");
    }

    #[test]
    fn test_storage_dims_binding_rejected() {
        let storage_dims = REFERENCE_KERNEL.replace(
            "@group(0) @binding(2) var<uniform> dims: Dims;",
            "@group(0) @binding(2) var<storage, read> dims: Dims;",
        );
        assert_ne!(storage_dims, REFERENCE_KERNEL);
        expect_build_failure(&storage_dims, "@binding(2)");
    }

    #[test]
    fn test_writable_previous_binding_rejected() {
        let writable = REFERENCE_KERNEL.replace(
            "var<storage, read> previous",
            "var<storage, read_write> previous",
        );
        assert_ne!(writable, REFERENCE_KERNEL);
        expect_build_failure(&writable, "@binding(0)");
    }

    #[test]
    fn test_missing_binding_rejected() {
        let unbound = REFERENCE_KERNEL.replace("@binding(1)", "@binding(5)");
        expect_build_failure(&unbound, "@binding(1)");
    }

    #[test]
    fn test_fixed_workgroup_size_rejected() {
        let fixed = REFERENCE_KERNEL
            .replace("override tile_size: u32 = 16u;", "")
            .replace(
                "@workgroup_size(tile_size, tile_size, 1)",
                "@workgroup_size(16, 16, 1)",
            );
        assert_ne!(fixed, REFERENCE_KERNEL);
        expect_build_failure(&fixed, "tile_size");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel.wgsl");
        match load_program_source(&path) {
            Err(GpuError::FileIo { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected FileIo, got {:?}", other),
        }
    }

    #[test]
    fn test_load_reads_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(REFERENCE_KERNEL.as_bytes()).unwrap();
        let source = load_program_source(file.path()).unwrap();
        assert_eq!(source, REFERENCE_KERNEL);
    }

    #[test]
    fn test_load_rejects_non_utf8() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            load_program_source(file.path()),
            Err(GpuError::FileIo { .. })
        ));
    }

    #[test]
    fn test_tile_size_limits() {
        let limits = wgpu::Limits::default();
        assert!(check_tile_size(&limits, 16).is_ok());
        assert!(check_tile_size(&limits, 1).is_ok());
        assert!(matches!(
            check_tile_size(&limits, 32),
            Err(GpuError::InvalidTileSize { tile_size: 32, .. })
        ));
    }
}
