//! Heat diffusion CLI - Run a GPU diffusion simulation from positional arguments.

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::time::Instant;

use heat_diffusion::{
    compute::{Grid, GridStats},
    compute::gpu::{GpuError, Simulation},
    schema::SimulationParams,
};

/// Environment variable overriding the kernel source location.
const KERNEL_PATH_VAR: &str = "HEAT_DIFFUSION_KERNEL";
const DEFAULT_KERNEL_PATH: &str = "kernel.wgsl";

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("heat-diffusion");
    let args = args.get(1..).unwrap_or_default();

    match args.first().map(String::as_str) {
        Some("-h" | "--help") => {
            print_usage(program);
            return;
        }
        Some("--defaults") => {
            print_defaults();
            return;
        }
        _ => {}
    }

    let params = SimulationParams::from_args(args);
    let kernel_path = std::env::var_os(KERNEL_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_KERNEL_PATH));

    let print_result = params.print_result;
    let start = Instant::now();
    let grid = run(params, kernel_path).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    let elapsed = start.elapsed();

    let stats = GridStats::from_grid(&grid);
    log::info!(
        "Finished in {:.2?}: total heat {:.3}, range [{:.3}, {:.3}], mean {:.6}",
        elapsed,
        stats.total_heat,
        stats.min_value,
        stats.max_value,
        stats.mean_value
    );

    if print_result {
        let stdout = io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        if let Err(e) = grid.write_csv(&mut out) {
            eprintln!("Error writing result: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(params: SimulationParams, kernel_path: PathBuf) -> Result<Grid, GpuError> {
    let mut simulation = Simulation::new(params)?;
    let params = simulation.params();
    log::info!(
        "Grid {}x{}, {}x{} tiles, {} iterations, kernel {}",
        params.width,
        params.height,
        params.tile_size,
        params.tile_size,
        params.iterations,
        kernel_path.display()
    );

    pollster::block_on(simulation.acquire_device())?;
    if let Some(context) = simulation.context() {
        log::info!(
            "Device: {} ({:?})",
            context.adapter_name(),
            context.backend()
        );
    }
    simulation.build_program_from_file(&kernel_path)?;
    simulation.allocate_buffers()?;
    simulation.iterate()?;
    simulation.finalize()
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} [size] [tile_size] [iterations] [print]", program);
    eprintln!();
    eprintln!("Run an iterative 2D heat diffusion on the GPU.");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  size        Grid width and height in cells (default: 1024)");
    eprintln!("  tile_size   Work-group edge length (default: 16)");
    eprintln!("  iterations  Number of diffusion steps (default: 100)");
    eprintln!("  print       1 to print the final grid (default: off)");
    eprintln!();
    eprintln!("Zero or malformed values fall back to the defaults.");
    eprintln!(
        "The kernel is read from {} or ${}.",
        DEFAULT_KERNEL_PATH, KERNEL_PATH_VAR
    );
}

fn print_defaults() {
    let params = SimulationParams::default();
    match serde_json::to_string_pretty(&params) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing defaults: {}", e);
            std::process::exit(1);
        }
    }
}
