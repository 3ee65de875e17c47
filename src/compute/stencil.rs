//! CPU reference stencil.
//!
//! Mirrors the update rule of the bundled `kernel.wgsl` so that device
//! output can be cross-checked on the host.

use rayon::prelude::*;

use super::Grid;

/// Diffusion coefficient of the reference kernel.
pub const ALPHA: f32 = 0.2;

/// CPU implementation of the reference diffusion step.
pub struct CpuDiffusion {
    /// Scratch grid holding the next state (reused each step).
    next: Grid,
}

impl CpuDiffusion {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            next: Grid::zeros(width, height),
        }
    }

    /// Advance `grid` by one step.
    pub fn step(&mut self, grid: &mut Grid) {
        assert_eq!(grid.len(), self.next.len(), "grid size mismatch");
        diffuse_into(grid, &mut self.next);
        std::mem::swap(grid, &mut self.next);
    }

    /// Advance `grid` by exactly `iterations` steps.
    pub fn run(&mut self, grid: &mut Grid, iterations: u32) {
        for _ in 0..iterations {
            self.step(grid);
        }
    }
}

/// Compute one step from `previous` into `current`.
pub fn diffuse_into(previous: &Grid, current: &mut Grid) {
    let width = previous.width();
    let height = previous.height();
    if width == 0 {
        return;
    }
    let src = previous.as_slice();

    current
        .as_mut_slice()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, out)| {
            if row == 0 {
                out.copy_from_slice(&src[..width]);
                return;
            }
            let base = row * width;
            for (col, cell) in out.iter_mut().enumerate() {
                let i = base + col;
                let c = src[i];
                let n = src[i - width];
                let s = if row + 1 < height { src[i + width] } else { c };
                let west = if col > 0 { src[i - 1] } else { c };
                let east = if col + 1 < width { src[i + 1] } else { c };
                *cell = c + ALPHA * (n + s + east + west - 4.0 * c);
            }
        });
}
