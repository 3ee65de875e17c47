//! Host-side grid model.
//!
//! Cells are stored row-major: (row `i`, column `j`) lives at `i * width + j`.
//! Initialization, device upload, readback and rendering all use this one
//! mapping, so rendered line `i` is logical row `i`.

use std::io::{self, Write};

/// Temperature held by the heat source row.
pub const HEAT_SOURCE: f32 = 100.0;

/// Dense row-major scalar field.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl Grid {
    /// Create a grid with every cell set to zero.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            data: vec![0.0; width * height],
            width,
            height,
        }
    }

    /// Create a grid holding the fixed initial condition.
    pub fn initialized(width: usize, height: usize) -> Self {
        let mut grid = Self::zeros(width, height);
        grid.initialize();
        grid
    }

    /// Wrap existing row-major data. Returns `None` if the length does not
    /// match `width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == width * height).then_some(Self {
            data,
            width,
            height,
        })
    }

    /// Reset to the initial condition: row 0 at [`HEAT_SOURCE`], all other
    /// cells zero.
    pub fn initialize(&mut self) {
        self.data.fill(0.0);
        let source = self.width.min(self.data.len());
        self.data[..source].fill(HEAT_SOURCE);
    }

    /// Grid width (columns).
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Grid height (rows).
    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Total number of cells.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Convert (row, column) to a flat index.
    #[inline]
    pub fn idx(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// Value at (row, column). Panics if out of bounds.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        assert!(row < self.height && col < self.width, "cell out of bounds");
        self.data[self.idx(row, col)]
    }

    /// One row as a slice.
    pub fn row(&self, row: usize) -> &[f32] {
        let start = self.idx(row, 0);
        &self.data[start..start + self.width]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Largest cell value.
    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Render as `height` lines of `width` comma-separated `%8.3f` values,
    /// followed by a blank line.
    pub fn write_csv<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for row in self.data.chunks_exact(self.width.max(1)) {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    out.write_all(b",")?;
                }
                write!(out, "{:8.3}", value)?;
            }
            out.write_all(b"\n")?;
        }
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// Summary statistics for a grid.
#[derive(Debug, Clone, Copy)]
pub struct GridStats {
    pub total_heat: f32,
    pub max_value: f32,
    pub min_value: f32,
    pub mean_value: f32,
}

impl GridStats {
    /// Compute statistics from a grid.
    pub fn from_grid(grid: &Grid) -> Self {
        let mut total_heat = 0.0f64;
        let mut max_value = f32::NEG_INFINITY;
        let mut min_value = f32::INFINITY;

        for &v in grid.as_slice() {
            total_heat += f64::from(v);
            max_value = max_value.max(v);
            min_value = min_value.min(v);
        }

        Self {
            total_heat: total_heat as f32,
            max_value,
            min_value,
            mean_value: (total_heat / grid.len().max(1) as f64) as f32,
        }
    }
}
