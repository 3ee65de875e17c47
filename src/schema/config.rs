//! Run parameters for a heat diffusion simulation.

use serde::{Deserialize, Serialize};

/// Default grid width in cells.
pub const DEFAULT_WIDTH: usize = 1024;
/// Default grid height in cells.
pub const DEFAULT_HEIGHT: usize = 1024;
/// Default work-group edge length.
pub const DEFAULT_TILE_SIZE: u32 = 16;
/// Default number of diffusion steps.
pub const DEFAULT_ITERATIONS: u32 = 100;

/// Parameters fixed for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Grid width in cells (columns).
    pub width: usize,
    /// Grid height in cells (rows).
    pub height: usize,
    /// Work-group edge length; each group covers `tile_size × tile_size` cells.
    pub tile_size: u32,
    /// Exact number of diffusion steps to run.
    pub iterations: u32,
    /// Dump the final grid as text to stdout.
    #[serde(default)]
    pub print_result: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            tile_size: DEFAULT_TILE_SIZE,
            iterations: DEFAULT_ITERATIONS,
            print_result: false,
        }
    }
}

impl SimulationParams {
    /// Build parameters from positional command line arguments.
    ///
    /// `args` excludes the program name and is read as
    /// `[size] [tile_size] [iterations] [print]`. The size applies to
    /// both dimensions. Missing, unparsable or zero values fall back to
    /// the defaults; printing is enabled only by a literal `1`.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let defaults = Self::default();

        let size = positive_arg::<usize>(args, 0);
        let (width, height) = match size {
            Some(size) => (size, size),
            None => (defaults.width, defaults.height),
        };

        let print_result = args
            .get(3)
            .and_then(|s| s.as_ref().trim().parse::<i64>().ok())
            .is_some_and(|v| v == 1);

        Self {
            width,
            height,
            tile_size: positive_arg(args, 1).unwrap_or(defaults.tile_size),
            iterations: positive_arg(args, 2).unwrap_or(defaults.iterations),
            print_result,
        }
    }

    /// Total number of cells.
    #[inline]
    pub fn grid_len(&self) -> usize {
        self.width * self.height
    }

    /// Size of one grid in bytes.
    #[inline]
    pub fn grid_bytes(&self) -> u64 {
        (self.grid_len() * std::mem::size_of::<f32>()) as u64
    }

    /// Work-groups needed along (x, y) to cover the grid.
    ///
    /// Partial tiles at the right and bottom edges are padded.
    pub fn workgroup_counts(&self) -> (u32, u32) {
        let tile = self.tile_size as usize;
        (
            self.width.div_ceil(tile) as u32,
            self.height.div_ceil(tile) as u32,
        )
    }

    /// Validate parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if self.width > u32::MAX as usize || self.height > u32::MAX as usize {
            return Err(ConfigError::DimensionsTooLarge {
                width: self.width,
                height: self.height,
            });
        }
        let bytes = self
            .width
            .checked_mul(self.height)
            .and_then(|cells| cells.checked_mul(std::mem::size_of::<f32>()));
        if bytes.is_none() {
            return Err(ConfigError::DimensionsTooLarge {
                width: self.width,
                height: self.height,
            });
        }
        if self.tile_size == 0 {
            return Err(ConfigError::InvalidTileSize);
        }
        Ok(())
    }
}

fn positive_arg<T>(args: &[impl AsRef<str>], index: usize) -> Option<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    args.get(index)
        .and_then(|s| s.as_ref().trim().parse::<T>().ok())
        .filter(|v| *v != T::default())
}

/// Parameter validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Grid dimensions (width, height) must be non-zero")]
    InvalidDimensions,
    #[error("Grid of {width}x{height} cells is too large to address")]
    DimensionsTooLarge { width: usize, height: usize },
    #[error("Work-group tile size must be non-zero")]
    InvalidTileSize,
}
