//! Overlapping tile layout for windowed inference

use crate::types::{PipelineError, PipelineResult};

/// One tile: the window read from the raster and the core written back.
///
/// Cores partition the raster exactly. Windows extend each core by the
/// overlap on every side, clipped to the raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    pub row_offset: usize,
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
    pub core_row: usize,
    pub core_col: usize,
    pub core_rows: usize,
    pub core_cols: usize,
}

impl TileWindow {
    /// Core position relative to the window origin
    pub fn core_in_tile(&self) -> (usize, usize) {
        (self.core_row - self.row_offset, self.core_col - self.col_offset)
    }

    pub fn core_pixels(&self) -> usize {
        self.core_rows * self.core_cols
    }
}

/// Lay out tiles of at most `tile_size` pixels per side.
///
/// The core step is `tile_size - 2 * overlap`, so every window stays within
/// `tile_size` while each core keeps `overlap` pixels of context.
pub fn plan_tiles(rows: usize, cols: usize, tile_size: usize, overlap: usize) -> PipelineResult<Vec<TileWindow>> {
    if tile_size <= 2 * overlap {
        return Err(PipelineError::InvalidConfig(format!(
            "tile size {} leaves no core with overlap {}",
            tile_size, overlap
        )));
    }
    let step = tile_size - 2 * overlap;

    let mut tiles = Vec::new();
    for core_row in (0..rows).step_by(step) {
        let core_rows = step.min(rows - core_row);
        for core_col in (0..cols).step_by(step) {
            let core_cols = step.min(cols - core_col);
            let row_offset = core_row.saturating_sub(overlap);
            let col_offset = core_col.saturating_sub(overlap);
            let row_end = (core_row + core_rows + overlap).min(rows);
            let col_end = (core_col + core_cols + overlap).min(cols);
            tiles.push(TileWindow {
                row_offset,
                col_offset,
                rows: row_end - row_offset,
                cols: col_end - col_offset,
                core_row,
                core_col,
                core_rows,
                core_cols,
            });
        }
    }
    Ok(tiles)
}
