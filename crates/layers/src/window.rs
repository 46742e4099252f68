//! Window partitioning for channels-last feature grids.
//!
//! Feature maps arrive shaped `(batch, height, width, channels)`. Partitioning
//! pads the trailing edge of both spatial axes so each becomes a multiple of
//! the window size, then rearranges the grid so every `window_size x
//! window_size` tile is an independent batch element. [`window_reverse`] is
//! the exact inverse: it restores the padded grid and crops the padding back
//! off, so `reverse(partition(x)) == x` holds bit-exactly for any spatial
//! extent, including extents smaller than the window.

use candle_core::{Error, Result, Tensor};

/// Output of [`window_partition`]; everything [`window_reverse`] needs to
/// undo the tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGrid {
    pub height: usize,
    pub width: usize,
    pub pad_h: usize,
    pub pad_w: usize,
}

impl WindowGrid {
    fn padded_height(&self) -> usize {
        self.height + self.pad_h
    }

    fn padded_width(&self) -> usize {
        self.width + self.pad_w
    }
}

fn trailing_pad(dim: usize, window_size: usize) -> usize {
    (window_size - dim % window_size) % window_size
}

/// Splits `(batch, h, w, c)` into `(batch * tiles, ws, ws, c)` windows.
pub fn window_partition(x: &Tensor, window_size: usize) -> Result<(Tensor, WindowGrid)> {
    if window_size == 0 {
        return Err(Error::Msg("window_size must be greater than zero".into()));
    }
    let (batch, height, width, channels) = x.dims4()?;

    let pad_h = trailing_pad(height, window_size);
    let pad_w = trailing_pad(width, window_size);
    let mut padded = x.clone();
    if pad_h > 0 {
        padded = padded.pad_with_zeros(1, 0, pad_h)?;
    }
    if pad_w > 0 {
        padded = padded.pad_with_zeros(2, 0, pad_w)?;
    }

    let tiles_h = (height + pad_h) / window_size;
    let tiles_w = (width + pad_w) / window_size;

    let windows = padded
        .reshape((
            batch,
            tiles_h,
            window_size,
            tiles_w,
            window_size,
            channels,
        ))?
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()?
        .reshape((
            batch * tiles_h * tiles_w,
            window_size,
            window_size,
            channels,
        ))?;

    let grid = WindowGrid {
        height,
        width,
        pad_h,
        pad_w,
    };
    Ok((windows, grid))
}

/// Reassembles windows produced by [`window_partition`] and strips padding.
pub fn window_reverse(windows: &Tensor, window_size: usize, grid: WindowGrid) -> Result<Tensor> {
    let (n_windows, ws_h, ws_w, channels) = windows.dims4()?;
    if ws_h != window_size || ws_w != window_size {
        return Err(Error::Msg(format!(
            "windows have spatial extent {}x{}, expected {}x{}",
            ws_h, ws_w, window_size, window_size
        )));
    }

    let tiles_h = grid.padded_height() / window_size;
    let tiles_w = grid.padded_width() / window_size;
    let tiles = tiles_h * tiles_w;
    if tiles == 0 || n_windows % tiles != 0 {
        return Err(Error::Msg(format!(
            "window count {} does not divide into a {}x{} tile grid",
            n_windows, tiles_h, tiles_w
        )));
    }
    let batch = n_windows / tiles;

    let padded = windows
        .reshape((batch, tiles_h, tiles_w, window_size, window_size, channels))?
        .permute((0, 1, 3, 2, 4, 5))?
        .contiguous()?
        .reshape((batch, grid.padded_height(), grid.padded_width(), channels))?;

    padded
        .narrow(1, 0, grid.height)?
        .narrow(2, 0, grid.width)
}
