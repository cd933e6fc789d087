//! Division of a pixel grid into rectangular processing windows

use crate::types::{WeaveError, WeaveResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default tile edge length in pixels
pub const DEFAULT_TILE_SIZE: usize = 256;

/// Rectangular sub-region of a pixel grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileWindow {
    /// Column offset of the window
    pub x_offset: usize,
    /// Row offset of the window
    pub y_offset: usize,
    pub width: usize,
    pub height: usize,
    /// Column index of this tile among `tiles_x`
    pub index_x: usize,
    /// Row index of this tile among `tiles_y`
    pub index_y: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileWindow {
    /// Window covering a whole grid
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x_offset: 0,
            y_offset: 0,
            width,
            height,
            index_x: 0,
            index_y: 0,
            tiles_x: 1,
            tiles_y: 1,
        }
    }

    /// Row-major ordinal of this tile
    pub fn ordinal(&self) -> usize {
        self.index_y * self.tiles_x + self.index_x
    }

    pub fn total(&self) -> usize {
        self.tiles_x * self.tiles_y
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// True if the window lies inside a `width` x `height` grid
    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.x_offset + self.width <= width && self.y_offset + self.height <= height
    }
}

impl fmt::Display for TileWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile {}/{} (x={}, y={}, {}x{})",
            self.ordinal() + 1,
            self.total(),
            self.x_offset,
            self.y_offset,
            self.width,
            self.height
        )
    }
}

/// Produces the tile windows covering a grid
#[derive(Debug, Clone)]
pub struct TileScheduler {
    grid_width: usize,
    grid_height: usize,
    tile_width: usize,
    tile_height: usize,
}

impl TileScheduler {
    pub fn new(grid_width: usize, grid_height: usize, tile_width: usize, tile_height: usize) -> WeaveResult<Self> {
        if tile_width == 0 || tile_height == 0 {
            return Err(WeaveError::Configuration(format!(
                "Tile size must be positive, got {}x{}",
                tile_width, tile_height
            )));
        }
        Ok(Self {
            grid_width,
            grid_height,
            tile_width,
            tile_height,
        })
    }

    /// Scheduler with the default 256x256 tiles
    pub fn with_default_size(grid_width: usize, grid_height: usize) -> Self {
        Self {
            grid_width,
            grid_height,
            tile_width: DEFAULT_TILE_SIZE,
            tile_height: DEFAULT_TILE_SIZE,
        }
    }

    pub fn tiles_x(&self) -> usize {
        self.grid_width.div_ceil(self.tile_width)
    }

    pub fn tiles_y(&self) -> usize {
        self.grid_height.div_ceil(self.tile_height)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles_x() * self.tiles_y()
    }

    /// Row-major sequence of windows; edge tiles are clipped, never padded
    pub fn tiles(&self) -> TileIter {
        TileIter {
            scheduler: self.clone(),
            next_x: 0,
            next_y: 0,
        }
    }
}

/// Lazy, single-pass iterator over a scheduler's windows
#[derive(Debug)]
pub struct TileIter {
    scheduler: TileScheduler,
    next_x: usize,
    next_y: usize,
}

impl Iterator for TileIter {
    type Item = TileWindow;

    fn next(&mut self) -> Option<Self::Item> {
        let s = &self.scheduler;
        let tiles_x = s.tiles_x();
        let tiles_y = s.tiles_y();
        if self.next_y >= tiles_y || tiles_x == 0 {
            return None;
        }

        let x_offset = self.next_x * s.tile_width;
        let y_offset = self.next_y * s.tile_height;
        let window = TileWindow {
            x_offset,
            y_offset,
            width: s.tile_width.min(s.grid_width - x_offset),
            height: s.tile_height.min(s.grid_height - y_offset),
            index_x: self.next_x,
            index_y: self.next_y,
            tiles_x,
            tiles_y,
        };

        self.next_x += 1;
        if self.next_x >= tiles_x {
            self.next_x = 0;
            self.next_y += 1;
        }
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let s = &self.scheduler;
        let done = self.next_y * s.tiles_x() + self.next_x;
        let remaining = s.tile_count().saturating_sub(done);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TileIter {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(width: usize, height: usize, tw: usize, th: usize) {
        let scheduler = TileScheduler::new(width, height, tw, th).unwrap();
        let mut hits = vec![0u8; width * height];
        let tiles: Vec<_> = scheduler.tiles().collect();
        assert_eq!(tiles.len(), width.div_ceil(tw) * height.div_ceil(th));
        for tile in &tiles {
            assert!(tile.fits(width, height));
            for y in tile.y_offset..tile.y_offset + tile.height {
                for x in tile.x_offset..tile.x_offset + tile.width {
                    hits[y * width + x] += 1;
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1), "grid {}x{} tile {}x{}", width, height, tw, th);
    }

    #[test]
    fn test_tiling_covers_grid_exactly() {
        for &(w, h, tw, th) in &[
            (10, 10, 3, 3),
            (7, 13, 4, 5),
            (256, 256, 256, 256),
            (300, 20, 256, 256),
            (1, 1, 8, 8),
            (17, 1, 2, 1),
        ] {
            assert_exact_cover(w, h, tw, th);
        }
    }

    #[test]
    fn test_small_grid_single_tile() {
        let scheduler = TileScheduler::with_default_size(100, 50);
        let tiles: Vec<_> = scheduler.tiles().collect();
        assert_eq!(tiles, vec![TileWindow::full(100, 50)]);
    }

    #[test]
    fn test_row_major_order() {
        let scheduler = TileScheduler::new(5, 4, 2, 2).unwrap();
        let ordinals: Vec<_> = scheduler.tiles().map(|t| (t.index_y, t.index_x, t.ordinal())).collect();
        assert_eq!(
            ordinals,
            vec![(0, 0, 0), (0, 1, 1), (0, 2, 2), (1, 0, 3), (1, 1, 4), (1, 2, 5)]
        );
        let last = scheduler.tiles().last().unwrap();
        assert_eq!((last.width, last.height), (1, 2));
    }

    #[test]
    fn test_size_hint_and_zero_tile() {
        let scheduler = TileScheduler::new(9, 9, 4, 4).unwrap();
        let mut iter = scheduler.tiles();
        assert_eq!(iter.len(), 9);
        iter.next();
        assert_eq!(iter.len(), 8);
        assert!(TileScheduler::new(9, 9, 0, 4).is_err());
    }

    #[test]
    fn test_empty_grid_has_no_tiles() {
        let scheduler = TileScheduler::new(0, 10, 4, 4).unwrap();
        assert_eq!(scheduler.tiles().count(), 0);
    }
}
