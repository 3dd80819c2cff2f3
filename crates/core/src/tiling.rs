//! Tile planner: splits an image into overlapping inference tiles.
//!
//! Each tile owns a *core* rectangle. Cores partition the image on a
//! `block_w × block_h` grid. The *source* rectangle is the core grown by
//! `margin` pixels per side (clamped to the image) so the network sees
//! enough context; only the scaled core is kept from the tile's output.
//! A block that covers the whole image degenerates to exactly one tile.

use crate::error::InferenceError;

/// Context in input pixels added on each side of a tile core. Prevents seam
/// artifacts from the network's finite receptive field.
pub const DEFAULT_TILE_OVERLAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn scaled(&self, scale: usize) -> Self {
        Self::new(
            self.x * scale,
            self.y * scale,
            self.width * scale,
            self.height * scale,
        )
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDescriptor {
    /// Region of the input fed to the network.
    pub source: Rect,
    /// Part of `source` whose output this tile contributes.
    pub core: Rect,
    /// Where the scaled core lands in the output.
    pub destination: Rect,
    pub scale: usize,
}

impl TileDescriptor {
    /// Offset of the kept region inside the tile's (scaled) output.
    pub fn crop_offset(&self) -> (usize, usize) {
        (
            (self.core.x - self.source.x) * self.scale,
            (self.core.y - self.source.y) * self.scale,
        )
    }
}

/// Plan tiles for a `width × height` image.
pub fn plan(
    width: usize,
    height: usize,
    block_w: usize,
    block_h: usize,
    scale: usize,
    margin: usize,
) -> Result<Vec<TileDescriptor>, InferenceError> {
    if width == 0 || height == 0 {
        return Err(InferenceError::InvalidParameter(format!(
            "cannot tile an empty image ({width}x{height})"
        )));
    }
    if block_w == 0 || block_h == 0 {
        return Err(InferenceError::InvalidParameter(format!(
            "block size must be non-zero ({block_w}x{block_h})"
        )));
    }
    if scale == 0 {
        return Err(InferenceError::InvalidParameter(
            "scale must be non-zero".to_string(),
        ));
    }

    let mut tiles = Vec::with_capacity(width.div_ceil(block_w) * height.div_ceil(block_h));
    for core_y in (0..height).step_by(block_h) {
        let core_h = block_h.min(height - core_y);
        let src_y0 = core_y.saturating_sub(margin);
        let src_y1 = (core_y + core_h + margin).min(height);

        for core_x in (0..width).step_by(block_w) {
            let core_w = block_w.min(width - core_x);
            let src_x0 = core_x.saturating_sub(margin);
            let src_x1 = (core_x + core_w + margin).min(width);

            let core = Rect::new(core_x, core_y, core_w, core_h);
            tiles.push(TileDescriptor {
                source: Rect::new(src_x0, src_y0, src_x1 - src_x0, src_y1 - src_y0),
                core,
                destination: core.scaled(scale),
                scale,
            });
        }
    }

    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covered(width: usize, height: usize, rects: impl Iterator<Item = Rect>) -> Vec<u32> {
        let mut hits = vec![0u32; width * height];
        for rect in rects {
            for y in rect.y..rect.bottom() {
                for x in rect.x..rect.right() {
                    hits[y * width + x] += 1;
                }
            }
        }
        hits
    }

    #[test]
    fn block_covering_image_gives_single_tile() {
        let tiles = plan(100, 60, 128, 128, 2, DEFAULT_TILE_OVERLAP).unwrap();
        assert_eq!(tiles.len(), 1);
        let tile = tiles[0];
        assert_eq!(tile.source, Rect::new(0, 0, 100, 60));
        assert_eq!(tile.core, tile.source);
        assert_eq!(tile.destination, Rect::new(0, 0, 200, 120));
        assert_eq!(tile.crop_offset(), (0, 0));
    }

    #[test]
    fn scale_one_keeps_dimensions() {
        let tiles = plan(33, 17, 64, 64, 1, 4).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].destination, Rect::new(0, 0, 33, 17));
    }

    #[test]
    fn cores_partition_the_image() {
        let (w, h) = (70, 45);
        let tiles = plan(w, h, 16, 12, 2, 5).unwrap();
        assert_eq!(tiles.len(), 5 * 4);
        assert!(covered(w, h, tiles.iter().map(|t| t.core))
            .iter()
            .all(|&hits| hits == 1));
    }

    #[test]
    fn destinations_partition_the_output() {
        let (w, h, scale) = (23, 19, 4);
        let tiles = plan(w, h, 8, 8, scale, 3).unwrap();
        assert!(covered(w * scale, h * scale, tiles.iter().map(|t| t.destination))
            .iter()
            .all(|&hits| hits == 1));
    }

    #[test]
    fn sources_add_clamped_margin() {
        let tiles = plan(40, 40, 16, 16, 2, 4).unwrap();
        let image = Rect::new(0, 0, 40, 40);
        for tile in &tiles {
            assert!(tile.source.contains(&tile.core));
            assert!(image.contains(&tile.source));
        }

        let first = tiles[0];
        assert_eq!(first.source, Rect::new(0, 0, 20, 20));

        let middle = tiles[4];
        assert_eq!(middle.core, Rect::new(16, 16, 16, 16));
        assert_eq!(middle.source, Rect::new(12, 12, 24, 24));
        assert_eq!(middle.crop_offset(), (8, 8));

        let last = tiles[8];
        assert_eq!(last.core, Rect::new(32, 32, 8, 8));
        assert_eq!(last.source, Rect::new(28, 28, 12, 12));
    }

    #[test]
    fn tiles_are_row_major() {
        let tiles = plan(30, 30, 10, 10, 1, 0).unwrap();
        let origins: Vec<(usize, usize)> = tiles.iter().map(|t| (t.core.x, t.core.y)).collect();
        assert_eq!(origins[..4], [(0, 0), (10, 0), (20, 0), (0, 10)]);
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(plan(0, 10, 8, 8, 2, 4).is_err());
        assert!(plan(10, 10, 0, 8, 2, 4).is_err());
        assert!(plan(10, 10, 8, 8, 0, 4).is_err());
    }
}
