//! Tile grid geometry.
//!
//! Works out, for a given input size and model configuration, how many
//! overlapping tiles are needed, where each tile reads from the padded input,
//! where its (context-trimmed) output lands in the blend buffer, and which
//! part of that output ends up in the final image.
//!
//! `offset` and `blend_size` are given in output pixels; everything that
//! indexes the input is derived from them by ceiling division by `scale`.

use serde::Serialize;

use crate::dispatch::TileCoord;
use crate::error::{config_bail, RenderError};

/// Default overlap between neighbouring tiles, in output pixels.
pub const DEFAULT_BLEND_SIZE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryParams {
    pub input_width: u32,
    pub input_height: u32,
    pub scale: u32,
    pub offset: u32,
    pub tile_size: u32,
    pub blend_size: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Padding {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TileDescriptor {
    pub coord: TileCoord,
    /// Capture rectangle in the padded input.
    pub input: Rect,
    /// Footprint of the model output in the blend buffer.
    pub output: Rect,
    /// Part of the final image this tile writes, clipped to the image.
    pub placement: Rect,
    /// Offset of `placement` inside the tile output.
    pub placement_origin: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileGeometry {
    pub input_width: u32,
    pub input_height: u32,
    pub scale: u32,
    pub offset: u32,
    pub tile_size: u32,
    pub blend_size: u32,
    pub input_offset: u32,
    pub input_blend_size: u32,
    pub input_tile_step: u32,
    pub output_tile_step: u32,
    pub output_tile_size: u32,
    pub rows: u32,
    pub cols: u32,
    pub padding: Padding,
    pub padded_width: u32,
    pub padded_height: u32,
    pub buffer_width: u32,
    pub buffer_height: u32,
    pub output_width: u32,
    pub output_height: u32,
    /// Blend-buffer coordinate of output pixel `(0, 0)` on both axes.
    pub crop_origin: u32,
}

impl TileGeometry {
    pub fn compute(params: &GeometryParams) -> Result<Self, RenderError> {
        let GeometryParams {
            input_width,
            input_height,
            scale,
            offset,
            tile_size,
            blend_size,
        } = *params;

        if input_width == 0 || input_height == 0 {
            config_bail!("input image is empty ({input_width}x{input_height})");
        }
        if scale == 0 {
            config_bail!("scale must be at least 1");
        }
        if tile_size == 0 {
            config_bail!("tile_size must be at least 1");
        }

        let input_offset = offset.div_ceil(scale);
        let input_blend_size = blend_size.div_ceil(scale);
        let context = checked_add(checked_mul(input_offset, 2)?, input_blend_size)?;
        let min_tile_size = checked_add(context, 1)?;
        if tile_size < min_tile_size {
            config_bail!(
                "tile_size {tile_size} is too small for offset {offset} and blend size {blend_size} at scale {scale} (minimum {min_tile_size})"
            );
        }

        let scaled_tile = checked_mul(tile_size, scale)?;
        let double_offset = checked_mul(offset, 2)?;
        if scaled_tile <= double_offset {
            config_bail!(
                "tile_size {tile_size} at scale {scale} leaves no output after trimming offset {offset}"
            );
        }

        let input_tile_step = tile_size - context;
        let output_tile_step = checked_mul(input_tile_step, scale)?;
        let output_tile_size = scaled_tile - double_offset;

        let (rows, padded_height) =
            count_blocks(input_height, input_offset, tile_size, input_tile_step)?;
        let (cols, padded_width) =
            count_blocks(input_width, input_offset, tile_size, input_tile_step)?;

        let padding = Padding {
            left: input_offset,
            right: padded_width - (input_width + input_offset),
            top: input_offset,
            bottom: padded_height - (input_height + input_offset),
        };

        Ok(Self {
            input_width,
            input_height,
            scale,
            offset,
            tile_size,
            blend_size,
            input_offset,
            input_blend_size,
            input_tile_step,
            output_tile_step,
            output_tile_size,
            rows,
            cols,
            padding,
            padded_width,
            padded_height,
            buffer_width: checked_mul(padded_width, scale)?,
            buffer_height: checked_mul(padded_height, scale)?,
            output_width: checked_mul(input_width, scale)?,
            output_height: checked_mul(input_height, scale)?,
            crop_origin: input_offset * scale - offset,
        })
    }

    pub fn tile_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn contains(&self, coord: TileCoord) -> bool {
        coord.row < self.rows && coord.col < self.cols
    }

    /// Row-major enumeration of the grid.
    pub fn coords(&self) -> impl Iterator<Item = TileCoord> + '_ {
        (0..self.rows).flat_map(move |row| (0..self.cols).map(move |col| TileCoord { row, col }))
    }

    pub fn tiles(&self) -> impl Iterator<Item = TileDescriptor> + '_ {
        self.coords().map(move |coord| self.tile(coord))
    }

    /// Descriptor for a grid cell. `coord` must lie inside the grid.
    pub fn tile(&self, coord: TileCoord) -> TileDescriptor {
        debug_assert!(self.contains(coord), "tile {coord} outside grid");

        let input = Rect {
            x: coord.col * self.input_tile_step,
            y: coord.row * self.input_tile_step,
            width: self.tile_size,
            height: self.tile_size,
        };
        let output = Rect {
            x: coord.col * self.output_tile_step,
            y: coord.row * self.output_tile_step,
            width: self.output_tile_size,
            height: self.output_tile_size,
        };

        let (x, width, origin_x) = self.clip_span(output.x, self.output_width);
        let (y, height, origin_y) = self.clip_span(output.y, self.output_height);

        TileDescriptor {
            coord,
            input,
            output,
            placement: Rect {
                x,
                y,
                width,
                height,
            },
            placement_origin: (origin_x, origin_y),
        }
    }

    /// Centre of a tile in unpadded input coordinates (may lie outside the
    /// image for edge tiles).
    pub fn tile_center(&self, coord: TileCoord) -> (f64, f64) {
        let half = self.tile_size as f64 / 2.0;
        let x = (coord.col * self.input_tile_step) as f64 - self.padding.left as f64 + half;
        let y = (coord.row * self.input_tile_step) as f64 - self.padding.top as f64 + half;
        (x, y)
    }

    /// Output pixels attributed to a tile for progress accounting. Cells of
    /// `output_tile_step` partition the output image, the last row and column
    /// taking whatever is left, so the counts sum to `output_width *
    /// output_height`.
    pub fn owned_pixels(&self, coord: TileCoord) -> u64 {
        let span = |index: u32, count: u32, extent: u32| -> u64 {
            let start = (index as u64 * self.output_tile_step as u64).min(extent as u64);
            let end = if index + 1 == count {
                extent as u64
            } else {
                ((index as u64 + 1) * self.output_tile_step as u64).min(extent as u64)
            };
            end - start
        };
        span(coord.col, self.cols, self.output_width) * span(coord.row, self.rows, self.output_height)
    }

    pub fn output_pixels(&self) -> u64 {
        self.output_width as u64 * self.output_height as u64
    }

    /// Clip a tile's output span `[start, start + output_tile_size)` in buffer
    /// space to the final image `[crop_origin, crop_origin + extent)`.
    /// Returns the image-space start, the clipped length and the offset of the
    /// clipped span inside the tile.
    fn clip_span(&self, start: u32, extent: u32) -> (u32, u32, u32) {
        let begin = start.max(self.crop_origin);
        let end = (start + self.output_tile_size).min(self.crop_origin + extent);
        if end <= begin {
            return (0, 0, 0);
        }
        (begin - self.crop_origin, end - begin, begin - start)
    }
}

/// Grow the covered span one step at a time until it includes the image plus
/// context on both sides. Returns the block count and the covered span.
fn count_blocks(extent: u32, input_offset: u32, tile_size: u32, step: u32) -> Result<(u32, u32), RenderError> {
    let required = checked_add(extent, checked_mul(input_offset, 2)?)? as u64;
    let mut blocks: u64 = 0;
    let mut covered: u64 = 0;
    while covered < required {
        covered = blocks * step as u64 + tile_size as u64;
        blocks += 1;
    }

    Ok((narrow(blocks)?, narrow(covered)?))
}

fn checked_mul(a: u32, b: u32) -> Result<u32, RenderError> {
    a.checked_mul(b)
        .ok_or_else(|| RenderError::config(format!("geometry overflow computing {a} * {b}")))
}

fn checked_add(a: u32, b: u32) -> Result<u32, RenderError> {
    a.checked_add(b)
        .ok_or_else(|| RenderError::config(format!("geometry overflow computing {a} + {b}")))
}

fn narrow(value: u64) -> Result<u32, RenderError> {
    u32::try_from(value).map_err(|_| RenderError::config(format!("geometry value {value} exceeds u32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(w: u32, h: u32, scale: u32, offset: u32, tile: u32, blend: u32) -> GeometryParams {
        GeometryParams {
            input_width: w,
            input_height: h,
            scale,
            offset,
            tile_size: tile,
            blend_size: blend,
        }
    }

    #[test]
    fn test_reference_grid_100x100_scale2() {
        let g = TileGeometry::compute(&params(100, 100, 2, 16, 64, 16)).unwrap();

        assert_eq!(g.input_offset, 8);
        assert_eq!(g.input_blend_size, 8);
        assert_eq!(g.input_tile_step, 40);
        assert_eq!(g.output_tile_step, 80);
        assert_eq!(g.output_tile_size, 96);
        assert_eq!((g.rows, g.cols), (3, 3));
        assert_eq!(
            g.padding,
            Padding {
                left: 8,
                right: 36,
                top: 8,
                bottom: 36
            }
        );
        assert_eq!((g.padded_width, g.padded_height), (144, 144));
        assert_eq!((g.buffer_width, g.buffer_height), (288, 288));
        assert_eq!((g.output_width, g.output_height), (200, 200));
        assert_eq!(g.crop_origin, 0);
    }

    #[test]
    fn test_single_tile_image_is_one_by_one() {
        let g = TileGeometry::compute(&params(10, 12, 2, 16, 64, 16)).unwrap();
        assert_eq!((g.rows, g.cols), (1, 1));
        assert_eq!(g.tile_count(), 1);

        let tile = g.tile(TileCoord { row: 0, col: 0 });
        assert_eq!(
            tile.placement,
            Rect {
                x: 0,
                y: 0,
                width: 20,
                height: 24
            }
        );
    }

    #[test]
    fn test_rejects_tile_below_minimum() {
        // minimum = 2 * 8 + 8 + 1 = 25
        let err = TileGeometry::compute(&params(100, 100, 2, 16, 24, 16)).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("minimum 25"));

        assert!(TileGeometry::compute(&params(100, 100, 2, 16, 25, 16)).is_ok());
    }

    #[test]
    fn test_rejects_degenerate_inputs() {
        assert!(TileGeometry::compute(&params(0, 10, 2, 16, 64, 16))
            .unwrap_err()
            .is_configuration());
        assert!(TileGeometry::compute(&params(10, 10, 0, 16, 64, 16))
            .unwrap_err()
            .is_configuration());
        assert!(TileGeometry::compute(&params(10, 10, 2, 16, 0, 16))
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_rejects_overflow() {
        let err = TileGeometry::compute(&params(u32::MAX, 10, 4, 32, 64, 16)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_offset_not_divisible_by_scale_shifts_crop_origin() {
        let g = TileGeometry::compute(&params(50, 50, 4, 30, 64, 16)).unwrap();
        assert_eq!(g.input_offset, 8);
        assert_eq!(g.crop_origin, 2);

        let first = g.tile(TileCoord { row: 0, col: 0 });
        assert_eq!(first.placement.x, 0);
        assert_eq!(first.placement_origin, (2, 2));
    }

    #[test]
    fn test_placements_cover_output_without_gaps() {
        let cases = [
            (100, 100, 2, 16, 64, 16),
            (1, 1, 2, 16, 64, 16),
            (333, 77, 4, 32, 112, 16),
            (640, 480, 1, 8, 64, 16),
            (97, 203, 2, 36, 116, 16),
            (50, 50, 4, 30, 64, 16),
            (129, 64, 2, 16, 25, 16),
        ];

        for (w, h, scale, offset, tile, blend) in cases {
            let g = TileGeometry::compute(&params(w, h, scale, offset, tile, blend)).unwrap();
            let mut covered = vec![false; g.output_width as usize * g.output_height as usize];

            for t in g.tiles() {
                assert!(!t.placement.is_empty(), "empty placement for {:?}", t.coord);
                assert!(t.placement.right() <= g.output_width);
                assert!(t.placement.bottom() <= g.output_height);
                assert!(t.output.right() <= g.buffer_width);
                assert!(t.output.bottom() <= g.buffer_height);
                assert!(t.input.right() <= g.padded_width);
                assert!(t.input.bottom() <= g.padded_height);

                for y in t.placement.y..t.placement.bottom() {
                    for x in t.placement.x..t.placement.right() {
                        covered[y as usize * g.output_width as usize + x as usize] = true;
                    }
                }
            }

            assert!(
                covered.iter().all(|c| *c),
                "gap in coverage for {w}x{h} scale={scale} offset={offset} tile={tile}"
            );
        }
    }

    #[test]
    fn test_owned_pixels_partition_output() {
        for (w, h, scale, offset, tile) in [(100, 100, 2, 16, 64), (333, 77, 4, 32, 112), (5, 300, 1, 8, 40)] {
            let g = TileGeometry::compute(&params(w, h, scale, offset, tile, 16)).unwrap();
            let sum: u64 = g.coords().map(|c| g.owned_pixels(c)).sum();
            assert_eq!(sum, g.output_pixels());
            assert!(g.coords().all(|c| g.owned_pixels(c) > 0));
        }
    }

    #[test]
    fn test_tile_center_is_in_unpadded_space() {
        let g = TileGeometry::compute(&params(100, 100, 2, 16, 64, 16)).unwrap();
        assert_eq!(g.tile_center(TileCoord { row: 0, col: 0 }), (24.0, 24.0));
        assert_eq!(g.tile_center(TileCoord { row: 1, col: 2 }), (104.0, 64.0));
    }
}
