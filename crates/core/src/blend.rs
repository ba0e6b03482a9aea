//! Seam blending.
//!
//! Overlapping tile outputs are folded into a full-size accumulation buffer as
//! a running weighted mean. Each pixel keeps the sum of the kernel weights it
//! has seen; a new sample `t` with weight `k` updates it as
//!
//! ```text
//! w' = w + k
//! f  = w / w'
//! p' = p * f + t * (1 - f)
//! ```
//!
//! so the final value is independent of the order tiles arrive in.

use ndarray::{s, Array2, Array3, Axis};

use crate::convert::Tensor;
use crate::error::{config_bail, RenderError};
use crate::geometry::{TileDescriptor, TileGeometry};

#[derive(Debug)]
pub struct SeamBlender {
    channels: usize,
    tile_size: usize,
    crop_origin: usize,
    output_width: usize,
    output_height: usize,
    kernel: Array2<f32>,
    pixels: Array3<f32>,
    weights: Array2<f32>,
}

impl SeamBlender {
    pub fn new(geometry: &TileGeometry, channels: usize, kernel: Array2<f32>) -> Result<Self, RenderError> {
        let size = geometry.output_tile_size as usize;
        if channels == 0 {
            config_bail!("blend buffer needs at least one channel");
        }
        validate_kernel(&kernel, size)?;

        let (bh, bw) = (geometry.buffer_height as usize, geometry.buffer_width as usize);
        tracing::debug!(
            buffer_width = bw,
            buffer_height = bh,
            channels,
            tile_size = size,
            "Allocating blend buffer"
        );

        Ok(Self {
            channels,
            tile_size: size,
            crop_origin: geometry.crop_origin as usize,
            output_width: geometry.output_width as usize,
            output_height: geometry.output_height as usize,
            kernel,
            pixels: Array3::zeros((channels, bh, bw)),
            weights: Array2::zeros((bh, bw)),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Fold one tile output (`[1, C, S, S]`) into the buffer and return the
    /// blended values of the tile footprint in the same shape.
    pub fn blend(&mut self, tile_output: &Tensor, tile: &TileDescriptor) -> Result<Tensor, RenderError> {
        let expected = [1, self.channels, self.tile_size, self.tile_size];
        if tile_output.shape() != expected {
            return Err(RenderError::UnexpectedShape {
                stage: "blend",
                expected: expected.to_vec(),
                actual: tile_output.shape().to_vec(),
            });
        }

        let (x0, y0) = (tile.output.x as usize, tile.output.y as usize);
        let size = self.tile_size;
        let mut result = Tensor::zeros((1, self.channels, size, size));

        for ty in 0..size {
            for tx in 0..size {
                let (by, bx) = (y0 + ty, x0 + tx);
                let old = self.weights[[by, bx]];
                let next = old + self.kernel[[ty, tx]];
                let f = if next > 0.0 { old / next } else { 0.0 };

                for c in 0..self.channels {
                    let blended = self.pixels[[c, by, bx]] * f + tile_output[[0, c, ty, tx]] * (1.0 - f);
                    self.pixels[[c, by, bx]] = blended;
                    result[[0, c, ty, tx]] = blended;
                }
                self.weights[[by, bx]] = next;
            }
        }

        Ok(result)
    }

    pub fn weight_sum(&self) -> f64 {
        self.weights.iter().map(|w| *w as f64).sum()
    }

    /// Accumulated weight at a blend-buffer coordinate.
    pub fn weight_at(&self, x: usize, y: usize) -> Option<f32> {
        self.weights.get([y, x]).copied()
    }

    pub fn pixels(&self) -> &Array3<f32> {
        &self.pixels
    }

    /// The final image region of the buffer as `[1, C, H*scale, W*scale]`.
    pub fn crop_output(&self) -> Tensor {
        let (o, w, h) = (self.crop_origin, self.output_width, self.output_height);
        self.pixels
            .slice(s![.., o..o + h, o..o + w])
            .to_owned()
            .insert_axis(Axis(0))
    }
}

fn validate_kernel(kernel: &Array2<f32>, size: usize) -> Result<(), RenderError> {
    if kernel.dim() != (size, size) {
        config_bail!(
            "blend kernel is {:?}, expected {size}x{size}",
            kernel.shape()
        );
    }
    if kernel.iter().any(|k| !k.is_finite() || *k < 0.0) {
        config_bail!("blend kernel must be finite and non-negative");
    }
    if kernel[[size / 2, size / 2]] <= 0.0 {
        config_bail!("blend kernel must be positive at the centre");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::TileCoord;
    use crate::geometry::GeometryParams;
    use crate::transforms::blend_ramp_kernel;

    fn geometry() -> TileGeometry {
        TileGeometry::compute(&GeometryParams {
            input_width: 100,
            input_height: 100,
            scale: 2,
            offset: 16,
            tile_size: 64,
            blend_size: 16,
        })
        .unwrap()
    }

    fn constant_tile(value: f32) -> Tensor {
        Tensor::from_elem((1, 3, 96, 96), value)
    }

    #[test]
    fn test_single_sample_is_exact() {
        let g = geometry();
        let mut blender = SeamBlender::new(&g, 3, blend_ramp_kernel(96, 16)).unwrap();
        let tile = g.tile(TileCoord { row: 0, col: 0 });

        let out = blender.blend(&constant_tile(0.4), &tile).unwrap();
        assert!(out.iter().all(|v| (*v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_overlap_is_weighted_mean() {
        let g = geometry();
        let kernel = Array2::from_elem((96, 96), 1.0);
        let mut blender = SeamBlender::new(&g, 3, kernel).unwrap();

        blender
            .blend(&constant_tile(0.2), &g.tile(TileCoord { row: 0, col: 0 }))
            .unwrap();
        let out = blender
            .blend(&constant_tile(0.6), &g.tile(TileCoord { row: 0, col: 1 }))
            .unwrap();

        // tile (0, 1) starts at x = 80; columns 0..16 overlap tile (0, 0)
        assert!((out[[0, 0, 0, 0]] - 0.4).abs() < 1e-6);
        assert!((out[[0, 0, 0, 20]] - 0.6).abs() < 1e-6);
        assert_eq!(blender.weight_at(85, 10), Some(2.0));
        assert_eq!(blender.weight_at(100, 10), Some(1.0));
    }

    #[test]
    fn test_blend_is_order_independent() {
        let g = geometry();
        let tiles: Vec<_> = g.tiles().collect();
        let values: Vec<f32> = (0..tiles.len()).map(|i| i as f32 / 10.0).collect();

        let mut forward = SeamBlender::new(&g, 3, blend_ramp_kernel(96, 16)).unwrap();
        for (tile, value) in tiles.iter().zip(&values) {
            forward.blend(&constant_tile(*value), tile).unwrap();
        }

        let mut reverse = SeamBlender::new(&g, 3, blend_ramp_kernel(96, 16)).unwrap();
        for (tile, value) in tiles.iter().zip(&values).rev() {
            reverse.blend(&constant_tile(*value), tile).unwrap();
        }

        let diff = forward
            .crop_output()
            .iter()
            .zip(reverse.crop_output().iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(diff < 1e-5, "max difference {diff}");
        assert!((forward.weight_sum() - reverse.weight_sum()).abs() < 1e-3);
    }

    #[test]
    fn test_weight_sum_grows_by_kernel_sum() {
        let g = geometry();
        let kernel = blend_ramp_kernel(96, 16);
        let kernel_sum: f64 = kernel.iter().map(|k| *k as f64).sum();
        let mut blender = SeamBlender::new(&g, 3, kernel).unwrap();

        for (n, tile) in g.tiles().enumerate() {
            blender.blend(&constant_tile(0.5), &tile).unwrap();
            let expected = kernel_sum * (n + 1) as f64;
            assert!((blender.weight_sum() - expected).abs() < 1e-2 * (n + 1) as f64);
        }
    }

    #[test]
    fn test_wrong_tile_shape_is_inference_error() {
        let g = geometry();
        let mut blender = SeamBlender::new(&g, 3, blend_ramp_kernel(96, 16)).unwrap();
        let err = blender
            .blend(
                &Tensor::zeros((1, 3, 128, 128)),
                &g.tile(TileCoord { row: 0, col: 0 }),
            )
            .unwrap_err();
        assert!(err.is_inference());
    }

    #[test]
    fn test_rejects_bad_kernels() {
        let g = geometry();
        assert!(SeamBlender::new(&g, 3, Array2::ones((95, 96))).is_err());
        assert!(SeamBlender::new(&g, 3, Array2::from_elem((96, 96), -1.0)).is_err());
        assert!(SeamBlender::new(&g, 3, Array2::zeros((96, 96))).is_err());

        let mut nan = Array2::ones((96, 96));
        nan[[3, 3]] = f32::NAN;
        assert!(SeamBlender::new(&g, 3, nan).unwrap_err().is_configuration());
    }

    #[test]
    fn test_crop_output_shape() {
        let g = geometry();
        let blender = SeamBlender::new(&g, 4, blend_ramp_kernel(96, 16)).unwrap();
        assert_eq!(blender.crop_output().shape(), &[1, 4, 200, 200]);
        assert_eq!(blender.pixels().shape(), &[4, 288, 288]);
    }
}
