//! Utility image transforms used around the model call.
//!
//! [`ImageTransforms`] is the seam for the helper operations a render needs
//! besides the model itself. [`NativeTransforms`] implements them on the CPU
//! with `ndarray`; the ONNX runtime can provide graph-backed versions.

use anyhow::{bail, Result};
use ndarray::{s, Array2, Axis};

use crate::convert::Tensor;
use crate::geometry::Padding;
use crate::tta::TtaLevel;

pub trait ImageTransforms: Send + Sync {
    /// Pad the spatial axes of `x` by replicating edge pixels.
    fn pad(&self, x: &Tensor, padding: Padding) -> Result<Tensor>;

    /// Expand `[N, C, H, W]` into `[N * k, C, H, W]` augmented copies.
    fn tta_split(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor>;

    /// Undo the augmentations of a split batch and average them.
    fn tta_merge(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor>;

    /// Extend colour from visible pixels into transparent ones, `offset`
    /// pixels deep. `rgb` is `[1, 3, H, W]`, `alpha` is `[1, 1, H, W]`.
    fn alpha_border_pad(&self, rgb: &Tensor, alpha: &Tensor, offset: u32) -> Result<Tensor>;

    fn antialias(&self, x: &Tensor) -> Result<Tensor>;

    /// Blend kernel for a model output tile of `tile_size * scale - 2 * offset`
    /// pixels.
    fn create_blend_filter(
        &self,
        scale: u32,
        offset: u32,
        tile_size: u32,
        blend_size: u32,
    ) -> Result<Array2<f32>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTransforms;

impl ImageTransforms for NativeTransforms {
    fn pad(&self, x: &Tensor, padding: Padding) -> Result<Tensor> {
        let (n, c, h, w) = x.dim();
        if h == 0 || w == 0 {
            bail!("cannot pad an empty tensor {:?}", x.shape());
        }
        let Padding {
            left,
            right,
            top,
            bottom,
        } = padding;
        let (left, top) = (left as usize, top as usize);
        let out_h = h + top + bottom as usize;
        let out_w = w + left + right as usize;

        Ok(Tensor::from_shape_fn((n, c, out_h, out_w), |(b, ch, y, xx)| {
            let sy = y.saturating_sub(top).min(h - 1);
            let sx = xx.saturating_sub(left).min(w - 1);
            x[[b, ch, sy, sx]]
        }))
    }

    fn tta_split(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor> {
        let views: Vec<Tensor> = (0..level.augmentations())
            .map(|aug| flip(x, aug))
            .collect();
        let views: Vec<_> = views.iter().map(|v| v.view()).collect();
        Ok(ndarray::concatenate(Axis(0), &views)?)
    }

    fn tta_merge(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor> {
        let k = level.augmentations();
        let total = x.dim().0;
        if total == 0 || total % k != 0 {
            bail!("batch of {total} is not a multiple of {k} augmentations");
        }
        let n = total / k;

        let mut sum = Tensor::zeros((n, x.dim().1, x.dim().2, x.dim().3));
        for aug in 0..k {
            let part = x.slice(s![aug * n..(aug + 1) * n, .., .., ..]).to_owned();
            sum += &flip(&part, aug);
        }
        sum /= k as f32;
        Ok(sum)
    }

    fn alpha_border_pad(&self, rgb: &Tensor, alpha: &Tensor, offset: u32) -> Result<Tensor> {
        let (_, c, h, w) = rgb.dim();
        if alpha.dim() != (1, 1, h, w) {
            bail!(
                "alpha shape {:?} does not match colour shape {:?}",
                alpha.shape(),
                rgb.shape()
            );
        }

        let mut out = rgb.clone();
        let mut valid: Array2<bool> = Array2::from_shape_fn((h, w), |(y, x)| alpha[[0, 0, y, x]] > 0.0);

        for _ in 0..offset {
            let mut next_valid = valid.clone();
            let mut changed = false;
            let source = out.clone();

            for y in 0..h {
                for x in 0..w {
                    if valid[[y, x]] {
                        continue;
                    }
                    let mut acc = [0.0f32; 3];
                    let mut count = 0.0f32;
                    for ny in y.saturating_sub(1)..(y + 2).min(h) {
                        for nx in x.saturating_sub(1)..(x + 2).min(w) {
                            if valid[[ny, nx]] {
                                for (ch, a) in acc.iter_mut().enumerate().take(c) {
                                    *a += source[[0, ch, ny, nx]];
                                }
                                count += 1.0;
                            }
                        }
                    }
                    if count > 0.0 {
                        for (ch, a) in acc.iter().enumerate().take(c) {
                            out[[0, ch, y, x]] = a / count;
                        }
                        next_valid[[y, x]] = true;
                        changed = true;
                    }
                }
            }

            valid = next_valid;
            if !changed {
                break;
            }
        }

        Ok(out)
    }

    fn antialias(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = x.dim();
        let tap = |i: usize, d: isize, len: usize| (i as isize + d).clamp(0, len as isize - 1) as usize;

        let horizontal = Tensor::from_shape_fn((n, c, h, w), |(b, ch, y, xx)| {
            0.25 * x[[b, ch, y, tap(xx, -1, w)]] + 0.5 * x[[b, ch, y, xx]] + 0.25 * x[[b, ch, y, tap(xx, 1, w)]]
        });
        Ok(Tensor::from_shape_fn((n, c, h, w), |(b, ch, y, xx)| {
            0.25 * horizontal[[b, ch, tap(y, -1, h), xx]]
                + 0.5 * horizontal[[b, ch, y, xx]]
                + 0.25 * horizontal[[b, ch, tap(y, 1, h), xx]]
        }))
    }

    fn create_blend_filter(
        &self,
        scale: u32,
        offset: u32,
        tile_size: u32,
        blend_size: u32,
    ) -> Result<Array2<f32>> {
        let scaled = tile_size as u64 * scale as u64;
        let trim = offset as u64 * 2;
        if scaled <= trim {
            bail!("tile size {tile_size} at scale {scale} leaves no output after offset {offset}");
        }
        Ok(blend_ramp_kernel((scaled - trim) as usize, blend_size))
    }
}

/// Outer product of a 1-D ramp that rises over `blend_size` pixels from each
/// edge and is flat (1.0) in the middle. Strictly positive everywhere.
pub fn blend_ramp_kernel(size: usize, blend_size: u32) -> Array2<f32> {
    let ramp: Vec<f32> = (0..size)
        .map(|i| {
            let d = i.min(size - 1 - i) as f32;
            ((d + 1.0) / (blend_size as f32 + 1.0)).min(1.0)
        })
        .collect();
    Array2::from_shape_fn((size, size), |(y, x)| ramp[y] * ramp[x])
}

/// Augmentation `aug` of the TTA sequence: identity, horizontal flip,
/// vertical flip, both. Each one is its own inverse.
fn flip(x: &Tensor, aug: usize) -> Tensor {
    match aug {
        1 => x.slice(s![.., .., .., ..;-1]).to_owned(),
        2 => x.slice(s![.., .., ..;-1, ..]).to_owned(),
        3 => x.slice(s![.., .., ..;-1, ..;-1]).to_owned(),
        _ => x.clone(),
    }
}
