//! Conversions between interleaved RGBA8 images and planar `f32` tensors.


use ndarray::{Array4, ArrayView3, ArrayView4, Axis};

use crate::error::{config_bail, RenderError};

/// NCHW float tensor, values normalised to `0.0..=1.0`.
pub type Tensor = Array4<f32>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbaImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, RenderError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            config_bail!(
                "RGBA buffer for {width}x{height} must be {expected} bytes, got {}",
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Fully transparent black image.
    pub fn blank(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]
    }
}

pub fn has_transparency(image: &RgbaImage) -> bool {
    image.data.chunks_exact(4).any(|px| px[3] != 255)
}

/// Colour planes composited over `background`; alpha is discarded.
pub fn to_rgb(image: &RgbaImage, background: [f32; 3]) -> Tensor {
    let (w, h) = (image.width as usize, image.height as usize);
    let mut rgb = Tensor::zeros((1, 3, h, w));
    for (i, px) in image.data.chunks_exact(4).enumerate() {
        let (y, x) = (i / w, i % w);
        let alpha = px[3] as f32 / 255.0;
        for c in 0..3 {
            let bg = background[c];
            rgb[[0, c, y, x]] = bg + (px[c] as f32 / 255.0 - bg) * alpha;
        }
    }
    rgb
}

/// Straight (non-premultiplied) colour planes and a single alpha plane.
pub fn to_rgb_alpha(image: &RgbaImage) -> (Tensor, Tensor) {
    let (w, h) = (image.width as usize, image.height as usize);
    let mut rgb = Tensor::zeros((1, 3, h, w));
    let mut alpha = Tensor::zeros((1, 1, h, w));
    for (i, px) in image.data.chunks_exact(4).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            rgb[[0, c, y, x]] = px[c] as f32 / 255.0;
        }
        alpha[[0, 0, y, x]] = px[3] as f32 / 255.0;
    }
    (rgb, alpha)
}

/// Repeat a `[N, 1, H, W]` alpha plane into three channels so it can go
/// through a colour model.
pub fn stretch_alpha(alpha: &Tensor) -> Tensor {
    let (n, _, h, w) = alpha.dim();
    Tensor::from_shape_fn((n, 3, h, w), |(b, _, y, x)| alpha[[b, 0, y, x]])
}

/// Mean of the three stretched alpha channels.
pub fn squeeze_alpha(alpha: &Tensor) -> Tensor {
    alpha
        .mean_axis(Axis(1))
        .map(|m| m.insert_axis(Axis(1)))
        .unwrap_or_else(|| alpha.clone())
}

/// Stack single-image tensors along the batch axis.
pub fn batch(images: &[ArrayView4<'_, f32>]) -> Result<Tensor, RenderError> {
    if images.iter().any(|t| t.dim().0 != 1) {
        config_bail!("image already batched");
    }
    ndarray::concatenate(Axis(0), images)
        .map_err(|e| RenderError::config(format!("cannot batch tensors: {e}")))
}

pub fn unbatch(batch: &Tensor) -> Vec<Tensor> {
    batch
        .axis_iter(Axis(0))
        .map(|item| item.insert_axis(Axis(0)).to_owned())
        .collect()
}

const SRGB_KNEE: f32 = 0.039_285_7;
const SRGB_SLOPE: f32 = 12.923_21;

pub fn srgb_to_linear(v: f32) -> f32 {
    if v > SRGB_KNEE {
        ((v + 0.055) / 1.055).powf(2.4)
    } else {
        v / SRGB_SLOPE
    }
}

pub fn linear_to_srgb(v: f32) -> f32 {
    if v > SRGB_KNEE / SRGB_SLOPE {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    } else {
        v * SRGB_SLOPE
    }
}

pub fn tensor_srgb_to_linear(t: &mut Tensor) {
    t.mapv_inplace(srgb_to_linear);
}

/// Replace the colour under pixels whose alpha is at or below `threshold`
/// with the colour of the nearest visible edge pixel.
pub fn bleed_edges(rgb: &mut Tensor, alpha: &Tensor, threshold: f32) {
    let (_, _, h, w) = rgb.dim();
    let visible = |y: usize, x: usize| alpha[[0, 0, y, x]] > threshold;

    let mut edges: Vec<(usize, usize, [f32; 3])> = Vec::new();
    let mut hidden: Vec<(usize, usize)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            if !visible(y, x) {
                hidden.push((y, x));
                continue;
            }
            let touches_hidden = (x > 0 && !visible(y, x - 1))
                || (x + 1 < w && !visible(y, x + 1))
                || (y > 0 && !visible(y - 1, x))
                || (y + 1 < h && !visible(y + 1, x));
            if touches_hidden {
                edges.push((y, x, [rgb[[0, 0, y, x]], rgb[[0, 1, y, x]], rgb[[0, 2, y, x]]]));
            }
        }
    }

    // Nearest edge pixel by squared euclidean distance; the first one wins ties.
    for (y, x) in hidden {
        let nearest = edges.iter().min_by_key(|(ey, ex, _)| {
            let dy = *ey as i64 - y as i64;
            let dx = *ex as i64 - x as i64;
            dy * dy + dx * dx
        });
        let Some((_, _, colour)) = nearest else {
            return;
        };
        for (c, v) in colour.iter().enumerate() {
            rgb[[0, c, y, x]] = *v;
        }
    }
}

fn quantize(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Write a `[C, h, w]` block into `image` at `(x, y)`. Channels 0..3 are
/// colour; channel 3, when present, is alpha. Without it the written pixels
/// are opaque.
pub fn write_region(image: &mut RgbaImage, block: ArrayView3<'_, f32>, at: (u32, u32), linear_light: bool) {
    let (channels, h, w) = block.dim();
    let stride = image.width as usize;
    for row in 0..h {
        let y = at.1 as usize + row;
        if y >= image.height as usize {
            break;
        }
        for col in 0..w {
            let x = at.0 as usize + col;
            if x >= stride {
                break;
            }
            let i = (y * stride + x) * 4;
            for c in 0..3 {
                let v = block[[c, row, col]];
                image.data[i + c] = quantize(if linear_light { linear_to_srgb(v) } else { v });
            }
            image.data[i + 3] = if channels > 3 {
                quantize(block[[3, row, col]])
            } else {
                255
            };
        }
    }
}

/// Whole-tensor conversion of the first batch item back to RGBA8. `alpha`
/// is the stretched three-channel alpha.
pub fn tensor_to_rgba(rgb: &Tensor, alpha: Option<&Tensor>) -> Result<RgbaImage, RenderError> {
    let (n, c, h, w) = rgb.dim();
    if n == 0 || c != 3 {
        config_bail!("expected a [1, 3, H, W] tensor, got {:?}", rgb.shape());
    }

    let block = match alpha {
        Some(a) => {
            if a.dim() != (n, 3, h, w) {
                config_bail!("alpha shape {:?} does not match colour shape {:?}", a.shape(), rgb.shape());
            }
            let squeezed = squeeze_alpha(a);
            ndarray::concatenate(Axis(1), &[rgb.view(), squeezed.view()])
                .map_err(|e| RenderError::config(format!("cannot combine colour and alpha: {e}")))?
        }
        None => rgb.clone(),
    };

    let mut image = RgbaImage::blank(w as u32, h as u32);
    write_region(&mut image, block.index_axis(Axis(0), 0), (0, 0), false);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RgbaImage {
        RgbaImage::new(
            2,
            1,
            vec![
                255, 0, 0, 255, //
                0, 0, 255, 0,
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_new_validates_length() {
        let err = RgbaImage::new(2, 2, vec![0; 15]).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_to_rgb_composites_over_background() {
        let rgb = to_rgb(&sample(), [1.0, 1.0, 1.0]);
        assert_eq!(rgb.shape(), &[1, 3, 1, 2]);
        assert_eq!(rgb[[0, 0, 0, 0]], 1.0);
        assert_eq!(rgb[[0, 1, 0, 0]], 0.0);
        // fully transparent pixel takes the background
        assert_eq!(rgb[[0, 0, 0, 1]], 1.0);
        assert_eq!(rgb[[0, 2, 0, 1]], 1.0);
    }

    #[test]
    fn test_alpha_stretch_and_squeeze() {
        let (rgb, alpha) = to_rgb_alpha(&sample());
        assert_eq!(rgb[[0, 2, 0, 1]], 1.0);
        assert_eq!(alpha.shape(), &[1, 1, 1, 2]);

        let stretched = stretch_alpha(&alpha);
        assert_eq!(stretched.shape(), &[1, 3, 1, 2]);
        assert_eq!(stretched[[0, 2, 0, 0]], 1.0);

        let squeezed = squeeze_alpha(&stretched);
        assert_eq!(squeezed, alpha);
    }

    #[test]
    fn test_has_transparency() {
        assert!(has_transparency(&sample()));
        assert!(!has_transparency(&RgbaImage::new(1, 1, vec![1, 2, 3, 255]).unwrap()));
    }

    #[test]
    fn test_batch_unbatch() {
        let a = Tensor::from_elem((1, 3, 2, 2), 0.25);
        let b = Tensor::from_elem((1, 3, 2, 2), 0.75);
        let batched = batch(&[a.view(), b.view()]).unwrap();
        assert_eq!(batched.shape(), &[2, 3, 2, 2]);

        let parts = unbatch(&batched);
        assert_eq!(parts, vec![a, b]);

        assert!(batch(&[batched.view()]).is_err());
    }

    #[test]
    fn test_srgb_linear_round_trip_bytes() {
        for byte in 0..=255u8 {
            let v = byte as f32 / 255.0;
            assert_eq!(quantize(linear_to_srgb(srgb_to_linear(v))), byte);
        }
    }

    #[test]
    fn test_bleed_edges_fills_invisible_pixels() {
        let image = RgbaImage::new(
            3,
            1,
            vec![
                10, 20, 30, 255, //
                0, 0, 0, 0, //
                0, 0, 0, 0,
            ],
        )
        .unwrap();
        let (mut rgb, alpha) = to_rgb_alpha(&image);
        bleed_edges(&mut rgb, &alpha, 0.5);
        assert_eq!(rgb[[0, 0, 0, 2]], 10.0 / 255.0);
        assert_eq!(rgb[[0, 2, 0, 1]], 30.0 / 255.0);
    }

    #[test]
    fn test_bleed_edges_uses_euclidean_distance() {
        // (0,0) is 3 steps from A along the row but closer to B as the crow flies.
        let mut bytes = vec![0u8; 4 * 4 * 4];
        let mut put = |x: usize, y: usize, rgba: [u8; 4]| {
            let i = (y * 4 + x) * 4;
            bytes[i..i + 4].copy_from_slice(&rgba);
        };
        put(3, 0, [255, 0, 0, 255]);
        put(2, 2, [0, 0, 255, 255]);
        let image = RgbaImage::new(4, 4, bytes).unwrap();
        let (mut rgb, alpha) = to_rgb_alpha(&image);
        bleed_edges(&mut rgb, &alpha, 0.5);
        assert_eq!(rgb[[0, 2, 0, 0]], 1.0);
        assert_eq!(rgb[[0, 0, 0, 0]], 0.0);
        assert_eq!(rgb[[0, 0, 0, 2]], 1.0);
    }

    #[test]
    fn test_tensor_to_rgba_round_trip() {
        let image = sample();
        let (rgb, alpha) = to_rgb_alpha(&image);
        let back = tensor_to_rgba(&rgb, Some(&stretch_alpha(&alpha))).unwrap();
        assert_eq!(back, image);

        let opaque = tensor_to_rgba(&rgb, None).unwrap();
        assert_eq!(opaque.pixel(1, 0), [0, 0, 255, 255]);
    }
}
