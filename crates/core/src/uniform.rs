//! Single-colour tile detection.
//!
//! A tile whose whole capture (context included) is one colour upscales to
//! that same colour, so the model call can be skipped and the output built
//! directly.

use ndarray::{ArrayView4, Axis};

use crate::convert::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformColor {
    pub rgb: [f32; 3],
    /// Present when the alpha stream is being upscaled.
    pub alpha: Option<f32>,
}

impl UniformColor {
    /// Colour tensor and, when alpha is kept, the stretched alpha tensor of a
    /// `size` x `size` model output.
    pub fn solid_tensors(&self, size: usize) -> (Tensor, Option<Tensor>) {
        let rgb = Tensor::from_shape_fn((1, 3, size, size), |(_, c, _, _)| self.rgb[c]);
        let alpha = self
            .alpha
            .map(|a| Tensor::from_elem((1, 3, size, size), a));
        (rgb, alpha)
    }
}

/// Returns the colour when every pixel of `rgb` (`[1, 3, H, W]`) and of the
/// optional `alpha` (`[1, C, H, W]`, all channels) is bit-identical.
pub fn detect(rgb: ArrayView4<'_, f32>, alpha: Option<ArrayView4<'_, f32>>) -> Option<UniformColor> {
    let mut color = [0.0f32; 3];
    for (c, plane) in rgb.index_axis(Axis(0), 0).axis_iter(Axis(0)).enumerate().take(3) {
        color[c] = single_value(plane.iter())?;
    }

    let alpha = match alpha {
        Some(a) => Some(single_value(a.iter())?),
        None => None,
    };

    Some(UniformColor { rgb: color, alpha })
}

fn single_value<'a>(mut values: impl Iterator<Item = &'a f32>) -> Option<f32> {
    let first = *values.next()?;
    values
        .all(|v| v.to_bits() == first.to_bits())
        .then_some(first)
}
