//! Test-time augmentation.
//!
//! A tile is expanded into flipped copies before inference and the model
//! outputs are flipped back and averaged afterwards.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::convert::Tensor;
use crate::transforms::ImageTransforms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TtaLevel {
    #[default]
    Off,
    Two,
    Four,
}

impl TtaLevel {
    /// Number of augmented copies per input image.
    pub fn augmentations(self) -> usize {
        match self {
            TtaLevel::Off => 1,
            TtaLevel::Two => 2,
            TtaLevel::Four => 4,
        }
    }

    pub fn is_enabled(self) -> bool {
        self != TtaLevel::Off
    }
}

impl TryFrom<u8> for TtaLevel {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(TtaLevel::Off),
            2 => Ok(TtaLevel::Two),
            4 => Ok(TtaLevel::Four),
            other => Err(format!("unsupported TTA level {other}, expected 0, 2 or 4")),
        }
    }
}

impl From<TtaLevel> for u8 {
    fn from(level: TtaLevel) -> Self {
        match level {
            TtaLevel::Off => 0,
            TtaLevel::Two => 2,
            TtaLevel::Four => 4,
        }
    }
}

impl fmt::Display for TtaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

#[derive(Clone)]
pub struct TtaFolder {
    transforms: Arc<dyn ImageTransforms>,
    level: TtaLevel,
}

impl TtaFolder {
    pub fn new(transforms: Arc<dyn ImageTransforms>, level: TtaLevel) -> Self {
        Self { transforms, level }
    }

    pub fn level(&self) -> TtaLevel {
        self.level
    }

    pub fn split(&self, x: Tensor) -> Result<Tensor> {
        if !self.level.is_enabled() {
            return Ok(x);
        }
        self.transforms.tta_split(&x, self.level)
    }

    pub fn merge(&self, x: Tensor) -> Result<Tensor> {
        if !self.level.is_enabled() {
            return Ok(x);
        }
        self.transforms.tta_merge(&x, self.level)
    }
}

impl fmt::Debug for TtaFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtaFolder").field("level", &self.level).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::NativeTransforms;

    fn gradient() -> Tensor {
        Tensor::from_shape_fn((1, 3, 5, 7), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(TtaLevel::try_from(0).unwrap(), TtaLevel::Off);
        assert_eq!(TtaLevel::try_from(4).unwrap(), TtaLevel::Four);
        assert!(TtaLevel::try_from(3).is_err());
        assert_eq!(TtaLevel::Two.to_string(), "2");

        let parsed: TtaLevel = serde_json::from_str("2").unwrap();
        assert_eq!(parsed, TtaLevel::Two);
        assert!(serde_json::from_str::<TtaLevel>("8").is_err());
    }

    #[test]
    fn test_off_is_identity() {
        let folder = TtaFolder::new(Arc::new(NativeTransforms), TtaLevel::Off);
        let x = gradient();
        assert_eq!(folder.split(x.clone()).unwrap(), x);
        assert_eq!(folder.merge(x.clone()).unwrap(), x);
    }

    #[test]
    fn test_split_then_merge_round_trips() {
        for level in [TtaLevel::Two, TtaLevel::Four] {
            let folder = TtaFolder::new(Arc::new(NativeTransforms), level);
            let x = gradient();

            let split = folder.split(x.clone()).unwrap();
            assert_eq!(split.shape()[0], level.augmentations());

            let merged = folder.merge(split).unwrap();
            assert_eq!(merged, x, "round trip failed for level {level}");
        }
    }
}
