use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::convert::Tensor;
use crate::transforms::{ImageTransforms, NativeTransforms};

/// Stable identifier of a model file, `"{arch}/{style}/{name}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runs an image-to-image network on a batch of tiles.
///
/// Input is `[N, 3, tile, tile]`; output must be
/// `[N, 3, tile * scale - 2 * offset, tile * scale - 2 * offset]` for the
/// model's own scale and offset.
pub trait InferenceEngine: Send + Sync {
    fn run_model(&self, model: &ModelId, input: &Tensor) -> Result<Tensor>;
}

/// Collaborators shared by every job of a controller.
#[derive(Clone)]
pub struct RenderServices {
    pub engine: Arc<dyn InferenceEngine>,
    pub transforms: Arc<dyn ImageTransforms>,
}

impl RenderServices {
    pub fn new(engine: Arc<dyn InferenceEngine>, transforms: Arc<dyn ImageTransforms>) -> Self {
        Self { engine, transforms }
    }

    pub fn with_native_transforms(engine: Arc<dyn InferenceEngine>) -> Self {
        Self::new(engine, Arc::new(NativeTransforms))
    }
}

impl fmt::Debug for RenderServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderServices").finish_non_exhaustive()
    }
}
