//! Error taxonomy for a render job.
//!
//! Collaborators (engines, transforms, config) speak `anyhow`; the job
//! boundary folds their failures into [`RenderError`] so callers can tell a
//! bad configuration from a failed inference. A user-requested stop is not
//! an error and never shows up here.

use thiserror::Error;

use crate::dispatch::{TileCoord, TileState};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum RenderError {
    /// Invalid tile/scale/offset combination, detected before any work starts.
    #[error("invalid render configuration: {0}")]
    Configuration(String),

    /// An external model or transform call failed.
    #[error("inference failed during {stage}")]
    Inference {
        stage: &'static str,
        #[source]
        source: BoxError,
    },

    /// An external call returned a tensor of the wrong shape.
    #[error("{stage} returned shape {actual:?}, expected {expected:?}")]
    UnexpectedShape {
        stage: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tile {coord} cannot be {action} while {state:?}")]
    TileState {
        coord: TileCoord,
        state: TileState,
        action: &'static str,
    },

    #[error("a render job is already running on this controller")]
    Busy,
}

impl RenderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn inference(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Inference {
            stage,
            source: source.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_inference(&self) -> bool {
        matches!(self, Self::Inference { .. } | Self::UnexpectedShape { .. })
    }
}

/// Bail out of a function returning `Result<_, RenderError>` with a
/// configuration error.
macro_rules! config_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::RenderError::config(format!($($arg)*)))
    };
}

pub(crate) use config_bail;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RenderError::config("tile too small").is_configuration());
        assert!(!RenderError::config("tile too small").is_inference());

        let err = RenderError::inference("model", anyhow::anyhow!("session died"));
        assert!(err.is_inference());
        assert_eq!(err.to_string(), "inference failed during model");

        let source = std::error::Error::source(&err).expect("source should be kept");
        assert_eq!(source.to_string(), "session died");

        let shape = RenderError::UnexpectedShape {
            stage: "model",
            expected: vec![1, 3, 96, 96],
            actual: vec![1, 3, 128, 128],
        };
        assert!(shape.is_inference());
        assert!(shape.to_string().contains("[1, 3, 128, 128]"));
    }
}
