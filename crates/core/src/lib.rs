//! Tiled neural image upscaling: geometry, dispatch, seam blending and the
//! job controller, plus the ONNX Runtime adapter.

pub mod blend;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod job;
pub mod logging;
pub mod model;
pub mod onnx;
pub mod runtime;
pub mod timer;
pub mod transforms;
pub mod tta;
pub mod uniform;

pub use convert::{RgbaImage, Tensor};
pub use dispatch::TileCoord;
pub use engine::{InferenceEngine, ModelId, RenderServices};
pub use error::RenderError;
pub use geometry::{GeometryParams, TileGeometry};
pub use job::{
    JobControl, JobController, JobOutcome, JobReport, JobSignal, JobState, LiveParams,
    RenderParams,
};
pub use transforms::{ImageTransforms, NativeTransforms};
pub use tta::TtaLevel;
