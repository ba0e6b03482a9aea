//! ONNX Runtime backed engine and utility transforms.
//!
//! Sessions are built on first use and cached per model path for the life of
//! the runtime. Utility graphs (`utils/*.onnx`) are optional: when one is not
//! installed the matching [`NativeTransforms`] operation is used instead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array0, Array2, ArrayD, Axis, Ix4, IxDyn};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionOutputs};
use ort::value::Tensor as OrtTensor;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::convert::Tensor;
use crate::engine::{InferenceEngine, ModelId};
use crate::geometry::{Padding, DEFAULT_BLEND_SIZE};
use crate::model::ModelCatalog;
use crate::transforms::{ImageTransforms, NativeTransforms};
use crate::tta::TtaLevel;

/// Execution provider selection.
///
/// `Tensorrt` registers CUDA as a fallback; `Cuda` falls back to the CPU
/// provider when CUDA is unavailable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let path = config.model_path;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config.trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            let cache_path = cache_dir.to_string_lossy().to_string();
            info!(
                model = %path.display(),
                cache_dir = %cache_dir.display(),
                "Building TensorRT session (first run may take several minutes)"
            );

            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load ONNX model: {}", path.display()))?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", model = %path.display(), "Building session");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load ONNX model: {}", path.display()))?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", model = %path.display(), "Building session");
            builder
                .commit_from_file(path)
                .with_context(|| format!("Failed to load ONNX model: {}", path.display()))?
        }
    };

    Ok(session)
}

struct LoadedSession {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
}

pub struct OnnxRuntime {
    catalog: ModelCatalog,
    backend: InferenceBackend,
    trt_cache_dir: Option<PathBuf>,
    sessions: DashMap<PathBuf, Arc<LoadedSession>>,
    native: NativeTransforms,
}

impl OnnxRuntime {
    pub fn new(catalog: ModelCatalog, backend: InferenceBackend) -> Self {
        Self {
            catalog,
            backend,
            trt_cache_dir: None,
            sessions: DashMap::new(),
            native: NativeTransforms,
        }
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session(&self, path: &Path) -> Result<Arc<LoadedSession>> {
        if let Some(loaded) = self.sessions.get(path) {
            return Ok(loaded.value().clone());
        }
        if !path.is_file() {
            bail!("model file {} not found", path.display());
        }

        let entry = self.sessions.entry(path.to_path_buf()).or_try_insert_with(|| {
            let session = build_session(&SessionConfig {
                model_path: path,
                backend: self.backend,
                trt_cache_dir: self.trt_cache_dir.as_deref(),
            })?;

            let input_name = session
                .inputs()
                .first()
                .map(|input| input.name().to_string())
                .ok_or_else(|| anyhow!("model {} has no inputs", path.display()))?;
            let output_name = session
                .outputs()
                .first()
                .map(|output| output.name().to_string())
                .ok_or_else(|| anyhow!("model {} has no outputs", path.display()))?;
            let is_fp16 = match session.inputs()[0].dtype() {
                ort::value::ValueType::Tensor { ty, .. } => *ty == ort::tensor::TensorElementType::Float16,
                _ => false,
            };

            info!(
                model = %path.display(),
                backend = %self.backend,
                input = %input_name,
                output = %output_name,
                is_fp16,
                "Loaded ONNX session"
            );

            Ok::<_, anyhow::Error>(Arc::new(LoadedSession {
                session: Mutex::new(session),
                input_name,
                output_name,
                is_fp16,
            }))
        })?;

        Ok(entry.value().clone())
    }

    fn with_session<T>(&self, path: &Path, f: impl FnOnce(&mut Session, &LoadedSession) -> Result<T>) -> Result<T> {
        let loaded = self.session(path)?;
        let mut session = loaded
            .session
            .lock()
            .map_err(|_| anyhow!("session for {} is poisoned", path.display()))?;
        f(&mut session, &loaded)
    }

    /// Path of an installed utility graph.
    fn utility(&self, name: &str) -> Option<PathBuf> {
        let path = self.catalog.utility_path(name);
        if path.is_file() {
            Some(path)
        } else {
            debug!(utility = name, path = %path.display(), "Utility graph not installed; using native transform");
            None
        }
    }
}

fn scalar(value: i64) -> Result<OrtTensor<i64>> {
    Ok(OrtTensor::from_array(Array0::from_elem((), value))?)
}

fn extract4(outputs: &SessionOutputs<'_>, name: &str) -> Result<Tensor> {
    let view = outputs[name].try_extract_array::<f32>()?;
    let owned = view.to_owned();
    let owned = match owned.ndim() {
        3 => owned.insert_axis(Axis(0)),
        4 => owned,
        n => bail!("output '{name}' has {n} dimensions, expected 3 or 4"),
    };
    Ok(owned.into_dimensionality::<Ix4>()?)
}

fn run_f32(session: &mut Session, loaded: &LoadedSession, input: &Tensor) -> Result<Tensor> {
    let input_tensor = OrtTensor::from_array(input.clone())?;
    let outputs = session.run(ort::inputs![loaded.input_name.as_str() => &input_tensor])?;
    extract4(&outputs, &loaded.output_name)
}

fn run_fp16(session: &mut Session, loaded: &LoadedSession, input: &Tensor) -> Result<Tensor> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(IxDyn(input.shape()), fp16_data)?;
    let input_tensor = OrtTensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![loaded.input_name.as_str() => &input_tensor])?;
    let output_view = outputs[loaded.output_name.as_str()].try_extract_array::<f16>()?;

    let shape = output_view.shape().to_vec();
    let fp16_owned = output_view.as_standard_layout().into_owned();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("model output is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(IxDyn(&shape), f32_data)?.into_dimensionality::<Ix4>()?)
}

impl InferenceEngine for OnnxRuntime {
    fn run_model(&self, model: &ModelId, input: &Tensor) -> Result<Tensor> {
        let path = self.catalog.model_path(model);
        self.with_session(&path, |session, loaded| {
            if loaded.is_fp16 {
                run_fp16(session, loaded, input)
            } else {
                run_f32(session, loaded, input)
            }
        })
        .with_context(|| format!("model {model} failed"))
    }
}

impl ImageTransforms for OnnxRuntime {
    fn pad(&self, x: &Tensor, padding: Padding) -> Result<Tensor> {
        let Some(path) = self.utility("pad") else {
            return self.native.pad(x, padding);
        };
        self.with_session(&path, |session, loaded| {
            let input = OrtTensor::from_array(x.clone())?;
            let outputs = session.run(ort::inputs![
                "x" => &input,
                "left" => &scalar(padding.left as i64)?,
                "right" => &scalar(padding.right as i64)?,
                "top" => &scalar(padding.top as i64)?,
                "bottom" => &scalar(padding.bottom as i64)?
            ])?;
            extract4(&outputs, &loaded.output_name)
        })
    }

    fn tta_split(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor> {
        let Some(path) = self.utility("tta_split") else {
            return self.native.tta_split(x, level);
        };
        self.with_session(&path, |session, loaded| {
            let input = OrtTensor::from_array(x.clone())?;
            let outputs = session.run(ort::inputs![
                "x" => &input,
                "tta_level" => &scalar(u8::from(level) as i64)?
            ])?;
            extract4(&outputs, &loaded.output_name)
        })
    }

    fn tta_merge(&self, x: &Tensor, level: TtaLevel) -> Result<Tensor> {
        let Some(path) = self.utility("tta_merge") else {
            return self.native.tta_merge(x, level);
        };
        self.with_session(&path, |session, loaded| {
            let input = OrtTensor::from_array(x.clone())?;
            let outputs = session.run(ort::inputs![
                "x" => &input,
                "tta_level" => &scalar(u8::from(level) as i64)?
            ])?;
            extract4(&outputs, &loaded.output_name)
        })
    }

    fn alpha_border_pad(&self, rgb: &Tensor, alpha: &Tensor, offset: u32) -> Result<Tensor> {
        let Some(path) = self.utility("alpha_border_padding") else {
            return self.native.alpha_border_pad(rgb, alpha, offset);
        };
        self.with_session(&path, |session, loaded| {
            // the graph works on unbatched [C, H, W] planes
            let rgb = OrtTensor::from_array(rgb.index_axis(Axis(0), 0).to_owned())?;
            let alpha = OrtTensor::from_array(alpha.index_axis(Axis(0), 0).to_owned())?;
            let outputs = session.run(ort::inputs![
                "rgb" => &rgb,
                "alpha" => &alpha,
                "offset" => &scalar(offset as i64)?
            ])?;
            extract4(&outputs, &loaded.output_name)
        })
    }

    fn antialias(&self, x: &Tensor) -> Result<Tensor> {
        let Some(path) = self.utility("antialias") else {
            return self.native.antialias(x);
        };
        self.with_session(&path, |session, loaded| {
            let input = OrtTensor::from_array(x.clone())?;
            let outputs = session.run(ort::inputs!["x" => &input])?;
            extract4(&outputs, &loaded.output_name)
        })
    }

    fn create_blend_filter(&self, scale: u32, offset: u32, tile_size: u32, blend_size: u32) -> Result<Array2<f32>> {
        // the filter graph bakes in the default blend size
        if blend_size != DEFAULT_BLEND_SIZE {
            return self.native.create_blend_filter(scale, offset, tile_size, blend_size);
        }
        let Some(path) = self.utility("create_seam_blending_filter") else {
            return self.native.create_blend_filter(scale, offset, tile_size, blend_size);
        };

        self.with_session(&path, |session, loaded| {
            let outputs = session.run(ort::inputs![
                "scale" => &scalar(scale as i64)?,
                "offset" => &scalar(offset as i64)?,
                "tile_size" => &scalar(tile_size as i64)?
            ])?;
            let view = outputs[loaded.output_name.as_str()].try_extract_array::<f32>()?;
            let shape = view.shape();
            if shape.len() < 2 {
                bail!("blend filter has shape {shape:?}, expected at least 2 dimensions");
            }
            let (h, w) = (shape[shape.len() - 2], shape[shape.len() - 1]);
            let values: Vec<f32> = view.iter().take(h * w).copied().collect();
            Ok(Array2::from_shape_vec((h, w), values)?)
        })
    }
}
