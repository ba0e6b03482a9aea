//! `config.toml` and the data directory it lives in.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::DEFAULT_BLEND_SIZE;
use crate::onnx::InferenceBackend;
use crate::tta::TtaLevel;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub render: RenderConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

/// Defaults for `tilescale upscale`; every field can be overridden on the
/// command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RenderConfig {
    /// `arch` or `arch.style`.
    pub model: String,
    pub noise: i8,
    pub scale: u32,
    pub tile_size: u32,
    pub tile_random: bool,
    pub tta_level: TtaLevel,
    /// Keep alpha when the input has any transparent pixel.
    pub detect_alpha: bool,
    pub alpha_threshold: f32,
    pub antialias: bool,
    pub blend_size: u32,
    pub linear_light: bool,
    pub background: [f32; 3],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            model: "swin_unet.art".to_string(),
            noise: -1,
            scale: 2,
            tile_size: 256,
            tile_random: false,
            tta_level: TtaLevel::Off,
            detect_alpha: true,
            alpha_threshold: 0.5,
            antialias: false,
            blend_size: DEFAULT_BLEND_SIZE,
            linear_light: false,
            background: [1.0, 1.0, 1.0],
        }
    }
}

impl AppConfig {
    /// `Ok(None)` when there is no file at `path`. An empty file is the
    /// default config.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("cannot read {}", path.display()))
            }
        };
        toml::from_str(&text)
            .map(Some)
            .with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("config is not representable as TOML")?;
        fs::write(path, text).with_context(|| format!("cannot write {}", path.display()))
    }
}

/// Root for `config.toml`, `logs/`, `lib/` and the relative paths of `[paths]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub const ENV_VAR: &'static str = "TILESCALE_DATA_DIR";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--data-dir`, else `$TILESCALE_DATA_DIR`, else `./data`.
    pub fn locate(flag: Option<&Path>) -> Self {
        let root = flag
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(Self::ENV_VAR).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("data"));
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.root.join("lib")
    }

    /// A configured path: absolute ones are kept, relative ones sit under
    /// the data dir.
    pub fn resolve(&self, configured: &Path) -> PathBuf {
        self.root.join(configured)
    }

    /// Create the directory, write the default `config.toml` if it has none,
    /// then return the config in effect.
    pub fn initialize(&self) -> Result<AppConfig> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("cannot create data dir {}", self.root.display()))?;
        let path = self.config_file();
        match AppConfig::read(&path)? {
            Some(config) => Ok(config),
            None => {
                let config = AppConfig::default();
                config.write(&path)?;
                Ok(config)
            }
        }
    }
}
