//! Built-in model catalog.
//!
//! Models live under `<models_dir>/{arch}/{style}/{basename}.onnx`, helper
//! graphs under `<models_dir>/utils/{name}.onnx`. The catalog knows which
//! architecture/style/scale combinations exist and the context offset each
//! of them trims from its output.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::ModelId;
use crate::job::RenderParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    SwinUnet,
    Cunet,
}

struct StyleInfo {
    name: &'static str,
    prefers_large_tiles: bool,
}

struct ArchInfo {
    styles: &'static [StyleInfo],
    /// `(scale, offset)` pairs.
    scales: &'static [(u32, u32)],
}

const SWIN_UNET: ArchInfo = ArchInfo {
    styles: &[
        StyleInfo {
            name: "art",
            prefers_large_tiles: false,
        },
        StyleInfo {
            name: "art_scan",
            prefers_large_tiles: true,
        },
        StyleInfo {
            name: "photo",
            prefers_large_tiles: true,
        },
    ],
    scales: &[(1, 8), (2, 16), (4, 32)],
};

const CUNET: ArchInfo = ArchInfo {
    styles: &[StyleInfo {
        name: "art",
        prefers_large_tiles: false,
    }],
    scales: &[(1, 28), (2, 36)],
};

pub const NOISE_LEVELS: std::ops::RangeInclusive<i8> = -1..=3;

impl Architecture {
    fn info(self) -> &'static ArchInfo {
        match self {
            Architecture::SwinUnet => &SWIN_UNET,
            Architecture::Cunet => &CUNET,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Architecture::SwinUnet => "swin_unet",
            Architecture::Cunet => "cunet",
        }
    }

    pub fn styles(self) -> impl Iterator<Item = &'static str> {
        self.info().styles.iter().map(|s| s.name)
    }

    pub fn scales(self) -> impl Iterator<Item = u32> {
        self.info().scales.iter().map(|(scale, _)| *scale)
    }

    pub fn offset(self, scale: u32) -> Option<u32> {
        self.info()
            .scales
            .iter()
            .find(|(s, _)| *s == scale)
            .map(|(_, offset)| *offset)
    }

    pub fn prefers_large_tiles(self, style: &str) -> Option<bool> {
        self.info()
            .styles
            .iter()
            .find(|s| s.name == style)
            .map(|s| s.prefers_large_tiles)
    }

    /// Round a requested tile size to one the network accepts.
    pub fn calc_tile_size(self, requested: u32, offset: u32) -> Result<u32> {
        let tile = match self {
            Architecture::SwinUnet => {
                // (t - 16) must be a multiple of both 12 and 16
                (requested.max(16) - 16)
                    .div_ceil(48)
                    .checked_mul(48)
                    .and_then(|t| t.checked_add(16))
            }
            Architecture::Cunet => {
                let tile = (i64::from(requested) + (i64::from(offset) - 16) * 2).max(4);
                u32::try_from(tile - tile % 4).ok()
            }
        };
        tile.ok_or_else(|| anyhow!("tile size {requested} cannot be rounded for {self}"))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "swin_unet" => Ok(Architecture::SwinUnet),
            "cunet" => Ok(Architecture::Cunet),
            other => bail!("unknown model architecture '{other}' (expected swin_unet or cunet)"),
        }
    }
}

/// A fully specified model choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub arch: Architecture,
    pub style: String,
    pub scale: u32,
    /// `-1` disables denoising.
    pub noise: i8,
}

impl ModelSpec {
    /// Parse `"arch"` or `"arch.style"`; the style defaults to `art`.
    pub fn parse(name: &str, scale: u32, noise: i8) -> Result<Self> {
        let (arch, style) = match name.split_once('.') {
            Some((arch, style)) => (arch, style),
            None => (name, "art"),
        };
        let spec = Self {
            arch: arch.parse()?,
            style: style.to_string(),
            scale,
            noise,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.arch.prefers_large_tiles(&self.style).is_none() {
            bail!(
                "model {} has no style '{}' (available: {})",
                self.arch,
                self.style,
                self.arch.styles().collect::<Vec<_>>().join(", ")
            );
        }
        if self.arch.offset(self.scale).is_none() {
            bail!(
                "model {} does not support scale {} (available: {:?})",
                self.arch,
                self.scale,
                self.arch.scales().collect::<Vec<_>>()
            );
        }
        if !NOISE_LEVELS.contains(&self.noise) {
            bail!("noise level {} is out of range -1..=3", self.noise);
        }
        Ok(())
    }

    pub fn offset(&self) -> Result<u32> {
        self.arch
            .offset(self.scale)
            .with_context(|| format!("model {} does not support scale {}", self.arch, self.scale))
    }

    pub fn model_id(&self) -> ModelId {
        ModelId::new(format!(
            "{}/{}/{}",
            self.arch,
            self.style,
            model_basename(self.scale, self.noise)
        ))
    }

    /// The plain upscaling model of the same family, used for alpha.
    pub fn alpha_model_id(&self) -> ModelId {
        ModelId::new(format!("{}/{}/scale{}x", self.arch, self.style, self.scale))
    }
}

pub fn model_basename(scale: u32, noise: i8) -> String {
    if noise < 0 {
        format!("scale{scale}x")
    } else if scale == 1 {
        format!("noise{noise}")
    } else {
        format!("noise{noise}_scale{scale}x")
    }
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models_dir: PathBuf,
}

impl ModelCatalog {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_path(&self, id: &ModelId) -> PathBuf {
        self.models_dir.join(format!("{}.onnx", id.as_str()))
    }

    pub fn utility_path(&self, name: &str) -> PathBuf {
        self.models_dir.join("utils").join(format!("{name}.onnx"))
    }

    pub fn is_installed(&self, id: &ModelId) -> bool {
        self.model_path(id).is_file()
    }

    /// Render parameters for `spec` with the tile size rounded for the
    /// architecture.
    pub fn render_params(&self, spec: &ModelSpec, requested_tile_size: u32) -> Result<RenderParams> {
        spec.validate()?;
        let offset = spec.offset()?;
        let tile_size = spec.arch.calc_tile_size(requested_tile_size, offset)?;

        let mut params = RenderParams::new(spec.model_id(), spec.scale, offset, tile_size);
        params.alpha_model = Some(spec.alpha_model_id());
        Ok(params)
    }
}
