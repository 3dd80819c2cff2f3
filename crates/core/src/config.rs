use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::InferenceBackend;
use crate::error::Error;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "W2X_DATA_DIR";

pub const DEFAULT_NOISE: i64 = 0;
pub const DEFAULT_SCALE: i64 = 2;
pub const DEFAULT_BLOCK_SIZE: i64 = 128;
pub const DEFAULT_MODEL: i64 = 6;
pub const DEFAULT_BATCH: i64 = 1;

/// Network family. Indices match the host-facing `model` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    AnimeStyleArt,
    AnimeStyleArtRgb,
    Photo,
    Upconv7AnimeStyleArtRgb,
    Upconv7Photo,
    UpResNet10,
    Cunet,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 7] = [
        Self::AnimeStyleArt,
        Self::AnimeStyleArtRgb,
        Self::Photo,
        Self::Upconv7AnimeStyleArtRgb,
        Self::Upconv7Photo,
        Self::UpResNet10,
        Self::Cunet,
    ];

    pub fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    pub fn index(&self) -> usize {
        Self::ALL
            .iter()
            .position(|family| family == self)
            .unwrap_or_default()
    }

    /// Directory name under the models root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::AnimeStyleArt => "anime_style_art",
            Self::AnimeStyleArtRgb => "anime_style_art_rgb",
            Self::Photo => "photo",
            Self::Upconv7AnimeStyleArtRgb => "upconv_7_anime_style_art_rgb",
            Self::Upconv7Photo => "upconv_7_photo",
            Self::UpResNet10 => "upresnet10",
            Self::Cunet => "cunet",
        }
    }

    /// Block dimensions must be multiples of this.
    pub fn block_align(&self) -> usize {
        match self {
            Self::Cunet => 4,
            _ => 1,
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Which network of a family a pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Noise,
    Scale,
    NoiseScale,
}

impl ModelKind {
    /// Spatial factor one pass of this kind applies.
    pub fn factor(&self) -> usize {
        match self {
            Self::Noise => 1,
            Self::Scale | Self::NoiseScale => 2,
        }
    }

    pub fn file_name(&self, noise: i32) -> String {
        match self {
            Self::Noise => format!("noise{noise}_model.onnx"),
            Self::Scale => "scale2.0x_model.onnx".to_string(),
            Self::NoiseScale => format!("noise{noise}_scale2.0x_model.onnx"),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Noise => write!(f, "noise"),
            Self::Scale => write!(f, "scale"),
            Self::NoiseScale => write!(f, "noise_scale"),
        }
    }
}

/// Raw construction-time options, as the host hands them over.
///
/// Values are deliberately loose integers; [`ModelConfig::from_options`]
/// is the only way to turn them into a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterOptions {
    pub noise: i64,
    pub scale: i64,
    pub block_w: i64,
    /// Defaults to `block_w` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_h: Option<i64>,
    pub model: i64,
    pub backend: InferenceBackend,
    pub processor: i64,
    pub tta: bool,
    pub batch: i64,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            noise: DEFAULT_NOISE,
            scale: DEFAULT_SCALE,
            block_w: DEFAULT_BLOCK_SIZE,
            block_h: None,
            model: DEFAULT_MODEL,
            backend: InferenceBackend::default(),
            processor: 0,
            tta: false,
            batch: DEFAULT_BATCH,
        }
    }
}

impl FilterOptions {
    /// Neither denoising nor upscaling was requested.
    pub fn is_passthrough(&self) -> bool {
        self.noise == -1 && self.scale == 1
    }

    pub fn block_h_or_default(&self) -> i64 {
        self.block_h.unwrap_or(self.block_w)
    }
}

/// Validated, immutable model configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    family: ModelFamily,
    noise: i32,
    scale: usize,
    block_w: usize,
    block_h: usize,
    batch: usize,
    tta: bool,
    backend: InferenceBackend,
    device_id: u32,
}

fn is_power_of_two(value: i64) -> bool {
    value > 0 && (value & (value - 1)) == 0
}

impl ModelConfig {
    pub fn from_options(options: &FilterOptions) -> Result<Self, Error> {
        let noise = options.noise;
        let block_h = options.block_h_or_default();

        if !(-1..=3).contains(&noise) {
            return Err(Error::configuration("noise must be -1, 0, 1, 2, or 3"));
        }
        if options.scale < 1 || !is_power_of_two(options.scale) {
            return Err(Error::configuration(
                "scale must be greater than or equal to 1 and be a power of 2",
            ));
        }
        if options.block_w < 1 {
            return Err(Error::configuration(
                "block_w must be greater than or equal to 1",
            ));
        }
        if block_h < 1 {
            return Err(Error::configuration(
                "block_h must be greater than or equal to 1",
            ));
        }
        let family = ModelFamily::from_index(options.model)
            .ok_or_else(|| Error::configuration("model must be 0, 1, 2, 3, 4, 5, or 6"))?;
        if family == ModelFamily::AnimeStyleArt && noise == 0 {
            return Err(Error::configuration(
                "anime_style_art model does not support noise reduction level 0",
            ));
        }
        let align = family.block_align() as i64;
        if options.block_w % align != 0 || block_h % align != 0 {
            return Err(Error::configuration(format!(
                "block size of {family} model must be divisible by {align}"
            )));
        }
        if options.processor < 0 {
            return Err(Error::configuration(
                "processor must be greater than or equal to 0",
            ));
        }
        if options.batch < 1 {
            return Err(Error::configuration(
                "batch must be greater than or equal to 1",
            ));
        }

        let to_usize = |value: i64, name: &str| {
            usize::try_from(value).map_err(|_| Error::configuration(format!("{name} is out of range")))
        };

        Ok(Self {
            family,
            noise: noise as i32,
            scale: to_usize(options.scale, "scale")?,
            block_w: to_usize(options.block_w, "block_w")?,
            block_h: to_usize(block_h, "block_h")?,
            batch: to_usize(options.batch, "batch")?,
            tta: options.tta,
            backend: options.backend.clone(),
            device_id: u32::try_from(options.processor)
                .map_err(|_| Error::configuration("processor is out of range"))?,
        })
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn noise(&self) -> i32 {
        self.noise
    }

    pub fn scale(&self) -> usize {
        self.scale
    }

    pub fn block_w(&self) -> usize {
        self.block_w
    }

    pub fn block_h(&self) -> usize {
        self.block_h
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn tta(&self) -> bool {
        self.tta
    }

    pub fn backend(&self) -> &InferenceBackend {
        &self.backend
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Number of 2× passes needed to reach `scale`.
    pub fn doubling_passes(&self) -> u32 {
        self.scale.trailing_zeros()
    }

    /// Network used by the first pass.
    pub fn model_kind(&self) -> ModelKind {
        if self.scale == 1 {
            ModelKind::Noise
        } else if self.noise == -1 {
            ModelKind::Scale
        } else {
            ModelKind::NoiseScale
        }
    }

    /// Networks run, in order, to reach the configured scale.
    pub fn pass_kinds(&self) -> Vec<ModelKind> {
        let first = self.model_kind();
        if first == ModelKind::Noise {
            return vec![ModelKind::Noise];
        }
        let mut kinds = vec![first];
        kinds.extend((1..self.doubling_passes()).map(|_| ModelKind::Scale));
        kinds
    }

    /// Distinct networks the engine must load.
    pub fn required_kinds(&self) -> Vec<ModelKind> {
        let mut kinds = self.pass_kinds();
        kinds.dedup();
        kinds
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub filter: FilterOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            filter: FilterOptions::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. W2X_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml on first run.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
