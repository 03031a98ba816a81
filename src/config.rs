// THEORY:
// Tunable configuration for the stitcher. Values resolve in three layers:
// compiled-in defaults, then `PANOSTITCH_*` environment variables, then whatever
// the caller (usually the CLI) sets on the struct directly. Embedders can also
// deserialize a partial `StitchConfig` document; missing fields take the defaults.

use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

const ENV_PREFIX: &str = "PANOSTITCH_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid environment configuration")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

/// Weights of the unsharp mask applied to every input before stitching.
///
/// `output = original_weight * original + residual_weight * residual + bias`,
/// where `residual = original - gaussian_blur(original, sigma)`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SharpenConfig {
    /// Standard deviation of the Gaussian blur. The kernel size follows from it.
    pub sigma: f32,
    pub original_weight: f32,
    pub residual_weight: f32,
    pub bias: f32,
}

impl Default for SharpenConfig {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            original_weight: 1.8,
            residual_weight: -1.3,
            bias: 0.0,
        }
    }
}

/// Parameters of the bundled translation engine.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Images smaller than this on either axis carry too little detail to match.
    pub min_image_side: u32,
    /// Longest side of the downscaled copy used for the exhaustive coarse search.
    pub search_side: u32,
    /// How many coarse peaks are refined at full resolution.
    pub coarse_candidates: usize,
    /// Minimum overlap, as a fraction of the smaller image's area, for an offset to count.
    pub min_overlap: f32,
    /// Minimum normalised cross-correlation for a pair to be considered aligned.
    pub match_threshold: f32,
    /// Fraction of `match_threshold` that non-adjacent pairs must reach at their chained offset.
    pub consistency_ratio: f32,
    /// Upper bound on the composite's pixel count.
    pub max_canvas_pixels: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_image_side: 16,
            search_side: 64,
            coarse_candidates: 5,
            min_overlap: 0.15,
            match_threshold: 0.75,
            consistency_ratio: 0.8,
            max_canvas_pixels: 100_000_000,
        }
    }
}

/// Raster format of the stitched result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultFormat {
    Png,
    Jpeg,
}

impl ResultFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ResultFormat::Png => "png",
            ResultFormat::Jpeg => "jpg",
        }
    }

    pub fn image_format(&self) -> image::ImageFormat {
        match self {
            ResultFormat::Png => image::ImageFormat::Png,
            ResultFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

/// Configuration for the whole stitching pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StitchConfig {
    /// Parent directory of every per-request temporary directory.
    pub workspace_root: PathBuf,
    /// Where result files are allocated. Never inside a temporary directory.
    pub result_dir: PathBuf,
    pub result_format: ResultFormat,
    pub sharpen: SharpenConfig,
    /// Number of threads in the bounded preprocessing pool.
    pub preprocess_threads: usize,
    pub engine: EngineConfig,
}

impl Default for StitchConfig {
    fn default() -> Self {
        let workspace_root = std::env::temp_dir().join("panostitch");
        Self {
            result_dir: workspace_root.join("results"),
            workspace_root,
            result_format: ResultFormat::Jpeg,
            sharpen: SharpenConfig::default(),
            preprocess_threads: num_cpus::get(),
            engine: EngineConfig::default(),
        }
    }
}

/// Flat view of the environment, since `envy` only deserializes flat structs.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    workspace_root: Option<PathBuf>,
    result_dir: Option<PathBuf>,
    result_format: Option<ResultFormat>,
    sharpen_sigma: Option<f32>,
    sharpen_original_weight: Option<f32>,
    sharpen_residual_weight: Option<f32>,
    sharpen_bias: Option<f32>,
    preprocess_threads: Option<usize>,
    match_threshold: Option<f32>,
    min_overlap: Option<f32>,
}

impl StitchConfig {
    /// Defaults overlaid with `PANOSTITCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let overrides = envy::prefixed(ENV_PREFIX).from_env::<EnvOverrides>()?;
        let mut config = Self::default();
        config.apply(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Same as `Default`, rooted at `workspace_root`. Handy for tests and embedding.
    pub fn with_workspace_root(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            result_dir: workspace_root.join("results"),
            workspace_root,
            ..Self::default()
        }
    }

    fn apply(&mut self, overrides: EnvOverrides) {
        if let Some(root) = overrides.workspace_root {
            // The result directory follows the root unless it is set explicitly.
            self.result_dir = root.join("results");
            self.workspace_root = root;
        }
        if let Some(dir) = overrides.result_dir {
            self.result_dir = dir;
        }
        if let Some(format) = overrides.result_format {
            self.result_format = format;
        }
        if let Some(sigma) = overrides.sharpen_sigma {
            self.sharpen.sigma = sigma;
        }
        if let Some(weight) = overrides.sharpen_original_weight {
            self.sharpen.original_weight = weight;
        }
        if let Some(weight) = overrides.sharpen_residual_weight {
            self.sharpen.residual_weight = weight;
        }
        if let Some(bias) = overrides.sharpen_bias {
            self.sharpen.bias = bias;
        }
        if let Some(threads) = overrides.preprocess_threads {
            self.preprocess_threads = threads;
        }
        if let Some(threshold) = overrides.match_threshold {
            self.engine.match_threshold = threshold;
        }
        if let Some(overlap) = overrides.min_overlap {
            self.engine.min_overlap = overlap;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            })
        };

        let sharpen = &self.sharpen;
        if !(sharpen.sigma.is_finite() && sharpen.sigma > 0.0) {
            return invalid("sharpen sigma must be a positive number");
        }
        if ![sharpen.original_weight, sharpen.residual_weight, sharpen.bias]
            .iter()
            .all(|w| w.is_finite())
        {
            return invalid("sharpen weights must be finite");
        }
        if self.preprocess_threads == 0 {
            return invalid("preprocess_threads must be at least 1");
        }
        if !(self.engine.min_overlap > 0.0 && self.engine.min_overlap <= 1.0) {
            return invalid("min_overlap must be in (0, 1]");
        }
        if !(self.engine.match_threshold > 0.0 && self.engine.match_threshold <= 1.0) {
            return invalid("match_threshold must be in (0, 1]");
        }
        if self.engine.search_side < 8 || self.engine.coarse_candidates == 0 {
            return invalid("search_side must be at least 8 and coarse_candidates at least 1");
        }
        if self.result_dir.starts_with(&self.workspace_root.join("requests")) {
            return invalid("result_dir must not live inside a request workspace");
        }
        Ok(())
    }
}
