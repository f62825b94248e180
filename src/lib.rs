pub mod array_utils;
pub mod data_import;
pub mod tractogram;
pub mod streamline_metrics;
pub mod clustering;
pub mod distance_transform;
pub mod reproducibility_measures;
pub mod diffusion_models;
pub mod registration;
pub mod screenshot;
pub mod params;
pub mod cli;
pub mod measure_cache;

pub mod endpoints_metric;
pub mod screenshot_dti;
pub mod bundle_similarity;

use std::path::PathBuf;

/// Errors surfaced by the tractometry pipelines. There is no recovery logic, every variant
/// ends the current run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("nifti error: {0}")]
    Nifti(#[from] nifti::error::NiftiError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse parameter file: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("failed to serialize parameters: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("malformed tractogram {path}: {reason}")]
    Tractogram { path: PathBuf, reason: String },
    #[error("{0} and {1} have incompatible headers")]
    IncompatibleHeaders(PathBuf, PathBuf),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
