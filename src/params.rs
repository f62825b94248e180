use crate::clustering::{DEFAULT_THRESHOLDS, NB_POINTS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// tunable parameters of the bundle similarity measures. Missing entries in a parameter file take
/// their default values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityParams {
    /// QuickBundlesX thresholds (mm), coarse to fine
    pub qbx_thresholds: Vec<f32>,
    /// points per streamline after resampling for clustering
    pub nb_points: usize,
    /// points taken from each end of a streamline for the endpoints density
    pub endpoints_point_to_select: usize,
    /// seed of the streamline ordering used for clustering
    pub seed: u64,
    /// directory holding the per-bundle cache
    pub cache_dir: PathBuf,
}

impl Default for SimilarityParams {
    fn default() -> Self {
        Self {
            qbx_thresholds: DEFAULT_THRESHOLDS.to_vec(),
            nb_points: NB_POINTS,
            endpoints_point_to_select: 3,
            seed: 0,
            cache_dir: PathBuf::from("tmp_measures"),
        }
    }
}

impl SimilarityParams {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let toml_str = fs::read_to_string(path.as_ref())?;
        let params = toml::from_str::<SimilarityParams>(&toml_str)?;
        params.validate()?;
        Ok(params)
    }

    /// writes the parameters as toml, returning the file name used
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let mut toml_string = toml::to_string(self)?;
        toml_string.push('\n');
        let filename = path.as_ref().with_extension("toml");
        fs::write(&filename, toml_string)?;
        Ok(filename)
    }

    pub fn validate(&self) -> Result<()> {
        if self.qbx_thresholds.is_empty() {
            return Err(Error::InvalidInput("at least one clustering threshold is required".to_string()));
        }
        if self.qbx_thresholds.iter().any(|&t| !(t > 0.)) {
            return Err(Error::InvalidInput("clustering thresholds must be positive".to_string()));
        }
        if self.qbx_thresholds.windows(2).any(|w| w[1] > w[0]) {
            return Err(Error::InvalidInput("clustering thresholds must be decreasing".to_string()));
        }
        if self.nb_points < 2 {
            return Err(Error::InvalidInput("streamlines need at least 2 points for clustering".to_string()));
        }
        if self.endpoints_point_to_select == 0 {
            return Err(Error::InvalidInput("endpoints_point_to_select must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let written = SimilarityParams::default().to_file(dir.path().join("params")).unwrap();
        assert_eq!(written.extension().unwrap(), "toml");
        assert_eq!(SimilarityParams::from_file(&written).unwrap(), SimilarityParams::default());
    }

    #[test]
    fn partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(&path, "seed = 7\nqbx_thresholds = [20.0, 10.0]\n").unwrap();
        let params = SimilarityParams::from_file(&path).unwrap();
        assert_eq!(params.seed, 7);
        assert_eq!(params.qbx_thresholds, vec![20., 10.]);
        assert_eq!(params.nb_points, NB_POINTS);
        assert_eq!(params.cache_dir, PathBuf::from("tmp_measures"));
    }

    #[test]
    fn rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(&path, "qbx_thresholds = [6.0, 12.0]\n").unwrap();
        assert!(SimilarityParams::from_file(&path).is_err());
        fs::write(&path, "nb_points = \"many\"\n").unwrap();
        assert!(matches!(SimilarityParams::from_file(&path), Err(Error::TomlDe(_))));
    }
}
