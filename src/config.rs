//! Worker tunables, optionally loaded from a YAML file. Every field has a default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ReconstructionError;
use crate::pairs::DEFAULT_NEIGHBORS_COUNT;

/// 1-sigma of the camera position prior, in meters.
pub const POSE_PRIOR_POSITION_SIGMA_M: f64 = 0.25;

/// Registered images below which a model is reported as suspiciously small.
pub const MIN_MODEL_SIZE: usize = 10;

/// RANSAC settings for two-view geometry verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwoViewGeometryOptions {
    pub max_num_trials: usize,
    pub min_inlier_ratio: f64,
    /// Maximum epipolar error in pixels.
    pub max_error: f64,
    pub compute_relative_pose: bool,
}

impl Default for TwoViewGeometryOptions {
    fn default() -> Self {
        Self {
            max_num_trials: 50_000,
            min_inlier_ratio: 0.05,
            max_error: 4.0,
            compute_relative_pose: true,
        }
    }
}

/// External mapper process invoked by the command-line solver adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapperCommandConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pose_prior_position_sigma_m: f64,
    /// Neighbor count used when the manifest leaves it unset.
    pub default_neighbors_count: usize,
    /// Meters of center distance equivalent to one radian of relative rotation.
    pub rotation_weight: f64,
    pub min_model_size: usize,
    pub two_view_geometry: TwoViewGeometryOptions,
    pub show_progress: bool,
    pub mapper: Option<MapperCommandConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pose_prior_position_sigma_m: POSE_PRIOR_POSITION_SIGMA_M,
            default_neighbors_count: DEFAULT_NEIGHBORS_COUNT,
            rotation_weight: 1.0,
            min_model_size: MIN_MODEL_SIZE,
            two_view_geometry: TwoViewGeometryOptions::default(),
            show_progress: true,
            mapper: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: WorkerConfig = serde_yaml::from_str(content).context("Invalid worker configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if given, otherwise use the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read worker configuration: {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("In {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ReconstructionError> {
        let invalid = |name: &'static str, reason: String| Err(ReconstructionError::InvalidOption { name, reason });

        if !(self.pose_prior_position_sigma_m > 0.0) {
            return invalid(
                "pose_prior_position_sigma_m",
                format!("{} is not positive", self.pose_prior_position_sigma_m),
            );
        }
        if self.default_neighbors_count == 0 {
            return invalid("default_neighbors_count", "must be at least 1".into());
        }
        if !(self.rotation_weight >= 0.0) {
            return invalid("rotation_weight", format!("{} is negative", self.rotation_weight));
        }
        let ratio = self.two_view_geometry.min_inlier_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return invalid("two_view_geometry.min_inlier_ratio", format!("{} outside (0, 1]", ratio));
        }
        if !(self.two_view_geometry.max_error > 0.0) {
            return invalid(
                "two_view_geometry.max_error",
                format!("{} is not positive", self.two_view_geometry.max_error),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = WorkerConfig::from_yaml("{}").unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.pose_prior_position_sigma_m, 0.25);
        assert_eq!(config.default_neighbors_count, 12);
        assert_eq!(config.two_view_geometry.max_num_trials, 50_000);
        assert!(config.mapper.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = "
min_model_size: 3
show_progress: false
two_view_geometry:
  max_error: 2.5
mapper:
  program: /usr/local/bin/rig-mapper
  args: [--threads, '8']
";
        let config = WorkerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.min_model_size, 3);
        assert!(!config.show_progress);
        assert_eq!(config.two_view_geometry.max_error, 2.5);
        assert_eq!(config.two_view_geometry.min_inlier_ratio, 0.05);
        let mapper = config.mapper.unwrap();
        assert_eq!(mapper.program, PathBuf::from("/usr/local/bin/rig-mapper"));
        assert_eq!(mapper.args, vec!["--threads", "8"]);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(WorkerConfig::from_yaml("pose_prior_position_sigma_m: 0").is_err());
        assert!(WorkerConfig::from_yaml("default_neighbors_count: 0").is_err());
        assert!(WorkerConfig::from_yaml("two_view_geometry: {min_inlier_ratio: 1.5}").is_err());
        assert!(WorkerConfig::from_yaml("unknown_type: [").is_err());
    }

    #[test]
    fn load_without_path_uses_defaults() {
        assert_eq!(WorkerConfig::load(None).unwrap(), WorkerConfig::default());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.yaml");
        fs::write(&path, "rotation_weight: 0.5\n").unwrap();
        assert_eq!(WorkerConfig::load(Some(&path)).unwrap().rotation_weight, 0.5);
    }
}
