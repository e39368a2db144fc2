//! Incremental mapping capability and its command-line adapter.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Serialize;

use crate::colmap::ColmapParser;
use crate::config::{MapperCommandConfig, TwoViewGeometryOptions};
use crate::database::{ImageId, ReconstructionDatabase, TwoViewGeometry};
use crate::manifest::ReconstructionOptions;
use crate::reconstruction::Reconstruction;

/// Options forwarded to the mapper. Unset fields are omitted so the mapper keeps its defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MapperOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_prior_position: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ba_refine_sensor_from_rig: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ba_refine_focal_length: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ba_refine_principal_point: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ba_refine_extra_params: Option<bool>,
}

impl MapperOptions {
    pub fn from_reconstruction_options(options: &ReconstructionOptions) -> Self {
        let mut mapper = Self::default();
        if let Some(value) = options.use_prior_position {
            mapper.use_prior_position = Some(value);
        }
        if let Some(value) = options.ba_refine_sensor_from_rig {
            mapper.ba_refine_sensor_from_rig = Some(value);
        }
        if let Some(value) = options.ba_refine_focal_length {
            mapper.ba_refine_focal_length = Some(value);
        }
        if let Some(value) = options.ba_refine_principal_point {
            mapper.ba_refine_principal_point = Some(value);
        }
        if let Some(value) = options.ba_refine_extra_params {
            mapper.ba_refine_extra_params = Some(value);
        }
        mapper
    }
}

/// Incremental structure-from-motion capability.
pub trait IncrementalMapper {
    /// Verify the raw matches of `pairs` and store the resulting two-view geometries.
    fn verify_matches(
        &self,
        database: &mut ReconstructionDatabase,
        pairs: &[(ImageId, ImageId)],
        options: &TwoViewGeometryOptions,
    ) -> Result<()>;

    /// Map the database into zero or more disjoint components.
    fn reconstruct(
        &self,
        database: &ReconstructionDatabase,
        image_root: &Path,
        options: &MapperOptions,
    ) -> Result<Vec<Reconstruction>>;
}

/// Read every numbered model directory (`0/`, `1/`, ...) under `dir`, in numeric order.
pub fn read_models(dir: &Path) -> Result<Vec<Reconstruction>> {
    let mut indices = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read model directory: {}", dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(index) = entry.file_name().to_str().and_then(|name| name.parse::<usize>().ok()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();

    indices
        .into_iter()
        .map(|index| ColmapParser::read_model(&dir.join(index.to_string())))
        .collect()
}

/// Runs an external mapper executable.
///
/// The program is called as `program [args..] verify|map --database <json> ...` and
/// exchanges JSON and COLMAP text files through `work_dir`.
pub struct CommandMapper {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
}

impl CommandMapper {
    pub fn new(config: &MapperCommandConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            work_dir: work_dir.into(),
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.work_dir.join(name);
        let body = serde_json::to_vec_pretty(value)?;
        fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn write_database(&self, database: &ReconstructionDatabase) -> Result<PathBuf> {
        let path = self.work_dir.join("database.json");
        fs::write(&path, database.to_json()?).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    fn run(&self, subcommand: &str, flags: &[(&str, &Path)]) -> Result<()> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(subcommand);
        for (flag, path) in flags {
            command.arg(flag).arg(path);
        }
        debug!("Running {:?}", command);

        let status = command
            .status()
            .with_context(|| format!("Failed to start mapper {}", self.program.display()))?;
        if !status.success() {
            bail!("Mapper {} {} failed: {}", self.program.display(), subcommand, status);
        }
        Ok(())
    }
}

impl IncrementalMapper for CommandMapper {
    fn verify_matches(
        &self,
        database: &mut ReconstructionDatabase,
        pairs: &[(ImageId, ImageId)],
        options: &TwoViewGeometryOptions,
    ) -> Result<()> {
        fs::create_dir_all(&self.work_dir)?;
        let database_path = self.write_database(database)?;
        let pairs_path = self.write_json("verify_pairs.json", pairs)?;
        let options_path = self.write_json("two_view_geometry_options.json", options)?;
        let output_path = self.work_dir.join("two_view_geometries.json");

        info!("Verifying {} pairs", pairs.len());
        self.run(
            "verify",
            &[
                ("--database", database_path.as_path()),
                ("--pairs", pairs_path.as_path()),
                ("--options", options_path.as_path()),
                ("--output", output_path.as_path()),
            ],
        )?;

        let bytes = fs::read(&output_path).with_context(|| format!("Failed to read {}", output_path.display()))?;
        let geometries: Vec<TwoViewGeometry> =
            serde_json::from_slice(&bytes).with_context(|| format!("Invalid {}", output_path.display()))?;
        info!("{} of {} pairs verified", geometries.len(), pairs.len());
        for geometry in geometries {
            database.write_two_view_geometry(geometry)?;
        }
        Ok(())
    }

    fn reconstruct(
        &self,
        database: &ReconstructionDatabase,
        image_root: &Path,
        options: &MapperOptions,
    ) -> Result<Vec<Reconstruction>> {
        fs::create_dir_all(&self.work_dir)?;
        let database_path = self.write_database(database)?;
        let options_path = self.write_json("mapper_options.json", options)?;
        let models_dir = self.work_dir.join("models");
        if models_dir.exists() {
            fs::remove_dir_all(&models_dir)?;
        }
        fs::create_dir_all(&models_dir)?;

        self.run(
            "map",
            &[
                ("--database", database_path.as_path()),
                ("--image-root", image_root),
                ("--options", options_path.as_path()),
                ("--output", models_dir.as_path()),
            ],
        )?;

        let models = read_models(&models_dir)?;
        info!("Mapper produced {} models", models.len());
        Ok(models)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_set_options_are_forwarded() {
        let options = ReconstructionOptions {
            neighbors_count: Some(4),
            use_prior_position: Some(true),
            ba_refine_focal_length: Some(false),
            ..Default::default()
        };
        let mapper = MapperOptions::from_reconstruction_options(&options);
        let json = serde_json::to_value(&mapper).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"use_prior_position": true, "ba_refine_focal_length": false})
        );

        let empty = MapperOptions::from_reconstruction_options(&ReconstructionOptions::default());
        assert_eq!(serde_json::to_string(&empty).unwrap(), "{}");
    }

    fn write_model(dir: &Path, image_names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("cameras.txt"), "1 PINHOLE 8 8 4 4 4 4\n").unwrap();
        let images: String = image_names
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{} 1 0 0 0 0 0 0 1 {}\n\n", i + 1, name))
            .collect();
        fs::write(dir.join("images.txt"), images).unwrap();
        fs::write(dir.join("points3D.txt"), "").unwrap();
    }

    #[test]
    fn models_are_read_in_numeric_order() {
        let dir = tempfile::tempdir().unwrap();
        write_model(&dir.path().join("10"), &["c.jpg"]);
        write_model(&dir.path().join("2"), &["a.jpg", "b.jpg"]);
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("3"), "not a directory").unwrap();

        let models = read_models(dir.path()).unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].num_registered_images(), 2);
        assert_eq!(models[1].images[&1].name, "c.jpg");
    }

    #[cfg(unix)]
    fn shell_mapper(script: &str, work_dir: &Path) -> CommandMapper {
        CommandMapper::new(
            &MapperCommandConfig {
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into(), "mapper".into()],
            },
            work_dir,
        )
    }

    #[cfg(unix)]
    #[test]
    fn command_mapper_reads_written_models() {
        let script = r#"
            [ "$1" = map ] || exit 2
            while [ $# -gt 0 ]; do
                case "$1" in --output) out="$2"; shift;; esac
                shift
            done
            mkdir -p "$out/0"
            echo "1 PINHOLE 8 8 4 4 4 4" > "$out/0/cameras.txt"
            printf '1 1 0 0 0 0 0 0 1 rig/cam/0.jpg\n\n' > "$out/0/images.txt"
            : > "$out/0/points3D.txt"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let mapper = shell_mapper(script, dir.path());

        let models = mapper
            .reconstruct(&ReconstructionDatabase::new(), dir.path(), &MapperOptions::default())
            .unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].images[&1].name, "rig/cam/0.jpg");
        assert!(dir.path().join("database.json").is_file());
        assert_eq!(fs::read_to_string(dir.path().join("mapper_options.json")).unwrap(), "{}");
    }

    #[cfg(unix)]
    #[test]
    fn command_mapper_without_models_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = shell_mapper("exit 0", dir.path());
        let models = mapper
            .reconstruct(&ReconstructionDatabase::new(), dir.path(), &MapperOptions::default())
            .unwrap();
        assert!(models.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn failing_mapper_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = shell_mapper("exit 3", dir.path());
        let err = mapper
            .reconstruct(&ReconstructionDatabase::new(), dir.path(), &MapperOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("map failed"));
    }

    #[cfg(unix)]
    #[test]
    fn verified_geometries_are_written_back() {
        use crate::rig::Intrinsics;

        let mut database = ReconstructionDatabase::new();
        let intrinsics = Intrinsics::Generic {
            width: 8,
            height: 8,
            params: vec![],
        };
        let cam = database.write_camera("rig", "cam", &intrinsics).unwrap();
        let a = database.write_image("rig/cam/0.jpg", cam).unwrap();
        let b = database.write_image("rig/cam/1.jpg", cam).unwrap();
        database.write_keypoints(a, &[[0.0, 0.0], [1.0, 1.0]]).unwrap();
        database.write_keypoints(b, &[[0.0, 0.0], [1.0, 1.0]]).unwrap();
        database.write_matches(a, b, &[[0, 0], [1, 1]]).unwrap();

        let script = r#"
            while [ $# -gt 0 ]; do
                case "$1" in --output) out="$2"; shift;; esac
                shift
            done
            echo '[{"image_id1": 1, "image_id2": 2, "inlier_matches": [[1, 1]]}]' > "$out"
        "#;
        let dir = tempfile::tempdir().unwrap();
        shell_mapper(script, dir.path())
            .verify_matches(&mut database, &[(a, b)], &TwoViewGeometryOptions::default())
            .unwrap();

        let geometries = database.two_view_geometries();
        assert_eq!(geometries.len(), 1);
        assert_eq!(geometries[0].inlier_matches, vec![[1, 1]]);
        assert!(geometries[0].cam2_from_cam1.is_none());
    }
}
