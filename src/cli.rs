use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;
use log::info;

use crate::capture::{CaptureSource, DirectoryCapture, ZipCapture};
use crate::config::WorkerConfig;
use crate::error::ReconstructionError;
use crate::features::{FeatureExtractor, FeatureMatcher};
use crate::manifest::{ManifestContext, ReconstructionManifest, ReconstructionStatus};
use crate::pipeline::ReconstructionPipeline;
use crate::solver::CommandMapper;
use crate::store::{ArtifactStore, FsArtifactStore};

#[derive(Parser, Debug)]
#[command(name = "run-reconstruction")]
#[command(version)]
#[command(about = "Reconstruct a multi-camera rig capture into a registered sparse model", long_about = None)]
pub struct Args {
    /// Reconstruction to run; its queued manifest must already exist
    #[arg(long, env = "RECONSTRUCTION_ID")]
    pub reconstruction_id: String,

    /// Capture to reconstruct (defaults to the manifest's capture)
    #[arg(long, env = "CAPTURE_ID")]
    pub capture_id: Option<String>,

    /// Folder holding captures as `{id}.zip` or `{id}/`
    #[arg(long, env = "CAPTURES_ROOT", default_value = "captures")]
    pub captures_root: PathBuf,

    /// Artifact store root; artifacts land in `{root}/{reconstruction_id}/`
    #[arg(long, env = "RECONSTRUCTIONS_ROOT", default_value = "reconstructions")]
    pub reconstructions_root: PathBuf,

    /// Scratch folder for decoded images and mapper files
    #[arg(long, env = "RECONSTRUCTION_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Worker configuration (YAML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Hide progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl Args {
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("reconstruction-{}", self.reconstruction_id)))
    }
}

pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

/// Open `{root}/{capture_id}.zip`, or the unpacked `{root}/{capture_id}/` folder.
pub fn open_capture(captures_root: &Path, capture_id: &str) -> Result<Box<dyn CaptureSource>> {
    let archive = captures_root.join(format!("{}.zip", capture_id));
    if archive.is_file() {
        info!("Reading capture archive {}", archive.display());
        return Ok(Box::new(ZipCapture::open(&archive)?));
    }
    let folder = captures_root.join(capture_id);
    if folder.is_dir() {
        info!("Reading capture folder {}", folder.display());
        return Ok(Box::new(DirectoryCapture::new(folder)));
    }
    Err(ReconstructionError::MissingCaptureObject(format!("{}.zip", capture_id)).into())
}

/// Run one claimed reconstruction job and return its final manifest.
pub fn run_job(
    args: &Args,
    extractor: Box<dyn FeatureExtractor>,
    matcher: Box<dyn FeatureMatcher>,
) -> Result<ReconstructionManifest> {
    let store = FsArtifactStore::new(&args.reconstructions_root);
    run_job_with_store(args, &store, extractor, matcher)
}

/// [`run_job`] against an explicit artifact store.
///
/// The manifest is marked running before anything else is read, so every failure
/// after the manifest loads is recorded as `running` then `failed`.
pub fn run_job_with_store(
    args: &Args,
    store: &dyn ArtifactStore,
    extractor: Box<dyn FeatureExtractor>,
    matcher: Box<dyn FeatureMatcher>,
) -> Result<ReconstructionManifest> {
    let mut ctx = ManifestContext::load(store, &args.reconstruction_id)?;
    ctx.mark_running()?;

    let mut config = match WorkerConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            ctx.mark_failed(format!("{:#}", e))?;
            return Err(e);
        }
    };
    if args.no_progress {
        config.show_progress = false;
    }

    let capture_id = args
        .capture_id
        .clone()
        .unwrap_or_else(|| ctx.manifest.capture_id.clone());
    let work_dir = args.work_dir();

    let Some(mapper_config) = config.mapper.clone() else {
        let message = "No mapper command configured".to_string();
        ctx.mark_failed(message.clone())?;
        bail!(message);
    };
    let mapper = CommandMapper::new(&mapper_config, work_dir.join("mapper"));

    let mut source = match open_capture(&args.captures_root, &capture_id) {
        Ok(source) => source,
        Err(e) => {
            ctx.mark_failed(format!("{:#}", e))?;
            return Err(e);
        }
    };

    println!("🚀 Reconstruction {} (capture {})", args.reconstruction_id, capture_id);
    let start_time = Instant::now();

    let pipeline = ReconstructionPipeline::new(config, extractor, matcher, Box::new(mapper));
    let result = pipeline.run(&mut ctx, source.as_mut(), &work_dir);

    println!("\n⏱️  Finished in {:.2}s", start_time.elapsed().as_secs_f32());
    print_summary(&ctx.manifest);
    result?;

    Ok(ctx.manifest)
}

pub fn print_summary(manifest: &ReconstructionManifest) {
    match manifest.status {
        ReconstructionStatus::Succeeded => println!("✅ Reconstruction succeeded"),
        ReconstructionStatus::Failed => println!(
            "❌ Reconstruction failed: {}",
            manifest.error.as_deref().unwrap_or("unknown error")
        ),
        status => println!("⚠️  Reconstruction stopped in state {:?}", status),
    }

    let metrics = &manifest.metrics;
    if let Some(total) = metrics.total_images {
        println!("📊 Images: {}", total);
    }
    if let Some(average) = metrics.average_keypoints_per_image {
        println!("   Average keypoints per image: {:.1}", average);
    }
    if let (Some(registered), Some(rate)) = (metrics.registered_images, metrics.registration_rate) {
        println!("   Registered: {} ({:.1}%)", registered, rate);
    }
    if let Some(points) = metrics.num_3d_points {
        println!("   3D points: {}", points);
    }
    if let (Some(p50), Some(p90)) = (
        metrics.reprojection_pixel_error_50th_percentile,
        metrics.reprojection_pixel_error_90th_percentile,
    ) {
        println!("   Reprojection error: {:.3}px median, {:.3}px p90", p50, p90);
    }
    if let (Some(track), Some(long)) = (
        metrics.track_length_50th_percentile,
        metrics.percent_tracks_with_length_greater_than_or_equal_to_3,
    ) {
        println!("   Track length: {:.1} median, {:.1}% with 3+ images", track, long);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "run-reconstruction",
            "--reconstruction-id",
            "recon-9",
            "--captures-root",
            "/data/captures",
            "--work-dir",
            "/scratch/recon-9",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.reconstruction_id, "recon-9");
        assert_eq!(args.captures_root, PathBuf::from("/data/captures"));
        assert_eq!(args.work_dir(), PathBuf::from("/scratch/recon-9"));
        assert!(args.verbose);
        assert!(!args.no_progress);
    }

    #[test]
    fn open_capture_prefers_archive_then_folder() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("cap-1")).unwrap();
        fs::write(dir.path().join("cap-1/config.json"), b"{}").unwrap();

        let mut source = open_capture(dir.path(), "cap-1").unwrap();
        assert_eq!(source.read("config.json").unwrap(), b"{}");

        let err = open_capture(dir.path(), "cap-2").err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ReconstructionError>(),
            Some(ReconstructionError::MissingCaptureObject(_))
        ));
    }

    use crate::features::Features;
    use crate::manifest::{ReconstructionOptions, MANIFEST_NAME};
    use crate::store::{artifact_key, MemoryArtifactStore};
    use std::sync::Mutex;

    /// Keeps every object and the status of each manifest write, in order.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryArtifactStore,
        statuses: Mutex<Vec<ReconstructionStatus>>,
    }

    impl ArtifactStore for RecordingStore {
        fn put(&self, key: &str, body: &[u8]) -> Result<()> {
            if key.ends_with(MANIFEST_NAME) {
                let manifest: ReconstructionManifest = serde_json::from_slice(body)?;
                self.statuses.lock().unwrap().push(manifest.status);
            }
            self.inner.put(key, body)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
    }

    struct Unused;

    impl FeatureExtractor for Unused {
        fn extract(&self, image: &crate::capture::Image, _: &crate::features::ExtractionOptions) -> Result<Features> {
            bail!("unexpected extraction of {}", image.name)
        }
    }

    impl FeatureMatcher for Unused {
        fn match_features(&self, _: &Features, _: &Features, _: (u32, u32)) -> Result<Vec<i64>> {
            bail!("unexpected matching")
        }
    }

    fn queued_store(reconstruction_id: &str) -> RecordingStore {
        let store = RecordingStore::default();
        let manifest = ReconstructionManifest::queued("cap-x", ReconstructionOptions::default());
        store
            .inner
            .put(
                &artifact_key(reconstruction_id, MANIFEST_NAME),
                &serde_json::to_vec(&manifest).unwrap(),
            )
            .unwrap();
        store
    }

    fn job_args(dir: &Path, config: Option<PathBuf>) -> Args {
        Args {
            reconstruction_id: "recon-1".into(),
            capture_id: None,
            captures_root: dir.join("captures"),
            reconstructions_root: dir.join("reconstructions"),
            work_dir: Some(dir.join("work")),
            config,
            verbose: false,
            no_progress: true,
        }
    }

    #[test]
    fn missing_capture_is_recorded_after_running() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("worker.yaml");
        fs::write(&config, "mapper:\n  program: /bin/true\n").unwrap();
        let args = job_args(dir.path(), Some(config));
        let store = queued_store("recon-1");

        let err = run_job_with_store(&args, &store, Box::new(Unused), Box::new(Unused)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconstructionError>(),
            Some(ReconstructionError::MissingCaptureObject(_))
        ));

        assert_eq!(
            *store.statuses.lock().unwrap(),
            vec![ReconstructionStatus::Running, ReconstructionStatus::Failed]
        );
        let stored: ReconstructionManifest =
            serde_json::from_slice(&store.get("recon-1/manifest.json").unwrap().unwrap()).unwrap();
        assert_eq!(stored.error.as_deref(), Some("capture object not found: cap-x.zip"));
    }

    #[test]
    fn missing_mapper_is_recorded_after_running() {
        let dir = tempfile::tempdir().unwrap();
        let args = job_args(dir.path(), None);
        let store = queued_store("recon-1");

        assert!(run_job_with_store(&args, &store, Box::new(Unused), Box::new(Unused)).is_err());
        assert_eq!(
            *store.statuses.lock().unwrap(),
            vec![ReconstructionStatus::Running, ReconstructionStatus::Failed]
        );
    }
}
