//! End-to-end reconstruction of one capture.
//!
//! Stages run in a fixed order and the manifest is flushed after each milestone:
//! ingestion, extraction, pairing, matching, database seeding, verification, mapping,
//! model export and metrics.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::capture::{load_capture, CaptureSource};
use crate::colmap::{cameras_txt, images_txt, points3d_txt};
use crate::config::WorkerConfig;
use crate::database::build_database;
use crate::features::{
    average_keypoints, extract_all, features_to_json, global_descriptors_to_json, match_all, ExtractionOptions,
    FeatureExtractor, FeatureMatcher,
};
use crate::manifest::{ManifestContext, ReconstructionStatus};
use crate::metrics::compute_metrics;
use crate::pairs::{pairs_to_text, select_pairs, PairPolicy, PoseDistance, PosedImage};
use crate::ply::points_to_ply;
use crate::reconstruction::{select_best, Reconstruction};
use crate::solver::{IncrementalMapper, MapperOptions};

pub const PAIRS_ARTIFACT: &str = "pairs.txt";
pub const FEATURES_ARTIFACT: &str = "features.json";
pub const GLOBAL_DESCRIPTORS_ARTIFACT: &str = "global_descriptors.json";
pub const MODEL_CAMERAS_ARTIFACT: &str = "sfm_model/cameras.txt";
pub const MODEL_IMAGES_ARTIFACT: &str = "sfm_model/images.txt";
pub const MODEL_POINTS_ARTIFACT: &str = "sfm_model/points3D.txt";
pub const MODEL_PLY_ARTIFACT: &str = "sfm_model/points3D.ply";

pub struct ReconstructionPipeline {
    config: WorkerConfig,
    extractor: Box<dyn FeatureExtractor>,
    matcher: Box<dyn FeatureMatcher>,
    mapper: Box<dyn IncrementalMapper>,
}

impl ReconstructionPipeline {
    pub fn new(
        config: WorkerConfig,
        extractor: Box<dyn FeatureExtractor>,
        matcher: Box<dyn FeatureMatcher>,
        mapper: Box<dyn IncrementalMapper>,
    ) -> Self {
        Self {
            config,
            extractor,
            matcher,
            mapper,
        }
    }

    /// Run the whole pipeline, recording the outcome in the manifest.
    ///
    /// A context that is not yet running is marked running first. Any error marks the
    /// manifest failed with the full error chain and is returned. Artifacts uploaded
    /// before the failure are kept.
    pub fn run(
        &self,
        ctx: &mut ManifestContext<'_>,
        source: &mut dyn CaptureSource,
        work_dir: &Path,
    ) -> Result<Reconstruction> {
        if ctx.manifest.status != ReconstructionStatus::Running {
            ctx.mark_running()?;
        }

        match self.execute(ctx, source, work_dir) {
            Ok(best) => {
                ctx.mark_succeeded()?;
                Ok(best)
            }
            Err(e) => {
                if let Err(flush_error) = ctx.mark_failed(format!("{:#}", e)) {
                    warn!("Could not record failure in manifest: {:#}", flush_error);
                }
                Err(e)
            }
        }
    }

    fn execute(
        &self,
        ctx: &mut ManifestContext<'_>,
        source: &mut dyn CaptureSource,
        work_dir: &Path,
    ) -> Result<Reconstruction> {
        let options = ctx.manifest.options.clone();
        let show_progress = self.config.show_progress;

        // Ingestion
        let image_root = work_dir.join("images");
        fs::create_dir_all(&image_root)
            .with_context(|| format!("Failed to create directory: {}", image_root.display()))?;
        let capture = load_capture(source, &image_root)?;
        let total_images = capture.images.len();
        info!("Loaded {} images from {} rigs", total_images, capture.rig_config.rigs.len());
        ctx.manifest.metrics.total_images = Some(total_images);
        ctx.flush()?;

        // Extraction
        let extraction = ExtractionOptions {
            max_keypoints: options.max_keypoints_per_image,
        };
        let features = extract_all(&capture.images, self.extractor.as_ref(), &extraction, show_progress)?;
        ctx.manifest.metrics.average_keypoints_per_image = Some(average_keypoints(&features));
        ctx.flush()?;
        ctx.put_artifact(FEATURES_ARTIFACT, &features_to_json(&features)?)?;
        ctx.put_artifact(GLOBAL_DESCRIPTORS_ARTIFACT, &global_descriptors_to_json(&features)?)?;

        // Pairing
        let policy =
            PairPolicy::from_neighbors_count(options.neighbors_count, self.config.default_neighbors_count, total_images)?;
        let posed: Vec<PosedImage> = capture
            .images
            .iter()
            .map(|image| PosedImage {
                name: &image.name,
                cam_from_world: image.cam_from_world,
            })
            .collect();
        let metric = PoseDistance {
            rotation_weight: self.config.rotation_weight,
        };
        let pairs = select_pairs(&posed, policy, &metric);
        info!("Selected {} candidate pairs ({:?})", pairs.len(), policy);
        ctx.put_artifact(PAIRS_ARTIFACT, pairs_to_text(&pairs).as_bytes())?;

        // Matching
        let match_sets = match_all(&pairs, &capture.images, &features, self.matcher.as_ref(), show_progress)?;

        // Database
        let mut database = build_database(
            &capture,
            &features,
            &match_sets,
            self.config.pose_prior_position_sigma_m,
        )?;
        let pair_ids = database.pair_ids(&pairs)?;
        self.mapper
            .verify_matches(&mut database, &pair_ids, &self.config.two_view_geometry)?;

        // Mapping
        let mapper_options = MapperOptions::from_reconstruction_options(&options);
        let mut models = self.mapper.reconstruct(&database, &image_root, &mapper_options)?;
        let best_index = select_best(&models)?;
        let best = models.swap_remove(best_index);
        info!(
            "Selected model {} of {} with {} registered images",
            best_index,
            models.len() + 1,
            best.num_registered_images()
        );
        if best.num_registered_images() < self.config.min_model_size {
            warn!(
                "Best model registers {} images, below the minimum model size of {}",
                best.num_registered_images(),
                self.config.min_model_size
            );
        }

        // Export
        ctx.put_artifact(MODEL_CAMERAS_ARTIFACT, cameras_txt(&best).as_bytes())?;
        ctx.put_artifact(MODEL_IMAGES_ARTIFACT, images_txt(&best).as_bytes())?;
        ctx.put_artifact(MODEL_POINTS_ARTIFACT, points3d_txt(&best).as_bytes())?;
        ctx.put_artifact(MODEL_PLY_ARTIFACT, &points_to_ply(&best)?)?;

        // Metrics
        compute_metrics(&mut ctx.manifest.metrics, &best, total_images)?;
        ctx.flush()?;

        Ok(best)
    }
}
