//! Reconstruction manifest and its lifecycle.
//!
//! Status moves `queued -> running -> {succeeded, failed}`. The manifest is written back to
//! the store at every milestone so an interrupted run still shows how far it got.

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::metrics::ReconstructionMetrics;
use crate::store::{artifact_key, ArtifactStore};

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconstructionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// Per-job options. Unset fields keep the mapper's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionOptions {
    /// Nearest neighbors per image for pairing; `-1` matches every pair.
    #[serde(default, rename = "neightbors_count", alias = "neighbors_count")]
    pub neighbors_count: Option<i64>,
    #[serde(default)]
    pub max_keypoints_per_image: Option<usize>,
    #[serde(default)]
    pub use_prior_position: Option<bool>,
    #[serde(default)]
    pub ba_refine_sensor_from_rig: Option<bool>,
    #[serde(default)]
    pub ba_refine_focal_length: Option<bool>,
    #[serde(default)]
    pub ba_refine_principal_point: Option<bool>,
    #[serde(default)]
    pub ba_refine_extra_params: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionManifest {
    pub capture_id: String,
    pub status: ReconstructionStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub options: ReconstructionOptions,
    #[serde(default)]
    pub metrics: ReconstructionMetrics,
}

impl ReconstructionManifest {
    pub fn queued(capture_id: impl Into<String>, options: ReconstructionOptions) -> Self {
        Self {
            capture_id: capture_id.into(),
            status: ReconstructionStatus::Queued,
            error: None,
            options,
            metrics: ReconstructionMetrics::default(),
        }
    }
}

/// The manifest of one run together with where it is persisted.
pub struct ManifestContext<'a> {
    reconstruction_id: String,
    pub manifest: ReconstructionManifest,
    store: &'a dyn ArtifactStore,
}

impl<'a> ManifestContext<'a> {
    pub fn new(store: &'a dyn ArtifactStore, reconstruction_id: impl Into<String>, manifest: ReconstructionManifest) -> Self {
        Self {
            reconstruction_id: reconstruction_id.into(),
            manifest,
            store,
        }
    }

    /// Load the manifest the caller created for `reconstruction_id`.
    pub fn load(store: &'a dyn ArtifactStore, reconstruction_id: &str) -> Result<Self> {
        let key = artifact_key(reconstruction_id, MANIFEST_NAME);
        let Some(bytes) = store.get(&key)? else {
            bail!("No manifest found at {}", key);
        };
        let manifest: ReconstructionManifest =
            serde_json::from_slice(&bytes).with_context(|| format!("Invalid manifest at {}", key))?;
        Ok(Self::new(store, reconstruction_id, manifest))
    }

    pub fn reconstruction_id(&self) -> &str {
        &self.reconstruction_id
    }

    pub fn put_artifact(&self, name: &str, body: &[u8]) -> Result<()> {
        let key = artifact_key(&self.reconstruction_id, name);
        debug!("Uploading {} ({} bytes)", key, body.len());
        self.store
            .put(&key, body)
            .with_context(|| format!("Failed to upload {}", key))
    }

    pub fn flush(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&self.manifest)?;
        self.put_artifact(MANIFEST_NAME, &body)
    }

    pub fn mark_running(&mut self) -> Result<()> {
        info!("Reconstruction {} running", self.reconstruction_id);
        self.manifest.status = ReconstructionStatus::Running;
        self.manifest.error = None;
        self.flush()
    }

    pub fn mark_succeeded(&mut self) -> Result<()> {
        info!("Reconstruction {} succeeded", self.reconstruction_id);
        self.manifest.status = ReconstructionStatus::Succeeded;
        self.flush()
    }

    pub fn mark_failed(&mut self, message: String) -> Result<()> {
        error!("Reconstruction {} failed: {}", self.reconstruction_id, message);
        self.manifest.status = ReconstructionStatus::Failed;
        self.manifest.error = Some(message);
        self.flush()
    }
}
