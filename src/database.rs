//! Solver input database and the identifier bookkeeping between capture names and
//! solver ids.
//!
//! Ids are assigned sequentially from 1 in write order. Every keypoint, prior and match
//! write must reference an id handed out earlier by the same database.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use log::{debug, info};
use nalgebra::{Matrix3, Point3};
use serde::{Deserialize, Serialize};

use crate::capture::Capture;
use crate::error::ReconstructionError;
use crate::features::{Features, MatchSet};
use crate::geometry::{camera_center, Pose};
use crate::pairs::CandidatePair;
use crate::rig::{CameraModelId, Intrinsics};

/// Keypoints are written with the origin at the center of the top-left pixel.
pub const PIXEL_CENTER_OFFSET: f32 = 0.5;

pub type CameraId = u32;
pub type ImageId = u32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverCamera {
    pub camera_id: CameraId,
    pub model: CameraModelId,
    pub width: u32,
    pub height: u32,
    pub params: Vec<f64>,
    pub has_prior_focal_length: bool,
}

impl SolverCamera {
    pub fn from_intrinsics(camera_id: CameraId, intrinsics: &Intrinsics) -> Self {
        let (width, height) = intrinsics.size();
        Self {
            camera_id,
            model: intrinsics.model(),
            width,
            height,
            params: intrinsics.params(),
            has_prior_focal_length: true,
        }
    }
}

/// One camera slot of a rig constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigSensor {
    pub camera_id: CameraId,
    /// Images whose name starts with this prefix belong to the sensor.
    pub image_prefix: String,
    pub ref_sensor: bool,
    pub cam_from_rig: Pose,
}

/// Rigid calibration between the cameras of one rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConstraint {
    pub rig_id: String,
    pub sensors: Vec<RigSensor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseImage {
    pub image_id: ImageId,
    pub name: String,
    pub camera_id: CameraId,
}

/// Soft position prior on a camera center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePrior {
    pub position: Point3<f64>,
    pub position_covariance: Matrix3<f64>,
}

impl PosePrior {
    /// Prior on the center of `cam_from_world` with isotropic standard deviation `sigma`.
    pub fn isotropic(cam_from_world: &Pose, sigma: f64) -> Self {
        Self {
            position: camera_center(cam_from_world),
            position_covariance: Matrix3::identity() * (sigma * sigma),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairMatches {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub matches: Vec<[u32; 2]>,
}

/// Geometrically verified matches of one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwoViewGeometry {
    pub image_id1: ImageId,
    pub image_id2: ImageId,
    pub inlier_matches: Vec<[u32; 2]>,
    /// Relative pose `cam2_from_cam1`, when estimated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cam2_from_cam1: Option<Pose>,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconstructionDatabase {
    cameras: Vec<SolverCamera>,
    rigs: Vec<RigConstraint>,
    images: Vec<DatabaseImage>,
    keypoints: BTreeMap<ImageId, Vec<[f32; 2]>>,
    pose_priors: BTreeMap<ImageId, PosePrior>,
    matches: Vec<PairMatches>,
    two_view_geometries: Vec<TwoViewGeometry>,
    #[serde(skip)]
    camera_ids: HashMap<(String, String), CameraId>,
    #[serde(skip)]
    image_ids: HashMap<String, ImageId>,
}

impl ReconstructionDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the intrinsics of one rig camera slot. Each slot is written once.
    pub fn write_camera(
        &mut self,
        rig_id: &str,
        camera_id: &str,
        intrinsics: &Intrinsics,
    ) -> Result<CameraId, ReconstructionError> {
        let key = (rig_id.to_string(), camera_id.to_string());
        if self.camera_ids.contains_key(&key) {
            return Err(ReconstructionError::DuplicateCamera {
                rig: key.0,
                camera: key.1,
            });
        }
        let id = self.cameras.len() as CameraId + 1;
        self.cameras.push(SolverCamera::from_intrinsics(id, intrinsics));
        self.camera_ids.insert(key, id);
        Ok(id)
    }

    pub fn camera_id(&self, rig_id: &str, camera_id: &str) -> Option<CameraId> {
        self.camera_ids
            .get(&(rig_id.to_string(), camera_id.to_string()))
            .copied()
    }

    pub fn write_rig(&mut self, rig: RigConstraint) -> Result<(), ReconstructionError> {
        for sensor in &rig.sensors {
            self.check_camera(sensor.camera_id)?;
        }
        self.rigs.push(rig);
        Ok(())
    }

    pub fn write_image(&mut self, name: &str, camera_id: CameraId) -> Result<ImageId, ReconstructionError> {
        self.check_camera(camera_id)?;
        if self.image_ids.contains_key(name) {
            return Err(ReconstructionError::DuplicateImage(name.to_string()));
        }
        let id = self.images.len() as ImageId + 1;
        self.images.push(DatabaseImage {
            image_id: id,
            name: name.to_string(),
            camera_id,
        });
        self.image_ids.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn image_id(&self, name: &str) -> Option<ImageId> {
        self.image_ids.get(name).copied()
    }

    /// Store extractor keypoints, shifted from corner to pixel-center convention.
    pub fn write_keypoints(&mut self, image_id: ImageId, keypoints: &[[f32; 2]]) -> Result<(), ReconstructionError> {
        self.check_image(image_id)?;
        let shifted = keypoints
            .iter()
            .map(|[x, y]| [x + PIXEL_CENTER_OFFSET, y + PIXEL_CENTER_OFFSET])
            .collect();
        self.keypoints.insert(image_id, shifted);
        Ok(())
    }

    pub fn write_pose_prior(&mut self, image_id: ImageId, prior: PosePrior) -> Result<(), ReconstructionError> {
        self.check_image(image_id)?;
        self.pose_priors.insert(image_id, prior);
        Ok(())
    }

    pub fn write_matches(
        &mut self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[[u32; 2]],
    ) -> Result<(), ReconstructionError> {
        self.check_match_indices(image_id1, image_id2, matches)?;
        self.matches.push(PairMatches {
            image_id1,
            image_id2,
            matches: matches.to_vec(),
        });
        Ok(())
    }

    pub fn write_two_view_geometry(&mut self, geometry: TwoViewGeometry) -> Result<(), ReconstructionError> {
        self.check_match_indices(geometry.image_id1, geometry.image_id2, &geometry.inlier_matches)?;
        self.two_view_geometries.push(geometry);
        Ok(())
    }

    /// Solver ids of each candidate pair, in pair order.
    pub fn pair_ids(&self, pairs: &BTreeSet<CandidatePair>) -> Result<Vec<(ImageId, ImageId)>, ReconstructionError> {
        pairs
            .iter()
            .map(|pair| {
                let id = |name: &str| {
                    self.image_id(name)
                        .ok_or_else(|| ReconstructionError::UnmappedImage(name.to_string()))
                };
                Ok((id(pair.first())?, id(pair.second())?))
            })
            .collect()
    }

    pub fn cameras(&self) -> &[SolverCamera] {
        &self.cameras
    }

    pub fn rigs(&self) -> &[RigConstraint] {
        &self.rigs
    }

    pub fn images(&self) -> &[DatabaseImage] {
        &self.images
    }

    pub fn keypoints(&self, image_id: ImageId) -> Option<&[[f32; 2]]> {
        self.keypoints.get(&image_id).map(Vec::as_slice)
    }

    pub fn pose_prior(&self, image_id: ImageId) -> Option<&PosePrior> {
        self.pose_priors.get(&image_id)
    }

    pub fn matches(&self) -> &[PairMatches] {
        &self.matches
    }

    pub fn two_view_geometries(&self) -> &[TwoViewGeometry] {
        &self.two_view_geometries
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn check_camera(&self, camera_id: CameraId) -> Result<(), ReconstructionError> {
        if camera_id == 0 || camera_id as usize > self.cameras.len() {
            return Err(ReconstructionError::UnknownCameraId(camera_id));
        }
        Ok(())
    }

    fn check_image(&self, image_id: ImageId) -> Result<(), ReconstructionError> {
        if image_id == 0 || image_id as usize > self.images.len() {
            return Err(ReconstructionError::UnknownImageId(image_id));
        }
        Ok(())
    }

    fn check_match_indices(
        &self,
        image_id1: ImageId,
        image_id2: ImageId,
        matches: &[[u32; 2]],
    ) -> Result<(), ReconstructionError> {
        self.check_image(image_id1)?;
        self.check_image(image_id2)?;
        let num1 = self.keypoints.get(&image_id1).map_or(0, Vec::len);
        let num2 = self.keypoints.get(&image_id2).map_or(0, Vec::len);
        for &[idx1, idx2] in matches {
            if idx1 as usize >= num1 {
                return Err(ReconstructionError::MatchIndexOutOfRange {
                    image_id: image_id1,
                    index: idx1,
                    num_keypoints: num1,
                });
            }
            if idx2 as usize >= num2 {
                return Err(ReconstructionError::MatchIndexOutOfRange {
                    image_id: image_id2,
                    index: idx2,
                    num_keypoints: num2,
                });
            }
        }
        Ok(())
    }
}

/// Seed a database from the capture, the extracted features and the filtered matches.
///
/// Write order is fixed: cameras and rigs in configuration order, then images in
/// ingestion order, then matches in canonical pair order.
pub fn build_database(
    capture: &Capture,
    features: &BTreeMap<String, Features>,
    match_sets: &[MatchSet],
    prior_position_sigma: f64,
) -> Result<ReconstructionDatabase> {
    let mut database = ReconstructionDatabase::new();

    for rig in &capture.rig_config.rigs {
        let mut sensors = Vec::with_capacity(rig.cameras.len());
        for camera in &rig.cameras {
            let camera_id = database.write_camera(&rig.id, &camera.id, &camera.intrinsics)?;
            sensors.push(RigSensor {
                camera_id,
                image_prefix: format!("{}/{}/", rig.id, camera.id),
                ref_sensor: camera.is_ref_sensor(),
                cam_from_rig: camera.cam_from_rig(),
            });
        }
        database.write_rig(RigConstraint {
            rig_id: rig.id.clone(),
            sensors,
        })?;
    }

    for image in &capture.images {
        let camera_id = database
            .camera_id(&image.rig_id, &image.camera_id)
            .ok_or_else(|| ReconstructionError::UnmappedImage(image.name.clone()))?;
        let image_id = database.write_image(&image.name, camera_id)?;
        debug!("  {} -> image {} camera {}", image.name, image_id, camera_id);

        let keypoints = features
            .get(&image.name)
            .ok_or_else(|| ReconstructionError::MissingFeatures(image.name.clone()))?;
        database.write_keypoints(image_id, &keypoints.keypoints)?;
        database.write_pose_prior(image_id, PosePrior::isotropic(&image.cam_from_world, prior_position_sigma))?;
    }

    for set in match_sets {
        let id1 = database
            .image_id(set.pair.first())
            .ok_or_else(|| ReconstructionError::UnmappedImage(set.pair.first().to_string()))?;
        let id2 = database
            .image_id(set.pair.second())
            .ok_or_else(|| ReconstructionError::UnmappedImage(set.pair.second().to_string()))?;
        database.write_matches(id1, id2, &set.matches)?;
    }

    info!(
        "Seeded database: {} cameras, {} rigs, {} images, {} matched pairs",
        database.cameras().len(),
        database.rigs().len(),
        database.images().len(),
        database.matches().len()
    );
    Ok(database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::pose_from_parts;
    use nalgebra::{UnitQuaternion, Vector3};

    fn pinhole() -> Intrinsics {
        Intrinsics::Pinhole {
            width: 64,
            height: 48,
            fx: 50.0,
            fy: 50.0,
            cx: 32.0,
            cy: 24.0,
        }
    }

    #[test]
    fn keypoints_are_shifted_by_half_a_pixel() {
        let mut db = ReconstructionDatabase::new();
        let cam = db.write_camera("rig", "cam", &pinhole()).unwrap();
        let img = db.write_image("rig/cam/0.jpg", cam).unwrap();

        let raw = [[0.0f32, 0.0], [10.25, 3.5], [63.0, 47.0]];
        db.write_keypoints(img, &raw).unwrap();

        let stored = db.keypoints(img).unwrap();
        assert_eq!(stored.len(), raw.len());
        for (s, r) in stored.iter().zip(raw.iter()) {
            assert_eq!(s[0] - r[0], 0.5);
            assert_eq!(s[1] - r[1], 0.5);
        }
    }

    #[test]
    fn ids_are_sequential_and_cameras_unique_per_slot() {
        let mut db = ReconstructionDatabase::new();
        assert_eq!(db.write_camera("r", "a", &pinhole()).unwrap(), 1);
        assert_eq!(db.write_camera("r", "b", &pinhole()).unwrap(), 2);
        assert!(matches!(
            db.write_camera("r", "a", &pinhole()),
            Err(ReconstructionError::DuplicateCamera { .. })
        ));
        assert_eq!(db.camera_id("r", "b"), Some(2));

        assert_eq!(db.write_image("r/a/0.jpg", 1).unwrap(), 1);
        assert_eq!(db.write_image("r/b/0.jpg", 2).unwrap(), 2);
        assert_eq!(db.image_id("r/b/0.jpg"), Some(2));
        assert!(matches!(
            db.write_image("r/a/0.jpg", 1),
            Err(ReconstructionError::DuplicateImage(_))
        ));
    }

    #[test]
    fn writes_must_reference_known_ids() {
        let mut db = ReconstructionDatabase::new();
        assert!(matches!(
            db.write_image("x.jpg", 1),
            Err(ReconstructionError::UnknownCameraId(1))
        ));
        assert!(matches!(
            db.write_keypoints(3, &[]),
            Err(ReconstructionError::UnknownImageId(3))
        ));
        assert!(matches!(
            db.write_matches(1, 2, &[]),
            Err(ReconstructionError::UnknownImageId(1))
        ));
    }

    #[test]
    fn match_indices_are_bounded_by_keypoints() {
        let mut db = ReconstructionDatabase::new();
        let cam = db.write_camera("r", "a", &pinhole()).unwrap();
        let a = db.write_image("r/a/0.jpg", cam).unwrap();
        let b = db.write_image("r/a/1.jpg", cam).unwrap();
        db.write_keypoints(a, &[[0.0, 0.0], [1.0, 1.0]]).unwrap();
        db.write_keypoints(b, &[[0.0, 0.0]]).unwrap();

        db.write_matches(a, b, &[[1, 0]]).unwrap();
        assert!(matches!(
            db.write_matches(a, b, &[[0, 1]]),
            Err(ReconstructionError::MatchIndexOutOfRange { index: 1, num_keypoints: 1, .. })
        ));
        assert_eq!(db.matches().len(), 1);
    }

    #[test]
    fn pose_prior_is_camera_center_with_isotropic_covariance() {
        let cam_from_world = pose_from_parts(
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2),
            Vector3::new(1.0, 2.0, 3.0),
        );
        let prior = PosePrior::isotropic(&cam_from_world, 0.25);

        // The center maps to the camera origin.
        let origin = cam_from_world.transform_point(&prior.position);
        assert!(origin.coords.norm() < 1e-12);
        assert_eq!(prior.position_covariance, Matrix3::identity() * 0.0625);
    }

    #[test]
    fn database_serializes_without_lookup_tables() {
        let mut db = ReconstructionDatabase::new();
        let cam = db.write_camera("r", "a", &pinhole()).unwrap();
        db.write_image("r/a/0.jpg", cam).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&db.to_json().unwrap()).unwrap();
        assert_eq!(json["cameras"][0]["model"], "PINHOLE");
        assert_eq!(json["images"][0]["name"], "r/a/0.jpg");
        assert!(json.get("image_ids").is_none());
    }
}
