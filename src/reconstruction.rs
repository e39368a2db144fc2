//! Reconstructed components as returned by a mapper, and best-component selection.

use std::collections::{BTreeMap, HashSet};

use log::info;
use nalgebra::{Point2, Point3};

use crate::error::ReconstructionError;
use crate::geometry::Pose;
use crate::rig::CameraModelId;

/// Points closer to the image plane than this are treated as unprojectable.
const MIN_DEPTH: f64 = f64::EPSILON;

#[derive(Debug, Clone, PartialEq)]
pub struct ModelCamera {
    pub camera_id: u32,
    pub model: CameraModelId,
    pub width: u32,
    pub height: u32,
    pub params: Vec<f64>,
}

impl ModelCamera {
    /// Project a point in camera coordinates to pixel coordinates.
    ///
    /// Returns `None` for points behind the camera, for models without a closed-form
    /// projection, and for parameter vectors of the wrong length.
    pub fn img_from_cam(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z < MIN_DEPTH {
            return None;
        }
        let u = point.x / point.z;
        let v = point.y / point.z;
        let p = self.params.as_slice();

        let (x, y) = match (self.model, p) {
            (CameraModelId::SimplePinhole, &[f, cx, cy]) => (f * u + cx, f * v + cy),
            (CameraModelId::Pinhole, &[fx, fy, cx, cy]) => (fx * u + cx, fy * v + cy),
            (CameraModelId::SimpleRadial, &[f, cx, cy, k]) => {
                let radial = k * (u * u + v * v);
                (f * u * (1.0 + radial) + cx, f * v * (1.0 + radial) + cy)
            }
            (CameraModelId::Radial, &[f, cx, cy, k1, k2]) => {
                let r2 = u * u + v * v;
                let radial = k1 * r2 + k2 * r2 * r2;
                (f * u * (1.0 + radial) + cx, f * v * (1.0 + radial) + cy)
            }
            (CameraModelId::Opencv, &[fx, fy, cx, cy, k1, k2, p1, p2]) => {
                let (u2, v2, uv) = (u * u, v * v, u * v);
                let r2 = u2 + v2;
                let radial = k1 * r2 + k2 * r2 * r2;
                let du = u * radial + 2.0 * p1 * uv + p2 * (r2 + 2.0 * u2);
                let dv = v * radial + 2.0 * p2 * uv + p1 * (r2 + 2.0 * v2);
                (fx * (u + du) + cx, fy * (v + dv) + cy)
            }
            _ => return None,
        };
        Some(Point2::new(x, y))
    }
}

/// One keypoint of a registered image and the 3D point it observes, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Point2D {
    pub xy: Point2<f64>,
    pub point3d_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredImage {
    pub image_id: u32,
    pub camera_id: u32,
    pub name: String,
    pub cam_from_world: Pose,
    pub points2d: Vec<Point2D>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackElement {
    pub image_id: u32,
    pub point2d_idx: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point3D {
    pub xyz: Point3<f64>,
    pub color: [u8; 3],
    pub error: f64,
    pub track: Vec<TrackElement>,
}

impl Point3D {
    /// Number of distinct images observing the point.
    pub fn track_length(&self) -> usize {
        self.track
            .iter()
            .map(|element| element.image_id)
            .collect::<HashSet<_>>()
            .len()
    }
}

/// One connected component produced by incremental mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub cameras: BTreeMap<u32, ModelCamera>,
    pub images: BTreeMap<u32, RegisteredImage>,
    pub points: BTreeMap<u64, Point3D>,
}

impl Reconstruction {
    pub fn num_registered_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Project a world point into a registered image.
    pub fn project(&self, image_id: u32, xyz: &Point3<f64>) -> Option<Point2<f64>> {
        let image = self.images.get(&image_id)?;
        let camera = self.cameras.get(&image.camera_id)?;
        camera.img_from_cam(&image.cam_from_world.transform_point(xyz))
    }
}

/// Index of the component with the most registered images; the lowest index wins ties.
pub fn select_best(models: &[Reconstruction]) -> Result<usize, ReconstructionError> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, model) in models.iter().enumerate() {
        let registered = model.num_registered_images();
        info!("  model {}: {} registered images, {} points", idx, registered, model.num_points());
        if best.map_or(true, |(_, count)| registered > count) {
            best = Some((idx, registered));
        }
    }
    best.map(|(idx, _)| idx).ok_or(ReconstructionError::NoModel)
}
