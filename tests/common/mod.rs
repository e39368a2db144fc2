#![allow(dead_code)]

use std::fs;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use nalgebra::{Point2, Point3, UnitQuaternion, Vector3};
use ndarray::Array2;

use rig_reconstruction::capture::Image;
use rig_reconstruction::config::TwoViewGeometryOptions;
use rig_reconstruction::database::{ImageId, ReconstructionDatabase, TwoViewGeometry};
use rig_reconstruction::features::{ExtractionOptions, FeatureExtractor, FeatureMatcher, Features, NO_MATCH};
use rig_reconstruction::geometry::pose_from_parts;
use rig_reconstruction::reconstruction::{ModelCamera, Point2D, Point3D, Reconstruction, RegisteredImage, TrackElement};
use rig_reconstruction::rig::CameraModelId;
use rig_reconstruction::solver::{IncrementalMapper, MapperOptions};

pub const KEYPOINTS_PER_IMAGE: usize = 8;

/// Two cameras on one rig; `cam1` sits 10 cm along the camera x axis.
pub const TWO_CAMERA_RIG: &str = r#"{
    "rigs": [{
        "id": "rig0",
        "cameras": [
            {
                "id": "cam0",
                "ref_sensor": true,
                "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
                "translation": {"x": 0.0, "y": 0.0, "z": 0.0},
                "intrinsics": {"model": "PINHOLE", "width": 32, "height": 24,
                               "fx": 30.0, "fy": 30.0, "cx": 16.0, "cy": 12.0}
            },
            {
                "id": "cam1",
                "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
                "translation": {"x": 0.1, "y": 0.0, "z": 0.0},
                "intrinsics": {"model": "OPENCV", "width": 32, "height": 24,
                               "fx": 30.0, "fy": 30.0, "cx": 16.0, "cy": 12.0,
                               "k1": 0.0, "k2": 0.0, "p1": 0.0, "p2": 0.0}
            }
        ]
    }]
}"#;

pub fn jpeg_bytes(seed: u8) -> Vec<u8> {
    let mut img = RgbImage::new(32, 24);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        *pixel = Rgb([seed.wrapping_add(x as u8 * 7), (y as u8).wrapping_mul(9), seed]);
    }
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Jpeg)
        .unwrap();
    buf.into_inner()
}

pub fn frames_csv(num_frames: usize) -> String {
    let mut csv = String::from("timestamp,tx,ty,tz,qx,qy,qz,qw\n");
    for i in 0..num_frames {
        // Rig center moves one meter along +x per frame.
        csv.push_str(&format!("{:04},{},0,0,0,0,0,1\n", i, -(i as f64)));
    }
    csv
}

/// Write the two-camera capture with `num_frames` frames under `root`.
pub fn write_capture(root: &Path, num_frames: usize) {
    fs::create_dir_all(root.join("rig0/cam0")).unwrap();
    fs::create_dir_all(root.join("rig0/cam1")).unwrap();
    fs::write(root.join("config.json"), TWO_CAMERA_RIG).unwrap();
    fs::write(root.join("rig0/frames.csv"), frames_csv(num_frames)).unwrap();
    for i in 0..num_frames {
        for (c, camera) in ["cam0", "cam1"].iter().enumerate() {
            let path = root.join(format!("rig0/{}/{:04}.jpg", camera, i));
            fs::write(path, jpeg_bytes((i * 2 + c) as u8 * 20)).unwrap();
        }
    }
}

/// Fixed keypoints `(i, 2i)` and descriptors; counts calls.
#[derive(Default, Clone)]
pub struct StubExtractor {
    pub calls: Arc<AtomicUsize>,
}

impl FeatureExtractor for StubExtractor {
    fn extract(&self, _image: &Image, _options: &ExtractionOptions) -> Result<Features> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Features {
            keypoints: (0..KEYPOINTS_PER_IMAGE).map(|i| [i as f32, 2.0 * i as f32]).collect(),
            descriptors: Array2::from_shape_fn((KEYPOINTS_PER_IMAGE, 4), |(r, c)| (r + c) as f32),
            global_descriptor: vec![1.0, 0.0, 0.0],
        })
    }
}

/// Matches keypoint `i` to `i`, except every third query keypoint, which is unmatched.
pub struct StubMatcher;

impl FeatureMatcher for StubMatcher {
    fn match_features(&self, query: &Features, train: &Features, _image_size: (u32, u32)) -> Result<Vec<i64>> {
        Ok((0..query.len())
            .map(|i| if i % 3 == 2 || i >= train.len() { NO_MATCH } else { i as i64 })
            .collect())
    }
}

/// Accepts every raw match as verified and returns canned models.
#[derive(Default)]
pub struct StubMapper {
    pub models: Vec<Reconstruction>,
    pub verified_pairs: Arc<Mutex<Vec<(ImageId, ImageId)>>>,
    pub options: Arc<Mutex<Option<MapperOptions>>>,
}

impl IncrementalMapper for StubMapper {
    fn verify_matches(
        &self,
        database: &mut ReconstructionDatabase,
        pairs: &[(ImageId, ImageId)],
        _options: &TwoViewGeometryOptions,
    ) -> Result<()> {
        let geometries: Vec<TwoViewGeometry> = database
            .matches()
            .iter()
            .map(|m| TwoViewGeometry {
                image_id1: m.image_id1,
                image_id2: m.image_id2,
                inlier_matches: m.matches.clone(),
                cam2_from_cam1: None,
            })
            .collect();
        for geometry in geometries {
            database.write_two_view_geometry(geometry)?;
        }
        self.verified_pairs.lock().unwrap().extend_from_slice(pairs);
        Ok(())
    }

    fn reconstruct(
        &self,
        _database: &ReconstructionDatabase,
        _image_root: &Path,
        options: &MapperOptions,
    ) -> Result<Vec<Reconstruction>> {
        *self.options.lock().unwrap() = Some(options.clone());
        Ok(self.models.clone())
    }
}

/// Pinhole model with `num_images` registered images along +x, every point seen by every
/// image with an observation offset of half a pixel in x.
pub fn synthetic_model(num_images: u32, num_points: u64) -> Reconstruction {
    let mut model = Reconstruction::default();
    model.cameras.insert(
        1,
        ModelCamera {
            camera_id: 1,
            model: CameraModelId::Pinhole,
            width: 32,
            height: 24,
            params: vec![30.0, 30.0, 16.0, 12.0],
        },
    );
    for id in 1..=num_points {
        model.points.insert(
            id,
            Point3D {
                xyz: Point3::new(id as f64 * 0.2 - 0.3, 0.1, 3.0),
                color: [200, 100, id as u8],
                error: 0.5,
                track: (1..=num_images)
                    .map(|image_id| TrackElement {
                        image_id,
                        point2d_idx: (id - 1) as u32,
                    })
                    .collect(),
            },
        );
    }
    for image_id in 1..=num_images {
        let mut image = RegisteredImage {
            image_id,
            camera_id: 1,
            name: format!("rig0/cam0/{:04}.jpg", image_id - 1),
            cam_from_world: pose_from_parts(
                UnitQuaternion::identity(),
                Vector3::new(-(image_id as f64 - 1.0) * 0.1, 0.0, 0.0),
            ),
            points2d: Vec::new(),
        };
        model.images.insert(image_id, image.clone());
        for (id, point) in &model.points {
            let projected = model.project(image_id, &point.xyz).unwrap();
            image.points2d.push(Point2D {
                xy: Point2::new(projected.x + 0.5, projected.y),
                point3d_id: Some(*id),
            });
        }
        model.images.insert(image_id, image);
    }
    model
}
