//! COLMAP text model format (`cameras.txt`, `images.txt`, `points3D.txt`).
//!
//! Models are read back from external mappers in this format and the selected model is
//! published in it.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::debug;
use nalgebra::{Point2, Point3, Vector3};

use crate::error::ReconstructionError;
use crate::geometry::{pose_from_parts, quaternion_from_xyzw};
use crate::reconstruction::{ModelCamera, Point2D, Point3D, Reconstruction, RegisteredImage, TrackElement};
use crate::rig::CameraModelId;

pub const CAMERAS_FILE: &str = "cameras.txt";
pub const IMAGES_FILE: &str = "images.txt";
pub const POINTS3D_FILE: &str = "points3D.txt";

/// Point id written for keypoints that observe no 3D point.
const NO_POINT3D: i64 = -1;

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

fn field<T: FromStr>(file: &str, line: usize, parts: &[&str], idx: usize, what: &str) -> Result<T, ReconstructionError>
where
    T::Err: std::fmt::Display,
{
    let malformed = |reason: String| ReconstructionError::MalformedModel {
        file: file.to_string(),
        line,
        reason,
    };
    let raw = parts
        .get(idx)
        .ok_or_else(|| malformed(format!("missing {}", what)))?;
    raw.parse::<T>()
        .map_err(|e| malformed(format!("{} {:?}: {}", what, raw, e)))
}

/// Parser for COLMAP text files
pub struct ColmapParser;

impl ColmapParser {
    /// Parse `cameras.txt`. Model names this crate cannot project are kept as `GENERIC`.
    pub fn parse_cameras(content: &str) -> Result<BTreeMap<u32, ModelCamera>, ReconstructionError> {
        let mut cameras = BTreeMap::new();

        for (idx, line) in content.lines().enumerate() {
            if is_comment(line) || line.trim().is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let parts: Vec<&str> = line.split_whitespace().collect();

            let camera_id: u32 = field(CAMERAS_FILE, line_no, &parts, 0, "CAMERA_ID")?;
            let model_name: String = field(CAMERAS_FILE, line_no, &parts, 1, "MODEL")?;
            let width: u32 = field(CAMERAS_FILE, line_no, &parts, 2, "WIDTH")?;
            let height: u32 = field(CAMERAS_FILE, line_no, &parts, 3, "HEIGHT")?;
            let params = (4..parts.len())
                .map(|i| field::<f64>(CAMERAS_FILE, line_no, &parts, i, "PARAMS"))
                .collect::<Result<Vec<_>, _>>()?;

            let model = CameraModelId::parse(&model_name).unwrap_or_else(|| {
                debug!("Camera {} uses unsupported model {}", camera_id, model_name);
                CameraModelId::Generic
            });

            cameras.insert(
                camera_id,
                ModelCamera {
                    camera_id,
                    model,
                    width,
                    height,
                    params,
                },
            );
        }

        Ok(cameras)
    }

    /// Parse `images.txt`: a pose line followed by a (possibly empty) `POINTS2D[]` line.
    pub fn parse_images(content: &str) -> Result<BTreeMap<u32, RegisteredImage>, ReconstructionError> {
        let mut images = BTreeMap::new();
        let lines: Vec<(usize, &str)> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !is_comment(line))
            .collect();

        let mut i = 0;
        while i < lines.len() {
            let (idx, line) = lines[i];
            if line.trim().is_empty() {
                i += 1;
                continue;
            }
            let line_no = idx + 1;
            let parts: Vec<&str> = line.split_whitespace().collect();

            let image_id: u32 = field(IMAGES_FILE, line_no, &parts, 0, "IMAGE_ID")?;
            let mut q = [0.0f64; 4];
            for (k, value) in q.iter_mut().enumerate() {
                *value = field(IMAGES_FILE, line_no, &parts, 1 + k, "Q")?;
            }
            let mut t = [0.0f64; 3];
            for (k, value) in t.iter_mut().enumerate() {
                *value = field(IMAGES_FILE, line_no, &parts, 5 + k, "T")?;
            }
            let camera_id: u32 = field(IMAGES_FILE, line_no, &parts, 8, "CAMERA_ID")?;
            let name: String = field(IMAGES_FILE, line_no, &parts, 9, "NAME")?;

            let points2d = match lines.get(i + 1) {
                Some(&(points_idx, points_line)) => Self::parse_points2d(points_idx + 1, points_line)?,
                None => Vec::new(),
            };

            let [qw, qx, qy, qz] = q;
            images.insert(
                image_id,
                RegisteredImage {
                    image_id,
                    camera_id,
                    name,
                    cam_from_world: pose_from_parts(
                        quaternion_from_xyzw(qx, qy, qz, qw),
                        Vector3::new(t[0], t[1], t[2]),
                    ),
                    points2d,
                },
            );

            i += 2;
        }

        Ok(images)
    }

    fn parse_points2d(line_no: usize, line: &str) -> Result<Vec<Point2D>, ReconstructionError> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() % 3 != 0 {
            return Err(ReconstructionError::MalformedModel {
                file: IMAGES_FILE.to_string(),
                line: line_no,
                reason: format!("{} POINTS2D values is not a multiple of 3", parts.len()),
            });
        }
        (0..parts.len() / 3)
            .map(|k| {
                let x: f64 = field(IMAGES_FILE, line_no, &parts, 3 * k, "X")?;
                let y: f64 = field(IMAGES_FILE, line_no, &parts, 3 * k + 1, "Y")?;
                let id: i64 = field(IMAGES_FILE, line_no, &parts, 3 * k + 2, "POINT3D_ID")?;
                Ok(Point2D {
                    xy: Point2::new(x, y),
                    point3d_id: u64::try_from(id).ok(),
                })
            })
            .collect()
    }

    pub fn parse_points3d(content: &str) -> Result<BTreeMap<u64, Point3D>, ReconstructionError> {
        let mut points = BTreeMap::new();

        for (idx, line) in content.lines().enumerate() {
            if is_comment(line) || line.trim().is_empty() {
                continue;
            }
            let line_no = idx + 1;
            let parts: Vec<&str> = line.split_whitespace().collect();

            let point_id: u64 = field(POINTS3D_FILE, line_no, &parts, 0, "POINT3D_ID")?;
            let x: f64 = field(POINTS3D_FILE, line_no, &parts, 1, "X")?;
            let y: f64 = field(POINTS3D_FILE, line_no, &parts, 2, "Y")?;
            let z: f64 = field(POINTS3D_FILE, line_no, &parts, 3, "Z")?;
            let r: u8 = field(POINTS3D_FILE, line_no, &parts, 4, "R")?;
            let g: u8 = field(POINTS3D_FILE, line_no, &parts, 5, "G")?;
            let b: u8 = field(POINTS3D_FILE, line_no, &parts, 6, "B")?;
            let error: f64 = field(POINTS3D_FILE, line_no, &parts, 7, "ERROR")?;

            let track_fields = parts.len().saturating_sub(8);
            if track_fields % 2 != 0 {
                return Err(ReconstructionError::MalformedModel {
                    file: POINTS3D_FILE.to_string(),
                    line: line_no,
                    reason: "TRACK[] has an odd number of values".into(),
                });
            }
            let track = (0..track_fields / 2)
                .map(|k| {
                    Ok(TrackElement {
                        image_id: field(POINTS3D_FILE, line_no, &parts, 8 + 2 * k, "IMAGE_ID")?,
                        point2d_idx: field(POINTS3D_FILE, line_no, &parts, 9 + 2 * k, "POINT2D_IDX")?,
                    })
                })
                .collect::<Result<Vec<_>, ReconstructionError>>()?;

            points.insert(
                point_id,
                Point3D {
                    xyz: Point3::new(x, y, z),
                    color: [r, g, b],
                    error,
                    track,
                },
            );
        }

        Ok(points)
    }

    /// Read a model directory containing the three text files.
    pub fn read_model(dir: &Path) -> Result<Reconstruction> {
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
        };

        let cameras = Self::parse_cameras(&read(CAMERAS_FILE)?)
            .with_context(|| format!("Invalid model in {}", dir.display()))?;
        let images = Self::parse_images(&read(IMAGES_FILE)?)
            .with_context(|| format!("Invalid model in {}", dir.display()))?;
        let points = Self::parse_points3d(&read(POINTS3D_FILE)?)
            .with_context(|| format!("Invalid model in {}", dir.display()))?;

        Ok(Reconstruction {
            cameras,
            images,
            points,
        })
    }
}

pub fn cameras_txt(model: &Reconstruction) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Camera list with one line of data per camera:");
    let _ = writeln!(out, "#   CAMERA_ID, MODEL, WIDTH, HEIGHT, PARAMS[]");
    let _ = writeln!(out, "# Number of cameras: {}", model.cameras.len());

    for camera in model.cameras.values() {
        let _ = write!(
            out,
            "{} {} {} {}",
            camera.camera_id,
            camera.model.as_str(),
            camera.width,
            camera.height
        );
        for param in &camera.params {
            let _ = write!(out, " {}", param);
        }
        let _ = writeln!(out);
    }
    out
}

pub fn images_txt(model: &Reconstruction) -> String {
    let observations: usize = model
        .images
        .values()
        .map(|image| image.points2d.iter().filter(|p| p.point3d_id.is_some()).count())
        .sum();

    let mut out = String::new();
    let _ = writeln!(out, "# Image list with two lines of data per image:");
    let _ = writeln!(out, "#   IMAGE_ID, QW, QX, QY, QZ, TX, TY, TZ, CAMERA_ID, NAME");
    let _ = writeln!(out, "#   POINTS2D[] as (X, Y, POINT3D_ID)");
    let _ = writeln!(
        out,
        "# Number of images: {}, observations: {}",
        model.images.len(),
        observations
    );

    for image in model.images.values() {
        let q = &image.cam_from_world.rotation.coords;
        let t = &image.cam_from_world.translation.vector;
        let _ = writeln!(
            out,
            "{} {} {} {} {} {} {} {} {} {}",
            image.image_id, q[3], q[0], q[1], q[2], t[0], t[1], t[2], image.camera_id, image.name
        );

        let points: Vec<String> = image
            .points2d
            .iter()
            .map(|p| {
                let id = p.point3d_id.map_or(NO_POINT3D, |id| id as i64);
                format!("{} {} {}", p.xy.x, p.xy.y, id)
            })
            .collect();
        let _ = writeln!(out, "{}", points.join(" "));
    }
    out
}

pub fn points3d_txt(model: &Reconstruction) -> String {
    let mean_track = if model.points.is_empty() {
        0.0
    } else {
        model.points.values().map(|p| p.track.len()).sum::<usize>() as f64 / model.points.len() as f64
    };

    let mut out = String::new();
    let _ = writeln!(out, "# 3D point list with one line of data per point:");
    let _ = writeln!(
        out,
        "#   POINT3D_ID, X, Y, Z, R, G, B, ERROR, TRACK[] as (IMAGE_ID, POINT2D_IDX)"
    );
    let _ = writeln!(
        out,
        "# Number of points: {}, mean track length: {}",
        model.points.len(),
        mean_track
    );

    for (id, point) in &model.points {
        let _ = write!(
            out,
            "{} {} {} {} {} {} {} {}",
            id, point.xyz.x, point.xyz.y, point.xyz.z, point.color[0], point.color[1], point.color[2], point.error
        );
        for element in &point.track {
            let _ = write!(out, " {} {}", element.image_id, element.point2d_idx);
        }
        let _ = writeln!(out);
    }
    out
}
