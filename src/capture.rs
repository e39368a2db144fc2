//! Capture ingestion: rig configuration, per-rig frame poses, and the derived image set.
//!
//! A capture is addressed by keys:
//! - `config.json` - the [`RigConfig`]
//! - `{rig}/frames.csv` - `timestamp, tx, ty, tz, qx, qy, qz, qw` per frame, with a header row
//! - `{rig}/{camera}/{frame}.jpg` - one image per camera per frame

use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use nalgebra::Vector3;
use zip::ZipArchive;

use crate::error::ReconstructionError;
use crate::geometry::{compose, pose_from_parts, quaternion_from_xyzw, Pose};
use crate::image_loader::{DecodedImage, ImageLoader};
use crate::rig::RigConfig;

pub const CONFIG_KEY: &str = "config.json";

/// Read access to the objects of one capture.
pub trait CaptureSource {
    /// Returns the bytes stored under `key`, or [`ReconstructionError::MissingCaptureObject`].
    fn read(&mut self, key: &str) -> Result<Vec<u8>>;
}

/// Capture unpacked into a directory tree.
pub struct DirectoryCapture {
    root: PathBuf,
}

impl DirectoryCapture {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl CaptureSource for DirectoryCapture {
    fn read(&mut self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        if !path.is_file() {
            return Err(ReconstructionError::MissingCaptureObject(key.to_string()).into());
        }
        fs::read(&path).with_context(|| format!("Failed to read capture object: {}", path.display()))
    }
}

/// Capture packed as a zip archive with the same key layout.
pub struct ZipCapture<R: Read + std::io::Seek> {
    archive: ZipArchive<R>,
}

impl ZipCapture<fs::File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("Failed to open capture archive: {}", path.display()))?;
        Self::new(file)
    }
}

impl<R: Read + std::io::Seek> ZipCapture<R> {
    pub fn new(reader: R) -> Result<Self> {
        let archive = ZipArchive::new(reader).context("Failed to read capture archive")?;
        Ok(Self { archive })
    }
}

impl<R: Read + std::io::Seek> CaptureSource for ZipCapture<R> {
    fn read(&mut self, key: &str) -> Result<Vec<u8>> {
        let mut file = match self.archive.by_name(key) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ReconstructionError::MissingCaptureObject(key.to_string()).into())
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {} from archive", key)),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {} from archive", key))?;
        Ok(bytes)
    }
}

/// One rig sample: its id and the rig pose relative to the world.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: String,
    pub rig_from_world: Pose,
}

/// Parse a rig's `frames.csv`; the first line is a header.
pub fn parse_frames(file: &str, content: &str) -> Result<Vec<Frame>, ReconstructionError> {
    let mut frames = Vec::new();
    for (idx, line) in content.lines().enumerate().skip(1) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = |reason: String| ReconstructionError::MalformedFrame {
            file: file.to_string(),
            line: idx + 1,
            reason,
        };

        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 8 {
            return Err(malformed(format!("expected 8 fields, found {}", fields.len())));
        }
        let mut values = [0.0f64; 7];
        for (value, field) in values.iter_mut().zip(&fields[1..]) {
            *value = field
                .parse::<f64>()
                .map_err(|e| malformed(format!("{:?}: {}", field, e)))?;
        }
        let [tx, ty, tz, qx, qy, qz, qw] = values;
        if qx == 0.0 && qy == 0.0 && qz == 0.0 && qw == 0.0 {
            return Err(malformed("zero rotation quaternion".into()));
        }

        frames.push(Frame {
            id: fields[0].to_string(),
            rig_from_world: pose_from_parts(quaternion_from_xyzw(qx, qy, qz, qw), Vector3::new(tx, ty, tz)),
        });
    }
    Ok(frames)
}

pub fn image_name(rig_id: &str, camera_id: &str, frame_id: &str) -> String {
    format!("{}/{}/{}.jpg", rig_id, camera_id, frame_id)
}

/// One camera's view of one frame. Immutable once ingested.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub rig_id: String,
    pub camera_id: String,
    pub frame_id: String,
    pub cam_from_world: Pose,
    /// Location of the raw bytes inside the image root handed to the solver.
    pub path: PathBuf,
    pub pixels: DecodedImage,
}

impl Image {
    pub fn size(&self) -> (u32, u32) {
        (self.pixels.width, self.pixels.height)
    }
}

/// Validated rig configuration plus every derived image, in ingestion order
/// (rig, then frame, then camera).
#[derive(Debug)]
pub struct Capture {
    pub rig_config: RigConfig,
    pub images: Vec<Image>,
}

pub fn load_rig_config(source: &mut dyn CaptureSource) -> Result<RigConfig> {
    let bytes = source.read(CONFIG_KEY)?;
    let config = RigConfig::from_json(&bytes)?;
    config.validate()?;
    Ok(config)
}

/// Load, validate and decode a capture. Raw image bytes are copied under `image_root`.
///
/// The rig configuration is validated before any image is read.
pub fn load_capture(source: &mut dyn CaptureSource, image_root: &Path) -> Result<Capture> {
    let rig_config = load_rig_config(source)?;
    let loader = ImageLoader::new();

    let mut images = Vec::new();
    let mut names = HashSet::new();
    for rig in &rig_config.rigs {
        let frames_key = format!("{}/frames.csv", rig.id);
        let frames_bytes = source.read(&frames_key)?;
        let content = String::from_utf8(frames_bytes)
            .map_err(|e| ReconstructionError::MalformedFrame {
                file: frames_key.clone(),
                line: 0,
                reason: e.to_string(),
            })?;
        let frames = parse_frames(&frames_key, &content)?;
        info!("Rig {}: {} frames x {} cameras", rig.id, frames.len(), rig.cameras.len());

        for frame in &frames {
            for camera in &rig.cameras {
                let name = image_name(&rig.id, &camera.id, &frame.id);
                if !names.insert(name.clone()) {
                    return Err(ReconstructionError::DuplicateImage(name).into());
                }

                let bytes = source.read(&name)?;
                let pixels = loader.decode(&name, &bytes)?;

                let path = image_root.join(&name);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
                }
                fs::write(&path, &bytes)
                    .with_context(|| format!("Failed to write image: {}", path.display()))?;
                debug!("  {} ({}x{})", name, pixels.width, pixels.height);

                images.push(Image {
                    name,
                    rig_id: rig.id.clone(),
                    camera_id: camera.id.clone(),
                    frame_id: frame.id.clone(),
                    cam_from_world: compose(&camera.cam_from_rig(), &frame.rig_from_world),
                    path,
                    pixels,
                });
            }
        }
    }

    if images.is_empty() {
        return Err(ReconstructionError::EmptyCapture.into());
    }

    Ok(Capture { rig_config, images })
}
