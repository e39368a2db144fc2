//! Rig configuration as shipped in a capture's `config.json`.

use std::collections::HashSet;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::ReconstructionError;
use crate::geometry::{pose_from_parts, quaternion_from_xyzw, Pose};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigQuaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl RigQuaternion {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigVector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl RigVector3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };
}

/// Solver camera model names, as written into the reconstruction database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraModelId {
    SimplePinhole,
    Pinhole,
    SimpleRadial,
    Radial,
    Opencv,
    Generic,
}

impl CameraModelId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraModelId::SimplePinhole => "SIMPLE_PINHOLE",
            CameraModelId::Pinhole => "PINHOLE",
            CameraModelId::SimpleRadial => "SIMPLE_RADIAL",
            CameraModelId::Radial => "RADIAL",
            CameraModelId::Opencv => "OPENCV",
            CameraModelId::Generic => "GENERIC",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SIMPLE_PINHOLE" => Some(CameraModelId::SimplePinhole),
            "PINHOLE" => Some(CameraModelId::Pinhole),
            "SIMPLE_RADIAL" => Some(CameraModelId::SimpleRadial),
            "RADIAL" => Some(CameraModelId::Radial),
            "OPENCV" => Some(CameraModelId::Opencv),
            "GENERIC" => Some(CameraModelId::Generic),
            _ => None,
        }
    }
}

/// Camera intrinsics, discriminated by the `model` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum Intrinsics {
    #[serde(rename = "PINHOLE")]
    Pinhole {
        width: u32,
        height: u32,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
    },
    /// OpenCV radial-tangential distortion.
    #[serde(rename = "OPENCV")]
    OpenCvRadTan {
        width: u32,
        height: u32,
        fx: f64,
        fy: f64,
        cx: f64,
        cy: f64,
        k1: f64,
        k2: f64,
        p1: f64,
        p2: f64,
    },
    #[serde(rename = "GENERIC")]
    Generic {
        width: u32,
        height: u32,
        params: Vec<f64>,
    },
}

impl Intrinsics {
    pub fn model(&self) -> CameraModelId {
        match self {
            Intrinsics::Pinhole { .. } => CameraModelId::Pinhole,
            Intrinsics::OpenCvRadTan { .. } => CameraModelId::Opencv,
            Intrinsics::Generic { .. } => CameraModelId::Generic,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match self {
            Intrinsics::Pinhole { width, height, .. }
            | Intrinsics::OpenCvRadTan { width, height, .. }
            | Intrinsics::Generic { width, height, .. } => (*width, *height),
        }
    }

    /// Flat parameter vector in the order the solver expects for [`Self::model`].
    pub fn params(&self) -> Vec<f64> {
        match self {
            Intrinsics::Pinhole { fx, fy, cx, cy, .. } => vec![*fx, *fy, *cx, *cy],
            Intrinsics::OpenCvRadTan {
                fx,
                fy,
                cx,
                cy,
                k1,
                k2,
                p1,
                p2,
                ..
            } => vec![*fx, *fy, *cx, *cy, *k1, *k2, *p1, *p2],
            Intrinsics::Generic { params, .. } => params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigCamera {
    pub id: String,
    #[serde(default)]
    pub ref_sensor: Option<bool>,
    /// Rotation from the rig frame to the camera frame.
    pub rotation: RigQuaternion,
    /// Translation from the rig frame to the camera frame.
    pub translation: RigVector3,
    pub intrinsics: Intrinsics,
}

impl RigCamera {
    pub fn is_ref_sensor(&self) -> bool {
        self.ref_sensor.unwrap_or(false)
    }

    pub fn cam_from_rig(&self) -> Pose {
        let q = self.rotation;
        let t = self.translation;
        pose_from_parts(quaternion_from_xyzw(q.x, q.y, q.z, q.w), Vector3::new(t.x, t.y, t.z))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rig {
    pub id: String,
    pub cameras: Vec<RigCamera>,
}

impl Rig {
    pub fn ref_sensor(&self) -> Option<&RigCamera> {
        self.cameras.iter().find(|camera| camera.is_ref_sensor())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigConfig {
    pub rigs: Vec<Rig>,
}

impl RigConfig {
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        let config: RigConfig = serde_json::from_slice(bytes)
            .map_err(|e| ReconstructionError::InvalidRigConfig(e.to_string()))?;
        Ok(config)
    }

    /// Check every rig for unique ids and a single identity reference sensor.
    pub fn validate(&self) -> Result<(), ReconstructionError> {
        if self.rigs.is_empty() {
            return Err(ReconstructionError::InvalidRigConfig("no rigs defined".into()));
        }

        let mut rig_ids = HashSet::new();
        for rig in &self.rigs {
            if !rig_ids.insert(rig.id.as_str()) {
                return Err(ReconstructionError::InvalidRigConfig(format!(
                    "duplicate rig id {}",
                    rig.id
                )));
            }
            if rig.cameras.is_empty() {
                return Err(ReconstructionError::InvalidRigConfig(format!(
                    "rig {} has no cameras",
                    rig.id
                )));
            }

            let mut camera_ids = HashSet::new();
            for camera in &rig.cameras {
                if !camera_ids.insert(camera.id.as_str()) {
                    return Err(ReconstructionError::InvalidRigConfig(format!(
                        "duplicate camera id {} in rig {}",
                        camera.id, rig.id
                    )));
                }
                let q = camera.rotation;
                if q.x == 0.0 && q.y == 0.0 && q.z == 0.0 && q.w == 0.0 {
                    return Err(ReconstructionError::InvalidRigConfig(format!(
                        "camera {} in rig {} has a zero rotation quaternion",
                        camera.id, rig.id
                    )));
                }
            }

            let ref_sensors: Vec<&RigCamera> =
                rig.cameras.iter().filter(|c| c.is_ref_sensor()).collect();
            if ref_sensors.len() != 1 {
                return Err(ReconstructionError::ReferenceSensorCount {
                    rig: rig.id.clone(),
                    found: ref_sensors.len(),
                });
            }
            let ref_sensor = ref_sensors[0];
            if ref_sensor.rotation != RigQuaternion::IDENTITY {
                return Err(ReconstructionError::ReferenceSensorRotation {
                    rig: rig.id.clone(),
                    camera: ref_sensor.id.clone(),
                });
            }
            if ref_sensor.translation != RigVector3::ZERO {
                return Err(ReconstructionError::ReferenceSensorTranslation {
                    rig: rig.id.clone(),
                    camera: ref_sensor.id.clone(),
                });
            }
        }
        Ok(())
    }
}
