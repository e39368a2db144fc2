use thiserror::Error;

/// Failures raised by the reconstruction pipeline itself.
///
/// Capability errors (extractor, matcher, solver, store) travel as `anyhow::Error`
/// and are never mapped into this enum.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    #[error("invalid rig configuration: {0}")]
    InvalidRigConfig(String),

    #[error("rig {rig} must have exactly one reference sensor, found {found}")]
    ReferenceSensorCount { rig: String, found: usize },

    #[error("reference sensor {camera} in rig {rig} must have identity rotation")]
    ReferenceSensorRotation { rig: String, camera: String },

    #[error("reference sensor {camera} in rig {rig} must have zero translation")]
    ReferenceSensorTranslation { rig: String, camera: String },

    #[error("capture object not found: {0}")]
    MissingCaptureObject(String),

    #[error("malformed frame record in {file} line {line}: {reason}")]
    MalformedFrame {
        file: String,
        line: usize,
        reason: String,
    },

    #[error("capture contains no images")]
    EmptyCapture,

    #[error("duplicate image name {0}")]
    DuplicateImage(String),

    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("unknown solver camera id {0}")]
    UnknownCameraId(u32),

    #[error("unknown solver image id {0}")]
    UnknownImageId(u32),

    #[error("no features extracted for image {0}")]
    MissingFeatures(String),

    #[error("no solver id for image {0}")]
    UnmappedImage(String),

    #[error("camera {camera} of rig {rig} was already registered")]
    DuplicateCamera { rig: String, camera: String },

    #[error("match index {index} out of range for image {image_id} with {num_keypoints} keypoints")]
    MatchIndexOutOfRange {
        image_id: u32,
        index: u32,
        num_keypoints: usize,
    },

    #[error("No model was created")]
    NoModel,

    #[error("cannot compute percentile of empty array")]
    EmptyPercentile,

    #[error("percentile {0} outside [0, 100]")]
    PercentileOutOfRange(f64),

    #[error("malformed model file {file} line {line}: {reason}")]
    MalformedModel {
        file: String,
        line: usize,
        reason: String,
    },
}
