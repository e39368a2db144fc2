pub mod capture;
pub mod cli;
pub mod colmap;
pub mod config;
pub mod database;
pub mod error;
pub mod features;
pub mod geometry;
pub mod image_loader;
pub mod manifest;
pub mod metrics;
pub mod pairs;
pub mod pipeline;
pub mod ply;
pub mod reconstruction;
pub mod rig;
pub mod solver;
pub mod store;

#[cfg(feature = "opencv")]
pub mod opencv_features;

// Re-export commonly used types
pub use capture::{load_capture, Capture, CaptureSource, DirectoryCapture, ZipCapture};
pub use error::ReconstructionError;
pub use features::{FeatureExtractor, FeatureMatcher, Features};
pub use manifest::{ManifestContext, ReconstructionManifest, ReconstructionOptions, ReconstructionStatus};
pub use pipeline::ReconstructionPipeline;
pub use reconstruction::Reconstruction;
pub use solver::{CommandMapper, IncrementalMapper, MapperOptions};
