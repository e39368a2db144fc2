//! Quality statistics of the selected reconstruction.

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ReconstructionError;
use crate::reconstruction::Reconstruction;

/// Metrics recorded in the manifest. Every field is filled in as soon as it is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionMetrics {
    #[serde(default)]
    pub total_images: Option<usize>,
    #[serde(default)]
    pub registered_images: Option<usize>,
    #[serde(default)]
    pub registration_rate: Option<f64>,
    #[serde(default)]
    pub num_3d_points: Option<usize>,
    #[serde(default)]
    pub average_keypoints_per_image: Option<f64>,
    #[serde(default)]
    pub reprojection_pixel_error_50th_percentile: Option<f64>,
    #[serde(default)]
    pub reprojection_pixel_error_90th_percentile: Option<f64>,
    #[serde(default)]
    pub track_length_50th_percentile: Option<f64>,
    #[serde(default)]
    pub percent_tracks_with_length_greater_than_or_equal_to_3: Option<f64>,
}

/// `q`-th percentile with linear interpolation between closest ranks
/// (`pos = q / 100 * (n - 1)`).
pub fn percentile(values: &[f64], q: f64) -> Result<f64, ReconstructionError> {
    if values.is_empty() {
        return Err(ReconstructionError::EmptyPercentile);
    }
    if !(0.0..=100.0).contains(&q) {
        return Err(ReconstructionError::PercentileOutOfRange(q));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = q / 100.0 * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    Ok(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

pub fn registration_rate(registered: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    100.0 * registered as f64 / total as f64
}

/// Pixel distance between each observation and the projection of its 3D point, pooled over
/// every registered image. Observations without a point or without a projection are skipped.
pub fn reprojection_errors(model: &Reconstruction) -> Vec<f64> {
    let mut errors = Vec::new();
    for image in model.images.values() {
        for observation in &image.points2d {
            let Some(point) = observation.point3d_id.and_then(|id| model.points.get(&id)) else {
                continue;
            };
            if let Some(projected) = model.project(image.image_id, &point.xyz) {
                errors.push((projected - observation.xy).norm());
            }
        }
    }
    errors
}

/// Fill the model-dependent metrics. `total_images` and the keypoint average are set by
/// earlier stages and left untouched.
pub fn compute_metrics(
    metrics: &mut ReconstructionMetrics,
    best: &Reconstruction,
    total_images: usize,
) -> Result<(), ReconstructionError> {
    let registered = best.num_registered_images();
    metrics.registered_images = Some(registered);
    metrics.registration_rate = Some(registration_rate(registered, total_images));
    metrics.num_3d_points = Some(best.num_points());

    let errors = reprojection_errors(best);
    metrics.reprojection_pixel_error_50th_percentile = Some(percentile(&errors, 50.0)?);
    metrics.reprojection_pixel_error_90th_percentile = Some(percentile(&errors, 90.0)?);

    let track_lengths: Vec<f64> = best.points.values().map(|p| p.track_length() as f64).collect();
    metrics.track_length_50th_percentile = Some(percentile(&track_lengths, 50.0)?);
    let long_tracks = track_lengths.iter().filter(|&&len| len >= 3.0).count();
    metrics.percent_tracks_with_length_greater_than_or_equal_to_3 =
        Some(100.0 * long_tracks as f64 / track_lengths.len() as f64);

    info!(
        "Registered {}/{} images ({:.1}%), {} points, median reprojection error {:.3}px",
        registered,
        total_images,
        metrics.registration_rate.unwrap_or_default(),
        best.num_points(),
        metrics.reprojection_pixel_error_50th_percentile.unwrap_or_default()
    );
    Ok(())
}
