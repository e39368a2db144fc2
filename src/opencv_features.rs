//! ORB features and brute-force Hamming matching on OpenCV.

use anyhow::Result;
use image::GrayImage;
use ndarray::Array2;
use opencv::{core, features2d, prelude::*};

use crate::capture::Image;
use crate::features::{ExtractionOptions, FeatureExtractor, FeatureMatcher, Features, NO_MATCH};

pub const DEFAULT_MAX_FEATURES: usize = 8000;

pub struct OrbExtractor {
    pub max_features: usize,
}

impl Default for OrbExtractor {
    fn default() -> Self {
        Self {
            max_features: DEFAULT_MAX_FEATURES,
        }
    }
}

/// L2-normalised mean of the descriptor rows.
fn mean_descriptor(descriptors: &Array2<f32>) -> Vec<f32> {
    let Some(mean) = descriptors.mean_axis(ndarray::Axis(0)) else {
        return Vec::new();
    };
    let norm = mean.dot(&mean).sqrt();
    if norm > 0.0 {
        mean.iter().map(|v| v / norm).collect()
    } else {
        mean.to_vec()
    }
}

/// Single-channel `Mat` over the decoded luma buffer.
fn gray_mat(gray: &GrayImage) -> Result<core::Mat> {
    let (width, height) = gray.dimensions();
    let view = core::Mat::new_rows_cols_with_data(height as i32, width as i32, gray.as_raw().as_slice())?;
    Ok(view.try_clone()?)
}

impl FeatureExtractor for OrbExtractor {
    fn extract(&self, image: &Image, options: &ExtractionOptions) -> Result<Features> {
        let max_features = options.max_keypoints.unwrap_or(self.max_features);
        let mut orb = features2d::ORB::create(
            max_features as i32,
            1.2,
            8,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            20,
        )?;

        let mat = gray_mat(&image.pixels.gray)?;
        let mut keypoints = core::Vector::<core::KeyPoint>::new();
        let mut desc = core::Mat::default();
        orb.detect_and_compute(&mat, &core::no_array(), &mut keypoints, &mut desc, false)?;

        let rows = desc.rows().max(0) as usize;
        let cols = desc.cols().max(0) as usize;
        let mut descriptors = Array2::<f32>::zeros((rows, cols));
        for r in 0..rows {
            for c in 0..cols {
                descriptors[[r, c]] = *desc.at_2d::<u8>(r as i32, c as i32)? as f32;
            }
        }

        let keypoints: Vec<[f32; 2]> = keypoints
            .iter()
            .map(|kp| {
                let pt = kp.pt();
                [pt.x, pt.y]
            })
            .collect();
        let global_descriptor = mean_descriptor(&descriptors);

        Ok(Features {
            keypoints,
            descriptors,
            global_descriptor,
        })
    }
}

/// Brute-force Hamming matcher with Lowe's ratio test.
pub struct BfHammingMatcher {
    pub match_ratio: f32,
}

impl Default for BfHammingMatcher {
    fn default() -> Self {
        Self { match_ratio: 0.8 }
    }
}

fn to_binary_mat(descriptors: &Array2<f32>) -> Result<core::Mat> {
    let rows: Vec<Vec<u8>> = descriptors
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.round().clamp(0.0, 255.0) as u8).collect())
        .collect();
    Ok(core::Mat::from_slice_2d(&rows)?)
}

impl FeatureMatcher for BfHammingMatcher {
    fn match_features(&self, query: &Features, train: &Features, _image_size: (u32, u32)) -> Result<Vec<i64>> {
        let mut result = vec![NO_MATCH; query.len()];
        if query.is_empty() || train.len() < 2 {
            return Ok(result);
        }

        let query_desc = to_binary_mat(&query.descriptors)?;
        let train_desc = to_binary_mat(&train.descriptors)?;
        let bf = features2d::BFMatcher::create(core::NORM_HAMMING, false)?;
        let mut knn = core::Vector::<core::Vector<core::DMatch>>::new();
        bf.knn_train_match(&query_desc, &train_desc, &mut knn, 2, &core::no_array(), false)?;

        for pair in knn {
            if pair.len() >= 2 {
                let m = pair.get(0)?;
                let n = pair.get(1)?;
                if m.distance < self.match_ratio * n.distance {
                    if let Some(slot) = result.get_mut(m.query_idx as usize) {
                        *slot = m.train_idx as i64;
                    }
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn gray_mat_wraps_decoded_luma() {
        let mut gray = GrayImage::new(5, 3);
        gray.put_pixel(4, 2, Luma([200]));
        gray.put_pixel(1, 0, Luma([17]));

        let mat = gray_mat(&gray).unwrap();
        assert_eq!((mat.rows(), mat.cols()), (3, 5));
        assert_eq!(mat.channels(), 1);
        assert_eq!(*mat.at_2d::<u8>(2, 4).unwrap(), 200);
        assert_eq!(*mat.at_2d::<u8>(0, 1).unwrap(), 17);
    }
}
