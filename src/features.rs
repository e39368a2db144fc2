//! Drives the feature extraction and matching capabilities over the capture.
//!
//! The algorithms live behind [`FeatureExtractor`] and [`FeatureMatcher`]; this module
//! only validates their output, filters unmatched entries, and keeps results in a
//! deterministic order regardless of how the calls are scheduled.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{s, Array2};
use rayon::prelude::*;
use serde::Serialize;

use crate::capture::Image;
use crate::pairs::CandidatePair;

/// Matcher output for a query keypoint with no correspondence.
pub const NO_MATCH: i64 = -1;

/// Local and global features of one image.
#[derive(Debug, Clone)]
pub struct Features {
    /// Pixel coordinates with the origin at the top-left corner of the top-left pixel.
    pub keypoints: Vec<[f32; 2]>,
    /// One row per keypoint.
    pub descriptors: Array2<f32>,
    /// Whole-image descriptor used for retrieval.
    pub global_descriptor: Vec<f32>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Keep only the first `max` keypoints; extractors return them strongest first.
    pub fn truncate(&mut self, max: usize) {
        if self.keypoints.len() > max {
            self.keypoints.truncate(max);
            self.descriptors = self.descriptors.slice(s![..max, ..]).to_owned();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionOptions {
    pub max_keypoints: Option<usize>,
}

/// Feature-extraction capability.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &Image, options: &ExtractionOptions) -> Result<Features>;
}

/// Feature-matching capability.
///
/// Returns one entry per query keypoint: the matched train keypoint index, or [`NO_MATCH`].
pub trait FeatureMatcher: Send + Sync {
    fn match_features(&self, query: &Features, train: &Features, image_size: (u32, u32)) -> Result<Vec<i64>>;
}

/// Accepted correspondences of one candidate pair, `[query_index, train_index]`, where the
/// query side is `pair.first()`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSet {
    pub pair: CandidatePair,
    pub matches: Vec<[u32; 2]>,
}

impl MatchSet {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Drop sentinel entries and train indices outside `0..num_train`.
///
/// Returns the surviving correspondences and the number of out-of-range entries removed.
pub fn filter_matches(raw: &[i64], num_train: usize) -> (Vec<[u32; 2]>, usize) {
    let mut out_of_range = 0;
    let matches = raw
        .iter()
        .enumerate()
        .filter_map(|(query, &train)| {
            if train < 0 {
                None
            } else if train as usize >= num_train {
                out_of_range += 1;
                None
            } else {
                Some([query as u32, train as u32])
            }
        })
        .collect();
    (matches, out_of_range)
}

/// Count repeated query and train indices within one pair's matches.
pub fn count_duplicate_indices(matches: &[[u32; 2]]) -> (usize, usize) {
    let mut queries = HashSet::new();
    let mut trains = HashSet::new();
    let mut duplicate_queries = 0;
    let mut duplicate_trains = 0;
    for [query, train] in matches {
        if !queries.insert(*query) {
            duplicate_queries += 1;
        }
        if !trains.insert(*train) {
            duplicate_trains += 1;
        }
    }
    (duplicate_queries, duplicate_trains)
}

pub(crate) fn progress_bar(len: usize, show: bool) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }
    let progress = ProgressBar::new(len as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );
    Ok(progress)
}

/// Run the extractor over every image. Results are keyed by image name.
pub fn extract_all(
    images: &[Image],
    extractor: &dyn FeatureExtractor,
    options: &ExtractionOptions,
    show_progress: bool,
) -> Result<BTreeMap<String, Features>> {
    info!("Extracting features from {} images", images.len());
    let progress = progress_bar(images.len(), show_progress)?;

    let extracted: Vec<Features> = images
        .par_iter()
        .map(|image| {
            let mut features = extractor
                .extract(image, options)
                .with_context(|| format!("Feature extraction failed for {}", image.name))?;
            if features.descriptors.nrows() != features.keypoints.len() {
                bail!(
                    "Extractor returned {} descriptors for {} keypoints in {}",
                    features.descriptors.nrows(),
                    features.keypoints.len(),
                    image.name
                );
            }
            if let Some(max) = options.max_keypoints {
                features.truncate(max);
            }
            progress.inc(1);
            Ok(features)
        })
        .collect::<Result<_>>()?;

    progress.finish_and_clear();

    Ok(images
        .iter()
        .map(|image| image.name.clone())
        .zip(extracted)
        .collect())
}

/// Mean keypoint count over all extracted images; `0.0` for an empty set.
pub fn average_keypoints(features: &BTreeMap<String, Features>) -> f64 {
    if features.is_empty() {
        return 0.0;
    }
    let total: usize = features.values().map(Features::len).sum();
    total as f64 / features.len() as f64
}

fn lookup<'a>(features: &'a BTreeMap<String, Features>, name: &str) -> Result<&'a Features> {
    features
        .get(name)
        .with_context(|| format!("No features extracted for {}", name))
}

fn image_size(images: &[Image], name: &str) -> Result<(u32, u32)> {
    images
        .iter()
        .find(|image| image.name == name)
        .map(Image::size)
        .with_context(|| format!("Unknown image {}", name))
}

/// Match every candidate pair and return filtered match sets in pair order.
///
/// Duplicate indices within a pair are logged and kept; the solver tolerates them.
pub fn match_all(
    pairs: &BTreeSet<CandidatePair>,
    images: &[Image],
    features: &BTreeMap<String, Features>,
    matcher: &dyn FeatureMatcher,
    show_progress: bool,
) -> Result<Vec<MatchSet>> {
    info!("Matching {} candidate pairs", pairs.len());
    let progress = progress_bar(pairs.len(), show_progress)?;

    let pairs: Vec<&CandidatePair> = pairs.iter().collect();
    let match_sets: Vec<MatchSet> = pairs
        .par_iter()
        .map(|pair| {
            let query = lookup(features, pair.first())?;
            let train = lookup(features, pair.second())?;
            let raw = matcher
                .match_features(query, train, image_size(images, pair.first())?)
                .with_context(|| format!("Matching failed for {} {}", pair.first(), pair.second()))?;
            if raw.len() != query.len() {
                bail!(
                    "Matcher returned {} entries for {} query keypoints in {} {}",
                    raw.len(),
                    query.len(),
                    pair.first(),
                    pair.second()
                );
            }

            let (matches, out_of_range) = filter_matches(&raw, train.len());
            if out_of_range > 0 {
                warn!(
                    "Pair {} {}: dropped {} out-of-range train indices",
                    pair.first(),
                    pair.second(),
                    out_of_range
                );
            }
            progress.inc(1);
            Ok(MatchSet {
                pair: (*pair).clone(),
                matches,
            })
        })
        .collect::<Result<_>>()?;

    progress.finish_and_clear();

    for set in &match_sets {
        info!("Pair {} {}: {} matches", set.pair.first(), set.pair.second(), set.len());
        let (duplicate_queries, duplicate_trains) = count_duplicate_indices(&set.matches);
        if duplicate_queries > 0 {
            warn!("  {} duplicate query indices", duplicate_queries);
        }
        if duplicate_trains > 0 {
            warn!("  {} duplicate train indices", duplicate_trains);
        }
    }

    Ok(match_sets)
}

#[derive(Serialize)]
struct FeatureRecord<'a> {
    name: &'a str,
    keypoints: &'a [[f32; 2]],
    descriptors: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GlobalDescriptorRecord<'a> {
    name: &'a str,
    global_descriptor: &'a [f32],
}

/// `features.json` artifact body.
pub fn features_to_json(features: &BTreeMap<String, Features>) -> Result<Vec<u8>> {
    let records: Vec<FeatureRecord> = features
        .iter()
        .map(|(name, f)| FeatureRecord {
            name,
            keypoints: &f.keypoints,
            descriptors: f.descriptors.rows().into_iter().map(|row| row.to_vec()).collect(),
        })
        .collect();
    Ok(serde_json::to_vec(&records)?)
}

/// `global_descriptors.json` artifact body.
pub fn global_descriptors_to_json(features: &BTreeMap<String, Features>) -> Result<Vec<u8>> {
    let records: Vec<GlobalDescriptorRecord> = features
        .iter()
        .map(|(name, f)| GlobalDescriptorRecord {
            name,
            global_descriptor: &f.global_descriptor,
        })
        .collect();
    Ok(serde_json::to_vec(&records)?)
}
