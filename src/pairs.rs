//! Candidate pair selection over the posed image set.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::error::ReconstructionError;
use crate::geometry::{center_distance, rotation_distance, Pose};

pub const DEFAULT_NEIGHBORS_COUNT: usize = 12;

/// Neighbor count value requesting exhaustive matching.
pub const EXHAUSTIVE_NEIGHBORS: i64 = -1;

/// Unordered pair of distinct image names, stored with `first < second`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidatePair {
    first: String,
    second: String,
}

impl CandidatePair {
    /// Canonical pair for two names; `None` for a self-pair.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            Ordering::Less => Some(Self {
                first: a.to_string(),
                second: b.to_string(),
            }),
            Ordering::Greater => Some(Self {
                first: b.to_string(),
                second: a.to_string(),
            }),
            Ordering::Equal => None,
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPolicy {
    Exhaustive,
    /// `k` nearest neighbors per image by pose distance.
    Proximity { k: usize },
}

impl PairPolicy {
    /// Resolve the manifest's neighbor count.
    ///
    /// `-1` selects exhaustive matching; unset or `0` falls back to `default_k`.
    /// The proximity `k` is clamped to `max(1, num_images - 1)`.
    pub fn from_neighbors_count(
        neighbors_count: Option<i64>,
        default_k: usize,
        num_images: usize,
    ) -> Result<Self, ReconstructionError> {
        let requested = match neighbors_count {
            Some(EXHAUSTIVE_NEIGHBORS) => return Ok(PairPolicy::Exhaustive),
            Some(n) if n < EXHAUSTIVE_NEIGHBORS => {
                return Err(ReconstructionError::InvalidOption {
                    name: "neighbors_count",
                    reason: format!("{} is neither -1 nor a positive count", n),
                })
            }
            Some(0) | None => default_k,
            Some(n) => n as usize,
        };
        let k = requested.min(num_images.saturating_sub(1).max(1));
        Ok(PairPolicy::Proximity { k })
    }
}

/// An image's name and camera pose, the only inputs pair selection needs.
#[derive(Debug, Clone)]
pub struct PosedImage<'a> {
    pub name: &'a str,
    pub cam_from_world: Pose,
}

/// Combined pose distance: camera center distance plus weighted relative rotation angle.
#[derive(Debug, Clone, Copy)]
pub struct PoseDistance {
    /// Meters per radian of relative rotation.
    pub rotation_weight: f64,
}

impl Default for PoseDistance {
    fn default() -> Self {
        Self { rotation_weight: 1.0 }
    }
}

impl PoseDistance {
    pub fn between(&self, a: &Pose, b: &Pose) -> f64 {
        center_distance(a, b) + self.rotation_weight * rotation_distance(a, b)
    }
}

/// Every unordered pair of distinct images.
pub fn exhaustive_pairs(images: &[PosedImage]) -> BTreeSet<CandidatePair> {
    let mut pairs = BTreeSet::new();
    for (i, a) in images.iter().enumerate() {
        for b in &images[i + 1..] {
            if let Some(pair) = CandidatePair::new(a.name, b.name) {
                pairs.insert(pair);
            }
        }
    }
    pairs
}

/// Union of every image's `k` nearest neighbors.
///
/// Ties in distance are broken by name so the result does not depend on input order.
pub fn proximity_pairs(
    images: &[PosedImage],
    k: usize,
    metric: &PoseDistance,
) -> BTreeSet<CandidatePair> {
    let mut pairs = BTreeSet::new();
    for query in images {
        let mut candidates: Vec<(f64, &str)> = images
            .iter()
            .filter(|other| other.name != query.name)
            .map(|other| (metric.between(&query.cam_from_world, &other.cam_from_world), other.name))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        for (_, name) in candidates.into_iter().take(k) {
            if let Some(pair) = CandidatePair::new(query.name, name) {
                pairs.insert(pair);
            }
        }
    }
    pairs
}

pub fn select_pairs(
    images: &[PosedImage],
    policy: PairPolicy,
    metric: &PoseDistance,
) -> BTreeSet<CandidatePair> {
    match policy {
        PairPolicy::Exhaustive => exhaustive_pairs(images),
        PairPolicy::Proximity { k } => proximity_pairs(images, k, metric),
    }
}

/// `pairs.txt` body: one `nameA nameB` line per pair, in canonical order.
pub fn pairs_to_text(pairs: &BTreeSet<CandidatePair>) -> String {
    pairs
        .iter()
        .map(|pair| format!("{} {}", pair.first(), pair.second()))
        .collect::<Vec<_>>()
        .join("\n")
}
