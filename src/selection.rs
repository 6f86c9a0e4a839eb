// src/selection.rs

use crate::error::{CxError, Result};
use crate::leverage::validate_distribution;
use log::{debug, info};
use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// How column indices are drawn from leverage scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionScheme {
    /// The `r` highest scores, ties broken by smaller index.
    Deterministic,
    /// `r` independent draws, with replacement, from the leverage probabilities.
    Randomized,
}

impl FromStr for SelectionScheme {
    type Err = CxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deterministic" => Ok(SelectionScheme::Deterministic),
            "randomized" => Ok(SelectionScheme::Randomized),
            _ => Err(CxError::UnknownScheme(s.to_string())),
        }
    }
}

impl fmt::Display for SelectionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionScheme::Deterministic => write!(f, "deterministic"),
            SelectionScheme::Randomized => write!(f, "randomized"),
        }
    }
}

/// The `r` indices produced by a selection, in the order they were drawn.
///
/// Randomized selection samples with replacement, so an index may appear more than
/// once. Row extraction collapses repeats; `deduplicated` exposes the same view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedIndices {
    indices: Vec<usize>,
    scheme: SelectionScheme,
}

impl SelectedIndices {
    /// Wraps indices chosen elsewhere, e.g. to evaluate a hand-picked subset.
    pub fn new(indices: Vec<usize>, scheme: SelectionScheme) -> Self {
        Self { indices, scheme }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn scheme(&self) -> SelectionScheme {
        self.scheme
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn distinct_count(&self) -> usize {
        self.indices.iter().collect::<HashSet<_>>().len()
    }

    pub fn has_duplicates(&self) -> bool {
        self.distinct_count() < self.indices.len()
    }

    /// Distinct indices in first-occurrence order.
    pub fn deduplicated(&self) -> Vec<usize> {
        let mut seen = HashSet::with_capacity(self.indices.len());
        self.indices.iter().copied().filter(|index| seen.insert(*index)).collect()
    }

    pub fn into_vec(self) -> Vec<usize> {
        self.indices
    }
}

/// Chooses `r` column indices from leverage `scores` and their sampling `probabilities`.
///
/// Deterministic selection is a pure function of the scores. Randomized selection draws
/// `r` times from the categorical distribution `probabilities`, which is
/// inverse-CDF sampling: a uniform draw `u` in `[0, total)` maps to the first index whose
/// cumulative probability exceeds `u`.
///
/// # Errors
/// `InvalidSampleSize` unless `0 < r <= n`; `InvalidScores` if the two vectors differ in
/// length, or the one the scheme reads is not finite and non-negative, or is all zero.
pub fn select_indices<R: Rng + ?Sized>(
    scores: &Array1<f64>,
    probabilities: &Array1<f64>,
    scheme: SelectionScheme,
    r: usize,
    rng: &mut R,
) -> Result<SelectedIndices> {
    let num_columns = scores.len();
    if probabilities.len() != num_columns {
        return Err(CxError::InvalidScores(format!(
            "{} scores but {} probabilities",
            num_columns,
            probabilities.len()
        )));
    }
    if r == 0 || r > num_columns {
        return Err(CxError::InvalidSampleSize { r, n: num_columns });
    }
    info!("Selecting {} of {} columns, scheme={}", r, num_columns, scheme);

    let indices = match scheme {
        SelectionScheme::Deterministic => {
            validate_distribution(scores)?;
            let mut order: Vec<usize> = (0..num_columns).collect();
            // Stable sort keeps equal scores in ascending index order.
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
            order.truncate(r);
            order
        }
        SelectionScheme::Randomized => {
            validate_distribution(probabilities)?;
            let sampler = WeightedIndex::<f64>::new(probabilities.iter())
                .map_err(|e| CxError::InvalidScores(e.to_string()))?;
            (0..r).map(|_| sampler.sample(rng)).collect()
        }
    };

    let selected = SelectedIndices::new(indices, scheme);
    if selected.has_duplicates() {
        debug!(
            "Selection drew {} distinct columns out of {} draws.",
            selected.distinct_count(),
            r
        );
    }
    Ok(selected)
}
