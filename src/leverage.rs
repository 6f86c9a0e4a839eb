// src/leverage.rs

use crate::cx::CxConfig;
use crate::distributed::DistributedMatrix;
use crate::error::{CxError, Result};
use crate::linalg_backends::{default_rank_tolerance, numerical_rank, BackendQR, BackendSVD};
use float_cmp::approx_eq;
use log::{debug, info, trace, warn};
use ndarray::{s, Array1, Array2, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// Tolerance on `sum(probabilities) == 1` before a warning is logged.
const PROBABILITY_SUM_TOLERANCE: f64 = 1e-8;

/// Which side of the sketch the exact leverage scores are computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeverageAxis {
    /// One score per row, from the top-k left singular vectors.
    Rows,
    /// One score per column, from the top-k right singular vectors.
    Columns,
}

/// Exact rank-k leverage scores of a small dense matrix.
#[derive(Debug, Clone)]
pub struct ExactLeverage {
    pub scores: Array1<f64>,
    /// `scores / k`.
    pub probabilities: Array1<f64>,
    /// All singular values of the input, descending.
    pub singular_values: Array1<f64>,
}

/// Computes exact rank-`k` leverage scores of `matrix` through its SVD.
///
/// For `LeverageAxis::Rows` the score of row `i` is the squared norm of row `i` of
/// `U[:, 0..k]`; for `LeverageAxis::Columns` the score of column `j` is the squared
/// norm of column `j` of `V^T[0..k, :]`. Scores of an orthonormal basis of a rank-k
/// subspace sum to `k`, so `probabilities = scores / k` is a distribution.
///
/// The singular vectors come from a thin QR followed by an SVD of the small projected
/// factor, so a tall `n x w` sketch never materializes an `n x n` U.
///
/// # Errors
/// `InvalidRank` if `k` is zero or exceeds `min(nrows, ncols)`; `Linalg` if the QR or SVD fails.
pub fn exact_leverage_scores<B>(
    backend: &B,
    matrix: &Array2<f64>,
    k: usize,
    axis: LeverageAxis,
) -> Result<ExactLeverage>
where
    B: BackendQR<f64> + BackendSVD<f64>,
{
    let (nrows, ncols) = matrix.dim();
    let max_rank = nrows.min(ncols);
    if k == 0 || k > max_rank {
        return Err(CxError::InvalidRank { k, n: max_rank });
    }

    // Right singular vectors of A are the left singular vectors of A^T.
    let (top_vectors, singular_values) = match axis {
        LeverageAxis::Rows => thin_left_singular_vectors(backend, matrix, k)?,
        LeverageAxis::Columns => thin_left_singular_vectors(backend, &matrix.t().to_owned(), k)?,
    };
    let scores = top_vectors.map_axis(Axis(1), |row| row.dot(&row));
    let probabilities = &scores / k as f64;

    Ok(ExactLeverage {
        scores,
        probabilities,
        singular_values,
    })
}

/// Top-`k` left singular vectors (`nrows x k`) and all singular values of `matrix`.
///
/// `matrix = Q R` with thin `Q` (`nrows x p`, `p = min(nrows, ncols)`); the SVD runs on the
/// `p x ncols` factor `Q^T matrix = U_small S V^T`, and `U = Q U_small`.
fn thin_left_singular_vectors<B>(backend: &B, matrix: &Array2<f64>, k: usize) -> Result<(Array2<f64>, Array1<f64>)>
where
    B: BackendQR<f64> + BackendSVD<f64>,
{
    let q_basis = backend
        .qr_q_factor(matrix)
        .map_err(CxError::linalg("exact leverage QR"))?;
    let projected = q_basis.t().dot(matrix);
    trace!(
        "exact leverage: {:?} input reduced to {:?} before SVD",
        matrix.dim(),
        projected.dim()
    );

    let svd = backend
        .svd_into(projected, true, false)
        .map_err(CxError::linalg("exact leverage SVD"))?;
    let u_small = svd.u.ok_or_else(|| CxError::Linalg {
        operation: "exact leverage SVD",
        source: "backend did not return U".into(),
    })?;
    if u_small.ncols() < k {
        return Err(CxError::DimensionMismatch {
            operation: "exact leverage SVD",
            expected: (u_small.nrows(), k),
            actual: u_small.dim(),
        });
    }

    Ok((q_basis.dot(&u_small.slice(s![.., 0..k])), svd.s))
}

/// Approximate column leverage scores of the distributed matrix and the sampling
/// distribution derived from them.
///
/// Invariant: `scores()[i] == probabilities()[i] * target_rank()` for every column.
/// Deserialization re-checks the distribution and re-derives the scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "StoredLeverageEstimate")]
pub struct LeverageEstimate {
    scores: Array1<f64>,
    probabilities: Array1<f64>,
    target_rank: usize,
    power_iterations: usize,
    sketch_width: usize,
    sketch_rank_deficient: bool,
}

/// Serialized form of `LeverageEstimate`, validated before it becomes one.
#[derive(Deserialize)]
struct StoredLeverageEstimate {
    scores: Array1<f64>,
    probabilities: Array1<f64>,
    target_rank: usize,
    power_iterations: usize,
    sketch_width: usize,
    sketch_rank_deficient: bool,
}

impl TryFrom<StoredLeverageEstimate> for LeverageEstimate {
    type Error = CxError;

    fn try_from(stored: StoredLeverageEstimate) -> Result<Self> {
        let mut estimate = LeverageEstimate::from_probabilities(stored.probabilities, stored.target_rank)?;
        if stored.scores.len() != estimate.scores.len() {
            return Err(CxError::InvalidScores(format!(
                "{} scores but {} probabilities",
                stored.scores.len(),
                estimate.scores.len()
            )));
        }
        // Text formats may round the last digit, so stored scores only need to agree closely.
        let disagreeing = stored
            .scores
            .iter()
            .zip(estimate.scores.iter())
            .position(|(stored_score, derived)| !approx_eq!(f64, *stored_score, *derived, epsilon = 1e-12, ulps = 4));
        if let Some(index) = disagreeing {
            return Err(CxError::InvalidScores(format!(
                "score {} is {}, but probability * k is {}",
                index, stored.scores[index], estimate.scores[index]
            )));
        }
        estimate.power_iterations = stored.power_iterations;
        estimate.sketch_width = stored.sketch_width;
        estimate.sketch_rank_deficient = stored.sketch_rank_deficient;
        Ok(estimate)
    }
}

impl LeverageEstimate {
    /// Wraps an externally computed distribution, e.g. to re-run selection on stored scores.
    ///
    /// # Errors
    /// `InvalidRank` if `target_rank` is zero or exceeds the number of columns;
    /// `InvalidScores` if the probabilities are empty, negative, non-finite, or do not sum to 1.
    pub fn from_probabilities(probabilities: Array1<f64>, target_rank: usize) -> Result<Self> {
        let num_columns = probabilities.len();
        if num_columns == 0 {
            return Err(CxError::InvalidScores("probability vector is empty".to_string()));
        }
        if target_rank == 0 || target_rank > num_columns {
            return Err(CxError::InvalidRank { k: target_rank, n: num_columns });
        }
        validate_distribution(&probabilities)?;
        let total: f64 = probabilities.sum();
        if !approx_eq!(f64, total, 1.0, epsilon = 1e-6) {
            return Err(CxError::InvalidScores(format!("probabilities sum to {}, expected 1", total)));
        }

        Ok(Self {
            scores: probabilities.mapv(|p| p * target_rank as f64),
            probabilities,
            target_rank,
            power_iterations: 0,
            sketch_width: 0,
            sketch_rank_deficient: false,
        })
    }

    pub fn scores(&self) -> &Array1<f64> {
        &self.scores
    }

    pub fn probabilities(&self) -> &Array1<f64> {
        &self.probabilities
    }

    /// The rank `k` the scores were computed for.
    pub fn target_rank(&self) -> usize {
        self.target_rank
    }

    pub fn power_iterations(&self) -> usize {
        self.power_iterations
    }

    /// Number of random directions the sketch started with (0 for external scores).
    pub fn sketch_width(&self) -> usize {
        self.sketch_width
    }

    /// Number of columns `n` of the matrix the scores belong to.
    pub fn num_columns(&self) -> usize {
        self.scores.len()
    }

    /// True when the final sketch had numerical rank below `k`. The trailing
    /// scores then describe arbitrary directions and the selection is less reliable.
    pub fn is_sketch_rank_deficient(&self) -> bool {
        self.sketch_rank_deficient
    }
}

pub(crate) fn validate_distribution(values: &Array1<f64>) -> Result<()> {
    if let Some((index, value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite() || **v < 0.0) {
        return Err(CxError::InvalidScores(format!(
            "entry {} is {}, expected a finite non-negative value",
            index, value
        )));
    }
    if values.iter().all(|&v| v == 0.0) {
        return Err(CxError::InvalidScores("all entries are zero".to_string()));
    }
    Ok(())
}

fn check_block_shape(operation: &'static str, expected: (usize, usize), actual: (usize, usize)) -> Result<()> {
    if expected != actual {
        return Err(CxError::DimensionMismatch { operation, expected, actual });
    }
    Ok(())
}

/// Runs the randomized power-iteration sketch against `matrix` and returns approximate
/// rank-`k` column leverage scores.
///
/// Draws a Gaussian test matrix with `config.oversampling_factor * k` directions, forms
/// the sketch `B = (Omega A)^T` (n x w) with one `left_multiply`, then applies `A^T A`
/// `q` times. Before every `config.reorthonormalization_interval`-th application the
/// sketch is replaced by its Q factor to keep its columns from collapsing onto the top
/// singular direction.
pub fn estimate_leverage<M, B, R>(
    matrix: &M,
    backend: &B,
    config: &CxConfig,
    k: usize,
    q: usize,
    rng: &mut R,
) -> Result<LeverageEstimate>
where
    M: DistributedMatrix + ?Sized,
    B: BackendQR<f64> + BackendSVD<f64>,
    R: Rng + ?Sized,
{
    let num_rows = matrix.num_rows();
    let num_cols = matrix.num_cols();
    if k == 0 || k > num_cols {
        return Err(CxError::InvalidRank { k, n: num_cols });
    }

    let sketch_width = config.oversampling_factor.checked_mul(k).ok_or_else(|| {
        CxError::InvalidConfig(format!(
            "sketch width oversampling_factor * k = {} * {} overflows",
            config.oversampling_factor, k
        ))
    })?;
    let reorthonormalization_interval = config.reorthonormalization_interval;
    info!(
        "Estimating leverage scores. A={}x{}, k={}, q={}, sketch width={}",
        num_rows, num_cols, k, q, sketch_width
    );
    let start_time = std::time::Instant::now();

    // Omega: w x m, one Gaussian weight per row of A for each sketch direction.
    let omega: Array2<f64> = Array2::random_using((sketch_width, num_rows), StandardNormal, rng);

    let projected = matrix
        .left_multiply(omega.view())
        .map_err(CxError::collaborator("left_multiply"))?;
    check_block_shape("left_multiply", (sketch_width, num_cols), projected.dim())?;
    let mut sketch = projected.reversed_axes();
    trace!("Initial sketch formed, shape {:?}", sketch.dim());

    for iteration in 0..q {
        debug!("Computing leverage scores, power iteration {}/{}", iteration + 1, q);
        if iteration % reorthonormalization_interval == reorthonormalization_interval - 1 {
            debug!("Re-orthonormalizing sketch before power iteration {}", iteration + 1);
            sketch = backend
                .qr_q_factor(&sketch)
                .map_err(CxError::linalg("sketch re-orthonormalization"))?;
        }
        let width = sketch.ncols();
        sketch = matrix
            .apply_gram_operator(sketch.view())
            .map_err(CxError::collaborator("apply_gram_operator"))?;
        check_block_shape("apply_gram_operator", (num_cols, width), sketch.dim())?;
    }

    let exact = exact_leverage_scores(backend, &sketch, k, LeverageAxis::Rows)?;

    let sketch_rank = numerical_rank(
        &exact.singular_values,
        default_rank_tolerance(sketch.nrows(), sketch.ncols()),
    );
    let sketch_rank_deficient = sketch_rank < k;
    if sketch_rank_deficient {
        warn!(
            "Sketch has numerical rank {} below target rank k={}; trailing leverage directions are arbitrary.",
            sketch_rank, k
        );
    }

    let probabilities = exact.probabilities;
    let probability_sum = probabilities.sum();
    if !approx_eq!(f64, probability_sum, 1.0, epsilon = PROBABILITY_SUM_TOLERANCE) {
        warn!("Leverage probabilities sum to {} instead of 1.", probability_sum);
    }
    let scores = probabilities.mapv(|p| p * k as f64);

    info!(
        "Estimated leverage scores for {} columns in {:?}",
        num_cols,
        start_time.elapsed()
    );
    Ok(LeverageEstimate {
        scores,
        probabilities,
        target_rank: k,
        power_iterations: q,
        sketch_width,
        sketch_rank_deficient,
    })
}
