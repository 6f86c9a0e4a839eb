// src/reconstruction.rs

use crate::cx::CxConfig;
use crate::distributed::DistributedMatrix;
use crate::error::{CxError, Result};
use crate::extraction::ExtractedRows;
use crate::linalg_backends::{pseudo_inverse, BackendSVD};
use log::{debug, info, warn};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Relative error at or below which the selected rows are taken to span the row space of `A`.
/// `sqrt(f64::EPSILON)`: the residual is a square root of a sum of squares.
const SPANNED_RELATIVE_ERROR: f64 = 1.490_116_119_384_765_6e-8;

/// How well the selected rows span the row space of the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionError {
    /// `||A - A R^+ R||_F`.
    pub frobenius_error: f64,
    /// `frobenius_error / ||A||_F`, or 0 for an all-zero matrix.
    pub relative_error: f64,
    /// Numerical rank of the extracted rows.
    pub selection_rank: usize,
    /// Number of distinct rows that were extracted.
    pub rows_used: usize,
    /// True when `selection_rank < min(rows_used, n)`, i.e. some selected rows are linear
    /// combinations of others. The error is still well defined.
    pub rank_deficient_selection: bool,
}

/// Measures `||A (I - R^+ R)||_F` for the extracted rows `R`.
///
/// `R^+ R` is the orthogonal projector onto the span of the selected rows, so the result
/// is the Frobenius distance between `A` and its projection onto that span. The residual
/// operator `I - R^+ R` (n x n) is shipped to the matrix in one `right_multiply_reduce_norm`.
///
/// Dependent rows are only a problem when they leave part of `A` unexplained. When the rows
/// still span the row space of `A` (relative error below `sqrt(eps)`) the shortfall is the
/// rank of `A` itself and is logged at debug level; otherwise it is a warning, or
/// `SingularSelection` under `strict_selection_rank`.
pub fn reconstruction_error<M, B>(
    matrix: &M,
    backend: &B,
    config: &CxConfig,
    extracted: &ExtractedRows,
) -> Result<ReconstructionError>
where
    M: DistributedMatrix + ?Sized,
    B: BackendSVD<f64>,
{
    if extracted.is_empty() {
        return Err(CxError::EmptySelection);
    }
    let num_cols = matrix.num_cols();
    let rows = extracted.rows();
    if rows.ncols() != num_cols {
        return Err(CxError::DimensionMismatch {
            operation: "reconstruction_error",
            expected: (rows.nrows(), num_cols),
            actual: rows.dim(),
        });
    }
    let start_time = std::time::Instant::now();

    let (rows_pinv, selection_rank) = pseudo_inverse(backend, rows, config.rank_tolerance)?;
    let rows_used = rows.nrows();
    let rank_deficient_selection = selection_rank < rows_used.min(num_cols);

    let residual_operator = Array2::<f64>::eye(num_cols) - rows_pinv.dot(rows);
    let residual_norm_squared = matrix
        .right_multiply_reduce_norm(residual_operator.view())
        .map_err(CxError::collaborator("right_multiply_reduce_norm"))?;
    // Cancellation can push an exact reconstruction slightly negative.
    let frobenius_error = residual_norm_squared.max(0.0).sqrt();

    let total_norm_squared = matrix
        .frobenius_norm_squared()
        .map_err(CxError::collaborator("frobenius_norm_squared"))?;
    let relative_error = if total_norm_squared > 0.0 {
        frobenius_error / total_norm_squared.sqrt()
    } else {
        0.0
    };

    if rank_deficient_selection {
        if relative_error <= SPANNED_RELATIVE_ERROR {
            debug!(
                "Selected rows have numerical rank {} out of {} but span the row space of A.",
                selection_rank, rows_used
            );
        } else if config.strict_selection_rank {
            return Err(CxError::SingularSelection {
                rank: selection_rank,
                requested: rows_used,
            });
        } else {
            warn!(
                "Selected rows have numerical rank {} out of {}; the projection uses the rank-{} pseudoinverse.",
                selection_rank, rows_used, selection_rank
            );
        }
    }

    info!(
        "Reconstruction error {:.6e} (relative {:.6e}) from {} rows in {:?}",
        frobenius_error,
        relative_error,
        rows_used,
        start_time.elapsed()
    );
    Ok(ReconstructionError {
        frobenius_error,
        relative_error,
        selection_rank,
        rows_used,
        rank_deficient_selection,
    })
}

#[cfg(test)]
mod reconstruction_tests {
    use super::*;
    use crate::extraction::extract_rows;
    use crate::linalg_backends::LinAlgBackendProvider;
    use crate::selection::{SelectedIndices, SelectionScheme};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn evaluate(matrix: &Array2<f64>, indices: Vec<usize>, config: &CxConfig) -> Result<ReconstructionError> {
        let selection = SelectedIndices::new(indices, SelectionScheme::Deterministic);
        let extracted = extract_rows(matrix, &selection)?;
        reconstruction_error(matrix, &LinAlgBackendProvider::<f64>::new(), config, &extracted)
    }

    #[test]
    fn rows_spanning_the_row_space_reconstruct_exactly() {
        // Row 2 = row 0 + row 1.
        let matrix = array![[1.0, 0.0, 2.0], [0.0, 1.0, -1.0], [1.0, 1.0, 1.0]];
        let result = evaluate(&matrix, vec![0, 1], &CxConfig::default()).unwrap();
        assert_abs_diff_eq!(result.frobenius_error, 0.0, epsilon = 1e-7);
        assert_eq!(result.selection_rank, 2);
        assert!(!result.rank_deficient_selection);
    }

    #[test]
    fn error_is_the_norm_of_the_unexplained_part() {
        let matrix = array![[3.0, 0.0], [0.0, 4.0]];
        let result = evaluate(&matrix, vec![0], &CxConfig::default()).unwrap();
        assert_abs_diff_eq!(result.frobenius_error, 4.0, epsilon = 1e-10);
        assert_abs_diff_eq!(result.relative_error, 0.8, epsilon = 1e-10);
        assert_eq!(result.rows_used, 1);
    }

    #[test]
    fn dependent_rows_are_flagged_not_fatal() {
        let matrix = array![[1.0, 2.0], [2.0, 4.0], [0.0, 1.0]];
        let result = evaluate(&matrix, vec![0, 1], &CxConfig::default()).unwrap();
        assert!(result.rank_deficient_selection);
        assert_eq!(result.selection_rank, 1);
        // Row 2 minus its projection onto (1, 2)/sqrt(5) is (-0.4, 0.2).
        assert_abs_diff_eq!(result.frobenius_error, (0.2f64).sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn strict_mode_rejects_dependent_rows() {
        let matrix = array![[1.0, 2.0], [2.0, 4.0], [0.0, 1.0]];
        let config = CxConfig {
            strict_selection_rank: true,
            ..CxConfig::default()
        };
        assert!(matches!(
            evaluate(&matrix, vec![0, 1], &config),
            Err(CxError::SingularSelection { rank: 1, requested: 2 })
        ));
    }

    #[test]
    fn zero_matrix_has_zero_relative_error() {
        let matrix = Array2::<f64>::zeros((3, 2));
        let result = evaluate(&matrix, vec![0], &CxConfig::default()).unwrap();
        assert_eq!(result.frobenius_error, 0.0);
        assert_eq!(result.relative_error, 0.0);
        assert_eq!(result.selection_rank, 0);
    }

    #[test]
    fn dependent_rows_spanning_the_matrix_pass_strict_mode() {
        // Rank-1 matrix: any two nonzero rows are dependent yet reconstruct it exactly.
        let matrix = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [-1.0, -2.0, -3.0]];
        let config = CxConfig {
            strict_selection_rank: true,
            ..CxConfig::default()
        };
        let result = evaluate(&matrix, vec![0, 1], &config).unwrap();
        assert!(result.rank_deficient_selection);
        assert_eq!(result.selection_rank, 1);
        assert_abs_diff_eq!(result.relative_error, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn more_rows_than_columns_is_not_deficient() {
        // Three independent-looking rows in two columns can only reach rank 2.
        let matrix = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let config = CxConfig {
            strict_selection_rank: true,
            ..CxConfig::default()
        };
        let result = evaluate(&matrix, vec![0, 1, 2], &config).unwrap();
        assert_eq!(result.selection_rank, 2);
        assert!(!result.rank_deficient_selection);
    }
}
