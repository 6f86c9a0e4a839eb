// src/distributed.rs

use crate::error::{CxError, Result, ThreadSafeStdError};
use log::{debug, trace};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};

// --- Core Index Types ---

/// Identifies a row of the distributed matrix.
/// Keys of a matrix with `m` rows are the row positions `0..m`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct RowKey(pub usize);

// --- Trait for Abstracting Distributed Matrix Access ---

/// Defines how the CX pipeline reaches a large `m x n` matrix `A` whose rows are
/// partitioned across workers.
///
/// The pipeline never sees the rows directly. It only issues the operators below,
/// each of which may block for a long time and may parallelize internally.
/// Every operator returns a small dense result that fits in local memory.
/// `num_rows` and `num_cols` must not change over the lifetime of the value.
pub trait DistributedMatrix: Sync {
    /// Number of rows `m`.
    fn num_rows(&self) -> usize;

    /// Number of columns `n`.
    fn num_cols(&self) -> usize;

    /// Computes `X * A` for `X` of shape `(s, m)`, returning an `(s, n)` matrix.
    fn left_multiply(&self, x: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError>;

    /// Computes `A^T * A * B` for `B` of shape `(n, w)`, returning an `(n, w)` matrix.
    fn apply_gram_operator(&self, b: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError>;

    /// Computes `A * T` for `T` of shape `(n, t)` and returns the sum over its rows of
    /// the squared Euclidean row norms, i.e. `||A T||_F^2`.
    fn right_multiply_reduce_norm(&self, t: ArrayView2<f64>) -> std::result::Result<f64, ThreadSafeStdError>;

    /// Gathers every row whose key is in `keys`. Keys that do not exist are skipped;
    /// the caller decides whether that is an error.
    fn filter_rows_by_key_set(&self, keys: &HashSet<RowKey>) -> std::result::Result<Vec<(RowKey, Array1<f64>)>, ThreadSafeStdError>;

    /// `||A||_F^2`. The default issues one `right_multiply_reduce_norm` with the identity.
    fn frobenius_norm_squared(&self) -> std::result::Result<f64, ThreadSafeStdError> {
        let identity = Array2::<f64>::eye(self.num_cols());
        self.right_multiply_reduce_norm(identity.view())
    }
}

fn shape_error(operation: &str, expected: (usize, usize), actual: (usize, usize)) -> ThreadSafeStdError {
    format!(
        "{}: operand has shape {:?}, expected {:?}",
        operation, actual, expected
    )
    .into()
}

// --- Partitioned in-process backend ---

/// One partition of a `PartitionedRowMatrix`: a contiguous dense block of rows and their keys.
#[derive(Debug, Clone)]
struct RowPartition {
    keys: Vec<RowKey>,
    rows: Array2<f64>,
}

impl RowPartition {
    fn key_positions(&self) -> Vec<usize> {
        self.keys.iter().map(|key| key.0).collect()
    }
}

/// An in-process stand-in for a row-distributed matrix.
///
/// Rows are grouped into partitions of at most `rows_per_partition` rows; every
/// operator is evaluated per partition in parallel with rayon and then reduced,
/// mirroring the map/reduce shape of a cluster backend. With a single partition it
/// behaves like a plain dense matrix.
#[derive(Debug, Clone)]
pub struct PartitionedRowMatrix {
    partitions: Vec<RowPartition>,
    num_rows: usize,
    num_cols: usize,
}

impl PartitionedRowMatrix {
    /// Splits a dense matrix into partitions of `rows_per_partition` consecutive rows.
    /// Row `i` gets key `RowKey(i)`.
    pub fn from_dense(matrix: Array2<f64>, rows_per_partition: usize) -> Result<Self> {
        if rows_per_partition == 0 {
            return Err(CxError::InvalidMatrix("rows_per_partition must be greater than 0".to_string()));
        }
        let (num_rows, num_cols) = matrix.dim();

        let partitions = matrix
            .axis_chunks_iter(Axis(0), rows_per_partition)
            .enumerate()
            .map(|(chunk_idx, chunk)| {
                let start = chunk_idx * rows_per_partition;
                RowPartition {
                    keys: (start..start + chunk.nrows()).map(RowKey).collect(),
                    rows: chunk.to_owned(),
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "Partitioned {}x{} matrix into {} partitions of up to {} rows.",
            num_rows,
            num_cols,
            partitions.len(),
            rows_per_partition
        );
        Ok(Self { partitions, num_rows, num_cols })
    }

    /// Builds a matrix from keyed rows in any order, as a cluster would hand them over.
    ///
    /// Keys must be exactly `0..rows.len()` (each once) and every row must have `num_cols` entries.
    /// Partitions follow the order in which the rows are given.
    pub fn from_keyed_rows(
        rows: Vec<(RowKey, Array1<f64>)>,
        num_cols: usize,
        rows_per_partition: usize,
    ) -> Result<Self> {
        if rows_per_partition == 0 {
            return Err(CxError::InvalidMatrix("rows_per_partition must be greater than 0".to_string()));
        }
        let num_rows = rows.len();
        let mut seen = vec![false; num_rows];
        for (key, row) in &rows {
            if key.0 >= num_rows {
                return Err(CxError::InvalidMatrix(format!(
                    "row key {} is out of range for a matrix with {} rows",
                    key.0, num_rows
                )));
            }
            if std::mem::replace(&mut seen[key.0], true) {
                return Err(CxError::InvalidMatrix(format!("row key {} appears more than once", key.0)));
            }
            if row.len() != num_cols {
                return Err(CxError::InvalidMatrix(format!(
                    "row {} has {} entries, expected {}",
                    key.0,
                    row.len(),
                    num_cols
                )));
            }
        }

        let mut partitions = Vec::with_capacity(num_rows.div_ceil(rows_per_partition));
        for chunk in rows.chunks(rows_per_partition) {
            let mut block = Array2::<f64>::zeros((chunk.len(), num_cols));
            for (mut target, (_, row)) in block.axis_iter_mut(Axis(0)).zip(chunk.iter()) {
                target.assign(row);
            }
            partitions.push(RowPartition {
                keys: chunk.iter().map(|(key, _)| *key).collect(),
                rows: block,
            });
        }

        Ok(Self { partitions, num_rows, num_cols })
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

impl DistributedMatrix for PartitionedRowMatrix {
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn num_cols(&self) -> usize {
        self.num_cols
    }

    fn left_multiply(&self, x: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        if x.ncols() != self.num_rows {
            return Err(shape_error("left_multiply", (x.nrows(), self.num_rows), x.dim()));
        }
        let out_rows = x.nrows();
        let num_cols = self.num_cols;
        trace!("left_multiply: X is {:?}, {} partitions", x.dim(), self.partitions.len());

        // X * A = sum over partitions of X[:, keys] * A_partition
        let result = self
            .partitions
            .par_iter()
            .map(|partition| {
                x.select(Axis(1), &partition.key_positions()).dot(&partition.rows)
            })
            .reduce(|| Array2::zeros((out_rows, num_cols)), |acc, block| acc + block);
        Ok(result)
    }

    fn apply_gram_operator(&self, b: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        if b.nrows() != self.num_cols {
            return Err(shape_error("apply_gram_operator", (self.num_cols, b.ncols()), b.dim()));
        }
        let width = b.ncols();
        let num_cols = self.num_cols;
        trace!("apply_gram_operator: B is {:?}", b.dim());

        // A^T A B = sum over partitions of A_p^T (A_p B)
        let result = self
            .partitions
            .par_iter()
            .map(|partition| partition.rows.t().dot(&partition.rows.dot(&b)))
            .reduce(|| Array2::zeros((num_cols, width)), |acc, block| acc + block);
        Ok(result)
    }

    fn right_multiply_reduce_norm(&self, t: ArrayView2<f64>) -> std::result::Result<f64, ThreadSafeStdError> {
        if t.nrows() != self.num_cols {
            return Err(shape_error("right_multiply_reduce_norm", (self.num_cols, t.ncols()), t.dim()));
        }
        let total: f64 = self
            .partitions
            .par_iter()
            .map(|partition| {
                partition
                    .rows
                    .dot(&t)
                    .axis_iter(Axis(0))
                    .map(|row| row.dot(&row))
                    .sum::<f64>()
            })
            .sum();
        Ok(total)
    }

    fn filter_rows_by_key_set(&self, keys: &HashSet<RowKey>) -> std::result::Result<Vec<(RowKey, Array1<f64>)>, ThreadSafeStdError> {
        let gathered = self
            .partitions
            .par_iter()
            .flat_map_iter(|partition| {
                partition
                    .keys
                    .iter()
                    .zip(partition.rows.axis_iter(Axis(0)))
                    .filter(|(key, _)| keys.contains(*key))
                    .map(|(key, row)| (*key, row.to_owned()))
                    .collect::<Vec<_>>()
            })
            .collect();
        Ok(gathered)
    }

    fn frobenius_norm_squared(&self) -> std::result::Result<f64, ThreadSafeStdError> {
        Ok(self
            .partitions
            .par_iter()
            .map(|partition| partition.rows.iter().map(|v| v * v).sum::<f64>())
            .sum::<f64>())
    }
}

// --- Dense single-process backend ---

/// A plain dense matrix is a distributed matrix with one partition; row keys are row positions.
impl DistributedMatrix for Array2<f64> {
    fn num_rows(&self) -> usize {
        self.nrows()
    }

    fn num_cols(&self) -> usize {
        self.ncols()
    }

    fn left_multiply(&self, x: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        if x.ncols() != self.nrows() {
            return Err(shape_error("left_multiply", (x.nrows(), self.nrows()), x.dim()));
        }
        Ok(x.dot(self))
    }

    fn apply_gram_operator(&self, b: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        if b.nrows() != self.ncols() {
            return Err(shape_error("apply_gram_operator", (self.ncols(), b.ncols()), b.dim()));
        }
        Ok(self.t().dot(&self.dot(&b)))
    }

    fn right_multiply_reduce_norm(&self, t: ArrayView2<f64>) -> std::result::Result<f64, ThreadSafeStdError> {
        if t.nrows() != self.ncols() {
            return Err(shape_error("right_multiply_reduce_norm", (self.ncols(), t.ncols()), t.dim()));
        }
        let product = self.dot(&t);
        Ok(product.iter().map(|v| v * v).sum())
    }

    fn filter_rows_by_key_set(&self, keys: &HashSet<RowKey>) -> std::result::Result<Vec<(RowKey, Array1<f64>)>, ThreadSafeStdError> {
        let ordered: BTreeSet<RowKey> = keys.iter().copied().filter(|key| key.0 < self.nrows()).collect();
        Ok(ordered
            .into_iter()
            .map(|key| (key, self.row(key.0).to_owned()))
            .collect())
    }

    fn frobenius_norm_squared(&self) -> std::result::Result<f64, ThreadSafeStdError> {
        Ok(self.iter().map(|v| v * v).sum())
    }
}

#[cfg(test)]
mod distributed_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array};
    use ndarray_rand::rand_distr::StandardNormal;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_matrix() -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        Array::random_using((23, 6), StandardNormal, &mut rng)
    }

    #[test]
    fn partitioned_operators_match_dense_products() {
        let dense = sample_matrix();
        let partitioned = PartitionedRowMatrix::from_dense(dense.clone(), 5).unwrap();
        assert_eq!(partitioned.num_partitions(), 5);
        assert_eq!((partitioned.num_rows(), partitioned.num_cols()), (23, 6));

        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let x: Array2<f64> = Array::random_using((4, 23), StandardNormal, &mut rng);
        let b: Array2<f64> = Array::random_using((6, 3), StandardNormal, &mut rng);

        assert_abs_diff_eq!(
            partitioned.left_multiply(x.view()).unwrap(),
            x.dot(&dense),
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(
            partitioned.apply_gram_operator(b.view()).unwrap(),
            dense.t().dot(&dense.dot(&b)),
            epsilon = 1e-10
        );

        let expected_norm: f64 = dense.dot(&b).iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(
            partitioned.right_multiply_reduce_norm(b.view()).unwrap(),
            expected_norm,
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(
            partitioned.frobenius_norm_squared().unwrap(),
            dense.frobenius_norm_squared().unwrap(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn default_frobenius_norm_uses_identity_right_multiply() {
        struct OnlyOperators(Array2<f64>);
        impl DistributedMatrix for OnlyOperators {
            fn num_rows(&self) -> usize { self.0.nrows() }
            fn num_cols(&self) -> usize { self.0.ncols() }
            fn left_multiply(&self, x: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> { self.0.left_multiply(x) }
            fn apply_gram_operator(&self, b: ArrayView2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> { self.0.apply_gram_operator(b) }
            fn right_multiply_reduce_norm(&self, t: ArrayView2<f64>) -> std::result::Result<f64, ThreadSafeStdError> { self.0.right_multiply_reduce_norm(t) }
            fn filter_rows_by_key_set(&self, keys: &HashSet<RowKey>) -> std::result::Result<Vec<(RowKey, Array1<f64>)>, ThreadSafeStdError> { self.0.filter_rows_by_key_set(keys) }
        }

        let matrix = array![[1.0, 2.0], [3.0, 4.0]];
        assert_abs_diff_eq!(OnlyOperators(matrix).frobenius_norm_squared().unwrap(), 30.0, epsilon = 1e-12);
    }

    #[test]
    fn filter_gathers_only_requested_existing_keys() {
        let dense = sample_matrix();
        let partitioned = PartitionedRowMatrix::from_dense(dense.clone(), 4).unwrap();
        let keys: HashSet<RowKey> = [RowKey(0), RowKey(9), RowKey(22), RowKey(40)].into_iter().collect();

        let mut gathered = partitioned.filter_rows_by_key_set(&keys).unwrap();
        gathered.sort_by_key(|(key, _)| *key);

        let gathered_keys: Vec<usize> = gathered.iter().map(|(key, _)| key.0).collect();
        assert_eq!(gathered_keys, vec![0, 9, 22]);
        for (key, row) in &gathered {
            assert_eq!(row, &dense.row(key.0));
        }

        let dense_gathered = dense.filter_rows_by_key_set(&keys).unwrap();
        assert_eq!(dense_gathered.len(), 3);
    }

    #[test]
    fn keyed_rows_may_arrive_out_of_order() {
        let rows = vec![
            (RowKey(2), array![5.0, 6.0]),
            (RowKey(0), array![1.0, 2.0]),
            (RowKey(1), array![3.0, 4.0]),
        ];
        let matrix = PartitionedRowMatrix::from_keyed_rows(rows, 2, 2).unwrap();
        assert_eq!(matrix.num_partitions(), 2);

        // Row i of A is [2i+1, 2i+2]; e_1^T A is row 1.
        let selector = array![[0.0, 1.0, 0.0]];
        assert_eq!(matrix.left_multiply(selector.view()).unwrap(), array![[3.0, 4.0]]);
    }

    #[test]
    fn keyed_rows_are_validated() {
        let duplicate = vec![(RowKey(0), array![1.0]), (RowKey(0), array![2.0])];
        assert!(matches!(
            PartitionedRowMatrix::from_keyed_rows(duplicate, 1, 1),
            Err(CxError::InvalidMatrix(_))
        ));

        let out_of_range = vec![(RowKey(5), array![1.0])];
        assert!(matches!(
            PartitionedRowMatrix::from_keyed_rows(out_of_range, 1, 1),
            Err(CxError::InvalidMatrix(_))
        ));

        let ragged = vec![(RowKey(0), array![1.0, 2.0]), (RowKey(1), array![1.0])];
        assert!(matches!(
            PartitionedRowMatrix::from_keyed_rows(ragged, 2, 1),
            Err(CxError::InvalidMatrix(_))
        ));

        assert!(matches!(
            PartitionedRowMatrix::from_dense(Array2::zeros((2, 2)), 0),
            Err(CxError::InvalidMatrix(_))
        ));
    }

    #[test]
    fn operand_shapes_are_checked() {
        let matrix = PartitionedRowMatrix::from_dense(sample_matrix(), 10).unwrap();
        assert!(matrix.left_multiply(Array2::zeros((2, 5)).view()).is_err());
        assert!(matrix.apply_gram_operator(Array2::zeros((5, 2)).view()).is_err());
        assert!(matrix.right_multiply_reduce_norm(Array2::zeros((5, 5)).view()).is_err());
    }
}
