// src/linalg_backends.rs

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

use crate::error::{CxError, Result, ThreadSafeStdError};
use log::trace;
use ndarray::{s, Array1, Array2, Axis};
use std::marker::PhantomData;

// --- Trait Definitions ---

/// Trait for QR decomposition, focusing on retrieving the Q factor.
pub trait BackendQR<F: 'static + Copy + Send + Sync> {
    /// Returns the thin Q factor, shape `(nrows, min(nrows, ncols))`.
    fn qr_q_factor(&self, matrix: &Array2<F>) -> std::result::Result<Array2<F>, ThreadSafeStdError>;
}

/// Output of a Singular Value Decomposition.
///
/// Singular values are sorted in descending order. Depending on the backend `u` may
/// carry more than `s.len()` columns and `vt` more than `s.len()` rows; only the
/// leading `s.len()` of them pair with a singular value.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Option<Array2<F>>,
    pub s: Array1<F>,
    pub vt: Option<Array2<F>>,
}

/// Trait for Singular Value Decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(&self, matrix: Array2<F>, compute_u: bool, compute_v: bool) -> std::result::Result<SVDOutput<F>, ThreadSafeStdError>;
}

// --- NdarrayLinAlgBackend Implementation ---
use ndarray_linalg::{QR as NdLinalgQR, SVDInto as NdLinalgSVDInto};

#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_dyn_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> ThreadSafeStdError {
    Box::new(e)
}

impl BackendQR<f64> for NdarrayLinAlgBackend {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        let (q_factor, _r) = matrix.qr().map_err(to_dyn_error)?;
        Ok(q_factor)
    }
}

impl BackendSVD<f64> for NdarrayLinAlgBackend {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> std::result::Result<SVDOutput<f64>, ThreadSafeStdError> {
        let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
        Ok(SVDOutput { u, s, vt })
    }
}

// --- FaerLinAlgBackend Implementation ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code {
    use super::{BackendQR, BackendSVD, SVDOutput};
    use crate::error::ThreadSafeStdError;
    use bytemuck::Pod;
    use faer::linalg::solvers::Svd as FaerSolverSvd;
    use faer::traits::num_traits::Zero;
    use faer::traits::ComplexField;
    use faer::MatRef;
    use ndarray::{Array1, Array2, ShapeBuilder};

    fn to_dyn_error_faer(msg: String) -> ThreadSafeStdError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    fn faer_mat_to_ndarray<F: ComplexField + Copy + Pod + Zero>(faer_mat: MatRef<'_, F>) -> Array2<F> {
        let nrows = faer_mat.nrows();
        let ncols = faer_mat.ncols();
        if nrows == 0 || ncols == 0 {
            return Array2::zeros((nrows, ncols).f());
        }
        Array2::from_shape_fn((nrows, ncols).f(), |(i, j)| unsafe { *faer_mat.get_unchecked(i, j) })
    }

    fn faer_col_to_ndarray_vec<F: ComplexField + Copy + Pod + Zero>(faer_col: faer::ColRef<'_, F>) -> Array1<F> {
        let nrows = faer_col.nrows();
        let mut data_vec = Vec::with_capacity(nrows);
        for i in 0..nrows {
            data_vec.push(unsafe { *faer_col.get_unchecked(i) });
        }
        Array1::from_vec(data_vec)
    }

    /// Views a contiguous ndarray matrix as a faer matrix without copying.
    fn ndarray_as_faer(matrix: &Array2<f64>) -> Result<MatRef<'_, f64>, ThreadSafeStdError> {
        let (nrows, ncols) = matrix.dim();
        let slice = matrix.as_slice_memory_order().ok_or_else(|| {
            to_dyn_error_faer(format!(
                "Input ndarray matrix ({}x{}) is non-contiguous and cannot be directly viewed by faer.",
                nrows, ncols
            ))
        })?;
        if matrix.is_standard_layout() {
            Ok(faer::MatRef::from_row_major_slice(slice, nrows, ncols))
        } else {
            Ok(faer::MatRef::from_column_major_slice(slice, nrows, ncols))
        }
    }

    impl BackendQR<f64> for FaerLinAlgBackend {
        fn qr_q_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            let k = nrows.min(ncols);
            if nrows == 0 || ncols == 0 {
                return Ok(Array2::zeros((nrows, k)));
            }
            let qr_decomp = ndarray_as_faer(matrix)?.qr();
            let q_thin_faer_mat = qr_decomp.compute_thin_Q();
            Ok(faer_mat_to_ndarray(q_thin_faer_mat.as_ref()))
        }
    }

    impl BackendSVD<f64> for FaerLinAlgBackend {
        fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, ThreadSafeStdError> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                let k_dim = nrows.min(ncols);
                return Ok(SVDOutput {
                    u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                    s: Array1::zeros(k_dim),
                    vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
                });
            }

            let svd_solver_instance = FaerSolverSvd::new_thin(ndarray_as_faer(&matrix)?)
                .map_err(|e| to_dyn_error_faer(format!("Faer SVD computation failed: {:?}", e)))?;

            let s_ndarray = faer_col_to_ndarray_vec(svd_solver_instance.S().column_vector());
            let u_ndarray = if compute_u {
                Some(faer_mat_to_ndarray(svd_solver_instance.U().as_ref()))
            } else {
                None
            };
            let vt_ndarray = if compute_v {
                Some(faer_mat_to_ndarray(svd_solver_instance.V().as_ref()).t().into_owned())
            } else {
                None
            };

            Ok(SVDOutput { u: u_ndarray, s: s_ndarray, vt: vt_ndarray })
        }
    }
}

#[cfg(feature = "backend_faer")]
pub use faer_specific_code::FaerLinAlgBackend;

// --- LinAlgBackendProvider Dispatch ---

impl BackendQR<f64> for LinAlgBackendProvider<f64> {
    fn qr_q_factor(&self, matrix: &Array2<f64>) -> std::result::Result<Array2<f64>, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.qr_q_factor(matrix)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.qr_q_factor(matrix)
        }
    }
}

impl BackendSVD<f64> for LinAlgBackendProvider<f64> {
    fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> std::result::Result<SVDOutput<f64>, ThreadSafeStdError> {
        #[cfg(feature = "backend_faer")]
        {
            faer_specific_code::FaerLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
        #[cfg(not(feature = "backend_faer"))]
        {
            NdarrayLinAlgBackend.svd_into(matrix, compute_u, compute_v)
        }
    }
}

// --- Helpers built on the backend traits ---

/// Default relative cutoff for treating a singular value as zero: `max(nrows, ncols) * eps`.
pub fn default_rank_tolerance(nrows: usize, ncols: usize) -> f64 {
    nrows.max(ncols).max(1) as f64 * f64::EPSILON
}

/// Counts the singular values strictly above `relative_tolerance * s[0]`.
/// `singular_values` must be sorted in descending order.
pub fn numerical_rank(singular_values: &Array1<f64>, relative_tolerance: f64) -> usize {
    let largest = match singular_values.get(0) {
        Some(&value) if value > 0.0 => value,
        _ => return 0,
    };
    let cutoff = relative_tolerance * largest;
    singular_values.iter().take_while(|&&value| value > cutoff).count()
}

/// Moore–Penrose pseudoinverse of `matrix` (shape `(p, d)`), returned with shape `(d, p)`
/// together with the numerical rank used to build it.
///
/// Singular values at or below `relative_tolerance * s_max` are treated as zero, so a
/// rank-deficient input yields the pseudoinverse of its best rank-`rank` approximation.
/// `None` falls back to `default_rank_tolerance`.
pub fn pseudo_inverse<B: BackendSVD<f64>>(
    backend: &B,
    matrix: &Array2<f64>,
    relative_tolerance: Option<f64>,
) -> Result<(Array2<f64>, usize)> {
    let (nrows, ncols) = matrix.dim();
    if nrows == 0 || ncols == 0 {
        return Ok((Array2::zeros((ncols, nrows)), 0));
    }

    let svd = backend
        .svd_into(matrix.to_owned(), true, true)
        .map_err(CxError::linalg("pseudoinverse SVD"))?;
    let u = svd.u.ok_or_else(|| CxError::Linalg {
        operation: "pseudoinverse SVD",
        source: "backend did not return U".into(),
    })?;
    let vt = svd.vt.ok_or_else(|| CxError::Linalg {
        operation: "pseudoinverse SVD",
        source: "backend did not return V^T".into(),
    })?;

    let tolerance = relative_tolerance.unwrap_or_else(|| default_rank_tolerance(nrows, ncols));
    let rank = numerical_rank(&svd.s, tolerance);
    trace!(
        "pseudoinverse: input {}x{}, {} singular values, numerical rank {}",
        nrows,
        ncols,
        svd.s.len(),
        rank
    );
    if rank == 0 {
        return Ok((Array2::zeros((ncols, nrows)), 0));
    }

    // V_r * diag(1/s_r) * U_r^T
    let mut v_scaled = vt.slice(s![0..rank, ..]).t().to_owned();
    for (mut column, &singular_value) in v_scaled.axis_iter_mut(Axis(1)).zip(svd.s.iter()) {
        column.mapv_inplace(|value| value / singular_value);
    }
    let pinv = v_scaled.dot(&u.slice(s![.., 0..rank]).t());

    Ok((pinv, rank))
}

#[cfg(test)]
mod linalg_backend_tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn q_factor_has_orthonormal_columns() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let matrix = array![[1.0, 2.0], [3.0, 4.0], [5.0, 7.0], [0.5, -1.0]];
        let q = backend.qr_q_factor(&matrix).unwrap();
        assert_eq!(q.dim(), (4, 2));
        let qtq = q.t().dot(&q);
        assert_abs_diff_eq!(qtq, Array2::eye(2), epsilon = 1e-12);
    }

    #[test]
    fn pseudo_inverse_of_full_rank_matrix_is_left_inverse() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let matrix = array![[2.0, 0.0], [0.0, 3.0], [1.0, 1.0]];
        let (pinv, rank) = pseudo_inverse(&backend, &matrix, None).unwrap();
        assert_eq!(rank, 2);
        assert_eq!(pinv.dim(), (2, 3));
        assert_abs_diff_eq!(pinv.dot(&matrix), Array2::eye(2), epsilon = 1e-12);
    }

    #[test]
    fn pseudo_inverse_reports_rank_deficiency() {
        let backend = LinAlgBackendProvider::<f64>::new();
        // Second row is twice the first.
        let matrix = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0]];
        let (pinv, rank) = pseudo_inverse(&backend, &matrix, None).unwrap();
        assert_eq!(rank, 1);
        // pinv * A is the orthogonal projector onto the row space: idempotent and symmetric.
        let projector = pinv.dot(&matrix);
        assert_abs_diff_eq!(projector.dot(&projector), projector, epsilon = 1e-12);
        assert_abs_diff_eq!(projector.t().to_owned(), projector, epsilon = 1e-12);
    }

    #[test]
    fn zero_matrix_has_rank_zero() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let (pinv, rank) = pseudo_inverse(&backend, &Array2::zeros((3, 4)), None).unwrap();
        assert_eq!(rank, 0);
        assert_eq!(pinv.dim(), (4, 3));
        assert!(pinv.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn numerical_rank_uses_relative_cutoff() {
        let singular_values = array![10.0, 1.0, 1e-3, 1e-14];
        assert_eq!(numerical_rank(&singular_values, 1e-12), 3);
        assert_eq!(numerical_rank(&singular_values, 1e-2), 2);
        assert_eq!(numerical_rank(&Array1::zeros(3), 1e-12), 0);
    }

    #[cfg(feature = "backend_faer")]
    #[test]
    fn faer_backend_returns_thin_factors() {
        // Column-major input, the layout a transposed sketch arrives in.
        let matrix = array![[3.0, 0.0, 0.0], [0.0, 4.0, 0.0]].reversed_axes();
        let q = FaerLinAlgBackend.qr_q_factor(&matrix).unwrap();
        assert_eq!(q.dim(), (3, 2));
        assert_abs_diff_eq!(q.t().dot(&q), Array2::eye(2), epsilon = 1e-12);

        let svd = FaerLinAlgBackend.svd_into(matrix.clone(), true, true).unwrap();
        assert_abs_diff_eq!(svd.s, array![4.0, 3.0], epsilon = 1e-12);
        let u = svd.u.unwrap();
        let vt = svd.vt.unwrap();
        assert_eq!(u.dim(), (3, 2));
        let rebuilt = (&u * &svd.s).dot(&vt);
        assert_abs_diff_eq!(rebuilt, matrix, epsilon = 1e-12);
    }

    #[test]
    fn provider_dispatches_qr_and_svd_for_f64() {
        let backend = LinAlgBackendProvider::<f64>::new();
        let matrix = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let q = backend.qr_q_factor(&matrix).unwrap();
        // Q spans the column space: projecting A onto it changes nothing.
        assert_abs_diff_eq!(q.dot(&q.t().dot(&matrix)), matrix, epsilon = 1e-12);
        let svd = backend.svd_into(matrix.clone(), false, false).unwrap();
        assert_eq!(svd.s.len(), 2);
        assert!(svd.s[0] >= svd.s[1]);
    }
}
