// src/extraction.rs

use crate::distributed::{DistributedMatrix, RowKey};
use crate::error::{CxError, Result};
use crate::selection::SelectedIndices;
use log::{debug, info};
use ndarray::{Array2, Axis};
use std::collections::HashSet;

/// Rows gathered from the distributed matrix for a selection.
///
/// `keys` is strictly ascending and `rows.row(i)` is the row stored under `keys[i]`.
/// Each distinct selected index contributes exactly one row.
#[derive(Debug, Clone)]
pub struct ExtractedRows {
    keys: Vec<RowKey>,
    rows: Array2<f64>,
}

impl ExtractedRows {
    pub fn keys(&self) -> &[RowKey] {
        &self.keys
    }

    pub fn rows(&self) -> &Array2<f64> {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn into_parts(self) -> (Vec<RowKey>, Array2<f64>) {
        (self.keys, self.rows)
    }
}

/// Gathers the rows of `matrix` whose keys appear in `selection`.
///
/// Membership is by key identity, so repeated indices collapse into one row.
///
/// # Errors
/// `EmptySelection` for an empty selection; `MissingKey` listing every requested key the
/// matrix does not hold; `DimensionMismatch` if a gathered row does not have `n` entries.
pub fn extract_rows<M: DistributedMatrix + ?Sized>(
    matrix: &M,
    selection: &SelectedIndices,
) -> Result<ExtractedRows> {
    if selection.is_empty() {
        return Err(CxError::EmptySelection);
    }
    let num_cols = matrix.num_cols();
    let requested: HashSet<RowKey> = selection.indices().iter().copied().map(RowKey).collect();
    info!(
        "Extracting {} distinct rows ({} selected indices)",
        requested.len(),
        selection.len()
    );

    let mut gathered = matrix
        .filter_rows_by_key_set(&requested)
        .map_err(CxError::collaborator("filter_rows_by_key_set"))?;
    gathered.retain(|(key, _)| requested.contains(key));
    gathered.sort_by_key(|(key, _)| *key);
    gathered.dedup_by_key(|(key, _)| *key);

    if gathered.len() < requested.len() {
        let found: HashSet<RowKey> = gathered.iter().map(|(key, _)| *key).collect();
        let mut missing: Vec<usize> = requested.difference(&found).map(|key| key.0).collect();
        missing.sort_unstable();
        return Err(CxError::MissingKey { missing });
    }

    let mut rows = Array2::<f64>::zeros((gathered.len(), num_cols));
    let mut keys = Vec::with_capacity(gathered.len());
    for ((key, row), mut target) in gathered.into_iter().zip(rows.axis_iter_mut(Axis(0))) {
        if row.len() != num_cols {
            return Err(CxError::DimensionMismatch {
                operation: "filter_rows_by_key_set",
                expected: (1, num_cols),
                actual: (1, row.len()),
            });
        }
        target.assign(&row);
        keys.push(key);
    }
    debug!("Extracted rows form a {}x{} matrix.", rows.nrows(), rows.ncols());

    Ok(ExtractedRows { keys, rows })
}
