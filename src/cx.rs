// src/cx.rs

use crate::distributed::DistributedMatrix;
use crate::error::{CxError, Result};
use crate::extraction::{self, ExtractedRows};
use crate::leverage::{self, LeverageEstimate};
use crate::linalg_backends::LinAlgBackendProvider;
use crate::reconstruction::{self, ReconstructionError};
use crate::selection::{self, SelectedIndices, SelectionScheme};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// RNG stream for the Gaussian test matrix of the leverage sketch.
const SKETCH_RNG_STREAM: u64 = 0;
/// RNG stream for randomized column selection.
const SELECTION_RNG_STREAM: u64 = 1;

/// Configuration for the CX pipeline's numerical parameters.
/// The target rank, power iterations and sample size are per-call arguments instead.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CxConfig {
    /// Sketch width as a multiple of the target rank (w = factor * k). Must be at least 1.
    pub oversampling_factor: usize,
    /// The sketch is replaced by its QR Q factor before every this-many-th power
    /// iteration. Must be at least 1; 1 re-orthonormalizes before every iteration.
    pub reorthonormalization_interval: usize,
    /// Seed for the Gaussian sketch and for randomized selection. Each uses its own
    /// ChaCha stream, so changing the scheme never perturbs the sketch.
    pub random_seed: u64,
    /// Relative singular-value cutoff when pseudo-inverting the selected rows.
    /// `None` uses `max(rows, cols) * f64::EPSILON`.
    pub rank_tolerance: Option<f64>,
    /// Fail with `SingularSelection` instead of warning when the selected rows are
    /// numerically dependent.
    pub strict_selection_rank: bool,
}

impl Default for CxConfig {
    fn default() -> Self {
        CxConfig {
            oversampling_factor: 2,
            reorthonormalization_interval: 4,
            random_seed: 2025,
            rank_tolerance: None,
            strict_selection_rank: false,
        }
    }
}

impl CxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.oversampling_factor == 0 {
            return Err(CxError::InvalidConfig("oversampling_factor must be greater than 0".to_string()));
        }
        if self.reorthonormalization_interval == 0 {
            return Err(CxError::InvalidConfig(
                "reorthonormalization_interval must be greater than 0".to_string(),
            ));
        }
        if let Some(tolerance) = self.rank_tolerance {
            if !tolerance.is_finite() || tolerance < 0.0 {
                return Err(CxError::InvalidConfig(format!(
                    "rank_tolerance must be finite and non-negative, got {}",
                    tolerance
                )));
            }
        }
        Ok(())
    }
}

/// Everything one `CxDecomposition::run` produced, stage by stage.
#[derive(Debug, Clone)]
pub struct CxOutput {
    pub leverage: LeverageEstimate,
    pub selection: SelectedIndices,
    pub extracted: ExtractedRows,
    pub error: ReconstructionError,
}

/// CX decomposition of a distributed matrix `A` (m x n).
///
/// Holds only the matrix reference, the configuration and the linear-algebra backend.
/// Every stage takes its inputs as explicit values and returns a fresh value, so stages
/// can be re-run independently (e.g. selecting twice from one `LeverageEstimate`) and
/// one instance can be shared across threads.
///
/// Leverage scores are per column of `A` (`0..n`); the selected indices are then used as
/// row keys when gathering rows from `A`.
#[derive(Debug, Clone)]
pub struct CxDecomposition<'a, M: DistributedMatrix + ?Sized> {
    matrix: &'a M,
    config: CxConfig,
    backend: LinAlgBackendProvider<f64>,
}

impl<'a, M: DistributedMatrix + ?Sized> CxDecomposition<'a, M> {
    /// Binds `matrix` and `config`. Fails with `InvalidConfig` if the configuration is invalid.
    pub fn new(matrix: &'a M, config: CxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            matrix,
            config,
            backend: LinAlgBackendProvider::new(),
        })
    }

    pub fn config(&self) -> &CxConfig {
        &self.config
    }

    pub fn matrix(&self) -> &'a M {
        self.matrix
    }

    fn seeded_rng(&self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.random_seed);
        rng.set_stream(stream);
        rng
    }

    /// Approximate rank-`k` column leverage scores from a sketch refined by `q` power iterations.
    pub fn estimate_leverage(&self, k: usize, q: usize) -> Result<LeverageEstimate> {
        let mut rng = self.seeded_rng(SKETCH_RNG_STREAM);
        leverage::estimate_leverage(self.matrix, &self.backend, &self.config, k, q, &mut rng)
    }

    /// Picks `r` column indices from `leverage`.
    ///
    /// Fails with `DimensionMismatch` if `leverage` was computed for a matrix with a
    /// different number of columns.
    pub fn select(&self, leverage: &LeverageEstimate, scheme: SelectionScheme, r: usize) -> Result<SelectedIndices> {
        let num_cols = self.matrix.num_cols();
        if leverage.num_columns() != num_cols {
            return Err(CxError::DimensionMismatch {
                operation: "select",
                expected: (num_cols, 1),
                actual: (leverage.num_columns(), 1),
            });
        }
        let mut rng = self.seeded_rng(SELECTION_RNG_STREAM);
        selection::select_indices(leverage.scores(), leverage.probabilities(), scheme, r, &mut rng)
    }

    pub fn extract_rows(&self, selection: &SelectedIndices) -> Result<ExtractedRows> {
        extraction::extract_rows(self.matrix, selection)
    }

    /// `||A - A R^+ R||_F` for the extracted rows `R`.
    pub fn reconstruction_error(&self, extracted: &ExtractedRows) -> Result<ReconstructionError> {
        reconstruction::reconstruction_error(self.matrix, &self.backend, &self.config, extracted)
    }

    /// Runs estimate, select, extract and evaluate in order.
    pub fn run(&self, k: usize, q: usize, scheme: SelectionScheme, r: usize) -> Result<CxOutput> {
        info!(
            "Starting CX decomposition. A={}x{}, k={}, q={}, r={}, scheme={}",
            self.matrix.num_rows(),
            self.matrix.num_cols(),
            k,
            q,
            r,
            scheme
        );
        let overall_start_time = std::time::Instant::now();

        let leverage = self.estimate_leverage(k, q)?;
        let selection = self.select(&leverage, scheme, r)?;
        let extracted = self.extract_rows(&selection)?;
        let error = self.reconstruction_error(&extracted)?;

        info!(
            "CX decomposition finished in {:?}: {} rows, relative error {:.6e}",
            overall_start_time.elapsed(),
            extracted.len(),
            error.relative_error
        );
        Ok(CxOutput {
            leverage,
            selection,
            extracted,
            error,
        })
    }
}

#[cfg(test)]
mod cx_config_tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CxConfig::default();
        assert_eq!(config.oversampling_factor, 2);
        assert_eq!(config.reorthonormalization_interval, 4);
        assert_eq!(config.random_seed, 2025);
        assert_eq!(config.rank_tolerance, None);
        assert!(!config.strict_selection_rank);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let zero_factor = CxConfig { oversampling_factor: 0, ..CxConfig::default() };
        let zero_interval = CxConfig { reorthonormalization_interval: 0, ..CxConfig::default() };
        let negative_tolerance = CxConfig { rank_tolerance: Some(-1.0), ..CxConfig::default() };
        let nan_tolerance = CxConfig { rank_tolerance: Some(f64::NAN), ..CxConfig::default() };
        for config in [zero_factor, zero_interval, negative_tolerance, nan_tolerance] {
            assert!(matches!(config.validate(), Err(CxError::InvalidConfig(_))));
        }

        let matrix = ndarray::Array2::<f64>::zeros((2, 2));
        let bad = CxConfig { oversampling_factor: 0, ..CxConfig::default() };
        assert!(matches!(CxDecomposition::new(&matrix, bad), Err(CxError::InvalidConfig(_))));
    }
}
