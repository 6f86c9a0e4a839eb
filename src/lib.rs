// CX decomposition with randomized leverage scores

#![doc = include_str!("../README.md")]

pub mod cx;
pub mod distributed;
pub mod error;
pub mod extraction;
pub mod leverage;
pub mod linalg_backends;
pub mod reconstruction;
pub mod selection;

pub use cx::{CxConfig, CxDecomposition, CxOutput};
pub use distributed::{DistributedMatrix, PartitionedRowMatrix, RowKey};
pub use error::{CxError, Result, ThreadSafeStdError};
pub use extraction::ExtractedRows;
pub use leverage::{exact_leverage_scores, ExactLeverage, LeverageAxis, LeverageEstimate};
pub use reconstruction::ReconstructionError;
pub use selection::{select_indices, SelectedIndices, SelectionScheme};
