//! Turning features into dispatchable work: decomposition and batch packing.

mod batch;
mod decomposer;

pub use batch::{validate_batch, validate_layer, Batch, BatchId, BatchOptimizer, MAX_BATCH_MINUTES};
pub use decomposer::{complexity_score, DomainKeywords, TaskDecomposer};
