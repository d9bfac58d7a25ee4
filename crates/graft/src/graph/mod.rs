//! Graph construction and execution.

pub(crate) mod builder;
pub(crate) mod dependency;
mod inserter;
pub(crate) mod node;
mod upsert;

pub use inserter::{BatchInserter, GraphInserter, TableBatch, inserter_fn};
pub use upsert::{DeleteOp, GraphExecutor, GraphUpserter, RelateOp, UnrelateOp, UpsertOp};
