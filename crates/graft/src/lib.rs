//! # graft
//!
//! A graph write engine for relational data.
//!
//! ## Features
//!
//! - **Dependency-ordered inserts**: nested object graphs become batched
//!   multi-table inserts, FK values flowing from parent to child as rows
//!   are written
//! - **Reference grammar**: `#id` / `#ref` name graph-internal rows,
//!   `#ref{id.prop}` splices referenced values into properties, `#dbRef`
//!   attaches rows that already exist in the database
//! - **Upsert reconciliation**: diff a new graph against its persisted
//!   shape into inserts, updates, patches, deletes, relates and unrelates
//! - **Backend agnostic**: the engine owns no SQL; callers plug in a
//!   [`BatchInserter`] (inserts) or a [`GraphExecutor`] (upserts)
//! - **Cycle detection**: reference cycles are rejected before any write
//!
//! ## Inserting a graph
//!
//! ```ignore
//! use graft::{GraphInserter, GraphOptions, Relation, Schema, TableInfo};
//! use serde_json::json;
//!
//! let schema = Schema::new().with_table(
//!     TableInfo::new("persons")
//!         .with_id("id")
//!         .with_relation(Relation::has_many("children", ["id"], "persons", ["parent_id"])),
//! );
//!
//! let models = vec![json!({
//!     "name": "Sylvester",
//!     "children": [{"name": "Sage"}, {"name": "Seargeoh"}],
//! })];
//!
//! let inserter = GraphInserter::new(&schema, "persons", models, &GraphOptions::default())?;
//! let inserted = inserter.execute(&backend).await?;
//! ```
//!
//! ## Upserting a graph
//!
//! ```ignore
//! use graft::{GraphOptions, GraphUpserter};
//!
//! let upserter = GraphUpserter::new(&schema, GraphOptions::new().unrelate(true));
//! let models = upserter
//!     .run("persons", new_graph, persisted_graph, &backend)
//!     .await?;
//! ```

pub mod error;
pub mod graph;
pub mod options;
pub mod schema;

pub use error::{GraftError, GraftResult};
pub use graph::{
    BatchInserter, DeleteOp, GraphExecutor, GraphInserter, GraphUpserter, RelateOp, TableBatch,
    UnrelateOp, UpsertOp, inserter_fn,
};
pub use options::{AllowPredicate, GraphConfig, GraphOptions, OptionScope};
pub use schema::{
    BeforeInsert, DB_REF_PROP, JoinTable, REF_PROP, Relation, RelationKind, Row, Schema, TableInfo,
    UID_PROP,
};
