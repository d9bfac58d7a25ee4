//! Dependency-ordered batch insertion.
//!
//! [`GraphInserter`] repeatedly collects every ready node, groups the rows
//! by destination table and submits one batch per table, then feeds the
//! returned rows (with their generated keys) back into the graph so the
//! next wave becomes ready. Join rows for many-to-many connections are
//! deferred to a final phase once every endpoint has been written.
//!
//! # Example
//! ```ignore
//! use graft::{GraphInserter, GraphOptions, TableBatch};
//!
//! let inserter = GraphInserter::new(&schema, "persons", models, &GraphOptions::default())?;
//! let models = inserter.execute(&backend).await?;
//! ```

use crate::error::{GraftError, GraftResult};
use crate::graph::builder::DependencyGraph;
use crate::graph::dependency;
use crate::graph::node::NodeId;
use crate::options::{GraphConfig, GraphOptions};
use crate::schema::{Row, Schema};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use tracing::debug;

/// A set of rows destined for one table, submitted as a single statement.
#[derive(Debug, Clone)]
pub struct TableBatch {
    pub table: String,
    pub rows: Vec<Row>,
}

/// Backend writing one table batch and returning the inserted rows.
///
/// The returned rows must be in submission order and carry every
/// database-generated value (keys included); the engine feeds them back
/// into dependent rows.
pub trait BatchInserter: Send + Sync {
    fn insert(&self, batch: TableBatch) -> impl Future<Output = GraftResult<Vec<Row>>> + Send;
}

/// Adapt an async closure into a [`BatchInserter`].
pub fn inserter_fn<F, Fut>(f: F) -> impl BatchInserter
where
    F: Fn(TableBatch) -> Fut + Send + Sync,
    Fut: Future<Output = GraftResult<Vec<Row>>> + Send,
{
    FnInserter(f)
}

struct FnInserter<F>(F);

impl<F, Fut> BatchInserter for FnInserter<F>
where
    F: Fn(TableBatch) -> Fut + Send + Sync,
    Fut: Future<Output = GraftResult<Vec<Row>>> + Send,
{
    fn insert(&self, batch: TableBatch) -> impl Future<Output = GraftResult<Vec<Row>>> + Send {
        (self.0)(batch)
    }
}

/// Executes a built dependency graph as ordered table batches.
#[derive(Debug)]
pub struct GraphInserter {
    graph: DependencyGraph,
    config: GraphConfig,
}

impl GraphInserter {
    /// Build the graph for `models` and validate it for execution.
    pub fn new(
        schema: &Schema,
        root_table: &str,
        models: Vec<Value>,
        options: &GraphOptions,
    ) -> GraftResult<Self> {
        Self::with_config(schema, root_table, models, options, GraphConfig::default())
    }

    pub fn with_config(
        schema: &Schema,
        root_table: &str,
        models: Vec<Value>,
        options: &GraphOptions,
        config: GraphConfig,
    ) -> GraftResult<Self> {
        let mut graph = DependencyGraph::build(schema, root_table, models, options)?;
        graph.check_for_cyclic_references()?;
        Ok(Self { graph, config })
    }

    pub(crate) fn from_graph(graph: DependencyGraph, config: GraphConfig) -> Self {
        Self { graph, config }
    }

    /// Insert every row and return the input models with generated values
    /// filled in and bookkeeping properties stripped.
    pub async fn execute<I: BatchInserter>(mut self, inserter: &I) -> GraftResult<Vec<Value>> {
        self.run(inserter).await?;
        Ok(self.graph.into_models())
    }

    pub(crate) fn into_graph(self) -> DependencyGraph {
        self.graph
    }

    pub(crate) async fn run<I: BatchInserter>(&mut self, inserter: &I) -> GraftResult<()> {
        loop {
            let ready = self.graph.ready_nodes();
            if ready.is_empty() {
                break;
            }
            self.insert_wave(ready, inserter).await?;
        }

        let stalled = self
            .graph
            .nodes
            .iter()
            .filter(|node| !node.handled)
            .count();
        if stalled > 0 {
            return Err(GraftError::invalid_graph(format!(
                "insertion stalled with {stalled} unresolved node(s)"
            )));
        }

        self.insert_join_rows(inserter).await
    }

    /// Insert one ready set: group by table in first-seen order, submit,
    /// merge the returned rows back and resolve outgoing edges.
    async fn insert_wave<I: BatchInserter>(
        &mut self,
        ready: Vec<NodeId>,
        inserter: &I,
    ) -> GraftResult<()> {
        let mut groups: Vec<(String, Vec<NodeId>)> = Vec::new();
        for id in ready {
            let table = self.graph.nodes[id.index()].table.clone();
            match groups.iter_mut().find(|(name, _)| *name == table) {
                Some((_, ids)) => ids.push(id),
                None => groups.push((table, vec![id])),
            }
        }

        // Handled is flipped before submission so edge resolution below
        // cannot re-surface these nodes as ready.
        let mut prepared: Vec<(Vec<NodeId>, TableBatch)> = Vec::new();
        for (table, ids) in groups {
            let mut rows = Vec::with_capacity(ids.len());
            for id in &ids {
                let node = &mut self.graph.nodes[id.index()];
                node.handled = true;
                let mut row = node.model.clone();
                row.retain(|key, _| !self.graph.schema.is_marker_prop(key));
                rows.push(row);
            }
            if let Some(hook) = self
                .graph
                .schema
                .table_opt(&table)
                .and_then(|info| info.before_insert)
            {
                hook(&mut rows);
            }
            debug!(table = %table, rows = rows.len(), "inserting batch");
            prepared.push((ids, TableBatch { table, rows }));
        }

        let results: Vec<(Vec<NodeId>, Vec<Row>)> = if self.config.batch_concurrency > 1 {
            stream::iter(prepared.into_iter().map(|(ids, batch)| async move {
                let rows = inserter.insert(batch).await?;
                Ok::<_, GraftError>((ids, rows))
            }))
            .buffer_unordered(self.config.batch_concurrency)
            .try_collect()
            .await?
        } else {
            let mut results = Vec::new();
            for (ids, batch) in prepared {
                let rows = inserter.insert(batch).await?;
                results.push((ids, rows));
            }
            results
        };

        let mut inserted = Vec::new();
        for (ids, rows) in results {
            if rows.len() != ids.len() {
                return Err(GraftError::executor(format!(
                    "backend returned {} row(s) for a batch of {}",
                    rows.len(),
                    ids.len()
                )));
            }
            for (id, row) in ids.into_iter().zip(rows) {
                let node = &mut self.graph.nodes[id.index()];
                for (key, value) in row {
                    node.model.insert(key, value);
                }
                inserted.push(id);
            }
        }

        for id in inserted {
            let deps = std::mem::take(&mut self.graph.nodes[id.index()].is_needed_by);
            for dep in deps {
                dependency::resolve(&mut self.graph.nodes, id, &dep)?;
            }
        }
        Ok(())
    }

    /// Final phase: one batch per join table, deduplicated, built from the
    /// now-known key values of both endpoints.
    async fn insert_join_rows<I: BatchInserter>(&mut self, inserter: &I) -> GraftResult<()> {
        let mut tables: Vec<String> = Vec::new();
        let mut rows_by_table: HashMap<String, Vec<Row>> = HashMap::new();

        for index in 0..self.graph.nodes.len() {
            let connections = self.graph.nodes[index].m2m.clone();
            for conn in connections {
                let owner = &self.graph.nodes[index];
                let relation = self
                    .graph
                    .schema
                    .table(&owner.table)?
                    .relations
                    .get(conn.relation)
                    .cloned()
                    .ok_or_else(|| {
                        GraftError::invalid_graph(format!(
                            "dangling relation index on table '{}'",
                            owner.table
                        ))
                    })?;
                let Some(join) = relation.join else {
                    return Err(GraftError::invalid_graph(format!(
                        "relation '{}' has no join table",
                        relation.name
                    )));
                };

                let related = &self.graph.nodes[conn.node.index()];
                let mut row = Row::new();
                for (join_column, owner_column) in
                    join.owner_columns.iter().zip(&relation.owner_columns)
                {
                    row.insert(
                        join_column.clone(),
                        column_value(owner.model.get(owner_column), &owner.table, owner_column)?,
                    );
                }
                for (join_column, related_column) in
                    join.related_columns.iter().zip(&relation.related_columns)
                {
                    row.insert(
                        join_column.clone(),
                        column_value(
                            related.model.get(related_column),
                            &related.table,
                            related_column,
                        )?,
                    );
                }
                // Extra join columns come from the reference node when the
                // endpoint was named through one, otherwise from the node.
                let extra_source = &self.graph.nodes[conn.ref_node.unwrap_or(conn.node).index()];
                for column in &join.extra_columns {
                    if let Some(value) = extra_source.model.get(column) {
                        row.insert(column.clone(), value.clone());
                    }
                }

                if !rows_by_table.contains_key(&join.table) {
                    tables.push(join.table.clone());
                }
                rows_by_table.entry(join.table).or_default().push(row);
            }
        }

        for table in tables {
            let mut rows = rows_by_table.remove(&table).unwrap_or_default();
            rows = dedupe_rows(rows);
            if let Some(hook) = self
                .graph
                .schema
                .table_opt(&table)
                .and_then(|info| info.before_insert)
            {
                hook(&mut rows);
            }
            debug!(table = %table, rows = rows.len(), "inserting join batch");
            // Join rows carry no generated values the graph depends on.
            inserter.insert(TableBatch { table, rows }).await?;
        }
        Ok(())
    }
}

fn column_value(value: Option<&Value>, table: &str, column: &str) -> GraftResult<Value> {
    value.cloned().ok_or_else(|| {
        GraftError::invalid_graph(format!(
            "row for table '{table}' has no value for join column '{column}'"
        ))
    })
}

/// Deduplicate join rows over the union of their keys, treating missing
/// columns as null.
fn dedupe_rows(rows: Vec<Row>) -> Vec<Row> {
    let columns: BTreeSet<String> = rows
        .iter()
        .flat_map(|row| row.keys().cloned())
        .collect();
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let key = Value::Array(
                columns
                    .iter()
                    .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
                    .collect(),
            )
            .to_string();
            seen.insert(key)
        })
        .collect()
}
