//! Graph upsert: diffing a new object graph against its persisted shape.
//!
//! [`GraphUpserter`] walks the new and the persisted graph side by side and
//! classifies every node: matched rows become updates or patches, rows
//! without identifiers become inserts, and persisted rows missing from the
//! new graph are deleted or unrelated depending on the options. The insert
//! subset is then executed through [`GraphInserter`], so ordering, `#ref`
//! resolution and join rows behave exactly as in a plain insert.
//!
//! # Example
//! ```ignore
//! use graft::{GraphOptions, GraphUpserter};
//!
//! let upserter = GraphUpserter::new(&schema, GraphOptions::new().unrelate(true));
//! let models = upserter
//!     .run("persons", new_graph, persisted_graph, &backend)
//!     .await?;
//! ```

use crate::error::{GraftError, GraftResult};
use crate::graph::builder::DependencyGraph;
use crate::graph::inserter::{BatchInserter, GraphInserter};
use crate::graph::node::NodeId;
use crate::options::{GraphConfig, GraphOptions, join_path};
use crate::schema::{Relation, RelationKind, Row, Schema, TableInfo};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// How one node of the new graph is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UpsertOp {
    /// Row without an identifier: inserted.
    Insert,
    /// Row with an identifier not found among the persisted children,
    /// inserted keeping the caller-provided identifier.
    InsertMissing,
    /// Matched row, written as a full-row update.
    Update,
    /// Matched row, written as a patch of the provided properties.
    Patch,
    /// Existing row attached to its parent without being written.
    Relate,
    /// Matched row whose own write is suppressed; children still recurse.
    UpsertRecursively,
    /// Skipped entirely, subtree included.
    None,
}

/// Deletion of a persisted child missing from the new graph.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOp {
    pub table: String,
    /// Relation (on the parent) the row was reached through.
    pub relation: String,
    pub id: Vec<Value>,
}

/// Detachment of a persisted child without deleting its row.
///
/// For a to-one relation the owner's FK columns are set to null; for a
/// to-many relation the child's FK columns are; for a many-to-many
/// relation the join row in `join_table` is deleted.
#[derive(Debug, Clone, Serialize)]
pub struct UnrelateOp {
    pub kind: RelationKind,
    /// Table of the row whose columns are nulled (owner for to-one, child
    /// for to-many); for many-to-many, the related table.
    pub table: String,
    pub relation: String,
    /// FK columns to null. Empty for many-to-many.
    pub columns: Vec<String>,
    /// Identifier of the row addressed by `table`.
    pub id: Vec<Value>,
    pub join_table: Option<String>,
    pub join_row: Option<Row>,
}

/// Attachment of an existing to-many child: its FK columns are set to the
/// owner's key values.
#[derive(Debug, Clone, Serialize)]
pub struct RelateOp {
    pub kind: RelationKind,
    /// Table of the child row being updated.
    pub table: String,
    pub relation: String,
    /// FK columns on the child.
    pub columns: Vec<String>,
    /// Owner key values written into `columns`.
    pub values: Vec<Value>,
    /// Identifier of the child row.
    pub id: Vec<Value>,
}

/// Backend surface for graph upserts. Batching inserts go through the
/// [`BatchInserter`] supertrait; everything else is row-at-a-time.
pub trait GraphExecutor: BatchInserter {
    /// Overwrite the full row.
    fn update(
        &self,
        table: &str,
        id: &[Value],
        row: Row,
    ) -> impl Future<Output = GraftResult<()>> + Send;

    /// Write only the provided properties.
    fn patch(
        &self,
        table: &str,
        id: &[Value],
        row: Row,
    ) -> impl Future<Output = GraftResult<()>> + Send;

    /// Delete a row, returning the number of rows removed.
    fn delete(&self, op: DeleteOp) -> impl Future<Output = GraftResult<u64>> + Send;

    fn relate(&self, op: RelateOp) -> impl Future<Output = GraftResult<()>> + Send;

    fn unrelate(&self, op: UnrelateOp) -> impl Future<Output = GraftResult<()>> + Send;
}

/// Reconciles a new object graph against its persisted counterpart.
pub struct GraphUpserter {
    schema: Schema,
    options: GraphOptions,
    config: GraphConfig,
}

impl GraphUpserter {
    pub fn new(schema: &Schema, options: GraphOptions) -> Self {
        Self {
            schema: schema.clone(),
            options,
            config: GraphConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Classify, then execute: unrelates and deletes first, the insert
    /// subset as ordered batches, updates and patches, and finally the
    /// explicit relate operations. Returns the new models with generated
    /// values filled in.
    pub async fn run<E: GraphExecutor>(
        &self,
        root_table: &str,
        new_roots: Vec<Value>,
        persisted_roots: Vec<Value>,
        executor: &E,
    ) -> GraftResult<Vec<Value>> {
        self.schema.table(root_table)?;

        let mut classifier = Classifier {
            schema: &self.schema,
            options: &self.options,
            plan: ReconcilePlan::default(),
        };
        classifier.classify_roots(root_table, &new_roots, &persisted_roots)?;
        let plan = classifier.plan;

        let mut graph = DependencyGraph::build(&self.schema, root_table, new_roots, &self.options)?;
        self.premark(&mut graph, &plan)?;
        self.prune_connections(&mut graph, &plan);
        graph.check_for_cyclic_references()?;

        for op in &plan.unrelates {
            debug!(table = %op.table, relation = %op.relation, "unrelating row");
            executor.unrelate(op.clone()).await?;
        }
        for op in &plan.deletes {
            debug!(table = %op.table, relation = %op.relation, "deleting row");
            executor.delete(op.clone()).await?;
        }

        let mut inserter = GraphInserter::from_graph(graph, self.config.clone());
        inserter.run(executor).await?;
        let graph = inserter.into_graph();

        self.write_matched(&graph, &plan, executor).await?;
        self.relate_children(&graph, &plan, executor).await?;

        Ok(graph.into_models())
    }

    /// Mark every node that never enters insert batching as handled, so
    /// its key values flow to dependents and the inserter skips it.
    fn premark(&self, graph: &mut DependencyGraph, plan: &ReconcilePlan) -> GraftResult<()> {
        for index in 0..graph.nodes.len() {
            let locator = graph.nodes[index].locator.clone();
            match plan.ops.get(&locator) {
                Some(
                    UpsertOp::Update
                    | UpsertOp::Patch
                    | UpsertOp::Relate
                    | UpsertOp::UpsertRecursively,
                ) => {
                    graph.mark_handled_resolving(NodeId(index))?;
                }
                Some(UpsertOp::None) => {
                    // Skipped subtree: release dependents without writing
                    // values they will never get.
                    graph.nodes[index].handled = true;
                    let deps = std::mem::take(&mut graph.nodes[index].is_needed_by);
                    for dep in deps {
                        graph.nodes[dep.node.index()].handled_needs += 1;
                    }
                }
                Some(UpsertOp::Insert | UpsertOp::InsertMissing) | None => {}
            }
        }
        Ok(())
    }

    /// Drop many-to-many connections whose join row already exists: both
    /// endpoints were persisted and the child is neither inserted nor
    /// freshly related.
    fn prune_connections(&self, graph: &mut DependencyGraph, plan: &ReconcilePlan) {
        for index in 0..graph.nodes.len() {
            let owner_inserted = matches!(
                plan.ops.get(&graph.nodes[index].locator),
                None | Some(UpsertOp::Insert | UpsertOp::InsertMissing)
            );
            let connections = graph.nodes[index].m2m.clone();
            let kept: Vec<_> = connections
                .into_iter()
                .filter(|conn| {
                    if owner_inserted {
                        return true;
                    }
                    let child = &graph.nodes[conn.node.index()];
                    if child.is_db_ref() {
                        return true;
                    }
                    matches!(
                        plan.ops.get(&child.locator),
                        None | Some(UpsertOp::Insert | UpsertOp::InsertMissing | UpsertOp::Relate)
                    )
                })
                .collect();
            graph.nodes[index].m2m = kept;
        }
    }

    async fn write_matched<E: GraphExecutor>(
        &self,
        graph: &DependencyGraph,
        plan: &ReconcilePlan,
        executor: &E,
    ) -> GraftResult<()> {
        for (index, node) in graph.nodes.iter().enumerate() {
            let op = match plan.ops.get(&node.locator) {
                Some(op @ (UpsertOp::Update | UpsertOp::Patch)) => op,
                _ => continue,
            };
            let info = self.schema.table(&node.table)?;
            let id = id_values(info, &node.model).ok_or_else(|| {
                GraftError::validation(format!(
                    "matched row for table '{}' lost its identifier",
                    node.table
                ))
            })?;
            let mut row = node.model.clone();
            row.retain(|key, _| {
                !self.schema.is_marker_prop(key) && !info.id_columns.iter().any(|c| c == key)
            });
            if row.is_empty() {
                continue;
            }
            debug!(table = %node.table, node = index, "writing matched row");
            match op {
                UpsertOp::Update => executor.update(&node.table, &id, row).await?,
                _ => executor.patch(&node.table, &id, row).await?,
            }
        }
        Ok(())
    }

    /// Attach related to-many children by updating their FK columns. The
    /// to-one case flows through the owner's own write, and many-to-many
    /// relates through the join-row phase.
    async fn relate_children<E: GraphExecutor>(
        &self,
        graph: &DependencyGraph,
        plan: &ReconcilePlan,
        executor: &E,
    ) -> GraftResult<()> {
        for index in 0..graph.nodes.len() {
            let node = &graph.nodes[index];
            if plan.ops.get(&node.locator) != Some(&UpsertOp::Relate) {
                continue;
            }
            let Some(relation) = graph.relation_of(NodeId(index)) else {
                continue;
            };
            if relation.kind != RelationKind::HasMany {
                continue;
            }
            let Some(parent) = node.parent else { continue };
            let owner = &graph.nodes[parent.index()];
            let values: Vec<Value> = relation
                .owner_columns
                .iter()
                .map(|column| {
                    owner.model.get(column).cloned().ok_or_else(|| {
                        GraftError::validation(format!(
                            "cannot relate through '{}': owner is missing '{column}'",
                            relation.name
                        ))
                    })
                })
                .collect::<GraftResult<_>>()?;
            let related_info = self.schema.table(&relation.related_table)?;
            let id = id_values(related_info, &node.model).ok_or_else(|| {
                GraftError::validation(format!(
                    "cannot relate through '{}': related row has no identifier",
                    relation.name
                ))
            })?;
            executor
                .relate(RelateOp {
                    kind: relation.kind,
                    table: relation.related_table.clone(),
                    relation: relation.name.clone(),
                    columns: relation.related_columns.clone(),
                    values,
                    id,
                })
                .await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReconcilePlan {
    /// Operation per node, keyed by the node's position locator.
    ops: HashMap<String, UpsertOp>,
    deletes: Vec<DeleteOp>,
    unrelates: Vec<UnrelateOp>,
}

/// Side-by-side walk of the new and persisted graphs.
struct Classifier<'a> {
    schema: &'a Schema,
    options: &'a GraphOptions,
    plan: ReconcilePlan,
}

impl Classifier<'_> {
    fn classify_roots(
        &mut self,
        table: &str,
        new_roots: &[Value],
        persisted_roots: &[Value],
    ) -> GraftResult<()> {
        let info = self.schema.table(table)?;
        let persisted: Vec<&Row> = persisted_roots
            .iter()
            .map(as_object)
            .collect::<GraftResult<_>>()?;

        for (index, new_root) in new_roots.iter().enumerate() {
            let obj = as_object(new_root)?;
            let locator = index.to_string();
            let Some(id) = id_values(info, obj) else {
                self.mark_insert_subtree(table, obj, "", &locator, UpsertOp::Insert)?;
                continue;
            };
            match persisted
                .iter()
                .find(|p| id_values(info, p).as_ref() == Some(&id))
            {
                Some(p) => self.classify_matched(table, obj, p, "", &locator)?,
                None if self.options.insert_missing.contains("") => {
                    self.mark_insert_subtree(table, obj, "", &locator, UpsertOp::InsertMissing)?;
                }
                None => {
                    return Err(GraftError::validation(format!(
                        "root row of table '{table}' with id {id:?} is not among the persisted rows"
                    )));
                }
            }
        }
        // Persisted roots without a new counterpart are left untouched.
        Ok(())
    }

    fn classify_matched(
        &mut self,
        table: &str,
        new: &Row,
        persisted: &Row,
        path: &str,
        locator: &str,
    ) -> GraftResult<()> {
        let info = self.schema.table(table)?;
        let op = if self.options.no_update.contains(path) {
            UpsertOp::UpsertRecursively
        } else if self.options.update.contains(path) {
            UpsertOp::Update
        } else {
            UpsertOp::Patch
        };
        self.plan.ops.insert(locator.to_string(), op);

        for relation in info.relations.clone() {
            // A relation key absent from the new graph leaves the persisted
            // children untouched; null or [] means "remove them all".
            let Some(new_value) = new.get(&relation.name) else {
                continue;
            };
            let child_path = join_path(path, &relation.name);
            let related_info = self.schema.table(&relation.related_table)?.clone();
            let (new_children, many) = normalize_children(new_value, &child_path)?;
            let (persisted_children, _) = persisted
                .get(&relation.name)
                .map(|value| normalize_children(value, &child_path))
                .transpose()?
                .unwrap_or_default();
            let mut matched = vec![false; persisted_children.len()];

            for (index, child) in new_children.iter().enumerate() {
                let child_locator = child_locator(locator, &relation.name, many, index);
                if is_marker_node(self.schema, child) {
                    self.plan.ops.insert(child_locator, UpsertOp::Insert);
                    continue;
                }
                let Some(child_id) = id_values(&related_info, child) else {
                    let op = if self.options.no_insert.contains(&child_path) {
                        UpsertOp::None
                    } else {
                        UpsertOp::Insert
                    };
                    self.mark_insert_subtree(
                        &relation.related_table,
                        child,
                        &child_path,
                        &child_locator,
                        op,
                    )?;
                    continue;
                };

                let position = persisted_children.iter().enumerate().position(|(i, p)| {
                    !matched[i] && id_values(&related_info, p).as_ref() == Some(&child_id)
                });
                if let Some(position) = position {
                    matched[position] = true;
                    self.classify_matched(
                        &relation.related_table,
                        child,
                        persisted_children[position],
                        &child_path,
                        &child_locator,
                    )?;
                } else if self.options.relate.contains(&child_path)
                    && !self.options.no_relate.contains(&child_path)
                {
                    self.plan.ops.insert(child_locator, UpsertOp::Relate);
                } else if self.options.insert_missing.contains(&child_path) {
                    self.mark_insert_subtree(
                        &relation.related_table,
                        child,
                        &child_path,
                        &child_locator,
                        UpsertOp::InsertMissing,
                    )?;
                } else {
                    return Err(GraftError::validation(format!(
                        "row of table '{}' with id {child_id:?} is not a child of its parent \
                         through '{child_path}'; enable the relate or insert-missing option \
                         to attach it",
                        relation.related_table
                    )));
                }
            }

            for (index, p) in persisted_children.iter().enumerate() {
                if matched[index] {
                    continue;
                }
                let Some(child_id) = id_values(&related_info, p) else {
                    continue;
                };
                if self.options.unrelate.contains(&child_path)
                    && !self.options.no_unrelate.contains(&child_path)
                {
                    self.plan
                        .unrelates
                        .push(self.unrelate_op(&relation, info, persisted, p, child_id)?);
                } else if !self.options.no_delete.contains(&child_path) {
                    if relation.kind == RelationKind::BelongsToOne {
                        // Clear the owner's FK before the child row goes.
                        self.plan.unrelates.push(self.unrelate_op(
                            &relation,
                            info,
                            persisted,
                            p,
                            child_id.clone(),
                        )?);
                    }
                    self.plan.deletes.push(DeleteOp {
                        table: relation.related_table.clone(),
                        relation: relation.name.clone(),
                        id: child_id,
                    });
                }
            }
        }
        Ok(())
    }

    fn unrelate_op(
        &self,
        relation: &Relation,
        owner_info: &TableInfo,
        owner: &Row,
        child: &Row,
        child_id: Vec<Value>,
    ) -> GraftResult<UnrelateOp> {
        match relation.kind {
            RelationKind::BelongsToOne => {
                let owner_id = id_values(owner_info, owner).ok_or_else(|| {
                    GraftError::validation(format!(
                        "cannot unrelate through '{}': owner has no identifier",
                        relation.name
                    ))
                })?;
                Ok(UnrelateOp {
                    kind: relation.kind,
                    table: owner_info.name.clone(),
                    relation: relation.name.clone(),
                    columns: relation.owner_columns.clone(),
                    id: owner_id,
                    join_table: None,
                    join_row: None,
                })
            }
            RelationKind::HasMany => Ok(UnrelateOp {
                kind: relation.kind,
                table: relation.related_table.clone(),
                relation: relation.name.clone(),
                columns: relation.related_columns.clone(),
                id: child_id,
                join_table: None,
                join_row: None,
            }),
            RelationKind::ManyToMany => {
                let join = relation.join.as_ref().ok_or_else(|| {
                    GraftError::validation(format!(
                        "relation '{}' has no join table",
                        relation.name
                    ))
                })?;
                let mut row = Row::new();
                for (join_column, owner_column) in
                    join.owner_columns.iter().zip(&relation.owner_columns)
                {
                    let value = owner.get(owner_column).cloned().ok_or_else(|| {
                        GraftError::validation(format!(
                            "cannot unrelate through '{}': owner is missing '{owner_column}'",
                            relation.name
                        ))
                    })?;
                    row.insert(join_column.clone(), value);
                }
                for (join_column, related_column) in
                    join.related_columns.iter().zip(&relation.related_columns)
                {
                    let value = child.get(related_column).cloned().ok_or_else(|| {
                        GraftError::validation(format!(
                            "cannot unrelate through '{}': child is missing '{related_column}'",
                            relation.name
                        ))
                    })?;
                    row.insert(join_column.clone(), value);
                }
                Ok(UnrelateOp {
                    kind: relation.kind,
                    table: relation.related_table.clone(),
                    relation: relation.name.clone(),
                    columns: Vec::new(),
                    id: child_id,
                    join_table: Some(join.table.clone()),
                    join_row: Some(row),
                })
            }
        }
    }

    /// Mark a whole subtree as inserted (or skipped). Children of an
    /// insert node are plain inserts; their identifiers, if any, are kept
    /// verbatim by the insert path.
    fn mark_insert_subtree(
        &mut self,
        table: &str,
        obj: &Row,
        path: &str,
        locator: &str,
        op: UpsertOp,
    ) -> GraftResult<()> {
        self.plan.ops.insert(locator.to_string(), op.clone());
        let info = self.schema.table(table)?.clone();
        for relation in &info.relations {
            let Some(value) = obj.get(&relation.name) else {
                continue;
            };
            let child_path = join_path(path, &relation.name);
            let (children, many) = normalize_children(value, &child_path)?;
            for (index, child) in children.iter().enumerate() {
                let child_locator = child_locator(locator, &relation.name, many, index);
                if is_marker_node(self.schema, child) {
                    self.plan.ops.insert(child_locator, UpsertOp::Insert);
                    continue;
                }
                let child_op = if op == UpsertOp::None || self.options.no_insert.contains(&child_path)
                {
                    UpsertOp::None
                } else {
                    UpsertOp::Insert
                };
                self.mark_insert_subtree(
                    &relation.related_table,
                    child,
                    &child_path,
                    &child_locator,
                    child_op,
                )?;
            }
        }
        Ok(())
    }
}

fn child_locator(parent: &str, relation: &str, many: bool, index: usize) -> String {
    if many {
        format!("{parent}.{relation}[{index}]")
    } else {
        format!("{parent}.{relation}")
    }
}

fn as_object(value: &Value) -> GraftResult<&Row> {
    value
        .as_object()
        .ok_or_else(|| GraftError::validation("expected an object"))
}

/// All id column values, present and non-null, or `None`.
fn id_values(info: &TableInfo, row: &Row) -> Option<Vec<Value>> {
    let mut values = Vec::with_capacity(info.id_columns.len());
    for column in &info.id_columns {
        match row.get(column) {
            Some(Value::Null) | None => return None,
            Some(value) => values.push(value.clone()),
        }
    }
    if values.is_empty() { None } else { Some(values) }
}

/// A node addressed purely by reference markers (`#ref` or `#dbRef`).
fn is_marker_node(schema: &Schema, row: &Row) -> bool {
    row.contains_key(schema.ref_prop.as_str()) || row.contains_key(schema.db_ref_prop.as_str())
}

/// Normalize a relation value into its child objects. Null means "no
/// children"; a bare object is the to-one (or single-element) shape.
fn normalize_children<'a>(value: &'a Value, path: &str) -> GraftResult<(Vec<&'a Row>, bool)> {
    match value {
        Value::Null => Ok((Vec::new(), false)),
        Value::Object(map) => Ok((vec![map], false)),
        Value::Array(items) => {
            let children = items
                .iter()
                .map(as_object)
                .collect::<GraftResult<Vec<_>>>()?;
            Ok((children, true))
        }
        _ => Err(GraftError::validation(format!(
            "relation '{path}' must be an object, an array or null"
        ))),
    }
}
