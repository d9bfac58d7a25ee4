//! Typed dependency edges and their resolution.
//!
//! A dependency is a directed "must exist before" relationship between two
//! nodes. Resolving one copies a value produced by the source node (a
//! generated key, or any referenced property) into the dependent node, and
//! advances the dependent's handled-needs counter.

use crate::error::{GraftError, GraftResult};
use crate::graph::node::{GraphNode, NodeId};
use serde_json::Value;

/// A step into a nested plain value inside a node's model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathStep {
    Key(String),
    Index(usize),
}

/// How a resolved value propagates across the edge.
#[derive(Debug, Clone)]
pub(crate) enum DependencyKind {
    /// The related row's key is copied into the owner's FK properties.
    /// Source: the related (child) node; target: the owner.
    BelongsToOne {
        owner_columns: Vec<String>,
        related_columns: Vec<String>,
    },
    /// The owner's key is copied into the child's FK properties.
    /// Source: the owner node; target: the child.
    HasMany {
        owner_columns: Vec<String>,
        related_columns: Vec<String>,
    },
    /// A `#ref{id.prop}` spanning a whole string value: replaced in place
    /// with the referenced property's typed value.
    ReplaceValue { path: Vec<PathStep>, prop: String },
    /// A `#ref{id.prop}` embedded in a longer string: the referenced value
    /// is spliced into the string, preserving surrounding text.
    InterpolateValue {
        path: Vec<PathStep>,
        prop: String,
        needle: String,
    },
}

/// A typed, directed edge. `node` is the other endpoint: for an entry in
/// `needs` it is the node waited on, for an entry in `is_needed_by` it is
/// the dependent node the resolution writes into.
#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub node: NodeId,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn belongs_to_one(
        node: NodeId,
        owner_columns: Vec<String>,
        related_columns: Vec<String>,
    ) -> Self {
        Self {
            node,
            kind: DependencyKind::BelongsToOne {
                owner_columns,
                related_columns,
            },
        }
    }

    pub fn has_many(node: NodeId, owner_columns: Vec<String>, related_columns: Vec<String>) -> Self {
        Self {
            node,
            kind: DependencyKind::HasMany {
                owner_columns,
                related_columns,
            },
        }
    }

    /// The mirrored edge for the other endpoint.
    pub fn inverse(&self, node: NodeId) -> Self {
        Self {
            node,
            kind: self.kind.clone(),
        }
    }
}

/// Resolve one `is_needed_by` edge of `source`: propagate the value into
/// the dependent node and advance its counter.
pub(crate) fn resolve(
    nodes: &mut [GraphNode],
    source: NodeId,
    dep: &Dependency,
) -> GraftResult<()> {
    propagate(nodes, source, dep)?;
    nodes[dep.node.index()].handled_needs += 1;
    Ok(())
}

/// Copy the value across the edge without touching the dependent's
/// handled-needs counter. Used when the source was never part of batching
/// (relate nodes, merged references) and no mirrored `needs` entry exists.
pub(crate) fn propagate(
    nodes: &mut [GraphNode],
    source: NodeId,
    dep: &Dependency,
) -> GraftResult<()> {
    match &dep.kind {
        DependencyKind::BelongsToOne {
            owner_columns,
            related_columns,
        } => {
            let values = read_columns(&nodes[source.index()], related_columns)?;
            let target = &mut nodes[dep.node.index()];
            for (column, value) in owner_columns.iter().zip(values) {
                target.model.insert(column.clone(), value);
            }
        }
        DependencyKind::HasMany {
            owner_columns,
            related_columns,
        } => {
            let values = read_columns(&nodes[source.index()], owner_columns)?;
            let target = &mut nodes[dep.node.index()];
            for (column, value) in related_columns.iter().zip(values) {
                target.model.insert(column.clone(), value);
            }
        }
        DependencyKind::ReplaceValue { path, prop } => {
            let value = read_prop(&nodes[source.index()], prop)?;
            let source_uid = nodes[source.index()].uid.clone();
            let target = &mut nodes[dep.node.index()];
            let slot = value_at_path(&mut target.model, path).ok_or_else(|| {
                GraftError::invalid_graph(format!(
                    "reference target path vanished while resolving #ref{{{source_uid}.{prop}}}"
                ))
            })?;
            *slot = value;
        }
        DependencyKind::InterpolateValue { path, prop, needle } => {
            let value = read_prop(&nodes[source.index()], prop)?;
            let text = interpolation_text(&value).ok_or_else(|| {
                GraftError::invalid_graph(format!(
                    "cannot interpolate non-scalar property '{prop}' into a string"
                ))
            })?;
            let target = &mut nodes[dep.node.index()];
            let slot = value_at_path(&mut target.model, path).ok_or_else(|| {
                GraftError::invalid_graph(format!(
                    "reference target path vanished while resolving '{needle}'"
                ))
            })?;
            match slot {
                Value::String(s) => *s = s.replace(needle.as_str(), &text),
                _ => {
                    return Err(GraftError::invalid_graph(format!(
                        "interpolation target for '{needle}' is no longer a string"
                    )));
                }
            }
        }
    }

    Ok(())
}

fn read_columns(node: &GraphNode, columns: &[String]) -> GraftResult<Vec<Value>> {
    columns
        .iter()
        .map(|column| {
            node.model.get(column).cloned().ok_or_else(|| {
                GraftError::invalid_graph(format!(
                    "row for table '{}' has no value for key column '{}' after insert",
                    node.table, column
                ))
            })
        })
        .collect()
}

/// Read a (possibly dotted) property from a node's model.
fn read_prop(node: &GraphNode, prop: &str) -> GraftResult<Value> {
    let mut current: &Value = &Value::Null;
    let mut first = true;
    for segment in prop.split('.') {
        current = if first {
            first = false;
            node.model.get(segment)
        } else {
            current.get(segment)
        }
        .ok_or_else(|| {
            GraftError::invalid_graph(format!(
                "referenced property '{}' not found on node '{}'",
                prop, node.uid
            ))
        })?;
    }
    Ok(current.clone())
}

fn value_at_path<'a>(
    model: &'a mut crate::schema::Row,
    path: &[PathStep],
) -> Option<&'a mut Value> {
    let (head, rest) = path.split_first()?;
    let PathStep::Key(key) = head else {
        return None;
    };
    let mut current = model.get_mut(key.as_str())?;
    for step in rest {
        current = match step {
            PathStep::Key(key) => current.get_mut(key.as_str())?,
            PathStep::Index(index) => current.get_mut(index)?,
        };
    }
    Some(current)
}

/// Textual form of a scalar used for string splicing.
fn interpolation_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}
