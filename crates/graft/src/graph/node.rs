//! Graph nodes and the arena they live in.
//!
//! Input graphs are self-referential (parent back-references, `#ref`
//! cross-links), so nodes are stored in an arena and every edge is a
//! [`NodeId`] index into it. Cycle detection, reference merging and
//! pointer rewriting are then plain index operations.

use crate::graph::dependency::Dependency;
use crate::schema::Row;
use serde_json::Value;

/// Arena index of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

/// A join-row descriptor rooted at its owner node.
#[derive(Debug, Clone)]
pub(crate) struct ManyToManyConnection {
    /// The related endpoint.
    pub node: NodeId,
    /// Index of the many-to-many relation in the owner table's relations.
    pub relation: usize,
    /// Source of extra join-table columns when the related endpoint was
    /// named through a `#ref` node carrying its own columns.
    pub ref_node: Option<NodeId>,
}

/// One logical row awaiting insertion or reconciliation.
#[derive(Debug)]
pub(crate) struct GraphNode {
    /// Graph-local unique token. Never persisted.
    pub uid: String,
    /// Destination table.
    pub table: String,
    /// Scalar/plain properties of the row. Declared relation subtrees are
    /// extracted into child nodes during the build walk, so any nested
    /// structure remaining here is plain data.
    pub model: Row,
    pub parent: Option<NodeId>,
    /// Index of the relation (in the parent table's relation list)
    /// connecting this node to its parent.
    pub relation_from_parent: Option<usize>,
    /// Position key within the whole input graph, shared with the upsert
    /// classifier so both walks address the same instance.
    pub locator: String,
    /// Whether the input value arrived wrapped in an array (restored on
    /// reassembly).
    pub in_array: bool,
    /// Child nodes in creation order, for reassembly.
    pub children: Vec<NodeId>,

    /// Outgoing edges that must resolve before this node is insertable.
    pub needs: Vec<Dependency>,
    /// Edges this node resolves once it has been inserted.
    pub is_needed_by: Vec<Dependency>,
    pub m2m: Vec<ManyToManyConnection>,

    pub handled: bool,
    pub handled_needs: usize,

    /// `#ref` node: merged into the canonical `#id` node before execution.
    pub ref_uid: Option<String>,
    pub merged_into: Option<NodeId>,
    /// `#dbRef` value: this row already exists in the database.
    pub db_ref: Option<Value>,

    // Transient cycle-detection flags, cleared after every check.
    pub visited: bool,
    pub on_stack: bool,
}

impl GraphNode {
    pub fn new(uid: String, table: String, model: Row) -> Self {
        Self {
            uid,
            table,
            model,
            parent: None,
            relation_from_parent: None,
            locator: String::new(),
            in_array: false,
            children: Vec::new(),
            needs: Vec::new(),
            is_needed_by: Vec::new(),
            m2m: Vec::new(),
            handled: false,
            handled_needs: 0,
            ref_uid: None,
            merged_into: None,
            db_ref: None,
            visited: false,
            on_stack: false,
        }
    }

    /// A node is ready for insertion once every need has resolved and it
    /// has not been committed yet.
    pub fn is_ready(&self) -> bool {
        !self.handled && self.handled_needs == self.needs.len()
    }

    pub fn is_reference(&self) -> bool {
        self.ref_uid.is_some()
    }

    pub fn is_db_ref(&self) -> bool {
        self.db_ref.is_some()
    }
}
