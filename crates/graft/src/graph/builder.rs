//! Dependency graph construction.
//!
//! [`DependencyGraph::build`] walks a nested object graph and produces an
//! arena of nodes with resolved edges: ordering dependencies derived from
//! the relation kinds, merged `#ref` reference nodes, and textual
//! `#ref{id.prop}` value dependencies. Construction is deterministic,
//! synchronous and performs no I/O; every structural error is raised here,
//! before anything is written.

use crate::error::{GraftError, GraftResult};
use crate::graph::dependency::{self, Dependency, DependencyKind, PathStep};
use crate::graph::node::{GraphNode, ManyToManyConnection, NodeId};
use crate::options::{GraphOptions, join_path};
use crate::schema::{Relation, RelationKind, Schema};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

static REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#ref\{([^{}]+)\}").expect("valid reference regex"));
static REF_WHOLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#ref\{([^{}]+)\}$").expect("valid reference regex"));

/// The built graph: an arena of nodes plus the uid lookup map mirroring it.
#[derive(Debug)]
pub(crate) struct DependencyGraph {
    pub schema: Schema,
    pub nodes: Vec<GraphNode>,
    pub nodes_by_uid: HashMap<String, NodeId>,
    pub roots: Vec<NodeId>,
}

impl DependencyGraph {
    /// Walk `root_models` and build the full node set.
    pub fn build(
        schema: &Schema,
        root_table: &str,
        root_models: Vec<Value>,
        options: &GraphOptions,
    ) -> GraftResult<Self> {
        schema.table(root_table)?;

        let mut builder = Builder {
            schema,
            options,
            nodes: Vec::new(),
            nodes_by_uid: HashMap::new(),
            uid_seq: 0,
        };

        let mut roots = Vec::new();
        for (index, model) in root_models.into_iter().enumerate() {
            let locator = index.to_string();
            roots.push(builder.visit(root_table, model, None, None, "", locator, false)?);
        }

        let mut graph = Self {
            schema: schema.clone(),
            nodes: builder.nodes,
            nodes_by_uid: builder.nodes_by_uid,
            roots,
        };
        graph.resolve_references()?;
        graph.find_value_dependencies()?;
        Ok(graph)
    }

    pub fn relation_of(&self, id: NodeId) -> Option<&Relation> {
        let node = &self.nodes[id.index()];
        let parent = &self.nodes[node.parent?.index()];
        self.schema
            .table_opt(&parent.table)?
            .relations
            .get(node.relation_from_parent?)
    }

    /// All unhandled nodes whose needs have fully resolved.
    pub fn ready_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_ready())
            .map(|(index, _)| NodeId(index))
            .collect()
    }

    /// Mark a node handled outside of batching and resolve every edge it
    /// owes, so dependents observe its (caller-provided) key values.
    pub fn mark_handled_resolving(&mut self, id: NodeId) -> GraftResult<()> {
        self.nodes[id.index()].handled = true;
        let deps = std::mem::take(&mut self.nodes[id.index()].is_needed_by);
        for dep in deps {
            dependency::resolve(&mut self.nodes, id, &dep)?;
        }
        Ok(())
    }

    /// Merge every `#ref` node into its canonical `#id` node and rewrite
    /// all edge and connection pointers across the arena.
    fn resolve_references(&mut self) -> GraftResult<()> {
        let mut canonical: Vec<NodeId> = (0..self.nodes.len()).map(NodeId).collect();
        for index in 0..self.nodes.len() {
            let Some(ref_uid) = self.nodes[index].ref_uid.clone() else {
                continue;
            };
            let target = *self.nodes_by_uid.get(&ref_uid).ok_or_else(|| {
                GraftError::invalid_graph(format!("could not resolve reference '#ref: {ref_uid}'"))
            })?;
            if target.index() == index || self.nodes[target.index()].is_reference() {
                return Err(GraftError::invalid_graph(format!(
                    "reference '#ref: {ref_uid}' points to another reference node"
                )));
            }
            if self.nodes[index].table != self.nodes[target.index()].table {
                return Err(GraftError::invalid_graph(format!(
                    "reference '#ref: {ref_uid}' crosses tables ('{}' vs '{}')",
                    self.nodes[index].table,
                    self.nodes[target.index()].table
                )));
            }
            self.nodes[index].merged_into = Some(target);
            canonical[index] = target;
        }

        for node in &mut self.nodes {
            for dep in node.needs.iter_mut().chain(node.is_needed_by.iter_mut()) {
                dep.node = canonical[dep.node.index()];
            }
            for conn in &mut node.m2m {
                let mapped = canonical[conn.node.index()];
                if mapped != conn.node {
                    // The reference node keeps supplying extra join columns.
                    conn.ref_node = Some(conn.node);
                    conn.node = mapped;
                }
            }
        }

        for index in 0..self.nodes.len() {
            let Some(target) = self.nodes[index].merged_into else {
                continue;
            };
            let needs = std::mem::take(&mut self.nodes[index].needs);
            let is_needed_by = std::mem::take(&mut self.nodes[index].is_needed_by);
            let handled_needs = self.nodes[index].handled_needs;
            let target_node = &mut self.nodes[target.index()];
            target_node.needs.extend(needs);
            target_node.is_needed_by.extend(is_needed_by);
            target_node.handled_needs += handled_needs;
            self.nodes[index].handled_needs = 0;
            self.nodes[index].handled = true;
        }

        // A merge can land pending edges on a node that is already handled
        // (a `#dbRef` target). Resolve them now; that node never enters
        // batching, so nothing else will.
        for index in 0..self.nodes.len() {
            if self.nodes[index].handled && !self.nodes[index].is_needed_by.is_empty() {
                self.mark_handled_resolving(NodeId(index))?;
            }
        }
        Ok(())
    }

    /// Scan every string-valued property for `#ref{id}` / `#ref{id.prop}`
    /// and create the matching value dependencies.
    fn find_value_dependencies(&mut self) -> GraftResult<()> {
        for index in 0..self.nodes.len() {
            if self.nodes[index].is_reference() {
                continue;
            }

            let mut matches = Vec::new();
            let mut path = Vec::new();
            for (key, value) in &self.nodes[index].model {
                if self.schema.is_marker_prop(key) {
                    continue;
                }
                path.push(PathStep::Key(key.clone()));
                scan_value(value, &mut path, &mut matches);
                path.pop();
            }

            for (value_path, needle, whole) in matches {
                let (uid, prop) = self.parse_ref_spec(&needle)?;
                let target = *self.nodes_by_uid.get(&uid).ok_or_else(|| {
                    GraftError::invalid_graph(format!(
                        "could not resolve value reference '{needle}'"
                    ))
                })?;
                let target = self.nodes[target.index()].merged_into.unwrap_or(target);

                let kind = if whole {
                    DependencyKind::ReplaceValue {
                        path: value_path,
                        prop,
                    }
                } else {
                    DependencyKind::InterpolateValue {
                        path: value_path,
                        prop,
                        needle: needle.clone(),
                    }
                };
                let dep = Dependency {
                    node: NodeId(index),
                    kind,
                };

                if self.nodes[target.index()].handled {
                    // The target never enters batching (relate node); its
                    // key values are already present.
                    dependency::propagate(&mut self.nodes, target, &dep)?;
                } else {
                    self.nodes[index].needs.push(dep.inverse(target));
                    self.nodes[target.index()].is_needed_by.push(dep);
                }
            }
        }
        Ok(())
    }

    /// Split a `#ref{a.b}` body into uid and referenced property. A
    /// property-less `#ref{a}` refers to the target table's id column.
    fn parse_ref_spec(&self, needle: &str) -> GraftResult<(String, String)> {
        let body = REF_RE
            .captures(needle)
            .and_then(|captures| captures.get(1))
            .ok_or_else(|| {
                GraftError::invalid_graph(format!("malformed value reference '{needle}'"))
            })?
            .as_str();

        match body.split_once('.') {
            Some((uid, prop)) if !uid.is_empty() && !prop.is_empty() => {
                Ok((uid.to_string(), prop.to_string()))
            }
            Some(_) => Err(GraftError::invalid_graph(format!(
                "malformed value reference '{needle}'"
            ))),
            None => {
                let target = *self.nodes_by_uid.get(body).ok_or_else(|| {
                    GraftError::invalid_graph(format!(
                        "could not resolve value reference '{needle}'"
                    ))
                })?;
                let table = self.schema.table(&self.nodes[target.index()].table)?;
                match table.id_columns.as_slice() {
                    [id] => Ok((body.to_string(), id.clone())),
                    _ => Err(GraftError::invalid_graph(format!(
                        "property-less reference '{needle}' against a composite-id table"
                    ))),
                }
            }
        }
    }

    /// Three-color DFS over `needs` edges, skipping handled nodes. The
    /// transient flags are cleared afterwards so the same node set can be
    /// traversed again by the inserter.
    pub fn has_cyclic_references(&mut self) -> bool {
        let mut cyclic = false;
        for index in 0..self.nodes.len() {
            let skip = self.nodes[index].handled || self.nodes[index].visited;
            if !skip && self.dfs(NodeId(index)) {
                cyclic = true;
                break;
            }
        }
        for node in &mut self.nodes {
            node.visited = false;
            node.on_stack = false;
        }
        cyclic
    }

    pub fn check_for_cyclic_references(&mut self) -> GraftResult<()> {
        if self.has_cyclic_references() {
            return Err(GraftError::invalid_graph(
                "the object graph contains cyclic references",
            ));
        }
        Ok(())
    }

    fn dfs(&mut self, id: NodeId) -> bool {
        let node = &self.nodes[id.index()];
        if node.handled {
            return false;
        }
        if node.on_stack {
            return true;
        }
        if node.visited {
            return false;
        }
        self.nodes[id.index()].visited = true;
        self.nodes[id.index()].on_stack = true;

        let needs: Vec<NodeId> = self.nodes[id.index()]
            .needs
            .iter()
            .map(|dep| dep.node)
            .collect();
        for next in needs {
            if self.dfs(next) {
                return true;
            }
        }

        self.nodes[id.index()].on_stack = false;
        false
    }

    /// Copy canonical values onto reference aliases, strip bookkeeping
    /// properties, and reassemble the root models in their input shape.
    pub fn into_models(mut self) -> Vec<Value> {
        for index in 0..self.nodes.len() {
            let Some(target) = self.nodes[index].merged_into else {
                continue;
            };
            let canonical = self.nodes[target.index()].model.clone();
            let alias = &mut self.nodes[index].model;
            for (key, value) in canonical {
                alias.insert(key, value);
            }
        }

        let markers = [
            self.schema.uid_prop.clone(),
            self.schema.ref_prop.clone(),
            self.schema.db_ref_prop.clone(),
        ];
        for node in &mut self.nodes {
            for marker in &markers {
                node.model.remove(marker);
            }
        }

        let roots = std::mem::take(&mut self.roots);
        roots.into_iter().map(|root| self.assemble(root)).collect()
    }

    fn assemble(&mut self, id: NodeId) -> Value {
        let children = std::mem::take(&mut self.nodes[id.index()].children);
        let mut model = std::mem::take(&mut self.nodes[id.index()].model);

        for child in children {
            let Some(relation) = self.relation_of(child) else {
                continue;
            };
            let name = relation.name.clone();
            let in_array = self.nodes[child.index()].in_array;
            let value = self.assemble(child);
            if in_array {
                match model
                    .entry(name)
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(items) => items.push(value),
                    other => *other = Value::Array(vec![value]),
                }
            } else {
                model.insert(name, value);
            }
        }

        Value::Object(model)
    }
}

struct Builder<'a> {
    schema: &'a Schema,
    options: &'a GraphOptions,
    nodes: Vec<GraphNode>,
    nodes_by_uid: HashMap<String, NodeId>,
    uid_seq: usize,
}

impl Builder<'_> {
    fn visit(
        &mut self,
        table: &str,
        model: Value,
        parent: Option<NodeId>,
        relation: Option<usize>,
        path: &str,
        locator: String,
        in_array: bool,
    ) -> GraftResult<NodeId> {
        let mut map = match model {
            Value::Object(map) => map,
            other => {
                return Err(GraftError::invalid_graph(format!(
                    "expected an object for table '{table}' at '{locator}', got {}",
                    value_kind(&other)
                )));
            }
        };

        let table_info = self.schema.table(table)?;

        let ref_uid = match map.get(self.schema.ref_prop.as_str()) {
            None => None,
            Some(Value::String(uid)) => Some(uid.clone()),
            Some(other) => {
                return Err(GraftError::invalid_graph(format!(
                    "'{}' must be a string, got {}",
                    self.schema.ref_prop,
                    value_kind(other)
                )));
            }
        };
        let db_ref = map.get(self.schema.db_ref_prop.as_str()).cloned();
        if ref_uid.is_some() && db_ref.is_some() {
            return Err(GraftError::invalid_graph(format!(
                "node at '{locator}' cannot carry both '{}' and '{}'",
                self.schema.ref_prop, self.schema.db_ref_prop
            )));
        }

        let uid = match map.get(self.schema.uid_prop.as_str()) {
            None => {
                self.uid_seq += 1;
                format!("__graft_uid({})", self.uid_seq)
            }
            Some(Value::String(uid)) => uid.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(GraftError::invalid_graph(format!(
                    "'{}' must be a string or number, got {}",
                    self.schema.uid_prop,
                    value_kind(other)
                )));
            }
        };

        // Pull declared relation subtrees out of the map before the node
        // is created; whatever remains is the row itself.
        let mut subtrees: Vec<(usize, Value)> = Vec::new();
        for (rel_index, rel) in table_info.relations.iter().enumerate() {
            if let Some(value) = map.remove(rel.name.as_str()) {
                if ref_uid.is_some() {
                    return Err(GraftError::invalid_graph(format!(
                        "reference node '#ref: {}' at '{locator}' must not contain relations",
                        ref_uid.as_deref().unwrap_or_default()
                    )));
                }
                if !value.is_null() {
                    subtrees.push((rel_index, value));
                }
            }
        }

        let mut node = GraphNode::new(uid.clone(), table.to_string(), map);
        node.parent = parent;
        node.relation_from_parent = relation;
        node.locator = locator.clone();
        node.in_array = in_array;
        node.ref_uid = ref_uid;
        node.db_ref = db_ref.clone();

        let id = NodeId(self.nodes.len());
        if self.nodes_by_uid.insert(uid.clone(), id).is_some() {
            return Err(GraftError::invalid_graph(format!(
                "duplicate '{}' value '{uid}'",
                self.schema.uid_prop
            )));
        }
        self.nodes.push(node);

        if let Some(parent_id) = parent {
            self.nodes[parent_id.index()].children.push(id);
        }

        if db_ref.is_some() {
            self.apply_db_ref(id, parent, relation)?;
        }
        self.connect_to_parent(id, parent, relation, path)?;

        for (rel_index, value) in subtrees {
            let rel = &self.schema.table(table)?.relations[rel_index];
            let rel_name = rel.name.clone();
            let rel_kind = rel.kind;
            let related_table = rel.related_table.clone();
            let child_path = join_path(path, &rel_name);
            if !self.options.is_allowed(&child_path) {
                return Err(GraftError::unallowed_relation(child_path));
            }

            match (rel_kind, value) {
                (RelationKind::BelongsToOne, Value::Array(_)) => {
                    return Err(GraftError::invalid_graph(format!(
                        "expected an object for to-one relation '{child_path}', got an array"
                    )));
                }
                (RelationKind::BelongsToOne, value) => {
                    self.visit(
                        &related_table,
                        value,
                        Some(id),
                        Some(rel_index),
                        &child_path,
                        format!("{locator}.{rel_name}"),
                        false,
                    )?;
                }
                (_, Value::Array(items)) => {
                    for (item_index, item) in items.into_iter().enumerate() {
                        self.visit(
                            &related_table,
                            item,
                            Some(id),
                            Some(rel_index),
                            &child_path,
                            format!("{locator}.{rel_name}[{item_index}]"),
                            true,
                        )?;
                    }
                }
                (_, value) => {
                    self.visit(
                        &related_table,
                        value,
                        Some(id),
                        Some(rel_index),
                        &child_path,
                        format!("{locator}.{rel_name}"),
                        false,
                    )?;
                }
            }
        }

        Ok(id)
    }

    /// A `#dbRef` node already exists in the database: materialize its key
    /// columns from the reference value and mark it handled so it never
    /// enters batching.
    fn apply_db_ref(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        relation: Option<usize>,
    ) -> GraftResult<()> {
        let columns: Vec<String> = match (parent, relation) {
            (Some(parent_id), Some(rel_index)) => {
                let parent_table = self.nodes[parent_id.index()].table.clone();
                self.schema.table(&parent_table)?.relations[rel_index]
                    .related_columns
                    .clone()
            }
            _ => {
                let table = self.nodes[id.index()].table.clone();
                self.schema.table(&table)?.id_columns.clone()
            }
        };

        let db_ref = self.nodes[id.index()].db_ref.clone().unwrap_or(Value::Null);
        let values: Vec<Value> = match db_ref {
            Value::Array(values) => values,
            value => vec![value],
        };
        if values.len() != columns.len() {
            return Err(GraftError::invalid_graph(format!(
                "'{}' value has {} element(s), expected {}",
                self.schema.db_ref_prop,
                values.len(),
                columns.len()
            )));
        }

        let node = &mut self.nodes[id.index()];
        for (column, value) in columns.iter().zip(values) {
            node.model.insert(column.clone(), value);
        }
        node.handled = true;
        Ok(())
    }

    /// Create the two-sided ordering edges (or the deferred many-to-many
    /// connection) between a node and its parent.
    fn connect_to_parent(
        &mut self,
        id: NodeId,
        parent: Option<NodeId>,
        relation: Option<usize>,
        path: &str,
    ) -> GraftResult<()> {
        let (Some(parent_id), Some(rel_index)) = (parent, relation) else {
            return Ok(());
        };
        let parent_table = self.nodes[parent_id.index()].table.clone();
        let rel = self.schema.table(&parent_table)?.relations[rel_index].clone();
        let handled = self.nodes[id.index()].handled;

        match rel.kind {
            RelationKind::BelongsToOne => {
                let dep_on_child =
                    Dependency::belongs_to_one(id, rel.owner_columns, rel.related_columns);
                if handled {
                    // Relate node: the related key is already known, so the
                    // parent's FK resolves immediately.
                    dependency::propagate(&mut self.nodes, id, &dep_on_child.inverse(parent_id))?;
                } else {
                    self.nodes[id.index()]
                        .is_needed_by
                        .push(dep_on_child.inverse(parent_id));
                    self.nodes[parent_id.index()].needs.push(dep_on_child);
                }
            }
            RelationKind::HasMany => {
                if handled {
                    return Err(GraftError::Relate(format!(
                        "cannot insert a '{}' reference through the to-many relation '{path}'; \
                         relating an existing row on the to-many side requires an update",
                        self.schema.db_ref_prop
                    )));
                }
                let dep_on_parent =
                    Dependency::has_many(parent_id, rel.owner_columns, rel.related_columns);
                self.nodes[parent_id.index()]
                    .is_needed_by
                    .push(dep_on_parent.inverse(id));
                self.nodes[id.index()].needs.push(dep_on_parent);
            }
            RelationKind::ManyToMany => {
                // No ordering edge; the join row is deferred to the final
                // phase once both endpoints are handled.
                self.nodes[parent_id.index()].m2m.push(ManyToManyConnection {
                    node: id,
                    relation: rel_index,
                    ref_node: None,
                });
            }
        }
        Ok(())
    }
}

/// Collect `#ref{...}` matches from a value, recursing through nested
/// plain structures. Relation subtrees were already extracted into child
/// nodes, so everything reachable here is row data.
fn scan_value(
    value: &Value,
    path: &mut Vec<PathStep>,
    out: &mut Vec<(Vec<PathStep>, String, bool)>,
) {
    match value {
        Value::String(text) => {
            if REF_WHOLE_RE.is_match(text) {
                out.push((path.clone(), text.clone(), true));
            } else {
                let mut seen = HashSet::new();
                for found in REF_RE.find_iter(text) {
                    if seen.insert(found.as_str()) {
                        out.push((path.clone(), found.as_str().to_string(), false));
                    }
                }
            }
        }
        Value::Object(map) => {
            for (key, nested) in map {
                path.push(PathStep::Key(key.clone()));
                scan_value(nested, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                path.push(PathStep::Index(index));
                scan_value(nested, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JoinTable, TableInfo};
    use serde_json::json;

    fn person_schema() -> Schema {
        Schema::new()
            .with_table(
                TableInfo::new("persons")
                    .with_id("id")
                    .with_relation(Relation::belongs_to_one(
                        "parent",
                        ["parent_id"],
                        "persons",
                        ["id"],
                    ))
                    .with_relation(Relation::has_many(
                        "children",
                        ["id"],
                        "persons",
                        ["parent_id"],
                    ))
                    .with_relation(Relation::many_to_many(
                        "movies",
                        ["id"],
                        "movies",
                        ["id"],
                        JoinTable::new("persons_movies", ["person_id"], ["movie_id"]),
                    )),
            )
            .with_table(
                TableInfo::new("movies")
                    .with_id("id")
                    .with_relation(Relation::many_to_many(
                        "actors",
                        ["id"],
                        "persons",
                        ["id"],
                        JoinTable::new("persons_movies", ["movie_id"], ["person_id"]),
                    )),
            )
    }

    fn build(models: Vec<Value>) -> GraftResult<DependencyGraph> {
        DependencyGraph::build(&person_schema(), "persons", models, &GraphOptions::default())
    }

    #[test]
    fn belongs_to_one_edges() {
        let graph = build(vec![json!({"name": "child", "parent": {"name": "parent"}})]).unwrap();

        assert_eq!(graph.nodes.len(), 2);
        let child = &graph.nodes[0];
        let parent = &graph.nodes[1];
        // The referencing node waits for its target.
        assert_eq!(child.needs.len(), 1);
        assert_eq!(parent.is_needed_by.len(), 1);
        assert!(parent.is_ready());
        assert!(!child.is_ready());
    }

    #[test]
    fn has_many_edges() {
        let graph =
            build(vec![json!({"name": "p1", "children": [{"name": "c1"}, {"name": "c2"}]})])
                .unwrap();

        assert_eq!(graph.nodes.len(), 3);
        let owner = &graph.nodes[0];
        assert_eq!(owner.is_needed_by.len(), 2);
        assert!(owner.is_ready());
        assert!(!graph.nodes[1].is_ready());
        assert!(!graph.nodes[2].is_ready());
    }

    #[test]
    fn many_to_many_creates_no_ordering_edge() {
        let graph =
            build(vec![json!({"name": "a", "movies": [{"name": "m1"}, {"name": "m2"}]})]).unwrap();

        assert!(graph.nodes.iter().all(|node| node.needs.is_empty()));
        assert_eq!(graph.nodes[0].m2m.len(), 2);
    }

    #[test]
    fn reference_merges_into_canonical_node() {
        let graph = build(vec![json!({
            "#id": "a",
            "name": "a1",
            "movies": [{"#id": "m", "name": "m1", "actors": [{"#ref": "a"}]}]
        })])
        .unwrap();

        assert_eq!(graph.nodes.len(), 3);
        let reference = &graph.nodes[2];
        assert!(reference.handled);
        assert_eq!(reference.merged_into, Some(NodeId(0)));
        // The movie's actor connection now points at the canonical person.
        let movie = &graph.nodes[1];
        assert_eq!(movie.m2m.len(), 1);
        assert_eq!(movie.m2m[0].node, NodeId(0));
        assert_eq!(movie.m2m[0].ref_node, Some(NodeId(2)));
    }

    #[test]
    fn reference_to_a_db_ref_node_resolves_its_dependents() {
        let graph = build(vec![
            json!({"#id": "p", "#dbRef": 42}),
            json!({"name": "child", "parent": {"#ref": "p"}}),
        ])
        .unwrap();

        // Node 0 is the existing row, node 1 the child, node 2 the alias.
        // Merging the alias must not leave the child waiting on a node
        // that will never be inserted.
        let child = &graph.nodes[1];
        assert!(child.is_ready());
        assert_eq!(child.model["parent_id"], json!(42));
    }

    #[test]
    fn unresolvable_reference_fails() {
        let err = build(vec![json!({"name": "a", "movies": [{"#ref": "nope"}]})]).unwrap_err();
        assert!(err.is_invalid_graph());
    }

    #[test]
    fn duplicate_uid_fails() {
        let err = build(vec![json!({
            "#id": "a",
            "children": [{"#id": "a", "name": "dup"}]
        })])
        .unwrap_err();
        assert!(err.is_invalid_graph());
    }

    #[test]
    fn non_object_model_fails() {
        let err = build(vec![json!({"name": "p", "children": ["not a row"]})]).unwrap_err();
        assert!(err.is_invalid_graph());
    }

    #[test]
    fn db_ref_through_to_many_is_a_hard_error() {
        let err = build(vec![json!({"name": "p", "children": [{"#dbRef": 17}]})]).unwrap_err();
        assert!(matches!(err, GraftError::Relate(_)));
    }

    #[test]
    fn db_ref_through_belongs_to_resolves_immediately() {
        let graph = build(vec![json!({"name": "child", "parent": {"#dbRef": 42}})]).unwrap();

        let child = &graph.nodes[0];
        let target = &graph.nodes[1];
        assert!(target.handled);
        assert_eq!(child.model["parent_id"], json!(42));
        assert!(child.is_ready());
    }

    #[test]
    fn unallowed_relation_is_rejected() {
        let options = GraphOptions::new().allow(|path| path == "children");
        let err = DependencyGraph::build(
            &person_schema(),
            "persons",
            vec![json!({"name": "a", "movies": [{"name": "m"}]})],
            &options,
        )
        .unwrap_err();
        assert!(err.is_unallowed_relation());
    }

    #[test]
    fn value_reference_creates_dependency() {
        let graph = build(vec![json!({
            "#id": "a",
            "name": "a1",
            "children": [{"name": "child of #ref{a.name}"}]
        })])
        .unwrap();

        let child = &graph.nodes[1];
        // One structural need (has-many owner) plus one value need.
        assert_eq!(child.needs.len(), 2);
        assert_eq!(graph.nodes[0].is_needed_by.len(), 2);
    }

    #[test]
    fn acyclic_graph_has_no_cycles_and_flags_reset() {
        let mut graph =
            build(vec![json!({"name": "p", "children": [{"name": "c"}]})]).unwrap();
        assert!(!graph.has_cyclic_references());
        assert!(
            graph
                .nodes
                .iter()
                .all(|node| !node.visited && !node.on_stack)
        );
        // Re-runnable on the same node set.
        assert!(!graph.has_cyclic_references());
    }

    #[test]
    fn value_reference_cycle_is_detected() {
        let mut graph = build(vec![json!({
            "#id": "a",
            "name": "#ref{b.name}",
            "children": [{"#id": "b", "name": "#ref{a.name}"}]
        })])
        .unwrap();
        assert!(graph.has_cyclic_references());
    }

    #[test]
    fn self_reference_fails() {
        let err = build(vec![json!({"#id": "a", "#ref": "a"})]).unwrap_err();
        assert!(err.is_invalid_graph());
    }

    #[test]
    fn into_models_restores_shape_and_strips_markers() {
        let graph = build(vec![json!({
            "#id": "a",
            "name": "a1",
            "children": [{"name": "c1"}, {"name": "c2"}],
            "parent": {"name": "p"}
        })])
        .unwrap();

        let models = graph.into_models();
        assert_eq!(models.len(), 1);
        let root = models[0].as_object().unwrap();
        assert!(!root.contains_key("#id"));
        assert_eq!(root["name"], json!("a1"));
        assert_eq!(root["children"].as_array().unwrap().len(), 2);
        assert_eq!(root["parent"]["name"], json!("p"));
    }
}
