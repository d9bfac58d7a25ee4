//! Relation metadata consumed from the modeling layer.
//!
//! The engine does not define models. The caller registers, per table, the
//! id columns and the declared relations; [`Schema`] is the lookup surface
//! the graph builder and the upsert layer read from.
//!
//! # Example
//! ```ignore
//! use graft::{JoinTable, Relation, Schema, TableInfo};
//!
//! let schema = Schema::new()
//!     .with_table(
//!         TableInfo::new("persons")
//!             .with_id("id")
//!             .with_relation(Relation::belongs_to_one("parent", ["parent_id"], "persons", ["id"]))
//!             .with_relation(Relation::has_many("children", ["id"], "persons", ["parent_id"]))
//!             .with_relation(Relation::many_to_many(
//!                 "movies",
//!                 ["id"],
//!                 "movies",
//!                 ["id"],
//!                 JoinTable::new("persons_movies", ["person_id"], ["movie_id"]),
//!             )),
//!     );
//! ```

use crate::error::{GraftError, GraftResult};
use serde::Serialize;
use std::collections::HashMap;

/// A single table row as the engine sees it: a JSON object.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Property marking a node as a named reference target.
pub const UID_PROP: &str = "#id";
/// Property declaring that a node *is* the node with the given `#id`.
pub const REF_PROP: &str = "#ref";
/// Property marking a node as an already-persisted row to relate to.
pub const DB_REF_PROP: &str = "#dbRef";

/// The kind of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelationKind {
    /// The owner table carries the foreign key (`child.parent_id -> parent.id`).
    BelongsToOne,
    /// The related table carries the foreign key back to the owner.
    /// Covers has-one as the single-element case.
    HasMany,
    /// Both sides are connected through a join table.
    ManyToMany,
}

impl RelationKind {
    /// Whether this relation imposes an insertion-order edge between the
    /// two endpoints. Many-to-many rows are connected only through join
    /// rows, which are deferred to a final phase, so neither endpoint
    /// orders the other.
    pub fn creates_ordering_edge(self) -> bool {
        !matches!(self, Self::ManyToMany)
    }
}

/// Join-table metadata for a many-to-many relation.
#[derive(Debug, Clone)]
pub struct JoinTable {
    /// Join table name.
    pub table: String,
    /// Join-table columns referencing the owner side.
    pub owner_columns: Vec<String>,
    /// Join-table columns referencing the related side.
    pub related_columns: Vec<String>,
    /// Extra join-table columns sourced from the related node (or its
    /// reference node) when present.
    pub extra_columns: Vec<String>,
}

impl JoinTable {
    pub fn new<S: Into<String>>(
        table: impl Into<String>,
        owner_columns: impl IntoIterator<Item = S>,
        related_columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            table: table.into(),
            owner_columns: owner_columns.into_iter().map(Into::into).collect(),
            related_columns: related_columns.into_iter().map(Into::into).collect(),
            extra_columns: Vec::new(),
        }
    }

    /// Declare extra join-table columns.
    pub fn with_extra<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.extra_columns = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// One declared relation on a table.
///
/// `owner_columns` live on the declaring table, `related_columns` on the
/// related table. Which side is the foreign key depends on [`RelationKind`]:
/// for `BelongsToOne` the owner columns are the FK, for `HasMany` the
/// related columns are, and for `ManyToMany` both sides are primary keys
/// referenced from the join table.
#[derive(Debug, Clone)]
pub struct Relation {
    pub name: String,
    pub kind: RelationKind,
    pub owner_columns: Vec<String>,
    pub related_table: String,
    pub related_columns: Vec<String>,
    pub join: Option<JoinTable>,
}

impl Relation {
    pub fn belongs_to_one<S: Into<String>>(
        name: impl Into<String>,
        owner_columns: impl IntoIterator<Item = S>,
        related_table: impl Into<String>,
        related_columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::BelongsToOne,
            owner_columns,
            related_table,
            related_columns,
            None,
        )
    }

    pub fn has_many<S: Into<String>>(
        name: impl Into<String>,
        owner_columns: impl IntoIterator<Item = S>,
        related_table: impl Into<String>,
        related_columns: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(
            name,
            RelationKind::HasMany,
            owner_columns,
            related_table,
            related_columns,
            None,
        )
    }

    pub fn many_to_many<S: Into<String>>(
        name: impl Into<String>,
        owner_columns: impl IntoIterator<Item = S>,
        related_table: impl Into<String>,
        related_columns: impl IntoIterator<Item = S>,
        join: JoinTable,
    ) -> Self {
        Self::new(
            name,
            RelationKind::ManyToMany,
            owner_columns,
            related_table,
            related_columns,
            Some(join),
        )
    }

    fn new<S: Into<String>>(
        name: impl Into<String>,
        kind: RelationKind,
        owner_columns: impl IntoIterator<Item = S>,
        related_table: impl Into<String>,
        related_columns: impl IntoIterator<Item = S>,
        join: Option<JoinTable>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            owner_columns: owner_columns.into_iter().map(Into::into).collect(),
            related_table: related_table.into(),
            related_columns: related_columns.into_iter().map(Into::into).collect(),
            join,
        }
    }
}

/// Hook invoked with each table batch right before it is submitted.
pub type BeforeInsert = fn(&mut Vec<Row>);

/// Metadata for one table.
#[derive(Debug, Clone)]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Primary id column(s).
    pub id_columns: Vec<String>,
    /// Declared relations, in declaration order.
    pub relations: Vec<Relation>,
    /// Optional before-insert hook for rows destined for this table.
    pub before_insert: Option<BeforeInsert>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_columns: Vec::new(),
            relations: Vec::new(),
            before_insert: None,
        }
    }

    /// Set a single-column primary id.
    pub fn with_id(mut self, column: impl Into<String>) -> Self {
        self.id_columns = vec![column.into()];
        self
    }

    /// Set a composite primary id.
    pub fn with_composite_id<S: Into<String>>(
        mut self,
        columns: impl IntoIterator<Item = S>,
    ) -> Self {
        self.id_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Add a declared relation.
    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Register a before-insert hook.
    pub fn with_before_insert(mut self, hook: BeforeInsert) -> Self {
        self.before_insert = Some(hook);
        self
    }

    /// Look up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// Registry of table metadata.
///
/// The uid/ref/db-ref property names default to [`UID_PROP`], [`REF_PROP`]
/// and [`DB_REF_PROP`] and can be overridden per schema.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: HashMap<String, TableInfo>,
    pub uid_prop: String,
    pub ref_prop: String,
    pub db_ref_prop: String,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            uid_prop: UID_PROP.to_string(),
            ref_prop: REF_PROP.to_string(),
            db_ref_prop: DB_REF_PROP.to_string(),
        }
    }
}

impl Schema {
    /// Create a new empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table.
    pub fn with_table(mut self, table: TableInfo) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Register a table (non-consuming form).
    pub fn add_table(&mut self, table: TableInfo) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Look up a table, erroring on unknown names.
    pub fn table(&self, name: &str) -> GraftResult<&TableInfo> {
        self.tables
            .get(name)
            .ok_or_else(|| GraftError::validation(format!("unknown table '{name}'")))
    }

    /// Look up a table without erroring (join tables need not be registered).
    pub fn table_opt(&self, name: &str) -> Option<&TableInfo> {
        self.tables.get(name)
    }

    /// Whether this property name is one of the engine's marker properties.
    pub fn is_marker_prop(&self, name: &str) -> bool {
        name == self.uid_prop || name == self.ref_prop || name == self.db_ref_prop
    }
}
