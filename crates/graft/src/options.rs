//! Per-call options and engine configuration.
//!
//! Relation paths are dot-joined relation names from the root, e.g.
//! `"movies.actors"`. The path mini-language itself is not parsed here;
//! allow-lists are consumed as an opaque predicate.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Scope of a boolean-or-path-list option.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OptionScope {
    /// Option disabled everywhere.
    #[default]
    None,
    /// Option enabled for every relation path.
    All,
    /// Option enabled only for the listed relation paths.
    Paths(HashSet<String>),
}

impl OptionScope {
    /// Build a scope from a set of relation paths.
    pub fn paths<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> Self {
        Self::Paths(paths.into_iter().map(Into::into).collect())
    }

    /// Whether the option applies to `path`.
    pub fn contains(&self, path: &str) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Paths(paths) => paths.contains(path),
        }
    }
}

impl From<bool> for OptionScope {
    fn from(enabled: bool) -> Self {
        if enabled { Self::All } else { Self::None }
    }
}

/// Opaque allow-list predicate over relation paths.
pub type AllowPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Per-call options for graph insertion and upsert reconciliation.
#[derive(Clone, Default)]
pub struct GraphOptions {
    /// Relate existing rows instead of erroring when a child carries an
    /// identifier that is not currently a child of its parent.
    pub relate: OptionScope,
    /// Unrelate instead of deleting persisted children missing from the
    /// new graph.
    pub unrelate: OptionScope,
    /// Insert rows that carry identifiers but are not found as children,
    /// keeping the caller-provided identifier verbatim.
    pub insert_missing: OptionScope,
    /// Issue full-row updates instead of patches for matched nodes.
    pub update: OptionScope,
    pub no_insert: OptionScope,
    pub no_update: OptionScope,
    pub no_delete: OptionScope,
    pub no_relate: OptionScope,
    pub no_unrelate: OptionScope,
    /// Allow-list veto: traversing a relation path for which this returns
    /// false fails with `UnallowedRelation`.
    pub allowed: Option<AllowPredicate>,
}

impl fmt::Debug for GraphOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphOptions")
            .field("relate", &self.relate)
            .field("unrelate", &self.unrelate)
            .field("insert_missing", &self.insert_missing)
            .field("update", &self.update)
            .field("no_insert", &self.no_insert)
            .field("no_update", &self.no_update)
            .field("no_delete", &self.no_delete)
            .field("no_relate", &self.no_relate)
            .field("no_unrelate", &self.no_unrelate)
            .field("allowed", &self.allowed.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

impl GraphOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relate(mut self, scope: impl Into<OptionScope>) -> Self {
        self.relate = scope.into();
        self
    }

    pub fn unrelate(mut self, scope: impl Into<OptionScope>) -> Self {
        self.unrelate = scope.into();
        self
    }

    pub fn insert_missing(mut self, scope: impl Into<OptionScope>) -> Self {
        self.insert_missing = scope.into();
        self
    }

    pub fn update(mut self, scope: impl Into<OptionScope>) -> Self {
        self.update = scope.into();
        self
    }

    pub fn no_insert(mut self, scope: impl Into<OptionScope>) -> Self {
        self.no_insert = scope.into();
        self
    }

    pub fn no_update(mut self, scope: impl Into<OptionScope>) -> Self {
        self.no_update = scope.into();
        self
    }

    pub fn no_delete(mut self, scope: impl Into<OptionScope>) -> Self {
        self.no_delete = scope.into();
        self
    }

    pub fn no_relate(mut self, scope: impl Into<OptionScope>) -> Self {
        self.no_relate = scope.into();
        self
    }

    pub fn no_unrelate(mut self, scope: impl Into<OptionScope>) -> Self {
        self.no_unrelate = scope.into();
        self
    }

    /// Restrict traversal to relation paths accepted by `predicate`.
    pub fn allow(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.allowed = Some(Arc::new(predicate));
        self
    }

    /// Whether `path` passes the allow-list (paths are always allowed when
    /// no predicate is configured).
    pub fn is_allowed(&self, path: &str) -> bool {
        self.allowed.as_ref().is_none_or(|allowed| allowed(path))
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Maximum number of per-table batches submitted concurrently within
    /// one ready set. Batches across ready sets are always sequential.
    pub batch_concurrency: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 1,
        }
    }
}

/// Join a parent relation path and a relation name.
pub(crate) fn join_path(parent: &str, relation: &str) -> String {
    if parent.is_empty() {
        relation.to_string()
    } else {
        format!("{parent}.{relation}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_bool() {
        assert_eq!(OptionScope::from(true), OptionScope::All);
        assert_eq!(OptionScope::from(false), OptionScope::None);
    }

    #[test]
    fn scope_contains() {
        let scope = OptionScope::paths(["movies", "movies.actors"]);
        assert!(scope.contains("movies"));
        assert!(scope.contains("movies.actors"));
        assert!(!scope.contains("actors"));
        assert!(OptionScope::All.contains("anything"));
        assert!(!OptionScope::None.contains("anything"));
    }

    #[test]
    fn allow_predicate() {
        let options = GraphOptions::new().allow(|path| path.starts_with("movies"));
        assert!(options.is_allowed("movies"));
        assert!(options.is_allowed("movies.actors"));
        assert!(!options.is_allowed("pets"));

        let unrestricted = GraphOptions::new();
        assert!(unrestricted.is_allowed("pets"));
    }

    #[test]
    fn path_join() {
        assert_eq!(join_path("", "movies"), "movies");
        assert_eq!(join_path("movies", "actors"), "movies.actors");
    }
}
