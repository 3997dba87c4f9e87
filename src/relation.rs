//! Relation descriptors.
//!
//! A relation names a target model through a meta factory captured at
//! definition time, an ordered foreign/local key map, an optional pivot
//! table for through-relations, and an optional default scope applied to
//! every query the relation spawns.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::model::ModelMeta;
use crate::query::Query;

/// Factory producing the target model's metadata.
pub type MetaFactory = fn() -> ModelMeta;

/// A closure that narrows a relation query before it runs.
pub type QueryScope = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// Cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasOne,
    HasMany,
}

/// One named relation on a model.
#[derive(Clone)]
pub struct Relation {
    pub kind: RelationKind,
    pub target: MetaFactory,
    /// Name of the pivot relation on the owning model, when the link goes
    /// through an intermediate table.
    pub through: Option<String>,
    /// Ordered column pairs. For a direct relation, `(local, foreign)`:
    /// the owner's column paired with the target's. For a through relation,
    /// `(pivot, target)`: the pivot column paired with the target's.
    pub keys: Vec<(String, String)>,
    pub scope: Option<QueryScope>,
}

impl Relation {
    pub fn has_one(target: MetaFactory, keys: &[(&str, &str)]) -> Self {
        Self::new(RelationKind::HasOne, target, keys)
    }

    pub fn has_many(target: MetaFactory, keys: &[(&str, &str)]) -> Self {
        Self::new(RelationKind::HasMany, target, keys)
    }

    fn new(kind: RelationKind, target: MetaFactory, keys: &[(&str, &str)]) -> Self {
        Self {
            kind,
            target,
            through: None,
            keys: keys
                .iter()
                .map(|(f, l)| ((*f).to_string(), (*l).to_string()))
                .collect(),
            scope: None,
        }
    }

    /// Route the relation through a pivot relation declared on the target.
    pub fn through(mut self, pivot: impl Into<String>) -> Self {
        self.through = Some(pivot.into());
        self
    }

    /// Attach a default scope applied to every query this relation builds.
    pub fn scope<F>(mut self, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.scope = Some(Arc::new(scope));
        self
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("kind", &self.kind)
            .field("through", &self.through)
            .field("keys", &self.keys)
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

/// Named relations of one model.
#[derive(Debug, Clone, Default)]
pub struct RelationMap {
    inner: HashMap<String, Relation>,
}

impl RelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.inner.insert(name.into(), relation);
        self
    }

    /// Look up a relation by name. Unknown names resolve to `None`; callers
    /// decide whether that is a skip or an error.
    pub fn get(&self, name: &str) -> Option<&Relation> {
        self.inner.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts_meta() -> ModelMeta {
        ModelMeta::new("post", "p")
    }

    #[test]
    fn builders_capture_kind_keys_and_pivot() {
        let relation = Relation::has_many(posts_meta, &[("id", "author_id")])
            .through("pivot");
        assert_eq!(relation.kind, RelationKind::HasMany);
        assert_eq!(relation.through.as_deref(), Some("pivot"));
        assert_eq!(relation.keys, vec![("id".to_string(), "author_id".to_string())]);
        assert_eq!((relation.target)().table, "post");
    }

    #[test]
    fn map_lookup_misses_resolve_to_none() {
        let map = RelationMap::new()
            .define("posts", Relation::has_many(posts_meta, &[("id", "author_id")]));
        assert!(map.get("posts").is_some());
        assert!(map.get("comments").is_none());
    }
}
