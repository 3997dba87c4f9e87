//! Model metadata and hydrated records.
//!
//! A model is described by its [`ModelMeta`]: table, alias, primary key
//! columns, relations, and lifecycle hooks. Rows hydrate into [`Record`]s,
//! which keep persistent attributes apart from the loaded snapshot, loaded
//! relation values, and relation counts. Relation values and counts never
//! flow back into column data.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value;

use crate::connection::Connection;
use crate::error::OrmResult;
use crate::query::{Query, SyncMode};
use crate::relation::RelationMap;
use crate::value::Attributes;

/// Lifecycle hook signature. Hooks are plain functions picked up from the
/// model trait, so metadata stays `Clone` and cheap to pass around.
pub type Hook = fn(&mut Record);

fn noop(_: &mut Record) {}

/// Lifecycle hooks of one model.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Runs on each record right after hydration, before relations load.
    pub before_find: Hook,
    /// Runs after relations and counts are attached.
    pub after_find: Hook,
    pub before_save: Hook,
    pub after_save: Hook,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            before_find: noop,
            after_find: noop,
            before_save: noop,
            after_save: noop,
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hooks")
    }
}

/// Static description of one model.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    /// Bare table name; rendered as a `{{ name }}` template so the
    /// connection can apply its prefix.
    pub table: String,
    pub alias: String,
    pub primary: Vec<String>,
    pub relations: RelationMap,
    pub hooks: Hooks,
}

impl ModelMeta {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
            primary: vec!["id".to_string()],
            relations: RelationMap::new(),
            hooks: Hooks::default(),
        }
    }

    pub fn primary(mut self, columns: &[&str]) -> Self {
        self.primary = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn relations(mut self, relations: RelationMap) -> Self {
        self.relations = relations;
        self
    }

    /// The FROM source with the prefix template around the table name.
    pub fn source(&self) -> String {
        format!("{{{{ {} }}}}", self.table)
    }
}

/// Implemented per model type; everything is static so a model is a unit
/// struct plus this impl.
pub trait Model: Sized {
    fn table() -> String;

    fn alias() -> String {
        Self::table()
    }

    fn primary() -> Vec<String> {
        vec!["id".to_string()]
    }

    fn relations() -> RelationMap {
        RelationMap::new()
    }

    fn before_find(_record: &mut Record) {}
    fn after_find(_record: &mut Record) {}
    fn before_save(_record: &mut Record) {}
    fn after_save(_record: &mut Record) {}

    fn meta() -> ModelMeta {
        ModelMeta {
            table: Self::table(),
            alias: Self::alias(),
            primary: Self::primary(),
            relations: Self::relations(),
            hooks: Hooks {
                before_find: Self::before_find,
                after_find: Self::after_find,
                before_save: Self::before_save,
                after_save: Self::after_save,
            },
        }
    }

    fn query(connection: Arc<Connection>) -> Query {
        Query::new(connection, Self::meta())
    }

    fn new_record() -> Record {
        Record::new(Self::meta())
    }
}

/// A loaded relation value.
#[derive(Debug, Clone)]
pub enum Related {
    One(Box<Record>),
    Many(Collection),
}

/// One row of one model, plus everything loaded around it.
#[derive(Debug, Clone)]
pub struct Record {
    meta: ModelMeta,
    attributes: Attributes,
    original: Attributes,
    related: BTreeMap<String, Related>,
    counts: BTreeMap<String, i64>,
}

impl Record {
    pub fn new(meta: ModelMeta) -> Self {
        Self {
            meta,
            attributes: Attributes::new(),
            original: Attributes::new(),
            related: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    /// Build a record from a fetched row. The snapshot and the live
    /// attributes start out identical.
    pub fn hydrate(meta: ModelMeta, attributes: Attributes) -> Self {
        Self {
            meta,
            original: attributes.clone(),
            attributes,
            related: BTreeMap::new(),
            counts: BTreeMap::new(),
        }
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    /// A record that was never loaded from a row counts as new.
    pub fn is_new(&self) -> bool {
        self.original.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.attributes.insert(name.into(), value);
    }

    pub fn fill(&mut self, values: Attributes) {
        self.attributes.extend(values);
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn original(&self) -> &Attributes {
        &self.original
    }

    /// Primary key columns paired with their loaded values. Falls back to
    /// the live attributes for records never fetched.
    pub fn primary_snapshot(&self) -> Vec<(String, Value)> {
        let source = if self.original.is_empty() {
            &self.attributes
        } else {
            &self.original
        };
        self.meta
            .primary
            .iter()
            .map(|column| {
                (
                    column.clone(),
                    source.get(column).cloned().unwrap_or(Value::Null),
                )
            })
            .collect()
    }

    pub fn related(&self, name: &str) -> Option<&Related> {
        self.related.get(name)
    }

    pub fn count_of(&self, name: &str) -> Option<i64> {
        self.counts.get(name).copied()
    }

    pub fn set_related(&mut self, name: impl Into<String>, related: Related) {
        self.related.insert(name.into(), related);
    }

    pub fn set_count(&mut self, name: impl Into<String>, count: i64) {
        self.counts.insert(name.into(), count);
    }

    /// Replace column state with a freshly fetched copy, dropping loaded
    /// relations and counts that may no longer hold.
    pub fn replace_from(&mut self, fresh: Record) {
        self.attributes = fresh.attributes;
        self.original = fresh.original;
        self.related.clear();
        self.counts.clear();
    }

    pub async fn save(&mut self, connection: Arc<Connection>) -> OrmResult<()> {
        Query::new(connection, self.meta.clone()).save(self).await
    }

    pub async fn delete(&self, connection: Arc<Connection>) -> OrmResult<u64> {
        Query::new(connection, self.meta.clone())
            .delete_record(self)
            .await
    }

    /// Load one relation onto this record, optionally narrowed.
    pub async fn load(
        &mut self,
        connection: Arc<Connection>,
        name: &str,
    ) -> OrmResult<()> {
        Query::new(connection, self.meta.clone())
            .load(self, name, None)
            .await
    }

    pub async fn sync(
        &mut self,
        connection: Arc<Connection>,
        name: &str,
        values: Vec<Value>,
        mode: SyncMode,
    ) -> OrmResult<()> {
        Query::new(connection, self.meta.clone())
            .sync(self, name, values, mode)
            .await
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.attributes.len() + self.related.len() + self.counts.len();
        let mut map = serializer.serialize_map(Some(len))?;
        for (name, value) in &self.attributes {
            map.serialize_entry(name, value)?;
        }
        for (name, related) in &self.related {
            match related {
                Related::One(record) => map.serialize_entry(name, record)?,
                Related::Many(collection) => map.serialize_entry(name, collection)?,
            }
        }
        for (name, count) in &self.counts {
            map.serialize_entry(&format!("{name}_count"), count)?;
        }
        map.end()
    }
}

/// An ordered set of records from one query.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    items: Vec<Record>,
}

impl Collection {
    pub fn new(items: Vec<Record>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first(&self) -> Option<&Record> {
        self.items.first()
    }

    pub fn get(&self, index: usize) -> Option<&Record> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Record> {
        self.items.iter_mut()
    }

    pub fn into_inner(self) -> Vec<Record> {
        self.items
    }
}

impl IntoIterator for Collection {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.items.len()))?;
        for record in &self.items {
            seq.serialize_element(record)?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> ModelMeta {
        ModelMeta::new("user", "u")
    }

    #[test]
    fn hydrated_records_are_not_new() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), json!(7));
        let record = Record::hydrate(meta(), attrs);
        assert!(!record.is_new());
        assert_eq!(record.get("id"), Some(&json!(7)));

        let blank = Record::new(meta());
        assert!(blank.is_new());
    }

    #[test]
    fn set_leaves_the_snapshot_alone() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), json!(7));
        attrs.insert("name".into(), json!("before"));
        let mut record = Record::hydrate(meta(), attrs);
        record.set("name", json!("after"));
        assert_eq!(record.get("name"), Some(&json!("after")));
        assert_eq!(record.original().get("name"), Some(&json!("before")));
        assert_eq!(record.primary_snapshot(), vec![("id".to_string(), json!(7))]);
    }

    #[test]
    fn primary_snapshot_keeps_premutation_keys() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), json!(7));
        let mut record = Record::hydrate(meta(), attrs);
        record.set("id", json!(99));
        assert_eq!(record.primary_snapshot(), vec![("id".to_string(), json!(7))]);
    }

    #[test]
    fn serialization_merges_relations_and_counts() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), json!(1));
        let mut record = Record::hydrate(meta(), attrs);

        let mut child_attrs = Attributes::new();
        child_attrs.insert("id".into(), json!(10));
        let child = Record::hydrate(ModelMeta::new("post", "p"), child_attrs);
        record.set_related("posts", Related::Many(Collection::new(vec![child])));
        record.set_count("posts", 1);

        let rendered = serde_json::to_value(&record).unwrap();
        assert_eq!(
            rendered,
            json!({"id": 1, "posts": [{"id": 10}], "posts_count": 1})
        );
    }

    #[test]
    fn replace_from_drops_loaded_relations() {
        let mut attrs = Attributes::new();
        attrs.insert("id".into(), json!(1));
        let mut record = Record::hydrate(meta(), attrs);
        record.set_count("posts", 3);

        let mut fresh_attrs = Attributes::new();
        fresh_attrs.insert("id".into(), json!(1));
        fresh_attrs.insert("name".into(), json!("fetched"));
        record.replace_from(Record::hydrate(meta(), fresh_attrs));

        assert_eq!(record.get("name"), Some(&json!("fetched")));
        assert_eq!(record.count_of("posts"), None);
    }
}
