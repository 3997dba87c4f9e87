//! Relation traversal: joins, eager loading, lazy loading, and existence
//! filters.
//!
//! Eager loading issues one child query per relation: the child is filtered
//! with `IN` lists over the distinct parent key values, carries the join
//! keys out under `pivot_relation_*` aliases, and the rows are stitched back
//! onto their parents by concatenated key identifiers. Through-relations
//! join the pivot first so every ON clause only references aliases already
//! in scope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::compiler::{make_column_alias, quote};
use crate::condition::{Expression, Operator, Separator};
use crate::error::OrmResult;
use crate::model::{Collection, Record, Related};
use crate::relation::{QueryScope, Relation, RelationKind, RelationMap};
use crate::value::{composite_identifier, identifier, Attributes};

use super::{as_integer, Query};

/// JOIN flavor for relation joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

impl JoinKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
        }
    }
}

/// A child query ready to run, plus how to stitch its rows back: each pair
/// is the parent column and the aliased child output column.
pub(crate) struct EagerPlan {
    pub query: Query,
    pub stitch: Vec<(String, String)>,
    pub kind: RelationKind,
}

impl Query {
    pub(crate) fn resolve(&self, name: &str) -> Option<Relation> {
        resolve_in(&self.meta.relations, name, &self.meta.table)
    }

    /// Eager-load a relation onto every fetched record.
    pub fn with(mut self, name: &str) -> Self {
        self.with.push((name.to_string(), None));
        self
    }

    /// Eager-load a relation, narrowing the child query.
    pub fn with_scope<F>(mut self, name: &str, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.with.push((name.to_string(), Some(Arc::new(scope))));
        self
    }

    /// Count a relation's rows per record without loading them.
    pub fn with_count(mut self, name: &str) -> Self {
        self.with_counts.push((name.to_string(), None));
        self
    }

    pub fn with_count_scope<F>(mut self, name: &str, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.with_counts.push((name.to_string(), Some(Arc::new(scope))));
        self
    }

    /// Join a named relation of this model.
    pub fn join_relation(self, name: &str) -> Self {
        self.join_relation_kind(name, JoinKind::Inner)
    }

    pub fn join_relation_kind(mut self, name: &str, kind: JoinKind) -> Self {
        let relations = self.meta.relations.clone();
        self.join_hop(name, Vec::new(), kind, &relations);
        self
    }

    /// One join hop. `conditions` are `(joined column, own column)` pairs
    /// overriding the relation's keys; a through chain recurses with this
    /// relation's keys remapped onto the joined alias. The joined table is
    /// aliased by the relation name so self-joins stay unambiguous.
    pub(crate) fn join_hop(
        &mut self,
        name: &str,
        conditions: Vec<(String, String)>,
        kind: JoinKind,
        relations: &RelationMap,
    ) {
        let Some(relation) = resolve_in(relations, name, &self.meta.table) else {
            return;
        };
        let joined = (relation.target)();
        let theirs = crate::compiler::Compiler::new(name.to_string());
        let own = self.compiler();
        let pairs: Vec<(String, String)> = if conditions.is_empty() {
            relation
                .keys
                .iter()
                .map(|(local, foreign)| (foreign.clone(), local.clone()))
                .collect()
        } else {
            conditions
        };
        let on: Vec<String> = pairs
            .iter()
            .map(|(joined_col, own_col)| {
                format!(
                    "{} = {}",
                    theirs.normalize_column(joined_col),
                    own.normalize_column(own_col)
                )
            })
            .collect();
        self.joins.push(format!(
            "{} JOIN {} AS {} ON {}",
            kind.keyword(),
            joined.source(),
            quote(name),
            on.join(" AND ")
        ));
        self.through_keys = relation
            .keys
            .iter()
            .map(|(parent, child)| (parent.clone(), theirs.normalize_column(child)))
            .collect();
        if let Some(next) = relation.through.clone() {
            let mapped = self.through_keys.clone();
            self.join_hop(&next, mapped, kind, relations);
        }
    }

    /// Build the batched child query for one relation over a set of parent
    /// rows. `maps` memoizes the distinct parent values per column so
    /// several relations sharing a key scan the parents once.
    pub(crate) fn build_eager_query(
        &self,
        name: &str,
        scope: Option<QueryScope>,
        records: &[Record],
        maps: &mut HashMap<String, Vec<Value>>,
        count: bool,
    ) -> Option<EagerPlan> {
        let relation = self.resolve(name)?;
        let target = (relation.target)();
        let mut child = Query::new(self.connection.clone(), target)
            .set_alias(name)
            .offset_params(self.params.seq());
        if count {
            child
                .selects
                .push(("`count`".to_string(), "count(*)".to_string()));
        } else {
            child = child.select(&format!("{name}.*"));
        }
        let keys: Vec<(String, String)> = if let Some(through) = &relation.through {
            child.join_hop(through, relation.keys.clone(), JoinKind::Inner, &self.meta.relations);
            child.through_keys.clone()
        } else {
            relation.keys.clone()
        };

        let mut filters: Vec<(String, Vec<Value>)> = Vec::new();
        for (parent, child_col) in &keys {
            let values = maps
                .entry(parent.clone())
                .or_insert_with(|| distinct_values(records, parent))
                .clone();
            filters.push((child_col.clone(), values));
        }
        child = child.where_group(move |scope| {
            for (column, values) in &filters {
                scope.add(column, Operator::In, Value::Array(values.clone()));
            }
        });

        let mut stitch: Vec<(String, String)> = Vec::new();
        let compiler = child.compiler();
        for (parent, child_col) in &keys {
            let alias =
                make_column_alias(&compiler.normalize_column(child_col), Some("pivot_relation"));
            child = child.select_prefixed(child_col, Some("pivot_relation"));
            if count {
                child = child.group_by(&alias);
            }
            stitch.push((parent.clone(), alias.trim_matches('`').to_string()));
        }

        if let Some(apply) = &relation.scope {
            child = apply(child);
        }
        if let Some(apply) = &scope {
            child = apply(child);
        }

        Some(EagerPlan {
            query: child,
            stitch,
            kind: relation.kind,
        })
    }

    #[tracing::instrument(skip(self, records, scope, maps), fields(relation = name))]
    pub(crate) async fn eager_load(
        &self,
        records: &mut Vec<Record>,
        name: &str,
        scope: Option<QueryScope>,
        maps: &mut HashMap<String, Vec<Value>>,
        count: bool,
    ) -> OrmResult<()> {
        let Some(plan) = self.build_eager_query(name, scope, records, maps, count) else {
            return Ok(());
        };
        let EagerPlan { query, stitch, kind } = plan;
        if count {
            let rows = self
                .connection
                .fetch_all(&query.to_sql(), query.params())
                .await?;
            attach_counts(records, name, &stitch, &rows);
        } else {
            let children = query.all_boxed().await?;
            attach_related(records, name, kind, &stitch, children.into_inner());
        }
        Ok(())
    }

    /// Load one relation onto an already-fetched record.
    pub async fn load(
        &self,
        record: &mut Record,
        name: &str,
        scope: Option<QueryScope>,
    ) -> OrmResult<()> {
        let mut records = vec![record.clone()];
        let mut maps = HashMap::new();
        self.eager_load(&mut records, name, scope, &mut maps, false)
            .await?;
        *record = records.remove(0);
        Ok(())
    }

    /// Keep only rows with at least one related row, via a correlated
    /// EXISTS sub-query.
    pub fn where_has(self, name: &str) -> Self {
        self.add_where_has(Separator::And, name, None)
    }

    pub fn where_has_scope<F>(self, name: &str, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.add_where_has(Separator::And, name, Some(Arc::new(scope)))
    }

    pub fn or_where_has(self, name: &str) -> Self {
        self.add_where_has(Separator::Or, name, None)
    }

    pub fn or_where_has_scope<F>(self, name: &str, scope: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.add_where_has(Separator::Or, name, Some(Arc::new(scope)))
    }

    fn add_where_has(mut self, separator: Separator, name: &str, scope: Option<QueryScope>) -> Self {
        let Some(relation) = self.resolve(name) else {
            return self;
        };
        let target = (relation.target)();
        let mut child = Query::new(self.connection.clone(), target)
            .set_alias(name)
            .offset_params(self.params.seq());
        let keys: Vec<(String, String)> = if let Some(through) = &relation.through {
            child.join_hop(through, relation.keys.clone(), JoinKind::Inner, &self.meta.relations);
            child.through_keys.clone()
        } else {
            relation.keys.clone()
        };
        let outer = quote(&self.meta.alias);
        for (parent, child_col) in &keys {
            child = child.where_raw(Expression::new(format!(
                "{} = {}.{}",
                quote(child_col),
                outer,
                quote(parent)
            )));
        }
        if let Some(apply) = &scope {
            child = apply(child);
        }
        if let Some(apply) = &relation.scope {
            child = apply(child);
        }
        let sql = child.to_sql();
        let params = child.params.clone();
        self.wheres.push(separator, format!("EXISTS ({sql})"));
        self.params.merge(params);
        self
    }
}

fn resolve_in(relations: &RelationMap, name: &str, table: &str) -> Option<Relation> {
    let found = relations.get(name).cloned();
    if found.is_none() {
        warn!(relation = name, model = table, "unknown relation name, skipping");
    }
    found
}

fn distinct_values(records: &[Record], column: &str) -> Vec<Value> {
    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for record in records {
        let value = record.get(column).cloned().unwrap_or(Value::Null);
        if seen.insert(identifier(&value)) {
            values.push(value);
        }
    }
    values
}

/// Bucket child rows by their stitched key and hand each parent its share.
/// A has-many parent with no children still gets an empty collection.
pub(crate) fn attach_related(
    records: &mut [Record],
    name: &str,
    kind: RelationKind,
    stitch: &[(String, String)],
    children: Vec<Record>,
) {
    let child_cols: Vec<&str> = stitch.iter().map(|(_, out)| out.as_str()).collect();
    let parent_cols: Vec<&str> = stitch.iter().map(|(parent, _)| parent.as_str()).collect();
    let mut buckets: HashMap<String, Vec<Record>> = HashMap::new();
    for child in children {
        let key = composite_identifier(child.attributes(), child_cols.iter().copied());
        buckets.entry(key).or_default().push(child);
    }
    for record in records.iter_mut() {
        let key = composite_identifier(record.attributes(), parent_cols.iter().copied());
        match kind {
            RelationKind::HasMany => {
                let items = buckets.get(&key).cloned().unwrap_or_default();
                record.set_related(name, Related::Many(Collection::new(items)));
            }
            RelationKind::HasOne => {
                if let Some(first) = buckets.get(&key).and_then(|bucket| bucket.first()) {
                    record.set_related(name, Related::One(Box::new(first.clone())));
                }
            }
        }
    }
}

/// Merge grouped count rows back onto parents; parents with no matching
/// group count zero.
pub(crate) fn attach_counts(
    records: &mut [Record],
    name: &str,
    stitch: &[(String, String)],
    rows: &[Attributes],
) {
    let child_cols: Vec<&str> = stitch.iter().map(|(_, out)| out.as_str()).collect();
    let parent_cols: Vec<&str> = stitch.iter().map(|(parent, _)| parent.as_str()).collect();
    let mut counts: HashMap<String, i64> = HashMap::new();
    for row in rows {
        let key = composite_identifier(row, child_cols.iter().copied());
        counts.insert(key, row.get("count").map(as_integer).unwrap_or(0));
    }
    for record in records.iter_mut() {
        let key = composite_identifier(record.attributes(), parent_cols.iter().copied());
        record.set_count(name, counts.get(&key).copied().unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::model::ModelMeta;
    use crate::value::Attributes;
    use serde_json::json;

    fn post_meta() -> ModelMeta {
        ModelMeta::new("post", "p")
    }

    fn user_meta() -> ModelMeta {
        ModelMeta::new("user", "u").relations(
            RelationMap::new()
                .define("posts", Relation::has_many(post_meta, &[("id", "author_id")]))
                .define("profile", Relation::has_one(post_meta, &[("id", "user_id")])),
        )
    }

    fn role_child_meta() -> ModelMeta {
        ModelMeta::new("role_child", "rc").primary(&["role_id", "child_id"])
    }

    fn role_meta() -> ModelMeta {
        ModelMeta::new("role", "role").relations(
            RelationMap::new()
                .define(
                    "childRelations",
                    Relation::has_many(role_child_meta, &[("id", "role_id")]),
                )
                .define(
                    "childs",
                    Relation::has_many(role_meta, &[("child_id", "id")]).through("childRelations"),
                ),
        )
    }

    fn query(meta: ModelMeta) -> Query {
        let connection = Arc::new(Connection::new(ConnectionConfig::new()));
        Query::new(connection, meta)
    }

    fn record(meta: ModelMeta, pairs: &[(&str, Value)]) -> Record {
        let mut attributes = Attributes::new();
        for (name, value) in pairs {
            attributes.insert((*name).to_string(), value.clone());
        }
        Record::hydrate(meta, attributes)
    }

    #[test]
    fn eager_query_batches_distinct_parent_keys_into_one_in_list() {
        let parents = vec![
            record(user_meta(), &[("id", json!(1))]),
            record(user_meta(), &[("id", json!(2))]),
            record(user_meta(), &[("id", json!(2))]),
        ];
        let mut maps = HashMap::new();
        let plan = query(user_meta())
            .build_eager_query("posts", None, &parents, &mut maps, false)
            .unwrap();
        assert_eq!(
            plan.query.to_sql(),
            "SELECT `posts`.*, `posts`.`author_id` AS `pivot_relation_author` \
             FROM {{ post }} AS `posts` \
             WHERE (`posts`.`author_id` IN (:bind_posts_0, :bind_posts_1))"
        );
        assert_eq!(plan.query.params().len(), 2);
        assert_eq!(plan.stitch, vec![("id".to_string(), "pivot_relation_author".to_string())]);
    }

    #[test]
    fn through_relation_joins_pivot_before_referencing_it() {
        let parents = vec![record(role_meta(), &[("id", json!(5))])];
        let mut maps = HashMap::new();
        let plan = query(role_meta())
            .build_eager_query("childs", None, &parents, &mut maps, false)
            .unwrap();
        assert_eq!(
            plan.query.to_sql(),
            "SELECT `childs`.*, `childRelations`.`role_id` AS `pivot_relation_role` \
             FROM {{ role }} AS `childs` \
             INNER JOIN {{ role_child }} AS `childRelations` \
             ON `childRelations`.`child_id` = `childs`.`id` \
             WHERE (`childRelations`.`role_id` IN (:bind_childs_0))"
        );
        assert_eq!(
            plan.stitch,
            vec![("id".to_string(), "pivot_relation_role".to_string())]
        );
    }

    #[test]
    fn count_query_groups_by_the_carried_key() {
        let parents = vec![record(user_meta(), &[("id", json!(1))])];
        let mut maps = HashMap::new();
        let plan = query(user_meta())
            .build_eager_query("posts", None, &parents, &mut maps, true)
            .unwrap();
        assert_eq!(
            plan.query.to_sql(),
            "SELECT count(*) AS `count`, `posts`.`author_id` AS `pivot_relation_author` \
             FROM {{ post }} AS `posts` \
             WHERE (`posts`.`author_id` IN (:bind_posts_0)) \
             GROUP BY `pivot_relation_author`"
        );
    }

    #[test]
    fn eager_scope_narrows_the_child_query() {
        let parents = vec![record(user_meta(), &[("id", json!(1))])];
        let mut maps = HashMap::new();
        let plan = query(user_meta())
            .build_eager_query(
                "posts",
                Some(Arc::new(|q: Query| q.where_eq("status", json!("published")))),
                &parents,
                &mut maps,
                false,
            )
            .unwrap();
        assert!(plan
            .query
            .to_sql()
            .ends_with("AND `posts`.`status` = :bind_posts_1"));
    }

    #[test]
    fn unknown_relation_is_skipped() {
        let parents = vec![record(user_meta(), &[("id", json!(1))])];
        let mut maps = HashMap::new();
        assert!(query(user_meta())
            .build_eager_query("bogus", None, &parents, &mut maps, false)
            .is_none());
    }

    #[test]
    fn attach_gives_every_has_many_parent_a_collection() {
        let mut parents = vec![
            record(user_meta(), &[("id", json!(1))]),
            record(user_meta(), &[("id", json!(2))]),
        ];
        let children = vec![
            record(post_meta(), &[("id", json!(10)), ("pivot_relation_author", json!(1))]),
            record(post_meta(), &[("id", json!(11)), ("pivot_relation_author", json!(1))]),
        ];
        let stitch = vec![("id".to_string(), "pivot_relation_author".to_string())];
        attach_related(&mut parents, "posts", RelationKind::HasMany, &stitch, children);

        match parents[0].related("posts") {
            Some(Related::Many(collection)) => assert_eq!(collection.len(), 2),
            other => panic!("expected collection, got {other:?}"),
        }
        match parents[1].related("posts") {
            Some(Related::Many(collection)) => assert!(collection.is_empty()),
            other => panic!("expected empty collection, got {other:?}"),
        }
    }

    #[test]
    fn attach_has_one_takes_the_first_match_only() {
        let mut parents = vec![record(user_meta(), &[("id", json!(1))])];
        let children = vec![
            record(post_meta(), &[("id", json!(7)), ("pivot_relation_user", json!(1))]),
            record(post_meta(), &[("id", json!(8)), ("pivot_relation_user", json!(1))]),
        ];
        let stitch = vec![("id".to_string(), "pivot_relation_user".to_string())];
        attach_related(&mut parents, "profile", RelationKind::HasOne, &stitch, children);
        match parents[0].related("profile") {
            Some(Related::One(record)) => assert_eq!(record.get("id"), Some(&json!(7))),
            other => panic!("expected single record, got {other:?}"),
        }
    }

    #[test]
    fn attach_counts_defaults_missing_parents_to_zero() {
        let mut parents = vec![
            record(user_meta(), &[("id", json!(1))]),
            record(user_meta(), &[("id", json!(2))]),
        ];
        let mut row = Attributes::new();
        row.insert("count".to_string(), json!(3));
        row.insert("pivot_relation_author".to_string(), json!(1));
        let stitch = vec![("id".to_string(), "pivot_relation_author".to_string())];
        attach_counts(&mut parents, "posts", &stitch, &[row]);
        assert_eq!(parents[0].count_of("posts"), Some(3));
        assert_eq!(parents[1].count_of("posts"), Some(0));
    }

    #[test]
    fn stitching_matches_numeric_and_text_keys() {
        let mut parents = vec![record(user_meta(), &[("id", json!(1))])];
        let children = vec![record(
            post_meta(),
            &[("id", json!(9)), ("pivot_relation_author", json!("1"))],
        )];
        let stitch = vec![("id".to_string(), "pivot_relation_author".to_string())];
        attach_related(&mut parents, "posts", RelationKind::HasMany, &stitch, children);
        match parents[0].related("posts") {
            Some(Related::Many(collection)) => assert_eq!(collection.len(), 1),
            other => panic!("expected collection, got {other:?}"),
        }
    }

    #[test]
    fn join_relation_links_foreign_to_local() {
        let q = query(role_meta()).join_relation("childRelations");
        assert_eq!(
            q.to_sql(),
            "SELECT `role`.* FROM {{ role }} AS `role` \
             INNER JOIN {{ role_child }} AS `childRelations` \
             ON `childRelations`.`role_id` = `role`.`id`"
        );
    }

    #[test]
    fn where_has_renders_a_correlated_exists() {
        let q = query(user_meta()).where_has("posts");
        assert_eq!(
            q.to_sql(),
            "SELECT `u`.* FROM {{ user }} AS `u` WHERE EXISTS (\
             SELECT `posts`.* FROM {{ post }} AS `posts` \
             WHERE `author_id` = `u`.`id`)"
        );
    }

    #[test]
    fn where_has_scope_params_merge_into_the_outer_query() {
        let q = query(user_meta())
            .where_eq("active", json!(1))
            .where_has_scope("posts", |child| child.where_eq("status", json!("published")));
        let sql = q.to_sql();
        assert!(sql.contains(
            "EXISTS (SELECT `posts`.* FROM {{ post }} AS `posts` \
             WHERE `author_id` = `u`.`id` AND `posts`.`status` = :bind_posts_1)"
        ));
        assert_eq!(q.params().get(":bind_posts_1"), Some(&json!("published")));
        assert_eq!(q.params().get(":bind_u_0"), Some(&json!(1)));
    }

    #[test]
    fn where_has_through_correlates_on_the_pivot() {
        let q = query(role_meta()).where_has("childs");
        assert_eq!(
            q.to_sql(),
            "SELECT `role`.* FROM {{ role }} AS `role` WHERE EXISTS (\
             SELECT `childs`.* FROM {{ role }} AS `childs` \
             INNER JOIN {{ role_child }} AS `childRelations` \
             ON `childRelations`.`child_id` = `childs`.`id` \
             WHERE `childRelations`.`role_id` = `role`.`id`)"
        );
    }
}
