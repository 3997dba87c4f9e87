//! Query building and execution.
//!
//! A [`Query`] is a value: clause methods consume and return it, sub-queries
//! are fresh values, and nothing is shared mutably. Rendering is pure; only
//! the `async` execution methods touch the connection.

mod relations;
mod write;

pub use relations::JoinKind;
pub use write::SyncMode;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::compiler::{make_column_alias, quote, Compiler, Sort};
use crate::condition::{Condition, ConditionScope, Expression, Operator, Separator};
use crate::connection::Connection;
use crate::error::OrmResult;
use crate::model::{Collection, ModelMeta, Record};
use crate::params::ParamBag;
use crate::relation::QueryScope;
use crate::value::Attributes;

/// Fluent SQL builder bound to one model and one connection.
#[derive(Clone)]
pub struct Query {
    connection: Arc<Connection>,
    meta: ModelMeta,
    selects: Vec<(String, String)>,
    wheres: Condition,
    havings: Condition,
    groups: Vec<String>,
    orders: Vec<(String, Sort)>,
    joins: Vec<String>,
    size: u64,
    offset: u64,
    params: ParamBag,
    with: Vec<(String, Option<QueryScope>)>,
    with_counts: Vec<(String, Option<QueryScope>)>,
    /// Correlation keys produced by the last relation join, qualified
    /// against the joined alias.
    through_keys: Vec<(String, String)>,
}

impl Query {
    pub fn new(connection: Arc<Connection>, meta: ModelMeta) -> Self {
        let params = ParamBag::new(meta.alias.clone());
        Self {
            connection,
            meta,
            selects: Vec::new(),
            wheres: Condition::new(),
            havings: Condition::new(),
            groups: Vec::new(),
            orders: Vec::new(),
            joins: Vec::new(),
            size: 0,
            offset: 0,
            params,
            with: Vec::new(),
            with_counts: Vec::new(),
            through_keys: Vec::new(),
        }
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn params(&self) -> &ParamBag {
        &self.params
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn compiler(&self) -> Compiler {
        Compiler::new(self.meta.alias.clone())
    }

    /// Rename the model alias for this query. Placeholder names follow.
    pub fn set_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.meta.alias = alias.clone();
        self.params.set_alias(alias);
        self
    }

    /// Restart the parameter counter past `seq`, for sub-queries whose
    /// parameters merge into an outer statement.
    pub(crate) fn offset_params(mut self, seq: usize) -> Self {
        self.params = ParamBag::with_offset(self.meta.alias.clone(), seq);
        self
    }

    pub fn select(self, column: &str) -> Self {
        self.select_prefixed(column, None)
    }

    /// Select a column under a derived alias, optionally prefixed. Used by
    /// relation machinery to carry join keys out under predictable names.
    pub fn select_prefixed(mut self, column: &str, prefix: Option<&str>) -> Self {
        let expr = self.compiler().normalize_column(column);
        let alias = make_column_alias(&expr, prefix);
        self.selects.push((alias, expr));
        self
    }

    pub fn where_eq(self, column: &str, value: Value) -> Self {
        self.where_op(column, Operator::Equal, value)
    }

    pub fn or_where_eq(self, column: &str, value: Value) -> Self {
        self.add_where(Separator::Or, column, Operator::Equal, value)
    }

    pub fn where_op(self, column: &str, operator: Operator, value: Value) -> Self {
        self.add_where(Separator::And, column, operator, value)
    }

    pub fn or_where_op(self, column: &str, operator: Operator, value: Value) -> Self {
        self.add_where(Separator::Or, column, operator, value)
    }

    fn add_where(mut self, separator: Separator, column: &str, operator: Operator, value: Value) -> Self {
        let compiler = self.compiler();
        self.wheres
            .add(separator, column, operator, value, &compiler, &mut self.params);
        self
    }

    /// AND one equality per pair.
    pub fn where_all(mut self, pairs: &[(&str, Value)]) -> Self {
        for (column, value) in pairs {
            self = self.where_eq(column, value.clone());
        }
        self
    }

    pub fn where_in(self, column: &str, values: Vec<Value>) -> Self {
        self.where_op(column, Operator::In, Value::Array(values))
    }

    pub fn where_not_in(self, column: &str, values: Vec<Value>) -> Self {
        self.where_op(column, Operator::NotIn, Value::Array(values))
    }

    pub fn where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(&mut ConditionScope<'_>),
    {
        self.add_where_group(Separator::And, build)
    }

    pub fn or_where_group<F>(self, build: F) -> Self
    where
        F: FnOnce(&mut ConditionScope<'_>),
    {
        self.add_where_group(Separator::Or, build)
    }

    fn add_where_group<F>(mut self, separator: Separator, build: F) -> Self
    where
        F: FnOnce(&mut ConditionScope<'_>),
    {
        let compiler = self.compiler();
        self.wheres
            .add_group(separator, &compiler, &mut self.params, build);
        self
    }

    pub fn where_raw(mut self, expression: Expression) -> Self {
        self.wheres.add_raw(Separator::And, expression);
        self
    }

    pub fn or_where_raw(mut self, expression: Expression) -> Self {
        self.wheres.add_raw(Separator::Or, expression);
        self
    }

    pub fn having_op(mut self, column: &str, operator: Operator, value: Value) -> Self {
        let compiler = self.compiler();
        self.havings
            .add(Separator::And, column, operator, value, &compiler, &mut self.params);
        self
    }

    pub fn having_raw(mut self, expression: Expression) -> Self {
        self.havings.add_raw(Separator::And, expression);
        self
    }

    /// Group on the bare column name; the select list carries the
    /// qualified version.
    pub fn group_by(mut self, column: &str) -> Self {
        let normalized = self.compiler().normalize_column(column);
        let bare = normalized
            .rsplit('.')
            .next()
            .unwrap_or(normalized.as_str())
            .to_string();
        self.groups.push(bare);
        self
    }

    pub fn order_by(mut self, column: &str, sort: Sort) -> Self {
        let normalized = self.compiler().normalize_column(column);
        self.orders.push((normalized, sort));
        self
    }

    /// A size of zero means unlimited.
    pub fn limit(mut self, size: u64, offset: u64) -> Self {
        self.size = size;
        self.offset = offset;
        self
    }

    /// Render the statement with `{{ name }}` table templates and named
    /// placeholders still in place.
    pub fn to_sql(&self) -> String {
        let compiler = self.compiler();
        let mut sql = format!(
            "SELECT {} FROM {} AS {}",
            compiler.build_selected_column(&self.selects),
            self.meta.source(),
            quote(&self.meta.alias),
        );
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&compiler.build_condition(&self.wheres));
        }
        if !self.groups.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&compiler.build_group_by(&self.groups));
        }
        if !self.havings.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&compiler.build_condition(&self.havings));
        }
        if !self.orders.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&compiler.build_order_by(&self.orders));
        }
        if self.size > 0 {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", self.size, self.offset));
        }
        sql
    }

    /// The statement after prefix templating, as the driver will see it
    /// modulo placeholder markers.
    pub fn to_compiled_sql(&self) -> String {
        self.connection.prepare(&self.to_sql())
    }

    /// Fetch every matching record, with eager relations and counts loaded.
    pub async fn all(self) -> OrmResult<Collection> {
        self.all_boxed().await
    }

    /// Boxed form of [`Query::all`]. Relation scopes can nest eager loads
    /// arbitrarily deep, so the future is boxed to keep its size finite.
    pub fn all_boxed(self) -> Pin<Box<dyn Future<Output = OrmResult<Collection>> + Send>> {
        Box::pin(self.all_inner())
    }

    /// Hydrate fetched rows into records. `before_find` runs on each record
    /// here, before any relations are attached.
    fn hydrate_rows(&self, rows: Vec<Attributes>) -> Vec<Record> {
        rows.into_iter()
            .map(|attributes| {
                let mut record = Record::hydrate(self.meta.clone(), attributes);
                (self.meta.hooks.before_find)(&mut record);
                record
            })
            .collect()
    }

    async fn all_inner(self) -> OrmResult<Collection> {
        let rows = self.connection.fetch_all(&self.to_sql(), &self.params).await?;
        let mut records = self.hydrate_rows(rows);

        if !records.is_empty() {
            let mut maps: HashMap<String, Vec<Value>> = HashMap::new();
            for (name, scope) in &self.with {
                self.eager_load(&mut records, name, scope.clone(), &mut maps, false)
                    .await?;
            }
            for (name, scope) in &self.with_counts {
                self.eager_load(&mut records, name, scope.clone(), &mut maps, true)
                    .await?;
            }
        }

        for record in &mut records {
            (self.meta.hooks.after_find)(record);
        }
        Ok(Collection::new(records))
    }

    /// Fetch the first matching record, if any.
    pub async fn first(self) -> OrmResult<Option<Record>> {
        let offset = self.offset;
        let query = self.limit(1, offset);

        let rows = query
            .connection
            .fetch_all(&query.to_sql(), &query.params)
            .await?;
        let mut records = query.hydrate_rows(rows);
        if records.is_empty() {
            return Ok(None);
        }
        let mut maps: HashMap<String, Vec<Value>> = HashMap::new();
        for (name, scope) in &query.with {
            query
                .eager_load(&mut records, name, scope.clone(), &mut maps, false)
                .await?;
        }
        for (name, scope) in &query.with_counts {
            query
                .eager_load(&mut records, name, scope.clone(), &mut maps, true)
                .await?;
        }

        let mut record = records.remove(0);
        (query.meta.hooks.after_find)(&mut record);
        Ok(Some(record))
    }

    /// Count matching rows. The clause state is kept; the select list is
    /// replaced wholesale.
    pub async fn count(&self) -> OrmResult<i64> {
        let mut query = self.clone();
        query.selects = vec![("`count`".to_string(), "count(*)".to_string())];
        query.orders.clear();
        query.with.clear();
        query.with_counts.clear();
        let rows = query
            .connection
            .fetch_all(&query.to_sql(), &query.params)
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("count"))
            .map(as_integer)
            .unwrap_or(0))
    }

    pub async fn max(&self, column: &str) -> OrmResult<Option<Value>> {
        self.aggregate("max", column).await
    }

    pub async fn min(&self, column: &str) -> OrmResult<Option<Value>> {
        self.aggregate("min", column).await
    }

    async fn aggregate(&self, function: &str, column: &str) -> OrmResult<Option<Value>> {
        let mut query = self.clone();
        let expr = query
            .compiler()
            .normalize_column(&format!("{function}({column})"));
        let alias = make_column_alias(&expr, None);
        let name = alias.trim_matches('`').to_string();
        query.selects = vec![(alias, expr)];
        query.orders.clear();
        query.with.clear();
        query.with_counts.clear();
        let rows = query
            .connection
            .fetch_all(&query.to_sql(), &query.params)
            .await?;
        Ok(rows.into_iter().next().and_then(|mut row| row.remove(&name)))
    }

    /// Fetch one column of the first matching row.
    pub async fn value(&self, column: &str) -> OrmResult<Option<Value>> {
        let mut query = self.clone();
        let expr = query.compiler().normalize_column(column);
        let alias = make_column_alias(&expr, None);
        let name = alias.trim_matches('`').to_string();
        query.selects = vec![(alias, expr)];
        query.with.clear();
        query.with_counts.clear();
        query = query.limit(1, 0);
        let rows = query
            .connection
            .fetch_all(&query.to_sql(), &query.params)
            .await?;
        Ok(rows.into_iter().next().and_then(|mut row| row.remove(&name)))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.meta.table)
            .field("alias", &self.meta.alias)
            .field("sql", &self.to_sql())
            .finish()
    }
}

/// Best-effort integer reading of a driver value.
pub(crate) fn as_integer(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        Value::Bool(b) => i64::from(*b),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use serde_json::json;

    fn user_query() -> Query {
        let connection = Arc::new(Connection::new(ConnectionConfig::new().prefix("app_")));
        Query::new(connection, ModelMeta::new("user", "u"))
    }

    #[test]
    fn default_query_selects_everything_without_trailing_clauses() {
        assert_eq!(user_query().to_sql(), "SELECT `u`.* FROM {{ user }} AS `u`");
    }

    #[test]
    fn compiled_sql_applies_the_table_prefix() {
        assert_eq!(
            user_query().to_compiled_sql(),
            "SELECT `u`.* FROM `app_user` AS `u`"
        );
    }

    #[test]
    fn clauses_render_in_fixed_order() {
        let query = user_query()
            .select("id")
            .select("name")
            .where_eq("status", json!("active"))
            .group_by("name")
            .having_op("count(id)", Operator::GreaterThan, json!(1))
            .order_by("name", Sort::Asc)
            .limit(10, 20);
        assert_eq!(
            query.to_sql(),
            "SELECT `u`.`id` AS `id`, `u`.`name` AS `name` \
             FROM {{ user }} AS `u` \
             WHERE `u`.`status` = :bind_u_0 \
             GROUP BY `name` \
             HAVING count(`u`.`id`) > :bind_u_1 \
             ORDER BY `u`.`name` ASC \
             LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn or_where_joins_with_or() {
        let query = user_query()
            .where_eq("a", json!(1))
            .or_where_eq("b", json!(2));
        assert_eq!(
            query.to_sql(),
            "SELECT `u`.* FROM {{ user }} AS `u` WHERE `u`.`a` = :bind_u_0 OR `u`.`b` = :bind_u_1"
        );
        assert_eq!(query.params().get(":bind_u_0"), Some(&json!(1)));
        assert_eq!(query.params().get(":bind_u_1"), Some(&json!(2)));
    }

    #[test]
    fn where_group_nests_parenthesized() {
        let query = user_query()
            .where_eq("status", json!("active"))
            .where_group(|scope| {
                scope
                    .add("age", Operator::GreaterThan, json!(18))
                    .or("vip", Operator::Equal, json!(true));
            });
        assert_eq!(
            query.to_sql(),
            "SELECT `u`.* FROM {{ user }} AS `u` \
             WHERE `u`.`status` = :bind_u_0 AND (`u`.`age` > :bind_u_1 OR `u`.`vip` = :bind_u_2)"
        );
    }

    #[test]
    fn set_alias_renames_existing_and_future_placeholders_scope() {
        let query = user_query().set_alias("author").where_eq("id", json!(1));
        assert_eq!(
            query.to_sql(),
            "SELECT `author`.* FROM {{ user }} AS `author` WHERE `author`.`id` = :bind_author_0"
        );
    }

    #[test]
    fn zero_size_means_no_limit_clause() {
        let query = user_query().limit(0, 10);
        assert_eq!(query.to_sql(), "SELECT `u`.* FROM {{ user }} AS `u`");
    }

    fn stamp_audited(record: &mut Record) {
        record.set("audited", json!(true));
    }

    #[test]
    fn before_find_runs_on_each_hydrated_record() {
        let connection = Arc::new(Connection::new(ConnectionConfig::new()));
        let mut meta = ModelMeta::new("user", "u");
        meta.hooks.before_find = stamp_audited;
        let query = Query::new(connection, meta);

        let mut row = Attributes::new();
        row.insert("id".to_string(), json!(1));
        let records = query.hydrate_rows(vec![row]);
        assert_eq!(records[0].get("audited"), Some(&json!(true)));
        assert_eq!(records[0].get("id"), Some(&json!(1)));
    }

    #[test]
    fn as_integer_reads_driver_shapes() {
        assert_eq!(as_integer(&json!(3)), 3);
        assert_eq!(as_integer(&json!("3")), 3);
        assert_eq!(as_integer(&json!(null)), 0);
    }
}
