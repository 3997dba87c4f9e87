//! Persistence: insert/update, delete, and pivot synchronization.

use std::collections::HashSet;

use serde_json::Value;

use crate::compiler::quote;
use crate::condition::{Condition, Operator, Separator};
use crate::error::{OrmError, OrmResult};
use crate::model::Record;
use crate::params::ParamBag;
use crate::value::identifier;

use super::Query;

/// How [`Query::sync`] reconciles pivot rows with the requested set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Remove rows outside the set, then add the missing ones.
    Both,
    /// Only add missing rows.
    Attach,
    /// Only remove the listed rows.
    Detach,
}

impl Query {
    /// Persist a record: INSERT with a duplicate-key upsert for new records,
    /// UPDATE keyed on the loaded primary values otherwise. The record is
    /// re-fetched afterwards so database-computed columns come back.
    pub async fn save(self, record: &mut Record) -> OrmResult<()> {
        (self.meta.hooks.before_save)(record);
        if record.attributes().is_empty() {
            return Err(OrmError::Query("no attributes to save".to_string()));
        }
        let inserting = record.is_new();
        let (sql, params) = if inserting {
            self.insert_statement(record)
        } else {
            self.update_statement(record)
        };
        let outcome = self.connection.execute(&sql, &params).await?;

        if inserting && outcome.last_insert_id > 0 {
            if let [primary] = &self.meta.primary[..] {
                record.set(primary.clone(), Value::Number(outcome.last_insert_id.into()));
            }
        }

        let mut refetch = Query::new(self.connection.clone(), self.meta.clone());
        for column in &self.meta.primary {
            if let Some(value) = record.get(column) {
                refetch = refetch.where_eq(column, value.clone());
            }
        }
        if let Some(fresh) = refetch.first().await? {
            record.replace_from(fresh);
        }
        (self.meta.hooks.after_save)(record);
        Ok(())
    }

    pub(crate) fn insert_statement(&self, record: &Record) -> (String, ParamBag) {
        let mut params = ParamBag::new(self.meta.alias.clone());
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (column, value) in record.attributes() {
            columns.push(quote(column));
            values.push(params.bind(value.clone()));
        }
        let updates: Vec<String> = columns
            .iter()
            .zip(&values)
            .map(|(column, value)| format!("{column} = {value}"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            self.meta.source(),
            columns.join(", "),
            values.join(", "),
            updates.join(", ")
        );
        (sql, params)
    }

    /// The WHERE side comes from the loaded snapshot, so changing a primary
    /// key value still targets the row that was fetched.
    pub(crate) fn update_statement(&self, record: &Record) -> (String, ParamBag) {
        let mut params = ParamBag::new(self.meta.alias.clone());
        let compiler = self.compiler();
        let assignments: Vec<String> = record
            .attributes()
            .iter()
            .map(|(column, value)| format!("{} = {}", quote(column), params.bind(value.clone())))
            .collect();
        let mut condition = Condition::new();
        for column in &self.meta.primary {
            if let Some(value) = record.original().get(column) {
                condition.add(
                    Separator::And,
                    column,
                    Operator::Equal,
                    value.clone(),
                    &compiler,
                    &mut params,
                );
            }
        }
        let mut sql = format!(
            "UPDATE {} AS {} SET {}",
            self.meta.source(),
            quote(&self.meta.alias),
            assignments.join(", ")
        );
        if !condition.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&condition.compile());
        }
        (sql, params)
    }

    pub(crate) fn delete_statement(&self) -> String {
        let alias = quote(&self.meta.alias);
        let mut sql = format!(
            "DELETE FROM {} USING {} AS {}",
            alias,
            self.meta.source(),
            alias
        );
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.compile());
        }
        sql
    }

    /// Delete rows matching the accumulated WHERE clause.
    pub async fn delete(self) -> OrmResult<u64> {
        let sql = self.delete_statement();
        let outcome = self.connection.execute(&sql, &self.params).await?;
        Ok(outcome.rows_affected)
    }

    /// Delete one record by its loaded primary key values.
    pub async fn delete_record(mut self, record: &Record) -> OrmResult<u64> {
        let primary = self.meta.primary.clone();
        let mut keyed = false;
        for column in &primary {
            if let Some(value) = record.original().get(column) {
                self = self.where_eq(column, value.clone());
                keyed = true;
            }
        }
        if !keyed {
            return Err(OrmError::Query(
                "cannot delete a record that was never loaded".to_string(),
            ));
        }
        self.delete().await
    }

    /// Reconcile a pivot relation with `values`. The relation's keys anchor
    /// the pivot rows to this record; the remaining pivot primary column
    /// receives the values. Re-running with the same set is a no-op.
    pub async fn sync(
        &self,
        record: &Record,
        name: &str,
        values: Vec<Value>,
        mode: SyncMode,
    ) -> OrmResult<()> {
        let relation = self
            .resolve(name)
            .ok_or_else(|| OrmError::Condition(format!("unknown relation `{name}`")))?;
        let pivot = (relation.target)();
        let anchors: Vec<(String, Value)> = relation
            .keys
            .iter()
            .map(|(local, foreign)| {
                (
                    foreign.clone(),
                    record.get(local).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        let anchored: HashSet<&str> = anchors.iter().map(|(column, _)| column.as_str()).collect();
        let far = far_key(&pivot.primary, &anchored).ok_or_else(|| {
            OrmError::Condition(format!("relation `{name}` has no free pivot key to sync"))
        })?;

        if mode != SyncMode::Attach {
            let mut remove = Query::new(self.connection.clone(), pivot.clone());
            for (column, value) in &anchors {
                remove = remove.where_eq(column, value.clone());
            }
            if !values.is_empty() {
                let operator = if mode == SyncMode::Both {
                    Operator::NotIn
                } else {
                    Operator::In
                };
                remove = remove.where_op(&far, operator, Value::Array(values.clone()));
            }
            remove.delete().await?;
        }

        if mode != SyncMode::Detach && !values.is_empty() {
            let mut existing = Query::new(self.connection.clone(), pivot.clone());
            for (column, value) in &anchors {
                existing = existing.where_eq(column, value.clone());
            }
            existing = existing.select(&far);
            let rows = self
                .connection
                .fetch_all(&existing.to_sql(), existing.params())
                .await?;
            let current: Vec<Value> = rows
                .into_iter()
                .filter_map(|mut row| row.remove(&far))
                .collect();
            let missing = missing_targets(&values, &current);
            if !missing.is_empty() {
                let mut params = ParamBag::new(pivot.alias.clone());
                let mut columns: Vec<String> =
                    anchors.iter().map(|(column, _)| quote(column)).collect();
                columns.push(quote(&far));
                let anchor_binds: Vec<String> = anchors
                    .iter()
                    .map(|(_, value)| params.bind(value.clone()))
                    .collect();
                let rows_sql: Vec<String> = missing
                    .into_iter()
                    .map(|value| {
                        let mut cells = anchor_binds.clone();
                        cells.push(params.bind(value));
                        format!("({})", cells.join(", "))
                    })
                    .collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES {}",
                    pivot.source(),
                    columns.join(", "),
                    rows_sql.join(", ")
                );
                self.connection.execute(&sql, &params).await?;
            }
        }
        Ok(())
    }
}

/// The pivot primary column left over once the anchor columns are taken.
pub(crate) fn far_key(primary: &[String], anchored: &HashSet<&str>) -> Option<String> {
    primary
        .iter()
        .filter(|column| !anchored.contains(column.as_str()))
        .last()
        .cloned()
}

/// Values from `desired` not yet in `current`, compared by their stable
/// identifiers. Duplicates in `desired` collapse, so the insert plan is
/// empty exactly when nothing is missing.
pub(crate) fn missing_targets(desired: &[Value], current: &[Value]) -> Vec<Value> {
    let mut have: HashSet<String> = current.iter().map(identifier).collect();
    let mut missing = Vec::new();
    for value in desired {
        if have.insert(identifier(value)) {
            missing.push(value.clone());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionConfig};
    use crate::model::ModelMeta;
    use crate::value::Attributes;
    use serde_json::json;
    use std::sync::Arc;

    fn query() -> Query {
        let connection = Arc::new(Connection::new(ConnectionConfig::new()));
        Query::new(connection, ModelMeta::new("user", "u"))
    }

    fn loaded_record(pairs: &[(&str, Value)]) -> Record {
        let mut attributes = Attributes::new();
        for (name, value) in pairs {
            attributes.insert((*name).to_string(), value.clone());
        }
        Record::hydrate(ModelMeta::new("user", "u"), attributes)
    }

    #[test]
    fn insert_reuses_placeholders_in_the_upsert_clause() {
        let mut record = Record::new(ModelMeta::new("user", "u"));
        record.set("email", json!("a@b.c"));
        record.set("name", json!("ada"));
        let (sql, params) = query().insert_statement(&record);
        assert_eq!(
            sql,
            "INSERT INTO {{ user }} (`email`, `name`) VALUES (:bind_u_0, :bind_u_1) \
             ON DUPLICATE KEY UPDATE `email` = :bind_u_0, `name` = :bind_u_1"
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn update_targets_the_premutation_primary_key() {
        let mut record = loaded_record(&[("id", json!(7)), ("name", json!("before"))]);
        record.set("id", json!(99));
        record.set("name", json!("after"));
        let (sql, params) = query().update_statement(&record);
        assert_eq!(
            sql,
            "UPDATE {{ user }} AS `u` SET `id` = :bind_u_0, `name` = :bind_u_1 \
             WHERE `u`.`id` = :bind_u_2"
        );
        assert_eq!(params.get(":bind_u_0"), Some(&json!(99)));
        assert_eq!(params.get(":bind_u_2"), Some(&json!(7)));
    }

    #[test]
    fn delete_uses_the_alias_using_form() {
        let q = query().where_eq("id", json!(1));
        assert_eq!(
            q.delete_statement(),
            "DELETE FROM `u` USING {{ user }} AS `u` WHERE `u`.`id` = :bind_u_0"
        );
    }

    #[test]
    fn missing_targets_is_empty_when_everything_is_present() {
        let desired = vec![json!(1), json!(2)];
        let current = vec![json!(1), json!(2), json!(3)];
        assert!(missing_targets(&desired, &current).is_empty());
    }

    #[test]
    fn missing_targets_returns_only_the_absent_values() {
        let desired = vec![json!(1), json!(2)];
        let current = vec![json!(2)];
        assert_eq!(missing_targets(&desired, &current), vec![json!(1)]);
    }

    #[test]
    fn missing_targets_collapses_duplicates_and_matches_across_types() {
        let desired = vec![json!(1), json!(1), json!("2")];
        let current = vec![json!(2)];
        assert_eq!(missing_targets(&desired, &current), vec![json!(1)]);
    }

    #[test]
    fn far_key_is_the_remaining_pivot_primary_column() {
        let primary = vec!["role_id".to_string(), "child_id".to_string()];
        let mut anchored = HashSet::new();
        anchored.insert("role_id");
        assert_eq!(far_key(&primary, &anchored), Some("child_id".to_string()));
        anchored.insert("child_id");
        assert_eq!(far_key(&primary, &anchored), None);
    }
}
