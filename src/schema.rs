//! Additive schema builder.
//!
//! A [`Schema`] inspects `information_schema` for the prefixed table, then
//! renders either a `CREATE TABLE` or an `ALTER TABLE` that only adds what
//! is missing. Nothing is ever dropped or changed in place.

use std::sync::Arc;

use crate::compiler::quote;
use crate::connection::Connection;
use crate::error::OrmResult;
use crate::params::ParamBag;
use crate::query::as_integer;

/// MySQL column types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Binary,
    Blob,
    Char(Option<u32>),
    Date,
    DateTime,
    Decimal,
    Enum(Vec<String>),
    Int,
    LongBlob,
    LongText,
    MediumBlob,
    MediumInt,
    MediumText,
    SmallInt,
    Text,
    Time,
    Timestamp,
    TinyBlob,
    TinyText,
    Varchar(Option<u32>),
    Year,
}

impl ColumnType {
    fn sql(&self) -> String {
        match self {
            ColumnType::BigInt => "bigint".to_string(),
            ColumnType::Binary => "binary".to_string(),
            ColumnType::Blob => "blob".to_string(),
            ColumnType::Char(size) => format!("char({})", size.unwrap_or(255)),
            ColumnType::Date => "date".to_string(),
            ColumnType::DateTime => "datetime".to_string(),
            ColumnType::Decimal => "decimal".to_string(),
            ColumnType::Enum(members) => {
                let members: Vec<String> =
                    members.iter().map(|member| format!("'{member}'")).collect();
                format!("enum({})", members.join(", "))
            }
            ColumnType::Int => "int".to_string(),
            ColumnType::LongBlob => "longblob".to_string(),
            ColumnType::LongText => "longtext".to_string(),
            ColumnType::MediumBlob => "mediumblob".to_string(),
            ColumnType::MediumInt => "mediumint".to_string(),
            ColumnType::MediumText => "mediumtext".to_string(),
            ColumnType::SmallInt => "smallint".to_string(),
            ColumnType::Text => "text".to_string(),
            ColumnType::Time => "time".to_string(),
            ColumnType::Timestamp => "timestamp".to_string(),
            ColumnType::TinyBlob => "tinyblob".to_string(),
            ColumnType::TinyText => "tinytext".to_string(),
            ColumnType::Varchar(size) => format!("varchar({})", size.unwrap_or(255)),
            ColumnType::Year => "year".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnDef {
    name: String,
    type_sql: String,
    attr: String,
    default: Option<String>,
}

impl ColumnDef {
    fn render(&self, prefix: &str) -> String {
        let mut parts = vec![format!("{prefix}{} {}", quote(&self.name), self.type_sql)];
        if !self.attr.is_empty() {
            parts.push(self.attr.clone());
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {default}"));
        }
        parts.join(" ")
    }
}

/// Fluent DDL builder for one table.
#[derive(Debug)]
pub struct Schema {
    connection: Arc<Connection>,
    name: String,
    exists: bool,
    existing_columns: Vec<String>,
    columns: Vec<ColumnDef>,
    primaries: Vec<String>,
    uniques: Vec<(String, Vec<String>)>,
    indexes: Vec<(String, Vec<String>)>,
}

impl Schema {
    /// Inspect the (prefixed) table and start a builder against it.
    pub async fn new(connection: Arc<Connection>, name: impl Into<String>) -> OrmResult<Self> {
        let name = name.into();
        let table = format!("{}{}", connection.config().prefix, name);

        let mut params = ParamBag::new("schema");
        let bind = params.bind(table.clone().into());
        let sql = format!(
            "SELECT `COLUMN_NAME` FROM `information_schema`.`COLUMNS` \
             WHERE `TABLE_NAME` = {bind} AND `TABLE_SCHEMA` = DATABASE()"
        );
        let rows = connection.fetch_all(&sql, &params).await?;
        let existing_columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("COLUMN_NAME"))
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect();

        let mut params = ParamBag::new("schema");
        let bind = params.bind(table.into());
        let sql = format!(
            "SELECT COUNT(*) AS `count` FROM `information_schema`.`TABLES` \
             WHERE `TABLE_NAME` = {bind} AND `TABLE_SCHEMA` = DATABASE()"
        );
        let rows = connection.fetch_all(&sql, &params).await?;
        let exists = rows
            .first()
            .and_then(|row| row.get("count"))
            .map(as_integer)
            .unwrap_or(0)
            > 0;

        Ok(Self {
            connection,
            name,
            exists,
            existing_columns,
            columns: Vec::new(),
            primaries: Vec::new(),
            uniques: Vec::new(),
            indexes: Vec::new(),
        })
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.existing_columns.iter().any(|column| column == name)
    }

    /// Declare a column; the modifiers below apply to the most recent one.
    pub fn column(mut self, name: impl Into<String>, kind: ColumnType) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            type_sql: kind.sql(),
            attr: "NOT NULL".to_string(),
            default: None,
        });
        self
    }

    pub fn nullable(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.attr = column.attr.replace("NOT NULL", "NULL");
        }
        self
    }

    pub fn unsigned(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.attr = format!("UNSIGNED {}", column.attr);
        }
        self
    }

    pub fn increment(mut self) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.attr.push_str(" AUTO_INCREMENT");
        }
        self
    }

    /// `NULL` and `CURRENT_TIMESTAMP` pass through unquoted; anything else
    /// becomes a string literal.
    pub fn default_value(mut self, value: &str) -> Self {
        if let Some(column) = self.columns.last_mut() {
            column.default = Some(if value == "NULL" || value == "CURRENT_TIMESTAMP" {
                value.to_string()
            } else {
                format!("'{value}'")
            });
        }
        self
    }

    pub fn primary(mut self) -> Self {
        if let Some(column) = self.columns.last() {
            self.primaries.push(column.name.clone());
        }
        self
    }

    pub fn unique(mut self) -> Self {
        if let Some(column) = self.columns.last() {
            self.uniques.push((column.name.clone(), vec![column.name.clone()]));
        }
        self
    }

    pub fn unique_on(mut self, columns: &[&str]) -> Self {
        let key = columns.join("_");
        self.uniques
            .push((key, columns.iter().map(|c| (*c).to_string()).collect()));
        self
    }

    pub fn index(mut self) -> Self {
        if let Some(column) = self.columns.last() {
            self.indexes.push((column.name.clone(), vec![column.name.clone()]));
        }
        self
    }

    pub fn index_on(mut self, columns: &[&str]) -> Self {
        let key = columns.join("_");
        self.indexes
            .push((key, columns.iter().map(|c| (*c).to_string()).collect()));
        self
    }

    fn composite_exists(&self, columns: &[String]) -> bool {
        columns.iter().all(|column| self.has_column(column))
    }

    fn key_list(columns: &[String]) -> String {
        columns
            .iter()
            .map(|column| quote(column))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The statement this builder would run, or nothing when the table
    /// already carries everything declared.
    pub fn statement(&self) -> Option<String> {
        if !self.exists {
            let mut parts: Vec<String> =
                self.columns.iter().map(|column| column.render("")).collect();
            if !self.primaries.is_empty() {
                parts.push(format!("PRIMARY KEY({})", Self::key_list(&self.primaries)));
            }
            for (key, columns) in &self.uniques {
                parts.push(format!(
                    "UNIQUE KEY {} ({})",
                    quote(&format!("{}_{}_unique", self.name, key)),
                    Self::key_list(columns)
                ));
            }
            for (key, columns) in &self.indexes {
                parts.push(format!(
                    "KEY {} ({})",
                    quote(&format!("{}_{}_index", self.name, key)),
                    Self::key_list(columns)
                ));
            }
            if parts.is_empty() {
                return None;
            }
            return Some(format!(
                "CREATE TABLE {{{{ {} }}}} ({}) ENGINE=InnoDB",
                self.name,
                parts.join(", ")
            ));
        }

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .filter(|column| !self.has_column(&column.name))
            .map(|column| column.render("ADD COLUMN "))
            .collect();
        for (key, columns) in &self.uniques {
            if !self.composite_exists(columns) {
                parts.push(format!(
                    "ADD UNIQUE {} ({})",
                    quote(&format!("{}_{}_unique", self.name, key)),
                    Self::key_list(columns)
                ));
            }
        }
        for (key, columns) in &self.indexes {
            if !self.composite_exists(columns) {
                parts.push(format!(
                    "ADD INDEX {} ({})",
                    quote(&format!("{}_{}_index", self.name, key)),
                    Self::key_list(columns)
                ));
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(format!("ALTER TABLE {{{{ {} }}}} {}", self.name, parts.join(", ")))
    }

    /// Execute the pending statement, if any.
    pub async fn run(&self) -> OrmResult<()> {
        if let Some(sql) = self.statement() {
            self.connection.execute(&sql, &ParamBag::new("schema")).await?;
        }
        Ok(())
    }
}
