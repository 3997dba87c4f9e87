//! MySQL connection wrapper.
//!
//! Owns the single driver handle, the table-prefix templating, and the
//! named-placeholder rewrite. SQL arrives here with `{{ name }}` table
//! templates and `:bind_*` placeholders; it leaves as driver-ready text with
//! positional `?` markers and values bound in match order.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{ConnectOptions, Connection as _};
use tracing::debug;

use crate::error::{OrmError, OrmResult};
use crate::params::ParamBag;
use crate::value::{bind_value, row_attributes, Attributes};

static TABLE_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid regex"));

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":bind_[A-Za-z0-9_]+").expect("valid regex"));

/// Connection settings. Either a full URL or the individual parts; the
/// prefix applies to every `{{ name }}` table template.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub prefix: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: String::new(),
            prefix: String::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `DATABASE_URL` and `TABLE_PREFIX` from the environment.
    pub fn from_env() -> OrmResult<Self> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| OrmError::Configuration("DATABASE_URL is not set".to_string()))?;
        Ok(Self {
            url: Some(url),
            prefix: std::env::var("TABLE_PREFIX").unwrap_or_default(),
            ..Self::default()
        })
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn connect_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            ),
        }
    }
}

/// One logged statement.
#[derive(Debug, Clone)]
pub struct QueryLog {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

/// Lazily-connected MySQL handle.
pub struct Connection {
    config: ConnectionConfig,
    handle: tokio::sync::Mutex<Option<MySqlConnection>>,
    in_transaction: AtomicBool,
    log: std::sync::Mutex<Vec<QueryLog>>,
}

impl Connection {
    /// A connection starts disconnected; the handle opens on first use.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            handle: tokio::sync::Mutex::new(None),
            in_transaction: AtomicBool::new(false),
            log: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn connect(&self) -> OrmResult<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let options: MySqlConnectOptions = self
            .config
            .connect_url()
            .parse()
            .map_err(|e: sqlx::Error| OrmError::Configuration(e.to_string()))?;
        let connection = options
            .connect()
            .await
            .map_err(|e| OrmError::Connection(e.to_string()))?;
        *guard = Some(connection);
        debug!(host = %self.config.host, "database connection opened");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    /// Close the handle. An open transaction is rolled back first.
    pub async fn disconnect(&self) -> OrmResult<()> {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.run_control("ROLLBACK").await?;
        }
        let mut guard = self.handle.lock().await;
        if let Some(connection) = guard.take() {
            connection
                .close()
                .await
                .map_err(|e| OrmError::Connection(e.to_string()))?;
        }
        Ok(())
    }

    /// Rewrite `{{ name }}` table templates into quoted, prefixed names.
    pub fn prepare(&self, sql: &str) -> String {
        TABLE_TEMPLATE
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                format!("`{}{}`", self.config.prefix, &caps[1])
            })
            .into_owned()
    }

    /// Replace named placeholders with positional markers, returning the
    /// values in the order they must be bound. Every placeholder in the SQL
    /// must exist in the bag.
    fn rewrite(&self, sql: &str, params: &ParamBag) -> OrmResult<(String, Vec<Value>)> {
        let mut rewritten = String::with_capacity(sql.len());
        let mut values = Vec::new();
        let mut last = 0;
        for found in PLACEHOLDER.find_iter(sql) {
            let name = found.as_str();
            let value = params
                .get(name)
                .ok_or_else(|| OrmError::Query(format!("unbound parameter {name}")))?;
            rewritten.push_str(&sql[last..found.start()]);
            rewritten.push('?');
            values.push(value.clone());
            last = found.end();
        }
        rewritten.push_str(&sql[last..]);
        Ok((rewritten, values))
    }

    /// Run a SELECT and decode every row into an attribute map.
    pub async fn fetch_all(&self, sql: &str, params: &ParamBag) -> OrmResult<Vec<Attributes>> {
        self.connect().await?;
        let prepared = self.prepare(sql);
        let (rewritten, values) = self.rewrite(&prepared, params)?;
        self.record(&prepared, params);

        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| OrmError::Connection("connection is closed".to_string()))?;
        let mut query = sqlx::query(&rewritten);
        for value in values {
            query = bind_value(query, value);
        }
        let rows = query
            .fetch_all(handle)
            .await
            .map_err(|e| OrmError::Query(e.to_string()))?;
        Ok(rows.iter().map(row_attributes).collect())
    }

    /// Run a write statement.
    pub async fn execute(&self, sql: &str, params: &ParamBag) -> OrmResult<ExecOutcome> {
        self.connect().await?;
        let prepared = self.prepare(sql);
        let (rewritten, values) = self.rewrite(&prepared, params)?;
        self.record(&prepared, params);

        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| OrmError::Connection("connection is closed".to_string()))?;
        let mut query = sqlx::query(&rewritten);
        for value in values {
            query = bind_value(query, value);
        }
        let done = query
            .execute(handle)
            .await
            .map_err(|e| OrmError::Query(e.to_string()))?;
        Ok(ExecOutcome {
            rows_affected: done.rows_affected(),
            last_insert_id: done.last_insert_id(),
        })
    }

    pub async fn begin(&self) -> OrmResult<()> {
        if !self.in_transaction.swap(true, Ordering::SeqCst) {
            self.run_control("BEGIN").await?;
        }
        Ok(())
    }

    pub async fn commit(&self) -> OrmResult<()> {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.run_control("COMMIT").await?;
        }
        Ok(())
    }

    pub async fn rollback(&self) -> OrmResult<()> {
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            self.run_control("ROLLBACK").await?;
        }
        Ok(())
    }

    async fn run_control(&self, sql: &str) -> OrmResult<()> {
        self.connect().await?;
        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| OrmError::Connection("connection is closed".to_string()))?;
        sqlx::query(sql)
            .execute(handle)
            .await
            .map_err(|e| OrmError::Query(e.to_string()))?;
        debug!(statement = sql, "transaction control");
        Ok(())
    }

    fn record(&self, sql: &str, params: &ParamBag) {
        debug!(sql, params = params.len(), "executing statement");
        if let Ok(mut log) = self.log.lock() {
            log.push(QueryLog {
                sql: sql.to_string(),
                params: params.values().to_vec(),
            });
        }
    }

    /// Statements issued so far, in order.
    pub fn log(&self) -> Vec<QueryLog> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("prefix", &self.config.prefix)
            .finish()
    }
}
