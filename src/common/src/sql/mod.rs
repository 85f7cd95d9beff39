//! SQL execution interface consumed by the mutation pipelines.
//!
//! Every pipeline talks to an instance through [`SqlExecutor`]: row-set
//! queries, scalar queries and statement execution, each bounded by the
//! statement timeout of the implementation. Identifiers are always spliced
//! through [`quote_ident`]; values always travel as bound [`SqlParam`]s.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mysql;

pub use mysql::{MySqlConnector, MySqlExecutor};

/// Address of one storage instance or of the routing tier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A value bound to a `?` placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
}

impl From<&str> for SqlParam {
    fn from(value: &str) -> Self {
        SqlParam::Text(value.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(value: String) -> Self {
        SqlParam::Text(value)
    }
}

impl From<i64> for SqlParam {
    fn from(value: i64) -> Self {
        SqlParam::Int(value)
    }
}

/// One result row, columns kept in server order and rendered as text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SqlRow {
    columns: Vec<(String, Option<String>)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, Option<String>)>) -> Self {
        Self { columns }
    }

    /// Value of the named column. Column names compare case-insensitively,
    /// as MySQL reports them.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn get_index(&self, index: usize) -> Option<&str> {
        self.columns
            .get(index)
            .and_then(|(_, value)| value.as_deref())
    }

    /// Typed accessor failing with a decode error when the column is
    /// missing or NULL.
    pub fn require(&self, column: &str) -> SqlResult<&str> {
        self.get(column)
            .ok_or_else(|| SqlError::Decode(format!("column '{column}' missing or NULL")))
    }
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: Endpoint, message: String },

    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Statement timed out after {timeout:?}: {sql}")]
    Timeout { sql: String, timeout: Duration },

    #[error("Failed to decode result: {0}")]
    Decode(String),

    #[error("Driver error: {0}")]
    Driver(#[from] sqlx::Error),
}

impl SqlError {
    /// MySQL error number when the server rejected the statement.
    pub fn server_code(&self) -> Option<u16> {
        match self {
            SqlError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type SqlResult<T> = Result<T, SqlError>;

/// Exclusive session with one instance.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Instance this session is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Run a row-returning statement.
    async fn query(&self, sql: &str, params: &[SqlParam]) -> SqlResult<Vec<SqlRow>>;

    /// First column of the first row, `None` when the result set is empty
    /// or the value is NULL.
    async fn query_scalar(&self, sql: &str, params: &[SqlParam]) -> SqlResult<Option<String>> {
        let rows = self.query(sql, params).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .map(str::to_string))
    }

    /// Run a statement and return the number of affected rows.
    async fn exec(&self, sql: &str, params: &[SqlParam]) -> SqlResult<u64>;
}

/// Opens exclusive sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> SqlResult<Arc<dyn SqlExecutor>>;
}

/// Quote an identifier with backticks, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a `database.object` pair.
pub fn qualified(database: &str, object: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(object))
}
