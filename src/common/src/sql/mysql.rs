use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row};
use tokio::sync::Mutex;

use super::{Connector, Endpoint, SqlError, SqlExecutor, SqlParam, SqlResult, SqlRow};
use crate::config::MysqlConfig;

/// [`SqlExecutor`] over a single dedicated MySQL connection.
///
/// Statements without parameters go over the text protocol so DDL that
/// cannot be prepared (`CREATE TRIGGER`, `FLUSH TABLES`, `USE`) works;
/// parameterized statements are prepared and bound.
pub struct MySqlExecutor {
    endpoint: Endpoint,
    conn: Mutex<MySqlConnection>,
    statement_timeout: Duration,
}

impl MySqlExecutor {
    pub async fn connect(endpoint: &Endpoint, config: &MysqlConfig) -> SqlResult<Self> {
        tracing::debug!(host = %endpoint.host, port = endpoint.port, "Connecting to MySQL instance");

        let options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&config.user)
            .password(&config.password);

        let conn = tokio::time::timeout(config.connect_timeout, options.connect())
            .await
            .map_err(|_| SqlError::Connect {
                endpoint: endpoint.clone(),
                message: format!("timed out after {:?}", config.connect_timeout),
            })?
            .map_err(|e| {
                tracing::error!(host = %endpoint.host, port = endpoint.port, error = %e, "Failed to connect to MySQL instance");
                SqlError::Connect {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                }
            })?;

        Ok(Self {
            endpoint: endpoint.clone(),
            conn: Mutex::new(conn),
            statement_timeout: config.statement_timeout,
        })
    }

    /// Close the session gracefully.
    pub async fn close(self) -> SqlResult<()> {
        self.conn.into_inner().close().await?;
        Ok(())
    }

    fn timed_out(&self, sql: &str) -> SqlError {
        SqlError::Timeout {
            sql: sql.to_string(),
            timeout: self.statement_timeout,
        }
    }
}

#[async_trait]
impl SqlExecutor for MySqlExecutor {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> SqlResult<Vec<SqlRow>> {
        let mut guard = self.conn.lock().await;
        let conn: &mut MySqlConnection = &mut guard;
        let rows = if params.is_empty() {
            tokio::time::timeout(self.statement_timeout, conn.fetch_all(sqlx::raw_sql(sql))).await
        } else {
            let query = bind_all(sqlx::query(sql), params);
            tokio::time::timeout(self.statement_timeout, conn.fetch_all(query)).await
        }
        .map_err(|_| self.timed_out(sql))?
        .map_err(map_driver_error)?;
        rows.iter().map(decode_row).collect()
    }

    async fn exec(&self, sql: &str, params: &[SqlParam]) -> SqlResult<u64> {
        let mut guard = self.conn.lock().await;
        let conn: &mut MySqlConnection = &mut guard;
        let result = if params.is_empty() {
            tokio::time::timeout(self.statement_timeout, conn.execute(sqlx::raw_sql(sql))).await
        } else {
            let query = bind_all(sqlx::query(sql), params);
            tokio::time::timeout(self.statement_timeout, conn.execute(query)).await
        }
        .map_err(|_| self.timed_out(sql))?
        .map_err(map_driver_error)?;
        Ok(result.rows_affected())
    }
}

/// Opens one [`MySqlExecutor`] per endpoint with shared credentials.
#[derive(Clone, Debug)]
pub struct MySqlConnector {
    config: MysqlConfig,
}

impl MySqlConnector {
    pub fn new(config: MysqlConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self, endpoint: &Endpoint) -> SqlResult<Arc<dyn SqlExecutor>> {
        let executor = MySqlExecutor::connect(endpoint, &self.config).await?;
        Ok(Arc::new(executor))
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    params: &[SqlParam],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value.clone()),
            SqlParam::Int(value) => query.bind(*value),
        };
    }
    query
}

fn map_driver_error(err: sqlx::Error) -> SqlError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(mysql_err) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
            return SqlError::Server {
                code: mysql_err.number(),
                message: db_err.message().to_string(),
            };
        }
    }
    SqlError::Driver(err)
}

fn decode_row(row: &MySqlRow) -> SqlResult<SqlRow> {
    let mut columns = Vec::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        columns.push((column.name().to_string(), decode_column(row, index)?));
    }
    Ok(SqlRow::new(columns))
}

// information_schema and SHOW output mix VARCHAR, BIGINT and binary-collated
// columns; everything is surfaced as text.
fn decode_column(row: &MySqlRow, index: usize) -> SqlResult<Option<String>> {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return Ok(value);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return Ok(value.map(|v| v.to_string()));
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return Ok(value.map(|v| v.to_string()));
    }
    let value = row
        .try_get::<Option<Vec<u8>>, _>(index)
        .map_err(|e| SqlError::Decode(e.to_string()))?;
    Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}
