//! Schema dump/import collaborator.
//!
//! The non-table object mover needs two things from the outside world: a
//! schema-only SQL dump of one database, and a forced replay of a SQL file
//! into another database whose per-statement errors land in a separate log.
//! Both are delegated to the MySQL client binaries. Plain storage nodes and
//! the routing tier need different client flags, so each topology gets its
//! own [`SchemaDumper`] implementation; [`dumper_for`] picks one.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::config::{DumpConfig, MysqlConfig};
use crate::sql::Endpoint;

/// Storage topology an instance belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// A plain MySQL node, addressed directly
    #[default]
    Plain,
    /// A protocol-compatible proxy fanning statements out to shards
    RoutingTier,
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema dump of '{database}' failed ({status}): {stderr}")]
    Failed {
        database: String,
        status: String,
        stderr: String,
    },
}

pub type DumpResult<T> = Result<T, DumpError>;

/// Outcome of a forced import. Statement errors are never fatal to the
/// import itself; they are written to the error log for the caller to judge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportStatus {
    pub success: bool,
}

#[async_trait]
pub trait SchemaDumper: Send + Sync {
    /// Write the schema-only DDL of `database` (tables, views, routines,
    /// events, triggers) to `output`.
    async fn dump_schema(
        &self,
        endpoint: &Endpoint,
        database: &str,
        output: &Path,
    ) -> DumpResult<()>;

    /// Replay `script` into `database`, continuing past failing statements
    /// and writing their diagnostics to `error_log`, one per line.
    async fn import(
        &self,
        endpoint: &Endpoint,
        database: &str,
        script: &Path,
        error_log: &Path,
    ) -> DumpResult<ImportStatus>;
}

/// Select the dumper matching `topology`.
pub fn dumper_for(
    topology: Topology,
    dump: DumpConfig,
    mysql: MysqlConfig,
    admin_statement: &str,
) -> Arc<dyn SchemaDumper> {
    let tools = ClientTools { dump, mysql };
    match topology {
        Topology::Plain => Arc::new(NodeDumper { tools }),
        Topology::RoutingTier => Arc::new(RoutingTierDumper {
            tools,
            admin_statement: admin_statement.to_string(),
        }),
    }
}

const SCHEMA_ONLY_FLAGS: &[&str] = &[
    "--no-data",
    "--routines",
    "--events",
    "--triggers",
    "--skip-add-drop-table",
    "--set-gtid-purged=OFF",
];

#[derive(Clone, Debug)]
struct ClientTools {
    dump: DumpConfig,
    mysql: MysqlConfig,
}

impl ClientTools {
    fn connection_args(&self, endpoint: &Endpoint) -> Vec<String> {
        vec![
            format!("--host={}", endpoint.host),
            format!("--port={}", endpoint.port),
            format!("--user={}", self.mysql.user),
        ]
    }

    fn command(&self, bin: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(bin);
        cmd.args(args)
            // keeps the password off the process list
            .env("MYSQL_PWD", &self.mysql.password)
            .kill_on_drop(true);
        cmd
    }

    async fn run_dump(&self, database: &str, args: Vec<String>) -> DumpResult<()> {
        tracing::debug!(database = %database, bin = %self.dump.mysqldump_bin.display(), "Running schema dump");
        let output = self
            .command(&self.dump.mysqldump_bin, &args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(DumpError::Failed {
                database: database.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn run_import(
        &self,
        database: &str,
        args: Vec<String>,
        script: &Path,
        error_log: &Path,
    ) -> DumpResult<ImportStatus> {
        tracing::debug!(database = %database, script = %script.display(), "Replaying schema script");
        let input = tokio::fs::File::open(script).await?.into_std().await;
        let log = tokio::fs::File::create(error_log).await?.into_std().await;

        let status = self
            .command(&self.dump.mysql_bin, &args)
            .stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .status()
            .await?;

        Ok(ImportStatus {
            success: status.success(),
        })
    }
}

/// Dumps and imports directly against a storage node.
#[derive(Clone, Debug)]
pub struct NodeDumper {
    tools: ClientTools,
}

impl NodeDumper {
    fn dump_args(&self, endpoint: &Endpoint, database: &str, output: &Path) -> Vec<String> {
        let mut args = self.tools.connection_args(endpoint);
        args.extend(SCHEMA_ONLY_FLAGS.iter().map(|f| f.to_string()));
        args.push("--single-transaction".to_string());
        args.push(format!("--result-file={}", output.display()));
        args.push("--databases".to_string());
        args.push(database.to_string());
        args
    }

    fn import_args(&self, endpoint: &Endpoint, database: &str) -> Vec<String> {
        let mut args = self.tools.connection_args(endpoint);
        args.push("--force".to_string());
        args.push(format!("--database={database}"));
        args
    }
}

#[async_trait]
impl SchemaDumper for NodeDumper {
    async fn dump_schema(
        &self,
        endpoint: &Endpoint,
        database: &str,
        output: &Path,
    ) -> DumpResult<()> {
        let args = self.dump_args(endpoint, database, output);
        self.tools.run_dump(database, args).await
    }

    async fn import(
        &self,
        endpoint: &Endpoint,
        database: &str,
        script: &Path,
        error_log: &Path,
    ) -> DumpResult<ImportStatus> {
        let args = self.import_args(endpoint, database);
        self.tools
            .run_import(database, args, script, error_log)
            .await
    }
}

/// Dumps and imports through the routing tier. The proxy rejects table
/// locks, tablespace and column-statistics queries, and needs the admin
/// session flag before it routes DDL to the shards.
#[derive(Clone, Debug)]
pub struct RoutingTierDumper {
    tools: ClientTools,
    admin_statement: String,
}

impl RoutingTierDumper {
    fn dump_args(&self, endpoint: &Endpoint, database: &str, output: &Path) -> Vec<String> {
        let mut args = self.tools.connection_args(endpoint);
        args.extend(SCHEMA_ONLY_FLAGS.iter().map(|f| f.to_string()));
        args.push("--skip-lock-tables".to_string());
        args.push("--no-tablespaces".to_string());
        args.push("--column-statistics=0".to_string());
        args.push(format!("--result-file={}", output.display()));
        args.push("--databases".to_string());
        args.push(database.to_string());
        args
    }

    fn import_args(&self, endpoint: &Endpoint, database: &str) -> Vec<String> {
        let mut args = self.tools.connection_args(endpoint);
        args.push("--force".to_string());
        args.push(format!("--init-command={}", self.admin_statement));
        args.push(format!("--database={database}"));
        args
    }
}

#[async_trait]
impl SchemaDumper for RoutingTierDumper {
    async fn dump_schema(
        &self,
        endpoint: &Endpoint,
        database: &str,
        output: &Path,
    ) -> DumpResult<()> {
        let args = self.dump_args(endpoint, database, output);
        self.tools.run_dump(database, args).await
    }

    async fn import(
        &self,
        endpoint: &Endpoint,
        database: &str,
        script: &Path,
        error_log: &Path,
    ) -> DumpResult<ImportStatus> {
        let args = self.import_args(endpoint, database);
        self.tools
            .run_import(database, args, script, error_log)
            .await
    }
}
