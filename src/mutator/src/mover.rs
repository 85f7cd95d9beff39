//! Non-table object mover.
//!
//! Views, routines, events and triggers cannot be renamed across schemas.
//! They are carried over by dumping the schema DDL of the source database and
//! replaying it into the destination. The replay runs with `--force`
//! semantics; its error log is then judged line by line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::dump::{DumpError, SchemaDumper};
use common::sql::Endpoint;
use tempfile::TempDir;

use crate::error::{MutationError, Result};

/// Server error numbers meaning "object already exists". A replay hitting
/// only these has nothing left to do.
pub const RECOVERABLE_CODES: &[u16] = &[1050, 1304, 1537, 1359, 1007];

/// Remove the `CREATE DATABASE` and `USE` statements a `--databases` dump
/// carries, so the script applies to whichever database it is imported into.
pub fn strip_database_statements(script: &str) -> String {
    let mut stripped = String::with_capacity(script.len());
    for line in script.lines() {
        let upper = line.trim_start().to_ascii_uppercase();
        if upper.starts_with("CREATE DATABASE") || upper.starts_with("USE ") {
            continue;
        }
        stripped.push_str(line);
        stripped.push('\n');
    }
    stripped
}

/// Lines of an import error log that were tolerated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub recovered: Vec<String>,
}

fn error_code(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("ERROR ")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Judge an import error log.
///
/// Blank lines and client `[Warning]` lines are ignored, duplicate-object
/// errors are recovered, anything else fails the replay with the offending
/// lines joined together.
pub fn check_import_log(database: &str, log: &str, exited_ok: bool) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    let mut fatal = Vec::new();

    for line in log.lines().map(str::trim) {
        if line.is_empty() || line.contains("[Warning]") {
            continue;
        }
        match error_code(line) {
            Some(code) if RECOVERABLE_CODES.contains(&code) => {
                summary.recovered.push(line.to_string());
            }
            _ => fatal.push(line),
        }
    }

    if !fatal.is_empty() {
        return Err(MutationError::Replay {
            database: database.to_string(),
            message: fatal.join("\n"),
        });
    }
    if !exited_ok && summary.recovered.is_empty() {
        return Err(MutationError::Replay {
            database: database.to_string(),
            message: "import failed without diagnostics".to_string(),
        });
    }
    Ok(summary)
}

pub struct NonTableMover {
    dumper: Arc<dyn SchemaDumper>,
    work_dir: Option<PathBuf>,
}

impl NonTableMover {
    pub fn new(dumper: Arc<dyn SchemaDumper>, work_dir: Option<PathBuf>) -> Self {
        Self { dumper, work_dir }
    }

    fn scratch(&self) -> Result<TempDir> {
        let dir = match &self.work_dir {
            Some(base) => tempfile::Builder::new().prefix("schemaops-").tempdir_in(base),
            None => tempfile::Builder::new().prefix("schemaops-").tempdir(),
        };
        dir.map_err(|e| MutationError::Dump {
            database: String::new(),
            source: e.into(),
        })
    }

    /// Copy every non-table object of `from` into `to` on the same instance.
    pub async fn move_objects(&self, endpoint: &Endpoint, from: &str, to: &str) -> Result<ReplaySummary> {
        let scratch = self.scratch()?;
        let dump_err = |database: &str| {
            let database = database.to_string();
            move |source: DumpError| MutationError::Dump { database, source }
        };

        let dump_path = scratch.path().join(format!("{from}.sql"));
        self.dumper
            .dump_schema(endpoint, from, &dump_path)
            .await
            .map_err(dump_err(from))?;

        let script = tokio::fs::read_to_string(&dump_path)
            .await
            .map_err(|e| dump_err(from)(e.into()))?;
        let replay_path = scratch.path().join(format!("{from}.replay.sql"));
        tokio::fs::write(&replay_path, strip_database_statements(&script))
            .await
            .map_err(|e| dump_err(from)(e.into()))?;

        let log_path = scratch.path().join(format!("{to}.err"));
        let status = self
            .dumper
            .import(endpoint, to, &replay_path, &log_path)
            .await
            .map_err(dump_err(to))?;
        let log = read_log(&log_path).await.map_err(|e| dump_err(to)(e.into()))?;

        let summary = check_import_log(to, &log, status.success).inspect_err(|e| {
            tracing::error!(
                host = %endpoint.host,
                port = endpoint.port,
                database = from,
                destination = to,
                error = %e,
                "Replay of non-table objects failed"
            );
        })?;
        for line in &summary.recovered {
            tracing::warn!(
                host = %endpoint.host,
                port = endpoint.port,
                database = to,
                line = %line,
                "Recovered duplicate object during replay"
            );
        }
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            database = from,
            destination = to,
            "Moved non-table objects"
        );
        Ok(summary)
    }
}

async fn read_log(path: &Path) -> std::io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(log) => Ok(log),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}
