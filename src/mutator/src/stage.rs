//! Stage databases and table transfer.
//!
//! Tables leave a source database by `RENAME TABLE` into a stage database
//! named `<header>_<timestamp>_<source>`. MySQL refuses to rename a table
//! across schemas while triggers are attached, so each transfer captures the
//! trigger definitions, drops them, renames, and hands the captured
//! statements back for replay at the destination.
//!
//! Every step is written so that re-running a half-finished transfer is
//! safe: destinations are cleared first, all DDL uses `IF [NOT] EXISTS`, and
//! triggers dropped from a table that then fails to move are put back.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use common::config::NamingConfig;
use common::sql::{SqlError, SqlExecutor, SqlParam, SqlResult, qualified, quote_ident};
use serde::Serialize;

use crate::error::{MutationError, Result, TransferStep};

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// `<header>_<timestamp>_<database>`.
pub fn stage_database_name(header: &str, timestamp: &str, database: &str) -> String {
    format!("{header}_{timestamp}_{database}")
}

pub fn run_timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// One relocated table and the trigger definitions removed from it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub database: String,
    pub destination: String,
    pub table: String,
    /// `CREATE TRIGGER` statements as reported by `SHOW CREATE TRIGGER`
    pub triggers: Vec<String>,
}

pub struct StageEngine<'a> {
    exec: &'a dyn SqlExecutor,
}

impl<'a> StageEngine<'a> {
    pub fn new(exec: &'a dyn SqlExecutor) -> Self {
        Self { exec }
    }

    pub async fn create_database(&self, name: &str) -> Result<()> {
        self.exec
            .exec(&format!("CREATE DATABASE IF NOT EXISTS {}", quote_ident(name)), &[])
            .await?;
        Ok(())
    }

    /// Move `from.table` to `to.table`, returning the triggers that have to be
    /// replayed once the table has landed.
    pub async fn transfer_table(&self, from: &str, to: &str, table: &str) -> Result<TransferRecord> {
        let endpoint = self.exec.endpoint();
        let fail = |step: TransferStep| {
            move |source: SqlError| {
                tracing::error!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    database = from,
                    table,
                    destination = to,
                    %step,
                    error = %source,
                    "Table transfer failed"
                );
                MutationError::Transfer {
                    database: from.to_string(),
                    table: table.to_string(),
                    destination: to.to_string(),
                    step,
                    source,
                }
            }
        };

        self.exec
            .exec(&format!("DROP TABLE IF EXISTS {}", qualified(to, table)), &[])
            .await
            .map_err(fail(TransferStep::ClearDestination))?;

        let captured = self
            .capture_triggers(from, table)
            .await
            .map_err(fail(TransferStep::CaptureTriggers))?;

        // dropped triggers go back onto the source if the transfer stops here
        let mut dropped = Vec::with_capacity(captured.len());
        for (name, statement) in &captured {
            if let Err(e) = self
                .exec
                .exec(&format!("DROP TRIGGER IF EXISTS {}", qualified(from, name)), &[])
                .await
            {
                let error = fail(TransferStep::DropTrigger)(e);
                return Err(self.restore_triggers(from, table, &dropped, error).await);
            }
            dropped.push(statement.clone());
        }

        if let Err(e) = self
            .exec
            .exec(
                &format!(
                    "RENAME TABLE {} TO {}",
                    qualified(from, table),
                    qualified(to, table)
                ),
                &[],
            )
            .await
        {
            let error = fail(TransferStep::RenameTable)(e);
            return Err(self.restore_triggers(from, table, &dropped, error).await);
        }

        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            database = from,
            table,
            destination = to,
            triggers = captured.len(),
            "Transferred table"
        );

        Ok(TransferRecord {
            database: from.to_string(),
            destination: to.to_string(),
            table: table.to_string(),
            triggers: captured.into_iter().map(|(_, stmt)| stmt).collect(),
        })
    }

    /// `(name, CREATE TRIGGER statement)` for every trigger on `database.table`.
    pub async fn capture_triggers(
        &self,
        database: &str,
        table: &str,
    ) -> SqlResult<Vec<(String, String)>> {
        let rows = self
            .exec
            .query(
                "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS \
                 WHERE EVENT_OBJECT_SCHEMA = ? AND EVENT_OBJECT_TABLE = ? \
                 ORDER BY ACTION_ORDER",
                &[SqlParam::from(database), SqlParam::from(table)],
            )
            .await?;

        let mut captured = Vec::with_capacity(rows.len());
        for row in &rows {
            let name = row.require("TRIGGER_NAME")?;
            let create = self
                .exec
                .query(&format!("SHOW CREATE TRIGGER {}", qualified(database, name)), &[])
                .await?;
            let statement = create
                .first()
                .ok_or_else(|| SqlError::Decode(format!("no definition for trigger {name}")))?
                .require("SQL Original Statement")?;
            captured.push((name.to_string(), statement.to_string()));
        }
        Ok(captured)
    }

    /// Put `statements` back on `database` after `error` interrupted a
    /// transfer. If that fails too, the definitions travel with the error.
    async fn restore_triggers(
        &self,
        database: &str,
        table: &str,
        statements: &[String],
        error: MutationError,
    ) -> MutationError {
        if statements.is_empty() {
            return error;
        }

        let endpoint = self.exec.endpoint();
        match self.run_in(database, statements).await {
            Ok(()) => {
                tracing::warn!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    database,
                    table,
                    triggers = statements.len(),
                    "Restored triggers after failed transfer"
                );
                error
            }
            Err(source) => {
                tracing::error!(
                    host = %endpoint.host,
                    port = endpoint.port,
                    database,
                    table,
                    definitions = ?statements,
                    error = %source,
                    "Failed to restore triggers after failed transfer"
                );
                MutationError::TriggerRestore {
                    database: database.to_string(),
                    table: table.to_string(),
                    statements: statements.to_vec(),
                    cause: error.to_string(),
                    source,
                }
            }
        }
    }

    async fn run_in(&self, database: &str, statements: &[String]) -> SqlResult<()> {
        self.exec
            .exec(&format!("USE {}", quote_ident(database)), &[])
            .await?;
        for statement in statements {
            self.exec.exec(statement, &[]).await?;
        }
        Ok(())
    }

    /// Give `database.table` the triggers its staged copy in `stage` carries.
    /// Triggers already present on `database.table` are left alone.
    pub async fn copy_triggers(&self, stage: &str, database: &str, table: &str) -> Result<usize> {
        let capture_failed = |source: SqlError| MutationError::Transfer {
            database: stage.to_string(),
            table: table.to_string(),
            destination: database.to_string(),
            step: TransferStep::CaptureTriggers,
            source,
        };
        let present: BTreeSet<String> = self
            .capture_triggers(database, table)
            .await
            .map_err(capture_failed)?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        let triggers: Vec<String> = self
            .capture_triggers(stage, table)
            .await
            .map_err(capture_failed)?
            .into_iter()
            .filter(|(name, _)| !present.contains(name))
            .map(|(_, statement)| statement)
            .collect();

        let copied = triggers.len();
        let record = TransferRecord {
            database: stage.to_string(),
            destination: database.to_string(),
            table: table.to_string(),
            triggers,
        };
        self.replay_triggers(database, std::slice::from_ref(&record))
            .await?;
        Ok(copied)
    }

    /// Recreate captured triggers inside `database`.
    pub async fn replay_triggers(&self, database: &str, records: &[TransferRecord]) -> Result<()> {
        if records.iter().all(|r| r.triggers.is_empty()) {
            return Ok(());
        }

        self.exec
            .exec(&format!("USE {}", quote_ident(database)), &[])
            .await?;
        for record in records {
            for statement in &record.triggers {
                self.exec.exec(statement, &[]).await.map_err(|source| {
                    MutationError::Transfer {
                        database: record.database.clone(),
                        table: record.table.clone(),
                        destination: database.to_string(),
                        step: TransferStep::ReplayTrigger,
                        source,
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Bring back an empty `source.table` shaped like its staged copy.
    pub async fn recreate_table(&self, source: &str, stage: &str, table: &str) -> Result<()> {
        self.exec
            .exec(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} LIKE {}",
                    qualified(source, table),
                    qualified(stage, table)
                ),
                &[],
            )
            .await
            .map_err(|source_err| MutationError::Transfer {
                database: stage.to_string(),
                table: table.to_string(),
                destination: source.to_string(),
                step: TransferStep::RecreateTable,
                source: source_err,
            })?;
        Ok(())
    }

    /// Drop a stage database. Anything not carrying the stage prefix is
    /// refused.
    pub async fn drop_stage_database(&self, naming: &NamingConfig, name: &str) -> Result<()> {
        let prefix = format!("{}_", naming.stage_header);
        if !name.starts_with(&prefix) || name.len() == prefix.len() {
            return Err(MutationError::UnsafeDrop {
                database: name.to_string(),
                reason: format!("not a stage database (expected prefix '{prefix}')"),
            });
        }

        self.exec
            .exec(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)), &[])
            .await?;
        let endpoint = self.exec.endpoint();
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            stage = name,
            "Dropped stage database"
        );
        Ok(())
    }
}
