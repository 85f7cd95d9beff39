use std::fmt;

use common::dump::DumpError;
use common::sql::{Endpoint, SqlError};
use thiserror::Error;

use crate::verify::MissingObject;

/// Sub-step of a table transfer that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStep {
    ClearDestination,
    CaptureTriggers,
    DropTrigger,
    RenameTable,
    ReplayTrigger,
    RecreateTable,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            TransferStep::ClearDestination => "clearing destination",
            TransferStep::CaptureTriggers => "capturing triggers",
            TransferStep::DropTrigger => "dropping trigger",
            TransferStep::RenameTable => "renaming table",
            TransferStep::ReplayTrigger => "replaying trigger",
            TransferStep::RecreateTable => "recreating table",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("Failed to connect to {endpoint}: {source}")]
    Connection {
        endpoint: Endpoint,
        #[source]
        source: SqlError,
    },

    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error(
        "No target matched on {endpoint} (databases={databases:?}, tables={tables:?})"
    )]
    EmptyTarget {
        endpoint: Endpoint,
        databases: Vec<String>,
        tables: Vec<String>,
    },

    #[error("Databases still in use: {}", .databases.join(", "))]
    InUse { databases: Vec<String> },

    #[error("Source database '{database}' is not part of the resolved target")]
    UnknownSource { database: String },

    #[error("Invalid rename request {from} -> {to}: {reason}")]
    InvalidRequest {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Failed to transfer {database}.{table} to {destination} while {step}: {source}")]
    Transfer {
        database: String,
        table: String,
        destination: String,
        step: TransferStep,
        #[source]
        source: SqlError,
    },

    #[error("Lost triggers of {database}.{table} after: {cause}; definitions: {}", .statements.join("; "))]
    TriggerRestore {
        database: String,
        table: String,
        statements: Vec<String>,
        cause: String,
        #[source]
        source: SqlError,
    },

    #[error("Schema dump of '{database}' failed: {source}")]
    Dump {
        database: String,
        #[source]
        source: DumpError,
    },

    #[error("Failed to replay objects into '{database}': {message}")]
    Replay { database: String, message: String },

    #[error("Refusing to drop '{from}': not trans-clean against '{to}', missing {}", format_missing(.missing))]
    NotTransClean {
        from: String,
        to: String,
        missing: Vec<MissingObject>,
    },

    #[error("Refusing to drop '{database}': {reason}")]
    UnsafeDrop { database: String, reason: String },

    #[error("{failed} of {total} instances failed")]
    PartialFailure { failed: usize, total: usize },
}

fn format_missing(missing: &[MissingObject]) -> String {
    missing
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T, E = MutationError> = std::result::Result<T, E>;
