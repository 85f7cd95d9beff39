//! Trans-clean verification.
//!
//! A source database is trans-clean against a destination when every object
//! it still holds has a same-named counterpart there. This is the only gate
//! in front of an irrevocable `DROP DATABASE`.

use std::fmt;

use common::sql::{SqlExecutor, SqlParam, quote_ident};
use serde::Serialize;

use crate::error::{MutationError, Result};

/// Schema object kinds compared by the verifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    BaseTable,
    Trigger,
    Event,
    Routine,
    View,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 5] = [
        ObjectKind::BaseTable,
        ObjectKind::Trigger,
        ObjectKind::Event,
        ObjectKind::Routine,
        ObjectKind::View,
    ];

    fn kinds(only_base_tables: bool) -> &'static [ObjectKind] {
        if only_base_tables {
            &Self::ALL[..1]
        } else {
            &Self::ALL
        }
    }

    fn list_sql(self) -> &'static str {
        match self {
            ObjectKind::BaseTable => {
                "SELECT TABLE_NAME FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'"
            }
            ObjectKind::Trigger => {
                "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS WHERE TRIGGER_SCHEMA = ?"
            }
            ObjectKind::Event => {
                "SELECT EVENT_NAME FROM information_schema.EVENTS WHERE EVENT_SCHEMA = ?"
            }
            ObjectKind::Routine => {
                "SELECT ROUTINE_NAME FROM information_schema.ROUTINES WHERE ROUTINE_SCHEMA = ?"
            }
            ObjectKind::View => {
                "SELECT TABLE_NAME FROM information_schema.VIEWS WHERE TABLE_SCHEMA = ?"
            }
        }
    }

    fn count_sql(self) -> &'static str {
        match self {
            ObjectKind::BaseTable => {
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND TABLE_TYPE = 'BASE TABLE'"
            }
            ObjectKind::Trigger => {
                "SELECT COUNT(*) FROM information_schema.TRIGGERS \
                 WHERE TRIGGER_SCHEMA = ? AND TRIGGER_NAME = ?"
            }
            ObjectKind::Event => {
                "SELECT COUNT(*) FROM information_schema.EVENTS \
                 WHERE EVENT_SCHEMA = ? AND EVENT_NAME = ?"
            }
            ObjectKind::Routine => {
                "SELECT COUNT(*) FROM information_schema.ROUTINES \
                 WHERE ROUTINE_SCHEMA = ? AND ROUTINE_NAME = ?"
            }
            ObjectKind::View => {
                "SELECT COUNT(*) FROM information_schema.VIEWS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?"
            }
        }
    }

    fn name_column(self) -> &'static str {
        match self {
            ObjectKind::BaseTable | ObjectKind::View => "TABLE_NAME",
            ObjectKind::Trigger => "TRIGGER_NAME",
            ObjectKind::Event => "EVENT_NAME",
            ObjectKind::Routine => "ROUTINE_NAME",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ObjectKind::BaseTable => "table",
            ObjectKind::Trigger => "trigger",
            ObjectKind::Event => "event",
            ObjectKind::Routine => "routine",
            ObjectKind::View => "view",
        };
        f.write_str(kind)
    }
}

/// An object of the source without a counterpart in the destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MissingObject {
    pub kind: ObjectKind,
    pub name: String,
}

impl fmt::Display for MissingObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

pub struct TransCleanVerifier<'a> {
    exec: &'a dyn SqlExecutor,
}

impl<'a> TransCleanVerifier<'a> {
    pub fn new(exec: &'a dyn SqlExecutor) -> Self {
        Self { exec }
    }

    pub async fn list_objects(&self, database: &str, kind: ObjectKind) -> Result<Vec<String>> {
        let rows = self
            .exec
            .query(kind.list_sql(), &[SqlParam::from(database)])
            .await?;
        let names = rows
            .iter()
            .map(|row| row.require(kind.name_column()).map(str::to_string))
            .collect::<common::sql::SqlResult<Vec<_>>>()?;
        Ok(names)
    }

    pub async fn exists(&self, database: &str, kind: ObjectKind, name: &str) -> Result<bool> {
        let count = self
            .exec
            .query_scalar(
                kind.count_sql(),
                &[SqlParam::from(database), SqlParam::from(name)],
            )
            .await?;
        Ok(count.is_some_and(|c| c.trim() != "0"))
    }

    /// Objects of `from` that `to` lacks, by name.
    pub async fn missing_objects(
        &self,
        from: &str,
        to: &str,
        only_base_tables: bool,
    ) -> Result<Vec<MissingObject>> {
        let mut missing = Vec::new();
        for &kind in ObjectKind::kinds(only_base_tables) {
            for name in self.list_objects(from, kind).await? {
                if !self.exists(to, kind, &name).await? {
                    missing.push(MissingObject { kind, name });
                }
            }
        }
        Ok(missing)
    }

    pub async fn is_trans_clean(&self, from: &str, to: &str, only_base_tables: bool) -> Result<bool> {
        Ok(self.missing_objects(from, to, only_base_tables).await?.is_empty())
    }

    /// `DROP DATABASE from`, re-checking trans-cleanliness right before.
    pub async fn drop_database(&self, from: &str, to: &str, only_base_tables: bool) -> Result<()> {
        let endpoint = self.exec.endpoint();
        if from == to {
            return Err(MutationError::UnsafeDrop {
                database: from.to_string(),
                reason: "source and destination are the same database".to_string(),
            });
        }

        let missing = self.missing_objects(from, to, only_base_tables).await?;
        if !missing.is_empty() {
            tracing::error!(
                host = %endpoint.host,
                port = endpoint.port,
                database = from,
                destination = to,
                missing = missing.len(),
                "Refusing to drop database that is not trans-clean"
            );
            return Err(MutationError::NotTransClean {
                from: from.to_string(),
                to: to.to_string(),
                missing,
            });
        }

        self.exec
            .exec(&format!("DROP DATABASE IF EXISTS {}", quote_ident(from)), &[])
            .await?;
        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            database = from,
            destination = to,
            only_base_tables,
            "Dropped database"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::FakeMysql;

    fn populated() -> FakeMysql {
        FakeMysql::new("h", 3306)
            .with_table("old", "t1", 1)
            .with_trigger("old", "t1", "trg1")
            .with_view("old", "v1")
            .with_routine("old", "p1")
            .with_event("old", "e1")
            .with_table("new", "t1", 1)
            .with_trigger("new", "t1", "trg1")
            .with_view("new", "v1")
            .with_routine("new", "p1")
    }

    #[tokio::test]
    async fn test_drop_refused_until_equivalent() {
        let server = populated();
        let session = server.session();
        let verifier = TransCleanVerifier::new(&session);

        let err = verifier.drop_database("old", "new", false).await.unwrap_err();
        match err {
            MutationError::NotTransClean { missing, .. } => {
                assert_eq!(
                    missing,
                    vec![MissingObject {
                        kind: ObjectKind::Event,
                        name: "e1".to_string()
                    }]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(server.has_database("old"));

        let server = server.with_event("new", "e1");
        verifier.drop_database("old", "new", false).await.unwrap();
        assert!(!server.has_database("old"));
    }

    #[tokio::test]
    async fn test_base_tables_only_ignores_other_objects() {
        let server = FakeMysql::new("h", 3306)
            .with_table("src", "t1", 0)
            .with_view("src", "v1")
            .with_table("stage_1_src", "t1", 0);
        let session = server.session();
        let verifier = TransCleanVerifier::new(&session);

        assert!(!verifier.is_trans_clean("src", "stage_1_src", false).await.unwrap());
        assert!(verifier.is_trans_clean("src", "stage_1_src", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_source_is_trans_clean() {
        let server = FakeMysql::new("h", 3306).with_database("src");
        let session = server.session();
        let verifier = TransCleanVerifier::new(&session);

        assert!(verifier.is_trans_clean("src", "missing", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_drop_refuses_same_database() {
        let server = FakeMysql::new("h", 3306).with_table("db", "t1", 0);
        let session = server.session();
        let verifier = TransCleanVerifier::new(&session);

        let err = verifier.drop_database("db", "db", false).await.unwrap_err();
        assert!(matches!(err, MutationError::UnsafeDrop { .. }));
        assert!(server.has_database("db"));
    }
}
