use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;

use super::fake_mysql::FakeMysql;
use crate::dump::{DumpError, DumpResult, ImportStatus, SchemaDumper};
use crate::sql::{Endpoint, SqlExecutor, quote_ident};

/// [`SchemaDumper`] backed by [`FakeMysql`] instances.
///
/// Dumps are written in the layout of a `--databases` dump (leading
/// `CREATE DATABASE` and `USE` lines, one statement per line); imports replay
/// each statement through a fresh session and log failures the way the
/// `mysql` client does with `--force`.
#[derive(Clone, Debug, Default)]
pub struct FakeDumper {
    servers: BTreeMap<Endpoint, FakeMysql>,
    extra_log_lines: Vec<String>,
}

impl FakeDumper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: FakeMysql) -> Self {
        self.servers.insert(server.endpoint().clone(), server);
        self
    }

    /// Lines appended verbatim to every import error log.
    pub fn with_log_line(mut self, line: &str) -> Self {
        self.extra_log_lines.push(line.to_string());
        self
    }

    fn server(&self, endpoint: &Endpoint) -> DumpResult<&FakeMysql> {
        self.servers.get(endpoint).ok_or_else(|| DumpError::Failed {
            database: String::new(),
            status: "exit status: 2".to_string(),
            stderr: format!("Can't connect to MySQL server on '{endpoint}'"),
        })
    }
}

#[async_trait]
impl SchemaDumper for FakeDumper {
    async fn dump_schema(
        &self,
        endpoint: &Endpoint,
        database: &str,
        output: &Path,
    ) -> DumpResult<()> {
        let server = self.server(endpoint)?;
        if !server.has_database(database) {
            return Err(DumpError::Failed {
                database: database.to_string(),
                status: "exit status: 2".to_string(),
                stderr: format!("Got error: 1049: Unknown database '{database}'"),
            });
        }

        let mut script = String::from("-- schema dump\n");
        script.push_str(&format!(
            "CREATE DATABASE /*!32312 IF NOT EXISTS*/ {};\n",
            quote_ident(database)
        ));
        script.push_str(&format!("USE {};\n", quote_ident(database)));
        for statement in server.schema_ddl(database) {
            script.push_str(&statement);
            script.push_str(";\n");
        }
        tokio::fs::write(output, script).await?;
        Ok(())
    }

    async fn import(
        &self,
        endpoint: &Endpoint,
        database: &str,
        script: &Path,
        error_log: &Path,
    ) -> DumpResult<ImportStatus> {
        let server = self.server(endpoint)?;
        let session = server.session();
        let content = tokio::fs::read_to_string(script).await?;

        let mut log = String::new();
        if let Err(e) = session
            .exec(&format!("USE {}", quote_ident(database)), &[])
            .await
        {
            log.push_str(&format!("ERROR {}: {e}\n", e.server_code().unwrap_or(0)));
        }

        for (index, line) in content.lines().enumerate() {
            let statement = line.trim();
            if statement.is_empty() || statement.starts_with("--") {
                continue;
            }
            let statement = statement.trim_end_matches(';');
            if let Err(e) = session.exec(statement, &[]).await {
                let code = e.server_code().unwrap_or(0);
                let message = match e {
                    crate::sql::SqlError::Server { message, .. } => message,
                    other => other.to_string(),
                };
                log.push_str(&format!(
                    "ERROR {code} (HY000) at line {}: {message}\n",
                    index + 1
                ));
            }
        }
        let success = log.is_empty();
        for line in &self.extra_log_lines {
            log.push_str(line);
            log.push('\n');
        }
        tokio::fs::write(error_log, log).await?;

        Ok(ImportStatus { success })
    }
}
