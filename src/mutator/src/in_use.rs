use std::collections::BTreeSet;
use std::time::Duration;

use common::config::InUseConfig;
use common::sql::SqlExecutor;

use crate::error::{MutationError, Result};

/// Detects databases that still see traffic.
///
/// After a `FLUSH TABLES` only tables that are actively reopened show up in
/// `SHOW OPEN TABLES`. A database is considered in use when it is reported
/// open in every sample of the window.
pub struct InUseDetector<'a> {
    exec: &'a dyn SqlExecutor,
    samples: usize,
    interval: Duration,
}

impl<'a> InUseDetector<'a> {
    pub fn new(exec: &'a dyn SqlExecutor, config: &InUseConfig) -> Self {
        Self {
            exec,
            samples: config.samples,
            interval: config.interval,
        }
    }

    /// Subset of `candidates` still open after the whole sampling window.
    pub async fn databases_in_use(&self, candidates: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        let endpoint = self.exec.endpoint();
        self.exec.exec("FLUSH TABLES", &[]).await?;

        let mut remaining = candidates.clone();
        for sample in 0..self.samples {
            if remaining.is_empty() {
                break;
            }
            if sample > 0 {
                tokio::time::sleep(self.interval).await;
            }

            let rows = self.exec.query("SHOW OPEN TABLES", &[]).await?;
            let open: BTreeSet<&str> = rows.iter().filter_map(|r| r.get("Database")).collect();
            remaining.retain(|db| open.contains(db.as_str()));

            tracing::debug!(
                host = %endpoint.host,
                port = endpoint.port,
                sample = sample + 1,
                open = remaining.len(),
                "Sampled open tables"
            );
        }

        Ok(remaining)
    }

    /// Fail closed when any candidate is still in use.
    pub async fn ensure_idle(&self, candidates: &BTreeSet<String>) -> Result<()> {
        let busy = self.databases_in_use(candidates).await?;
        if busy.is_empty() {
            return Ok(());
        }

        let endpoint = self.exec.endpoint();
        tracing::warn!(
            host = %endpoint.host,
            port = endpoint.port,
            databases = ?busy,
            "Databases still in use"
        );
        Err(MutationError::InUse {
            databases: busy.into_iter().collect(),
        })
    }
}
