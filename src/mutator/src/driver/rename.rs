use std::collections::BTreeSet;

use common::sql::{Endpoint, SqlExecutor};
use serde::{Deserialize, Serialize};

use super::{DriverContext, InstanceReport, PipelineState, RunReport, resolve_timestamp};
use crate::error::{MutationError, Result};
use crate::in_use::InUseDetector;
use crate::mover::NonTableMover;
use crate::stage::StageEngine;
use crate::target::{ResolvedFilter, Target, TargetFilter, resolve_targets};
use crate::verify::TransCleanVerifier;

/// Permanently rename `from` to `to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub from: String,
    pub to: String,
}

impl RenameRequest {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenameParams {
    pub host: String,
    pub ports: Vec<u16>,
    /// Applied in order on every instance
    pub requests: Vec<RenameRequest>,
}

impl DriverContext {
    /// Rename databases on unsharded instances: objects are moved into the
    /// destination and the source is dropped once it is trans-clean.
    pub async fn rename(&self, params: &RenameParams) -> RunReport {
        let mut run = RunReport::new(resolve_timestamp(None));

        for &port in &params.ports {
            let endpoint = Endpoint::new(params.host.clone(), port);
            let mut report = InstanceReport::new(endpoint.clone(), None);
            tracing::info!(
                host = %endpoint.host,
                port,
                requests = params.requests.len(),
                "Starting rename"
            );

            let outcome = match self.connect(&endpoint).await {
                Ok(exec) => {
                    self.run_rename(exec.as_ref(), &mut report, &params.requests)
                        .await
                }
                Err(e) => Err(e),
            };
            report.finish(outcome);
            run.instances.push(report);
        }

        run
    }

    async fn run_rename(
        &self,
        exec: &dyn SqlExecutor,
        report: &mut InstanceReport,
        requests: &[RenameRequest],
    ) -> Result<()> {
        for request in requests {
            validate_request(request)?;
        }

        let filter = TargetFilter::databases(requests.iter().map(|r| r.from.clone()));
        let filter = ResolvedFilter::new(&filter, &self.config.naming, None);
        let target = resolve_targets(exec, &filter).await?;
        report.advance(PipelineState::TargetResolved);

        let sources: BTreeSet<String> = target.keys().cloned().collect();
        InUseDetector::new(exec, &self.config.in_use)
            .ensure_idle(&sources)
            .await?;

        let mover = NonTableMover::new(self.dumper.clone(), self.config.dump.work_dir.clone());
        for request in requests {
            if let Err(e) = self
                .apply_request(exec, &target, &mover, report, request)
                .await
            {
                report.failed_request = Some(format!("{} -> {}", request.from, request.to));
                return Err(e);
            }
        }
        Ok(())
    }

    async fn apply_request(
        &self,
        exec: &dyn SqlExecutor,
        target: &Target,
        mover: &NonTableMover,
        report: &mut InstanceReport,
        request: &RenameRequest,
    ) -> Result<()> {
        let tables = source_tables(target, request)?;
        let engine = StageEngine::new(exec);
        let verifier = TransCleanVerifier::new(exec);
        let endpoint = exec.endpoint();

        engine.create_database(&request.to).await?;
        report.advance(PipelineState::Staged);

        mover
            .move_objects(endpoint, &request.from, &request.to)
            .await?;

        for table in tables {
            let record = engine.transfer_table(&request.from, &request.to, table).await?;
            engine
                .replay_triggers(&request.to, std::slice::from_ref(&record))
                .await?;
            report.tables_transferred += 1;
        }
        report.advance(PipelineState::Transferred);

        verifier
            .drop_database(&request.from, &request.to, false)
            .await?;
        report.advance(PipelineState::Dropped);

        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            database = %request.from,
            destination = %request.to,
            tables = tables.len(),
            "Renamed database"
        );
        Ok(())
    }
}

fn validate_request(request: &RenameRequest) -> Result<()> {
    let reason = if request.from.is_empty() || request.to.is_empty() {
        "database names cannot be empty"
    } else if request.from == request.to {
        "source and destination are the same database"
    } else if [&request.from, &request.to]
        .iter()
        .any(|name| name.contains(['%', '*', '?']))
    {
        "database names cannot contain wildcards"
    } else {
        return Ok(());
    };
    Err(MutationError::InvalidRequest {
        from: request.from.clone(),
        to: request.to.clone(),
        reason: reason.to_string(),
    })
}

fn source_tables<'t>(target: &'t Target, request: &RenameRequest) -> Result<&'t BTreeSet<String>> {
    target
        .get(&request.from)
        .ok_or_else(|| MutationError::UnknownSource {
            database: request.from.clone(),
        })
}
