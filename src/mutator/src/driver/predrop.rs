use common::sql::{Endpoint, SqlExecutor};
use serde::{Deserialize, Serialize};

use super::{DriverContext, InstanceReport, PipelineState, RunReport, ShardMap};
use crate::error::Result;
use crate::stage::{StageEngine, stage_database_name};
use crate::target::{ResolvedFilter, TargetFilter, resolve_targets};

/// Drop the stage databases left behind by an earlier truncate run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreDropParams {
    pub host: String,
    pub shards: ShardMap,
    pub has_shard: bool,
    pub filter: TargetFilter,
    /// Timestamp of the run whose stage databases are dropped
    pub timestamp: String,
}

impl DriverContext {
    /// Resolve the same targets as the truncate run and drop their stage
    /// databases. Sources are never touched.
    pub async fn pre_drop(&self, params: &PreDropParams) -> RunReport {
        let mut run = RunReport::new(params.timestamp.clone());

        for (&port, &shard_id) in &params.shards {
            let shard = params.has_shard.then_some(shard_id);
            let endpoint = Endpoint::new(params.host.clone(), port);
            let mut report = InstanceReport::new(endpoint.clone(), shard);
            tracing::info!(
                host = %endpoint.host,
                port,
                shard_id = ?shard,
                timestamp = %params.timestamp,
                "Starting pre-drop"
            );

            let filter = ResolvedFilter::new(&params.filter, &self.config.naming, shard);
            let outcome = match self.connect(&endpoint).await {
                Ok(exec) => {
                    self.run_pre_drop(exec.as_ref(), &mut report, &filter, &params.timestamp)
                        .await
                }
                Err(e) => Err(e),
            };
            report.finish(outcome);
            run.instances.push(report);
        }

        run
    }

    async fn run_pre_drop(
        &self,
        exec: &dyn SqlExecutor,
        report: &mut InstanceReport,
        filter: &ResolvedFilter,
        timestamp: &str,
    ) -> Result<()> {
        let naming = &self.config.naming;
        let target = resolve_targets(exec, filter).await?;
        report.advance(PipelineState::TargetResolved);

        let engine = StageEngine::new(exec);
        for database in target.keys() {
            let stage = stage_database_name(&naming.stage_header, timestamp, database);
            engine.drop_stage_database(naming, &stage).await?;
            report.stage_databases.push(stage);
        }
        report.advance(PipelineState::Dropped);
        Ok(())
    }
}
