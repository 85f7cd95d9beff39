use std::collections::{BTreeMap, BTreeSet};

use common::sql::{Endpoint, SqlExecutor, quote_ident};
use serde::{Deserialize, Serialize};

use super::{DriverContext, InstanceReport, PipelineState, RunReport, ShardMap, resolve_timestamp};
use crate::error::Result;
use crate::in_use::InUseDetector;
use crate::stage::{StageEngine, stage_database_name};
use crate::target::{ResolvedFilter, TargetFilter, resolve_targets};
use crate::verify::{ObjectKind, TransCleanVerifier};

/// What happens to the source once its tables sit in the stage database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateMode {
    /// Recreate every staged table empty, with its triggers
    #[default]
    TruncateTable,
    /// Drop the emptied source database
    DropDatabase,
    /// Leave the source without the moved tables
    DropTable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TruncateParams {
    pub host: String,
    pub shards: ShardMap,
    /// Pin database patterns to each port's shard
    pub has_shard: bool,
    pub filter: TargetFilter,
    pub mode: TruncateMode,
    /// Reuse the timestamp of an earlier run to resume it
    pub timestamp: Option<String>,
}

impl DriverContext {
    /// Move the targeted tables of every shard into stage databases and
    /// finish according to `mode`.
    pub async fn truncate(&self, params: &TruncateParams) -> RunReport {
        let timestamp = resolve_timestamp(params.timestamp.as_deref());
        let mut run = RunReport::new(timestamp.clone());

        for (&port, &shard_id) in &params.shards {
            let shard = params.has_shard.then_some(shard_id);
            let endpoint = Endpoint::new(params.host.clone(), port);
            let mut report = InstanceReport::new(endpoint.clone(), shard);

            tracing::info!(
                host = %endpoint.host,
                port,
                shard_id = ?shard,
                mode = ?params.mode,
                %timestamp,
                "Starting truncate"
            );

            let filter = ResolvedFilter::new(&params.filter, &self.config.naming, shard);
            let outcome = match self.connect(&endpoint).await {
                Ok(exec) => {
                    self.run_truncate(exec.as_ref(), &mut report, &filter, params.mode, &timestamp)
                        .await
                }
                Err(e) => Err(e),
            };
            report.finish(outcome);
            run.instances.push(report);
        }

        run
    }

    /// Truncate pipeline on an open session.
    pub(super) async fn run_truncate(
        &self,
        exec: &dyn SqlExecutor,
        report: &mut InstanceReport,
        filter: &ResolvedFilter,
        mode: TruncateMode,
        timestamp: &str,
    ) -> Result<()> {
        let naming = &self.config.naming;
        let endpoint = exec.endpoint().clone();

        let target = resolve_targets(exec, filter).await?;
        report.advance(PipelineState::TargetResolved);

        let databases: BTreeSet<String> = target.keys().cloned().collect();
        InUseDetector::new(exec, &self.config.in_use)
            .ensure_idle(&databases)
            .await?;

        let engine = StageEngine::new(exec);
        let stages: BTreeMap<&str, String> = target
            .keys()
            .map(|db| (db.as_str(), stage_database_name(&naming.stage_header, timestamp, db)))
            .collect();
        for stage in stages.values() {
            engine.create_database(stage).await?;
            report.stage_databases.push(stage.clone());
            report
                .cleanup
                .push(format!("DROP DATABASE IF EXISTS {}", quote_ident(stage)));
        }
        report.advance(PipelineState::Staged);

        let verifier = TransCleanVerifier::new(exec);
        for (database, tables) in &target {
            let stage = &stages[database.as_str()];
            // a table already in the stage was moved by an earlier run with
            // this timestamp; the staged copy holds the rows and is kept
            let staged: BTreeSet<String> = verifier
                .list_objects(stage, ObjectKind::BaseTable)
                .await?
                .into_iter()
                .collect();
            for table in tables {
                if staged.contains(table) {
                    tracing::warn!(
                        host = %endpoint.host,
                        port = endpoint.port,
                        database = %database,
                        table = %table,
                        stage = %stage,
                        "Table already staged, keeping the staged copy"
                    );
                    continue;
                }
                let record = engine.transfer_table(database, stage, table).await?;
                // the stage copy keeps its triggers for the rollback window
                engine
                    .replay_triggers(stage, std::slice::from_ref(&record))
                    .await?;
                report.tables_transferred += 1;
            }
        }
        report.advance(PipelineState::Transferred);

        match mode {
            TruncateMode::TruncateTable => {
                for (database, stage) in &stages {
                    for table in verifier.list_objects(stage, ObjectKind::BaseTable).await? {
                        engine.recreate_table(database, stage, &table).await?;
                        engine.copy_triggers(stage, database, &table).await?;
                    }
                }
                report.advance(PipelineState::Recreated);
            }
            TruncateMode::DropDatabase => {
                for (database, stage) in &stages {
                    verifier.drop_database(database, stage, true).await?;
                }
                report.advance(PipelineState::Dropped);
            }
            TruncateMode::DropTable => report.advance(PipelineState::LeftInStage),
        }

        tracing::info!(
            host = %endpoint.host,
            port = endpoint.port,
            shard_id = ?report.shard_id,
            mode = ?mode,
            databases = stages.len(),
            tables = report.tables_transferred,
            "Truncate finished"
        );
        Ok(())
    }
}
