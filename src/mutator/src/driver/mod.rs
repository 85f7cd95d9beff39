//! Orchestration drivers.
//!
//! Each driver runs one pipeline per instance, strictly in order. A failing
//! step aborts that instance only; the outcome of every instance is collected
//! into a [`RunReport`]. Recovery is a plain re-run with the same timestamp:
//! all steps are idempotent.

mod predrop;
mod rename;
mod routing;
mod truncate;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use common::config::Configuration;
use common::dump::{SchemaDumper, Topology, dumper_for};
use common::sql::{Connector, Endpoint, MySqlConnector, SqlExecutor};
use serde::{Serialize, Serializer};

use crate::error::{MutationError, Result};
use crate::stage::run_timestamp;

pub use predrop::PreDropParams;
pub use rename::{RenameParams, RenameRequest};
pub use routing::RoutingTierParams;
pub use truncate::{TruncateMode, TruncateParams};

/// Listening port → shard id.
pub type ShardMap = BTreeMap<u16, u32>;

/// Progress of one instance through its pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Init,
    TargetResolved,
    Staged,
    Transferred,
    Recreated,
    Dropped,
    LeftInStage,
    Done,
    Failed,
}

/// Outcome of the pipeline on one instance.
#[derive(Debug, Serialize)]
pub struct InstanceReport {
    pub endpoint: Endpoint,
    pub shard_id: Option<u32>,
    pub state: PipelineState,
    /// Last state reached before the failure
    pub failed_in: Option<PipelineState>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<MutationError>,
    /// Rename request (`from -> to`) being applied when the pipeline failed
    pub failed_request: Option<String>,
    pub tables_transferred: usize,
    pub stage_databases: Vec<String>,
    /// Statements dropping the stage databases once the rollback window
    /// is over
    pub cleanup: Vec<String>,
}

fn serialize_error<S: Serializer>(error: &Option<MutationError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

impl InstanceReport {
    pub fn new(endpoint: Endpoint, shard_id: Option<u32>) -> Self {
        Self {
            endpoint,
            shard_id,
            state: PipelineState::Init,
            failed_in: None,
            error: None,
            failed_request: None,
            tables_transferred: 0,
            stage_databases: Vec::new(),
            cleanup: Vec::new(),
        }
    }

    pub fn advance(&mut self, state: PipelineState) {
        tracing::debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            from = ?self.state,
            to = ?state,
            "Pipeline state change"
        );
        self.state = state;
    }

    fn fail(&mut self, error: MutationError) {
        tracing::error!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            shard_id = ?self.shard_id,
            state = ?self.state,
            request = ?self.failed_request,
            error = %error,
            "Instance pipeline aborted"
        );
        self.failed_in = Some(self.state);
        self.state = PipelineState::Failed;
        self.error = Some(error);
    }

    /// Record the outcome of a pipeline run.
    pub fn finish(&mut self, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.advance(PipelineState::Done),
            Err(e) => self.fail(e),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Done
    }
}

/// Per-instance results of one driver invocation.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Timestamp embedded in stage database names; reuse it to resume
    pub timestamp: String,
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    pub fn new(timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            instances: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.instances.iter().all(InstanceReport::is_success)
    }

    pub fn failed_instances(&self) -> impl Iterator<Item = &InstanceReport> {
        self.instances.iter().filter(|i| !i.is_success())
    }

    pub fn cleanup_plan(&self) -> Vec<String> {
        self.instances
            .iter()
            .flat_map(|i| i.cleanup.iter().cloned())
            .collect()
    }

    /// Cleanup plan as a JSON array of statements.
    pub fn cleanup_plan_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.cleanup_plan())
    }

    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed_instances().count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(MutationError::PartialFailure {
                failed,
                total: self.instances.len(),
            })
        }
    }
}

/// Collaborators shared by all drivers.
#[derive(Clone)]
pub struct DriverContext {
    pub connector: Arc<dyn Connector>,
    pub dumper: Arc<dyn SchemaDumper>,
    pub config: Configuration,
}

impl DriverContext {
    pub fn new(
        connector: Arc<dyn Connector>,
        dumper: Arc<dyn SchemaDumper>,
        config: Configuration,
    ) -> Self {
        Self {
            connector,
            dumper,
            config,
        }
    }

    /// Production wiring: MySQL sessions and the client binaries.
    pub fn from_config(config: Configuration, topology: Topology) -> Self {
        let connector = Arc::new(MySqlConnector::new(config.mysql.clone()));
        let dumper = dumper_for(
            topology,
            config.dump.clone(),
            config.mysql.clone(),
            &config.routing.admin_statement,
        );
        Self::new(connector, dumper, config)
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn SqlExecutor>> {
        self.connector
            .connect(endpoint)
            .await
            .map_err(|source| MutationError::Connection {
                endpoint: endpoint.clone(),
                source,
            })
    }
}

/// Caller-supplied timestamp, or the current UTC time.
pub fn resolve_timestamp(timestamp: Option<&str>) -> String {
    timestamp
        .map(str::to_string)
        .unwrap_or_else(|| run_timestamp(Utc::now()))
}
