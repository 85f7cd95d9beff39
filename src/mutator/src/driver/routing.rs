use common::sql::{Endpoint, SqlExecutor};
use serde::{Deserialize, Serialize};

use super::{DriverContext, InstanceReport, RunReport, TruncateMode, resolve_timestamp};
use crate::error::Result;
use crate::target::{ResolvedFilter, TargetFilter};

/// Truncate through the routing tier, which fans the DDL out to its shards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingTierParams {
    pub proxy: Endpoint,
    pub filter: TargetFilter,
    pub mode: TruncateMode,
    pub timestamp: Option<String>,
}

impl DriverContext {
    /// Run the truncate pipeline once against the routing tier. Patterns are
    /// never shard-suffixed; the tier maps logical names itself.
    pub async fn truncate_via_routing_tier(&self, params: &RoutingTierParams) -> RunReport {
        let timestamp = resolve_timestamp(params.timestamp.as_deref());
        let mut run = RunReport::new(timestamp.clone());
        let mut report = InstanceReport::new(params.proxy.clone(), None);

        tracing::info!(
            host = %params.proxy.host,
            port = params.proxy.port,
            mode = ?params.mode,
            %timestamp,
            "Starting truncate via routing tier"
        );

        let outcome = match self.connect(&params.proxy).await {
            Ok(exec) => self.run_routed(exec.as_ref(), &mut report, params, &timestamp).await,
            Err(e) => Err(e),
        };
        report.finish(outcome);
        run.instances.push(report);
        run
    }

    async fn run_routed(
        &self,
        exec: &dyn SqlExecutor,
        report: &mut InstanceReport,
        params: &RoutingTierParams,
        timestamp: &str,
    ) -> Result<()> {
        exec.exec(&self.config.routing.admin_statement, &[]).await?;

        let filter = ResolvedFilter::new(&params.filter, &self.config.naming, None);
        self.run_truncate(exec, report, &filter, params.mode, timestamp)
            .await
    }
}
