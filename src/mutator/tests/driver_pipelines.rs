use std::sync::Arc;

use common::config::Configuration;
use common::sql::Endpoint;
use common::testing::{FakeDumper, FakeFleet, FakeMysql};
use mutator::driver::PipelineState;
use mutator::error::TransferStep;
use mutator::verify::{MissingObject, ObjectKind};
use mutator::{
    DriverContext, MutationError, PreDropParams, RenameParams, RenameRequest, RoutingTierParams,
    ShardMap, TargetFilter, TruncateMode, TruncateParams,
};

const TS: &str = "20240101000000";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn context(servers: &[&FakeMysql]) -> DriverContext {
    init_tracing();
    let mut fleet = FakeFleet::new();
    let mut dumper = FakeDumper::new();
    for server in servers {
        fleet = fleet.with_server((*server).clone());
        dumper = dumper.with_server((*server).clone());
    }
    DriverContext::new(Arc::new(fleet), Arc::new(dumper), Configuration::default())
}

fn truncate_params(shards: &[(u16, u32)], databases: &[&str], mode: TruncateMode) -> TruncateParams {
    TruncateParams {
        host: "db-1".to_string(),
        shards: shards.iter().copied().collect::<ShardMap>(),
        has_shard: true,
        filter: TargetFilter::databases(databases.iter().copied()),
        mode,
        timestamp: Some(TS.to_string()),
    }
}

fn rename_params(from: &str, to: &str) -> RenameParams {
    RenameParams {
        host: "db-1".to_string(),
        ports: vec![3306],
        requests: vec![RenameRequest::new(from, to)],
    }
}

fn rename_fixture() -> FakeMysql {
    FakeMysql::new("db-1", 3306)
        .with_table("old_db1", "t1", 10)
        .with_table("old_db1", "t2", 5)
        .with_trigger("old_db1", "t1", "trg1")
        .with_view("old_db1", "v1")
        .with_routine("old_db1", "p1")
        .with_event("old_db1", "e1")
        .with_table("unrelated", "t1", 1)
}

#[tokio::test]
async fn test_rename_moves_every_object_and_drops_source() {
    let server = rename_fixture();
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(run.instances[0].tables_transferred, 2);
    assert!(!server.has_database("old_db1"));

    let new = server.database("new_db1").unwrap();
    assert_eq!(server.row_count("new_db1", "t1"), Some(10));
    assert_eq!(server.row_count("new_db1", "t2"), Some(5));
    assert_eq!(server.triggers("new_db1"), vec![("trg1".to_string(), "t1".to_string())]);
    assert!(new.views.contains("v1"));
    assert!(new.routines.contains("p1"));
    assert!(new.events.contains("e1"));

    assert_eq!(server.row_count("unrelated", "t1"), Some(1));
}

#[tokio::test]
async fn test_rename_keeps_source_when_replay_fails() {
    let server = rename_fixture();
    server.fail_on("CREATE EVENT", 1227, "Access denied; you need the EVENT privilege");
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;

    let report = &run.instances[0];
    assert_eq!(report.state, PipelineState::Failed);
    assert_eq!(report.failed_in, Some(PipelineState::Staged));
    match &report.error {
        Some(MutationError::Replay { message, .. }) => assert!(message.contains("ERROR 1227")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(server.row_count("old_db1", "t1"), Some(10));
    assert_eq!(server.triggers("old_db1").len(), 1);
}

#[tokio::test]
async fn test_rename_rerun_after_failure_completes() {
    let server = rename_fixture();
    server.fail_on("RENAME TABLE `old_db1`.`t2`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;
    assert!(!run.is_success());
    assert_eq!(run.instances[0].failed_in, Some(PipelineState::Staged));
    assert!(server.has_database("old_db1"));

    server.clear_failures();
    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;
    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert!(!server.has_database("old_db1"));
    assert_eq!(server.row_count("new_db1", "t1"), Some(10));
    assert_eq!(server.row_count("new_db1", "t2"), Some(5));
    assert_eq!(server.triggers("new_db1"), vec![("trg1".to_string(), "t1".to_string())]);
}

#[tokio::test]
async fn test_rename_failed_transfer_keeps_source_triggers() {
    let server = rename_fixture();
    server.fail_on("RENAME TABLE `old_db1`.`t1`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;
    let report = &run.instances[0];
    assert!(matches!(
        report.error,
        Some(MutationError::Transfer {
            step: TransferStep::RenameTable,
            ..
        })
    ));
    assert_eq!(report.failed_request.as_deref(), Some("old_db1 -> new_db1"));
    assert_eq!(server.triggers("old_db1"), vec![("trg1".to_string(), "t1".to_string())]);
    assert_eq!(server.row_count("old_db1", "t1"), Some(10));

    server.clear_failures();
    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;
    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert!(!server.has_database("old_db1"));
    assert_eq!(server.triggers("new_db1"), vec![("trg1".to_string(), "t1".to_string())]);
    assert_eq!(server.row_count("new_db1", "t1"), Some(10));
}

#[tokio::test]
async fn test_rename_reports_the_failing_request() {
    let server = rename_fixture().with_table("old_db2", "t1", 4);
    server.fail_on("RENAME TABLE `old_db2`.`t1`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);

    let run = ctx
        .rename(&RenameParams {
            host: "db-1".to_string(),
            ports: vec![3306],
            requests: vec![
                RenameRequest::new("old_db1", "new_db1"),
                RenameRequest::new("old_db2", "new_db2"),
            ],
        })
        .await;

    let report = &run.instances[0];
    assert_eq!(report.failed_in, Some(PipelineState::Staged));
    assert_eq!(report.failed_request.as_deref(), Some("old_db2 -> new_db2"));
    assert_eq!(report.tables_transferred, 2);
    assert!(!server.has_database("old_db1"));
    assert_eq!(server.row_count("old_db2", "t1"), Some(4));
}

#[tokio::test]
async fn test_rename_rejects_identical_names() {
    let server = rename_fixture();
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "old_db1")).await;

    assert!(matches!(
        run.instances[0].error,
        Some(MutationError::InvalidRequest { .. })
    ));
    assert_eq!(run.instances[0].failed_in, Some(PipelineState::Init));
    assert!(server.statements().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rename_blocked_while_source_in_use() {
    let server = rename_fixture();
    server.hold_open("old_db1", "t1");
    let ctx = context(&[&server]);

    let run = ctx.rename(&rename_params("old_db1", "new_db1")).await;

    assert!(matches!(
        run.instances[0].error,
        Some(MutationError::InUse { .. })
    ));
    assert!(!server.has_database("new_db1"));
    assert_eq!(server.row_count("old_db1", "t1"), Some(10));
}

fn shard_fixture(port: u16, shard: u32) -> FakeMysql {
    let db = format!("app_{shard}");
    FakeMysql::new("db-1", port)
        .with_table(&db, "t1", 10)
        .with_trigger(&db, "t1", "trg1")
        .with_table(&db, "t2", 3)
        .with_table("other", "t1", 7)
}

#[tokio::test]
async fn test_truncate_table_empties_tables_and_keeps_triggers() {
    let server = shard_fixture(3306, 1);
    let ctx = context(&[&server]);

    let run = ctx
        .truncate(&truncate_params(&[(3306, 1)], &["app"], TruncateMode::TruncateTable))
        .await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(run.timestamp, TS);
    let stage = "stage_20240101000000_app_1";

    assert_eq!(server.row_count("app_1", "t1"), Some(0));
    assert_eq!(server.row_count("app_1", "t2"), Some(0));
    assert_eq!(server.triggers("app_1"), vec![("trg1".to_string(), "t1".to_string())]);

    assert_eq!(server.row_count(stage, "t1"), Some(10));
    assert_eq!(server.row_count(stage, "t2"), Some(3));
    assert_eq!(server.triggers(stage), vec![("trg1".to_string(), "t1".to_string())]);

    assert_eq!(server.row_count("other", "t1"), Some(7));
    assert_eq!(
        run.cleanup_plan_json().unwrap(),
        r#"["DROP DATABASE IF EXISTS `stage_20240101000000_app_1`"]"#
    );
}

#[tokio::test]
async fn test_truncate_drop_database_removes_source() {
    let server = shard_fixture(3306, 1);
    let ctx = context(&[&server]);

    let run = ctx
        .truncate(&truncate_params(&[(3306, 1)], &["app"], TruncateMode::DropDatabase))
        .await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert!(!server.has_database("app_1"));
    assert_eq!(
        server.tables("stage_20240101000000_app_1"),
        vec!["t1".to_string(), "t2".to_string()]
    );
}

#[tokio::test]
async fn test_truncate_drop_table_leaves_tables_in_stage() {
    let server = shard_fixture(3306, 1);
    let ctx = context(&[&server]);

    let params = TruncateParams {
        filter: TargetFilter {
            databases: vec!["app".to_string()],
            tables: vec!["t1".to_string()],
            ..TargetFilter::default()
        },
        ..truncate_params(&[(3306, 1)], &[], TruncateMode::DropTable)
    };
    let run = ctx.truncate(&params).await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(server.tables("app_1"), vec!["t2".to_string()]);
    assert_eq!(server.tables("stage_20240101000000_app_1"), vec!["t1".to_string()]);
    assert!(server.triggers("app_1").is_empty());
}

#[tokio::test]
async fn test_truncate_rerun_with_same_timestamp_resumes() {
    let server = shard_fixture(3306, 1);
    server.fail_on("RENAME TABLE `app_1`.`t2`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);
    let params = truncate_params(&[(3306, 1)], &["app"], TruncateMode::DropTable);

    let run = ctx.truncate(&params).await;
    let report = &run.instances[0];
    assert_eq!(report.failed_in, Some(PipelineState::Staged));
    // stage exists already, so its cleanup is reported
    assert_eq!(run.cleanup_plan().len(), 1);

    server.clear_failures();
    let run = ctx.truncate(&params).await;
    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert!(server.tables("app_1").is_empty());
    assert_eq!(
        server.tables("stage_20240101000000_app_1"),
        vec!["t1".to_string(), "t2".to_string()]
    );
}

#[tokio::test]
async fn test_truncate_table_rerun_keeps_staged_rows() {
    let server = shard_fixture(3306, 1);
    server.fail_on("CREATE TABLE IF NOT EXISTS `app_1`.`t2`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);
    let params = truncate_params(&[(3306, 1)], &["app"], TruncateMode::TruncateTable);
    let stage = "stage_20240101000000_app_1";

    let run = ctx.truncate(&params).await;
    assert_eq!(run.instances[0].failed_in, Some(PipelineState::Transferred));
    assert_eq!(server.tables("app_1"), vec!["t1".to_string()]);
    assert_eq!(server.row_count(stage, "t1"), Some(10));

    server.clear_failures();
    let run = ctx.truncate(&params).await;
    let report = &run.instances[0];
    assert!(run.is_success(), "{:?}", report.error);
    assert_eq!(report.tables_transferred, 0);

    assert_eq!(server.row_count(stage, "t1"), Some(10));
    assert_eq!(server.row_count(stage, "t2"), Some(3));
    assert_eq!(server.row_count("app_1", "t1"), Some(0));
    assert_eq!(server.row_count("app_1", "t2"), Some(0));
    assert_eq!(server.triggers("app_1"), vec![("trg1".to_string(), "t1".to_string())]);
    assert_eq!(server.triggers(stage), vec![("trg1".to_string(), "t1".to_string())]);
}

#[tokio::test]
async fn test_truncate_failed_transfer_keeps_source_triggers() {
    let server = shard_fixture(3306, 1);
    server.fail_on("RENAME TABLE `app_1`.`t1`", 1205, "Lock wait timeout exceeded");
    let ctx = context(&[&server]);
    let params = truncate_params(&[(3306, 1)], &["app"], TruncateMode::TruncateTable);

    let run = ctx.truncate(&params).await;
    assert!(!run.is_success());
    assert_eq!(server.triggers("app_1"), vec![("trg1".to_string(), "t1".to_string())]);
    assert_eq!(server.row_count("app_1", "t1"), Some(10));

    server.clear_failures();
    let run = ctx.truncate(&params).await;
    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(
        server.triggers("stage_20240101000000_app_1"),
        vec![("trg1".to_string(), "t1".to_string())]
    );
    assert_eq!(server.triggers("app_1"), vec![("trg1".to_string(), "t1".to_string())]);
}

#[tokio::test]
async fn test_truncate_drop_database_refused_when_stage_lacks_a_table() {
    let server = shard_fixture(3306, 1);
    let ctx = context(&[&server]);

    let params = TruncateParams {
        filter: TargetFilter {
            databases: vec!["app".to_string()],
            tables: vec!["t1".to_string()],
            ..TargetFilter::default()
        },
        ..truncate_params(&[(3306, 1)], &[], TruncateMode::DropDatabase)
    };
    let run = ctx.truncate(&params).await;

    let report = &run.instances[0];
    assert_eq!(report.failed_in, Some(PipelineState::Transferred));
    match &report.error {
        Some(MutationError::NotTransClean { from, missing, .. }) => {
            assert_eq!(from, "app_1");
            assert_eq!(
                missing,
                &vec![MissingObject {
                    kind: ObjectKind::BaseTable,
                    name: "t2".to_string(),
                }]
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(server.has_database("app_1"));
    assert_eq!(server.row_count("app_1", "t2"), Some(3));
}

#[tokio::test]
async fn test_truncate_targets_each_shard_separately() {
    let first = shard_fixture(3306, 1);
    let second = shard_fixture(3307, 2);
    let ctx = context(&[&first, &second]);

    let run = ctx
        .truncate(&truncate_params(
            &[(3306, 1), (3307, 2)],
            &["app"],
            TruncateMode::DropTable,
        ))
        .await;

    assert!(run.is_success());
    assert_eq!(run.instances[0].shard_id, Some(1));
    assert_eq!(run.instances[1].shard_id, Some(2));
    assert!(first.has_database("stage_20240101000000_app_1"));
    assert!(second.has_database("stage_20240101000000_app_2"));
    assert_eq!(run.cleanup_plan().len(), 2);
}

#[tokio::test]
async fn test_failed_instance_does_not_stop_the_others() {
    let reachable = shard_fixture(3307, 2);
    let ctx = context(&[&reachable]);

    let run = ctx
        .truncate(&truncate_params(
            &[(3306, 1), (3307, 2)],
            &["app"],
            TruncateMode::TruncateTable,
        ))
        .await;

    assert_eq!(run.failed_instances().count(), 1);
    let failed = &run.instances[0];
    assert_eq!(failed.endpoint, Endpoint::new("db-1", 3306));
    assert!(matches!(failed.error, Some(MutationError::Connection { .. })));
    assert!(run.instances[1].is_success());
    assert_eq!(reachable.row_count("app_2", "t1"), Some(0));

    assert!(matches!(
        run.into_result(),
        Err(MutationError::PartialFailure { failed: 1, total: 2 })
    ));
}

#[tokio::test]
async fn test_truncate_without_match_is_an_error() {
    let server = shard_fixture(3306, 1);
    let ctx = context(&[&server]);

    let run = ctx
        .truncate(&truncate_params(&[(3306, 1)], &["missing"], TruncateMode::DropDatabase))
        .await;

    assert!(matches!(
        run.instances[0].error,
        Some(MutationError::EmptyTarget { .. })
    ));
    assert!(run.cleanup_plan().is_empty());
}

#[tokio::test]
async fn test_routing_tier_sets_admin_flag_first_and_skips_sharding() {
    let proxy = FakeMysql::new("proxy", 6033)
        .with_table("app", "t1", 4)
        .with_table("app_1", "t1", 4);
    let ctx = context(&[&proxy]);

    let run = ctx
        .truncate_via_routing_tier(&RoutingTierParams {
            proxy: proxy.endpoint().clone(),
            filter: TargetFilter::databases(["app"]),
            mode: TruncateMode::TruncateTable,
            timestamp: Some(TS.to_string()),
        })
        .await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(proxy.statements()[0], "SET SESSION admin_ddl = 1");
    assert_eq!(proxy.row_count("app", "t1"), Some(0));
    assert_eq!(proxy.row_count("app_1", "t1"), Some(4));
    assert_eq!(proxy.row_count("stage_20240101000000_app", "t1"), Some(4));
}

#[tokio::test]
async fn test_pre_drop_removes_only_targeted_stage_databases() {
    let server = shard_fixture(3306, 1)
        .with_table("stage_20240101000000_app_1", "t1", 10)
        .with_table("stage_20240101000000_other", "t1", 7)
        .with_table("stage_20231231000000_app_1", "t1", 2);
    let ctx = context(&[&server]);

    let run = ctx
        .pre_drop(&PreDropParams {
            host: "db-1".to_string(),
            shards: [(3306, 1)].into_iter().collect(),
            has_shard: true,
            filter: TargetFilter::databases(["app"]),
            timestamp: TS.to_string(),
        })
        .await;

    assert!(run.is_success(), "{:?}", run.instances[0].error);
    assert_eq!(run.instances[0].state, PipelineState::Done);
    assert!(!server.has_database("stage_20240101000000_app_1"));
    assert!(server.has_database("stage_20240101000000_other"));
    assert!(server.has_database("stage_20231231000000_app_1"));
    assert_eq!(server.row_count("app_1", "t1"), Some(10));
}
