use common::config::MysqlConfig;
use common::sql::{Endpoint, MySqlExecutor, SqlExecutor, SqlParam};
use testcontainers_modules::mysql::Mysql;
use testcontainers_modules::testcontainers::runners::AsyncRunner;

#[tokio::test]
#[ignore = "Requires a Docker daemon for the MySQL container"]
async fn test_executor_round_trip_against_mysql() -> anyhow::Result<()> {
    let container = Mysql::default().start().await?;
    let port = container.get_host_port_ipv4(3306).await?;

    let config = MysqlConfig {
        user: "root".to_string(),
        password: String::new(),
        ..MysqlConfig::default()
    };
    let exec = MySqlExecutor::connect(&Endpoint::new("127.0.0.1", port), &config).await?;

    exec.exec("CREATE DATABASE IF NOT EXISTS `src_db`", &[])
        .await?;
    exec.exec("CREATE DATABASE IF NOT EXISTS `dst_db`", &[])
        .await?;
    exec.exec("CREATE TABLE `src_db`.`t1` (`id` int)", &[])
        .await?;
    exec.exec("USE `src_db`", &[]).await?;
    exec.exec(
        "CREATE TRIGGER `trg1` BEFORE INSERT ON `t1` FOR EACH ROW SET NEW.id = NEW.id",
        &[],
    )
    .await?;

    let triggers = exec
        .query(
            "SELECT TRIGGER_NAME FROM information_schema.TRIGGERS \
             WHERE EVENT_OBJECT_SCHEMA = ? AND EVENT_OBJECT_TABLE = ?",
            &[SqlParam::from("src_db"), SqlParam::from("t1")],
        )
        .await?;
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].get("TRIGGER_NAME"), Some("trg1"));

    let create = exec
        .query("SHOW CREATE TRIGGER `src_db`.`trg1`", &[])
        .await?;
    let statement = create[0].require("SQL Original Statement")?;
    assert!(statement.contains("TRIGGER `trg1`"));

    // renaming across schemas fails while the trigger is attached
    let err = exec
        .exec("RENAME TABLE `src_db`.`t1` TO `dst_db`.`t1`", &[])
        .await
        .unwrap_err();
    assert_eq!(err.server_code(), Some(1435));

    let count = exec
        .query_scalar(
            "SELECT COUNT(*) FROM information_schema.TABLES WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
            &[SqlParam::from("src_db"), SqlParam::from("t1")],
        )
        .await?;
    assert_eq!(count.as_deref(), Some("1"));

    exec.close().await?;
    Ok(())
}
