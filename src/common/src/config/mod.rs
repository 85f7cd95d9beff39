use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Credentials and timeouts for the per-instance MySQL sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MysqlConfig {
    pub user: String,
    pub password: String,
    /// Time allowed to establish a session with one instance
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Upper bound for every individual statement
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Duration,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            user: String::from("root"),
            password: String::new(),
            connect_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(5),
        }
    }
}

/// Sampling window of the in-use detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InUseConfig {
    /// Number of `SHOW OPEN TABLES` samples taken after the flush
    pub samples: usize,
    /// Pause between two samples
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for InUseConfig {
    fn default() -> Self {
        Self {
            samples: 6,
            interval: Duration::from_secs(10),
        }
    }
}

/// Naming conventions shared by target resolution and staging.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamingConfig {
    /// Prefix of every stage database
    pub stage_header: String,
    /// Suffix carried by rollback databases
    pub rollback_tail: String,
    /// Databases that are never targeted
    pub system_databases: Vec<String>,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            stage_header: String::from("stage"),
            rollback_tail: String::from("_rollback"),
            system_databases: vec![
                String::from("information_schema"),
                String::from("mysql"),
                String::from("performance_schema"),
                String::from("sys"),
            ],
        }
    }
}

/// Locations of the client binaries driving schema dump and import.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DumpConfig {
    pub mysqldump_bin: PathBuf,
    pub mysql_bin: PathBuf,
    /// Directory receiving dump files and import error logs. A temporary
    /// directory is used when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            mysqldump_bin: PathBuf::from("mysqldump"),
            mysql_bin: PathBuf::from("mysql"),
            work_dir: None,
        }
    }
}

/// Settings for sessions opened against the routing tier.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Statement switching the session into admin mode so DDL is routed to
    /// the shards instead of being intercepted by the proxy
    pub admin_statement: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            admin_statement: String::from("SET SESSION admin_ddl = 1"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Session credentials and statement timeout
    #[serde(default)]
    pub mysql: MysqlConfig,
    /// In-use detection window
    #[serde(default)]
    pub in_use: InUseConfig,
    /// Stage/rollback naming and system databases
    #[serde(default)]
    pub naming: NamingConfig,
    /// Dump/import client binaries
    #[serde(default)]
    pub dump: DumpConfig,
    /// Routing tier session setup
    #[serde(default)]
    pub routing: RoutingConfig,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Configuration {
    pub fn load() -> Result<Self, ConfigError> {
        Self::figment(Path::new("schemaops.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::figment(path)
    }

    fn figment(path: &Path) -> Result<Self, ConfigError> {
        let config: Configuration = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCHEMAOPS__").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the destructive pipelines unsafe or
    /// meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.naming.stage_header.is_empty() {
            return Err(ConfigError::Invalid(
                "naming.stage_header cannot be empty".into(),
            ));
        }
        if self.naming.rollback_tail.is_empty() {
            return Err(ConfigError::Invalid(
                "naming.rollback_tail cannot be empty".into(),
            ));
        }
        if self.in_use.samples == 0 {
            return Err(ConfigError::Invalid(
                "in_use.samples must be at least 1".into(),
            ));
        }
        if self.mysql.statement_timeout.is_zero() || self.mysql.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "mysql timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();

        assert_eq!(config.mysql.statement_timeout, Duration::from_secs(5));
        assert_eq!(config.in_use.samples, 6);
        assert_eq!(config.in_use.interval, Duration::from_secs(10));
        assert_eq!(config.naming.stage_header, "stage");
        assert!(
            config
                .naming
                .system_databases
                .contains(&"mysql".to_string())
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ops.toml",
                r#"
                [mysql]
                user = "ops"
                statement_timeout = "2s"

                [naming]
                stage_header = "stg"
                "#,
            )?;
            jail.set_env("SCHEMAOPS__IN_USE__SAMPLES", "3");
            jail.set_env("SCHEMAOPS__MYSQL__PASSWORD", "secret");

            let config = Configuration::load_from_path(Path::new("ops.toml"))
                .expect("configuration should load");

            assert_eq!(config.mysql.user, "ops");
            assert_eq!(config.mysql.password, "secret");
            assert_eq!(config.mysql.statement_timeout, Duration::from_secs(2));
            assert_eq!(config.naming.stage_header, "stg");
            // untouched keys keep their defaults
            assert_eq!(config.naming.rollback_tail, "_rollback");
            assert_eq!(config.in_use.samples, 3);
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_zero_samples() {
        let mut config = Configuration::default();
        config.in_use.samples = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validation_rejects_empty_stage_header() {
        let mut config = Configuration::default();
        config.naming.stage_header.clear();
        assert!(config.validate().is_err());
    }
}
