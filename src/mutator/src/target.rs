//! Target resolution.
//!
//! Turns caller-supplied glob patterns into the concrete `database → tables`
//! map a pipeline operates on. Resolution always happens against live
//! `information_schema` metadata and is repeated on every run.
//!
//! Stage, rollback, backup and system databases are excluded unconditionally
//! so a pipeline can never target its own staging area. Under sharding,
//! database patterns without a trailing wildcard are pinned to the shard by
//! appending `_<shard_id>`.

use std::collections::{BTreeMap, BTreeSet};

use common::config::NamingConfig;
use common::sql::SqlExecutor;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MutationError, Result};

/// Pattern matching every name.
pub const MATCH_ALL: &str = "*";

/// Backup databases left behind by other tooling.
pub const BACKUP_DB_PATTERN: &str = "bak_%";

/// Resolved target: database → ordered table set.
pub type Target = BTreeMap<String, BTreeSet<String>>;

/// Include/ignore patterns as supplied by the caller.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    pub databases: Vec<String>,
    /// Empty means every table
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub ignore_databases: Vec<String>,
    #[serde(default)]
    pub ignore_tables: Vec<String>,
}

impl TargetFilter {
    /// Whole databases, every table.
    pub fn databases<I, S>(databases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            databases: databases.into_iter().map(Into::into).collect(),
            tables: vec![MATCH_ALL.to_string()],
            ..Self::default()
        }
    }
}

/// `*` or anything ending in `%` already spans every shard.
pub fn has_trailing_wildcard(pattern: &str) -> bool {
    pattern == MATCH_ALL || pattern.ends_with('%')
}

/// Pin a pattern to a shard.
pub fn shard_pattern(pattern: &str, shard: Option<u32>) -> String {
    match shard {
        Some(id) if !has_trailing_wildcard(pattern) => format!("{pattern}_{id}"),
        _ => pattern.to_string(),
    }
}

/// Patterns after shard rewriting and with the mandatory exclusions added.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedFilter {
    pub databases: Vec<String>,
    pub tables: Vec<String>,
    pub ignore_databases: Vec<String>,
    pub ignore_tables: Vec<String>,
}

impl ResolvedFilter {
    pub fn new(filter: &TargetFilter, naming: &NamingConfig, shard: Option<u32>) -> Self {
        let databases = filter
            .databases
            .iter()
            .map(|p| shard_pattern(p, shard))
            .collect();

        let mut ignore_databases: Vec<String> = filter
            .ignore_databases
            .iter()
            .map(|p| shard_pattern(p, shard))
            .collect();
        // appended after rewriting: these must match on every shard as-is
        ignore_databases.push(format!("{}%", naming.stage_header));
        ignore_databases.push(format!("%{}", naming.rollback_tail));
        ignore_databases.push(BACKUP_DB_PATTERN.to_string());
        ignore_databases.extend(naming.system_databases.iter().cloned());

        let tables = if filter.tables.is_empty() {
            vec![MATCH_ALL.to_string()]
        } else {
            filter.tables.clone()
        };

        Self {
            databases,
            tables,
            ignore_databases,
            ignore_tables: filter.ignore_tables.clone(),
        }
    }
}

/// Anchored, case-sensitive glob: `*` and `%` match any run, `?` one
/// character.
#[derive(Clone, Debug)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self> {
        let mut expr = String::from("^");
        if source == MATCH_ALL {
            expr.push_str(".*");
        } else {
            for c in source.chars() {
                match c {
                    '*' | '%' => expr.push_str(".*"),
                    '?' => expr.push('.'),
                    other => expr.push_str(&regex::escape(&other.to_string())),
                }
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| MutationError::InvalidPattern {
            pattern: source.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn matches_everything(&self) -> bool {
        !self.source.is_empty() && self.source.chars().all(|c| c == '%' || c == '*')
    }
}

#[derive(Clone, Debug, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn compile(sources: &[String]) -> Result<Self> {
        let patterns = sources
            .iter()
            .map(|s| Pattern::compile(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn matches_everything(&self) -> bool {
        self.patterns.iter().any(Pattern::matches_everything)
    }
}

/// Compiled include/exclude matchers.
#[derive(Clone, Debug)]
pub struct TargetMatcher {
    databases: PatternSet,
    tables: PatternSet,
    ignore_databases: PatternSet,
    ignore_tables: PatternSet,
}

impl TargetMatcher {
    pub fn new(filter: &ResolvedFilter) -> Result<Self> {
        Ok(Self {
            databases: PatternSet::compile(&filter.databases)?,
            tables: PatternSet::compile(&filter.tables)?,
            ignore_databases: PatternSet::compile(&filter.ignore_databases)?,
            ignore_tables: PatternSet::compile(&filter.ignore_tables)?,
        })
    }

    pub fn database_selected(&self, database: &str) -> bool {
        self.databases.matches(database) && !self.ignore_databases.matches(database)
    }

    pub fn table_selected(&self, table: &str) -> bool {
        self.tables.matches(table) && !self.ignore_tables.matches(table)
    }

    /// Databases without any matching table still count as targets only
    /// when the table patterns select everything.
    pub fn keeps_empty_databases(&self) -> bool {
        self.tables.matches_everything()
    }
}

/// Materialize the target map from live schema metadata.
///
/// # Errors
///
/// Returns [`MutationError::EmptyTarget`] when nothing matches: an empty
/// target is a misconfiguration, never "nothing to do".
pub async fn resolve_targets(exec: &dyn SqlExecutor, filter: &ResolvedFilter) -> Result<Target> {
    let matcher = TargetMatcher::new(filter)?;
    let endpoint = exec.endpoint();

    let mut target = Target::new();

    let schemata = exec
        .query("SELECT SCHEMA_NAME FROM information_schema.SCHEMATA", &[])
        .await?;
    if matcher.keeps_empty_databases() {
        for row in &schemata {
            let database = row.require("SCHEMA_NAME")?;
            if matcher.database_selected(database) {
                target.entry(database.to_string()).or_default();
            }
        }
    }

    let tables = exec
        .query(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES WHERE TABLE_TYPE = 'BASE TABLE'",
            &[],
        )
        .await?;
    for row in &tables {
        let database = row.require("TABLE_SCHEMA")?;
        let table = row.require("TABLE_NAME")?;
        if matcher.database_selected(database) && matcher.table_selected(table) {
            target
                .entry(database.to_string())
                .or_default()
                .insert(table.to_string());
        }
    }

    if target.is_empty() {
        tracing::error!(
            host = %endpoint.host,
            port = endpoint.port,
            databases = ?filter.databases,
            tables = ?filter.tables,
            "Target resolution matched nothing"
        );
        return Err(MutationError::EmptyTarget {
            endpoint: endpoint.clone(),
            databases: filter.databases.clone(),
            tables: filter.tables.clone(),
        });
    }

    tracing::info!(
        host = %endpoint.host,
        port = endpoint.port,
        databases = target.len(),
        tables = target.values().map(BTreeSet::len).sum::<usize>(),
        "Resolved mutation target"
    );
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::testing::FakeMysql;

    fn naming() -> NamingConfig {
        NamingConfig {
            stage_header: "stage".to_string(),
            rollback_tail: "_rb".to_string(),
            system_databases: vec!["mysql".to_string()],
        }
    }

    #[test]
    fn test_shard_suffix_applies_to_bare_patterns_only() {
        assert_eq!(shard_pattern("foo", Some(3)), "foo_3");
        assert_eq!(shard_pattern("foo%", Some(3)), "foo%");
        assert_eq!(shard_pattern("*", Some(3)), "*");
        assert_eq!(shard_pattern("foo", None), "foo");
    }

    #[test]
    fn test_mandatory_ignores_survive_sharding() {
        let filter = TargetFilter {
            databases: vec!["foo".to_string(), "bar%".to_string()],
            ignore_databases: vec!["skip".to_string()],
            ..TargetFilter::default()
        };
        let resolved = ResolvedFilter::new(&filter, &naming(), Some(7));

        assert_eq!(resolved.databases, vec!["foo_7", "bar%"]);
        assert_eq!(
            resolved.ignore_databases,
            vec!["skip_7", "stage%", "%_rb", "bak_%", "mysql"]
        );
        assert_eq!(resolved.tables, vec!["*"]);
    }

    #[test]
    fn test_mandatory_ignores_without_caller_input() {
        let resolved = ResolvedFilter::new(&TargetFilter::default(), &naming(), None);
        for expected in ["stage%", "%_rb", "bak_%"] {
            assert!(resolved.ignore_databases.contains(&expected.to_string()));
        }
    }

    #[test]
    fn test_pattern_semantics() {
        let p = Pattern::compile("order%").unwrap();
        assert!(p.matches("order"));
        assert!(p.matches("orders_1"));
        assert!(!p.matches("my_orders"));

        let p = Pattern::compile("t?").unwrap();
        assert!(p.matches("t1"));
        assert!(!p.matches("t10"));

        // regex metacharacters are literal
        let p = Pattern::compile("a.b").unwrap();
        assert!(p.matches("a.b"));
        assert!(!p.matches("axb"));

        assert!(Pattern::compile("*").unwrap().matches_everything());
        assert!(Pattern::compile("%").unwrap().matches_everything());
        assert!(!Pattern::compile("t%").unwrap().matches_everything());
    }

    #[tokio::test]
    async fn test_resolve_excludes_stage_and_backup_databases() {
        let server = FakeMysql::new("h", 3306)
            .with_table("app", "t1", 1)
            .with_table("app", "t2", 1)
            .with_table("stage_20240101_app", "t1", 1)
            .with_table("bak_app", "t1", 1)
            .with_table("app_rb", "t1", 1)
            .with_database("app_empty");
        let session = server.session();

        let filter = TargetFilter::databases(["app%", "stage%", "bak%"]);
        let resolved = ResolvedFilter::new(&filter, &naming(), None);
        let target = resolve_targets(&session, &resolved).await.unwrap();

        let databases: Vec<_> = target.keys().cloned().collect();
        assert_eq!(databases, vec!["app", "app_empty"]);
        assert_eq!(
            target["app"].iter().cloned().collect::<Vec<_>>(),
            vec!["t1", "t2"]
        );
        assert!(target["app_empty"].is_empty());
    }

    #[tokio::test]
    async fn test_resolve_with_table_patterns_drops_empty_databases() {
        let server = FakeMysql::new("h", 3306)
            .with_table("app", "orders", 1)
            .with_table("app", "orders_tmp", 1)
            .with_table("app", "users", 1)
            .with_database("app_empty");
        let session = server.session();

        let filter = TargetFilter {
            databases: vec!["app%".to_string()],
            tables: vec!["orders%".to_string()],
            ignore_tables: vec!["%_tmp".to_string()],
            ..TargetFilter::default()
        };
        let resolved = ResolvedFilter::new(&filter, &naming(), None);
        let target = resolve_targets(&session, &resolved).await.unwrap();

        assert_eq!(target.len(), 1);
        assert_eq!(
            target["app"].iter().cloned().collect::<Vec<_>>(),
            vec!["orders"]
        );
    }

    #[tokio::test]
    async fn test_resolve_sharded_pins_to_shard() {
        let server = FakeMysql::new("h", 3306)
            .with_table("foo_1", "t1", 1)
            .with_table("foo_2", "t1", 1);
        let session = server.session();

        let resolved = ResolvedFilter::new(&TargetFilter::databases(["foo"]), &naming(), Some(2));
        let target = resolve_targets(&session, &resolved).await.unwrap();
        assert_eq!(target.keys().cloned().collect::<Vec<_>>(), vec!["foo_2"]);
    }

    #[tokio::test]
    async fn test_empty_target_is_an_error() {
        let server = FakeMysql::new("h", 3306).with_table("app", "t1", 1);
        let session = server.session();

        let resolved = ResolvedFilter::new(&TargetFilter::databases(["missing"]), &naming(), None);
        let err = resolve_targets(&session, &resolved).await.unwrap_err();
        assert!(matches!(err, MutationError::EmptyTarget { .. }));
    }
}
