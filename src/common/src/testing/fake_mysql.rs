//! In-memory stand-in for a MySQL instance.
//!
//! Interprets the statement shapes issued by the mutation pipelines
//! (information_schema listings, trigger capture, table renames, database
//! create/drop, open-table sampling) against a small object model, and
//! records every statement it sees.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::sql::{
    Connector, Endpoint, SqlError, SqlExecutor, SqlParam, SqlResult, SqlRow, quote_ident,
};

#[derive(Clone, Debug, Default)]
pub struct FakeTable {
    pub rows: usize,
}

#[derive(Clone, Debug)]
pub struct FakeTrigger {
    pub table: String,
    pub statement: String,
}

#[derive(Clone, Debug, Default)]
pub struct FakeDatabase {
    pub tables: BTreeMap<String, FakeTable>,
    pub triggers: BTreeMap<String, FakeTrigger>,
    pub views: BTreeSet<String>,
    pub routines: BTreeSet<String>,
    pub events: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum HandleKind {
    /// Sits in the table cache; gone after `FLUSH TABLES`
    Cached,
    /// Held by a long-running client for the whole window
    Held,
    /// Reopened after the flush, visible for the given number of samples
    Transient(usize),
}

#[derive(Clone, Debug)]
struct OpenHandle {
    database: String,
    table: String,
    kind: HandleKind,
}

#[derive(Clone, Debug)]
struct FailRule {
    needle: String,
    code: u16,
    message: String,
}

#[derive(Debug, Default)]
struct ServerState {
    databases: BTreeMap<String, FakeDatabase>,
    open: Vec<OpenHandle>,
    statements: Vec<String>,
    failures: Vec<FailRule>,
}

/// Shared handle on one fake instance. Clones observe the same state.
#[derive(Clone, Debug)]
pub struct FakeMysql {
    endpoint: Endpoint,
    state: Arc<Mutex<ServerState>>,
}

impl FakeMysql {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: Endpoint::new(host, port),
            state: Arc::new(Mutex::new(ServerState::default())),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new session with its own current database.
    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
            current: Mutex::new(None),
        }
    }

    pub fn with_database(self, database: &str) -> Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default();
        self
    }

    pub fn with_table(self, database: &str, table: &str, rows: usize) -> Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .tables
            .insert(table.to_string(), FakeTable { rows });
        self
    }

    pub fn with_trigger(self, database: &str, table: &str, trigger: &str) -> Self {
        let statement = format!(
            "CREATE DEFINER=`root`@`%` TRIGGER {} BEFORE INSERT ON {} FOR EACH ROW SET NEW.id = NEW.id",
            quote_ident(trigger),
            quote_ident(table)
        );
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .triggers
            .insert(
                trigger.to_string(),
                FakeTrigger {
                    table: table.to_string(),
                    statement,
                },
            );
        self
    }

    pub fn with_view(self, database: &str, view: &str) -> Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .views
            .insert(view.to_string());
        self
    }

    pub fn with_routine(self, database: &str, routine: &str) -> Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .routines
            .insert(routine.to_string());
        self
    }

    pub fn with_event(self, database: &str, event: &str) -> Self {
        self.state()
            .databases
            .entry(database.to_string())
            .or_default()
            .events
            .insert(event.to_string());
        self
    }

    /// Table sits in the table cache but nobody uses it.
    pub fn cache_table(&self, database: &str, table: &str) {
        self.push_handle(database, table, HandleKind::Cached);
    }

    /// Table stays open for as long as the test runs.
    pub fn hold_open(&self, database: &str, table: &str) {
        self.push_handle(database, table, HandleKind::Held);
    }

    /// Table is reopened right after the flush and reported for `samples`
    /// consecutive samples.
    pub fn touch_open(&self, database: &str, table: &str, samples: usize) {
        self.push_handle(database, table, HandleKind::Transient(samples));
    }

    fn push_handle(&self, database: &str, table: &str, kind: HandleKind) {
        self.state().open.push(OpenHandle {
            database: database.to_string(),
            table: table.to_string(),
            kind,
        });
    }

    /// Every statement containing `needle` fails with the given server error.
    pub fn fail_on(&self, needle: &str, code: u16, message: &str) {
        self.state().failures.push(FailRule {
            needle: needle.to_string(),
            code,
            message: message.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state().databases.contains_key(database)
    }

    pub fn database(&self, database: &str) -> Option<FakeDatabase> {
        self.state().databases.get(database).cloned()
    }

    pub fn databases(&self) -> Vec<String> {
        self.state().databases.keys().cloned().collect()
    }

    pub fn tables(&self, database: &str) -> Vec<String> {
        self.database(database)
            .map(|db| db.tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, database: &str, table: &str) -> Option<usize> {
        self.database(database)
            .and_then(|db| db.tables.get(table).map(|t| t.rows))
    }

    /// `(trigger, table)` pairs of a database.
    pub fn triggers(&self, database: &str) -> Vec<(String, String)> {
        self.database(database)
            .map(|db| {
                db.triggers
                    .iter()
                    .map(|(name, trg)| (name.clone(), trg.table.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    /// Schema-only DDL of a database, one statement per entry, in the
    /// order a dump tool would emit it.
    pub fn schema_ddl(&self, database: &str) -> Vec<String> {
        let Some(db) = self.database(database) else {
            return Vec::new();
        };
        let mut ddl = Vec::new();
        for table in db.tables.keys() {
            ddl.push(format!("CREATE TABLE {} (`id` int)", quote_ident(table)));
        }
        for view in &db.views {
            ddl.push(format!("CREATE VIEW {} AS SELECT 1 AS `one`", quote_ident(view)));
        }
        for routine in &db.routines {
            ddl.push(format!(
                "CREATE DEFINER=`root`@`%` PROCEDURE {}() BEGIN END",
                quote_ident(routine)
            ));
        }
        for event in &db.events {
            ddl.push(format!(
                "CREATE EVENT {} ON SCHEDULE EVERY 1 DAY DO SELECT 1",
                quote_ident(event)
            ));
        }
        for trigger in db.triggers.values() {
            ddl.push(trigger.statement.clone());
        }
        ddl
    }

    fn run(
        &self,
        current: &mut Option<String>,
        sql: &str,
        params: &[SqlParam],
    ) -> SqlResult<Vec<SqlRow>> {
        let mut state = self.state();
        state.statements.push(sql.to_string());

        if let Some(rule) = state.failures.iter().find(|r| sql.contains(&r.needle)) {
            return Err(server_error(rule.code, &rule.message));
        }

        let trimmed = sql.trim().trim_end_matches(';');
        let upper = trimmed.to_ascii_uppercase();

        if upper.starts_with("SELECT SCHEMA_NAME FROM INFORMATION_SCHEMA.SCHEMATA") {
            return Ok(state
                .databases
                .keys()
                .map(|db| row(&[("SCHEMA_NAME", db.as_str())]))
                .collect());
        }
        if upper.starts_with("SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES") {
            let mut rows = Vec::new();
            for (db, content) in &state.databases {
                for table in content.tables.keys() {
                    rows.push(row(&[("TABLE_SCHEMA", db.as_str()), ("TABLE_NAME", table.as_str())]));
                }
            }
            return Ok(rows);
        }
        if upper.contains("FROM INFORMATION_SCHEMA.") {
            return state.information_schema(&upper, params);
        }
        if upper.starts_with("SHOW CREATE TRIGGER") {
            let ids = idents(trimmed);
            let (db, name) = qualified_pair(&ids, current)?;
            let trigger = state
                .databases
                .get(&db)
                .and_then(|d| d.triggers.get(&name))
                .ok_or_else(|| server_error(1360, "Trigger does not exist"))?;
            return Ok(vec![row(&[
                ("Trigger", name.as_str()),
                ("sql_mode", "STRICT_TRANS_TABLES"),
                ("SQL Original Statement", trigger.statement.as_str()),
            ])]);
        }
        if upper.starts_with("SHOW OPEN TABLES") {
            let rows = state
                .open
                .iter()
                .map(|h| {
                    row(&[
                        ("Database", h.database.as_str()),
                        ("Table", h.table.as_str()),
                        ("In_use", "1"),
                        ("Name_locked", "0"),
                    ])
                })
                .collect();
            let remaining = std::mem::take(&mut state.open)
                .into_iter()
                .filter_map(|mut h| match h.kind {
                    HandleKind::Transient(n) if n <= 1 => None,
                    HandleKind::Transient(n) => {
                        h.kind = HandleKind::Transient(n - 1);
                        Some(h)
                    }
                    _ => Some(h),
                })
                .collect();
            state.open = remaining;
            return Ok(rows);
        }
        if upper.starts_with("FLUSH TABLES") {
            state.open.retain(|h| h.kind != HandleKind::Cached);
            return Ok(Vec::new());
        }
        if upper.starts_with("USE ") {
            let ids = idents(trimmed);
            let db = ids
                .first()
                .cloned()
                .ok_or_else(|| server_error(1064, "USE without database"))?;
            if !state.databases.contains_key(&db) {
                return Err(server_error(1049, &format!("Unknown database '{db}'")));
            }
            *current = Some(db);
            return Ok(Vec::new());
        }
        if upper.starts_with("SET ") {
            return Ok(Vec::new());
        }
        if upper.starts_with("CREATE DATABASE IF NOT EXISTS") {
            let db = first_ident(trimmed)?;
            state.databases.entry(db).or_default();
            return Ok(Vec::new());
        }
        if upper.starts_with("DROP DATABASE IF EXISTS") {
            let db = first_ident(trimmed)?;
            state.databases.remove(&db);
            state.open.retain(|h| h.database != db);
            return Ok(Vec::new());
        }
        if upper.starts_with("DROP TABLE IF EXISTS") {
            let ids = idents(trimmed);
            let (db, table) = qualified_pair(&ids, current)?;
            if let Some(content) = state.databases.get_mut(&db) {
                content.tables.remove(&table);
                content.triggers.retain(|_, t| t.table != table);
            }
            return Ok(Vec::new());
        }
        if upper.starts_with("DROP TRIGGER IF EXISTS") {
            let ids = idents(trimmed);
            let (db, name) = qualified_pair(&ids, current)?;
            if let Some(content) = state.databases.get_mut(&db) {
                content.triggers.remove(&name);
            }
            return Ok(Vec::new());
        }
        if upper.starts_with("RENAME TABLE") {
            return state.rename_table(trimmed).map(|_| Vec::new());
        }
        if upper.starts_with("CREATE") {
            return state.create_object(trimmed, &upper, current).map(|_| Vec::new());
        }

        Err(server_error(
            1064,
            &format!("You have an error in your SQL syntax near '{trimmed}'"),
        ))
    }
}

impl ServerState {
    fn information_schema(&self, upper: &str, params: &[SqlParam]) -> SqlResult<Vec<SqlRow>> {
        let schema = text_param(params, 0)?;
        let Some(db) = self.databases.get(&schema) else {
            return if upper.starts_with("SELECT COUNT(*)") {
                Ok(vec![row(&[("COUNT(*)", "0")])])
            } else {
                Ok(Vec::new())
            };
        };

        if upper.contains("EVENT_OBJECT_TABLE") {
            let table = text_param(params, 1)?;
            return Ok(db
                .triggers
                .iter()
                .filter(|(_, t)| t.table == table)
                .map(|(name, _)| row(&[("TRIGGER_NAME", name.as_str())]))
                .collect());
        }

        let (column, names): (&str, Vec<&String>) = if upper.contains("INFORMATION_SCHEMA.TABLES") {
            ("TABLE_NAME", db.tables.keys().collect())
        } else if upper.contains("INFORMATION_SCHEMA.VIEWS") {
            ("TABLE_NAME", db.views.iter().collect())
        } else if upper.contains("INFORMATION_SCHEMA.TRIGGERS") {
            ("TRIGGER_NAME", db.triggers.keys().collect())
        } else if upper.contains("INFORMATION_SCHEMA.ROUTINES") {
            ("ROUTINE_NAME", db.routines.iter().collect())
        } else if upper.contains("INFORMATION_SCHEMA.EVENTS") {
            ("EVENT_NAME", db.events.iter().collect())
        } else {
            return Err(server_error(1109, "Unknown table in information_schema"));
        };

        if upper.starts_with("SELECT COUNT(*)") {
            let name = text_param(params, 1)?;
            let count = names.iter().filter(|n| ***n == name).count();
            return Ok(vec![row(&[("COUNT(*)", count.to_string().as_str())])]);
        }
        Ok(names.into_iter().map(|n| row(&[(column, n.as_str())])).collect())
    }

    fn rename_table(&mut self, sql: &str) -> SqlResult<()> {
        let ids = idents(sql);
        let [from_db, from_table, to_db, to_table] = ids.as_slice() else {
            return Err(server_error(1064, "RENAME TABLE expects qualified names"));
        };

        let source = self
            .databases
            .get(from_db)
            .and_then(|d| d.tables.get(from_table))
            .cloned()
            .ok_or_else(|| {
                server_error(1146, &format!("Table '{from_db}.{from_table}' doesn't exist"))
            })?;
        let target = self
            .databases
            .get(to_db)
            .ok_or_else(|| server_error(1049, &format!("Unknown database '{to_db}'")))?;
        if target.tables.contains_key(to_table) {
            return Err(server_error(
                1050,
                &format!("Table '{to_table}' already exists"),
            ));
        }
        let has_triggers = self
            .databases
            .get(from_db)
            .map(|d| d.triggers.values().any(|t| &t.table == from_table))
            .unwrap_or(false);
        if has_triggers && from_db != to_db {
            return Err(server_error(1435, "Trigger in wrong schema"));
        }

        if let Some(db) = self.databases.get_mut(from_db) {
            db.tables.remove(from_table);
        }
        if let Some(db) = self.databases.get_mut(to_db) {
            db.tables.insert(to_table.clone(), source);
        }
        Ok(())
    }

    fn create_object(
        &mut self,
        sql: &str,
        upper: &str,
        current: &Option<String>,
    ) -> SqlResult<()> {
        const KINDS: &[&str] = &[" TABLE ", " VIEW ", " PROCEDURE ", " FUNCTION ", " EVENT ", " TRIGGER "];
        let (pos, kind) = KINDS
            .iter()
            .filter_map(|k| upper.find(k).map(|p| (p, k.trim())))
            .min_by_key(|(p, _)| *p)
            .ok_or_else(|| server_error(1064, "Unsupported CREATE statement"))?;
        let rest = &sql[pos..];

        if kind == "TABLE" && upper.contains(" LIKE ") {
            let ids = idents(rest);
            let [db, table, like_db, like_table] = ids.as_slice() else {
                return Err(server_error(1064, "CREATE TABLE LIKE expects qualified names"));
            };
            if !self
                .databases
                .get(like_db)
                .is_some_and(|d| d.tables.contains_key(like_table))
            {
                return Err(server_error(
                    1146,
                    &format!("Table '{like_db}.{like_table}' doesn't exist"),
                ));
            }
            let target = self
                .databases
                .get_mut(db)
                .ok_or_else(|| server_error(1049, &format!("Unknown database '{db}'")))?;
            if !target.tables.contains_key(table) {
                target.tables.insert(table.clone(), FakeTable { rows: 0 });
            } else if !upper.contains("IF NOT EXISTS") {
                return Err(server_error(1050, &format!("Table '{table}' already exists")));
            }
            return Ok(());
        }

        let ids = idents(rest);
        let name = ids
            .first()
            .cloned()
            .ok_or_else(|| server_error(1064, "CREATE without object name"))?;
        let db_name = current
            .clone()
            .ok_or_else(|| server_error(1046, "No database selected"))?;
        let db = self
            .databases
            .get_mut(&db_name)
            .ok_or_else(|| server_error(1049, &format!("Unknown database '{db_name}'")))?;

        match kind {
            "TABLE" | "VIEW" => {
                if db.tables.contains_key(&name) || db.views.contains(&name) {
                    return Err(server_error(1050, &format!("Table '{name}' already exists")));
                }
                if kind == "TABLE" {
                    db.tables.insert(name, FakeTable::default());
                } else {
                    db.views.insert(name);
                }
            }
            "PROCEDURE" | "FUNCTION" => {
                if !db.routines.insert(name.clone()) {
                    return Err(server_error(1304, &format!("{kind} {name} already exists")));
                }
            }
            "EVENT" => {
                if !db.events.insert(name.clone()) {
                    return Err(server_error(1537, &format!("Event '{name}' already exists")));
                }
            }
            _ => {
                let table = ids
                    .get(1)
                    .cloned()
                    .ok_or_else(|| server_error(1064, "CREATE TRIGGER without table"))?;
                if !db.tables.contains_key(&table) {
                    return Err(server_error(
                        1146,
                        &format!("Table '{db_name}.{table}' doesn't exist"),
                    ));
                }
                if db.triggers.contains_key(&name) {
                    return Err(server_error(1359, "Trigger already exists"));
                }
                db.triggers.insert(
                    name,
                    FakeTrigger {
                        table,
                        statement: sql.to_string(),
                    },
                );
            }
        }
        Ok(())
    }
}

/// A session on a [`FakeMysql`], tracking its own `USE` state.
#[derive(Debug)]
pub struct FakeSession {
    server: FakeMysql,
    current: Mutex<Option<String>>,
}

impl FakeSession {
    pub fn current_database(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SqlExecutor for FakeSession {
    fn endpoint(&self) -> &Endpoint {
        &self.server.endpoint
    }

    async fn query(&self, sql: &str, params: &[SqlParam]) -> SqlResult<Vec<SqlRow>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        self.server.run(&mut current, sql, params)
    }

    async fn exec(&self, sql: &str, params: &[SqlParam]) -> SqlResult<u64> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        self.server
            .run(&mut current, sql, params)
            .map(|rows| rows.len() as u64)
    }
}

/// Set of fake instances reachable by endpoint.
#[derive(Clone, Debug, Default)]
pub struct FakeFleet {
    servers: BTreeMap<Endpoint, FakeMysql>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, server: FakeMysql) -> Self {
        self.servers.insert(server.endpoint().clone(), server);
        self
    }

    pub fn server(&self, endpoint: &Endpoint) -> Option<&FakeMysql> {
        self.servers.get(endpoint)
    }
}

#[async_trait]
impl Connector for FakeFleet {
    async fn connect(&self, endpoint: &Endpoint) -> SqlResult<Arc<dyn SqlExecutor>> {
        let server = self.servers.get(endpoint).ok_or_else(|| SqlError::Connect {
            endpoint: endpoint.clone(),
            message: "Connection refused".to_string(),
        })?;
        Ok(Arc::new(server.session()))
    }
}

fn server_error(code: u16, message: &str) -> SqlError {
    SqlError::Server {
        code,
        message: message.to_string(),
    }
}

fn row(columns: &[(&str, &str)]) -> SqlRow {
    SqlRow::new(
        columns
            .iter()
            .map(|(name, value)| (name.to_string(), Some(value.to_string())))
            .collect(),
    )
}

fn text_param(params: &[SqlParam], index: usize) -> SqlResult<String> {
    match params.get(index) {
        Some(SqlParam::Text(value)) => Ok(value.clone()),
        Some(SqlParam::Int(value)) => Ok(value.to_string()),
        None => Err(server_error(1210, "Incorrect arguments to EXECUTE")),
    }
}

fn first_ident(sql: &str) -> SqlResult<String> {
    idents(sql)
        .into_iter()
        .next()
        .ok_or_else(|| server_error(1064, "missing identifier"))
}

/// `db`.`name`, or `name` resolved against the session database.
fn qualified_pair(ids: &[String], current: &Option<String>) -> SqlResult<(String, String)> {
    match ids {
        [db, name, ..] => Ok((db.clone(), name.clone())),
        [name] => current
            .clone()
            .map(|db| (db, name.clone()))
            .ok_or_else(|| server_error(1046, "No database selected")),
        [] => Err(server_error(1064, "missing identifier")),
    }
}

/// Backtick-quoted identifiers in order of appearance.
fn idents(sql: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '`' {
            continue;
        }
        let mut ident = String::new();
        while let Some(c) = chars.next() {
            if c == '`' {
                if chars.peek() == Some(&'`') {
                    chars.next();
                    ident.push('`');
                } else {
                    break;
                }
            } else {
                ident.push(c);
            }
        }
        out.push(ident);
    }
    out
}
