//! Scripted connector used by unit tests.
//!
//! Commands are answered by rules matched on a substring of the command
//! text. `USE` statements and the database-existence probe are handled
//! without rules so reconnect logic can be exercised.

use crate::database::backend::{Connector, ParameterValue, SqlCommand, SqlSession};
use crate::database::query::QueryResult;
use crate::database::settings::ConnectionSettings;
use crate::database::types::SqlValue;
use crate::error::{ConnectionError, SqlError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;

static USE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\buse(?:\s*\[((?:[^\]]|\]\])*)\]|\s+([^\s;\[]+))").expect("valid regex")
});

/// How a scripted command fails.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Server error; the session stays open unless the class is fatal.
    Sql(SqlError),
    /// Transport failure; the session is closed.
    Disconnect,
}

impl MockFailure {
    pub fn sql(number: u32, class: u8) -> Self {
        MockFailure::Sql(SqlError::new(number, class, format!("mock error {}", number)))
    }

    fn to_error(&self) -> ConnectionError {
        match self {
            MockFailure::Sql(e) => ConnectionError::Sql(e.clone()),
            MockFailure::Disconnect => ConnectionError::connection("connection reset by peer"),
        }
    }

    fn closes_session(&self) -> bool {
        match self {
            MockFailure::Sql(e) => e.is_fatal(),
            MockFailure::Disconnect => true,
        }
    }
}

#[derive(Debug, Clone)]
enum Response {
    Result { result: QueryResult, rows: u64 },
    Fail(MockFailure),
    Hang,
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    response: Response,
    once: bool,
}

#[derive(Debug)]
struct MockState {
    server_version: String,
    login_database: String,
    databases: Vec<String>,
    rules: Vec<Rule>,
    open_failures: VecDeque<MockFailure>,
    password_failure: Option<MockFailure>,
    executed: Vec<SqlCommand>,
    password_changes: Vec<String>,
    opened_with: Vec<String>,
    opens: usize,
    closes: usize,
    generation: u64,
}

/// A connector answering commands from scripted rules.
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                server_version: "16.0.1000.6".to_string(),
                login_database: "master".to_string(),
                databases: vec!["master".to_string(), "tempdb".to_string()],
                rules: Vec::new(),
                open_failures: VecDeque::new(),
                password_failure: None,
                executed: Vec::new(),
                password_changes: Vec::new(),
                opened_with: Vec::new(),
                opens: 0,
                closes: 0,
                generation: 0,
            })),
        }
    }

    pub fn with_version(self, version: &str) -> Self {
        self.state.lock().server_version = version.to_string();
        self
    }

    pub fn add_database(&self, name: &str) {
        self.state.lock().databases.push(name.to_string());
    }

    fn push_rule(&self, pattern: &str, response: Response, once: bool) {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            response,
            once,
        });
    }

    /// Answer commands containing `pattern` with `result`.
    pub fn respond(&self, pattern: &str, result: QueryResult) {
        self.push_rule(pattern, Response::Result { result, rows: 0 }, false);
    }

    /// Answer commands containing `pattern` with a single value.
    pub fn scalar(&self, pattern: &str, value: impl Into<SqlValue>) {
        self.respond(pattern, QueryResult::single_value(value.into()));
    }

    /// Report `rows` affected for commands containing `pattern`.
    pub fn rows(&self, pattern: &str, rows: u64) {
        self.push_rule(
            pattern,
            Response::Result {
                result: QueryResult::empty(),
                rows,
            },
            false,
        );
    }

    pub fn fail(&self, pattern: &str, failure: MockFailure) {
        self.push_rule(pattern, Response::Fail(failure), false);
    }

    pub fn fail_once(&self, pattern: &str, failure: MockFailure) {
        self.push_rule(pattern, Response::Fail(failure), true);
    }

    /// Commands containing `pattern` never complete.
    pub fn hang(&self, pattern: &str) {
        self.push_rule(pattern, Response::Hang, false);
    }

    /// Fail the next login.
    pub fn fail_open(&self, failure: MockFailure) {
        self.state.lock().open_failures.push_back(failure);
    }

    pub fn fail_password_change(&self, failure: MockFailure) {
        self.state.lock().password_failure = Some(failure);
    }

    /// Close every open session, as a server restart would.
    pub fn kill_sessions(&self) {
        self.state.lock().generation += 1;
    }

    /// Texts of every command received, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.iter().map(|c| c.text.clone()).collect()
    }

    pub fn executed_commands(&self) -> Vec<SqlCommand> {
        self.state.lock().executed.clone()
    }

    pub fn clear_executed(&self) {
        self.state.lock().executed.clear();
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Connection strings used for each login.
    pub fn opened_with(&self) -> Vec<String> {
        self.state.lock().opened_with.clone()
    }

    pub fn password_changes(&self) -> Vec<String> {
        self.state.lock().password_changes.clone()
    }

    pub fn into_connector(self) -> Arc<dyn Connector> {
        Arc::new(self)
    }
}

/// A session created by [`MockConnector`].
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    database: String,
    server_version: String,
    open: bool,
    generation: u64,
}

impl MockSession {
    fn respond(&mut self, command: &SqlCommand) -> Response {
        let mut state = self.state.lock();
        state.executed.push(command.clone());

        if command.text.contains("db_id(@db_name)") {
            let exists = command.parameters.iter().any(|p| match &p.value {
                ParameterValue::NVarChar(name) => state.databases.contains(name),
                _ => false,
            });
            return Response::Result {
                result: QueryResult::single_value(SqlValue::I32(i32::from(exists))),
                rows: 0,
            };
        }

        if let Some(idx) = state
            .rules
            .iter()
            .position(|r| r.once && command.text.contains(&r.pattern))
        {
            return state.rules.remove(idx).response;
        }

        state
            .rules
            .iter()
            .find(|r| command.text.contains(&r.pattern))
            .map(|r| r.response.clone())
            .unwrap_or(Response::Result {
                result: QueryResult::empty(),
                rows: 0,
            })
    }

    async fn run(&mut self, command: &SqlCommand) -> Result<(QueryResult, u64), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::connection("The session is closed"));
        }

        match self.respond(command) {
            Response::Result { result, rows } => {
                if let Some(caps) = USE_TARGET.captures_iter(&command.text).last() {
                    let name = caps
                        .get(1)
                        .map(|m| m.as_str().replace("]]", "]"))
                        .or_else(|| caps.get(2).map(|m| m.as_str().to_string()));
                    if let Some(name) = name {
                        self.database = name;
                    }
                }
                Ok((result, rows))
            }
            Response::Fail(failure) => {
                if failure.closes_session() {
                    self.open = false;
                }
                Err(failure.to_error())
            }
            Response::Hang => {
                std::future::pending::<()>().await;
                Err(ConnectionError::internal("unreachable"))
            }
        }
    }
}

#[async_trait]
impl SqlSession for MockSession {
    async fn execute_non_query(&mut self, command: &SqlCommand) -> Result<u64, ConnectionError> {
        self.run(command).await.map(|(_, rows)| rows)
    }

    async fn execute_query(&mut self, command: &SqlCommand) -> Result<QueryResult, ConnectionError> {
        self.run(command).await.map(|(result, _)| result)
    }

    async fn change_database(&mut self, database: &str) -> Result<(), ConnectionError> {
        self.state
            .lock()
            .executed
            .push(SqlCommand::new(format!("USE [{}]", database)));
        self.database = database.to_string();
        Ok(())
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn server_version(&self) -> &str {
        &self.server_version
    }

    fn is_open(&self) -> bool {
        self.open && self.generation == self.state.lock().generation
    }

    fn invalidate(&mut self) {
        self.open = false;
    }

    async fn close(self: Box<Self>) -> Result<(), ConnectionError> {
        self.state.lock().closes += 1;
        Ok(())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn SqlSession>, ConnectionError> {
        let initial_catalog = settings.initial_catalog()?;
        let connection_string = settings.connection_string()?;

        let mut state = self.state.lock();
        state.opens += 1;
        state.opened_with.push(connection_string);
        if let Some(failure) = state.open_failures.pop_front() {
            return Err(failure.to_error());
        }

        let database = if initial_catalog.is_empty() {
            state.login_database.clone()
        } else {
            initial_catalog
        };

        Ok(Box::new(MockSession {
            state: self.state.clone(),
            database,
            server_version: state.server_version.clone(),
            open: true,
            generation: state.generation,
        }))
    }

    async fn change_password(
        &self,
        _settings: &ConnectionSettings,
        new_password: &str,
    ) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if let Some(failure) = &state.password_failure {
            return Err(failure.to_error());
        }
        state.password_changes.push(new_password.to_string());
        Ok(())
    }
}

/// The three result sets of the server discovery batch.
pub fn server_discovery(
    engine_type: i32,
    edition: i32,
    product_version: &str,
    host_platform: &str,
    protocol: Option<&str>,
) -> QueryResult {
    use crate::database::query::{ColumnInfo, ResultRow, ResultSet};

    QueryResult {
        result_sets: vec![
            ResultSet::new(
                vec![
                    ColumnInfo::new("DatabaseEngineType", "INT"),
                    ColumnInfo::new("DatabaseEngineEdition", "INT"),
                    ColumnInfo::new("ProductVersion", "NVARCHAR"),
                    ColumnInfo::new("MicrosoftVersion", "BIGINT"),
                ],
                vec![ResultRow::new(vec![
                    SqlValue::I32(engine_type),
                    SqlValue::I32(edition),
                    SqlValue::from(product_version),
                    SqlValue::I64(0x1000_03E8),
                ])],
            ),
            ResultSet::new(
                vec![ColumnInfo::new("host_platform", "NVARCHAR")],
                vec![ResultRow::new(vec![SqlValue::from(host_platform)])],
            ),
            ResultSet::new(
                vec![ColumnInfo::new("ConnectionProtocol", "NVARCHAR")],
                vec![ResultRow::new(vec![protocol
                    .map(SqlValue::from)
                    .unwrap_or(SqlValue::Null)])],
            ),
        ],
        ..QueryResult::default()
    }
}
