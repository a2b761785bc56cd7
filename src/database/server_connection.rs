//! Statement execution, transactions and login metadata on top of
//! [`ConnectionManager`].

use crate::cache::{ExecutionCache, SqlBatch};
use crate::constants::{
    COMMAND_CACHE_SIZE, DEFAULT_BATCH_SEPARATOR, DEFAULT_STATEMENT_TIMEOUT_SECS,
    ERROR_NO_TRANSACTION_TO_COMMIT, ERROR_NO_TRANSACTION_TO_ROLLBACK, ERROR_USER_PRIVILEGE_DENIED,
    FATAL_SEVERITY, REMOTE_LOGIN_FAILED_RANGE,
};
use crate::database::auth::RenewableToken;
use crate::database::backend::{Connector, SqlCommand};
use crate::database::batch::{get_statements, StatementList};
use crate::database::comparer::{ConnectionFactory, ServerComparer};
use crate::database::connection::{CancelHandle, ConnectionManager, ExecuteKind, ExecuteOutput};
use crate::database::enums::{
    AutoDisconnectMode, DeferredUseMode, ExecutionTypes, FixedServerRoles,
    QueryParameterizationMode, ServerType, ServerUserProfiles, SqlExecutionModes,
};
use crate::database::parameterize::{parameterize, parse_use_statement};
use crate::database::query::QueryResult;
use crate::database::settings::ConnectionSettings;
use crate::database::types::SqlValue;
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-connection switches for how SQL text is prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    pub parameterization: QueryParameterizationMode,
    pub deferred_use: DeferredUseMode,
    /// Serve repeated `execute_scalar` calls from the command cache.
    pub cached_queries: bool,
}

/// A connection returned by [`ServerConnection::database_connection`].
pub enum DatabaseConnection<'a> {
    /// The connection the request was made on.
    Current(&'a mut ServerConnection),
    /// A pooled connection shared through the connection factory.
    Shared(Arc<tokio::sync::Mutex<ServerConnection>>),
    /// A fresh non-pooled connection owned by the caller.
    Dedicated(Box<ServerConnection>),
}

/// A connection to a database engine.
#[derive(Debug)]
pub struct ServerConnection {
    manager: ConnectionManager,
    statement_timeout: u32,
    batch_separator: String,
    execution_modes: SqlExecutionModes,
    options: ExecutionOptions,
    command_cache: ExecutionCache<String, SqlBatch>,
    true_login: Option<String>,
    true_name: Option<String>,
    comparer: Option<ServerComparer>,
}

impl Default for ServerConnection {
    fn default() -> Self {
        Self::from_settings(ConnectionSettings::default())
    }
}

impl ServerConnection {
    /// A connection using the tiberius connector.
    pub fn from_settings(settings: ConnectionSettings) -> Self {
        Self::from_manager(ConnectionManager::with_tds(settings))
    }

    /// A connection opening sessions through `connector`.
    pub fn with_connector(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        Self::from_manager(ConnectionManager::new(settings, connector))
    }

    /// Integrated-security connection to `server_instance`.
    pub fn for_server(server_instance: &str) -> Result<Self, ConnectionError> {
        Ok(Self::from_settings(ConnectionSettings::for_server(
            server_instance,
        )?))
    }

    /// SQL login connection.
    pub fn with_login(
        server_instance: &str,
        login: &str,
        password: &str,
    ) -> Result<Self, ConnectionError> {
        Ok(Self::from_settings(ConnectionSettings::with_login(
            server_instance,
            login,
            password,
        )?))
    }

    /// Connection described by an explicit connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConnectionError> {
        Ok(Self::from_settings(ConnectionSettings::from_connection_string(
            connection_string,
        )?))
    }

    /// Connection authenticating with an access token.
    pub fn with_access_token(
        connection_string: &str,
        token: Arc<dyn RenewableToken>,
    ) -> Result<Self, ConnectionError> {
        let mut settings = ConnectionSettings::from_connection_string(connection_string)?;
        settings.set_access_token(Some(token))?;
        Ok(Self::from_settings(settings))
    }

    fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT_SECS,
            batch_separator: DEFAULT_BATCH_SEPARATOR.to_string(),
            execution_modes: SqlExecutionModes::EXECUTE_SQL,
            options: ExecutionOptions::default(),
            command_cache: ExecutionCache::new(COMMAND_CACHE_SIZE),
            true_login: None,
            true_name: None,
            comparer: None,
        }
    }

    /// A disconnected copy sharing the settings, timeouts, separator,
    /// execution modes and cached login names.
    pub fn copy(&self) -> Self {
        let mut manager =
            ConnectionManager::new(self.manager.settings().copy_settings(), self.manager.connector());
        manager.set_connect_retry(self.manager.connect_retry().clone());
        manager.set_auto_disconnect_mode(self.manager.auto_disconnect_mode());

        let mut copy = Self::from_manager(manager);
        copy.statement_timeout = self.statement_timeout;
        copy.batch_separator = self.batch_separator.clone();
        copy.execution_modes = self.execution_modes;
        copy.options = self.options;
        copy.true_login = self.true_login.clone();
        copy.true_name = self.true_name.clone();
        copy
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ConnectionManager {
        &mut self.manager
    }

    pub fn settings(&self) -> &ConnectionSettings {
        self.manager.settings()
    }

    pub fn settings_mut(&mut self) -> &mut ConnectionSettings {
        self.manager.settings_mut()
    }

    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.manager.connect().await
    }

    pub async fn disconnect(&mut self) {
        self.manager.disconnect().await
    }

    pub fn is_open(&self) -> bool {
        self.manager.is_open()
    }

    pub fn connection_type(&self) -> ServerType {
        ServerType::DatabaseEngine
    }

    // -------------------------------------------------------------------------
    // Execution settings
    // -------------------------------------------------------------------------

    /// Statement timeout in seconds; 0 waits indefinitely.
    pub fn statement_timeout(&self) -> u32 {
        self.statement_timeout
    }

    pub fn set_statement_timeout(&mut self, seconds: u32) {
        self.statement_timeout = seconds;
    }

    pub fn batch_separator(&self) -> &str {
        &self.batch_separator
    }

    pub fn set_batch_separator(&mut self, separator: impl Into<String>) -> Result<(), ConnectionError> {
        let separator = separator.into();
        if separator.trim().is_empty() {
            return Err(ConnectionError::invalid_property(
                "BatchSeparator",
                separator,
                "cannot be empty",
            ));
        }
        self.batch_separator = separator;
        Ok(())
    }

    pub fn execution_modes(&self) -> SqlExecutionModes {
        self.execution_modes
    }

    pub fn set_execution_modes(&mut self, modes: SqlExecutionModes) {
        self.execution_modes = modes;
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        self.options
    }

    /// Change the execution options. A deferred-use mode other than `None`
    /// keeps the session open between operations.
    pub fn set_execution_options(&mut self, options: ExecutionOptions) {
        self.options = options;
        self.manager.deferred_use_active = options.deferred_use > DeferredUseMode::None;
    }

    pub fn command_cache(&self) -> &ExecutionCache<String, SqlBatch> {
        &self.command_cache
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.manager.cancel_handle()
    }

    /// Cancel the command currently running on this connection.
    pub fn cancel(&self) {
        self.manager.cancel_handle().cancel();
    }

    // -------------------------------------------------------------------------
    // Command preparation
    // -------------------------------------------------------------------------

    fn statement_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.statement_timeout))
    }

    /// Parameterize `text`, reusing a cached command for the same shape.
    fn prepare_command(&mut self, text: &str) -> SqlCommand {
        let parameterized = parameterize(text, self.options.parameterization);
        let timeout = self.statement_duration();

        if !parameterized.is_parameterized() {
            return SqlCommand::new(parameterized.text).with_timeout(timeout);
        }

        if let Some(batch) = self.command_cache.get_mut(&parameterized.text) {
            batch.record_execution();
            batch.command.rebind(&parameterized.parameters);
            return batch.command.clone().with_timeout(timeout);
        }

        let command = SqlCommand::new(parameterized.text)
            .with_parameters(parameterized.parameters)
            .with_timeout(timeout);
        self.command_cache.add(SqlBatch::new(command.clone()));
        command
    }

    /// Whether `text` only switches to the database that is already current.
    fn is_redundant_use(&self, text: &str) -> bool {
        if self.options.deferred_use < DeferredUseMode::CollapseRedundant {
            return false;
        }
        match parse_use_statement(text.trim()) {
            Some(statement) if statement.whole_text => {
                statement.database == self.manager.current_database()
            }
            _ => false,
        }
    }

    /// Record and announce a statement. Returns whether it should be sent.
    fn dispatch(&mut self, text: &str) -> bool {
        if self.execution_modes.captures() {
            self.manager.captured_sql_mut().add(text);
        }
        self.manager.notify_statement(text);
        self.execution_modes.executes()
    }

    async fn refresh_transaction_depth(&mut self, error: &ConnectionError) {
        let fatal = error.severity().is_some_and(|s| s >= FATAL_SEVERITY);
        if self.manager.transaction_depth <= 0 || fatal || !self.manager.is_open() {
            self.manager.transaction_depth = 0;
            return;
        }

        match self
            .manager
            .query_session(&SqlCommand::new("select @@TRANCOUNT"))
            .await
        {
            Ok(result) => {
                self.manager.transaction_depth =
                    result.scalar().and_then(SqlValue::as_i32).unwrap_or(0);
            }
            Err(e) => {
                debug!("Could not refresh the transaction depth: {}", e);
                self.manager.transaction_depth = 0;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Non-query execution
    // -------------------------------------------------------------------------

    /// Execute a script, returning the total number of rows affected.
    pub async fn execute_non_query(
        &mut self,
        sql: &str,
        types: ExecutionTypes,
        retry: bool,
    ) -> Result<u64, ConnectionError> {
        let list = get_statements(sql, types, &self.batch_separator);

        if !self.execution_modes.executes() {
            for statement in &list.statements {
                self.dispatch(statement);
            }
            return Ok(0);
        }

        self.manager.check_disconnected("ExecuteNonQuery")?;
        self.manager.pool_connect().await?;
        let result = self.run_statements(&list, types, retry).await;
        self.manager.pool_disconnect().await;
        result
    }

    async fn run_statements(
        &mut self,
        list: &StatementList,
        types: ExecutionTypes,
        retry: bool,
    ) -> Result<u64, ConnectionError> {
        let mut total = 0u64;

        for (executed, statement) in list.statements.iter().enumerate() {
            match self.run_statement(statement, retry).await {
                Ok(rows) => total += rows,
                Err(e) => {
                    self.refresh_transaction_depth(&e).await;

                    if types.contains(ExecutionTypes::CONTINUE_ON_ERROR) {
                        warn!("Statement failed, continuing: {}", e);
                        continue;
                    }

                    if executed > 0 && e.severity().unwrap_or(0) <= FATAL_SEVERITY {
                        for statement in list.reversal(executed) {
                            if let Err(undo) = self.run_statement(statement, retry).await {
                                warn!("Failed to restore session option: {}", undo);
                            }
                        }
                    }

                    return Err(ConnectionError::execution_failure(e));
                }
            }
        }

        Ok(total)
    }

    async fn run_statement(&mut self, statement: &str, retry: bool) -> Result<u64, ConnectionError> {
        if self.is_redundant_use(statement) {
            debug!("Skipping redundant {}", statement.trim());
            return Ok(0);
        }

        let command = self.prepare_command(statement);
        if !self.dispatch(statement) {
            return Ok(0);
        }

        Ok(self
            .manager
            .execute_command(ExecuteKind::NonQuery, &command, retry)
            .await?
            .rows_affected())
    }

    /// Execute several scripts on one session.
    pub async fn execute_non_query_batch(
        &mut self,
        scripts: &[String],
        types: ExecutionTypes,
        retry: bool,
    ) -> Result<Vec<u64>, ConnectionError> {
        let mode = self.hold_session();
        let mut results = Vec::with_capacity(scripts.len());
        let mut outcome = Ok(());
        for script in scripts {
            match self.execute_non_query(script, types, retry).await {
                Ok(rows) => results.push(rows),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.release_session(mode).await;
        outcome.map(|_| results)
    }

    /// Suspend auto-disconnect so consecutive operations share a session.
    fn hold_session(&mut self) -> AutoDisconnectMode {
        let mode = self.manager.auto_disconnect_mode();
        self.manager
            .set_auto_disconnect_mode(AutoDisconnectMode::NoAutoDisconnect);
        mode
    }

    async fn release_session(&mut self, mode: AutoDisconnectMode) {
        self.manager.set_auto_disconnect_mode(mode);
        self.manager.pool_disconnect().await;
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    async fn run_query(&mut self, text: &str, retry: bool) -> Result<QueryResult, ConnectionError> {
        let command = self.prepare_command(text);
        self.manager.check_disconnected("ExecuteWithResults")?;
        self.manager.pool_connect().await?;
        let result = self
            .manager
            .execute_command(ExecuteKind::Query, &command, retry)
            .await
            .map(ExecuteOutput::into_results);
        if let Err(e) = &result {
            self.refresh_transaction_depth(e).await;
        }
        self.manager.pool_disconnect().await;
        result
    }

    /// Execute `sql` and buffer every result set. `None` in capture-only mode.
    pub async fn execute_with_results(
        &mut self,
        sql: &str,
        retry: bool,
    ) -> Result<Option<QueryResult>, ConnectionError> {
        if !self.dispatch(sql) {
            return Ok(None);
        }
        self.run_query(sql, retry)
            .await
            .map(Some)
            .map_err(ConnectionError::execution_failure)
    }

    /// Execute several scripts on one session.
    pub async fn execute_with_results_batch(
        &mut self,
        scripts: &[String],
        retry: bool,
    ) -> Result<Vec<Option<QueryResult>>, ConnectionError> {
        let mode = self.hold_session();
        let mut results = Vec::with_capacity(scripts.len());
        let mut outcome = Ok(());
        for script in scripts {
            match self.execute_with_results(script, retry).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.release_session(mode).await;
        outcome.map(|_| results)
    }

    /// Execute `sql` and return its rows.
    ///
    /// Returns `None` for empty text, for a `USE` of the current database
    /// when redundant `USE` statements are collapsed, and in capture-only mode.
    pub async fn execute_reader(&mut self, sql: &str) -> Result<Option<QueryResult>, ConnectionError> {
        if sql.trim().is_empty() || self.is_redundant_use(sql) {
            return Ok(None);
        }
        if !self.dispatch(sql) {
            return Ok(None);
        }
        self.run_query(sql, true)
            .await
            .map(Some)
            .map_err(ConnectionError::execution_failure)
    }

    /// First column of the first row, or `None` when there is none.
    ///
    /// With cached queries on, the first value of each query text is kept and
    /// later calls answer from the cache.
    pub async fn execute_scalar(&mut self, sql: &str) -> Result<Option<SqlValue>, ConnectionError> {
        if !self.dispatch(sql) {
            return Ok(None);
        }
        self.manager.check_disconnected("ExecuteScalar")?;

        let key = parameterize(sql, self.options.parameterization).text;
        if self.options.cached_queries {
            if let Some(value) = self.command_cache.get(&key).and_then(SqlBatch::result) {
                debug!("Scalar served from cache");
                return Ok(Some(value.clone()));
            }
        }

        let value = self
            .run_query(sql, true)
            .await
            .map_err(ConnectionError::execution_failure)?
            .scalar()
            .cloned();

        if let (true, Some(value)) = (self.options.cached_queries, &value) {
            if self.command_cache.get(&key).is_none() {
                let command = SqlCommand::new(key.clone()).with_timeout(self.statement_duration());
                self.command_cache.add(SqlBatch::new(command));
            }
            if let Some(batch) = self.command_cache.get_mut(&key) {
                batch.set_result(value.clone());
            }
        }
        Ok(value)
    }

    /// Scalars of several queries on one session.
    pub async fn execute_scalar_batch(
        &mut self,
        queries: &[String],
    ) -> Result<Vec<Option<SqlValue>>, ConnectionError> {
        let mode = self.hold_session();
        let mut results = Vec::with_capacity(queries.len());
        let mut outcome = Ok(());
        for query in queries {
            match self.execute_scalar(query).await {
                Ok(value) => results.push(value),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.release_session(mode).await;
        outcome.map(|_| results)
    }

    /// Run an internal query with statements executed but not captured.
    async fn internal_scalar(&mut self, sql: &str) -> Result<Option<SqlValue>, ConnectionError> {
        let modes = self.execution_modes;
        self.execution_modes = SqlExecutionModes::EXECUTE_SQL;
        let result = self.execute_scalar(sql).await;
        self.execution_modes = modes;
        result
    }

    /// Run a prepared command under pool connect/disconnect.
    pub(crate) async fn query_command(
        &mut self,
        command: SqlCommand,
    ) -> Result<QueryResult, ConnectionError> {
        self.manager.check_disconnected("ExecuteWithResults")?;
        self.manager.pool_connect().await?;
        let result = self
            .manager
            .execute_command(ExecuteKind::Query, &command, true)
            .await
            .map(ExecuteOutput::into_results);
        self.manager.pool_disconnect().await;
        result
    }

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Run a transaction statement on a pooled session, executed even in capture mode.
    async fn run_transaction_statement(&mut self, sql: &str) -> Result<(), ConnectionError> {
        self.manager.check_disconnected("Transaction")?;
        self.manager.pool_connect().await?;

        let modes = self.execution_modes;
        self.execution_modes = SqlExecutionModes::EXECUTE_SQL;
        let result = self.run_statement(sql, false).await;
        self.execution_modes = modes;
        result.map(|_| ())
    }

    /// `BEGIN TRANSACTION`; the session stays open until the transaction ends.
    pub async fn begin_transaction(&mut self) -> Result<(), ConnectionError> {
        let result = self.run_transaction_statement("BEGIN TRANSACTION").await;
        if result.is_ok() {
            self.manager.transaction_depth += 1;
        }
        self.manager.pool_disconnect().await;
        result
    }

    pub async fn commit_transaction(&mut self) -> Result<(), ConnectionError> {
        self.end_transaction("COMMIT", ERROR_NO_TRANSACTION_TO_COMMIT)
            .await
    }

    pub async fn rollback_transaction(&mut self) -> Result<(), ConnectionError> {
        self.end_transaction("ROLLBACK", ERROR_NO_TRANSACTION_TO_ROLLBACK)
            .await
    }

    async fn end_transaction(&mut self, verb: &str, missing: u32) -> Result<(), ConnectionError> {
        let sql = format!("if (@@trancount > 0) {} TRANSACTION", verb);
        let result = match self.run_transaction_statement(&sql).await {
            Ok(()) => {
                self.manager.transaction_depth = (self.manager.transaction_depth - 1).max(0);
                Ok(())
            }
            Err(e) if e.sql_error().is_some_and(|s| s.number == missing && s.class == 16) => {
                self.manager.transaction_depth = 0;
                Err(ConnectionError::NotInTransaction)
            }
            Err(e) => {
                self.refresh_transaction_depth(&e).await;
                Err(e)
            }
        };
        self.manager.pool_disconnect().await;
        result
    }

    /// Open transaction count of the session (`@@TRANCOUNT`).
    pub async fn transaction_depth(&mut self) -> Result<i32, ConnectionError> {
        if self.manager.is_force_disconnected() || !self.manager.is_open() {
            return Ok(self.manager.transaction_depth);
        }
        let depth = self
            .internal_scalar("select @@TRANCOUNT")
            .await?
            .and_then(|v| v.as_i32())
            .unwrap_or(0);
        self.manager.transaction_depth = depth;
        Ok(depth)
    }

    // -------------------------------------------------------------------------
    // Login metadata
    // -------------------------------------------------------------------------

    /// Fixed server roles held by the login.
    pub async fn fixed_server_roles(&mut self) -> Result<FixedServerRoles, ConnectionError> {
        self.manager.check_disconnected("FixedServerRoles")?;
        let include_bulkadmin = self.manager.server_version().await?.major > 7;

        let terms: Vec<String> = FixedServerRoles::NAMED
            .iter()
            .filter(|(name, _)| include_bulkadmin || *name != "bulkadmin")
            .map(|(name, flag)| format!("is_srvrolemember('{}') * {}", name, flag.bits()))
            .collect();
        let sql = format!("select {}", terms.join(" + "));

        let bits = self
            .internal_scalar(&sql)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        Ok(FixedServerRoles::from_bits(u32::try_from(bits).unwrap_or(0)))
    }

    pub async fn is_in_fixed_server_role(
        &mut self,
        role: FixedServerRoles,
    ) -> Result<bool, ConnectionError> {
        Ok(self.fixed_server_roles().await?.contains(role))
    }

    /// Server-level privileges of the login, `None` when the server refuses to report them.
    pub async fn user_profile(&mut self) -> Result<Option<ServerUserProfiles>, ConnectionError> {
        self.manager.check_disconnected("UserProfile")?;
        match self
            .internal_scalar("exec master.dbo.sp_MSdbuserpriv N'serv'")
            .await
        {
            Ok(value) => {
                let bits = value.and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(Some(ServerUserProfiles::from_bits(
                    u32::try_from(bits).unwrap_or(0),
                )))
            }
            Err(e)
                if e.sql_error().is_some_and(|s| {
                    s.number == ERROR_USER_PRIVILEGE_DENIED && s.class == 16
                }) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Server process id of the session (`@@SPID`).
    pub async fn process_id(&mut self) -> Result<i32, ConnectionError> {
        self.manager.check_disconnected("ProcessID")?;
        self.internal_scalar("select @@SPID")
            .await?
            .and_then(|v| v.as_i32())
            .ok_or_else(|| ConnectionError::internal("@@SPID returned no value"))
    }

    /// Login name as seen by the server (`suser_sname()`).
    pub async fn true_login(&mut self) -> Result<String, ConnectionError> {
        if let Some(login) = &self.true_login {
            return Ok(login.clone());
        }
        self.manager.check_disconnected("TrueLogin")?;
        let login = self
            .internal_scalar("select suser_sname()")
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.true_login = Some(login.clone());
        Ok(login)
    }

    /// Server name as reported by the server.
    pub async fn true_name(&mut self) -> Result<String, ConnectionError> {
        if let Some(name) = &self.true_name {
            return Ok(name.clone());
        }
        self.manager.check_disconnected("TrueName")?;

        let sql = if self.manager.server_version().await?.major <= 7 {
            "select @@SERVERNAME"
        } else {
            "select CAST(SERVERPROPERTY(N'servername') AS nvarchar(128))"
        };
        let name = self
            .internal_scalar(sql)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.true_name = Some(name.clone());
        Ok(name)
    }

    /// Set the server name used offline; rejected while a session is open.
    pub fn set_true_name(&mut self, name: impl Into<String>) -> Result<(), ConnectionError> {
        if self.manager.is_open() && !self.manager.is_force_disconnected() {
            return Err(ConnectionError::ConnectionCannotBeChanged);
        }
        self.true_name = Some(name.into());
        Ok(())
    }

    /// Change the login password and remember the new one.
    pub async fn change_password(&mut self, new_password: &str) -> Result<(), ConnectionError> {
        if new_password.is_empty() {
            return Err(ConnectionError::invalid_argument("new password cannot be empty"));
        }
        self.manager.check_disconnected("ChangePassword")?;

        let connector = self.manager.connector();
        if let Err(e) = connector
            .change_password(self.manager.settings(), new_password)
            .await
        {
            if e
                .sql_error()
                .is_some_and(|s| REMOTE_LOGIN_FAILED_RANGE.contains(&s.number))
            {
                warn!("Login password has expired and cannot be changed over this connection");
            }
            return Err(ConnectionError::ChangePasswordFailure { source: Box::new(e) });
        }

        self.manager.settings_mut().force_set_password(new_password);
        info!("Password changed for {}", self.manager.settings().login());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Database connections
    // -------------------------------------------------------------------------

    /// Comparer for database names on this server.
    pub async fn server_comparer(&mut self) -> Result<ServerComparer, ConnectionError> {
        if let Some(comparer) = &self.comparer {
            return Ok(comparer.clone());
        }
        let comparer = ServerComparer::for_database(self, crate::constants::DEFAULT_DATABASE).await?;
        self.comparer = Some(comparer.clone());
        Ok(comparer)
    }

    /// A connection whose database context is `database`.
    ///
    /// The current connection is returned when it is already in `database`.
    /// Otherwise pooled requests share one connection per database through
    /// the [`ConnectionFactory`]; non-pooled requests get a new connection.
    pub async fn database_connection(
        &mut self,
        database: &str,
        pooled: bool,
    ) -> Result<DatabaseConnection<'_>, ConnectionError> {
        let comparer = self.server_comparer().await?;
        if comparer.equals(&self.manager.current_database(), database) {
            return Ok(DatabaseConnection::Current(self));
        }

        let factory = ConnectionFactory::for_connection(self, comparer)?;
        if pooled {
            Ok(DatabaseConnection::Shared(factory.pooled(database)?))
        } else {
            Ok(DatabaseConnection::Dedicated(Box::new(
                factory.create(database, false)?,
            )))
        }
    }
}
