//! Session lifecycle for one logical connection.
//!
//! [`ConnectionManager`] owns the settings and at most one open session.
//! Pooled connections are opened for the duration of an operation
//! (`pool_connect` / `pool_disconnect`) unless the caller connected
//! explicitly; sessions lost while executing are reopened and the command
//! retried once.

use crate::constants::{DEFAULT_DATABASE, DEFAULT_LOCK_TIMEOUT, MIN_SUPPORTED_MAJOR_VERSION};
use crate::database::backend::{Connector, SqlCommand, SqlParameter, SqlSession};
use crate::database::capture::{CapturedSql, StatementListener, StatementListeners};
use crate::database::connection_string::keys;
use crate::database::enums::{
    AutoDisconnectMode, DatabaseEngineEdition, DatabaseEngineType, NetworkProtocol,
};
use crate::database::identifiers::quote_identifier;
use crate::database::query::QueryResult;
use crate::database::server_info::{ProductVersion, ServerInformation, ServerVersion};
use crate::database::settings::ConnectionSettings;
use crate::database::tds::TdsConnector;
use crate::database::types::SqlValue;
use crate::error::{is_transient_sql_error, ConnectionError};
use crate::resilience::{retry_async, RetryConfig};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DATABASE_EXISTS_QUERY: &str = "SELECT CASE WHEN db_id(@db_name) IS NULL THEN 0 ELSE 1 END";

const CONTAINED_AUTH_QUERY: &str = "if (db_id() = 1)
begin
-- contained auth is 0 when connected to master
select 0
end
else
begin
exec('select case when authenticating_database_id = 1 then 0 else 1 end from
sys.dm_exec_sessions where session_id = @@SPID')
end;";

/// Cancels the command running on a connection from another task.
#[derive(Clone, Default)]
pub struct CancelHandle {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelHandle {
    /// Cancel the running command, if any.
    pub fn cancel(&self) {
        self.current.lock().cancel();
    }

    /// Token for the next command; a token used up by a cancellation is replaced.
    fn begin(&self) -> CancellationToken {
        let mut current = self.current.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecuteKind {
    NonQuery,
    Query,
}

#[derive(Debug)]
pub(crate) enum ExecuteOutput {
    RowsAffected(u64),
    Results(QueryResult),
}

impl ExecuteOutput {
    pub(crate) fn rows_affected(&self) -> u64 {
        match self {
            ExecuteOutput::RowsAffected(rows) => *rows,
            ExecuteOutput::Results(result) => result.rows_affected,
        }
    }

    pub(crate) fn into_results(self) -> QueryResult {
        match self {
            ExecuteOutput::RowsAffected(rows) => QueryResult {
                rows_affected: rows,
                ..QueryResult::default()
            },
            ExecuteOutput::Results(result) => result,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MetadataOverrides {
    server_version: Option<ServerVersion>,
    product_version: Option<ProductVersion>,
    engine_type: Option<DatabaseEngineType>,
    engine_edition: Option<DatabaseEngineEdition>,
}

fn is_resumable_login_error(error: &ConnectionError) -> bool {
    error
        .sql_error()
        .is_some_and(|e| is_transient_sql_error(e.number))
}

fn lock_timeout_sql(seconds: i32) -> String {
    match seconds {
        DEFAULT_LOCK_TIMEOUT => "SET LOCK_TIMEOUT -1".to_string(),
        secs => format!("SET LOCK_TIMEOUT {}", i64::from(secs) * 1000),
    }
}

/// Connection lifecycle, metadata discovery and the retrying execution core.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    session: Option<Box<dyn SqlSession>>,
    user_connected: bool,
    force_disconnected: bool,
    in_use: bool,
    auto_disconnect_mode: AutoDisconnectMode,
    lock_timeout: i32,
    server_information: Option<ServerInformation>,
    overrides: MetadataOverrides,
    contained_authentication: Option<bool>,
    captured_sql: CapturedSql,
    listeners: StatementListeners,
    connect_retry: RetryConfig,
    cancel: CancelHandle,
    pub(crate) transaction_depth: i32,
    pub(crate) deferred_use_active: bool,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("is_open", &self.is_open())
            .field("user_connected", &self.user_connected)
            .field("force_disconnected", &self.force_disconnected)
            .field("auto_disconnect_mode", &self.auto_disconnect_mode)
            .field("lock_timeout", &self.lock_timeout)
            .field("transaction_depth", &self.transaction_depth)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// A disconnected manager using the given connector.
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            session: None,
            user_connected: false,
            force_disconnected: false,
            in_use: false,
            auto_disconnect_mode: AutoDisconnectMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            server_information: None,
            overrides: MetadataOverrides::default(),
            contained_authentication: None,
            captured_sql: CapturedSql::default(),
            listeners: StatementListeners::default(),
            connect_retry: RetryConfig::login(),
            cancel: CancelHandle::default(),
            transaction_depth: 0,
            deferred_use_active: false,
        }
    }

    /// A disconnected manager opening tiberius sessions.
    pub fn with_tds(settings: ConnectionSettings) -> Self {
        Self::new(settings, Arc::new(TdsConnector::new()))
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Mutable settings; setters fail once a session has been opened.
    pub fn settings_mut(&mut self) -> &mut ConnectionSettings {
        &mut self.settings
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    pub fn connect_retry(&self) -> &RetryConfig {
        &self.connect_retry
    }

    pub fn set_connect_retry(&mut self, config: RetryConfig) {
        self.connect_retry = config;
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Whether a session is open.
    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }

    /// Whether the caller connected explicitly.
    pub fn is_user_connected(&self) -> bool {
        self.user_connected
    }

    pub fn is_force_disconnected(&self) -> bool {
        self.force_disconnected
    }

    /// Whether a session has been opened at least once.
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn auto_disconnect_mode(&self) -> AutoDisconnectMode {
        self.auto_disconnect_mode
    }

    pub fn set_auto_disconnect_mode(&mut self, mode: AutoDisconnectMode) {
        self.auto_disconnect_mode = mode;
    }

    /// `Data Source` of the effective connection string.
    fn data_source(&self) -> String {
        self.settings
            .connection_string_builder()
            .ok()
            .and_then(|b| b.get(keys::DATA_SOURCE).map(str::to_string))
            .unwrap_or_else(|| self.settings.server_instance().to_string())
    }

    /// Open the session. Ignored in disconnected mode; when a session is
    /// already open the connection is only marked as user-connected.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.force_disconnected {
            return Ok(());
        }

        if self.is_open() {
            self.user_connected = true;
            return Ok(());
        }

        if let Err(e) = self.open_session().await {
            let data_source = self.data_source();
            warn!("Failed to connect to {}: {}", data_source, e);
            return Err(ConnectionError::connection_failure(data_source, e));
        }

        self.user_connected = true;
        Ok(())
    }

    async fn open_session(&mut self) -> Result<(), ConnectionError> {
        self.close_session().await;

        let connector = self.connector.as_ref();
        let settings = &self.settings;
        let outcome = retry_async(&self.connect_retry, is_resumable_login_error, move || {
            connector.open(settings)
        })
        .await;
        if outcome.attempts > 1 && outcome.is_success() {
            info!("Connected after {} attempts", outcome.attempts);
        }
        let mut session = outcome.into_result()?;

        let version = ServerVersion::parse(session.server_version())?;
        if version.major < MIN_SUPPORTED_MAJOR_VERSION {
            if let Err(e) = session.close().await {
                debug!("Error closing rejected session: {}", e);
            }
            return Err(ConnectionError::UnsupportedServerVersion(version.to_string()));
        }

        if self.lock_timeout != DEFAULT_LOCK_TIMEOUT {
            session
                .execute_non_query(&SqlCommand::new(lock_timeout_sql(self.lock_timeout)))
                .await?;
        }

        info!(
            "Connected to {} (SQL Server {}, database {})",
            self.settings.server_instance(),
            version,
            session.database()
        );

        self.session = Some(session);
        self.transaction_depth = 0;
        self.settings.set_block_updates(true);
        self.in_use = true;
        Ok(())
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("Error closing session: {}", e);
            }
        }
    }

    /// Close the session. Ignored when already disconnected.
    pub async fn disconnect(&mut self) {
        if self.session.is_some() {
            self.close_session().await;
            debug!("Disconnected from {}", self.settings.server_instance());
        }
        self.user_connected = false;
    }

    /// Connect for the duration of one operation.
    pub async fn pool_connect(&mut self) -> Result<(), ConnectionError> {
        if !self.user_connected && !self.force_disconnected {
            self.connect().await?;
            self.user_connected = false;
        }
        Ok(())
    }

    /// Whether `pool_disconnect` is suspended by open transactions or deferred `USE` handling.
    pub fn block_pool_disconnect(&self) -> bool {
        self.transaction_depth > 0 || self.deferred_use_active
    }

    /// Release a pooled session opened by [`ConnectionManager::pool_connect`].
    pub async fn pool_disconnect(&mut self) {
        if !self.user_connected
            && self.auto_disconnect_mode == AutoDisconnectMode::DisconnectIfPooled
            && !self.settings.is_read_access_blocked()
            && !self.settings.is_adopted()
            && !self.settings.non_pooled_connection()
            && !self.block_pool_disconnect()
        {
            self.disconnect().await;
        }
    }

    /// Enter disconnected (offline) mode permanently.
    pub async fn force_disconnected(&mut self) {
        self.force_disconnected = true;
        self.disconnect().await;
    }

    pub(crate) fn check_disconnected(&self, operation: &str) -> Result<(), ConnectionError> {
        if self.force_disconnected {
            return Err(ConnectionError::Disconnected(operation.to_string()));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Session options
    // -------------------------------------------------------------------------

    /// Lock timeout in seconds; -1 is the server default.
    pub fn lock_timeout(&self) -> i32 {
        self.lock_timeout
    }

    /// Set the lock timeout, applying it immediately when a session is open.
    pub async fn set_lock_timeout(&mut self, seconds: i32) -> Result<(), ConnectionError> {
        if seconds < DEFAULT_LOCK_TIMEOUT {
            return Err(ConnectionError::invalid_property(
                "LockTimeout",
                seconds,
                "must be -1 or greater",
            ));
        }

        if seconds != self.lock_timeout {
            self.lock_timeout = seconds;
            if self.is_open() {
                let command = SqlCommand::new(lock_timeout_sql(seconds));
                self.execute_command(ExecuteKind::NonQuery, &command, true)
                    .await?;
            }
        }
        Ok(())
    }

    /// Current database of the session, or the initial catalog when closed.
    ///
    /// Without an initial catalog the login lands in `master`.
    pub fn current_database(&self) -> String {
        match &self.session {
            Some(session) => session.database().to_string(),
            None => self
                .settings
                .initial_catalog()
                .ok()
                .filter(|catalog| !catalog.is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
        }
    }

    // -------------------------------------------------------------------------
    // Statement notifications
    // -------------------------------------------------------------------------

    pub fn add_statement_listener(&mut self, listener: StatementListener) -> u64 {
        self.listeners.add(listener)
    }

    pub fn remove_statement_listener(&mut self, id: u64) -> bool {
        self.listeners.remove(id)
    }

    pub(crate) fn notify_statement(&self, sql: &str) {
        self.listeners.notify(sql);
    }

    /// Statements recorded in capture mode.
    pub fn captured_sql(&self) -> &CapturedSql {
        &self.captured_sql
    }

    pub fn captured_sql_mut(&mut self) -> &mut CapturedSql {
        &mut self.captured_sql
    }

    /// A handle that cancels the running command from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run a command, reopening a lost session and retrying once when `retry` is set.
    pub(crate) async fn execute_command(
        &mut self,
        kind: ExecuteKind,
        command: &SqlCommand,
        retry: bool,
    ) -> Result<ExecuteOutput, ConnectionError> {
        self.check_disconnected("execute")?;

        if !self.is_open() {
            self.open_session().await.map_err(|e| {
                ConnectionError::connection_failure(self.data_source(), e)
            })?;
        }

        let database = self.current_database();
        let error = match self.run_once(kind, command).await {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        if !retry || matches!(error, ConnectionError::Cancelled | ConnectionError::Timeout { .. }) {
            return Err(error);
        }

        // Expired access tokens surface as error 0, class 11 on an open session.
        if self.settings.access_token().is_some()
            && error.sql_error().is_some_and(|e| e.number == 0 && e.class == 11)
        {
            debug!("Access token rejected, reconnecting");
            self.close_session().await;
        }

        if self.is_open() {
            return Err(error);
        }

        warn!("Session lost while executing, reconnecting: {}", error);
        if let Err(reopen_error) = self.reopen(&database).await {
            warn!("Reconnect failed: {}", reopen_error);
            return Err(error);
        }

        match self.run_once(kind, command).await {
            Ok(output) => Ok(output),
            Err(retry_error) => {
                warn!("Exception caught and not thrown while connection retry: {}", retry_error);
                Err(error)
            }
        }
    }

    async fn reopen(&mut self, database: &str) -> Result<(), ConnectionError> {
        self.open_session().await?;

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ConnectionError::internal("Session missing after reconnect"))?;
        if database.is_empty() || session.database() == database {
            return Ok(());
        }

        let probe = SqlCommand::new(DATABASE_EXISTS_QUERY)
            .with_parameters(vec![SqlParameter::nvarchar("@db_name", database)]);
        match session.execute_query(&probe).await {
            Ok(result) if result.scalar().and_then(SqlValue::as_i64) == Some(1) => {
                session.change_database(database).await?;
                debug!("Restored database context {}", database);
            }
            Ok(_) => debug!("Database {} no longer exists, keeping {}", database, session.database()),
            Err(e) => warn!("Exception caught and not thrown while connection retry: {}", e),
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        kind: ExecuteKind,
        command: &SqlCommand,
    ) -> Result<ExecuteOutput, ConnectionError> {
        let token = self.cancel.begin();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ConnectionError::connection("No open session"))?;

        let outcome = tokio::select! {
            result = run_on(session.as_mut(), kind, command) => result,
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
        };

        if matches!(outcome, Err(ConnectionError::Cancelled)) {
            info!("Command cancelled");
            if let Some(session) = self.session.as_mut() {
                session.invalidate();
            }
        }
        outcome
    }

    /// Run a query on the session directly, without retry.
    pub(crate) async fn query_session(
        &mut self,
        command: &SqlCommand,
    ) -> Result<QueryResult, ConnectionError> {
        self.run_once(ExecuteKind::Query, command)
            .await
            .map(ExecuteOutput::into_results)
    }

    // -------------------------------------------------------------------------
    // Server metadata
    // -------------------------------------------------------------------------

    async fn server_information(&mut self) -> Result<ServerInformation, ConnectionError> {
        if let Some(info) = &self.server_information {
            return Ok(info.clone());
        }

        let info = if self.force_disconnected {
            let version = self
                .overrides
                .server_version
                .ok_or_else(|| ConnectionError::Disconnected("ServerVersion".to_string()))?;
            ServerInformation::offline(version)
        } else {
            self.pool_connect().await?;
            let discovered = self.discover().await;
            self.pool_disconnect().await;
            discovered?
        };

        self.server_information = Some(info.clone());
        Ok(info)
    }

    async fn discover(&mut self) -> Result<ServerInformation, ConnectionError> {
        let version = match &self.session {
            Some(session) => ServerVersion::parse(session.server_version())?,
            None => return Err(ConnectionError::connection("No open session")),
        };

        let command = SqlCommand::new(ServerInformation::build_query(&version));
        let result = self
            .execute_command(ExecuteKind::Query, &command, true)
            .await?
            .into_results();
        let info = ServerInformation::from_result(version, &result)?;
        debug!(
            "Discovered {} {} on {}",
            info.engine_type, info.engine_edition, info.host_platform
        );
        Ok(info)
    }

    fn check_overridable(&self) -> Result<(), ConnectionError> {
        if !self.force_disconnected && self.is_open() {
            return Err(ConnectionError::ConnectionCannotBeChanged);
        }
        Ok(())
    }

    pub async fn server_version(&mut self) -> Result<ServerVersion, ConnectionError> {
        if let Some(version) = self.overrides.server_version {
            return Ok(version);
        }
        Ok(self.server_information().await?.server_version)
    }

    /// Override the server version; only allowed while disconnected.
    pub fn set_server_version(&mut self, version: Option<ServerVersion>) -> Result<(), ConnectionError> {
        self.check_overridable()?;
        self.overrides.server_version = version;
        self.server_information = None;
        Ok(())
    }

    pub async fn product_version(&mut self) -> Result<ProductVersion, ConnectionError> {
        if let Some(version) = self.overrides.product_version {
            return Ok(version);
        }
        Ok(self.server_information().await?.product_version)
    }

    pub fn set_product_version(&mut self, version: Option<ProductVersion>) -> Result<(), ConnectionError> {
        self.check_overridable()?;
        self.overrides.product_version = version;
        self.server_information = None;
        Ok(())
    }

    pub async fn database_engine_type(&mut self) -> Result<DatabaseEngineType, ConnectionError> {
        if let Some(engine_type) = self.overrides.engine_type {
            return Ok(engine_type);
        }
        Ok(self.server_information().await?.engine_type)
    }

    pub fn set_database_engine_type(
        &mut self,
        engine_type: Option<DatabaseEngineType>,
    ) -> Result<(), ConnectionError> {
        self.check_overridable()?;
        self.overrides.engine_type = engine_type;
        self.server_information = None;
        Ok(())
    }

    pub async fn database_engine_edition(
        &mut self,
    ) -> Result<DatabaseEngineEdition, ConnectionError> {
        if let Some(edition) = self.overrides.engine_edition {
            return Ok(edition);
        }
        Ok(self.server_information().await?.engine_edition)
    }

    pub fn set_database_engine_edition(
        &mut self,
        edition: Option<DatabaseEngineEdition>,
    ) -> Result<(), ConnectionError> {
        self.check_overridable()?;
        self.overrides.engine_edition = edition;
        self.server_information = None;
        Ok(())
    }

    /// Host operating system of the server ("Windows" or "Linux").
    pub async fn host_platform(&mut self) -> Result<String, ConnectionError> {
        Ok(self.server_information().await?.host_platform)
    }

    /// Transport used by the session.
    pub async fn connection_protocol(&mut self) -> Result<NetworkProtocol, ConnectionError> {
        Ok(self.server_information().await?.connection_protocol)
    }

    /// Whether the login was authenticated by a contained database.
    pub async fn is_contained_authentication(&mut self) -> Result<bool, ConnectionError> {
        if self.force_disconnected {
            return Ok(false);
        }
        if let Some(contained) = self.contained_authentication {
            return Ok(contained);
        }

        let initial_catalog = self.settings.initial_catalog()?;
        let contained = if self.database_engine_type().await? == DatabaseEngineType::Standalone
            && self.server_version().await?.major > 10
            && !initial_catalog.is_empty()
        {
            self.pool_connect().await?;
            let result = self.probe_contained_authentication(&initial_catalog).await;
            self.pool_disconnect().await;
            result?
        } else {
            false
        };

        self.contained_authentication = Some(contained);
        Ok(contained)
    }

    async fn probe_contained_authentication(
        &mut self,
        initial_catalog: &str,
    ) -> Result<bool, ConnectionError> {
        let current = self.current_database();
        let mut sql = format!("use {};{}", quote_identifier(initial_catalog), CONTAINED_AUTH_QUERY);
        if !current.is_empty() {
            sql.push_str(&format!("use {}; --resetting the context", quote_identifier(&current)));
        }

        let result = self
            .execute_command(ExecuteKind::Query, &SqlCommand::new(sql), true)
            .await?
            .into_results();
        Ok(result.scalar().and_then(SqlValue::as_i64) == Some(1))
    }
}

async fn run_on(
    session: &mut dyn SqlSession,
    kind: ExecuteKind,
    command: &SqlCommand,
) -> Result<ExecuteOutput, ConnectionError> {
    match kind {
        ExecuteKind::NonQuery => session
            .execute_non_query(command)
            .await
            .map(ExecuteOutput::RowsAffected),
        ExecuteKind::Query => session
            .execute_query(command)
            .await
            .map(ExecuteOutput::Results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::{server_discovery, MockConnector, MockFailure};
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn manager(mock: &MockConnector) -> ConnectionManager {
        let settings = ConnectionSettings::with_login("db01", "sa", "secret").unwrap();
        let mut manager = ConnectionManager::new(settings, mock.clone().into_connector());
        manager.set_connect_retry(fast_retry());
        manager
    }

    #[tokio::test]
    async fn test_connect_blocks_setting_updates() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);

        conn.connect().await.unwrap();
        assert!(conn.is_open());
        assert!(conn.is_user_connected());
        assert!(conn.in_use());

        let err = conn.settings_mut().set_server_instance("other").unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionCannotBeChanged));

        // A second connect only marks the connection as user-connected.
        conn.connect().await.unwrap();
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_connect_applies_lock_timeout() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.set_lock_timeout(5).await.unwrap();
        conn.connect().await.unwrap();

        assert_eq!(mock.executed(), vec!["SET LOCK_TIMEOUT 5000"]);

        conn.set_lock_timeout(-1).await.unwrap();
        assert_eq!(mock.executed().last().unwrap(), "SET LOCK_TIMEOUT -1");
        assert!(conn.set_lock_timeout(-2).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_old_servers() {
        let mock = MockConnector::new().with_version("7.00.1063");
        let mut conn = manager(&mock);

        let err = conn.connect().await.unwrap_err();
        match err {
            ConnectionError::ConnectionFailure { data_source, source } => {
                assert_eq!(data_source, "db01");
                assert!(matches!(*source, ConnectionError::UnsupportedServerVersion(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_connect_retries_resuming_database() {
        let mock = MockConnector::new();
        mock.fail_open(MockFailure::sql(42109, 14));
        let mut conn = manager(&mock);

        conn.connect().await.unwrap();
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_connect_does_not_retry_login_failures() {
        let mock = MockConnector::new();
        mock.fail_open(MockFailure::sql(18456, 14));
        let mut conn = manager(&mock);

        assert!(conn.connect().await.is_err());
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_force_disconnected() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.force_disconnected().await;

        conn.connect().await.unwrap();
        assert_eq!(mock.opens(), 0);

        let err = conn
            .execute_command(ExecuteKind::NonQuery, &SqlCommand::new("select 1"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Disconnected(_)));
        assert!(!conn.is_contained_authentication().await.unwrap());
    }

    #[tokio::test]
    async fn test_pool_disconnect_rules() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);

        conn.pool_connect().await.unwrap();
        assert!(conn.is_open());
        assert!(!conn.is_user_connected());
        conn.pool_disconnect().await;
        assert!(!conn.is_open());

        conn.connect().await.unwrap();
        conn.pool_disconnect().await;
        assert!(conn.is_open(), "user connections stay open");
        conn.disconnect().await;

        conn.pool_connect().await.unwrap();
        conn.transaction_depth = 1;
        conn.pool_disconnect().await;
        assert!(conn.is_open(), "open transactions keep the session");
        conn.transaction_depth = 0;

        conn.set_auto_disconnect_mode(AutoDisconnectMode::NoAutoDisconnect);
        conn.pool_disconnect().await;
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_non_pooled_connections_stay_open() {
        let mock = MockConnector::new();
        let mut settings = ConnectionSettings::with_login("db01", "sa", "secret").unwrap();
        settings.set_non_pooled_connection(true).unwrap();
        let mut conn = ConnectionManager::new(settings, mock.clone().into_connector());

        conn.pool_connect().await.unwrap();
        conn.pool_disconnect().await;
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_execute_reconnects_and_restores_database() {
        let mock = MockConnector::new();
        mock.add_database("Sales");
        let mut conn = manager(&mock);
        conn.connect().await.unwrap();
        conn.execute_command(ExecuteKind::NonQuery, &SqlCommand::new("USE [Sales]"), true)
            .await
            .unwrap();
        assert_eq!(conn.current_database(), "Sales");

        mock.fail_once("UPDATE", MockFailure::Disconnect);
        mock.rows("UPDATE", 3);

        let output = conn
            .execute_command(ExecuteKind::NonQuery, &SqlCommand::new("UPDATE t SET a = 1"), true)
            .await
            .unwrap();
        assert_eq!(output.rows_affected(), 3);
        assert_eq!(mock.opens(), 2);
        assert_eq!(conn.current_database(), "Sales");
        assert!(mock.executed().iter().any(|s| s.contains("db_id(@db_name)")));
    }

    #[tokio::test]
    async fn test_failed_retry_returns_original_error() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.connect().await.unwrap();

        mock.fail_once("DELETE", MockFailure::Disconnect);
        mock.fail_once("DELETE", MockFailure::sql(547, 16));

        let err = conn
            .execute_command(ExecuteKind::NonQuery, &SqlCommand::new("DELETE FROM t"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_not_retried() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.connect().await.unwrap();
        mock.fail("bad", MockFailure::sql(208, 16));

        let err = conn
            .execute_command(ExecuteKind::Query, &SqlCommand::new("select * from bad"), true)
            .await
            .unwrap_err();
        assert_eq!(err.sql_error().unwrap().number, 208);
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_server_information_is_discovered_once() {
        let mock = MockConnector::new();
        mock.respond(
            "DatabaseEngineType",
            server_discovery(1, 3, "16.0.1000.6", "Linux", Some("TCP")),
        );
        let mut conn = manager(&mock);

        assert_eq!(conn.server_version().await.unwrap(), ServerVersion::new(16, 0, 1000));
        assert_eq!(
            conn.database_engine_edition().await.unwrap(),
            DatabaseEngineEdition::Enterprise
        );
        assert_eq!(conn.host_platform().await.unwrap(), "Linux");
        assert_eq!(conn.connection_protocol().await.unwrap(), NetworkProtocol::TcpIp);

        let discoveries = mock
            .executed()
            .iter()
            .filter(|s| s.contains("DatabaseEngineType"))
            .count();
        assert_eq!(discoveries, 1);
        assert!(!conn.is_open(), "pooled discovery releases the session");
    }

    #[tokio::test]
    async fn test_offline_information_uses_overrides() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.force_disconnected().await;

        assert!(matches!(
            conn.database_engine_type().await,
            Err(ConnectionError::Disconnected(_))
        ));

        conn.set_server_version(Some(ServerVersion::new(15, 0, 2000)))
            .unwrap();
        assert_eq!(
            conn.database_engine_type().await.unwrap(),
            DatabaseEngineType::Standalone
        );
        assert_eq!(
            conn.product_version().await.unwrap(),
            ProductVersion::new(15, 0, 2000, 0)
        );
        assert_eq!(conn.host_platform().await.unwrap(), "Windows");
    }

    #[tokio::test]
    async fn test_overrides_rejected_while_open() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        conn.connect().await.unwrap();

        let err = conn
            .set_database_engine_type(Some(DatabaseEngineType::SqlAzureDatabase))
            .unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionCannotBeChanged));
    }

    #[tokio::test]
    async fn test_contained_authentication_probe() {
        let mock = MockConnector::new();
        mock.add_database("Contained");
        mock.respond(
            "DatabaseEngineType",
            server_discovery(1, 2, "16.0.1000.6", "Windows", Some("TCP")),
        );
        mock.scalar("authenticating_database_id", 1);

        let mut settings = ConnectionSettings::with_login("db01", "user", "pw").unwrap();
        settings.set_database_name("Contained").unwrap();
        let mut conn = ConnectionManager::new(settings, mock.clone().into_connector());

        assert!(conn.is_contained_authentication().await.unwrap());
        assert!(conn.is_contained_authentication().await.unwrap());

        let probes: Vec<String> = mock
            .executed()
            .into_iter()
            .filter(|s| s.contains("authenticating_database_id"))
            .collect();
        assert_eq!(probes.len(), 1);
        assert!(probes[0].starts_with("use [Contained];"));
        assert!(probes[0].ends_with("use [Contained]; --resetting the context"));
    }

    #[tokio::test]
    async fn test_cancel_running_command() {
        let mock = MockConnector::new();
        mock.hang("WAITFOR");
        let mut conn = manager(&mock);
        conn.connect().await.unwrap();

        let handle = conn.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        let err = conn
            .execute_command(
                ExecuteKind::NonQuery,
                &SqlCommand::new("WAITFOR DELAY '00:10'"),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Cancelled));
        assert!(!conn.is_open());

        // The next command reconnects with a fresh cancellation token.
        conn.execute_command(ExecuteKind::NonQuery, &SqlCommand::new("select 1"), true)
            .await
            .unwrap();
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_statement_listeners_and_capture() {
        let mock = MockConnector::new();
        let mut conn = manager(&mock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = conn.add_statement_listener(Arc::new(move |e: &crate::database::capture::StatementEvent| {
            sink.lock().push(e.sql.clone())
        }));

        conn.notify_statement("select 1");
        conn.captured_sql_mut().add("select 1");
        assert!(conn.remove_statement_listener(id));

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(conn.captured_sql().len(), 1);
    }
}
