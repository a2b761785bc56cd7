//! Sessions over tiberius clients, pooled with bb8.
//!
//! Pooled settings share one bb8 pool per effective connection string;
//! non-pooled settings get a dedicated client that is closed with the
//! session. A client that timed out or lost its transport is flagged as
//! broken so the pool discards it instead of handing it out again.

use crate::constants::{DEFAULT_POOL_CHECKOUT_TIMEOUT, FATAL_SEVERITY, LOG_SQL_MAX_LEN};
use crate::database::auth::{
    config_for_settings, create_connection, login_timeout, truncate_for_log, RawConnection,
    RenewableToken,
};
use crate::database::backend::{Connector, ParameterValue, SqlCommand, SqlSession};
use crate::database::connection_string::keys;
use crate::database::identifiers::{quote_identifier, quote_unicode_string};
use crate::database::parameterize::{changes_session_state, may_change_database};
use crate::database::query::{collect_results, QueryResult};
use crate::database::settings::ConnectionSettings;
use crate::error::ConnectionError;
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tiberius::{AuthMethod, Config, ToSql};
use tracing::{debug, info, warn};

const SESSION_PROBE: &str =
    "SELECT CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128)), DB_NAME()";

const NULL_PARAMETER: Option<i64> = None;

/// A tiberius client together with what was learned about it at login.
pub struct PoolClient {
    client: RawConnection,
    broken: bool,
    server_version: String,
    /// Database selected at login.
    home_database: String,
    database: String,
}

/// bb8 manager creating logged-in tiberius clients.
pub struct TdsConnectionManager {
    config: Config,
    token: Option<Arc<dyn RenewableToken>>,
}

impl TdsConnectionManager {
    pub fn new(config: Config, token: Option<Arc<dyn RenewableToken>>) -> Self {
        Self { config, token }
    }

    fn login_config(&self) -> Result<Config, ConnectionError> {
        let mut config = self.config.clone();
        // Tokens expire; ask for a fresh one on every login.
        if let Some(token) = &self.token {
            config.authentication(AuthMethod::aad_token(token.access_token()?));
        }
        Ok(config)
    }
}

#[async_trait]
impl ManageConnection for TdsConnectionManager {
    type Connection = PoolClient;
    type Error = ConnectionError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut client = create_connection(self.login_config()?).await?;

        let row = client
            .simple_query(SESSION_PROBE)
            .await?
            .into_row()
            .await?
            .ok_or_else(|| ConnectionError::internal("Session probe returned no rows"))?;
        let server_version = row.try_get::<&str, _>(0)?.unwrap_or_default().to_string();
        let database = row.try_get::<&str, _>(1)?.unwrap_or_default().to_string();

        Ok(PoolClient {
            client,
            broken: false,
            server_version,
            home_database: database.clone(),
            database,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.client.simple_query("SELECT 1").await?.into_results().await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

type TdsPool = Pool<TdsConnectionManager>;

static POOLS: Lazy<Mutex<HashMap<String, TdsPool>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Pool status information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    /// Total number of connections in the pool.
    pub total_connections: u32,
    /// Number of idle connections.
    pub idle_connections: u32,
}

/// Status of the pool serving `connection_string`, if one exists.
pub fn pool_status(connection_string: &str) -> Option<PoolStatus> {
    let pools = POOLS.lock();
    let pool = pools.get(connection_string)?;
    let state = pool.state();
    Some(PoolStatus {
        total_connections: state.connections,
        idle_connections: state.idle_connections,
    })
}

/// Drop every pool. Checked-out connections close when they are released.
pub fn clear_pools() {
    let cleared = {
        let mut pools = POOLS.lock();
        let count = pools.len();
        pools.clear();
        count
    };
    info!("Cleared {} connection pool(s)", cleared);
}

fn pool_for(settings: &ConnectionSettings) -> Result<TdsPool, ConnectionError> {
    let key = settings.connection_string()?;

    let mut pools = POOLS.lock();
    if let Some(pool) = pools.get(&key) {
        return Ok(pool.clone());
    }

    let manager =
        TdsConnectionManager::new(config_for_settings(settings)?, settings.access_token().cloned());

    let max_size = settings.max_pool_size().max(1) as u32;
    let min_idle = (settings.min_pool_size().max(0) as u32).min(max_size);
    let lifetime = settings.pooled_connection_lifetime();

    info!(
        "Creating connection pool for {} (min: {}, max: {})",
        settings.server_instance(),
        min_idle,
        max_size
    );

    let pool = Pool::builder()
        .max_size(max_size)
        .min_idle((min_idle > 0).then_some(min_idle))
        .max_lifetime((lifetime > 0).then(|| Duration::from_secs(lifetime as u64)))
        .connection_timeout(login_timeout(settings).unwrap_or(DEFAULT_POOL_CHECKOUT_TIMEOUT))
        .build_unchecked(manager);

    pools.insert(key, pool.clone());
    Ok(pool)
}

async fn within<T>(
    limit: Option<Duration>,
    operation: impl Future<Output = Result<T, ConnectionError>>,
) -> Result<T, ConnectionError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| ConnectionError::timeout(limit.as_secs()))?,
        None => operation.await,
    }
}

async fn connect_dedicated(settings: &ConnectionSettings) -> Result<PoolClient, ConnectionError> {
    let manager =
        TdsConnectionManager::new(config_for_settings(settings)?, settings.access_token().cloned());
    within(login_timeout(settings), manager.connect()).await
}

fn bound_value(value: &ParameterValue) -> &dyn ToSql {
    match value {
        ParameterValue::NVarChar(s) => s,
        ParameterValue::BigInt(v) => v,
        ParameterValue::Null => &NULL_PARAMETER,
    }
}

/// Text sent for a parameterized command: an `sp_executesql` call that
/// declares the command's own parameter types and binds them positionally.
fn rpc_text(command: &SqlCommand) -> String {
    let declarations: Vec<String> = command.parameters.iter().map(|p| p.declaration()).collect();
    let bindings: Vec<String> = command
        .parameters
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{} = @P{}", p.name, i + 1))
        .collect();

    format!(
        "exec sp_executesql {}, {}, {}",
        quote_unicode_string(&command.text),
        quote_unicode_string(&declarations.join(", ")),
        bindings.join(", ")
    )
}

enum ClientHandle {
    Pooled(PooledConnection<'static, TdsConnectionManager>),
    Dedicated(PoolClient),
}

impl ClientHandle {
    fn get(&self) -> &PoolClient {
        match self {
            ClientHandle::Pooled(conn) => &**conn,
            ClientHandle::Dedicated(conn) => conn,
        }
    }

    fn get_mut(&mut self) -> &mut PoolClient {
        match self {
            ClientHandle::Pooled(conn) => &mut **conn,
            ClientHandle::Dedicated(conn) => conn,
        }
    }
}

/// A session on a tiberius client.
pub struct TdsSession {
    handle: ClientHandle,
    open: bool,
}

impl TdsSession {
    fn new(handle: ClientHandle) -> Self {
        Self { handle, open: true }
    }

    async fn refresh_database(&mut self) -> Result<(), ConnectionError> {
        let conn = self.handle.get_mut();
        let row = conn
            .client
            .simple_query("SELECT DB_NAME()")
            .await?
            .into_row()
            .await?;
        if let Some(name) = row.as_ref().map(|r| r.try_get::<&str, _>(0)).transpose()?.flatten() {
            conn.database = name.to_string();
        }
        Ok(())
    }

    /// Record the outcome of a command, retiring the client after fatal failures.
    async fn finish<T>(
        &mut self,
        text: &str,
        result: Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        match &result {
            Err(e) if e.severity().is_some_and(|s| s >= FATAL_SEVERITY) => {
                warn!("Session closed after failure: {}", e);
                self.open = false;
                self.handle.get_mut().broken = true;
            }
            _ => {}
        }

        if self.open && may_change_database(text) {
            if let Err(e) = self.refresh_database().await {
                warn!("Failed to refresh the database context: {}", e);
            }
        }

        result
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.open {
            Ok(())
        } else {
            Err(ConnectionError::connection("The session is closed"))
        }
    }
}

#[async_trait]
impl SqlSession for TdsSession {
    async fn execute_non_query(&mut self, command: &SqlCommand) -> Result<u64, ConnectionError> {
        self.ensure_open()?;
        debug!("Executing: {}", truncate_for_log(&command.text, LOG_SQL_MAX_LEN));

        let conn = self.handle.get_mut();
        let result = within(command.timeout_limit(), async {
            if command.parameters.is_empty() && changes_session_state(&command.text) {
                conn.client
                    .simple_query(command.text.as_str())
                    .await?
                    .into_results()
                    .await?;
                return Ok(0);
            }

            let text = if command.parameters.is_empty() {
                command.text.clone()
            } else {
                rpc_text(command)
            };
            let params: Vec<&dyn ToSql> =
                command.parameters.iter().map(|p| bound_value(&p.value)).collect();
            Ok(conn.client.execute(text, &params).await?.total())
        })
        .await;

        self.finish(&command.text, result).await
    }

    async fn execute_query(&mut self, command: &SqlCommand) -> Result<QueryResult, ConnectionError> {
        self.ensure_open()?;
        debug!("Executing query: {}", truncate_for_log(&command.text, LOG_SQL_MAX_LEN));

        let start = Instant::now();
        let conn = self.handle.get_mut();
        let result = within(command.timeout_limit(), async {
            if command.parameters.is_empty() {
                let stream = conn.client.simple_query(command.text.as_str()).await?;
                return collect_results(stream, start).await;
            }

            let params: Vec<&dyn ToSql> =
                command.parameters.iter().map(|p| bound_value(&p.value)).collect();
            let stream = conn.client.query(rpc_text(command), &params).await?;
            collect_results(stream, start).await
        })
        .await;

        self.finish(&command.text, result).await
    }

    async fn change_database(&mut self, database: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let conn = self.handle.get_mut();
        conn.client
            .simple_query(format!("USE {}", quote_identifier(database)))
            .await?
            .into_results()
            .await?;
        conn.database = database.to_string();
        Ok(())
    }

    fn database(&self) -> &str {
        &self.handle.get().database
    }

    fn server_version(&self) -> &str {
        &self.handle.get().server_version
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn invalidate(&mut self) {
        self.open = false;
        self.handle.get_mut().broken = true;
    }

    async fn close(self: Box<Self>) -> Result<(), ConnectionError> {
        match self.handle {
            ClientHandle::Pooled(conn) => {
                drop(conn);
                Ok(())
            }
            ClientHandle::Dedicated(conn) if !conn.broken => {
                conn.client.close().await?;
                Ok(())
            }
            ClientHandle::Dedicated(_) => Ok(()),
        }
    }
}

/// Connector opening tiberius sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TdsConnector;

impl TdsConnector {
    pub fn new() -> Self {
        Self
    }

    async fn open_pooled(&self, settings: &ConnectionSettings) -> Result<TdsSession, ConnectionError> {
        let pool = pool_for(settings)?;
        let mut conn = pool.get_owned().await?;

        // Pooled clients keep the database context of their last user.
        if conn.database != conn.home_database {
            let home = conn.home_database.clone();
            debug!("Restoring pooled session database to {}", home);
            let restored = match conn
                .client
                .simple_query(format!("USE {}", quote_identifier(&home)))
                .await
            {
                Ok(stream) => stream.into_results().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match restored {
                Ok(()) => conn.database = home,
                Err(e) => {
                    conn.broken = true;
                    return Err(e.into());
                }
            }
        }

        Ok(TdsSession::new(ClientHandle::Pooled(conn)))
    }
}

#[async_trait]
impl Connector for TdsConnector {
    async fn open(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn SqlSession>, ConnectionError> {
        let session = if !settings.uses_pool()? {
            debug!("Opening dedicated session to {}", settings.server_instance());
            TdsSession::new(ClientHandle::Dedicated(connect_dedicated(settings).await?))
        } else {
            self.open_pooled(settings).await?
        };
        Ok(Box::new(session))
    }

    async fn change_password(
        &self,
        settings: &ConnectionSettings,
        new_password: &str,
    ) -> Result<(), ConnectionError> {
        let builder = settings.connection_string_builder()?;
        let login = builder.get(keys::USER_ID).unwrap_or_default().to_string();
        if login.is_empty() {
            return Err(ConnectionError::PropertyNotSet("Login".to_string()));
        }
        let old_password = builder.get(keys::PASSWORD).unwrap_or_default().to_string();

        let mut conn = connect_dedicated(settings).await?;
        conn.client
            .simple_query(format!(
                "ALTER LOGIN {} WITH PASSWORD = {} OLD_PASSWORD = {}",
                quote_identifier(&login),
                quote_unicode_string(new_password),
                quote_unicode_string(&old_password)
            ))
            .await?
            .into_results()
            .await?;
        conn.client.close().await?;

        info!("Changed password for login {}", login);
        Ok(())
    }
}
