//! Configuration for connections built by the `mssql-conninfo` binary and by
//! library callers that prefer declarative setup.
//!
//! Configuration is loaded from environment variables following the 12-factor
//! app pattern, or from a JSON document with the same shape as [`Config`].

use crate::constants::{DEFAULT_LOCK_TIMEOUT, DEFAULT_STATEMENT_TIMEOUT_SECS};
use crate::database::enums::{
    ApplicationIntent, AuthenticationMethod, DeferredUseMode, EncryptOption,
    QueryParameterizationMode,
};
use crate::database::server_connection::{ExecutionOptions, ServerConnection};
use crate::database::settings::ConnectionSettings;
use crate::error::ConnectionError;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where and how to connect
    pub connection: ConnectionConfig,

    /// Statement execution defaults
    pub execution: ExecutionConfig,

    /// Login retry policy
    pub retry: RetrySettings,
}

/// Connection target and login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Complete connection string; overrides every other field.
    pub connection_string: Option<String>,

    /// Server instance as written in a connection string (`host\instance`, `host,port`).
    pub server: Option<String>,

    pub host: Option<String>,
    pub port: Option<u16>,
    pub instance: Option<String>,

    /// SQL login; integrated security when absent.
    pub user: Option<String>,
    pub password: Option<String>,

    /// Value of the `Authentication` keyword.
    pub authentication: Option<String>,

    pub database: Option<String>,

    /// `true`, `false` or `strict`.
    pub encrypt: Option<String>,
    pub trust_server_certificate: bool,

    pub min_pool_size: Option<i32>,
    pub max_pool_size: Option<i32>,
    /// Pooled connection lifetime in seconds.
    pub pool_lifetime: Option<i32>,
    pub non_pooled: bool,

    /// Login timeout in seconds.
    pub connect_timeout: Option<i32>,
    pub packet_size: Option<i32>,
    pub application_name: Option<String>,
    pub application_intent: Option<String>,
    pub multiple_active_result_sets: bool,
}

/// Execution defaults applied to new connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Statement timeout in seconds (0 = unlimited).
    pub statement_timeout: u32,

    /// Lock timeout in seconds (-1 = server default).
    pub lock_timeout: i32,

    pub parameterization: QueryParameterizationMode,
    pub deferred_use: DeferredUseMode,
    pub cached_queries: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT_SECS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            parameterization: QueryParameterizationMode::default(),
            deferred_use: DeferredUseMode::default(),
            cached_queries: false,
        }
    }
}

/// Serializable form of [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let login = RetryConfig::login();
        Self {
            max_attempts: login.max_attempts,
            initial_delay_ms: login.initial_delay.as_millis() as u64,
            max_delay_ms: login.max_delay.as_millis() as u64,
            multiplier: login.multiplier,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// ## Target (one of)
    /// - `MSSQL_CONNECTION_STRING`: complete connection string
    /// - `MSSQL_SERVER`: server instance (`host`, `host\instance`, `host,port`)
    /// - `MSSQL_HOST` with optional `MSSQL_PORT` / `MSSQL_INSTANCE`
    ///
    /// ## Optional
    /// - `MSSQL_USER` / `MSSQL_PASSWORD`: SQL login (integrated security otherwise)
    /// - `MSSQL_AUTH_TYPE`: `Authentication` keyword value
    /// - `MSSQL_DATABASE`: initial catalog
    /// - `MSSQL_ENCRYPT`: `true`, `false` or `strict`
    /// - `MSSQL_TRUST_CERT`: trust the server certificate
    /// - `MSSQL_POOL_MIN` / `MSSQL_POOL_MAX` / `MSSQL_POOL_LIFETIME` / `MSSQL_NON_POOLED`
    /// - `MSSQL_CONNECT_TIMEOUT`, `MSSQL_PACKET_SIZE`
    /// - `MSSQL_APPLICATION_NAME`, `MSSQL_APPLICATION_INTENT`, `MSSQL_MARS`
    /// - `MSSQL_STATEMENT_TIMEOUT`, `MSSQL_LOCK_TIMEOUT`
    /// - `MSSQL_PARAMETERIZATION`: `none`, `forced` or `literals`
    /// - `MSSQL_DEFERRED_USE`: `none`, `collapse` or `merge`
    /// - `MSSQL_CACHED_QUERIES`
    /// - `MSSQL_RETRY_MAX_ATTEMPTS`, `MSSQL_RETRY_INITIAL_DELAY_MS`,
    ///   `MSSQL_RETRY_MAX_DELAY_MS`, `MSSQL_RETRY_MULTIPLIER`
    pub fn from_env() -> Result<Self, ConnectionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps variable names to values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConnectionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let flag = |name: &str| {
            var(name)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(false)
        };

        let connection = ConnectionConfig {
            connection_string: var("MSSQL_CONNECTION_STRING"),
            server: var("MSSQL_SERVER"),
            host: var("MSSQL_HOST"),
            port: parse_var(&var, "MSSQL_PORT")?,
            instance: var("MSSQL_INSTANCE"),
            user: var("MSSQL_USER"),
            password: var("MSSQL_PASSWORD"),
            authentication: var("MSSQL_AUTH_TYPE"),
            database: var("MSSQL_DATABASE"),
            encrypt: var("MSSQL_ENCRYPT"),
            trust_server_certificate: flag("MSSQL_TRUST_CERT"),
            min_pool_size: parse_var(&var, "MSSQL_POOL_MIN")?,
            max_pool_size: parse_var(&var, "MSSQL_POOL_MAX")?,
            pool_lifetime: parse_var(&var, "MSSQL_POOL_LIFETIME")?,
            non_pooled: flag("MSSQL_NON_POOLED"),
            connect_timeout: parse_var(&var, "MSSQL_CONNECT_TIMEOUT")?,
            packet_size: parse_var(&var, "MSSQL_PACKET_SIZE")?,
            application_name: var("MSSQL_APPLICATION_NAME"),
            application_intent: var("MSSQL_APPLICATION_INTENT"),
            multiple_active_result_sets: flag("MSSQL_MARS"),
        };

        let defaults = ExecutionConfig::default();
        let execution = ExecutionConfig {
            statement_timeout: parse_var(&var, "MSSQL_STATEMENT_TIMEOUT")?
                .unwrap_or(defaults.statement_timeout),
            lock_timeout: parse_var(&var, "MSSQL_LOCK_TIMEOUT")?.unwrap_or(defaults.lock_timeout),
            parameterization: match var("MSSQL_PARAMETERIZATION") {
                Some(v) => parse_parameterization(&v)?,
                None => defaults.parameterization,
            },
            deferred_use: match var("MSSQL_DEFERRED_USE") {
                Some(v) => parse_deferred_use(&v)?,
                None => defaults.deferred_use,
            },
            cached_queries: flag("MSSQL_CACHED_QUERIES"),
        };

        let mut retry = RetrySettings::default();
        if let Some(n) = parse_var(&var, "MSSQL_RETRY_MAX_ATTEMPTS")? {
            retry.max_attempts = n;
        }
        if let Some(ms) = parse_var(&var, "MSSQL_RETRY_INITIAL_DELAY_MS")? {
            retry.initial_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&var, "MSSQL_RETRY_MAX_DELAY_MS")? {
            retry.max_delay_ms = ms;
        }
        if let Some(m) = parse_var(&var, "MSSQL_RETRY_MULTIPLIER")? {
            retry.multiplier = m;
        }

        let config = Config {
            connection,
            execution,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConnectionError> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| ConnectionError::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConnectionError> {
        let c = &self.connection;
        if c.connection_string.is_none() && c.server.is_none() && c.host.is_none() {
            return Err(ConnectionError::config(
                "Set MSSQL_CONNECTION_STRING, MSSQL_SERVER or MSSQL_HOST",
            ));
        }
        match (&c.user, &c.password) {
            (Some(_), None) => Err(ConnectionError::config(
                "MSSQL_PASSWORD is required when MSSQL_USER is set",
            )),
            (None, Some(_)) => Err(ConnectionError::config(
                "MSSQL_USER is required when MSSQL_PASSWORD is set",
            )),
            _ => Ok(()),
        }
    }

    /// Server instance in connection-string form.
    pub fn server_instance(&self) -> Option<String> {
        let c = &self.connection;
        if let Some(server) = &c.server {
            return Some(server.clone());
        }
        let host = c.host.as_ref()?;
        Some(match (&c.instance, c.port) {
            (Some(instance), _) => format!("{}\\{}", host, instance),
            (None, Some(port)) => format!("{},{}", host, port),
            (None, None) => host.clone(),
        })
    }

    /// Connection settings described by this configuration.
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConnectionError> {
        let c = &self.connection;
        if let Some(connection_string) = &c.connection_string {
            return ConnectionSettings::from_connection_string(connection_string);
        }

        let server = self
            .server_instance()
            .ok_or_else(|| ConnectionError::config("No server configured"))?;
        let mut settings = match (&c.user, &c.password) {
            (Some(user), Some(password)) => ConnectionSettings::with_login(server, user, password)?,
            _ => ConnectionSettings::for_server(server)?,
        };

        if let Some(auth) = &c.authentication {
            let method = AuthenticationMethod::parse(auth).ok_or_else(|| {
                ConnectionError::invalid_property("Authentication", auth, "unknown method")
            })?;
            settings.set_authentication(method)?;
        }
        if let Some(database) = &c.database {
            settings.set_database_name(database.as_str())?;
        }
        if let Some(encrypt) = &c.encrypt {
            match EncryptOption::parse(encrypt) {
                Some(EncryptOption::Optional) => settings.set_encrypt_connection(false)?,
                Some(EncryptOption::Mandatory) => settings.set_encrypt_connection(true)?,
                Some(EncryptOption::Strict) => settings.set_strict_encryption(true)?,
                None => {
                    return Err(ConnectionError::invalid_property(
                        "Encrypt",
                        encrypt,
                        "expected true, false or strict",
                    ))
                }
            }
        }
        if c.trust_server_certificate {
            settings.set_trust_server_certificate(true)?;
        }
        if let Some(size) = c.max_pool_size {
            settings.set_max_pool_size(size)?;
        }
        if let Some(size) = c.min_pool_size {
            settings.set_min_pool_size(size)?;
        }
        if let Some(lifetime) = c.pool_lifetime {
            settings.set_pooled_connection_lifetime(lifetime)?;
        }
        if c.non_pooled {
            settings.set_non_pooled_connection(true)?;
        }
        if let Some(timeout) = c.connect_timeout {
            settings.set_connect_timeout(timeout)?;
        }
        if let Some(size) = c.packet_size {
            settings.set_packet_size(size)?;
        }
        if let Some(name) = &c.application_name {
            settings.set_application_name(name.as_str())?;
        }
        if let Some(intent) = &c.application_intent {
            let intent = ApplicationIntent::parse(intent).ok_or_else(|| {
                ConnectionError::invalid_property("ApplicationIntent", intent, "expected ReadWrite or ReadOnly")
            })?;
            settings.set_application_intent(Some(intent))?;
        }
        if c.multiple_active_result_sets {
            settings.set_multiple_active_result_sets(true)?;
        }

        Ok(settings)
    }

    /// A disconnected [`ServerConnection`] with the execution defaults applied.
    pub async fn server_connection(&self) -> Result<ServerConnection, ConnectionError> {
        let mut conn = ServerConnection::from_settings(self.connection_settings()?);
        conn.manager_mut()
            .set_connect_retry(self.retry.to_retry_config());
        conn.manager_mut()
            .set_lock_timeout(self.execution.lock_timeout)
            .await?;
        conn.set_statement_timeout(self.execution.statement_timeout);
        conn.set_execution_options(ExecutionOptions {
            parameterization: self.execution.parameterization,
            deferred_use: self.execution.deferred_use,
            cached_queries: self.execution.cached_queries,
        });
        Ok(conn)
    }
}

fn parse_var<T, F>(var: &F, name: &str) -> Result<Option<T>, ConnectionError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ConnectionError::config(format!("Invalid value '{}' for {}", v, name)))
        })
        .transpose()
}

fn parse_parameterization(value: &str) -> Result<QueryParameterizationMode, ConnectionError> {
    match value.trim().to_lowercase().as_str() {
        "none" | "off" => Ok(QueryParameterizationMode::None),
        "forced" | "forcedparameterization" => Ok(QueryParameterizationMode::ForcedParameterization),
        "literals" | "parameterizeliterals" => Ok(QueryParameterizationMode::ParameterizeLiterals),
        _ => Err(ConnectionError::config(format!(
            "Invalid MSSQL_PARAMETERIZATION '{}': expected none, forced or literals",
            value
        ))),
    }
}

fn parse_deferred_use(value: &str) -> Result<DeferredUseMode, ConnectionError> {
    match value.trim().to_lowercase().as_str() {
        "none" | "off" => Ok(DeferredUseMode::None),
        "collapse" | "collapseredundant" => Ok(DeferredUseMode::CollapseRedundant),
        "merge" | "mergesql" => Ok(DeferredUseMode::MergeSql),
        _ => Err(ConnectionError::config(format!(
            "Invalid MSSQL_DEFERRED_USE '{}': expected none, collapse or merge",
            value
        ))),
    }
}
