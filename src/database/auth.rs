//! Authentication and client configuration for SQL Server connections.
//!
//! This module turns an effective connection string into a tiberius
//! [`Config`], supporting:
//! - SQL Server authentication (username/password)
//! - Windows authentication (SSPI/Kerberos)
//! - Azure AD authentication through a caller-supplied access token

use crate::constants::DEFAULT_APPLICATION_NAME;
use crate::database::connection_string::{keys, ConnectionStringBuilder};
use crate::database::enums::{ApplicationIntent, EncryptOption};
use crate::database::settings::ConnectionSettings;
use crate::error::ConnectionError;
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

/// Type alias for a raw tiberius connection.
pub type RawConnection = Client<Compat<TcpStream>>;

/// Source of access tokens for token-based authentication.
///
/// Token acquisition and renewal are the caller's responsibility; the
/// connection asks for a current token every time it logs in.
pub trait RenewableToken: Send + Sync {
    /// A currently valid access token.
    fn access_token(&self) -> Result<String, ConnectionError>;
}

/// A fixed access token, for callers that manage renewal themselves.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl RenewableToken for StaticToken {
    fn access_token(&self) -> Result<String, ConnectionError> {
        Ok(self.0.clone())
    }
}

/// Configure tiberius authentication from the connection string.
fn configure_auth(
    config: &mut Config,
    builder: &ConnectionStringBuilder,
    token: Option<&dyn RenewableToken>,
) -> Result<(), ConnectionError> {
    if let Some(token) = token {
        config.authentication(AuthMethod::aad_token(token.access_token()?));
        return Ok(());
    }

    if builder.get_bool(keys::INTEGRATED_SECURITY)?.unwrap_or(false) {
        #[cfg(windows)]
        {
            config.authentication(AuthMethod::Integrated);
            return Ok(());
        }
        #[cfg(not(windows))]
        {
            return Err(ConnectionError::config(
                "Integrated security is only supported on Windows; set a login and password",
            ));
        }
    }

    let user = builder.get(keys::USER_ID).unwrap_or_default();
    let password = builder.get(keys::PASSWORD).unwrap_or_default();
    if user.is_empty() {
        return Err(ConnectionError::PropertyNotSet("Login".to_string()));
    }
    config.authentication(AuthMethod::sql_server(user, password));
    Ok(())
}

/// Create a tiberius Config from an effective connection string.
pub fn create_base_config(
    builder: &ConnectionStringBuilder,
    token: Option<&dyn RenewableToken>,
) -> Result<Config, ConnectionError> {
    let mut config = Config::new();
    let data_source = builder.data_source();

    config.host(&data_source.host);
    match (&data_source.instance, data_source.port) {
        (Some(instance), None) => config.instance_name(instance),
        (_, port) => config.port(port.unwrap_or(crate::constants::DEFAULT_PORT)),
    }

    if let Some(database) = builder.get(keys::INITIAL_CATALOG).filter(|d| !d.is_empty()) {
        config.database(database);
    }

    let encrypt = builder
        .get(keys::ENCRYPT)
        .and_then(EncryptOption::parse)
        .unwrap_or_default();
    match encrypt {
        EncryptOption::Optional => config.encryption(EncryptionLevel::Off),
        EncryptOption::Mandatory | EncryptOption::Strict => {
            config.encryption(EncryptionLevel::Required)
        }
    }

    if builder
        .get_bool(keys::TRUST_SERVER_CERTIFICATE)?
        .unwrap_or(false)
    {
        config.trust_cert();
    }

    config.application_name(
        builder
            .get(keys::APPLICATION_NAME)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_APPLICATION_NAME),
    );

    if builder
        .get(keys::APPLICATION_INTENT)
        .and_then(ApplicationIntent::parse)
        == Some(ApplicationIntent::ReadOnly)
    {
        config.readonly(true);
    }

    configure_auth(&mut config, builder, token)?;
    Ok(config)
}

/// Build the tiberius Config for the given settings.
pub fn config_for_settings(settings: &ConnectionSettings) -> Result<Config, ConnectionError> {
    let builder = settings.connection_string_builder()?;
    create_base_config(&builder, settings.access_token().map(|t| t.as_ref()))
}

/// Login timeout for the given settings; `None` waits indefinitely.
pub fn login_timeout(settings: &ConnectionSettings) -> Option<Duration> {
    match settings.connect_timeout() {
        secs if secs > 0 => Some(Duration::from_secs(secs as u64)),
        _ => None,
    }
}

/// Create a raw connection to SQL Server.
///
/// Named instances without an explicit port are resolved through the SQL
/// Browser service.
pub async fn create_connection(config: Config) -> Result<RawConnection, ConnectionError> {
    let address = config.get_addr();
    debug!("Creating connection to {}", address);

    let tcp = TcpStream::connect_named(&config)
        .await
        .map_err(|e| ConnectionError::connection(format!("Failed to connect to {}: {}", address, e)))?;

    tcp.set_nodelay(true)
        .map_err(|e| ConnectionError::connection(format!("Failed to set TCP_NODELAY: {}", e)))?;

    let client = match Client::connect(config.clone(), tcp.compat_write()).await {
        Ok(client) => client,
        Err(tiberius::error::Error::Routing { host, port }) => {
            debug!("Following server redirect to {}:{}", host, port);
            let mut routed = config;
            routed.host(&host);
            routed.port(port);
            let tcp = TcpStream::connect(routed.get_addr()).await?;
            tcp.set_nodelay(true)?;
            Client::connect(routed, tcp.compat_write()).await?
        }
        Err(e) => return Err(e.into()),
    };

    debug!("Connection established successfully");
    Ok(client)
}

/// Truncate a string for logging purposes.
///
/// This is a shared utility for safe logging of potentially long strings.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        None => s.to_string(),
        Some((idx, _)) => format!("{}...", &s[..idx]),
    }
}
