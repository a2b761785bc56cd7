//! Connection settings and connection-string generation.
//!
//! [`ConnectionSettings`] is the property bag behind a connection. Either the
//! individual properties are set and the connection string is generated from
//! them, or an explicit connection string is assigned and the properties it
//! covers become read-only.

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_POOL_SIZE, DEFAULT_MIN_POOL_SIZE,
    DEFAULT_PACKET_SIZE, DEFAULT_SERVER_INSTANCE, MIN_MAX_POOL_SIZE,
};
use crate::database::auth::RenewableToken;
use crate::database::connection_string::{keys, ConnectionStringBuilder};
use crate::database::enums::{
    ApplicationIntent, AuthenticationMethod, EncryptOption, NetworkProtocol,
};
use crate::error::ConnectionError;
use once_cell::sync::OnceCell;
use std::fmt;
use std::sync::Arc;

/// Settings used to open a connection.
#[derive(Clone)]
pub struct ConnectionSettings {
    server_instance: String,
    login: String,
    password: String,
    login_secure: bool,
    connect_as_user: bool,
    connect_as_user_name: String,
    connect_as_user_password: String,
    non_pooled_connection: bool,
    pooled_connection_lifetime: i32,
    min_pool_size: i32,
    max_pool_size: i32,
    connect_timeout: i32,
    network_protocol: NetworkProtocol,
    application_name: String,
    workstation_id: String,
    database_name: String,
    packet_size: i32,
    multiple_active_result_sets: bool,
    encrypt_connection: bool,
    strict_encryption: bool,
    host_name_in_certificate: Option<String>,
    server_certificate: Option<String>,
    trust_server_certificate: bool,
    authentication: AuthenticationMethod,
    application_intent: Option<ApplicationIntent>,
    additional_parameters: Option<String>,
    access_token: Option<Arc<dyn RenewableToken>>,
    explicit_connection_string: Option<String>,
    adopted: bool,
    block_updates: bool,
    generated: OnceCell<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_instance: DEFAULT_SERVER_INSTANCE.to_string(),
            login: String::new(),
            password: String::new(),
            login_secure: true,
            connect_as_user: false,
            connect_as_user_name: String::new(),
            connect_as_user_password: String::new(),
            non_pooled_connection: false,
            pooled_connection_lifetime: 0,
            min_pool_size: DEFAULT_MIN_POOL_SIZE,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            network_protocol: NetworkProtocol::NotSpecified,
            application_name: String::new(),
            workstation_id: String::new(),
            database_name: String::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            multiple_active_result_sets: false,
            encrypt_connection: false,
            strict_encryption: false,
            host_name_in_certificate: None,
            server_certificate: None,
            trust_server_certificate: false,
            authentication: AuthenticationMethod::NotSpecified,
            application_intent: None,
            additional_parameters: None,
            access_token: None,
            explicit_connection_string: None,
            adopted: false,
            block_updates: false,
            generated: OnceCell::new(),
        }
    }
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("server_instance", &self.server_instance)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("login_secure", &self.login_secure)
            .field("database_name", &self.database_name)
            .field("non_pooled_connection", &self.non_pooled_connection)
            .field("authentication", &self.authentication)
            .field("has_access_token", &self.access_token.is_some())
            .field(
                "has_explicit_connection_string",
                &self.explicit_connection_string.is_some(),
            )
            .field("adopted", &self.adopted)
            .field("block_updates", &self.block_updates)
            .finish_non_exhaustive()
    }
}

macro_rules! checked_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty, $property:literal) => {
        $(#[$meta])*
        pub fn $fn_name(&mut self, value: $ty) -> Result<(), ConnectionError> {
            self.begin_update($property)?;
            self.$field = value;
            Ok(())
        }
    };
}

impl ConnectionSettings {
    /// Settings with every property at its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for the given server using integrated security.
    pub fn for_server(server_instance: impl Into<String>) -> Result<Self, ConnectionError> {
        let mut settings = Self::new();
        settings.set_server_instance(server_instance)?;
        Ok(settings)
    }

    /// Settings for the given server using a SQL login.
    pub fn with_login(
        server_instance: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ConnectionError> {
        let mut settings = Self::for_server(server_instance)?;
        settings.set_login_secure(false)?;
        settings.set_login(login)?;
        settings.set_password(password)?;
        Ok(settings)
    }

    /// Adopt an existing client connection string.
    ///
    /// The resulting settings are non-pooled from this crate's point of view
    /// and read the individual properties back from the string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConnectionError> {
        let mut settings = Self::new();
        settings.init_from_connection_string(connection_string)?;
        Ok(settings)
    }

    /// Populate the properties from a connection string and keep it as the explicit string.
    pub fn init_from_connection_string(
        &mut self,
        connection_string: &str,
    ) -> Result<(), ConnectionError> {
        let builder = ConnectionStringBuilder::parse(connection_string)?;

        self.adopted = true;
        self.non_pooled_connection = !builder.get_bool(keys::POOLING)?.unwrap_or(true);
        if let Some(size) = builder.get_int(keys::MIN_POOL_SIZE)? {
            self.min_pool_size = clamp_i32(size);
        }
        if let Some(size) = builder.get_int(keys::MAX_POOL_SIZE)? {
            self.max_pool_size = clamp_i32(size);
        }
        if let Some(lifetime) = builder.get_int(keys::LOAD_BALANCE_TIMEOUT)? {
            self.pooled_connection_lifetime = clamp_i32(lifetime);
        }
        if let Some(data_source) = builder.get(keys::DATA_SOURCE) {
            self.server_instance = data_source.to_string();
        }
        if let Some(size) = builder.get_int(keys::PACKET_SIZE)? {
            self.packet_size = clamp_i32(size);
        }
        if let Some(timeout) = builder.get_int(keys::CONNECT_TIMEOUT)? {
            self.connect_timeout = clamp_i32(timeout);
        }
        self.workstation_id = builder
            .get(keys::WORKSTATION_ID)
            .unwrap_or_default()
            .to_string();
        if let Some(auth) = builder.get(keys::AUTHENTICATION) {
            self.authentication = AuthenticationMethod::parse(auth).ok_or_else(|| {
                ConnectionError::invalid_property("Authentication", auth, "unknown method")
            })?;
        }
        self.login_secure = builder
            .get_bool(keys::INTEGRATED_SECURITY)?
            .unwrap_or(false);
        self.login = builder.get(keys::USER_ID).unwrap_or_default().to_string();
        self.password = builder.get(keys::PASSWORD).unwrap_or_default().to_string();

        let encrypt = match builder.get(keys::ENCRYPT) {
            Some(value) => EncryptOption::parse(value).ok_or_else(|| {
                ConnectionError::invalid_property("Encrypt", value, "expected True, False or Strict")
            })?,
            None => EncryptOption::Optional,
        };
        self.encrypt_connection = encrypt != EncryptOption::Optional;
        self.strict_encryption = encrypt == EncryptOption::Strict;
        self.host_name_in_certificate = builder
            .get(keys::HOST_NAME_IN_CERTIFICATE)
            .map(str::to_string);
        self.server_certificate = builder.get(keys::SERVER_CERTIFICATE).map(str::to_string);
        self.trust_server_certificate = builder
            .get_bool(keys::TRUST_SERVER_CERTIFICATE)?
            .unwrap_or(false);

        self.set_connection_string(connection_string)
    }

    /// Copy every property, including an explicit connection string, into a fresh
    /// unblocked settings object.
    pub fn copy_settings(&self) -> Self {
        let mut copy = self.clone();
        copy.block_updates = false;
        copy.generated = OnceCell::new();
        copy
    }

    fn begin_update(&mut self, property: &str) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        if self.is_read_access_blocked() {
            return Err(ConnectionError::PropertyNotAvailable(property.to_string()));
        }
        self.reset_connection_string();
        Ok(())
    }

    fn throw_if_updates_blocked(&self) -> Result<(), ConnectionError> {
        if self.block_updates {
            return Err(ConnectionError::ConnectionCannotBeChanged);
        }
        Ok(())
    }

    fn throw_if_login_secure(&self, property: &str) -> Result<(), ConnectionError> {
        if self.login_secure {
            return Err(ConnectionError::invalid_property(
                property,
                "",
                "cannot be set when LoginSecure is true",
            ));
        }
        Ok(())
    }

    fn reset_connection_string(&mut self) {
        self.generated = OnceCell::new();
    }

    /// Whether an explicit connection string hides the individual properties.
    pub fn is_read_access_blocked(&self) -> bool {
        self.explicit_connection_string
            .as_deref()
            .is_some_and(|s| !s.is_empty())
    }

    /// Whether these settings were adopted from a client connection string.
    /// Adopted sessions are never auto-disconnected.
    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    /// Whether sessions come from the pool, per the effective string's
    /// `Pooling` keyword (absent means pooled).
    pub fn uses_pool(&self) -> Result<bool, ConnectionError> {
        Ok(self
            .connection_string_builder()?
            .get_bool(keys::POOLING)?
            .unwrap_or(true))
    }

    /// Whether property updates are rejected (set once a session is open).
    pub fn block_updates(&self) -> bool {
        self.block_updates
    }

    pub(crate) fn set_block_updates(&mut self, block: bool) {
        self.block_updates = block;
    }

    // -------------------------------------------------------------------------
    // Properties
    // -------------------------------------------------------------------------

    pub fn server_instance(&self) -> &str {
        &self.server_instance
    }

    pub fn set_server_instance(&mut self, value: impl Into<String>) -> Result<(), ConnectionError> {
        self.begin_update("ServerInstance")?;
        self.server_instance = value.into();
        Ok(())
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn set_login(&mut self, value: impl Into<String>) -> Result<(), ConnectionError> {
        let value = value.into();
        self.begin_update("Login")?;
        self.throw_if_login_secure("Login")?;
        non_empty("Login", &value)?;
        self.login = value;
        Ok(())
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn set_password(&mut self, value: impl Into<String>) -> Result<(), ConnectionError> {
        self.begin_update("Password")?;
        self.throw_if_login_secure("Password")?;
        self.password = value.into();
        Ok(())
    }

    /// Replace the stored password without the usual checks (after a password change).
    pub(crate) fn force_set_password(&mut self, value: impl Into<String>) {
        self.password = value.into();
        self.reset_connection_string();
    }

    pub fn login_secure(&self) -> bool {
        self.login_secure
    }

    checked_setter!(
        /// Use integrated (Windows) security instead of a login.
        set_login_secure, login_secure, bool, "LoginSecure"
    );

    pub fn connect_as_user(&self) -> bool {
        self.connect_as_user
    }

    checked_setter!(set_connect_as_user, connect_as_user, bool, "ConnectAsUser");

    pub fn connect_as_user_name(&self) -> &str {
        &self.connect_as_user_name
    }

    pub fn set_connect_as_user_name(
        &mut self,
        value: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let value = value.into();
        self.begin_update("ConnectAsUserName")?;
        non_empty("ConnectAsUserName", &value)?;
        self.connect_as_user_name = value;
        Ok(())
    }

    pub fn connect_as_user_password(&self) -> &str {
        &self.connect_as_user_password
    }

    pub fn set_connect_as_user_password(
        &mut self,
        value: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let value = value.into();
        self.begin_update("ConnectAsUserPassword")?;
        non_empty("ConnectAsUserPassword", &value)?;
        self.connect_as_user_password = value;
        Ok(())
    }

    pub fn non_pooled_connection(&self) -> bool {
        self.non_pooled_connection
    }

    checked_setter!(
        /// Open a dedicated session instead of using the pool.
        set_non_pooled_connection, non_pooled_connection, bool, "NonPooledConnection"
    );

    pub fn pooled_connection_lifetime(&self) -> i32 {
        self.pooled_connection_lifetime
    }

    pub fn set_pooled_connection_lifetime(&mut self, value: i32) -> Result<(), ConnectionError> {
        self.begin_update("PooledConnectionLifetime")?;
        at_least("PooledConnectionLifetime", value, 0)?;
        self.pooled_connection_lifetime = value;
        Ok(())
    }

    pub fn min_pool_size(&self) -> i32 {
        self.min_pool_size
    }

    pub fn set_min_pool_size(&mut self, value: i32) -> Result<(), ConnectionError> {
        self.begin_update("MinPoolSize")?;
        at_least("MinPoolSize", value, 0)?;
        self.min_pool_size = value;
        Ok(())
    }

    pub fn max_pool_size(&self) -> i32 {
        self.max_pool_size
    }

    pub fn set_max_pool_size(&mut self, value: i32) -> Result<(), ConnectionError> {
        self.begin_update("MaxPoolSize")?;
        at_least("MaxPoolSize", value, MIN_MAX_POOL_SIZE)?;
        self.max_pool_size = value;
        Ok(())
    }

    /// Login timeout in seconds; 0 waits indefinitely.
    pub fn connect_timeout(&self) -> i32 {
        self.connect_timeout
    }

    pub fn set_connect_timeout(&mut self, value: i32) -> Result<(), ConnectionError> {
        self.begin_update("ConnectTimeout")?;
        at_least("ConnectTimeout", value, 0)?;
        self.connect_timeout = value;
        Ok(())
    }

    pub fn network_protocol(&self) -> NetworkProtocol {
        self.network_protocol
    }

    checked_setter!(
        set_network_protocol,
        network_protocol,
        NetworkProtocol,
        "NetworkProtocol"
    );

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn set_application_name(
        &mut self,
        value: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let value = value.into();
        self.begin_update("ApplicationName")?;
        non_empty("ApplicationName", &value)?;
        self.application_name = value;
        Ok(())
    }

    pub fn workstation_id(&self) -> &str {
        &self.workstation_id
    }

    pub fn set_workstation_id(&mut self, value: impl Into<String>) -> Result<(), ConnectionError> {
        self.begin_update("WorkstationId")?;
        self.workstation_id = value.into();
        Ok(())
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn set_database_name(&mut self, value: impl Into<String>) -> Result<(), ConnectionError> {
        self.begin_update("DatabaseName")?;
        self.database_name = value.into();
        Ok(())
    }

    pub fn packet_size(&self) -> i32 {
        self.packet_size
    }

    pub fn set_packet_size(&mut self, value: i32) -> Result<(), ConnectionError> {
        self.begin_update("PacketSize")?;
        at_least("PacketSize", value, 0)?;
        self.packet_size = value;
        Ok(())
    }

    pub fn multiple_active_result_sets(&self) -> bool {
        self.multiple_active_result_sets
    }

    checked_setter!(
        set_multiple_active_result_sets,
        multiple_active_result_sets,
        bool,
        "MultipleActiveResultSets"
    );

    pub fn encrypt_connection(&self) -> bool {
        self.encrypt_connection
    }

    checked_setter!(
        set_encrypt_connection,
        encrypt_connection,
        bool,
        "EncryptConnection"
    );

    pub fn strict_encryption(&self) -> bool {
        self.strict_encryption
    }

    checked_setter!(
        /// Use TDS 8.0 strict encryption; implies an encrypted connection.
        set_strict_encryption, strict_encryption, bool, "StrictEncryption"
    );

    pub fn host_name_in_certificate(&self) -> Option<&str> {
        self.host_name_in_certificate.as_deref()
    }

    checked_setter!(
        set_host_name_in_certificate,
        host_name_in_certificate,
        Option<String>,
        "HostNameInCertificate"
    );

    pub fn server_certificate(&self) -> Option<&str> {
        self.server_certificate.as_deref()
    }

    checked_setter!(
        set_server_certificate,
        server_certificate,
        Option<String>,
        "ServerCertificate"
    );

    pub fn trust_server_certificate(&self) -> bool {
        self.trust_server_certificate
    }

    pub fn set_trust_server_certificate(&mut self, value: bool) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        self.reset_connection_string();
        self.trust_server_certificate = value;
        Ok(())
    }

    pub fn authentication(&self) -> AuthenticationMethod {
        self.authentication
    }

    pub fn set_authentication(&mut self, value: AuthenticationMethod) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        self.reset_connection_string();
        self.authentication = value;
        Ok(())
    }

    pub fn application_intent(&self) -> Option<ApplicationIntent> {
        self.application_intent
    }

    pub fn set_application_intent(
        &mut self,
        value: Option<ApplicationIntent>,
    ) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        self.reset_connection_string();
        self.application_intent = value;
        Ok(())
    }

    /// Extra `key=value` pairs appended verbatim to the generated string.
    pub fn additional_parameters(&self) -> Option<&str> {
        self.additional_parameters.as_deref()
    }

    pub fn set_additional_parameters(
        &mut self,
        value: Option<String>,
    ) -> Result<(), ConnectionError> {
        self.begin_update("AdditionalParameters")?;
        self.additional_parameters = value.filter(|p| !p.is_empty());
        Ok(())
    }

    pub fn access_token(&self) -> Option<&Arc<dyn RenewableToken>> {
        self.access_token.as_ref()
    }

    pub fn set_access_token(
        &mut self,
        token: Option<Arc<dyn RenewableToken>>,
    ) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        self.reset_connection_string();
        self.access_token = token;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Login requirements
    // -------------------------------------------------------------------------

    /// Whether a login name and password can be supplied for the current method.
    pub fn accepts_login(&self) -> bool {
        if self.login_secure {
            return false;
        }
        !matches!(
            self.authentication,
            AuthenticationMethod::ActiveDirectoryDeviceCodeFlow
                | AuthenticationMethod::ActiveDirectoryIntegrated
        )
    }

    /// Whether a login name must be supplied for the current method.
    pub fn requires_login(&self) -> bool {
        match self.authentication {
            AuthenticationMethod::SqlPassword
            | AuthenticationMethod::ActiveDirectoryPassword
            | AuthenticationMethod::ActiveDirectoryServicePrincipal => true,
            AuthenticationMethod::NotSpecified => {
                self.access_token.is_none() && !self.login_secure
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------------
    // Connection string
    // -------------------------------------------------------------------------

    /// The explicit connection string, or one generated from the properties.
    pub fn connection_string(&self) -> Result<String, ConnectionError> {
        if let Some(explicit) = self.explicit_connection_string.as_deref() {
            if !explicit.is_empty() {
                return Ok(explicit.to_string());
            }
        }
        self.generated
            .get_or_try_init(|| self.build_connection_string())
            .cloned()
    }

    /// Assign an explicit connection string; an empty string reverts to generation.
    pub fn set_connection_string(
        &mut self,
        value: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.throw_if_updates_blocked()?;
        let value = value.into();
        if value.is_empty() {
            self.explicit_connection_string = None;
            self.database_name = String::new();
        } else {
            let builder = ConnectionStringBuilder::parse(&value)?;
            self.database_name = builder
                .get(keys::INITIAL_CATALOG)
                .unwrap_or_default()
                .to_string();
            self.explicit_connection_string = Some(value);
        }
        self.reset_connection_string();
        Ok(())
    }

    /// `Initial Catalog` of the effective connection string.
    pub fn initial_catalog(&self) -> Result<String, ConnectionError> {
        let builder = ConnectionStringBuilder::parse(&self.connection_string()?)?;
        Ok(builder
            .get(keys::INITIAL_CATALOG)
            .unwrap_or_default()
            .to_string())
    }

    /// Effective connection string as an editable builder.
    pub fn connection_string_builder(&self) -> Result<ConnectionStringBuilder, ConnectionError> {
        ConnectionStringBuilder::parse(&self.connection_string()?)
    }

    fn build_connection_string(&self) -> Result<String, ConnectionError> {
        let mut sb = ConnectionStringBuilder::new();
        sb.set(keys::DATA_SOURCE, self.server_instance.as_str());

        if self.login_secure {
            sb.set_bool(keys::INTEGRATED_SECURITY, true);
        } else if self.accepts_login() {
            if self.requires_login() {
                if self.login.is_empty() {
                    return Err(ConnectionError::PropertyNotSet("Login".to_string()));
                }
                sb.set(keys::USER_ID, self.login.as_str());
                if self.authentication != AuthenticationMethod::ActiveDirectoryInteractive
                    || !self.password.is_empty()
                {
                    sb.set(keys::PASSWORD, self.password.as_str());
                }
            } else {
                if !self.login.is_empty() {
                    sb.set(keys::USER_ID, self.login.as_str());
                }
                if !self.password.is_empty() {
                    sb.set(keys::PASSWORD, self.password.as_str());
                }
            }
        }

        if self.connect_timeout != DEFAULT_CONNECT_TIMEOUT_SECS {
            sb.set_int(keys::CONNECT_TIMEOUT, self.connect_timeout.into());
        }
        if let Some(library) = self.network_protocol.library_name() {
            sb.set(keys::NETWORK_LIBRARY, library);
        }
        if !self.database_name.is_empty() {
            sb.set(keys::INITIAL_CATALOG, self.database_name.as_str());
        }
        if !self.workstation_id.is_empty() {
            sb.set(keys::WORKSTATION_ID, self.workstation_id.as_str());
        }
        if !self.application_name.is_empty() {
            sb.set(keys::APPLICATION_NAME, self.application_name.as_str());
        }
        if self.pooled_connection_lifetime != 0 {
            sb.set_int(
                keys::LOAD_BALANCE_TIMEOUT,
                self.pooled_connection_lifetime.into(),
            );
        }
        if self.max_pool_size != DEFAULT_MAX_POOL_SIZE && self.max_pool_size > 0 {
            sb.set_int(keys::MAX_POOL_SIZE, self.max_pool_size.into());
        }
        if self.min_pool_size != DEFAULT_MIN_POOL_SIZE {
            sb.set_int(keys::MIN_POOL_SIZE, self.min_pool_size.into());
        }
        if self.non_pooled_connection {
            sb.set_bool(keys::POOLING, false);
        }
        if self.packet_size != DEFAULT_PACKET_SIZE {
            sb.set_int(keys::PACKET_SIZE, self.packet_size.into());
        }

        let encrypt = if self.strict_encryption {
            EncryptOption::Strict
        } else if self.encrypt_connection {
            EncryptOption::Mandatory
        } else {
            EncryptOption::Optional
        };
        sb.set(keys::ENCRYPT, encrypt.keyword());
        if let Some(host) = self.host_name_in_certificate.as_deref().filter(|h| !h.is_empty()) {
            sb.set(keys::HOST_NAME_IN_CERTIFICATE, host);
        }
        if let Some(cert) = self.server_certificate.as_deref().filter(|c| !c.is_empty()) {
            sb.set(keys::SERVER_CERTIFICATE, cert);
        }
        sb.set_bool(keys::TRUST_SERVER_CERTIFICATE, self.trust_server_certificate);

        if self.access_token.is_none() {
            if let Some(method) = self.authentication.keyword() {
                sb.set(keys::AUTHENTICATION, method);
            }
        }
        if let Some(intent) = self.application_intent {
            sb.set(keys::APPLICATION_INTENT, intent.keyword());
        }
        sb.set_bool(
            keys::MULTIPLE_ACTIVE_RESULT_SETS,
            self.multiple_active_result_sets,
        );

        let mut connection_string = sb.to_string();
        if let Some(extra) = self.additional_parameters.as_deref() {
            connection_string.push(';');
            connection_string.push_str(extra);
        }
        Ok(connection_string)
    }
}

fn non_empty(property: &str, value: &str) -> Result<(), ConnectionError> {
    if value.is_empty() {
        return Err(ConnectionError::invalid_property(
            property,
            value,
            "the value cannot be empty",
        ));
    }
    Ok(())
}

fn at_least(property: &str, value: i32, minimum: i32) -> Result<(), ConnectionError> {
    if value < minimum {
        return Err(ConnectionError::invalid_property(
            property,
            value,
            format!("the value must be at least {}", minimum),
        ));
    }
    Ok(())
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i32::MIN.into(), i32::MAX.into()) as i32
}
