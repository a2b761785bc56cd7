//! Enumerations and flag sets shared by the connection types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Declares a bit-flag newtype over `u32` with named constants.
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($value); )*

            /// Raw bit value.
            pub const fn bits(self) -> u32 {
                self.0
            }

            /// Build from raw bits, keeping unknown bits.
            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            /// Whether every bit of `other` is set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Whether no bit is set.
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }
    };
}

flag_set! {
    /// Options controlling how `execute_non_query` runs a script.
    pub struct ExecutionTypes {
        const DEFAULT = 0;
        /// Run the text as one statement without batch splitting.
        const NO_COMMANDS = 1;
        /// Keep executing the remaining statements after a failure.
        const CONTINUE_ON_ERROR = 2;
        /// Compile without executing (`SET NOEXEC ON`).
        const NO_EXEC = 4;
        /// Parse without compiling (`SET PARSEONLY ON`).
        const PARSE_ONLY = 8;
        /// Run with `SET QUOTED_IDENTIFIER ON`.
        const QUOTED_IDENTIFIER_ON = 16;
    }
}

flag_set! {
    /// Whether statements are executed, captured, or both.
    pub struct SqlExecutionModes {
        const EXECUTE_SQL = 1;
        const CAPTURE_SQL = 2;
        const EXECUTE_AND_CAPTURE_SQL = 3;
    }
}

flag_set! {
    /// Fixed server roles held by the current login.
    pub struct FixedServerRoles {
        const NONE = 0;
        const SYS_ADMIN = 1;
        const SERVER_ADMIN = 2;
        const SETUP_ADMIN = 4;
        const SECURITY_ADMIN = 8;
        const PROCESS_ADMIN = 16;
        const DB_CREATOR = 32;
        const DISK_ADMIN = 64;
        const BULK_ADMIN = 128;
    }
}

flag_set! {
    /// Server-level privileges reported by `sp_MSdbuserpriv`.
    pub struct ServerUserProfiles {
        const NONE = 0;
        const SA_LOGIN = 1;
        const CREATE_DATABASE = 2;
        const CREATE_XP = 4;
        const ALL = 7;
    }
}

impl SqlExecutionModes {
    /// Whether statements are sent to the server.
    pub fn executes(self) -> bool {
        self.contains(Self::EXECUTE_SQL)
    }

    /// Whether statements are recorded in the captured SQL list.
    pub fn captures(self) -> bool {
        self.contains(Self::CAPTURE_SQL)
    }
}

impl FixedServerRoles {
    /// Role names paired with their flags, in bit order.
    pub const NAMED: [(&'static str, FixedServerRoles); 8] = [
        ("sysadmin", Self::SYS_ADMIN),
        ("serveradmin", Self::SERVER_ADMIN),
        ("setupadmin", Self::SETUP_ADMIN),
        ("securityadmin", Self::SECURITY_ADMIN),
        ("processadmin", Self::PROCESS_ADMIN),
        ("dbcreator", Self::DB_CREATOR),
        ("diskadmin", Self::DISK_ADMIN),
        ("bulkadmin", Self::BULK_ADMIN),
    ];
}

/// Legacy client network libraries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkProtocol {
    TcpIp,
    NamedPipes,
    Multiprotocol,
    AppleTalk,
    BanyanVines,
    Via,
    SharedMemory,
    NwLinkIpxSpx,
    #[default]
    NotSpecified,
}

impl NetworkProtocol {
    /// Value of the `Network Library` connection-string keyword.
    pub fn library_name(self) -> Option<&'static str> {
        match self {
            NetworkProtocol::TcpIp => Some("dbmssocn"),
            NetworkProtocol::NamedPipes => Some("dbnmpntw"),
            NetworkProtocol::Multiprotocol => Some("dbmsrpcn"),
            NetworkProtocol::AppleTalk => Some("dbmsadsn"),
            NetworkProtocol::BanyanVines => Some("dbmsvinn"),
            NetworkProtocol::Via => Some("dbmsgnet"),
            NetworkProtocol::SharedMemory => Some("dbmslpcn"),
            NetworkProtocol::NwLinkIpxSpx => Some("dbmsspxn"),
            NetworkProtocol::NotSpecified => None,
        }
    }

    /// Inverse of [`NetworkProtocol::library_name`].
    pub fn from_library_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "dbmssocn" => NetworkProtocol::TcpIp,
            "dbnmpntw" => NetworkProtocol::NamedPipes,
            "dbmsrpcn" => NetworkProtocol::Multiprotocol,
            "dbmsadsn" => NetworkProtocol::AppleTalk,
            "dbmsvinn" => NetworkProtocol::BanyanVines,
            "dbmsgnet" => NetworkProtocol::Via,
            "dbmslpcn" => NetworkProtocol::SharedMemory,
            "dbmsspxn" => NetworkProtocol::NwLinkIpxSpx,
            _ => NetworkProtocol::NotSpecified,
        }
    }

    /// Map the `net_transport` connection property to a protocol.
    pub fn from_net_transport(transport: &str) -> Self {
        match transport.trim().to_ascii_lowercase().as_str() {
            "tcp" | "http" | "ssl" => NetworkProtocol::TcpIp,
            "named pipe" => NetworkProtocol::NamedPipes,
            "shared memory" => NetworkProtocol::SharedMemory,
            "via" => NetworkProtocol::Via,
            _ => NetworkProtocol::NotSpecified,
        }
    }
}

/// Kind of database engine behind a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DatabaseEngineType {
    #[default]
    Unknown = 0,
    Standalone = 1,
    SqlAzureDatabase = 2,
}

impl DatabaseEngineType {
    /// Convert from the value returned by the discovery query.
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => DatabaseEngineType::Standalone,
            2 => DatabaseEngineType::SqlAzureDatabase,
            _ => DatabaseEngineType::Unknown,
        }
    }

    /// Editions that can run on this engine type.
    pub fn supported_editions(self) -> &'static [DatabaseEngineEdition] {
        use DatabaseEngineEdition::*;
        match self {
            DatabaseEngineType::SqlAzureDatabase => &[SqlDatabase, SqlDataWarehouse, SqlOnDemand],
            DatabaseEngineType::Standalone => &[
                Personal,
                Enterprise,
                Express,
                Standard,
                SqlStretchDatabase,
                SqlManagedInstance,
                SqlDatabaseEdge,
            ],
            DatabaseEngineType::Unknown => &[],
        }
    }
}

/// Edition reported by `SERVERPROPERTY('EngineEdition')`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DatabaseEngineEdition {
    #[default]
    Unknown = 0,
    Personal = 1,
    Standard = 2,
    Enterprise = 3,
    Express = 4,
    SqlDatabase = 5,
    SqlDataWarehouse = 6,
    SqlStretchDatabase = 7,
    SqlManagedInstance = 8,
    SqlDatabaseEdge = 9,
    SqlOnDemand = 11,
}

impl DatabaseEngineEdition {
    /// Convert from `SERVERPROPERTY('EngineEdition')`; `None` for values this crate does not know.
    pub fn from_i32(value: i32) -> Option<Self> {
        use DatabaseEngineEdition::*;
        Some(match value {
            0 => Unknown,
            1 => Personal,
            2 => Standard,
            3 => Enterprise,
            4 => Express,
            5 => SqlDatabase,
            6 => SqlDataWarehouse,
            7 => SqlStretchDatabase,
            8 => SqlManagedInstance,
            9 => SqlDatabaseEdge,
            11 => SqlOnDemand,
            _ => return None,
        })
    }
}

/// Host operating system names reported by `sys.dm_os_host_info`.
pub mod host_platform {
    pub const WINDOWS: &str = "Windows";
    pub const LINUX: &str = "Linux";
}

/// Whether a pooled connection is released after each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoDisconnectMode {
    /// Disconnect after each operation unless the user connected explicitly.
    #[default]
    DisconnectIfPooled,
    /// Keep the session open until `disconnect` is called.
    NoAutoDisconnect,
}

/// Authentication method written to the `Authentication` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AuthenticationMethod {
    #[default]
    NotSpecified,
    SqlPassword,
    ActiveDirectoryPassword,
    ActiveDirectoryIntegrated,
    ActiveDirectoryInteractive,
    ActiveDirectoryServicePrincipal,
    ActiveDirectoryDeviceCodeFlow,
    ActiveDirectoryManagedIdentity,
    ActiveDirectoryDefault,
}

impl AuthenticationMethod {
    const KEYWORDS: [(AuthenticationMethod, &'static str); 8] = [
        (AuthenticationMethod::SqlPassword, "Sql Password"),
        (AuthenticationMethod::ActiveDirectoryPassword, "Active Directory Password"),
        (AuthenticationMethod::ActiveDirectoryIntegrated, "Active Directory Integrated"),
        (AuthenticationMethod::ActiveDirectoryInteractive, "Active Directory Interactive"),
        (
            AuthenticationMethod::ActiveDirectoryServicePrincipal,
            "Active Directory Service Principal",
        ),
        (
            AuthenticationMethod::ActiveDirectoryDeviceCodeFlow,
            "Active Directory Device Code Flow",
        ),
        (
            AuthenticationMethod::ActiveDirectoryManagedIdentity,
            "Active Directory Managed Identity",
        ),
        (AuthenticationMethod::ActiveDirectoryDefault, "Active Directory Default"),
    ];

    /// Connection-string value, `None` for `NotSpecified`.
    pub fn keyword(self) -> Option<&'static str> {
        Self::KEYWORDS
            .iter()
            .find(|(method, _)| *method == self)
            .map(|(_, keyword)| *keyword)
    }

    /// Parse a connection-string value, ignoring case and spaces.
    pub fn parse(value: &str) -> Option<Self> {
        let squashed: String = value.chars().filter(|c| !c.is_whitespace()).collect();
        if squashed.is_empty() || squashed.eq_ignore_ascii_case("NotSpecified") {
            return Some(AuthenticationMethod::NotSpecified);
        }
        if squashed.eq_ignore_ascii_case("ActiveDirectoryMSI") {
            return Some(AuthenticationMethod::ActiveDirectoryManagedIdentity);
        }
        Self::KEYWORDS.iter().find_map(|(method, keyword)| {
            let key: String = keyword.chars().filter(|c| !c.is_whitespace()).collect();
            key.eq_ignore_ascii_case(&squashed).then_some(*method)
        })
    }
}

/// Declared workload of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationIntent {
    ReadWrite,
    ReadOnly,
}

impl ApplicationIntent {
    pub fn keyword(self) -> &'static str {
        match self {
            ApplicationIntent::ReadWrite => "ReadWrite",
            ApplicationIntent::ReadOnly => "ReadOnly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "readwrite" => Some(ApplicationIntent::ReadWrite),
            "readonly" => Some(ApplicationIntent::ReadOnly),
            _ => None,
        }
    }
}

/// Value of the `Encrypt` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EncryptOption {
    #[default]
    Optional,
    Mandatory,
    Strict,
}

impl EncryptOption {
    pub fn keyword(self) -> &'static str {
        match self {
            EncryptOption::Optional => "False",
            EncryptOption::Mandatory => "True",
            EncryptOption::Strict => "Strict",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "false" | "no" | "optional" => Some(EncryptOption::Optional),
            "true" | "yes" | "mandatory" => Some(EncryptOption::Mandatory),
            "strict" => Some(EncryptOption::Strict),
            _ => None,
        }
    }
}

/// How ad-hoc SQL text is turned into parameterized commands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum QueryParameterizationMode {
    /// Send text unchanged.
    None,
    /// Replace `<msparam>` tags with parameters.
    #[default]
    ForcedParameterization,
    /// Additionally replace literals when the text has no tags.
    ParameterizeLiterals,
}

/// How `USE` statements are handled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum DeferredUseMode {
    #[default]
    None,
    /// Skip `USE` when the target database is already current.
    CollapseRedundant,
    /// Reserved for merging `USE` into the following statement.
    MergeSql,
}

/// Kind of server a connection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerType {
    #[default]
    DatabaseEngine,
    AnalysisServices,
    ReportingServices,
    IntegrationServices,
    SqlServerCompactEdition,
}

impl fmt::Display for DatabaseEngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatabaseEngineType::Unknown => "Unknown",
            DatabaseEngineType::Standalone => "Standalone",
            DatabaseEngineType::SqlAzureDatabase => "SqlAzureDatabase",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DatabaseEngineEdition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for NetworkProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
