//! Server version, edition and platform discovery.

use crate::constants::{CONNECTION_PROPERTY_MIN_MAJOR_VERSION, HOST_INFO_MIN_MAJOR_VERSION};
use crate::database::enums::{host_platform, DatabaseEngineEdition, DatabaseEngineType, NetworkProtocol};
use crate::database::query::{QueryResult, ResultSet};
use crate::database::types::SqlValue;
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Major/minor/build triple identifying a server release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: i32,
    pub minor: i32,
    pub build_number: i32,
}

impl ServerVersion {
    pub const fn new(major: i32, minor: i32, build_number: i32) -> Self {
        Self {
            major,
            minor,
            build_number,
        }
    }

    /// Parse the leading `major.minor.build` of a version string.
    ///
    /// Only the first 10 characters are considered (`16.00.1000`), so a
    /// trailing revision is ignored.
    pub fn parse(version: &str) -> Result<Self, ConnectionError> {
        let head: String = version.trim().chars().take(10).collect();
        let parts = head
            .split('.')
            .filter(|p| !p.is_empty())
            .take(3)
            .map(|p| p.parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid_version(version))?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, build] => Ok(Self::new(*major, *minor, *build)),
            _ => Err(invalid_version(version)),
        }
    }

    /// Decode the value of `@@MICROSOFTVERSION`.
    ///
    /// The top byte is the major version, the next byte the minor version
    /// and the low bits the build.
    pub fn parse_microsoft_version(version: u32) -> Self {
        Self::new(
            (version / 0x0100_0000) as i32,
            (version / 0x0001_0000 & 15) as i32,
            (version & 255) as i32,
        )
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build_number)
    }
}

fn invalid_version(version: &str) -> ConnectionError {
    ConnectionError::invalid_argument(format!("Invalid server version string '{}'", version))
}

/// Four-part product version (`SERVERPROPERTY('ProductVersion')`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductVersion {
    pub major: i32,
    pub minor: i32,
    pub build: i32,
    pub revision: i32,
}

impl ProductVersion {
    pub const fn new(major: i32, minor: i32, build: i32, revision: i32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Parse `major.minor[.build[.revision]]`.
    pub fn parse(version: &str) -> Result<Self, ConnectionError> {
        let parts = version
            .trim()
            .split('.')
            .map(|p| p.parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid_version(version))?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0, 0)),
            [major, minor, build] => Ok(Self::new(*major, *minor, *build, 0)),
            [major, minor, build, revision] => Ok(Self::new(*major, *minor, *build, *revision)),
            _ => Err(invalid_version(version)),
        }
    }
}

impl From<ServerVersion> for ProductVersion {
    fn from(v: ServerVersion) -> Self {
        Self::new(v.major, v.minor, v.build_number, 0)
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// Everything discovered about a server in one round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInformation {
    pub server_version: ServerVersion,
    pub product_version: ProductVersion,
    pub engine_type: DatabaseEngineType,
    pub engine_edition: DatabaseEngineEdition,
    pub host_platform: String,
    pub connection_protocol: NetworkProtocol,
}

// SERVERPROPERTY returns sql_variant, which is cast so the driver can decode it.
const VERSION_QUERY: &str = "DECLARE @edition sysname;
SET @edition = cast(SERVERPROPERTY(N'EDITION') as sysname);
SELECT case when @edition = N'SQL Azure' then 2 else 1 end as DatabaseEngineType,
CAST(SERVERPROPERTY('EngineEdition') AS int) AS DatabaseEngineEdition,
CAST(SERVERPROPERTY('ProductVersion') AS nvarchar(128)) AS ProductVersion,
CAST(@@MICROSOFTVERSION AS bigint) AS MicrosoftVersion;
";

impl ServerInformation {
    /// Information used while disconnected: derived from a version override.
    pub fn offline(server_version: ServerVersion) -> Self {
        Self {
            server_version,
            product_version: server_version.into(),
            engine_type: DatabaseEngineType::Standalone,
            engine_edition: DatabaseEngineEdition::Unknown,
            host_platform: host_platform::WINDOWS.to_string(),
            connection_protocol: NetworkProtocol::NotSpecified,
        }
    }

    /// The discovery batch for a server of the given version.
    pub fn build_query(version: &ServerVersion) -> String {
        let mut query = String::from(VERSION_QUERY);

        if version.major >= HOST_INFO_MIN_MAJOR_VERSION {
            query.push_str("select host_platform from sys.dm_os_host_info\n");
        } else {
            query.push_str("select N'Windows' as host_platform\n");
        }

        if version.major >= CONNECTION_PROPERTY_MIN_MAJOR_VERSION {
            query.push_str(
                "if @edition = N'SQL Azure' \n  select 'TCP' as ConnectionProtocol\nelse\n  \
                 exec ('select CONVERT(nvarchar(40),CONNECTIONPROPERTY(''net_transport'')) as ConnectionProtocol')\n",
            );
        } else {
            query.push_str("select NULL as ConnectionProtocol\n");
        }

        query
    }

    /// Interpret the three result sets of [`ServerInformation::build_query`].
    pub fn from_result(
        server_version: ServerVersion,
        result: &QueryResult,
    ) -> Result<Self, ConnectionError> {
        let [versions, platform, protocol] = result.result_sets.as_slice() else {
            return Err(ConnectionError::internal(format!(
                "Server discovery returned {} result sets, expected 3",
                result.result_sets.len()
            )));
        };

        let mut server_version = server_version;
        let mut engine_type = DatabaseEngineType::from_i32(
            required(versions, "DatabaseEngineType")?
                .as_i32()
                .unwrap_or_default(),
        );
        let edition_value = required(versions, "DatabaseEngineEdition")?
            .as_i32()
            .unwrap_or_default();

        let engine_edition = match DatabaseEngineEdition::from_i32(edition_value) {
            Some(edition) => edition,
            // Unknown Azure editions behave like Azure SQL Database
            None if engine_type == DatabaseEngineType::SqlAzureDatabase => {
                DatabaseEngineEdition::SqlDatabase
            }
            None => DatabaseEngineEdition::Unknown,
        };

        if engine_edition == DatabaseEngineEdition::SqlManagedInstance {
            engine_type = DatabaseEngineType::Standalone;
            server_version = microsoft_version(versions)?;
        }
        if engine_edition == DatabaseEngineEdition::SqlOnDemand {
            server_version = microsoft_version(versions)?;
        }

        let product_version = match required(versions, "ProductVersion")?.as_str() {
            Some(text) => ProductVersion::parse(text)?,
            None => server_version.into(),
        };

        let host_platform = platform
            .value(0, "host_platform")
            .and_then(SqlValue::as_str)
            .unwrap_or(host_platform::WINDOWS)
            .to_string();

        let connection_protocol = protocol
            .value(0, "ConnectionProtocol")
            .and_then(SqlValue::as_str)
            .map(NetworkProtocol::from_net_transport)
            .unwrap_or_default();

        Ok(Self {
            server_version,
            product_version,
            engine_type,
            engine_edition,
            host_platform,
            connection_protocol,
        })
    }
}

fn required<'a>(set: &'a ResultSet, column: &str) -> Result<&'a SqlValue, ConnectionError> {
    set.value(0, column).ok_or_else(|| {
        ConnectionError::internal(format!("Server discovery did not return {}", column))
    })
}

fn microsoft_version(set: &ResultSet) -> Result<ServerVersion, ConnectionError> {
    let raw = required(set, "MicrosoftVersion")?
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| ConnectionError::internal("Invalid @@MICROSOFTVERSION value"))?;
    Ok(ServerVersion::parse_microsoft_version(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::query::{ColumnInfo, ResultRow};

    fn discovery(engine_type: i32, edition: i32, product: &str, ms: i64, protocol: SqlValue) -> QueryResult {
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
                        SqlValue::from(product),
                        SqlValue::I64(ms),
                    ])],
                ),
                ResultSet::new(
                    vec![ColumnInfo::new("host_platform", "NVARCHAR")],
                    vec![ResultRow::new(vec![SqlValue::from("Linux")])],
                ),
                ResultSet::new(
                    vec![ColumnInfo::new("ConnectionProtocol", "NVARCHAR")],
                    vec![ResultRow::new(vec![protocol])],
                ),
            ],
            ..QueryResult::default()
        }
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(
            ServerVersion::parse("16.00.1000").unwrap(),
            ServerVersion::new(16, 0, 1000)
        );
        // Revision beyond the first 10 characters is ignored
        assert_eq!(
            ServerVersion::parse("15.0.4153.1").unwrap(),
            ServerVersion::new(15, 0, 4153)
        );
        assert!(ServerVersion::parse("garbage").is_err());
    }

    #[test]
    fn test_parse_microsoft_version() {
        // 0x0C0007D0 => 12.0, build low byte 0xD0
        let v = ServerVersion::parse_microsoft_version(0x0C00_07D0);
        assert_eq!(v.major, 12);
        assert_eq!(v.minor, 0);
        assert_eq!(v.build_number, 0xD0);
    }

    #[test]
    fn test_product_version() {
        let v = ProductVersion::parse("16.0.1000.6").unwrap();
        assert_eq!(v, ProductVersion::new(16, 0, 1000, 6));
        assert_eq!(v.to_string(), "16.0.1000.6");
    }

    #[test]
    fn test_build_query_by_version() {
        let modern = ServerInformation::build_query(&ServerVersion::new(16, 0, 0));
        assert!(modern.contains("sys.dm_os_host_info"));
        assert!(modern.contains("net_transport"));

        let old = ServerInformation::build_query(&ServerVersion::new(9, 0, 0));
        assert!(old.contains("select N'Windows' as host_platform"));
        assert!(old.contains("select NULL as ConnectionProtocol"));
    }

    #[test]
    fn test_from_result_standalone() {
        let result = discovery(1, 3, "16.0.1000.6", 0x1000_03E8, SqlValue::from("TCP"));
        let info = ServerInformation::from_result(ServerVersion::new(16, 0, 1000), &result).unwrap();

        assert_eq!(info.engine_type, DatabaseEngineType::Standalone);
        assert_eq!(info.engine_edition, DatabaseEngineEdition::Enterprise);
        assert_eq!(info.product_version, ProductVersion::new(16, 0, 1000, 6));
        assert_eq!(info.host_platform, "Linux");
        assert_eq!(info.connection_protocol, NetworkProtocol::TcpIp);
    }

    #[test]
    fn test_unknown_azure_edition_is_sql_database() {
        let result = discovery(2, 42, "12.0.2000.8", 0x0C00_07D0, SqlValue::from("TCP"));
        let info = ServerInformation::from_result(ServerVersion::new(12, 0, 2000), &result).unwrap();
        assert_eq!(info.engine_type, DatabaseEngineType::SqlAzureDatabase);
        assert_eq!(info.engine_edition, DatabaseEngineEdition::SqlDatabase);
    }

    #[test]
    fn test_managed_instance_is_standalone() {
        let result = discovery(2, 8, "12.0.2000.8", 0x0F00_0FA0, SqlValue::Null);
        let info = ServerInformation::from_result(ServerVersion::new(12, 0, 2000), &result).unwrap();

        assert_eq!(info.engine_type, DatabaseEngineType::Standalone);
        assert_eq!(info.server_version.major, 15);
        assert_eq!(info.connection_protocol, NetworkProtocol::NotSpecified);
    }

    #[test]
    fn test_offline_information() {
        let info = ServerInformation::offline(ServerVersion::new(13, 0, 4001));
        assert_eq!(info.engine_type, DatabaseEngineType::Standalone);
        assert_eq!(info.engine_edition, DatabaseEngineEdition::Unknown);
        assert_eq!(info.host_platform, "Windows");
        assert_eq!(info.product_version, ProductVersion::new(13, 0, 4001, 0));
    }

    #[test]
    fn test_missing_result_sets() {
        let err = ServerInformation::from_result(ServerVersion::new(16, 0, 0), &QueryResult::empty());
        assert!(err.is_err());
    }
}
