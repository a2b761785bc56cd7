//! Database-name comparison following the server collation, and the
//! per-server registry of connections to individual databases.

use crate::database::auth::RenewableToken;
use crate::database::backend::{Connector, SqlCommand, SqlParameter};
use crate::database::connection_string::{keys, ConnectionStringBuilder};
use crate::database::enums::DatabaseEngineType;
use crate::database::server_connection::ServerConnection;
use crate::database::settings::ConnectionSettings;
use crate::database::types::SqlValue;
use crate::error::ConnectionError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const COLLATION_QUERY: &str = "SELECT CAST(COLLATIONPROPERTY((select collation_name from sys.databases where name = ISNULL(@dbname, db_name())), 'LCID') AS int), \
CAST(COLLATIONPROPERTY((select collation_name from sys.databases where name = ISNULL(@dbname, db_name())), 'ComparisonStyle') AS int)";

const COLLATION_QUERY_SHILOH: &str = "SELECT CAST(COLLATIONPROPERTY(CAST(DATABASEPROPERTYEX(ISNULL(@dbname, db_name()), 'Collation') AS sysname), 'LCID') AS int), \
CAST(COLLATIONPROPERTY(CAST(DATABASEPROPERTYEX(ISNULL(@dbname, db_name()), 'Collation') AS sysname), 'ComparisonStyle') AS int)";

const LCID_EN_US: i32 = 1033;
const AZURE_MASTER_STYLE: i32 = 0x30001;

// Alternate sort orders of East Asian locales share the culture of the base LCID.
const ALTERNATE_SORT_LCIDS: [i32; 7] = [0x10404, 0x10804, 0x10c04, 0x11004, 0x11404, 0x10411, 0x10412];

const STYLE_IGNORE_CASE: i32 = 0x1;
const STYLE_IGNORE_ACCENTS: i32 = 0x2;
const STYLE_IGNORE_KANA: i32 = 0x10000;
const STYLE_IGNORE_WIDTH: i32 = 0x20000;

/// How two names are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompareOptions {
    pub ignore_case: bool,
    pub ignore_accents: bool,
    pub ignore_kana: bool,
    pub ignore_width: bool,
}

impl CompareOptions {
    /// Options for a `COLLATIONPROPERTY(..., 'ComparisonStyle')` value.
    pub fn from_style(style: i32) -> Self {
        Self {
            ignore_case: style & STYLE_IGNORE_CASE != 0,
            ignore_accents: style & STYLE_IGNORE_ACCENTS != 0,
            ignore_kana: style & STYLE_IGNORE_KANA != 0,
            ignore_width: style & STYLE_IGNORE_WIDTH != 0,
        }
    }

    pub fn is_ordinal(&self) -> bool {
        *self == Self::default()
    }
}

/// Compares database names the way the server collation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerComparer {
    lcid: i32,
    options: CompareOptions,
}

impl Default for ServerComparer {
    fn default() -> Self {
        Self::ordinal()
    }
}

impl ServerComparer {
    /// Byte-wise comparison.
    pub fn ordinal() -> Self {
        Self {
            lcid: LCID_EN_US,
            options: CompareOptions::default(),
        }
    }

    /// Comparer for a collation's LCID and comparison style.
    pub fn from_collation(lcid: i32, style: i32) -> Self {
        let lcid = if ALTERNATE_SORT_LCIDS.contains(&lcid) {
            lcid & 0x3fff
        } else if lcid == 0x827 {
            // Lithuanian classic is not a valid culture
            0x427
        } else {
            lcid
        };

        Self {
            lcid,
            options: CompareOptions::from_style(style),
        }
    }

    /// Comparer for the collation of `database` on the server behind `conn`.
    pub async fn for_database(
        conn: &mut ServerConnection,
        database: &str,
    ) -> Result<Self, ConnectionError> {
        if conn.manager().is_force_disconnected() {
            return Ok(Self::ordinal());
        }

        if conn.manager_mut().database_engine_type().await? == DatabaseEngineType::SqlAzureDatabase
            && database.eq_ignore_ascii_case("master")
        {
            return Ok(Self::from_collation(LCID_EN_US, AZURE_MASTER_STYLE));
        }

        let query = if conn.manager_mut().server_version().await?.major <= 8 {
            COLLATION_QUERY_SHILOH
        } else {
            COLLATION_QUERY
        };
        let command = SqlCommand::new(query)
            .with_parameters(vec![SqlParameter::nvarchar("@dbname", database)]);
        let result = conn.query_command(command).await?;

        let row = result.first().and_then(|set| set.rows.first());
        let lcid = row.and_then(|r| r.get(0)).and_then(SqlValue::as_i32);
        let style = row.and_then(|r| r.get(1)).and_then(SqlValue::as_i32);

        match (lcid, style) {
            (Some(lcid), Some(style)) => {
                debug!("Collation of {}: LCID {:#x}, style {:#x}", database, lcid, style);
                Ok(Self::from_collation(lcid, style))
            }
            _ => {
                debug!("No collation found for {}, comparing ordinally", database);
                Ok(Self::ordinal())
            }
        }
    }

    pub fn lcid(&self) -> i32 {
        self.lcid
    }

    pub fn options(&self) -> CompareOptions {
        self.options
    }

    /// The form of `name` under which equal names coincide.
    pub fn normalize(&self, name: &str) -> String {
        if self.options.is_ordinal() {
            return name.to_string();
        }

        let mut out = String::with_capacity(name.len());
        for c in name.chars() {
            let mut c = c;
            if self.options.ignore_width {
                c = narrow(c);
            }
            if self.options.ignore_kana {
                c = hiragana(c);
            }
            if self.options.ignore_accents {
                c = strip_accent(c);
            }
            if self.options.ignore_case {
                out.extend(c.to_lowercase());
            } else {
                out.push(c);
            }
        }
        out
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        if self.options.is_ordinal() {
            return a.cmp(b);
        }
        self.normalize(a).cmp(&self.normalize(b))
    }

    pub fn equals(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

/// Full-width ASCII variants and the ideographic space to their ASCII forms.
fn narrow(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

/// Katakana to the matching hiragana.
fn hiragana(c: char) -> char {
    match c {
        '\u{30A1}'..='\u{30F6}' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
        _ => c,
    }
}

/// Latin letters with diacritics to their base letter.
fn strip_accent(c: char) -> char {
    match c {
        'À'..='Å' | 'Ā' | 'Ă' | 'Ą' => 'A',
        'à'..='å' | 'ā' | 'ă' | 'ą' => 'a',
        'Ç' | 'Ć' | 'Ĉ' | 'Ċ' | 'Č' => 'C',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'Ď' | 'Đ' => 'D',
        'ď' | 'đ' => 'd',
        'È'..='Ë' | 'Ē' | 'Ĕ' | 'Ė' | 'Ę' | 'Ě' => 'E',
        'è'..='ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'Ĝ' | 'Ğ' | 'Ġ' | 'Ģ' => 'G',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'Ì'..='Ï' | 'Ĩ' | 'Ī' | 'Ĭ' | 'Į' | 'İ' => 'I',
        'ì'..='ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' => 'i',
        'Ñ' | 'Ń' | 'Ņ' | 'Ň' => 'N',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'Ò'..='Ö' | 'Ø' | 'Ō' | 'Ŏ' | 'Ő' => 'O',
        'ò'..='ö' | 'ø' | 'ō' | 'ŏ' | 'ő' => 'o',
        'Ŕ' | 'Ŗ' | 'Ř' => 'R',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'Ś' | 'Ŝ' | 'Ş' | 'Š' => 'S',
        'ś' | 'ŝ' | 'ş' | 'š' => 's',
        'Ţ' | 'Ť' => 'T',
        'ţ' | 'ť' => 't',
        'Ù'..='Ü' | 'Ũ' | 'Ū' | 'Ŭ' | 'Ů' | 'Ű' | 'Ų' => 'U',
        'ù'..='ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'Ý' | 'Ÿ' => 'Y',
        'ý' | 'ÿ' => 'y',
        'Ź' | 'Ż' | 'Ž' => 'Z',
        'ź' | 'ż' | 'ž' => 'z',
        _ => c,
    }
}

// -----------------------------------------------------------------------------
// Connection factory
// -----------------------------------------------------------------------------

static FACTORIES: Lazy<Mutex<HashMap<String, Arc<ConnectionFactory>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Connections to the databases of one server, keyed by connection string.
pub struct ConnectionFactory {
    connection_string: String,
    connector: Arc<dyn Connector>,
    access_token: Option<Arc<dyn RenewableToken>>,
    comparer: ServerComparer,
    connections: Mutex<HashMap<String, Arc<tokio::sync::Mutex<ServerConnection>>>>,
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("comparer", &self.comparer)
            .field("connections", &self.connections.lock().len())
            .finish_non_exhaustive()
    }
}

impl ConnectionFactory {
    /// The factory for the server behind `conn`, created on first use.
    pub fn for_connection(
        conn: &ServerConnection,
        comparer: ServerComparer,
    ) -> Result<Arc<Self>, ConnectionError> {
        let settings = conn.settings();
        let connection_string = settings.connection_string()?;

        let mut factories = FACTORIES.lock();
        let factory = factories
            .entry(connection_string.clone())
            .or_insert_with(|| {
                debug!("Creating connection factory for {}", settings.server_instance());
                Arc::new(Self {
                    connection_string,
                    connector: conn.manager().connector(),
                    access_token: settings.access_token().cloned(),
                    comparer,
                    connections: Mutex::new(HashMap::new()),
                })
            });
        Ok(factory.clone())
    }

    /// Drop every registered factory and its cached connections.
    pub fn clear_all() {
        FACTORIES.lock().clear();
    }

    pub fn comparer(&self) -> &ServerComparer {
        &self.comparer
    }

    /// The shared pooled connection to `database`.
    pub fn pooled(
        &self,
        database: &str,
    ) -> Result<Arc<tokio::sync::Mutex<ServerConnection>>, ConnectionError> {
        let key = self.comparer.normalize(database);
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(&key) {
            return Ok(existing.clone());
        }

        let conn = Arc::new(tokio::sync::Mutex::new(self.create(database, true)?));
        connections.insert(key, conn.clone());
        Ok(conn)
    }

    /// A new connection to `database`.
    pub fn create(&self, database: &str, pooled: bool) -> Result<ServerConnection, ConnectionError> {
        let mut builder = ConnectionStringBuilder::parse(&self.connection_string)?;
        builder.set(keys::INITIAL_CATALOG, database);
        builder.set_bool(keys::POOLING, pooled);

        let mut settings = ConnectionSettings::from_connection_string(&builder.to_string())?;
        settings.set_access_token(self.access_token.clone())?;
        Ok(ServerConnection::with_connector(settings, self.connector.clone()))
    }

    /// Number of cached pooled connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mock::{server_discovery, MockConnector};
    use crate::database::query::{ColumnInfo, QueryResult, ResultRow, ResultSet};
    use crate::database::server_connection::DatabaseConnection;
    use serial_test::serial;

    fn collation(lcid: i32, style: i32) -> QueryResult {
        QueryResult::from_set(ResultSet::new(
            vec![ColumnInfo::new("lcid", "INT"), ColumnInfo::new("style", "INT")],
            vec![ResultRow::new(vec![SqlValue::I32(lcid), SqlValue::I32(style)])],
        ))
    }

    #[test]
    fn test_case_insensitive_comparison() {
        let comparer = ServerComparer::from_collation(1033, 0x30001);
        assert!(comparer.equals("Sales", "SALES"));
        assert!(!comparer.equals("Sales", "Salés"));
        assert_eq!(comparer.normalize("ＳＡＬＥＳ"), "sales");
        assert_eq!(comparer.compare("a", "B"), Ordering::Less);
    }

    #[test]
    fn test_accent_and_kana_insensitive() {
        let comparer = ServerComparer::from_collation(1041, 0x3);
        assert!(comparer.equals("Café", "cafe"));

        let kana = ServerComparer::from_collation(1041, 0x10000);
        assert!(kana.equals("カタ", "かた"));
        assert!(!kana.equals("カタ", "カダ"));
    }

    #[test]
    fn test_ordinal_comparison() {
        let comparer = ServerComparer::from_collation(1033, 0);
        assert!(comparer.options().is_ordinal());
        assert!(!comparer.equals("Sales", "sales"));
        assert_eq!(comparer.compare("B", "a"), Ordering::Less);
    }

    #[test]
    fn test_lcid_normalization() {
        assert_eq!(ServerComparer::from_collation(0x10404, 1).lcid(), 0x404);
        assert_eq!(ServerComparer::from_collation(0x10411, 1).lcid(), 0x411);
        assert_eq!(ServerComparer::from_collation(0x827, 1).lcid(), 0x427);
        assert_eq!(ServerComparer::from_collation(0x10407, 1).lcid(), 0x10407);
    }

    fn connection(mock: &MockConnector) -> ServerConnection {
        let settings = ConnectionSettings::with_login("db01", "sa", "secret").unwrap();
        ServerConnection::with_connector(settings, mock.clone().into_connector())
    }

    #[tokio::test]
    async fn test_collation_lookup() {
        let mock = MockConnector::new();
        mock.respond(
            "DatabaseEngineType",
            server_discovery(1, 3, "16.0.1000.6", "Windows", Some("TCP")),
        );
        mock.respond("COLLATIONPROPERTY", collation(1033, 0x30001));
        let mut conn = connection(&mock);

        let comparer = ServerComparer::for_database(&mut conn, "Sales").await.unwrap();
        assert!(comparer.options().ignore_case);

        let lookup = mock
            .executed_commands()
            .into_iter()
            .find(|c| c.text.contains("COLLATIONPROPERTY"))
            .unwrap();
        assert!(lookup.text.contains("sys.databases"));
        assert_eq!(lookup.parameters[0].name, "@dbname");
    }

    #[tokio::test]
    async fn test_azure_master_shortcut() {
        let mock = MockConnector::new().with_version("12.0.2000.8");
        mock.respond(
            "DatabaseEngineType",
            server_discovery(2, 5, "12.0.2000.8", "Windows", Some("TCP")),
        );
        let mut conn = connection(&mock);

        let comparer = ServerComparer::for_database(&mut conn, "master").await.unwrap();
        assert_eq!(comparer.lcid(), 1033);
        assert!(comparer.options().ignore_case);
        assert!(!mock.executed().iter().any(|s| s.contains("COLLATIONPROPERTY")));
    }

    #[tokio::test]
    async fn test_offline_connections_compare_ordinally() {
        let mock = MockConnector::new();
        let mut conn = connection(&mock);
        conn.manager_mut().force_disconnected().await;

        let comparer = ServerComparer::for_database(&mut conn, "master").await.unwrap();
        assert!(comparer.options().is_ordinal());
    }

    #[tokio::test]
    #[serial]
    async fn test_database_connection_reuses_pooled_connections() {
        ConnectionFactory::clear_all();
        let mock = MockConnector::new();
        mock.respond(
            "DatabaseEngineType",
            server_discovery(1, 3, "16.0.1000.6", "Windows", Some("TCP")),
        );
        mock.respond("COLLATIONPROPERTY", collation(1033, 0x30001));
        let mut conn = connection(&mock);

        assert!(matches!(
            conn.database_connection("MASTER", true).await.unwrap(),
            DatabaseConnection::Current(_)
        ));

        let first = match conn.database_connection("Sales", true).await.unwrap() {
            DatabaseConnection::Shared(shared) => shared,
            _ => panic!("expected a shared connection"),
        };
        let second = match conn.database_connection("SALES", true).await.unwrap() {
            DatabaseConnection::Shared(shared) => shared,
            _ => panic!("expected a shared connection"),
        };
        assert!(Arc::ptr_eq(&first, &second));

        {
            let shared = first.lock().await;
            assert_eq!(shared.settings().initial_catalog().unwrap(), "Sales");
            assert!(!shared.settings().non_pooled_connection());
            assert!(shared.settings().uses_pool().unwrap());
        }

        match conn.database_connection("Sales", false).await.unwrap() {
            DatabaseConnection::Dedicated(dedicated) => {
                let cs = dedicated.settings().connection_string().unwrap();
                assert!(cs.contains("Pooling=False"), "{cs}");
                assert!(dedicated.settings().non_pooled_connection());
                assert!(!dedicated.settings().uses_pool().unwrap());
            }
            _ => panic!("expected a dedicated connection"),
        }
        ConnectionFactory::clear_all();
    }
}
