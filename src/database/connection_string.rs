//! ADO.NET-style connection strings.
//!
//! [`ConnectionStringBuilder`] keeps keywords in insertion order under their
//! canonical names, so a string can be parsed, edited and written back without
//! reordering the caller's keys. [`DataSource`] splits a `Data Source` value
//! into host, instance and port.

use crate::constants::DEFAULT_PORT;
use crate::error::ConnectionError;
use std::fmt;

/// Canonical keyword names.
pub mod keys {
    pub const DATA_SOURCE: &str = "Data Source";
    pub const INITIAL_CATALOG: &str = "Initial Catalog";
    pub const USER_ID: &str = "User ID";
    pub const PASSWORD: &str = "Password";
    pub const INTEGRATED_SECURITY: &str = "Integrated Security";
    pub const CONNECT_TIMEOUT: &str = "Connect Timeout";
    pub const NETWORK_LIBRARY: &str = "Network Library";
    pub const WORKSTATION_ID: &str = "Workstation ID";
    pub const APPLICATION_NAME: &str = "Application Name";
    pub const LOAD_BALANCE_TIMEOUT: &str = "Load Balance Timeout";
    pub const MAX_POOL_SIZE: &str = "Max Pool Size";
    pub const MIN_POOL_SIZE: &str = "Min Pool Size";
    pub const POOLING: &str = "Pooling";
    pub const PACKET_SIZE: &str = "Packet Size";
    pub const ENCRYPT: &str = "Encrypt";
    pub const HOST_NAME_IN_CERTIFICATE: &str = "Host Name In Certificate";
    pub const SERVER_CERTIFICATE: &str = "Server Certificate";
    pub const TRUST_SERVER_CERTIFICATE: &str = "Trust Server Certificate";
    pub const AUTHENTICATION: &str = "Authentication";
    pub const APPLICATION_INTENT: &str = "Application Intent";
    pub const MULTIPLE_ACTIVE_RESULT_SETS: &str = "Multiple Active Result Sets";
}

/// Synonyms folded onto canonical keywords (compared case-insensitively).
const SYNONYMS: &[(&str, &str)] = &[
    ("data source", keys::DATA_SOURCE),
    ("server", keys::DATA_SOURCE),
    ("address", keys::DATA_SOURCE),
    ("addr", keys::DATA_SOURCE),
    ("network address", keys::DATA_SOURCE),
    ("initial catalog", keys::INITIAL_CATALOG),
    ("database", keys::INITIAL_CATALOG),
    ("user id", keys::USER_ID),
    ("uid", keys::USER_ID),
    ("user", keys::USER_ID),
    ("password", keys::PASSWORD),
    ("pwd", keys::PASSWORD),
    ("integrated security", keys::INTEGRATED_SECURITY),
    ("trusted_connection", keys::INTEGRATED_SECURITY),
    ("connect timeout", keys::CONNECT_TIMEOUT),
    ("connection timeout", keys::CONNECT_TIMEOUT),
    ("timeout", keys::CONNECT_TIMEOUT),
    ("network library", keys::NETWORK_LIBRARY),
    ("net", keys::NETWORK_LIBRARY),
    ("network", keys::NETWORK_LIBRARY),
    ("workstation id", keys::WORKSTATION_ID),
    ("wsid", keys::WORKSTATION_ID),
    ("application name", keys::APPLICATION_NAME),
    ("app", keys::APPLICATION_NAME),
    ("load balance timeout", keys::LOAD_BALANCE_TIMEOUT),
    ("connection lifetime", keys::LOAD_BALANCE_TIMEOUT),
    ("max pool size", keys::MAX_POOL_SIZE),
    ("min pool size", keys::MIN_POOL_SIZE),
    ("pooling", keys::POOLING),
    ("packet size", keys::PACKET_SIZE),
    ("encrypt", keys::ENCRYPT),
    ("host name in certificate", keys::HOST_NAME_IN_CERTIFICATE),
    ("hostnameincertificate", keys::HOST_NAME_IN_CERTIFICATE),
    ("server certificate", keys::SERVER_CERTIFICATE),
    ("servercertificate", keys::SERVER_CERTIFICATE),
    ("trust server certificate", keys::TRUST_SERVER_CERTIFICATE),
    ("trustservercertificate", keys::TRUST_SERVER_CERTIFICATE),
    ("authentication", keys::AUTHENTICATION),
    ("application intent", keys::APPLICATION_INTENT),
    ("applicationintent", keys::APPLICATION_INTENT),
    ("multiple active result sets", keys::MULTIPLE_ACTIVE_RESULT_SETS),
    ("multipleactiveresultsets", keys::MULTIPLE_ACTIVE_RESULT_SETS),
];

/// Resolve a keyword to its canonical spelling; unknown keywords are kept as written.
pub fn canonical_key(key: &str) -> String {
    let lowered = key.trim().to_ascii_lowercase();
    SYNONYMS
        .iter()
        .find(|(synonym, _)| *synonym == lowered)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| key.trim().to_string())
}

/// Ordered, keyword-normalising connection string editor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStringBuilder {
    entries: Vec<(String, String)>,
}

impl ConnectionStringBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a connection string.
    pub fn parse(input: &str) -> Result<Self, ConnectionError> {
        let mut builder = Self::new();
        let mut rest = input;

        loop {
            rest = rest.trim_start_matches(|c: char| c == ';' || c.is_whitespace());
            if rest.is_empty() {
                break;
            }

            let segment = rest.split(';').next().unwrap_or(rest);
            let eq = segment.find('=').ok_or_else(|| {
                ConnectionError::invalid_argument(format!(
                    "Connection string segment '{}' has no '=' separator",
                    segment
                ))
            })?;
            let key = rest[..eq].trim();
            if key.is_empty() {
                return Err(ConnectionError::invalid_argument(
                    "Connection string contains an empty keyword",
                ));
            }
            rest = rest[eq + 1..].trim_start();

            let (value, remaining) = match rest.chars().next() {
                Some(quote @ ('"' | '\'')) => read_quoted(&rest[1..], quote)?,
                _ => match rest.find(';') {
                    Some(end) => (rest[..end].trim_end().to_string(), &rest[end..]),
                    None => (rest.trim_end().to_string(), ""),
                },
            };

            builder.set(key, value);
            rest = remaining;
        }

        Ok(builder)
    }

    /// Set a keyword, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let key = canonical_key(key);
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, if value { "True" } else { "False" });
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, value.to_string());
    }

    /// Remove a keyword, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let key = canonical_key(key);
        let idx = self
            .entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(&key))?;
        Some(self.entries.remove(idx).1)
    }

    /// Value of a keyword (any synonym).
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = canonical_key(key);
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&key))
            .map(|(_, value)| value.as_str())
    }

    /// Boolean value of a keyword; `yes` and `sspi` count as true.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConnectionError> {
        self.get(key)
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "sspi" => Ok(true),
                "false" | "no" => Ok(false),
                _ => Err(ConnectionError::invalid_argument(format!(
                    "Invalid boolean value '{}' for keyword '{}'",
                    value, key
                ))),
            })
            .transpose()
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConnectionError> {
        self.get(key)
            .map(|value| {
                value.trim().parse::<i64>().map_err(|_| {
                    ConnectionError::invalid_argument(format!(
                        "Invalid integer value '{}' for keyword '{}'",
                        value, key
                    ))
                })
            })
            .transpose()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keywords and values in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parsed `Data Source`, defaulting to the local default instance.
    pub fn data_source(&self) -> DataSource {
        DataSource::parse(self.get(keys::DATA_SOURCE).unwrap_or(""))
    }
}

impl fmt::Display for ConnectionStringBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", key, quote_value(value))?;
        }
        Ok(())
    }
}

fn read_quoted(input: &str, quote: char) -> Result<(String, &str), ConnectionError> {
    let mut value = String::new();
    let mut chars = input.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if c != quote {
            value.push(c);
            continue;
        }
        if matches!(chars.peek(), Some((_, next)) if *next == quote) {
            value.push(quote);
            chars.next();
            continue;
        }
        let remaining = input[idx + c.len_utf8()..].trim_start();
        if !(remaining.is_empty() || remaining.starts_with(';')) {
            return Err(ConnectionError::invalid_argument(
                "Unexpected text after quoted connection string value",
            ));
        }
        return Ok((value, remaining));
    }

    Err(ConnectionError::invalid_argument(
        "Unterminated quoted value in connection string",
    ))
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains(';')
        || value.contains('"')
        || value.contains('\'')
        || value.contains('=')
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);

    if !needs_quotes {
        value.to_string()
    } else if value.contains('"') && !value.contains('\'') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value.replace('"', "\"\""))
    }
}

/// Components of a `Data Source` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    /// Protocol prefix (`tcp`, `np`, `lpc`, `admin`), lower-cased.
    pub protocol: Option<String>,
    pub host: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
}

impl DataSource {
    /// Parse `[protocol:]host[\instance][,port]`.
    pub fn parse(value: &str) -> Self {
        let mut rest = value.trim();

        let mut protocol = None;
        if let Some((prefix, tail)) = rest.split_once(':') {
            let prefix_lower = prefix.trim().to_ascii_lowercase();
            if matches!(prefix_lower.as_str(), "tcp" | "np" | "lpc" | "admin") {
                protocol = Some(prefix_lower);
                rest = tail.trim();
            }
        }

        let mut port = None;
        if let Some((head, port_text)) = rest.rsplit_once(',') {
            port = port_text.trim().parse::<u16>().ok();
            rest = head.trim();
        }

        let (host, instance) = match rest.split_once('\\') {
            Some((host, instance)) if !instance.trim().is_empty() => {
                (host.trim(), Some(instance.trim().to_string()))
            }
            Some((host, _)) => (host.trim(), None),
            None => (rest, None),
        };

        let host = match host.to_ascii_lowercase().as_str() {
            "" | "." | "(local)" | "(localdb)" | "localhost" => "localhost".to_string(),
            _ => host.to_string(),
        };

        Self {
            protocol,
            host,
            instance,
            port,
        }
    }

    /// Port to connect to when no instance lookup is needed.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}
