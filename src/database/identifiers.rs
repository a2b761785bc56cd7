//! T-SQL quoting helpers.
//!
//! Identifiers use bracket notation (`[name]`, with `]` doubled); string
//! literals use single quotes (with `'` doubled).

/// Maximum length for SQL Server identifiers.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Quote a single identifier with brackets.
///
/// ```
/// use mssql_conninfo::database::identifiers::quote_identifier;
///
/// assert_eq!(quote_identifier("Sales"), "[Sales]");
/// assert_eq!(quote_identifier("odd]name"), "[odd]]name]");
/// ```
pub fn quote_identifier(identifier: &str) -> String {
    format!("[{}]", identifier.replace(']', "]]"))
}

/// Remove one level of bracket quoting, un-doubling `]]`.
pub fn unquote_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    match trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        Some(inner) => inner.replace("]]", "]"),
        None => trimmed.to_string(),
    }
}

/// Double every occurrence of `quote` in `value`.
pub fn escape_string(value: &str, quote: char) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == quote {
            escaped.push(c);
        }
        escaped.push(c);
    }
    escaped
}

/// A single-quoted literal: `'it''s'`.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", escape_string(value, '\''))
}

/// A Unicode literal: `N'it''s'`.
pub fn quote_unicode_string(value: &str) -> String {
    format!("N{}", quote_string(value))
}

/// Check that a name can be used as a single identifier.
pub fn is_valid_identifier(identifier: &str) -> bool {
    let trimmed = identifier.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= MAX_IDENTIFIER_LENGTH
        && !trimmed.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("Users"), "[Users]");
        assert_eq!(quote_identifier("My Table"), "[My Table]");
        assert_eq!(quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn test_unquote_identifier() {
        assert_eq!(unquote_identifier("[a]]b]"), "a]b");
        assert_eq!(unquote_identifier("  plain "), "plain");
        assert_eq!(unquote_identifier("[unterminated"), "[unterminated");
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(escape_string("it's", '\''), "it''s");
        assert_eq!(escape_string("say \"hi\"", '"'), "say \"\"hi\"\"");
        assert_eq!(quote_string("O'Brien"), "'O''Brien'");
        assert_eq!(quote_unicode_string("x"), "N'x'");
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("Sales"));
        assert!(!is_valid_identifier("   "));
        assert!(!is_valid_identifier(&"x".repeat(MAX_IDENTIFIER_LENGTH + 1)));
        assert!(!is_valid_identifier("bad\0name"));
    }
}
