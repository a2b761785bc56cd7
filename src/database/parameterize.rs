//! Rewriting ad-hoc SQL text into parameterized commands.
//!
//! Callers mark values with `<msparam>value</msparam>` tags; each tag
//! becomes an `@_msparam_N` parameter so the server can reuse one plan
//! for every value. With [`QueryParameterizationMode::ParameterizeLiterals`]
//! untagged literals are lifted out as well.

use crate::constants::{MAX_PARAMETERS, PARAMETER_PREFIX};
use crate::database::backend::{ParameterValue, SqlParameter};
use crate::database::enums::QueryParameterizationMode;
use crate::database::identifiers::quote_string;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern)
        .unwrap_or_else(|e| panic!("Internal error: invalid regex pattern '{}': {}", pattern, e))
}

/// `<msparam>` tags; hex values are captured separately.
static QUERY_TAGS: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?s)<msparam>(?:(?P<hex>\s*0[xX][0-9a-fA-F]+\s*)|(?P<str>.*?))</msparam>")
});

/// Literal expressions when double quotes delimit identifiers.
static LITERALS_QI_ON: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?P<left>[\s,(?=!<>])(?:(?:(?P<mid>N)?(?P<term>')(?:[^']|'')*(?P<right>')|0x[0-9a-fA-F]*|[-+]?(?:[0-9]*\.[0-9]*|[0-9]+)[eE]?[0-9]*|~?[-+]?[0-9]+)(?:\s?[-+*/%&|^]\s?)?)+",
    )
});

/// Literal expressions when double quotes delimit strings.
static LITERALS_QI_OFF: Lazy<Regex> = Lazy::new(|| {
    compile(
        r#"(?P<left>[\s,(?=!<>])(?:(?:(?P<mid>N)?(?P<term>['"])(?:[^'"]|''|"")*(?P<right>['"])|0x[0-9a-fA-F]*|[-+]?(?:[0-9]*\.[0-9]*|[0-9]+)[eE]?[0-9]*|~?[-+]?[0-9]+)(?:\s?[-+*/%&|^]\s?)?)+"#,
    )
});

/// Text that may switch the session's database.
static USE_KEYWORD: Lazy<Regex> = Lazy::new(|| compile(r"(?i)\buse(?:\s|\[)"));

/// Statements whose effect must outlive the batch that runs them.
static SESSION_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)(?:^|[;\n(])\s*set\s|\buse(?:\s|\[)|\bbegin\s+(?:distributed\s+)?tran|\bcommit\b|\brollback\b|\bsave\s+tran|\bcreate\s+table\s+#|\binto\s+#",
    )
});

const WRAPPER_PROCEDURES: [&str; 6] = [
    "sp_executesql",
    "sp_cursorprepexec",
    "sp_prepexec",
    "sp_cursorprepare",
    "sp_cursoropen",
    "sp_prepare",
];

/// Statement text with the parameters extracted from it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterizedQuery {
    pub text: String,
    pub parameters: Vec<SqlParameter>,
}

impl ParameterizedQuery {
    fn unchanged(query: &str) -> Self {
        Self {
            text: query.to_string(),
            parameters: Vec::new(),
        }
    }

    pub fn is_parameterized(&self) -> bool {
        !self.parameters.is_empty()
    }
}

fn parameter_name(index: usize) -> String {
    format!("{}{}", PARAMETER_PREFIX, index)
}

/// Rewrite `query` according to `mode`.
pub fn parameterize(query: &str, mode: QueryParameterizationMode) -> ParameterizedQuery {
    if mode < QueryParameterizationMode::ForcedParameterization {
        return ParameterizedQuery::unchanged(query);
    }

    if QUERY_TAGS.is_match(query) {
        parameterize_tags(query)
    } else if mode == QueryParameterizationMode::ParameterizeLiterals {
        parameterize_literals(query)
    } else {
        ParameterizedQuery::unchanged(query)
    }
}

fn parse_hex(text: &str) -> Option<i64> {
    let digits = text.trim().get(2..)?;
    // Values above i64::MAX keep their two's complement bit pattern
    u64::from_str_radix(digits, 16).ok().map(|v| v as i64)
}

fn parameterize_tags(query: &str) -> ParameterizedQuery {
    let mut parameters: Vec<SqlParameter> = Vec::new();

    let text = QUERY_TAGS.replace_all(query, |caps: &Captures| {
        let value = match caps.name("hex") {
            Some(hex) => match parse_hex(hex.as_str()) {
                Some(v) => ParameterValue::BigInt(v),
                None => ParameterValue::NVarChar(hex.as_str().trim().to_string()),
            },
            None => ParameterValue::NVarChar(
                caps.name("str").map(|m| m.as_str()).unwrap_or_default().to_string(),
            ),
        };

        if parameters.len() < MAX_PARAMETERS {
            let name = parameter_name(parameters.len());
            let mut param = SqlParameter::nvarchar(name.clone(), String::new());
            param.value = value;
            parameters.push(param);
            name
        } else {
            // The server accepts quoted numbers wherever a number is expected
            quote_string(&value.as_text())
        }
    });

    ParameterizedQuery {
        text: text.into_owned(),
        parameters,
    }
}

/// Split a trailing arithmetic operator off a matched literal expression.
fn split_trailing_operator(expr: &str) -> (&str, &str) {
    let trimmed = expr.trim_end();
    let core = match trimmed.chars().last() {
        Some(c) if "+-*/%&|^".contains(c) => trimmed[..trimmed.len() - 1].trim_end(),
        _ => trimmed,
    };
    (core, &expr[core.len()..])
}

/// Value bound for a literal: the contents of a lone string literal, else the expression text.
fn literal_value(literal: &str) -> String {
    let unprefixed = literal.strip_prefix('N').unwrap_or(literal);
    match unprefixed
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        Some(inner) if !inner.replace("''", "").contains('\'') => inner.replace("''", "'"),
        _ => literal.to_string(),
    }
}

fn parameterize_literals(query: &str) -> ParameterizedQuery {
    let mut parameters: Vec<SqlParameter> = Vec::new();

    let text = LITERALS_QI_ON.replace_all(query, |caps: &Captures| {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let left = caps.name("left").map(|m| m.as_str()).unwrap_or_default();
        let (literal, suffix) = split_trailing_operator(&whole[left.len()..]);

        if literal.is_empty() || parameters.len() >= MAX_PARAMETERS {
            return whole.to_string();
        }

        let name = parameter_name(parameters.len());
        parameters.push(SqlParameter::nvarchar(name.clone(), literal_value(literal)));
        format!("{}{}{}", left, name, suffix)
    });

    ParameterizedQuery {
        text: text.into_owned(),
        parameters,
    }
}

/// Reduce a statement to a shape suitable for grouping similar queries.
///
/// Statement text wrapped in `sp_executesql` and the other RPC wrappers is
/// unwrapped, then literal values are replaced by `?` markers, keeping the
/// `N` prefix and the quote characters.
pub fn normalize_query(text: &str, quoted_identifiers: bool) -> String {
    let unwrapped = match unwrap_prepared_statement(text) {
        Some(inner) => inner.replace("''", "'"),
        None => text.to_string(),
    };

    let pattern: &Regex = if quoted_identifiers {
        &LITERALS_QI_ON
    } else {
        &LITERALS_QI_OFF
    };

    pattern
        .replace_all(&unwrapped, |caps: &Captures| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            let group = |name: &str| caps.name(name).map(|m| m.as_str()).unwrap_or_default();
            let (_, suffix) = split_trailing_operator(&whole[group("left").len()..]);
            format!(
                "{}{}{}?{}{}",
                group("left"),
                group("mid"),
                group("term"),
                group("right"),
                suffix
            )
        })
        .into_owned()
}

/// Replace an `exec sp_executesql '...'` style call with its statement text.
///
/// Text before the call is kept; the rest of the call's line is dropped.
fn unwrap_prepared_statement(text: &str) -> Option<String> {
    let exec = text.find("exec")?;
    let after_exec = &text[exec + 4..];

    // Anything but '_' may sit between "exec" and the procedure name
    let (proc_offset, proc_len) = WRAPPER_PROCEDURES
        .iter()
        .filter_map(|p| after_exec.find(p).map(|i| (i, p.len())))
        .filter(|(i, _)| !after_exec[..*i].contains('_'))
        .min_by_key(|(i, _)| *i)?;

    let args = &after_exec[proc_offset + proc_len..];
    let mut chars = args.char_indices().peekable();

    // Opening quote of the statement: the first quote not followed by '@' or ','
    let start = loop {
        let (i, c) = chars.next()?;
        if c == '\'' && !matches!(chars.peek(), Some((_, '@')) | Some((_, ','))) {
            break i + 1;
        }
    };

    let mut end = None;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
            } else {
                end = Some(i);
                break;
            }
        }
    }
    let end = end?;

    let line_end = args[end..].find('\n').map_or(args.len(), |i| end + i);

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..exec]);
    out.push_str(&args[start..end]);
    out.push_str(&args[line_end..]);
    Some(out)
}

/// A `USE <database>` statement found at the start of a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseStatement {
    pub database: String,
    /// Whether the statement is the entire text.
    pub whole_text: bool,
}

/// Recognise `USE db`, `USE [db]` and a trailing `;` at the start of `text`.
pub fn parse_use_statement(text: &str) -> Option<UseStatement> {
    let keyword = text.get(..3)?;
    if !keyword.eq_ignore_ascii_case("use") {
        return None;
    }

    let rest = &text[3..];
    let after_ws = rest.trim_start();
    let had_whitespace = after_ws.len() < rest.len();

    let (database, consumed) = if let Some(inner) = after_ws.strip_prefix('[') {
        let mut name = String::new();
        let mut chars = inner.char_indices().peekable();
        let mut close = None;
        while let Some((i, c)) = chars.next() {
            if c == ']' {
                if matches!(chars.peek(), Some((_, ']'))) {
                    chars.next();
                    name.push(']');
                } else {
                    close = Some(i);
                    break;
                }
            } else {
                name.push(c);
            }
        }
        (name, close? + 2)
    } else {
        if !had_whitespace {
            return None;
        }
        let end = after_ws
            .find(|c: char| c == ';' || c.is_whitespace())
            .unwrap_or(after_ws.len());
        (after_ws[..end].to_string(), end)
    };

    if database.is_empty() {
        return None;
    }

    let tail = after_ws[consumed..]
        .trim_start()
        .trim_start_matches(';')
        .trim_start();

    Some(UseStatement {
        database,
        whole_text: tail.is_empty(),
    })
}

/// Whether executing `text` may change the database context.
pub fn may_change_database(text: &str) -> bool {
    USE_KEYWORD.is_match(text)
}

/// Whether `text` changes session state and therefore has to run as a plain
/// batch rather than inside `sp_executesql`. Covers `USE`, `SET` options,
/// transaction control and temporary table creation.
pub fn changes_session_state(text: &str) -> bool {
    SESSION_STATEMENT.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(q: &ParameterizedQuery) -> Vec<ParameterValue> {
        q.parameters.iter().map(|p| p.value.clone()).collect()
    }

    #[test]
    fn test_tags_become_parameters() {
        let q = parameterize(
            "SELECT * FROM sys.objects WHERE name = <msparam>t1</msparam> AND type = <msparam>U</msparam>",
            QueryParameterizationMode::ForcedParameterization,
        );

        assert_eq!(
            q.text,
            "SELECT * FROM sys.objects WHERE name = @_msparam_0 AND type = @_msparam_1"
        );
        assert_eq!(
            values(&q),
            vec![
                ParameterValue::NVarChar("t1".into()),
                ParameterValue::NVarChar("U".into())
            ]
        );
        assert_eq!(q.parameters[0].size, 4000);
    }

    #[test]
    fn test_hex_tags_become_bigint() {
        let q = parameterize(
            "SELECT <msparam> 0x1F </msparam>",
            QueryParameterizationMode::ForcedParameterization,
        );
        assert_eq!(q.text, "SELECT @_msparam_0");
        assert_eq!(values(&q), vec![ParameterValue::BigInt(31)]);
    }

    #[test]
    fn test_multiline_tag() {
        let q = parameterize(
            "SELECT <msparam>line1\nline2</msparam>",
            QueryParameterizationMode::ForcedParameterization,
        );
        assert_eq!(values(&q), vec![ParameterValue::NVarChar("line1\nline2".into())]);
    }

    #[test]
    fn test_parameter_limit_inlines_literals() {
        let query: String = (0..MAX_PARAMETERS + 2)
            .map(|i| format!("<msparam>v'{}</msparam>", i))
            .collect::<Vec<_>>()
            .join(",");
        let q = parameterize(&query, QueryParameterizationMode::ForcedParameterization);

        assert_eq!(q.parameters.len(), MAX_PARAMETERS);
        assert!(q.text.ends_with(&format!("'v''{}','v''{}'", MAX_PARAMETERS, MAX_PARAMETERS + 1)));
    }

    #[test]
    fn test_mode_none_leaves_text() {
        let text = "SELECT <msparam>1</msparam>";
        let q = parameterize(text, QueryParameterizationMode::None);
        assert_eq!(q.text, text);
        assert!(!q.is_parameterized());
    }

    #[test]
    fn test_forced_mode_ignores_untagged_literals() {
        let text = "SELECT * FROM t WHERE a = 5";
        let q = parameterize(text, QueryParameterizationMode::ForcedParameterization);
        assert_eq!(q.text, text);
    }

    #[test]
    fn test_parameterize_literals() {
        let q = parameterize(
            "SELECT * FROM t WHERE a = 5 AND b = N'it''s'",
            QueryParameterizationMode::ParameterizeLiterals,
        );
        assert_eq!(
            q.text,
            "SELECT * FROM t WHERE a = @_msparam_0 AND b = @_msparam_1"
        );
        assert_eq!(
            values(&q),
            vec![
                ParameterValue::NVarChar("5".into()),
                ParameterValue::NVarChar("it's".into())
            ]
        );
    }

    #[test]
    fn test_literal_keeps_trailing_operator() {
        let q = parameterize(
            "SELECT a FROM t WHERE a = 5 * b",
            QueryParameterizationMode::ParameterizeLiterals,
        );
        assert_eq!(q.text, "SELECT a FROM t WHERE a = @_msparam_0 * b");
    }

    #[test]
    fn test_normalize_literals() {
        assert_eq!(
            normalize_query("SELECT * FROM t WHERE a = 5 AND b = N'x'", true),
            "SELECT * FROM t WHERE a = ? AND b = N'?'"
        );
        assert_eq!(
            normalize_query("SELECT * FROM t WHERE b = \"x\"", false),
            "SELECT * FROM t WHERE b = \"?\""
        );
        // Double quotes are identifiers when quoted identifiers are on
        assert_eq!(
            normalize_query("SELECT \"col\" FROM t", true),
            "SELECT \"col\" FROM t"
        );
    }

    #[test]
    fn test_normalize_unwraps_executesql() {
        let text = "exec sp_executesql N'SELECT * FROM t WHERE id = @p1 AND n = ''a''', N'@p1 int', @p1 = 5";
        assert_eq!(
            normalize_query(text, true),
            "SELECT * FROM t WHERE id = @p1 AND n = '?'"
        );
    }

    #[test]
    fn test_normalize_unwraps_prepexec() {
        let text = "declare @p1 int; exec sp_prepexec @p1 output, N'@P1 int', N'SELECT 1 FROM t WHERE id = @P1', 5";
        assert_eq!(
            normalize_query(text, true),
            "declare @p1 int; SELECT ? FROM t WHERE id = @P1"
        );
    }

    #[test]
    fn test_parse_use_statement() {
        assert_eq!(
            parse_use_statement("USE master"),
            Some(UseStatement {
                database: "master".into(),
                whole_text: true
            })
        );
        assert_eq!(
            parse_use_statement("use [My DB];"),
            Some(UseStatement {
                database: "My DB".into(),
                whole_text: true
            })
        );
        assert_eq!(
            parse_use_statement("USE tempdb; SELECT 1"),
            Some(UseStatement {
                database: "tempdb".into(),
                whole_text: false
            })
        );
        assert_eq!(parse_use_statement("USEFUL"), None);
        assert_eq!(parse_use_statement("SELECT 1"), None);
        assert_eq!(parse_use_statement("USE [a]]b]").map(|u| u.database), Some("a]b".into()));
    }

    #[test]
    fn test_may_change_database() {
        assert!(may_change_database("USE master"));
        assert!(may_change_database("select 1; use [tempdb]"));
        assert!(!may_change_database("SELECT user_id FROM t"));
    }

    #[test]
    fn test_changes_session_state() {
        assert!(changes_session_state("SET LOCK_TIMEOUT 5000"));
        assert!(changes_session_state("select 1;\nset nocount on"));
        assert!(changes_session_state("BEGIN TRANSACTION"));
        assert!(changes_session_state("if (@@trancount > 0) COMMIT TRANSACTION"));
        assert!(changes_session_state("USE [tempdb]"));
        assert!(changes_session_state("create table #items (id int)"));
        assert!(changes_session_state("select name into #names from sys.objects"));
        assert!(!changes_session_state("insert #items values (1)"));
        assert!(!changes_session_state("UPDATE t SET a = 1 WHERE id = 2"));
        assert!(!changes_session_state("SELECT offset FROM t"));
    }
}
