//! Splitting scripts into batches.
//!
//! A batch separator (`GO` by default) on a line of its own ends a batch.
//! The separator may carry a repeat count (`GO 3`) and a trailing `--`
//! comment. Separators inside block comments, string literals and quoted
//! identifiers are ignored.

use crate::database::enums::ExecutionTypes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    BlockComment(u32),
    Quoted(char),
}

/// Statements produced for one `execute_non_query` call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatementList {
    pub statements: Vec<String>,
    /// Number of trailing statements that undo session options set at the start.
    pub to_reverse: usize,
}

impl StatementList {
    /// The trailing statements to run when a failure interrupts the list
    /// after `executed` statements.
    pub fn reversal(&self, executed: usize) -> &[String] {
        let count = self.to_reverse.min(executed);
        &self.statements[self.statements.len() - count..]
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Build the statement list for `query` under `types`.
pub fn get_statements(query: &str, types: ExecutionTypes, separator: &str) -> StatementList {
    let mut statements = if types.contains(ExecutionTypes::NO_COMMANDS) {
        vec![query.to_string()]
    } else {
        split_batches(query, separator)
    };

    let mut to_reverse = 0;
    for (flag, option) in [
        (ExecutionTypes::QUOTED_IDENTIFIER_ON, "QUOTED_IDENTIFIER"),
        (ExecutionTypes::PARSE_ONLY, "PARSEONLY"),
        (ExecutionTypes::NO_EXEC, "NOEXEC"),
    ] {
        if types.contains(flag) {
            to_reverse += 1;
            statements.insert(0, format!("SET {} ON", option));
            statements.push(format!("SET {} OFF", option));
        }
    }

    StatementList {
        statements,
        to_reverse,
    }
}

/// Split `script` on `separator` lines. A batch followed by `GO n` is
/// emitted `n` times; empty batches are dropped.
pub fn split_batches(script: &str, separator: &str) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    let mut state = ScanState::Normal;

    for line in script.lines() {
        if state == ScanState::Normal {
            if let Some(count) = separator_count(line, separator) {
                push_batch(&mut batches, &current, count);
                current.clear();
                continue;
            }
        }

        state = scan_line(line, state);
        current.push_str(line);
        current.push('\n');
    }

    push_batch(&mut batches, &current, 1);
    batches
}

fn push_batch(batches: &mut Vec<String>, text: &str, count: u32) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    for _ in 0..count.max(1) {
        batches.push(text.to_string());
    }
}

/// Repeat count when `line` is a separator line.
fn separator_count(line: &str, separator: &str) -> Option<u32> {
    let trimmed = line.trim();
    let head = trimmed.get(..separator.len())?;
    if separator.is_empty() || !head.eq_ignore_ascii_case(separator) {
        return None;
    }

    let rest = &trimmed[separator.len()..];
    if rest.is_empty() || rest.starts_with("--") {
        return Some(1);
    }
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim_start();
    if rest.is_empty() || rest.starts_with("--") {
        return Some(1);
    }

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let count: u32 = rest[..digits_end].parse().ok()?;
    let tail = rest[digits_end..].trim_start();
    (tail.is_empty() || tail.starts_with("--")).then_some(count)
}

/// Advance the lexical state over one line.
fn scan_line(line: &str, mut state: ScanState) -> ScanState {
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        state = match state {
            ScanState::Normal => match c {
                '-' if chars.peek() == Some(&'-') => return ScanState::Normal,
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    ScanState::BlockComment(1)
                }
                '\'' | '"' => ScanState::Quoted(c),
                '[' => ScanState::Quoted(']'),
                _ => ScanState::Normal,
            },
            ScanState::BlockComment(depth) => match c {
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    ScanState::BlockComment(depth + 1)
                }
                '*' if chars.peek() == Some(&'/') => {
                    chars.next();
                    if depth == 1 {
                        ScanState::Normal
                    } else {
                        ScanState::BlockComment(depth - 1)
                    }
                }
                _ => state,
            },
            ScanState::Quoted(close) if c == close => {
                if chars.peek() == Some(&close) {
                    chars.next();
                    state
                } else {
                    ScanState::Normal
                }
            }
            ScanState::Quoted(_) => state,
        };
    }

    state
}
