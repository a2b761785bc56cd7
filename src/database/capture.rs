//! Statement notifications and the captured SQL buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Raised before a statement is sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementEvent {
    /// Statement text as written by the caller.
    pub sql: String,

    /// When the statement was dispatched.
    pub time: DateTime<Utc>,
}

impl StatementEvent {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            time: Utc::now(),
        }
    }
}

/// Callback invoked for every executed statement.
pub type StatementListener = Arc<dyn Fn(&StatementEvent) + Send + Sync>;

/// Registered statement listeners.
#[derive(Clone, Default)]
pub struct StatementListeners {
    listeners: Vec<(u64, StatementListener)>,
    next_id: u64,
}

impl StatementListeners {
    /// Register a listener, returning an id for [`StatementListeners::remove`].
    pub fn add(&mut self, listener: StatementListener) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn notify(&self, sql: &str) {
        if self.listeners.is_empty() {
            return;
        }
        let event = StatementEvent::new(sql);
        for (_, listener) in &self.listeners {
            listener(&event);
        }
    }
}

impl fmt::Debug for StatementListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementListeners")
            .field("count", &self.listeners.len())
            .finish()
    }
}

/// Statements recorded while capture mode is on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedSql {
    statements: Vec<String>,
}

impl CapturedSql {
    pub fn add(&mut self, statement: impl Into<String>) {
        self.statements.push(statement.into());
    }

    pub fn text(&self) -> &[String] {
        &self.statements
    }

    pub fn clear(&mut self) {
        self.statements.clear();
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
