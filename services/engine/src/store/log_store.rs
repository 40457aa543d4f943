//! Bounded in-memory store of user-facing log output.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tend_id::{ResourceName, SpanId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// One chunk of user-facing output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    /// `None` for engine-global output.
    pub resource: Option<ResourceName>,
    pub span_id: SpanId,
    pub level: LogLevel,
    pub text: String,
}

/// Ring buffer of log entries; the oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct LogStore {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    evicted: u64,
}

impl LogStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            evicted: 0,
        }
    }

    pub fn append(&mut self, entry: LogEntry) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(entry);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn entries_for<'a>(
        &'a self,
        resource: &'a ResourceName,
    ) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.resource.as_ref() == Some(resource))
    }

    /// All text logged for a resource, concatenated.
    pub fn text_for(&self, resource: &ResourceName) -> String {
        self.entries_for(resource).map(|e| e.text.as_str()).collect()
    }

    /// All text logged in a span, concatenated.
    pub fn text_for_span(&self, span_id: &SpanId) -> String {
        self.entries
            .iter()
            .filter(|e| &e.span_id == span_id)
            .map(|e| e.text.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries dropped to stay within the bound.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
