//! Append-only circuit event journal.
//!
//! Every decision the breaker takes is written here once. The journal is
//! read by audit and dashboard consumers; nothing in the decision path reads
//! it back.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resilience::state::CircuitState;
use crate::store::StoreError;

/// Kind of journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitEventType {
    CallSuccess,
    CallFailure,
    CallBlocked,
    Trip,
    Reset,
    HalfOpen,
}

/// One immutable journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitEvent {
    pub id: Uuid,
    pub provider_id: String,
    pub event_type: CircuitEventType,
    pub previous_state: CircuitState,
    pub new_state: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub manual: bool,
    pub timestamp: DateTime<Utc>,
}

impl CircuitEvent {
    pub fn new(
        provider_id: &str,
        event_type: CircuitEventType,
        previous_state: CircuitState,
        new_state: CircuitState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id: provider_id.to_string(),
            event_type,
            previous_state,
            new_state,
            success_count: None,
            failure_count: None,
            error_message: None,
            manual: false,
            timestamp,
        }
    }

    pub fn with_success_count(mut self, count: u32) -> Self {
        self.success_count = Some(count);
        self
    }

    pub fn with_failure_count(mut self, count: u32) -> Self {
        self.failure_count = Some(count);
        self
    }

    pub fn with_error(mut self, message: Option<String>) -> Self {
        self.error_message = message;
        self
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

/// JSON-lines mirror of the journal.
struct JournalFile {
    writer: Mutex<BufWriter<File>>,
}

impl JournalFile {
    fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn append(&self, events: &[CircuitEvent]) -> Result<(), StoreError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| StoreError::Unavailable("journal writer poisoned".into()))?;
        for event in events {
            serde_json::to_writer(&mut *writer, event)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// In-memory journal with an optional file mirror.
pub struct Journal {
    entries: DashMap<String, VecDeque<CircuitEvent>>,
    retain: usize,
    file: Option<JournalFile>,
}

impl Journal {
    /// Memory-only journal keeping `retain` events per provider.
    pub fn new(retain: usize) -> Self {
        Self {
            entries: DashMap::new(),
            retain: retain.max(1),
            file: None,
        }
    }

    /// Journal mirrored to `path` (appended, never truncated).
    pub fn with_file(retain: usize, path: &Path) -> std::io::Result<Self> {
        let mut journal = Self::new(retain);
        journal.file = Some(JournalFile::open(path)?);
        tracing::info!(path = ?path, "Journal mirrored to file");
        Ok(journal)
    }

    /// Append events. The file write happens first, so a failed write
    /// leaves the in-memory journal untouched.
    pub fn append(&self, events: &[CircuitEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        if let Some(file) = &self.file {
            file.append(events)?;
        }
        for event in events {
            let mut timeline = self.entries.entry(event.provider_id.clone()).or_default();
            timeline.push_back(event.clone());
            while timeline.len() > self.retain {
                timeline.pop_front();
            }
        }
        Ok(())
    }

    /// Latest `limit` events of a provider, oldest first.
    pub fn recent(&self, provider_id: &str, limit: usize) -> Vec<CircuitEvent> {
        self.entries
            .get(provider_id)
            .map(|timeline| {
                let skip = timeline.len().saturating_sub(limit);
                timeline.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}
