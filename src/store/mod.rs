//! Provider state storage.
//!
//! # Data Flow
//! ```text
//! circuit_breaker.rs
//!     → load(provider)            versioned ProviderRecord
//!     → compute next record + events in memory
//!     → commit(expected_version)  all-or-nothing:
//!           circuit row + health row + journal events
//!     → Conflict? reload and recompute
//! ```
//!
//! # Design Decisions
//! - Compare-and-swap on a per-row version; concurrent writers never
//!   overwrite each other's counters
//! - A failed commit records nothing
//! - The journal is append-only and only written through `commit`

pub mod journal;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::health::ProviderHealth;
use crate::resilience::state::ProviderCircuitState;

pub use journal::{CircuitEvent, CircuitEventType, Journal};
pub use memory::MemoryStore;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend cannot serve the request right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the breaker knows about one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub circuit: ProviderCircuitState,
    pub health: Option<ProviderHealth>,
}

/// A value tagged with the version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Result of a compare-and-swap commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Written; the row now carries `version`.
    Committed { version: u64 },
    /// Another writer got there first.
    Conflict,
}

/// Durable store for circuit rows, health rows and the journal.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    /// Read a provider's record, `None` when never seen.
    async fn load(&self, provider_id: &str) -> StoreResult<Option<Versioned<ProviderRecord>>>;

    /// Replace the record if its version still equals `expected_version`
    /// (`None` means the row must not exist yet) and append `events`.
    async fn commit(
        &self,
        expected_version: Option<u64>,
        record: ProviderRecord,
        events: Vec<CircuitEvent>,
    ) -> StoreResult<CommitOutcome>;

    /// Every known provider record.
    async fn list(&self) -> StoreResult<Vec<ProviderRecord>>;

    /// Latest `limit` journal events of a provider, oldest first.
    async fn events(&self, provider_id: &str, limit: usize) -> StoreResult<Vec<CircuitEvent>>;
}
