//! In-memory provider store with JSON snapshot persistence.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::StoreConfig;
use crate::store::journal::{CircuitEvent, Journal};
use crate::store::{CommitOutcome, ProviderRecord, ProviderStore, StoreResult, Versioned};

/// Concurrent map of provider rows.
///
/// Each commit runs under the row's shard lock, so the version check, the
/// journal append and the row write happen as one step.
pub struct MemoryStore {
    rows: DashMap<String, Versioned<ProviderRecord>>,
    journal: Journal,
    persistence_path: Option<PathBuf>,
}

impl MemoryStore {
    /// Empty store with a memory-only journal.
    pub fn new(journal_retain: usize) -> Self {
        Self {
            rows: DashMap::new(),
            journal: Journal::new(journal_retain),
            persistence_path: None,
        }
    }

    /// Build the store described by `[store]`, reloading any snapshot.
    pub fn from_config(config: &StoreConfig) -> std::io::Result<Self> {
        let journal = match &config.journal_path {
            Some(path) => Journal::with_file(config.journal_retain, Path::new(path))?,
            None => Journal::new(config.journal_retain),
        };
        let mut store = Self {
            rows: DashMap::new(),
            journal,
            persistence_path: config.persistence_path.as_ref().map(PathBuf::from),
        };
        if let Some(path) = store.persistence_path.clone() {
            store.load_snapshot(&path)?;
        }
        Ok(store)
    }

    fn load_snapshot(&mut self, path: &Path) -> std::io::Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(File::open(path)?);
        let map: HashMap<String, Versioned<ProviderRecord>> = serde_json::from_reader(reader)?;
        for (k, v) in map {
            self.rows.insert(k, v);
        }
        tracing::info!(providers = self.rows.len(), path = ?path, "Loaded provider snapshot");
        Ok(())
    }

    /// Write every row to the configured snapshot path, if any.
    pub fn save_snapshot(&self) -> std::io::Result<()> {
        if let Some(path) = &self.persistence_path {
            let writer = BufWriter::new(File::create(path)?);
            let map: HashMap<_, _> = self
                .rows
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect();
            serde_json::to_writer(writer, &map)?;
            tracing::info!(providers = map.len(), path = ?path, "Saved provider snapshot");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl ProviderStore for MemoryStore {
    async fn load(&self, provider_id: &str) -> StoreResult<Option<Versioned<ProviderRecord>>> {
        Ok(self.rows.get(provider_id).map(|r| r.value().clone()))
    }

    async fn commit(
        &self,
        expected_version: Option<u64>,
        record: ProviderRecord,
        events: Vec<CircuitEvent>,
    ) -> StoreResult<CommitOutcome> {
        match self.rows.entry(record.circuit.provider_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().version;
                if expected_version != Some(current) {
                    return Ok(CommitOutcome::Conflict);
                }
                self.journal.append(&events)?;
                let version = current + 1;
                occupied.insert(Versioned { version, value: record });
                Ok(CommitOutcome::Committed { version })
            }
            Entry::Vacant(vacant) => {
                if expected_version.is_some() {
                    return Ok(CommitOutcome::Conflict);
                }
                self.journal.append(&events)?;
                vacant.insert(Versioned { version: 1, value: record });
                Ok(CommitOutcome::Committed { version: 1 })
            }
        }
    }

    async fn list(&self) -> StoreResult<Vec<ProviderRecord>> {
        let mut records: Vec<_> = self.rows.iter().map(|r| r.value().value.clone()).collect();
        records.sort_by(|a, b| a.circuit.provider_id.cmp(&b.circuit.provider_id));
        Ok(records)
    }

    async fn events(&self, provider_id: &str, limit: usize) -> StoreResult<Vec<CircuitEvent>> {
        Ok(self.journal.recent(provider_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::resilience::state::{CircuitState, ProviderCircuitState};
    use crate::store::journal::CircuitEventType;
    use chrono::Utc;

    fn record(provider: &str) -> ProviderRecord {
        ProviderRecord {
            circuit: ProviderCircuitState::new(provider, &BreakerConfig::default(), Utc::now()),
            health: None,
        }
    }

    fn event(provider: &str) -> CircuitEvent {
        CircuitEvent::new(
            provider,
            CircuitEventType::CallFailure,
            CircuitState::Closed,
            CircuitState::Closed,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_then_versioned_update() {
        let store = MemoryStore::new(10);
        let outcome = store.commit(None, record("hibp"), vec![event("hibp")]).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 1 });

        let loaded = store.load("hibp").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);

        let mut next = loaded.value.clone();
        next.circuit.failure_count = 1;
        let outcome = store.commit(Some(1), next, vec![]).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { version: 2 });
        assert_eq!(store.load("hibp").await.unwrap().unwrap().value.circuit.failure_count, 1);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_and_records_nothing() {
        let store = MemoryStore::new(10);
        store.commit(None, record("hibp"), vec![]).await.unwrap();
        store.commit(Some(1), record("hibp"), vec![]).await.unwrap();

        let outcome = store.commit(Some(1), record("hibp"), vec![event("hibp")]).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
        assert!(store.events("hibp", 10).await.unwrap().is_empty());

        let outcome = store.commit(None, record("hibp"), vec![]).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            persistence_path: Some(dir.path().join("snapshot.json").to_string_lossy().into_owned()),
            journal_path: None,
            journal_retain: 10,
        };

        let store = MemoryStore::from_config(&config).unwrap();
        let mut rec = record("shodan");
        rec.circuit.total_trips = 3;
        store.commit(None, rec, vec![]).await.unwrap();
        store.save_snapshot().unwrap();

        let reloaded = MemoryStore::from_config(&config).unwrap();
        let row = reloaded.load("shodan").await.unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.value.circuit.total_trips, 3);
    }
}
