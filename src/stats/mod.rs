//! Pattern Statistics Store
//!
//! Per-pattern counters read by the matcher and updated after every
//! resolution that used a pattern. Updates go through `record_outcome`,
//! which holds the pattern's entry lock for the whole read-modify-write
//! (including the write-through to persistence), so concurrent resolutions
//! never lose an update.

pub mod sqlite;

pub use sqlite::SqliteStatisticsPersistence;

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub total_matches: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cumulative_execution_ms: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl PatternStatistics {
    /// Resolutions that reached a verdict with this pattern.
    pub fn usage_count(&self) -> u64 {
        self.successful_executions + self.failed_executions
    }

    pub fn success_rate(&self) -> Option<f64> {
        let usage = self.usage_count();
        if usage == 0 {
            None
        } else {
            Some(self.successful_executions as f64 / usage as f64)
        }
    }

    fn with_outcome(&self, success: bool, elapsed: Duration) -> Self {
        let mut next = self.clone();
        next.total_matches += 1;
        if success {
            next.successful_executions += 1;
        } else {
            next.failed_executions += 1;
        }
        next.cumulative_execution_ms += elapsed.as_millis() as u64;
        next.last_used = Some(Utc::now());
        next
    }

    pub fn average_execution_ms(&self) -> Option<f64> {
        if self.total_matches == 0 {
            None
        } else {
            Some(self.cumulative_execution_ms as f64 / self.total_matches as f64)
        }
    }
}

/// Durable key-value store keyed by pattern identifier.
pub trait StatisticsPersistence: Send + Sync {
    fn load_all(&self) -> Result<HashMap<String, PatternStatistics>>;

    fn save(&self, pattern_id: &str, stats: &PatternStatistics) -> Result<()>;
}

/// Non-durable persistence for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemoryPersistence {
    data: Mutex<HashMap<String, PatternStatistics>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: HashMap<String, PatternStatistics>) -> Self {
        Self {
            data: Mutex::new(entries),
        }
    }
}

impl StatisticsPersistence for InMemoryPersistence {
    fn load_all(&self) -> Result<HashMap<String, PatternStatistics>> {
        let data = self
            .data
            .lock()
            .map_err(|_| EngineError::Storage("statistics lock poisoned".to_string()))?;
        Ok(data.clone())
    }

    fn save(&self, pattern_id: &str, stats: &PatternStatistics) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| EngineError::Storage("statistics lock poisoned".to_string()))?;
        data.insert(pattern_id.to_string(), stats.clone());
        Ok(())
    }
}

pub struct StatisticsStore {
    entries: DashMap<String, PatternStatistics>,
    persistence: Arc<dyn StatisticsPersistence>,
}

impl StatisticsStore {
    /// Open the store, reading every persisted counter.
    pub fn open(persistence: Arc<dyn StatisticsPersistence>) -> Result<Self> {
        let loaded = persistence.load_all()?;
        info!("Loaded statistics for {} patterns", loaded.len());
        let entries = DashMap::with_capacity(loaded.len());
        for (id, stats) in loaded {
            entries.insert(id, stats);
        }
        Ok(Self { entries, persistence })
    }

    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            persistence: Arc::new(InMemoryPersistence::new()),
        }
    }

    pub fn get(&self, pattern_id: &str) -> Option<PatternStatistics> {
        self.entries.get(pattern_id).map(|e| e.value().clone())
    }

    /// Copy of every counter, sorted by pattern id.
    pub fn snapshot(&self) -> Vec<(String, PatternStatistics)> {
        let mut all: Vec<(String, PatternStatistics)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Count one resolution that used `pattern_id` and write it through.
    /// The in-memory entry only changes once the write has succeeded.
    pub fn record_outcome(&self, pattern_id: &str, success: bool, elapsed: Duration) -> Result<PatternStatistics> {
        let updated = match self.entries.entry(pattern_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let updated = entry.get().with_outcome(success, elapsed);
                self.persistence.save(pattern_id, &updated)?;
                entry.insert(updated.clone());
                updated
            }
            Entry::Vacant(entry) => {
                let updated = PatternStatistics::default().with_outcome(success, elapsed);
                self.persistence.save(pattern_id, &updated)?;
                entry.insert(updated.clone());
                updated
            }
        };

        debug!(
            pattern = pattern_id,
            success,
            matches = updated.total_matches,
            "Recorded pattern outcome"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_requires_history() {
        let stats = PatternStatistics::default();
        assert_eq!(stats.success_rate(), None);
        let stats = PatternStatistics {
            total_matches: 4,
            successful_executions: 3,
            failed_executions: 1,
            ..Default::default()
        };
        assert_eq!(stats.success_rate(), Some(0.75));
    }

    #[test]
    fn test_record_outcome_writes_through() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let store = StatisticsStore::open(persistence.clone()).unwrap();

        store.record_outcome("active_loan_count", true, Duration::from_millis(12)).unwrap();
        store.record_outcome("active_loan_count", false, Duration::from_millis(8)).unwrap();

        let stats = store.get("active_loan_count").unwrap();
        assert_eq!(stats.total_matches, 2);
        assert_eq!(stats.successful_executions, 1);
        assert_eq!(stats.failed_executions, 1);
        assert_eq!(stats.cumulative_execution_ms, 20);

        let persisted = persistence.load_all().unwrap();
        assert_eq!(persisted.get("active_loan_count"), Some(&stats));
    }

    /// Persistence whose writes always fail.
    struct ReadOnlyPersistence;

    impl StatisticsPersistence for ReadOnlyPersistence {
        fn load_all(&self) -> Result<HashMap<String, PatternStatistics>> {
            let mut entries = HashMap::new();
            entries.insert(
                "active_loan_count".to_string(),
                PatternStatistics {
                    total_matches: 3,
                    successful_executions: 3,
                    ..Default::default()
                },
            );
            Ok(entries)
        }

        fn save(&self, _pattern_id: &str, _stats: &PatternStatistics) -> Result<()> {
            Err(EngineError::Storage("database is read-only".to_string()))
        }
    }

    #[test]
    fn test_failed_save_leaves_counters_untouched() {
        let store = StatisticsStore::open(Arc::new(ReadOnlyPersistence)).unwrap();

        assert!(store.record_outcome("active_loan_count", false, Duration::from_millis(4)).is_err());
        let stats = store.get("active_loan_count").unwrap();
        assert_eq!(stats.total_matches, 3);
        assert_eq!(stats.failed_executions, 0);

        assert!(store.record_outcome("top_loans_by_balance", true, Duration::from_millis(4)).is_err());
        assert!(store.get("top_loans_by_balance").is_none());
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store = Arc::new(StatisticsStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        store
                            .record_outcome("shared", i % 2 == 0, Duration::from_millis(1))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = store.get("shared").unwrap();
        assert_eq!(stats.total_matches, 2000);
        assert_eq!(stats.successful_executions, 1000);
        assert_eq!(stats.failed_executions, 1000);
        assert_eq!(stats.cumulative_execution_ms, 2000);
    }

    #[test]
    fn test_open_restores_persisted_counters() {
        let mut seeded = HashMap::new();
        seeded.insert(
            "top_balances".to_string(),
            PatternStatistics {
                total_matches: 10,
                successful_executions: 9,
                failed_executions: 1,
                cumulative_execution_ms: 120,
                last_used: None,
            },
        );
        let store = StatisticsStore::open(Arc::new(InMemoryPersistence::with_entries(seeded))).unwrap();
        assert_eq!(store.get("top_balances").unwrap().successful_executions, 9);
        assert_eq!(store.snapshot().len(), 1);
    }
}
