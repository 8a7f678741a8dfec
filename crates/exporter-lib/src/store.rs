//! Concurrent process record store
//!
//! PID-keyed map of `ProcessRecord`s. The collection engine is the only
//! writer; readers take a deep-copied snapshot under the read lock and
//! never iterate live state.

use crate::models::ProcessRecord;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct MetricStore {
    records: RwLock<HashMap<u32, ProcessRecord>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a record observed this cycle. A prior record
    /// keeps its cumulative energy counter and its Estimated latch;
    /// everything observable is replaced by the incoming values.
    pub fn upsert(&self, incoming: ProcessRecord) {
        let mut records = self.records.write().unwrap();
        match records.get_mut(&incoming.pid) {
            Some(existing) => {
                let cumulative = existing.cumulative_energy_joules;
                let source = existing.energy_source;
                *existing = incoming;
                existing.cumulative_energy_joules = cumulative;
                existing.energy_source = source;
            }
            None => {
                records.insert(incoming.pid, incoming);
            }
        }
    }

    pub fn get(&self, pid: u32) -> Option<ProcessRecord> {
        self.records.read().unwrap().get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.records.read().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent deep copy of every record.
    pub fn snapshot(&self) -> HashMap<u32, ProcessRecord> {
        self.records.read().unwrap().clone()
    }

    /// Run a multi-record mutation (exit marking, eviction, energy
    /// attribution) under a single write-lock acquisition.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut HashMap<u32, ProcessRecord>) -> R) -> R {
        f(&mut self.records.write().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnergySource;

    fn record(pid: u32) -> ProcessRecord {
        ProcessRecord {
            pid,
            gpu_index: 0,
            process_name: "python".to_string(),
            is_running: true,
            start_time: 1_700_000_000,
            end_time: None,
            sm_util: 0.5,
            mem_util: 0.2,
            memory_used_bytes: 1024,
            cumulative_energy_joules: 0.0,
            telemetry_energy_joules: 0.0,
            energy_source: EnergySource::Measured,
            container_id: "c1".to_string(),
            pod_name: "trainer".to_string(),
            pod_namespace: "default".to_string(),
            container_name: "train".to_string(),
        }
    }

    #[test]
    fn test_upsert_preserves_cumulative_energy_and_latch() {
        let store = MetricStore::new();

        let mut first = record(100);
        first.cumulative_energy_joules = 150.0;
        first.energy_source = EnergySource::Estimated;
        store.upsert(first);

        let mut second = record(100);
        second.telemetry_energy_joules = 2071.0;
        second.sm_util = 0.9;
        store.upsert(second);

        let merged = store.get(100).unwrap();
        assert_eq!(merged.cumulative_energy_joules, 150.0);
        assert_eq!(merged.energy_source, EnergySource::Estimated);
        assert_eq!(merged.sm_util, 0.9);
        assert_eq!(merged.telemetry_energy_joules, 2071.0);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let store = MetricStore::new();
        store.upsert(record(100));

        let mut snapshot = store.snapshot();
        snapshot.get_mut(&100).unwrap().cumulative_energy_joules = 999.0;

        assert_eq!(store.get(100).unwrap().cumulative_energy_joules, 0.0);
    }

    #[test]
    fn test_with_write_scopes_mutation() {
        let store = MetricStore::new();
        store.upsert(record(100));
        store.upsert(record(200));

        store.with_write(|records| {
            records.remove(&100);
        });

        assert_eq!(store.len(), 1);
        assert!(store.get(200).is_some());
    }
}
