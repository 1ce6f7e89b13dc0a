//! Metrics sink - append-only per-tick records from every agent
//!
//! The core only appends. Plotting, persistence and any other retrieval
//! format belong to the embedding driver; `InMemoryMetrics` keeps records in
//! memory and can summarize a run.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::contracts::{ErrorCounters, VehicleId};

/// One agent tick as seen by observers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsRecord {
    pub vehicle_id: VehicleId,

    /// Tick counter of the recording agent, starting at 1
    pub tick: u64,

    /// Milliseconds since the run started
    pub timestamp_ms: u64,

    pub speed: f64,

    pub position: f64,

    pub cwnd: u32,

    /// Cumulative error counts of the vehicle at this tick
    pub errors: ErrorCounters,
}

/// Append-only consumer of metrics records
pub trait MetricsSink: Send + Sync {
    fn record(&self, record: MetricsRecord);
}

/// Aggregates over a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub records: usize,

    /// Mean speed across all records
    pub average_speed: f64,

    /// Sum of each vehicle's last recorded position
    pub total_distance: f64,

    /// Last recorded error counters per vehicle
    pub errors: BTreeMap<VehicleId, ErrorCounters>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    records: Mutex<Vec<MetricsRecord>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricsRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, vehicle_id: VehicleId) -> Vec<MetricsRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.vehicle_id == vehicle_id)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> MetricsSummary {
        let records = self.records.lock();

        let average_speed = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|record| record.speed).sum::<f64>() / records.len() as f64
        };

        let mut last: BTreeMap<VehicleId, &MetricsRecord> = BTreeMap::new();
        for record in records.iter() {
            last.insert(record.vehicle_id, record);
        }

        MetricsSummary {
            records: records.len(),
            average_speed,
            total_distance: last.values().map(|record| record.position).sum(),
            errors: last
                .iter()
                .map(|(id, record)| (*id, record.errors))
                .collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record(&self, record: MetricsRecord) {
        self.records.lock().push(record);
    }
}
