//! Snapshot structures published to subscribers.
//!
//! A `MetricsSnapshot` is produced once per poll cycle by the decoder and is
//! never mutated afterwards; the hub shares it behind an `Arc`.
//!
//! Hit rates are ratios in `[0, 1]` everywhere in this module.

pub mod decode;
pub mod extended;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use decode::{DecodeError, decode};
pub use extended::ExtendedSections;

/// One fully decoded and validated reading of the shared region.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MetricsSnapshot {
    /// When this sidecar decoded the region.
    pub captured_at: DateTime<Utc>,
    /// Producer timestamp (Unix milliseconds) from the region header.
    pub timestamp_ms: i64,
    pub active_connections: u32,
    pub queries_per_second: u32,
    pub avg_query_time_ms: u32,
    pub index_hit_rate: f32,
    pub base_counters: BaseCounters,
    pub scan_metrics: ScanMetrics,
    pub bundle_performance: Vec<BundlePerformance>,
    pub query_frequency: Vec<BundleQueryFrequency>,
    pub optimization_recommendations: Vec<OptimizationRecommendation>,
    pub memory_pressure: MemoryPressure,
}

/// Validated fixed-layout sub-record. `magic` and `version` have already
/// been checked by the decoder when this value exists.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct BaseCounters {
    pub magic: u32,
    pub version: u32,
    pub timestamp_ms: i64,
    pub active_connections: u32,
    pub total_connections: u64,
    pub queries_per_second: u32,
    pub slow_queries: u32,
    pub memory_used_mb: u32,
    /// Absent when the producer wrote only the 64-byte minimum.
    pub cache_hit_rate: Option<f32>,
}

/// Cross-scanner aggregates.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ScanMetrics {
    pub total_scanners: u64,
    pub total_scans: u64,
    /// Producer encodes durations as integer nanoseconds.
    #[serde(alias = "average_latency")]
    pub average_latency_ns: u64,
    #[serde(alias = "global_cache_hit_rate")]
    pub cache_hit_rate: f64,
    #[serde(alias = "global_hot_keys")]
    pub hot_keys: Vec<String>,
    pub hot_keys_by_bundle: std::collections::BTreeMap<String, Vec<String>>,
    #[serde(alias = "total_memory_pressure_gcs")]
    pub memory_pressure_gcs: u64,
    pub total_errors: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BundlePerformance {
    pub bundle_name: String,
    #[serde(alias = "average_latency")]
    pub average_latency_ns: u64,
    pub scan_count: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct BundleQueryFrequency {
    pub bundle_name: String,
    pub query_count: u64,
    pub queries_per_hour: f64,
    pub unique_hot_keys: u64,
}

/// Advisory produced by the database's query planner.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OptimizationRecommendation {
    /// "index", "cache", "partition", ...
    #[serde(alias = "type")]
    pub category: String,
    pub bundle_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_name: Option<String>,
    pub priority: Priority,
    pub reason: String,
    pub estimated_gain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
    #[serde(other)]
    Unknown,
}

/// Query memory-limit accounting.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(default)]
pub struct MemoryPressure {
    /// Queries that had memory tracking enabled.
    pub total_queries_checked: u64,
    pub total_limit_exceeded: u64,
    pub total_projected_memory: u64,
    pub max_projected_memory: u64,
    /// Derived: `total_projected_memory / total_queries_checked`.
    pub average_projected_memory: u64,
}

impl MemoryPressure {
    pub(crate) fn with_derived(mut self) -> Self {
        self.average_projected_memory = self
            .total_projected_memory
            .checked_div(self.total_queries_checked)
            .unwrap_or(0);
        self
    }
}
