//! Tolerant parsing of the optional extension document.
//!
//! The producer writes scanner and bundle aggregates as a JSON object after
//! the fixed base section. Any problem here degrades to empty sections; it
//! never fails the decode.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use super::{
    BundlePerformance, BundleQueryFrequency, MemoryPressure, OptimizationRecommendation,
    ScanMetrics,
};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtendedSections {
    pub scan_metrics: ScanMetrics,
    pub bundle_performance: Vec<BundlePerformance>,
    pub query_frequency: Vec<BundleQueryFrequency>,
    pub recommendations: Vec<OptimizationRecommendation>,
    pub memory_pressure: MemoryPressure,
}

/// Parses the extension document. Each section is taken independently, so
/// one malformed section does not discard the others.
pub fn parse(bytes: &[u8]) -> ExtendedSections {
    // Producers may zero-pad the document inside the region page.
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    let bytes = &bytes[..end];
    if bytes.is_empty() {
        return ExtendedSections::default();
    }

    let mut doc = match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            debug!(kind = json_kind(&other), "extension is not a JSON object, ignoring");
            return ExtendedSections::default();
        }
        Err(e) => {
            debug!(error = %e, "extension is not valid JSON, ignoring");
            return ExtendedSections::default();
        }
    };

    ExtendedSections {
        scan_metrics: section(&mut doc, "scan_metrics"),
        bundle_performance: section(&mut doc, "bundle_performance"),
        query_frequency: section(&mut doc, "query_frequency"),
        recommendations: section(&mut doc, "recommendations"),
        memory_pressure: section(&mut doc, "memory_pressure"),
    }
}

fn section<T: DeserializeOwned + Default>(doc: &mut Map<String, Value>, key: &str) -> T {
    let Some(value) = doc.remove(key) else {
        return T::default();
    };
    if value.is_null() {
        return T::default();
    }
    serde_json::from_value(value).unwrap_or_else(|e| {
        debug!(section = key, error = %e, "malformed extension section, treating as empty");
        T::default()
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
