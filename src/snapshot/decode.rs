//! Binary decoder for the shared metrics region.
//!
//! Region layout (all fields little-endian, floats IEEE-754):
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ HEADER (24 bytes)                                        │
//! │   0  timestamp_ms: i64        (producer, Unix millis)    │
//! │   8  active_connections: u32                             │
//! │  12  queries_per_second: u32                             │
//! │  16  avg_query_time_ms: u32                              │
//! │  20  index_hit_rate: f32      (ratio, 0..=1)             │
//! ├──────────────────────────────────────────────────────────┤
//! │ BASE COUNTERS (40 bytes + 4-byte optional tail)          │
//! │  24  magic: u32               = 0x53594E44 ("SYND")      │
//! │  28  version: u32             = 1                        │
//! │  32  timestamp_ms: i64                                   │
//! │  40  active_connections: u32                             │
//! │  44  total_connections: u64                              │
//! │  52  queries_per_second: u32                             │
//! │  56  slow_queries: u32                                   │
//! │  60  memory_used_mb: u32                                 │
//! │  64  cache_hit_rate: f32      (optional, ratio 0..=1)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ EXTENSION (optional)                                     │
//! │  68  len: u32                                            │
//! │  72  UTF-8 JSON document, `len` bytes                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Bytes 0..64 are mandatory. Everything past offset 64 is read only if
//! present; a missing or damaged extension decodes as empty sections.

use std::fmt;

use chrono::{DateTime, Utc};

use super::extended;
use super::{BaseCounters, MetricsSnapshot};

/// `"SYND"` as written by the producer's 32-bit constant.
pub const MAGIC: u32 = 0x5359_4E44;
pub const SUPPORTED_VERSIONS: &[u32] = &[1];
/// Smallest region that carries a complete base section.
pub const MIN_REGION_SIZE: usize = 64;

const BASE_OFFSET: usize = 24;
const CACHE_HIT_RATE_OFFSET: usize = 64;
const EXTENSION_LEN_OFFSET: usize = 68;
const EXTENSION_OFFSET: usize = 72;

/// Reasons a region is rejected. Every variant is an invalid-format
/// rejection: no snapshot is produced and nothing is partially used.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    TooShort { len: usize, min: usize },
    BadMagic { found: u32 },
    UnsupportedVersion { found: u32 },
    GaugeOutOfRange { field: &'static str, value: f32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::TooShort { len, min } => {
                write!(f, "invalid format: region is {} bytes, need {}", len, min)
            }
            DecodeError::BadMagic { found } => write!(
                f,
                "invalid format: magic {:#010x}, expected {:#010x}",
                found, MAGIC
            ),
            DecodeError::UnsupportedVersion { found } => {
                write!(f, "invalid format: unsupported version {}", found)
            }
            DecodeError::GaugeOutOfRange { field, value } => {
                write!(f, "invalid format: {} = {} is outside 0..=1", field, value)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes one region image into a snapshot stamped with `captured_at`.
///
/// The buffer is only borrowed for the duration of the call; nothing in the
/// returned snapshot refers back to it.
pub fn decode(buf: &[u8], captured_at: DateTime<Utc>) -> Result<MetricsSnapshot, DecodeError> {
    if buf.len() < MIN_REGION_SIZE {
        return Err(DecodeError::TooShort {
            len: buf.len(),
            min: MIN_REGION_SIZE,
        });
    }

    // Nothing else is trusted until magic and version check out.
    let magic = read_u32(buf, BASE_OFFSET);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic { found: magic });
    }
    let version = read_u32(buf, BASE_OFFSET + 4);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(DecodeError::UnsupportedVersion { found: version });
    }

    let index_hit_rate = ratio("index_hit_rate", read_f32(buf, 20))?;
    let cache_hit_rate = if buf.len() >= CACHE_HIT_RATE_OFFSET + 4 {
        Some(ratio(
            "cache_hit_rate",
            read_f32(buf, CACHE_HIT_RATE_OFFSET),
        )?)
    } else {
        None
    };

    let base_counters = BaseCounters {
        magic,
        version,
        timestamp_ms: read_i64(buf, BASE_OFFSET + 8),
        active_connections: read_u32(buf, BASE_OFFSET + 16),
        total_connections: read_u64(buf, BASE_OFFSET + 20),
        queries_per_second: read_u32(buf, BASE_OFFSET + 28),
        slow_queries: read_u32(buf, BASE_OFFSET + 32),
        memory_used_mb: read_u32(buf, BASE_OFFSET + 36),
        cache_hit_rate,
    };

    let sections = extended::parse(extension_bytes(buf));

    Ok(MetricsSnapshot {
        captured_at,
        timestamp_ms: read_i64(buf, 0),
        active_connections: read_u32(buf, 8),
        queries_per_second: read_u32(buf, 12),
        avg_query_time_ms: read_u32(buf, 16),
        index_hit_rate,
        base_counters,
        scan_metrics: sections.scan_metrics,
        bundle_performance: sections.bundle_performance,
        query_frequency: sections.query_frequency,
        optimization_recommendations: sections.recommendations,
        memory_pressure: sections.memory_pressure.with_derived(),
    })
}

/// Slice holding the extension document, or empty when absent or truncated.
fn extension_bytes(buf: &[u8]) -> &[u8] {
    if buf.len() < EXTENSION_OFFSET {
        return &[];
    }
    let len = read_u32(buf, EXTENSION_LEN_OFFSET) as usize;
    match EXTENSION_OFFSET.checked_add(len) {
        Some(end) if end <= buf.len() => &buf[EXTENSION_OFFSET..end],
        _ => {
            tracing::debug!(
                declared = len,
                available = buf.len() - EXTENSION_OFFSET,
                "extension runs past region end, ignoring"
            );
            &[]
        }
    }
}

fn ratio(field: &'static str, value: f32) -> Result<f32, DecodeError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::GaugeOutOfRange { field, value })
    }
}

// Callers have checked `buf.len()` against the field end.

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(raw)
}

fn read_f32(buf: &[u8], at: usize) -> f32 {
    f32::from_bits(read_u32(buf, at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::mock::RegionImage;
    use crate::snapshot::Priority;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_500).unwrap()
    }

    #[test]
    fn test_minimal_region_decodes_header() {
        let mut buf = RegionImage::new().to_bytes();
        buf.truncate(64);
        buf[0..8].copy_from_slice(&1_700_000_000_000i64.to_le_bytes());
        buf[8..12].copy_from_slice(&42u32.to_le_bytes());

        let snap = decode(&buf, at()).unwrap();
        assert_eq!(snap.timestamp_ms, 1_700_000_000_000);
        assert_eq!(snap.active_connections, 42);
        assert_eq!(snap.captured_at, at());
        assert_eq!(snap.base_counters.cache_hit_rate, None);
        assert!(snap.bundle_performance.is_empty());
        assert!(snap.optimization_recommendations.is_empty());
    }

    #[test]
    fn test_short_buffer_is_invalid_format() {
        let buf = RegionImage::new().to_bytes();
        for len in [0, 1, 24, 63] {
            let err = decode(&buf[..len], at()).unwrap_err();
            assert_eq!(err, DecodeError::TooShort { len, min: 64 });
        }
    }

    #[test]
    fn test_bad_magic_rejected_regardless_of_content() {
        let mut buf = RegionImage::new()
            .active_connections(7)
            .cache_hit_rate(0.9)
            .to_bytes();
        buf[24..28].copy_from_slice(b"SYND");
        // Bytes "SYND" read little-endian are not the producer's constant.
        assert!(matches!(
            decode(&buf, at()),
            Err(DecodeError::BadMagic { .. })
        ));

        let zeroed = vec![0u8; 4096];
        assert_eq!(
            decode(&zeroed, at()),
            Err(DecodeError::BadMagic { found: 0 })
        );
    }

    #[test]
    fn test_unknown_version_rejected() {
        let buf = RegionImage::new().version(2).to_bytes();
        assert_eq!(
            decode(&buf, at()),
            Err(DecodeError::UnsupportedVersion { found: 2 })
        );
    }

    #[test]
    fn test_hit_rate_outside_ratio_rejected() {
        let buf = RegionImage::new().index_hit_rate(87.5).to_bytes();
        assert!(matches!(
            decode(&buf, at()),
            Err(DecodeError::GaugeOutOfRange {
                field: "index_hit_rate",
                ..
            })
        ));

        let buf = RegionImage::new().cache_hit_rate(f32::NAN).to_bytes();
        assert!(matches!(
            decode(&buf, at()),
            Err(DecodeError::GaugeOutOfRange {
                field: "cache_hit_rate",
                ..
            })
        ));
    }

    #[test]
    fn test_base_counters_decoded() {
        let buf = RegionImage::new()
            .base_timestamp_ms(1_700_000_000_123)
            .base_active_connections(12)
            .total_connections(9_000_000_000)
            .base_queries_per_second(350)
            .slow_queries(4)
            .memory_used_mb(2048)
            .cache_hit_rate(0.75)
            .to_bytes();

        let base = decode(&buf, at()).unwrap().base_counters;
        assert_eq!(base.magic, MAGIC);
        assert_eq!(base.version, 1);
        assert_eq!(base.timestamp_ms, 1_700_000_000_123);
        assert_eq!(base.active_connections, 12);
        assert_eq!(base.total_connections, 9_000_000_000);
        assert_eq!(base.queries_per_second, 350);
        assert_eq!(base.slow_queries, 4);
        assert_eq!(base.memory_used_mb, 2048);
        assert_eq!(base.cache_hit_rate, Some(0.75));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let buf = RegionImage::new()
            .timestamp_ms(1_700_000_000_000)
            .active_connections(3)
            .queries_per_second(1200)
            .avg_query_time_ms(8)
            .index_hit_rate(0.5)
            .extension(r#"{"bundle_performance":[{"bundle_name":"users","scan_count":10}]}"#)
            .to_bytes();

        let a = decode(&buf, at()).unwrap();
        let b = decode(&buf, at()).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_extension_sections_decoded() {
        let ext = r#"{
            "scan_metrics": {"total_scanners": 3, "total_scans": 900, "average_latency": 1500000,
                             "global_cache_hit_rate": 0.8, "global_hot_keys": ["id"]},
            "bundle_performance": [
                {"bundle_name": "orders", "average_latency": 2000000, "scan_count": 40,
                 "cache_hit_rate": 0.5, "error_rate": 0.01},
                {"bundle_name": "users", "scan_count": 2}
            ],
            "query_frequency": [{"bundle_name": "orders", "query_count": 77, "queries_per_hour": 12.5,
                                 "unique_hot_keys": 2}],
            "recommendations": [{"type": "index", "bundle_name": "orders", "priority": "high",
                                 "reason": "r", "estimated_gain": "2x"}],
            "memory_pressure": {"total_queries_checked": 10, "total_limit_exceeded": 1,
                                "total_projected_memory": 5000, "max_projected_memory": 900}
        }"#;
        let buf = RegionImage::new().extension(ext).to_bytes();
        let snap = decode(&buf, at()).unwrap();

        assert_eq!(snap.scan_metrics.total_scanners, 3);
        assert_eq!(snap.scan_metrics.average_latency_ns, 1_500_000);
        assert_eq!(snap.scan_metrics.hot_keys, vec!["id".to_string()]);
        let names: Vec<_> = snap
            .bundle_performance
            .iter()
            .map(|b| b.bundle_name.as_str())
            .collect();
        assert_eq!(names, ["orders", "users"]);
        assert_eq!(snap.query_frequency[0].query_count, 77);
        assert_eq!(snap.optimization_recommendations[0].priority, Priority::High);
        assert_eq!(snap.memory_pressure.average_projected_memory, 500);
    }

    #[test]
    fn test_truncated_extension_treated_as_empty() {
        let mut buf = RegionImage::new()
            .extension(r#"{"bundle_performance":[{"bundle_name":"orders"}]}"#)
            .to_bytes();
        buf.truncate(EXTENSION_OFFSET + 5);

        let snap = decode(&buf, at()).unwrap();
        assert!(snap.bundle_performance.is_empty());
        assert_eq!(snap.base_counters.cache_hit_rate, Some(1.0));
    }

    #[test]
    fn test_oversized_extension_length_treated_as_empty() {
        let mut buf = RegionImage::new().to_bytes();
        buf[EXTENSION_LEN_OFFSET..EXTENSION_LEN_OFFSET + 4]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        let snap = decode(&buf, at()).unwrap();
        assert!(snap.query_frequency.is_empty());
    }
}
