//! In-memory region source and region image builder for tests.
//!
//! `MockRegion` replays a scripted sequence of acquisition results and counts
//! acquisitions and releases, so tests can check the scoped-release
//! discipline without touching the filesystem.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{AcquisitionError, RegionSource};
use crate::snapshot::decode::{MAGIC, MIN_REGION_SIZE};

type Step = Result<Vec<u8>, AcquisitionError>;

#[derive(Debug, Default)]
pub struct MockRegion {
    script: Mutex<VecDeque<Step>>,
    /// Returned once the script is exhausted. `None` means "not found".
    steady: Mutex<Option<Vec<u8>>>,
    acquisitions: AtomicUsize,
    releases: AtomicUsize,
}

impl MockRegion {
    pub fn new() -> Self {
        Self::default()
    }

    /// A region that always yields `image`.
    pub fn steady(image: Vec<u8>) -> Self {
        let region = Self::new();
        region.set_steady(Some(image));
        region
    }

    pub fn push_image(&self, image: Vec<u8>) {
        lock(&self.script).push_back(Ok(image));
    }

    pub fn push_failure(&self, err: AcquisitionError) {
        lock(&self.script).push_back(Err(err));
    }

    /// Queues `n` "not found" acquisitions.
    pub fn push_missing(&self, n: usize) {
        for _ in 0..n {
            self.push_failure(AcquisitionError::NotFound(PathBuf::from("/mock/region")));
        }
    }

    pub fn set_steady(&self, image: Option<Vec<u8>>) {
        *lock(&self.steady) = image;
    }

    /// Number of acquisition attempts, successful or not.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Number of views released after a successful acquisition.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        if let Some(step) = lock(&self.script).pop_front() {
            return step;
        }
        lock(&self.steady)
            .clone()
            .ok_or_else(|| AcquisitionError::NotFound(PathBuf::from("/mock/region")))
    }
}

impl RegionSource for MockRegion {
    fn with_region<R, F>(&self, f: F) -> Result<R, AcquisitionError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let bytes = self.next_step()?;
        let _release = ReleaseGuard(&self.releases);
        Ok(f(&bytes))
    }
}

struct ReleaseGuard<'a>(&'a AtomicUsize);

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builds region bytes in the producer's layout.
///
/// Defaults to a valid image: correct magic, version 1, both hit rates 1.0,
/// all counters zero and an empty extension.
#[derive(Debug, Clone)]
pub struct RegionImage {
    timestamp_ms: i64,
    active_connections: u32,
    queries_per_second: u32,
    avg_query_time_ms: u32,
    index_hit_rate: f32,
    magic: u32,
    version: u32,
    base_timestamp_ms: i64,
    base_active_connections: u32,
    total_connections: u64,
    base_queries_per_second: u32,
    slow_queries: u32,
    memory_used_mb: u32,
    cache_hit_rate: f32,
    extension: Vec<u8>,
}

impl Default for RegionImage {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionImage {
    pub fn new() -> Self {
        Self {
            timestamp_ms: 0,
            active_connections: 0,
            queries_per_second: 0,
            avg_query_time_ms: 0,
            index_hit_rate: 1.0,
            magic: MAGIC,
            version: 1,
            base_timestamp_ms: 0,
            base_active_connections: 0,
            total_connections: 0,
            base_queries_per_second: 0,
            slow_queries: 0,
            memory_used_mb: 0,
            cache_hit_rate: 1.0,
            extension: Vec::new(),
        }
    }

    pub fn timestamp_ms(mut self, v: i64) -> Self {
        self.timestamp_ms = v;
        self
    }

    pub fn active_connections(mut self, v: u32) -> Self {
        self.active_connections = v;
        self
    }

    pub fn queries_per_second(mut self, v: u32) -> Self {
        self.queries_per_second = v;
        self
    }

    pub fn avg_query_time_ms(mut self, v: u32) -> Self {
        self.avg_query_time_ms = v;
        self
    }

    pub fn index_hit_rate(mut self, v: f32) -> Self {
        self.index_hit_rate = v;
        self
    }

    pub fn magic(mut self, v: u32) -> Self {
        self.magic = v;
        self
    }

    pub fn version(mut self, v: u32) -> Self {
        self.version = v;
        self
    }

    pub fn base_timestamp_ms(mut self, v: i64) -> Self {
        self.base_timestamp_ms = v;
        self
    }

    pub fn base_active_connections(mut self, v: u32) -> Self {
        self.base_active_connections = v;
        self
    }

    pub fn total_connections(mut self, v: u64) -> Self {
        self.total_connections = v;
        self
    }

    pub fn base_queries_per_second(mut self, v: u32) -> Self {
        self.base_queries_per_second = v;
        self
    }

    pub fn slow_queries(mut self, v: u32) -> Self {
        self.slow_queries = v;
        self
    }

    pub fn memory_used_mb(mut self, v: u32) -> Self {
        self.memory_used_mb = v;
        self
    }

    pub fn cache_hit_rate(mut self, v: f32) -> Self {
        self.cache_hit_rate = v;
        self
    }

    /// Sets the extension document (normally JSON).
    pub fn extension(mut self, doc: impl AsRef<[u8]>) -> Self {
        self.extension = doc.as_ref().to_vec();
        self
    }

    /// Serialises the full image: 68-byte base, extension length and document.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_REGION_SIZE + 8 + self.extension.len());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&self.active_connections.to_le_bytes());
        buf.extend_from_slice(&self.queries_per_second.to_le_bytes());
        buf.extend_from_slice(&self.avg_query_time_ms.to_le_bytes());
        buf.extend_from_slice(&self.index_hit_rate.to_le_bytes());
        buf.extend_from_slice(&self.magic.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.base_timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&self.base_active_connections.to_le_bytes());
        buf.extend_from_slice(&self.total_connections.to_le_bytes());
        buf.extend_from_slice(&self.base_queries_per_second.to_le_bytes());
        buf.extend_from_slice(&self.slow_queries.to_le_bytes());
        buf.extend_from_slice(&self.memory_used_mb.to_le_bytes());
        buf.extend_from_slice(&self.cache_hit_rate.to_le_bytes());
        buf.extend_from_slice(&(self.extension.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.extension);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_layout_offsets() {
        let bytes = RegionImage::new()
            .active_connections(42)
            .memory_used_mb(512)
            .to_bytes();
        assert_eq!(bytes.len(), 72);
        assert_eq!(&bytes[8..12], &42u32.to_le_bytes());
        assert_eq!(&bytes[24..28], &MAGIC.to_le_bytes());
        assert_eq!(&bytes[60..64], &512u32.to_le_bytes());
    }

    #[test]
    fn test_script_then_steady() {
        let region = MockRegion::new();
        region.push_missing(2);
        region.push_image(vec![1, 2, 3]);
        region.set_steady(Some(vec![9]));

        assert!(region.with_region(|b| b.len()).is_err());
        assert!(region.with_region(|b| b.len()).is_err());
        assert_eq!(region.with_region(|b| b.to_vec()).unwrap(), vec![1, 2, 3]);
        assert_eq!(region.with_region(|b| b.to_vec()).unwrap(), vec![9]);
        assert_eq!(region.acquisitions(), 4);
        assert_eq!(region.releases(), 2);
    }

    #[test]
    fn test_release_counted_when_closure_panics() {
        let region = MockRegion::steady(vec![0; 4]);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            region.with_region(|_| panic!("decoder bug"))
        }));
        assert!(result.is_err());
        assert_eq!(region.releases(), 1);
    }
}
