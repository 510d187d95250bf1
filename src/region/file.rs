//! Region file read by bounded copy.
//!
//! The producer may truncate or recreate the file at any time, so the bytes
//! are copied out with ordinary reads instead of being mapped. A short or
//! torn copy only fails validation in the decoder.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use super::{AcquisitionError, RegionSource};

/// Reads the producer's region file, once per acquisition.
#[derive(Debug, Clone)]
pub struct FileRegion {
    path: PathBuf,
    max_len: usize,
}

impl FileRegion {
    /// # Arguments
    /// * `path` - Region file written by the database
    /// * `max_len` - Maximum number of bytes copied; shorter files are read whole
    pub fn new(path: impl Into<PathBuf>, max_len: usize) -> Self {
        Self {
            path: path.into(),
            max_len,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegionSource for FileRegion {
    fn with_region<R, F>(&self, f: F) -> Result<R, AcquisitionError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let file =
            File::open(&self.path).map_err(|e| AcquisitionError::from_io(&self.path, e))?;
        let mut buf = Vec::with_capacity(self.max_len);
        file.take(self.max_len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| AcquisitionError::from_io(&self.path, e))?;
        if buf.is_empty() {
            return Err(AcquisitionError::Empty(self.path.clone()));
        }
        Ok(f(&buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::mock::RegionImage;
    use crate::snapshot::{DecodeError, decode};
    use chrono::Utc;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let region = FileRegion::new(dir.path().join("absent.mmap"), 4096);
        let err = region.with_region(|b| b.len()).unwrap_err();
        assert!(matches!(err, AcquisitionError::NotFound(_)));
    }

    #[test]
    fn test_empty_file_is_unavailable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let region = FileRegion::new(file.path(), 4096);
        assert_eq!(
            region.with_region(|b| b.len()),
            Err(AcquisitionError::Empty(file.path().to_path_buf()))
        );
    }

    #[test]
    fn test_reads_at_most_max_len() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 8192]).unwrap();
        file.flush().unwrap();

        let region = FileRegion::new(file.path(), 4096);
        assert_eq!(region.with_region(|b| b.len()).unwrap(), 4096);

        let region = FileRegion::new(file.path(), 100_000);
        assert_eq!(region.with_region(|b| b.len()).unwrap(), 8192);
    }

    #[test]
    fn test_reads_producer_image() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let image = RegionImage::new().active_connections(42).to_bytes();
        file.write_all(&image).unwrap();
        file.write_all(&vec![0u8; 4096 - image.len()]).unwrap();
        file.flush().unwrap();

        let region = FileRegion::new(file.path(), 4096);
        let first_bytes = region.with_region(|b| b[..image.len()].to_vec()).unwrap();
        assert_eq!(first_bytes, image);
    }

    #[test]
    fn test_truncated_file_is_rejected_not_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&RegionImage::new().to_bytes()[..40]).unwrap();
        file.flush().unwrap();

        let region = FileRegion::new(file.path(), 4096);
        let result = region.with_region(|b| decode(b, Utc::now())).unwrap();
        assert_eq!(result.unwrap_err(), DecodeError::TooShort { len: 40, min: 64 });
    }

    #[test]
    fn test_survives_producer_rewriting_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.mmap");
        let image = RegionImage::new().active_connections(9).to_bytes();
        std::fs::write(&path, &image).unwrap();

        // std::fs::write truncates before writing, so readers regularly see
        // an empty or partial file.
        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let stop = stop.clone();
            let path = path.clone();
            let image = image.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::fs::write(&path, &image).unwrap();
                }
            })
        };

        let region = FileRegion::new(&path, 4096);
        let mut decoded = 0;
        for _ in 0..20_000 {
            match region.with_region(|b| decode(b, Utc::now())) {
                Ok(Ok(snapshot)) => {
                    assert_eq!(snapshot.active_connections, 9);
                    decoded += 1;
                }
                Ok(Err(_)) | Err(_) => {}
            }
        }
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
        assert!(decoded > 0);
    }
}
