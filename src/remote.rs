//! Random access over an object in a store.
//!
//! The ZIP central directory lives at the end of the archive and is read
//! many times while entries are enumerated, so the last `local_size_limit`
//! bytes are downloaded once to a temporary file. Reads that start inside
//! that tail are served from disk; everything else is a ranged GET.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::io::{LocalFileReader, ReadAt};
use crate::retry::RetryPolicy;
use crate::store::{ObjectLocation, ObjectStore, collect_bytes};

/// How the reader caches the archive tail.
#[derive(Debug, Clone)]
pub struct RemoteReaderOptions {
    pub local_size_limit: u64,
    pub temp_dir: Option<PathBuf>,
    pub retry: RetryPolicy,
}

/// The locally cached tail; dropping it removes the temp file.
struct CachedTail {
    reader: LocalFileReader,
    _path: TempPath,
}

/// Byte counters for one reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    /// Bytes downloaded to build the tail cache.
    pub tail_bytes: u64,
    /// Bytes fetched by ranged reads outside the tail.
    pub network_bytes: u64,
    /// Bytes served from the tail cache.
    pub cached_bytes: u64,
}

pub struct RemoteArchiveReader<S: ObjectStore> {
    store: Arc<S>,
    location: ObjectLocation,
    total_size: u64,
    local_cache_offset: u64,
    retry: RetryPolicy,
    tail: RwLock<Option<CachedTail>>,
    closed: AtomicBool,
    tail_bytes: AtomicU64,
    network_bytes: AtomicU64,
    cached_bytes: AtomicU64,
}

impl<S: ObjectStore> RemoteArchiveReader<S> {
    /// Probe the object's size, then cache its tail.
    pub async fn open(
        store: Arc<S>,
        location: ObjectLocation,
        options: RemoteReaderOptions,
    ) -> Result<Self> {
        let meta = options
            .retry
            .run("head object", |_| store.head_object(&location))
            .await?;
        let total_size = meta.content_length.unwrap_or(0);
        Self::open_with_size(store, location, total_size, options).await
    }

    /// Cache the tail of an object whose size is already known.
    pub async fn open_with_size(
        store: Arc<S>,
        location: ObjectLocation,
        total_size: u64,
        options: RemoteReaderOptions,
    ) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::SizeUnavailable {
                key: location.key.clone(),
            });
        }
        let local_cache_offset = total_size.saturating_sub(options.local_size_limit);

        let reader = Self {
            store,
            location,
            total_size,
            local_cache_offset,
            retry: options.retry,
            tail: RwLock::new(None),
            closed: AtomicBool::new(false),
            tail_bytes: AtomicU64::new(0),
            network_bytes: AtomicU64::new(0),
            cached_bytes: AtomicU64::new(0),
        };
        if local_cache_offset < total_size {
            let tail = reader
                .retry
                .run("download archive tail", |attempt| {
                    reader.download_tail(attempt, options.temp_dir.as_deref())
                })
                .await?;
            *reader.tail.write().unwrap_or_else(|e| e.into_inner()) = Some(tail);
        }
        info!(
            key = %reader.location.key,
            total_size,
            local_cache_offset,
            "opened remote archive"
        );
        Ok(reader)
    }

    async fn download_tail(
        &self,
        attempt: u32,
        temp_dir: Option<&std::path::Path>,
    ) -> Result<CachedTail> {
        let range = self.local_cache_offset..self.total_size;
        debug!(key = %self.location.key, ?range, attempt, "downloading archive tail");

        let mut builder = tempfile::Builder::new();
        builder.prefix("remote-unzip-tail-");
        let temp = match temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let (file, path) = temp.into_parts();

        let mut body = self.store.get_object_range(&self.location, range.clone()).await?;
        let mut out = tokio::fs::File::from_std(file);
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        let expected = range.end - range.start;
        if written != expected {
            return Err(Error::TransientNetwork {
                message: format!("tail download wrote {written} of {expected} bytes"),
            });
        }
        self.tail_bytes.fetch_add(written, Ordering::Relaxed);

        let file = out.into_std().await;
        Ok(CachedTail {
            reader: LocalFileReader::from_file(file)?,
            _path: path,
        })
    }

    pub fn location(&self) -> &ObjectLocation {
        &self.location
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Offset from which reads are served by the local tail cache.
    pub fn local_cache_offset(&self) -> u64 {
        self.local_cache_offset
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            tail_bytes: self.tail_bytes.load(Ordering::Relaxed),
            network_bytes: self.network_bytes.load(Ordering::Relaxed),
            cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
        }
    }

    /// Release the tail cache file; later reads fail with
    /// [`Error::ArchiveClosed`]. Safe to call more than once.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let tail = self.tail.write().unwrap_or_else(|e| e.into_inner()).take();
        if tail.is_some() {
            debug!(key = %self.location.key, "closed archive tail cache");
        }
    }

    /// Read `[start, end)` from either the cached tail or the store.
    pub async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        if start > end || end > self.total_size {
            return Err(Error::InvalidRange { start, end });
        }
        if self.is_closed() {
            return Err(Error::ArchiveClosed);
        }
        if start == end {
            return Ok(Bytes::new());
        }
        if start >= self.local_cache_offset {
            return self.read_cached(start, end);
        }

        let bytes = self
            .retry
            .run("ranged read", |_| async move {
                let body = self
                    .store
                    .get_object_range(&self.location, start..end)
                    .await?;
                collect_bytes(body).await
            })
            .await?;
        if bytes.len() as u64 != end - start {
            return Err(Error::TransientNetwork {
                message: format!(
                    "ranged read [{start}, {end}) returned {} bytes",
                    bytes.len()
                ),
            });
        }
        self.network_bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    fn read_cached(&self, start: u64, end: u64) -> Result<Bytes> {
        let guard = self.tail.read().unwrap_or_else(|e| e.into_inner());
        let tail = guard.as_ref().ok_or(Error::ArchiveClosed)?;
        let mut buf = vec![0u8; (end - start) as usize];
        let mut filled = 0;
        let base = start - self.local_cache_offset;
        while filled < buf.len() {
            let n = tail.reader.pread_at(base + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Format(format!(
                    "tail cache ended at offset {}",
                    start + filled as u64
                )));
            }
            filled += n;
        }
        self.cached_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl<S: ObjectStore> ReadAt for RemoteArchiveReader<S> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let end = offset.saturating_add(buf.len() as u64).min(self.total_size);
        if offset >= end {
            return Ok(0);
        }
        let bytes = self.read_range(offset, end).await?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn size(&self) -> u64 {
        self.total_size
    }

    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        RemoteArchiveReader::<S>::read_range(self, start, end).await
    }
}

impl<S: ObjectStore> Drop for RemoteArchiveReader<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryObjectStore;
    use std::time::Duration;

    fn options(local_size_limit: u64, dir: &tempfile::TempDir) -> RemoteReaderOptions {
        RemoteReaderOptions {
            local_size_limit,
            temp_dir: Some(dir.path().to_path_buf()),
            retry: RetryPolicy::new(3, Duration::ZERO),
        }
    }

    fn fixture(len: usize) -> (Arc<MemoryObjectStore>, ObjectLocation, Vec<u8>) {
        let store = Arc::new(MemoryObjectStore::new());
        let location = ObjectLocation::new("src", "ap-guangzhou", "a.zip");
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        store.insert(location.clone(), data.clone());
        (store, location, data)
    }

    #[tokio::test]
    async fn ranges_match_source_on_both_sides_of_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let (store, location, data) = fixture(50_000);
        let reader = RemoteArchiveReader::open(store.clone(), location, options(20_000, &dir))
            .await
            .unwrap();
        assert_eq!(reader.local_cache_offset(), 30_000);

        for (start, end) in [
            (0, 10),
            (29_990, 30_000),
            (29_990, 30_010),
            (30_000, 30_001),
            (31_234, 49_999),
            (0, 50_000),
            (49_999, 50_000),
        ] {
            let got = reader.read_range(start, end).await.unwrap();
            assert_eq!(&got[..], &data[start as usize..end as usize], "[{start},{end})");
        }
        assert!(reader.read_range(10, 50_001).await.is_err());

        let stats = reader.stats();
        assert_eq!(stats.tail_bytes, 20_000);
        assert!(stats.cached_bytes > 0);
        assert!(stats.network_bytes > 0);
    }

    #[tokio::test]
    async fn small_objects_are_cached_whole() {
        let dir = tempfile::tempdir().unwrap();
        let (store, location, data) = fixture(1000);
        let reader = RemoteArchiveReader::open(store.clone(), location, options(4096, &dir))
            .await
            .unwrap();
        assert_eq!(reader.local_cache_offset(), 0);
        let reads_after_open = store.range_reads().len();

        assert_eq!(&reader.read_range(100, 900).await.unwrap()[..], &data[100..900]);
        assert_eq!(store.range_reads().len(), reads_after_open);
    }

    #[tokio::test]
    async fn tail_download_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let (store, location, _) = fixture(1000);
        store.fail_next_range_reads(2);
        let reader = RemoteArchiveReader::open(store.clone(), location.clone(), options(500, &dir))
            .await
            .unwrap();
        assert_eq!(reader.stats().tail_bytes, 500);

        store.fail_next_range_reads(3);
        let err = RemoteArchiveReader::open(store, location, options(500, &dir))
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn zero_or_unknown_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (store, location, _) = fixture(10);
        store.report_size(location.clone(), None);
        let err = RemoteArchiveReader::open(store.clone(), location.clone(), options(5, &dir))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::SizeUnavailable { .. }));
        assert!(store.range_reads().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_the_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        let (store, location, _) = fixture(1000);
        let reader = RemoteArchiveReader::open(store, location, options(100, &dir))
            .await
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        reader.close();
        reader.close();
        assert!(reader.is_closed());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(matches!(
            reader.read_range(950, 960).await,
            Err(Error::ArchiveClosed)
        ));
        assert!(matches!(
            reader.read_range(0, 10).await,
            Err(Error::ArchiveClosed)
        ));
    }
}
