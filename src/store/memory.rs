use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};

use super::{ByteStream, ObjectLocation, ObjectMeta, ObjectStore, PutOptions, PutReceipt};
use crate::error::{Error, Result};

/// Chunk size used when serving ranged reads, so consumers see several chunks.
const SERVE_CHUNK: usize = 16 * 1024;

/// An object held by [`MemoryObjectStore`].
#[derive(Debug, Clone, Default)]
pub struct StoredObject {
    pub data: Bytes,
    pub metadata: HashMap<String, String>,
}

/// How a scripted upload failure behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutFailure {
    /// Every upload to the key fails with a non-retryable error.
    Permanent,
    /// The next `n` uploads to the key fail with a retryable error.
    Transient(u32),
}

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectLocation, StoredObject>,
    reported_sizes: HashMap<ObjectLocation, Option<u64>>,
    put_failures: HashMap<String, PutFailure>,
    range_failures: u32,
    range_log: Vec<(String, Range<u64>)>,
}

/// An in-process object store.
///
/// Besides plain storage it can misreport sizes, fail uploads or ranged reads
/// on demand, and slow uploads down, which is what the extraction tests need.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
    put_delay: Mutex<Option<Duration>>,
    served_bytes: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, location: ObjectLocation, data: impl Into<Bytes>) {
        self.insert_with_metadata(location, data, HashMap::new());
    }

    pub fn insert_with_metadata(
        &self,
        location: ObjectLocation,
        data: impl Into<Bytes>,
        metadata: HashMap<String, String>,
    ) {
        let object = StoredObject {
            data: data.into(),
            metadata,
        };
        self.lock().objects.insert(location, object);
    }

    pub fn get(&self, location: &ObjectLocation) -> Option<StoredObject> {
        self.lock().objects.get(location).cloned()
    }

    /// All objects in `bucket` whose key starts with `prefix`, sorted by key.
    pub fn list(&self, bucket: &str, prefix: &str) -> Vec<(String, StoredObject)> {
        let mut found: Vec<_> = self
            .lock()
            .objects
            .iter()
            .filter(|(loc, _)| loc.bucket == bucket && loc.key.starts_with(prefix))
            .map(|(loc, obj)| (loc.key.clone(), obj.clone()))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Make `head_object` report `size` instead of the stored length.
    pub fn report_size(&self, location: ObjectLocation, size: Option<u64>) {
        self.lock().reported_sizes.insert(location, size);
    }

    pub fn fail_puts(&self, key: impl Into<String>, failure: PutFailure) {
        self.lock().put_failures.insert(key.into(), failure);
    }

    /// Fail the next `n` ranged reads with a retryable error.
    pub fn fail_next_range_reads(&self, n: u32) {
        self.lock().range_failures = n;
    }

    /// Sleep this long between body chunks during uploads.
    pub fn set_put_delay(&self, delay: Option<Duration>) {
        *self.put_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Every ranged read served so far, as `(key, range)`.
    pub fn range_reads(&self) -> Vec<(String, Range<u64>)> {
        self.lock().range_log.clone()
    }

    pub fn served_bytes(&self) -> u64 {
        self.served_bytes.load(Ordering::Relaxed)
    }

    fn take_put_failure(&self, key: &str) -> Option<Error> {
        let mut inner = self.lock();
        match inner.put_failures.get_mut(key)? {
            PutFailure::Permanent => Some(Error::Http {
                status: 403,
                url: format!("memory://{key}"),
            }),
            PutFailure::Transient(0) => None,
            PutFailure::Transient(n) => {
                *n -= 1;
                Some(Error::TransientNetwork {
                    message: format!("injected upload failure for {key}"),
                })
            }
        }
    }
}

fn not_found(location: &ObjectLocation) -> Error {
    Error::Http {
        status: 404,
        url: format!("memory://{location}"),
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta> {
        let inner = self.lock();
        let object = inner.objects.get(location).ok_or_else(|| not_found(location))?;
        let content_length = match inner.reported_sizes.get(location) {
            Some(size) => *size,
            None => Some(object.data.len() as u64),
        };
        Ok(ObjectMeta {
            content_length,
            metadata: object.metadata.clone(),
        })
    }

    async fn get_object_range(
        &self,
        location: &ObjectLocation,
        range: Range<u64>,
    ) -> Result<ByteStream> {
        let data = {
            let mut inner = self.lock();
            inner.range_log.push((location.key.clone(), range.clone()));
            if inner.range_failures > 0 {
                inner.range_failures -= 1;
                return Err(Error::TransientNetwork {
                    message: format!("injected range failure for {location}"),
                });
            }
            let object = inner.objects.get(location).ok_or_else(|| not_found(location))?;
            let len = object.data.len() as u64;
            if range.start > range.end || range.end > len {
                return Err(Error::Http {
                    status: 416,
                    url: format!("memory://{location}"),
                });
            }
            object.data.slice(range.start as usize..range.end as usize)
        };
        self.served_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let chunks: Vec<Result<Bytes>> = data
            .chunks(SERVE_CHUNK)
            .map(|c| Ok(data.slice_ref(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        mut body: ByteStream,
        options: PutOptions,
    ) -> Result<PutReceipt> {
        if let Some(err) = self.take_put_failure(&location.key) {
            return Err(err);
        }
        let delay = *self.put_delay.lock().unwrap_or_else(|e| e.into_inner());

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
        if let Some(expected) = options.content_length {
            if expected != buf.len() as u64 {
                return Err(Error::permanent(format!(
                    "content length mismatch for {location}: declared {expected}, sent {}",
                    buf.len()
                )));
            }
        }

        let etag = format!("{:08x}", {
            let mut crc = flate2::Crc::new();
            crc.update(&buf);
            crc.sum()
        });
        self.insert_with_metadata(location.clone(), buf.freeze(), options.metadata);
        Ok(PutReceipt {
            request_id: None,
            location: format!("memory://{location}"),
            etag: Some(etag),
        })
    }
}
