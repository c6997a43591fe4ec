//! Object store access.
//!
//! The extraction pipeline only needs four things from a store: the size and
//! metadata of an object, a byte range of it as a stream, and a streaming
//! upload. [`ObjectStore`] captures exactly that so the HTTP implementation
//! and the in-memory one used by tests are interchangeable.

mod http;
mod memory;

pub use http::{DEFAULT_META_PREFIX, HttpObjectStore};
pub use memory::{MemoryObjectStore, PutFailure, StoredObject};

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::error::Result;

/// A stream of byte chunks; an `Err` item ends the stream.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Identifies one object: bucket, region and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub region: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// What a metadata probe reports about an object.
#[derive(Debug, Clone, Default)]
pub struct ObjectMeta {
    /// `None` when the store did not report a length.
    pub content_length: Option<u64>,
    /// User metadata, keys without the store-specific header prefix.
    pub metadata: HashMap<String, String>,
}

/// Upload request details besides the body.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_length: Option<u64>,
    pub metadata: HashMap<String, String>,
}

/// What the store returns for a committed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutReceipt {
    pub request_id: Option<String>,
    pub location: String,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta>;

    /// Stream bytes `[range.start, range.end)` of the object.
    ///
    /// Non-2xx responses must surface as errors, either here or as the first
    /// stream item.
    async fn get_object_range(
        &self,
        location: &ObjectLocation,
        range: Range<u64>,
    ) -> Result<ByteStream>;

    /// Upload `body`. If the body stream yields an error the upload must fail
    /// with that error and nothing may be committed.
    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: ByteStream,
        options: PutOptions,
    ) -> Result<PutReceipt>;
}

/// Drain a byte stream into one contiguous buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}
