use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, HeaderMap, RANGE};
use reqwest::{Client, StatusCode, Url};
use tracing::debug;

use super::{ByteStream, ObjectLocation, ObjectMeta, ObjectStore, PutOptions, PutReceipt};
use crate::error::{Error, Result, redact_query};

/// Default header prefix for user metadata (S3 and COS both accept it).
pub const DEFAULT_META_PREFIX: &str = "x-amz-meta-";

const REQUEST_ID_HEADERS: [&str; 2] = ["x-cos-request-id", "x-amz-request-id"];

/// Object store spoken to over plain HTTP(S).
///
/// Object URLs come from an endpoint template in which `{bucket}` and
/// `{region}` are substituted, e.g. `https://{bucket}.cos.{region}.myqcloud.com`.
/// The key is appended as path segments. Requests are not signed; point the
/// template at a gateway or use pre-authorised buckets.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    meta_prefix: String,
    transferred_bytes: Arc<AtomicU64>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            meta_prefix: DEFAULT_META_PREFIX.to_string(),
            transferred_bytes: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_meta_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.meta_prefix = prefix.into().to_ascii_lowercase();
        self
    }

    /// Total bytes received from ranged GETs.
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    pub fn object_url(&self, location: &ObjectLocation) -> Result<Url> {
        let base = self
            .endpoint
            .replace("{bucket}", &location.bucket)
            .replace("{region}", &location.region);
        let mut url = Url::parse(&base)
            .map_err(|e| Error::permanent(format!("invalid endpoint '{base}': {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::permanent(format!("endpoint '{base}' cannot carry a path")))?
            .pop_if_empty()
            .extend(location.key.split('/'));
        Ok(url)
    }

    fn user_metadata(&self, headers: &HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                let key = name.as_str().strip_prefix(&self.meta_prefix)?;
                Some((key.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect()
    }
}

fn status_error(status: StatusCode, url: &Url) -> Error {
    Error::Http {
        status: status.as_u16(),
        url: redact_query(url.as_str()),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Total size from `Content-Range: bytes a-b/total`.
fn total_from_content_range(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, CONTENT_RANGE.as_str())?
        .rsplit_once('/')?
        .1
        .parse()
        .ok()
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_object(&self, location: &ObjectLocation) -> Result<ObjectMeta> {
        let url = self.object_url(location)?;
        debug!(url = %redact_query(url.as_str()), "HEAD object");
        let resp = self.client.head(url.clone()).send().await?;

        if resp.status().is_success() {
            let content_length =
                header_str(resp.headers(), CONTENT_LENGTH.as_str()).and_then(|s| s.parse().ok());
            return Ok(ObjectMeta {
                content_length,
                metadata: self.user_metadata(resp.headers()),
            });
        }
        if resp.status() != StatusCode::METHOD_NOT_ALLOWED {
            return Err(status_error(resp.status(), &url));
        }

        // Some gateways refuse HEAD; probe with a one-byte range instead.
        // 416 on that probe means the object is empty.
        let resp = self
            .client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;
        match resp.status() {
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(ObjectMeta {
                content_length: Some(0),
                metadata: self.user_metadata(resp.headers()),
            }),
            status if status.is_success() => Ok(ObjectMeta {
                content_length: total_from_content_range(resp.headers()),
                metadata: self.user_metadata(resp.headers()),
            }),
            status => Err(status_error(status, &url)),
        }
    }

    async fn get_object_range(
        &self,
        location: &ObjectLocation,
        range: Range<u64>,
    ) -> Result<ByteStream> {
        if range.start >= range.end {
            return Ok(stream::empty().boxed());
        }
        let url = self.object_url(location)?;
        let header = format!("bytes={}-{}", range.start, range.end - 1);
        debug!(url = %redact_query(url.as_str()), range = %header, "GET object range");

        let resp = self
            .client
            .get(url.clone())
            .header(RANGE, &header)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &url));
        }
        // A 200 means the server ignored the Range header; refuse rather than
        // hand back bytes from the wrong offset.
        if resp.status() != StatusCode::PARTIAL_CONTENT && range.start != 0 {
            return Err(Error::permanent(format!(
                "server ignored range {header} for {}",
                redact_query(url.as_str())
            )));
        }

        let counter = Arc::clone(&self.transferred_bytes);
        let body = resp.bytes_stream().map_err(Error::from).boxed();
        let remaining = range.end - range.start;
        let chunks = stream::unfold(
            (body, remaining, counter, false),
            |(mut body, mut remaining, counter, done)| async move {
                if done {
                    return None;
                }
                match body.next().await {
                    Some(Ok(mut chunk)) => {
                        // A 200 response to a range starting at 0 may run past the end.
                        if chunk.len() as u64 > remaining {
                            chunk.truncate(remaining as usize);
                        }
                        remaining -= chunk.len() as u64;
                        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                        let done = remaining == 0;
                        Some((Ok(chunk), (body, remaining, counter, done)))
                    }
                    Some(Err(e)) => Some((Err(e), (body, remaining, counter, true))),
                    None if remaining > 0 => {
                        let err = Error::TransientNetwork {
                            message: format!("connection closed with {remaining} bytes unread"),
                        };
                        Some((Err(err), (body, remaining, counter, true)))
                    }
                    None => None,
                }
            },
        );
        Ok(chunks.boxed())
    }

    async fn put_object(
        &self,
        location: &ObjectLocation,
        body: ByteStream,
        options: PutOptions,
    ) -> Result<PutReceipt> {
        let url = self.object_url(location)?;
        debug!(url = %redact_query(url.as_str()), "PUT object");

        let mut request = self
            .client
            .put(url.clone())
            .body(reqwest::Body::wrap_stream(body));
        if let Some(len) = options.content_length {
            request = request.header(CONTENT_LENGTH, len);
        }
        for (key, value) in &options.metadata {
            request = request.header(format!("{}{}", self.meta_prefix, key), value);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(resp.status(), &url));
        }
        let request_id = REQUEST_ID_HEADERS
            .iter()
            .find_map(|name| header_str(resp.headers(), name))
            .map(str::to_string);
        Ok(PutReceipt {
            request_id,
            location: redact_query(url.as_str()),
            etag: header_str(resp.headers(), ETAG.as_str()).map(|s| s.trim_matches('"').to_string()),
        })
    }
}
