//! Bounded batch extraction from an archive object into a target bucket.
//!
//! One [`ChunkedExtractionScheduler`] runs exactly one batch: the entries of
//! one [`IndexRange`]. The report it returns names the range to run next,
//! and the host decides whether to start a new scheduler for it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures_util::stream::FuturesUnordered;
use futures_util::{StreamExt, stream};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cancel::CancelHandle;
use crate::config::{ExtractConfig, RootDirPart};
use crate::error::{Error, Result};
use crate::range::IndexRange;
use crate::remote::{RemoteArchiveReader, RemoteReaderOptions};
use crate::report::{BatchFailure, BatchReport, EntryParams, TaskResult};
use crate::retry::RetryPolicy;
use crate::store::{ByteStream, ObjectLocation, ObjectStore, PutOptions, PutReceipt};
use crate::zip::{ArchiveIndex, EntryDescriptor, IndexOptions};

/// Metadata key marking an object as extraction output.
pub const GENERATED_MARKER: &str = "unzip-generated";

/// Lifecycle of one scheduler. Every state after `Running` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SchedulerState::Completed | SchedulerState::Cancelled | SchedulerState::Failed
        )
    }
}

type Reader<S> = RemoteArchiveReader<S>;

/// Handles that `cancel` has to reach while a batch is running.
struct Active<S: ObjectStore> {
    reader: Arc<Reader<S>>,
    index: Arc<ArchiveIndex<Reader<S>>>,
}

impl<S: ObjectStore> Active<S> {
    fn close(&self) {
        self.index.close();
        self.reader.close();
    }
}

pub struct ChunkedExtractionScheduler<S: ObjectStore> {
    store: Arc<S>,
    config: ExtractConfig,
    retry: RetryPolicy,
    cancel: CancelHandle,
    state: Mutex<SchedulerState>,
    active: Mutex<Option<Active<S>>>,
}

impl<S: ObjectStore> ChunkedExtractionScheduler<S> {
    /// `store` serves both the source archive and the extracted objects.
    pub fn new(store: Arc<S>, config: ExtractConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            retry: config.retry_policy(),
            config,
            cancel: CancelHandle::new(),
            state: Mutex::new(SchedulerState::Idle),
            active: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Abort the batch.
    ///
    /// Entries mid-upload fail with [`Error::Cancelled`] carrying `reason`,
    /// entries not yet started are recorded as cancelled, and the archive
    /// index and reader are closed. Only the first call on a non-terminal
    /// scheduler has any effect; the return value says whether this was it.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return false;
            }
            if !self.cancel.cancel(reason) {
                return false;
            }
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Cancelled;
            }
        }
        warn!(reason = self.cancel.reason().unwrap_or_default(), "cancelling batch");
        if let Some(active) = self.active.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            active.close();
        }
        true
    }

    /// Run one batch over `current_range`, or the first `rangeLimit` entries.
    pub async fn run(
        &self,
        source: &ObjectLocation,
        current_range: Option<IndexRange>,
    ) -> std::result::Result<BatchReport, BatchFailure> {
        self.begin().map_err(BatchFailure::open)?;
        let outcome = self.run_batch(source, current_range).await;
        if let Some(active) = self.active.lock().unwrap_or_else(|e| e.into_inner()).take() {
            active.close();
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = match &outcome {
            _ if self.cancel.is_cancelled() => SchedulerState::Cancelled,
            Ok(_) => SchedulerState::Completed,
            Err(_) => SchedulerState::Failed,
        };
        outcome
    }

    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            SchedulerState::Idle => {
                *state = SchedulerState::Running;
                Ok(())
            }
            _ if self.cancel.is_cancelled() => Err(self.cancel.error()),
            other => Err(Error::permanent(format!(
                "scheduler cannot run from state {other:?}"
            ))),
        }
    }

    async fn run_batch(
        &self,
        source: &ObjectLocation,
        current_range: Option<IndexRange>,
    ) -> std::result::Result<BatchReport, BatchFailure> {
        if !is_zip_key(&source.key) {
            return Err(BatchFailure::open(Error::UnsupportedFileType {
                key: source.key.clone(),
            }));
        }

        let meta = self
            .retry
            .run("head archive", |_| self.store.head_object(source))
            .await
            .map_err(|e| BatchFailure::open(self.settle(e)))?;
        let total_size = match meta.content_length {
            Some(0) => return Err(BatchFailure::open(Error::EmptyArchive)),
            Some(size) => size,
            None => {
                return Err(BatchFailure::open(Error::SizeUnavailable {
                    key: source.key.clone(),
                }));
            }
        };

        if !self.config.recursive
            && meta.metadata.get(GENERATED_MARKER).map(String::as_str) == Some("true")
        {
            info!(source = %source, "source is extraction output, skipping");
            return Ok(BatchReport {
                source: source.to_string(),
                running_range: None,
                next_range: None,
                entry_count: 0,
                results: Vec::new(),
                skipped: Some(format!("{source} carries the {GENERATED_MARKER} marker")),
                cancelled: None,
                transfer: Default::default(),
            });
        }

        let (reader, index) = self
            .open_archive(source, total_size)
            .await
            .map_err(|e| BatchFailure::open(self.settle(e)))?;

        let requested = match current_range {
            Some(range) => range,
            None => IndexRange::first(self.config.range_limit).map_err(BatchFailure::listing)?,
        };
        let (entries, entry_count) = index
            .list_entries(requested)
            .await
            .map_err(|e| BatchFailure::listing(self.settle(e)))?;
        let running_range = requested.clamp_to(entry_count);
        let next_range = running_range.and_then(|r| r.next(self.config.range_limit, entry_count));
        info!(
            source = %source,
            entry_count,
            running = ?running_range,
            next = ?next_range,
            selected = entries.len(),
            "batch started"
        );

        let results = self.extract_all(source, &index, entries).await;
        reader.close();

        let report = BatchReport {
            source: source.to_string(),
            running_range,
            next_range,
            entry_count,
            results,
            skipped: None,
            cancelled: self.cancel.reason().map(str::to_string),
            transfer: reader.stats(),
        };
        info!(
            source = %source,
            succeeded = report.succeeded(),
            total = report.results.len(),
            status = ?report.status(),
            "batch finished"
        );
        Ok(report)
    }

    async fn open_archive(
        &self,
        source: &ObjectLocation,
        total_size: u64,
    ) -> Result<(Arc<Reader<S>>, Arc<ArchiveIndex<Reader<S>>>)> {
        let options = RemoteReaderOptions {
            local_size_limit: self.config.local_size_limit,
            temp_dir: self.config.temp_dir.clone(),
            retry: self.retry,
        };
        let reader = Arc::new(
            RemoteArchiveReader::open_with_size(
                Arc::clone(&self.store),
                source.clone(),
                total_size,
                options,
            )
            .await?,
        );
        let index_options = IndexOptions {
            retry: self.retry,
            block_size: self.config.block_size,
            max_queued_blocks: self.config.max_queued_blocks,
        };
        let index = Arc::new(ArchiveIndex::open(Arc::clone(&reader), total_size, index_options).await?);

        let active = Active {
            reader: Arc::clone(&reader),
            index: Arc::clone(&index),
        };
        // `cancel` fires the token before it looks for handles to close.
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if self.cancel.is_cancelled() {
            active.close();
            return Err(self.cancel.error());
        }
        *slot = Some(active);
        Ok((reader, index))
    }

    async fn extract_all(
        &self,
        source: &ObjectLocation,
        index: &ArchiveIndex<Reader<S>>,
        entries: Vec<EntryDescriptor>,
    ) -> Vec<TaskResult> {
        let semaphore = Semaphore::new(self.config.concurrency);
        let keys = assign_keys(&self.config, &source.key, &entries);
        let mut tasks: FuturesUnordered<_> = entries
            .into_iter()
            .zip(keys)
            .map(|(entry, key)| self.extract_entry(index, entry, key, &semaphore))
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.next().await {
            results.push(result);
        }
        results.sort_by_key(|r| r.params.index);
        results
    }

    async fn extract_entry(
        &self,
        index: &ArchiveIndex<Reader<S>>,
        entry: EntryDescriptor,
        key: Result<String>,
        semaphore: &Semaphore,
    ) -> TaskResult {
        let params = EntryParams {
            index: entry.index,
            name: entry.name.clone(),
            key: key.as_deref().unwrap_or_default().to_string(),
            size: entry.uncompressed_size,
            is_directory: entry.is_directory,
        };

        let outcome = async {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| Error::permanent("worker pool closed"))?;
            if self.cancel.is_cancelled() {
                return Err(self.cancel.error());
            }
            let key = key?;
            self.upload_entry(index, &entry, key).await
        }
        .await
        .map_err(|e| self.settle(e));

        match &outcome {
            Ok(receipt) => debug!(
                index = entry.index,
                key = %params.key,
                bytes = entry.uncompressed_size,
                location = %receipt.location,
                "entry extracted"
            ),
            Err(e) => warn!(index = entry.index, name = %entry.name, error = %e, "entry failed"),
        }
        TaskResult { params, outcome }
    }

    async fn upload_entry(
        &self,
        index: &ArchiveIndex<Reader<S>>,
        entry: &EntryDescriptor,
        key: String,
    ) -> Result<PutReceipt> {
        if entry.uncompressed_size > self.config.max_object_size {
            return Err(Error::EntryTooLarge {
                name: entry.name.clone(),
                size: entry.uncompressed_size,
                limit: self.config.max_object_size,
            });
        }
        let target = ObjectLocation::new(
            self.config.target.bucket.clone(),
            self.config.target.region.clone(),
            key,
        );
        let options = PutOptions {
            content_length: Some(entry.uncompressed_size),
            metadata: HashMap::from([(GENERATED_MARKER.to_string(), "true".to_string())]),
        };

        let cancel = &self.cancel;
        let (target, options) = (&target, &options);
        self.retry
            .run_when(
                "upload entry",
                |e| e.is_retryable() && !cancel.is_cancelled(),
                |_| async move {
                    let body = index.open_entry_stream(entry).await?;
                    let body = abortable(body, cancel.clone());
                    self.store.put_object(target, body, options.clone()).await
                },
            )
            .await
    }

    /// Once cancelled, any failure is reported as the cancellation.
    fn settle(&self, error: Error) -> Error {
        if self.cancel.is_cancelled() && !error.is_cancelled() {
            self.cancel.error()
        } else {
            error
        }
    }
}

/// Make `body` fail with the cancellation error as soon as `cancel` fires.
fn abortable(body: ByteStream, cancel: CancelHandle) -> ByteStream {
    stream::unfold(Some((body, cancel)), |state| async move {
        let (mut body, cancel) = state?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some((Err(cancel.error()), None)),
            item = body.next() => item.map(|item| (item, Some((body, cancel)))),
        }
    })
    .boxed()
}

fn is_zip_key(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("zip"))
}

/// Destination key for `entry_name` extracted from the archive at `source_key`.
///
/// Joins the target prefix, the configured root directory parts, and the
/// entry name. Directory entries keep their trailing `/`.
pub fn destination_key(config: &ExtractConfig, source_key: &str, entry_name: &str) -> Result<String> {
    let name = sanitize_entry_name(entry_name, config.path_traversal_protection);
    if name.trim_end_matches('/').is_empty() {
        return Err(Error::permanent(format!(
            "entry name '{entry_name}' has no usable path"
        )));
    }

    let (dirname, file_name) = match source_key.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", source_key),
    };
    let basename = file_name
        .rsplit_once('.')
        .map_or(file_name, |(stem, _)| stem);

    let mut parts: Vec<&str> = Vec::new();
    let prefix = config.target.prefix.trim_matches('/');
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    for part in &config.extra_root_dir {
        let value = match part {
            RootDirPart::Dirname => dirname.trim_matches('/'),
            RootDirPart::Basename => basename,
        };
        if !value.is_empty() {
            parts.push(value);
        }
    }
    parts.push(&name);
    Ok(parts.join("/"))
}

/// Destination keys for a batch, in entry order.
///
/// Distinct names can land on one key, after sanitizing or when a legacy
/// name encoding loses information. The first entry keeps the key and the
/// later ones fail with [`Error::DuplicateKey`] instead of overwriting it.
fn assign_keys(
    config: &ExtractConfig,
    source_key: &str,
    entries: &[EntryDescriptor],
) -> Vec<Result<String>> {
    let mut claimed = HashSet::new();
    entries
        .iter()
        .map(|entry| {
            let key = destination_key(config, source_key, &entry.name)?;
            if !claimed.insert(key.clone()) {
                return Err(Error::DuplicateKey {
                    name: entry.name.clone(),
                    key,
                });
            }
            Ok(key)
        })
        .collect()
}

/// Normalize an entry name into a relative key.
///
/// With `protect` set, `.`, `..` and empty segments are dropped so the name
/// cannot climb out of the destination prefix.
pub fn sanitize_entry_name(name: &str, protect: bool) -> String {
    let name = name.replace('\\', "/");
    if !protect {
        return name.trim_start_matches('/').to_string();
    }
    let trailing_slash = name.ends_with('/');
    let mut cleaned = name
        .split('/')
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect::<Vec<_>>()
        .join("/");
    if trailing_slash && !cleaned.is_empty() {
        cleaned.push('/');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;

    fn config(prefix: &str, parts: Vec<RootDirPart>) -> ExtractConfig {
        ExtractConfig {
            extra_root_dir: parts,
            target: TargetConfig {
                bucket: "out".into(),
                region: "r".into(),
                prefix: prefix.into(),
            },
            ..ExtractConfig::default()
        }
    }

    #[test]
    fn sanitizing_strips_parent_segments() {
        assert_eq!(sanitize_entry_name("../../etc/passwd", true), "etc/passwd");
        assert_eq!(sanitize_entry_name("a/./b//c", true), "a/b/c");
        assert_eq!(sanitize_entry_name("dir/", true), "dir/");
        assert_eq!(sanitize_entry_name("..\\win\\x.txt", true), "win/x.txt");
        assert_eq!(sanitize_entry_name("../", true), "");
        assert_eq!(sanitize_entry_name("/abs/../x", false), "abs/../x");
    }

    #[test]
    fn key_joins_prefix_root_parts_and_name() {
        let cfg = config(
            "extracted/",
            vec![RootDirPart::Dirname, RootDirPart::Basename],
        );
        assert_eq!(
            destination_key(&cfg, "uploads/2024/photos.zip", "dir/b.txt").unwrap(),
            "extracted/uploads/2024/photos/dir/b.txt"
        );

        let cfg = config("", vec![RootDirPart::Basename]);
        assert_eq!(
            destination_key(&cfg, "photos.zip", "dir/").unwrap(),
            "photos/dir/"
        );

        let cfg = config("out", vec![RootDirPart::Dirname]);
        assert_eq!(destination_key(&cfg, "a.zip", "x").unwrap(), "out/x");
    }

    #[test]
    fn key_rejects_names_that_sanitize_to_nothing() {
        let cfg = config("out", Vec::new());
        assert!(destination_key(&cfg, "a.zip", "../").is_err());
        assert_eq!(destination_key(&cfg, "a.zip", "../x").unwrap(), "out/x");
    }

    #[test]
    fn colliding_keys_fail_after_the_first_claim() {
        let cfg = config("out", Vec::new());
        let entry = |index: u64, name: &str| EntryDescriptor {
            index,
            name: name.into(),
            compression_method: crate::zip::CompressionMethod::Stored,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            is_directory: false,
            is_encrypted: false,
        };
        let entries = [entry(0, "a/x.txt"), entry(1, "a/./x.txt"), entry(2, "b.txt")];
        let keys = assign_keys(&cfg, "in.zip", &entries);
        assert_eq!(keys[0].as_deref().unwrap(), "out/a/x.txt");
        assert!(matches!(
            &keys[1],
            Err(Error::DuplicateKey { name, key }) if name == "a/./x.txt" && key == "out/a/x.txt"
        ));
        assert_eq!(keys[2].as_deref().unwrap(), "out/b.txt");
    }

    #[test]
    fn only_zip_keys_are_supported() {
        assert!(is_zip_key("a/b/archive.zip"));
        assert!(is_zip_key("ARCHIVE.ZIP"));
        assert!(!is_zip_key("archive.tar.gz"));
        assert!(!is_zip_key("dir.zip/file"));
        assert!(!is_zip_key(".zip"));
    }

    #[tokio::test]
    async fn abortable_stream_fails_after_cancel() {
        let cancel = CancelHandle::new();
        let body = stream::pending::<Result<bytes::Bytes>>().boxed();
        let mut body = abortable(body, cancel.clone());
        cancel.cancel("time budget exhausted");
        match body.next().await {
            Some(Err(Error::Cancelled { reason })) => assert_eq!(reason, "time budget exhausted"),
            other => panic!("unexpected item: {:?}", other.map(|r| r.map(|b| b.len()))),
        }
        assert!(body.next().await.is_none());
    }
}
