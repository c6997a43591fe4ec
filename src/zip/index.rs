//! Entry enumeration and entry streams over a random-access archive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{StreamExt, stream};
use tracing::{debug, warn};

use super::inflate;
use super::parser::{CentralDirectory, ZipParser};
use super::structures::EntryDescriptor;
use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::prefetch::PrefetchBuffer;
use crate::range::IndexRange;
use crate::retry::RetryPolicy;
use crate::store::ByteStream;

/// Tuning for [`ArchiveIndex`].
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub retry: RetryPolicy,
    /// Size of one prefetched block of compressed entry data.
    pub block_size: u64,
    /// Prefetch watermark per entry stream.
    pub max_queued_blocks: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            block_size: 1024 * 1024,
            max_queued_blocks: 4,
        }
    }
}

/// Lazily enumerates the entries of one archive.
///
/// The index never owns the reader's lifetime: closing the index only stops
/// new listings and entry reads, the caller closes the reader itself.
pub struct ArchiveIndex<R: ReadAt + 'static> {
    parser: ZipParser<R>,
    cd: CentralDirectory,
    options: IndexOptions,
    closed: Arc<AtomicBool>,
}

impl<R: ReadAt + 'static> ArchiveIndex<R> {
    /// Locate the central directory of an archive of `total_size` bytes.
    pub async fn open(reader: Arc<R>, total_size: u64, options: IndexOptions) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::EmptyArchive);
        }
        let parser = ZipParser::new(reader);
        let cd = options
            .retry
            .run_when("locate central directory", is_recoverable, |_| {
                parser.central_directory()
            })
            .await
            .map_err(|e| corrupt(e, options.retry.max_attempts))?;
        debug!(
            offset = cd.offset,
            size = cd.size,
            entries = cd.total_entries,
            "central directory located"
        );
        Ok(Self {
            parser,
            cd,
            options,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Entry count declared by the central directory.
    pub fn entry_count(&self) -> u64 {
        self.cd.total_entries
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Entries whose index lies in `range`, plus the archive-wide entry count.
    ///
    /// The whole central directory is walked so the count is exact, but only
    /// the selected descriptors are kept. A failed walk starts over from the
    /// first record; once the retry budget is spent the archive is reported
    /// as [`Error::ArchiveIndexCorrupt`].
    pub async fn list_entries(&self, range: IndexRange) -> Result<(Vec<EntryDescriptor>, u64)> {
        self.options
            .retry
            .run_when("list entries", is_recoverable, |attempt| async move {
                if attempt > 1 {
                    debug!(attempt, %range, "walking central directory again");
                }
                let mut cursor = self.parser.entries(self.cd);
                let mut selected = Vec::new();
                while let Some(entry) = cursor.next_entry().await? {
                    if self.is_closed() {
                        return Err(Error::ArchiveClosed);
                    }
                    if range.contains(entry.index) {
                        selected.push(entry);
                    }
                }
                Ok((selected, cursor.position()))
            })
            .await
            .map_err(|e| corrupt(e, self.options.retry.max_attempts))
    }

    /// Open the decompressed content of `entry`.
    ///
    /// Directory entries yield an empty stream. Compressed bytes are read
    /// ahead through a [`PrefetchBuffer`]; once the index is closed, pending
    /// block reads fail with [`Error::EntryStreamClosed`].
    pub async fn open_entry_stream(&self, entry: &EntryDescriptor) -> Result<ByteStream> {
        self.ensure_open(&entry.name)?;
        if entry.is_directory {
            return Ok(stream::empty().boxed());
        }
        inflate::ensure_supported(entry)?;
        let data_offset = self.parser.get_data_offset(entry).await?;
        self.ensure_open(&entry.name)?;

        let reader = Arc::clone(self.parser.reader());
        let closed = Arc::clone(&self.closed);
        let name = entry.name.clone();
        let blocks = PrefetchBuffer::new(
            entry.compressed_size,
            self.options.block_size,
            self.options.max_queued_blocks,
            move |start, end| {
                let reader = Arc::clone(&reader);
                let closed = Arc::clone(&closed);
                let name = name.clone();
                async move {
                    if closed.load(Ordering::Acquire) {
                        return Err(Error::EntryStreamClosed { name });
                    }
                    reader.read_range(data_offset + start, data_offset + end).await
                }
            },
        );
        inflate::entry_stream(entry, blocks.boxed())
    }

    /// Stop serving listings and entry streams. Returns `true` on the first call.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            debug!("archive index closed");
        }
        first
    }

    fn ensure_open(&self, name: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::EntryStreamClosed {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

/// Errors that stop the retry loop immediately.
fn is_recoverable(e: &Error) -> bool {
    !matches!(
        e,
        Error::Cancelled { .. } | Error::ArchiveClosed | Error::EntryStreamClosed { .. }
    )
}

fn corrupt(e: Error, attempts: u32) -> Error {
    if !is_recoverable(&e) {
        return e;
    }
    warn!(attempts, error = %e, "giving up on archive index");
    Error::ArchiveIndexCorrupt {
        attempts,
        reason: e.to_string(),
    }
}
