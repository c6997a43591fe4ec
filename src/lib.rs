//! # remote-unzip
//!
//! Extracts a ZIP archive stored in an object store into another bucket,
//! one bounded batch of entries at a time.
//!
//! The archive is never downloaded as a whole. Its tail, where the central
//! directory lives, is cached on local disk; entry data is streamed with HTTP
//! Range requests through a read-ahead buffer, decompressed, verified, and
//! uploaded as it arrives. Each run processes one [`IndexRange`] of entries
//! and reports the range to run next, so a host with a limited execution
//! time can work through arbitrarily large archives by re-invoking.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use remote_unzip::{ChunkedExtractionScheduler, ExtractConfig, HttpObjectStore, ObjectLocation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(HttpObjectStore::new("https://{bucket}.cos.{region}.myqcloud.com")?);
//!     let mut config = ExtractConfig::default();
//!     config.target.bucket = "extracted-1250000000".into();
//!     config.target.region = "ap-guangzhou".into();
//!
//!     let source = ObjectLocation::new("uploads-1250000000", "ap-guangzhou", "in/archive.zip");
//!     let mut range = None;
//!     loop {
//!         let scheduler = ChunkedExtractionScheduler::new(Arc::clone(&store), config.clone())?;
//!         let report = scheduler.run(&source, range).await?;
//!         println!("{} of {} entries extracted", report.succeeded(), report.results.len());
//!         match report.next_range {
//!             Some(next) => range = Some(next),
//!             None => break,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod prefetch;
pub mod range;
pub mod remote;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod zip;

pub use cancel::CancelHandle;
pub use cli::Cli;
pub use config::{ExtractConfig, RootDirPart, TargetConfig};
pub use error::{Error, Result};
pub use io::{LocalFileReader, ReadAt};
pub use prefetch::PrefetchBuffer;
pub use range::IndexRange;
pub use remote::{RemoteArchiveReader, RemoteReaderOptions, TransferStats};
pub use report::{BatchFailure, BatchReport, BatchStatus, EntryParams, FailureStage, TaskResult};
pub use retry::RetryPolicy;
pub use scheduler::{ChunkedExtractionScheduler, GENERATED_MARKER, SchedulerState};
pub use store::{
    ByteStream, HttpObjectStore, MemoryObjectStore, ObjectLocation, ObjectMeta, ObjectStore,
    PutFailure, PutOptions, PutReceipt,
};
pub use zip::{ArchiveIndex, EntryDescriptor, IndexOptions};
