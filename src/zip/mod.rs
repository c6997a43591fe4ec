//! ZIP archive reading over random-access sources.
//!
//! ## Architecture
//!
//! - [`structures`]: on-disk records (EOCD, ZIP64 records, entry descriptors)
//! - [`parser`]: EOCD discovery and a lazy central-directory cursor
//! - [`inflate`]: decompressing, self-verifying entry streams
//! - [`index`]: [`ArchiveIndex`], the batch-facing view of one archive
//!
//! The EOCD and central directory sit at the end of the file, so listing an
//! archive only touches its tail. That is what makes the tail cache of
//! [`RemoteArchiveReader`](crate::remote::RemoteArchiveReader) pay off.
//!
//! ## Supported Features
//!
//! - Standard ZIP format (PKZIP APPNOTE 6.3.x compatible)
//! - ZIP64 extensions for archives and entries over 4 GiB
//! - STORED and DEFLATE compression
//!
//! Encryption, multi-disk archives and other compression methods are not
//! supported.

pub mod index;
pub mod inflate;
pub mod parser;
pub mod structures;

pub use index::{ArchiveIndex, IndexOptions};
pub use parser::{CentralDirectory, ZipParser};
pub use structures::{CompressionMethod, EntryDescriptor};
