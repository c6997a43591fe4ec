//! Shared fixtures: a minimal ZIP writer and an in-memory store setup.
#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use flate2::Compression;
use flate2::write::DeflateEncoder;

use remote_unzip::{ExtractConfig, MemoryObjectStore, ObjectLocation, TargetConfig};

pub const SOURCE_BUCKET: &str = "uploads";
pub const TARGET_BUCKET: &str = "extracted";
pub const REGION: &str = "ap-guangzhou";

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Builds archives entry by entry, with correct CRCs and sizes.
#[derive(Default)]
pub struct ZipBuilder {
    data: Vec<u8>,
    central: Vec<u8>,
    count: u16,
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(mut self, name: &str, content: &[u8]) -> Self {
        self.add(name.as_bytes(), METHOD_STORED, content, content.to_vec(), 0, 0);
        self
    }

    /// A stored entry whose name bytes are written as given, without the
    /// UTF-8 flag, the way legacy archivers do.
    pub fn stored_raw_name(mut self, name: &[u8], content: &[u8]) -> Self {
        self.add(name, METHOD_STORED, content, content.to_vec(), 0, 0);
        self
    }

    /// A stored entry with the encryption flag set.
    pub fn encrypted(mut self, name: &str, content: &[u8]) -> Self {
        self.add(name.as_bytes(), METHOD_STORED, content, content.to_vec(), 0, 0x1);
        self
    }

    pub fn deflated(mut self, name: &str, content: &[u8]) -> Self {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        let packed = encoder.finish().unwrap();
        self.add(name.as_bytes(), METHOD_DEFLATE, content, packed, 0, 0);
        self
    }

    /// `name` should end with `/`.
    pub fn directory(mut self, name: &str) -> Self {
        self.add(name.as_bytes(), METHOD_STORED, b"", Vec::new(), 0x10, 0);
        self
    }

    /// An entry whose recorded CRC does not match its content.
    pub fn corrupt(mut self, name: &str, content: &[u8]) -> Self {
        self.add(name.as_bytes(), METHOD_STORED, content, content.to_vec(), 0, 0);
        let crc_at = self.central.len() - (46 + name.len()) + 16;
        self.central[crc_at] ^= 0xff;
        self
    }

    fn add(
        &mut self,
        name: &[u8],
        method: u16,
        raw: &[u8],
        packed: Vec<u8>,
        external_attrs: u32,
        flags: u16,
    ) {
        let mut crc = flate2::Crc::new();
        crc.update(raw);
        let crc = crc.sum();
        let offset = self.data.len() as u32;

        let lfh = &mut self.data;
        lfh.extend_from_slice(b"PK\x03\x04");
        put16(lfh, 20);
        put16(lfh, flags);
        put16(lfh, method);
        put16(lfh, 0);
        put16(lfh, 0x21);
        put32(lfh, crc);
        put32(lfh, packed.len() as u32);
        put32(lfh, raw.len() as u32);
        put16(lfh, name.len() as u16);
        put16(lfh, 0);
        lfh.extend_from_slice(name);
        lfh.extend_from_slice(&packed);

        let cd = &mut self.central;
        cd.extend_from_slice(b"PK\x01\x02");
        put16(cd, 20);
        put16(cd, 20);
        put16(cd, flags);
        put16(cd, method);
        put16(cd, 0);
        put16(cd, 0x21);
        put32(cd, crc);
        put32(cd, packed.len() as u32);
        put32(cd, raw.len() as u32);
        put16(cd, name.len() as u16);
        put16(cd, 0);
        put16(cd, 0);
        put16(cd, 0);
        put16(cd, 0);
        put32(cd, external_attrs);
        put32(cd, offset);
        cd.extend_from_slice(name);

        self.count += 1;
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = self.data;
        let cd_offset = out.len() as u32;
        out.extend_from_slice(&self.central);
        out.extend_from_slice(b"PK\x05\x06");
        put16(&mut out, 0);
        put16(&mut out, 0);
        put16(&mut out, self.count);
        put16(&mut out, self.count);
        put32(&mut out, self.central.len() as u32);
        put32(&mut out, cd_offset);
        put16(&mut out, 0);
        out
    }
}

fn put16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Content of the `i`-th generated file.
pub fn file_body(i: usize) -> Vec<u8> {
    format!("entry number {i}\n").repeat(i % 5 + 1).into_bytes()
}

/// `n` stored files named `files/NNNN.txt`.
pub fn numbered_archive(n: usize) -> Vec<u8> {
    (0..n)
        .fold(ZipBuilder::new(), |zip, i| {
            zip.stored(&format!("files/{i:04}.txt"), &file_body(i))
        })
        .finish()
}

/// Deterministic, moderately compressible bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 1000) % 251) as u8).collect()
}

pub fn source(key: &str) -> ObjectLocation {
    ObjectLocation::new(SOURCE_BUCKET, REGION, key)
}

pub fn target(key: &str) -> ObjectLocation {
    ObjectLocation::new(TARGET_BUCKET, REGION, key)
}

/// Config writing to `extracted/out/...` with small, test-friendly sizes.
pub fn config(dir: &tempfile::TempDir) -> ExtractConfig {
    ExtractConfig {
        range_limit: 10,
        local_size_limit: 4 * 1024,
        block_size: 8 * 1024,
        max_queued_blocks: 3,
        retry_delay_ms: 0,
        temp_dir: Some(dir.path().to_path_buf()),
        target: TargetConfig {
            bucket: TARGET_BUCKET.into(),
            region: REGION.into(),
            prefix: "out".into(),
        },
        ..ExtractConfig::default()
    }
}

/// A store holding `archive` at `uploads/<key>`.
pub fn store_with(key: &str, archive: Vec<u8>) -> Arc<MemoryObjectStore> {
    let store = Arc::new(MemoryObjectStore::new());
    store.insert(source(key), archive);
    store
}
