//! Decompressing byte stream for one entry.

use bytes::{Buf, Bytes};
use flate2::{Crc, Decompress, FlushDecompress, Status};
use futures_util::{StreamExt, stream};

use super::structures::{CompressionMethod, EntryDescriptor};
use crate::error::{Error, Result};
use crate::store::ByteStream;

/// Output chunk size for inflated data.
const INFLATE_CHUNK: usize = 64 * 1024;

struct EntryState {
    name: String,
    source: ByteStream,
    source_done: bool,
    method: CompressionMethod,
    inflater: Decompress,
    inflate_done: bool,
    input: Bytes,
    produced: u64,
    crc: Crc,
    expected_crc: u32,
    expected_size: u64,
    finished: bool,
}

/// Reject entries whose data cannot be decoded, before any of it is fetched.
pub fn ensure_supported(entry: &EntryDescriptor) -> Result<()> {
    if entry.is_encrypted {
        return Err(Error::EncryptedEntry {
            name: entry.name.clone(),
        });
    }
    match entry.compression_method {
        CompressionMethod::Stored | CompressionMethod::Deflate => Ok(()),
        CompressionMethod::Unknown(method) => Err(Error::UnsupportedCompression {
            name: entry.name.clone(),
            method,
        }),
    }
}

/// Decode `compressed` according to the entry's method.
///
/// The stream verifies CRC-32 and length against the central directory and
/// ends with [`Error::UploadVerificationFailed`] on mismatch, so consumers
/// never see a silently corrupt entry complete.
pub fn entry_stream(entry: &EntryDescriptor, compressed: ByteStream) -> Result<ByteStream> {
    ensure_supported(entry)?;
    let state = EntryState {
        name: entry.name.clone(),
        source: compressed,
        source_done: false,
        method: entry.compression_method,
        inflater: Decompress::new(false),
        inflate_done: false,
        input: Bytes::new(),
        produced: 0,
        crc: Crc::new(),
        expected_crc: entry.crc32,
        expected_size: entry.uncompressed_size,
        finished: false,
    };
    Ok(stream::try_unfold(state, next_chunk).boxed())
}

async fn next_chunk(mut state: EntryState) -> Result<Option<(Bytes, EntryState)>> {
    if state.finished {
        return Ok(None);
    }
    loop {
        if state.input.is_empty() && !state.source_done {
            match state.source.next().await {
                Some(chunk) => state.input = chunk?,
                None => state.source_done = true,
            }
        }

        let produced = match state.method {
            CompressionMethod::Stored => {
                if state.input.is_empty() && state.source_done {
                    None
                } else {
                    Some(std::mem::take(&mut state.input))
                }
            }
            _ => inflate_step(&mut state)?,
        };

        match produced {
            Some(chunk) if !chunk.is_empty() => {
                state.crc.update(&chunk);
                state.produced += chunk.len() as u64;
                if state.produced > state.expected_size {
                    return Err(mismatch(&state, "entry is longer than declared"));
                }
                return Ok(Some((chunk, state)));
            }
            Some(_) => continue,
            None => {
                state.finished = true;
                verify(&state)?;
                return Ok(None);
            }
        }
    }
}

/// Run the inflater once. `None` means the deflate stream has ended.
fn inflate_step(state: &mut EntryState) -> Result<Option<Bytes>> {
    if state.inflate_done {
        return Ok(None);
    }
    let mut out = vec![0u8; INFLATE_CHUNK];
    let before_in = state.inflater.total_in();
    let before_out = state.inflater.total_out();
    let status = state
        .inflater
        .decompress(&state.input, &mut out, FlushDecompress::None)
        .map_err(|e| Error::Format(format!("inflating '{}': {e}", state.name)))?;
    let consumed = (state.inflater.total_in() - before_in) as usize;
    let written = (state.inflater.total_out() - before_out) as usize;
    state.input.advance(consumed);
    out.truncate(written);

    if status == Status::StreamEnd {
        // Anything after the end marker is not part of this entry.
        state.inflate_done = true;
        state.input.clear();
    }
    if written == 0 {
        if state.inflate_done {
            return Ok(None);
        }
        if consumed == 0 && state.source_done && state.input.is_empty() {
            return Err(Error::Format(format!(
                "deflate data for '{}' ends before the end of stream marker",
                state.name
            )));
        }
    }
    Ok(Some(Bytes::from(out)))
}

fn verify(state: &EntryState) -> Result<()> {
    if state.produced != state.expected_size {
        return Err(mismatch(
            state,
            &format!("expected {} bytes, got {}", state.expected_size, state.produced),
        ));
    }
    if state.crc.sum() != state.expected_crc {
        return Err(mismatch(
            state,
            &format!(
                "crc32 {:08x} does not match {:08x}",
                state.crc.sum(),
                state.expected_crc
            ),
        ));
    }
    Ok(())
}

fn mismatch(state: &EntryState, reason: &str) -> Error {
    Error::UploadVerificationFailed {
        name: state.name.clone(),
        reason: reason.to_string(),
    }
}
