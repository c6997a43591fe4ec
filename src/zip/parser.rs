//! Low-level ZIP archive parser.
//!
//! This module handles the binary parsing of ZIP file structures,
//! reading from any source that implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large file support
//! 3. Walk the Central Directory record by record, reading it in windows
//! 4. For extraction, read each file's Local File Header to find its data
//!
//! Central directory records are never materialised all at once; an
//! [`EntryCursor`] holds one read window and yields entries on demand.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::structures::*;

/// Maximum ZIP comment size allowed by the format (65535 bytes).
///
/// This limits the search area when looking for EOCD with a comment.
const MAX_COMMENT_SIZE: u64 = 65535;

/// How much of the central directory one cursor read fetches.
const CD_WINDOW: u64 = 64 * 1024;

/// Location and size of the central directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralDirectory {
    pub offset: u64,
    pub size: u64,
    pub total_entries: u64,
}

/// Low-level ZIP file parser.
///
/// Generic over the reader type so the same code runs over local files and
/// remote objects.
pub struct ZipParser<R: ReadAt> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
}

impl<R: ReadAt> ZipParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    /// Find and parse the End of Central Directory record.
    ///
    /// Handles both the simple case (no comment) and archives with
    /// comments by searching backwards for the signature.
    ///
    /// Returns the record and its offset in the file.
    pub async fn find_eocd(&self) -> Result<(EndOfCentralDirectory, u64)> {
        // Optimization: First try the simple case where there's no comment.
        if self.size >= EndOfCentralDirectory::SIZE as u64 {
            let offset = self.size - EndOfCentralDirectory::SIZE as u64;
            let buf = self.reader.read_range(offset, self.size).await?;

            // Check for signature and zero-length comment
            if &buf[0..4] == EndOfCentralDirectory::SIGNATURE && &buf[20..22] == b"\x00\x00" {
                let eocd = EndOfCentralDirectory::from_bytes(&buf)?;
                return Ok((eocd, offset));
            }
        }

        // EOCD not at expected location - the archive has a comment.
        let search_size = (MAX_COMMENT_SIZE + EndOfCentralDirectory::SIZE as u64).min(self.size);
        let search_start = self.size - search_size;
        let buf = self.reader.read_range(search_start, self.size).await?;

        // Search backwards for EOCD signature (PK\x05\x06)
        let last = buf.len().saturating_sub(EndOfCentralDirectory::SIZE);
        for i in (0..=last).rev() {
            if buf.len() < EndOfCentralDirectory::SIZE {
                break;
            }
            if &buf[i..i + 4] == EndOfCentralDirectory::SIGNATURE {
                // The comment length field must match the remaining bytes.
                let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;

                if comment_len == buf.len() - i - EndOfCentralDirectory::SIZE {
                    let eocd = EndOfCentralDirectory::from_bytes(
                        &buf[i..i + EndOfCentralDirectory::SIZE],
                    )?;
                    return Ok((eocd, search_start + i as u64));
                }
            }
        }

        Err(Error::Format("end of central directory not found".into()))
    }

    /// Read the ZIP64 End of Central Directory record.
    ///
    /// Called when the regular EOCD indicates ZIP64 extensions are needed
    /// (fields set to 0xFFFF or 0xFFFFFFFF).
    pub async fn read_zip64_eocd(&self, eocd_offset: u64) -> Result<Zip64EOCD> {
        // The ZIP64 EOCD Locator is located immediately before the regular EOCD
        let locator_offset = eocd_offset
            .checked_sub(Zip64EOCDLocator::SIZE as u64)
            .ok_or_else(|| Error::Format("zip64 locator missing".into()))?;
        let locator_buf = self.reader.read_range(locator_offset, eocd_offset).await?;
        let locator = Zip64EOCDLocator::from_bytes(&locator_buf)?;

        let eocd64_end = locator.eocd64_offset + Zip64EOCD::MIN_SIZE as u64;
        if eocd64_end > self.size {
            return Err(Error::Format("zip64 end of central directory out of bounds".into()));
        }
        let eocd64_buf = self
            .reader
            .read_range(locator.eocd64_offset, eocd64_end)
            .await?;

        Zip64EOCD::from_bytes(&eocd64_buf)
    }

    /// Locate the central directory, using ZIP64 records when needed.
    pub async fn central_directory(&self) -> Result<CentralDirectory> {
        let (eocd, eocd_offset) = self.find_eocd().await?;

        let cd = if eocd.is_zip64() {
            let eocd64 = self.read_zip64_eocd(eocd_offset).await?;
            CentralDirectory {
                offset: eocd64.cd_offset,
                size: eocd64.cd_size,
                total_entries: eocd64.total_entries,
            }
        } else {
            CentralDirectory {
                offset: eocd.cd_offset as u64,
                size: eocd.cd_size as u64,
                total_entries: eocd.total_entries as u64,
            }
        };

        if cd.offset.saturating_add(cd.size) > self.size {
            return Err(Error::Format(format!(
                "central directory [{}, +{}) exceeds archive size {}",
                cd.offset, cd.size, self.size
            )));
        }
        Ok(cd)
    }

    /// Start walking the central directory.
    pub fn entries(&self, cd: CentralDirectory) -> EntryCursor<'_, R> {
        EntryCursor {
            parser: self,
            cd,
            pos: cd.offset,
            window: Vec::new(),
            window_start: cd.offset,
            next_index: 0,
        }
    }

    /// Get the actual data offset for a file entry.
    ///
    /// The Local File Header (LFH) has variable-length fields (filename,
    /// extra field) that may differ from the Central Directory entry, so
    /// the LFH is read to find where the file data begins.
    pub async fn get_data_offset(&self, entry: &EntryDescriptor) -> Result<u64> {
        let lfh_end = entry.lfh_offset + LFH_SIZE as u64;
        if lfh_end > self.size {
            return Err(Error::Format(format!(
                "local header of '{}' is out of bounds",
                entry.name
            )));
        }
        let lfh_buf = self.reader.read_range(entry.lfh_offset, lfh_end).await?;

        // Verify LFH signature (PK\x03\x04)
        if &lfh_buf[0..4] != LFH_SIGNATURE {
            return Err(Error::Format(format!(
                "invalid local file header for '{}'",
                entry.name
            )));
        }

        // Read the variable field lengths from fixed positions in LFH
        let mut cursor = Cursor::new(&lfh_buf[..]);
        cursor.set_position(26); // Offset to filename length field

        let file_name_length = cursor.read_u16::<LittleEndian>()? as u64;
        let extra_field_length = cursor.read_u16::<LittleEndian>()? as u64;

        // Data starts after: LFH (30 bytes) + filename + extra field
        let data_offset =
            entry.lfh_offset + LFH_SIZE as u64 + file_name_length + extra_field_length;

        if data_offset + entry.compressed_size > self.size {
            return Err(Error::Format(format!(
                "data of '{}' runs past the end of the archive",
                entry.name
            )));
        }
        Ok(data_offset)
    }

    /// Get a reference to the underlying reader.
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}

/// Walks central directory records in order, one read window at a time.
pub struct EntryCursor<'a, R: ReadAt> {
    parser: &'a ZipParser<R>,
    cd: CentralDirectory,
    pos: u64,
    window: Vec<u8>,
    window_start: u64,
    next_index: u64,
}

impl<R: ReadAt> EntryCursor<'_, R> {
    /// Index the next returned entry will carry.
    pub fn position(&self) -> u64 {
        self.next_index
    }

    /// Parse the next record, or `None` after the last one.
    pub async fn next_entry(&mut self) -> Result<Option<EntryDescriptor>> {
        if self.next_index >= self.cd.total_entries {
            return Ok(None);
        }

        self.ensure(CDFH_MIN_SIZE as u64).await?;
        let header = self.slice(CDFH_MIN_SIZE as u64);
        if &header[0..4] != CDFH_SIGNATURE {
            return Err(Error::Format(format!(
                "invalid central directory header for entry {}",
                self.next_index
            )));
        }
        let name_len = u16::from_le_bytes([header[28], header[29]]) as u64;
        let extra_len = u16::from_le_bytes([header[30], header[31]]) as u64;
        let comment_len = u16::from_le_bytes([header[32], header[33]]) as u64;
        let record_len = CDFH_MIN_SIZE as u64 + name_len + extra_len + comment_len;

        self.ensure(record_len).await?;
        let entry = parse_cdfh(self.slice(record_len), self.next_index)?;
        self.pos += record_len;
        self.next_index += 1;
        Ok(Some(entry))
    }

    /// Make sure `[pos, pos + len)` is inside the current window.
    async fn ensure(&mut self, len: u64) -> Result<()> {
        let cd_end = self.cd.offset + self.cd.size;
        if self.pos + len > cd_end {
            return Err(Error::Format(format!(
                "central directory truncated at entry {}",
                self.next_index
            )));
        }
        let window_end = self.window_start + self.window.len() as u64;
        if self.pos >= self.window_start && self.pos + len <= window_end {
            return Ok(());
        }
        let read_end = (self.pos + len.max(CD_WINDOW)).min(cd_end);
        self.window = self
            .parser
            .reader
            .read_range(self.pos, read_end)
            .await?
            .to_vec();
        self.window_start = self.pos;
        Ok(())
    }

    fn slice(&self, len: u64) -> &[u8] {
        let start = (self.pos - self.window_start) as usize;
        &self.window[start..start + len as usize]
    }
}

/// Parse one complete Central Directory File Header record.
fn parse_cdfh(record: &[u8], index: u64) -> Result<EntryDescriptor> {
    let mut cursor = Cursor::new(record);

    // Signature already verified by the caller
    cursor.set_position(4);

    // Read fixed-size header fields
    let _version_made_by = cursor.read_u16::<LittleEndian>()?;
    let _version_needed = cursor.read_u16::<LittleEndian>()?;
    let flags = cursor.read_u16::<LittleEndian>()?;
    let compression_method = cursor.read_u16::<LittleEndian>()?;
    let _last_mod_time = cursor.read_u16::<LittleEndian>()?;
    let _last_mod_date = cursor.read_u16::<LittleEndian>()?;
    let crc32 = cursor.read_u32::<LittleEndian>()?;
    let mut compressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let mut uncompressed_size = cursor.read_u32::<LittleEndian>()? as u64;
    let file_name_length = cursor.read_u16::<LittleEndian>()?;
    let extra_field_length = cursor.read_u16::<LittleEndian>()?;
    let _file_comment_length = cursor.read_u16::<LittleEndian>()?;
    let _disk_number_start = cursor.read_u16::<LittleEndian>()?;
    let _internal_attrs = cursor.read_u16::<LittleEndian>()?;
    let _external_attrs = cursor.read_u32::<LittleEndian>()?;
    let mut lfh_offset = cursor.read_u32::<LittleEndian>()? as u64;

    // Read the variable-length file name
    let mut file_name_bytes = vec![0u8; file_name_length as usize];
    cursor.read_exact(&mut file_name_bytes)?;
    let name = normalize_name(&decode_name(&file_name_bytes, flags));

    // Directory entries end with '/'
    let is_directory = name.ends_with('/');

    // Parse extra field for ZIP64 extended information (header ID 0x0001)
    let extra_field_end = cursor.position() + extra_field_length as u64;

    while cursor.position() + 4 <= extra_field_end {
        let header_id = cursor.read_u16::<LittleEndian>()?;
        let field_size = cursor.read_u16::<LittleEndian>()?;
        let field_end = cursor.position() + field_size as u64;

        if header_id == 0x0001 {
            // Fields are present only if the corresponding header field is 0xFFFFFFFF
            if uncompressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                uncompressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if compressed_size == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                compressed_size = cursor.read_u64::<LittleEndian>()?;
            }
            if lfh_offset == 0xFFFFFFFF && cursor.position() + 8 <= field_end {
                lfh_offset = cursor.read_u64::<LittleEndian>()?;
            }
        }
        cursor.set_position(field_end);
    }

    Ok(EntryDescriptor {
        index,
        name,
        compression_method: CompressionMethod::from_u16(compression_method),
        compressed_size,
        uncompressed_size,
        crc32,
        lfh_offset,
        is_directory,
        is_encrypted: flags & FLAG_ENCRYPTED != 0,
    })
}
