mod local;

pub use local::LocalFileReader;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result};

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Read exactly the bytes `[start, end)`
    async fn read_range(&self, start: u64, end: u64) -> Result<Bytes> {
        if start > end || end > self.size() {
            return Err(Error::InvalidRange { start, end });
        }
        let mut buf = vec![0u8; (end - start) as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(start + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(Error::Format(format!(
                    "unexpected end of data at offset {}",
                    start + filled as u64
                )));
            }
            filled += n;
        }
        Ok(Bytes::from(buf))
    }
}
