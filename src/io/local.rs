use super::ReadAt;
use crate::error::Result;
use async_trait::async_trait;
use std::fs::File;

/// Local file reader with random access support
pub struct LocalFileReader {
    file: File,
    size: u64,
}

impl LocalFileReader {
    pub fn from_file(file: File) -> Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }

    pub(crate) fn pread_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file.read_at(buf, offset)
        }

        #[cfg(windows)]
        {
            // seek_read moves the cursor, but every read here is positional
            use std::os::windows::fs::FileExt;
            self.file.seek_read(buf, offset)
        }
    }
}

#[async_trait]
impl ReadAt for LocalFileReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        Ok(self.pread_at(offset, buf)?)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_ranges_from_disk() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"0123456789").unwrap();
        let reader = LocalFileReader::from_file(file).unwrap();

        assert_eq!(reader.size(), 10);
        assert_eq!(&reader.read_range(3, 7).await.unwrap()[..], b"3456");
        assert_eq!(&reader.read_range(10, 10).await.unwrap()[..], b"");
        assert!(reader.read_range(8, 11).await.is_err());

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(12, &mut buf).await.unwrap(), 0);
    }
}
