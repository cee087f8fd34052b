//! Append-mostly payload storage for one period.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::store::codec::{self, DATA_HEADER_LEN};
use crate::store::error::{StoreError, StoreResult};

/// Blob file holding chunk payloads back to back after a fixed header.
///
/// Offsets handed out by [`DataFile::append`] are absolute file positions
/// and are recorded in the paired index. The file is only ever appended
/// to, or overwritten at an existing slot with same-length data, so
/// offsets already published in an index stay valid.
#[derive(Debug)]
pub struct DataFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl DataFile {
    /// Open a data file, creating and initializing it when missing and
    /// `create_if_missing` is set.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() && !create_if_missing {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("data file {} does not exist", path.display()),
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(&codec::encode_data_header())?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                len: DATA_HEADER_LEN as u64,
            });
        }
        let mut header = [0u8; DATA_HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header).map_err(|_| {
            StoreError::CorruptIndex(format!(
                "data file {} is shorter than its header",
                path.display()
            ))
        })?;
        codec::decode_data_header(&header)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length in bytes, header included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when no payload has ever been appended.
    pub fn is_empty(&self) -> bool {
        self.len <= DATA_HEADER_LEN as u64
    }

    /// Append a payload at end of file, returning its absolute offset.
    pub fn append(&mut self, bytes: &[u8]) -> StoreResult<u32> {
        let offset = self.len;
        if offset + bytes.len() as u64 > u32::MAX as u64 {
            return Err(StoreError::Range(format!(
                "data file {} would exceed the 4 GiB offset limit",
                self.path.display()
            )));
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)?;
        self.len += bytes.len() as u64;
        Ok(offset as u32)
    }

    /// Read `len` payload bytes at `offset`.
    pub fn read_at(&mut self, offset: u32, len: u32) -> StoreResult<Vec<u8>> {
        self.check_slot(offset, len)?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Overwrite an existing slot with a same-length replacement.
    pub fn overwrite_at(&mut self, offset: u32, bytes: &[u8]) -> StoreResult<()> {
        self.check_slot(offset, bytes.len() as u32)?;
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Flush written payloads to disk. Called before an index referencing
    /// them is published.
    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn check_slot(&self, offset: u32, len: u32) -> StoreResult<()> {
        let start = offset as u64;
        let end = start + len as u64;
        if start < DATA_HEADER_LEN as u64 || end > self.len {
            return Err(StoreError::Range(format!(
                "slot {}..{} outside data file {} ({} bytes)",
                start,
                end,
                self.path.display(),
                self.len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn create_append_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");

        let mut data = DataFile::open(&path, true).unwrap();
        assert!(data.is_empty());
        let a = data.append(b"first payload").unwrap();
        let b = data.append(b"second").unwrap();
        assert_eq!(a, DATA_HEADER_LEN as u32);
        assert!(b > a);

        assert_eq!(data.read_at(a, 13).unwrap(), b"first payload");
        assert_eq!(data.read_at(b, 6).unwrap(), b"second");
    }

    #[test]
    fn reopen_keeps_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");

        let offset = {
            let mut data = DataFile::open(&path, true).unwrap();
            let offset = data.append(b"persisted").unwrap();
            data.sync().unwrap();
            offset
        };

        let mut data = DataFile::open(&path, false).unwrap();
        assert_eq!(data.read_at(offset, 9).unwrap(), b"persisted");
    }

    #[test]
    fn missing_file_without_create_is_not_found() {
        let dir = tempdir().unwrap();
        let err = DataFile::open(&dir.path().join("absent.data"), false).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn read_past_end_is_range_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");

        let mut data = DataFile::open(&path, true).unwrap();
        let offset = data.append(b"abc").unwrap();
        assert!(matches!(
            data.read_at(offset, 4),
            Err(StoreError::Range(_))
        ));
        assert!(matches!(
            data.read_at(data.len() as u32, 1),
            Err(StoreError::Range(_))
        ));
    }

    #[test]
    fn overwrite_same_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");

        let mut data = DataFile::open(&path, true).unwrap();
        let offset = data.append(b"AAAA").unwrap();
        let len_before = data.len();
        data.overwrite_at(offset, b"BBBB").unwrap();
        assert_eq!(data.len(), len_before);
        assert_eq!(data.read_at(offset, 4).unwrap(), b"BBBB");
    }

    #[test]
    fn overwrite_outside_file_is_range_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");

        let mut data = DataFile::open(&path, true).unwrap();
        data.append(b"abc").unwrap();
        // Slot inside the header.
        assert!(matches!(
            data.overwrite_at(0, b"xx"),
            Err(StoreError::Range(_))
        ));
    }

    #[test]
    fn garbage_header_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chunks.data");
        fs::write(&path, b"not a data file").unwrap();

        assert!(matches!(
            DataFile::open(&path, false),
            Err(StoreError::CorruptIndex(_))
        ));
    }
}
