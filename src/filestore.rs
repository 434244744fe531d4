//! Virtual filestore abstraction used by the CFDP handlers together with a native
//! implementation which uses the [std::fs] API.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::pdu::ChecksumType;
use crate::util::ByteConversionError;
use crate::{CRC_32, CRC_32C};

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file {0} does not exist")]
    FileDoesNotExist(String),
    #[error("{0} is not a regular file")]
    IsNotFile(String),
    #[error("byte conversion: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("checksum type not implemented: {0:?}")]
    ChecksumTypeNotImplemented(ChecksumType),
    #[error("path is not valid UTF-8")]
    Utf8Error,
}

/// File operations required by the source and destination handlers.
pub trait VirtualFilestore {
    /// Creates an empty file. An existing file is truncated.
    fn create_file(&self, path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, path: &str) -> Result<(), FilestoreError>;

    /// Fills the whole buffer with file data starting at the given offset.
    fn read_data(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<(), FilestoreError>;

    /// Writes the data at the given offset. Writing past the end of the file zero-fills the gap.
    fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError>;

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError>;

    /// Last component of the path, similar to [std::path::Path::file_name].
    fn file_name<'a>(&self, path: &'a str) -> Result<Option<&'a str>, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Calculates the CFDP checksum over the first `size_to_verify` bytes of a file, which
    /// allows calculating the checksum over the progress of a cancelled transaction.
    ///
    /// The file is read in chunks of the size of the verification buffer.
    fn calculate_checksum(
        &self,
        path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    fn checksum_verify(
        &self,
        expected_checksum: u32,
        path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        let checksum =
            self.calculate_checksum(path, checksum_type, size_to_verify, verification_buf)?;
        Ok(checksum == expected_checksum)
    }
}

/// Modular checksum as specified in chapter 4.2.2 of the CFDP standard. The file data is
/// summed up as big endian 32-bit words and a trailing partial word is padded with zeros.
#[derive(Debug, Default)]
struct ModularChecksum {
    sum: u32,
    word: [u8; 4],
    word_len: usize,
}

impl ModularChecksum {
    fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let chunk_len = (4 - self.word_len).min(data.len());
            self.word[self.word_len..self.word_len + chunk_len].copy_from_slice(&data[..chunk_len]);
            self.word_len += chunk_len;
            data = &data[chunk_len..];
            if self.word_len == 4 {
                self.sum = self.sum.wrapping_add(u32::from_be_bytes(self.word));
                self.word_len = 0;
            }
        }
    }

    fn finalize(mut self) -> u32 {
        if self.word_len > 0 {
            self.word[self.word_len..].fill(0);
            self.sum = self.sum.wrapping_add(u32::from_be_bytes(self.word));
        }
        self.sum
    }
}

#[derive(Default, Debug, Copy, Clone)]
pub struct NativeFilestore {}

impl NativeFilestore {
    fn map_io_error(path: &str, error: io::Error) -> FilestoreError {
        if error.kind() == io::ErrorKind::NotFound {
            return FilestoreError::FileDoesNotExist(path.to_string());
        }
        FilestoreError::Io(error)
    }

    fn open(&self, path: &str, options: &OpenOptions) -> Result<File, FilestoreError> {
        if Path::new(path).is_dir() {
            return Err(FilestoreError::IsNotFile(path.to_string()));
        }
        options.open(path).map_err(|e| Self::map_io_error(path, e))
    }

    /// Passes at most `size` bytes of the file to the consumer, one buffer at a time.
    fn read_chunks(
        &self,
        path: &str,
        size: u64,
        buf: &mut [u8],
        mut consumer: impl FnMut(&[u8]),
    ) -> Result<(), FilestoreError> {
        if size == 0 {
            return Ok(());
        }
        if buf.is_empty() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: 0,
                expected: 1,
            }
            .into());
        }
        let mut reader = self.open(path, OpenOptions::new().read(true))?.take(size);
        loop {
            let bytes_read = reader.read(buf)?;
            if bytes_read == 0 {
                return Ok(());
            }
            consumer(&buf[..bytes_read]);
        }
    }
}

impl VirtualFilestore for NativeFilestore {
    fn create_file(&self, path: &str) -> Result<(), FilestoreError> {
        self.open(
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        Ok(())
    }

    fn remove_file(&self, path: &str) -> Result<(), FilestoreError> {
        if Path::new(path).is_dir() {
            return Err(FilestoreError::IsNotFile(path.to_string()));
        }
        fs::remove_file(path).map_err(|e| Self::map_io_error(path, e))
    }

    fn read_data(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<(), FilestoreError> {
        let mut file = self.open(path, OpenOptions::new().read(true))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), FilestoreError> {
        let mut file = self.open(path, OpenOptions::new().write(true))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(Path::new(path).try_exists()?)
    }

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(Path::new(path).is_dir())
    }

    fn file_name<'a>(&self, path: &'a str) -> Result<Option<&'a str>, FilestoreError> {
        Path::new(path)
            .file_name()
            .map(|name| name.to_str().ok_or(FilestoreError::Utf8Error))
            .transpose()
    }

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError> {
        let metadata = fs::metadata(path).map_err(|e| Self::map_io_error(path, e))?;
        if !metadata.is_file() {
            return Err(FilestoreError::IsNotFile(path.to_string()));
        }
        Ok(metadata.len())
    }

    fn calculate_checksum(
        &self,
        path: &str,
        checksum_type: ChecksumType,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        let checksum = match checksum_type {
            ChecksumType::Modular => {
                let mut modular = ModularChecksum::default();
                self.read_chunks(path, size_to_verify, verification_buf, |chunk| {
                    modular.update(chunk)
                })?;
                modular.finalize()
            }
            ChecksumType::Crc32 | ChecksumType::Crc32C => {
                let crc = if checksum_type == ChecksumType::Crc32 {
                    CRC_32
                } else {
                    CRC_32C
                };
                let mut digest = crc.digest();
                self.read_chunks(path, size_to_verify, verification_buf, |chunk| {
                    digest.update(chunk)
                })?;
                digest.finalize()
            }
            ChecksumType::NullChecksum => 0,
            _ => return Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)),
        };
        log::debug!(
            "{:?} checksum over {} bytes of {}: {:#010x}",
            checksum_type,
            size_to_verify,
            path,
            checksum
        );
        Ok(checksum)
    }
}
