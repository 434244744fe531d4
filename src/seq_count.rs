//! Transaction sequence number generation.
//!
//! Every provider wraps around to 0 after reaching `2^N - 1`, where `N` is the configured bit
//! width. The [FileSeqCountProvider] persists the counter in a text file and re-reads it on every
//! access, so deleting or corrupting the file while the entity is running is detected.
use core::cell::Cell;
use std::path::{Path, PathBuf};

use crate::util::UnsignedByteField;

/// Bit width used by the file backed provider unless configured otherwise.
pub const DEFAULT_SEQ_COUNT_BIT_WIDTH: u8 = 14;

#[derive(Debug, thiserror::Error)]
pub enum SeqCountError {
    /// The backing store vanished between calls.
    #[error("sequence count file {0} not found")]
    NotFound(PathBuf),
    /// The stored value is negative or does not fit into the configured bit width.
    #[error("stored sequence count {value} out of range for bit width {bit_width}")]
    OutOfRange { value: i128, bit_width: u8 },
    #[error("invalid sequence count file content: {0:?}")]
    InvalidContent(String),
    #[error("invalid bit width {0}, must be in range 1..=64")]
    InvalidBitWidth(u8),
    #[error("sequence count file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Core trait for objects which can provide a sequence count.
///
/// The functions are not mutable so the providers can be shared using the interior mutability
/// pattern.
pub trait SequenceCountProvider {
    /// Maximum bit width N. All values are in the range `[0, 2^N - 1]`.
    fn max_bit_width(&self) -> u8;

    fn get(&self) -> Result<u64, SeqCountError>;

    /// Returns the current value and advances the counter, wrapping to 0 after `2^N - 1`.
    fn get_and_increment(&self) -> Result<u64, SeqCountError>;

    fn increment(&self) -> Result<(), SeqCountError> {
        self.get_and_increment().map(|_| ())
    }

    /// Width of the sequence number field in bytes required to hold all values.
    fn byte_width(&self) -> usize {
        match self.max_bit_width() {
            0..=8 => 1,
            9..=16 => 2,
            17..=32 => 4,
            _ => 8,
        }
    }

    /// Convenience function which returns the current value as an [UnsignedByteField] and
    /// advances the counter.
    fn next_byte_field(&self) -> Result<UnsignedByteField, SeqCountError> {
        let value = self.get_and_increment()?;
        Ok(UnsignedByteField::new(self.byte_width(), value))
    }
}

#[inline]
fn max_value_for_width(bit_width: u8) -> u64 {
    if bit_width >= 64 {
        return u64::MAX;
    }
    (1 << bit_width) - 1
}

fn check_bit_width(bit_width: u8) -> Result<(), SeqCountError> {
    if bit_width == 0 || bit_width > 64 {
        return Err(SeqCountError::InvalidBitWidth(bit_width));
    }
    Ok(())
}

/// In-memory sequence counter.
#[derive(Debug, Clone)]
pub struct SeqCountProviderSimple {
    seq_count: Cell<u64>,
    bit_width: u8,
}

impl SeqCountProviderSimple {
    pub fn new(bit_width: u8) -> Result<Self, SeqCountError> {
        check_bit_width(bit_width)?;
        Ok(Self {
            seq_count: Cell::new(0),
            bit_width,
        })
    }
}

impl Default for SeqCountProviderSimple {
    fn default() -> Self {
        Self {
            seq_count: Cell::new(0),
            bit_width: 16,
        }
    }
}

impl SequenceCountProvider for SeqCountProviderSimple {
    fn max_bit_width(&self) -> u8 {
        self.bit_width
    }

    fn get(&self) -> Result<u64, SeqCountError> {
        Ok(self.seq_count.get())
    }

    fn get_and_increment(&self) -> Result<u64, SeqCountError> {
        let curr_count = self.seq_count.get();
        if curr_count >= max_value_for_width(self.bit_width) {
            self.seq_count.set(0);
        } else {
            self.seq_count.set(curr_count + 1);
        }
        Ok(curr_count)
    }
}

/// Sequence counter persisted as a single line holding the decimal counter value.
#[derive(Debug, Clone)]
pub struct FileSeqCountProvider {
    path: PathBuf,
    bit_width: u8,
}

impl FileSeqCountProvider {
    /// Creates the provider with the default bit width. The file is created with an initial
    /// value of 0 if it does not exist yet.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SeqCountError> {
        Self::new_with_bit_width(path, DEFAULT_SEQ_COUNT_BIT_WIDTH)
    }

    pub fn new_with_bit_width(path: impl AsRef<Path>, bit_width: u8) -> Result<Self, SeqCountError> {
        check_bit_width(bit_width)?;
        let provider = Self {
            path: path.as_ref().to_path_buf(),
            bit_width,
        };
        if !provider.path.exists() {
            log::debug!(
                "creating sequence count file {} with initial value 0",
                provider.path.display()
            );
            provider.write(0)?;
        }
        Ok(provider)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn wrapping_next(&self, value: u64) -> u64 {
        if value >= max_value_for_width(self.bit_width) {
            return 0;
        }
        value + 1
    }

    fn read(&self) -> Result<u64, SeqCountError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SeqCountError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let trimmed = content.trim();
        let value: i128 = trimmed
            .parse()
            .map_err(|_| SeqCountError::InvalidContent(trimmed.to_string()))?;
        if value < 0 || value > max_value_for_width(self.bit_width) as i128 {
            return Err(SeqCountError::OutOfRange {
                value,
                bit_width: self.bit_width,
            });
        }
        Ok(value as u64)
    }

    fn write(&self, value: u64) -> Result<(), SeqCountError> {
        std::fs::write(&self.path, format!("{value}\n"))?;
        Ok(())
    }
}

impl SequenceCountProvider for FileSeqCountProvider {
    fn max_bit_width(&self) -> u8 {
        self.bit_width
    }

    fn get(&self) -> Result<u64, SeqCountError> {
        self.read()
    }

    fn get_and_increment(&self) -> Result<u64, SeqCountError> {
        let current = self.read()?;
        self.write(self.wrapping_next(current))?;
        Ok(current)
    }
}
