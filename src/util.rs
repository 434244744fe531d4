//! Variable-width unsigned byte fields used for entity IDs and transaction sequence numbers.
use core::fmt::Debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Generic error for byte buffer conversions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ByteConversionError {
    /// The passed slice is too small. Returns the passed slice length and expected minimum size
    #[error("target slice with size {found} is too small, expected size of at least {expected}")]
    ToSliceTooSmall { found: usize, expected: usize },
    /// The provider buffer is too small. Returns the passed slice length and expected minimum size
    #[error("source slice with size {found} too small, expected at least {expected} bytes")]
    FromSliceTooSmall { found: usize, expected: usize },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UnsignedByteFieldError {
    /// Value is too large for specified width of byte field.
    #[error("value {value} too large for width {width}")]
    ValueTooLargeForWidth { width: usize, value: u64 },
    /// Only 1, 2, 4 and 8 are allow width values. Optionally contains the expected width if
    /// applicable, for example for conversions.
    #[error("invalid width {found}, expected {expected:?}")]
    InvalidWidth {
        found: usize,
        expected: Option<usize>,
    },
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
}

pub trait UnsignedEnum {
    /// Size of the unsigned enumeration in bytes.
    fn size(&self) -> usize;
    /// Write the unsigned enumeration to a raw buffer. Returns the written size on success.
    fn write_to_be_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError>;

    fn value(&self) -> u64;

    fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0; self.size()];
        // The buffer always has the correct size.
        let _ = self.write_to_be_bytes(&mut buf);
        buf
    }
}

/// Type erased unsigned byte field. The width can be 1, 2, 4 or 8 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UnsignedByteField {
    width: usize,
    value: u64,
}

impl UnsignedByteField {
    #[inline]
    pub const fn new(width: usize, value: u64) -> Self {
        Self { width, value }
    }

    /// Checked constructor which verifies the width and that the value fits into it.
    pub fn new_checked(width: usize, value: u64) -> Result<Self, UnsignedByteFieldError> {
        let max = match width {
            1 => u8::MAX as u64,
            2 => u16::MAX as u64,
            4 => u32::MAX as u64,
            8 => u64::MAX,
            _ => {
                return Err(UnsignedByteFieldError::InvalidWidth {
                    found: width,
                    expected: None,
                })
            }
        };
        if value > max {
            return Err(UnsignedByteFieldError::ValueTooLargeForWidth { width, value });
        }
        Ok(Self::new(width, value))
    }

    #[inline]
    pub const fn value_const(&self) -> u64 {
        self.value
    }

    pub fn new_from_be_bytes(width: usize, buf: &[u8]) -> Result<Self, UnsignedByteFieldError> {
        if width > buf.len() {
            return Err(ByteConversionError::FromSliceTooSmall {
                expected: width,
                found: buf.len(),
            }
            .into());
        }
        let value = match width {
            1 => buf[0] as u64,
            2 => u16::from_be_bytes([buf[0], buf[1]]) as u64,
            4 => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            8 => {
                let mut raw = [0; 8];
                raw.copy_from_slice(&buf[0..8]);
                u64::from_be_bytes(raw)
            }
            _ => {
                return Err(UnsignedByteFieldError::InvalidWidth {
                    found: width,
                    expected: None,
                })
            }
        };
        Ok(Self::new(width, value))
    }
}

impl UnsignedEnum for UnsignedByteField {
    #[inline]
    fn size(&self) -> usize {
        self.width
    }

    #[inline]
    fn value(&self) -> u64 {
        self.value_const()
    }

    fn write_to_be_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.size() {
            return Err(ByteConversionError::ToSliceTooSmall {
                expected: self.size(),
                found: buf.len(),
            });
        }
        // Big endian representation: the relevant bytes are the last `width` bytes.
        let raw = self.value.to_be_bytes();
        buf[..self.width].copy_from_slice(&raw[8 - self.width..]);
        Ok(self.width)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GenericUnsignedByteField<TYPE: Copy + Into<u64>> {
    value: TYPE,
}

impl<TYPE: Copy + Into<u64>> GenericUnsignedByteField<TYPE> {
    pub const fn new(val: TYPE) -> Self {
        Self { value: val }
    }

    pub const fn value_typed(&self) -> TYPE {
        self.value
    }
}

impl<TYPE: Copy + Into<u64>> UnsignedEnum for GenericUnsignedByteField<TYPE> {
    #[inline]
    fn size(&self) -> usize {
        core::mem::size_of::<TYPE>()
    }

    fn write_to_be_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        UnsignedByteField::new(self.size(), self.value()).write_to_be_bytes(buf)
    }

    #[inline]
    fn value(&self) -> u64 {
        self.value.into()
    }
}

pub type UnsignedByteFieldU8 = GenericUnsignedByteField<u8>;
pub type UnsignedByteFieldU16 = GenericUnsignedByteField<u16>;
pub type UnsignedByteFieldU32 = GenericUnsignedByteField<u32>;
pub type UnsignedByteFieldU64 = GenericUnsignedByteField<u64>;

pub type UbfU8 = UnsignedByteFieldU8;
pub type UbfU16 = UnsignedByteFieldU16;
pub type UbfU32 = UnsignedByteFieldU32;
pub type UbfU64 = UnsignedByteFieldU64;

macro_rules! typed_byte_field_conversions {
    ($typed:ty, $raw:ty, $width:literal) => {
        impl From<$typed> for UnsignedByteField {
            #[inline]
            fn from(value: $typed) -> Self {
                Self::new($width, value.value_typed() as u64)
            }
        }

        impl TryFrom<UnsignedByteField> for $typed {
            type Error = UnsignedByteFieldError;

            #[inline]
            fn try_from(value: UnsignedByteField) -> Result<Self, Self::Error> {
                if value.width != $width {
                    return Err(UnsignedByteFieldError::InvalidWidth {
                        found: value.width,
                        expected: Some($width),
                    });
                }
                Ok(Self::new(value.value as $raw))
            }
        }
    };
}

typed_byte_field_conversions!(UnsignedByteFieldU8, u8, 1);
typed_byte_field_conversions!(UnsignedByteFieldU16, u16, 2);
typed_byte_field_conversions!(UnsignedByteFieldU32, u32, 4);
typed_byte_field_conversions!(UnsignedByteFieldU64, u64, 8);
