//! CFDP Packet Data Unit (PDU) codec.
//!
//! Every PDU type provides a `from_bytes` constructor which performs strict validation and a
//! [WritablePduPacket] implementation for serialization. Decoding always starts with the
//! [PduHeader], then verifies that the buffer can hold the full PDU and checks the CRC if the
//! header requests one. The [decode] function dispatches on the PDU type and the directive code
//! and returns a fully populated [Pdu].
use crate::util::{ByteConversionError, UnsignedByteField, UnsignedByteFieldU8, UnsignedEnum};
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod ack;
pub mod eof;
pub mod file_data;
pub mod finished;
pub mod metadata;
pub mod nak;

use ack::AckPdu;
use eof::EofPdu;
use file_data::FileDataPdu;
use finished::FinishedPdu;
use metadata::MetadataPdu;
use nak::NakPdu;

pub const CFDP_VERSION_2: u8 = 0b001;

/// CRC algorithm used by the CFDP standard for the optional PDU CRC.
pub const CRC_CCITT_FALSE: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PduType {
    FileDirective = 0,
    FileData = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Direction {
    TowardsReceiver = 0,
    TowardsSender = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransmissionMode {
    Acknowledged = 0,
    Unacknowledged = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CrcFlag {
    NoCrc = 0,
    WithCrc = 1,
}

impl From<bool> for CrcFlag {
    fn from(value: bool) -> Self {
        if value {
            return CrcFlag::WithCrc;
        }
        CrcFlag::NoCrc
    }
}

/// Always 0 and ignored for File Directive PDUs (CCSDS 727.0-B-5 P.75)
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentMetadataFlag {
    NotPresent = 0,
    Present = 1,
}

/// Always 0 and ignored for File Directive PDUs (CCSDS 727.0-B-5 P.75)
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SegmentationControl {
    NoRecordBoundaryPreservation = 0,
    WithRecordBoundaryPreservation = 1,
}

/// Determines whether file sizes and offsets are encoded with 32 bits or with 64 bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LargeFileFlag {
    /// 32 bit maximum file size and FSS size
    Normal = 0,
    /// 64 bit maximum file size and FSS size
    Large = 1,
}

impl LargeFileFlag {
    /// Width of offsets and file sizes in bytes.
    #[inline]
    pub const fn fss_width(&self) -> usize {
        match self {
            LargeFileFlag::Normal => 4,
            LargeFileFlag::Large => 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ConditionCode {
    /// This is not an error condition for which a faulty handler override can be specified
    NoError = 0b0000,
    PositiveAckLimitReached = 0b0001,
    KeepAliveLimitReached = 0b0010,
    InvalidTransmissionMode = 0b0011,
    FilestoreRejection = 0b0100,
    FileChecksumFailure = 0b0101,
    FileSizeError = 0b0110,
    NakLimitReached = 0b0111,
    InactivityDetected = 0b1000,
    InvalidFileStructure = 0b1001,
    CheckLimitReached = 0b1010,
    UnsupportedChecksumType = 0b1011,
    /// This is not an error condition for which a faulty handler override can be specified
    SuspendRequestReceived = 0b1110,
    /// This is not an error condition for which a faulty handler override can be specified
    CancelRequestReceived = 0b1111,
}

/// Checksum types according to the
/// [SANA Checksum Types registry](https://sanaregistry.org/r/checksum_identifiers/)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChecksumType {
    /// Modular legacy checksum
    Modular = 0,
    Crc32Proximity1 = 1,
    Crc32C = 2,
    /// Polynomial: 0x4C11DB7. Preferred checksum for now.
    #[default]
    Crc32 = 3,
    NullChecksum = 15,
}

/// Fault handler actions as specified in chapter 4.8 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FaultHandlerCode {
    NoticeOfCancellation = 0b0001,
    NoticeOfSuspension = 0b0010,
    IgnoreError = 0b0011,
    AbandonTransaction = 0b0100,
}

/// Status of a transaction as reported inside an ACK PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TransactionStatus {
    /// Transaction is not currently active and the CFDP implementation does not retain a
    /// transaction history.
    Undefined = 0b00,
    Active = 0b01,
    /// Transaction was active in the past and was terminated.
    Terminated = 0b10,
    /// The CFDP implementation does retain a tranaction history, and the transaction is not and
    /// never was active at this entity.
    Unrecognized = 0b11,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileDirectiveType {
    EofPdu = 0x04,
    FinishedPdu = 0x05,
    AckPdu = 0x06,
    MetadataPdu = 0x07,
    NakPdu = 0x08,
    PromptPdu = 0x09,
    KeepAlivePdu = 0x0c,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduError {
    /// Target buffer too small during serialization.
    #[error("byte conversion error: {0}")]
    ByteConversion(#[from] ByteConversionError),
    /// Structural decoding failure: truncated buffer, inconsistent length fields or an invalid
    /// field layout.
    #[error("malformed PDU: {0}")]
    MalformedPdu(&'static str),
    /// CRC check failed. Contains the raw 16-bit CRC found in the PDU.
    #[error("CRC mismatch for PDU with checksum {0:#06x}")]
    CrcMismatch(u16),
    #[error("CFDP version missmatch, found {0}, expected {}", CFDP_VERSION_2)]
    CfdpVersionMissmatch(u8),
    /// Invalid length for the entity ID detected. Only the values 1, 2, 4 and 8 are supported.
    #[error("invalid PDU entity ID length {0}, only [1, 2, 4, 8] are allowed")]
    InvalidEntityLen(u8),
    #[error("invalid transaction sequence number length {0}, only [1, 2, 4, 8] are allowed")]
    InvalidTransactionSeqNumLen(u8),
    #[error(
        "missmatch of PDU source ID length {src_id_len} and destination ID length {dest_id_len}"
    )]
    SourceDestIdLenMissmatch {
        src_id_len: usize,
        dest_id_len: usize,
    },
    /// Valid directive code which does not match the PDU type being parsed.
    #[error("wrong directive type, found {found:?}, expected {expected:?}")]
    WrongDirectiveType {
        found: FileDirectiveType,
        expected: FileDirectiveType,
    },
    /// The directive type field contained a value not in the range of permitted values.
    #[error("invalid directive type, found {found:?}, expected {expected:?}")]
    InvalidDirectiveType {
        found: u8,
        expected: Option<FileDirectiveType>,
    },
    #[error("invalid condition code {0}")]
    InvalidConditionCode(u8),
    #[error("invalid checksum type {0}")]
    InvalidChecksumType(u8),
    #[error("value {0} too large for the configured file size field width")]
    FileSizeTooLarge(u64),
    #[error("segment metadata length {0} exceeds the maximum of 63 bytes")]
    SegmentMetadataTooLarge(usize),
    #[error("file name with length {0} exceeds the maximum of 255 bytes")]
    FileNameTooLarge(usize),
    #[error("segment requests are not ascending and non-overlapping")]
    InvalidSegmentRequests,
}

impl PduError {
    /// Returns [true] for every structural decoding failure, which is every error except the
    /// serialization buffer errors and [PduError::CrcMismatch].
    pub fn is_malformed(&self) -> bool {
        !matches!(
            self,
            PduError::ByteConversion(ByteConversionError::ToSliceTooSmall { .. })
                | PduError::CrcMismatch(_)
        )
    }
}

pub trait WritablePduPacket {
    fn len_written(&self) -> usize;
    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError>;
    fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        let mut vec = vec![0; self.len_written()];
        self.write_to_bytes(&mut vec)?;
        Ok(vec)
    }
}

/// Abstraction trait for fields and properties common for all PDUs.
pub trait CfdpPdu {
    fn pdu_header(&self) -> &PduHeader;

    #[inline]
    fn source_id(&self) -> UnsignedByteField {
        self.pdu_header().common_pdu_conf().source_id()
    }

    #[inline]
    fn dest_id(&self) -> UnsignedByteField {
        self.pdu_header().common_pdu_conf().dest_id()
    }

    #[inline]
    fn transaction_seq_num(&self) -> UnsignedByteField {
        self.pdu_header().common_pdu_conf().transaction_seq_num
    }

    #[inline]
    fn transmission_mode(&self) -> TransmissionMode {
        self.pdu_header().common_pdu_conf().trans_mode
    }

    #[inline]
    fn direction(&self) -> Direction {
        self.pdu_header().common_pdu_conf().direction
    }

    #[inline]
    fn crc_flag(&self) -> CrcFlag {
        self.pdu_header().common_pdu_conf().crc_flag
    }

    #[inline]
    fn file_flag(&self) -> LargeFileFlag {
        self.pdu_header().common_pdu_conf().file_flag
    }

    #[inline]
    fn pdu_type(&self) -> PduType {
        self.pdu_header().pdu_type()
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType>;
}

/// Common configuration fields for a PDU.
///
/// Please note that this structure has a custom implementation of [PartialEq] which only
/// compares the values for source entity ID, destination entity ID and transaction sequence
/// number. This permits that those fields can have different widths, as long as the value is the
/// same.
#[derive(Debug, Copy, Clone, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommonPduConfig {
    source_entity_id: UnsignedByteField,
    dest_entity_id: UnsignedByteField,
    pub transaction_seq_num: UnsignedByteField,
    pub trans_mode: TransmissionMode,
    pub file_flag: LargeFileFlag,
    pub crc_flag: CrcFlag,
    pub direction: Direction,
}

#[inline]
fn valid_field_len(len: usize) -> bool {
    matches!(len, 1 | 2 | 4 | 8)
}

impl CommonPduConfig {
    pub fn new(
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
        transaction_seq_num: impl Into<UnsignedByteField>,
        trans_mode: TransmissionMode,
        file_flag: LargeFileFlag,
        crc_flag: CrcFlag,
        direction: Direction,
    ) -> Result<Self, PduError> {
        let (source_id, dest_id) = Self::source_dest_id_check(source_id, dest_id)?;
        let transaction_seq_num = transaction_seq_num.into();
        if !valid_field_len(transaction_seq_num.size()) {
            return Err(PduError::InvalidTransactionSeqNumLen(
                transaction_seq_num.size() as u8,
            ));
        }
        Ok(Self {
            source_entity_id: source_id,
            dest_entity_id: dest_id,
            transaction_seq_num,
            trans_mode,
            file_flag,
            crc_flag,
            direction,
        })
    }

    pub fn new_with_byte_fields(
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
        transaction_seq_num: impl Into<UnsignedByteField>,
    ) -> Result<Self, PduError> {
        Self::new(
            source_id,
            dest_id,
            transaction_seq_num,
            TransmissionMode::Acknowledged,
            LargeFileFlag::Normal,
            CrcFlag::NoCrc,
            Direction::TowardsReceiver,
        )
    }

    #[inline]
    pub fn source_id(&self) -> UnsignedByteField {
        self.source_entity_id
    }

    #[inline]
    pub fn dest_id(&self) -> UnsignedByteField {
        self.dest_entity_id
    }

    fn source_dest_id_check(
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
    ) -> Result<(UnsignedByteField, UnsignedByteField), PduError> {
        let source_id = source_id.into();
        let dest_id = dest_id.into();
        if source_id.size() != dest_id.size() {
            return Err(PduError::SourceDestIdLenMissmatch {
                src_id_len: source_id.size(),
                dest_id_len: dest_id.size(),
            });
        }
        if !valid_field_len(source_id.size()) {
            return Err(PduError::InvalidEntityLen(source_id.size() as u8));
        }
        Ok((source_id, dest_id))
    }

    pub fn set_source_and_dest_id(
        &mut self,
        source_id: impl Into<UnsignedByteField>,
        dest_id: impl Into<UnsignedByteField>,
    ) -> Result<(), PduError> {
        let (source_id, dest_id) = Self::source_dest_id_check(source_id, dest_id)?;
        self.source_entity_id = source_id;
        self.dest_entity_id = dest_id;
        Ok(())
    }
}

impl Default for CommonPduConfig {
    /// The defaults for the source ID, destination ID and the transaction sequence number is the
    /// [UnsignedByteFieldU8] with an intitial value of 0
    fn default() -> Self {
        Self {
            source_entity_id: UnsignedByteFieldU8::new(0).into(),
            dest_entity_id: UnsignedByteFieldU8::new(0).into(),
            transaction_seq_num: UnsignedByteFieldU8::new(0).into(),
            trans_mode: TransmissionMode::Acknowledged,
            file_flag: LargeFileFlag::Normal,
            crc_flag: CrcFlag::NoCrc,
            direction: Direction::TowardsReceiver,
        }
    }
}

impl PartialEq for CommonPduConfig {
    fn eq(&self, other: &Self) -> bool {
        self.source_entity_id.value() == other.source_entity_id.value()
            && self.dest_entity_id.value() == other.dest_entity_id.value()
            && self.transaction_seq_num.value() == other.transaction_seq_num.value()
            && self.trans_mode == other.trans_mode
            && self.file_flag == other.file_flag
            && self.crc_flag == other.crc_flag
            && self.direction == other.direction
    }
}

pub const FIXED_HEADER_LEN: usize = 4;

/// Abstraction for the PDU header common to all CFDP PDUs.
///
/// For detailed information, refer to chapter 5.1 of the CFDP standard.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PduHeader {
    pdu_type: PduType,
    pdu_conf: CommonPduConfig,
    seg_metadata_flag: SegmentMetadataFlag,
    seg_ctrl: SegmentationControl,
    pdu_datafield_len: u16,
}

impl PduHeader {
    pub fn new_for_file_data(
        pdu_conf: CommonPduConfig,
        pdu_datafield_len: u16,
        seg_metadata_flag: SegmentMetadataFlag,
        seg_ctrl: SegmentationControl,
    ) -> Self {
        Self::new_generic(
            PduType::FileData,
            pdu_conf,
            pdu_datafield_len,
            seg_metadata_flag,
            seg_ctrl,
        )
    }

    pub fn new_for_file_directive(pdu_conf: CommonPduConfig, pdu_datafield_len: u16) -> Self {
        Self::new_generic(
            PduType::FileDirective,
            pdu_conf,
            pdu_datafield_len,
            SegmentMetadataFlag::NotPresent,
            SegmentationControl::NoRecordBoundaryPreservation,
        )
    }

    pub fn new_generic(
        pdu_type: PduType,
        pdu_conf: CommonPduConfig,
        pdu_datafield_len: u16,
        seg_metadata_flag: SegmentMetadataFlag,
        seg_ctrl: SegmentationControl,
    ) -> Self {
        Self {
            pdu_type,
            pdu_conf,
            seg_metadata_flag,
            seg_ctrl,
            pdu_datafield_len,
        }
    }

    /// Returns only the length of the PDU header when written to a raw buffer.
    #[inline]
    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN
            + self.pdu_conf.source_entity_id.size()
            + self.pdu_conf.transaction_seq_num.size()
            + self.pdu_conf.dest_entity_id.size()
    }

    #[inline]
    pub fn pdu_datafield_len(&self) -> usize {
        self.pdu_datafield_len.into()
    }

    /// Returns the full length of the PDU when written to a raw buffer, which is the header length
    /// plus the PDU datafield length.
    #[inline]
    pub fn pdu_len(&self) -> usize {
        self.header_len() + self.pdu_datafield_len as usize
    }

    #[inline]
    pub fn pdu_type(&self) -> PduType {
        self.pdu_type
    }

    #[inline]
    pub fn common_pdu_conf(&self) -> &CommonPduConfig {
        &self.pdu_conf
    }

    #[inline]
    pub fn seg_metadata_flag(&self) -> SegmentMetadataFlag {
        self.seg_metadata_flag
    }

    #[inline]
    pub fn seg_ctrl(&self) -> SegmentationControl {
        self.seg_ctrl
    }

    /// Sets the data field length from the length of the data field content, adding the two CRC
    /// bytes if the CRC flag is set.
    pub(crate) fn set_datafield_len_for_content(&mut self, content_len: usize) {
        let mut len = content_len;
        if self.pdu_conf.crc_flag == CrcFlag::WithCrc {
            len += 2;
        }
        self.pdu_datafield_len = len as u16;
    }

    pub fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, ByteConversionError> {
        if buf.len() < self.header_len() {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: self.header_len(),
            });
        }
        let mut current_idx = 0;
        buf[current_idx] = (CFDP_VERSION_2 << 5)
            | ((self.pdu_type as u8) << 4)
            | ((self.pdu_conf.direction as u8) << 3)
            | ((self.pdu_conf.trans_mode as u8) << 2)
            | ((self.pdu_conf.crc_flag as u8) << 1)
            | (self.pdu_conf.file_flag as u8);
        current_idx += 1;
        buf[current_idx..current_idx + 2].copy_from_slice(&self.pdu_datafield_len.to_be_bytes());
        current_idx += 2;
        buf[current_idx] = ((self.seg_ctrl as u8) << 7)
            | (((self.pdu_conf.source_entity_id.size() - 1) as u8) << 4)
            | ((self.seg_metadata_flag as u8) << 3)
            | ((self.pdu_conf.transaction_seq_num.size() - 1) as u8);
        current_idx += 1;
        current_idx += self
            .pdu_conf
            .source_entity_id
            .write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += self
            .pdu_conf
            .transaction_seq_num
            .write_to_be_bytes(&mut buf[current_idx..])?;
        current_idx += self
            .pdu_conf
            .dest_entity_id
            .write_to_be_bytes(&mut buf[current_idx..])?;
        Ok(current_idx)
    }

    /// Parses the header. Returns the header and the header length.
    ///
    /// This function will not verify that the passed buffer can hold the full PDU length and
    /// will not perform the CRC check. Both are done by [Self::verify_length_and_checksum].
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, usize), PduError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(PduError::MalformedPdu("buffer too short for fixed PDU header"));
        }
        let cfdp_version_raw = (buf[0] >> 5) & 0b111;
        if cfdp_version_raw != CFDP_VERSION_2 {
            return Err(PduError::CfdpVersionMissmatch(cfdp_version_raw));
        }
        let pdu_type = if (buf[0] >> 4) & 0b1 == 0 {
            PduType::FileDirective
        } else {
            PduType::FileData
        };
        let direction = if (buf[0] >> 3) & 0b1 == 0 {
            Direction::TowardsReceiver
        } else {
            Direction::TowardsSender
        };
        let trans_mode = if (buf[0] >> 2) & 0b1 == 0 {
            TransmissionMode::Acknowledged
        } else {
            TransmissionMode::Unacknowledged
        };
        let crc_flag = CrcFlag::from((buf[0] >> 1) & 0b1 == 1);
        let file_flag = if buf[0] & 0b1 == 0 {
            LargeFileFlag::Normal
        } else {
            LargeFileFlag::Large
        };
        let pdu_datafield_len = u16::from_be_bytes([buf[1], buf[2]]);
        let seg_ctrl = if (buf[3] >> 7) & 0b1 == 0 {
            SegmentationControl::NoRecordBoundaryPreservation
        } else {
            SegmentationControl::WithRecordBoundaryPreservation
        };
        let expected_len_entity_ids = (((buf[3] >> 4) & 0b111) + 1) as usize;
        if !valid_field_len(expected_len_entity_ids) {
            return Err(PduError::InvalidEntityLen(expected_len_entity_ids as u8));
        }
        let seg_metadata_flag = if (buf[3] >> 3) & 0b1 == 0 {
            SegmentMetadataFlag::NotPresent
        } else {
            SegmentMetadataFlag::Present
        };
        let expected_len_seq_num = ((buf[3] & 0b111) + 1) as usize;
        if !valid_field_len(expected_len_seq_num) {
            return Err(PduError::InvalidTransactionSeqNumLen(
                expected_len_seq_num as u8,
            ));
        }
        let header_len = FIXED_HEADER_LEN + 2 * expected_len_entity_ids + expected_len_seq_num;
        if buf.len() < header_len {
            return Err(PduError::MalformedPdu("buffer too short for PDU header"));
        }
        let mut current_idx = FIXED_HEADER_LEN;
        let mut read_field = |len: usize| -> Result<UnsignedByteField, PduError> {
            let field = UnsignedByteField::new_from_be_bytes(len, &buf[current_idx..])
                .map_err(|_| PduError::MalformedPdu("invalid header field"))?;
            current_idx += len;
            Ok(field)
        };
        let source_id = read_field(expected_len_entity_ids)?;
        let transaction_seq_num = read_field(expected_len_seq_num)?;
        let dest_id = read_field(expected_len_entity_ids)?;
        let pdu_conf = CommonPduConfig::new(
            source_id,
            dest_id,
            transaction_seq_num,
            trans_mode,
            file_flag,
            crc_flag,
            direction,
        )?;
        Ok((
            PduHeader {
                pdu_type,
                pdu_conf,
                seg_metadata_flag,
                seg_ctrl,
                pdu_datafield_len,
            },
            header_len,
        ))
    }

    /// Verifies that the buffer can hold the full length of the PDU parsed from the header, then
    /// verifies the CRC if the CRC flag of the PDU header is set.
    ///
    /// Returns the PDU length excluding the 2 CRC bytes on success. If the CRC flag is not set,
    /// it will simply return the PDU length.
    pub fn verify_length_and_checksum(&self, buf: &[u8]) -> Result<usize, PduError> {
        if buf.len() < self.pdu_len() {
            return Err(PduError::MalformedPdu(
                "buffer shorter than length declared in PDU header",
            ));
        }
        if self.pdu_conf.crc_flag == CrcFlag::WithCrc {
            if self.pdu_datafield_len < 2 {
                return Err(PduError::MalformedPdu("data field too short for CRC"));
            }
            let pdu_len = self.pdu_len();
            let mut digest = CRC_CCITT_FALSE.digest();
            digest.update(&buf[..pdu_len]);
            if digest.finalize() != 0 {
                return Err(PduError::CrcMismatch(u16::from_be_bytes([
                    buf[pdu_len - 2],
                    buf[pdu_len - 1],
                ])));
            }
            return Ok(pdu_len - 2);
        }
        Ok(self.pdu_len())
    }
}

/// Writes a file size or offset with the width determined by the large file flag.
pub(crate) fn write_fss_field(
    file_flag: LargeFileFlag,
    value: u64,
    buf: &mut [u8],
) -> Result<usize, PduError> {
    Ok(if file_flag == LargeFileFlag::Large {
        buf[..8].copy_from_slice(&value.to_be_bytes());
        8
    } else {
        if value > u32::MAX as u64 {
            return Err(PduError::FileSizeTooLarge(value));
        }
        buf[..4].copy_from_slice(&(value as u32).to_be_bytes());
        4
    })
}

/// Reads a file size or offset. The caller must ensure the buffer is large enough.
pub(crate) fn read_fss_field(file_flag: LargeFileFlag, buf: &[u8]) -> (usize, u64) {
    if file_flag == LargeFileFlag::Large {
        let mut raw = [0; 8];
        raw.copy_from_slice(&buf[..8]);
        (8, u64::from_be_bytes(raw))
    } else {
        (4, u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]).into())
    }
}

/// Appends the CRC over all preceding bytes. Returns the new current index.
pub(crate) fn add_pdu_crc(buf: &mut [u8], mut current_idx: usize) -> usize {
    let mut digest = CRC_CCITT_FALSE.digest();
    digest.update(&buf[..current_idx]);
    buf[current_idx..current_idx + 2].copy_from_slice(&digest.finalize().to_be_bytes());
    current_idx += 2;
    current_idx
}

/// Generic length check before serialization.
pub(crate) fn check_target_buf_len(buf: &[u8], expected: usize) -> Result<(), PduError> {
    if buf.len() < expected {
        return Err(ByteConversionError::ToSliceTooSmall {
            found: buf.len(),
            expected,
        }
        .into());
    }
    Ok(())
}

/// Parses the header of a file directive PDU and checks the directive code.
///
/// Returns the header, the index of the first byte after the directive code and the PDU length
/// without the CRC.
pub(crate) fn parse_directive_header(
    buf: &[u8],
    expected: FileDirectiveType,
) -> Result<(PduHeader, usize, usize), PduError> {
    let (pdu_header, header_len) = PduHeader::from_bytes(buf)?;
    let full_len_without_crc = pdu_header.verify_length_and_checksum(buf)?;
    if pdu_header.pdu_type() != PduType::FileDirective {
        return Err(PduError::MalformedPdu("expected file directive PDU"));
    }
    if full_len_without_crc < header_len + 1 {
        return Err(PduError::MalformedPdu("missing directive code"));
    }
    let found = FileDirectiveType::try_from(buf[header_len]).map_err(|_| {
        PduError::InvalidDirectiveType {
            found: buf[header_len],
            expected: Some(expected),
        }
    })?;
    if found != expected {
        return Err(PduError::WrongDirectiveType { found, expected });
    }
    Ok((pdu_header, header_len + 1, full_len_without_crc))
}

/// Any decoded CFDP PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu<'raw> {
    FileData(FileDataPdu<'raw>),
    Metadata(MetadataPdu),
    Eof(EofPdu),
    Finished(FinishedPdu),
    Ack(AckPdu),
    Nak(NakPdu),
    /// Prompt PDU which is recognised but not further decoded.
    Prompt(PduHeader),
    /// Keep Alive PDU which is recognised but not further decoded.
    KeepAlive(PduHeader),
}

impl Pdu<'_> {
    pub fn pdu_header(&self) -> &PduHeader {
        match self {
            Pdu::FileData(pdu) => pdu.pdu_header(),
            Pdu::Metadata(pdu) => pdu.pdu_header(),
            Pdu::Eof(pdu) => pdu.pdu_header(),
            Pdu::Finished(pdu) => pdu.pdu_header(),
            Pdu::Ack(pdu) => pdu.pdu_header(),
            Pdu::Nak(pdu) => pdu.pdu_header(),
            Pdu::Prompt(header) | Pdu::KeepAlive(header) => header,
        }
    }

    /// Encodes the PDU. Prompt and Keep Alive PDUs are not supported for encoding.
    pub fn to_vec(&self) -> Result<Vec<u8>, PduError> {
        match self {
            Pdu::FileData(pdu) => pdu.to_vec(),
            Pdu::Metadata(pdu) => pdu.to_vec(),
            Pdu::Eof(pdu) => pdu.to_vec(),
            Pdu::Finished(pdu) => pdu.to_vec(),
            Pdu::Ack(pdu) => pdu.to_vec(),
            Pdu::Nak(pdu) => pdu.to_vec(),
            Pdu::Prompt(_) => Err(PduError::InvalidDirectiveType {
                found: FileDirectiveType::PromptPdu as u8,
                expected: None,
            }),
            Pdu::KeepAlive(_) => Err(PduError::InvalidDirectiveType {
                found: FileDirectiveType::KeepAlivePdu as u8,
                expected: None,
            }),
        }
    }
}

/// Decodes any supported PDU from a raw buffer.
pub fn decode(buf: &[u8]) -> Result<Pdu<'_>, PduError> {
    let (pdu_header, header_len) = PduHeader::from_bytes(buf)?;
    if pdu_header.pdu_type() == PduType::FileData {
        return Ok(Pdu::FileData(FileDataPdu::from_bytes(buf)?));
    }
    let full_len_without_crc = pdu_header.verify_length_and_checksum(buf)?;
    if full_len_without_crc < header_len + 1 {
        return Err(PduError::MalformedPdu("missing directive code"));
    }
    let directive = FileDirectiveType::try_from(buf[header_len]).map_err(|_| {
        PduError::InvalidDirectiveType {
            found: buf[header_len],
            expected: None,
        }
    })?;
    Ok(match directive {
        FileDirectiveType::EofPdu => Pdu::Eof(EofPdu::from_bytes(buf)?),
        FileDirectiveType::FinishedPdu => Pdu::Finished(FinishedPdu::from_bytes(buf)?),
        FileDirectiveType::AckPdu => Pdu::Ack(AckPdu::from_bytes(buf)?),
        FileDirectiveType::MetadataPdu => Pdu::Metadata(MetadataPdu::from_bytes(buf)?),
        FileDirectiveType::NakPdu => Pdu::Nak(NakPdu::from_bytes(buf)?),
        FileDirectiveType::PromptPdu => Pdu::Prompt(pdu_header),
        FileDirectiveType::KeepAlivePdu => Pdu::KeepAlive(pdu_header),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::{UbfU16, UbfU8, UnsignedByteFieldU32};

    pub(crate) const TEST_SRC_ID: UbfU8 = UbfU8::new(5);
    pub(crate) const TEST_DEST_ID: UbfU8 = UbfU8::new(10);
    pub(crate) const TEST_SEQ_NUM: UbfU8 = UbfU8::new(20);

    pub(crate) fn common_pdu_conf(crc_flag: CrcFlag, fss: LargeFileFlag) -> CommonPduConfig {
        let mut pdu_conf =
            CommonPduConfig::new_with_byte_fields(TEST_SRC_ID, TEST_DEST_ID, TEST_SEQ_NUM)
                .expect("Generating common PDU config");
        pdu_conf.crc_flag = crc_flag;
        pdu_conf.file_flag = fss;
        pdu_conf
    }

    #[test]
    fn test_basic_state() {
        let common_pdu_cfg =
            CommonPduConfig::new_with_byte_fields(UbfU8::new(1), UbfU8::new(2), UbfU8::new(3))
                .expect("common config creation failed");
        let pdu_header = PduHeader::new_for_file_directive(common_pdu_cfg, 5);
        assert_eq!(pdu_header.pdu_type(), PduType::FileDirective);
        assert_eq!(*pdu_header.common_pdu_conf(), common_pdu_cfg);
        assert_eq!(
            pdu_header.seg_metadata_flag(),
            SegmentMetadataFlag::NotPresent
        );
        assert_eq!(pdu_header.pdu_datafield_len(), 5);
        assert_eq!(pdu_header.header_len(), 7);
    }

    #[test]
    fn test_common_pdu_conf_partial_eq() {
        let common_pdu_cfg_0 =
            CommonPduConfig::new_with_byte_fields(UbfU8::new(1), UbfU8::new(2), UbfU8::new(3))
                .expect("common config creation failed");
        let common_pdu_cfg_1 =
            CommonPduConfig::new_with_byte_fields(UbfU16::new(1), UbfU16::new(2), UbfU16::new(3))
                .expect("common config creation failed");
        assert_eq!(common_pdu_cfg_0, common_pdu_cfg_1);
    }

    #[test]
    fn test_src_dest_id_len_missmatch() {
        let error =
            CommonPduConfig::new_with_byte_fields(UbfU8::new(1), UbfU16::new(2), UbfU8::new(3))
                .unwrap_err();
        assert_eq!(
            error,
            PduError::SourceDestIdLenMissmatch {
                src_id_len: 1,
                dest_id_len: 2
            }
        );
    }

    #[test]
    fn test_header_serialization_bit_layout() {
        let mut pdu_conf = CommonPduConfig::new_with_byte_fields(
            UbfU16::new(1),
            UbfU16::new(2),
            UnsignedByteFieldU32::new(0x01020304),
        )
        .unwrap();
        pdu_conf.trans_mode = TransmissionMode::Unacknowledged;
        pdu_conf.crc_flag = CrcFlag::WithCrc;
        pdu_conf.file_flag = LargeFileFlag::Large;
        pdu_conf.direction = Direction::TowardsSender;
        let pdu_header = PduHeader::new_for_file_data(
            pdu_conf,
            0x0105,
            SegmentMetadataFlag::Present,
            SegmentationControl::WithRecordBoundaryPreservation,
        );
        let mut buf: [u8; 16] = [0; 16];
        let written = pdu_header.write_to_bytes(&mut buf).unwrap();
        assert_eq!(written, 12);
        assert_eq!(written, pdu_header.header_len());
        // Version 0b001, file data, towards sender, unacked, CRC, large file.
        assert_eq!(buf[0], 0b0011_1111);
        assert_eq!(&buf[1..3], &[0x01, 0x05]);
        // Segmentation control, entity ID len 2 - 1, segment metadata, seq num len 4 - 1.
        assert_eq!(buf[3], 0b1001_1011);
        assert_eq!(&buf[4..6], &[0, 1]);
        assert_eq!(&buf[6..10], &[1, 2, 3, 4]);
        assert_eq!(&buf[10..12], &[0, 2]);
        let (read_back, header_len) = PduHeader::from_bytes(&buf).unwrap();
        assert_eq!(header_len, 12);
        assert_eq!(read_back, pdu_header);
    }

    #[test]
    fn test_invalid_entity_id_len() {
        let pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        let mut buf: [u8; 7] = [0; 7];
        pdu_header.write_to_bytes(&mut buf).unwrap();
        // Entity ID length raw value 2 means length 3.
        buf[3] |= 0b010 << 4;
        let error = PduHeader::from_bytes(&buf).unwrap_err();
        assert_eq!(error, PduError::InvalidEntityLen(3));
        assert!(error.is_malformed());
    }

    #[test]
    fn test_invalid_version() {
        let pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        let mut buf: [u8; 7] = [0; 7];
        pdu_header.write_to_bytes(&mut buf).unwrap();
        buf[0] &= 0b0001_1111;
        buf[0] |= 0b010 << 5;
        assert_eq!(
            PduHeader::from_bytes(&buf).unwrap_err(),
            PduError::CfdpVersionMissmatch(0b010)
        );
    }

    #[test]
    fn test_header_truncated() {
        let pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        let mut buf: [u8; 7] = [0; 7];
        pdu_header.write_to_bytes(&mut buf).unwrap();
        assert!(matches!(
            PduHeader::from_bytes(&buf[0..6]).unwrap_err(),
            PduError::MalformedPdu(_)
        ));
        assert!(matches!(
            PduHeader::from_bytes(&buf[0..3]).unwrap_err(),
            PduError::MalformedPdu(_)
        ));
    }

    #[test]
    fn test_header_target_buf_too_small() {
        let pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        let mut buf: [u8; 6] = [0; 6];
        let error = pdu_header.write_to_bytes(&mut buf).unwrap_err();
        assert_eq!(
            error,
            ByteConversionError::ToSliceTooSmall {
                found: 6,
                expected: 7
            }
        );
    }

    #[test]
    fn test_decode_unknown_directive() {
        let mut pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        pdu_header.set_datafield_len_for_content(1);
        let mut buf: [u8; 8] = [0; 8];
        pdu_header.write_to_bytes(&mut buf).unwrap();
        buf[7] = 0x0F;
        let error = decode(&buf).unwrap_err();
        assert_eq!(
            error,
            PduError::InvalidDirectiveType {
                found: 0x0F,
                expected: None
            }
        );
        assert!(error.is_malformed());
    }

    #[test]
    fn test_decode_prompt_pdu_recognised() {
        let mut pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(CrcFlag::NoCrc, LargeFileFlag::Normal), 0);
        pdu_header.set_datafield_len_for_content(2);
        let mut buf: [u8; 9] = [0; 9];
        pdu_header.write_to_bytes(&mut buf).unwrap();
        buf[7] = FileDirectiveType::PromptPdu as u8;
        let pdu = decode(&buf).unwrap();
        assert_eq!(pdu, Pdu::Prompt(pdu_header));
        assert!(pdu.to_vec().is_err());
    }

    #[test]
    fn test_crc_flag_from_bool() {
        assert_eq!(CrcFlag::from(true), CrcFlag::WithCrc);
        assert_eq!(CrcFlag::from(false), CrcFlag::NoCrc);
    }

    #[test]
    fn test_condition_code_conversion() {
        assert_eq!(
            ConditionCode::try_from(0b1010).unwrap(),
            ConditionCode::CheckLimitReached
        );
        assert!(ConditionCode::try_from(0b1100).is_err());
    }
}
