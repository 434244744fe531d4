use super::{
    add_pdu_crc, check_target_buf_len, read_fss_field, write_fss_field, CfdpPdu, CrcFlag,
    FileDirectiveType, PduError, PduHeader, PduType, SegmentMetadataFlag, WritablePduPacket,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const MAX_SEG_METADATA_LEN: usize = 63;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecordContinuationState {
    NoStartNoEnd = 0b00,
    StartWithoutEnd = 0b01,
    EndWithoutStart = 0b10,
    StartAndEnd = 0b11,
}

/// Optional segment metadata which can be attached to file data PDUs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentMetadata<'seg_meta> {
    record_continuation_state: RecordContinuationState,
    metadata: &'seg_meta [u8],
}

impl<'seg_meta> SegmentMetadata<'seg_meta> {
    /// Returns [None] if the metadata is longer than 63 bytes.
    pub fn new(
        record_continuation_state: RecordContinuationState,
        metadata: &'seg_meta [u8],
    ) -> Option<Self> {
        if metadata.len() > MAX_SEG_METADATA_LEN {
            return None;
        }
        Some(Self {
            record_continuation_state,
            metadata,
        })
    }

    pub fn record_continuation_state(&self) -> RecordContinuationState {
        self.record_continuation_state
    }

    pub fn metadata(&self) -> &'seg_meta [u8] {
        self.metadata
    }

    pub fn len_written(&self) -> usize {
        1 + self.metadata.len()
    }

    pub(crate) fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        buf[0] = ((self.record_continuation_state as u8) << 6) | self.metadata.len() as u8;
        buf[1..1 + self.metadata.len()].copy_from_slice(self.metadata);
        Ok(self.len_written())
    }

    pub(crate) fn from_bytes(buf: &'seg_meta [u8]) -> Result<Self, PduError> {
        if buf.is_empty() {
            return Err(PduError::MalformedPdu("missing segment metadata"));
        }
        let record_continuation_state = RecordContinuationState::try_from((buf[0] & 0xC0) >> 6)
            .map_err(|_| PduError::MalformedPdu("invalid record continuation state"))?;
        let seg_metadata_len = (buf[0] & 0x3F) as usize;
        if buf.len() < 1 + seg_metadata_len {
            return Err(PduError::MalformedPdu("segment metadata truncated"));
        }
        Ok(Self {
            record_continuation_state,
            metadata: &buf[1..1 + seg_metadata_len],
        })
    }
}

/// File Data PDU abstraction.
///
/// For more information, refer to CFDP chapter 5.3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu<'data> {
    pdu_header: PduHeader,
    segment_metadata: Option<SegmentMetadata<'data>>,
    offset: u64,
    file_data: &'data [u8],
}

impl<'data> FileDataPdu<'data> {
    pub fn new_with_seg_metadata(
        pdu_header: PduHeader,
        segment_metadata: SegmentMetadata<'data>,
        offset: u64,
        file_data: &'data [u8],
    ) -> Self {
        Self::new_generic(pdu_header, Some(segment_metadata), offset, file_data)
    }

    pub fn new_no_seg_metadata(pdu_header: PduHeader, offset: u64, file_data: &'data [u8]) -> Self {
        Self::new_generic(pdu_header, None, offset, file_data)
    }

    fn new_generic(
        mut pdu_header: PduHeader,
        segment_metadata: Option<SegmentMetadata<'data>>,
        offset: u64,
        file_data: &'data [u8],
    ) -> Self {
        pdu_header.pdu_type = PduType::FileData;
        pdu_header.seg_metadata_flag = if segment_metadata.is_some() {
            SegmentMetadataFlag::Present
        } else {
            SegmentMetadataFlag::NotPresent
        };
        let mut pdu = Self {
            pdu_header,
            segment_metadata,
            offset,
            file_data,
        };
        let content_len = pdu.calc_content_len();
        pdu.pdu_header.set_datafield_len_for_content(content_len);
        pdu
    }

    fn calc_content_len(&self) -> usize {
        let mut len = self.pdu_header.pdu_conf.file_flag.fss_width();
        if let Some(segment_metadata) = self.segment_metadata {
            len += segment_metadata.len_written();
        }
        len + self.file_data.len()
    }

    pub fn segment_metadata(&self) -> Option<&SegmentMetadata<'data>> {
        self.segment_metadata.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn file_data(&self) -> &'data [u8] {
        self.file_data
    }

    pub fn from_bytes(buf: &'data [u8]) -> Result<Self, PduError> {
        let (pdu_header, mut current_idx) = PduHeader::from_bytes(buf)?;
        let full_len_without_crc = pdu_header.verify_length_and_checksum(buf)?;
        if pdu_header.pdu_type != PduType::FileData {
            return Err(PduError::MalformedPdu("expected file data PDU"));
        }
        let mut segment_metadata = None;
        if pdu_header.seg_metadata_flag == SegmentMetadataFlag::Present {
            let seg_metadata =
                SegmentMetadata::from_bytes(&buf[current_idx..full_len_without_crc])?;
            current_idx += seg_metadata.len_written();
            segment_metadata = Some(seg_metadata);
        }
        let fss_width = pdu_header.pdu_conf.file_flag.fss_width();
        if current_idx + fss_width > full_len_without_crc {
            return Err(PduError::MalformedPdu("file data PDU too short for offset"));
        }
        let (fss_len, offset) = read_fss_field(pdu_header.pdu_conf.file_flag, &buf[current_idx..]);
        current_idx += fss_len;
        Ok(Self {
            pdu_header,
            segment_metadata,
            offset,
            file_data: &buf[current_idx..full_len_without_crc],
        })
    }
}

impl CfdpPdu for FileDataPdu<'_> {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        None
    }
}

impl WritablePduPacket for FileDataPdu<'_> {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        if let Some(segment_metadata) = self.segment_metadata {
            current_idx += segment_metadata.write_to_bytes(&mut buf[current_idx..])?;
        }
        current_idx += write_fss_field(
            self.pdu_header.pdu_conf.file_flag,
            self.offset,
            &mut buf[current_idx..],
        )?;
        buf[current_idx..current_idx + self.file_data.len()].copy_from_slice(self.file_data);
        current_idx += self.file_data.len();
        if self.pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
            current_idx = add_pdu_crc(buf, current_idx);
        }
        Ok(current_idx)
    }
}

/// Calculates the maximum file segment length which still fits into a PDU of the given maximum
/// packet length. Returns 0 if not even the PDU overhead fits.
pub fn max_file_segment_len(
    pdu_header: &PduHeader,
    max_packet_len: usize,
    segment_metadata: Option<&SegmentMetadata>,
) -> usize {
    let mut overhead = pdu_header.header_len() + pdu_header.pdu_conf.file_flag.fss_width();
    if let Some(segment_metadata) = segment_metadata {
        overhead += segment_metadata.len_written();
    }
    if pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
        overhead += 2;
    }
    max_packet_len.saturating_sub(overhead)
}
