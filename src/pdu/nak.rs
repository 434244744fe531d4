use super::{
    add_pdu_crc, check_target_buf_len, parse_directive_header, read_fss_field, write_fss_field,
    CfdpPdu, CrcFlag, Direction, FileDirectiveType, LargeFileFlag, PduError, PduHeader, PduType,
    WritablePduPacket,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// NAK PDU abstraction.
///
/// Each segment request is a pair of start offset and end offset, where the end offset is
/// exclusive. The special pair `(0, 0)` requests a re-transmission of the Metadata PDU. For more
/// information, refer to CFDP chapter 5.2.6.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NakPdu {
    pdu_header: PduHeader,
    start_of_scope: u64,
    end_of_scope: u64,
    segment_requests: Vec<(u64, u64)>,
}

impl NakPdu {
    /// The segment requests must be ascending and must not overlap. For normal file sizes, all
    /// values must also fit into 32 bits.
    pub fn new(
        mut pdu_header: PduHeader,
        start_of_scope: u64,
        end_of_scope: u64,
        segment_requests: Vec<(u64, u64)>,
    ) -> Result<Self, PduError> {
        let mut prev_end = 0;
        for (start, end) in segment_requests.iter() {
            if start > end || *start < prev_end {
                return Err(PduError::InvalidSegmentRequests);
            }
            prev_end = *end;
        }
        if pdu_header.pdu_conf.file_flag == LargeFileFlag::Normal {
            let max = start_of_scope.max(end_of_scope).max(prev_end);
            if max > u32::MAX as u64 {
                return Err(PduError::FileSizeTooLarge(max));
            }
        }
        pdu_header.pdu_conf.direction = Direction::TowardsSender;
        pdu_header.pdu_type = PduType::FileDirective;
        let mut nak_pdu = Self {
            pdu_header,
            start_of_scope,
            end_of_scope,
            segment_requests,
        };
        let content_len = nak_pdu.calc_content_len();
        nak_pdu.pdu_header.set_datafield_len_for_content(content_len);
        Ok(nak_pdu)
    }

    pub fn new_no_segment_requests(
        pdu_header: PduHeader,
        start_of_scope: u64,
        end_of_scope: u64,
    ) -> Result<Self, PduError> {
        Self::new(pdu_header, start_of_scope, end_of_scope, Vec::new())
    }

    pub fn start_of_scope(&self) -> u64 {
        self.start_of_scope
    }

    pub fn end_of_scope(&self) -> u64 {
        self.end_of_scope
    }

    pub fn segment_requests(&self) -> &[(u64, u64)] {
        &self.segment_requests
    }

    pub fn num_segment_reqs(&self) -> usize {
        self.segment_requests.len()
    }

    fn calc_content_len(&self) -> usize {
        let fss_width = self.pdu_header.pdu_conf.file_flag.fss_width();
        1 + 2 * fss_width + self.segment_requests.len() * 2 * fss_width
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, mut current_idx, full_len_without_crc) =
            parse_directive_header(buf, FileDirectiveType::NakPdu)?;
        let file_flag = pdu_header.pdu_conf.file_flag;
        let fss_width = file_flag.fss_width();
        if current_idx + 2 * fss_width > full_len_without_crc {
            return Err(PduError::MalformedPdu("NAK PDU too short"));
        }
        let (_, start_of_scope) = read_fss_field(file_flag, &buf[current_idx..]);
        current_idx += fss_width;
        let (_, end_of_scope) = read_fss_field(file_flag, &buf[current_idx..]);
        current_idx += fss_width;
        let remaining = full_len_without_crc - current_idx;
        if remaining % (2 * fss_width) != 0 {
            return Err(PduError::MalformedPdu(
                "segment request field length is not a multiple of the pair length",
            ));
        }
        let mut segment_requests = Vec::with_capacity(remaining / (2 * fss_width));
        while current_idx < full_len_without_crc {
            let (_, start) = read_fss_field(file_flag, &buf[current_idx..]);
            current_idx += fss_width;
            let (_, end) = read_fss_field(file_flag, &buf[current_idx..]);
            current_idx += fss_width;
            segment_requests.push((start, end));
        }
        Ok(Self {
            pdu_header,
            start_of_scope,
            end_of_scope,
            segment_requests,
        })
    }
}

impl CfdpPdu for NakPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::NakPdu)
    }
}

impl WritablePduPacket for NakPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let file_flag = self.pdu_header.pdu_conf.file_flag;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::NakPdu as u8;
        current_idx += 1;
        current_idx += write_fss_field(file_flag, self.start_of_scope, &mut buf[current_idx..])?;
        current_idx += write_fss_field(file_flag, self.end_of_scope, &mut buf[current_idx..])?;
        for (start, end) in &self.segment_requests {
            current_idx += write_fss_field(file_flag, *start, &mut buf[current_idx..])?;
            current_idx += write_fss_field(file_flag, *end, &mut buf[current_idx..])?;
        }
        if self.pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
            current_idx = add_pdu_crc(buf, current_idx);
        }
        Ok(current_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::tests::common_pdu_conf;
    use crate::pdu::{decode, Pdu};

    fn nak_header(crc_flag: CrcFlag, fss: LargeFileFlag) -> PduHeader {
        PduHeader::new_for_file_directive(common_pdu_conf(crc_flag, fss), 0)
    }

    #[test]
    fn test_basic() {
        let nak_pdu = NakPdu::new(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
            200,
            vec![(0, 0), (50, 100), (150, 200)],
        )
        .unwrap();
        assert_eq!(nak_pdu.direction(), Direction::TowardsSender);
        assert_eq!(nak_pdu.num_segment_reqs(), 3);
        assert_eq!(nak_pdu.len_written(), 7 + 1 + 8 + 3 * 8);
    }

    #[test]
    fn test_serialization_layout() {
        let nak_pdu = NakPdu::new(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0x10,
            0x20,
            vec![(0x12, 0x14)],
        )
        .unwrap();
        let buf = nak_pdu.to_vec().unwrap();
        assert_eq!(buf[7], FileDirectiveType::NakPdu as u8);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0x10]);
        assert_eq!(&buf[12..16], &[0, 0, 0, 0x20]);
        assert_eq!(&buf[16..20], &[0, 0, 0, 0x12]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 0x14]);
        assert_eq!(NakPdu::from_bytes(&buf).unwrap(), nak_pdu);
    }

    #[test]
    fn test_large_file_with_crc() {
        let nak_pdu = NakPdu::new(
            nak_header(CrcFlag::WithCrc, LargeFileFlag::Large),
            0,
            u32::MAX as u64 + 10,
            vec![(u32::MAX as u64, u32::MAX as u64 + 10)],
        )
        .unwrap();
        let buf = nak_pdu.to_vec().unwrap();
        assert_eq!(buf.len(), 7 + 1 + 16 + 16 + 2);
        match decode(&buf).unwrap() {
            Pdu::Nak(read_back) => assert_eq!(read_back, nak_pdu),
            other => panic!("unexpected PDU {other:?}"),
        }
    }

    #[test]
    fn test_overlapping_requests_rejected() {
        let error = NakPdu::new(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
            200,
            vec![(50, 100), (80, 120)],
        )
        .unwrap_err();
        assert_eq!(error, PduError::InvalidSegmentRequests);
        let error = NakPdu::new(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
            200,
            vec![(100, 50)],
        )
        .unwrap_err();
        assert_eq!(error, PduError::InvalidSegmentRequests);
    }

    #[test]
    fn test_value_too_large_for_normal_file() {
        let error = NakPdu::new_no_segment_requests(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
            u32::MAX as u64 + 1,
        )
        .unwrap_err();
        assert_eq!(error, PduError::FileSizeTooLarge(u32::MAX as u64 + 1));
    }

    #[test]
    fn test_partial_segment_request_is_malformed() {
        let nak_pdu = NakPdu::new(
            nak_header(CrcFlag::NoCrc, LargeFileFlag::Normal),
            0,
            200,
            vec![(50, 100)],
        )
        .unwrap();
        let mut buf = nak_pdu.to_vec().unwrap();
        // Drop the last 4 bytes and shorten the data field length accordingly.
        buf.truncate(buf.len() - 4);
        buf[2] -= 4;
        assert!(matches!(
            NakPdu::from_bytes(&buf).unwrap_err(),
            PduError::MalformedPdu(_)
        ));
    }
}
