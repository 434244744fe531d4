use super::{
    add_pdu_crc, check_target_buf_len, parse_directive_header, read_fss_field, write_fss_field,
    CfdpPdu, ConditionCode, CrcFlag, Direction, FileDirectiveType, PduError, PduHeader,
    PduType, WritablePduPacket,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// End-of-File PDU abstraction.
///
/// For more information, refer to CFDP chapter 5.2.2.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EofPdu {
    pdu_header: PduHeader,
    condition_code: ConditionCode,
    file_checksum: u32,
    file_size: u64,
}

impl EofPdu {
    pub fn new(
        mut pdu_header: PduHeader,
        condition_code: ConditionCode,
        file_checksum: u32,
        file_size: u64,
    ) -> Self {
        // Force correct direction flag.
        pdu_header.pdu_conf.direction = Direction::TowardsReceiver;
        pdu_header.pdu_type = PduType::FileDirective;
        let mut eof_pdu = Self {
            pdu_header,
            condition_code,
            file_checksum,
            file_size,
        };
        let content_len = eof_pdu.calc_content_len();
        eof_pdu.pdu_header.set_datafield_len_for_content(content_len);
        eof_pdu
    }

    pub fn new_no_error(pdu_header: PduHeader, file_checksum: u32, file_size: u64) -> Self {
        Self::new(pdu_header, ConditionCode::NoError, file_checksum, file_size)
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn file_checksum(&self) -> u32 {
        self.file_checksum
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn calc_content_len(&self) -> usize {
        2 + 4 + self.pdu_header.pdu_conf.file_flag.fss_width()
    }

    /// Parses an EOF PDU. Bytes after the file size field, for example a fault location TLV, are
    /// ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<EofPdu, PduError> {
        let (pdu_header, mut current_idx, full_len_without_crc) =
            parse_directive_header(buf, FileDirectiveType::EofPdu)?;
        let fss_width = pdu_header.pdu_conf.file_flag.fss_width();
        if current_idx + 1 + 4 + fss_width > full_len_without_crc {
            return Err(PduError::MalformedPdu("EOF PDU too short"));
        }
        let cc_raw = (buf[current_idx] >> 4) & 0b1111;
        let condition_code =
            ConditionCode::try_from(cc_raw).map_err(|_| PduError::InvalidConditionCode(cc_raw))?;
        current_idx += 1;
        let file_checksum = u32::from_be_bytes([
            buf[current_idx],
            buf[current_idx + 1],
            buf[current_idx + 2],
            buf[current_idx + 3],
        ]);
        current_idx += 4;
        let (_, file_size) = read_fss_field(pdu_header.pdu_conf.file_flag, &buf[current_idx..]);
        Ok(Self {
            pdu_header,
            condition_code,
            file_checksum,
            file_size,
        })
    }
}

impl CfdpPdu for EofPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::EofPdu)
    }
}

impl WritablePduPacket for EofPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::EofPdu as u8;
        current_idx += 1;
        buf[current_idx] = (self.condition_code as u8) << 4;
        current_idx += 1;
        buf[current_idx..current_idx + 4].copy_from_slice(&self.file_checksum.to_be_bytes());
        current_idx += 4;
        current_idx += write_fss_field(
            self.pdu_header.pdu_conf.file_flag,
            self.file_size,
            &mut buf[current_idx..],
        )?;
        if self.pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
            current_idx = add_pdu_crc(buf, current_idx);
        }
        Ok(current_idx)
    }
}
