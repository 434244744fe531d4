use super::{
    add_pdu_crc, check_target_buf_len, parse_directive_header, CfdpPdu, ConditionCode, CrcFlag,
    Direction, FileDirectiveType, PduError, PduHeader, PduType, WritablePduPacket,
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeliveryCode {
    Complete = 0,
    Incomplete = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FileStatus {
    DiscardDeliberately = 0b00,
    DiscardedFsRejection = 0b01,
    Retained = 0b10,
    Unreported = 0b11,
}

/// Finished PDU abstraction.
///
/// For more information, refer to CFDP chapter 5.2.3.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FinishedPdu {
    pdu_header: PduHeader,
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
}

impl FinishedPdu {
    /// Default finished PDU: No error (no fault location field) and no filestore responses.
    pub fn new_default(
        pdu_header: PduHeader,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        Self::new(
            pdu_header,
            ConditionCode::NoError,
            delivery_code,
            file_status,
        )
    }

    pub fn new(
        mut pdu_header: PduHeader,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> Self {
        pdu_header.pdu_conf.direction = Direction::TowardsSender;
        pdu_header.pdu_type = PduType::FileDirective;
        let mut finished_pdu = Self {
            pdu_header,
            condition_code,
            delivery_code,
            file_status,
        };
        finished_pdu.pdu_header.set_datafield_len_for_content(2);
        finished_pdu
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn delivery_code(&self) -> DeliveryCode {
        self.delivery_code
    }

    pub fn file_status(&self) -> FileStatus {
        self.file_status
    }

    /// Parses a Finished PDU. Trailing filestore responses or fault location TLVs are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, current_idx, full_len_without_crc) =
            parse_directive_header(buf, FileDirectiveType::FinishedPdu)?;
        if current_idx + 1 > full_len_without_crc {
            return Err(PduError::MalformedPdu("Finished PDU too short"));
        }
        let first_param_byte = buf[current_idx];
        let cc_raw = (first_param_byte >> 4) & 0b1111;
        let condition_code =
            ConditionCode::try_from(cc_raw).map_err(|_| PduError::InvalidConditionCode(cc_raw))?;
        let delivery_code = if (first_param_byte >> 2) & 0b1 == 0 {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        };
        // Two bit field, so the conversion can not fail.
        let file_status = FileStatus::try_from(first_param_byte & 0b11)
            .map_err(|_| PduError::MalformedPdu("invalid file status"))?;
        Ok(Self {
            pdu_header,
            condition_code,
            delivery_code,
            file_status,
        })
    }
}

impl CfdpPdu for FinishedPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::FinishedPdu)
    }
}

impl WritablePduPacket for FinishedPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::FinishedPdu as u8;
        current_idx += 1;
        buf[current_idx] = ((self.condition_code as u8) << 4)
            | ((self.delivery_code as u8) << 2)
            | self.file_status as u8;
        current_idx += 1;
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
    use crate::pdu::LargeFileFlag;

    fn generic_finished_pdu(
        crc_flag: CrcFlag,
        condition_code: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
    ) -> FinishedPdu {
        let pdu_header =
            PduHeader::new_for_file_directive(common_pdu_conf(crc_flag, LargeFileFlag::Normal), 0);
        FinishedPdu::new(pdu_header, condition_code, delivery_code, file_status)
    }

    #[test]
    fn test_basic() {
        let finished_pdu = generic_finished_pdu(
            CrcFlag::NoCrc,
            ConditionCode::NoError,
            DeliveryCode::Complete,
            FileStatus::Retained,
        );
        assert_eq!(finished_pdu.len_written(), 9);
        assert_eq!(finished_pdu.direction(), Direction::TowardsSender);
        assert_eq!(finished_pdu.condition_code(), ConditionCode::NoError);
        assert_eq!(finished_pdu.delivery_code(), DeliveryCode::Complete);
        assert_eq!(finished_pdu.file_status(), FileStatus::Retained);
    }

    #[test]
    fn test_serialization_bit_layout() {
        let finished_pdu = generic_finished_pdu(
            CrcFlag::NoCrc,
            ConditionCode::FileChecksumFailure,
            DeliveryCode::Incomplete,
            FileStatus::DiscardDeliberately,
        );
        let buf = finished_pdu.to_vec().unwrap();
        assert_eq!(buf[7], FileDirectiveType::FinishedPdu as u8);
        assert_eq!(buf[8], (0b0101 << 4) | (1 << 2));
        // Towards sender direction bit.
        assert_eq!((buf[0] >> 3) & 0b1, 1);
        assert_eq!(FinishedPdu::from_bytes(&buf).unwrap(), finished_pdu);
    }

    #[test]
    fn test_with_crc() {
        let finished_pdu = generic_finished_pdu(
            CrcFlag::WithCrc,
            ConditionCode::NoError,
            DeliveryCode::Complete,
            FileStatus::Unreported,
        );
        let mut buf = finished_pdu.to_vec().unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(FinishedPdu::from_bytes(&buf).unwrap(), finished_pdu);
        buf[8] ^= 0b1;
        assert!(matches!(
            FinishedPdu::from_bytes(&buf).unwrap_err(),
            PduError::CrcMismatch(_)
        ));
    }

    #[test]
    fn test_invalid_condition_code() {
        let finished_pdu = generic_finished_pdu(
            CrcFlag::NoCrc,
            ConditionCode::NoError,
            DeliveryCode::Complete,
            FileStatus::Retained,
        );
        let mut buf = finished_pdu.to_vec().unwrap();
        buf[8] = (0b1100 << 4) | buf[8];
        assert_eq!(
            FinishedPdu::from_bytes(&buf).unwrap_err(),
            PduError::InvalidConditionCode(0b1100)
        );
    }
}
