use super::{
    add_pdu_crc, check_target_buf_len, parse_directive_header, CfdpPdu, ConditionCode, CrcFlag,
    Direction, FileDirectiveType, PduError, PduHeader, PduType, TransactionStatus,
    WritablePduPacket,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// ACK PDU abstraction.
///
/// For more information, refer to CFDP chapter 5.2.4.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AckPdu {
    pdu_header: PduHeader,
    directive_code_of_acked_pdu: FileDirectiveType,
    condition_code: ConditionCode,
    transaction_status: TransactionStatus,
}

impl AckPdu {
    /// Only EOF and Finished PDUs can be acknowledged. The direction flag is set automatically
    /// depending on the acknowledged PDU.
    pub fn new(
        pdu_header: PduHeader,
        directive_code_of_acked_pdu: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<Self, PduError> {
        if directive_code_of_acked_pdu != FileDirectiveType::EofPdu
            && directive_code_of_acked_pdu != FileDirectiveType::FinishedPdu
        {
            return Err(PduError::InvalidDirectiveType {
                found: directive_code_of_acked_pdu as u8,
                expected: None,
            });
        }
        Ok(Self::new_generic(
            pdu_header,
            directive_code_of_acked_pdu,
            condition_code,
            transaction_status,
        ))
    }

    pub fn new_for_eof_pdu(
        pdu_header: PduHeader,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self::new_generic(
            pdu_header,
            FileDirectiveType::EofPdu,
            condition_code,
            transaction_status,
        )
    }

    pub fn new_for_finished_pdu(
        pdu_header: PduHeader,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        Self::new_generic(
            pdu_header,
            FileDirectiveType::FinishedPdu,
            condition_code,
            transaction_status,
        )
    }

    fn new_generic(
        mut pdu_header: PduHeader,
        directive_code_of_acked_pdu: FileDirectiveType,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Self {
        // ACK of EOF travels back to the sender, ACK of Finished travels to the receiver.
        pdu_header.pdu_conf.direction = if directive_code_of_acked_pdu == FileDirectiveType::EofPdu
        {
            Direction::TowardsSender
        } else {
            Direction::TowardsReceiver
        };
        pdu_header.pdu_type = PduType::FileDirective;
        let mut ack_pdu = Self {
            pdu_header,
            directive_code_of_acked_pdu,
            condition_code,
            transaction_status,
        };
        ack_pdu.pdu_header.set_datafield_len_for_content(3);
        ack_pdu
    }

    pub fn directive_code_of_acked_pdu(&self) -> FileDirectiveType {
        self.directive_code_of_acked_pdu
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PduError> {
        let (pdu_header, current_idx, full_len_without_crc) =
            parse_directive_header(buf, FileDirectiveType::AckPdu)?;
        if current_idx + 2 > full_len_without_crc {
            return Err(PduError::MalformedPdu("ACK PDU too short"));
        }
        let acked_raw = buf[current_idx] >> 4;
        let directive_code_of_acked_pdu = FileDirectiveType::try_from(acked_raw).map_err(|_| {
            PduError::InvalidDirectiveType {
                found: acked_raw,
                expected: None,
            }
        })?;
        if directive_code_of_acked_pdu != FileDirectiveType::EofPdu
            && directive_code_of_acked_pdu != FileDirectiveType::FinishedPdu
        {
            return Err(PduError::InvalidDirectiveType {
                found: acked_raw,
                expected: None,
            });
        }
        let cc_raw = (buf[current_idx + 1] >> 4) & 0b1111;
        let condition_code =
            ConditionCode::try_from(cc_raw).map_err(|_| PduError::InvalidConditionCode(cc_raw))?;
        let transaction_status = TransactionStatus::try_from(buf[current_idx + 1] & 0b11)
            .map_err(|_| PduError::MalformedPdu("invalid transaction status"))?;
        Ok(Self {
            pdu_header,
            directive_code_of_acked_pdu,
            condition_code,
            transaction_status,
        })
    }
}

impl CfdpPdu for AckPdu {
    fn pdu_header(&self) -> &PduHeader {
        &self.pdu_header
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        Some(FileDirectiveType::AckPdu)
    }
}

impl WritablePduPacket for AckPdu {
    fn len_written(&self) -> usize {
        self.pdu_header.pdu_len()
    }

    fn write_to_bytes(&self, buf: &mut [u8]) -> Result<usize, PduError> {
        check_target_buf_len(buf, self.len_written())?;
        let mut current_idx = self.pdu_header.write_to_bytes(buf)?;
        buf[current_idx] = FileDirectiveType::AckPdu as u8;
        current_idx += 1;
        // Directive subtype code is 0b0001 for the Finished PDU and 0 otherwise.
        let subtype: u8 = if self.directive_code_of_acked_pdu == FileDirectiveType::FinishedPdu {
            0b0001
        } else {
            0b0000
        };
        buf[current_idx] = ((self.directive_code_of_acked_pdu as u8) << 4) | subtype;
        current_idx += 1;
        buf[current_idx] = ((self.condition_code as u8) << 4) | (self.transaction_status as u8);
        current_idx += 1;
        if self.pdu_header.pdu_conf.crc_flag == CrcFlag::WithCrc {
            current_idx = add_pdu_crc(buf, current_idx);
        }
        Ok(current_idx)
    }
}
