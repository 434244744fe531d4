use crate::pdu::file_data::SegmentMetadata;
use crate::pdu::finished::{DeliveryCode, FileStatus};
use crate::pdu::ConditionCode;
use crate::util::UnsignedByteField;
use crate::TransactionId;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransactionFinishedParams {
    pub id: TransactionId,
    pub condition_code: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
}

#[derive(Debug)]
pub struct MetadataReceivedParams<'src_file, 'dest_file> {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: &'src_file str,
    pub dest_file_name: &'dest_file str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedMetadataRecvdParams {
    pub id: TransactionId,
    pub source_id: UnsignedByteField,
    pub file_size: u64,
    pub src_file_name: String,
    pub dest_file_name: String,
}

impl From<MetadataReceivedParams<'_, '_>> for OwnedMetadataRecvdParams {
    fn from(value: MetadataReceivedParams) -> Self {
        Self::from(&value)
    }
}

impl From<&MetadataReceivedParams<'_, '_>> for OwnedMetadataRecvdParams {
    fn from(value: &MetadataReceivedParams) -> Self {
        Self {
            id: value.id,
            source_id: value.source_id,
            file_size: value.file_size,
            src_file_name: value.src_file_name.into(),
            dest_file_name: value.dest_file_name.into(),
        }
    }
}

#[derive(Debug)]
pub struct FileSegmentRecvdParams<'seg_meta> {
    pub id: TransactionId,
    pub offset: u64,
    pub length: usize,
    pub segment_metadata: Option<&'seg_meta SegmentMetadata<'seg_meta>>,
}

/// Indication sink of a CFDP entity. The handlers call these methods for the CFDP
/// indications of chapter 3.4 of the CFDP standard.
///
/// Indications which can be disabled with the
/// [IndicationConfig][crate::IndicationConfig] are only called when enabled. The fault and
/// abandoned indications are always raised.
pub trait CfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId);
    fn eof_sent_indication(&mut self, id: &TransactionId);
    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams);
    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams);
    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams);
    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode);
    fn resumed_indication(&mut self, id: &TransactionId, progress: u64);
    fn fault_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );
    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    );
    fn eof_recvd_indication(&mut self, id: &TransactionId);
}
