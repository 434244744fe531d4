//! This crate contains an implementation of the CCSDS File Delivery Protocol (CFDP) as specified
//! in CCSDS 727.0-B-5.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). CFPD has an unacknowledged and acknowledged mode, with the option to request
//! a transaction closure for the unacknowledged mode. Using the unacknowledged mode with no
//! transaction closure is applicable for simplex communication paths, while the unacknowledged
//! mode with closure is the easiest way to get a confirmation of a successful file transfer,
//! including a checksum verification on the remote side. The acknowledged mode adds lost segment
//! detection and re-transmission on top of that, so it can be compared to a specialized TCP for
//! file transfers with remote systems.
//!
//! The crate is split into the following layers:
//!
//! - The [pdu] module provides the binary codec for all PDUs used by the handlers.
//! - The [seq_count] module provides transaction sequence number generation.
//! - This crate root contains the Management Information Base (MIB) abstractions like
//!   [LocalEntityConfig], [RemoteEntityConfig] and the [FaultHandler], the [TransactionId] and
//!   PDU routing helpers.
//! - The [source::SourceHandler] and the [dest::DestinationHandler] model the CFDP source and
//!   destination entity respectively. Both handlers can serve an arbitrary amount of concurrent
//!   transactions which are keyed by their [TransactionId].
//!
//! # Scheduling
//!
//! The handlers never block. They are driven by calling their `state_machine` method either with
//! a received PDU or without a packet to advance the transactions and check their timers. Any
//! waiting is expressed by timers created through a [TimerCreator] which are polled on each call.
//!
//! # Notes on the user hooks
//!
//! The [user::CfdpUser] trait is used to deliver CFDP indications to the user, while the
//! [UserFaultHook] is called by the [FaultHandler] for each declared fault. The end-to-end tests
//! and the UDP loopback demo contain implementations which simply log the indications.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
pub mod dest;
pub mod filestore;
pub mod pdu;
pub mod request;
pub mod segments;
pub mod seq_count;
pub mod source;
pub mod time;
pub mod user;
pub mod util;

use core::{cell::RefCell, fmt::Debug, hash::Hash, time::Duration};
use crc::{Crc, CRC_32_ISCSI, CRC_32_ISO_HDLC};
use hashbrown::HashMap;
use std::sync::mpsc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::pdu::{
    ChecksumType, ConditionCode, FaultHandlerCode, FileDirectiveType, PduError, PduHeader,
    PduType, TransmissionMode,
};
use crate::time::Countdown;
use crate::util::{UnsignedByteField, UnsignedEnum};

pub use crate::time::{StdCountdown, StdTimerCreator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EntityType {
    Sending,
    Receiving,
}

/// Purpose of a countdown requested from a [TimerCreator].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TimerContext {
    /// Check timer of a transaction. The sending entity runs it while waiting for the Finished
    /// PDU, the receiving entity while file data is missing after the EOF PDU.
    CheckLimit {
        local_id: UnsignedByteField,
        remote_id: UnsignedByteField,
        entity_type: EntityType,
        expiry_time: Duration,
    },
    /// Timer of the positive ACK procedure for an EOF or Finished PDU.
    PositiveAck { expiry_time: Duration },
}

impl TimerContext {
    pub fn expiry_time(&self) -> Duration {
        match *self {
            TimerContext::CheckLimit { expiry_time, .. }
            | TimerContext::PositiveAck { expiry_time } => expiry_time,
        }
    }
}

/// Factory for the countdowns of the handlers.
///
/// The handlers never sleep. They create a countdown for every check timer and positive ACK
/// timer and poll it on each call of their state machine, so the clock source is entirely up to
/// the implementor. [StdTimerCreator] uses the monotonic clock of the standard library.
pub trait TimerCreator {
    type Countdown: Countdown;

    fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown;
}

/// Per-peer part of the Management Information Base (MIB).
///
/// Only the parameters the handlers actually use are modelled. The `*_by_default` fields fill
/// in the options a put request leaves open.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteEntityConfig {
    pub entity_id: UnsignedByteField,
    /// Upper bound for every PDU sent to the peer.
    pub max_packet_len: usize,
    /// Optional additional bound for the file segment length. The smaller of this value and the
    /// segment length derived from `max_packet_len` is used.
    pub max_file_segment_len: Option<usize>,
    pub default_transmission_mode: TransmissionMode,
    pub default_crc_type: ChecksumType,
    pub closure_requested_by_default: bool,
    pub crc_on_transmission_by_default: bool,
    /// Discard partially received files when a transaction towards this peer is cancelled.
    pub disposition_on_cancellation: bool,
    /// Send a NAK as soon as a gap or missing metadata is detected in acknowledged mode.
    pub immediate_nak_mode: bool,
    /// Number of check timer expiries before [ConditionCode::CheckLimitReached] is declared.
    pub check_limit: u32,
    pub check_timer_interval: Duration,
    pub positive_ack_timer_interval: Duration,
    /// Number of positive ACK timer expiries before [ConditionCode::PositiveAckLimitReached]
    /// is declared.
    pub positive_ack_timer_expiration_limit: u32,
}

impl RemoteEntityConfig {
    pub const DEFAULT_CHECK_LIMIT: u32 = 2;
    pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_POSITIVE_ACK_LIMIT: u32 = 2;

    /// Configuration using the default timer settings and limits.
    pub fn new_with_default_values(
        entity_id: UnsignedByteField,
        max_packet_len: usize,
        closure_requested_by_default: bool,
        crc_on_transmission_by_default: bool,
        default_transmission_mode: TransmissionMode,
        default_crc_type: ChecksumType,
    ) -> Self {
        Self {
            entity_id,
            max_packet_len,
            max_file_segment_len: None,
            default_transmission_mode,
            default_crc_type,
            closure_requested_by_default,
            crc_on_transmission_by_default,
            disposition_on_cancellation: false,
            immediate_nak_mode: true,
            check_limit: Self::DEFAULT_CHECK_LIMIT,
            check_timer_interval: Self::DEFAULT_TIMER_INTERVAL,
            positive_ack_timer_interval: Self::DEFAULT_TIMER_INTERVAL,
            positive_ack_timer_expiration_limit: Self::DEFAULT_POSITIVE_ACK_LIMIT,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteConfigError {
    #[error("no remote entity configuration found for entity ID {0:?}")]
    UnknownRemoteEntity(UnsignedByteField),
}

/// Table of [RemoteEntityConfig]s keyed by the remote entity ID.
pub trait RemoteConfigStore {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig>;

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig>;

    /// Inserts the configuration and returns the entry it replaced, if any.
    fn add_config(&mut self, cfg: RemoteEntityConfig) -> Option<RemoteEntityConfig>;

    fn remove_config(&mut self, remote_id: u64) -> Option<RemoteEntityConfig>;

    fn lookup(
        &self,
        remote_id: UnsignedByteField,
    ) -> Result<&RemoteEntityConfig, RemoteConfigError> {
        self.get(remote_id.value())
            .ok_or(RemoteConfigError::UnknownRemoteEntity(remote_id))
    }
}

#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteConfigStoreStd(pub HashMap<u64, RemoteEntityConfig>);

impl RemoteConfigStore for RemoteConfigStoreStd {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.0.get(&remote_id)
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.0.get_mut(&remote_id)
    }

    fn add_config(&mut self, cfg: RemoteEntityConfig) -> Option<RemoteEntityConfig> {
        self.0.insert(cfg.entity_id.value(), cfg)
    }

    fn remove_config(&mut self, remote_id: u64) -> Option<RemoteEntityConfig> {
        self.0.remove(&remote_id)
    }
}

/// Linear table for the common case of very few peers.
#[derive(Default, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RemoteConfigList(pub Vec<RemoteEntityConfig>);

impl RemoteConfigList {
    fn position(&self, remote_id: u64) -> Option<usize> {
        self.0
            .iter()
            .position(|cfg| cfg.entity_id.value() == remote_id)
    }
}

impl From<RemoteEntityConfig> for RemoteConfigList {
    fn from(cfg: RemoteEntityConfig) -> Self {
        Self(vec![cfg])
    }
}

impl RemoteConfigStore for RemoteConfigList {
    fn get(&self, remote_id: u64) -> Option<&RemoteEntityConfig> {
        self.position(remote_id).map(|idx| &self.0[idx])
    }

    fn get_mut(&mut self, remote_id: u64) -> Option<&mut RemoteEntityConfig> {
        self.position(remote_id).map(|idx| &mut self.0[idx])
    }

    fn add_config(&mut self, cfg: RemoteEntityConfig) -> Option<RemoteEntityConfig> {
        match self.position(cfg.entity_id.value()) {
            Some(idx) => Some(core::mem::replace(&mut self.0[idx], cfg)),
            None => {
                self.0.push(cfg);
                None
            }
        }
    }

    fn remove_config(&mut self, remote_id: u64) -> Option<RemoteEntityConfig> {
        let idx = self.position(remote_id)?;
        Some(self.0.swap_remove(idx))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_new::new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultInfo {
    transaction_id: TransactionId,
    condition_code: ConditionCode,
    progress: u64,
}

impl FaultInfo {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn condition_code(&self) -> ConditionCode {
        self.condition_code
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }
}

/// User callbacks invoked by the [FaultHandler], one per [FaultHandlerCode].
///
/// The callbacks only observe the fault. The handler reaction itself (cancel, suspend, abandon
/// or carry on) is performed by the source or destination handler.
pub trait UserFaultHook {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo);

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo);

    fn abandoned_cb(&mut self, fault_info: FaultInfo);

    fn ignore_cb(&mut self, fault_info: FaultInfo);
}

/// Condition codes which count as faults. Only these can be mapped to a handler.
const FAULT_CONDITION_CODES: [ConditionCode; 10] = [
    ConditionCode::PositiveAckLimitReached,
    ConditionCode::KeepAliveLimitReached,
    ConditionCode::InvalidTransmissionMode,
    ConditionCode::FilestoreRejection,
    ConditionCode::FileChecksumFailure,
    ConditionCode::FileSizeError,
    ConditionCode::NakLimitReached,
    ConditionCode::InactivityDetected,
    ConditionCode::CheckLimitReached,
    ConditionCode::UnsupportedChecksumType,
];

/// Maps fault condition codes to a [FaultHandlerCode] and forwards reported faults to the
/// [UserFaultHook].
///
/// Checksum failures and unsupported checksum types are ignored initially so the check limit
/// mechanism of unacknowledged transfers can still complete the file. Every other fault cancels
/// the transaction. Codes without an entry resolve to the default handler, which is
/// [FaultHandlerCode::IgnoreError] unless changed.
pub struct FaultHandler<UserHandler: UserFaultHook> {
    handlers: HashMap<ConditionCode, FaultHandlerCode>,
    default_handler: FaultHandlerCode,
    pub user_hook: RefCell<UserHandler>,
}

impl<UserHandler: UserFaultHook> FaultHandler<UserHandler> {
    pub fn is_fault(condition_code: ConditionCode) -> bool {
        FAULT_CONDITION_CODES.contains(&condition_code)
    }

    pub fn new(user_hook: UserHandler) -> Self {
        let handlers = FAULT_CONDITION_CODES
            .iter()
            .map(|&code| match code {
                ConditionCode::FileChecksumFailure | ConditionCode::UnsupportedChecksumType => {
                    (code, FaultHandlerCode::IgnoreError)
                }
                _ => (code, FaultHandlerCode::NoticeOfCancellation),
            })
            .collect();
        Self {
            handlers,
            default_handler: FaultHandlerCode::IgnoreError,
            user_hook: RefCell::new(user_hook),
        }
    }

    /// Has no effect for condition codes which are not faults.
    pub fn set_fault_handler(&mut self, condition_code: ConditionCode, handler: FaultHandlerCode) {
        if Self::is_fault(condition_code) {
            self.handlers.insert(condition_code, handler);
        }
    }

    pub fn clear_fault_handler(&mut self, condition_code: ConditionCode) {
        self.handlers.remove(&condition_code);
    }

    pub fn set_default_handler(&mut self, handler: FaultHandlerCode) {
        self.default_handler = handler;
    }

    pub fn default_handler(&self) -> FaultHandlerCode {
        self.default_handler
    }

    pub fn get_fault_handler(&self, condition_code: ConditionCode) -> FaultHandlerCode {
        self.handlers
            .get(&condition_code)
            .copied()
            .unwrap_or(self.default_handler)
    }

    /// Calls the hook callback belonging to `handler` and hands `handler` back to the caller.
    pub fn report_fault(
        &self,
        handler: FaultHandlerCode,
        fault_info: FaultInfo,
    ) -> FaultHandlerCode {
        let mut hook = self.user_hook.borrow_mut();
        match handler {
            FaultHandlerCode::NoticeOfCancellation => hook.notice_of_cancellation_cb(fault_info),
            FaultHandlerCode::NoticeOfSuspension => hook.notice_of_suspension_cb(fault_info),
            FaultHandlerCode::IgnoreError => hook.ignore_cb(fault_info),
            FaultHandlerCode::AbandonTransaction => hook.abandoned_cb(fault_info),
        }
        handler
    }
}

/// Switches for the optional user indications. All of them are enabled by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IndicationConfig {
    pub eof_sent: bool,
    pub eof_recv: bool,
    pub file_segment_recv: bool,
    pub transaction_finished: bool,
    pub suspended: bool,
    pub resumed: bool,
}

impl IndicationConfig {
    pub const fn all(enabled: bool) -> Self {
        Self {
            eof_sent: enabled,
            eof_recv: enabled,
            file_segment_recv: enabled,
            transaction_finished: enabled,
            suspended: enabled,
            resumed: enabled,
        }
    }
}

impl Default for IndicationConfig {
    fn default() -> Self {
        Self::all(true)
    }
}

/// Local part of the MIB. It stays fixed for the lifetime of a handler.
pub struct LocalEntityConfig<UserHook: UserFaultHook> {
    pub id: UnsignedByteField,
    pub indication_cfg: IndicationConfig,
    pub fault_handler: FaultHandler<UserHook>,
}

impl<UserHook: UserFaultHook> LocalEntityConfig<UserHook> {
    pub fn new(id: UnsignedByteField, indication_cfg: IndicationConfig, hook: UserHook) -> Self {
        Self {
            id,
            indication_cfg,
            fault_handler: FaultHandler::new(hook),
        }
    }

    pub fn user_fault_hook(&self) -> &RefCell<UserHook> {
        &self.fault_handler.user_hook
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GenericSendError {
    #[error("RX disconnected")]
    RxDisconnected,
    #[error("queue is full, fill count {0:?}")]
    QueueFull(Option<u32>),
}

/// Outbound side of the handlers. Every generated PDU is passed to [Self::send_pdu] together
/// with its routing information.
pub trait PduSender {
    fn send_pdu(
        &self,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError>;
}

impl PduSender for mpsc::Sender<PduOwnedWithInfo> {
    fn send_pdu(
        &self,
        pdu_type: PduType,
        file_directive_type: Option<FileDirectiveType>,
        raw_pdu: &[u8],
    ) -> Result<(), GenericSendError> {
        let info = PduInfo {
            pdu_type,
            file_directive_type,
        };
        self.send(PduOwnedWithInfo::new(info, raw_pdu.to_vec()))
            .map_err(|_| GenericSendError::RxDisconnected)
    }
}

/// Source entity ID plus the sequence number assigned by that entity.
///
/// Equality and hashing only look at the values, so the field widths do not matter.
#[derive(Debug, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransactionId {
    source_id: UnsignedByteField,
    seq_num: UnsignedByteField,
}

impl TransactionId {
    pub fn new(source_id: UnsignedByteField, seq_num: UnsignedByteField) -> Self {
        Self { source_id, seq_num }
    }

    pub fn from_pdu_header(pdu_header: &PduHeader) -> Self {
        let pdu_conf = pdu_header.common_pdu_conf();
        Self::new(pdu_conf.source_id(), pdu_conf.transaction_seq_num)
    }

    pub fn source_id(&self) -> &UnsignedByteField {
        &self.source_id
    }

    pub fn seq_num(&self) -> &UnsignedByteField {
        &self.seq_num
    }

    fn values(&self) -> (u64, u64) {
        (self.source_id.value(), self.seq_num.value())
    }
}

impl Hash for TransactionId {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.values().hash(state);
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.values() == other.values()
    }
}

impl core::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (source_id, seq_num) = self.values();
        write!(f, "{source_id}-{seq_num}")
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum State {
    Idle = 0,
    Busy = 1,
    Suspended = 2,
}

/// Tracks the positive ACK procedure of a transaction.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PositiveAckParams {
    pub ack_counter: u32,
    /// The PDU awaiting acknowledgement is a cancellation. Any fault declared during this
    /// procedure leads to abandonment of the transaction.
    pub positive_ack_of_cancellation: bool,
}

/// CRC-32 as used for [ChecksumType::Crc32] and the PDU CRC.
pub const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
/// CRC-32C (Castagnoli) for [ChecksumType::Crc32C].
pub const CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketTarget {
    SourceEntity,
    DestEntity,
}

/// Routing information of a raw PDU, extracted without decoding the data field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PduInfo {
    pub pdu_type: PduType,
    pub file_directive_type: Option<FileDirectiveType>,
}

impl PduInfo {
    /// Reads the header and the directive code. Returns the information together with the
    /// total PDU length, which may be shorter than `raw`.
    pub fn parse(raw: &[u8]) -> Result<(Self, usize), PduError> {
        let (header, header_len) = PduHeader::from_bytes(raw)?;
        let pdu_len = header.pdu_len();
        if raw.len() < pdu_len {
            return Err(PduError::MalformedPdu("buffer shorter than PDU length"));
        }
        let file_directive_type = match header.pdu_type() {
            PduType::FileData => None,
            PduType::FileDirective => {
                if pdu_len <= header_len {
                    return Err(PduError::MalformedPdu("missing directive code"));
                }
                Some(directive_at(raw, header_len)?)
            }
        };
        let info = Self {
            pdu_type: header.pdu_type(),
            file_directive_type,
        };
        Ok((info, pdu_len))
    }

    /// Entity which has to process the PDU, following the forwarding rules of CFDP 4.5.3.
    pub fn packet_target(&self, raw: &[u8]) -> Result<PacketTarget, PduError> {
        let Some(directive) = self.file_directive_type else {
            return Ok(PacketTarget::DestEntity);
        };
        Ok(match directive {
            FileDirectiveType::MetadataPdu
            | FileDirectiveType::EofPdu
            | FileDirectiveType::PromptPdu => PacketTarget::DestEntity,
            FileDirectiveType::NakPdu
            | FileDirectiveType::FinishedPdu
            | FileDirectiveType::KeepAlivePdu => PacketTarget::SourceEntity,
            // An ACK travels opposite to the PDU it acknowledges. The acknowledged directive is
            // the upper nibble of the byte after the directive code.
            FileDirectiveType::AckPdu => {
                let (_, header_len) = PduHeader::from_bytes(raw)?;
                let acked = raw
                    .get(header_len + 1)
                    .map(|byte| byte >> 4)
                    .ok_or(PduError::MalformedPdu("ACK PDU too short"))?;
                match FileDirectiveType::try_from(acked) {
                    Ok(FileDirectiveType::EofPdu) => PacketTarget::SourceEntity,
                    Ok(FileDirectiveType::FinishedPdu) => PacketTarget::DestEntity,
                    _ => {
                        return Err(PduError::InvalidDirectiveType {
                            found: acked,
                            expected: None,
                        })
                    }
                }
            }
        })
    }
}

fn directive_at(raw: &[u8], idx: usize) -> Result<FileDirectiveType, PduError> {
    let code = *raw
        .get(idx)
        .ok_or(PduError::MalformedPdu("missing directive code"))?;
    FileDirectiveType::try_from(code).map_err(|_| PduError::InvalidDirectiveType {
        found: code,
        expected: None,
    })
}

pub fn determine_packet_target(raw_pdu: &[u8]) -> Result<PacketTarget, PduError> {
    PduInfo::parse(raw_pdu)?.0.packet_target(raw_pdu)
}

/// A raw PDU handed to the state machines of the handlers.
pub trait PduProvider {
    fn info(&self) -> PduInfo;

    fn pdu(&self) -> &[u8];

    fn pdu_type(&self) -> PduType {
        self.info().pdu_type
    }

    fn file_directive_type(&self) -> Option<FileDirectiveType> {
        self.info().file_directive_type
    }

    fn packet_target(&self) -> Result<PacketTarget, PduError> {
        self.info().packet_target(self.pdu())
    }
}

/// Borrowed PDU, trimmed to the length stated in its header.
#[derive(Debug, Copy, Clone)]
pub struct PduRawWithInfo<'raw> {
    info: PduInfo,
    raw_packet: &'raw [u8],
}

impl<'raw> PduRawWithInfo<'raw> {
    pub fn new(raw_packet: &'raw [u8]) -> Result<Self, PduError> {
        let (info, pdu_len) = PduInfo::parse(raw_packet)?;
        Ok(Self {
            info,
            raw_packet: &raw_packet[..pdu_len],
        })
    }

    pub fn raw_packet(&self) -> &'raw [u8] {
        self.raw_packet
    }
}

impl PduProvider for PduRawWithInfo<'_> {
    fn info(&self) -> PduInfo {
        self.info
    }

    fn pdu(&self) -> &[u8] {
        self.raw_packet
    }
}

/// Owned PDU, as queued by the [mpsc::Sender] implementation of [PduSender].
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PduOwnedWithInfo {
    pub info: PduInfo,
    pub pdu: Vec<u8>,
}

impl PduOwnedWithInfo {
    pub fn new(info: PduInfo, pdu: Vec<u8>) -> Self {
        Self { info, pdu }
    }

    pub fn new_from_raw_packet(raw_packet: &[u8]) -> Result<Self, PduError> {
        Ok(PduRawWithInfo::new(raw_packet)?.into())
    }
}

impl From<PduRawWithInfo<'_>> for PduOwnedWithInfo {
    fn from(raw: PduRawWithInfo) -> Self {
        Self::new(raw.info, raw.raw_packet.to_vec())
    }
}

impl PduProvider for PduOwnedWithInfo {
    fn info(&self) -> PduInfo {
        self.info
    }

    fn pdu(&self) -> &[u8] {
        &self.pdu
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use core::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;
    use crate::pdu::ack::AckPdu;
    use crate::pdu::eof::EofPdu;
    use crate::pdu::file_data::FileDataPdu;
    use crate::pdu::metadata::{MetadataGenericParams, MetadataPdu};
    use crate::pdu::{CommonPduConfig, TransactionStatus, WritablePduPacket};
    use crate::user::{
        CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, OwnedMetadataRecvdParams,
        TransactionFinishedParams,
    };
    use crate::util::{UnsignedByteFieldU16, UnsignedByteFieldU8};

    pub const LOCAL_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
    pub const REMOTE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileSegmentRecvdParamsNoSegMetadata {
        pub id: TransactionId,
        pub offset: u64,
        pub length: usize,
    }

    /// Recording user which stores every indication.
    #[derive(Default)]
    pub struct TestCfdpUser {
        pub transaction_indication_queue: VecDeque<TransactionId>,
        pub eof_sent_call_count: u32,
        pub eof_recvd_call_count: u32,
        pub finished_indic_queue: VecDeque<TransactionFinishedParams>,
        pub metadata_recv_queue: VecDeque<OwnedMetadataRecvdParams>,
        pub file_seg_recvd_queue: VecDeque<FileSegmentRecvdParamsNoSegMetadata>,
        pub fault_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub abandoned_queue: VecDeque<(TransactionId, ConditionCode, u64)>,
        pub suspended_queue: VecDeque<(TransactionId, ConditionCode)>,
        pub resumed_queue: VecDeque<(TransactionId, u64)>,
    }

    impl TestCfdpUser {
        pub fn no_faults(&self) -> bool {
            self.fault_queue.is_empty() && self.abandoned_queue.is_empty()
        }
    }

    impl CfdpUser for TestCfdpUser {
        fn transaction_indication(&mut self, id: &TransactionId) {
            self.transaction_indication_queue.push_back(*id);
        }

        fn eof_sent_indication(&mut self, _id: &TransactionId) {
            self.eof_sent_call_count += 1;
        }

        fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
            self.finished_indic_queue.push_back(*finished_params);
        }

        fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
            self.metadata_recv_queue.push_back(md_recvd_params.into());
        }

        fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams) {
            self.file_seg_recvd_queue
                .push_back(FileSegmentRecvdParamsNoSegMetadata {
                    id: segment_recvd_params.id,
                    offset: segment_recvd_params.offset,
                    length: segment_recvd_params.length,
                })
        }

        fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode) {
            self.suspended_queue.push_back((*id, condition_code));
        }

        fn resumed_indication(&mut self, id: &TransactionId, progress: u64) {
            self.resumed_queue.push_back((*id, progress));
        }

        fn fault_indication(
            &mut self,
            id: &TransactionId,
            condition_code: ConditionCode,
            progress: u64,
        ) {
            self.fault_queue.push_back((*id, condition_code, progress));
        }

        fn abandoned_indication(
            &mut self,
            id: &TransactionId,
            condition_code: ConditionCode,
            progress: u64,
        ) {
            self.abandoned_queue
                .push_back((*id, condition_code, progress));
        }

        fn eof_recvd_indication(&mut self, _id: &TransactionId) {
            self.eof_recvd_call_count += 1;
        }
    }

    #[derive(Default, Debug)]
    pub(crate) struct TestFaultHandler {
        pub notice_of_suspension_queue: VecDeque<FaultInfo>,
        pub notice_of_cancellation_queue: VecDeque<FaultInfo>,
        pub abandoned_queue: VecDeque<FaultInfo>,
        pub ignored_queue: VecDeque<FaultInfo>,
    }

    impl UserFaultHook for TestFaultHandler {
        fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo) {
            self.notice_of_suspension_queue.push_back(fault_info)
        }

        fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo) {
            self.notice_of_cancellation_queue.push_back(fault_info)
        }

        fn abandoned_cb(&mut self, fault_info: FaultInfo) {
            self.abandoned_queue.push_back(fault_info)
        }

        fn ignore_cb(&mut self, fault_info: FaultInfo) {
            self.ignored_queue.push_back(fault_info)
        }
    }

    impl TestFaultHandler {
        pub(crate) fn all_queues_empty(&self) -> bool {
            self.notice_of_suspension_queue.is_empty()
                && self.notice_of_cancellation_queue.is_empty()
                && self.ignored_queue.is_empty()
                && self.abandoned_queue.is_empty()
        }
    }

    #[derive(Debug)]
    pub struct SentPdu {
        pub pdu_type: PduType,
        pub file_directive_type: Option<FileDirectiveType>,
        pub raw_pdu: Vec<u8>,
    }

    #[derive(Default)]
    pub struct TestCfdpSender {
        pub packet_queue: RefCell<VecDeque<SentPdu>>,
    }

    impl PduSender for TestCfdpSender {
        fn send_pdu(
            &self,
            pdu_type: PduType,
            file_directive_type: Option<FileDirectiveType>,
            raw_pdu: &[u8],
        ) -> Result<(), GenericSendError> {
            self.packet_queue.borrow_mut().push_back(SentPdu {
                pdu_type,
                file_directive_type,
                raw_pdu: raw_pdu.to_vec(),
            });
            Ok(())
        }
    }

    impl TestCfdpSender {
        pub fn retrieve_next_pdu(&self) -> Option<SentPdu> {
            self.packet_queue.borrow_mut().pop_front()
        }
        pub fn queue_empty(&self) -> bool {
            self.packet_queue.borrow().is_empty()
        }
        pub fn queue_len(&self) -> usize {
            self.packet_queue.borrow().len()
        }
    }

    /// Countdown whose expiry is controlled by the test through a shared flag. Resetting the
    /// countdown clears the flag.
    #[derive(Debug)]
    pub struct TestCheckTimer {
        expired: Rc<Cell<bool>>,
    }

    impl Countdown for TestCheckTimer {
        fn has_expired(&self) -> bool {
            self.expired.get()
        }

        fn reset(&mut self) {
            self.expired.set(false);
        }
    }

    #[derive(Debug, Default, Clone)]
    pub struct TimerExpiryControl {
        pub check_limit: Rc<Cell<bool>>,
        pub positive_ack: Rc<Cell<bool>>,
    }

    impl TimerExpiryControl {
        pub fn expire_check_limit(&self) {
            self.check_limit.set(true);
        }

        pub fn expire_positive_ack(&self) {
            self.positive_ack.set(true);
        }
    }

    #[derive(Debug, Default)]
    pub struct TestCheckTimerCreator {
        pub expiry_control: TimerExpiryControl,
        pub created_contexts: RefCell<Vec<TimerContext>>,
    }

    impl TestCheckTimerCreator {
        pub fn new(expiry_control: TimerExpiryControl) -> Self {
            Self {
                expiry_control,
                created_contexts: RefCell::new(Vec::new()),
            }
        }
    }

    impl TimerCreator for TestCheckTimerCreator {
        type Countdown = TestCheckTimer;

        fn create_countdown(&self, timer_context: TimerContext) -> Self::Countdown {
            self.created_contexts.borrow_mut().push(timer_context);
            let expired = match timer_context {
                TimerContext::CheckLimit { .. } => self.expiry_control.check_limit.clone(),
                TimerContext::PositiveAck { .. } => self.expiry_control.positive_ack.clone(),
            };
            expired.set(false);
            TestCheckTimer { expired }
        }
    }

    pub fn basic_remote_cfg_table(
        dest_id: impl Into<UnsignedByteField>,
        max_packet_len: usize,
        crc_on_transmission_by_default: bool,
    ) -> RemoteConfigStoreStd {
        let mut table = RemoteConfigStoreStd::default();
        let remote_entity_cfg = RemoteEntityConfig::new_with_default_values(
            dest_id.into(),
            max_packet_len,
            true,
            crc_on_transmission_by_default,
            TransmissionMode::Unacknowledged,
            ChecksumType::Crc32,
        );
        table.add_config(remote_entity_cfg);
        table
    }

    fn generic_pdu_header() -> PduHeader {
        let pdu_conf = CommonPduConfig::default();
        PduHeader::new_for_file_directive(pdu_conf, 0)
    }

    fn test_remote_cfg(id: UnsignedByteFieldU16) -> RemoteEntityConfig {
        RemoteEntityConfig::new_with_default_values(
            id.into(),
            1024,
            true,
            false,
            TransmissionMode::Unacknowledged,
            ChecksumType::Crc32,
        )
    }

    #[test]
    fn test_transaction_id() {
        let transaction_id = TransactionId::new(
            UnsignedByteFieldU16::new(1).into(),
            UnsignedByteFieldU16::new(2).into(),
        );
        assert_eq!(transaction_id.source_id().value(), 1);
        assert_eq!(transaction_id.seq_num().value(), 2);
        assert_eq!(transaction_id.to_string(), "1-2");
    }

    #[test]
    fn test_transaction_id_equality_ignores_width() {
        let id_0 = TransactionId::new(
            UnsignedByteFieldU8::new(1).into(),
            UnsignedByteFieldU8::new(2).into(),
        );
        let id_1 = TransactionId::new(
            UnsignedByteFieldU16::new(1).into(),
            UnsignedByteFieldU16::new(2).into(),
        );
        assert_eq!(id_0, id_1);
        let mut map = HashMap::new();
        map.insert(id_0, 5_u32);
        assert_eq!(map.get(&id_1), Some(&5));
    }

    #[test]
    fn test_metadata_pdu_info() {
        let metadata_pdu = MetadataPdu::new(
            generic_pdu_header(),
            MetadataGenericParams::new(false, ChecksumType::Crc32, 0),
            "hello.txt",
            "hello-dest.txt",
        )
        .unwrap();
        let buf = metadata_pdu.to_vec().unwrap();
        let packet_info = PduRawWithInfo::new(&buf).expect("creating packet info failed");
        assert_eq!(packet_info.pdu_type(), PduType::FileDirective);
        assert_eq!(
            packet_info.file_directive_type(),
            Some(FileDirectiveType::MetadataPdu)
        );
        assert_eq!(packet_info.raw_packet(), &buf[0..metadata_pdu.len_written()]);
        assert_eq!(
            packet_info.packet_target().unwrap(),
            PacketTarget::DestEntity
        );
    }

    #[test]
    fn test_filedata_pdu_info() {
        let file_data_pdu = FileDataPdu::new_no_seg_metadata(generic_pdu_header(), 0, &[1, 2]);
        let buf = file_data_pdu.to_vec().unwrap();
        let packet_info = PduRawWithInfo::new(&buf).expect("creating packet info failed");
        assert_eq!(packet_info.raw_packet(), &buf[0..file_data_pdu.len_written()]);
        assert_eq!(packet_info.pdu_type(), PduType::FileData);
        assert!(packet_info.file_directive_type().is_none());
        assert_eq!(
            packet_info.packet_target().unwrap(),
            PacketTarget::DestEntity
        );
    }

    #[test]
    fn test_eof_pdu_info() {
        let eof_pdu = EofPdu::new_no_error(generic_pdu_header(), 0, 0);
        let buf = eof_pdu.to_vec().unwrap();
        let packet_info = PduOwnedWithInfo::new_from_raw_packet(&buf).unwrap();
        assert_eq!(packet_info.pdu_type(), PduType::FileDirective);
        assert_eq!(packet_info.pdu(), &buf[..]);
        assert_eq!(
            packet_info.file_directive_type(),
            Some(FileDirectiveType::EofPdu)
        );
    }

    #[test]
    fn test_ack_pdu_routing() {
        let ack_eof = AckPdu::new_for_eof_pdu(
            generic_pdu_header(),
            ConditionCode::NoError,
            TransactionStatus::Active,
        );
        assert_eq!(
            determine_packet_target(&ack_eof.to_vec().unwrap()).unwrap(),
            PacketTarget::SourceEntity
        );
        let ack_finished = AckPdu::new_for_finished_pdu(
            generic_pdu_header(),
            ConditionCode::NoError,
            TransactionStatus::Active,
        );
        assert_eq!(
            determine_packet_target(&ack_finished.to_vec().unwrap()).unwrap(),
            PacketTarget::DestEntity
        );
    }

    #[test]
    fn test_std_timer_creator_uses_context_expiry() {
        let timer_creator = StdTimerCreator::default();
        let countdown = timer_creator.create_countdown(TimerContext::PositiveAck {
            expiry_time: Duration::from_secs(3),
        });
        assert_eq!(countdown.expiry_time_seconds(), 3);
        let countdown = timer_creator.create_countdown(TimerContext::CheckLimit {
            local_id: LOCAL_ID.into(),
            remote_id: REMOTE_ID.into(),
            entity_type: EntityType::Sending,
            expiry_time: Duration::from_secs(5),
        });
        assert_eq!(countdown.expiry_time_seconds(), 5);
    }

    #[test]
    fn test_remote_cfg_defaults() {
        let cfg = test_remote_cfg(REMOTE_ID);
        assert_eq!(cfg.entity_id, REMOTE_ID.into());
        assert_eq!(cfg.max_packet_len, 1024);
        assert!(cfg.max_file_segment_len.is_none());
        assert!(cfg.closure_requested_by_default);
        assert!(!cfg.crc_on_transmission_by_default);
        assert!(!cfg.disposition_on_cancellation);
        assert!(cfg.immediate_nak_mode);
        assert_eq!(cfg.check_limit, 2);
        assert_eq!(cfg.check_timer_interval, Duration::from_secs(10));
        assert_eq!(cfg.positive_ack_timer_interval, Duration::from_secs(10));
        assert_eq!(cfg.positive_ack_timer_expiration_limit, 2);
    }

    #[test]
    fn test_remote_cfg_provider_std() {
        let mut remote_cfg_provider = RemoteConfigStoreStd::default();
        assert!(remote_cfg_provider
            .add_config(test_remote_cfg(REMOTE_ID))
            .is_none());
        assert!(remote_cfg_provider
            .add_config(test_remote_cfg(LOCAL_ID))
            .is_none());
        assert_eq!(remote_cfg_provider.0.len(), 2);
        let mut replacement = test_remote_cfg(LOCAL_ID);
        replacement.max_packet_len = 512;
        let replaced = remote_cfg_provider.add_config(replacement).unwrap();
        assert_eq!(replaced.max_packet_len, 1024);
        assert_eq!(
            remote_cfg_provider.get(LOCAL_ID.value()).unwrap().max_packet_len,
            512
        );
        let removed = remote_cfg_provider.remove_config(REMOTE_ID.value()).unwrap();
        assert_eq!(removed.entity_id, REMOTE_ID.into());
        assert!(remote_cfg_provider.remove_config(REMOTE_ID.value()).is_none());
        assert!(remote_cfg_provider.get_mut(REMOTE_ID.value()).is_none());
    }

    #[test]
    fn test_remote_cfg_provider_list() {
        let mut remote_cfg_provider = RemoteConfigList::from(test_remote_cfg(REMOTE_ID));
        assert!(remote_cfg_provider
            .add_config(test_remote_cfg(LOCAL_ID))
            .is_none());
        assert_eq!(remote_cfg_provider.0.len(), 2);
        assert!(remote_cfg_provider
            .add_config(test_remote_cfg(LOCAL_ID))
            .is_some());
        assert_eq!(remote_cfg_provider.0.len(), 2);
        remote_cfg_provider
            .get_mut(LOCAL_ID.value())
            .unwrap()
            .default_crc_type = ChecksumType::Crc32C;
        assert!(remote_cfg_provider.remove_config(REMOTE_ID.value()).is_some());
        assert_eq!(remote_cfg_provider.0.len(), 1);
        assert!(remote_cfg_provider.remove_config(REMOTE_ID.value()).is_none());
        assert_eq!(
            remote_cfg_provider.lookup(LOCAL_ID.into()).unwrap().default_crc_type,
            ChecksumType::Crc32C
        );
    }

    #[test]
    fn test_remote_cfg_lookup_unknown_entity() {
        let remote_cfg_provider = RemoteConfigStoreStd::default();
        let error = remote_cfg_provider.lookup(REMOTE_ID.into()).unwrap_err();
        assert_eq!(error, RemoteConfigError::UnknownRemoteEntity(REMOTE_ID.into()));
    }

    #[test]
    fn test_raw_pdu_trimmed_to_header_length() {
        let eof_pdu = EofPdu::new_no_error(generic_pdu_header(), 0, 0);
        let mut buf = eof_pdu.to_vec().unwrap();
        let pdu_len = buf.len();
        buf.extend_from_slice(&[0xff; 4]);
        let packet_info = PduRawWithInfo::new(&buf).unwrap();
        assert_eq!(packet_info.pdu().len(), pdu_len);
        assert!(PduRawWithInfo::new(&buf[..pdu_len - 1]).is_err());
    }

    #[test]
    fn test_indication_cfg() {
        assert_eq!(IndicationConfig::default(), IndicationConfig::all(true));
        let cfg = IndicationConfig::all(false);
        assert!(!cfg.eof_sent && !cfg.file_segment_recv && !cfg.resumed);
    }

    #[test]
    fn test_fault_handler_defaults() {
        let fault_handler = FaultHandler::new(TestFaultHandler::default());
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::FileChecksumFailure),
            FaultHandlerCode::IgnoreError
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::UnsupportedChecksumType),
            FaultHandlerCode::IgnoreError
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::CheckLimitReached),
            FaultHandlerCode::NoticeOfCancellation
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::CancelRequestReceived),
            FaultHandlerCode::IgnoreError
        );
    }

    #[test]
    fn test_fault_handler_override_and_fallback() {
        let mut fault_handler = FaultHandler::new(TestFaultHandler::default());
        fault_handler.set_fault_handler(
            ConditionCode::FileChecksumFailure,
            FaultHandlerCode::AbandonTransaction,
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::FileChecksumFailure),
            FaultHandlerCode::AbandonTransaction
        );
        fault_handler.clear_fault_handler(ConditionCode::CheckLimitReached);
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::CheckLimitReached),
            FaultHandlerCode::IgnoreError
        );
        fault_handler.set_default_handler(FaultHandlerCode::NoticeOfSuspension);
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::CheckLimitReached),
            FaultHandlerCode::NoticeOfSuspension
        );
        fault_handler.set_fault_handler(
            ConditionCode::CancelRequestReceived,
            FaultHandlerCode::AbandonTransaction,
        );
        assert_eq!(
            fault_handler.get_fault_handler(ConditionCode::CancelRequestReceived),
            FaultHandlerCode::NoticeOfSuspension
        );
    }

    #[test]
    fn test_fault_handler_report_dispatches_to_hook() {
        let fault_handler = FaultHandler::new(TestFaultHandler::default());
        let id = TransactionId::new(LOCAL_ID.into(), UnsignedByteFieldU8::new(3).into());
        let info = FaultInfo::new(id, ConditionCode::FileSizeError, 20);
        assert_eq!(
            fault_handler.report_fault(FaultHandlerCode::AbandonTransaction, info),
            FaultHandlerCode::AbandonTransaction
        );
        let hook = fault_handler.user_hook.borrow();
        assert_eq!(hook.abandoned_queue.len(), 1);
        assert_eq!(hook.abandoned_queue[0].progress(), 20);
        assert!(hook.ignored_queue.is_empty());
    }
}
