//! # CFDP Source Entity Module
//!
//! The [SourceHandler] is the primary component of this module which converts a [PutRequest]
//! into all packet data units (PDUs) which need to be sent to a remote CFDP entity to perform a
//! File Copy operation to a remote entity.
//!
//! The source entity allows freedom communication by using a user-provided [PduSender] instance
//! to send all generated PDUs. It should be noted that for regular file transfers, each
//! [SourceHandler::state_machine] call will map to at most one generated file data PDU per
//! transaction. This allows flow control for the user of the state machine.
//!
//! The [SourceHandler::state_machine] will generally perform the following steps after a valid
//! put request was received through the [SourceHandler::put_request] method:
//!
//! 1. Generate the Metadata PDU to be sent to a remote CFDP entity. You can use the
//!    [crate::pdu::metadata::MetadataPdu] to inspect the generated PDU.
//! 2. Generate all File Data PDUs to be sent to a remote CFDP entity if applicable (file not
//!    empty). The PDU(s) can be inspected using the [crate::pdu::file_data::FileDataPdu].
//! 3. Generate an EOF PDU to be sent to a remote CFDP entity. The PDU can be inspected using
//!    the [crate::pdu::eof::EofPdu].
//!
//! If this is an unacknowledged transfer with no transaction closure, the file transfer will be
//! done after these steps. In any other case:
//!
//! ### Unacknowledged transfer with requested closure
//!
//! 4. A Finished PDU will be awaited, for example one generated using
//!    [crate::pdu::finished::FinishedPdu]. The check timer limits the waiting period.
//!
//! ### Acknowledged transfer
//!
//! 4. A EOF ACK packet will be awaited, for example one generated using
//!    [crate::pdu::ack::AckPdu]. The EOF PDU is re-sent with the positive ACK procedure
//!    until it is acknowledged.
//! 5. NAK PDUs received in the meantime lead to re-transmission of the requested segments.
//! 6. A Finished PDU will be awaited, for example one generated using
//!    [crate::pdu::finished::FinishedPdu].
//! 7. A Finished PDU ACK packet will be generated to be sent to the remote CFDP entity.
use core::ops::ControlFlow;

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::filestore::{FilestoreError, VirtualFilestore};
use crate::pdu::ack::AckPdu;
use crate::pdu::eof::EofPdu;
use crate::pdu::file_data::{max_file_segment_len, FileDataPdu};
use crate::pdu::finished::{DeliveryCode, FileStatus, FinishedPdu};
use crate::pdu::metadata::{MetadataGenericParams, MetadataPdu};
use crate::pdu::nak::NakPdu;
use crate::pdu::{
    CfdpPdu, CommonPduConfig, ConditionCode, Direction, FaultHandlerCode, FileDirectiveType,
    LargeFileFlag, PduError, PduHeader, PduType, SegmentMetadataFlag, SegmentationControl,
    TransactionStatus, TransmissionMode, WritablePduPacket,
};
use crate::request::PutRequest;
use crate::seq_count::{SeqCountError, SequenceCountProvider};
use crate::time::Countdown;
use crate::user::{CfdpUser, TransactionFinishedParams};
use crate::util::{UnsignedByteField, UnsignedEnum};
use crate::{
    EntityType, FaultHandler, FaultInfo, GenericSendError, LocalEntityConfig, PduRawWithInfo,
    PacketTarget, PduProvider, PduSender, PositiveAckParams, RemoteConfigError,
    RemoteConfigStore, RemoteEntityConfig, State, TimerContext, TimerCreator, TransactionId,
    UserFaultHook,
};

/// This enumeration models the different transaction steps of the source entity handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStep {
    /// The transaction is finished and will be removed.
    Idle = 0,
    SendingMetadata = 3,
    SendingFileData = 4,
    SendingEof = 6,
    WaitingForEofAck = 7,
    WaitingForFinished = 8,
    NoticeOfCompletion = 10,
}

#[derive(Default, Debug, Copy, Clone)]
pub struct FileParams {
    pub progress: u64,
    pub segment_len: u64,
    pub file_size: u64,
    /// Checksum of the last sent EOF PDU. It is cached to avoid expensive re-calculation when
    /// the EOF PDU needs to be re-sent.
    pub eof_checksum: Option<u32>,
}

#[derive(Debug, Copy, Clone)]
pub struct FinishedParams {
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("can not process packet type {pdu_type:?} with directive type {directive_type:?}")]
    CantProcessPacketType {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("unexpected PDU")]
    UnexpectedPdu {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("no active transaction with ID {0}")]
    UnknownTransaction(TransactionId),
    #[error("filestore error: {0}")]
    FilestoreError(#[from] FilestoreError),
    #[error("invalid NAK PDU received")]
    InvalidNakPdu,
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("issue sending PDU: {0}")]
    SendError(#[from] GenericSendError),
}

#[derive(Debug, thiserror::Error)]
pub enum PutRequestError {
    #[error("no remote entity configuration found: {0}")]
    NoRemoteCfgFound(#[from] RemoteConfigError),
    #[error("source file does not exist")]
    FileDoesNotExist,
    #[error("filestore error: {0}")]
    FilestoreError(#[from] FilestoreError),
    #[error("sequence count error: {0}")]
    SeqCount(#[from] SeqCountError),
    #[error("error related to PDU creation: {0}")]
    Pdu(#[from] PduError),
    #[error("maximum packet length {0} too small for file data PDUs")]
    MaxPacketLenTooSmall(usize),
    #[error("transaction {0} is already active")]
    TransactionAlreadyActive(TransactionId),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub enum FsmContext {
    #[default]
    None,
    ResetWhenPossible,
}

/// Bookkeeping of one active source transaction.
#[derive(Debug)]
pub struct SourceTransaction<CountdownInstance: Countdown> {
    id: TransactionId,
    remote_cfg: RemoteEntityConfig,
    transmission_mode: TransmissionMode,
    closure_requested: bool,
    source_file: String,
    dest_file: String,
    state: State,
    step: TransactionStep,
    cond_code_eof: Option<ConditionCode>,
    finished_params: Option<FinishedParams>,
    file_params: FileParams,
    // PDU configuration is cached so it can be re-used for all PDUs generated for file transfers.
    pdu_conf: CommonPduConfig,
    check_timer: Option<CountdownInstance>,
    check_counter: u32,
    positive_ack_params: Option<PositiveAckParams>,
    ack_timer: Option<CountdownInstance>,
    fsm_ctx: FsmContext,
}

impl<CountdownInstance: Countdown> SourceTransaction<CountdownInstance> {
    #[inline]
    fn is_cancelling(&self) -> bool {
        matches!(self.cond_code_eof, Some(cc) if cc != ConditionCode::NoError)
    }

    #[inline]
    fn ack_of_cancellation_pending(&self) -> bool {
        self.positive_ack_params
            .is_some_and(|params| params.positive_ack_of_cancellation)
    }

    fn finish(&mut self) {
        self.step = TransactionStep::Idle;
        self.state = State::Idle;
        self.fsm_ctx = FsmContext::ResetWhenPossible;
    }
}

/// This is the primary CFDP source handler. It models the CFDP source entity, which is
/// primarily responsible for handling put requests to send files to another CFDP destination
/// entity.
///
/// As such, it contains a state machine to perform all operations necessary to perform a
/// source-to-destination file transfer. This class uses the user provides [PduSender] to
/// send the CFDP PDU packets generated by the state machine.
///
/// The following core functions are the primary interface:
///
/// 1. [Self::put_request] can be used to start transactions, most notably to start
///    and perform a Copy File procedure to send a file.
/// 2. [Self::state_machine] is the primary interface to execute the active file transfers.
///    It generates the necessary CFDP PDUs for this process. This method is also used to insert
///    received packets with the appropriate destination ID and target handler type into the
///    state machine.
///
/// The handler can serve multiple transactions concurrently. Each transaction is keyed by its
/// [TransactionId] and advanced independently on each [Self::state_machine] call. It uses the
/// [VirtualFilestore] abstraction to allow usage on systems without a [std] filesystem.
pub struct SourceHandler<
    PduSenderInstance: PduSender,
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
    SeqCountProviderInstance: SequenceCountProvider,
> {
    local_cfg: LocalEntityConfig<UserFaultHookInstance>,
    pdu_sender: PduSenderInstance,
    pdu_and_cksum_buffer: Vec<u8>,
    file_data_buf: Vec<u8>,
    remote_cfg_table: RemoteConfigStoreInstance,
    vfs: Vfs,
    timer_creator: TimerCreatorInstance,
    seq_count_provider: SeqCountProviderInstance,
    transactions: HashMap<TransactionId, SourceTransaction<CountdownInstance>>,
}

fn send_pdu_with_buf(
    pdu_sender: &impl PduSender,
    buf: &mut Vec<u8>,
    pdu: &(impl WritablePduPacket + CfdpPdu),
) -> Result<(), SourceError> {
    if buf.len() < pdu.len_written() {
        buf.resize(pdu.len_written(), 0);
    }
    let written_len = pdu.write_to_bytes(buf)?;
    pdu_sender.send_pdu(
        pdu.pdu_type(),
        pdu.file_directive_type(),
        &buf[0..written_len],
    )?;
    Ok(())
}

impl<
        PduSenderInstance: PduSender,
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
        SeqCountProviderInstance: SequenceCountProvider,
    >
    SourceHandler<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
        SeqCountProviderInstance,
    >
{
    /// Creates a new instance of a source handler.
    ///
    /// # Arguments
    ///
    /// * `cfg` - The local entity configuration for this source handler.
    /// * `pdu_sender` - [PduSender] used to send CFDP PDUs generated by the handler.
    /// * `vfs` - [VirtualFilestore] implementation used by the handler, which decouples the CFDP
    ///   implementation from the underlying filestore/filesystem.
    /// * `pdu_and_cksum_buf_size` - The handler requires a buffer to generate PDUs and perform
    ///   checksum calculations. The buffer grows to the maximum packet length of a remote entity
    ///   if required, so this should be set to the maximum expected PDU size, for example 2048
    ///   or 4096 bytes.
    /// * `remote_cfg_table` - The [RemoteEntityConfig] store used to look up remote
    ///   entities and target specific configuration for file copy operations.
    /// * `timer_creator` - [TimerCreator] used by the CFDP handler to generate
    ///   timers required by various tasks.
    /// * `seq_count_provider` - The [SequenceCountProvider] used to generate the [TransactionId]
    ///   which contains an incrementing counter.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: LocalEntityConfig<UserFaultHookInstance>,
        pdu_sender: PduSenderInstance,
        vfs: Vfs,
        pdu_and_cksum_buf_size: usize,
        remote_cfg_table: RemoteConfigStoreInstance,
        timer_creator: TimerCreatorInstance,
        seq_count_provider: SeqCountProviderInstance,
    ) -> Self {
        Self {
            local_cfg: cfg,
            remote_cfg_table,
            pdu_sender,
            pdu_and_cksum_buffer: vec![0; pdu_and_cksum_buf_size],
            file_data_buf: vec![0; pdu_and_cksum_buf_size],
            vfs,
            timer_creator,
            seq_count_provider,
            transactions: HashMap::new(),
        }
    }

    /// Calls [Self::state_machine], without inserting a packet.
    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<u32, SourceError> {
        self.state_machine(cfdp_user, None::<&PduRawWithInfo>)
    }

    /// This is the core function to drive the source handler. It is also used to insert
    /// packets into the source handler.
    ///
    /// The state machine should either be called if a packet with the appropriate destination ID
    /// is received, or periodically in IDLE periods to perform all CFDP related tasks, for example
    /// checking for timeouts or sending the next file segment.
    ///
    /// The function returns the number of sent PDU packets on success.
    pub fn state_machine(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        pdu: Option<&impl PduProvider>,
    ) -> Result<u32, SourceError> {
        let mut sent_packets = 0;
        if let Some(packet) = pdu {
            sent_packets += self.insert_packet(cfdp_user, packet)?;
        }
        let mut ids: Vec<TransactionId> = self.transactions.keys().copied().collect();
        ids.sort_unstable_by_key(|id| (id.source_id().value(), id.seq_num().value()));
        for id in ids {
            sent_packets += self
                .process_transaction(&id, |handler, tx| handler.fsm_busy(cfdp_user, tx))?
                .unwrap_or(0);
        }
        Ok(sent_packets)
    }

    /// Aggregated state of the handler. The handler is busy if any transaction is busy.
    pub fn state(&self) -> State {
        let mut state = State::Idle;
        for tx in self.transactions.values() {
            match tx.state {
                State::Busy => return State::Busy,
                State::Suspended => state = State::Suspended,
                State::Idle => (),
            }
        }
        state
    }

    pub fn transaction_state(&self, id: &TransactionId) -> Option<State> {
        self.transactions.get(id).map(|tx| tx.state)
    }

    /// Get the [TransactionStep], which denotes the exact step of a pending CFDP transaction.
    pub fn step(&self, id: &TransactionId) -> Option<TransactionStep> {
        self.transactions.get(id).map(|tx| tx.step)
    }

    /// Returns the [TransmissionMode] of an active transaction.
    pub fn transmission_mode(&self, id: &TransactionId) -> Option<TransmissionMode> {
        self.transactions.get(id).map(|tx| tx.transmission_mode)
    }

    #[inline]
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = &TransactionId> {
        self.transactions.keys()
    }

    #[inline]
    pub fn local_cfg(&self) -> &LocalEntityConfig<UserFaultHookInstance> {
        &self.local_cfg
    }

    #[inline]
    pub fn local_cfg_mut(&mut self) -> &mut LocalEntityConfig<UserFaultHookInstance> {
        &mut self.local_cfg
    }

    #[inline]
    pub fn pdu_sender(&self) -> &PduSenderInstance {
        &self.pdu_sender
    }

    #[inline]
    pub fn remote_cfg_table_mut(&mut self) -> &mut RemoteConfigStoreInstance {
        &mut self.remote_cfg_table
    }

    /// This function is used to pass a put request to the source handler, which is
    /// also used to start a file copy operation. As such, this function models the Put.request
    /// CFDP primitive.
    ///
    /// The transaction indication is raised immediately. The returned [TransactionId] can be
    /// used to cancel, suspend or query the new transaction.
    pub fn put_request(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        put_request: &PutRequest,
    ) -> Result<TransactionId, PutRequestError> {
        let remote_cfg = *self.remote_cfg_table.lookup(put_request.destination_id)?;
        if !self.vfs.exists(put_request.source_file())? {
            return Err(PutRequestError::FileDoesNotExist);
        }
        let file_size = self.vfs.file_size(put_request.source_file())?;
        let transmission_mode = put_request
            .trans_mode
            .unwrap_or(remote_cfg.default_transmission_mode);
        let closure_requested = put_request
            .closure_requested
            .unwrap_or(remote_cfg.closure_requested_by_default);

        // Both the source entity and destination entity ID field must have the same size.
        // We use the larger of either the Put Request destination ID or the local entity ID
        // as the size for the new entity IDs.
        let larger_entity_width = core::cmp::max(
            self.local_cfg.id.size(),
            put_request.destination_id.size(),
        );
        let create_id = |id: &UnsignedByteField| {
            if larger_entity_width != id.size() {
                UnsignedByteField::new(larger_entity_width, id.value())
            } else {
                *id
            }
        };
        let file_flag = if file_size > u32::MAX as u64 {
            LargeFileFlag::Large
        } else {
            LargeFileFlag::Normal
        };
        // The sequence number is only a placeholder with the correct width until the segment
        // length was verified.
        let mut pdu_conf = CommonPduConfig::new(
            create_id(&self.local_cfg.id),
            create_id(&put_request.destination_id),
            UnsignedByteField::new(self.seq_count_provider.byte_width(), 0),
            transmission_mode,
            file_flag,
            remote_cfg.crc_on_transmission_by_default.into(),
            Direction::TowardsReceiver,
        )?;
        let segment_len = Self::calculate_max_file_seg_len(&pdu_conf, &remote_cfg);
        if segment_len == 0 {
            return Err(PutRequestError::MaxPacketLenTooSmall(
                remote_cfg.max_packet_len,
            ));
        }
        let seq_num = self.seq_count_provider.next_byte_field()?;
        pdu_conf.transaction_seq_num = seq_num;
        let id = TransactionId::new(self.local_cfg.id, seq_num);
        if self.transactions.contains_key(&id) {
            return Err(PutRequestError::TransactionAlreadyActive(id));
        }
        if self.pdu_and_cksum_buffer.len() < remote_cfg.max_packet_len {
            self.pdu_and_cksum_buffer
                .resize(remote_cfg.max_packet_len, 0);
        }
        if self.file_data_buf.len() < segment_len as usize {
            self.file_data_buf.resize(segment_len as usize, 0);
        }
        info!(
            "transaction {}: starting {:?} transfer of {} ({} bytes) to entity {}",
            id,
            transmission_mode,
            put_request.source_file(),
            file_size,
            put_request.destination_id.value()
        );
        cfdp_user.transaction_indication(&id);
        self.transactions.insert(
            id,
            SourceTransaction {
                id,
                remote_cfg,
                transmission_mode,
                closure_requested,
                source_file: put_request.source_file().to_string(),
                dest_file: put_request.dest_file().to_string(),
                state: State::Busy,
                step: TransactionStep::SendingMetadata,
                cond_code_eof: None,
                finished_params: None,
                file_params: FileParams {
                    progress: 0,
                    segment_len,
                    file_size,
                    eof_checksum: None,
                },
                pdu_conf,
                check_timer: None,
                check_counter: 0,
                positive_ack_params: None,
                ack_timer: None,
                fsm_ctx: FsmContext::None,
            },
        );
        Ok(id)
    }

    /// This functions models the Cancel.request CFDP primitive and is the recommended way to
    /// cancel a transaction.
    ///
    /// This method will cause a Notice of Cancellation at this entity. Please note that the
    /// transaction might still be active because a cancelled transfer might still require some
    /// packets to be sent to or received from the remote entity.
    ///
    /// Returns [true] if the cancellation was started and [false] if the transaction is unknown
    /// or already being cancelled.
    pub fn cancel_request(
        &mut self,
        user: &mut impl CfdpUser,
        transaction_id: &TransactionId,
    ) -> Result<bool, SourceError> {
        match self.transactions.get(transaction_id) {
            None => return Ok(false),
            Some(tx) if tx.is_cancelling() => return Ok(false),
            _ => (),
        }
        info!("transaction {}: cancel request received", transaction_id);
        self.process_transaction(transaction_id, |handler, tx| {
            handler.notice_of_cancellation(user, tx, ConditionCode::CancelRequestReceived)
        })?;
        Ok(true)
    }

    /// Suspends an active transaction. A suspended transaction does not send any PDUs and its
    /// timers are not evaluated until it is resumed.
    ///
    /// Returns [false] if the transaction is unknown or already suspended.
    pub fn suspend_request(&mut self, user: &mut impl CfdpUser, id: &TransactionId) -> bool {
        let Some(mut tx) = self.transactions.remove(id) else {
            return false;
        };
        let suspend = tx.state != State::Suspended;
        if suspend {
            self.notice_of_suspension(user, &mut tx, ConditionCode::SuspendRequestReceived);
        }
        self.transactions.insert(*id, tx);
        suspend
    }

    /// Resumes a suspended transaction. The timers of the transaction are restarted.
    ///
    /// Returns [false] if the transaction is unknown or not suspended.
    pub fn resume_request(&mut self, user: &mut impl CfdpUser, id: &TransactionId) -> bool {
        let Some(tx) = self.transactions.get_mut(id) else {
            return false;
        };
        if tx.state != State::Suspended {
            return false;
        }
        tx.state = State::Busy;
        if let Some(check_timer) = tx.check_timer.as_mut() {
            check_timer.reset();
        }
        if let Some(ack_timer) = tx.ack_timer.as_mut() {
            ack_timer.reset();
        }
        info!("transaction {}: resumed", id);
        if self.local_cfg.indication_cfg.resumed {
            user.resumed_indication(id, tx.file_params.progress);
        }
        true
    }

    /// Abandons a transaction immediately without sending any further PDUs.
    pub fn abandon(&mut self, user: &mut impl CfdpUser, id: &TransactionId) -> bool {
        match self.transactions.remove(id) {
            Some(tx) => {
                warn!("transaction {}: abandoned", id);
                user.abandoned_indication(id, ConditionCode::NoError, tx.file_params.progress);
                true
            }
            None => false,
        }
    }

    /// This function is public to allow completely resetting the handler, but it is explicitely
    /// discouraged to do this. All active transactions are dropped without any notice.
    pub fn reset(&mut self) {
        self.transactions.clear();
    }

    // Removes the transaction for processing and re-inserts it unless it is finished.
    fn process_transaction<R>(
        &mut self,
        id: &TransactionId,
        f: impl FnOnce(&mut Self, &mut SourceTransaction<CountdownInstance>) -> Result<R, SourceError>,
    ) -> Result<Option<R>, SourceError> {
        let Some(mut tx) = self.transactions.remove(id) else {
            return Ok(None);
        };
        let result = f(self, &mut tx);
        if tx.fsm_ctx != FsmContext::ResetWhenPossible {
            self.transactions.insert(*id, tx);
        }
        result.map(Some)
    }

    fn insert_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        packet_to_insert: &impl PduProvider,
    ) -> Result<u32, SourceError> {
        if packet_to_insert.packet_target()? != PacketTarget::SourceEntity {
            return Err(SourceError::CantProcessPacketType {
                pdu_type: packet_to_insert.pdu_type(),
                directive_type: packet_to_insert.file_directive_type(),
            });
        }
        let Some(directive_type) = packet_to_insert.file_directive_type() else {
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileData,
                directive_type: None,
            });
        };
        let (pdu_header, _) = PduHeader::from_bytes(packet_to_insert.pdu())?;
        let id = TransactionId::from_pdu_header(&pdu_header);
        match self.transactions.get(&id) {
            None => return Err(SourceError::UnknownTransaction(id)),
            Some(tx) if tx.state == State::Suspended => {
                debug!(
                    "transaction {}: ignoring {:?} PDU while suspended",
                    id, directive_type
                );
                return Ok(0);
            }
            _ => (),
        }
        let sent_packets = match directive_type {
            FileDirectiveType::FinishedPdu => {
                let finished_pdu = FinishedPdu::from_bytes(packet_to_insert.pdu())?;
                self.process_transaction(&id, |handler, tx| {
                    handler.handle_finished_pdu(cfdp_user, tx, &finished_pdu)
                })?
            }
            FileDirectiveType::NakPdu => {
                let nak_pdu = NakPdu::from_bytes(packet_to_insert.pdu())?;
                self.process_transaction(&id, |handler, tx| handler.handle_nak_pdu(tx, &nak_pdu))?
            }
            FileDirectiveType::AckPdu => {
                let ack_pdu = AckPdu::from_bytes(packet_to_insert.pdu())?;
                self.process_transaction(&id, |handler, tx| {
                    handler.handle_ack_pdu(cfdp_user, tx, &ack_pdu)
                })?
            }
            FileDirectiveType::KeepAlivePdu => {
                debug!("transaction {}: keep alive PDU received", id);
                None
            }
            FileDirectiveType::EofPdu
            | FileDirectiveType::PromptPdu
            | FileDirectiveType::MetadataPdu => {
                return Err(SourceError::CantProcessPacketType {
                    pdu_type: packet_to_insert.pdu_type(),
                    directive_type: Some(directive_type),
                });
            }
        };
        Ok(sent_packets.unwrap_or(0))
    }

    fn fsm_busy(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) -> Result<u32, SourceError> {
        if tx.state == State::Suspended {
            return Ok(0);
        }
        let mut sent_packets = 0;
        if tx.step == TransactionStep::SendingMetadata {
            self.prepare_and_send_metadata_pdu(tx)?;
            tx.step = TransactionStep::SendingFileData;
            sent_packets += 1;
        }
        if tx.step == TransactionStep::SendingFileData {
            if let ControlFlow::Break(packets) = self.file_data_fsm(tx)? {
                sent_packets += packets;
                // Exit for each file data PDU to allow flow control.
                return Ok(sent_packets);
            }
        }
        if tx.step == TransactionStep::SendingEof {
            self.eof_fsm(user, tx)?;
            sent_packets += 1;
        }
        if tx.step == TransactionStep::WaitingForEofAck {
            sent_packets += self.handle_positive_ack_procedures(user, tx)?;
        }
        if tx.step == TransactionStep::WaitingForFinished {
            sent_packets += self.handle_waiting_for_finished_pdu(user, tx)?;
        }
        if tx.step == TransactionStep::NoticeOfCompletion {
            self.notice_of_completion(user, tx);
        }
        Ok(sent_packets)
    }

    fn handle_positive_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) -> Result<u32, SourceError> {
        let (Some(mut positive_ack_params), Some(ack_timer)) =
            (tx.positive_ack_params, tx.ack_timer.as_mut())
        else {
            return Ok(0);
        };
        if !ack_timer.has_expired() {
            return Ok(0);
        }
        ack_timer.reset();
        if positive_ack_params.ack_counter + 1 >= tx.remote_cfg.positive_ack_timer_expiration_limit
        {
            positive_ack_params.ack_counter = 0;
            tx.positive_ack_params = Some(positive_ack_params);
            return self.declare_fault(user, tx, ConditionCode::PositiveAckLimitReached);
        }
        positive_ack_params.ack_counter += 1;
        tx.positive_ack_params = Some(positive_ack_params);
        debug!(
            "transaction {}: positive ACK timer expired, re-sending EOF ({} of {})",
            tx.id,
            positive_ack_params.ack_counter,
            tx.remote_cfg.positive_ack_timer_expiration_limit
        );
        let checksum = tx.file_params.eof_checksum.unwrap_or_default();
        self.prepare_and_send_eof_pdu(user, tx, checksum, false)?;
        Ok(1)
    }

    fn handle_waiting_for_finished_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) -> Result<u32, SourceError> {
        let Some(check_timer) = tx.check_timer.as_mut() else {
            return Ok(0);
        };
        if !check_timer.has_expired() {
            return Ok(0);
        }
        check_timer.reset();
        tx.check_counter += 1;
        debug!(
            "transaction {}: check timer expired ({} of {})",
            tx.id, tx.check_counter, tx.remote_cfg.check_limit
        );
        if tx.check_counter >= tx.remote_cfg.check_limit {
            tx.check_counter = 0;
            return self.declare_fault(user, tx, ConditionCode::CheckLimitReached);
        }
        Ok(0)
    }

    fn start_check_timer(&self, tx: &mut SourceTransaction<CountdownInstance>) {
        tx.check_counter = 0;
        tx.check_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::CheckLimit {
                    local_id: self.local_cfg.id,
                    remote_id: tx.remote_cfg.entity_id,
                    entity_type: EntityType::Sending,
                    expiry_time: tx.remote_cfg.check_timer_interval,
                }),
        );
    }

    fn start_positive_ack_procedure(
        &self,
        tx: &mut SourceTransaction<CountdownInstance>,
        positive_ack_of_cancellation: bool,
    ) {
        tx.step = TransactionStep::WaitingForEofAck;
        tx.positive_ack_params = Some(PositiveAckParams {
            ack_counter: 0,
            positive_ack_of_cancellation,
        });
        tx.ack_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::PositiveAck {
                    expiry_time: tx.remote_cfg.positive_ack_timer_interval,
                }),
        );
    }

    fn eof_fsm(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) -> Result<(), SourceError> {
        let checksum = self.vfs.calculate_checksum(
            &tx.source_file,
            tx.remote_cfg.default_crc_type,
            tx.file_params.file_size,
            &mut self.pdu_and_cksum_buffer,
        )?;
        tx.file_params.eof_checksum = Some(checksum);
        self.prepare_and_send_eof_pdu(user, tx, checksum, true)?;
        match tx.transmission_mode {
            TransmissionMode::Unacknowledged => {
                if tx.closure_requested {
                    self.start_check_timer(tx);
                    tx.step = TransactionStep::WaitingForFinished;
                } else {
                    tx.step = TransactionStep::NoticeOfCompletion;
                }
            }
            TransmissionMode::Acknowledged => self.start_positive_ack_procedure(tx, false),
        }
        Ok(())
    }

    fn prepare_and_send_ack_pdu(
        &mut self,
        tx: &SourceTransaction<CountdownInstance>,
        condition_code: ConditionCode,
        transaction_status: TransactionStatus,
    ) -> Result<(), SourceError> {
        let ack_pdu = AckPdu::new_for_finished_pdu(
            PduHeader::new_for_file_directive(tx.pdu_conf, 0),
            condition_code,
            transaction_status,
        );
        self.pdu_send_helper(&ack_pdu)
    }

    fn prepare_and_send_metadata_pdu(
        &mut self,
        tx: &SourceTransaction<CountdownInstance>,
    ) -> Result<(), SourceError> {
        let metadata_params = MetadataGenericParams::new(
            tx.closure_requested,
            tx.remote_cfg.default_crc_type,
            tx.file_params.file_size,
        );
        let metadata_pdu = MetadataPdu::new(
            PduHeader::new_for_file_directive(tx.pdu_conf, 0),
            metadata_params,
            tx.source_file.as_str(),
            tx.dest_file.as_str(),
        )?;
        self.pdu_send_helper(&metadata_pdu)
    }

    fn file_data_fsm(
        &mut self,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) -> Result<ControlFlow<u32>, SourceError> {
        if tx.file_params.progress < tx.file_params.file_size {
            let read_len = tx
                .file_params
                .segment_len
                .min(tx.file_params.file_size - tx.file_params.progress);
            self.prepare_and_send_file_data_pdu(tx, tx.file_params.progress, read_len)?;
            tx.file_params.progress += read_len;
            return Ok(ControlFlow::Break(1));
        }
        // EOF is still expected.
        tx.cond_code_eof = Some(ConditionCode::NoError);
        tx.step = TransactionStep::SendingEof;
        Ok(ControlFlow::Continue(()))
    }

    fn notice_of_completion(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
    ) {
        // The default case happens for unacknowledged file copy operation with no closure.
        let finished_params = match tx.finished_params {
            Some(finished_params) => TransactionFinishedParams {
                id: tx.id,
                condition_code: finished_params.condition_code,
                delivery_code: finished_params.delivery_code,
                file_status: finished_params.file_status,
            },
            None => TransactionFinishedParams {
                id: tx.id,
                condition_code: ConditionCode::NoError,
                delivery_code: DeliveryCode::Complete,
                file_status: FileStatus::Unreported,
            },
        };
        info!(
            "transaction {}: finished with condition code {:?}",
            tx.id, finished_params.condition_code
        );
        if self.local_cfg.indication_cfg.transaction_finished {
            cfdp_user.transaction_finished_indication(&finished_params);
        }
        tx.finish();
    }

    fn calculate_max_file_seg_len(
        pdu_conf: &CommonPduConfig,
        remote_cfg: &RemoteEntityConfig,
    ) -> u64 {
        let mut derived_max_seg_len = max_file_segment_len(
            &PduHeader::new_for_file_data(
                *pdu_conf,
                0,
                SegmentMetadataFlag::NotPresent,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            remote_cfg.max_packet_len,
            None,
        );
        if let Some(max_seg_len) = remote_cfg.max_file_segment_len {
            derived_max_seg_len = core::cmp::min(max_seg_len, derived_max_seg_len);
        }
        derived_max_seg_len as u64
    }

    fn prepare_and_send_file_data_pdu(
        &mut self,
        tx: &SourceTransaction<CountdownInstance>,
        offset: u64,
        size: u64,
    ) -> Result<(), SourceError> {
        let read_len = size as usize;
        if self.file_data_buf.len() < read_len {
            self.file_data_buf.resize(read_len, 0);
        }
        self.vfs.read_data(
            &tx.source_file,
            offset,
            &mut self.file_data_buf[0..read_len],
        )?;
        let file_data_pdu = FileDataPdu::new_no_seg_metadata(
            PduHeader::new_for_file_data(
                tx.pdu_conf,
                0,
                SegmentMetadataFlag::NotPresent,
                SegmentationControl::NoRecordBoundaryPreservation,
            ),
            offset,
            &self.file_data_buf[0..read_len],
        );
        send_pdu_with_buf(
            &self.pdu_sender,
            &mut self.pdu_and_cksum_buffer,
            &file_data_pdu,
        )
    }

    fn prepare_and_send_eof_pdu(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        tx: &SourceTransaction<CountdownInstance>,
        checksum: u32,
        eof_sent_indication: bool,
    ) -> Result<(), SourceError> {
        let eof_pdu = EofPdu::new(
            PduHeader::new_for_file_directive(tx.pdu_conf, 0),
            tx.cond_code_eof.unwrap_or(ConditionCode::NoError),
            checksum,
            tx.file_params.progress,
        );
        self.pdu_send_helper(&eof_pdu)?;
        if eof_sent_indication && self.local_cfg.indication_cfg.eof_sent {
            cfdp_user.eof_sent_indication(&tx.id);
        }
        Ok(())
    }

    fn pdu_send_helper(
        &mut self,
        pdu: &(impl WritablePduPacket + CfdpPdu),
    ) -> Result<(), SourceError> {
        send_pdu_with_buf(&self.pdu_sender, &mut self.pdu_and_cksum_buffer, pdu)
    }

    fn handle_finished_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
        finished_pdu: &FinishedPdu,
    ) -> Result<u32, SourceError> {
        let expected = match tx.step {
            TransactionStep::WaitingForFinished | TransactionStep::WaitingForEofAck => true,
            // The remote entity may conclude the transaction before the EOF PDU was sent, for
            // example after a cancel request on its side.
            TransactionStep::SendingMetadata
            | TransactionStep::SendingFileData
            | TransactionStep::SendingEof => {
                tx.transmission_mode == TransmissionMode::Acknowledged || tx.closure_requested
            }
            TransactionStep::Idle | TransactionStep::NoticeOfCompletion => false,
        };
        if !expected {
            return Err(SourceError::UnexpectedPdu {
                pdu_type: PduType::FileDirective,
                directive_type: Some(FileDirectiveType::FinishedPdu),
            });
        }
        let condition_code = finished_pdu.condition_code();
        if tx.step != TransactionStep::WaitingForFinished
            && tx.step != TransactionStep::WaitingForEofAck
        {
            info!(
                "transaction {}: concluded by the remote entity in step {:?} with condition code {:?}",
                tx.id, tx.step, condition_code
            );
        }
        tx.finished_params = Some(FinishedParams {
            condition_code,
            delivery_code: finished_pdu.delivery_code(),
            file_status: finished_pdu.file_status(),
        });
        let mut sent_packets = 0;
        if tx.transmission_mode == TransmissionMode::Acknowledged {
            self.prepare_and_send_ack_pdu(tx, condition_code, TransactionStatus::Active)?;
            sent_packets += 1;
        }
        // Faults reported by the remote entity are only reported locally. The transaction is
        // complete either way.
        if FaultHandler::<UserFaultHookInstance>::is_fault(condition_code) {
            let fh = self.local_cfg.fault_handler.get_fault_handler(condition_code);
            warn!(
                "transaction {}: remote entity reported fault {:?}",
                tx.id, condition_code
            );
            self.local_cfg.fault_handler.report_fault(
                fh,
                FaultInfo::new(tx.id, condition_code, tx.file_params.progress),
            );
            if fh == FaultHandlerCode::AbandonTransaction {
                user.abandoned_indication(&tx.id, condition_code, tx.file_params.progress);
            } else {
                user.fault_indication(&tx.id, condition_code, tx.file_params.progress);
            }
        }
        self.notice_of_completion(user, tx);
        Ok(sent_packets)
    }

    fn handle_nak_pdu(
        &mut self,
        tx: &mut SourceTransaction<CountdownInstance>,
        nak_pdu: &NakPdu,
    ) -> Result<u32, SourceError> {
        if tx.transmission_mode == TransmissionMode::Unacknowledged {
            debug!("transaction {}: ignoring NAK in unacknowledged mode", tx.id);
            return Ok(0);
        }
        let segment_requests = nak_pdu.segment_requests();
        for &(start, end) in segment_requests {
            if end < start || end > tx.file_params.progress {
                return Err(SourceError::InvalidNakPdu);
            }
        }
        let mut sent_packets = 0;
        for &(start, end) in segment_requests {
            // Special case: Metadata PDU is re-requested.
            if start == 0 && end == 0 {
                self.prepare_and_send_metadata_pdu(tx)?;
                sent_packets += 1;
                continue;
            }
            let mut current_offset = start;
            while current_offset < end {
                let chunk_size = core::cmp::min(end - current_offset, tx.file_params.segment_len);
                self.prepare_and_send_file_data_pdu(tx, current_offset, chunk_size)?;
                sent_packets += 1;
                current_offset += chunk_size;
            }
        }
        debug!(
            "transaction {}: re-transmitted {} PDUs for {} segment requests",
            tx.id,
            sent_packets,
            segment_requests.len()
        );
        if let Some(check_timer) = tx.check_timer.as_mut() {
            check_timer.reset();
        }
        Ok(sent_packets)
    }

    fn handle_ack_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
        ack_pdu: &AckPdu,
    ) -> Result<u32, SourceError> {
        if tx.step != TransactionStep::WaitingForEofAck
            || ack_pdu.directive_code_of_acked_pdu() != FileDirectiveType::EofPdu
        {
            warn!(
                "transaction {}: ignoring ACK for {:?} in step {:?}",
                tx.id,
                ack_pdu.directive_code_of_acked_pdu(),
                tx.step
            );
            return Ok(0);
        }
        tx.ack_timer = None;
        if tx.ack_of_cancellation_pending() {
            tx.finished_params = Some(FinishedParams {
                condition_code: tx.cond_code_eof.unwrap_or(ConditionCode::NoError),
                delivery_code: DeliveryCode::Incomplete,
                file_status: FileStatus::Unreported,
            });
            self.notice_of_completion(user, tx);
            return Ok(0);
        }
        tx.positive_ack_params = None;
        self.start_check_timer(tx);
        tx.step = TransactionStep::WaitingForFinished;
        Ok(0)
    }

    fn notice_of_cancellation(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
        condition_code: ConditionCode,
    ) -> Result<u32, SourceError> {
        tx.cond_code_eof = Some(condition_code);
        tx.state = State::Busy;
        // As specified in 4.11.2.2, prepare an EOF PDU to be sent to the remote entity. Supply
        // the checksum for the file copy progress sent so far.
        let checksum = self.vfs.calculate_checksum(
            &tx.source_file,
            tx.remote_cfg.default_crc_type,
            tx.file_params.progress,
            &mut self.pdu_and_cksum_buffer,
        )?;
        tx.file_params.eof_checksum = Some(checksum);
        self.prepare_and_send_eof_pdu(user, tx, checksum, true)?;
        match tx.transmission_mode {
            TransmissionMode::Unacknowledged => {
                tx.finished_params = Some(FinishedParams {
                    condition_code,
                    delivery_code: DeliveryCode::Incomplete,
                    file_status: FileStatus::Unreported,
                });
                self.notice_of_completion(user, tx);
            }
            TransmissionMode::Acknowledged => self.start_positive_ack_procedure(tx, true),
        }
        Ok(1)
    }

    fn notice_of_suspension(
        &self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
        condition_code: ConditionCode,
    ) {
        info!(
            "transaction {}: suspended with condition code {:?}",
            tx.id, condition_code
        );
        tx.state = State::Suspended;
        if self.local_cfg.indication_cfg.suspended {
            user.suspended_indication(&tx.id, condition_code);
        }
    }

    // Returns the number of packets sent.
    fn declare_fault(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut SourceTransaction<CountdownInstance>,
        condition_code: ConditionCode,
    ) -> Result<u32, SourceError> {
        let mut fh = self.local_cfg.fault_handler.get_fault_handler(condition_code);
        // CFDP standard 4.11.2.2.3: Any fault declared in the course of transferring
        // the EOF (cancel) PDU must result in abandonment of the transaction.
        if tx.ack_of_cancellation_pending() {
            fh = FaultHandlerCode::AbandonTransaction;
        }
        warn!(
            "transaction {}: fault {:?} declared, handling with {:?}",
            tx.id, condition_code, fh
        );
        let progress = tx.file_params.progress;
        self.local_cfg
            .fault_handler
            .report_fault(fh, FaultInfo::new(tx.id, condition_code, progress));
        if fh == FaultHandlerCode::AbandonTransaction {
            user.abandoned_indication(&tx.id, condition_code, progress);
        } else {
            user.fault_indication(&tx.id, condition_code, progress);
        }
        match fh {
            FaultHandlerCode::NoticeOfCancellation => {
                self.notice_of_cancellation(user, tx, condition_code)
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.notice_of_suspension(user, tx, condition_code);
                Ok(0)
            }
            FaultHandlerCode::IgnoreError => Ok(0),
            FaultHandlerCode::AbandonTransaction => {
                tx.finish();
                Ok(0)
            }
        }
    }
}
