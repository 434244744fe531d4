//! # CFDP Destination Entity Module
//!
//! The [DestinationHandler] is the primary component of this module which converts the PDUs
//! sent from a remote source entity back into a file. A file copy operation on the receiver side
//! is started with the reception of a Metadata PDU, for example one generated by the
//! [crate::source::SourceHandler]. After that, file packet data units (PDUs) with the actual
//! file contents will be sent to the destination entity, which will then be assembled back into
//! a file.
//!
//! A file transfer is completed when the EOF PDU was received and all file data was received
//! and the checksum of the reassembled file matches the checksum in the EOF PDU.
//!
//! ### Unacknowledged mode
//!
//! Missing file data after the EOF PDU starts the check timer. File data can still arrive until
//! the check limit is reached. A Finished PDU is only sent if a transaction closure was
//! requested.
//!
//! ### Acknowledged mode
//!
//! 1. Every EOF PDU is acknowledged with an ACK PDU.
//! 2. Missing file data is requested with NAK PDUs. With the immediate NAK mode, gaps are
//!    requested as soon as they are detected. The remaining gaps are requested after the EOF PDU
//!    was received and re-requested each time the check timer expires.
//! 3. A missing Metadata PDU is requested with a NAK for the range `(0, 0)`.
//! 4. The transaction is concluded with a Finished PDU, which is re-sent with the positive ACK
//!    procedure until the remote entity acknowledges it.
use std::path::Path;

use hashbrown::HashMap;
use log::{debug, info, warn};

use crate::filestore::{FilestoreError, VirtualFilestore};
use crate::pdu::ack::AckPdu;
use crate::pdu::eof::EofPdu;
use crate::pdu::file_data::FileDataPdu;
use crate::pdu::finished::{DeliveryCode, FileStatus, FinishedPdu};
use crate::pdu::metadata::MetadataPdu;
use crate::pdu::nak::NakPdu;
use crate::pdu::{
    self, CfdpPdu, ChecksumType, CommonPduConfig, ConditionCode, CrcFlag, FaultHandlerCode,
    FileDirectiveType, Pdu, PduError, PduHeader, PduType, TransactionStatus, TransmissionMode,
    WritablePduPacket,
};
use crate::segments::{ReceivedSegments, SegmentError};
use crate::time::Countdown;
use crate::user::{
    CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams,
};
use crate::util::UnsignedEnum;
use crate::{
    EntityType, FaultInfo, GenericSendError, LocalEntityConfig, PacketTarget, PduRawWithInfo,
    PduProvider, PduSender, PositiveAckParams, RemoteConfigError, RemoteConfigStore,
    RemoteEntityConfig, State, TimerContext, TimerCreator, TransactionId, UserFaultHook,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionStep {
    /// The transaction is finished and will be removed.
    Idle = 0,
    WaitingForMetadata = 1,
    ReceivingFileDataPdus = 2,
    /// EOF was received but file data is still missing.
    WaitingForMissingData = 3,
    TransferCompletion = 4,
    WaitingForFinishedAck = 5,
}

#[derive(Debug, thiserror::Error)]
pub enum DestError {
    #[error("can not process packet type {pdu_type:?} with directive type {directive_type:?}")]
    CantProcessPacketType {
        pdu_type: PduType,
        directive_type: Option<FileDirectiveType>,
    },
    #[error("no active transaction with ID {0} for the received PDU")]
    UnknownTransaction(TransactionId),
    #[error("PDU is addressed to entity {0}")]
    WrongDestinationId(u64),
    #[error("no remote entity configuration found: {0}")]
    NoRemoteCfgFound(#[from] RemoteConfigError),
    #[error("filestore error: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("invalid file segment: {0}")]
    Segment(#[from] SegmentError),
    #[error("file segment at offset {offset} with length {len} exceeds file size {file_size}")]
    SegmentOutOfBounds {
        offset: u64,
        len: usize,
        file_size: u64,
    },
    #[error("error related to PDU: {0}")]
    Pdu(#[from] PduError),
    #[error("issue sending PDU: {0}")]
    Send(#[from] GenericSendError),
}

#[derive(Debug, Clone)]
struct FileProperties {
    dest_file_name: String,
    file_size: u64,
    checksum_type: ChecksumType,
    closure_requested: bool,
}

#[derive(Debug, Copy, Clone)]
struct EofParams {
    condition_code: ConditionCode,
    checksum: u32,
    file_size: u64,
}

#[derive(Debug, Copy, Clone)]
struct FinishedParams {
    condition_code: ConditionCode,
    delivery_code: DeliveryCode,
    file_status: FileStatus,
}

impl Default for FinishedParams {
    fn default() -> Self {
        Self {
            condition_code: ConditionCode::NoError,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::Unreported,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
enum FsmContext {
    #[default]
    None,
    ResetWhenPossible,
}

#[derive(Debug)]
struct DestTransaction<CountdownInstance: Countdown> {
    id: TransactionId,
    remote_cfg: RemoteEntityConfig,
    // Configuration of the PDU which started the transaction. It is re-used for all PDUs sent
    // back to the source entity.
    pdu_conf: CommonPduConfig,
    transmission_mode: TransmissionMode,
    state: State,
    step: TransactionStep,
    file_props: Option<FileProperties>,
    metadata_requested: bool,
    eof: Option<EofParams>,
    segments: ReceivedSegments,
    finished_params: FinishedParams,
    cancelled: bool,
    check_timer: Option<CountdownInstance>,
    check_counter: u32,
    positive_ack_params: Option<PositiveAckParams>,
    ack_timer: Option<CountdownInstance>,
    fsm_ctx: FsmContext,
}

impl<CountdownInstance: Countdown> DestTransaction<CountdownInstance> {
    #[inline]
    fn progress(&self) -> u64 {
        self.segments.highest_offset()
    }

    fn closure_requested(&self) -> bool {
        self.file_props
            .as_ref()
            .is_some_and(|props| props.closure_requested)
    }

    fn all_data_received(&self) -> bool {
        self.eof
            .is_some_and(|eof| self.segments.is_complete(eof.file_size))
    }

    fn finish(&mut self) {
        self.step = TransactionStep::Idle;
        self.state = State::Idle;
        self.fsm_ctx = FsmContext::ResetWhenPossible;
    }
}

/// This is the primary CFDP destination handler. It models the CFDP destination entity, which
/// is primarily responsible for receiving files sent from another CFDP entity. It performs the
/// reception side of File Copy Operations.
///
/// The [DestinationHandler::state_machine] function is the primary function to drive the
/// destination handler. It can be used to insert packets into the destination
/// handler and driving the state machine, which might generate new packets to be sent to the
/// remote entity. Please note that the destination handler can also only process Metadata, EOF,
/// ACK and Prompt PDUs in addition to ACK PDUs where the acknowledged PDU is the Finished PDU.
/// All generated packets are sent using the user provided [PduSender].
///
/// Each transaction is keyed by its [TransactionId], so multiple files can be received at the
/// same time. The handler uses the [VirtualFilestore] abstraction to write the received data.
pub struct DestinationHandler<
    PduSenderInstance: PduSender,
    UserFaultHookInstance: UserFaultHook,
    Vfs: VirtualFilestore,
    RemoteConfigStoreInstance: RemoteConfigStore,
    TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
    CountdownInstance: Countdown,
> {
    local_cfg: LocalEntityConfig<UserFaultHookInstance>,
    pdu_sender: PduSenderInstance,
    pdu_and_cksum_buffer: Vec<u8>,
    vfs: Vfs,
    remote_cfg_table: RemoteConfigStoreInstance,
    timer_creator: TimerCreatorInstance,
    transactions: HashMap<TransactionId, DestTransaction<CountdownInstance>>,
}

impl<
        PduSenderInstance: PduSender,
        UserFaultHookInstance: UserFaultHook,
        Vfs: VirtualFilestore,
        RemoteConfigStoreInstance: RemoteConfigStore,
        TimerCreatorInstance: TimerCreator<Countdown = CountdownInstance>,
        CountdownInstance: Countdown,
    >
    DestinationHandler<
        PduSenderInstance,
        UserFaultHookInstance,
        Vfs,
        RemoteConfigStoreInstance,
        TimerCreatorInstance,
        CountdownInstance,
    >
{
    /// Constructs a new destination handler.
    ///
    /// # Arguments
    ///
    /// * `local_cfg` - The local CFDP entity configuration.
    /// * `pdu_and_cksum_buf_size` - The handler requires a buffer to generate PDUs and perform
    ///   checksum calculations. This size should be large enough to hold the largest generated
    ///   PDU. 2048 or 4096 bytes are sensible values.
    /// * `pdu_sender` - [PduSender] used to send generated PDU packets.
    /// * `vfs` - [VirtualFilestore] implementation used by the handler, which decouples the CFDP
    ///   implementation from the underlying filestore/filesystem.
    /// * `remote_cfg_table` - The [RemoteEntityConfig]s used to look up the configuration of
    ///   the source entities.
    /// * `timer_creator` - [TimerCreator] used by the CFDP handler to generate the check and
    ///   positive ACK timers.
    pub fn new(
        local_cfg: LocalEntityConfig<UserFaultHookInstance>,
        pdu_and_cksum_buf_size: usize,
        pdu_sender: PduSenderInstance,
        vfs: Vfs,
        remote_cfg_table: RemoteConfigStoreInstance,
        timer_creator: TimerCreatorInstance,
    ) -> Self {
        Self {
            local_cfg,
            pdu_sender,
            pdu_and_cksum_buffer: vec![0; pdu_and_cksum_buf_size],
            vfs,
            remote_cfg_table,
            timer_creator,
            transactions: HashMap::new(),
        }
    }

    pub fn state_machine_no_packet(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
    ) -> Result<u32, DestError> {
        self.state_machine(cfdp_user, None::<&PduRawWithInfo>)
    }

    /// This is the core function to drive the destination handler. It is also used to insert
    /// packets into the destination handler.
    ///
    /// The state machine should either be called if a packet with the appropriate destination ID
    /// is received and periodically to check the timers of all active transactions.
    ///
    /// Returns the number of sent packets.
    pub fn state_machine(
        &mut self,
        cfdp_user: &mut impl CfdpUser,
        packet_to_insert: Option<&impl PduProvider>,
    ) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        if let Some(packet) = packet_to_insert {
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

    pub fn step(&self, id: &TransactionId) -> Option<TransactionStep> {
        self.transactions.get(id).map(|tx| tx.step)
    }

    pub fn transmission_mode(&self, id: &TransactionId) -> Option<TransmissionMode> {
        self.transactions.get(id).map(|tx| tx.transmission_mode)
    }

    /// Resolved path of the file written by the transaction. [None] if the transaction is
    /// unknown or the Metadata PDU was not received yet.
    pub fn dest_file_name(&self, id: &TransactionId) -> Option<&str> {
        self.transactions
            .get(id)
            .and_then(|tx| tx.file_props.as_ref())
            .map(|props| props.dest_file_name.as_str())
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

    /// Cancels an active transaction with a notice of cancellation. A Finished PDU is sent
    /// immediately if the transaction is acknowledged or a closure was requested.
    ///
    /// Returns [false] if the transaction is unknown or already cancelled.
    pub fn cancel_request(
        &mut self,
        user: &mut impl CfdpUser,
        transaction_id: &TransactionId,
    ) -> Result<bool, DestError> {
        match self.transactions.get(transaction_id) {
            None => return Ok(false),
            Some(tx) if tx.cancelled => return Ok(false),
            _ => (),
        }
        info!("transaction {}: cancel request received", transaction_id);
        self.process_transaction(transaction_id, |handler, tx| {
            handler.notice_of_cancellation(tx, ConditionCode::CancelRequestReceived);
            handler.transfer_completion(user, tx)
        })?;
        Ok(true)
    }

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
            user.resumed_indication(id, tx.progress());
        }
        true
    }

    /// Drops a transaction without notifying the remote entity. The received file data is
    /// retained.
    pub fn abandon(&mut self, user: &mut impl CfdpUser, id: &TransactionId) -> bool {
        match self.transactions.remove(id) {
            Some(tx) => {
                warn!("transaction {}: abandoned", id);
                user.abandoned_indication(id, ConditionCode::NoError, tx.progress());
                true
            }
            None => false,
        }
    }

    /// Drops all active transactions without any notice.
    pub fn reset(&mut self) {
        self.transactions.clear();
    }

    fn process_transaction<R>(
        &mut self,
        id: &TransactionId,
        f: impl FnOnce(&mut Self, &mut DestTransaction<CountdownInstance>) -> Result<R, DestError>,
    ) -> Result<Option<R>, DestError> {
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
    ) -> Result<u32, DestError> {
        if packet_to_insert.packet_target()? != PacketTarget::DestEntity {
            return Err(DestError::CantProcessPacketType {
                pdu_type: packet_to_insert.pdu_type(),
                directive_type: packet_to_insert.file_directive_type(),
            });
        }
        let pdu = pdu::decode(packet_to_insert.pdu())?;
        let pdu_header = *pdu.pdu_header();
        let id = TransactionId::from_pdu_header(&pdu_header);
        if !self.transactions.contains_key(&id) {
            self.create_transaction(id, &pdu)?;
        }
        Ok(self
            .process_transaction(&id, |handler, tx| handler.handle_pdu(cfdp_user, tx, &pdu))?
            .unwrap_or(0))
    }

    fn create_transaction(&mut self, id: TransactionId, pdu: &Pdu) -> Result<(), DestError> {
        let pdu_conf = *pdu.pdu_header().common_pdu_conf();
        // Without the Metadata PDU, a transaction can only be recovered in acknowledged mode.
        let can_start = match pdu {
            Pdu::Metadata(_) => true,
            Pdu::FileData(_) | Pdu::Eof(_) => {
                pdu_conf.trans_mode == TransmissionMode::Acknowledged
            }
            _ => false,
        };
        if !can_start {
            return Err(DestError::UnknownTransaction(id));
        }
        if pdu_conf.dest_id().value() != self.local_cfg.id.value() {
            return Err(DestError::WrongDestinationId(pdu_conf.dest_id().value()));
        }
        let remote_cfg = *self.remote_cfg_table.lookup(pdu_conf.source_id())?;
        debug!("transaction {}: new transaction", id);
        self.transactions.insert(
            id,
            DestTransaction {
                id,
                remote_cfg,
                pdu_conf,
                transmission_mode: pdu_conf.trans_mode,
                state: State::Busy,
                step: TransactionStep::WaitingForMetadata,
                file_props: None,
                metadata_requested: false,
                eof: None,
                segments: ReceivedSegments::new(),
                finished_params: FinishedParams::default(),
                cancelled: false,
                check_timer: None,
                check_counter: 0,
                positive_ack_params: None,
                ack_timer: None,
                fsm_ctx: FsmContext::None,
            },
        );
        Ok(())
    }

    fn handle_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        pdu: &Pdu,
    ) -> Result<u32, DestError> {
        // File data is still stored for suspended transactions.
        if tx.state == State::Suspended && !matches!(pdu, Pdu::FileData(_)) {
            debug!("transaction {}: ignoring directive while suspended", tx.id);
            return Ok(0);
        }
        match pdu {
            Pdu::Metadata(metadata_pdu) => self.handle_metadata_pdu(user, tx, metadata_pdu),
            Pdu::FileData(file_data_pdu) => self.handle_file_data_pdu(user, tx, file_data_pdu),
            Pdu::Eof(eof_pdu) => self.handle_eof_pdu(user, tx, eof_pdu),
            Pdu::Ack(ack_pdu) => {
                self.handle_ack_pdu(user, tx, ack_pdu);
                Ok(0)
            }
            Pdu::Prompt(_) | Pdu::KeepAlive(_) => {
                debug!("transaction {}: discarding prompt or keep alive PDU", tx.id);
                Ok(0)
            }
            Pdu::Finished(_) | Pdu::Nak(_) => Err(DestError::CantProcessPacketType {
                pdu_type: PduType::FileDirective,
                directive_type: pdu_directive_type(pdu),
            }),
        }
    }

    fn handle_metadata_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        metadata_pdu: &MetadataPdu,
    ) -> Result<u32, DestError> {
        if tx.file_props.is_some() {
            debug!("transaction {}: ignoring duplicate metadata PDU", tx.id);
            return Ok(0);
        }
        let params = metadata_pdu.metadata_params();
        let dest_file_name = self.resolve_dest_path(
            metadata_pdu.src_file_name(),
            metadata_pdu.dest_file_name(),
        )?;
        self.vfs.create_file(&dest_file_name)?;
        info!(
            "transaction {}: receiving {} ({} bytes) into {}",
            tx.id,
            metadata_pdu.src_file_name(),
            params.file_size,
            dest_file_name
        );
        user.metadata_recvd_indication(&MetadataReceivedParams {
            id: tx.id,
            source_id: *tx.id.source_id(),
            file_size: params.file_size,
            src_file_name: metadata_pdu.src_file_name(),
            dest_file_name: &dest_file_name,
        });
        tx.file_props = Some(FileProperties {
            dest_file_name,
            file_size: params.file_size,
            checksum_type: params.checksum_type,
            closure_requested: params.closure_requested,
        });
        tx.step = TransactionStep::ReceivingFileDataPdus;
        // The EOF PDU might have overtaken the Metadata PDU.
        if tx.eof.is_some() {
            return self.evaluate_eof(user, tx);
        }
        Ok(0)
    }

    fn resolve_dest_path(&self, src_file: &str, dest_file: &str) -> Result<String, DestError> {
        if !self.vfs.exists(dest_file)? || !self.vfs.is_dir(dest_file)? {
            return Ok(dest_file.to_string());
        }
        let file_name = self
            .vfs
            .file_name(src_file)?
            .ok_or_else(|| FilestoreError::IsNotFile(src_file.to_string()))?;
        let full_path = Path::new(dest_file).join(file_name);
        Ok(full_path
            .to_str()
            .ok_or(FilestoreError::Utf8Error)?
            .to_string())
    }

    fn handle_file_data_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        file_data_pdu: &FileDataPdu,
    ) -> Result<u32, DestError> {
        let Some(file_props) = tx.file_props.as_ref() else {
            return self.request_metadata(tx);
        };
        if tx.step != TransactionStep::ReceivingFileDataPdus
            && tx.step != TransactionStep::WaitingForMissingData
        {
            debug!(
                "transaction {}: ignoring file data PDU in step {:?}",
                tx.id, tx.step
            );
            return Ok(0);
        }
        let file_data = file_data_pdu.file_data();
        if file_data.is_empty() {
            return Ok(0);
        }
        let offset = file_data_pdu.offset();
        let end = offset
            .checked_add(file_data.len() as u64)
            .ok_or(PduError::MalformedPdu("file segment end exceeds the offset range"))?;
        if end > file_props.file_size {
            warn!(
                "transaction {}: file segment ({}, {}) exceeds file size {}",
                tx.id, offset, end, file_props.file_size
            );
            return Err(DestError::SegmentOutOfBounds {
                offset,
                len: file_data.len(),
                file_size: file_props.file_size,
            });
        }
        let previous_progress = tx.progress();
        self.vfs
            .write_data(&file_props.dest_file_name, offset, file_data)?;
        let new_data = tx.segments.add(offset, end)?;
        if self.local_cfg.indication_cfg.file_segment_recv {
            user.file_segment_recvd_indication(&FileSegmentRecvdParams {
                id: tx.id,
                offset,
                length: file_data.len(),
                segment_metadata: file_data_pdu.segment_metadata(),
            });
        }
        if tx.step == TransactionStep::WaitingForMissingData {
            if tx.all_data_received() {
                self.checksum_verify(user, tx)?;
            }
            return Ok(0);
        }
        if new_data
            && offset > previous_progress
            && tx.transmission_mode == TransmissionMode::Acknowledged
            && tx.remote_cfg.immediate_nak_mode
        {
            debug!(
                "transaction {}: gap ({}, {}) detected",
                tx.id, previous_progress, offset
            );
            self.send_nak_pdu(
                tx,
                previous_progress,
                offset,
                vec![(previous_progress, offset)],
            )?;
            return Ok(1);
        }
        Ok(0)
    }

    fn handle_eof_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        eof_pdu: &EofPdu,
    ) -> Result<u32, DestError> {
        let mut sent_packets = 0;
        if tx.transmission_mode == TransmissionMode::Acknowledged {
            let ack_pdu = AckPdu::new_for_eof_pdu(
                PduHeader::new_for_file_directive(tx.pdu_conf, 0),
                eof_pdu.condition_code(),
                TransactionStatus::Active,
            );
            self.pdu_send_helper(&ack_pdu)?;
            sent_packets += 1;
        }
        if let Some(eof) = tx.eof {
            if eof.condition_code == eof_pdu.condition_code() {
                debug!("transaction {}: duplicate EOF PDU", tx.id);
                return Ok(sent_packets);
            }
        }
        tx.eof = Some(EofParams {
            condition_code: eof_pdu.condition_code(),
            checksum: eof_pdu.file_checksum(),
            file_size: eof_pdu.file_size(),
        });
        if self.local_cfg.indication_cfg.eof_recv {
            user.eof_recvd_indication(&tx.id);
        }
        if tx.file_props.is_none() {
            return Ok(sent_packets + self.request_metadata(tx)?);
        }
        Ok(sent_packets + self.evaluate_eof(user, tx)?)
    }

    // Decides how to continue after the EOF PDU and the Metadata PDU were both received.
    fn evaluate_eof(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
        let Some(eof) = tx.eof else {
            return Ok(0);
        };
        if eof.condition_code != ConditionCode::NoError {
            info!(
                "transaction {}: cancelled by the source entity with condition code {:?}",
                tx.id, eof.condition_code
            );
            self.notice_of_cancellation(tx, eof.condition_code);
            return Ok(0);
        }
        if tx.progress() > eof.file_size {
            let fh = self.declare_fault(user, tx, ConditionCode::FileSizeError);
            if fh != FaultHandlerCode::IgnoreError {
                return Ok(0);
            }
        }
        if tx.all_data_received() {
            self.checksum_verify(user, tx)?;
            return Ok(0);
        }
        tx.step = TransactionStep::WaitingForMissingData;
        self.start_check_timer(tx);
        if tx.transmission_mode == TransmissionMode::Acknowledged {
            return self.request_missing_data(tx);
        }
        Ok(0)
    }

    fn checksum_verify(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<(), DestError> {
        let (Some(file_props), Some(eof)) = (tx.file_props.as_ref(), tx.eof) else {
            return Ok(());
        };
        let result = self.vfs.checksum_verify(
            eof.checksum,
            &file_props.dest_file_name,
            file_props.checksum_type,
            eof.file_size,
            &mut self.pdu_and_cksum_buffer,
        );
        tx.check_timer = None;
        let fault = match result {
            Ok(true) => {
                tx.finished_params = FinishedParams {
                    condition_code: ConditionCode::NoError,
                    delivery_code: DeliveryCode::Complete,
                    file_status: FileStatus::Retained,
                };
                tx.step = TransactionStep::TransferCompletion;
                return Ok(());
            }
            Ok(false) => {
                warn!(
                    "transaction {}: checksum verification of {} failed",
                    tx.id, file_props.dest_file_name
                );
                ConditionCode::FileChecksumFailure
            }
            Err(FilestoreError::ChecksumTypeNotImplemented(checksum_type)) => {
                warn!(
                    "transaction {}: checksum type {:?} not supported",
                    tx.id, checksum_type
                );
                ConditionCode::UnsupportedChecksumType
            }
            Err(e) => return Err(e.into()),
        };
        if self.declare_fault(user, tx, fault) == FaultHandlerCode::IgnoreError {
            tx.finished_params = FinishedParams {
                condition_code: fault,
                delivery_code: delivery_code(tx, fault),
                file_status: FileStatus::Retained,
            };
            tx.step = TransactionStep::TransferCompletion;
        }
        Ok(())
    }

    fn handle_ack_pdu(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        ack_pdu: &AckPdu,
    ) {
        if tx.step != TransactionStep::WaitingForFinishedAck
            || ack_pdu.directive_code_of_acked_pdu() != FileDirectiveType::FinishedPdu
        {
            warn!(
                "transaction {}: ignoring ACK for {:?} in step {:?}",
                tx.id,
                ack_pdu.directive_code_of_acked_pdu(),
                tx.step
            );
            return;
        }
        tx.ack_timer = None;
        tx.positive_ack_params = None;
        self.notice_of_completion(user, tx);
    }

    fn fsm_busy(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
        if tx.state == State::Suspended {
            return Ok(0);
        }
        let mut sent_packets = 0;
        if tx.step == TransactionStep::WaitingForMissingData {
            sent_packets += self.check_limit_handling(user, tx)?;
        }
        if tx.step == TransactionStep::WaitingForFinishedAck {
            sent_packets += self.handle_positive_ack_procedures(user, tx)?;
        }
        if tx.step == TransactionStep::TransferCompletion {
            sent_packets += self.transfer_completion(user, tx)?;
        }
        Ok(sent_packets)
    }

    fn check_limit_handling(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
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
            self.declare_fault(user, tx, ConditionCode::CheckLimitReached);
            return Ok(0);
        }
        if tx.transmission_mode == TransmissionMode::Acknowledged {
            return self.request_missing_data(tx);
        }
        Ok(0)
    }

    fn handle_positive_ack_procedures(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
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
            self.declare_fault(user, tx, ConditionCode::PositiveAckLimitReached);
            return Ok(0);
        }
        positive_ack_params.ack_counter += 1;
        tx.positive_ack_params = Some(positive_ack_params);
        debug!(
            "transaction {}: positive ACK timer expired, re-sending Finished PDU",
            tx.id
        );
        self.send_finished_pdu(tx)?;
        Ok(1)
    }

    fn transfer_completion(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
        if tx.transmission_mode == TransmissionMode::Acknowledged {
            self.send_finished_pdu(tx)?;
            tx.step = TransactionStep::WaitingForFinishedAck;
            tx.positive_ack_params = Some(PositiveAckParams {
                ack_counter: 0,
                positive_ack_of_cancellation: tx.cancelled,
            });
            tx.ack_timer = Some(
                self.timer_creator
                    .create_countdown(TimerContext::PositiveAck {
                        expiry_time: tx.remote_cfg.positive_ack_timer_interval,
                    }),
            );
            return Ok(1);
        }
        let mut sent_packets = 0;
        if tx.closure_requested() {
            self.send_finished_pdu(tx)?;
            sent_packets += 1;
        }
        self.notice_of_completion(user, tx);
        Ok(sent_packets)
    }

    fn notice_of_completion(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
    ) {
        info!(
            "transaction {}: finished with condition code {:?}, delivery code {:?}",
            tx.id, tx.finished_params.condition_code, tx.finished_params.delivery_code
        );
        if self.local_cfg.indication_cfg.transaction_finished {
            user.transaction_finished_indication(&TransactionFinishedParams {
                id: tx.id,
                condition_code: tx.finished_params.condition_code,
                delivery_code: tx.finished_params.delivery_code,
                file_status: tx.finished_params.file_status,
            });
        }
        tx.finish();
    }

    fn notice_of_cancellation(
        &mut self,
        tx: &mut DestTransaction<CountdownInstance>,
        condition_code: ConditionCode,
    ) {
        tx.finished_params = FinishedParams {
            condition_code,
            delivery_code: delivery_code(tx, condition_code),
            file_status: self.file_status_on_cancellation(tx),
        };
        tx.cancelled = true;
        tx.state = State::Busy;
        tx.step = TransactionStep::TransferCompletion;
        tx.check_timer = None;
        tx.ack_timer = None;
    }

    fn file_status_on_cancellation(&self, tx: &DestTransaction<CountdownInstance>) -> FileStatus {
        let Some(file_props) = tx.file_props.as_ref() else {
            return FileStatus::Unreported;
        };
        if !tx.remote_cfg.disposition_on_cancellation {
            return FileStatus::Retained;
        }
        match self.vfs.remove_file(&file_props.dest_file_name) {
            Ok(()) => FileStatus::DiscardDeliberately,
            Err(e) => {
                warn!(
                    "transaction {}: removing {} failed: {}",
                    tx.id, file_props.dest_file_name, e
                );
                FileStatus::DiscardedFsRejection
            }
        }
    }

    fn notice_of_suspension(
        &self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
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

    fn declare_fault(
        &mut self,
        user: &mut impl CfdpUser,
        tx: &mut DestTransaction<CountdownInstance>,
        condition_code: ConditionCode,
    ) -> FaultHandlerCode {
        let mut fh = self.local_cfg.fault_handler.get_fault_handler(condition_code);
        // Any fault declared while the cancelling Finished PDU is transferred leads to
        // abandonment of the transaction.
        if tx
            .positive_ack_params
            .is_some_and(|params| params.positive_ack_of_cancellation)
        {
            fh = FaultHandlerCode::AbandonTransaction;
        }
        warn!(
            "transaction {}: fault {:?} declared, handling with {:?}",
            tx.id, condition_code, fh
        );
        let progress = tx.progress();
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
                self.notice_of_cancellation(tx, condition_code)
            }
            FaultHandlerCode::NoticeOfSuspension => {
                self.notice_of_suspension(user, tx, condition_code)
            }
            FaultHandlerCode::IgnoreError => (),
            FaultHandlerCode::AbandonTransaction => tx.finish(),
        }
        fh
    }

    fn start_check_timer(&self, tx: &mut DestTransaction<CountdownInstance>) {
        tx.check_counter = 0;
        tx.check_timer = Some(
            self.timer_creator
                .create_countdown(TimerContext::CheckLimit {
                    local_id: self.local_cfg.id,
                    remote_id: tx.remote_cfg.entity_id,
                    entity_type: EntityType::Receiving,
                    expiry_time: tx.remote_cfg.check_timer_interval,
                }),
        );
    }

    fn request_metadata(
        &mut self,
        tx: &mut DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
        if tx.metadata_requested || tx.transmission_mode != TransmissionMode::Acknowledged {
            return Ok(0);
        }
        debug!("transaction {}: requesting metadata PDU", tx.id);
        self.send_nak_pdu(tx, 0, 0, vec![(0, 0)])?;
        tx.metadata_requested = true;
        Ok(1)
    }

    // Requests all missing data up to the file size in the EOF PDU. The segment requests are
    // split into multiple NAK PDUs if they do not fit into one packet.
    fn request_missing_data(
        &mut self,
        tx: &DestTransaction<CountdownInstance>,
    ) -> Result<u32, DestError> {
        let Some(eof) = tx.eof else {
            return Ok(0);
        };
        let missing_segments = tx.segments.missing_segments(eof.file_size);
        if missing_segments.is_empty() {
            return Ok(0);
        }
        let header_len = PduHeader::new_for_file_directive(tx.pdu_conf, 0).header_len();
        let fss_width = tx.pdu_conf.file_flag.fss_width();
        let crc_len = if tx.pdu_conf.crc_flag == CrcFlag::WithCrc {
            2
        } else {
            0
        };
        let fixed_len = header_len + 1 + 2 * fss_width + crc_len;
        let max_reqs_per_pdu = core::cmp::max(
            1,
            tx.remote_cfg.max_packet_len.saturating_sub(fixed_len) / (2 * fss_width),
        );
        let num_pdus = missing_segments.len().div_ceil(max_reqs_per_pdu);
        for (idx, chunk) in missing_segments.chunks(max_reqs_per_pdu).enumerate() {
            let start_of_scope = if idx == 0 { 0 } else { chunk[0].0 };
            let end_of_scope = if idx == num_pdus - 1 {
                eof.file_size
            } else {
                chunk[chunk.len() - 1].1
            };
            self.send_nak_pdu(tx, start_of_scope, end_of_scope, chunk.to_vec())?;
        }
        debug!(
            "transaction {}: requested {} missing segments with {} NAK PDUs",
            tx.id,
            missing_segments.len(),
            num_pdus
        );
        Ok(num_pdus as u32)
    }

    fn send_nak_pdu(
        &mut self,
        tx: &DestTransaction<CountdownInstance>,
        start_of_scope: u64,
        end_of_scope: u64,
        segment_requests: Vec<(u64, u64)>,
    ) -> Result<(), DestError> {
        let nak_pdu = NakPdu::new(
            PduHeader::new_for_file_directive(tx.pdu_conf, 0),
            start_of_scope,
            end_of_scope,
            segment_requests,
        )?;
        self.pdu_send_helper(&nak_pdu)
    }

    fn send_finished_pdu(
        &mut self,
        tx: &DestTransaction<CountdownInstance>,
    ) -> Result<(), DestError> {
        let finished_pdu = FinishedPdu::new(
            PduHeader::new_for_file_directive(tx.pdu_conf, 0),
            tx.finished_params.condition_code,
            tx.finished_params.delivery_code,
            tx.finished_params.file_status,
        );
        self.pdu_send_helper(&finished_pdu)
    }

    fn pdu_send_helper(
        &mut self,
        pdu: &(impl WritablePduPacket + CfdpPdu),
    ) -> Result<(), DestError> {
        if self.pdu_and_cksum_buffer.len() < pdu.len_written() {
            self.pdu_and_cksum_buffer.resize(pdu.len_written(), 0);
        }
        let written_len = pdu.write_to_bytes(&mut self.pdu_and_cksum_buffer)?;
        self.pdu_sender.send_pdu(
            pdu.pdu_type(),
            pdu.file_directive_type(),
            &self.pdu_and_cksum_buffer[0..written_len],
        )?;
        Ok(())
    }
}

fn pdu_directive_type(pdu: &Pdu) -> Option<FileDirectiveType> {
    match pdu {
        Pdu::FileData(_) => None,
        Pdu::Metadata(_) => Some(FileDirectiveType::MetadataPdu),
        Pdu::Eof(_) => Some(FileDirectiveType::EofPdu),
        Pdu::Finished(_) => Some(FileDirectiveType::FinishedPdu),
        Pdu::Ack(_) => Some(FileDirectiveType::AckPdu),
        Pdu::Nak(_) => Some(FileDirectiveType::NakPdu),
        Pdu::Prompt(_) => Some(FileDirectiveType::PromptPdu),
        Pdu::KeepAlive(_) => Some(FileDirectiveType::KeepAlivePdu),
    }
}

// Data which failed or skipped the checksum verification is never reported as complete.
fn delivery_code<C: Countdown>(
    tx: &DestTransaction<C>,
    condition_code: ConditionCode,
) -> DeliveryCode {
    let unverified = matches!(
        condition_code,
        ConditionCode::FileChecksumFailure | ConditionCode::UnsupportedChecksumType
    );
    if tx.all_data_received() && !unverified {
        DeliveryCode::Complete
    } else {
        DeliveryCode::Incomplete
    }
}
