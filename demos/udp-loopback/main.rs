//! Copies a file between two CFDP entities which exchange PDUs over UDP sockets on localhost.
//!
//! The sending entity runs the source handler, the receiving entity runs the destination handler.
//! Both run in their own thread and the application exits when both entities have finished the
//! transaction.
use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use cfdp::{
    dest::DestinationHandler,
    filestore::NativeFilestore,
    pdu::{ChecksumType, ConditionCode, PduError, TransmissionMode},
    request::PutRequest,
    seq_count::SeqCountProviderSimple,
    source::SourceHandler,
    user::{CfdpUser, FileSegmentRecvdParams, MetadataReceivedParams, TransactionFinishedParams},
    util::{UnsignedByteFieldU16, UnsignedEnum},
    EntityType, FaultInfo, IndicationConfig, LocalEntityConfig, PduOwnedWithInfo, PduProvider,
    RemoteConfigList, RemoteEntityConfig, StdTimerCreator, TransactionId, UserFaultHook,
};
use clap::Parser;
use log::{debug, error, info, warn};

const SOURCE_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(1);
const DEST_ID: UnsignedByteFieldU16 = UnsignedByteFieldU16::new(2);

const MAX_PACKET_LEN: usize = 1024;
const IDLE_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Copy, Clone, clap::ValueEnum)]
pub enum TransmissionModeCli {
    Nak,
    Ack,
}

#[derive(clap::Parser)]
#[command(about = "Copy a file between two CFDP entities connected by UDP")]
pub struct Cli {
    /// File to send.
    source_file: PathBuf,
    /// Destination path. A directory receives a file with the name of the source file.
    dest_file: PathBuf,
    #[arg(short, long, default_value = "nak")]
    mode: TransmissionModeCli,
    #[arg(short, long)]
    closure_requested: Option<bool>,
    #[arg(long, default_value_t = 5111)]
    source_port: u16,
    #[arg(long, default_value_t = 5222)]
    dest_port: u16,
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
    #[arg(short, long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[derive(Default)]
pub struct LoggingFaultHook {}

impl UserFaultHook for LoggingFaultHook {
    fn notice_of_suspension_cb(&mut self, fault_info: FaultInfo) {
        warn!("suspension: {:?}", fault_info);
    }

    fn notice_of_cancellation_cb(&mut self, fault_info: FaultInfo) {
        warn!("cancellation: {:?}", fault_info);
    }

    fn abandoned_cb(&mut self, fault_info: FaultInfo) {
        error!("abandonment: {:?}", fault_info);
    }

    fn ignore_cb(&mut self, fault_info: FaultInfo) {
        warn!("ignored fault: {:?}", fault_info);
    }
}

pub struct DemoCfdpUser {
    entity_type: EntityType,
    completion_signal: Arc<AtomicBool>,
}

impl DemoCfdpUser {
    pub fn new(entity_type: EntityType, completion_signal: Arc<AtomicBool>) -> Self {
        Self {
            entity_type,
            completion_signal,
        }
    }
}

impl CfdpUser for DemoCfdpUser {
    fn transaction_indication(&mut self, id: &TransactionId) {
        info!("{:?} entity: transaction indication for {}", self.entity_type, id);
    }

    fn eof_sent_indication(&mut self, id: &TransactionId) {
        info!("{:?} entity: EOF sent for transaction {}", self.entity_type, id);
    }

    fn transaction_finished_indication(&mut self, finished_params: &TransactionFinishedParams) {
        info!(
            "{:?} entity: transaction finished: {:?}",
            self.entity_type, finished_params
        );
        self.completion_signal.store(true, Ordering::Relaxed);
    }

    fn metadata_recvd_indication(&mut self, md_recvd_params: &MetadataReceivedParams) {
        info!(
            "{:?} entity: metadata received: {:?}",
            self.entity_type, md_recvd_params
        );
    }

    fn file_segment_recvd_indication(&mut self, segment_recvd_params: &FileSegmentRecvdParams) {
        debug!(
            "{:?} entity: file segment with offset {} and length {} received",
            self.entity_type, segment_recvd_params.offset, segment_recvd_params.length
        );
    }

    fn suspended_indication(&mut self, id: &TransactionId, condition_code: ConditionCode) {
        warn!(
            "{:?} entity: transaction {} suspended: {:?}",
            self.entity_type, id, condition_code
        );
    }

    fn resumed_indication(&mut self, id: &TransactionId, progress: u64) {
        info!(
            "{:?} entity: transaction {} resumed at progress {}",
            self.entity_type, id, progress
        );
    }

    fn fault_indication(&mut self, id: &TransactionId, condition_code: ConditionCode, progress: u64) {
        warn!(
            "{:?} entity: fault {:?} in transaction {} at progress {}",
            self.entity_type, condition_code, id, progress
        );
    }

    fn abandoned_indication(
        &mut self,
        id: &TransactionId,
        condition_code: ConditionCode,
        progress: u64,
    ) {
        error!(
            "{:?} entity: transaction {} abandoned with {:?} at progress {}",
            self.entity_type, id, condition_code, progress
        );
        self.completion_signal.store(true, Ordering::Relaxed);
    }

    fn eof_recvd_indication(&mut self, id: &TransactionId) {
        info!("{:?} entity: EOF received for transaction {}", self.entity_type, id);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UdpLinkError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
}

/// One end of the UDP link. Received datagrams are converted into PDUs and PDUs generated by
/// the local handler are forwarded to the peer.
pub struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
    recv_buf: Vec<u8>,
    tm_rx: mpsc::Receiver<PduOwnedWithInfo>,
}

impl UdpLink {
    pub fn new(
        port: u16,
        peer: SocketAddr,
        tm_rx: mpsc::Receiver<PduOwnedWithInfo>,
    ) -> Result<Self, io::Error> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, port))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            peer,
            recv_buf: vec![0; MAX_PACKET_LEN * 2],
            tm_rx,
        })
    }

    pub fn try_recv(&mut self) -> Result<Option<PduOwnedWithInfo>, UdpLinkError> {
        let len = match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let pdu = PduOwnedWithInfo::new_from_raw_packet(&self.recv_buf[0..len])?;
        debug!(
            "received {:?} {:?} PDU with {} bytes",
            pdu.pdu_type(),
            pdu.file_directive_type(),
            len
        );
        Ok(Some(pdu))
    }

    pub fn send_pending(&self) -> usize {
        let mut sent = 0;
        while let Ok(pdu) = self.tm_rx.try_recv() {
            match self.socket.send_to(pdu.pdu(), self.peer) {
                Ok(_) => sent += 1,
                Err(e) => warn!("sending PDU to {} failed: {}", self.peer, e),
            }
        }
        sent
    }
}

fn setup_logger(level: log::LevelFilter) -> Result<(), log::SetLoggerError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                std::thread::current().name().unwrap_or("main"),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
}

fn main() {
    let cli_args = Cli::parse();
    setup_logger(cli_args.log_level).expect("setting up the logger failed");
    let trans_mode = match cli_args.mode {
        TransmissionModeCli::Ack => TransmissionMode::Acknowledged,
        TransmissionModeCli::Nak => TransmissionMode::Unacknowledged,
    };
    let source_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, cli_args.source_port));
    let dest_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, cli_args.dest_port));

    let (source_tm_tx, source_tm_rx) = mpsc::channel::<PduOwnedWithInfo>();
    let (dest_tm_tx, dest_tm_rx) = mpsc::channel::<PduOwnedWithInfo>();
    let mut source_link = UdpLink::new(cli_args.source_port, dest_addr, source_tm_rx)
        .expect("creating source UDP link failed");
    let mut dest_link = UdpLink::new(cli_args.dest_port, source_addr, dest_tm_rx)
        .expect("creating destination UDP link failed");

    let remote_cfg_of_dest = RemoteEntityConfig::new_with_default_values(
        DEST_ID.into(),
        MAX_PACKET_LEN,
        false,
        false,
        trans_mode,
        ChecksumType::Crc32,
    );
    let mut source_handler = SourceHandler::new(
        LocalEntityConfig::new(
            SOURCE_ID.into(),
            IndicationConfig::default(),
            LoggingFaultHook::default(),
        ),
        source_tm_tx,
        NativeFilestore::default(),
        2048,
        RemoteConfigList::from(remote_cfg_of_dest),
        StdTimerCreator::default(),
        SeqCountProviderSimple::default(),
    );
    let remote_cfg_of_source = RemoteEntityConfig::new_with_default_values(
        SOURCE_ID.into(),
        MAX_PACKET_LEN,
        false,
        false,
        trans_mode,
        ChecksumType::Crc32,
    );
    let mut dest_handler = DestinationHandler::new(
        LocalEntityConfig::new(
            DEST_ID.into(),
            IndicationConfig::default(),
            LoggingFaultHook::default(),
        ),
        2048,
        dest_tm_tx,
        NativeFilestore::default(),
        RemoteConfigList::from(remote_cfg_of_source),
        StdTimerCreator::default(),
    );

    let source_done = Arc::new(AtomicBool::new(false));
    let dest_done = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::new(AtomicBool::new(false));
    let mut source_user = DemoCfdpUser::new(EntityType::Sending, source_done.clone());
    let mut dest_user = DemoCfdpUser::new(EntityType::Receiving, dest_done.clone());

    let source_file = cli_args
        .source_file
        .to_str()
        .expect("source path is not valid UTF-8")
        .to_string();
    let dest_file = cli_args
        .dest_file
        .to_str()
        .expect("destination path is not valid UTF-8")
        .to_string();
    let put_request = PutRequest::new_regular_request(
        DEST_ID.into(),
        &source_file,
        &dest_file,
        Some(trans_mode),
        cli_args.closure_requested,
    )
    .expect("invalid put request");
    let id = source_handler
        .put_request(&mut source_user, &put_request)
        .expect("put request failed");
    info!("started transaction {} in {:?} mode", id, trans_mode);

    let stop_source = stop_signal.clone();
    let jh_source = thread::Builder::new()
        .name("cfdp src entity".to_string())
        .spawn(move || {
            while !stop_source.load(Ordering::Relaxed) {
                let pdu = match source_link.try_recv() {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        warn!("source link error: {}", e);
                        None
                    }
                };
                let sent = match source_handler.state_machine(&mut source_user, pdu.as_ref()) {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!("cfdp src entity error: {}", e);
                        0
                    }
                };
                source_link.send_pending();
                if sent == 0 && pdu.is_none() {
                    thread::sleep(IDLE_DELAY);
                }
            }
        })
        .expect("spawning source thread failed");

    let stop_dest = stop_signal.clone();
    let jh_dest = thread::Builder::new()
        .name("cfdp dest entity".to_string())
        .spawn(move || {
            info!("destination entity {} listening", DEST_ID.value());
            while !stop_dest.load(Ordering::Relaxed) {
                let pdu = match dest_link.try_recv() {
                    Ok(pdu) => pdu,
                    Err(e) => {
                        warn!("destination link error: {}", e);
                        None
                    }
                };
                let sent = match dest_handler.state_machine(&mut dest_user, pdu.as_ref()) {
                    Ok(sent) => sent,
                    Err(e) => {
                        warn!("cfdp dest entity error: {}", e);
                        0
                    }
                };
                dest_link.send_pending();
                if sent == 0 && pdu.is_none() {
                    thread::sleep(IDLE_DELAY);
                }
            }
        })
        .expect("spawning destination thread failed");

    let start = Instant::now();
    let timeout = Duration::from_secs(cli_args.timeout_secs);
    while !(source_done.load(Ordering::Relaxed) && dest_done.load(Ordering::Relaxed)) {
        if start.elapsed() > timeout {
            error!("file copy not finished after {:?}", timeout);
            break;
        }
        thread::sleep(IDLE_DELAY);
    }
    stop_signal.store(true, Ordering::Relaxed);
    jh_source.join().expect("source thread panicked");
    jh_dest.join().expect("destination thread panicked");
    info!("file copy finished after {:?}", start.elapsed());
}
