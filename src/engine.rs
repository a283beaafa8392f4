//! 전송 엔진
//!
//! - `EngineHandle`: 전송 계층 콜백 컨텍스트용 제어면 (절대 블로킹하지 않음)
//! - `Worker`: 단일 태스크, 모든 파일 I/O와 패킷 전송 담당
//!
//! 세션은 워커만 소유하므로 잠금이 없다. 제어면은 명령을 큐에 넣거나
//! 원자 플래그만 건드린다.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::command::Command;
use crate::config::Config;
use crate::credit::CreditPool;
use crate::link::LinkState;
use crate::packet::{payload_budget, Packet};
use crate::raw_format;
use crate::registry::{FileCandidate, FileRegistry, SelectionError};
use crate::session::{SessionEnd, SessionFlags, TransferSession, TransferSnapshot, TransferState};
use crate::stats::TransferStats;
use crate::status::{StatusCode, StatusReport, StatusReporter};
use crate::transport::{submit_with_retry, Channel, ConnHandle, RetryPolicy, Transport};
use crate::Result;

/// 워커로 가는 메시지
#[derive(Debug)]
enum WorkerMsg {
    Command { conn: ConnHandle, cmd: Command },
    Disconnected(ConnHandle),
    Shutdown,
}

/// 엔진과 제어면이 공유하는 상태
struct Shared {
    config: Config,
    link: Arc<LinkState>,
    flags: SessionFlags,
    credits: CreditPool,
    reporter: StatusReporter,
    last_stats: RwLock<Option<TransferStats>>,
    last_end: RwLock<Option<SessionEnd>>,
}

/// 전송 엔진
pub struct Engine;

impl Engine {
    /// 엔진 생성 및 워커 태스크 시작 (tokio 런타임 안에서 호출)
    pub fn spawn(config: Config, transport: Arc<dyn Transport>) -> Result<EngineHandle> {
        config.validate()?;

        let link = Arc::new(LinkState::new(config.default_mtu));
        let shared = Arc::new(Shared {
            credits: CreditPool::new(config.credit_capacity),
            reporter: StatusReporter::new(transport.clone(), link.clone()),
            flags: SessionFlags::new(),
            last_stats: RwLock::new(None),
            last_end: RwLock::new(None),
            link,
            config,
        });

        let (tx, rx) = mpsc::channel(shared.config.command_queue_depth);

        let worker = Worker {
            registry: FileRegistry::new(
                shared.config.recordings_dir.clone(),
                shared.config.file_extension.clone(),
            ),
            policy: RetryPolicy::from_config(&shared.config),
            shared: shared.clone(),
            transport,
            rx,
            session: None,
            stats: TransferStats::default(),
        };

        info!(
            "전송 엔진 시작: dir={:?}, credits={}",
            shared.config.recordings_dir, shared.config.credit_capacity
        );
        let join = tokio::spawn(worker.run());

        Ok(EngineHandle {
            shared,
            tx,
            worker: Arc::new(Mutex::new(Some(join))),
        })
    }
}

/// 제어면 핸들
///
/// 모든 메서드는 논블로킹 (`shutdown` 제외)
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    tx: mpsc::Sender<WorkerMsg>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    /// 제어 채널 쓰기 처리
    ///
    /// 형식 오류는 즉시 `BadCommand`로 거부 (파일시스템 접근 없음)
    pub fn on_control_write(&self, conn: ConnHandle, bytes: &[u8]) -> std::result::Result<(), StatusCode> {
        match Command::decode(bytes) {
            Ok(cmd) => self.submit(conn, cmd),
            Err(e) => {
                warn!("잘못된 제어 명령 (conn={}): {}", conn, e);
                self.shared.reporter.emit_code(conn, StatusCode::BadCommand);
                Err(StatusCode::BadCommand)
            }
        }
    }

    /// 디코드된 명령 큐잉
    pub fn submit(&self, conn: ConnHandle, cmd: Command) -> std::result::Result<(), StatusCode> {
        debug!("명령 수신 (conn={}): {:?}", conn, cmd);
        match self.tx.try_send(WorkerMsg::Command { conn, cmd }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("명령 큐 가득 참, 거부");
                self.shared.reporter.emit_code(conn, StatusCode::Busy);
                Err(StatusCode::Busy)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("엔진 종료됨, 명령 거부");
                Err(StatusCode::Busy)
            }
        }
    }

    /// 연결 수립
    pub fn on_connect(&self, conn: ConnHandle) {
        info!("Peer connected: conn={}", conn);
        self.shared.link.connect(conn);
    }

    /// 연결 해제, 진행 중인 세션은 다음 청크 경계에서 정리된다
    pub fn on_disconnect(&self, conn: ConnHandle) {
        let was_current = self.shared.link.disconnect(conn);
        info!("Peer disconnected: conn={} (current={})", conn, was_current);

        if was_current && self.shared.flags.transfer_active() {
            self.shared.flags.request_abort();
        }
        // 일시정지 중인 워커를 깨우는 알림. 큐가 가득 차서 버려지면
        // 워커는 쌓인 명령으로 이미 깨어나 다음 청크 경계에서 abort를 본다
        let _ = self.tx.try_send(WorkerMsg::Disconnected(conn));
    }

    /// 구독 변경 (CCCD 쓰기)
    pub fn on_subscribe(&self, conn: ConnHandle, channel: Channel, enabled: bool) {
        debug!("구독 변경: conn={}, {:?}={}", conn, channel, enabled);
        self.shared.link.set_subscribed(conn, channel, enabled);
    }

    /// MTU 변경, 다음 청크부터 적용
    pub fn on_mtu_change(&self, conn: ConnHandle, mtu: u16) {
        if !self.shared.link.is_connected(conn) {
            debug!("알 수 없는 연결의 MTU 변경 무시: conn={}", conn);
            return;
        }
        self.shared.link.set_mtu(mtu);
        info!(
            "MTU 변경: {} (payload budget {})",
            mtu,
            payload_budget(mtu, self.shared.config.max_payload)
        );
    }

    /// notification이 전송 계층 큐를 떠남 → 크레딧 반환
    ///
    /// 끊긴 연결의 신호는 무시한다. 해당 크레딧은 연결 해제 시 이미 회수됨
    pub fn on_tx_complete(&self, conn: ConnHandle) {
        if !self.shared.link.is_connected(conn) {
            trace!("끊긴 연결의 tx-complete 무시: conn={}", conn);
            return;
        }
        self.shared.credits.release();
    }

    /// 녹음 서브시스템 상태
    pub fn set_recording_active(&self, active: bool) {
        self.shared.flags.set_recording_active(active);
    }

    /// 저장 매체 상태
    pub fn set_storage_available(&self, available: bool) {
        self.shared.flags.set_storage_available(available);
    }

    /// 상태 특성 읽기 응답
    pub fn status_snapshot(&self) -> TransferSnapshot {
        self.shared.flags.snapshot()
    }

    /// 상태 특성 읽기 응답 (와이어 형식)
    pub fn status_read(&self) -> Bytes {
        self.status_snapshot().encode()
    }

    pub fn is_transfer_active(&self) -> bool {
        self.shared.flags.transfer_active()
    }

    /// 마지막으로 끝난 세션의 통계
    pub fn last_stats(&self) -> Option<TransferStats> {
        self.shared.last_stats.read().clone()
    }

    /// 마지막으로 끝난 세션의 종료 사유
    pub fn last_end(&self) -> Option<SessionEnd> {
        *self.shared.last_end.read()
    }

    pub fn credits(&self) -> &CreditPool {
        &self.shared.credits
    }

    pub fn link(&self) -> &LinkState {
        &self.shared.link
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// 워커 종료 (진행 중인 세션은 정리됨)
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerMsg::Shutdown).await;
        let join = self.worker.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                warn!("워커 종료 에러: {}", e);
            }
        }
    }
}

/// 세션 구동 결과
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// 한 번의 전송 단계 결과
#[derive(Debug)]
enum Step {
    Sent,
    Backpressure,
    Done,
}

/// 전송 워커 (단일 태스크에서만 접근)
struct Worker {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    rx: mpsc::Receiver<WorkerMsg>,
    registry: FileRegistry,
    policy: RetryPolicy,
    session: Option<TransferSession>,
    stats: TransferStats,
}

impl Worker {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            let flow = match msg {
                WorkerMsg::Shutdown => Flow::Shutdown,
                WorkerMsg::Disconnected(conn) => {
                    trace!("유휴 상태에서 연결 해제: conn={}", conn);
                    Flow::Continue
                }
                WorkerMsg::Command { conn, cmd } => {
                    self.handle_idle_command(conn, cmd).await;
                    if self.session.is_some() {
                        self.drive_session().await
                    } else {
                        Flow::Continue
                    }
                }
            };

            if flow == Flow::Shutdown {
                break;
            }
        }

        self.finish(SessionEnd::Shutdown);
        info!("전송 워커 종료");
    }

    fn reporter(&self) -> &StatusReporter {
        &self.shared.reporter
    }

    /// 세션이 없을 때의 명령 처리
    async fn handle_idle_command(&mut self, conn: ConnHandle, cmd: Command) {
        match cmd {
            Command::ListRequest => self.report_listing(conn),
            Command::Pause | Command::Resume | Command::Stop => {
                debug!("활성 세션 없음: {:?} 거부", cmd);
                self.reporter().emit_code(conn, StatusCode::BadCommand);
            }
            start => {
                if let Err(code) = self.try_start(conn, &start).await {
                    info!("전송 시작 거부 ({:?}): {:?}", start, code);
                    self.reporter().emit_code(conn, code);
                }
            }
        }
    }

    /// 전제 조건 검사 후 세션 생성
    ///
    /// 거부 시 어떤 상태도 바꾸지 않는다
    async fn try_start(&mut self, conn: ConnHandle, cmd: &Command) -> std::result::Result<(), StatusCode> {
        let shared = self.shared.clone();

        if self.session.is_some() {
            return Err(StatusCode::AlreadyRunning);
        }
        if shared.flags.recording_active() {
            return Err(StatusCode::Busy);
        }
        if !shared.link.is_connected(conn) {
            return Err(StatusCode::NoConnection);
        }
        if !shared.link.notifies_ready(conn) {
            return Err(StatusCode::SubscriptionRequired);
        }
        if !shared.flags.storage_available() {
            return Err(StatusCode::NoFile);
        }

        let candidate = self.resolve(cmd)?;

        if shared.config.raw_preflight {
            if let Err(e) = raw_format::preflight(&candidate.path).await {
                warn!("RAW 사전 검사 실패 {:?}: {}", candidate.path, e);
                return Err(StatusCode::FileOpenFail);
            }
        }

        let file = match tokio::fs::File::open(&candidate.path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("파일 열기 실패 {:?}: {}", candidate.path, e);
                return Err(StatusCode::FileOpenFail);
            }
        };
        let total_size = match file.metadata().await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            Ok(_) => return Err(StatusCode::NoFile),
            Err(e) => {
                warn!("파일 메타데이터 실패 {:?}: {}", candidate.path, e);
                return Err(StatusCode::FileOpenFail);
            }
        };

        info!(
            "File transfer started: {:?} ({} bytes, conn={})",
            candidate.path, total_size, conn
        );

        shared.flags.clear_abort();
        self.session = Some(TransferSession::new(candidate.path, total_size, file, conn));
        self.stats = TransferStats::new(total_size);
        shared.flags.publish(TransferState::Active, 0, total_size);

        let code = match cmd {
            Command::SelectIndexed(_) => StatusCode::FileSelected,
            _ => StatusCode::Started,
        };
        shared
            .reporter
            .emit(conn, &StatusReport::progress(code, 0, total_size));
        Ok(())
    }

    /// 명령 → 전송할 파일
    fn resolve(&self, cmd: &Command) -> std::result::Result<FileCandidate, StatusCode> {
        match cmd {
            Command::Start => match self.registry.newest() {
                Ok(Some(candidate)) => Ok(candidate),
                Ok(None) => Err(StatusCode::NoFile),
                Err(e) => {
                    warn!("레지스트리 스캔 실패: {}", e);
                    Err(StatusCode::NoFile)
                }
            },
            Command::StartNamed(name) => self.registry.resolve_named(name).map_err(|e| match e {
                SelectionError::InvalidName(_) => StatusCode::BadCommand,
                _ => StatusCode::NoFile,
            }),
            Command::SelectIndexed(index) => {
                self.registry
                    .select_index(*index as usize)
                    .map_err(|e| match e {
                        SelectionError::IndexOutOfRange { index, count } => {
                            debug!("인덱스 범위 초과: {} >= {}", index, count);
                            StatusCode::InvalidIndex
                        }
                        _ => StatusCode::NoFile,
                    })
            }
            _ => Err(StatusCode::BadCommand),
        }
    }

    /// LIST_FILES 응답: 최신 후보 요약
    fn report_listing(&self, conn: ConnHandle) {
        if !self.shared.flags.storage_available() {
            self.reporter().emit_code(conn, StatusCode::NoFile);
            return;
        }

        match self.registry.scan() {
            Ok(candidates) => {
                let report = StatusReport::listing(candidates.first(), candidates.len());
                self.reporter().emit(conn, &report);
            }
            Err(e) => {
                warn!("레지스트리 스캔 실패: {}", e);
                self.reporter().emit_code(conn, StatusCode::NoFile);
            }
        }
    }

    /// 세션이 끝날 때까지 전송 루프 구동
    async fn drive_session(&mut self) -> Flow {
        loop {
            // 청크 경계: 쌓인 명령 처리
            loop {
                match self.rx.try_recv() {
                    Ok(msg) => {
                        if let Some(flow) = self.handle_active_message(msg) {
                            return flow;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.finish(SessionEnd::Shutdown);
                        return Flow::Shutdown;
                    }
                }
            }

            if self.shared.flags.abort_requested() {
                self.finish(SessionEnd::Disconnected);
                return Flow::Continue;
            }

            let paused = self.session.as_ref().map(|s| s.paused).unwrap_or(false);
            if paused {
                match self.rx.recv().await {
                    Some(msg) => {
                        if let Some(flow) = self.handle_active_message(msg) {
                            return flow;
                        }
                    }
                    None => {
                        self.finish(SessionEnd::Shutdown);
                        return Flow::Shutdown;
                    }
                }
                continue;
            }

            match self.send_next_chunk().await {
                Ok(Step::Sent) | Ok(Step::Backpressure) => {}
                Ok(Step::Done) => {
                    self.finish(SessionEnd::Completed);
                    return Flow::Continue;
                }
                Err(code) => {
                    let end = if self.shared.flags.abort_requested() {
                        SessionEnd::Disconnected
                    } else {
                        SessionEnd::Failed(code)
                    };
                    self.finish(end);
                    return Flow::Continue;
                }
            }
        }
    }

    /// 세션 진행 중 메시지 처리, 세션이 끝나면 Some 반환
    fn handle_active_message(&mut self, msg: WorkerMsg) -> Option<Flow> {
        let shared = self.shared.clone();

        match msg {
            WorkerMsg::Shutdown => {
                self.finish(SessionEnd::Shutdown);
                Some(Flow::Shutdown)
            }
            WorkerMsg::Disconnected(conn) => {
                let ours = self.session.as_ref().map(|s| s.conn == conn).unwrap_or(false);
                if ours {
                    self.finish(SessionEnd::Disconnected);
                    Some(Flow::Continue)
                } else {
                    None
                }
            }
            WorkerMsg::Command { conn, cmd } => match cmd {
                Command::Stop => {
                    info!("File transfer stopped by host");
                    self.finish(SessionEnd::StoppedByHost);
                    Some(Flow::Continue)
                }
                Command::ListRequest => {
                    self.report_listing(conn);
                    None
                }
                Command::Pause => {
                    self.set_paused(conn, true);
                    None
                }
                Command::Resume => {
                    self.set_paused(conn, false);
                    None
                }
                start => {
                    debug!("이미 전송 중: {:?} 거부", start);
                    shared.reporter.emit_code(conn, StatusCode::AlreadyRunning);
                    None
                }
            },
        }
    }

    /// 일시정지/재개, 반복 요청도 현재 위치를 다시 보고한다
    fn set_paused(&mut self, conn: ConnHandle, paused: bool) {
        let shared = self.shared.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        session.paused = paused;
        let (sent, total) = (session.bytes_sent, session.total_size);
        shared.flags.publish(session.state(), sent, total);

        let code = if paused {
            info!("전송 일시정지: {}/{} bytes", sent, total);
            StatusCode::Paused
        } else {
            info!("전송 재개: {}/{} bytes", sent, total);
            StatusCode::Started
        };
        shared
            .reporter
            .emit(conn, &StatusReport::progress(code, sent, total));
    }

    /// 청크 하나 전송
    async fn send_next_chunk(&mut self) -> std::result::Result<Step, StatusCode> {
        let shared = self.shared.clone();
        let config = &shared.config;

        let Some(session) = self.session.as_mut() else {
            return Ok(Step::Done);
        };
        let remaining = session.remaining();
        if remaining == 0 {
            return Ok(Step::Done);
        }

        let Some(credit) = shared.credits.acquire(config.credit_timeout()).await else {
            // 백프레셔: 세션은 유지
            self.stats.record_credit_timeout();
            tokio::time::sleep(config.backpressure_sleep()).await;
            return Ok(Step::Backpressure);
        };

        // MTU는 청크마다 다시 읽는다
        let budget = payload_budget(shared.link.mtu(), config.max_payload);
        let len = remaining.min(budget as u64) as usize;

        let mut payload = vec![0u8; len];
        if let Err(e) = session.file.read_exact(&mut payload).await {
            warn!(
                "파일 읽기 실패 {:?} @ {}: {}",
                session.source, session.bytes_sent, e
            );
            return Err(StatusCode::FileReadFail);
        }

        let eof = session.bytes_sent + len as u64 == session.total_size;
        let packet = Packet::new(session.next_seq, Bytes::from(payload), eof);
        let wire = packet.encode();

        let report = match submit_with_retry(
            self.transport.as_ref(),
            session.conn,
            session.data_channel,
            &wire,
            &self.policy,
        )
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    "청크 전송 실패 seq={} @ {}: {}",
                    session.next_seq, session.bytes_sent, e
                );
                // credit은 여기서 drop되어 반환
                return Err(StatusCode::NotifyFail);
            }
        };
        credit.mark_sent();

        trace!(
            "청크 전송: seq={}, len={}, eof={}, attempts={}",
            session.next_seq,
            len,
            eof,
            report.attempts
        );
        session.advance(len);
        self.stats.record_chunk(len, report.attempts, budget);
        shared
            .flags
            .publish(TransferState::Active, session.bytes_sent, session.total_size);

        let interval = config.progress_interval_bytes;
        if interval > 0 && !eof && session.bytes_sent - session.last_progress >= interval {
            session.last_progress = session.bytes_sent;
            shared.reporter.emit(
                session.conn,
                &StatusReport::progress(StatusCode::Progress, session.bytes_sent, session.total_size),
            );
        }

        if eof {
            return Ok(Step::Done);
        }

        if config.chunk_interval_us > 0 {
            tokio::time::sleep(config.chunk_interval()).await;
        }
        Ok(Step::Sent)
    }

    /// 세션 종료 및 정리 (파일 닫기, 크레딧 회수, 상태 초기화)
    fn finish(&mut self, end: SessionEnd) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let shared = self.shared.clone();

        session.paused = false;
        self.stats.finish();

        shared
            .flags
            .publish(end.terminal_state(), session.bytes_sent, session.total_size);

        if let Some(code) = end.status() {
            shared.reporter.emit(
                session.conn,
                &StatusReport::progress(code, session.bytes_sent, session.total_size),
            );
        }

        // tx-complete가 더 오지 않는 경로만 회수. 실패 시에는 링크가 살아 있어
        // 이미 제출된 notification의 tx-complete가 계속 도착한다
        if matches!(end, SessionEnd::Disconnected | SessionEnd::Shutdown) {
            shared.credits.reset();
        }

        info!(
            "전송 종료 ({:?}): {:?} | {}",
            end,
            session.source,
            self.stats.summary()
        );

        *shared.last_stats.write() = Some(self.stats.clone());
        *shared.last_end.write() = Some(end);

        // 파일 핸들 해제
        drop(session);
        shared.flags.clear_abort();
        shared.flags.publish(TransferState::Idle, 0, 0);
    }
}
