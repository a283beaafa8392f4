//! 전송 세션과 상태 머신
//!
//! `Idle → Active → {Paused ⇄ Active} → {Completed | Stopped | Error} → Idle`
//!
//! 세션 필드는 워커만 수정한다. 다른 컨텍스트는 `SessionFlags`와
//! `TransferSnapshot`만 읽는다.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs::File;

use crate::status::StatusCode;
use crate::transport::{Channel, ConnHandle};

/// 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferState {
    Idle = 0,
    Active = 1,
    Paused = 2,
    Completed = 3,
    Stopped = 4,
    Error = 5,
}

impl TransferState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TransferState::Active,
            2 => TransferState::Paused,
            3 => TransferState::Completed,
            4 => TransferState::Stopped,
            5 => TransferState::Error,
            _ => TransferState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Stopped | TransferState::Error
        )
    }
}

/// 세션 종료 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// 모든 바이트 전송
    Completed,

    /// 호스트 STOP
    StoppedByHost,

    /// 연결 끊김 (상태 전송 불가)
    Disconnected,

    /// 엔진 종료
    Shutdown,

    /// 치명적 실패
    Failed(StatusCode),
}

impl SessionEnd {
    pub fn terminal_state(self) -> TransferState {
        match self {
            SessionEnd::Completed => TransferState::Completed,
            SessionEnd::StoppedByHost | SessionEnd::Disconnected | SessionEnd::Shutdown => {
                TransferState::Stopped
            }
            SessionEnd::Failed(_) => TransferState::Error,
        }
    }

    /// 종료 시 보낼 상태 코드
    pub fn status(self) -> Option<StatusCode> {
        match self {
            SessionEnd::Completed => Some(StatusCode::Complete),
            SessionEnd::StoppedByHost => Some(StatusCode::StoppedByHost),
            SessionEnd::Failed(code) => Some(code),
            SessionEnd::Disconnected | SessionEnd::Shutdown => None,
        }
    }
}

/// 활성 전송 세션 (시스템 전체에 최대 1개)
#[derive(Debug)]
pub struct TransferSession {
    /// 원본 파일 경로
    pub source: PathBuf,

    /// 전체 크기 (바이트)
    pub total_size: u64,

    /// 지금까지 보낸 바이트
    pub bytes_sent: u64,

    /// 다음 시퀀스 번호
    pub next_seq: u16,

    pub paused: bool,

    /// 열린 파일 (세션과 함께 해제)
    pub file: File,

    /// 대상 연결
    pub conn: ConnHandle,

    pub data_channel: Channel,

    /// 마지막 진행률 notification 위치
    pub last_progress: u64,
}

impl TransferSession {
    pub fn new(source: PathBuf, total_size: u64, file: File, conn: ConnHandle) -> Self {
        Self {
            source,
            total_size,
            bytes_sent: 0,
            next_seq: 0,
            paused: false,
            file,
            conn,
            data_channel: Channel::Data,
            last_progress: 0,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.bytes_sent)
    }

    pub fn state(&self) -> TransferState {
        if self.paused {
            TransferState::Paused
        } else {
            TransferState::Active
        }
    }

    /// 한 청크 전송 성공 후 진행
    pub fn advance(&mut self, sent: usize) {
        self.bytes_sent += sent as u64;
        self.next_seq = self.next_seq.wrapping_add(1);
    }
}

/// 두 컨텍스트가 공유하는 플래그
#[derive(Debug, Default)]
pub struct SessionFlags {
    recording_active: AtomicBool,
    storage_available: AtomicBool,
    transfer_active: AtomicBool,
    transfer_paused: AtomicBool,

    /// 연결 끊김 등으로 진행 중인 대기를 중단해야 함
    abort: AtomicBool,

    state: AtomicU8,
    bytes_sent: AtomicU64,
    total_size: AtomicU64,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self {
            storage_available: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn set_recording_active(&self, active: bool) {
        self.recording_active.store(active, Ordering::Release);
    }

    pub fn recording_active(&self) -> bool {
        self.recording_active.load(Ordering::Acquire)
    }

    pub fn set_storage_available(&self, available: bool) {
        self.storage_available.store(available, Ordering::Release);
    }

    pub fn storage_available(&self) -> bool {
        self.storage_available.load(Ordering::Acquire)
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer_active.load(Ordering::Acquire)
    }

    pub fn transfer_paused(&self) -> bool {
        self.transfer_paused.load(Ordering::Acquire)
    }

    pub(crate) fn request_abort(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub(crate) fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub(crate) fn clear_abort(&self) {
        self.abort.store(false, Ordering::Release);
    }

    /// 워커가 세션 상태 게시
    pub(crate) fn publish(&self, state: TransferState, bytes_sent: u64, total_size: u64) {
        self.bytes_sent.store(bytes_sent, Ordering::Release);
        self.total_size.store(total_size, Ordering::Release);
        self.transfer_paused
            .store(state == TransferState::Paused, Ordering::Release);
        self.transfer_active.store(
            matches!(state, TransferState::Active | TransferState::Paused),
            Ordering::Release,
        );
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            state: TransferState::from_u8(self.state.load(Ordering::Acquire)),
            bytes_sent: self.bytes_sent.load(Ordering::Acquire),
            total_size: self.total_size.load(Ordering::Acquire),
        }
    }
}

/// 상태 읽기 응답
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub state: TransferState,
    pub bytes_sent: u64,
    pub total_size: u64,
}

impl TransferSnapshot {
    /// `[state:u8][offset:u32 LE][size:u32 LE]`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(self.state as u8);
        buf.put_u32_le(self.bytes_sent.min(u32::MAX as u64) as u32);
        buf.put_u32_le(self.total_size.min(u32::MAX as u64) as u32);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_snapshot() {
        let flags = SessionFlags::new();
        assert!(flags.storage_available());
        assert_eq!(flags.snapshot().state, TransferState::Idle);

        flags.publish(TransferState::Paused, 512, 4096);
        assert!(flags.transfer_active());
        assert!(flags.transfer_paused());

        let snapshot = flags.snapshot();
        assert_eq!(snapshot.state, TransferState::Paused);
        assert_eq!(
            &snapshot.encode()[..],
            &[2, 0x00, 0x02, 0, 0, 0x00, 0x10, 0, 0]
        );

        flags.publish(TransferState::Idle, 0, 0);
        assert!(!flags.transfer_active());
        assert!(!flags.transfer_paused());
    }

    #[test]
    fn test_session_end_mapping() {
        assert_eq!(SessionEnd::Completed.status(), Some(StatusCode::Complete));
        assert_eq!(SessionEnd::Disconnected.status(), None);
        assert_eq!(
            SessionEnd::Failed(StatusCode::NotifyFail).terminal_state(),
            TransferState::Error
        );
        assert!(TransferState::Stopped.is_terminal());
        assert!(!TransferState::Paused.is_terminal());
    }
}
