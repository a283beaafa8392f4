//! 상태 코드와 상태 채널 보고
//!
//! 상태 notification: `[code:u8]` + 선택적 `[offset:u32 LE][total:u32 LE]`

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::link::LinkState;
use crate::registry::FileCandidate;
use crate::transport::{Channel, ConnHandle, Transport};

/// 1바이트 상태 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    // 수명 주기
    Started = 0x01,
    Complete = 0x02,
    Paused = 0x03,
    StoppedByHost = 0x04,
    Progress = 0x05,

    // 선택
    ListReady = 0x10,
    FileSelected = 0x11,
    InvalidIndex = 0x12,

    // 거부
    BadCommand = 0x20,
    AlreadyRunning = 0x21,
    SubscriptionRequired = 0x22,
    NoFile = 0x23,
    Busy = 0x24,
    NoConnection = 0x25,

    // 실패
    FileOpenFail = 0x30,
    FileReadFail = 0x31,
    NotifyFail = 0x32,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        use StatusCode::*;
        Some(match value {
            0x01 => Started,
            0x02 => Complete,
            0x03 => Paused,
            0x04 => StoppedByHost,
            0x05 => Progress,
            0x10 => ListReady,
            0x11 => FileSelected,
            0x12 => InvalidIndex,
            0x20 => BadCommand,
            0x21 => AlreadyRunning,
            0x22 => SubscriptionRequired,
            0x23 => NoFile,
            0x24 => Busy,
            0x25 => NoConnection,
            0x30 => FileOpenFail,
            0x31 => FileReadFail,
            0x32 => NotifyFail,
            _ => return None,
        })
    }

    /// 명령 거부 계열
    pub fn is_rejection(self) -> bool {
        (0x20..0x30).contains(&(self as u8)) || self == StatusCode::InvalidIndex
    }

    /// 세션 실패 계열
    pub fn is_failure(self) -> bool {
        (0x30..0x40).contains(&(self as u8))
    }
}

/// 상태 notification 하나
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub code: StatusCode,
    pub detail: StatusDetail,
}

/// 상태 코드 뒤에 붙는 필드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDetail {
    None,

    /// 진행 위치와 전체 크기
    Progress { offset: u32, total: u32 },

    /// 최신 후보 요약
    Listing {
        count: u16,
        size: u32,
        name: String,
    },
}

impl StatusReport {
    pub fn bare(code: StatusCode) -> Self {
        Self {
            code,
            detail: StatusDetail::None,
        }
    }

    pub fn progress(code: StatusCode, offset: u64, total: u64) -> Self {
        Self {
            code,
            detail: StatusDetail::Progress {
                offset: clamp_u32(offset),
                total: clamp_u32(total),
            },
        }
    }

    /// LIST_FILES 응답 (후보 없으면 count=0, 빈 이름)
    pub fn listing(newest: Option<&FileCandidate>, count: usize) -> Self {
        let (size, name) = newest
            .map(|c| (clamp_u32(c.size), c.name.clone()))
            .unwrap_or((0, String::new()));
        Self {
            code: StatusCode::ListReady,
            detail: StatusDetail::Listing {
                count: count.min(u16::MAX as usize) as u16,
                size,
                name,
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u8(self.code.as_u8());
        match &self.detail {
            StatusDetail::None => {}
            StatusDetail::Progress { offset, total } => {
                buf.put_u32_le(*offset);
                buf.put_u32_le(*total);
            }
            StatusDetail::Listing { count, size, name } => {
                buf.put_u16_le(*count);
                buf.put_u32_le(*size);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.freeze()
    }
}

fn clamp_u32(value: u64) -> u32 {
    value.min(u32::MAX as u64) as u32
}

/// 상태 채널 보고자
///
/// fire-and-forget: 전송 실패는 로그만 남기고 재시도하지 않음
#[derive(Clone)]
pub struct StatusReporter {
    transport: Arc<dyn Transport>,
    link: Arc<LinkState>,
}

impl StatusReporter {
    pub fn new(transport: Arc<dyn Transport>, link: Arc<LinkState>) -> Self {
        Self { transport, link }
    }

    /// 상태 전송, 실제로 제출되었으면 true
    pub fn emit(&self, conn: ConnHandle, report: &StatusReport) -> bool {
        if !self.link.is_connected(conn) {
            warn!("상태 {:?} 전송 불가: 연결 없음 (conn={})", report.code, conn);
            return false;
        }
        if !self.link.is_subscribed(conn, Channel::Status) {
            warn!("상태 {:?} 전송 불가: 상태 채널 미구독", report.code);
            return false;
        }

        match self
            .transport
            .notify(conn, Channel::Status, &report.encode())
        {
            Ok(()) => {
                debug!("상태 전송: {:?}", report.code);
                true
            }
            Err(e) => {
                warn!("상태 {:?} 전송 실패: {}", report.code, e);
                false
            }
        }
    }

    pub fn emit_code(&self, conn: ConnHandle, code: StatusCode) -> bool {
        self.emit(conn, &StatusReport::bare(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_code_table_roundtrip() {
        for raw in 0u8..=0xFF {
            if let Some(code) = StatusCode::from_u8(raw) {
                assert_eq!(code.as_u8(), raw);
            }
        }
        assert_eq!(StatusCode::from_u8(0x00), None);
    }

    #[test]
    fn test_code_groups() {
        assert!(StatusCode::Busy.is_rejection());
        assert!(StatusCode::InvalidIndex.is_rejection());
        assert!(!StatusCode::Complete.is_rejection());
        assert!(StatusCode::NotifyFail.is_failure());
        assert!(!StatusCode::NoFile.is_failure());
    }

    #[test]
    fn test_progress_layout() {
        let bytes = StatusReport::progress(StatusCode::Complete, 10_000, 10_000).encode();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(u32::from_le_bytes(bytes[1..5].try_into().unwrap()), 10_000);
        assert_eq!(u32::from_le_bytes(bytes[5..9].try_into().unwrap()), 10_000);
    }

    #[test]
    fn test_listing_layout() {
        let candidate = FileCandidate {
            name: "rec_0002.raw".into(),
            path: "/sdcard/rec/rec_0002.raw".into(),
            size: 4242,
            modified: SystemTime::UNIX_EPOCH,
        };
        let bytes = StatusReport::listing(Some(&candidate), 3).encode();

        assert_eq!(bytes[0], StatusCode::ListReady.as_u8());
        assert_eq!(u16::from_le_bytes([bytes[1], bytes[2]]), 3);
        assert_eq!(u32::from_le_bytes(bytes[3..7].try_into().unwrap()), 4242);
        assert_eq!(&bytes[7..], b"rec_0002.raw");

        let empty = StatusReport::listing(None, 0).encode();
        assert_eq!(empty.len(), 7);
    }
}
