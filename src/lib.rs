//! # notixfer
//!
//! notification 기반 청크 파일 전송 엔진 (오디오 레코더 펌웨어용)
//!
//! ## 핵심 특징
//! - **크레딧 흐름 제어**: 전송 계층 큐에 동시에 올라가는 notification 수 제한
//! - **MTU 적응**: 청크마다 현재 MTU로 페이로드 크기 재계산
//! - **단일 워커**: 파일 I/O와 전송은 한 태스크, 콜백은 큐잉만
//! - **재시도 정책**: 버퍼 부족/혼잡은 백오프 후 재시도, 영구 에러는 즉시 실패
//! - **상태 채널**: 모든 수락/거부/종료를 1바이트 코드로 보고
//!
//! 와이어 형식: `[seq:u16 LE][len:u16 LE][eof:u8][payload]`

pub mod command;
pub mod config;
pub mod credit;
pub mod engine;
pub mod error;
pub mod link;
pub mod packet;
pub mod raw_format;
pub mod registry;
pub mod session;
pub mod stats;
pub mod status;
pub mod transport;

pub use command::{Command, Opcode};
pub use config::Config;
pub use credit::{Credit, CreditPool};
pub use engine::{Engine, EngineHandle};
pub use error::{Error, Result};
pub use link::LinkState;
pub use packet::{payload_budget, Packet, PacketHeader, Reassembler};
pub use registry::{FileCandidate, FileRegistry, SelectionError};
pub use session::{SessionEnd, TransferSnapshot, TransferState};
pub use stats::TransferStats;
pub use status::{StatusCode, StatusReport};
pub use transport::{Channel, ConnHandle, RetryPolicy, Transport, TransportError};

/// 협상 전 기본 ATT MTU
pub const DEFAULT_ATT_MTU: u16 = 23;

/// 기본 크레딧 수 (동시 in-flight notification)
pub const DEFAULT_CREDIT_CAPACITY: usize = 3;

/// 청크 페이로드 상한
pub const DEFAULT_MAX_PAYLOAD: usize = 244;
