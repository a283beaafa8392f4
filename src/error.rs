//! 에러 타입 정의

use thiserror::Error;

/// 전송 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("패킷이 너무 짧음: {len} bytes")]
    Truncated { len: usize },

    #[error("페이로드 길이 불일치: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("유효하지 않은 EOF 플래그: {0:#04x}")]
    InvalidEofFlag(u8),

    #[error("시퀀스 불연속: expected {expected}, got {got}")]
    SequenceGap { expected: u16, got: u16 },

    #[error("EOF 이후 데이터 수신: seq={seq}")]
    DataAfterEof { seq: u16 },

    #[error("알 수 없는 명령: {0:#04x}")]
    UnknownCommand(u8),

    #[error("잘못된 명령 형식: opcode={opcode:#04x}, {reason}")]
    MalformedCommand { opcode: u8, reason: &'static str },

    #[error("유효하지 않은 파일 이름 {name:?}: {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    #[error("유효하지 않은 RAW 헤더: magic {got:08X}")]
    InvalidRawMagic { got: u32 },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
