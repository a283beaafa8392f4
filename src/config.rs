//! 전송 엔진 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result, DEFAULT_ATT_MTU, DEFAULT_CREDIT_CAPACITY, DEFAULT_MAX_PAYLOAD};

/// 전송 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 녹음 파일 디렉터리
    pub recordings_dir: PathBuf,

    /// 전송 대상 확장자 (점 제외)
    pub file_extension: String,

    /// 송신 크레딧 수 (동시 미확인 notification 상한)
    pub credit_capacity: usize,

    /// 크레딧 획득 대기 타임아웃 (밀리초)
    pub credit_timeout_ms: u64,

    /// 크레딧 타임아웃 후 재시도 전 대기 (밀리초)
    pub backpressure_sleep_ms: u64,

    /// 청크 전송 간격 (마이크로초)
    /// 크레딧이 남아 있어도 전송 계층 큐를 포화시키지 않도록 유지
    pub chunk_interval_us: u64,

    /// 청크당 최대 페이로드 (바이트)
    pub max_payload: usize,

    /// MTU 협상 전 기본값
    pub default_mtu: u16,

    /// 패킷당 전송 시도 횟수
    pub max_send_attempts: u32,

    /// 버퍼 부족 시 첫 백오프 (밀리초), 이후 2배씩 증가
    pub no_buffer_backoff_ms: u64,

    /// 버퍼 부족 백오프 상한 (밀리초)
    pub no_buffer_backoff_max_ms: u64,

    /// 혼잡 시 고정 백오프 (밀리초)
    pub congested_backoff_ms: u64,

    /// 명령 큐 깊이
    pub command_queue_depth: usize,

    /// 전송 전 RAW 헤더 검사
    pub raw_preflight: bool,

    /// 진행률 notification 간격 (바이트), 0이면 비활성화
    pub progress_interval_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("/sdcard/rec"),
            file_extension: "raw".to_string(),
            credit_capacity: DEFAULT_CREDIT_CAPACITY,
            credit_timeout_ms: 200,
            backpressure_sleep_ms: 5,
            chunk_interval_us: 2_000,       // 2ms
            max_payload: DEFAULT_MAX_PAYLOAD,
            default_mtu: DEFAULT_ATT_MTU,
            max_send_attempts: 8,
            no_buffer_backoff_ms: 10,
            no_buffer_backoff_max_ms: 100,
            congested_backoff_ms: 8,
            command_queue_depth: 8,
            raw_preflight: false,
            progress_interval_bytes: 0,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 디렉터리만 바꾼 기본 설정
    pub fn with_recordings_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            recordings_dir: dir.into(),
            ..Self::default()
        }
    }

    /// 저전력 모드용 설정
    pub fn low_spec() -> Self {
        Self {
            credit_capacity: 2,
            chunk_interval_us: 10_000,      // 10ms
            backpressure_sleep_ms: 20,
            command_queue_depth: 4,
            ..Self::default()
        }
    }

    /// 고성능 링크용 설정 (2M PHY, 큰 MTU)
    pub fn high_performance() -> Self {
        Self {
            credit_capacity: 6,
            chunk_interval_us: 500,
            max_payload: 495,
            backpressure_sleep_ms: 2,
            ..Self::default()
        }
    }

    pub fn credit_timeout(&self) -> Duration {
        Duration::from_millis(self.credit_timeout_ms)
    }

    pub fn backpressure_sleep(&self) -> Duration {
        Duration::from_millis(self.backpressure_sleep_ms)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_micros(self.chunk_interval_us)
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.credit_capacity == 0 {
            return Err(Error::InvalidConfig("credit_capacity must be >= 1".into()));
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "max_payload out of range: {}",
                self.max_payload
            )));
        }
        if self.max_send_attempts == 0 {
            return Err(Error::InvalidConfig("max_send_attempts must be >= 1".into()));
        }
        if self.command_queue_depth == 0 {
            return Err(Error::InvalidConfig("command_queue_depth must be >= 1".into()));
        }
        if self.file_extension.is_empty() || self.file_extension.contains('.') {
            return Err(Error::InvalidConfig(format!(
                "file_extension must be a bare suffix: {:?}",
                self.file_extension
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::low_spec().validate().is_ok());
        assert!(Config::high_performance().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_credits() {
        let config = Config {
            credit_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_dotted_extension() {
        let config = Config {
            file_extension: ".raw".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
