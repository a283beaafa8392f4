//! 전송 계층 추상화
//!
//! notification 기반 링크(GATT notify 등)를 감싸는 경계.
//! 엔진은 `Transport::notify`만 호출하고, 연결/구독/MTU/tx-complete 이벤트는
//! `EngineHandle`로 전달받는다.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;

/// 연결 식별자
pub type ConnHandle = u16;

/// notification 채널
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 청크 데이터
    Data,

    /// 1바이트 상태 코드
    Status,
}

impl Channel {
    /// 구독 비트마스크 비트
    pub fn bit(self) -> u8 {
        match self {
            Channel::Data => 0b01,
            Channel::Status => 0b10,
        }
    }
}

/// 전송 계층 에러
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 전송 버퍼 없음 (일시적)
    #[error("전송 버퍼 없음")]
    NoBuffer,

    /// 링크 혼잡 (일시적)
    #[error("링크 혼잡")]
    Congested,

    /// 연결 없음 또는 구독 안 됨
    #[error("연결 없음")]
    NotConnected,

    #[error("전송 실패: {0}")]
    Other(String),
}

impl TransportError {
    /// 재시도 대상 여부
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::NoBuffer | TransportError::Congested)
    }
}

/// notification 전송 계층
pub trait Transport: Send + Sync {
    /// 한 notification 제출 (블로킹 금지)
    fn notify(
        &self,
        conn: ConnHandle,
        channel: Channel,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

/// 제출 재시도 정책
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub no_buffer_initial: Duration,
    pub no_buffer_max: Duration,
    pub congested: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_send_attempts.max(1),
            no_buffer_initial: Duration::from_millis(config.no_buffer_backoff_ms),
            no_buffer_max: Duration::from_millis(config.no_buffer_backoff_max_ms),
            congested: Duration::from_millis(config.congested_backoff_ms),
        }
    }

    /// `failures`번째 실패(1부터) 후 대기 시간
    pub fn backoff(&self, error: &TransportError, failures: u32) -> Duration {
        match error {
            TransportError::Congested => self.congested,
            _ => {
                let shift = failures.saturating_sub(1).min(16);
                self.no_buffer_initial
                    .saturating_mul(1u32 << shift)
                    .min(self.no_buffer_max)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 제출 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    /// 성공까지 걸린 시도 횟수
    pub attempts: u32,
}

/// 일시적 에러에 대해 백오프하며 제출
///
/// 영구 에러는 즉시, 일시적 에러는 시도 횟수 소진 시 마지막 에러를 반환
pub async fn submit_with_retry<T: Transport + ?Sized>(
    transport: &T,
    conn: ConnHandle,
    channel: Channel,
    payload: &[u8],
    policy: &RetryPolicy,
) -> Result<SubmitReport, TransportError> {
    let mut failures = 0;

    loop {
        match transport.notify(conn, channel, payload) {
            Ok(()) => {
                return Ok(SubmitReport {
                    attempts: failures + 1,
                })
            }
            Err(e) if e.is_transient() => {
                failures += 1;
                if failures >= policy.max_attempts {
                    warn!("notify 재시도 소진 ({}회): {}", failures, e);
                    return Err(e);
                }
                let delay = policy.backoff(&e, failures);
                debug!("notify 일시 실패 ({}), {:?} 후 재시도", e, delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    struct Scripted {
        results: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(results: Vec<Result<(), TransportError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            }
        }
    }

    impl Transport for Scripted {
        fn notify(&self, _: ConnHandle, _: Channel, _: &[u8]) -> Result<(), TransportError> {
            *self.calls.lock() += 1;
            self.results.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 8,
            no_buffer_initial: Duration::from_millis(1),
            no_buffer_max: Duration::from_millis(4),
            congested: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_no_buffer_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let ms: Vec<u128> = (1..=8)
            .map(|n| policy.backoff(&TransportError::NoBuffer, n).as_millis())
            .collect();
        assert_eq!(ms, vec![10, 20, 40, 80, 100, 100, 100, 100]);
    }

    #[test]
    fn test_congested_backoff_is_fixed() {
        let policy = RetryPolicy::default();
        for n in 1..=8 {
            assert_eq!(
                policy.backoff(&TransportError::Congested, n),
                Duration::from_millis(8)
            );
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_errors() {
        let transport = Scripted::new(vec![
            Err(TransportError::NoBuffer),
            Err(TransportError::Congested),
            Ok(()),
        ]);

        let report = submit_with_retry(&transport, 1, Channel::Data, b"x", &fast_policy())
            .await
            .unwrap();
        assert_eq!(report.attempts, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let transport = Scripted::new(vec![Err(TransportError::NoBuffer); 20]);

        let err = submit_with_retry(&transport, 1, Channel::Data, b"x", &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NoBuffer);
        assert_eq!(*transport.calls.lock(), 8);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let transport = Scripted::new(vec![Err(TransportError::NotConnected)]);

        let err = submit_with_retry(&transport, 1, Channel::Data, b"x", &fast_policy())
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::NotConnected);
        assert_eq!(*transport.calls.lock(), 1);
    }
}
