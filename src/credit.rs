//! 크레딧 기반 흐름 제어
//!
//! - 크레딧 1개 = 전송 계층 큐에 머물 수 있는 미확인 청크 1개
//! - 획득 시점부터 in-flight로 계산 (제출 전 tx-complete 경합 방지)
//! - 전송 계층이 "큐에서 나감"을 알리면 `release()`로 반환
//! - 제출에 실패한 크레딧은 `Credit` drop 시 자동 반환

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, trace};

/// 고정 용량 크레딧 풀
#[derive(Debug)]
pub struct CreditPool {
    semaphore: Semaphore,
    capacity: usize,

    /// 발급 후 아직 반환되지 않은 크레딧 수
    in_flight: AtomicUsize,

    /// 관측된 최대 in-flight
    peak: AtomicUsize,
}

impl CreditPool {
    /// 새 크레딧 풀 생성 (capacity ≥ 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// 크레딧 획득 (최대 `timeout` 대기)
    ///
    /// `None`은 백프레셔 신호이며 실패가 아님
    pub async fn acquire(&self, timeout: Duration) -> Option<Credit<'_>> {
        let permit = match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                trace!("크레딧 대기 타임아웃 (in_flight={})", self.in_flight());
                return None;
            }
        };

        // 퍼밋은 release()에서만 되돌린다
        permit.forget();
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);

        Some(Credit {
            pool: self,
            sent: false,
        })
    }

    /// 크레딧 하나 반환
    ///
    /// 발급된 크레딧이 없으면 무시하고 false (용량 초과 방지)
    pub fn release(&self) -> bool {
        let released = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();

        if released {
            self.semaphore.add_permits(1);
        } else {
            debug!("반환할 크레딧 없음 (중복 tx-complete 무시)");
        }
        released
    }

    /// 모든 in-flight 크레딧 회수 (연결 끊김 등으로 tx-complete가 오지 않을 때)
    pub fn reset(&self) -> usize {
        let outstanding = self.in_flight.swap(0, Ordering::AcqRel);
        if outstanding > 0 {
            self.semaphore.add_permits(outstanding);
            debug!("크레딧 {}개 강제 회수", outstanding);
        }
        outstanding
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

/// 획득한 크레딧
///
/// `mark_sent()` 없이 drop되면 풀로 반환된다
#[derive(Debug)]
#[must_use = "크레딧은 전송에 쓰이거나 drop으로 반환되어야 함"]
pub struct Credit<'a> {
    pool: &'a CreditPool,
    sent: bool,
}

impl Credit<'_> {
    /// 전송 계층에 제출 완료, 반환은 tx-complete가 담당
    pub fn mark_sent(mut self) {
        self.sent = true;
    }
}

impl Drop for Credit<'_> {
    fn drop(&mut self) {
        if !self.sent {
            self.pool.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_capacity_bound() {
        let pool = CreditPool::new(3);

        for _ in 0..3 {
            pool.acquire(SHORT).await.unwrap().mark_sent();
        }
        assert_eq!(pool.in_flight(), 3);
        assert!(pool.acquire(SHORT).await.is_none());

        assert!(pool.release());
        assert!(pool.acquire(SHORT).await.is_some());
    }

    #[tokio::test]
    async fn test_unsent_credit_returns_on_drop() {
        let pool = CreditPool::new(1);
        {
            let _credit = pool.acquire(SHORT).await.unwrap();
            assert_eq!(pool.in_flight(), 1);
        }
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_spurious_release_never_exceeds_capacity() {
        let pool = CreditPool::new(2);
        assert!(!pool.release());
        assert!(!pool.release());
        assert_eq!(pool.available(), 2);

        pool.acquire(SHORT).await.unwrap().mark_sent();
        assert!(pool.release());
        assert!(!pool.release());
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_reset_reclaims_all() {
        let pool = CreditPool::new(3);
        pool.acquire(SHORT).await.unwrap().mark_sent();
        pool.acquire(SHORT).await.unwrap().mark_sent();

        assert_eq!(pool.reset(), 2);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.peak(), 2);

        // 늦게 도착한 tx-complete는 무시
        assert!(!pool.release());
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn test_release_wakes_waiter() {
        let pool = std::sync::Arc::new(CreditPool::new(1));
        pool.acquire(SHORT).await.unwrap().mark_sent();

        let releaser = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release();
        });

        assert!(pool.acquire(Duration::from_millis(500)).await.is_some());
    }
}
