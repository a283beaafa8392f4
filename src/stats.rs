//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 세션 시작 시간
    pub start_time: Instant,

    /// 파일 크기
    pub total_bytes: u64,

    /// 전송된 페이로드 바이트
    pub sent_bytes: u64,

    /// 전송된 청크 수
    pub sent_chunks: u64,

    /// 재시도 후 성공한 notify 추가 시도 수
    pub retried_sends: u64,

    /// 크레딧 대기 타임아웃 (백프레셔) 횟수
    pub credit_timeouts: u64,

    /// 세션 중 관측된 MTU 변경 횟수
    pub mtu_changes: u64,

    /// 마지막으로 사용한 페이로드 예산
    pub last_budget: usize,

    /// 종료 시각
    pub finished_at: Option<Instant>,
}

impl TransferStats {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes,
            sent_bytes: 0,
            sent_chunks: 0,
            retried_sends: 0,
            credit_timeouts: 0,
            mtu_changes: 0,
            last_budget: 0,
            finished_at: None,
        }
    }

    /// 청크 하나 전송 기록
    pub fn record_chunk(&mut self, payload_len: usize, attempts: u32, budget: usize) {
        self.sent_bytes += payload_len as u64;
        self.sent_chunks += 1;
        self.retried_sends += attempts.saturating_sub(1) as u64;
        if self.last_budget != 0 && self.last_budget != budget {
            self.mtu_changes += 1;
        }
        self.last_budget = budget;
    }

    pub fn record_credit_timeout(&mut self) {
        self.credit_timeouts += 1;
    }

    pub fn finish(&mut self) {
        self.finished_at.get_or_insert_with(Instant::now);
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
    }

    /// 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.sent_bytes as f64 / elapsed
    }

    /// 진행률 (0.0 ~ 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.sent_bytes as f64 / self.total_bytes as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Bytes: {}/{} | Chunks: {} | Throughput: {:.1} KB/s | Retries: {} | Credit waits: {}",
            self.elapsed().as_secs_f64(),
            self.sent_bytes,
            self.total_bytes,
            self.sent_chunks,
            self.throughput() / 1024.0,
            self.retried_sends,
            self.credit_timeouts,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_chunks() {
        let mut stats = TransferStats::new(10_000);
        stats.record_chunk(177, 1, 177);
        stats.record_chunk(177, 3, 177);
        stats.record_chunk(100, 1, 232);
        stats.record_credit_timeout();

        assert_eq!(stats.sent_bytes, 454);
        assert_eq!(stats.sent_chunks, 3);
        assert_eq!(stats.retried_sends, 2);
        assert_eq!(stats.mtu_changes, 1);
        assert_eq!(stats.credit_timeouts, 1);
        assert!((stats.progress() - 0.0454).abs() < 1e-9);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let mut stats = TransferStats::new(1);
        stats.finish();
        let first = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), first);
        assert!(stats.summary().contains("Bytes: 0/1"));
    }
}
