//! 링크 상태 (연결, 구독, MTU)
//!
//! 전송 계층 콜백 컨텍스트에서 갱신되고 워커가 읽는다. 전부 lock-free.

use std::sync::atomic::{AtomicU16, Ordering};

use dashmap::DashMap;

use crate::transport::{Channel, ConnHandle};

/// 연결 없음
pub const CONN_NONE: ConnHandle = 0xFFFF;

/// 데이터 + 상태 채널 모두 구독
pub const NOTIFIES_READY: u8 = 0b11;

/// 현재 링크 상태
#[derive(Debug)]
pub struct LinkState {
    /// 현재 연결 (`CONN_NONE`이면 없음)
    conn: AtomicU16,

    /// 협상된 MTU
    mtu: AtomicU16,

    default_mtu: u16,

    /// 연결별 구독 비트마스크
    subscriptions: DashMap<ConnHandle, u8>,
}

impl LinkState {
    pub fn new(default_mtu: u16) -> Self {
        Self {
            conn: AtomicU16::new(CONN_NONE),
            mtu: AtomicU16::new(default_mtu),
            default_mtu,
            subscriptions: DashMap::new(),
        }
    }

    /// 연결 수립
    pub fn connect(&self, conn: ConnHandle) {
        self.conn.store(conn, Ordering::Release);
        self.mtu.store(self.default_mtu, Ordering::Release);
        self.subscriptions.insert(conn, 0);
    }

    /// 연결 해제, 현재 연결이었으면 true
    pub fn disconnect(&self, conn: ConnHandle) -> bool {
        self.subscriptions.remove(&conn);
        let was_current = self
            .conn
            .compare_exchange(conn, CONN_NONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if was_current {
            self.mtu.store(self.default_mtu, Ordering::Release);
        }
        was_current
    }

    pub fn current(&self) -> Option<ConnHandle> {
        match self.conn.load(Ordering::Acquire) {
            CONN_NONE => None,
            conn => Some(conn),
        }
    }

    pub fn is_connected(&self, conn: ConnHandle) -> bool {
        conn != CONN_NONE && self.conn.load(Ordering::Acquire) == conn
    }

    /// 구독 상태 갱신
    pub fn set_subscribed(&self, conn: ConnHandle, channel: Channel, enabled: bool) {
        let mut bits = self.subscriptions.entry(conn).or_insert(0);
        if enabled {
            *bits |= channel.bit();
        } else {
            *bits &= !channel.bit();
        }
    }

    pub fn subscription_bits(&self, conn: ConnHandle) -> u8 {
        self.subscriptions.get(&conn).map(|b| *b).unwrap_or(0)
    }

    pub fn is_subscribed(&self, conn: ConnHandle, channel: Channel) -> bool {
        self.subscription_bits(conn) & channel.bit() != 0
    }

    /// 데이터/상태 채널 모두 구독 중인지
    pub fn notifies_ready(&self, conn: ConnHandle) -> bool {
        self.subscription_bits(conn) & NOTIFIES_READY == NOTIFIES_READY
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Release);
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifies_ready_needs_both_bits() {
        let link = LinkState::new(23);
        link.connect(5);
        assert!(!link.notifies_ready(5));

        link.set_subscribed(5, Channel::Data, true);
        assert!(!link.notifies_ready(5));

        link.set_subscribed(5, Channel::Status, true);
        assert!(link.notifies_ready(5));

        link.set_subscribed(5, Channel::Data, false);
        assert!(!link.notifies_ready(5));
        assert!(link.is_subscribed(5, Channel::Status));
    }

    #[test]
    fn test_disconnect_clears_state() {
        let link = LinkState::new(23);
        link.connect(1);
        link.set_mtu(185);
        link.set_subscribed(1, Channel::Data, true);
        link.set_subscribed(1, Channel::Status, true);

        assert!(!link.disconnect(2));
        assert!(link.is_connected(1));

        assert!(link.disconnect(1));
        assert_eq!(link.current(), None);
        assert_eq!(link.mtu(), 23);
        assert_eq!(link.subscription_bits(1), 0);
    }
}
