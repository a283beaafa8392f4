//! 청크 패킷 프레이밍
//!
//! 데이터 채널 패킷: `[seq:u16 LE][len:u16 LE][eof:u8][payload]`
//!
//! - 송신측: `PacketHeader` + 파일 조각 → 하나의 notification
//! - 수신측: `Reassembler`가 시퀀스 연속성을 검사하며 파일 복원

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 청크 헤더 크기 (바이트)
pub const HEADER_SIZE: usize = 5;

/// 전송 계층(ATT notification) 오버헤드 (opcode 1 + handle 2)
pub const TRANSPORT_OVERHEAD: usize = 3;

/// 현재 MTU 기준 청크당 페이로드 예산
///
/// `clamp(mtu - 3 - 5, 1, max_payload)`
pub fn payload_budget(mtu: u16, max_payload: usize) -> usize {
    (mtu as usize)
        .saturating_sub(TRANSPORT_OVERHEAD + HEADER_SIZE)
        .clamp(1, max_payload.max(1))
}

/// 청크 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// 시퀀스 번호 (세션마다 0부터, wrap)
    pub seq: u16,

    /// 페이로드 길이
    pub len: u16,

    /// 파일의 마지막 청크 여부
    pub eof: bool,
}

impl PacketHeader {
    pub fn new(seq: u16, len: u16, eof: bool) -> Self {
        Self { seq, len, eof }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.seq);
        buf.put_u16_le(self.len);
        buf.put_u8(self.eof as u8);
    }

    /// 헤더만 파싱 (페이로드 길이 검증은 `Packet::decode`)
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Truncated { len: bytes.len() });
        }

        let eof = match bytes[4] {
            0 => false,
            1 => true,
            other => return Err(Error::InvalidEofFlag(other)),
        };

        Ok(Self {
            seq: u16::from_le_bytes([bytes[0], bytes[1]]),
            len: u16::from_le_bytes([bytes[2], bytes[3]]),
            eof,
        })
    }
}

/// 데이터 채널 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    /// 페이로드로 패킷 생성 (길이는 u16 범위여야 함)
    pub fn new(seq: u16, payload: Bytes, eof: bool) -> Self {
        debug_assert!(payload.len() <= u16::MAX as usize);
        Self {
            header: PacketHeader::new(seq, payload.len() as u16, eof),
            payload,
        }
    }

    /// 와이어 바이트로 직렬화
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header.write_to(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// 와이어 바이트에서 역직렬화
    ///
    /// 선언된 길이와 실제 페이로드 길이가 다르면 거부
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = PacketHeader::parse(bytes)?;
        let actual = bytes.len() - HEADER_SIZE;

        if actual != header.len as usize {
            return Err(Error::LengthMismatch {
                declared: header.len as usize,
                actual,
            });
        }

        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }

    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// 수신측 파일 조립기
///
/// 시퀀스는 0부터 빈틈 없이 이어져야 하고, EOF 청크 이후 데이터는 거부
#[derive(Debug, Default)]
pub struct Reassembler {
    data: BytesMut,
    next_seq: u16,
    packets: u64,
    finished: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 와이어 바이트 하나 삽입
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<bool> {
        let packet = Packet::decode(bytes)?;
        self.push(&packet)
    }

    /// 패킷 삽입, EOF 청크면 true 반환
    pub fn push(&mut self, packet: &Packet) -> Result<bool> {
        if self.finished {
            return Err(Error::DataAfterEof {
                seq: packet.header.seq,
            });
        }

        if packet.header.seq != self.next_seq {
            return Err(Error::SequenceGap {
                expected: self.next_seq,
                got: packet.header.seq,
            });
        }

        self.data.extend_from_slice(&packet.payload);
        self.next_seq = self.next_seq.wrapping_add(1);
        self.packets += 1;
        self.finished = packet.header.eof;

        Ok(self.finished)
    }

    pub fn is_complete(&self) -> bool {
        self.finished
    }

    /// 지금까지 받은 패킷 수
    pub fn packet_count(&self) -> u64 {
        self.packets
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 조립된 데이터 추출
    pub fn into_data(self) -> Bytes {
        self.data.freeze()
    }
}
