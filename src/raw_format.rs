//! RAW 녹음 파일 사전 검사
//!
//! 파일 구조 (모두 little-endian u32):
//! `[magic][version][sample_rate][total_samples][start_ts][end_ts][reserved×2]`
//! 뒤에 10바이트 샘플 `[sample:u16][timestamp_ms:u32][seq:u32]`가 이어진다.
//!
//! 전송 자체는 파일을 불투명한 바이트열로 다룬다. 여기 검사는 전송 전 참고용.

use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// "RAWA"
pub const RAW_MAGIC: u32 = 0x5241_5741;

/// 헤더 크기
pub const RAW_HEADER_SIZE: usize = 32;

/// 샘플 레코드 크기
pub const RAW_SAMPLE_SIZE: u64 = 10;

/// 빠른 체크섬 범위
pub const QUICK_CHECK_LEN: usize = 4096;

/// RAW 파일 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub magic: u32,
    pub version: u32,
    pub sample_rate: u32,
    pub total_samples: u32,
    pub start_timestamp: u32,
    pub end_timestamp: u32,
}

impl RawHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RAW_HEADER_SIZE {
            return Err(Error::Truncated { len: bytes.len() });
        }

        let field = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };

        let header = Self {
            magic: field(0),
            version: field(1),
            sample_rate: field(2),
            total_samples: field(3),
            start_timestamp: field(4),
            end_timestamp: field(5),
        };

        if header.magic != RAW_MAGIC {
            return Err(Error::InvalidRawMagic { got: header.magic });
        }
        Ok(header)
    }

    /// 헤더 기준 예상 파일 크기
    pub fn expected_file_size(&self) -> u64 {
        RAW_HEADER_SIZE as u64 + self.total_samples as u64 * RAW_SAMPLE_SIZE
    }
}

/// 사전 검사 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightReport {
    pub header: RawHeader,
    pub file_size: u64,

    /// 헤더가 말하는 크기와 실제 크기 일치 여부 (불일치는 경고만)
    pub size_consistent: bool,

    /// 헤더 뒤 최대 4KB의 CRC-32
    pub quick_crc: u32,
}

/// 헤더 검증 + 빠른 체크섬
///
/// magic 불일치는 에러, 크기 불일치는 부분 파일일 수 있으므로 경고만 남긴다
pub async fn preflight(path: &Path) -> Result<PreflightReport> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut header_buf = [0u8; RAW_HEADER_SIZE];
    file.read_exact(&mut header_buf).await?;
    let header = RawHeader::parse(&header_buf)?;

    let expected = header.expected_file_size();
    let size_consistent = expected == file_size;
    if !size_consistent {
        warn!(
            "RAW 크기 불일치: file={} bytes, expected={} bytes (samples={})",
            file_size, expected, header.total_samples
        );
    }

    file.seek(std::io::SeekFrom::Start(RAW_HEADER_SIZE as u64))
        .await?;
    let mut sample_buf = vec![0u8; QUICK_CHECK_LEN];
    let mut filled = 0;
    while filled < sample_buf.len() {
        let n = file.read(&mut sample_buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let quick_crc = crc32fast::hash(&sample_buf[..filled]);
    debug!("빠른 CRC 검사: {} bytes, crc={:08X}", filled, quick_crc);

    info!(
        "RAW 헤더 검증 통과: {} samples @ {} Hz, {} bytes",
        header.total_samples, header.sample_rate, file_size
    );

    Ok(PreflightReport {
        header,
        file_size,
        size_consistent,
        quick_crc,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_file(total_samples: u32, actual_samples: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        for value in [RAW_MAGIC, 1, 16_000, total_samples, 100, 200, 0, 0] {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        for i in 0..actual_samples {
            buf.extend_from_slice(&((i % 4096) as u16).to_le_bytes());
            buf.extend_from_slice(&(i * 2).to_le_bytes());
            buf.extend_from_slice(&i.to_le_bytes());
        }
        buf
    }

    #[test]
    fn test_parse_header() {
        let header = RawHeader::parse(&raw_file(7, 0)).unwrap();
        assert_eq!(header.sample_rate, 16_000);
        assert_eq!(header.total_samples, 7);
        assert_eq!(header.expected_file_size(), 32 + 70);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = raw_file(1, 1);
        bytes[0] = 0;
        assert!(matches!(
            RawHeader::parse(&bytes),
            Err(Error::InvalidRawMagic { .. })
        ));
        assert!(matches!(
            RawHeader::parse(&bytes[..10]),
            Err(Error::Truncated { len: 10 })
        ));
    }

    #[tokio::test]
    async fn test_preflight_consistent_and_partial() {
        let dir = tempfile::tempdir().unwrap();

        let good = dir.path().join("good.raw");
        let bytes = raw_file(500, 500);
        std::fs::write(&good, &bytes).unwrap();
        let report = preflight(&good).await.unwrap();
        assert!(report.size_consistent);
        assert_eq!(report.file_size, 5032);
        assert_eq!(report.quick_crc, crc32fast::hash(&bytes[32..32 + 4096]));

        let partial = dir.path().join("partial.raw");
        std::fs::write(&partial, raw_file(500, 20)).unwrap();
        let report = preflight(&partial).await.unwrap();
        assert!(!report.size_consistent);
    }
}
