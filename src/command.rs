//! 제어 명령 정의
//!
//! 제어 채널 쓰기 = `[opcode:u8][payload...]`

use bytes::{BufMut, Bytes, BytesMut};

use crate::registry::validate_filename;
use crate::{Error, Result};

/// 명령 opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// 최신 파일 전송 시작
    Start = 0x01,

    /// 전송 중지
    Stop = 0x02,

    /// 일시 정지
    Pause = 0x03,

    /// 재개
    Resume = 0x04,

    /// 최신 후보 요약 요청
    ListFiles = 0x05,

    /// 인덱스로 선택 후 전송
    SelectFile = 0x06,

    /// 이름으로 선택 후 전송
    StartWithFilename = 0x07,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => Opcode::Start,
            0x02 => Opcode::Stop,
            0x03 => Opcode::Pause,
            0x04 => Opcode::Resume,
            0x05 => Opcode::ListFiles,
            0x06 => Opcode::SelectFile,
            0x07 => Opcode::StartWithFilename,
            _ => return None,
        })
    }
}

/// 명령 큐 항목
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    StartNamed(String),
    SelectIndexed(u16),
    ListRequest,
    Pause,
    Resume,
    Stop,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Start => Opcode::Start,
            Command::StartNamed(_) => Opcode::StartWithFilename,
            Command::SelectIndexed(_) => Opcode::SelectFile,
            Command::ListRequest => Opcode::ListFiles,
            Command::Pause => Opcode::Pause,
            Command::Resume => Opcode::Resume,
            Command::Stop => Opcode::Stop,
        }
    }

    /// 제어 채널 바이트 해석
    ///
    /// 파일 이름은 여기서 검증되므로 큐에 들어간 이름은 파일시스템 접근 전에 이미 안전하다
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&first, payload) = bytes.split_first().ok_or(Error::Truncated { len: 0 })?;
        let opcode = Opcode::from_u8(first).ok_or(Error::UnknownCommand(first))?;

        let no_payload = |cmd: Command| {
            if payload.is_empty() {
                Ok(cmd)
            } else {
                Err(Error::MalformedCommand {
                    opcode: first,
                    reason: "unexpected payload",
                })
            }
        };

        match opcode {
            Opcode::Start => no_payload(Command::Start),
            Opcode::Stop => no_payload(Command::Stop),
            Opcode::Pause => no_payload(Command::Pause),
            Opcode::Resume => no_payload(Command::Resume),
            Opcode::ListFiles => no_payload(Command::ListRequest),
            Opcode::SelectFile => match payload {
                [index] => Ok(Command::SelectIndexed(*index as u16)),
                [lo, hi] => Ok(Command::SelectIndexed(u16::from_le_bytes([*lo, *hi]))),
                _ => Err(Error::MalformedCommand {
                    opcode: first,
                    reason: "index must be 1 or 2 bytes",
                }),
            },
            Opcode::StartWithFilename => {
                let name = std::str::from_utf8(payload).map_err(|_| Error::MalformedCommand {
                    opcode: first,
                    reason: "filename is not UTF-8",
                })?;
                validate_filename(name)?;
                Ok(Command::StartNamed(name.to_string()))
            }
        }
    }

    /// 제어 채널 바이트로 직렬화 (피어/시뮬레이터용)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.opcode() as u8);
        match self {
            Command::SelectIndexed(index) => buf.put_u16_le(*index),
            Command::StartNamed(name) => buf.put_slice(name.as_bytes()),
            _ => {}
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple_commands() {
        assert_eq!(Command::decode(&[0x01]).unwrap(), Command::Start);
        assert_eq!(Command::decode(&[0x02]).unwrap(), Command::Stop);
        assert_eq!(Command::decode(&[0x03]).unwrap(), Command::Pause);
        assert_eq!(Command::decode(&[0x04]).unwrap(), Command::Resume);
        assert_eq!(Command::decode(&[0x05]).unwrap(), Command::ListRequest);
    }

    #[test]
    fn test_decode_select_file() {
        assert_eq!(Command::decode(&[0x06, 3]).unwrap(), Command::SelectIndexed(3));
        assert_eq!(
            Command::decode(&[0x06, 0x01, 0x02]).unwrap(),
            Command::SelectIndexed(0x0201)
        );
        assert!(Command::decode(&[0x06]).is_err());
        assert!(Command::decode(&[0x06, 1, 2, 3]).is_err());
    }

    #[test]
    fn test_decode_named() {
        let mut bytes = vec![0x07];
        bytes.extend_from_slice(b"rec_0001");
        assert_eq!(
            Command::decode(&bytes).unwrap(),
            Command::StartNamed("rec_0001".into())
        );

        for bad in [&b"../secret"[..], &b"a/b"[..], &b"a\\b"[..], &b""[..]] {
            let mut bytes = vec![0x07];
            bytes.extend_from_slice(bad);
            assert!(matches!(
                Command::decode(&bytes),
                Err(Error::InvalidFilename { .. })
            ));
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Command::decode(&[]), Err(Error::Truncated { .. })));
        assert!(matches!(Command::decode(&[0x7F]), Err(Error::UnknownCommand(0x7F))));
        assert!(matches!(
            Command::decode(&[0x01, 0x00]),
            Err(Error::MalformedCommand { opcode: 0x01, .. })
        ));
        assert!(Command::decode(&[0x07, 0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_encode_matches_decode() {
        for cmd in [
            Command::Start,
            Command::Stop,
            Command::ListRequest,
            Command::SelectIndexed(513),
            Command::StartNamed("rec_0042.raw".into()),
        ] {
            assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
        }
    }
}
