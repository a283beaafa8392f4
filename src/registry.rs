//! 녹음 파일 레지스트리
//!
//! 목록은 캐시하지 않고 요청마다 새로 스캔한다.
//! LIST_FILES와 SELECT_FILE 사이에 새 녹음이 끝나면 인덱스가 밀릴 수 있다.

use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, trace};

use crate::{Error, Result};

/// 파일 이름 최대 길이
pub const MAX_FILENAME_LEN: usize = 255;

/// 전송 후보 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCandidate {
    /// 디렉터리 내 파일 이름
    pub name: String,

    /// 절대 경로
    pub path: PathBuf,

    /// 파일 크기 (바이트)
    pub size: u64,

    /// 수정 시각
    pub modified: SystemTime,
}

/// 선택 실패 사유
#[derive(Debug, PartialEq, Eq)]
pub enum SelectionError {
    /// 이름 형식 위반
    InvalidName(&'static str),

    /// 없음, 일반 파일 아님, 또는 빈 파일
    NotFound,

    /// 인덱스 범위 초과
    IndexOutOfRange { index: usize, count: usize },

    /// 디렉터리 스캔 실패
    Unavailable,
}

/// 파일 이름 검증 (파일시스템 접근 전)
///
/// 허용: ASCII 영숫자, `.`, `_`, `-` / 길이 1~255 / `..`, `/`, `\` 금지
pub fn validate_filename(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.len() > MAX_FILENAME_LEN {
        Some("too long")
    } else if name.contains("..") {
        Some("parent reference")
    } else if name.contains('/') || name.contains('\\') {
        Some("path separator")
    } else if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
    {
        Some("disallowed character")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::InvalidFilename {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// 녹음 디렉터리 스캐너
#[derive(Debug, Clone)]
pub struct FileRegistry {
    dir: PathBuf,
    extension: String,
}

impl FileRegistry {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }

    /// 후보 스캔, 수정 시각 내림차순
    ///
    /// 빈 파일(녹음 시작 직후 등)은 전송 대상이 아니므로 제외
    pub fn scan(&self) -> Result<Vec<FileCandidate>> {
        let mut candidates = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !self.has_extension(&path) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    trace!("메타데이터 읽기 실패 {:?}: {}", path, e);
                    continue;
                }
            };
            if !meta.is_file() || meta.len() == 0 {
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            candidates.push(FileCandidate {
                name: name.to_string(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                path,
            });
        }

        candidates.sort_by_key(|c| Reverse(c.modified));
        debug!("레지스트리 스캔: {} 후보 ({:?})", candidates.len(), self.dir);
        Ok(candidates)
    }

    /// 가장 최근 파일
    pub fn newest(&self) -> Result<Option<FileCandidate>> {
        Ok(self.scan()?.into_iter().next())
    }

    /// 새로 정렬한 목록의 index번째 파일
    pub fn select_index(&self, index: usize) -> std::result::Result<FileCandidate, SelectionError> {
        let candidates = self.scan().map_err(|e| {
            debug!("레지스트리 스캔 실패: {}", e);
            SelectionError::Unavailable
        })?;
        let count = candidates.len();
        candidates
            .into_iter()
            .nth(index)
            .ok_or(SelectionError::IndexOutOfRange { index, count })
    }

    /// 이름으로 파일 해석
    ///
    /// 확장자가 없으면 기본 확장자를 붙인다
    pub fn resolve_named(&self, name: &str) -> std::result::Result<FileCandidate, SelectionError> {
        if let Err(Error::InvalidFilename { reason, .. }) = validate_filename(name) {
            return Err(SelectionError::InvalidName(reason));
        }

        let file_name = if Path::new(name).extension().is_some() {
            name.to_string()
        } else {
            format!("{}.{}", name, self.extension)
        };
        if file_name.len() > MAX_FILENAME_LEN {
            return Err(SelectionError::InvalidName("too long"));
        }

        let path = self.dir.join(&file_name);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SelectionError::NotFound),
            Err(e) => {
                debug!("메타데이터 읽기 실패 {:?}: {}", path, e);
                return Err(SelectionError::NotFound);
            }
        };

        if !meta.is_file() || meta.len() == 0 {
            return Err(SelectionError::NotFound);
        }

        Ok(FileCandidate {
            name: file_name,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn write_with_mtime(dir: &Path, name: &str, len: usize, age_secs: u64) {
        let path = dir.join(name);
        fs::write(&path, vec![0x5A; len]).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("rec_0001.raw").is_ok());
        assert!(validate_filename("A-b_c.9").is_ok());

        for bad in ["", "..", "a..b", "../x", "dir/x", "dir\\x", "x y", "ä.raw"] {
            assert!(validate_filename(bad).is_err(), "{:?} should fail", bad);
        }
        assert!(validate_filename(&"a".repeat(256)).is_err());
        assert!(validate_filename(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_scan_orders_newest_first_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_with_mtime(dir.path(), "old.raw", 10, 300);
        write_with_mtime(dir.path(), "new.raw", 10, 10);
        write_with_mtime(dir.path(), "mid.RAW", 10, 100);
        write_with_mtime(dir.path(), "note.txt", 10, 1);
        write_with_mtime(dir.path(), "empty.raw", 0, 1);
        fs::create_dir(dir.path().join("sub.raw")).unwrap();

        let registry = FileRegistry::new(dir.path(), "raw");
        let names: Vec<String> = registry.scan().unwrap().into_iter().map(|c| c.name).collect();

        assert_eq!(names, vec!["new.raw", "mid.RAW", "old.raw"]);
        assert_eq!(registry.newest().unwrap().unwrap().name, "new.raw");
    }

    #[test]
    fn test_select_index_bounds() {
        let dir = tempfile::tempdir().unwrap();
        write_with_mtime(dir.path(), "a.raw", 4, 20);
        write_with_mtime(dir.path(), "b.raw", 4, 10);

        let registry = FileRegistry::new(dir.path(), "raw");
        assert_eq!(registry.select_index(1).unwrap().name, "a.raw");
        assert_eq!(
            registry.select_index(2).unwrap_err(),
            SelectionError::IndexOutOfRange { index: 2, count: 2 }
        );
    }

    #[test]
    fn test_resolve_named_appends_extension() {
        let dir = tempfile::tempdir().unwrap();
        write_with_mtime(dir.path(), "rec_0003.raw", 32, 0);
        write_with_mtime(dir.path(), "empty.raw", 0, 0);

        let registry = FileRegistry::new(dir.path(), "raw");
        let found = registry.resolve_named("rec_0003").unwrap();
        assert_eq!(found.name, "rec_0003.raw");
        assert_eq!(found.size, 32);

        assert_eq!(registry.resolve_named("rec_0003.raw").unwrap().path, found.path);
        assert_eq!(registry.resolve_named("missing"), Err(SelectionError::NotFound));
        assert_eq!(registry.resolve_named("empty"), Err(SelectionError::NotFound));
        assert!(matches!(
            registry.resolve_named("../etc/passwd"),
            Err(SelectionError::InvalidName(_))
        ));
    }
}
