//! 파일 매니페스트와 전송 제약
//!
//! - FileManifest: 세션 시작 후 변경되지 않는 순서 있는 파일 목록
//! - 파일은 이름이 아니라 위치(인덱스)로 식별

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

/// 매니페스트의 파일 항목
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// 파일 이름
    pub name: String,

    /// 파일 크기 (바이트)
    pub size: u64,

    /// MIME 타입
    pub mime_type: String,

    /// 마지막 수정 시간 (밀리초, UNIX epoch)
    pub last_modified: u64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: "application/octet-stream".to_string(),
            last_modified: 0,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_last_modified(mut self, last_modified: u64) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// 순서 있는 파일 목록
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileManifest {
    files: Vec<FileEntry>,
}

impl FileManifest {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn get(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// 전체 바이트 수
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// 세션 식별용 지문 (이름/크기/수정 시간 기반 CRC32)
    ///
    /// 재연결 시 같은 세션인지 판단하는 데 사용
    pub fn fingerprint(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for (index, file) in self.files.iter().enumerate() {
            hasher.update(&(index as u64).to_le_bytes());
            hasher.update(file.name.as_bytes());
            hasher.update(&file.size.to_le_bytes());
            hasher.update(&file.last_modified.to_le_bytes());
        }
        hasher.finalize()
    }
}

/// 전송 제약 (선택적 만료 시각)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferConstraints {
    pub expires_at: Option<SystemTime>,
}

impl TransferConstraints {
    /// 제약 없음
    pub fn none() -> Self {
        Self::default()
    }

    /// 지금부터 `ttl` 후 만료
    pub fn expires_in(ttl: Duration) -> Self {
        Self {
            expires_at: Some(SystemTime::now() + ttl),
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(expiry) => now > expiry,
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// 만료까지 남은 시간 (만료 없으면 None)
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at.map(|expiry| {
            expiry
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }
}
