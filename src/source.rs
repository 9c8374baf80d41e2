//! 송신 파일 바이트 소스
//!
//! UI 계층이 매니페스트와 함께 제공하는 파일 내용 접근 경로

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::manifest::{FileEntry, FileManifest};
use crate::{Error, Result};

/// 읽기 + 탐색 가능한 바이트 소스
pub trait ByteSource: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> ByteSource for T {}

pub type BoxedSource = Box<dyn ByteSource>;

/// 매니페스트 인덱스로 파일을 여는 소스
pub trait FileSource: Send + Sync + 'static {
    fn open(&self, index: usize) -> Result<BoxedSource>;
}

/// 메모리 상의 파일들
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: Vec<Bytes>,
}

impl MemorySource {
    pub fn new(files: Vec<Bytes>) -> Self {
        Self { files }
    }

    /// (이름, 내용) 목록에서 매니페스트와 소스를 함께 생성
    pub fn with_manifest<N: Into<String>>(files: Vec<(N, Bytes)>) -> (FileManifest, Self) {
        let mut entries = Vec::with_capacity(files.len());
        let mut contents = Vec::with_capacity(files.len());

        for (name, data) in files {
            let name = name.into();
            let mime_type = guess_mime_type(&name);
            entries.push(FileEntry::new(name, data.len() as u64).with_mime_type(mime_type));
            contents.push(data);
        }

        (FileManifest::new(entries), Self::new(contents))
    }
}

impl FileSource for MemorySource {
    fn open(&self, index: usize) -> Result<BoxedSource> {
        let data = self.files.get(index).ok_or(Error::InvalidFileIndex {
            index,
            len: self.files.len(),
        })?;
        Ok(Box::new(std::io::Cursor::new(data.clone())))
    }
}

/// 파일 시스템 경로 목록
#[derive(Debug, Clone, Default)]
pub struct PathSource {
    paths: Vec<PathBuf>,
}

impl PathSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// 경로 메타데이터로 매니페스트 생성
    pub fn manifest(&self) -> Result<FileManifest> {
        let mut entries = Vec::with_capacity(self.paths.len());

        for path in &self.paths {
            let metadata = std::fs::metadata(path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);

            entries.push(
                FileEntry::new(name.clone(), metadata.len())
                    .with_mime_type(guess_mime_type(&name))
                    .with_last_modified(last_modified),
            );
        }

        Ok(FileManifest::new(entries))
    }
}

impl FileSource for PathSource {
    fn open(&self, index: usize) -> Result<BoxedSource> {
        let path = self.paths.get(index).ok_or(Error::InvalidFileIndex {
            index,
            len: self.paths.len(),
        })?;
        let file = std::fs::File::open(path)?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

/// 확장자 기반 MIME 추정, 모르면 `application/octet-stream`
pub fn guess_mime_type(name: &str) -> String {
    mime_guess::from_path(name).first_or_octet_stream().to_string()
}
