//! 수신 파일 출력 싱크
//!
//! 수신측이 FILE_START마다 여는 출력 대상.
//! 이어받기 시에는 `offset` 이후의 데이터를 버리고 그 지점부터 이어 씀.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::manifest::FileEntry;
use crate::{Error, Result};

/// 파일 하나의 출력 대상
pub trait FileSink: Send {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// 모든 바이트 수신 후 확정
    fn finish(self: Box<Self>) -> Result<()>;

    /// 프로토콜 위반 등으로 폐기
    fn abort(self: Box<Self>);
}

/// 파일 인덱스별 싱크 생성기
pub trait SinkFactory: Send {
    /// `offset` 지점에 위치한 싱크 열기
    ///
    /// 보유 데이터가 `offset`보다 짧으면 에러
    fn open(&mut self, index: usize, entry: &FileEntry, offset: u64) -> Result<Box<dyn FileSink>>;

    /// 이미 확정된 출력 폐기 (확정 후 실패 판정된 파일)
    fn discard(&mut self, index: usize);
}

#[derive(Debug, Default)]
struct MemoryStore {
    partial: HashMap<usize, Vec<u8>>,
    completed: HashMap<usize, Bytes>,
}

/// 메모리에 파일을 모으는 싱크 생성기
///
/// 복제본끼리 저장소를 공유하므로 테스트에서 결과 확인에 사용
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 완료된 파일 내용
    pub fn completed(&self, index: usize) -> Option<Bytes> {
        self.store.lock().completed.get(&index).cloned()
    }

    pub fn completed_count(&self) -> usize {
        self.store.lock().completed.len()
    }

    /// 진행 중 파일의 보유 바이트 수
    pub fn partial_len(&self, index: usize) -> Option<usize> {
        self.store.lock().partial.get(&index).map(|p| p.len())
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&mut self, index: usize, entry: &FileEntry, offset: u64) -> Result<Box<dyn FileSink>> {
        let mut store = self.store.lock();
        store.completed.remove(&index);

        let partial = store.partial.entry(index).or_default();
        if (partial.len() as u64) < offset {
            return Err(Error::violation(
                Some(index),
                format!("보유 {} 바이트보다 큰 오프셋 {}", partial.len(), offset),
            ));
        }
        partial.truncate(offset as usize);
        partial.reserve(entry.size.saturating_sub(offset) as usize);

        Ok(Box::new(MemorySink {
            index,
            store: self.store.clone(),
        }))
    }

    fn discard(&mut self, index: usize) {
        let mut store = self.store.lock();
        store.completed.remove(&index);
        store.partial.remove(&index);
    }
}

struct MemorySink {
    index: usize,
    store: Arc<Mutex<MemoryStore>>,
}

impl FileSink for MemorySink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.store
            .lock()
            .partial
            .entry(self.index)
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let mut store = self.store.lock();
        let data = store.partial.remove(&self.index).unwrap_or_default();
        store.completed.insert(self.index, Bytes::from(data));
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.store.lock().partial.remove(&self.index);
    }
}

/// 디렉터리에 파일을 쓰는 싱크 생성기
///
/// 매니페스트 항목은 이름이 아니라 위치로 구분되므로 같은 이름은
/// `name (1).ext` 식으로 인덱스마다 다른 경로를 배정
#[derive(Debug, Clone)]
pub struct DirectorySinkFactory {
    dir: PathBuf,

    /// 인덱스별 (항목 이름, 배정 경로)
    assigned: HashMap<usize, (String, PathBuf)>,
}

impl DirectorySinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            assigned: HashMap::new(),
        }
    }

    /// 매니페스트 항목의 저장 경로 (디렉터리 밖으로 나가는 이름은 파일명만 사용)
    pub fn path_for(&mut self, index: usize, entry: &FileEntry) -> PathBuf {
        if let Some((name, path)) = self.assigned.get(&index) {
            if *name == entry.name {
                return path.clone();
            }
        }

        let file_name = Path::new(&entry.name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "unnamed".into());
        let base = Path::new(&file_name);
        let stem = base
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = base
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let taken = |path: &PathBuf| {
            self.assigned
                .iter()
                .any(|(other, (_, assigned))| *other != index && assigned == path)
        };

        let mut path = self.dir.join(&file_name);
        let mut n = 1;
        while taken(&path) {
            path = self.dir.join(format!("{} ({}){}", stem, n, ext));
            n += 1;
        }

        self.assigned
            .insert(index, (entry.name.clone(), path.clone()));
        path
    }
}

impl SinkFactory for DirectorySinkFactory {
    fn open(&mut self, index: usize, entry: &FileEntry, offset: u64) -> Result<Box<dyn FileSink>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(index, entry);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(offset == 0)
            .open(&path)?;

        if offset > 0 {
            let held = file.metadata()?.len();
            if held < offset {
                return Err(Error::violation(
                    Some(index),
                    format!("보유 {} 바이트보다 큰 오프셋 {}", held, offset),
                ));
            }
            file.set_len(offset)?;
            file.seek(SeekFrom::Start(offset))?;
        }

        Ok(Box::new(DirectorySink { file, path }))
    }

    fn discard(&mut self, index: usize) {
        if let Some((_, path)) = self.assigned.get(&index) {
            let _ = std::fs::remove_file(path);
        }
    }
}

struct DirectorySink {
    file: File,
    path: PathBuf,
}

impl FileSink for DirectorySink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let path = self.path.clone();
        drop(self);
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_resume_truncates() {
        let mut factory = MemorySinkFactory::new();
        let entry = FileEntry::new("a", 6);

        let mut sink = factory.open(0, &entry, 0).unwrap();
        sink.write(b"abcd").unwrap();
        drop(sink);
        assert_eq!(factory.partial_len(0), Some(4));

        // 보유량보다 큰 오프셋은 거부
        assert!(factory.open(0, &entry, 5).is_err());

        let mut sink = factory.open(0, &entry, 2).unwrap();
        sink.write(b"CDEF").unwrap();
        sink.finish().unwrap();

        assert_eq!(factory.completed(0).unwrap().as_ref(), b"abCDEF");
        assert_eq!(factory.partial_len(0), None);
    }

    #[test]
    fn test_directory_sink_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = DirectorySinkFactory::new(dir.path());
        let entry = FileEntry::new("../escape.bin", 6);

        let path = factory.path_for(0, &entry);
        assert_eq!(path, dir.path().join("escape.bin"));

        let mut sink = factory.open(0, &entry, 0).unwrap();
        sink.write(b"abcdXX").unwrap();
        drop(sink);

        let mut sink = factory.open(0, &entry, 4).unwrap();
        sink.write(b"ef").unwrap();
        sink.finish().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_same_name_entries_get_distinct_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = DirectorySinkFactory::new(dir.path());
        let first = FileEntry::new("x/report.txt", 5);
        let second = FileEntry::new("y/report.txt", 5);

        let mut sink = factory.open(0, &first, 0).unwrap();
        sink.write(b"FIRST").unwrap();
        sink.finish().unwrap();

        let mut sink = factory.open(1, &second, 0).unwrap();
        sink.write(b"SECND").unwrap();
        sink.finish().unwrap();

        let first_path = factory.path_for(0, &first);
        let second_path = factory.path_for(1, &second);
        assert_eq!(first_path, dir.path().join("report.txt"));
        assert_eq!(second_path, dir.path().join("report (1).txt"));
        assert_eq!(std::fs::read(&first_path).unwrap(), b"FIRST");
        assert_eq!(std::fs::read(&second_path).unwrap(), b"SECND");
    }

    #[test]
    fn test_discard_removes_finished_output() {
        let mut memory = MemorySinkFactory::new();
        let entry = FileEntry::new("a", 2);
        let mut sink = memory.open(0, &entry, 0).unwrap();
        sink.write(b"ok").unwrap();
        sink.finish().unwrap();
        memory.discard(0);
        assert!(memory.completed(0).is_none());

        let dir = tempfile::tempdir().unwrap();
        let mut directory = DirectorySinkFactory::new(dir.path());
        let mut sink = directory.open(0, &entry, 0).unwrap();
        sink.write(b"ok").unwrap();
        sink.finish().unwrap();
        directory.discard(0);
        assert!(!dir.path().join("a").exists());
    }
}
