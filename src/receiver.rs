//! 수신자 (받는 쪽)
//!
//! - 바이너리 프레임의 오프셋은 마지막 FILE_START 이후 누적 바이트로만 추론
//! - 선언 크기를 넘거나 모자라면 해당 파일만 실패, 다른 파일은 영향 없음
//! - 연결이 끊기면 (file_index, received_bytes)를 보존했다가 RESUME_REQUEST로 이어받기

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent};
use crate::manifest::FileManifest;
use crate::message::{ControlMessage, Frame};
use crate::sink::{FileSink, SinkFactory};
use crate::{Config, Error, Result};

/// 수신 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    AwaitingMetadata,
    ReadyToAccept,
    Receiving,
    /// 전송 중 연결 끊김, 재연결 시 이어받기 가능
    Paused,
    Complete,
    Cancelled,
    Error(String),
}

impl ReceiverState {
    /// 더 이상 진행할 수 없는 상태인지
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiverState::Complete | ReceiverState::Cancelled | ReceiverState::Error(_)
        )
    }
}

/// 파일별 수신 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Receiving,
    Complete,
    Failed(String),
}

/// 이어받기 지점
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub file_index: usize,

    /// 프레임 경계로 내림한 보유 바이트
    pub received_bytes: u64,
}

/// UI 계층으로 올라가는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiverEvent {
    MetadataReceived { manifest: FileManifest },
    FileStarted { file_index: usize, offset: u64 },
    FileCompleted { file_index: usize },
    FileFailed { file_index: usize, reason: String },
    AllFilesComplete,
    Paused { resume: Option<ResumePoint> },
    Rejected { reason: String },
    Cancelled,
}

/// 현재 열린 파일
struct OpenFile {
    index: usize,
    size: u64,
    received: u64,

    /// 크기에 도달해서 확정되면 None
    sink: Option<Box<dyn FileSink>>,
}

/// 수신 세션
pub struct ReceiverSession {
    config: Config,
    state: ReceiverState,
    sinks: Box<dyn SinkFactory>,

    manifest: Option<FileManifest>,
    fingerprint: Option<u32>,

    current: Option<OpenFile>,

    /// 실패한 파일의 남은 프레임을 조용히 버리는 중
    discarding: Option<usize>,

    /// 다음에 올 것으로 기대하는 파일 인덱스
    next_file_index: usize,

    statuses: Vec<FileStatus>,

    /// 연결 끊김 후 보존된 이어받기 지점
    resume: Option<ResumePoint>,

    events_tx: mpsc::UnboundedSender<ReceiverEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<ReceiverEvent>>,
}

impl ReceiverSession {
    pub fn new(config: Config, sinks: Box<dyn SinkFactory>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            state: ReceiverState::Idle,
            sinks,
            manifest: None,
            fingerprint: None,
            current: None,
            discarding: None,
            next_file_index: 0,
            statuses: Vec::new(),
            resume: None,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// 이벤트 수신기 (한 번만 꺼낼 수 있음)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ReceiverEvent>> {
        self.events_rx.take()
    }

    pub fn state(&self) -> &ReceiverState {
        &self.state
    }

    pub fn manifest(&self) -> Option<&FileManifest> {
        self.manifest.as_ref()
    }

    pub fn file_status(&self, index: usize) -> Option<&FileStatus> {
        self.statuses.get(index)
    }

    pub fn resume_point(&self) -> Option<ResumePoint> {
        self.resume
    }

    /// 현재 파일의 수신 바이트
    pub fn received_bytes(&self) -> Option<(usize, u64)> {
        self.current.as_ref().map(|f| (f.index, f.received))
    }

    fn emit(&self, event: ReceiverEvent) {
        let _ = self.events_tx.send(event);
    }

    /// 채널 열림
    pub fn on_open(&mut self) {
        match self.state {
            ReceiverState::Idle | ReceiverState::Paused => {
                self.state = ReceiverState::AwaitingMetadata;
            }
            _ => {}
        }
    }

    /// 사용자 수락
    pub fn accept(&mut self) -> Result<ControlMessage> {
        if self.state != ReceiverState::ReadyToAccept {
            return Err(Error::InvalidState(format!(
                "수락할 수 없는 상태: {:?}",
                self.state
            )));
        }
        self.state = ReceiverState::Receiving;
        info!("전송 수락");
        Ok(ControlMessage::AcceptTransfer)
    }

    /// 사용자 거절
    pub fn decline(&mut self, reason: impl Into<String>) -> ControlMessage {
        let reason = reason.into();
        self.state = ReceiverState::Error(format!("거절됨: {}", reason));
        ControlMessage::RejectTransfer { reason }
    }

    /// 보존된 지점으로부터 이어받기 요청 생성
    pub fn resume_request(&self) -> Option<ControlMessage> {
        self.resume.map(|point| ControlMessage::ResumeRequest {
            file_index: point.file_index,
            chunk_index: self.config.frame_index(point.received_bytes),
        })
    }

    /// 채널에서 올라온 프레임 처리, 송신측으로 보낼 응답 반환
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Option<ControlMessage>> {
        match frame {
            Frame::Binary(data) => {
                self.handle_binary(&data)?;
                Ok(None)
            }
            Frame::Control(msg) => self.handle_control(msg),
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<Option<ControlMessage>> {
        match msg {
            ControlMessage::Metadata {
                manifest,
                fingerprint,
                frame_size,
                ..
            } => Ok(self.handle_metadata(manifest, fingerprint, frame_size as usize)),

            ControlMessage::FileStart {
                file_index, size, ..
            } => {
                self.handle_file_start(file_index, size)?;
                Ok(None)
            }

            ControlMessage::FileComplete { file_index } => {
                self.handle_file_complete(file_index);
                Ok(None)
            }

            ControlMessage::AllFilesComplete => {
                if let Some(open) = self.current.take() {
                    self.fail_file(open, "ALL_FILES_COMPLETE 전에 FILE_COMPLETE 없음");
                }
                self.state = ReceiverState::Complete;
                self.resume = None;
                info!("모든 파일 수신 완료");
                self.emit(ReceiverEvent::AllFilesComplete);
                Ok(None)
            }

            ControlMessage::RejectTransfer { reason } => {
                warn!("전송 거부됨: {}", reason);
                self.abort_current();
                self.state = ReceiverState::Error(reason.clone());
                self.emit(ReceiverEvent::Rejected { reason });
                Ok(None)
            }

            ControlMessage::TransferCancelled => {
                info!("송신측이 전송 취소");
                self.abort_current();
                self.resume = None;
                self.state = ReceiverState::Cancelled;
                self.emit(ReceiverEvent::Cancelled);
                Ok(None)
            }

            other => {
                debug!("수신 세션에서 무시하는 메시지: {:?}", other.msg_type());
                Ok(None)
            }
        }
    }

    fn handle_metadata(
        &mut self,
        manifest: FileManifest,
        fingerprint: u32,
        frame_size: usize,
    ) -> Option<ControlMessage> {
        // 이후 이어받기 계산은 송신측이 공지한 프레임 크기 기준
        if frame_size > 0 {
            self.config.frame_size = frame_size;
        }

        // 같은 세션 재공지 + 보존된 지점이 있으면 이어받기
        if self.resume.is_some() && self.fingerprint == Some(fingerprint) {
            self.state = ReceiverState::Receiving;
            let request = self.resume_request();
            info!(resume = ?self.resume, "같은 세션 재연결, 이어받기 요청");
            return request;
        }

        info!(
            files = manifest.len(),
            total_size = manifest.total_size(),
            "메타데이터 수신"
        );

        self.resume = None;
        self.current = None;
        self.discarding = None;
        self.next_file_index = 0;
        self.statuses = vec![FileStatus::Pending; manifest.len()];
        self.fingerprint = Some(fingerprint);
        self.manifest = Some(manifest.clone());
        self.emit(ReceiverEvent::MetadataReceived { manifest });

        self.state = ReceiverState::ReadyToAccept;
        if self.config.auto_accept {
            self.state = ReceiverState::Receiving;
            info!("자동 수락");
            return Some(ControlMessage::AcceptTransfer);
        }
        None
    }

    fn handle_file_start(&mut self, file_index: usize, size: u64) -> Result<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| Error::violation(Some(file_index), "메타데이터 전에 FILE_START"))?;

        let entry = manifest
            .get(file_index)
            .cloned()
            .ok_or(Error::InvalidFileIndex {
                index: file_index,
                len: manifest.len(),
            })?;

        if let Some(open) = self.current.take() {
            let reason = format!("파일 {} 완료 전에 FILE_START {}", open.index, file_index);
            self.fail_file(open, &reason);
        }
        self.discarding = None;

        if entry.size != size {
            let reason = format!("선언 크기 {}가 매니페스트 크기 {}와 다름", size, entry.size);
            self.mark_failed(file_index, &reason);
            self.discarding = Some(file_index);
            return Ok(());
        }

        let offset = match self.resume.take() {
            Some(point) if point.file_index == file_index => point.received_bytes.min(size),
            _ => 0,
        };

        let sink = match self.sinks.open(file_index, &entry, offset) {
            Ok(sink) => sink,
            Err(e) => {
                self.mark_failed(file_index, &e.to_string());
                self.discarding = Some(file_index);
                return Ok(());
            }
        };

        debug!(file_index, size, offset, "파일 수신 시작");
        self.state = ReceiverState::Receiving;
        self.statuses[file_index] = FileStatus::Receiving;
        self.next_file_index = file_index;
        self.emit(ReceiverEvent::FileStarted { file_index, offset });

        let mut open = OpenFile {
            index: file_index,
            size,
            received: offset,
            sink: Some(sink),
        };

        // 빈 파일이나 끝까지 받아둔 파일은 바로 확정
        if open.received == open.size {
            if let Err(e) = Self::finalize(&mut open) {
                self.fail_file(open, &e.to_string());
                return Ok(());
            }
        }
        self.current = Some(open);
        Ok(())
    }

    fn handle_binary(&mut self, data: &[u8]) -> Result<()> {
        let Some(mut open) = self.current.take() else {
            if self.discarding.is_some() {
                return Ok(());
            }
            return Err(Error::violation(None, "열린 파일 없이 바이너리 프레임 수신"));
        };

        if open.sink.is_none() {
            let reason = format!("선언 크기 {} 이후에도 데이터 계속 수신", open.size);
            self.fail_file(open, &reason);
            return Ok(());
        }

        if open.received + data.len() as u64 > open.size {
            let reason = format!(
                "선언 크기 초과: {} + {} > {}",
                open.received,
                data.len(),
                open.size
            );
            self.fail_file(open, &reason);
            return Ok(());
        }

        let written = match open.sink.as_mut() {
            Some(sink) => sink.write(data),
            None => Ok(()),
        };
        if let Err(e) = written {
            self.fail_file(open, &e.to_string());
            return Ok(());
        }
        open.received += data.len() as u64;

        if open.received == open.size {
            if let Err(e) = Self::finalize(&mut open) {
                self.fail_file(open, &e.to_string());
                return Ok(());
            }
        }

        self.current = Some(open);
        Ok(())
    }

    fn handle_file_complete(&mut self, file_index: usize) {
        if self.discarding == Some(file_index) {
            self.discarding = None;
            self.next_file_index = file_index + 1;
            return;
        }

        let Some(open) = self.current.take() else {
            warn!(file_index, "열린 파일 없이 FILE_COMPLETE");
            self.mark_failed(file_index, "열린 파일 없이 FILE_COMPLETE");
            return;
        };

        if open.index != file_index {
            let reason = format!("FILE_COMPLETE {}가 열린 파일 {}와 다름", file_index, open.index);
            self.fail_file(open, &reason);
            return;
        }

        if open.sink.is_some() || open.received != open.size {
            let reason = format!("수신 {} / 선언 {} 상태에서 FILE_COMPLETE", open.received, open.size);
            self.fail_file(open, &reason);
            return;
        }

        debug!(file_index, bytes = open.size, "파일 수신 완료");
        self.statuses[file_index] = FileStatus::Complete;
        self.next_file_index = file_index + 1;
        self.emit(ReceiverEvent::FileCompleted { file_index });
    }

    fn finalize(open: &mut OpenFile) -> Result<()> {
        match open.sink.take() {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }

    fn mark_failed(&mut self, file_index: usize, reason: &str) {
        warn!(file_index, "파일 수신 실패: {}", reason);
        if let Some(status) = self.statuses.get_mut(file_index) {
            *status = FileStatus::Failed(reason.to_string());
        }
        self.next_file_index = file_index + 1;
        self.emit(ReceiverEvent::FileFailed {
            file_index,
            reason: reason.to_string(),
        });
    }

    /// 해당 파일만 실패 처리, 남은 프레임은 다음 FILE_START까지 버림.
    /// 이미 확정된 출력도 폐기
    fn fail_file(&mut self, open: OpenFile, reason: &str) {
        match open.sink {
            Some(sink) => sink.abort(),
            None => self.sinks.discard(open.index),
        }
        self.discarding = Some(open.index);
        self.mark_failed(open.index, reason);
    }

    fn abort_current(&mut self) {
        if let Some(open) = self.current.take() {
            if let Some(sink) = open.sink {
                sink.abort();
            }
        }
    }

    /// 연결 끊김
    ///
    /// 전송 중이었다면 마지막 프레임 경계까지의 지점을 보존
    pub fn on_closed(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let receiving = self.state == ReceiverState::Receiving;
        let resume = match (receiving, self.current.take()) {
            (true, Some(open)) => {
                let complete = open.sink.is_none() && open.received == open.size;
                if complete {
                    // 다 받았지만 FILE_COMPLETE는 못 받음
                    self.statuses[open.index] = FileStatus::Complete;
                    self.emit(ReceiverEvent::FileCompleted {
                        file_index: open.index,
                    });
                    Some(ResumePoint {
                        file_index: open.index + 1,
                        received_bytes: 0,
                    })
                } else {
                    Some(ResumePoint {
                        file_index: open.index,
                        received_bytes: self.config.align_to_frame(open.received),
                    })
                }
            }
            (true, None) => Some(ResumePoint {
                file_index: self.next_file_index,
                received_bytes: 0,
            }),
            _ => None,
        };

        self.discarding = None;
        self.resume = resume;
        self.state = ReceiverState::Paused;
        info!(resume = ?resume, "연결 끊김, 일시 정지");
        self.emit(ReceiverEvent::Paused { resume });
    }

    /// 채널 이벤트 구동 루프
    ///
    /// 종료 상태, 연결 끊김, 또는 사용자 수락 대기 상태가 되면 반환
    pub async fn run(
        &mut self,
        channel: &dyn Channel,
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<ReceiverState> {
        if channel.is_open() {
            self.on_open();
        }

        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Open => self.on_open(),
                ChannelEvent::Data(frame) => match self.handle_frame(frame) {
                    Ok(Some(reply)) => channel.send(Frame::Control(reply))?,
                    Ok(None) => {}
                    Err(e @ (Error::ProtocolViolation { .. } | Error::InvalidFileIndex { .. })) => {
                        warn!("{}", e)
                    }
                    Err(e) => return Err(e),
                },
                ChannelEvent::Closed => {
                    self.on_closed();
                    return Ok(self.state.clone());
                }
                ChannelEvent::Error(e) => warn!("채널 에러: {}", e),
            }

            if self.state.is_terminal() || self.state == ReceiverState::ReadyToAccept {
                return Ok(self.state.clone());
            }
        }

        self.on_closed();
        Ok(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::manifest::FileEntry;
    use crate::sink::MemorySinkFactory;

    const F: usize = 4;

    fn config() -> Config {
        Config {
            frame_size: F,
            read_batch_size: 16,
            auto_accept: true,
            ..Config::default()
        }
    }

    fn session(manifest: &FileManifest) -> (ReceiverSession, MemorySinkFactory) {
        let sinks = MemorySinkFactory::new();
        let mut session = ReceiverSession::new(config(), Box::new(sinks.clone()));
        session.on_open();
        let reply = session
            .handle_frame(ControlMessage::metadata(manifest, F).into())
            .unwrap();
        assert_eq!(reply, Some(ControlMessage::AcceptTransfer));
        (session, sinks)
    }

    fn start(index: usize, entry: &FileEntry) -> Frame {
        ControlMessage::FileStart {
            file_index: index,
            name: entry.name.clone(),
            size: entry.size,
            mime_type: entry.mime_type.clone(),
        }
        .into()
    }

    fn bin(data: &[u8]) -> Frame {
        Frame::Binary(Bytes::copy_from_slice(data))
    }

    fn complete(index: usize) -> Frame {
        ControlMessage::FileComplete { file_index: index }.into()
    }

    #[test]
    fn test_reconstructs_files_in_order() {
        let manifest = FileManifest::new(vec![FileEntry::new("a", 6), FileEntry::new("b", 0)]);
        let (mut rx, sinks) = session(&manifest);

        rx.handle_frame(start(0, &manifest.files()[0])).unwrap();
        rx.handle_frame(bin(b"abcd")).unwrap();
        rx.handle_frame(bin(b"ef")).unwrap();
        rx.handle_frame(complete(0)).unwrap();
        rx.handle_frame(start(1, &manifest.files()[1])).unwrap();
        rx.handle_frame(complete(1)).unwrap();
        rx.handle_frame(ControlMessage::AllFilesComplete.into()).unwrap();

        assert_eq!(rx.state(), &ReceiverState::Complete);
        assert_eq!(sinks.completed(0).unwrap().as_ref(), b"abcdef");
        assert_eq!(sinks.completed(1).unwrap().len(), 0);
        assert_eq!(rx.file_status(1), Some(&FileStatus::Complete));
    }

    #[test]
    fn test_overflow_fails_only_that_file() {
        let manifest = FileManifest::new(vec![
            FileEntry::new("ok", 4),
            FileEntry::new("bad", 4),
            FileEntry::new("next", 2),
        ]);
        let (mut rx, sinks) = session(&manifest);

        rx.handle_frame(start(0, &manifest.files()[0])).unwrap();
        rx.handle_frame(bin(b"1234")).unwrap();
        rx.handle_frame(complete(0)).unwrap();

        rx.handle_frame(start(1, &manifest.files()[1])).unwrap();
        rx.handle_frame(bin(b"1234")).unwrap();
        // 선언 크기 이후에도 데이터
        rx.handle_frame(bin(b"5")).unwrap();
        rx.handle_frame(bin(b"6")).unwrap();
        rx.handle_frame(complete(1)).unwrap();

        rx.handle_frame(start(2, &manifest.files()[2])).unwrap();
        rx.handle_frame(bin(b"xy")).unwrap();
        rx.handle_frame(complete(2)).unwrap();

        assert!(matches!(rx.file_status(1), Some(FileStatus::Failed(_))));
        assert_eq!(rx.file_status(0), Some(&FileStatus::Complete));
        assert_eq!(rx.file_status(2), Some(&FileStatus::Complete));
        assert_eq!(sinks.completed(0).unwrap().as_ref(), b"1234");
        assert!(sinks.completed(1).is_none());
        assert_eq!(sinks.completed(2).unwrap().as_ref(), b"xy");
    }

    #[test]
    fn test_early_file_complete_is_violation() {
        let manifest = FileManifest::new(vec![FileEntry::new("a", 8)]);
        let (mut rx, sinks) = session(&manifest);

        rx.handle_frame(start(0, &manifest.files()[0])).unwrap();
        rx.handle_frame(bin(b"abcd")).unwrap();
        rx.handle_frame(complete(0)).unwrap();

        assert!(matches!(rx.file_status(0), Some(FileStatus::Failed(_))));
        assert!(sinks.completed(0).is_none());
        assert_eq!(sinks.partial_len(0), None);
    }

    #[test]
    fn test_binary_without_file_is_violation() {
        let manifest = FileManifest::new(vec![FileEntry::new("a", 8)]);
        let (mut rx, _sinks) = session(&manifest);

        assert!(matches!(
            rx.handle_frame(bin(b"abcd")),
            Err(Error::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_close_retains_frame_aligned_resume_point() {
        let manifest = FileManifest::new(vec![FileEntry::new("a", 3), FileEntry::new("b", 12)]);
        let (mut rx, sinks) = session(&manifest);

        rx.handle_frame(start(0, &manifest.files()[0])).unwrap();
        rx.handle_frame(bin(b"abc")).unwrap();
        rx.handle_frame(complete(0)).unwrap();
        rx.handle_frame(start(1, &manifest.files()[1])).unwrap();
        rx.handle_frame(bin(b"0123")).unwrap();
        rx.handle_frame(bin(b"45")).unwrap(); // 프레임 중간에서 끊긴 조각

        rx.on_closed();
        assert_eq!(rx.state(), &ReceiverState::Paused);
        assert_eq!(
            rx.resume_point(),
            Some(ResumePoint {
                file_index: 1,
                received_bytes: 4
            })
        );

        // 같은 세션 재공지 → 이어받기 요청
        rx.on_open();
        let reply = rx
            .handle_frame(ControlMessage::metadata(&manifest, F).into())
            .unwrap();
        assert_eq!(
            reply,
            Some(ControlMessage::ResumeRequest {
                file_index: 1,
                chunk_index: 1
            })
        );

        rx.handle_frame(start(1, &manifest.files()[1])).unwrap();
        rx.handle_frame(bin(b"4567")).unwrap();
        rx.handle_frame(bin(b"89ab")).unwrap();
        rx.handle_frame(complete(1)).unwrap();

        assert_eq!(sinks.completed(0).unwrap().as_ref(), b"abc");
        assert_eq!(sinks.completed(1).unwrap().as_ref(), b"0123456789ab");
    }

    #[test]
    fn test_reject_surfaces_reason() {
        let sinks = MemorySinkFactory::new();
        let mut rx = ReceiverSession::new(config(), Box::new(sinks));
        let mut events = rx.take_events().unwrap();
        rx.on_open();

        rx.handle_frame(
            ControlMessage::RejectTransfer {
                reason: "expired".into(),
            }
            .into(),
        )
        .unwrap();

        assert_eq!(rx.state(), &ReceiverState::Error("expired".into()));
        assert_eq!(
            events.try_recv().unwrap(),
            ReceiverEvent::Rejected {
                reason: "expired".into()
            }
        );
    }

    #[test]
    fn test_manual_accept() {
        let manifest = FileManifest::new(vec![FileEntry::new("a", 1)]);
        let mut rx = ReceiverSession::new(
            Config {
                auto_accept: false,
                ..config()
            },
            Box::new(MemorySinkFactory::new()),
        );
        rx.on_open();

        assert!(rx.accept().is_err());
        let reply = rx
            .handle_frame(ControlMessage::metadata(&manifest, F).into())
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(rx.state(), &ReceiverState::ReadyToAccept);
        assert_eq!(rx.accept().unwrap(), ControlMessage::AcceptTransfer);
        assert_eq!(rx.state(), &ReceiverState::Receiving);
    }
}
