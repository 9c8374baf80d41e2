//! 송신자 (공유측, 피어 하나당 하나)
//!
//! - 파일마다 FILE_START → 바이너리 프레임 → FILE_COMPLETE
//! - 매니페스트 소진 후 ALL_FILES_COMPLETE
//! - 이어받기 오프셋은 수신측이 말한 값을 그대로 신뢰

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::channel::{Channel, PeerId};
use crate::chunk::{ChunkedByteSender, SendTarget};
use crate::epoch::EpochGuard;
use crate::flow::FlowController;
use crate::manifest::FileManifest;
use crate::message::{ControlMessage, Frame};
use crate::source::FileSource;
use crate::stats::{PeerProgress, ThroughputMeter};
use crate::{Config, Error, Result};

/// 공유 세션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Configuring,
    Announcing,
    AwaitingPeer,
    PeerConnected,
    Transferring,
    Error(String),
}

impl SenderState {
    /// 새 연결을 받을 수 있는 상태인지
    pub fn accepts_peers(&self) -> bool {
        matches!(
            self,
            SenderState::AwaitingPeer | SenderState::PeerConnected | SenderState::Transferring
        )
    }
}

/// 피어별 전송 상태
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerPeerTransferState {
    pub peer_id: PeerId,
    pub current_file_index: usize,
    pub bytes_sent_for_current_file: u64,

    /// 이 상태를 소유한 루프의 세션 에포크
    pub session_id: u64,
}

/// 송신 시작 위치
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartPoint {
    pub file_index: usize,
    pub offset: u64,
}

impl StartPoint {
    pub fn beginning() -> Self {
        Self::default()
    }
}

/// UI 계층으로 올라가는 피어 단위 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Connected { peer_id: PeerId },
    Rejected { peer_id: PeerId, reason: String },
    TransferStarted { peer_id: PeerId, start: StartPoint },
    FileSent { peer_id: PeerId, file_index: usize },
    Completed { peer_id: PeerId },
    Declined { peer_id: PeerId, reason: String },
    Disconnected { peer_id: PeerId },
    Failed { peer_id: PeerId, error: String },
}

/// 루프 내부에서만 쓰는 파일 경계 기록
#[derive(Debug, Default)]
struct FileCursor {
    state: PerPeerTransferState,

    /// 현재 파일 시작 시점의 누적 전송 바이트
    handed_off_at_start: u64,

    /// 현재 파일 시작 오프셋
    start_offset: u64,

    /// 현재 파일 앞쪽 파일들의 총 크기
    bytes_before: u64,
}

/// 피어 하나에 대한 송신 세션
pub struct SenderSession {
    config: Config,
    channel: Arc<dyn Channel>,
    manifest: Arc<FileManifest>,
    source: Arc<dyn FileSource>,
    chunker: ChunkedByteSender,
    flow: FlowController,

    /// 송신 루프가 소유하는 상태
    cursor: RwLock<FileCursor>,

    /// 채널에 넘긴 누적 바이트
    handed_off: AtomicU64,

    meter: Mutex<ThroughputMeter>,

    /// 송신 루프 실행 중 여부
    transferring: AtomicBool,
}

impl SenderSession {
    pub fn new(
        config: &Config,
        channel: Arc<dyn Channel>,
        manifest: Arc<FileManifest>,
        source: Arc<dyn FileSource>,
    ) -> Self {
        let cursor = FileCursor {
            state: PerPeerTransferState {
                peer_id: channel.peer_id().to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        Self {
            chunker: ChunkedByteSender::from_config(config),
            flow: FlowController::from_config(config),
            cursor: RwLock::new(cursor),
            handed_off: AtomicU64::new(0),
            meter: Mutex::new(ThroughputMeter::new(config.sample_interval())),
            transferring: AtomicBool::new(false),
            config: config.clone(),
            channel,
            manifest,
            source,
        }
    }

    pub fn peer_id(&self) -> &str {
        self.channel.peer_id()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::SeqCst)
    }

    /// 현재 전송 상태 스냅샷
    pub fn state(&self) -> PerPeerTransferState {
        let cursor = self.cursor.read();
        let mut state = cursor.state.clone();
        if self.is_transferring() {
            state.bytes_sent_for_current_file = cursor.start_offset
                + self
                    .handed_off
                    .load(Ordering::Relaxed)
                    .saturating_sub(cursor.handed_off_at_start);
        }
        state
    }

    /// 메타데이터 전송
    pub fn announce(&self, frame_size: usize) -> Result<()> {
        self.channel
            .send(ControlMessage::metadata(&self.manifest, frame_size).into())
    }

    /// 수신측 컨트롤 메시지를 시작 위치로 해석
    ///
    /// ACCEPT_TRANSFER는 처음부터, RESUME_REQUEST는 `chunk_index × frame_size`부터.
    /// 오프셋 계산이 넘치면 프로토콜 위반
    pub fn start_point_for(&self, msg: &ControlMessage) -> Result<Option<StartPoint>> {
        match msg {
            ControlMessage::AcceptTransfer => Ok(Some(StartPoint::beginning())),
            ControlMessage::ResumeRequest {
                file_index,
                chunk_index,
            } => {
                let offset = self.config.frame_offset(*chunk_index).ok_or_else(|| {
                    Error::violation(
                        Some(*file_index),
                        format!("이어받기 청크 인덱스 범위 초과: {}", chunk_index),
                    )
                })?;
                Ok(Some(StartPoint {
                    file_index: *file_index,
                    offset,
                }))
            }
            _ => Ok(None),
        }
    }

    /// 처리율 샘플링
    pub fn sample(&self) {
        let handed_off = self.handed_off.load(Ordering::Relaxed);
        let outstanding = self.channel.outstanding_bytes();
        self.meter.lock().sample(handed_off, outstanding);
    }

    /// 진행 상황 스냅샷
    pub fn progress(&self) -> PeerProgress {
        let state = self.state();
        let bytes_before = self.cursor.read().bytes_before;
        let meter = self.meter.lock();

        PeerProgress {
            peer_id: state.peer_id.clone(),
            file_index: state.current_file_index,
            bytes_sent_for_current_file: state.bytes_sent_for_current_file,
            completed_bytes: bytes_before + state.bytes_sent_for_current_file,
            total_bytes: self.manifest.total_size(),
            speed: meter.speed(),
            average_speed: meter.average_speed(),
        }
    }

    /// 송신 루프 점유 (이미 실행 중이면 false)
    pub(crate) fn try_begin(&self) -> bool {
        !self.transferring.swap(true, Ordering::SeqCst)
    }

    /// 송신 루프
    ///
    /// 파일/프레임 경계마다 에포크를 확인하고, 오래된 세대면 더 보내지 않고 종료
    pub async fn run(&self, start: StartPoint, mut guard: EpochGuard) -> Result<()> {
        let result = self.run_inner(start, &mut guard).await;
        self.transferring.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self, start: StartPoint, guard: &mut EpochGuard) -> Result<()> {
        let files = self.manifest.files();
        if start.file_index > files.len() {
            return Err(Error::InvalidFileIndex {
                index: start.file_index,
                len: files.len(),
            });
        }

        info!(
            peer = self.peer_id(),
            file_index = start.file_index,
            offset = start.offset,
            epoch = guard.epoch(),
            "송신 시작"
        );

        let mut bytes_before: u64 = files[..start.file_index].iter().map(|f| f.size).sum();

        for (file_index, entry) in files.iter().enumerate().skip(start.file_index) {
            guard.check()?;

            let mut offset = if file_index == start.file_index {
                start.offset
            } else {
                0
            };
            if offset > entry.size {
                warn!(
                    peer = self.peer_id(),
                    file_index,
                    offset,
                    size = entry.size,
                    "이어받기 오프셋이 파일 크기를 넘음, 파일 끝으로 조정"
                );
                offset = entry.size;
            }

            {
                let mut cursor = self.cursor.write();
                cursor.state.current_file_index = file_index;
                cursor.state.bytes_sent_for_current_file = offset;
                cursor.state.session_id = guard.epoch();
                cursor.handed_off_at_start = self.handed_off.load(Ordering::Relaxed);
                cursor.start_offset = offset;
                cursor.bytes_before = bytes_before;
            }

            self.channel.send(Frame::Control(ControlMessage::FileStart {
                file_index,
                name: entry.name.clone(),
                size: entry.size,
                mime_type: entry.mime_type.clone(),
            }))?;
            debug!(
                peer = self.peer_id(),
                file_index,
                offset,
                frames = self.config.frames_for(entry.size - offset),
                "파일 전송 시작"
            );

            let mut source = self.source.open(file_index)?;
            let sent = self
                .chunker
                .send(
                    &mut source,
                    offset,
                    entry.size - offset,
                    SendTarget {
                        channel: self.channel.as_ref(),
                        flow: &self.flow,
                        guard: &mut *guard,
                        handed_off: &self.handed_off,
                    },
                )
                .await?;

            guard.check()?;
            self.channel
                .send(Frame::Control(ControlMessage::FileComplete { file_index }))?;

            self.cursor.write().state.bytes_sent_for_current_file = offset + sent;
            bytes_before += entry.size;

            debug!(
                peer = self.peer_id(),
                file_index,
                bytes = sent,
                "파일 전송 완료"
            );
        }

        guard.check()?;
        self.channel
            .send(Frame::Control(ControlMessage::AllFilesComplete))?;

        {
            let mut cursor = self.cursor.write();
            cursor.bytes_before = bytes_before;
            cursor.state.current_file_index = files.len();
            cursor.state.bytes_sent_for_current_file = 0;
        }

        info!(peer = self.peer_id(), "모든 파일 전송 완료");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::channel::ChannelEvent;
    use crate::epoch::SessionEpoch;
    use crate::loopback::{EventReceiver, LoopbackChannel, LoopbackOptions};
    use crate::source::MemorySource;

    fn small_config() -> Config {
        Config {
            frame_size: 1024,
            read_batch_size: 4096,
            high_water_mark: 8192,
            low_water_mark: 8192,
            ..Config::default()
        }
    }

    fn session_with(
        files: Vec<(&str, Bytes)>,
    ) -> (SenderSession, Arc<LoopbackChannel>, EventReceiver) {
        let ((tx, _), (rx, rx_events)) =
            LoopbackChannel::pair("sender", "receiver", LoopbackOptions::unlimited());
        let (manifest, source) = MemorySource::with_manifest(files);
        let session = SenderSession::new(
            &small_config(),
            tx,
            Arc::new(manifest),
            Arc::new(source),
        );
        (session, rx, rx_events)
    }

    fn drain_controls(events: &mut EventReceiver) -> Vec<ControlMessage> {
        let mut controls = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Data(Frame::Control(msg)) = event {
                controls.push(msg);
            }
        }
        controls
    }

    #[tokio::test]
    async fn test_emits_control_sequence() {
        let (session, _rx, mut events) = session_with(vec![
            ("a.bin", Bytes::from(vec![1u8; 2500])),
            ("empty.bin", Bytes::new()),
        ]);
        let epoch = SessionEpoch::new();

        session.run(StartPoint::beginning(), epoch.guard()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let controls = drain_controls(&mut events);
        let kinds: Vec<_> = controls.iter().map(|m| m.msg_type()).collect();
        use crate::message::MessageType::*;
        assert_eq!(
            kinds,
            vec![FileStart, FileComplete, FileStart, FileComplete, AllFilesComplete]
        );

        let progress = session.progress();
        assert_eq!(progress.completed_bytes, 2500);
        assert!((progress.fraction() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_resume_request_maps_to_offset() {
        let (session, _rx, _events) =
            session_with(vec![("a.bin", Bytes::from(vec![1u8; 5000]))]);

        let start = session
            .start_point_for(&ControlMessage::ResumeRequest {
                file_index: 0,
                chunk_index: 3,
            })
            .unwrap();
        assert_eq!(start, Some(StartPoint { file_index: 0, offset: 3072 }));
        assert_eq!(
            session.start_point_for(&ControlMessage::AcceptTransfer).unwrap(),
            Some(StartPoint::beginning())
        );
        assert_eq!(
            session.start_point_for(&ControlMessage::AllFilesComplete).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_overflowing_resume_chunk_is_violation() {
        let (session, _rx, _events) =
            session_with(vec![("a.bin", Bytes::from(vec![1u8; 5000]))]);

        let result = session.start_point_for(&ControlMessage::ResumeRequest {
            file_index: 0,
            chunk_index: u64::MAX / 2,
        });
        assert!(matches!(
            result,
            Err(Error::ProtocolViolation {
                file_index: Some(0),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_stale_epoch_sends_nothing() {
        let (session, _rx, mut events) =
            session_with(vec![("a.bin", Bytes::from(vec![1u8; 5000]))]);
        let epoch = SessionEpoch::new();
        let guard = epoch.guard();
        epoch.bump();

        let result = session.run(StartPoint::beginning(), guard).await;
        assert!(matches!(result, Err(Error::Cancelled)));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ChannelEvent::Data(_)));
        }
    }

    #[tokio::test]
    async fn test_invalid_resume_index() {
        let (session, _rx, _events) =
            session_with(vec![("a.bin", Bytes::from(vec![1u8; 10]))]);
        let epoch = SessionEpoch::new();

        let result = session
            .run(StartPoint { file_index: 5, offset: 0 }, epoch.guard())
            .await;
        assert!(matches!(result, Err(Error::InvalidFileIndex { index: 5, len: 1 })));
    }
}
