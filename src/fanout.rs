//! 멀티 피어 팬아웃
//!
//! 공유 세션 하나에 여러 수신자가 동시에 연결됨.
//! - 피어마다 독립된 `SenderSession`과 송신 루프, 흐름 제어도 피어별
//! - 피어 집합은 피어 ID 키의 맵 (제거는 맵 삭제로 끝)
//! - 세션 전체 해체는 공유 에포크 증가로 모든 루프에 전파

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelEvent, PeerId};
use crate::epoch::{EpochGuard, SessionEpoch};
use crate::manifest::{FileManifest, TransferConstraints};
use crate::message::{ControlMessage, Frame};
use crate::sender::{PeerEvent, PerPeerTransferState, SenderSession, SenderState, StartPoint};
use crate::source::FileSource;
use crate::stats::{GlobalProgress, PeerProgress};
use crate::{Config, Error, Result};

/// 만료 시 수신자에게 보내는 거부 사유
pub const EXPIRED_REASON: &str = "session expired";

/// 공유 대상 (configure 단계에서 고정)
struct Share {
    manifest: Arc<FileManifest>,
    source: Arc<dyn FileSource>,
    constraints: TransferConstraints,
}

/// 피어 팬아웃 관리자
pub struct PeerFanoutManager {
    config: Config,
    share: RwLock<Option<Share>>,

    /// 활성 피어
    peers: DashMap<PeerId, Arc<SenderSession>>,

    /// 세션 해체마다 증가
    epoch: SessionEpoch,

    state: watch::Sender<SenderState>,

    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl PeerFanoutManager {
    pub fn new(config: Config) -> Arc<Self> {
        let (state, _) = watch::channel(SenderState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            share: RwLock::new(None),
            peers: DashMap::new(),
            epoch: SessionEpoch::new(),
            state,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SenderState {
        self.state.borrow().clone()
    }

    /// 상태 변화 구독
    pub fn subscribe_state(&self) -> watch::Receiver<SenderState> {
        self.state.subscribe()
    }

    /// 피어 이벤트 스트림 (한 번만 꺼낼 수 있음)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    /// 현재 세션 에포크
    pub fn session_id(&self) -> u64 {
        self.epoch.current()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn peer_state(&self, peer_id: &str) -> Option<PerPeerTransferState> {
        self.peers.get(peer_id).map(|session| session.state())
    }

    /// 남은 만료 시간
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.share
            .read()
            .as_ref()
            .and_then(|share| share.constraints.remaining())
    }

    fn set_state(&self, next: SenderState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            debug!("공유 상태: {:?} → {:?}", state, next);
            *state = next;
            true
        });
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    /// 공유할 파일 목록 설정
    pub fn configure(
        &self,
        manifest: FileManifest,
        source: Arc<dyn FileSource>,
        constraints: TransferConstraints,
    ) -> Result<()> {
        match self.state() {
            SenderState::Idle | SenderState::Error(_) => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "공유 중에는 다시 설정할 수 없음: {:?}",
                    other
                )))
            }
        }
        self.config.validate()?;

        info!(
            files = manifest.len(),
            total_size = manifest.total_size(),
            expires_in = ?constraints.remaining(),
            "공유 설정"
        );
        *self.share.write() = Some(Share {
            manifest: Arc::new(manifest),
            source,
            constraints,
        });
        self.set_state(SenderState::Configuring);
        Ok(())
    }

    /// 랑데부 식별자 공지 시작
    pub fn announce(&self) -> Result<()> {
        if self.state() != SenderState::Configuring {
            return Err(Error::InvalidState(format!(
                "공지할 수 없는 상태: {:?}",
                self.state()
            )));
        }
        self.set_state(SenderState::Announcing);
        Ok(())
    }

    /// 랑데부 채널이 열림, 피어 대기 시작
    ///
    /// 만료 카운트다운과 처리율 샘플러도 여기서 시작
    pub fn rendezvous_opened(self: &Arc<Self>) -> Result<()> {
        if self.state() != SenderState::Announcing {
            return Err(Error::InvalidState(format!(
                "랑데부 대기 상태가 아님: {:?}",
                self.state()
            )));
        }
        self.set_state(SenderState::AwaitingPeer);

        let guard = self.epoch.guard();
        tokio::spawn(expiry_ticker(Arc::downgrade(self), guard.clone()));
        tokio::spawn(throughput_sampler(Arc::downgrade(self), guard));
        info!(session_id = self.session_id(), "피어 대기 중");
        Ok(())
    }

    /// configure → announce → rendezvous_opened
    pub fn share(
        self: &Arc<Self>,
        manifest: FileManifest,
        source: Arc<dyn FileSource>,
        constraints: TransferConstraints,
    ) -> Result<()> {
        self.configure(manifest, source, constraints)?;
        self.announce()?;
        self.rendezvous_opened()
    }

    /// 인바운드 연결 수락
    ///
    /// 만료되었으면 (만료 틱으로 해체된 뒤라도) 거부 메시지 후 잠시 뒤 연결 종료.
    /// 그 밖에 받을 수 없는 경우엔 바로 연결 종료
    pub fn admit(
        self: &Arc<Self>,
        channel: Arc<dyn Channel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<()> {
        let shared = self
            .share
            .read()
            .as_ref()
            .map(|share| (share.manifest.clone(), share.source.clone(), share.constraints));
        let Some((manifest, source, constraints)) = shared else {
            channel.close();
            return Err(Error::InvalidState("공유 설정 없음".into()));
        };

        let peer_id = channel.peer_id().to_string();
        if constraints.is_expired() {
            warn!(peer = %peer_id, "만료된 세션, 연결 거부");
            self.reject_and_close(channel, EXPIRED_REASON);
            self.emit(PeerEvent::Rejected {
                peer_id,
                reason: EXPIRED_REASON.to_string(),
            });
            return Err(Error::SessionExpired);
        }

        let state = self.state();
        if !state.accepts_peers() {
            debug!(peer = %peer_id, state = ?state, "연결을 받을 수 없는 상태, 연결 종료");
            channel.close();
            return Err(Error::InvalidState(format!(
                "연결을 받을 수 없는 상태: {:?}",
                state
            )));
        }

        let session = Arc::new(SenderSession::new(&self.config, channel, manifest, source));
        if let Some(previous) = self.peers.insert(peer_id.clone(), session.clone()) {
            debug!(peer = %peer_id, "같은 피어의 이전 연결 교체");
            previous.channel().close();
        }

        session.announce(self.config.frame_size)?;
        info!(peer = %peer_id, peers = self.peers.len(), "피어 연결");
        self.emit(PeerEvent::Connected {
            peer_id: peer_id.clone(),
        });
        self.refresh_state();

        tokio::spawn(self.clone().drive_peer(session, events, self.epoch.guard()));
        Ok(())
    }

    /// 피어 연결 하나의 컨트롤 메시지 구동
    async fn drive_peer(
        self: Arc<Self>,
        session: Arc<SenderSession>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        guard: EpochGuard,
    ) {
        let peer_id = session.peer_id().to_string();
        let mut stale = guard.clone();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChannelEvent::Data(Frame::Control(msg))) => match msg {
                        ControlMessage::AcceptTransfer | ControlMessage::ResumeRequest { .. } => {
                            match session.start_point_for(&msg) {
                                Ok(Some(start)) => self.start_transfer(&session, start, guard.clone()),
                                Ok(None) => {}
                                Err(e) => {
                                    warn!(peer = %peer_id, "잘못된 시작 요청, 연결 종료: {}", e);
                                    self.emit(PeerEvent::Failed {
                                        peer_id: peer_id.clone(),
                                        error: e.to_string(),
                                    });
                                    session.channel().close();
                                }
                            }
                        }
                        ControlMessage::RejectTransfer { reason } => {
                            info!(peer = %peer_id, "수신자가 전송 거절: {}", reason);
                            self.emit(PeerEvent::Declined {
                                peer_id: peer_id.clone(),
                                reason,
                            });
                        }
                        other => {
                            debug!(peer = %peer_id, "송신측에서 무시하는 메시지: {:?}", other.msg_type());
                        }
                    },
                    Some(ChannelEvent::Data(Frame::Binary(_))) => {
                        debug!(peer = %peer_id, "송신측에 도착한 바이너리 프레임 무시");
                    }
                    Some(ChannelEvent::Open) => {}
                    Some(ChannelEvent::Error(e)) => warn!(peer = %peer_id, "채널 에러: {}", e),
                    Some(ChannelEvent::Closed) | None => break,
                },
                _ = stale.stale() => return,
            }
        }

        self.remove_peer(&session);
    }

    /// 피어 송신 루프 시작 (이미 실행 중이면 무시)
    fn start_transfer(self: &Arc<Self>, session: &Arc<SenderSession>, start: StartPoint, guard: EpochGuard) {
        let peer_id = session.peer_id().to_string();
        if !session.try_begin() {
            warn!(peer = %peer_id, "이미 전송 중인 피어의 시작 요청 무시");
            return;
        }

        self.emit(PeerEvent::TransferStarted {
            peer_id: peer_id.clone(),
            start,
        });
        self.refresh_state();

        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            match session.run(start, guard).await {
                Ok(()) => manager.emit(PeerEvent::Completed {
                    peer_id: peer_id.clone(),
                }),
                Err(Error::Cancelled) => debug!(peer = %peer_id, "송신 루프 취소됨"),
                // 연결 종료는 구동 루프가 Disconnected로 보고
                Err(Error::ChannelClosed) => debug!(peer = %peer_id, "전송 중 연결 종료"),
                Err(e) => {
                    warn!(peer = %peer_id, "송신 실패: {}", e);
                    manager.emit(PeerEvent::Failed {
                        peer_id: peer_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
            manager.refresh_state();
        });
    }

    /// 피어 제거 (교체된 이전 연결이면 아무 것도 안 함)
    fn remove_peer(&self, session: &Arc<SenderSession>) {
        let peer_id = session.peer_id();
        let removed = self
            .peers
            .remove_if(peer_id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if !removed {
            return;
        }

        info!(peer = %peer_id, peers = self.peers.len(), "피어 연결 종료");
        self.emit(PeerEvent::Disconnected {
            peer_id: peer_id.to_string(),
        });
        self.refresh_state();
    }

    /// 피어 집합으로부터 상태 재계산
    fn refresh_state(&self) {
        if !self.state().accepts_peers() {
            return;
        }

        let next = if self.peers.is_empty() {
            SenderState::AwaitingPeer
        } else if self.peers.iter().any(|entry| entry.value().is_transferring()) {
            SenderState::Transferring
        } else {
            SenderState::PeerConnected
        };
        self.set_state(next);
    }

    fn reject_and_close(&self, channel: Arc<dyn Channel>, reason: &str) {
        let _ = channel.send(Frame::Control(ControlMessage::RejectTransfer {
            reason: reason.to_string(),
        }));
        let delay = self.config.reject_close_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            channel.close();
        });
    }

    /// 모든 루프 무효화 후 피어 목록 비우기
    fn teardown(&self) -> Vec<Arc<SenderSession>> {
        let epoch = self.epoch.bump();
        let sessions: Vec<_> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        self.peers.clear();
        debug!(epoch, peers = sessions.len(), "세션 해체");
        sessions
    }

    /// 사용자가 공유 중단
    ///
    /// 진행 중인 루프를 먼저 멈추고, 모든 피어에 취소 알림 후 연결 종료
    pub async fn cancel(&self) {
        let sessions = self.teardown();
        for session in &sessions {
            let _ = session
                .channel()
                .send(Frame::Control(ControlMessage::TransferCancelled));
        }
        *self.share.write() = None;
        self.set_state(SenderState::Idle);
        info!(peers = sessions.len(), "공유 취소");

        tokio::time::sleep(self.config.reject_close_delay()).await;
        for session in sessions {
            session.channel().close();
        }
    }

    /// 만료로 인한 해체
    pub async fn expire(&self) {
        let sessions = self.teardown();
        for session in &sessions {
            let _ = session.channel().send(Frame::Control(ControlMessage::RejectTransfer {
                reason: EXPIRED_REASON.to_string(),
            }));
        }
        self.set_state(SenderState::Error("expired".into()));
        warn!(peers = sessions.len(), "공유 세션 만료");

        tokio::time::sleep(self.config.reject_close_delay()).await;
        for session in sessions {
            session.channel().close();
        }
    }

    /// 피어별 진행 상황
    pub fn progress(&self) -> Vec<PeerProgress> {
        self.peers
            .iter()
            .map(|entry| entry.value().progress())
            .collect()
    }

    /// 전체 진행 상황
    pub fn global_progress(&self) -> GlobalProgress {
        GlobalProgress::aggregate(&self.progress())
    }
}

/// 1초 주기 만료 확인
async fn expiry_ticker(manager: Weak<PeerFanoutManager>, mut guard: EpochGuard) {
    let tick = match manager.upgrade() {
        Some(manager) => manager.config.expiry_tick(),
        None => return,
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = guard.stale() => return,
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        let expired = manager
            .share
            .read()
            .as_ref()
            .map(|share| share.constraints.is_expired())
            .unwrap_or(false);
        if expired {
            manager.expire().await;
            return;
        }
    }
}

/// 고정 주기 처리율 샘플링
async fn throughput_sampler(manager: Weak<PeerFanoutManager>, mut guard: EpochGuard) {
    let period = match manager.upgrade() {
        Some(manager) => manager.config.sample_interval(),
        None => return,
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = guard.stale() => return,
        }

        let Some(manager) = manager.upgrade() else {
            return;
        };
        for entry in manager.peers.iter() {
            entry.value().sample();
        }
    }
}
