//! 채팅 릴레이 (스타 토폴로지)
//!
//! - 호스트 1명, 게스트 N명, 게스트는 호스트에만 연결
//! - 호스트는 받은 메시지를 보낸 연결을 제외한 모든 게스트에게 그대로 전달
//! - 게스트는 전달하지 않음
//! - 모든 메시지는 id 기준으로 한 번만 적용

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelEvent, PeerId};
use crate::fragment::{ChunkedChatPayload, MessageChunker, Reassembler, RecentIds};
use crate::message::{ControlMessage, Frame};
use crate::{Config, Result};

/// 채팅 메시지 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// 채팅 메시지 (생성 후 불변, id로 식별)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,

    /// 밀리초, UNIX epoch
    pub timestamp: u64,
    pub is_system: bool,
}

impl ChatMessage {
    pub fn new(sender_id: impl Into<String>, kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            sender_id: sender_id.into(),
            kind,
            content: content.into(),
            timestamp: now_millis(),
            is_system: false,
        }
    }

    pub fn text(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(sender_id, MessageKind::Text, content)
    }

    /// 입장/퇴장 알림 등 시스템 메시지
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            is_system: true,
            ..Self::new("system", MessageKind::Text, content)
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn new_message_id() -> String {
    format!("{:x}-{:016x}", now_millis(), rand::random::<u64>())
}

/// 릴레이 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    Host,
    Guest,
}

impl ChatRole {
    /// 메시지를 보낼 대상 연결
    ///
    /// `origin`이 None이면 로컬 입력
    pub fn relay_targets<'a>(
        &self,
        origin: Option<&str>,
        connected: impl IntoIterator<Item = &'a str>,
    ) -> Vec<&'a str> {
        match (self, origin) {
            // 로컬 입력은 연결된 모두에게 (게스트는 호스트 하나뿐)
            (_, None) => connected.into_iter().collect(),
            (ChatRole::Host, Some(origin)) => {
                connected.into_iter().filter(|peer| *peer != origin).collect()
            }
            (ChatRole::Guest, Some(_)) => Vec::new(),
        }
    }
}

/// 채팅 릴레이
pub struct ChatRelay {
    role: ChatRole,
    local_id: PeerId,
    chunker: MessageChunker,

    /// 연결된 피어 (게스트라면 호스트 하나)
    peers: RwLock<HashMap<PeerId, Arc<dyn Channel>>>,

    /// 이미 적용한 메시지 ID
    seen: Mutex<RecentIds>,
    reassembler: Mutex<Reassembler>,

    messages_tx: mpsc::UnboundedSender<ChatMessage>,
    messages_rx: Mutex<Option<mpsc::UnboundedReceiver<ChatMessage>>>,
}

impl ChatRelay {
    pub fn new(config: &Config, role: ChatRole, local_id: impl Into<PeerId>) -> Self {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        Self {
            role,
            local_id: local_id.into(),
            chunker: MessageChunker::from_config(config),
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(RecentIds::new(config.dedup_capacity)),
            reassembler: Mutex::new(Reassembler::from_config(config)),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
        }
    }

    pub fn role(&self) -> ChatRole {
        self.role
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// 로컬에 적용된 메시지 스트림 (한 번만 꺼낼 수 있음)
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<ChatMessage>> {
        self.messages_rx.lock().take()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    fn targets(&self, origin: Option<&str>) -> Vec<Arc<dyn Channel>> {
        let peers = self.peers.read();
        self.role
            .relay_targets(origin, peers.keys().map(String::as_str))
            .into_iter()
            .filter_map(|id| peers.get(id).cloned())
            .collect()
    }

    /// 처음 보는 id면 로컬에 적용하고 true
    fn apply(&self, message: ChatMessage) -> bool {
        if !self.seen.lock().insert(&message.id) {
            debug!(message_id = %message.id, "중복 메시지 무시");
            return false;
        }
        let _ = self.messages_tx.send(message);
        true
    }

    /// 대상들에게 전송, 한 피어의 실패는 다른 피어에 영향 없음
    async fn broadcast(&self, targets: &[Arc<dyn Channel>], messages: &[ControlMessage]) {
        for channel in targets {
            if let Err(e) = self.chunker.send_all(channel.as_ref(), messages).await {
                warn!(peer = channel.peer_id(), "채팅 전송 실패: {}", e);
            }
        }
    }

    /// 피어 연결 등록
    ///
    /// 호스트는 입장 알림을 만들어 기존 게스트에게 전달하고 로컬에도 적용
    pub async fn add_peer(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let peer_id = channel.peer_id().to_string();
        let existing = self.targets(None);
        self.peers.write().insert(peer_id.clone(), channel);
        info!(peer = %peer_id, role = ?self.role, "채팅 피어 연결");

        if self.role == ChatRole::Host {
            let notice = ChatMessage::system(format!("{} joined", peer_id));
            let encoded = self.chunker.encode(&notice)?;
            self.apply(notice);
            self.broadcast(&existing, &encoded).await;
        }
        Ok(())
    }

    /// 피어 연결 해제
    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        if self.peers.write().remove(peer_id).is_none() {
            return Ok(());
        }
        info!(peer = %peer_id, role = ?self.role, "채팅 피어 연결 해제");

        if self.role == ChatRole::Host {
            let notice = ChatMessage::system(format!("{} left", peer_id));
            let encoded = self.chunker.encode(&notice)?;
            self.apply(notice);
            let remaining = self.targets(None);
            self.broadcast(&remaining, &encoded).await;
        }
        Ok(())
    }

    /// 로컬 입력 전송
    pub async fn send_local(&self, kind: MessageKind, content: impl Into<String>) -> Result<ChatMessage> {
        let message = ChatMessage::new(self.local_id.clone(), kind, content);
        let encoded = self.chunker.encode(&message)?;

        self.apply(message.clone());
        let targets = self.targets(None);
        self.broadcast(&targets, &encoded).await;
        Ok(message)
    }

    /// 연결에서 올라온 채팅 컨트롤 메시지 처리
    pub async fn handle_inbound(&self, from: &str, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::ChatMessage(chat) => {
                let relay = [ControlMessage::ChatMessage(chat.clone())];
                // 확인과 기록을 한 번에 해야 동시 수신된 중복이 두 번 전달되지 않음
                if !self.apply(chat) {
                    return Ok(());
                }
                let targets = self.targets(Some(from));
                self.broadcast(&targets, &relay).await;
            }
            ControlMessage::ChatMessageChunk(payload) => {
                self.handle_fragment(from, payload).await?;
            }
            other => {
                debug!(from, "채팅 릴레이에서 무시하는 메시지: {:?}", other.msg_type());
            }
        }
        Ok(())
    }

    /// 조각은 재조립을 기다리지 않고 즉시 전달, 이미 받은 조각은 다시 전달하지 않음
    async fn handle_fragment(&self, from: &str, payload: ChunkedChatPayload) -> Result<()> {
        if self.seen.lock().contains(&payload.message_id) {
            return Ok(());
        }

        let relay = [ControlMessage::ChatMessageChunk(payload.clone())];
        let completed = {
            let mut reassembler = self.reassembler.lock();
            if reassembler.has_fragment(&payload.message_id, payload.index) {
                trace!(message_id = %payload.message_id, index = payload.index, "중복 조각 무시");
                return Ok(());
            }
            reassembler.push(payload)?
        };

        let targets = self.targets(Some(from));
        if !targets.is_empty() {
            self.broadcast(&targets, &relay).await;
        }

        if let Some(message) = completed {
            debug!(message_id = %message.id, from, "조각 메시지 재조립 완료");
            self.apply(message);
        }
        Ok(())
    }

    /// 연결 하나의 이벤트 구동 루프, 연결이 닫히면 피어 제거 후 반환
    pub async fn run_peer(
        self: Arc<Self>,
        peer_id: PeerId,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<()> {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Data(Frame::Control(message)) => {
                    if let Err(e) = self.handle_inbound(&peer_id, message).await {
                        warn!(peer = %peer_id, "채팅 메시지 처리 실패: {}", e);
                    }
                }
                ChannelEvent::Data(Frame::Binary(_)) => {
                    debug!(peer = %peer_id, "채팅 채널의 바이너리 프레임 무시");
                }
                ChannelEvent::Closed => break,
                ChannelEvent::Error(e) => warn!(peer = %peer_id, "채널 에러: {}", e),
                ChannelEvent::Open => {}
            }
        }
        self.remove_peer(&peer_id).await
    }

    /// 세션 해체, 재조립 중인 버퍼 폐기
    pub fn clear(&self) {
        for channel in self.peers.write().drain().map(|(_, c)| c) {
            channel.close();
        }
        self.reassembler.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::loopback::{LoopbackChannel, LoopbackOptions};

    fn config() -> Config {
        Config {
            chat_safe_frame_size: 512,
            chat_fragment_size: 128,
            ..Config::default()
        }
    }

    /// 호스트 1 + 게스트 A, B
    async fn star() -> (Arc<ChatRelay>, Arc<ChatRelay>, Arc<ChatRelay>) {
        let config = config();
        let host = Arc::new(ChatRelay::new(&config, ChatRole::Host, "host"));
        let a = Arc::new(ChatRelay::new(&config, ChatRole::Guest, "guest-a"));
        let b = Arc::new(ChatRelay::new(&config, ChatRole::Guest, "guest-b"));

        for guest in [&a, &b] {
            let ((host_end, host_events), (guest_end, guest_events)) =
                LoopbackChannel::pair("host", guest.local_id(), LoopbackOptions::unlimited());

            host.add_peer(host_end).await.unwrap();
            guest.add_peer(guest_end).await.unwrap();
            tokio::spawn(host.clone().run_peer(guest.local_id().to_string(), host_events));
            tokio::spawn(guest.clone().run_peer("host".to_string(), guest_events));
        }
        (host, a, b)
    }

    async fn user_messages(rx: &mut mpsc::UnboundedReceiver<ChatMessage>) -> Vec<ChatMessage> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if !message.is_system {
                out.push(message);
            }
        }
        out
    }

    #[test]
    fn test_relay_decision_by_role() {
        let peers = ["a", "b", "c"];
        assert_eq!(ChatRole::Host.relay_targets(Some("a"), peers), vec!["b", "c"]);
        assert_eq!(ChatRole::Host.relay_targets(None, peers), vec!["a", "b", "c"]);
        assert!(ChatRole::Guest.relay_targets(Some("host"), ["host"]).is_empty());
        assert_eq!(ChatRole::Guest.relay_targets(None, ["host"]), vec!["host"]);
    }

    #[test]
    fn test_wire_field_names() {
        let message = ChatMessage::text("me", "hi");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["senderId"], "me");
        assert_eq!(json["isSystem"], false);
    }

    #[tokio::test]
    async fn test_guest_message_seen_once_everywhere() {
        let (host, a, b) = star().await;
        let mut host_rx = host.take_messages().unwrap();
        let mut a_rx = a.take_messages().unwrap();
        let mut b_rx = b.take_messages().unwrap();

        let sent = a.send_local(MessageKind::Text, "hello").await.unwrap();

        let at_host = user_messages(&mut host_rx).await;
        let at_b = user_messages(&mut b_rx).await;
        let at_a = user_messages(&mut a_rx).await;

        assert_eq!(at_host, vec![sent.clone()]);
        assert_eq!(at_b, vec![sent.clone()]);
        // 로컬 적용 한 번, 되돌아오지 않음
        assert_eq!(at_a, vec![sent]);
    }

    #[tokio::test]
    async fn test_large_message_relayed_as_fragments() {
        let (host, a, b) = star().await;
        let mut host_rx = host.take_messages().unwrap();
        let mut b_rx = b.take_messages().unwrap();

        let sent = a
            .send_local(MessageKind::Image, "x".repeat(4000))
            .await
            .unwrap();

        assert_eq!(user_messages(&mut host_rx).await, vec![sent.clone()]);
        assert_eq!(user_messages(&mut b_rx).await, vec![sent]);
    }

    #[tokio::test]
    async fn test_presence_notices() {
        let (host, a, b) = star().await;
        let mut a_rx = a.take_messages().unwrap();
        let mut host_rx = host.take_messages().unwrap();

        b.clear();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut notices = Vec::new();
        while let Ok(message) = a_rx.try_recv() {
            if message.is_system {
                notices.push(message.content);
            }
        }
        // B 입장 알림은 A가 이미 연결된 뒤라 받음
        assert_eq!(notices, vec!["guest-b joined", "guest-b left"]);

        let mut host_notices = 0;
        while let Ok(message) = host_rx.try_recv() {
            if message.is_system {
                host_notices += 1;
            }
        }
        assert_eq!(host_notices, 3);
        assert_eq!(host.peer_count(), 1);
    }

    /// 호스트 + 원시 채널로 붙은 게스트 B (B가 받은 프레임을 그대로 관찰)
    async fn host_with_raw_guest() -> (Arc<ChatRelay>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let host = Arc::new(ChatRelay::new(&config(), ChatRole::Host, "host"));
        let ((host_end, _host_events), (_guest_end, guest_events)) =
            LoopbackChannel::pair("host", "guest-b", LoopbackOptions::unlimited());
        host.add_peer(host_end).await.unwrap();
        (host, guest_events)
    }

    async fn relayed_frames(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ControlMessage> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ChannelEvent::Data(Frame::Control(message)) = event {
                out.push(message);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applied_and_relayed_once() {
        let (host, mut b_events) = host_with_raw_guest().await;
        let mut host_rx = host.take_messages().unwrap();
        let message = ChatMessage::text("guest-a", "hello");
        let inbound = ControlMessage::ChatMessage(message.clone());

        let (first, second) = tokio::join!(
            host.handle_inbound("guest-a", inbound.clone()),
            host.handle_inbound("guest-a", inbound.clone()),
        );
        first.unwrap();
        second.unwrap();
        // 재연결 후 같은 메시지 재전달
        host.handle_inbound("guest-a", inbound.clone()).await.unwrap();

        assert_eq!(user_messages(&mut host_rx).await, vec![message]);
        assert_eq!(relayed_frames(&mut b_events).await, vec![inbound]);
    }

    #[tokio::test]
    async fn test_duplicate_fragment_relayed_once() {
        let (host, mut b_events) = host_with_raw_guest().await;
        let fragment = ChunkedChatPayload {
            message_id: "m-frag".into(),
            index: 0,
            total: 2,
            fragment: "{".into(),
        };

        for _ in 0..3 {
            host.handle_inbound("guest-a", ControlMessage::ChatMessageChunk(fragment.clone()))
                .await
                .unwrap();
        }

        assert_eq!(
            relayed_frames(&mut b_events).await,
            vec![ControlMessage::ChatMessageChunk(fragment)]
        );
    }
}
