//! 인메모리 루프백 채널
//!
//! 테스트와 데모 바이너리용 `Channel` 구현.
//! 방향별 펌프 태스크가 큐에서 프레임을 꺼내 상대편 이벤트로 전달하고,
//! 전달 후에 미전송 바이트를 줄임. 배출 속도를 제한하면 느린 링크를 흉내냄.
//! 컨트롤 메시지는 와이어 포맷(헤더 + bincode)으로 인코딩해서 보내고 받는 쪽에서 디코딩.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::channel::{BufferState, Channel, ChannelEvent, PeerId};
use crate::message::{ControlMessage, Frame};
use crate::{Error, Result};

/// 채널 이벤트 수신기 타입
pub type EventReceiver = mpsc::UnboundedReceiver<ChannelEvent>;

/// 루프백 링크 옵션
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackOptions {
    /// 방향별 배출 속도 (bytes/sec, None이면 제한 없음)
    pub bytes_per_sec: Option<u64>,
}

impl LoopbackOptions {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn throttled(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: Some(bytes_per_sec),
        }
    }
}

/// 링크 위를 흐르는 바이트
enum Wire {
    Control(Vec<u8>),
    Binary(Bytes),
}

impl Wire {
    fn encode(frame: Frame) -> Result<Self> {
        Ok(match frame {
            Frame::Control(msg) => Wire::Control(msg.to_bytes()?),
            Frame::Binary(data) => Wire::Binary(data),
        })
    }

    fn len(&self) -> usize {
        match self {
            Wire::Control(bytes) => bytes.len(),
            Wire::Binary(data) => data.len(),
        }
    }

    fn decode(self) -> Result<Frame> {
        match self {
            Wire::Control(bytes) => Ok(Frame::Control(ControlMessage::from_bytes(&bytes)?)),
            Wire::Binary(data) => Ok(Frame::Binary(data)),
        }
    }
}

/// 양쪽 끝이 공유하는 링크 상태
struct Link {
    open: AtomicBool,
    events: [mpsc::UnboundedSender<ChannelEvent>; 2],
    buffers: [watch::Sender<BufferState>; 2],
}

impl Link {
    fn shutdown(&self) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        for (events, buffer) in self.events.iter().zip(self.buffers.iter()) {
            buffer.send_replace(BufferState::closed());
            let _ = events.send(ChannelEvent::Closed);
        }
        true
    }
}

/// 루프백 채널의 한쪽 끝
pub struct LoopbackChannel {
    local_id: PeerId,
    peer_id: PeerId,
    side: usize,
    link: Arc<Link>,
    queue_tx: mpsc::UnboundedSender<Wire>,
}

impl LoopbackChannel {
    /// 연결된 채널 쌍 생성
    ///
    /// tokio 런타임 안에서 호출해야 함 (펌프 태스크 생성)
    pub fn pair(
        a: impl Into<PeerId>,
        b: impl Into<PeerId>,
        options: LoopbackOptions,
    ) -> ((Arc<Self>, EventReceiver), (Arc<Self>, EventReceiver)) {
        let a = a.into();
        let b = b.into();

        let (events_a_tx, events_a_rx) = mpsc::unbounded_channel();
        let (events_b_tx, events_b_rx) = mpsc::unbounded_channel();
        let (buffer_a, _) = watch::channel(BufferState::open(0));
        let (buffer_b, _) = watch::channel(BufferState::open(0));

        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            events: [events_a_tx, events_b_tx],
            buffers: [buffer_a, buffer_b],
        });

        // 열림 이벤트
        for events in link.events.iter() {
            let _ = events.send(ChannelEvent::Open);
        }

        let (queue_a_tx, queue_a_rx) = mpsc::unbounded_channel();
        let (queue_b_tx, queue_b_rx) = mpsc::unbounded_channel();

        // a -> b, b -> a
        tokio::spawn(pump(link.clone(), 0, 1, queue_a_rx, options));
        tokio::spawn(pump(link.clone(), 1, 0, queue_b_rx, options));

        let end_a = Arc::new(Self {
            local_id: a.clone(),
            peer_id: b.clone(),
            side: 0,
            link: link.clone(),
            queue_tx: queue_a_tx,
        });
        let end_b = Arc::new(Self {
            local_id: b,
            peer_id: a,
            side: 1,
            link,
            queue_tx: queue_b_tx,
        });

        ((end_a, events_a_rx), (end_b, events_b_rx))
    }

    /// 로컬 피어 ID
    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl Channel for LoopbackChannel {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let wire = Wire::encode(frame)?;
        let len = wire.len();
        self.link.buffers[self.side].send_modify(|state| state.outstanding += len);
        self.queue_tx.send(wire).map_err(|_| Error::ChannelClosed)
    }

    fn outstanding_bytes(&self) -> usize {
        self.link.buffers[self.side].borrow().outstanding
    }

    fn watch_buffer(&self) -> watch::Receiver<BufferState> {
        self.link.buffers[self.side].subscribe()
    }

    fn close(&self) {
        if self.link.shutdown() {
            debug!("루프백 채널 종료: {} <-> {}", self.local_id, self.peer_id);
        }
    }
}

/// 한 방향 펌프
async fn pump(
    link: Arc<Link>,
    from: usize,
    to: usize,
    mut queue_rx: mpsc::UnboundedReceiver<Wire>,
    options: LoopbackOptions,
) {
    while let Some(wire) = queue_rx.recv().await {
        let len = wire.len();

        if let Some(rate) = options.bytes_per_sec.filter(|r| *r > 0) {
            let secs = len as f64 / rate as f64;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        }

        // 닫힌 링크의 잔여 프레임은 버림
        if !link.open.load(Ordering::SeqCst) {
            continue;
        }

        let event = match wire.decode() {
            Ok(frame) => ChannelEvent::Data(frame),
            Err(e) => {
                warn!("루프백 프레임 디코딩 실패: {}", e);
                ChannelEvent::Error(e.to_string())
            }
        };
        let _ = link.events[to].send(event);
        link.buffers[from].send_modify(|state| {
            if state.open {
                state.outstanding = state.outstanding.saturating_sub(len);
            }
        });
    }
}
