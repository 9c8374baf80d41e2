//! 채널 추상화
//!
//! 연결 수립(시그널링, NAT 통과)은 외부 계층의 몫이고,
//! 엔진은 열린 채널의 다음 능력만 사용함:
//! - 순서 보장, 신뢰성 있는 개별 메시지 전달
//! - 미전송 바이트 수 조회 및 변화 구독
//! - 열림/닫힘 이벤트

use tokio::sync::watch;

use crate::message::Frame;
use crate::Result;

/// 피어 식별자
pub type PeerId = String;

/// 채널 송신 버퍼 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferState {
    /// 아직 전송되지 않은 바이트 수
    pub outstanding: usize,

    /// 채널 열림 여부
    pub open: bool,
}

impl BufferState {
    pub fn open(outstanding: usize) -> Self {
        Self {
            outstanding,
            open: true,
        }
    }

    pub fn closed() -> Self {
        Self {
            outstanding: 0,
            open: false,
        }
    }
}

/// 채널에서 올라오는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Data(Frame),
    Closed,
    Error(String),
}

/// 순서 보장 메시지 채널
///
/// `send`는 프레임을 큐에 넣고 즉시 반환함. 실제 전달 속도는
/// `outstanding_bytes`와 `watch_buffer`로 관찰함.
pub trait Channel: Send + Sync + 'static {
    /// 상대 피어 ID
    fn peer_id(&self) -> &str;

    /// 열림 여부
    fn is_open(&self) -> bool;

    /// 프레임 전송 (채널이 닫혔으면 `Error::ChannelClosed`)
    fn send(&self, frame: Frame) -> Result<()>;

    /// 미전송 바이트 수
    fn outstanding_bytes(&self) -> usize;

    /// 버퍼 상태 구독
    ///
    /// 미전송 바이트가 줄어들거나 채널이 닫힐 때마다 갱신되어야 함
    fn watch_buffer(&self) -> watch::Receiver<BufferState>;

    /// 채널 종료
    fn close(&self);
}
