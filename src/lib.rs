//! # PeerDrop
//!
//! 순서 보장 데이터 채널 위의 P2P 파일 전송 / 채팅 릴레이 엔진
//!
//! ## 핵심 특징
//! - **고정 크기 프레임**: 파일을 64KB 바이너리 프레임으로 분할, 위치 기반 오프셋
//! - **백프레셔**: 채널 미전송 바이트 기반 이벤트 구동 흐름 제어
//! - **이어받기**: 수신측이 보유한 오프셋부터 재전송 (RESUME_REQUEST)
//! - **멀티 피어 팬아웃**: 피어별 독립 송신 루프, 서로 블로킹하지 않음
//! - **에포크 취소**: 세션 세대 카운터로 오래된 루프 무효화
//! - **채팅 릴레이**: 스타 토폴로지 브로드캐스트 + 대용량 메시지 조각화/재조립

pub mod channel;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod epoch;
pub mod error;
pub mod fanout;
pub mod flow;
pub mod fragment;
pub mod loopback;
pub mod manifest;
pub mod message;
pub mod receiver;
pub mod retry;
pub mod sender;
pub mod sink;
pub mod source;
pub mod stats;

pub use channel::{BufferState, Channel, ChannelEvent, PeerId};
pub use chat::{ChatMessage, ChatRelay, ChatRole, MessageKind};
pub use chunk::ChunkedByteSender;
pub use config::Config;
pub use epoch::{EpochGuard, SessionEpoch};
pub use error::{Error, Result};
pub use fanout::PeerFanoutManager;
pub use flow::FlowController;
pub use fragment::{ChunkedChatPayload, MessageChunker, Reassembler};
pub use loopback::LoopbackChannel;
pub use manifest::{FileEntry, FileManifest, TransferConstraints};
pub use message::{ControlMessage, Frame, MessageType};
pub use receiver::{FileStatus, ReceiverEvent, ReceiverSession, ReceiverState, ResumePoint};
pub use retry::{rejoin_loop, RetryPolicy};
pub use sender::{PeerEvent, PerPeerTransferState, SenderSession, SenderState, StartPoint};
pub use sink::{DirectorySinkFactory, FileSink, MemorySinkFactory, SinkFactory};
pub use source::{FileSource, MemorySource, PathSource};
pub use stats::{GlobalProgress, PeerProgress, ThroughputMeter};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 프레임 크기 (바이트)
pub const DEFAULT_FRAME_SIZE: usize = 64 * 1024; // 64KB

/// 기본 파일 읽기 배치 크기 (바이트)
pub const DEFAULT_READ_BATCH_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// 기본 high-water mark (바이트)
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// 단일 프레임으로 안전하게 보낼 수 있는 채팅 직렬화 크기
pub const DEFAULT_CHAT_SAFE_FRAME_SIZE: usize = 16 * 1024;
