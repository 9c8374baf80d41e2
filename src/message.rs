//! 프로토콜 메시지 정의
//!
//! 채널 위로는 두 종류의 프레임만 흐름:
//! - 컨트롤 메시지 (타입 있는 객체)
//! - 바이너리 프레임 (봉투 없는 원시 바이트, 오프셋은 수신 위치로 추론)

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::fragment::ChunkedChatPayload;
use crate::manifest::FileManifest;
use crate::{Error, Result, PROTOCOL_VERSION};

/// 컨트롤 메시지 매직 넘버 (패킷 식별용)
pub const CONTROL_MAGIC: u32 = 0x50445250; // "PDRP"

/// 메시지 타입 (와이어 식별자)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// 매니페스트 공지
    Metadata = 1,

    /// 파일 시작
    FileStart = 2,

    /// 파일 완료
    FileComplete = 3,

    /// 모든 파일 완료
    AllFilesComplete = 4,

    /// 전송 수락 (수신 → 송신)
    AcceptTransfer = 5,

    /// 전송 거부 (송신 → 수신)
    RejectTransfer = 6,

    /// 이어받기 요청 (수신 → 송신)
    ResumeRequest = 7,

    /// 전송 취소
    TransferCancelled = 8,

    /// 채팅 메시지
    ChatMessage = 9,

    /// 채팅 메시지 조각
    ChatMessageChunk = 10,
}

/// 메시지 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: CONTROL_MAGIC,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }
}

/// 컨트롤 메시지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    Metadata {
        manifest: FileManifest,
        total_size: u64,
        /// 세션 식별용 매니페스트 지문
        fingerprint: u32,
        frame_size: u32,
    },
    FileStart {
        file_index: usize,
        name: String,
        size: u64,
        mime_type: String,
    },
    FileComplete {
        file_index: usize,
    },
    AllFilesComplete,
    AcceptTransfer,
    RejectTransfer {
        reason: String,
    },
    /// 수신측이 이미 보유한 프레임 수 기준 이어받기
    ResumeRequest {
        file_index: usize,
        chunk_index: u64,
    },
    TransferCancelled,
    ChatMessage(ChatMessage),
    ChatMessageChunk(ChunkedChatPayload),
}

impl ControlMessage {
    /// 메타데이터 메시지 생성
    pub fn metadata(manifest: &FileManifest, frame_size: usize) -> Self {
        ControlMessage::Metadata {
            total_size: manifest.total_size(),
            fingerprint: manifest.fingerprint(),
            frame_size: frame_size as u32,
            manifest: manifest.clone(),
        }
    }

    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            ControlMessage::Metadata { .. } => MessageType::Metadata,
            ControlMessage::FileStart { .. } => MessageType::FileStart,
            ControlMessage::FileComplete { .. } => MessageType::FileComplete,
            ControlMessage::AllFilesComplete => MessageType::AllFilesComplete,
            ControlMessage::AcceptTransfer => MessageType::AcceptTransfer,
            ControlMessage::RejectTransfer { .. } => MessageType::RejectTransfer,
            ControlMessage::ResumeRequest { .. } => MessageType::ResumeRequest,
            ControlMessage::TransferCancelled => MessageType::TransferCancelled,
            ControlMessage::ChatMessage(_) => MessageType::ChatMessage,
            ControlMessage::ChatMessageChunk(_) => MessageType::ChatMessageChunk,
        }
    }

    /// 바이트로 직렬화 (헤더 + 페이로드)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let header = MessageHeader::new(self.msg_type(), payload.len() as u32);
        let header_bytes = bincode::serialize(&header)?;

        let mut buf = Vec::with_capacity(header_bytes.len() + payload.len());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: MessageHeader = bincode::deserialize(bytes)?;
        if header.magic != CONTROL_MAGIC {
            return Err(Error::violation(
                None,
                format!("잘못된 매직 넘버: {:08X}", header.magic),
            ));
        }
        if header.version != PROTOCOL_VERSION {
            return Err(Error::violation(
                None,
                format!("지원하지 않는 프로토콜 버전: {}", header.version),
            ));
        }

        // bincode 헤더는 고정 길이
        let header_size = bincode::serialized_size(&header)? as usize;
        let end = header_size + header.payload_len as usize;
        if bytes.len() < end {
            return Err(Error::violation(None, "페이로드 길이 부족"));
        }

        let message: ControlMessage = bincode::deserialize(&bytes[header_size..end])?;
        if message.msg_type() != header.msg_type {
            return Err(Error::violation(
                None,
                format!(
                    "메시지 타입 불일치: header={:?}, payload={:?}",
                    header.msg_type,
                    message.msg_type()
                ),
            ));
        }
        Ok(message)
    }
}

/// 채널 프레임
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Binary(Bytes),
}

impl Frame {
    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::Control(msg)
    }
}

impl From<Bytes> for Frame {
    fn from(data: Bytes) -> Self {
        Frame::Binary(data)
    }
}
