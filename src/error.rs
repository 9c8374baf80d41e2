//! 에러 타입 정의

use thiserror::Error;

/// PeerDrop 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    /// 단일 파일만 실패시키고 다른 파일/피어에는 영향 없음
    #[error("프로토콜 위반: file_index={file_index:?}, {reason}")]
    ProtocolViolation {
        file_index: Option<usize>,
        reason: String,
    },

    #[error("채널 종료")]
    ChannelClosed,

    #[error("식별자 충돌: {0} 이미 등록됨")]
    IdentityConflict(String),

    #[error("세션 만료")]
    SessionExpired,

    #[error("전송 취소")]
    Cancelled,

    #[error("전송 거부: {0}")]
    Rejected(String),

    #[error("유효하지 않은 조각: message_id={message_id}, {reason}")]
    InvalidFragment { message_id: String, reason: String },

    #[error("유효하지 않은 파일 인덱스: {index} (파일 수 {len})")]
    InvalidFileIndex { index: usize, len: usize },

    #[error("유효하지 않은 상태: {0}")]
    InvalidState(String),

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// 프로토콜 위반 에러 생성
    pub fn violation(file_index: Option<usize>, reason: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            file_index,
            reason: reason.into(),
        }
    }

    /// 재시도 또는 이어받기로 복구 가능한 에러인지
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ChannelClosed | Error::IdentityConflict(_))
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
