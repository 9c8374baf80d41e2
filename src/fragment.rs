//! 채팅 메시지 조각화 / 재조립
//!
//! 직렬화된 채팅 메시지가 안전한 단일 프레임 크기를 넘으면
//! `{message_id, index, total}` 태그를 단 문자열 조각으로 나눠 보냄.
//! 파일용 바이너리 청크 송신기와는 독립적.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::chat::ChatMessage;
use crate::message::{ControlMessage, Frame};
use crate::{Config, Error, Result};

/// 채팅 메시지 조각
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedChatPayload {
    pub message_id: String,
    pub index: u32,
    pub total: u32,
    pub fragment: String,
}

/// 메시지 조각기
#[derive(Debug, Clone, Copy)]
pub struct MessageChunker {
    /// 이 크기 이하면 조각 없이 전송
    safe_frame_size: usize,
    fragment_size: usize,

    /// 조각 N개마다 양보
    yield_every: usize,

    /// 이보다 큰 메시지는 보내지 않음
    max_message_size: usize,
}

impl MessageChunker {
    pub fn new(safe_frame_size: usize, fragment_size: usize, yield_every: usize) -> Self {
        Self {
            safe_frame_size,
            fragment_size: fragment_size.max(4),
            yield_every,
            max_message_size: usize::MAX,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_message_size: config.max_chat_message_size,
            ..Self::new(
                config.chat_safe_frame_size,
                config.chat_fragment_size,
                config.chat_yield_every,
            )
        }
    }

    /// 메시지를 전송할 컨트롤 메시지 목록으로 변환
    pub fn encode(&self, message: &ChatMessage) -> Result<Vec<ControlMessage>> {
        let serialized = serde_json::to_string(message)?;
        if serialized.len() > self.max_message_size {
            return Err(Error::InvalidFragment {
                message_id: message.id.clone(),
                reason: format!(
                    "메시지 크기 {} > 최대 {}",
                    serialized.len(),
                    self.max_message_size
                ),
            });
        }
        if serialized.len() <= self.safe_frame_size {
            return Ok(vec![ControlMessage::ChatMessage(message.clone())]);
        }

        let fragments = self.split(&message.id, &serialized);
        debug!(
            message_id = %message.id,
            bytes = serialized.len(),
            fragments = fragments.len(),
            "채팅 메시지 조각화"
        );
        Ok(fragments
            .into_iter()
            .map(ControlMessage::ChatMessageChunk)
            .collect())
    }

    /// 문자 경계를 지키며 `fragment_size` 바이트 이하로 분할
    pub fn split(&self, message_id: &str, serialized: &str) -> Vec<ChunkedChatPayload> {
        let mut pieces = Vec::new();
        let mut start = 0;

        while start < serialized.len() {
            let mut end = (start + self.fragment_size).min(serialized.len());
            while !serialized.is_char_boundary(end) {
                end -= 1;
            }
            pieces.push(&serialized[start..end]);
            start = end;
        }

        let total = pieces.len() as u32;
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, fragment)| ChunkedChatPayload {
                message_id: message_id.to_string(),
                index: index as u32,
                total,
                fragment: fragment.to_string(),
            })
            .collect()
    }

    /// 컨트롤 메시지들을 채널로 전송, 조각 사이사이 양보
    pub async fn send_all(&self, channel: &dyn Channel, messages: &[ControlMessage]) -> Result<()> {
        for (sent, message) in messages.iter().enumerate() {
            channel.send(Frame::Control(message.clone()))?;
            if self.yield_every > 0 && (sent + 1) % self.yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }
}

/// message_id 하나의 재조립 버퍼
#[derive(Debug)]
struct ReassemblyBuffer {
    parts: Vec<Option<String>>,
    received: u32,
    bytes: usize,
}

/// 최근 본 메시지 ID 집합 (용량을 넘으면 오래된 것부터 제거)
#[derive(Debug)]
pub(crate) struct RecentIds {
    set: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// 새로 추가했으면 true
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub(crate) fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

/// 조각 재조립기
///
/// 중복 인덱스는 무시하고, 이미 완성된 메시지의 늦은 조각도 무시함.
/// 조각 수와 누적 크기는 최대 메시지 크기로 제한하고, 진행 중 버퍼가
/// 너무 많으면 가장 오래된 것부터 폐기
#[derive(Debug)]
pub struct Reassembler {
    buffers: HashMap<String, ReassemblyBuffer>,

    /// 진행 중 버퍼의 생성 순서
    order: VecDeque<String>,

    /// 최근 완성된 ID
    completed: RecentIds,

    max_fragments: u32,
    max_message_size: usize,
    max_pending: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Reassembler {
    pub fn from_config(config: &Config) -> Self {
        // 문자 경계 때문에 조각이 최대 3바이트 짧을 수 있음
        let fragment = config.chat_fragment_size.max(4) - 3;
        let max_fragments = config.max_chat_message_size.div_ceil(fragment);

        Self {
            buffers: HashMap::new(),
            order: VecDeque::new(),
            completed: RecentIds::new(config.dedup_capacity),
            max_fragments: u32::try_from(max_fragments).unwrap_or(u32::MAX),
            max_message_size: config.max_chat_message_size,
            max_pending: config.max_pending_reassemblies.max(1),
        }
    }

    /// 진행 중인 버퍼 수
    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    /// 이 조각이 이미 반영된 것인지 (완성된 메시지거나 같은 인덱스 보유)
    pub fn has_fragment(&self, message_id: &str, index: u32) -> bool {
        if self.completed.contains(message_id) {
            return true;
        }
        self.buffers
            .get(message_id)
            .and_then(|buffer| buffer.parts.get(index as usize))
            .is_some_and(|slot| slot.is_some())
    }

    /// 조각 하나 적재, 완성되면 메시지 반환
    pub fn push(&mut self, payload: ChunkedChatPayload) -> Result<Option<ChatMessage>> {
        let ChunkedChatPayload {
            message_id,
            index,
            total,
            fragment,
        } = payload;

        if total == 0 || index >= total {
            return Err(Error::InvalidFragment {
                message_id,
                reason: format!("index {} / total {}", index, total),
            });
        }
        if total > self.max_fragments {
            return Err(Error::InvalidFragment {
                message_id,
                reason: format!("조각 수 {} > 최대 {}", total, self.max_fragments),
            });
        }
        if self.completed.contains(&message_id) {
            trace!(%message_id, index, "완성된 메시지의 늦은 조각 무시");
            return Ok(None);
        }

        if !self.buffers.contains_key(&message_id) {
            while self.buffers.len() >= self.max_pending {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.buffers.remove(&oldest);
                debug!(message_id = %oldest, "오래된 미완성 메시지 폐기");
            }
            self.buffers.insert(
                message_id.clone(),
                ReassemblyBuffer {
                    parts: vec![None; total as usize],
                    received: 0,
                    bytes: 0,
                },
            );
            self.order.push_back(message_id.clone());
        }

        let Some(buffer) = self.buffers.get_mut(&message_id) else {
            return Ok(None);
        };

        if buffer.parts.len() != total as usize {
            return Err(Error::InvalidFragment {
                reason: format!("total 불일치: {} != {}", total, buffer.parts.len()),
                message_id,
            });
        }

        if buffer.parts[index as usize].is_some() {
            return Ok(None);
        }

        let bytes = buffer.bytes + fragment.len();
        if bytes > self.max_message_size {
            self.forget(&message_id);
            return Err(Error::InvalidFragment {
                reason: format!("누적 크기 {} > 최대 {}", bytes, self.max_message_size),
                message_id,
            });
        }

        buffer.parts[index as usize] = Some(fragment);
        buffer.bytes = bytes;
        buffer.received += 1;

        if buffer.received < total {
            return Ok(None);
        }

        let Some(buffer) = self.forget(&message_id) else {
            return Ok(None);
        };
        let serialized: String = buffer.parts.into_iter().flatten().collect();
        self.completed.insert(&message_id);

        let message: ChatMessage = serde_json::from_str(&serialized)?;
        Ok(Some(message))
    }

    fn forget(&mut self, message_id: &str) -> Option<ReassemblyBuffer> {
        self.order.retain(|id| id != message_id);
        self.buffers.remove(message_id)
    }

    /// 세션 해체 시 모든 버퍼 폐기
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.order.clear();
        self.completed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageKind;

    fn big_message(id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            sender_id: "guest-a".to_string(),
            kind: MessageKind::Image,
            content: "가나다라마바사".repeat(200),
            timestamp: 1_700_000_000_000,
            is_system: false,
        }
    }

    fn payloads(messages: Vec<ControlMessage>) -> Vec<ChunkedChatPayload> {
        messages
            .into_iter()
            .filter_map(|m| match m {
                ControlMessage::ChatMessageChunk(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_small_message_is_not_fragmented() {
        let chunker = MessageChunker::new(16 * 1024, 1024, 1);
        let message = ChatMessage {
            content: "hi".into(),
            ..big_message("m1")
        };

        let encoded = chunker.encode(&message).unwrap();
        assert_eq!(encoded, vec![ControlMessage::ChatMessage(message)]);
    }

    #[test]
    fn test_split_respects_char_boundaries() {
        let chunker = MessageChunker::new(64, 10, 1);
        let parts = chunker.split("m", "가나다라마바사아");

        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.fragment.len() <= 10));
        let joined: String = parts.iter().map(|p| p.fragment.as_str()).collect();
        assert_eq!(joined, "가나다라마바사아");
    }

    #[test]
    fn test_any_order_with_duplicates_delivers_once() {
        let chunker = MessageChunker::new(256, 300, 1);
        let message = big_message("m2");
        let mut parts = payloads(chunker.encode(&message).unwrap());
        assert!(parts.len() >= 3);

        // 역순 + 중복 + 완성 후 늦은 중복
        parts.reverse();
        let mut delivery = Vec::new();
        for part in &parts {
            delivery.push(part.clone());
            delivery.push(part.clone());
        }
        delivery.push(parts[0].clone());

        let mut reassembler = Reassembler::default();
        let mut delivered = Vec::new();
        for part in delivery {
            if let Some(msg) = reassembler.push(part).unwrap() {
                delivered.push(msg);
            }
        }

        assert_eq!(delivered, vec![message]);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_invalid_fragment() {
        let mut reassembler = Reassembler::default();
        let bad = ChunkedChatPayload {
            message_id: "x".into(),
            index: 3,
            total: 3,
            fragment: String::new(),
        };
        assert!(matches!(
            reassembler.push(bad),
            Err(Error::InvalidFragment { .. })
        ));
    }

    #[test]
    fn test_fragment_count_is_bounded() {
        let config = Config {
            chat_fragment_size: 1024,
            max_chat_message_size: 64 * 1024,
            ..Config::default()
        };
        let mut reassembler = Reassembler::from_config(&config);

        let result = reassembler.push(ChunkedChatPayload {
            message_id: "huge".into(),
            index: 0,
            total: 20_000_000,
            fragment: "x".into(),
        });
        assert!(matches!(result, Err(Error::InvalidFragment { .. })));
        assert_eq!(reassembler.pending(), 0);

        // 조각 수는 맞지만 누적 크기가 넘침
        let big = "x".repeat(40 * 1024);
        assert!(reassembler
            .push(ChunkedChatPayload {
                message_id: "wide".into(),
                index: 0,
                total: 2,
                fragment: big.clone(),
            })
            .unwrap()
            .is_none());
        let result = reassembler.push(ChunkedChatPayload {
            message_id: "wide".into(),
            index: 1,
            total: 2,
            fragment: big,
        });
        assert!(matches!(result, Err(Error::InvalidFragment { .. })));
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_stale_buffers_are_evicted() {
        let config = Config {
            max_pending_reassemblies: 2,
            ..Config::default()
        };
        let mut reassembler = Reassembler::from_config(&config);

        for id in ["m1", "m2", "m3"] {
            reassembler
                .push(ChunkedChatPayload {
                    message_id: id.into(),
                    index: 0,
                    total: 2,
                    fragment: "{".into(),
                })
                .unwrap();
        }
        assert_eq!(reassembler.pending(), 2);
        assert!(!reassembler.has_fragment("m1", 0));
        assert!(reassembler.has_fragment("m3", 0));
        assert!(!reassembler.has_fragment("m3", 1));
    }
}
