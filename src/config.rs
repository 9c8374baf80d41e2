//! 엔진 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_CHAT_SAFE_FRAME_SIZE, DEFAULT_FRAME_SIZE, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_READ_BATCH_SIZE,
};

/// PeerDrop 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바이너리 프레임 크기 (바이트)
    pub frame_size: usize,

    /// 파일 읽기 배치 크기 (바이트)
    /// 프레임 크기의 배수가 아니어도 됨
    pub read_batch_size: usize,

    /// 미전송 바이트가 이 값을 넘으면 송신 중단
    pub high_water_mark: usize,

    /// 미전송 바이트가 이 값 이하로 떨어지면 송신 재개
    pub low_water_mark: usize,

    /// 처리율 샘플링 주기 (밀리초)
    pub sample_interval_ms: u64,

    /// 만료 카운트다운 주기 (밀리초)
    pub expiry_tick_ms: u64,

    /// 거부 메시지 전송 후 연결 종료까지 대기 (밀리초)
    pub reject_close_delay_ms: u64,

    /// 채팅 메시지를 조각 없이 보낼 수 있는 최대 직렬화 크기
    pub chat_safe_frame_size: usize,

    /// 채팅 조각 크기 (바이트)
    pub chat_fragment_size: usize,

    /// 조각 N개마다 양보 (0이면 양보 없음)
    pub chat_yield_every: usize,

    /// 직렬화된 채팅 메시지 최대 크기 (재조립 상한)
    pub max_chat_message_size: usize,

    /// 동시에 재조립 중인 메시지 최대 수 (넘으면 오래된 것부터 폐기)
    pub max_pending_reassemblies: usize,

    /// 게스트 재입장 간격 (밀리초)
    pub rejoin_delay_ms: u64,

    /// 호스트 식별자 등록 최대 시도 횟수
    pub identity_retry_attempts: u32,

    /// 식별자 등록 재시도 간격 (밀리초)
    pub identity_retry_backoff_ms: u64,

    /// 메타데이터 수신 즉시 자동 수락
    pub auto_accept: bool,

    /// 채팅 중복 제거용 완료 ID 보관 수
    pub dedup_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_HIGH_WATER_MARK,
            sample_interval_ms: 500,           // 500ms
            expiry_tick_ms: 1000,              // 1초
            reject_close_delay_ms: 500,
            chat_safe_frame_size: DEFAULT_CHAT_SAFE_FRAME_SIZE,
            chat_fragment_size: 12 * 1024,     // 12KB
            chat_yield_every: 1,
            max_chat_message_size: 16 * 1024 * 1024, // 16MB
            max_pending_reassemblies: 64,
            rejoin_delay_ms: 3000,             // 3초
            identity_retry_attempts: 5,
            identity_retry_backoff_ms: 2000,   // 2초
            auto_accept: false,
            dedup_capacity: 4096,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 저지연 설정 (작은 버퍼, 짧은 샘플 주기)
    pub fn low_latency() -> Self {
        Self {
            frame_size: 16 * 1024,
            read_batch_size: 1024 * 1024,      // 1MB
            high_water_mark: 32 * 1024,
            low_water_mark: 16 * 1024,
            sample_interval_ms: 250,
            ..Self::default()
        }
    }

    /// 고대역폭 로컬 링크용 설정
    pub fn high_throughput() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            read_batch_size: 32 * 1024 * 1024, // 32MB
            high_water_mark: 1024 * 1024,      // 1MB
            low_water_mark: 256 * 1024,
            ..Self::default()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(Error::InvalidConfig("frame_size는 0일 수 없음".into()));
        }
        if self.read_batch_size < self.frame_size {
            return Err(Error::InvalidConfig(
                "read_batch_size는 frame_size 이상이어야 함".into(),
            ));
        }
        if self.low_water_mark > self.high_water_mark {
            return Err(Error::InvalidConfig(
                "low_water_mark는 high_water_mark 이하여야 함".into(),
            ));
        }
        if self.chat_fragment_size == 0 {
            return Err(Error::InvalidConfig("chat_fragment_size는 0일 수 없음".into()));
        }
        if self.max_chat_message_size == 0 {
            return Err(Error::InvalidConfig("max_chat_message_size는 0일 수 없음".into()));
        }
        Ok(())
    }

    /// 바이트 오프셋을 프레임 인덱스로 변환 (나머지는 버림)
    pub fn frame_index(&self, offset: u64) -> u64 {
        offset / self.frame_size.max(1) as u64
    }

    /// 프레임 인덱스를 바이트 오프셋으로 변환, 넘치면 None
    pub fn frame_offset(&self, frame_index: u64) -> Option<u64> {
        frame_index.checked_mul(self.frame_size as u64)
    }

    /// 오프셋을 직전 프레임 경계로 내림
    pub fn align_to_frame(&self, offset: u64) -> u64 {
        let frame = self.frame_size.max(1) as u64;
        offset - offset % frame
    }

    /// 파일 크기에 필요한 프레임 수
    pub fn frames_for(&self, size: u64) -> u64 {
        size.div_ceil(self.frame_size.max(1) as u64)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn expiry_tick(&self) -> Duration {
        Duration::from_millis(self.expiry_tick_ms)
    }

    pub fn reject_close_delay(&self) -> Duration {
        Duration::from_millis(self.reject_close_delay_ms)
    }

    pub fn rejoin_delay(&self) -> Duration {
        Duration::from_millis(self.rejoin_delay_ms)
    }
}
