//! 재연결 / 식별자 등록 재시도
//!
//! 랑데부 서비스는 외부 계층이므로 실제 등록/입장 동작은 클로저로 받음.
//! - 호스트: 식별자가 이미 등록된 경우에만 고정 간격으로 제한 횟수 재시도
//! - 게스트: 세션이 활성 상태인 동안 연결이 끊기면 고정 간격으로 재입장

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::{Config, Error, Result};

/// 고정 간격 재시도 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// 호스트 식별자 등록용
    pub fn identity(config: &Config) -> Self {
        Self::new(
            config.identity_retry_attempts,
            Duration::from_millis(config.identity_retry_backoff_ms),
        )
    }

    /// 식별자 등록 (충돌 시에만 재시도)
    ///
    /// 마지막 시도까지 충돌하면 `Error::IdentityConflict` 그대로 반환
    pub async fn register_with_retry<T, F, Fut>(&self, mut register: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match register(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "식별자 등록 성공");
                    }
                    return Ok(value);
                }
                Err(Error::IdentityConflict(id)) if attempt < self.max_attempts => {
                    warn!(
                        %id,
                        attempt,
                        max_attempts = self.max_attempts,
                        "식별자 충돌, {}ms 후 재시도",
                        self.delay.as_millis()
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 게스트 재입장 루프
///
/// `join`은 연결이 끊길 때까지 진행하다 반환함. `active`가 true인 동안
/// 복구 가능한 종료라면 `delay` 후 다시 입장. 복구 불가능한 에러는 그대로 반환.
pub async fn rejoin_loop<F, Fut>(
    delay: Duration,
    mut active: watch::Receiver<bool>,
    mut join: F,
) -> Result<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0;
    loop {
        if !*active.borrow() {
            return Ok(attempt);
        }

        attempt += 1;
        match join(attempt).await {
            Ok(()) => info!(attempt, "호스트 연결 종료"),
            Err(e) if e.is_recoverable() => warn!(attempt, "호스트 연결 실패: {}", e),
            Err(e) => return Err(e),
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = active.wait_for(|active| !*active) => return Ok(attempt),
        }
    }
}
