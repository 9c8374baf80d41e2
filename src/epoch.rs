//! 세션 에포크
//!
//! 세션을 해체할 때마다 증가하는 세대 카운터.
//! 비동기 루프는 시작 시점의 에포크를 `EpochGuard`로 들고 다니며,
//! 프레임/파일 경계마다 확인해서 오래된 세대면 즉시 종료함.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{Error, Result};

/// 공유 에포크 카운터
#[derive(Debug, Clone)]
pub struct SessionEpoch {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for SessionEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEpoch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// 현재 에포크
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// 에포크 증가 (진행 중인 모든 가드를 무효화), 새 값 반환
    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }

    /// 현재 에포크에 묶인 가드 생성
    pub fn guard(&self) -> EpochGuard {
        let rx = self.tx.subscribe();
        let epoch = *rx.borrow();
        EpochGuard { epoch, rx }
    }
}

/// 특정 에포크에 묶인 가드
#[derive(Debug, Clone)]
pub struct EpochGuard {
    epoch: u64,
    rx: watch::Receiver<u64>,
}

impl EpochGuard {
    /// 가드가 묶인 에포크
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// 세션이 이미 해체되었는지
    pub fn is_stale(&self) -> bool {
        *self.rx.borrow() != self.epoch
    }

    /// 오래된 세대면 `Error::Cancelled`
    pub fn check(&self) -> Result<()> {
        if self.is_stale() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 에포크가 바뀔 때까지 대기
    pub async fn stale(&mut self) {
        let epoch = self.epoch;
        // 송신측이 사라져도 더 이상 진행할 세션이 없으므로 종료로 취급
        let _ = self.rx.wait_for(|current| *current != epoch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_invalidates_guard() {
        let epoch = SessionEpoch::new();
        let guard = epoch.guard();

        assert!(guard.check().is_ok());
        assert_eq!(epoch.bump(), 1);
        assert!(guard.is_stale());
        assert!(matches!(guard.check(), Err(Error::Cancelled)));

        let fresh = epoch.guard();
        assert_eq!(fresh.epoch(), 1);
        assert!(!fresh.is_stale());
    }

    #[tokio::test]
    async fn test_stale_wakes_waiter() {
        let epoch = SessionEpoch::new();
        let mut guard = epoch.guard();

        let waiter = tokio::spawn(async move {
            guard.stale().await;
            guard.is_stale()
        });

        tokio::task::yield_now().await;
        epoch.bump();

        assert!(waiter.await.unwrap());
    }
}
