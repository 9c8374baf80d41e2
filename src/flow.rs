//! 흐름 제어
//!
//! 프레임 전송 전마다 채널의 미전송 바이트를 확인하고,
//! high-water mark를 넘으면 low-water mark 이하로 배출될 때까지 대기.
//! 폴링 없이 채널 버퍼 구독으로 깨어남.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::channel::Channel;
use crate::epoch::EpochGuard;
use crate::{Config, Error, Result};

/// 채널별 백프레셔 게이트
#[derive(Debug)]
pub struct FlowController {
    high_water_mark: usize,
    low_water_mark: usize,

    /// 대기한 횟수 (통계용)
    suspensions: AtomicU64,
}

impl FlowController {
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Self {
        Self {
            high_water_mark,
            low_water_mark: low_water_mark.min(high_water_mark),
            suspensions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.high_water_mark, config.low_water_mark)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }

    /// 지금까지 송신자를 멈춘 횟수
    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// 다음 프레임을 보내도 되는 상태가 될 때까지 대기
    ///
    /// - 채널이 닫히면 `Error::ChannelClosed`
    /// - 세션 에포크가 바뀌면 `Error::Cancelled`
    pub async fn ready(&self, channel: &dyn Channel, guard: &mut EpochGuard) -> Result<()> {
        guard.check()?;
        if !channel.is_open() {
            return Err(Error::ChannelClosed);
        }
        if channel.outstanding_bytes() <= self.high_water_mark {
            return Ok(());
        }

        self.suspensions.fetch_add(1, Ordering::Relaxed);
        debug!(
            peer = channel.peer_id(),
            outstanding = channel.outstanding_bytes(),
            high_water_mark = self.high_water_mark,
            "백프레셔 대기"
        );

        // wait_for는 현재 값을 먼저 검사하므로, 확인과 구독 사이에
        // 이미 배출된 경우에도 즉시 반환됨
        let mut buffer = channel.watch_buffer();
        let low = self.low_water_mark;
        let drained = async {
            buffer
                .wait_for(|state| !state.open || state.outstanding <= low)
                .await
                .map(|state| state.open)
        };

        tokio::select! {
            result = drained => match result {
                Ok(true) => Ok(()),
                Ok(false) | Err(_) => Err(Error::ChannelClosed),
            },
            _ = guard.stale() => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::epoch::SessionEpoch;
    use crate::loopback::{LoopbackChannel, LoopbackOptions};
    use crate::message::Frame;

    const FRAME: usize = 16 * 1024;
    const HIGH: usize = 64 * 1024;

    #[tokio::test]
    async fn test_outstanding_bounded_under_slow_drain() {
        let ((tx, _tx_events), (_rx, _rx_events)) =
            LoopbackChannel::pair("sender", "receiver", LoopbackOptions::throttled(8 * 1024 * 1024));
        let flow = FlowController::new(HIGH, HIGH);
        let epoch = SessionEpoch::new();
        let mut guard = epoch.guard();

        // 독립 샘플러로 미전송 바이트 최대치 관찰
        let peak = Arc::new(AtomicUsize::new(0));
        let mut buffer = tx.watch_buffer();
        let sampler_peak = peak.clone();
        let sampler = tokio::spawn(async move {
            while buffer.changed().await.is_ok() {
                let state = *buffer.borrow();
                if !state.open {
                    break;
                }
                sampler_peak.fetch_max(state.outstanding, Ordering::Relaxed);
            }
        });

        for _ in 0..64 {
            flow.ready(tx.as_ref(), &mut guard).await.unwrap();
            tx.send(Frame::Binary(Bytes::from(vec![7u8; FRAME]))).unwrap();
            peak.fetch_max(tx.outstanding_bytes(), Ordering::Relaxed);
        }

        assert!(flow.suspensions() > 0);
        assert!(peak.load(Ordering::Relaxed) <= HIGH + FRAME);

        tx.close();
        let _ = sampler.await;
    }

    #[tokio::test]
    async fn test_closed_channel_fails_fast() {
        let ((tx, _), (rx, _)) =
            LoopbackChannel::pair("a", "b", LoopbackOptions::throttled(1024));
        let flow = FlowController::new(1024, 1024);
        let epoch = SessionEpoch::new();
        let mut guard = epoch.guard();

        // 배출이 느려서 바로 high-water mark 초과
        tx.send(Frame::Binary(Bytes::from(vec![0u8; 4096]))).unwrap();

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { flow.ready(tx.as_ref(), &mut guard).await })
        };
        tokio::task::yield_now().await;
        rx.close();

        assert!(matches!(waiter.await.unwrap(), Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_epoch_bump_cancels_wait() {
        let ((tx, _), (_rx, _)) =
            LoopbackChannel::pair("a", "b", LoopbackOptions::throttled(1024));
        let flow = FlowController::new(1024, 1024);
        let epoch = SessionEpoch::new();
        let mut guard = epoch.guard();

        tx.send(Frame::Binary(Bytes::from(vec![0u8; 8192]))).unwrap();

        let waiter = {
            let tx = tx.clone();
            tokio::spawn(async move { flow.ready(tx.as_ref(), &mut guard).await })
        };
        tokio::task::yield_now().await;
        epoch.bump();

        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    }
}
