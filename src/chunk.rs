//! 청크 송신기
//!
//! - 바이트 소스를 큰 배치(16MB)로 읽고
//! - 고정 크기 프레임(64KB)으로 잘라 순서대로 전송
//! - 매 프레임 전에 흐름 제어 확인, 실패 시 재시도 없이 즉시 중단

use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::trace;

use crate::channel::Channel;
use crate::epoch::EpochGuard;
use crate::flow::FlowController;
use crate::message::Frame;
use crate::source::BoxedSource;
use crate::{Config, Result};

/// 한 번의 전송에 필요한 채널 측 인자 묶음
pub struct SendTarget<'a> {
    pub channel: &'a dyn Channel,
    pub flow: &'a FlowController,
    pub guard: &'a mut EpochGuard,

    /// 채널에 넘긴 누적 바이트 (처리율 계산용)
    pub handed_off: &'a AtomicU64,
}

/// 고정 크기 프레임 송신기
#[derive(Debug, Clone, Copy)]
pub struct ChunkedByteSender {
    frame_size: usize,
    read_batch_size: usize,
}

impl ChunkedByteSender {
    pub fn new(frame_size: usize, read_batch_size: usize) -> Self {
        Self {
            frame_size,
            read_batch_size: read_batch_size.max(frame_size),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.frame_size, config.read_batch_size)
    }

    /// `offset`부터 `length` 바이트를 프레임으로 전송
    ///
    /// 반환값은 실제로 채널에 넘긴 바이트 수.
    /// 소스가 `length`보다 짧으면 `UnexpectedEof` IO 에러.
    pub async fn send(
        &self,
        source: &mut BoxedSource,
        offset: u64,
        length: u64,
        mut target: SendTarget<'_>,
    ) -> Result<u64> {
        if offset > 0 {
            source.seek(SeekFrom::Start(offset)).await?;
        }

        let mut remaining = length;
        let mut sent = 0u64;

        while remaining > 0 {
            target.guard.check()?;

            let want = remaining.min(self.read_batch_size as u64) as usize;
            let mut batch = vec![0u8; want];
            source.read_exact(&mut batch).await?;

            let mut data = Bytes::from(batch);
            while !data.is_empty() {
                let frame = data.split_to(self.frame_size.min(data.len()));
                let len = frame.len() as u64;

                target.flow.ready(target.channel, target.guard).await?;
                target.channel.send(Frame::Binary(frame))?;

                sent += len;
                target.handed_off.fetch_add(len, Ordering::Relaxed);
            }

            remaining -= want as u64;
            trace!(
                peer = target.channel.peer_id(),
                sent,
                remaining,
                "배치 전송 완료"
            );
        }

        Ok(sent)
    }
}
