//! 전송 통계
//!
//! 실효 전달 바이트 = (채널에 넘긴 바이트 증가분) - (미전송 바이트 증가분)
//! 고정 주기마다 샘플링해서 순간 속도와 평균 속도를 계산

use std::time::{Duration, Instant};

use crate::channel::PeerId;

/// 피어별 처리율 측정기
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    /// 시작 시간
    started_at: Instant,

    /// 샘플링 주기
    interval: Duration,

    /// 마지막 샘플 시간
    last_sample_at: Instant,

    /// 마지막 샘플 시점의 누적 전송 바이트
    last_handed_off: u64,

    /// 마지막 샘플 시점의 미전송 바이트
    last_outstanding: usize,

    /// 누적 실효 전달 바이트
    delivered: u64,

    /// 순간 속도 (bytes/sec)
    speed: f64,
}

impl ThroughputMeter {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            interval,
            last_sample_at: now,
            last_handed_off: 0,
            last_outstanding: 0,
            delivered: 0,
            speed: 0.0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 샘플 기록, 이번 구간의 실효 전달 바이트 반환
    pub fn sample(&mut self, handed_off: u64, outstanding: usize) -> u64 {
        self.sample_at(Instant::now(), handed_off, outstanding)
    }

    pub fn sample_at(&mut self, now: Instant, handed_off: u64, outstanding: usize) -> u64 {
        let sent_delta = handed_off.saturating_sub(self.last_handed_off) as i128;
        let outstanding_delta = outstanding as i128 - self.last_outstanding as i128;
        let delivered = (sent_delta - outstanding_delta).max(0) as u64;

        let elapsed = now.saturating_duration_since(self.last_sample_at);
        self.speed = if elapsed.is_zero() {
            0.0
        } else {
            delivered as f64 / elapsed.as_secs_f64()
        };

        self.delivered += delivered;
        self.last_handed_off = handed_off;
        self.last_outstanding = outstanding;
        self.last_sample_at = now;
        delivered
    }

    /// 순간 속도 (bytes/sec)
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// 누적 실효 전달 바이트
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 평균 속도 (bytes/sec)
    pub fn average_speed(&self) -> f64 {
        self.average_speed_at(Instant::now())
    }

    pub fn average_speed_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.delivered as f64 / elapsed
    }
}

/// 피어 하나의 진행 상황 스냅샷
#[derive(Debug, Clone, PartialEq)]
pub struct PeerProgress {
    pub peer_id: PeerId,

    /// 현재 파일 인덱스
    pub file_index: usize,

    /// 현재 파일에서 보낸 바이트
    pub bytes_sent_for_current_file: u64,

    /// 완료된 바이트 (이전 파일 + 현재 파일 진행분)
    pub completed_bytes: u64,

    /// 매니페스트 전체 바이트
    pub total_bytes: u64,

    /// 순간 속도 (bytes/sec)
    pub speed: f64,

    /// 평균 속도 (bytes/sec)
    pub average_speed: f64,
}

impl PeerProgress {
    /// 진행률 (0.0 ~ 1.0)
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.completed_bytes as f64 / self.total_bytes as f64).min(1.0)
    }
}

/// 모든 활성 피어의 합산 진행 상황
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalProgress {
    /// 활성 피어 수
    pub peers: usize,

    /// 속도 합 (bytes/sec)
    pub speed: f64,

    /// 크기 가중 평균 진행률 (0.0 ~ 1.0)
    pub progress: f64,
}

impl GlobalProgress {
    pub fn aggregate(peers: &[PeerProgress]) -> Self {
        let total: u64 = peers.iter().map(|p| p.total_bytes).sum();
        let completed: u64 = peers
            .iter()
            .map(|p| p.completed_bytes.min(p.total_bytes))
            .sum();

        let progress = if peers.is_empty() {
            0.0
        } else if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        };

        Self {
            peers: peers.len(),
            speed: peers.iter().map(|p| p.speed).sum(),
            progress,
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Peers: {} | Progress: {:.1}% | Speed: {:.2} MB/s",
            self.peers,
            self.progress * 100.0,
            self.speed / 1_000_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivered_subtracts_buffered_growth() {
        let mut meter = ThroughputMeter::new(Duration::from_millis(500));
        let t0 = meter.last_sample_at;

        // 1000 바이트를 넘겼지만 400은 아직 버퍼에 있음
        let delivered = meter.sample_at(t0 + Duration::from_millis(500), 1000, 400);
        assert_eq!(delivered, 600);
        assert!((meter.speed() - 1200.0).abs() < 1e-6);

        // 추가 전송 없이 버퍼만 비워짐
        let delivered = meter.sample_at(t0 + Duration::from_millis(1000), 1000, 0);
        assert_eq!(delivered, 400);
        assert_eq!(meter.delivered(), 1000);

        let avg = meter.average_speed_at(meter.started_at + Duration::from_secs(1));
        assert!((avg - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn test_global_is_size_weighted() {
        let peer = |id: &str, completed, total, speed| PeerProgress {
            peer_id: id.to_string(),
            file_index: 0,
            bytes_sent_for_current_file: completed,
            completed_bytes: completed,
            total_bytes: total,
            speed,
            average_speed: speed,
        };

        let global = GlobalProgress::aggregate(&[
            peer("a", 100, 100, 10.0),
            peer("b", 0, 300, 30.0),
        ]);

        assert_eq!(global.peers, 2);
        assert!((global.speed - 40.0).abs() < 1e-9);
        assert!((global.progress - 0.25).abs() < 1e-9);
        assert_eq!(GlobalProgress::aggregate(&[]).progress, 0.0);
    }
}
