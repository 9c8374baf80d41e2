//! PeerDrop 루프백 데모
//!
//! 인메모리 채널로 한 명의 공유자와 N명의 수신자를 연결해서 전송 엔진을 구동
//! - 파일 경로를 주면 그 파일들을, 없으면 테스트 데이터를 공유
//! - `--interrupt`를 주면 첫 수신자를 중간에 끊었다가 이어받기
//!
//! 사용법:
//!   cargo run --release --bin peerdrop-loopback -- [OPTIONS]
//!
//! 예시:
//!   # 수신자 3명, 32MB 테스트 데이터
//!   cargo run --release --bin peerdrop-loopback -- -n 3 --size 33554432
//!
//!   # 파일 공유 + 느린 링크 + 이어받기
//!   cargo run --release --bin peerdrop-loopback -- -f a.bin -f b.bin --throttle 8388608 --interrupt 16

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use peerdrop::channel::{Channel, ChannelEvent};
use peerdrop::loopback::{EventReceiver, LoopbackOptions};
use peerdrop::receiver::ReceiverState;
use peerdrop::sender::PeerEvent;
use peerdrop::{
    Config, DirectorySinkFactory, FileManifest, FileSource, LoopbackChannel, MemorySinkFactory,
    MemorySource, PathSource, PeerFanoutManager, ReceiverSession, SinkFactory,
    TransferConstraints,
};

/// 데모 설정
struct DemoConfig {
    files: Vec<PathBuf>,
    receivers: usize,
    size: usize,
    throttle: Option<u64>,

    /// 첫 수신자를 이 프레임 수 이후 끊기
    interrupt_after: Option<usize>,
    out_dir: Option<PathBuf>,
    config: Config,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            receivers: 2,
            size: 8 * 1024 * 1024,
            throttle: None,
            interrupt_after: None,
            out_dir: None,
            config: Config {
                auto_accept: true,
                ..Config::default()
            },
        }
    }
}

fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    args.get(i + 1)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| format!("{}에 유효한 값 필요", flag))
}

fn parse_args() -> Result<DemoConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = DemoConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--file" | "-f" => {
                config.files.push(value(&args, i, "--file")?);
                i += 1;
            }
            "--receivers" | "-n" => {
                config.receivers = value(&args, i, "--receivers")?;
                i += 1;
            }
            "--size" => {
                config.size = value(&args, i, "--size")?;
                i += 1;
            }
            "--throttle" => {
                config.throttle = Some(value(&args, i, "--throttle")?);
                i += 1;
            }
            "--interrupt" => {
                config.interrupt_after = Some(value(&args, i, "--interrupt")?);
                i += 1;
            }
            "--out" | "-o" => {
                config.out_dir = Some(value(&args, i, "--out")?);
                i += 1;
            }
            "--frame-size" => {
                config.config.frame_size = value(&args, i, "--frame-size")?;
                i += 1;
            }
            "--high-water" => {
                config.config.high_water_mark = value(&args, i, "--high-water")?;
                config.config.low_water_mark =
                    config.config.low_water_mark.min(config.config.high_water_mark);
                i += 1;
            }
            "--low-latency" => {
                config.config = Config {
                    auto_accept: true,
                    ..Config::low_latency()
                };
            }
            "--high-throughput" => {
                config.config = Config {
                    auto_accept: true,
                    ..Config::high_throughput()
                };
            }
            "--help" | "-h" => {
                println!(
                    r#"PeerDrop Loopback - 인메모리 채널 전송 데모

사용법:
  cargo run --release --bin peerdrop-loopback -- [OPTIONS]

옵션:
  -f, --file <PATH>       공유할 파일 (여러 번 지정 가능, 없으면 테스트 데이터)
  -n, --receivers <N>     수신자 수 (기본: 2)
  --size <BYTES>          테스트 데이터 크기 (기본: 8MB)
  --throttle <BPS>        링크 배출 속도 bytes/sec (기본: 제한 없음)
  --interrupt <FRAMES>    첫 수신자를 N 프레임 후 끊고 이어받기
  -o, --out <DIR>         수신 파일 저장 디렉터리 (기본: 메모리)
  --frame-size <BYTES>    프레임 크기 (기본: 65536)
  --high-water <BYTES>    high-water mark (기본: 65536)
  --low-latency           저지연 설정 사용
  --high-throughput       고대역폭 설정 사용
  -h, --help              이 도움말 출력

환경 변수:
  RUST_LOG                로그 필터 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => warn!("알 수 없는 옵션 무시: {}", other),
        }
        i += 1;
    }

    Ok(config)
}

fn sinks_for(demo: &DemoConfig, index: usize) -> (Box<dyn SinkFactory>, Option<MemorySinkFactory>) {
    match &demo.out_dir {
        Some(dir) => (
            Box::new(DirectorySinkFactory::new(dir.join(format!("receiver-{}", index)))),
            None,
        ),
        None => {
            let memory = MemorySinkFactory::new();
            (Box::new(memory.clone()), Some(memory))
        }
    }
}

fn connect(
    manager: &Arc<PeerFanoutManager>,
    peer_id: &str,
    options: LoopbackOptions,
) -> peerdrop::Result<(Arc<LoopbackChannel>, EventReceiver)> {
    let ((sharer, sharer_events), (receiver, receiver_events)) =
        LoopbackChannel::pair("sharer", peer_id, options);
    manager.admit(sharer, sharer_events)?;
    Ok((receiver, receiver_events))
}

/// 수신자 하나 구동, 첫 연결을 `interrupt_after` 프레임 후 끊고 재연결
async fn run_receiver(
    manager: Arc<PeerFanoutManager>,
    peer_id: String,
    mut session: ReceiverSession,
    options: LoopbackOptions,
    interrupt_after: Option<usize>,
) -> peerdrop::Result<ReceiverState> {
    let (channel, mut events) = connect(&manager, &peer_id, options)?;

    if let Some(limit) = interrupt_after {
        session.on_open();
        let mut frames = 0;
        while let Some(event) = events.recv().await {
            let ChannelEvent::Data(frame) = event else {
                continue;
            };
            let binary = frame.is_binary();
            if let Some(reply) = session.handle_frame(frame)? {
                channel.send(reply.into())?;
            }
            if binary {
                frames += 1;
                if frames >= limit {
                    break;
                }
            }
        }
        channel.close();
        session.on_closed();
        info!(peer = %peer_id, resume = ?session.resume_point(), "수신자 연결 끊김, 재연결");

        tokio::time::sleep(Duration::from_millis(200)).await;
        let (channel, mut events) = connect(&manager, &peer_id, options)?;
        return session.run(channel.as_ref(), &mut events).await;
    }

    session.run(channel.as_ref(), &mut events).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let demo = parse_args()?;
    demo.config.validate()?;

    info!("PeerDrop loopback demo starting...");
    info!("Receivers: {}", demo.receivers);
    info!("Frame size: {} bytes", demo.config.frame_size);
    info!("High-water mark: {} bytes", demo.config.high_water_mark);

    // 공유할 데이터 준비
    let (manifest, source, originals): (FileManifest, Arc<dyn FileSource>, Option<Vec<bytes::Bytes>>) =
        if demo.files.is_empty() {
            info!("Using test data ({} bytes)", demo.size);
            let data: bytes::Bytes = (0..demo.size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into();
            let (manifest, source) = MemorySource::with_manifest(vec![("test.bin", data.clone())]);
            (manifest, Arc::new(source) as Arc<dyn FileSource>, Some(vec![data]))
        } else {
            let source = PathSource::new(demo.files.clone());
            let manifest = source.manifest()?;
            (manifest, Arc::new(source) as Arc<dyn FileSource>, None)
        };
    info!("Files: {}, total {} bytes", manifest.len(), manifest.total_size());

    let manager = PeerFanoutManager::new(demo.config.clone());
    manager.share(manifest.clone(), source, TransferConstraints::none())?;

    // 피어 이벤트 로그
    if let Some(mut peer_events) = manager.take_events() {
        tokio::spawn(async move {
            while let Some(event) = peer_events.recv().await {
                match event {
                    PeerEvent::Failed { peer_id, error } => warn!(peer = %peer_id, "전송 실패: {}", error),
                    other => info!("{:?}", other),
                }
            }
        });
    }

    let options = match demo.throttle {
        Some(rate) => LoopbackOptions::throttled(rate),
        None => LoopbackOptions::unlimited(),
    };

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(demo.receivers);
    let mut memory_sinks = Vec::with_capacity(demo.receivers);
    for index in 0..demo.receivers {
        let (sinks, memory) = sinks_for(&demo, index);
        memory_sinks.push(memory);
        let session = ReceiverSession::new(demo.config.clone(), sinks);
        let interrupt = if index == 0 { demo.interrupt_after } else { None };

        tasks.push(tokio::spawn(run_receiver(
            manager.clone(),
            format!("receiver-{}", index),
            session,
            options,
            interrupt,
        )));
    }

    // 진행 상황 출력
    let reporter = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.config().sample_interval());
            loop {
                interval.tick().await;
                let global = manager.global_progress();
                if global.peers > 0 {
                    info!("{}", global.summary());
                }
            }
        })
    };

    let mut complete = 0;
    for (index, task) in tasks.into_iter().enumerate() {
        match task.await? {
            Ok(ReceiverState::Complete) => complete += 1,
            Ok(state) => warn!("receiver-{} 종료 상태: {:?}", index, state),
            Err(e) => warn!("receiver-{} 실패: {}", index, e),
        }
    }
    reporter.abort();

    let elapsed = started.elapsed();
    let total = manifest.total_size() * complete as u64;
    info!("Completed receivers: {}/{}", complete, demo.receivers);
    info!(
        "Elapsed: {:.2}s, aggregate throughput: {:.2} MB/s",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / 1_000_000.0
    );

    // 메모리 수신 결과 검증
    if let Some(originals) = originals {
        for (index, memory) in memory_sinks.iter().enumerate() {
            let Some(memory) = memory else { continue };
            let intact = originals
                .iter()
                .enumerate()
                .all(|(file, data)| memory.completed(file).as_ref() == Some(data));
            info!("receiver-{}: {}", index, if intact { "bit-identical" } else { "MISMATCH" });
        }
    }

    manager.cancel().await;
    Ok(())
}
