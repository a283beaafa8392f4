//! 전송 시뮬레이터 - 루프백 피어
//!
//! 엔진 하나를 띄우고 가상의 전송 계층에 연결한 뒤, 피어 쪽에서
//! 청크를 조립하여 원본과 비교한다.
//! - tx-complete 지연으로 크레딧 흐름 제어 확인
//! - 버퍼 부족/혼잡 에러 주입으로 재시도 경로 확인
//!
//! 사용법:
//!   cargo run --release --bin xfer-sim -- [OPTIONS]
//!
//! 예시:
//!   # 임시 녹음 파일 생성 후 최신 파일 전송
//!   cargo run --release --bin xfer-sim -- --mtu 185
//!
//!   # 5% 에러 주입 + 느린 전송 계층
//!   cargo run --release --bin xfer-sim -- --fault-rate 0.05 --tx-delay-ms 3

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use notixfer::raw_format::{RAW_HEADER_SIZE, RAW_MAGIC, RAW_SAMPLE_SIZE};
use notixfer::{
    Channel, Command, Config, ConnHandle, Engine, Reassembler, StatusCode, Transport,
    TransportError,
};

/// 시뮬레이션 연결 핸들
const SIM_CONN: ConnHandle = 1;

/// 시뮬레이터 설정
struct SimConfig {
    dir: Option<PathBuf>,
    name: Option<String>,
    index: Option<u16>,
    mtu: u16,
    samples: u32,
    fault_rate: f64,
    tx_delay: Duration,
    output: Option<PathBuf>,
    config: Config,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dir: None,
            name: None,
            index: None,
            mtu: 185,
            samples: 16_000,
            fault_rate: 0.0,
            tx_delay: Duration::from_millis(1),
            output: None,
            config: Config {
                chunk_interval_us: 200,
                ..Config::default()
            },
        }
    }
}

fn parse_args() -> SimConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut sim = SimConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" | "-d" => {
                if i + 1 < args.len() {
                    sim.dir = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--name" | "-n" => {
                if i + 1 < args.len() {
                    sim.name = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--index" => {
                if i + 1 < args.len() {
                    sim.index = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--mtu" | "-m" => {
                if i + 1 < args.len() {
                    sim.mtu = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--samples" => {
                if i + 1 < args.len() {
                    sim.samples = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--credits" | "-c" => {
                if i + 1 < args.len() {
                    sim.config.credit_capacity = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--fault-rate" => {
                if i + 1 < args.len() {
                    let rate: f64 = args[i + 1].parse().expect("유효한 숫자 필요");
                    sim.fault_rate = rate.clamp(0.0, 1.0);
                    i += 1;
                }
            }
            "--tx-delay-ms" => {
                if i + 1 < args.len() {
                    sim.tx_delay =
                        Duration::from_millis(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--interval-us" => {
                if i + 1 < args.len() {
                    sim.config.chunk_interval_us = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--progress" => {
                if i + 1 < args.len() {
                    sim.config.progress_interval_bytes =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--preflight" => {
                sim.config.raw_preflight = true;
            }
            "--out" | "-o" => {
                if i + 1 < args.len() {
                    sim.output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--low-spec" => {
                sim.config = Config::low_spec();
            }
            "--high-performance" => {
                sim.config = Config::high_performance();
            }
            "--help" | "-h" => {
                println!(
                    r#"xfer-sim - notification 전송 엔진 시뮬레이터

루프백 피어로 엔진을 구동하고 조립 결과를 원본과 비교
- tx-complete 지연 (크레딧 흐름 제어)
- 버퍼 부족/혼잡 에러 주입 (재시도 경로)

사용법:
  cargo run --release --bin xfer-sim -- [OPTIONS]

옵션:
  -d, --dir <PATH>        녹음 디렉터리 (기본: 임시 디렉터리에 샘플 생성)
  -n, --name <NAME>       이름으로 전송 (START_WITH_FILENAME)
  --index <N>             인덱스로 전송 (SELECT_FILE)
  -m, --mtu <MTU>         협상 MTU (기본: 185)
  --samples <N>           생성할 샘플 수 (기본: 16000)
  -c, --credits <N>       크레딧 수 (기본: 3)
  --fault-rate <RATIO>    데이터 notify 에러 주입 비율 0.0~1.0 (기본: 0)
  --tx-delay-ms <MS>      tx-complete 지연 (기본: 1)
  --interval-us <US>      청크 간격 (기본: 200)
  --progress <BYTES>      진행률 notification 간격 (기본: 0 = 끔)
  --preflight             RAW 헤더 사전 검사
  --low-spec              저사양 프리셋
  --high-performance      고성능 프리셋
  -o, --out <PATH>        조립 결과 저장 경로
  -h, --help              이 도움말 출력

예시:
  # 기본 전송
  cargo run --release --bin xfer-sim

  # 작은 MTU + 에러 주입
  cargo run --release --bin xfer-sim -- --mtu 23 --fault-rate 0.1
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    sim
}

/// 루프백 전송 계층
struct SimTransport {
    data_tx: mpsc::UnboundedSender<Bytes>,
    status_tx: mpsc::UnboundedSender<Bytes>,
    fault_rate: f64,
    injected: AtomicU64,
}

impl Transport for SimTransport {
    fn notify(
        &self,
        _conn: ConnHandle,
        channel: Channel,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let tx = match channel {
            Channel::Data => {
                if self.fault_rate > 0.0 {
                    let mut rng = rand::thread_rng();
                    if rng.gen_bool(self.fault_rate) {
                        self.injected.fetch_add(1, Ordering::Relaxed);
                        return Err(if rng.gen_bool(0.5) {
                            TransportError::NoBuffer
                        } else {
                            TransportError::Congested
                        });
                    }
                }
                &self.data_tx
            }
            Channel::Status => &self.status_tx,
        };

        tx.send(Bytes::copy_from_slice(payload))
            .map_err(|_| TransportError::NotConnected)
    }
}

/// 샘플 RAW 녹음 파일 생성
fn write_sample_recording(dir: &std::path::Path, samples: u32) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("rec_sim.raw");

    let mut rng = rand::thread_rng();
    let mut buf =
        Vec::with_capacity(RAW_HEADER_SIZE + samples as usize * RAW_SAMPLE_SIZE as usize);
    for value in [RAW_MAGIC, 1, 16_000, samples, 0, samples / 16, 0, 0] {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    for i in 0..samples {
        buf.extend_from_slice(&rng.gen_range(0u16..4096).to_le_bytes());
        buf.extend_from_slice(&(i / 16).to_le_bytes());
        buf.extend_from_slice(&i.to_le_bytes());
    }

    std::fs::write(&path, &buf)?;
    Ok(path)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (RUST_LOG로 덮어쓰기 가능)
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut sim = parse_args();

    let dir = match sim.dir.clone() {
        Some(dir) => dir,
        None => {
            let dir = std::env::temp_dir().join("notixfer-sim");
            let path = write_sample_recording(&dir, sim.samples)?;
            info!("샘플 녹음 생성: {:?}", path);
            dir
        }
    };
    sim.config.recordings_dir = dir.clone();

    info!("xfer-sim starting...");
    info!("Recordings: {:?}", dir);
    info!("MTU: {}, credits: {}", sim.mtu, sim.config.credit_capacity);
    info!("Fault rate: {:.1}%", sim.fault_rate * 100.0);

    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(SimTransport {
        data_tx,
        status_tx,
        fault_rate: sim.fault_rate,
        injected: AtomicU64::new(0),
    });

    let engine = Engine::spawn(sim.config.clone(), transport.clone())?;

    // 연결 수립 + MTU 교환 + 구독
    engine.on_connect(SIM_CONN);
    engine.on_mtu_change(SIM_CONN, sim.mtu);
    engine.on_subscribe(SIM_CONN, Channel::Data, true);
    engine.on_subscribe(SIM_CONN, Channel::Status, true);

    // ─────────────────────────────────────────────────────────────────
    // 피어: 전송 계층 지연 후 tx-complete, 청크 조립
    // ─────────────────────────────────────────────────────────────────
    let peer_engine = engine.clone();
    let tx_delay = sim.tx_delay;
    let peer = tokio::spawn(async move {
        let mut reassembler = Reassembler::new();
        while let Some(bytes) = data_rx.recv().await {
            if !tx_delay.is_zero() {
                tokio::time::sleep(tx_delay).await;
            }
            peer_engine.on_tx_complete(SIM_CONN);

            match reassembler.push_bytes(&bytes) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    warn!("조립 에러: {}", e);
                    break;
                }
            }
        }
        reassembler
    });

    let command = match (&sim.name, sim.index) {
        (Some(name), _) => Command::StartNamed(name.clone()),
        (None, Some(index)) => Command::SelectIndexed(index),
        (None, None) => Command::Start,
    };
    info!("명령 전송: {:?}", command);
    if let Err(code) = engine.on_control_write(SIM_CONN, &command.encode()) {
        warn!("명령 거부: {:?}", code);
    }

    // 종료 상태까지 대기
    let mut outcome = None;
    while let Some(bytes) = status_rx.recv().await {
        let Some(code) = bytes.first().and_then(|b| StatusCode::from_u8(*b)) else {
            warn!("알 수 없는 상태: {:02X?}", &bytes[..]);
            continue;
        };
        info!("Status: {:?} ({} bytes)", code, bytes.len());

        let terminal = matches!(code, StatusCode::Complete | StatusCode::StoppedByHost)
            || code.is_rejection()
            || code.is_failure();
        if terminal {
            outcome = Some(code);
            break;
        }
    }

    if outcome != Some(StatusCode::Complete) {
        warn!("전송 실패: {:?}", outcome);
        peer.abort();
        engine.shutdown().await;
        return Ok(());
    }

    let reassembler = peer.await?;
    info!(
        "Reassembled {} bytes in {} packets",
        reassembler.len(),
        reassembler.packet_count()
    );

    if let Some(stats) = engine.last_stats() {
        info!("{}", stats.summary());
    }
    info!(
        "Injected faults: {}, peak in-flight credits: {}/{}",
        transport.injected.load(Ordering::Relaxed),
        engine.credits().peak(),
        engine.credits().capacity()
    );

    let data = reassembler.into_data();

    // 원본 비교 (최신 파일 기준)
    let registry = notixfer::FileRegistry::new(dir, sim.config.file_extension.clone());
    let source = match (&sim.name, sim.index) {
        (Some(name), _) => registry.resolve_named(name).ok(),
        (None, Some(index)) => registry.select_index(index as usize).ok(),
        (None, None) => registry.newest()?,
    };
    if let Some(source) = source {
        let original = std::fs::read(&source.path)?;
        if original[..] == data[..] {
            info!("원본과 일치: {:?}", source.path);
        } else {
            warn!("원본과 불일치: {:?}", source.path);
        }
    }

    if let Some(path) = &sim.output {
        std::fs::write(path, &data)?;
        info!("Saved to {:?}", path);
    }

    engine.shutdown().await;
    Ok(())
}
