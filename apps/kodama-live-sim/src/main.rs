//! Kodama Live Sim - simulated NVR serving synthetic live view
//!
//! Generates GOP-structured frames for a set of fake cameras and streams them
//! to TCP viewers. A viewer connection carries one camera: the viewer sends
//! the camera index on a line (an empty line picks camera 0), then reads a
//! status line followed by frame headers, each followed by its payload.
//!
//! ## Usage
//!
//! ```bash
//! # Four cameras on port 7880, watch camera 2
//! kodama-live-sim &
//! (echo 2; cat) | nc localhost 7880 > camera2.bin
//!
//! # Custom port and camera count
//! KODAMA_LIVE_SIM_PORT=9000 KODAMA_LIVE_SIM_CAMERAS=2 kodama-live-sim
//!
//! # Shorter video loss for experiments
//! KODAMA_LIVE_PRE_VIDEO_LOSS_SECS=3 kodama-live-sim
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use kodama_live::{
    synthetic_frame, Codec, ConnectionId, FrameRequest, LiveConfig, LiveStreamer, MediaFrame,
    StreamKind, SyntheticCamera, TcpTransport, Transport, TransportKind, TransportTable,
};

/// Simulator settings from environment
struct SimConfig {
    port: u16,
    cameras: usize,
    fps: u8,
    gop: u8,
}

impl SimConfig {
    fn from_env() -> Self {
        let port: u16 = std::env::var("KODAMA_LIVE_SIM_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7880);

        let cameras: usize = std::env::var("KODAMA_LIVE_SIM_CAMERAS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);

        let fps: u8 = std::env::var("KODAMA_LIVE_SIM_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|&fps| fps > 0)
            .unwrap_or(30);

        let gop: u8 = std::env::var("KODAMA_LIVE_SIM_GOP")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Self {
            port,
            cameras,
            fps,
            gop,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let sim = SimConfig::from_env();
    let config = LiveConfig::from_env()?;

    info!("Kodama Live Sim starting");
    info!("  Port: {}", sim.port);
    info!("  Cameras: {} @ {} fps, GOP {}", sim.cameras, sim.fps, sim.gop);
    info!("  Max clients: {}", config.max_clients);
    info!("  Video loss after: {:?}", config.pre_video_loss);

    let camera = Arc::new(SyntheticCamera::new(sim.cameras).with_auto_ack(true));
    for index in 0..sim.cameras {
        for kind in StreamKind::ALL {
            camera.set_fps_gop(index, kind, sim.fps, sim.gop);
        }
    }

    let tcp = Arc::new(TcpTransport::new());
    let transports = TransportTable::new().with(TransportKind::Native, tcp.clone());
    let live = Arc::new(LiveStreamer::new(config, camera.clone(), transports)?);

    let bind = SocketAddr::from(([0, 0, 0, 0], sim.port));
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on {}", bind);

    // Graceful shutdown
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Frame generator
    let gen_camera = camera.clone();
    let gen_cancel = cancel.clone();
    let cameras = sim.cameras;
    let gop = sim.gop;
    let fps = u64::from(sim.fps);
    let period = Duration::from_millis(1000 / fps);
    tracker.spawn(async move {
        let mut tick = interval(period);
        let mut seq = 0u64;
        loop {
            tokio::select! {
                _ = gen_cancel.cancelled() => {
                    info!("Generator: shutting down");
                    break;
                }
                _ = tick.tick() => {
                    for index in 0..cameras {
                        gen_camera.push_frame(index, StreamKind::Main, synthetic_frame(Codec::H264, seq, gop, 4096));
                        gen_camera.push_frame(index, StreamKind::Sub, synthetic_frame(Codec::H264, seq, gop, 1024));
                        let audio = MediaFrame::audio(Codec::G711Ulaw, Bytes::from_static(&[0xFF; 160]));
                        gen_camera.push_frame(index, StreamKind::Main, audio.with_timestamp(seq * 1000 / fps));
                    }
                    seq += 1;
                }
            }
        }
    });

    // Viewer accept loop
    let accept_live = live.clone();
    let accept_cancel = cancel.clone();
    let viewers = tracker.clone();
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = accept_cancel.cancelled() => {
                    info!("Accept loop: shutting down");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let live = accept_live.clone();
                            let tcp = tcp.clone();
                            viewers.spawn(async move {
                                match admit_viewer(&live, &tcp, stream, cameras).await {
                                    Ok(camera) => info!(%peer, camera, "Viewer connected"),
                                    Err(e) => warn!(%peer, "Viewer rejected: {:#}", e),
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                        }
                    }
                }
            }
        }
    });

    tracker.close();

    run_headless(live, cancel, tracker).await
}

/// Read the viewer's camera choice, then hand the socket to the TCP
/// transport and start that camera's main stream on it.
async fn admit_viewer(
    live: &LiveStreamer,
    tcp: &TcpTransport,
    mut stream: TcpStream,
    cameras: usize,
) -> Result<usize> {
    let camera = tokio::time::timeout(Duration::from_secs(5), read_camera_index(&mut stream))
        .await
        .context("No camera selected within 5s")??;
    if camera >= cameras {
        anyhow::bail!("Camera {} out of range (0..{})", camera, cameras);
    }

    let client = (0..live.config().max_clients)
        .find(|&client| !live.is_client_active(client))
        .context("All client slots in use")?;

    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let conn: ConnectionId = tcp.register(stream);

    if let Err(e) = live.add_live_stream(
        camera,
        StreamKind::Main,
        client,
        conn,
        TransportKind::Native,
        FrameRequest::all(),
    ) {
        // Never reached the pump, so nothing else will close it
        let _ = tcp.close(conn);
        return Err(e.into());
    }
    // Queued behind the start, so it applies to the new tuple
    if let Err(e) = live.change_live_audio_state(camera, StreamKind::Main, client, true) {
        warn!(client, camera, "Audio not enabled: {}", e);
    }
    Ok(camera)
}

/// One short text line holding a camera index.
async fn read_camera_index(stream: &mut TcpStream) -> Result<usize> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.context("Viewer hung up")?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= 8 {
            anyhow::bail!("Camera selection line too long");
        }
        line.push(byte);
    }
    let text = std::str::from_utf8(&line)?.trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<usize>()
        .with_context(|| format!("Invalid camera index {:?}", text))
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kodama_live=info".parse()?),
        )
        .init();
    Ok(())
}

/// Log stats periodically, shut down on SIGINT
async fn run_headless(
    live: Arc<LiveStreamer>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    info!("Waiting for viewers...");
    let mut stats_interval = interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => {
                info!("Stats: {}", serde_json::to_string(&live.stats())?);
            }
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }

    // Joins the pump threads
    tokio::task::spawn_blocking(move || live.shutdown()).await?;
    info!("Kodama Live Sim stopped");
    Ok(())
}
