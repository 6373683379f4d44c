//! WebRTC receiver binary entry point
//!
//! Prints an SDP offer, waits for the browser's answer to be pasted back and
//! renders the received video.
//!
//! # Usage
//!
//! ```bash
//! # Default STUN server, VP8 (the default codec) through libavcodec
//! cargo run --bin webrtc_receiver --features ffmpeg
//!
//! # Custom STUN server (stun://host:port is accepted too)
//! cargo run --bin webrtc_receiver --features ffmpeg -- stun:stun.example.com:3478
//!
//! # H.264 with the OpenH264 decoder, PNG snapshot of the newest frame
//! WEBRTC_RECV_VIDEO_CODEC=h264 WEBRTC_RECV_SNAPSHOT=latest.png \
//!   cargo run --bin webrtc_receiver --features h264
//! ```
//!
//! A build without a decoder for the configured codec exits at startup.
//!
//! Press `q` or ESC (followed by Enter) or Ctrl+C to quit.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use webrtc_receiver::media::BranchOptions;
use webrtc_receiver::pipeline::decode::DecoderRegistry;
use webrtc_receiver::signaling::KeyPress;
use webrtc_receiver::{
    run_render_loop, run_session, ConsolePresenter, FrameExchange, FrameProducer,
    HeadlessSurface, MediaGraphBuilder, NegotiationState, Pipeline, ReceiverConfig, SdpSanitizer,
    SessionHandle, Shutdown, SignalingController, WebRtcEngine,
};

/// Manual-signaling WebRTC video receiver
///
/// Configuration beyond the STUN server comes from WEBRTC_RECV_* variables.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// STUN server URI, e.g. stun:stun.l.google.com:19302
    stun: Option<String>,
}

/// Everything that runs on the tokio runtime
struct Receiver {
    engine: Arc<WebRtcEngine>,
    pipeline: Pipeline,
    session_task: JoinHandle<NegotiationState>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing();

    info!(
        version = webrtc_receiver::version(),
        "WebRTC receiver starting"
    );

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Shutdown::new();
    let signal_shutdown = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if signal_shutdown.is_triggered() {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(130);
        }
        signal_shutdown.trigger();
    }) {
        warn!("Failed to install Ctrl+C handler: {}", e);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("webrtc-receiver")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let exchange = FrameExchange::new();
    let (keys_tx, keys_rx) = std::sync::mpsc::channel::<KeyPress>();

    let receiver = match runtime.block_on(start(&config, exchange.clone(), keys_tx, shutdown.clone())) {
        Ok(receiver) => receiver,
        Err(e) => {
            error!("Failed to construct receiver: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut surface = HeadlessSurface::new(keys_rx);
    if let Some(path) = &config.snapshot_path {
        info!("Writing snapshots to {}", path.display());
        surface = surface.with_snapshot(path);
    }

    let interval = Duration::from_millis(config.render_interval_ms);
    let render_shutdown = shutdown.clone();
    let render = std::thread::Builder::new()
        .name("render".to_string())
        .spawn(move || run_render_loop(&exchange, &mut surface, interval, &render_shutdown));

    match render {
        Ok(handle) => {
            if handle.join().is_err() {
                error!("Render thread panicked");
                shutdown.trigger();
            }
        }
        Err(e) => {
            error!("Failed to start render thread: {}", e);
            shutdown.trigger();
        }
    }

    runtime.block_on(stop(receiver));
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("Console reader abandoned, exiting");
    ExitCode::SUCCESS
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the SDP offer
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_config(args: &Args) -> webrtc_receiver::Result<ReceiverConfig> {
    let mut config = ReceiverConfig::default();
    if let Some(stun) = &args.stun {
        config = config.with_stun_server(stun);
    }
    let config = config.apply_env()?;
    config.validate()?;

    info!(
        stun = %config.stun_server,
        codec = config.video_codec.encoding_name(),
        drop_host = config.candidate_filter.drop_host,
        "Configuration loaded"
    );
    Ok(config)
}

async fn start(
    config: &ReceiverConfig,
    exchange: FrameExchange,
    keys: std::sync::mpsc::Sender<KeyPress>,
    shutdown: Shutdown,
) -> webrtc_receiver::Result<Receiver> {
    let decoders = DecoderRegistry::with_defaults();
    decoders.require(config.video_codec.encoding_name())?;
    let pipeline = Pipeline::with_decoders(decoders)?;
    let producer = Arc::new(FrameProducer::new(exchange, config.frame_log_interval));
    let builder = MediaGraphBuilder::new(
        Arc::new(pipeline.clone()),
        producer.sample_handler(),
        BranchOptions::from_config(config),
    );

    let (session, rx) = SessionHandle::channel();
    let engine = Arc::new(
        WebRtcEngine::new(config, session.clone(), pipeline.clone(), builder, shutdown.clone())
            .await?,
    );

    let controller = SignalingController::new(
        engine.clone(),
        Arc::new(ConsolePresenter::new(session, keys)),
        SdpSanitizer::new(config.candidate_filter),
    );
    let session_task = tokio::spawn(run_session(
        controller,
        rx,
        shutdown,
        config.max_answer_attempts,
    ));

    pipeline.play();
    engine.start().await?;

    Ok(Receiver {
        engine,
        pipeline,
        session_task,
    })
}

async fn stop(receiver: Receiver) {
    match receiver.session_task.await {
        Ok(state) => info!("Session ended in state {}", state),
        Err(e) => warn!("Session task failed: {}", e),
    }
    if let Err(e) = receiver.engine.close().await {
        warn!("{}", e);
    }
    receiver.pipeline.stop();
}
