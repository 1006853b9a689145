use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use live_rtsp::{PACKET_SIZE_RANGE, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

mod file_source;

use file_source::FileSource;

#[derive(Parser)]
#[command(
    name = "live-rtsp-server",
    about = "RTSP server streaming an H.264 elementary stream as a live source"
)]
struct Args {
    /// Bind address (host:port)
    #[arg(long, short, default_value = "0.0.0.0:8554")]
    bind: String,

    /// Annex B H.264 file to serve
    #[arg(long, short)]
    input: PathBuf,

    /// Frame rate the input is played back at
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Upper bound on frames forwarded to clients (0 disables)
    #[arg(long, default_value_t = 30)]
    target_fps: u32,

    /// Restart from the beginning at end of file
    #[arg(long = "loop")]
    looping: bool,

    /// Stream path clients request
    #[arg(long, default_value = "/stream")]
    mount: String,

    /// Host advertised in SDP instead of the local address
    #[arg(long)]
    public_host: Option<String>,

    /// Largest RTP payload before FU-A fragmentation
    #[arg(long, default_value_t = 1400, value_parser = parse_packet_size)]
    max_packet_size: usize,

    /// Seconds DESCRIBE waits for SPS/PPS
    #[arg(long, default_value_t = 5)]
    describe_timeout_secs: u64,

    /// Seconds of inactivity before a session is dropped
    #[arg(long, default_value_t = 60)]
    session_timeout_secs: u64,

    /// Server RTP/RTCP port range, as MIN-MAX
    #[arg(long, default_value = "5000-65534", value_parser = parse_port_range)]
    rtp_ports: (u16, u16),
}

fn parse_port_range(s: &str) -> Result<(u16, u16), String> {
    let (min, max) = s
        .split_once('-')
        .ok_or_else(|| format!("expected MIN-MAX, got '{s}'"))?;
    let min: u16 = min.trim().parse().map_err(|e| format!("bad port '{min}': {e}"))?;
    let max: u16 = max.trim().parse().map_err(|e| format!("bad port '{max}': {e}"))?;
    if min >= max {
        return Err(format!("empty port range {min}-{max}"));
    }
    Ok((min, max))
}

fn parse_packet_size(s: &str) -> Result<usize, String> {
    let size: usize = s.trim().parse().map_err(|e| format!("bad size '{s}': {e}"))?;
    if !PACKET_SIZE_RANGE.contains(&size) {
        return Err(format!(
            "{size} outside {}..={}",
            PACKET_SIZE_RANGE.start(),
            PACKET_SIZE_RANGE.end()
        ));
    }
    Ok(size)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let source = match FileSource::open(&args.input) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            tracing::error!(path = %args.input.display(), error = %e, "cannot read input");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        path = %args.input.display(),
        access_units = source.access_units().len(),
        "input loaded"
    );

    let config = ServerConfig {
        public_host: args.public_host,
        mount_path: args.mount,
        target_fps: args.target_fps,
        max_packet_size: args.max_packet_size,
        describe_timeout: Duration::from_secs(args.describe_timeout_secs),
        session_timeout: Duration::from_secs(args.session_timeout_secs),
        rtp_port_range: args.rtp_ports,
        ..ServerConfig::default()
    };

    let mut server = Server::with_config(&args.bind, config);
    if let Err(e) = server.start() {
        tracing::error!(error = %e, "failed to start server");
        return ExitCode::FAILURE;
    }

    let frames = server.bind_encoder(source.clone());
    let playing = Arc::new(AtomicBool::new(true));
    let playback = {
        let playing = playing.clone();
        let (fps, looping) = (args.fps, args.looping);
        thread::spawn(move || source.play(&frames, fps, looping, &playing))
    };

    println!("RTSP server on {}, press Enter to stop", args.bind);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        tracing::warn!(error = %e, "stdin unavailable, stopping");
    }

    playing.store(false, Ordering::SeqCst);
    if playback.join().is_err() {
        tracing::warn!("playback thread panicked");
    }
    server.stop();
    ExitCode::SUCCESS
}
