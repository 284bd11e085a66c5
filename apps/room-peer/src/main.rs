mod rooms;
mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use peer_session::config::validate_room_code;
use peer_session::{ChannelMessage, PeerSession, Role, SessionConfig, SessionPhase, SessionState};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use rooms::RoomClient;

const TEXT_CHANNEL: &str = "text";
const MAX_BUFFERED: usize = 1024 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(20);

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let _log_guard = telemetry::init(cli.logging.filter.as_deref(), cli.logging.file.as_deref())
        .context("logging initialization failed")?;
    debug!(log_file = ?cli.logging.file, "logging configured");

    let rooms = RoomClient::new(&cli.server)?;
    let config = session_config(&cli, &rooms)?;
    debug!(server = %rooms.base(), signaling = %config.signaling_url, "endpoints resolved");

    let (code, role) = match cli.command {
        Command::Send(args) => {
            let code = match args.code {
                Some(code) => code,
                None => rooms.create_room().await.context("creating a room")?,
            };
            println!("📦 room code: {code}");
            (code, Role::Sender)
        }
        Command::Receive(args) => {
            validate_room_code(&args.code)?;
            rooms
                .check_joinable(&args.code)
                .await
                .with_context(|| format!("joining room {}", args.code))?;
            (args.code, Role::Receiver)
        }
    };

    let session = PeerSession::with_webrtc(config);
    let outcome = drive(&session, &code, role).await;
    session.shutdown();
    outcome
}

#[derive(Parser, Debug)]
#[command(
    name = "room-peer",
    about = "Exchange messages with a peer over WebRTC using a six character room code",
    author,
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "ROOM_PEER_SERVER",
        default_value = "http://127.0.0.1:8080",
        help = "Base URL of the room and signaling server"
    )]
    server: String,

    #[arg(
        long,
        global = true,
        env = "ROOM_PEER_SIGNALING_URL",
        help = "Override the signaling endpoint (defaults to <server>/ws/webrtc)"
    )]
    signaling_url: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-filter",
        global = true,
        value_name = "DIRECTIVES",
        env = "ROOM_PEER_LOG",
        help = "tracing filter directives, e.g. \"debug,webrtc=warn\" (falls back to RUST_LOG)"
    )]
    filter: Option<String>,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "ROOM_PEER_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a room as the sender (creates one unless --code is given)
    Send(SendArgs),
    /// Join a room as the receiver
    Receive(ReceiveArgs),
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long, help = "Reuse an existing room code instead of creating one")]
    code: Option<String>,
}

#[derive(Args, Debug)]
struct ReceiveArgs {
    #[arg(long, help = "Room code shared by the sender")]
    code: String,
}

fn session_config(cli: &Cli, rooms: &RoomClient) -> Result<SessionConfig> {
    let mut config = SessionConfig::from_env();
    config.signaling_url = match &cli.signaling_url {
        Some(url) => url.clone(),
        None => rooms.signaling_url()?.to_string(),
    };
    peer_session::config::derive_websocket_url(&config.signaling_url)
        .context("invalid signaling url")?;
    Ok(config)
}

async fn drive(session: &PeerSession, code: &str, role: Role) -> Result<()> {
    let _text = session.register_message_handler(TEXT_CHANNEL, |message| {
        match message.payload.get("text").and_then(Value::as_str) {
            Some(text) => println!("peer> {text}"),
            None => warn!(target = "room_peer", kind = %message.kind, "text message without text"),
        }
    });
    let _fallback = session.router().register_default_message_handler(|message| {
        info!(target = "room_peer", kind = %message.kind, channel = ?message.channel, "unhandled message");
    });
    let data_tag = session.config().data_tag.clone();
    let _data = session.register_data_handler(&data_tag, |bytes| {
        println!("📥 received {} bytes", bytes.len());
    });

    session.connect(code, role).await?;
    println!("commands: /status, /retry, /file <path>, /quit; anything else is sent as text");

    let mut states = session.subscribe();
    let mut last = SessionState::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                report(&last, &state);
                last = state;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !handle_line(session, line.trim()).await? {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_line(session: &PeerSession, line: &str) -> Result<bool> {
    match line {
        "" => {}
        "/quit" => return Ok(false),
        "/retry" => {
            if let Err(err) = session.retry().await {
                println!("⚠️  retry unavailable: {err}");
            }
        }
        "/status" => {
            let state = session.state();
            println!("{:?} (websocket: {}, peer: {})", state.phase, state.is_websocket_connected, state.is_peer_connected);
            println!("{:?}", session.diagnostics());
            println!("buffered: {} bytes", session.buffered_amount().await);
        }
        _ if line.starts_with("/file ") => {
            let path = line.trim_start_matches("/file ").trim();
            if let Err(err) = send_file(session, path).await {
                println!("⚠️  file not sent: {err:#}");
            }
        }
        text => {
            let message = ChannelMessage::new("text", json!({ "text": text }));
            if !session.send_message(message, Some(TEXT_CHANNEL)) {
                println!("(queued until the peer channel opens)");
            }
        }
    }
    Ok(true)
}

async fn send_file(session: &PeerSession, path: &str) -> Result<()> {
    if !session.state().is_peer_connected {
        bail!("no peer connected");
    }
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {path}"))?;
    let chunk_size = session.config().chunk_size.max(1);
    let total = contents.len().div_ceil(chunk_size);
    let mut chunks = 0usize;
    for chunk in contents.chunks(chunk_size) {
        wait_for_drain(session).await?;
        if !session.send_data(Bytes::copy_from_slice(chunk)) {
            bail!("peer channel rejected chunk {} of {total}", chunks + 1);
        }
        chunks += 1;
    }
    info!(target = "room_peer", path, bytes = contents.len(), chunks, "file sent");
    println!("📤 sent {} bytes in {chunks} chunk(s)", contents.len());
    Ok(())
}

/// Holds off while the channel has more than [`MAX_BUFFERED`] bytes queued.
async fn wait_for_drain(session: &PeerSession) -> Result<()> {
    while session.buffered_amount().await > MAX_BUFFERED {
        if !session.state().is_peer_connected {
            bail!("peer disconnected during transfer");
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    Ok(())
}

fn report(previous: &SessionState, state: &SessionState) {
    if previous.phase != state.phase {
        let label = match state.phase {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting to signaling server",
            SessionPhase::SignalingConnected => "waiting for peer",
            SessionPhase::PeerConnecting => "negotiating with peer",
            SessionPhase::PeerConnected => "peer connected",
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Failed => "failed",
        };
        println!("• {label}");
    }
    if previous.error != state.error {
        if let Some(err) = &state.error {
            let hint = if state.can_retry { " (type /retry)" } else { "" };
            println!("⚠️  {err}{hint}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_session() -> PeerSession {
        let config = SessionConfig::builder()
            .localhost_only()
            .build()
            .expect("config");
        PeerSession::with_webrtc(config)
    }

    #[tokio::test]
    async fn file_transfer_requires_a_peer() {
        let session = idle_session();
        let err = send_file(&session, "Cargo.toml").await.unwrap_err();
        assert!(err.to_string().contains("no peer connected"));
        // the error is printed, the input loop keeps running
        assert!(handle_line(&session, "/file Cargo.toml").await.expect("line"));
        session.shutdown();
    }

    #[tokio::test]
    async fn drain_wait_returns_when_nothing_is_buffered() {
        let session = idle_session();
        tokio::time::timeout(Duration::from_secs(1), wait_for_drain(&session))
            .await
            .expect("no wait with an empty buffer")
            .expect("drained");
        assert!(!session.send_data(Bytes::from_static(b"chunk")));
        session.shutdown();
    }
}
