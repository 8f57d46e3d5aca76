mod config;

use crate::config::CliConfig;
use anyhow::Context;
use clap::Parser;
use meshcall_session::protocol::{ParticipantId, RoomTopic};
use meshcall_session::{CallSession, NoDirectory, ParticipantView, SessionDeps};
use meshcall_signaling::relay::RelayChannel;
use meshcall_signaling::transport::tokio::TokioTransport;
use meshcall_webrtc::{RtcPeerFactory, SampleTrackDevices};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Peer-to-peer mesh calls over a pub/sub relay")]
#[command(
    long_about = "Joins a call room through a websocket pub/sub relay and keeps a direct WebRTC connection to every other participant of the room"
)]
struct CliArgs {
    /// Room topic, e.g. `team:<id>`, `meeting:<id>` or `dm:<a>:<b>`.
    room: RoomTopic,
    /// Local participant id.
    #[arg(long)]
    id: String,
    /// Display name announced to other participants. Defaults to the id.
    #[arg(long)]
    name: Option<String>,
    /// Also send video.
    #[arg(long)]
    video: bool,
    /// Config file to use instead of `./config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "meshcall=info,meshcall_session=debug,meshcall_webrtc=info,meshcall_signaling=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = CliConfig::parse(args.config.as_deref())?;
    tracing::trace!(?config, "Parsed config");

    let shutdown_token = CancellationToken::new();
    let relay = RelayChannel::new(
        TokioTransport::new(config.relay.url.clone()),
        config.relay.clone(),
        shutdown_token.clone(),
    );

    let name = args.name.clone().unwrap_or_else(|| args.id.clone());
    let session = CallSession::new(
        ParticipantId::from(args.id.as_str()),
        name,
        config.session.clone(),
        SessionDeps {
            signaling: Arc::new(relay.clone()),
            devices: Arc::new(SampleTrackDevices::new(args.id.as_str())),
            peers: Arc::new(RtcPeerFactory::new(&config.webrtc)),
            directory: Arc::new(NoDirectory),
        },
    );

    session
        .join(args.room.clone(), args.video)
        .await
        .with_context(|| format!("Failed to join room {}", args.room))?;

    let mut participants = session.subscribe_participants();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = participants.changed() => {
                if changed.is_err() {
                    break;
                }
                let views = participants.borrow_and_update().clone();
                log_participants(&views);
            }
        }
    }

    session.leave().await;
    relay.close().await;
    shutdown_token.cancel();
    Ok(())
}

fn log_participants(views: &[ParticipantView]) {
    tracing::info!(count = views.len(), "Participants changed");
    for view in views {
        tracing::info!(
            id = %view.participant.id,
            name = %view.participant.display_name,
            state = ?view.connection_state,
            tracks = view.stream.as_ref().map_or(0, |stream| stream.tracks().len()),
            muted = view.muted,
            camera_off = view.camera_off,
            "Participant"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(?err, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, leaving room...");
}
