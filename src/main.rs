//! callcore - Kommandozeilen-Client
//!
//! Verbindet sich mit dem Relay und ruft an oder wartet auf Anrufe.
//! Ctrl-C schließt die Ansicht und baut den Anruf sofort ab.

use anyhow::Context;
use callcore::call_engine::{
    CallContext, CallCoordinator, CallHandle, CallMode, ConversationId, CoordinatorEvent,
    ParticipantId,
};
use callcore::config::AppConfig;
use callcore::directory::{ConversationDirectory, NewParticipant};
use callcore::media::SystemMediaDevices;
use callcore::peer::{PeerConnectionManager, WebRtcEngineFactory};
use callcore::presenter::{CallPresenter, CallView, PresenterVariant};
use callcore::signaling::SignalingClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const TEARDOWN_WAIT: Duration = Duration::from_secs(2);
const FLUSH_WAIT: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "callcore")]
#[command(about = "Headless two-party voice and video calls over a signaling relay")]
struct Cli {
    /// TOML-Konfigurationsdatei
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Eigene Teilnehmer-ID (überschreibt `participant_id`)
    #[arg(short, long)]
    participant: Option<String>,

    /// Relay-URL (überschreibt `signaling.url`)
    #[arg(long)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ruft den anderen Teilnehmer einer Konversation an
    Call {
        conversation: i64,
        #[arg(long)]
        video: bool,
    },
    /// Wartet auf eingehende Anrufe und nimmt sie an
    Listen,
    /// Trägt einen Teilnehmer in eine Konversation ein
    AddParticipant {
        conversation: i64,
        participant: String,
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    callcore::init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(relay) = cli.relay {
        config.signaling.url = relay;
    }

    let db_path = config
        .directory
        .resolve_path()
        .context("no directory database path configured")?;
    let directory = ConversationDirectory::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    tracing::info!("Directory opened at {}", db_path.display());

    let local = cli
        .participant
        .or_else(|| config.participant_id.clone())
        .map(ParticipantId::new);

    match cli.command {
        Commands::AddParticipant {
            conversation,
            participant,
            name,
        } => {
            let conversation = ConversationId(conversation);
            directory.add_conversation(conversation, None)?;
            let record = directory.add_participant(
                conversation,
                NewParticipant {
                    participant_id: ParticipantId::new(participant),
                    display_name: name,
                },
            )?;
            println!(
                "Added {} to conversation {}",
                record.participant_id, record.conversation_id
            );
            Ok(())
        }
        Commands::Call {
            conversation,
            video,
        } => {
            let local = local.context("no participant id configured")?;
            let (coordinator, client) = connect(&config, local, directory).await?;
            let mode = if video { CallMode::Video } else { CallMode::Voice };

            let result = coordinator
                .start_call(ConversationId(conversation), mode)
                .await;
            if let Ok(handle) = &result {
                run_view(handle.clone()).await;
            }
            // call-end liegt evtl. noch in der Write-Queue
            client.close(FLUSH_WAIT).await;
            result
                .map(|_| ())
                .map_err(|e| anyhow::anyhow!(e.user_message()))
        }
        Commands::Listen => {
            let local = local.context("no participant id configured")?;
            let (coordinator, client) = connect(&config, local, directory).await?;
            let result = listen(coordinator).await;
            client.close(FLUSH_WAIT).await;
            result
        }
    }
}

/// Verbindet mit dem Relay und startet den Coordinator
async fn connect(
    config: &AppConfig,
    local: ParticipantId,
    directory: ConversationDirectory,
) -> anyhow::Result<(Arc<CallCoordinator>, Arc<SignalingClient>)> {
    directory.set_all_offline()?;

    let client = Arc::new(
        SignalingClient::connect(
            &config.signaling.url,
            local.clone(),
            config.signaling.heartbeat(),
        )
        .await
        .context("connecting to signaling relay")?,
    );

    let ctx = CallContext {
        devices: Arc::new(SystemMediaDevices::new()),
        peers: Arc::new(PeerConnectionManager::new(
            Arc::new(WebRtcEngineFactory::new()),
            config.ice.stun_urls.clone(),
        )),
        signaling: client.clone(),
        settings: config.call.settings(),
        profile: config.capture.clone(),
    };

    let coordinator = Arc::new(CallCoordinator::new(local, Arc::new(directory), ctx));
    tokio::spawn(Arc::clone(&coordinator).run(client.subscribe()));
    Ok((coordinator, client))
}

async fn listen(coordinator: Arc<CallCoordinator>) -> anyhow::Result<()> {
    let mut events = coordinator.subscribe();
    println!("Waiting for calls as {}", coordinator.local());

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };

        match event {
            Ok(CoordinatorEvent::IncomingCall {
                conversation_id,
                from,
                mode,
            }) => {
                println!("Incoming {} call from {}", mode.as_str(), from);
                match coordinator.answer_call(conversation_id) {
                    Ok(handle) => run_view(handle).await,
                    Err(e) => eprintln!("{}", e.user_message()),
                }
            }
            Ok(CoordinatorEvent::InviteWithdrawn { conversation_id }) => {
                println!("Call in conversation {} was cancelled", conversation_id);
            }
            Ok(CoordinatorEvent::SessionStarted { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Dropped {} coordinator events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Zeigt den Anruf an bis er endet oder die Ansicht geschlossen wird
async fn run_view(handle: CallHandle) {
    let variant = if handle.mode().is_video() {
        PresenterVariant::Video
    } else {
        PresenterVariant::Voice
    };
    let presenter = CallPresenter::attach(handle.clone(), variant);
    let mut views = presenter.subscribe();
    let mut last_line = String::new();

    loop {
        let view = views.borrow_and_update().clone();
        let line = status_line(&view);
        if line != last_line {
            println!("{}", line);
            last_line = line;
        }
        if view.status.is_terminal() {
            if let Some(error) = view.error {
                eprintln!("{}", error);
            }
            return;
        }

        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Closing call view");
                presenter.close();
                let _ = tokio::time::timeout(
                    TEARDOWN_WAIT,
                    handle.wait_for(|s| s.status.is_terminal()),
                )
                .await;
                return;
            }
        }
    }
}

fn status_line(view: &CallView) -> String {
    let mut line = format!("[{}] {}", view.remote, view.headline());
    if view.muted {
        line.push_str(" (muted)");
    }
    if view.screen_sharing {
        line.push_str(" (sharing screen)");
    }
    if let Some(placeholder) = view.placeholder {
        line.push_str(&format!(" - {}", placeholder));
    }
    if let Some(notice) = &view.notice {
        line.push_str(&format!(" - {}", notice));
    }
    line
}
