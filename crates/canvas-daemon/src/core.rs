/// DaemonCore — single-owner event loop for one listening session.
///
/// Socket clients, the HTTP API and the signal handler all send
/// `DaemonEvent`s here.  Generation cycles run on their own tasks so a slow
/// model never blocks the loop; overlapping cycles are resolved inside the
/// pipeline by generation number.
///
/// State changes reach clients through `forward_state_changes`, which turns
/// every `rev` bump into a `BroadcastMessage::StateUpdated`.
use std::sync::Arc;

use canvas_proto::config::Config;
use canvas_proto::credential::Resolution;
use canvas_proto::pipeline::{Pipeline, RefreshOutcome};
use canvas_proto::protocol::Command;
use canvas_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::BroadcastMessage;

// ── DaemonEvent ───────────────────────────────────────────────────────────────

/// All inputs into the DaemonCore loop.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A fire-and-forget command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Authorization whose caller waits for the resolution.
    Authorize {
        redirect_url: String,
        reply: oneshot::Sender<anyhow::Result<Resolution>>,
    },
    /// Logout whose caller waits until the session is torn down.
    Logout {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Shutdown,
}

// ── DaemonCore ────────────────────────────────────────────────────────────────

pub struct DaemonCore {
    config: Config,
    pipeline: Arc<Pipeline>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl DaemonCore {
    pub fn new(
        config: Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> anyhow::Result<Self> {
        let pipeline = Arc::new(Pipeline::from_config(&config)?);
        Ok(Self::with_pipeline(config, pipeline, broadcast_tx))
    }

    pub fn with_pipeline(
        config: Config,
        pipeline: Arc<Pipeline>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            config,
            pipeline,
            broadcast_tx,
        }
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Pick up a credential persisted by an earlier run and, if configured,
    /// start a cycle right away.
    pub async fn resume_session(&self) {
        match self.pipeline.resolve_credential(None).await {
            Ok(resolution) if resolution.credential.is_some() => {
                info!("[core] Resumed stored session");
                if self.pipeline.refresh_on_credential() {
                    self.spawn_refresh();
                }
            }
            Ok(_) => info!("[core] No stored credential, waiting for authorization"),
            Err(e) => warn!("[core] Could not read stored credential: {}", e),
        }
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every sender is gone.
    pub async fn run(self, mut event_rx: mpsc::Receiver<DaemonEvent>) -> anyhow::Result<()> {
        info!("[core] Starting event loop");

        loop {
            match event_rx.recv().await {
                None => {
                    info!("[core] Event channel closed, shutting down");
                    break;
                }

                Some(DaemonEvent::Shutdown) => {
                    info!("[core] Shutdown requested");
                    break;
                }

                Some(DaemonEvent::ClientCommand(cmd)) => {
                    debug!("[core] Command {:?}", cmd);
                    if let Err(e) = self.handle_command(cmd).await {
                        error!("[core] Command error: {}", e);
                        let _ = self.broadcast_tx.send(BroadcastMessage::Error(e.to_string()));
                    }
                }

                Some(DaemonEvent::Authorize {
                    redirect_url,
                    reply,
                }) => {
                    let result = self.authorize(&redirect_url).await;
                    if let Err(e) = &result {
                        error!("[core] Authorization failed: {}", e);
                    }
                    let _ = reply.send(result);
                }

                Some(DaemonEvent::Logout { reply }) => {
                    let _ = reply.send(self.logout().await);
                }
            }
        }

        Ok(())
    }

    async fn handle_command(&self, cmd: Command) -> anyhow::Result<()> {
        match cmd {
            Command::Refresh => {
                if self.pipeline.snapshot().await.stage.is_running() {
                    debug!("[core] Refresh supersedes the running cycle");
                }
                self.spawn_refresh();
            }
            Command::Logout => self.logout().await?,
            Command::Authorize { redirect_url } => {
                self.authorize(&redirect_url).await?;
            }
            Command::GetState => {
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
        }
        Ok(())
    }

    async fn authorize(&self, redirect_url: &str) -> anyhow::Result<Resolution> {
        let resolution = self.pipeline.resolve_credential(Some(redirect_url)).await?;
        if resolution.credential.is_some() {
            info!("[core] Authorized via {:?}", resolution.source);
            if self.pipeline.refresh_on_credential() {
                self.spawn_refresh();
            }
        } else {
            warn!("[core] Redirect carried no access token");
        }
        Ok(resolution)
    }

    /// Tear the session down.  Clients are told where to go even when the
    /// credential file could not be removed.
    async fn logout(&self) -> anyhow::Result<()> {
        let result = self.pipeline.logout().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::LoggedOut {
            entry_point: self.config.auth.entry_point.clone(),
        });
        result
    }

    fn spawn_refresh(&self) {
        let pipeline = Arc::clone(&self.pipeline);
        tokio::spawn(async move {
            match pipeline.refresh().await {
                RefreshOutcome::NoCredential => debug!("[core] Refresh ignored while logged out"),
                RefreshOutcome::Settled {
                    generation,
                    reached,
                } => info!("[core] Cycle {} done, reached {:?}", generation, reached),
                RefreshOutcome::Superseded { generation } => {
                    debug!("[core] Cycle {} superseded", generation)
                }
            }
        });
    }
}

/// Turn every state revision into a `StateUpdated` push.
pub fn forward_state_changes(
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    let mut changes = state_manager.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                // Each push carries a full snapshot, so skipped revs are harmless
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let _ = broadcast_tx.send(BroadcastMessage::StateUpdated);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
