//! Pipeline — one listening session, from credential to generated image.
//!
//! A refresh runs the three stages strictly in sequence, because each stage
//! consumes the previous stage's output:
//!
//!   credential -> recents -> descriptors -> image
//!
//! Every stage reports failure by leaving its slot `Failed`; nothing escapes
//! `refresh`.  Overlapping refreshes are allowed: each cycle is tagged with a
//! generation and the state manager drops writes from superseded cycles.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{Config, PipelineConfig};
use crate::credential::{CredentialStore, Resolution};
use crate::descriptors::{DescriptorGenerator, DescriptorSource};
use crate::history::{HistoryFetcher, HistorySource};
use crate::image::{ImageGenerator, ImageSource, ImageStore};
use crate::inference::InferenceClient;
use crate::protocol::{PipelineStage, SessionState, Slot};
use crate::state::StateManager;

/// How a refresh ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Logged out: nothing was fetched.
    NoCredential,
    /// The cycle ran to its end; `reached` is the last stage that produced a value.
    Settled { generation: u64, reached: Reached },
    /// A newer refresh or a logout took over mid-cycle.
    Superseded { generation: u64 },
}

/// The furthest slot a settled cycle populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reached {
    Nothing,
    Recents,
    Descriptors,
    Image,
}

pub struct Pipeline {
    credentials: CredentialStore,
    state: Arc<StateManager>,
    images: Arc<ImageStore>,
    history: Arc<dyn HistorySource>,
    descriptors: Arc<dyn DescriptorSource>,
    image: Arc<dyn ImageSource>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        credentials: CredentialStore,
        history: Arc<dyn HistorySource>,
        descriptors: Arc<dyn DescriptorSource>,
        image: Arc<dyn ImageSource>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            credentials,
            state: Arc::new(StateManager::new()),
            images: Arc::new(ImageStore::new()),
            history,
            descriptors,
            image,
            config,
        }
    }

    /// Wire up the real HTTP-backed stages from `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let inference = InferenceClient::new(&config.models)?;
        Ok(Self::new(
            CredentialStore::new(config.daemon.credential_file.clone()),
            Arc::new(HistoryFetcher::new(&config.history)?),
            Arc::new(DescriptorGenerator::new(
                inference.clone(),
                config.models.text_model_url.clone(),
            )),
            Arc::new(ImageGenerator::new(
                inference,
                config.models.image_model_url.clone(),
            )),
            config.pipeline.clone(),
        ))
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    pub fn image_store(&self) -> Arc<ImageStore> {
        Arc::clone(&self.images)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn refresh_on_credential(&self) -> bool {
        self.config.refresh_on_credential
    }

    pub async fn snapshot(&self) -> SessionState {
        self.state.get_state().await
    }

    /// Resolve the credential (storage first, then `redirect_url`'s fragment)
    /// and publish the authenticated flag.
    pub async fn resolve_credential(
        &self,
        redirect_url: Option<&str>,
    ) -> anyhow::Result<Resolution> {
        let resolution = self.credentials.resolve(redirect_url).await?;
        self.state
            .set_authenticated(resolution.credential.is_some())
            .await;
        Ok(resolution)
    }

    /// Run one generation cycle.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Some(credential) = self.credentials.current().await else {
            info!("[pipeline] No credential available, refresh skipped");
            return RefreshOutcome::NoCredential;
        };

        // A logout may have landed since the credential was read.
        let Some((generation, previous)) = self.state.begin_cycle().await else {
            info!("[pipeline] Logged out before the cycle began, refresh skipped");
            return RefreshOutcome::NoCredential;
        };
        if let Some(handle) = previous {
            self.images.release(handle).await;
        }
        info!("[pipeline] Cycle {} started", generation);

        // ── history ─────────────────────────────────────────────────────────
        if !self
            .state
            .enter_stage(generation, PipelineStage::FetchingHistory)
            .await
            .is_applied()
        {
            return RefreshOutcome::Superseded { generation };
        }

        let recents = match self.history.recents(&credential).await {
            Ok(recents) => recents,
            Err(e) => {
                warn!("[pipeline] Cycle {}: history failed: {}", generation, e);
                self.state
                    .set_recents(generation, Slot::Failed(e.to_string()))
                    .await;
                return self.settle(generation, Reached::Nothing).await;
            }
        };

        let no_plays = recents.is_empty();
        if !self
            .state
            .set_recents(generation, Slot::Ready(recents.clone()))
            .await
            .is_applied()
        {
            return RefreshOutcome::Superseded { generation };
        }
        if no_plays && !self.config.generate_on_empty_history {
            info!("[pipeline] Cycle {}: no recent plays, stopping", generation);
            return self.settle(generation, Reached::Recents).await;
        }

        // ── descriptors ─────────────────────────────────────────────────────
        if !self
            .state
            .enter_stage(generation, PipelineStage::GeneratingDescriptors)
            .await
            .is_applied()
        {
            return RefreshOutcome::Superseded { generation };
        }

        let descriptors = match self.descriptors.descriptors(&recents).await {
            Ok(set) => set,
            Err(e) => {
                warn!("[pipeline] Cycle {}: descriptors failed: {}", generation, e);
                self.state
                    .set_descriptors(generation, Slot::Failed(e.to_string()))
                    .await;
                return self.settle(generation, Reached::Recents).await;
            }
        };

        if !self
            .state
            .set_descriptors(generation, Slot::Ready(descriptors.clone()))
            .await
            .is_applied()
        {
            return RefreshOutcome::Superseded { generation };
        }

        // ── image ───────────────────────────────────────────────────────────
        if !self
            .state
            .enter_stage(generation, PipelineStage::GeneratingImage)
            .await
            .is_applied()
        {
            return RefreshOutcome::Superseded { generation };
        }

        let image_ref = match self.image.image(&descriptors).await {
            Ok(bytes) => self.images.insert(bytes).await,
            Err(e) => {
                warn!("[pipeline] Cycle {}: image failed: {}", generation, e);
                self.state
                    .set_image(generation, Slot::Failed(e.to_string()))
                    .await;
                return self.settle(generation, Reached::Descriptors).await;
            }
        };

        let handle = image_ref.handle;
        let (write, displaced) = self
            .state
            .set_image(generation, Slot::Ready(image_ref))
            .await;
        if let Some(old) = displaced {
            self.images.release(old).await;
        }
        if !write.is_applied() {
            // Nobody will ever display it.
            self.images.release(handle).await;
            return RefreshOutcome::Superseded { generation };
        }

        self.settle(generation, Reached::Image).await
    }

    /// Forget the credential and every result. In-flight cycles are discarded.
    pub async fn logout(&self) -> anyhow::Result<()> {
        let cleared = self.credentials.clear().await;
        if let Some(handle) = self.state.teardown().await {
            self.images.release(handle).await;
        }
        info!("[pipeline] Logged out");
        cleared
    }

    async fn settle(&self, generation: u64, reached: Reached) -> RefreshOutcome {
        if self.state.settle(generation).await.is_applied() {
            info!("[pipeline] Cycle {} settled at {:?}", generation, reached);
            RefreshOutcome::Settled { generation, reached }
        } else {
            RefreshOutcome::Superseded { generation }
        }
    }
}
