use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use canvas_proto::config::PipelineConfig;
use canvas_proto::credential::{Credential, CredentialStore};
use canvas_proto::descriptors::{DescriptorSet, DescriptorSource};
use canvas_proto::error::{FetchError, GenerationError};
use canvas_proto::history::HistorySource;
use canvas_proto::image::ImageSource;
use canvas_proto::inference::ImageBytes;
use canvas_proto::pipeline::{Pipeline, Reached, RefreshOutcome};
use canvas_proto::protocol::{PipelineStage, Slot};
use canvas_proto::state::StateManager;
use tokio::sync::Notify;

// ── fakes ─────────────────────────────────────────────────────────────────────

type HistoryReply = Result<Vec<String>, FetchError>;

/// Replies in order; an optional gate holds the first call until notified.
#[derive(Default)]
struct FakeHistory {
    replies: Mutex<VecDeque<HistoryReply>>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    seen_tokens: Mutex<Vec<String>>,
    /// Snapshot of the slots at the moment the network call is made.
    observe: OnceLock<Arc<StateManager>>,
    observed_empty: Mutex<Vec<bool>>,
}

impl FakeHistory {
    fn replying(replies: Vec<HistoryReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn recents(&self, credential: &Credential) -> Result<Vec<String>, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_tokens
            .lock()
            .unwrap()
            .push(credential.as_str().to_string());
        if let Some(state) = self.observe.get() {
            let s = state.get_state().await;
            self.observed_empty.lock().unwrap().push(
                s.recents.is_empty() && s.descriptors.is_empty() && s.image.is_empty(),
            );
        }
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()));
        if call == 0 {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }
        reply
    }
}

struct FakeDescriptors {
    reply: Mutex<Option<Result<DescriptorSet, GenerationError>>>,
    calls: AtomicUsize,
    inputs: Mutex<Vec<Vec<String>>>,
}

impl FakeDescriptors {
    fn ok(values: [&str; 6]) -> Self {
        Self::replying(Ok(descriptor_set(values)))
    }

    fn replying(reply: Result<DescriptorSet, GenerationError>) -> Self {
        Self {
            reply: Mutex::new(Some(reply)),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DescriptorSource for FakeDescriptors {
    async fn descriptors(&self, recents: &[String]) -> Result<DescriptorSet, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(recents.to_vec());
        let reply = self.reply.lock().unwrap().clone();
        reply.unwrap_or_else(|| Err(GenerationError::Transport("no reply".into())))
    }
}

struct FakeImage {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeImage {
    fn ok() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageSource for FakeImage {
    async fn image(&self, _descriptors: &DescriptorSet) -> Result<ImageBytes, GenerationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GenerationError::Decode("response is not an image".into()));
        }
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.push(n as u8);
        Ok(ImageBytes {
            data: data.into(),
            content_type: "image/png".into(),
        })
    }
}

fn descriptor_set(values: [&str; 6]) -> DescriptorSet {
    DescriptorSet::try_from(values.iter().map(|s| s.to_string()).collect::<Vec<_>>()).unwrap()
}

fn scenario_recents() -> Vec<String> {
    vec![
        "Song A by Artist X".to_string(),
        "Song B by Artist Y, Artist Z".to_string(),
        "Song C by Artist X".to_string(),
    ]
}

const SCENARIO_DESCRIPTORS: [&str; 6] =
    ["red", "smooth", "sweet", "floral", "energetic", "minimalist"];

struct Harness {
    pipeline: Arc<Pipeline>,
    history: Arc<FakeHistory>,
    descriptors: Arc<FakeDescriptors>,
    image: Arc<FakeImage>,
    _dir: tempfile::TempDir,
}

async fn harness(
    history: FakeHistory,
    descriptors: FakeDescriptors,
    image: FakeImage,
    config: PipelineConfig,
    logged_in: bool,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let history = Arc::new(history);
    let descriptors = Arc::new(descriptors);
    let image = Arc::new(image);
    let pipeline = Arc::new(Pipeline::new(
        CredentialStore::new(dir.path().join("credential.json")),
        history.clone(),
        descriptors.clone(),
        image.clone(),
        config,
    ));
    let _ = history.observe.set(pipeline.state_manager());
    let redirect = logged_in.then_some("http://localhost/#access_token=user-token&token_type=Bearer");
    pipeline.resolve_credential(redirect).await.unwrap();
    Harness {
        pipeline,
        history,
        descriptors,
        image,
        _dir: dir,
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_cycle_populates_all_three_slots() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Image,
            ..
        }
    ));

    let state = h.pipeline.snapshot().await;
    assert!(state.authenticated);
    assert_eq!(state.stage, PipelineStage::Settled);
    assert_eq!(state.recents, Slot::Ready(scenario_recents()));
    assert_eq!(
        state.descriptors,
        Slot::Ready(descriptor_set(SCENARIO_DESCRIPTORS))
    );
    let image = state.image.value().expect("image slot populated");
    assert_eq!(image.content_type, "image/png");
    assert!(h.pipeline.image_store().get(image.handle).await.is_some());

    assert_eq!(h.history.seen_tokens.lock().unwrap().as_slice(), ["user-token"]);
    assert_eq!(
        h.descriptors.inputs.lock().unwrap().as_slice(),
        [scenario_recents()]
    );
}

#[tokio::test]
async fn provider_401_leaves_downstream_idle() {
    let h = harness(
        FakeHistory::replying(vec![Err(FetchError::ProviderStatus(401))]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Nothing,
            ..
        }
    ));

    let state = h.pipeline.snapshot().await;
    assert!(state.recents.is_failed());
    assert!(state.recents.value().is_none());
    assert_eq!(state.descriptors, Slot::Idle);
    assert_eq!(state.image, Slot::Idle);
    assert_eq!(state.stage, PipelineStage::Settled);
    assert_eq!(h.descriptors.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn refresh_resets_slots_before_first_network_call() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents()), Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    h.pipeline.refresh().await;
    assert!(h.pipeline.snapshot().await.image.is_ready());
    h.pipeline.refresh().await;

    assert_eq!(
        h.history.observed_empty.lock().unwrap().as_slice(),
        [true, true]
    );
}

#[tokio::test]
async fn refresh_releases_superseded_image_only() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents()), Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;
    let store = h.pipeline.image_store();

    h.pipeline.refresh().await;
    let first = h.pipeline.snapshot().await.image.value().unwrap().handle;
    h.pipeline.refresh().await;
    let second = h.pipeline.snapshot().await.image.value().unwrap().handle;

    assert_ne!(first, second);
    assert!(store.get(first).await.is_none());
    assert!(store.get(second).await.is_some());
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn empty_history_still_generates_by_default() {
    let h = harness(
        FakeHistory::replying(vec![Ok(Vec::new())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Image,
            ..
        }
    ));
    let state = h.pipeline.snapshot().await;
    assert_eq!(state.recents, Slot::Ready(Vec::new()));
    assert_eq!(h.descriptors.inputs.lock().unwrap().as_slice(), [Vec::<String>::new()]);
    assert!(state.image.is_ready());
}

#[tokio::test]
async fn empty_history_can_stop_the_cycle() {
    let config = PipelineConfig {
        generate_on_empty_history: false,
        ..PipelineConfig::default()
    };
    let h = harness(
        FakeHistory::replying(vec![Ok(Vec::new())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        config,
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Recents,
            ..
        }
    ));
    assert_eq!(h.descriptors.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.pipeline.snapshot().await.descriptors, Slot::Idle);
}

#[tokio::test]
async fn malformed_descriptors_skip_image() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents())]),
        FakeDescriptors::replying(Err(GenerationError::MalformedOutput(
            "no bracketed list of six strings in model output".into(),
        ))),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Recents,
            ..
        }
    ));
    let state = h.pipeline.snapshot().await;
    assert!(state.recents.is_ready());
    assert!(state.descriptors.is_failed());
    assert_eq!(state.image, Slot::Idle);
    assert_eq!(h.image.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn image_failure_keeps_earlier_slots() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::failing(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let outcome = h.pipeline.refresh().await;
    assert!(matches!(
        outcome,
        RefreshOutcome::Settled {
            reached: Reached::Descriptors,
            ..
        }
    ));
    let state = h.pipeline.snapshot().await;
    assert!(state.descriptors.is_ready());
    assert!(state.image.is_failed());
    assert!(h.pipeline.image_store().is_empty().await);
}

#[tokio::test]
async fn logged_out_refresh_makes_no_calls() {
    let h = harness(
        FakeHistory::default(),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        false,
    )
    .await;

    assert_eq!(h.pipeline.refresh().await, RefreshOutcome::NoCredential);
    assert_eq!(h.history.calls.load(Ordering::SeqCst), 0);
    let state = h.pipeline.snapshot().await;
    assert!(!state.authenticated);
    assert_eq!(state.stage, PipelineStage::Idle);
}

#[tokio::test]
async fn logout_clears_credential_and_state() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;
    h.pipeline.refresh().await;
    let credential_path = h.pipeline.credentials().path().to_path_buf();
    assert!(credential_path.exists());

    h.pipeline.logout().await.unwrap();

    assert!(!credential_path.exists());
    let state = h.pipeline.snapshot().await;
    assert!(!state.authenticated);
    assert_eq!(state.recents, Slot::Idle);
    assert_eq!(state.image, Slot::Idle);
    assert!(h.pipeline.image_store().is_empty().await);

    let resolution = h.pipeline.resolve_credential(None).await.unwrap();
    assert!(resolution.credential.is_none());
    assert_eq!(h.pipeline.refresh().await, RefreshOutcome::NoCredential);
}

#[tokio::test]
async fn overlapping_refresh_keeps_only_newest_cycle() {
    let gate = Arc::new(Notify::new());
    let history = FakeHistory {
        replies: Mutex::new(
            vec![
                Ok(vec!["Old Song by Old Artist".to_string()]),
                Ok(scenario_recents()),
            ]
            .into(),
        ),
        gate: Some(gate.clone()),
        ..Default::default()
    };
    let h = harness(
        history,
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;

    let first = tokio::spawn({
        let pipeline = h.pipeline.clone();
        async move { pipeline.refresh().await }
    });
    // Wait until the first cycle is parked inside the history call.
    while h.history.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    let second = h.pipeline.refresh().await;
    assert!(matches!(
        second,
        RefreshOutcome::Settled {
            reached: Reached::Image,
            ..
        }
    ));

    gate.notify_one();
    let first = first.await.unwrap();
    assert!(matches!(first, RefreshOutcome::Superseded { .. }));

    let state = h.pipeline.snapshot().await;
    assert_eq!(state.recents, Slot::Ready(scenario_recents()));
    assert_eq!(h.descriptors.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.pipeline.image_store().len().await, 1);
}

#[tokio::test]
async fn refresh_after_teardown_starts_no_cycle() {
    let h = harness(
        FakeHistory::replying(vec![Ok(scenario_recents())]),
        FakeDescriptors::ok(SCENARIO_DESCRIPTORS),
        FakeImage::ok(),
        PipelineConfig::default(),
        true,
    )
    .await;
    // The session is torn down while the credential is still readable, as
    // when a logout lands between reading the credential and opening a cycle.
    let state_manager = h.pipeline.state_manager();
    state_manager.teardown().await;
    let generation = state_manager.get_state().await.generation;

    assert_eq!(h.pipeline.refresh().await, RefreshOutcome::NoCredential);

    let state = h.pipeline.snapshot().await;
    assert!(!state.authenticated);
    assert_eq!(state.generation, generation);
    assert_eq!(state.recents, Slot::Idle);
    assert_eq!(h.history.calls.load(Ordering::SeqCst), 0);
}
