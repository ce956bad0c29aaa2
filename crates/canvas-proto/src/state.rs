//! Session state owner.
//!
//! Every write made on behalf of a generation cycle carries that cycle's
//! `generation`. Writes from an older cycle are dropped, so overlapping
//! refreshes never mix results: the newest cycle always wins.

use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::descriptors::DescriptorSet;
use crate::image::{ImageHandle, ImageRef};
use crate::protocol::{PipelineStage, SessionState, Slot};

/// Outcome of a generation-tagged write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWrite {
    Applied,
    /// The cycle was superseded by a newer refresh or a logout.
    Stale,
}

impl SlotWrite {
    pub fn is_applied(&self) -> bool {
        matches!(self, SlotWrite::Applied)
    }
}

pub struct StateManager {
    state: Arc<RwLock<SessionState>>,
    changes: broadcast::Sender<u64>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            changes,
        }
    }

    /// Receives the new `rev` after every change.
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    pub async fn get_state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    pub async fn set_authenticated(&self, authenticated: bool) {
        let mut state = self.state.write().await;
        if state.authenticated == authenticated {
            return;
        }
        state.authenticated = authenticated;
        self.bump(&mut state);
    }

    /// Open a new cycle: all three slots go back to empty before any network
    /// call is made. Returns the cycle's generation and the image handle that
    /// was on display, which the caller must release.
    ///
    /// Returns `None` while logged out, so a cycle can never start after a
    /// teardown it raced with.
    pub async fn begin_cycle(&self) -> Option<(u64, Option<ImageHandle>)> {
        let mut state = self.state.write().await;
        if !state.authenticated {
            debug!("[state] Not authenticated, no cycle started");
            return None;
        }
        state.generation += 1;
        let previous = Self::reset_slots(&mut state);
        state.stage = PipelineStage::Idle;
        let generation = state.generation;
        self.bump(&mut state);
        debug!("[state] Cycle {} started", generation);
        Some((generation, previous))
    }

    /// Enter `stage`, marking the slot it fills as loading.
    pub async fn enter_stage(&self, generation: u64, stage: PipelineStage) -> SlotWrite {
        self.apply(generation, |state| {
            state.stage = stage;
            match stage {
                PipelineStage::FetchingHistory => state.recents = Slot::Loading,
                PipelineStage::GeneratingDescriptors => state.descriptors = Slot::Loading,
                PipelineStage::GeneratingImage => state.image = Slot::Loading,
                PipelineStage::Idle | PipelineStage::Settled => {}
            }
        })
        .await
    }

    pub async fn set_recents(&self, generation: u64, recents: Slot<Vec<String>>) -> SlotWrite {
        self.apply(generation, |state| state.recents = recents).await
    }

    pub async fn set_descriptors(
        &self,
        generation: u64,
        descriptors: Slot<DescriptorSet>,
    ) -> SlotWrite {
        self.apply(generation, |state| state.descriptors = descriptors)
            .await
    }

    /// Returns the handle this write displaced, if any, alongside the outcome.
    pub async fn set_image(
        &self,
        generation: u64,
        image: Slot<ImageRef>,
    ) -> (SlotWrite, Option<ImageHandle>) {
        let mut displaced = None;
        let write = self
            .apply(generation, |state| {
                if let Slot::Ready(previous) = &state.image {
                    let keeps_same = matches!(&image, Slot::Ready(next) if next.handle == previous.handle);
                    if !keeps_same {
                        displaced = Some(previous.handle);
                    }
                }
                state.image = image;
            })
            .await;
        (write, displaced)
    }

    pub async fn settle(&self, generation: u64) -> SlotWrite {
        self.apply(generation, |state| state.stage = PipelineStage::Settled)
            .await
    }

    /// Back to the pre-authentication state. Bumps the generation so any
    /// in-flight cycle is discarded. Returns the image handle to release.
    pub async fn teardown(&self) -> Option<ImageHandle> {
        let mut state = self.state.write().await;
        state.generation += 1;
        let previous = Self::reset_slots(&mut state);
        state.stage = PipelineStage::Idle;
        state.authenticated = false;
        self.bump(&mut state);
        previous
    }

    async fn apply<F>(&self, generation: u64, mutate: F) -> SlotWrite
    where
        F: FnOnce(&mut SessionState),
    {
        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!(
                "[state] Dropping write from stale cycle {} (current {})",
                generation, state.generation
            );
            return SlotWrite::Stale;
        }
        mutate(&mut state);
        self.bump(&mut state);
        SlotWrite::Applied
    }

    fn reset_slots(state: &mut SessionState) -> Option<ImageHandle> {
        let previous = match &state.image {
            Slot::Ready(image) => Some(image.handle),
            _ => None,
        };
        state.recents = Slot::Idle;
        state.descriptors = Slot::Idle;
        state.image = Slot::Idle;
        previous
    }

    fn bump(&self, state: &mut SessionState) {
        state.rev += 1;
        // No subscribers is fine.
        let _ = self.changes.send(state.rev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_ref(id: u64) -> ImageRef {
        ImageRef {
            handle: ImageHandle(id),
            url: format!("/api/image/{}", id),
            content_type: "image/png".into(),
            size: 4,
        }
    }

    #[tokio::test]
    async fn test_begin_cycle_resets_slots_and_returns_previous_image() {
        let sm = StateManager::new();
        sm.set_authenticated(true).await;
        let (g1, prev) = sm.begin_cycle().await.unwrap();
        assert_eq!(prev, None);
        sm.set_recents(g1, Slot::Ready(vec!["a by b".into()])).await;
        sm.set_image(g1, Slot::Ready(image_ref(7))).await;

        let (g2, prev) = sm.begin_cycle().await.unwrap();
        assert_eq!(g2, g1 + 1);
        assert_eq!(prev, Some(ImageHandle(7)));
        let state = sm.get_state().await;
        assert_eq!(state.recents, Slot::Idle);
        assert_eq!(state.descriptors, Slot::Idle);
        assert_eq!(state.image, Slot::Idle);
    }

    #[tokio::test]
    async fn test_stale_generation_writes_are_dropped() {
        let sm = StateManager::new();
        sm.set_authenticated(true).await;
        let (old, _) = sm.begin_cycle().await.unwrap();
        let (new, _) = sm.begin_cycle().await.unwrap();

        assert_eq!(
            sm.set_recents(old, Slot::Ready(vec!["stale".into()])).await,
            SlotWrite::Stale
        );
        assert!(sm.set_recents(new, Slot::Ready(vec!["fresh".into()])).await.is_applied());
        assert_eq!(
            sm.get_state().await.recents,
            Slot::Ready(vec!["fresh".to_string()])
        );
    }

    #[tokio::test]
    async fn test_enter_stage_marks_slot_loading() {
        let sm = StateManager::new();
        sm.set_authenticated(true).await;
        let (g, _) = sm.begin_cycle().await.unwrap();
        sm.enter_stage(g, PipelineStage::GeneratingDescriptors).await;
        let state = sm.get_state().await;
        assert_eq!(state.stage, PipelineStage::GeneratingDescriptors);
        assert_eq!(state.descriptors, Slot::Loading);
        assert_eq!(state.recents, Slot::Idle);
    }

    #[tokio::test]
    async fn test_set_image_reports_displaced_handle() {
        let sm = StateManager::new();
        sm.set_authenticated(true).await;
        let (g, _) = sm.begin_cycle().await.unwrap();
        let (write, displaced) = sm.set_image(g, Slot::Ready(image_ref(1))).await;
        assert!(write.is_applied());
        assert_eq!(displaced, None);

        let (_, displaced) = sm.set_image(g, Slot::Ready(image_ref(2))).await;
        assert_eq!(displaced, Some(ImageHandle(1)));

        let (_, displaced) = sm.set_image(g, Slot::Ready(image_ref(2))).await;
        assert_eq!(displaced, None);
    }

    #[tokio::test]
    async fn test_teardown_invalidates_in_flight_cycle() {
        let sm = StateManager::new();
        sm.set_authenticated(true).await;
        let (g, _) = sm.begin_cycle().await.unwrap();
        sm.set_image(g, Slot::Ready(image_ref(3))).await;

        assert_eq!(sm.teardown().await, Some(ImageHandle(3)));
        let state = sm.get_state().await;
        assert!(!state.authenticated);
        assert_eq!(state.image, Slot::Idle);
        assert_eq!(sm.settle(g).await, SlotWrite::Stale);
    }

    #[tokio::test]
    async fn test_no_cycle_starts_after_teardown() {
        let sm = StateManager::new();
        assert_eq!(sm.begin_cycle().await, None);

        sm.set_authenticated(true).await;
        let (g, _) = sm.begin_cycle().await.unwrap();
        sm.teardown().await;

        assert_eq!(sm.begin_cycle().await, None);
        let state = sm.get_state().await;
        assert_eq!(state.generation, g + 1);
        assert_eq!(state.stage, PipelineStage::Idle);
    }

    #[tokio::test]
    async fn test_every_change_bumps_rev_and_notifies() {
        let sm = StateManager::new();
        let mut rx = sm.subscribe();
        sm.set_authenticated(true).await;
        sm.set_authenticated(true).await; // unchanged, no bump
        let (g, _) = sm.begin_cycle().await.unwrap();
        sm.settle(g).await;

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
        assert_eq!(rx.recv().await.unwrap(), 3);
        assert_eq!(sm.get_state().await.rev, 3);
    }
}
