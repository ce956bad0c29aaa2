use serde::{Deserialize, Serialize};

use crate::descriptors::DescriptorSet;
use crate::image::ImageRef;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a presentation client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Start a new generation cycle (ignored while logged out).
    Refresh,
    /// Drop the credential and all pipeline state.
    Logout,
    /// Hand over the location the authorization redirect landed on.
    Authorize { redirect_url: String },
    GetState,
}

/// Messages sent from the daemon to presentation clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: SessionState,
    },
    State {
        data: SessionState,
    },
    /// The session was torn down; the client should go back to `entry_point`.
    LoggedOut {
        entry_point: String,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// One observable result slot.
///
/// `Idle` is "nothing this cycle" (not started, or skipped because an earlier
/// stage produced nothing); `Failed` carries the reason so a client can offer
/// a retry instead of waiting forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Slot<T> {
    Idle,
    Loading,
    Ready(T),
    Failed(String),
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::Idle
    }
}

impl<T> Slot<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Slot::Ready(_))
    }

    /// True for every state that shows no value.
    pub fn is_empty(&self) -> bool {
        !self.is_ready()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Slot::Failed(_))
    }
}

/// Where the current generation cycle is.
///
///   Idle -> FetchingHistory -> GeneratingDescriptors -> GeneratingImage -> Settled
///
/// Any failure jumps straight to Settled; partial completion is a valid end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    FetchingHistory,
    GeneratingDescriptors,
    GeneratingImage,
    Settled,
}

impl PipelineStage {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            PipelineStage::FetchingHistory
                | PipelineStage::GeneratingDescriptors
                | PipelineStage::GeneratingImage
        )
    }
}

/// Everything the presentation layer can observe.  `rev` increments on
/// every change; `generation` increments once per cycle (and on logout).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub rev: u64,
    #[serde(default)]
    pub generation: u64,
    pub authenticated: bool,
    pub stage: PipelineStage,
    pub recents: Slot<Vec<String>>,
    pub descriptors: Slot<DescriptorSet>,
    pub image: Slot<ImageRef>,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}
