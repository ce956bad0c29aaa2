//! Shared core of the listening canvas: turns recent plays into six
//! descriptors and an abstract image, and describes the resulting session
//! state to presentation clients.

pub mod config;
pub mod credential;
pub mod descriptors;
pub mod error;
pub mod history;
pub mod image;
pub mod inference;
pub mod pipeline;
pub mod platform;
pub mod protocol;
pub mod state;
