//! Six-descriptor generation from recent plays.
//!
//! The text model is asked for one adjective per slot, in slot order, as a
//! bracketed list of six double-quoted strings. Its free text is then scanned
//! for the first such list. Anything else is `GenerationError::MalformedOutput`.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::inference::InferenceClient;

pub const DESCRIPTOR_COUNT: usize = 6;

/// A bracketed list of exactly six double-quoted, comma-separated strings.
const DESCRIPTOR_LIST_PATTERN: &str =
    r#"\[\s*"[^"]*"\s*,\s*"[^"]*"\s*,\s*"[^"]*"\s*,\s*"[^"]*"\s*,\s*"[^"]*"\s*,\s*"[^"]*"\s*\]"#;

/// The fixed semantic slots, in the order the model must fill them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorSlot {
    Color,
    Texture,
    Taste,
    Smell,
    Vibe,
    Style,
}

impl DescriptorSlot {
    pub const ALL: [DescriptorSlot; DESCRIPTOR_COUNT] = [
        Self::Color,
        Self::Texture,
        Self::Taste,
        Self::Smell,
        Self::Vibe,
        Self::Style,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Color => "color",
            Self::Texture => "physical texture",
            Self::Taste => "taste",
            Self::Smell => "smell",
            Self::Vibe => "vibe",
            Self::Style => "style",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected 6 descriptors, got {0}")]
pub struct DescriptorCountError(pub usize);

/// Exactly six descriptors, position `i` answering `DescriptorSlot::ALL[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DescriptorSet([String; DESCRIPTOR_COUNT]);

impl DescriptorSet {
    pub fn get(&self, slot: DescriptorSlot) -> &str {
        &self.0[slot.index()]
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = (DescriptorSlot, &str)> {
        DescriptorSlot::ALL
            .iter()
            .copied()
            .zip(self.0.iter().map(String::as_str))
    }
}

impl TryFrom<Vec<String>> for DescriptorSet {
    type Error = DescriptorCountError;

    fn try_from(values: Vec<String>) -> Result<Self, Self::Error> {
        let len = values.len();
        let array: [String; DESCRIPTOR_COUNT] =
            values.try_into().map_err(|_| DescriptorCountError(len))?;
        Ok(Self(array))
    }
}

impl From<DescriptorSet> for Vec<String> {
    fn from(set: DescriptorSet) -> Self {
        set.0.into()
    }
}

/// The instruction sent to the text model for `recents`.
pub fn build_prompt(recents: &[String]) -> String {
    let labels: Vec<&str> = DescriptorSlot::ALL.iter().map(DescriptorSlot::label).collect();
    let slot_list = format!(
        "{}, and {}",
        labels[..DESCRIPTOR_COUNT - 1].join(", "),
        labels[DESCRIPTOR_COUNT - 1]
    );
    let format_example = format!("[\"{}\"]", labels.join("\", \""));

    format!(
        "Generate {count} adjectives that describe the {slots} of the sum of the following songs: \"{songs}\". \
You don't have to listen to the songs, just infer. \
Return only the {count} adjectives in the following format, including the brackets and the quotes, with no other commentary: {example}. \
Replace each of those {count} elements with the corresponding descriptor you assigned.",
        count = DESCRIPTOR_COUNT,
        slots = slot_list,
        songs = recents.join("\", \""),
        example = format_example,
    )
}

/// The part of `generated` the model actually wrote. Text-generation services
/// commonly echo the prompt (including its format example) before the answer.
pub fn continuation<'a>(prompt: &str, generated: &'a str) -> &'a str {
    generated.strip_prefix(prompt).unwrap_or(generated)
}

/// Pull the first bracketed six-string list out of `text`.
pub fn extract_descriptors(text: &str) -> Result<DescriptorSet, GenerationError> {
    let re = Regex::new(DESCRIPTOR_LIST_PATTERN)
        .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;

    let Some(found) = re.find(text) else {
        return Err(GenerationError::MalformedOutput(
            "no bracketed list of six strings in model output".into(),
        ));
    };

    let values: Vec<String> = serde_json::from_str(found.as_str())
        .map_err(|e| GenerationError::MalformedOutput(format!("unparseable list: {}", e)))?;

    let set = DescriptorSet::try_from(values)
        .map_err(|e| GenerationError::MalformedOutput(e.to_string()))?;

    // An echo we failed to strip leaves the prompt's format example first.
    if set.iter().all(|(slot, value)| value == slot.label()) {
        return Err(GenerationError::MalformedOutput(
            "model output repeats the format example".into(),
        ));
    }
    Ok(set)
}

/// Second pipeline stage: display strings in, six descriptors out.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn descriptors(&self, recents: &[String]) -> Result<DescriptorSet, GenerationError>;
}

pub struct DescriptorGenerator {
    inference: InferenceClient,
    model_url: String,
}

impl DescriptorGenerator {
    pub fn new(inference: InferenceClient, model_url: impl Into<String>) -> Self {
        Self {
            inference,
            model_url: model_url.into(),
        }
    }
}

#[async_trait]
impl DescriptorSource for DescriptorGenerator {
    async fn descriptors(&self, recents: &[String]) -> Result<DescriptorSet, GenerationError> {
        let prompt = build_prompt(recents);
        let generated = self.inference.generate_text(&self.model_url, &prompt).await?;
        debug!("[descriptors] Generated text: {}", generated);

        match extract_descriptors(continuation(&prompt, &generated)) {
            Ok(set) => {
                info!("[descriptors] Extracted {:?}", set.as_slice());
                Ok(set)
            }
            Err(e) => {
                warn!("[descriptors] {}", e);
                Err(e)
            }
        }
    }
}
