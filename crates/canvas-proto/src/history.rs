//! Recently-played history client.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::credential::Credential;
use crate::error::FetchError;

/// One play, reduced to what the descriptor prompt needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayEvent {
    pub track_name: String,
    pub artist_names: Vec<String>,
}

impl PlayEvent {
    /// "<track> by <artist[, artist...]>"
    pub fn display(&self) -> String {
        format!("{} by {}", self.track_name, self.artist_names.join(", "))
    }
}

// Provider body: { items: [ { track: { name, artists: [ { name } ] } } ] }

#[derive(Debug, Deserialize)]
struct RecentlyPlayedResponse {
    items: Vec<PlayHistoryItem>,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: TrackObject,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    name: String,
    #[serde(default)]
    artists: Vec<ArtistObject>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: String,
}

impl From<PlayHistoryItem> for PlayEvent {
    fn from(item: PlayHistoryItem) -> Self {
        Self {
            track_name: item.track.name,
            artist_names: item.track.artists.into_iter().map(|a| a.name).collect(),
        }
    }
}

/// Parse a provider body into play events, preserving provider order.
pub fn parse_recently_played(body: &str) -> Result<Vec<PlayEvent>, FetchError> {
    let response: RecentlyPlayedResponse =
        serde_json::from_str(body).map_err(|e| FetchError::Transport(e.to_string()))?;
    Ok(response.items.into_iter().map(PlayEvent::from).collect())
}

/// First pipeline stage: credential in, display strings out.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn recents(&self, credential: &Credential) -> Result<Vec<String>, FetchError>;
}

pub struct HistoryFetcher {
    client: reqwest::Client,
    endpoint: String,
    limit: usize,
}

impl HistoryFetcher {
    pub fn new(config: &HistoryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            limit: config.limit,
        })
    }

    pub async fn fetch(&self, credential: &Credential) -> Result<Vec<PlayEvent>, FetchError> {
        debug!("[history] GET {} limit={}", self.endpoint, self.limit);

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("limit", self.limit)])
            .bearer_auth(credential.as_str())
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            warn!("[history] Provider returned {}", status);
            return Err(FetchError::ProviderStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        let events = parse_recently_played(&body)?;
        info!("[history] Fetched {} play events", events.len());
        Ok(events)
    }
}

#[async_trait]
impl HistorySource for HistoryFetcher {
    async fn recents(&self, credential: &Credential) -> Result<Vec<String>, FetchError> {
        let events = self.fetch(credential).await?;
        Ok(events.iter().map(PlayEvent::display).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_joins_artists() {
        let event = PlayEvent {
            track_name: "Song B".into(),
            artist_names: vec!["Artist Y".into(), "Artist Z".into()],
        };
        assert_eq!(event.display(), "Song B by Artist Y, Artist Z");
    }

    #[test]
    fn test_parse_preserves_provider_order() {
        let body = r#"{
            "items": [
                { "track": { "name": "Newest", "artists": [ { "name": "A" } ] }, "played_at": "2024-03-01T10:00:00Z" },
                { "track": { "name": "Older", "artists": [ { "name": "B" }, { "name": "C" } ] } }
            ],
            "next": null
        }"#;
        let events = parse_recently_played(body).unwrap();
        let shown: Vec<String> = events.iter().map(PlayEvent::display).collect();
        assert_eq!(shown, vec!["Newest by A", "Older by B, C"]);
    }

    #[test]
    fn test_parse_empty_items() {
        assert!(parse_recently_played(r#"{ "items": [] }"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_failure_is_transport() {
        let err = parse_recently_played("<html>oops</html>").unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }
}
