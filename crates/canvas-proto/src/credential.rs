//! Bearer credential capture and persistence.
//!
//! The authorization redirect deposits `access_token` in the URL fragment.
//! It is captured once, written to the credential file, and the caller gets
//! back the same location with the fragment removed so it is never parsed
//! again or leaked through a copied URL.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

const TOKEN_KEY: &str = "access_token";

/// An opaque bearer string. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

/// Where `resolve` found the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Storage,
    Fragment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub credential: Option<Credential>,
    pub source: Option<CredentialSource>,
    /// The location to show after a fragment capture (fragment removed).
    /// `None` when the visible location should be left alone.
    pub location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCredential {
    access_token: String,
}

/// Extract `access_token` from a URL fragment.
///
/// Accepts a full URL (`https://host/#access_token=..&token_type=..`) or a bare
/// fragment with or without the leading `#`. Pairs are split on `&` and `=`
/// only; no percent-decoding is applied.
pub fn parse_fragment(url: &str) -> Option<Credential> {
    let fragment = match url.split_once('#') {
        Some((_, fragment)) => fragment,
        None if url.contains("://") => return None,
        None => url,
    };

    fragment
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == TOKEN_KEY)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(Credential::new)
}

/// `url` without its fragment.
pub fn strip_fragment(url: &str) -> String {
    match url.split_once('#') {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

/// Holds the single active credential of the session and its on-disk copy.
pub struct CredentialStore {
    path: PathBuf,
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            current: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Storage first, then the redirect fragment. A fragment capture is
    /// persisted before returning.
    pub async fn resolve(&self, redirect_url: Option<&str>) -> anyhow::Result<Resolution> {
        if let Some(stored) = self.load().await {
            info!("[credential] Using stored credential from {:?}", self.path);
            *self.current.write().await = Some(stored.clone());
            return Ok(Resolution {
                credential: Some(stored),
                source: Some(CredentialSource::Storage),
                location: None,
            });
        }

        let captured = redirect_url.and_then(parse_fragment);
        match captured {
            Some(credential) => {
                self.persist(&credential).await?;
                info!("[credential] Captured credential from redirect fragment");
                *self.current.write().await = Some(credential.clone());
                Ok(Resolution {
                    credential: Some(credential),
                    source: Some(CredentialSource::Fragment),
                    location: redirect_url.map(strip_fragment),
                })
            }
            None => {
                *self.current.write().await = None;
                Ok(Resolution {
                    credential: None,
                    source: None,
                    location: None,
                })
            }
        }
    }

    /// Forget the credential in memory and on disk.
    pub async fn clear(&self) -> anyhow::Result<()> {
        *self.current.write().await = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("[credential] Removed {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, credential: &Credential) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stored = StoredCredential {
            access_token: credential.as_str().to_string(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn load(&self) -> Option<Credential> {
        let content = tokio::fs::read_to_string(&self.path).await.ok()?;
        match serde_json::from_str::<StoredCredential>(&content) {
            Ok(stored) if !stored.access_token.trim().is_empty() => {
                Some(Credential::new(stored.access_token.trim()))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("[credential] Ignoring unreadable {:?}: {}", self.path, e);
                None
            }
        }
    }
}
