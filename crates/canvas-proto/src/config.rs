use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where the bearer credential is persisted between runs.
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// The one browser origin allowed to call the API cross-origin. Empty
    /// means same-origin only.
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
}

/// Where the presentation layer sends the user to log in, and where it lands
/// after logging out. The redirect handshake itself happens elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_login_url")]
    pub login_url: String,
    #[serde(default = "default_entry_point")]
    pub entry_point: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// "Recently played" endpoint of the history provider.
    #[serde(default = "default_history_endpoint")]
    pub endpoint: String,
    /// Number of play events requested per refresh.
    #[serde(default = "default_history_limit")]
    pub limit: usize,
    #[serde(default = "default_history_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_text_model_url")]
    pub text_model_url: String,
    #[serde(default = "default_image_model_url")]
    pub image_model_url: String,
    /// Service token. When empty, `token_env` is consulted instead.
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_models_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Start a cycle automatically as soon as a credential becomes available.
    #[serde(default = "default_true")]
    pub refresh_on_credential: bool,
    /// Keep generating when the provider answers successfully with no plays.
    #[serde(default = "default_true")]
    pub generate_on_empty_history: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            credential_file: default_credential_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
            allowed_origin: default_allowed_origin(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_url: default_login_url(),
            entry_point: default_entry_point(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_history_endpoint(),
            limit: default_history_limit(),
            timeout_secs: default_history_timeout_secs(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            text_model_url: default_text_model_url(),
            image_model_url: default_image_model_url(),
            token: String::new(),
            token_env: default_token_env(),
            timeout_secs: default_models_timeout_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            refresh_on_credential: true,
            generate_on_empty_history: true,
        }
    }
}

impl ModelsConfig {
    /// The service token for both generative models: the literal `token` if
    /// set, otherwise the value of the `token_env` environment variable.
    pub fn resolve_token(&self) -> Option<String> {
        let literal = self.token.trim();
        if !literal.is_empty() {
            return Some(literal.to_string());
        }
        std::env::var(&self.token_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

fn default_credential_file() -> PathBuf {
    platform::data_dir().join("credential.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_allowed_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_login_url() -> String {
    "/api/auth-login".to_string()
}

fn default_entry_point() -> String {
    "/".to_string()
}

fn default_history_endpoint() -> String {
    "https://api.spotify.com/v1/me/player/recently-played".to_string()
}

fn default_history_limit() -> usize {
    20
}

fn default_history_timeout_secs() -> u64 {
    15
}

fn default_text_model_url() -> String {
    "https://api-inference.huggingface.co/models/mistralai/Mixtral-8x7B-Instruct-v0.1".to_string()
}

fn default_image_model_url() -> String {
    "https://api-inference.huggingface.co/models/runwayml/stable-diffusion-v1-5".to_string()
}

fn default_token_env() -> String {
    "HF_TOKEN".to_string()
}

fn default_models_timeout_secs() -> u64 {
    120
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing a default config there first if it is missing.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
