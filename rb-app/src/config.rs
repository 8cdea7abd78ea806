//! Relaybot configuration loader.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a friendly assistant chatting over WhatsApp.
Reply with a JSON object of the form {"messages": [{"content": "...", "type": "text"}]}.
Split longer answers into several short messages, in the order they should be sent.
Use "type": "audio" only for a message that should be spoken as a voice note."#;

#[derive(Debug, Clone, Deserialize)]
pub struct RelaybotConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
    pub elevenlabs_api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Token Meta echoes back during the webhook subscription handshake.
    #[serde(default)]
    pub verify_token: String,
    /// When set, inbound webhooks must carry a valid `x-hub-signature-256`.
    #[serde(default)]
    pub app_secret: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElevenLabsConfig {
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    #[serde(default = "default_quiet_window_ms")]
    pub quiet_window_ms: u64,
}

fn default_quiet_window_ms() -> u64 {
    15_000
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_window_ms: default_quiet_window_ms(),
        }
    }
}

impl DebounceConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: String,
    /// Turns sent to the model per reply, most recent kept.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
}

fn default_history_path() -> String {
    "~/.relaybot/history.db".to_string()
}

fn default_max_turns() -> usize {
    40
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            max_turns: default_max_turns(),
        }
    }
}

impl HistoryConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .host
            .trim()
            .parse()
            .map_err(|e| anyhow!("server.host {:?} is not an IP address: {e}", self.host))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl RelaybotConfig {
    /// Resolve the config path (explicit, then `RELAYBOT_CONFIG`, then the
    /// default), read it, apply environment overrides and validate.
    pub async fn load_with_path(path: Option<PathBuf>) -> Result<(Self, PathBuf)> {
        let path = match path {
            Some(path) => path,
            None => match std::env::var("RELAYBOT_CONFIG") {
                Ok(v) if !v.trim().is_empty() => expand_home(&v)?,
                _ => default_config_path(),
            },
        };
        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read config {}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("RELAYBOT_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("ELEVENLABS_API_KEY") {
            self.keys.elevenlabs_api_key = Some(v);
        }
        if let Some(v) = var("ELEVENLABS_VOICE_ID") {
            self.elevenlabs.voice_id = Some(v);
        }
        if let Some(v) = var("WHATSAPP_ACCESS_TOKEN") {
            self.whatsapp.access_token = v;
        }
        if let Some(v) = var("WHATSAPP_PHONE_NUMBER_ID") {
            self.whatsapp.phone_number_id = v;
        }
        if let Some(v) = var("WHATSAPP_VERIFY_TOKEN") {
            self.whatsapp.verify_token = v;
        }
        if let Some(v) = var("WHATSAPP_APP_SECRET") {
            self.whatsapp.app_secret = Some(v);
        }
        if let Some(v) = var("RELAYBOT_PORT") {
            match v.trim().parse() {
                Ok(port) => self.server.port = port,
                Err(e) => tracing::warn!(value = %v, error = %e, "ignoring invalid RELAYBOT_PORT"),
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow!("general.model is required"));
        }
        if self.debounce.quiet_window_ms == 0 {
            return Err(anyhow!("debounce.quiet_window_ms must be > 0"));
        }
        if self.history.max_turns == 0 {
            return Err(anyhow!("history.max_turns must be > 0"));
        }
        if self.server.port == 0 {
            return Err(anyhow!("server.port must be > 0"));
        }
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow!("server.http_max_in_flight must be > 0"));
        }
        self.server.bind_addr()?;
        Ok(())
    }

    pub fn openai_api_key(&self) -> Result<&str> {
        self.keys
            .openai_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow!("keys.openai_api_key (or OPENAI_API_KEY) is required"))
    }

    /// Key and voice for text-to-speech, when both are configured.
    pub fn speech_credentials(&self) -> Option<(&str, &str)> {
        let key = self
            .keys
            .elevenlabs_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())?;
        let voice = self
            .elevenlabs
            .voice_id
            .as_deref()
            .filter(|v| !v.trim().is_empty())?;
        Some((key, voice))
    }

    pub fn whatsapp_app_secret(&self) -> Option<&str> {
        self.whatsapp
            .app_secret
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relaybot").join("config.toml")
}

pub fn expand_home(path: &str) -> Result<PathBuf> {
    let trimmed = path.trim();
    let Some(rest) = trimmed.strip_prefix("~/") else {
        return Ok(PathBuf::from(trimmed));
    };
    let home = std::env::var("HOME").map_err(|_| anyhow!("HOME is not set"))?;
    Ok(Path::new(&home).join(rest))
}
