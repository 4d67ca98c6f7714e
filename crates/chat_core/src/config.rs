use std::{fs, path::Path};

use anyhow::{anyhow, Context};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "chat_client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    /// Derived from `api_url` when unset.
    pub realtime_url: Option<String>,
    pub auth_token: Option<String>,
    pub page_size: u32,
    pub fuzzy_window_ms: i64,
    pub recent_send_capacity: usize,
    pub event_buffer: usize,
    pub max_content_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/api/v1".into(),
            realtime_url: None,
            auth_token: None,
            page_size: 20,
            fuzzy_window_ms: 5_000,
            recent_send_capacity: 64,
            event_buffer: 1024,
            max_content_bytes: 4096,
        }
    }
}

impl Settings {
    pub fn api_base(&self) -> String {
        self.api_url.trim_end_matches('/').to_string()
    }

    pub fn realtime_base(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("invalid api url: {}", self.api_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => return Err(anyhow!("api url must use http or https, got {other}")),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive realtime url from {}", self.api_url))?;
        Ok(url.as_str().trim_end_matches('/').to_string())
    }

    pub fn fuzzy_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.fuzzy_window_ms)
    }
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE), |key| std::env::var(key).ok())
}

/// File values override defaults; environment values override the file.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, &file_cfg),
            Err(err) => tracing::warn!(path = %path.display(), "config: ignoring unreadable file: {err}"),
        }
    }

    for key in ["CHAT_API_URL", "APP__API_URL"] {
        if let Some(v) = env(key) {
            settings.api_url = v;
        }
    }
    for key in ["CHAT_REALTIME_URL", "APP__REALTIME_URL"] {
        if let Some(v) = env(key) {
            settings.realtime_url = Some(v);
        }
    }
    for key in ["CHAT_AUTH_TOKEN", "APP__AUTH_TOKEN"] {
        if let Some(v) = env(key) {
            settings.auth_token = Some(v);
        }
    }
    if let Some(v) = env("APP__PAGE_SIZE").and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = env("APP__FUZZY_WINDOW_MS").and_then(|v| v.parse().ok()) {
        settings.fuzzy_window_ms = v;
    }
    if let Some(v) = env("APP__RECENT_SEND_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.recent_send_capacity = v;
    }
    if let Some(v) = env("APP__EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.event_buffer = v;
    }
    if let Some(v) = env("APP__MAX_CONTENT_BYTES").and_then(|v| v.parse().ok()) {
        settings.max_content_bytes = v;
    }

    settings
}

fn apply_file(settings: &mut Settings, file_cfg: &toml::Table) {
    if let Some(v) = file_cfg.get("api_url").and_then(toml::Value::as_str) {
        settings.api_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("realtime_url").and_then(toml::Value::as_str) {
        settings.realtime_url = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("auth_token").and_then(toml::Value::as_str) {
        settings.auth_token = Some(v.to_string());
    }
    if let Some(v) = integer(file_cfg, "page_size").and_then(|v| u32::try_from(v).ok()) {
        settings.page_size = v;
    }
    if let Some(v) = integer(file_cfg, "fuzzy_window_ms") {
        settings.fuzzy_window_ms = v;
    }
    if let Some(v) = integer(file_cfg, "recent_send_capacity").and_then(|v| usize::try_from(v).ok()) {
        settings.recent_send_capacity = v;
    }
    if let Some(v) = integer(file_cfg, "event_buffer").and_then(|v| usize::try_from(v).ok()) {
        settings.event_buffer = v;
    }
    if let Some(v) = integer(file_cfg, "max_content_bytes").and_then(|v| usize::try_from(v).ok()) {
        settings.max_content_bytes = v;
    }
}

fn integer(file_cfg: &toml::Table, key: &str) -> Option<i64> {
    match file_cfg.get(key)? {
        toml::Value::Integer(v) => Some(*v),
        toml::Value::String(v) => v.parse().ok(),
        _ => None,
    }
}
