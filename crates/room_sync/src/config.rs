use std::{fs, path::Path};

use serde::Deserialize;
use shared::domain::RoomId;
use tracing::warn;
use url::Url;

use crate::error::SyncError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const DEFAULT_TOP_THRESHOLD_PX: f32 = 60.0;
pub const DEFAULT_CONFIG_FILE: &str = "room_sync.toml";

const BACKEND_PATH: &str = "/api/backend";
const DEFAULT_API_BASE_URL: &str = "http://localhost/api/backend";

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// When set, a transport-level channel failure is handled like a rejected
    /// credential. When cleared, the failure is only reported and the
    /// embedding application decides whether to open a fresh channel.
    pub transport_errors_invalidate_session: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            transport_errors_invalidate_session: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub page_size: u32,
    pub top_threshold_px: f32,
    pub event_capacity: usize,
    pub live: LiveConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            page_size: DEFAULT_PAGE_SIZE,
            top_threshold_px: DEFAULT_TOP_THRESHOLD_PX,
            event_capacity: 1024,
            live: LiveConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn load() -> Self {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Defaults, then the TOML file at `path` if it exists, then environment
    /// overrides.
    pub fn load_from(path: &Path) -> Self {
        let mut config = Self::default();

        if let Ok(raw) = fs::read_to_string(path) {
            match toml::from_str::<SyncConfig>(&raw) {
                Ok(file_cfg) => config = file_cfg,
                Err(err) => warn!("config: ignoring unreadable {}: {err}", path.display()),
            }
            config.page_size = config.page_size.max(1);
            config.top_threshold_px = config.top_threshold_px.max(0.0);
        }

        if let Ok(v) = std::env::var("ROOM_SYNC_API_URL") {
            config.api_base_url = v;
        }
        if let Ok(v) = std::env::var("APP__API_BASE_URL") {
            config.api_base_url = v;
        }

        if let Ok(v) = std::env::var("ROOM_SYNC_PAGE_SIZE") {
            if let Ok(parsed) = v.parse::<u32>() {
                config.page_size = parsed.max(1);
            }
        }

        if let Ok(v) = std::env::var("ROOM_SYNC_TRANSPORT_ERRORS_INVALIDATE") {
            if let Ok(parsed) = v.parse::<bool>() {
                config.live.transport_errors_invalidate_session = parsed;
            }
        }

        config
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_top_threshold(mut self, px: f32) -> Self {
        self.top_threshold_px = px.max(0.0);
        self
    }

    pub fn with_transport_errors_invalidate_session(mut self, enabled: bool) -> Self {
        self.live.transport_errors_invalidate_session = enabled;
        self
    }

    pub fn api_url(&self) -> Result<Url, SyncError> {
        let normalized = normalize_api_base(&self.api_base_url);
        let mut url = Url::parse(&normalized).map_err(|err| {
            SyncError::Config(format!("invalid api base url {normalized:?}: {err}"))
        })?;
        let rest_scheme = match url.scheme() {
            "ws" => Some("http"),
            "wss" => Some("https"),
            _ => None,
        };
        if let Some(scheme) = rest_scheme {
            url.set_scheme(scheme)
                .map_err(|_| SyncError::Config(format!("cannot use {scheme} for {url}")))?;
        }
        Ok(url)
    }

    pub fn messages_url(&self, room_id: &RoomId) -> Result<Url, SyncError> {
        let mut url = self.api_url()?;
        let base = url.to_string();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("api url cannot carry a path: {base}")))?
            .pop_if_empty()
            .push("rooms")
            .push(room_id.as_str())
            .push("messages");
        Ok(url)
    }

    /// The live endpoint always sits at `/api/backend/ws/rooms/{room}` on the
    /// API origin, with the credential in the `token` query parameter.
    pub fn room_ws_url(&self, room_id: &RoomId, token: Option<&str>) -> Result<Url, SyncError> {
        let mut url = self.api_url()?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::Config(format!("cannot use {scheme} for {url}")))?;
        url.set_query(None);
        url.set_fragment(None);
        let base = url.to_string();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config(format!("api url cannot carry a path: {base}")))?
            .clear()
            .extend(["api", "backend", "ws", "rooms", room_id.as_str()]);
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Adds a scheme when missing, drops trailing slashes and makes sure the
/// backend service path is present exactly once.
pub fn normalize_api_base(raw: &str) -> String {
    let raw = raw.trim();
    let base = if raw.is_empty() {
        DEFAULT_API_BASE_URL
    } else {
        raw
    };

    let lower = base.to_ascii_lowercase();
    let has_scheme = ["http://", "https://", "ws://", "wss://"]
        .iter()
        .any(|scheme| lower.starts_with(scheme));
    let with_scheme = if has_scheme {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    let trimmed = with_scheme.trim_end_matches('/');

    if trimmed.ends_with(BACKEND_PATH) || trimmed.contains(&format!("{BACKEND_PATH}/")) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{BACKEND_PATH}")
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
