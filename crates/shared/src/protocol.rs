use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{MessageId, RoomId, UserId};

/// Close codes the live endpoint uses to signal an unauthorized or forbidden
/// connection.
pub const AUTH_REJECTED_CLOSE_CODES: [u16; 4] = [4001, 4003, 4401, 4403];

pub fn is_auth_rejected_close(code: u16) -> bool {
    AUTH_REJECTED_CLOSE_CODES.contains(&code)
}

/// A chat message as the backend serves it over REST and the live channel.
///
/// `pending` is client-only state for optimistic entries and never crosses the
/// wire in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub pending: bool,
}

impl Message {
    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

// Some backends emit naive timestamps; those are taken as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|err| serde::de::Error::custom(format!("invalid createdAt {raw:?}: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MessagePageQuery {
    pub page: u32,
    pub page_size: u32,
}
