//! Persistent push channel for one room.

use std::fmt;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use shared::{
    domain::RoomId,
    protocol::{is_auth_rejected_close, Message},
};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::LiveConfig, error::SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored => "errored",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTransition {
    OpenRequested,
    Opened,
    Frame(String),
    /// The handshake was refused because of the credential.
    Rejected(String),
    Errored(String),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Transitioned,
    Ingest(Message),
    Malformed(String),
    /// Terminal failure that is not tied to the credential.
    Failed(String),
    InvalidateSession,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    state: ConnectionState,
    policy: LiveConfig,
}

impl ChannelMachine {
    pub fn new(policy: LiveConfig) -> Self {
        Self {
            state: ConnectionState::Idle,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, transition: &ChannelTransition) -> ChannelOutcome {
        use ChannelTransition as T;
        use ConnectionState as S;

        let (next, outcome) = match (self.state, transition) {
            (S::Idle, T::OpenRequested) => (S::Connecting, ChannelOutcome::Transitioned),
            (S::Connecting, T::Opened) => (S::Open, ChannelOutcome::Transitioned),
            (S::Open, T::Frame(text)) => match Message::from_frame(text) {
                Ok(message) => (S::Open, ChannelOutcome::Ingest(message)),
                Err(err) => (S::Open, ChannelOutcome::Malformed(err.to_string())),
            },
            (S::Connecting | S::Open, T::Rejected(_)) => {
                (S::Errored, ChannelOutcome::InvalidateSession)
            }
            (S::Connecting | S::Open, T::Errored(reason)) => {
                let outcome = if self.policy.transport_errors_invalidate_session {
                    ChannelOutcome::InvalidateSession
                } else {
                    ChannelOutcome::Failed(reason.clone())
                };
                (S::Errored, outcome)
            }
            (S::Connecting | S::Open, T::Closed { code, .. }) => {
                let outcome = if code.is_some_and(is_auth_rejected_close) {
                    ChannelOutcome::InvalidateSession
                } else {
                    ChannelOutcome::Transitioned
                };
                (S::Closed, outcome)
            }
            (state, transition) => {
                debug!(%state, ?transition, "live: ignoring transition");
                (state, ChannelOutcome::Ignored)
            }
        };

        self.state = next;
        outcome
    }
}

/// Transport events after a successful handshake. Only `Frame`, `Errored` and
/// `Closed` are expected here.
pub type TransitionStream = BoxStream<'static, ChannelTransition>;

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Completes the handshake. A credential refusal must come back as
    /// [`SyncError::AuthRejected`].
    async fn connect(&self, url: &Url) -> Result<TransitionStream, SyncError>;
}

pub struct WsConnector;

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<TransitionStream, SyncError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(classify_handshake_error)?;

        let stream = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(WsMessage::Text(text)) => Some(ChannelTransition::Frame(text)),
                Ok(WsMessage::Close(frame)) => Some(match frame {
                    Some(frame) => ChannelTransition::Closed {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.into_owned(),
                    },
                    None => ChannelTransition::Closed {
                        code: None,
                        reason: String::new(),
                    },
                }),
                Ok(_) => None,
                Err(err) => Some(ChannelTransition::Errored(err.to_string())),
            }
        });
        Ok(stream.boxed())
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
            SyncError::AuthRejected("live channel handshake refused".into())
        }
        other => SyncError::Transient(format!("failed to connect live channel: {other}")),
    }
}

/// Handle to a running channel. Dropping it tears the connection down without
/// waiting for a close acknowledgment.
pub struct LiveChannel {
    room_id: RoomId,
    task: JoinHandle<()>,
}

impl LiveChannel {
    pub(crate) fn new(room_id: RoomId, task: JoinHandle<()>) -> Self {
        Self { room_id, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            info!(room_id = %self.room_id, "live: closing channel");
        }
        self.task.abort();
    }
}

pub(crate) fn log_malformed_frame(room_id: &RoomId, reason: &str) {
    warn!(room_id = %room_id, "live: discarding malformed frame: {reason}");
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
