use std::sync::Arc;

use futures::StreamExt;
use shared::{
    domain::{MessageId, RoomId},
    protocol::Message,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod config;
pub mod error;
pub mod history;
pub mod live;
pub mod optimistic;
pub mod pagination;
pub mod reconciler;
pub mod session;
pub mod transport;

pub use config::{LiveConfig, SyncConfig};
pub use error::SyncError;
pub use history::HistoryFetcher;
pub use live::{ChannelTransition, ConnectionState, LiveConnector, WsConnector};
pub use optimistic::{MessageSender, SendHandle};
pub use pagination::ScrollPosition;
pub use reconciler::IngestSource;
pub use session::{SessionHandle, StaticSession};
pub use transport::HttpBackend;

use live::{ChannelMachine, ChannelOutcome, LiveChannel};
use optimistic::OptimisticSendTracker;
use pagination::PaginationController;
use reconciler::MessageReconciler;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    TimelineChanged {
        room_id: RoomId,
        len: usize,
    },
    ConnectionStateChanged {
        room_id: RoomId,
        state: ConnectionState,
    },
    /// The credential was rejected; the engine has stopped all room activity.
    SessionInvalidated,
    Error(String),
}

/// One spawned channel instance within a room view. A reopened channel gets a
/// new instance so late transitions from its predecessor are ignored.
#[derive(Debug, Clone)]
struct LiveContext {
    view: ActiveContext,
    instance: u64,
}

/// Identifies the room view an async operation was started for. Results are
/// dropped if the view has moved on by the time they arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActiveContext {
    room_id: RoomId,
    generation: u64,
    credential: String,
}

struct RoomSyncState {
    generation: u64,
    context: Option<ActiveContext>,
    reconciler: MessageReconciler,
    sends: OptimisticSendTracker,
    pagination: PaginationController,
    channel: ChannelMachine,
    live: Option<LiveChannel>,
    live_instance: u64,
}

impl RoomSyncState {
    fn reset_view(&mut self, config: &SyncConfig) {
        self.reconciler.clear();
        self.sends.clear();
        self.pagination = PaginationController::new(config.page_size, config.top_threshold_px);
        self.channel = ChannelMachine::new(config.live);
    }
}

pub struct RoomSync {
    config: SyncConfig,
    session: Arc<dyn SessionHandle>,
    history: Arc<dyn HistoryFetcher>,
    sender: Arc<dyn MessageSender>,
    connector: Arc<dyn LiveConnector>,
    inner: Mutex<RoomSyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl RoomSync {
    pub fn new(config: SyncConfig, session: Arc<dyn SessionHandle>) -> Arc<Self> {
        let backend = Arc::new(HttpBackend::new(&config));
        Self::new_with_dependencies(
            config,
            session,
            backend.clone(),
            backend,
            Arc::new(WsConnector),
        )
    }

    pub fn new_with_dependencies(
        config: SyncConfig,
        session: Arc<dyn SessionHandle>,
        history: Arc<dyn HistoryFetcher>,
        sender: Arc<dyn MessageSender>,
        connector: Arc<dyn LiveConnector>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = RoomSyncState {
            generation: 0,
            context: None,
            reconciler: MessageReconciler::new(),
            sends: OptimisticSendTracker::new(),
            pagination: PaginationController::new(config.page_size, config.top_threshold_px),
            channel: ChannelMachine::new(config.live),
            live: None,
            live_instance: 0,
        };
        Arc::new(Self {
            config,
            session,
            history,
            sender,
            connector,
            inner: Mutex::new(inner),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().await.reconciler.snapshot()
    }

    pub async fn has_more(&self) -> bool {
        self.inner.lock().await.pagination.has_more()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.channel.state()
    }

    pub async fn current_room(&self) -> Option<RoomId> {
        self.inner
            .lock()
            .await
            .context
            .as_ref()
            .map(|context| context.room_id.clone())
    }

    /// Switches the view to `room_id`: drops the previous room's timeline and
    /// channel, opens a live channel for the new room and loads page 1.
    pub async fn enter_room(self: &Arc<Self>, room_id: RoomId) -> Result<(), SyncError> {
        if !room_id.is_usable() {
            return Err(SyncError::Validation(format!("invalid room id {room_id:?}")));
        }
        let credential = self
            .session
            .credential()
            .ok_or(SyncError::MissingCredential)?;
        let ws_url = self.config.room_ws_url(&room_id, Some(&credential))?;

        let (context, previous, first_page) = {
            let mut guard = self.inner.lock().await;
            guard.generation += 1;
            let context = ActiveContext {
                room_id: room_id.clone(),
                generation: guard.generation,
                credential,
            };
            guard.context = Some(context.clone());
            guard.reset_view(&self.config);
            let previous = guard.live.take();
            let first_page = guard.pagination.begin_next();
            let live = self.spawn_live_channel(&mut guard, &context, ws_url);
            guard.live = Some(live);
            (context, previous, first_page)
        };
        drop(previous);
        info!(room_id = %room_id, generation = context.generation, "room: entered");

        match first_page {
            Some(page) => self.fetch_page(&context, page).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Opens a fresh live channel for the current room once the previous one
    /// has closed or failed, then refetches page 1 so messages pushed during
    /// the gap are merged. Returns `false` when the channel is still running.
    pub async fn reopen_live_channel(self: &Arc<Self>) -> Result<bool, SyncError> {
        let (context, previous) = {
            let mut guard = self.inner.lock().await;
            let context = guard
                .context
                .clone()
                .ok_or_else(|| SyncError::Validation("no active room".into()))?;
            if !self.is_current(&guard, &context) {
                return Err(SyncError::MissingCredential);
            }
            let running = guard.live.as_ref().is_some_and(|live| !live.is_finished());
            if running && !guard.channel.state().is_terminal() {
                return Ok(false);
            }
            let ws_url = self
                .config
                .room_ws_url(&context.room_id, Some(&context.credential))?;
            guard.channel = ChannelMachine::new(self.config.live);
            let previous = guard.live.take();
            let live = self.spawn_live_channel(&mut guard, &context, ws_url);
            guard.live = Some(live);
            (context, previous)
        };
        drop(previous);
        info!(room_id = %context.room_id, "live: reopening channel");

        let page_size = self.config.page_size;
        let result = self
            .history
            .fetch_page(&context.credential, &context.room_id, 1, page_size)
            .await;
        let mut guard = self.inner.lock().await;
        if !self.is_current(&guard, &context) {
            return Err(SyncError::Stale);
        }
        match result {
            Ok(records) => {
                guard.reconciler.ingest(records, IngestSource::History);
                self.emit_timeline(&guard, &context.room_id);
                Ok(true)
            }
            Err(err) => {
                drop(guard);
                self.report_failure(&context, &err).await;
                Err(err)
            }
        }
    }

    pub async fn leave_room(&self) {
        let (room_id, live) = {
            let mut guard = self.inner.lock().await;
            let Some(context) = guard.context.take() else {
                return;
            };
            guard.generation += 1;
            guard.reset_view(&self.config);
            (context.room_id, guard.live.take())
        };
        drop(live);
        info!(room_id = %room_id, "room: left");
        let _ = self.events.send(SyncEvent::ConnectionStateChanged {
            room_id,
            state: ConnectionState::Idle,
        });
    }

    /// Loads the next older page if the scroll position is near the top and
    /// nothing is in flight. Returns the number of records received, or
    /// `None` if no request was made.
    pub async fn report_scroll(
        self: &Arc<Self>,
        position: ScrollPosition,
    ) -> Result<Option<usize>, SyncError> {
        let (context, page) = {
            let mut guard = self.inner.lock().await;
            let Some(context) = guard.context.clone() else {
                return Ok(None);
            };
            if !guard.pagination.should_request(position) {
                return Ok(None);
            }
            let Some(page) = guard.pagination.begin_next() else {
                return Ok(None);
            };
            (context, page)
        };
        self.fetch_page(&context, page).await.map(Some)
    }

    /// Loads the next older page without the near-top check. For callers with
    /// no scroll position, such as a CLI; views should use
    /// [`RoomSync::report_scroll`].
    pub async fn load_older(self: &Arc<Self>) -> Result<Option<usize>, SyncError> {
        let (context, page) = {
            let mut guard = self.inner.lock().await;
            let Some(context) = guard.context.clone() else {
                return Ok(None);
            };
            let Some(page) = guard.pagination.begin_next() else {
                return Ok(None);
            };
            (context, page)
        };
        self.fetch_page(&context, page).await.map(Some)
    }

    /// Shows a pending placeholder immediately and sends in the background.
    pub async fn send(self: &Arc<Self>, content: &str) -> Result<SendHandle, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::Validation("message content is empty".into()));
        }

        let (context, placeholder_id) = {
            let mut guard = self.inner.lock().await;
            let context = guard
                .context
                .clone()
                .ok_or_else(|| SyncError::Validation("no active room".into()))?;
            if !self.is_current(&guard, &context) {
                return Err(SyncError::MissingCredential);
            }
            let sender_id = self
                .session
                .subject_id()
                .ok_or(SyncError::MissingCredential)?;
            let placeholder = guard
                .sends
                .prepare(&context.room_id, &sender_id, content)?;
            let placeholder_id = placeholder.id.clone();
            guard
                .reconciler
                .ingest([placeholder], IngestSource::Optimistic);
            self.emit_timeline(&guard, &context.room_id);
            (context, placeholder_id)
        };
        debug!(room_id = %context.room_id, placeholder = %placeholder_id, "send: placeholder shown");

        let client = Arc::clone(self);
        let content = content.to_string();
        let task_placeholder = placeholder_id.clone();
        let task = tokio::spawn(async move {
            let result = client
                .sender
                .send_message(&context.credential, &context.room_id, &content)
                .await;
            client.settle_send(&context, &task_placeholder, result).await
        });

        Ok(SendHandle::new(placeholder_id, task))
    }

    async fn settle_send(
        &self,
        context: &ActiveContext,
        placeholder_id: &MessageId,
        result: Result<Message, SyncError>,
    ) -> Result<Message, SyncError> {
        let mut guard = self.inner.lock().await;
        if !self.is_current(&guard, context) {
            debug!(room_id = %context.room_id, "send: dropping stale settlement");
            return match result {
                Ok(_) => Err(SyncError::Stale),
                Err(err) => Err(err),
            };
        }

        match result {
            Ok(confirmed) => {
                let RoomSyncState {
                    sends, reconciler, ..
                } = &mut *guard;
                sends.confirm(reconciler, placeholder_id, confirmed.clone());
                self.emit_timeline(&guard, &context.room_id);
                info!(room_id = %context.room_id, message_id = %confirmed.id, "send: confirmed");
                Ok(confirmed)
            }
            Err(err) => {
                let RoomSyncState {
                    sends, reconciler, ..
                } = &mut *guard;
                sends.fail(reconciler, placeholder_id);
                self.emit_timeline(&guard, &context.room_id);
                drop(guard);
                warn!(room_id = %context.room_id, "send: failed: {err}");
                self.report_failure(context, &err).await;
                Err(err)
            }
        }
    }

    async fn fetch_page(&self, context: &ActiveContext, page: u32) -> Result<usize, SyncError> {
        let page_size = self.config.page_size;
        let result = self
            .history
            .fetch_page(&context.credential, &context.room_id, page, page_size)
            .await;

        let mut guard = self.inner.lock().await;
        if !self.is_current(&guard, context) {
            debug!(room_id = %context.room_id, page, "history: dropping stale page");
            return Err(SyncError::Stale);
        }

        match result {
            Ok(records) => {
                let received = records.len();
                guard.pagination.complete(page, received);
                let added = guard.reconciler.ingest(records, IngestSource::History);
                self.emit_timeline(&guard, &context.room_id);
                info!(
                    room_id = %context.room_id,
                    page,
                    received,
                    added,
                    has_more = guard.pagination.has_more(),
                    "history: page merged"
                );
                Ok(received)
            }
            Err(err) => {
                guard.pagination.fail(page);
                drop(guard);
                warn!(room_id = %context.room_id, page, "history: fetch failed: {err}");
                self.report_failure(context, &err).await;
                Err(err)
            }
        }
    }

    fn spawn_live_channel(
        self: &Arc<Self>,
        state: &mut RoomSyncState,
        context: &ActiveContext,
        url: Url,
    ) -> LiveChannel {
        state.live_instance += 1;
        let live_context = LiveContext {
            view: context.clone(),
            instance: state.live_instance,
        };
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            client.drive_live_channel(live_context, url).await;
        });
        LiveChannel::new(context.room_id.clone(), task)
    }

    async fn drive_live_channel(self: Arc<Self>, live_ctx: LiveContext, url: Url) {
        if !self
            .apply_live_transition(&live_ctx, ChannelTransition::OpenRequested)
            .await
        {
            return;
        }

        let mut stream = match self.connector.connect(&url).await {
            Ok(stream) => stream,
            Err(SyncError::AuthRejected(reason)) => {
                self.apply_live_transition(&live_ctx, ChannelTransition::Rejected(reason))
                    .await;
                return;
            }
            Err(err) => {
                let transition = ChannelTransition::Errored(err.to_string());
                self.apply_live_transition(&live_ctx, transition).await;
                return;
            }
        };

        if !self
            .apply_live_transition(&live_ctx, ChannelTransition::Opened)
            .await
        {
            return;
        }

        while let Some(transition) = stream.next().await {
            if !self.apply_live_transition(&live_ctx, transition).await {
                return;
            }
        }

        self.apply_live_transition(
            &live_ctx,
            ChannelTransition::Closed {
                code: None,
                reason: "stream ended".into(),
            },
        )
        .await;
    }

    // Returns whether the channel should keep reading.
    async fn apply_live_transition(
        &self,
        live_ctx: &LiveContext,
        transition: ChannelTransition,
    ) -> bool {
        let context = &live_ctx.view;
        let mut guard = self.inner.lock().await;
        if guard.live_instance != live_ctx.instance || !self.is_current(&guard, context) {
            return false;
        }

        let before = guard.channel.state();
        let outcome = guard.channel.apply(&transition);
        let after = guard.channel.state();
        if before != after {
            info!(room_id = %context.room_id, from = %before, to = %after, "live: state changed");
            let _ = self.events.send(SyncEvent::ConnectionStateChanged {
                room_id: context.room_id.clone(),
                state: after,
            });
        }

        match outcome {
            ChannelOutcome::Ingest(message) => {
                if message.room_id != context.room_id {
                    warn!(
                        room_id = %context.room_id,
                        message_room = %message.room_id,
                        "live: dropping message for another room"
                    );
                } else {
                    guard.reconciler.ingest([message], IngestSource::Live);
                    self.emit_timeline(&guard, &context.room_id);
                }
            }
            ChannelOutcome::Malformed(reason) => {
                live::log_malformed_frame(&context.room_id, &reason);
            }
            ChannelOutcome::Failed(reason) => {
                drop(guard);
                error!(room_id = %context.room_id, "live: channel failed: {reason}");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("live channel failed: {reason}")));
                return false;
            }
            ChannelOutcome::InvalidateSession => {
                drop(guard);
                warn!(room_id = %context.room_id, ?transition, "live: credential rejected");
                self.invalidate_session(context).await;
                return false;
            }
            ChannelOutcome::Transitioned | ChannelOutcome::Ignored => {}
        }

        !after.is_terminal()
    }

    async fn report_failure(&self, context: &ActiveContext, err: &SyncError) {
        if err.is_auth_rejected() {
            self.invalidate_session(context).await;
        } else {
            let _ = self.events.send(SyncEvent::Error(err.to_string()));
        }
    }

    /// Hard stop for the view `context` belongs to. Only the first caller for
    /// a given context reaches the session, so concurrent rejections from
    /// several sources invalidate once.
    async fn invalidate_session(&self, context: &ActiveContext) {
        let live = {
            let mut guard = self.inner.lock().await;
            if guard.context.as_ref() != Some(context) {
                return;
            }
            guard.context = None;
            guard.generation += 1;

            let RoomSyncState {
                sends, reconciler, ..
            } = &mut *guard;
            let abandoned = sends.abandon_all(reconciler);
            if abandoned > 0 {
                debug!(room_id = %context.room_id, abandoned, "send: dropping unsettled placeholders");
                self.emit_timeline(&guard, &context.room_id);
            }

            let before = guard.channel.state();
            guard.channel.apply(&ChannelTransition::Closed {
                code: None,
                reason: "session invalidated".into(),
            });
            let after = guard.channel.state();
            if before != after {
                let _ = self.events.send(SyncEvent::ConnectionStateChanged {
                    room_id: context.room_id.clone(),
                    state: after,
                });
            }
            guard.live.take()
        };

        self.session.invalidate();
        let _ = self.events.send(SyncEvent::SessionInvalidated);
        info!(room_id = %context.room_id, "room: stopped after session invalidation");
        drop(live);
    }

    fn is_current(&self, state: &RoomSyncState, context: &ActiveContext) -> bool {
        state.context.as_ref() == Some(context)
            && self.session.credential().as_deref() == Some(context.credential.as_str())
    }

    fn emit_timeline(&self, state: &RoomSyncState, room_id: &RoomId) {
        let _ = self.events.send(SyncEvent::TimelineChanged {
            room_id: room_id.clone(),
            len: state.reconciler.len(),
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
