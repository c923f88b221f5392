//! Registration channel: the per-connection lifecycle of one instance.
//!
//! ```text
//!   Idle --register--> Registered --unregister--> Closed
//!    ^        |            |  ^                      ^
//!    +--fail--+            +--+ update/heartbeat     |
//!                          +--- connection lost -----+
//! ```
//!
//! The state moves when an operation starts, before the registry answers, so
//! a second `register` racing the first is rejected without touching the
//! store. A connection that goes away while registered does not unregister:
//! the record is queued for delayed eviction instead.

use crate::clock::Clock;
use crate::eviction::EvictionQueue;
use crate::instance::{InstanceId, InstanceRecord};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::{InstanceRegistry, RegistryError};
use crate::source::Source;
use crate::store::Status;
use crate::transport::ReplySink;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Instance already registered on this connection")]
    AlreadyRegistered,
    #[error("No instance registered on this connection")]
    NotRegistered,
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ChannelError {
    /// Whether the client should hear about this error.
    fn is_reportable(&self) -> bool {
        !matches!(self, ChannelError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    Registered,
    Closed,
}

/// Live channel counts per state, shared by every channel of a server.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    idle: AtomicI64,
    registered: AtomicI64,
    closed: AtomicI64,
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, state: ChannelState) -> i64 {
        self.gauge(state).load(Ordering::SeqCst)
    }

    fn gauge(&self, state: ChannelState) -> &AtomicI64 {
        match state {
            ChannelState::Idle => &self.idle,
            ChannelState::Registered => &self.registered,
            ChannelState::Closed => &self.closed,
        }
    }

    fn enter(&self, state: ChannelState) {
        self.gauge(state).fetch_add(1, Ordering::SeqCst);
    }

    fn leave(&self, state: ChannelState) {
        self.gauge(state).fetch_sub(1, Ordering::SeqCst);
    }

    fn transition(&self, from: ChannelState, to: ChannelState) {
        if from != to {
            self.leave(from);
            self.enter(to);
        }
    }
}

#[derive(Debug, Default)]
struct View {
    current: Option<Arc<InstanceRecord>>,
    version: u64,
}

pub struct RegistrationChannel {
    registry: Arc<dyn InstanceRegistry>,
    sink: Arc<dyn ReplySink>,
    eviction: Arc<EvictionQueue>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ChannelMetrics>,
    state: Mutex<ChannelState>,
    view: Mutex<View>,
}

impl RegistrationChannel {
    pub fn new(
        registry: Arc<dyn InstanceRegistry>,
        sink: Arc<dyn ReplySink>,
        eviction: Arc<EvictionQueue>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ChannelMetrics>,
    ) -> Self {
        metrics.enter(ChannelState::Idle);
        Self {
            registry,
            sink,
            eviction,
            clock,
            metrics,
            state: Mutex::new(ChannelState::Idle),
            view: Mutex::new(View::default()),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The record this channel last had accepted.
    pub fn current(&self) -> Option<Arc<InstanceRecord>> {
        self.view().current.clone()
    }

    /// Parse and handle one inbound frame.
    ///
    /// A frame that is not a client message is answered with an error and
    /// leaves the state alone.
    pub async fn handle_frame(&self, data: &[u8]) -> Result<(), ChannelError> {
        match ClientMessage::from_json(data) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                let err = ChannelError::Protocol(format!("unexpected message: {}", e));
                self.reply(ServerMessage::error(err.to_string())).await;
                Err(err)
            }
        }
    }

    pub async fn handle(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        debug!("channel received {}", msg.kind());
        match msg {
            ClientMessage::Register { instance } => self.register(instance).await,
            ClientMessage::Update { instance } => self.update(instance).await,
            ClientMessage::Unregister => self.unregister().await,
            ClientMessage::Heartbeat => self.heartbeat().await,
        }
    }

    pub async fn register(&self, record: InstanceRecord) -> Result<(), ChannelError> {
        if !self.move_to_state(ChannelState::Idle, ChannelState::Registered) {
            let err = match self.state() {
                ChannelState::Closed => ChannelError::ChannelClosed,
                _ => ChannelError::AlreadyRegistered,
            };
            return self.fail(err).await;
        }

        let version = self.next_version(record.id());
        let record = record.with_version(version);
        let id = record.id().clone();

        let outcome = self
            .registry
            .register(record.clone(), Source::Local)
            .await
            .map_err(ChannelError::from)
            .and_then(|result| match result.status {
                Status::Superseded => Err(ChannelError::Protocol(format!(
                    "registration of {} v{} superseded by a newer version",
                    id, version
                ))),
                _ => Ok(()),
            });

        if let Err(err) = outcome {
            warn!("register {} failed: {}", id, err);
            self.move_to_state(ChannelState::Registered, ChannelState::Idle);
            return self.fail(err).await;
        }

        let record = Arc::new(record);
        {
            let mut view = self.view();
            view.current = Some(Arc::clone(&record));
            view.version = version;
        }

        if self.state() == ChannelState::Closed {
            // Connection went away while the store call was in flight
            info!(
                "Connection terminated during register; adding instance {} to eviction queue",
                id
            );
            self.eviction.add(record, Source::Local, self.clock.now_ms());
            return Err(ChannelError::ChannelClosed);
        }

        info!("Registered {} (app {}) v{}", id, record.app(), version);
        self.reply(ServerMessage::Ack).await;
        Ok(())
    }

    pub async fn update(&self, record: InstanceRecord) -> Result<(), ChannelError> {
        let previous = match self.require_registered() {
            Ok(previous) => previous,
            Err(err) => return self.fail(err).await,
        };
        if record.id() != previous.id() {
            let err = ChannelError::Protocol(format!(
                "update for {} on a connection registered as {}",
                record.id(),
                previous.id()
            ));
            return self.fail(err).await;
        }

        let version = self.next_version(record.id());
        let record = record.with_version(version);
        let deltas = record.diff_older(&previous);
        debug!(
            "update {} v{} -> v{}: {:?}",
            record.id(),
            previous.version(),
            version,
            deltas.iter().map(|d| d.field()).collect::<Vec<_>>()
        );

        let outcome = self
            .registry
            .update(record.clone(), deltas, Source::Local)
            .await
            .map_err(ChannelError::from)
            .and_then(|result| match result.status {
                Status::Superseded => Err(ChannelError::Protocol(format!(
                    "update of {} v{} superseded by a newer version",
                    record.id(),
                    version
                ))),
                _ => Ok(()),
            });

        if let Err(err) = outcome {
            warn!("update {} failed: {}", record.id(), err);
            return self.fail(err).await;
        }

        {
            let mut view = self.view();
            view.current = Some(Arc::new(record));
            view.version = version;
        }
        self.reply(ServerMessage::Ack).await;
        Ok(())
    }

    pub async fn unregister(&self) -> Result<(), ChannelError> {
        let current = match self.require_registered() {
            Ok(current) => current,
            Err(err) => return self.fail(err).await,
        };
        if !self.move_to_state(ChannelState::Registered, ChannelState::Closed) {
            return self.fail(ChannelError::ChannelClosed).await;
        }

        let version = self.view().version;
        match self
            .registry
            .unregister(current.id(), version, Source::Local)
            .await
        {
            Ok(_) => {
                info!("Unregistered {} v{}", current.id(), version);
                self.view().current = None;
                self.reply(ServerMessage::Ack).await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "unregister {} failed, adding it to eviction queue: {}",
                    current.id(),
                    e
                );
                self.eviction
                    .add(current, Source::Local, self.clock.now_ms());
                self.fail(e.into()).await
            }
        }
    }

    /// Renew the lease. Ignored unless registered.
    ///
    /// A lease that has disappeared (evicted while the instance was
    /// unreachable) is registered again from the channel's view.
    pub async fn heartbeat(&self) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Registered {
            return Ok(());
        }
        let Some(current) = self.current() else {
            return Ok(());
        };

        if self.registry.renew(current.id(), Source::Local).await? {
            return Ok(());
        }

        let version = self.next_version(current.id());
        info!("Lease for {} lost; registering again as v{}", current.id(), version);
        let record = current.as_ref().clone().with_version(version);
        let result = self.registry.register(record.clone(), Source::Local).await?;
        if result.status.is_applied() {
            let mut view = self.view();
            view.current = Some(Arc::new(record));
            view.version = version;
        }
        Ok(())
    }

    /// The transport is gone. Terminal; a registered instance is queued for
    /// eviction instead of being unregistered.
    pub fn on_connection_closed(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let previous = *state;
            *state = ChannelState::Closed;
            self.metrics.transition(previous, ChannelState::Closed);
            previous
        };

        if previous != ChannelState::Registered {
            return;
        }
        if let Some(current) = self.current() {
            info!(
                "Connection terminated without unregister; adding instance {} to eviction queue",
                current.id()
            );
            self.eviction
                .add(current, Source::Local, self.clock.now_ms());
        }
    }

    fn move_to_state(&self, from: ChannelState, to: ChannelState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return false;
        }
        *state = to;
        self.metrics.transition(from, to);
        true
    }

    fn require_registered(&self) -> Result<Arc<InstanceRecord>, ChannelError> {
        match self.state() {
            ChannelState::Idle => Err(ChannelError::NotRegistered),
            ChannelState::Closed => Err(ChannelError::ChannelClosed),
            ChannelState::Registered => self.current().ok_or(ChannelError::NotRegistered),
        }
    }

    /// One past the highest version this channel or the store has seen.
    fn next_version(&self, id: &InstanceId) -> u64 {
        let known = self.view().version;
        let stored = self.registry.latest_version(id).unwrap_or(0);
        known.max(stored) + 1
    }

    async fn fail(&self, err: ChannelError) -> Result<(), ChannelError> {
        if err.is_reportable() {
            self.reply(ServerMessage::error(err.to_string())).await;
        }
        Err(err)
    }

    async fn reply(&self, msg: ServerMessage) {
        if let Err(e) = self.sink.send_reply(msg).await {
            debug!("reply dropped: {}", e);
        }
    }

    fn view(&self) -> std::sync::MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RegistrationChannel {
    fn drop(&mut self) {
        self.metrics.leave(self.state());
    }
}
