//! Streaming connector.
//!
//! Owns one Bayeux session: handshake, the background connect loop, channel
//! subscriptions and their replay cursors. Protocol requests block the caller
//! up to a configured timeout; events are delivered on the connect loop thread.
//!
//! The connector never reconnects after a transport failure. It moves to
//! `ConnectorState::Error` and leaves recovery to its owner. The one exception
//! is a server-advised re-handshake, which is part of the protocol: every
//! channel is then resubscribed from its last delivered replay id.

/// Meta-channel observers.
pub mod observer;
/// Session state machine.
pub mod state;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::auth::Credential;
use crate::bayeux::{Message, MetaChannel, Reconnect, StreamEvent, Transport};
use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, TransportError};

pub use observer::{LoggingObserver, MetaObserver};
pub use state::ConnectorState;

/// Callback invoked for every event on a subscribed channel.
pub type EventConsumer = Arc<dyn Fn(StreamEvent) + Send + Sync>;

struct ChannelEntry {
    replay_from: i64,
    consumer: EventConsumer,
    token: u64,
}

struct Session {
    state: ConnectorState,
    generation: u64,
    credential: Option<Credential>,
    client_id: Option<String>,
    subscriptions: HashMap<String, ChannelEntry>,
    last_error: Option<String>,
}

impl Session {
    fn endpoint(&self) -> Option<(Credential, String)> {
        Some((self.credential.clone()?, self.client_id.clone()?))
    }
}

struct Inner {
    config: ConnectorConfig,
    transport: Arc<dyn Transport>,
    session: Mutex<Session>,
    observers: Mutex<HashMap<MetaChannel, Vec<Arc<dyn MetaObserver>>>>,
    delivery: Mutex<()>,
    /// Held for the whole of a `subscribe` call.
    subscribing: Mutex<()>,
    connect_loop: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    next_token: AtomicU64,
}

/// Bayeux long-polling client for one streaming session.
pub struct StreamingConnector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamingConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingConnector")
            .field("state", &self.state())
            .field("channels", &self.subscribed_channels())
            .finish_non_exhaustive()
    }
}

impl StreamingConnector {
    pub fn new(config: ConnectorConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                session: Mutex::new(Session {
                    state: ConnectorState::Idle,
                    generation: 0,
                    credential: None,
                    client_id: None,
                    subscriptions: HashMap::new(),
                    last_error: None,
                }),
                observers: Mutex::new(HashMap::new()),
                delivery: Mutex::new(()),
                subscribing: Mutex::new(()),
                connect_loop: Mutex::new(None),
                next_id: AtomicU64::new(1),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Register a diagnostics observer for one meta channel.
    pub fn add_observer(&self, channel: MetaChannel, observer: Arc<dyn MetaObserver>) -> &Self {
        if let Ok(mut observers) = self.inner.observers.lock() {
            observers.entry(channel).or_default().push(observer);
        }
        self
    }

    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.inner.lock_session().state
    }

    /// Client id assigned by the last successful handshake.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.lock_session().client_id.clone()
    }

    /// Message of the failure that moved the session to `Error`.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.lock_session().last_error.clone()
    }

    #[must_use]
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.inner.lock_session().subscriptions.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Cursor the channel would be resubscribed from.
    #[must_use]
    pub fn replay_cursor(&self, channel: &str) -> Option<i64> {
        self.inner.lock_session().subscriptions.get(channel).map(|e| e.replay_from)
    }

    /// Handshake and start the connect loop.
    pub fn start(&self, credential: Credential) -> Result<(), ConnectorError> {
        let generation = {
            let mut session = self.inner.lock_session();
            if !session.state.can_start() {
                return Err(ConnectorError::StateConflict {
                    state: session.state,
                    operation: "start",
                });
            }
            session.generation += 1;
            session.state = ConnectorState::Handshaking;
            session.credential = Some(credential.clone());
            session.client_id = None;
            session.subscriptions.clear();
            session.last_error = None;
            session.generation
        };
        debug!(generation, "bayeux handshake");

        let client_id = match self.inner.handshake(&credential, generation) {
            Ok(client_id) => client_id,
            Err(e) => {
                self.inner.fail(generation, &e);
                return Err(e);
            }
        };

        {
            let mut session = self.inner.lock_session();
            if session.generation != generation {
                return Err(ConnectorError::StateConflict {
                    state: session.state,
                    operation: "start",
                });
            }
            session.state = ConnectorState::Connected;
            session.client_id = Some(client_id.clone());
        }
        info!(client_id = %client_id, "bayeux session established");

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("eventlink-connect".to_string())
            .spawn(move || connect_loop(&inner, generation))
            .map_err(|e| {
                let err = ConnectorError::Transport(TransportError::ConnectionFailed {
                    message: format!("failed to spawn connect loop: {e}"),
                });
                self.inner.fail(generation, &err);
                err
            })?;
        if let Ok(mut guard) = self.inner.connect_loop.lock() {
            *guard = Some(handle);
        }
        Ok(())
    }

    /// Subscribe `channel` from `replay_from`; `on_event` then sees every event on it.
    ///
    /// An already subscribed channel is unsubscribed and subscribed again with the
    /// new cursor and consumer. Concurrent calls run one after another.
    pub fn subscribe(
        &self,
        channel: &str,
        replay_from: i64,
        on_event: EventConsumer,
    ) -> Result<SubscriptionHandle, ConnectorError> {
        let _gate = self
            .inner
            .subscribing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (credential, client_id, generation, previous) = {
            let mut session = self.inner.lock_session();
            if !matches!(session.state, ConnectorState::Connected | ConnectorState::Streaming) {
                return Err(ConnectorError::StateConflict {
                    state: session.state,
                    operation: "subscribe",
                });
            }
            let Some((credential, client_id)) = session.endpoint() else {
                return Err(ConnectorError::StateConflict {
                    state: session.state,
                    operation: "subscribe",
                });
            };
            session.state = ConnectorState::Subscribing;
            // Registered before the request so events racing the reply are not lost.
            let previous = session.subscriptions.insert(
                channel.to_string(),
                ChannelEntry {
                    replay_from,
                    consumer: on_event,
                    token,
                },
            );
            (credential, client_id, session.generation, previous)
        };

        let mut messages = Vec::with_capacity(2);
        if previous.is_some() {
            messages.push(Message::unsubscribe(self.inner.next_id(), &client_id, channel));
        }
        messages.push(Message::subscribe(self.inner.next_id(), &client_id, channel, replay_from));
        debug!(channel, replay_from, "bayeux subscribe");

        let outcome = self
            .inner
            .request(&credential, messages, self.inner.config.subscribe_timeout, "subscribe")
            .and_then(|replies| {
                let meta = self.inner.process(replies, generation);
                let reply = meta.iter().find(|m| {
                    m.meta_channel() == Some(MetaChannel::Subscribe) && m.subscriptions().contains(&channel)
                });
                match reply {
                    Some(r) if r.is_successful() => Ok(()),
                    Some(r) => Err(ConnectorError::SubscribeRejected {
                        channel: channel.to_string(),
                        message: r.error_message(),
                    }),
                    None => Err(ConnectorError::MissingReply {
                        channel: MetaChannel::Subscribe.as_str().to_string(),
                        field: "subscription acknowledgement",
                    }),
                }
            });

        let mut session = self.inner.lock_session();
        if session.generation != generation {
            return Err(ConnectorError::StateConflict {
                state: session.state,
                operation: "subscribe",
            });
        }
        match outcome {
            Ok(()) => {
                session.state = ConnectorState::Streaming;
                info!(channel, replay_from, "subscribed");
                Ok(SubscriptionHandle {
                    channel: channel.to_string(),
                    token,
                    inner: Arc::downgrade(&self.inner),
                    cancelled: AtomicBool::new(false),
                })
            }
            Err(err) => {
                match previous {
                    Some(entry) => {
                        session.subscriptions.insert(channel.to_string(), entry);
                    }
                    None => {
                        session.subscriptions.remove(channel);
                    }
                }
                if matches!(err, ConnectorError::Transport(_)) {
                    session.state = ConnectorState::Error;
                    session.last_error = Some(err.to_string());
                } else if session.subscriptions.is_empty() {
                    session.state = ConnectorState::Connected;
                } else {
                    session.state = ConnectorState::Streaming;
                }
                Err(err)
            }
        }
    }

    /// Best-effort unsubscribe; does not wait for confirmation.
    pub fn unsubscribe(&self, channel: &str) {
        self.inner.unsubscribe(channel, None);
    }

    /// Cancel all subscriptions and tear down the session. No-op when idle.
    pub fn stop(&self) {
        let Some((endpoint, channels, generation)) = self.inner.begin_teardown() else {
            return;
        };

        if let Some((credential, client_id)) = endpoint {
            let mut messages: Vec<Message> = channels
                .iter()
                .map(|channel| Message::unsubscribe(self.inner.next_id(), &client_id, channel))
                .collect();
            messages.push(Message::disconnect(self.inner.next_id(), &client_id));
            match self
                .inner
                .request(&credential, messages, self.inner.config.handshake_timeout, "disconnect")
            {
                Ok(replies) => {
                    self.inner.notify(&replies);
                }
                Err(e) => debug!(error = %e, "disconnect not acknowledged"),
            }
        }

        self.inner.finish_teardown(generation);
        info!("bayeux session stopped");
    }
}

impl Drop for StreamingConnector {
    fn drop(&mut self) {
        // No network on drop: invalidate the session so the connect loop exits
        // after its in-flight poll returns.
        if let Some((_, _, generation)) = self.inner.begin_teardown() {
            self.inner.finish_teardown(generation);
        }
    }
}

/// Handle to one channel subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    channel: String,
    token: u64,
    inner: Weak<Inner>,
    cancelled: AtomicBool,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Best-effort unsubscribe of this subscription. Idempotent.
    ///
    /// Has no effect if the channel has since been resubscribed by another call.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.channel, Some(self.token));
        }
    }
}

impl Inner {
    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_current(&self, generation: u64) -> bool {
        let session = self.lock_session();
        session.generation == generation && session.state.is_active()
    }

    /// One exchange on a helper thread, waiting at most `timeout` for the reply.
    fn request(
        &self,
        credential: &Credential,
        messages: Vec<Message>,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<Vec<Message>, ConnectorError> {
        let (tx, rx) = bounded(1);
        let transport = Arc::clone(&self.transport);
        let credential = credential.clone();
        thread::Builder::new()
            .name(format!("eventlink-{operation}"))
            .spawn(move || {
                let _ = tx.send(transport.exchange(&credential, &messages));
            })
            .map_err(|e| TransportError::ConnectionFailed {
                message: format!("failed to spawn {operation} request: {e}"),
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => Err(ConnectorError::Timeout {
                operation,
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(ConnectorError::Transport(TransportError::ConnectionFailed {
                message: format!("{operation} request ended without a reply"),
            })),
        }
    }

    /// Handshake and return the new client id.
    fn handshake(&self, credential: &Credential, generation: u64) -> Result<String, ConnectorError> {
        let replies = self.request(
            credential,
            vec![Message::handshake(self.next_id())],
            self.config.handshake_timeout,
            "handshake",
        )?;
        let meta = self.process(replies, generation);
        let reply = meta
            .into_iter()
            .find(|m| m.meta_channel() == Some(MetaChannel::Handshake))
            .ok_or_else(|| ConnectorError::MissingReply {
                channel: MetaChannel::Handshake.as_str().to_string(),
                field: "handshake reply",
            })?;
        if !reply.is_successful() {
            return Err(ConnectorError::HandshakeRejected {
                message: reply.error_message(),
            });
        }
        reply.client_id.ok_or_else(|| ConnectorError::MissingReply {
            channel: MetaChannel::Handshake.as_str().to_string(),
            field: "clientId",
        })
    }

    /// Server asked for a new handshake: get a new client id and resubscribe
    /// every channel from the last delivered replay id.
    fn rehandshake(&self, generation: u64) -> Result<(), ConnectorError> {
        let Some(credential) = self.lock_session().credential.clone() else {
            return Err(ConnectorError::StateConflict {
                state: ConnectorState::Idle,
                operation: "handshake",
            });
        };
        let client_id = self.handshake(&credential, generation)?;

        let cursors: Vec<(String, i64)> = {
            let mut session = self.lock_session();
            if session.generation != generation {
                return Ok(());
            }
            session.client_id = Some(client_id.clone());
            session
                .subscriptions
                .iter()
                .map(|(channel, entry)| (channel.clone(), entry.replay_from))
                .collect()
        };
        info!(client_id = %client_id, channels = cursors.len(), "bayeux re-handshake");
        if cursors.is_empty() {
            return Ok(());
        }

        let messages = cursors
            .iter()
            .map(|(channel, replay_from)| Message::subscribe(self.next_id(), &client_id, channel, *replay_from))
            .collect();
        let replies = self.request(&credential, messages, self.config.subscribe_timeout, "subscribe")?;
        let meta = self.process(replies, generation);
        for (channel, _) in &cursors {
            let acked = meta.iter().any(|m| {
                m.meta_channel() == Some(MetaChannel::Subscribe)
                    && m.is_successful()
                    && m.subscriptions().contains(&channel.as_str())
            });
            if !acked {
                return Err(ConnectorError::SubscribeRejected {
                    channel: channel.clone(),
                    message: "resubscribe after re-handshake not acknowledged".to_string(),
                });
            }
        }
        Ok(())
    }

    fn unsubscribe(&self, channel: &str, token: Option<u64>) {
        let endpoint = {
            let mut session = self.lock_session();
            let matches = session
                .subscriptions
                .get(channel)
                .is_some_and(|entry| token.map_or(true, |t| t == entry.token));
            if !matches {
                return;
            }
            session.subscriptions.remove(channel);
            if session.state == ConnectorState::Streaming && session.subscriptions.is_empty() {
                session.state = ConnectorState::Connected;
            }
            session.endpoint()
        };
        debug!(channel, "bayeux unsubscribe");

        let Some((credential, client_id)) = endpoint else {
            return;
        };
        let message = Message::unsubscribe(self.next_id(), &client_id, channel);
        let transport = Arc::clone(&self.transport);
        let observers = self.observer_snapshot();
        let spawned = thread::Builder::new()
            .name("eventlink-unsubscribe".to_string())
            .spawn(move || match transport.exchange(&credential, &[message]) {
                Ok(replies) => notify_observers(&observers, &replies),
                Err(e) => debug!(error = %e, "unsubscribe not delivered"),
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn unsubscribe request");
        }
    }

    /// Move to `Disconnecting` and detach subscriptions. `None` when already idle.
    #[allow(clippy::type_complexity)]
    fn begin_teardown(&self) -> Option<(Option<(Credential, String)>, Vec<String>, u64)> {
        let mut session = self.lock_session();
        if session.state == ConnectorState::Idle {
            return None;
        }
        session.generation += 1;
        let endpoint = if session.state == ConnectorState::Error {
            None
        } else {
            session.endpoint()
        };
        session.state = ConnectorState::Disconnecting;
        let channels: Vec<String> = session.subscriptions.drain().map(|(channel, _)| channel).collect();
        Some((endpoint, channels, session.generation))
    }

    fn finish_teardown(&self, generation: u64) {
        {
            let mut session = self.lock_session();
            if session.generation == generation {
                session.state = ConnectorState::Idle;
                session.client_id = None;
                session.credential = None;
            }
        }
        // The loop may be parked in a long-poll; it exits on its own once the
        // poll returns and sees the generation change.
        if let Ok(mut guard) = self.connect_loop.lock() {
            drop(guard.take());
        }
    }

    fn fail(&self, generation: u64, err: &ConnectorError) {
        {
            let mut session = self.lock_session();
            if session.generation != generation {
                return;
            }
            session.state = ConnectorState::Error;
            session.last_error = Some(err.to_string());
        }
        let failure = Message {
            channel: MetaChannel::Connect.as_str().to_string(),
            successful: Some(false),
            error: Some(err.to_string()),
            ..Message::default()
        };
        self.notify(std::slice::from_ref(&failure));
    }

    fn observer_snapshot(&self) -> HashMap<MetaChannel, Vec<Arc<dyn MetaObserver>>> {
        self.observers.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn notify(&self, messages: &[Message]) {
        notify_observers(&self.observer_snapshot(), messages);
    }

    /// Notify observers of meta replies, deliver data messages, return the meta replies.
    fn process(&self, messages: Vec<Message>, generation: u64) -> Vec<Message> {
        self.notify(&messages);
        let (meta, data): (Vec<Message>, Vec<Message>) = messages.into_iter().partition(Message::is_meta);
        if !data.is_empty() {
            self.deliver(&data, generation);
        }
        meta
    }

    fn deliver(&self, data: &[Message], generation: u64) {
        // One batch at a time so consumers never run concurrently.
        let _delivery = self.delivery.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        for message in data {
            let Some(event) = StreamEvent::from_message(message) else {
                debug!(channel = %message.channel, "ignoring message without object payload");
                continue;
            };

            let consumer = {
                let session = self.lock_session();
                if session.generation != generation {
                    return;
                }
                session.subscriptions.get(&event.channel).map(|e| Arc::clone(&e.consumer))
            };
            let Some(consumer) = consumer else {
                debug!(channel = %event.channel, "event for unsubscribed channel dropped");
                continue;
            };

            let channel = event.channel.clone();
            let replay_id = event.replay_id;
            if catch_unwind(AssertUnwindSafe(|| consumer(event))).is_err() {
                warn!(channel = %channel, replay_id = ?replay_id, "event consumer panicked");
            }

            if let Some(replay_id) = replay_id {
                let mut session = self.lock_session();
                if let Some(entry) = session.subscriptions.get_mut(&channel) {
                    if replay_id > entry.replay_from {
                        entry.replay_from = replay_id;
                    }
                }
            }
        }
    }
}

fn notify_observers(observers: &HashMap<MetaChannel, Vec<Arc<dyn MetaObserver>>>, messages: &[Message]) {
    for message in messages {
        let Some(channel) = message.meta_channel() else {
            continue;
        };
        if let Some(list) = observers.get(&channel) {
            for observer in list {
                observer.on_message(channel, message);
            }
        }
    }
}

fn connect_loop(inner: &Inner, generation: u64) {
    debug!(generation, "connect loop started");
    loop {
        let endpoint = {
            let session = inner.lock_session();
            if session.generation != generation || !session.state.is_active() {
                break;
            }
            session.endpoint()
        };
        let Some((credential, client_id)) = endpoint else {
            break;
        };

        let result = inner
            .transport
            .exchange(&credential, &[Message::connect(inner.next_id(), &client_id)]);
        if !inner.is_current(generation) {
            break;
        }

        let replies = match result {
            Ok(replies) => replies,
            Err(e) => {
                let err = ConnectorError::Transport(e);
                error!(error = %err, "connect failed, session is down");
                inner.fail(generation, &err);
                break;
            }
        };

        let meta = inner.process(replies, generation);
        let reply = meta.iter().find(|m| m.meta_channel() == Some(MetaChannel::Connect));
        let advice = reply.and_then(|r| r.advice.clone()).unwrap_or_default();

        match advice.reconnect {
            Some(Reconnect::Handshake) => {
                if let Err(e) = inner.rehandshake(generation) {
                    error!(error = %e, "re-handshake failed, session is down");
                    inner.fail(generation, &e);
                    break;
                }
                continue;
            }
            Some(Reconnect::None) => {
                let err = ConnectorError::HandshakeRejected {
                    message: reply.map_or_else(
                        || "server advised not to reconnect".to_string(),
                        Message::error_message,
                    ),
                };
                error!(error = %err, "server closed the session");
                inner.fail(generation, &err);
                break;
            }
            Some(Reconnect::Retry) | None => {}
        }

        if let Some(r) = reply {
            if !r.is_successful() {
                let err = ConnectorError::Transport(TransportError::Status {
                    status: 0,
                    message: r.error_message(),
                });
                error!(error = %err, "connect rejected, session is down");
                inner.fail(generation, &err);
                break;
            }
        }

        if let Some(interval) = advice.interval.filter(|ms| *ms > 0) {
            thread::sleep(Duration::from_millis(interval));
        }
    }
    debug!(generation, "connect loop exited");
}
