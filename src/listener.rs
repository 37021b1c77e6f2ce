//! Listener facade.
//!
//! One `Listener` owns one streaming session: credentials, the connector, the
//! dispatcher worker and the registry of services. Services can be attached
//! before or after `start`; channels resume from the registry cursor every
//! time a session is (re)opened.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::auth::{CredentialProvider, LoginClient, SoapLogin};
use crate::bayeux::{HttpTransport, MetaChannel, Transport};
use crate::config::ListenerConfig;
use crate::connector::{ConnectorState, LoggingObserver, MetaObserver, StreamingConnector, SubscriptionHandle};
use crate::dispatcher::{DispatchStats, EventDispatcher};
use crate::error::{ConnectorError, ListenerResult};
use crate::registry::{ChannelSubscription, EventHandler, ReplayFrom, ServiceId, SubscriptionRegistry};

struct Session {
    connector: StreamingConnector,
    dispatcher: EventDispatcher,
    handles: HashMap<String, SubscriptionHandle>,
}

impl Session {
    fn is_subscribable(&self) -> bool {
        matches!(
            self.connector.state(),
            ConnectorState::Connected | ConnectorState::Streaming
        )
    }

    fn subscribe(&mut self, channel: &str, cursor: ReplayFrom) -> Result<(), ConnectorError> {
        let consumer = self.dispatcher.sink().into_consumer();
        let handle = self.connector.subscribe(channel, cursor.raw(), consumer)?;
        self.handles.insert(channel.to_string(), handle);
        Ok(())
    }

    fn unsubscribe(&mut self, channel: &str) {
        if let Some(handle) = self.handles.remove(channel) {
            handle.cancel();
        }
    }

    /// Stop the connector first so nothing new is queued, then drain.
    fn close(self) {
        self.connector.stop();
        self.dispatcher.shutdown();
    }
}

/// Streaming listener for a set of channels.
pub struct Listener {
    config: ListenerConfig,
    credentials: CredentialProvider,
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Listener using the given login exchange and transport.
    pub fn new(config: ListenerConfig, login: Arc<dyn LoginClient>, transport: Arc<dyn Transport>) -> ListenerResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            credentials: CredentialProvider::new(login),
            transport,
            registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
            session: Mutex::new(None),
        })
    }

    /// Listener with SOAP login and the HTTP long-polling transport.
    pub fn from_config(config: ListenerConfig) -> ListenerResult<Self> {
        config.validate()?;
        let login = SoapLogin::from_config(&config)?;
        let transport =
            HttpTransport::new(config.api_version.clone(), config.http_timeout()).map_err(ConnectorError::from)?;
        Self::new(config, Arc::new(login), Arc::new(transport))
    }

    #[must_use]
    pub const fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Register `handler` for events on `channel`.
    ///
    /// While a session is open, the first service on a channel subscribes it
    /// right away. If that subscription fails the service is not registered.
    pub fn attach(&self, channel: &str, handler: Arc<dyn EventHandler>) -> ListenerResult<ServiceId> {
        let mut session = self.lock_session();
        let (id, cursor, first) = {
            let mut registry = self.lock_registry();
            let first = registry.cursor(channel).is_none();
            let id = registry.register(channel, handler, self.config.default_replay_from());
            (id, registry.cursor(channel).unwrap_or_default(), first)
        };
        debug!(service = %id, channel, "service attached");

        if first {
            if let Some(active) = session.as_mut().filter(|s| s.is_subscribable()) {
                if let Err(e) = active.subscribe(channel, cursor) {
                    self.lock_registry().deregister(id);
                    return Err(e.into());
                }
            }
        }
        Ok(id)
    }

    /// Remove one service. Returns false if it was not registered.
    ///
    /// When it was the channel's last service the channel is unsubscribed.
    pub fn detach(&self, id: ServiceId) -> bool {
        let mut session = self.lock_session();
        let Some((service, orphaned)) = self.lock_registry().deregister(id) else {
            return false;
        };
        debug!(service = %id, channel = %service.channel, orphaned, "service detached");
        if orphaned {
            if let Some(active) = session.as_mut() {
                active.unsubscribe(&service.channel);
            }
        }
        true
    }

    /// Remove every service on `channel` and unsubscribe it. Returns the removed count.
    pub fn deregister_channel(&self, channel: &str) -> usize {
        let mut session = self.lock_session();
        let removed = self.lock_registry().deregister_channel(channel);
        if removed > 0 {
            if let Some(active) = session.as_mut() {
                active.unsubscribe(channel);
            }
        }
        removed
    }

    /// Log in, handshake and subscribe every registered channel.
    ///
    /// Fails with a state conflict while a session is open. After `stop` or
    /// once the session has failed, opens a fresh session that resumes each
    /// channel after its last processed replay id.
    pub fn start(&self, username: &str, password: &str) -> ListenerResult<()> {
        let stale = {
            let mut session = self.lock_session();
            if let Some(existing) = session.as_ref() {
                let state = existing.connector.state();
                if !state.can_start() {
                    return Err(ConnectorError::StateConflict {
                        state,
                        operation: "start",
                    }
                    .into());
                }
            }
            session.take()
        };
        if let Some(stale) = stale {
            debug!("closing failed session before restart");
            stale.close();
        }

        let mut session = self.lock_session();
        if session.is_some() {
            return Err(ConnectorError::StateConflict {
                state: state_of(session.as_ref()),
                operation: "start",
            }
            .into());
        }

        let credential = self.credentials.obtain_token(username, password)?;

        let connector = StreamingConnector::new(self.config.connector_config(), Arc::clone(&self.transport));
        let observer: Arc<dyn MetaObserver> = Arc::new(LoggingObserver::default());
        for channel in MetaChannel::ALL {
            connector.add_observer(channel, Arc::clone(&observer));
        }
        connector.start(credential)?;

        let dispatcher = match EventDispatcher::start(self.config.dispatcher_config(), Arc::clone(&self.registry)) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                connector.stop();
                return Err(e.into());
            }
        };

        let mut opened = Session {
            connector,
            dispatcher,
            handles: HashMap::new(),
        };
        let channels: Vec<ChannelSubscription> = self.lock_registry().channels().to_vec();
        for channel in &channels {
            if let Err(e) = opened.subscribe(&channel.channel, channel.replay_from) {
                warn!(channel = %channel.channel, error = %e, "subscription failed, closing session");
                drop(session);
                opened.close();
                return Err(e.into());
            }
        }

        info!(channels = channels.len(), "listener started");
        *session = Some(opened);
        Ok(())
    }

    /// Close the session. Events already queued are still dispatched. Idempotent.
    pub fn stop(&self) {
        // Closing joins the dispatcher worker, whose handlers may call back
        // into this listener, so close outside the session lock.
        let taken = self.lock_session().take();
        if let Some(session) = taken {
            session.close();
            info!("listener stopped");
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectorState {
        state_of(self.lock_session().as_ref())
    }

    /// Replay cursor `channel` would resume from.
    #[must_use]
    pub fn cursor(&self, channel: &str) -> Option<ReplayFrom> {
        self.lock_registry().cursor(channel)
    }

    /// Dispatcher counters of the open session.
    #[must_use]
    pub fn dispatch_stats(&self) -> Option<DispatchStats> {
        self.lock_session().as_ref().map(|s| s.dispatcher.stats())
    }

    /// Message of the failure that put the session into `Error`.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.lock_session().as_ref().and_then(|s| s.connector.last_error())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn state_of(session: Option<&Session>) -> ConnectorState {
    session.map_or(ConnectorState::Idle, |s| s.connector.state())
}
