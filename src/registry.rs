//! Subscription bookkeeping for one listener.
//!
//! Tracks registered services (in registration order) and one replay cursor per
//! channel. There is no locking here; the owner wraps the registry in a mutex.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bayeux::StreamEvent;
use crate::error::ConfigError;

/// Result type returned by event handlers.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A consumer of stream events.
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are reported by the dispatcher and never stop the stream.
    fn on_event(&self, event: &StreamEvent) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&StreamEvent) -> HandlerResult + Send + Sync,
{
    fn on_event(&self, event: &StreamEvent) -> HandlerResult {
        self(event)
    }
}

/// Replay position for a channel subscription.
///
/// Raw values go on the wire unchanged, so a cursor always means what the
/// streaming endpoint makes of it: `-1` starts at the tip (new events only),
/// `-2` replays every retained event, and `n >= 0` resumes after replay id `n`.
/// `LATEST` and `EARLIEST` name those two endpoint meanings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplayFrom(i64);

impl ReplayFrom {
    /// Only events published after the subscription.
    pub const LATEST: Self = Self(-1);
    /// Every event still retained by the server.
    pub const EARLIEST: Self = Self(-2);

    /// Wrap a raw cursor without validation.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn try_from_raw(raw: i64) -> Result<Self, ConfigError> {
        if raw < -2 {
            return Err(ConfigError::InvalidReplayFrom { value: raw });
        }
        Ok(Self(raw))
    }

    /// Resume after a specific replay id.
    #[must_use]
    pub const fn after(replay_id: i64) -> Self {
        Self(replay_id)
    }

    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// True once the cursor points at a concrete replay id.
    #[must_use]
    pub const fn is_positioned(self) -> bool {
        self.0 >= 0
    }

    /// Cursor after processing `replay_id`. Never moves backwards.
    #[must_use]
    pub const fn advanced_to(self, replay_id: i64) -> Self {
        if replay_id > self.0 {
            Self(replay_id)
        } else {
            self
        }
    }
}

impl Default for ReplayFrom {
    fn default() -> Self {
        Self::LATEST
    }
}

/// Unique identifier for a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Create a new random service id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A consumer bound to exactly one channel.
#[derive(Clone)]
pub struct RegisteredService {
    pub id: ServiceId,
    pub channel: String,
    pub handler: Arc<dyn EventHandler>,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Per-channel replay state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub channel: String,
    pub replay_from: ReplayFrom,
}

/// Services and channel cursors of one listener.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    services: Vec<RegisteredService>,
    channels: Vec<ChannelSubscription>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` on `channel`. The channel starts at `default_cursor`
    /// unless it already has a cursor.
    pub fn register(&mut self, channel: &str, handler: Arc<dyn EventHandler>, default_cursor: ReplayFrom) -> ServiceId {
        if !self.channels.iter().any(|c| c.channel == channel) {
            self.channels.push(ChannelSubscription {
                channel: channel.to_string(),
                replay_from: default_cursor,
            });
        }
        let id = ServiceId::new();
        self.services.push(RegisteredService {
            id,
            channel: channel.to_string(),
            handler,
        });
        id
    }

    /// Remove one service. Returns it and whether its channel lost its last service.
    pub fn deregister(&mut self, id: ServiceId) -> Option<(RegisteredService, bool)> {
        let idx = self.services.iter().position(|s| s.id == id)?;
        let service = self.services.remove(idx);
        let orphaned = !self.services.iter().any(|s| s.channel == service.channel);
        if orphaned {
            self.channels.retain(|c| c.channel != service.channel);
        }
        Some((service, orphaned))
    }

    /// Remove every service on `channel` and its cursor. Returns the removed count.
    pub fn deregister_channel(&mut self, channel: &str) -> usize {
        let before = self.services.len();
        self.services.retain(|s| s.channel != channel);
        self.channels.retain(|c| c.channel != channel);
        before - self.services.len()
    }

    /// Services on `channel`, in registration order.
    #[must_use]
    pub fn services_for(&self, channel: &str) -> Vec<RegisteredService> {
        self.services.iter().filter(|s| s.channel == channel).cloned().collect()
    }

    #[must_use]
    pub fn services(&self) -> &[RegisteredService] {
        &self.services
    }

    /// Channel cursors, in first-registration order.
    #[must_use]
    pub fn channels(&self) -> &[ChannelSubscription] {
        &self.channels
    }

    #[must_use]
    pub fn cursor(&self, channel: &str) -> Option<ReplayFrom> {
        self.channels.iter().find(|c| c.channel == channel).map(|c| c.replay_from)
    }

    /// Record that `replay_id` was processed on `channel`. Monotonic.
    pub fn advance(&mut self, channel: &str, replay_id: i64) {
        if let Some(c) = self.channels.iter_mut().find(|c| c.channel == channel) {
            c.replay_from = c.replay_from.advanced_to(replay_id);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }
}
