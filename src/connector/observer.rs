//! Meta-channel observers.
//!
//! Observers see every handshake/connect/subscribe/unsubscribe/disconnect reply
//! and are for diagnostics only. They run on whichever thread processed the
//! reply and must not block.

use tracing::{debug, warn};

use crate::bayeux::{Message, MetaChannel};

/// Receives meta-channel replies.
pub trait MetaObserver: Send + Sync {
    fn on_message(&self, channel: MetaChannel, message: &Message);
}

impl<F> MetaObserver for F
where
    F: Fn(MetaChannel, &Message) + Send + Sync,
{
    fn on_message(&self, channel: MetaChannel, message: &Message) {
        self(channel, message);
    }
}

/// Logs meta replies through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LoggingObserver {
    log_success: bool,
    log_failure: bool,
}

impl LoggingObserver {
    #[must_use]
    pub const fn new(log_success: bool, log_failure: bool) -> Self {
        Self {
            log_success,
            log_failure,
        }
    }
}

impl Default for LoggingObserver {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl MetaObserver for LoggingObserver {
    fn on_message(&self, channel: MetaChannel, message: &Message) {
        if message.is_successful() {
            if self.log_success {
                debug!(
                    channel = %channel,
                    client_id = message.client_id.as_deref().unwrap_or(""),
                    subscription = ?message.subscriptions(),
                    "bayeux meta reply"
                );
            }
        } else if self.log_failure {
            warn!(
                channel = %channel,
                client_id = message.client_id.as_deref().unwrap_or(""),
                error = %message.error_message(),
                advice = ?message.advice,
                "bayeux meta failure"
            );
        }
    }
}
