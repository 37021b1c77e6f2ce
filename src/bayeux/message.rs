//! Bayeux message model.
//!
//! Field names follow the protocol's camelCase JSON. Only the fields the
//! long-polling client sends or inspects are modelled; the rest round-trip
//! through `ext` and `data` untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only connection type this client speaks.
pub const LONG_POLLING: &str = "long-polling";

/// Bayeux protocol version sent in the handshake.
pub const BAYEUX_VERSION: &str = "1.0";

/// Protocol meta channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaChannel {
    Handshake,
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
}

impl MetaChannel {
    /// Every meta channel, in protocol order.
    pub const ALL: [Self; 5] = [
        Self::Handshake,
        Self::Connect,
        Self::Subscribe,
        Self::Unsubscribe,
        Self::Disconnect,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "/meta/handshake",
            Self::Connect => "/meta/connect",
            Self::Subscribe => "/meta/subscribe",
            Self::Unsubscribe => "/meta/unsubscribe",
            Self::Disconnect => "/meta/disconnect",
        }
    }

    #[must_use]
    pub fn parse(channel: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == channel)
    }
}

impl std::fmt::Display for MetaChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server wants the client to do after a connect reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

/// Server advice attached to meta replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds to wait before the next connect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server holds a connect open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A single Bayeux message.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
}

impl Message {
    fn meta(channel: MetaChannel, id: u64) -> Self {
        Self {
            channel: channel.as_str().to_string(),
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    /// Handshake request advertising the replay extension.
    #[must_use]
    pub fn handshake(id: u64) -> Self {
        let mut ext = Map::new();
        ext.insert("replay".to_string(), Value::Bool(true));
        Self {
            version: Some(BAYEUX_VERSION.to_string()),
            minimum_version: Some(BAYEUX_VERSION.to_string()),
            supported_connection_types: Some(vec![LONG_POLLING.to_string()]),
            ext: Some(ext),
            ..Self::meta(MetaChannel::Handshake, id)
        }
    }

    #[must_use]
    pub fn connect(id: u64, client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            connection_type: Some(LONG_POLLING.to_string()),
            ..Self::meta(MetaChannel::Connect, id)
        }
    }

    /// Subscribe request carrying the replay cursor for `channel`.
    #[must_use]
    pub fn subscribe(id: u64, client_id: &str, channel: &str, replay_from: i64) -> Self {
        let mut cursors = Map::new();
        cursors.insert(channel.to_string(), Value::from(replay_from));
        let mut ext = Map::new();
        ext.insert("replay".to_string(), Value::Object(cursors));
        Self {
            client_id: Some(client_id.to_string()),
            subscription: Some(Value::String(channel.to_string())),
            ext: Some(ext),
            ..Self::meta(MetaChannel::Subscribe, id)
        }
    }

    #[must_use]
    pub fn unsubscribe(id: u64, client_id: &str, channel: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            subscription: Some(Value::String(channel.to_string())),
            ..Self::meta(MetaChannel::Unsubscribe, id)
        }
    }

    #[must_use]
    pub fn disconnect(id: u64, client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Self::meta(MetaChannel::Disconnect, id)
        }
    }

    #[must_use]
    pub fn meta_channel(&self) -> Option<MetaChannel> {
        MetaChannel::parse(&self.channel)
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }

    /// Server error text, or a placeholder when the reply carries none.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| format!("{} failed without error text", self.channel))
    }

    /// Channels named in the `subscription` field (string or array form).
    #[must_use]
    pub fn subscriptions(&self) -> Vec<&str> {
        match &self.subscription {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Replay cursor sent in the `ext.replay` map for `channel`.
    #[must_use]
    pub fn replay_cursor(&self, channel: &str) -> Option<i64> {
        self.ext.as_ref()?.get("replay")?.get(channel)?.as_i64()
    }

    /// Replay id of a data message (`data.event.replayId`).
    #[must_use]
    pub fn replay_id(&self) -> Option<i64> {
        self.data.as_ref()?.get("event")?.get("replayId")?.as_i64()
    }
}

/// An inbound data message on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub channel: String,
    pub payload: Map<String, Value>,
    pub replay_id: Option<i64>,
}

impl StreamEvent {
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: Map<String, Value>, replay_id: Option<i64>) -> Self {
        Self {
            channel: channel.into(),
            payload,
            replay_id,
        }
    }

    /// Build from a data message. Meta messages and non-object payloads yield `None`.
    #[must_use]
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.is_meta() {
            return None;
        }
        let Some(Value::Object(payload)) = &message.data else {
            return None;
        };
        Some(Self {
            channel: message.channel.clone(),
            payload: payload.clone(),
            replay_id: message.replay_id(),
        })
    }
}
