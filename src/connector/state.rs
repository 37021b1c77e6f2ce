/// Lifecycle of a streaming session.
///
/// `Idle -> Handshaking -> Connected -> Subscribing -> Streaming -> Disconnecting -> Idle`,
/// with `Error` reachable from any non-idle state on an unrecoverable transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    Idle,
    Handshaking,
    Connected,
    Subscribing,
    Streaming,
    Disconnecting,
    Error,
}

impl ConnectorState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }

    /// A session exists and has not failed or been torn down.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Handshaking | Self::Connected | Self::Subscribing | Self::Streaming | Self::Disconnecting
        )
    }

    /// `start` is allowed from here.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl std::fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
