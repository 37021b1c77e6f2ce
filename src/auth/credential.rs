use chrono::{DateTime, Utc};

/// Opaque bearer credential for the streaming endpoint.
///
/// The token is never persisted and is redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    access_token: String,
    instance_url: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential issued now without a known expiry.
    pub fn new(access_token: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            issued_at: Utc::now(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Base URL of the org instance, without a trailing slash.
    #[must_use]
    pub fn instance_url(&self) -> &str {
        &self.instance_url
    }

    #[must_use]
    pub const fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Credentials without an expiry never expire locally; the server decides.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("instance_url", &self.instance_url)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    #[test]
    fn debug_redacts_token() {
        let credential = Credential::new("00Dxx!secret", "https://example.my.salesforce.com/");
        let dbg = format!("{credential:?}");
        assert!(!dbg.contains("secret"));
        assert_eq!(credential.instance_url(), "https://example.my.salesforce.com");
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        let credential = Credential::new("t", "https://x");
        assert!(!credential.is_expired_at(now + Duration::days(365)));

        let credential = credential.with_expires_at(now + Duration::minutes(5));
        assert!(!credential.is_expired_at(now));
        assert!(credential.is_expired_at(now + Duration::minutes(5)));
    }
}
