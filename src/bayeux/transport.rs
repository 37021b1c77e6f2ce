//! Request/response transport for Bayeux messages.
//!
//! Long-polling is plain HTTP: every exchange POSTs a JSON array of messages and
//! the response body is a JSON array of replies (and, for `/meta/connect`, any
//! data messages that arrived while the request was held).

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::StatusCode;

use crate::auth::Credential;
use crate::error::TransportError;

use super::message::Message;

/// Sends a batch of messages and returns the server's replies.
///
/// Implementations must be callable from several threads at once: the connect
/// loop holds one long-poll open while callers issue subscribe requests.
pub trait Transport: Send + Sync {
    /// Perform one exchange.
    fn exchange(&self, credential: &Credential, messages: &[Message]) -> Result<Vec<Message>, TransportError>;
}

/// HTTP long-polling transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    api_version: String,
}

impl HttpTransport {
    /// `timeout` bounds each request and must exceed the server's long-poll hold.
    pub fn new(api_version: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| TransportError::ConnectionFailed { message: e.to_string() })?;
        Ok(Self {
            client,
            api_version: api_version.into(),
        })
    }

    /// Streaming endpoint for the credential's instance.
    #[must_use]
    pub fn endpoint(&self, credential: &Credential) -> String {
        format!("{}/cometd/{}", credential.instance_url(), self.api_version)
    }
}

impl Transport for HttpTransport {
    fn exchange(&self, credential: &Credential, messages: &[Message]) -> Result<Vec<Message>, TransportError> {
        let body = serde_json::to_vec(messages).map_err(|e| TransportError::Encode { message: e.to_string() })?;

        let response = self
            .client
            .post(self.endpoint(credential))
            .bearer_auth(credential.access_token())
            .header("Content-Type", "application/json;charset=UTF-8")
            .body(body)
            .send()
            .map_err(|e| TransportError::ConnectionFailed { message: e.to_string() })?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| TransportError::ConnectionFailed { message: e.to_string() })?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TransportError::Unauthorized {
                status: status.as_u16(),
                message: text,
            });
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                message: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| TransportError::Decode { message: e.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_uses_instance_and_version() {
        let transport = HttpTransport::new("59.0", Duration::from_secs(120)).unwrap();
        let credential = Credential::new("t", "https://acme.my.salesforce.com/");
        assert_eq!(transport.endpoint(&credential), "https://acme.my.salesforce.com/cometd/59.0");
    }
}
