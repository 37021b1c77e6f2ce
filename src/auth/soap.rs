//! Username/password login through the partner SOAP endpoint.
//!
//! The response is small and fixed-shape, so the handful of elements we need
//! are pulled out by tag name instead of running a full XML parser.

use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::Client;
use tracing::debug;

use crate::config::ListenerConfig;
use crate::error::AuthError;

use super::{Credential, LoginClient};

/// `LoginClient` backed by the SOAP `login` call.
#[derive(Debug, Clone)]
pub struct SoapLogin {
    client: Client,
    login_url: String,
    api_version: String,
}

impl SoapLogin {
    pub fn new(login_url: impl Into<String>, api_version: impl Into<String>, timeout: Duration) -> Result<Self, AuthError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| AuthError::Transport {
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            login_url: login_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        })
    }

    /// Login client for the host and API version named by `config`.
    pub fn from_config(config: &ListenerConfig) -> Result<Self, AuthError> {
        Self::new(config.login_url(), config.api_version.clone(), config.http_timeout())
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/services/Soap/u/{}", self.login_url, self.api_version)
    }
}

impl LoginClient for SoapLogin {
    fn login(&self, username: &str, password: &str) -> Result<Credential, AuthError> {
        let endpoint = self.endpoint();
        debug!(endpoint = %endpoint, "soap login");

        let response = self
            .client
            .post(&endpoint)
            .header("Content-Type", "text/xml; charset=UTF-8")
            .header("SOAPAction", "login")
            .body(login_envelope(username, password))
            .send()
            .map_err(|e| AuthError::Transport { message: e.to_string() })?;

        let status = response.status();
        let body = response.text().map_err(|e| AuthError::Transport { message: e.to_string() })?;
        interpret_login_response(status.as_u16(), &body)
    }
}

fn login_envelope(username: &str, password: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>",
            "<env:Envelope xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\" ",
            "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ",
            "xmlns:env=\"http://schemas.xmlsoap.org/soap/envelope/\">",
            "<env:Body><n1:login xmlns:n1=\"urn:partner.soap.sforce.com\">",
            "<n1:username>{}</n1:username><n1:password>{}</n1:password>",
            "</n1:login></env:Body></env:Envelope>"
        ),
        escape_xml(username),
        escape_xml(password)
    )
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_xml(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text content of the first element whose local name is `name`.
fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = xml;
    while let Some(open) = rest.find('<') {
        rest = &rest[open + 1..];
        let end = rest.find('>')?;
        let tag = &rest[..end];
        let local = tag.split_whitespace().next()?.rsplit(':').next()?;
        if local == name && !tag.starts_with('/') && !tag.ends_with('/') {
            let body = &rest[end + 1..];
            let close = body.find("</")?;
            return Some(&body[..close]);
        }
    }
    None
}

/// A SOAP fault arrives with status 500 and takes precedence over the status.
fn interpret_login_response(status: u16, body: &str) -> Result<Credential, AuthError> {
    let success = (200..300).contains(&status);
    if success || element_text(body, "faultstring").is_some() {
        return parse_login_response(body);
    }
    let message = format!("status {status}: {}", body.trim());
    if status >= 500 {
        Err(AuthError::Transport { message })
    } else {
        Err(AuthError::Rejected { message })
    }
}

fn parse_login_response(body: &str) -> Result<Credential, AuthError> {
    if let Some(fault) = element_text(body, "faultstring") {
        return Err(AuthError::Rejected {
            message: unescape_xml(fault),
        });
    }

    let session_id = element_text(body, "sessionId").ok_or_else(|| AuthError::MalformedResponse {
        message: "missing sessionId".to_string(),
    })?;
    let server_url = element_text(body, "serverUrl").ok_or_else(|| AuthError::MalformedResponse {
        message: "missing serverUrl".to_string(),
    })?;
    let server_url = unescape_xml(server_url);

    let instance_url = origin(&server_url).ok_or_else(|| AuthError::MalformedResponse {
        message: format!("invalid serverUrl '{server_url}'"),
    })?;

    let mut credential = Credential::new(unescape_xml(session_id), instance_url);
    if let Some(secs) = element_text(body, "sessionSecondsValid").and_then(|s| s.trim().parse::<i64>().ok()) {
        credential = credential.with_expires_at(Utc::now() + chrono::Duration::seconds(secs));
    }
    Ok(credential)
}

/// `scheme://host[:port]` of an absolute URL.
fn origin(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")?;
    let host_start = scheme_end + 3;
    let host_end = url[host_start..].find('/').map_or(url.len(), |i| host_start + i);
    if host_end == host_start {
        return None;
    }
    Some(&url[..host_end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns="urn:partner.soap.sforce.com">
<soapenv:Body><loginResponse><result>
<metadataServerUrl>https://acme.my.salesforce.com/services/Soap/m/59.0/00D000000000001</metadataServerUrl>
<passwordExpired>false</passwordExpired>
<serverUrl>https://acme.my.salesforce.com/services/Soap/u/59.0/00D000000000001</serverUrl>
<sessionId>00D000000000001!AQ&amp;token</sessionId>
<userInfo><sessionSecondsValid>7200</sessionSecondsValid></userInfo>
</result></loginResponse></soapenv:Body></soapenv:Envelope>"#;

    const FAULT_RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Body><soapenv:Fault><faultcode>INVALID_LOGIN</faultcode>
<faultstring>INVALID_LOGIN: Invalid username, password, security token; or user locked out.</faultstring>
</soapenv:Fault></soapenv:Body></soapenv:Envelope>"#;

    #[test]
    fn parses_session_and_instance() {
        let credential = parse_login_response(OK_RESPONSE).unwrap();
        assert_eq!(credential.access_token(), "00D000000000001!AQ&token");
        assert_eq!(credential.instance_url(), "https://acme.my.salesforce.com");
        assert!(credential.expires_at().is_some());
    }

    #[test]
    fn fault_is_rejection_with_message() {
        let err = parse_login_response(FAULT_RESPONSE).unwrap_err();
        let AuthError::Rejected { message } = &err else {
            panic!("expected rejection, got {err:?}");
        };
        assert!(message.starts_with("INVALID_LOGIN: Invalid username"));
    }

    #[test]
    fn missing_session_is_malformed() {
        let err = parse_login_response("<result><serverUrl>https://x/y</serverUrl></result>").unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse { .. }));
    }

    #[test]
    fn fault_wins_over_error_status() {
        let err = interpret_login_response(500, FAULT_RESPONSE).unwrap_err();
        assert!(matches!(err, AuthError::Rejected { ref message } if message.starts_with("INVALID_LOGIN")));
        assert!(interpret_login_response(200, OK_RESPONSE).is_ok());
    }

    #[test]
    fn error_status_without_fault_keeps_status_and_body() {
        let err = interpret_login_response(503, "<html><body>Service Unavailable</body></html>\n").unwrap_err();
        let AuthError::Transport { message } = &err else {
            panic!("expected transport error, got {err:?}");
        };
        assert_eq!(message, "status 503: <html><body>Service Unavailable</body></html>");

        let err = interpret_login_response(404, "Not Found").unwrap_err();
        let AuthError::Rejected { message } = &err else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(message, "status 404: Not Found");
    }

    #[test]
    fn envelope_escapes_credentials() {
        let envelope = login_envelope("a&b@example.com", "p<w>\"'");
        assert!(envelope.contains("<n1:username>a&amp;b@example.com</n1:username>"));
        assert!(envelope.contains("<n1:password>p&lt;w&gt;&quot;&apos;</n1:password>"));
    }

    #[test]
    fn origin_strips_path() {
        assert_eq!(origin("https://na1.salesforce.com/services/Soap/u/59.0"), Some("https://na1.salesforce.com"));
        assert_eq!(origin("http://localhost:8080"), Some("http://localhost:8080"));
        assert_eq!(origin("not a url"), None);
    }
}
