//! Gmail API HTTP client
//!
//! Implements `MailProvider` and `OutboundSender` over the Gmail REST API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic; callers on an async
//! runtime wrap calls in `spawn_blocking`.

use std::time::Duration;

use base64::prelude::*;
use serde::de::DeserializeOwned;
use ureq::http::Response;

use super::api::{
    GmailMessage, HistoryResponse, ListLabelsResponse, ListMessagesResponse, ProfileResponse,
    TokenGrant,
};
use super::{MailProvider, MessageFormat, OutboundSender, ProviderError};
use crate::config::OAuthClientCredentials;

/// Gmail API client
pub struct GmailClient {
    agent: ureq::Agent,
    credentials: OAuthClientCredentials,
    base_url: String,
    token_url: String,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// OAuth token endpoint
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    /// Per-request timeout
    const TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new Gmail client
    pub fn new(credentials: OAuthClientCredentials) -> Self {
        Self::with_endpoints(credentials, Self::BASE_URL, Self::TOKEN_URL)
    }

    /// Create a client against non-default endpoints
    pub fn with_endpoints(
        credentials: OAuthClientCredentials,
        base_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        // Status codes are classified by hand so 404/429 carry meaning
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Self::TIMEOUT))
            .build()
            .into();

        Self {
            agent,
            credentials,
            base_url: base_url.into(),
            token_url: token_url.into(),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str, token: &str) -> Result<T, ProviderError> {
        let response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", token))
            .call()
            .map_err(transport_error)?;

        read_json(response)
    }

    fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        let response = self
            .agent
            .post(url)
            .header("Authorization", &format!("Bearer {}", token))
            .send_json(body)
            .map_err(transport_error)?;

        check_status(response).map(|_| ())
    }
}

impl MailProvider for GmailClient {
    fn get_profile(&self, token: &str) -> Result<ProfileResponse, ProviderError> {
        let url = format!("{}/users/me/profile", self.base_url);
        self.get_json(&url, token)
    }

    fn list_messages(
        &self,
        token: &str,
        max_results: usize,
        page_token: Option<&str>,
    ) -> Result<ListMessagesResponse, ProviderError> {
        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            self.base_url,
            max_results.clamp(1, 500)
        );
        if let Some(page) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }

        self.get_json(&url, token)
    }

    fn get_message(
        &self,
        token: &str,
        remote_id: &str,
        format: MessageFormat,
    ) -> Result<GmailMessage, ProviderError> {
        let mut url = format!(
            "{}/users/me/messages/{}?format={}",
            self.base_url,
            urlencoding::encode(remote_id),
            format.as_str()
        );
        if format == MessageFormat::Metadata {
            for header in [
                "From",
                "To",
                "Cc",
                "Subject",
                "List-Unsubscribe",
                "List-Id",
                "Precedence",
            ] {
                url.push_str(&format!("&metadataHeaders={}", header));
            }
        }

        self.get_json(&url, token)
    }

    fn list_history(
        &self,
        token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> Result<HistoryResponse, ProviderError> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}",
            self.base_url,
            urlencoding::encode(start_history_id)
        );
        for kind in ["messageAdded", "messageDeleted", "labelAdded", "labelRemoved"] {
            url.push_str(&format!("&historyTypes={}", kind));
        }
        if let Some(page) = page_token {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(page)));
        }

        // Gmail answers 404 when the start id is older than retained history
        match self.get_json(&url, token) {
            Err(ProviderError::NotFound) => Err(ProviderError::CursorInvalid),
            other => other,
        }
    }

    fn list_labels(&self, token: &str) -> Result<ListLabelsResponse, ProviderError> {
        let url = format!("{}/users/me/labels", self.base_url);
        self.get_json(&url, token)
    }

    fn modify_labels(
        &self,
        token: &str,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<(), ProviderError> {
        let url = format!(
            "{}/users/me/messages/{}/modify",
            self.base_url,
            urlencoding::encode(remote_id)
        );
        let body = serde_json::json!({
            "addLabelIds": add,
            "removeLabelIds": remove,
        });
        self.post_json(&url, token, &body)
    }

    fn trash_message(&self, token: &str, remote_id: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/users/me/messages/{}/trash",
            self.base_url,
            urlencoding::encode(remote_id)
        );
        let response = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", token))
            .send_empty()
            .map_err(transport_error)?;

        check_status(response).map(|_| ())
    }

    fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, ProviderError> {
        let response = self
            .agent
            .post(&self.token_url)
            .send_form([
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .map_err(transport_error)?;

        match read_json::<TokenGrant>(response) {
            Ok(mut grant) => {
                // Preserve the refresh token if not returned
                if grant.refresh_token.is_none() {
                    grant.refresh_token = Some(refresh_token.to_string());
                }
                Ok(grant)
            }
            Err(ProviderError::Permanent(msg)) if msg.contains("invalid_grant") => {
                Err(ProviderError::RefreshDenied(msg))
            }
            Err(ProviderError::Unauthorized) => Err(ProviderError::RefreshDenied(
                "token endpoint rejected client".to_string(),
            )),
            Err(e) => Err(e),
        }
    }
}

impl OutboundSender for GmailClient {
    fn send_raw(&self, token: &str, raw_message: &[u8]) -> Result<(), ProviderError> {
        let url = format!("{}/users/me/messages/send", self.base_url);
        let body = serde_json::json!({ "raw": BASE64_URL_SAFE_NO_PAD.encode(raw_message) });
        self.post_json(&url, token, &body)
    }
}

fn transport_error(e: ureq::Error) -> ProviderError {
    ProviderError::Transient(e.to_string())
}

/// Turn non-2xx responses into typed errors
fn check_status(mut response: Response<ureq::Body>) -> Result<Response<ureq::Body>, ProviderError> {
    let status = response.status().as_u16();
    if (200..300).contains(&status) {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = response.body_mut().read_to_string().unwrap_or_default();

    log::debug!("[PROVIDER] HTTP {} response", status);
    Err(ProviderError::from_status(status, retry_after, &body))
}

fn read_json<T: DeserializeOwned>(response: Response<ureq::Body>) -> Result<T, ProviderError> {
    let mut response = check_status(response)?;
    response
        .body_mut()
        .read_json()
        .map_err(|e| ProviderError::Permanent(format!("Failed to parse response: {}", e)))
}

/// Retry-After in delta-seconds form; HTTP dates are ignored
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
