use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::subscription::{format_expiration, NewSubscription, Subscription, SubscriptionApi};

pub mod models;

pub use models::{GraphBody, GraphMessage, GraphRecipient, MESSAGE_SELECT_FIELDS};

use models::GraphMessagesPage;

const MAX_RATE_LIMIT_RETRIES: usize = 5;
const MAX_BACKOFF_SECONDS: u64 = 32;
const REDACTED_BODY_MAX_LEN: usize = 200;

/// Thin Microsoft Graph REST client for mail and subscriptions.
pub struct GraphClient {
    client: Client,
    tokens: Arc<TokenProvider>,
    api_base: String,
}

impl GraphClient {
    pub fn new(client: Client, tokens: Arc<TokenProvider>, api_base: impl Into<String>) -> Self {
        Self {
            client,
            tokens,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    /// HTTP client with a per-request timeout.
    pub fn http_client(timeout: StdDuration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build graph HTTP client")
    }

    pub fn inbox_messages_url(&self, user_email: &str, limit: usize) -> Result<String> {
        let endpoint = format!("{}/users/{user_email}/mailFolders/inbox/messages", self.api_base);
        let mut url =
            Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))?;
        url.query_pairs_mut()
            .append_pair("$top", &limit.clamp(1, 1000).to_string())
            .append_pair("$orderby", "receivedDateTime desc")
            .append_pair("$select", MESSAGE_SELECT_FIELDS);
        Ok(url.to_string())
    }

    fn message_url(&self, user_email: &str, message_id: &str) -> Result<String> {
        let endpoint = format!("{}/users/{user_email}/messages/{message_id}", self.api_base);
        let mut url =
            Url::parse(&endpoint).with_context(|| format!("parse graph URL {endpoint}"))?;
        url.query_pairs_mut()
            .append_pair("$select", MESSAGE_SELECT_FIELDS);
        Ok(url.to_string())
    }

    fn subscriptions_url(&self) -> String {
        format!("{}/subscriptions", self.api_base)
    }

    fn subscription_url(&self, subscription_id: &str) -> String {
        format!("{}/subscriptions/{subscription_id}", self.api_base)
    }

    /// Most recent inbox messages, newest first.
    pub async fn list_inbox(&self, user_email: &str, limit: usize) -> Result<Vec<GraphMessage>> {
        let mut next_url = Some(self.inbox_messages_url(user_email, limit)?);
        let mut messages = Vec::new();

        while let Some(url) = next_url.take() {
            let (status, body) = self
                .send("graph inbox messages", |token| {
                    self.client.get(&url).bearer_auth(token)
                })
                .await?;
            ensure_status("graph inbox messages", status, &body, &[StatusCode::OK])?;

            let page: GraphMessagesPage =
                serde_json::from_str(&body).context("decode graph messages page JSON")?;
            messages.extend(page.value);
            if messages.len() < limit {
                next_url = page.next_link;
            }
        }

        messages.truncate(limit);
        Ok(messages)
    }

    pub async fn get_message(&self, user_email: &str, message_id: &str) -> Result<GraphMessage> {
        let url = self.message_url(user_email, message_id)?;
        let (status, body) = self
            .send("graph message", |token| self.client.get(&url).bearer_auth(token))
            .await?;
        ensure_status("graph message", status, &body, &[StatusCode::OK])?;
        serde_json::from_str(&body)
            .with_context(|| format!("decode graph message {message_id} JSON"))
    }

    /// Sends a request built per attempt, retrying 429s (honoring
    /// `Retry-After`) and one 401 with a refreshed token.
    async fn send<F>(&self, label: &str, build: F) -> Result<(StatusCode, String)>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut backoff_seconds = 1u64;
        let mut refreshed = false;
        let mut attempt = 0usize;

        loop {
            let token = self.tokens.access_token(false).await?;
            let response = build(&token)
                .header("accept", "application/json")
                .send()
                .await
                .with_context(|| format!("request {label}"))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!(label, "graph rejected token; refreshing once");
                refreshed = true;
                self.tokens.access_token(true).await?;
                continue;
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt == MAX_RATE_LIMIT_RETRIES {
                    let body = response
                        .text()
                        .await
                        .context("read graph 429 response body")?;
                    return Err(anyhow!(
                        "{label} exhausted retries: {}",
                        redact_response_body(&body)
                    ));
                }

                let retry_after_seconds = retry_delay_seconds(
                    response
                        .headers()
                        .get("retry-after")
                        .and_then(|value| value.to_str().ok()),
                    backoff_seconds,
                );

                warn!(label, retry_after_seconds, "graph throttled request");
                sleep(StdDuration::from_secs(retry_after_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                attempt += 1;
                continue;
            }

            let body = response
                .text()
                .await
                .with_context(|| format!("read {label} response body"))?;
            return Ok((status, body));
        }
    }
}

#[async_trait]
impl SubscriptionApi for GraphClient {
    async fn create_subscription(&self, request: &NewSubscription) -> Result<Subscription> {
        let url = self.subscriptions_url();
        let (status, body) = self
            .send("graph subscription create", |token| {
                self.client.post(&url).bearer_auth(token).json(request)
            })
            .await?;
        ensure_status(
            "graph subscription create",
            status,
            &body,
            &[StatusCode::CREATED],
        )?;
        serde_json::from_str(&body).context("decode created subscription JSON")
    }

    async fn renew_subscription(
        &self,
        subscription_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<Subscription> {
        let url = self.subscription_url(subscription_id);
        let payload = json!({ "expirationDateTime": format_expiration(expiration) });
        let (status, body) = self
            .send("graph subscription renew", |token| {
                self.client.patch(&url).bearer_auth(token).json(&payload)
            })
            .await?;
        ensure_status("graph subscription renew", status, &body, &[StatusCode::OK])?;
        serde_json::from_str(&body).context("decode renewed subscription JSON")
    }

    async fn delete_subscription(&self, subscription_id: &str) -> Result<()> {
        let url = self.subscription_url(subscription_id);
        let (status, body) = self
            .send("graph subscription delete", |token| {
                self.client.delete(&url).bearer_auth(token)
            })
            .await?;
        // 404: already gone on the service side.
        ensure_status(
            "graph subscription delete",
            status,
            &body,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
    }
}

fn ensure_status(label: &str, status: StatusCode, body: &str, accepted: &[StatusCode]) -> Result<()> {
    if accepted.contains(&status) {
        return Ok(());
    }
    Err(anyhow!(
        "{label} failed: status={} body={}",
        status,
        redact_response_body(body)
    ))
}

/// Seconds to wait after a 429. A server-supplied `Retry-After` is honored
/// but never beyond [`MAX_BACKOFF_SECONDS`].
fn retry_delay_seconds(retry_after: Option<&str>, fallback_seconds: u64) -> u64 {
    retry_after
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(fallback_seconds)
        .min(MAX_BACKOFF_SECONDS)
}

pub(crate) fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        return trimmed.to_string();
    }

    let mut cut = REDACTED_BODY_MAX_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}…[truncated {} bytes]",
        &trimmed[..cut],
        trimmed.len()
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::{Client, StatusCode};

    use super::{
        ensure_status, redact_response_body, retry_delay_seconds, GraphClient,
        MAX_BACKOFF_SECONDS,
    };
    use crate::auth::{GraphCredentials, TokenCacheSettings, TokenProvider};

    fn client() -> GraphClient {
        let tokens = TokenProvider::new(
            Client::new(),
            GraphCredentials {
                tenant_id: "tenant-a".to_string(),
                client_id: "client-a".to_string(),
                client_secret: "secret-a".to_string(),
            },
            "http://127.0.0.1:9/token".to_string(),
            TokenCacheSettings::default(),
        );
        GraphClient::new(
            Client::new(),
            Arc::new(tokens),
            "https://graph.microsoft.com/v1.0/",
        )
    }

    #[test]
    fn inbox_url_is_user_scoped_and_ordered() {
        let url = client()
            .inbox_messages_url("owner@example.com", 10)
            .expect("build inbox url");
        assert!(url.starts_with(
            "https://graph.microsoft.com/v1.0/users/owner@example.com/mailFolders/inbox/messages?"
        ));
        assert!(url.contains("%24top=10"));
        assert!(url.contains("%24orderby=receivedDateTime+desc"));
        assert!(url.contains("%24select="));
    }

    #[test]
    fn subscription_urls_are_keyed_by_id() {
        let client = client();
        assert_eq!(
            client.subscriptions_url(),
            "https://graph.microsoft.com/v1.0/subscriptions"
        );
        assert_eq!(
            client.subscription_url("sub-1"),
            "https://graph.microsoft.com/v1.0/subscriptions/sub-1"
        );
    }

    #[test]
    fn unexpected_status_becomes_error_with_redacted_body() {
        assert!(ensure_status("op", StatusCode::CREATED, "", &[StatusCode::CREATED]).is_ok());

        let long_body = "x".repeat(500);
        let error = ensure_status("op", StatusCode::BAD_REQUEST, &long_body, &[StatusCode::OK])
            .expect_err("400 rejected");
        let message = error.to_string();
        assert!(message.contains("status=400"));
        assert!(message.contains("[truncated 500 bytes]"));
    }

    #[test]
    fn redaction_respects_char_boundaries() {
        let body = "é".repeat(150);
        let redacted = redact_response_body(&body);
        assert!(redacted.contains("truncated 300 bytes"));
        assert_eq!(redact_response_body("  short  "), "short");
    }

    #[test]
    fn retry_after_is_capped_at_max_backoff() {
        assert_eq!(retry_delay_seconds(Some("3600"), 1), MAX_BACKOFF_SECONDS);
        assert_eq!(retry_delay_seconds(Some(" 5 "), 1), 5);
        assert_eq!(retry_delay_seconds(Some("0"), 4), 0);
        assert_eq!(retry_delay_seconds(None, 4), 4);
        assert_eq!(
            retry_delay_seconds(Some("Wed, 21 Oct 2026 07:28:00 GMT"), 8),
            8
        );
        assert_eq!(retry_delay_seconds(None, 64), MAX_BACKOFF_SECONDS);
    }
}
