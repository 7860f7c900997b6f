//! HTTP login against the backend

use std::time::Duration;

use serde::Serialize;

use crate::common::{Error, Result};

use super::{AdminSecret, SessionToken};

/// Longest slice of a response body quoted in an error
const BODY_EXCERPT: usize = 200;

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Exchanges the admin secret for a session token
///
/// Makes exactly one request per call; retrying is the caller's decision.
pub struct CredentialBroker {
    client: reqwest::Client,
    timeout: Duration,
}

impl CredentialBroker {
    pub fn new(timeout: Duration) -> Result<Self> {
        // The backend is local; environment proxies don't apply
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    /// `POST {base_url}/login` and return the `token` from the response
    pub async fn login(
        &self,
        base_url: &str,
        username: &str,
        secret: &AdminSecret,
    ) -> Result<SessionToken> {
        let base = base_url.trim_end_matches('/');
        let url = format!("{base}/login");
        tracing::debug!(%url, username, "logging in");

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::ORIGIN, base)
            .json(&LoginRequest {
                username,
                password: secret.expose(),
            })
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(&url, e))?;

        if !status.is_success() {
            return Err(Error::AuthFailure(format!(
                "login returned {status}: {}",
                excerpt(&body)
            )));
        }

        let token = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("token")?.as_str().map(str::to_string))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::AuthFailure(format!(
                    "login response has no token field: {}",
                    excerpt(&body)
                ))
            })?;

        tracing::info!(username, "obtained session token");
        Ok(SessionToken::new(token))
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(self.timeout.as_secs())
        } else {
            Error::AuthFailure(format!("request to {url} failed: {e}"))
        }
    }
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
