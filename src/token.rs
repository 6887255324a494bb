//! Account credentials and access token management.
//!
//! Every account is configured with a client id, a client secret and a
//! long-lived refresh token. [`TokenProvider`] exchanges the refresh token for
//! short-lived access tokens on demand and caches them until shortly before
//! they expire.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    StatusCode, Url,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use veil::Redact;

use crate::{
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::{self, auth},
};

/// Credentials of one account.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize, Redact)]
pub struct Credentials {
    /// Human-readable account name used in logs.
    pub name: String,

    pub client_id: String,

    #[redact]
    pub client_secret: String,

    #[redact]
    pub refresh_token: String,
}

/// A bearer token for the Web API.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
pub struct AccessToken {
    #[redact]
    token: String,
    expires_at: SystemTime,
}

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Whether the token expires within `margin` from now.
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.time_to_live() <= margin
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

struct State {
    refresh_token: String,
    access_token: Option<AccessToken>,
}

/// Hands out access tokens for one account, refreshing them when needed.
///
/// The provider is shared between the scan loop, the input task and retry
/// tasks. Concurrent callers wait on one refresh instead of each starting
/// their own.
pub struct TokenProvider {
    name: String,
    client_id: String,
    authorization: HeaderValue,
    token_url: Url,
    margin: Duration,
    http: Arc<HttpClient>,
    state: Mutex<State>,
}

impl TokenProvider {
    /// # Errors
    ///
    /// Returns error if the credentials cannot be encoded into a header.
    pub fn new(
        credentials: &Credentials,
        http: Arc<HttpClient>,
        token_url: Url,
        margin: Duration,
    ) -> Result<Self> {
        let basic = STANDARD.encode(format!(
            "{}:{}",
            credentials.client_id, credentials.client_secret
        ));
        let mut authorization = HeaderValue::from_str(&format!("Basic {basic}"))?;
        authorization.set_sensitive(true);

        Ok(Self {
            name: credentials.name.clone(),
            client_id: credentials.client_id.clone(),
            authorization,
            token_url,
            margin,
            http,
            state: Mutex::new(State {
                refresh_token: credentials.refresh_token.clone(),
                access_token: None,
            }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns a valid access token, refreshing it first when there is none
    /// or it expires within the safety margin.
    ///
    /// # Errors
    ///
    /// Returns error if the refresh fails. Rejected credentials are
    /// `Unauthenticated`.
    pub async fn access_token(&self) -> Result<AccessToken> {
        let mut state = self.state.lock().await;

        if let Some(ref token) = state.access_token {
            if !token.expires_within(self.margin) {
                return Ok(token.clone());
            }
        }

        let token = self.refresh(&mut state).await?;
        Ok(token)
    }

    /// Forces the next call to [`access_token`](Self::access_token) to
    /// refresh, e.g. after the Web API rejected the current token.
    pub async fn expire(&self) {
        self.state.lock().await.access_token = None;
    }

    async fn refresh(&self, state: &mut State) -> Result<AccessToken> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "refresh_token")
            .append_pair("refresh_token", &state.refresh_token)
            .finish();

        let mut request = self.http.post(self.token_url.clone(), body);
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let response = self.http.execute(request).await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let reason = format!("token refresh for {} failed ({status}): {text}", self.name);
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                    Error::unauthenticated(reason)
                }
                _ => Error::from_status(status, reason),
            });
        }

        let response: auth::Token = protocol::json(&text, "token")?;
        let expires_at = SystemTime::now() + response.lifetime();
        let token = AccessToken::new(response.access_token, expires_at);

        if let Some(refresh_token) = response.refresh_token {
            debug!("refresh token rotated for {}", self.name);
            state.refresh_token = refresh_token;
        }

        let client_id: String = self.client_id.chars().take(6).collect();
        info!(
            "access token refreshed for {} (client {client_id}...), valid for {}s",
            self.name,
            token.time_to_live().as_secs()
        );

        state.access_token = Some(token.clone());
        Ok(token)
    }
}
