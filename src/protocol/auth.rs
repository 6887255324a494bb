//! Token endpoint response.
//!
//! # Example Response
//!
//! ```json
//! {
//!     "access_token": "BQB...",
//!     "token_type": "Bearer",
//!     "scope": "user-modify-playback-state user-read-playback-state",
//!     "expires_in": 3600
//! }
//! ```
//!
//! The accounts service may rotate the refresh token, in which case the
//! response also carries a new `refresh_token`.

use std::time::Duration;

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationSeconds};
use veil::Redact;

#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Redact, Hash)]
pub struct Token {
    /// Bearer token for Web API requests
    #[redact]
    pub access_token: String,

    /// How long the token remains valid
    #[serde_as(as = "Option<DurationSeconds<u64, Flexible>>")]
    pub expires_in: Option<Duration>,

    /// Replacement refresh token, if the service rotated it
    #[redact]
    pub refresh_token: Option<String>,
}

impl Token {
    /// Lifetime assumed when the response does not state one.
    pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);

    #[must_use]
    pub fn lifetime(&self) -> Duration {
        self.expires_in.unwrap_or(Self::DEFAULT_LIFETIME)
    }
}
