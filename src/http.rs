//! HTTP client with rate limiting for the Spotify APIs.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting so that a stuck button or a retry storm cannot
//!   get the accounts throttled
//! * Consistent timeouts and headers
//! * Redirect resolution for shortened QR links
//!
//! # Rate Limiting
//!
//! Spotify enforces a rolling 30-second window. The client allows bursts up
//! to the maximum calls per window and delays requests beyond that.
//!
//! # Example
//!
//! ```rust
//! use qrbox::http::Client;
//!
//! let client = Client::new(&config)?;
//! let request = client.post(url, body);
//! let response = client.execute(request).await?;
//! ```

use std::{future::Future, num::NonZeroU32, time::Duration};

use futures_util::{FutureExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{Body, Method, Url};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client for special cases.
    ///
    /// Direct access to underlying client without rate limiting.
    pub unlimited: reqwest::Client,

    /// Rate limiter for API quota compliance.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window of the Web API rate limit.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(30);

    /// Maximum calls per window before requests are delayed.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 90;

    /// Duration to keep idle connections alive.
    ///
    /// Prevents frequent reconnection overhead for subsequent requests.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    /// Duration to wait for individual network reads.
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// Upper bound of any single request, so that no remote call can block
    /// the scan loop or the input task indefinitely.
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Upper bound of resolving a scanned link.
    const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a request with specified method, URL and body.
    pub fn request<T>(&self, method: Method, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        let mut request = reqwest::Request::new(method, url);
        *request.body_mut() = Some(body.into());

        request
    }

    /// Builds a POST request.
    pub fn post<T>(&self, url: Url, body: T) -> reqwest::Request
    where
        T: Into<Body>,
    {
        self.request(Method::POST, url, body)
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails on the network level. Unsuccessful
    /// status codes are not errors here; callers inspect the response.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }

    /// Follows the redirects of a scanned link and returns the final URL.
    ///
    /// QR codes often carry shortened links that only lead to the actual
    /// content after one or more redirects. Not rate limited: the target is
    /// usually not the Web API.
    ///
    /// # Errors
    ///
    /// Returns error if `link` is not a URL, or if the lookup fails or takes
    /// longer than five seconds.
    pub async fn resolve_redirects(&self, link: &str) -> Result<Url> {
        let url = Url::parse(link)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::invalid_argument(format!(
                "cannot resolve {} links",
                url.scheme()
            )));
        }

        let response = self
            .unlimited
            .head(url)
            .timeout(Self::RESOLVE_TIMEOUT)
            .send()
            .await?;

        Ok(response.url().clone())
    }
}
