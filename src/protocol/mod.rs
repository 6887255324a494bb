//! Wire types of the Spotify accounts service and Web API.
//!
//! # Submodules
//!
//! * [`auth`] - Token endpoint responses
//! * [`player`] - Devices, playback state and playback start bodies
//! * [`catalog`] - Track, album and playlist lookups
//!
//! Only the fields this crate acts upon are modeled; everything else in the
//! responses is ignored.

pub mod auth;
pub mod catalog;
pub mod player;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses and logs JSON responses from the Spotify APIs.
///
/// * Success: logs the parsed structure at TRACE level
/// * Parse error on valid JSON: logs the raw JSON at TRACE level
/// * Invalid JSON: logs the error at ERROR level and the raw text at TRACE
///
/// # Errors
///
/// Returns error if `body` is not valid JSON or does not match `T`.
pub fn json<T>(body: &str, origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_str(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
                trace!("{origin}: {json:#?}");
            } else {
                error!("{origin}: failed parsing response ({e:?})");
                trace!("{body}");
            }
            Err(e.into())
        }
    }
}
