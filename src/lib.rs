//! A QR-code jukebox for Spotify Connect devices.
//!
//! Scanned codes are turned into playback URIs and played on a fixed output
//! device, through the first configured account that is not already playing
//! somewhere else. Buttons and keys control the transport, and two LEDs show
//! what is going on.
//!
//! # Modules
//!
//! * [`jukebox`] - The scan pipeline
//! * [`arbiter`] - Which account may play
//! * [`retry`] - Starting playback and retrying it
//! * [`transport`] - Volume, skipping, play/pause and restart
//! * [`input`], [`gpio`] - Buttons and keys
//! * [`status`] - LEDs
//! * [`remote`], [`token`], [`protocol`], [`http`] - The Spotify Web API
//! * [`uri`] - Link normalization
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

#[macro_use]
extern crate log;

pub mod arbiter;
pub mod config;
pub mod device;
pub mod error;
pub mod gpio;
pub mod http;
pub mod input;
pub mod jukebox;
pub mod protocol;
pub mod remote;
pub mod retry;
pub mod scan;
pub mod signal;
pub mod status;
pub mod token;
pub mod transport;
pub mod uri;
