//! Remote playback control.
//!
//! [`Remote`] is the boundary to the playback service: everything the
//! arbiter, the retry tasks and the transport controller need from an
//! account goes through it. [`WebApi`] implements it against the Spotify Web
//! API; tests use an in-memory implementation.
//!
//! All calls may fail with an [`Error`] whose kind reflects the HTTP status
//! class of the response (see [`Error::from_status`]).

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Method, StatusCode, Url,
};

use crate::{
    error::{Error, ErrorKind, Result},
    http::Client as HttpClient,
    protocol::{
        self,
        catalog::{Album, Playlist, Track},
        player::{Device, Devices, Playback, Start},
    },
    token::TokenProvider,
};

/// Playback operations on one account.
///
/// `device` selects the output device by id; `None` lets the service pick
/// the currently active device.
#[async_trait]
pub trait Remote: Send + Sync {
    /// Lists the devices available to the account.
    async fn devices(&self) -> Result<Vec<Device>>;

    /// Returns the current playback state, or `None` if nothing is active.
    async fn playback(&self) -> Result<Option<Playback>>;

    /// Starts playback of `start` on `device`.
    async fn start(&self, device: Option<&str>, start: &Start) -> Result<()>;

    async fn pause(&self, device: Option<&str>) -> Result<()>;

    async fn next(&self, device: Option<&str>) -> Result<()>;

    async fn previous(&self, device: Option<&str>) -> Result<()>;

    async fn seek(&self, device: Option<&str>, position: Duration) -> Result<()>;

    async fn set_volume(&self, device: Option<&str>, percent: u8) -> Result<()>;

    async fn track(&self, id: &str) -> Result<Track>;

    async fn album(&self, id: &str) -> Result<Album>;

    async fn playlist(&self, id: &str) -> Result<Playlist>;
}

/// An account in the configured order of preference.
#[derive(Clone)]
pub struct Account {
    name: Arc<str>,
    remote: Arc<dyn Remote>,
}

impl Account {
    #[must_use]
    pub fn new(name: &str, remote: Arc<dyn Remote>) -> Self {
        Self {
            name: name.into(),
            remote,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn remote(&self) -> &dyn Remote {
        self.remote.as_ref()
    }

    /// Whether both handles refer to the same account.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.remote, &other.remote)
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account").field("name", &self.name).finish()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// [`Remote`] over the Spotify Web API.
pub struct WebApi {
    base: Url,
    http: Arc<HttpClient>,
    tokens: TokenProvider,
}

impl WebApi {
    #[must_use]
    pub fn new(base: Url, http: Arc<HttpClient>, tokens: TokenProvider) -> Self {
        Self { base, http, tokens }
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn player_url(&self, path: &str, device: Option<&str>, query: &[(&str, &str)]) -> Result<Url> {
        let mut pairs = query.to_vec();
        if let Some(device) = device {
            pairs.push(("device_id", device));
        }
        self.url(path, &pairs)
    }

    /// Sends a request and returns the response body, or `None` for empty
    /// responses. An access token that is rejected is refreshed and the
    /// request is sent once more.
    async fn send(&self, method: Method, url: Url, body: Option<String>) -> Result<Option<String>> {
        let mut refreshed = false;

        loop {
            let token = self.tokens.access_token().await?;

            let mut request = match body {
                Some(ref body) => self.http.request(method.clone(), url.clone(), body.clone()),
                None => reqwest::Request::new(method.clone(), url.clone()),
            };
            let headers = request.headers_mut();
            let mut bearer = HeaderValue::from_str(&format!("Bearer {token}"))?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
            if body.is_some() {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }

            let response = self.http.execute(request).await?;
            let status = response.status();
            let text = response.text().await?;

            if status == StatusCode::UNAUTHORIZED && !refreshed {
                debug!("{}: access token rejected, refreshing", self.tokens.name());
                self.tokens.expire().await;
                refreshed = true;
                continue;
            }

            if !status.is_success() {
                return Err(Error::from_status(
                    status,
                    format!("{method} {}: {text}", url.path()),
                ));
            }

            if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
                return Ok(None);
            }

            return Ok(Some(text));
        }
    }

    async fn command(&self, method: Method, url: Url) -> Result<()> {
        self.send(method, url, None).await.map(|_| ())
    }

    async fn get<T>(&self, url: Url, origin: &str) -> Result<T>
    where
        T: for<'de> serde::Deserialize<'de> + fmt::Debug,
    {
        let text = self
            .send(Method::GET, url, None)
            .await?
            .ok_or_else(|| Error::data_loss(format!("{origin}: empty response")))?;
        protocol::json(&text, origin)
    }
}

#[async_trait]
impl Remote for WebApi {
    async fn devices(&self) -> Result<Vec<Device>> {
        let devices: Devices = self.get(self.url("me/player/devices", &[])?, "devices").await?;
        Ok(devices.devices)
    }

    async fn playback(&self) -> Result<Option<Playback>> {
        match self.send(Method::GET, self.url("me/player", &[])?, None).await? {
            Some(text) => protocol::json(&text, "playback").map(Some),
            None => Ok(None),
        }
    }

    async fn start(&self, device: Option<&str>, start: &Start) -> Result<()> {
        let url = self.player_url("me/player/play", device, &[])?;
        let body = serde_json::to_string(start)?;
        self.send(Method::PUT, url, Some(body)).await.map(|_| ())
    }

    async fn pause(&self, device: Option<&str>) -> Result<()> {
        let url = self.player_url("me/player/pause", device, &[])?;
        self.command(Method::PUT, url).await
    }

    async fn next(&self, device: Option<&str>) -> Result<()> {
        let url = self.player_url("me/player/next", device, &[])?;
        self.command(Method::POST, url).await
    }

    async fn previous(&self, device: Option<&str>) -> Result<()> {
        let url = self.player_url("me/player/previous", device, &[])?;
        self.command(Method::POST, url).await
    }

    async fn seek(&self, device: Option<&str>, position: Duration) -> Result<()> {
        let position = position.as_millis().to_string();
        let url = self.player_url("me/player/seek", device, &[("position_ms", &position)])?;
        self.command(Method::PUT, url).await
    }

    async fn set_volume(&self, device: Option<&str>, percent: u8) -> Result<()> {
        if percent > 100 {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("volume {percent}% out of range"),
            ));
        }

        let percent = percent.to_string();
        let url = self.player_url("me/player/volume", device, &[("volume_percent", &percent)])?;
        self.command(Method::PUT, url).await
    }

    async fn track(&self, id: &str) -> Result<Track> {
        self.get(self.url(&format!("tracks/{id}"), &[])?, "track").await
    }

    async fn album(&self, id: &str) -> Result<Album> {
        self.get(self.url(&format!("albums/{id}"), &[])?, "album").await
    }

    async fn playlist(&self, id: &str) -> Result<Playlist> {
        let url = self.url(
            &format!("playlists/{id}"),
            &[("fields", "name,owner(display_name),tracks(total)")],
        )?;
        self.get(url, "playlist").await
    }
}

/// In-memory [`Remote`] with scripted answers for tests.
#[cfg(test)]
pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex, MutexGuard},
    };

    use super::*;
    use crate::protocol::player::{Artist, AlbumRef};
    use crate::protocol::catalog::{Owner, PlaylistTracks};

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Call {
        Devices,
        Playback,
        Start(Option<String>, Start),
        Pause,
        Next,
        Previous,
        Seek(Duration),
        Volume(u8),
        Track(String),
        Album(String),
        Playlist(String),
    }

    #[derive(Default)]
    pub struct State {
        pub devices: Vec<Device>,
        pub devices_error: Option<ErrorKind>,
        pub playback: Option<Playback>,
        pub playback_error: Option<ErrorKind>,
        /// Outcomes of successive `start` calls; `None` succeeds.
        pub start_results: VecDeque<Option<ErrorKind>>,
        /// Outcome of `start` once `start_results` is exhausted.
        pub start_default: Option<ErrorKind>,
        pub command_error: Option<ErrorKind>,
        pub track: Option<Track>,
        pub album: Option<Album>,
        pub playlist: Option<Playlist>,
        pub calls: Vec<Call>,
    }

    #[derive(Default)]
    pub struct MockRemote {
        state: Mutex<State>,
    }

    pub fn fail(kind: ErrorKind) -> Error {
        Error::new(kind, "scripted failure")
    }

    pub fn device(id: &str, name: &str) -> Device {
        Device {
            id: Some(id.to_owned()),
            name: name.to_owned(),
            is_active: false,
            volume_percent: None,
        }
    }

    pub fn playing_on(device_id: &str, volume: Option<u8>) -> Playback {
        Playback {
            is_playing: true,
            device: Some(Device {
                volume_percent: volume,
                ..device(device_id, device_id)
            }),
            item: None,
        }
    }

    pub fn sample_track() -> Track {
        Track {
            name: String::from("Song"),
            artists: vec![Artist {
                name: String::from("Band"),
            }],
            album: AlbumRef {
                name: String::from("Record"),
            },
        }
    }

    pub fn sample_playlist() -> Playlist {
        Playlist {
            name: String::from("Road trip"),
            owner: Owner {
                display_name: Some(String::from("ben")),
            },
            tracks: PlaylistTracks { total: 42 },
        }
    }

    impl MockRemote {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap()
        }

        pub fn calls(&self) -> Vec<Call> {
            self.state().calls.clone()
        }

        pub fn starts(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| matches!(call, Call::Start(..)))
                .count()
        }

        fn record(&self, call: Call) -> MutexGuard<'_, State> {
            let mut state = self.state();
            state.calls.push(call);
            state
        }

        fn command(&self, call: Call) -> Result<()> {
            match self.record(call).command_error {
                Some(kind) => Err(fail(kind)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Remote for MockRemote {
        async fn devices(&self) -> Result<Vec<Device>> {
            let state = self.record(Call::Devices);
            match state.devices_error {
                Some(kind) => Err(fail(kind)),
                None => Ok(state.devices.clone()),
            }
        }

        async fn playback(&self) -> Result<Option<Playback>> {
            let state = self.record(Call::Playback);
            match state.playback_error {
                Some(kind) => Err(fail(kind)),
                None => Ok(state.playback.clone()),
            }
        }

        async fn start(&self, device: Option<&str>, start: &Start) -> Result<()> {
            let mut state = self.record(Call::Start(device.map(ToOwned::to_owned), start.clone()));
            let outcome = match state.start_results.pop_front() {
                Some(outcome) => outcome,
                None => state.start_default,
            };
            match outcome {
                Some(kind) => Err(fail(kind)),
                None => {
                    if let Start::Resume {} = start {
                        if let Some(ref mut playback) = state.playback {
                            playback.is_playing = true;
                        }
                    }
                    Ok(())
                }
            }
        }

        async fn pause(&self, _device: Option<&str>) -> Result<()> {
            self.command(Call::Pause)
        }

        async fn next(&self, _device: Option<&str>) -> Result<()> {
            self.command(Call::Next)
        }

        async fn previous(&self, _device: Option<&str>) -> Result<()> {
            self.command(Call::Previous)
        }

        async fn seek(&self, _device: Option<&str>, position: Duration) -> Result<()> {
            self.command(Call::Seek(position))
        }

        async fn set_volume(&self, _device: Option<&str>, percent: u8) -> Result<()> {
            self.command(Call::Volume(percent))
        }

        async fn track(&self, id: &str) -> Result<Track> {
            let state = self.record(Call::Track(id.to_owned()));
            state.track.clone().ok_or_else(|| fail(ErrorKind::NotFound))
        }

        async fn album(&self, id: &str) -> Result<Album> {
            let state = self.record(Call::Album(id.to_owned()));
            state.album.clone().ok_or_else(|| fail(ErrorKind::NotFound))
        }

        async fn playlist(&self, id: &str) -> Result<Playlist> {
            let state = self.record(Call::Playlist(id.to_owned()));
            state.playlist.clone().ok_or_else(|| fail(ErrorKind::NotFound))
        }
    }
}
