//! The scan pipeline.
//!
//! A scan is resolved into a link, normalized into a playback URI, and
//! handed to the [`Arbiter`]. A granted account starts playback through the
//! [`RetryScheduler`]; when all accounts are busy the content is described
//! and optionally handed off through a JSON file. Between scans the
//! [`Jukebox`] keeps an eye on what is playing.

use std::{fmt, path::PathBuf, sync::Arc};

use tokio::sync::watch;
use url::Url;

use crate::{
    arbiter::{Arbiter, Arbitration, Metadata},
    device::DeviceTarget,
    http::Client as HttpClient,
    remote::Account,
    retry::{RetryScheduler, RetryStatus},
    status::{Reporter, Status},
    uri::{self, PlaybackRequest},
};

/// What became of a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Not something that can be played.
    Malformed,

    /// The link could not be followed.
    Unresolvable,

    NoDevice,

    Busy(Metadata),

    Playback(RetryStatus),
}

impl fmt::Display for ScanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "ignored"),
            Self::Unresolvable => write!(f, "unresolvable"),
            Self::NoDevice => write!(f, "no output device"),
            Self::Busy(metadata) => write!(f, "all accounts busy: {metadata}"),
            Self::Playback(status) => write!(f, "playback {status}"),
        }
    }
}

pub struct Jukebox {
    http: Arc<HttpClient>,
    arbiter: Arbiter,
    retries: RetryScheduler,
    active: watch::Sender<Option<Account>>,
    reporter: Reporter,
    handoff: Option<PathBuf>,
    now_playing: Option<String>,
    is_playing: Option<bool>,
}

impl Jukebox {
    #[must_use]
    pub fn new(
        http: Arc<HttpClient>,
        arbiter: Arbiter,
        retries: RetryScheduler,
        reporter: Reporter,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            http,
            arbiter,
            retries,
            active,
            reporter,
            handoff: None,
            now_playing: None,
            is_playing: None,
        }
    }

    /// Writes the metadata of content that could not be played to `path`.
    #[must_use]
    pub fn with_handoff(mut self, path: Option<PathBuf>) -> Self {
        self.handoff = path;
        self
    }

    /// Follows the account most recently granted playback.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Account>> {
        self.active.subscribe()
    }

    #[must_use]
    pub fn device(&self) -> &DeviceTarget {
        self.arbiter.device()
    }

    /// Handles one scanned payload.
    pub async fn handle_scan(&mut self, raw: &str) -> ScanOutcome {
        let raw = raw.trim();
        info!("scanned: {raw}");

        let link = match self.resolve(raw).await {
            Ok(link) => link,
            Err(e) => {
                warn!("cannot resolve {raw}: {e}");
                return ScanOutcome::Unresolvable;
            }
        };

        let request = match PlaybackRequest::from_link(&link) {
            Ok(request) => request,
            Err(e) => {
                debug!("ignoring scan: {e}");
                return ScanOutcome::Malformed;
            }
        };

        let outcome = match self.arbiter.choose(&request.uri).await {
            Arbitration::Granted(account) => {
                info!("{account} plays {}", request.uri);
                self.active.send_replace(Some(account.clone()));
                self.is_playing = None;
                ScanOutcome::Playback(self.retries.start_or_retry(&account, &request).await)
            }
            Arbitration::AllBusy(metadata) => {
                self.reporter.report(Status::RedSolid);
                self.hand_off(&metadata).await;
                ScanOutcome::Busy(metadata)
            }
            Arbitration::NoDeviceAvailable => {
                self.reporter.report(Status::RedBlink);
                ScanOutcome::NoDevice
            }
        };

        info!("{}: {outcome}", request.uri);
        outcome
    }

    /// Follows redirects of links that are neither a playback URI nor a
    /// web-form link. Anything that is not an http(s) URL is passed on as
    /// is.
    async fn resolve(&self, raw: &str) -> crate::error::Result<String> {
        if uri::is_direct(raw) {
            return Ok(raw.to_owned());
        }

        let is_web = Url::parse(raw).is_ok_and(|url| matches!(url.scheme(), "http" | "https"));
        if !is_web {
            return Ok(raw.to_owned());
        }

        let resolved = self.http.resolve_redirects(raw).await?;
        debug!("{raw} resolved to {resolved}");
        Ok(resolved.into())
    }

    async fn hand_off(&self, metadata: &Metadata) {
        let Some(ref path) = self.handoff else {
            return;
        };

        let json = match serde_json::to_vec_pretty(metadata) {
            Ok(json) => json,
            Err(e) => {
                error!("cannot serialize {metadata}: {e}");
                return;
            }
        };

        match tokio::fs::write(path, json).await {
            Ok(()) => debug!("handed off to {}", path.display()),
            Err(e) => warn!("cannot write {}: {e}", path.display()),
        }
    }

    /// Logs track changes of the controlled account and shows whether it is
    /// playing, unless a retry is showing its own status.
    pub async fn poll_now_playing(&mut self) {
        let account = self
            .active
            .borrow()
            .clone()
            .or_else(|| self.arbiter.accounts().first().cloned());
        let Some(account) = account else {
            return;
        };

        let playback = match account.remote().playback().await {
            Ok(playback) => playback,
            Err(e) => {
                debug!("{account}: cannot poll playback: {e}");
                return;
            }
        };

        let item = playback.as_ref().and_then(|playback| playback.item.as_ref());
        let uri = item.map(|item| item.uri.clone());
        if uri != self.now_playing {
            if let Some(item) = item {
                info!("now playing on {account}: {item}");
            }
            self.now_playing = uri;
        }

        let is_playing = playback.as_ref().map(|playback| playback.is_playing);
        if is_playing != self.is_playing && !self.retries.is_retrying() {
            self.is_playing = is_playing;
            self.reporter.report(match is_playing {
                Some(true) => Status::GreenSolid,
                Some(false) => Status::RedSolid,
                None => Status::Off,
            });
        }
    }

    /// Forgets the output device and looks it up again.
    pub async fn reload_device(&self) {
        let device = self.arbiter.device();
        device.forget().await;
        if device.resolve(self.arbiter.accounts()).await.is_none() {
            warn!("output device not available after reload");
        }
    }

    /// Cancels pending retries and waits for them.
    pub async fn shutdown(self) {
        self.retries.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::{Config, DeviceSelection},
        error::ErrorKind,
        protocol::player::{Item, Start},
        remote::mock::{playing_on, sample_playlist, Call, MockRemote},
        status::testing::reported,
        token::Credentials,
    };

    fn jukebox(
        remotes: &[Arc<MockRemote>],
        device: DeviceSelection,
    ) -> (Jukebox, mpsc::UnboundedReceiver<Status>) {
        let accounts: Vec<_> = remotes
            .iter()
            .enumerate()
            .map(|(i, remote)| Account::new(&format!("account{i}"), remote.clone()))
            .collect();

        let config = Config::with_accounts(vec![Credentials {
            name: String::from("test"),
            client_id: String::from("id"),
            client_secret: String::from("secret"),
            refresh_token: String::from("refresh"),
        }])
        .unwrap();
        let http = Arc::new(HttpClient::new(&config).unwrap());

        let target = DeviceTarget::new(&device);
        let (reporter, statuses) = Reporter::channel();
        let retries = RetryScheduler::new(
            target.clone(),
            accounts.clone(),
            reporter.clone(),
            Duration::from_secs(5),
        );
        let arbiter = Arbiter::new(accounts, target);

        (Jukebox::new(http, arbiter, retries, reporter), statuses)
    }

    fn pi() -> DeviceSelection {
        DeviceSelection {
            id: Some(String::from("pi")),
            names: Vec::new(),
        }
    }

    #[tokio::test]
    async fn track_scan_plays_on_free_account() {
        let remote = MockRemote::new();
        let (mut jukebox, mut statuses) = jukebox(&[remote.clone()], pi());
        let active = jukebox.subscribe();

        let outcome = jukebox
            .handle_scan("https://open.spotify.com/track/6rqhFgbbKwnb9MLmUQDhG6?si=ab12\n")
            .await;

        assert_eq!(outcome, ScanOutcome::Playback(RetryStatus::Succeeded));
        assert_eq!(
            remote.calls(),
            [
                Call::Playback,
                Call::Start(
                    Some(String::from("pi")),
                    Start::Uris {
                        uris: vec![String::from("spotify:track:6rqhFgbbKwnb9MLmUQDhG6")]
                    }
                )
            ]
        );
        assert_eq!(reported(&mut statuses), [Status::GreenSolid]);
        assert_eq!(
            active.borrow().as_ref().map(Account::name),
            Some("account0")
        );
    }

    #[tokio::test]
    async fn playlist_scan_passes_over_busy_account() {
        let busy = MockRemote::new();
        busy.state().playback = Some(playing_on("phone", None));
        let free = MockRemote::new();
        let (mut jukebox, _statuses) = jukebox(&[busy.clone(), free.clone()], pi());

        let outcome = jukebox
            .handle_scan("https://open.spotify.com/playlist/37i9dQZF1DX0XUsuxWHRQd")
            .await;

        assert_eq!(outcome, ScanOutcome::Playback(RetryStatus::Succeeded));
        assert_eq!(busy.starts(), 0);
        assert_eq!(
            free.calls().last(),
            Some(&Call::Start(
                Some(String::from("pi")),
                Start::Context {
                    context_uri: String::from("spotify:playlist:37i9dQZF1DX0XUsuxWHRQd")
                }
            ))
        );
    }

    #[tokio::test]
    async fn all_busy_hands_off() {
        let remote = MockRemote::new();
        remote.state().playback = Some(playing_on("phone", None));
        remote.state().playlist = Some(sample_playlist());
        let path = std::env::temp_dir().join(format!("qrbox-handoff-{}.json", std::process::id()));
        let (jukebox, mut statuses) = jukebox(&[remote.clone()], pi());
        let mut jukebox = jukebox.with_handoff(Some(path.clone()));

        let outcome = jukebox.handle_scan("spotify:playlist:p1").await;

        let ScanOutcome::Busy(metadata) = outcome else {
            panic!("expected all accounts to be busy, got {outcome:?}");
        };
        assert_eq!(reported(&mut statuses), [Status::RedSolid]);

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["name"], "Road trip");
        assert_eq!(written["track_count"], 42);
        assert_eq!(serde_json::to_value(&metadata).unwrap(), written);
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn malformed_scans_are_ignored() {
        let remote = MockRemote::new();
        let (mut jukebox, mut statuses) = jukebox(&[remote.clone()], pi());

        assert_eq!(jukebox.handle_scan("hello world").await, ScanOutcome::Malformed);
        assert_eq!(jukebox.handle_scan("spotify:user:me").await, ScanOutcome::Malformed);
        assert!(remote.calls().is_empty());
        assert!(reported(&mut statuses).is_empty());
    }

    #[tokio::test]
    async fn shortened_links_are_resolved() {
        let mut server = mockito::Server::new_async().await;
        let head = server
            .mock("HEAD", "/AbCdEf")
            .with_status(200)
            .create_async()
            .await;
        let remote = MockRemote::new();
        let (mut jukebox, _statuses) = jukebox(&[remote.clone()], pi());

        let outcome = jukebox.handle_scan(&format!("{}/AbCdEf", server.url())).await;

        head.assert_async().await;
        assert_eq!(outcome, ScanOutcome::Malformed);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_device_skips_scan() {
        let remote = MockRemote::new();
        let (mut jukebox, mut statuses) = jukebox(
            &[remote.clone()],
            DeviceSelection {
                id: None,
                names: vec![String::from("Kitchen")],
            },
        );

        assert_eq!(
            jukebox.handle_scan("spotify:track:abc").await,
            ScanOutcome::NoDevice
        );
        assert_eq!(remote.starts(), 0);
        assert_eq!(reported(&mut statuses), [Status::RedBlink]);
    }

    #[tokio::test(start_paused = true)]
    async fn now_playing_does_not_hide_retries() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::Unavailable);
        let (mut jukebox, mut statuses) = jukebox(&[remote.clone()], pi());

        assert_eq!(
            jukebox.handle_scan("spotify:album:zzz").await,
            ScanOutcome::Playback(RetryStatus::Retrying)
        );
        assert_eq!(reported(&mut statuses), [Status::RedBlink]);

        remote.state().playback = Some(playing_on("pi", None));
        jukebox.poll_now_playing().await;
        assert!(reported(&mut statuses).is_empty());

        remote.state().start_default = None;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(reported(&mut statuses), [Status::GreenSolid]);

        let mut playback = playing_on("pi", None);
        playback.item = Some(Item {
            uri: String::from("spotify:track:t1"),
            name: String::from("Song"),
            artists: Vec::new(),
            album: None,
            track_number: None,
        });
        remote.state().playback = Some(playback);
        jukebox.poll_now_playing().await;
        assert_eq!(reported(&mut statuses), [Status::GreenSolid]);
        assert_eq!(jukebox.now_playing.as_deref(), Some("spotify:track:t1"));

        jukebox.poll_now_playing().await;
        assert!(reported(&mut statuses).is_empty());
    }
}
