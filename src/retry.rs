//! Starting playback, and retrying it in the background when that fails.
//!
//! [`RetryScheduler::start_or_retry`] makes one immediate attempt. When it
//! fails with a recoverable error a background task takes over and keeps
//! trying on a fixed backoff until playback starts, the error turns fatal, or
//! the task is cancelled. Tasks are keyed by URI: a newer request for the
//! same URI replaces the old task, while different URIs retry side by side.
//! A successful immediate start makes every pending retry stale and cancels
//! it.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    device::DeviceTarget,
    error::{Error, ErrorKind, Result},
    protocol::player::Start,
    remote::Account,
    status::{Reporter, Status},
    uri::{PlaybackRequest, PlaybackUri},
};

/// How a failed start is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    /// The output device is gone: forget it, find it again and retry.
    DeviceNotFound,

    /// Anything that may go away on its own: retry.
    Transient,

    /// The content cannot be played: give up.
    Fatal,
}

#[must_use]
pub fn classify(error: &Error) -> Classification {
    match error.kind {
        ErrorKind::InvalidArgument => Classification::Fatal,
        ErrorKind::NotFound => Classification::DeviceNotFound,
        _ => Classification::Transient,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RetryStatus {
    Retrying,
    Succeeded,
    AbortedFatal,
    Cancelled,
}

impl fmt::Display for RetryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::AbortedFatal => "aborted",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{status}")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryState {
    pub uri: PlaybackUri,
    /// Start attempts made so far, including the immediate one.
    pub attempts: u32,
    pub status: RetryStatus,
}

/// The request body that plays `uri`.
#[must_use]
pub fn start_for(uri: &PlaybackUri) -> Start {
    if uri.kind().is_item() {
        Start::Uris {
            uris: vec![uri.to_string()],
        }
    } else {
        Start::Context {
            context_uri: uri.to_string(),
        }
    }
}

struct Pending {
    cancel: CancellationToken,
    handle: JoinHandle<RetryState>,
}

/// What the retry tasks share with the scheduler.
struct Shared {
    device: DeviceTarget,
    accounts: Vec<Account>,
    reporter: Reporter,
    backoff: Duration,
}

impl Shared {
    async fn attempt(&self, account: &Account, start: &Start) -> Result<()> {
        let device = self
            .device
            .get_or_resolve(&self.accounts)
            .await
            .ok_or_else(|| Error::not_found("output device not found"))?;

        account.remote().start(Some(device.as_str()), start).await
    }
}

pub struct RetryScheduler {
    shared: Arc<Shared>,
    pending: Mutex<HashMap<PlaybackUri, Pending>>,
}

impl RetryScheduler {
    /// `accounts` are used to find the output device again.
    #[must_use]
    pub fn new(
        device: DeviceTarget,
        accounts: Vec<Account>,
        reporter: Reporter,
        backoff: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                accounts,
                reporter,
                backoff,
            }),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<PlaybackUri, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts playback of `request` on `account`, handing over to a
    /// background retry when the first attempt fails recoverably.
    ///
    /// Returns [`RetryStatus::Retrying`] when a retry task took over.
    pub async fn start_or_retry(&self, account: &Account, request: &PlaybackRequest) -> RetryStatus {
        let uri = &request.uri;
        let start = start_for(uri);

        match self.shared.attempt(account, &start).await {
            Ok(()) => {
                info!("{account}: playing {uri}");
                self.cancel_all();
                self.shared.reporter.report(Status::GreenSolid);
                RetryStatus::Succeeded
            }
            Err(e) => match classify(&e) {
                Classification::Fatal => {
                    error!("{account}: cannot play {uri}: {e}");
                    self.cancel(uri);
                    self.shared.reporter.report(Status::RedSolid);
                    RetryStatus::AbortedFatal
                }
                class => {
                    warn!("{account}: starting {uri} failed, retrying: {e}");
                    if class == Classification::DeviceNotFound {
                        self.shared.device.forget().await;
                    }
                    self.spawn(account.clone(), uri.clone(), start);
                    RetryStatus::Retrying
                }
            },
        }
    }

    fn spawn(&self, account: Account, uri: PlaybackUri, start: Start) {
        let mut pending = self.pending();
        pending.retain(|_, task| !task.handle.is_finished());

        if let Some(stale) = pending.remove(&uri) {
            debug!("replacing retry of {uri}");
            stale.cancel.cancel();
        }

        self.shared.reporter.report(Status::RedBlink);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::retry(
            Arc::clone(&self.shared),
            account,
            uri.clone(),
            start,
            cancel.clone(),
        ));
        pending.insert(uri, Pending { cancel, handle });
    }

    async fn retry(
        shared: Arc<Shared>,
        account: Account,
        uri: PlaybackUri,
        start: Start,
        cancel: CancellationToken,
    ) -> RetryState {
        let mut attempts = 1;
        let state = |attempts, status| RetryState {
            uri: uri.clone(),
            attempts,
            status,
        };

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(shared.backoff) => {}
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = shared.attempt(&account, &start) => result,
            };

            match result {
                Ok(()) => {
                    info!("{account}: playing {uri} after {attempts} attempts");
                    shared.reporter.report(Status::GreenSolid);
                    return state(attempts, RetryStatus::Succeeded);
                }
                Err(e) => match classify(&e) {
                    Classification::Fatal => {
                        error!("{account}: giving up on {uri}: {e}");
                        shared.reporter.report(Status::RedSolid);
                        return state(attempts, RetryStatus::AbortedFatal);
                    }
                    Classification::DeviceNotFound => {
                        warn!("{account}: output device gone (attempt {attempts}): {e}");
                        shared.device.forget().await;
                    }
                    Classification::Transient => {
                        warn!("{account}: starting {uri} failed (attempt {attempts}): {e}");
                    }
                },
            }
        }

        debug!("retry of {uri} cancelled after {attempts} attempts");
        state(attempts, RetryStatus::Cancelled)
    }

    /// Whether any retry is still running.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        self.pending()
            .values()
            .any(|task| !task.handle.is_finished())
    }

    /// Cancels the retry of `uri`, if any.
    pub fn cancel(&self, uri: &PlaybackUri) {
        if let Some(task) = self.pending().remove(uri) {
            task.cancel.cancel();
        }
    }

    /// Cancels every pending retry.
    pub fn cancel_all(&self) {
        for (uri, task) in self.pending().drain() {
            if !task.handle.is_finished() {
                debug!("cancelling stale retry of {uri}");
            }
            task.cancel.cancel();
        }
    }

    /// Waits for the retry of `uri` to finish and returns its final state.
    pub async fn wait(&self, uri: &PlaybackUri) -> Option<RetryState> {
        let task = self.pending().remove(uri)?;
        match task.handle.await {
            Ok(state) => Some(state),
            Err(e) => {
                error!("retry of {uri} failed: {e}");
                None
            }
        }
    }

    /// Cancels every pending retry and waits for the tasks to finish.
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.pending().drain().collect();
        for (uri, task) in tasks {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!("retry of {uri} failed: {e}");
            }
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{sync::mpsc, time};

    use super::*;
    use crate::{
        config::DeviceSelection,
        remote::mock::{device, Call, MockRemote},
        status::testing::reported,
    };

    const BACKOFF: Duration = Duration::from_secs(5);

    fn scheduler(
        remote: &Arc<MockRemote>,
        selection: DeviceSelection,
    ) -> (RetryScheduler, Account, DeviceTarget, mpsc::UnboundedReceiver<Status>) {
        let account = Account::new("ben", remote.clone());
        let target = DeviceTarget::new(&selection);
        let (reporter, statuses) = Reporter::channel();
        let scheduler =
            RetryScheduler::new(target.clone(), vec![account.clone()], reporter, BACKOFF);
        (scheduler, account, target, statuses)
    }

    fn fixed() -> DeviceSelection {
        DeviceSelection {
            id: Some(String::from("pi")),
            names: Vec::new(),
        }
    }

    fn request(uri: &str) -> PlaybackRequest {
        PlaybackRequest::from_link(uri).unwrap()
    }

    #[test]
    fn classification() {
        assert_eq!(
            classify(&Error::invalid_argument("unsupported")),
            Classification::Fatal
        );
        assert_eq!(
            classify(&Error::not_found("device")),
            Classification::DeviceNotFound
        );
        for error in [
            Error::unavailable("502"),
            Error::resource_exhausted("429"),
            Error::unauthenticated("401"),
            Error::deadline_exceeded("timeout"),
            Error::unknown("418"),
        ] {
            assert_eq!(classify(&error), Classification::Transient);
        }
    }

    #[test]
    fn start_bodies() {
        let track = "spotify:track:abc".parse().unwrap();
        assert_eq!(
            start_for(&track),
            Start::Uris {
                uris: vec![String::from("spotify:track:abc")]
            }
        );

        let playlist = "spotify:playlist:p1".parse().unwrap();
        assert_eq!(
            start_for(&playlist),
            Start::Context {
                context_uri: String::from("spotify:playlist:p1")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success() {
        let remote = MockRemote::new();
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());

        let status = scheduler
            .start_or_retry(&account, &request("spotify:track:abc"))
            .await;

        assert_eq!(status, RetryStatus::Succeeded);
        assert_eq!(reported(&mut statuses), [Status::GreenSolid]);
        assert_eq!(
            remote.calls(),
            [Call::Start(
                Some(String::from("pi")),
                Start::Uris {
                    uris: vec![String::from("spotify:track:abc")]
                }
            )]
        );
        assert!(!scheduler.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_cadence() {
        let remote = MockRemote::new();
        remote.state().start_results = [
            Some(ErrorKind::Unavailable),
            Some(ErrorKind::ResourceExhausted),
            None,
        ]
        .into();
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());
        let request = request("spotify:album:zzz");

        let status = scheduler.start_or_retry(&account, &request).await;
        assert_eq!(status, RetryStatus::Retrying);
        assert!(scheduler.is_retrying());
        assert_eq!(remote.starts(), 1);

        time::sleep(BACKOFF - Duration::from_millis(100)).await;
        assert_eq!(remote.starts(), 1);

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(remote.starts(), 2);

        time::sleep(BACKOFF).await;
        assert_eq!(remote.starts(), 3);

        let state = scheduler.wait(&request.uri).await.unwrap();
        assert_eq!(state.status, RetryStatus::Succeeded);
        assert_eq!(state.attempts, 3);
        assert_eq!(reported(&mut statuses), [Status::RedBlink, Status::GreenSolid]);

        time::sleep(BACKOFF * 4).await;
        assert_eq!(remote.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_first_attempt() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::InvalidArgument);
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());

        let status = scheduler
            .start_or_retry(&account, &request("spotify:show:s1"))
            .await;

        assert_eq!(status, RetryStatus::AbortedFatal);
        assert_eq!(reported(&mut statuses), [Status::RedSolid]);

        time::sleep(BACKOFF * 4).await;
        assert_eq!(remote.starts(), 1);
        assert!(!scheduler.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn single_abort_transition() {
        let remote = MockRemote::new();
        remote.state().start_results = [
            Some(ErrorKind::Unavailable),
            Some(ErrorKind::Unavailable),
        ]
        .into();
        remote.state().start_default = Some(ErrorKind::InvalidArgument);
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());
        let request = request("spotify:track:abc");

        scheduler.start_or_retry(&account, &request).await;
        let state = scheduler.wait(&request.uri).await.unwrap();

        assert_eq!(state.status, RetryStatus::AbortedFatal);
        assert_eq!(state.attempts, 3);
        assert_eq!(reported(&mut statuses), [Status::RedBlink, Status::RedSolid]);

        time::sleep(BACKOFF * 4).await;
        assert_eq!(remote.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn device_not_found_resolves_again() {
        let remote = MockRemote::new();
        remote.state().devices = vec![device("k1", "Kitchen")];
        remote.state().start_results = [Some(ErrorKind::NotFound)].into();
        let selection = DeviceSelection {
            id: None,
            names: vec![String::from("Kitchen")],
        };
        let (scheduler, account, target, _statuses) = scheduler(&remote, selection);
        target.set("k1").await;
        let request = request("spotify:track:abc");

        assert_eq!(
            scheduler.start_or_retry(&account, &request).await,
            RetryStatus::Retrying
        );
        assert_eq!(target.get().await, None);

        let state = scheduler.wait(&request.uri).await.unwrap();
        assert_eq!(state.status, RetryStatus::Succeeded);
        assert_eq!(target.get().await.as_deref(), Some("k1"));

        let calls = remote.calls();
        let position = calls.iter().position(|call| *call == Call::Devices);
        assert!(position.is_some_and(|devices| matches!(calls[devices + 1], Call::Start(Some(_), _))));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_keeps_retrying() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::NotFound);
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());
        let request = request("spotify:track:abc");

        assert_eq!(
            scheduler.start_or_retry(&account, &request).await,
            RetryStatus::Retrying
        );

        time::sleep(Duration::from_millis(100)).await;
        for attempts in 2..=11 {
            time::sleep(BACKOFF).await;
            assert_eq!(remote.starts(), attempts);
            assert!(scheduler.is_retrying());
        }
        assert_eq!(reported(&mut statuses), [Status::RedBlink]);

        scheduler.cancel(&request.uri);
        time::sleep(BACKOFF * 2).await;
        assert_eq!(remote.starts(), 11);
        assert!(!scheduler.is_retrying());
    }

    #[tokio::test(start_paused = true)]
    async fn same_uri_replaces_retry() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::Unavailable);
        let (scheduler, account, _, _statuses) = scheduler(&remote, fixed());
        let request = request("spotify:track:abc");

        scheduler.start_or_retry(&account, &request).await;
        time::sleep(Duration::from_secs(2)).await;
        scheduler.start_or_retry(&account, &request).await;
        assert_eq!(remote.starts(), 2);

        // Only the replacement is left: one attempt every backoff.
        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(remote.starts(), 2);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(remote.starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn different_uris_retry_concurrently() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::Unavailable);
        let (scheduler, account, _, _statuses) = scheduler(&remote, fixed());

        scheduler
            .start_or_retry(&account, &request("spotify:track:a"))
            .await;
        scheduler
            .start_or_retry(&account, &request("spotify:track:b"))
            .await;

        time::sleep(BACKOFF + Duration::from_millis(100)).await;
        assert_eq!(remote.starts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_cancels_stale_retries() {
        let remote = MockRemote::new();
        remote.state().start_results = [Some(ErrorKind::Unavailable)].into();
        let (scheduler, account, _, mut statuses) = scheduler(&remote, fixed());
        let first = request("spotify:track:a");

        scheduler.start_or_retry(&account, &first).await;
        assert!(scheduler.is_retrying());

        let status = scheduler
            .start_or_retry(&account, &request("spotify:track:b"))
            .await;
        assert_eq!(status, RetryStatus::Succeeded);

        time::sleep(BACKOFF * 3).await;
        assert_eq!(remote.starts(), 2);
        assert!(!scheduler.is_retrying());
        assert_eq!(reported(&mut statuses), [Status::RedBlink, Status::GreenSolid]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels() {
        let remote = MockRemote::new();
        remote.state().start_default = Some(ErrorKind::Unavailable);
        let (scheduler, account, _, _statuses) = scheduler(&remote, fixed());

        scheduler
            .start_or_retry(&account, &request("spotify:track:a"))
            .await;
        scheduler.shutdown().await;

        time::sleep(BACKOFF * 3).await;
        assert_eq!(remote.starts(), 1);
        assert!(!scheduler.is_retrying());
    }
}
