//! Transport controls: volume, skipping, play/pause and restart.
//!
//! Input events arrive already debounced (see [`crate::input`]) and are
//! handled one at a time by [`TransportController`]. The controller keeps a
//! small cache of the playback state, which it only updates after the remote
//! acknowledged a command, and queries the remote when a field it needs is
//! unknown.

use std::{fmt, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};

use crate::{
    config::Timing,
    device::DeviceTarget,
    error::{Error, Result},
    protocol::player::Start,
    remote::Account,
    status::{Reporter, Status},
};

/// A transport control.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Control {
    VolumeUp,
    VolumeDown,
    Next,
    Previous,
    PlayPauseToggle,
    /// Restart the current track; pressed twice, skip back instead.
    RestartOrPrevious,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = match self {
            Self::VolumeUp => "volume up",
            Self::VolumeDown => "volume down",
            Self::Next => "next",
            Self::Previous => "previous",
            Self::PlayPauseToggle => "play/pause",
            Self::RestartOrPrevious => "restart/previous",
        };
        write!(f, "{control}")
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransportEvent {
    pub control: Control,
    /// When the input was triggered.
    pub at: Instant,
}

impl TransportEvent {
    #[must_use]
    pub fn now(control: Control) -> Self {
        Self {
            control,
            at: Instant::now(),
        }
    }
}

/// What a [`Control`] resolves to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Volume(i16),
    Next,
    Previous,
    Restart,
    Toggle,
}

/// Tells a single "previous" press from a double press.
///
/// The first press restarts the current track. A second press within the
/// window skips to the previous track and starts over; a press after the
/// window is a fresh first press.
#[derive(Clone, Debug)]
pub struct PressResolver {
    window: Duration,
    last: Option<Instant>,
}

impl PressResolver {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn resolve(&mut self, at: Instant) -> Command {
        match self.last.take() {
            Some(last) if at.saturating_duration_since(last) < self.window => Command::Previous,
            _ => {
                self.last = Some(at);
                Command::Restart
            }
        }
    }
}

/// Last known playback state. `None` is unknown.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaybackStateCache {
    pub is_playing: Option<bool>,
    pub volume: Option<u8>,
}

impl PlaybackStateCache {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Serializes transport commands onto the controlled account.
///
/// The controlled account is the one most recently granted playback, as
/// published on the `active` channel, or the first configured account until
/// anything was granted.
pub struct TransportController {
    accounts: Vec<Account>,
    active: watch::Receiver<Option<Account>>,
    controlled: Option<Account>,
    device: DeviceTarget,
    reporter: Reporter,
    volume_step: u8,
    presses: PressResolver,
    cache: PlaybackStateCache,
}

impl TransportController {
    #[must_use]
    pub fn new(
        accounts: Vec<Account>,
        active: watch::Receiver<Option<Account>>,
        device: DeviceTarget,
        reporter: Reporter,
        timing: &Timing,
    ) -> Self {
        Self {
            accounts,
            active,
            controlled: None,
            device,
            reporter,
            volume_step: timing.volume_step,
            presses: PressResolver::new(timing.double_press),
            cache: PlaybackStateCache::default(),
        }
    }

    #[must_use]
    pub fn cache(&self) -> PlaybackStateCache {
        self.cache
    }

    /// Handles events until the input side hangs up.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        debug!("transport controller stopped");
    }

    pub async fn handle(&mut self, event: TransportEvent) {
        let step = i16::from(self.volume_step);
        let command = match event.control {
            Control::VolumeUp => Command::Volume(step),
            Control::VolumeDown => Command::Volume(-step),
            Control::Next => Command::Next,
            Control::Previous => Command::Previous,
            Control::PlayPauseToggle => Command::Toggle,
            Control::RestartOrPrevious => self.presses.resolve(event.at),
        };

        let Some(account) = self.account() else {
            warn!("{}: no account to control", event.control);
            return;
        };

        debug!("{account}: {command:?}");
        self.reporter.report(Status::GreenBlink);

        match self.execute(&account, command).await {
            Ok(()) => {
                let status = if self.cache.is_playing == Some(false) {
                    Status::RedSolid
                } else {
                    Status::GreenSolid
                };
                self.reporter.report(status);
            }
            Err(e) => {
                warn!("{account}: {} failed: {e}", event.control);
                self.reporter.report(Status::RedSolid);
            }
        }
    }

    /// The account to control, dropping the cache on every new grant.
    fn account(&mut self) -> Option<Account> {
        let (granted, regranted) = {
            let active = self.active.borrow_and_update();
            (active.clone(), active.has_changed())
        };
        let account = granted.or_else(|| self.accounts.first().cloned())?;

        let changed = regranted
            || self
                .controlled
                .as_ref()
                .is_none_or(|controlled| !controlled.same_as(&account));
        if changed {
            if self.controlled.is_some() {
                debug!("now controlling {account}");
            }
            self.cache.clear();
            self.controlled = Some(account.clone());
        }

        Some(account)
    }

    async fn execute(&mut self, account: &Account, command: Command) -> Result<()> {
        let device = self.device.get().await;
        let device = device.as_deref();
        let remote = account.remote();

        match command {
            Command::Volume(delta) => {
                if self.cache.volume.is_none() {
                    self.refresh(account).await?;
                }
                let current = self
                    .cache
                    .volume
                    .ok_or_else(|| Error::failed_precondition("volume unknown"))?;

                let volume = (i16::from(current) + delta).clamp(0, 100);
                let volume = u8::try_from(volume).unwrap_or(current);
                info!("volume {current}% -> {volume}%");

                remote.set_volume(device, volume).await?;
                self.cache.volume = Some(volume);
            }

            Command::Toggle => {
                if self.cache.is_playing.is_none() {
                    if let Err(e) = self.refresh(account).await {
                        debug!("{account}: playback state unknown: {e}");
                    }
                }

                if self.cache.is_playing == Some(true) {
                    info!("pausing");
                    remote.pause(device).await?;
                    self.cache.is_playing = Some(false);
                } else {
                    info!("resuming");
                    remote.start(device, &Start::Resume {}).await?;
                    self.cache.is_playing = Some(true);
                }
            }

            Command::Next | Command::Previous | Command::Restart => {
                self.cache.is_playing = None;
                match command {
                    Command::Next => remote.next(device).await?,
                    Command::Previous => remote.previous(device).await?,
                    _ => remote.seek(device, Duration::ZERO).await?,
                }
            }
        }

        Ok(())
    }

    async fn refresh(&mut self, account: &Account) -> Result<()> {
        let playback = account.remote().playback().await?;
        self.cache = PlaybackStateCache {
            is_playing: playback.as_ref().map(|playback| playback.is_playing),
            volume: playback.as_ref().and_then(|playback| playback.volume()),
        };
        trace!("{account}: refreshed {:?}", self.cache);
        Ok(())
    }
}
