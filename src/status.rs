//! System status shown on the two LEDs.
//!
//! Components report [`Status`] changes through a cloneable [`Reporter`].
//! The [`Indicator`] task renders the latest status onto a pair of [`Leds`],
//! blinking where the status asks for it.

use std::{fmt, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Status {
    #[default]
    Off,

    /// Unrecoverable problem with the last request, or paused.
    RedSolid,

    /// Retrying.
    RedBlink,

    /// Playing.
    GreenSolid,

    /// Command in flight.
    GreenBlink,
}

impl Status {
    #[must_use]
    pub fn blinks(self) -> bool {
        matches!(self, Self::RedBlink | Self::GreenBlink)
    }

    /// Red and green LED state. `lit` is the current blink phase.
    #[must_use]
    pub fn render(self, lit: bool) -> (bool, bool) {
        match self {
            Self::Off => (false, false),
            Self::RedSolid => (true, false),
            Self::RedBlink => (lit, false),
            Self::GreenSolid => (false, true),
            Self::GreenBlink => (false, lit),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            Self::Off => "off",
            Self::RedSolid => "red",
            Self::RedBlink => "red blinking",
            Self::GreenSolid => "green",
            Self::GreenBlink => "green blinking",
        };
        write!(f, "{status}")
    }
}

/// Sends status changes to the indicator.
#[derive(Clone, Debug)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<Status>,
}

impl Reporter {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Status>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, status: Status) {
        if self.tx.send(status).is_err() {
            trace!("indicator stopped, dropping status {status}");
        }
    }
}

/// A red and a green LED.
pub trait Leds: Send {
    fn set(&mut self, red: bool, green: bool) -> Result<()>;
}

/// Stand-in for hosts without GPIO: logs LED changes.
#[derive(Debug, Default)]
pub struct LogLeds {
    last: Option<(bool, bool)>,
}

impl Leds for LogLeds {
    fn set(&mut self, red: bool, green: bool) -> Result<()> {
        if self.last != Some((red, green)) {
            trace!("leds: red {red}, green {green}");
            self.last = Some((red, green));
        }
        Ok(())
    }
}

/// Background task driving the LEDs.
pub struct Indicator {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Indicator {
    #[must_use]
    pub fn spawn(
        leds: Box<dyn Leds>,
        statuses: mpsc::UnboundedReceiver<Status>,
        blink: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Self::run(leds, statuses, blink, shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Stops the task and turns the LEDs off.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            error!("indicator task failed: {e}");
        }
    }

    async fn run(
        mut leds: Box<dyn Leds>,
        mut statuses: mpsc::UnboundedReceiver<Status>,
        blink: Duration,
        shutdown: CancellationToken,
    ) {
        let mut status = Status::Off;
        let mut lit = true;
        Self::show(leds.as_mut(), status, lit);

        let mut ticker = time::interval(blink);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                next = statuses.recv() => {
                    let Some(next) = next else { break };
                    if next != status {
                        debug!("status: {next}");
                        status = next;
                        lit = true;
                        ticker.reset();
                        Self::show(leds.as_mut(), status, lit);
                    }
                }

                _ = ticker.tick(), if status.blinks() => {
                    lit = !lit;
                    Self::show(leds.as_mut(), status, lit);
                }
            }
        }

        Self::show(leds.as_mut(), Status::Off, false);
    }

    fn show(leds: &mut dyn Leds, status: Status, lit: bool) {
        let (red, green) = status.render(lit);
        if let Err(e) = leds.set(red, green) {
            warn!("cannot set leds: {e}");
        }
    }
}
