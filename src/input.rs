//! Physical buttons and keyboard keys.
//!
//! One OS thread polls every [`InputSource`] at a fixed rate, debounces the
//! triggers per source and forwards them as [`TransportEvent`]s to the
//! transport controller.
//!
//! Keys: `w`/`s` volume up/down, `d` next, `a` previous, space play/pause,
//! `r` restart (twice for previous). Ctrl+C and `q` quit, since the terminal
//! no longer turns Ctrl+C into a signal while keys are read raw.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Pins, Timing},
    error::{Error, Result},
    gpio::{Direction, Pin},
    transport::{Control, TransportEvent},
};

/// Where a trigger came from. Debouncing is tracked per trigger.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    Button(u32),
    Key(char),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Input {
    Pressed(Trigger, Control),
    Quit,
}

/// Ignores triggers within `window` of the last accepted trigger of the same
/// source.
#[derive(Clone, Debug)]
pub struct Debouncer {
    window: Duration,
    accepted: HashMap<Trigger, Instant>,
}

impl Debouncer {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            accepted: HashMap::new(),
        }
    }

    pub fn accept(&mut self, trigger: Trigger, at: Instant) -> bool {
        if let Some(last) = self.accepted.get(&trigger) {
            if at.saturating_duration_since(*last) < self.window {
                trace!("debounced {trigger:?}");
                return false;
            }
        }

        self.accepted.insert(trigger, at);
        true
    }
}

/// Something that can be polled for inputs.
pub trait InputSource: Send {
    fn name(&self) -> &str;

    /// Appends the inputs triggered since the last poll.
    fn poll(&mut self, inputs: &mut Vec<Input>) -> Result<()>;
}

struct Button {
    pin: Pin,
    control: Control,
    pressed: bool,
}

/// Push buttons on GPIO lines, active low.
pub struct Buttons {
    buttons: Vec<Button>,
}

impl Buttons {
    /// # Errors
    ///
    /// Returns error if a line cannot be opened.
    pub fn open(pins: &Pins) -> Result<Self> {
        let wiring = [
            (pins.volume_up, Control::VolumeUp),
            (pins.volume_down, Control::VolumeDown),
            (pins.next, Control::Next),
            (pins.previous, Control::RestartOrPrevious),
            (pins.play_pause, Control::PlayPauseToggle),
        ];

        let buttons = wiring
            .into_iter()
            .map(|(number, control)| {
                Ok(Button {
                    pin: Pin::open(number, Direction::In)?,
                    control,
                    pressed: false,
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self { buttons })
    }

    #[cfg(test)]
    fn from_pins(pins: Vec<(Pin, Control)>) -> Self {
        let buttons = pins
            .into_iter()
            .map(|(pin, control)| Button {
                pin,
                control,
                pressed: false,
            })
            .collect();
        Self { buttons }
    }
}

impl InputSource for Buttons {
    fn name(&self) -> &str {
        "buttons"
    }

    fn poll(&mut self, inputs: &mut Vec<Input>) -> Result<()> {
        for button in &mut self.buttons {
            let pressed = !button.pin.is_high()?;
            if pressed && !button.pressed {
                inputs.push(Input::Pressed(
                    Trigger::Button(button.pin.number()),
                    button.control,
                ));
            }
            button.pressed = pressed;
        }
        Ok(())
    }
}

/// Keys read from the controlling terminal in raw mode.
pub struct Keyboard;

impl Keyboard {
    /// # Errors
    ///
    /// Returns error if the terminal cannot be switched to raw mode.
    pub fn open() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| Error::failed_precondition(format!("keyboard unavailable: {e}")))?;
        Ok(Self)
    }

    #[must_use]
    pub fn map(code: KeyCode, modifiers: KeyModifiers) -> Option<Input> {
        let control = match code {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Some(Input::Quit)
            }
            KeyCode::Char('q') => return Some(Input::Quit),
            KeyCode::Char('w') => Control::VolumeUp,
            KeyCode::Char('s') => Control::VolumeDown,
            KeyCode::Char('d') => Control::Next,
            KeyCode::Char('a') => Control::Previous,
            KeyCode::Char(' ') => Control::PlayPauseToggle,
            KeyCode::Char('r') => Control::RestartOrPrevious,
            _ => return None,
        };

        let KeyCode::Char(key) = code else {
            return None;
        };
        Some(Input::Pressed(Trigger::Key(key), control))
    }
}

impl InputSource for Keyboard {
    fn name(&self) -> &str {
        "keyboard"
    }

    fn poll(&mut self, inputs: &mut Vec<Input>) -> Result<()> {
        while event::poll(Duration::ZERO)? {
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            if let Some(input) = Self::map(key.code, key.modifiers) {
                inputs.push(input);
            }
        }
        Ok(())
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            error!("cannot restore terminal: {e}");
        }
    }
}

/// The input polling thread.
pub struct InputPoller {
    running: Arc<AtomicBool>,
    quit: CancellationToken,
    handle: thread::JoinHandle<()>,
}

impl InputPoller {
    /// Starts polling `sources` every `timing.input_poll`.
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned.
    pub fn spawn(
        sources: Vec<Box<dyn InputSource>>,
        events: mpsc::UnboundedSender<TransportEvent>,
        timing: &Timing,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let quit = CancellationToken::new();

        let poller = Poller {
            sources,
            failing: Vec::new(),
            debouncer: Debouncer::new(timing.debounce),
            interval: timing.input_poll,
            events,
            running: Arc::clone(&running),
            quit: quit.clone(),
        };

        let handle = thread::Builder::new()
            .name(String::from("input"))
            .spawn(move || poller.run())?;

        Ok(Self {
            running,
            quit,
            handle,
        })
    }

    /// Completes when a quit key was pressed.
    pub async fn quit_requested(&self) {
        self.quit.cancelled().await;
    }

    /// Stops polling and joins the thread.
    pub fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("input thread panicked");
        }
    }
}

struct Poller {
    sources: Vec<Box<dyn InputSource>>,
    failing: Vec<bool>,
    debouncer: Debouncer,
    interval: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    running: Arc<AtomicBool>,
    quit: CancellationToken,
}

impl Poller {
    fn run(mut self) {
        debug!("polling {} input source(s)", self.sources.len());
        self.failing = vec![false; self.sources.len()];
        let mut inputs = Vec::new();

        while self.running.load(Ordering::Relaxed) {
            for (source, failing) in self.sources.iter_mut().zip(&mut self.failing) {
                match source.poll(&mut inputs) {
                    Ok(()) => {
                        if *failing {
                            info!("{} recovered", source.name());
                            *failing = false;
                        }
                    }
                    Err(e) => {
                        if !*failing {
                            warn!("cannot read {}: {e}", source.name());
                            *failing = true;
                        }
                    }
                }
            }

            let now = Instant::now();
            for input in inputs.drain(..) {
                match input {
                    Input::Quit => {
                        info!("quit key pressed");
                        self.quit.cancel();
                    }
                    Input::Pressed(trigger, control) => {
                        if self.debouncer.accept(trigger, now) {
                            debug!("{control} pressed");
                            let event = TransportEvent { control, at: now };
                            if self.events.send(event).is_err() {
                                debug!("transport controller gone, stopping input");
                                return;
                            }
                        }
                    }
                }
            }

            thread::sleep(self.interval);
        }

        debug!("input polling stopped");
    }
}
