//! GPIO lines through the Linux sysfs interface.
//!
//! Lines are exported on open and unexported again when dropped. Buttons are
//! wired active low against external pull-ups: a pressed button reads `0`.

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use crate::{
    config::Pins,
    error::{Error, Result},
    status::Leds,
};

/// Default sysfs mount point of the GPIO class.
pub const SYSFS_GPIO: &str = "/sys/class/gpio";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

#[derive(Debug)]
pub struct Pin {
    number: u32,
    root: PathBuf,
    exported: bool,
}

impl Pin {
    /// Opens line `number` below [`SYSFS_GPIO`].
    ///
    /// # Errors
    ///
    /// Returns error if the line cannot be exported or configured.
    pub fn open(number: u32, direction: Direction) -> Result<Self> {
        Self::open_at(SYSFS_GPIO, number, direction)
    }

    /// Opens line `number` below `root`.
    ///
    /// # Errors
    ///
    /// Returns error if the line cannot be exported or configured.
    pub fn open_at(root: impl AsRef<Path>, number: u32, direction: Direction) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let line = root.join(format!("gpio{number}"));

        let mut exported = false;
        if !line.exists() {
            fs::write(root.join("export"), number.to_string())?;
            exported = true;

            // udev needs a moment to hand out permissions on new lines.
            for _ in 0..10 {
                if line.join("direction").exists() {
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }

        fs::write(line.join("direction"), direction.as_str()).map_err(|e| {
            Error::failed_precondition(format!("cannot configure gpio{number}: {e}"))
        })?;
        trace!("gpio{number} opened as {}", direction.as_str());

        Ok(Self {
            number,
            root,
            exported,
        })
    }

    fn value_path(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.number)).join("value")
    }

    #[must_use]
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Whether the line is high.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be read.
    pub fn is_high(&self) -> Result<bool> {
        let value = fs::read_to_string(self.value_path())?;
        match value.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(Error::data_loss(format!(
                "gpio{}: unexpected value {other:?}",
                self.number
            ))),
        }
    }

    /// Drives the line high or low.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be written.
    pub fn set_high(&self, high: bool) -> Result<()> {
        fs::write(self.value_path(), if high { "1" } else { "0" })?;
        Ok(())
    }
}

impl Drop for Pin {
    fn drop(&mut self) {
        if self.exported {
            if let Err(e) = fs::write(self.root.join("unexport"), self.number.to_string()) {
                debug!("cannot unexport gpio{}: {e}", self.number);
            }
        }
    }
}

/// Status LEDs on two output lines.
#[derive(Debug)]
pub struct GpioLeds {
    red: Pin,
    green: Pin,
}

impl GpioLeds {
    /// # Errors
    ///
    /// Returns error if either line cannot be opened.
    pub fn open(pins: &Pins) -> Result<Self> {
        Ok(Self {
            red: Pin::open(pins.led_red, Direction::Out)?,
            green: Pin::open(pins.led_green, Direction::Out)?,
        })
    }
}

impl Leds for GpioLeds {
    fn set(&mut self, red: bool, green: bool) -> Result<()> {
        self.red.set_high(red)?;
        self.green.set_high(green)
    }
}
