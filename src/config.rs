//! Runtime configuration.
//!
//! The command line (see `main.rs`) fills in a [`Config`]. Account
//! credentials are read from a TOML secrets file or from the environment,
//! and an optional device priority file seeds the output device lookup.

use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use url::Url;

use crate::{
    error::{Error, Result},
    token::Credentials,
};

/// Base URL of the Spotify Web API.
pub const API_URL: &str = "https://api.spotify.com/v1/";

/// Spotify accounts service endpoint that exchanges refresh tokens.
pub const TOKEN_URL: &str = "https://accounts.spotify.com/api/token";

/// Largest secrets or priority file we are willing to read.
const MAX_FILE_SIZE: u64 = 64 * 1024;

/// Timing constants of the input, retry and polling machinery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    /// Repeated triggers of one input within this window are ignored.
    pub debounce: Duration,

    /// A second "previous" press within this window skips back instead of
    /// restarting the current track.
    pub double_press: Duration,

    /// Volume change per button press, in percent.
    pub volume_step: u8,

    /// Wait between playback start attempts while retrying.
    pub retry_backoff: Duration,

    /// Poll interval of buttons and keyboard.
    pub input_poll: Duration,

    /// Poll interval of the "now playing" state.
    pub now_playing_poll: Duration,

    /// Identical scans within this window are ignored.
    pub rescan_cooldown: Duration,

    /// Access tokens are refreshed this long before they expire.
    pub token_margin: Duration,

    /// Half period of a blinking LED.
    pub blink: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            double_press: Duration::from_millis(500),
            volume_step: 10,
            retry_backoff: Duration::from_secs(5),
            input_poll: Duration::from_millis(50),
            now_playing_poll: Duration::from_secs(5),
            rescan_cooldown: Duration::from_secs(3),
            token_margin: Duration::from_secs(30),
            blink: Duration::from_millis(400),
        }
    }
}

/// How to find the output device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceSelection {
    /// Fixed device id; skips the lookup by name when set.
    pub id: Option<String>,

    /// Device names in order of preference, matched case-insensitively.
    pub names: Vec<String>,
}

impl DeviceSelection {
    /// Checks that the output device can be identified.
    ///
    /// # Errors
    ///
    /// Returns error if neither an id nor any name is given.
    pub fn validate(&self) -> Result<()> {
        let named = self.names.iter().any(|name| !name.trim().is_empty());
        if self.id.is_none() && !named {
            return Err(Error::invalid_argument(
                "no output device given: use a device name or id",
            ));
        }
        Ok(())
    }
}

/// GPIO line numbers (BCM numbering).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Pins {
    pub led_red: u32,
    pub led_green: u32,
    pub volume_up: u32,
    pub volume_down: u32,
    pub next: u32,
    pub previous: u32,
    pub play_pause: u32,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            led_red: 22,
            led_green: 18,
            volume_up: 27,
            volume_down: 5,
            next: 23,
            previous: 24,
            play_pause: 17,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub user_agent: String,

    pub api_url: Url,
    pub token_url: Url,

    pub accounts: Vec<Credentials>,
    pub device: DeviceSelection,

    /// `None` disables GPIO; LEDs are then only logged.
    pub pins: Option<Pins>,
    pub keyboard: bool,

    pub timing: Timing,
}

impl Config {
    /// Creates a configuration for the given accounts with default
    /// endpoints, no GPIO and default timing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when no accounts are given.
    pub fn with_accounts(accounts: Vec<Credentials>) -> Result<Self> {
        if accounts.is_empty() {
            return Err(Error::invalid_argument("no accounts configured"));
        }

        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = std::env::consts::OS;
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} ({os_name} {os_version})");
        trace!("user agent: {user_agent}");

        Ok(Self {
            app_name,
            app_version,
            user_agent,

            api_url: Url::parse(API_URL)?,
            token_url: Url::parse(TOKEN_URL)?,

            accounts,
            device: DeviceSelection::default(),

            pins: None,
            keyboard: false,

            timing: Timing::default(),
        })
    }
}

/// Reads a small text file, refusing anything that could exhaust memory.
fn read_small(path: &Path) -> Result<String> {
    let file_size = fs::metadata(path)?.len();
    if file_size > MAX_FILE_SIZE {
        return Err(Error::invalid_argument(format!(
            "{} is too large ({file_size} bytes)",
            path.display()
        )));
    }

    fs::read_to_string(path).map_err(Into::into)
}

#[derive(Deserialize)]
struct Secrets {
    #[serde(default, rename = "account")]
    accounts: Vec<Credentials>,
}

/// Loads accounts from a TOML secrets file with one `[[account]]` table per
/// account, in order of preference.
///
/// ```toml
/// [[account]]
/// name = "ben"
/// client_id = "..."
/// client_secret = "..."
/// refresh_token = "..."
/// ```
pub fn accounts_from_file(path: impl AsRef<Path>) -> Result<Vec<Credentials>> {
    let path = path.as_ref();
    let secrets: Secrets = toml::from_str(&read_small(path)?)?;
    if secrets.accounts.is_empty() {
        return Err(Error::invalid_argument(format!(
            "{} does not contain any [[account]]",
            path.display()
        )));
    }

    Ok(secrets.accounts)
}

/// Loads accounts from environment variables.
///
/// For each label the keys `SPOTIFY_CLIENT_ID_<LABEL>`,
/// `SPOTIFY_CLIENT_SECRET_<LABEL>` and `SPOTIFY_REFRESH_TOKEN_<LABEL>` are
/// read. An empty label reads the keys without suffix. The account is named
/// after the lowercased label.
pub fn accounts_from_env<S: AsRef<str>>(labels: &[S]) -> Result<Vec<Credentials>> {
    accounts_from_lookup(labels, |key| std::env::var(key).ok())
}

fn accounts_from_lookup<S, F>(labels: &[S], lookup: F) -> Result<Vec<Credentials>>
where
    S: AsRef<str>,
    F: Fn(&str) -> Option<String>,
{
    labels
        .iter()
        .map(|label| {
            let label = label.as_ref().trim();
            let key = |prefix: &str| {
                if label.is_empty() {
                    prefix.to_owned()
                } else {
                    format!("{prefix}_{}", label.to_uppercase())
                }
            };
            let var = |prefix: &str| {
                let key = key(prefix);
                lookup(&key)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| Error::invalid_argument(format!("{key} is not set")))
            };

            let name = if label.is_empty() {
                String::from("default")
            } else {
                label.to_lowercase()
            };

            Ok(Credentials {
                name,
                client_id: var("SPOTIFY_CLIENT_ID")?,
                client_secret: var("SPOTIFY_CLIENT_SECRET")?,
                refresh_token: var("SPOTIFY_REFRESH_TOKEN")?,
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct Priority {
    priority: Vec<String>,
}

/// Loads the device priority file: a JSON object with an ordered list of
/// device names, e.g. `{"priority": ["Kitchen", "Web Player (Chrome)"]}`.
pub fn device_priority(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let priority: Priority = serde_json::from_str(&read_small(path.as_ref())?)?;
    Ok(priority.priority)
}
