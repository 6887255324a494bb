//! Player endpoint types: devices, playback state and start requests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A Spotify Connect device as listed by `GET /me/player/devices`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Hash)]
pub struct Device {
    /// Device id; restricted devices may not expose one.
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub volume_percent: Option<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Devices {
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Hash)]
pub struct Artist {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Hash)]
pub struct AlbumRef {
    pub name: String,
}

/// The currently playing track or episode.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Hash)]
pub struct Item {
    pub uri: String,
    pub name: String,
    /// Empty for episodes.
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub album: Option<AlbumRef>,
    #[serde(default)]
    pub track_number: Option<u32>,
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(number) = self.track_number {
            write!(f, "{number}. ")?;
        }
        write!(f, "{}", self.name)?;
        if !self.artists.is_empty() {
            write!(f, " - {}", join_names(&self.artists))?;
        }
        Ok(())
    }
}

/// Joins artist names the way they are shown to people.
#[must_use]
pub fn join_names(artists: &[Artist]) -> String {
    artists
        .iter()
        .map(|artist| artist.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Playback state as returned by `GET /me/player`.
///
/// The endpoint answers `204 No Content` when nothing is active at all; that
/// is represented as `None` by the caller, not by this type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Playback {
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub device: Option<Device>,
    #[serde(default)]
    pub item: Option<Item>,
}

impl Playback {
    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.device.as_ref().and_then(|device| device.id.as_deref())
    }

    #[must_use]
    pub fn volume(&self) -> Option<u8> {
        self.device.as_ref().and_then(|device| device.volume_percent)
    }
}

/// Body of `PUT /me/player/play`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Hash)]
#[serde(untagged)]
pub enum Start {
    /// Play an explicit list of tracks or episodes.
    Uris { uris: Vec<String> },

    /// Play an album, playlist, artist or show.
    Context { context_uri: String },

    /// Resume whatever was playing.
    Resume {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_bodies() {
        let uris = Start::Uris {
            uris: vec![String::from("spotify:track:abc")],
        };
        assert_eq!(
            serde_json::to_string(&uris).unwrap(),
            r#"{"uris":["spotify:track:abc"]}"#
        );

        let context = Start::Context {
            context_uri: String::from("spotify:album:xyz"),
        };
        assert_eq!(
            serde_json::to_string(&context).unwrap(),
            r#"{"context_uri":"spotify:album:xyz"}"#
        );

        assert_eq!(serde_json::to_string(&Start::Resume {}).unwrap(), "{}");
    }

    #[test]
    fn playback_state() {
        let playback: Playback = serde_json::from_str(
            r#"{
                "is_playing": true,
                "progress_ms": 1234,
                "device": {"id": "dev1", "name": "Kitchen", "is_active": true, "volume_percent": 40},
                "item": {
                    "uri": "spotify:track:abc",
                    "name": "Song",
                    "track_number": 3,
                    "artists": [{"name": "A"}, {"name": "B"}],
                    "album": {"name": "Record"}
                }
            }"#,
        )
        .unwrap();

        assert!(playback.is_playing);
        assert_eq!(playback.device_id(), Some("dev1"));
        assert_eq!(playback.volume(), Some(40));
        assert_eq!(playback.item.unwrap().to_string(), "3. Song - A, B");
    }

    #[test]
    fn restricted_device_without_id() {
        let devices: Devices =
            serde_json::from_str(r#"{"devices": [{"id": null, "name": "TV"}]}"#).unwrap();
        assert_eq!(devices.devices[0].id, None);
        assert_eq!(devices.devices[0].volume_percent, None);
    }
}
