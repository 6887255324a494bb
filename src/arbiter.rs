//! Decides which account may take over playback of a scanned URI.
//!
//! Accounts are consulted in the configured order of preference. An account
//! is busy when it is playing on some device other than ours; the first
//! account that is not busy is granted. When every account is busy, the
//! scanned content is described instead so that it can be handed off.

use std::fmt;

use serde::Serialize;

use crate::{
    device::DeviceTarget,
    error::Result,
    protocol::player::join_names,
    remote::Account,
    uri::{Kind, PlaybackUri},
};

/// Description of content that could not be played.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Metadata {
    Track {
        name: String,
        artists: String,
        album: String,
    },
    Playlist {
        name: String,
        owner: String,
        track_count: u32,
    },
    Album {
        name: String,
        artists: String,
    },
    Unknown {
        uri: String,
    },
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Track {
                name,
                artists,
                album,
            } => write!(f, "track \"{name}\" by {artists} from \"{album}\""),
            Self::Playlist {
                name,
                owner,
                track_count,
            } => write!(f, "playlist \"{name}\" by {owner} ({track_count} tracks)"),
            Self::Album { name, artists } => write!(f, "album \"{name}\" by {artists}"),
            Self::Unknown { uri } => write!(f, "{uri}"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Arbitration {
    /// This account may start playback.
    Granted(Account),

    /// Every account is playing elsewhere.
    AllBusy(Metadata),

    /// The output device could not be found.
    NoDeviceAvailable,
}

pub struct Arbiter {
    accounts: Vec<Account>,
    device: DeviceTarget,
}

impl Arbiter {
    #[must_use]
    pub fn new(accounts: Vec<Account>, device: DeviceTarget) -> Self {
        Self { accounts, device }
    }

    #[must_use]
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    #[must_use]
    pub fn device(&self) -> &DeviceTarget {
        &self.device
    }

    /// Whether `account` is playing on a device other than `device`. An
    /// unresolved `device` counts as different.
    ///
    /// # Errors
    ///
    /// Returns error if the playback state cannot be queried.
    pub async fn is_busy(account: &Account, device: Option<&str>) -> Result<bool> {
        let busy = account
            .remote()
            .playback()
            .await?
            .is_some_and(|playback| {
                playback.is_playing && (device.is_none() || playback.device_id() != device)
            });
        Ok(busy)
    }

    /// Picks the account that may play `uri`.
    ///
    /// Only reads remote state: no playback is started or changed.
    pub async fn choose(&self, uri: &PlaybackUri) -> Arbitration {
        let Some(device) = self.device.get_or_resolve(&self.accounts).await else {
            return Arbitration::NoDeviceAvailable;
        };

        for account in &self.accounts {
            match Self::is_busy(account, Some(device.as_str())).await {
                Ok(false) => {
                    debug!("{account} is free");
                    return Arbitration::Granted(account.clone());
                }
                Ok(true) => debug!("{account} is playing elsewhere"),
                Err(e) => warn!("{account}: skipping, cannot query playback: {e}"),
            }
        }

        Arbitration::AllBusy(self.metadata(uri).await)
    }

    /// Describes `uri` using the first account whose catalog lookup succeeds.
    pub async fn metadata(&self, uri: &PlaybackUri) -> Metadata {
        if matches!(uri.kind(), Kind::Track | Kind::Album | Kind::Playlist) {
            for account in &self.accounts {
                match Self::lookup(account, uri).await {
                    Ok(metadata) => return metadata,
                    Err(e) => debug!("{account}: metadata lookup for {uri} failed: {e}"),
                }
            }
        }

        Metadata::Unknown {
            uri: uri.to_string(),
        }
    }

    async fn lookup(account: &Account, uri: &PlaybackUri) -> Result<Metadata> {
        let remote = account.remote();
        let metadata = match uri.kind() {
            Kind::Track => {
                let track = remote.track(uri.id()).await?;
                Metadata::Track {
                    name: track.name,
                    artists: join_names(&track.artists),
                    album: track.album.name,
                }
            }
            Kind::Album => {
                let album = remote.album(uri.id()).await?;
                Metadata::Album {
                    name: album.name,
                    artists: join_names(&album.artists),
                }
            }
            Kind::Playlist => {
                let playlist = remote.playlist(uri.id()).await?;
                Metadata::Playlist {
                    name: playlist.name,
                    owner: playlist.owner.display_name.unwrap_or_default(),
                    track_count: playlist.tracks.total,
                }
            }
            _ => Metadata::Unknown {
                uri: uri.to_string(),
            },
        };

        Ok(metadata)
    }
}
