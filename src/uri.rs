//! Playback URIs and the normalization of scanned links.
//!
//! QR codes carry web links such as
//! `https://open.spotify.com/track/6rqhFgbbKwnb9MLmUQDhG6?si=ab12`, while the
//! Web API wants `spotify:track:6rqhFgbbKwnb9MLmUQDhG6`. [`normalize`] maps
//! the former onto the latter and passes anything else through, and
//! [`PlaybackUri`] is the typed form of a canonical URI.

use std::{fmt, str::FromStr, time::Instant};

use crate::error::{Error, Result};

/// Scheme of canonical playback URIs.
pub const SCHEME: &str = "spotify";

/// Host of web-form links.
pub const WEB_HOST: &str = "open.spotify.com";

/// Normalizes a scanned string into a canonical playback URI.
///
/// * Surrounding whitespace, the query string and the fragment are dropped.
/// * Canonical URIs are returned unchanged.
/// * Web-form links are rewritten from `{kind}/{id}` to `spotify:kind:id`.
///   A leading locale segment (`/intl-de/`) and trailing segments are
///   ignored.
/// * Anything else is returned as is.
///
/// Never fails and is idempotent.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .split_once(['?', '#'])
        .map_or(trimmed, |(head, _)| head);

    if trimmed.starts_with("spotify:") {
        return trimmed.to_owned();
    }

    if let Some(path) = web_path(trimmed) {
        let mut segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .skip_while(|segment| segment.starts_with("intl-"));

        if let (Some(kind), Some(id)) = (segments.next(), segments.next()) {
            return format!("{SCHEME}:{kind}:{id}");
        }
    }

    trimmed.to_owned()
}

/// Returns the path of a web-form link, or `None` for anything else.
fn web_path(link: &str) -> Option<&str> {
    let rest = link
        .strip_prefix("https://")
        .or_else(|| link.strip_prefix("http://"))
        .unwrap_or(link);

    rest.strip_prefix(WEB_HOST)
        .filter(|path| path.is_empty() || path.starts_with('/'))
}

/// Whether a scanned string is already a playback URI or web-form link, and
/// needs no redirect resolution.
#[must_use]
pub fn is_direct(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.starts_with("spotify:") || web_path(trimmed).is_some()
}

/// Content kinds that can be played.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Track,
    Episode,
    Album,
    Playlist,
    Artist,
    Show,
}

impl Kind {
    /// Whether this kind is started as a single item rather than as a
    /// context.
    #[must_use]
    pub fn is_item(self) -> bool {
        matches!(self, Self::Track | Self::Episode)
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "track" => Ok(Self::Track),
            "episode" => Ok(Self::Episode),
            "album" => Ok(Self::Album),
            "playlist" => Ok(Self::Playlist),
            "artist" => Ok(Self::Artist),
            "show" => Ok(Self::Show),
            _ => Err(Error::invalid_argument(format!("unknown content kind: {s}"))),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Track => "track",
            Self::Episode => "episode",
            Self::Album => "album",
            Self::Playlist => "playlist",
            Self::Artist => "artist",
            Self::Show => "show",
        };
        write!(f, "{kind}")
    }
}

/// A canonical playback URI: `spotify:{kind}:{id}`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaybackUri {
    kind: Kind,
    id: String,
}

impl PlaybackUri {
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl FromStr for PlaybackUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(SCHEME), Some(kind), Some(id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::invalid_argument(format!(
                "not a playback uri: {s}"
            )));
        };

        if id.is_empty() || !id.chars().all(|chr| chr.is_ascii_alphanumeric()) {
            return Err(Error::invalid_argument(format!("invalid content id: {id}")));
        }

        Ok(Self {
            kind: kind.parse()?,
            id: id.to_owned(),
        })
    }
}

impl fmt::Display for PlaybackUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}:{}:{}", self.kind, self.id)
    }
}

/// A scan that normalized into something playable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub uri: PlaybackUri,
    pub discovered_at: Instant,
}

impl PlaybackRequest {
    /// Normalizes `link` into a request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the link does not normalize into a
    /// playback URI.
    pub fn from_link(link: &str) -> Result<Self> {
        Ok(Self {
            uri: normalize(link).parse()?,
            discovered_at: Instant::now(),
        })
    }
}
