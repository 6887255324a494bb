//! Catalog lookups used to describe content that could not be played.

use serde::Deserialize;

use super::player::{AlbumRef, Artist};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Track {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    pub album: AlbumRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PlaylistTracks {
    pub total: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct Playlist {
    pub name: String,
    pub owner: Owner,
    pub tracks: PlaylistTracks,
}
