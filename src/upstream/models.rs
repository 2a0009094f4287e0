//! Wire models for the upstream "recently played" feed.

use crate::pipeline::RawPlayRecord;
use serde::Deserialize;

/// One page of the recently-played feed. `items` is required by contract;
/// its absence means the payload is malformed, which the client surfaces as
/// an upstream error rather than treating as an empty page.
#[derive(Debug, Deserialize)]
pub struct RecentlyPlayedPage {
    pub items: Option<Vec<PlayedItem>>,
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PlayedItem {
    pub track: Option<TrackObject>,
    pub played_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TrackObject {
    pub id: Option<String>,
    pub name: Option<String>,
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub artists: Vec<ArtistObject>,
}

#[derive(Debug, Deserialize)]
pub struct ArtistObject {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl PlayedItem {
    /// Flatten into a raw snapshot row. Only the primary (first) artist is
    /// kept; anything missing stays `None` for the transformer to judge.
    pub fn into_record(self) -> RawPlayRecord {
        let played_at = self.played_at;
        match self.track {
            Some(track) => {
                let artist = track.artists.into_iter().next();
                RawPlayRecord {
                    song_id: track.id,
                    song_title: track.name,
                    song_duration_ms: track.duration_ms,
                    artist_id: artist.as_ref().and_then(|a| a.id.clone()),
                    artist_name: artist.and_then(|a| a.name),
                    played_at,
                }
            }
            None => RawPlayRecord {
                played_at,
                ..Default::default()
            },
        }
    }
}
