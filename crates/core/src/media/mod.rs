//! The media catalog/playback collaborator boundary.
//!
//! The overlay core never indexes music itself; it queries a local
//! catalog service for hash sets, track lookup and playback control.
//! [`MpdCatalog`] talks to a music player daemon over its control socket;
//! [`StaticCatalog`] backs tests and daemon-less runs.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

mod mpd;

pub use mpd::MpdCatalog;

/// Identity of a track, stable across nodes that index the same music
/// regardless of file layout.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TrackHash([u8; 16]);

impl TrackHash {
    pub fn of(artist: &str, title: &str, album: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(artist.as_bytes());
        hasher.update(&[0]);
        hasher.update(title.as_bytes());
        hasher.update(&[0]);
        hasher.update(album.as_bytes());
        let mut digest = [0u8; 16];
        hasher.finalize_xof().fill(&mut digest);
        TrackHash(digest)
    }
}

impl fmt::Display for TrackHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub artist: String,
    pub title: String,
    pub album: String,
    pub duration_secs: u32,
    /// Catalog-local path, meaningless to other nodes.
    pub path: String,
}

impl Track {
    pub fn hash(&self) -> TrackHash {
        TrackHash::of(&self.artist, &self.title, &self.album)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.artist, self.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Playing,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PlaybackStatus {
    pub state: PlayState,
    /// Playlist index of the current song, if any.
    pub song: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog daemon i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog daemon refused command: {0}")]
    Rejected(String),
    #[error("no track in the catalog for hash {0}")]
    UnknownTrack(TrackHash),
    #[error("playlist index {0} out of range")]
    BadIndex(usize),
}

/// The catalog/playback service the overlay consumes. Calls are
/// synchronous; implementations front a local daemon or in-memory state.
pub trait Catalog: Send + Sync + 'static {
    /// Hashes of every locally available track.
    fn hashes(&self) -> HashSet<TrackHash>;

    /// Resolves a hash to local track metadata.
    fn lookup(&self, hash: TrackHash) -> Option<Track>;

    fn status(&self) -> Result<PlaybackStatus, CatalogError>;

    fn play(&self, index: usize) -> Result<(), CatalogError>;

    fn playlist_add(&self, track: &Track) -> Result<(), CatalogError>;

    fn playlist(&self) -> Result<Vec<Track>, CatalogError>;

    /// Percentage of `remote` that is also available locally.
    fn sample_score(&self, remote: &HashSet<TrackHash>) -> f64 {
        if remote.is_empty() {
            return 0.0;
        }
        let local = self.hashes();
        let shared = remote.iter().filter(|hash| local.contains(hash)).count();
        shared as f64 * 100.0 / remote.len() as f64
    }
}

/// In-memory catalog for tests and daemon-less runs.
pub struct StaticCatalog {
    tracks: Vec<Track>,
    deck: Mutex<Deck>,
}

#[derive(Default)]
struct Deck {
    playlist: Vec<Track>,
    playing: Option<usize>,
}

impl StaticCatalog {
    pub fn new(tracks: Vec<Track>) -> Self {
        StaticCatalog {
            tracks,
            deck: Mutex::new(Deck::default()),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl Catalog for StaticCatalog {
    fn hashes(&self) -> HashSet<TrackHash> {
        self.tracks.iter().map(Track::hash).collect()
    }

    fn lookup(&self, hash: TrackHash) -> Option<Track> {
        self.tracks.iter().find(|t| t.hash() == hash).cloned()
    }

    fn status(&self) -> Result<PlaybackStatus, CatalogError> {
        let deck = self.deck.lock();
        Ok(PlaybackStatus {
            state: if deck.playing.is_some() {
                PlayState::Playing
            } else {
                PlayState::Stopped
            },
            song: deck.playing,
        })
    }

    fn play(&self, index: usize) -> Result<(), CatalogError> {
        let mut deck = self.deck.lock();
        if index >= deck.playlist.len() {
            return Err(CatalogError::BadIndex(index));
        }
        deck.playing = Some(index);
        Ok(())
    }

    fn playlist_add(&self, track: &Track) -> Result<(), CatalogError> {
        self.deck.lock().playlist.push(track.clone());
        Ok(())
    }

    fn playlist(&self) -> Result<Vec<Track>, CatalogError> {
        Ok(self.deck.lock().playlist.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_track(artist: &str, title: &str) -> Track {
    Track {
        artist: artist.to_owned(),
        title: title.to_owned(),
        album: String::new(),
        duration_secs: 180,
        path: format!("{artist}/{title}.flac"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_hashes_ignore_file_layout() {
        let mut a = test_track("boards of canada", "roygbiv");
        let mut b = a.clone();
        a.path = "music/a.flac".into();
        b.path = "other/b.flac".into();
        assert_eq!(a.hash(), b.hash());

        let c = test_track("boards of canada", "olson");
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn sample_score_is_the_shared_fraction() {
        let catalog = StaticCatalog::new(vec![
            test_track("a", "1"),
            test_track("a", "2"),
            test_track("a", "3"),
        ]);
        let mut remote: HashSet<TrackHash> = [test_track("a", "1").hash()].into();
        assert_eq!(catalog.sample_score(&remote), 100.0);

        remote.insert(TrackHash::of("nobody", "has", "this"));
        assert_eq!(catalog.sample_score(&remote), 50.0);

        assert_eq!(catalog.sample_score(&HashSet::new()), 0.0);
    }

    #[test]
    fn playlist_controls_guard_indices() {
        let catalog = StaticCatalog::empty();
        assert!(matches!(catalog.play(0), Err(CatalogError::BadIndex(0))));

        catalog.playlist_add(&test_track("a", "1")).unwrap();
        catalog.play(0).unwrap();
        let status = catalog.status().unwrap();
        assert_eq!(status.state, PlayState::Playing);
        assert_eq!(status.song, Some(0));
        assert_eq!(catalog.playlist().unwrap().len(), 1);
    }
}
