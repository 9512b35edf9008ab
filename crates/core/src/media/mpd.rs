//! Thin client for the music player daemon's text protocol.
//!
//! One connection per query, like the daemon's own tooling does it: read
//! the greeting, send a command line, collect `key: value` lines until
//! the terminating `OK` (or a rejecting `ACK`).

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Catalog, CatalogError, PlayState, PlaybackStatus, Track, TrackHash};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MpdCatalog {
    socket: PathBuf,
}

impl MpdCatalog {
    pub fn new(socket: impl AsRef<Path>) -> Self {
        MpdCatalog {
            socket: socket.as_ref().to_owned(),
        }
    }

    /// Runs one command and returns the response's `key: value` pairs.
    fn query(&self, command: &str) -> Result<Vec<(String, String)>, CatalogError> {
        let stream = UnixStream::connect(&self.socket)?;
        stream.set_read_timeout(Some(QUERY_TIMEOUT))?;
        stream.set_write_timeout(Some(QUERY_TIMEOUT))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut greeting = String::new();
        reader.read_line(&mut greeting)?;

        let mut writer = stream;
        writer.write_all(command.as_bytes())?;
        writer.write_all(b"\n")?;

        let mut pairs = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Err(CatalogError::Rejected("daemon closed mid-response".into()));
            }
            let line = line.trim_end_matches('\n');
            if line == "OK" {
                return Ok(pairs);
            }
            if let Some(reason) = line.strip_prefix("ACK") {
                return Err(CatalogError::Rejected(reason.trim().to_owned()));
            }
            if let Some((key, value)) = line.split_once(": ") {
                pairs.push((key.to_owned(), value.to_owned()));
            }
        }
    }

    fn all_tracks(&self) -> Result<Vec<Track>, CatalogError> {
        Ok(tracks_from(&self.query("listallinfo")?))
    }
}

/// Splits a flat response into per-file records and keeps the playable
/// ones. A record starts at each `file` key, mirroring the daemon's
/// listing format.
fn tracks_from(pairs: &[(String, String)]) -> Vec<Track> {
    let mut tracks = Vec::new();
    let mut current: Option<Track> = None;
    for (key, value) in pairs {
        match key.as_str() {
            "file" => {
                tracks.extend(current.take());
                current = Some(Track {
                    artist: String::new(),
                    title: String::new(),
                    album: String::new(),
                    duration_secs: 0,
                    path: value.clone(),
                });
            }
            "Artist" => {
                if let Some(track) = current.as_mut() {
                    track.artist = value.clone();
                }
            }
            "Title" => {
                if let Some(track) = current.as_mut() {
                    track.title = value.clone();
                }
            }
            "Album" => {
                if let Some(track) = current.as_mut() {
                    track.album = value.clone();
                }
            }
            "Time" => {
                if let Some(track) = current.as_mut() {
                    track.duration_secs = value.parse().unwrap_or(0);
                }
            }
            _ => {}
        }
    }
    tracks.extend(current.take());
    tracks
}

fn quoted(path: &str) -> String {
    format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
}

impl Catalog for MpdCatalog {
    fn hashes(&self) -> HashSet<TrackHash> {
        match self.all_tracks() {
            Ok(tracks) => tracks.iter().map(Track::hash).collect(),
            Err(error) => {
                tracing::warn!(%error, "cannot list the local catalog");
                HashSet::new()
            }
        }
    }

    fn lookup(&self, hash: TrackHash) -> Option<Track> {
        match self.all_tracks() {
            Ok(tracks) => tracks.into_iter().find(|t| t.hash() == hash),
            Err(error) => {
                tracing::warn!(%error, "cannot list the local catalog");
                None
            }
        }
    }

    fn status(&self) -> Result<PlaybackStatus, CatalogError> {
        let pairs = self.query("status")?;
        let mut state = PlayState::Stopped;
        let mut song = None;
        for (key, value) in &pairs {
            match key.as_str() {
                "state" => {
                    state = match value.as_str() {
                        "play" => PlayState::Playing,
                        "pause" => PlayState::Paused,
                        _ => PlayState::Stopped,
                    }
                }
                "song" => song = value.parse().ok(),
                _ => {}
            }
        }
        Ok(PlaybackStatus { state, song })
    }

    fn play(&self, index: usize) -> Result<(), CatalogError> {
        self.query(&format!("play {index}")).map(|_| ())
    }

    fn playlist_add(&self, track: &Track) -> Result<(), CatalogError> {
        self.query(&format!("add {}", quoted(&track.path)))
            .map(|_| ())
    }

    fn playlist(&self) -> Result<Vec<Track>, CatalogError> {
        Ok(tracks_from(&self.query("playlistinfo")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: &str, value: &str) -> (String, String) {
        (key.to_owned(), value.to_owned())
    }

    #[test]
    fn splits_listing_responses_into_tracks() {
        let pairs = vec![
            pair("file", "a/one.flac"),
            pair("Artist", "a"),
            pair("Title", "one"),
            pair("Album", "first"),
            pair("Time", "181"),
            pair("file", "b/two.flac"),
            pair("Title", "two"),
        ];
        let tracks = tracks_from(&pairs);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].artist, "a");
        assert_eq!(tracks[0].duration_secs, 181);
        assert_eq!(tracks[1].path, "b/two.flac");
        assert_eq!(tracks[1].artist, "");
    }

    #[test]
    fn quotes_awkward_paths() {
        assert_eq!(quoted("plain.flac"), "\"plain.flac\"");
        assert_eq!(quoted("odd \"name\".flac"), "\"odd \\\"name\\\".flac\"");
    }

    #[test]
    fn queries_over_a_scripted_socket() {
        use std::io::Read;
        use std::os::unix::net::UnixListener;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("socket");
        let listener = UnixListener::bind(&path).unwrap();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"OK MPD 0.24.0\n").unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut command = String::new();
            reader.read_line(&mut command).unwrap();
            assert_eq!(command, "status\n");
            stream
                .write_all(b"state: play\nsong: 2\nOK\n")
                .unwrap();
            let mut rest = String::new();
            let _ = reader.read_to_string(&mut rest);
        });

        let catalog = MpdCatalog::new(&path);
        let status = catalog.status().unwrap();
        assert_eq!(status.state, PlayState::Playing);
        assert_eq!(status.song, Some(2));
        server.join().unwrap();
    }
}
