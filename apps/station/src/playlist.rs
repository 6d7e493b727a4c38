//! Thin content layer: directory rotation and play history.
//!
//! The core engine only consumes segment intents; this module supplies
//! them by rotating through a music directory in name order, topping the
//! queue up whenever a segment enters its prep window. It also keeps the
//! play history document the pre-shutdown hook persists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use ridgecast_core::{AudioEvent, SegmentEvent, SegmentScheduler};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// How many intents to keep queued ahead of playback.
const QUEUE_TARGET: usize = 2;

/// Rotates through a directory of MP3 files in name order.
pub struct Playlist {
    tracks: Vec<PathBuf>,
    next_index: usize,
}

impl Playlist {
    /// Scans `dir` for MP3 files.
    ///
    /// An empty or unreadable directory is a startup error; the station
    /// has nothing to play.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut tracks: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read music dir {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
            })
            .collect();
        tracks.sort();

        if tracks.is_empty() {
            bail!("No MP3 files in {}", dir.display());
        }
        log::info!("[Playlist] {} tracks from {}", tracks.len(), dir.display());
        Ok(Self {
            tracks,
            next_index: 0,
        })
    }

    /// The next track in rotation.
    pub fn next_track(&mut self) -> PathBuf {
        let track = self.tracks[self.next_index].clone();
        self.next_index = (self.next_index + 1) % self.tracks.len();
        track
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// One finished (or failed) segment in the history document.
#[derive(Debug, Serialize, Deserialize)]
pub struct PlayLogEntry {
    pub path: PathBuf,
    pub ended_at_unix: u64,
    pub bytes_emitted: u64,
    pub completed: bool,
}

/// Play history and counts, persisted across restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PlayLog {
    pub entries: Vec<PlayLogEntry>,
    pub play_counts: HashMap<String, u64>,
}

impl PlayLog {
    /// Loads an existing document; missing or corrupt files start fresh.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Saves atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("json.tmp");
        let contents = serde_json::to_string_pretty(self)?;

        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, path)
    }

    fn record(&mut self, path: PathBuf, bytes_emitted: u64, completed: bool) {
        let key = path.to_string_lossy().into_owned();
        *self.play_counts.entry(key).or_insert(0) += 1;
        self.entries.push(PlayLogEntry {
            path,
            ended_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            bytes_emitted,
            completed,
        });
    }
}

/// Keeps the scheduler's queue topped up and the play log current.
///
/// Runs until cancelled; reacts to prep windows rather than polling.
pub async fn run_feeder(
    scheduler: Arc<SegmentScheduler>,
    mut playlist: Playlist,
    playlog: Arc<Mutex<PlayLog>>,
    cancel: CancellationToken,
) {
    let mut events = scheduler.subscribe();

    // Seed the queue so playback starts immediately
    while scheduler.queue_len() < QUEUE_TARGET {
        let track = playlist.next_track();
        if !scheduler.enqueue(AudioEvent::song(track)) {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(SegmentEvent::Prep { .. }) => {
                    top_up(&scheduler, &mut playlist);
                }
                Ok(SegmentEvent::Finished { path, bytes_emitted }) => {
                    playlog.lock().record(path, bytes_emitted, true);
                }
                Ok(SegmentEvent::Failed { path, .. }) => {
                    playlog.lock().record(path, 0, false);
                    // A failed segment consumed an intent without a prep
                    // window; refill so the rotation keeps moving
                    top_up(&scheduler, &mut playlist);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    top_up(&scheduler, &mut playlist);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    log::debug!("[Playlist] feeder stopped");
}

fn top_up(scheduler: &Arc<SegmentScheduler>, playlist: &mut Playlist) {
    while scheduler.is_accepting() && scheduler.queue_len() < QUEUE_TARGET {
        let track = playlist.next_track();
        if !scheduler.enqueue(AudioEvent::song(track)) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_music_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"not really mp3").unwrap();
        }
        dir
    }

    #[test]
    fn scan_finds_only_mp3s_in_name_order() {
        let dir = make_music_dir(&["b.mp3", "a.mp3", "notes.txt", "c.MP3"]);
        let mut playlist = Playlist::scan(dir.path()).unwrap();
        assert!(!playlist.is_empty());
        assert_eq!(playlist.len(), 3);

        let first = playlist.next_track();
        assert_eq!(first.file_name().unwrap(), "a.mp3");
    }

    #[test]
    fn rotation_wraps_around() {
        let dir = make_music_dir(&["a.mp3", "b.mp3"]);
        let mut playlist = Playlist::scan(dir.path()).unwrap();

        let names: Vec<_> = (0..5)
            .map(|_| playlist.next_track().file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names[0], names[2]);
        assert_eq!(names[0], names[4]);
        assert_ne!(names[0], names[1]);
    }

    #[test]
    fn empty_dir_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Playlist::scan(dir.path()).is_err());
    }

    #[test]
    fn playlog_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlog.json");

        let mut log = PlayLog::default();
        log.record(PathBuf::from("/music/a.mp3"), 9216, true);
        log.record(PathBuf::from("/music/a.mp3"), 4608, true);
        log.save(&path).unwrap();

        let loaded = PlayLog::load(&path);
        assert_eq!(loaded.entries.len(), 2);
        assert_eq!(loaded.play_counts.get("/music/a.mp3"), Some(&2));
        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_playlog_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlog.json");
        std::fs::write(&path, "{not json").unwrap();
        let log = PlayLog::load(&path);
        assert!(log.entries.is_empty());
    }
}
