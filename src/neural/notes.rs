// projeto: genretrain
// file: src/neural/notes.rs
// Notes, tracks and songs read from MIDI or JSON files

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;

use log::{debug, info, warn};
use midly::{MidiMessage, Smf, TrackEventKind};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::neural::utils::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub tick: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub notes: Vec<Note>,
}

impl Track {
    pub fn new(notes: Vec<Note>) -> Self {
        Track { notes }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn first_tick(&self) -> Option<u64> {
        self.notes.first().map(|n| n.tick)
    }

    /// Chronological order, ties broken by pitch.
    pub fn sort(&mut self) {
        self.notes.sort_by_key(|n| (n.tick, n.pitch));
    }

    /// Notes starting at or after `tick`. Expects sorted notes.
    pub fn notes_from(&self, tick: u64) -> &[Note] {
        let start = self.notes.partition_point(|n| n.tick < tick);
        &self.notes[start..]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub name: String,
    pub tracks: Vec<Track>,
}

impl Song {
    pub fn n_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Orders notes by tick inside every track, then puts the track whose
    /// first note starts latest in front.
    pub fn sort_by_tick(&mut self) {
        for track in &mut self.tracks {
            track.sort();
        }
        self.tracks
            .sort_by(|a, b| b.first_tick().unwrap_or(0).cmp(&a.first_tick().unwrap_or(0)));
    }

    /// First tick of the leading track; only meaningful after `sort_by_tick`.
    pub fn start_tick(&self) -> u64 {
        self.tracks.first().and_then(Track::first_tick).unwrap_or(0)
    }

    pub fn from_midi_bytes(name: &str, bytes: &[u8]) -> Result<Song, TrainingError> {
        let smf = Smf::parse(bytes)?;
        let mut tracks = Vec::new();

        for events in &smf.tracks {
            let mut tick: u64 = 0;
            let mut pending: HashMap<(u8, u8), VecDeque<(u64, u8)>> = HashMap::new();
            let mut notes = Vec::new();

            for event in events {
                tick += u64::from(event.delta.as_int());
                let TrackEventKind::Midi { channel, message } = event.kind else {
                    continue;
                };
                match message {
                    MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                        pending
                            .entry((channel.as_int(), key.as_int()))
                            .or_default()
                            .push_back((tick, key.as_int()));
                    }
                    MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                        if let Some((start, pitch)) = pending
                            .get_mut(&(channel.as_int(), key.as_int()))
                            .and_then(VecDeque::pop_front)
                        {
                            notes.push(Note {
                                pitch,
                                tick: start,
                                duration: tick - start,
                            });
                        }
                    }
                    _ => {}
                }
            }

            let dangling: usize = pending.values().map(VecDeque::len).sum();
            if dangling > 0 {
                debug!("{}: {} notes never released", name, dangling);
            }

            if !notes.is_empty() {
                let mut track = Track::new(notes);
                track.sort();
                tracks.push(track);
            }
        }

        Ok(Song {
            name: name.to_string(),
            tracks,
        })
    }

    /// Loads a `.mid`/`.midi` or `.json` song. Notes come back sorted in every track.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Song, TrainingError> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "mid" | "midi" => Song::from_midi_bytes(&name, &fs::read(path)?),
            "json" => {
                let mut song: Song = serde_json::from_str(&fs::read_to_string(path)?)?;
                song.tracks.retain(|t| !t.is_empty());
                for track in &mut song.tracks {
                    track.sort();
                }
                if song.name.is_empty() {
                    song.name = name;
                }
                Ok(song)
            }
            other => Err(TrainingError::DataProcessing(format!(
                "unsupported song format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }
}

fn is_song_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| e == "mid" || e == "midi" || e == "json")
}

#[derive(Debug, Clone, Default)]
pub struct LabeledSongs {
    pub songs: Vec<Song>,
    pub labels: Vec<usize>,
}

impl LabeledSongs {
    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }
}

/// Every song file under `path` (or `path` itself when it is a file), in file
/// name order. Unreadable files are skipped with a warning.
pub fn load_songs<P: AsRef<Path>>(path: P) -> Result<Vec<Song>, TrainingError> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![Song::load(path)?]);
    }

    let mut songs = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() || !is_song_file(entry.path()) {
            continue;
        }
        match Song::load(entry.path()) {
            Ok(song) => songs.push(song),
            Err(e) => warn!("⚠️ Skipping {}: {}", entry.path().display(), e),
        }
    }
    info!("🎵 {}: {} songs", path.display(), songs.len());
    Ok(songs)
}

/// Reads `<corpus>/<split>/<class>/*` for every class, labelled by class order.
/// Files that fail to parse are skipped with a warning.
pub fn load_split<P: AsRef<Path>>(
    corpus: P,
    split: &str,
    classes: &[String],
) -> Result<LabeledSongs, TrainingError> {
    let base = corpus.as_ref().join(split);
    let mut loaded = LabeledSongs::default();

    for (label, class) in classes.iter().enumerate() {
        let dir = base.join(class);
        if !dir.is_dir() {
            return Err(TrainingError::DataProcessing(format!(
                "class directory {} not found",
                dir.display()
            )));
        }

        let mut count = 0;
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() || !is_song_file(entry.path()) {
                continue;
            }
            match Song::load(entry.path()) {
                Ok(song) => {
                    loaded.songs.push(song);
                    loaded.labels.push(label);
                    count += 1;
                }
                Err(e) => warn!("⚠️ Skipping {}: {}", entry.path().display(), e),
            }
        }
        info!("🎵 {}/{}: {} songs", split, class, count);
    }

    Ok(loaded)
}
