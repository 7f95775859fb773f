// projeto: genretrain
// file: src/neural/windowing.rs
// Turns songs into fixed-size (tracks x notes x 3) windows for the conv+LSTM model

use log::{debug, info, warn};
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};

use crate::neural::notes::{Note, Song, Track};
use crate::neural::utils::TrainingError;

/// Values per note in a window: pitch, tick, duration.
pub const NOTE_FEATURES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// `n_tracks` tracks aligned on the latest-starting track.
    #[default]
    FirstTracks,
    /// `max_tracks` aligned slots, missing tracks filled with a placeholder.
    AllTracks,
    /// Several consecutive unaligned windows per song.
    Augmented,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub policy: WindowPolicy,
    pub n_tracks: usize,
    pub n_notes: usize,
    pub max_tracks: usize,
    pub max_windows: usize,
    pub placeholder: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            policy: WindowPolicy::FirstTracks,
            n_tracks: 3,
            n_notes: 64,
            max_tracks: 16,
            max_windows: 2,
            placeholder: -1.0,
        }
    }
}

impl WindowConfig {
    /// Number of track rows in every produced window.
    pub fn tracks_per_window(&self) -> usize {
        match self.policy {
            WindowPolicy::AllTracks => self.max_tracks,
            WindowPolicy::FirstTracks | WindowPolicy::Augmented => self.n_tracks,
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.n_tracks == 0 || self.n_notes == 0 {
            return Err(TrainingError::ModelConfiguration(
                "window needs at least one track and one note".to_string(),
            ));
        }
        if self.policy == WindowPolicy::AllTracks && self.max_tracks < self.n_tracks {
            return Err(TrainingError::ModelConfiguration(format!(
                "max_tracks ({}) smaller than n_tracks ({})",
                self.max_tracks, self.n_tracks
            )));
        }
        if self.policy == WindowPolicy::Augmented && self.max_windows == 0 {
            return Err(TrainingError::ModelConfiguration(
                "augmented windowing needs max_windows >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Windows in a `(samples, tracks, notes, 3)` tensor with one label each.
#[derive(Debug, Clone)]
pub struct SequenceSet {
    pub x: Array4<f64>,
    pub labels: Vec<usize>,
    /// Index of the source song for every window.
    pub song_indices: Vec<usize>,
    pub placeholder_tracks: usize,
}

impl SequenceSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `[tracks, notes, 3]` of a single sample.
    pub fn sample_shape(&self) -> [usize; 3] {
        let (_, t, n, f) = self.x.dim();
        [t, n, f]
    }
}

fn fill_track(window: &mut Array3<f64>, slot: usize, notes: &[Note]) {
    for (i, note) in notes.iter().enumerate() {
        window[[slot, i, 0]] = f64::from(note.pitch);
        window[[slot, i, 1]] = note.tick as f64;
        window[[slot, i, 2]] = note.duration as f64;
    }
}

/// First `n_notes` notes at or after `start`, if the track qualifies.
fn aligned_notes(track: &Track, start: u64, n_notes: usize) -> Option<&[Note]> {
    if track.len() <= n_notes {
        return None;
    }
    let aligned = track.notes_from(start);
    (aligned.len() >= n_notes).then(|| &aligned[..n_notes])
}

fn first_tracks(song: &Song, cfg: &WindowConfig) -> Option<Array3<f64>> {
    let start = song.start_tick();
    let selected: Vec<&[Note]> = song
        .tracks
        .iter()
        .filter_map(|t| aligned_notes(t, start, cfg.n_notes))
        .take(cfg.n_tracks)
        .collect();
    if selected.len() < cfg.n_tracks {
        return None;
    }

    let mut window = Array3::zeros((cfg.n_tracks, cfg.n_notes, NOTE_FEATURES));
    for (slot, notes) in selected.into_iter().enumerate() {
        fill_track(&mut window, slot, notes);
    }
    Some(window)
}

fn all_tracks(song: &Song, cfg: &WindowConfig) -> (Array3<f64>, usize) {
    let start = song.start_tick();
    let mut window = Array3::from_elem((cfg.max_tracks, cfg.n_notes, NOTE_FEATURES), cfg.placeholder);
    let mut placeholders = 0;
    for slot in 0..cfg.max_tracks {
        match song.tracks.get(slot).and_then(|t| aligned_notes(t, start, cfg.n_notes)) {
            Some(notes) => fill_track(&mut window, slot, notes),
            None => placeholders += 1,
        }
    }
    (window, placeholders)
}

fn augmented(song: &Song, cfg: &WindowConfig) -> Vec<Array3<f64>> {
    let selected: Vec<&Track> = song
        .tracks
        .iter()
        .filter(|t| t.len() > cfg.n_notes)
        .take(cfg.n_tracks)
        .collect();
    if selected.len() < cfg.n_tracks {
        return Vec::new();
    }

    let mut windows = Vec::new();
    for w in 0..cfg.max_windows {
        let end = (w + 1) * cfg.n_notes;
        if w > 0 && !selected.iter().all(|t| t.len() > end) {
            break;
        }
        let mut window = Array3::zeros((cfg.n_tracks, cfg.n_notes, NOTE_FEATURES));
        for (slot, track) in selected.iter().enumerate() {
            fill_track(&mut window, slot, &track.notes[w * cfg.n_notes..end]);
        }
        windows.push(window);
    }
    windows
}

/// Builds the windows for every song according to `cfg.policy`.
///
/// Songs with fewer than `n_tracks` tracks, or without enough qualifying
/// tracks, are discarded.
pub fn window_songs(songs: &mut [Song], labels: &[usize], cfg: &WindowConfig) -> Result<SequenceSet, TrainingError> {
    cfg.validate()?;
    if songs.len() != labels.len() {
        return Err(TrainingError::Shape(format!(
            "{} songs but {} labels",
            songs.len(),
            labels.len()
        )));
    }

    let mut windows = Vec::new();
    let mut out_labels = Vec::new();
    let mut song_indices = Vec::new();
    let mut placeholder_tracks = 0;

    for (index, (song, &label)) in songs.iter_mut().zip(labels).enumerate() {
        if song.n_tracks() < cfg.n_tracks {
            debug!("{}: only {} tracks, discarded", song.name, song.n_tracks());
            continue;
        }

        let produced: Vec<Array3<f64>> = match cfg.policy {
            WindowPolicy::FirstTracks => {
                song.sort_by_tick();
                first_tracks(song, cfg).into_iter().collect()
            }
            WindowPolicy::AllTracks => {
                song.sort_by_tick();
                let (window, placeholders) = all_tracks(song, cfg);
                placeholder_tracks += placeholders;
                vec![window]
            }
            WindowPolicy::Augmented => augmented(song, cfg),
        };

        if produced.is_empty() {
            debug!("{}: not enough qualifying tracks, discarded", song.name);
        }
        for window in produced {
            windows.push(window);
            out_labels.push(label);
            song_indices.push(index);
        }
    }

    if placeholder_tracks > 0 {
        warn!("⚠️ {} track slots filled with placeholder {}", placeholder_tracks, cfg.placeholder);
    }

    let shape = (
        windows.len(),
        cfg.tracks_per_window(),
        cfg.n_notes,
        NOTE_FEATURES,
    );
    let x = if windows.is_empty() {
        Array4::zeros(shape)
    } else {
        let views: Vec<_> = windows.iter().map(|w| w.view()).collect();
        ndarray::stack(Axis(0), &views)?
    };

    info!(
        "🪟 {} windows from {} songs ({:?})",
        out_labels.len(),
        songs.len(),
        cfg.policy
    );

    Ok(SequenceSet {
        x,
        labels: out_labels,
        song_indices,
        placeholder_tracks,
    })
}
