use log::{debug, info};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::game::session::{LANE_COUNT, Note};

/// Silence kept after the last note when a song's length comes from its chart.
pub const NOTE_TAIL_MS: f64 = 1_500.0;
/// Shortest excerpt worth playing.
pub const MIN_EXCERPT_MS: f64 = 5_000.0;
const DEFAULT_BPM: f64 = 120.0;
// Per-beat chance that the procedural chart places a note.
const PROCEDURAL_DENSITY: f64 = 0.7;
// Per-beat chance of an extra off-beat note.
const PROCEDURAL_OFFBEAT: f64 = 0.2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineNote {
    pub time_ms: f64,
    pub lane: usize,
    #[serde(default)]
    pub pitch: Option<u8>,
    #[serde(default)]
    pub velocity: Option<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Excerpt {
    pub start_ms: f64,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongEntry {
    pub title: String,
    /// Pre-rendered audio asset, if any.
    #[serde(default)]
    pub filename: Option<String>,
    pub duration_ms: f64,
    #[serde(default = "default_bpm")]
    pub bpm: f64,
    #[serde(default)]
    pub excerpt: Option<Excerpt>,
    /// Symbolic note timeline in song time.
    #[serde(default)]
    pub timeline: Vec<TimelineNote>,
    #[serde(default)]
    pub seed: Option<u64>,
}

const fn default_bpm() -> f64 {
    DEFAULT_BPM
}

/// What the procedural generator needs to know about a song.
#[derive(Clone, Debug, PartialEq)]
pub struct SongMeta {
    pub title: String,
    pub bpm: f64,
    pub duration_ms: f64,
}

impl SongEntry {
    pub fn meta(&self, duration_ms: f64) -> SongMeta {
        SongMeta {
            title: self.title.clone(),
            bpm: self.bpm,
            duration_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExcerptWindow {
    pub start_ms: f64,
    pub duration_ms: f64,
}

impl ExcerptWindow {
    #[inline(always)]
    pub fn end_ms(&self) -> f64 {
        self.start_ms + self.duration_ms
    }
}

/// Clamps the song's requested excerpt into `available_ms` of audio.
pub fn resolve_excerpt(song: &SongEntry, available_ms: f64) -> ExcerptWindow {
    let available = available_ms.max(0.0);
    let latest_start = (available - MIN_EXCERPT_MS).max(0.0);
    let start = song
        .excerpt
        .map_or(0.0, |e| e.start_ms)
        .clamp(0.0, latest_start);
    let requested = song
        .excerpt
        .and_then(|e| e.duration_ms)
        .unwrap_or(song.duration_ms);
    let duration = requested.min(available - start).max(0.0);
    ExcerptWindow {
        start_ms: start,
        duration_ms: duration,
    }
}

/// Timeline notes inside `window`, shifted to window-relative time and sorted.
pub fn chart_notes(song: &SongEntry, window: ExcerptWindow) -> Vec<Note> {
    let mut notes: Vec<Note> = song
        .timeline
        .iter()
        .filter(|n| n.lane < LANE_COUNT && n.time_ms.is_finite())
        .filter(|n| n.time_ms >= window.start_ms && n.time_ms < window.end_ms())
        .map(|n| Note {
            original_pitch: n.pitch,
            velocity: n.velocity,
            ..Note::new(n.time_ms - window.start_ms, n.lane)
        })
        .collect();
    notes.sort_by(|a, b| a.time.total_cmp(&b.time));
    notes
}

/// Beat-grid chart for songs without a usable timeline.
pub fn generate_procedural_notes(meta: &SongMeta, rng: &mut StdRng) -> Vec<Note> {
    let bpm = if meta.bpm.is_finite() && meta.bpm > 0.0 { meta.bpm } else { DEFAULT_BPM };
    let beat_ms = 60_000.0 / bpm;
    let end = meta.duration_ms - NOTE_TAIL_MS;
    let mut notes = Vec::new();
    let mut beat = 1u32;
    loop {
        let t = f64::from(beat) * beat_ms;
        if t >= end {
            break;
        }
        if rng.random_bool(PROCEDURAL_DENSITY) {
            notes.push(Note::new(t, rng.random_range(0..LANE_COUNT)));
        }
        let off = t + beat_ms / 2.0;
        if off < end && rng.random_bool(PROCEDURAL_OFFBEAT) {
            notes.push(Note::new(off, rng.random_range(0..LANE_COUNT)));
        }
        beat += 1;
    }
    debug!("Generated {} procedural notes for '{}'", notes.len(), meta.title);
    notes
}

/// Song length implied by a chart: last note plus tail, never shorter than `floor_ms`.
pub fn chart_duration_ms(notes: &[Note], floor_ms: f64) -> f64 {
    notes
        .last()
        .map_or(0.0, |n| n.time + NOTE_TAIL_MS)
        .max(floor_ms)
}

#[derive(Debug, Deserialize)]
struct SetlistFile {
    songs: Vec<SongEntry>,
}

pub fn load_setlist<P: AsRef<Path>>(path: P) -> Result<Vec<SongEntry>, String> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read setlist {}: {e}", path.display()))?;
    let file: SetlistFile = serde_json::from_str(&text)
        .map_err(|e| format!("Failed to parse setlist {}: {e}", path.display()))?;
    if file.songs.is_empty() {
        return Err(format!("Setlist {} has no songs", path.display()));
    }
    info!("Loaded setlist with {} songs from {}", file.songs.len(), path.display());
    Ok(file.songs)
}

/// Built-in setlist used when none is configured: one song with a rendered
/// asset, one with only a symbolic timeline, one that has to be generated.
pub fn demo_setlist() -> Vec<SongEntry> {
    let beat = 60_000.0 / 140.0;
    let timeline = (1..40u32)
        .map(|i| TimelineNote {
            time_ms: f64::from(i) * beat,
            lane: (i as usize * 7) % LANE_COUNT,
            pitch: Some(40 + (i % 12) as u8),
            velocity: Some(100),
        })
        .collect::<Vec<_>>();
    vec![
        SongEntry {
            title: "Opening Riot".into(),
            filename: Some("opening_riot.ogg".into()),
            duration_ms: 20_000.0,
            bpm: 140.0,
            excerpt: Some(Excerpt { start_ms: 2_000.0, duration_ms: Some(16_000.0) }),
            timeline: timeline.clone(),
            seed: None,
        },
        SongEntry {
            title: "Basement Echo".into(),
            filename: Some("missing_master.ogg".into()),
            duration_ms: 18_000.0,
            bpm: 140.0,
            excerpt: None,
            timeline,
            seed: None,
        },
        SongEntry {
            title: "Feedback Loop".into(),
            filename: None,
            duration_ms: 15_000.0,
            bpm: 128.0,
            excerpt: None,
            timeline: Vec::new(),
            seed: Some(7),
        },
    ]
}
