//! Core row model for the song-play warehouse.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "playlog-core";

/// Page value marking a log row as a song play.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// Catalog entry as stored in `songs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub song_id: String,
    pub title: String,
    pub artist_id: String,
    pub year: Option<i32>,
    pub duration: f64,
}

/// Owning entity of a song as stored in `artists`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub artist_id: String,
    pub name: String,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// One parsed song file: exactly one song and its artist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogUnit {
    pub song: Song,
    pub artist: Artist,
}

/// Listener profile as stored in `users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: i32,
    pub first_name: String,
    pub last_name: String,
    pub gender: String,
    pub level: String,
}

/// Calendar decomposition of a play timestamp, interpreted as UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBucket {
    pub start_time: NaiveDateTime,
    pub hour: i32,
    pub day: i32,
    /// ISO-8601 week number.
    pub week: i32,
    pub month: i32,
    pub year: i32,
    /// Monday is 0, Sunday is 6.
    pub weekday: i32,
}

impl TimeBucket {
    /// Returns `None` when `millis` lies outside the representable range.
    pub fn from_epoch_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(|dt| Self::from_start_time(dt.naive_utc()))
    }

    pub fn from_start_time(start_time: NaiveDateTime) -> Self {
        Self {
            start_time,
            hour: start_time.hour() as i32,
            day: start_time.day() as i32,
            week: start_time.iso_week().week() as i32,
            month: start_time.month() as i32,
            year: start_time.year(),
            weekday: start_time.weekday().num_days_from_monday() as i32,
        }
    }

    pub fn epoch_millis(&self) -> i64 {
        self.start_time.and_utc().timestamp_millis()
    }
}

/// Natural key an event uses to reference a catalog entry.
///
/// Equality is exact on all three parts; `duration` compares bit-for-bit so the
/// key can live in hash maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceKey {
    pub title: String,
    pub artist_name: String,
    pub duration: f64,
}

impl ReferenceKey {
    pub fn new(title: impl Into<String>, artist_name: impl Into<String>, duration: f64) -> Self {
        Self {
            title: title.into(),
            artist_name: artist_name.into(),
            duration,
        }
    }

    pub fn matches(&self, song: &Song, artist: &Artist) -> bool {
        song.artist_id == artist.artist_id
            && song.title == self.title
            && artist.name == self.artist_name
            && song.duration == self.duration
    }
}

impl PartialEq for ReferenceKey {
    fn eq(&self, other: &Self) -> bool {
        self.title == other.title
            && self.artist_name == other.artist_name
            && self.duration.to_bits() == other.duration.to_bits()
    }
}

impl Eq for ReferenceKey {}

impl Hash for ReferenceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.title.hash(state);
        self.artist_name.hash(state);
        self.duration.to_bits().hash(state);
    }
}

/// Surrogate identifiers a resolved reference points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SongRef {
    pub song_id: String,
    pub artist_id: String,
}

/// A `NextSong` log row before reference resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayEvent {
    pub ts: i64,
    pub time: TimeBucket,
    pub user: User,
    pub reference: ReferenceKey,
    pub session_id: i32,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

/// Parsed log file: the retained song plays plus how many rows were filtered out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<PlayEvent>,
    pub discarded_rows: usize,
}

impl EventBatch {
    /// Distinct reference keys in first-seen order.
    pub fn reference_keys(&self) -> Vec<ReferenceKey> {
        let mut seen = std::collections::HashSet::new();
        self.events
            .iter()
            .filter(|e| seen.insert(&e.reference))
            .map(|e| e.reference.clone())
            .collect()
    }
}

/// Song play row in the shape of `songplays_temp`: `ts` is still epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedSongPlay {
    pub ts: i64,
    pub user_id: i32,
    pub level: String,
    pub song_id: String,
    pub artist_id: String,
    pub session_id: i32,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}

/// Rows one log unit contributes to the staging area.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub time_buckets: Vec<TimeBucket>,
    pub users: Vec<User>,
    pub song_plays: Vec<StagedSongPlay>,
}

impl StagedBatch {
    pub fn is_empty(&self) -> bool {
        self.time_buckets.is_empty() && self.users.is_empty() && self.song_plays.is_empty()
    }
}

/// Permanent `songplays` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongPlay {
    pub songplay_id: i64,
    pub start_time: NaiveDateTime,
    pub user_id: i32,
    pub level: String,
    pub song_id: String,
    pub artist_id: String,
    pub session_id: i32,
    pub location: Option<String>,
    pub user_agent: Option<String>,
}
