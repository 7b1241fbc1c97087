//! Source unit parsers: song files and event log files into typed rows.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use playlog_core::{
    Artist, CatalogUnit, EventBatch, PlayEvent, ReferenceKey, Song, TimeBucket, User,
    NEXT_SONG_PAGE,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "playlog-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Song,
    Log,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Song => f.write_str("song"),
            UnitKind::Log => f.write_str("log"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}:{line}: invalid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}:{line}: missing required field `{field}`", .path.display())]
    MissingField {
        path: PathBuf,
        line: usize,
        field: &'static str,
    },
    #[error("{}:{line}: invalid value for `{field}`: {value}", .path.display())]
    InvalidField {
        path: PathBuf,
        line: usize,
        field: &'static str,
        value: String,
    },
    #[error("{}:{line}: timestamp {ts} is out of range", .path.display())]
    InvalidTimestamp { path: PathBuf, line: usize, ts: i64 },
    #[error("{}: no records found", .path.display())]
    EmptyUnit { path: PathBuf },
}

impl ParseError {
    pub fn path(&self) -> &Path {
        match self {
            ParseError::Io { path, .. }
            | ParseError::Json { path, .. }
            | ParseError::MissingField { path, .. }
            | ParseError::InvalidField { path, .. }
            | ParseError::InvalidTimestamp { path, .. }
            | ParseError::EmptyUnit { path } => path,
        }
    }
}

/// Turns the text of one source unit into typed rows.
pub trait SourceParser: Send + Sync {
    type Output;

    fn kind(&self) -> UnitKind;

    /// `path` is only used to label errors.
    fn parse_str(&self, path: &Path, text: &str) -> Result<Self::Output, ParseError>;

    fn parse_file(&self, path: &Path) -> Result<Self::Output, ParseError> {
        let text = fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_str(path, &text)
    }
}

/// Song file fields; accepts the documented names and the raw dataset names.
#[derive(Debug, Clone, Deserialize)]
struct RawSongRecord {
    #[serde(default, alias = "song_id")]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, rename = "creatorId", alias = "artist_id")]
    creator_id: Option<String>,
    #[serde(default, rename = "creatorName", alias = "artist_name")]
    creator_name: Option<String>,
    #[serde(default, rename = "creatorLocation", alias = "artist_location")]
    creator_location: Option<String>,
    #[serde(default, rename = "creatorLatitude", alias = "artist_latitude")]
    creator_latitude: Option<f64>,
    #[serde(default, rename = "creatorLongitude", alias = "artist_longitude")]
    creator_longitude: Option<f64>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLogRecord {
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    page: Option<String>,
    #[serde(default)]
    user_id: Option<JsonValue>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    gender: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    song: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    length: Option<f64>,
    #[serde(default)]
    session_id: Option<JsonValue>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    user_agent: Option<String>,
}

/// Parses a song file into exactly one song and artist.
#[derive(Debug, Default, Clone, Copy)]
pub struct SongFileParser;

impl SourceParser for SongFileParser {
    type Output = CatalogUnit;

    fn kind(&self) -> UnitKind {
        UnitKind::Song
    }

    fn parse_str(&self, path: &Path, text: &str) -> Result<CatalogUnit, ParseError> {
        let mut records = json_lines::<RawSongRecord>(path, text);
        let (line, raw) = records
            .next()
            .ok_or_else(|| ParseError::EmptyUnit {
                path: path.to_path_buf(),
            })??;

        let extra = records.count();
        if extra > 0 {
            warn!(
                path = %path.display(),
                extra,
                "song file holds more than one record; using the first"
            );
        }

        let ctx = RowContext { path, line };
        let song = Song {
            song_id: ctx.require("id", raw.id)?,
            title: ctx.require("title", raw.title)?,
            artist_id: ctx.require("creatorId", raw.creator_id.clone())?,
            year: raw.year,
            duration: ctx.require("duration", raw.duration)?,
        };
        let artist = Artist {
            artist_id: ctx.require("creatorId", raw.creator_id)?,
            name: ctx.require("creatorName", raw.creator_name)?,
            location: raw.creator_location,
            latitude: raw.creator_latitude,
            longitude: raw.creator_longitude,
        };
        Ok(CatalogUnit { song, artist })
    }
}

/// Parses an event log file, keeping only `NextSong` rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFileParser;

impl SourceParser for LogFileParser {
    type Output = EventBatch;

    fn kind(&self) -> UnitKind {
        UnitKind::Log
    }

    fn parse_str(&self, path: &Path, text: &str) -> Result<EventBatch, ParseError> {
        let mut batch = EventBatch::default();
        for record in json_lines::<RawLogRecord>(path, text) {
            let (line, raw) = record?;
            if raw.page.as_deref() != Some(NEXT_SONG_PAGE) {
                batch.discarded_rows += 1;
                continue;
            }
            batch.events.push(RowContext { path, line }.play_event(raw)?);
        }
        Ok(batch)
    }
}

/// Yields `(line_number, record)` for every non-blank line.
fn json_lines<'a, T: DeserializeOwned>(
    path: &'a Path,
    text: &'a str,
) -> impl Iterator<Item = Result<(usize, T), ParseError>> + 'a {
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(move |(idx, l)| {
            serde_json::from_str::<T>(l)
                .map(|record| (idx + 1, record))
                .map_err(|source| ParseError::Json {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    source,
                })
        })
}

struct RowContext<'a> {
    path: &'a Path,
    line: usize,
}

impl RowContext<'_> {
    fn require<T>(&self, field: &'static str, value: Option<T>) -> Result<T, ParseError> {
        value.ok_or_else(|| ParseError::MissingField {
            path: self.path.to_path_buf(),
            line: self.line,
            field,
        })
    }

    fn invalid(&self, field: &'static str, value: impl fmt::Display) -> ParseError {
        ParseError::InvalidField {
            path: self.path.to_path_buf(),
            line: self.line,
            field,
            value: value.to_string(),
        }
    }

    /// Ids arrive either as JSON numbers or as numeric strings; `""` counts as missing.
    fn require_int(
        &self,
        field: &'static str,
        value: Option<JsonValue>,
    ) -> Result<i32, ParseError> {
        let parsed = match value {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) if s.trim().is_empty() => None,
            Some(JsonValue::String(s)) => Some(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| self.invalid(field, &s))?,
            ),
            Some(JsonValue::Number(n)) => Some(n.as_i64().ok_or_else(|| self.invalid(field, &n))?),
            Some(other) => return Err(self.invalid(field, other)),
        };
        let wide = self.require(field, parsed)?;
        i32::try_from(wide).map_err(|_| self.invalid(field, wide))
    }

    fn play_event(&self, raw: RawLogRecord) -> Result<PlayEvent, ParseError> {
        let ts = self.require("ts", raw.ts)?;
        let time = TimeBucket::from_epoch_millis(ts).ok_or_else(|| ParseError::InvalidTimestamp {
            path: self.path.to_path_buf(),
            line: self.line,
            ts,
        })?;
        let user = User {
            user_id: self.require_int("userId", raw.user_id)?,
            first_name: self.require("firstName", raw.first_name)?,
            last_name: self.require("lastName", raw.last_name)?,
            gender: self.require("gender", raw.gender)?,
            level: self.require("level", raw.level)?,
        };
        let reference = ReferenceKey::new(
            self.require("song", raw.song)?,
            self.require("artist", raw.artist)?,
            self.require("length", raw.length)?,
        );
        Ok(PlayEvent {
            ts,
            time,
            user,
            reference,
            session_id: self.require_int("sessionId", raw.session_id)?,
            location: raw.location,
            user_agent: raw.user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn log_row(page: &str, ts: i64, song: &str) -> String {
        serde_json::json!({
            "artist": "Y",
            "auth": "Logged In",
            "firstName": "Kaylee",
            "gender": "F",
            "itemInSession": 0,
            "lastName": "Summers",
            "length": 200.5,
            "level": "free",
            "location": "Phoenix-Mesa-Scottsdale, AZ",
            "method": "PUT",
            "page": page,
            "registration": 1540344794796.0_f64,
            "sessionId": 139,
            "song": song,
            "status": 200,
            "ts": ts,
            "userAgent": "Mozilla/5.0",
            "userId": "8"
        })
        .to_string()
    }

    #[test]
    fn song_file_yields_one_song_and_artist() {
        let text = r#"{"id":"S1","title":"X","creatorId":"A1","creatorName":"Y","creatorLocation":"Memphis, TN","creatorLatitude":35.14968,"creatorLongitude":-90.04892,"year":2004,"duration":200.5}"#;
        let unit = SongFileParser.parse_str(Path::new("song.json"), text).unwrap();
        assert_eq!(unit.song.song_id, "S1");
        assert_eq!(unit.song.artist_id, "A1");
        assert_eq!(unit.song.year, Some(2004));
        assert_eq!(unit.song.duration, 200.5);
        assert_eq!(unit.artist.name, "Y");
        assert_eq!(unit.artist.location.as_deref(), Some("Memphis, TN"));
        assert_eq!(unit.artist.latitude, Some(35.14968));
    }

    #[test]
    fn song_file_accepts_dataset_field_names() {
        let text = r#"{"num_songs": 1, "artist_id": "ARD7TVE1187B99BFB1", "artist_latitude": null, "artist_longitude": null, "artist_location": "California - LA", "artist_name": "Casual", "song_id": "SOMZWCG12A8C13C480", "title": "I Didn't Mean To", "duration": 218.93179, "year": 0}"#;
        let unit = SongFileParser.parse_str(Path::new("TRAAAAW128F429D538.json"), text).unwrap();
        assert_eq!(unit.song.song_id, "SOMZWCG12A8C13C480");
        assert_eq!(unit.artist.artist_id, "ARD7TVE1187B99BFB1");
        assert_eq!(unit.artist.latitude, None);
        assert_eq!(unit.song.year, Some(0));
    }

    #[test]
    fn song_file_missing_field_is_fatal_and_names_the_file() {
        let text = r#"{"id":"S1","creatorId":"A1","creatorName":"Y","duration":1.0}"#;
        let err = SongFileParser.parse_str(Path::new("broken.json"), text).unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "title", line: 1, .. }));
        assert_eq!(err.path(), Path::new("broken.json"));
        assert!(err.to_string().starts_with("broken.json:1"));
    }

    #[test]
    fn empty_song_file_is_fatal() {
        let err = SongFileParser.parse_str(Path::new("empty.json"), "\n  \n").unwrap_err();
        assert!(matches!(err, ParseError::EmptyUnit { .. }));
    }

    #[test]
    fn malformed_json_reports_line() {
        let text = format!("{}\n{{not json\n", log_row("NextSong", 1, "X"));
        let err = LogFileParser.parse_str(Path::new("log.json"), &text).unwrap_err();
        assert!(matches!(err, ParseError::Json { line: 2, .. }));
    }

    #[test]
    fn log_file_keeps_only_next_song_rows() {
        let text = [
            log_row("NextSong", 1_541_121_934_796, "X"),
            log_row("Login", 1_541_121_934_797, "X"),
            log_row("NextSong", 1_541_121_934_798, "Z"),
        ]
        .join("\n");
        let batch = LogFileParser.parse_str(Path::new("log.json"), &text).unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.discarded_rows, 1);
        assert_eq!(batch.events[0].reference, ReferenceKey::new("X", "Y", 200.5));
        assert_eq!(batch.events[0].user.user_id, 8);
        assert_eq!(batch.events[0].session_id, 139);
        assert_eq!(batch.events[0].time.hour, 1);
        assert_eq!(batch.events[1].reference.title, "Z");
    }

    #[test]
    fn non_song_rows_skip_event_field_validation() {
        let text = r#"{"page":"Home","ts":1541121934796,"userId":"","song":null,"length":null}"#;
        let batch = LogFileParser.parse_str(Path::new("log.json"), text).unwrap();
        assert!(batch.events.is_empty());
        assert_eq!(batch.discarded_rows, 1);
    }

    #[test]
    fn next_song_row_with_blank_user_is_fatal() {
        let mut row: JsonValue = serde_json::from_str(&log_row("NextSong", 1, "X")).unwrap();
        row["userId"] = JsonValue::String(String::new());
        let err = LogFileParser
            .parse_str(Path::new("log.json"), &row.to_string())
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingField { field: "userId", .. }));
    }

    #[test]
    fn non_numeric_user_id_is_invalid() {
        let mut row: JsonValue = serde_json::from_str(&log_row("NextSong", 1, "X")).unwrap();
        row["userId"] = JsonValue::String("abc".into());
        let err = LogFileParser
            .parse_str(Path::new("log.json"), &row.to_string())
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidField { field: "userId", .. }));
    }

    #[test]
    fn out_of_range_timestamp_is_fatal() {
        let text = log_row("NextSong", i64::MAX, "X");
        let err = LogFileParser.parse_str(Path::new("log.json"), &text).unwrap_err();
        assert!(matches!(err, ParseError::InvalidTimestamp { .. }));
    }

    #[test]
    fn parse_file_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "{}", log_row("NextSong", 1_541_121_934_796, "X")).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", log_row("Logout", 1_541_121_934_800, "X")).unwrap();
        let batch = LogFileParser.parse_file(file.path()).unwrap();
        assert_eq!(batch.events.len(), 1);

        let missing = SongFileParser
            .parse_file(Path::new("/definitely/not/here.json"))
            .unwrap_err();
        assert!(matches!(missing, ParseError::Io { .. }));
    }
}
