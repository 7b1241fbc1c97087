//! `COPY ... FROM STDIN` text-format encoding for staged rows.

use std::fmt::Write as _;

use chrono::NaiveDateTime;
use playlog_core::{StagedSongPlay, TimeBucket, User};

const NULL: &str = "\\N";

/// A row that can be written as one line of PostgreSQL COPY text format.
pub trait CopyRow {
    fn write_fields(&self, row: &mut CopyRowWriter<'_>);
}

pub struct CopyRowWriter<'a> {
    out: &'a mut String,
    first: bool,
}

impl CopyRowWriter<'_> {
    fn separator(&mut self) {
        if !self.first {
            self.out.push('\t');
        }
        self.first = false;
    }

    pub fn text(&mut self, value: &str) -> &mut Self {
        self.separator();
        for c in value.chars() {
            match c {
                '\\' => self.out.push_str("\\\\"),
                '\t' => self.out.push_str("\\t"),
                '\n' => self.out.push_str("\\n"),
                '\r' => self.out.push_str("\\r"),
                c => self.out.push(c),
            }
        }
        self
    }

    pub fn opt_text(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(v) => self.text(v),
            None => {
                self.separator();
                self.out.push_str(NULL);
                self
            }
        }
    }

    pub fn int(&mut self, value: i64) -> &mut Self {
        self.separator();
        let _ = write!(self.out, "{value}");
        self
    }

    pub fn timestamp(&mut self, value: NaiveDateTime) -> &mut Self {
        self.separator();
        let _ = write!(self.out, "{}", value.format("%Y-%m-%d %H:%M:%S%.f"));
        self
    }
}

pub fn encode_rows<T: CopyRow>(rows: &[T]) -> String {
    let mut out = String::with_capacity(rows.len() * 64);
    for row in rows {
        row.write_fields(&mut CopyRowWriter {
            out: &mut out,
            first: true,
        });
        out.push('\n');
    }
    out
}

impl CopyRow for TimeBucket {
    fn write_fields(&self, row: &mut CopyRowWriter<'_>) {
        row.timestamp(self.start_time)
            .int(self.hour.into())
            .int(self.day.into())
            .int(self.week.into())
            .int(self.month.into())
            .int(self.year.into())
            .int(self.weekday.into());
    }
}

impl CopyRow for User {
    fn write_fields(&self, row: &mut CopyRowWriter<'_>) {
        row.int(self.user_id.into())
            .text(&self.first_name)
            .text(&self.last_name)
            .text(&self.gender)
            .text(&self.level);
    }
}

impl CopyRow for StagedSongPlay {
    fn write_fields(&self, row: &mut CopyRowWriter<'_>) {
        row.int(self.ts)
            .int(self.user_id.into())
            .text(&self.level)
            .text(&self.song_id)
            .text(&self.artist_id)
            .int(self.session_id.into())
            .opt_text(self.location.as_deref())
            .opt_text(self.user_agent.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_bucket_line_matches_column_order() {
        let bucket = TimeBucket::from_epoch_millis(1_541_121_934_796).unwrap();
        assert_eq!(
            encode_rows(&[bucket]),
            "2018-11-02 01:25:34.796\t1\t2\t44\t11\t2018\t4\n"
        );
    }

    #[test]
    fn whole_second_timestamps_have_no_fraction() {
        let bucket = TimeBucket::from_epoch_millis(1_541_203_200_000).unwrap();
        assert!(encode_rows(&[bucket]).starts_with("2018-11-03 00:00:00\t0\t3\t"));
    }

    #[test]
    fn text_fields_escape_copy_metacharacters() {
        let play = StagedSongPlay {
            ts: 1,
            user_id: 2,
            level: "free".into(),
            song_id: "S\\1".into(),
            artist_id: "A\t1".into(),
            session_id: 3,
            location: None,
            user_agent: Some("line\nbreak\r".into()),
        };
        assert_eq!(
            encode_rows(&[play]),
            "1\t2\tfree\tS\\\\1\tA\\t1\t3\t\\N\tline\\nbreak\\r\n"
        );
    }

    #[test]
    fn users_encode_one_line_each() {
        let user = |id: i32| User {
            user_id: id,
            first_name: "Kaylee".into(),
            last_name: "Summers".into(),
            gender: "F".into(),
            level: "free".into(),
        };
        let encoded = encode_rows(&[user(8), user(8)]);
        assert_eq!(encoded.lines().count(), 2);
        assert_eq!(encoded.lines().next(), Some("8\tKaylee\tSummers\tF\tfree"));
    }
}
