//! Read-only analytical queries over the permanent tables.

use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::PERMANENT_TABLES;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularSong {
    pub title: String,
    pub artist_name: String,
    pub plays: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularArtist {
    pub name: String,
    pub location: Option<String>,
    pub plays: i64,
}

/// Mean number of song plays per user, grouped by subscription level.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelActivity {
    pub level: String,
    pub users: i64,
    pub mean_plays: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct YearReport {
    pub year: i32,
    pub most_popular_song: Option<PopularSong>,
    pub most_popular_artist: Option<PopularArtist>,
    pub activity_by_level: Vec<LevelActivity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSample {
    pub table: &'static str,
    pub row_count: i64,
    pub rows: Vec<serde_json::Value>,
}

pub async fn most_popular_song(
    pool: &PgPool,
    year: i32,
) -> anyhow::Result<Option<PopularSong>> {
    let row = sqlx::query(
        r#"
        SELECT s.title, a.name AS artist_name, p.plays
          FROM (
                SELECT sp.song_id, COUNT(*) AS plays
                  FROM songplays sp
                  JOIN time t ON t.start_time = sp.start_time
                 WHERE t.year = $1
                 GROUP BY sp.song_id
                 ORDER BY plays DESC, sp.song_id
                 LIMIT 1
               ) p
          JOIN songs s ON s.song_id = p.song_id
          JOIN artists a ON a.artist_id = s.artist_id
        "#,
    )
    .bind(year)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(PopularSong {
        title: row.try_get("title")?,
        artist_name: row.try_get("artist_name")?,
        plays: row.try_get("plays")?,
    }))
}

pub async fn most_popular_artist(
    pool: &PgPool,
    year: i32,
) -> anyhow::Result<Option<PopularArtist>> {
    let row = sqlx::query(
        r#"
        SELECT a.name, a.location, p.plays
          FROM (
                SELECT sp.artist_id, COUNT(*) AS plays
                  FROM songplays sp
                  JOIN time t ON t.start_time = sp.start_time
                 WHERE t.year = $1
                 GROUP BY sp.artist_id
                 ORDER BY plays DESC, sp.artist_id
                 LIMIT 1
               ) p
          JOIN artists a ON a.artist_id = p.artist_id
        "#,
    )
    .bind(year)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(PopularArtist {
        name: row.try_get("name")?,
        location: row.try_get("location")?,
        plays: row.try_get("plays")?,
    }))
}

pub async fn activity_by_level(pool: &PgPool, year: i32) -> anyhow::Result<Vec<LevelActivity>> {
    let rows = sqlx::query(
        r#"
        SELECT u.level, COUNT(*) AS users, AVG(p.plays)::float8 AS mean_plays
          FROM users u
          JOIN (
                SELECT sp.user_id, COUNT(*) AS plays
                  FROM songplays sp
                  JOIN time t ON t.start_time = sp.start_time
                 WHERE t.year = $1
                 GROUP BY sp.user_id
               ) p ON p.user_id = u.user_id
         GROUP BY u.level
         ORDER BY u.level
        "#,
    )
    .bind(year)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(LevelActivity {
            level: row.try_get("level")?,
            users: row.try_get("users")?,
            mean_plays: row.try_get("mean_plays")?,
        });
    }
    Ok(out)
}

pub async fn year_report(pool: &PgPool, year: i32) -> anyhow::Result<YearReport> {
    Ok(YearReport {
        year,
        most_popular_song: most_popular_song(pool, year).await?,
        most_popular_artist: most_popular_artist(pool, year).await?,
        activity_by_level: activity_by_level(pool, year).await?,
    })
}

/// Row count plus the first `limit` rows of every permanent table, as JSON.
pub async fn inspect_tables(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<TableSample>> {
    let mut out = Vec::with_capacity(PERMANENT_TABLES.len());
    for table in PERMANENT_TABLES {
        let row_count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await?;
        let rows = sqlx::query(&format!(
            "SELECT row_to_json(t) AS row FROM (SELECT * FROM {table} LIMIT $1) t"
        ))
        .bind(limit)
        .fetch_all(pool)
        .await?
        .into_iter()
        .map(|row| row.try_get::<serde_json::Value, _>("row"))
        .collect::<Result<Vec<_>, _>>()?;
        out.push(TableSample {
            table,
            row_count,
            rows,
        });
    }
    Ok(out)
}

pub fn year_report_markdown(report: &YearReport) -> String {
    let mut lines = vec![format!("# Song play report {}", report.year), String::new()];

    lines.push("## Most popular song".to_string());
    match &report.most_popular_song {
        Some(song) => lines.push(format!(
            "- {} by {} ({} plays)",
            song.title, song.artist_name, song.plays
        )),
        None => lines.push("- no plays recorded".to_string()),
    }
    lines.push(String::new());

    lines.push("## Most popular artist".to_string());
    match &report.most_popular_artist {
        Some(artist) => lines.push(format!(
            "- {} ({}) with {} plays",
            artist.name,
            artist.location.as_deref().unwrap_or("unknown location"),
            artist.plays
        )),
        None => lines.push("- no plays recorded".to_string()),
    }
    lines.push(String::new());

    lines.push("## Mean plays per user by level".to_string());
    if report.activity_by_level.is_empty() {
        lines.push("- no plays recorded".to_string());
    }
    for level in &report.activity_by_level {
        lines.push(format!(
            "- {}: {:.2} across {} users",
            level.level, level.mean_plays, level.users
        ));
    }
    lines.push(String::new());

    lines.join("\n")
}
