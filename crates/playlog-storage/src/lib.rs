//! Warehouse storage: catalog writes, reference resolution, COPY staging and
//! the merge from staging into the permanent star schema.

pub mod analytics;
pub mod copy;
pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use playlog_core::{CatalogUnit, ReferenceKey, SongRef, StagedBatch};
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::copy::{encode_rows, CopyRow};

pub use memory::MemoryWarehouse;

pub const CRATE_NAME: &str = "playlog-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("bulk transfer into {table} failed: {source}")]
    BulkTransfer {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("reconciling {table} failed: {source}")]
    Reconcile {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("staging area has not been prepared")]
    StagingMissing,
    #[error("staged song play has out-of-range timestamp {ts}")]
    InvalidTimestamp { ts: i64 },
}

/// Which halves of a catalog unit were new.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CatalogWrite {
    pub song_inserted: bool,
    pub artist_inserted: bool,
}

/// Rows appended to each staging table by one unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub time_buckets: u64,
    pub users: u64,
    pub song_plays: u64,
}

/// Rows that made it from staging into the permanent tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub time_inserted: u64,
    pub users_inserted: u64,
    pub song_plays_inserted: u64,
}

/// Load-side operations of the pipeline against a relational store.
///
/// Permanent-table writes are first-write-wins: a row whose unique key already
/// exists is discarded without error.
#[async_trait]
pub trait Warehouse: Send {
    /// Drops staging tables left over from an earlier run and creates fresh ones.
    async fn prepare_staging(&mut self) -> Result<(), StoreError>;

    /// Writes one song and its artist directly to the permanent tables and commits.
    async fn write_catalog(&mut self, unit: &CatalogUnit) -> Result<CatalogWrite, StoreError>;

    async fn resolve_one(&mut self, key: &ReferenceKey) -> Result<Option<SongRef>, StoreError>;

    /// Resolves many keys against the committed catalog; unresolved keys are absent.
    async fn resolve_references(
        &mut self,
        keys: &[ReferenceKey],
    ) -> Result<HashMap<ReferenceKey, SongRef>, StoreError>;

    /// Appends one unit's rows to the staging tables and commits.
    async fn stage_events(&mut self, batch: &StagedBatch) -> Result<StageCounts, StoreError>;

    /// Deduplicates staging into the permanent tables and drops staging, all or nothing.
    async fn reconcile(&mut self) -> Result<ReconcileStats, StoreError>;

    async fn count_song_plays(&mut self) -> Result<i64, StoreError>;
}

pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Drops every permanent and staging table plus the migration ledger, then migrates.
pub async fn reset_schema(pool: &PgPool) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    for table in STAGING_TABLES.iter().map(|t| t.name).chain(PERMANENT_TABLES) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("DROP TABLE IF EXISTS _sqlx_migrations")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!("dropped warehouse tables");
    migrate(pool).await
}

pub const PERMANENT_TABLES: [&str; 5] = ["songplays", "users", "songs", "artists", "time"];

struct StagingTable {
    name: &'static str,
    create: &'static str,
    copy: &'static str,
    migrate: &'static str,
}

const TIME_STAGING: StagingTable = StagingTable {
    name: "time_temp",
    create: "CREATE UNLOGGED TABLE time_temp (LIKE time, stage_seq BIGSERIAL)",
    copy: "COPY time_temp (start_time, hour, day, week, month, year, weekday) FROM STDIN",
    migrate: r#"
        INSERT INTO time (start_time, hour, day, week, month, year, weekday)
        SELECT DISTINCT ON (start_time) start_time, hour, day, week, month, year, weekday
          FROM time_temp
         ORDER BY start_time, stage_seq
        ON CONFLICT (start_time) DO NOTHING
    "#,
};

const USERS_STAGING: StagingTable = StagingTable {
    name: "users_temp",
    create: "CREATE UNLOGGED TABLE users_temp (LIKE users, stage_seq BIGSERIAL)",
    copy: "COPY users_temp (user_id, first_name, last_name, gender, level) FROM STDIN",
    migrate: r#"
        INSERT INTO users (user_id, first_name, last_name, gender, level)
        SELECT DISTINCT ON (user_id) user_id, first_name, last_name, gender, level
          FROM users_temp
         ORDER BY user_id, stage_seq
        ON CONFLICT (user_id) DO NOTHING
    "#,
};

const SONGPLAYS_STAGING: StagingTable = StagingTable {
    name: "songplays_temp",
    create: r#"
        CREATE UNLOGGED TABLE songplays_temp (
            ts BIGINT NOT NULL,
            user_id INT NOT NULL,
            level VARCHAR(10) NOT NULL,
            song_id VARCHAR(100) NOT NULL,
            artist_id VARCHAR(100) NOT NULL,
            session_id INT NOT NULL,
            location VARCHAR(256),
            user_agent VARCHAR,
            stage_seq BIGSERIAL
        )
    "#,
    copy: "COPY songplays_temp (ts, user_id, level, song_id, artist_id, session_id, location, user_agent) FROM STDIN",
    migrate: r#"
        INSERT INTO songplays (start_time, user_id, level, song_id, artist_id, session_id, location, user_agent)
        SELECT DISTINCT ON (ts, user_id, session_id)
               TIMESTAMP 'epoch' + ts * INTERVAL '1 millisecond',
               user_id, level, song_id, artist_id, session_id, location, user_agent
          FROM songplays_temp
         ORDER BY ts, user_id, session_id, stage_seq
        ON CONFLICT (start_time, user_id, session_id) DO NOTHING
    "#,
};

const STAGING_TABLES: [&StagingTable; 3] = [&TIME_STAGING, &USERS_STAGING, &SONGPLAYS_STAGING];

const INSERT_SONG: &str = r#"
    INSERT INTO songs (song_id, title, artist_id, year, duration)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (song_id) DO NOTHING
"#;

const INSERT_ARTIST: &str = r#"
    INSERT INTO artists (artist_id, name, location, latitude, longitude)
    VALUES ($1, $2, $3, $4, $5)
    ON CONFLICT (artist_id) DO NOTHING
"#;

const SELECT_SONG_REF: &str = r#"
    SELECT s.song_id, a.artist_id
      FROM songs s
      JOIN artists a ON a.artist_id = s.artist_id
     WHERE s.title = $1 AND a.name = $2 AND s.duration = $3
     LIMIT 1
"#;

const SELECT_SONG_REFS: &str = r#"
    SELECT k.title, k.artist_name, k.duration, s.song_id, a.artist_id
      FROM UNNEST($1::text[], $2::text[], $3::float8[]) AS k (title, artist_name, duration)
      JOIN songs s ON s.title = k.title AND s.duration = k.duration
      JOIN artists a ON a.artist_id = s.artist_id AND a.name = k.artist_name
"#;

/// PostgreSQL warehouse holding one pooled connection for the length of a run.
pub struct PgWarehouse {
    conn: PoolConnection<Postgres>,
}

impl PgWarehouse {
    pub async fn acquire(pool: &PgPool) -> Result<Self, StoreError> {
        Ok(Self {
            conn: pool.acquire().await?,
        })
    }
}

async fn copy_rows<T: CopyRow>(
    conn: &mut PgConnection,
    table: &StagingTable,
    rows: &[T],
) -> Result<u64, StoreError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let bulk_err = |source: sqlx::Error| StoreError::BulkTransfer {
        table: table.name,
        source,
    };
    let payload = encode_rows(rows);
    let mut copy = conn.copy_in_raw(table.copy).await.map_err(bulk_err)?;
    let sent = copy.send(payload.into_bytes()).await.map(|_| ());
    if let Err(source) = sent {
        let _ = copy.abort("staging payload rejected").await;
        return Err(bulk_err(source));
    }
    let written = copy.finish().await.map_err(bulk_err)?;
    debug!(table = table.name, written, "copied rows into staging");
    Ok(written)
}

async fn migrate_staging(conn: &mut PgConnection, table: &StagingTable) -> Result<u64, StoreError> {
    let reconcile_err = |source: sqlx::Error| StoreError::Reconcile {
        table: table.name,
        source,
    };
    let inserted = sqlx::query(table.migrate)
        .execute(&mut *conn)
        .await
        .map_err(reconcile_err)?
        .rows_affected();
    sqlx::query(&format!("DROP TABLE {}", table.name))
        .execute(&mut *conn)
        .await
        .map_err(reconcile_err)?;
    info!(table = table.name, inserted, "migrated staging table");
    Ok(inserted)
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn prepare_staging(&mut self) -> Result<(), StoreError> {
        let mut tx = self.conn.begin().await?;
        for table in STAGING_TABLES {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.name))
                .execute(&mut *tx)
                .await?;
            sqlx::query(table.create).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("staging tables recreated");
        Ok(())
    }

    async fn write_catalog(&mut self, unit: &CatalogUnit) -> Result<CatalogWrite, StoreError> {
        let mut tx = self.conn.begin().await?;
        let song = sqlx::query(INSERT_SONG)
            .bind(&unit.song.song_id)
            .bind(&unit.song.title)
            .bind(&unit.song.artist_id)
            .bind(unit.song.year)
            .bind(unit.song.duration)
            .execute(&mut *tx)
            .await?;
        let artist = sqlx::query(INSERT_ARTIST)
            .bind(&unit.artist.artist_id)
            .bind(&unit.artist.name)
            .bind(unit.artist.location.as_deref())
            .bind(unit.artist.latitude)
            .bind(unit.artist.longitude)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(CatalogWrite {
            song_inserted: song.rows_affected() > 0,
            artist_inserted: artist.rows_affected() > 0,
        })
    }

    async fn resolve_one(&mut self, key: &ReferenceKey) -> Result<Option<SongRef>, StoreError> {
        let row = sqlx::query(SELECT_SONG_REF)
            .bind(&key.title)
            .bind(&key.artist_name)
            .bind(key.duration)
            .fetch_optional(&mut *self.conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(SongRef {
            song_id: row.try_get("song_id")?,
            artist_id: row.try_get("artist_id")?,
        }))
    }

    async fn resolve_references(
        &mut self,
        keys: &[ReferenceKey],
    ) -> Result<HashMap<ReferenceKey, SongRef>, StoreError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let titles: Vec<String> = keys.iter().map(|k| k.title.clone()).collect();
        let names: Vec<String> = keys.iter().map(|k| k.artist_name.clone()).collect();
        let durations: Vec<f64> = keys.iter().map(|k| k.duration).collect();

        let rows = sqlx::query(SELECT_SONG_REFS)
            .bind(titles)
            .bind(names)
            .bind(durations)
            .fetch_all(&mut *self.conn)
            .await?;

        let mut resolved = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = ReferenceKey::new(
                row.try_get::<String, _>("title")?,
                row.try_get::<String, _>("artist_name")?,
                row.try_get::<f64, _>("duration")?,
            );
            if resolved.contains_key(&key) {
                continue;
            }
            resolved.insert(
                key,
                SongRef {
                    song_id: row.try_get("song_id")?,
                    artist_id: row.try_get("artist_id")?,
                },
            );
        }
        Ok(resolved)
    }

    async fn stage_events(&mut self, batch: &StagedBatch) -> Result<StageCounts, StoreError> {
        let mut tx = self.conn.begin().await?;
        let counts = StageCounts {
            time_buckets: copy_rows(&mut tx, &TIME_STAGING, &batch.time_buckets).await?,
            users: copy_rows(&mut tx, &USERS_STAGING, &batch.users).await?,
            song_plays: copy_rows(&mut tx, &SONGPLAYS_STAGING, &batch.song_plays).await?,
        };
        tx.commit().await?;
        Ok(counts)
    }

    async fn reconcile(&mut self) -> Result<ReconcileStats, StoreError> {
        let mut tx = self.conn.begin().await?;
        let stats = ReconcileStats {
            time_inserted: migrate_staging(&mut tx, &TIME_STAGING).await?,
            users_inserted: migrate_staging(&mut tx, &USERS_STAGING).await?,
            song_plays_inserted: migrate_staging(&mut tx, &SONGPLAYS_STAGING).await?,
        };
        tx.commit().await?;
        Ok(stats)
    }

    async fn count_song_plays(&mut self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM songplays")
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(count)
    }
}
