//! In-process warehouse with the same first-write-wins semantics as PostgreSQL.
//!
//! Backs `etl --dry-run` and the pipeline tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use playlog_core::{
    Artist, CatalogUnit, ReferenceKey, Song, SongPlay, SongRef, StagedBatch, TimeBucket, User,
};

use crate::{CatalogWrite, ReconcileStats, StageCounts, StoreError, Warehouse};

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    songs: BTreeMap<String, Song>,
    artists: BTreeMap<String, Artist>,
    users: BTreeMap<i32, User>,
    time: BTreeMap<NaiveDateTime, TimeBucket>,
    song_plays: Vec<SongPlay>,
    staging: Option<StagedBatch>,
    next_songplay_id: i64,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn songs(&self) -> impl Iterator<Item = &Song> {
        self.songs.values()
    }

    pub fn artists(&self) -> impl Iterator<Item = &Artist> {
        self.artists.values()
    }

    pub fn user(&self, user_id: i32) -> Option<&User> {
        self.users.get(&user_id)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn time_buckets(&self) -> impl Iterator<Item = &TimeBucket> {
        self.time.values()
    }

    pub fn song_plays(&self) -> &[SongPlay] {
        &self.song_plays
    }

    /// Rows currently waiting in staging, `None` once reconciled.
    pub fn staged(&self) -> Option<&StagedBatch> {
        self.staging.as_ref()
    }
}

/// Keeps the first row per key, in staging order.
fn first_per_key<T, K, F>(rows: &[T], key: F) -> Vec<&T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    rows.iter().filter(|row| seen.insert(key(*row))).collect()
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn prepare_staging(&mut self) -> Result<(), StoreError> {
        self.staging = Some(StagedBatch::default());
        Ok(())
    }

    async fn write_catalog(&mut self, unit: &CatalogUnit) -> Result<CatalogWrite, StoreError> {
        let mut write = CatalogWrite::default();
        if !self.songs.contains_key(&unit.song.song_id) {
            self.songs
                .insert(unit.song.song_id.clone(), unit.song.clone());
            write.song_inserted = true;
        }
        if !self.artists.contains_key(&unit.artist.artist_id) {
            self.artists
                .insert(unit.artist.artist_id.clone(), unit.artist.clone());
            write.artist_inserted = true;
        }
        Ok(write)
    }

    async fn resolve_one(&mut self, key: &ReferenceKey) -> Result<Option<SongRef>, StoreError> {
        Ok(self.songs.values().find_map(|song| {
            let artist = self.artists.get(&song.artist_id)?;
            key.matches(song, artist).then(|| SongRef {
                song_id: song.song_id.clone(),
                artist_id: artist.artist_id.clone(),
            })
        }))
    }

    async fn resolve_references(
        &mut self,
        keys: &[ReferenceKey],
    ) -> Result<HashMap<ReferenceKey, SongRef>, StoreError> {
        let mut resolved = HashMap::new();
        for key in keys {
            if let Some(song_ref) = self.resolve_one(key).await? {
                resolved.insert(key.clone(), song_ref);
            }
        }
        Ok(resolved)
    }

    async fn stage_events(&mut self, batch: &StagedBatch) -> Result<StageCounts, StoreError> {
        let staging = self.staging.get_or_insert_with(StagedBatch::default);
        staging.time_buckets.extend_from_slice(&batch.time_buckets);
        staging.users.extend_from_slice(&batch.users);
        staging.song_plays.extend_from_slice(&batch.song_plays);
        Ok(StageCounts {
            time_buckets: batch.time_buckets.len() as u64,
            users: batch.users.len() as u64,
            song_plays: batch.song_plays.len() as u64,
        })
    }

    async fn reconcile(&mut self) -> Result<ReconcileStats, StoreError> {
        let staging = self.staging.as_ref().ok_or(StoreError::StagingMissing)?;

        // Validated up front so a bad row leaves every table and staging untouched.
        let mut plays = Vec::new();
        for play in first_per_key(&staging.song_plays, |p| (p.ts, p.user_id, p.session_id)) {
            let bucket = TimeBucket::from_epoch_millis(play.ts)
                .ok_or(StoreError::InvalidTimestamp { ts: play.ts })?;
            plays.push((bucket.start_time, play));
        }

        let mut stats = ReconcileStats::default();

        for bucket in first_per_key(&staging.time_buckets, |b| b.start_time) {
            if !self.time.contains_key(&bucket.start_time) {
                self.time.insert(bucket.start_time, *bucket);
                stats.time_inserted += 1;
            }
        }

        for user in first_per_key(&staging.users, |u| u.user_id) {
            if !self.users.contains_key(&user.user_id) {
                self.users.insert(user.user_id, user.clone());
                stats.users_inserted += 1;
            }
        }

        let mut existing: HashSet<(NaiveDateTime, i32, i32)> = self
            .song_plays
            .iter()
            .map(|p| (p.start_time, p.user_id, p.session_id))
            .collect();
        for (start_time, play) in plays {
            if !existing.insert((start_time, play.user_id, play.session_id)) {
                continue;
            }
            self.next_songplay_id += 1;
            self.song_plays.push(SongPlay {
                songplay_id: self.next_songplay_id,
                start_time,
                user_id: play.user_id,
                level: play.level.clone(),
                song_id: play.song_id.clone(),
                artist_id: play.artist_id.clone(),
                session_id: play.session_id,
                location: play.location.clone(),
                user_agent: play.user_agent.clone(),
            });
            stats.song_plays_inserted += 1;
        }

        self.staging = None;
        Ok(stats)
    }

    async fn count_song_plays(&mut self) -> Result<i64, StoreError> {
        Ok(self.song_plays.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playlog_core::StagedSongPlay;

    fn catalog(
        song_id: &str,
        title: &str,
        artist_id: &str,
        name: &str,
        duration: f64,
    ) -> CatalogUnit {
        CatalogUnit {
            song: Song {
                song_id: song_id.into(),
                title: title.into(),
                artist_id: artist_id.into(),
                year: Some(2004),
                duration,
            },
            artist: Artist {
                artist_id: artist_id.into(),
                name: name.into(),
                location: None,
                latitude: None,
                longitude: None,
            },
        }
    }

    fn user(user_id: i32, level: &str) -> User {
        User {
            user_id,
            first_name: "Kaylee".into(),
            last_name: "Summers".into(),
            gender: "F".into(),
            level: level.into(),
        }
    }

    fn play(ts: i64, user_id: i32, song_id: &str) -> StagedSongPlay {
        StagedSongPlay {
            ts,
            user_id,
            level: "free".into(),
            song_id: song_id.into(),
            artist_id: "A1".into(),
            session_id: 139,
            location: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn catalog_writes_are_first_write_wins() {
        let mut wh = MemoryWarehouse::new();
        let first = wh
            .write_catalog(&catalog("S1", "X", "A1", "Y", 200.5))
            .await
            .unwrap();
        let second = wh
            .write_catalog(&catalog("S1", "Other", "A1", "Renamed", 1.0))
            .await
            .unwrap();
        assert!(first.song_inserted && first.artist_inserted);
        assert!(!second.song_inserted && !second.artist_inserted);
        assert_eq!(wh.songs().next().unwrap().title, "X");
        assert_eq!(wh.artists().next().unwrap().name, "Y");
    }

    #[tokio::test]
    async fn resolution_requires_exact_triple() {
        let mut wh = MemoryWarehouse::new();
        wh.write_catalog(&catalog("S1", "X", "A1", "Y", 200.5))
            .await
            .unwrap();
        let keys = vec![
            ReferenceKey::new("X", "Y", 200.5),
            ReferenceKey::new("X", "Y", 200.0),
            ReferenceKey::new("X", "Z", 200.5),
        ];
        let resolved = wh.resolve_references(&keys).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[&keys[0]].song_id, "S1");
        assert!(wh.resolve_one(&keys[2]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_keeps_one_row_per_key() {
        let mut wh = MemoryWarehouse::new();
        wh.prepare_staging().await.unwrap();
        let bucket = TimeBucket::from_epoch_millis(1_541_121_934_796).unwrap();
        wh.stage_events(&StagedBatch {
            time_buckets: vec![bucket, bucket],
            users: vec![user(8, "free"), user(8, "paid")],
            song_plays: vec![play(1_541_121_934_796, 8, "S1"), play(1_541_121_934_796, 8, "S1")],
        })
        .await
        .unwrap();

        let stats = wh.reconcile().await.unwrap();
        assert_eq!(
            stats,
            ReconcileStats {
                time_inserted: 1,
                users_inserted: 1,
                song_plays_inserted: 1,
            }
        );
        assert_eq!(wh.time_buckets().count(), 1);
        assert_eq!(wh.user(8).unwrap().level, "free");
        assert_eq!(wh.song_plays()[0].start_time, bucket.start_time);
        assert!(wh.staged().is_none());
    }

    #[tokio::test]
    async fn reconcile_discards_rows_already_committed() {
        let mut wh = MemoryWarehouse::new();
        for _ in 0..2 {
            wh.prepare_staging().await.unwrap();
            wh.stage_events(&StagedBatch {
                time_buckets: vec![TimeBucket::from_epoch_millis(1_541_121_934_796).unwrap()],
                users: vec![user(8, "free")],
                song_plays: vec![play(1_541_121_934_796, 8, "S1")],
            })
            .await
            .unwrap();
            wh.reconcile().await.unwrap();
        }
        assert_eq!(wh.count_song_plays().await.unwrap(), 1);
        assert_eq!(wh.user_count(), 1);
    }

    #[tokio::test]
    async fn out_of_range_play_fails_reconcile_without_writes() {
        let mut wh = MemoryWarehouse::new();
        wh.prepare_staging().await.unwrap();
        wh.stage_events(&StagedBatch {
            time_buckets: vec![TimeBucket::from_epoch_millis(1_541_121_934_796).unwrap()],
            users: vec![user(8, "free")],
            song_plays: vec![play(i64::MAX, 8, "S1")],
        })
        .await
        .unwrap();

        assert!(matches!(
            wh.reconcile().await,
            Err(StoreError::InvalidTimestamp { ts: i64::MAX })
        ));
        assert_eq!(wh.time_buckets().count(), 0);
        assert_eq!(wh.user_count(), 0);
        assert!(wh.song_plays().is_empty());
        assert_eq!(wh.staged().map(|s| s.song_plays.len()), Some(1));
    }

    #[tokio::test]
    async fn reconcile_without_staging_fails() {
        let mut wh = MemoryWarehouse::new();
        assert!(matches!(wh.reconcile().await, Err(StoreError::StagingMissing)));
    }
}
