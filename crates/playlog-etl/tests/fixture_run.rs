use std::path::{Path, PathBuf};

use playlog_etl::{EtlConfig, EtlPipeline};
use playlog_storage::{MemoryWarehouse, ReconcileStats, StageCounts};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn fixture_config(reports_dir: &Path) -> EtlConfig {
    EtlConfig {
        database_url: String::new(),
        song_data_dir: fixtures_root().join("song_data"),
        log_data_dir: fixtures_root().join("log_data"),
        file_extension: "json".to_string(),
        reports_dir: reports_dir.to_path_buf(),
        write_reports: true,
    }
}

#[tokio::test]
async fn fixture_tree_loads_into_memory_warehouse() {
    let reports = tempfile::tempdir().expect("tempdir");
    let mut pipeline = EtlPipeline::new(fixture_config(reports.path()), MemoryWarehouse::new());
    let summary = pipeline.run_once().await.expect("fixture run");

    assert_eq!(summary.song_units, 2);
    assert_eq!(summary.log_units, 2);
    assert_eq!(summary.songs_inserted, 2);
    assert_eq!(summary.artists_inserted, 2);
    assert_eq!(summary.next_song_events, 6);
    assert_eq!(summary.discarded_rows, 2);
    assert_eq!(summary.resolved_events, 5);
    assert_eq!(summary.unresolved_events, 1);
    assert_eq!(
        summary.staged,
        StageCounts {
            time_buckets: 6,
            users: 6,
            song_plays: 5,
        }
    );
    assert_eq!(
        summary.reconciled,
        ReconcileStats {
            time_inserted: 5,
            users_inserted: 2,
            song_plays_inserted: 4,
        }
    );
    assert_eq!(summary.committed_song_plays, 4);

    let warehouse = pipeline.into_warehouse();
    assert_eq!(warehouse.user_count(), 2);
    // user 8 upgrades to paid on the second day; the first staged row wins.
    assert_eq!(warehouse.user(8).expect("user 8").level, "free");
    assert_eq!(warehouse.user(10).expect("user 10").level, "paid");
    assert!(warehouse.staged().is_none());

    let report = summary.report_path.expect("report path");
    assert!(Path::new(&report).exists());
}
