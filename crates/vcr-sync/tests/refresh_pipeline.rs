//! End-to-end refresh: fixture source -> snapshot cache -> catalog store.

use std::sync::Arc;

use tempfile::tempdir;
use vcr_cache::{FreshnessPolicy, SnapshotStore};
use vcr_sources::FixtureSource;
use vcr_store::MemoryCatalogStore;
use vcr_sync::{PlatformConfig, PlatformRegistry, RefreshPipeline};

fn registry(keys: &[&str]) -> PlatformRegistry {
    PlatformRegistry {
        platforms: keys
            .iter()
            .map(|key| PlatformConfig {
                key: key.to_string(),
                display_name: key.to_string(),
                enabled: true,
            })
            .collect(),
    }
}

#[tokio::test]
async fn first_run_fetches_and_second_run_hits_the_cache() {
    let cache_dir = tempdir().expect("cache dir");
    let fixtures_dir = tempdir().expect("fixtures dir");
    std::fs::write(
        fixtures_dir.path().join("netflix.json"),
        r#"[{"id": 1, "title": "Movie A"}, {"id": 2, "title": "Movie B"}]"#,
    )
    .expect("fixture");

    let store = Arc::new(MemoryCatalogStore::new());
    let pipeline = RefreshPipeline::new(
        SnapshotStore::new(cache_dir.path(), FreshnessPolicy::default()),
        Arc::new(FixtureSource::new(fixtures_dir.path())),
        store.clone(),
    );
    let registry = registry(&["netflix"]);

    let first = pipeline.run_once(&registry).await;
    assert!(first.failed_platforms.is_empty());
    assert!(!first.platforms[0].cache_hit);
    assert_eq!(first.platforms[0].sync.inserted, 2);
    assert_eq!(store.record_count().await, 2);

    // Within the TTL the snapshot is served and reconciliation is a no-op.
    let second = pipeline.run_once(&registry).await;
    assert!(second.platforms[0].cache_hit);
    assert_eq!(second.platforms[0].sync.inserted, 0);
    assert_eq!(second.platforms[0].sync.updated, 0);
    assert_eq!(second.platforms[0].sync.skipped, 2);
}

#[tokio::test]
async fn failing_platform_does_not_abort_the_run() {
    let cache_dir = tempdir().expect("cache dir");
    let fixtures_dir = tempdir().expect("fixtures dir");
    std::fs::write(
        fixtures_dir.path().join("prime.json"),
        r#"[{"id": 7, "title": "Movie C"}]"#,
    )
    .expect("fixture");

    let pipeline = RefreshPipeline::new(
        SnapshotStore::new(cache_dir.path(), FreshnessPolicy::default()),
        Arc::new(FixtureSource::new(fixtures_dir.path())),
        Arc::new(MemoryCatalogStore::new()),
    );
    // "betamax" has no fixture and fails to fetch.
    let registry = registry(&["betamax", "prime"]);

    let run = pipeline.run_once(&registry).await;
    assert_eq!(run.failed_platforms, vec!["betamax".to_string()]);
    assert_eq!(run.platforms.len(), 1);
    assert_eq!(run.platforms[0].platform, "prime");
    assert_eq!(run.platforms[0].sync.inserted, 1);
}

#[tokio::test]
async fn disabled_platforms_are_not_refreshed() {
    let cache_dir = tempdir().expect("cache dir");
    let fixtures_dir = tempdir().expect("fixtures dir");
    std::fs::write(fixtures_dir.path().join("hbo.json"), r#"[{"id": 9}]"#).expect("fixture");

    let pipeline = RefreshPipeline::new(
        SnapshotStore::new(cache_dir.path(), FreshnessPolicy::default()),
        Arc::new(FixtureSource::new(fixtures_dir.path())),
        Arc::new(MemoryCatalogStore::new()),
    );
    let registry = PlatformRegistry {
        platforms: vec![PlatformConfig {
            key: "hbo".to_string(),
            display_name: "HBO Max".to_string(),
            enabled: false,
        }],
    };

    let run = pipeline.run_once(&registry).await;
    assert!(run.platforms.is_empty());
    assert!(run.failed_platforms.is_empty());
}
