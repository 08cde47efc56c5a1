mod util;

use app_store_analytics::ingest::{IngestionPipeline, LoadError};
use app_store_analytics::limiter::ConcurrencyLimiter;
use app_store_analytics::registry::TableRegistry;
use app_store_analytics::store::{MemoryStore, TableStore, WriteMode};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use util::{CountingStore, day, int_row};

fn pipeline<S: TableStore>(store: &Arc<S>, permits: usize) -> IngestionPipeline<S> {
    IngestionPipeline::new(
        Arc::new(TableRegistry::new(Arc::clone(store))),
        ConcurrencyLimiter::new(permits),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_hundred_writes_never_exceed_fifty_loads() {
    let store = CountingStore::new(Duration::from_millis(5));
    let pipeline = pipeline(&store, 50);

    let mut tasks = JoinSet::new();
    for i in 0..200 {
        let pipeline = pipeline.clone();
        tasks.spawn(async move {
            let rows = [int_row("2024-01-01", i, None)];
            pipeline
                .write(&format!("app-{i}"), "crashes", None, day("2024-01-01"), &rows, false)
                .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.unwrap().unwrap(), "crashes_total");
    }

    assert!(store.peak() <= 50, "peak {} exceeded the limit", store.peak());
    assert!(pipeline.limiter().peak() <= 50);
    assert_eq!(pipeline.limiter().in_flight(), 0);
    assert_eq!(store.open(), 0);
    assert_eq!(store.inner.rows("crashes_total").len(), 200);
}

#[tokio::test]
async fn repeated_write_replaces_the_slice() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, 50);
    let rows = [int_row("2024-01-01", 3, None)];

    for _ in 0..2 {
        let table = pipeline
            .write("Focus", "sessions", None, day("2024-01-01"), &rows, false)
            .await
            .unwrap();
        assert_eq!(table, "sessions_total");
    }

    assert_eq!(store.slice_len("sessions_total", day("2024-01-01"), "Focus"), 1);
    let stats = store.stats();
    assert_eq!(stats.deletes, 2);
    assert_eq!(stats.loads, 2);
    assert_eq!(stats.creates, 1);
}

#[tokio::test]
async fn append_keeps_other_apps_and_truncate_drops_them() {
    let store = CountingStore::new(Duration::ZERO);
    let pipeline = pipeline(&store, 50);
    let date = day("2024-01-01");

    pipeline
        .write("Klar", "crashes", None, date, &[int_row("2024-01-01", 1, None)], false)
        .await
        .unwrap();
    pipeline
        .write("Focus", "crashes", None, date, &[int_row("2024-01-01", 2, None)], false)
        .await
        .unwrap();
    assert_eq!(store.inner.rows("crashes_total").len(), 2);

    pipeline
        .write("Focus", "crashes", None, date, &[int_row("2024-01-01", 5, None)], true)
        .await
        .unwrap();
    assert_eq!(
        store.inner.rows("crashes_total"),
        vec![vec!["2024-01-01".to_string(), "Focus".to_string(), "5".to_string()]]
    );
    assert_eq!(
        store.modes(),
        vec![WriteMode::Append, WriteMode::Append, WriteMode::Truncate]
    );
}

#[tokio::test]
async fn dimension_rows_land_in_the_grouped_table() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, 50);
    let rows = [
        int_row("2024-01-01", 10, Some("Safari")),
        int_row("2024-01-01", 4, Some("Google")),
    ];
    let table = pipeline
        .write("Focus", "installs", Some("app_referrer"), day("2024-01-01"), &rows, false)
        .await
        .unwrap();
    assert_eq!(table, "installations_by_opt_in_app_referrer");
    assert_eq!(
        store.rows(&table)[1],
        vec!["2024-01-01", "Focus", "4", "Google"]
    );
}

#[tokio::test]
async fn empty_batch_only_ensures_the_table() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, 50);
    let table = pipeline
        .write("Focus", "units", Some("region"), day("2024-01-01"), &[], true)
        .await
        .unwrap();

    assert_eq!(table, "app_units_by_region");
    assert!(store.table(&table).is_some());
    let stats = store.stats();
    assert_eq!(stats.deletes, 0);
    assert_eq!(stats.loads, 0);
}

#[tokio::test]
async fn invalid_record_is_rejected_before_any_delete() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, 50);
    let rows = [int_row("2024-01-01", 1, Some("tab\there"))];
    let err = pipeline
        .write("Focus", "installs", Some("source"), day("2024-01-01"), &rows, false)
        .await
        .unwrap_err();

    assert!(matches!(err, LoadError::InvalidRecord { index: 0, .. }));
    assert_eq!(store.stats().deletes, 0);
    assert_eq!(pipeline.limiter().in_flight(), 0);
}

#[tokio::test]
async fn unknown_metric_is_a_registry_error() {
    let store = Arc::new(MemoryStore::new());
    let err = pipeline(&store, 50)
        .write("Focus", "downloads", None, day("2024-01-01"), &[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, LoadError::Registry(_)));
}

#[tokio::test]
async fn failed_job_releases_its_slot() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline(&store, 1);
    let rows = [int_row("2024-01-01", 1, None)];

    store.fail_jobs("backend error");
    let err = pipeline
        .write("Focus", "crashes", None, day("2024-01-01"), &rows, false)
        .await
        .unwrap_err();
    match &err {
        LoadError::JobFailed { table, .. } => assert_eq!(table, "crashes_total"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.to_string().contains("backend error"));
    assert_eq!(pipeline.limiter().in_flight(), 0);

    // The only permit is free again, so the next unit is not stuck behind the failure.
    let second = tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.write("Klar", "crashes", None, day("2024-01-01"), &rows, false),
    )
    .await
    .expect("permit was released");
    assert!(second.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_first_creation_is_not_an_error() {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(TableRegistry::new(Arc::clone(&store)));

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move { registry.ensure_table("payingUsers", Some("region")).await });
    }
    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.unwrap().unwrap().name, "paying_users_by_region");
    }
    assert_eq!(store.table_names(), vec!["paying_users_by_region"]);
}
