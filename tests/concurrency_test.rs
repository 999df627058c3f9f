//! Row cache consistency and commit latency under a multi-threaded runtime,
//! where tasks resume in arbitrary order after their writes commit.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{settings_table, TestFixture};
use futures::future::join_all;
use rowgate::query::Statement;
use rowgate::{Database, Error, Item, Table, Value, Where};

/// The raw stored value for `key`, bypassing every cache.
async fn stored(db: &Database, key: &str) -> Option<Item> {
    let rows = db
        .query(&format!("SELECT value FROM settings WHERE key = '{key}'"))
        .await
        .unwrap();
    rows.into_iter().next().map(|mut row| Item::Value(row.remove(0)))
}

async fn assert_cache_matches(db: &Database, settings: &Table, key: &str) {
    let cached = settings.get(key).await.unwrap();
    assert_eq!(cached, stored(db, key).await, "cached row for {key} went stale");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_updates_leave_cache_consistent() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;
    assert!(settings.is_cache_enabled());
    settings.set("k", "initial").await.unwrap();

    for round in 0..150 {
        settings.get("k").await.unwrap();
        let updates = (0..16).map(|n| {
            let settings = Arc::clone(&settings);
            tokio::spawn(async move {
                settings
                    .update([("value", format!("v{round}-{n}"))], Some(Where::eq("key", "k")))
                    .await
            })
        });
        for result in join_all(updates).await {
            assert_eq!(result.unwrap().unwrap(), 1);
        }
        assert_cache_matches(&db, &settings, "k").await;
    }
    db.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_mixed_key_writes_and_reads_leave_cache_consistent() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;
    let keys = ["a", "b", "c"];

    for round in 0..60 {
        let tasks = (0..24).map(|n| {
            let settings = Arc::clone(&settings);
            let key = keys[n % keys.len()];
            tokio::spawn(async move {
                match n % 4 {
                    0 | 1 => settings.set(key, format!("v{round}-{n}")).await,
                    2 => settings.remove(key).await.map(|_| ()),
                    _ => settings.get(key).await.map(|_| ()),
                }
            })
        });
        for result in join_all(tasks).await {
            match result.unwrap() {
                // Two sets racing on a missing key both try to insert.
                Ok(()) | Err(Error::Statement { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        for key in keys {
            assert_cache_matches(&db, &settings, key).await;
        }
    }
    db.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_tagged_execute_racing_reads_leaves_cache_consistent() {
    let fixture = TestFixture::new();
    let db = fixture.open().await;
    let settings = settings_table(&db).await;
    settings.set("k", "initial").await.unwrap();

    for round in 0..60 {
        let reads = (0..8).map(|_| {
            let settings = Arc::clone(&settings);
            tokio::spawn(async move { settings.get("k").await })
        });
        let reads: Vec<_> = reads.collect();
        let write = Statement::write(
            format!("UPDATE settings SET value = 'raw{round}' WHERE key = 'k'"),
            BTreeSet::from(["settings".to_string()]),
        );
        assert_eq!(db.execute(write).await.unwrap().affected(), 1);
        for read in join_all(reads).await {
            read.unwrap().unwrap();
        }
        assert_eq!(
            settings.get("k").await.unwrap(),
            Some(Item::Value(Value::from(format!("raw{round}"))))
        );
        assert_cache_matches(&db, &settings, "k").await;
    }
    db.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_steady_trickle_commits_within_window() {
    let fixture = TestFixture::new();
    let mut config = fixture.config();
    config.batch_window_ms = 250;
    let db = fixture.open_with(config).await;
    let settings = settings_table(&db).await;

    let mut writers = Vec::new();
    for n in 0..40 {
        let settings = Arc::clone(&settings);
        writers.push(tokio::spawn(async move {
            let started = Instant::now();
            settings.set(format!("k{n}"), "x").await?;
            Ok::<_, Error>(started.elapsed())
        }));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let window = Duration::from_millis(250);
    for writer in join_all(writers).await {
        let latency = writer.unwrap().unwrap();
        assert!(latency < window * 2, "write waited {latency:?}");
    }
    let count = db.query("SELECT COUNT(*) FROM settings").await.unwrap();
    assert_eq!(count, vec![vec![Value::Int(40)]]);
    db.close().await;
}
