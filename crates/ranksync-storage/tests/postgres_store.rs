//! Runs against a live database only when `DATABASE_URL` is set.

use chrono::{TimeZone, Utc};
use ranksync_core::{AthleteDetail, AthleteWrite, Category};
use ranksync_storage::{AthleteStore, PgAthleteStore, UpsertOutcome};
use uuid::Uuid;

async fn pg_store() -> Option<PgAthleteStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL unset, skipping postgres store test");
        return None;
    };
    let store = PgAthleteStore::connect(&url, 2).await.expect("connect");
    store.migrate().await.expect("migrate");
    Some(store)
}

// fresh category and ids per test so reruns against one database stay isolated
fn scratch_category() -> Category {
    Category {
        category_id: format!("it-{}", Uuid::new_v4()),
        event: "marathon".into(),
        gender: "men".into(),
        ranking_source: "world_marathon".into(),
        limit: 100,
        enabled: true,
    }
}

fn athlete(category: &Category, id: &str, rank: i32, name: &str) -> AthleteWrite {
    let mut detail = AthleteDetail::new(id);
    detail.name = Some(name.to_string());
    let fetched_at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts");
    AthleteWrite::from_detail(&detail, category, rank, fetched_at)
}

#[tokio::test]
async fn conditional_upsert_writes_only_real_changes() {
    let Some(store) = pg_store().await else {
        return;
    };
    let category = scratch_category();
    let id = format!("{}-A", category.category_id);

    let first = store
        .commit_batch(&[athlete(&category, &id, 5, "Runner")])
        .await
        .expect("insert");
    let repeat = store
        .commit_batch(&[athlete(&category, &id, 5, "Runner")])
        .await
        .expect("repeat");
    let moved = store
        .commit_batch(&[athlete(&category, &id, 7, "Runner")])
        .await
        .expect("rank move");
    let renamed = store
        .commit_batch(&[athlete(&category, &id, 7, "Runner Jr")])
        .await
        .expect("content change");

    assert_eq!(first, vec![UpsertOutcome::Inserted]);
    assert_eq!(repeat, vec![UpsertOutcome::Unchanged]);
    assert_eq!(moved, vec![UpsertOutcome::Updated]);
    assert_eq!(renamed, vec![UpsertOutcome::Updated]);

    let snapshot = store.load_snapshot(&[id.clone()]).await.expect("snapshot");
    let row = &snapshot[&id];
    assert_eq!(row.rank, Some(7));
    assert_eq!(
        row.content_hash.as_deref(),
        Some(athlete(&category, &id, 7, "Runner Jr").content_hash.as_str())
    );
}

#[tokio::test]
async fn drop_marking_only_clears_absent_rows_inside_window() {
    let Some(store) = pg_store().await else {
        return;
    };
    let category = scratch_category();
    let kept = format!("{}-A", category.category_id);
    let gone = format!("{}-B", category.category_id);
    let outside = format!("{}-C", category.category_id);
    store
        .commit_batch(&[
            athlete(&category, &kept, 5, "Kept"),
            athlete(&category, &gone, 40, "Gone"),
            athlete(&category, &outside, 150, "Outside"),
        ])
        .await
        .expect("seed");
    let current = vec![kept.clone()];

    assert_eq!(store.count_droppable(&category, &current).await.expect("count"), 1);
    assert_eq!(store.mark_dropped(&category, &current).await.expect("mark"), 1);
    assert_eq!(store.mark_dropped(&category, &current).await.expect("again"), 0);

    let ids = vec![kept.clone(), gone.clone(), outside.clone()];
    let snapshot = store.load_snapshot(&ids).await.expect("snapshot");
    assert!(snapshot[&kept].last_seen_at.is_some());
    assert!(snapshot[&gone].last_seen_at.is_none());
    assert!(snapshot[&outside].last_seen_at.is_some());

    let back = vec![kept.clone(), gone.clone()];
    let restored = store
        .restore_markers(&category, &back, Utc::now())
        .await
        .expect("restore");
    assert_eq!(restored, 1);
    let snapshot = store.load_snapshot(&ids).await.expect("snapshot");
    assert!(snapshot[&gone].last_seen_at.is_some());
    assert_eq!(snapshot[&gone].rank, Some(40));
}
