//! Partitioned event store scenarios (requires ORQ_DATABASE_URL; skips
//! otherwise).

use anyhow::Result;
use chrono::{TimeZone, Utc};
use orq_events::{append_event, get_events_by_type, NewEvent};
use serde_json::json;

fn ev(event_type: &str, ts: chrono::DateTime<Utc>, aggregate_id: &str) -> NewEvent {
    NewEvent {
        id: None,
        created_at: Some(ts),
        event_type: event_type.to_string(),
        event_source: "test-suite".to_string(),
        aggregate_id: aggregate_id.to_string(),
        aggregate_type: "job".to_string(),
        version: 1,
        data: Some(json!({"aggregate": aggregate_id})),
        metadata: None,
    }
}

#[tokio::test]
async fn query_returns_only_the_requested_day() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let event_type = orq_testkit::unique("partition-scenario");

    let day1 = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
    let day2 = Utc.with_ymd_and_hms(2024, 1, 16, 10, 0, 0).unwrap();

    for i in 0..3 {
        append_event(&pool, ev(&event_type, day1 + chrono::Duration::minutes(i), &format!("a{i}"))).await?;
    }
    for i in 0..2 {
        append_event(&pool, ev(&event_type, day2 + chrono::Duration::minutes(i), &format!("b{i}"))).await?;
    }

    let from = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 1, 15, 23, 59, 0).unwrap();
    let got = get_events_by_type(&pool, &event_type, from, to, 10).await?;

    assert_eq!(got.len(), 3, "only the 2024-01-15 events");
    assert!(got.iter().all(|e| e.partition_key == "20240115"));

    // Newest first.
    for w in got.windows(2) {
        assert!(w[0].created_at >= w[1].created_at);
    }
    Ok(())
}

#[tokio::test]
async fn nid_is_monotonic_in_append_order_within_a_partition() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let event_type = orq_testkit::unique("nid-scenario");
    let ts = Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap();

    let mut nids = Vec::new();
    for i in 0..5 {
        let stored = append_event(&pool, ev(&event_type, ts, &format!("agg{i}"))).await?;
        nids.push(stored.nid);
    }

    for w in nids.windows(2) {
        assert!(w[0] < w[1], "append order must imply nid order: {nids:?}");
    }
    Ok(())
}

#[tokio::test]
async fn appended_event_is_readable_within_one_page() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let event_type = orq_testkit::unique("roundtrip-scenario");
    let ts = Utc.with_ymd_and_hms(2024, 3, 5, 9, 30, 0).unwrap();

    let stored = append_event(&pool, ev(&event_type, ts, "agg")).await?;

    let from = Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 3, 5, 23, 0, 0).unwrap();
    let got = get_events_by_type(&pool, &event_type, from, to, 100).await?;

    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id, stored.id);
    assert_eq!(got[0].nid, stored.nid);
    assert_eq!(got[0].data, stored.data);
    Ok(())
}

#[tokio::test]
async fn duplicate_primary_key_is_rejected() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let event_type = orq_testkit::unique("dup-scenario");
    let ts = Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap();

    let mut first = ev(&event_type, ts, "agg");
    first.id = Some(uuid::Uuid::new_v4());
    let id = first.id;

    append_event(&pool, first.clone()).await?;
    let mut second = ev(&event_type, ts, "agg-second");
    second.id = id;
    let err = append_event(&pool, second).await.unwrap_err();
    assert!(matches!(err, orq_events::EventStoreError::AlreadyExists));
    Ok(())
}
