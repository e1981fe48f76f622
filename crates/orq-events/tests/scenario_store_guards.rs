//! Store guard rails: required fields, inverted ranges, raw-event nid.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use orq_events::{
    append_event, append_raw_event, delete_events_by_type_in_range, EventStoreError, NewEvent,
    NewRawEvent,
};
use serde_json::json;

#[tokio::test]
async fn empty_event_type_is_rejected_before_any_sql() -> Result<()> {
    // A lazy pool never connects: proves the guard fires pre-query.
    let pool = orq_db::connect_lazy("postgres://unused@localhost:1/none")?;

    let err = append_event(
        &pool,
        NewEvent {
            id: None,
            created_at: None,
            event_type: "   ".to_string(),
            event_source: "test-suite".to_string(),
            aggregate_id: "a".to_string(),
            aggregate_type: "t".to_string(),
            version: 0,
            data: None,
            metadata: None,
        },
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EventStoreError::EventTypeRequired));
    Ok(())
}

#[tokio::test]
async fn inverted_delete_range_is_rejected_before_any_sql() -> Result<()> {
    let pool = orq_db::connect_lazy("postgres://unused@localhost:1/none")?;

    let from = Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let err = delete_events_by_type_in_range(&pool, "anything", from, to)
        .await
        .unwrap_err();

    assert!(matches!(err, EventStoreError::InvalidRange { .. }));
    Ok(())
}

#[tokio::test]
async fn raw_event_append_returns_generated_nid() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };

    let first = append_raw_event(
        &pool,
        NewRawEvent {
            path: "/webhooks/github".to_string(),
            headers: json!({"x-github-event": "issue_comment"}),
            payload: Some(json!({"action": "created"})),
        },
    )
    .await?;
    assert!(first.nid > 0);

    let second = append_raw_event(
        &pool,
        NewRawEvent {
            path: "/webhooks/github".to_string(),
            headers: json!({}),
            payload: None,
        },
    )
    .await?;
    assert!(second.nid > first.nid);
    Ok(())
}

#[tokio::test]
async fn delete_removes_only_the_typed_rows_in_range() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let keep_type = orq_testkit::unique("keep");
    let drop_type = orq_testkit::unique("drop");
    let ts = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();

    for (t, agg) in [(&keep_type, "k"), (&drop_type, "d1"), (&drop_type, "d2")] {
        append_event(
            &pool,
            NewEvent {
                id: None,
                created_at: Some(ts),
                event_type: t.to_string(),
                event_source: "test-suite".to_string(),
                aggregate_id: agg.to_string(),
                aggregate_type: "x".to_string(),
                version: 0,
                data: None,
                metadata: None,
            },
        )
        .await?;
    }

    let from = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
    let to = Utc.with_ymd_and_hms(2024, 5, 10, 23, 0, 0).unwrap();
    let removed = delete_events_by_type_in_range(&pool, &drop_type, from, to).await?;
    assert_eq!(removed, 2);

    let kept = orq_events::get_events_by_type(&pool, &keep_type, from, to, 10).await?;
    assert_eq!(kept.len(), 1);
    Ok(())
}
