//! Lease lifecycle scenarios (requires ORQ_DATABASE_URL; skips otherwise).

use anyhow::Result;
use chrono::Duration;
use orq_queue::{
    assign_pending_job, create_job, mark_job_done, mark_job_failed, pending_jobs,
    reclaim_expired_leases, NewJob, QueueError, RetryCaps,
};
use serde_json::json;

fn new_job(task_type: &str) -> NewJob {
    NewJob {
        id: None,
        task_type: task_type.to_string(),
        payload: json!({"body": "work"}),
        scheduled_for: None,
        valid_until: None,
    }
}

#[tokio::test]
async fn second_leaser_gets_no_job_then_reclaims_after_expiry() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let task_type = orq_testkit::unique("text-plain");
    let caps = RetryCaps::default();

    let created = create_job(&pool, &new_job(&task_type)).await?;

    let leased = assign_pending_job(&pool, "w1", Duration::seconds(2), &[&task_type]).await?;
    assert_eq!(leased.id, created.id);
    assert_eq!(leased.leaser.as_deref(), Some("w1"));

    // The lease is exclusive: a second worker sees nothing.
    let err = assign_pending_job(&pool, "w2", Duration::seconds(2), &[&task_type])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NoJob));

    // After expiry + reclamation the job is pending again with retry_count 1.
    tokio::time::sleep(std::time::Duration::from_millis(2_100)).await;
    let reclaimed = reclaim_expired_leases(&pool, &caps).await?;
    assert!(reclaimed >= 1);

    let retried = assign_pending_job(&pool, "w2", Duration::seconds(2), &[&task_type]).await?;
    assert_eq!(retried.id, created.id);
    assert_eq!(retried.retry_count, 1);
    assert_eq!(retried.leaser.as_deref(), Some("w2"));

    mark_job_done(&pool, retried.id, "w2").await?;
    Ok(())
}

#[tokio::test]
async fn done_with_wrong_leaser_is_lease_stolen() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let task_type = orq_testkit::unique("guarded");

    let created = create_job(&pool, &new_job(&task_type)).await?;
    let leased = assign_pending_job(&pool, "owner", Duration::seconds(30), &[&task_type]).await?;
    assert_eq!(leased.id, created.id);

    let err = mark_job_done(&pool, created.id, "intruder").await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseStolen { .. }));

    // The rightful owner still completes.
    mark_job_done(&pool, created.id, "owner").await?;

    // And a second completion reports the job gone.
    let err = mark_job_done(&pool, created.id, "owner").await.unwrap_err();
    assert!(matches!(err, QueueError::NotFound));
    Ok(())
}

#[tokio::test]
async fn failure_past_cap_dead_letters_with_envelope() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let task_type = orq_testkit::unique("flaky");
    let caps = RetryCaps::new(1);

    let created = create_job(&pool, &new_job(&task_type)).await?;

    // First failure: requeued (retry_count 1 == cap).
    let leased = assign_pending_job(&pool, "w", Duration::seconds(30), &[&task_type]).await?;
    mark_job_failed(&pool, leased.id, "w", &caps).await?;
    let retried = assign_pending_job(&pool, "w", Duration::seconds(30), &[&task_type]).await?;
    assert_eq!(retried.retry_count, 1);

    // Second failure exceeds the cap: the job leaves its type entirely.
    mark_job_failed(&pool, retried.id, "w", &caps).await?;
    let err = assign_pending_job(&pool, "w", Duration::seconds(30), &[&task_type])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NoJob));

    // The dead-letter queue is shared state; earlier runs may have left
    // rows behind. Lease until our job surfaces (foreign leases lapse on
    // their own).
    let mut dead = None;
    for _ in 0..50 {
        match assign_pending_job(
            &pool,
            "reaper",
            Duration::seconds(30),
            &[orq_queue::DEAD_LETTER_TASK_TYPE],
        )
        .await
        {
            Ok(job) if job.id == created.id => {
                dead = Some(job);
                break;
            }
            Ok(_) => continue,
            Err(QueueError::NoJob) => break,
            Err(e) => return Err(e.into()),
        }
    }
    let dead = dead.expect("our dead-lettered job is leasable");
    assert_eq!(dead.payload["task_type"], json!(task_type));
    assert_eq!(dead.payload["payload"]["body"], json!("work"));

    mark_job_done(&pool, dead.id, "reaper").await?;
    Ok(())
}

#[tokio::test]
async fn scheduled_jobs_are_invisible_until_due() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let task_type = orq_testkit::unique("deferred");

    let mut req = new_job(&task_type);
    req.scheduled_for = Some(chrono::Utc::now() + Duration::hours(1));
    create_job(&pool, &req).await?;

    let err = assign_pending_job(&pool, "w", Duration::seconds(5), &[&task_type])
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NoJob));

    // Still listed as pending.
    let listed = pending_jobs(&pool, None, 1_000).await?;
    assert!(listed.iter().any(|j| j.task_type == task_type));
    Ok(())
}

#[tokio::test]
async fn fifo_order_within_a_task_type() -> Result<()> {
    let Some(pool) = orq_testkit::maybe_db_pool().await? else {
        return Ok(());
    };
    let task_type = orq_testkit::unique("fifo");

    let first = create_job(&pool, &new_job(&task_type)).await?;
    let second = create_job(&pool, &new_job(&task_type)).await?;

    let a = assign_pending_job(&pool, "w", Duration::seconds(30), &[&task_type]).await?;
    let b = assign_pending_job(&pool, "w", Duration::seconds(30), &[&task_type]).await?;
    assert_eq!(a.id, first.id, "oldest pending job first");
    assert_eq!(b.id, second.id);

    mark_job_done(&pool, a.id, "w").await?;
    mark_job_done(&pool, b.id, "w").await?;
    Ok(())
}
