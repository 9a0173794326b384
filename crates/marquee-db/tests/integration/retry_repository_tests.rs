use chrono::{TimeDelta, Utc};
use marquee_core::error::AppError;
use marquee_core::retry::RetryItem;
use marquee_core::traits::RetryRepository;
use marquee_db::PgRetryRepository;
use uuid::Uuid;

use crate::common::setup_test_db;

fn item(task_id: &str, due_in_secs: i64) -> RetryItem {
    RetryItem::new(
        task_id,
        "metadata_search",
        r#"{"query":"Heat","media_type":"movie"}"#,
        5,
        Utc::now() + TimeDelta::seconds(due_in_secs),
    )
}

#[tokio::test]
async fn add_and_find_round_trip() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    let mut original = item("search:heat", 30);
    original.last_error = Some("Request timeout after 15s".into());
    assert!(repo.add(&original).await.unwrap());

    let stored = repo
        .find_by_id(original.id)
        .await
        .unwrap()
        .expect("item should exist");
    assert_eq!(stored.task_id, "search:heat");
    assert_eq!(stored.task_type, "metadata_search");
    assert_eq!(stored.payload, original.payload);
    assert_eq!(stored.attempt_count, 0);
    assert_eq!(stored.max_attempts, 5);
    assert_eq!(stored.last_error.as_deref(), Some("Request timeout after 15s"));

    let by_task = repo.find_by_task_id("search:heat").await.unwrap().unwrap();
    assert_eq!(by_task.id, original.id);
}

#[tokio::test]
async fn duplicate_task_id_is_not_inserted() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    assert!(repo.add(&item("dup", 0)).await.unwrap());
    assert!(!repo.add(&item("dup", 0)).await.unwrap());
    assert_eq!(repo.count().await.unwrap(), 1);
}

#[tokio::test]
async fn get_pending_returns_due_items_oldest_first() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    repo.add(&item("late", -10)).await.unwrap();
    repo.add(&item("early", -60)).await.unwrap();
    repo.add(&item("future", 600)).await.unwrap();

    let due = repo.get_pending(Utc::now(), 10).await.unwrap();
    let ids: Vec<_> = due.iter().map(|i| i.task_id.as_str()).collect();
    assert_eq!(ids, vec!["early", "late"]);

    let limited = repo.get_pending(Utc::now(), 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].task_id, "early");

    assert_eq!(repo.list(10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn update_persists_attempt_state() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    let mut stored = item("upd", -5);
    repo.add(&stored).await.unwrap();

    stored.attempt_count = 2;
    stored.last_error = Some("Rate limit exceeded".into());
    stored.next_attempt_at = Utc::now() + TimeDelta::minutes(5);
    repo.update(&stored).await.unwrap();

    let reloaded = repo.find_by_id(stored.id).await.unwrap().unwrap();
    assert_eq!(reloaded.attempt_count, 2);
    assert_eq!(reloaded.last_error.as_deref(), Some("Rate limit exceeded"));
    assert!(reloaded.next_attempt_at > Utc::now());
    assert!(reloaded.updated_at >= reloaded.created_at);
    assert!(repo.get_pending(Utc::now(), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_missing_item_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    let err = repo.update(&item("ghost", 0)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn delete_variants_and_clear() {
    let (pool, _container) = setup_test_db().await;
    let repo = PgRetryRepository::new(pool);

    let a = item("a", 0);
    repo.add(&a).await.unwrap();
    repo.add(&item("b", 0)).await.unwrap();
    repo.add(&item("c", 0)).await.unwrap();

    assert!(repo.delete(a.id).await.unwrap());
    assert!(!repo.delete(a.id).await.unwrap());
    assert!(!repo.delete(Uuid::new_v4()).await.unwrap());

    assert!(repo.delete_by_task_id("b").await.unwrap());
    assert!(!repo.delete_by_task_id("b").await.unwrap());
    assert_eq!(repo.count().await.unwrap(), 1);

    assert_eq!(repo.clear_all().await.unwrap(), 1);
    assert_eq!(repo.count().await.unwrap(), 0);
}
