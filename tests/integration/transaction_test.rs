//! Integration tests for transactions and save error translation.

use std::error::Error;

use repokit::prelude::*;

use crate::helpers::{Item, Note, TestApp};

#[tokio::test]
async fn test_rollback_restores_previous_state() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let notes = uow.repository::<Note>();
    let before = items.long_count(None).await.unwrap();
    let had_third_note = notes.any(Some(col("id").eq(3))).await.unwrap();

    uow.begin_transaction().await.unwrap();
    items.add_range((26..=30).map(Item::numbered)).unwrap();
    let doomed = items.get_by_id(1).await.unwrap().unwrap();
    items.remove(&doomed).unwrap();
    notes
        .add(Note {
            id: 3,
            body: "third".into(),
        })
        .unwrap();
    uow.save_changes().await.unwrap();
    assert_eq!(items.long_count(None).await.unwrap(), before + 4);

    uow.rollback().await.unwrap();
    assert_eq!(items.long_count(None).await.unwrap(), before);
    assert_eq!(notes.any(Some(col("id").eq(3))).await.unwrap(), had_third_note);
    assert_eq!(app.database.row_count("item"), 25);
}

#[tokio::test]
async fn test_commit_publishes_changes() {
    let app = TestApp::new();
    let uow = app.uow();
    uow.begin_transaction().await.unwrap();
    uow.repository::<Note>()
        .add(Note {
            id: 9,
            body: "kept".into(),
        })
        .unwrap();
    uow.save_changes().await.unwrap();

    let outsider = app.uow();
    assert!(!outsider.repository::<Note>().exists(col("id").eq(9)).await.unwrap());

    uow.commit().await.unwrap();
    assert!(outsider.repository::<Note>().exists(col("id").eq(9)).await.unwrap());
}

#[tokio::test]
async fn test_failed_save_is_translated_and_atomic() {
    let app = TestApp::new();
    let uow = app.uow();
    let notes = uow.repository::<Note>();
    notes
        .add(Note {
            id: 10,
            body: "new".into(),
        })
        .unwrap();
    notes
        .add(Note {
            id: 1,
            body: "duplicate".into(),
        })
        .unwrap();

    let err = uow.save_changes().await.unwrap_err();
    assert!(err.is(ErrorKind::StoreOperation));
    assert!(err.source().is_some());
    assert_eq!(app.database.row_count("note"), 2);
    assert!(uow.has_changes().unwrap());
}

#[tokio::test]
async fn test_batch_operations_skip_the_tracker() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let updated = items
        .update_where(col("rank").eq(0), &[Assignment::set("name", "bulk")])
        .await
        .unwrap();
    assert_eq!(updated, 8);
    assert!(!uow.has_changes().unwrap());
    assert_eq!(items.count(Some(col("name").eq("bulk"))).await.unwrap(), 8);

    let deleted = items.delete_where(col("name").eq("bulk")).await.unwrap();
    assert_eq!(deleted, 8);
    assert_eq!(app.database.row_count("item"), 17);
}

#[tokio::test]
async fn test_cancelled_call_leaves_unit_of_work_usable() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let token = CancellationToken::new();
    let scoped = items.with_cancellation(token.clone());
    token.cancel();
    let err = scoped.get_by_id(3).await.unwrap_err();
    assert!(err.is(ErrorKind::Cancelled));

    uow.cancel();
    let err = items.get_by_id(3).await.unwrap_err();
    assert!(err.is(ErrorKind::Cancelled));

    let item = items.get_by_id(3).await.unwrap().unwrap();
    item.write().name = "After cancel".into();
    assert_eq!(uow.save_changes().await.unwrap(), 1);
    assert_eq!(app.database.row_count("item"), 25);
}
