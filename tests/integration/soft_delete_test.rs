//! Integration tests for soft delete versus hard delete.

use repokit::prelude::*;

use crate::helpers::{Item, Note, TestApp};

#[tokio::test]
async fn test_soft_delete_hides_but_keeps_the_row() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let item = items.get_by_id(3).await.unwrap().unwrap();
    items.soft_delete(&item).unwrap();
    uow.save_changes().await.unwrap();

    let fresh = app.uow();
    let items = fresh.repository::<Item>();
    assert!(items.get_by_id(3).await.unwrap().is_none());
    assert_eq!(items.long_count(None).await.unwrap(), 24);
    let hidden = items
        .find(Query::filtered(col("id").eq(3)).ignore_query_filters())
        .await
        .unwrap();
    assert_eq!(hidden.len(), 1);
    assert!(hidden[0].read().is_deleted);
    assert_eq!(app.database.row_count("item"), 25);

    items.restore(&hidden[0]).unwrap();
    fresh.save_changes().await.unwrap();
    assert!(items.exists(col("id").eq(3)).await.unwrap());
}

#[tokio::test]
async fn test_soft_delete_range_on_untracked_entities() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let loaded = items
        .find(Query::filtered(col("id").le(3)).as_no_tracking())
        .await
        .unwrap();
    items.soft_delete_range(&loaded).unwrap();
    uow.save_changes().await.unwrap();
    assert_eq!(items.long_count(None).await.unwrap(), 22);
}

#[tokio::test]
async fn test_soft_delete_requires_the_capability() {
    let app = TestApp::new();
    let uow = app.uow();
    let notes = uow.repository::<Note>();
    let note = notes.get_by_id(1).await.unwrap().unwrap();

    let err = notes.soft_delete(&note).unwrap_err();
    assert!(err.is(ErrorKind::CapabilityMismatch));
    let err = notes.restore(&note).unwrap_err();
    assert!(err.is(ErrorKind::CapabilityMismatch));
    assert!(!uow.has_changes().unwrap());
    assert_eq!(uow.save_changes().await.unwrap(), 0);
    assert_eq!(app.database.row_count("note"), 2);
}

#[tokio::test]
async fn test_hard_delete_removes_the_row() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    assert!(items.remove_by_id(2).await.unwrap());
    assert!(!items.remove_by_id(99).await.unwrap());
    uow.save_changes().await.unwrap();

    assert_eq!(app.database.row_count("item"), 24);
    let everything = items.find(Query::new().ignore_query_filters()).await.unwrap();
    assert_eq!(everything.len(), 24);
}
