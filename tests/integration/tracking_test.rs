//! Integration tests for the load, mutate in place, save contract.

use rust_decimal::Decimal;

use repokit::prelude::*;

use crate::helpers::{Item, ItemRow, Label, TestApp, item_rows};

#[tokio::test]
async fn test_tracked_edit_is_persisted_without_update_call() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let item = items.get_by_id(4).await.unwrap().unwrap();
    item.write().name = "Renamed".into();
    item.write().price = Decimal::new(4250, 2);
    assert_eq!(items.state(&item).unwrap(), EntityState::Modified);
    assert_eq!(uow.save_changes().await.unwrap(), 1);

    let fresh = app.uow();
    let reloaded = fresh.repository::<Item>().get_by_id(4).await.unwrap().unwrap();
    assert_eq!(reloaded.read().name, "Renamed");
    assert_eq!(reloaded.read().price, Decimal::new(4250, 2));
}

#[tokio::test]
async fn test_projected_rows_carry_no_identity() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let mut rows: Vec<ItemRow> = items
        .select(Query::filtered(col("id").eq(4)).select(item_rows()))
        .await
        .unwrap();
    rows[0].title = "Changed".into();

    assert!(!uow.has_changes().unwrap());
    assert_eq!(uow.save_changes().await.unwrap(), 0);
    let item = items.get_by_id(4).await.unwrap().unwrap();
    assert_eq!(item.read().name, "Item-04");
}

#[tokio::test]
async fn test_untracked_results_are_not_saved() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let loaded = items
        .find(Query::filtered(col("id").eq(5)).as_no_tracking())
        .await
        .unwrap();
    loaded[0].write().name = "Ghost".into();

    assert!(!items.is_tracked(&loaded[0]));
    assert_eq!(uow.save_changes().await.unwrap(), 0);

    let detached = items.get_by_id(6).await.unwrap().unwrap();
    assert!(items.detach(&detached));
    detached.write().name = "Also ghost".into();
    assert_eq!(uow.save_changes().await.unwrap(), 0);

    let fresh = app.uow();
    let names: Vec<String> = fresh
        .repository::<Item>()
        .get_by_ids([5, 6])
        .await
        .unwrap()
        .iter()
        .map(|item| item.read().name.clone())
        .collect();
    assert_eq!(names, vec!["Item-05".to_string(), "Item-06".to_string()]);
}

#[tokio::test]
async fn test_disconnected_update() {
    let app = TestApp::new();
    let uow = app.uow();
    let mut payload = Item::numbered(8);
    payload.name = "From request".into();
    uow.repository::<Item>().update_disconnected(payload).unwrap();
    uow.save_changes().await.unwrap();

    let fresh = app.uow();
    let item = fresh.repository::<Item>().get_by_id(8).await.unwrap().unwrap();
    assert_eq!(item.read().name, "From request");
}

#[tokio::test]
async fn test_included_children_are_diffed() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let first = items
        .get_with_includes(Some(col("id").eq(1)), &["labels", "group"])
        .await
        .unwrap()
        .remove(0);
    assert_eq!(first.read().labels.len(), 2);
    assert_eq!(first.read().group.as_ref().map(|g| g.name.as_str()), Some("Odd"));

    first.write().labels.retain(|label| label.text != "fragile");
    first.write().labels.push(Label {
        id: 3,
        item_id: 1,
        text: "boxed".into(),
    });
    uow.save_changes().await.unwrap();

    let fresh = app.uow();
    let mut texts: Vec<String> = fresh
        .repository::<Label>()
        .find(Query::filtered(col("item_id").eq(1)))
        .await
        .unwrap()
        .iter()
        .map(|label| label.read().text.clone())
        .collect();
    texts.sort();
    assert_eq!(texts, vec!["boxed".to_string(), "heavy".to_string()]);
}
