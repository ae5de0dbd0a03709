//! Integration tests for global and column search.

use proptest::prelude::*;
use uuid::Uuid;

use repokit::prelude::*;

use crate::helpers::{self, Item, TestApp, code_of, ids};

async fn search_ids(app: &TestApp, info: PagingInfo) -> AppResult<Vec<i32>> {
    let uow = app.uow();
    let page = uow.repository::<Item>().get_paged(Query::new(), &info).await?;
    Ok(ids(&page.items))
}

#[tokio::test]
async fn test_uuid_column_search_is_exact() {
    let app = TestApp::new();
    let garbled = PagingInfo::new(1, 50).with_search_term("code", "not-a-uuid");
    assert!(search_ids(&app, garbled).await.unwrap().is_empty());

    let unknown = PagingInfo::new(1, 50).with_search_term("code", Uuid::from_u128(7).to_string());
    assert!(search_ids(&app, unknown).await.unwrap().is_empty());

    let exact = PagingInfo::new(1, 50).with_search_term("Code", code_of(13).to_string());
    assert_eq!(search_ids(&app, exact).await.unwrap(), vec![13]);
}

#[tokio::test]
async fn test_column_search_across_relations() {
    let app = TestApp::new();
    let odd = PagingInfo::new(1, 50).with_search_term("Group.Name", "od");
    assert_eq!(search_ids(&app, odd).await.unwrap().len(), 13);

    let labelled = PagingInfo::new(1, 50).with_search_term("labels.text", "HEAV");
    assert_eq!(search_ids(&app, labelled).await.unwrap(), vec![1]);

    let combined = PagingInfo::new(1, 50)
        .with_search_term("name", "item-1")
        .with_search_term("rank", "0");
    assert_eq!(search_ids(&app, combined).await.unwrap(), vec![12, 15, 18]);

    let blank = PagingInfo::new(1, 50).with_search_term("name", "  ");
    assert_eq!(search_ids(&app, blank).await.unwrap().len(), 25);
}

#[tokio::test]
async fn test_bad_column_paths_are_rejected() {
    let app = TestApp::new();
    for column in ["colour", "group", "name.length"] {
        let info = PagingInfo::new(1, 10).with_search_term(column, "x");
        let err = search_ids(&app, info).await.unwrap_err();
        assert!(err.is(ErrorKind::Argument), "{column}");
    }

    let malformed = PagingInfo {
        search_term_json: Some("{oops".into()),
        ..PagingInfo::new(1, 10)
    };
    assert!(search_ids(&app, malformed).await.unwrap_err().is(ErrorKind::Argument));
}

#[tokio::test]
async fn test_global_search_matches_dates_and_numbers() {
    let app = TestApp::new();
    let released = PagingInfo::new(1, 50).with_global_search("2024-01-08");
    assert_eq!(search_ids(&app, released).await.unwrap(), vec![7]);

    let priced = PagingInfo::new(1, 50).with_global_search("19.00");
    assert_eq!(search_ids(&app, priced).await.unwrap(), vec![19]);
}

#[tokio::test]
async fn test_global_search_leaves_soft_deleted_rows_out() {
    let app = TestApp::new();
    let uow = app.uow();
    let items = uow.repository::<Item>();
    let doomed = items.get_by_id(21).await.unwrap().unwrap();
    items.soft_delete(&doomed).unwrap();
    uow.save_changes().await.unwrap();

    let info = PagingInfo::new(1, 50).with_global_search("ITEM-2");
    assert_eq!(search_ids(&app, info).await.unwrap(), vec![2, 20, 22, 23, 24, 25]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_global_search_finds_every_substring(n in 1i32..=25, start in 0usize..7, len in 1usize..5, upper in any::<bool>()) {
        let name = Item::numbered(n).name;
        let end = (start + len).min(name.len());
        prop_assume!(start < end);
        let needle = if upper { name[start..end].to_uppercase() } else { name[start..end].to_lowercase() };

        let app = TestApp::new();
        let found = helpers::block_on(search_ids(&app, PagingInfo::new(1, 50).with_global_search(needle))).unwrap();
        prop_assert!(found.contains(&n));
    }
}
