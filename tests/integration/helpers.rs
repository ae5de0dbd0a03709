//! Shared entities and fixtures for integration tests.

use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use repokit::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i32,
    pub name: String,
}

impl Reflect for Group {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Group")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub id: i32,
    pub item_id: i32,
    pub text: String,
}

impl Reflect for Label {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Label")
            .key("id", FieldKind::Int)
            .field("item_id", FieldKind::Int)
            .field("text", FieldKind::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i32,
    pub name: String,
    pub code: Uuid,
    pub rank: i32,
    pub price: Decimal,
    pub released: NaiveDate,
    pub group_id: Option<i32>,
    pub is_deleted: bool,
    #[serde(default)]
    pub group: Option<Group>,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl Item {
    /// Item number `n` of the standard fixture.
    pub fn numbered(n: i32) -> Self {
        Self {
            id: n,
            name: format!("Item-{n:02}"),
            code: code_of(n),
            rank: n % 3,
            price: Decimal::new(i64::from(n) * 100, 2),
            released: NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|day| day.checked_add_days(chrono::Days::new(u64::try_from(n).unwrap_or(0))))
                .unwrap_or_default(),
            group_id: Some(if n % 2 == 0 { 1 } else { 2 }),
            is_deleted: false,
            group: None,
            labels: Vec::new(),
        }
    }
}

impl Reflect for Item {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Item")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .field("code", FieldKind::Uuid)
            .field("rank", FieldKind::Int)
            .field("price", FieldKind::Decimal)
            .field("released", FieldKind::Date)
            .nullable("group_id", FieldKind::Int)
            .soft_delete("is_deleted")
            .reference::<Group>("group", "group_id")
            .collection::<Label>("labels", "item_id")
            .build()
    }
}

/// An entity without the soft-delete capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: i32,
    pub body: String,
}

impl Reflect for Note {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Note")
            .key("id", FieldKind::Int)
            .field("body", FieldKind::Text)
            .build()
    }
}

/// Projection target for item pages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ItemRow {
    pub title: String,
    pub group: Option<String>,
}

/// The projection producing [`ItemRow`]s.
pub fn item_rows() -> Projection {
    Projection::new().column("title", "name").column("group", "group.name")
}

/// Deterministic code of item `n`.
pub fn code_of(n: i32) -> Uuid {
    Uuid::from_u128(0x5eed_0000 + u128::try_from(n).unwrap_or(0))
}

/// Test database context.
pub struct TestApp {
    /// Shared in-memory database.
    pub database: Arc<MemoryDatabase>,
}

impl TestApp {
    /// Two groups, items `Item-01` to `Item-25`, two labels on item 1 and
    /// two notes.
    pub fn new() -> Self {
        Self::with_items(1..=25)
    }

    /// The standard groups and notes with the numbered items in `numbers`.
    pub fn with_items(numbers: impl IntoIterator<Item = i32>) -> Self {
        let database = MemoryDatabase::new();
        database
            .seed([
                Group {
                    id: 1,
                    name: "Even".into(),
                },
                Group {
                    id: 2,
                    name: "Odd".into(),
                },
            ])
            .expect("seed groups");
        database
            .seed(numbers.into_iter().map(Item::numbered))
            .expect("seed items");
        database
            .seed([
                Label {
                    id: 1,
                    item_id: 1,
                    text: "fragile".into(),
                },
                Label {
                    id: 2,
                    item_id: 1,
                    text: "heavy".into(),
                },
            ])
            .expect("seed labels");
        database
            .seed([
                Note {
                    id: 1,
                    body: "first".into(),
                },
                Note {
                    id: 2,
                    body: "second".into(),
                },
            ])
            .expect("seed notes");
        Self { database }
    }

    /// Items with the given ranks, numbered from 1.
    pub fn with_ranks(ranks: &[i32]) -> Self {
        let database = MemoryDatabase::new();
        database
            .seed(ranks.iter().zip(1..).map(|(rank, n)| Item {
                rank: *rank,
                ..Item::numbered(n)
            }))
            .expect("seed ranked items");
        Self { database }
    }

    /// A fresh unit of work over the database.
    pub fn uow(&self) -> UnitOfWork {
        UnitOfWork::memory(&self.database)
    }
}

/// Ids of a list of handles.
pub fn ids(items: &[Tracked<Item>]) -> Vec<i32> {
    items.iter().map(|item| item.read().id).collect()
}

/// Run an async block on a fresh runtime, for property tests.
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}
