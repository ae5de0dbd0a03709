//! Entity types and a seeded catalog shared by the database crate tests.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use repokit_entity::{AuditFields, EntitySchema, FieldKind, Reflect};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::store::MemoryDatabase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: i32,
    pub name: String,
}

impl Reflect for Category {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Category")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: i32,
    pub product_id: i32,
    pub label: String,
}

impl Tag {
    pub fn new(id: i32, product_id: i32, label: &str) -> Self {
        Self {
            id,
            product_id,
            label: label.to_string(),
        }
    }
}

impl Reflect for Tag {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Tag")
            .key("id", FieldKind::Int)
            .field("product_id", FieldKind::Int)
            .field("label", FieldKind::Text)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: i32,
    pub name: String,
    pub price: Decimal,
    pub category_id: Option<i32>,
    pub is_deleted: bool,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Product {
    pub fn sample(id: i32, name: &str, price: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            price: Decimal::from_str(price).unwrap(),
            category_id: None,
            is_deleted: false,
            category: None,
            tags: Vec::new(),
        }
    }

    fn in_category(mut self, category_id: i32) -> Self {
        self.category_id = Some(category_id);
        self
    }
}

impl Reflect for Product {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Product")
            .key("id", FieldKind::Int)
            .field("name", FieldKind::Text)
            .field("price", FieldKind::Decimal)
            .nullable("category_id", FieldKind::Int)
            .soft_delete("is_deleted")
            .reference::<Category>("category", "category_id")
            .collection::<Tag>("tags", "product_id")
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i32,
    pub status: String,
    pub created_by: Option<String>,
    pub created_on: Option<DateTime<Utc>>,
    pub modified_by: Option<String>,
    pub modified_on: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn new(id: i32, status: &str) -> Self {
        Self {
            id,
            status: status.to_string(),
            created_by: None,
            created_on: None,
            modified_by: None,
            modified_on: None,
        }
    }
}

impl Reflect for Invoice {
    fn describe() -> EntitySchema {
        EntitySchema::builder("Invoice")
            .key("id", FieldKind::Int)
            .field("status", FieldKind::Text)
            .nullable("created_by", FieldKind::Text)
            .nullable("created_on", FieldKind::DateTime)
            .nullable("modified_by", FieldKind::Text)
            .nullable("modified_on", FieldKind::DateTime)
            .auditable(AuditFields::default())
            .build()
    }
}

/// Two categories, five products (the last one soft-deleted) and three
/// tags on the first two products.
pub fn catalog() -> Arc<MemoryDatabase> {
    let database = MemoryDatabase::new();
    database
        .seed([
            Category {
                id: 1,
                name: "Garden".into(),
            },
            Category {
                id: 2,
                name: "Tools".into(),
            },
        ])
        .unwrap();

    let mut axe = Product::sample(5, "Old Axe", "7.00");
    axe.is_deleted = true;
    database
        .seed([
            Product::sample(1, "Rake", "2.00").in_category(1),
            Product::sample(2, "Shovel", "5.00").in_category(1),
            Product::sample(3, "Hammer", "9.00").in_category(2),
            Product::sample(4, "Saw", "2.50").in_category(2),
            axe,
        ])
        .unwrap();

    database
        .seed([
            Tag::new(1, 1, "sale"),
            Tag::new(2, 1, "red"),
            Tag::new(3, 2, "blue"),
        ])
        .unwrap();
    database
}
