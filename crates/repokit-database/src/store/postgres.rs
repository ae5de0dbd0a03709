//! PostgreSQL store.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use repokit_core::types::SortField;
use repokit_core::{AppError, AppResult, ErrorKind};
use repokit_entity::{EntityKey, EntitySchema, FieldDescriptor, FieldKind, Record, Value};
use repokit_query::path::resolve_field_path;
use repokit_query::projection::ProjectedColumn;
use repokit_query::sql::{self, SqlParam, SqlStatement};
use repokit_query::{Aggregate, Assignment, Expr, QueryPlan};

use super::{Change, Store, missing_row};
use crate::connection::DatabasePool;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Where a row's loaded relation went while the next level loads.
enum Slot {
    One,
    Many(usize),
    Empty,
}

/// A [`Store`] backed by a PostgreSQL pool.
///
/// Statements run inside the active transaction when there is one and on
/// the pool otherwise. [`Store::apply`] without an active transaction uses
/// a local one.
#[derive(Debug)]
pub struct PgStore {
    pool: PgPool,
    transaction: Mutex<Option<Transaction<'static, Postgres>>>,
    active: AtomicBool,
}

impl PgStore {
    /// A store over `pool`.
    pub fn new(pool: &DatabasePool) -> Self {
        Self {
            pool: pool.pool().clone(),
            transaction: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    async fn fetch_rows(&self, statement: &SqlStatement) -> AppResult<Vec<PgRow>> {
        let query = bind_all(sqlx::query(&statement.sql), &statement.params);
        let mut transaction = self.transaction.lock().await;
        let result = match transaction.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.pool).await,
        };
        result.map_err(|e| store_error("Failed to fetch rows", e))
    }

    async fn fetch_one(&self, statement: &SqlStatement) -> AppResult<PgRow> {
        let query = bind_all(sqlx::query(&statement.sql), &statement.params);
        let mut transaction = self.transaction.lock().await;
        let result = match transaction.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await,
            None => query.fetch_one(&self.pool).await,
        };
        result.map_err(|e| store_error("Failed to fetch row", e))
    }

    async fn execute(&self, statement: &SqlStatement) -> AppResult<u64> {
        let query = bind_all(sqlx::query(&statement.sql), &statement.params);
        let mut transaction = self.transaction.lock().await;
        let result = match transaction.as_mut() {
            Some(tx) => query.execute(&mut **tx).await,
            None => query.execute(&self.pool).await,
        };
        result
            .map(|done| done.rows_affected())
            .map_err(|e| store_error("Failed to execute statement", e))
    }

    async fn fetch_entities(&self, plan: &QueryPlan) -> AppResult<Vec<Record>> {
        let statement = sql::select(plan)?;
        let rows = self.fetch_rows(&statement).await?;
        rows.iter().map(|row| decode_record(plan.schema(), row)).collect()
    }

    /// Load the relation chain `segments` into `rows`, one query per level.
    /// Members that are already loaded are reused.
    fn load_include<'a>(
        &'a self,
        schema: &'a EntitySchema,
        rows: &'a mut [Record],
        segments: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some((head, rest)) = segments.split_first() else {
                return Ok(());
            };
            let relation = schema
                .relation(head)
                .ok_or_else(|| AppError::argument(format!("Unknown relation '{head}' on {}", schema.name())))?;
            let target = relation.target();
            let target_key = target.single_key()?.clone();

            let (lookup_field, source_field) = if relation.is_collection() {
                (relation.foreign_key.clone(), schema.single_key()?.name.clone())
            } else {
                (target_key.name.clone(), relation.foreign_key.clone())
            };

            let missing: Vec<Value> = rows
                .iter()
                .filter(|row| !is_loaded(row.get(&relation.name)))
                .filter_map(|row| row.get(&source_field).filter(|value| !value.is_null()).cloned())
                .collect();

            let mut groups: HashMap<String, Vec<Record>> = HashMap::new();
            if !missing.is_empty() {
                let mut plan = QueryPlan::new(Arc::clone(&target));
                plan.ignore_query_filters = true;
                plan.filters.push(Expr::In {
                    path: lookup_field.clone(),
                    values: missing,
                });
                plan.order = vec![SortField::asc(target_key.name.clone())];
                for record in self.fetch_entities(&plan).await? {
                    let group = record.get(&lookup_field).cloned().unwrap_or_default();
                    groups.entry(group_key(&group)).or_default().push(record);
                }
            }

            for row in rows.iter_mut() {
                if is_loaded(row.get(&relation.name)) {
                    continue;
                }
                let source = row.get(&source_field).cloned().unwrap_or_default();
                let matches = if source.is_null() {
                    Vec::new()
                } else {
                    groups.get(&group_key(&source)).cloned().unwrap_or_default()
                };
                let value = if relation.is_collection() {
                    Value::List(matches.into_iter().map(Value::Record).collect())
                } else {
                    matches.into_iter().next().map_or(Value::Null, Value::Record)
                };
                row.insert(relation.name.clone(), value);
            }

            if rest.is_empty() {
                return Ok(());
            }
            // Descend: pull the loaded members out, load the next level, put them back.
            let mut nested = Vec::new();
            let mut slots = Vec::with_capacity(rows.len());
            for row in rows.iter_mut() {
                match row.remove(&relation.name) {
                    Some(Value::Record(child)) => {
                        nested.push(child);
                        slots.push(Slot::One);
                    }
                    Some(Value::List(children)) => {
                        let before = nested.len();
                        nested.extend(children.into_iter().filter_map(|child| match child {
                            Value::Record(record) => Some(record),
                            _ => None,
                        }));
                        slots.push(Slot::Many(nested.len() - before));
                    }
                    _ => slots.push(Slot::Empty),
                }
            }
            self.load_include(&target, &mut nested, rest).await?;

            let mut loaded = nested.into_iter();
            for (row, slot) in rows.iter_mut().zip(slots) {
                let value = match slot {
                    Slot::One => loaded.next().map_or(Value::Null, Value::Record),
                    Slot::Many(count) => Value::List(loaded.by_ref().take(count).map(Value::Record).collect()),
                    Slot::Empty => Value::Null,
                };
                row.insert(relation.name.clone(), value);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetch(&self, plan: &QueryPlan) -> AppResult<Vec<Record>> {
        let schema = plan.schema();
        match &plan.projection {
            Some(projection) => {
                let statement = sql::select(plan)?;
                let columns = projection.source_fields(schema)?;
                let rows = self.fetch_rows(&statement).await?;
                debug!(table = schema.table(), rows = rows.len(), "Fetched projected rows");
                rows.iter().map(|row| decode_projected(row, &columns)).collect()
            }
            None => {
                let mut records = self.fetch_entities(plan).await?;
                for include in &plan.includes {
                    let segments: Vec<&str> = include.split('.').collect();
                    self.load_include(schema, &mut records, &segments).await?;
                }
                debug!(table = schema.table(), rows = records.len(), "Fetched rows");
                Ok(records)
            }
        }
    }

    async fn count(&self, plan: &QueryPlan) -> AppResult<u64> {
        let row = self.fetch_one(&sql::count(plan)?).await?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| store_error("Failed to read count", e))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn aggregate(&self, plan: &QueryPlan, function: Aggregate, field: &str) -> AppResult<Value> {
        let path = resolve_field_path(plan.schema(), field)?;
        let row = self
            .fetch_one(&sql::aggregate(plan, function, &path.canonical)?)
            .await?;
        let kind = match function {
            Aggregate::Max | Aggregate::Min => path.field.kind,
            Aggregate::Sum | Aggregate::Average => FieldKind::Decimal,
        };
        decode_value(&row, 0, kind).map_err(|e| store_error("Failed to read aggregate", e))
    }

    async fn apply(&self, changes: &[Change]) -> AppResult<u64> {
        let mut transaction = self.transaction.lock().await;
        let affected = match transaction.as_mut() {
            Some(tx) => apply_changes(&mut **tx, changes).await?,
            None => {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| store_error("Failed to begin transaction", e))?;
                let affected = apply_changes(&mut *tx, changes).await?;
                tx.commit()
                    .await
                    .map_err(|e| store_error("Failed to commit changes", e))?;
                affected
            }
        };
        debug!(changes = changes.len(), affected, "Applied changes");
        Ok(affected)
    }

    async fn delete_where(&self, plan: &QueryPlan) -> AppResult<u64> {
        self.execute(&sql::delete_where(plan)?).await
    }

    async fn update_where(&self, plan: &QueryPlan, assignments: &[Assignment]) -> AppResult<u64> {
        self.execute(&sql::update_where(plan, assignments)?).await
    }

    async fn begin(&self) -> AppResult<()> {
        let mut transaction = self.transaction.lock().await;
        if transaction.is_some() {
            return Err(AppError::invalid_operation("A transaction is already active"));
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_error("Failed to begin transaction", e))?;
        *transaction = Some(tx);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> AppResult<()> {
        let tx = self.take_transaction("commit").await?;
        tx.commit()
            .await
            .map_err(|e| store_error("Failed to commit transaction", e))
    }

    async fn rollback(&self) -> AppResult<()> {
        let tx = self.take_transaction("roll back").await?;
        tx.rollback()
            .await
            .map_err(|e| store_error("Failed to roll back transaction", e))
    }

    fn in_transaction(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl PgStore {
    async fn take_transaction(&self, action: &str) -> AppResult<Transaction<'static, Postgres>> {
        let tx = self.transaction.lock().await.take();
        self.active.store(false, Ordering::SeqCst);
        tx.ok_or_else(|| AppError::invalid_operation(format!("No active transaction to {action}")))
    }
}

async fn apply_changes(connection: &mut PgConnection, changes: &[Change]) -> AppResult<u64> {
    let mut affected = 0;
    for change in changes {
        let (statement, key) = match change {
            Change::Insert { schema, record } => (sql::insert(schema, record), None),
            Change::Update {
                schema,
                key,
                values,
            } => (sql::update(schema, key, values)?, Some(key)),
            Change::Delete { schema, key } => (sql::delete(schema, key)?, Some(key)),
        };
        let rows = bind_all(sqlx::query(&statement.sql), &statement.params)
            .execute(&mut *connection)
            .await
            .map_err(|e| store_error(&format!("Failed to {} {}", change.verb(), change.schema().name()), e))?
            .rows_affected();
        if let (0, Some(key)) = (rows, key) {
            return Err(missing_row(change.schema(), key));
        }
        affected += rows;
    }
    Ok(affected)
}

fn store_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::with_source(ErrorKind::StoreOperation, format!("{context}: {e}"), e)
}

fn is_loaded(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Record(_) | Value::List(_)))
}

fn group_key(value: &Value) -> String {
    EntityKey::single(value.clone()).canonical()
}

fn bind_all<'q>(query: PgQuery<'q>, params: &[SqlParam]) -> PgQuery<'q> {
    params.iter().fold(query, bind_param)
}

fn bind_param<'q>(query: PgQuery<'q>, param: &SqlParam) -> PgQuery<'q> {
    match (&param.value, param.kind) {
        (Value::Null, Some(kind)) => bind_null(query, kind),
        (Value::Null, None) => query.bind(None::<String>),
        (Value::Bool(flag), _) => query.bind(*flag),
        (Value::Int(number), Some(FieldKind::Int)) => match i32::try_from(*number) {
            Ok(narrow) => query.bind(narrow),
            Err(_) => query.bind(*number),
        },
        (Value::Int(number), _) => query.bind(*number),
        (Value::Float(number), _) => query.bind(*number),
        (Value::Decimal(number), _) => query.bind(*number),
        (Value::Text(text), _) => query.bind(text.clone()),
        (Value::Uuid(id), _) => query.bind(*id),
        (Value::Date(date), _) => query.bind(*date),
        (Value::DateTime(at), _) => query.bind(*at),
        (value @ (Value::Record(_) | Value::List(_)), _) => query.bind(value.to_json()),
    }
}

fn bind_null(query: PgQuery<'_>, kind: FieldKind) -> PgQuery<'_> {
    match kind {
        FieldKind::Text => query.bind(None::<String>),
        FieldKind::Int => query.bind(None::<i32>),
        FieldKind::BigInt => query.bind(None::<i64>),
        FieldKind::Float => query.bind(None::<f64>),
        FieldKind::Decimal => query.bind(None::<Decimal>),
        FieldKind::Bool => query.bind(None::<bool>),
        FieldKind::Uuid => query.bind(None::<Uuid>),
        FieldKind::Date => query.bind(None::<NaiveDate>),
        FieldKind::DateTime => query.bind(None::<DateTime<Utc>>),
    }
}

fn decode_record(schema: &EntitySchema, row: &PgRow) -> AppResult<Record> {
    schema
        .fields()
        .iter()
        .map(|field: &FieldDescriptor| {
            let value = decode_value(row, field.name.as_str(), field.kind)
                .map_err(|e| store_error(&format!("Failed to decode {}.{}", schema.name(), field.name), e))?;
            Ok((field.name.clone(), value))
        })
        .collect()
}

fn decode_projected(row: &PgRow, columns: &[(ProjectedColumn, FieldDescriptor)]) -> AppResult<Record> {
    columns
        .iter()
        .map(|(column, field)| {
            let value = decode_value(row, column.output.as_str(), field.kind)
                .map_err(|e| store_error(&format!("Failed to decode column {}", column.output), e))?;
            Ok((column.output.clone(), value))
        })
        .collect()
}

fn decode_value<I>(row: &PgRow, index: I, kind: FieldKind) -> Result<Value, sqlx::Error>
where
    I: sqlx::ColumnIndex<PgRow>,
{
    let value = match kind {
        FieldKind::Text => row.try_get::<Option<String>, _>(index)?.map(Value::Text),
        FieldKind::Int => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        FieldKind::BigInt => row.try_get::<Option<i64>, _>(index)?.map(Value::Int),
        FieldKind::Float => row.try_get::<Option<f64>, _>(index)?.map(Value::Float),
        FieldKind::Decimal => row.try_get::<Option<Decimal>, _>(index)?.map(Value::Decimal),
        FieldKind::Bool => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        FieldKind::Uuid => row.try_get::<Option<Uuid>, _>(index)?.map(Value::Uuid),
        FieldKind::Date => row.try_get::<Option<NaiveDate>, _>(index)?.map(Value::Date),
        FieldKind::DateTime => row.try_get::<Option<DateTime<Utc>>, _>(index)?.map(Value::DateTime),
    };
    Ok(value.unwrap_or_default())
}
