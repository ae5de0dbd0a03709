//! In-process store.
//!
//! Tables are ordered maps from canonical key to scalar record, shared
//! between stores through an `Arc<MemoryDatabase>`. Predicates run
//! through the expression evaluator with relations resolved by foreign
//! key on the fly. Writes are copy-on-write, so a failed batch leaves the
//! tables untouched.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::debug;

use repokit_core::types::{SortDirection, SortField};
use repokit_core::{AppError, AppResult};
use repokit_entity::{Entity, EntityKey, EntitySchema, Record, RelationDescriptor, Value};
use repokit_query::eval::{evaluate, read_path};
use repokit_query::path::resolve_field_path;
use repokit_query::projection::Projection;
use repokit_query::{Aggregate, Assignment, QueryPlan, RelationResolver};

use super::{Change, Store, missing_row};

type Table = IndexMap<String, Record>;
type Tables = HashMap<String, Table>;

/// Shared in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A store over this database with its own transaction slot.
    pub fn store(self: &Arc<Self>) -> MemoryStore {
        MemoryStore {
            database: Arc::clone(self),
            transaction: Mutex::new(None),
        }
    }

    /// Insert entities directly, bypassing any session.
    pub fn seed<T: Entity>(&self, entities: impl IntoIterator<Item = T>) -> AppResult<usize> {
        let schema = T::schema();
        let mut tables = self.tables.write();
        let mut working = tables.clone();
        let mut inserted = 0;
        for entity in entities {
            insert_row(&mut working, &schema, &entity.to_record()?)?;
            inserted += 1;
        }
        *tables = working;
        Ok(inserted)
    }

    /// Number of committed rows in `table`, soft-deleted rows included.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, IndexMap::len)
    }
}

/// A [`Store`] over a [`MemoryDatabase`].
///
/// A transaction works on a private copy of all tables. Commit replaces
/// the shared tables with the copy, so the last committer wins; rollback
/// discards it.
#[derive(Debug)]
pub struct MemoryStore {
    database: Arc<MemoryDatabase>,
    transaction: Mutex<Option<Tables>>,
}

impl MemoryStore {
    /// The shared database.
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.database
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let transaction = self.transaction.lock();
        match transaction.as_ref() {
            Some(tables) => f(tables),
            None => f(&self.database.tables.read()),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> AppResult<R>) -> AppResult<R> {
        let mut transaction = self.transaction.lock();
        match transaction.as_mut() {
            Some(tables) => commit_on_success(tables, f),
            None => commit_on_success(&mut self.database.tables.write(), f),
        }
    }
}

fn commit_on_success<R>(tables: &mut Tables, f: impl FnOnce(&mut Tables) -> AppResult<R>) -> AppResult<R> {
    let mut working = tables.clone();
    let result = f(&mut working)?;
    *tables = working;
    Ok(result)
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch(&self, plan: &QueryPlan) -> AppResult<Vec<Record>> {
        self.read(|tables| {
            let schema = plan.schema();
            let rows = select_rows(tables, plan);
            debug!(table = schema.table(), rows = rows.len(), "Fetched rows");
            match &plan.projection {
                Some(projection) => Ok(rows
                    .iter()
                    .map(|row| project(tables, schema, row, projection))
                    .collect()),
                None => Ok(rows
                    .into_iter()
                    .map(|mut row| {
                        for include in &plan.includes {
                            let segments: Vec<&str> = include.split('.').collect();
                            load_include(tables, schema, &mut row, &segments);
                        }
                        row
                    })
                    .collect()),
            }
        })
    }

    async fn count(&self, plan: &QueryPlan) -> AppResult<u64> {
        let count = self.read(|tables| select_rows(tables, &plan.for_count()).len());
        Ok(count as u64)
    }

    async fn aggregate(&self, plan: &QueryPlan, function: Aggregate, field: &str) -> AppResult<Value> {
        let path = resolve_field_path(plan.schema(), field)?;
        let values: Vec<Value> = self.read(|tables| {
            let resolver = TableResolver { tables };
            select_rows(tables, &plan.for_count())
                .iter()
                .map(|row| read_path(plan.schema(), row, &path.canonical, &resolver))
                .filter(|value| !value.is_null())
                .collect()
        });
        match function {
            Aggregate::Max => Ok(values.into_iter().max_by(Value::compare).unwrap_or_default()),
            Aggregate::Min => Ok(values.into_iter().min_by(Value::compare).unwrap_or_default()),
            Aggregate::Sum | Aggregate::Average => {
                let count = values.len();
                let mut sum = Decimal::ZERO;
                for value in &values {
                    let number = value.as_decimal().ok_or_else(|| {
                        AppError::argument(format!(
                            "Cannot aggregate non-numeric member '{}'",
                            path.canonical
                        ))
                    })?;
                    sum += number;
                }
                if function == Aggregate::Sum || count == 0 {
                    return Ok(Value::Decimal(sum));
                }
                Ok(Value::Decimal(sum / Decimal::from(count as u64)))
            }
        }
    }

    async fn apply(&self, changes: &[Change]) -> AppResult<u64> {
        let affected = self.write(|tables| {
            for change in changes {
                match change {
                    Change::Insert { schema, record } => insert_row(tables, schema, record)?,
                    Change::Update {
                        schema,
                        key,
                        values,
                    } => {
                        let row = find_row(tables, schema, key)?;
                        for (name, value) in values {
                            row.insert(name.clone(), value.clone());
                        }
                    }
                    Change::Delete { schema, key } => {
                        let canonical = key.clone().coerce(schema)?.canonical();
                        tables
                            .get_mut(schema.table())
                            .and_then(|table| table.shift_remove(&canonical))
                            .ok_or_else(|| missing_row(schema, key))?;
                    }
                }
            }
            Ok(changes.len() as u64)
        })?;
        debug!(changes = changes.len(), "Applied changes");
        Ok(affected)
    }

    async fn delete_where(&self, plan: &QueryPlan) -> AppResult<u64> {
        let schema = plan.schema();
        self.write(|tables| {
            let keys = matching_keys(tables, plan)?;
            if let Some(table) = tables.get_mut(schema.table()) {
                for key in &keys {
                    table.shift_remove(key);
                }
            }
            Ok(keys.len() as u64)
        })
    }

    async fn update_where(&self, plan: &QueryPlan, assignments: &[Assignment]) -> AppResult<u64> {
        if assignments.is_empty() {
            return Err(AppError::argument("A set-based update needs at least one assignment"));
        }
        let schema = plan.schema();
        let assignments = assignments
            .iter()
            .map(|assignment| assignment.resolve(schema))
            .collect::<AppResult<Vec<_>>>()?;
        self.write(|tables| {
            let keys = matching_keys(tables, plan)?;
            if let Some(table) = tables.get_mut(schema.table()) {
                for key in &keys {
                    if let Some(row) = table.get_mut(key) {
                        for assignment in &assignments {
                            row.insert(assignment.field.clone(), assignment.value.clone());
                        }
                    }
                }
            }
            Ok(keys.len() as u64)
        })
    }

    async fn begin(&self) -> AppResult<()> {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(AppError::invalid_operation("A transaction is already active"));
        }
        *transaction = Some(self.database.tables.read().clone());
        Ok(())
    }

    async fn commit(&self) -> AppResult<()> {
        let tables = self
            .transaction
            .lock()
            .take()
            .ok_or_else(|| AppError::invalid_operation("No active transaction to commit"))?;
        *self.database.tables.write() = tables;
        Ok(())
    }

    async fn rollback(&self) -> AppResult<()> {
        self.transaction
            .lock()
            .take()
            .map(drop)
            .ok_or_else(|| AppError::invalid_operation("No active transaction to roll back"))
    }

    fn in_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }
}

/// Resolves relations by foreign key against a table snapshot.
struct TableResolver<'a> {
    tables: &'a Tables,
}

impl RelationResolver for TableResolver<'_> {
    fn reference(&self, _: &EntitySchema, record: &Record, relation: &RelationDescriptor) -> Option<Record> {
        let foreign_key = record.get(&relation.foreign_key).filter(|value| !value.is_null())?;
        let target = relation.target();
        let key = target.single_key().ok()?;
        self.tables
            .get(target.table())?
            .values()
            .find(|row| same_value(row.get(&key.name), foreign_key))
            .cloned()
    }

    fn collection(&self, schema: &EntitySchema, record: &Record, relation: &RelationDescriptor) -> Vec<Record> {
        let Some(parent_key) = schema
            .single_key()
            .ok()
            .and_then(|key| record.get(&key.name))
            .filter(|value| !value.is_null())
        else {
            return Vec::new();
        };
        let target = relation.target();
        self.tables
            .get(target.table())
            .map(|table| {
                table
                    .values()
                    .filter(|row| same_value(row.get(&relation.foreign_key), parent_key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn same_value(candidate: Option<&Value>, expected: &Value) -> bool {
    candidate.is_some_and(|value| !value.is_null() && value.compare(expected) == Ordering::Equal)
}

/// Filter, order and window the rows of the plan's table.
fn select_rows(tables: &Tables, plan: &QueryPlan) -> Vec<Record> {
    let schema = plan.schema();
    let resolver = TableResolver { tables };
    let predicate = plan.predicate();
    let Some(table) = tables.get(schema.table()) else {
        return Vec::new();
    };
    let mut rows: Vec<Record> = table
        .values()
        .filter(|row| evaluate(&predicate, schema, row, &resolver))
        .cloned()
        .collect();

    if !plan.order.is_empty() {
        let mut keyed: Vec<(Vec<Value>, Record)> = rows
            .into_iter()
            .map(|row| {
                let keys = plan
                    .order
                    .iter()
                    .map(|sort| read_path(schema, &row, &sort.field, &resolver))
                    .collect();
                (keys, row)
            })
            .collect();
        keyed.sort_by(|(left, _), (right, _)| compare_sort_keys(left, right, &plan.order));
        rows = keyed.into_iter().map(|(_, row)| row).collect();
    }

    let skip = plan.skip.map_or(0, |skip| usize::try_from(skip).unwrap_or(usize::MAX));
    let take = plan.take.map_or(usize::MAX, |take| usize::try_from(take).unwrap_or(usize::MAX));
    rows.into_iter().skip(skip).take(take).collect()
}

fn compare_sort_keys(left: &[Value], right: &[Value], order: &[SortField]) -> Ordering {
    left.iter()
        .zip(right)
        .zip(order)
        .map(|((a, b), sort)| match sort.direction {
            SortDirection::Asc => a.compare(b),
            SortDirection::Desc => b.compare(a),
        })
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn project(tables: &Tables, schema: &EntitySchema, row: &Record, projection: &Projection) -> Record {
    let resolver = TableResolver { tables };
    projection
        .columns()
        .iter()
        .map(|column| {
            (
                column.output.clone(),
                read_path(schema, row, &column.source, &resolver),
            )
        })
        .collect()
}

/// Attach the relation chain `segments` to `row`, reusing members that
/// are already loaded.
fn load_include(tables: &Tables, schema: &EntitySchema, row: &mut Record, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(relation) = schema.relation(head) else {
        return;
    };
    let target = relation.target();
    let resolver = TableResolver { tables };

    if relation.is_collection() {
        let mut children: Vec<Record> = match row.get(&relation.name) {
            Some(Value::List(items)) => items.iter().filter_map(|item| item.as_record().cloned()).collect(),
            _ => resolver.collection(schema, row, relation),
        };
        for child in &mut children {
            load_include(tables, &target, child, rest);
        }
        row.insert(
            relation.name.clone(),
            Value::List(children.into_iter().map(Value::Record).collect()),
        );
    } else {
        let loaded = match row.get(&relation.name) {
            Some(Value::Record(loaded)) => Some(loaded.clone()),
            _ => resolver.reference(schema, row, relation),
        };
        let value = match loaded {
            Some(mut loaded) => {
                load_include(tables, &target, &mut loaded, rest);
                Value::Record(loaded)
            }
            None => Value::Null,
        };
        row.insert(relation.name.clone(), value);
    }
}

fn matching_keys(tables: &Tables, plan: &QueryPlan) -> AppResult<Vec<String>> {
    select_rows(tables, &plan.for_count())
        .iter()
        .map(|row| Ok(plan.schema().key_of(row)?.canonical()))
        .collect()
}

fn insert_row(tables: &mut Tables, schema: &EntitySchema, record: &Record) -> AppResult<()> {
    let row = schema.scalar_values(record);
    let key = schema.key_of(&row)?.coerce(schema)?;
    let table = tables.entry(schema.table().to_string()).or_default();
    let canonical = key.canonical();
    if table.contains_key(&canonical) {
        return Err(AppError::store(format!(
            "Duplicate key {key} in table {}",
            schema.table()
        )));
    }
    table.insert(canonical, row);
    Ok(())
}

fn find_row<'a>(tables: &'a mut Tables, schema: &EntitySchema, key: &EntityKey) -> AppResult<&'a mut Record> {
    let canonical = key.clone().coerce(schema)?.canonical();
    tables
        .get_mut(schema.table())
        .and_then(|table| table.get_mut(&canonical))
        .ok_or_else(|| missing_row(schema, key))
}
