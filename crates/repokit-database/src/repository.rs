//! The generic repository.
//!
//! [`Repository<T>`] is a stateless facade over one session and one entity
//! type. Every read that is not explicitly untracked returns handles that
//! are registered with the session: mutate them in place and call
//! `save_changes` on the unit of work, no update call needed.

use std::any::TypeId;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use repokit_core::types::{PagedList, PagedResult, PagingInfo};
use repokit_core::{AppError, AppResult, ErrorKind};
use repokit_entity::{Entity, EntityKey, Record, SoftDeletable, Value, record_to_json};
use repokit_query::composer::{compose_page, compose_projected_page};
use repokit_query::{Aggregate, Assignment, Expr, Query, QueryPlan, Specification, col};

use crate::session::{EntityState, Session};
use crate::tracked::Tracked;

/// Data access for entity type `T`.
pub struct Repository<T> {
    session: Arc<Session>,
    cancellation: Option<CancellationToken>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    /// A repository over `session`.
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            cancellation: None,
            _entity: PhantomData,
        }
    }

    /// The session this repository works in.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// A view of this repository whose store calls are also aborted when
    /// `token` is cancelled. Other views over the session are unaffected.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            session: Arc::clone(&self.session),
            cancellation: Some(token),
            _entity: PhantomData,
        }
    }

    // ── Point lookups ────────────────────────────────────────────────

    /// The entity with a single-member key, or `None`.
    pub async fn get_by_id(&self, id: impl Into<Value>) -> AppResult<Option<Tracked<T>>> {
        self.get_by_key(EntityKey::single(id)).await
    }

    /// The entity with `key` (single or composite), or `None`. Tracked
    /// instances are returned without a store round trip.
    pub async fn get_by_key(&self, key: EntityKey) -> AppResult<Option<Tracked<T>>> {
        let schema = T::schema();
        let key = key.coerce(&schema)?;
        if let Some(tracked) = self.session.find::<T>(&key) {
            return Ok(Some(tracked));
        }
        let plan = Query::<T>::filtered(key_predicate(schema.key_names(), &key))
            .into_plan()?
            .with_window(None, Some(1));
        Ok(self.materialize(&plan).await?.into_iter().next())
    }

    /// The entity with `id`, or a `NotFound` error.
    pub async fn get_by_id_or_throw(&self, id: impl Into<Value>) -> AppResult<Tracked<T>> {
        let key = EntityKey::single(id);
        self.get_by_key(key.clone()).await?.ok_or_else(|| {
            AppError::not_found(format!("{} with key {key} was not found", T::schema().name()))
        })
    }

    /// All entities whose key is in `ids`, in one round trip.
    pub async fn get_by_ids<V: Into<Value>>(&self, ids: impl IntoIterator<Item = V>) -> AppResult<Vec<Tracked<T>>> {
        let schema = T::schema();
        let key = schema.single_key()?;
        let ids: Vec<Value> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.find(Query::filtered(col(key.name.clone()).is_in(ids))).await
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Entities matching `query`. Results are tracked unless the query is
    /// untracked. A query with a projection must go through
    /// [`Repository::select`].
    pub async fn find(&self, query: Query<T>) -> AppResult<Vec<Tracked<T>>> {
        if query.projection().is_some() {
            return Err(AppError::projection_type_mismatch(format!(
                "A projected query over {} must be read through select",
                T::schema().name()
            )));
        }
        let plan = query.into_plan()?;
        self.materialize(&plan).await
    }

    /// Rows of `query` read as `R`. Without a projection `R` must be `T`;
    /// the result is never tracked.
    pub async fn select<R: DeserializeOwned + 'static>(&self, query: Query<T>) -> AppResult<Vec<R>> {
        if query.projection().is_none() && TypeId::of::<R>() != TypeId::of::<T>() {
            return Err(AppError::projection_type_mismatch(format!(
                "Result type {} differs from entity type {} and no projection was given",
                std::any::type_name::<R>(),
                T::schema().name()
            )));
        }
        let mut plan = query.into_plan()?;
        plan.tracking = false;
        let records = self.fetch(&plan).await?;
        read_rows(&records)
    }

    /// Every entity.
    pub async fn get_all(&self) -> AppResult<Vec<Tracked<T>>> {
        self.find(Query::new()).await
    }

    /// Entities matching `filter` with the relation paths loaded.
    pub async fn get_with_includes(&self, filter: Option<Expr>, includes: &[&str]) -> AppResult<Vec<Tracked<T>>> {
        let mut query = Query::new();
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        for path in includes {
            query = query.include(*path);
        }
        self.find(query).await
    }

    /// The first entity of `query`; ordered by key when unordered.
    pub async fn get_first_or_default(&self, query: Query<T>) -> AppResult<Option<Tracked<T>>> {
        let mut query = query.take(1);
        if !query.is_ordered() {
            for key in T::schema().key_names() {
                query = query.then_by(key.clone());
            }
        }
        Ok(self.find(query).await?.into_iter().next())
    }

    // ── Specifications ───────────────────────────────────────────────

    /// Entities described by `spec`.
    pub async fn get_by_spec(&self, spec: &Specification<T>) -> AppResult<Vec<Tracked<T>>> {
        let plan = spec.to_plan()?;
        self.materialize(&plan).await
    }

    /// The first entity described by `spec`.
    pub async fn get_first_by_spec(&self, spec: &Specification<T>) -> AppResult<Option<Tracked<T>>> {
        let mut plan = spec.to_plan()?;
        plan.take = Some(1);
        plan.ensure_key_order();
        Ok(self.materialize(&plan).await?.into_iter().next())
    }

    /// Number of entities matching the criteria of `spec`.
    pub async fn count_by_spec(&self, spec: &Specification<T>) -> AppResult<u64> {
        let plan = spec.to_criteria_plan()?;
        self.guard(self.session.store().count(&plan)).await
    }

    /// Whether any entity matches the criteria of `spec`.
    pub async fn any_by_spec(&self, spec: &Specification<T>) -> AppResult<bool> {
        Ok(self.count_by_spec(spec).await? > 0)
    }

    // ── Paging ───────────────────────────────────────────────────────

    /// One page of entities: global search, column search and sort from
    /// `info` applied on top of `query`, counted before windowing.
    pub async fn get_paged(&self, query: Query<T>, info: &PagingInfo) -> AppResult<PagedResult<Tracked<T>>> {
        if query.projection().is_some() {
            return Err(AppError::projection_type_mismatch(format!(
                "A projected page over {} must be read through get_paged_projected",
                T::schema().name()
            )));
        }
        let paged = compose_page(query.into_plan()?, info, self.session.page_options())?;
        let total = self.guard(self.session.store().count(&paged.count)).await?;
        let items = self.materialize(&paged.page).await?;
        debug!(
            entity = T::schema().name(),
            page = paged.request.current_page,
            size = paged.request.page_size,
            total,
            "Fetched page"
        );
        Ok(PagedResult::new(
            items,
            total,
            paged.request.current_page,
            paged.request.page_size,
        ))
    }

    /// One page of projected rows. `query` must carry a projection;
    /// search and sort columns may use the projected names.
    pub async fn get_paged_projected<R: DeserializeOwned>(
        &self,
        query: Query<T>,
        info: &PagingInfo,
    ) -> AppResult<PagedResult<R>> {
        let mut plan = query.into_plan()?;
        plan.tracking = false;
        let paged = compose_projected_page(plan, info, self.session.page_options())?;
        let total = self.guard(self.session.store().count(&paged.count)).await?;
        let records = self.fetch(&paged.page).await?;
        Ok(PagedResult::new(
            read_rows(&records)?,
            total,
            paged.request.current_page,
            paged.request.page_size,
        ))
    }

    /// [`Repository::get_paged`] in the legacy shape that echoes the request.
    pub async fn get_paged_list(&self, query: Query<T>, info: &PagingInfo) -> AppResult<PagedList<Tracked<T>>> {
        let page = self.get_paged(query, info).await?;
        Ok(page.into_paged_list(info))
    }

    /// A plain offset page ordered by key, without search or totals.
    pub async fn get_page(&self, page: u32, size: u32, filter: Option<Expr>) -> AppResult<Vec<Tracked<T>>> {
        let request = PagingInfo::new(page, size);
        request.validate()?;
        let mut query = Query::new().skip(request.offset()).take(request.limit());
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        self.find(query).await
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Track a new entity; inserted on save.
    pub fn add(&self, entity: T) -> AppResult<Tracked<T>> {
        self.session.add(entity)
    }

    /// Track new entities; inserted on save.
    pub fn add_range(&self, entities: impl IntoIterator<Item = T>) -> AppResult<Vec<Tracked<T>>> {
        entities.into_iter().map(|entity| self.add(entity)).collect()
    }

    /// Mark `entity` as modified.
    ///
    /// Redundant for instances already loaded through this session, whose
    /// edits are detected anyway, and it overwrites their navigation state.
    /// Prefer [`Repository::update_disconnected`] for payloads that arrive
    /// from outside the session.
    pub fn update(&self, entity: T) -> AppResult<Tracked<T>> {
        self.session.update(entity)
    }

    /// Attach an entity that was not loaded by this session and mark every
    /// scalar member as modified.
    pub fn update_disconnected(&self, entity: T) -> AppResult<Tracked<T>> {
        debug!(entity = T::schema().name(), "Attaching disconnected entity");
        self.session.update(entity)
    }

    /// Mark several entities as modified.
    pub fn update_range(&self, entities: impl IntoIterator<Item = T>) -> AppResult<Vec<Tracked<T>>> {
        entities.into_iter().map(|entity| self.update(entity)).collect()
    }

    /// Mark an entity for deletion.
    pub fn remove(&self, entity: &Tracked<T>) -> AppResult<()> {
        self.session.remove(entity)
    }

    /// Mark several entities for deletion.
    pub fn remove_range(&self, entities: &[Tracked<T>]) -> AppResult<()> {
        entities.iter().try_for_each(|entity| self.remove(entity))
    }

    /// Load and mark for deletion the entity with `id`. Returns whether it
    /// existed.
    pub async fn remove_by_id(&self, id: impl Into<Value>) -> AppResult<bool> {
        match self.get_by_id(id).await? {
            Some(entity) => {
                self.remove(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the whole child collection `relation` of a tracked parent.
    ///
    /// On save, children missing from `children` are deleted, new ones are
    /// inserted with their foreign key set to the parent key and changed
    /// ones are updated.
    pub async fn replace_child_collection<C: Entity>(
        &self,
        parent: &Tracked<T>,
        relation: &str,
        children: Vec<C>,
    ) -> AppResult<()> {
        let schema = T::schema();
        let relation = schema
            .relation(relation)
            .filter(|relation| relation.is_collection())
            .ok_or_else(|| {
                AppError::argument(format!(
                    "'{relation}' is not a collection of {}",
                    schema.name()
                ))
            })?;
        let target = relation.target();
        if target.name() != C::schema().name() {
            return Err(AppError::argument(format!(
                "Collection '{}' holds {}, not {}",
                relation.name,
                target.name(),
                C::schema().name()
            )));
        }
        if !self.session.is_tracked(parent) {
            return Err(AppError::invalid_operation(format!(
                "{} must be tracked to replace its children",
                schema.name()
            )));
        }

        if !self.session.has_collection_snapshot(parent, &relation.name) {
            let parent_key = parent.record()?.get(&schema.single_key()?.name).cloned().unwrap_or_default();
            let mut plan = QueryPlan::new(Arc::clone(&target)).with_filter(&col(relation.foreign_key.clone()).eq(parent_key))?;
            plan.ignore_query_filters = true;
            plan.tracking = false;
            let existing = self.fetch(&plan).await?;
            self.session.snapshot_collection(parent, relation, &existing)?;
        }

        let items = children
            .iter()
            .map(|child| child.to_record().map(Value::Record))
            .collect::<AppResult<Vec<_>>>()?;
        let mut record = parent.record()?;
        record.insert(relation.name.clone(), Value::List(items));
        parent.overwrite(&record)?;
        debug!(
            entity = schema.name(),
            relation = %relation.name,
            children = children.len(),
            "Replaced child collection"
        );
        Ok(())
    }

    // ── Soft delete ──────────────────────────────────────────────────

    /// Flag an entity as deleted. Fails with `CapabilityMismatch` when `T`
    /// is not soft-deletable; never falls back to a physical delete.
    pub fn soft_delete(&self, entity: &Tracked<T>) -> AppResult<()> {
        self.write_flag(entity, true)
    }

    /// Flag several entities as deleted.
    pub fn soft_delete_range(&self, entities: &[Tracked<T>]) -> AppResult<()> {
        entities.iter().try_for_each(|entity| self.soft_delete(entity))
    }

    /// Clear the deleted flag of an entity.
    pub fn restore(&self, entity: &Tracked<T>) -> AppResult<()> {
        self.write_flag(entity, false)
    }

    /// Clear the deleted flag of several entities.
    pub fn restore_range(&self, entities: &[Tracked<T>]) -> AppResult<()> {
        entities.iter().try_for_each(|entity| self.restore(entity))
    }

    fn write_flag(&self, entity: &Tracked<T>, deleted: bool) -> AppResult<()> {
        let schema = T::schema();
        let capability = SoftDeletable::probe(&schema)?;
        entity.set_field(capability.flag(), Value::Bool(deleted))?;
        self.session.ensure_tracked(entity)
    }

    // ── Batch ────────────────────────────────────────────────────────

    /// Delete every row matching `filter` directly in the store. Bypasses
    /// the change tracker and audit stamping.
    pub async fn delete_where(&self, filter: Expr) -> AppResult<u64> {
        let plan = Query::<T>::filtered(filter).into_plan()?;
        let deleted = self.guard(self.session.store().delete_where(&plan)).await?;
        info!(entity = T::schema().name(), deleted, "Batch delete");
        Ok(deleted)
    }

    /// Apply `assignments` to every row matching `filter` directly in the
    /// store. Bypasses the change tracker and audit stamping.
    pub async fn update_where(&self, filter: Expr, assignments: &[Assignment]) -> AppResult<u64> {
        let plan = Query::<T>::filtered(filter).into_plan()?;
        let updated = self
            .guard(self.session.store().update_where(&plan, assignments))
            .await?;
        info!(entity = T::schema().name(), updated, "Batch update");
        Ok(updated)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Whether any entity matches `filter`.
    pub async fn exists(&self, filter: Expr) -> AppResult<bool> {
        Ok(self.long_count(Some(filter)).await? > 0)
    }

    /// Whether any entity exists, optionally matching `filter`.
    pub async fn any(&self, filter: Option<Expr>) -> AppResult<bool> {
        Ok(self.long_count(filter).await? > 0)
    }

    /// Whether every entity satisfies `predicate`.
    pub async fn all(&self, predicate: Expr) -> AppResult<bool> {
        Ok(self.long_count(Some(predicate.not())).await? == 0)
    }

    /// Number of entities, optionally matching `filter`.
    pub async fn count(&self, filter: Option<Expr>) -> AppResult<usize> {
        let total = self.long_count(filter).await?;
        usize::try_from(total).map_err(|_| AppError::invalid_operation(format!("Row count {total} does not fit in usize")))
    }

    /// Number of entities as `u64`, optionally matching `filter`.
    pub async fn long_count(&self, filter: Option<Expr>) -> AppResult<u64> {
        let plan = filtered_plan::<T>(filter)?;
        self.guard(self.session.store().count(&plan)).await
    }

    /// Largest value of `field`; null over no rows.
    pub async fn max(&self, field: &str, filter: Option<Expr>) -> AppResult<Value> {
        self.aggregate(Aggregate::Max, field, filter).await
    }

    /// Smallest value of `field`; null over no rows.
    pub async fn min(&self, field: &str, filter: Option<Expr>) -> AppResult<Value> {
        self.aggregate(Aggregate::Min, field, filter).await
    }

    /// Sum of a numeric `field`; zero over no rows.
    pub async fn sum(&self, field: &str, filter: Option<Expr>) -> AppResult<Value> {
        self.aggregate(Aggregate::Sum, field, filter).await
    }

    /// Mean of a numeric `field`; zero over no rows.
    pub async fn average(&self, field: &str, filter: Option<Expr>) -> AppResult<Value> {
        self.aggregate(Aggregate::Average, field, filter).await
    }

    async fn aggregate(&self, function: Aggregate, field: &str, filter: Option<Expr>) -> AppResult<Value> {
        let plan = filtered_plan::<T>(filter)?;
        self.guard(self.session.store().aggregate(&plan, function, field))
            .await
    }

    /// Overwrite the scalar members of the first entity matching
    /// `predicate` with those of `entity`, or add `entity` when none does.
    /// Creation audit members of an existing row are kept.
    pub async fn upsert(&self, predicate: Expr, entity: T) -> AppResult<Tracked<T>> {
        match self.get_first_or_default(Query::filtered(predicate)).await? {
            Some(existing) => {
                let schema = T::schema();
                let incoming = entity.to_record()?;
                let mut record = existing.record()?;
                let kept: Vec<&str> = schema
                    .audit_fields()
                    .map(|audit| vec![audit.created_by.as_str(), audit.created_on.as_str()])
                    .unwrap_or_default();
                let merged = schema
                    .fields()
                    .iter()
                    .filter(|field| !field.is_key)
                    .filter(|field| !kept.iter().any(|name| name.eq_ignore_ascii_case(&field.name)));
                for field in merged {
                    record.insert(
                        field.name.clone(),
                        incoming.get(&field.name).cloned().unwrap_or_default(),
                    );
                }
                existing.overwrite(&record)?;
                Ok(existing)
            }
            None => self.add(entity),
        }
    }

    /// Discard local edits of `entity` and re-read it from the store.
    /// Returns `false` and detaches it when its row is gone.
    pub async fn reload(&self, entity: &Tracked<T>) -> AppResult<bool> {
        let schema = T::schema();
        let key = entity.read().key()?.coerce(&schema)?;
        let mut plan = Query::<T>::filtered(key_predicate(schema.key_names(), &key))
            .ignore_query_filters()
            .into_plan()?;
        plan.tracking = false;
        let record = self.fetch(&plan).await?.into_iter().next();
        let found = record.is_some();
        self.session.refresh(entity, record)?;
        Ok(found)
    }

    /// Whether this handle is tracked by the session.
    pub fn is_tracked(&self, entity: &Tracked<T>) -> bool {
        self.session.is_tracked(entity)
    }

    /// The tracking state of `entity`.
    pub fn state(&self, entity: &Tracked<T>) -> AppResult<EntityState> {
        self.session.state_of(entity)
    }

    /// Stop tracking `entity`; later edits are not saved.
    pub fn detach(&self, entity: &Tracked<T>) -> bool {
        self.session.detach(entity)
    }

    /// All tracked instances of `T`.
    pub fn tracked_entities(&self) -> Vec<Tracked<T>> {
        self.session.tracked::<T>()
    }

    /// Key and state of every tracked instance of `T`.
    pub fn tracking_info(&self) -> AppResult<Vec<(EntityKey, EntityState)>> {
        self.session.tracking_info::<T>()
    }

    async fn guard<R>(&self, call: impl Future<Output = AppResult<R>>) -> AppResult<R> {
        self.session.guard_with(self.cancellation.as_ref(), call).await
    }

    async fn fetch(&self, plan: &QueryPlan) -> AppResult<Vec<Record>> {
        self.guard(self.session.store().fetch(plan)).await
    }

    async fn materialize(&self, plan: &QueryPlan) -> AppResult<Vec<Tracked<T>>> {
        let records = self.fetch(plan).await?;
        if plan.tracking {
            records
                .into_iter()
                .map(|record| self.session.attach::<T>(record))
                .collect()
        } else {
            records
                .iter()
                .map(|record| Ok(Tracked::new(T::from_record(record)?)))
                .collect()
        }
    }
}

impl<T> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &std::any::type_name::<T>())
            .finish()
    }
}

fn key_predicate(names: &[String], key: &EntityKey) -> Expr {
    Expr::all(
        names
            .iter()
            .zip(key.values())
            .map(|(name, value)| col(name.clone()).eq(value.clone())),
    )
}

fn filtered_plan<T: Entity>(filter: Option<Expr>) -> AppResult<QueryPlan> {
    match filter {
        Some(filter) => Query::<T>::filtered(filter).into_plan(),
        None => Query::<T>::new().into_plan(),
    }
}

fn read_rows<R: DeserializeOwned>(records: &[Record]) -> AppResult<Vec<R>> {
    records
        .iter()
        .map(|record| {
            serde_json::from_value(record_to_json(record)).map_err(|e| {
                AppError::with_source(
                    ErrorKind::Serialization,
                    format!("Row cannot be read as {}: {e}", std::any::type_name::<R>()),
                    e,
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDatabase;
    use crate::test_support::{Category, Invoice, Product, Tag, catalog};
    use repokit_query::Projection;
    use rust_decimal::Decimal;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct ProductRow {
        title: String,
        category: Option<String>,
    }

    fn products(database: &Arc<MemoryDatabase>) -> Repository<Product> {
        Repository::new(Arc::new(Session::new(Arc::new(database.store()))))
    }

    #[tokio::test]
    async fn test_lookups() {
        let repository = products(&catalog());
        let rake = repository.get_by_id(1).await.unwrap().unwrap();
        let again = repository.get_by_id("1").await.unwrap().unwrap();
        assert!(rake.ptr_eq(&again));

        assert!(repository.get_by_id(5).await.unwrap().is_none());
        let err = repository.get_by_id_or_throw(404).await.unwrap_err();
        assert!(err.is(ErrorKind::NotFound));

        let found = repository.get_by_ids([4, 2, 99]).await.unwrap();
        let ids: Vec<i32> = found.iter().map(|p| p.read().id).collect();
        assert_eq!(ids, vec![2, 4]);
        assert!(repository.get_by_ids(Vec::<i32>::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_projection_rules() {
        let repository = products(&catalog());
        let projected = Query::<Product>::filtered(col("id").eq(3))
            .select(Projection::new().column("title", "name").column("category", "category.name"));

        let err = repository.find(projected.clone()).await.unwrap_err();
        assert!(err.is(ErrorKind::ProjectionTypeMismatch));

        let rows: Vec<ProductRow> = repository.select(projected).await.unwrap();
        assert_eq!(
            rows,
            vec![ProductRow {
                title: "Hammer".into(),
                category: Some("Tools".into()),
            }]
        );

        let err = repository.select::<ProductRow>(Query::new()).await.unwrap_err();
        assert!(err.is(ErrorKind::ProjectionTypeMismatch));
        let plain: Vec<Product> = repository.select(Query::new()).await.unwrap();
        assert_eq!(plain.len(), 4);
        assert!(repository.tracked_entities().is_empty());
    }

    #[tokio::test]
    async fn test_paged_entities_and_projection() {
        let repository = products(&catalog());
        let info = PagingInfo::new(2, 3);
        let page = repository.get_paged(Query::new(), &info).await.unwrap();
        assert_eq!(page.total_count, 4);
        assert_eq!(page.total_pages(), 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].read().id, 4);

        let query = Query::<Product>::new().select(Projection::new().column("title", "name").column("category", "category.name"));
        let info = PagingInfo::new(1, 10).with_sort("title", true).with_global_search("tools");
        let rows: PagedResult<ProductRow> = repository.get_paged_projected(query, &info).await.unwrap();
        let titles: Vec<&str> = rows.items.iter().map(|row| row.title.as_str()).collect();
        assert_eq!(titles, vec!["Saw", "Hammer"]);

        let list = repository
            .get_paged_list(Query::new(), &PagingInfo::new(1, 3))
            .await
            .unwrap();
        assert_eq!(list.paging_info.total_count, 4);
        assert_eq!(list.paging_info.total_pages, 2);

        let err = repository.get_page(0, 10, None).await.unwrap_err();
        assert!(err.is(ErrorKind::Argument));
        let second = repository.get_page(2, 2, None).await.unwrap();
        assert_eq!(second.iter().map(|p| p.read().id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_specifications() {
        let repository = products(&catalog());
        let spec = Specification::<Product>::new(col("category_id").eq(2))
            .include("category")
            .order_by_descending("price");
        let found = repository.get_by_spec(&spec).await.unwrap();
        assert_eq!(found[0].read().name, "Hammer");
        assert!(found[0].read().category.is_some());
        assert_eq!(repository.count_by_spec(&spec).await.unwrap(), 2);
        assert!(repository.any_by_spec(&spec).await.unwrap());
        let first = repository.get_first_by_spec(&spec).await.unwrap().unwrap();
        assert_eq!(first.read().id, 3);
    }

    #[tokio::test]
    async fn test_soft_delete_and_capability_mismatch() {
        let database = catalog();
        let repository = products(&database);
        let saw = repository.get_by_id(4).await.unwrap().unwrap();
        repository.soft_delete(&saw).unwrap();
        repository.session().save_changes().await.unwrap();

        assert_eq!(repository.long_count(None).await.unwrap(), 3);
        let everything = repository
            .find(Query::new().ignore_query_filters())
            .await
            .unwrap();
        assert_eq!(everything.len(), 5);
        assert_eq!(database.row_count("product"), 5);

        let categories: Repository<Category> = Repository::new(Arc::clone(repository.session()));
        let garden = categories.get_by_id(1).await.unwrap().unwrap();
        let err = categories.soft_delete(&garden).unwrap_err();
        assert!(err.is(ErrorKind::CapabilityMismatch));
        assert!(!categories.session().has_changes().unwrap());
    }

    #[tokio::test]
    async fn test_replace_child_collection() {
        let database = catalog();
        let repository = products(&database);
        let shovel = repository.get_by_id(2).await.unwrap().unwrap();
        repository
            .replace_child_collection(&shovel, "tags", vec![Tag::new(10, 0, "green")])
            .await
            .unwrap();
        repository.session().save_changes().await.unwrap();

        let tags: Repository<Tag> = Repository::new(Arc::clone(repository.session()));
        let labels: Vec<String> = tags
            .find(Query::filtered(col("product_id").eq(2)))
            .await
            .unwrap()
            .iter()
            .map(|tag| tag.read().label.clone())
            .collect();
        assert_eq!(labels, vec!["green".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_operations_and_aggregates() {
        let database = catalog();
        let repository = products(&database);
        let updated = repository
            .update_where(col("category_id").eq(1), &[Assignment::set("price", "1.00")])
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(
            repository.sum("price", Some(col("category_id").eq(1))).await.unwrap(),
            Value::Decimal(Decimal::new(200, 2))
        );
        assert_eq!(
            repository.max("price", None).await.unwrap(),
            Value::Decimal(Decimal::new(900, 2))
        );

        let deleted = repository.delete_where(col("price").lt(2)).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(repository.count(None).await.unwrap(), 2);
        assert!(repository.all(col("category_id").eq(2)).await.unwrap());
        assert!(repository.exists(col("name").eq("Saw")).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_and_reload() {
        let database = catalog();
        let repository = products(&database);
        let existing = repository
            .upsert(col("name").eq("Rake"), Product::sample(99, "Rake", "3.00"))
            .await
            .unwrap();
        assert_eq!(existing.read().id, 1);
        assert_eq!(existing.read().price, Decimal::new(300, 2));
        assert_eq!(repository.state(&existing).unwrap(), EntityState::Modified);

        assert!(repository.reload(&existing).await.unwrap());
        assert_eq!(existing.read().price, Decimal::new(200, 2));
        assert_eq!(repository.state(&existing).unwrap(), EntityState::Unchanged);

        let added = repository
            .upsert(col("name").eq("Hoe"), Product::sample(6, "Hoe", "4.00"))
            .await
            .unwrap();
        assert_eq!(repository.state(&added).unwrap(), EntityState::Added);
        let info = repository.tracking_info().unwrap();
        assert_eq!(info.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_scoped_to_one_view() {
        let repository = products(&catalog());
        let token = CancellationToken::new();
        let scoped = repository.with_cancellation(token.clone());
        assert_eq!(scoped.long_count(None).await.unwrap(), 4);

        token.cancel();
        let err = scoped.get_by_id(2).await.unwrap_err();
        assert!(err.is(ErrorKind::Cancelled));
        assert!(repository.get_by_id(2).await.unwrap().is_some());
        assert_eq!(repository.long_count(None).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_upsert_keeps_creation_stamps() {
        let database = MemoryDatabase::new();
        let invoices = Repository::<Invoice>::new(Arc::new(Session::new(Arc::new(database.store()))));
        invoices.session().set_actor("alice");
        invoices.add(Invoice::new(1, "draft")).unwrap();
        invoices.session().save_changes().await.unwrap();
        invoices.session().detach_all();

        invoices.session().set_actor("bob");
        let merged = invoices
            .upsert(col("id").eq(1), Invoice::new(1, "sent"))
            .await
            .unwrap();
        assert_eq!(merged.read().status, "sent");
        assert_eq!(merged.read().created_by.as_deref(), Some("alice"));
        invoices.session().save_changes().await.unwrap();

        let fresh = Repository::<Invoice>::new(Arc::new(Session::new(Arc::new(database.store()))));
        let stored = fresh.get_by_id(1).await.unwrap().unwrap();
        let stored = stored.read();
        assert_eq!(stored.status, "sent");
        assert_eq!(stored.created_by.as_deref(), Some("alice"));
        assert!(stored.created_on.is_some());
        assert_eq!(stored.modified_by.as_deref(), Some("bob"));
    }
}
