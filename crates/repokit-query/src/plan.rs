//! Typed query builder and the resolved plan consumed by stores.

use std::marker::PhantomData;
use std::sync::Arc;

use repokit_core::types::{SortDirection, SortField};
use repokit_core::{AppError, AppResult};
use repokit_entity::{EntitySchema, Reflect, Value};

use crate::expr::{Expr, col};
use crate::path::{resolve_field_path, resolve_relation_path};
use crate::projection::Projection;

/// A resolved query over one entity type.
///
/// Every path in a plan is canonical and every constant is coerced to its
/// field kind, so stores can execute it without further validation.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    schema: Arc<EntitySchema>,
    /// Predicates combined with AND.
    pub filters: Vec<Expr>,
    /// Relation paths to load, in request order.
    pub includes: Vec<String>,
    /// Sort keys, most significant first.
    pub order: Vec<SortField>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Rows to take.
    pub take: Option<u64>,
    /// Whether materialised entities join the change tracker.
    pub tracking: bool,
    /// Disable the implicit soft-delete filter.
    pub ignore_query_filters: bool,
    /// Output shape; `None` returns whole entities.
    pub projection: Option<Projection>,
}

impl QueryPlan {
    /// An unfiltered, tracked plan over `schema`.
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        Self {
            schema,
            filters: Vec::new(),
            includes: Vec::new(),
            order: Vec::new(),
            skip: None,
            take: None,
            tracking: true,
            ignore_query_filters: false,
            projection: None,
        }
    }

    /// The entity schema.
    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// Resolve and append a predicate.
    pub fn with_filter(mut self, expr: &Expr) -> AppResult<Self> {
        let resolved = expr.resolve(&self.schema)?;
        if !resolved.is_always() {
            self.filters.push(resolved);
        }
        Ok(self)
    }

    /// Resolve and append an include path. Duplicates are ignored.
    pub fn with_include(mut self, path: &str) -> AppResult<Self> {
        let resolved = resolve_relation_path(&self.schema, path, true)?;
        if !self.includes.contains(&resolved.canonical) {
            self.includes.push(resolved.canonical);
        }
        Ok(self)
    }

    /// Resolve and append a sort key.
    pub fn with_order(mut self, path: &str, direction: SortDirection) -> AppResult<Self> {
        let resolved = resolve_field_path(&self.schema, path)?;
        self.order.push(SortField::new(resolved.canonical, direction));
        Ok(self)
    }

    /// Resolve and set the projection.
    pub fn with_projection(mut self, projection: &Projection) -> AppResult<Self> {
        self.projection = Some(projection.resolve(&self.schema)?);
        Ok(self)
    }

    /// Set the row window.
    pub fn with_window(mut self, skip: Option<u64>, take: Option<u64>) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    /// Append ascending key fields not already used as sort keys, making
    /// the order total.
    pub fn ensure_key_order(&mut self) {
        for key in self.schema.key_names() {
            if !self.order.iter().any(|sort| &sort.field == key) {
                self.order.push(SortField::asc(key.clone()));
            }
        }
    }

    /// The implicit soft-delete predicate, unless disabled.
    pub fn soft_delete_filter(&self) -> Option<Expr> {
        if self.ignore_query_filters {
            return None;
        }
        self.schema
            .soft_delete_field()
            .map(|flag| col(flag).eq(false))
    }

    /// The full predicate the store must apply.
    pub fn predicate(&self) -> Expr {
        Expr::all(
            self.soft_delete_filter()
                .into_iter()
                .chain(self.filters.iter().cloned()),
        )
    }

    /// The same rows without ordering or window, for counting.
    pub fn for_count(&self) -> Self {
        let mut plan = self.clone();
        plan.order.clear();
        plan.skip = None;
        plan.take = None;
        plan.includes.clear();
        plan.projection = None;
        plan
    }
}

/// A typed query over entity type `T`.
///
/// Names are resolved when the query becomes a plan, so building a query
/// never fails; unknown members surface as argument errors on execution.
pub struct Query<T> {
    filters: Vec<Expr>,
    includes: Vec<String>,
    order: Vec<SortField>,
    skip: Option<u64>,
    take: Option<u64>,
    tracking: bool,
    ignore_query_filters: bool,
    projection: Option<Projection>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Reflect> Query<T> {
    /// A query returning every row.
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            includes: Vec::new(),
            order: Vec::new(),
            skip: None,
            take: None,
            tracking: true,
            ignore_query_filters: false,
            projection: None,
            _entity: PhantomData,
        }
    }

    /// A query returning the rows matching `predicate`.
    pub fn filtered(predicate: Expr) -> Self {
        Self::new().filter(predicate)
    }

    /// Add a predicate; predicates are combined with AND.
    pub fn filter(mut self, predicate: Expr) -> Self {
        self.filters.push(predicate);
        self
    }

    /// Load a relation path with the results.
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    /// Sort ascending by `path`, replacing earlier sort keys.
    pub fn order_by(mut self, path: impl Into<String>) -> Self {
        self.order = vec![SortField::asc(path)];
        self
    }

    /// Sort descending by `path`, replacing earlier sort keys.
    pub fn order_by_descending(mut self, path: impl Into<String>) -> Self {
        self.order = vec![SortField::desc(path)];
        self
    }

    /// Add a secondary ascending sort key.
    pub fn then_by(mut self, path: impl Into<String>) -> Self {
        self.order.push(SortField::asc(path));
        self
    }

    /// Add a secondary descending sort key.
    pub fn then_by_descending(mut self, path: impl Into<String>) -> Self {
        self.order.push(SortField::desc(path));
        self
    }

    /// Skip `count` rows.
    pub fn skip(mut self, count: u64) -> Self {
        self.skip = Some(count);
        self
    }

    /// Take at most `count` rows.
    pub fn take(mut self, count: u64) -> Self {
        self.take = Some(count);
        self
    }

    /// Return results that are not tracked by the session.
    pub fn as_no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    /// Include soft-deleted rows.
    pub fn ignore_query_filters(mut self) -> Self {
        self.ignore_query_filters = true;
        self
    }

    /// Project results; projected results are never tracked.
    pub fn select(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// The projection, if any.
    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    /// Whether results are tracked.
    pub fn is_tracking(&self) -> bool {
        self.tracking && self.projection.is_none()
    }

    /// Whether an explicit order was given.
    pub fn is_ordered(&self) -> bool {
        !self.order.is_empty()
    }

    /// Resolve the query against the schema of `T`.
    ///
    /// A windowed query always gets the key as trailing sort key so that
    /// consecutive windows neither overlap nor skip rows.
    pub fn into_plan(self) -> AppResult<QueryPlan> {
        let tracking = self.is_tracking();
        let mut plan = QueryPlan::new(T::schema());
        plan.tracking = tracking;
        plan.ignore_query_filters = self.ignore_query_filters;

        for include in &self.includes {
            plan = plan.with_include(include)?;
        }
        for filter in &self.filters {
            plan = plan.with_filter(filter)?;
        }
        for sort in &self.order {
            plan = plan.with_order(&sort.field, sort.direction)?;
        }
        if let Some(projection) = &self.projection {
            plan = plan.with_projection(projection)?;
        }
        plan = plan.with_window(self.skip, self.take);
        if plan.skip.is_some() || plan.take.is_some() {
            plan.ensure_key_order();
        }
        Ok(plan)
    }
}

impl<T: Reflect> Default for Query<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
            includes: self.includes.clone(),
            order: self.order.clone(),
            skip: self.skip,
            take: self.take,
            tracking: self.tracking,
            ignore_query_filters: self.ignore_query_filters,
            projection: self.projection.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("filters", &self.filters)
            .field("includes", &self.includes)
            .field("order", &self.order)
            .field("skip", &self.skip)
            .field("take", &self.take)
            .field("tracking", &self.tracking)
            .field("ignore_query_filters", &self.ignore_query_filters)
            .field("projection", &self.projection)
            .finish()
    }
}

/// Aggregate functions over one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Largest value.
    Max,
    /// Smallest value.
    Min,
    /// Sum; zero over no rows.
    Sum,
    /// Arithmetic mean; zero over no rows.
    Average,
}

impl Aggregate {
    /// SQL function name.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Sum => "SUM",
            Self::Average => "AVG",
        }
    }
}

/// One `SET field = value` of a set-based update.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Top-level field name.
    pub field: String,
    /// New value.
    pub value: Value,
}

impl Assignment {
    /// Assign `value` to `field`.
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Canonicalise the field and coerce the value. Key fields and
    /// navigation members cannot be assigned.
    pub fn resolve(&self, schema: &EntitySchema) -> AppResult<Assignment> {
        let field = schema.field(&self.field).ok_or_else(|| {
            AppError::argument(format!(
                "Property '{}' does not exist on type {}",
                self.field,
                schema.name()
            ))
        })?;
        if field.is_key {
            return Err(AppError::argument(format!(
                "Key member '{}' cannot be assigned",
                field.name
            )));
        }
        if self.value.is_null() && !field.nullable {
            return Err(AppError::argument(format!(
                "Member '{}' is not nullable",
                field.name
            )));
        }
        Ok(Assignment {
            field: field.name.clone(),
            value: self.value.clone().coerce(field.kind)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::fixtures::Product;
    use repokit_core::ErrorKind;

    #[test]
    fn test_into_plan_resolves_everything() {
        let plan = Query::<Product>::new()
            .filter(col("Name").contains("rake"))
            .include("Category")
            .include("category")
            .order_by_descending("Price")
            .skip(10)
            .take(5)
            .into_plan()
            .unwrap();

        assert_eq!(plan.includes, vec!["category".to_string()]);
        assert_eq!(
            plan.order,
            vec![SortField::desc("price"), SortField::asc("id")]
        );
        assert_eq!((plan.skip, plan.take), (Some(10), Some(5)));
        assert!(plan.tracking);
    }

    #[test]
    fn test_soft_delete_filter_is_implicit() {
        let plan = Query::<Product>::new().into_plan().unwrap();
        assert_eq!(plan.predicate(), col("is_deleted").eq(false));

        let plan = Query::<Product>::new()
            .ignore_query_filters()
            .into_plan()
            .unwrap();
        assert!(plan.predicate().is_always());
    }

    #[test]
    fn test_projection_disables_tracking() {
        let query = Query::<Product>::new().select(Projection::new().field("name"));
        assert!(!query.is_tracking());
        assert!(!query.into_plan().unwrap().tracking);
    }

    #[test]
    fn test_unknown_sort_member_fails_on_plan() {
        let err = Query::<Product>::new()
            .order_by("Nme")
            .into_plan()
            .unwrap_err();
        assert!(err.is(ErrorKind::Argument));
    }

    #[test]
    fn test_assignment_resolution() {
        let schema = Product::schema();
        let assignment = Assignment::set("Name", "Hoe").resolve(&schema).unwrap();
        assert_eq!(assignment.field, "name");
        assert!(Assignment::set("id", 4).resolve(&schema).is_err());
        assert!(Assignment::set("name", Value::Null).resolve(&schema).is_err());
        assert!(Assignment::set("released", Value::Null).resolve(&schema).is_ok());
    }
}
