//! The specification pattern.
//!
//! A [`Specification`] bundles criteria, includes, ordering, a row window
//! and the tracking mode into one reusable value. Concrete specifications
//! are plain functions or types converting into one:
//!
//! ```
//! # use repokit_entity::{EntitySchema, FieldKind, Reflect};
//! # use repokit_query::{Specification, col};
//! # struct Product;
//! # impl Reflect for Product {
//! #     fn describe() -> EntitySchema {
//! #         EntitySchema::builder("Product").key("id", FieldKind::Int)
//! #             .field("name", FieldKind::Text).field("category_id", FieldKind::Int).build()
//! #     }
//! # }
//! fn products_in_category(category_id: i32) -> Specification<Product> {
//!     Specification::new(col("category_id").eq(category_id))
//!         .order_by("name")
//!         .as_no_tracking()
//! }
//! # let _ = products_in_category(1);
//! ```

use std::marker::PhantomData;

use repokit_core::AppResult;
use repokit_entity::Reflect;

use crate::expr::Expr;
use crate::plan::{Query, QueryPlan};

/// A declarative query descriptor over `T`.
///
/// Built once through consuming setters and read-only afterwards. When
/// both ascending and descending orders are set, the ascending one wins.
/// [`Specification::paging`] does not validate its arguments.
pub struct Specification<T> {
    criteria: Expr,
    includes: Vec<String>,
    order_by: Option<String>,
    order_by_descending: Option<String>,
    skip: Option<u64>,
    take: Option<u64>,
    as_no_tracking: bool,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Reflect> Specification<T> {
    /// A specification filtering by `criteria`.
    pub fn new(criteria: Expr) -> Self {
        Self {
            criteria,
            includes: Vec::new(),
            order_by: None,
            order_by_descending: None,
            skip: None,
            take: None,
            as_no_tracking: false,
            _entity: PhantomData,
        }
    }

    /// Load the relation at `path` with the results.
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(path.into());
        self
    }

    /// Order ascending by `path`.
    pub fn order_by(mut self, path: impl Into<String>) -> Self {
        self.order_by = Some(path.into());
        self
    }

    /// Order descending by `path`.
    pub fn order_by_descending(mut self, path: impl Into<String>) -> Self {
        self.order_by_descending = Some(path.into());
        self
    }

    /// Take at most `count` rows.
    pub fn take(mut self, count: u64) -> Self {
        self.take = Some(count);
        self
    }

    /// Skip `count` rows.
    pub fn skip(mut self, count: u64) -> Self {
        self.skip = Some(count);
        self
    }

    /// Select page `page` (1-based) of `size` rows:
    /// `skip = (page - 1) * size`, `take = size`.
    pub fn paging(mut self, page: u64, size: u64) -> Self {
        self.skip = Some(page.saturating_sub(1).saturating_mul(size));
        self.take = Some(size);
        self
    }

    /// Return untracked results.
    pub fn as_no_tracking(mut self) -> Self {
        self.as_no_tracking = true;
        self
    }

    /// The filter criteria.
    pub fn criteria(&self) -> &Expr {
        &self.criteria
    }

    /// Include paths in declaration order.
    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    /// Ascending order path.
    pub fn order_by_path(&self) -> Option<&str> {
        self.order_by.as_deref()
    }

    /// Descending order path.
    pub fn order_by_descending_path(&self) -> Option<&str> {
        self.order_by_descending.as_deref()
    }

    /// Rows to skip.
    pub fn skip_count(&self) -> Option<u64> {
        self.skip
    }

    /// Rows to take.
    pub fn take_count(&self) -> Option<u64> {
        self.take
    }

    /// Whether results are untracked.
    pub fn is_no_tracking(&self) -> bool {
        self.as_no_tracking
    }

    /// The full query: tracking mode, includes, criteria, order and window.
    pub fn to_query(&self) -> Query<T> {
        let mut query = Query::<T>::new();
        if self.as_no_tracking {
            query = query.as_no_tracking();
        }
        for include in &self.includes {
            query = query.include(include.clone());
        }
        query = query.filter(self.criteria.clone());
        if let Some(path) = &self.order_by {
            query = query.order_by(path.clone());
        } else if let Some(path) = &self.order_by_descending {
            query = query.order_by_descending(path.clone());
        }
        if let Some(skip) = self.skip {
            query = query.skip(skip);
        }
        if let Some(take) = self.take {
            query = query.take(take);
        }
        query
    }

    /// The resolved full plan.
    pub fn to_plan(&self) -> AppResult<QueryPlan> {
        self.to_query().into_plan()
    }

    /// The resolved plan of the criteria alone, for counting and existence.
    pub fn to_criteria_plan(&self) -> AppResult<QueryPlan> {
        Query::<T>::filtered(self.criteria.clone()).into_plan()
    }
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            includes: self.includes.clone(),
            order_by: self.order_by.clone(),
            order_by_descending: self.order_by_descending.clone(),
            skip: self.skip,
            take: self.take,
            as_no_tracking: self.as_no_tracking,
            _entity: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Specification<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Specification")
            .field("criteria", &self.criteria)
            .field("includes", &self.includes)
            .field("order_by", &self.order_by)
            .field("order_by_descending", &self.order_by_descending)
            .field("skip", &self.skip)
            .field("take", &self.take)
            .field("as_no_tracking", &self.as_no_tracking)
            .finish()
    }
}
