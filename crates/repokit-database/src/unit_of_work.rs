//! The unit of work.
//!
//! A [`UnitOfWork`] owns one session and at most one active transaction.
//! Repositories are created on first request and cached per entity type
//! for its lifetime.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repokit_core::config::{AppConfig, PagingConfig};
use repokit_core::{AppError, AppResult};
use repokit_entity::{Entity, Reflect, Value};
use repokit_query::PageOptions;

use crate::connection::DatabasePool;
use crate::repository::Repository;
use crate::session::Session;
use crate::store::{MemoryDatabase, PgStore, Store};

/// A concrete repository wrapping the generic one for its entity type.
pub trait CustomRepository: Send + Sync + 'static {
    /// The entity type served.
    type Entity: Entity;

    /// Build the concrete repository around the generic one.
    fn from_repository(repository: Arc<Repository<Self::Entity>>) -> Self;
}

type Shared = Arc<dyn Any + Send + Sync>;

/// One session, its repositories and its transaction.
pub struct UnitOfWork {
    session: Arc<Session>,
    repositories: DashMap<TypeId, Shared>,
    registrations: DashMap<TypeId, TypeId>,
    custom: DashMap<TypeId, Shared>,
}

impl UnitOfWork {
    /// A unit of work over `store` with default paging options.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_options(store, PageOptions::default())
    }

    /// A unit of work over `store` with the given paging options.
    pub fn with_options(store: Arc<dyn Store>, options: PageOptions) -> Self {
        Self {
            session: Arc::new(Session::with_page_options(store, options)),
            repositories: DashMap::new(),
            registrations: DashMap::new(),
            custom: DashMap::new(),
        }
    }

    /// A unit of work over a shared in-memory database.
    pub fn memory(database: &Arc<MemoryDatabase>) -> Self {
        Self::new(Arc::new(database.store()))
    }

    /// A unit of work over a Postgres pool.
    pub fn postgres(pool: &DatabasePool) -> Self {
        Self::new(Arc::new(PgStore::new(pool)))
    }

    /// Connect to the configured database, check it answers and apply the
    /// paging defaults.
    pub async fn from_config(config: &AppConfig) -> AppResult<Self> {
        let pool = DatabasePool::connect(&config.database).await?;
        pool.ping().await?;
        Ok(Self::postgres(&pool).with_paging(&config.paging))
    }

    /// Replace the paging defaults. Drops cached repositories.
    pub fn with_paging(self, config: &PagingConfig) -> Self {
        Self::with_options(Arc::clone(self.session.store()), PageOptions::from(config))
    }

    /// The underlying session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The repository for `T`, created on first request.
    pub fn repository<T: Entity>(&self) -> Arc<Repository<T>> {
        let shared = self
            .repositories
            .entry(TypeId::of::<T>())
            .or_insert_with(|| {
                debug!(entity = T::schema().name(), "Creating repository");
                Arc::new(Repository::<T>::new(Arc::clone(&self.session))) as Shared
            })
            .clone();
        match shared.downcast::<Repository<T>>() {
            Ok(repository) => repository,
            Err(_) => Arc::new(Repository::new(Arc::clone(&self.session))),
        }
    }

    /// Register `R` as the concrete repository of its entity type.
    pub fn register<R: CustomRepository>(&self) {
        self.registrations
            .insert(TypeId::of::<R::Entity>(), TypeId::of::<R>());
        self.custom.remove(&TypeId::of::<R>());
    }

    /// The registered concrete repository `R`, created on first request.
    pub fn custom<R: CustomRepository>(&self) -> AppResult<Arc<R>> {
        let registered = self
            .registrations
            .get(&TypeId::of::<R::Entity>())
            .map(|entry| *entry.value());
        if registered != Some(TypeId::of::<R>()) {
            return Err(AppError::invalid_operation(format!(
                "{} is not the registered repository of {}",
                std::any::type_name::<R>(),
                <R::Entity as Reflect>::schema().name()
            )));
        }
        let shared = self
            .custom
            .entry(TypeId::of::<R>())
            .or_insert_with(|| Arc::new(R::from_repository(self.repository::<R::Entity>())) as Shared)
            .clone();
        shared
            .downcast::<R>()
            .map_err(|_| AppError::invalid_operation("Cached repository has another type"))
    }

    /// Start a transaction. Only one may be active at a time.
    pub async fn begin_transaction(&self) -> AppResult<()> {
        if self.session.store().in_transaction() {
            return Err(AppError::invalid_operation("A transaction is already active"));
        }
        self.session.guard(self.session.store().begin()).await?;
        info!("Transaction started");
        Ok(())
    }

    /// Commit the active transaction. The transaction is released even
    /// when the commit fails.
    pub async fn commit(&self) -> AppResult<()> {
        if !self.session.store().in_transaction() {
            return Err(AppError::invalid_operation("No active transaction to commit"));
        }
        match self.session.store().commit().await {
            Ok(()) => {
                info!("Transaction committed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transaction commit failed");
                Err(e.into_store_error("Failed to commit transaction"))
            }
        }
    }

    /// Roll back the active transaction. The transaction is released even
    /// when the rollback fails.
    pub async fn rollback(&self) -> AppResult<()> {
        if !self.session.store().in_transaction() {
            return Err(AppError::invalid_operation("No active transaction to roll back"));
        }
        match self.session.store().rollback().await {
            Ok(()) => {
                info!("Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transaction rollback failed");
                Err(e.into_store_error("Failed to roll back transaction"))
            }
        }
    }

    /// Whether a transaction is active.
    pub fn in_transaction(&self) -> bool {
        self.session.store().in_transaction()
    }

    /// Persist all tracked changes in one atomic batch.
    pub async fn save_changes(&self) -> AppResult<u64> {
        self.session.save_changes().await
    }

    /// [`UnitOfWork::save_changes`], also aborted when `token` is cancelled.
    pub async fn save_changes_cancellable(&self, token: &CancellationToken) -> AppResult<u64> {
        self.session.save_changes_cancellable(token).await
    }

    /// Whether saving would write anything.
    pub fn has_changes(&self) -> AppResult<bool> {
        self.session.has_changes()
    }

    /// Forget every tracked entity without touching the store.
    pub fn detach_all_entities(&self) {
        self.session.detach_all();
    }

    /// Set the actor stamped into audit members on save.
    pub fn set_actor(&self, actor: impl Into<Value>) {
        self.session.set_actor(actor);
    }

    /// The token armed for the store calls of this unit of work, for
    /// cancelling from elsewhere.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.cancellation_token()
    }

    /// Abort the store calls in flight, or the next one when none is
    /// running. Later calls proceed normally.
    pub fn cancel(&self) {
        warn!("Unit of work cancelled");
        self.session.cancel();
    }

    /// Roll back an active transaction and release tracked state.
    pub async fn dispose(self) -> AppResult<()> {
        let result = if self.in_transaction() {
            self.rollback().await
        } else {
            Ok(())
        };
        self.session.detach_all();
        self.repositories.clear();
        self.custom.clear();
        debug!("Unit of work disposed");
        result
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("session", &self.session)
            .field("repositories", &self.repositories.len())
            .finish()
    }
}
