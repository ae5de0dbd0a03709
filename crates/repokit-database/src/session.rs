//! The change-tracking session.
//!
//! A [`Session`] owns one store, an identity map of tracked handles and
//! the cancellation signal of its unit of work. Tracked entries keep a
//! snapshot of their scalar members and of each loaded child collection;
//! [`Session::save_changes`] diffs the handles against those snapshots and
//! sends every change to the store in one atomic batch.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use repokit_core::{AppError, AppResult, ErrorKind};
use repokit_entity::{Auditable, Entity, EntityKey, EntitySchema, Record, RelationDescriptor, Value};
use repokit_query::PageOptions;

use crate::store::{Change, Store};
use crate::tracked::{Tracked, TrackedEntry};

/// Tracking state of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked by the session.
    Detached,
    /// Tracked and identical to the loaded state.
    Unchanged,
    /// New; inserted on save.
    Added,
    /// Changed; updated on save.
    Modified,
    /// Removed; deleted on save.
    Deleted,
}

type EntryId = (TypeId, String);

struct Entry {
    schema: Arc<EntitySchema>,
    key: EntityKey,
    state: EntityState,
    original: Option<Record>,
    children: HashMap<String, Vec<Record>>,
    handle: Box<dyn TrackedEntry>,
}

impl Entry {
    fn handle<T: Entity>(&self) -> Option<Tracked<T>> {
        self.handle.as_any().downcast_ref::<Tracked<T>>().cloned()
    }
}

/// Changes collected from the tracked entries.
#[derive(Default)]
struct Pending {
    inserts: Vec<Change>,
    updates: Vec<Change>,
    child_deletes: Vec<Change>,
    deletes: Vec<Change>,
    accepted: Vec<Accepted>,
    removed: Vec<EntryId>,
}

/// State an entry takes on once its changes are saved.
struct Accepted {
    id: EntryId,
    record: Record,
    children: HashMap<String, Vec<Record>>,
    stamped: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.child_deletes.is_empty()
            && self.deletes.is_empty()
    }

    fn into_changes(self) -> (Vec<Change>, Vec<Accepted>, Vec<EntryId>) {
        let mut changes = self.inserts;
        changes.extend(self.updates);
        changes.extend(self.child_deletes);
        changes.extend(self.deletes);
        (changes, self.accepted, self.removed)
    }
}

/// Audit stamping inputs; absent for dry runs.
struct Stamp<'a> {
    actor: &'a Value,
    now: DateTime<Utc>,
}

/// The session-wide cancellation signal. A cancellation is consumed by
/// the calls that observe it, after which a fresh token is armed.
struct Signal {
    generation: u64,
    token: CancellationToken,
}

/// A unit of work's store, identity map and cancellation signal.
pub struct Session {
    store: Arc<dyn Store>,
    entries: Mutex<IndexMap<EntryId, Entry>>,
    actor: RwLock<Value>,
    signal: Mutex<Signal>,
    page_options: PageOptions,
}

impl Session {
    /// A session over `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_page_options(store, PageOptions::default())
    }

    /// A session over `store` with paging defaults.
    pub fn with_page_options(store: Arc<dyn Store>, page_options: PageOptions) -> Self {
        Self {
            store,
            entries: Mutex::new(IndexMap::new()),
            actor: RwLock::new(Value::Null),
            signal: Mutex::new(Signal {
                generation: 0,
                token: CancellationToken::new(),
            }),
            page_options,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Paging defaults for paged queries.
    pub fn page_options(&self) -> &PageOptions {
        &self.page_options
    }

    /// Set the actor stamped into audit members.
    pub fn set_actor(&self, actor: impl Into<Value>) {
        *self.actor.write() = actor.into();
    }

    /// The current actor.
    pub fn actor(&self) -> Value {
        self.actor.read().clone()
    }

    /// The token currently armed for this session's calls. Cancelling it
    /// aborts the calls in flight, or the next call when none is running.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.signal.lock().token.clone()
    }

    /// Abort the store calls in flight, or the next one when none is
    /// running. The session stays usable afterwards.
    pub fn cancel(&self) {
        self.signal.lock().token.cancel();
    }

    /// Run a store call, aborting it when the session is cancelled.
    pub async fn guard<R>(&self, call: impl Future<Output = AppResult<R>>) -> AppResult<R> {
        self.guard_with(None, call).await
    }

    /// Run a store call, aborting it when either the session or `caller`
    /// is cancelled. A cancelled `caller` only affects this call.
    pub async fn guard_with<R>(
        &self,
        caller: Option<&CancellationToken>,
        call: impl Future<Output = AppResult<R>>,
    ) -> AppResult<R> {
        if caller.is_some_and(CancellationToken::is_cancelled) {
            return Err(cancelled());
        }
        let (generation, token) = self.arm()?;
        let caller = caller.cloned().unwrap_or_else(CancellationToken::new);
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.rearm(generation);
                Err(cancelled())
            }
            _ = caller.cancelled() => Err(cancelled()),
            result = call => result,
        }
    }

    /// The armed token for a new call. A pending cancellation is consumed
    /// here and fails the call.
    fn arm(&self) -> AppResult<(u64, CancellationToken)> {
        let mut signal = self.signal.lock();
        if signal.token.is_cancelled() {
            signal.generation += 1;
            signal.token = CancellationToken::new();
            debug!("Pending cancellation consumed");
            return Err(cancelled());
        }
        Ok((signal.generation, signal.token.clone()))
    }

    /// Replace the token of `generation` once its cancellation was observed.
    fn rearm(&self, generation: u64) {
        let mut signal = self.signal.lock();
        if signal.generation == generation && signal.token.is_cancelled() {
            signal.generation += 1;
            signal.token = CancellationToken::new();
        }
    }

    /// Register a loaded record and return its handle. An instance already
    /// tracked under the same key wins over the loaded state; navigation
    /// members it has not loaded yet are filled in.
    pub(crate) fn attach<T: Entity>(&self, record: Record) -> AppResult<Tracked<T>> {
        let schema = T::schema();
        let key = schema.key_of(&record)?.coerce(&schema)?;
        let id = entry_id::<T>(&key);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&id) {
            if let Some(handle) = entry.handle::<T>() {
                merge_navigation(entry, &record)?;
                return Ok(handle);
            }
        }

        let handle = Tracked::new(T::from_record(&record)?);
        entries.insert(
            id,
            Entry {
                original: Some(schema.scalar_values(&record)),
                children: loaded_children(&schema, &record),
                schema,
                key,
                state: EntityState::Unchanged,
                handle: Box::new(handle.clone()),
            },
        );
        Ok(handle)
    }

    /// Begin tracking a new entity.
    pub(crate) fn add<T: Entity>(&self, entity: T) -> AppResult<Tracked<T>> {
        let schema = T::schema();
        let record = entity.to_record()?;
        let key = schema.key_of(&record)?.coerce(&schema)?;
        let id = entry_id::<T>(&key);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&id) {
            if entry.state != EntityState::Deleted {
                return Err(AppError::invalid_operation(format!(
                    "The instance of entity type {} with key {key} is already tracked",
                    schema.name()
                )));
            }
            let handle = entry
                .handle::<T>()
                .ok_or_else(|| AppError::invalid_operation("Tracked entry has another type"))?;
            handle.set(entity);
            entry.state = EntityState::Modified;
            return Ok(handle);
        }

        let handle = Tracked::new(entity);
        let children = loaded_children(&schema, &record)
            .into_keys()
            .map(|name| (name, Vec::new()))
            .collect();
        entries.insert(
            id,
            Entry {
                schema,
                key,
                state: EntityState::Added,
                original: None,
                children,
                handle: Box::new(handle.clone()),
            },
        );
        Ok(handle)
    }

    /// Mark an entity as modified, tracking it when it is not.
    pub(crate) fn update<T: Entity>(&self, entity: T) -> AppResult<Tracked<T>> {
        let schema = T::schema();
        let key = entity.key()?.coerce(&schema)?;
        let id = entry_id::<T>(&key);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&id) {
            if let Some(handle) = entry.handle::<T>() {
                handle.set(entity);
                if entry.state != EntityState::Added {
                    entry.state = EntityState::Modified;
                }
                return Ok(handle);
            }
        }

        let handle = Tracked::new(entity);
        entries.insert(
            id,
            Entry {
                schema,
                key,
                state: EntityState::Modified,
                original: None,
                children: HashMap::new(),
                handle: Box::new(handle.clone()),
            },
        );
        Ok(handle)
    }

    /// Track a handle that may have been loaded without tracking. Tracked
    /// handles are left alone; untracked ones are tracked as modified.
    pub(crate) fn ensure_tracked<T: Entity>(&self, handle: &Tracked<T>) -> AppResult<()> {
        let schema = T::schema();
        let key = handle.read().key()?.coerce(&schema)?;
        let id = entry_id::<T>(&key);
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            if entry.handle::<T>().is_some_and(|tracked| tracked.ptr_eq(handle)) {
                return Ok(());
            }
            if let Some(tracked) = entry.handle::<T>() {
                tracked.set(handle.get());
            }
            if entry.state != EntityState::Added {
                entry.state = EntityState::Modified;
            }
            return Ok(());
        }
        entries.insert(
            id,
            Entry {
                schema,
                key,
                state: EntityState::Modified,
                original: None,
                children: HashMap::new(),
                handle: Box::new(handle.clone()),
            },
        );
        Ok(())
    }

    /// Mark an entity for deletion. A pending insert is simply forgotten.
    pub(crate) fn remove<T: Entity>(&self, handle: &Tracked<T>) -> AppResult<()> {
        let schema = T::schema();
        let key = handle.read().key()?.coerce(&schema)?;
        let id = entry_id::<T>(&key);
        let mut entries = self.entries.lock();
        match entries.get(&id).map(|entry| entry.state) {
            Some(EntityState::Added) => {
                entries.shift_remove(&id);
            }
            Some(_) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.state = EntityState::Deleted;
                }
            }
            None => {
                entries.insert(
                    id,
                    Entry {
                        schema,
                        key,
                        state: EntityState::Deleted,
                        original: None,
                        children: HashMap::new(),
                        handle: Box::new(handle.clone()),
                    },
                );
            }
        }
        Ok(())
    }

    /// The tracked, not deleted instance with `key`.
    pub(crate) fn find<T: Entity>(&self, key: &EntityKey) -> Option<Tracked<T>> {
        let entries = self.entries.lock();
        entries
            .get(&entry_id::<T>(key))
            .filter(|entry| entry.state != EntityState::Deleted)
            .and_then(Entry::handle::<T>)
    }

    /// Whether this exact handle is tracked.
    pub(crate) fn is_tracked<T: Entity>(&self, handle: &Tracked<T>) -> bool {
        self.lookup(handle).is_some()
    }

    /// The tracking state of `handle`, with pending edits detected.
    pub(crate) fn state_of<T: Entity>(&self, handle: &Tracked<T>) -> AppResult<EntityState> {
        let Some(id) = self.lookup(handle) else {
            return Ok(EntityState::Detached);
        };
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(entry) => effective_state(entry),
            None => Ok(EntityState::Detached),
        }
    }

    /// Stop tracking `handle`. Returns whether it was tracked.
    pub(crate) fn detach<T: Entity>(&self, handle: &Tracked<T>) -> bool {
        match self.lookup(handle) {
            Some(id) => self.entries.lock().shift_remove(&id).is_some(),
            None => false,
        }
    }

    /// Stop tracking everything.
    pub fn detach_all(&self) {
        let mut entries = self.entries.lock();
        debug!(entries = entries.len(), "Detaching all tracked entities");
        entries.clear();
    }

    /// All tracked handles of type `T`.
    pub(crate) fn tracked<T: Entity>(&self) -> Vec<Tracked<T>> {
        let type_id = TypeId::of::<T>();
        self.entries
            .lock()
            .iter()
            .filter(|((entry_type, _), _)| *entry_type == type_id)
            .filter_map(|(_, entry)| entry.handle::<T>())
            .collect()
    }

    /// Key and state of every tracked instance of type `T`.
    pub(crate) fn tracking_info<T: Entity>(&self) -> AppResult<Vec<(EntityKey, EntityState)>> {
        let type_id = TypeId::of::<T>();
        self.entries
            .lock()
            .iter()
            .filter(|((entry_type, _), _)| *entry_type == type_id)
            .map(|(_, entry)| Ok((entry.key.clone(), effective_state(entry)?)))
            .collect()
    }

    /// Record the store state of a child collection that was not loaded,
    /// so later edits to it are diffed against the store.
    pub(crate) fn snapshot_collection<T: Entity>(
        &self,
        handle: &Tracked<T>,
        relation: &RelationDescriptor,
        children: &[Record],
    ) -> AppResult<()> {
        let Some(id) = self.lookup(handle) else {
            return Err(AppError::invalid_operation(format!(
                "{} must be tracked to replace its children",
                T::schema().name()
            )));
        };
        let target = relation.target();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry
                .children
                .entry(relation.name.clone())
                .or_insert_with(|| children.iter().map(|child| target.scalar_values(child)).collect());
        }
        Ok(())
    }

    /// Whether a relation's children are snapshotted for `handle`.
    pub(crate) fn has_collection_snapshot<T: Entity>(&self, handle: &Tracked<T>, relation: &str) -> bool {
        let Some(id) = self.lookup(handle) else {
            return false;
        };
        self.entries
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.children.contains_key(relation))
    }

    /// Replace a tracked instance's state with a fresh store row and mark
    /// it unchanged. `None` means the row is gone and detaches it.
    pub(crate) fn refresh<T: Entity>(&self, handle: &Tracked<T>, record: Option<Record>) -> AppResult<()> {
        let Some(id) = self.lookup(handle) else {
            if let Some(record) = record {
                handle.overwrite(&record)?;
            }
            return Ok(());
        };
        let mut entries = self.entries.lock();
        match record {
            Some(record) => {
                handle.overwrite(&record)?;
                if let Some(entry) = entries.get_mut(&id) {
                    entry.original = Some(entry.schema.scalar_values(&record));
                    entry.children = loaded_children(&entry.schema, &record);
                    entry.state = EntityState::Unchanged;
                }
            }
            None => {
                entries.shift_remove(&id);
            }
        }
        Ok(())
    }

    /// Whether saving would write anything.
    pub fn has_changes(&self) -> AppResult<bool> {
        let entries = self.entries.lock();
        Ok(!collect(&entries, None)?.is_empty())
    }

    /// Persist every tracked change in one atomic batch and accept the
    /// saved state. Store failures surface as one `StoreOperation` error
    /// carrying the cause.
    pub async fn save_changes(&self) -> AppResult<u64> {
        self.save_changes_with(None).await
    }

    /// [`Session::save_changes`], also aborted when `token` is cancelled.
    pub async fn save_changes_cancellable(&self, token: &CancellationToken) -> AppResult<u64> {
        self.save_changes_with(Some(token)).await
    }

    async fn save_changes_with(&self, caller: Option<&CancellationToken>) -> AppResult<u64> {
        let actor = self.actor();
        let (changes, accepted, removed) = {
            let entries = self.entries.lock();
            let stamp = Stamp {
                actor: &actor,
                now: Utc::now(),
            };
            collect(&entries, Some(&stamp))?.into_changes()
        };
        if changes.is_empty() {
            debug!("No changes to save");
            return Ok(0);
        }

        let affected = match self.guard_with(caller, self.store.apply(&changes)).await {
            Ok(affected) => affected,
            Err(e) if e.is(ErrorKind::Cancelled) => return Err(e),
            Err(e) => {
                warn!(error = %e, changes = changes.len(), "Saving changes failed");
                return Err(AppError::with_source(
                    ErrorKind::StoreOperation,
                    "Error occurred while saving changes",
                    e,
                ));
            }
        };

        let mut entries = self.entries.lock();
        for accepted in accepted {
            if let Some(entry) = entries.get_mut(&accepted.id) {
                if accepted.stamped {
                    entry.handle.overwrite(&accepted.record)?;
                }
                entry.original = Some(entry.schema.scalar_values(&accepted.record));
                entry.children = accepted.children;
                entry.state = EntityState::Unchanged;
            }
        }
        for id in &removed {
            entries.shift_remove(id);
        }
        info!(changes = changes.len(), affected, "Saved changes");
        Ok(affected)
    }

    fn lookup<T: Entity>(&self, handle: &Tracked<T>) -> Option<EntryId> {
        let key = handle.read().key().ok()?.coerce(&T::schema()).ok()?;
        let id = entry_id::<T>(&key);
        let entries = self.entries.lock();
        let entry = entries.get(&id)?;
        entry
            .handle::<T>()
            .filter(|tracked| tracked.ptr_eq(handle))
            .map(|_| id)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("tracked", &self.entries.lock().len())
            .field("cancelled", &self.signal.lock().token.is_cancelled())
            .finish()
    }
}

fn cancelled() -> AppError {
    AppError::cancelled("The operation was cancelled")
}

fn entry_id<T: 'static>(key: &EntityKey) -> EntryId {
    (TypeId::of::<T>(), key.canonical())
}

/// Scalar snapshots of the child collections loaded on `record`.
fn loaded_children(schema: &EntitySchema, record: &Record) -> HashMap<String, Vec<Record>> {
    schema
        .relations()
        .iter()
        .filter(|relation| relation.is_collection())
        .filter_map(|relation| {
            let items = record.get(&relation.name)?.as_list()?;
            let target = relation.target();
            let children = items
                .iter()
                .filter_map(Value::as_record)
                .map(|child| target.scalar_values(child))
                .collect();
            Some((relation.name.clone(), children))
        })
        .collect()
}

/// Fill navigation members of a tracked instance that `record` loaded and
/// the instance has not.
fn merge_navigation(entry: &mut Entry, record: &Record) -> AppResult<()> {
    let mut current = entry.handle.record()?;
    let mut merged = false;
    for relation in entry.schema.relations() {
        let Some(incoming) = record.get(&relation.name) else {
            continue;
        };
        let missing = if relation.is_collection() {
            !entry.children.contains_key(&relation.name)
        } else {
            current.get(&relation.name).is_none_or(Value::is_null)
        };
        if missing && !incoming.is_null() {
            current.insert(relation.name.clone(), incoming.clone());
            merged = true;
        }
    }
    if merged {
        entry.handle.overwrite(&current)?;
        for (name, children) in loaded_children(&entry.schema, &current) {
            entry.children.entry(name).or_insert(children);
        }
    }
    Ok(())
}

fn effective_state(entry: &Entry) -> AppResult<EntityState> {
    if entry.state != EntityState::Unchanged {
        return Ok(entry.state);
    }
    let record = entry.handle.record()?;
    let scalar_changed = entry
        .original
        .as_ref()
        .is_some_and(|original| *original != entry.schema.scalar_values(&record));
    if scalar_changed {
        return Ok(EntityState::Modified);
    }
    let mut probe = Pending::default();
    diff_collections(entry, &record, &mut probe)?;
    Ok(if probe.is_empty() {
        EntityState::Unchanged
    } else {
        EntityState::Modified
    })
}

/// Collect the pending changes of all entries. With a stamp, audit
/// members are written into the collected records only; the handles see
/// them once the save succeeds.
fn collect(entries: &IndexMap<EntryId, Entry>, stamp: Option<&Stamp<'_>>) -> AppResult<Pending> {
    let mut pending = Pending::default();
    for (id, entry) in entries {
        let schema = &entry.schema;
        match entry.state {
            EntityState::Detached => {}
            EntityState::Deleted => {
                pending.deletes.push(Change::Delete {
                    schema: Arc::clone(schema),
                    key: entry.key.clone(),
                });
                pending.removed.push(id.clone());
            }
            EntityState::Added => {
                let mut record = entry.handle.record()?;
                let mut stamped = false;
                if let (Some(stamp), Ok(audit)) = (stamp, Auditable::probe(schema)) {
                    audit.stamp_created(&mut record, stamp.actor, stamp.now)?;
                    stamped = true;
                }
                pending.inserts.push(Change::Insert {
                    schema: Arc::clone(schema),
                    record: schema.scalar_values(&record),
                });
                let children = diff_collections(entry, &record, &mut pending)?;
                pending.accepted.push(Accepted {
                    id: id.clone(),
                    record,
                    children,
                    stamped,
                });
            }
            EntityState::Modified | EntityState::Unchanged => {
                let mut record = entry.handle.record()?;
                let mut values = changed_values(entry, &record)?;
                let forced = entry.state == EntityState::Modified && entry.original.is_none();
                let mut stamped = false;
                if !values.is_empty() || forced {
                    if let (Some(stamp), Ok(audit)) = (stamp, Auditable::probe(schema)) {
                        audit.stamp_modified(&mut record, stamp.actor, stamp.now)?;
                        values = changed_values(entry, &record)?;
                        stamped = true;
                    }
                }
                if !values.is_empty() {
                    pending.updates.push(Change::Update {
                        schema: Arc::clone(schema),
                        key: entry.key.clone(),
                        values,
                    });
                }
                let children = diff_collections(entry, &record, &mut pending)?;
                pending.accepted.push(Accepted {
                    id: id.clone(),
                    record,
                    children,
                    stamped,
                });
            }
        }
    }
    Ok(pending)
}

/// Non-key scalar members that differ from the snapshot; all of them
/// when there is no snapshot and the entry is modified.
fn changed_values(entry: &Entry, record: &Record) -> AppResult<Record> {
    let schema = &entry.schema;
    let current = schema.scalar_values(record);
    if schema.key_of(&current)?.coerce(schema)? != entry.key {
        return Err(AppError::invalid_operation(format!(
            "The key of {} {} is part of its identity and cannot change",
            schema.name(),
            entry.key
        )));
    }
    let non_key = schema.fields().iter().filter(|field| !field.is_key);
    Ok(match &entry.original {
        Some(original) => non_key
            .filter(|field| original.get(&field.name) != current.get(&field.name))
            .map(|field| (field.name.clone(), current.get(&field.name).cloned().unwrap_or_default()))
            .collect(),
        None if entry.state == EntityState::Modified => non_key
            .map(|field| (field.name.clone(), current.get(&field.name).cloned().unwrap_or_default()))
            .collect(),
        None => Record::new(),
    })
}

/// Diff each snapshotted child collection of `entry` against `record`.
/// Returns the new snapshots.
fn diff_collections(entry: &Entry, record: &Record, pending: &mut Pending) -> AppResult<HashMap<String, Vec<Record>>> {
    let mut snapshots = HashMap::new();
    for (name, before) in &entry.children {
        let Some(relation) = entry.schema.relation(name) else {
            continue;
        };
        let after = match record.get(&relation.name).and_then(Value::as_list) {
            Some(items) => current_children(&entry.schema, relation, record, items)?,
            None => {
                snapshots.insert(name.clone(), before.clone());
                continue;
            }
        };
        let target = relation.target();
        let keyed = |rows: &[Record]| -> AppResult<IndexMap<EntityKey, Record>> {
            rows.iter()
                .map(|row| Ok((target.key_of(row)?.coerce(&target)?, row.clone())))
                .collect()
        };
        let old = keyed(before)?;
        let new = keyed(&after)?;

        for key in old.keys().filter(|key| !new.contains_key(*key)) {
            pending.child_deletes.push(Change::Delete {
                schema: Arc::clone(&target),
                key: key.clone(),
            });
        }
        for (key, row) in &new {
            match old.get(key) {
                None => pending.inserts.push(Change::Insert {
                    schema: Arc::clone(&target),
                    record: row.clone(),
                }),
                Some(previous) => {
                    let values: Record = target
                        .fields()
                        .iter()
                        .filter(|field| !field.is_key && previous.get(&field.name) != row.get(&field.name))
                        .map(|field| (field.name.clone(), row.get(&field.name).cloned().unwrap_or_default()))
                        .collect();
                    if !values.is_empty() {
                        pending.updates.push(Change::Update {
                            schema: Arc::clone(&target),
                            key: key.clone(),
                            values,
                        });
                    }
                }
            }
        }
        snapshots.insert(name.clone(), after);
    }
    Ok(snapshots)
}

/// Scalar records of the loaded children with the foreign key pointing
/// at the parent.
fn current_children(
    schema: &EntitySchema,
    relation: &RelationDescriptor,
    parent: &Record,
    items: &[Value],
) -> AppResult<Vec<Record>> {
    let target = relation.target();
    let parent_key = parent
        .get(&schema.single_key()?.name)
        .cloned()
        .unwrap_or_default();
    let foreign_key = target.field(&relation.foreign_key).ok_or_else(|| {
        AppError::argument(format!(
            "Foreign key '{}' does not exist on type {}",
            relation.foreign_key,
            target.name()
        ))
    })?;
    let parent_key = parent_key.coerce(foreign_key.kind)?;
    Ok(items
        .iter()
        .filter_map(Value::as_record)
        .map(|child| {
            let mut row = target.scalar_values(child);
            row.insert(foreign_key.name.clone(), parent_key.clone());
            row
        })
        .collect())
}
