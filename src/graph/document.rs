//! Documents: one replica plus the object-graph bookkeeping layered on it
//!
//! All substrate access goes through a reentrant gate. Holding it across a
//! transaction serializes writers from other threads, while code on the
//! owning thread (nested transactions, callbacks, cross-document moves) can
//! re-enter freely.

use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::cache::SingletonCache;
use super::entity::Entity;
use super::layout::{self, ContainerRole};
use super::notify::{self, ChangeKey, ChangeObserver, Notifier, ObserverId, Subscription, SubscriptionId};
use super::ownership::{self, OwnerSlot, OwnershipTracker};
use super::reference::{DependencyId, EntityId, RefTuple};
use super::repair::{self, RepairReport};
use super::schema::{SchemaRegistry, TypeSchema};
use super::store::{DocumentStore, StoreInner};
use crate::config::GraphConfig;
use crate::convergent::{ContainerId, Horizon, OpEnvelope, Replica, Savepoint, Update, Value};
use crate::error::{GraphError, Result};

/// Undo step for effects outside this document's replica (handle bindings,
/// other documents), run in reverse order when a transaction rolls back
pub(crate) type Compensation = Box<dyn FnOnce() + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    /// Shared through replication
    Replicated,
    /// Private backing store for an ephemeral entity; never replicated
    Scratch,
}

struct TxnFrame {
    depth: usize,
    journal: Vec<Compensation>,
    changes: Vec<ChangeKey>,
}

struct TxnMark {
    outermost: bool,
    savepoint: Savepoint,
    ownership: usize,
    journal: usize,
    changes: usize,
}

pub(crate) struct DocState {
    pub replica: Replica,
    pub ownership: OwnershipTracker,
    txn: Option<TxnFrame>,
    /// Remote updates that arrived while a transaction was open
    queued: Vec<Update>,
}

impl DocState {
    fn new(replica: Replica) -> Self {
        Self {
            replica,
            ownership: OwnershipTracker::default(),
            txn: None,
            queued: Vec::new(),
        }
    }

    pub fn type_of(&self, id: &EntityId) -> Option<String> {
        self.replica
            .map_get(&layout::entities(), id.as_str())
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn contains_entity(&self, id: &EntityId) -> bool {
        self.type_of(id).is_some()
    }

    pub fn schema_of(&self, registry: &SchemaRegistry, id: &EntityId) -> Result<Arc<TypeSchema>> {
        let type_name = self
            .type_of(id)
            .ok_or_else(|| GraphError::NotFound(id.clone()))?;
        registry.get(&type_name)
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn open(&mut self, seed: Vec<ChangeKey>) -> Result<TxnMark> {
        if let Some(frame) = self.txn.as_mut() {
            frame.depth += 1;
            frame.changes.extend(seed);
            let (journal, changes) = (frame.journal.len(), frame.changes.len());
            return Ok(TxnMark {
                outermost: false,
                savepoint: self.replica.savepoint()?,
                ownership: self.ownership.mark(),
                journal,
                changes,
            });
        }
        let savepoint = self.replica.begin()?;
        self.ownership.begin();
        self.txn = Some(TxnFrame {
            depth: 1,
            journal: Vec::new(),
            changes: seed,
        });
        Ok(TxnMark {
            outermost: true,
            savepoint,
            ownership: 0,
            journal: 0,
            changes: 0,
        })
    }

    fn leave_nested(&mut self) {
        if let Some(frame) = self.txn.as_mut() {
            frame.depth -= 1;
        }
    }

    fn rollback(&mut self, mark: &TxnMark) -> Vec<Compensation> {
        self.replica.rollback_to(&mark.savepoint);
        self.ownership.rollback_to(mark.ownership);
        let mut undo = Vec::new();
        if let Some(frame) = self.txn.as_mut() {
            undo = frame.journal.split_off(mark.journal.min(frame.journal.len()));
            frame.changes.truncate(mark.changes);
            frame.depth -= 1;
        }
        if mark.outermost {
            self.replica.abort(&mark.savepoint);
            self.ownership.end();
            self.txn = None;
        }
        undo
    }

    fn close(&mut self) -> (Vec<OpEnvelope>, Option<TxnFrame>) {
        let ops = self.replica.commit();
        self.ownership.end();
        (ops, self.txn.take())
    }
}

pub(crate) struct DocInner {
    id: Uuid,
    kind: DocumentKind,
    config: GraphConfig,
    registry: Arc<SchemaRegistry>,
    gate: ReentrantMutex<RefCell<DocState>>,
    cache: Mutex<SingletonCache>,
    notifier: Mutex<Notifier>,
    /// Entities that left this (scratch) document, and where they went
    forwards: Mutex<HashMap<EntityId, Document>>,
    /// Dependency documents known to this process
    links: Mutex<HashMap<Uuid, Weak<DocInner>>>,
    store: Mutex<Option<Weak<StoreInner>>>,
    updates: broadcast::Sender<Update>,
}

/// A replicated document holding a typed object graph.
///
/// Cloning is cheap and yields another handle to the same document.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocInner>,
}

impl Document {
    /// Create a fresh replicated document
    pub fn new(registry: Arc<SchemaRegistry>, config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let doc = Self::build(Uuid::new_v4(), DocumentKind::Replicated, registry, config);
        doc.transact(|| {
            let id = doc.id().to_string();
            let version = i64::from(doc.inner.config.schema_version);
            doc.with_state(|s| -> Result<()> {
                s.replica
                    .map_put(&layout::meta(), layout::META_DOCUMENT_ID, Value::string(id))?;
                s.replica
                    .map_put(&layout::meta(), layout::META_SCHEMA_VERSION, Value::int(version))?;
                Ok(())
            })
        })?;
        log::info!(
            "Created document {} as replica {}",
            doc.id(),
            doc.replica_id()
        );
        Ok(doc)
    }

    /// Load a document from encoded state (as produced by `encode_state`)
    pub fn from_state(registry: Arc<SchemaRegistry>, config: GraphConfig, state: &[u8]) -> Result<Self> {
        config.validate()?;
        let update = Update::from_cbor(state)?;
        let doc = Self::build(update.document_id, DocumentKind::Replicated, registry, config);
        doc.integrate(update)?;
        log::info!(
            "Loaded document {} as replica {}",
            doc.id(),
            doc.replica_id()
        );
        Ok(doc)
    }

    /// A new replica of this document, seeded with everything it has seen
    pub fn replicate(&self, replica_id: &str) -> Result<Self> {
        let config = self.inner.config.clone().with_replica_id(replica_id);
        Self::from_state(self.inner.registry.clone(), config, &self.encode_state()?)
    }

    pub(crate) fn scratch(registry: Arc<SchemaRegistry>) -> Self {
        let config = GraphConfig::default().with_replica_id("scratch");
        Self::build(Uuid::new_v4(), DocumentKind::Scratch, registry, config)
    }

    fn build(id: Uuid, kind: DocumentKind, registry: Arc<SchemaRegistry>, config: GraphConfig) -> Self {
        let replica = Replica::new(config.resolve_replica_id());
        let (updates, _) = broadcast::channel(config.update_channel_capacity);
        Self {
            inner: Arc::new(DocInner {
                id,
                kind,
                config,
                registry,
                gate: ReentrantMutex::new(RefCell::new(DocState::new(replica))),
                cache: Mutex::new(SingletonCache::default()),
                notifier: Mutex::new(Notifier::default()),
                forwards: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                store: Mutex::new(None),
                updates,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> DocumentKind {
        self.inner.kind
    }

    pub fn is_scratch(&self) -> bool {
        self.inner.kind == DocumentKind::Scratch
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.inner.registry
    }

    pub fn replica_id(&self) -> String {
        self.read(|s| s.replica.replica_id().clone())
    }

    /// Same underlying document (not merely the same id)
    pub fn same(&self, other: &Document) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// `schemaVersion` from the replicated metadata
    pub fn schema_version(&self) -> Option<u32> {
        self.read(|s| {
            s.replica
                .map_get(&layout::meta(), layout::META_SCHEMA_VERSION)
                .and_then(Value::as_int)
                .and_then(|v| u32::try_from(v).ok())
        })
    }

    pub fn store(&self) -> Option<DocumentStore> {
        self.inner
            .store
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(DocumentStore::from_inner)
    }

    pub(crate) fn attach_store(&self, store: Weak<StoreInner>) {
        *self.inner.store.lock() = Some(store);
    }

    // ---- State access ----

    pub(crate) fn read<R>(&self, f: impl FnOnce(&DocState) -> R) -> R {
        let guard = self.inner.gate.lock();
        let state = guard.borrow();
        let result = f(&state);
        result
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut DocState) -> R) -> R {
        let guard = self.inner.gate.lock();
        let mut state = guard.borrow_mut();
        let result = f(&mut state);
        result
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, SingletonCache> {
        self.inner.cache.lock()
    }

    pub(crate) fn notifier(&self) -> MutexGuard<'_, Notifier> {
        self.inner.notifier.lock()
    }

    // ---- Transactions ----

    /// Run `f` atomically. Nested calls join the enclosing transaction; an
    /// error rolls back to where the failing call began, and an error that
    /// escapes the outermost call leaves the document untouched.
    ///
    /// Change notifications are delivered once, after the outermost commit.
    pub fn transact<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.run_transaction(Vec::new(), f)
    }

    fn run_transaction<R>(&self, seed: Vec<ChangeKey>, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let _gate = self.inner.gate.lock();
        let mark = self.with_state(|s| s.open(seed))?;
        match f() {
            Ok(value) => {
                if mark.outermost {
                    self.finish_commit();
                } else {
                    self.with_state(DocState::leave_nested);
                }
                Ok(value)
            }
            Err(e) => {
                let undo = self.with_state(|s| s.rollback(&mark));
                for step in undo.into_iter().rev() {
                    step();
                }
                if mark.outermost {
                    log::debug!("Rolled back transaction on {}: {}", self.id(), e);
                    self.drain_queued();
                }
                Err(e)
            }
        }
    }

    fn finish_commit(&self) {
        let (ops, frame) = self.with_state(DocState::close);
        let changes = match frame {
            Some(frame) => {
                drop(frame.journal);
                frame.changes
            }
            None => Vec::new(),
        };
        if !ops.is_empty() {
            log::trace!("Committed {} ops on {}", ops.len(), self.id());
            if !self.is_scratch() {
                // No receivers is fine
                let _ = self.inner.updates.send(Update::new(self.id(), ops));
            }
        }
        self.deliver(changes);
        self.drain_queued();
    }

    pub(crate) fn record_change(&self, key: ChangeKey) {
        self.with_state(|s| {
            if let Some(frame) = s.txn.as_mut() {
                frame.changes.push(key);
            }
        });
    }

    pub(crate) fn push_compensation(&self, step: impl FnOnce() + Send + 'static) {
        self.with_state(|s| match s.txn.as_mut() {
            Some(frame) => frame.journal.push(Box::new(step)),
            None => log::warn!("Compensation recorded outside a transaction on {}", self.inner.id),
        });
    }

    // ---- Notification ----

    pub fn add_observer(&self, observer: Arc<dyn ChangeObserver>) -> ObserverId {
        self.notifier().add_observer(observer)
    }

    pub fn remove_observer(&self, id: &ObserverId) -> bool {
        self.notifier().remove_observer(id)
    }

    /// Call `callback` once per committed transaction that changes
    /// `entity.field`
    pub fn subscribe_to_changes(
        &self,
        entity: &EntityId,
        field: &str,
        callback: impl Fn(&ChangeKey) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.notifier().subscribe(Subscription {
            entity: entity.clone(),
            field: field.to_string(),
            callback: Arc::new(callback),
        })
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.notifier().unsubscribe(id)
    }

    pub(crate) fn track_access(&self, entity: &EntityId, field: &str) {
        let observers = self.notifier().observers();
        for observer in observers {
            observer.field_accessed(self.inner.id, entity, field);
        }
    }

    fn deliver(&self, changes: Vec<ChangeKey>) {
        let changes = notify::dedup(changes);
        if changes.is_empty() {
            return;
        }
        let (observers, callbacks) = {
            let notifier = self.notifier();
            (notifier.observers(), notifier.matching(&changes))
        };
        log::trace!(
            "Delivering {} changes on {} to {} observers and {} subscriptions",
            changes.len(),
            self.inner.id,
            observers.len(),
            callbacks.len()
        );
        for observer in observers {
            observer.changes_committed(self.inner.id, &changes);
        }
        for (callback, key) in callbacks {
            callback(&key);
        }
    }

    // ---- Entities ----

    /// The live handle for an entity stored in this document
    pub fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        self.resolve_local(id)
    }

    pub(crate) fn resolve_local(&self, id: &EntityId) -> Result<Entity> {
        if let Some(entity) = self.cache().lookup(id) {
            return Ok(entity);
        }
        let forwarded = self.inner.forwards.lock().get(id).cloned();
        if let Some(target) = forwarded {
            return target.resolve_local(id);
        }

        let schema = self.read(|s| -> Result<Arc<TypeSchema>> {
            let schema = s.schema_of(&self.inner.registry, id)?;
            let fields = layout::fields(id);
            for spec in schema.fields().iter().filter(|f| f.is_scalar()) {
                if !s.replica.map_contains(&fields, &spec.name) && spec.initial_value().is_none() {
                    log::warn!("{} {} has no value for {}", schema.name(), id, spec.name);
                }
            }
            Ok(schema)
        })?;

        let mut cache = self.cache();
        Ok(cache.get_or_insert_with(id, || Entity::bind(id.clone(), schema, self.clone())))
    }

    /// Resolve a reference without waiting. Fails with
    /// `DependencyUnavailable` if the dependency document is not loaded.
    pub fn try_resolve(&self, reference: &RefTuple) -> Result<Entity> {
        let Some(dep) = &reference.dependency else {
            return self.resolve_local(&reference.id);
        };
        let target = self.dependency_target(dep)?;
        let doc = self
            .loaded_document(target)
            .ok_or(GraphError::DependencyUnavailable(target))?;
        doc.resolve_local(&reference.id)
    }

    /// Resolve a reference, waiting for its dependency document to be loaded
    /// into the store if necessary
    pub async fn resolve(&self, reference: &RefTuple) -> Result<Entity> {
        let Some(dep) = &reference.dependency else {
            return self.resolve_local(&reference.id);
        };
        let target = self.dependency_target(dep)?;
        let doc = match self.loaded_document(target) {
            Some(doc) => doc,
            None => match self.store() {
                Some(store) => {
                    log::debug!("Waiting for dependency {} of {}", target, self.id());
                    store.wait_for(target).await
                }
                None => return Err(GraphError::DependencyUnavailable(target)),
            },
        };
        doc.resolve_local(&reference.id)
    }

    /// The reference this document would store to point at `entity`
    pub fn reference_of(&self, entity: &Entity) -> Result<RefTuple> {
        super::reference::reference_of(entity, self)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.read(|s| s.contains_entity(id))
    }

    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.read(|s| {
            s.replica
                .map_entries(&layout::entities())
                .into_iter()
                .map(|(id, _)| EntityId::from(id))
                .collect()
        })
    }

    /// Where an entity is owned, according to the ownership index
    pub fn owner_slot(&self, id: &EntityId) -> Option<OwnerSlot> {
        self.read(|s| s.ownership.slot(id).cloned())
    }

    /// Number of live entity handles bound to this document
    pub fn cached_entities(&self) -> usize {
        self.cache().live_count()
    }

    pub(crate) fn forward(&self, id: EntityId, to: Document) {
        self.inner.forwards.lock().insert(id, to);
    }

    pub(crate) fn unforward(&self, id: &EntityId) {
        self.inner.forwards.lock().remove(id);
    }

    pub(crate) fn forwarded_to(&self, id: &EntityId) -> Option<Document> {
        self.inner.forwards.lock().get(id).cloned()
    }

    // ---- Roots ----

    fn root_ref(&self, name: &str) -> Option<RefTuple> {
        self.read(|s| {
            s.replica
                .map_get(&layout::roots(), name)
                .and_then(RefTuple::from_value)
        })
    }

    /// Place `entity` under a named root, moving it if it is owned
    /// elsewhere. Returns the entity it displaced, now orphaned.
    pub fn set_root(&self, name: &str, entity: &Entity) -> Result<Option<Entity>> {
        if name.is_empty() {
            return Err(GraphError::OwnershipConflict {
                entity: entity.id().clone(),
                reason: "root names must not be empty".into(),
            });
        }
        self.transact(|| {
            let slot = OwnerSlot::root(name);
            if entity.document().same(self) && self.owner_slot(entity.id()).as_ref() == Some(&slot) {
                return Ok(None);
            }
            ownership::request_adoption(self, entity, slot)?;

            let previous = match self.root_ref(name) {
                Some(r) => {
                    let displaced = self.try_resolve(&r).ok();
                    ownership::inform_orphanization(self, &r.id);
                    displaced
                }
                None => None,
            };
            let reference = RefTuple::local(entity.id().clone()).to_value();
            self.with_state(|s| s.replica.map_put(&layout::roots(), name, reference))?;
            self.record_change(ChangeKey::Root(name.to_string()));
            Ok(previous)
        })
    }

    pub fn root(&self, name: &str) -> Result<Option<Entity>> {
        match self.root_ref(name) {
            Some(r) => self.try_resolve(&r).map(Some),
            None => Ok(None),
        }
    }

    /// Detach a root; the entity it held is orphaned and returned
    pub fn remove_root(&self, name: &str) -> Result<Option<Entity>> {
        self.transact(|| {
            let Some(r) = self.root_ref(name) else {
                return Ok(None);
            };
            let entity = self.try_resolve(&r)?;
            if ownership::request_orphanization(self, &r.id)?.is_none() {
                self.with_state(|s| s.replica.map_remove(&layout::roots(), name))?;
                self.record_change(ChangeKey::Root(name.to_string()));
            }
            Ok(Some(entity))
        })
    }

    pub fn root_names(&self) -> Vec<String> {
        self.read(|s| {
            s.replica
                .map_entries(&layout::roots())
                .into_iter()
                .map(|(name, _)| name)
                .collect()
        })
    }

    // ---- Dependencies ----

    /// Record `other` as a dependency, returning the id references into it
    /// carry. Idempotent per target document.
    pub fn add_dependency(&self, other: &Document) -> Result<DependencyId> {
        if other.id() == self.id() {
            return Err(GraphError::DocumentMismatch(
                "a document cannot depend on itself".into(),
            ));
        }
        if other.is_scratch() {
            return Err(GraphError::DocumentMismatch(
                "ephemeral entities cannot be referenced across documents".into(),
            ));
        }
        self.link(other);
        self.ensure_dependency(other.id())
    }

    pub(crate) fn link(&self, other: &Document) {
        self.inner
            .links
            .lock()
            .insert(other.id(), Arc::downgrade(&other.inner));
    }

    pub(crate) fn ensure_dependency(&self, target: Uuid) -> Result<DependencyId> {
        if let Some((dep, _)) = self.dependencies().into_iter().find(|(_, t)| *t == target) {
            return Ok(dep);
        }
        let dep = DependencyId::generate();
        let key = format!("{}{}", layout::META_DEPENDENCY_PREFIX, dep);
        self.transact(|| {
            self.with_state(|s| {
                s.replica
                    .map_put(&layout::meta(), &key, Value::string(target.to_string()))
            })?;
            Ok(())
        })?;
        log::debug!("Document {} depends on {} as {}", self.id(), target, dep);
        Ok(dep)
    }

    pub fn dependencies(&self) -> Vec<(DependencyId, Uuid)> {
        self.read(|s| {
            s.replica
                .map_entries(&layout::meta())
                .into_iter()
                .filter_map(|(key, value)| {
                    let dep = key.strip_prefix(layout::META_DEPENDENCY_PREFIX)?;
                    let target = Uuid::parse_str(value.as_str()?).ok()?;
                    Some((DependencyId::from(dep), target))
                })
                .collect()
        })
    }

    pub fn dependency_target(&self, dep: &DependencyId) -> Result<Uuid> {
        let key = format!("{}{}", layout::META_DEPENDENCY_PREFIX, dep);
        self.read(|s| {
            s.replica
                .map_get(&layout::meta(), &key)
                .and_then(Value::as_str)
                .and_then(|v| Uuid::parse_str(v).ok())
        })
        .ok_or_else(|| GraphError::UnknownDependency(dep.to_string()))
    }

    /// A document with id `target` reachable from here without waiting
    pub(crate) fn loaded_document(&self, target: Uuid) -> Option<Document> {
        if target == self.inner.id {
            return Some(self.clone());
        }
        let linked = self
            .inner
            .links
            .lock()
            .get(&target)
            .and_then(Weak::upgrade);
        if let Some(inner) = linked {
            return Some(Document { inner });
        }
        self.store().and_then(|store| store.get(&target))
    }

    // ---- Replication ----

    pub fn horizon(&self) -> Horizon {
        self.read(|s| s.replica.horizon().clone())
    }

    /// Receive every committed local transaction as an `Update`
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Update> {
        self.inner.updates.subscribe()
    }

    pub fn encode_state(&self) -> Result<Vec<u8>> {
        self.encode_update_since(&Horizon::new())
    }

    /// Operations a peer at `since` has not seen, CBOR-encoded
    pub fn encode_update_since(&self, since: &Horizon) -> Result<Vec<u8>> {
        let ops = self.read(|s| s.replica.operations_since(since));
        Ok(Update::new(self.inner.id, ops).to_cbor()?)
    }

    pub fn apply_update(&self, bytes: &[u8]) -> Result<()> {
        let update = Update::from_cbor(bytes)?;
        self.integrate(update)
    }

    /// Merge a remote batch. Ownership repair runs afterwards (unless
    /// disabled), and subscribers see the merge and any repair as one batch.
    /// Back-pointers are always rebuilt from the merged slots.
    ///
    /// A batch arriving while this thread has a transaction open is queued
    /// and merged after it ends.
    pub fn integrate(&self, update: Update) -> Result<()> {
        if update.document_id != self.inner.id {
            return Err(GraphError::DocumentMismatch(format!(
                "update for {} applied to {}",
                update.document_id, self.inner.id
            )));
        }
        if self.is_scratch() {
            return Err(GraphError::DocumentMismatch(
                "ephemeral documents do not replicate".into(),
            ));
        }

        let _gate = self.inner.gate.lock();
        let ready = self.with_state(|s| {
            if s.in_transaction() {
                s.queued.push(update);
                None
            } else {
                Some(update)
            }
        });
        let Some(update) = ready else {
            log::debug!("Queued remote update for {} behind open transaction", self.inner.id);
            return Ok(());
        };

        let outcome = self.with_state(|s| s.replica.apply_remote(update.ops))?;
        if outcome.pending >= self.inner.config.pending_ops_warn_threshold {
            log::warn!(
                "{} remote ops on {} are waiting for causal predecessors",
                outcome.pending,
                self.inner.id
            );
        }
        if outcome.applied == 0 {
            return Ok(());
        }
        log::debug!(
            "Merged {} remote ops into {} ({} pending)",
            outcome.applied,
            self.inner.id,
            outcome.pending
        );

        let changes = changes_from(&outcome.touched);
        if self.inner.config.repair_after_merge {
            self.run_transaction(changes, || repair::reconcile(self).map(|_| ()))
        } else {
            self.run_transaction(changes, || repair::rebuild_index(self).map(|_| ()))
        }
    }

    /// Restore the ownership invariants after merges: one owner per entity,
    /// no cycles, and an index that matches the substrate
    pub fn reconcile(&self) -> Result<RepairReport> {
        self.transact(|| repair::reconcile(self))
    }

    fn drain_queued(&self) {
        let queued = self.with_state(|s| mem::take(&mut s.queued));
        for update in queued {
            if let Err(e) = self.integrate(update) {
                log::warn!("Dropping queued update for {}: {}", self.inner.id, e);
            }
        }
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

fn changes_from(touched: &BTreeSet<(ContainerId, Option<String>)>) -> Vec<ChangeKey> {
    touched
        .iter()
        .filter_map(|(container, key)| match (layout::role_of(container)?, key) {
            (ContainerRole::Roots, Some(name)) => Some(ChangeKey::Root(name.clone())),
            (ContainerRole::Fields(entity), Some(field)) => Some(ChangeKey::Field {
                entity,
                field: field.clone(),
            }),
            (ContainerRole::Collection(entity, field), _) => Some(ChangeKey::Field { entity, field }),
            _ => None,
        })
        .collect()
}
