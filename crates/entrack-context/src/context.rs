//! The unit-of-work facade.
//!
//! # Role
//!
//! One [`PersistenceContext`] is one unit-of-work. It owns the identity
//! registry, the collection tracking table, the snapshot cache, the local
//! natural-key resolutions and the post-transaction queue, and it wires the
//! storage gateway, interceptor and shared cache through them. Every store
//! is single-threaded; the shared natural-key cache is the one collaborator
//! other units-of-work touch concurrently, and all traffic to it goes
//! through [`NaturalKeySync`].
//!
//! # Lifecycle
//!
//! Objects enter through [`PersistenceContext::register_loading`] /
//! [`PersistenceContext::add_for_save`], move through the flush callbacks
//! (`after_insert`, `after_update`, `after_delete`), and leave through
//! eviction, deletion or [`PersistenceContext::close`]. Transaction
//! completion drains the queue, downgrades locks and resets the
//! per-transaction key sets.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use entrack_core::collection::{CollectionId, TrackedCollection};
use entrack_core::descriptor::{CascadeKind, CascadePoint, EntityDescriptor};
use entrack_core::error::{Error, Result, UsageViolation};
use entrack_core::gateway::{Interceptor, SharedNaturalKeyCache, StorageGateway};
use entrack_core::instance::{ContextToken, Instance};
use entrack_core::state::AttributeValue;
use entrack_core::value::{EntityKey, Value};

use crate::cascade::{CascadePlan, CascadeWalk};
use crate::collection_entry::{CollectionEntry, CollectionKey};
use crate::events::TransactionQueue;
use crate::natural::{
    NaturalKeyResolutions, NaturalKeySync, ResolutionSource, extract_natural_key,
};
use crate::reachability::{CollectionTable, visit_owner_collections};
use crate::record::{EntityRecord, LockLevel, Status};
use crate::registry::{EntityHandle, IdentityRegistry};
use crate::transience::{Nullifier, SnapshotCache, TransienceProbe};

/// Tunable behavior of one unit-of-work.
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig {
    /// Track loaded objects read-only unless told otherwise per object.
    pub default_read_only: bool,
    /// Push natural-key resolutions to the shared cache when one is wired.
    pub natural_key_sync: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_read_only: false,
            natural_key_sync: true,
        }
    }
}

/// Sizes of the per-context stores, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackingCounts {
    /// Registered object references.
    pub entities: usize,
    /// Tracked collections.
    pub collections: usize,
    /// Cached database snapshots.
    pub snapshots: usize,
    /// Local natural-key resolutions.
    pub natural_key_resolutions: usize,
    /// Hooks waiting for transaction completion.
    pub pending_hooks: usize,
}

/// One unit-of-work over one logical transaction.
pub struct PersistenceContext {
    token: Arc<ContextToken>,
    config: ContextConfig,
    gateway: Arc<dyn StorageGateway>,
    interceptor: Arc<dyn Interceptor>,
    shared_cache: Option<Arc<dyn SharedNaturalKeyCache>>,
    sync: Option<NaturalKeySync>,
    pub(crate) registry: IdentityRegistry,
    collections: CollectionTable,
    snapshots: SnapshotCache,
    resolutions: NaturalKeyResolutions,
    queue: TransactionQueue,
    nullifiable_keys: HashSet<EntityKey>,
    deleted_unloaded_keys: HashSet<EntityKey>,
}

impl PersistenceContext {
    /// Open a unit-of-work over `gateway`, consulting `interceptor` for
    /// transience answers.
    #[must_use]
    pub fn new(gateway: Arc<dyn StorageGateway>, interceptor: Arc<dyn Interceptor>) -> Self {
        let token = ContextToken::new();
        Self {
            registry: IdentityRegistry::new(Arc::clone(&token)),
            token,
            config: ContextConfig::default(),
            gateway,
            interceptor,
            shared_cache: None,
            sync: None,
            collections: CollectionTable::new(),
            snapshots: SnapshotCache::new(),
            resolutions: NaturalKeyResolutions::new(),
            queue: TransactionQueue::new(),
            nullifiable_keys: HashSet::new(),
            deleted_unloaded_keys: HashSet::new(),
        }
    }

    /// Wire a shared natural-key cache.
    #[must_use]
    pub fn with_shared_cache(mut self, cache: Arc<dyn SharedNaturalKeyCache>) -> Self {
        self.sync = Some(NaturalKeySync::new(Arc::clone(&cache)));
        self.shared_cache = Some(cache);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> ContextConfig {
        self.config
    }

    /// Flip the default tracking mode for subsequent loads.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.config.default_read_only = read_only;
    }

    /// Identity token of this unit-of-work.
    #[must_use]
    pub fn token(&self) -> &Arc<ContextToken> {
        &self.token
    }

    /// Whether this unit-of-work is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.token.is_open()
    }

    // ==================== registration ====================

    /// Begin tracking an object being hydrated from storage.
    ///
    /// The record starts LOADING with the hydrated snapshot attached; call
    /// [`Self::finish_loading`] once every attribute is in place.
    ///
    /// # Errors
    ///
    /// Consistency error when the instance is tracked by another open
    /// unit-of-work.
    pub fn register_loading(
        &mut self,
        instance: &Instance,
        descriptor: &'static dyn EntityDescriptor,
        id: Value,
        loaded_state: Vec<AttributeValue>,
        version: Option<Value>,
        lock: LockLevel,
    ) -> Result<EntityHandle> {
        let mut record = EntityRecord::new(descriptor, Status::Loading, Some(id))
            .with_loaded_state(loaded_state)
            .with_lock(lock)
            .with_exists_in_database(true);
        if let Some(version) = version {
            record = record.with_version(version);
        }
        self.registry.register(instance, record)
    }

    /// Promote a fully hydrated object out of LOADING.
    ///
    /// Mutable types land in MANAGED unless the context defaults to
    /// read-only; immutable types always land in READ_ONLY. A declared
    /// natural key is cached and published as a load resolution.
    ///
    /// # Errors
    ///
    /// Usage error for a handle that no longer resolves; cache failures
    /// from the shared-cache publish.
    pub fn finish_loading(&mut self, handle: EntityHandle) -> Result<()> {
        let Some(record) = self.registry.record_mut(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let descriptor = record.descriptor();
        let natural = if descriptor.natural_key().is_some() {
            match (record.id(), record.loaded_state()) {
                (Some(id), Some(state)) => {
                    Some((id.clone(), extract_natural_key(descriptor, state)?))
                }
                _ => None,
            }
        } else {
            None
        };
        let read_only = !descriptor.is_mutable() || self.config.default_read_only;
        record.set_status(if read_only {
            Status::ReadOnly
        } else {
            Status::Managed
        });
        tracing::debug!(
            entity = descriptor.entity_name(),
            read_only,
            "load finished"
        );
        if let Some((id, key)) = natural {
            self.cache_natural_key_resolution(descriptor, &id, &key, ResolutionSource::Load)?;
        }
        Ok(())
    }

    /// Begin tracking a new object scheduled for insertion.
    ///
    /// `id` may be `None` while an in-insert identifier strategy has not
    /// produced a value yet.
    ///
    /// # Errors
    ///
    /// Consistency error when the instance is tracked by another open
    /// unit-of-work.
    pub fn add_for_save(
        &mut self,
        instance: &Instance,
        descriptor: &'static dyn EntityDescriptor,
        id: Option<Value>,
    ) -> Result<EntityHandle> {
        self.registry
            .register(instance, EntityRecord::new(descriptor, Status::Saving, id))
    }

    // ==================== lookup ====================

    /// Handle for `instance`, by reference identity.
    #[must_use]
    pub fn lookup(&self, instance: &Instance) -> Option<EntityHandle> {
        self.registry.lookup(instance)
    }

    /// Whether `instance` is tracked here.
    #[must_use]
    pub fn contains(&self, instance: &Instance) -> bool {
        self.registry.contains(instance)
    }

    /// The record behind `handle`.
    #[must_use]
    pub fn record(&self, handle: EntityHandle) -> Option<&EntityRecord> {
        self.registry.record(handle)
    }

    /// Mutable access to the record behind `handle`.
    #[must_use]
    pub fn record_mut(&mut self, handle: EntityHandle) -> Option<&mut EntityRecord> {
        self.registry.record_mut(handle)
    }

    /// The instance behind `handle`.
    #[must_use]
    pub fn instance(&self, handle: EntityHandle) -> Option<&Instance> {
        self.registry.instance(handle)
    }

    /// The record for `instance`, when tracked.
    #[must_use]
    pub fn record_for(&self, instance: &Instance) -> Option<&EntityRecord> {
        self.registry
            .lookup(instance)
            .and_then(|handle| self.registry.record(handle))
    }

    /// Stable (instance, handle) pairs in registration order, for
    /// flush-time iteration.
    ///
    /// Mutating the context while iterating a handed-out snapshot is
    /// safe; resolve each handle through [`Self::record`] to see whether
    /// it survived.
    pub fn tracked_snapshot(&mut self) -> Arc<[(Instance, EntityHandle)]> {
        self.registry.snapshot()
    }

    // ==================== flush callbacks ====================

    /// Record a completed physical insert: the row exists, the inserted
    /// state becomes the snapshot, the record moves to MANAGED under a
    /// write lock, and a declared natural key is published as an insert
    /// resolution.
    ///
    /// # Errors
    ///
    /// Usage errors for an untracked handle or a still-missing identifier;
    /// cache failures from the shared-cache publish.
    pub fn after_insert(
        &mut self,
        handle: EntityHandle,
        state: Vec<AttributeValue>,
        version: Option<Value>,
    ) -> Result<()> {
        let Some(instance) = self.registry.instance(handle).cloned() else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let natural = {
            let Some(record) = self.registry.record_mut(handle) else {
                return Err(Error::Usage(UsageViolation::UntrackedInstance));
            };
            let descriptor = record.descriptor();
            record.post_insert();
            record.post_update(&instance, state, version);
            record.set_status(Status::Managed);
            if descriptor.natural_key().is_some() {
                let id = record.entity_key()?.id().clone();
                let key = extract_natural_key(descriptor, record.loaded_state().unwrap_or(&[]))?;
                Some((descriptor, id, key))
            } else {
                None
            }
        };
        if let Some((descriptor, id, key)) = natural {
            self.cache_natural_key_resolution(descriptor, &id, &key, ResolutionSource::Insert)?;
        }
        Ok(())
    }

    /// Record a completed physical update. A changed natural key is
    /// re-cached and published as an update resolution.
    ///
    /// # Errors
    ///
    /// Usage errors for an untracked handle or a missing identifier; cache
    /// failures from the shared-cache publish.
    pub fn after_update(
        &mut self,
        handle: EntityHandle,
        state: Vec<AttributeValue>,
        next_version: Option<Value>,
    ) -> Result<()> {
        let Some(instance) = self.registry.instance(handle).cloned() else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let natural = {
            let Some(record) = self.registry.record_mut(handle) else {
                return Err(Error::Usage(UsageViolation::UntrackedInstance));
            };
            let descriptor = record.descriptor();
            record.post_update(&instance, state, next_version);
            if descriptor.natural_key().is_some() {
                let id = record.entity_key()?.id().clone();
                let key = extract_natural_key(descriptor, record.loaded_state().unwrap_or(&[]))?;
                Some((descriptor, id, key))
            } else {
                None
            }
        };
        if let Some((descriptor, id, key)) = natural {
            if !self.resolutions.same_as_cached(descriptor, &id, &key)? {
                self.cache_natural_key_resolution(descriptor, &id, &key, ResolutionSource::Update)?;
            }
        }
        Ok(())
    }

    /// Schedule a tracked object for deletion.
    ///
    /// The record moves to DELETED, the current attribute values are
    /// captured for delete-time cascades, and the identity key becomes
    /// nullifiable for the rest of the flush.
    ///
    /// # Errors
    ///
    /// Usage errors for an untracked handle or a missing identifier.
    pub fn schedule_delete(&mut self, handle: EntityHandle) -> Result<()> {
        let Some(instance) = self.registry.instance(handle).cloned() else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let Some(record) = self.registry.record_mut(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let key = record.entity_key()?;
        let state = record.descriptor().read_state(&instance);
        record.capture_deleted_state(state);
        record.set_status(Status::Deleted);
        self.nullifiable_keys.insert(key);
        Ok(())
    }

    /// Record a completed physical delete.
    ///
    /// The record moves to GONE and leaves the registry; the returned
    /// record is the caller's last view of it. The cached snapshot is
    /// evicted and a declared natural key is removed locally and evicted
    /// from the shared cache. Shared-cache failures during this cleanup
    /// are logged and swallowed: the row is already gone, so a stale cache
    /// entry is a performance problem, not a correctness one.
    ///
    /// # Errors
    ///
    /// Usage errors for an untracked handle or a missing identifier.
    pub fn after_delete(&mut self, handle: EntityHandle) -> Result<EntityRecord> {
        let Some(record) = self.registry.record(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let descriptor = record.descriptor();
        let key = record.entity_key()?;
        let natural = if descriptor.natural_key().is_some() {
            let values = match self.resolutions.find_cached_key(descriptor, key.id())? {
                Some(values) => Some(values),
                None => record
                    .deleted_state()
                    .or_else(|| record.loaded_state())
                    .map(|state| extract_natural_key(descriptor, state))
                    .transpose()?,
            };
            values.map(|values| (key.id().clone(), values))
        } else {
            None
        };

        if let Some(record) = self.registry.record_mut(handle) {
            record.post_delete();
        }
        let Some(record) = self.registry.remove(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        self.snapshots.evict(&key);
        if let Some((id, values)) = natural {
            self.resolutions.remove_resolution(descriptor, &id, &values)?;
            if self.config.natural_key_sync {
                if let Some(sync) = &self.sync {
                    if let Err(err) =
                        sync.evict(&mut self.queue, descriptor.entity_name(), &values)
                    {
                        tracing::warn!(
                            entity = descriptor.entity_name(),
                            error = %err,
                            "shared natural-key eviction failed after delete, continuing"
                        );
                    }
                }
            }
        }
        Ok(record)
    }

    /// Detach `instance` from this unit-of-work, returning its record.
    ///
    /// The cached snapshot goes with it; natural-key resolutions stay,
    /// since detaching does not make them wrong.
    pub fn evict(&mut self, instance: &Instance) -> Option<EntityRecord> {
        let record = self.registry.unregister(instance)?;
        if let Ok(key) = record.entity_key() {
            self.snapshots.evict(&key);
        }
        tracing::trace!(entity = record.entity_name(), "instance evicted");
        Some(record)
    }

    // ==================== read-only and locks ====================

    /// Toggle read-only tracking for one instance.
    ///
    /// # Errors
    ///
    /// Usage error when `instance` is untracked; consistency and usage
    /// errors from the record-level toggle.
    pub fn set_read_only(&mut self, instance: &Instance, read_only: bool) -> Result<()> {
        let Some(handle) = self.registry.lookup(instance) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let Some(record) = self.registry.record_mut(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        record.set_read_only(read_only, instance)
    }

    /// Whether one instance is tracked read-only.
    ///
    /// # Errors
    ///
    /// Usage error when `instance` is untracked, or when the record's
    /// status has no read-only answer.
    pub fn is_read_only(&self, instance: &Instance) -> Result<bool> {
        match self.record_for(instance) {
            Some(record) => record.is_read_only(),
            None => Err(Error::Usage(UsageViolation::UntrackedInstance)),
        }
    }

    /// Drop every record's lock back to none.
    pub fn downgrade_locks(&mut self) {
        let snapshot = self.registry.snapshot();
        for (_, handle) in snapshot.iter() {
            if let Some(record) = self.registry.record_mut(*handle) {
                record.downgrade_lock();
            }
        }
    }

    // ==================== transience ====================

    /// Whether `instance` has no database row yet.
    ///
    /// # Errors
    ///
    /// Storage errors from the snapshot fetch.
    pub fn is_transient(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        instance: &Instance,
        assumed: Option<bool>,
    ) -> Result<bool> {
        let mut probe = TransienceProbe::new(
            self.interceptor.as_ref(),
            self.gateway.as_ref(),
            &mut self.snapshots,
        );
        probe.is_transient(descriptor, instance, assumed)
    }

    /// Null out references to unsaved objects in `values` before an insert
    /// or delete of the object behind `handle` is executed.
    ///
    /// # Errors
    ///
    /// Usage error for an untracked handle; classification failures from
    /// the probe.
    pub fn nullify_transient_references(
        &mut self,
        handle: EntityHandle,
        is_delete: bool,
        values: &mut [AttributeValue],
    ) -> Result<()> {
        let Some(record) = self.registry.record(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let descriptor = record.descriptor();
        let Some(instance) = self.registry.instance(handle) else {
            return Err(Error::Usage(UsageViolation::UntrackedInstance));
        };
        let probe = TransienceProbe::new(
            self.interceptor.as_ref(),
            self.gateway.as_ref(),
            &mut self.snapshots,
        );
        let mut nullifier = Nullifier::new(
            is_delete,
            descriptor.uses_early_insert(),
            instance,
            descriptor,
            &self.registry,
            &self.nullifiable_keys,
            &self.deleted_unloaded_keys,
            probe,
        );
        nullifier.nullify_transient_references(descriptor.attributes(), values)
    }

    /// Note a delete issued against an identifier whose object was never
    /// loaded. References to that key become nullifiable.
    pub fn note_unloaded_delete(&mut self, key: EntityKey) {
        self.deleted_unloaded_keys.insert(key);
    }

    /// Whether `key` was deleted without ever being loaded.
    #[must_use]
    pub fn is_unloaded_deletion(&self, key: &EntityKey) -> bool {
        self.deleted_unloaded_keys.contains(key)
    }

    // ==================== cascades ====================

    /// Build the cascade plan for applying `kind` at `point` to `root`'s
    /// attributes.
    ///
    /// # Errors
    ///
    /// Storage errors from the one permitted forced initialization.
    pub fn cascade(
        &self,
        kind: CascadeKind,
        point: CascadePoint,
        root: &Instance,
        descriptor: &'static dyn EntityDescriptor,
    ) -> Result<CascadePlan> {
        CascadeWalk::new(
            kind,
            point,
            &self.registry,
            &self.collections,
            self.gateway.as_ref(),
        )
        .cascade(root, descriptor)
    }

    // ==================== collections ====================

    /// Track `collection` under `entry`.
    pub fn track_collection(
        &mut self,
        collection: TrackedCollection,
        entry: CollectionEntry,
    ) -> CollectionId {
        self.collections.add(collection, entry)
    }

    /// Tracking entry for `collection`.
    #[must_use]
    pub fn collection_entry(&self, collection: &TrackedCollection) -> Option<&CollectionEntry> {
        self.collections.entry(collection)
    }

    /// Mutable tracking entry for `collection`.
    #[must_use]
    pub fn collection_entry_mut(
        &mut self,
        collection: &TrackedCollection,
    ) -> Option<&mut CollectionEntry> {
        self.collections.entry_mut(collection)
    }

    /// Stop tracking `collection`, returning its entry.
    pub fn drop_collection_entry(
        &mut self,
        collection: &TrackedCollection,
    ) -> Option<CollectionEntry> {
        self.collections.remove(collection)
    }

    /// Run the collection half of a flush: reset every entry, walk every
    /// tracked owner's collection-typed attributes, settle the entries the
    /// walk did not reach, and assert nothing was skipped.
    ///
    /// Owner keys come from the owner's record: an assigned identifier
    /// directly, a placeholder for SAVING records still waiting on one.
    /// Load-time invalid-key stashes are dropped once the walk completes.
    ///
    /// # Errors
    ///
    /// Consistency errors from the reachability protocol; storage errors
    /// from forced initializations.
    pub fn flush_collections(&mut self) -> Result<()> {
        self.collections.begin_flush();
        let snapshot = self.registry.snapshot();
        for (instance, handle) in snapshot.iter() {
            let Some(record) = self.registry.record(*handle) else {
                continue;
            };
            if record.status() == Status::Loading || !record.descriptor().has_collections() {
                continue;
            }
            let key = Self::owner_key_for(record, *handle);
            visit_owner_collections(
                &mut self.collections,
                instance,
                record,
                key,
                self.gateway.as_ref(),
            )?;
        }
        let registry = &self.registry;
        self.collections.sweep_unreached(
            |owner| {
                registry
                    .lookup(owner)
                    .and_then(|handle| registry.record(handle))
                    .is_some_and(|record| {
                        matches!(record.status(), Status::Deleted | Status::Gone)
                    })
            },
            self.gateway.as_ref(),
        )?;
        self.collections.end_flush()?;
        self.resolutions.unstash_all();
        Ok(())
    }

    /// Record completion of the scheduled collection actions.
    pub fn complete_collection_actions(&mut self) {
        self.collections.complete_actions();
    }

    fn owner_key_for(record: &EntityRecord, handle: EntityHandle) -> Option<CollectionKey> {
        match record.id() {
            Some(id) => Some(CollectionKey::Assigned(id.clone())),
            None if record.status() == Status::Saving => {
                Some(CollectionKey::Delayed(handle.encode()))
            }
            None => None,
        }
    }

    // ==================== snapshots ====================

    /// Last persisted attribute values for one row, fetched once and
    /// cached, no-row answers included.
    ///
    /// # Errors
    ///
    /// Storage errors from the fetch.
    pub fn database_snapshot(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
    ) -> Result<Option<Vec<Value>>> {
        self.snapshots
            .database_snapshot(descriptor, id, self.gateway.as_ref())
    }

    /// Snapshot already cached for `key`, if any. The outer `None` means
    /// "never fetched"; the inner one means "fetched, no row".
    #[must_use]
    pub fn cached_snapshot(&self, key: &EntityKey) -> Option<&Option<Vec<Value>>> {
        self.snapshots.cached(key)
    }

    // ==================== natural keys ====================

    /// Resolve a natural key to its surrogate identifier.
    ///
    /// The local resolutions answer first. On a local miss the shared
    /// cache is consulted when wired; a hit is re-cached locally. A
    /// shared-cache failure degrades to a miss and is logged, never
    /// surfaced.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn find_surrogate_for_natural_key(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        key: &[Value],
    ) -> Result<Option<Value>> {
        if let Some(id) = self.resolutions.find_cached_id(descriptor, key)? {
            return Ok(Some(id));
        }
        if !self.config.natural_key_sync {
            return Ok(None);
        }
        let Some(cache) = &self.shared_cache else {
            return Ok(None);
        };
        let shared_key = cache.generate_key(descriptor.entity_name(), key);
        match cache.get(&shared_key) {
            Ok(Some(id)) => {
                self.resolutions.cache_resolution(descriptor, &id, key)?;
                Ok(Some(id))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::warn!(
                    entity = descriptor.entity_name(),
                    error = %err,
                    "shared natural-key lookup failed, treating as miss"
                );
                Ok(None)
            }
        }
    }

    /// Cache `id <-> key` locally and publish it per `source`.
    ///
    /// Returns whether the local resolutions changed; nothing is published
    /// for a no-op re-cache. A key replaced for the same identifier is
    /// evicted from the shared cache as well, so the fallback lookup
    /// cannot resurrect it.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key; cache failures
    /// from the immediate shared-cache phase.
    pub fn cache_natural_key_resolution(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        key: &[Value],
        source: ResolutionSource,
    ) -> Result<bool> {
        let prior = self.resolutions.find_cached_key(descriptor, id)?;
        let changed = self.resolutions.cache_resolution(descriptor, id, key)?;
        if changed && self.config.natural_key_sync {
            if let Some(sync) = &self.sync {
                if let Some(prior_key) = prior {
                    if prior_key.as_slice() != key {
                        sync.evict(&mut self.queue, descriptor.entity_name(), &prior_key)?;
                    }
                }
                sync.publish(&mut self.queue, descriptor.entity_name(), id, key, source)?;
            }
        }
        Ok(changed)
    }

    /// Drop the resolution for `id` locally and evict it from the shared
    /// cache, the previously cached key included when it differs.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key; cache failures
    /// from the immediate shared-cache phase.
    pub fn remove_natural_key_resolution(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        key: &[Value],
    ) -> Result<Option<Vec<Value>>> {
        let prior = self.resolutions.remove_resolution(descriptor, id, key)?;
        if self.config.natural_key_sync {
            if let Some(sync) = &self.sync {
                sync.evict(&mut self.queue, descriptor.entity_name(), key)?;
                if let Some(prior_key) = &prior {
                    if prior_key.as_slice() != key {
                        sync.evict(&mut self.queue, descriptor.entity_name(), prior_key)?;
                    }
                }
            }
        }
        Ok(prior)
    }

    /// Every surrogate id with a locally cached resolution for
    /// `descriptor`.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn cached_pk_resolutions(
        &self,
        descriptor: &'static dyn EntityDescriptor,
    ) -> Result<Vec<Value>> {
        self.resolutions.cached_pk_resolutions(descriptor)
    }

    /// Stash a natural key as invalid until the current flush's load
    /// synchronization completes.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn stash_invalid_natural_key(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        key: &[Value],
    ) -> Result<()> {
        self.resolutions.stash_invalid(descriptor, key)
    }

    // ==================== transaction boundary ====================

    /// Register `hook` to run only if the enclosing transaction commits.
    pub fn run_after_successful_commit(
        &mut self,
        label: &'static str,
        hook: crate::events::AfterCommitHook,
    ) {
        self.queue.run_after_successful_commit(label, hook);
    }

    /// Complete the enclosing transaction.
    ///
    /// Commit drains the queue in registration order; rollback drops it.
    /// Either way every lock is downgraded and the per-transaction key
    /// sets and stashes reset.
    pub fn after_transaction(&mut self, committed: bool) {
        self.queue.complete(committed);
        self.downgrade_locks();
        self.nullifiable_keys.clear();
        self.deleted_unloaded_keys.clear();
        self.resolutions.unstash_all();
        tracing::debug!(context = self.token.id(), committed, "transaction completed");
    }

    // ==================== teardown ====================

    /// Drop everything tracked, the unit-of-work itself staying open.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.collections.clear();
        self.snapshots.clear();
        self.resolutions.clear();
        self.queue.clear();
        self.nullifiable_keys.clear();
        self.deleted_unloaded_keys.clear();
    }

    /// Close the unit-of-work: the token flips so stale back-references
    /// die, then everything tracked is dropped.
    pub fn close(&mut self) {
        if !self.token.is_open() {
            return;
        }
        self.token.close();
        self.clear();
        tracing::debug!(context = self.token.id(), "persistence context closed");
    }

    /// Sizes of the per-context stores.
    #[must_use]
    pub fn counts(&self) -> TrackingCounts {
        TrackingCounts {
            entities: self.registry.len(),
            collections: self.collections.len(),
            snapshots: self.snapshots.len(),
            natural_key_resolutions: self.resolutions.len(),
            pending_hooks: self.queue.len(),
        }
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("context", &self.token.id())
            .field("open", &self.token.is_open())
            .field("counts", &self.counts())
            .finish_non_exhaustive()
    }
}
