//! Persistent collection handles.
//!
//! # Role
//!
//! A [`TrackedCollection`] is the engine-facing face of one persistent
//! collection instance: who owns it, which role backs it, whether its
//! elements have been fetched, and what was queued for removal without a
//! fetch. Clones share state, so the handle living inside a domain object
//! and the one held by the tracking entries observe the same collection.
//!
//! Element access never loads implicitly. Initialization happens only
//! through [`TrackedCollection::force_initialization`], and only the flush
//! machinery calls that.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::descriptor::CollectionInfo;
use crate::error::Error;
use crate::gateway::StorageGateway;
use crate::instance::Instance;
use crate::value::Value;

/// Reference identity of one collection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionId(usize);

#[derive(Debug)]
struct CollectionState {
    owner: Option<Instance>,
    role: Option<&'static CollectionInfo>,
    key: Option<Value>,
    initialized: bool,
    directly_modified: bool,
    elements: Vec<Instance>,
    queued_removals: Vec<Instance>,
}

/// Shared-state handle to one persistent collection.
#[derive(Clone)]
pub struct TrackedCollection {
    state: Arc<RwLock<CollectionState>>,
}

impl TrackedCollection {
    /// A collection instantiated by user code, never loaded from storage.
    ///
    /// It is initialized by construction and has no role or key until the
    /// flush machinery assigns them.
    #[must_use]
    pub fn brand_new() -> Self {
        Self::build(CollectionState {
            owner: None,
            role: None,
            key: None,
            initialized: true,
            directly_modified: false,
            elements: Vec::new(),
            queued_removals: Vec::new(),
        })
    }

    /// A wrapper for a collection that exists in storage, elements not yet
    /// fetched.
    #[must_use]
    pub fn loaded(role: &'static CollectionInfo, key: Value) -> Self {
        Self::build(CollectionState {
            owner: None,
            role: Some(role),
            key: Some(key),
            initialized: false,
            directly_modified: false,
            elements: Vec::new(),
            queued_removals: Vec::new(),
        })
    }

    fn build(state: CollectionState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Identity of this collection instance, stable across clones.
    #[must_use]
    pub fn id(&self) -> CollectionId {
        CollectionId(Arc::as_ptr(&self.state) as usize)
    }

    /// The owner currently referencing this collection, if any.
    #[must_use]
    pub fn owner(&self) -> Option<Instance> {
        self.read().owner.clone()
    }

    /// Attach the owning instance.
    pub fn attach_owner(&self, owner: Instance) {
        self.write().owner = Some(owner);
    }

    /// Drop the owner reference (the owning side no longer points here).
    pub fn detach_owner(&self) {
        self.write().owner = None;
    }

    /// The role last known to back this collection.
    #[must_use]
    pub fn role(&self) -> Option<&'static CollectionInfo> {
        self.read().role
    }

    /// The owning key last known for this collection.
    #[must_use]
    pub fn key(&self) -> Option<Value> {
        self.read().key.clone()
    }

    /// Record the role and key this collection is persisted under.
    pub fn bind(&self, role: &'static CollectionInfo, key: Value) {
        let mut state = self.write();
        state.role = Some(role);
        state.key = Some(key);
    }

    /// Whether elements have been fetched (or the collection is brand new).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Whether the collection was modified in place since load.
    #[must_use]
    pub fn was_directly_modified(&self) -> bool {
        self.read().directly_modified
    }

    /// Mark an in-place modification.
    pub fn mark_modified(&self) {
        self.write().directly_modified = true;
    }

    /// Reset the modification flag after the flush decision.
    pub fn clear_modified(&self) {
        self.write().directly_modified = false;
    }

    /// Add an element. Only meaningful on an initialized collection.
    pub fn add(&self, element: Instance) {
        let mut state = self.write();
        state.elements.push(element);
        state.directly_modified = true;
    }

    /// Queue an element for removal without requiring initialization.
    ///
    /// Duplicate queueing of the same instance is ignored.
    pub fn queue_removal(&self, element: Instance) {
        let mut state = self.write();
        if state.initialized {
            state.elements.retain(|e| !e.same_as(&element));
        }
        if !state.queued_removals.iter().any(|e| e.same_as(&element)) {
            state.queued_removals.push(element);
        }
        state.directly_modified = true;
    }

    /// Loaded elements. Empty when not initialized.
    #[must_use]
    pub fn elements(&self) -> Vec<Instance> {
        let state = self.read();
        if state.initialized {
            state.elements.clone()
        } else {
            Vec::new()
        }
    }

    /// Elements explicitly queued for removal.
    #[must_use]
    pub fn queued_removals(&self) -> Vec<Instance> {
        self.read().queued_removals.clone()
    }

    /// Take and clear the queued removals.
    #[must_use]
    pub fn take_queued_removals(&self) -> Vec<Instance> {
        std::mem::take(&mut self.write().queued_removals)
    }

    /// Fetch elements from storage if they were never loaded.
    ///
    /// # Errors
    ///
    /// Propagates storage failures. A collection with no role or key cannot
    /// be initialized and reports a storage error.
    pub fn force_initialization(&self, gateway: &dyn StorageGateway) -> Result<(), Error> {
        let (role, key) = {
            let state = self.read();
            if state.initialized {
                return Ok(());
            }
            let role = state.role.ok_or_else(|| {
                Error::storage("collection", "cannot initialize a collection with no role")
            })?;
            let key = state.key.clone().ok_or_else(|| {
                Error::storage(role.role, "cannot initialize a collection with no key")
            })?;
            (role, key)
        };
        let elements = gateway.collection_elements(role, &key)?;
        tracing::trace!(role = role.role, count = elements.len(), "collection initialized");
        let mut state = self.write();
        state.elements = elements;
        state.initialized = true;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, CollectionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CollectionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for TrackedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("TrackedCollection")
            .field("role", &state.role.map(|r| r.role))
            .field("key", &state.key)
            .field("initialized", &state.initialized)
            .field("modified", &state.directly_modified)
            .field("elements", &state.elements.len())
            .field("queued_removals", &state.queued_removals.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ROLE: CollectionInfo = CollectionInfo::new("user.addresses", "user");

    fn instance() -> Instance {
        Instance::plain(Arc::new(RwLock::new(0u32)))
    }

    struct EmptyGateway;

    impl StorageGateway for EmptyGateway {
        fn entity_snapshot(
            &self,
            _descriptor: &'static dyn crate::descriptor::EntityDescriptor,
            _id: &Value,
        ) -> Result<Option<Vec<Value>>, Error> {
            Ok(None)
        }

        fn collection_elements(
            &self,
            _role: &'static CollectionInfo,
            _key: &Value,
        ) -> Result<Vec<Instance>, Error> {
            Ok(vec![instance(), instance()])
        }
    }

    #[test]
    fn test_identity_shared_across_clones() {
        let coll = TrackedCollection::brand_new();
        let other = coll.clone();
        assert_eq!(coll.id(), other.id());
        assert_ne!(coll.id(), TrackedCollection::brand_new().id());
    }

    #[test]
    fn test_brand_new_is_initialized_and_unbound() {
        let coll = TrackedCollection::brand_new();
        assert!(coll.is_initialized());
        assert!(coll.role().is_none());
        assert!(coll.key().is_none());
        assert!(coll.elements().is_empty());
    }

    #[test]
    fn test_loaded_collection_hides_elements_until_initialized() {
        let coll = TrackedCollection::loaded(&ROLE, Value::BigInt(1));
        assert!(!coll.is_initialized());
        assert!(coll.elements().is_empty());

        coll.force_initialization(&EmptyGateway).unwrap();
        assert!(coll.is_initialized());
        assert_eq!(coll.elements().len(), 2);

        // Idempotent once initialized.
        coll.force_initialization(&EmptyGateway).unwrap();
        assert_eq!(coll.elements().len(), 2);
    }

    #[test]
    fn test_queue_removal_without_initialization() {
        let coll = TrackedCollection::loaded(&ROLE, Value::BigInt(1));
        let gone = instance();
        coll.queue_removal(gone.clone());
        coll.queue_removal(gone.clone());
        assert_eq!(coll.queued_removals().len(), 1);
        assert!(coll.was_directly_modified());
        assert!(!coll.is_initialized());
    }

    #[test]
    fn test_queue_removal_drops_loaded_element() {
        let coll = TrackedCollection::brand_new();
        let kept = instance();
        let gone = instance();
        coll.add(kept.clone());
        coll.add(gone.clone());
        coll.queue_removal(gone.clone());
        let elements = coll.elements();
        assert_eq!(elements.len(), 1);
        assert!(elements[0].same_as(&kept));
        assert_eq!(coll.take_queued_removals().len(), 1);
        assert!(coll.queued_removals().is_empty());
    }

    #[test]
    fn test_owner_attach_detach() {
        let coll = TrackedCollection::brand_new();
        assert!(coll.owner().is_none());
        let owner = instance();
        coll.attach_owner(owner.clone());
        assert!(coll.owner().unwrap().same_as(&owner));
        coll.detach_owner();
        assert!(coll.owner().is_none());
    }
}
