//! Type-erased domain-object handles.
//!
//! # Role
//!
//! The engine tracks arbitrary domain objects without requiring them to
//! implement equality, hashing or any marker trait. An [`Instance`] wraps
//! the caller's shared handle (`Arc<...>`) behind `dyn Any` and identifies
//! it by the Arc's data pointer, never by value.
//!
//! # Design
//!
//! Two wrapping capabilities exist, selected once at construction:
//!
//! - *trackable*: the object carries a [`BackRefSlot`] and the registry may
//!   store its link to the lifecycle record inline (no hash lookup);
//! - *plain*: the object carries nothing and the registry falls back to a
//!   side pointer-keyed table.
//!
//! A slot on a shared immutable object may be observed by several
//! registries at once, so slot access is serialized by a mutex and the
//! per-registry linked-list linkage is never written through it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Cheap-to-clone, reference-identity handle to one domain object.
#[derive(Clone)]
pub struct Instance {
    any: Arc<dyn Any + Send + Sync>,
    tracker: Option<Arc<BackRefSlot>>,
}

impl Instance {
    /// Wrap an object with no inline tracking capability.
    pub fn plain<T: Any + Send + Sync>(obj: Arc<T>) -> Self {
        Self {
            any: obj,
            tracker: None,
        }
    }

    /// Wrap an object that carries its own back-reference slot.
    pub fn trackable<T: Any + Send + Sync>(obj: Arc<T>, slot: Arc<BackRefSlot>) -> Self {
        Self {
            any: obj,
            tracker: Some(slot),
        }
    }

    /// Identity key: the address of the shared payload.
    #[must_use]
    pub fn ptr_key(&self) -> usize {
        Arc::as_ptr(&self.any).cast::<()>() as usize
    }

    /// The inline back-reference slot, when this instance carries one.
    #[must_use]
    pub fn tracker(&self) -> Option<&Arc<BackRefSlot>> {
        self.tracker.as_ref()
    }

    /// Recover the concrete shared handle.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    /// True when both handles point at the same object.
    #[must_use]
    pub fn same_as(&self, other: &Instance) -> bool {
        self.ptr_key() == other.ptr_key()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("ptr", &format_args!("{:#x}", self.ptr_key()))
            .field("trackable", &self.tracker.is_some())
            .finish()
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Liveness marker for one identity registry / unit-of-work.
///
/// Registries hand out `Weak` references to their token; a link whose token
/// no longer upgrades, or upgrades to a closed token, belongs to a finished
/// unit-of-work and may be superseded.
#[derive(Debug)]
pub struct ContextToken {
    id: u64,
    open: AtomicBool,
}

impl ContextToken {
    /// Allocate a fresh open token with a process-unique id.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
        })
    }

    /// Process-unique registry id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the owning unit-of-work is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the owning unit-of-work closed.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// One registry's claim on a trackable instance.
#[derive(Debug, Clone)]
pub struct TrackerLink {
    /// Token of the registry holding the claim.
    pub token: Weak<ContextToken>,
    /// Registry id, readable even after the token is gone.
    pub context_id: u64,
    /// Packed registry handle (index + generation), opaque to this crate.
    pub raw_handle: u64,
}

impl TrackerLink {
    /// True while the claiming registry's unit-of-work is still open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.token.upgrade().is_some_and(|t| t.is_open())
    }
}

/// Inline back-reference cell carried by trackable domain objects.
///
/// All access is serialized by the interior mutex; concurrent detachment
/// from another unit-of-work can therefore never interleave with a claim.
#[derive(Debug, Default)]
pub struct BackRefSlot {
    link: Mutex<Option<TrackerLink>>,
}

impl BackRefSlot {
    /// Fresh, unclaimed slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current claim, if any.
    #[must_use]
    pub fn get(&self) -> Option<TrackerLink> {
        self.guard().clone()
    }

    /// Run `f` with exclusive access to the claim.
    ///
    /// The claim-or-fail decision on registration must be atomic with the
    /// write, so callers mutate through one critical section.
    pub fn update<R>(&self, f: impl FnOnce(&mut Option<TrackerLink>) -> R) -> R {
        let mut guard = self.guard();
        f(&mut guard)
    }

    /// Drop the claim if it belongs to the given registry.
    pub fn clear_for(&self, context_id: u64) {
        let mut guard = self.guard();
        if guard.as_ref().is_some_and(|l| l.context_id == context_id) {
            *guard = None;
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Option<TrackerLink>> {
        // A poisoned slot only means some other thread panicked mid-update;
        // the Option inside is still structurally valid.
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
