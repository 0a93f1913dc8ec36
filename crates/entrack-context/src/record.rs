//! Lifecycle records.
//!
//! # Role
//!
//! One [`EntityRecord`] per tracked object: where the object stands in its
//! lifecycle, what was last known to be persisted for it, which lock is
//! held, and whether a row exists. The record is pure data plus the small
//! state machine below; it never talks to storage.
//!
//! # State machine
//!
//! ```text
//! LOADING -> MANAGED -> { READ_ONLY, SAVING, DELETED }
//! READ_ONLY <-> MANAGED          (mutable types only)
//! DELETED -> GONE                (terminal)
//! ```
//!
//! Entering READ_ONLY drops the loaded-state snapshot: read-only objects
//! are never dirty-checked, so the memory is reclaimed immediately.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use entrack_core::descriptor::EntityDescriptor;
use entrack_core::error::{ConsistencyViolation, Error, Result, UsageViolation};
use entrack_core::instance::Instance;
use entrack_core::state::AttributeValue;
use entrack_core::value::{EntityKey, Value};

/// Lifecycle status of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// Being hydrated from storage; attributes may be half-populated.
    Loading,
    /// Fully tracked and eligible for dirty checking.
    Managed,
    /// Tracked but exempt from dirty checking.
    ReadOnly,
    /// Insert in flight; the identifier may not be final.
    Saving,
    /// Scheduled for deletion in this unit-of-work.
    Deleted,
    /// Physically deleted; terminal.
    Gone,
}

impl Status {
    /// Uppercase name for logs and error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Loading => "LOADING",
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Saving => "SAVING",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
        }
    }
}

/// Concurrency-control level held for a tracked object.
///
/// Ordering is significant: escalation keeps the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockLevel {
    /// No lock.
    None,
    /// Shared read lock.
    Read,
    /// Upgrade (pessimistic read) lock.
    Upgrade,
    /// Exclusive write lock.
    Write,
    /// Forced version increment.
    Force,
}

/// Passivation kind tag selecting how a record is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    /// Record for a mutable mapped type.
    Mutable,
    /// Record for an immutable mapped type.
    Immutable,
}

/// Pluggable dirtiness override consulted by
/// [`EntityRecord::requires_dirty_check`].
pub trait DirtinessOverride {
    /// Whether `instance` could possibly be dirty. `false` proves it clean.
    fn can_be_dirty(
        &self,
        instance: &Instance,
        descriptor: &'static dyn EntityDescriptor,
    ) -> bool;
}

/// Per-tracked-object lifecycle record.
#[derive(Debug)]
pub struct EntityRecord {
    descriptor: &'static dyn EntityDescriptor,
    id: Option<Value>,
    status: Status,
    previous_status: Option<Status>,
    loaded_state: Option<Vec<AttributeValue>>,
    deleted_state: Option<Vec<AttributeValue>>,
    version: Option<Value>,
    lock: LockLevel,
    exists_in_database: bool,
    row_id: Option<Value>,
    /// False only for records rebuilt from a passivation image that no
    /// persistence context has re-adopted yet.
    adopted: bool,
}

impl EntityRecord {
    /// Create a record in the given status. Everything else starts empty;
    /// use the `with_*` builders to fill in what the flow knows.
    #[must_use]
    pub fn new(
        descriptor: &'static dyn EntityDescriptor,
        status: Status,
        id: Option<Value>,
    ) -> Self {
        Self {
            descriptor,
            id,
            status,
            previous_status: None,
            loaded_state: None,
            deleted_state: None,
            version: None,
            lock: LockLevel::None,
            exists_in_database: false,
            row_id: None,
            adopted: true,
        }
    }

    /// Attach the loaded-state snapshot.
    #[must_use]
    pub fn with_loaded_state(mut self, state: Vec<AttributeValue>) -> Self {
        self.loaded_state = Some(state);
        self
    }

    /// Attach the version value.
    #[must_use]
    pub fn with_version(mut self, version: Value) -> Self {
        self.version = Some(version);
        self
    }

    /// Set the lock level.
    #[must_use]
    pub fn with_lock(mut self, lock: LockLevel) -> Self {
        self.lock = lock;
        self
    }

    /// Set whether a row is known to exist in storage.
    #[must_use]
    pub fn with_exists_in_database(mut self, exists: bool) -> Self {
        self.exists_in_database = exists;
        self
    }

    /// Attach the physical row locator.
    #[must_use]
    pub fn with_row_id(mut self, row_id: Value) -> Self {
        self.row_id = Some(row_id);
        self
    }

    /// Rebuild a record from passivated parts. Immutable-kind records stay
    /// detached until a context adopts them.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn reactivated(
        descriptor: &'static dyn EntityDescriptor,
        kind: RecordKind,
        id: Option<Value>,
        status: Status,
        previous_status: Option<Status>,
        version: Option<Value>,
        lock: LockLevel,
        exists_in_database: bool,
        row_id: Option<Value>,
    ) -> Self {
        Self {
            descriptor,
            id,
            status,
            previous_status,
            loaded_state: None,
            deleted_state: None,
            version,
            lock,
            exists_in_database,
            row_id,
            adopted: kind == RecordKind::Mutable,
        }
    }

    pub(crate) fn mark_adopted(&mut self) {
        self.adopted = true;
    }

    // ==================== accessors ====================

    /// The owning mapped-type descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &'static dyn EntityDescriptor {
        self.descriptor
    }

    /// The mapped-type name.
    #[must_use]
    pub fn entity_name(&self) -> &'static str {
        self.descriptor.entity_name()
    }

    /// The surrogate identifier, once assigned.
    #[must_use]
    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// Assign the identifier (insert generators do this late).
    pub fn set_id(&mut self, id: Value) {
        self.id = Some(id);
    }

    /// Database identity of this record.
    ///
    /// # Errors
    ///
    /// Usage error when no identifier has been assigned yet.
    pub fn entity_key(&self) -> Result<EntityKey> {
        match &self.id {
            Some(id) => EntityKey::new(self.entity_name(), id.clone()),
            None => Err(Error::Usage(UsageViolation::MissingIdentifier {
                entity: self.entity_name(),
            })),
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Status immediately before the current one.
    #[must_use]
    pub const fn previous_status(&self) -> Option<Status> {
        self.previous_status
    }

    /// Attribute values as last known persisted.
    #[must_use]
    pub fn loaded_state(&self) -> Option<&[AttributeValue]> {
        self.loaded_state.as_deref()
    }

    /// State captured when the delete was scheduled.
    #[must_use]
    pub fn deleted_state(&self) -> Option<&[AttributeValue]> {
        self.deleted_state.as_deref()
    }

    /// Version value, for versioned types.
    #[must_use]
    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    /// Lock level currently held.
    #[must_use]
    pub const fn lock_level(&self) -> LockLevel {
        self.lock
    }

    /// Whether a row is known to exist for this identifier.
    #[must_use]
    pub const fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    /// Physical row locator, when the dialect provides one.
    #[must_use]
    pub fn row_id(&self) -> Option<&Value> {
        self.row_id.as_ref()
    }

    /// Passivation kind tag for this record.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        if self.descriptor.is_mutable() {
            RecordKind::Mutable
        } else {
            RecordKind::Immutable
        }
    }

    // ==================== state machine ====================

    /// Transition to `status`.
    ///
    /// No-op when the status is unchanged (no previous-status shuffle).
    /// GONE is absorbing: attempts to leave it are ignored and logged.
    pub fn set_status(&mut self, status: Status) {
        if status == Status::ReadOnly {
            // Read-only objects are never dirty-checked again.
            self.loaded_state = None;
        }
        if self.status == status {
            return;
        }
        if self.status == Status::Gone {
            tracing::warn!(
                entity = self.entity_name(),
                requested = status.as_str(),
                "ignoring status transition out of GONE"
            );
            return;
        }
        tracing::trace!(
            entity = self.entity_name(),
            from = self.status.as_str(),
            to = status.as_str(),
            "status transition"
        );
        self.previous_status = Some(self.status);
        self.status = status;
    }

    /// Whether the underlying object may be modified in this unit-of-work.
    ///
    /// Deleting a read-only object does not make it modifiable again,
    /// hence the previous-status check.
    #[must_use]
    pub fn is_modifiable(&self) -> bool {
        self.descriptor.is_mutable()
            && self.status != Status::ReadOnly
            && !(self.status == Status::Deleted
                && self.previous_status == Some(Status::ReadOnly))
    }

    /// Whether the object is currently read-only.
    ///
    /// # Errors
    ///
    /// Usage error outside MANAGED/READ_ONLY, and for an immutable-kind
    /// record that no persistence context has adopted.
    pub fn is_read_only(&self) -> Result<bool> {
        if !self.adopted {
            return Err(Error::Usage(UsageViolation::ImmutableWithoutContext {
                entity: self.entity_name(),
            }));
        }
        if !matches!(self.status, Status::Managed | Status::ReadOnly) {
            return Err(Error::Usage(UsageViolation::ReadOnlyStatusUnavailable {
                entity: self.entity_name(),
                status: self.status.as_str(),
            }));
        }
        Ok(self.status == Status::ReadOnly)
    }

    /// Toggle read-only tracking for this object.
    ///
    /// Leaving READ_ONLY re-snapshots the loaded state from the live
    /// instance, since dirty checking resumes from "now".
    ///
    /// # Errors
    ///
    /// Consistency error for immutable mapped types; usage error outside
    /// MANAGED/READ_ONLY.
    pub fn set_read_only(&mut self, read_only: bool, instance: &Instance) -> Result<()> {
        if !self.descriptor.is_mutable() {
            return Err(Error::Consistency(
                ConsistencyViolation::ReadOnlyToggleOnImmutable {
                    entity: self.entity_name(),
                },
            ));
        }
        if self.is_read_only()? == read_only {
            return Ok(());
        }
        if read_only {
            self.set_status(Status::ReadOnly);
        } else {
            self.set_status(Status::Managed);
            self.loaded_state = Some(self.descriptor.read_state(instance));
        }
        Ok(())
    }

    /// Whether foreign keys referencing this object must be nulled out.
    ///
    /// True while the insert is in flight, or (for early-insert identifier
    /// strategies) while no row exists yet; otherwise the decision falls to
    /// the nullifiable-key set maintained during the flush.
    ///
    /// # Errors
    ///
    /// Usage error when the fallback needs an identity key and none can be
    /// formed yet.
    pub fn is_nullifiable(
        &self,
        early_insert: bool,
        nullifiables: &HashSet<EntityKey>,
    ) -> Result<bool> {
        if self.status == Status::Saving {
            return Ok(true);
        }
        if early_insert {
            return Ok(!self.exists_in_database);
        }
        Ok(nullifiables.contains(&self.entity_key()?))
    }

    /// Whether the flush must diff this object's attributes.
    ///
    /// Modifiable and not provably unchanged. Provably unchanged means the
    /// enhancement tracker never saw a write, or the custom strategy rules
    /// dirtiness out.
    #[must_use]
    pub fn requires_dirty_check(
        &self,
        instance: &Instance,
        custom: Option<&dyn DirtinessOverride>,
    ) -> bool {
        self.is_modifiable() && !self.provably_unchanged(instance, custom)
    }

    fn provably_unchanged(
        &self,
        instance: &Instance,
        custom: Option<&dyn DirtinessOverride>,
    ) -> bool {
        if self.descriptor.tracked_writes(instance) == Some(false) {
            return true;
        }
        if let Some(strategy) = custom {
            if !strategy.can_be_dirty(instance, self.descriptor) {
                return true;
            }
        }
        false
    }

    // ==================== flush callbacks ====================

    /// Record a successful update: new snapshot, write lock, next version,
    /// tracker reset.
    pub fn post_update(
        &mut self,
        instance: &Instance,
        new_state: Vec<AttributeValue>,
        next_version: Option<Value>,
    ) {
        self.loaded_state = Some(new_state);
        self.escalate_lock(LockLevel::Write);
        if self.descriptor.is_versioned() {
            self.version = next_version;
        }
        self.descriptor.clear_tracked_writes(instance);
    }

    /// Record a successful insert.
    pub fn post_insert(&mut self) {
        self.exists_in_database = true;
    }

    /// Record a successful physical delete.
    pub fn post_delete(&mut self) {
        self.exists_in_database = false;
        self.set_status(Status::Gone);
    }

    /// Capture attribute values at delete-scheduling time, for cascades
    /// that need prior values.
    pub fn capture_deleted_state(&mut self, state: Vec<AttributeValue>) {
        self.deleted_state = Some(state);
    }

    /// Raise the lock level; never lowers it.
    pub fn escalate_lock(&mut self, level: LockLevel) {
        self.lock = self.lock.max(level);
    }

    /// Drop back to no lock (transaction completion).
    pub fn downgrade_lock(&mut self) {
        self.lock = LockLevel::None;
    }
}
