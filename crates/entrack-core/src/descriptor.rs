//! Mapped-type descriptors.
//!
//! # Role
//!
//! The engine consumes mapping metadata through [`EntityDescriptor`]; it
//! never inspects domain objects directly. Descriptors live for the whole
//! process (typically `static` instances) and are passed around as
//! `&'static dyn EntityDescriptor`.
//!
//! # Example
//!
//! ```ignore
//! static USER_ATTRS: &[AttributeInfo] = &[
//!     AttributeInfo::scalar("name"),
//!     AttributeInfo::to_one("team", "team")
//!         .cascade(CascadeStyle::ALL)
//!         .fk_direction(ForeignKeyDirection::ToParent),
//!     AttributeInfo::collection("addresses", &USER_ADDRESSES),
//! ];
//! static USER_ADDRESSES: CollectionInfo =
//!     CollectionInfo::new("user.addresses", "user").orphan_delete(true);
//! ```

use crate::instance::Instance;
use crate::state::AttributeValue;
use crate::value::Value;

/// The set of cascading operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeKind {
    /// Propagate save of a new object graph.
    Persist,
    /// Propagate merge of a detached graph.
    Merge,
    /// Propagate deletion.
    Delete,
    /// Propagate lock acquisition.
    Lock,
    /// Propagate refresh-from-storage.
    Refresh,
    /// Propagate eviction from the unit-of-work.
    Evict,
    /// Propagate replication between data stores.
    Replicate,
}

impl CascadeKind {
    /// Lowercase name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeKind::Persist => "persist",
            CascadeKind::Merge => "merge",
            CascadeKind::Delete => "delete",
            CascadeKind::Lock => "lock",
            CascadeKind::Refresh => "refresh",
            CascadeKind::Evict => "evict",
            CascadeKind::Replicate => "replicate",
        }
    }

    /// Whether this action evaluates orphan removal while walking.
    #[must_use]
    pub const fn performs_orphan_delete(self) -> bool {
        matches!(self, CascadeKind::Persist | CascadeKind::Delete)
    }

    /// Whether this action may force collection initialization.
    ///
    /// Only deletion is allowed to load a collection, and only to test
    /// orphan status when at least one element is known to be unsaved.
    #[must_use]
    pub const fn may_force_initialization(self) -> bool {
        matches!(self, CascadeKind::Delete)
    }

    /// Whether cascading fires at `point` for an association whose owning
    /// foreign key has the given direction.
    #[must_use]
    pub const fn cascade_now(self, point: CascadePoint, direction: ForeignKeyDirection) -> bool {
        direction.cascades_at(point)
    }

    /// When to schedule an orphan delete relative to pending updates.
    #[must_use]
    pub const fn orphan_delete_timing(self, direction: ForeignKeyDirection) -> OrphanTiming {
        match direction {
            ForeignKeyDirection::ToParent => OrphanTiming::BeforeUpdates,
            ForeignKeyDirection::FromParent => OrphanTiming::AfterUpdates,
        }
    }
}

/// Positions in the flush/operation pipeline at which cascading can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadePoint {
    /// During flush preparation, before any statement is issued.
    BeforeFlush,
    /// After inserts have been queued, before deletes.
    AfterInsertBeforeDelete,
    /// Before inserts, after deletes.
    BeforeInsertAfterDelete,
    /// After updates have been queued.
    AfterUpdate,
    /// After a lock request on the root.
    AfterLock,
    /// After the root was evicted.
    AfterEvict,
}

/// Which side of an association owns the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForeignKeyDirection {
    /// The foreign key sits in the child row and points at the parent.
    ToParent,
    /// The foreign key sits in the parent row and points at the child.
    #[default]
    FromParent,
}

impl ForeignKeyDirection {
    /// Whether an association with this direction cascades at `point`.
    ///
    /// To-parent keys must not cascade between insert and delete queueing;
    /// from-parent keys must not cascade in the mirrored window. This keeps
    /// referential ordering intact without the engine knowing about SQL.
    #[must_use]
    pub const fn cascades_at(self, point: CascadePoint) -> bool {
        match self {
            ForeignKeyDirection::ToParent => {
                !matches!(point, CascadePoint::BeforeInsertAfterDelete)
            }
            ForeignKeyDirection::FromParent => {
                !matches!(point, CascadePoint::AfterInsertBeforeDelete)
            }
        }
    }
}

/// Scheduling of an orphan delete relative to other pending updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanTiming {
    /// Delete the orphan before updates are applied.
    BeforeUpdates,
    /// Delete the orphan after updates are applied.
    AfterUpdates,
}

/// Per-attribute cascade policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeStyle {
    /// Cascade persist.
    pub persist: bool,
    /// Cascade merge.
    pub merge: bool,
    /// Cascade delete.
    pub delete: bool,
    /// Cascade lock.
    pub lock: bool,
    /// Cascade refresh.
    pub refresh: bool,
    /// Cascade evict.
    pub evict: bool,
    /// Cascade replicate.
    pub replicate: bool,
    /// Delete-orphan semantics in effect.
    pub delete_orphan: bool,
}

impl CascadeStyle {
    /// No cascading at all.
    pub const NONE: Self = Self {
        persist: false,
        merge: false,
        delete: false,
        lock: false,
        refresh: false,
        evict: false,
        replicate: false,
        delete_orphan: false,
    };

    /// Every operation cascades; orphans are kept.
    pub const ALL: Self = Self {
        persist: true,
        merge: true,
        delete: true,
        lock: true,
        refresh: true,
        evict: true,
        replicate: true,
        delete_orphan: false,
    };

    /// Every operation cascades and orphans are deleted.
    pub const ALL_DELETE_ORPHAN: Self = Self {
        delete_orphan: true,
        ..Self::ALL
    };

    /// Enable cascading for one operation kind.
    #[must_use]
    pub const fn with(mut self, kind: CascadeKind) -> Self {
        match kind {
            CascadeKind::Persist => self.persist = true,
            CascadeKind::Merge => self.merge = true,
            CascadeKind::Delete => self.delete = true,
            CascadeKind::Lock => self.lock = true,
            CascadeKind::Refresh => self.refresh = true,
            CascadeKind::Evict => self.evict = true,
            CascadeKind::Replicate => self.replicate = true,
        }
        self
    }

    /// Set delete-orphan semantics.
    #[must_use]
    pub const fn orphan_delete(mut self, value: bool) -> Self {
        self.delete_orphan = value;
        self
    }

    /// Whether `kind` cascades under this style.
    #[must_use]
    pub const fn applies(&self, kind: CascadeKind) -> bool {
        match kind {
            CascadeKind::Persist => self.persist,
            CascadeKind::Merge => self.merge,
            CascadeKind::Delete => self.delete,
            CascadeKind::Lock => self.lock,
            CascadeKind::Refresh => self.refresh,
            CascadeKind::Evict => self.evict,
            CascadeKind::Replicate => self.replicate,
        }
    }

    /// Whether any operation cascades under this style.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.persist
            || self.merge
            || self.delete
            || self.lock
            || self.refresh
            || self.evict
            || self.replicate
    }
}

/// Structural classification of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    /// Plain value held inline in the row.
    Scalar,
    /// Single-valued association to another mapped type.
    ToOne,
    /// Multi-valued association tracked as a persistent collection.
    Collection,
    /// Embedded value object with attributes of its own.
    Embedded,
}

/// Metadata describing one persistent collection role.
#[derive(Debug)]
pub struct CollectionInfo {
    /// Unique role name, conventionally `owner.attribute`.
    pub role: &'static str,
    /// Mapped-type name of the owning side.
    pub owner_entity: &'static str,
    /// Mapped-type name of the elements, when they are entities.
    pub element_entity: Option<&'static str>,
    /// Whether removed elements are deleted rather than just unlinked.
    pub orphan_delete: bool,
    /// Whether the other side owns the association.
    pub inverse: bool,
}

impl CollectionInfo {
    /// Create collection metadata with defaults.
    pub const fn new(role: &'static str, owner_entity: &'static str) -> Self {
        Self {
            role,
            owner_entity,
            element_entity: None,
            orphan_delete: false,
            inverse: false,
        }
    }

    /// Name the element mapped type.
    #[must_use]
    pub const fn element_entity(mut self, entity: &'static str) -> Self {
        self.element_entity = Some(entity);
        self
    }

    /// Set delete-orphan semantics.
    #[must_use]
    pub const fn orphan_delete(mut self, value: bool) -> Self {
        self.orphan_delete = value;
        self
    }

    /// Mark the role as the non-owning side.
    #[must_use]
    pub const fn inverse(mut self, value: bool) -> Self {
        self.inverse = value;
        self
    }
}

impl PartialEq for CollectionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
    }
}

/// Metadata about one attribute of a mapped type.
#[derive(Debug)]
pub struct AttributeInfo {
    /// Attribute name.
    pub name: &'static str,
    /// Structural kind.
    pub kind: AttributeKind,
    /// Cascade policy.
    pub cascade: CascadeStyle,
    /// Orphan removal for single-valued associations.
    pub orphan_removal: bool,
    /// Whether the attribute may hold NULL.
    pub nullable: bool,
    /// Whether the value can change behind its reference (collections,
    /// mutable components). Drives the provably-unchanged shortcut.
    pub mutable_by_ref: bool,
    /// Owning-key direction, meaningful for associations.
    pub fk_direction: ForeignKeyDirection,
    /// Target mapped-type name, for associations.
    pub target_entity: Option<&'static str>,
    /// Lazily resolved target descriptor, for associations.
    pub target_descriptor: Option<fn() -> &'static dyn EntityDescriptor>,
    /// Collection role metadata, for collection attributes.
    pub collection: Option<&'static CollectionInfo>,
    /// Nested attributes, for embedded values.
    pub embedded: Option<&'static [AttributeInfo]>,
}

impl AttributeInfo {
    const fn base(name: &'static str, kind: AttributeKind) -> Self {
        Self {
            name,
            kind,
            cascade: CascadeStyle::NONE,
            orphan_removal: false,
            nullable: false,
            mutable_by_ref: false,
            fk_direction: ForeignKeyDirection::FromParent,
            target_entity: None,
            target_descriptor: None,
            collection: None,
            embedded: None,
        }
    }

    /// A plain scalar attribute.
    pub const fn scalar(name: &'static str) -> Self {
        Self::base(name, AttributeKind::Scalar)
    }

    /// A single-valued association.
    pub const fn to_one(name: &'static str, target_entity: &'static str) -> Self {
        let mut info = Self::base(name, AttributeKind::ToOne);
        info.target_entity = Some(target_entity);
        info.nullable = true;
        info
    }

    /// A collection attribute backed by `role`.
    pub const fn collection(name: &'static str, role: &'static CollectionInfo) -> Self {
        let mut info = Self::base(name, AttributeKind::Collection);
        info.collection = Some(role);
        info.mutable_by_ref = true;
        info
    }

    /// An embedded value with nested attributes.
    pub const fn embedded(name: &'static str, attributes: &'static [AttributeInfo]) -> Self {
        let mut info = Self::base(name, AttributeKind::Embedded);
        info.embedded = Some(attributes);
        info
    }

    /// Set the cascade policy.
    #[must_use]
    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Set orphan removal for a single-valued association.
    #[must_use]
    pub const fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Set nullability.
    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Set mutable-by-reference.
    #[must_use]
    pub const fn mutable_by_ref(mut self, value: bool) -> Self {
        self.mutable_by_ref = value;
        self
    }

    /// Set the owning-key direction.
    #[must_use]
    pub const fn fk_direction(mut self, direction: ForeignKeyDirection) -> Self {
        self.fk_direction = direction;
        self
    }

    /// Set the lazily resolved target descriptor.
    #[must_use]
    pub const fn target_descriptor(
        mut self,
        resolve: fn() -> &'static dyn EntityDescriptor,
    ) -> Self {
        self.target_descriptor = Some(resolve);
        self
    }

    /// Whether this attribute participates in association walking.
    #[must_use]
    pub const fn is_association(&self) -> bool {
        matches!(self.kind, AttributeKind::ToOne | AttributeKind::Collection)
    }

    /// Delete-orphan semantics from either the style or the flag.
    #[must_use]
    pub const fn removes_orphans(&self) -> bool {
        self.orphan_removal || self.cascade.delete_orphan
    }
}

/// Contract every mapped type provides to the engine.
///
/// Only the descriptor understands the concrete domain type; everything it
/// hands back is either a [`Value`] or a type-erased handle.
pub trait EntityDescriptor: Send + Sync {
    /// Unique mapped-type name.
    fn entity_name(&self) -> &'static str;

    /// Attribute metadata, in persisted order.
    fn attributes(&self) -> &'static [AttributeInfo];

    /// Whether instances may be modified after load.
    fn is_mutable(&self) -> bool {
        true
    }

    /// Whether the type carries an optimistic-lock version.
    fn is_versioned(&self) -> bool {
        false
    }

    /// Whether identifiers are assigned by insert-at-save (known before
    /// flush) rather than at flush time.
    fn uses_early_insert(&self) -> bool {
        false
    }

    /// Whether the target storage dialect mishandles self-referential
    /// foreign keys on delete.
    fn self_referential_fk_defect(&self) -> bool {
        false
    }

    /// Indexes (into [`Self::attributes`]) of the natural key, if any.
    fn natural_key(&self) -> Option<&'static [usize]> {
        None
    }

    /// Extract the identifier, if one has been assigned.
    fn identifier_of(&self, instance: &Instance) -> Option<Value>;

    /// Write an identifier into the instance.
    fn inject_identifier(&self, instance: &Instance, id: &Value);

    /// Extract the version value, for versioned types.
    fn version_of(&self, instance: &Instance) -> Option<Value> {
        let _ = instance;
        None
    }

    /// Read the current attribute values, resolved, in attribute order.
    fn read_state(&self, instance: &Instance) -> Vec<AttributeValue>;

    /// The persister's own transient/persistent heuristic (for example an
    /// unsaved-version or unsaved-identifier check). `None` means no
    /// opinion.
    fn is_transient_hint(&self, instance: &Instance) -> Option<bool> {
        let _ = instance;
        None
    }

    /// Enhancement-based write ledger: `None` when the type is not
    /// instrumented, otherwise whether any attribute was ever written.
    fn tracked_writes(&self, instance: &Instance) -> Option<bool> {
        let _ = instance;
        None
    }

    /// Reset the write ledger after a successful update.
    fn clear_tracked_writes(&self, instance: &Instance) {
        let _ = instance;
    }

    /// Look up one attribute by name.
    fn attribute(&self, name: &str) -> Option<&'static AttributeInfo> {
        self.attributes().iter().find(|a| a.name == name)
    }

    /// Whether any attribute is a collection.
    fn has_collections(&self) -> bool {
        self.attributes()
            .iter()
            .any(|a| matches!(a.kind, AttributeKind::Collection))
    }

    /// Whether any attribute can change behind its reference.
    fn has_mutable_by_ref_attributes(&self) -> bool {
        self.attributes().iter().any(|a| a.mutable_by_ref)
    }
}

impl std::fmt::Debug for dyn EntityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("entity", &self.entity_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_style_builders() {
        let style = CascadeStyle::NONE
            .with(CascadeKind::Persist)
            .with(CascadeKind::Delete)
            .orphan_delete(true);
        assert!(style.applies(CascadeKind::Persist));
        assert!(style.applies(CascadeKind::Delete));
        assert!(!style.applies(CascadeKind::Merge));
        assert!(style.delete_orphan);
        assert!(style.any());
        assert!(!CascadeStyle::NONE.any());
    }

    #[test]
    fn test_all_delete_orphan_preset() {
        assert!(CascadeStyle::ALL_DELETE_ORPHAN.applies(CascadeKind::Refresh));
        assert!(CascadeStyle::ALL_DELETE_ORPHAN.delete_orphan);
        assert!(!CascadeStyle::ALL.delete_orphan);
    }

    #[test]
    fn test_cascade_points_respect_fk_direction() {
        let to_parent = ForeignKeyDirection::ToParent;
        let from_parent = ForeignKeyDirection::FromParent;
        assert!(to_parent.cascades_at(CascadePoint::AfterInsertBeforeDelete));
        assert!(!to_parent.cascades_at(CascadePoint::BeforeInsertAfterDelete));
        assert!(from_parent.cascades_at(CascadePoint::BeforeInsertAfterDelete));
        assert!(!from_parent.cascades_at(CascadePoint::AfterInsertBeforeDelete));
        assert!(to_parent.cascades_at(CascadePoint::BeforeFlush));
        assert!(from_parent.cascades_at(CascadePoint::BeforeFlush));
    }

    #[test]
    fn test_orphan_timing_follows_direction() {
        assert_eq!(
            CascadeKind::Delete.orphan_delete_timing(ForeignKeyDirection::ToParent),
            OrphanTiming::BeforeUpdates
        );
        assert_eq!(
            CascadeKind::Delete.orphan_delete_timing(ForeignKeyDirection::FromParent),
            OrphanTiming::AfterUpdates
        );
    }

    #[test]
    fn test_attribute_builders() {
        static ROLE: CollectionInfo = CollectionInfo::new("user.addresses", "user")
            .orphan_delete(true);
        const TEAM: AttributeInfo = AttributeInfo::to_one("team", "team")
            .cascade(CascadeStyle::ALL)
            .fk_direction(ForeignKeyDirection::ToParent);
        const ADDRESSES: AttributeInfo = AttributeInfo::collection("addresses", &ROLE)
            .cascade(CascadeStyle::ALL_DELETE_ORPHAN);

        assert_eq!(TEAM.kind, AttributeKind::ToOne);
        assert!(TEAM.nullable);
        assert!(TEAM.is_association());
        assert_eq!(TEAM.fk_direction, ForeignKeyDirection::ToParent);

        assert_eq!(ADDRESSES.kind, AttributeKind::Collection);
        assert!(ADDRESSES.mutable_by_ref);
        assert!(ADDRESSES.removes_orphans());
        assert_eq!(ADDRESSES.collection.unwrap().role, "user.addresses");
        assert!(ROLE.orphan_delete);
    }

    #[test]
    fn test_orphan_removal_from_flag_or_style() {
        const A: AttributeInfo = AttributeInfo::to_one("profile", "profile").orphan_removal(true);
        const B: AttributeInfo =
            AttributeInfo::to_one("profile", "profile").cascade(CascadeStyle::ALL_DELETE_ORPHAN);
        const C: AttributeInfo = AttributeInfo::to_one("profile", "profile");
        assert!(A.removes_orphans());
        assert!(B.removes_orphans());
        assert!(!C.removes_orphans());
    }
}
