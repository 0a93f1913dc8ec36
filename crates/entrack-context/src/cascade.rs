//! Cascading-action graph walks.
//!
//! # Role
//!
//! Given a root object and an action kind, walk the root's association and
//! embedded-value attributes and produce a [`CascadePlan`]: the children the
//! action reaches, plus the former children that became orphans and must be
//! deleted. The walk issues no storage writes itself; the enclosing
//! unit-of-work consumes the plan, applies the action to each child, and
//! recurses from there. One call therefore covers exactly one object's
//! attributes.
//!
//! # Laziness
//!
//! The walk never initializes a lazy value. Collections contribute only
//! their loaded elements and explicitly queued removals. The single
//! exception is cascading a delete over a delete-orphan collection where at
//! least one queued removal is already known to be unsaved; only then is
//! the collection loaded, purely to find the rest of the orphan set.

use entrack_core::descriptor::{
    AttributeInfo, AttributeKind, CascadeKind, CascadePoint, EntityDescriptor, OrphanTiming,
};
use entrack_core::error::Result;
use entrack_core::gateway::StorageGateway;
use entrack_core::instance::Instance;
use entrack_core::state::AttributeValue;

use crate::reachability::CollectionTable;
use crate::record::{EntityRecord, Status};
use crate::registry::IdentityRegistry;

/// One operation produced by a cascade walk.
#[derive(Debug, Clone)]
pub enum CascadeOp {
    /// Apply the action to a child reached through `attribute`.
    Apply {
        /// Target mapped-type name, when the mapping declares one.
        entity: Option<&'static str>,
        /// Attribute the child was reached through.
        attribute: &'static str,
        /// The reached child.
        child: Instance,
    },
    /// Delete a former child that is no longer referenced.
    DeleteOrphan {
        /// Mapped-type name of the orphan.
        entity: &'static str,
        /// Attribute or collection role the orphan was dropped from.
        attribute: &'static str,
        /// The orphaned object.
        orphan: Instance,
        /// Where the delete sits relative to pending updates.
        timing: OrphanTiming,
    },
}

/// Ordered outcome of walking one object's attributes for one action.
#[derive(Debug)]
pub struct CascadePlan {
    kind: CascadeKind,
    ops: Vec<CascadeOp>,
}

impl CascadePlan {
    fn new(kind: CascadeKind) -> Self {
        Self {
            kind,
            ops: Vec::new(),
        }
    }

    /// The action this plan was built for.
    #[must_use]
    pub const fn kind(&self) -> CascadeKind {
        self.kind
    }

    /// All operations, in walk order.
    #[must_use]
    pub fn ops(&self) -> &[CascadeOp] {
        &self.ops
    }

    /// Consume the plan.
    #[must_use]
    pub fn into_ops(self) -> Vec<CascadeOp> {
        self.ops
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Children the action reaches.
    pub fn applications(&self) -> impl Iterator<Item = &Instance> {
        self.ops.iter().filter_map(|op| match op {
            CascadeOp::Apply { child, .. } => Some(child),
            CascadeOp::DeleteOrphan { .. } => None,
        })
    }

    /// Orphan deletes scheduled at the given timing.
    pub fn orphan_deletes(&self, timing: OrphanTiming) -> impl Iterator<Item = &Instance> {
        self.ops.iter().filter_map(move |op| match op {
            CascadeOp::DeleteOrphan {
                orphan, timing: t, ..
            } if *t == timing => Some(orphan),
            _ => None,
        })
    }

    fn push_apply(&mut self, entity: Option<&'static str>, attribute: &'static str, child: Instance) {
        self.ops.push(CascadeOp::Apply {
            entity,
            attribute,
            child,
        });
    }

    fn push_orphan(
        &mut self,
        entity: &'static str,
        attribute: &'static str,
        orphan: Instance,
        timing: OrphanTiming,
    ) {
        self.ops.push(CascadeOp::DeleteOrphan {
            entity,
            attribute,
            orphan,
            timing,
        });
    }
}

/// One cascade pass over a single object.
///
/// Borrows the unit-of-work's registry and collection table read-only, so a
/// plan can be built while the caller still holds the rest of the flush
/// state.
pub struct CascadeWalk<'a> {
    kind: CascadeKind,
    point: CascadePoint,
    registry: &'a IdentityRegistry,
    collections: &'a CollectionTable,
    gateway: &'a dyn StorageGateway,
}

impl<'a> CascadeWalk<'a> {
    pub fn new(
        kind: CascadeKind,
        point: CascadePoint,
        registry: &'a IdentityRegistry,
        collections: &'a CollectionTable,
        gateway: &'a dyn StorageGateway,
    ) -> Self {
        Self {
            kind,
            point,
            registry,
            collections,
            gateway,
        }
    }

    /// Walk `root`'s attributes and build the plan for this action.
    ///
    /// # Errors
    ///
    /// Storage errors from the one permitted forced initialization.
    pub fn cascade(
        &self,
        root: &Instance,
        descriptor: &'static dyn EntityDescriptor,
    ) -> Result<CascadePlan> {
        let mut plan = CascadePlan::new(self.kind);
        let attributes = descriptor.attributes();
        if !attributes
            .iter()
            .any(|a| a.cascade.any() || a.removes_orphans())
        {
            return Ok(plan);
        }

        tracing::trace!(
            entity = descriptor.entity_name(),
            action = self.kind.as_str(),
            "cascading"
        );
        let record = self
            .registry
            .lookup(root)
            .and_then(|handle| self.registry.record(handle));
        let values = descriptor.read_state(root);
        for (index, attribute) in attributes.iter().enumerate() {
            let Some(value) = values.get(index) else {
                continue;
            };
            if attribute.cascade.applies(self.kind) {
                self.apply_to_value(&mut plan, record, attribute, value)?;
            }
            if self.kind.performs_orphan_delete()
                && attribute.kind == AttributeKind::ToOne
                && attribute.removes_orphans()
            {
                self.replaced_to_one_orphan(&mut plan, record, attribute, index, value);
            }
        }
        Ok(plan)
    }

    fn apply_to_value(
        &self,
        plan: &mut CascadePlan,
        record: Option<&EntityRecord>,
        attribute: &'static AttributeInfo,
        value: &AttributeValue,
    ) -> Result<()> {
        match attribute.kind {
            AttributeKind::ToOne => self.cascade_to_one(plan, attribute, value),
            AttributeKind::Collection => self.cascade_collection(plan, record, attribute, value)?,
            AttributeKind::Embedded => self.cascade_embedded(plan, record, attribute, value)?,
            AttributeKind::Scalar => {}
        }
        Ok(())
    }

    fn cascade_to_one(
        &self,
        plan: &mut CascadePlan,
        attribute: &'static AttributeInfo,
        value: &AttributeValue,
    ) {
        if !self.kind.cascade_now(self.point, attribute.fk_direction) {
            return;
        }
        let Some(reference) = value.as_reference() else {
            return;
        };
        if reference.is_null() {
            return;
        }
        if let Some(target) = reference.target() {
            plan.push_apply(attribute.target_entity, attribute.name, target.clone());
        } else {
            // Unloaded reference: there is no state to walk and the walk
            // does not load one here. Detached owners land here routinely.
            tracing::trace!(
                attribute = attribute.name,
                action = self.kind.as_str(),
                "skipping cascade into unloaded reference"
            );
        }
    }

    fn cascade_collection(
        &self,
        plan: &mut CascadePlan,
        record: Option<&EntityRecord>,
        attribute: &'static AttributeInfo,
        value: &AttributeValue,
    ) -> Result<()> {
        if !self.kind.cascade_now(self.point, attribute.fk_direction) {
            return Ok(());
        }
        let Some(collection) = value.as_collection() else {
            return Ok(());
        };
        let role = attribute.collection;
        let element_entity = role
            .and_then(|r| r.element_entity)
            .or(attribute.target_entity);

        if !collection.is_initialized() {
            if record.is_none() {
                tracing::trace!(
                    attribute = attribute.name,
                    "skipping lazy collection of an untracked owner"
                );
                return Ok(());
            }
            if self.kind.may_force_initialization()
                && attribute.removes_orphans()
                && collection
                    .queued_removals()
                    .iter()
                    .any(|element| self.known_unsaved(element))
            {
                collection.force_initialization(self.gateway)?;
                tracing::debug!(
                    attribute = attribute.name,
                    "loaded collection to evaluate orphans for delete"
                );
            }
        }

        for element in collection.elements() {
            plan.push_apply(element_entity, attribute.name, element);
        }

        if self.kind.performs_orphan_delete() && attribute.removes_orphans() {
            let orphans = if collection.is_initialized() {
                self.collections
                    .entry(collection)
                    .map_or_else(Vec::new, |entry| entry.orphans(collection))
            } else {
                collection.queued_removals()
            };
            if orphans.is_empty() {
                return Ok(());
            }
            let Some(entity) = element_entity else {
                tracing::debug!(
                    attribute = attribute.name,
                    "dropping orphan deletes: collection elements carry no mapped type"
                );
                return Ok(());
            };
            let timing = self.kind.orphan_delete_timing(attribute.fk_direction);
            for orphan in orphans {
                plan.push_orphan(entity, attribute.name, orphan, timing);
            }
        }
        Ok(())
    }

    fn cascade_embedded(
        &self,
        plan: &mut CascadePlan,
        record: Option<&EntityRecord>,
        attribute: &'static AttributeInfo,
        value: &AttributeValue,
    ) -> Result<()> {
        let Some(children) = attribute.embedded else {
            return Ok(());
        };
        let AttributeValue::Embedded(values) = value else {
            return Ok(());
        };
        // Replaced-value orphan checks stay at the top level: the record's
        // loaded-state snapshot addresses top-level attributes only.
        for (child_attr, child_value) in children.iter().zip(values) {
            if child_attr.cascade.applies(self.kind) {
                self.apply_to_value(plan, record, child_attr, child_value)?;
            }
        }
        Ok(())
    }

    /// Compare the previous flush's loaded value for a single-valued
    /// association against the current one; a null or repoint while the
    /// old target is still tracked leaves an orphan behind.
    fn replaced_to_one_orphan(
        &self,
        plan: &mut CascadePlan,
        record: Option<&EntityRecord>,
        attribute: &'static AttributeInfo,
        index: usize,
        value: &AttributeValue,
    ) {
        let Some(record) = record else {
            return;
        };
        if record.status() == Status::Saving {
            return;
        }
        let Some(loaded_state) = record.loaded_state() else {
            return;
        };
        let Some(AttributeValue::Reference(previous)) = loaded_state.get(index) else {
            return;
        };
        let Some(previous_target) = previous.target() else {
            return;
        };
        if !self.registry.contains(previous_target) {
            return;
        }
        let Some(current) = value.as_reference() else {
            return;
        };
        // Comparable means we can answer "same target" honestly; an
        // unloaded current value with no identifier cannot be compared and
        // must not trigger a delete.
        let comparable = current.is_null()
            || current.target().is_some()
            || (current.id().is_some() && previous.id().is_some());
        if !comparable {
            tracing::trace!(
                attribute = attribute.name,
                "orphan check skipped: current value not comparable"
            );
            return;
        }
        if current.is_null() || !current.same_target(previous) {
            let Some(entity) = attribute.target_entity else {
                return;
            };
            let timing = self.kind.orphan_delete_timing(attribute.fk_direction);
            tracing::debug!(
                attribute = attribute.name,
                entity,
                ?timing,
                "association replaced, scheduling orphan delete"
            );
            plan.push_orphan(entity, attribute.name, previous_target.clone(), timing);
        }
    }

    /// Whether the unit-of-work already knows `element` has no row.
    fn known_unsaved(&self, element: &Instance) -> bool {
        self.registry
            .lookup(element)
            .and_then(|handle| self.registry.record(handle))
            .is_some_and(|record| {
                record.status() == Status::Saving || !record.exists_in_database()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock};

    use entrack_core::collection::TrackedCollection;
    use entrack_core::descriptor::{CascadeStyle, CollectionInfo, ForeignKeyDirection};
    use entrack_core::instance::ContextToken;
    use entrack_core::state::EntityRef;
    use entrack_core::value::Value;

    use crate::collection_entry::{CollectionEntry, CollectionKey};

    use super::*;

    static LINES: CollectionInfo = CollectionInfo::new("order.lines", "order")
        .element_entity("line")
        .orphan_delete(true);

    static ORDER_ATTRS: &[AttributeInfo] = &[
        AttributeInfo::scalar("code"),
        AttributeInfo::to_one("invoice", "invoice")
            .cascade(CascadeStyle::ALL)
            .orphan_removal(true)
            .fk_direction(ForeignKeyDirection::ToParent),
        AttributeInfo::to_one("note", "note").orphan_removal(true),
        AttributeInfo::collection("lines", &LINES).cascade(CascadeStyle::ALL_DELETE_ORPHAN),
    ];

    struct Order {
        invoice: RwLock<EntityRef>,
        note: RwLock<EntityRef>,
        lines: TrackedCollection,
    }

    struct OrderDescriptor;

    impl EntityDescriptor for OrderDescriptor {
        fn entity_name(&self) -> &'static str {
            "order"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            ORDER_ATTRS
        }

        fn identifier_of(&self, _instance: &Instance) -> Option<Value> {
            Some(Value::BigInt(1))
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, instance: &Instance) -> Vec<AttributeValue> {
            let order = instance.downcast::<Order>().unwrap();
            vec![
                AttributeValue::Scalar(Value::Text("A-1".into())),
                AttributeValue::Reference(order.invoice.read().unwrap().clone()),
                AttributeValue::Reference(order.note.read().unwrap().clone()),
                AttributeValue::Collection(order.lines.clone()),
            ]
        }
    }

    static ORDER: OrderDescriptor = OrderDescriptor;

    struct Other;

    struct OtherDescriptor;

    impl EntityDescriptor for OtherDescriptor {
        fn entity_name(&self) -> &'static str {
            "other"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            &[]
        }

        fn identifier_of(&self, _instance: &Instance) -> Option<Value> {
            None
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, _instance: &Instance) -> Vec<AttributeValue> {
            Vec::new()
        }
    }

    static OTHER: OtherDescriptor = OtherDescriptor;

    #[derive(Default)]
    struct CountingGateway {
        loads: AtomicUsize,
    }

    impl StorageGateway for CountingGateway {
        fn entity_snapshot(
            &self,
            _descriptor: &'static dyn EntityDescriptor,
            _id: &Value,
        ) -> Result<Option<Vec<Value>>> {
            Ok(None)
        }

        fn collection_elements(
            &self,
            _role: &'static CollectionInfo,
            _key: &Value,
        ) -> Result<Vec<Instance>> {
            self.loads.fetch_add(1, Ordering::Relaxed);
            Ok(vec![other(), other()])
        }
    }

    fn other() -> Instance {
        Instance::plain(Arc::new(Other))
    }

    fn order_instance(invoice: EntityRef, note: EntityRef, lines: TrackedCollection) -> Instance {
        Instance::plain(Arc::new(Order {
            invoice: RwLock::new(invoice),
            note: RwLock::new(note),
            lines,
        }))
    }

    struct Fixture {
        registry: IdentityRegistry,
        collections: CollectionTable,
        gateway: CountingGateway,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: IdentityRegistry::new(ContextToken::new()),
                collections: CollectionTable::new(),
                gateway: CountingGateway::default(),
            }
        }

        fn walk(&self, kind: CascadeKind, point: CascadePoint) -> CascadeWalk<'_> {
            CascadeWalk::new(kind, point, &self.registry, &self.collections, &self.gateway)
        }

        fn track(&mut self, instance: &Instance, record: EntityRecord) {
            self.registry.register(instance, record).unwrap();
        }
    }

    fn managed_record(id: i64) -> EntityRecord {
        EntityRecord::new(&OTHER, Status::Managed, Some(Value::BigInt(id)))
            .with_exists_in_database(true)
    }

    #[test]
    fn test_resolved_reference_is_reached() {
        let fixture = Fixture::new();
        let invoice = other();
        let root = order_instance(
            EntityRef::resolved(invoice.clone()),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let reached: Vec<_> = plan.applications().collect();
        assert_eq!(reached.len(), 1);
        assert!(reached[0].same_as(&invoice));
    }

    #[test]
    fn test_point_gating_respects_fk_direction() {
        let fixture = Fixture::new();
        let root = order_instance(
            EntityRef::resolved(other()),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );

        // The invoice key sits in the child row; that association must not
        // cascade between delete and insert queueing.
        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeInsertAfterDelete)
            .cascade(&root, &ORDER)
            .unwrap();
        assert_eq!(plan.applications().count(), 0);

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::AfterInsertBeforeDelete)
            .cascade(&root, &ORDER)
            .unwrap();
        assert_eq!(plan.applications().count(), 1);
    }

    #[test]
    fn test_unloaded_reference_skipped_silently() {
        let fixture = Fixture::new();
        let root = order_instance(
            EntityRef::unloaded(Value::BigInt(9)),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_nulled_association_schedules_orphan_before_updates() {
        let mut fixture = Fixture::new();
        let old_invoice = other();
        fixture.track(&old_invoice, managed_record(7));

        let root = order_instance(
            EntityRef::null(),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::resolved(old_invoice.clone())),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1)))
                .with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let before: Vec<_> = plan.orphan_deletes(OrphanTiming::BeforeUpdates).collect();
        assert_eq!(before.len(), 1);
        assert!(before[0].same_as(&old_invoice));
        assert_eq!(plan.orphan_deletes(OrphanTiming::AfterUpdates).count(), 0);
    }

    #[test]
    fn test_orphan_checked_even_when_action_does_not_apply() {
        let mut fixture = Fixture::new();
        let old_note = other();
        fixture.track(&old_note, managed_record(3));

        // "note" carries no cascade style at all, only orphan removal, and
        // its key direction defaults to from-parent.
        let root = order_instance(
            EntityRef::null(),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::Reference(EntityRef::resolved(old_note.clone())),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1)))
                .with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let after: Vec<_> = plan.orphan_deletes(OrphanTiming::AfterUpdates).collect();
        assert_eq!(after.len(), 1);
        assert!(after[0].same_as(&old_note));
    }

    #[test]
    fn test_repointed_association_orphans_the_old_target() {
        let mut fixture = Fixture::new();
        let old_invoice = other();
        let new_invoice = other();
        fixture.track(&old_invoice, managed_record(7));

        let root = order_instance(
            EntityRef::resolved(new_invoice.clone()),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::resolved(old_invoice.clone())),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1)))
                .with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let orphans: Vec<_> = plan.orphan_deletes(OrphanTiming::BeforeUpdates).collect();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].same_as(&old_invoice));
        // The new target is still reached by the action itself.
        assert!(plan.applications().any(|c| c.same_as(&new_invoice)));
    }

    #[test]
    fn test_unchanged_association_leaves_no_orphan() {
        let mut fixture = Fixture::new();
        let invoice = other();
        fixture.track(&invoice, managed_record(7));

        let root = order_instance(
            EntityRef::resolved(invoice.clone()),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::resolved(invoice)),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1)))
                .with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();
        assert_eq!(plan.orphan_deletes(OrphanTiming::BeforeUpdates).count(), 0);
    }

    #[test]
    fn test_untracked_previous_target_is_not_orphaned() {
        let mut fixture = Fixture::new();
        let old_invoice = other();

        let root = order_instance(
            EntityRef::null(),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::resolved(old_invoice)),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1)))
                .with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();
        assert_eq!(plan.orphan_deletes(OrphanTiming::BeforeUpdates).count(), 0);
    }

    #[test]
    fn test_saving_root_has_no_orphans() {
        let mut fixture = Fixture::new();
        let old_invoice = other();
        fixture.track(&old_invoice, managed_record(7));

        let root = order_instance(
            EntityRef::null(),
            EntityRef::null(),
            TrackedCollection::brand_new(),
        );
        let loaded = vec![
            AttributeValue::Scalar(Value::Text("A-1".into())),
            AttributeValue::Reference(EntityRef::resolved(old_invoice)),
            AttributeValue::Reference(EntityRef::null()),
            AttributeValue::null(),
        ];
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Saving, None).with_loaded_state(loaded),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();
        assert_eq!(plan.orphan_deletes(OrphanTiming::BeforeUpdates).count(), 0);
    }

    #[test]
    fn test_collection_elements_are_reached() {
        let fixture = Fixture::new();
        let lines = TrackedCollection::brand_new();
        let a = other();
        let b = other();
        lines.add(a.clone());
        lines.add(b.clone());
        let root = order_instance(EntityRef::null(), EntityRef::null(), lines);

        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let reached: Vec<_> = plan.applications().collect();
        assert_eq!(reached.len(), 2);
        assert!(reached[0].same_as(&a));
        assert!(reached[1].same_as(&b));
    }

    #[test]
    fn test_initialized_collection_orphans_come_from_entry_history() {
        let mut fixture = Fixture::new();
        let kept = other();
        let dropped = other();

        // Entry history says both were persisted; the live collection now
        // holds only the survivor.
        let lines = TrackedCollection::brand_new();
        lines.add(kept.clone());
        let entry = CollectionEntry::loaded(
            &LINES,
            CollectionKey::Assigned(Value::BigInt(1)),
            vec![kept.clone(), dropped.clone()],
        );
        fixture.collections.add(lines.clone(), entry);

        let root = order_instance(EntityRef::null(), EntityRef::null(), lines.clone());

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let orphans: Vec<_> = plan.orphan_deletes(OrphanTiming::AfterUpdates).collect();
        assert!(orphans.iter().any(|o| o.same_as(&dropped)));
        assert!(!orphans.iter().any(|o| o.same_as(&kept)));
    }

    #[test]
    fn test_uninitialized_collection_uses_queued_removals_without_loading() {
        let fixture = Fixture::new();
        let removed = other();
        let lines = TrackedCollection::loaded(&LINES, Value::BigInt(1));
        lines.queue_removal(removed.clone());
        let root = order_instance(EntityRef::null(), EntityRef::null(), lines);

        // The owner is untracked for this walk, so the lazy skip applies to
        // reaching children, but a persist never loads anyway.
        let plan = fixture
            .walk(CascadeKind::Persist, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        assert_eq!(plan.applications().count(), 0);
        assert_eq!(fixture.gateway.loads.load(Ordering::Relaxed), 0);
        // Tracked owner, delete, but no known-unsaved candidate: still no
        // load, orphans are the queued removals alone.
        let mut fixture = Fixture::new();
        let removed = other();
        let lines = TrackedCollection::loaded(&LINES, Value::BigInt(1));
        lines.queue_removal(removed.clone());
        let root = order_instance(EntityRef::null(), EntityRef::null(), lines);
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1))),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        let orphans: Vec<_> = plan.orphan_deletes(OrphanTiming::AfterUpdates).collect();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].same_as(&removed));
        assert_eq!(fixture.gateway.loads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_delete_with_known_unsaved_candidate_loads_collection() {
        let mut fixture = Fixture::new();
        let unsaved = other();
        fixture.track(
            &unsaved,
            EntityRecord::new(&OTHER, Status::Saving, None),
        );

        let lines = TrackedCollection::loaded(&LINES, Value::BigInt(1));
        lines.queue_removal(unsaved.clone());
        let root = order_instance(EntityRef::null(), EntityRef::null(), lines.clone());
        fixture.track(
            &root,
            EntityRecord::new(&ORDER, Status::Managed, Some(Value::BigInt(1))),
        );

        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &ORDER)
            .unwrap();

        assert_eq!(fixture.gateway.loads.load(Ordering::Relaxed), 1);
        assert!(lines.is_initialized());
        // The fetched elements are now reachable children of the delete.
        assert_eq!(plan.applications().count(), 2);
    }

    #[test]
    fn test_no_cascade_metadata_short_circuits() {
        let fixture = Fixture::new();
        let root = other();
        let plan = fixture
            .walk(CascadeKind::Delete, CascadePoint::BeforeFlush)
            .cascade(&root, &OTHER)
            .unwrap();
        assert!(plan.is_empty());
    }
}
