//! Transient/persistent classification.
//!
//! # Role
//!
//! Decides whether a referenced object has a database row yet. The answer
//! drives foreign-key nullification before inserts and deletes: a key
//! referencing an object with no row must be written as NULL, or the
//! statement would violate referential integrity.
//!
//! # Resolution order
//!
//! [`TransienceProbe::is_transient`] asks, in order: the interceptor, the
//! mapped type's own heuristic, the caller-supplied assumption, and
//! finally the cached database snapshot. Only the last step may touch
//! storage, and it does so at most once per entity key per unit-of-work;
//! a "no row" answer is cached like any other.

use std::collections::{HashMap, HashSet};

use entrack_core::descriptor::{AttributeInfo, EntityDescriptor};
use entrack_core::error::Result;
use entrack_core::gateway::{Interceptor, StorageGateway};
use entrack_core::instance::Instance;
use entrack_core::state::{AttributeValue, EntityRef};
use entrack_core::value::{EntityKey, Value};

use crate::registry::IdentityRegistry;

/// Per-unit-of-work cache of database snapshots, including misses.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    by_key: HashMap<EntityKey, Option<Vec<Value>>>,
}

impl SnapshotCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
        }
    }

    /// Number of cached answers, misses included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// The cached answer for `key`, without touching storage. The outer
    /// `Option` is cache presence, the inner one row existence.
    #[must_use]
    pub fn cached(&self, key: &EntityKey) -> Option<&Option<Vec<Value>>> {
        self.by_key.get(key)
    }

    /// The database snapshot for one identifier, fetched at most once.
    ///
    /// # Errors
    ///
    /// Usage error when `id` cannot form an entity key; storage errors
    /// from the fetch.
    pub fn database_snapshot(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        gateway: &dyn StorageGateway,
    ) -> Result<Option<Vec<Value>>> {
        let key = EntityKey::new(descriptor.entity_name(), id.clone())?;
        if let Some(cached) = self.by_key.get(&key) {
            tracing::trace!(key = %key, hit = cached.is_some(), "snapshot cache hit");
            return Ok(cached.clone());
        }
        let fetched = gateway.entity_snapshot(descriptor, id)?;
        tracing::trace!(key = %key, found = fetched.is_some(), "snapshot fetched");
        self.by_key.insert(key, fetched.clone());
        Ok(fetched)
    }

    /// Forget the cached answer for `key`.
    pub fn evict(&mut self, key: &EntityKey) {
        self.by_key.remove(key);
    }

    /// Drop every cached answer.
    pub fn clear(&mut self) {
        self.by_key.clear();
    }
}

/// The transient-or-persistent question, with its collaborators bundled.
pub struct TransienceProbe<'a> {
    interceptor: &'a dyn Interceptor,
    gateway: &'a dyn StorageGateway,
    snapshots: &'a mut SnapshotCache,
}

impl<'a> TransienceProbe<'a> {
    pub fn new(
        interceptor: &'a dyn Interceptor,
        gateway: &'a dyn StorageGateway,
        snapshots: &'a mut SnapshotCache,
    ) -> Self {
        Self {
            interceptor,
            gateway,
            snapshots,
        }
    }

    /// Whether `instance` has no database row yet.
    ///
    /// `assumed` is the caller's own belief, trusted only when neither the
    /// interceptor nor the mapped type gives a definite answer; it exists
    /// to spare a storage round-trip in flows that already know.
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
        if let Some(answer) = self.interceptor.is_transient(instance) {
            return Ok(answer);
        }
        if let Some(answer) = descriptor.is_transient_hint(instance) {
            return Ok(answer);
        }
        if let Some(assumed) = assumed {
            return Ok(assumed);
        }
        let id = match descriptor.identifier_of(instance) {
            None | Some(Value::Null) => return Ok(true),
            Some(id) => id,
        };
        let snapshot = self
            .snapshots
            .database_snapshot(descriptor, &id, self.gateway)?;
        Ok(snapshot.is_none())
    }
}

/// Rewrites to-one references that point at not-yet-persisted objects to
/// NULL before an insert or delete of `subject` is executed.
pub struct Nullifier<'a> {
    is_delete: bool,
    early_insert: bool,
    subject: &'a Instance,
    subject_descriptor: &'static dyn EntityDescriptor,
    registry: &'a IdentityRegistry,
    nullifiable_keys: &'a HashSet<EntityKey>,
    deleted_unloaded_keys: &'a HashSet<EntityKey>,
    probe: TransienceProbe<'a>,
}

impl<'a> Nullifier<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        is_delete: bool,
        early_insert: bool,
        subject: &'a Instance,
        subject_descriptor: &'static dyn EntityDescriptor,
        registry: &'a IdentityRegistry,
        nullifiable_keys: &'a HashSet<EntityKey>,
        deleted_unloaded_keys: &'a HashSet<EntityKey>,
        probe: TransienceProbe<'a>,
    ) -> Self {
        Self {
            is_delete,
            early_insert,
            subject,
            subject_descriptor,
            registry,
            nullifiable_keys,
            deleted_unloaded_keys,
            probe,
        }
    }

    /// Null out every to-one reference in `values` whose target must not
    /// be referenced yet, descending into embedded values.
    ///
    /// # Errors
    ///
    /// Propagates classification failures.
    pub fn nullify_transient_references(
        &mut self,
        attributes: &'static [AttributeInfo],
        values: &mut [AttributeValue],
    ) -> Result<()> {
        for (attribute, value) in attributes.iter().zip(values.iter_mut()) {
            match value {
                AttributeValue::Reference(reference) => {
                    if self.is_reference_nullifiable(attribute, reference)? {
                        tracing::trace!(
                            entity = self.subject_descriptor.entity_name(),
                            attribute = attribute.name,
                            "nullifying reference to unsaved object"
                        );
                        *value = AttributeValue::Reference(EntityRef::null());
                    }
                }
                AttributeValue::Embedded(inner) => {
                    if let Some(inner_attributes) = attribute.embedded {
                        self.nullify_transient_references(inner_attributes, inner)?;
                    }
                }
                AttributeValue::Scalar(_) | AttributeValue::Collection(_) => {}
            }
        }
        Ok(())
    }

    fn is_reference_nullifiable(
        &mut self,
        attribute: &'static AttributeInfo,
        reference: &EntityRef,
    ) -> Result<bool> {
        if reference.is_null() {
            return Ok(false);
        }
        let Some(target) = reference.target() else {
            // A reference never loaded in this unit-of-work is only nulled
            // when the row behind it was deleted without being loaded.
            return self.unloaded_target_deleted(attribute, reference);
        };
        if target.same_as(self.subject) {
            return Ok(self.early_insert
                || (self.is_delete && self.subject_descriptor.self_referential_fk_defect()));
        }
        if let Some(handle) = self.registry.lookup(target) {
            if let Some(record) = self.registry.record(handle) {
                return record.is_nullifiable(self.early_insert, self.nullifiable_keys);
            }
        }
        let Some(resolve) = attribute.target_descriptor else {
            tracing::debug!(
                attribute = attribute.name,
                "no target descriptor; keeping reference as-is"
            );
            return Ok(false);
        };
        self.probe.is_transient(resolve(), target, None)
    }

    fn unloaded_target_deleted(
        &self,
        attribute: &'static AttributeInfo,
        reference: &EntityRef,
    ) -> Result<bool> {
        let (Some(entity), Some(id)) = (attribute.target_entity, reference.id()) else {
            return Ok(false);
        };
        let key = EntityKey::new(entity, id.clone())?;
        Ok(self.deleted_unloaded_keys.contains(&key))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use entrack_core::descriptor::CollectionInfo;
    use entrack_core::gateway::DefaultInterceptor;
    use entrack_core::instance::ContextToken;

    use crate::record::{EntityRecord, Status};

    use super::*;

    struct Widget {
        id: Option<i64>,
    }

    struct WidgetDescriptor;

    static WIDGET_ATTRS: &[AttributeInfo] = &[AttributeInfo::scalar("label")];

    impl EntityDescriptor for WidgetDescriptor {
        fn entity_name(&self) -> &'static str {
            "widget"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            WIDGET_ATTRS
        }

        fn identifier_of(&self, instance: &Instance) -> Option<Value> {
            let widget = instance.downcast::<Widget>()?;
            widget.id.map(Value::BigInt)
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, _instance: &Instance) -> Vec<AttributeValue> {
            vec![AttributeValue::null()]
        }
    }

    struct HintedDescriptor;

    impl EntityDescriptor for HintedDescriptor {
        fn entity_name(&self) -> &'static str {
            "hinted_widget"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            WIDGET_ATTRS
        }

        fn identifier_of(&self, _instance: &Instance) -> Option<Value> {
            None
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, _instance: &Instance) -> Vec<AttributeValue> {
            vec![AttributeValue::null()]
        }

        fn is_transient_hint(&self, _instance: &Instance) -> Option<bool> {
            Some(false)
        }
    }

    static WIDGET: WidgetDescriptor = WidgetDescriptor;
    static HINTED: HintedDescriptor = HintedDescriptor;

    fn widget(id: Option<i64>) -> Instance {
        Instance::plain(Arc::new(Widget { id }))
    }

    struct AnsweringInterceptor(Option<bool>);

    impl Interceptor for AnsweringInterceptor {
        fn is_transient(&self, _instance: &Instance) -> Option<bool> {
            self.0
        }
    }

    #[derive(Default)]
    struct RowGateway {
        rows: Vec<i64>,
        fetches: AtomicUsize,
    }

    impl StorageGateway for RowGateway {
        fn entity_snapshot(
            &self,
            _descriptor: &'static dyn EntityDescriptor,
            id: &Value,
        ) -> Result<Option<Vec<Value>>> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            match id {
                Value::BigInt(id) if self.rows.contains(id) => {
                    Ok(Some(vec![Value::Text("row".into())]))
                }
                _ => Ok(None),
            }
        }

        fn collection_elements(
            &self,
            _role: &'static CollectionInfo,
            _key: &Value,
        ) -> Result<Vec<Instance>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_interceptor_answer_wins() {
        let gateway = RowGateway::default();
        let mut snapshots = SnapshotCache::new();
        let interceptor = AnsweringInterceptor(Some(false));
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        // No id and no row anywhere, yet the interceptor says persistent.
        assert!(!probe.is_transient(&WIDGET, &widget(None), Some(true)).unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_descriptor_hint_consulted_second() {
        let gateway = RowGateway::default();
        let mut snapshots = SnapshotCache::new();
        let interceptor = DefaultInterceptor;
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        assert!(!probe.is_transient(&HINTED, &widget(None), Some(true)).unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_assumed_hint_spares_the_fetch() {
        let gateway = RowGateway::default();
        let mut snapshots = SnapshotCache::new();
        let interceptor = DefaultInterceptor;
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        assert!(probe
            .is_transient(&WIDGET, &widget(Some(1)), Some(true))
            .unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_snapshot_fallback_fetches_exactly_once() {
        let gateway = RowGateway {
            rows: vec![7],
            fetches: AtomicUsize::new(0),
        };
        let mut snapshots = SnapshotCache::new();
        let interceptor = DefaultInterceptor;
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        assert!(!probe.is_transient(&WIDGET, &widget(Some(7)), None).unwrap());
        assert!(!probe.is_transient(&WIDGET, &widget(Some(7)), None).unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_row_answer_is_cached_too() {
        let gateway = RowGateway::default();
        let mut snapshots = SnapshotCache::new();
        let interceptor = DefaultInterceptor;
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        assert!(probe.is_transient(&WIDGET, &widget(Some(3)), None).unwrap());
        assert!(probe.is_transient(&WIDGET, &widget(Some(3)), None).unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 1);

        let key = EntityKey::new("widget", Value::BigInt(3)).unwrap();
        assert_eq!(snapshots.cached(&key), Some(&None));
    }

    #[test]
    fn test_missing_identifier_means_transient() {
        let gateway = RowGateway::default();
        let mut snapshots = SnapshotCache::new();
        let interceptor = DefaultInterceptor;
        let mut probe = TransienceProbe::new(&interceptor, &gateway, &mut snapshots);

        assert!(probe.is_transient(&WIDGET, &widget(None), None).unwrap());
        assert_eq!(gateway.fetches.load(Ordering::Relaxed), 0);
    }

    // ==================== nullifier ====================

    fn widget_descriptor() -> &'static dyn EntityDescriptor {
        &WIDGET
    }

    static PART_ATTRS: &[AttributeInfo] = &[AttributeInfo::to_one("widget", "widget")
        .target_descriptor(widget_descriptor)];

    struct PartDescriptor;

    impl EntityDescriptor for PartDescriptor {
        fn entity_name(&self) -> &'static str {
            "part"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            PART_ATTRS
        }

        fn identifier_of(&self, _instance: &Instance) -> Option<Value> {
            Some(Value::BigInt(100))
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, _instance: &Instance) -> Vec<AttributeValue> {
            vec![AttributeValue::null()]
        }
    }

    struct CyclicDescriptor;

    impl EntityDescriptor for CyclicDescriptor {
        fn entity_name(&self) -> &'static str {
            "node"
        }

        fn attributes(&self) -> &'static [AttributeInfo] {
            PART_ATTRS
        }

        fn identifier_of(&self, _instance: &Instance) -> Option<Value> {
            Some(Value::BigInt(5))
        }

        fn inject_identifier(&self, _instance: &Instance, _id: &Value) {}

        fn read_state(&self, _instance: &Instance) -> Vec<AttributeValue> {
            vec![AttributeValue::null()]
        }

        fn self_referential_fk_defect(&self) -> bool {
            true
        }
    }

    static PART: PartDescriptor = PartDescriptor;
    static CYCLIC: CyclicDescriptor = CyclicDescriptor;

    struct NullifierFixture {
        registry: IdentityRegistry,
        nullifiable_keys: HashSet<EntityKey>,
        deleted_unloaded_keys: HashSet<EntityKey>,
        snapshots: SnapshotCache,
        gateway: RowGateway,
    }

    impl NullifierFixture {
        fn new(rows: Vec<i64>) -> Self {
            Self {
                registry: IdentityRegistry::new(ContextToken::new()),
                nullifiable_keys: HashSet::new(),
                deleted_unloaded_keys: HashSet::new(),
                snapshots: SnapshotCache::new(),
                gateway: RowGateway {
                    rows,
                    fetches: AtomicUsize::new(0),
                },
            }
        }

        fn nullify(
            &mut self,
            is_delete: bool,
            early_insert: bool,
            subject: &Instance,
            descriptor: &'static dyn EntityDescriptor,
            values: &mut [AttributeValue],
        ) -> Result<()> {
            let probe =
                TransienceProbe::new(&DefaultInterceptor, &self.gateway, &mut self.snapshots);
            let mut nullifier = Nullifier::new(
                is_delete,
                early_insert,
                subject,
                descriptor,
                &self.registry,
                &self.nullifiable_keys,
                &self.deleted_unloaded_keys,
                probe,
            );
            nullifier.nullify_transient_references(PART_ATTRS, values)
        }
    }

    fn reference_to(target: &Instance) -> Vec<AttributeValue> {
        vec![AttributeValue::Reference(EntityRef::resolved(
            target.clone(),
        ))]
    }

    fn is_nulled(values: &[AttributeValue]) -> bool {
        values[0].as_reference().is_some_and(EntityRef::is_null)
    }

    #[test]
    fn test_self_reference_nullified_for_early_insert() {
        let subject = widget(Some(5));
        let mut values = reference_to(&subject);
        let mut fx = NullifierFixture::new(vec![]);

        fx.nullify(false, true, &subject, &CYCLIC, &mut values).unwrap();
        assert!(is_nulled(&values));
    }

    #[test]
    fn test_self_reference_kept_without_early_insert_or_defect() {
        let subject = widget(Some(5));
        let mut values = reference_to(&subject);
        let mut fx = NullifierFixture::new(vec![]);

        fx.nullify(false, false, &subject, &PART, &mut values).unwrap();
        assert!(!is_nulled(&values));
    }

    #[test]
    fn test_self_reference_nullified_for_delete_with_dialect_defect() {
        let subject = widget(Some(5));
        let mut values = reference_to(&subject);
        let mut fx = NullifierFixture::new(vec![]);

        fx.nullify(true, false, &subject, &CYCLIC, &mut values).unwrap();
        assert!(is_nulled(&values));

        let mut values = reference_to(&subject);
        fx.nullify(true, false, &subject, &PART, &mut values).unwrap();
        assert!(!is_nulled(&values));
    }

    #[test]
    fn test_tracked_saving_reference_nullified() {
        let subject = widget(Some(1));
        let target = widget(Some(2));
        let mut fx = NullifierFixture::new(vec![2]);
        fx.registry
            .register(&target, EntityRecord::new(&WIDGET, Status::Saving, None))
            .unwrap();

        let mut values = reference_to(&target);
        fx.nullify(false, false, &subject, &PART, &mut values).unwrap();
        assert!(is_nulled(&values));
        // Tracked answer needed no storage round-trip.
        assert_eq!(fx.gateway.fetches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_tracked_managed_reference_kept() {
        let subject = widget(Some(1));
        let target = widget(Some(2));
        let mut fx = NullifierFixture::new(vec![]);
        fx.registry
            .register(
                &target,
                EntityRecord::new(&WIDGET, Status::Managed, Some(Value::BigInt(2)))
                    .with_exists_in_database(true),
            )
            .unwrap();

        let mut values = reference_to(&target);
        fx.nullify(false, false, &subject, &PART, &mut values).unwrap();
        assert!(!is_nulled(&values));
    }

    #[test]
    fn test_untracked_reference_classified_through_storage() {
        let subject = widget(Some(1));

        let transient = widget(Some(2));
        let mut fx = NullifierFixture::new(vec![]);
        let mut values = reference_to(&transient);
        fx.nullify(false, false, &subject, &PART, &mut values).unwrap();
        assert!(is_nulled(&values));

        let persistent = widget(Some(2));
        let mut fx = NullifierFixture::new(vec![2]);
        let mut values = reference_to(&persistent);
        fx.nullify(false, false, &subject, &PART, &mut values).unwrap();
        assert!(!is_nulled(&values));
    }

    #[test]
    fn test_unloaded_reference_nullified_only_when_deleted_unloaded() {
        let subject = widget(Some(1));

        let mut fx = NullifierFixture::new(vec![]);
        let mut values = vec![AttributeValue::Reference(EntityRef::unloaded(
            Value::BigInt(9),
        ))];
        fx.nullify(true, false, &subject, &PART, &mut values).unwrap();
        assert!(!is_nulled(&values));
        assert_eq!(fx.gateway.fetches.load(Ordering::Relaxed), 0);

        let mut fx = NullifierFixture::new(vec![]);
        fx.deleted_unloaded_keys
            .insert(EntityKey::new("widget", Value::BigInt(9)).unwrap());
        let mut values = vec![AttributeValue::Reference(EntityRef::unloaded(
            Value::BigInt(9),
        ))];
        fx.nullify(true, false, &subject, &PART, &mut values).unwrap();
        assert!(is_nulled(&values));
    }

    #[test]
    fn test_null_reference_left_alone() {
        let subject = widget(Some(1));
        let mut fx = NullifierFixture::new(vec![]);
        let mut values = vec![AttributeValue::Reference(EntityRef::null())];
        fx.nullify(false, true, &subject, &PART, &mut values).unwrap();
        assert!(is_nulled(&values));
        assert_eq!(fx.gateway.fetches.load(Ordering::Relaxed), 0);
    }
}
