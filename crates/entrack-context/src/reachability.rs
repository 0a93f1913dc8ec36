//! Collection reachability.
//!
//! # Role
//!
//! Decides, once per flush, what must happen to every tracked collection:
//! recreate it under a new owner, remove it, update its rows in place, or
//! leave it alone. The decision never looks at element values; it compares
//! the owner role and key the collection was loaded under against the ones
//! the flush walk finds it under now.
//!
//! # Flush protocol
//!
//! 1. [`CollectionTable::begin_flush`] resets every entry's per-flush
//!    flags and refreshes dirtiness against the element snapshots.
//! 2. The flush walk calls [`visit_owner_collections`] for each tracked
//!    object, which reaches every collection found among its attribute
//!    values.
//! 3. [`CollectionTable::sweep_unreached`] handles collections no owner
//!    reached: never-referenced ones keep their loaded owner, dereferenced
//!    ones are scheduled for removal (fatal for a delete-orphan role whose
//!    owner is still alive).
//! 4. [`CollectionTable::end_flush`] asserts every entry took part.
//!
//! An ownership change schedules recreate and remove together, which
//! requires the elements to be present; that is the one place the engine
//! force-initializes a lazy collection.

use std::collections::HashMap;

use entrack_core::collection::{CollectionId, TrackedCollection};
use entrack_core::descriptor::{AttributeInfo, CollectionInfo};
use entrack_core::error::{ConsistencyViolation, Error, Result};
use entrack_core::gateway::StorageGateway;
use entrack_core::instance::Instance;
use entrack_core::state::AttributeValue;

use crate::collection_entry::{CollectionEntry, CollectionKey};
use crate::record::EntityRecord;

#[derive(Debug)]
struct TableSlot {
    collection: TrackedCollection,
    entry: CollectionEntry,
}

/// All collection tracking entries of one unit-of-work, keyed by
/// collection reference identity.
#[derive(Debug, Default)]
pub struct CollectionTable {
    slots: HashMap<CollectionId, TableSlot>,
}

impl CollectionTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Number of tracked collections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Track `collection` under `entry`. Replaces any previous entry for
    /// the same collection instance.
    pub fn add(&mut self, collection: TrackedCollection, entry: CollectionEntry) -> CollectionId {
        let id = collection.id();
        self.slots.insert(id, TableSlot { collection, entry });
        id
    }

    /// The entry for `collection`, if tracked.
    #[must_use]
    pub fn entry(&self, collection: &TrackedCollection) -> Option<&CollectionEntry> {
        self.slots.get(&collection.id()).map(|slot| &slot.entry)
    }

    /// Mutable entry access by collection identity.
    #[must_use]
    pub fn entry_mut(&mut self, collection: &TrackedCollection) -> Option<&mut CollectionEntry> {
        self.slots
            .get_mut(&collection.id())
            .map(|slot| &mut slot.entry)
    }

    /// Stop tracking `collection`, returning its entry.
    pub fn remove(&mut self, collection: &TrackedCollection) -> Option<CollectionEntry> {
        self.slots.remove(&collection.id()).map(|slot| slot.entry)
    }

    /// Iterate (collection, entry) pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&TrackedCollection, &CollectionEntry)> {
        self.slots
            .values()
            .map(|slot| (&slot.collection, &slot.entry))
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
    }

    // ==================== flush protocol ====================

    /// Phase 1: reset per-flush flags on every entry.
    pub fn begin_flush(&mut self) {
        for slot in self.slots.values_mut() {
            slot.entry.pre_flush(&slot.collection);
        }
    }

    /// Phase 2: the flush walk found `collection` referenced by an owner
    /// under `role` with owner key `key`.
    ///
    /// A collection seen here for the first time gets a fresh entry.
    ///
    /// # Errors
    ///
    /// Consistency errors for a collection reached through two owners, a
    /// repointed delete-orphan collection, or duplicate processing;
    /// storage errors from a forced initialization.
    pub fn reach(
        &mut self,
        collection: &TrackedCollection,
        role: &'static CollectionInfo,
        key: Option<CollectionKey>,
        gateway: &dyn StorageGateway,
    ) -> Result<()> {
        let slot = self
            .slots
            .entry(collection.id())
            .or_insert_with(|| TableSlot {
                collection: collection.clone(),
                entry: CollectionEntry::brand_new(),
            });
        slot.entry.mark_reached(role, key)?;
        prepare_for_update(&mut slot.entry, &slot.collection, gateway)
    }

    /// Phase 3: process every entry the walk did not reach.
    ///
    /// `owner_deleted` reports whether a given owner instance is being
    /// deleted in this unit-of-work.
    ///
    /// # Errors
    ///
    /// Consistency error when a delete-orphan collection was dereferenced
    /// while its owner lives on; storage errors from forced
    /// initialization.
    pub fn sweep_unreached(
        &mut self,
        owner_deleted: impl Fn(&Instance) -> bool,
        gateway: &dyn StorageGateway,
    ) -> Result<()> {
        for slot in self.slots.values_mut() {
            if slot.entry.is_reached() || slot.entry.is_ignored() {
                continue;
            }
            slot.entry.note_reached()?;
            match slot.collection.owner() {
                None => {
                    // Never referenced in this flush; nothing moved.
                    slot.entry.carry_loaded_forward();
                }
                Some(owner) => {
                    let orphan_role = slot
                        .entry
                        .loaded_role()
                        .filter(|role| role.orphan_delete);
                    if let Some(role) = orphan_role {
                        if !owner_deleted(&owner) {
                            return Err(Error::Consistency(
                                ConsistencyViolation::OrphanedCollectionDereference {
                                    role: role.role,
                                },
                            ));
                        }
                    }
                    slot.entry.dereference();
                }
            }
            prepare_for_update(&mut slot.entry, &slot.collection, gateway)?;
        }
        Ok(())
    }

    /// Phase 4: assert every non-ignored entry was processed.
    ///
    /// # Errors
    ///
    /// Consistency error naming the first skipped entry.
    pub fn end_flush(&mut self) -> Result<()> {
        for slot in self.slots.values_mut() {
            slot.entry.post_flush()?;
        }
        Ok(())
    }

    /// Record completion of the scheduled collection actions: promote
    /// current owners to loaded, rebind collections, refresh snapshots.
    pub fn complete_actions(&mut self) {
        for slot in self.slots.values_mut() {
            let entry = &mut slot.entry;
            if !(entry.is_update_scheduled()
                || entry.is_removal_scheduled()
                || entry.is_recreate_scheduled())
            {
                continue;
            }
            entry.after_action(&slot.collection);
            if let (Some(role), Some(CollectionKey::Assigned(key))) =
                (entry.loaded_role(), entry.loaded_key())
            {
                slot.collection.bind(role, key.clone());
            }
        }
    }
}

/// Step 4 of the walk: choose recreate/remove/update for one entry.
fn prepare_for_update(
    entry: &mut CollectionEntry,
    collection: &TrackedCollection,
    gateway: &dyn StorageGateway,
) -> Result<()> {
    entry.mark_processed()?;
    if entry.loaded_role().is_none() && entry.current_role().is_none() {
        // Never persisted and not referenced; nothing to schedule.
        return Ok(());
    }
    if entry.owner_changed() {
        if let (Some(loaded), Some(_)) = (entry.loaded_role(), entry.current_role()) {
            if loaded.orphan_delete {
                return Err(Error::Consistency(
                    ConsistencyViolation::OrphanedCollectionDereference { role: loaded.role },
                ));
            }
        }
        if entry.current_role().is_some() {
            entry.schedule_recreate();
        }
        if entry.loaded_role().is_some() {
            entry.schedule_removal();
            if entry.is_recreate_scheduled() {
                // Moving rows between owners cannot be diffed lazily.
                tracing::trace!(role = entry.role_name(), "forcing collection initialization");
                collection.force_initialization(gateway)?;
            }
        }
    } else if entry.is_dirty(collection) {
        entry.schedule_update();
    }
    Ok(())
}

/// Reach every collection found among one owner's attribute values,
/// descending into embedded values.
///
/// # Errors
///
/// Propagates reachability and storage errors from [`CollectionTable::reach`].
pub fn visit_owner_collections(
    table: &mut CollectionTable,
    owner: &Instance,
    record: &EntityRecord,
    key: Option<CollectionKey>,
    gateway: &dyn StorageGateway,
) -> Result<()> {
    let values = record.descriptor().read_state(owner);
    visit_values(
        table,
        owner,
        record.descriptor().attributes(),
        &values,
        key.as_ref(),
        gateway,
    )
}

fn visit_values(
    table: &mut CollectionTable,
    owner: &Instance,
    attributes: &'static [AttributeInfo],
    values: &[AttributeValue],
    key: Option<&CollectionKey>,
    gateway: &dyn StorageGateway,
) -> Result<()> {
    for (attribute, value) in attributes.iter().zip(values) {
        match value {
            AttributeValue::Collection(collection) => {
                if let Some(role) = attribute.collection {
                    collection.attach_owner(owner.clone());
                    table.reach(collection, role, key.cloned(), gateway)?;
                }
            }
            AttributeValue::Embedded(inner) => {
                if let Some(inner_attributes) = attribute.embedded {
                    visit_values(table, owner, inner_attributes, inner, key, gateway)?;
                }
            }
            AttributeValue::Scalar(_) | AttributeValue::Reference(_) => {}
        }
    }
    Ok(())
}
