//! Reference-identity registry.
//!
//! # Role
//!
//! Maps live object references to their [`EntityRecord`]s. Two objects are
//! the same object only if they are the same allocation; equality of mapped
//! attributes plays no part here.
//!
//! # Design
//!
//! Records live in a slab indexed by [`EntityHandle`] (index plus
//! generation, so a recycled slot invalidates stale handles). Occupied
//! slots form a doubly-linked list in registration order, which makes
//! unregistration a constant-time relink and keeps iteration stable.
//!
//! Lookup prefers the instance's own back-reference slot: a tracker link
//! stamped with this registry's context id decodes straight to a handle.
//! Plain instances, and instances whose tracker is owned by another live
//! context, go through a pointer-keyed side map instead.

use std::collections::HashMap;
use std::sync::Arc;

use entrack_core::error::{ConsistencyViolation, Error, Result};
use entrack_core::instance::{ContextToken, Instance, TrackerLink};

use crate::record::EntityRecord;

/// Stable handle to a registered record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle {
    index: u32,
    generation: u32,
}

impl EntityHandle {
    pub(crate) const fn encode(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    pub(crate) const fn decode(raw: u64) -> Self {
        Self {
            index: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

#[derive(Debug)]
struct OccupiedSlot {
    instance: Instance,
    record: EntityRecord,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<OccupiedSlot>,
    next_free: Option<u32>,
}

/// How a newly registered instance gets linked back to its handle.
enum Linkage {
    /// Stamp the instance's own tracker slot.
    Tracker,
    /// Keep the association private to this registry.
    SideMap,
}

/// Identity-keyed store of lifecycle records for one unit-of-work.
#[derive(Debug)]
pub struct IdentityRegistry {
    token: Arc<ContextToken>,
    slots: Vec<Slot>,
    head: Option<u32>,
    tail: Option<u32>,
    free_head: Option<u32>,
    by_ptr: HashMap<usize, EntityHandle>,
    len: usize,
    cached_snapshot: Option<Arc<[(Instance, EntityHandle)]>>,
}

impl IdentityRegistry {
    /// Create an empty registry owned by the context behind `token`.
    #[must_use]
    pub fn new(token: Arc<ContextToken>) -> Self {
        Self {
            token,
            slots: Vec::new(),
            head: None,
            tail: None,
            free_head: None,
            by_ptr: HashMap::new(),
            len: 0,
            cached_snapshot: None,
        }
    }

    /// Number of registered references.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `instance` is registered here.
    #[must_use]
    pub fn contains(&self, instance: &Instance) -> bool {
        self.lookup(instance).is_some()
    }

    /// Find the handle for `instance` by reference identity.
    #[must_use]
    pub fn lookup(&self, instance: &Instance) -> Option<EntityHandle> {
        if let Some(tracker) = instance.tracker() {
            if let Some(link) = tracker.get() {
                if link.context_id == self.token.id() {
                    let handle = EntityHandle::decode(link.raw_handle);
                    if self.is_live(handle) {
                        return Some(handle);
                    }
                    return None;
                }
            }
        }
        self.by_ptr
            .get(&instance.ptr_key())
            .copied()
            .filter(|handle| self.is_live(*handle))
    }

    /// Register `instance` with `record`.
    ///
    /// Registering an already-present reference is a no-op apart from lock
    /// escalation, and returns the existing handle.
    ///
    /// # Errors
    ///
    /// Consistency error when the instance's tracker is owned by another
    /// still-open context and the mapped type is mutable. A link left
    /// behind by a closed context is superseded instead.
    pub fn register(&mut self, instance: &Instance, record: EntityRecord) -> Result<EntityHandle> {
        if let Some(handle) = self.lookup(instance) {
            let lock = record.lock_level();
            if let Some(existing) = self.record_mut(handle) {
                existing.escalate_lock(lock);
            }
            return Ok(handle);
        }

        let linkage = self.claimable_linkage(instance, &record)?;
        let handle = self.allocate(instance.clone(), record);
        match linkage {
            Linkage::Tracker => {
                if let Some(tracker) = instance.tracker() {
                    tracker.update(|slot| {
                        if slot
                            .as_ref()
                            .is_some_and(|link| link.context_id != self.token.id())
                        {
                            tracing::debug!(
                                context = self.token.id(),
                                "superseding tracker link left by a closed context"
                            );
                        }
                        *slot = Some(TrackerLink {
                            token: Arc::downgrade(&self.token),
                            context_id: self.token.id(),
                            raw_handle: handle.encode(),
                        });
                    });
                }
            }
            Linkage::SideMap => {
                self.by_ptr.insert(instance.ptr_key(), handle);
            }
        }
        Ok(handle)
    }

    fn claimable_linkage(&self, instance: &Instance, record: &EntityRecord) -> Result<Linkage> {
        let Some(tracker) = instance.tracker() else {
            return Ok(Linkage::SideMap);
        };
        match tracker.get() {
            Some(link) if link.context_id != self.token.id() && link.is_live() => {
                if record.descriptor().is_mutable() {
                    Err(Error::Consistency(
                        ConsistencyViolation::CrossContextRegistration {
                            entity: record.entity_name(),
                        },
                    ))
                } else {
                    // Immutable objects may be shared across open contexts;
                    // the foreign link stays untouched.
                    Ok(Linkage::SideMap)
                }
            }
            _ => Ok(Linkage::Tracker),
        }
    }

    fn allocate(&mut self, instance: Instance, record: EntityRecord) -> EntityHandle {
        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = slot.next_free.take();
                index
            }
            None => {
                let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                    next_free: None,
                });
                index
            }
        };
        let generation = self.slots[index as usize].generation;
        self.slots[index as usize].entry = Some(OccupiedSlot {
            instance,
            record,
            prev: self.tail,
            next: None,
        });
        if let Some(tail) = self.tail {
            if let Some(entry) = self.slots[tail as usize].entry.as_mut() {
                entry.next = Some(index);
            }
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
        self.len += 1;
        self.cached_snapshot = None;
        EntityHandle { index, generation }
    }

    /// Unregister `instance`, returning its record.
    pub fn unregister(&mut self, instance: &Instance) -> Option<EntityRecord> {
        let handle = self.lookup(instance)?;
        self.remove(handle)
    }

    /// Remove the record behind `handle`, relinking its neighbours.
    pub fn remove(&mut self, handle: EntityHandle) -> Option<EntityRecord> {
        if !self.is_live(handle) {
            return None;
        }
        let slot = &mut self.slots[handle.index as usize];
        let entry = slot.entry.take()?;
        // Recycled slots get a new generation so stale handles die.
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(handle.index);

        match entry.prev {
            Some(prev) => {
                if let Some(prev_entry) = self.slots[prev as usize].entry.as_mut() {
                    prev_entry.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(next_entry) = self.slots[next as usize].entry.as_mut() {
                    next_entry.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }

        self.by_ptr.remove(&entry.instance.ptr_key());
        if let Some(tracker) = entry.instance.tracker() {
            tracker.clear_for(self.token.id());
        }
        self.len -= 1;
        self.cached_snapshot = None;
        Some(entry.record)
    }

    /// The record behind `handle`, if still live.
    #[must_use]
    pub fn record(&self, handle: EntityHandle) -> Option<&EntityRecord> {
        self.slot_entry(handle).map(|entry| &entry.record)
    }

    /// Mutable access to the record behind `handle`.
    #[must_use]
    pub fn record_mut(&mut self, handle: EntityHandle) -> Option<&mut EntityRecord> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.index as usize]
            .entry
            .as_mut()
            .map(|entry| &mut entry.record)
    }

    /// The instance behind `handle`, if still live.
    #[must_use]
    pub fn instance(&self, handle: EntityHandle) -> Option<&Instance> {
        self.slot_entry(handle).map(|entry| &entry.instance)
    }

    /// Stable view of all registered (instance, handle) pairs in
    /// registration order.
    ///
    /// The view is cached until the next register or unregister, and a
    /// handed-out copy stays valid across later mutations; resolve each
    /// handle through [`Self::record`] to see whether it survived.
    pub fn snapshot(&mut self) -> Arc<[(Instance, EntityHandle)]> {
        if let Some(cached) = &self.cached_snapshot {
            return Arc::clone(cached);
        }
        let mut pairs = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &self.slots[index as usize];
            if let Some(entry) = &slot.entry {
                pairs.push((
                    entry.instance.clone(),
                    EntityHandle {
                        index,
                        generation: slot.generation,
                    },
                ));
                cursor = entry.next;
            } else {
                break;
            }
        }
        let snapshot: Arc<[(Instance, EntityHandle)]> = pairs.into();
        self.cached_snapshot = Some(Arc::clone(&snapshot));
        snapshot
    }

    /// Drop every record and detach all back-references this registry owns.
    pub fn clear(&mut self) {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let slot = &mut self.slots[index as usize];
            let Some(entry) = slot.entry.take() else {
                break;
            };
            slot.generation = slot.generation.wrapping_add(1);
            if let Some(tracker) = entry.instance.tracker() {
                tracker.clear_for(self.token.id());
            }
            cursor = entry.next;
        }
        // Rebuild the freelist over every slot, preserving generations.
        self.free_head = None;
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            slot.next_free = self.free_head;
            self.free_head = Some(index as u32);
        }
        self.head = None;
        self.tail = None;
        self.by_ptr.clear();
        self.len = 0;
        self.cached_snapshot = None;
    }

    fn is_live(&self, handle: EntityHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .is_some_and(|slot| slot.generation == handle.generation && slot.entry.is_some())
    }

    fn slot_entry(&self, handle: EntityHandle) -> Option<&OccupiedSlot> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.index as usize].entry.as_ref()
    }
}
