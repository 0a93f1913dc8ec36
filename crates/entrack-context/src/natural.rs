//! Natural-key cross-references.
//!
//! # Role
//!
//! A unit-of-work keeps, per mapped type, a two-way mapping between
//! surrogate identifiers and natural-key values so lookups by business
//! key can skip storage. The maps are keyed by a discriminant-tagged hash
//! of the values with the full values stored alongside and verified on
//! every hit. Re-caching a changed key drops the stale reverse mapping;
//! a transient "invalid key" stash rejects reverse lookups during the
//! window between detecting a changed key and the next flush.
//!
//! # Shared cache
//!
//! [`NaturalKeySync`] forwards resolutions to the cross-unit-of-work
//! cache. Every mutation is bracketed so a losing writer cannot clobber a
//! fresher entry: updates take a soft lock immediately and write plus
//! unlock from the post-transaction queue, inserts and evictions publish
//! immediately and finalize after commit. Rolled-back work never reaches
//! the shared cache beyond its lock.

use std::collections::HashMap;
use std::sync::Arc;

use entrack_core::descriptor::EntityDescriptor;
use entrack_core::error::{Error, Result, UsageViolation};
use entrack_core::gateway::SharedNaturalKeyCache;
use entrack_core::state::AttributeValue;
use entrack_core::value::{Value, hash_values};

use crate::events::TransactionQueue;

/// How a resolution came to be; decides how the shared cache is told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    /// Observed while loading an existing row.
    Load,
    /// Created by an insert in this unit-of-work.
    Insert,
    /// Changed by an update in this unit-of-work.
    Update,
}

#[derive(Debug, Default)]
struct EntityResolutions {
    by_id: HashMap<u64, (Value, Vec<Value>)>,
    by_key: HashMap<u64, (Vec<Value>, Value)>,
    invalid: Vec<Vec<Value>>,
}

fn id_hash(id: &Value) -> u64 {
    hash_values(std::slice::from_ref(id))
}

/// Per-unit-of-work bidirectional id/natural-key index.
#[derive(Debug, Default)]
pub struct NaturalKeyResolutions {
    by_entity: HashMap<&'static str, EntityResolutions>,
}

impl NaturalKeyResolutions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached resolutions across all mapped types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_entity.values().map(|slot| slot.by_id.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require_natural_key(descriptor: &'static dyn EntityDescriptor) -> Result<()> {
        if descriptor.natural_key().is_none() {
            return Err(Error::Usage(UsageViolation::NoNaturalKey {
                entity: descriptor.entity_name(),
            }));
        }
        Ok(())
    }

    /// Cache `id <-> key` locally. Returns whether anything changed.
    ///
    /// A re-cache under the same id removes the previous key's reverse
    /// mapping, so stale business-key lookups miss instead of resolving to
    /// the wrong row.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn cache_resolution(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        key: &[Value],
    ) -> Result<bool> {
        Self::require_natural_key(descriptor)?;
        let entity = descriptor.entity_name();
        let slot = self.by_entity.entry(entity).or_default();

        let stale = match slot.by_id.get(&id_hash(id)) {
            Some((cached_id, cached_key)) if cached_id == id => {
                if cached_key.as_slice() == key {
                    return Ok(false);
                }
                Some(cached_key.clone())
            }
            _ => None,
        };
        if let Some(stale) = stale {
            let stale_hash = hash_values(&stale);
            if slot
                .by_key
                .get(&stale_hash)
                .is_some_and(|(values, mapped)| *values == stale && mapped == id)
            {
                slot.by_key.remove(&stale_hash);
                tracing::trace!(entity, "removed stale natural-key reverse mapping");
            }
        }

        slot.by_id.insert(id_hash(id), (id.clone(), key.to_vec()));
        slot.by_key
            .insert(hash_values(key), (key.to_vec(), id.clone()));
        slot.invalid.retain(|stashed| stashed.as_slice() != key);
        Ok(true)
    }

    /// Cached surrogate id for `key`; keys stashed as invalid miss.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn find_cached_id(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        key: &[Value],
    ) -> Result<Option<Value>> {
        Self::require_natural_key(descriptor)?;
        let Some(slot) = self.by_entity.get(descriptor.entity_name()) else {
            return Ok(None);
        };
        if slot.invalid.iter().any(|k| k.as_slice() == key) {
            tracing::trace!(
                entity = descriptor.entity_name(),
                "natural key stashed as invalid, rejecting reverse lookup"
            );
            return Ok(None);
        }
        Ok(slot
            .by_key
            .get(&hash_values(key))
            .filter(|(values, _)| values.as_slice() == key)
            .map(|(_, id)| id.clone()))
    }

    /// Cached natural key for `id`.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn find_cached_key(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
    ) -> Result<Option<Vec<Value>>> {
        Self::require_natural_key(descriptor)?;
        Ok(self
            .by_entity
            .get(descriptor.entity_name())
            .and_then(|slot| slot.by_id.get(&id_hash(id)))
            .filter(|(cached_id, _)| cached_id == id)
            .map(|(_, key)| key.clone()))
    }

    /// Whether `key` is exactly what is cached for `id`.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn same_as_cached(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        key: &[Value],
    ) -> Result<bool> {
        Ok(self
            .find_cached_key(descriptor, id)?
            .is_some_and(|cached| cached.as_slice() == key))
    }

    /// Drop the resolution for `id`, returning the key that was cached.
    ///
    /// Both the passed key's and the previously cached key's reverse
    /// mappings are removed when they point at `id`.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn remove_resolution(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
        key: &[Value],
    ) -> Result<Option<Vec<Value>>> {
        Self::require_natural_key(descriptor)?;
        let Some(slot) = self.by_entity.get_mut(descriptor.entity_name()) else {
            return Ok(None);
        };

        let prior = match slot.by_id.get(&id_hash(id)) {
            Some((cached_id, cached_key)) if cached_id == id => Some(cached_key.clone()),
            _ => None,
        };
        if prior.is_some() {
            slot.by_id.remove(&id_hash(id));
        }

        let mut drop_reverse = |candidate: &[Value]| {
            let hash = hash_values(candidate);
            if slot
                .by_key
                .get(&hash)
                .is_some_and(|(values, mapped)| values.as_slice() == candidate && mapped == id)
            {
                slot.by_key.remove(&hash);
            }
        };
        drop_reverse(key);
        if let Some(prior_key) = &prior {
            if prior_key.as_slice() != key {
                drop_reverse(prior_key);
            }
        }
        Ok(prior)
    }

    /// Stash `key` as invalid until [`Self::unstash_all`].
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn stash_invalid(
        &mut self,
        descriptor: &'static dyn EntityDescriptor,
        key: &[Value],
    ) -> Result<()> {
        Self::require_natural_key(descriptor)?;
        let slot = self.by_entity.entry(descriptor.entity_name()).or_default();
        if !slot.invalid.iter().any(|k| k.as_slice() == key) {
            slot.invalid.push(key.to_vec());
        }
        Ok(())
    }

    /// Drop every invalid-key stash. Called when load synchronization for
    /// a flush has completed.
    pub fn unstash_all(&mut self) {
        for slot in self.by_entity.values_mut() {
            slot.invalid.clear();
        }
    }

    /// Every surrogate id with a cached resolution for `descriptor`.
    ///
    /// # Errors
    ///
    /// Usage error when the type declares no natural key.
    pub fn cached_pk_resolutions(
        &self,
        descriptor: &'static dyn EntityDescriptor,
    ) -> Result<Vec<Value>> {
        Self::require_natural_key(descriptor)?;
        Ok(self
            .by_entity
            .get(descriptor.entity_name())
            .map(|slot| slot.by_id.values().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }

    /// Drop everything, stashes included.
    pub fn clear(&mut self) {
        self.by_entity.clear();
    }
}

/// Pull the natural-key component values out of a read state vector.
///
/// Scalar components contribute their value; association components
/// contribute the target identifier when it is known without a fetch.
///
/// # Errors
///
/// Usage error when the type declares no natural key.
pub fn extract_natural_key(
    descriptor: &'static dyn EntityDescriptor,
    state: &[AttributeValue],
) -> Result<Vec<Value>> {
    let Some(indexes) = descriptor.natural_key() else {
        return Err(Error::Usage(UsageViolation::NoNaturalKey {
            entity: descriptor.entity_name(),
        }));
    };
    Ok(indexes
        .iter()
        .map(|&index| match state.get(index) {
            Some(AttributeValue::Scalar(value)) => value.clone(),
            Some(AttributeValue::Reference(reference)) => {
                reference.id().cloned().unwrap_or(Value::Null)
            }
            _ => Value::Null,
        })
        .collect())
}

/// Shared-cache coordination for natural-key resolutions.
pub struct NaturalKeySync {
    cache: Arc<dyn SharedNaturalKeyCache>,
}

impl NaturalKeySync {
    #[must_use]
    pub fn new(cache: Arc<dyn SharedNaturalKeyCache>) -> Self {
        Self { cache }
    }

    /// Publish a resolution to the shared cache.
    ///
    /// Loads publish immediately. Inserts publish immediately and finalize
    /// after commit. Updates take a soft lock immediately and perform the
    /// write plus unlock from the post-transaction queue.
    ///
    /// # Errors
    ///
    /// Cache failures from the immediate phase; queued work reports its
    /// failures through the queue's logging instead.
    pub fn publish(
        &self,
        queue: &mut TransactionQueue,
        entity: &'static str,
        id: &Value,
        key_values: &[Value],
        source: ResolutionSource,
    ) -> Result<()> {
        let key = self.cache.generate_key(entity, key_values);
        match source {
            ResolutionSource::Load => {
                self.cache.put_from_load(&key, id)?;
            }
            ResolutionSource::Insert => {
                self.cache.insert(&key, id)?;
                let cache = Arc::clone(&self.cache);
                let id = id.clone();
                queue.run_after_successful_commit(
                    "natural-key insert finalization",
                    Box::new(move || cache.insert(&key, &id).map(|_| ())),
                );
            }
            ResolutionSource::Update => {
                let lock = self.cache.lock_item(&key)?;
                let cache = Arc::clone(&self.cache);
                let id = id.clone();
                queue.run_after_successful_commit(
                    "natural-key update",
                    Box::new(move || {
                        let updated = cache.update(&key, &id);
                        let unlocked = cache.unlock_item(&key, lock);
                        updated?;
                        unlocked
                    }),
                );
            }
        }
        Ok(())
    }

    /// Evict a resolution from the shared cache now and finalize the
    /// removal after commit.
    ///
    /// # Errors
    ///
    /// Cache failures from the immediate eviction.
    pub fn evict(
        &self,
        queue: &mut TransactionQueue,
        entity: &'static str,
        key_values: &[Value],
    ) -> Result<()> {
        let key = self.cache.generate_key(entity, key_values);
        self.cache.remove(&key)?;
        let cache = Arc::clone(&self.cache);
        queue.run_after_successful_commit(
            "natural-key eviction",
            Box::new(move || cache.remove(&key)),
        );
        Ok(())
    }
}

impl std::fmt::Debug for NaturalKeySync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NaturalKeySync").finish_non_exhaustive()
    }
}
