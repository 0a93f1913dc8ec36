//! Collaborator contracts.
//!
//! The engine is deliberately narrow about what it asks of the rest of a
//! persistence layer: a synchronous snapshot/element fetch, a shared
//! natural-key cache with soft-lock bracketing, an optional transience
//! interceptor, and a codec pair for passivation. Everything here is
//! assumed correct; failures surface as [`Error::Storage`] /
//! [`Error::Cache`] and are never retried by the engine.

use crate::descriptor::{CollectionInfo, EntityDescriptor};
use crate::error::Error;
use crate::instance::Instance;
use crate::value::{Value, hash_values};

/// Synchronous storage access used by the engine.
///
/// Both calls block; the engine performs no I/O of its own and never
/// retries. `entity_snapshot` returning `Ok(None)` means "no row".
pub trait StorageGateway {
    /// Fetch the current persisted attribute values for one row.
    fn entity_snapshot(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        id: &Value,
    ) -> Result<Option<Vec<Value>>, Error>;

    /// Fetch the elements of one collection. Used only by forced
    /// initialization.
    fn collection_elements(
        &self,
        role: &'static CollectionInfo,
        key: &Value,
    ) -> Result<Vec<Instance>, Error>;
}

/// Composed key for the shared natural-key cache.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedKey {
    /// Mapped-type name the key belongs to.
    pub entity: String,
    /// Discriminant-tagged hash of the key values.
    pub hash: u64,
    /// The natural-key component values.
    pub values: Vec<Value>,
}

/// Opaque token handed out by [`SharedNaturalKeyCache::lock_item`].
///
/// Losing writers surrender their token without writing; the token must be
/// returned through `unlock_item` exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SoftLock {
    token: u64,
}

impl SoftLock {
    /// Mint a token. Called by cache implementations only.
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self { token }
    }

    /// The raw token value.
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.token
    }
}

/// Shared (cross-unit-of-work) natural-key cache.
///
/// This is the one collaborator accessed by many units-of-work at once,
/// hence `Send + Sync` and the soft-lock discipline: every update is
/// bracketed by `lock_item` / `unlock_item` so a losing writer cannot
/// clobber a fresher entry.
pub trait SharedNaturalKeyCache: Send + Sync {
    /// Compose the cache key for an entity's natural-key values.
    fn generate_key(&self, entity: &str, values: &[Value]) -> SharedKey {
        SharedKey {
            entity: entity.to_string(),
            hash: hash_values(values),
            values: values.to_vec(),
        }
    }

    /// Look up the surrogate identifier cached under `key`.
    fn get(&self, key: &SharedKey) -> Result<Option<Value>, Error>;

    /// Publish a resolution observed while loading. Returns whether the
    /// cache stored it.
    fn put_from_load(&self, key: &SharedKey, id: &Value) -> Result<bool, Error>;

    /// Publish a resolution created by an insert.
    fn insert(&self, key: &SharedKey, id: &Value) -> Result<bool, Error>;

    /// Publish a resolution changed by an update.
    fn update(&self, key: &SharedKey, id: &Value) -> Result<bool, Error>;

    /// Evict the entry under `key`.
    fn remove(&self, key: &SharedKey) -> Result<(), Error>;

    /// Acquire a soft lock on `key`.
    fn lock_item(&self, key: &SharedKey) -> Result<SoftLock, Error>;

    /// Release a soft lock on `key`.
    fn unlock_item(&self, key: &SharedKey, lock: SoftLock) -> Result<(), Error>;
}

/// Pluggable transience interception hook.
///
/// The first collaborator consulted when classifying an object as
/// transient; `None` means no opinion and the chain continues.
pub trait Interceptor {
    /// Definite transience answer, or `None` to defer.
    fn is_transient(&self, instance: &Instance) -> Option<bool> {
        let _ = instance;
        None
    }
}

/// Interceptor that never has an opinion.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInterceptor;

impl Interceptor for DefaultInterceptor {}

/// Encodes/decodes domain objects for passivation images.
pub trait InstanceCodec {
    /// Encode one instance to a JSON payload.
    fn encode(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        instance: &Instance,
    ) -> Result<serde_json::Value, Error>;

    /// Rebuild an instance from a JSON payload.
    fn decode(
        &self,
        descriptor: &'static dyn EntityDescriptor,
        payload: &serde_json::Value,
    ) -> Result<Instance, Error>;
}

/// Resolves entity names back to descriptors during reactivation.
pub trait DescriptorResolver {
    /// The descriptor registered under `entity`, if any.
    fn resolve(&self, entity: &str) -> Option<&'static dyn EntityDescriptor>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCache;

    impl SharedNaturalKeyCache for NoopCache {
        fn get(&self, _key: &SharedKey) -> Result<Option<Value>, Error> {
            Ok(None)
        }

        fn put_from_load(&self, _key: &SharedKey, _id: &Value) -> Result<bool, Error> {
            Ok(false)
        }

        fn insert(&self, _key: &SharedKey, _id: &Value) -> Result<bool, Error> {
            Ok(false)
        }

        fn update(&self, _key: &SharedKey, _id: &Value) -> Result<bool, Error> {
            Ok(false)
        }

        fn remove(&self, _key: &SharedKey) -> Result<(), Error> {
            Ok(())
        }

        fn lock_item(&self, _key: &SharedKey) -> Result<SoftLock, Error> {
            Ok(SoftLock::new(1))
        }

        fn unlock_item(&self, _key: &SharedKey, _lock: SoftLock) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_generate_key_is_stable_and_tagged() {
        let cache = NoopCache;
        let a = cache.generate_key("user", &[Value::Text("k".into())]);
        let b = cache.generate_key("user", &[Value::Text("k".into())]);
        assert_eq!(a, b);
        assert_eq!(a.entity, "user");
        assert_eq!(a.values, vec![Value::Text("k".into())]);

        let c = cache.generate_key("user", &[Value::Text("other".into())]);
        assert_ne!(a.hash, c.hash);
    }

    #[test]
    fn test_default_interceptor_defers() {
        use std::sync::{Arc, RwLock};
        let inst = Instance::plain(Arc::new(RwLock::new(1u8)));
        assert!(DefaultInterceptor.is_transient(&inst).is_none());
    }
}
