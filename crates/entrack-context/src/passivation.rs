//! Passivation images.
//!
//! # Role
//!
//! A unit-of-work can be written out between transactions and rebuilt
//! later, as app servers do with idle sessions. The image is explicit
//! about its length: an entry count followed by exactly that many entries,
//! validated on read. Domain objects travel through the caller's
//! [`InstanceCodec`]; descriptors travel by name and are resolved back
//! through a [`DescriptorResolver`].
//!
//! Loaded-state and deleted-state snapshots are not part of the image. A
//! rebuilt record re-snapshots from storage the next time a flush needs
//! the comparison, which is both smaller on the wire and safer after the
//! database moved underneath the sleeping session.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use entrack_core::error::{Error, Result};
use entrack_core::gateway::{DescriptorResolver, InstanceCodec, Interceptor, StorageGateway};
use entrack_core::value::Value;

use crate::context::PersistenceContext;
use crate::record::{EntityRecord, LockLevel, RecordKind, Status};

/// Snapshot of one record, minus the parts that never survive
/// passivation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordImage {
    /// Lifecycle status at passivation time.
    pub status: Status,
    /// Status immediately before the current one.
    pub previous_status: Option<Status>,
    /// Surrogate identifier, when assigned.
    pub id: Option<Value>,
    /// Version value, for versioned types.
    pub version: Option<Value>,
    /// Lock level held.
    pub lock: LockLevel,
    /// Whether a row was known to exist.
    pub exists_in_database: bool,
    /// Physical row locator, when the dialect provides one.
    pub row_id: Option<Value>,
}

/// One tracked object in the image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryImage {
    /// Whether the live object carried a back-reference tracker.
    pub carries_back_ref: bool,
    /// Mapped-type name, resolved back to a descriptor on read.
    pub entity: String,
    /// Codec payload for the object itself.
    pub instance: serde_json::Value,
    /// Which rebuild path applies.
    pub kind: RecordKind,
    /// The record's surviving fields.
    pub record: RecordImage,
}

/// A passivated unit-of-work, entries in registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextImage {
    /// Number of entries that follow.
    pub count: usize,
    /// The entries themselves.
    pub entries: Vec<EntryImage>,
}

impl ContextImage {
    /// Encode the image as JSON bytes.
    ///
    /// # Errors
    ///
    /// Passivation error when encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Decode an image from JSON bytes, validating the entry count.
    ///
    /// # Errors
    ///
    /// Passivation errors for malformed JSON and for a count that does not
    /// match the entries actually present.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image: ContextImage = serde_json::from_slice(bytes)?;
        image.validate()?;
        Ok(image)
    }

    fn validate(&self) -> Result<()> {
        if self.count != self.entries.len() {
            return Err(Error::Passivation(format!(
                "image declares {} entries but carries {}",
                self.count,
                self.entries.len()
            )));
        }
        Ok(())
    }
}

impl PersistenceContext {
    /// Write every tracked object out as a [`ContextImage`].
    ///
    /// Collections, cached snapshots and natural-key resolutions stay
    /// behind; they are rebuilt lazily by the reactivated session's own
    /// loads and flushes.
    ///
    /// # Errors
    ///
    /// Passivation errors from the codec.
    pub fn passivate(&mut self, codec: &dyn InstanceCodec) -> Result<ContextImage> {
        let snapshot = self.registry.snapshot();
        let mut entries = Vec::with_capacity(snapshot.len());
        for (instance, handle) in snapshot.iter() {
            let Some(record) = self.registry.record(*handle) else {
                continue;
            };
            let descriptor = record.descriptor();
            entries.push(EntryImage {
                carries_back_ref: instance.tracker().is_some(),
                entity: descriptor.entity_name().to_string(),
                instance: codec.encode(descriptor, instance)?,
                kind: record.kind(),
                record: RecordImage {
                    status: record.status(),
                    previous_status: record.previous_status(),
                    id: record.id().cloned(),
                    version: record.version().cloned(),
                    lock: record.lock_level(),
                    exists_in_database: record.exists_in_database(),
                    row_id: record.row_id().cloned(),
                },
            });
        }
        tracing::debug!(entries = entries.len(), "passivated unit-of-work");
        Ok(ContextImage {
            count: entries.len(),
            entries,
        })
    }

    /// Rebuild a unit-of-work from `image`.
    ///
    /// Entries rebuild along their kind tag. A mutable-kind record comes
    /// back owned by the new context directly; an immutable-kind record is
    /// rebuilt detached and adopted once registration has made this
    /// context its owner.
    ///
    /// # Errors
    ///
    /// Passivation errors for an invalid image, an unresolvable entity
    /// name, or a codec failure; consistency errors from registration.
    pub fn reactivate(
        image: &ContextImage,
        resolver: &dyn DescriptorResolver,
        codec: &dyn InstanceCodec,
        gateway: Arc<dyn StorageGateway>,
        interceptor: Arc<dyn Interceptor>,
    ) -> Result<Self> {
        image.validate()?;
        let mut context = PersistenceContext::new(gateway, interceptor);
        for entry in &image.entries {
            let Some(descriptor) = resolver.resolve(&entry.entity) else {
                return Err(Error::Passivation(format!(
                    "no descriptor registered for entity '{}'",
                    entry.entity
                )));
            };
            let instance = codec.decode(descriptor, &entry.instance)?;
            let record = EntityRecord::reactivated(
                descriptor,
                entry.kind,
                entry.record.id.clone(),
                entry.record.status,
                entry.record.previous_status,
                entry.record.version.clone(),
                entry.record.lock,
                entry.record.exists_in_database,
                entry.record.row_id.clone(),
            );
            let handle = context.registry.register(&instance, record)?;
            match entry.kind {
                RecordKind::Mutable => {}
                RecordKind::Immutable => {
                    if let Some(record) = context.registry.record_mut(handle) {
                        record.mark_adopted();
                    }
                }
            }
        }
        tracing::debug!(entries = image.entries.len(), "reactivated unit-of-work");
        Ok(context)
    }
}
