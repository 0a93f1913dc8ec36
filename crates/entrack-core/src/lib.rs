//! Core types and contracts for the entrack engine.
//!
//! This crate provides everything the persistence-context engine consumes
//! without owning:
//!
//! - `Value` / `EntityKey` for opaque identifiers and snapshots
//! - `EntityDescriptor` and the attribute/cascade/collection metadata model
//! - `Instance` type-erased identity handles and the back-reference slot
//! - `TrackedCollection` persistent-collection handles
//! - Collaborator traits: storage gateway, shared natural-key cache,
//!   interceptor, passivation codec

pub mod collection;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod instance;
pub mod state;
pub mod value;

pub use collection::{CollectionId, TrackedCollection};
pub use descriptor::{
    AttributeInfo, AttributeKind, CascadeKind, CascadePoint, CascadeStyle, CollectionInfo,
    EntityDescriptor, ForeignKeyDirection, OrphanTiming,
};
pub use error::{
    CacheFailure, ConsistencyViolation, Error, Result, StorageFailure, UsageViolation,
};
pub use gateway::{
    DefaultInterceptor, DescriptorResolver, InstanceCodec, Interceptor, SharedKey,
    SharedNaturalKeyCache, SoftLock, StorageGateway,
};
pub use instance::{BackRefSlot, ContextToken, Instance, TrackerLink};
pub use state::{AttributeValue, EntityRef};
pub use value::{EntityKey, Value, hash_values};
