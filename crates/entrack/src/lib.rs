//! entrack - per-session object identity, lifecycle and cascade tracking
//! for O/R persistence layers.
//!
//! An O/R layer built on entrack brings its own SQL, mapping and proxy
//! machinery; entrack supplies the bookkeeping underneath a unit-of-work:
//!
//! - Reference-identity registry with back-reference handles
//! - Lifecycle records and their state machine
//! - Collection reachability and the flush protocol
//! - Cascade walks with orphan detection
//! - Transience classification and reference nullification
//! - Natural-key resolution with a shared-cache protocol
//! - Passivation images for sleeping sessions
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use entrack::prelude::*;
//!
//! fn load_and_delete(
//!     gateway: Arc<dyn StorageGateway>,
//!     descriptor: &'static dyn EntityDescriptor,
//!     user: Instance,
//! ) -> Result<()> {
//!     let mut context =
//!         PersistenceContext::new(gateway, Arc::new(DefaultInterceptor));
//!
//!     // Hydration: LOADING until every attribute is in place.
//!     let handle = context.register_loading(
//!         &user,
//!         descriptor,
//!         Value::BigInt(1),
//!         descriptor.read_state(&user),
//!         None,
//!         LockLevel::Read,
//!     )?;
//!     context.finish_loading(handle)?;
//!
//!     // Later, the flush schedules and performs the delete.
//!     context.schedule_delete(handle)?;
//!     let record = context.after_delete(handle)?;
//!     assert_eq!(record.status(), Status::Gone);
//!
//!     context.after_transaction(true);
//!     Ok(())
//! }
//! ```

pub use entrack_core::collection::{CollectionId, TrackedCollection};
pub use entrack_core::descriptor::{
    AttributeInfo, AttributeKind, CascadeKind, CascadePoint, CascadeStyle, CollectionInfo,
    EntityDescriptor, ForeignKeyDirection, OrphanTiming,
};
pub use entrack_core::error::{
    CacheFailure, ConsistencyViolation, Error, Result, StorageFailure, UsageViolation,
};
pub use entrack_core::gateway::{
    DefaultInterceptor, DescriptorResolver, InstanceCodec, Interceptor, SharedKey,
    SharedNaturalKeyCache, SoftLock, StorageGateway,
};
pub use entrack_core::instance::{BackRefSlot, ContextToken, Instance, TrackerLink};
pub use entrack_core::state::{AttributeValue, EntityRef};
pub use entrack_core::value::{EntityKey, Value, hash_values};

pub use entrack_context::cascade::{CascadeOp, CascadePlan, CascadeWalk};
pub use entrack_context::collection_entry::{CollectionEntry, CollectionKey};
pub use entrack_context::context::{ContextConfig, PersistenceContext, TrackingCounts};
pub use entrack_context::events::{AfterCommitHook, TransactionQueue};
pub use entrack_context::natural::{
    NaturalKeyResolutions, NaturalKeySync, ResolutionSource, extract_natural_key,
};
pub use entrack_context::passivation::{ContextImage, EntryImage, RecordImage};
pub use entrack_context::reachability::{CollectionTable, visit_owner_collections};
pub use entrack_context::record::{
    DirtinessOverride, EntityRecord, LockLevel, RecordKind, Status,
};
pub use entrack_context::registry::{EntityHandle, IdentityRegistry};
pub use entrack_context::transience::{Nullifier, SnapshotCache, TransienceProbe};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entrack::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AttributeInfo,
        AttributeKind,
        AttributeValue,
        CascadeKind,
        CascadePoint,
        CascadeStyle,
        CollectionEntry,
        CollectionInfo,
        CollectionKey,
        ContextConfig,
        DefaultInterceptor,
        EntityDescriptor,
        EntityHandle,
        EntityKey,
        EntityRecord,
        EntityRef,
        Error,
        Instance,
        Interceptor,
        LockLevel,
        PersistenceContext,
        RecordKind,
        ResolutionSource,
        Result,
        SharedNaturalKeyCache,
        Status,
        StorageGateway,
        TrackedCollection,
        Value,
    };
}
