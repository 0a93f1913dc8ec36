//! Persistence-context engine for entrack.
//!
//! `entrack-context` is the **unit-of-work layer**. One
//! [`PersistenceContext`] tracks every object a logical session touches and
//! answers the questions a flush has to ask: which reference is which row,
//! where each object stands in its lifecycle, which collections moved,
//! what cascades where, and which natural key resolves to which
//! identifier.
//!
//! # Role In The Architecture
//!
//! - **Identity registry**: one record per live reference, by allocation
//!   identity, never by attribute equality.
//! - **Lifecycle records**: the LOADING/MANAGED/READ_ONLY/SAVING/DELETED/
//!   GONE state machine plus last-persisted snapshots.
//! - **Reachability**: collection tracking entries and the four-phase
//!   flush protocol that turns graph changes into scheduled actions.
//! - **Cascades**: per-attribute action walks with orphan detection.
//! - **Natural keys**: local resolutions plus soft-locked coordination
//!   with a shared cross-session cache.
//! - **Passivation**: explicit length-prefixed images a sleeping session
//!   can be rebuilt from.
//!
//! # Design Philosophy
//!
//! - **The engine computes, collaborators act**: storage access and cache
//!   writes go through the narrow traits in `entrack-core`; nothing here
//!   owns a connection.
//! - **Single-threaded by contract**: only the shared natural-key cache is
//!   touched across sessions, always under soft-lock bracketing.
//! - **Soft misses are `None`, broken invariants are errors**: a missing
//!   entry is normal; a collection reached twice is fatal.

pub mod cascade;
pub mod collection_entry;
pub mod context;
pub mod events;
pub mod natural;
pub mod passivation;
pub mod reachability;
pub mod record;
pub mod registry;
pub mod transience;

pub use cascade::{CascadeOp, CascadePlan, CascadeWalk};
pub use collection_entry::{CollectionEntry, CollectionKey};
pub use context::{ContextConfig, PersistenceContext, TrackingCounts};
pub use events::{AfterCommitHook, TransactionQueue};
pub use natural::{NaturalKeyResolutions, NaturalKeySync, ResolutionSource, extract_natural_key};
pub use passivation::{ContextImage, EntryImage, RecordImage};
pub use reachability::{CollectionTable, visit_owner_collections};
pub use record::{DirtinessOverride, EntityRecord, LockLevel, RecordKind, Status};
pub use registry::{EntityHandle, IdentityRegistry};
pub use transience::{Nullifier, SnapshotCache, TransienceProbe};
