//! Attribute state values.
//!
//! Descriptors hand the engine the current state of an instance as a
//! sequence of [`AttributeValue`]s: scalars stay opaque [`Value`]s,
//! to-one associations become [`EntityRef`]s, collections stay live
//! [`TrackedCollection`] handles, embedded values nest. Loaded-state
//! snapshots inside lifecycle records use the same shape, which is what
//! lets orphan detection compare "previous flush" against "now" without a
//! storage fetch.

use crate::collection::TrackedCollection;
use crate::instance::Instance;
use crate::value::Value;

/// A single-valued association reference.
///
/// Three observable shapes, mirroring how lazy to-one attributes behave:
/// known-null, unloaded (identifier known, target never fetched) and
/// resolved.
#[derive(Debug, Clone)]
pub struct EntityRef {
    target: Option<Instance>,
    id: Option<Value>,
    loaded: bool,
}

impl EntityRef {
    /// A reference known to be null.
    #[must_use]
    pub fn null() -> Self {
        Self {
            target: None,
            id: None,
            loaded: true,
        }
    }

    /// A lazy reference: the identifier is known, the target was never
    /// fetched.
    #[must_use]
    pub fn unloaded(id: Value) -> Self {
        Self {
            target: None,
            id: Some(id),
            loaded: false,
        }
    }

    /// A resolved reference.
    #[must_use]
    pub fn resolved(target: Instance) -> Self {
        Self {
            target: Some(target),
            id: None,
            loaded: true,
        }
    }

    /// A resolved reference whose identifier is also known.
    #[must_use]
    pub fn resolved_with_id(target: Instance, id: Value) -> Self {
        Self {
            target: Some(target),
            id: Some(id),
            loaded: true,
        }
    }

    /// Whether the target has been fetched (or is known null).
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether this reference is known to point nowhere.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.loaded && self.target.is_none()
    }

    /// The resolved target, when loaded.
    #[must_use]
    pub const fn target(&self) -> Option<&Instance> {
        self.target.as_ref()
    }

    /// The target's identifier, when known without a fetch.
    #[must_use]
    pub const fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// Best-effort same-target comparison.
    ///
    /// Resolved targets compare by reference identity; unresolved ones by
    /// identifier. When neither side carries enough to decide, the answer
    /// is "different", which errs toward re-examining the association.
    #[must_use]
    pub fn same_target(&self, other: &EntityRef) -> bool {
        match (&self.target, &other.target) {
            (Some(a), Some(b)) => a.same_as(b),
            _ => {
                if self.is_null() && other.is_null() {
                    true
                } else {
                    matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b)
                }
            }
        }
    }
}

/// Current value of one attribute, resolved.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Plain value.
    Scalar(Value),
    /// Single-valued association.
    Reference(EntityRef),
    /// Persistent collection handle.
    Collection(TrackedCollection),
    /// Embedded value with nested attribute values.
    Embedded(Vec<AttributeValue>),
}

impl AttributeValue {
    /// Shorthand for a NULL scalar.
    #[must_use]
    pub fn null() -> Self {
        AttributeValue::Scalar(Value::Null)
    }

    /// The reference payload, for association attributes.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            AttributeValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// The collection payload, for collection attributes.
    #[must_use]
    pub const fn as_collection(&self) -> Option<&TrackedCollection> {
        match self {
            AttributeValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// The scalar payload.
    #[must_use]
    pub const fn as_scalar(&self) -> Option<&Value> {
        match self {
            AttributeValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}
