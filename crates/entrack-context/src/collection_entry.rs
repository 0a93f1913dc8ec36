//! Per-collection tracking entries.
//!
//! # Role
//!
//! A [`CollectionEntry`] shadows one tracked collection: which role and
//! owner key it was loaded under, which it is referenced under now, the
//! element snapshot from the previous flush, and the schedule flags the
//! reachability sweep sets (update, remove, recreate).
//!
//! Loaded-side fields describe the database; current-side fields describe
//! the object graph as seen by the ongoing flush. The flush decides what
//! to do with a collection purely by comparing the two sides.

use serde::{Deserialize, Serialize};

use entrack_core::collection::TrackedCollection;
use entrack_core::descriptor::CollectionInfo;
use entrack_core::error::{ConsistencyViolation, Error, Result};
use entrack_core::instance::Instance;
use entrack_core::value::Value;

/// Owner key a collection hangs off.
///
/// Identifier generation that runs inside the insert itself hands out a
/// placeholder sequence number until the row exists. A placeholder on
/// either side makes a key comparison report "unchanged", so a collection
/// is never recreated just because its owner's identifier is still
/// pending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollectionKey {
    /// Real owner identifier.
    Assigned(Value),
    /// Placeholder for an identifier still being generated.
    Delayed(u64),
}

impl CollectionKey {
    /// Whether this is a pending-identifier placeholder.
    #[must_use]
    pub const fn is_delayed(&self) -> bool {
        matches!(self, CollectionKey::Delayed(_))
    }

    /// Key comparison for owner-change detection.
    #[must_use]
    pub fn matches(&self, other: &CollectionKey) -> bool {
        match (self, other) {
            (CollectionKey::Delayed(_), _) | (_, CollectionKey::Delayed(_)) => true,
            (CollectionKey::Assigned(a), CollectionKey::Assigned(b)) => a == b,
        }
    }
}

/// Lifecycle record for one tracked collection.
#[derive(Debug)]
pub struct CollectionEntry {
    snapshot: Option<Vec<Instance>>,
    loaded_role: Option<&'static CollectionInfo>,
    loaded_key: Option<CollectionKey>,
    current_role: Option<&'static CollectionInfo>,
    current_key: Option<CollectionKey>,
    reached: bool,
    processed: bool,
    do_update: bool,
    do_remove: bool,
    do_recreate: bool,
    ignore: bool,
}

impl CollectionEntry {
    /// Entry for a collection instantiated by application code and not yet
    /// persisted anywhere.
    #[must_use]
    pub fn brand_new() -> Self {
        Self {
            snapshot: Some(Vec::new()),
            loaded_role: None,
            loaded_key: None,
            current_role: None,
            current_key: None,
            reached: false,
            processed: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
            ignore: false,
        }
    }

    /// Entry for a collection hydrated from storage, with the element
    /// snapshot taken at load time.
    #[must_use]
    pub fn loaded(
        role: &'static CollectionInfo,
        key: CollectionKey,
        snapshot: Vec<Instance>,
    ) -> Self {
        Self {
            snapshot: Some(snapshot),
            loaded_role: Some(role),
            loaded_key: Some(key),
            current_role: None,
            current_key: None,
            reached: false,
            processed: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
            ignore: false,
        }
    }

    /// Entry for a lazy collection whose elements were never fetched.
    #[must_use]
    pub fn uninitialized(role: &'static CollectionInfo, key: CollectionKey) -> Self {
        Self {
            snapshot: None,
            loaded_role: Some(role),
            loaded_key: Some(key),
            current_role: None,
            current_key: None,
            reached: false,
            processed: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
            ignore: false,
        }
    }

    // ==================== accessors ====================

    /// Role the collection was loaded under.
    #[must_use]
    pub const fn loaded_role(&self) -> Option<&'static CollectionInfo> {
        self.loaded_role
    }

    /// Owner key the collection was loaded under.
    #[must_use]
    pub const fn loaded_key(&self) -> Option<&CollectionKey> {
        self.loaded_key.as_ref()
    }

    /// Role the ongoing flush reached the collection under.
    #[must_use]
    pub const fn current_role(&self) -> Option<&'static CollectionInfo> {
        self.current_role
    }

    /// Owner key the ongoing flush reached the collection under.
    #[must_use]
    pub const fn current_key(&self) -> Option<&CollectionKey> {
        self.current_key.as_ref()
    }

    /// Element snapshot from the previous flush, when the collection was
    /// initialized.
    #[must_use]
    pub fn snapshot(&self) -> Option<&[Instance]> {
        self.snapshot.as_deref()
    }

    /// Best available role name for diagnostics.
    #[must_use]
    pub fn role_name(&self) -> &'static str {
        self.loaded_role
            .or(self.current_role)
            .map_or("<unattached>", |role| role.role)
    }

    #[must_use]
    pub const fn is_reached(&self) -> bool {
        self.reached
    }

    #[must_use]
    pub const fn is_processed(&self) -> bool {
        self.processed
    }

    #[must_use]
    pub const fn is_update_scheduled(&self) -> bool {
        self.do_update
    }

    #[must_use]
    pub const fn is_removal_scheduled(&self) -> bool {
        self.do_remove
    }

    #[must_use]
    pub const fn is_recreate_scheduled(&self) -> bool {
        self.do_recreate
    }

    #[must_use]
    pub const fn is_ignored(&self) -> bool {
        self.ignore
    }

    /// Skip this entry for the rest of the flush.
    pub fn set_ignore(&mut self, ignore: bool) {
        self.ignore = ignore;
    }

    // ==================== flush protocol ====================

    /// Reset schedule flags and refresh the collection's dirtiness before
    /// the reachability walk.
    ///
    /// A collection whose elements no longer match the snapshot is marked
    /// modified even when nobody touched it through the tracked API.
    pub fn pre_flush(&mut self, collection: &TrackedCollection) {
        if self.loaded_key.is_none() {
            if let Some(key) = collection.key() {
                self.loaded_key = Some(CollectionKey::Assigned(key));
            }
        }
        if !collection.was_directly_modified() && !self.snapshot_agrees_with(collection) {
            collection.mark_modified();
        }
        self.reached = false;
        self.processed = false;
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
    }

    /// Mark the entry reached under `role` with owner key `key`.
    ///
    /// # Errors
    ///
    /// Consistency error when the flush already reached this collection
    /// through another owner.
    pub fn mark_reached(
        &mut self,
        role: &'static CollectionInfo,
        key: Option<CollectionKey>,
    ) -> Result<()> {
        if self.reached {
            return Err(Error::Consistency(
                ConsistencyViolation::SharedCollectionReference {
                    role: role.role,
                },
            ));
        }
        self.reached = true;
        self.current_role = Some(role);
        self.current_key = key;
        Ok(())
    }

    /// Mark the entry reached without touching the current side; the sweep
    /// over unvisited entries uses this after deciding the current side
    /// itself.
    ///
    /// # Errors
    ///
    /// Consistency error when already reached.
    pub fn note_reached(&mut self) -> Result<()> {
        if self.reached {
            return Err(Error::Consistency(
                ConsistencyViolation::SharedCollectionReference {
                    role: self.role_name(),
                },
            ));
        }
        self.reached = true;
        Ok(())
    }

    /// Pull the loaded side over to the current side; used for entries the
    /// reachability walk never visited.
    pub fn carry_loaded_forward(&mut self) {
        self.current_role = self.loaded_role;
        self.current_key = self.loaded_key.clone();
    }

    /// Drop the current side; the collection is no longer referenced.
    pub fn dereference(&mut self) {
        self.current_role = None;
        self.current_key = None;
    }

    /// Claim this entry for schedule computation.
    ///
    /// # Errors
    ///
    /// Consistency error when the flush already processed it.
    pub fn mark_processed(&mut self) -> Result<()> {
        if self.processed {
            return Err(Error::Consistency(
                ConsistencyViolation::DuplicateCollectionProcess {
                    role: self.role_name(),
                },
            ));
        }
        self.processed = true;
        Ok(())
    }

    /// Whether the owner role or key differs between loaded and current.
    #[must_use]
    pub fn owner_changed(&self) -> bool {
        if self.loaded_role != self.current_role {
            return true;
        }
        match (&self.loaded_key, &self.current_key) {
            (Some(loaded), Some(current)) => !loaded.matches(current),
            (None, None) => false,
            _ => true,
        }
    }

    pub fn schedule_update(&mut self) {
        self.do_update = true;
    }

    pub fn schedule_removal(&mut self) {
        self.do_remove = true;
    }

    pub fn schedule_recreate(&mut self) {
        self.do_recreate = true;
    }

    /// Whether the entry's collection changed content against its snapshot
    /// or was modified through the tracked API.
    #[must_use]
    pub fn is_dirty(&self, collection: &TrackedCollection) -> bool {
        collection.was_directly_modified() || !self.snapshot_agrees_with(collection)
    }

    /// Elements present in the previous-flush snapshot but no longer in
    /// the collection, in snapshot order.
    #[must_use]
    pub fn orphans(&self, collection: &TrackedCollection) -> Vec<Instance> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        if !collection.is_initialized() {
            return Vec::new();
        }
        let current = collection.elements();
        snapshot
            .iter()
            .filter(|previous| !current.iter().any(|now| now.same_as(previous)))
            .cloned()
            .collect()
    }

    /// Refresh the snapshot after a lazy initialization completed.
    pub fn post_initialize(&mut self, collection: &TrackedCollection) {
        self.snapshot = Some(collection.elements());
    }

    /// Verify the entry took part in the flush that just ended.
    ///
    /// # Errors
    ///
    /// Consistency error when a non-ignored entry was never processed.
    pub fn post_flush(&mut self) -> Result<()> {
        if self.ignore {
            self.ignore = false;
            return Ok(());
        }
        if !self.processed {
            return Err(Error::Consistency(
                ConsistencyViolation::UnprocessedCollection {
                    role: self.role_name(),
                },
            ));
        }
        Ok(())
    }

    /// Fold the flush outcome back into the loaded side and re-snapshot.
    pub fn after_action(&mut self, collection: &TrackedCollection) {
        self.loaded_role = self.current_role;
        self.loaded_key = self.current_key.clone();
        let acted = self.do_update || self.do_remove || self.do_recreate;
        if acted && collection.is_initialized() {
            self.snapshot = Some(collection.elements());
        }
        collection.clear_modified();
        let _ = collection.take_queued_removals();
    }

    fn snapshot_agrees_with(&self, collection: &TrackedCollection) -> bool {
        let Some(snapshot) = &self.snapshot else {
            return true;
        };
        if !collection.is_initialized() {
            return true;
        }
        let current = collection.elements();
        if current.len() != snapshot.len() {
            return false;
        }
        current
            .iter()
            .zip(snapshot.iter())
            .all(|(now, then)| now.same_as(then))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    struct Item;

    static LINES: CollectionInfo = CollectionInfo::new("order.lines", "order");
    static TAGS: CollectionInfo = CollectionInfo::new("order.tags", "order");

    fn item() -> Instance {
        Instance::plain(Arc::new(Item))
    }

    fn assigned(id: i64) -> CollectionKey {
        CollectionKey::Assigned(Value::BigInt(id))
    }

    #[test]
    fn test_key_matching() {
        assert!(assigned(1).matches(&assigned(1)));
        assert!(!assigned(1).matches(&assigned(2)));
        assert!(CollectionKey::Delayed(1).matches(&assigned(2)));
        assert!(assigned(2).matches(&CollectionKey::Delayed(9)));
        assert!(CollectionKey::Delayed(1).matches(&CollectionKey::Delayed(2)));
    }

    #[test]
    fn test_reached_twice_is_fatal() {
        let mut entry = CollectionEntry::brand_new();
        entry.mark_reached(&LINES, Some(assigned(1))).unwrap();
        let err = entry.mark_reached(&LINES, Some(assigned(1))).unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyViolation::SharedCollectionReference { .. })
        ));
    }

    #[test]
    fn test_processed_twice_is_fatal() {
        let mut entry = CollectionEntry::brand_new();
        entry.mark_processed().unwrap();
        let err = entry.mark_processed().unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyViolation::DuplicateCollectionProcess { .. })
        ));
    }

    #[test]
    fn test_pre_flush_resets_schedule() {
        let collection = TrackedCollection::brand_new();
        let mut entry = CollectionEntry::brand_new();
        entry.mark_reached(&LINES, Some(assigned(1))).unwrap();
        entry.mark_processed().unwrap();
        entry.schedule_update();

        entry.pre_flush(&collection);
        assert!(!entry.is_reached());
        assert!(!entry.is_processed());
        assert!(!entry.is_update_scheduled());
    }

    #[test]
    fn test_pre_flush_detects_silent_content_drift() {
        let collection = TrackedCollection::brand_new();
        let kept = item();
        collection.add(kept.clone());
        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), vec![kept, item()]);

        assert!(!collection.was_directly_modified());
        entry.pre_flush(&collection);
        assert!(collection.was_directly_modified());
    }

    #[test]
    fn test_owner_changed_role_and_key() {
        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());

        entry.mark_reached(&LINES, Some(assigned(1))).unwrap();
        assert!(!entry.owner_changed());

        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());
        entry.mark_reached(&TAGS, Some(assigned(1))).unwrap();
        assert!(entry.owner_changed());

        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());
        entry.mark_reached(&LINES, Some(assigned(2))).unwrap();
        assert!(entry.owner_changed());
    }

    #[test]
    fn test_delayed_key_does_not_change_owner() {
        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());
        entry
            .mark_reached(&LINES, Some(CollectionKey::Delayed(42)))
            .unwrap();
        assert!(!entry.owner_changed());
    }

    #[test]
    fn test_carry_loaded_forward_and_dereference() {
        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());
        entry.carry_loaded_forward();
        assert_eq!(entry.current_role(), Some(&LINES));
        assert_eq!(entry.current_key(), Some(&assigned(1)));

        entry.dereference();
        assert!(entry.current_role().is_none());
        assert!(entry.current_key().is_none());
        assert!(entry.owner_changed());
    }

    #[test]
    fn test_orphans_by_identity() {
        let kept = item();
        let dropped = item();
        let collection = TrackedCollection::brand_new();
        collection.add(kept.clone());

        let entry = CollectionEntry::loaded(&LINES, assigned(1), vec![kept, dropped.clone()]);
        let orphans = entry.orphans(&collection);
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].same_as(&dropped));
    }

    #[test]
    fn test_post_flush_requires_processing() {
        let mut entry = CollectionEntry::brand_new();
        assert!(entry.post_flush().is_err());

        let mut entry = CollectionEntry::brand_new();
        entry.mark_processed().unwrap();
        assert!(entry.post_flush().is_ok());

        let mut entry = CollectionEntry::brand_new();
        entry.set_ignore(true);
        assert!(entry.post_flush().is_ok());
        assert!(!entry.is_ignored());
    }

    #[test]
    fn test_after_action_promotes_current_side() {
        let element = item();
        let collection = TrackedCollection::brand_new();
        collection.add(element);
        collection.mark_modified();

        let mut entry = CollectionEntry::loaded(&LINES, assigned(1), Vec::new());
        entry.mark_reached(&LINES, Some(assigned(2))).unwrap();
        entry.schedule_update();

        entry.after_action(&collection);
        assert_eq!(entry.loaded_key(), Some(&assigned(2)));
        assert_eq!(entry.loaded_role(), Some(&LINES));
        assert_eq!(entry.snapshot().map(<[Instance]>::len), Some(1));
        assert!(!collection.was_directly_modified());
    }

    #[test]
    fn test_uninitialized_entry_is_never_dirty() {
        let collection = TrackedCollection::loaded(&LINES, Value::BigInt(1));
        let entry = CollectionEntry::uninitialized(&LINES, assigned(1));
        assert!(!entry.is_dirty(&collection));
        assert!(entry.orphans(&collection).is_empty());
    }
}
