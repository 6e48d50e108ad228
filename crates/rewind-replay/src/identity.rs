//! Mapping between live object handles and stream-stable ids.

use std::collections::HashMap;

use indexmap::IndexMap;
use rewind_core::{ObjectDescriptor, ObjectHandle, PersistentId, SchemaRegistry};

use crate::error::ReplayError;
use crate::types::{IdentityFlags, IdentityRecord};

/// Outcome of [`IdentityCache::restore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Records re-added to the cache.
    pub restored: usize,
    /// Records skipped because of a schema mismatch with `ignore_if_missing`.
    pub skipped: Vec<PersistentId>,
}

/// Live table of [`IdentityRecord`]s for one session.
///
/// On the recording side records are created by [`intern`](Self::intern)
/// the first time an object is captured. On the playback side they are
/// inserted as spawn and bind packets arrive, and replaced wholesale by
/// [`restore`](Self::restore) when a checkpoint loads.
#[derive(Debug, Default)]
pub struct IdentityCache {
    records: IndexMap<PersistentId, IdentityRecord>,
    by_handle: HashMap<ObjectHandle, PersistentId>,
    next_dynamic: u64,
}

impl IdentityCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id for `handle`, creating a record on first sight.
    ///
    /// The boolean is `true` when a record was created or rebound.
    /// Objects with a pathname receive [`PersistentId::stable`]; all others
    /// receive the next dynamic id.
    pub fn intern(
        &mut self,
        handle: ObjectHandle,
        descriptor: &ObjectDescriptor,
        owner: Option<PersistentId>,
        schema_checksum: u32,
    ) -> (PersistentId, bool) {
        if let Some(&id) = self.by_handle.get(&handle) {
            return (id, false);
        }
        let id = match &descriptor.pathname {
            Some(path) => PersistentId::stable(path),
            None => {
                self.next_dynamic += 1;
                PersistentId::dynamic(self.next_dynamic)
            }
        };
        self.insert(IdentityRecord {
            id,
            owner,
            class: descriptor.class,
            pathname: descriptor.pathname.clone(),
            schema_checksum,
            flags: IdentityFlags {
                no_load: false,
                ignore_if_missing: descriptor.ignore_if_missing,
            },
            handle: Some(handle),
        });
        (id, true)
    }

    /// Insert or replace a record, keeping the handle index consistent.
    pub fn insert(&mut self, record: IdentityRecord) {
        if let Some(old) = self.records.get(&record.id).and_then(|r| r.handle) {
            self.by_handle.remove(&old);
        }
        if let Some(handle) = record.handle {
            if let Some(stale) = self.by_handle.insert(handle, record.id) {
                if stale != record.id {
                    if let Some(r) = self.records.get_mut(&stale) {
                        r.handle = None;
                    }
                }
            }
        }
        self.records.insert(record.id, record);
    }

    /// Attach a live handle to an existing record.
    ///
    /// Returns `false` if no record has this id.
    pub fn bind(&mut self, id: PersistentId, handle: ObjectHandle) -> bool {
        let Some(mut record) = self.records.get(&id).cloned() else {
            return false;
        };
        record.handle = Some(handle);
        self.insert(record);
        true
    }

    /// The live handle for `id`, if bound.
    pub fn resolve(&self, id: PersistentId) -> Option<ObjectHandle> {
        self.records.get(&id).and_then(|r| r.handle)
    }

    /// The id bound to `handle`.
    pub fn lookup(&self, handle: ObjectHandle) -> Option<PersistentId> {
        self.by_handle.get(&handle).copied()
    }

    /// Borrow a record.
    pub fn get(&self, id: PersistentId) -> Option<&IdentityRecord> {
        self.records.get(&id)
    }

    /// Remove a record by id.
    pub fn remove(&mut self, id: PersistentId) -> Option<IdentityRecord> {
        let record = self.records.shift_remove(&id)?;
        if let Some(handle) = record.handle {
            self.by_handle.remove(&handle);
        }
        Some(record)
    }

    /// Remove whatever record is bound to `handle`.
    pub fn remove_handle(&mut self, handle: ObjectHandle) -> Option<IdentityRecord> {
        let id = self.by_handle.get(&handle).copied()?;
        self.remove(id)
    }

    /// Records whose object still exists and whose naming is stable across
    /// sessions, with handles stripped.
    pub fn snapshot(&self, exists: impl Fn(ObjectHandle) -> bool) -> Vec<IdentityRecord> {
        self.records
            .values()
            .filter(|r| r.pathname.is_some() && r.handle.is_some_and(&exists))
            .map(|r| IdentityRecord {
                handle: None,
                ..r.clone()
            })
            .collect()
    }

    /// Replace the table with `records`.
    ///
    /// Every record is checked against `schemas` before anything changes: a
    /// record whose checksum disagrees with this build (or whose class is
    /// unknown) is skipped when `ignore_if_missing` is set, and otherwise
    /// fails the whole restore with [`ReplayError::SchemaMismatch`], leaving
    /// the cache untouched. Restored records are unbound; the caller
    /// resolves or re-creates their objects.
    pub fn restore(
        &mut self,
        records: &[IdentityRecord],
        schemas: &SchemaRegistry,
    ) -> Result<RestoreReport, ReplayError> {
        let mut report = RestoreReport::default();
        let mut accepted = Vec::with_capacity(records.len());
        for record in records {
            if schemas.checksum_of(record.class) == Some(record.schema_checksum) {
                accepted.push(record);
            } else if record.flags.ignore_if_missing {
                report.skipped.push(record.id);
            } else {
                return Err(ReplayError::SchemaMismatch {
                    id: record.id,
                    class: record.class,
                });
            }
        }
        self.clear();
        for record in accepted {
            self.insert(IdentityRecord {
                handle: None,
                ..record.clone()
            });
            report.restored += 1;
        }
        Ok(report)
    }

    /// Drop every record. Dynamic id allocation continues from where it was.
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_handle.clear();
    }

    /// Iterate records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_core::{ClassId, ClassSchema, FieldCodec, Transform};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with(ClassSchema::new(ClassId(1), "Door").with_field("open", FieldCodec::Bool))
            .with(ClassSchema::new(ClassId(2), "Pawn").with_field("health", FieldCodec::Int))
    }

    fn door(path: &str) -> ObjectDescriptor {
        ObjectDescriptor {
            pathname: Some(path.into()),
            ..ObjectDescriptor::dynamic(ClassId(1), Transform::default())
        }
    }

    #[test]
    fn intern_is_idempotent_per_handle() {
        let mut cache = IdentityCache::new();
        let pawn = ObjectDescriptor::dynamic(ClassId(2), Transform::default());
        let (a, new_a) = cache.intern(ObjectHandle(10), &pawn, None, 0);
        let (b, new_b) = cache.intern(ObjectHandle(10), &pawn, None, 0);
        let (c, _) = cache.intern(ObjectHandle(11), &pawn, None, 0);
        assert!(new_a && !new_b);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.resolve(a), Some(ObjectHandle(10)));
        assert_eq!(cache.lookup(ObjectHandle(11)), Some(c));
    }

    #[test]
    fn persistent_ids_are_session_independent() {
        let mut first = IdentityCache::new();
        let mut second = IdentityCache::new();
        let (a, _) = first.intern(ObjectHandle(1), &door("Arena.Door_1"), None, 0);
        let (b, _) = second.intern(ObjectHandle(99), &door("Arena.Door_1"), None, 0);
        assert_eq!(a, b);
        assert!(a.is_stable());
    }

    #[test]
    fn rebinding_a_handle_unbinds_the_previous_record() {
        let mut cache = IdentityCache::new();
        let (a, _) = cache.intern(ObjectHandle(1), &door("Arena.Door_1"), None, 0);
        let (b, _) = cache.intern(ObjectHandle(2), &door("Arena.Door_2"), None, 0);
        assert!(cache.bind(b, ObjectHandle(1)));
        assert_eq!(cache.resolve(a), None);
        assert_eq!(cache.resolve(b), Some(ObjectHandle(1)));
        assert_eq!(cache.lookup(ObjectHandle(2)), None);
    }

    #[test]
    fn snapshot_keeps_only_existing_stable_records() {
        let reg = registry();
        let mut cache = IdentityCache::new();
        let sum = reg.checksum_of(ClassId(1)).unwrap();
        let (live, _) = cache.intern(ObjectHandle(1), &door("Arena.Door_1"), None, sum);
        cache.intern(ObjectHandle(2), &door("Arena.Door_2"), None, sum);
        let pawn = ObjectDescriptor::dynamic(ClassId(2), Transform::default());
        cache.intern(ObjectHandle(3), &pawn, None, 0);

        let snap = cache.snapshot(|h| h != ObjectHandle(2));
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].id, live);
        assert_eq!(snap[0].handle, None);
    }

    #[test]
    fn restore_skips_or_rejects_mismatched_records() {
        let reg = registry();
        let good_sum = reg.checksum_of(ClassId(1)).unwrap();
        let record = |path: &str, sum: u32, ignore: bool| IdentityRecord {
            id: PersistentId::stable(path),
            owner: None,
            class: ClassId(1),
            pathname: Some(path.into()),
            schema_checksum: sum,
            flags: IdentityFlags {
                no_load: false,
                ignore_if_missing: ignore,
            },
            handle: None,
        };

        let mut cache = IdentityCache::new();
        cache.intern(ObjectHandle(5), &door("Arena.Old"), None, good_sum);

        let report = cache
            .restore(
                &[record("Arena.A", good_sum, false), record("Arena.B", 1, true)],
                &reg,
            )
            .unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(report.skipped, vec![PersistentId::stable("Arena.B")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.resolve(PersistentId::stable("Arena.A")), None);
        assert_eq!(cache.lookup(ObjectHandle(5)), None);

        let err = cache
            .restore(&[record("Arena.C", 1, false)], &reg)
            .unwrap_err();
        assert!(matches!(err, ReplayError::SchemaMismatch { .. }));
        // A failed restore leaves the previous table in place.
        assert!(cache.get(PersistentId::stable("Arena.A")).is_some());
    }
}
