//! Macro store: committed macros by id and by slot.
//!
//! Every mutation is applied to a copy of the catalog, persisted, and only
//! then swapped in, so a failed write leaves the in-memory state untouched.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::storage::{self, Index, IndexEntry};
use super::{Frame, Macro, MacroId, MacroStoreError, MacroSummary};
use crate::input::InputSnapshot;

type Result<T> = std::result::Result<T, MacroStoreError>;

/// An in-progress recording. Its id is reserved when recording begins.
#[derive(Debug)]
pub struct RecordingHandle {
    id: MacroId,
    started: Duration,
    created: DateTime<Utc>,
    frames: Vec<Frame>,
}

impl RecordingHandle {
    pub fn id(&self) -> MacroId {
        self.id
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn push(&mut self, snapshot: &InputSnapshot) {
        // Persisted at microsecond resolution
        let offset = snapshot.timestamp.saturating_sub(self.started).as_micros() as u64;
        let offset = Duration::from_micros(offset);
        // A re-ticked snapshot carries no new input
        if self.frames.last().is_some_and(|f| f.offset >= offset) {
            return;
        }
        self.frames.push(Frame::new(offset, *snapshot));
    }
}

#[derive(Debug, Clone)]
struct Catalog {
    macros: BTreeMap<MacroId, Arc<Macro>>,
    slots: Vec<Option<MacroId>>,
    next_id: u32,
}

impl Catalog {
    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot < self.slots.len() {
            Ok(())
        } else {
            Err(MacroStoreError::SlotOutOfRange {
                slot,
                count: self.slots.len(),
            })
        }
    }

    fn update(&mut self, id: MacroId, f: impl FnOnce(&mut Macro)) -> Result<()> {
        let entry = self.macros.get_mut(&id).ok_or(MacroStoreError::NotFound(id))?;
        let mut updated = Macro::clone(entry);
        f(&mut updated);
        *entry = Arc::new(updated);
        Ok(())
    }

    /// Bind `id` to `slot`, unbinding whatever held the slot and whatever
    /// slot `id` held before.
    fn bind(&mut self, slot: usize, id: MacroId) -> Result<()> {
        self.check_slot(slot)?;
        let previous = self.macros.get(&id).ok_or(MacroStoreError::NotFound(id))?.slot;
        if let Some(prev) = previous {
            self.slots[prev] = None;
        }
        if let Some(evicted) = self.slots[slot].replace(id) {
            if evicted != id {
                self.update(evicted, |m| m.slot = None)?;
            }
        }
        self.update(id, |m| m.slot = Some(slot))
    }

    fn to_index(&self) -> Index {
        Index {
            next_id: self.next_id,
            macros: self
                .macros
                .values()
                .map(|m| IndexEntry {
                    id: m.id,
                    name: m.name.clone(),
                    created: m.created,
                    slot: m.slot,
                    filename: storage::timeline_filename(m.id),
                    frame_count: m.frames.len() as u32,
                    duration_ms: m.duration().as_millis().min(u32::MAX as u128) as u32,
                })
                .collect(),
        }
    }
}

pub struct MacroStore {
    dir: PathBuf,
    catalog: Catalog,
}

impl MacroStore {
    /// Open (creating if needed) the store at `dir`. Unreadable timelines
    /// are skipped with a warning.
    pub fn open(dir: impl Into<PathBuf>, slot_count: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index = storage::load_index(&dir)?;

        let mut catalog = Catalog {
            macros: BTreeMap::new(),
            slots: vec![None; slot_count],
            next_id: index.next_id.max(1),
        };

        for entry in index.macros {
            catalog.next_id = catalog.next_id.max(entry.id.0 + 1);
            let frames = match storage::map_timeline(&dir.join(&entry.filename)) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!("[MACRO] Skipping macro {} ({}): {e}", entry.id, entry.filename);
                    continue;
                }
            };

            let slot = match entry.slot {
                Some(s) if s < slot_count && catalog.slots[s].is_none() => {
                    catalog.slots[s] = Some(entry.id);
                    Some(s)
                }
                Some(s) => {
                    warn!("[MACRO] Macro {} loses slot {s}", entry.id);
                    None
                }
                None => None,
            };

            catalog.macros.insert(
                entry.id,
                Arc::new(Macro {
                    id: entry.id,
                    name: entry.name,
                    created: entry.created,
                    slot,
                    frames: frames.into(),
                }),
            );
        }

        info!("[MACRO] Loaded {} macros from {}", catalog.macros.len(), dir.display());
        Ok(Self { dir, catalog })
    }

    pub fn slot_count(&self) -> usize {
        self.catalog.slots.len()
    }

    /// Apply `f` to a copy of the catalog, persist the copy's index, then
    /// adopt it.
    fn transact<T>(&mut self, f: impl FnOnce(&mut Catalog) -> Result<T>) -> Result<T> {
        let mut next = self.catalog.clone();
        let out = f(&mut next)?;
        storage::save_index(&self.dir, &next.to_index())?;
        self.catalog = next;
        Ok(out)
    }

    pub fn begin_recording(&mut self, now: Duration) -> RecordingHandle {
        let id = MacroId(self.catalog.next_id);
        self.catalog.next_id += 1;
        info!("[MACRO] Recording started (macro {id})");
        RecordingHandle {
            id,
            started: now,
            created: Utc::now(),
            frames: Vec::new(),
        }
    }

    /// Append a snapshot; its offset is its timestamp minus the start time.
    pub fn append(&self, handle: &mut RecordingHandle, snapshot: &InputSnapshot) {
        handle.push(snapshot);
    }

    /// Persist the recording and bind it to `slot`. The handle is left
    /// intact, so a failed commit can be retried.
    pub fn commit(&mut self, handle: &RecordingHandle, slot: usize) -> Result<MacroId> {
        if handle.frames.is_empty() {
            warn!("[MACRO] Recording {} has no frames, discarding", handle.id);
            return Err(MacroStoreError::EmptyRecording);
        }
        self.catalog.check_slot(slot)?;

        let id = handle.id;
        let filename = storage::timeline_filename(id);
        storage::write_timeline(&self.dir, &filename, &handle.frames)?;

        let new_macro = Macro {
            id,
            name: handle.created.format("%Y-%m-%d %H:%M:%S").to_string(),
            created: handle.created,
            slot: None,
            frames: handle.frames.as_slice().into(),
        };
        let frame_count = new_macro.frames.len();
        let duration = new_macro.duration();

        let result = self.transact(|c| {
            c.next_id = c.next_id.max(id.0 + 1);
            c.macros.insert(id, Arc::new(new_macro));
            c.bind(slot, id)
        });
        if let Err(e) = result {
            let _ = fs::remove_file(self.dir.join(&filename));
            return Err(e);
        }

        info!(
            "[MACRO] Saved macro {id} to slot {slot} ({frame_count} frames, {}ms)",
            duration.as_millis()
        );
        Ok(id)
    }

    pub fn discard(&mut self, handle: RecordingHandle) {
        info!(
            "[MACRO] Recording {} discarded ({} frames)",
            handle.id,
            handle.frames.len()
        );
    }

    /// The persisted MAC3 record of a macro.
    pub fn export(&self, id: MacroId) -> Result<Vec<u8>> {
        Ok(storage::encode_timeline(&self.get(id)?.frames))
    }

    /// All macros, ordered by id.
    pub fn list(&self) -> Vec<MacroSummary> {
        self.catalog.macros.values().map(|m| m.summary()).collect()
    }

    pub fn get(&self, id: MacroId) -> Result<Arc<Macro>> {
        self.catalog
            .macros
            .get(&id)
            .cloned()
            .ok_or(MacroStoreError::NotFound(id))
    }

    pub fn macro_in_slot(&self, slot: usize) -> Option<Arc<Macro>> {
        let id = (*self.catalog.slots.get(slot)?)?;
        self.catalog.macros.get(&id).cloned()
    }

    pub fn rename(&mut self, id: MacroId, name: &str) -> Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(MacroStoreError::InvalidName);
        }
        self.transact(|c| c.update(id, |m| m.name = name))?;
        info!("[MACRO] Renamed macro {id}");
        Ok(())
    }

    pub fn bind_slot(&mut self, slot: usize, id: MacroId) -> Result<()> {
        self.transact(|c| c.bind(slot, id))?;
        info!("[MACRO] Bound macro {id} to slot {slot}");
        Ok(())
    }

    /// Delete a macro. `active` is the macro currently playing, if any.
    pub fn delete(&mut self, id: MacroId, active: Option<MacroId>) -> Result<()> {
        if active == Some(id) {
            return Err(MacroStoreError::InUse(id));
        }
        self.transact(|c| {
            let removed = c.macros.remove(&id).ok_or(MacroStoreError::NotFound(id))?;
            if let Some(slot) = removed.slot {
                c.slots[slot] = None;
            }
            Ok(())
        })?;

        let path = self.dir.join(storage::timeline_filename(id));
        if let Err(e) = fs::remove_file(&path) {
            warn!("[MACRO] Could not remove {}: {e}", path.display());
        }
        info!("[MACRO] Deleted macro {id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Button, Buttons};

    const SLOTS: usize = 4;

    fn record(store: &mut MacroStore, presses: &[(u64, Button)]) -> RecordingHandle {
        let start = Duration::from_secs(10);
        let mut h = store.begin_recording(start);
        for &(ms, btn) in presses {
            let mut s = InputSnapshot::neutral().at(start + Duration::from_millis(ms));
            s.buttons = btn.into();
            store.append(&mut h, &s);
        }
        h
    }

    fn committed(store: &mut MacroStore, slot: usize) -> MacroId {
        let h = record(store, &[(0, Button::A), (100, Button::B)]);
        store.commit(&h, slot).unwrap()
    }

    #[test]
    fn test_commit_binds_and_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let h = record(&mut store, &[(0, Button::A), (250, Button::B)]);
        let id = store.commit(&h, 2).unwrap();

        let m = store.macro_in_slot(2).unwrap();
        assert_eq!(m.id, id);
        assert_eq!(m.slot, Some(2));
        assert_eq!(m.frames[0].offset, Duration::ZERO);
        assert_eq!(m.frames[1].offset, Duration::from_millis(250));
        assert_eq!(m.frames[1].snapshot.buttons, Buttons::from(Button::B));
        assert!(dir.path().join("001.mac").exists());
    }

    #[test]
    fn test_empty_recording_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let h = store.begin_recording(Duration::ZERO);
        assert!(matches!(store.commit(&h, 0), Err(MacroStoreError::EmptyRecording)));
        assert!(store.list().is_empty());
        assert!(store.macro_in_slot(0).is_none());
    }

    #[test]
    fn test_ids_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let b = committed(&mut store, 1);
        store.delete(b, None).unwrap();
        let discarded = store.begin_recording(Duration::ZERO);
        let reserved = discarded.id();
        store.discard(discarded);
        let c = committed(&mut store, 1);
        assert!(a < b && b < reserved && reserved < c);

        // Survives a restart too
        drop(store);
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let d = committed(&mut store, 2);
        assert!(d > c);
    }

    #[test]
    fn test_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let b = committed(&mut store, 3);
        store.rename(a, "  combo breaker ").unwrap();

        let reloaded = MacroStore::open(dir.path(), SLOTS).unwrap();
        assert_eq!(reloaded.list(), store.list());
        assert_eq!(reloaded.get(a).unwrap().name, "combo breaker");
        assert_eq!(reloaded.macro_in_slot(3).unwrap().id, b);
        assert_eq!(reloaded.get(b).unwrap().frames, store.get(b).unwrap().frames);
    }

    #[test]
    fn test_rebinding_never_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let b = committed(&mut store, 1);

        // b takes slot 0, a is unbound, slot 1 is emptied
        store.bind_slot(0, b).unwrap();
        assert_eq!(store.macro_in_slot(0).unwrap().id, b);
        assert!(store.macro_in_slot(1).is_none());
        assert_eq!(store.get(a).unwrap().slot, None);
        assert_eq!(store.list().len(), 2);

        // One macro per slot, one slot per macro
        let bound: Vec<_> = store.list().into_iter().filter_map(|m| m.slot).collect();
        assert_eq!(bound, vec![0]);
    }

    #[test]
    fn test_slot_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        assert!(matches!(
            store.bind_slot(SLOTS, a),
            Err(MacroStoreError::SlotOutOfRange { slot: SLOTS, count: SLOTS })
        ));
        let h = record(&mut store, &[(0, Button::X)]);
        assert!(matches!(
            store.commit(&h, 99),
            Err(MacroStoreError::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_delete_in_use_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        assert!(matches!(store.delete(a, Some(a)), Err(MacroStoreError::InUse(_))));
        assert!(store.get(a).is_ok());

        store.delete(a, None).unwrap();
        assert!(store.macro_in_slot(0).is_none());
        assert!(!dir.path().join(storage::timeline_filename(a)).exists());
        assert!(matches!(store.delete(a, None), Err(MacroStoreError::NotFound(_))));
        assert!(matches!(store.rename(a, "x"), Err(MacroStoreError::NotFound(_))));
    }

    #[test]
    fn test_failed_persistence_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macros");
        let mut store = MacroStore::open(&path, SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let before = store.list();

        // Replace the directory with a file so every write fails
        fs::remove_dir_all(&path).unwrap();
        fs::write(&path, b"").unwrap();

        assert!(matches!(store.rename(a, "new"), Err(MacroStoreError::Persistence(_))));
        assert!(matches!(store.bind_slot(1, a), Err(MacroStoreError::Persistence(_))));
        assert!(matches!(store.delete(a, None), Err(MacroStoreError::Persistence(_))));
        let h = record(&mut store, &[(0, Button::Y)]);
        assert!(matches!(store.commit(&h, 1), Err(MacroStoreError::Persistence(_))));

        assert_eq!(store.list(), before);
        assert!(store.macro_in_slot(1).is_none());

        // The recording survives and commits once the directory is back
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();
        assert_eq!(store.commit(&h, 1).unwrap(), h.id());
        assert_eq!(store.macro_in_slot(1).unwrap().frames.len(), 1);
    }

    #[test]
    fn test_corrupt_timeline_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let b = committed(&mut store, 1);
        fs::write(dir.path().join(storage::timeline_filename(a)), b"garbage").unwrap();

        let reloaded = MacroStore::open(dir.path(), SLOTS).unwrap();
        assert!(reloaded.get(a).is_err());
        assert_eq!(reloaded.get(b).unwrap().slot, Some(1));
    }

    #[test]
    fn test_export_is_persisted_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let exported = store.export(a).unwrap();
        assert_eq!(exported, fs::read(dir.path().join(storage::timeline_filename(a))).unwrap());
        assert_eq!(storage::decode_timeline(&exported).unwrap(), *store.get(a).unwrap().frames);

        store.delete(a, None).unwrap();
        assert!(matches!(store.export(a), Err(MacroStoreError::NotFound(_))));
    }

    #[test]
    fn test_blank_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let before = store.get(a).unwrap().name.clone();
        assert!(matches!(store.rename(a, ""), Err(MacroStoreError::InvalidName)));
        assert!(matches!(store.rename(a, " \t "), Err(MacroStoreError::InvalidName)));
        assert_eq!(store.get(a).unwrap().name, before);
    }

    #[test]
    fn test_repeated_timestamp_not_recorded_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let start = Duration::from_secs(1);
        let mut h = store.begin_recording(start);
        let mut s = InputSnapshot::neutral().at(start);
        s.buttons = Button::A.into();
        store.append(&mut h, &s);
        store.append(&mut h, &s);
        store.append(&mut h, &s.at(start + Duration::from_millis(8)));
        assert_eq!(h.frame_count(), 2);
    }

    #[test]
    fn test_default_name_is_creation_time() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MacroStore::open(dir.path(), SLOTS).unwrap();
        let a = committed(&mut store, 0);
        let m = store.get(a).unwrap();
        assert_eq!(m.name, m.created.format("%Y-%m-%d %H:%M:%S").to_string());
    }
}
