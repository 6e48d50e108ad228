//! Test utilities and mock simulation types for Rewind development.
//!
//! Provides a [`MockWorld`] implementing [`Simulation`], a
//! schema-driven [`MockObject`] implementing [`Capturable`], and a
//! [`ManualClock`] for deterministic budget and timeout tests.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rewind_core::{
    apply_delta, encode_delta, Capturable, CaptureMode, ClassId, ClassSchema, Clock, DeltaError,
    FieldId, FieldValue, ObjectDescriptor, ObjectHandle, ObjectState, ReactionMode,
    SchemaRegistry, Simulation, SimulationError, SpawnRequest, Transform,
};

// ── ManualClock ─────────────────────────────────────────────────

/// A [`Clock`] that only moves when told to.
///
/// Clones share the same reading, so a test can keep one copy and hand
/// another to the engine.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

// ── MockObject ──────────────────────────────────────────────────

/// A capturable object whose state is an [`ObjectState`] driven by its
/// class schema.
///
/// Counts captures and reaction callbacks so tests can assert on how the
/// engine drove it.
#[derive(Debug)]
pub struct MockObject {
    handle: ObjectHandle,
    schema: ClassSchema,
    pub descriptor: ObjectDescriptor,
    pub state: ObjectState,
    baseline: Option<ObjectState>,
    pub always_relevant: bool,
    pub preserved: bool,
    /// Field changes applied with deferred reactions and not yet flushed.
    pending_reactions: Vec<FieldId>,
    /// Reactions run, one per changed field.
    pub reactions: usize,
    /// Calls to `flush_reactions` that had something to flush.
    pub reaction_flushes: usize,
    /// Calls to `capture_delta`.
    pub captures: usize,
    capture_cost: Option<(ManualClock, Duration)>,
}

impl MockObject {
    pub fn new(handle: ObjectHandle, schema: ClassSchema, descriptor: ObjectDescriptor) -> Self {
        let state = schema.default_state();
        Self {
            handle,
            schema,
            descriptor,
            state,
            baseline: None,
            always_relevant: false,
            preserved: false,
            pending_reactions: Vec::new(),
            reactions: 0,
            reaction_flushes: 0,
            captures: 0,
            capture_cost: None,
        }
    }

    pub fn schema(&self) -> &ClassSchema {
        &self.schema
    }

    /// Read a field by name.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        let id = self.schema.field_by_name(field)?.id;
        self.state.get(id)
    }

    /// Write a field by name.
    ///
    /// # Panics
    ///
    /// Panics if the class has no such field.
    pub fn set(&mut self, field: &str, value: FieldValue) {
        let id = self
            .schema
            .field_by_name(field)
            .unwrap_or_else(|| panic!("{} has no field '{field}'", self.schema.name))
            .id;
        self.state.set(id, value);
    }

    /// Readable key for comparing worlds across sessions: the pathname,
    /// else `Class#tag` when the class has a text `tag` field, else
    /// `Class@handle`.
    pub fn key(&self) -> String {
        if let Some(path) = &self.descriptor.pathname {
            return path.clone();
        }
        match self.get("tag") {
            Some(FieldValue::Text(tag)) => format!("{}#{tag}", self.schema.name),
            _ => format!("{}@{}", self.schema.name, self.handle.0),
        }
    }

    /// Field values by name.
    pub fn named_state(&self) -> BTreeMap<String, FieldValue> {
        self.schema
            .fields
            .iter()
            .filter_map(|f| Some((f.name.clone(), self.state.get(f.id)?.clone())))
            .collect()
    }
}

impl Capturable for MockObject {
    fn handle(&self) -> ObjectHandle {
        self.handle
    }

    fn descriptor(&self) -> ObjectDescriptor {
        self.descriptor.clone()
    }

    fn capture_delta(&mut self, mode: CaptureMode) -> Result<Option<Vec<u8>>, DeltaError> {
        self.captures += 1;
        if let Some((clock, cost)) = &self.capture_cost {
            clock.advance(*cost);
        }
        let baseline = match mode {
            CaptureMode::Delta => self.baseline.as_ref(),
            CaptureMode::Full => None,
        };
        let bytes = encode_delta(&self.schema, baseline, &self.state)?;
        if bytes.is_some() {
            self.baseline = Some(self.state.clone());
        }
        Ok(bytes)
    }

    fn apply_delta(&mut self, bytes: &[u8], reactions: ReactionMode) -> Result<(), DeltaError> {
        let changed = apply_delta(&self.schema, &mut self.state, bytes)?;
        match reactions {
            ReactionMode::Immediate => self.reactions += changed.len(),
            ReactionMode::Deferred => self.pending_reactions.extend(changed),
        }
        Ok(())
    }

    fn flush_reactions(&mut self) {
        if self.pending_reactions.is_empty() {
            return;
        }
        self.reactions += self.pending_reactions.len();
        self.reaction_flushes += 1;
        self.pending_reactions.clear();
    }

    fn is_always_relevant(&self) -> bool {
        self.always_relevant
    }

    fn is_always_preserved_across_seek(&self) -> bool {
        self.preserved
    }
}

// ── MockWorld ───────────────────────────────────────────────────

/// A build-time object placed in a level.
#[derive(Clone, Debug)]
pub struct PlacedObject {
    pub pathname: String,
    pub class: ClassId,
    pub transform: Transform,
}

/// In-memory [`Simulation`] made of [`MockObject`]s.
#[derive(Debug)]
pub struct MockWorld {
    schemas: SchemaRegistry,
    levels: BTreeMap<String, Vec<PlacedObject>>,
    current: String,
    objects: BTreeMap<ObjectHandle, MockObject>,
    next_handle: u64,
    viewers: Vec<[f64; 3]>,
    capture_cost: Option<(ManualClock, Duration)>,
    pub aux_received: Vec<(ObjectHandle, Vec<u8>)>,
    pub streamed_levels: Vec<(String, String)>,
    pub sim_time: f64,
    pub spawned: usize,
    pub destroyed: usize,
    pub level_loads: usize,
}

impl MockWorld {
    pub fn new(schemas: SchemaRegistry) -> Self {
        Self {
            schemas,
            levels: BTreeMap::new(),
            current: String::new(),
            objects: BTreeMap::new(),
            next_handle: 0,
            viewers: Vec::new(),
            capture_cost: None,
            aux_received: Vec::new(),
            streamed_levels: Vec::new(),
            sim_time: 0.0,
            spawned: 0,
            destroyed: 0,
            level_loads: 0,
        }
    }

    /// Register a level and the persistent objects it places.
    pub fn with_level(mut self, name: &str, placed: &[(&str, ClassId)]) -> Self {
        let objects = placed
            .iter()
            .enumerate()
            .map(|(i, (path, class))| PlacedObject {
                pathname: (*path).to_string(),
                class: *class,
                transform: Transform::at([i as f64 * 10.0, 0.0, 0.0]),
            })
            .collect();
        self.levels.insert(name.to_string(), objects);
        self
    }

    /// Every capture from now on advances `clock` by `cost`.
    pub fn set_capture_cost(&mut self, clock: &ManualClock, cost: Duration) {
        self.capture_cost = Some((clock.clone(), cost));
        for obj in self.objects.values_mut() {
            obj.capture_cost = self.capture_cost.clone();
        }
    }

    pub fn set_viewers(&mut self, viewers: Vec<[f64; 3]>) {
        self.viewers = viewers;
    }

    /// Spawn a dynamic object at the origin.
    ///
    /// # Panics
    ///
    /// Panics if `class` is not registered.
    pub fn spawn_dynamic(&mut self, class: ClassId) -> ObjectHandle {
        self.spawn(SpawnRequest {
            class,
            pathname: None,
            transform: Transform::default(),
            owner: None,
        })
        .unwrap_or_else(|e| panic!("spawn failed: {e}"))
    }

    /// Spawn a dynamic object with a `tag` field set, so it is
    /// recognizable in [`world_state`](Self::world_state).
    pub fn spawn_tagged(&mut self, class: ClassId, tag: &str) -> ObjectHandle {
        let handle = self.spawn_dynamic(class);
        self.set(handle, "tag", FieldValue::Text(tag.to_string()));
        handle
    }

    /// # Panics
    ///
    /// Panics if the object does not exist.
    pub fn obj(&self, handle: ObjectHandle) -> &MockObject {
        self.objects
            .get(&handle)
            .unwrap_or_else(|| panic!("no object {}", handle.0))
    }

    /// # Panics
    ///
    /// Panics if the object does not exist.
    pub fn obj_mut(&mut self, handle: ObjectHandle) -> &mut MockObject {
        self.objects
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("no object {}", handle.0))
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    pub fn set(&mut self, handle: ObjectHandle, field: &str, value: FieldValue) {
        self.obj_mut(handle).set(field, value);
    }

    pub fn get(&self, handle: ObjectHandle, field: &str) -> Option<FieldValue> {
        self.objects.get(&handle)?.get(field).cloned()
    }

    /// Read a field of a persistent object by pathname.
    pub fn get_path(&self, pathname: &str, field: &str) -> Option<FieldValue> {
        let handle = self.find_persistent(pathname)?;
        self.get(handle, field)
    }

    /// Find a dynamic object by its `tag` field.
    pub fn find_tagged(&self, tag: &str) -> Option<ObjectHandle> {
        self.objects
            .values()
            .find(|o| matches!(o.get("tag"), Some(FieldValue::Text(t)) if t == tag))
            .map(|o| o.handle)
    }

    /// Every object's state, keyed by [`MockObject::key`].
    pub fn world_state(&self) -> BTreeMap<String, BTreeMap<String, FieldValue>> {
        self.objects
            .values()
            .map(|o| (o.key(), o.named_state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn insert(&mut self, descriptor: ObjectDescriptor) -> Result<ObjectHandle, SimulationError> {
        let schema = self
            .schemas
            .get(descriptor.class)
            .cloned()
            .ok_or(SimulationError::UnknownClass(descriptor.class))?;
        self.next_handle += 1;
        let handle = ObjectHandle(self.next_handle);
        let mut obj = MockObject::new(handle, schema, descriptor);
        obj.capture_cost = self.capture_cost.clone();
        self.objects.insert(handle, obj);
        self.spawned += 1;
        Ok(handle)
    }
}

impl Simulation for MockWorld {
    fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    fn current_level(&self) -> &str {
        &self.current
    }

    fn load_level(&mut self, name: &str) -> Result<(), SimulationError> {
        let placed = self
            .levels
            .get(name)
            .cloned()
            .ok_or_else(|| SimulationError::UnknownLevel(name.to_string()))?;
        let doomed: Vec<ObjectHandle> = self
            .objects
            .values()
            .filter(|o| !o.preserved)
            .map(|o| o.handle)
            .collect();
        for handle in doomed {
            self.destroy(handle);
        }
        for p in placed {
            self.insert(ObjectDescriptor {
                pathname: Some(p.pathname),
                ..ObjectDescriptor::dynamic(p.class, p.transform)
            })?;
        }
        self.current = name.to_string();
        self.level_loads += 1;
        Ok(())
    }

    fn spawn(&mut self, request: SpawnRequest) -> Result<ObjectHandle, SimulationError> {
        self.insert(ObjectDescriptor {
            pathname: request.pathname,
            owner: request.owner,
            ..ObjectDescriptor::dynamic(request.class, request.transform)
        })
    }

    fn destroy(&mut self, handle: ObjectHandle) -> bool {
        let removed = self.objects.remove(&handle).is_some();
        if removed {
            self.destroyed += 1;
        }
        removed
    }

    fn tick(&mut self, dt: f64) {
        self.sim_time += dt;
    }

    fn enumerate_capturable(&self) -> Vec<ObjectHandle> {
        self.objects.keys().copied().collect()
    }

    fn object(&self, handle: ObjectHandle) -> Option<&dyn Capturable> {
        self.objects.get(&handle).map(|o| o as &dyn Capturable)
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> Option<&mut dyn Capturable> {
        self.objects
            .get_mut(&handle)
            .map(|o| o as &mut dyn Capturable)
    }

    fn find_persistent(&self, pathname: &str) -> Option<ObjectHandle> {
        self.objects
            .values()
            .find(|o| o.descriptor.pathname.as_deref() == Some(pathname))
            .map(|o| o.handle)
    }

    fn viewers(&self) -> Vec<[f64; 3]> {
        self.viewers.clone()
    }

    fn receive_aux_data(&mut self, handle: ObjectHandle, data: &[u8]) {
        self.aux_received.push((handle, data.to_vec()));
    }

    fn stream_level(&mut self, package: &str, package_to_load: &str) {
        self.streamed_levels
            .push((package.to_string(), package_to_load.to_string()));
    }
}
