//! Build-time schema descriptors and the data-driven delta codec.
//!
//! Every capturable class declares an ordered list of `(field_id, codec)`
//! pairs in a [`ClassSchema`]. Deltas are produced by walking that table
//! and comparing the current [`ObjectState`] against a baseline; no
//! runtime type introspection is involved.
//!
//! # Delta layout
//!
//! ```text
//! [u16 field_count] { [u16 field_id] [value] } * field_count
//! ```
//!
//! Values are little-endian: `Bool` as one byte, `Int` as `i64`, `Float` as
//! `f64`, `Vector` as three `f64`s, `Text` as a `u32` length plus UTF-8.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::error::DeltaError;
use crate::hash::{fnv1a_extend, fnv1a_u32};
use crate::id::{ClassId, FieldId};

// ── Codecs and values ──────────────────────────────────────────────

/// Wire encoding of a single field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldCodec {
    /// One byte, 0 or 1.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Three 64-bit floats.
    Vector,
    /// Length-prefixed UTF-8.
    Text,
}

impl FieldCodec {
    /// Stable one-byte tag used in the field descriptor table.
    pub fn tag(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::Int => 1,
            Self::Float => 2,
            Self::Vector => 3,
            Self::Text => 4,
        }
    }

    /// Inverse of [`tag`](Self::tag).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Bool),
            1 => Some(Self::Int),
            2 => Some(Self::Float),
            3 => Some(Self::Vector),
            4 => Some(Self::Text),
            _ => None,
        }
    }

    /// The value a freshly spawned object holds for this codec.
    pub fn default_value(self) -> FieldValue {
        match self {
            Self::Bool => FieldValue::Bool(false),
            Self::Int => FieldValue::Int(0),
            Self::Float => FieldValue::Float(0.0),
            Self::Vector => FieldValue::Vector([0.0; 3]),
            Self::Text => FieldValue::Text(String::new()),
        }
    }
}

/// A decoded field value.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// See [`FieldCodec::Bool`].
    Bool(bool),
    /// See [`FieldCodec::Int`].
    Int(i64),
    /// See [`FieldCodec::Float`].
    Float(f64),
    /// See [`FieldCodec::Vector`].
    Vector([f64; 3]),
    /// See [`FieldCodec::Text`].
    Text(String),
}

impl FieldValue {
    /// Whether this value can be written with `codec`.
    pub fn matches(&self, codec: FieldCodec) -> bool {
        matches!(
            (self, codec),
            (Self::Bool(_), FieldCodec::Bool)
                | (Self::Int(_), FieldCodec::Int)
                | (Self::Float(_), FieldCodec::Float)
                | (Self::Vector(_), FieldCodec::Vector)
                | (Self::Text(_), FieldCodec::Text)
        )
    }
}

// ── Schema descriptors ─────────────────────────────────────────────

/// One entry of a class schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field id, unique within the class.
    pub id: FieldId,
    /// Human-readable name; part of the schema checksum.
    pub name: String,
    /// Wire codec.
    pub codec: FieldCodec,
}

/// The ordered field table for one capturable class.
///
/// ```
/// use rewind_core::{ClassId, ClassSchema, FieldCodec};
///
/// let door = ClassSchema::new(ClassId(1), "Door")
///     .with_field("open", FieldCodec::Bool)
///     .with_field("angle", FieldCodec::Float);
/// assert_eq!(door.fields.len(), 2);
/// assert_eq!(door.field_by_name("angle").map(|f| f.id.0), Some(1));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassSchema {
    /// Class id.
    pub class: ClassId,
    /// Class name; part of the schema checksum.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
}

impl ClassSchema {
    /// An empty schema for `class`.
    pub fn new(class: ClassId, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field, assigning the next sequential id.
    pub fn with_field(mut self, name: impl Into<String>, codec: FieldCodec) -> Self {
        let id = FieldId(self.fields.len() as u16);
        self.fields.push(FieldDescriptor {
            id,
            name: name.into(),
            codec,
        });
        self
    }

    /// Look up a field by id.
    pub fn field(&self, id: FieldId) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Look up a field by name.
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checksum over the class name and every field's id, name, and codec.
    ///
    /// Two builds agree on a class's wire layout iff their checksums match.
    pub fn checksum(&self) -> u32 {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&self.class.0.to_le_bytes());
        bytes.extend_from_slice(self.name.as_bytes());
        for f in &self.fields {
            bytes.extend_from_slice(&f.id.0.to_le_bytes());
            bytes.extend_from_slice(f.name.as_bytes());
            bytes.push(f.codec.tag());
        }
        fnv1a_u32(&bytes)
    }

    /// A state holding every field's default value.
    pub fn default_state(&self) -> ObjectState {
        let mut state = ObjectState::new();
        for f in &self.fields {
            state.set(f.id, f.codec.default_value());
        }
        state
    }
}

/// All class schemas known to a build, in registration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaRegistry {
    classes: IndexMap<ClassId, ClassSchema>,
}

impl SchemaRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a class schema.
    pub fn register(&mut self, schema: ClassSchema) {
        self.classes.insert(schema.class, schema);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, schema: ClassSchema) -> Self {
        self.register(schema);
        self
    }

    /// Look up a class schema.
    pub fn get(&self, class: ClassId) -> Option<&ClassSchema> {
        self.classes.get(&class)
    }

    /// Checksum of one class, if registered.
    pub fn checksum_of(&self, class: ClassId) -> Option<u32> {
        self.get(class).map(ClassSchema::checksum)
    }

    /// Iterate schemas in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassSchema> {
        self.classes.values()
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether no class is registered.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Combined version over every class checksum, in class-id order.
    pub fn version(&self) -> u32 {
        let mut ids: Vec<_> = self.classes.keys().copied().collect();
        ids.sort();
        let mut hash = 0xcbf29ce484222325u64;
        for id in ids {
            if let Some(sum) = self.checksum_of(id) {
                hash = fnv1a_extend(hash, &sum.to_le_bytes());
            }
        }
        ((hash >> 32) ^ hash) as u32
    }
}

// ── Object state ───────────────────────────────────────────────────

/// Current field values of one object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectState {
    values: BTreeMap<FieldId, FieldValue>,
}

impl ObjectState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a field.
    pub fn get(&self, id: FieldId) -> Option<&FieldValue> {
        self.values.get(&id)
    }

    /// Write a field, returning the previous value.
    pub fn set(&mut self, id: FieldId, value: FieldValue) -> Option<FieldValue> {
        self.values.insert(id, value)
    }

    /// Iterate fields in id order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &FieldValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// Number of populated fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no field is populated.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ── Delta codec ────────────────────────────────────────────────────

/// Encode the fields of `current` that differ from `baseline`.
///
/// With no baseline every populated field is written and the result is
/// always `Some`. With a baseline, `None` means nothing changed.
pub fn encode_delta(
    schema: &ClassSchema,
    baseline: Option<&ObjectState>,
    current: &ObjectState,
) -> Result<Option<Vec<u8>>, DeltaError> {
    let mut body = Vec::new();
    let mut count: u16 = 0;
    for field in &schema.fields {
        let Some(value) = current.get(field.id) else {
            continue;
        };
        if baseline.and_then(|b| b.get(field.id)) == Some(value) {
            continue;
        }
        if !value.matches(field.codec) {
            return Err(DeltaError::CodecMismatch {
                class: schema.class,
                field: field.id,
            });
        }
        body.extend_from_slice(&field.id.0.to_le_bytes());
        write_value(&mut body, value);
        count += 1;
    }
    if count == 0 && baseline.is_some() {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(Some(out))
}

/// Apply an encoded delta to `state`, returning the ids that changed value.
///
/// The state is only mutated once the whole delta has decoded cleanly.
pub fn apply_delta(
    schema: &ClassSchema,
    state: &mut ObjectState,
    bytes: &[u8],
) -> Result<SmallVec<[FieldId; 8]>, DeltaError> {
    let mut cur = Cursor { buf: bytes, pos: 0 };
    let count = cur.u16("field count")?;
    let mut decoded: SmallVec<[(FieldId, FieldValue); 8]> = SmallVec::new();
    for _ in 0..count {
        let id = FieldId(cur.u16("field id")?);
        let field = schema.field(id).ok_or(DeltaError::UnknownField {
            class: schema.class,
            field: id,
        })?;
        decoded.push((id, cur.value(field)?));
    }
    if cur.pos != bytes.len() {
        return Err(DeltaError::TrailingBytes {
            remaining: bytes.len() - cur.pos,
        });
    }
    let mut changed = SmallVec::new();
    for (id, value) in decoded {
        if state.set(id, value.clone()).as_ref() != Some(&value) {
            changed.push(id);
        }
    }
    Ok(changed)
}

fn write_value(out: &mut Vec<u8>, value: &FieldValue) {
    match value {
        FieldValue::Bool(b) => out.push(u8::from(*b)),
        FieldValue::Int(i) => out.extend_from_slice(&i.to_le_bytes()),
        FieldValue::Float(x) => out.extend_from_slice(&x.to_le_bytes()),
        FieldValue::Vector(v) => {
            for x in v {
                out.extend_from_slice(&x.to_le_bytes());
            }
        }
        FieldValue::Text(s) => {
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], DeltaError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(DeltaError::Truncated {
                detail: what.to_string(),
            }),
        }
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N], DeltaError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn u16(&mut self, what: &str) -> Result<u16, DeltaError> {
        Ok(u16::from_le_bytes(self.array(what)?))
    }

    fn f64(&mut self, what: &str) -> Result<f64, DeltaError> {
        Ok(f64::from_le_bytes(self.array(what)?))
    }

    fn value(&mut self, field: &FieldDescriptor) -> Result<FieldValue, DeltaError> {
        let what = field.name.as_str();
        Ok(match field.codec {
            FieldCodec::Bool => FieldValue::Bool(self.take(1, what)?[0] != 0),
            FieldCodec::Int => FieldValue::Int(i64::from_le_bytes(self.array(what)?)),
            FieldCodec::Float => FieldValue::Float(self.f64(what)?),
            FieldCodec::Vector => {
                FieldValue::Vector([self.f64(what)?, self.f64(what)?, self.f64(what)?])
            }
            FieldCodec::Text => {
                let len = u32::from_le_bytes(self.array(what)?) as usize;
                let raw = self.take(len, what)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| DeltaError::InvalidText { field: field.id })?;
                FieldValue::Text(text.to_string())
            }
        })
    }
}
