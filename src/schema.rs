//! The declarative schema tree consumed by [`crate::parser`].
//!
//! A schema describes how to read a packed, little-endian Davis binary
//! record without requiring a Rust type per record — LOOP1, LOOP2 and
//! HILOW are all just different [`SchemaNode::Object`] trees built at
//! construction time and shared (via `Arc`) across every parse.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

/// A single transform step in a field's pipeline. Takes the previous
/// value (never [`Value::Null`] — transforms never run on null, per
/// invariant 2) and produces the next value in the chain.
pub type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// The wire representation of a single schema leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    U8,
    U16Le,
    U16Be,
    U32Le,
    U32Be,
    I8,
    I16Le,
    I16Be,
    I32Le,
    I32Be,
    /// A single bit. The containing [`FieldSchema::position`]'s integer
    /// part selects the byte, its fractional part (×8, rounded) selects
    /// the MSB-first bit index within that byte.
    Bit,
}

impl PrimitiveType {
    /// Size in bytes of the primitive's on-wire representation. `Bit`
    /// always reads from within a single byte.
    pub fn size(self) -> usize {
        match self {
            PrimitiveType::U8 | PrimitiveType::I8 | PrimitiveType::Bit => 1,
            PrimitiveType::U16Le | PrimitiveType::U16Be | PrimitiveType::I16Le | PrimitiveType::I16Be => 2,
            PrimitiveType::U32Le | PrimitiveType::U32Be | PrimitiveType::I32Le | PrimitiveType::I32Be => 4,
        }
    }
}

/// Whether a repeated array advances per-field (a bare sequence of
/// primitives, spaced by `sizeof(type)`) or per-entry (a sequence of
/// records whose internal layout is fixed but whose base address shifts
/// by an explicit stride).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    PropertyBased,
    EntryBased,
}

/// A leaf that reads a primitive value at a fixed (possibly array-index
/// shifted) position.
#[derive(Clone)]
pub struct FieldSchema {
    pub ty: PrimitiveType,
    /// Byte offset relative to the enclosing parse's base offset.
    /// Fractional for `PrimitiveType::Bit`.
    pub position: f64,
    /// Raw (pre-transform) sentinel values that resolve to `Null`.
    pub nullables: Vec<i64>,
    pub transform: Vec<Transform>,
    /// Name of a sibling property in the same nesting level whose
    /// resolved value gates this one: if the dependency resolves to
    /// `Null`, so does this field, regardless of its own raw bytes.
    pub depends_on: Option<String>,
}

impl fmt::Debug for FieldSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSchema")
            .field("ty", &self.ty)
            .field("position", &self.position)
            .field("nullables", &self.nullables)
            .field("transform_count", &self.transform.len())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl FieldSchema {
    pub fn new(ty: PrimitiveType, position: f64) -> Self {
        Self {
            ty,
            position,
            nullables: Vec::new(),
            transform: Vec::new(),
            depends_on: None,
        }
    }

    pub fn with_nullables(mut self, nullables: impl IntoIterator<Item = i64>) -> Self {
        self.nullables = nullables.into_iter().collect();
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform.push(transform);
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on = Some(name.into());
        self
    }
}

/// A leaf that resolves to a sibling's already-parsed raw value, then
/// applies its own nullable/transform pipeline independently.
#[derive(Clone)]
pub struct CopyOfSchema {
    pub copy_of: String,
    pub nullables: Vec<i64>,
    pub transform: Vec<Transform>,
    pub depends_on: Option<String>,
}

impl fmt::Debug for CopyOfSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyOfSchema")
            .field("copy_of", &self.copy_of)
            .field("nullables", &self.nullables)
            .field("transform_count", &self.transform.len())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl CopyOfSchema {
    pub fn new(copy_of: impl Into<String>) -> Self {
        Self {
            copy_of: copy_of.into(),
            nullables: Vec::new(),
            transform: Vec::new(),
            depends_on: None,
        }
    }

    pub fn with_nullables(mut self, nullables: impl IntoIterator<Item = i64>) -> Self {
        self.nullables = nullables.into_iter().collect();
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform.push(transform);
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on = Some(name.into());
        self
    }
}

/// A repeated schema node.
#[derive(Debug, Clone)]
pub struct ArraySchema {
    pub element: Box<SchemaNode>,
    pub length: usize,
    pub kind: ArrayKind,
    /// Required (and only meaningful) when `kind == EntryBased`: the
    /// byte stride between consecutive entries' base offsets.
    pub entry_stride: Option<f64>,
}

impl ArraySchema {
    pub fn property_based(element: SchemaNode, length: usize) -> Self {
        Self {
            element: Box::new(element),
            length,
            kind: ArrayKind::PropertyBased,
            entry_stride: None,
        }
    }

    pub fn entry_based(element: SchemaNode, length: usize, entry_stride: f64) -> Self {
        Self {
            element: Box::new(element),
            length,
            kind: ArrayKind::EntryBased,
            entry_stride: Some(entry_stride),
        }
    }
}

/// One node of the recursive schema tree. Tags are explicit so the
/// parser can match exhaustively instead of doing dynamic type tests.
#[derive(Debug, Clone)]
pub enum SchemaNode {
    Field(FieldSchema),
    CopyOf(CopyOfSchema),
    Array(ArraySchema),
    Object(IndexMap<String, SchemaNode>),
}

impl SchemaNode {
    pub fn object(fields: impl IntoIterator<Item = (&'static str, SchemaNode)>) -> Self {
        SchemaNode::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// A parsed leaf or composite value, mirroring the shape of the schema
/// tree that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Date(chrono::NaiveDate),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a dotted path (`"temperature.out"`) through nested
    /// objects. Used by the rich-merge logic and by tests.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut cur = self;
        for part in path.split('.') {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }
}
