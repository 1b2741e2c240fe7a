//! Schema-driven binary parser.
//!
//! Walks a [`SchemaNode`] tree depth-first against a byte buffer,
//! producing a [`Value`] tree. See module docs on [`crate::schema`] for
//! the node shapes.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::schema::{ArrayKind, CopyOfSchema, FieldSchema, PrimitiveType, SchemaNode, Value};

/// Parse `schema` against `buffer`, starting at `offset` bytes into the
/// buffer (the common caller, [`crate::protocol::ProtocolEngine`], has
/// already stripped the ACK byte and trailing CRC, so `offset` is
/// usually 0).
pub fn parse(schema: &SchemaNode, buffer: &[u8], offset: usize) -> Result<Value> {
    parse_node(schema, buffer, offset as f64)
}

/// One schema-level entry prior to `dependsOn` resolution.
struct PendingEntry {
    value: Value,
    /// The integer read prior to nullable masking/transform, when this
    /// entry is a plain leaf. `None` for nested objects/arrays, where
    /// raw-value copying does not apply.
    raw: Option<i64>,
    depends_on: Option<String>,
}

fn parse_node(node: &SchemaNode, buffer: &[u8], base_offset: f64) -> Result<Value> {
    match node {
        SchemaNode::Field(field) => parse_field(field, buffer, base_offset).map(|entry| entry.value),
        SchemaNode::CopyOf(_) => Err(Error::InvalidSchema(
            "copyof node encountered outside of an object level".into(),
        )),
        SchemaNode::Array(array) => parse_array(array, buffer, base_offset),
        SchemaNode::Object(fields) => parse_object(fields, buffer, base_offset),
    }
}

fn array_advance(kind: ArrayKind, element: &SchemaNode, entry_stride: Option<f64>, index: usize) -> Result<f64> {
    match kind {
        ArrayKind::EntryBased => {
            let stride = entry_stride.ok_or_else(|| {
                Error::InvalidSchema("entry-based array is missing its entry_stride".into())
            })?;
            Ok(stride * index as f64)
        }
        ArrayKind::PropertyBased => match element {
            SchemaNode::Field(f) => Ok(f.ty.size() as f64 * index as f64),
            _ => Err(Error::InvalidSchema(
                "property-based array element must be a single field".into(),
            )),
        },
    }
}

fn parse_array(array: &crate::schema::ArraySchema, buffer: &[u8], base_offset: f64) -> Result<Value> {
    let mut out = Vec::with_capacity(array.length);
    for i in 0..array.length {
        let advance = array_advance(array.kind, &array.element, array.entry_stride, i)?;
        out.push(parse_node(&array.element, buffer, base_offset + advance)?);
    }
    Ok(Value::Array(out))
}

fn parse_object(
    fields: &IndexMap<String, SchemaNode>,
    buffer: &[u8],
    base_offset: f64,
) -> Result<Value> {
    let mut resolved: IndexMap<String, PendingEntry> = IndexMap::with_capacity(fields.len());
    let mut deferred: Vec<(&str, &CopyOfSchema)> = Vec::new();

    for (name, node) in fields {
        match node {
            SchemaNode::Field(field) => {
                let entry = parse_field(field, buffer, base_offset)?;
                resolved.insert(name.clone(), entry);
            }
            SchemaNode::Array(array) => {
                let value = parse_array(array, buffer, base_offset)?;
                resolved.insert(
                    name.clone(),
                    PendingEntry {
                        value,
                        raw: None,
                        depends_on: None,
                    },
                );
            }
            SchemaNode::Object(obj) => {
                let value = parse_object(obj, buffer, base_offset)?;
                resolved.insert(
                    name.clone(),
                    PendingEntry {
                        value,
                        raw: None,
                        depends_on: None,
                    },
                );
            }
            SchemaNode::CopyOf(copy) => {
                if let Some(source) = resolved.get(copy.copy_of.as_str()) {
                    let entry = resolve_copy(copy, source)?;
                    resolved.insert(name.clone(), entry);
                } else {
                    deferred.push((name.as_str(), copy));
                }
            }
        }
    }

    // Invariant 4: a copyof's source is never itself a copyof, so one
    // retry pass always makes progress.
    for (name, copy) in deferred {
        let source = resolved.get(copy.copy_of.as_str()).ok_or_else(|| {
            Error::InvalidSchema(format!("copyof target `{}` does not resolve", copy.copy_of))
        })?;
        let entry = resolve_copy(copy, source)?;
        resolved.insert(name.to_string(), entry);
    }

    // dependsOn resolution: every dependency name must resolve within
    // this same level.
    let mut out = IndexMap::with_capacity(resolved.len());
    for (name, entry) in &resolved {
        let value = match &entry.depends_on {
            Some(dep_name) => {
                let dep = resolved.get(dep_name.as_str()).ok_or_else(|| {
                    Error::InvalidSchema(format!("dependsOn target `{dep_name}` does not resolve"))
                })?;
                if dep.value.is_null() {
                    Value::Null
                } else {
                    entry.value.clone()
                }
            }
            None => entry.value.clone(),
        };
        out.insert(name.clone(), value);
    }

    Ok(Value::Object(out))
}

fn resolve_copy(copy: &CopyOfSchema, source: &PendingEntry) -> Result<PendingEntry> {
    let depends_on = copy.depends_on.clone();
    match source.raw {
        Some(raw) => {
            let value = apply_nullable_and_transform(raw, &copy.nullables, &copy.transform);
            Ok(PendingEntry {
                value,
                raw: Some(raw),
                depends_on,
            })
        }
        None => Ok(PendingEntry {
            value: source.value.clone(),
            raw: None,
            depends_on,
        }),
    }
}

fn parse_field(field: &FieldSchema, buffer: &[u8], base_offset: f64) -> Result<PendingEntry> {
    let position = base_offset + field.position;

    let raw = read_primitive(buffer, field.ty, position);
    let value = match raw {
        None => Value::Null,
        Some(raw) => apply_nullable_and_transform(raw, &field.nullables, &field.transform),
    };

    Ok(PendingEntry {
        value,
        raw,
        depends_on: field.depends_on.clone(),
    })
}

fn apply_nullable_and_transform(raw: i64, nullables: &[i64], transform: &[crate::schema::Transform]) -> Value {
    if nullables.contains(&raw) {
        return Value::Null;
    }
    let mut value = Value::Int(raw);
    for step in transform {
        value = step(value);
    }
    value
}

/// Read a primitive at `position` out of `buffer`. Returns `None`
/// (mapped to `Value::Null` by the caller) when the read would run off
/// the end of the buffer — that's not an error, just an absent field.
fn read_primitive(buffer: &[u8], ty: PrimitiveType, position: f64) -> Option<i64> {
    if ty == PrimitiveType::Bit {
        let byte_index = position.trunc() as usize;
        let byte = *buffer.get(byte_index)?;
        let bit_frac = (position.fract() * 8.0).round() as u32;
        // MSB-first: bit index 0 is bit 7.
        let shift = 7u32.checked_sub(bit_frac)?;
        return Some(((byte >> shift) & 1) as i64);
    }

    let byte_index = position as usize;
    let size = ty.size();
    if byte_index.checked_add(size)? > buffer.len() {
        return None;
    }
    let bytes = &buffer[byte_index..byte_index + size];

    Some(match ty {
        PrimitiveType::U8 => bytes[0] as i64,
        PrimitiveType::I8 => bytes[0] as i8 as i64,
        PrimitiveType::U16Le => u16::from_le_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::U16Be => u16::from_be_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::I16Le => i16::from_le_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::I16Be => i16::from_be_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::U32Le => u32::from_le_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::U32Be => u32::from_be_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::I32Le => i32::from_le_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::I32Be => i32::from_be_bytes(bytes.try_into().unwrap()) as i64,
        PrimitiveType::Bit => unreachable!("handled above"),
    })
}
