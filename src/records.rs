//! Minimal LOOP1/LOOP2/HILOW field schemas.
//!
//! The concrete Davis field layouts are data-only tables, trivially
//! ported from the serial protocol manual; what follows is a
//! representative subset — enough to exercise the parser and the
//! rich-merge logic — not an exhaustive transcription.

use std::sync::{Arc, LazyLock};

use crate::schema::{FieldSchema, PrimitiveType, SchemaNode, Transform};

/// Build a transform that divides an integer reading by `divisor`,
/// producing the physical unit (e.g. tenths-of-degree -> degrees,
/// rain clicks -> inches). The concrete conversion factors for each
/// Davis field are themselves out of scope; this is the mechanism.
pub fn scale(divisor: f64) -> Transform {
    Arc::new(move |v| match v {
        crate::schema::Value::Int(i) => crate::schema::Value::Float(i as f64 / divisor),
        other => other,
    })
}

fn temperature(position: f64) -> SchemaNode {
    SchemaNode::Field(
        FieldSchema::new(PrimitiveType::I16Le, position)
            .with_nullables([0x7FFF])
            .with_transform(scale(10.0)),
    )
}

fn humidity(position: f64) -> SchemaNode {
    SchemaNode::Field(FieldSchema::new(PrimitiveType::U8, position).with_nullables([255]))
}

fn rain_amount(position: f64) -> SchemaNode {
    SchemaNode::Field(
        FieldSchema::new(PrimitiveType::U16Le, position)
            .with_nullables([0x7FFF])
            .with_transform(scale(100.0)),
    )
}

/// LOOP1 realtime packet (99-byte payload).
pub static LOOP1_SCHEMA: LazyLock<SchemaNode> = LazyLock::new(|| {
    SchemaNode::object([
        ("package_type", SchemaNode::Field(FieldSchema::new(PrimitiveType::U8, 4.0))),
        (
            "next_archive_record",
            SchemaNode::Field(FieldSchema::new(PrimitiveType::U16Le, 5.0)),
        ),
        (
            "temperature",
            SchemaNode::object([("out", temperature(12.0)), ("in", temperature(9.0))]),
        ),
        (
            "humidity",
            SchemaNode::object([("out", humidity(33.0)), ("in", humidity(11.0))]),
        ),
        (
            "rain",
            SchemaNode::object([
                ("rate", rain_amount(41.0)),
                ("storm", rain_amount(46.0)),
                ("day", rain_amount(50.0)),
            ]),
        ),
        (
            "alarms",
            SchemaNode::Array(crate::schema::ArraySchema::property_based(
                SchemaNode::Field(FieldSchema::new(PrimitiveType::U8, 70.0)),
                2,
            )),
        ),
    ])
});

/// LOOP2 realtime packet (99-byte payload).
pub static LOOP2_SCHEMA: LazyLock<SchemaNode> = LazyLock::new(|| {
    SchemaNode::object([
        ("package_type", SchemaNode::Field(FieldSchema::new(PrimitiveType::U8, 4.0))),
        (
            "et",
            SchemaNode::Field(FieldSchema::new(PrimitiveType::U16Le, 5.0).with_nullables([0x7FFF])),
        ),
        (
            "temperature",
            SchemaNode::object([("out", temperature(12.0))]),
        ),
        ("humidity", SchemaNode::object([("out", humidity(33.0))])),
        (
            "rain",
            SchemaNode::object([("rate", rain_amount(41.0)), ("day", rain_amount(50.0))]),
        ),
        (
            "graph_pointers",
            SchemaNode::Array(crate::schema::ArraySchema::property_based(
                SchemaNode::Field(FieldSchema::new(PrimitiveType::U8, 85.0)),
                10,
            )),
        ),
        (
            "wind_speed_10min_avg",
            SchemaNode::Field(FieldSchema::new(PrimitiveType::U16Le, 18.0).with_nullables([0x7FFF])),
        ),
    ])
});

/// HILOWS summary packet.
pub static HILOW_SCHEMA: LazyLock<SchemaNode> = LazyLock::new(|| {
    SchemaNode::object([(
        "temperature",
        SchemaNode::object([
            ("out_lo", temperature(14.0)),
            ("out_hi", temperature(12.0)),
        ]),
    )])
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Value;

    #[test]
    fn loop1_schema_parses_package_type_and_substructures() {
        let mut buf = vec![0u8; 99];
        buf[4] = 0; // package_type
        buf[12..14].copy_from_slice(&720i16.to_le_bytes()); // temperature.out = 72.0F
        buf[33] = 45; // humidity.out = 45%
        let record = crate::parser::parse(&LOOP1_SCHEMA, &buf, 0).unwrap();
        assert_eq!(record.get_path("package_type"), Some(&Value::Int(0)));
        assert_eq!(record.get_path("temperature.out"), Some(&Value::Float(72.0)));
        assert_eq!(record.get_path("humidity.out"), Some(&Value::Int(45)));
    }
}
