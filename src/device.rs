//! Device variants: three thin specializations of
//! [`ProtocolEngine`] that differ in which commands are legal and, for
//! the Pro 2, in how LOOP1+LOOP2 merge into a "rich" record.
//!
//! Model selection is a runtime value (it comes from configuration, see
//! [`crate::config::DeviceConfig`]), so unsupported operations are a
//! runtime `Err(Error::UnsupportedDeviceModel)`, not a compile-time
//! distinction between three Rust types.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::protocol::ProtocolEngine;
use crate::records::{HILOW_SCHEMA, LOOP1_SCHEMA, LOOP2_SCHEMA};
use crate::schema::Value;
use crate::transport::ByteTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
pub enum DeviceModel {
    #[strum(serialize = "Vantage Pro")]
    VantagePro,
    #[strum(serialize = "Vantage Pro 2")]
    VantagePro2,
    #[strum(serialize = "Vantage Vue")]
    VantageVue,
}

impl DeviceModel {
    fn supports_firmware_version(self) -> bool {
        matches!(self, DeviceModel::VantageVue | DeviceModel::VantagePro2)
    }

    fn supports_loop2(self) -> bool {
        matches!(self, DeviceModel::VantagePro2)
    }
}

/// A console driven via a given [`ByteTransport`], specialized by
/// [`DeviceModel`].
pub struct Device<T: ByteTransport> {
    engine: ProtocolEngine<T>,
    model: DeviceModel,
}

impl<T: ByteTransport> Device<T> {
    pub fn new(transport: T, model: DeviceModel) -> Self {
        Self {
            engine: ProtocolEngine::new(transport),
            model,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// A clone of this device's cancellation signal, for a caller that
    /// is about to hand it off to a background thread and wants a way
    /// to interrupt an in-flight read wait from the outside.
    pub fn cancel_token(&self) -> crate::transport::CancelToken {
        self.engine.cancel_token()
    }

    pub fn open(&mut self) -> Result<()> {
        self.engine.open()
    }

    pub fn close(&mut self) {
        self.engine.close();
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    pub fn wake_up(&mut self) -> Result<()> {
        self.engine.wake_up()
    }

    pub fn validate_connection(&mut self) -> Result<()> {
        self.engine.validate_connection()
    }

    pub fn firmware_date_code(&mut self) -> Result<String> {
        self.engine.firmware_date_code()
    }

    fn require(&self, supported: bool, operation: &str) -> Result<()> {
        if supported {
            Ok(())
        } else {
            Err(Error::UnsupportedDeviceModel(format!(
                "{operation} is not supported on {}",
                self.model
            )))
        }
    }

    pub fn firmware_version(&mut self) -> Result<String> {
        self.require(self.model.supports_firmware_version(), "firmware_version")?;
        self.engine.firmware_version()
    }

    pub fn loop1(&mut self) -> Result<Value> {
        let payload = self.engine.loop1()?;
        crate::parser::parse(&LOOP1_SCHEMA, &payload, 0)
    }

    pub fn loop2(&mut self) -> Result<Value> {
        self.require(self.model.supports_loop2(), "loop2")?;
        let payload = self.engine.loop2()?;
        crate::parser::parse(&LOOP2_SCHEMA, &payload, 0)
    }

    pub fn highs_and_lows(&mut self) -> Result<Value> {
        let payload = self.engine.highs_and_lows()?;
        crate::parser::parse(&HILOW_SCHEMA, &payload, 0)
    }

    /// The merged LOOP1+LOOP2 record, exposed only on the Pro 2.
    pub fn rich_realtime_data(&mut self) -> Result<Value> {
        self.require(self.model.supports_loop2(), "rich_realtime_data")?;
        let loop1 = self.loop1()?;
        let loop2 = self.loop2()?;
        Ok(rich_merge(&loop1, &loop2))
    }
}

/// Drop keys from the top level of an object; non-objects pass through
/// unchanged.
fn drop_keys(value: &Value, keys: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = IndexMap::with_capacity(map.len());
            for (k, v) in map {
                if !keys.contains(&k.as_str()) {
                    out.insert(k.clone(), v.clone());
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Recursively merge two records, `b` winning on leaf conflicts. This
/// single recursive merge is what makes LOOP2's `rain`/`temperature`
/// substructures win on overlapping fields while LOOP1-only fields
/// (e.g. `temperature.in`, absent from LOOP2) survive untouched.
fn deep_merge(a: &Value, b: &Value) -> Value {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let mut out = ma.clone();
            for (k, bv) in mb {
                let merged = match out.get(k) {
                    Some(av) => deep_merge(av, bv),
                    None => bv.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        _ => b.clone(),
    }
}

/// Merge a LOOP1 and LOOP2 record into the Pro 2's "rich" realtime
/// record: bookkeeping fields unique to each packet shape are dropped,
/// everything else deep-merges with LOOP2 taking precedence on
/// overlapping leaves.
pub fn rich_merge(loop1: &Value, loop2: &Value) -> Value {
    let l1 = drop_keys(loop1, &["alarms", "package_type", "next_archive_record"]);
    let l2 = drop_keys(loop2, &["et", "package_type", "graph_pointers"]);
    deep_merge(&l1, &l2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn device(model: DeviceModel) -> Device<MockTransport> {
        Device::new(MockTransport::new(), model)
    }

    #[test]
    fn pro_cannot_fetch_loop2() {
        let mut d = device(DeviceModel::VantagePro);
        d.open().unwrap();
        assert!(matches!(d.loop2(), Err(Error::UnsupportedDeviceModel(_))));
    }

    #[test]
    fn pro_cannot_fetch_firmware_version() {
        let mut d = device(DeviceModel::VantagePro);
        d.open().unwrap();
        assert!(matches!(
            d.firmware_version(),
            Err(Error::UnsupportedDeviceModel(_))
        ));
    }

    #[test]
    fn vue_supports_firmware_version_but_not_loop2() {
        let mut d = device(DeviceModel::VantageVue);
        d.open().unwrap();
        assert!(matches!(d.loop2(), Err(Error::UnsupportedDeviceModel(_))));
    }

    fn obj(pairs: &[(&str, Value)]) -> Value {
        let mut m = IndexMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        Value::Object(m)
    }

    #[test]
    fn rich_merge_prefers_loop2_on_conflict_and_keeps_loop1_only_fields() {
        let loop1 = obj(&[
            (
                "rain",
                obj(&[
                    ("day", Value::Float(0.25)),
                    ("storm", Value::Null),
                ]),
            ),
            ("temperature", obj(&[("out", Value::Float(72.0))])),
            ("package_type", Value::Int(0)),
        ]);
        let loop2 = obj(&[
            ("rain", obj(&[("rate", Value::Float(0.10))])),
            ("temperature", obj(&[("out", Value::Float(99.0))])),
            ("package_type", Value::Int(1)),
        ]);

        let merged = rich_merge(&loop1, &loop2);
        assert_eq!(merged.get_path("temperature.out"), Some(&Value::Float(99.0)));
        assert_eq!(merged.get_path("rain.day"), Some(&Value::Float(0.25)));
        assert_eq!(merged.get_path("rain.rate"), Some(&Value::Float(0.10)));
        assert_eq!(merged.get_path("rain.storm"), Some(&Value::Null));
        assert!(merged.as_object().unwrap().get("package_type").is_none());
    }
}
