// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Every transferable value on the wire is `{datatype, data}`. Scalars and
/// containers carry a tag naming their shape; registered types carry their
/// construction fields so the receiver can rebuild an equivalent value
/// through its [`ValueRegistry`].
///
/// Command trees, server requests and status updates are closed serde enums
/// that emit their own `{datatype, data}` shape directly; `WireValue` is the
/// encoding of the open-ended payloads inside them — plug-in parameters and
/// registered resource values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "datatype", content = "data")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<WireValue>),
    Tuple(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Registered {
        name: String,
        fields: BTreeMap<String, WireValue>,
    },
}

impl WireValue {
    /// Encodes a plain JSON value. Objects become maps; there is no JSON
    /// tuple, so tuples only appear when built explicitly.
    pub fn encode(value: &Value) -> WireValue {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    WireValue::Int(i)
                } else {
                    WireValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => WireValue::Str(s.clone()),
            Value::Array(items) => WireValue::List(items.iter().map(WireValue::encode).collect()),
            Value::Object(fields) => WireValue::Map(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), WireValue::encode(v)))
                    .collect(),
            ),
        }
    }

    pub fn registered(name: impl Into<String>, fields: BTreeMap<String, WireValue>) -> WireValue {
        WireValue::Registered {
            name: name.into(),
            fields,
        }
    }

    /// Decodes plain data back into JSON. Registered values have no JSON
    /// rendering; rebuilding them is [`ValueRegistry::construct`]'s job.
    pub fn decode(&self) -> Result<Value, CoreError> {
        Ok(match self {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(*b),
            WireValue::Int(i) => Value::from(*i),
            WireValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            WireValue::Str(s) => Value::String(s.clone()),
            WireValue::List(items) | WireValue::Tuple(items) => Value::Array(
                items
                    .iter()
                    .map(WireValue::decode)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            WireValue::Map(fields) => {
                let mut map = serde_json::Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), value.decode()?);
                }
                Value::Object(map)
            }
            WireValue::Registered { name, .. } => {
                return Err(CoreError::InvalidRequest(format!(
                    "Registered value `{name}` must be constructed through the value registry"
                )))
            }
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WireValue::Float(f) => Some(*f),
            WireValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The initialization hash of this value: SHA-256 over the key-sorted
    /// JSON serialization of the tagged encoding.
    pub fn init_hash(&self) -> String {
        canonical_hash(&serde_json::to_value(self).expect("wire values serialize to JSON"))
    }
}

/// A value rebuilt from its wire form.
pub struct Constructed {
    pub value: Arc<dyn Any + Send + Sync>,
    pub type_name: &'static str,
}

impl Constructed {
    pub fn of<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Recovers the concrete type, e.g. inside a constructor rebuilding a
    /// nested registered value.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, CoreError> {
        let type_name = self.type_name;
        self.value.downcast::<T>().map_err(|_| {
            CoreError::Conflict(format!(
                "Constructed value is `{type_name}`, not `{}`",
                std::any::type_name::<T>()
            ))
        })
    }
}

/// Rebuilds one registered datatype from its construction fields. The
/// registry itself is passed along so constructors can rebuild nested
/// registered values.
pub type Constructor =
    fn(&ValueRegistry, &BTreeMap<String, WireValue>) -> Result<Constructed, CoreError>;

/// The process-scoped table mapping registered datatype names to their
/// constructors, assembled at startup. Re-registering a name replaces the
/// constructor, which is how declared-abstract datatypes are overridden
/// before a program runs.
#[derive(Default, Clone)]
pub struct ValueRegistry {
    constructors: HashMap<String, Constructor>,
}

impl ValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn knows(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Rebuilds a wire value: registered datatypes go through their
    /// registered constructor, scalars become their natural Rust types, and
    /// plain containers stay JSON.
    pub fn construct(&self, value: &WireValue) -> Result<Constructed, CoreError> {
        match value {
            WireValue::Registered { name, fields } => {
                let constructor = self.constructors.get(name).ok_or_else(|| {
                    CoreError::AbstractCommand(format!(
                        "No constructor registered for datatype `{name}`"
                    ))
                })?;
                constructor(self, fields)
            }
            WireValue::Bool(b) => Ok(Constructed::of(*b)),
            WireValue::Int(i) => Ok(Constructed::of(*i)),
            WireValue::Float(f) => Ok(Constructed::of(*f)),
            WireValue::Str(s) => Ok(Constructed::of(s.clone())),
            container => Ok(Constructed::of(container.decode()?)),
        }
    }
}

/// SHA-256 of the canonical (recursively key-sorted) JSON rendering of a
/// value. Stable across processes, used as a cache key for derived
/// artifacts.
pub fn canonical_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(fields) => {
            let mut sorted: Vec<(&String, &Value)> = fields.iter().collect();
            sorted.sort_by_key(|(k, _)| *k);
            let body = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items.iter().map(canonical_json).collect::<Vec<_>>().join(",");
            format!("[{body}]")
        }
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_round_trip() {
        let value = json!({
            "name": "trainer",
            "epochs": 3,
            "lr": 0.001,
            "tags": ["seg", "wsi"],
            "nested": {"enabled": true, "note": null}
        });

        let encoded = WireValue::encode(&value);
        assert_eq!(encoded.decode().unwrap(), value);
    }

    #[test]
    fn round_trip_preserves_init_hash() {
        let value = json!({"b": 2, "a": [1, 2, 3], "c": {"x": false}});
        let encoded = WireValue::encode(&value);
        let decoded = WireValue::encode(&encoded.decode().unwrap());
        assert_eq!(encoded.init_hash(), decoded.init_hash());
    }

    #[test]
    fn hash_is_key_order_independent() {
        let a = json!({"alpha": 1, "beta": {"x": 1, "y": 2}});
        let b: Value = serde_json::from_str(r#"{"beta": {"y": 2, "x": 1}, "alpha": 1}"#).unwrap();
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }

    #[test]
    fn hash_differs_for_different_values() {
        assert_ne!(
            canonical_hash(&json!({"a": 1})),
            canonical_hash(&json!({"a": 2}))
        );
    }

    #[test]
    fn wire_form_tags_containers() {
        let encoded = WireValue::encode(&json!([1, "two"]));
        let json = serde_json::to_value(&encoded).unwrap();
        assert_eq!(json["datatype"], "List");
        assert_eq!(json["data"][0]["datatype"], "Int");
        assert_eq!(json["data"][1]["datatype"], "Str");
    }

    #[derive(Debug, PartialEq)]
    struct CosineSchedule {
        t_max: i64,
        eta_min: f64,
    }

    fn cosine_schedule(
        _registry: &ValueRegistry,
        fields: &BTreeMap<String, WireValue>,
    ) -> Result<Constructed, CoreError> {
        let t_max = fields
            .get("t_max")
            .and_then(WireValue::as_i64)
            .ok_or_else(|| CoreError::InvalidRequest("CosineSchedule needs t_max".to_string()))?;
        let eta_min = fields
            .get("eta_min")
            .and_then(WireValue::as_f64)
            .unwrap_or(0.0);
        Ok(Constructed::of(CosineSchedule { t_max, eta_min }))
    }

    #[test]
    fn registered_constructor_rehydrates_the_value() {
        let mut registry = ValueRegistry::new();
        registry.register("CosineSchedule", cosine_schedule);

        let value = WireValue::registered(
            "CosineSchedule",
            BTreeMap::from([
                ("t_max".to_string(), WireValue::Int(1000)),
                ("eta_min".to_string(), WireValue::Float(1e-6)),
            ]),
        );

        // the wire form carries the full construction fields
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["data"]["name"], "CosineSchedule");
        assert_eq!(json["data"]["fields"]["t_max"]["data"], 1000);

        let constructed = registry.construct(&value).unwrap();
        let schedule = constructed
            .downcast::<CosineSchedule>()
            .expect("constructor produced a schedule");
        assert_eq!(
            *schedule,
            CosineSchedule {
                t_max: 1000,
                eta_min: 1e-6
            }
        );
    }

    #[test]
    fn unknown_datatypes_fail_as_abstract_commands() {
        let registry = ValueRegistry::new();
        let value = WireValue::registered("Unimplemented", BTreeMap::new());
        assert!(matches!(
            registry.construct(&value),
            Err(CoreError::AbstractCommand(_))
        ));
    }

    #[test]
    fn re_registration_replaces_the_constructor() {
        fn first(
            _registry: &ValueRegistry,
            _fields: &BTreeMap<String, WireValue>,
        ) -> Result<Constructed, CoreError> {
            Ok(Constructed::of(1u8))
        }
        fn second(
            _registry: &ValueRegistry,
            _fields: &BTreeMap<String, WireValue>,
        ) -> Result<Constructed, CoreError> {
            Ok(Constructed::of(2u8))
        }

        let mut registry = ValueRegistry::new();
        registry.register("Marker", first);
        registry.register("Marker", second);

        let constructed = registry
            .construct(&WireValue::registered("Marker", BTreeMap::new()))
            .unwrap();
        assert_eq!(*constructed.downcast::<u8>().unwrap(), 2);
    }

    #[test]
    fn plain_values_construct_into_natural_types() {
        let registry = ValueRegistry::new();

        let number = registry.construct(&WireValue::Int(7)).unwrap();
        assert_eq!(*number.downcast::<i64>().unwrap(), 7);

        let text = registry.construct(&WireValue::Str("cuda".to_string())).unwrap();
        assert_eq!(*text.downcast::<String>().unwrap(), "cuda");

        let map = registry
            .construct(&WireValue::encode(&json!({"k": 1})))
            .unwrap();
        assert_eq!(*map.downcast::<Value>().unwrap(), json!({"k": 1}));
    }

    #[test]
    fn registered_values_have_no_plain_json_rendering() {
        let value = WireValue::registered("CosineSchedule", BTreeMap::new());
        assert!(matches!(
            value.decode(),
            Err(CoreError::InvalidRequest(_))
        ));
    }
}
