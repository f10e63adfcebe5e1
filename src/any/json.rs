//! JSON interchange for [`Any`] values.
//!
//! Function, class, property, enum, user-object, and caller tags have no
//! JSON form; they serialize as their display string so diagnostic dumps
//! stay readable. Parsing maps JSON numbers to `Int64` when they are
//! integral, `Double` otherwise.

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::Value as JsonValue;

use crate::any::{Any, AnyType};

pub fn to_json(value: &Any) -> JsonValue {
    match value.type_tag() {
        AnyType::Undefined | AnyType::Null => JsonValue::Null,
        AnyType::Boolean => JsonValue::Bool(value.as_bool().unwrap_or(false)),
        AnyType::Int8 | AnyType::Int16 | AnyType::Int32 | AnyType::Int64 => {
            JsonValue::from(value.as_i64().unwrap_or(0))
        }
        AnyType::Float | AnyType::Double => JsonValue::from(value.as_f64().unwrap_or(0.0)),
        AnyType::String => JsonValue::String(value.as_str().unwrap_or_default().to_string()),
        AnyType::Array => {
            JsonValue::Array(value.array_items().iter().map(to_json).collect())
        }
        AnyType::Object => {
            let mut map = serde_json::Map::new();
            for (k, v) in value.object_pairs() {
                map.insert(k, to_json(&v));
            }
            JsonValue::Object(map)
        }
        AnyType::Exception => JsonValue::String(
            value
                .exception_message()
                .map(|m| format!("exception: {}", m))
                .unwrap_or_default(),
        ),
        AnyType::Function
        | AnyType::Class
        | AnyType::Property
        | AnyType::Enum
        | AnyType::UserObject
        | AnyType::Caller => JsonValue::String(value.to_display()),
    }
}

pub fn to_json_string(value: &Any) -> String {
    to_json(value).to_string()
}

pub fn from_json(json: &JsonValue) -> Any {
    match json {
        JsonValue::Null => Any::null(),
        JsonValue::Bool(b) => Any::from(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::from(i)
            } else {
                Any::from(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => Any::string(s.clone()),
        JsonValue::Array(items) => Any::array_from(items.iter().map(from_json).collect()),
        JsonValue::Object(map) => {
            let obj = Any::object();
            for (k, v) in map {
                let _ = obj.set_item(&Any::string(k.clone()), from_json(v));
            }
            obj
        }
    }
}

pub fn parse_json(text: &str) -> Result<Any, String> {
    let json: JsonValue =
        serde_json::from_str(text).map_err(|e| format!("invalid json: {}", e))?;
    Ok(from_json(&json))
}

impl Serialize for Any {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.type_tag() {
            AnyType::Undefined | AnyType::Null => serializer.serialize_unit(),
            AnyType::Boolean => serializer.serialize_bool(self.as_bool().unwrap_or(false)),
            AnyType::Int8 | AnyType::Int16 | AnyType::Int32 | AnyType::Int64 => {
                serializer.serialize_i64(self.as_i64().unwrap_or(0))
            }
            AnyType::Float | AnyType::Double => {
                serializer.serialize_f64(self.as_f64().unwrap_or(0.0))
            }
            AnyType::String => serializer.serialize_str(self.as_str().unwrap_or_default()),
            AnyType::Array => {
                let items = self.array_items();
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in &items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            AnyType::Object => {
                let fields = self.object_pairs();
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in &fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            _ => serializer.serialize_str(&self.to_display()),
        }
    }
}
