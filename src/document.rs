//! Native document shape of the remote store and its Firestore REST JSON encoding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::models::Location;

pub type Fields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    GeoPoint(Location),
    Array(Vec<FieldValue>),
    Map(Fields),
    /// Write-only token: the store substitutes its own commit time.
    ServerTimestamp,
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integers and doubles both read as `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Double(d) if d.is_finite() => Some(*d),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            FieldValue::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
            FieldValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Encodes into the REST `Value` object. `ServerTimestamp` has no value
    /// encoding and yields `None`; it is sent as a field transform instead.
    pub fn to_rest(&self) -> Option<Value> {
        let encoded = match self {
            FieldValue::Null => json!({ "nullValue": null }),
            FieldValue::Boolean(b) => json!({ "booleanValue": b }),
            FieldValue::Integer(n) => json!({ "integerValue": n.to_string() }),
            FieldValue::Double(d) => json!({ "doubleValue": d }),
            FieldValue::String(s) => json!({ "stringValue": s }),
            FieldValue::Timestamp(t) => json!({ "timestampValue": t.to_rfc3339() }),
            FieldValue::GeoPoint(loc) => json!({
                "geoPointValue": { "latitude": loc.latitude, "longitude": loc.longitude }
            }),
            FieldValue::Array(values) => {
                let values: Vec<Value> = values.iter().filter_map(FieldValue::to_rest).collect();
                json!({ "arrayValue": { "values": values } })
            }
            FieldValue::Map(fields) => json!({ "mapValue": { "fields": fields_to_rest(fields) } }),
            FieldValue::ServerTimestamp => return None,
        };
        Some(encoded)
    }

    /// Decodes a REST `Value` object. Unknown kinds (bytes, references) yield `None`.
    pub fn from_rest(value: &Value) -> Option<FieldValue> {
        let obj = value.as_object()?;
        let (kind, inner) = obj.iter().next()?;
        let decoded = match kind.as_str() {
            "nullValue" => FieldValue::Null,
            "booleanValue" => FieldValue::Boolean(inner.as_bool()?),
            "integerValue" => FieldValue::Integer(match inner {
                Value::String(s) => s.parse().ok()?,
                other => other.as_i64()?,
            }),
            "doubleValue" => FieldValue::Double(match inner {
                // NaN and Infinity arrive as strings
                Value::String(s) => s.parse().ok()?,
                other => other.as_f64()?,
            }),
            "stringValue" => FieldValue::String(inner.as_str()?.to_string()),
            "timestampValue" => FieldValue::Timestamp(
                DateTime::parse_from_rfc3339(inner.as_str()?)
                    .ok()?
                    .with_timezone(&Utc),
            ),
            "geoPointValue" => {
                // zero coordinates are omitted from the wire form
                let latitude = inner.get("latitude").and_then(Value::as_f64).unwrap_or(0.0);
                let longitude = inner.get("longitude").and_then(Value::as_f64).unwrap_or(0.0);
                FieldValue::GeoPoint(Location {
                    latitude,
                    longitude,
                })
            }
            "arrayValue" => FieldValue::Array(
                inner
                    .get("values")
                    .and_then(Value::as_array)
                    .map(|values| values.iter().filter_map(FieldValue::from_rest).collect())
                    .unwrap_or_default(),
            ),
            "mapValue" => FieldValue::Map(
                inner
                    .get("fields")
                    .and_then(Value::as_object)
                    .map(fields_from_rest)
                    .unwrap_or_default(),
            ),
            _ => return None,
        };
        Some(decoded)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<f64> for FieldValue {
    fn from(d: f64) -> Self {
        FieldValue::Double(d)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Integer(n)
    }
}

impl From<Location> for FieldValue {
    fn from(loc: Location) -> Self {
        FieldValue::GeoPoint(loc)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

pub fn fields_to_rest(fields: &Fields) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|(name, value)| value.to_rest().map(|v| (name.clone(), v)))
        .collect()
}

pub fn fields_from_rest(fields: &Map<String, Value>) -> Fields {
    fields
        .iter()
        .filter_map(|(name, value)| FieldValue::from_rest(value).map(|v| (name.clone(), v)))
        .collect()
}

/// Names of the fields that carry the server-timestamp token.
pub fn server_timestamp_fields(fields: &Fields) -> Vec<String> {
    fields
        .iter()
        .filter(|(_, value)| matches!(value, FieldValue::ServerTimestamp))
        .map(|(name, _)| name.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Last path segment.
    pub id: String,
    /// Path relative to the database root, e.g. `reports/abc/photos/xyz`.
    pub path: String,
    pub fields: Fields,
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(path: impl Into<String>, fields: Fields) -> Self {
        let path = path.into();
        let id = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id,
            path,
            fields,
            update_time: None,
        }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_str)
    }

    /// Non-empty string field.
    pub fn get_text(&self, field: &str) -> Option<String> {
        self.get_str(field)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(FieldValue::as_f64)
    }
}

/// One document write in an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Fails the whole commit if the document already exists.
    Create { path: String, fields: Fields },
    /// Replaces the document, or only the listed fields when `merge` is set.
    Set {
        path: String,
        fields: Fields,
        merge: bool,
    },
}

impl Write {
    pub fn path(&self) -> &str {
        match self {
            Write::Create { path, .. } | Write::Set { path, .. } => path,
        }
    }

    pub fn fields(&self) -> &Fields {
        match self {
            Write::Create { fields, .. } | Write::Set { fields, .. } => fields,
        }
    }

    /// REST `Write` object; `database_root` is `projects/<p>/databases/(default)/documents`.
    pub fn to_rest(&self, database_root: &str) -> Value {
        let name = format!("{}/{}", database_root, self.path());
        let fields = self.fields();
        let transforms: Vec<Value> = server_timestamp_fields(fields)
            .into_iter()
            .map(|field| json!({ "fieldPath": field, "setToServerValue": "REQUEST_TIME" }))
            .collect();

        let mut write = Map::new();
        write.insert(
            "update".to_string(),
            json!({ "name": name, "fields": fields_to_rest(fields) }),
        );
        if !transforms.is_empty() {
            write.insert("updateTransforms".to_string(), Value::Array(transforms));
        }
        match self {
            Write::Create { .. } => {
                write.insert("currentDocument".to_string(), json!({ "exists": false }));
            }
            Write::Set { merge: true, .. } => {
                let mask: Vec<&String> = fields
                    .iter()
                    .filter(|(_, v)| !matches!(v, FieldValue::ServerTimestamp))
                    .map(|(k, _)| k)
                    .collect();
                write.insert("updateMask".to_string(), json!({ "fieldPaths": mask }));
            }
            Write::Set { merge: false, .. } => {}
        }
        Value::Object(write)
    }
}
