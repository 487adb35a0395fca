//! Entity types, record identifiers, and the record shape shared by all backends.
//!
//! Backends traffic in [`EntityRecord`]: an optional [`RecordId`] plus a JSON
//! field map. All mapping and validation logic is keyed by the typed
//! [`EntityType`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Field map of a record, excluding its id.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Name of the identifier field on the wire.
pub const ID_FIELD: &str = "id";

/// Classification of persisted entities.
///
/// Known types have built-in mapping rules; anything else can be registered
/// as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    /// Client contacts.
    Clients,
    /// Matters opened for a client.
    Cases,
    /// Work items attached to a case.
    Tasks,
    /// Files attached to a case.
    Documents,
    /// Billing records.
    Invoices,
    /// A custom entity type.
    Custom(String),
}

impl EntityType {
    /// Returns the snake_case collection name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Clients => "clients",
            Self::Cases => "cases",
            Self::Tasks => "tasks",
            Self::Documents => "documents",
            Self::Invoices => "invoices",
            Self::Custom(name) => name.as_str(),
        }
    }

    /// Returns true if the name is reserved for engine bookkeeping.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.as_str().starts_with('_')
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "clients" => Self::Clients,
            "cases" => Self::Cases,
            "tasks" => Self::Tasks,
            "documents" => Self::Documents,
            "invoices" => Self::Invoices,
            other => Self::Custom(other.to_string()),
        })
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl Serialize for EntityType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EntityType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Stable record identifier, unique within one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A single persisted entity.
///
/// Legacy rows may lack an id; records in the structured store always carry
/// one. On the wire the id is flattened into the object as `"id"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EntityRecord {
    /// Record identifier, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// All other fields.
    #[serde(flatten)]
    pub fields: Fields,
}

impl EntityRecord {
    /// Creates a record with the given id and no fields.
    #[must_use]
    pub fn with_id(id: impl Into<RecordId>) -> Self {
        Self {
            id: Some(id.into()),
            fields: Fields::new(),
        }
    }

    /// Creates a record from a field map, lifting a string `"id"` field out.
    ///
    /// Non-string ids are left in the field map; the mapping table normalizes
    /// those during transform.
    #[must_use]
    pub fn from_fields(mut fields: Fields) -> Self {
        let id = match fields.get(ID_FIELD) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(RecordId::new(s.clone())),
            _ => None,
        };
        if id.is_some() {
            fields.remove(ID_FIELD);
        }
        Self { id, fields }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        if name == ID_FIELD {
            return None;
        }
        self.fields.get(name)
    }

    /// Flattens the record into a single JSON object.
    #[must_use]
    pub fn to_object(&self) -> Fields {
        let mut out = Fields::new();
        if let Some(id) = &self.id {
            out.insert(ID_FIELD.to_string(), serde_json::Value::String(id.0.clone()));
        }
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Overlays `partial` onto this record. The id is never changed.
    pub fn merge_from(&mut self, partial: &Fields) {
        for (k, v) in partial {
            if k == ID_FIELD {
                continue;
            }
            self.fields.insert(k.clone(), v.clone());
        }
    }
}
