//! Entity mapping rules: how a legacy row becomes a structured record.
//!
//! A [`MappingTable`] holds one [`EntityMappingRule`] per entity type and a
//! dependency order derived from the foreign keys between them. The
//! [`MappingTable::transform`] function is pure and deterministic: the same
//! legacy input always yields byte-identical output, and feeding a transformed
//! record back through [`MappingTable::inverse_transform`] and `transform`
//! again is a fixed point. Re-running a migration relies on both properties.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

use crate::error::TransformError;
use crate::record::{EntityRecord, EntityType, Fields, RecordId, ID_FIELD};

/// Namespace for ids generated from legacy row contents.
const LEGACY_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_6a0e_93c4_4f55_8a57_1c2b_de30_7a19);

fn date_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(^|_)(date|at)$").expect("date field pattern"))
}

fn snake_ident_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9]*(_[a-z][a-z0-9]*)*$").expect("snake identifier pattern"))
}

/// Field naming convention applied to fields without an explicit rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldNaming {
    /// `camelCase` legacy names become `snake_case`.
    #[default]
    SnakeCase,
    /// Names are copied unchanged.
    Preserve,
}

impl FieldNaming {
    fn to_target(self, name: &str) -> String {
        match self {
            Self::Preserve => name.to_string(),
            Self::SnakeCase => to_snake_case(name),
        }
    }

    fn to_legacy(self, name: &str) -> String {
        match self {
            Self::Preserve => name.to_string(),
            Self::SnakeCase => to_camel_case(name),
        }
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        prev = Some(c);
    }
    out
}

/// Inverse of [`to_snake_case`] for well-formed snake identifiers; anything
/// else is returned unchanged so the round trip stays lossless.
fn to_camel_case(name: &str) -> String {
    if !snake_ident_regex().is_match(name) {
        return name.to_string();
    }
    let mut parts = name.split('_');
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

/// A foreign-key field and the entity type it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Target-side field name.
    pub field: String,
    /// Referenced entity type.
    pub references: EntityType,
}

/// Per-entity-type mapping rules.
///
/// Field names in `defaults`, `required`, `foreign_keys`, and `date_fields`
/// are target-side names.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMappingRule {
    /// Entity type this rule applies to.
    pub entity_type: EntityType,
    /// Legacy name to target name.
    pub renames: BTreeMap<String, String>,
    /// Values for fields absent (or null) in legacy data.
    pub defaults: Fields,
    /// Fields that must be present and non-empty after migration.
    pub required: Vec<String>,
    /// Foreign keys checked during integrity validation.
    pub foreign_keys: Vec<ForeignKey>,
    /// Extra date fields beyond the `*_at` / `*_date` convention.
    pub date_fields: Vec<String>,
    /// Naming convention for fields without a rename.
    pub naming: FieldNaming,
}

impl EntityMappingRule {
    /// Creates an empty rule for an entity type.
    #[must_use]
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            renames: BTreeMap::new(),
            defaults: Fields::new(),
            required: Vec::new(),
            foreign_keys: Vec::new(),
            date_fields: Vec::new(),
            naming: FieldNaming::default(),
        }
    }

    /// Adds a field rename.
    #[must_use]
    pub fn rename(mut self, legacy: impl Into<String>, target: impl Into<String>) -> Self {
        self.renames.insert(legacy.into(), target.into());
        self
    }

    /// Adds a default value.
    #[must_use]
    pub fn default_value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.defaults.insert(field.into(), value.into());
        self
    }

    /// Marks a field as required.
    #[must_use]
    pub fn required(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    /// Declares a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, field: impl Into<String>, references: EntityType) -> Self {
        self.foreign_keys.push(ForeignKey {
            field: field.into(),
            references,
        });
        self
    }

    /// Declares an extra date field.
    #[must_use]
    pub fn date_field(mut self, field: impl Into<String>) -> Self {
        self.date_fields.push(field.into());
        self
    }

    /// Sets the naming convention.
    #[must_use]
    pub fn naming(mut self, naming: FieldNaming) -> Self {
        self.naming = naming;
        self
    }

    fn is_date_field(&self, field: &str) -> bool {
        self.date_fields.iter().any(|f| f == field) || date_field_regex().is_match(field)
    }

    fn target_name(&self, legacy: &str) -> String {
        self.renames
            .get(legacy)
            .cloned()
            .unwrap_or_else(|| self.naming.to_target(legacy))
    }

    fn legacy_name(&self, target: &str) -> String {
        self.renames
            .iter()
            .find(|(_, t)| t.as_str() == target)
            .map_or_else(|| self.naming.to_legacy(target), |(l, _)| l.clone())
    }
}

/// Builder for a [`MappingTable`].
#[derive(Debug, Default)]
pub struct MappingTableBuilder {
    rules: Vec<EntityMappingRule>,
}

impl MappingTableBuilder {
    /// Registers a rule. A later rule for the same type replaces the earlier one.
    #[must_use]
    pub fn rule(mut self, rule: EntityMappingRule) -> Self {
        self.rules.retain(|r| r.entity_type != rule.entity_type);
        self.rules.push(rule);
        self
    }

    /// Validates references and computes the dependency order.
    ///
    /// # Errors
    /// - `UnknownReference` if a foreign key points at an unregistered type
    /// - `DependencyCycle` if types reference each other in a cycle
    pub fn build(self) -> Result<MappingTable, TransformError> {
        let known: BTreeSet<EntityType> = self.rules.iter().map(|r| r.entity_type.clone()).collect();
        for rule in &self.rules {
            for fk in &rule.foreign_keys {
                if !known.contains(&fk.references) {
                    return Err(TransformError::UnknownReference {
                        entity_type: rule.entity_type.clone(),
                        field: fk.field.clone(),
                        references: fk.references.clone(),
                    });
                }
            }
        }

        let order = topological_order(&self.rules)?;
        let rules = self
            .rules
            .into_iter()
            .map(|r| (r.entity_type.clone(), r))
            .collect();
        Ok(MappingTable { rules, order })
    }
}

/// Kahn's algorithm, breaking ties by registration order. Self-references are
/// ignored.
fn topological_order(rules: &[EntityMappingRule]) -> Result<Vec<EntityType>, TransformError> {
    let mut pending: Vec<(&EntityType, BTreeSet<&EntityType>)> = rules
        .iter()
        .map(|r| {
            let deps = r
                .foreign_keys
                .iter()
                .map(|fk| &fk.references)
                .filter(|t| **t != r.entity_type)
                .collect();
            (&r.entity_type, deps)
        })
        .collect();

    let mut order: Vec<EntityType> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let Some(pos) = pending.iter().position(|(_, deps)| deps.is_empty()) else {
            let cycle: Vec<String> = pending.iter().map(|(t, _)| t.to_string()).collect();
            return Err(TransformError::DependencyCycle(cycle.join(", ")));
        };
        let (ready, _) = pending.remove(pos);
        for (_, deps) in &mut pending {
            deps.remove(ready);
        }
        order.push(ready.clone());
    }
    Ok(order)
}

/// Static mapping rules for every migrated entity type.
#[derive(Debug, Clone)]
pub struct MappingTable {
    rules: BTreeMap<EntityType, EntityMappingRule>,
    order: Vec<EntityType>,
}

impl MappingTable {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> MappingTableBuilder {
        MappingTableBuilder::default()
    }

    /// Built-in rules for the application's entity types.
    #[must_use]
    pub fn standard() -> Self {
        let rules = vec![
            EntityMappingRule::new(EntityType::Clients)
                .rename("fullName", "name")
                .rename("phoneNumber", "phone")
                .default_value("status", "active")
                .required("name"),
            EntityMappingRule::new(EntityType::Cases)
                .rename("caseTitle", "title")
                .rename("clientId", "client_id")
                .default_value("status", "open")
                .required("client_id")
                .foreign_key("client_id", EntityType::Clients),
            EntityMappingRule::new(EntityType::Tasks)
                .rename("taskName", "title")
                .rename("caseId", "case_id")
                .default_value("status", "pending")
                .default_value("priority", "medium")
                .required("title")
                .foreign_key("case_id", EntityType::Cases)
                .foreign_key("client_id", EntityType::Clients)
                .foreign_key("parent_task_id", EntityType::Tasks),
            EntityMappingRule::new(EntityType::Documents)
                .rename("fileName", "name")
                .rename("caseId", "case_id")
                .required("name")
                .foreign_key("case_id", EntityType::Cases)
                .foreign_key("client_id", EntityType::Clients)
                .date_field("received"),
            EntityMappingRule::new(EntityType::Invoices)
                .rename("clientId", "client_id")
                .rename("caseId", "case_id")
                .default_value("status", "draft")
                .required("client_id")
                .foreign_key("client_id", EntityType::Clients)
                .foreign_key("case_id", EntityType::Cases),
        ];

        let mut builder = Self::builder();
        for rule in rules {
            builder = builder.rule(rule);
        }
        builder
            .build()
            .expect("standard rules are acyclic and closed over their references")
    }

    /// Returns the rule for an entity type, if registered.
    #[must_use]
    pub fn rule(&self, entity_type: &EntityType) -> Option<&EntityMappingRule> {
        self.rules.get(entity_type)
    }

    /// Returns true if a rule exists for the type.
    #[must_use]
    pub fn contains(&self, entity_type: &EntityType) -> bool {
        self.rules.contains_key(entity_type)
    }

    /// Entity types in migration order: every type comes after the types it
    /// references.
    #[must_use]
    pub fn dependency_order(&self) -> &[EntityType] {
        &self.order
    }

    /// Turns a legacy row into a target record.
    ///
    /// Applies renames and the naming convention, fills defaults, canonicalizes
    /// date fields to RFC 3339 UTC, normalizes id and foreign-key values to
    /// strings, and derives a deterministic id when the row has none. Types
    /// without a registered rule use an empty rule.
    ///
    /// # Errors
    /// - `InvalidIdentifier` if the id or a foreign key is not a string or integer
    /// - `InvalidDate` if a date field cannot be parsed
    pub fn transform(
        &self,
        entity_type: &EntityType,
        legacy: &EntityRecord,
    ) -> Result<EntityRecord, TransformError> {
        let fallback;
        let rule = match self.rules.get(entity_type) {
            Some(rule) => rule,
            None => {
                fallback = EntityMappingRule::new(entity_type.clone());
                &fallback
            }
        };

        let mut source = legacy.fields.clone();
        let raw_id = source.remove(ID_FIELD);
        let id = match (&legacy.id, raw_id) {
            (Some(id), _) => id.clone(),
            (None, Some(value)) => match normalize_identifier(ID_FIELD, &value)? {
                Some(id) => RecordId::new(id),
                None => derive_id(entity_type, &source),
            },
            (None, None) => derive_id(entity_type, &source),
        };

        // Convention names first, explicit renames second so they win collisions.
        let mut fields = Fields::new();
        for (name, value) in &source {
            if !rule.renames.contains_key(name) {
                fields.insert(rule.naming.to_target(name), value.clone());
            }
        }
        for (name, value) in &source {
            if rule.renames.contains_key(name) {
                fields.insert(rule.target_name(name), value.clone());
            }
        }

        for (name, value) in &rule.defaults {
            let missing = fields.get(name).map_or(true, Value::is_null);
            if missing {
                fields.insert(name.clone(), value.clone());
            }
        }

        for (name, value) in &mut fields {
            if rule.is_date_field(name) {
                *value = canonical_date(name, value)?;
            }
        }

        for fk in &rule.foreign_keys {
            if let Some(value) = fields.get_mut(&fk.field) {
                *value = normalize_reference(&fk.field, value)?;
            }
        }

        Ok(EntityRecord {
            id: Some(id),
            fields,
        })
    }

    /// Maps a target record back to legacy field names.
    ///
    /// Values are left in their canonical form, which `transform` accepts, so
    /// `transform(inverse_transform(transform(r))) == transform(r)`.
    ///
    /// # Errors
    /// Never fails today; the signature leaves room for lossy mappings.
    pub fn inverse_transform(
        &self,
        entity_type: &EntityType,
        target: &EntityRecord,
    ) -> Result<EntityRecord, TransformError> {
        let fallback;
        let rule = match self.rules.get(entity_type) {
            Some(rule) => rule,
            None => {
                fallback = EntityMappingRule::new(entity_type.clone());
                &fallback
            }
        };

        let fields = target
            .fields
            .iter()
            .filter(|(name, _)| name.as_str() != ID_FIELD)
            .map(|(name, value)| (rule.legacy_name(name), value.clone()))
            .collect();
        Ok(EntityRecord {
            id: target.id.clone(),
            fields,
        })
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Derives a stable id from the entity type and the row's canonical JSON.
fn derive_id(entity_type: &EntityType, fields: &Fields) -> RecordId {
    let mut name = String::new();
    name.push_str(entity_type.as_str());
    name.push(':');
    write_canonical(&Value::Object(fields.clone()), &mut name);
    RecordId::new(Uuid::new_v5(&LEGACY_ID_NAMESPACE, name.as_bytes()).to_string())
}

/// JSON with object keys sorted at every level, independent of map ordering.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// `Ok(None)` means "no usable id": null or empty string.
fn normalize_identifier(field: &str, value: &Value) -> Result<Option<String>, TransformError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(Some(n.to_string())),
        other => Err(TransformError::InvalidIdentifier {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}

fn normalize_reference(field: &str, value: &Value) -> Result<Value, TransformError> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| normalize_reference(field, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(normalize_identifier(field, other)?.map_or(Value::Null, Value::String)),
    }
}

fn format_canonical(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn from_epoch_millis(field: &str, millis: i64) -> Result<Value, TransformError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(format_canonical)
        .ok_or_else(|| TransformError::InvalidDate {
            field: field.to_string(),
            value: millis.to_string(),
        })
}

/// Parses the date shapes found in legacy data and renders them canonically.
fn canonical_date(field: &str, value: &Value) -> Result<Value, TransformError> {
    let invalid = || TransformError::InvalidDate {
        field: field.to_string(),
        value: value.to_string(),
    };

    match value {
        Value::Null => Ok(Value::Null),
        Value::Number(n) => n.as_i64().map_or_else(|| Err(invalid()), |ms| from_epoch_millis(field, ms)),
        Value::String(raw) => {
            let s = raw.trim();
            if s.is_empty() {
                return Ok(Value::Null);
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(format_canonical(dt.with_timezone(&Utc)));
            }
            for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(format_canonical(naive.and_utc()));
                }
            }
            for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
                if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(invalid)?;
                    return Ok(format_canonical(midnight.and_utc()));
                }
            }
            if s.chars().all(|c| c.is_ascii_digit()) {
                let ms: i64 = s.parse().map_err(|_| invalid())?;
                return from_epoch_millis(field, ms);
            }
            Err(invalid())
        }
        _ => Err(invalid()),
    }
}
