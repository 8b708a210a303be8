//! # Schema Registry
//!
//! Store of typed schemas per event type and version. The registry
//! validates event payloads, enforces version compatibility rules on
//! registration, and migrates payloads between versions through
//! host-registered migration steps.
//!
//! Version ordering is lexicographic by default, which is correct for
//! zero-padded `MAJOR.MINOR.PATCH` strings; hosts using another scheme
//! inject a comparator via [`SchemaRegistry::with_version_comparator`].

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::DateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SchemaRegistryConfig;
use crate::error::{EventBusError, Result};
use crate::event::{headers, Event};

/// Compatibility rule constraining how new schema versions may differ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityMode {
    /// New schema must accept data written for the old schema
    Backward,
    /// Old schema must accept data written for the new schema
    Forward,
    /// Both backward and forward
    Full,
    /// Skip compatibility checking
    None,
}

/// Closed set of field types understood by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    String,
    Integer,
    Long,
    Double,
    Boolean,
    Timestamp,
    Uuid,
    Object,
    Array,
    Map,
    Any,
}

impl FieldType {
    /// Whether a change from `self` to `target` is a compatible widening
    pub fn widens_to(&self, target: FieldType) -> bool {
        if *self == target {
            return true;
        }
        matches!(
            (*self, target),
            (FieldType::Integer, FieldType::Long)
                | (FieldType::Integer, FieldType::Double)
                | (FieldType::Long, FieldType::Double)
                | (_, FieldType::Any)
                | (FieldType::Any, _)
        )
    }
}

/// Definition of a single payload field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Field type from the closed set
    pub field_type: FieldType,

    /// Whether the field must be present
    pub required: bool,

    /// Free-form documentation
    pub description: Option<String>,
}

impl FieldDefinition {
    /// A required field of the given type
    pub fn required(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: true,
            description: None,
        }
    }

    /// An optional field of the given type
    pub fn optional(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            description: None,
        }
    }

    /// Attach documentation
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Versioned contract describing the fields an event payload must have
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSchema {
    /// Event type this schema describes
    pub event_type: String,

    /// Schema version
    pub version: String,

    /// Free-form documentation
    pub description: Option<String>,

    /// Field definitions by field name
    pub fields: BTreeMap<String, FieldDefinition>,

    /// Compatibility rule override; the registry default applies when unset
    pub compatibility: Option<CompatibilityMode>,

    /// Additional schema metadata
    pub metadata: HashMap<String, String>,
}

impl EventSchema {
    pub fn new(event_type: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            version: version.into(),
            description: None,
            fields: BTreeMap::new(),
            compatibility: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    pub fn with_required_field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.with_field(name, FieldDefinition::required(field_type))
    }

    pub fn with_optional_field(self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.with_field(name, FieldDefinition::optional(field_type))
    }

    pub fn with_compatibility(mut self, mode: CompatibilityMode) -> Self {
        self.compatibility = Some(mode);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Names of the required fields
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, def)| def.required)
            .map(|(name, _)| name.as_str())
    }
}

/// Kinds of validation findings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    MissingRequiredField,
    InvalidType,
    InvalidValue,
    UnknownField,
    SchemaMismatch,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationErrorKind::MissingRequiredField => write!(f, "missing_required_field"),
            ValidationErrorKind::InvalidType => write!(f, "invalid_type"),
            ValidationErrorKind::InvalidValue => write!(f, "invalid_value"),
            ValidationErrorKind::UnknownField => write!(f, "unknown_field"),
            ValidationErrorKind::SchemaMismatch => write!(f, "schema_mismatch"),
        }
    }
}

/// Single validation finding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub kind: ValidationErrorKind,
    pub field: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn new(kind: ValidationErrorKind, field: Option<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field,
            message: message.into(),
        }
    }

    /// Compact rendering used in error messages
    pub fn summary(&self) -> String {
        match &self.field {
            Some(field) => format!("{}: {}", self.kind, field),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

/// Outcome of validating one event against its schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Whether the event passed validation
    pub valid: bool,

    /// Event type that was validated
    pub event_type: String,

    /// Schema version the event was validated against, if resolved
    pub version: Option<String>,

    /// Findings that fail validation
    pub errors: Vec<ValidationIssue>,

    /// Findings reported but not failing validation
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn passed(event_type: &str, version: Option<String>) -> Self {
        Self {
            valid: true,
            event_type: event_type.to_string(),
            version,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Compact renderings of the failing findings
    pub fn error_summaries(&self) -> Vec<String> {
        self.errors.iter().map(ValidationIssue::summary).collect()
    }
}

/// Payload migration step supplied by the host
pub type MigrationFn =
    Arc<dyn Fn(serde_json::Value) -> std::result::Result<serde_json::Value, String> + Send + Sync>;

/// Total order on version strings supplied by the host
pub type VersionComparator = Arc<dyn Fn(&str, &str) -> CmpOrdering + Send + Sync>;

/// Registry of versioned event schemas
pub struct SchemaRegistry {
    config: SchemaRegistryConfig,
    /// Per event type, versions kept sorted ascending by the comparator
    schemas: DashMap<String, Vec<(String, Arc<EventSchema>)>>,
    comparator: VersionComparator,
    migrations: DashMap<String, MigrationFn>,
    path_cache: DashMap<String, Vec<String>>,
}

fn step_key(event_type: &str, from: &str, to: &str) -> String {
    format!("{}|{}|{}", event_type, from, to)
}

impl SchemaRegistry {
    pub fn new(config: SchemaRegistryConfig) -> Self {
        Self {
            config,
            schemas: DashMap::new(),
            comparator: Arc::new(|a, b| a.cmp(b)),
            migrations: DashMap::new(),
            path_cache: DashMap::new(),
        }
    }

    /// Replace the lexicographic default with a host-supplied version order
    pub fn with_version_comparator(mut self, comparator: VersionComparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Register a schema, enforcing uniqueness and compatibility
    pub fn register(&self, schema: EventSchema) -> Result<()> {
        if schema.event_type.is_empty() {
            return Err(EventBusError::configuration("schema event_type is empty"));
        }
        if schema.version.is_empty() {
            return Err(EventBusError::configuration("schema version is empty"));
        }
        if schema.fields.keys().any(|name| name.is_empty()) {
            return Err(EventBusError::configuration(
                "schema contains an empty field name",
            ));
        }

        let mut versions = self.schemas.entry(schema.event_type.clone()).or_default();

        if versions.iter().any(|(v, _)| *v == schema.version) {
            return Err(EventBusError::configuration(format!(
                "schema {} v{} is already registered",
                schema.event_type, schema.version
            )));
        }

        if !versions.is_empty() {
            if !self.config.allow_schema_evolution {
                return Err(EventBusError::configuration(format!(
                    "schema evolution is disabled; {} already has a registered version",
                    schema.event_type
                )));
            }

            if self.config.enforce_compatibility {
                if let Some((latest_version, latest)) =
                    versions.last().map(|(v, s)| (v.clone(), s.clone()))
                {
                    let mode = schema
                        .compatibility
                        .unwrap_or(self.config.default_compatibility);
                    let problems = self.check_compatibility(&latest, &schema, mode);
                    if !problems.is_empty() {
                        return Err(EventBusError::SchemaIncompatible {
                            event_type: schema.event_type.clone(),
                            latest: latest_version,
                            candidate: schema.version.clone(),
                            message: problems.join("; "),
                        });
                    }
                }
            }
        }

        let comparator = self.comparator.clone();
        let position = match versions.binary_search_by(|(v, _)| comparator(v, &schema.version)) {
            Ok(position) | Err(position) => position,
        };
        let version = schema.version.clone();
        versions.insert(position, (version.clone(), Arc::new(schema)));

        info!(
            event_type = %versions.key(),
            version = %version,
            "registered schema"
        );
        Ok(())
    }

    /// Schema for the given type and version
    pub fn get(&self, event_type: &str, version: &str) -> Option<Arc<EventSchema>> {
        self.schemas.get(event_type).and_then(|versions| {
            versions
                .iter()
                .find(|(v, _)| v == version)
                .map(|(_, s)| s.clone())
        })
    }

    /// Latest registered schema for the given type
    pub fn get_latest(&self, event_type: &str) -> Option<Arc<EventSchema>> {
        self.schemas
            .get(event_type)
            .and_then(|versions| versions.last().map(|(_, s)| s.clone()))
    }

    /// Registered versions for the given type, ascending
    pub fn versions(&self, event_type: &str) -> Vec<String> {
        self.schemas
            .get(event_type)
            .map(|versions| versions.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Event types with at least one registered schema
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.schemas.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    /// Validate an event against its schema
    ///
    /// The schema is resolved from the `schemaVersion` header, or the
    /// latest version when the header is absent.
    pub fn validate(&self, event: &Event) -> ValidationResult {
        let requested = event.schema_version().map(str::to_string);

        let schema = match &requested {
            Some(version) => match self.get(&event.event_type, version) {
                Some(schema) => schema,
                None => {
                    let mut result = ValidationResult::passed(&event.event_type, requested.clone());
                    result.valid = false;
                    result.errors.push(ValidationIssue::new(
                        ValidationErrorKind::SchemaMismatch,
                        None,
                        format!(
                            "schema version {} is not registered for {}",
                            version, event.event_type
                        ),
                    ));
                    return result;
                }
            },
            None => match self.get_latest(&event.event_type) {
                Some(schema) => schema,
                None => {
                    let mut result = ValidationResult::passed(&event.event_type, None);
                    result.warnings.push(ValidationIssue::new(
                        ValidationErrorKind::SchemaMismatch,
                        None,
                        format!("no schema registered for {}", event.event_type),
                    ));
                    return result;
                }
            },
        };

        let mut result = ValidationResult::passed(&event.event_type, Some(schema.version.clone()));

        let payload = match event.data.as_object() {
            Some(payload) => payload,
            None => {
                if schema.fields.is_empty() {
                    return result;
                }
                result.valid = false;
                result.errors.push(ValidationIssue::new(
                    ValidationErrorKind::SchemaMismatch,
                    None,
                    "payload is not a JSON object",
                ));
                return result;
            }
        };

        for (name, definition) in &schema.fields {
            match payload.get(name) {
                None => {
                    if definition.required {
                        result.errors.push(ValidationIssue::new(
                            ValidationErrorKind::MissingRequiredField,
                            Some(name.clone()),
                            format!("required field {} is missing", name),
                        ));
                    }
                }
                Some(value) if value.is_null() => {
                    if definition.required {
                        result.errors.push(ValidationIssue::new(
                            ValidationErrorKind::MissingRequiredField,
                            Some(name.clone()),
                            format!("required field {} is null", name),
                        ));
                    }
                }
                Some(value) => {
                    if let Err(issue) = check_field_value(name, definition.field_type, value) {
                        result.errors.push(issue);
                    }
                }
            }
        }

        for name in payload.keys() {
            if !schema.fields.contains_key(name) {
                let issue = ValidationIssue::new(
                    ValidationErrorKind::UnknownField,
                    Some(name.clone()),
                    format!("field {} is not defined by the schema", name),
                );
                if self.config.strict_validation {
                    result.errors.push(issue);
                } else {
                    result.warnings.push(issue);
                }
            }
        }

        result.valid = result.errors.is_empty();
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            valid = result.valid,
            errors = result.errors.len(),
            "validated event"
        );
        result
    }

    /// Whether moving from one registered version to another satisfies
    /// the configured compatibility rule
    pub fn is_compatible(&self, event_type: &str, from: &str, to: &str) -> Result<bool> {
        let old = self
            .get(event_type, from)
            .ok_or_else(|| EventBusError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: Some(from.to_string()),
            })?;
        let new = self
            .get(event_type, to)
            .ok_or_else(|| EventBusError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: Some(to.to_string()),
            })?;

        let mode = new.compatibility.unwrap_or(self.config.default_compatibility);
        Ok(self.check_compatibility(&old, &new, mode).is_empty())
    }

    /// Register a migration step between two adjacent versions
    pub fn register_migration(
        &self,
        event_type: &str,
        from: &str,
        to: &str,
        migration: MigrationFn,
    ) {
        self.migrations
            .insert(step_key(event_type, from, to), migration);
    }

    /// Migrate an event's payload to the target version
    ///
    /// The version path is monotonic along the ordered version list;
    /// every adjacent step must have a registered migration. Paths are
    /// cached up to the configured bound.
    pub fn migrate_to_version(&self, event: &Event, target: &str) -> Result<Event> {
        let current = event
            .schema_version()
            .unwrap_or(event.version.as_str())
            .to_string();

        if current == target {
            return Ok(event
                .clone()
                .with_header(headers::SCHEMA_VERSION, target.to_string()));
        }

        let path = self.version_path(&event.event_type, &current, target)?;

        let mut data = event.data.clone();
        for pair in path.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let migration = self
                .migrations
                .get(&step_key(&event.event_type, from, to))
                .map(|m| m.value().clone())
                .ok_or_else(|| EventBusError::MigrationFailed {
                    event_type: event.event_type.clone(),
                    from: from.clone(),
                    to: to.clone(),
                    message: "no migration registered for this step".to_string(),
                })?;

            data = migration(data).map_err(|message| EventBusError::MigrationFailed {
                event_type: event.event_type.clone(),
                from: from.clone(),
                to: to.clone(),
                message,
            })?;
        }

        Ok(event
            .clone()
            .with_data(data)
            .with_version(target.to_string())
            .with_header(headers::SCHEMA_VERSION, target.to_string()))
    }

    fn version_path(&self, event_type: &str, from: &str, to: &str) -> Result<Vec<String>> {
        let cache_key = step_key(event_type, from, to);
        if let Some(path) = self.path_cache.get(&cache_key) {
            return Ok(path.clone());
        }

        let versions = self.versions(event_type);
        if versions.is_empty() {
            return Err(EventBusError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: None,
            });
        }

        let from_index = versions.iter().position(|v| v == from).ok_or_else(|| {
            EventBusError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: Some(from.to_string()),
            }
        })?;
        let to_index = versions.iter().position(|v| v == to).ok_or_else(|| {
            EventBusError::SchemaNotFound {
                event_type: event_type.to_string(),
                version: Some(to.to_string()),
            }
        })?;

        let path: Vec<String> = if from_index <= to_index {
            versions[from_index..=to_index].to_vec()
        } else {
            let mut descending = versions[to_index..=from_index].to_vec();
            descending.reverse();
            descending
        };

        if self.path_cache.len() >= self.config.max_cache_size {
            self.path_cache.clear();
        }
        self.path_cache.insert(cache_key, path.clone());
        Ok(path)
    }

    /// Compatibility problems between an old and a new schema; empty
    /// when the pair satisfies the rule
    fn check_compatibility(
        &self,
        old: &EventSchema,
        new: &EventSchema,
        mode: CompatibilityMode,
    ) -> Vec<String> {
        match mode {
            CompatibilityMode::None => Vec::new(),
            CompatibilityMode::Backward => self.check_backward(old, new),
            CompatibilityMode::Forward => self.check_forward(old, new),
            CompatibilityMode::Full => {
                let mut problems = self.check_backward(old, new);
                problems.extend(self.check_forward(old, new));
                problems
            }
        }
    }

    /// New schema must accept data written for the old schema
    fn check_backward(&self, old: &EventSchema, new: &EventSchema) -> Vec<String> {
        let mut problems = Vec::new();

        if !self.config.allow_required_field_additions {
            for (name, definition) in &new.fields {
                if !definition.required {
                    continue;
                }
                let was_required = old
                    .fields
                    .get(name)
                    .map(|d| d.required)
                    .unwrap_or(false);
                if !was_required {
                    problems.push(format!("new required field {} breaks old data", name));
                }
            }
        }

        if !self.config.allow_field_removals {
            for name in old.fields.keys() {
                if !new.fields.contains_key(name) {
                    problems.push(format!("field {} was removed", name));
                }
            }
        }

        for (name, old_def) in &old.fields {
            if let Some(new_def) = new.fields.get(name) {
                if !self.config.allow_field_type_changes
                    && !old_def.field_type.widens_to(new_def.field_type)
                {
                    problems.push(format!(
                        "field {} changed type {:?} -> {:?}",
                        name, old_def.field_type, new_def.field_type
                    ));
                }
            }
        }

        problems
    }

    /// Old schema must accept data written for the new schema
    fn check_forward(&self, old: &EventSchema, new: &EventSchema) -> Vec<String> {
        let mut problems = Vec::new();

        for (name, definition) in &new.fields {
            if definition.required && !old.fields.contains_key(name) {
                problems.push(format!("new required field {} is unknown to old readers", name));
            }
        }

        if !self.config.allow_extra_fields {
            for name in new.fields.keys() {
                if !old.fields.contains_key(name) {
                    problems.push(format!("added field {} is unknown to old readers", name));
                }
            }
        }

        for (name, old_def) in &old.fields {
            if old_def.required {
                let still_required = new
                    .fields
                    .get(name)
                    .map(|d| d.required)
                    .unwrap_or(false);
                if !still_required {
                    problems.push(format!(
                        "field {} is required by old readers but no longer guaranteed",
                        name
                    ));
                }
            }

            if let Some(new_def) = new.fields.get(name) {
                if !self.config.allow_field_type_changes
                    && !new_def.field_type.widens_to(old_def.field_type)
                {
                    problems.push(format!(
                        "field {} written as {:?} is unreadable as {:?}",
                        name, new_def.field_type, old_def.field_type
                    ));
                }
            }
        }

        problems
    }
}

/// Validate the runtime shape of one present field
fn check_field_value(
    name: &str,
    field_type: FieldType,
    value: &serde_json::Value,
) -> std::result::Result<(), ValidationIssue> {
    let type_error = |expected: &str| {
        Err(ValidationIssue::new(
            ValidationErrorKind::InvalidType,
            Some(name.to_string()),
            format!("field {} must be {}", name, expected),
        ))
    };

    match field_type {
        FieldType::Any => Ok(()),
        FieldType::String => {
            if value.is_string() {
                Ok(())
            } else {
                type_error("a string")
            }
        }
        FieldType::Boolean => {
            if value.is_boolean() {
                Ok(())
            } else {
                type_error("a boolean")
            }
        }
        FieldType::Integer => match value.as_i64() {
            Some(number) if (i32::MIN as i64..=i32::MAX as i64).contains(&number) => Ok(()),
            Some(_) => Err(ValidationIssue::new(
                ValidationErrorKind::InvalidValue,
                Some(name.to_string()),
                format!("field {} is out of 32-bit integer range", name),
            )),
            None => type_error("an integer"),
        },
        FieldType::Long => {
            if value.as_i64().is_some() {
                Ok(())
            } else {
                type_error("an integer")
            }
        }
        FieldType::Double => {
            if value.is_number() {
                Ok(())
            } else {
                type_error("a number")
            }
        }
        FieldType::Timestamp => match value {
            serde_json::Value::Number(number) if number.as_i64().is_some() => Ok(()),
            serde_json::Value::String(text) => {
                if DateTime::parse_from_rfc3339(text).is_ok() {
                    Ok(())
                } else {
                    Err(ValidationIssue::new(
                        ValidationErrorKind::InvalidValue,
                        Some(name.to_string()),
                        format!("field {} is not an RFC 3339 timestamp", name),
                    ))
                }
            }
            _ => type_error("a timestamp string or epoch number"),
        },
        FieldType::Uuid => match value {
            serde_json::Value::String(text) => {
                if Uuid::parse_str(text).is_ok() {
                    Ok(())
                } else {
                    Err(ValidationIssue::new(
                        ValidationErrorKind::InvalidValue,
                        Some(name.to_string()),
                        format!("field {} is not a valid UUID", name),
                    ))
                }
            }
            _ => type_error("a UUID string"),
        },
        FieldType::Object | FieldType::Map => {
            if value.is_object() {
                Ok(())
            } else {
                type_error("an object")
            }
        }
        FieldType::Array => {
            if value.is_array() {
                Ok(())
            } else {
                type_error("an array")
            }
        }
    }
}
