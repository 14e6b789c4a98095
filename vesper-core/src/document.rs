//! Documents, write operations and committed change records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{VesperError, VesperResult};

/// Collections whose names start with this prefix are reserved for internal
/// bookkeeping and never feed the enrichment pipeline.
pub const RESERVED_COLLECTION_PREFIX: char = '_';

/// Returns true for internal collections such as the enrichment queue.
pub fn is_reserved_collection(collection: &str) -> bool {
    collection.starts_with(RESERVED_COLLECTION_PREFIX)
}

/// Longest accepted collection or field name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Longest accepted document id, in bytes.
pub const MAX_DOCUMENT_ID_LEN: usize = 255;

/// Characters used as separators in storage and queue keys.
const KEY_SEPARATORS: [char; 2] = ['\0', '\u{1f}'];

fn check_key_part(argument: &str, value: &str, max_len: usize) -> VesperResult<()> {
    if value.len() > max_len {
        return Err(VesperError::invalid_argument(
            argument,
            format!("longer than {} bytes", max_len),
        ));
    }
    if value.contains(KEY_SEPARATORS) {
        return Err(VesperError::invalid_argument(
            argument,
            "contains a control separator character",
        ));
    }
    Ok(())
}

/// Check a collection name before it becomes part of a storage key.
pub fn validate_collection_name(collection: &str) -> VesperResult<()> {
    if collection.is_empty() {
        return Err(VesperError::invalid_argument("collection", "must not be empty"));
    }
    check_key_part("collection", collection, MAX_NAME_LEN)
}

/// Check an indexed or enriched field name.
pub fn validate_field_name(field: &str) -> VesperResult<()> {
    if field.is_empty() {
        return Err(VesperError::invalid_argument("field", "must not be empty"));
    }
    check_key_part("field", field, MAX_NAME_LEN)
}

/// Check a caller-supplied document id. The empty id is accepted and
/// replaced on insert.
pub fn validate_document_id(id: &str) -> VesperResult<()> {
    check_key_part("document_id", id, MAX_DOCUMENT_ID_LEN)
}

/// A schemaless JSON document addressed by id within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// A document whose id will be assigned on insert.
    pub fn unidentified() -> Self {
        Self::new(String::new())
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Assign a UUIDv7 id if none was supplied.
    pub fn ensure_id(&mut self) -> &str {
        if self.id.is_empty() {
            self.id = Uuid::now_v7().to_string();
        }
        &self.id
    }

    /// Read a numeric array field as a vector.
    pub fn vector_field(&self, name: &str) -> Option<Vec<f32>> {
        let values = self.fields.get(name)?.as_array()?;
        values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect()
    }
}

/// Kind of committed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Inserts and updates carry content; deletes do not.
    pub fn carries_content(&self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }
}

/// One committed change: what happened to which document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub collection: String,
    pub document_id: String,
}

impl ChangeRecord {
    pub fn new(kind: ChangeKind, collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            kind,
            collection: collection.into(),
            document_id: document_id.into(),
        }
    }
}

/// A single staged mutation, applied atomically with its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert { collection: String, doc: Document },
    Update { collection: String, doc: Document },
    Delete { collection: String, id: String },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            Self::Insert { collection, .. }
            | Self::Update { collection, .. }
            | Self::Delete { collection, .. } => collection,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Self::Insert { doc, .. } | Self::Update { doc, .. } => &doc.id,
            Self::Delete { id, .. } => id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Which document fields feed the enrichment function and where the
/// resulting vector is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentRule {
    pub source_fields: Vec<String>,
    pub target_field: String,
}

impl EnrichmentRule {
    pub fn new(source_fields: Vec<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_fields,
            target_field: target_field.into(),
        }
    }

    /// Join the string values of the source fields with newlines.
    ///
    /// Returns `None` when no source field holds any text.
    pub fn source_text(&self, doc: &Document) -> Option<String> {
        let parts: Vec<&str> = self
            .source_fields
            .iter()
            .filter_map(|f| doc.get(f).and_then(Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Digest of what this rule reads from and writes to `doc`: the source
    /// text and the current target value.
    ///
    /// Two states with the same fingerprint need no new enrichment.
    /// Returns `None` when the document has no source text.
    pub fn fingerprint(&self, doc: &Document) -> Option<String> {
        let text = self.source_text(doc)?;
        let target = doc.get(&self.target_field).unwrap_or(&Value::Null);
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.target_field.as_bytes());
        hasher.update([0u8]);
        hasher.update(target.to_string().as_bytes());
        Some(hex::encode(hasher.finalize()))
    }
}

/// Field metadata registered on a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Fields with a secondary index.
    #[serde(default)]
    pub indexes: Vec<String>,
    /// Present when documents of this collection are enriched.
    #[serde(default)]
    pub enrichment: Option<EnrichmentRule>,
}

impl CollectionMetadata {
    pub fn is_indexed(&self, field: &str) -> bool {
        self.indexes.iter().any(|f| f == field)
    }
}
