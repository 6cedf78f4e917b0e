//! Core domain types shared by every enricher crate.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque identifier of a record in the record store.
    RecordId
);
string_id!(
    /// Identifier of the schema (record type) a record or field belongs to.
    SchemaId
);
string_id!(
    /// Identifier of a field definition.
    FieldId
);
string_id!(
    /// Identifier of a canonical value of an enumerable field.
    TermId
);

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

/// Storage type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text.
    Text,
    /// A web address.
    Url,
    /// A reference to an uploaded file.
    File,
    /// Values drawn from a managed list of canonical terms.
    Enumerable,
    Number,
    Date,
    Flag,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Url => "url",
            Self::File => "file",
            Self::Enumerable => "enumerable",
            Self::Number => "number",
            Self::Date => "date",
            Self::Flag => "flag",
        }
    }

    /// Whether results may be written into a field of this kind.
    pub fn is_destination(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::Enumerable | Self::Number | Self::Date | Self::Flag
        )
    }

    /// Whether a field of this kind can yield subjects.
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Text | Self::Url | Self::File)
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "url" => Ok(Self::Url),
            "file" => Ok(Self::File),
            "enumerable" => Ok(Self::Enumerable),
            "number" => Ok(Self::Number),
            "date" => Ok(Self::Date),
            "flag" => Ok(Self::Flag),
            other => Err(format!("unknown field kind '{other}'")),
        }
    }
}

/// Definition of a field within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: FieldId,
    pub schema: SchemaId,
    /// Display name, unique across the catalog (case-insensitive).
    pub name: String,
    pub kind: FieldKind,
    /// Whether an enumerable field may hold several terms at once.
    #[serde(default)]
    pub multi_valued: bool,
}

/// A value held by a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Terms(Vec<TermId>),
    Number(f64),
    Date(NaiveDate),
    Flag(bool),
}

impl FieldValue {
    /// Whether the value counts as "holding something" for the additive-only rule.
    pub fn is_set(&self) -> bool {
        match self {
            Self::Text(s) => !s.trim().is_empty(),
            Self::Terms(ids) => !ids.is_empty(),
            Self::Number(_) | Self::Date(_) | Self::Flag(_) => true,
        }
    }

    /// Plain-text view, used when a field acts as a subject source.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Current values of one record, keyed by field.
pub type RecordValues = HashMap<FieldId, FieldValue>;

/// External classification results: category name → result values.
pub type ResultMap = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Subjects
// ---------------------------------------------------------------------------

/// What a subject key was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A canonicalized web address.
    Url,
    /// A (file, question) pair for document analysis.
    Document,
}

/// Canonicalized unit checked against the external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Canonical key; identity for the recheck cache.
    pub key: String,
    pub kind: SubjectKind,
    /// Names of the record fields the subject was read from, in
    /// configuration order. Results apply through each field's blocks.
    pub source_fields: Vec<String>,
    /// Extra request parameters forwarded to the transport.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Criteria the Candidate Selector hands to the record store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    /// Schemas whose records are candidates. Empty means none.
    #[serde(default)]
    pub schemas: Vec<SchemaId>,
    /// Only records where at least one of these fields is unset.
    /// Empty means every record of the schemas qualifies.
    #[serde(default)]
    pub missing_fields: Vec<String>,
    /// Upper bound on candidates per selection pass.
    #[serde(default)]
    pub limit: Option<usize>,
}
