//! Product records, normalized keys and row-level errors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Longest SKU accepted, in characters.
pub const MAX_SKU_LEN: usize = 100;
/// Longest product name accepted, in characters.
pub const MAX_NAME_LEN: usize = 255;
/// Longest raw-row excerpt kept on a [`RowError`].
pub const EXCERPT_LEN: usize = 200;

/// Case-insensitive unique key of a product: trimmed and lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkuKey(String);

impl SkuKey {
    pub fn normalize(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SkuKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A product as written to the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    /// SKU as written by the last row that touched it (trimmed).
    pub sku: String,
    pub key: SkuKey,
    pub name: String,
    pub description: String,
    pub active: bool,
    /// Every column that is not one of `sku`, `name`, `description`, `active`.
    pub attributes: BTreeMap<String, String>,
}

impl ProductRecord {
    pub fn new(sku: impl Into<String>, name: impl Into<String>) -> Self {
        let sku = sku.into().trim().to_string();
        Self {
            key: SkuKey::normalize(&sku),
            sku,
            name: name.into(),
            description: String::new(),
            active: true,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_attribute(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(column.into(), value.into());
        self
    }

    /// Short, comma-joined rendering used when the record has to be reported as an error.
    pub fn excerpt(&self) -> String {
        let mut parts = vec![
            self.sku.as_str(),
            self.name.as_str(),
            self.description.as_str(),
            if self.active { "true" } else { "false" },
        ];
        parts.extend(self.attributes.values().map(String::as_str));
        truncate_excerpt(&parts.join(","))
    }
}

/// Parse the boolean-like `active` column. Blank means `true`.
pub fn parse_active(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" | "y" | "t" | "on" => Some(true),
        "false" | "0" | "no" | "n" | "f" | "off" => Some(false),
        _ => None,
    }
}

/// Why a single row was not imported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorKind {
    ColumnCount,
    Encoding,
    MissingKey,
    MissingField,
    InvalidField,
    FieldTooLong,
    StoreWrite,
    StoreUnavailable,
}

impl RowErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ColumnCount => "column_count",
            Self::Encoding => "encoding",
            Self::MissingKey => "missing_key",
            Self::MissingField => "missing_field",
            Self::InvalidField => "invalid_field",
            Self::FieldTooLong => "field_too_long",
            Self::StoreWrite => "store_write",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

impl fmt::Display for RowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row that could not be imported.
///
/// `ordinal` counts non-blank lines from 1 with the header as line 1, so the
/// first data row is 2. `line` is the physical line in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub ordinal: u64,
    pub line: u64,
    pub excerpt: String,
    pub reason: RowErrorKind,
    pub message: String,
}

impl RowError {
    pub fn new(
        ordinal: u64,
        line: u64,
        excerpt: impl AsRef<str>,
        reason: RowErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ordinal,
            line,
            excerpt: truncate_excerpt(excerpt.as_ref()),
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row {}: {} ({})", self.ordinal, self.message, self.reason)
    }
}

pub(crate) fn truncate_excerpt(raw: &str) -> String {
    if raw.chars().count() <= EXCERPT_LEN {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(EXCERPT_LEN - 3).collect();
    out.push_str("...");
    out
}
