//! src/model/record.rs
//! ============================================================================
//! # Point-of-interest records and their identifiers
//!
//! Identifiers arrive from element attributes and are treated as untrusted:
//! every constructor validates length and charset. A record has a durable
//! [`RecordId`] only after the record store confirmed the create; before that
//! the form works under a client-generated [`PlaceholderId`].

use std::fmt;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

const MAX_ID_LEN: usize = 64;
const MAX_NAME_LEN: usize = 120;
const MAX_CATEGORY_LEN: usize = 50;
const MAX_NOTES_LEN: usize = 2000;
const MAX_TAGS: usize = 10;
const MAX_TAG_LEN: usize = 30;

/// Rejected identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} '{value}' is invalid: {reason}")]
pub struct InvalidId {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

fn check_id(kind: &'static str, value: &str) -> Result<CompactString, InvalidId> {
    let fail = |reason| InvalidId {
        kind,
        value: value.chars().take(MAX_ID_LEN).collect(),
        reason,
    };

    if value.is_empty() {
        return Err(fail("empty"));
    }
    if value.len() > MAX_ID_LEN {
        return Err(fail("too long"));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(fail("unexpected characters"));
    }
    Ok(CompactString::from(value))
}

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(CompactString);

        impl $name {
            pub fn parse(value: &str) -> Result<Self, InvalidId> {
                check_id($kind, value).map(Self)
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = InvalidId;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.into_string()
            }
        }
    };
}

id_type!(
    /// Durable primary key assigned by the record store
    RecordId,
    "record id"
);

id_type!(
    /// Client-side key for a record that has not been persisted yet
    PlaceholderId,
    "placeholder id"
);

id_type!(
    /// Identifies one dialog form
    FormId,
    "form id"
);

impl PlaceholderId {
    /// Fresh random placeholder, e.g. `tmp_V1StGXR8_Z`
    #[must_use]
    pub fn generate() -> Self {
        Self(CompactString::from(format!("tmp_{}", nanoid::nanoid!(10, &nanoid::alphabet::SAFE))))
    }
}

impl FormId {
    /// Form id guarding the delete workflow of one record
    #[must_use]
    pub fn for_delete(id: &RecordId) -> Self {
        Self(CompactString::from(format!("delete-{}", id.as_str())))
    }
}

/// Key attachments are queued under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RecordKey {
    Placeholder(PlaceholderId),
    Durable(RecordId),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placeholder(id) => write!(f, "placeholder:{id}"),
            Self::Durable(id) => write!(f, "record:{id}"),
        }
    }
}

/// Map position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Round to 5 decimal places (about one metre)
    #[must_use]
    pub fn rounded(self) -> Self {
        let round = |v: f64| (v * 100_000.0).round() / 100_000.0;
        Self::new(round(self.lat), round(self.lng))
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Reverse-geocoded address used to fill a form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    #[serde(alias = "formatted_address")]
    pub formatted: String,

    #[serde(default)]
    pub locality: Option<String>,

    #[serde(default)]
    pub country: Option<String>,
}

/// Metadata saved with a point of interest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    pub name: String,

    #[serde(default)]
    pub category: String,

    #[serde(default)]
    pub notes: String,

    #[serde(default)]
    pub address: String,

    pub position: Option<LatLng>,

    #[serde(default)]
    pub rating: Option<u8>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub website: Option<String>,
}

/// Single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: CompactString,
    pub message: CompactString,
}

impl FieldError {
    pub fn new(field: impl Into<CompactString>, message: impl Into<CompactString>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl RecordData {
    /// Check every field, collecting all failures rather than stopping at the first
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        let name = self.name.trim();
        if name.is_empty() {
            errors.push(FieldError::new("name", "is required"));
        } else if name.chars().count() > MAX_NAME_LEN {
            errors.push(FieldError::new(
                "name",
                format!("must be at most {MAX_NAME_LEN} characters"),
            ));
        }

        if self.category.chars().count() > MAX_CATEGORY_LEN {
            errors.push(FieldError::new(
                "category",
                format!("must be at most {MAX_CATEGORY_LEN} characters"),
            ));
        }

        if self.notes.chars().count() > MAX_NOTES_LEN {
            errors.push(FieldError::new(
                "notes",
                format!("must be at most {MAX_NOTES_LEN} characters"),
            ));
        }

        match self.position {
            None => errors.push(FieldError::new("position", "pick a point on the map")),
            Some(p) if !p.is_valid() => {
                errors.push(FieldError::new("position", "coordinates are out of range"));
            }
            Some(_) => {}
        }

        if let Some(rating) = self.rating
            && !(1..=5).contains(&rating)
        {
            errors.push(FieldError::new("rating", "must be between 1 and 5"));
        }

        if self.tags.len() > MAX_TAGS {
            errors.push(FieldError::new(
                "tags",
                format!("at most {MAX_TAGS} tags are allowed"),
            ));
        }
        if self
            .tags
            .iter()
            .any(|t| t.trim().is_empty() || t.chars().count() > MAX_TAG_LEN)
        {
            errors.push(FieldError::new(
                "tags",
                format!("tags must be 1 to {MAX_TAG_LEN} characters"),
            ));
        }

        if let Some(site) = &self.website
            && !(site.starts_with("https://") || site.starts_with("http://"))
        {
            errors.push(FieldError::new("website", "must start with http:// or https://"));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Snapshot of a dialog form taken when the user presses save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormSubmission {
    pub form_id: FormId,

    /// Present when editing a persisted record
    #[serde(default)]
    pub record_id: Option<RecordId>,

    #[serde(default = "PlaceholderId::generate")]
    pub placeholder: PlaceholderId,

    pub data: RecordData,
}

impl FormSubmission {
    /// Submission for a record that doesn't exist yet
    #[must_use]
    pub fn create(form_id: FormId, placeholder: PlaceholderId, data: RecordData) -> Self {
        Self {
            form_id,
            record_id: None,
            placeholder,
            data,
        }
    }

    /// Submission editing a persisted record
    #[must_use]
    pub fn update(form_id: FormId, record_id: RecordId, data: RecordData) -> Self {
        Self {
            form_id,
            placeholder: PlaceholderId::generate(),
            record_id: Some(record_id),
            data,
        }
    }

    /// Where attachments staged from this form are queued
    #[must_use]
    pub fn attachment_key(&self) -> RecordKey {
        match &self.record_id {
            Some(id) => RecordKey::Durable(id.clone()),
            None => RecordKey::Placeholder(self.placeholder.clone()),
        }
    }
}
