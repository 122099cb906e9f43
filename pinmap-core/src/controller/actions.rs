//! Actions: closed set of user intents built at event capture
//!
//! Element attributes are untrusted. [`Action::capture`] reads them once,
//! validates every identifier and produces an [`Action`]; anything that does
//! not map onto one is a [`CaptureError`] and never reaches the dispatcher.

use std::collections::BTreeMap;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::AppError;
use crate::model::attachments::AttachmentFile;
use crate::model::record::{FormId, FormSubmission, InvalidId, LatLng, PlaceholderId, RecordId, RecordKey};

pub const ATTR_ACTION: &str = "data-action";
pub const ATTR_DISMISS: &str = "data-dismiss";
pub const ATTR_CLOSE: &str = "data-close";
pub const ATTR_ID: &str = "data-id";
pub const ATTR_PLACEHOLDER: &str = "data-placeholder";
pub const ATTR_FORM: &str = "data-form";
pub const ATTR_FILE: &str = "data-file";

/// Raw interaction captured from an element
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementEvent {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Form snapshot, present on submit
    #[serde(default)]
    pub form: Option<FormSubmission>,

    /// Files from a file input or drop
    #[serde(default)]
    pub files: Vec<AttachmentFile>,

    /// Map click position
    #[serde(default)]
    pub coordinates: Option<LatLng>,
}

impl ElementEvent {
    /// Event carrying only `data-action`
    #[must_use]
    pub fn tagged(action: &str) -> Self {
        Self::default().with_attr(ATTR_ACTION, action)
    }

    #[must_use]
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_form(mut self, form: FormSubmission) -> Self {
        self.form = Some(form);
        self
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<AttachmentFile>) -> Self {
        self.files = files;
        self
    }

    #[must_use]
    pub fn with_coordinates(mut self, position: LatLng) -> Self {
        self.coordinates = Some(position);
        self
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, name: &'static str) -> Result<&str, CaptureError> {
        self.attr(name).ok_or(CaptureError::MissingAttribute(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CloseDialog,
    View { id: RecordId },
    Edit { id: RecordId },
    Delete { id: RecordId },
    Save(Box<FormSubmission>),
    Refresh,
    AttachFiles { owner: RecordKey, files: Vec<AttachmentFile> },
    DetachFile { owner: RecordKey, file_name: CompactString },
    MapClicked { form_id: FormId, position: LatLng },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("element carries no action")]
    NoAction,

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),

    #[error("attribute {attribute}: {source}")]
    InvalidId {
        attribute: &'static str,
        #[source]
        source: InvalidId,
    },

    #[error("save without a form snapshot")]
    MissingForm,

    #[error("attach without files")]
    MissingFiles,

    #[error("map click without valid coordinates")]
    InvalidCoordinates,
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        let attribute = match &err {
            CaptureError::MissingAttribute(name) | CaptureError::InvalidId { attribute: name, .. } => *name,
            _ => ATTR_ACTION,
        };
        AppError::invalid_action(attribute, err.to_string())
    }
}

fn parse_id<T>(
    attribute: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Result<T, InvalidId>,
) -> Result<T, CaptureError> {
    parse(value).map_err(|source| CaptureError::InvalidId { attribute, source })
}

impl Action {
    /// Turn a raw element event into an action. Close tags win over
    /// everything else.
    pub fn capture(event: ElementEvent) -> Result<Self, CaptureError> {
        if event.attributes.contains_key(ATTR_DISMISS) || event.attributes.contains_key(ATTR_CLOSE) {
            return Ok(Self::CloseDialog);
        }

        let tag = CompactString::from(event.attr(ATTR_ACTION).ok_or(CaptureError::NoAction)?);
        match tag.as_str() {
            "close" | "dismiss" => Ok(Self::CloseDialog),
            "view" => Ok(Self::View {
                id: Self::record_id(&event)?,
            }),
            "edit" => Ok(Self::Edit {
                id: Self::record_id(&event)?,
            }),
            "delete" => Ok(Self::Delete {
                id: Self::record_id(&event)?,
            }),
            "refresh" => Ok(Self::Refresh),
            "save" => event
                .form
                .map(|form| Self::Save(Box::new(form)))
                .ok_or(CaptureError::MissingForm),
            "attach" => {
                let owner = Self::owner(&event)?;
                if event.files.is_empty() {
                    return Err(CaptureError::MissingFiles);
                }
                Ok(Self::AttachFiles {
                    owner,
                    files: event.files,
                })
            }
            "detach" => Ok(Self::DetachFile {
                owner: Self::owner(&event)?,
                file_name: event.require(ATTR_FILE)?.into(),
            }),
            "map-click" => {
                let form_id = parse_id(ATTR_FORM, event.require(ATTR_FORM)?, FormId::parse)?;
                let position = event
                    .coordinates
                    .filter(|p| p.is_valid())
                    .ok_or(CaptureError::InvalidCoordinates)?;
                Ok(Self::MapClicked { form_id, position })
            }
            other => Err(CaptureError::UnknownAction(other.chars().take(32).collect())),
        }
    }

    fn record_id(event: &ElementEvent) -> Result<RecordId, CaptureError> {
        parse_id(ATTR_ID, event.require(ATTR_ID)?, RecordId::parse)
    }

    /// Durable id when the element has one, else its placeholder
    fn owner(event: &ElementEvent) -> Result<RecordKey, CaptureError> {
        if let Some(id) = event.attr(ATTR_ID) {
            return parse_id(ATTR_ID, id, RecordId::parse).map(RecordKey::Durable);
        }
        let placeholder = event.require(ATTR_PLACEHOLDER)?;
        parse_id(ATTR_PLACEHOLDER, placeholder, PlaceholderId::parse).map(RecordKey::Placeholder)
    }

    /// Short label for logs and stats
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CloseDialog => "close",
            Self::View { .. } => "view",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
            Self::Save(_) => "save",
            Self::Refresh => "refresh",
            Self::AttachFiles { .. } => "attach",
            Self::DetachFile { .. } => "detach",
            Self::MapClicked { .. } => "map-click",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::RecordData;

    #[test]
    fn test_close_tags_win_over_action() {
        let event = ElementEvent::tagged("delete")
            .with_attr(ATTR_ID, "loc1")
            .with_attr(ATTR_DISMISS, "modal");
        assert_eq!(Action::capture(event), Ok(Action::CloseDialog));

        let event = ElementEvent::default().with_attr(ATTR_CLOSE, "");
        assert_eq!(Action::capture(event), Ok(Action::CloseDialog));
    }

    #[test]
    fn test_record_actions_need_valid_id() {
        let event = ElementEvent::tagged("edit").with_attr(ATTR_ID, "loc42");
        assert_eq!(
            Action::capture(event),
            Ok(Action::Edit {
                id: RecordId::parse("loc42").expect("id")
            })
        );

        let missing = ElementEvent::tagged("view");
        assert_eq!(
            Action::capture(missing),
            Err(CaptureError::MissingAttribute(ATTR_ID))
        );

        let hostile = ElementEvent::tagged("delete").with_attr(ATTR_ID, "1 OR 1=1");
        assert!(matches!(
            Action::capture(hostile),
            Err(CaptureError::InvalidId { attribute: ATTR_ID, .. })
        ));
    }

    #[test]
    fn test_unknown_and_missing_tags() {
        assert_eq!(
            Action::capture(ElementEvent::default()),
            Err(CaptureError::NoAction)
        );
        assert_eq!(
            Action::capture(ElementEvent::tagged("explode")),
            Err(CaptureError::UnknownAction("explode".into()))
        );
        assert_eq!(
            Action::capture(ElementEvent::tagged("   ")),
            Err(CaptureError::NoAction)
        );
    }

    #[test]
    fn test_attach_prefers_durable_owner() {
        let file = AttachmentFile::new("p1.jpg", "image/jpeg", vec![1]);

        let event = ElementEvent::tagged("attach")
            .with_attr(ATTR_PLACEHOLDER, "tmp_abc")
            .with_files(vec![file.clone()]);
        let Ok(Action::AttachFiles { owner, files }) = Action::capture(event) else {
            panic!("expected attach");
        };
        assert!(matches!(owner, RecordKey::Placeholder(_)));
        assert_eq!(files.len(), 1);

        let event = ElementEvent::tagged("attach")
            .with_attr(ATTR_PLACEHOLDER, "tmp_abc")
            .with_attr(ATTR_ID, "loc7")
            .with_files(vec![file]);
        let Ok(Action::AttachFiles { owner, .. }) = Action::capture(event) else {
            panic!("expected attach");
        };
        assert_eq!(owner, RecordKey::Durable(RecordId::parse("loc7").expect("id")));

        let empty = ElementEvent::tagged("attach").with_attr(ATTR_PLACEHOLDER, "tmp_abc");
        assert_eq!(Action::capture(empty), Err(CaptureError::MissingFiles));
    }

    #[test]
    fn test_save_requires_form() {
        assert_eq!(
            Action::capture(ElementEvent::tagged("save")),
            Err(CaptureError::MissingForm)
        );

        let form = FormSubmission::create(
            FormId::parse("pin-form").expect("id"),
            PlaceholderId::generate(),
            RecordData::default(),
        );
        let event = ElementEvent::tagged("save").with_form(form.clone());
        assert_eq!(Action::capture(event), Ok(Action::Save(Box::new(form))));
    }

    #[test]
    fn test_map_click_rejects_out_of_range_coordinates() {
        let event = ElementEvent::tagged("map-click")
            .with_attr(ATTR_FORM, "pin-form")
            .with_coordinates(LatLng::new(123.0, 2.0));
        assert_eq!(Action::capture(event), Err(CaptureError::InvalidCoordinates));
    }

    #[test]
    fn test_capture_error_maps_to_invalid_action() {
        let err: AppError = CaptureError::MissingAttribute(ATTR_ID).into();
        assert!(matches!(err, AppError::InvalidAction { attribute: ATTR_ID, .. }));
    }

    #[test]
    fn test_event_deserializes_from_json_line() {
        let line = r#"{"attributes":{"data-action":"view","data-id":"loc9"}}"#;
        let event: ElementEvent = serde_json::from_str(line).expect("json");
        assert_eq!(
            Action::capture(event),
            Ok(Action::View {
                id: RecordId::parse("loc9").expect("id")
            })
        );
    }
}
