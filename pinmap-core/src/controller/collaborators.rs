//! Collaborators: trait seams for everything outside the coordination core
//!
//! The record store, attachment storage, prompts, toasts, the list view, the
//! dialog and the mapping provider all live elsewhere. The dispatcher sees
//! them only through these traits and finds them through the readiness
//! registry under the names in [`component`].

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::model::attachments::AttachmentFile;
use crate::model::record::{Address, FieldError, FormId, LatLng, RecordData, RecordId};
use crate::registry::readiness_registry::{ComponentHandle, ReadinessRegistry};

/// Registry names of the well-known components
pub mod component {
    pub const RECORD_STORE: &str = "RecordStore";
    pub const ATTACHMENT_STORE: &str = "AttachmentStore";
    pub const CONFIRMER: &str = "Confirmer";
    pub const NOTIFIER: &str = "Notifier";
    pub const LIST_VIEW: &str = "ListView";
    pub const DIALOG_HOST: &str = "DialogHost";
    pub const GEOCODER: &str = "Geocoder";
    pub const RESPONSE_CACHE: &str = "ResponseCache";
    pub const ACTION_DISPATCHER: &str = "ActionDispatcher";

    /// Everything the dispatcher needs before it can be wired
    pub const DISPATCHER_DEPENDENCIES: [&str; 7] = [
        RECORD_STORE,
        ATTACHMENT_STORE,
        CONFIRMER,
        NOTIFIER,
        LIST_VIEW,
        DIALOG_HOST,
        GEOCODER,
    ];
}

/// Toast severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogMode {
    View,
    Edit,
}

/// Backend persistence API
#[async_trait]
pub trait RecordStore: Send + Sync + Debug {
    /// Persist a new record and return its durable id
    async fn create_record(&self, data: &RecordData) -> anyhow::Result<RecordId>;

    async fn update_record(&self, id: &RecordId, data: &RecordData) -> anyhow::Result<()>;

    async fn delete_record(&self, id: &RecordId) -> anyhow::Result<()>;
}

/// Attachment storage API, called once per drained batch
#[async_trait]
pub trait AttachmentStore: Send + Sync + Debug {
    async fn upload_attachments(&self, files: &[AttachmentFile], owner: &RecordId) -> anyhow::Result<()>;
}

/// Blocking-style yes/no prompt
#[async_trait]
pub trait Confirmer: Send + Sync + Debug {
    async fn confirm(&self, message: &str) -> bool;
}

/// Toast sink
pub trait Notifier: Send + Sync + Debug {
    fn notify(&self, message: &str, severity: Severity);
}

/// Record list re-rendered after a mutation
#[async_trait]
pub trait ListView: Send + Sync + Debug {
    async fn refresh_list(&self) -> anyhow::Result<()>;
}

/// The record dialog and its form controls
pub trait DialogHost: Send + Sync + Debug {
    fn open(&self, mode: DialogMode, id: &RecordId);

    fn close(&self);

    fn set_submit_enabled(&self, form: &FormId, enabled: bool);

    fn show_field_errors(&self, form: &FormId, errors: &[FieldError]);

    fn fill_address(&self, form: &FormId, position: LatLng, address: &Address);
}

/// Mapping provider's reverse geocoding
#[async_trait]
pub trait Geocoder: Send + Sync + Debug {
    async fn reverse_geocode(&self, position: LatLng) -> anyhow::Result<Value>;
}

/// Every collaborator the dispatcher talks to
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub confirmer: Arc<dyn Confirmer>,
    pub notifier: Arc<dyn Notifier>,
    pub list: Arc<dyn ListView>,
    pub dialog: Arc<dyn DialogHost>,
    pub geocoder: Arc<dyn Geocoder>,
}

impl Collaborators {
    /// Register each collaborator under its well-known name
    pub fn register_all(&self, registry: &ReadinessRegistry) {
        let none: [&str; 0] = [];
        registry.register_instance(component::RECORD_STORE, Arc::clone(&self.records), none);
        registry.register_instance(component::ATTACHMENT_STORE, Arc::clone(&self.attachments), none);
        registry.register_instance(component::CONFIRMER, Arc::clone(&self.confirmer), none);
        registry.register_instance(component::NOTIFIER, Arc::clone(&self.notifier), none);
        registry.register_instance(component::LIST_VIEW, Arc::clone(&self.list), none);
        registry.register_instance(component::DIALOG_HOST, Arc::clone(&self.dialog), none);
        registry.register_instance(component::GEOCODER, Arc::clone(&self.geocoder), none);
    }

    /// Wait until every collaborator is registered, then collect them
    pub async fn from_registry(registry: &ReadinessRegistry, timeout: Duration) -> Result<Self, AppError> {
        let handles = registry
            .wait_for_all(&component::DISPATCHER_DEPENDENCIES, timeout)
            .await?;

        let mut handles = component::DISPATCHER_DEPENDENCIES.iter().zip(handles);
        let mut next = || {
            handles
                .next()
                .ok_or_else(|| AppError::Other("collaborator list ended early".into()))
        };

        Ok(Self {
            records: downcast(next()?)?,
            attachments: downcast(next()?)?,
            confirmer: downcast(next()?)?,
            notifier: downcast(next()?)?,
            list: downcast(next()?)?,
            dialog: downcast(next()?)?,
            geocoder: downcast(next()?)?,
        })
    }
}

fn downcast<T: Clone + 'static>((name, handle): (&&str, ComponentHandle)) -> Result<T, AppError> {
    handle
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| AppError::ComponentType { name: (*name).into() })
}

impl Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("records", &self.records)
            .field("attachments", &self.attachments)
            .field("dialog", &self.dialog)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::memory::InMemorySession;

    #[tokio::test]
    async fn test_from_registry_collects_registered_collaborators() {
        let registry = ReadinessRegistry::default();
        let session = InMemorySession::new();
        session.collaborators().register_all(&registry);

        let collaborators = Collaborators::from_registry(&registry, Duration::from_millis(10))
            .await
            .expect("all registered");

        let id = collaborators
            .records
            .create_record(&RecordData::default())
            .await
            .expect("create");
        assert_eq!(session.records.created(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_registry_reports_missing_names() {
        let registry = ReadinessRegistry::default();
        let session = InMemorySession::new();
        registry.register_instance(
            component::RECORD_STORE,
            Arc::clone(&session.collaborators().records),
            [] as [&str; 0],
        );

        let err = Collaborators::from_registry(&registry, Duration::from_millis(50))
            .await
            .expect_err("most collaborators missing");

        match err {
            AppError::DependencyTimeout { names, .. } => {
                assert_eq!(names.len(), 6);
                assert!(!names.iter().any(|n| n == component::RECORD_STORE));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let registry = ReadinessRegistry::default();
        let session = InMemorySession::new();
        session.collaborators().register_all(&registry);
        registry.register_instance(component::GEOCODER, 42_u32, [] as [&str; 0]);

        let err = Collaborators::from_registry(&registry, Duration::from_millis(10))
            .await
            .expect_err("geocoder has the wrong type");
        assert!(matches!(err, AppError::ComponentType { name } if name == component::GEOCODER));
    }
}
