//! ActionDispatcher: single entry point for record-affecting user intent
//!
//! Every element event is captured into an [`Action`] and routed here:
//! - Save/update with a per-form submission guard and RAII cleanup
//! - Deferred attachments drained atomically once a durable id exists
//! - Delete behind an explicit confirmation
//! - Map clicks reverse-geocoded through the response cache
//!
//! Workflows never leave a form disabled: the guard and the submit control
//! are released on drop, and panics inside a workflow are contained and
//! reported as a generic failure.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::response_cache::{LookupCategory, ResponseCache};
use crate::config::DispatcherConfig;
use crate::context::SessionContext;
use crate::controller::actions::{Action, ElementEvent};
use crate::controller::collaborators::{Collaborators, DialogHost, DialogMode, Severity, component};
use crate::error::AppError;
use crate::logging::MARKER_DISPATCH;
use crate::model::attachments::{AttachmentFile, AttachmentQueue};
use crate::model::record::{Address, FieldError, FormId, FormSubmission, LatLng, RecordId, RecordKey};
use crate::model::workflow::{WorkflowGuards, WorkflowState};

/// How a save/update workflow ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// Record and every queued attachment persisted
    Saved { id: RecordId },
    /// Record persisted; `pending` files stay queued under its id
    SavedAttachmentsPending {
        id: RecordId,
        pending: usize,
        reason: String,
    },
    /// Field validation failed; persistence was not contacted
    Invalid { errors: Vec<FieldError> },
    /// Workflow aborted before the record was persisted
    Failed { reason: String },
    /// Another submission of the same form is in flight
    AlreadySubmitting,
}

impl SaveOutcome {
    #[must_use]
    pub const fn is_saved(&self) -> bool {
        matches!(self, Self::Saved { .. } | Self::SavedAttachmentsPending { .. })
    }

    const fn workflow_state(&self) -> WorkflowState {
        if self.is_saved() {
            WorkflowState::Done
        } else {
            WorkflowState::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted { id: RecordId },
    /// The user declined the confirmation
    Cancelled,
    Failed { reason: String },
    AlreadyInProgress,
}

/// Result of routing one action
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum DispatchResult {
    /// Handled with nothing further to report
    Continue,
    Save(SaveOutcome),
    Delete(DeleteOutcome),
    /// Attachments staged under `owner`
    Staged { owner: RecordKey, queued: usize },
    AddressFilled { form_id: FormId, address: Address },
    Failed { reason: String },
    /// The event did not describe an action
    Ignored { reason: String },
}

#[derive(Debug, Default)]
struct Counters {
    events: AtomicU64,
    ignored: AtomicU64,
    saves: AtomicU64,
    saves_rejected: AtomicU64,
    saves_failed: AtomicU64,
    uploads: AtomicU64,
    upload_failures: AtomicU64,
    deletes: AtomicU64,
    geocode_lookups: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of dispatcher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub events: u64,
    pub ignored: u64,
    pub saves: u64,
    pub saves_rejected: u64,
    pub saves_failed: u64,
    pub uploads: u64,
    pub upload_failures: u64,
    pub deletes: u64,
    pub geocode_lookups: u64,
}

/// Disables the form's submit control until dropped
struct SubmitControl<'a> {
    dialog: &'a dyn DialogHost,
    form: &'a FormId,
}

impl<'a> SubmitControl<'a> {
    fn disable(dialog: &'a dyn DialogHost, form: &'a FormId) -> Self {
        dialog.set_submit_enabled(form, false);
        Self { dialog, form }
    }
}

impl Drop for SubmitControl<'_> {
    fn drop(&mut self) {
        self.dialog.set_submit_enabled(self.form, true);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

pub struct ActionDispatcher {
    collaborators: Collaborators,
    cache: Arc<ResponseCache>,
    guards: WorkflowGuards,
    attachments: AttachmentQueue,
    config: DispatcherConfig,
    counters: Counters,
}

impl ActionDispatcher {
    #[must_use]
    pub fn new(collaborators: Collaborators, cache: Arc<ResponseCache>, config: DispatcherConfig) -> Self {
        Self {
            collaborators,
            cache,
            guards: WorkflowGuards::new(),
            attachments: AttachmentQueue::new(),
            config,
            counters: Counters::default(),
        }
    }

    /// Wait for every collaborator through the registry, build the
    /// dispatcher and register it.
    #[instrument(level = "info", skip(ctx))]
    pub async fn wire(ctx: &SessionContext) -> Result<Arc<Self>, AppError> {
        let config = ctx.config().dispatcher.clone();
        let timeout = config
            .dependency_timeout
            .unwrap_or_else(|| ctx.registry().default_timeout());
        let collaborators = Collaborators::from_registry(ctx.registry(), timeout)
            .await
            .map_err(|e| {
                error!(marker = MARKER_DISPATCH, error = %e, "Dispatcher dependencies unavailable");
                e
            })?;

        let dispatcher = Arc::new(Self::new(collaborators, Arc::clone(ctx.cache()), config));
        ctx.registry().register_instance(
            component::ACTION_DISPATCHER,
            Arc::clone(&dispatcher),
            component::DISPATCHER_DEPENDENCIES
                .into_iter()
                .chain([component::RESPONSE_CACHE]),
        );

        info!(marker = MARKER_DISPATCH, operation_type = "wired", "Action dispatcher ready");
        Ok(dispatcher)
    }

    #[must_use]
    pub const fn attachments(&self) -> &AttachmentQueue {
        &self.attachments
    }

    #[must_use]
    pub const fn guards(&self) -> &WorkflowGuards {
        &self.guards
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        DispatcherStats {
            events: load(&c.events),
            ignored: load(&c.ignored),
            saves: load(&c.saves),
            saves_rejected: load(&c.saves_rejected),
            saves_failed: load(&c.saves_failed),
            uploads: load(&c.uploads),
            upload_failures: load(&c.upload_failures),
            deletes: load(&c.deletes),
            geocode_lookups: load(&c.geocode_lookups),
        }
    }

    /// Capture an element event and route it. Events that don't describe an
    /// action are logged and ignored.
    pub async fn dispatch(&self, event: ElementEvent) -> DispatchResult {
        Counters::bump(&self.counters.events);
        match Action::capture(event) {
            Ok(action) => self.handle(action).await,
            Err(e) => {
                Counters::bump(&self.counters.ignored);
                let e = AppError::from(e);
                debug!(
                    marker = MARKER_DISPATCH,
                    operation_type = "event_ignored",
                    reason = %e,
                    "Event carries no usable action"
                );
                DispatchResult::Ignored { reason: e.to_string() }
            }
        }
    }

    #[instrument(level = "debug", skip(self, action), fields(action = action.name()))]
    pub async fn handle(&self, action: Action) -> DispatchResult {
        match action {
            Action::CloseDialog => {
                self.collaborators.dialog.close();
                DispatchResult::Continue
            }
            Action::View { id } => {
                self.collaborators.dialog.open(DialogMode::View, &id);
                DispatchResult::Continue
            }
            Action::Edit { id } => {
                self.collaborators.dialog.open(DialogMode::Edit, &id);
                DispatchResult::Continue
            }
            Action::Delete { id } => DispatchResult::Delete(self.delete(id).await),
            Action::Save(form) => DispatchResult::Save(self.save(*form).await),
            Action::Refresh => match self.refresh().await {
                Ok(()) => DispatchResult::Continue,
                Err(e) => {
                    self.notify(&e.user_message(), Severity::Error);
                    DispatchResult::Failed { reason: e.to_string() }
                }
            },
            Action::AttachFiles { owner, files } => self.attach(owner, files),
            Action::DetachFile { owner, file_name } => self.detach(owner, &file_name),
            Action::MapClicked { form_id, position } => self.map_clicked(form_id, position).await,
        }
    }

    /// Save or update the record behind `form`, then upload its queued
    /// attachments in one batch.
    #[instrument(level = "info", skip(self, form), fields(form = %form.form_id, operation_type = "save"))]
    pub async fn save(&self, form: FormSubmission) -> SaveOutcome {
        let Some(mut ticket) = self.guards.try_begin(&form.form_id) else {
            Counters::bump(&self.counters.saves_rejected);
            return SaveOutcome::AlreadySubmitting;
        };
        Counters::bump(&self.counters.saves);
        let _submit = SubmitControl::disable(self.collaborators.dialog.as_ref(), &form.form_id);

        let outcome = match self.contain("save", self.run_save(&form)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    marker = MARKER_DISPATCH,
                    operation_type = "save_failed",
                    form = %form.form_id,
                    error = %e,
                    "Save workflow failed"
                );
                let severity = if e.is_recoverable() { Severity::Warning } else { Severity::Error };
                self.notify(&e.user_message(), severity);
                SaveOutcome::Failed { reason: e.to_string() }
            }
        };

        if !outcome.is_saved() {
            Counters::bump(&self.counters.saves_failed);
        }
        ticket.finish(outcome.workflow_state());
        outcome
    }

    async fn run_save(&self, form: &FormSubmission) -> Result<SaveOutcome, AppError> {
        let dialog = &self.collaborators.dialog;

        if let Err(errors) = form.data.validate() {
            debug!(
                marker = MARKER_DISPATCH,
                operation_type = "validation_failed",
                form = %form.form_id,
                fields = errors.len(),
                "Form has invalid fields"
            );
            dialog.show_field_errors(&form.form_id, &errors);
            let invalid = AppError::Validation { errors: errors.clone() };
            self.notify(&invalid.user_message(), Severity::Warning);
            return Ok(SaveOutcome::Invalid { errors });
        }

        let records = &self.collaborators.records;
        let id = match &form.record_id {
            Some(id) => {
                records
                    .update_record(id, &form.data)
                    .await
                    .map_err(|e| AppError::persistence("update", &e))?;
                id.clone()
            }
            None => records
                .create_record(&form.data)
                .await
                .map_err(|e| AppError::persistence("create", &e))?,
        };
        info!(marker = MARKER_DISPATCH, operation_type = "record_saved", record = %id, "Record persisted");

        // The record exists from here on, so any later failure is reported
        // as a save with pending work rather than a failed save.
        let outcome = match self.contain("save", self.after_persist(form, &id)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(marker = MARKER_DISPATCH, record = %id, error = %e, "Save finished abnormally after persisting");
                self.pending_outcome(id, &e)
            }
        };
        Ok(outcome)
    }

    async fn after_persist(&self, form: &FormSubmission, id: &RecordId) -> Result<SaveOutcome, AppError> {
        let durable = RecordKey::Durable(id.clone());

        let mut outcome = match self.upload_queued(&form.attachment_key(), id).await {
            Ok(()) => SaveOutcome::Saved { id: id.clone() },
            Err(e) => self.pending_outcome(id.clone(), &e),
        };

        if let Err(e) = self.refresh().await {
            warn!(marker = MARKER_DISPATCH, error = %e, "List refresh after save failed");
        }

        // Files staged under the placeholder while the create was in flight
        // would otherwise never be uploaded.
        if form.record_id.is_none() {
            let moved = self.attachments.transfer(&form.attachment_key(), &durable);
            if moved > 0 {
                debug!(marker = MARKER_DISPATCH, record = %id, moved, "Late attachments moved to the saved record");
                if let SaveOutcome::Saved { id } = outcome {
                    outcome = SaveOutcome::SavedAttachmentsPending {
                        id,
                        pending: self.attachments.len(&durable),
                        reason: "files attached while the location was being saved".to_string(),
                    };
                }
            }
        }

        self.collaborators.dialog.close();
        if matches!(outcome, SaveOutcome::Saved { .. }) {
            self.notify("Location saved", Severity::Success);
        }
        Ok(outcome)
    }

    fn pending_outcome(&self, id: RecordId, error: &AppError) -> SaveOutcome {
        let pending = self.attachments.len(&RecordKey::Durable(id.clone()));
        self.notify(&error.user_message(), Severity::Warning);
        SaveOutcome::SavedAttachmentsPending {
            id,
            pending,
            reason: error.to_string(),
        }
    }

    /// Drain the batch queued under `key` and upload it for `id`. A failed
    /// or panicking upload puts the batch back under the durable id.
    async fn upload_queued(&self, key: &RecordKey, id: &RecordId) -> Result<(), AppError> {
        let batch = self.attachments.drain(key);
        let Some(oldest) = batch.iter().map(|a| a.queued_at).min() else {
            return Ok(());
        };

        let files: Vec<AttachmentFile> = batch.iter().map(|a| a.file.clone()).collect();
        Counters::bump(&self.counters.uploads);

        let upload = AssertUnwindSafe(self.collaborators.attachments.upload_attachments(&files, id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("uploader panicked: {}", panic_message(&*payload))));

        match upload {
            Ok(()) => {
                info!(
                    marker = MARKER_DISPATCH,
                    operation_type = "attachments_uploaded",
                    record = %id,
                    files = files.len(),
                    waited_ms = (Utc::now() - oldest).num_milliseconds(),
                    "Deferred attachments uploaded"
                );
                Ok(())
            }
            Err(e) => {
                Counters::bump(&self.counters.upload_failures);
                warn!(
                    marker = MARKER_DISPATCH,
                    operation_type = "attachments_pending",
                    record = %id,
                    files = files.len(),
                    error = %e,
                    "Attachment upload failed, batch kept for the next save"
                );
                self.attachments.requeue(&RecordKey::Durable(id.clone()), batch);
                Err(AppError::attachment_upload(id.as_str(), &e))
            }
        }
    }

    /// Delete a record after the user confirmed it
    #[instrument(level = "info", skip(self), fields(record = %id, operation_type = "delete"))]
    pub async fn delete(&self, id: RecordId) -> DeleteOutcome {
        let guard_form = FormId::for_delete(&id);
        let Some(mut ticket) = self.guards.try_begin(&guard_form) else {
            return DeleteOutcome::AlreadyInProgress;
        };

        let outcome = match self.contain("delete", self.run_delete(&id)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(marker = MARKER_DISPATCH, operation_type = "delete_failed", error = %e, "Delete failed");
                self.notify(&e.user_message(), Severity::Error);
                DeleteOutcome::Failed { reason: e.to_string() }
            }
        };

        ticket.finish(match outcome {
            DeleteOutcome::Deleted { .. } => WorkflowState::Done,
            DeleteOutcome::Cancelled => WorkflowState::Idle,
            _ => WorkflowState::Failed,
        });
        outcome
    }

    async fn run_delete(&self, id: &RecordId) -> Result<DeleteOutcome, AppError> {
        if !self
            .collaborators
            .confirmer
            .confirm(&self.config.delete_confirmation)
            .await
        {
            debug!(marker = MARKER_DISPATCH, record = %id, "Delete declined");
            return Ok(DeleteOutcome::Cancelled);
        }

        self.collaborators
            .records
            .delete_record(id)
            .await
            .map_err(|e| AppError::persistence("delete", &e))?;
        Counters::bump(&self.counters.deletes);

        let dropped = self.attachments.discard(&RecordKey::Durable(id.clone()));
        if dropped > 0 {
            debug!(marker = MARKER_DISPATCH, record = %id, dropped, "Discarded attachments of deleted record");
        }

        if let Err(e) = self.refresh().await {
            warn!(marker = MARKER_DISPATCH, error = %e, "List refresh after delete failed");
        }
        self.notify("Location deleted", Severity::Success);
        Ok(DeleteOutcome::Deleted { id: id.clone() })
    }

    async fn refresh(&self) -> Result<(), AppError> {
        self.collaborators
            .list
            .refresh_list()
            .await
            .map_err(|e| AppError::from(e).with_context("refreshing list"))
    }

    fn attach(&self, owner: RecordKey, files: Vec<AttachmentFile>) -> DispatchResult {
        let queued = self.attachments.enqueue(&owner, files);
        DispatchResult::Staged { owner, queued }
    }

    fn detach(&self, owner: RecordKey, file_name: &str) -> DispatchResult {
        if !self.attachments.remove(&owner, file_name) {
            debug!(marker = MARKER_DISPATCH, owner = %owner, file = file_name, "Nothing to detach");
        }
        let queued = self.attachments.len(&owner);
        DispatchResult::Staged { owner, queued }
    }

    /// Reverse-geocode a map click and fill the form's address fields
    #[instrument(level = "debug", skip(self), fields(form = %form_id, operation_type = "map_click"))]
    async fn map_clicked(&self, form_id: FormId, position: LatLng) -> DispatchResult {
        let position = position.rounded();
        let geocoder = Arc::clone(&self.collaborators.geocoder);
        let counters = &self.counters;

        let looked_up = self
            .cache
            .get_or_fetch(LookupCategory::Geocoding, &position, || async move {
                Counters::bump(&counters.geocode_lookups);
                geocoder.reverse_geocode(position).await
            })
            .await
            .map_err(AppError::from)
            .and_then(|payload| serde_json::from_value::<Address>(payload).map_err(AppError::from));

        match looked_up {
            Ok(address) => {
                self.collaborators.dialog.fill_address(&form_id, position, &address);
                DispatchResult::AddressFilled { form_id, address }
            }
            Err(e) => {
                warn!(marker = MARKER_DISPATCH, error = %e, "Reverse geocoding failed");
                self.notify("Could not look up the address for this spot", Severity::Warning);
                DispatchResult::Failed { reason: e.to_string() }
            }
        }
    }

    /// Run a workflow body, turning a panic into an error
    async fn contain<T>(
        &self,
        workflow: &'static str,
        body: impl Future<Output = Result<T, AppError>>,
    ) -> Result<T, AppError> {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(marker = MARKER_DISPATCH, workflow, panic = %message, "Workflow panicked");
                Err(AppError::Other(format!("{workflow} workflow panicked: {message}")))
            }
        }
    }

    fn notify(&self, message: &str, severity: Severity) {
        self.collaborators.notifier.notify(message, severity);
    }
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("collaborators", &self.collaborators)
            .field("in_flight", &self.guards.in_flight())
            .field("queued_attachments", &self.attachments.total())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::{BuildInfo, CacheConfig, Config};
    use crate::controller::actions::{ATTR_FORM, ATTR_ID, ATTR_PLACEHOLDER};
    use crate::controller::collaborators::{AttachmentStore, RecordStore};
    use crate::controller::memory::{DialogEvent, InMemorySession, UploadCall};
    use crate::model::record::{PlaceholderId, RecordData};

    fn cache() -> Arc<ResponseCache> {
        Arc::new(ResponseCache::new(CacheConfig::default(), BuildInfo::default()))
    }

    fn dispatcher(session: &InMemorySession) -> ActionDispatcher {
        ActionDispatcher::new(session.collaborators(), cache(), DispatcherConfig::default())
    }

    fn cafe() -> RecordData {
        RecordData {
            name: "Corner Cafe".into(),
            category: "cafe".into(),
            position: Some(LatLng::new(1.0, 2.0)),
            ..RecordData::default()
        }
    }

    fn form_id() -> FormId {
        FormId::parse("pin-form").expect("form id")
    }

    fn placeholder() -> PlaceholderId {
        PlaceholderId::parse("tmp_pin1").expect("placeholder")
    }

    fn new_pin() -> FormSubmission {
        FormSubmission::create(form_id(), placeholder(), cafe())
    }

    fn photo(name: &str) -> AttachmentFile {
        AttachmentFile::new(name, "image/jpeg", vec![0xFF, 0xD8])
    }

    fn record(id: &str) -> RecordId {
        RecordId::parse(id).expect("record id")
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_submit_creates_once() {
        let session = InMemorySession::with_latency(Duration::from_millis(50));
        let dispatcher = dispatcher(&session);

        let (first, second) = tokio::join!(dispatcher.save(new_pin()), dispatcher.save(new_pin()));

        assert!(matches!(first, SaveOutcome::Saved { .. }));
        assert_eq!(second, SaveOutcome::AlreadySubmitting);
        assert_eq!(session.records.create_calls(), 1);
        assert_eq!(dispatcher.stats().saves_rejected, 1);
        assert_eq!(dispatcher.guards().state(&form_id()), WorkflowState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_click_through_dispatch() {
        let session = InMemorySession::with_latency(Duration::from_millis(50));
        let dispatcher = dispatcher(&session);
        let click = || ElementEvent::tagged("save").with_form(new_pin());

        let (a, b) = tokio::join!(dispatcher.dispatch(click()), dispatcher.dispatch(click()));

        let rejected = [&a, &b]
            .iter()
            .filter(|r| matches!(r, DispatchResult::Save(SaveOutcome::AlreadySubmitting)))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(session.records.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_queued_photos_uploaded_once_with_new_id() {
        let session = InMemorySession::new();
        session.records.push_next_id(record("loc123"));
        let dispatcher = dispatcher(&session);

        let staged = dispatcher
            .dispatch(
                ElementEvent::tagged("attach")
                    .with_attr(ATTR_PLACEHOLDER, "tmp_pin1")
                    .with_files(vec![photo("p1.jpg"), photo("p2.jpg"), photo("p3.jpg")]),
            )
            .await;
        assert!(matches!(staged, DispatchResult::Staged { queued: 3, .. }));

        let outcome = dispatcher.save(new_pin()).await;

        assert_eq!(outcome, SaveOutcome::Saved { id: record("loc123") });
        assert_eq!(
            session.attachments.uploads(),
            vec![UploadCall {
                owner: record("loc123"),
                files: vec!["p1.jpg".into(), "p2.jpg".into(), "p3.jpg".into()],
            }]
        );
        assert_eq!(session.attachments.attempts(), 1);
        assert!(dispatcher.attachments().is_empty(&RecordKey::Placeholder(placeholder())));
        assert_eq!(dispatcher.attachments().total(), 0);
        assert_eq!(session.list.refreshes(), 1);
        assert_eq!(session.dialog.closes(), 1);
    }

    #[tokio::test]
    async fn test_save_without_attachments_skips_upload() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);

        assert!(dispatcher.save(new_pin()).await.is_saved());
        assert_eq!(session.attachments.attempts(), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_store() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        let mut form = new_pin();
        form.data.name = "  ".into();
        form.data.position = None;

        let SaveOutcome::Invalid { errors } = dispatcher.save(form).await else {
            panic!("expected validation failure");
        };

        assert_eq!(errors.len(), 2);
        assert_eq!(session.records.create_calls(), 0);
        assert!(session
            .dialog
            .events()
            .iter()
            .any(|e| matches!(e, DialogEvent::FieldErrors { errors, .. } if errors.len() == 2)));
        assert_eq!(session.dialog.submit_enabled(&form_id()), Some(true));
        assert_eq!(
            session.notifier.messages().last(),
            Some(&("Please fix the 2 highlighted fields".to_string(), Severity::Warning))
        );
        let workflow = dispatcher.guards().snapshot(&form_id()).expect("seen");
        assert_eq!(workflow.state, WorkflowState::Idle);
        assert_eq!(workflow.last_outcome, Some(WorkflowState::Failed));
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_queue_and_resets_guard() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        let owner = RecordKey::Placeholder(placeholder());
        dispatcher.attachments().enqueue(&owner, [photo("p1.jpg"), photo("p2.jpg")]);
        session.records.fail_next();

        let outcome = dispatcher.save(new_pin()).await;

        assert!(matches!(outcome, SaveOutcome::Failed { .. }));
        assert_eq!(dispatcher.attachments().len(&owner), 2);
        assert_eq!(session.attachments.attempts(), 0);
        assert_eq!(dispatcher.guards().state(&form_id()), WorkflowState::Idle);
        assert_eq!(session.dialog.submit_enabled(&form_id()), Some(true));
        assert_eq!(session.dialog.closes(), 0);
        assert_eq!(session.notifier.count(Severity::Error), 1);

        // the user can resubmit right away
        let retry = dispatcher.save(new_pin()).await;
        assert!(matches!(retry, SaveOutcome::Saved { .. }));
        assert_eq!(session.attachments.uploads().len(), 1);
        assert_eq!(dispatcher.attachments().total(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_record_and_retries_on_next_save() {
        let session = InMemorySession::new();
        session.records.push_next_id(record("loc123"));
        let dispatcher = dispatcher(&session);
        let owner = RecordKey::Placeholder(placeholder());
        dispatcher.attachments().enqueue(&owner, [photo("p1.jpg"), photo("p2.jpg")]);
        session.attachments.fail_next();

        let outcome = dispatcher.save(new_pin()).await;

        let SaveOutcome::SavedAttachmentsPending { id, pending, .. } = outcome else {
            panic!("expected pending attachments, got {outcome:?}");
        };
        assert_eq!(id, record("loc123"));
        assert_eq!(pending, 2);
        assert_eq!(session.records.created(), vec![record("loc123")]);
        assert!(session.records.deleted().is_empty());
        assert_eq!(session.notifier.count(Severity::Warning), 1);
        assert_eq!(dispatcher.stats().upload_failures, 1);

        let durable = RecordKey::Durable(record("loc123"));
        assert!(dispatcher.attachments().is_empty(&owner));
        assert_eq!(dispatcher.attachments().len(&durable), 2);

        let update = FormSubmission::update(form_id(), record("loc123"), cafe());
        assert_eq!(
            dispatcher.save(update).await,
            SaveOutcome::Saved { id: record("loc123") }
        );
        assert_eq!(session.records.updated(), vec![record("loc123")]);
        assert_eq!(
            session.attachments.uploads(),
            vec![UploadCall {
                owner: record("loc123"),
                files: vec!["p1.jpg".into(), "p2.jpg".into()],
            }]
        );
        assert!(dispatcher.attachments().is_empty(&durable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_files_attached_during_create_follow_the_record() {
        let session = InMemorySession::with_latency(Duration::from_millis(50));
        session.records.push_next_id(record("loc123"));
        let dispatcher = dispatcher(&session);
        let temp = RecordKey::Placeholder(placeholder());
        dispatcher.attachments().enqueue(&temp, [photo("p1.jpg")]);

        // lands while the first batch is uploading
        let late_attach = async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            dispatcher
                .dispatch(
                    ElementEvent::tagged("attach")
                        .with_attr(ATTR_PLACEHOLDER, "tmp_pin1")
                        .with_files(vec![photo("p2.jpg")]),
                )
                .await
        };
        let (outcome, staged) = tokio::join!(dispatcher.save(new_pin()), late_attach);

        assert!(matches!(staged, DispatchResult::Staged { queued: 1, .. }));
        let SaveOutcome::SavedAttachmentsPending { id, pending, .. } = outcome else {
            panic!("expected pending attachments, got {outcome:?}");
        };
        assert_eq!(id, record("loc123"));
        assert_eq!(pending, 1);
        assert!(dispatcher.attachments().is_empty(&temp));

        let update = FormSubmission::update(form_id(), record("loc123"), cafe());
        assert_eq!(
            dispatcher.save(update).await,
            SaveOutcome::Saved { id: record("loc123") }
        );
        assert_eq!(
            session.attachments.uploads(),
            vec![
                UploadCall {
                    owner: record("loc123"),
                    files: vec!["p1.jpg".into()],
                },
                UploadCall {
                    owner: record("loc123"),
                    files: vec!["p2.jpg".into()],
                },
            ]
        );
        assert_eq!(dispatcher.attachments().total(), 0);
    }

    #[derive(Debug)]
    struct PanickingUploader;

    #[async_trait]
    impl AttachmentStore for PanickingUploader {
        async fn upload_attachments(&self, _: &[AttachmentFile], _: &RecordId) -> anyhow::Result<()> {
            panic!("uploader bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_uploader_keeps_record_and_batch() {
        let session = InMemorySession::new();
        session.records.push_next_id(record("loc123"));
        let mut collaborators = session.collaborators();
        collaborators.attachments = Arc::new(PanickingUploader);
        let dispatcher = ActionDispatcher::new(collaborators, cache(), DispatcherConfig::default());
        dispatcher
            .attachments()
            .enqueue(&RecordKey::Placeholder(placeholder()), [photo("p1.jpg")]);

        let outcome = dispatcher.save(new_pin()).await;

        let SaveOutcome::SavedAttachmentsPending { id, pending, reason } = outcome else {
            panic!("expected pending attachments, got {outcome:?}");
        };
        assert_eq!(id, record("loc123"));
        assert_eq!(pending, 1);
        assert!(reason.contains("uploader bug"));
        assert_eq!(session.records.created(), vec![record("loc123")]);
        assert_eq!(
            dispatcher.attachments().file_names(&RecordKey::Durable(record("loc123"))),
            vec!["p1.jpg"]
        );
        assert_eq!(session.dialog.closes(), 1);
        assert_eq!(dispatcher.guards().state(&form_id()), WorkflowState::Idle);
        assert_eq!(session.dialog.submit_enabled(&form_id()), Some(true));
        assert_eq!(dispatcher.stats().upload_failures, 1);
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        let id = record("loc5");
        session.confirmer.answer_next(false);

        assert_eq!(dispatcher.delete(id.clone()).await, DeleteOutcome::Cancelled);
        assert!(session.records.deleted().is_empty());
        assert_eq!(session.list.refreshes(), 0);
        assert_eq!(session.confirmer.prompts().len(), 1);

        session.confirmer.answer_next(true);
        let result = dispatcher
            .dispatch(ElementEvent::tagged("delete").with_attr(ATTR_ID, "loc5"))
            .await;
        assert_eq!(result, DispatchResult::Delete(DeleteOutcome::Deleted { id: id.clone() }));
        assert_eq!(session.records.deleted(), vec![id]);
        assert_eq!(session.list.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_delete_discards_queued_attachments() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        let id = record("loc5");
        dispatcher
            .attachments()
            .enqueue(&RecordKey::Durable(id.clone()), [photo("p1.jpg")]);

        assert!(matches!(dispatcher.delete(id).await, DeleteOutcome::Deleted { .. }));
        assert_eq!(dispatcher.attachments().total(), 0);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        session.records.fail_next();

        let outcome = dispatcher.delete(record("loc5")).await;
        assert!(matches!(outcome, DeleteOutcome::Failed { .. }));
        assert_eq!(session.notifier.count(Severity::Error), 1);
        assert_eq!(
            dispatcher.guards().state(&FormId::for_delete(&record("loc5"))),
            WorkflowState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_delete_of_same_record_is_rejected() {
        let session = InMemorySession::with_latency(Duration::from_millis(50));
        let dispatcher = dispatcher(&session);
        let id = record("loc5");

        let (first, second) = tokio::join!(dispatcher.delete(id.clone()), dispatcher.delete(id.clone()));

        assert_eq!(first, DeleteOutcome::Deleted { id: id.clone() });
        assert_eq!(second, DeleteOutcome::AlreadyInProgress);
        assert_eq!(session.records.deleted(), vec![id]);
        assert_eq!(session.confirmer.prompts().len(), 1);
    }

    #[derive(Debug)]
    struct PanickingStore;

    #[async_trait]
    impl RecordStore for PanickingStore {
        async fn create_record(&self, _: &RecordData) -> anyhow::Result<RecordId> {
            panic!("driver bug");
        }

        async fn update_record(&self, _: &RecordId, _: &RecordData) -> anyhow::Result<()> {
            panic!("driver bug");
        }

        async fn delete_record(&self, _: &RecordId) -> anyhow::Result<()> {
            panic!("driver bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_collaborator_is_contained() {
        let session = InMemorySession::new();
        let mut collaborators = session.collaborators();
        collaborators.records = Arc::new(PanickingStore);
        let dispatcher = ActionDispatcher::new(collaborators, cache(), DispatcherConfig::default());

        let SaveOutcome::Failed { reason } = dispatcher.save(new_pin()).await else {
            panic!("expected failure");
        };
        assert!(reason.contains("driver bug"));
        assert_eq!(dispatcher.guards().state(&form_id()), WorkflowState::Idle);
        assert_eq!(session.dialog.submit_enabled(&form_id()), Some(true));
        assert_eq!(
            session.notifier.messages().last().map(|(_, s)| *s),
            Some(Severity::Error)
        );
    }

    #[tokio::test]
    async fn test_map_click_geocodes_once_per_spot() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        let click = |lat: f64| {
            ElementEvent::tagged("map-click")
                .with_attr(ATTR_FORM, "pin-form")
                .with_coordinates(LatLng::new(lat, 2.0))
        };

        let first = dispatcher.dispatch(click(1.000_001)).await;
        let second = dispatcher.dispatch(click(1.000_002)).await;

        let DispatchResult::AddressFilled { address, .. } = first else {
            panic!("expected an address, got {first:?}");
        };
        assert_eq!(address.formatted, "1.00000, 2.00000");
        assert_eq!(address.country.as_deref(), Some("Testland"));
        assert!(matches!(second, DispatchResult::AddressFilled { .. }));
        assert_eq!(session.geocoder.calls(), 1);
        assert_eq!(dispatcher.stats().geocode_lookups, 1);
    }

    #[tokio::test]
    async fn test_map_click_geocoder_failure_is_a_warning() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        session.geocoder.fail_next();

        let result = dispatcher
            .handle(Action::MapClicked {
                form_id: form_id(),
                position: LatLng::new(10.0, 20.0),
            })
            .await;

        assert!(matches!(result, DispatchResult::Failed { .. }));
        assert_eq!(session.notifier.count(Severity::Warning), 1);
    }

    #[tokio::test]
    async fn test_dialog_actions_and_detach() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);

        dispatcher
            .dispatch(ElementEvent::tagged("edit").with_attr(ATTR_ID, "loc9"))
            .await;
        dispatcher
            .dispatch(ElementEvent::default().with_attr("data-dismiss", "modal"))
            .await;
        assert_eq!(
            session.dialog.events(),
            vec![
                DialogEvent::Opened {
                    mode: DialogMode::Edit,
                    id: record("loc9")
                },
                DialogEvent::Closed,
            ]
        );

        let owner = RecordKey::Placeholder(placeholder());
        dispatcher.attachments().enqueue(&owner, [photo("p1.jpg"), photo("p2.jpg")]);
        let result = dispatcher
            .handle(Action::DetachFile {
                owner: owner.clone(),
                file_name: "p1.jpg".into(),
            })
            .await;
        assert_eq!(result, DispatchResult::Staged { owner, queued: 1 });
    }

    #[tokio::test]
    async fn test_unusable_events_are_ignored() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);

        let result = dispatcher.dispatch(ElementEvent::tagged("launch-missiles")).await;
        let DispatchResult::Ignored { reason } = result else {
            panic!("expected the event to be ignored, got {result:?}");
        };
        assert!(reason.starts_with("Invalid action attribute data-action"));
        assert_eq!(dispatcher.stats().ignored, 1);
        assert!(session.dialog.events().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_failure_is_surfaced() {
        let session = InMemorySession::new();
        let dispatcher = dispatcher(&session);
        session.list.fail_next();

        assert!(matches!(
            dispatcher.handle(Action::Refresh).await,
            DispatchResult::Failed { .. }
        ));
        assert_eq!(session.notifier.count(Severity::Error), 1);
        assert!(matches!(dispatcher.handle(Action::Refresh).await, DispatchResult::Continue));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wire_waits_for_late_collaborators() {
        let ctx = Arc::new(SessionContext::new(Config::default()));
        let session = InMemorySession::new();

        let late = Arc::clone(&ctx);
        let collaborators = session.collaborators();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            collaborators.register_all(late.registry());
        });

        let dispatcher = ActionDispatcher::wire(&ctx).await.expect("wired");
        assert!(ctx.registry().is_loaded(component::ACTION_DISPATCHER));
        let deps = ctx
            .registry()
            .dependencies_of(component::ACTION_DISPATCHER)
            .expect("registered");
        assert!(deps.iter().any(|d| d == component::RESPONSE_CACHE));
        assert_eq!(dispatcher.stats(), DispatcherStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wire_times_out_without_collaborators() {
        let ctx = SessionContext::new(Config::default());
        let start = tokio::time::Instant::now();
        let err = ActionDispatcher::wire(&ctx).await.expect_err("nothing registered");
        // no dispatcher timeout configured, so the registry default applies
        let waited = start.elapsed();
        assert!(waited >= ctx.registry().default_timeout());
        assert!(waited < Duration::from_secs(10));
        assert!(matches!(err, AppError::DependencyTimeout { ref names, .. } if names.len() == 7));
        assert!(!ctx.registry().is_loaded(component::ACTION_DISPATCHER));
    }
}
