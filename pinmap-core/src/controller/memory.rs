//! In-memory collaborators
//!
//! Stand-ins for the backend, the browser prompts and the map provider. The
//! demo binary runs against them, and tests use them to script failures and
//! inspect every call the dispatcher made.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::controller::collaborators::{
    AttachmentStore, Collaborators, Confirmer, DialogHost, DialogMode, Geocoder, ListView,
    Notifier, RecordStore, Severity,
};
use crate::model::attachments::AttachmentFile;
use crate::model::record::{Address, FieldError, FormId, LatLng, RecordData, RecordId};

async fn simulate_latency(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Failure switch consumed by the next call
#[derive(Debug, Default)]
struct FailNext(AtomicBool);

impl FailNext {
    fn arm(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct StoreLog {
    created: Vec<RecordId>,
    updated: Vec<(RecordId, RecordData)>,
    deleted: Vec<RecordId>,
    records: Vec<(RecordId, RecordData)>,
}

/// Record store keeping everything in a vector
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    latency: Duration,
    next_ids: Mutex<VecDeque<RecordId>>,
    counter: AtomicU64,
    fail_next: FailNext,
    create_calls: AtomicUsize,
    log: Mutex<StoreLog>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Hand out `id` on the next create instead of a generated one
    pub fn push_next_id(&self, id: RecordId) {
        self.next_ids.lock().push_back(id);
    }

    pub fn fail_next(&self) {
        self.fail_next.arm();
    }

    /// Create calls issued, including failed ones
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn created(&self) -> Vec<RecordId> {
        self.log.lock().created.clone()
    }

    #[must_use]
    pub fn updated(&self) -> Vec<RecordId> {
        self.log.lock().updated.iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn deleted(&self) -> Vec<RecordId> {
        self.log.lock().deleted.clone()
    }

    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<RecordData> {
        self.log
            .lock()
            .records
            .iter()
            .find(|(rid, _)| rid == id)
            .map(|(_, data)| data.clone())
    }

    fn next_id(&self) -> anyhow::Result<RecordId> {
        if let Some(id) = self.next_ids.lock().pop_front() {
            return Ok(id);
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RecordId::parse(&format!("loc{n}")).context("generating record id")
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_record(&self, data: &RecordData) -> anyhow::Result<RecordId> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        simulate_latency(self.latency).await;
        if self.fail_next.take() {
            bail!("backend rejected create");
        }

        let id = self.next_id()?;
        let mut log = self.log.lock();
        log.created.push(id.clone());
        log.records.push((id.clone(), data.clone()));
        debug!(record = %id, "Record created");
        Ok(id)
    }

    async fn update_record(&self, id: &RecordId, data: &RecordData) -> anyhow::Result<()> {
        simulate_latency(self.latency).await;
        if self.fail_next.take() {
            bail!("backend rejected update of {id}");
        }

        let mut log = self.log.lock();
        let Some(slot) = log.records.iter_mut().find(|(rid, _)| rid == id) else {
            return Err(anyhow!("record {id} not found"));
        };
        slot.1 = data.clone();
        log.updated.push((id.clone(), data.clone()));
        Ok(())
    }

    async fn delete_record(&self, id: &RecordId) -> anyhow::Result<()> {
        simulate_latency(self.latency).await;
        if self.fail_next.take() {
            bail!("backend rejected delete of {id}");
        }

        let mut log = self.log.lock();
        log.records.retain(|(rid, _)| rid != id);
        log.deleted.push(id.clone());
        Ok(())
    }
}

/// One accepted upload batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadCall {
    pub owner: RecordId,
    pub files: Vec<CompactString>,
}

#[derive(Debug, Default)]
pub struct InMemoryAttachmentStore {
    latency: Duration,
    fail_next: FailNext,
    attempts: AtomicUsize,
    uploads: Mutex<Vec<UploadCall>>,
}

impl InMemoryAttachmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_next(&self) {
        self.fail_next.arm();
    }

    /// Upload calls issued, including failed ones
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful uploads in call order
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadCall> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl AttachmentStore for InMemoryAttachmentStore {
    async fn upload_attachments(&self, files: &[AttachmentFile], owner: &RecordId) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        simulate_latency(self.latency).await;
        if self.fail_next.take() {
            bail!("storage unavailable");
        }

        self.uploads.lock().push(UploadCall {
            owner: owner.clone(),
            files: files.iter().map(|f| f.file_name.clone()).collect(),
        });
        Ok(())
    }
}

/// Answers prompts from a script, then falls back to a fixed answer
#[derive(Debug)]
pub struct ScriptedConfirmer {
    answers: Mutex<VecDeque<bool>>,
    fallback: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    #[must_use]
    pub fn new(fallback: bool) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answer_next(&self, answer: bool) {
        self.answers.lock().push_back(answer);
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl Default for ScriptedConfirmer {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, message: &str) -> bool {
        self.prompts.lock().push(message.to_string());
        self.answers.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// Collects toasts
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<(String, Severity)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<(String, Severity)> {
        self.messages.lock().clone()
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.messages.lock().iter().filter(|(_, s)| *s == severity).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str, severity: Severity) {
        info!(severity = %severity, "{message}");
        self.messages.lock().push((message.to_string(), severity));
    }
}

#[derive(Debug, Default)]
pub struct RecordingListView {
    refreshes: AtomicUsize,
    fail_next: FailNext,
}

impl RecordingListView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail_next.arm();
    }

    #[must_use]
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListView for RecordingListView {
    async fn refresh_list(&self) -> anyhow::Result<()> {
        if self.fail_next.take() {
            bail!("list endpoint unavailable");
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Everything the dispatcher asked the dialog to do
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DialogEvent {
    Opened { mode: DialogMode, id: RecordId },
    Closed,
    SubmitEnabled { form: FormId, enabled: bool },
    FieldErrors { form: FormId, errors: Vec<FieldError> },
    AddressFilled { form: FormId, position: LatLng, address: Address },
}

#[derive(Debug, Default)]
pub struct RecordingDialogHost {
    events: Mutex<Vec<DialogEvent>>,
}

impl RecordingDialogHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<DialogEvent> {
        self.events.lock().clone()
    }

    /// Last submit-control state set for `form`
    #[must_use]
    pub fn submit_enabled(&self, form: &FormId) -> Option<bool> {
        self.events.lock().iter().rev().find_map(|e| match e {
            DialogEvent::SubmitEnabled { form: f, enabled } if f == form => Some(*enabled),
            _ => None,
        })
    }

    #[must_use]
    pub fn closes(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DialogEvent::Closed))
            .count()
    }

    fn push(&self, event: DialogEvent) {
        self.events.lock().push(event);
    }
}

impl DialogHost for RecordingDialogHost {
    fn open(&self, mode: DialogMode, id: &RecordId) {
        self.push(DialogEvent::Opened { mode, id: id.clone() });
    }

    fn close(&self) {
        self.push(DialogEvent::Closed);
    }

    fn set_submit_enabled(&self, form: &FormId, enabled: bool) {
        self.push(DialogEvent::SubmitEnabled {
            form: form.clone(),
            enabled,
        });
    }

    fn show_field_errors(&self, form: &FormId, errors: &[FieldError]) {
        self.push(DialogEvent::FieldErrors {
            form: form.clone(),
            errors: errors.to_vec(),
        });
    }

    fn fill_address(&self, form: &FormId, position: LatLng, address: &Address) {
        self.push(DialogEvent::AddressFilled {
            form: form.clone(),
            position,
            address: address.clone(),
        });
    }
}

/// Geocoder answering every position with a synthetic address
#[derive(Debug, Default)]
pub struct StaticGeocoder {
    calls: AtomicUsize,
    fail_next: FailNext,
}

impl StaticGeocoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail_next.arm();
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn reverse_geocode(&self, position: LatLng) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.take() {
            bail!("geocoder quota exceeded");
        }
        Ok(json!({
            "formatted_address": format!("{:.5}, {:.5}", position.lat, position.lng),
            "locality": "Nowhere",
            "country": "Testland",
        }))
    }
}

/// One instance of every in-memory collaborator, kept concrete for inspection
#[derive(Debug, Clone)]
pub struct InMemorySession {
    pub records: Arc<InMemoryRecordStore>,
    pub attachments: Arc<InMemoryAttachmentStore>,
    pub confirmer: Arc<ScriptedConfirmer>,
    pub notifier: Arc<RecordingNotifier>,
    pub list: Arc<RecordingListView>,
    pub dialog: Arc<RecordingDialogHost>,
    pub geocoder: Arc<StaticGeocoder>,
}

impl InMemorySession {
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Record store and attachment store suspend for `latency` on every call
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            records: Arc::new(InMemoryRecordStore::new().with_latency(latency)),
            attachments: Arc::new(InMemoryAttachmentStore::new().with_latency(latency)),
            confirmer: Arc::new(ScriptedConfirmer::default()),
            notifier: Arc::new(RecordingNotifier::new()),
            list: Arc::new(RecordingListView::new()),
            dialog: Arc::new(RecordingDialogHost::new()),
            geocoder: Arc::new(StaticGeocoder::new()),
        }
    }

    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            records: self.records.clone(),
            attachments: self.attachments.clone(),
            confirmer: self.confirmer.clone(),
            notifier: self.notifier.clone(),
            list: self.list.clone(),
            dialog: self.dialog.clone(),
            geocoder: self.geocoder.clone(),
        }
    }
}

impl Default for InMemorySession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_store_hands_out_scripted_ids_first() {
        let store = InMemoryRecordStore::new();
        store.push_next_id(RecordId::parse("loc123").expect("id"));

        let first = store.create_record(&RecordData::default()).await.expect("create");
        let second = store.create_record(&RecordData::default()).await.expect("create");

        assert_eq!(first.as_str(), "loc123");
        assert_eq!(second.as_str(), "loc1");
        assert_eq!(store.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_applies_once() {
        let store = InMemoryRecordStore::new();
        store.fail_next();
        assert!(store.create_record(&RecordData::default()).await.is_err());
        assert!(store.create_record(&RecordData::default()).await.is_ok());
        assert_eq!(store.created().len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_unknown_record_fails() {
        let store = InMemoryRecordStore::new();
        let id = RecordId::parse("ghost").expect("id");
        assert!(store.update_record(&id, &RecordData::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_confirmer_script_then_fallback() {
        let confirmer = ScriptedConfirmer::new(true);
        confirmer.answer_next(false);
        assert!(!confirmer.confirm("sure?").await);
        assert!(confirmer.confirm("sure?").await);
        assert_eq!(confirmer.prompts().len(), 2);
    }

    #[test]
    fn test_dialog_tracks_last_submit_state() {
        let dialog = RecordingDialogHost::new();
        let form = FormId::parse("pin-form").expect("id");
        assert_eq!(dialog.submit_enabled(&form), None);
        dialog.set_submit_enabled(&form, false);
        dialog.set_submit_enabled(&form, true);
        assert_eq!(dialog.submit_enabled(&form), Some(true));
    }
}
