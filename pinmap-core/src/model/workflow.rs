//! src/model/workflow.rs
//! ============================================================================
//! # Per-form submission guards
//!
//! At most one workflow per form is in flight. [`WorkflowGuards::try_begin`]
//! flips a form to `Submitting` in one step and hands out a
//! [`SubmissionTicket`]; dropping the ticket puts the form back to `Idle` on
//! every exit path, including early returns and unwinding.

use std::fmt;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::logging::MARKER_DISPATCH;
use crate::model::record::FormId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    #[default]
    Idle,
    Submitting,
    Done,
    Failed,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PendingWorkflow {
    pub form_id: FormId,
    pub state: WorkflowState,
    /// How the previous submission ended
    pub last_outcome: Option<WorkflowState>,
    pub started_at: Option<Instant>,
    pub submissions: u64,
}

impl PendingWorkflow {
    fn new(form_id: FormId) -> Self {
        Self {
            form_id,
            state: WorkflowState::Idle,
            last_outcome: None,
            started_at: None,
            submissions: 0,
        }
    }

    #[must_use]
    pub fn is_submitting(&self) -> bool {
        self.state == WorkflowState::Submitting
    }
}

/// Submission state for every form seen this session
#[derive(Debug, Default)]
pub struct WorkflowGuards {
    forms: DashMap<FormId, PendingWorkflow>,
}

impl WorkflowGuards {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `form_id` as submitting, or `None` if it already is.
    #[must_use]
    pub fn try_begin(&self, form_id: &FormId) -> Option<SubmissionTicket<'_>> {
        let mut workflow = self
            .forms
            .entry(form_id.clone())
            .or_insert_with(|| PendingWorkflow::new(form_id.clone()));

        if workflow.is_submitting() {
            debug!(
                marker = MARKER_DISPATCH,
                operation_type = "submission_rejected",
                form = %form_id,
                "Form already has a submission in flight"
            );
            return None;
        }

        workflow.state = WorkflowState::Submitting;
        workflow.started_at = Some(Instant::now());
        workflow.submissions += 1;
        drop(workflow);

        Some(SubmissionTicket {
            guards: self,
            form_id: form_id.clone(),
            outcome: WorkflowState::Failed,
        })
    }

    #[must_use]
    pub fn state(&self, form_id: &FormId) -> WorkflowState {
        self.forms
            .get(form_id)
            .map_or(WorkflowState::Idle, |w| w.state)
    }

    #[must_use]
    pub fn snapshot(&self, form_id: &FormId) -> Option<PendingWorkflow> {
        self.forms.get(form_id).map(|w| w.clone())
    }

    /// Forms with a submission in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.forms.iter().filter(|w| w.is_submitting()).count()
    }

    fn release(&self, form_id: &FormId, outcome: WorkflowState) {
        if let Some(mut workflow) = self.forms.get_mut(form_id) {
            let elapsed = workflow.started_at.map(|t| t.elapsed());
            workflow.state = WorkflowState::Idle;
            workflow.last_outcome = Some(outcome);
            trace!(
                marker = MARKER_DISPATCH,
                operation_type = "submission_released",
                form = %form_id,
                outcome = %outcome,
                elapsed = ?elapsed,
                "Form is submittable again"
            );
        }
    }
}

/// Proof that a form's submission is in flight. Resets the form on drop.
#[must_use = "the form is released as soon as the ticket is dropped"]
pub struct SubmissionTicket<'a> {
    guards: &'a WorkflowGuards,
    form_id: FormId,
    outcome: WorkflowState,
}

impl SubmissionTicket<'_> {
    #[must_use]
    pub const fn form_id(&self) -> &FormId {
        &self.form_id
    }

    /// Record how the workflow ended. Defaults to `Failed` if never called.
    pub fn finish(&mut self, outcome: WorkflowState) {
        self.outcome = outcome;
    }
}

impl Drop for SubmissionTicket<'_> {
    fn drop(&mut self) {
        self.guards.release(&self.form_id, self.outcome);
    }
}

impl fmt::Debug for SubmissionTicket<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionTicket")
            .field("form_id", &self.form_id)
            .field("outcome", &self.outcome)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(id: &str) -> FormId {
        FormId::parse(id).expect("form id")
    }

    #[test]
    fn test_second_begin_is_rejected_while_in_flight() {
        let guards = WorkflowGuards::new();
        let pin = form("pin-form");

        let ticket = guards.try_begin(&pin).expect("first");
        assert_eq!(guards.state(&pin), WorkflowState::Submitting);
        assert!(guards.try_begin(&pin).is_none());
        assert_eq!(guards.in_flight(), 1);

        drop(ticket);
        assert_eq!(guards.state(&pin), WorkflowState::Idle);
        assert!(guards.try_begin(&pin).is_some());
    }

    #[test]
    fn test_different_forms_do_not_contend() {
        let guards = WorkflowGuards::new();
        let _a = guards.try_begin(&form("a")).expect("a");
        let _b = guards.try_begin(&form("b")).expect("b");
        assert_eq!(guards.in_flight(), 2);
    }

    #[test]
    fn test_outcome_recorded_on_release() {
        let guards = WorkflowGuards::new();
        let pin = form("pin-form");

        {
            let mut ticket = guards.try_begin(&pin).expect("ticket");
            ticket.finish(WorkflowState::Done);
        }
        let snapshot = guards.snapshot(&pin).expect("seen");
        assert_eq!(snapshot.state, WorkflowState::Idle);
        assert_eq!(snapshot.last_outcome, Some(WorkflowState::Done));

        // a dropped ticket without finish counts as a failure
        drop(guards.try_begin(&pin).expect("ticket"));
        let snapshot = guards.snapshot(&pin).expect("seen");
        assert_eq!(snapshot.last_outcome, Some(WorkflowState::Failed));
        assert_eq!(snapshot.submissions, 2);
    }

    #[test]
    fn test_release_survives_unwinding() {
        let guards = WorkflowGuards::new();
        let pin = form("pin-form");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ticket = guards.try_begin(&pin).expect("ticket");
            panic!("collaborator blew up");
        }));

        assert!(result.is_err());
        assert_eq!(guards.state(&pin), WorkflowState::Idle);
    }
}
