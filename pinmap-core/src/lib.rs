pub mod error;

pub mod config;

pub mod context;
pub use context::SessionContext;

pub mod cache {
    pub mod response_cache;
    pub use response_cache::{LookupCategory, ResponseCache};
}

pub mod registry {
    pub mod readiness_registry;
    pub use readiness_registry::{ComponentHandle, ReadinessRegistry, Subscription};
}

pub mod controller {

    pub mod actions;
    pub use actions::{Action, ElementEvent};

    pub mod action_dispatcher;
    pub use action_dispatcher::{ActionDispatcher, DispatchResult, SaveOutcome};

    pub mod collaborators;
    pub use collaborators::Collaborators;

    pub mod memory;
}

pub mod model {
    pub mod attachments;
    pub use attachments::{AttachmentFile, AttachmentQueue};

    pub mod record;
    pub use record::{FormId, FormSubmission, LatLng, PlaceholderId, RecordData, RecordId, RecordKey};

    pub mod workflow;
    pub use workflow::{WorkflowGuards, WorkflowState};
}

pub mod logging;

pub use error::AppError;
