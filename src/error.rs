use thiserror::Error;
use uuid::Uuid;

use crate::remediation::playbook::RenderError;
use crate::storage::StorageError;
use crate::{DeviceClass, DeviceId};

/// Failures reported synchronously to callers of the engine
///
/// Per-device polling problems and remediation execution failures are not
/// errors at this level; they are recorded as poll outcomes, alerts and
/// remediation log states.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device '{0}' not found")]
    DeviceNotFound(DeviceId),

    #[error("alert {0} not found")]
    AlertNotFound(i64),

    #[error("alert {0} is resolved")]
    AlertNotOpen(i64),

    #[error("invalid alert transition: {0}")]
    InvalidTransition(String),

    #[error("unknown playbook '{0}'")]
    UnknownPlaybook(String),

    #[error("playbook '{playbook}' cannot run on {class} devices")]
    PlaybookNotApplicable {
        playbook: String,
        class: DeviceClass,
    },

    #[error("no playbook mapped for alert type '{0}'")]
    NoPlaybookMapped(String),

    #[error("a remediation is already in progress for device '{0}'")]
    RemediationInProgress(DeviceId),

    #[error("remediation task {0} not found")]
    TaskNotFound(Uuid),

    #[error("polling has been cancelled")]
    Cancelled,

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Map a storage error raised while addressing alert `id`
    pub(crate) fn for_alert(id: i64, err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => EngineError::AlertNotFound(id),
            StorageError::InvalidTransition(msg) => EngineError::InvalidTransition(msg),
            other => EngineError::Storage(other),
        }
    }
}
