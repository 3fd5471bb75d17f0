use std::time::Duration;

use kube::runtime::controller::Action;

/// Default requeue delay for transient failures (spec §4.6: "~60s").
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Backoff used after a permanent failure. `kube::runtime::Controller`
/// always wants an `Action` back; there is no "stop retrying" verb, so a
/// long delay stands in for "halt" until the spec is fixed (e.g. the uid
/// reappears after an apiserver restore).
const PERMANENT_BACKOFF: Duration = Duration::from_secs(300);

#[derive(thiserror::Error, Debug)]
pub enum OperatorError {
    #[error("resource not found")]
    NotFound,

    #[error("cluster {0} is missing a uid")]
    MissingUid(String),

    #[error("no available control plane machines")]
    NoControlPlaneMachines,

    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Error-class label used by the metrics sink (spec §7: `temporary`,
/// `permanent`, `unknown`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Temporary,
    Permanent,
    Unknown,
}

impl ErrorClass {
    pub fn as_label(&self) -> &'static str {
        match self {
            ErrorClass::Temporary => "temporary",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Unknown => "unknown",
        }
    }
}

impl OperatorError {
    /// Permanent errors halt the current reconcile and are surfaced via a
    /// condition rather than retried on a short interval (spec §4.6, §7).
    pub fn is_permanent(&self) -> bool {
        matches!(self, OperatorError::MissingUid(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            OperatorError::MissingUid(_) => ErrorClass::Permanent,
            OperatorError::NotFound
            | OperatorError::NoControlPlaneMachines
            | OperatorError::Kube(_) => ErrorClass::Temporary,
            OperatorError::Serde(_) | OperatorError::Other(_) => ErrorClass::Unknown,
        }
    }

    /// Translate a `kube::Error` coming back from a get/delete call into
    /// `NotFound` when the apiserver responded 404, preserving every other
    /// failure verbatim (spec §4.1: "NotFound is surfaced as a
    /// distinguished error kind, never swallowed").
    pub fn from_kube(err: kube::Error) -> OperatorError {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound,
            _ => OperatorError::Kube(err),
        }
    }
}

/// Maps an [`OperatorError`] to the `Action` the controller runtime should
/// take next, per the retry/backoff policy in spec §4.6 and §5.
pub fn error_policy(err: &OperatorError) -> Action {
    if err.is_permanent() {
        Action::requeue(PERMANENT_BACKOFF)
    } else {
        Action::requeue(TRANSIENT_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_uid_is_permanent() {
        let err = OperatorError::MissingUid("demo".into());
        assert!(err.is_permanent());
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn no_control_plane_machines_is_transient() {
        let err = OperatorError::NoControlPlaneMachines;
        assert!(!err.is_permanent());
        assert_eq!(err.class(), ErrorClass::Temporary);
    }
}
