use serde::{Deserialize, Serialize};

/// Request lifecycle states.
///
/// Legal paths: `submitted -> pending -> {approved, denied, expired}` and
/// `approved -> running -> {completed, failed}`. A queued approval stays
/// `approved` until an executor slot frees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Submitted,
    Pending,
    Approved,
    Denied,
    Expired,
    Running,
    Completed,
    Failed,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::Submitted => "submitted",
            RequestState::Pending => "pending",
            RequestState::Approved => "approved",
            RequestState::Denied => "denied",
            RequestState::Expired => "expired",
            RequestState::Running => "running",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Denied
                | RequestState::Expired
                | RequestState::Completed
                | RequestState::Failed
        )
    }
}

impl std::str::FromStr for RequestState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(RequestState::Submitted),
            "pending" => Ok(RequestState::Pending),
            "approved" => Ok(RequestState::Approved),
            "denied" => Ok(RequestState::Denied),
            "expired" => Ok(RequestState::Expired),
            "running" => Ok(RequestState::Running),
            "completed" => Ok(RequestState::Completed),
            "failed" => Ok(RequestState::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: RequestState,
    pub to: RequestState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal state transition {} -> {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

/// Checks a single state transition against the lifecycle machine.
pub fn transition(from: RequestState, to: RequestState) -> Result<(), TransitionError> {
    use RequestState::*;

    let allowed = matches!(
        (from, to),
        (Submitted, Pending)
            | (Pending, Approved)
            | (Pending, Denied)
            | (Pending, Expired)
            | (Approved, Running)
            | (Running, Completed)
            | (Running, Failed)
    );

    if allowed {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}
