use std::io;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, RlmErr>;

/// Why the governor refused a model call or sub-session spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedReason {
    Tokens,
    Cost,
    Turns,
    Wall,
    Depth,
    Siblings,
}

impl std::fmt::Display for DeniedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeniedReason::Tokens => "tokens",
            DeniedReason::Cost => "cost",
            DeniedReason::Turns => "turns",
            DeniedReason::Wall => "wall",
            DeniedReason::Depth => "depth",
            DeniedReason::Siblings => "siblings",
        };
        f.write_str(s)
    }
}

/// Which restriction an action block tripped inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Builtin,
    Module,
    Path,
    Network,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Builtin => "builtin",
            ViolationKind::Module => "module",
            ViolationKind::Path => "path",
            ViolationKind::Network => "network",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum SandboxErr {
    /// The action block attempted something the restriction policy forbids.
    /// Surfaced to the model as the action's output; never fatal on its own.
    #[error("sandbox violation ({kind}): {detail}")]
    Violation { kind: ViolationKind, detail: String },

    /// The action block exceeded its wall-clock allowance and the
    /// interpreter was interrupted.
    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    /// The interpreter process died unexpectedly. The session respawns it
    /// once; a second consecutive crash is fatal.
    #[error("sandbox interpreter crashed: {0}")]
    Crash(String),
}

#[derive(Error, Debug)]
pub enum NavErr {
    /// The search pattern could not be compiled. Surfaced to the model.
    #[error("bad search pattern: {0}")]
    BadPattern(String),

    /// The backing index cannot answer queries. Fatal for the session.
    #[error("repository index unavailable: {0}")]
    IndexUnavailable(String),

    /// A span's digest no longer matches disk content. One snapshot
    /// refresh is attempted before this becomes fatal.
    #[error("stale span: {path} changed since the snapshot was pinned")]
    Stale { path: String },
}

#[derive(Error, Debug)]
pub enum ModelErr {
    #[error("model transport unavailable: {0}")]
    Unavailable(String),

    /// Optionally carries the delay the provider asked us to wait before
    /// retrying.
    #[error("model rate limited")]
    RateLimited(Option<Duration>),

    #[error("model rejected the request as invalid: {0}")]
    Invalid(String),

    #[error("model refused the request: {0}")]
    Refused(String),
}

impl ModelErr {
    /// Transient kinds are retried with backoff; the rest bubble up.
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelErr::Unavailable(_) | ModelErr::RateLimited(_))
    }
}

#[derive(Error, Debug)]
pub enum RlmErr {
    /// The feature flag is off; the request fails before a session exists.
    #[error("recursive sessions are disabled by policy")]
    Disabled,

    /// Model override denied, denied model prefix, or a denied path at the
    /// policy layer.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// The governor refused past the consecutive-denial threshold.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(DeniedReason),

    /// The model produced neither an ACTION nor a FINAL block twice in a
    /// row (one repair re-prompt is attempted first).
    #[error("model response contained no ACTION or FINAL block")]
    MalformedResponse,

    /// External cancel signal observed between turns or mid-action.
    #[error("session cancelled")]
    Cancelled,

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("navigation error: {0}")]
    Nav(#[from] NavErr),

    #[error("model error: {0}")]
    Model(#[from] ModelErr),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl RlmErr {
    /// Stable machine-readable kind for trace records and `SessionResult`.
    pub fn kind(&self) -> &'static str {
        match self {
            RlmErr::Disabled => "disabled",
            RlmErr::PolicyViolation(_) => "policy_violation",
            RlmErr::BudgetExhausted(_) => "budget_exhausted",
            RlmErr::MalformedResponse => "malformed_response",
            RlmErr::Cancelled => "cancelled",
            RlmErr::Sandbox(SandboxErr::Violation { .. }) => "sandbox_violation",
            RlmErr::Sandbox(SandboxErr::Timeout(_)) => "sandbox_timeout",
            RlmErr::Sandbox(SandboxErr::Crash(_)) => "sandbox_crash",
            RlmErr::Nav(NavErr::BadPattern(_)) => "nav_bad_pattern",
            RlmErr::Nav(NavErr::IndexUnavailable(_)) => "nav_index_unavailable",
            RlmErr::Nav(NavErr::Stale { .. }) => "nav_stale",
            RlmErr::Model(_) => "model_error",
            RlmErr::Io(_) => "io",
            RlmErr::Json(_) => "json",
            RlmErr::TokioJoin(_) => "join",
        }
    }
}

/// Render a turn-scope error the way the model should see it: a structured
/// one-liner it can react to, not a Rust debug dump.
pub fn observation_error_text(e: &RlmErr) -> String {
    match e {
        RlmErr::Sandbox(SandboxErr::Violation { kind, detail }) => {
            format!("SandboxViolation({kind}): {detail}")
        }
        RlmErr::Sandbox(SandboxErr::Timeout(limit)) => {
            format!("SandboxTimeout: action exceeded {}ms", limit.as_millis())
        }
        RlmErr::Sandbox(SandboxErr::Crash(detail)) => {
            format!("SandboxCrash: {detail}")
        }
        RlmErr::Nav(NavErr::BadPattern(detail)) => format!("NavError(BadPattern): {detail}"),
        RlmErr::Nav(NavErr::Stale { path }) => format!("NavError(Stale): {path}"),
        _ => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_reason_displays_lowercase_names() {
        assert_eq!(DeniedReason::Tokens.to_string(), "tokens");
        assert_eq!(DeniedReason::Siblings.to_string(), "siblings");
    }

    #[test]
    fn violation_renders_kind_and_detail_for_model() {
        let err = RlmErr::Sandbox(SandboxErr::Violation {
            kind: ViolationKind::Path,
            detail: "/etc/passwd is outside the repository root".to_string(),
        });
        assert_eq!(
            observation_error_text(&err),
            "SandboxViolation(path): /etc/passwd is outside the repository root"
        );
    }

    #[test]
    fn transient_model_errors_are_retryable() {
        assert!(ModelErr::Unavailable("conn refused".into()).is_transient());
        assert!(ModelErr::RateLimited(None).is_transient());
        assert!(!ModelErr::Refused("no".into()).is_transient());
    }
}
