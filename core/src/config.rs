//! Effective-policy resolution for a session tree.
//!
//! Precedence is defaults < `RLM_*` environment < per-request overrides,
//! after which the policy is frozen; nothing in the session tree mutates
//! it. Overrides are themselves subject to allow-rules (the restricted
//! profile refuses model overrides outright).

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;
use crate::error::RlmErr;
use crate::flags::RLM_ALLOWED_MODEL_PREFIXES;
use crate::flags::RLM_DENYLIST_GLOBS;
use crate::flags::RLM_ENABLED;
use crate::flags::RLM_MAX_SESSION_BUDGET_USD;
use crate::flags::RLM_MAX_SUBCALL_DEPTH;
use crate::flags::RLM_MAX_SUBCALLS_PER_SESSION;
use crate::flags::RLM_MAX_TURNS;
use crate::flags::RLM_MAX_WALL_MS;
use crate::flags::RLM_MODEL_TIMEOUT_MS;
use crate::flags::RLM_PROFILE;
use crate::flags::RLM_SANDBOX_TIMEOUT_MS;

pub const DEFAULT_MODEL: &str = "gpt-5";

/// Token cap for a fresh root budget. Not environment-tunable; hosts that
/// need a different ceiling pass an override.
pub const DEFAULT_MAX_TOKENS: u64 = 400_000;

/// Per-stream stdout/stderr cap for one action block.
pub const DEFAULT_MAX_STREAM_BYTES: usize = 64 * 1024;

/// Modules the sandbox may import unless the host narrows the list.
/// Everything here is pure computation; nothing reaches the filesystem,
/// network, or process table.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "collections",
    "functools",
    "itertools",
    "json",
    "math",
    "re",
    "textwrap",
];

/// Builtins shadowed inside the interpreter to raise `SandboxViolation`.
pub const DEFAULT_BLOCKED_BUILTINS: &[&str] = &[
    "breakpoint",
    "compile",
    "eval",
    "exec",
    "exit",
    "help",
    "input",
    "memoryview",
    "open",
    "quit",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Loose caps; model override permitted.
    #[default]
    Open,
    /// Model allow-list enforced; no model override.
    Restricted,
}

impl Profile {
    pub fn parse(s: &str) -> Option<Profile> {
        match s {
            "open" => Some(Profile::Open),
            "restricted" => Some(Profile::Restricted),
            _ => None,
        }
    }
}

/// Immutable budget ceilings configured for a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub max_tokens: u64,
    pub max_cost_usd: f64,
    pub max_turns: u32,
    pub max_wall_ms: u64,
    pub max_subcall_depth: u32,
    pub max_subcalls_per_session: u32,
}

/// Fractions of the parent's *remaining* allowance minted into a child
/// budget at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InheritanceFractions {
    pub tokens: f64,
    pub cost: f64,
    pub wall: f64,
}

impl Default for InheritanceFractions {
    fn default() -> Self {
        Self {
            tokens: 0.5,
            cost: 0.5,
            wall: 0.5,
        }
    }
}

/// The immutable policy consumed by the sandbox, governor, and runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub enabled: bool,
    pub profile: Profile,
    pub model: String,
    pub allowed_model_prefixes: Vec<String>,
    pub allow_model_override: bool,
    pub denylist_globs: Vec<String>,
    pub allowed_modules: Vec<String>,
    pub blocked_builtins: Vec<String>,
    pub caps: BudgetCaps,
    pub inherit: InheritanceFractions,
    /// Turns kept verbatim in the prompt; older turns are summarised.
    pub history_window: usize,
    /// Opt-in regex semantics for `search_pattern`; substring otherwise.
    pub regex_search: bool,
    /// Consecutive budget denials tolerated before forced finalization.
    pub denial_threshold: u32,
    /// Retries for transient model-transport errors.
    pub model_retry_limit: u64,
    pub sandbox_timeout: Duration,
    pub model_timeout: Duration,
    pub max_stream_bytes: usize,
}

/// Strongly-typed per-request overrides. `None` leaves the resolved value
/// in place.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    pub model: Option<String>,
    pub profile: Option<Profile>,
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
    pub max_turns: Option<u32>,
    pub max_wall_ms: Option<u64>,
    pub max_subcall_depth: Option<u32>,
    pub max_subcalls_per_session: Option<u32>,
    pub denylist_globs: Option<Vec<String>>,
    pub allowed_modules: Option<Vec<String>>,
    pub regex_search: Option<bool>,
    pub sandbox_timeout: Option<Duration>,
    pub model_timeout: Option<Duration>,
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Policy {
    /// Resolve the base policy from compiled defaults and the `RLM_*`
    /// environment. Overrides are applied separately so the allow-rules in
    /// [`Policy::apply_overrides`] stay testable in isolation.
    pub fn from_env() -> Policy {
        let profile = Profile::parse(&RLM_PROFILE).unwrap_or_default();
        Policy {
            enabled: *RLM_ENABLED,
            profile,
            model: DEFAULT_MODEL.to_string(),
            allowed_model_prefixes: split_csv(&RLM_ALLOWED_MODEL_PREFIXES),
            allow_model_override: profile == Profile::Open,
            denylist_globs: split_csv(&RLM_DENYLIST_GLOBS),
            allowed_modules: DEFAULT_ALLOWED_MODULES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            blocked_builtins: DEFAULT_BLOCKED_BUILTINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            caps: BudgetCaps {
                max_tokens: DEFAULT_MAX_TOKENS,
                max_cost_usd: *RLM_MAX_SESSION_BUDGET_USD,
                max_turns: *RLM_MAX_TURNS,
                max_wall_ms: *RLM_MAX_WALL_MS,
                max_subcall_depth: *RLM_MAX_SUBCALL_DEPTH,
                max_subcalls_per_session: *RLM_MAX_SUBCALLS_PER_SESSION,
            },
            inherit: InheritanceFractions::default(),
            history_window: 8,
            regex_search: false,
            denial_threshold: 2,
            model_retry_limit: 3,
            sandbox_timeout: *RLM_SANDBOX_TIMEOUT_MS,
            model_timeout: *RLM_MODEL_TIMEOUT_MS,
            max_stream_bytes: DEFAULT_MAX_STREAM_BYTES,
        }
    }

    /// Apply per-request overrides, enforcing the profile's allow-rules,
    /// and freeze the result.
    pub fn apply_overrides(mut self, overrides: PolicyOverrides) -> Result<Policy> {
        if let Some(profile) = overrides.profile {
            self.profile = profile;
            self.allow_model_override = profile == Profile::Open;
        }

        if let Some(model) = overrides.model {
            if !self.allow_model_override {
                return Err(RlmErr::PolicyViolation(format!(
                    "model override to `{model}` is not permitted under the {:?} profile",
                    self.profile
                )));
            }
            self.model = model;
        }

        if self.profile == Profile::Restricted {
            let model = &self.model;
            let admitted = self
                .allowed_model_prefixes
                .iter()
                .any(|prefix| model.starts_with(prefix.as_str()));
            if !admitted {
                return Err(RlmErr::PolicyViolation(format!(
                    "model `{model}` does not match any allowed prefix"
                )));
            }
        }

        if let Some(v) = overrides.max_tokens {
            self.caps.max_tokens = v;
        }
        if let Some(v) = overrides.max_cost_usd {
            self.caps.max_cost_usd = v;
        }
        if let Some(v) = overrides.max_turns {
            self.caps.max_turns = v;
        }
        if let Some(v) = overrides.max_wall_ms {
            self.caps.max_wall_ms = v;
        }
        if let Some(v) = overrides.max_subcall_depth {
            self.caps.max_subcall_depth = v;
        }
        if let Some(v) = overrides.max_subcalls_per_session {
            self.caps.max_subcalls_per_session = v;
        }
        if let Some(v) = overrides.denylist_globs {
            self.denylist_globs = v;
        }
        if let Some(v) = overrides.allowed_modules {
            self.allowed_modules = v;
        }
        if let Some(v) = overrides.regex_search {
            self.regex_search = v;
        }
        if let Some(v) = overrides.sandbox_timeout {
            self.sandbox_timeout = v;
        }
        if let Some(v) = overrides.model_timeout {
            self.model_timeout = v;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    fn open_policy() -> Policy {
        Policy::from_env()
    }

    #[test]
    fn open_profile_permits_model_override() {
        let policy = open_policy()
            .apply_overrides(PolicyOverrides {
                model: Some("experimental-model".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(policy.model, "experimental-model");
    }

    #[test]
    fn restricted_profile_denies_model_override() {
        let err = open_policy()
            .apply_overrides(PolicyOverrides {
                profile: Some(Profile::Restricted),
                model: Some("anything".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, RlmErr::PolicyViolation(_)));
    }

    #[test]
    fn restricted_profile_enforces_prefix_allow_list() {
        let mut base = open_policy();
        base.model = "llama-local".to_string();
        let err = base
            .apply_overrides(PolicyOverrides {
                profile: Some(Profile::Restricted),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, RlmErr::PolicyViolation(_)));
    }

    #[test]
    fn restricted_profile_admits_allow_listed_model() {
        let policy = open_policy()
            .apply_overrides(PolicyOverrides {
                profile: Some(Profile::Restricted),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(policy.model, DEFAULT_MODEL);
        assert!(!policy.allow_model_override);
    }

    #[test]
    fn cap_overrides_are_applied() {
        let policy = open_policy()
            .apply_overrides(PolicyOverrides {
                max_turns: Some(2),
                max_subcall_depth: Some(0),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(policy.caps.max_turns, 2);
        assert_eq!(policy.caps.max_subcall_depth, 0);
    }

    #[test]
    fn csv_splitting_trims_and_drops_empties() {
        assert_eq!(
            split_csv(" a.pem , ,b.key"),
            vec!["a.pem".to_string(), "b.key".to_string()]
        );
    }
}
