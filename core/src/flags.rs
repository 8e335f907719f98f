use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Global feature flag; when false every request fails with `Disabled`.
    pub RLM_ENABLED: bool = true;

    /// "open" or "restricted".
    pub RLM_PROFILE: &str = "open";

    /// Default cost cap for a fresh root budget.
    pub RLM_MAX_SESSION_BUDGET_USD: f64 = 10.0;

    pub RLM_MAX_SUBCALL_DEPTH: u32 = 2;
    pub RLM_MAX_SUBCALLS_PER_SESSION: u32 = 4;
    pub RLM_MAX_TURNS: u32 = 24;
    pub RLM_MAX_WALL_MS: u64 = 600_000;

    /// Comma-separated model-name prefixes admitted under the restricted
    /// profile.
    pub RLM_ALLOWED_MODEL_PREFIXES: &str = "gpt-,o3,o4";

    /// Comma-separated globs the sandbox must never read.
    pub RLM_DENYLIST_GLOBS: &str = "*.pem,*.key,*secret*,*credential*,.env*";

    pub RLM_SANDBOX_TIMEOUT_MS: Duration = Duration::from_millis(30_000), |value| {
        value.parse().map(Duration::from_millis)
    };
    pub RLM_MODEL_TIMEOUT_MS: Duration = Duration::from_millis(60_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
