//! Shared fixtures for the integration suites: a small indexed repository
//! and policy/request builders wired to the scripted transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use rlm_core::InMemoryIndex;
use rlm_core::Policy;
use rlm_core::Relation;
use rlm_core::ScriptedTransport;
use rlm_core::SessionResult;
use rlm_core::SpanKind;
use rlm_core::session::RunRequest;

/// A toy repository: a CLI entry point calling into a session type whose
/// `run` method drives sandbox execution.
pub fn sample_index() -> InMemoryIndex {
    let mut index = InMemoryIndex::new();
    index.add_file(
        "rlm/config.py",
        "# defaults\nmax_session_budget_usd = 100.0\nmax_turns = 24\n",
    );
    index.add_file(
        "rlm/cli.py",
        "def main():\n    session = RLMSession()\n    session.run()\n",
    );
    index.add_file(
        "rlm/session.py",
        "class RLMSession:\n    def run(self):\n        execute_action()\n        return True\n",
    );
    index.add_file(
        "rlm/sandbox.py",
        "def execute_action():\n    interpret()\n\ndef interpret():\n    pass\n",
    );

    let main_span = index
        .span("rlm/cli.py", 1, 3, SpanKind::Function, Some("rlm.cli.main"))
        .expect("span");
    let class_span = index
        .span("rlm/session.py", 1, 4, SpanKind::Class, Some("rlm.session.RLMSession"))
        .expect("span");
    let run_span = index
        .span(
            "rlm/session.py",
            2,
            4,
            SpanKind::Method,
            Some("rlm.session.RLMSession.run"),
        )
        .expect("span");
    let exec_span = index
        .span(
            "rlm/sandbox.py",
            1,
            2,
            SpanKind::Function,
            Some("rlm.sandbox.execute_action"),
        )
        .expect("span");
    let interpret_span = index
        .span(
            "rlm/sandbox.py",
            4,
            5,
            SpanKind::Function,
            Some("rlm.sandbox.interpret"),
        )
        .expect("span");

    index.add_symbol("rlm.cli.main", SpanKind::Function, vec![main_span]);
    index.add_symbol("rlm.session.RLMSession", SpanKind::Class, vec![class_span]);
    index.add_symbol("rlm.session.RLMSession.run", SpanKind::Method, vec![run_span]);
    index.add_symbol("rlm.sandbox.execute_action", SpanKind::Function, vec![exec_span]);
    index.add_symbol("rlm.sandbox.interpret", SpanKind::Function, vec![interpret_span]);

    index.add_edge("rlm.cli.main", Relation::Calls, "rlm.session.RLMSession.run");
    index.add_edge(
        "rlm.session.RLMSession.run",
        Relation::Calls,
        "rlm.sandbox.execute_action",
    );
    index.add_edge(
        "rlm.sandbox.execute_action",
        Relation::Calls,
        "rlm.sandbox.interpret",
    );
    index.set_entry_points(vec!["rlm.cli.main".to_string()]);
    index
}

pub fn test_policy() -> Policy {
    Policy::from_env()
}

pub fn request_with(
    task: &str,
    index: InMemoryIndex,
    transport: Arc<ScriptedTransport>,
    policy: Policy,
) -> RunRequest {
    RunRequest {
        task: task.to_string(),
        snapshot: Arc::new(index),
        transport,
        policy,
        context: BTreeMap::new(),
        cancel: None,
        recorder: None,
    }
}

/// Sum of model tokens recorded across the trace, for invariant checks.
pub fn traced_tokens(result: &SessionResult) -> u64 {
    result
        .trace
        .iter()
        .map(|t| t.tokens_in + t.tokens_out)
        .sum()
}
