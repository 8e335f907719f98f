//! Value types shared across the session runtime, sandbox, navigation
//! facade, and trace record. Everything here is serde-serializable so turn
//! records can be persisted as JSONL and inspected after the fact.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use sha1::Digest;
use sha1::Sha1;
use uuid::Uuid;

/// What kind of source construct a span covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Function,
    Class,
    Method,
    Module,
    Block,
    Other,
}

/// Immutable coordinates for one contiguous piece of source.
///
/// A span never carries its source text; `Nav::read_span` materialises the
/// text on demand so iterating over a thousand spans costs no I/O. Two
/// spans with equal `digest` have identical source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSpan {
    /// Path relative to the repository root.
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub language: String,
    pub kind: SpanKind,
    /// Qualified name, when the span defines a named symbol.
    pub symbol: Option<String>,
    /// Content hash of the span's source text.
    pub digest: String,
}

/// Edge kinds in the symbol relation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Calls,
    CalledBy,
    Imports,
    ImportedBy,
    Inherits,
    InheritedBy,
}

impl Relation {
    /// The opposite edge direction; inserting an edge implies its inverse.
    pub fn inverse(self) -> Relation {
        match self {
            Relation::Calls => Relation::CalledBy,
            Relation::CalledBy => Relation::Calls,
            Relation::Imports => Relation::ImportedBy,
            Relation::ImportedBy => Relation::Imports,
            Relation::Inherits => Relation::InheritedBy,
            Relation::InheritedBy => Relation::Inherits,
        }
    }

    pub fn parse(s: &str) -> Option<Relation> {
        match s {
            "calls" => Some(Relation::Calls),
            "called_by" => Some(Relation::CalledBy),
            "imports" => Some(Relation::Imports),
            "imported_by" => Some(Relation::ImportedBy),
            "inherits" => Some(Relation::Inherits),
            "inherited_by" => Some(Relation::InheritedBy),
            _ => None,
        }
    }
}

/// A named symbol with its defining spans. Edge endpoints always resolve to
/// another symbol in the same snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub qualified_name: String,
    pub kind: SpanKind,
    pub spans: Vec<CodeSpan>,
}

/// Compact symbol listing entry, ordered by (path, start_line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub qualified_name: String,
    pub kind: SpanKind,
    pub path: String,
    pub start_line: u32,
}

/// Deterministic repository summary used for bootstrap turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoOverview {
    pub file_count: usize,
    pub span_count: usize,
    /// Highest edge-degree files first, capped by the caller.
    pub hot_files: Vec<String>,
    pub entry_points: Vec<String>,
}

/// What the sandbox hands back for one action block, captured exactly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub stdout: String,
    pub stderr: String,
    /// Repr of the action block's final expression, when there was one.
    pub return_repr: Option<String>,
    pub runtime_ms: u64,
    /// True when either stream overflowed its cap.
    pub truncated: bool,
    /// Pre-truncation byte counts, preserved for the turn record.
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

impl Observation {
    /// Render the observation the way it is fed back to the model.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&self.stdout);
        }
        if !self.stderr.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("[stderr]\n");
            out.push_str(&self.stderr);
        }
        if let Some(repr) = &self.return_repr
            && !repr.is_empty()
        {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("=> ");
            out.push_str(repr);
        }
        if self.truncated {
            out.push_str("\n[output truncated]");
        }
        if out.is_empty() {
            out.push_str("(no output)");
        }
        out
    }

    pub fn total_bytes(&self) -> u64 {
        self.stdout_bytes + self.stderr_bytes
    }
}

/// How a turn concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    ActionOk,
    ActionError,
    Finalize,
    SubcallOk,
    SubcallError,
    BudgetDenied,
}

/// Truncated view of an observation kept in the turn record. The head is
/// clipped; the full pre-clip length is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationHead {
    pub head: String,
    pub total_bytes: u64,
    pub truncated: bool,
}

/// Append-only record of one turn within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_index: u32,
    pub prompt_digest: String,
    pub response_text: String,
    pub action_code: Option<String>,
    pub observation: Option<ObservationHead>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub wall_ms: u64,
    pub outcome: TurnOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Finalized,
    Failed,
    Aborted,
}

/// Error surfaced through `SessionResult`; fatal sessions still return a
/// summary and partial trace rather than propagating an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionError {
    pub kind: String,
    pub message: String,
}

/// Per-session roll-up emitted once the session reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub task_digest: String,
    pub depth: u32,
    pub status: SessionStatus,
    pub turns_used: u32,
    pub tokens_used: u64,
    pub cost_usd_used: f64,
    pub wall_ms_used: u64,
    pub subcalls_spawned: u32,
    pub max_depth_reached: u32,
    /// Sealed child summaries in spawn order; describes the tree shape.
    pub children: Vec<SessionSummary>,
}

/// Everything `run()` hands back to the host. Exactly one of `answer` and
/// `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub answer: Option<String>,
    pub error: Option<SessionError>,
    pub summary: SessionSummary,
    pub trace: Vec<TurnRecord>,
}

impl SessionResult {
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// Named text blobs injected into the sandbox as globals. BTreeMap keeps
/// prompt assembly and handshake framing deterministic.
pub type ContextBlobs = BTreeMap<String, String>;

/// Content hash used for span digests and prompt/task digests.
pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equal_source_means_equal_digest() {
        assert_eq!(content_digest("fn main() {}"), content_digest("fn main() {}"));
        assert_ne!(content_digest("a"), content_digest("b"));
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&TurnOutcome::BudgetDenied).unwrap();
        assert_eq!(json, "\"budget_denied\"");
    }

    #[test]
    fn relation_parses_edge_names() {
        assert_eq!(Relation::parse("called_by"), Some(Relation::CalledBy));
        assert_eq!(Relation::parse("holds_lock"), None);
    }

    #[test]
    fn observation_render_combines_streams() {
        let obs = Observation {
            stdout: "hello".to_string(),
            stderr: "warn".to_string(),
            return_repr: Some("42".to_string()),
            runtime_ms: 3,
            truncated: false,
            stdout_bytes: 5,
            stderr_bytes: 4,
        };
        assert_eq!(obs.render(), "hello\n[stderr]\nwarn\n=> 42");
    }

    #[test]
    fn empty_observation_renders_placeholder() {
        assert_eq!(Observation::default().render(), "(no output)");
    }
}
