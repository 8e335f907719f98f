//! Root of the `rlm-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack or the caller.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod budget;
pub mod client;
pub mod config;
pub mod error;
mod flags;
pub mod index;
pub mod nav;
mod prompt;
pub mod protocol;
mod response;
pub mod sandbox;
pub mod session;
pub mod trace;
mod util;

pub use budget::Budget;
pub use client::ModelCall;
pub use client::ModelClient;
pub use client::ModelCompletion;
pub use client::ModelTransport;
pub use client::ScriptedTransport;
pub use config::Policy;
pub use config::PolicyOverrides;
pub use config::Profile;
pub use error::DeniedReason;
pub use error::ModelErr;
pub use error::NavErr;
pub use error::Result;
pub use error::RlmErr;
pub use error::SandboxErr;
pub use error::ViolationKind;
pub use index::InMemoryIndex;
pub use index::RepositorySnapshot;
pub use nav::Nav;
pub use protocol::CodeSpan;
pub use protocol::ContextBlobs;
pub use protocol::Observation;
pub use protocol::Relation;
pub use protocol::SessionResult;
pub use protocol::SessionStatus;
pub use protocol::SessionSummary;
pub use protocol::SpanKind;
pub use protocol::Symbol;
pub use protocol::TurnOutcome;
pub use protocol::TurnRecord;
pub use session::RunRequest;
pub use session::run;
pub use trace::TraceRecorder;
