//! The session runtime: one model↔sandbox loop per session, recursing
//! into owned sub-sessions when the model asks for them.
//!
//! A session exclusively owns its budget, its sandbox process, and its
//! turn log. Children run sequentially inside the parent's action turn
//! and are sealed (summary recorded, sandbox down) before the parent's
//! observation is assembled. Fatal outcomes never escape `run` as errors;
//! they come back inside `SessionResult` with the partial trace.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::budget::Budget;
use crate::client::ModelCall;
use crate::client::ModelClient;
use crate::client::ModelTransport;
use crate::config::Policy;
use crate::error::DeniedReason;
use crate::error::NavErr;
use crate::error::RlmErr;
use crate::error::SandboxErr;
use crate::error::observation_error_text;
use crate::index::RepositorySnapshot;
use crate::nav::Nav;
use crate::prompt::PromptInput;
use crate::prompt::build_prompt;
use crate::prompt::estimate_tokens;
use crate::protocol::ContextBlobs;
use crate::protocol::Observation;
use crate::protocol::ObservationHead;
use crate::protocol::SessionError;
use crate::protocol::SessionResult;
use crate::protocol::SessionStatus;
use crate::protocol::SessionSummary;
use crate::protocol::TurnOutcome;
use crate::protocol::TurnRecord;
use crate::protocol::content_digest;
use crate::response::ParsedResponse;
use crate::response::parse_response;
use crate::sandbox::ActionEvent;
use crate::sandbox::Sandbox;
use crate::trace::TraceRecorder;

/// Upper bound on completion tokens, used both as the transport request
/// limit and as the governor's completion projection.
const MAX_COMPLETION_TOKENS: u64 = 4_096;

/// Upper estimate of one model call's cost for the governor projection.
const PROJECTED_COST_PER_CALL_USD: f64 = 0.05;

/// Characters of observation kept verbatim in a turn record; the full
/// byte count is preserved alongside.
const OBSERVATION_HEAD_CHARS: usize = 2_048;

/// Consecutive malformed responses tolerated before aborting (the first
/// one earns a repair re-prompt).
const MALFORMED_STRIKE_LIMIT: u32 = 2;

/// Everything needed to run one root session.
pub struct RunRequest {
    pub task: String,
    pub snapshot: Arc<dyn RepositorySnapshot>,
    pub transport: Arc<dyn ModelTransport>,
    pub policy: Policy,
    pub context: ContextBlobs,
    pub cancel: Option<Arc<Notify>>,
    pub recorder: Option<TraceRecorder>,
}

/// Run a session tree to completion. Never panics and never returns an
/// `Err`: fatal outcomes are reported through `SessionResult::error` with
/// the summary and partial trace intact.
pub async fn run(request: RunRequest) -> SessionResult {
    let RunRequest {
        task,
        snapshot,
        transport,
        policy,
        context,
        cancel,
        recorder,
    } = request;

    let session_id = Uuid::new_v4();
    if !policy.enabled {
        let budget = Budget::root(&policy, session_id);
        return disabled_result(&task, &budget);
    }

    let cancel = cancel.unwrap_or_else(|| Arc::new(Notify::new()));
    let budget = Budget::root(&policy, session_id);
    let session = Session::new(
        task, snapshot, transport, policy, context, budget, cancel, recorder,
    );
    session.drive().await
}

fn disabled_result(task: &str, budget: &Budget) -> SessionResult {
    let err = RlmErr::Disabled;
    SessionResult {
        answer: None,
        error: Some(SessionError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }),
        summary: SessionSummary {
            session_id: budget.session_id,
            task_digest: content_digest(task),
            depth: budget.depth,
            status: SessionStatus::Failed,
            turns_used: 0,
            tokens_used: 0,
            cost_usd_used: 0.0,
            wall_ms_used: 0,
            subcalls_spawned: 0,
            max_depth_reached: budget.depth,
            children: Vec::new(),
        },
        trace: Vec::new(),
    }
}

/// How the current turn ended, before it is recorded.
enum TurnDisposition {
    Recorded,
    Finalized,
    Fatal(RlmErr),
}

struct Session {
    task: String,
    context: ContextBlobs,
    policy: Policy,
    snapshot: Arc<dyn RepositorySnapshot>,
    transport: Arc<dyn ModelTransport>,
    nav: Nav,
    client: ModelClient,
    budget: Budget,
    cancel: Arc<Notify>,
    recorder: Option<TraceRecorder>,

    sandbox: Option<Sandbox>,
    turn_log: Vec<TurnRecord>,
    status: SessionStatus,
    final_answer: Option<String>,
    fatal: Option<RlmErr>,
    children: Vec<SessionSummary>,
    max_depth_reached: u32,

    /// Notices injected into the next prompt (denials, repair hints).
    notices: Vec<String>,
    consecutive_denials: u32,
    last_denial: Option<DeniedReason>,
    malformed_strikes: u32,
    consecutive_crashes: u32,
    stale_refresh_spent: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    fn new(
        task: String,
        snapshot: Arc<dyn RepositorySnapshot>,
        transport: Arc<dyn ModelTransport>,
        policy: Policy,
        context: ContextBlobs,
        budget: Budget,
        cancel: Arc<Notify>,
        recorder: Option<TraceRecorder>,
    ) -> Session {
        let nav = Nav::new(Arc::clone(&snapshot), &policy);
        let client = ModelClient::new(Arc::clone(&transport), &policy);
        let max_depth_reached = budget.depth;
        Session {
            task,
            context,
            policy,
            snapshot,
            transport,
            nav,
            client,
            budget,
            cancel,
            recorder,
            sandbox: None,
            turn_log: Vec::new(),
            status: SessionStatus::Running,
            final_answer: None,
            fatal: None,
            children: Vec::new(),
            max_depth_reached,
            notices: Vec::new(),
            consecutive_denials: 0,
            last_denial: None,
            malformed_strikes: 0,
            consecutive_crashes: 0,
            stale_refresh_spent: false,
        }
    }

    /// Boxed so sub-sessions can recurse from inside the parent's action.
    fn drive(mut self) -> BoxFuture<'static, SessionResult> {
        Box::pin(async move {
            if let Some(recorder) = &self.recorder {
                recorder
                    .record_meta(self.budget.session_id, &content_digest(&self.task))
                    .await;
            }
            info!(
                session_id = %self.budget.session_id,
                depth = self.budget.depth,
                "session started"
            );

            while self.status == SessionStatus::Running {
                match self.turn().await {
                    TurnDisposition::Recorded => {}
                    TurnDisposition::Finalized => {
                        self.status = SessionStatus::Finalized;
                    }
                    TurnDisposition::Fatal(err) => {
                        self.status = match err {
                            RlmErr::Cancelled
                            | RlmErr::MalformedResponse
                            | RlmErr::BudgetExhausted(_) => SessionStatus::Aborted,
                            _ => SessionStatus::Failed,
                        };
                        self.fatal = Some(err);
                    }
                }
            }

            self.teardown().await;
            self.into_result().await
        })
    }

    async fn turn(&mut self) -> TurnDisposition {
        // Budget denials past the threshold force finalization with
        // whatever partial answer exists, instead of spinning fruitlessly.
        // With nothing gathered at all, exhaustion is terminal instead.
        if self.consecutive_denials >= self.policy.denial_threshold {
            if self.turn_log.iter().any(|t| t.observation.is_some()) {
                self.final_answer = Some(self.partial_answer());
                return TurnDisposition::Finalized;
            }
            let reason = self.last_denial.unwrap_or(DeniedReason::Tokens);
            return TurnDisposition::Fatal(RlmErr::BudgetExhausted(reason));
        }

        let notices = std::mem::take(&mut self.notices);
        let prompt = build_prompt(&PromptInput {
            task: &self.task,
            history: &self.turn_log,
            context: &self.context,
            history_window: self.policy.history_window,
            notices: &notices,
        });
        let prompt_digest = content_digest(&prompt);

        let projected_tokens = estimate_tokens(&prompt) + MAX_COMPLETION_TOKENS;
        if let Err(reason) = self.budget.admit_model_call(
            projected_tokens,
            PROJECTED_COST_PER_CALL_USD,
            self.policy.model_timeout.as_millis() as u64,
        ) {
            let record = TurnRecord {
                turn_index: self.turn_log.len() as u32,
                prompt_digest,
                response_text: String::new(),
                action_code: None,
                observation: None,
                tokens_in: 0,
                tokens_out: 0,
                cost_usd: 0.0,
                wall_ms: 0,
                outcome: TurnOutcome::BudgetDenied,
            };
            return self.record_denied(record, reason).await;
        }

        let request = ModelCall {
            model: self.policy.model.clone(),
            prompt,
            max_completion_tokens: MAX_COMPLETION_TOKENS,
        };
        let started = Instant::now();
        let completion = tokio::select! {
            result = self.client.call(&request) => match result {
                Ok(completion) => completion,
                Err(err) => return TurnDisposition::Fatal(err),
            },
            _ = self.cancel.notified() => return TurnDisposition::Fatal(RlmErr::Cancelled),
        };
        let model_wall_ms = started.elapsed().as_millis() as u64;
        self.budget
            .charge_model_call(completion.tokens_in, completion.tokens_out, completion.cost_usd);
        self.budget.charge_wall(model_wall_ms);
        self.budget.charge_turn();

        let mut record = TurnRecord {
            turn_index: self.turn_log.len() as u32,
            prompt_digest,
            response_text: completion.text.clone(),
            action_code: None,
            observation: None,
            tokens_in: completion.tokens_in,
            tokens_out: completion.tokens_out,
            cost_usd: completion.cost_usd,
            wall_ms: model_wall_ms,
            outcome: TurnOutcome::ActionOk,
        };

        match parse_response(&completion.text) {
            Err(kind) => {
                self.malformed_strikes += 1;
                record.outcome = TurnOutcome::ActionError;
                if self.malformed_strikes >= MALFORMED_STRIKE_LIMIT {
                    self.record_turn(record).await;
                    return TurnDisposition::Fatal(RlmErr::MalformedResponse);
                }
                debug!("malformed response; issuing repair re-prompt");
                self.notices.push(kind.repair_hint().to_string());
                self.record_turn(record).await;
                TurnDisposition::Recorded
            }
            Ok(ParsedResponse::Final { answer }) => {
                self.malformed_strikes = 0;
                self.consecutive_denials = 0;
                record.outcome = TurnOutcome::Finalize;
                self.record_turn(record).await;
                self.final_answer = Some(answer);
                TurnDisposition::Finalized
            }
            Ok(ParsedResponse::Action { code }) => {
                self.malformed_strikes = 0;
                record.action_code = Some(code.clone());
                self.run_action(record, &code).await
            }
        }
    }

    async fn run_action(&mut self, mut record: TurnRecord, code: &str) -> TurnDisposition {
        let expected_ms = self.policy.sandbox_timeout.as_millis() as u64;
        if let Err(reason) = self.budget.admit_action(expected_ms) {
            record.outcome = TurnOutcome::BudgetDenied;
            return self.record_denied(record, reason).await;
        }

        let started = Instant::now();
        let outcome = self.execute_action(code).await;
        let action_wall_ms = started.elapsed().as_millis() as u64;
        self.budget.charge_wall(action_wall_ms);
        record.wall_ms += action_wall_ms;

        match outcome {
            Ok(turn) => {
                record.outcome = turn.outcome;
                record.observation = Some(turn.observation);
                if turn.outcome == TurnOutcome::BudgetDenied {
                    self.consecutive_denials += 1;
                } else {
                    self.consecutive_denials = 0;
                }
                self.record_turn(record).await;
                // A completed action proves the interpreter is healthy.
                if turn.interpreter_survived {
                    self.consecutive_crashes = 0;
                }
                if let Some(fatal) = turn.fatal {
                    return TurnDisposition::Fatal(fatal);
                }
                TurnDisposition::Recorded
            }
            Err(err) => {
                record.outcome = TurnOutcome::ActionError;
                self.record_turn(record).await;
                TurnDisposition::Fatal(err)
            }
        }
    }

    async fn ensure_sandbox(&mut self) -> Result<(), RlmErr> {
        if self.sandbox.is_none() {
            let sandbox = Sandbox::spawn(&self.policy, &self.context).await?;
            self.sandbox = Some(sandbox);
        }
        Ok(())
    }

    /// Execute one action block, serving sub-session requests as they
    /// arrive. Returns `Err` only for fatal conditions; recoverable
    /// sandbox trouble becomes an error observation for the model.
    async fn execute_action(&mut self, code: &str) -> Result<ActionTurn, RlmErr> {
        if let Err(err) = self.ensure_sandbox().await {
            return self.sandbox_failure(err).await;
        }
        {
            let Some(sandbox) = self.sandbox.as_mut() else {
                return Err(RlmErr::Sandbox(SandboxErr::Crash("sandbox vanished".into())));
            };
            if let Err(err) = sandbox.begin_action(code).await {
                return self.sandbox_failure(err).await;
            }
        }

        let mut subcall_outcome: Option<TurnOutcome> = None;
        loop {
            let event = {
                let Some(sandbox) = self.sandbox.as_mut() else {
                    return Err(RlmErr::Sandbox(SandboxErr::Crash("sandbox vanished".into())));
                };
                match sandbox.next_event(&self.nav, &self.cancel).await {
                    Ok(event) => event,
                    Err(err) => return self.sandbox_failure(err).await,
                }
            };
            match event {
                ActionEvent::SubcallRequested { task, context } => {
                    let reply = self.handle_subcall(task, context).await;
                    let (result, outcome) = match &reply {
                        SubcallReply::Denied(reason) => {
                            (Err(format!("BudgetDenied({reason})")), TurnOutcome::BudgetDenied)
                        }
                        SubcallReply::Answer(answer) => {
                            (Ok(answer.as_str()), TurnOutcome::SubcallOk)
                        }
                        SubcallReply::ChildError(message) => {
                            (Err(message.clone()), TurnOutcome::SubcallError)
                        }
                    };
                    // Denials dominate so the forced-finalization counter
                    // sees them; errors dominate successes.
                    subcall_outcome = Some(match (subcall_outcome, outcome) {
                        (Some(TurnOutcome::BudgetDenied), _) | (_, TurnOutcome::BudgetDenied) => {
                            TurnOutcome::BudgetDenied
                        }
                        (Some(TurnOutcome::SubcallError), _) | (_, TurnOutcome::SubcallError) => {
                            TurnOutcome::SubcallError
                        }
                        _ => TurnOutcome::SubcallOk,
                    });
                    let Some(sandbox) = self.sandbox.as_mut() else {
                        return Err(RlmErr::Sandbox(SandboxErr::Crash("sandbox vanished".into())));
                    };
                    if let Err(err) = sandbox.resume_with_sub_result(result).await {
                        return self.sandbox_failure(err).await;
                    }
                }
                ActionEvent::Completed { observation, failed } => {
                    let fault = self
                        .sandbox
                        .as_mut()
                        .and_then(|sandbox| sandbox.take_nav_fault());
                    let fatal = match fault {
                        Some(NavErr::IndexUnavailable(detail)) => {
                            Some(RlmErr::Nav(NavErr::IndexUnavailable(detail)))
                        }
                        Some(NavErr::Stale { path }) => self.handle_stale(path),
                        _ => None,
                    };
                    let outcome = match subcall_outcome {
                        Some(outcome) => outcome,
                        None if failed => TurnOutcome::ActionError,
                        None => TurnOutcome::ActionOk,
                    };
                    return Ok(ActionTurn {
                        observation: head_of(&observation),
                        outcome,
                        fatal,
                        interpreter_survived: true,
                    });
                }
            }
        }
    }

    /// One snapshot refresh is attempted on the first stale read; a stale
    /// read after that (or a failed refresh) is fatal.
    fn handle_stale(&mut self, path: String) -> Option<RlmErr> {
        if self.stale_refresh_spent {
            return Some(RlmErr::Nav(NavErr::Stale { path }));
        }
        self.stale_refresh_spent = true;
        match self.snapshot.refresh() {
            Ok(()) => {
                warn!(path, "stale span; snapshot refreshed");
                None
            }
            Err(err) => Some(RlmErr::Nav(err)),
        }
    }

    /// Convert a sandbox-level failure into either a model-visible error
    /// observation or a fatal disposition (second consecutive crash,
    /// cancellation, internal errors).
    async fn sandbox_failure(&mut self, err: RlmErr) -> Result<ActionTurn, RlmErr> {
        match &err {
            RlmErr::Sandbox(SandboxErr::Timeout(_)) => {
                // The interpreter was killed with the timeout; state is
                // gone and the next action gets a fresh process.
                self.drop_sandbox().await;
                Ok(ActionTurn::errored(observation_error_text(&err)))
            }
            RlmErr::Sandbox(SandboxErr::Crash(_)) => {
                self.drop_sandbox().await;
                self.consecutive_crashes += 1;
                if self.consecutive_crashes >= 2 {
                    return Err(err);
                }
                warn!("sandbox crashed; will respawn once: {err}");
                let mut turn = ActionTurn::errored(observation_error_text(&err));
                turn.interpreter_survived = false;
                Ok(turn)
            }
            _ => Err(err),
        }
    }

    async fn drop_sandbox(&mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            sandbox.shutdown().await;
        }
    }

    async fn handle_subcall(&mut self, task: String, context: ContextBlobs) -> SubcallReply {
        if let Err(reason) = self.budget.admit_subcall() {
            debug!(%reason, "sub-session denied");
            return SubcallReply::Denied(reason);
        }

        let child_id = Uuid::new_v4();
        let child_budget = self.budget.mint_child(child_id);
        info!(
            parent = %self.budget.session_id,
            child = %child_id,
            depth = child_budget.depth,
            "spawning sub-session"
        );

        let child = Session::new(
            task,
            Arc::clone(&self.snapshot),
            Arc::clone(&self.transport),
            self.policy.clone(),
            context,
            child_budget,
            Arc::clone(&self.cancel),
            self.recorder.clone(),
        );
        let result = child.drive().await;

        self.budget.roll_up(&result.summary);
        self.max_depth_reached = self.max_depth_reached.max(result.summary.max_depth_reached);
        self.children.push(result.summary.clone());

        match result.answer {
            Some(answer) => SubcallReply::Answer(answer),
            None => {
                let message = result
                    .error
                    .map(|e| format!("sub-session failed ({}): {}", e.kind, e.message))
                    .unwrap_or_else(|| "sub-session produced no answer".to_string());
                SubcallReply::ChildError(message)
            }
        }
    }

    async fn record_denied(&mut self, record: TurnRecord, reason: DeniedReason) -> TurnDisposition {
        self.consecutive_denials += 1;
        self.last_denial = Some(reason);
        debug!(%reason, denials = self.consecutive_denials, "budget denied");
        self.notices.push(format!(
            "Budget denied ({reason}). Remaining allowance is too small for another step; \
             emit FINAL with your best answer so far."
        ));
        self.record_turn(record).await;
        TurnDisposition::Recorded
    }

    async fn record_turn(&mut self, record: TurnRecord) {
        if let Some(recorder) = &self.recorder {
            recorder.record_turn(self.budget.session_id, &record).await;
        }
        self.turn_log.push(record);
    }

    fn partial_answer(&self) -> String {
        let last_observation = self
            .turn_log
            .iter()
            .rev()
            .find_map(|turn| turn.observation.as_ref().map(|o| o.head.clone()));
        match last_observation {
            Some(head) => format!(
                "[partial] Budget exhausted before the task completed. Last observation:\n{head}"
            ),
            None => "[partial] Budget exhausted before any findings were gathered.".to_string(),
        }
    }

    /// Children are already sealed; kill our own sandbox and stop.
    async fn teardown(&mut self) {
        self.drop_sandbox().await;
    }

    async fn into_result(mut self) -> SessionResult {
        let summary = SessionSummary {
            session_id: self.budget.session_id,
            task_digest: content_digest(&self.task),
            depth: self.budget.depth,
            status: self.status,
            turns_used: self.budget.turns_used,
            tokens_used: self.budget.tokens_used,
            cost_usd_used: self.budget.cost_usd_used,
            wall_ms_used: self.budget.wall_ms_used,
            subcalls_spawned: self.budget.subcalls_spawned,
            max_depth_reached: self.max_depth_reached,
            children: std::mem::take(&mut self.children),
        };
        if let Some(recorder) = &self.recorder {
            recorder.record_summary(&summary).await;
        }
        info!(
            session_id = %summary.session_id,
            status = ?summary.status,
            turns = summary.turns_used,
            tokens = summary.tokens_used,
            "session sealed"
        );

        let error = self.fatal.take().map(|err| SessionError {
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
        SessionResult {
            answer: self.final_answer.take(),
            error,
            summary,
            trace: std::mem::take(&mut self.turn_log),
        }
    }
}

/// Result of one executed action block, pre-digested for the turn record.
struct ActionTurn {
    observation: ObservationHead,
    outcome: TurnOutcome,
    fatal: Option<RlmErr>,
    interpreter_survived: bool,
}

impl ActionTurn {
    fn errored(text: String) -> ActionTurn {
        let total = text.len() as u64;
        ActionTurn {
            observation: ObservationHead {
                head: text,
                total_bytes: total,
                truncated: false,
            },
            outcome: TurnOutcome::ActionError,
            fatal: None,
            interpreter_survived: true,
        }
    }
}

enum SubcallReply {
    Denied(DeniedReason),
    Answer(String),
    ChildError(String),
}

fn head_of(observation: &Observation) -> ObservationHead {
    let rendered = observation.render();
    let clipped: String = rendered.chars().take(OBSERVATION_HEAD_CHARS).collect();
    let was_clipped = rendered.chars().count() > OBSERVATION_HEAD_CHARS;
    ObservationHead {
        head: clipped,
        total_bytes: observation.total_bytes(),
        truncated: observation.truncated || was_clipped,
    }
}
