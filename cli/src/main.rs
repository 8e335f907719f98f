mod cli;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::error::ErrorKind;
use rlm_core::ModelCompletion;
use rlm_core::PolicyOverrides;
use rlm_core::ScriptedTransport;
use rlm_core::SessionResult;
use rlm_core::TraceRecorder;
use rlm_core::session::RunRequest;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;

const EXIT_OK: i32 = 0;
/// Misuse or invalid input (EX_USAGE).
const EXIT_USAGE: i32 = 64;
/// Tool disabled by policy (EX_UNAVAILABLE).
const EXIT_DISABLED: i32 = 69;
/// Budget exhausted (EX_SOFTWARE).
const EXIT_BUDGET: i32 = 70;
/// Sandbox policy violation surfaced as fatal (EX_CANTCREAT).
const EXIT_SANDBOX: i32 = 73;
/// Model unavailable (EX_TEMPFAIL).
const EXIT_MODEL: i32 = 75;

/// One scripted model reply, loaded from the --replies JSONL file.
#[derive(Debug, Deserialize)]
struct ReplyLine {
    text: String,
    #[serde(default = "default_tokens_in")]
    tokens_in: u64,
    #[serde(default = "default_tokens_out")]
    tokens_out: u64,
    #[serde(default)]
    cost_usd: f64,
}

fn default_tokens_in() -> u64 {
    200
}

fn default_tokens_out() -> u64 {
    60
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap renders --help/--version itself; everything else is
            // misuse.
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let code = run_main(cli).await;
    std::process::exit(code);
}

async fn run_main(cli: Cli) -> i32 {
    let request = match build_request(&cli).await {
        Ok(request) => request,
        Err(err) => {
            eprintln!("rlm: {err:#}");
            return EXIT_USAGE;
        }
    };

    let result = rlm_core::run(request).await;
    render(&cli, &result);
    exit_code_for(&result)
}

async fn build_request(cli: &Cli) -> anyhow::Result<RunRequest> {
    let index_raw = std::fs::read_to_string(&cli.repo_index)
        .with_context(|| format!("failed to read index {}", cli.repo_index.display()))?;
    let index: rlm_core::InMemoryIndex = serde_json::from_str(&index_raw)
        .with_context(|| format!("failed to parse index {}", cli.repo_index.display()))?;

    let transport = Arc::new(ScriptedTransport::new());
    for (line_no, line) in std::fs::read_to_string(&cli.replies)
        .with_context(|| format!("failed to read replies {}", cli.replies.display()))?
        .lines()
        .enumerate()
    {
        if line.trim().is_empty() {
            continue;
        }
        let reply: ReplyLine = serde_json::from_str(line)
            .with_context(|| format!("bad reply on line {}", line_no + 1))?;
        transport.push(ModelCompletion {
            text: reply.text,
            tokens_in: reply.tokens_in,
            tokens_out: reply.tokens_out,
            cost_usd: reply.cost_usd,
        });
    }

    let mut context = BTreeMap::new();
    for spec in &cli.context {
        let (name, path) = parse_context_spec(spec)?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read context blob {}", path.display()))?;
        context.insert(name.to_string(), text);
    }

    let policy = rlm_core::Policy::from_env()
        .apply_overrides(PolicyOverrides {
            model: cli.model.clone(),
            profile: cli.profile.map(Into::into),
            max_turns: cli.max_turns,
            max_subcall_depth: cli.max_depth,
            ..Default::default()
        })
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    debug!(model = %policy.model, profile = ?policy.profile, "policy resolved");

    let recorder = match &cli.trace {
        Some(path) => Some(
            TraceRecorder::to_file(path)
                .await
                .with_context(|| format!("failed to open trace {}", path.display()))?,
        ),
        None => None,
    };

    Ok(RunRequest {
        task: cli.task.clone(),
        snapshot: Arc::new(index),
        transport,
        policy,
        context,
        cancel: Some(notify_on_sigint()),
        recorder,
    })
}

fn parse_context_spec(spec: &str) -> anyhow::Result<(&str, &Path)> {
    let (name, path) = spec
        .split_once('=')
        .context("context must be NAME=FILE")?;
    if name.is_empty() {
        anyhow::bail!("context name must not be empty");
    }
    Ok((name, Path::new(path)))
}

/// Notify that fires when SIGINT arrives, propagated to the session tree
/// as its cancel token.
fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("keyboard interrupt");
                notify.notify_waiters();
            }
        }
    });
    notify
}

fn render(cli: &Cli, result: &SessionResult) {
    if cli.json {
        match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{json}"),
            Err(err) => eprintln!("rlm: failed to serialize result: {err}"),
        }
        return;
    }
    match (&result.answer, &result.error) {
        (Some(answer), _) => println!("{answer}"),
        (None, Some(error)) => eprintln!("rlm: session {}: {}", error.kind, error.message),
        (None, None) => eprintln!("rlm: session produced no answer"),
    }
}

fn exit_code_for(result: &SessionResult) -> i32 {
    let Some(error) = &result.error else {
        return EXIT_OK;
    };
    match error.kind.as_str() {
        "disabled" => EXIT_DISABLED,
        "budget_exhausted" => EXIT_BUDGET,
        "sandbox_violation" | "sandbox_crash" => EXIT_SANDBOX,
        "model_error" => EXIT_MODEL,
        "policy_violation" => EXIT_USAGE,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use rlm_core::SessionStatus;
    use rlm_core::SessionSummary;
    use rlm_core::protocol::SessionError;

    fn result_with_error(kind: &str) -> SessionResult {
        SessionResult {
            answer: None,
            error: Some(SessionError {
                kind: kind.to_string(),
                message: String::new(),
            }),
            summary: SessionSummary {
                session_id: uuid::Uuid::nil(),
                task_digest: String::new(),
                depth: 0,
                status: SessionStatus::Failed,
                turns_used: 0,
                tokens_used: 0,
                cost_usd_used: 0.0,
                wall_ms_used: 0,
                subcalls_spawned: 0,
                max_depth_reached: 0,
                children: Vec::new(),
            },
            trace: Vec::new(),
        }
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code_for(&result_with_error("disabled")), 69);
        assert_eq!(exit_code_for(&result_with_error("budget_exhausted")), 70);
        assert_eq!(exit_code_for(&result_with_error("sandbox_crash")), 73);
        assert_eq!(exit_code_for(&result_with_error("model_error")), 75);
        assert_eq!(exit_code_for(&result_with_error("policy_violation")), 64);
        assert_eq!(exit_code_for(&result_with_error("cancelled")), 1);
    }

    #[test]
    fn context_specs_split_on_first_equals() {
        let (name, path) = parse_context_spec("notes=docs/notes.txt").unwrap();
        assert_eq!(name, "notes");
        assert_eq!(path, Path::new("docs/notes.txt"));
        assert!(parse_context_spec("no-equals").is_err());
        assert!(parse_context_spec("=file").is_err());
    }
}
