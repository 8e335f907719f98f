//! Prompt assembly for one model turn.
//!
//! The last `history_window` turns appear verbatim; older turns collapse
//! to a one-line summary of their action and observation head, so the
//! prompt stays bounded however long the session runs.

use crate::protocol::ContextBlobs;
use crate::protocol::TurnOutcome;
use crate::protocol::TurnRecord;

/// System preamble describing the nav API and the ACTION/FINAL contract.
pub const SYSTEM_PREAMBLE: &str = include_str!("prompt.md");

/// Characters of observation head shown for a summarised (older) turn.
const SUMMARY_OBS_CHARS: usize = 160;

/// Characters of action code shown for a summarised (older) turn.
const SUMMARY_CODE_CHARS: usize = 120;

/// Crude token estimate used for budget projection: ~4 chars per token,
/// matching the usual BPE ballpark.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64) / 4 + 1
}

pub struct PromptInput<'a> {
    pub task: &'a str,
    pub history: &'a [TurnRecord],
    pub context: &'a ContextBlobs,
    pub history_window: usize,
    /// Notices to surface this turn (budget denials, repair hints).
    pub notices: &'a [String],
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let mut prompt = String::with_capacity(SYSTEM_PREAMBLE.len() + 1024);
    prompt.push_str(SYSTEM_PREAMBLE);

    prompt.push_str("\n## Task\n\n");
    prompt.push_str(input.task);
    prompt.push('\n');

    if !input.context.is_empty() {
        prompt.push_str("\n## Context\n\n");
        for (name, text) in input.context {
            prompt.push_str(&format!("- `{name}` ({} bytes)\n", text.len()));
        }
    }

    if !input.history.is_empty() {
        prompt.push_str("\n## History\n");
        let verbatim_from = input.history.len().saturating_sub(input.history_window);
        for (idx, turn) in input.history.iter().enumerate() {
            if idx < verbatim_from {
                prompt.push_str(&summarise_turn(turn));
            } else {
                prompt.push_str(&render_turn(turn));
            }
        }
    }

    for notice in input.notices {
        prompt.push_str("\n## Notice\n\n");
        prompt.push_str(notice);
        prompt.push('\n');
    }

    prompt.push_str("\nReply with exactly one ACTION or FINAL block.\n");
    prompt
}

fn summarise_turn(turn: &TurnRecord) -> String {
    let action = turn
        .action_code
        .as_deref()
        .map(|code| clip(code.trim(), SUMMARY_CODE_CHARS))
        .unwrap_or_else(|| "(no action)".to_string());
    let obs = turn
        .observation
        .as_ref()
        .map(|o| clip(&o.head, SUMMARY_OBS_CHARS))
        .unwrap_or_default();
    format!(
        "\nturn {} [{}]: {} => {}\n",
        turn.turn_index,
        outcome_label(turn.outcome),
        action,
        obs
    )
}

fn render_turn(turn: &TurnRecord) -> String {
    let mut out = format!("\n### Turn {}\n\n", turn.turn_index);
    if let Some(code) = &turn.action_code {
        out.push_str("Action:\n```\n");
        out.push_str(code);
        out.push_str("\n```\n");
    } else {
        out.push_str(&format!("Outcome: {}\n", outcome_label(turn.outcome)));
    }
    if let Some(obs) = &turn.observation {
        out.push_str("Observation:\n```\n");
        out.push_str(&obs.head);
        out.push_str("\n```\n");
        if obs.truncated {
            out.push_str(&format!("(observation clipped; {} bytes total)\n", obs.total_bytes));
        }
    }
    out
}

fn outcome_label(outcome: TurnOutcome) -> &'static str {
    match outcome {
        TurnOutcome::ActionOk => "ok",
        TurnOutcome::ActionError => "error",
        TurnOutcome::Finalize => "final",
        TurnOutcome::SubcallOk => "subcall",
        TurnOutcome::SubcallError => "subcall error",
        TurnOutcome::BudgetDenied => "budget denied",
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        format!("{flattened}…")
    } else {
        flattened
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObservationHead;
    use std::collections::BTreeMap;

    fn record(idx: u32, code: &str, obs: &str) -> TurnRecord {
        TurnRecord {
            turn_index: idx,
            prompt_digest: String::new(),
            response_text: String::new(),
            action_code: Some(code.to_string()),
            observation: Some(ObservationHead {
                head: obs.to_string(),
                total_bytes: obs.len() as u64,
                truncated: false,
            }),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            wall_ms: 0,
            outcome: TurnOutcome::ActionOk,
        }
    }

    #[test]
    fn old_turns_collapse_new_turns_stay_verbatim() {
        let history: Vec<TurnRecord> = (0..4)
            .map(|i| record(i, &format!("print({i})"), &format!("out-{i}")))
            .collect();
        let prompt = build_prompt(&PromptInput {
            task: "what is out?",
            history: &history,
            context: &BTreeMap::new(),
            history_window: 2,
            notices: &[],
        });
        assert!(prompt.contains("turn 0 [ok]: print(0) => out-0"));
        assert!(prompt.contains("turn 1 [ok]: print(1) => out-1"));
        assert!(prompt.contains("### Turn 2"));
        assert!(prompt.contains("### Turn 3"));
        assert!(!prompt.contains("### Turn 1"));
    }

    #[test]
    fn context_lists_names_and_sizes_not_bodies() {
        let mut context = BTreeMap::new();
        context.insert("settings".to_string(), "max_session_budget_usd = 100.0".to_string());
        let prompt = build_prompt(&PromptInput {
            task: "task",
            history: &[],
            context: &context,
            history_window: 8,
            notices: &[],
        });
        assert!(prompt.contains("`settings` (30 bytes)"));
        assert!(!prompt.contains("max_session_budget_usd = 100.0"));
    }

    #[test]
    fn notices_are_rendered() {
        let prompt = build_prompt(&PromptInput {
            task: "task",
            history: &[],
            context: &BTreeMap::new(),
            history_window: 8,
            notices: &["budget denied: turns".to_string()],
        });
        assert!(prompt.contains("## Notice"));
        assert!(prompt.contains("budget denied: turns"));
    }

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 101);
    }
}
