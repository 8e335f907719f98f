//! Append-only governance record for a session tree.
//!
//! One JSONL line per turn plus one summary line per session, written off
//! the session's critical path by a dedicated writer task. The host
//! supplies the sink; nothing here is required for the core to function,
//! and a session without a recorder keeps its trace in memory only.

use std::path::Path;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use crate::protocol::SessionSummary;
use crate::protocol::TurnRecord;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TraceLine<'a> {
    Meta {
        session_id: Uuid,
        timestamp: String,
        task_digest: &'a str,
    },
    Turn {
        session_id: Uuid,
        #[serde(flatten)]
        record: &'a TurnRecord,
    },
    Summary {
        #[serde(flatten)]
        summary: &'a SessionSummary,
    },
}

/// Handle cloned into every session of a tree. Serialization happens on
/// the caller; the writer task only performs I/O.
#[derive(Clone)]
pub struct TraceRecorder {
    tx: Sender<String>,
}

impl TraceRecorder {
    /// Record into any async writer. The writer task owns the sink and
    /// flushes after every line so a crash loses at most the line in
    /// flight.
    pub fn from_writer<W>(mut writer: W) -> TraceRecorder
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::warn!("trace writer: failed to write line: {e}");
                    break;
                }
                if let Err(e) = writer.write_all(b"\n").await {
                    tracing::warn!("trace writer: failed to write newline: {e}");
                    break;
                }
                if let Err(e) = writer.flush().await {
                    tracing::warn!("trace writer: failed to flush: {e}");
                    break;
                }
            }
        });
        TraceRecorder { tx }
    }

    /// Append to a file, creating it if missing.
    pub async fn to_file(path: impl AsRef<Path>) -> std::io::Result<TraceRecorder> {
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.as_ref())
            .await?;
        Ok(TraceRecorder::from_writer(file))
    }

    pub async fn record_meta(&self, session_id: Uuid, task_digest: &str) {
        let timestamp_format: &[FormatItem] =
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
        let timestamp = OffsetDateTime::now_utc()
            .format(timestamp_format)
            .unwrap_or_default();
        self.record(&TraceLine::Meta {
            session_id,
            timestamp,
            task_digest,
        })
        .await;
    }

    pub async fn record_turn(&self, session_id: Uuid, record: &TurnRecord) {
        self.record(&TraceLine::Turn { session_id, record }).await;
    }

    pub async fn record_summary(&self, summary: &SessionSummary) {
        self.record(&TraceLine::Summary { summary }).await;
    }

    async fn record(&self, line: &TraceLine<'_>) {
        let json = match serde_json::to_string(line) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("trace recorder: failed to serialize line: {e}");
                return;
            }
        };
        if self.tx.send(json).await.is_err() {
            tracing::warn!("trace recorder: writer task is gone");
        }
    }
}

/// Convenience for hosts that want the writer's output back in memory
/// (tests, embedders that forward elsewhere).
pub fn duplex_recorder() -> (TraceRecorder, tokio::io::DuplexStream) {
    let (write_half, read_half) = tokio::io::duplex(64 * 1024);
    (TraceRecorder::from_writer(write_half), read_half)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::protocol::SessionStatus;
    use crate::protocol::TurnOutcome;
    use tokio::io::AsyncReadExt;

    fn turn() -> TurnRecord {
        TurnRecord {
            turn_index: 0,
            prompt_digest: "abc".to_string(),
            response_text: "FINAL\nok\nEND_FINAL".to_string(),
            action_code: None,
            observation: None,
            tokens_in: 10,
            tokens_out: 5,
            cost_usd: 0.001,
            wall_ms: 42,
            outcome: TurnOutcome::Finalize,
        }
    }

    #[tokio::test]
    async fn records_are_appended_as_jsonl() {
        let (recorder, mut read_half) = duplex_recorder();
        let session_id = Uuid::new_v4();
        recorder.record_meta(session_id, "digest").await;
        recorder.record_turn(session_id, &turn()).await;
        drop(recorder);

        let mut out = String::new();
        read_half.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let meta: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(meta["type"], "meta");
        assert_eq!(meta["task_digest"], "digest");

        let turn_line: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(turn_line["type"], "turn");
        assert_eq!(turn_line["outcome"], "finalize");
        assert_eq!(turn_line["turn_index"], 0);
    }

    #[tokio::test]
    async fn summary_line_carries_tree_shape() {
        let (recorder, mut read_half) = duplex_recorder();
        let child = SessionSummary {
            session_id: Uuid::new_v4(),
            task_digest: "child".to_string(),
            depth: 1,
            status: SessionStatus::Finalized,
            turns_used: 1,
            tokens_used: 100,
            cost_usd_used: 0.01,
            wall_ms_used: 10,
            subcalls_spawned: 0,
            max_depth_reached: 1,
            children: Vec::new(),
        };
        let summary = SessionSummary {
            session_id: Uuid::new_v4(),
            task_digest: "root".to_string(),
            depth: 0,
            status: SessionStatus::Finalized,
            turns_used: 2,
            tokens_used: 300,
            cost_usd_used: 0.02,
            wall_ms_used: 20,
            subcalls_spawned: 1,
            max_depth_reached: 1,
            children: vec![child],
        };
        recorder.record_summary(&summary).await;
        drop(recorder);

        let mut out = String::new();
        read_half.read_to_string(&mut out).await.unwrap();
        let line: serde_json::Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(line["type"], "summary");
        assert_eq!(line["children"][0]["task_digest"], "child");
    }
}
