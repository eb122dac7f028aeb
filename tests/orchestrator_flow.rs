//! End-to-end orchestrator flows against a scripted backend and a
//! recording transport: routing, stop protocol, dedup, queue discipline.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use mother::llm::{BackendEvent, LlmBackend, Part, PromptRequest, StopReason};
use mother::orchestrator::Orchestrator;
use mother::sandbox::{HostSandbox, Sandbox};
use mother::security::{CommandListPatch, SecurityPolicy};
use mother::store::ChannelStore;
use mother::transport::{ChatTransport, InboundMessage, MessageHandle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

// ── Test doubles ─────────────────────────────────────────────────

#[derive(Default)]
struct RecordingTransport {
    ops: Mutex<Vec<String>>,
    next_id: AtomicU64,
}

impl RecordingTransport {
    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn record(&self, op: String) -> MessageHandle {
        self.ops.lock().unwrap().push(op);
        MessageHandle {
            channel_id: "chan".into(),
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst).to_string(),
        }
    }

    async fn wait_for(&self, needle: &str) {
        for _ in 0..200 {
            if self.ops().iter().any(|o| o.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("never observed op containing {needle:?}; ops: {:#?}", self.ops());
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
        Ok(self.record(format!("post {channel_id}: {text}")))
    }
    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        self.record(format!("edit {}: {text}", handle.message_id));
        Ok(())
    }
    async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        self.record(format!("delete {}", handle.message_id));
        Ok(())
    }
    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        Ok(self.record(format!("thread {}: {text}", parent.message_id)))
    }
    async fn upload_file(&self, channel_id: &str, path: &Path, _title: Option<&str>) -> Result<()> {
        self.record(format!("upload {channel_id}: {}", path.display()));
        Ok(())
    }
    async fn set_typing(&self, _channel_id: &str, _on: bool) -> Result<()> {
        Ok(())
    }
}

/// Backend that echoes the last user line, optionally blocking until
/// released so tests can observe an in-flight run.
struct EchoBackend {
    hold: Option<Arc<Notify>>,
}

#[async_trait]
impl LlmBackend for EchoBackend {
    fn model_id(&self) -> &str {
        "echo"
    }
    fn context_window(&self) -> u32 {
        100_000
    }
    async fn prompt(
        &self,
        request: PromptRequest<'_>,
        events: mpsc::Sender<BackendEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        events
            .send(BackendEvent::MessageStart { role: "assistant".into() })
            .await
            .ok();

        if let Some(hold) = &self.hold {
            tokio::select! {
                () = hold.notified() => {}
                () = cancel.cancelled() => {
                    events
                        .send(BackendEvent::MessageEnd {
                            role: "assistant".into(),
                            content: Vec::new(),
                            stop_reason: Some(StopReason::Aborted),
                            usage: None,
                            error_message: None,
                        })
                        .await
                        .ok();
                    return Ok(());
                }
            }
        }

        let last_user = request
            .transcript
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(|m| m.text_content())
            .unwrap_or_default();
        events
            .send(BackendEvent::MessageEnd {
                role: "assistant".into(),
                content: vec![Part::text(format!("echo: {last_user}"))],
                stop_reason: Some(StopReason::EndTurn),
                usage: None,
                error_message: None,
            })
            .await
            .ok();
        Ok(())
    }
}

struct Harness {
    _tmp: TempDir,
    transport: Arc<RecordingTransport>,
    orchestrator: Arc<Orchestrator>,
}

fn harness_with(hold: Option<Arc<Notify>>, mention: Option<String>) -> Harness {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(RecordingTransport::default());
    let store = Arc::new(ChannelStore::new(tmp.path().to_path_buf()));
    let policy = Arc::new(SecurityPolicy::new(
        tmp.path(),
        &[],
        &CommandListPatch::default(),
    ));
    let sandbox: Arc<dyn Sandbox> = Arc::new(HostSandbox::new(tmp.path().to_path_buf()));
    let orchestrator = Arc::new(Orchestrator::new(
        tmp.path().to_path_buf(),
        store,
        transport.clone(),
        Arc::new(EchoBackend { hold }),
        policy,
        sandbox,
        None,
        false,
        mention,
    ));
    Harness {
        _tmp: tmp,
        transport,
        orchestrator,
    }
}

fn harness() -> Harness {
    harness_with(None, None)
}

fn inbound(ts: &str, text: &str) -> InboundMessage {
    InboundMessage {
        channel_id: "chan".into(),
        ts: ts.into(),
        user_id: "u1".into(),
        user_name: Some("alice".into()),
        display_name: None,
        text: text.into(),
        files: Vec::new(),
        sent_at: Utc::now(),
        is_bot: false,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn message_flows_to_final_response() {
    let h = harness();
    h.orchestrator.handle_inbound(inbound("1", "hello there")).await.unwrap();

    h.transport.wait_for("echo:").await;
    let ops = h.transport.ops();
    assert!(ops.iter().any(|o| o.contains("*Working...*")));
    assert!(ops.iter().any(|o| o.contains("hello there")));
}

#[tokio::test]
async fn duplicate_ts_triggers_single_run() {
    let h = harness();
    h.orchestrator.handle_inbound(inbound("7", "first")).await.unwrap();
    h.orchestrator.handle_inbound(inbound("7", "repeat")).await.unwrap();

    h.transport.wait_for("echo:").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let workings = h
        .transport
        .ops()
        .iter()
        .filter(|o| o.contains("*Working...*"))
        .count();
    assert_eq!(workings, 1);
}

#[tokio::test]
async fn backlog_message_is_logged_but_not_run() {
    let h = harness();
    let mut msg = inbound("1", "old news");
    msg.sent_at = Utc::now() - ChronoDuration::hours(1);
    h.orchestrator.handle_inbound(msg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.transport.ops().is_empty(), "backlog must not trigger a run");
}

#[tokio::test]
async fn bot_messages_are_ignored() {
    let h = harness();
    let mut msg = inbound("1", "from another bot");
    msg.is_bot = true;
    h.orchestrator.handle_inbound(msg).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.transport.ops().is_empty());
}

#[tokio::test]
async fn stop_with_nothing_running() {
    let h = harness();
    h.orchestrator.handle_inbound(inbound("1", "stop")).await.unwrap();
    h.transport.wait_for("*Nothing running*").await;
}

#[tokio::test]
async fn stop_is_case_insensitive_and_trimmed() {
    let h = harness();
    h.orchestrator.handle_inbound(inbound("1", "  STOP  ")).await.unwrap();
    h.transport.wait_for("*Nothing running*").await;
}

#[tokio::test]
async fn busy_channel_reports_already_working_and_stop_aborts() {
    let hold = Arc::new(Notify::new());
    let h = harness_with(Some(hold), None);

    h.orchestrator.handle_inbound(inbound("1", "long task")).await.unwrap();
    h.transport.wait_for("*Working...*").await;

    // A second message while the run is active.
    h.orchestrator.handle_inbound(inbound("2", "more work")).await.unwrap();
    h.transport.wait_for("*Already working. Say stop to cancel.*").await;

    // And then the stop word.
    h.orchestrator.handle_inbound(inbound("3", "stop")).await.unwrap();
    h.transport.wait_for("*Stopping...*").await;
    h.transport.wait_for("*Stopped*").await;
}

#[tokio::test]
async fn mention_token_is_stripped_from_text() {
    let h = harness_with(None, Some("<@999>".into()));
    h.orchestrator
        .handle_inbound(inbound("1", "<@999> summarize the notes"))
        .await
        .unwrap();

    h.transport.wait_for("echo:").await;
    let ops = h.transport.ops();
    let final_op = ops.iter().find(|o| o.contains("echo:")).unwrap();
    assert!(final_op.contains("summarize the notes"));
    assert!(!final_op.contains("<@999>"));
}

#[tokio::test]
async fn event_sink_logs_and_runs() {
    let h = harness();
    let sink = h.orchestrator.event_sink();
    assert!(sink("chan", "[EVENT:daily.json:periodic:2026-08-02T09:00:00Z] standup time".into()));

    h.transport.wait_for("standup time").await;
    let log = std::fs::read_to_string(h._tmp.path().join("chan/log.jsonl")).unwrap();
    assert!(log.contains("[EVENT:daily.json:periodic:"));
    assert!(log.contains("\"user\":\"scheduler\""));
}

#[tokio::test]
async fn channel_queue_serializes_runs() {
    let h = harness();
    h.orchestrator.handle_inbound(inbound("10", "first")).await.unwrap();
    // Wait out the first run entirely so the second is not rejected as busy.
    h.transport.wait_for("echo: ").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.handle_inbound(inbound("11", "second")).await.unwrap();

    h.transport.wait_for("second").await;
    let ops = h.transport.ops();
    let first_final = ops.iter().position(|o| o.contains("first") && o.contains("echo:"));
    let second_final = ops.iter().position(|o| o.contains("second") && o.contains("echo:"));
    assert!(first_final.unwrap() < second_final.unwrap());
}
