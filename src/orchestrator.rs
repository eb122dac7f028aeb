//! Top-level message routing: inbound chat events to per-channel queues,
//! the stop protocol, and the event-scheduler sink.

use crate::agent::{AgentRunner, Context};
use crate::events::scheduler::EventSink;
use crate::llm::LlmBackend;
use crate::queue::ChannelQueue;
use crate::sandbox::Sandbox;
use crate::security::SecurityPolicy;
use crate::store::attachments::attachment_local_path;
use crate::store::{Attachment, ChannelStore, DownloadQueue, LogEntry, PendingDownload};
use crate::transport::{ChatTransport, InboundMessage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct Orchestrator {
    workspace_dir: PathBuf,
    store: Arc<ChannelStore>,
    transport: Arc<dyn ChatTransport>,
    backend: Arc<dyn LlmBackend>,
    policy: Arc<SecurityPolicy>,
    sandbox: Arc<dyn Sandbox>,
    downloads: DownloadQueue,
    agent_cmd: Option<Vec<String>>,
    thinking_to_thread: bool,
    /// Mention token of this bot (e.g. `<@1234>`), stripped from inbound text.
    mention_token: Option<String>,
    started_at: DateTime<Utc>,
    runners: Mutex<HashMap<String, Arc<AgentRunner>>>,
    queues: Mutex<HashMap<String, Arc<ChannelQueue>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workspace_dir: PathBuf,
        store: Arc<ChannelStore>,
        transport: Arc<dyn ChatTransport>,
        backend: Arc<dyn LlmBackend>,
        policy: Arc<SecurityPolicy>,
        sandbox: Arc<dyn Sandbox>,
        agent_cmd: Option<Vec<String>>,
        thinking_to_thread: bool,
        mention_token: Option<String>,
    ) -> Self {
        Self {
            downloads: DownloadQueue::spawn(workspace_dir.clone()),
            workspace_dir,
            store,
            transport,
            backend,
            policy,
            sandbox,
            agent_cmd,
            thinking_to_thread,
            mention_token,
            started_at: Utc::now(),
            runners: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Route one inbound chat message. Never propagates run failures.
    pub async fn handle_inbound(self: &Arc<Self>, msg: InboundMessage) -> Result<()> {
        if msg.is_bot {
            return Ok(());
        }

        let text = self.strip_mention(&msg.text);
        let entry = self.log_entry_for(&msg, &text);

        if !self.store.append(&msg.channel_id, &entry)? {
            tracing::debug!(channel = %msg.channel_id, ts = %msg.ts, "duplicate message suppressed");
            return Ok(());
        }

        let pending: Vec<PendingDownload> = msg
            .files
            .iter()
            .zip(entry.attachments.iter())
            .map(|(file, attachment)| PendingDownload {
                channel_id: msg.channel_id.clone(),
                local: attachment.local.clone(),
                url: file.url.clone(),
            })
            .collect();
        if !pending.is_empty() {
            self.downloads.enqueue(pending);
        }

        if msg.sent_at < self.started_at {
            tracing::info!(channel = %msg.channel_id, ts = %msg.ts, "logged backlog message without triggering a run");
            return Ok(());
        }

        if text.trim().eq_ignore_ascii_case("stop") {
            return self.handle_stop(&msg.channel_id).await;
        }

        let runner = self.runner_for(&msg.channel_id);
        if runner.is_running() {
            self.transport
                .post_message(&msg.channel_id, "*Already working. Say stop to cancel.*")
                .await?;
            return Ok(());
        }

        self.enqueue_run(&msg.channel_id, entry);
        Ok(())
    }

    async fn handle_stop(&self, channel_id: &str) -> Result<()> {
        let aborted = self
            .existing_runner(channel_id)
            .is_some_and(|runner| runner.abort());
        let reply = if aborted {
            "*Stopping...*"
        } else {
            "*Nothing running*"
        };
        self.transport.post_message(channel_id, reply).await?;
        Ok(())
    }

    /// Enqueue one agent run for an already-logged entry. Returns `false`
    /// when the channel queue refused the work.
    pub fn enqueue_run(self: &Arc<Self>, channel_id: &str, entry: LogEntry) -> bool {
        let runner = self.runner_for(channel_id);
        let queue = self.queue_for(channel_id);
        let ctx = Context {
            channel_id: channel_id.to_string(),
            transport: self.transport.clone(),
            entry,
        };
        queue.enqueue("agent-run", async move { runner.run(ctx).await })
    }

    /// The sink the event scheduler fires into: log the synthesized message,
    /// then enqueue a run, honoring the queue cap.
    pub fn event_sink(self: &Arc<Self>) -> EventSink {
        let orchestrator = self.clone();
        Arc::new(move |channel_id: &str, text: String| {
            let entry = LogEntry {
                date: Utc::now(),
                ts: orchestrator.transport.now_ts(),
                user: "scheduler".into(),
                user_name: Some("scheduler".into()),
                display_name: None,
                text,
                attachments: Vec::new(),
                is_bot: false,
            };
            if let Err(e) = orchestrator.store.append(channel_id, &entry) {
                tracing::warn!(channel = %channel_id, "failed to log event firing: {e:#}");
            }
            orchestrator.enqueue_run(channel_id, entry)
        })
    }

    fn strip_mention(&self, text: &str) -> String {
        match &self.mention_token {
            Some(token) => text.replace(token, "").trim().to_string(),
            None => text.trim().to_string(),
        }
    }

    fn log_entry_for(&self, msg: &InboundMessage, text: &str) -> LogEntry {
        let attachments = msg
            .files
            .iter()
            .map(|file| Attachment {
                original: file.name.clone(),
                local: attachment_local_path(&msg.channel_id, &msg.ts, &file.name),
            })
            .collect();
        LogEntry {
            date: msg.sent_at,
            ts: msg.ts.clone(),
            user: msg.user_id.clone(),
            user_name: msg.user_name.clone(),
            display_name: msg.display_name.clone(),
            text: text.to_string(),
            attachments,
            is_bot: false,
        }
    }

    fn existing_runner(&self, channel_id: &str) -> Option<Arc<AgentRunner>> {
        self.runners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(channel_id)
            .cloned()
    }

    /// Lazily create the channel's runner; cached for process lifetime.
    fn runner_for(&self, channel_id: &str) -> Arc<AgentRunner> {
        let mut runners = self
            .runners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        runners
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                let tools = crate::tools::all_tools(
                    &self.policy,
                    &self.sandbox,
                    &self.transport,
                    channel_id,
                    &self.workspace_dir,
                    self.agent_cmd.clone(),
                );
                Arc::new(AgentRunner::new(
                    channel_id,
                    self.workspace_dir.clone(),
                    self.store.clone(),
                    self.backend.clone(),
                    self.sandbox.clone(),
                    tools,
                    self.thinking_to_thread,
                ))
            })
            .clone()
    }

    fn queue_for(&self, channel_id: &str) -> Arc<ChannelQueue> {
        let mut queues = self
            .queues
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queues
            .entry(channel_id.to_string())
            .or_insert_with(|| Arc::new(ChannelQueue::new(channel_id)))
            .clone()
    }
}
