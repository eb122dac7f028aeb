//! Per-channel agent runner: owns the LLM transcript, the tool set, the
//! run state, and the side-effect chain that keeps UI updates ordered.

pub mod effects;
pub mod prompt;

use crate::llm::{BackendEvent, LlmBackend, Part, PromptRequest, StopReason, TranscriptMessage, Usage};
use crate::sandbox::Sandbox;
use crate::session::{self, SessionContext};
use crate::store::{ChannelStore, LogEntry};
use crate::tools::{arg_label, Tool};
use crate::transport::{ChatTransport, MessageHandle};
use crate::util::{truncate_tail, truncate_with_ellipsis};
use anyhow::Result;
use chrono::Utc;
use effects::EffectChain;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chat messages longer than this are split, leaving headroom for the
/// continuation suffix under the hard 1900-char ceiling.
const SPLIT_LIMIT: usize = 1900 - 50;

/// Backstop against runaway tool loops within a single run.
const MAX_LOOP_ITERATIONS: usize = 40;

const WORKING_CAPTION: &str = "*Working...*";

/// Per-call capability bundle handed to the runner by the orchestrator.
/// Every method is a thin transport call; ordering discipline is applied by
/// the runner's effect chain.
pub struct Context {
    pub channel_id: String,
    pub transport: Arc<dyn ChatTransport>,
    /// The user message this run answers, as logged.
    pub entry: LogEntry,
}

impl Context {
    pub async fn respond(&self, text: &str) -> Result<MessageHandle> {
        self.transport.post_message(&self.channel_id, text).await
    }

    pub async fn replace_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        self.transport.update_message(handle, text).await
    }

    pub async fn respond_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        self.transport.post_in_thread(parent, text).await
    }

    pub async fn set_typing(&self, on: bool) -> Result<()> {
        self.transport.set_typing(&self.channel_id, on).await
    }

    pub async fn upload_file(&self, path: &std::path::Path, title: Option<&str>) -> Result<()> {
        self.transport.upload_file(&self.channel_id, path, title).await
    }

    pub async fn set_working(&self, handle: &MessageHandle, caption: &str) -> Result<()> {
        self.transport.update_message(handle, caption).await
    }

    pub async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        self.transport.delete_message(handle).await
    }
}

#[derive(Debug, Clone)]
pub struct PendingTool {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub started_at: Instant,
}

/// Mutable run state, created lazily and retained for process lifetime.
#[derive(Default)]
pub struct RunState {
    pub running: bool,
    pub stop_requested: bool,
    pub cancel: Option<CancellationToken>,
    pub pending_tools: HashMap<String, PendingTool>,
    pub accumulated_usage: Usage,
}

pub struct AgentRunner {
    channel_id: String,
    workspace_dir: PathBuf,
    store: Arc<ChannelStore>,
    session: SessionContext,
    backend: Arc<dyn LlmBackend>,
    sandbox: Arc<dyn Sandbox>,
    tools: Vec<Arc<dyn Tool>>,
    /// Post thinking parts to the thread in addition to logging them.
    thinking_to_thread: bool,
    state: Mutex<RunState>,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: &str,
        workspace_dir: PathBuf,
        store: Arc<ChannelStore>,
        backend: Arc<dyn LlmBackend>,
        sandbox: Arc<dyn Sandbox>,
        tools: Vec<Arc<dyn Tool>>,
        thinking_to_thread: bool,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            session: SessionContext::new(&workspace_dir, channel_id),
            workspace_dir,
            store,
            backend,
            sandbox,
            tools,
            thinking_to_thread,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Request abort of the in-flight run. Returns `false` when nothing was
    /// running. The caller awaits the run itself surrendering.
    pub fn abort(&self) -> bool {
        let mut state = self.lock_state();
        if !state.running {
            return false;
        }
        state.stop_requested = true;
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drive one user prompt to completion: final, aborted, or error.
    pub async fn run(&self, ctx: Context) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut state = self.lock_state();
            if state.running {
                anyhow::bail!("run already active for channel {}", self.channel_id);
            }
            state.running = true;
            state.stop_requested = false;
            state.cancel = Some(cancel.clone());
            state.accumulated_usage = Usage::default();
            state.pending_tools.clear();
        }

        let outcome = self.run_inner(Arc::new(ctx), &cancel).await;
        if let Err(e) = &outcome {
            // Contain: a failed run never takes the process or channel down.
            tracing::error!(channel = %self.channel_id, "run failed: {e:#}");
        }

        let mut state = self.lock_state();
        state.running = false;
        state.cancel = None;
        state.pending_tools.clear();
        Ok(())
    }

    async fn run_inner(&self, ctx: Arc<Context>, cancel: &CancellationToken) -> Result<()> {
        let ui = RunUi::new(ctx.clone());

        ui.begin();

        // ── Prompt assembly ──────────────────────────────────────
        let channel_dir = self.workspace_dir.join(&self.channel_id);
        let skills = crate::skills::discover(&self.workspace_dir, Some(&channel_dir));
        let system_prompt = prompt::SystemPromptBuilder::new(
            &self.workspace_dir,
            &self.sandbox.workspace_path(),
            &self.channel_id,
        )
        .model(self.backend.model_id())
        .roster(ctx.transport.roster())
        .skills(skills)
        .build();

        let mut synced = self.session.load()?;
        let entries = self.store.read_log(&self.channel_id)?;
        session::sync_from_log(&mut synced, &entries, &ctx.entry.ts);
        let (mut transcript, _) = session::trim_turns(synced);
        self.session.save(&transcript)?;

        // Image attachments ride along on the user message, in memory only.
        let attached_images = self.attach_entry_images(&ctx.entry, &mut transcript).await;

        let specs: Vec<_> = self.tools.iter().map(|t| t.spec()).collect();
        let mut final_posted = false;
        let mut silent = false;

        // ── Completion loop ──────────────────────────────────────
        for _iteration in 0..MAX_LOOP_ITERATIONS {
            self.session.snapshot_last_prompt(
                &system_prompt,
                &transcript,
                &ctx.entry.text,
                attached_images,
            )?;

            let (tx, mut rx) = mpsc::channel::<BackendEvent>(32);
            let request = PromptRequest {
                system_prompt: &system_prompt,
                transcript: &transcript,
                tools: &specs,
            };

            let consumer = async {
                let mut last_end = None;
                while let Some(event) = rx.recv().await {
                    match event {
                        BackendEvent::MessageStart { role } => {
                            tracing::debug!(channel = %self.channel_id, role = %role, "message start");
                        }
                        BackendEvent::AutoRetry { attempt, max } => {
                            ui.post_thread(format!("*Retrying ({attempt}/{max})...*"));
                        }
                        BackendEvent::CompactionStart => {
                            tracing::info!(channel = %self.channel_id, "auto-compaction started");
                        }
                        BackendEvent::CompactionEnd => {
                            tracing::info!(channel = %self.channel_id, "auto-compaction finished");
                        }
                        BackendEvent::MessageEnd {
                            content,
                            stop_reason,
                            usage,
                            error_message,
                            ..
                        } => {
                            last_end = Some((content, stop_reason, usage, error_message));
                        }
                    }
                }
                last_end
            };

            let (backend_result, message_end) =
                tokio::join!(self.backend.prompt(request, tx, cancel.clone()), consumer);

            if let Err(e) = backend_result {
                ui.errored(format!("{e:#}"));
                final_posted = true;
                break;
            }

            let Some((content, stop_reason, usage, error_message)) = message_end else {
                // Backend closed the stream without a message: no-op final.
                ui.remove_working();
                final_posted = true;
                break;
            };

            if stop_reason != Some(StopReason::Aborted) {
                if let Some(usage) = &usage {
                    self.lock_state().accumulated_usage.add(usage);
                }
            }

            let assistant = TranscriptMessage::Assistant {
                content: content.clone(),
                stop_reason: stop_reason.unwrap_or(StopReason::EndTurn),
                usage,
                error_message: error_message.clone(),
                ts: Some(ctx.transport.now_ts()),
            };
            self.session.append(&assistant)?;
            transcript.push(assistant);

            self.route_thinking(&ui, &content);

            match stop_reason {
                Some(StopReason::ToolUse) => {
                    // Intermediate text goes to the thread only.
                    let text = parts_text(&content);
                    if !text.trim().is_empty() {
                        ui.post_thread(text);
                    }
                    self.dispatch_tools(&ui, &content, cancel, &mut transcript)
                        .await?;
                    if cancel.is_cancelled() {
                        ui.stopped();
                        final_posted = true;
                        break;
                    }
                }
                Some(StopReason::Aborted) => {
                    ui.stopped();
                    final_posted = true;
                    break;
                }
                Some(StopReason::Error) => {
                    ui.errored(error_message.unwrap_or_else(|| "backend error".into()));
                    final_posted = true;
                    break;
                }
                None if content.is_empty() => {
                    // Empty content, no stop reason: treat as a no-op final.
                    ui.remove_working();
                    final_posted = true;
                    break;
                }
                _ => {
                    let text = parts_text(&content);
                    if text.trim_start().starts_with("[SILENT]") {
                        ui.silent_cleanup();
                        silent = true;
                    } else {
                        ui.finalize(text.clone());
                        self.log_bot_response(ctx.transport.now_ts(), &text);
                    }
                    final_posted = true;
                    break;
                }
            }
        }

        if !final_posted {
            ui.errored(format!(
                "tool loop exceeded {MAX_LOOP_ITERATIONS} iterations"
            ));
        }

        if !silent {
            self.post_usage_summary(&ui, &transcript);
        }
        ui.finish().await;
        Ok(())
    }

    /// Execute every tool_use part of an assistant message, in order.
    async fn dispatch_tools(
        &self,
        ui: &RunUi,
        content: &[Part],
        cancel: &CancellationToken,
        transcript: &mut Vec<TranscriptMessage>,
    ) -> Result<()> {
        for part in content {
            let Part::ToolUse {
                tool_call_id,
                tool_name,
                args,
            } = part
            else {
                continue;
            };
            if cancel.is_cancelled() {
                break;
            }

            let label = arg_label(args).unwrap_or_else(|| tool_name.clone());
            ui.caption(format!("*-> {label}*"));

            let started_at = Instant::now();
            self.lock_state().pending_tools.insert(
                tool_call_id.clone(),
                PendingTool {
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                    started_at,
                },
            );

            let outcome = match self.tools.iter().find(|t| t.name() == tool_name) {
                Some(tool) => tool.execute(tool_call_id, args.clone(), cancel).await,
                None => crate::tools::ToolOutcome::error(format!("Unknown tool: {tool_name}")),
            };
            let elapsed = started_at.elapsed().as_secs();
            self.lock_state().pending_tools.remove(tool_call_id);

            let result_text = outcome.text_content();
            let marker = if outcome.is_error { "X" } else { "OK" };
            let args_block = serde_json::to_string_pretty(args).unwrap_or_default();
            let result_block = truncate_tail(&result_text, 50, 4000).with_marker();
            ui.post_thread(format!(
                "{marker} {tool_name}: {label} ({elapsed}s)\n```\n{args_block}\n```\n```\n{result_block}\n```"
            ));
            if outcome.is_error {
                ui.post_thread(format!(
                    "*Error: {}*",
                    truncate_with_ellipsis(&result_text, 200)
                ));
            }

            let tool_msg =
                TranscriptMessage::tool_result(tool_call_id.clone(), result_text, outcome.is_error);
            self.session.append(&tool_msg)?;
            transcript.push(tool_msg);
        }
        Ok(())
    }

    /// Base64-encode the entry's already-downloaded image attachments onto
    /// the newest user message. Files still in flight are skipped; the
    /// metadata line in the log stays authoritative either way.
    async fn attach_entry_images(
        &self,
        entry: &LogEntry,
        transcript: &mut Vec<TranscriptMessage>,
    ) -> usize {
        use base64::Engine as _;

        let mut images = Vec::new();
        for attachment in &entry.attachments {
            let path = self.workspace_dir.join(&attachment.local);
            let Some(mime) = crate::tools::file_read::image_mime(&path) else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => images.push(Part::Image {
                    mime_type: mime.to_string(),
                    data: base64::engine::general_purpose::STANDARD.encode(bytes),
                }),
                Err(e) => {
                    tracing::debug!(
                        channel = %self.channel_id,
                        attachment = %attachment.local,
                        "image not yet on disk: {e}"
                    );
                }
            }
        }

        let count = images.len();
        if count > 0 {
            if let Some(TranscriptMessage::User { content, .. }) =
                transcript.iter_mut().rev().find(|m| m.is_user())
            {
                content.extend(images);
            }
        }
        count
    }

    /// Thinking parts are always logged; thread-posting is opt-in.
    fn route_thinking(&self, ui: &RunUi, content: &[Part]) {
        for part in content {
            if let Part::Thinking { thinking } = part {
                tracing::info!(channel = %self.channel_id, "thinking: {thinking}");
                if self.thinking_to_thread {
                    ui.post_thread(format!("*{}*", truncate_with_ellipsis(thinking, 500)));
                }
            }
        }
    }

    /// Bot responses are committed to the channel log so the next sync can
    /// materialize them into fresh transcripts.
    fn log_bot_response(&self, ts: String, text: &str) {
        let entry = LogEntry {
            date: Utc::now(),
            ts,
            user: "mother".into(),
            user_name: Some("mother".into()),
            display_name: None,
            text: text.to_string(),
            attachments: Vec::new(),
            is_bot: true,
        };
        if let Err(e) = self.store.append(&self.channel_id, &entry) {
            tracing::warn!(channel = %self.channel_id, "failed to log bot response: {e:#}");
        }
    }

    fn post_usage_summary(&self, ui: &RunUi, transcript: &[TranscriptMessage]) {
        let usage = self.lock_state().accumulated_usage;
        if usage.cost <= 0.0 && !self.backend.is_local() {
            return;
        }

        // Rough tail estimate: four characters per token.
        let tail_chars: usize = transcript
            .iter()
            .map(|m| m.text_content().len())
            .sum();
        let tail_tokens = tail_chars / 4;
        let window = self.backend.context_window().max(1) as usize;
        let pct = (tail_tokens * 100) / window;

        ui.post_thread(format!(
            "*Usage: in {} (+{} cached) / out {} / ${:.4} / context ~{} tokens ({}% of {})*",
            usage.input, usage.cache_read, usage.output, usage.cost, tail_tokens, pct, window
        ));
    }
}

/// Concatenated text parts of an assistant message.
fn parts_text(content: &[Part]) -> String {
    content
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split final text into chat-sized chunks with continuation suffixes
/// between parts.
fn split_final(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.chars().count() <= limit {
            chunks.push(rest.to_string());
            break;
        }
        let cut = rest
            .char_indices()
            .nth(limit)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    let total = chunks.len();
    for (i, chunk) in chunks.iter_mut().enumerate() {
        if i + 1 < total {
            chunk.push_str(&format!("\n*(continued {}...)*", i + 2));
        }
    }
    chunks
}

/// UI state for one run: the working indicator, the thread rooted at it,
/// and the effect chain that serializes every visible action.
struct RunUi {
    ctx: Arc<Context>,
    chain: EffectChain,
    working: Arc<Mutex<Option<MessageHandle>>>,
    thread_posts: Arc<Mutex<Vec<MessageHandle>>>,
}

impl RunUi {
    fn new(ctx: Arc<Context>) -> Self {
        let working: Arc<Mutex<Option<MessageHandle>>> = Arc::new(Mutex::new(None));
        let thread_posts: Arc<Mutex<Vec<MessageHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let hook_ctx = ctx.clone();
        let hook_working = working.clone();
        let chain = EffectChain::new(Box::new(move |message: String| {
            let ctx = hook_ctx.clone();
            let working = hook_working.clone();
            Box::pin(async move {
                let text = format!("*Error: {}*", truncate_with_ellipsis(&message, 200));
                let parent = working.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
                match parent {
                    Some(parent) => {
                        ctx.respond_in_thread(&parent, &text).await?;
                    }
                    None => {
                        ctx.respond(&text).await?;
                    }
                }
                Ok(())
            })
        }));

        Self {
            ctx,
            chain,
            working,
            thread_posts,
        }
    }

    fn lock<T>(slot: &Arc<Mutex<T>>) -> std::sync::MutexGuard<'_, T> {
        slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Post the working indicator and start the typing signal.
    fn begin(&self) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        self.chain.push(async move {
            ctx.set_typing(true).await.ok();
            let handle = ctx.respond(WORKING_CAPTION).await?;
            *Self::lock(&working) = Some(handle);
            Ok(())
        });
    }

    /// Update the working indicator caption.
    fn caption(&self, text: String) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        self.chain.push(async move {
            let handle = Self::lock(&working).clone();
            if let Some(handle) = handle {
                ctx.set_working(&handle, &text).await?;
            }
            Ok(())
        });
    }

    /// Post into the thread rooted at the working message.
    fn post_thread(&self, text: String) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        let thread_posts = self.thread_posts.clone();
        self.chain.push(async move {
            let parent = Self::lock(&working).clone();
            let Some(parent) = parent else {
                anyhow::bail!("no working message to thread under");
            };
            let handle = ctx.respond_in_thread(&parent, &text).await?;
            Self::lock(&thread_posts).push(handle);
            Ok(())
        });
    }

    /// Final text: replaces the working indicator, continues in extra main
    /// messages when split, and is mirrored into the thread.
    fn finalize(&self, text: String) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        let thread_posts = self.thread_posts.clone();
        self.chain.push(async move {
            let chunks = split_final(&text, SPLIT_LIMIT);
            let handle = Self::lock(&working).clone();
            let mut chunks_iter = chunks.into_iter();
            if let (Some(handle), Some(first)) = (&handle, chunks_iter.next()) {
                ctx.replace_message(handle, &first).await?;
            }
            for chunk in chunks_iter {
                ctx.respond(&chunk).await?;
            }
            if let Some(parent) = &handle {
                let echoed = ctx.respond_in_thread(parent, &text).await?;
                Self::lock(&thread_posts).push(echoed);
            }
            Ok(())
        });
    }

    /// `[SILENT]`: nothing stays visible.
    fn silent_cleanup(&self) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        let thread_posts = self.thread_posts.clone();
        self.chain.push(async move {
            let posts: Vec<_> = Self::lock(&thread_posts).drain(..).collect();
            for post in posts {
                ctx.delete_message(&post).await.ok();
            }
            let handle = Self::lock(&working).take();
            if let Some(handle) = handle {
                ctx.delete_message(&handle).await?;
            }
            Ok(())
        });
    }

    fn remove_working(&self) {
        let ctx = self.ctx.clone();
        let working = self.working.clone();
        self.chain.push(async move {
            let handle = Self::lock(&working).take();
            if let Some(handle) = handle {
                ctx.delete_message(&handle).await?;
            }
            Ok(())
        });
    }

    fn stopped(&self) {
        self.caption("*Stopped*".into());
    }

    fn errored(&self, details: String) {
        self.caption("*Sorry, something went wrong*".into());
        self.post_thread(format!(
            "*Error: {}*",
            truncate_with_ellipsis(&details, 500)
        ));
    }

    /// Stop typing and drain the chain; the run returns only after every
    /// enqueued side effect has landed.
    async fn finish(&self) {
        let ctx = self.ctx.clone();
        self.chain.push(async move {
            ctx.set_typing(false).await.ok();
            Ok(())
        });
        self.chain.drain().await;
    }
}
