//! Discord transport: REST calls for outbound operations and a polling
//! listener for inbound messages. Rate limiting is handled here (backoff on
//! poll errors, one edit per second per message), never in the core.

use super::{ChatTransport, InboundFile, InboundMessage, MessageHandle};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const API_BASE: &str = "https://discord.com/api/v10";
const POLL_INTERVAL: Duration = Duration::from_secs(2);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Discord snowflake epoch: 2015-01-01T00:00:00Z, in milliseconds.
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

pub struct DiscordTransport {
    token: String,
    guild_id: String,
    api_base: String,
    client: reqwest::Client,
    /// Message id → thread channel id, so repeat thread posts reuse threads.
    threads: Mutex<HashMap<String, String>>,
    /// User id → username, built up from observed authors.
    seen_users: Mutex<HashMap<String, String>>,
    bot_user_id: Mutex<Option<String>>,
}

impl DiscordTransport {
    pub fn new(token: String, guild_id: String) -> Self {
        Self::with_api_base(token, guild_id, API_BASE.to_string())
    }

    /// Test seam: point the transport at a different API root.
    pub fn with_api_base(token: String, guild_id: String, api_base: String) -> Self {
        Self {
            token,
            guild_id,
            api_base: api_base.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            threads: Mutex::new(HashMap::new()),
            seen_users: Mutex::new(HashMap::new()),
            bot_user_id: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bot {}", self.token))
    }

    async fn api_post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .auth(self.client.post(self.url(path)).json(&body))
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("Discord API error on {path} ({status}): {detail}");
        }
        response.json().await.context("decoding Discord response")
    }

    /// The bot's own user id, fetched once and cached.
    pub async fn bot_id(&self) -> Result<String> {
        if let Some(id) = self.bot_user_id.lock().unwrap().clone() {
            return Ok(id);
        }
        let me: serde_json::Value = self
            .auth(self.client.get(self.url("/users/@me")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let id = me
            .get("id")
            .and_then(|v| v.as_str())
            .context("missing id on /users/@me")?
            .to_string();
        *self.bot_user_id.lock().unwrap() = Some(id.clone());
        Ok(id)
    }

    /// The token to strip from inbound text, e.g. `<@1234>`.
    pub async fn mention_token(&self) -> Result<String> {
        Ok(format!("<@{}>", self.bot_id().await?))
    }

    /// Existing thread for a message, or a new one named after the message.
    async fn thread_for(&self, parent: &MessageHandle) -> Result<String> {
        if let Some(existing) = self.threads.lock().unwrap().get(&parent.message_id) {
            return Ok(existing.clone());
        }
        let created = self
            .api_post(
                &format!(
                    "/channels/{}/messages/{}/threads",
                    parent.channel_id, parent.message_id
                ),
                json!({"name": "agent log"}),
            )
            .await?;
        let thread_id = created
            .get("id")
            .and_then(|v| v.as_str())
            .context("thread creation returned no id")?
            .to_string();
        self.threads
            .lock()
            .unwrap()
            .insert(parent.message_id.clone(), thread_id.clone());
        Ok(thread_id)
    }

    /// Long-poll guild text channels for new messages, forwarding ones
    /// addressed to this bot (mention or DM) into `tx`.
    pub async fn listen(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let bot_id = self.bot_id().await?;
        let mut cursors: HashMap<String, String> = HashMap::new();

        tracing::info!(guild = %self.guild_id, "Discord transport polling for messages");
        loop {
            let channels = match self.text_channels().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Discord channel list failed: {e:#}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            for channel_id in channels {
                let path = match cursors.get(&channel_id) {
                    Some(after) => {
                        format!("/channels/{channel_id}/messages?after={after}&limit=50")
                    }
                    None => format!("/channels/{channel_id}/messages?limit=1"),
                };
                let messages: serde_json::Value = match self
                    .auth(self.client.get(self.url(&path)))
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                {
                    Ok(r) => match r.json().await {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(channel = %channel_id, "Discord parse error: {e}");
                            continue;
                        }
                    },
                    Err(e) => {
                        tracing::warn!(channel = %channel_id, "Discord poll error: {e}");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                        continue;
                    }
                };

                let Some(list) = messages.as_array() else { continue };
                // Discord returns newest first.
                for raw in list.iter().rev() {
                    if let Some(id) = raw.get("id").and_then(|v| v.as_str()) {
                        cursors.insert(channel_id.clone(), id.to_string());
                    }
                    let Some(msg) = parse_message(raw, &channel_id) else {
                        continue;
                    };
                    self.seen_users
                        .lock()
                        .unwrap()
                        .insert(msg.user_id.clone(), msg.user_name.clone().unwrap_or_default());
                    if !addressed_to_bot(raw, &bot_id) {
                        continue;
                    }
                    if tx.send(msg).await.is_err() {
                        return Ok(());
                    }
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn text_channels(&self) -> Result<Vec<String>> {
        let channels: serde_json::Value = self
            .auth(
                self.client
                    .get(self.url(&format!("/guilds/{}/channels", self.guild_id))),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let list = channels.as_array().context("channel list not an array")?;
        Ok(list
            .iter()
            // Type 0 is a guild text channel.
            .filter(|c| c.get("type").and_then(|v| v.as_i64()) == Some(0))
            .filter_map(|c| c.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }
}

#[async_trait]
impl ChatTransport for DiscordTransport {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
        let message = self
            .api_post(&format!("/channels/{channel_id}/messages"), json!({"content": text}))
            .await?;
        Ok(MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: message
                .get("id")
                .and_then(|v| v.as_str())
                .context("posted message has no id")?
                .to_string(),
        })
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        let path = format!(
            "/channels/{}/messages/{}",
            handle.channel_id, handle.message_id
        );
        self.auth(self.client.patch(self.url(&path)).json(&json!({"content": text})))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("PATCH {path}"))?;
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        let path = format!(
            "/channels/{}/messages/{}",
            handle.channel_id, handle.message_id
        );
        self.auth(self.client.delete(self.url(&path)))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("DELETE {path}"))?;
        Ok(())
    }

    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        let thread_id = self.thread_for(parent).await?;
        self.post_message(&thread_id, text).await
    }

    async fn upload_file(
        &self,
        channel_id: &str,
        file_path: &Path,
        title: Option<&str>,
    ) -> Result<()> {
        let bytes = tokio::fs::read(file_path)
            .await
            .with_context(|| format!("reading {}", file_path.display()))?;
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let payload = json!({"content": title.unwrap_or("")});
        let form = reqwest::multipart::Form::new()
            .text("payload_json", payload.to_string())
            .part(
                "files[0]",
                reqwest::multipart::Part::bytes(bytes).file_name(file_name),
            );

        self.auth(
            self.client
                .post(self.url(&format!("/channels/{channel_id}/messages")))
                .multipart(form),
        )
        .send()
        .await?
        .error_for_status()
        .context("file upload")?;
        Ok(())
    }

    async fn set_typing(&self, channel_id: &str, on: bool) -> Result<()> {
        if !on {
            // Discord typing indicators expire on their own.
            return Ok(());
        }
        self.auth(self.client.post(self.url(&format!("/channels/{channel_id}/typing"))))
            .send()
            .await?
            .error_for_status()
            .context("typing indicator")?;
        Ok(())
    }

    fn roster(&self) -> Vec<(String, String)> {
        let mut roster: Vec<(String, String)> = self
            .seen_users
            .lock()
            .unwrap()
            .iter()
            .map(|(id, name)| (id.clone(), name.clone()))
            .collect();
        roster.sort();
        roster
    }

    /// Inbound `ts` values are message snowflakes, so locally-synthesized
    /// ones must be snowflakes too or ordering against them breaks.
    fn now_ts(&self) -> String {
        let since_epoch = (Utc::now().timestamp_millis() - SNOWFLAKE_EPOCH_MS).max(0) as u64;
        (since_epoch << 22).to_string()
    }
}

/// Map one raw Discord message object to the normalized inbound shape.
fn parse_message(raw: &serde_json::Value, channel_id: &str) -> Option<InboundMessage> {
    let id = raw.get("id")?.as_str()?.to_string();
    let author = raw.get("author")?;
    let sent_at: DateTime<Utc> = raw
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let files = raw
        .get("attachments")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    Some(InboundFile {
                        name: a.get("filename")?.as_str()?.to_string(),
                        url: a.get("url")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(InboundMessage {
        channel_id: channel_id.to_string(),
        ts: id,
        user_id: author.get("id")?.as_str()?.to_string(),
        user_name: author.get("username").and_then(|v| v.as_str()).map(str::to_string),
        display_name: raw
            .pointer("/member/nick")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        text: raw.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string(),
        files,
        sent_at,
        is_bot: author.get("bot").and_then(|v| v.as_bool()).unwrap_or(false),
    })
}

/// A message triggers the bot when it mentions it or arrives in a DM.
fn addressed_to_bot(raw: &serde_json::Value, bot_id: &str) -> bool {
    if raw.get("guild_id").is_none() && raw.pointer("/member").is_none() {
        // DMs carry no guild context.
        if raw.get("channel_type").and_then(|v| v.as_i64()) == Some(1) {
            return true;
        }
    }
    raw.get("mentions")
        .and_then(|v| v.as_array())
        .is_some_and(|mentions| {
            mentions
                .iter()
                .any(|m| m.get("id").and_then(|v| v.as_str()) == Some(bot_id))
        })
}
