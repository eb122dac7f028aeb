//! CLI transport: stdin/stdout, always available, zero credentials.
//! Used by `--cli` mode with the fixed synthetic channel id `cli`.

use super::{ChatTransport, MessageHandle};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use uuid::Uuid;

pub const CLI_CHANNEL_ID: &str = "cli";

#[derive(Default)]
pub struct CliTransport;

impl CliTransport {
    pub fn new() -> Self {
        Self
    }

    fn handle(&self, channel_id: &str) -> MessageHandle {
        MessageHandle {
            channel_id: channel_id.to_string(),
            message_id: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl ChatTransport for CliTransport {
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<MessageHandle> {
        println!("{text}");
        Ok(self.handle(channel_id))
    }

    async fn update_message(&self, handle: &MessageHandle, text: &str) -> Result<()> {
        println!("[edit #{}] {text}", handle.message_id);
        Ok(())
    }

    async fn delete_message(&self, handle: &MessageHandle) -> Result<()> {
        println!("[deleted #{}]", handle.message_id);
        Ok(())
    }

    async fn post_in_thread(&self, parent: &MessageHandle, text: &str) -> Result<MessageHandle> {
        println!("  | {text}");
        Ok(self.handle(&parent.channel_id))
    }

    async fn upload_file(
        &self,
        _channel_id: &str,
        file_path: &Path,
        title: Option<&str>,
    ) -> Result<()> {
        match title {
            Some(title) => println!("[file: {} ({title})]", file_path.display()),
            None => println!("[file: {}]", file_path.display()),
        }
        Ok(())
    }

    async fn set_typing(&self, _channel_id: &str, _on: bool) -> Result<()> {
        Ok(())
    }

    fn roster(&self) -> Vec<(String, String)> {
        vec![(CLI_CHANNEL_ID.to_string(), "operator".to_string())]
    }
}
