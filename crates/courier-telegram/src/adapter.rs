use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::info;

use courier_channels::{ChannelAdapter, ChannelError, ChannelStatus, InboundSink};
use courier_core::config::TelegramConfig;

use crate::handler::handle_message;
use crate::send;

/// Telegram channel adapter: long polling via the teloxide Dispatcher.
pub struct TelegramAdapter {
    bot: Bot,
    config: TelegramConfig,
    status: Mutex<ChannelStatus>,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            config: config.clone(),
            status: Mutex::new(ChannelStatus::Disconnected),
            poll_task: Mutex::new(None),
        }
    }

    fn parse_chat(recipient: &str) -> Result<ChatId, ChannelError> {
        recipient
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| ChannelError::Api(format!("invalid chat ID: {recipient}")))
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<(), ChannelError> {
        *self.status.lock().unwrap() = ChannelStatus::Connecting;

        let bot = self.bot.clone();
        let config = self.config.clone();
        let handler = Update::filter_message().endpoint(handle_message);

        info!("Telegram: starting long-polling dispatcher");
        let task = tokio::spawn(async move {
            Dispatcher::builder(bot, handler)
                .dependencies(dptree::deps![sink, config])
                .default_handler(|_upd| async {})
                .build()
                .dispatch()
                .await;
        });

        *self.poll_task.lock().unwrap() = Some(task);
        *self.status.lock().unwrap() = ChannelStatus::Connected;
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.poll_task.lock().unwrap().take() {
            task.abort();
        }
        *self.status.lock().unwrap() = ChannelStatus::Disconnected;
        info!("Telegram: dispatcher stopped");
    }

    async fn send_text(&self, recipient: &str, text: &str) -> Result<String, ChannelError> {
        let chat_id = Self::parse_chat(recipient)?;
        let last = send::send_chunked(&self.bot, chat_id, text).await?;
        Ok(last.map(|id| id.0.to_string()).unwrap_or_default())
    }

    async fn edit_text(
        &self,
        recipient: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError> {
        let chat_id = Self::parse_chat(recipient)?;
        let message_id = message_id
            .parse::<i32>()
            .map(MessageId)
            .map_err(|_| ChannelError::Api(format!("invalid message ID: {message_id}")))?;
        self.bot
            .edit_message_text(chat_id, message_id, text)
            .await
            .map_err(|e| ChannelError::Api(e.to_string()))?;
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.lock().unwrap().clone()
    }
}
