//! Message handler registered in the teloxide Dispatcher.

use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, warn};

use courier_channels::InboundSink;
use courier_core::config::TelegramConfig;
use courier_core::message::meta;
use courier_core::Message as GatewayMessage;

use crate::allow;
use crate::send;
use crate::stream::StreamRenderer;
use crate::typing::TypingHandle;

/// Runs for every incoming Telegram `Message`:
/// 1. bot-message filter,
/// 2. allowlist check (deny-by-default),
/// 3. inbound `Message` construction,
/// 4. non-blocking hand-off to the orchestrator sink.
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    sink: Arc<dyn InboundSink>,
    config: TelegramConfig,
) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }

    let username = from.username.as_deref().unwrap_or("");
    let user_id = from.id.0.to_string();

    if !allow::is_allowed(&config.allow_users, username, &user_id) {
        debug!(username, user_id, "sender not in allowlist, dropping message");
        return Ok(());
    }

    let text = msg.text().or(msg.caption()).unwrap_or("");
    if text.is_empty() {
        return Ok(());
    }

    let chat_id = msg.chat.id;
    let mut inbound = GatewayMessage::user(
        "telegram",
        if username.is_empty() { &user_id } else { username },
        text,
    );
    // Telegram assigns the inbound ID; keep it for adapter-level idempotence.
    inbound.id = msg.id.0.to_string();
    let inbound = inbound
        .with_meta(meta::USER_ID, user_id)
        .with_meta(meta::CHAT_ID, chat_id.0.to_string());

    // Process on a separate task so the dispatcher keeps polling.
    let streaming = config.streaming;
    tokio::spawn(async move {
        let typing = TypingHandle::start(bot.clone(), chat_id);

        if streaming {
            match StreamRenderer::begin(bot.clone(), chat_id).await {
                Ok(renderer) => {
                    let reply = sink.deliver_streaming(inbound, renderer.sink()).await;
                    typing.stop();
                    renderer.finish(&reply).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to create placeholder, falling back to plain send");
                }
            }
        }

        let reply = sink.deliver(inbound).await;
        typing.stop();
        if let Err(e) = send::send_chunked(&bot, chat_id, &reply).await {
            warn!(error = %e, "failed to deliver reply");
        }
    });

    Ok(())
}
