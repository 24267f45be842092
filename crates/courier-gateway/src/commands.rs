//! Slash commands — intercepted before the agent loop, sharing the session.
//! Only session-state effects live here; presentation stays plain text.

use std::sync::Arc;

use tracing::info;

use courier_store::{Pin, Session};

use crate::orchestrator::Orchestrator;

/// Known model aliases for user-friendly switching.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-6"),
    ("sonnet", "claude-sonnet-4-6"),
    ("haiku", "claude-haiku-4-5"),
];

fn resolve_model_alias(input: &str) -> Option<String> {
    let lower = input.to_lowercase();
    for &(alias, full) in MODEL_ALIASES {
        if lower == alias || lower == full {
            return Some(full.to_string());
        }
    }
    // Full model IDs pass through untouched.
    if input.starts_with("claude-") {
        return Some(input.to_string());
    }
    None
}

/// Handle a `/`-prefixed message. Always returns a reply — unknown commands
/// get a pointer to `/help` rather than falling through to the agent.
pub async fn handle_command(text: &str, session: &Arc<Session>, orch: &Orchestrator) -> String {
    let trimmed = text.trim();
    let (command, args) = match trimmed.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (trimmed, ""),
    };

    match command.to_lowercase().as_str() {
        "/help" => "Commands:\n\
             /new — start a fresh conversation\n\
             /model [name] — show or set the session model (opus | sonnet | haiku | default)\n\
             /profile [name] — show or set the session persona (default clears)\n\
             /pin <text> — save a note for this session\n\
             /pins — list saved notes\n\
             /unpin <id> — delete a note\n\
             /delegate [label:] <task> — run a task in the background\n\
             /agents — list background tasks\n\
             /cancel <id> — cancel a background task\n\
             /status — session statistics"
            .to_string(),

        "/new" => {
            let removed = session.clear();
            orch.store().persist(session);
            info!(session = %session.key(), removed, "session cleared");
            format!("Started a new conversation ({removed} messages cleared).")
        }

        "/model" => {
            if args.is_empty() {
                let current = session
                    .model()
                    .unwrap_or_else(|| "(default)".to_string());
                return format!(
                    "Session model: {current}\nSwitch with /model opus | sonnet | haiku, or /model default."
                );
            }
            if args.eq_ignore_ascii_case("default") {
                session.set_model(None);
                orch.store().persist(session);
                return "Session model reset to the default.".to_string();
            }
            match resolve_model_alias(args) {
                Some(model) => {
                    session.set_model(Some(model.clone()));
                    orch.store().persist(session);
                    format!("Session model set to {model}.")
                }
                None => format!("Unknown model '{args}'. Try opus, sonnet, or haiku."),
            }
        }

        "/profile" => {
            if args.is_empty() {
                let current = session
                    .profile()
                    .unwrap_or_else(|| "(none)".to_string());
                return format!("Session profile: {current}");
            }
            if args.eq_ignore_ascii_case("default") {
                session.set_profile(None);
                orch.store().persist(session);
                return "Session profile cleared.".to_string();
            }
            session.set_profile(Some(args.to_string()));
            orch.store().persist(session);
            format!("Session profile set to '{args}'.")
        }

        "/pin" => {
            if args.is_empty() {
                return "Usage: /pin <text>".to_string();
            }
            let Some(persister) = orch.persister() else {
                return "Pins are unavailable — no durable store configured.".to_string();
            };
            let pin = Pin::new(session.key().as_str(), args);
            match persister.save_pin(&pin) {
                Ok(()) => format!("Pinned ({}).", pin.id),
                Err(e) => format!("Failed to save pin: {e}"),
            }
        }

        "/pins" => {
            let Some(persister) = orch.persister() else {
                return "Pins are unavailable — no durable store configured.".to_string();
            };
            match persister.load_pins_by_session(session.key().as_str()) {
                Ok(pins) if pins.is_empty() => "No pins yet. Add one with /pin <text>.".to_string(),
                Ok(pins) => pins
                    .iter()
                    .map(|p| format!("{} — {}", p.id, p.text))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("Failed to load pins: {e}"),
            }
        }

        "/unpin" => {
            if args.is_empty() {
                return "Usage: /unpin <id>".to_string();
            }
            let Some(persister) = orch.persister() else {
                return "Pins are unavailable — no durable store configured.".to_string();
            };
            match persister.delete_pin(args) {
                Ok(()) => "Pin deleted.".to_string(),
                Err(e) => format!("Failed to delete pin: {e}"),
            }
        }

        "/delegate" => {
            if args.is_empty() {
                return "Usage: /delegate [label:] <task>".to_string();
            }
            let (label, task) = match args.split_once(':') {
                Some((l, t)) if !t.trim().is_empty() => (l.trim(), t.trim()),
                _ => ("task", args),
            };
            match orch
                .subagents()
                .spawn(task, label, None, session.key().as_str())
            {
                Ok(id) => format!(
                    "Started background task \"{label}\" ({id}). I'll post the result here when it finishes."
                ),
                Err(e) => format!("Could not start background task: {e}"),
            }
        }

        "/agents" => {
            let agents = orch.subagents().list();
            if agents.is_empty() {
                return "No background tasks.".to_string();
            }
            agents
                .iter()
                .map(|a| format!("{} — \"{}\" [{}]", a.id, a.label, a.status))
                .collect::<Vec<_>>()
                .join("\n")
        }

        "/cancel" => {
            if args.is_empty() {
                return "Usage: /cancel <id>".to_string();
            }
            if orch.subagents().cancel(args) {
                "Background task canceled.".to_string()
            } else {
                "No running background task with that ID.".to_string()
            }
        }

        "/status" => {
            let usage = session.usage();
            format!(
                "Session {}\n\
                 messages: {}\n\
                 model: {}\n\
                 profile: {}\n\
                 tokens: {} in / {} out\n\
                 compactions: {}\n\
                 last context: {} tokens",
                session.key(),
                session.len(),
                session.model().unwrap_or_else(|| "(default)".to_string()),
                session.profile().unwrap_or_else(|| "(none)".to_string()),
                usage.input_tokens,
                usage.output_tokens,
                usage.compactions,
                usage.last_context_tokens,
            )
        }

        _ => format!("Unknown command '{command}'. Send /help for the list."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use courier_agent::ToolRegistry;
    use courier_core::config::{AgentConfig, CourierConfig};
    use courier_core::Message;
    use courier_store::SqlitePersister;

    use crate::orchestrator::Orchestrator;

    fn config() -> CourierConfig {
        CourierConfig {
            gateway: Default::default(),
            agent: AgentConfig {
                api_key: "sk-test".to_string(),
                base_url: "https://api.anthropic.com".to_string(),
                model: "claude-sonnet-4-6".to_string(),
                max_tokens: 1024,
                fallback: None,
            },
            database: Default::default(),
            channels: Default::default(),
            limits: Default::default(),
        }
    }

    async fn orch_with_persister() -> Arc<Orchestrator> {
        let persister = Arc::new(SqlitePersister::open_in_memory().unwrap());
        Orchestrator::new(config(), Some(persister), Arc::new(ToolRegistry::new()))
    }

    #[tokio::test]
    async fn new_clears_messages_and_overrides() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");
        session.add_message(Message::user("telegram", "u", "hi"));
        session.set_model(Some("claude-opus-4-6".to_string()));
        session.set_profile(Some("pirate".to_string()));

        let reply = handle_command("/new", &session, &orch).await;
        assert!(reply.contains("1 messages cleared"));
        assert_eq!(session.len(), 0);
        assert_eq!(session.model(), None);
        assert_eq!(session.profile(), None);
    }

    #[tokio::test]
    async fn model_alias_and_reset() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");

        let reply = handle_command("/model opus", &session, &orch).await;
        assert!(reply.contains("claude-opus-4-6"));
        assert_eq!(session.model().as_deref(), Some("claude-opus-4-6"));

        handle_command("/model default", &session, &orch).await;
        assert_eq!(session.model(), None);

        let reply = handle_command("/model gpt-5", &session, &orch).await;
        assert!(reply.contains("Unknown model"));
    }

    #[tokio::test]
    async fn pin_roundtrip() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");

        let reply = handle_command("/pin remember the milk", &session, &orch).await;
        assert!(reply.starts_with("Pinned"));

        let listing = handle_command("/pins", &session, &orch).await;
        assert!(listing.contains("remember the milk"));

        let id = orch
            .persister()
            .unwrap()
            .load_pins_by_session("telegram:1")
            .unwrap()[0]
            .id
            .clone();
        let reply = handle_command(&format!("/unpin {id}"), &session, &orch).await;
        assert_eq!(reply, "Pin deleted.");
        let listing = handle_command("/pins", &session, &orch).await;
        assert!(listing.contains("No pins yet"));
    }

    #[tokio::test]
    async fn unknown_command_points_to_help() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");
        let reply = handle_command("/frobnicate now", &session, &orch).await;
        assert!(reply.contains("/help"));
    }

    #[tokio::test]
    async fn status_reports_session_state() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");
        session.add_message(Message::user("telegram", "u", "hi"));
        session.record_usage(120, 40);

        let reply = handle_command("/status", &session, &orch).await;
        assert!(reply.contains("messages: 1"));
        assert!(reply.contains("120 in / 40 out"));
    }

    #[tokio::test]
    async fn delegate_without_runner_reports_error() {
        let orch = orch_with_persister().await;
        let session = orch.store().get_or_create("telegram", "1");
        let reply = handle_command("/delegate check the logs", &session, &orch).await;
        assert!(reply.contains("Could not start background task"));
    }
}
