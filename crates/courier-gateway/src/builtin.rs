//! Built-in tools registered at startup. The production tool surface is
//! deployment-specific; these defaults keep the agentic path live and give
//! the model a harmless capability set out of the box.

use std::sync::Arc;

use courier_agent::tools::{ToolArgs, ToolRegistry, ToolSpec};
use courier_agent::ToolParam;

pub fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register(
        ToolSpec {
            name: "current_time".to_string(),
            description: "Get the current date and time (UTC, RFC 3339). Use when the user \
                          asks about the current time or when scheduling context is needed."
                .to_string(),
            params: vec![],
        },
        Arc::new(|_cancel, _args: ToolArgs| {
            Box::pin(async move { Ok(chrono::Utc::now().to_rfc3339()) })
        }),
    );

    registry.register(
        ToolSpec {
            name: "word_count".to_string(),
            description: "Count words and characters in a piece of text.".to_string(),
            params: vec![ToolParam::string("text", "The text to measure", true)],
        },
        Arc::new(|_cancel, args: ToolArgs| {
            Box::pin(async move {
                let text = args
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                Ok(format!(
                    "{} words, {} characters",
                    text.split_whitespace().count(),
                    text.chars().count()
                ))
            })
        }),
    );
}
