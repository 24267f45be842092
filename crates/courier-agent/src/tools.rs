//! Tool registry — the table the agentic loop consults to turn `tool_use`
//! blocks into side-effecting procedure calls.
//!
//! Parameter lists are stored provider-neutral; translation to the
//! provider's JSON Schema happens at request time in `wire_definitions`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default ceiling on a single tool handler execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolParam {
    pub name: String,
    /// JSON type name: "string", "number", "boolean", …
    pub kind: String,
    pub description: String,
    pub required: bool,
}

impl ToolParam {
    pub fn string(name: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: "string".to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// Language-neutral tool description.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

/// String-keyed arguments handed to a handler (already parsed from the
/// model's input JSON).
pub type ToolArgs = Map<String, Value>;

/// Async tool handler. Receives a cancellation token descending from the
/// orchestrator root and the parsed argument map; returns the textual result.
pub type ToolHandler =
    Arc<dyn Fn(CancellationToken, ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// Name → (schema, handler) table. Stateless beyond the table itself.
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
        }
    }

    /// Register a tool; a tool with the same name is replaced.
    pub fn register(&self, spec: ToolSpec, handler: ToolHandler) {
        let name = spec.name.clone();
        self.tools
            .lock()
            .unwrap()
            .insert(name, RegisteredTool { spec, handler });
    }

    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.tools.lock().unwrap().get(name).map(|t| t.spec.clone())
    }

    /// All specs, sorted by name for deterministic output.
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .lock()
            .unwrap()
            .values()
            .map(|t| t.spec.clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Provider-shape tool definitions (name, description, input_schema),
    /// built at request time.
    pub fn wire_definitions(&self) -> Vec<Value> {
        self.list()
            .iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "input_schema": input_schema(spec),
                })
            })
            .collect()
    }

    /// Execute a named tool with an enforced timeout.
    ///
    /// Non-object inputs are rejected; `null` (the normalized empty input)
    /// becomes an empty argument map.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        cancel: CancellationToken,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let handler = {
            let tools = self.tools.lock().unwrap();
            tools
                .get(name)
                .map(|t| Arc::clone(&t.handler))
                .ok_or_else(|| ToolError::Unknown(name.to_string()))?
        };

        let args = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ToolError::Failed(format!(
                    "tool input must be a JSON object, got {other}"
                )))
            }
        };

        match tokio::time::timeout(timeout, handler(cancel, args)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(timeout)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a spec's parameter list into the provider's JSON Schema shape.
fn input_schema(spec: &ToolSpec) -> Value {
    let mut properties = Map::new();
    let mut required: Vec<Value> = Vec::new();
    for param in &spec.params {
        properties.insert(
            param.name.clone(),
            json!({"type": param.kind, "description": param.description}),
        );
        if param.required {
            required.push(Value::String(param.name.clone()));
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_spec() -> ToolSpec {
        ToolSpec {
            name: "echo".to_string(),
            description: "Echo the input back".to_string(),
            params: vec![ToolParam::string("text", "Text to echo", true)],
        }
    }

    fn echo_handler() -> ToolHandler {
        Arc::new(|_cancel, args: ToolArgs| {
            Box::pin(async move {
                let text = args
                    .get("text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(text)
            })
        })
    }

    #[test]
    fn register_get_list() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(echo_spec(), echo_handler());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("echo").unwrap().name, "echo");
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list()[0].name, "echo");
    }

    #[test]
    fn schema_translation() {
        let registry = ToolRegistry::new();
        registry.register(
            ToolSpec {
                name: "get_weather".to_string(),
                description: "Current weather".to_string(),
                params: vec![
                    ToolParam::string("location", "City name", true),
                    ToolParam {
                        name: "days".to_string(),
                        kind: "number".to_string(),
                        description: "Forecast days".to_string(),
                        required: false,
                    },
                ],
            },
            echo_handler(),
        );

        let defs = registry.wire_definitions();
        assert_eq!(defs.len(), 1);
        let schema = &defs[0]["input_schema"];
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["location"]["type"], "string");
        assert_eq!(schema["properties"]["days"]["type"], "number");
        assert_eq!(schema["required"], json!(["location"]));
    }

    #[tokio::test]
    async fn execute_routes_arguments() {
        let registry = ToolRegistry::new();
        registry.register(echo_spec(), echo_handler());
        let out = registry
            .execute(
                "echo",
                json!({"text": "15C, cloudy"}),
                CancellationToken::new(),
                DEFAULT_TOOL_TIMEOUT,
            )
            .await
            .unwrap();
        assert_eq!(out, "15C, cloudy");
    }

    #[tokio::test]
    async fn execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", json!({}), CancellationToken::new(), DEFAULT_TOOL_TIMEOUT)
            .await
            .expect_err("unknown tool must fail");
        assert!(matches!(err, ToolError::Unknown(_)));
    }

    #[tokio::test]
    async fn execute_null_input_is_empty_args() {
        let registry = ToolRegistry::new();
        registry.register(
            ToolSpec {
                name: "argless".to_string(),
                description: "No arguments".to_string(),
                params: vec![],
            },
            Arc::new(|_c, args: ToolArgs| {
                Box::pin(async move { Ok(format!("args={}", args.len())) })
            }),
        );
        let out = registry
            .execute("argless", Value::Null, CancellationToken::new(), DEFAULT_TOOL_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out, "args=0");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_enforces_timeout() {
        let registry = ToolRegistry::new();
        registry.register(
            ToolSpec {
                name: "slow".to_string(),
                description: "Sleeps forever".to_string(),
                params: vec![],
            },
            Arc::new(|_c, _args| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("never".to_string())
                })
            }),
        );
        let err = registry
            .execute(
                "slow",
                json!({}),
                CancellationToken::new(),
                Duration::from_secs(60),
            )
            .await
            .expect_err("must time out");
        assert!(matches!(err, ToolError::Timeout(_)));
    }
}
