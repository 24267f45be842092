//! The orchestrator: owns every subsystem and runs the inbound pipeline —
//! admission → command short-circuit → rate check → session resolve →
//! compact → agent call → persist reply — under a per-request panic barrier.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_agent::subagent::CompletionCallback;
use courier_agent::{
    AgentClient, AnthropicProvider, Compactor, FailoverProvider, LlmSummarizer, SubAgentManager,
    SubAgentRunner, ToolLoopOptions, ToolRegistry, TurnProvider,
};
use courier_channels::{ChannelAdapter, InboundSink};
use courier_core::config::{AgentConfig, CourierConfig, SHUTDOWN_WAIT_SECS};
use courier_core::message::meta;
use courier_core::{DeltaSink, Message, SessionKey};
use courier_store::{SessionStore, SqlitePersister, SubAgentStatus};

use crate::commands;
use crate::ratelimit::RateLimiter;

const REPLY_SHUTTING_DOWN: &str =
    "The service is shutting down — please try again in a moment.";
const REPLY_RATE_LIMITED: &str =
    "Rate limit exceeded — please wait a minute before sending more messages.";
const REPLY_NOT_CONFIGURED: &str =
    "The agent is not configured yet — please try again later.";
const REPLY_ERROR: &str = "Sorry, I encountered an error processing your message.";

/// Outbound notification produced by a sub-agent completion, routed to the
/// originating channel by a dispatcher task (no adapter back-reference in
/// the sub-agent manager).
struct Notification {
    channel: String,
    recipient: String,
    text: String,
}

pub struct Orchestrator {
    config: RwLock<CourierConfig>,
    store: Arc<SessionStore>,
    persister: Option<Arc<SqlitePersister>>,
    limiter: RateLimiter,
    registry: Arc<ToolRegistry>,
    /// Swap point: hot reload replaces the pointer under the write lock while
    /// in-flight requests finish on the old client.
    agent: RwLock<Option<Arc<AgentClient>>>,
    compactor: RwLock<Option<Arc<Compactor>>>,
    subagents: Arc<SubAgentManager>,
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    root: CancellationToken,
    accepting: AtomicBool,
    in_flight: AtomicI64,
    processed: AtomicU64,
    rejected: AtomicU64,
    last_message_at: Mutex<Option<DateTime<Utc>>>,
    started_at: Instant,
    /// Per-session cancellation handles for the turns currently running.
    active_turns: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        config: CourierConfig,
        persister: Option<Arc<SqlitePersister>>,
        registry: Arc<ToolRegistry>,
    ) -> Arc<Self> {
        let store = Arc::new(SessionStore::new());
        if let Some(p) = &persister {
            store.set_persister(Arc::clone(p));
        }

        let root = CancellationToken::new();
        let (notify_tx, notify_rx) = mpsc::channel::<Notification>(32);
        let callback = completion_callback(Arc::clone(&store), notify_tx);
        let subagents = Arc::new(SubAgentManager::new(
            persister.clone(),
            callback,
            root.child_token(),
        ));

        let limiter = RateLimiter::new(config.limits.rate_per_minute);

        let orch = Arc::new(Self {
            config: RwLock::new(config),
            store,
            persister,
            limiter,
            registry,
            agent: RwLock::new(None),
            compactor: RwLock::new(None),
            subagents,
            adapters: RwLock::new(HashMap::new()),
            root,
            accepting: AtomicBool::new(true),
            in_flight: AtomicI64::new(0),
            processed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_message_at: Mutex::new(None),
            started_at: Instant::now(),
            active_turns: DashMap::new(),
        });
        orch.spawn_notifier(notify_rx);
        orch
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn persister(&self) -> Option<&Arc<SqlitePersister>> {
        self.persister.as_ref()
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn subagents(&self) -> &Arc<SubAgentManager> {
        &self.subagents
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn processed_total(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        *self.last_message_at.lock().unwrap()
    }

    pub async fn config(&self) -> CourierConfig {
        self.config.read().await.clone()
    }

    pub async fn agent(&self) -> Option<Arc<AgentClient>> {
        self.agent.read().await.clone()
    }

    pub async fn channel_statuses(&self) -> Vec<(String, courier_channels::ChannelStatus)> {
        let adapters = self.adapters.read().await;
        let mut out: Vec<_> = adapters
            .iter()
            .map(|(name, a)| (name.clone(), a.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    // ── Wiring ────────────────────────────────────────────────────────────

    /// Build the provider stack from config and install the client.
    pub async fn install_agent_from_config(&self, cfg: &AgentConfig) {
        let primary = AnthropicProvider::new(cfg.api_key.clone(), Some(cfg.base_url.clone()));
        let provider: Box<dyn TurnProvider> = match &cfg.fallback {
            Some(fb) => Box::new(FailoverProvider::new(
                Box::new(primary),
                Box::new(AnthropicProvider::new(
                    fb.api_key.clone(),
                    Some(fb.base_url.clone()),
                )),
            )),
            None => Box::new(primary),
        };
        let client = Arc::new(AgentClient::new(
            provider,
            cfg.model.clone(),
            cfg.max_tokens,
        ));
        self.install_agent(client).await;
    }

    /// Install an agent client, refreshing the sub-agent runner and the
    /// compactor's summarizer along with it.
    pub async fn install_agent(&self, client: Arc<AgentClient>) {
        let limits = self.config.read().await.limits.clone();
        self.subagents.set_runner(SubAgentRunner {
            client: Arc::clone(&client),
            registry: Arc::clone(&self.registry),
            max_iterations: limits.max_tool_iterations,
        });
        let compactor = Arc::new(Compactor::new(
            limits.compact_threshold_tokens,
            limits.compact_keep_last,
            Arc::new(LlmSummarizer::new(Arc::clone(&client))),
        ));
        *self.compactor.write().await = Some(compactor);
        *self.agent.write().await = Some(client);
        info!("agent client installed");
    }

    /// Test seam: replace the compactor (e.g. with a mock summarizer).
    pub async fn install_compactor(&self, compactor: Arc<Compactor>) {
        *self.compactor.write().await = Some(compactor);
    }

    pub async fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        self.adapters.write().await.insert(name, adapter);
    }

    /// Start every registered adapter, handing each this orchestrator as the
    /// inbound sink.
    pub async fn start_adapters(self: &Arc<Self>) {
        let sink: Arc<dyn InboundSink> = Arc::clone(self) as Arc<dyn InboundSink>;
        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        for adapter in adapters {
            info!(channel = adapter.name(), "starting channel adapter");
            if let Err(e) = adapter.start(Arc::clone(&sink)).await {
                error!(channel = adapter.name(), error = %e, "adapter failed to start");
            }
        }
    }

    fn spawn_notifier(self: &Arc<Self>, mut rx: mpsc::Receiver<Notification>) {
        let orch = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                let adapter = orch.adapters.read().await.get(&n.channel).cloned();
                match adapter {
                    Some(adapter) => {
                        if let Err(e) = adapter.send_text(&n.recipient, &n.text).await {
                            warn!(channel = %n.channel, error = %e, "sub-agent notification send failed");
                        }
                    }
                    None => {
                        warn!(channel = %n.channel, "no adapter for sub-agent notification");
                    }
                }
            }
        });
    }

    // ── Pipeline ──────────────────────────────────────────────────────────

    async fn process(&self, message: Message, on_delta: Option<DeltaSink>) -> String {
        if !self.accepting.load(Ordering::SeqCst) {
            return REPLY_SHUTTING_DOWN.to_string();
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = AssertUnwindSafe(self.process_inner(message, on_delta))
            .catch_unwind()
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(reply) => reply,
            Err(_) => {
                error!("panic caught in message pipeline");
                REPLY_ERROR.to_string()
            }
        }
    }

    async fn process_inner(&self, message: Message, on_delta: Option<DeltaSink>) -> String {
        *self.last_message_at.lock().unwrap() = Some(Utc::now());

        let channel = message.channel.clone();
        let user_id = message
            .user_id()
            .map(String::from)
            .unwrap_or_else(|| message.from.clone());

        // Commands bypass the agent loop but share the session.
        if message.text.starts_with('/') {
            let session = self.store.get_or_create(&channel, &user_id);
            return commands::handle_command(&message.text, &session, self).await;
        }

        // A rate-limited message is refused before it touches the session:
        // stored conversations contain only admitted turns.
        if !self.limiter.allow(&user_id) {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return REPLY_RATE_LIMITED.to_string();
        }

        let session = self
            .store
            .add_message_and_persist(&channel, &user_id, message);
        let mut history = session.messages();

        // Compaction failures are survivable — fall back to the raw history.
        let compactor = self.compactor.read().await.clone();
        if let Some(compactor) = compactor {
            match compactor.compact_if_needed(&history).await {
                Ok(compacted) => {
                    if compacted.len() < history.len() {
                        info!(
                            session = %session.key(),
                            before = history.len(),
                            after = compacted.len(),
                            "conversation compacted"
                        );
                        session.replace_messages(compacted.clone());
                        session.record_compaction();
                        self.store.persist(&session);
                        history = compacted;
                    }
                }
                Err(e) => {
                    warn!(session = %session.key(), error = %e, "compaction failed, using raw history");
                }
            }
        }

        // Snapshot swap points under the read lock, release before I/O.
        let agent = self.agent.read().await.clone();
        let Some(agent) = agent else {
            return REPLY_NOT_CONFIGURED.to_string();
        };
        let max_iterations = self.config.read().await.limits.max_tool_iterations;

        let model_override = session.model();
        let system = session.profile().map(|p| format!("Persona: {p}"));

        let cancel = self.root.child_token();
        let key = session.key().as_str().to_string();
        self.active_turns.insert(key.clone(), cancel.clone());

        let result = if !self.registry.is_empty() {
            let opts = ToolLoopOptions {
                max_iterations,
                model_override,
                ..ToolLoopOptions::default()
            };
            agent
                .chat_with_tools(
                    &history,
                    system.as_deref(),
                    &self.registry,
                    &opts,
                    on_delta.as_ref(),
                    &cancel,
                )
                .await
        } else if let Some(sink) = on_delta.as_ref() {
            agent
                .chat_stream(
                    &history,
                    system.as_deref(),
                    model_override.as_deref(),
                    sink,
                    &cancel,
                )
                .await
        } else {
            agent
                .chat(&history, model_override.as_deref(), &cancel)
                .await
        };

        self.active_turns.remove(&key);

        match result {
            Ok(resp) => {
                let reply = Message::assistant(&channel, &resp.text)
                    .with_meta(meta::MODEL, resp.model.clone())
                    .with_meta(meta::INPUT_TOKENS, resp.input_tokens)
                    .with_meta(meta::OUTPUT_TOKENS, resp.output_tokens);
                session.add_message(reply);
                session.record_usage(resp.input_tokens, resp.output_tokens);
                self.store.persist(&session);
                self.processed.fetch_add(1, Ordering::SeqCst);
                info!(
                    session = %session.key(),
                    tokens_in = resp.input_tokens,
                    tokens_out = resp.output_tokens,
                    model = %resp.model,
                    "turn complete"
                );
                resp.text
            }
            Err(e) => {
                warn!(session = %session.key(), error = %e, "agent call failed");
                REPLY_ERROR.to_string()
            }
        }
    }

    // ── Hot reload ────────────────────────────────────────────────────────

    /// Apply a changed configuration without downtime. Credential/model
    /// changes rebuild the agent client; channel credential changes restart
    /// that adapter; smaller fields propagate in place.
    pub async fn apply_config(self: &Arc<Self>, new: CourierConfig) {
        let old = self.config.read().await.clone();
        if new == old {
            return;
        }

        if new.agent != old.agent {
            info!("agent configuration changed — rebuilding client");
            self.install_agent_from_config(&new.agent).await;
        }

        if new.channels.telegram != old.channels.telegram {
            info!("telegram configuration changed — restarting adapter");
            if let Some(adapter) = self.adapters.write().await.remove("telegram") {
                adapter.stop().await;
            }
            if let Some(tg) = &new.channels.telegram {
                let adapter: Arc<dyn ChannelAdapter> =
                    Arc::new(courier_telegram::TelegramAdapter::new(tg));
                self.register_adapter(Arc::clone(&adapter)).await;
                let sink: Arc<dyn InboundSink> = Arc::clone(self) as Arc<dyn InboundSink>;
                if let Err(e) = adapter.start(sink).await {
                    error!(error = %e, "restarted telegram adapter failed to start");
                }
            }
        }

        if new.limits.rate_per_minute != old.limits.rate_per_minute {
            info!(limit = new.limits.rate_per_minute, "rate limit updated");
            self.limiter.set_limit(new.limits.rate_per_minute);
        }

        if new.limits.compact_threshold_tokens != old.limits.compact_threshold_tokens
            || new.limits.compact_keep_last != old.limits.compact_keep_last
        {
            if let Some(client) = self.agent.read().await.clone() {
                let compactor = Arc::new(Compactor::new(
                    new.limits.compact_threshold_tokens,
                    new.limits.compact_keep_last,
                    Arc::new(LlmSummarizer::new(client)),
                ));
                *self.compactor.write().await = Some(compactor);
                info!("compactor settings updated");
            }
        }

        *self.config.write().await = new;
    }

    // ── Shutdown ──────────────────────────────────────────────────────────

    /// Graceful shutdown: refuse new work, stop adapters, drain in-flight
    /// requests (≤ 30 s), cancel background tasks, sweep sessions to the
    /// persister, close it.
    pub async fn shutdown(&self) {
        info!("graceful shutdown initiated");
        self.accepting.store(false, Ordering::SeqCst);

        let adapters: Vec<_> = self.adapters.read().await.values().cloned().collect();
        for adapter in adapters {
            adapter.stop().await;
        }

        let deadline = Instant::now() + Duration::from_secs(SHUTDOWN_WAIT_SECS);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    in_flight = self.in_flight.load(Ordering::SeqCst),
                    "shutdown wait ceiling reached, abandoning stragglers"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Cancel the watcher, heartbeat, sub-agent workers, and any turn
        // that outlived the wait.
        self.root.cancel();

        self.store.save_all();
        if let Some(persister) = &self.persister {
            persister.close();
        }
        info!("graceful shutdown complete");
    }

    /// True while the admission gate is open.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InboundSink for Orchestrator {
    async fn deliver(&self, message: Message) -> String {
        self.process(message, None).await
    }

    async fn deliver_streaming(&self, message: Message, on_delta: DeltaSink) -> String {
        self.process(message, Some(on_delta)).await
    }
}

/// Build the sub-agent completion callback: inject the result into the
/// parent session and queue a channel notification. Constructed from parts
/// rather than an orchestrator back-reference.
fn completion_callback(
    store: Arc<SessionStore>,
    notify_tx: mpsc::Sender<Notification>,
) -> CompletionCallback {
    Arc::new(move |record| {
        let store = Arc::clone(&store);
        let notify_tx = notify_tx.clone();
        Box::pin(async move {
            let (verb, detail) = match record.status {
                SubAgentStatus::Done => (
                    "completed",
                    format!("Result: {}", record.result.clone().unwrap_or_default()),
                ),
                _ => (
                    "failed",
                    format!(
                        "Error: {}",
                        record.error.clone().unwrap_or_else(|| "unknown".to_string())
                    ),
                ),
            };
            let text = format!("[Sub-agent \"{}\" {}]\n{}", record.label, verb, detail);

            let key = SessionKey::from(record.parent_session_key.clone());
            let injected = Message::user(key.channel(), "subagent", &text)
                .with_meta(meta::USER_ID, key.user_id().to_string())
                .with_meta(meta::SUBAGENT_RESULT, true)
                .with_meta(meta::SUBAGENT_LABEL, record.label.clone());
            store.add_message_and_persist(key.channel(), key.user_id(), injected);

            let _ = notify_tx
                .send(Notification {
                    channel: key.channel().to_string(),
                    recipient: key.user_id().to_string(),
                    text,
                })
                .await;
        })
    })
}
