//! Background sub-agents: detached agentic loops whose results are injected
//! back into the originating conversation.
//!
//! The manager never holds an orchestrator reference — the completion
//! callback is supplied at construction and carries everything needed to
//! notify the parent session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::Message;
use courier_store::{SqlitePersister, SubAgentRecord, SubAgentStatus};

use crate::client::{AgentClient, ToolLoopOptions};
use crate::error::AgentError;
use crate::tools::ToolRegistry;

/// Invoked once per sub-agent reaching `done` or `failed`, with a snapshot of
/// the final record.
pub type CompletionCallback =
    Arc<dyn Fn(SubAgentRecord) -> BoxFuture<'static, ()> + Send + Sync>;

/// What a sub-agent worker runs with: the live client, the tool table, and a
/// bounded iteration budget. Installed after the agent client exists and
/// refreshed on hot reload.
#[derive(Clone)]
pub struct SubAgentRunner {
    pub client: Arc<AgentClient>,
    pub registry: Arc<ToolRegistry>,
    pub max_iterations: usize,
}

struct Entry {
    record: SubAgentRecord,
    cancel: CancellationToken,
}

/// Spawns, tracks, and cancels background agents.
pub struct SubAgentManager {
    agents: Mutex<HashMap<String, Entry>>,
    persister: Option<Arc<SqlitePersister>>,
    runner: RwLock<Option<SubAgentRunner>>,
    on_complete: CompletionCallback,
    root: CancellationToken,
}

impl SubAgentManager {
    pub fn new(
        persister: Option<Arc<SqlitePersister>>,
        on_complete: CompletionCallback,
        root: CancellationToken,
    ) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            persister,
            runner: RwLock::new(None),
            on_complete,
            root,
        }
    }

    /// Install or replace the runner (agent client + registry).
    pub fn set_runner(&self, runner: SubAgentRunner) {
        *self.runner.write().unwrap() = Some(runner);
    }

    /// Start a detached worker. Returns the fresh sub-agent ID immediately.
    pub fn spawn(
        self: &Arc<Self>,
        task: &str,
        label: &str,
        system_prompt: Option<&str>,
        parent_session_key: &str,
    ) -> Result<String, AgentError> {
        let runner = self
            .runner
            .read()
            .unwrap()
            .clone()
            .ok_or(AgentError::NotConfigured)?;

        let record = SubAgentRecord::new(task, label, system_prompt, parent_session_key);
        let id = record.id.clone();
        let cancel = self.root.child_token();

        self.agents.lock().unwrap().insert(
            id.clone(),
            Entry {
                record: record.clone(),
                cancel: cancel.clone(),
            },
        );
        self.persist(&record);

        info!(id = %id, label, parent = parent_session_key, "sub-agent spawned");

        let manager = Arc::clone(self);
        let task_text = task.to_string();
        let system = system_prompt.map(String::from);
        tokio::spawn(async move {
            manager.run_worker(id, task_text, system, runner, cancel).await;
        });

        Ok(record.id)
    }

    async fn run_worker(
        self: Arc<Self>,
        id: String,
        task: String,
        system_prompt: Option<String>,
        runner: SubAgentRunner,
        cancel: CancellationToken,
    ) {
        self.update(&id, |r| r.status = SubAgentStatus::Running);

        let seed = Message::user("subagent", "spawner", &task);
        let opts = ToolLoopOptions {
            max_iterations: runner.max_iterations,
            ..ToolLoopOptions::default()
        };
        let outcome = runner
            .client
            .chat_with_tools(
                &[seed],
                system_prompt.as_deref(),
                &runner.registry,
                &opts,
                None,
                &cancel,
            )
            .await;

        let finished = self.update(&id, |r| {
            // A concurrent cancel() wins: terminal states are monotonic.
            if r.status.is_terminal() {
                if r.completed_at.is_none() {
                    r.completed_at = Some(Utc::now());
                }
                return;
            }
            r.completed_at = Some(Utc::now());
            match &outcome {
                Ok(resp) => {
                    r.status = SubAgentStatus::Done;
                    r.result = Some(resp.text.clone());
                }
                Err(AgentError::Cancelled) => {
                    r.status = SubAgentStatus::Canceled;
                }
                Err(e) => {
                    r.status = SubAgentStatus::Failed;
                    r.error = Some(e.to_string());
                }
            }
        });

        let Some(record) = finished else { return };
        info!(id = %record.id, status = %record.status, "sub-agent finished");

        // Parent notification only for completed/failed — a cancel was
        // user-initiated and needs no echo.
        if matches!(record.status, SubAgentStatus::Done | SubAgentStatus::Failed) {
            (self.on_complete)(record).await;
        }
    }

    /// Transition `running → canceled` by signalling the worker's token.
    /// Returns false for unknown IDs and already-terminal agents.
    pub fn cancel(&self, id: &str) -> bool {
        let snapshot = {
            let mut agents = self.agents.lock().unwrap();
            let Some(entry) = agents.get_mut(id) else {
                return false;
            };
            if entry.record.status.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            entry.record.status = SubAgentStatus::Canceled;
            entry.record.completed_at = Some(Utc::now());
            entry.record.clone()
        };
        self.persist(&snapshot);
        info!(id, "sub-agent canceled");
        true
    }

    pub fn get(&self, id: &str) -> Option<SubAgentRecord> {
        self.agents
            .lock()
            .unwrap()
            .get(id)
            .map(|e| e.record.clone())
    }

    /// Snapshots of every tracked agent, newest first.
    pub fn list(&self) -> Vec<SubAgentRecord> {
        let mut records: Vec<SubAgentRecord> = self
            .agents
            .lock()
            .unwrap()
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// Count of agents still pending or running.
    pub fn active_count(&self) -> usize {
        self.agents
            .lock()
            .unwrap()
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .count()
    }

    /// Startup pass: pending rows in the persister were interrupted by a
    /// restart and are not resumed — mark them failed.
    pub fn mark_orphans(&self) {
        let Some(persister) = &self.persister else {
            return;
        };
        let pending = match persister.load_pending_subagents() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load pending sub-agents");
                return;
            }
        };
        let count = pending.len();
        for mut record in pending {
            record.status = SubAgentStatus::Failed;
            record.error = Some("orphaned by restart".to_string());
            record.completed_at = Some(Utc::now());
            self.persist(&record);

            let token = CancellationToken::new();
            token.cancel();
            self.agents.lock().unwrap().insert(
                record.id.clone(),
                Entry {
                    record,
                    cancel: token,
                },
            );
        }
        if count > 0 {
            warn!(count, "sub-agents orphaned by restart marked failed");
        }
    }

    /// Apply a mutation to a tracked record, persist, and return a snapshot.
    fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut SubAgentRecord),
    ) -> Option<SubAgentRecord> {
        let snapshot = {
            let mut agents = self.agents.lock().unwrap();
            let entry = agents.get_mut(id)?;
            mutate(&mut entry.record);
            entry.record.clone()
        };
        self.persist(&snapshot);
        Some(snapshot)
    }

    fn persist(&self, record: &SubAgentRecord) {
        if let Some(persister) = &self.persister {
            if let Err(e) = persister.save_subagent(record) {
                warn!(id = %record.id, error = %e, "sub-agent write-through failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use courier_core::DeltaSink;

    use crate::provider::{Block, Turn, TurnProvider, TurnRequest};

    struct OneShot(&'static str);

    #[async_trait]
    impl TurnProvider for OneShot {
        fn name(&self) -> &str {
            "oneshot"
        }

        async fn run_turn(
            &self,
            _req: &TurnRequest,
            _on_delta: Option<&DeltaSink>,
            cancel: &CancellationToken,
        ) -> Result<Turn, AgentError> {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            Ok(Turn {
                text: self.0.to_string(),
                blocks: vec![Block::Text {
                    text: self.0.to_string(),
                }],
                stop_reason: "end_turn".to_string(),
                model: "m".to_string(),
                tokens_in: 1,
                tokens_out: 1,
            })
        }
    }

    /// Parks until cancelled, then reports cancellation.
    struct Parked;

    #[async_trait]
    impl TurnProvider for Parked {
        fn name(&self) -> &str {
            "parked"
        }

        async fn run_turn(
            &self,
            _req: &TurnRequest,
            _on_delta: Option<&DeltaSink>,
            cancel: &CancellationToken,
        ) -> Result<Turn, AgentError> {
            cancel.cancelled().await;
            Err(AgentError::Cancelled)
        }
    }

    fn runner(provider: Box<dyn TurnProvider>) -> SubAgentRunner {
        SubAgentRunner {
            client: Arc::new(AgentClient::new(provider, "m".to_string(), 256)),
            registry: Arc::new(ToolRegistry::new()),
            max_iterations: 4,
        }
    }

    fn manager(
        persister: Option<Arc<SqlitePersister>>,
    ) -> (Arc<SubAgentManager>, Arc<AtomicUsize>, Arc<Mutex<Vec<SubAgentRecord>>>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Mutex<Vec<SubAgentRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let fired2 = Arc::clone(&fired);
        let seen2 = Arc::clone(&seen);
        let callback: CompletionCallback = Arc::new(move |record| {
            let fired = Arc::clone(&fired2);
            let seen = Arc::clone(&seen2);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
                seen.lock().unwrap().push(record);
            })
        });
        let mgr = Arc::new(SubAgentManager::new(
            persister,
            callback,
            CancellationToken::new(),
        ));
        (mgr, fired, seen)
    }

    async fn wait_terminal(mgr: &SubAgentManager, id: &str) -> SubAgentRecord {
        for _ in 0..200 {
            if let Some(r) = mgr.get(id) {
                if r.status.is_terminal() {
                    return r;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("sub-agent {id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn spawn_runs_to_done_and_notifies() {
        let (mgr, fired, seen) = manager(None);
        mgr.set_runner(runner(Box::new(OneShot("done deal"))));

        let id = mgr
            .spawn("scan the logs", "scanner", None, "telegram:1")
            .unwrap();
        let record = wait_terminal(&mgr, &id).await;

        assert_eq!(record.status, SubAgentStatus::Done);
        assert_eq!(record.result.as_deref(), Some("done deal"));
        assert!(record.completed_at.is_some());
        assert_eq!(record.parent_session_key, "telegram:1");

        // Callback may fire just after the terminal state is visible.
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap()[0].label, "scanner");
    }

    #[tokio::test]
    async fn spawn_without_runner_fails() {
        let (mgr, _, _) = manager(None);
        assert!(matches!(
            mgr.spawn("t", "l", None, "k"),
            Err(AgentError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn cancel_parks_no_callback() {
        let (mgr, fired, _) = manager(None);
        mgr.set_runner(runner(Box::new(Parked)));

        let id = mgr.spawn("never ends", "sleeper", None, "telegram:1").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(mgr.cancel(&id));

        let record = wait_terminal(&mgr, &id).await;
        assert_eq!(record.status, SubAgentStatus::Canceled);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Cancelling a terminal agent is a no-op.
        assert!(!mgr.cancel(&id));
    }

    #[tokio::test]
    async fn orphans_are_marked_failed() {
        let persister = Arc::new(SqlitePersister::open_in_memory().unwrap());
        let mut interrupted = SubAgentRecord::new("half done", "orphan", None, "telegram:1");
        interrupted.status = SubAgentStatus::Running;
        persister.save_subagent(&interrupted).unwrap();

        let (mgr, _, _) = manager(Some(Arc::clone(&persister)));
        mgr.mark_orphans();

        let record = mgr.get(&interrupted.id).unwrap();
        assert_eq!(record.status, SubAgentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("orphaned by restart"));

        let stored = persister.load_all_subagents().unwrap();
        assert_eq!(stored[0].status, SubAgentStatus::Failed);
        assert!(persister.load_pending_subagents().unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_and_persistence_round_trip() {
        let persister = Arc::new(SqlitePersister::open_in_memory().unwrap());
        let (mgr, _, _) = manager(Some(Arc::clone(&persister)));
        mgr.set_runner(runner(Box::new(OneShot("ok"))));

        let id = mgr.spawn("job", "worker", Some("be brief"), "telegram:2").unwrap();
        let _ = wait_terminal(&mgr, &id).await;

        assert_eq!(mgr.list().len(), 1);
        assert_eq!(mgr.active_count(), 0);

        let stored = persister.load_all_subagents().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, SubAgentStatus::Done);
        assert_eq!(stored[0].system_prompt.as_deref(), Some("be brief"));
    }
}
