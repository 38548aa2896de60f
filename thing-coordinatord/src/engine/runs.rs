use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use shared::composition::IoTApp;
use super::console::RunConsole;
use super::executor::{self, RunSummary};
use super::transport::ServiceCaller;

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Serializes runs of the same app; different apps run concurrently.
#[derive(Clone, Default)]
pub struct RunLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl RunLocks {
    /// Wait until no other run of `app_id` is in flight
    pub async fn acquire(&self, app_id: &str) -> RunGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(app_id.to_string()).or_default().clone()
        };
        RunGuard {
            guard: Some(lock.lock_owned().await),
            app_id: app_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held for the duration of one run. The app's entry is dropped from the
/// lock map once nobody holds or waits on it.
pub struct RunGuard {
    guard: Option<OwnedMutexGuard<()>>,
    app_id: String,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // the map's own reference is the last one left
        let idle = locks
            .get(&self.app_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.app_id);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for an earlier run of the same app
    Queued,
    Running,
    Finished,
    Cancelled,
}

/// What an API client sees of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub run_id: String,
    pub app_id: String,
    pub status: RunStatus,
    pub log: Vec<String>,
    pub pending_prompt: Option<String>,
    pub summary: Option<RunSummary>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("no such run: {0}")]
    NotFound(String),
    #[error("run {0} is not waiting for input")]
    NotWaiting(String),
}

struct RunSlot {
    state: Mutex<RunState>,
    input_tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl RunSlot {
    fn update(&self, f: impl FnOnce(&mut RunState)) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state);
    }

    fn snapshot(&self) -> RunState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Console whose output is kept in the run state and whose answers come
/// from API requests.
struct ChannelConsole {
    slot: Arc<RunSlot>,
    input_rx: mpsc::Receiver<String>,
}

#[async_trait]
impl RunConsole for ChannelConsole {
    fn write_line(&mut self, line: &str) {
        self.slot.update(|s| s.log.push(line.to_string()));
    }

    async fn read_value(&mut self, prompt: &str) -> Option<String> {
        self.slot.update(|s| s.pending_prompt = Some(prompt.to_string()));
        let answer = self.input_rx.recv().await;
        self.slot.update(|s| s.pending_prompt = None);
        answer
    }
}

/// Runs started through the API.
///
/// Finished runs stay readable for `retention`, then are dropped the next
/// time a run starts.
#[derive(Clone)]
pub struct RunManager {
    caller: Arc<dyn ServiceCaller>,
    locks: RunLocks,
    retention: Duration,
    runs: Arc<Mutex<HashMap<String, Arc<RunSlot>>>>,
}

impl RunManager {
    pub fn new(caller: Arc<dyn ServiceCaller>, locks: RunLocks, retention: Duration) -> Self {
        Self {
            caller,
            locks,
            retention,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn prune_finished(&self) {
        let Ok(retention) = chrono::Duration::from_std(self.retention) else {
            return;
        };
        let now = Utc::now();
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let before = runs.len();
        runs.retain(|_, slot| match slot.snapshot().finished_at {
            Some(finished) => now - finished <= retention,
            None => true,
        });
        if runs.len() < before {
            tracing::debug!("Dropped {} finished run(s)", before - runs.len());
        }
    }

    /// Start a run in the background and return its id
    pub fn start(&self, app: IoTApp) -> String {
        self.prune_finished();

        let run_id = uuid::Uuid::new_v4().to_string();
        let (input_tx, input_rx) = mpsc::channel(1);
        let slot = Arc::new(RunSlot {
            state: Mutex::new(RunState {
                run_id: run_id.clone(),
                app_id: app.id().to_string(),
                status: RunStatus::Queued,
                log: Vec::new(),
                pending_prompt: None,
                summary: None,
                finished_at: None,
            }),
            input_tx,
            cancel: CancellationToken::new(),
        });

        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.clone(), slot.clone());

        let caller = self.caller.clone();
        let locks = self.locks.clone();
        tokio::spawn(async move {
            let guard = locks.acquire(app.id()).await;
            slot.update(|s| s.status = RunStatus::Running);

            let cancel = slot.cancel.clone();
            let mut console = ChannelConsole {
                slot: slot.clone(),
                input_rx,
            };
            let summary = executor::run_app(&app, caller.as_ref(), &mut console, &cancel).await;
            drop(guard);

            slot.update(|s| {
                s.status = if summary.cancelled {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Finished
                };
                s.pending_prompt = None;
                s.summary = Some(summary);
                s.finished_at = Some(Utc::now());
            });
        });

        tracing::info!("Started run {}", run_id);
        run_id
    }

    fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>, RunError> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    pub fn state(&self, run_id: &str) -> Result<RunState, RunError> {
        Ok(self.slot(run_id)?.snapshot())
    }

    /// Answer the prompt the run is blocked on
    pub fn answer(&self, run_id: &str, value: String) -> Result<(), RunError> {
        let slot = self.slot(run_id)?;
        if slot.snapshot().pending_prompt.is_none() {
            return Err(RunError::NotWaiting(run_id.to_string()));
        }
        slot.input_tx
            .try_send(value)
            .map_err(|_| RunError::NotWaiting(run_id.to_string()))
    }

    pub fn cancel(&self, run_id: &str) -> Result<(), RunError> {
        let slot = self.slot(run_id)?;
        slot.cancel.cancel();
        tracing::info!("Cancellation requested for run {}", run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use serde_json::Value;
    use shared::call::{CallOutcome, ServiceCall};
    use shared::composition::{RelationshipInstance, RelationshipKind, ServiceInstance};
    use shared::types::Service;

    struct Echo;

    #[async_trait]
    impl ServiceCaller for Echo {
        async fn call(&self, _service: &Service, call: &ServiceCall) -> CallOutcome {
            CallOutcome {
                success: true,
                value: Some(Value::from(call.service_inputs.clone())),
            }
        }
    }

    fn service(name: &str, api: &str) -> Arc<Service> {
        Arc::new(Service {
            name: name.to_string(),
            thing_id: "T1".into(),
            thing_name: "RaspberryPi".into(),
            entity_id: "E1".into(),
            space_id: "MySmartSpace".into(),
            signature: api.parse().unwrap(),
            kind: String::new(),
            app_category: String::new(),
            description: String::new(),
            keywords: String::new(),
            address: None,
        })
    }

    /// A (no output) -> B(level:int), so B always has to prompt
    fn prompting_app() -> IoTApp {
        let mut app = IoTApp::new("prompting");
        let a = ServiceInstance::new(service("A", "A:[NULL]:(NULL)"));
        let b = ServiceInstance::new(service("B", r#"B:["level",int,"NULL"]:(NULL)"#));
        let rel = RelationshipInstance::new(&a, &b, RelationshipKind::Ordered, None).unwrap();
        app.add_service_instance(a).unwrap();
        app.add_service_instance(b).unwrap();
        app.add_relationship_instance(rel).unwrap();
        app
    }

    async fn wait_for(manager: &RunManager, run_id: &str, done: impl Fn(&RunState) -> bool) -> RunState {
        for _ in 0..200 {
            let state = manager.state(run_id).unwrap();
            if done(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {run_id} never reached the expected state");
    }

    #[tokio::test]
    async fn test_prompt_answered_through_manager() {
        let manager = RunManager::new(Arc::new(Echo), RunLocks::default(), Duration::from_secs(600));
        let run_id = manager.start(prompting_app());

        let state = wait_for(&manager, &run_id, |s| s.pending_prompt.is_some()).await;
        assert_eq!(state.status, RunStatus::Running);

        manager.answer(&run_id, "5".to_string()).unwrap();
        let state = wait_for(&manager, &run_id, |s| s.summary.is_some()).await;

        assert_eq!(state.status, RunStatus::Finished);
        let summary = state.summary.unwrap();
        assert_eq!(summary.get("B").unwrap().result, Some(Value::from("(5)")));
        assert!(!state.log.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_prompting() {
        let manager = RunManager::new(Arc::new(Echo), RunLocks::default(), Duration::from_secs(600));
        let run_id = manager.start(prompting_app());

        wait_for(&manager, &run_id, |s| s.pending_prompt.is_some()).await;
        manager.cancel(&run_id).unwrap();

        let state = wait_for(&manager, &run_id, |s| s.summary.is_some()).await;
        assert_eq!(state.status, RunStatus::Cancelled);
        assert_eq!(state.summary.unwrap().executed.len(), 1);
        assert!(matches!(manager.answer(&run_id, "1".into()), Err(RunError::NotWaiting(_))));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let manager = RunManager::new(Arc::new(Echo), RunLocks::default(), Duration::from_secs(600));
        assert!(matches!(manager.state("nope"), Err(RunError::NotFound(_))));
        assert!(matches!(manager.cancel("nope"), Err(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_same_app_runs_are_serialized() {
        let locks = RunLocks::default();
        let first = locks.acquire("app-1").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.acquire("app-1").await;
            })
        };
        // a different app is not held up
        let _other = locks.acquire("app-2").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_entries_released_after_use() {
        let locks = RunLocks::default();
        let first = locks.acquire("app-1").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _second = locks.acquire("app-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the waiter still holds the entry when the first guard goes
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(locks.tracked(), 0);

        for i in 0..50 {
            drop(locks.acquire(&format!("app-{i}")).await);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_finished_runs_dropped_after_retention() {
        let locks = RunLocks::default();
        let manager = RunManager::new(Arc::new(Echo), locks.clone(), Duration::ZERO);

        let mut finished = Vec::new();
        for i in 0..5 {
            let run_id = manager.start(IoTApp::new(format!("empty-{i}")));
            let state = wait_for(&manager, &run_id, |s| s.summary.is_some()).await;
            assert!(state.finished_at.is_some());
            finished.push(run_id);
        }
        assert_eq!(locks.tracked(), 0);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let latest = manager.start(prompting_app());

        for run_id in &finished {
            assert!(matches!(manager.state(run_id), Err(RunError::NotFound(_))));
        }
        // runs still in flight are never dropped
        wait_for(&manager, &latest, |s| s.pending_prompt.is_some()).await;
        manager.start(IoTApp::new("another"));
        assert!(manager.state(&latest).is_ok());
        manager.cancel(&latest).unwrap();
    }
}
