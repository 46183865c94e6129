//! The Rule VM scheduler.
//!
//! Three long-lived cooperative tasks run behind a shared shutdown flag: the
//! dispatcher (drains the ready and future queues), the snapshotter
//! (persists the awaiting-completion list), and the observability loop
//! (publishes summary counters). The two bounded queues are the only
//! cross-thread hand-off: public entry points enqueue work and never touch
//! scheduler-owned state directly. A full queue backpressures its producer;
//! every bounded send runs on the blocking pool so the producer suspends
//! instead of pinning one of the scheduler's worker threads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;

use rulevm_core::config::{env_vars, snapshot as snapshot_cfg, status as status_cfg, timer};
use rulevm_core::{StatusSink, TracingStatusSink};
use rulevm_store::{ChangeKind, DocumentStore, RuleChange, RuleDocument};

use crate::error::{Result, RuleError};
use crate::eval;
use crate::rule::Rule;
use crate::snapshot;

/// VM tuning knobs.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Ready- and future-queue capacity.
    pub queue_capacity: usize,
    /// Path of the awaiting-completion snapshot file.
    pub snapshot_path: PathBuf,
    /// Snapshot tick interval.
    pub snapshot_interval: Duration,
    /// Observability tick interval.
    pub status_interval: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            queue_capacity: env_vars::queue_capacity(),
            snapshot_path: PathBuf::from(env_vars::snapshot_path()),
            snapshot_interval: Duration::from_secs(snapshot_cfg::INTERVAL_SECS),
            status_interval: Duration::from_secs(status_cfg::INTERVAL_SECS),
        }
    }
}

/// Everything an operand needs while evaluating: the store it reads and the
/// scheduler surface it parks deferred retries on.
#[derive(Clone)]
pub struct EvalContext {
    pub store: Arc<dyn DocumentStore>,
    pub scheduler: SchedulerHandle,
}

/// Enqueue-only scheduler surface handed to evaluating operands.
#[derive(Clone)]
pub struct SchedulerHandle {
    future_tx: SyncSender<(Rule, u64)>,
    awaiting: Arc<RwLock<Vec<Rule>>>,
    future_task_count: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Park a clone of `rule` for re-evaluation after `delay_seconds`.
    ///
    /// The clone carries a fresh `instance_id` and is appended to the
    /// awaiting-completion list before it enters the future queue, so a
    /// device event arriving in between is already deduplicated. The
    /// bounded send runs on the blocking pool: a full future queue suspends
    /// the evaluating task rather than stalling a scheduler worker.
    pub async fn park_for_retry(&self, rule: &Rule, delay_seconds: u64) {
        let clone = rule.clone_for_reschedule();
        let instance_id = clone.instance_id;
        tracing::info!(
            rule_id = %clone.rule_id,
            %instance_id,
            delay_seconds,
            "Parking rule for future execution"
        );
        self.awaiting.write().push(clone.clone());
        self.future_task_count.fetch_add(1, Ordering::SeqCst);

        let future_tx = self.future_tx.clone();
        let sent =
            tokio::task::spawn_blocking(move || future_tx.send((clone, delay_seconds))).await;
        if !matches!(sent, Ok(Ok(()))) {
            tracing::error!(rule_id = %rule.rule_id, "Future queue is closed; dropping deferred rule");
            self.future_task_count.fetch_sub(1, Ordering::SeqCst);
            self.awaiting.write().retain(|r| r.instance_id != instance_id);
        }
    }
}

/// Shared state cloned into every scheduler-side task.
#[derive(Clone)]
struct Shared {
    store: Arc<dyn DocumentStore>,
    rules: Arc<RwLock<Vec<Rule>>>,
    awaiting: Arc<RwLock<Vec<Rule>>>,
    tasks_running: Arc<AtomicUsize>,
    future_task_count: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    ready_tx: SyncSender<Rule>,
    future_tx: SyncSender<(Rule, u64)>,
}

impl Shared {
    fn scheduler_handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            future_tx: self.future_tx.clone(),
            awaiting: self.awaiting.clone(),
            future_task_count: self.future_task_count.clone(),
        }
    }

    fn eval_context(&self) -> EvalContext {
        EvalContext {
            store: self.store.clone(),
            scheduler: self.scheduler_handle(),
        }
    }
}

/// The Rule VM.
pub struct Vm {
    config: VmConfig,
    status_sink: Arc<dyn StatusSink>,
    shared: Shared,
    ready_rx: StdMutex<Option<Receiver<Rule>>>,
    future_rx: StdMutex<Option<Receiver<(Rule, u64)>>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Vm {
    /// VM with default configuration and a tracing-backed status sink.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, VmConfig::default())
    }

    pub fn with_config(store: Arc<dyn DocumentStore>, config: VmConfig) -> Self {
        let (ready_tx, ready_rx) = sync_channel(config.queue_capacity);
        let (future_tx, future_rx) = sync_channel(config.queue_capacity);
        Self {
            config,
            status_sink: Arc::new(TracingStatusSink),
            shared: Shared {
                store,
                rules: Arc::new(RwLock::new(Vec::new())),
                awaiting: Arc::new(RwLock::new(Vec::new())),
                tasks_running: Arc::new(AtomicUsize::new(0)),
                future_task_count: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicBool::new(false)),
                ready_tx,
                future_tx,
            },
            ready_rx: StdMutex::new(Some(ready_rx)),
            future_rx: StdMutex::new(Some(future_rx)),
            handles: StdMutex::new(Vec::new()),
        }
    }

    /// Replace the status sink before starting the VM.
    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status_sink = sink;
        self
    }

    /// Start the dispatcher, snapshot, and observability loops.
    ///
    /// Must be called from within a tokio runtime, and before bulk loading
    /// rules: the loader enqueues an initial evaluation per rule and would
    /// otherwise suspend once the ready queue fills, with no dispatcher to
    /// drain it.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(RuleError::Scheduler("VM is already running".to_string()));
        }
        let ready_rx = self
            .ready_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuleError::Scheduler("VM cannot be restarted once stopped".to_string()))?;
        let future_rx = self
            .future_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuleError::Scheduler("VM cannot be restarted once stopped".to_string()))?;

        let mut handles = self.handles.lock().unwrap();
        handles.push(tokio::spawn(dispatcher_loop(self.shared.clone(), ready_rx, future_rx)));
        handles.push(tokio::spawn(snapshot_loop(
            self.shared.awaiting.clone(),
            self.shared.running.clone(),
            self.config.snapshot_path.clone(),
            self.config.snapshot_interval,
        )));
        handles.push(tokio::spawn(status_loop(
            self.shared.clone(),
            self.status_sink.clone(),
            self.config.status_interval,
        )));

        tracing::info!("Started VM scheduler");
        Ok(())
    }

    /// Signal all loops to halt. In-flight evaluator tasks finish on their
    /// own; this does not wait for them.
    pub fn stop(&self) {
        tracing::info!("Shutting down VM scheduler.");
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Wait for every running evaluator task to finish, then stop.
    pub async fn waited_stop(&self) {
        loop {
            let running_tasks = self.shared.tasks_running.load(Ordering::SeqCst);
            if running_tasks == 0 {
                self.stop();
                break;
            }
            tracing::info!("Waiting for {} task(s) to finish.", running_tasks);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueue a rule instance for evaluation.
    ///
    /// The bounded send runs on the blocking pool: while the ready queue is
    /// full this suspends the caller instead of pinning a worker thread the
    /// dispatcher needs to drain it.
    pub async fn execute_rule(&self, rule: Rule) {
        let ready_tx = self.shared.ready_tx.clone();
        match tokio::task::spawn_blocking(move || ready_tx.send(rule)).await {
            Ok(Ok(())) => {}
            _ => tracing::error!("Ready queue is closed; dropping rule"),
        }
    }

    /// Park a clone of `rule` in the future queue; see
    /// [`SchedulerHandle::park_for_retry`].
    pub async fn add_rule_for_future_exec(&self, rule: &Rule, delay_seconds: u64) {
        self.shared
            .scheduler_handle()
            .park_for_retry(rule, delay_seconds)
            .await;
    }

    /// Trigger every registered rule that depends on `device_id`.
    ///
    /// A rule with any instance in the awaiting-completion list is skipped:
    /// the pending deferred evaluation already covers it.
    pub async fn execute_all_dependent_rules(&self, device_id: &str) {
        let candidates: Vec<Rule> = self
            .shared
            .rules
            .read()
            .iter()
            .filter(|rule| rule.depends_on(device_id))
            .cloned()
            .collect();

        for rule in candidates {
            let parked = self
                .shared
                .awaiting
                .read()
                .iter()
                .any(|r| r.rule_id == rule.rule_id);
            if parked {
                tracing::info!(
                    rule_id = %rule.rule_id,
                    device_id,
                    "An instance is already awaiting completion; dropping trigger"
                );
                continue;
            }
            self.execute_rule(rule.clone_for_reschedule()).await;
        }
    }

    /// Apply a batch of rule-store changes to the registry.
    pub async fn rule_changed_callback(&self, changes: Vec<RuleChange>) {
        for change in changes {
            match change.kind {
                ChangeKind::Added | ChangeKind::Modified => {
                    if let Some(document) = change.document {
                        self.upsert_rule(&change.rule_id, &document).await;
                    } else {
                        tracing::error!(rule_id = %change.rule_id, "Change event carried no document");
                    }
                }
                ChangeKind::Removed => self.remove_rule(&change.rule_id),
            }
        }
    }

    /// Compile and register (or replace) a rule, then enqueue it for an
    /// immediate evaluation. A rule that fails validation is logged and
    /// omitted; the registry is left as it was.
    pub async fn upsert_rule(&self, rule_id: &str, document: &RuleDocument) {
        match Rule::compile(rule_id, document) {
            Ok(rule) => {
                {
                    let mut rules = self.shared.rules.write();
                    rules.retain(|r| r.rule_id != rule_id);
                    rules.push(rule.clone());
                }
                self.execute_rule(rule.clone_for_reschedule()).await;
            }
            Err(e) => {
                tracing::error!(rule_id, "ValidationError in parsing rule document -> {}", e);
            }
        }
    }

    /// Drop a rule from the registry.
    pub fn remove_rule(&self, rule_id: &str) {
        self.shared.rules.write().retain(|r| r.rule_id != rule_id);
        tracing::info!(rule_id, "Removed rule from registry");
    }

    /// Compile every stored rule document into the registry and enqueue each
    /// for an initial evaluation. Returns how many rules loaded.
    pub async fn load_rules_from_store(&self) -> Result<usize> {
        let documents = self.shared.store.list_rules().await?;
        let mut loaded = 0;
        for (rule_id, document) in documents {
            match Rule::compile(&rule_id, &document) {
                Ok(rule) => {
                    self.shared.rules.write().push(rule.clone());
                    self.execute_rule(rule.clone_for_reschedule()).await;
                    loaded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        rule_id = %rule_id,
                        "ValidationError in parsing rule document -> {}",
                        e
                    );
                }
            }
        }
        tracing::info!("{} rules were loaded in VM", loaded);
        Ok(loaded)
    }

    /// Best-effort restore of the awaiting-completion snapshot.
    ///
    /// Restored rules enter the READY queue, not the future queue: they
    /// re-evaluate immediately and re-park themselves with deadlines
    /// recomputed from live device data. A missing or undecodable snapshot
    /// restores nothing.
    pub async fn restore_snapshot(&self) -> usize {
        let path = self.config.snapshot_path.clone();
        let bytes = match tokio::task::spawn_blocking(move || std::fs::read(path)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Ok(Err(e)) => {
                tracing::warn!("Snapshot read failed; starting clean: {}", e);
                return 0;
            }
            Err(e) => {
                tracing::warn!("Snapshot read task failed: {}", e);
                return 0;
            }
        };

        let rules = snapshot::decode(&bytes);
        let count = rules.len();
        for rule in rules {
            self.execute_rule(rule).await;
        }
        tracing::info!("Restored {} parked rule(s) from snapshot", count);
        count
    }

    /// Ids of registered rules.
    pub fn rule_ids(&self) -> Vec<String> {
        self.shared.rules.read().iter().map(|r| r.rule_id.clone()).collect()
    }

    /// Registered rule by id.
    pub fn get_rule(&self, rule_id: &str) -> Option<Rule> {
        self.shared.rules.read().iter().find(|r| r.rule_id == rule_id).cloned()
    }

    /// Ids of rule instances in the awaiting-completion list.
    pub fn awaiting_rule_ids(&self) -> Vec<String> {
        self.shared.awaiting.read().iter().map(|r| r.rule_id.clone()).collect()
    }

    pub fn tasks_running(&self) -> usize {
        self.shared.tasks_running.load(Ordering::SeqCst)
    }

    pub fn future_tasks_count(&self) -> usize {
        self.shared.future_task_count.load(Ordering::SeqCst)
    }

    /// Context for evaluating rules outside the scheduler (immediate rules).
    pub fn eval_context(&self) -> EvalContext {
        self.shared.eval_context()
    }
}

/// Task A: drain both queues without blocking, spawn per-entry tasks, yield.
async fn dispatcher_loop(shared: Shared, ready_rx: Receiver<Rule>, future_rx: Receiver<(Rule, u64)>) {
    while shared.running.load(Ordering::SeqCst) {
        while let Ok(rule) = ready_rx.try_recv() {
            if !rule.enabled {
                tracing::debug!(rule_id = %rule.rule_id, "Skipping disabled rule");
                shared.awaiting.write().retain(|r| r.instance_id != rule.instance_id);
                continue;
            }
            shared.tasks_running.fetch_add(1, Ordering::SeqCst);
            tracing::info!(rule_id = %rule.rule_id, instance_id = %rule.instance_id, "Spawned evaluator task");
            tokio::spawn(run_evaluation(rule, shared.clone()));
        }

        while let Ok((rule, delay_seconds)) = future_rx.try_recv() {
            if !rule.enabled {
                shared.future_task_count.fetch_sub(1, Ordering::SeqCst);
                shared.awaiting.write().retain(|r| r.instance_id != rule.instance_id);
                continue;
            }
            tokio::spawn(timer_task(rule, delay_seconds, shared.clone()));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::info!("Dispatcher loop stopped");
}

/// One rule evaluation, isolated so a failure cannot halt the engine.
async fn run_evaluation(rule: Rule, shared: Shared) {
    let ctx = shared.eval_context();
    match eval::evaluate(&rule, &ctx).await {
        Ok(true) => {
            tracing::info!(
                rule_id = %rule.rule_id,
                "Executing {} action(s)",
                rule.action_stream.len()
            );
            if !rule.is_immediate() {
                record_execution(&rule, &shared).await;
            }
            for action in rule.action_stream.iter().cloned() {
                let action_ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = action.perform(&action_ctx).await {
                        tracing::error!(action = action.kind(), "Action failed: {}", e);
                    }
                });
            }
        }
        Ok(false) => {
            tracing::info!(
                rule_id = %rule.rule_id,
                "Rule did not evaluate to true. No actions will be executed."
            );
        }
        Err(e) => {
            tracing::error!(rule_id = %rule.rule_id, "Evaluation failed: {}", e);
        }
    }

    // Only this instance's awaiting entry is cleared; a deferred child has
    // its own instance id and survives.
    shared.awaiting.write().retain(|r| r.instance_id != rule.instance_id);
    shared.tasks_running.fetch_sub(1, Ordering::SeqCst);
}

/// Persist execution metadata before actions fire. Write failures are
/// logged and swallowed; the execution is not rolled back.
async fn record_execution(rule: &Rule, shared: &Shared) {
    let now = Utc::now();
    let count = {
        let mut rules = shared.rules.write();
        match rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(entry) => {
                entry.execution_count += 1;
                entry.last_execution = Some(now);
                entry.execution_count
            }
            None => rule.execution_count + 1,
        }
    };
    let patch = serde_json::json!({ "last_executed": now, "execution_count": count });
    match shared.store.update_rule(&rule.rule_id, patch).await {
        Ok(()) => tracing::debug!(
            rule_id = %rule.rule_id,
            execution_count = count,
            "Rule execution info updated"
        ),
        Err(e) => tracing::error!(rule_id = %rule.rule_id, "Failed to persist execution info: {}", e),
    }
}

/// Sleep out a future-queue entry, then hand it back to the ready queue.
async fn timer_task(rule: Rule, delay_seconds: u64, shared: Shared) {
    tracing::debug!(rule_id = %rule.rule_id, delay_seconds, "Timer task sleeping");
    tokio::time::sleep(Duration::from_secs(delay_seconds + timer::FIRE_SLACK_SECS)).await;

    let ready_tx = shared.ready_tx.clone();
    let rule_id = rule.rule_id.clone();
    match tokio::task::spawn_blocking(move || ready_tx.send(rule)).await {
        Ok(Ok(())) => {}
        _ => tracing::error!(rule_id = %rule_id, "Failed to re-enqueue deferred rule"),
    }
    shared.future_task_count.fetch_sub(1, Ordering::SeqCst);
}

/// Task B: rewrite the awaiting-completion snapshot when it changed.
async fn snapshot_loop(
    awaiting: Arc<RwLock<Vec<Rule>>>,
    running: Arc<AtomicBool>,
    path: PathBuf,
    interval: Duration,
) {
    let mut last_fingerprint: Option<Vec<uuid::Uuid>> = None;
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;

        let parked: Vec<Rule> = awaiting.read().clone();
        let fingerprint: Vec<uuid::Uuid> = parked.iter().map(|r| r.instance_id).collect();
        if last_fingerprint.as_ref() == Some(&fingerprint) {
            continue;
        }

        match snapshot::encode(&parked) {
            Ok(bytes) => {
                let write_path = path.clone();
                match tokio::task::spawn_blocking(move || std::fs::write(write_path, bytes)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(parked = parked.len(), "Snapshot written");
                        last_fingerprint = Some(fingerprint);
                    }
                    Ok(Err(e)) => tracing::error!("Snapshot write failed: {}", e),
                    Err(e) => tracing::error!("Snapshot write task failed: {}", e),
                }
            }
            Err(e) => tracing::error!("Snapshot encode failed: {}", e),
        }
    }
    tracing::info!("Snapshot loop stopped");
}

/// Task C: publish summary counters.
async fn status_loop(shared: Shared, sink: Arc<dyn StatusSink>, interval: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;

        let rule_ids: Vec<String> =
            shared.rules.read().iter().map(|r| r.rule_id.clone()).collect();
        let parked_ids: Vec<String> =
            shared.awaiting.read().iter().map(|r| r.rule_id.clone()).collect();

        sink.publish("list_of_rules", serde_json::to_string(&rule_ids).unwrap_or_default());
        sink.publish(
            "future_task_awaiting",
            serde_json::to_string(&parked_ids).unwrap_or_default(),
        );
        sink.publish(
            "running_tasks",
            shared.tasks_running.load(Ordering::SeqCst).to_string(),
        );
        sink.publish(
            "future_tasks_count",
            shared.future_task_count.load(Ordering::SeqCst).to_string(),
        );
    }
    tracing::info!("Observability loop stopped");
}

#[cfg(test)]
pub(crate) mod testing {
    //! Evaluation contexts detached from a running VM.

    use super::*;
    use rulevm_core::config::queue;

    /// Context over `store` whose future queue can be inspected through the
    /// returned receiver.
    pub(crate) fn context(store: Arc<dyn DocumentStore>) -> (EvalContext, Receiver<(Rule, u64)>) {
        let (future_tx, future_rx) = sync_channel(queue::DEFAULT_CAPACITY);
        let ctx = EvalContext {
            store,
            scheduler: SchedulerHandle {
                future_tx,
                awaiting: Arc::new(RwLock::new(Vec::new())),
                future_task_count: Arc::new(AtomicUsize::new(0)),
            },
        };
        (ctx, future_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulevm_store::MemoryStore;
    use serde_json::json;

    fn relay_rule_doc(device_id: &str) -> RuleDocument {
        serde_json::from_value(json!({
            "name": "relay watch",
            "conditions": [
                {"operation": "relay_state", "device_id": device_id, "relay_index": 0, "state": 1}
            ],
            "actions": []
        }))
        .unwrap()
    }

    fn new_vm() -> Vm {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        Vm::new(store)
    }

    #[tokio::test]
    async fn test_add_then_remove_leaves_registry_empty() {
        let vm = new_vm();
        vm.upsert_rule("rule-a", &relay_rule_doc("sw-1")).await;
        assert_eq!(vm.rule_ids(), vec!["rule-a".to_string()]);

        vm.remove_rule("rule-a");
        assert!(vm.rule_ids().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_document_is_omitted() {
        let vm = new_vm();
        let bad: RuleDocument = serde_json::from_value(json!({
            "name": "broken",
            "conditions": [{"operation": "levitate"}]
        }))
        .unwrap();
        vm.upsert_rule("rule-bad", &bad).await;
        assert!(vm.rule_ids().is_empty());
    }

    #[tokio::test]
    async fn test_dependent_trigger_dedups_against_awaiting() {
        let vm = new_vm();
        vm.upsert_rule("rule-a", &relay_rule_doc("sw-1")).await;

        // Drain the enqueue that upsert_rule performed.
        let ready_rx = vm.ready_rx.lock().unwrap().take().unwrap();
        assert_eq!(ready_rx.try_recv().unwrap().rule_id, "rule-a");

        // Park an instance, then fire two device events.
        let rule = vm.get_rule("rule-a").unwrap();
        vm.add_rule_for_future_exec(&rule, 300).await;
        assert_eq!(vm.awaiting_rule_ids(), vec!["rule-a".to_string()]);

        vm.execute_all_dependent_rules("sw-1").await;
        vm.execute_all_dependent_rules("sw-1").await;

        // Exactly zero additional ready-queue entries.
        assert!(ready_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_parked_clone_has_fresh_instance() {
        let vm = new_vm();
        vm.upsert_rule("rule-a", &relay_rule_doc("sw-1")).await;
        let rule = vm.get_rule("rule-a").unwrap();

        vm.add_rule_for_future_exec(&rule, 60).await;
        assert_eq!(vm.future_tasks_count(), 1);

        let parked = vm.shared.awaiting.read()[0].clone();
        assert_eq!(parked.rule_id, rule.rule_id);
        assert_ne!(parked.instance_id, rule.instance_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ready_queue_backpressure_suspends_then_drains() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let vm = Arc::new(Vm::with_config(
            store,
            VmConfig {
                queue_capacity: 2,
                ..VmConfig::default()
            },
        ));
        let rule = Rule::compile("rule-a", &relay_rule_doc("sw-1")).unwrap();

        let producer_vm = vm.clone();
        let producer_rule = rule.clone();
        let producer = tokio::spawn(async move {
            for _ in 0..3 {
                producer_vm
                    .execute_rule(producer_rule.clone_for_reschedule())
                    .await;
            }
        });

        // The third send cannot complete while the queue holds two entries;
        // the producer task stays suspended on it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished());

        let ready_rx = vm.ready_rx.lock().unwrap().take().unwrap();
        ready_rx.recv().unwrap();
        producer.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_lifecycle() {
        let vm = new_vm();
        assert!(!vm.is_running());

        vm.start().unwrap();
        assert!(vm.is_running());
        assert!(vm.start().is_err());

        vm.waited_stop().await;
        assert!(!vm.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removed_change_event_drops_rule() {
        let vm = new_vm();
        vm.upsert_rule("rule-a", &relay_rule_doc("sw-1")).await;
        vm.rule_changed_callback(vec![RuleChange {
            kind: ChangeKind::Removed,
            rule_id: "rule-a".to_string(),
            document: None,
        }])
        .await;
        assert!(vm.rule_ids().is_empty());
    }
}
