//! Recurring tool-call scheduler.
//!
//! Tasks describe a tool call that runs every `interval_seconds`.  A
//! background task wakes every second, collects due work under the lock,
//! releases it, then executes each task via the externally-registered
//! executor (the supervisor's `process_call` in production).  State is
//! flushed to a `{tasks: [...]}` JSON file after every mutation; run
//! history lives in a bounded in-memory ring only.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;

/// Run records kept per task (in-memory only).
const HISTORY_MAX: usize = 50;

/// How often the background loop scans for due tasks.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Executes one tool call; `Err` strings land in `last_error`.
pub type TaskExecutor = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub tool: String,
    pub args: Value,
    pub interval_seconds: u64,
    pub enabled: bool,
    pub created_at: String,
    pub last_run_at: Option<String>,
    /// Epoch seconds of the next due run.
    pub next_run_at: f64,
    pub run_count: u64,
    pub last_result: Option<Value>,
    pub last_error: Option<String>,
}

/// One entry in the per-task history ring.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistoryRecord {
    pub run: u64,
    pub timestamp: String,
    pub duration_seconds: f64,
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SchedulerError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("tool must not be empty")]
    EmptyTool,
    #[error("interval_seconds must be >= 1")]
    BadInterval,
}

/// Mutable-field patch for `update_task`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub args: Option<Value>,
    pub interval_seconds: Option<u64>,
    pub enabled: Option<bool>,
}

#[derive(Serialize, Deserialize, Default)]
struct ScheduleFile {
    tasks: Vec<ScheduledTask>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn epoch_to_iso(epoch: f64) -> String {
    DateTime::<Utc>::from_timestamp(epoch as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

// ─── TaskScheduler ───────────────────────────────────────────────────────────

pub struct TaskScheduler {
    path: PathBuf,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
    history: Mutex<HashMap<String, VecDeque<TaskHistoryRecord>>>,
    executor: Mutex<Option<TaskExecutor>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl TaskScheduler {
    /// Load persisted tasks (a missing or corrupt file starts empty).
    pub fn new(path: PathBuf) -> Arc<Self> {
        let tasks = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<ScheduleFile>(&raw).ok())
            .map(|f| f.tasks.into_iter().map(|t| (t.id.clone(), t)).collect())
            .unwrap_or_default();
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            path,
            tasks: Mutex::new(tasks),
            history: Mutex::new(HashMap::new()),
            executor: Mutex::new(None),
            stop_tx,
            stop_rx,
        })
    }

    /// Register the tool-call execution callback.  Tasks never run before
    /// this is set.
    pub fn set_executor(&self, executor: TaskExecutor) {
        *self.executor.lock() = Some(executor);
    }

    /// Spawn the background ticker.
    pub fn start(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scheduler.run_due_tasks(),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    // ── CRUD ─────────────────────────────────────────────────────────────

    pub fn add_task(
        &self,
        name: &str,
        tool: &str,
        args: Value,
        interval_seconds: u64,
        enabled: bool,
    ) -> Result<ScheduledTask, SchedulerError> {
        if name.trim().is_empty() {
            return Err(SchedulerError::EmptyName);
        }
        if tool.trim().is_empty() {
            return Err(SchedulerError::EmptyTool);
        }
        if interval_seconds < 1 {
            return Err(SchedulerError::BadInterval);
        }
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let task = ScheduledTask {
            id: hex::encode(id_bytes),
            name: name.to_owned(),
            tool: tool.to_owned(),
            args: if args.is_null() { json!({}) } else { args },
            interval_seconds,
            enabled,
            created_at: Utc::now().to_rfc3339(),
            last_run_at: None,
            next_run_at: now_epoch() + interval_seconds as f64,
            run_count: 0,
            last_result: None,
            last_error: None,
        };
        let view = task.clone();
        let mut tasks = self.tasks.lock();
        tasks.insert(task.id.clone(), task);
        self.persist(&tasks);
        metrics::gauge!("scheduler_tasks_total").set(tasks.len() as f64);
        Ok(view)
    }

    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        let mut out: Vec<ScheduledTask> = self.tasks.lock().values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get_task(&self, id: &str) -> Option<ScheduledTask> {
        self.tasks.lock().get(id).cloned()
    }

    pub fn delete_task(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.remove(id).is_none() {
            return false;
        }
        self.history.lock().remove(id);
        self.persist(&tasks);
        metrics::gauge!("scheduler_tasks_total").set(tasks.len() as f64);
        true
    }

    pub fn update_task(
        &self,
        id: &str,
        patch: TaskPatch,
    ) -> Result<Option<ScheduledTask>, SchedulerError> {
        // Validate the whole patch before touching the live entry so a
        // rejected update never partially takes effect.
        if patch.name.as_ref().is_some_and(|n| n.trim().is_empty()) {
            return Err(SchedulerError::EmptyName);
        }
        if patch.interval_seconds.is_some_and(|i| i < 1) {
            return Err(SchedulerError::BadInterval);
        }
        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            task.name = name;
        }
        if let Some(args) = patch.args {
            task.args = if args.is_null() { json!({}) } else { args };
        }
        if let Some(interval) = patch.interval_seconds {
            task.interval_seconds = interval;
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }
        let view = task.clone();
        self.persist(&tasks);
        Ok(Some(view))
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(id) {
            Some(task) => {
                task.enabled = enabled;
                self.persist(&tasks);
                true
            }
            None => false,
        }
    }

    /// Force the task to run on the next tick.
    pub fn trigger_task(&self, id: &str) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(id) {
            Some(task) => {
                task.next_run_at = now_epoch() - 1.0;
                self.persist(&tasks);
                true
            }
            None => false,
        }
    }

    /// Most-recent run records, newest first.  `None` for unknown tasks.
    pub fn history(&self, id: &str, limit: usize) -> Option<Vec<TaskHistoryRecord>> {
        if !self.tasks.lock().contains_key(id) {
            return None;
        }
        let history = self.history.lock();
        let ring = history.get(id);
        Some(
            ring.map(|r| r.iter().rev().take(limit.max(1)).cloned().collect())
                .unwrap_or_default(),
        )
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// One scheduler pass: execute everything due.  Public so tests (and
    /// the trigger path) can drive it without waiting for the ticker.
    pub fn run_due_tasks(&self) {
        let Some(executor) = self.executor.lock().clone() else {
            return;
        };
        let now = now_epoch();
        let due: Vec<ScheduledTask> = {
            let tasks = self.tasks.lock();
            tasks
                .values()
                .filter(|t| t.enabled && t.next_run_at <= now)
                .cloned()
                .collect()
        };
        for task in due {
            self.run_one(&executor, &task.id, &task.tool, task.args.clone(), &task.name);
        }
    }

    fn run_one(&self, executor: &TaskExecutor, id: &str, tool: &str, args: Value, name: &str) {
        let payload = json!({ "tool": tool, "args": args });
        let started = Instant::now();
        let outcome = executor(&payload);
        let duration = started.elapsed().as_secs_f64();

        metrics::counter!("scheduler_runs_total", "task" => name.to_owned()).increment(1);
        if outcome.is_err() {
            metrics::counter!("scheduler_errors_total", "task" => name.to_owned()).increment(1);
        }
        metrics::histogram!("scheduler_run_duration_seconds", "task" => name.to_owned())
            .record(duration);

        let mut tasks = self.tasks.lock();
        let Some(task) = tasks.get_mut(id) else {
            return; // deleted mid-run
        };
        let now_iso = Utc::now().to_rfc3339();
        let (ok, result, error) = match outcome {
            Ok(value) => {
                task.last_result = Some(value.clone());
                task.last_error = None;
                (true, Some(value), None)
            }
            Err(err) => {
                task.last_result = None;
                task.last_error = Some(err.clone());
                (false, None, Some(err))
            }
        };
        task.last_run_at = Some(now_iso.clone());
        task.next_run_at = now_epoch() + task.interval_seconds as f64;
        task.run_count += 1;
        let record = TaskHistoryRecord {
            run: task.run_count,
            timestamp: now_iso,
            duration_seconds: duration,
            ok,
            result,
            error,
        };
        self.persist(&tasks);
        drop(tasks);

        let mut history = self.history.lock();
        let ring = history.entry(id.to_owned()).or_default();
        ring.push_back(record);
        while ring.len() > HISTORY_MAX {
            ring.pop_front();
        }
    }

    fn persist(&self, tasks: &HashMap<String, ScheduledTask>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = ScheduleFile { tasks: tasks.values().cloned().collect() };
        if let Ok(json) = serde_json::to_string_pretty(&file) {
            if let Err(err) = fs::write(&self.path, json) {
                tracing::warn!(%err, "failed to persist schedule");
            }
        }
    }
}

/// API view with `next_run_at` rendered as ISO-8601.
pub fn task_view(task: &ScheduledTask) -> Value {
    let mut v = serde_json::to_value(task).unwrap_or_default();
    if let Some(obj) = v.as_object_mut() {
        obj.insert("next_run_at".to_owned(), json!(epoch_to_iso(task.next_run_at)));
    }
    v
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn scheduler(dir: &TempDir) -> Arc<TaskScheduler> {
        TaskScheduler::new(dir.path().join("schedule.json"))
    }

    fn counting_executor(counter: Arc<AtomicU32>) -> TaskExecutor {
        Arc::new(move |payload: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "echo": payload["tool"] }))
        })
    }

    #[test]
    fn add_task_validates_inputs() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        assert_eq!(s.add_task("", "echo", json!({}), 5, true).unwrap_err(), SchedulerError::EmptyName);
        assert_eq!(s.add_task("t", "", json!({}), 5, true).unwrap_err(), SchedulerError::EmptyTool);
        assert_eq!(s.add_task("t", "echo", json!({}), 0, true).unwrap_err(), SchedulerError::BadInterval);
        let task = s.add_task("t", "echo", json!({"k": 1}), 5, true).unwrap();
        assert_eq!(task.id.len(), 16);
        assert_eq!(task.run_count, 0);
    }

    #[test]
    fn tasks_persist_across_restart() {
        let dir = TempDir::new().unwrap();
        let id = {
            let s = scheduler(&dir);
            s.add_task("daily", "report.build", json!({}), 60, true).unwrap().id
        };
        let s = scheduler(&dir);
        let task = s.get_task(&id).expect("reloaded");
        assert_eq!(task.name, "daily");
    }

    #[test]
    fn trigger_makes_task_due_immediately() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        s.set_executor(counting_executor(counter.clone()));

        let task = s.add_task("t", "echo", json!({}), 3600, true).unwrap();
        s.run_due_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 0, "not yet due");

        assert!(s.trigger_task(&task.id));
        s.run_due_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let after = s.get_task(&task.id).unwrap();
        assert_eq!(after.run_count, 1);
        assert!(after.last_run_at.is_some());
        assert!(after.next_run_at > now_epoch() + 3000.0);
        assert_eq!(after.last_result.as_ref().unwrap()["echo"], "echo");
    }

    #[test]
    fn disabled_tasks_never_run() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        s.set_executor(counting_executor(counter.clone()));
        let task = s.add_task("t", "echo", json!({}), 60, false).unwrap();
        s.trigger_task(&task.id);
        s.run_due_tasks();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn executor_errors_land_in_last_error_and_history() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        s.set_executor(Arc::new(|_: &Value| Err("boom".to_owned())));
        let task = s.add_task("t", "echo", json!({}), 60, true).unwrap();
        s.trigger_task(&task.id);
        s.run_due_tasks();

        let after = s.get_task(&task.id).unwrap();
        assert_eq!(after.last_error.as_deref(), Some("boom"));
        assert!(after.last_result.is_none());
        assert_eq!(after.run_count, 1);

        let history = s.history(&task.id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].ok);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn history_ring_is_bounded_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let counter = Arc::new(AtomicU32::new(0));
        s.set_executor(counting_executor(counter));
        let task = s.add_task("t", "echo", json!({}), 60, true).unwrap();
        for _ in 0..60 {
            s.trigger_task(&task.id);
            s.run_due_tasks();
        }
        let history = s.history(&task.id, 500).unwrap();
        assert_eq!(history.len(), HISTORY_MAX);
        assert_eq!(history[0].run, 60);
        assert!(s.history("missing", 10).is_none());
    }

    #[test]
    fn update_and_toggle() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let task = s.add_task("old", "echo", json!({}), 60, true).unwrap();
        let updated = s
            .update_task(&task.id, TaskPatch {
                name: Some("new".to_owned()),
                interval_seconds: Some(120),
                ..TaskPatch::default()
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "new");
        assert_eq!(updated.interval_seconds, 120);
        assert!(s
            .update_task(&task.id, TaskPatch { interval_seconds: Some(0), ..TaskPatch::default() })
            .is_err());
        // A rejected patch must not partially apply, even when it also
        // carries valid fields.
        assert!(s
            .update_task(&task.id, TaskPatch {
                name: Some("half-applied".to_owned()),
                interval_seconds: Some(0),
                ..TaskPatch::default()
            })
            .is_err());
        let unchanged = s.get_task(&task.id).unwrap();
        assert_eq!(unchanged.name, "new");
        assert_eq!(unchanged.interval_seconds, 120);
        assert!(s.set_enabled(&task.id, false));
        assert!(!s.get_task(&task.id).unwrap().enabled);
        assert!(s.update_task("missing", TaskPatch::default()).unwrap().is_none());
    }

    #[test]
    fn task_view_formats_next_run_as_iso() {
        let dir = TempDir::new().unwrap();
        let s = scheduler(&dir);
        let task = s.add_task("t", "echo", json!({}), 60, true).unwrap();
        let view = task_view(&task);
        let rendered = view["next_run_at"].as_str().unwrap();
        assert!(rendered.contains('T'), "expected ISO-8601, got {rendered}");
    }
}
