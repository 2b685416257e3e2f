//! # Repeater
//!
//! Runs named tasks on independent fixed intervals. Each entry owns a
//! cancellation token and a ticker loop; the first run starts immediately.
//!
//! Every run is spawned as its own task inside a fresh [`TraceContext`], so a
//! slow run may overlap with the next tick and a panic or error in one run
//! never stops the schedule. Stopping an entry cancels its future ticks only;
//! a run already in flight finishes on its own.
//!
//! Intervals cannot change on a live entry. [`Repeater::update`] stops the old
//! entry and starts a new one under the same name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, histogram};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CollectorError;
use crate::telemetry::{TraceContext, with_trace_context};

pub type TaskFuture<T> = Pin<Box<dyn Future<Output = Result<T, CollectorError>> + Send>>;
pub type TaskFn<T> = Arc<dyn Fn() -> TaskFuture<T> + Send + Sync>;
pub type ProgressFn<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;
pub type FailureFn = Arc<dyn Fn(&str, &CollectorError) + Send + Sync>;
pub type SuccessFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Wrap an async closure as a repeatable task.
pub fn task_fn<T, F, Fut>(f: F) -> TaskFn<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, CollectorError>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// Definition of one repeating task.
pub struct RepeatSpec<T> {
    pub name: String,
    pub interval: Duration,
    pub task: TaskFn<T>,
    pub on_progress: Option<ProgressFn<T>>,
    pub on_failure: Option<FailureFn>,
    pub on_success: Option<SuccessFn>,
    /// Stop after this many runs and call `on_success`. `None` repeats forever.
    pub repeats: Option<u64>,
}

impl<T> RepeatSpec<T> {
    pub fn new<S: Into<String>>(name: S, interval: Duration, task: TaskFn<T>) -> Self {
        Self {
            name: name.into(),
            interval,
            task,
            on_progress: None,
            on_failure: None,
            on_success: None,
            repeats: None,
        }
    }

    pub fn on_progress(mut self, callback: ProgressFn<T>) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: FailureFn) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn on_success(mut self, callback: SuccessFn) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn repeats(mut self, count: u64) -> Self {
        self.repeats = Some(count);
        self
    }
}

#[derive(Debug)]
struct RepeatEntry {
    id: u64,
    interval: Duration,
    cancel: CancellationToken,
}

type Tracker = Arc<Mutex<HashMap<String, RepeatEntry>>>;

/// Tracker of named repeating tasks producing `T` per run.
pub struct Repeater<T> {
    entries: Tracker,
    next_id: AtomicU64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Default for Repeater<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> Repeater<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start repeating `spec.task`. An entry already registered under the
    /// same name is stopped first.
    pub fn start(&self, spec: RepeatSpec<T>) -> Result<(), CollectorError> {
        if spec.name.trim().is_empty() {
            return Err(CollectorError::args("repeat name must not be empty"));
        }
        if spec.interval.is_zero() {
            return Err(CollectorError::args(format!(
                "repeat interval for {} must be positive",
                spec.name
            )));
        }
        if spec.repeats == Some(0) {
            return Err(CollectorError::args(format!(
                "repeat count for {} must be positive",
                spec.name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut entries = self.lock();
            if let Some(previous) = entries.remove(&spec.name) {
                previous.cancel.cancel();
                debug!(repeat = %spec.name, "Replaced existing repeat entry");
            }
            entries.insert(
                spec.name.clone(),
                RepeatEntry {
                    id,
                    interval: spec.interval,
                    cancel: cancel.clone(),
                },
            );
        }

        info!(
            repeat = %spec.name,
            interval_ms = spec.interval.as_millis() as u64,
            repeats = ?spec.repeats,
            "Started repeat"
        );
        tokio::spawn(run_loop(spec, id, cancel, self.entries.clone()));
        Ok(())
    }

    /// Replace the entry registered under `spec.name`. Returns whether one existed.
    pub fn update(&self, spec: RepeatSpec<T>) -> Result<bool, CollectorError> {
        let existed = self.stop(&spec.name);
        self.start(spec)?;
        Ok(existed)
    }

    /// Cancel future runs of `name`. Unknown names are a no-op.
    pub fn stop(&self, name: &str) -> bool {
        match self.lock().remove(name) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(repeat = %name, "Stopped repeat");
                true
            }
            None => false,
        }
    }

    /// Stop every tracked entry.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, RepeatEntry)> = self.lock().drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(stopped = drained.len(), "Stopped all repeats");
        }
        drained.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn interval(&self, name: &str) -> Option<Duration> {
        self.lock().get(name).map(|entry| entry.interval)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RepeatEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn run_loop<T: Send + 'static>(
    spec: RepeatSpec<T>,
    id: u64,
    cancel: CancellationToken,
    entries: Tracker,
) {
    let mut ticker = interval(spec.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut launched: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        launched += 1;
        let run = tokio::spawn(execute(
            spec.name.clone(),
            spec.task.clone(),
            spec.on_progress.clone(),
            spec.on_failure.clone(),
        ));

        if let Some(limit) = spec.repeats {
            // Finite repeats run one after another so `on_success` fires after the last.
            let _ = run.await;
            if launched >= limit {
                if let Some(on_success) = &spec.on_success {
                    on_success(&spec.name);
                }
                remove_if_current(&entries, &spec.name, id);
                debug!(repeat = %spec.name, runs = launched, "Repeat finished");
                break;
            }
        }
    }
}

async fn execute<T: Send + 'static>(
    name: String,
    task: TaskFn<T>,
    on_progress: Option<ProgressFn<T>>,
    on_failure: Option<FailureFn>,
) {
    let context = TraceContext::generate("run");
    let trace_id = context.trace_id.clone();

    with_trace_context(context.clone(), async move {
        let started = Instant::now();
        let labels = vec![("repeat", name.clone())];
        counter!("collector_repeat_runs_total", &labels).increment(1);

        let outcome = match tokio::spawn(with_trace_context(context, task())).await {
            Ok(result) => result,
            Err(join_error) => Err(CollectorError::from(join_error)),
        };
        histogram!("collector_repeat_run_duration_ms", &labels)
            .record(started.elapsed().as_secs_f64() * 1_000.0);

        match outcome {
            Ok(result) => {
                if let Some(on_progress) = &on_progress {
                    on_progress(&name, &result);
                }
            }
            Err(err) => {
                counter!("collector_repeat_failures_total", &labels).increment(1);
                match &on_failure {
                    Some(on_failure) => on_failure(&name, &err),
                    None => error!(
                        repeat = %name,
                        trace_id = %trace_id,
                        error = %err,
                        "Repeat run failed"
                    ),
                }
            }
        }
    })
    .await;
}

fn remove_if_current(entries: &Tracker, name: &str, id: u64) {
    let mut entries = entries.lock().unwrap_or_else(|e| e.into_inner());
    if entries.get(name).is_some_and(|entry| entry.id == id) {
        entries.remove(name);
    } else {
        warn!(repeat = %name, "Finished repeat was already replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_task(counter: Arc<AtomicUsize>) -> TaskFn<usize> {
        task_fn(move || {
            let counter = counter.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_is_immediate() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater::new();
        repeater
            .start(RepeatSpec::new(
                "gen",
                Duration::from_secs(60),
                counting_task(runs.clone()),
            ))
            .unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(repeater.is_running("gen"));
        assert_eq!(repeater.interval("gen"), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_every_interval_and_reports_progress() {
        let runs = Arc::new(AtomicUsize::new(0));
        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();

        let repeater = Repeater::new();
        repeater
            .start(
                RepeatSpec::new("gen", Duration::from_millis(100), counting_task(runs.clone()))
                    .on_progress(Arc::new(move |name: &str, result: &usize| {
                        seen.lock().unwrap().push((name.to_string(), *result));
                    })),
            )
            .unwrap();

        sleep(Duration::from_millis(250)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            progress.lock().unwrap().clone(),
            vec![
                ("gen".to_string(), 1),
                ("gen".to_string(), 2),
                ("gen".to_string(), 3)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_schedule() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counted = failures.clone();
        let task: TaskFn<()> = task_fn(|| async { Err(CollectorError::Network("down".into())) });

        let repeater = Repeater::new();
        repeater
            .start(
                RepeatSpec::new("gen", Duration::from_millis(100), task).on_failure(Arc::new(
                    move |_: &str, err: &CollectorError| {
                        assert_eq!(err.name(), "NetworkError");
                        counted.fetch_add(1, Ordering::SeqCst);
                    },
                )),
            )
            .unwrap();

        sleep(Duration::from_millis(250)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert!(repeater.is_running("gen"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_reports_failure() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let recorded = failures.clone();
        let task: TaskFn<()> = task_fn(|| async {
            if true {
                panic!("task blew up");
            }
            Ok(())
        });

        let repeater = Repeater::new();
        repeater
            .start(
                RepeatSpec::new("gen", Duration::from_secs(60), task).on_failure(Arc::new(
                    move |_: &str, err: &CollectorError| {
                        recorded.lock().unwrap().push(err.name());
                    },
                )),
            )
            .unwrap();

        sleep(Duration::from_millis(10)).await;
        assert_eq!(failures.lock().unwrap().clone(), vec!["TaskError"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_halts_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater::new();
        repeater
            .start(RepeatSpec::new(
                "gen",
                Duration::from_millis(100),
                counting_task(runs.clone()),
            ))
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(repeater.stop("gen"));
        assert!(!repeater.stop("gen"));
        assert!(!repeater.is_running("gen"));

        sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_same_name_replaces_entry() {
        let old_runs = Arc::new(AtomicUsize::new(0));
        let new_runs = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater::new();

        repeater
            .start(RepeatSpec::new(
                "gen",
                Duration::from_millis(100),
                counting_task(old_runs.clone()),
            ))
            .unwrap();
        sleep(Duration::from_millis(10)).await;

        let existed = repeater
            .update(RepeatSpec::new(
                "gen",
                Duration::from_millis(1_000),
                counting_task(new_runs.clone()),
            ))
            .unwrap();
        assert!(existed);

        sleep(Duration::from_millis(500)).await;
        assert_eq!(old_runs.load(Ordering::SeqCst), 1);
        assert_eq!(new_runs.load(Ordering::SeqCst), 1);
        assert_eq!(repeater.names(), vec!["gen".to_string()]);
        assert_eq!(repeater.interval("gen"), Some(Duration::from_millis(1_000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finite_repeats_call_on_success_and_remove_entry() {
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        let repeater = Repeater::new();
        repeater
            .start(
                RepeatSpec::new("once", Duration::from_millis(50), counting_task(runs.clone()))
                    .repeats(3)
                    .on_success(Arc::new(move |_: &str| {
                        done.fetch_add(1, Ordering::SeqCst);
                    })),
            )
            .unwrap();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!repeater.is_running("once"));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let repeater: Repeater<usize> = Repeater::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let err = repeater
            .start(RepeatSpec::new("", Duration::from_secs(1), counting_task(runs.clone())))
            .unwrap_err();
        assert_eq!(err.name(), "ArgsError");

        let err = repeater
            .start(RepeatSpec::new("gen", Duration::ZERO, counting_task(runs)))
            .unwrap_err();
        assert_eq!(err.name(), "ArgsError");
        assert!(repeater.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_clears_every_entry() {
        let runs = Arc::new(AtomicUsize::new(0));
        let repeater = Repeater::new();
        for name in ["a::1", "a::2", "b"] {
            repeater
                .start(RepeatSpec::new(
                    name,
                    Duration::from_secs(1),
                    counting_task(runs.clone()),
                ))
                .unwrap();
        }

        assert!(repeater.stop("a::1"));
        assert_eq!(repeater.names(), vec!["a::2".to_string(), "b".to_string()]);

        assert_eq!(repeater.stop_all(), 2);
        assert!(repeater.is_empty());
        assert_eq!(repeater.stop_all(), 0);
    }
}
