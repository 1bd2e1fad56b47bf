// src/system/background.rs

//! Fire-and-forget processes addressed by opaque handles.
//!
//! A record is registered before its process starts, so a handle returned by `launch` is
//! valid immediately. Liveness is always read from the OS, never from a cached flag. Old
//! records are force-killed by a periodic sweeper that holds only a weak reference.

use crate::{
    constants::{BACKGROUND_HANDLE_PREFIX, BACKGROUND_KILL_GRACE, POLL_INTERVAL},
    models::{OutputSnapshot, ProcessSpec},
    system::{
        events::{EventSink, ExecEvent},
        executor::{self, ProcessRunner},
        output::{self, CaptureHandles, OutputStream, ReaderOptions, SharedBuffers},
        signals::{self, KillScope},
    },
};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Child;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// What a record knows about its process.
#[derive(Debug)]
enum ProcessSlot {
    /// Registered, the spawn task has not finished yet.
    Starting,
    Running { child: Child, pid: Option<u32> },
    /// The process could not be started; the reason is in the record's stderr.
    Failed,
}

#[derive(Debug)]
struct BackgroundRecord {
    handle: String,
    name: String,
    started_at: SystemTime,
    started: Instant,
    slot: Mutex<ProcessSlot>,
    /// Set when the record is killed before its process exists.
    cancelled: AtomicBool,
    buffers: SharedBuffers,
    capture: Mutex<Option<CaptureHandles>>,
}

impl BackgroundRecord {
    fn new(handle: String, name: String) -> Self {
        Self {
            handle,
            name,
            started_at: SystemTime::now(),
            started: Instant::now(),
            slot: Mutex::new(ProcessSlot::Starting),
            cancelled: AtomicBool::new(false),
            buffers: SharedBuffers::new(),
            capture: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, ProcessSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        match &mut *self.slot() {
            ProcessSlot::Starting => true,
            ProcessSlot::Running { child, .. } => signals::is_alive(child),
            ProcessSlot::Failed => false,
        }
    }

    fn pid(&self) -> Option<u32> {
        match &*self.slot() {
            ProcessSlot::Running { pid, .. } => *pid,
            _ => None,
        }
    }

    fn abort_readers(&self) {
        if let Some(capture) = self
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            capture.abort();
        }
    }
}

/// A point-in-time view of one background process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundInfo {
    pub handle: String,
    pub name: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub started_at: SystemTime,
    pub age: Duration,
}

/// Registry of every background process started by this program.
#[derive(Debug)]
pub struct BackgroundRegistry {
    jobs: DashMap<String, Arc<BackgroundRecord>>,
    runner: ProcessRunner,
    events: EventSink,
    kill_grace: Duration,
}

impl BackgroundRegistry {
    /// An empty registry that starts processes with `runner`.
    pub fn new(runner: ProcessRunner, events: EventSink) -> Self {
        Self {
            jobs: DashMap::new(),
            runner,
            events,
            kill_grace: BACKGROUND_KILL_GRACE,
        }
    }

    /// How long a non-forced kill waits for the process to honor its interrupt.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// True if `handle` is registered, running or not.
    pub fn contains(&self, handle: &str) -> bool {
        self.jobs.contains_key(handle)
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True when no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Registers a record and starts `spec` on a spawned task. Returns the handle at once.
    ///
    /// Start failures are never returned: they are logged, emitted as an event and written
    /// to the record's stderr, and the record reports not running. Must be called from
    /// within a tokio runtime.
    pub fn launch(&self, spec: ProcessSpec, name: Option<&str>) -> String {
        let handle = format!("{}{}", BACKGROUND_HANDLE_PREFIX, Uuid::new_v4().simple());
        let name = name.map_or_else(|| spec.display_line(), str::to_string);
        let record = Arc::new(BackgroundRecord::new(handle.clone(), name));
        self.jobs.insert(handle.clone(), record.clone());

        let runner = self.runner.clone();
        let events = self.events.clone();
        tokio::spawn(start_record(runner, spec, record, events));
        handle
    }

    /// True while the process behind `handle` is starting or alive. Unknown handles are not.
    pub fn is_running(&self, handle: &str) -> bool {
        let Some(record) = self.record(handle) else {
            return false;
        };
        let running = record.is_running();
        self.events.emit(ExecEvent::LivenessChecked {
            handle: handle.to_string(),
            running,
        });
        running
    }

    /// Reads the captured output, truncating it under the same lock when `clear` is set.
    ///
    /// Unknown handles get a placeholder message instead of an error.
    pub fn get_output(&self, handle: &str, clear: bool) -> OutputSnapshot {
        match self.record(handle) {
            Some(record) => record.buffers.read(clear),
            None => {
                let message = format!("No background process with handle '{}'.\n", handle);
                OutputSnapshot {
                    stdout: String::new(),
                    stderr: message.clone(),
                    merged: message,
                }
            }
        }
    }

    /// Stops the process behind `handle` and forgets it.
    ///
    /// Without `force` the process gets an interrupt and the configured grace window before
    /// being force-killed. Returns false for unknown handles or when the OS refused the kill.
    pub async fn kill(&self, handle: &str, force: bool) -> bool {
        let Some(record) = self.record(handle) else {
            return false;
        };
        if !self.terminate(&record, force).await {
            return false;
        }
        self.forget(&record);
        self.events.emit(ExecEvent::Killed {
            handle: handle.to_string(),
            forced: force,
        });
        true
    }

    /// Info on every registered process, oldest first.
    pub fn list_all(&self) -> Vec<BackgroundInfo> {
        let records: Vec<Arc<BackgroundRecord>> =
            self.jobs.iter().map(|entry| entry.value().clone()).collect();
        let mut infos: Vec<BackgroundInfo> = records
            .iter()
            .map(|record| BackgroundInfo {
                handle: record.handle.clone(),
                name: record.name.clone(),
                pid: record.pid(),
                running: record.is_running(),
                started_at: record.started_at,
                age: record.started.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }

    /// Force-kills and forgets every process. Used on normal exit and on Ctrl+C.
    pub async fn shutdown_all(&self) {
        let handles: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        if !handles.is_empty() {
            log::debug!("Shutting down {} background process(es).", handles.len());
        }
        for handle in handles {
            self.kill(&handle, true).await;
        }
    }

    /// Force-kills and forgets every record older than `max_age`, active or not.
    /// Returns how many records were evicted.
    pub async fn evict_older_than(&self, max_age: Duration) -> usize {
        let expired: Vec<Arc<BackgroundRecord>> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().started.elapsed() > max_age)
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = 0;
        for record in expired {
            if self.terminate(&record, true).await {
                self.forget(&record);
                self.events.emit(ExecEvent::Evicted {
                    handle: record.handle.clone(),
                    age: record.started.elapsed(),
                });
                evicted += 1;
            }
        }
        evicted
    }

    /// Runs `evict_older_than(max_age)` every `interval` until the registry is dropped.
    ///
    /// Intervals shorter than [`POLL_INTERVAL`] are raised to it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(POLL_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    log::debug!("Background registry dropped, stopping sweeper.");
                    break;
                };
                let evicted = registry.evict_older_than(max_age).await;
                if evicted > 0 {
                    log::info!("Evicted {} background process(es) older than {:?}.", evicted, max_age);
                }
            }
        })
    }

    // --- Internals ---

    fn record(&self, handle: &str) -> Option<Arc<BackgroundRecord>> {
        self.jobs.get(handle).map(|entry| entry.value().clone())
    }

    fn forget(&self, record: &BackgroundRecord) {
        self.jobs.remove(&record.handle);
        record.abort_readers();
    }

    /// Brings the record's process down. Returns false only when the OS refused the kill.
    async fn terminate(&self, record: &BackgroundRecord, force: bool) -> bool {
        // 1. A process that does not exist yet is killed by its spawn task. The flag is set
        //    under the slot lock, which the spawn task also holds while publishing the child.
        {
            let slot = record.slot();
            if matches!(*slot, ProcessSlot::Starting) {
                record.cancelled.store(true, Ordering::SeqCst);
                return true;
            }
        }

        // 2. Polite path: interrupt and give the process a grace window.
        if !force && record.is_running() {
            let interrupted = match &*record.slot() {
                ProcessSlot::Running { child, .. } => signals::interrupt(child),
                _ => Ok(()),
            };
            match interrupted {
                Ok(()) => {
                    let deadline = Instant::now() + self.kill_grace;
                    while record.is_running() && Instant::now() < deadline {
                        tokio::time::sleep(POLL_INTERVAL).await;
                    }
                }
                Err(e) => log::debug!("Interrupting '{}' failed: {}", record.handle, e),
            }
        }

        // 3. Forced, or the interrupt was not honored.
        let mut slot = record.slot();
        if let ProcessSlot::Running { child, .. } = &mut *slot {
            if force || signals::is_alive(child) {
                if let Err(e) = signals::force_kill(child, KillScope::Group) {
                    log::warn!("Failed to kill background process '{}': {}", record.handle, e);
                    return false;
                }
            }
        }
        true
    }
}

/// Spawn task of one record: starts the process and publishes it into the record's slot.
async fn start_record(
    runner: ProcessRunner,
    spec: ProcessSpec,
    record: Arc<BackgroundRecord>,
    events: EventSink,
) {
    let mut child = match runner.spawn(&spec) {
        Ok(child) => child,
        Err(e) => {
            let message = format!("Failed to start '{}': {}", spec.display_line(), e);
            record
                .buffers
                .lock()
                .push_line(OutputStream::Stderr, &message, true);
            *record.slot() = ProcessSlot::Failed;
            events.emit(ExecEvent::LaunchFailed {
                handle: record.handle.clone(),
                error: e.to_string(),
            });
            return;
        }
    };

    let pid = child.id();
    let options = ReaderOptions {
        encoding: spec.encoding,
        ..ReaderOptions::default()
    };
    let capture = output::capture_child(&mut child, &record.buffers, &options);
    if let (Some(payload), Some(stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(executor::write_stdin(stdin, payload));
    }

    *record
        .capture
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(capture);

    let orphan = {
        let mut slot = record.slot();
        if record.cancelled.load(Ordering::SeqCst) {
            Some(child)
        } else {
            *slot = ProcessSlot::Running { child, pid };
            None
        }
    };

    // Killed while starting: the record is already gone, so take the process down here.
    if let Some(mut child) = orphan {
        log::debug!("'{}' was killed before it started, terminating.", record.handle);
        let _ = signals::force_kill(&mut child, KillScope::Group);
        record.abort_readers();
        let _ = child.wait().await;
        return;
    }

    events.emit(ExecEvent::Launched {
        handle: record.handle.clone(),
        name: record.name.clone(),
        pid,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::resolver::ShellResolver;

    fn registry() -> BackgroundRegistry {
        BackgroundRegistry::new(
            ProcessRunner::new(Arc::new(ShellResolver::default())),
            EventSink::none(),
        )
    }

    async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_unknown_handle_contract() {
        let registry = registry();
        assert!(!registry.is_running("no-such-handle"));
        assert!(
            registry
                .get_output("no-such-handle", false)
                .stderr
                .contains("no-such-handle")
        );
        assert!(!registry.kill("no-such-handle", true).await);
        assert!(registry.list_all().is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_is_recorded_not_returned() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = BackgroundRegistry::new(
            ProcessRunner::new(Arc::new(ShellResolver::default())),
            EventSink::new(tx),
        );

        let handle = registry.launch(ProcessSpec::new("definitely-not-a-real-binary-4242"), None);
        assert!(handle.starts_with(BACKGROUND_HANDLE_PREFIX));

        assert!(wait_until(Duration::from_secs(2), || !registry.is_running(&handle)).await);
        let output = registry.get_output(&handle, false);
        assert!(output.stderr.contains("definitely-not-a-real-binary-4242"));

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            failed |= matches!(event, ExecEvent::LaunchFailed { .. });
        }
        assert!(failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_short_job_lifecycle() {
        // --- Setup ---
        let registry = registry();
        let spec = ProcessSpec::new("sh").args(["-c", "sleep 0.2; echo done"]);

        // --- Execute ---
        let handle = registry.launch(spec, Some("short job"));

        // --- Assert ---
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.is_running(&handle));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!registry.is_running(&handle));
        assert!(
            wait_until(Duration::from_secs(2), || registry
                .get_output(&handle, false)
                .stdout
                .contains("done"))
            .await
        );

        let listed = registry.list_all();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed.first().map(|i| i.name.as_str()), Some("short job"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_get_output_with_clear_truncates() {
        let registry = registry();
        let handle = registry.launch(ProcessSpec::new("echo").arg("once"), None);
        assert!(
            wait_until(Duration::from_secs(2), || registry
                .get_output(&handle, false)
                .stdout
                == "once\n")
            .await
        );
        assert_eq!(registry.get_output(&handle, true).stdout, "once\n");
        assert_eq!(registry.get_output(&handle, false), OutputSnapshot::default());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_kill_removes_handle() {
        let registry = registry();
        let handle = registry.launch(ProcessSpec::new("sleep").arg("30"), None);
        assert!(wait_until(Duration::from_secs(2), || registry.list_all().first().and_then(|i| i.pid).is_some()).await);

        let started = Instant::now();
        assert!(registry.kill(&handle, false).await);
        // `sleep` honors SIGINT, so the grace window is not used up.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!registry.is_running(&handle));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_kill_escalates_when_interrupt_is_ignored() {
        let registry = registry().with_kill_grace(Duration::from_millis(300));
        let spec = ProcessSpec::new("sh").args(["-c", "trap '' INT; sleep 30"]);
        let handle = registry.launch(spec, None);
        assert!(wait_until(Duration::from_secs(2), || registry.list_all().first().and_then(|i| i.pid).is_some()).await);
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(registry.kill(&handle, false).await);
        assert!(registry.list_all().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_while_starting_cancels_spawn() {
        let registry = registry();
        let handle = registry.launch(ProcessSpec::new("sleep").arg("30"), None);
        // No await between launch and kill: the spawn task has not run yet.
        assert!(registry.kill(&handle, true).await);
        assert!(!registry.is_running(&handle));
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_eviction_kills_old_records() {
        let registry = registry();
        let old = registry.launch(ProcessSpec::new("sleep").arg("30"), Some("old"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let fresh = registry.launch(ProcessSpec::new("sleep").arg("30"), Some("fresh"));

        let evicted = registry.evict_older_than(Duration::from_millis(200)).await;

        assert_eq!(evicted, 1);
        let remaining: Vec<String> = registry.list_all().into_iter().map(|i| i.handle).collect();
        assert_eq!(remaining, vec![fresh.clone()]);
        assert!(!registry.is_running(&old));
        registry.shutdown_all().await;
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sweeper_evicts_and_stops_with_registry() {
        let registry = Arc::new(registry());
        registry.launch(ProcessSpec::new("sleep").arg("30"), None);
        let sweeper = registry.spawn_sweeper(Duration::from_millis(100), Duration::from_millis(50));

        let swept = registry.clone();
        assert!(wait_until(Duration::from_secs(3), move || swept.is_empty()).await);

        drop(registry);
        let stopped = tokio::time::timeout(Duration::from_secs(2), sweeper).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sweeper_survives_zero_interval() {
        let registry = Arc::new(registry());
        registry.launch(ProcessSpec::new("sleep").arg("30"), None);
        let sweeper = registry.spawn_sweeper(Duration::ZERO, Duration::from_millis(50));

        let swept = registry.clone();
        assert!(wait_until(Duration::from_secs(2), move || swept.is_empty()).await);
        assert!(!sweeper.is_finished());

        drop(registry);
        let stopped = tokio::time::timeout(Duration::from_secs(2), sweeper).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }
}
