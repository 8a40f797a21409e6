//! Key → task map.
//!
//! Every operation on a key runs under that key's [`KeyedMutex`] slot, so a
//! key sees a single FIFO order of `start`/`attach`/`detach`/eviction while
//! distinct keys proceed in parallel. The inner map lock is only taken for
//! short, non-suspending critical sections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::buffer::{ReplayBuffer, ReplayReader};
use crate::keyed_mutex::KeyedMutex;
use crate::task::{IdleTimer, Task, TaskId, TaskSnapshot};
use crate::{SpawnError, StreamError, TaskKey, TranscodeError, TranscoderConfig};

/// Registry of live transcode tasks. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    config: TranscoderConfig,
    locks: KeyedMutex<TaskKey>,
    tasks: Mutex<HashMap<TaskKey, Task>>,
    starts: StartLedger,
    /// Evicted tasks whose process is still being terminated.
    evictions: InFlight,
    shutting_down: AtomicBool,
}

/// A reader attached to one task instance.
pub struct TaskReader {
    key: TaskKey,
    task_id: TaskId,
    reader: ReplayReader,
}

impl TaskReader {
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub async fn read(&mut self) -> Result<Option<Bytes>, StreamError> {
        self.reader.read().await
    }
}

impl TaskRegistry {
    pub fn new(config: TranscoderConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                locks: KeyedMutex::new(),
                tasks: Mutex::new(HashMap::new()),
                starts: StartLedger::new(),
                evictions: InFlight::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Make sure a live task exists for `key`.
    ///
    /// Idempotent while the task lives. Callers queued behind a failed launch
    /// get that launch's error rather than launching again. Returns once the
    /// process has survived its startup window; it does not wait for the
    /// transcode to finish.
    pub async fn start(&self, key: &TaskKey) -> Result<(), TranscodeError> {
        self.ensure_running()?;
        let ticket = self.inner.starts.enter(key);
        let _guard = self.inner.locks.lock(key).await;
        self.ensure_running()?;

        if self.inner.tasks.lock().await.contains_key(key) {
            return Ok(());
        }
        if let Some(err) = ticket.shared_failure() {
            debug!(%key, error = %err, "reusing failure of concurrent launch");
            return Err(err.into());
        }

        let mut task = match Task::launch(key.clone(), &self.inner.config).await {
            Ok(task) => task,
            Err(err) => {
                ticket.record(Err(&err));
                return Err(err.into());
            }
        };
        ticket.record(Ok(()));

        let task_id = task.id();
        let buffer = task.buffer().clone();
        self.arm_idle_timer(key, &mut task);

        let rejected = {
            let mut tasks = self.inner.tasks.lock().await;
            if self.is_shutting_down() {
                Some(task)
            } else {
                tasks.insert(key.clone(), task);
                None
            }
        };
        if let Some(task) = rejected {
            task.destroy("shutdown").await;
            return Err(TranscodeError::ShuttingDown);
        }

        tokio::spawn(watch_output(
            Arc::downgrade(&self.inner),
            key.clone(),
            task_id,
            buffer,
        ));
        Ok(())
    }

    /// Attach a new reader to the live task for `key`, cancelling any
    /// pending idle eviction. The reader starts at the first byte.
    pub async fn attach(&self, key: &TaskKey) -> Result<TaskReader, TranscodeError> {
        self.ensure_running()?;
        let _guard = self.inner.locks.lock(key).await;
        self.ensure_running()?;

        let mut tasks = self.inner.tasks.lock().await;
        let task = tasks
            .get_mut(key)
            .ok_or_else(|| TranscodeError::NotFound(key.clone()))?;
        let reader = task.attach();
        debug!(%key, task_id = %task.id(), readers = task.ref_count(), "reader attached");

        Ok(TaskReader {
            key: key.clone(),
            task_id: task.id(),
            reader,
        })
    }

    /// Release a reader of task `task_id`. When the last reader leaves, the
    /// idle timer is armed.
    ///
    /// Detaching from a task that has since been destroyed (or replaced by a
    /// new instance under the same key) does nothing.
    pub async fn detach(&self, key: &TaskKey, task_id: TaskId) -> Result<(), TranscodeError> {
        self.ensure_running()?;
        let _guard = self.inner.locks.lock(key).await;
        self.ensure_running()?;

        let mut tasks = self.inner.tasks.lock().await;
        let Some(task) = tasks.get_mut(key) else {
            debug!(%key, %task_id, "detach from a task that is gone");
            return Ok(());
        };
        if task.id() != task_id {
            debug!(%key, %task_id, current = %task.id(), "detach from a replaced task");
            return Ok(());
        }

        if task.detach() {
            self.arm_idle_timer(key, task);
        }
        debug!(%key, %task_id, readers = task.ref_count(), "reader detached");
        Ok(())
    }

    /// Flag the registry as shutting down and destroy every task.
    ///
    /// After the flag is set no operation spawns a process or arms a timer.
    /// Returns once all processes have been terminated, including those of
    /// launches that were in flight and of evictions that were still
    /// terminating when shutdown began.
    pub async fn shutdown(&self) {
        let keys: Vec<TaskKey> = {
            let tasks = self.inner.tasks.lock().await;
            if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
                debug!("shutdown already in progress");
            }
            tasks.keys().cloned().collect()
        };
        info!(tasks = keys.len(), "shutting down transcode tasks");

        futures::future::join_all(keys.iter().map(|key| async move {
            let task = {
                let _guard = self.inner.locks.lock(key).await;
                self.inner.tasks.lock().await.remove(key)
            };
            if let Some(task) = task {
                task.destroy("shutdown").await;
            }
        }))
        .await;

        self.inner.starts.wait_idle().await;
        self.inner.evictions.wait_idle().await;
        info!("all transcode tasks stopped");
    }

    /// Snapshot of every registered task.
    pub async fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.inner
            .tasks
            .lock()
            .await
            .values()
            .map(Task::snapshot)
            .collect()
    }

    pub async fn task(&self, key: &TaskKey) -> Option<TaskSnapshot> {
        self.inner.tasks.lock().await.get(key).map(Task::snapshot)
    }

    pub async fn len(&self) -> usize {
        self.inner.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn ensure_running(&self) -> Result<(), TranscodeError> {
        if self.is_shutting_down() {
            Err(TranscodeError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Must be called with `key` held.
    fn arm_idle_timer(&self, key: &TaskKey, task: &mut Task) {
        let epoch = task.next_idle_epoch();
        let idle = self.inner.config.idle_timeout;
        let registry = Arc::downgrade(&self.inner);
        let timer_key = key.clone();
        let task_id = task.id();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(inner) = registry.upgrade() {
                TaskRegistry { inner }
                    .expire(&timer_key, task_id, epoch)
                    .await;
            }
        });
        task.arm_idle_timer(IdleTimer::new(epoch, handle));
        debug!(%key, %task_id, idle_ms = idle.as_millis() as u64, "idle timer armed");
    }

    async fn expire(&self, key: &TaskKey, task_id: TaskId, epoch: u64) {
        let expired = {
            let _guard = self.inner.locks.lock(key).await;
            let mut tasks = self.inner.tasks.lock().await;
            match tasks.get_mut(key) {
                Some(task) if task.id() == task_id && task.idle_timer_fired(epoch) => {
                    task.take_fired_timer();
                    let pending = self.inner.evictions.enter();
                    tasks.remove(key).map(|task| (task, pending))
                }
                _ => None,
            }
        };
        if let Some((task, _pending)) = expired {
            info!(%key, %task_id, "evicting idle transcode task");
            task.destroy("idle").await;
        }
    }

    async fn evict_failed(&self, key: &TaskKey, task_id: TaskId, err: StreamError) {
        let failed = {
            let _guard = self.inner.locks.lock(key).await;
            let mut tasks = self.inner.tasks.lock().await;
            match tasks.get(key) {
                Some(task) if task.id() == task_id => {
                    let pending = self.inner.evictions.enter();
                    tasks.remove(key).map(|task| (task, pending))
                }
                _ => None,
            }
        };
        if let Some((task, _pending)) = failed {
            warn!(%key, %task_id, error = %err, "evicting failed transcode task");
            task.destroy("stream failed").await;
        }
    }
}

/// Evict the task once its output closes with a real error. Readers already
/// attached keep their cursors and see the error after the buffered bytes.
async fn watch_output(registry: Weak<Inner>, key: TaskKey, task_id: TaskId, buffer: ReplayBuffer) {
    let err = match buffer.finished().await {
        Ok(()) | Err(StreamError::Aborted) => return,
        Err(err) => err,
    };
    if let Some(inner) = registry.upgrade() {
        TaskRegistry { inner }.evict_failed(&key, task_id, err).await;
    }
}

/// Bookkeeping that lets `start` calls queued on a key share the outcome of
/// the launch they waited behind.
struct StartLedger {
    entries: std::sync::Mutex<HashMap<TaskKey, LedgerEntry>>,
    active: InFlight,
}

#[derive(Default)]
struct LedgerEntry {
    waiters: usize,
    attempts: u64,
    failure: Option<(u64, SpawnError)>,
}

struct StartTicket<'a> {
    ledger: &'a StartLedger,
    key: TaskKey,
    seen: u64,
    _active: InFlightGuard<'a>,
}

impl StartLedger {
    fn new() -> Self {
        Self {
            entries: std::sync::Mutex::new(HashMap::new()),
            active: InFlight::new(),
        }
    }

    fn enter(&self, key: &TaskKey) -> StartTicket<'_> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.entry(key.clone()).or_default();
        entry.waiters += 1;
        StartTicket {
            ledger: self,
            key: key.clone(),
            seen: entry.attempts,
            _active: self.active.enter(),
        }
    }

    /// Wait until no `start` call is in progress.
    async fn wait_idle(&self) {
        self.active.wait_idle().await;
    }
}

impl StartTicket<'_> {
    /// Failure of a launch that completed after this ticket was issued.
    fn shared_failure(&self) -> Option<SpawnError> {
        let entries = self
            .ledger
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match entries.get(&self.key).and_then(|e| e.failure.as_ref()) {
            Some((attempt, err)) if *attempt > self.seen => Some(err.clone()),
            _ => None,
        }
    }

    fn record(&self, outcome: Result<(), &SpawnError>) {
        let mut entries = self
            .ledger
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.attempts += 1;
            entry.failure = outcome.err().map(|err| (entry.attempts, err.clone()));
        }
    }
}

impl Drop for StartTicket<'_> {
    fn drop(&mut self) {
        let mut entries = self
            .ledger
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(&self.key);
            }
        }
    }
}

/// Counter of operations that `shutdown` must wait out.
struct InFlight(watch::Sender<usize>);

struct InFlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn new() -> Self {
        Self(watch::channel(0).0)
    }

    fn enter(&self) -> InFlightGuard<'_> {
        self.0.send_modify(|n| *n += 1);
        InFlightGuard(self)
    }

    async fn wait_idle(&self) {
        let mut count = self.0.subscribe();
        let _ = count.wait_for(|n| *n == 0).await;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.0.send_modify(|n| *n -= 1);
    }
}
