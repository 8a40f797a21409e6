use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{ReplayBuffer, ReplayReader};
use crate::process::{self, TranscodeProcess};
use crate::{SpawnError, StreamError, TaskKey, TranscoderConfig};

/// Identifies one task instance; a relaunch for the same key gets a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Task lifecycle. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Live,
    Destroyed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Live => "live",
            Self::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub key: TaskKey,
    pub id: TaskId,
    pub pid: Option<u32>,
    pub state: TaskState,
    pub ref_count: usize,
    pub idle_timer_armed: bool,
    pub bytes_buffered: u64,
    pub output_closed: bool,
}

/// Pending idle eviction. Dropping it cancels the eviction.
pub(crate) struct IdleTimer {
    epoch: u64,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub(crate) fn new(epoch: u64, handle: JoinHandle<()>) -> Self {
        Self {
            epoch,
            handle: Some(handle),
        }
    }

    /// Forget the timer without aborting it; used by the timer's own task.
    fn disarm(mut self) {
        self.handle.take();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// One transcoder process bound to the buffer holding its output.
///
/// Ref count and idle timer are only touched while the registry holds the
/// task's key.
pub(crate) struct Task {
    key: TaskKey,
    id: TaskId,
    process: TranscodeProcess,
    buffer: ReplayBuffer,
    ref_count: usize,
    idle_timer: Option<IdleTimer>,
    idle_epoch: u64,
    state: TaskState,
}

impl Task {
    /// Spawn the transcoder and wait out its startup window.
    pub(crate) async fn launch(key: TaskKey, config: &TranscoderConfig) -> Result<Task, SpawnError> {
        let id = TaskId::new();
        debug!(%key, task_id = %id, state = %TaskState::Starting, "launching transcode task");

        let (buffer, writer) = ReplayBuffer::new(config.buffer_options());
        let process = process::spawn(
            &config.command,
            key.path(),
            key.format(),
            writer,
            config.process_timing(),
        )
        .await?;

        info!(%key, task_id = %id, pid = ?process.pid(), "transcode task live");
        Ok(Task {
            key,
            id,
            process,
            buffer,
            ref_count: 0,
            idle_timer: None,
            idle_epoch: 0,
            state: TaskState::Live,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn buffer(&self) -> &ReplayBuffer {
        &self.buffer
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub(crate) fn attach(&mut self) -> ReplayReader {
        self.ref_count += 1;
        if self.idle_timer.take().is_some() {
            debug!(key = %self.key, task_id = %self.id, "idle timer cancelled");
        }
        self.buffer.reader()
    }

    /// Returns `true` when the last reader left and an idle timer is due.
    pub(crate) fn detach(&mut self) -> bool {
        if self.ref_count == 0 {
            warn!(key = %self.key, task_id = %self.id, "detach without a matching attach");
            return false;
        }
        self.ref_count -= 1;
        self.ref_count == 0
    }

    /// Epoch for the next idle timer; older timers no longer match.
    pub(crate) fn next_idle_epoch(&mut self) -> u64 {
        self.idle_epoch += 1;
        self.idle_epoch
    }

    pub(crate) fn arm_idle_timer(&mut self, timer: IdleTimer) {
        self.idle_timer = Some(timer);
    }

    /// Whether the timer with `epoch` is the one armed and still unopposed.
    pub(crate) fn idle_timer_fired(&self, epoch: u64) -> bool {
        self.ref_count == 0 && self.idle_timer.as_ref().is_some_and(|t| t.epoch == epoch)
    }

    pub(crate) fn take_fired_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.disarm();
        }
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            key: self.key.clone(),
            id: self.id,
            pid: self.process.pid(),
            state: self.state,
            ref_count: self.ref_count,
            idle_timer_armed: self.idle_timer.is_some(),
            bytes_buffered: self.buffer.len(),
            output_closed: self.buffer.is_closed(),
        }
    }

    /// Close the buffer and terminate the process. Readers still holding a
    /// cursor drain what was buffered, then see the recorded outcome.
    pub(crate) async fn destroy(mut self, reason: &'static str) {
        self.state = TaskState::Destroyed;
        self.idle_timer.take();
        info!(
            key = %self.key,
            task_id = %self.id,
            reason,
            readers = self.ref_count,
            bytes = self.buffer.len(),
            state = %self.state,
            "destroying transcode task"
        );
        self.buffer.close(Err(StreamError::Aborted));
        self.process.terminate().await;
    }
}
