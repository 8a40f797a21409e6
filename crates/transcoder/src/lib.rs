//! On-demand transcode task cache.
//!
//! For every (source file, output format) pair at most one transcoder
//! subprocess runs. Its output is captured in a [`buffer::ReplayBuffer`] so any
//! number of readers can stream it from the first byte, whenever they attach.
//! Tasks are reference counted by their readers and evicted after a period of
//! disuse.

pub mod buffer;
pub mod command;
pub mod keyed_mutex;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod task;

use std::path::{Path, PathBuf};
use std::time::Duration;

use recast_core::types::OutputFormat;
use thiserror::Error;

pub use buffer::{ReplayBuffer, ReplayReader, ReplayWriter};
pub use command::CommandTemplate;
pub use registry::{TaskReader, TaskRegistry};
pub use shutdown::ShutdownCoordinator;
pub use task::{TaskId, TaskSnapshot, TaskState};

/// The transcoder could not be brought up to a live state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    #[error("failed to launch {}: {reason}", program.display())]
    Launch { program: PathBuf, reason: String },
    #[error("failed to set up output pipe: {0}")]
    Pipe(String),
    #[error("transcoder exited during startup ({status})")]
    ExitedEarly { status: String },
}

/// Terminal error recorded on a replay buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("reading transcoder output failed: {0}")]
    Pipe(String),
    #[error("transcoder exited unsuccessfully ({status})")]
    Exited { status: String },
    #[error("buffer storage failed: {0}")]
    Storage(String),
    #[error("transcode aborted")]
    Aborted,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscodeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("no live transcode for {0}")]
    NotFound(TaskKey),
    #[error("transcoder is shutting down")]
    ShuttingDown,
}

/// Identity of a transcode: source path plus requested container.
///
/// The path is expected to be absolute and free of traversal segments; the
/// HTTP layer resolves it before building a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TaskKey {
    path: PathBuf,
    format: OutputFormat,
}

impl TaskKey {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.path.display(), self.format)
    }
}

/// Global transcoder configuration.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub command: CommandTemplate,
    /// A process that exits before this window elapses never becomes a task.
    pub startup_grace: Duration,
    /// Time between SIGTERM and SIGKILL when terminating.
    pub kill_grace: Duration,
    /// How long a task with no readers is kept around.
    pub idle_timeout: Duration,
    /// Buffered output above this size moves from memory to a temp file.
    pub spill_threshold: usize,
    pub spill_dir: Option<PathBuf>,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            command: CommandTemplate::ffmpeg("ffmpeg"),
            startup_grace: Duration::from_millis(1000),
            kill_grace: Duration::from_millis(3000),
            idle_timeout: Duration::from_secs(60),
            spill_threshold: 32 * 1024 * 1024,
            spill_dir: None,
        }
    }
}

impl TranscoderConfig {
    pub(crate) fn buffer_options(&self) -> buffer::BufferOptions {
        buffer::BufferOptions {
            spill_threshold: self.spill_threshold,
            spill_dir: self.spill_dir.clone(),
        }
    }

    pub(crate) fn process_timing(&self) -> process::ProcessTiming {
        process::ProcessTiming {
            startup_grace: self.startup_grace,
            kill_grace: self.kill_grace,
        }
    }
}
