//! Transcoder subprocess supervision.
//!
//! The transcoder runs with stdin closed, stdout/stderr inherited from the
//! server (diagnostics end up in the server's own output), and a dedicated
//! pipe on fd 3 that carries nothing but the encoded stream. That pipe is
//! drained into a [`ReplayWriter`] for the whole life of the process.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use recast_core::types::OutputFormat;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::buffer::ReplayWriter;
use crate::command::CommandTemplate;
use crate::{SpawnError, StreamError};

/// File descriptor the transcoder writes its encoded output to.
pub const OUTPUT_FD: RawFd = 3;

const PIPE_READ_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(ExitStatus),
    /// Waiting on the child failed; it is treated as gone.
    Lost,
}

impl ProcessState {
    fn describe(self) -> String {
        match self {
            Self::Running => "running".into(),
            Self::Exited(status) => status.to_string(),
            Self::Lost => "unknown exit".into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessTiming {
    pub startup_grace: Duration,
    pub kill_grace: Duration,
}

/// Handle to a running transcoder that survived its startup window.
pub struct TranscodeProcess {
    pid: Option<u32>,
    state: watch::Receiver<ProcessState>,
    kill_grace: Duration,
}

/// Launch the transcoder for `input`, draining its output into `writer`.
///
/// Returns once the process has stayed up for `timing.startup_grace`. A
/// process that exits inside that window is reported as
/// [`SpawnError::ExitedEarly`], whatever its exit code.
pub async fn spawn(
    template: &CommandTemplate,
    input: &Path,
    format: OutputFormat,
    writer: ReplayWriter,
    timing: ProcessTiming,
) -> Result<TranscodeProcess, SpawnError> {
    let (read_end, write_end) = std::io::pipe().map_err(|e| SpawnError::Pipe(e.to_string()))?;

    let mut command = Command::new(&template.program);
    command
        .args(template.render(input, format))
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    install_output_fd(&mut command, write_end.as_raw_fd());

    let child = command.spawn().map_err(|e| SpawnError::Launch {
        program: template.program.clone(),
        reason: e.to_string(),
    })?;
    // The child now holds the only write end; EOF follows its exit.
    drop(write_end);

    let pid = child.id();
    let output = pipe::Receiver::from_owned_fd(OwnedFd::from(read_end))
        .map_err(|e| SpawnError::Pipe(e.to_string()))?;

    let (state_tx, state_rx) = watch::channel(ProcessState::Running);
    tokio::spawn(reap(child, state_tx));
    tokio::spawn(drain(output, writer, state_rx.clone(), pid));

    let process = TranscodeProcess {
        pid,
        state: state_rx,
        kill_grace: timing.kill_grace,
    };
    info!(
        ?pid,
        program = %template.program.display(),
        input = %input.display(),
        %format,
        "spawned transcoder"
    );

    let early_exit = tokio::select! {
        exited = process.wait_exit() => Some(exited),
        _ = tokio::time::sleep(timing.startup_grace) => None,
    };
    match early_exit {
        Some(exited) => {
            let status = exited.describe();
            warn!(?pid, %status, input = %input.display(), "transcoder exited during startup");
            Err(SpawnError::ExitedEarly { status })
        }
        None => {
            debug!(?pid, "transcoder survived startup window");
            Ok(process)
        }
    }
}

impl TranscodeProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.state() != ProcessState::Running
    }

    /// Wait for the process to exit.
    pub async fn wait_exit(&self) -> ProcessState {
        let mut state = self.state.clone();
        match state.wait_for(|s| *s != ProcessState::Running).await {
            Ok(s) => *s,
            Err(_) => ProcessState::Lost,
        }
    }

    /// SIGTERM, then SIGKILL if the process is still around after the kill
    /// grace period. Returns once it has exited; a no-op if it already has.
    pub async fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        debug!(pid = ?self.pid, "terminating transcoder");
        send_signal(self.pid, &self.state, Signal::SIGTERM);

        if tokio::time::timeout(self.kill_grace, self.wait_exit())
            .await
            .is_ok()
        {
            return;
        }

        warn!(
            pid = ?self.pid,
            grace_ms = self.kill_grace.as_millis() as u64,
            "transcoder ignored SIGTERM, killing"
        );
        send_signal(self.pid, &self.state, Signal::SIGKILL);
        self.wait_exit().await;
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        // Best-effort kill when a handle is dropped without terminate().
        send_signal(self.pid, &self.state, Signal::SIGKILL);
    }
}

fn install_output_fd(command: &mut Command, fd: RawFd) {
    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions (fcntl, dup2).
    unsafe {
        command.pre_exec(move || {
            if fd == OUTPUT_FD {
                // Already in place; dup2 would be a no-op that keeps CLOEXEC.
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, OUTPUT_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn send_signal(pid: Option<u32>, state: &watch::Receiver<ProcessState>, sig: Signal) {
    let Some(pid) = pid else { return };
    if *state.borrow() != ProcessState::Running {
        return;
    }
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, signal = ?sig, error = %e, "failed to signal transcoder"),
    }
}

async fn reap(mut child: Child, state: watch::Sender<ProcessState>) {
    let next = match child.wait().await {
        Ok(status) => ProcessState::Exited(status),
        Err(e) => {
            warn!(pid = ?child.id(), error = %e, "lost track of transcoder");
            ProcessState::Lost
        }
    };
    state.send_replace(next);
}

async fn drain(
    output: pipe::Receiver,
    mut writer: ReplayWriter,
    mut state: watch::Receiver<ProcessState>,
    pid: Option<u32>,
) {
    let mut chunks = ReaderStream::with_capacity(output, PIPE_READ_CAPACITY);
    while let Some(next) = chunks.next().await {
        match next {
            Ok(chunk) => {
                if let Err(e) = writer.write(chunk).await {
                    // Aborted means the task was torn down; it terminates the process itself.
                    if e != StreamError::Aborted {
                        send_signal(pid, &state, Signal::SIGKILL);
                    }
                    return;
                }
            }
            Err(e) => {
                warn!(?pid, error = %e, "transcoder output pipe failed");
                writer.fail(StreamError::Pipe(e.to_string()));
                send_signal(pid, &state, Signal::SIGKILL);
                return;
            }
        }
    }

    let exit = match state.wait_for(|s| *s != ProcessState::Running).await {
        Ok(s) => *s,
        Err(_) => ProcessState::Lost,
    };
    match exit {
        ProcessState::Exited(status) if status.success() => {
            debug!(?pid, bytes = writer.written(), "transcoder output complete");
            writer.finish();
        }
        other => {
            let status = other.describe();
            warn!(?pid, %status, bytes = writer.written(), "transcoder failed mid-stream");
            writer.fail(StreamError::Exited { status });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferOptions, ReplayBuffer};
    use std::time::Instant;

    const TIMING: ProcessTiming = ProcessTiming {
        startup_grace: Duration::from_millis(100),
        kill_grace: Duration::from_millis(200),
    };

    fn script(body: &str) -> CommandTemplate {
        CommandTemplate::new("sh", ["-c", body])
    }

    async fn launch(body: &str) -> (Result<TranscodeProcess, SpawnError>, ReplayBuffer) {
        let (buffer, writer) = ReplayBuffer::new(BufferOptions::default());
        let result = spawn(
            &script(body),
            Path::new("/dev/null"),
            OutputFormat::Mp4,
            writer,
            TIMING,
        )
        .await;
        (result, buffer)
    }

    async fn read_all(buffer: &ReplayBuffer) -> Result<Vec<u8>, StreamError> {
        let mut reader = buffer.reader();
        let mut out = Vec::new();
        while let Some(chunk) = reader.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn output_pipe_feeds_the_buffer() {
        let (process, buffer) =
            launch("printf '%s' '{format}-bytes' >&3; exec 3>&-; sleep 0.3").await;
        let process = process.unwrap();
        assert!(process.pid().is_some());

        assert_eq!(read_all(&buffer).await.unwrap(), b"mp4-bytes");
        assert!(matches!(process.wait_exit().await, ProcessState::Exited(s) if s.success()));
    }

    #[tokio::test]
    async fn stdout_is_not_captured() {
        let (process, buffer) = launch("echo diagnostics; printf data >&3; sleep 0.2").await;
        process.unwrap();
        assert_eq!(read_all(&buffer).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn early_exit_is_a_spawn_error() {
        let (process, _buffer) = launch("exit 3").await;
        match process {
            Err(SpawnError::ExitedEarly { status }) => assert!(status.contains('3')),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("process should have failed startup"),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let (buffer, writer) = ReplayBuffer::new(BufferOptions::default());
        let result = spawn(
            &CommandTemplate::new("/nonexistent/transcoder", Vec::<String>::new()),
            Path::new("/dev/null"),
            OutputFormat::Webm,
            writer,
            TIMING,
        )
        .await;
        assert!(matches!(result, Err(SpawnError::Launch { .. })));
        drop(buffer);
    }

    #[tokio::test]
    async fn late_failure_closes_buffer_with_error() {
        let (process, buffer) = launch("printf abc >&3; sleep 0.2; exit 1").await;
        process.unwrap();
        let result = read_all(&buffer).await;
        assert!(matches!(result, Err(StreamError::Exited { .. })));
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn terminate_stops_a_cooperative_process() {
        let (process, _buffer) = launch("exec sleep 30").await;
        let process = process.unwrap();
        let started = Instant::now();
        process.terminate().await;
        assert!(process.has_exited());
        assert!(started.elapsed() < TIMING.kill_grace);
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let (process, _buffer) =
            launch("trap '' TERM; while true; do sleep 0.05; done").await;
        let process = process.unwrap();
        let started = Instant::now();
        process.terminate().await;
        assert!(process.has_exited());
        assert!(started.elapsed() >= TIMING.kill_grace);

        // already exited: returns immediately
        let again = Instant::now();
        process.terminate().await;
        assert!(again.elapsed() < Duration::from_millis(50));
    }
}
