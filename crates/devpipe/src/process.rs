//! Child process supervision.
//!
//! The browser is started with `--remote-debugging-pipe`, which makes it read
//! commands from fd 3 and write responses and events to fd 4. Both are fresh
//! pipes installed between fork and exec. stdout is drained so the child never
//! blocks on a full pipe; stderr is scanned for the endpoint announcement and
//! drained afterwards.
//!
//! ## Safety contracts
//!
//! The `pre_exec` hook runs in the forked child before exec. It only calls
//! async-signal-safe functions (`fcntl`, `dup2`, `prctl`, `getppid`) on raw
//! descriptors captured by value, and does not allocate; the owned pipe ends
//! stay in the parent and are closed once the spawn returns.
//!
//! On Linux the child gets `PR_SET_PDEATHSIG = SIGKILL`. The kernel delivers
//! it when the *thread* that forked exits, not when the process does. Spawn
//! from a long-lived runtime thread: polling [`spawn`] from a short-lived one
//! (for example `block_on` inside `spawn_blocking`, whose idle threads are
//! reaped after a few seconds) kills the browser when that thread goes away.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, dup2};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, Command};

use crate::error::LaunchError;
use crate::launcher::LaunchConfig;

/// Appended after the caller's flags.
pub const REMOTE_DEBUGGING_FLAGS: [&str; 2] =
    ["--remote-debugging-port=0", "--remote-debugging-pipe"];

/// Child reads requests from this descriptor.
const CHILD_REQUEST_FD: RawFd = 3;
/// Child writes responses and events to this descriptor.
const CHILD_RESPONSE_FD: RawFd = 4;
/// Pipe ends are parked at or above this descriptor before being moved to 3/4.
const SCRATCH_FD_FLOOR: RawFd = 10;

/// Parent ends of the debugging pipes.
pub struct RpcPipes {
    pub reader: pipe::Receiver,
    pub writer: pipe::Sender,
}

/// Everything a successful spawn produces.
pub struct SpawnedChild {
    pub process: ChildProcess,
    pub pipes: RpcPipes,
    pub endpoint_url: String,
}

/// Owns the child. Dropping it kills the child immediately.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

/// Spawn the executable and wait for it to announce its endpoint.
pub async fn spawn(config: &LaunchConfig) -> Result<SpawnedChild, LaunchError> {
    let (child_requests, parent_writer) = cloexec_pipe().map_err(LaunchError::Pipe)?;
    let (parent_reader, child_responses) = cloexec_pipe().map_err(LaunchError::Pipe)?;

    let request_fd = child_requests.as_raw_fd();
    let response_fd = child_responses.as_raw_fd();
    let parent = nix::unistd::getpid();

    let mut command = Command::new(&config.executable);
    command
        .args(&config.flags)
        .args(REMOTE_DEBUGGING_FLAGS)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // SAFETY: see the module-level safety contracts.
    unsafe {
        command.pre_exec(move || {
            install_rpc_fds(request_fd, response_fd, parent).map_err(io::Error::from)
        });
    }

    tracing::info!(
        executable = %config.executable.display(),
        flags = config.flags.len(),
        "Spawning browser"
    );
    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        path: config.executable.clone(),
        source,
    })?;

    // The child holds its own copies now; ours would keep the pipes open forever.
    drop(child_requests);
    drop(child_responses);

    let pid = child.id();
    let stdout = child
        .stdout
        .take()
        .ok_or(LaunchError::MissingStdio("stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or(LaunchError::MissingStdio("stderr"))?;

    tokio::spawn(drain_lines(stdout, "stdout"));

    let mut process = ChildProcess { child };
    tracing::debug!(?pid, "Browser spawned, waiting for endpoint");

    let endpoint_url = match discover_endpoint(stderr, &config.endpoint_prefix).await {
        Some(url) => url,
        None => {
            let exit_code = process.reap(config.grace_period).await;
            tracing::error!(?pid, ?exit_code, "Browser exited without announcing an endpoint");
            return Err(LaunchError::EndpointNotFound { exit_code });
        }
    };
    tracing::info!(?pid, %endpoint_url, "Browser endpoint discovered");

    let pipes = RpcPipes {
        reader: pipe::Receiver::from_owned_fd(parent_reader).map_err(LaunchError::Pipe)?,
        writer: pipe::Sender::from_owned_fd(parent_writer).map_err(LaunchError::Pipe)?,
    };

    Ok(SpawnedChild {
        process,
        pipes,
        endpoint_url,
    })
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the child has already exited.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Exit code if the child has exited normally. `None` while it runs or
    /// when it was terminated by a signal.
    pub fn try_exit_code(&mut self) -> io::Result<Option<i32>> {
        Ok(self.child.try_wait()?.and_then(|status| status.code()))
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Interrupt the child, then kill it if it is still running after `grace`.
    pub async fn shutdown(&mut self, grace: Duration) -> io::Result<ExitStatus> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status);
        }

        if let Some(pid) = self.child.id() {
            tracing::debug!(pid, "Interrupting browser");
            signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT).map_err(io::Error::from)?;
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(?grace, "Browser still running after interrupt, killing");
                self.child.kill().await?;
                self.child.wait().await
            }
        }
    }

    /// Collect the exit code of a child that closed its diagnostic stream.
    async fn reap(&mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for browser");
                None
            }
            Err(_) => {
                tracing::warn!("Browser closed stderr but kept running, killing");
                if let Err(e) = self.child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill browser");
                }
                None
            }
        }
    }
}

/// Read stderr until the endpoint line. Everything after it is drained, never parsed.
async fn discover_endpoint(stderr: ChildStderr, prefix: &str) -> Option<String> {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read browser stderr");
                return None;
            }
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\n', '\r']);
        if let Some(url) = text.strip_prefix(prefix) {
            let url = url.to_string();
            tokio::spawn(drain_lines(reader, "stderr"));
            return Some(url);
        }
        tracing::debug!(target: "devpipe::child", stream = "stderr", "{}", text);
    }
}

async fn drain_lines<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::trace!(target: "devpipe::child", stream, "{}", text.trim_end());
            }
            Err(e) => {
                tracing::debug!(stream, error = %e, "Stopped draining browser output");
                break;
            }
        }
    }
}

/// Pipe whose ends do not leak into other children spawned meanwhile.
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) =
        nix::unistd::pipe().map_err(|e| io::Error::other(format!("pipe failed: {}", e)))?;
    for end in [&read, &write] {
        fcntl(end, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| io::Error::other(format!("fcntl(FD_CLOEXEC) failed: {}", e)))?;
    }
    Ok((read, write))
}

/// Runs in the forked child: place the pipe ends on fds 3 and 4.
fn install_rpc_fds(request_fd: RawFd, response_fd: RawFd, parent: Pid) -> nix::Result<()> {
    // SAFETY: both descriptors were open at fork and nothing in the child
    // closes them before exec.
    let (request, response) =
        unsafe { (BorrowedFd::borrow_raw(request_fd), BorrowedFd::borrow_raw(response_fd)) };

    // Park both ends above 3/4 first so neither dup2 can clobber the other.
    let request = fcntl(request, FcntlArg::F_DUPFD_CLOEXEC(SCRATCH_FD_FLOOR))?;
    let response = fcntl(response, FcntlArg::F_DUPFD_CLOEXEC(SCRATCH_FD_FLOOR))?;

    // dup2 clears close-on-exec on the target, the parked copies close at exec.
    // SAFETY: the parked copies were just created above.
    unsafe {
        place_fd(BorrowedFd::borrow_raw(request), CHILD_REQUEST_FD)?;
        place_fd(BorrowedFd::borrow_raw(response), CHILD_RESPONSE_FD)?;
    }

    #[cfg(target_os = "linux")]
    {
        nix::sys::prctl::set_pdeathsig(Signal::SIGKILL)?;
        // The parent may already be gone, in which case the signal never comes.
        if nix::unistd::getppid() != parent {
            return Err(nix::errno::Errno::ESRCH);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = parent;

    Ok(())
}

/// dup2 `source` onto `target`, leaving `target` open.
///
/// # Safety
///
/// `target` must not be owned by anything else in this process.
unsafe fn place_fd(source: BorrowedFd<'_>, target: RawFd) -> nix::Result<()> {
    let mut target = unsafe { OwnedFd::from_raw_fd(target) };
    let result = dup2(source, &mut target);
    std::mem::forget(target); // the child keeps it across exec
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> LaunchConfig {
        LaunchConfig::new("/bin/sh").with_flags(["-c", script])
    }

    #[test]
    fn rpc_pipe_ends_are_close_on_exec() {
        let (read, write) = cloexec_pipe().unwrap();
        for end in [&read, &write] {
            let flags = FdFlag::from_bits_truncate(fcntl(end, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[tokio::test]
    async fn child_sees_rpc_fds_3_and_4() {
        let config = sh(
            "{ : <&3; } 2>/dev/null || exit 10; \
             { : >&4; } 2>/dev/null || exit 11; \
             exit 0",
        );

        match spawn(&config).await {
            Err(LaunchError::EndpointNotFound { exit_code }) => assert_eq!(exit_code, Some(0)),
            Err(other) => panic!("expected a clean exit, got {other}"),
            Ok(_) => panic!("script never announces an endpoint"),
        }
    }

    #[tokio::test]
    async fn exit_before_endpoint_reports_exit_code() {
        let config = sh("echo 'starting up' >&2; exit 3");

        match spawn(&config).await {
            Err(LaunchError::EndpointNotFound { exit_code }) => assert_eq!(exit_code, Some(3)),
            Err(other) => panic!("expected EndpointNotFound, got {other}"),
            Ok(_) => panic!("expected EndpointNotFound, got a running child"),
        }
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let config = LaunchConfig::new("/nonexistent/devpipe-browser");

        assert!(matches!(
            spawn(&config).await,
            Err(LaunchError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn discovers_endpoint_after_noise() {
        let config = sh(
            "echo noise >&2; \
             echo 'DevTools listening on ws://127.0.0.1:9222/devtools/browser/abc' >&2; \
             echo 'DevTools listening on ws://ignored' >&2; \
             exec sleep 30",
        );

        let mut spawned = spawn(&config).await.unwrap();
        assert_eq!(
            spawned.endpoint_url,
            "ws://127.0.0.1:9222/devtools/browser/abc"
        );
        assert!(spawned.process.pid().is_some());
        assert!(spawned.process.try_wait().unwrap().is_none());

        let status = spawned
            .process
            .shutdown(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn shutdown_escalates_when_interrupt_is_ignored() {
        let config = sh(
            "trap '' INT; \
             echo 'DevTools listening on ws://x' >&2; \
             while :; do sleep 1; done",
        );

        let mut spawned = spawn(&config).await.unwrap();
        let status = spawned
            .process
            .shutdown(Duration::from_millis(200))
            .await
            .unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), None);
    }

    #[tokio::test]
    async fn shutdown_of_exited_child_returns_its_status() {
        let config = sh("echo 'DevTools listening on ws://x' >&2; exit 0");

        let mut spawned = spawn(&config).await.unwrap();
        spawned.process.wait().await.unwrap();
        assert_eq!(spawned.process.try_exit_code().unwrap(), Some(0));

        let status = spawned
            .process
            .shutdown(Duration::from_millis(100))
            .await
            .unwrap();
        assert!(status.success());
    }
}
