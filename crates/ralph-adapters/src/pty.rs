//! Pseudo-terminal session management.
//!
//! Each iteration spawns the agent CLI in a PTY rather than a pipe: the
//! agent CLIs detect interactive terminals and change behavior, and the
//! interactive-mode contract requires sending real terminal bytes. The
//! slave end becomes the child's stdin/stdout/stderr; the master stays with
//! the supervisor for reading output and injecting keystrokes.

use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::openpty;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::backend::{AdapterError, AdapterResult};

/// A child process running in a pseudo-terminal.
///
/// The master fd is non-blocking; callers drive reads through
/// [`PtySession::poll_readable`] + [`PtySession::read`].
pub struct PtySession {
    master: OwnedFd,
    child_pid: Pid,
    /// Exit status once reaped; `is_alive` and `wait` share the reap so the
    /// exit code is never lost to a WNOHANG probe.
    reaped: std::sync::Mutex<Option<i32>>,
}

impl PtySession {
    /// Spawn a command in a new PTY.
    ///
    /// The child gets its own session with the slave as controlling terminal,
    /// inherits the parent environment plus `env` overrides, and execs in
    /// `working_dir`.
    pub fn spawn(
        command: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
    ) -> AdapterResult<Self> {
        let pty = openpty(None, None).map_err(|e| spawn_err(format!("openpty failed: {e}")))?;

        // Safety: standard fork-then-exec for PTY setup; the child only calls
        // async-signal-safe operations before execvp.
        match unsafe { unistd::fork() } {
            Ok(ForkResult::Child) => {
                drop(pty.master);

                unistd::setsid().map_err(|e| spawn_err(format!("setsid failed: {e}")))?;

                // Make the slave the controlling terminal so job control and
                // isatty() behave like a real terminal.
                unsafe {
                    if libc::ioctl(pty.slave.as_raw_fd(), libc::TIOCSCTTY as _, 0) < 0 {
                        let err = std::io::Error::last_os_error();
                        eprintln!("ralph-adapters: TIOCSCTTY failed: {err}");
                    }
                }

                unistd::dup2(pty.slave.as_raw_fd(), libc::STDIN_FILENO)
                    .map_err(|e| spawn_err(format!("dup2 stdin: {e}")))?;
                unistd::dup2(pty.slave.as_raw_fd(), libc::STDOUT_FILENO)
                    .map_err(|e| spawn_err(format!("dup2 stdout: {e}")))?;
                unistd::dup2(pty.slave.as_raw_fd(), libc::STDERR_FILENO)
                    .map_err(|e| spawn_err(format!("dup2 stderr: {e}")))?;

                drop(pty.slave);

                unistd::chdir(working_dir).map_err(|e| spawn_err(format!("chdir: {e}")))?;

                for (key, value) in env {
                    // Safety: single-threaded between fork and exec.
                    unsafe { std::env::set_var(key, value) };
                }

                let c_command = CString::new(command.to_string())
                    .map_err(|e| spawn_err(format!("invalid command: {e}")))?;
                let mut c_args: Vec<CString> = vec![c_command.clone()];
                for arg in args {
                    c_args.push(
                        CString::new(arg.as_str())
                            .map_err(|e| spawn_err(format!("invalid arg: {e}")))?,
                    );
                }

                unistd::execvp(&c_command, &c_args)
                    .map_err(|e| spawn_err(format!("exec {command} failed: {e}")))?;

                unreachable!("execvp returned Ok");
            }
            Ok(ForkResult::Parent { child }) => {
                drop(pty.slave);

                let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL)
                    .map_err(|e| spawn_err(format!("fcntl F_GETFL: {e}")))?;
                let flags = OFlag::from_bits_truncate(flags);
                fcntl(
                    pty.master.as_raw_fd(),
                    FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
                )
                .map_err(|e| spawn_err(format!("fcntl F_SETFL: {e}")))?;

                Ok(Self {
                    master: pty.master,
                    child_pid: child,
                    reaped: std::sync::Mutex::new(None),
                })
            }
            Err(e) => Err(spawn_err(format!("fork failed: {e}"))),
        }
    }

    /// Non-blocking read from the master PTY.
    ///
    /// Returns `Ok(0)` when no data is available (EAGAIN) or when the child
    /// has closed the slave end (EIO).
    pub fn read(&self, buf: &mut [u8]) -> AdapterResult<usize> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(AdapterError::Pty(format!("pty read: {e}"))),
        }
    }

    /// Write all bytes to the master PTY, injecting into the child's stdin.
    ///
    /// One logical write per call; EAGAIN is retried with a brief yield so a
    /// full kernel buffer never drops keystrokes.
    pub fn write_all(&self, data: &[u8]) -> AdapterResult<()> {
        let mut written = 0;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(AdapterError::Pty(format!("pty write: {e}"))),
            }
        }
        Ok(())
    }

    /// Whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        let mut reaped = self.reaped.lock().expect("reap lock");
        if reaped.is_some() {
            return false;
        }
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, code)) => {
                *reaped = Some(code);
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                *reaped = Some(-(sig as i32));
                false
            }
            _ => false,
        }
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// Signal termination is reported as `-signum`.
    pub fn wait(&self) -> AdapterResult<i32> {
        if let Some(code) = *self.reaped.lock().expect("reap lock") {
            return Ok(code);
        }
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    *self.reaped.lock().expect("reap lock") = Some(code);
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    let code = -(sig as i32);
                    *self.reaped.lock().expect("reap lock") = Some(code);
                    return Ok(code);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    return Ok(self.reaped.lock().expect("reap lock").unwrap_or(0))
                }
                Err(e) => return Err(AdapterError::Pty(format!("waitpid: {e}"))),
            }
        }
    }

    /// Poll the master fd for readability.
    ///
    /// Returns `true` when data is available or the child hung up.
    pub fn poll_readable(&self, timeout_ms: i32) -> AdapterResult<bool> {
        let borrowed = self.master.as_fd();
        let mut poll_fd = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms as u32).unwrap_or(PollTimeout::MAX)
        };

        match nix::poll::poll(&mut poll_fd, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = poll_fd[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP))
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(AdapterError::Pty(format!("poll: {e}"))),
        }
    }

    /// Send SIGTERM to the child process.
    pub fn terminate(&self) -> AdapterResult<()> {
        signal::kill(self.child_pid, Signal::SIGTERM)
            .map_err(|e| AdapterError::Pty(format!("kill SIGTERM: {e}")))
    }

    /// Send SIGKILL to the child process.
    pub fn kill(&self) -> AdapterResult<()> {
        signal::kill(self.child_pid, Signal::SIGKILL)
            .map_err(|e| AdapterError::Pty(format!("kill SIGKILL: {e}")))
    }

    /// The raw master fd, for poll integration.
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// The child's process ID.
    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }
}

fn spawn_err(msg: String) -> AdapterError {
    AdapterError::Spawn(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn drain(session: &PtySession) -> String {
        let mut buf = [0u8; 1024];
        let mut output = Vec::new();
        loop {
            match session.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn spawn_echo_and_read_output() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["hello ralph".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn failed");

        std::thread::sleep(std::time::Duration::from_millis(100));
        let text = drain(&session);
        assert!(
            text.contains("hello ralph"),
            "expected 'hello ralph' in output: {text:?}"
        );

        let code = session.wait().expect("wait failed");
        assert_eq!(code, 0);
    }

    #[test]
    fn write_reaches_child_stdin() {
        let session = PtySession::spawn("/bin/cat", &[], &PathBuf::from("/tmp"), &[])
            .expect("spawn failed");

        std::thread::sleep(std::time::Duration::from_millis(50));
        session.write_all(b"typed input\n").expect("write failed");
        std::thread::sleep(std::time::Duration::from_millis(100));

        let text = drain(&session);
        assert!(
            text.contains("typed input"),
            "expected echo of stdin: {text:?}"
        );

        // Ctrl-D ends cat
        session.write_all(&[0x04]).expect("EOF failed");
        let code = session.wait().expect("wait failed");
        assert_eq!(code, 0);
    }

    #[test]
    fn poll_readable_sees_output() {
        let session = PtySession::spawn(
            "/bin/echo",
            &["poll test".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn failed");

        let readable = session.poll_readable(1000).expect("poll failed");
        assert!(readable, "expected data to be readable");
        session.wait().ok();
    }

    #[test]
    fn terminate_kills_child() {
        let session = PtySession::spawn(
            "/bin/sleep",
            &["30".to_string()],
            &PathBuf::from("/tmp"),
            &[],
        )
        .expect("spawn failed");

        assert!(session.is_alive());
        session.terminate().expect("terminate failed");
        let code = session.wait().expect("wait failed");
        assert_eq!(code, -(Signal::SIGTERM as i32));
    }
}
