//! External command execution.

use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty stderr line, for error messages.
    pub fn summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| l.trim().to_string())
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("exited with {code}"),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Runs argv-style commands.
pub trait CommandRunner {
    fn run(&self, argv: &[String], cwd: Option<&Path>) -> io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
///
/// Clones share one [`ChildTracker`], so a deadline can stop whatever the
/// run still has in flight.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner {
    children: ChildTracker,
}

impl SystemRunner {
    pub fn tracked(children: ChildTracker) -> Self {
        Self { children }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], cwd: Option<&Path>) -> io::Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let (id, stdout, stderr) = self.children.spawn(&mut cmd)?;
        let stdout = thread::spawn(move || drain(stdout));
        let stderr = thread::spawn(move || drain(stderr));
        let status = self.children.wait(id)?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned(),
        })
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
struct Children {
    live: HashMap<u32, Child>,
    terminated: bool,
}

/// Child processes started by [`SystemRunner`]s that are still running.
#[derive(Debug, Default, Clone)]
pub struct ChildTracker {
    inner: Arc<Mutex<Children>>,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Children> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, cmd: &mut Command) -> io::Result<(u32, Option<ChildStdout>, Option<ChildStderr>)> {
        let mut children = self.lock();
        if children.terminated {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "provisioning was terminated"));
        }
        let mut child = cmd.spawn()?;
        let id = child.id();
        let pipes = (id, child.stdout.take(), child.stderr.take());
        children.live.insert(id, child);
        Ok(pipes)
    }

    fn wait(&self, id: u32) -> io::Result<ExitStatus> {
        loop {
            {
                let mut children = self.lock();
                let Some(child) = children.live.get_mut(&id) else {
                    return Err(io::Error::other(format!("child {id} is not tracked")));
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        children.live.remove(&id);
                        return Ok(status);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        children.live.remove(&id);
                        return Err(e);
                    }
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Ask every running child to stop, and refuse to start new ones.
    pub fn terminate(&self) {
        let mut children = self.lock();
        children.terminated = true;
        for (id, child) in children.live.iter_mut() {
            debug!(pid = *id, "terminating child process");
            if let Err(e) = signal_terminate(child) {
                warn!(pid = *id, error = %e, "cannot terminate child process");
            }
        }
    }

    pub fn running(&self) -> usize {
        self.lock().live.len()
    }
}

/// SIGTERM, so `sudo` forwards it and `git` removes its partial clone.
#[cfg(unix)]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    #[allow(clippy::cast_possible_wrap)]
    let pid = Pid::from_raw(child.id() as i32);
    kill(pid, Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

/// Find an executable on PATH.
pub fn find_on_path(binary: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    find_in(std::env::split_paths(&path), binary)
}

fn find_in(dirs: impl IntoIterator<Item = PathBuf>, binary: &str) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn summary_prefers_last_stderr_line() {
        let out = CommandOutput {
            code: Some(100),
            stdout: String::new(),
            stderr: "Reading package lists...\nE: Unable to locate package nope\n\n".to_string(),
        };
        assert_eq!(out.summary(), "E: Unable to locate package nope");

        let out = CommandOutput {
            code: Some(1),
            ..Default::default()
        };
        assert_eq!(out.summary(), "exited with 1");
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_output() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];
        let out = SystemRunner::default().run(&argv, None).unwrap();
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(SystemRunner::default().run(&[], None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn terminate_stops_running_children() {
        let children = ChildTracker::new();
        let runner = SystemRunner::tracked(children.clone());
        let started = Instant::now();
        let handle = thread::spawn(move || {
            let argv = vec!["sleep".to_string(), "30".to_string()];
            runner.run(&argv, None)
        });

        while children.running() == 0 {
            assert!(started.elapsed() < Duration::from_secs(10), "sleep never started");
            thread::sleep(POLL_INTERVAL);
        }
        children.terminate();

        let out = handle.join().unwrap().unwrap();
        assert!(!out.success());
        assert_eq!(out.code, None);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(children.running(), 0);

        let again = SystemRunner::tracked(children).run(&["true".to_string()], None);
        assert_eq!(again.unwrap_err().kind(), io::ErrorKind::Interrupted);
    }

    #[cfg(unix)]
    #[test]
    fn lookup_skips_files_without_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let plain = temp.path().join("plain");
        let exec = temp.path().join("exec");
        std::fs::create_dir_all(&plain).unwrap();
        std::fs::create_dir_all(&exec).unwrap();
        std::fs::write(plain.join("apt-get"), "#!/bin/sh\n").unwrap();
        std::fs::write(exec.join("apt-get"), "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(exec.join("apt-get"), std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(find_in([plain.clone()], "apt-get"), None);
        assert_eq!(find_in([plain, exec.clone()], "apt-get"), Some(exec.join("apt-get")));
    }
}
