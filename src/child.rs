// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Child Supervisor (C5): spawns the helper pipeline in its own process
//! group and exposes group-wide signalling, so the copier, compressor,
//! relay and any shell glue between them all die together.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Owns the spawned pipeline's `Child` handle and its process group id.
/// `kill`/`force_quit` always target the negative pid (the whole group),
/// never the bare leader pid, so grandchildren (the shell glue's own
/// children) die with it.
pub struct ChildSupervisor {
    child: Child,
    pgid: i32,
}

impl ChildSupervisor {
    /// Forks `argv` with `env` merged into the current environment, moving
    /// it to its own process group before `exec`. `stderr_pipes` are the
    /// write ends the child inherits (copier-stderr, copier-pid,
    /// relay-stderr, size-report); stdin is not connected, stdout is
    /// inherited so shell glue can print.
    pub fn spawn(
        argv: &[String],
        env: &HashMap<String, String>,
        keep_open_fds: &[RawFd],
    ) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let keep_open_fds = keep_open_fds.to_vec();
        // SAFETY: setpgid(0, 0) and closing fds not in `keep_open_fds` are
        // both async-signal-safe; this closure runs in the forked child
        // before exec, with no heap allocation beyond what's already
        // captured.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                close_unlisted_fds(&keep_open_fds);
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = child.id() as i32;

        // Also set it from the parent side to close the race where the
        // parent calls kill() before the child has run its own setpgid.
        // EPERM here just means the child won the race; ignore it.
        if unsafe { libc::setpgid(pid, pid) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EPERM) && err.raw_os_error() != Some(libc::ESRCH) {
                warn!("setpgid({pid}, {pid}) from parent failed: {err}");
            }
        }

        Ok(ChildSupervisor { child, pgid: pid })
    }

    pub fn pid(&self) -> i32 {
        self.pgid
    }

    /// Sends `signum` to the entire process group. ESRCH ("no such
    /// process") is swallowed: the group may already be gone.
    pub fn kill(&self, signum: i32) {
        let rc = unsafe { libc::kill(-self.pgid, signum) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!("kill(-{}, {signum}) failed: {err}", self.pgid);
            }
        }
    }

    /// Non-blocking liveness check of the leader process.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Blocking reap, retried across EINTR.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        loop {
            match self.child.wait() {
                Ok(status) => return Ok(status),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// If the child is still alive, escalates to SIGKILL on the group and
    /// waits for it to die. Called from the outermost cleanup so the
    /// supervisor never exits with the child still running.
    pub fn force_quit(&mut self, already_dead_hint: bool) {
        if !already_dead_hint {
            match self.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    debug!("force_quit: child still alive, escalating to SIGKILL");
                    self.kill(libc::SIGKILL);
                }
                Err(e) => warn!("force_quit: try_wait failed: {e}"),
            }
        }
        let _ = self.wait();
    }

    /// Polls until the child is reaped or `timeout` elapses, returning
    /// whether it exited in time.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

fn close_unlisted_fds(keep: &[RawFd]) {
    // /proc/self/fd is the portable-on-Linux way to enumerate open
    // descriptors without guessing an upper bound; fall back to a
    // conservative static range if it isn't available (e.g. sandboxed
    // environments without procfs).
    let keep_std = [0, 1, 2];
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                if !keep_std.contains(&fd) && !keep.contains(&fd) {
                    unsafe {
                        libc::close(fd);
                    }
                }
            }
        }
    } else {
        for fd in 3..1024 {
            if !keep.contains(&fd) {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

/// Exit-status classification shared by the event loop and `main`: a plain
/// exit code, or a negative "terminated by signal N" encoding
/// (`exit_status` is negative iff signalled).
pub fn classify_exit(status: ExitStatus) -> (i32, String) {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(0) => (0, String::new()),
        Some(code) => (code, format!("Exited with status {code}")),
        None => {
            let signum = status.signal().unwrap_or(0);
            (-signum, format!("Exited due to signal {signum}"))
        }
    }
}

/// Only used so `keep_open_fds` call sites can name a descriptor without
/// importing `AsRawFd` everywhere.
pub fn raw_fd(f: &impl AsRawFd) -> RawFd {
    f.as_raw_fd()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn classify_normal_exit() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(classify_exit(status), (0, String::new()));
    }

    #[test]
    fn classify_nonzero_exit() {
        let status = ExitStatus::from_raw(3 << 8);
        let (code, msg) = classify_exit(status);
        assert_eq!(code, 3);
        assert_eq!(msg, "Exited with status 3");
    }

    #[test]
    fn classify_signalled_exit() {
        let status = ExitStatus::from_raw(libc::SIGSEGV);
        let (code, msg) = classify_exit(status);
        assert_eq!(code, -libc::SIGSEGV);
        assert_eq!(msg, format!("Exited due to signal {}", libc::SIGSEGV));
    }

    #[test]
    fn spawn_and_reap_true_child() {
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()];
        let mut sup = ChildSupervisor::spawn(&argv, &HashMap::new(), &[]).unwrap();
        let status = sup.wait().unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn kill_signals_the_whole_group() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ];
        let mut sup = ChildSupervisor::spawn(&argv, &HashMap::new(), &[]).unwrap();
        sup.kill(libc::SIGTERM);
        let status = sup.wait().unwrap();
        assert!(status.signal().is_some());
    }

    #[test]
    fn force_quit_escalates_to_sigkill() {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap '' TERM; sleep 30".to_string(),
        ];
        let mut sup = ChildSupervisor::spawn(&argv, &HashMap::new(), &[]).unwrap();
        sup.kill(libc::SIGTERM);
        // Give the trap a moment to install and swallow the TERM, then
        // force_quit should still bring it down via SIGKILL.
        std::thread::sleep(Duration::from_millis(200));
        sup.force_quit(false);
    }
}
