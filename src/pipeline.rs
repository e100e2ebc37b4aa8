// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Command Builder (C11): opens the four child pipes (copier-stderr,
//! copier-PID, relay-stderr, size-report) and assembles the
//! argv/env for a thin shell wrapper around the copier/compressor/relay
//! pipeline. The specific helper binary names here (`blockcopy`,
//! the configured compressor, `tlsrelay`) are placeholders: this module is
//! the seam a real deployment replaces with its actual helper command
//! lines, kept concrete only so the supervisor runs end to end.

use std::collections::HashMap;
use std::io;
use std::os::fd::{IntoRawFd, RawFd};

use nix::unistd;

use crate::config::{CompressMethod, Config, ExpectedSize, Mode};
use crate::progress::StreamTag;

/// One end of a pipe the parent opened for the child. The parent keeps
/// `read_fd` (registered with the event loop); the child inherits
/// `write_fd` and the parent closes its own copy right after spawn so EOF
/// propagates correctly once the child closes its end.
struct ChildPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

fn open_pipe() -> io::Result<ChildPipe> {
    let (read_end, write_end) = unistd::pipe()?;
    Ok(ChildPipe {
        read_fd: read_end.into_raw_fd(),
        write_fd: write_end.into_raw_fd(),
    })
}

/// The parent-side handles for all four child pipes, plus the descriptor
/// map entries the event loop needs (read fd, stream tag).
pub struct ChildFds {
    copier_stderr: ChildPipe,
    copier_pid: ChildPipe,
    relay_stderr: ChildPipe,
    size_report: ChildPipe,
}

impl ChildFds {
    pub fn open() -> io::Result<Self> {
        Ok(ChildFds {
            copier_stderr: open_pipe()?,
            copier_pid: open_pipe()?,
            relay_stderr: open_pipe()?,
            size_report: open_pipe()?,
        })
    }

    /// Descriptors the child must keep open across its `close_unlisted_fds`
    /// sweep in [`crate::child::ChildSupervisor::spawn`]'s `pre_exec`.
    pub fn child_write_fds(&self) -> Vec<RawFd> {
        vec![
            self.copier_stderr.write_fd,
            self.copier_pid.write_fd,
            self.relay_stderr.write_fd,
            self.size_report.write_fd,
        ]
    }

    /// The event loop's data-descriptor set: parent-side read fd tagged
    /// with the stream it carries.
    pub fn event_loop_sources(&self) -> Vec<(RawFd, StreamTag)> {
        vec![
            (self.copier_stderr.read_fd, StreamTag::CopierStatus),
            (self.copier_pid.read_fd, StreamTag::CopierPid),
            (self.relay_stderr.read_fd, StreamTag::RelayStderr),
            (self.size_report.read_fd, StreamTag::ExpectedSize),
        ]
    }

    /// Closes the parent's copy of the write ends. Must run after the
    /// child has been spawned (and has therefore inherited its own
    /// copies) and before the event loop starts, or the parent's own
    /// open write end would keep every read end from ever seeing EOF.
    pub fn close_write_ends_in_parent(&self) {
        for fd in self.child_write_fds() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// Closes everything. Used on setup failure before any child exists.
    pub fn close_all(&self) {
        self.close_write_ends_in_parent();
        for fd in [
            self.copier_stderr.read_fd,
            self.copier_pid.read_fd,
            self.relay_stderr.read_fd,
            self.size_report.read_fd,
        ] {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// argv + env for [`crate::child::ChildSupervisor::spawn`].
pub struct PipelineSpec {
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Builds the pipeline spec. The child wrapper is a single `/bin/sh -c`
/// invocation sequencing `cmd_prefix; copier | [compressor |] relay;
/// cmd_suffix`, with each helper's descriptor numbers exposed through env
/// vars (the same `*_FD` idiom used for `EXP_SIZE_FD`) since the real
/// helper binaries are not part of this crate.
pub fn build_pipeline(config: &Config, fds: &ChildFds) -> PipelineSpec {
    let mut env = HashMap::new();
    env.insert(
        "COPIER_STDERR_FD".to_string(),
        fds.copier_stderr.write_fd.to_string(),
    );
    env.insert(
        "COPIER_PID_FD".to_string(),
        fds.copier_pid.write_fd.to_string(),
    );
    env.insert(
        "RELAY_STDERR_FD".to_string(),
        fds.relay_stderr.write_fd.to_string(),
    );
    env.insert(
        "SIZE_REPORT_FD".to_string(),
        fds.size_report.write_fd.to_string(),
    );
    if matches!(config.expected_size, ExpectedSize::Custom) {
        env.insert(
            "EXP_SIZE_FD".to_string(),
            fds.size_report.write_fd.to_string(),
        );
    }

    let copier = "blockcopy";
    let relay = "tlsrelay";

    let mut stages = vec![copier.to_string()];
    if let CompressMethod::Named(name) = &config.compress {
        stages.push(name.clone());
    }
    stages.push(relay_invocation(relay, config));

    let mut body = stages.join(" | ");
    if let Some(prefix) = &config.cmd_prefix {
        body = format!("{prefix}; {body}");
    }
    if let Some(suffix) = &config.cmd_suffix {
        body = format!("{body}; {suffix}");
    }

    PipelineSpec {
        argv: vec!["/bin/sh".to_string(), "-c".to_string(), body],
        env,
    }
}

fn relay_invocation(relay: &str, config: &Config) -> String {
    let mut parts = vec![relay.to_string()];
    match config.mode {
        Mode::Import => parts.push("--listen".to_string()),
        Mode::Export => {
            if let Some(host) = &config.host {
                parts.push(format!("--connect={host}"));
            }
        }
    }
    if let Some(port) = &config.port {
        parts.push(format!("--port={port}"));
    }
    parts.join(" ")
}
