// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Supervisor library for the disk-image transfer daemon: builds the
//! copier/compressor/relay child pipeline, multiplexes its output through a
//! non-blocking event loop, derives progress from the copier's textual
//! status lines, and persists it to a rate-limited status file.
//!
//! `main.rs` is a thin driver around [`run`].

pub mod child;
pub mod cli;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod line_splitter;
pub mod pipeline;
pub mod progress;
pub mod signals;
pub mod status;
pub mod tool_check;

use std::time::Duration;

use tracing::{error, info};

use crate::child::{classify_exit, ChildSupervisor};
use crate::config::{CompressMethod, Config, Mode};
use crate::error::{Result, SupervisorError};
use crate::event_loop::{EventLoop, LoopExit};
use crate::pipeline::{build_pipeline, ChildFds};
use crate::progress::ProgressParser;
use crate::signals::SignalBridge;
use crate::status::StatusWriter;

/// Runs one whole transfer: tool probe, pipeline spawn, event loop,
/// shutdown. Returns the process exit code; never panics on expected
/// failure modes. The status file always reflects the true outcome and
/// the child is never left running.
pub fn run(config: Config) -> i32 {
    let mut status = StatusWriter::new(&config.status_path);

    match run_inner(&config, &mut status) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            let code = err.exit_code(config.exit_failure_code);
            status.record_mut().set_exit_status(code, err.to_string());
            let _ = status.flush(true);
            code
        }
    }
}

fn run_inner(config: &Config, status: &mut StatusWriter) -> Result<i32> {
    if let CompressMethod::Named(name) = &config.compress {
        info!("probing compression helper '{name}'");
        tool_check::check_tool_available(name, tool_check::DEFAULT_TIMEOUT)?;
    }

    let fds = ChildFds::open().map_err(SupervisorError::Spawn)?;
    let spec = build_pipeline(config, &fds);

    let mut child = match ChildSupervisor::spawn(&spec.argv, &spec.env, &fds.child_write_fds()) {
        Ok(child) => child,
        Err(e) => {
            fds.close_all();
            return Err(SupervisorError::Spawn(e));
        }
    };
    info!("spawned pipeline as process group {}", child.pid());

    // Installed only after the child's process group is established, so
    // a signal arriving during setup can't race ahead of the kill target.
    let mut signal_bridge = SignalBridge::install().map_err(SupervisorError::Spawn)?;

    // The parent's copy of the write ends must close now: the child has
    // its own copies, and holding ours open would stop the read ends from
    // ever observing EOF.
    fds.close_write_ends_in_parent();

    let mut progress = ProgressParser::new(config.expected_size);

    let is_import = config.mode == Mode::Import;
    let mut event_loop = EventLoop::new(
        fds.event_loop_sources(),
        signal_bridge.fileno(),
        &mut signal_bridge,
        &mut progress,
        status,
        &child,
        config.connect_timeout,
        is_import,
    )
    .map_err(|e| SupervisorError::Unhandled(anyhow::anyhow!("failed to arm event loop: {e}")))?;

    let exit = event_loop.run();
    progress.flush_all(status.record_mut());
    signal_bridge.reset();

    match exit {
        LoopExit::AllPipesClosed => {
            info!("all child pipes closed, waiting for the pipeline to exit");
        }
        LoopExit::ExitTimeoutElapsed => {
            info!("exit-timeout elapsed, escalating to SIGKILL");
        }
    }

    let already_reaped = matches!(exit, LoopExit::AllPipesClosed)
        && child_exited_within(&mut child, Duration::from_millis(200));

    if !already_reaped {
        child.force_quit(false);
    }

    let exit_status = child.wait().map_err(|e| {
        SupervisorError::Unhandled(anyhow::anyhow!("failed to reap child: {e}"))
    })?;
    let (code, message) = classify_exit(exit_status);
    status.record_mut().set_exit_status(code, message.clone());
    status
        .flush(true)
        .map_err(|e| SupervisorError::Unhandled(anyhow::anyhow!("failed to flush status: {e}")))?;

    if code != 0 {
        info!("pipeline finished abnormally: {message}");
    } else {
        info!("pipeline finished successfully");
    }

    Ok(if code == 0 {
        0
    } else {
        config.exit_failure_code
    })
}

/// Gives a just-exited-EOF child a brief grace window to actually be
/// reaped before we fall back to `force_quit`, since "all pipes closed"
/// is not the same signal as "child reaped".
fn child_exited_within(child: &mut ChildSupervisor, timeout: Duration) -> bool {
    matches!(child.wait_timeout(timeout), Ok(Some(_)))
}
