// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Tool Availability Probe (C10): a one-shot sanity check that a named
//! external helper (typically the configured compressor) actually exists
//! and runs, run before any pipeline is spawned so a missing helper fails
//! fast with a clear message instead of surfacing as a mid-transfer pipe
//! error.

use std::process::{Command, Stdio};
use std::time::Duration;

use crate::error::{Result, SupervisorError};

/// Default probe timeout: long enough for a cold page-cache `exec`, short
/// enough not to stall startup noticeably.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawns `name -h` with stdout/stderr discarded and requires exit 0
/// within `timeout`. Neither a non-zero exit nor a timeout distinguishes
/// "missing binary" from "binary rejects -h"; both are reported the same
/// way, since the only actionable response is the same either way.
pub fn check_tool_available(name: &str, timeout: Duration) -> Result<()> {
    let mut cmd = Command::new(name);
    cmd.arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Err(SupervisorError::tool_unavailable(name, e.to_string()));
        }
    };

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return if status.success() {
                    Ok(())
                } else {
                    Err(SupervisorError::tool_unavailable(
                        name,
                        format!("exited with {status}"),
                    ))
                };
            }
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SupervisorError::tool_unavailable(
                        name,
                        format!("did not exit within {:.1}s", timeout.as_secs_f64()),
                    ));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(SupervisorError::tool_unavailable(name, e.to_string())),
        }
    }
}
