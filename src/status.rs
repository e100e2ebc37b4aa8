// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Status Writer (C1): the progress record an orchestrator polls, and its
//! rate-limited, atomic, world-unreadable persistence to disk.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

const MAX_RECENT_OUTPUT: usize = 20;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// The progress record an orchestrator polls from disk. Mutated by the
/// progress parser (C3) and the event loop (C6), serialized and persisted
/// only by [`StatusWriter`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    ctime: f64,
    mtime: Option<f64>,
    recent_output: VecDeque<String>,
    listen_port: Option<u16>,
    connected: bool,
    progress_mbytes: f64,
    progress_throughput: f64,
    progress_percent: Option<u8>,
    progress_eta: Option<u64>,
    exit_status: i32,
    error_message: String,
}

fn unix_time(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl StatusRecord {
    fn new(now: SystemTime) -> Self {
        StatusRecord {
            ctime: unix_time(now),
            mtime: None,
            recent_output: VecDeque::with_capacity(MAX_RECENT_OUTPUT),
            listen_port: None,
            connected: false,
            progress_mbytes: 0.0,
            progress_throughput: 0.0,
            progress_percent: None,
            progress_eta: None,
            exit_status: 0,
            error_message: String::new(),
        }
    }

    /// Push a human-readable line, dropping the oldest once the bound of
    /// 20 is exceeded. Property under test: `|recent_output| <= 20` always.
    pub fn add_line(&mut self, line: impl Into<String>) {
        if self.recent_output.len() >= MAX_RECENT_OUTPUT {
            self.recent_output.pop_front();
        }
        self.recent_output.push_back(line.into());
    }

    /// `0 < p < 2^16`.
    pub fn set_listen_port(&mut self, port: u32) {
        debug_assert!(port > 0 && port < (1 << 16), "listen port out of range");
        self.listen_port = Some(port as u16);
    }

    /// Monotone: once true, `connected` never goes back to false.
    pub fn set_connected(&mut self) {
        self.connected = true;
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn set_progress(
        &mut self,
        mbytes: f64,
        throughput: f64,
        percent: Option<u8>,
        eta: Option<u64>,
    ) {
        self.progress_mbytes = mbytes;
        self.progress_throughput = throughput;
        self.progress_percent = percent;
        self.progress_eta = eta;
    }

    /// `exit_status == 0 <=> error_message.is_empty()`.
    pub fn set_exit_status(&mut self, code: i32, message: impl Into<String>) {
        self.exit_status = code;
        self.error_message = if code == 0 {
            String::new()
        } else {
            message.into()
        };
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Test-only constructor and accessors used by other modules' unit
    /// tests to observe fields the production code never needs to read
    /// back (only the serializer does).
    #[cfg(test)]
    pub(crate) fn new_for_test() -> Self {
        Self::new(SystemTime::now())
    }

    #[cfg(test)]
    pub(crate) fn listen_port_for_test(&self) -> Option<u16> {
        self.listen_port
    }

    #[cfg(test)]
    pub(crate) fn recent_output_for_test(&self) -> Vec<String> {
        self.recent_output.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn progress_mbytes_for_test(&self) -> f64 {
        self.progress_mbytes
    }

    #[cfg(test)]
    pub(crate) fn progress_throughput_for_test(&self) -> f64 {
        self.progress_throughput
    }

    #[cfg(test)]
    pub(crate) fn progress_percent_for_test(&self) -> Option<u8> {
        self.progress_percent
    }
}

/// Sequences `serialize -> write-temp -> rename` and enforces the 5-second
/// rate limit unless a caller forces the write (listen-port discovery,
/// connected transition, connect-timeout expiry, final exit).
pub struct StatusWriter {
    path: PathBuf,
    record: StatusRecord,
    now: fn() -> SystemTime,
}

impl StatusWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_clock(path, SystemTime::now)
    }

    /// Used by tests to inject a deterministic fake clock.
    fn with_clock(path: impl Into<PathBuf>, now: fn() -> SystemTime) -> Self {
        StatusWriter {
            path: path.into(),
            record: StatusRecord::new(now()),
            now,
        }
    }

    pub fn record(&self) -> &StatusRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut StatusRecord {
        &mut self.record
    }

    /// Writes the record to disk unless rate-limited. Returns whether a
    /// write actually happened (used only by tests).
    pub fn flush(&mut self, force: bool) -> io::Result<bool> {
        let now = (self.now)();
        if !force {
            if let Some(mtime) = self.record.mtime {
                let elapsed = unix_time(now) - mtime;
                if elapsed < FLUSH_INTERVAL.as_secs_f64() {
                    return Ok(false);
                }
            }
        }
        self.record.mtime = Some(unix_time(now));
        write_atomic(&self.path, &self.record)?;
        Ok(true)
    }
}

fn write_atomic(path: &Path, record: &StatusRecord) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".impexpd-status-")
        .tempfile_in(dir)?;

    serde_json::to_writer_pretty(&mut tmp, record)?;
    use std::io::Write;
    tmp.flush()?;

    let mut perms = fs::metadata(tmp.path())?.permissions();
    perms.set_mode(0o400);
    fs::set_permissions(tmp.path(), perms)?;

    tmp.persist(path)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.error))?;
    Ok(())
}
