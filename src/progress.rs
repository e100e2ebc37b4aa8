// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Progress Parser (C3): turns the copier's textual status lines into a
//! throughput/percent/ETA estimate, and dispatches the other child streams
//! to their sinks.

use std::collections::VecDeque;
use std::time::Instant;

use regex::Regex;

use crate::config::ExpectedSize;
use crate::line_splitter::{Delimiter, LineSplitter};
use crate::status::StatusRecord;

const WINDOW_SAMPLES: usize = 12;
const MIB: f64 = (1u64 << 20) as f64;

/// Which child stream a descriptor carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    CopierStatus,
    CopierPid,
    RelayStderr,
    ExpectedSize,
    ChildOther,
}

#[derive(Debug, Clone, Copy)]
pub struct ThroughputSample {
    pub at: Instant,
    pub bytes: u64,
}

/// Owns one line splitter per source stream plus the sliding throughput
/// window and the fields it mutates on a [`StatusRecord`].
pub struct ProgressParser {
    splitters: Vec<(StreamTag, LineSplitter)>,
    samples: VecDeque<ThroughputSample>,
    copier_pid: Option<u32>,
    /// `None` means the expected size is unknown (or "custom" and not yet
    /// reported); `Some(n)` is the exact byte count, not rounded to MiB.
    expected_bytes: Option<u64>,
    listen_port_re: Regex,
    connected_re: Regex,
    status_bytes_re: Regex,
    secondary_log: Vec<String>,
}

impl ProgressParser {
    pub fn new(expected_size: ExpectedSize) -> Self {
        let tags = [
            StreamTag::CopierStatus,
            StreamTag::CopierPid,
            StreamTag::RelayStderr,
            StreamTag::ExpectedSize,
            StreamTag::ChildOther,
        ];
        let splitters = tags
            .iter()
            .map(|&tag| {
                let delim = match tag {
                    StreamTag::CopierStatus => Delimiter::Keep,
                    _ => Delimiter::Strip,
                };
                (tag, LineSplitter::new(delim))
            })
            .collect();

        let expected_bytes = match expected_size {
            ExpectedSize::FixedMiB(mib) => Some(mib * (1 << 20)),
            ExpectedSize::Unknown | ExpectedSize::Custom => None,
        };

        ProgressParser {
            splitters,
            samples: VecDeque::with_capacity(WINDOW_SAMPLES),
            copier_pid: None,
            expected_bytes,
            listen_port_re: Regex::new(r"listening on port (\d+)").unwrap(),
            connected_re: Regex::new(r"\bconnected\b").unwrap(),
            status_bytes_re: Regex::new(r"(\d+)\s*bytes").unwrap(),
            secondary_log: Vec::new(),
        }
    }

    fn splitter_mut(&mut self, tag: StreamTag) -> &mut LineSplitter {
        &mut self
            .splitters
            .iter_mut()
            .find(|(t, _)| *t == tag)
            .expect("all stream tags are preregistered")
            .1
    }

    /// Pushes bytes read from `tag`'s descriptor, dispatching every
    /// complete line to its handler and mutating `status` as needed.
    pub fn push(&mut self, tag: StreamTag, bytes: &[u8], status: &mut StatusRecord) {
        let lines = self.splitter_mut(tag).push(bytes);
        for line in lines {
            self.handle_line(tag, &line, status);
        }
    }

    /// Forces every line splitter to emit its buffered tail. Called before
    /// shutdown so no trailing unterminated line is lost.
    pub fn flush_all(&mut self, status: &mut StatusRecord) {
        let tags: Vec<StreamTag> = self.splitters.iter().map(|(t, _)| *t).collect();
        for tag in tags {
            let line = self.splitter_mut(tag).close();
            if let Some(line) = line {
                self.handle_line(tag, &line, status);
            }
        }
    }

    fn handle_line(&mut self, tag: StreamTag, line: &str, status: &mut StatusRecord) {
        match tag {
            StreamTag::CopierStatus => {
                if let Some(caps) = self.status_bytes_re.captures(line) {
                    if let Ok(bytes) = caps[1].parse::<u64>() {
                        record_sample(&mut self.samples, bytes);
                        apply_progress(&self.samples, self.expected_bytes, status);
                    }
                }
            }
            StreamTag::CopierPid => {
                if let Ok(pid) = line.trim().parse::<u32>() {
                    self.copier_pid = Some(pid);
                }
            }
            StreamTag::RelayStderr => {
                status.add_line(line);
                // Each fact is matched independently: a single line could
                // in principle announce both a port and a connection.
                if let Some(caps) = self.listen_port_re.captures(line) {
                    if let Ok(port) = caps[1].parse::<u32>() {
                        status.set_listen_port(port);
                    }
                }
                if self.connected_re.is_match(line) {
                    status.set_connected();
                }
            }
            StreamTag::ExpectedSize => {
                if let Ok(bytes) = line.trim().parse::<u64>() {
                    self.expected_bytes = Some(bytes);
                    // Recompute percent/ETA for the most recent sample now
                    // that the expected size is known.
                    if !self.samples.is_empty() {
                        apply_progress(&self.samples, self.expected_bytes, status);
                    }
                }
            }
            StreamTag::ChildOther => {
                self.secondary_log.push(line.to_string());
            }
        }
    }

    pub fn copier_pid(&self) -> Option<u32> {
        self.copier_pid
    }

    pub fn secondary_log(&self) -> &[String] {
        &self.secondary_log
    }

    /// Sends the "print your counters" signal to the recorded copier PID.
    /// Returns whether the PID was known (the caller rearms a 5s timer on
    /// success, 1s on failure).
    pub fn notify_copier(&self) -> bool {
        match self.copier_pid {
            Some(pid) => {
                // SIGUSR1 is the conventional "dump status now" signal for
                // bulk-copy tools that print periodic counters, the same
                // signal dd(1) itself answers with a progress report.
                unsafe { libc::kill(pid as libc::pid_t, libc::SIGUSR1) == 0 }
            }
            None => false,
        }
    }
}

fn record_sample(samples: &mut VecDeque<ThroughputSample>, bytes: u64) {
    samples.push_back(ThroughputSample {
        at: Instant::now(),
        bytes,
    });
    while samples.len() > WINDOW_SAMPLES {
        samples.pop_front();
    }
}

fn apply_progress(
    samples: &VecDeque<ThroughputSample>,
    expected_bytes: Option<u64>,
    status: &mut StatusRecord,
) {
    let last = *samples.back().expect("caller only calls with a non-empty window");
    let mbytes = last.bytes as f64 / MIB;

    let throughput = if samples.len() >= 2 {
        let first = samples.front().unwrap();
        let dt = (last.at - first.at).as_secs_f64();
        if dt > 0.0 {
            (last.bytes - first.bytes) as f64 / dt / MIB
        } else {
            0.0
        }
    } else {
        0.0
    };

    let (percent, eta) = match expected_bytes {
        Some(expected) if expected > 0 => {
            let percent = ((last.bytes as f64 / expected as f64) * 100.0).min(100.0);
            let eta = if samples.len() >= 2 && throughput > 0.0 {
                let remaining_mib = expected.saturating_sub(last.bytes) as f64 / MIB;
                (remaining_mib / throughput).max(0.0) as u64
            } else {
                0
            };
            (Some(percent.round() as u8), Some(eta))
        }
        _ => (None, None),
    };

    status.set_progress(mbytes, throughput, percent, eta);
}
