// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Event Loop (C6): owns the descriptor set, multiplexes reads with a
//! computed timeout, drives the connect-timeout and shutdown-linger state
//! machine, periodically pokes the copier for fresh statistics, and
//! propagates bytes from source descriptors into the progress parser (C3).

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::info;

use crate::child::ChildSupervisor;
use crate::progress::{ProgressParser, StreamTag};
use crate::signals::SignalBridge;
use crate::status::StatusWriter;

/// The standard linger budget between SIGTERM and escalating to SIGKILL.
pub const LINGER: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 1024;

/// One entry in the descriptor map: a raw fd plus the stream tag that
/// routes its bytes into the progress parser. The wakeup descriptor has
/// no stream tag and is handled specially by the loop.
enum Source {
    Data { fd: RawFd, tag: StreamTag },
    Wakeup { fd: RawFd },
}

impl Source {
    fn fd(&self) -> RawFd {
        match self {
            Source::Data { fd, .. } => *fd,
            Source::Wakeup { fd } => *fd,
        }
    }
}

/// Drives the import/export side's supervision loop. Borrows everything it
/// mutates rather than owning it, so `main` retains the pieces it needs for
/// final cleanup (status flush, child reap).
pub struct EventLoop<'a> {
    sources: Vec<Source>,
    signal_bridge: &'a mut SignalBridge,
    progress: &'a mut ProgressParser,
    status: &'a mut StatusWriter,
    child: &'a ChildSupervisor,
    connect_timeout: Duration,

    listen_deadline: Option<Instant>,
    exit_deadline: Option<Instant>,
    stats_deadline: Instant,
}

/// Why the loop returned. "Normal termination" here means all data
/// descriptors hit EOF, which is not the same thing as the child having
/// been reaped.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// Every data descriptor EOF'd while we were not already in the
    /// exit-timeout (linger) phase. The caller still must `wait()` the
    /// child; it just doesn't need to `force_quit()` first.
    AllPipesClosed,
    /// The linger deadline elapsed without the child dying (or we were
    /// already waiting it out when the pipes closed). The caller should
    /// escalate with `force_quit`.
    ExitTimeoutElapsed,
}

impl<'a> EventLoop<'a> {
    pub fn new(
        data_fds: Vec<(RawFd, StreamTag)>,
        wakeup_fd: RawFd,
        signal_bridge: &'a mut SignalBridge,
        progress: &'a mut ProgressParser,
        status: &'a mut StatusWriter,
        child: &'a ChildSupervisor,
        connect_timeout: Duration,
        is_import: bool,
    ) -> nix::Result<Self> {
        let mut sources: Vec<Source> = data_fds
            .into_iter()
            .map(|(fd, tag)| Source::Data { fd, tag })
            .collect();
        sources.push(Source::Wakeup { fd: wakeup_fd });

        for source in &sources {
            set_nonblocking(source.fd())?;
        }

        let listen_deadline = if is_import && !connect_timeout.is_zero() {
            Some(Instant::now() + connect_timeout)
        } else {
            None
        };

        Ok(EventLoop {
            sources,
            signal_bridge,
            progress,
            status,
            child,
            connect_timeout,
            listen_deadline,
            exit_deadline: None,
            // Fire the first stats poke immediately.
            stats_deadline: Instant::now(),
        })
    }

    /// Runs until the loop terminates.
    pub fn run(&mut self) -> LoopExit {
        loop {
            if self.only_wakeup_remains() {
                return LoopExit::AllPipesClosed;
            }

            let mut timeout = Duration::from_secs(3600);

            if self.exit_deadline.is_none() {
                if self.status.record().connected() {
                    self.listen_deadline = None;
                } else if let Some(deadline) = self.listen_deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        self.on_connect_timeout();
                    } else {
                        timeout = timeout.min(Duration::from_secs(1));
                    }
                }
            }

            if let Some(deadline) = self.exit_deadline {
                let now = Instant::now();
                if now >= deadline {
                    info!("child didn't exit in time, giving up on a clean shutdown");
                    return LoopExit::ExitTimeoutElapsed;
                }
                timeout = timeout.min(deadline - now);
            }

            let now = Instant::now();
            if now >= self.stats_deadline {
                let rearm = if self.progress.notify_copier() {
                    Duration::from_secs(5)
                } else {
                    Duration::from_secs(1)
                };
                self.stats_deadline = now + rearm;
            }
            timeout = timeout.min(
                self.stats_deadline
                    .saturating_duration_since(Instant::now()),
            );

            self.poll_once(timeout);
            self.progress.flush_all(self.status.record_mut());
        }
    }

    fn only_wakeup_remains(&self) -> bool {
        self.sources
            .iter()
            .all(|s| matches!(s, Source::Wakeup { .. }))
    }

    fn on_connect_timeout(&mut self) {
        let secs = self.connect_timeout.as_secs();
        self.status.record_mut().add_line(format!(
            "Child process didn't establish connection in time ({secs}s), sending SIGTERM"
        ));
        let _ = self.status.flush(true);
        self.child.kill(libc::SIGTERM);
        self.exit_deadline = Some(Instant::now() + LINGER);
        self.listen_deadline = None;
    }

    fn poll_once(&mut self, timeout: Duration) {
        // Build the PollFd array fresh each iteration: `sources` shrinks
        // as descriptors hit EOF, and nix's PollFd borrows can't outlive
        // this call anyway.
        let borrowed: Vec<BorrowedFd> = self
            .sources
            .iter()
            .map(|s| unsafe { BorrowedFd::borrow_raw(s.fd()) })
            .collect();
        let mut pollfds: Vec<PollFd> = borrowed
            .iter()
            .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
            .collect();

        let poll_timeout = PollTimeout::try_from(timeout.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(PollTimeout::MAX);

        let ready = loop {
            match poll(&mut pollfds, poll_timeout) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {
                    // Retry-on-signal idiom: EINTR here means "nothing is
                    // ready yet", not an error. The wakeup descriptor is
                    // the only legitimate wake condition for a signal.
                    continue;
                }
                Err(_) => break 0,
            }
        };
        if ready <= 0 {
            return;
        }

        let mut to_remove = Vec::new();
        for (idx, pollfd) in pollfds.iter().enumerate() {
            let revents = pollfd.revents().unwrap_or(PollFlags::empty());
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                to_remove.push(idx);
                continue;
            }
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            let is_eof = match &self.sources[idx] {
                Source::Data { fd, tag } => {
                    let tag = *tag;
                    let fd = *fd;
                    self.read_data(fd, tag)
                }
                Source::Wakeup { fd } => {
                    let fd = *fd;
                    self.drain_wakeup(fd);
                    false
                }
            };
            if is_eof {
                to_remove.push(idx);
            }
        }

        for idx in to_remove.into_iter().rev() {
            let removed = self.sources.remove(idx);
            unsafe {
                libc::close(removed.fd());
            }
        }
    }

    /// Reads up to 1 KiB so a single busy source can't starve the others.
    /// Returns whether the descriptor hit EOF.
    fn read_data(&mut self, fd: RawFd, tag: StreamTag) -> bool {
        let mut buf = [0u8; READ_CHUNK];
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match nix::unistd::read(borrowed.as_raw_fd(), &mut buf) {
            Ok(0) => true,
            Ok(n) => {
                self.progress.push(tag, &buf[..n], self.status.record_mut());
                false
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => false,
            Err(_) => true,
        }
    }

    fn drain_wakeup(&mut self, fd: RawFd) {
        let _ = fd;
        if let Some(signum) = self.signal_bridge.clear() {
            info!("received signal {signum}, forwarding to child process group");
            self.child.kill(signum);
            if self.exit_deadline.is_none() {
                // We just relayed the signal to the child group; give it
                // linger-time to die before escalating to SIGKILL.
                self.exit_deadline = Some(Instant::now() + LINGER);
            } else {
                let remaining = self
                    .exit_deadline
                    .unwrap()
                    .saturating_duration_since(Instant::now());
                info!("already in exit-timeout, {:.1}s remaining", remaining.as_secs_f64());
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let flags = fcntl(borrowed, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(borrowed, FcntlArg::F_SETFL(flags))?;
    Ok(())
}
