// This file is part of the impexpd disk-transfer supervisor.
//
// For the full copyright and license information, please view the LICENSE
// file that was distributed with this source code.

//! Signal Bridge (C4): installs handlers for SIGINT/SIGTERM using the
//! self-pipe pattern (`signal_hook::low_level::pipe`), so the event loop
//! (C6) can treat "a signal arrived" as just another readable descriptor
//! instead of racing against `poll`'s EINTR. A second, independent
//! registration (`signal_hook::flag::register_usize`) records which signal
//! fired, mirroring how `dd(1)` latches its own SIGUSR1 into an
//! `AtomicUsize` (see `gen_prog_updater` in `dd.rs`).

use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;

/// Installed after the child's process group is established, so a signal
/// arriving during setup can't race ahead of the `kill` target.
pub struct SignalBridge {
    read_end: UnixStream,
    ids: Vec<SigId>,
    last_signum: Arc<AtomicUsize>,
}

impl SignalBridge {
    pub fn install() -> std::io::Result<Self> {
        let (read_end, write_end) = UnixStream::pair()?;
        read_end.set_nonblocking(true)?;

        let last_signum = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::with_capacity(4);

        for &sig in &[SIGINT, SIGTERM] {
            ids.push(pipe::register(sig, write_end.try_clone()?)?);
            ids.push(signal_hook::flag::register_usize(
                sig,
                last_signum.clone(),
                sig as usize,
            )?);
        }

        Ok(SignalBridge {
            read_end,
            ids,
            last_signum,
        })
    }

    pub fn fileno(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Drains the wakeup byte(s) and returns the tracked signal number that
    /// had in fact been raised since the last `clear`, if any. Correct
    /// ordering: clear the pipe first, then consume the flag, matching
    /// `signal_hook::low_level::pipe`'s documented race-avoidance recipe.
    /// The caller (the event loop) acts as the forward callback: it relays
    /// the returned signal number to the child group.
    pub fn clear(&mut self) -> Option<i32> {
        let mut buf = [0u8; 64];
        loop {
            match self.read_end.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let signum = self.last_signum.swap(0, Ordering::SeqCst);
        if signum == 0 {
            None
        } else {
            Some(signum as i32)
        }
    }

    /// Restores the default handlers. Called during cleanup so a second
    /// Ctrl-C after we've already started shutting down behaves normally.
    pub fn reset(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
