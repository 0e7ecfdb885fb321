//! Worker-side signal plumbing
//!
//! Workers take signals through a signalfd registered with the reactor, so
//! delivery is just another readable event and no async-signal-safe handler
//! code exists in the worker at all. TERM/INT flip the loop's running flag;
//! HUP is a no-op in workers (reload is master-only); PIPE is blocked so
//! writes to dead sockets surface as EPIPE errors instead of killing the
//! process.

use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::error::Result;

/// Blocks the handled signals for this process and returns a non-blocking
/// signalfd carrying them. Must be called before the worker loop starts so
/// no delivery races the mask.
pub fn worker_signalfd() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGPIPE);
    mask.thread_block()?;

    let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
    Ok(sfd)
}

/// Interprets one signalfd record: `true` means keep running.
pub fn keep_running(signo: i32) -> bool {
    !matches!(
        Signal::try_from(signo),
        Ok(Signal::SIGTERM) | Ok(Signal::SIGINT)
    )
}

#[cfg(test)]
mod test {
    use nix::sys::signal::Signal;

    use super::keep_running;

    #[test]
    fn term_and_int_stop_the_loop() {
        assert!(!keep_running(Signal::SIGTERM as i32));
        assert!(!keep_running(Signal::SIGINT as i32));
        assert!(keep_running(Signal::SIGHUP as i32));
    }
}
