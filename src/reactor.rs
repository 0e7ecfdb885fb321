//! Readiness multiplexer wrapping `mio::Poll`
//!
//! One reactor per worker. Registration is keyed by `Token`; the worker owns
//! the mapping from tokens to connections (a slab), so handler dispatch is
//! an index lookup rather than a stored callback. Client and upstream
//! sockets are registered edge-triggered by mio, which is why every handler
//! drains its descriptor until would-block.

use std::io::{self, ErrorKind};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

/// Poll wrapper with the add/modify/delete surface the worker needs.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
}

impl Reactor {
    /// Creates the underlying poll instance.
    pub fn new() -> io::Result<Self> {
        Ok(Reactor { poll: Poll::new()? })
    }

    /// The registry, for call sites that register on behalf of the worker
    /// (e.g. the proxy attaching an upstream socket mid-dispatch).
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Registers `source` for `interest` under `token`.
    pub fn add<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Changes the interest set of an already-registered source.
    pub fn modify<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Removes a source from the poll set.
    pub fn delete<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Waits up to `timeout` for events. Interrupted waits retry; the caller
    /// sees either a filled (possibly empty) event set or a hard error.
    pub fn poll(&mut self, events: &mut Events, timeout: Duration) -> io::Result<()> {
        loop {
            match self.poll.poll(events, Some(timeout)) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
