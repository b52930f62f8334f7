//! Per-loop poller over the OS readiness primitive.
//!
//! Each event loop owns one [`Poller`]. Interest management follows the
//! reactor's needs: connections are added read-only, promoted to
//! read-write while a write would block, demoted once the pending buffer
//! drains, and detached when ownership leaves the loop.
//!
//! Cross-thread work arrives through [`Notifier::trigger`]: the note goes
//! onto a mutex-guarded queue and a [`mio::Waker`] forces the next `wait`
//! to return immediately, so ticks, shutdown broadcasts and connection
//! hand-offs never depend on the target loop's own I/O being ready.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the waker; never assigned to a socket.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) struct Poller<N> {
    poll: Poll,
    waker: Arc<Waker>,
    notes: Arc<Mutex<Vec<N>>>,
}

impl<N: Send + 'static> Poller<N> {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            notes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// A cloneable, `Send` handle for triggering this loop from anywhere.
    pub(crate) fn notifier(&self) -> Notifier<N> {
        Notifier {
            waker: Arc::clone(&self.waker),
            notes: Arc::clone(&self.notes),
        }
    }

    pub(crate) fn add_read<S: Source + ?Sized>(&self, src: &mut S, token: Token) -> io::Result<()> {
        self.poll.registry().register(src, token, Interest::READABLE)
    }

    pub(crate) fn add_read_write<S: Source + ?Sized>(
        &self,
        src: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .register(src, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Demotes a read-write registration back to read-only.
    pub(crate) fn mod_read<S: Source + ?Sized>(&self, src: &mut S, token: Token) -> io::Result<()> {
        self.poll.registry().reregister(src, token, Interest::READABLE)
    }

    /// Promotes to read-write while a write would block.
    pub(crate) fn mod_read_write<S: Source + ?Sized>(
        &self,
        src: &mut S,
        token: Token,
    ) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(src, token, Interest::READABLE | Interest::WRITABLE)
    }

    /// Removes all interest, e.g. before the descriptor is handed to user
    /// code on detach or released on close.
    pub(crate) fn mod_detach<S: Source + ?Sized>(&self, src: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(src)
    }

    /// Blocks until readiness, a trigger, or `timeout`. Ready events land
    /// in `events`; queued notes are drained in one batch into `notes`.
    pub(crate) fn wait(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
        notes: &mut Vec<N>,
    ) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        let mut queue = self.notes.lock().unwrap();
        notes.append(&mut queue);
        Ok(())
    }
}

pub(crate) struct Notifier<N> {
    waker: Arc<Waker>,
    notes: Arc<Mutex<Vec<N>>>,
}

impl<N> Clone for Notifier<N> {
    fn clone(&self) -> Self {
        Self {
            waker: Arc::clone(&self.waker),
            notes: Arc::clone(&self.notes),
        }
    }
}

impl<N: Send> Notifier<N> {
    /// Enqueues `note` and wakes the owning loop. Safe from any thread.
    pub(crate) fn trigger(&self, note: N) -> io::Result<()> {
        self.notes.lock().unwrap().push(note);
        self.waker.wake()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn trigger_wakes_a_blocked_wait() {
        let mut poller: Poller<u32> = Poller::new().unwrap();
        let notifier = poller.notifier();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            notifier.trigger(7).unwrap();
        });

        let mut events = Events::with_capacity(8);
        let mut notes = Vec::new();
        let start = Instant::now();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)), &mut notes)
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(notes, vec![7]);
        handle.join().unwrap();
    }

    #[test]
    fn notes_drain_in_one_batch() {
        let mut poller: Poller<u32> = Poller::new().unwrap();
        let notifier = poller.notifier();
        notifier.trigger(1).unwrap();
        notifier.trigger(2).unwrap();
        notifier.trigger(3).unwrap();

        let mut events = Events::with_capacity(8);
        let mut notes = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(500)), &mut notes)
            .unwrap();
        assert_eq!(notes, vec![1, 2, 3]);
    }

    #[test]
    fn timeout_elapses_without_activity() {
        let mut poller: Poller<u32> = Poller::new().unwrap();
        let mut events = Events::with_capacity(8);
        let mut notes = Vec::new();
        poller
            .wait(&mut events, Some(Duration::from_millis(10)), &mut notes)
            .unwrap();
        assert!(notes.is_empty());
    }
}
