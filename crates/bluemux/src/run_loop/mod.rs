//! Single-threaded cooperative run loop
//!
//! One iteration computes the earliest timer deadline, blocks on a
//! [`DataSource`] until that deadline or until data is ready, services the
//! ready I/O and then every expired timer in deadline order. Callbacks run to
//! completion; nothing is preempted.
//!
//! Timers carry a typed event instead of a function pointer so the owner of
//! the run loop can dispatch them with full access to its own state.

use log::trace;
use std::fmt;
use std::io;
use std::time::{Duration, Instant};

#[cfg(test)]
mod tests;

/// Identifies a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Something the run loop can block on
pub trait DataSource {
    /// Block until data is ready or `timeout` elapses (`None` waits forever).
    ///
    /// Returns whether data is ready.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool>;
}

struct Timer<E> {
    id: TimerId,
    deadline: Instant,
    event: E,
}

/// Deadline-ordered timer list plus the loop that drives it
pub struct RunLoop<E> {
    /// Sorted by deadline; equal deadlines keep insertion order
    timers: Vec<Timer<E>>,
    next_id: u64,
}

impl<E> Default for RunLoop<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> RunLoop<E> {
    /// Create an empty run loop
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }

    /// Schedule `event` to fire `timeout` from now
    pub fn add_timer(&mut self, timeout: Duration, event: E) -> TimerId {
        self.add_timer_at(Instant::now() + timeout, event)
    }

    /// Schedule `event` to fire at `deadline`
    pub fn add_timer_at(&mut self, deadline: Instant, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        let position = self.timers.partition_point(|timer| timer.deadline <= deadline);
        self.timers.insert(position, Timer { id, deadline, event });
        trace!("added {} ({} pending)", id, self.timers.len());
        id
    }

    /// Cancel a timer
    ///
    /// Returns whether the timer was still pending. Removing a timer that has
    /// fired or was already removed does nothing.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|timer| timer.id == id) {
            Some(index) => {
                self.timers.remove(index);
                trace!("removed {}", id);
                true
            }
            None => false,
        }
    }

    /// Whether a timer is still pending
    pub fn contains(&self, id: TimerId) -> bool {
        self.timers.iter().any(|timer| timer.id == id)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|timer| timer.deadline)
    }

    /// How long a blocking wait starting at `now` may last
    pub fn timeout_at(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Marker separating timers that exist now from timers added later
    pub fn barrier(&self) -> u64 {
        self.next_id
    }

    /// Remove and return the earliest timer that expired by `now` and was
    /// scheduled before `barrier`
    pub fn next_expired(&mut self, now: Instant, barrier: u64) -> Option<(TimerId, E)> {
        let index = self
            .timers
            .iter()
            .take_while(|timer| timer.deadline <= now)
            .position(|timer| timer.id.0 < barrier)?;
        let timer = self.timers.remove(index);
        trace!("{} expired", timer.id);
        Some((timer.id, timer.event))
    }

    /// Fire every timer that expired by `now`, in deadline order
    ///
    /// The handler may add and remove timers. Timers added while processing
    /// fire no earlier than the next call. Returns the number fired.
    pub fn process_timers<F>(&mut self, now: Instant, mut handler: F) -> usize
    where
        F: FnMut(&mut Self, TimerId, E),
    {
        let barrier = self.barrier();
        let mut fired = 0;
        while let Some((id, event)) = self.next_expired(now, barrier) {
            handler(self, id, event);
            fired += 1;
        }
        fired
    }

    /// Run one iteration against `source`
    ///
    /// Blocks until the earliest deadline or until the source is ready, calls
    /// `on_ready` if it is, then fires expired timers through `on_timer`.
    pub fn run_once<S, R, T>(&mut self, source: &mut S, mut on_ready: R, on_timer: T) -> io::Result<usize>
    where
        S: DataSource,
        R: FnMut(&mut S, &mut Self),
        T: FnMut(&mut Self, TimerId, E),
    {
        let timeout = self.timeout_at(Instant::now());
        if source.wait(timeout)? {
            on_ready(source, self);
        }
        Ok(self.process_timers(Instant::now(), on_timer))
    }
}

impl<E> fmt::Debug for RunLoop<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("pending_timers", &self.timers.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}
