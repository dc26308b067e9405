//! Waiter-queue scheduling shared by every kernel synchronization object.
//!
//! Both the mutex and the condition variable park waiting guest threads on an ordered
//! [`WaitQueue`] and pick the next thread to run with [`WaitQueue::schedule`], which
//! applies the object's queuing [`Protocol`]. The queue itself is policy-free storage;
//! the policy is supplied per call because a condition variable always drains with its
//! *bound mutex's* protocol, not its own.
//!
//! # Eligibility
//!
//! A thread that marked itself [`ThreadFlags::INCOMPLETE_SYSCALL`] has frozen its wait
//! for a savestate capture and is invisible to scheduling: [`WaitQueue::schedule`]
//! reports [`Scheduled::Interrupted`] without touching the queue, and the caller
//! special-cases the whole operation (see the module docs of [`crate::sync`]).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::thread::{GuestThread, ThreadFlags, ThreadId};

/// Queuing/fairness policy governing wake order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// Waiters are woken in submission order.
    Fifo,
    /// The highest-priority runnable waiter is woken first; ties broken by
    /// submission order.
    Priority,
}

impl Protocol {
    /// Encodes the protocol as a single byte (savestate field).
    #[must_use]
    pub fn as_raw(self) -> u8 {
        match self {
            Protocol::Fifo => 0,
            Protocol::Priority => 1,
        }
    }

    /// Decodes a protocol byte; `None` for unknown values.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Protocol::Fifo),
            1 => Some(Protocol::Priority),
            _ => None,
        }
    }
}

/// Outcome of a scheduling decision on a [`WaitQueue`].
#[derive(Clone, Debug)]
pub enum Scheduled {
    /// The next eligible waiter, removed from the queue.
    Next(Arc<GuestThread>),
    /// The selected candidate is frozen mid-savestate-capture; the queue was left
    /// untouched and the calling operation must suspend itself instead.
    Interrupted,
    /// No thread is queued.
    Empty,
}

/// Ordered queue of waiting guest threads.
///
/// Guest threads are referenced, never owned; their lifetime is governed by the CPU
/// execution engine. The queue is always mutated under the owning object's lock.
#[derive(Debug, Default)]
pub struct WaitQueue {
    queue: VecDeque<Arc<GuestThread>>,
}

impl WaitQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued threads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Checks whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Appends a thread at the tail of the queue.
    pub fn append(&mut self, thread: Arc<GuestThread>) {
        self.queue.push_back(thread);
    }

    /// Checks whether a thread with the given id is queued.
    #[must_use]
    pub fn contains(&self, id: ThreadId) -> bool {
        self.queue.iter().any(|t| t.id() == id)
    }

    /// Returns the queued thread with the given id, if present.
    #[must_use]
    pub fn find(&self, id: ThreadId) -> Option<&Arc<GuestThread>> {
        self.queue.iter().find(|t| t.id() == id)
    }

    /// Iterates over queued threads in submission order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<GuestThread>> {
        self.queue.iter()
    }

    /// Index of the thread `protocol` would pick next, if any.
    fn pick(&self, protocol: Protocol) -> Option<usize> {
        match protocol {
            Protocol::Fifo => {
                if self.queue.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
            Protocol::Priority => {
                // Stable min: first occurrence wins ties, preserving submission order
                let mut best: Option<usize> = None;
                for (idx, thread) in self.queue.iter().enumerate() {
                    match best {
                        Some(b) if self.queue[b].priority() <= thread.priority() => {}
                        _ => best = Some(idx),
                    }
                }
                best
            }
        }
    }

    /// Returns the thread the given protocol would schedule next without removing it.
    #[must_use]
    pub fn peek(&self, protocol: Protocol) -> Option<&Arc<GuestThread>> {
        self.pick(protocol).map(|idx| &self.queue[idx])
    }

    /// Checks whether the next scheduling decision would hit a frozen thread.
    #[must_use]
    pub fn interrupted_next(&self, protocol: Protocol) -> bool {
        self.peek(protocol)
            .is_some_and(|t| t.has_flag(ThreadFlags::INCOMPLETE_SYSCALL))
    }

    /// Removes and returns the next eligible waiter per `protocol`.
    ///
    /// If the selected candidate is frozen for a savestate capture, the queue is left
    /// untouched and [`Scheduled::Interrupted`] is returned; the caller must suspend
    /// the whole operation rather than skip the thread.
    pub fn schedule(&mut self, protocol: Protocol) -> Scheduled {
        match self.pick(protocol) {
            None => Scheduled::Empty,
            Some(idx) => {
                if self.queue[idx].has_flag(ThreadFlags::INCOMPLETE_SYSCALL) {
                    return Scheduled::Interrupted;
                }
                let thread = self
                    .queue
                    .remove(idx)
                    .expect("scheduled index vanished from wait queue");
                Scheduled::Next(thread)
            }
        }
    }

    /// Removes a specific thread if present; returns whether it was found.
    ///
    /// Used for targeted wake (`signal_to`) and for timeout-driven self-cancellation.
    pub fn unqueue(&mut self, id: ThreadId) -> bool {
        if let Some(idx) = self.queue.iter().position(|t| t.id() == id) {
            self.queue.remove(idx);
            true
        } else {
            false
        }
    }
}

/// What a suspended syscall finds in the thread's resume word when re-issued.
///
/// Packed into the resume scratch word across a savestate. A syscall that aborted in
/// its preamble because a scheduling decision hit a frozen thread has mutated nothing
/// and must restart from scratch; a wait captured while parked re-attaches to the
/// queue it was on. The two cases are distinguished by a marker bit so a stale word
/// can never be mistaken for mid-wait state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeWait {
    /// The syscall suspended before touching any queue or ownership state; re-entry
    /// runs the full preamble as if called fresh.
    Restart,
    /// The syscall was captured mid-wait and re-attaches where it left off.
    MidWait {
        /// True if the waiter had already been moved to the mutex queue by a signal.
        on_mutex_queue: bool,
        /// Recursion depth released on entry, restored when the wait completes.
        lock_count: u32,
    },
}

/// Marker bit distinguishing a captured wait from a preamble abort.
const MID_WAIT: u64 = 1 << 1;

impl ResumeWait {
    /// Packs into a resume word.
    #[must_use]
    pub fn pack(self) -> u64 {
        match self {
            ResumeWait::Restart => 0,
            ResumeWait::MidWait {
                on_mutex_queue,
                lock_count,
            } => MID_WAIT | u64::from(on_mutex_queue) | (u64::from(lock_count) << 32),
        }
    }

    /// Unpacks from a resume word.
    #[must_use]
    pub fn unpack(raw: u64) -> Self {
        if raw & MID_WAIT == 0 {
            ResumeWait::Restart
        } else {
            ResumeWait::MidWait {
                on_mutex_queue: raw & 1 != 0,
                lock_count: (raw >> 32) as u32,
            }
        }
    }
}

/// Suspends the calling syscall for savestate capture.
///
/// Records `resume` and marks the thread incomplete; the engine re-issues the same
/// syscall exactly once after restore. Callers that claim a queue position in `resume`
/// must invoke this while still holding the lock that proves the claim, so no
/// scheduler can move the thread between the check and the freeze.
pub fn suspend(thread: &GuestThread, resume: ResumeWait) {
    thread.set_resume(resume.pack());
    thread.add_flags(ThreadFlags::INCOMPLETE_SYSCALL | ThreadFlags::EXIT);
}

/// Marks `thread` as waiting and arms its wake-up deadline.
///
/// Returns the absolute deadline for `timeout_us` microseconds from now, or `None` for
/// an unbounded wait (`timeout_us == 0`). The actual suspension happens in
/// [`GuestThread::block_until_woken`], which blocks the host thread without spinning.
pub fn sleep(thread: &GuestThread, timeout_us: u64) -> Option<Instant> {
    thread.add_flags(ThreadFlags::WAIT);
    if timeout_us == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_micros(timeout_us))
    }
}
