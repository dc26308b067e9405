//! Guest thread handles and host-scheduler blocking primitives.
//!
//! Every guest CPU thread of the emulated system runs on one dedicated host thread and
//! executes its syscalls synchronously. The synchronization subsystem never owns these
//! threads - it holds [`GuestThread`] handles by reference (`Arc`) while their lifetime is
//! governed by the CPU execution engine.
//!
//! # Architecture
//!
//! A [`GuestThread`] carries:
//!
//! - A stable identity ([`ThreadId`]) and scheduling priority (lower value = higher
//!   priority, following the guest kernel's convention).
//! - A [`ThreadFlags`] bitset guarded by a host mutex and paired with a host condvar.
//!   This pair is the "futex" of the subsystem: [`GuestThread::awake`] sets the wake
//!   condition and notifies, [`GuestThread::block_until_woken`] blocks the host thread
//!   until a signal, a process stop, or a deadline - it never spins.
//! - A result register mirroring the guest register a syscall's result is written to.
//! - A resume scratch word used to freeze an in-flight wait across a savestate boundary.
//!
//! # Wake protocol
//!
//! Wake outcomes are checked in a fixed order on every wake-up: a pending signal wins
//! over a process stop, which wins over an elapsed deadline. This ordering is what lets
//! a wait distinguish "signaled just before the snapshot" from "captured mid-wait".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use bitflags::bitflags;

/// Stable identity of a guest thread.
///
/// Identities are assigned by the CPU execution engine and are never reused while the
/// thread is referenced by any wait queue. They compare by value; scheduling order among
/// equal-priority threads is determined by queue position, not by id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Creates a thread id from its raw numeric value.
    #[must_use]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw numeric value of this id.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

bitflags! {
    /// State-flag bitset of a guest thread.
    ///
    /// Mirrors the guest CPU state flags the synchronization subsystem reads and writes.
    /// The flags are guarded by the thread's internal lock; they are not independently
    /// atomic.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread is parked on a wait queue.
        const WAIT = 1 << 0;
        /// The thread's wake condition has been set and not yet consumed.
        const SIGNAL = 1 << 1;
        /// The process is stopping (e.g. for a savestate snapshot).
        const STOP = 1 << 2;
        /// The thread suspended a syscall mid-execution; it must be re-entered
        /// identically after restore instead of being scheduled.
        const INCOMPLETE_SYSCALL = 1 << 3;
        /// The thread is leaving guest execution (process teardown).
        const EXIT = 1 << 4;
    }
}

/// Why [`GuestThread::block_until_woken`] returned.
///
/// Outcomes are prioritized: a pending signal is always reported before a stop, and a
/// stop before an elapsed deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeEvent {
    /// The wake condition was set (and has been consumed).
    Signaled,
    /// The process is stopping or the thread is exiting; the wake condition is untouched.
    Stopped,
    /// The deadline elapsed before any signal arrived.
    TimerFired,
}

/// Handle to one guest CPU thread, mapped to one host thread.
///
/// The synchronization primitives reference guest threads through `Arc<GuestThread>`;
/// ownership of the underlying execution context stays with the CPU engine.
///
/// # Example
///
/// ```rust
/// use guestsync::{GuestThread, ThreadFlags, ThreadId, WakeEvent};
///
/// let thread = GuestThread::new(ThreadId::new(1), 1000);
/// thread.awake();
/// assert_eq!(thread.block_until_woken(None), WakeEvent::Signaled);
/// assert!(!thread.has_flag(ThreadFlags::SIGNAL));
/// ```
#[derive(Debug)]
pub struct GuestThread {
    /// Unique identifier for this thread.
    id: ThreadId,

    /// Guest scheduling priority; lower value = higher priority.
    priority: u32,

    /// Current state flags, guarded together with the wake channel.
    state: Mutex<ThreadFlags>,

    /// Wake channel; notified whenever `state` gains a flag another party may block on.
    wake: Condvar,

    /// Syscall result register.
    result: AtomicU64,

    /// Packed mid-wait resume state (see [`crate::sync`] wait documentation).
    resume: AtomicU64,

    /// Set between savestate restore and the first re-entry of the suspended syscall.
    from_savestate: AtomicBool,
}

impl GuestThread {
    /// Creates a new guest thread handle.
    ///
    /// # Arguments
    ///
    /// * `id` - Stable identity assigned by the CPU engine
    /// * `priority` - Guest scheduling priority (lower value = higher priority)
    #[must_use]
    pub fn new(id: ThreadId, priority: u32) -> Self {
        Self {
            id,
            priority,
            state: Mutex::new(ThreadFlags::empty()),
            wake: Condvar::new(),
            result: AtomicU64::new(0),
            resume: AtomicU64::new(0),
            from_savestate: AtomicBool::new(false),
        }
    }

    /// Returns this thread's identity.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns this thread's guest scheduling priority (lower value = higher priority).
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Returns a snapshot of the current state flags.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        *self.state.lock().expect("guest thread state lock poisoned")
    }

    /// Checks whether all flags in `flag` are currently set.
    #[must_use]
    pub fn has_flag(&self, flag: ThreadFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Sets the given flags and notifies any blocked waiter.
    pub fn add_flags(&self, flags: ThreadFlags) {
        let mut state = self.state.lock().expect("guest thread state lock poisoned");
        state.insert(flags);
        self.wake.notify_all();
    }

    /// Clears the given flags.
    pub fn remove_flags(&self, flags: ThreadFlags) {
        let mut state = self.state.lock().expect("guest thread state lock poisoned");
        state.remove(flags);
    }

    /// Writes the syscall result register.
    pub fn set_result(&self, value: u64) {
        self.result.store(value, Ordering::Relaxed);
    }

    /// Reads the syscall result register.
    #[must_use]
    pub fn result(&self) -> u64 {
        self.result.load(Ordering::Relaxed)
    }

    /// Writes the mid-wait resume scratch word.
    pub fn set_resume(&self, value: u64) {
        self.resume.store(value, Ordering::Relaxed);
    }

    /// Reads the mid-wait resume scratch word.
    #[must_use]
    pub fn resume(&self) -> u64 {
        self.resume.load(Ordering::Relaxed)
    }

    /// Marks this thread as restored mid-syscall from a savestate.
    ///
    /// The next syscall re-entry observes the flag exactly once via
    /// [`take_savestate`](Self::take_savestate) and uses `resume` to re-attach to the
    /// correct wait queue without re-running the wait preamble.
    pub fn begin_replay(&self, resume: u64) {
        self.set_resume(resume);
        self.from_savestate.store(true, Ordering::Release);
        self.add_flags(ThreadFlags::INCOMPLETE_SYSCALL);
    }

    /// Consumes the savestate-replay marker.
    ///
    /// Returns `true` exactly once after [`begin_replay`](Self::begin_replay); the
    /// incomplete-syscall, stop and exit flags are cleared at the same time so the
    /// replayed wait starts from a clean wake channel.
    pub fn take_savestate(&self) -> bool {
        if self.from_savestate.swap(false, Ordering::AcqRel) {
            self.remove_flags(
                ThreadFlags::INCOMPLETE_SYSCALL | ThreadFlags::STOP | ThreadFlags::EXIT,
            );
            true
        } else {
            false
        }
    }

    /// Sets the wake condition and requests the host scheduler resume this thread.
    ///
    /// Idempotent: waking an already-signaled or running thread has no further effect.
    pub fn awake(&self) {
        let mut state = self.state.lock().expect("guest thread state lock poisoned");
        state.remove(ThreadFlags::WAIT);
        state.insert(ThreadFlags::SIGNAL);
        self.wake.notify_all();
    }

    /// Requests a process stop (e.g. ahead of a savestate snapshot).
    ///
    /// Blocked waits observe [`WakeEvent::Stopped`] and run their capture protocol.
    pub fn stop(&self) {
        self.add_flags(ThreadFlags::STOP);
    }

    /// Blocks the calling host thread until woken, stopped, or past `deadline`.
    ///
    /// This is a genuine blocking wait on a host condvar - no spinning. Outcomes are
    /// checked in priority order on every wake-up:
    ///
    /// 1. [`WakeEvent::Signaled`] if the wake condition is set (consumes it)
    /// 2. [`WakeEvent::Stopped`] if a stop or exit is pending (left set)
    /// 3. [`WakeEvent::TimerFired`] if `deadline` has passed
    ///
    /// # Arguments
    ///
    /// * `deadline` - Absolute wake-up time, or `None` for an unbounded wait
    pub fn block_until_woken(&self, deadline: Option<Instant>) -> WakeEvent {
        let mut state = self.state.lock().expect("guest thread state lock poisoned");
        loop {
            if state.contains(ThreadFlags::SIGNAL) {
                state.remove(ThreadFlags::SIGNAL);
                return WakeEvent::Signaled;
            }
            if state.intersects(ThreadFlags::STOP | ThreadFlags::EXIT) {
                return WakeEvent::Stopped;
            }
            match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return WakeEvent::TimerFired;
                    }
                    state = self
                        .wake
                        .wait_timeout(state, at - now)
                        .expect("guest thread state lock poisoned")
                        .0;
                }
                None => {
                    state = self
                        .wake
                        .wait(state)
                        .expect("guest thread state lock poisoned");
                }
            }
        }
    }
}
