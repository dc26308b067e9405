//! Guest-kernel synchronization primitives: mutex, condition variable and the waiter
//! queue scheduler underneath both.
//!
//! # Architecture
//!
//! Every blocking syscall follows the same shape: a lock-free fast path, then a slow
//! path that re-validates under the object's big lock, parks the thread on a
//! [`WaitQueue`] and blocks its host thread until a wake event arrives. Wake-ups are
//! scheduling decisions made by whoever releases the resource (an unlocking owner, a
//! signaling thread), never by the waiter polling.
//!
//! # Lock ordering
//!
//! Exactly one order is legal, and every path in this module follows it:
//!
//! 1. the mutex big lock ([`KernelMutex::lock_queue`])
//! 2. the condvar queue lock ([`KernelCond::lock_queue`]) of a cond bound to that mutex
//! 3. any thread state lock (taken internally by [`crate::thread::GuestThread`])
//!
//! # Savestate interplay
//!
//! Threads frozen mid-wait carry [`crate::thread::ThreadFlags::INCOMPLETE_SYSCALL`]
//! and are invisible to scheduling; any operation whose scheduling decision lands on
//! one suspends itself the same way instead of skipping the thread. See the module
//! docs of [`queue`] and [`cond`] for the per-object details.
//!
//! # Key Components
//!
//! - [`KernelMutex`] / `sys_mutex_*` - exclusive ownership with recursion counting
//! - [`KernelCond`] / `sys_cond_*` - condition variable bound to one mutex
//! - [`WaitQueue`], [`Protocol`] - ordered waiter storage and wake policy

pub mod cond;
pub mod mutex;
pub mod queue;

pub use cond::{
    sys_cond_create, sys_cond_destroy, sys_cond_signal, sys_cond_signal_all, sys_cond_signal_to,
    sys_cond_wait, CondAttributes, KernelCond, SignalResult,
};
pub use mutex::{
    sys_mutex_create, sys_mutex_destroy, sys_mutex_lock, sys_mutex_trylock, sys_mutex_unlock,
    KernelMutex, MutexAttributes,
};
pub use queue::{Protocol, ResumeWait, Scheduled, WaitQueue};
