//! Condition variable bound to exactly one kernel mutex for its whole lifetime.
//!
//! A condition wait atomically releases the bound mutex (all recursion levels at once)
//! and parks the thread on the condvar queue; a signal moves one waiter to the mutex -
//! either granting ownership immediately and waking it, or re-queueing it on the mutex
//! waiter queue to be woken by a later `unlock`. The waiter resumes from `wait` only
//! once it owns the mutex again, with its original recursion depth restored.
//!
//! Signal delivery always drains the condvar queue with the *bound mutex's* protocol,
//! so wake order matches the fairness policy the application chose at mutex creation.
//!
//! # Savestate
//!
//! A waiter can be captured in either of two positions: still on the condvar queue, or
//! already moved to the mutex queue by a signal. The wait syscall records which (plus
//! the released recursion depth) in the thread's resume word and suspends; after
//! restore it re-enters once and re-attaches to the same queue. A signal whose chosen
//! target is frozen this way suspends the *signaling* syscall instead of skipping or
//! corrupting the target.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use log::{debug, trace};

use crate::registry::{KernelObject, ObjectRegistry};
use crate::sync::mutex::KernelMutex;
use crate::sync::queue::{self, ResumeWait, Scheduled, WaitQueue};
use crate::thread::{GuestThread, ThreadFlags, ThreadId, WakeEvent};
use crate::{Error, Result};

/// Result-register value for a wait that completed normally.
const REG_OK: u64 = 0;
/// Result-register value for a wait whose timeout elapsed.
const REG_TIMED_OUT: u64 = 1;

/// Creation attributes of a condition variable.
#[derive(Clone, Copy, Debug, Default)]
pub struct CondAttributes {
    /// Sharing key; 0 = process-private, nonzero = published for lookup by key.
    pub shared_key: u64,
    /// 8-byte opaque name tag.
    pub name: u64,
}

/// Delivery outcome of a targeted signal.
///
/// A targeted signal aimed at a thread that is not currently waiting is not a guest
/// error; the syscall succeeds and reports the miss through this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalResult {
    /// The target was waiting and has been moved toward mutex ownership.
    Delivered,
    /// The target was not on the condvar queue.
    NotWaiting,
}

/// Condition variable kernel object.
///
/// Holds a weak reference to its bound mutex; destruction order is nevertheless
/// enforced (a mutex with bound condition variables refuses to be destroyed), so the
/// upgrade only fails for ids that never resolved during a savestate restore.
#[derive(Debug)]
pub struct KernelCond {
    /// Sharing key (0 = process-private).
    key: u64,

    /// Opaque 8-byte name tag.
    name: u64,

    /// Registry id of the bound mutex (persisted; used to re-bind after restore).
    mutex_id: u32,

    /// The bound mutex, set once by [`KernelCond::bind`].
    mutex: OnceLock<Weak<KernelMutex>>,

    /// Lock-free count of threads currently on the condvar queue.
    waiters: AtomicU32,

    /// Creation reference counter; 0 once destruction has begun.
    exists: AtomicU32,

    /// Waiter queue; only ever locked while the bound mutex's big lock is held.
    sq: Mutex<WaitQueue>,
}

impl KernelCond {
    /// Creates an unbound condition variable; [`KernelCond::bind`] completes setup.
    #[must_use]
    pub fn new(attr: &CondAttributes, mutex_id: u32) -> Self {
        Self {
            key: attr.shared_key,
            name: attr.name,
            mutex_id,
            mutex: OnceLock::new(),
            waiters: AtomicU32::new(0),
            exists: AtomicU32::new(0),
            sq: Mutex::new(WaitQueue::new()),
        }
    }

    /// Reconstructs a condition variable from persisted savestate fields.
    ///
    /// The mutex binding is re-established by a fix-up pass once every mutex has been
    /// loaded, since object order within a savestate is not guaranteed.
    #[must_use]
    pub fn restore(key: u64, name: u64, mutex_id: u32) -> Self {
        Self::new(
            &CondAttributes {
                shared_key: key,
                name,
            },
            mutex_id,
        )
    }

    /// Binds this condition variable to its mutex for life.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the mutex has already begun destruction.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the binding is permanent.
    pub fn bind(&self, mutex: &Arc<KernelMutex>) -> Result<()> {
        if mutex.exists() == 0 {
            return Err(Error::NotFound);
        }
        mutex.bind_cond();
        self.mutex
            .set(Arc::downgrade(mutex))
            .expect("condition variable bound twice");
        Ok(())
    }

    /// Resolves the bound mutex.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the binding was never established (failed restore).
    pub fn mutex(&self) -> Result<Arc<KernelMutex>> {
        self.mutex
            .get()
            .and_then(Weak::upgrade)
            .ok_or(Error::NotFound)
    }

    /// Returns the sharing key (0 = process-private).
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Returns the opaque name tag.
    #[must_use]
    pub fn name(&self) -> u64 {
        self.name
    }

    /// Returns the registry id of the bound mutex.
    #[must_use]
    pub fn mutex_id(&self) -> u32 {
        self.mutex_id
    }

    /// Returns the number of threads currently waiting.
    #[must_use]
    pub fn waiters(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }

    /// Accounts a new waiter (called with the queues locked).
    pub fn add_waiter(&self) {
        self.waiters.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounts a departed waiter (called with the queues locked).
    pub fn remove_waiter(&self) {
        let prev = self.waiters.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "condition variable waiter count underflow");
    }

    /// Returns the creation reference counter.
    #[must_use]
    pub fn exists(&self) -> u32 {
        self.exists.load(Ordering::Acquire)
    }

    /// Registration hook: increments the creation reference counter.
    pub fn on_registered(&self) {
        self.exists.fetch_add(1, Ordering::AcqRel);
    }

    /// Destruction hook: marks the object dead for late binders.
    pub fn on_destroyed(&self) {
        self.exists.fetch_sub(1, Ordering::AcqRel);
    }

    /// Locks the condvar waiter queue. Callers must already hold the bound mutex's big
    /// lock; this ordering is what makes signal-and-requeue atomic.
    pub fn lock_queue(&self) -> MutexGuard<'_, WaitQueue> {
        self.sq.lock().expect("cond wait queue lock poisoned")
    }
}

/// Hands a dequeued waiter toward mutex ownership.
///
/// Grants ownership and wakes the thread if the mutex is free, otherwise parks it on
/// the mutex waiter queue where a later `unlock` will reach it. Must run under the big
/// lock.
fn requeue_waiter(mutex: &KernelMutex, msq: &mut WaitQueue, target: Arc<GuestThread>) {
    if mutex.try_own(target.id()) {
        target.awake();
    } else {
        msq.append(target);
    }
}

/// Creates a condition variable bound to the mutex named by `mutex_id`.
///
/// # Errors
///
/// [`Error::NotFound`] if `mutex_id` does not name a live mutex.
pub fn sys_cond_create(
    registry: &ObjectRegistry,
    mutex_id: u32,
    attr: &CondAttributes,
) -> Result<u32> {
    debug!("sys_cond_create(mutex=0x{mutex_id:x}, key=0x{:x})", attr.shared_key);

    let mutex = registry.get_mutex(mutex_id)?;
    registry.create(attr.shared_key, || {
        let cond = KernelCond::new(attr, mutex_id);
        cond.bind(&mutex)?;
        Ok(KernelObject::Cond(Arc::new(cond)))
    })
}

/// Destroys a condition variable and releases its mutex binding.
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live condition variable
/// - [`Error::Busy`] while threads are waiting on it
pub fn sys_cond_destroy(registry: &ObjectRegistry, id: u32) -> Result<()> {
    debug!("sys_cond_destroy(id=0x{id:x})");

    registry.withdraw(id, |obj| {
        let cond = obj.as_cond().ok_or(Error::NotFound)?;
        let mutex = cond.mutex()?;
        let _msq = mutex.lock_queue();
        let csq = cond.lock_queue();

        if cond.waiters() > 0 || !csq.is_empty() {
            return Err(Error::Busy);
        }

        mutex.unbind_cond();
        cond.on_destroyed();
        Ok(())
    })
}

/// Wakes one waiter of a condition variable.
///
/// The waiter is chosen by the bound mutex's protocol and moved toward mutex
/// ownership; with nobody waiting the signal is lost (condition variables hold no
/// memory of past signals). If the chosen waiter is frozen for a savestate capture,
/// the signaling syscall suspends itself instead.
///
/// # Errors
///
/// [`Error::NotFound`] if `id` does not name a live condition variable.
pub fn sys_cond_signal(thread: &Arc<GuestThread>, registry: &ObjectRegistry, id: u32) -> Result<()> {
    trace!("sys_cond_signal(id=0x{id:x})");

    // A suspended signal mutated nothing; a re-issue after restore starts fresh
    thread.take_savestate();

    let cond = registry.get_cond(id)?;
    if cond.waiters() == 0 {
        return Ok(());
    }
    let mutex = cond.mutex()?;

    let mut msq = mutex.lock_queue();
    let mut csq = cond.lock_queue();
    match csq.schedule(mutex.protocol()) {
        Scheduled::Empty => Ok(()),
        Scheduled::Interrupted => {
            queue::suspend(thread, ResumeWait::Restart);
            Ok(())
        }
        Scheduled::Next(target) => {
            cond.remove_waiter();
            requeue_waiter(&mutex, &mut msq, target);
            Ok(())
        }
    }
}

/// Wakes every waiter of a condition variable.
///
/// At most one drained waiter can acquire the free mutex; all others are parked on the
/// mutex waiter queue. The broadcast is atomic: if *any* queued waiter is frozen for a
/// savestate capture, the signaling syscall suspends without draining anyone.
///
/// # Errors
///
/// [`Error::NotFound`] if `id` does not name a live condition variable.
pub fn sys_cond_signal_all(
    thread: &Arc<GuestThread>,
    registry: &ObjectRegistry,
    id: u32,
) -> Result<()> {
    trace!("sys_cond_signal_all(id=0x{id:x})");

    thread.take_savestate();

    let cond = registry.get_cond(id)?;
    if cond.waiters() == 0 {
        return Ok(());
    }
    let mutex = cond.mutex()?;

    let mut msq = mutex.lock_queue();
    let mut csq = cond.lock_queue();

    if csq
        .iter()
        .any(|t| t.has_flag(ThreadFlags::INCOMPLETE_SYSCALL))
    {
        queue::suspend(thread, ResumeWait::Restart);
        return Ok(());
    }

    let mut runnable: Option<Arc<GuestThread>> = None;
    loop {
        match csq.schedule(mutex.protocol()) {
            Scheduled::Empty => break,
            Scheduled::Interrupted => unreachable!("frozen waiter appeared mid-broadcast"),
            Scheduled::Next(target) => {
                cond.remove_waiter();
                if mutex.try_own(target.id()) {
                    let prev = runnable.replace(target);
                    assert!(prev.is_none(), "two waiters acquired the mutex in one broadcast");
                } else {
                    msq.append(target);
                }
            }
        }
    }
    drop(csq);
    drop(msq);

    if let Some(target) = runnable {
        target.awake();
    }
    Ok(())
}

/// Wakes one specific waiter of a condition variable.
///
/// Unlike the untargeted forms this bypasses the queuing protocol. A target that is
/// not currently waiting is reported as [`SignalResult::NotWaiting`], not as an error.
/// If the target is frozen for a savestate capture, the signaling syscall suspends
/// itself.
///
/// # Errors
///
/// [`Error::NotFound`] if `id` does not name a live condition variable.
pub fn sys_cond_signal_to(
    thread: &Arc<GuestThread>,
    registry: &ObjectRegistry,
    id: u32,
    target_id: ThreadId,
) -> Result<SignalResult> {
    trace!("sys_cond_signal_to(id=0x{id:x}, target={target_id})");

    thread.take_savestate();

    let cond = registry.get_cond(id)?;
    let mutex = cond.mutex()?;

    let mut msq = mutex.lock_queue();
    let mut csq = cond.lock_queue();

    let Some(found) = csq.find(target_id) else {
        return Ok(SignalResult::NotWaiting);
    };
    if found.has_flag(ThreadFlags::INCOMPLETE_SYSCALL) {
        queue::suspend(thread, ResumeWait::Restart);
        return Ok(SignalResult::NotWaiting);
    }
    let target = Arc::clone(found);

    assert!(csq.unqueue(target_id), "found waiter vanished under the lock");
    cond.remove_waiter();
    requeue_waiter(&mutex, &mut msq, target);
    Ok(SignalResult::Delivered)
}

/// Releases the bound mutex and waits for a signal, up to `timeout_us` microseconds
/// (0 = unbounded).
///
/// The release is total: all recursion levels are dropped at once and restored when
/// the wait completes. The syscall returns only once the caller owns the mutex again -
/// including the timeout case, where the thread re-acquires (or queues for) the mutex
/// before [`Error::TimedOut`] surfaces.
///
/// A savestate capture mid-wait suspends the syscall, recording the queue the thread
/// was parked on; after restore the syscall re-enters once and resumes the identical
/// wait.
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live condition variable
/// - [`Error::Permission`] if the caller does not own the bound mutex
/// - [`Error::TimedOut`] if the timeout elapsed before a signal arrived
pub fn sys_cond_wait(
    thread: &Arc<GuestThread>,
    registry: &ObjectRegistry,
    id: u32,
    timeout_us: u64,
) -> Result<()> {
    trace!("sys_cond_wait(id=0x{id:x}, timeout={timeout_us})");

    // A wait captured while parked re-attaches to its recorded queue; a wait that
    // suspended in its preamble (frozen scheduling candidate) mutated nothing and
    // restarts from scratch, exactly like a fresh call
    let mid_wait = if thread.take_savestate() {
        match ResumeWait::unpack(thread.resume()) {
            ResumeWait::MidWait {
                on_mutex_queue,
                lock_count,
            } => Some((on_mutex_queue, lock_count)),
            ResumeWait::Restart => None,
        }
    } else {
        None
    };

    let cond = registry.get_cond(id)?;
    let mutex = cond.mutex()?;
    let tid = thread.id();

    if mid_wait.is_none() {
        if !mutex.is_owner(tid) {
            return Err(Error::Permission);
        }
        thread.set_result(REG_OK);
    }

    let saved_count;
    let mut deadline;
    {
        let mut msq = mutex.lock_queue();
        let mut csq = cond.lock_queue();

        if let Some((on_mutex_queue, restored_count)) = mid_wait {
            saved_count = restored_count;
            if on_mutex_queue {
                assert!(
                    !mutex.is_owner(tid),
                    "thread {tid} restored as both owner and waiter of mutex 0x{:x}",
                    cond.mutex_id()
                );
                msq.append(Arc::clone(thread));
            } else {
                csq.append(Arc::clone(thread));
                cond.add_waiter();
            }
            deadline = queue::sleep(thread, timeout_us);
        } else {
            // The release below hands the mutex to the next waiter; if that waiter is
            // frozen, suspend before mutating anything
            if msq.interrupted_next(mutex.protocol()) {
                queue::suspend(thread, ResumeWait::Restart);
                return Ok(());
            }

            csq.append(Arc::clone(thread));
            cond.add_waiter();
            saved_count = mutex.release_all();
            if let Scheduled::Next(next) = mutex.reown(&mut msq) {
                next.awake();
            }
            deadline = queue::sleep(thread, timeout_us);
        }
    }

    loop {
        match thread.block_until_woken(deadline) {
            WakeEvent::Signaled => break,
            WakeEvent::Stopped => {
                let msq = mutex.lock_queue();
                let csq = cond.lock_queue();
                let on_mutex = msq.contains(tid);
                if !on_mutex && !csq.contains(tid) {
                    // Woken and granted ownership right before the stop
                    break;
                }
                // Record the capture while still holding both queue locks; a
                // concurrent signal either moved this thread before the locks were
                // taken or observes the suspension afterwards
                queue::suspend(
                    thread,
                    ResumeWait::MidWait {
                        on_mutex_queue: on_mutex,
                        lock_count: saved_count,
                    },
                );
                drop(csq);
                drop(msq);
                return Ok(());
            }
            WakeEvent::TimerFired => {
                let mut msq = mutex.lock_queue();
                let mut csq = cond.lock_queue();
                if csq.unqueue(tid) {
                    cond.remove_waiter();
                    thread.set_result(REG_TIMED_OUT);
                    if mutex.try_own(tid) {
                        break;
                    }
                    // Mutex held by someone else: queue for it with no further
                    // deadline, the timeout has been consumed
                    msq.append(Arc::clone(thread));
                    deadline = None;
                    continue;
                }
                // Already moved off the condvar queue by a signal
                if mutex.is_owner(tid) {
                    break;
                }
                assert!(
                    msq.contains(tid),
                    "thread {tid} on neither queue and not owner after cond-wait timeout"
                );
                deadline = None;
            }
        }
    }

    assert!(
        mutex.is_owner(tid),
        "cond wait on 0x{id:x} completed without mutex ownership for thread {tid}"
    );
    mutex.restore_lock_count(saved_count);
    thread.remove_flags(ThreadFlags::WAIT | ThreadFlags::SIGNAL);

    if thread.result() == REG_TIMED_OUT {
        Err(Error::TimedOut)
    } else {
        Ok(())
    }
}
