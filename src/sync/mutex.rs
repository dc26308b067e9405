//! Exclusive-ownership kernel mutex with recursive acquisition counting.
//!
//! The guest kernel mutex is an id-registered object acquired and released through the
//! syscall surface in this module. Ownership is tracked as a packed word (thread id plus
//! a low "locked" bit) so the uncontended lock/unlock path is a single compare-exchange,
//! while every contended path re-validates under the object's big lock before queueing.
//!
//! # The big lock
//!
//! [`KernelMutex::lock_queue`] returns a guard over the mutex's wait queue. By
//! convention this lock also serializes the wait queue of every condition variable
//! bound to the mutex (their queue locks are only ever taken while it is held), which
//! makes moving a thread from a condvar queue onto the mutex queue atomic with respect
//! to any other mutation of either queue.
//!
//! # Savestate
//!
//! A thread captured while parked on the mutex queue suspends its `lock` syscall
//! (incomplete-syscall protocol) and re-enters it once after restore, re-attaching to
//! the queue without retrying the fast path. Ownership and recursion state are
//! persisted by the savestate bridge and restored verbatim.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

use crate::registry::{KernelObject, ObjectRegistry};
use crate::sync::queue::{self, Protocol, ResumeWait, Scheduled, WaitQueue};
use crate::thread::{GuestThread, ThreadFlags, ThreadId, WakeEvent};
use crate::{Error, Result};

/// Creation attributes of a kernel mutex.
#[derive(Clone, Copy, Debug)]
pub struct MutexAttributes {
    /// Queuing policy for waiters.
    pub protocol: Protocol,
    /// Whether the owner may re-acquire the mutex (recursion counting).
    pub recursive: bool,
    /// Sharing key; 0 = process-private, nonzero = published for lookup by key.
    pub shared_key: u64,
    /// 8-byte opaque name tag.
    pub name: u64,
}

impl Default for MutexAttributes {
    fn default() -> Self {
        Self {
            protocol: Protocol::Fifo,
            recursive: false,
            shared_key: 0,
            name: 0,
        }
    }
}

/// Packs a thread id into the owner word (low bit = locked marker).
fn pack_owner(id: ThreadId) -> u64 {
    (u64::from(id.raw()) << 1) | 1
}

/// Exclusive-ownership kernel object with recursion count and a waiter queue.
///
/// All fields that participate in handoff (`owner`, `lock_count`, the queue, and every
/// bound condvar queue) are serialized by the big lock; `owner` additionally supports a
/// lock-free fast-path acquire via CAS.
#[derive(Debug)]
pub struct KernelMutex {
    /// Sharing key (0 = process-private).
    key: u64,

    /// Opaque 8-byte name tag.
    name: u64,

    /// Queuing policy applied by `reown` and by bound condition variables.
    protocol: Protocol,

    /// Whether the owner may re-acquire (recursion).
    recursive: bool,

    /// Packed owner word: `(thread_id << 1) | 1` when held, 0 when free.
    owner: AtomicU64,

    /// Recursion depth; meaningful only while `owner` is set.
    lock_count: AtomicU32,

    /// Number of condition variables currently bound to this mutex.
    cond_count: AtomicU32,

    /// Creation reference counter; 0 once destruction has begun.
    exists: AtomicU32,

    /// Waiter queue, guarded by the big lock.
    sq: Mutex<WaitQueue>,
}

impl KernelMutex {
    /// Creates an unowned mutex from its attributes.
    #[must_use]
    pub fn new(attr: &MutexAttributes) -> Self {
        Self {
            key: attr.shared_key,
            name: attr.name,
            protocol: attr.protocol,
            recursive: attr.recursive,
            owner: AtomicU64::new(0),
            lock_count: AtomicU32::new(0),
            cond_count: AtomicU32::new(0),
            exists: AtomicU32::new(0),
            sq: Mutex::new(WaitQueue::new()),
        }
    }

    /// Reconstructs a mutex from persisted savestate fields.
    ///
    /// `cond_count` deliberately starts at zero - it is re-established by the
    /// condition-variable fix-up pass of the savestate bridge.
    #[must_use]
    pub fn restore(
        key: u64,
        name: u64,
        protocol: Protocol,
        recursive: bool,
        owner: Option<ThreadId>,
        lock_count: u32,
    ) -> Self {
        Self {
            key,
            name,
            protocol,
            recursive,
            owner: AtomicU64::new(owner.map_or(0, pack_owner)),
            lock_count: AtomicU32::new(lock_count),
            cond_count: AtomicU32::new(0),
            exists: AtomicU32::new(0),
            sq: Mutex::new(WaitQueue::new()),
        }
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

    /// Returns the queuing policy.
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the mutex supports recursive acquisition.
    #[must_use]
    pub fn recursive(&self) -> bool {
        self.recursive
    }

    /// Returns the current owner's thread id, if held.
    #[must_use]
    pub fn owner_id(&self) -> Option<ThreadId> {
        let packed = self.owner.load(Ordering::Acquire);
        if packed == 0 {
            None
        } else {
            Some(ThreadId::new((packed >> 1) as u32))
        }
    }

    /// Checks whether `id` currently owns the mutex.
    #[must_use]
    pub fn is_owner(&self, id: ThreadId) -> bool {
        self.owner_id() == Some(id)
    }

    /// Returns the current recursion depth (meaningful only while owned).
    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Relaxed)
    }

    /// Returns the number of condition variables bound to this mutex.
    #[must_use]
    pub fn cond_count(&self) -> u32 {
        self.cond_count.load(Ordering::Acquire)
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

    /// Binds a condition variable (increments `cond_count`).
    pub fn bind_cond(&self) {
        self.cond_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Unbinds a condition variable.
    pub fn unbind_cond(&self) {
        let prev = self.cond_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "mutex cond_count underflow");
    }

    /// Locks the big lock guarding the waiter queue (and all bound condvar queues).
    pub fn lock_queue(&self) -> MutexGuard<'_, WaitQueue> {
        self.sq.lock().expect("mutex wait queue lock poisoned")
    }

    /// Attempts immediate ownership for `id` without queueing.
    ///
    /// Succeeds if the mutex is free (`lock_count` becomes 1) or if `id` already owns a
    /// recursion-capable mutex (`lock_count` incremented). Fails otherwise; the caller
    /// decides whether to queue, report [`Error::Busy`] or report [`Error::Deadlock`].
    pub fn try_own(&self, id: ThreadId) -> bool {
        let mut current = self.owner.load(Ordering::Acquire);
        loop {
            if current == 0 {
                match self.owner.compare_exchange(
                    0,
                    pack_owner(id),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.lock_count.store(1, Ordering::Relaxed);
                        return true;
                    }
                    Err(observed) => current = observed,
                }
            } else if current >> 1 == u64::from(id.raw()) {
                if !self.recursive {
                    return false;
                }
                self.lock_count.fetch_add(1, Ordering::Relaxed);
                return true;
            } else {
                return false;
            }
        }
    }

    /// Releases all recursion levels at once, returning the depth that was held.
    ///
    /// Used by a condition wait, which fully releases the mutex no matter how deeply it
    /// was recursively held and restores the depth on wake-up.
    pub fn release_all(&self) -> u32 {
        self.lock_count.swap(0, Ordering::Relaxed)
    }

    /// Restores a previously captured recursion depth (caller must be the owner).
    pub fn restore_lock_count(&self, count: u32) {
        self.lock_count.store(count, Ordering::Relaxed);
    }

    /// Transfers ownership to the next waiter per the mutex protocol.
    ///
    /// Must be called under the big lock by (or on behalf of) the releasing owner. On
    /// [`Scheduled::Next`] the returned thread already owns the mutex with
    /// `lock_count == 1` and only remains to be woken. On [`Scheduled::Empty`] the
    /// mutex is left unowned. [`Scheduled::Interrupted`] leaves all state untouched.
    pub fn reown(&self, sq: &mut WaitQueue) -> Scheduled {
        match sq.schedule(self.protocol) {
            Scheduled::Next(thread) => {
                self.owner.store(pack_owner(thread.id()), Ordering::Release);
                self.lock_count.store(1, Ordering::Relaxed);
                Scheduled::Next(thread)
            }
            Scheduled::Empty => {
                self.owner.store(0, Ordering::Release);
                self.lock_count.store(0, Ordering::Relaxed);
                Scheduled::Empty
            }
            Scheduled::Interrupted => Scheduled::Interrupted,
        }
    }
}

/// Creates a kernel mutex and registers it.
///
/// # Errors
///
/// Creation itself cannot fail at this layer; the `Result` carries registry errors for
/// shared-key objects only.
pub fn sys_mutex_create(registry: &ObjectRegistry, attr: &MutexAttributes) -> Result<u32> {
    debug!(
        "sys_mutex_create(protocol={:?}, recursive={}, key=0x{:x})",
        attr.protocol, attr.recursive, attr.shared_key
    );

    registry.create(attr.shared_key, || {
        Ok(KernelObject::Mutex(Arc::new(KernelMutex::new(attr))))
    })
}

/// Destroys a kernel mutex.
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live mutex
/// - [`Error::Busy`] while the mutex is owned, has queued waiters, or has bound
///   condition variables
pub fn sys_mutex_destroy(registry: &ObjectRegistry, id: u32) -> Result<()> {
    debug!("sys_mutex_destroy(id=0x{id:x})");

    registry.withdraw(id, |obj| {
        let mutex = obj.as_mutex().ok_or(Error::NotFound)?;
        let sq = mutex.lock_queue();

        if mutex.cond_count() > 0 || mutex.owner_id().is_some() || !sq.is_empty() {
            return Err(Error::Busy);
        }

        mutex.on_destroyed();
        Ok(())
    })
}

/// Acquires a kernel mutex, blocking up to `timeout_us` microseconds (0 = unbounded).
///
/// The uncontended path is a single CAS. On contention the thread re-validates under
/// the big lock, parks on the waiter queue and blocks its host thread until ownership
/// is handed over by `reown`, the timeout fires, or the process stops (in which case
/// the syscall suspends for savestate capture and replays after restore).
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live mutex
/// - [`Error::Deadlock`] if the caller re-locks a non-recursive mutex it owns
/// - [`Error::TimedOut`] if the timeout elapsed before ownership was granted
pub fn sys_mutex_lock(
    thread: &Arc<GuestThread>,
    registry: &ObjectRegistry,
    id: u32,
    timeout_us: u64,
) -> Result<()> {
    trace!("sys_mutex_lock(id=0x{id:x}, timeout={timeout_us})");

    // Only a capture taken while parked re-attaches to the queue; a suspension out
    // of the fresh-entry path left no state behind and restarts from scratch
    let replay = thread.take_savestate()
        && matches!(
            ResumeWait::unpack(thread.resume()),
            ResumeWait::MidWait { .. }
        );

    let mutex = registry.get_mutex(id)?;
    let tid = thread.id();

    if !replay {
        if mutex.try_own(tid) {
            return Ok(());
        }
        if mutex.is_owner(tid) {
            return Err(Error::Deadlock);
        }
    }

    let deadline;
    {
        let mut sq = mutex.lock_queue();
        if !replay {
            // Revalidate: the owner may have released between the CAS and the lock
            if mutex.try_own(tid) {
                return Ok(());
            }
        } else {
            assert!(
                !mutex.is_owner(tid),
                "thread {tid} restored as both owner and waiter of mutex 0x{id:x}"
            );
        }
        sq.append(Arc::clone(thread));
        deadline = queue::sleep(thread, timeout_us);
    }

    loop {
        match thread.block_until_woken(deadline) {
            WakeEvent::Signaled => break,
            WakeEvent::Stopped => {
                let sq = mutex.lock_queue();
                if !sq.contains(tid) {
                    // Ownership was handed over right before the stop
                    break;
                }
                // Record the capture while still holding the big lock so a
                // concurrent handoff cannot interleave with the suspension
                queue::suspend(
                    thread,
                    ResumeWait::MidWait {
                        on_mutex_queue: true,
                        lock_count: 0,
                    },
                );
                drop(sq);
                return Ok(());
            }
            WakeEvent::TimerFired => {
                let mut sq = mutex.lock_queue();
                if sq.unqueue(tid) {
                    drop(sq);
                    thread.remove_flags(ThreadFlags::WAIT);
                    return Err(Error::TimedOut);
                }
                // Dequeued by reown under this same lock: ownership is already ours
                assert!(
                    mutex.is_owner(tid),
                    "thread {tid} neither queued nor owner of mutex 0x{id:x} after timeout"
                );
                break;
            }
        }
    }

    assert!(
        mutex.is_owner(tid),
        "mutex lock of 0x{id:x} completed without ownership for thread {tid}"
    );
    thread.remove_flags(ThreadFlags::WAIT | ThreadFlags::SIGNAL);
    Ok(())
}

/// Attempts to acquire a kernel mutex without blocking.
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live mutex
/// - [`Error::Deadlock`] if the caller re-locks a non-recursive mutex it owns
/// - [`Error::Busy`] if another thread holds the mutex
pub fn sys_mutex_trylock(thread: &Arc<GuestThread>, registry: &ObjectRegistry, id: u32) -> Result<()> {
    trace!("sys_mutex_trylock(id=0x{id:x})");

    let mutex = registry.get_mutex(id)?;
    let tid = thread.id();

    if mutex.try_own(tid) {
        return Ok(());
    }
    if mutex.is_owner(tid) {
        return Err(Error::Deadlock);
    }
    Err(Error::Busy)
}

/// Releases one recursion level of a kernel mutex owned by the caller.
///
/// At depth zero ownership transfers to the next queued waiter per the mutex protocol;
/// with an empty queue the mutex becomes free. If the next candidate is frozen for a
/// savestate capture, the unlock is not performed: the caller suspends and the syscall
/// replays identically after restore.
///
/// # Errors
///
/// - [`Error::NotFound`] if `id` does not name a live mutex
/// - [`Error::Permission`] if the caller does not own the mutex
pub fn sys_mutex_unlock(thread: &Arc<GuestThread>, registry: &ObjectRegistry, id: u32) -> Result<()> {
    trace!("sys_mutex_unlock(id=0x{id:x})");

    // A suspended unlock mutated nothing; a re-issue after restore starts fresh
    thread.take_savestate();

    let mutex = registry.get_mutex(id)?;
    let tid = thread.id();

    if !mutex.is_owner(tid) {
        return Err(Error::Permission);
    }

    if mutex.lock_count() > 1 {
        mutex.restore_lock_count(mutex.lock_count() - 1);
        return Ok(());
    }

    let mut sq = mutex.lock_queue();
    if sq.interrupted_next(mutex.protocol()) {
        queue::suspend(thread, ResumeWait::Restart);
        return Ok(());
    }

    if let Scheduled::Next(next) = mutex.reown(&mut sq) {
        drop(sq);
        next.awake();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mutex(recursive: bool) -> KernelMutex {
        KernelMutex::new(&MutexAttributes {
            recursive,
            ..MutexAttributes::default()
        })
    }

    #[test]
    fn test_try_own_exclusive() {
        let m = mutex(false);
        let a = ThreadId::new(1);
        let b = ThreadId::new(2);

        assert!(m.try_own(a));
        assert!(m.is_owner(a));
        assert_eq!(m.lock_count(), 1);

        assert!(!m.try_own(b));
        assert!(!m.try_own(a)); // non-recursive re-lock fails
    }

    #[test]
    fn test_try_own_recursive() {
        let m = mutex(true);
        let a = ThreadId::new(1);

        assert!(m.try_own(a));
        assert!(m.try_own(a));
        assert_eq!(m.lock_count(), 2);

        assert_eq!(m.release_all(), 2);
        assert_eq!(m.lock_count(), 0);
        m.restore_lock_count(2);
        assert_eq!(m.lock_count(), 2);
    }

    #[test]
    fn test_reown_transfers_per_protocol() {
        let m = KernelMutex::new(&MutexAttributes {
            protocol: Protocol::Priority,
            ..MutexAttributes::default()
        });
        let mut sq = WaitQueue::new();
        sq.append(Arc::new(GuestThread::new(ThreadId::new(1), 100)));
        sq.append(Arc::new(GuestThread::new(ThreadId::new(2), 10)));

        match m.reown(&mut sq) {
            Scheduled::Next(t) => assert_eq!(t.id(), ThreadId::new(2)),
            other => panic!("expected Next, got {other:?}"),
        }
        assert!(m.is_owner(ThreadId::new(2)));
        assert_eq!(m.lock_count(), 1);

        // Remaining waiter gets it next, then the mutex goes free
        match m.reown(&mut sq) {
            Scheduled::Next(t) => assert_eq!(t.id(), ThreadId::new(1)),
            other => panic!("expected Next, got {other:?}"),
        }
        assert!(matches!(m.reown(&mut sq), Scheduled::Empty));
        assert_eq!(m.owner_id(), None);
    }

    #[test]
    fn test_syscall_trylock_and_unlock() {
        let registry = ObjectRegistry::new();
        let a = Arc::new(GuestThread::new(ThreadId::new(1), 100));
        let b = Arc::new(GuestThread::new(ThreadId::new(2), 100));

        let id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();

        sys_mutex_trylock(&a, &registry, id).unwrap();
        assert!(matches!(
            sys_mutex_trylock(&b, &registry, id),
            Err(Error::Busy)
        ));
        assert!(matches!(
            sys_mutex_trylock(&a, &registry, id),
            Err(Error::Deadlock)
        ));
        assert!(matches!(
            sys_mutex_unlock(&b, &registry, id),
            Err(Error::Permission)
        ));

        sys_mutex_unlock(&a, &registry, id).unwrap();
        sys_mutex_trylock(&b, &registry, id).unwrap();
        sys_mutex_unlock(&b, &registry, id).unwrap();
    }

    #[test]
    fn test_destroy_busy_while_owned() {
        let registry = ObjectRegistry::new();
        let a = Arc::new(GuestThread::new(ThreadId::new(1), 100));

        let id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();
        sys_mutex_trylock(&a, &registry, id).unwrap();

        assert!(matches!(sys_mutex_destroy(&registry, id), Err(Error::Busy)));

        sys_mutex_unlock(&a, &registry, id).unwrap();
        sys_mutex_destroy(&registry, id).unwrap();
        assert!(matches!(sys_mutex_destroy(&registry, id), Err(Error::NotFound)));
    }

    #[test]
    fn test_recursive_unlock_peels_one_level() {
        let registry = ObjectRegistry::new();
        let a = Arc::new(GuestThread::new(ThreadId::new(1), 100));

        let id = sys_mutex_create(
            &registry,
            &MutexAttributes {
                recursive: true,
                ..MutexAttributes::default()
            },
        )
        .unwrap();

        sys_mutex_lock(&a, &registry, id, 0).unwrap();
        sys_mutex_lock(&a, &registry, id, 0).unwrap();
        let m = registry.get_mutex(id).unwrap();
        assert_eq!(m.lock_count(), 2);

        sys_mutex_unlock(&a, &registry, id).unwrap();
        assert_eq!(m.lock_count(), 1);
        assert!(m.is_owner(a.id()));

        sys_mutex_unlock(&a, &registry, id).unwrap();
        assert_eq!(m.owner_id(), None);
    }
}
