//! End-to-end savestate scenarios: snapshot a world with threads frozen inside
//! blocking syscalls, rebuild it from the serialized blobs, and drive the replayed
//! waits to completion.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use guestsync::prelude::*;
use guestsync::savestate::{load_objects, load_thread, save_objects, save_thread};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn guest(id: u32, priority: u32) -> Arc<GuestThread> {
    Arc::new(GuestThread::new(ThreadId::new(id), priority))
}

#[test]
fn cond_wait_captured_and_resumed() {
    let registry = Arc::new(ObjectRegistry::new());
    let mutex_id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();
    let cond_id = sys_cond_create(&registry, mutex_id, &CondAttributes::default()).unwrap();

    // A thread blocks in cond-wait, then the process stops for a snapshot
    let waiter = guest(7, 100);
    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            sys_mutex_lock(&waiter, &registry, mutex_id, 0).unwrap();
            sys_cond_wait(&waiter, &registry, cond_id, 0)
        })
    };
    wait_until("waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });
    waiter.stop();
    worker.join().unwrap().unwrap();
    assert!(waiter.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));

    let object_blob = save_objects(&registry);
    let thread_blob = save_thread(&waiter);

    // Rebuild the world from the blobs
    let registry = Arc::new(ObjectRegistry::new());
    load_objects(&registry, &object_blob).unwrap();
    let waiter = load_thread(&thread_blob).unwrap();
    assert_eq!(waiter.id(), ThreadId::new(7));
    assert!(waiter.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));

    // The engine re-issues the interrupted syscall; it re-attaches to the same wait
    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            let outcome = sys_cond_wait(&waiter, &registry, cond_id, 0);
            assert!(outcome.is_ok());
            assert!(registry.get_mutex(mutex_id).unwrap().is_owner(waiter.id()));
            sys_mutex_unlock(&waiter, &registry, mutex_id).unwrap();
        })
    };
    wait_until("replayed waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });

    let signaler = guest(9, 100);
    sys_mutex_lock(&signaler, &registry, mutex_id, 0).unwrap();
    sys_cond_signal(&signaler, &registry, cond_id).unwrap();
    sys_mutex_unlock(&signaler, &registry, mutex_id).unwrap();

    worker.join().unwrap();
}

#[test]
fn mutex_lock_captured_with_owner_persisted() {
    let registry = Arc::new(ObjectRegistry::new());
    let mutex_id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();

    let holder = guest(1, 100);
    sys_mutex_lock(&holder, &registry, mutex_id, 0).unwrap();

    // A contender blocks on the held mutex and is captured there
    let contender = guest(2, 100);
    let worker = {
        let registry = Arc::clone(&registry);
        let contender = Arc::clone(&contender);
        thread::spawn(move || sys_mutex_lock(&contender, &registry, mutex_id, 0))
    };
    wait_until("contender queued", || {
        registry.get_mutex(mutex_id).unwrap().lock_queue().len() == 1
    });
    contender.stop();
    worker.join().unwrap().unwrap();
    assert!(contender.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));

    let object_blob = save_objects(&registry);
    let holder_blob = save_thread(&holder);
    let contender_blob = save_thread(&contender);

    // After restore the mutex is still owned by thread 1
    let registry = Arc::new(ObjectRegistry::new());
    load_objects(&registry, &object_blob).unwrap();
    let holder = load_thread(&holder_blob).unwrap();
    let contender = load_thread(&contender_blob).unwrap();

    let mutex = registry.get_mutex(mutex_id).unwrap();
    assert_eq!(mutex.owner_id(), Some(holder.id()));
    assert_eq!(mutex.lock_count(), 1);

    let worker = {
        let registry = Arc::clone(&registry);
        let contender = Arc::clone(&contender);
        thread::spawn(move || {
            sys_mutex_lock(&contender, &registry, mutex_id, 0).unwrap();
            sys_mutex_unlock(&contender, &registry, mutex_id).unwrap();
        })
    };
    wait_until("replayed contender queued", || {
        registry.get_mutex(mutex_id).unwrap().lock_queue().len() == 1
    });

    sys_mutex_unlock(&holder, &registry, mutex_id).unwrap();
    worker.join().unwrap();
    assert_eq!(registry.get_mutex(mutex_id).unwrap().owner_id(), None);
}

#[test]
fn aborted_wait_preamble_restarts_from_scratch_after_restore() {
    let registry = Arc::new(ObjectRegistry::new());
    let mutex_id = sys_mutex_create(
        &registry,
        &MutexAttributes {
            recursive: true,
            ..MutexAttributes::default()
        },
    )
    .unwrap();
    let cond_id = sys_cond_create(&registry, mutex_id, &CondAttributes::default()).unwrap();

    let owner = guest(1, 100);
    sys_mutex_lock(&owner, &registry, mutex_id, 0).unwrap();
    sys_mutex_lock(&owner, &registry, mutex_id, 0).unwrap();

    // A contender is captured on the mutex queue, so the owner's cond-wait hits a
    // frozen handoff candidate in its preamble and suspends before touching anything
    let contender = guest(2, 100);
    let worker = {
        let registry = Arc::clone(&registry);
        let contender = Arc::clone(&contender);
        thread::spawn(move || sys_mutex_lock(&contender, &registry, mutex_id, 0))
    };
    wait_until("contender queued", || {
        registry.get_mutex(mutex_id).unwrap().lock_queue().len() == 1
    });
    contender.stop();
    worker.join().unwrap().unwrap();

    sys_cond_wait(&owner, &registry, cond_id, 0).unwrap();
    assert!(owner.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));
    // The aborted wait left the world untouched: still owner, both levels held,
    // nobody on the condvar queue
    let mutex = registry.get_mutex(mutex_id).unwrap();
    assert!(mutex.is_owner(owner.id()));
    assert_eq!(mutex.lock_count(), 2);
    assert_eq!(registry.get_cond(cond_id).unwrap().waiters(), 0);

    let object_blob = save_objects(&registry);
    let owner_blob = save_thread(&owner);
    let contender_blob = save_thread(&contender);

    let registry = Arc::new(ObjectRegistry::new());
    load_objects(&registry, &object_blob).unwrap();
    let owner = load_thread(&owner_blob).unwrap();
    let contender = load_thread(&contender_blob).unwrap();

    // The contender re-attaches to the mutex queue first
    let contender_worker = {
        let registry = Arc::clone(&registry);
        let contender = Arc::clone(&contender);
        thread::spawn(move || {
            sys_mutex_lock(&contender, &registry, mutex_id, 0).unwrap();
            sys_mutex_unlock(&contender, &registry, mutex_id).unwrap();
        })
    };
    wait_until("replayed contender queued", || {
        registry.get_mutex(mutex_id).unwrap().lock_queue().len() == 1
    });

    // The owner's re-issued wait must run the full preamble again, not resume a wait
    // it never entered: it releases both recursion levels and parks on the condvar
    let owner_worker = {
        let registry = Arc::clone(&registry);
        let owner = Arc::clone(&owner);
        thread::spawn(move || {
            sys_cond_wait(&owner, &registry, cond_id, 0).unwrap();
            assert_eq!(registry.get_mutex(mutex_id).unwrap().lock_count(), 2);
            sys_mutex_unlock(&owner, &registry, mutex_id).unwrap();
            sys_mutex_unlock(&owner, &registry, mutex_id).unwrap();
        })
    };
    wait_until("owner parked on the condvar", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });
    assert!(!registry.get_mutex(mutex_id).unwrap().is_owner(owner.id()));
    contender_worker.join().unwrap();

    let signaler = guest(9, 100);
    sys_mutex_lock(&signaler, &registry, mutex_id, 0).unwrap();
    sys_cond_signal(&signaler, &registry, cond_id).unwrap();
    sys_mutex_unlock(&signaler, &registry, mutex_id).unwrap();
    owner_worker.join().unwrap();
}

#[test]
fn replayed_signal_consumes_the_capture_marker() {
    let registry = Arc::new(ObjectRegistry::new());
    let mutex_id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();
    let cond_id = sys_cond_create(&registry, mutex_id, &CondAttributes::default()).unwrap();
    let other_id = sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();

    let waiter = guest(1, 100);
    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            sys_mutex_lock(&waiter, &registry, mutex_id, 0).unwrap();
            sys_cond_wait(&waiter, &registry, cond_id, 0)
        })
    };
    wait_until("waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });
    waiter.stop();
    worker.join().unwrap().unwrap();

    // The signal lands on the frozen waiter and suspends itself
    let signaler = guest(2, 100);
    sys_cond_signal(&signaler, &registry, cond_id).unwrap();
    assert!(signaler.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));

    let object_blob = save_objects(&registry);
    let waiter_blob = save_thread(&waiter);
    let signaler_blob = save_thread(&signaler);

    let registry = Arc::new(ObjectRegistry::new());
    load_objects(&registry, &object_blob).unwrap();
    let waiter = load_thread(&waiter_blob).unwrap();
    let signaler = load_thread(&signaler_blob).unwrap();

    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            sys_cond_wait(&waiter, &registry, cond_id, 0).unwrap();
            assert!(registry.get_mutex(mutex_id).unwrap().is_owner(waiter.id()));
            sys_mutex_unlock(&waiter, &registry, mutex_id).unwrap();
        })
    };
    wait_until("replayed waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });

    // Re-issuing the signal delivers it and consumes the replay marker
    sys_cond_signal(&signaler, &registry, cond_id).unwrap();
    assert!(!signaler.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));
    worker.join().unwrap();

    // The signaler's next blocking syscall is an ordinary one; a leftover marker
    // would misroute it into the replay path and hang it on the free mutex
    sys_mutex_lock(&signaler, &registry, other_id, 20_000).unwrap();
    assert!(registry.get_mutex(other_id).unwrap().is_owner(signaler.id()));
    sys_mutex_unlock(&signaler, &registry, other_id).unwrap();
}

#[test]
fn recursion_depth_survives_capture_mid_cond_wait() {
    let registry = Arc::new(ObjectRegistry::new());
    let mutex_id = sys_mutex_create(
        &registry,
        &MutexAttributes {
            recursive: true,
            ..MutexAttributes::default()
        },
    )
    .unwrap();
    let cond_id = sys_cond_create(&registry, mutex_id, &CondAttributes::default()).unwrap();

    let waiter = guest(3, 100);
    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            sys_mutex_lock(&waiter, &registry, mutex_id, 0).unwrap();
            sys_mutex_lock(&waiter, &registry, mutex_id, 0).unwrap();
            sys_cond_wait(&waiter, &registry, cond_id, 0)
        })
    };
    wait_until("waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });
    waiter.stop();
    worker.join().unwrap().unwrap();

    let object_blob = save_objects(&registry);
    let thread_blob = save_thread(&waiter);

    let registry = Arc::new(ObjectRegistry::new());
    load_objects(&registry, &object_blob).unwrap();
    let waiter = load_thread(&thread_blob).unwrap();

    let worker = {
        let registry = Arc::clone(&registry);
        let waiter = Arc::clone(&waiter);
        thread::spawn(move || {
            sys_cond_wait(&waiter, &registry, cond_id, 0).unwrap();
            // Both recursion levels are back after the resumed wait completes
            assert_eq!(registry.get_mutex(mutex_id).unwrap().lock_count(), 2);
            sys_mutex_unlock(&waiter, &registry, mutex_id).unwrap();
            sys_mutex_unlock(&waiter, &registry, mutex_id).unwrap();
        })
    };
    wait_until("replayed waiter parked", || {
        registry.get_cond(cond_id).unwrap().waiters() == 1
    });

    let signaler = guest(9, 100);
    sys_cond_signal(&signaler, &registry, cond_id).unwrap();
    worker.join().unwrap();
}
