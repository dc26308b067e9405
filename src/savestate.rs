//! Savestate bridge: serializes the synchronization state into a flat byte blob and
//! rebuilds it, including threads frozen in the middle of a blocking syscall.
//!
//! # Format
//!
//! All integers are little-endian. The object blob is a version byte, a record count,
//! then one tagged record per kernel object. Wait queues are deliberately *not*
//! persisted: a captured waiter records its own position (which queue, released
//! recursion depth) in its resume word, and re-attaches by re-entering the suspended
//! syscall after restore. The CPU engine replays threads in a deterministic order, so
//! queue order is reproduced rather than stored.
//!
//! # Two-phase object load
//!
//! Records appear in no guaranteed order, so loading runs in two phases: first every
//! mutex is materialized, then every condition variable is bound to its mutex by id.
//! Binding re-derives each mutex's bound-condvar count from zero; the count observed at
//! save time is stored in the mutex record and any mismatch fails the load with
//! [`Error::Corrupt`] rather than resuming from inconsistent state.
//!
//! # Key Components
//!
//! - [`StateWriter`] / [`StateReader`] - bounds-checked little-endian codec
//! - [`save_objects`] / [`load_objects`] - registry contents
//! - [`save_thread`] / [`load_thread`] - per-thread capture, including mid-syscall state

use std::sync::Arc;

use log::debug;

use crate::registry::{KernelObject, ObjectRegistry};
use crate::sync::{KernelCond, KernelMutex, Protocol};
use crate::thread::{GuestThread, ThreadId};
use crate::Result;

/// Format version of both the object and the thread blob.
const VERSION: u8 = 1;

/// Record tag for a mutex.
const TAG_MUTEX: u8 = 1;
/// Record tag for a condition variable.
const TAG_COND: u8 = 2;

/// Growable little-endian byte sink.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Appends a little-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Consumes the writer, returning the accumulated bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian reader over a byte slice.
///
/// Every read validates the remaining length first; truncated input surfaces as
/// [`Error::Corrupt`](crate::Error::Corrupt) with the offending offset.
#[derive(Debug)]
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    /// Wraps a byte slice for reading.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Checks whether the reader is exhausted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(corrupt_error!(
                "truncated savestate: need {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.remaining()
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`](crate::Error::Corrupt) on truncation.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Reads a little-endian u32.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`](crate::Error::Corrupt) on truncation.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("slice length checked")))
    }

    /// Reads a little-endian u64.
    ///
    /// # Errors
    ///
    /// [`Error::Corrupt`](crate::Error::Corrupt) on truncation.
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("slice length checked")))
    }
}

/// Serializes every registered kernel object.
///
/// Must run while all guest threads are stopped; the snapshot reads object state
/// without the big locks.
#[must_use]
pub fn save_objects(registry: &ObjectRegistry) -> Vec<u8> {
    let mut w = StateWriter::new();
    w.write_u8(VERSION);
    w.write_u32(registry.len() as u32);

    registry.select(|id, obj| match obj {
        KernelObject::Mutex(m) => {
            w.write_u8(TAG_MUTEX);
            w.write_u32(id);
            w.write_u64(m.key());
            w.write_u64(m.name());
            w.write_u8(m.protocol().as_raw());
            w.write_u8(u8::from(m.recursive()));
            w.write_u64(m.owner_id().map_or(0, |t| (u64::from(t.raw()) << 1) | 1));
            w.write_u32(m.lock_count());
            w.write_u32(m.cond_count());
        }
        KernelObject::Cond(c) => {
            w.write_u8(TAG_COND);
            w.write_u32(id);
            w.write_u64(c.key());
            w.write_u64(c.name());
            w.write_u32(c.mutex_id());
        }
    });

    debug!("saved {} kernel objects", registry.len());
    w.into_bytes()
}

/// Rebuilds the registry contents from a serialized object blob.
///
/// # Errors
///
/// [`Error::Corrupt`](crate::Error::Corrupt) on truncation, unknown versions or tags,
/// invalid field encodings, a condition variable referencing a missing mutex, or a
/// bound-condvar count that does not match the count recorded at save time.
pub fn load_objects(registry: &ObjectRegistry, bytes: &[u8]) -> Result<()> {
    let mut r = StateReader::new(bytes);

    let version = r.read_u8()?;
    if version != VERSION {
        return Err(corrupt_error!("unsupported savestate version {version}"));
    }
    let count = r.read_u32()?;

    struct CondRecord {
        id: u32,
        key: u64,
        name: u64,
        mutex_id: u32,
    }
    let mut conds = Vec::new();
    let mut cond_counts = Vec::new();

    // Phase 1: materialize mutexes, stage condition variables
    for _ in 0..count {
        let tag = r.read_u8()?;
        let id = r.read_u32()?;
        match tag {
            TAG_MUTEX => {
                let key = r.read_u64()?;
                let name = r.read_u64()?;
                let protocol_raw = r.read_u8()?;
                let protocol = Protocol::from_raw(protocol_raw)
                    .ok_or_else(|| corrupt_error!("unknown mutex protocol {protocol_raw}"))?;
                let recursive = match r.read_u8()? {
                    0 => false,
                    1 => true,
                    other => return Err(corrupt_error!("invalid recursive flag {other}")),
                };
                let owner_word = r.read_u64()?;
                let owner = if owner_word & 1 != 0 {
                    Some(ThreadId::new((owner_word >> 1) as u32))
                } else if owner_word == 0 {
                    None
                } else {
                    return Err(corrupt_error!("invalid mutex owner word 0x{owner_word:x}"));
                };
                let lock_count = r.read_u32()?;
                if owner.is_none() && lock_count != 0 {
                    return Err(corrupt_error!(
                        "mutex 0x{id:x} has lock_count {lock_count} but no owner"
                    ));
                }
                let expected_conds = r.read_u32()?;

                let mutex = KernelMutex::restore(key, name, protocol, recursive, owner, lock_count);
                registry.insert_loaded(id, KernelObject::Mutex(Arc::new(mutex)));
                cond_counts.push((id, expected_conds));
            }
            TAG_COND => {
                conds.push(CondRecord {
                    id,
                    key: r.read_u64()?,
                    name: r.read_u64()?,
                    mutex_id: r.read_u32()?,
                });
            }
            other => return Err(corrupt_error!("unknown object tag {other}")),
        }
    }

    // Phase 2: bind condition variables to their (now loaded) mutexes
    for rec in conds {
        let mutex = registry.get_mutex(rec.mutex_id).map_err(|_| {
            corrupt_error!(
                "cond 0x{:x} references missing mutex 0x{:x}",
                rec.id,
                rec.mutex_id
            )
        })?;
        let cond = KernelCond::restore(rec.key, rec.name, rec.mutex_id);
        cond.bind(&mutex)?;
        registry.insert_loaded(rec.id, KernelObject::Cond(Arc::new(cond)));
    }

    // Phase 3: the re-derived binding counts must match the snapshot
    for (id, expected) in cond_counts {
        let actual = registry.get_mutex(id)?.cond_count();
        if actual != expected {
            return Err(corrupt_error!(
                "mutex 0x{id:x} rebound {actual} condition variables, snapshot recorded {expected}"
            ));
        }
    }

    debug!("loaded {count} kernel objects");
    Ok(())
}

/// Serializes one guest thread's synchronization-visible state.
///
/// Must run after the thread observed the stop and finished its capture protocol, so
/// the incomplete-syscall flag and resume word are final.
#[must_use]
pub fn save_thread(thread: &GuestThread) -> Vec<u8> {
    use crate::thread::ThreadFlags;

    let mut w = StateWriter::new();
    w.write_u8(VERSION);
    w.write_u32(thread.id().raw());
    w.write_u32(thread.priority());
    w.write_u8(u8::from(thread.has_flag(ThreadFlags::INCOMPLETE_SYSCALL)));
    w.write_u64(thread.resume());
    w.write_u64(thread.result());
    w.into_bytes()
}

/// Rebuilds a guest thread from a serialized record.
///
/// A thread captured mid-syscall comes back marked for replay: the CPU engine must
/// re-issue its interrupted syscall exactly once before scheduling it normally.
///
/// # Errors
///
/// [`Error::Corrupt`](crate::Error::Corrupt) on truncation or field corruption.
pub fn load_thread(bytes: &[u8]) -> Result<Arc<GuestThread>> {
    let mut r = StateReader::new(bytes);

    let version = r.read_u8()?;
    if version != VERSION {
        return Err(corrupt_error!("unsupported savestate version {version}"));
    }
    let id = ThreadId::new(r.read_u32()?);
    let priority = r.read_u32()?;
    let incomplete = match r.read_u8()? {
        0 => false,
        1 => true,
        other => return Err(corrupt_error!("invalid incomplete-syscall flag {other}")),
    };
    let resume = r.read_u64()?;
    let result = r.read_u64()?;

    let thread = Arc::new(GuestThread::new(id, priority));
    thread.set_result(result);
    if incomplete {
        thread.begin_replay(resume);
    }
    Ok(thread)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{
        sys_cond_create, sys_mutex_create, sys_mutex_trylock, CondAttributes, MutexAttributes,
    };
    use crate::thread::ThreadFlags;
    use crate::Error;

    #[test]
    fn test_objects_roundtrip() {
        let registry = ObjectRegistry::new();
        let owner = Arc::new(GuestThread::new(ThreadId::new(9), 100));

        let mutex_id = sys_mutex_create(
            &registry,
            &MutexAttributes {
                protocol: Protocol::Priority,
                recursive: true,
                shared_key: 0xfeed,
                name: 0x6d75_7478,
            },
        )
        .unwrap();
        let cond_id = sys_cond_create(&registry, mutex_id, &CondAttributes::default()).unwrap();
        sys_mutex_trylock(&owner, &registry, mutex_id).unwrap();

        let blob = save_objects(&registry);

        let restored = ObjectRegistry::new();
        load_objects(&restored, &blob).unwrap();

        let m = restored.get_mutex(mutex_id).unwrap();
        assert_eq!(m.protocol(), Protocol::Priority);
        assert!(m.recursive());
        assert_eq!(m.key(), 0xfeed);
        assert_eq!(m.owner_id(), Some(ThreadId::new(9)));
        assert_eq!(m.lock_count(), 1);
        assert_eq!(m.cond_count(), 1);

        let c = restored.get_cond(cond_id).unwrap();
        assert_eq!(c.mutex_id(), mutex_id);
        assert!(Arc::ptr_eq(&c.mutex().unwrap(), &m));
    }

    #[test]
    fn test_cond_record_before_its_mutex() {
        // Hand-build a blob with the cond record first; loading must still bind it
        let mut w = StateWriter::new();
        w.write_u8(VERSION);
        w.write_u32(2);

        w.write_u8(TAG_COND);
        w.write_u32(0x200);
        w.write_u64(0); // key
        w.write_u64(0); // name
        w.write_u32(0x101); // mutex id

        w.write_u8(TAG_MUTEX);
        w.write_u32(0x101);
        w.write_u64(0); // key
        w.write_u64(0); // name
        w.write_u8(Protocol::Fifo.as_raw());
        w.write_u8(0); // recursive
        w.write_u64(0); // owner
        w.write_u32(0); // lock_count
        w.write_u32(1); // cond_count

        let registry = ObjectRegistry::new();
        load_objects(&registry, &w.into_bytes()).unwrap();
        assert!(registry.get_cond(0x200).unwrap().mutex().is_ok());
    }

    #[test]
    fn test_cond_count_mismatch_is_corrupt() {
        // A mutex claiming one bound cond, with no cond record to re-establish it
        let mut w = StateWriter::new();
        w.write_u8(VERSION);
        w.write_u32(1);
        w.write_u8(TAG_MUTEX);
        w.write_u32(0x101);
        w.write_u64(0); // key
        w.write_u64(0); // name
        w.write_u8(Protocol::Fifo.as_raw());
        w.write_u8(0); // recursive
        w.write_u64(0); // owner
        w.write_u32(0); // lock_count
        w.write_u32(1); // cond_count

        let restored = ObjectRegistry::new();
        assert!(matches!(
            load_objects(&restored, &w.into_bytes()),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn test_missing_mutex_reference_is_corrupt() {
        let mut w = StateWriter::new();
        w.write_u8(VERSION);
        w.write_u32(1);
        w.write_u8(TAG_COND);
        w.write_u32(0x200);
        w.write_u64(0);
        w.write_u64(0);
        w.write_u32(0x999); // no such mutex

        let registry = ObjectRegistry::new();
        assert!(matches!(
            load_objects(&registry, &w.into_bytes()),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn test_truncated_blob_is_corrupt() {
        let registry = ObjectRegistry::new();
        sys_mutex_create(&registry, &MutexAttributes::default()).unwrap();
        let blob = save_objects(&registry);

        for len in 0..blob.len() {
            let restored = ObjectRegistry::new();
            assert!(
                matches!(load_objects(&restored, &blob[..len]), Err(Error::Corrupt { .. })),
                "truncation at {len} must be detected"
            );
        }
    }

    #[test]
    fn test_unknown_tag_is_corrupt() {
        let mut w = StateWriter::new();
        w.write_u8(VERSION);
        w.write_u32(1);
        w.write_u8(0x7f);
        w.write_u32(0x100);

        let registry = ObjectRegistry::new();
        assert!(matches!(
            load_objects(&registry, &w.into_bytes()),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn test_thread_roundtrip_mid_syscall() {
        let thread = GuestThread::new(ThreadId::new(7), 500);
        thread.set_result(1);
        thread.set_resume(0x0000_0003_0000_0001);
        thread.add_flags(ThreadFlags::INCOMPLETE_SYSCALL);

        let blob = save_thread(&thread);
        let restored = load_thread(&blob).unwrap();

        assert_eq!(restored.id(), ThreadId::new(7));
        assert_eq!(restored.priority(), 500);
        assert_eq!(restored.result(), 1);
        assert!(restored.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));
        assert!(restored.take_savestate());
        assert_eq!(restored.resume(), 0x0000_0003_0000_0001);
    }

    #[test]
    fn test_thread_roundtrip_idle() {
        let thread = GuestThread::new(ThreadId::new(3), 1000);
        let restored = load_thread(&save_thread(&thread)).unwrap();

        assert!(!restored.has_flag(ThreadFlags::INCOMPLETE_SYSCALL));
        assert!(!restored.take_savestate());
    }
}
