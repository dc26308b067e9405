use thiserror::Error;

macro_rules! corrupt_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Corrupt {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Corrupt {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The first five variants are the guest-visible result codes of the emulated kernel's
/// synchronization syscalls; they are returned synchronously from the syscall that detected
/// them and carry no further payload, matching the original kernel ABI where each maps to a
/// single numeric code. [`Error::Corrupt`] is host-side only and reports savestate decode or
/// consistency failures.
///
/// Internal consistency failures (e.g. a scheduled thread not present where expected) are
/// unrecoverable invariant violations and abort via panic with diagnostic context rather than
/// surfacing as one of these variants - they indicate a bug in this crate, not guest misuse.
///
/// # Examples
///
/// ```rust
/// use guestsync::{Error, ObjectRegistry};
/// use guestsync::sync::sys_mutex_destroy;
///
/// let registry = ObjectRegistry::new();
///
/// match sys_mutex_destroy(&registry, 0xdead) {
///     Err(Error::NotFound) => {} // no such object id
///     other => panic!("unexpected: {:?}", other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The object id does not resolve to a live kernel object of the expected type.
    ///
    /// Also returned when a condition variable's bound mutex was destroyed concurrently,
    /// or never materialized during a savestate restore.
    #[error("No such kernel object")]
    NotFound,

    /// The object is busy and cannot be destroyed or acquired.
    ///
    /// Destruction is refused while waiters are queued or condition variables remain
    /// bound; `trylock` reports it for a mutex held by another thread.
    #[error("Kernel object is busy")]
    Busy,

    /// The calling thread does not hold the required ownership.
    ///
    /// Returned by `wait` when called without owning the bound mutex, and by `unlock`
    /// when called by a thread that is not the owner.
    #[error("Calling thread does not own the mutex")]
    Permission,

    /// A wait exceeded its deadline without being signaled.
    ///
    /// Surfaces only after the full timeout has elapsed and mutex ownership has been
    /// re-established (for condition waits) or abandoned (for mutex waits).
    #[error("Wait timed out")]
    TimedOut,

    /// A thread attempted to re-lock a non-recursive mutex it already owns.
    #[error("Recursive lock of a non-recursive mutex")]
    Deadlock,

    /// A savestate buffer is truncated or internally inconsistent.
    ///
    /// The error includes the source location where the corruption was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was corrupt
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Corrupt savestate - {file}:{line}: {message}")]
    Corrupt {
        /// The message to be printed for the Corrupt error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
}
