// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]

//! # guestsync
//!
//! Guest-kernel synchronization primitives for an emulated multi-threaded system:
//! recursive mutexes, condition variables, a protocol-driven waiter-queue scheduler,
//! and a savestate bridge that can freeze and resume threads in the middle of a
//! blocking syscall.
//!
//! Each guest CPU thread runs on a dedicated host thread and performs its syscalls
//! synchronously; blocking waits park the host thread on a condvar rather than
//! spinning. Kernel objects live in an id-keyed [`ObjectRegistry`] and are manipulated
//! exclusively through the `sys_mutex_*` / `sys_cond_*` syscall surface.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use guestsync::{GuestThread, ObjectRegistry, ThreadId};
//! use guestsync::sync::{
//!     sys_mutex_create, sys_mutex_lock, sys_mutex_unlock, MutexAttributes,
//! };
//!
//! let registry = ObjectRegistry::new();
//! let thread = Arc::new(GuestThread::new(ThreadId::new(1), 1000));
//!
//! let id = sys_mutex_create(&registry, &MutexAttributes::default())?;
//! sys_mutex_lock(&thread, &registry, id, 0)?;
//! sys_mutex_unlock(&thread, &registry, id)?;
//! # Ok::<(), guestsync::Error>(())
//! ```
//!
//! ## Architecture
//!
//! The crate is organized into a small number of layers:
//!
//! - [`thread`] - guest thread handles, state flags and the host-blocking wake channel
//! - [`registry`] - id-keyed object table with a process-shared key namespace
//! - [`sync`] - the mutex and condition-variable syscalls and the waiter-queue
//!   scheduler underneath them
//! - [`savestate`] - serialization of objects and mid-syscall thread state
//! - [`Error`] and [`Result`] - guest-visible result codes plus host-side corruption
//!   reporting
//!
//! ### Savestate capture
//!
//! A snapshot may be requested while threads are blocked inside `sys_mutex_lock` or
//! `sys_cond_wait`. Such threads suspend the syscall, record where they were parked,
//! and re-enter it exactly once after restore; any operation whose scheduling decision
//! would touch a frozen thread suspends itself the same way. See the [`sync`] module
//! docs for the full protocol.

#[macro_use]
pub(crate) mod error;

pub mod registry;
pub mod savestate;
pub mod sync;
pub mod thread;

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude {
    pub use crate::registry::{KernelObject, ObjectRegistry};
    pub use crate::sync::{
        sys_cond_create, sys_cond_destroy, sys_cond_signal, sys_cond_signal_all,
        sys_cond_signal_to, sys_cond_wait, sys_mutex_create, sys_mutex_destroy, sys_mutex_lock,
        sys_mutex_trylock, sys_mutex_unlock, CondAttributes, MutexAttributes, Protocol,
        SignalResult,
    };
    pub use crate::thread::{GuestThread, ThreadFlags, ThreadId, WakeEvent};
    pub use crate::{Error, Result};
}

/// `guestsync` Result type
///
/// Convenience alias used throughout this crate for all fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

/// `guestsync` Error type
///
/// Guest-visible syscall result codes plus host-side savestate corruption. See
/// [`error::Error`] for the variant semantics.
pub use error::Error;

/// Id-keyed table every syscall resolves object ids through.
///
/// See [`registry::ObjectRegistry`] for creation, lookup and withdrawal semantics.
pub use registry::{KernelObject, ObjectRegistry};

/// Handle to one guest CPU thread and its wake channel.
///
/// See [`thread::GuestThread`] for the wake protocol.
pub use thread::{GuestThread, ThreadFlags, ThreadId, WakeEvent};
