//! Per-key load locks for seqfetch.
//!
//! A [`LoadLockRegistry`] guarantees that, for any key, at most one fetch is
//! in flight at a time. The first caller to [`acquire`](LoadLockRegistry::acquire)
//! a key becomes its owner and must publish a value or a failure; every
//! concurrent caller gets a [`WaitHandle`] and observes the same outcome.
//!
//! # Design Rules
//!
//! 1. Registry entries exist only while a fetch is pending. Publishing (or
//!    failing) removes the entry, so a later request starts a fresh fetch
//!    instead of reusing stale lock state.
//! 2. An owner that is dropped without publishing (early return, panic)
//!    releases its waiters with [`LockError::Abandoned`].
//! 3. The key space is striped over independently locked shards so
//!    unrelated keys never contend on one mutex.

pub mod error;
pub mod registry;

pub use error::LockError;
pub use registry::{Acquired, LoadLockRegistry, OwnerGuard, WaitHandle};
