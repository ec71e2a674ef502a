//! Synchronization primitives that live inside process-shared memory.
//!
//! Everything here is `repr(C)`, valid when zero-filled, and works across
//! process boundaries: the types carry no pointers and rely only on atomic
//! words plus the kernel futex for blocking.
//!
//! # Primitives
//!
//! - [`Semaphore`]: counting semaphore with blocking, timed and non-blocking waits
//! - [`futex`]: raw wait/wake on an arbitrary shared `AtomicU32`
//!
//! # Loom Testing
//!
//! Enable the `loom` feature for concurrency verification. Under loom the
//! futex is replaced by cooperative yielding so every interleaving of the
//! counting logic can be explored.
//!
//! ```text
//! cargo test -p shm-primitives --features loom
//! ```
//!
//! The feature only makes sense for this crate on its own. Under loom the
//! semaphore holds loom atomics, so it is neither 8 bytes nor `const`
//! constructible, and crates that embed it in a fixed shared layout do not
//! build. [`futex`] works on plain `std` atomics and stays available.

pub mod futex;
pub mod semaphore;
pub mod sync;

pub use semaphore::Semaphore;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
