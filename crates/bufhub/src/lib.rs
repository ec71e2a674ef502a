//! Cross-process buffer allocation broker.
//!
//! A privileged server owns a named shared memory region made of one control
//! slot and a fixed pool of data slots. Clients lease a data slot through the
//! control slot, bind it to a Unix socket handshake connection, then issue
//! buffer requests on their own slot.
//!
//! # Architecture
//!
//! - [`region`] / [`layout`]: the versioned, fixed-size shared mapping
//! - [`rendezvous`]: the two-phase request/response exchange on one slot
//! - [`allocator`]: server-side lease table for data slots
//! - [`handshake`]: slot index announcement and liveness tracking
//! - [`registry`] / [`native`]: buffer ids and the native allocation behind them
//! - [`Server`] / [`Client`]: the two ends
//!
//! # Example
//!
//! ```no_run
//! use bufhub::{Client, HubConfig};
//!
//! let client = Client::connect(&HubConfig::from_env())?;
//! let buffer = client.create_buffer(1920, 1080)?;
//! let handle = client.get_buffer(buffer.id)?;
//! client.destroy_buffer(buffer.id)?;
//! client.finish()?;
//! # let _ = handle;
//! # Ok::<(), bufhub::HubError>(())
//! ```

pub mod allocator;
pub mod client;
pub mod config;
pub mod error;
pub mod handshake;
pub mod layout;
pub mod native;
pub mod protocol;
pub mod region;
pub mod registry;
pub mod rendezvous;
pub mod server;

pub use client::{BufferInfo, Client};
pub use config::HubConfig;
pub use error::{HubError, Violation};
pub use native::{MemfdAllocator, NativeAllocator, NativeBuffer};
pub use protocol::{NativeHandle, Request, Response};
pub use region::SharedRegion;
pub use server::{Server, ServerHandle};
