//! Connection provider for the sqlpipe gateway.
//!
//! The gateway treats this crate as a black box: it acquires a handle,
//! borrows it for as long as the client keeps the logical connection open,
//! and drops it to hand it back. Handles that went bad are poisoned so they
//! are discarded instead of being parked in the idle set.

mod async_pool;
#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
mod postgres;

pub use async_pool::{AcquireError, AsyncPool, AsyncPooled, CancelToken, FactoryFuture};
#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub use postgres::{PgConn, PgPool, PgPoolConfig};
