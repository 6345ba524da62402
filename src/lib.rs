//! Asynchronous multiplexing Redis client core for single-threaded event
//! loops
//!
//! `redis-mux` multiplexes many in-flight Redis commands over a single TCP
//! (or Unix-domain, optionally TLS) connection and delivers every reply
//! through a user-supplied continuation. It is the connection/command
//! lifecycle engine of a client: the connection state machine, the
//! two-tier command queue with flow control and timeouts, RESP2/RESP3
//! reply decoding with server-push routing, and automatic reconnection.
//!
//! # Features
//!
//! - Implicit pipelining: concurrent submissions share one connection
//! - Flow control (`max_pending`) with a FIFO waiting queue and timeout
//! - Persistent commands (`SUBSCRIBE` family, `MONITOR`) with per-channel
//!   accounting
//! - Automatic reconnection with optional carry-over of buffered commands
//! - Re-entrancy-safe continuations: submit, cancel, disconnect or drop the
//!   client from inside any callback
//! - RESP3 push frames routed to a dedicated handler
//!
//! # Quick start
//!
//! ```no_run
//! use bytes::Bytes;
//! use redis_mux::Client;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> redis_mux::RedisResult<()> {
//!     let local = tokio::task::LocalSet::new();
//!     local
//!         .run_until(async {
//!             let client = Client::new();
//!             client.connect("127.0.0.1", 6379)?;
//!             client.submit(
//!                 vec![Bytes::from_static(b"PING")],
//!                 |result| println!("{result:?}"),
//!             )?;
//!             // ... keep the LocalSet running while replies arrive
//!             Ok(())
//!         })
//!         .await
//! }
//! ```
//!
//! # Threading model
//!
//! The client is single-threaded and `!Send`. One driver task per client
//! instance performs all IO; every continuation runs on that task. There
//! are no locks — serialization comes from the cooperative event loop.

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
mod connection;
pub mod core;
mod dispatch;
mod driver;
mod guard;
pub mod protocol;
mod queue;

pub use client::{Client, ErrorHandler, EventHandler, PushHandler, DEFAULT_PORT};

#[cfg(feature = "tls")]
pub use crate::core::config::TlsOptions;
pub use crate::core::{
    config::{ConnectionConfig, Endpoint, IpPreference, ReconnectConfig, MAX_TIMEOUT_MS},
    error::{CommandError, RedisError, RedisResult},
    value::Reply,
};
