//! mcprobe: a memcached text protocol probe client
//!
//! Sends request buffers holding one or more pipelined commands and
//! reassembles the server's replies:
//! - Storage commands produce one line, or none with `noreply`
//! - Retrieval commands produce VALUE blocks terminated by END
//! - Stats produce STAT lines terminated by END
//! - Everything else produces a single line
//!
//! Each client owns one TCP connection and transparently reconnects when
//! the server closed it between requests.

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod escape;
pub mod protocol;
pub mod reply;

#[cfg(test)]
mod testing;

pub use client::MemcachedClient;
pub use config::{ClientConfig, Config};
pub use connection::Endpoint;
pub use error::{ClientError, Result};
pub use reply::{Reply, ReplyError, ValueBlock};
