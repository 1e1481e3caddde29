//! # skv Sync Client Core
//!
//! Purpose: Provide the wire codec, connection lifecycle, and connection pool
//! for a blocking RESP client. Command-level helpers live with the caller.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects and AUTH.
//! 2. **Strict Request/Reply**: One frame in flight per connection, no pipelining.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Usage
//!
//! ```no_run
//! use skv_client::{Command, ConnectionPool, ReplyValue};
//!
//! let pool = ConnectionPool::default();
//! let mut conn = pool.acquire("127.0.0.1", 6379, None)?;
//! conn.send(&Command::new("SET").arg("k").arg("v"))?;
//! assert_eq!(conn.read_reply()?, ReplyValue::SimpleString("OK".into()));
//! conn.release();
//! # Ok::<(), skv_client::ClientError>(())
//! ```

mod config;
mod connection;
mod error;
mod pool;
mod resp;

pub use config::{ClientConfig, DEFAULT_IO_BUFFER_SIZE};
pub use connection::{
    Connection, ConnectionIdentity, ConnectionState, LifecycleEvent, RAW_CHUNK_SIZE,
};
pub use error::{ClientError, ClientResult};
pub use pool::{ConnectionPool, LifecycleNotice, PoolStats, PooledConnection};
pub use resp::{encode_command, encode_streamed_header, read_reply, Command, ReplyValue, MAX_BULK_LEN};
