//! # Client Configuration
//!
//! Socket-level knobs shared by every connection a pool opens. The struct is
//! serde-friendly so hosting applications can embed it in their own config
//! files; missing fields fall back to [`ClientConfig::default`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default size of the buffered reader and writer wrapping each socket.
pub const DEFAULT_IO_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration applied to every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout. Without one an unresponsive peer blocks forever.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Capacity of the buffered reader/writer pair.
    pub io_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
        }
    }
}

impl ClientConfig {
    /// Applies the same timeout to connect, read and write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self.read_timeout = Some(timeout);
        self.write_timeout = Some(timeout);
        self
    }
}
