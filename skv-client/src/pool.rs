//! # Connection Pool
//!
//! Purpose: Reuse authenticated TCP sessions across short-lived callers to
//! avoid repeated connect and AUTH round trips.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections are parked per target and
//!    handed out again without touching the network.
//! 2. **Minimal Locking**: One mutex guards the idle/leased bookkeeping; it is
//!    never held across socket I/O or while a connection is being dropped.
//! 3. **Reuse or Create**: Acquire never waits for another caller's lease.
//! 4. **Explicit Ownership**: The pool is a plain value; tests build isolated
//!    pools and drop them when done.
//!
//! ## Bookkeeping
//!
//! ```text
//! PoolInner
//!   └── entries: Mutex<HashMap<PoolKey, PoolEntry>>
//!         └── PoolEntry
//!               ├── idle:   VecDeque<Connection>   (owned, Ready)
//!               └── leased: HashSet<Uuid>          (owned by a PooledConnection)
//! ```
//!
//! A connection id is in exactly one of `idle` / `leased` at any instant.

use std::collections::VecDeque;
use std::fmt;
use std::io::Read;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionIdentity, LifecycleEvent};
use crate::error::ClientResult;
use crate::resp::{Command, ReplyValue};

/// Pool lookup key: one bucket per target and credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    host: String,
    port: u16,
    secret: Option<String>,
}

impl PoolKey {
    fn new(host: &str, port: u16, secret: Option<&str>) -> Self {
        PoolKey {
            host: host.to_string(),
            port,
            secret: secret.map(str::to_owned),
        }
    }

    fn of(identity: &ConnectionIdentity) -> Self {
        PoolKey {
            host: identity.host.clone(),
            port: identity.port,
            secret: identity.secret.clone(),
        }
    }
}

#[derive(Default)]
struct PoolEntry {
    idle: VecDeque<Connection>,
    leased: HashSet<Uuid>,
}

impl PoolEntry {
    fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.leased.is_empty()
    }
}

/// Lifecycle notification delivered to pool subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleNotice {
    pub id: Uuid,
    pub host: String,
    pub port: u16,
    pub event: LifecycleEvent,
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened by the pool.
    pub created: u64,
    /// Acquires served from the idle set.
    pub reused: u64,
    /// Connections dropped instead of returned to idle.
    pub discarded: u64,
    /// Connections currently idle across all keys.
    pub idle: usize,
    /// Connections currently leased across all keys.
    pub leased: usize,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    discarded: AtomicU64,
}

struct PoolInner {
    config: ClientConfig,
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
    counters: PoolCounters,
    subscribers: Mutex<Vec<mpsc::Sender<LifecycleNotice>>>,
}

impl PoolInner {
    fn checkout_idle(&self, key: &PoolKey) -> Option<Connection> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(key)?;
        let conn = entry.idle.pop_back()?;
        entry.leased.insert(conn.id());
        Some(conn)
    }

    fn register_lease(&self, key: PoolKey, id: Uuid) {
        let mut entries = self.entries.lock();
        entries.entry(key).or_default().leased.insert(id);
    }

    fn check_in(&self, conn: Connection) {
        let key = PoolKey::of(conn.identity());
        let id = conn.id();
        let rejected = {
            let mut entries = self.entries.lock();
            if conn.is_ready() {
                let entry = entries.entry(key).or_default();
                entry.leased.remove(&id);
                entry.idle.push_back(conn);
                None
            } else {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.leased.remove(&id);
                    if entry.is_empty() {
                        entries.remove(&key);
                    }
                }
                Some(conn)
            }
        };

        match rejected {
            Some(conn) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(id = %id, state = ?conn.state(), "discarding released connection");
                drop(conn);
            }
            None => debug!(id = %id, "connection returned to idle"),
        }
    }

    fn evict(&self, identity: &ConnectionIdentity) {
        let key = PoolKey::of(identity);
        let evicted: Vec<Connection> = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            entry.leased.remove(&identity.id);
            let mut evicted = Vec::new();
            let mut idx = 0;
            while idx < entry.idle.len() {
                if entry.idle[idx].id() == identity.id {
                    evicted.extend(entry.idle.remove(idx));
                } else {
                    idx += 1;
                }
            }
            evicted
        };
        // Dropped outside the lock: closing re-enters `evict`.
        drop(evicted);
    }

    fn publish(&self, identity: &ConnectionIdentity, event: LifecycleEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        let notice = LifecycleNotice {
            id: identity.id,
            host: identity.host.clone(),
            port: identity.port,
            event,
        };
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }
}

/// Back-reference from a pooled connection to its pool.
///
/// Weak so that idle connections do not keep their own pool alive.
#[derive(Clone)]
pub(crate) struct PoolLink {
    pool: Weak<PoolInner>,
}

impl PoolLink {
    pub(crate) fn notify(&self, identity: &ConnectionIdentity, event: LifecycleEvent) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if event == LifecycleEvent::Disconnected {
            pool.evict(identity);
        }
        pool.publish(identity, event);
    }
}

/// Connection pool handle. Clones share the same registry.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(ClientConfig::default())
    }
}

impl ConnectionPool {
    /// Creates an empty pool; every connection it opens uses `config`.
    pub fn new(config: ClientConfig) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                entries: Mutex::new(HashMap::new()),
                counters: PoolCounters::default(),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Leases a connection for `host:port` authenticated with `secret`.
    ///
    /// An idle connection for the same key is reused without network I/O;
    /// otherwise a new one is opened. Never waits on other leases.
    pub fn acquire(
        &self,
        host: &str,
        port: u16,
        secret: Option<&str>,
    ) -> ClientResult<PooledConnection> {
        let key = PoolKey::new(host, port, secret);
        if let Some(conn) = self.inner.checkout_idle(&key) {
            self.inner.counters.reused.fetch_add(1, Ordering::Relaxed);
            debug!(id = %conn.id(), host, port, "reusing idle connection");
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        let identity = ConnectionIdentity::new(host, port, secret.map(str::to_owned));
        let link = PoolLink {
            pool: Arc::downgrade(&self.inner),
        };
        let mut conn = Connection::new(identity, &self.inner.config).with_link(link);
        conn.open()?;

        self.inner.register_lease(key, conn.id());
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(id = %conn.id(), host, port, "leased new connection");
        Ok(PooledConnection::new(self.inner.clone(), conn))
    }

    /// Closes every idle connection. Leased connections are left alone.
    ///
    /// Returns the number of connections closed.
    pub fn drain(&self) -> usize {
        let drained: Vec<Connection> = {
            let mut entries = self.inner.entries.lock();
            let drained: Vec<Connection> = entries
                .values_mut()
                .flat_map(|entry| entry.idle.drain(..))
                .collect();
            entries.retain(|_, entry| !entry.is_empty());
            drained
        };

        let count = drained.len();
        for mut conn in drained {
            conn.close();
        }
        self.inner
            .counters
            .discarded
            .fetch_add(count as u64, Ordering::Relaxed);
        info!(count, "drained idle connections");
        count
    }

    /// Receives every lifecycle notification emitted from now on.
    pub fn subscribe(&self) -> mpsc::Receiver<LifecycleNotice> {
        let (tx, rx) = mpsc::channel();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    pub fn idle_count(&self, host: &str, port: u16, secret: Option<&str>) -> usize {
        let key = PoolKey::new(host, port, secret);
        self.inner
            .entries
            .lock()
            .get(&key)
            .map_or(0, |entry| entry.idle.len())
    }

    pub fn leased_count(&self, host: &str, port: u16, secret: Option<&str>) -> usize {
        let key = PoolKey::new(host, port, secret);
        self.inner
            .entries
            .lock()
            .get(&key)
            .map_or(0, |entry| entry.leased.len())
    }

    /// Returns a snapshot of counters and current idle/leased totals.
    pub fn stats(&self) -> PoolStats {
        let (idle, leased) = {
            let entries = self.inner.entries.lock();
            entries.values().fold((0, 0), |(idle, leased), entry| {
                (idle + entry.idle.len(), leased + entry.leased.len())
            })
        };
        let counters = &self.inner.counters;
        PoolStats {
            created: counters.created.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            idle,
            leased,
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// RAII lease returning the connection to its pool on drop.
///
/// Read access goes through `Deref`; I/O goes through the lease's own
/// methods. The leased `Connection` itself is never handed out mutably, so
/// it cannot be swapped for another instance behind the pool's back:
///
/// ```compile_fail
/// # use skv_client::{ClientConfig, Connection, ConnectionIdentity, ConnectionPool};
/// let pool = ConnectionPool::default();
/// let mut lease = pool.acquire("127.0.0.1", 6379, None).unwrap();
/// let mut other = Connection::new(ConnectionIdentity::new("db", 6379, None), &ClientConfig::default());
/// std::mem::swap(&mut *lease, &mut other);
/// ```
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }

    /// Ends the lease. Ready connections go back to idle, others are discarded.
    pub fn release(mut self) {
        self.check_in();
    }

    pub fn send(&mut self, command: &Command) -> ClientResult<()> {
        self.conn_mut().send(command)
    }

    pub fn read_reply(&mut self) -> ClientResult<ReplyValue> {
        self.conn_mut().read_reply()
    }

    pub fn exec(&mut self, command: &Command) -> ClientResult<ReplyValue> {
        self.conn_mut().exec(command)
    }

    pub fn send_raw<R: Read>(&mut self, source: &mut R) -> ClientResult<u64> {
        self.conn_mut().send_raw(source)
    }

    pub fn send_with_payload<R: Read>(
        &mut self,
        command: &Command,
        payload_len: u64,
        source: &mut R,
    ) -> ClientResult<()> {
        self.conn_mut().send_with_payload(command, payload_len, source)
    }

    /// Closes the leased connection; the pool discards it on release.
    pub fn close(&mut self) {
        self.conn_mut().close();
    }

    fn conn_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until released")
    }

    fn check_in(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.publish(conn.identity(), LifecycleEvent::Released);
            debug!(id = %conn.id(), event = ?LifecycleEvent::Released, "connection lifecycle event");
            self.pool.check_in(conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.check_in();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish()
    }
}
