//! # Pool Benchmark Harness
//!
//! Purpose: Measure how much the connection pool saves over opening a fresh
//! session per request, against a live RESP server.
//!
//! ## Design Principles
//! 1. **Same Workload**: Both passes issue the same PING round trip.
//! 2. **Setup Amortization**: The pooled pass pays connect/AUTH once; the
//!    fresh pass pays it on every operation.
//! 3. **Positional Args**: `skv-bench [host] [port] [ops] [secret]`.

use std::env;
use std::hint::black_box;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use skv_client::{
    ClientConfig, Command, Connection, ConnectionIdentity, ConnectionPool, ReplyValue,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_OP_COUNT: usize = 10_000;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct BenchConfig {
    host: String,
    port: u16,
    op_count: usize,
    secret: Option<String>,
}

impl BenchConfig {
    fn from_args() -> Result<Self> {
        let mut args = env::args().skip(1);
        let host = args.next().unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match args.next() {
            Some(raw) => raw.parse().with_context(|| format!("invalid port {raw:?}"))?,
            None => DEFAULT_PORT,
        };
        let op_count = parse_usize(args.next(), DEFAULT_OP_COUNT).max(1);
        let secret = args.next();

        Ok(BenchConfig {
            host,
            port,
            op_count,
            secret,
        })
    }
}

fn parse_usize(value: Option<String>, fallback: usize) -> usize {
    value.and_then(|raw| raw.parse().ok()).unwrap_or(fallback)
}

fn report(label: &str, ops: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let ops_per_sec = (ops as f64) / secs;
    let nanos_per_op = (secs * 1e9) / (ops as f64);
    println!(
        "{label}: {ops} ops in {secs:.3}s ({ops_per_sec:.0} ops/s, {nanos_per_op:.1} ns/op)"
    );
}

fn expect_pong(reply: ReplyValue) -> Result<()> {
    match reply {
        ReplyValue::SimpleString(text) if text == "PONG" => Ok(()),
        other => bail!("unexpected PING reply: {other:?}"),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("skv-bench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let config = BenchConfig::from_args()?;
    let client_config = ClientConfig::default().with_timeout(DEFAULT_TIMEOUT);
    let pool = ConnectionPool::new(client_config.clone());
    let secret = config.secret.as_deref();
    let ping = Command::new("PING");

    info!(host = %config.host, port = config.port, ops = config.op_count, "starting benchmark");

    // Warm the pool so the first pooled op does not pay setup cost.
    pool.acquire(&config.host, config.port, secret)
        .context("initial acquire failed")?
        .release();

    let start = Instant::now();
    for _ in 0..config.op_count {
        let mut conn = pool
            .acquire(&config.host, config.port, secret)
            .context("pooled acquire failed")?;
        expect_pong(black_box(conn.exec(&ping)?))?;
        conn.release();
    }
    report("pooled PING", config.op_count, start.elapsed());

    let start = Instant::now();
    for _ in 0..config.op_count {
        let identity =
            ConnectionIdentity::new(config.host.as_str(), config.port, config.secret.clone());
        let mut conn = Connection::new(identity, &client_config);
        conn.open().context("fresh open failed")?;
        expect_pong(black_box(conn.exec(&ping)?))?;
        conn.close();
    }
    report("fresh PING", config.op_count, start.elapsed());

    let stats = pool.stats();
    info!(
        created = stats.created,
        reused = stats.reused,
        discarded = stats.discarded,
        "pool stats"
    );
    pool.drain();
    Ok(())
}
