#![allow(dead_code)]

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use skv_client::{ClientConfig, ConnectionPool};

pub const SECRET: &str = "s3cret";

/// Handles one decoded command; returns false to hang up.
pub type Handler = fn(&[Vec<u8>], &mut TcpStream) -> bool;

pub struct TestServer {
    pub port: u16,
    accepted: Arc<AtomicUsize>,
}

impl TestServer {
    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Serves every accepted connection on its own thread with `handler`.
pub fn spawn_server(handler: Handler) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            counter.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || serve(stream, handler));
        }
    });

    TestServer { port, accepted }
}

fn serve(mut stream: TcpStream, handler: Handler) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream.try_clone().expect("clone"));
    while let Ok(args) = read_command(&mut reader) {
        if !handler(&args, &mut stream) {
            break;
        }
    }
}

/// Small key/value script covering the commands the tests issue.
pub fn kv_handler(args: &[Vec<u8>], stream: &mut TcpStream) -> bool {
    match args[0].as_slice() {
        b"PING" => write_simple(stream, "PONG"),
        b"SET" => write_simple(stream, "OK"),
        b"GET" if args[1] == b"missing" => write_raw(stream, b"$-1\r\n"),
        b"GET" => write_bulk(stream, b"value"),
        b"INCR" => write_integer(stream, 1),
        b"ECHO" => write_bulk(stream, &args[1]),
        b"LPUSH" => write_raw(stream, b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n"),
        b"AUTH" if args[1] == SECRET.as_bytes() => write_simple(stream, "OK"),
        b"AUTH" => write_raw(stream, b"-ERR invalid password\r\n"),
        b"GARBAGE" => write_raw(stream, b"!nonsense\r\n"),
        b"HANGUP" => return false,
        b"QUIT" => {
            write_simple(stream, "OK");
            return false;
        }
        _ => write_raw(stream, b"-ERR unknown command\r\n"),
    }
    true
}

/// Accepts SET only when the streamed value matches [`pattern`]; replies with its length.
pub fn blob_handler(args: &[Vec<u8>], stream: &mut TcpStream) -> bool {
    match args[0].as_slice() {
        b"SET" if args.len() == 3 && args[2] == pattern(args[2].len()) => {
            write_integer(stream, args[2].len() as i64)
        }
        b"QUIT" => return false,
        _ => write_raw(stream, b"-ERR payload mismatch\r\n"),
    }
    true
}

/// Deterministic payload including CR, LF and NUL bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|idx| (idx % 251) as u8).collect()
}

pub fn test_config() -> ClientConfig {
    ClientConfig::default().with_timeout(Duration::from_secs(2))
}

pub fn test_pool() -> ConnectionPool {
    ConnectionPool::new(test_config())
}

pub fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "length"))
}

pub fn write_raw(stream: &mut TcpStream, frame: &[u8]) {
    let _ = stream.write_all(frame);
    let _ = stream.flush();
}

pub fn write_simple(stream: &mut TcpStream, msg: &str) {
    write_raw(stream, format!("+{msg}\r\n").as_bytes());
}

pub fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let mut frame = format!("${}\r\n", data.len()).into_bytes();
    frame.extend_from_slice(data);
    frame.extend_from_slice(b"\r\n");
    write_raw(stream, &frame);
}

pub fn write_integer(stream: &mut TcpStream, value: i64) {
    write_raw(stream, format!(":{value}\r\n").as_bytes());
}
