//! # RESP Encoding and Parsing
//!
//! Purpose: Encode client commands and parse server replies with no I/O of
//! their own, so the connection layer decides how bytes reach the socket.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Caller provides buffers to avoid per-call allocations.
//! 3. **Binary-Safe**: Arguments and bulk strings are raw bytes with byte lengths.
//! 4. **Fail Fast**: Invalid framing returns protocol errors immediately.
//!
//! ## Wire Forms
//!
//! ```text
//! request : *<n>\r\n  then n x  $<len>\r\n<bytes>\r\n
//! replies : +<text>\r\n   -<message>\r\n   :<i64>\r\n
//!           $<len>\r\n<bytes>\r\n  ($-1 = nil)   *<n>\r\n<n replies>
//! ```

use std::borrow::Cow;
use std::io::{self, BufRead};

use bytes::Bytes;

use crate::error::{ClientError, ClientResult};

/// Largest bulk payload accepted from a server (matches the usual 512 MiB server cap).
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on speculative array preallocation.
const MAX_ARRAY_PREALLOC: usize = 1024;

/// Deepest array nesting accepted before the reply is rejected.
const MAX_NESTING: usize = 512;

/// Decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    /// `$-1`.
    Nil,
    /// `:123`.
    Integer(i64),
    /// `+OK` or `+PONG` style status text.
    SimpleString(String),
    /// `$...` binary-safe payload.
    BulkString(Bytes),
    /// `-ERR ...` replies. A legitimate outcome, not a transport failure.
    Error(String),
    /// `*...` ordered sub-replies.
    Array(Vec<ReplyValue>),
}

impl ReplyValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, ReplyValue::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReplyValue::Error(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ReplyValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Raw payload of a bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ReplyValue::BulkString(data) => Some(data),
            _ => None,
        }
    }

    /// Text view of string-like replies.
    ///
    /// Bulk payloads are decoded as UTF-8 with invalid sequences replaced.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            ReplyValue::SimpleString(text) | ReplyValue::Error(text) => {
                Some(Cow::Borrowed(text.as_str()))
            }
            ReplyValue::BulkString(data) => Some(String::from_utf8_lossy(data)),
            _ => None,
        }
    }
}

/// One request: a command token followed by opaque argument payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Self {
        Command {
            name: Bytes::copy_from_slice(name.as_ref()),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends several arguments in order.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.args
            .extend(args.into_iter().map(|arg| Bytes::copy_from_slice(arg.as_ref())));
        self
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Encodes the command into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        encode_command(self, &mut out);
        out
    }

    fn encoded_len_hint(&self) -> usize {
        // 16 bytes covers the `$<len>\r\n` + trailing `\r\n` framing of typical args.
        16 + self.name.len() + self.args.iter().map(|arg| arg.len() + 16).sum::<usize>()
    }
}

/// Encodes a command as a RESP array of bulk strings into `out`.
pub fn encode_command(command: &Command, out: &mut Vec<u8>) {
    push_array_header(out, command.args.len() + 1);
    push_bulk(out, &command.name);
    for arg in &command.args {
        push_bulk(out, arg);
    }
}

/// Encodes a command whose final argument (`payload_len` bytes) is streamed
/// separately, ending right after that argument's `$<len>\r\n` header.
pub fn encode_streamed_header(command: &Command, payload_len: u64, out: &mut Vec<u8>) {
    push_array_header(out, command.args.len() + 2);
    push_bulk(out, &command.name);
    for arg in &command.args {
        push_bulk(out, arg);
    }
    out.push(b'$');
    push_u64(out, payload_len);
    out.extend_from_slice(b"\r\n");
}

/// Reads exactly one reply from the buffered reader.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<ReplyValue> {
    read_value(reader, line_buf, 0)
}

fn read_value<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<ReplyValue> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        // A stray blank line is tolerated once.
        read_line(reader, line_buf)?;
        if line_buf.is_empty() {
            return Err(ClientError::protocol("zero length reply after retry"));
        }
    }

    match line_buf[0] {
        b'+' => Ok(ReplyValue::SimpleString(lossy_text(&line_buf[1..]))),
        b'-' => Ok(ReplyValue::Error(lossy_text(&line_buf[1..]))),
        b':' => parse_i64(&line_buf[1..])
            .map(ReplyValue::Integer)
            .ok_or_else(|| ClientError::protocol("invalid integer reply")),
        b'$' => {
            let len = parse_i64(&line_buf[1..])
                .ok_or_else(|| ClientError::protocol("invalid bulk length"))?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])
                .ok_or_else(|| ClientError::protocol("invalid array length"))?;
            read_array(reader, len, line_buf, depth)
        }
        other => Err(ClientError::protocol(format!(
            "unexpected reply type byte 0x{other:02x}"
        ))),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> ClientResult<ReplyValue> {
    if len == -1 {
        return Ok(ReplyValue::Nil);
    }
    if len < 0 || len > MAX_BULK_LEN {
        return Err(ClientError::protocol(format!("bulk length {len} out of range")));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data)?;

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ClientError::protocol("bulk string missing terminator"));
    }

    Ok(ReplyValue::BulkString(Bytes::from(data)))
}

fn read_array<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<ReplyValue> {
    // `*0` and `*-1` both decode as an empty array.
    if len <= 0 {
        return Ok(ReplyValue::Array(Vec::new()));
    }

    if depth >= MAX_NESTING {
        return Err(ClientError::protocol("array nesting too deep"));
    }

    let len = len as usize;
    let mut items = Vec::with_capacity(len.min(MAX_ARRAY_PREALLOC));
    for _ in 0..len {
        items.push(read_value(reader, line_buf, depth + 1)?);
    }
    Ok(ReplyValue::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 || buf.last() != Some(&b'\n') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream ended mid-reply").into());
    }
    // A bare LF counts as the blank line tolerated by `read_value`.
    if buf.len() == 1 {
        buf.clear();
        return Ok(());
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::protocol("line not terminated by CRLF"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn lossy_text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, data),
    };
    if digits.is_empty() {
        return None;
    }

    // Accumulate toward the sign so i64::MIN parses without overflow.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return None;
        }
        let digit = (b - b'0') as i64;
        value = value.checked_mul(10)?;
        value = if negative {
            value.checked_sub(digit)?
        } else {
            value.checked_add(digit)?
        };
    }
    Some(value)
}

fn push_array_header(out: &mut Vec<u8>, count: usize) {
    out.push(b'*');
    push_u64(out, count as u64);
    out.extend_from_slice(b"\r\n");
}

fn push_bulk(out: &mut Vec<u8>, data: &[u8]) {
    out.push(b'$');
    push_u64(out, data.len() as u64);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

fn push_u64(out: &mut Vec<u8>, mut value: u64) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.push(buf[idx]);
    }
}
