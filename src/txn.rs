use bytes::BytesMut;
use strum::Display;

use crate::clock::now_us;
use crate::error::{Error, Result};

/// The header the frontend scans for. Matches the literal the reference
/// implementation's `http_get_unique_id` looks for, including the trailing
/// space before the digits.
const ID_HEADER: &[u8] = b"X-Unique-ID: ";

/// Per-connection state machine stages (§4.C).
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum Stage {
    Accepting,
    ReadingRequest,
    Routing,
    AwaitingResponse,
    WritingResponse,
    Done,
}

/// Which upstream a transaction is, or will be, talking to.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum UpstreamKind {
    Trusted(usize),
    Sandbox,
}

impl UpstreamKind {
    pub fn is_sandbox(&self) -> bool {
        matches!(self, UpstreamKind::Sandbox)
    }
}

/// One in-flight client request/response exchange (§3). Owned exclusively
/// by the task driving it; never shared across tasks. The subset of state
/// the verdict channel needs to observe concurrently lives in
/// [`crate::verdict::TxnHandle`] instead.
pub struct Transaction {
    pub id: i64,
    pub stage: Stage,
    pub upstream_kind: Option<UpstreamKind>,
    pub req_buf: BytesMut,
    pub res_buf: BytesMut,
    pub enqueue_seq: u64,

    pub t_accept: i64,
    pub t_request_done: i64,
    pub t_upstream_write_done: i64,
    pub t_response_done: i64,
    pub t_reply_done: i64,
}

impl Transaction {
    pub fn new(enqueue_seq: u64) -> Self {
        let now = now_us();
        Transaction {
            id: -1,
            stage: Stage::Accepting,
            upstream_kind: None,
            req_buf: BytesMut::new(),
            res_buf: BytesMut::new(),
            enqueue_seq,
            t_accept: now,
            t_request_done: 0,
            t_upstream_write_done: 0,
            t_response_done: 0,
            t_reply_done: 0,
        }
    }

    /// Appends `bytes` to `req_buf`, returning the new length.
    /// Fails with [`Error::parse_failure`] once `max_msg` would be exceeded.
    pub fn append_request(&mut self, bytes: &[u8], max_msg: usize) -> Result<usize> {
        if self.req_buf.len() + bytes.len() > max_msg {
            return Err(Error::parse_failure());
        }
        self.req_buf.extend_from_slice(bytes);
        Ok(self.req_buf.len())
    }

    /// True iff the tail of `req_buf` is `CRLF`. This is deliberately not a
    /// blank-line (`CRLFCRLF`) check: it matches the reference's
    /// `buffer[length-2..length] == "\r\n"` test (§6), which is what bounds
    /// an attacker's control over request framing, not full HTTP parsing.
    pub fn headers_complete(&self) -> bool {
        let buf = &self.req_buf;
        buf.len() >= 2 && buf[buf.len() - 2] == b'\r' && buf[buf.len() - 1] == b'\n'
    }

    /// Linear scan for `X-Unique-ID: <digits>` anywhere in `req_buf`.
    pub fn parse_id(&self) -> Option<i64> {
        let buf = &self.req_buf[..];
        let pos = find_subslice(buf, ID_HEADER)?;
        let start = pos + ID_HEADER.len();
        let mut end = start;
        while end < buf.len() && buf[end].is_ascii_digit() {
            end += 1;
        }
        if end == start {
            return None;
        }
        std::str::from_utf8(&buf[start..end]).ok()?.parse().ok()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn_with(body: &[u8]) -> Transaction {
        let mut t = Transaction::new(0);
        t.append_request(body, 1_000_000).unwrap();
        t
    }

    #[test]
    fn headers_complete_requires_trailing_crlf() {
        let t = txn_with(b"GET / HTTP/1.0\r\nX-Unique-ID: 7\r\n\r\n");
        assert!(t.headers_complete());

        let t = txn_with(b"GET / HTTP/1.0\r\nX-Unique-ID: 7\r\n");
        assert!(t.headers_complete());

        let t = txn_with(b"GET / HTTP/1.0\r\nX-Unique-ID: 7");
        assert!(!t.headers_complete());
    }

    #[test]
    fn parse_id_finds_decimal_value() {
        let t = txn_with(b"GET / HTTP/1.0\r\nX-Unique-ID: 42\r\n\r\n");
        assert_eq!(t.parse_id(), Some(42));
    }

    #[test]
    fn parse_id_absent_returns_none() {
        let t = txn_with(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(t.parse_id(), None);
    }

    #[test]
    fn append_request_enforces_max_msg() {
        let mut t = Transaction::new(0);
        assert!(t.append_request(&[0u8; 10], 10).is_ok());
        assert!(t.append_request(&[0u8; 1], 10).is_err());
    }
}
