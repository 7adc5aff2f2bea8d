//! Wire-protocol layer: message model, resumable parsers for the memcached
//! text protocol and Redis RESP, multi-key request fragmentation and response
//! coalescing.
//!
//! Parsers are explicit state machines. A connection reads into one growing
//! contiguous buffer and calls [`RequestParser::feed`] (or
//! [`ResponseParser::feed`]) with the full unconsumed slice after every read;
//! the parser resumes from its saved cursor and reports
//! [`Step::Complete`] with the frame length once a whole message is present.
//! The caller then splits the frame off the buffer, freezes it, and calls
//! `take` to obtain the parsed message. No bytes are copied on the hot path;
//! fragment sub-requests are the one place key bytes are re-framed.

use bytes::Bytes;
use std::ops::Range;

pub mod memcache;
pub mod redis;

mod types;
pub use types::{MsgType, RedisClass};

/// Client-facing protocol of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Memcache,
    Redis,
}

/// One `feed` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More bytes are needed; feed again after the next read.
    Incomplete,
    /// A complete frame of this many bytes starts at offset zero.
    Complete(usize),
    /// The stream is malformed; the connection must be closed.
    Error(ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("malformed request")]
    BadRequest,
    #[error("malformed response")]
    BadResponse,
    #[error("key length exceeds maximum")]
    KeyTooLong,
    #[error("wrong number of arguments")]
    BadArity,
}

/// A parsed, complete request frame.
#[derive(Debug, Clone)]
pub struct Request {
    pub msg_type: MsgType,
    /// Complete on-wire bytes, ready to forward verbatim.
    pub frame: Bytes,
    /// Key positions within `frame`.
    pub keys: Vec<Range<usize>>,
    /// For key-value vector commands (MSET): the full `$len\r\nvalue\r\n`
    /// bulk of each value, parallel to `keys`.
    pub vals: Vec<Range<usize>>,
    /// RESP argument count; unused for memcached.
    pub narg: u32,
    pub noreply: bool,
    /// Client asked to terminate: read no more, drain, FIN.
    pub quit: bool,
    /// Answered locally, never forwarded.
    pub noforward: bool,
}

impl Request {
    pub fn key(&self, i: usize) -> &[u8] {
        &self.frame[self.keys[i].clone()]
    }

    pub fn first_key(&self) -> &[u8] {
        self.keys.first().map(|r| &self.frame[r.clone()]).unwrap_or(b"")
    }

    /// Multi-key requests split into one sub-request per destination server.
    pub fn fragmentable(&self) -> bool {
        self.msg_type.fragmentable() && self.keys.len() > 1
    }
}

/// A parsed, complete response frame.
#[derive(Debug, Clone)]
pub struct Response {
    pub msg_type: MsgType,
    pub frame: Bytes,
    /// Value of an integer reply (`:n\r\n`).
    pub integer: i64,
    /// Element count of a top-level multibulk reply.
    pub narg: u32,
    /// End offset of the first line, past its CRLF. For a multibulk this is
    /// where the elements begin.
    pub header_end: usize,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.msg_type.is_error_response()
    }

    /// Backend conditions that count toward the failure counter but must
    /// never trigger permanent ejection.
    pub fn is_transient_failure(&self) -> bool {
        matches!(
            self.msg_type,
            MsgType::RspRedisErrorLoading | MsgType::RspRedisErrorBusy | MsgType::RspRedisErrorOom
        )
    }
}

/// Per-protocol request parser, one per client connection.
#[derive(Debug)]
pub enum RequestParser {
    Memcache(memcache::ReqParser),
    Redis(redis::ReqParser),
}

impl RequestParser {
    pub fn new(protocol: Protocol) -> RequestParser {
        match protocol {
            Protocol::Memcache => RequestParser::Memcache(memcache::ReqParser::new()),
            Protocol::Redis => RequestParser::Redis(redis::ReqParser::new()),
        }
    }

    /// Advance over `buf`, the full unconsumed read buffer.
    pub fn feed(&mut self, buf: &[u8]) -> Step {
        match self {
            RequestParser::Memcache(p) => p.feed(buf),
            RequestParser::Redis(p) => p.feed(buf),
        }
    }

    /// Consume the parsed state into a [`Request`] over the split-off frame,
    /// resetting the parser for the next message.
    pub fn take(&mut self, frame: Bytes) -> Request {
        match self {
            RequestParser::Memcache(p) => p.take(frame),
            RequestParser::Redis(p) => p.take(frame),
        }
    }
}

/// Per-protocol response parser, one per backend connection.
#[derive(Debug)]
pub enum ResponseParser {
    Memcache(memcache::RspParser),
    Redis(redis::RspParser),
}

impl ResponseParser {
    pub fn new(protocol: Protocol) -> ResponseParser {
        match protocol {
            Protocol::Memcache => ResponseParser::Memcache(memcache::RspParser::new()),
            Protocol::Redis => ResponseParser::Redis(redis::RspParser::new()),
        }
    }

    pub fn feed(&mut self, buf: &[u8]) -> Step {
        match self {
            ResponseParser::Memcache(p) => p.feed(buf),
            ResponseParser::Redis(p) => p.feed(buf),
        }
    }

    pub fn take(&mut self, frame: Bytes) -> Response {
        match self {
            ResponseParser::Memcache(p) => p.take(frame),
            ResponseParser::Redis(p) => p.take(frame),
        }
    }
}

/// One per-backend sub-request produced by fragmenting a multi-key request.
#[derive(Debug)]
pub struct SubRequest {
    /// Destination server index.
    pub server: usize,
    /// Rebuilt wire frame addressed to that server.
    pub frame: Bytes,
}

/// The fan-out of one multi-key request.
#[derive(Debug)]
pub struct Fragments {
    pub subs: Vec<SubRequest>,
    /// Original key index -> position in `subs`. Drives reply coalescing in
    /// original key order.
    pub frag_seq: Vec<usize>,
}

/// Split a multi-key request into per-server sub-requests. Returns `None`
/// when the request is not fragmentable (single key or non-vector command);
/// such requests forward as-is.
pub fn fragment(
    req: &Request,
    route: impl FnMut(&[u8]) -> usize,
) -> Option<Fragments> {
    if !req.fragmentable() {
        return None;
    }
    match req.msg_type {
        MsgType::ReqMcGet | MsgType::ReqMcGets => Some(memcache::fragment(req, route)),
        MsgType::ReqRedisMget
        | MsgType::ReqRedisDel
        | MsgType::ReqRedisUnlink
        | MsgType::ReqRedisTouch
        | MsgType::ReqRedisMset => Some(redis::fragment(req, route)),
        _ => None,
    }
}

/// Combine the per-fragment responses of a completed multi-key request into
/// the single reply the client sees. `responses` is parallel to
/// `frags.subs`; every slot must be present.
pub fn coalesce(req: &Request, frags: &Fragments, responses: &[Response]) -> Result<Bytes, ParseError> {
    debug_assert_eq!(frags.subs.len(), responses.len());
    match req.msg_type {
        MsgType::ReqMcGet | MsgType::ReqMcGets => memcache::coalesce(responses),
        MsgType::ReqRedisMget => redis::coalesce_mget(req, frags, responses),
        MsgType::ReqRedisDel | MsgType::ReqRedisUnlink | MsgType::ReqRedisTouch => {
            redis::coalesce_integer(responses)
        }
        MsgType::ReqRedisMset => redis::coalesce_mset(responses),
        _ => Err(ParseError::BadRequest),
    }
}

/// The reply for a request answered by the proxy itself (PING and friends),
/// or `None` when the request expects no reply at all.
pub fn local_reply(req: &Request) -> Option<Bytes> {
    match req.msg_type {
        MsgType::ReqRedisPing => Some(Bytes::from_static(b"+PONG\r\n")),
        MsgType::ReqRedisCommand => Some(Bytes::from_static(b"*0\r\n")),
        MsgType::ReqRedisAuth => Some(Bytes::from_static(
            b"-ERR Client sent AUTH, but no password is set\r\n",
        )),
        _ => None,
    }
}

/// Synthesize the protocol-appropriate error line for a request the proxy
/// failed internally (no live server, timeout, backend close).
pub fn error_reply(protocol: Protocol, reason: &str) -> Bytes {
    let line = match protocol {
        Protocol::Memcache => format!("SERVER_ERROR {reason}\r\n"),
        Protocol::Redis => format!("-ERR {reason}\r\n"),
    };
    Bytes::from(line)
}
