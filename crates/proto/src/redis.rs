//! Redis RESP: request and response state machines, `MGET`/`DEL`/`MSET`
//! fragmentation and reply coalescing.
//!
//! Requests are `*N\r\n` arrays of bulk strings; the first bulk is the
//! command name, matched case-insensitively against the closed command set
//! and classified by argument shape ([`RedisClass`]). Responses cover all
//! five RESP leading bytes, including nested multibulks and the `$-1`/`*-1`
//! nulls.

use crate::types::RedisClass;
use crate::{Fragments, MsgType, ParseError, Request, Response, Step, SubRequest};
use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Find the next LF at or after `from` and validate the byte before it is
/// CR. Returns the offset just past the LF.
fn find_crlf(buf: &[u8], from: usize) -> Result<Option<usize>, ParseError> {
    match memchr::memchr(LF, &buf[from..]) {
        None => Ok(None),
        Some(i) => {
            let lf = from + i;
            if lf == 0 || buf[lf - 1] != CR {
                return Err(ParseError::BadRequest);
            }
            Ok(Some(lf + 1))
        }
    }
}

fn parse_decimal(digits: &[u8]) -> Option<i64> {
    if digits.is_empty() {
        return None;
    }
    let (neg, digits) = match digits[0] {
        b'-' => (true, &digits[1..]),
        _ => (false, digits),
    };
    if digits.is_empty() || digits.len() > 18 {
        return None;
    }
    let mut v: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        v = v * 10 + (d - b'0') as i64;
    }
    Some(if neg { -v } else { v })
}

fn lookup_command(name: &[u8]) -> Option<MsgType> {
    if name.len() > 24 {
        return None;
    }
    let mut buf = [0u8; 24];
    for (i, &b) in name.iter().enumerate() {
        buf[i] = b.to_ascii_lowercase();
    }
    use MsgType::*;
    let t = match &buf[..name.len()] {
        b"del" => ReqRedisDel,
        b"exists" => ReqRedisExists,
        b"expire" => ReqRedisExpire,
        b"expireat" => ReqRedisExpireat,
        b"pexpire" => ReqRedisPexpire,
        b"pexpireat" => ReqRedisPexpireat,
        b"persist" => ReqRedisPersist,
        b"pttl" => ReqRedisPttl,
        b"sort" => ReqRedisSort,
        b"ttl" => ReqRedisTtl,
        b"type" => ReqRedisType,
        b"touch" => ReqRedisTouch,
        b"unlink" => ReqRedisUnlink,
        b"move" => ReqRedisMove,
        b"copy" => ReqRedisCopy,
        b"dump" => ReqRedisDump,
        b"restore" => ReqRedisRestore,
        b"append" => ReqRedisAppend,
        b"bitcount" => ReqRedisBitcount,
        b"bitpos" => ReqRedisBitpos,
        b"bitfield" => ReqRedisBitfield,
        b"decr" => ReqRedisDecr,
        b"decrby" => ReqRedisDecrby,
        b"get" => ReqRedisGet,
        b"getbit" => ReqRedisGetbit,
        b"getdel" => ReqRedisGetdel,
        b"getex" => ReqRedisGetex,
        b"getrange" => ReqRedisGetrange,
        b"getset" => ReqRedisGetset,
        b"incr" => ReqRedisIncr,
        b"incrby" => ReqRedisIncrby,
        b"incrbyfloat" => ReqRedisIncrbyfloat,
        b"mget" => ReqRedisMget,
        b"mset" => ReqRedisMset,
        b"psetex" => ReqRedisPsetex,
        b"set" => ReqRedisSet,
        b"setbit" => ReqRedisSetbit,
        b"setex" => ReqRedisSetex,
        b"setnx" => ReqRedisSetnx,
        b"setrange" => ReqRedisSetrange,
        b"strlen" => ReqRedisStrlen,
        b"hdel" => ReqRedisHdel,
        b"hexists" => ReqRedisHexists,
        b"hget" => ReqRedisHget,
        b"hgetall" => ReqRedisHgetall,
        b"hincrby" => ReqRedisHincrby,
        b"hincrbyfloat" => ReqRedisHincrbyfloat,
        b"hkeys" => ReqRedisHkeys,
        b"hlen" => ReqRedisHlen,
        b"hmget" => ReqRedisHmget,
        b"hmset" => ReqRedisHmset,
        b"hrandfield" => ReqRedisHrandfield,
        b"hscan" => ReqRedisHscan,
        b"hset" => ReqRedisHset,
        b"hsetnx" => ReqRedisHsetnx,
        b"hstrlen" => ReqRedisHstrlen,
        b"hvals" => ReqRedisHvals,
        b"lindex" => ReqRedisLindex,
        b"linsert" => ReqRedisLinsert,
        b"llen" => ReqRedisLlen,
        b"lmove" => ReqRedisLmove,
        b"lpop" => ReqRedisLpop,
        b"lpos" => ReqRedisLpos,
        b"lpush" => ReqRedisLpush,
        b"lpushx" => ReqRedisLpushx,
        b"lrange" => ReqRedisLrange,
        b"lrem" => ReqRedisLrem,
        b"lset" => ReqRedisLset,
        b"ltrim" => ReqRedisLtrim,
        b"rpop" => ReqRedisRpop,
        b"rpoplpush" => ReqRedisRpoplpush,
        b"rpush" => ReqRedisRpush,
        b"rpushx" => ReqRedisRpushx,
        b"sadd" => ReqRedisSadd,
        b"scard" => ReqRedisScard,
        b"sdiff" => ReqRedisSdiff,
        b"sdiffstore" => ReqRedisSdiffstore,
        b"sinter" => ReqRedisSinter,
        b"sinterstore" => ReqRedisSinterstore,
        b"sismember" => ReqRedisSismember,
        b"smembers" => ReqRedisSmembers,
        b"smismember" => ReqRedisSmismember,
        b"smove" => ReqRedisSmove,
        b"spop" => ReqRedisSpop,
        b"srandmember" => ReqRedisSrandmember,
        b"srem" => ReqRedisSrem,
        b"sscan" => ReqRedisSscan,
        b"sunion" => ReqRedisSunion,
        b"sunionstore" => ReqRedisSunionstore,
        b"zadd" => ReqRedisZadd,
        b"zcard" => ReqRedisZcard,
        b"zcount" => ReqRedisZcount,
        b"zdiff" => ReqRedisZdiff,
        b"zdiffstore" => ReqRedisZdiffstore,
        b"zincrby" => ReqRedisZincrby,
        b"zinter" => ReqRedisZinter,
        b"zinterstore" => ReqRedisZinterstore,
        b"zlexcount" => ReqRedisZlexcount,
        b"zmscore" => ReqRedisZmscore,
        b"zpopmax" => ReqRedisZpopmax,
        b"zpopmin" => ReqRedisZpopmin,
        b"zrandmember" => ReqRedisZrandmember,
        b"zrange" => ReqRedisZrange,
        b"zrangebylex" => ReqRedisZrangebylex,
        b"zrangebyscore" => ReqRedisZrangebyscore,
        b"zrangestore" => ReqRedisZrangestore,
        b"zrank" => ReqRedisZrank,
        b"zrem" => ReqRedisZrem,
        b"zremrangebylex" => ReqRedisZremrangebylex,
        b"zremrangebyrank" => ReqRedisZremrangebyrank,
        b"zremrangebyscore" => ReqRedisZremrangebyscore,
        b"zrevrange" => ReqRedisZrevrange,
        b"zrevrangebylex" => ReqRedisZrevrangebylex,
        b"zrevrangebyscore" => ReqRedisZrevrangebyscore,
        b"zrevrank" => ReqRedisZrevrank,
        b"zscan" => ReqRedisZscan,
        b"zscore" => ReqRedisZscore,
        b"zunion" => ReqRedisZunion,
        b"zunionstore" => ReqRedisZunionstore,
        b"pfadd" => ReqRedisPfadd,
        b"pfcount" => ReqRedisPfcount,
        b"pfmerge" => ReqRedisPfmerge,
        b"geoadd" => ReqRedisGeoadd,
        b"geodist" => ReqRedisGeodist,
        b"geohash" => ReqRedisGeohash,
        b"geopos" => ReqRedisGeopos,
        b"georadius" => ReqRedisGeoradius,
        b"georadiusbymember" => ReqRedisGeoradiusbymember,
        b"geosearch" => ReqRedisGeosearch,
        b"geosearchstore" => ReqRedisGeosearchstore,
        b"eval" => ReqRedisEval,
        b"evalsha" => ReqRedisEvalsha,
        b"ping" => ReqRedisPing,
        b"quit" => ReqRedisQuit,
        b"auth" => ReqRedisAuth,
        b"command" => ReqRedisCommand,
        b"lolwut" => ReqRedisLolwut,
        _ => return None,
    };
    Some(t)
}

fn arity_ok(class: RedisClass, narg: u32) -> bool {
    use RedisClass::*;
    match class {
        Argz => narg == 1,
        Arg0 => narg == 2,
        Arg1 => narg == 3,
        Arg2 => narg == 4,
        Arg3 => narg == 5,
        Argn => narg >= 2,
        Argx => narg >= 2,
        Argkvx => narg >= 3 && (narg - 1) % 2 == 0,
        Argeval => narg >= 3,
        Nokey => narg >= 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Start,
    NargLine,
    ArgDollar,
    ArgLenLine,
    ArgData,
}

#[derive(Debug)]
pub struct ReqParser {
    state: ReqState,
    pos: usize,
    line_start: usize,
    /// Offset of the current arg's `$`, for whole-bulk ranges.
    bulk_start: usize,
    data_start: usize,
    data_len: usize,
    /// Zero-based index of the arg being read.
    arg_index: u32,
    narg: u32,
    msg_type: MsgType,
    class: Option<RedisClass>,
    /// EVAL/EVALSHA: keys remaining to collect after `numkeys` was read.
    eval_keys: Option<u32>,
    keys: Vec<Range<usize>>,
    vals: Vec<Range<usize>>,
}

impl ReqParser {
    pub fn new() -> ReqParser {
        ReqParser {
            state: ReqState::Start,
            pos: 0,
            line_start: 0,
            bulk_start: 0,
            data_start: 0,
            data_len: 0,
            arg_index: 0,
            narg: 0,
            msg_type: MsgType::Unknown,
            class: None,
            eval_keys: None,
            keys: Vec::new(),
            vals: Vec::new(),
        }
    }

    pub fn take(&mut self, frame: Bytes) -> Request {
        let msg_type = self.msg_type;
        let req = Request {
            msg_type,
            keys: std::mem::take(&mut self.keys),
            vals: std::mem::take(&mut self.vals),
            narg: self.narg,
            noreply: false,
            quit: msg_type == MsgType::ReqRedisQuit,
            noforward: matches!(
                msg_type,
                MsgType::ReqRedisPing
                    | MsgType::ReqRedisQuit
                    | MsgType::ReqRedisCommand
                    | MsgType::ReqRedisAuth
            ),
            frame,
        };
        *self = ReqParser::new();
        req
    }

    /// Handle one completed argument at `data_start..data_start + data_len`.
    fn on_arg(&mut self, buf: &[u8], bulk_end: usize) -> Result<(), ParseError> {
        let content = self.data_start..self.data_start + self.data_len;
        let index = self.arg_index;

        if index == 0 {
            let t = lookup_command(&buf[content]).ok_or(ParseError::UnknownCommand)?;
            let class = t.redis_class().ok_or(ParseError::UnknownCommand)?;
            // PING may carry an optional message; it is answered locally
            // either way.
            let ok = match t {
                MsgType::ReqRedisPing => self.narg <= 2,
                _ => arity_ok(class, self.narg),
            };
            if !ok {
                return Err(ParseError::BadArity);
            }
            self.msg_type = t;
            self.class = Some(class);
            return Ok(());
        }

        match self.class.expect("command classified before args") {
            RedisClass::Argz | RedisClass::Nokey => {}
            RedisClass::Arg0 | RedisClass::Arg1 | RedisClass::Arg2 | RedisClass::Arg3
            | RedisClass::Argn => {
                if index == 1 {
                    self.keys.push(content);
                }
            }
            RedisClass::Argx => {
                self.keys.push(content);
            }
            RedisClass::Argkvx => {
                if index % 2 == 1 {
                    self.keys.push(content);
                } else {
                    self.vals.push(self.bulk_start..bulk_end);
                }
            }
            RedisClass::Argeval => {
                if index == 2 {
                    // Keys occupy args 3 .. 3+numkeys; they must fit inside
                    // the argument list and at least one is required for
                    // routing.
                    let numkeys = parse_decimal(&buf[content]).ok_or(ParseError::BadRequest)?;
                    if numkeys < 1 || numkeys as u64 > self.narg as u64 - 3 {
                        return Err(ParseError::BadArity);
                    }
                    self.eval_keys = Some(numkeys as u32);
                } else if index >= 3 {
                    if let Some(remaining) = self.eval_keys {
                        if remaining > 0 {
                            self.keys.push(content);
                            self.eval_keys = Some(remaining - 1);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn feed(&mut self, buf: &[u8]) -> Step {
        use ReqState::*;

        loop {
            match self.state {
                Start => {
                    if self.pos >= buf.len() {
                        return Step::Incomplete;
                    }
                    if buf[self.pos] != b'*' {
                        // Inline commands are not supported.
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.line_start = self.pos + 1;
                    self.pos += 1;
                    self.state = NargLine;
                }

                NargLine => match find_crlf(buf, self.pos) {
                    Err(e) => return Step::Error(e),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        let narg = match parse_decimal(&buf[self.line_start..end - 2]) {
                            Some(n) if n >= 1 => n as u32,
                            _ => return Step::Error(ParseError::BadRequest),
                        };
                        self.narg = narg;
                        self.arg_index = 0;
                        self.pos = end;
                        self.state = ArgDollar;
                    }
                },

                ArgDollar => {
                    if self.pos >= buf.len() {
                        return Step::Incomplete;
                    }
                    if buf[self.pos] != b'$' {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.bulk_start = self.pos;
                    self.line_start = self.pos + 1;
                    self.pos += 1;
                    self.state = ArgLenLine;
                }

                ArgLenLine => match find_crlf(buf, self.pos) {
                    Err(e) => return Step::Error(e),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        let len = match parse_decimal(&buf[self.line_start..end - 2]) {
                            // A null bulk is not a legal request argument.
                            Some(n) if n >= 0 => n as usize,
                            _ => return Step::Error(ParseError::BadRequest),
                        };
                        self.data_start = end;
                        self.data_len = len;
                        self.pos = end;
                        self.state = ArgData;
                    }
                },

                ArgData => {
                    let data_end = self.data_start + self.data_len;
                    if buf.len() < data_end + 2 {
                        self.pos = buf.len().min(data_end);
                        return Step::Incomplete;
                    }
                    if buf[data_end] != CR || buf[data_end + 1] != LF {
                        return Step::Error(ParseError::BadRequest);
                    }
                    if let Err(e) = self.on_arg(buf, data_end + 2) {
                        return Step::Error(e);
                    }
                    self.pos = data_end + 2;
                    self.arg_index += 1;
                    if self.arg_index == self.narg {
                        return Step::Complete(self.pos);
                    }
                    self.state = ArgDollar;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RspState {
    /// Expecting a value's leading type byte.
    Type,
    StatusLine,
    ErrorLine,
    IntegerLine,
    BulkLenLine,
    BulkData,
    MultibulkLenLine,
}

#[derive(Debug)]
pub struct RspParser {
    state: RspState,
    pos: usize,
    line_start: usize,
    data_end: usize,
    /// Remaining element counts of open arrays, innermost last.
    depth: Vec<u32>,
    msg_type: MsgType,
    integer: i64,
    narg: u32,
    header_end: usize,
    top_level: bool,
    /// The line being read is a top-level error awaiting classification.
    top_error: bool,
}

impl RspParser {
    pub fn new() -> RspParser {
        RspParser {
            state: RspState::Type,
            pos: 0,
            line_start: 0,
            data_end: 0,
            depth: Vec::new(),
            msg_type: MsgType::Unknown,
            integer: 0,
            narg: 0,
            header_end: 0,
            top_level: true,
            top_error: false,
        }
    }

    pub fn take(&mut self, frame: Bytes) -> Response {
        let rsp = Response {
            msg_type: self.msg_type,
            integer: self.integer,
            narg: self.narg,
            header_end: self.header_end,
            frame,
        };
        *self = RspParser::new();
        rsp
    }

    /// A value just completed. Pop finished arrays; `true` when the whole
    /// message is complete.
    fn value_done(&mut self) -> bool {
        loop {
            match self.depth.last_mut() {
                None => return true,
                Some(remaining) => {
                    *remaining -= 1;
                    if *remaining > 0 {
                        self.state = RspState::Type;
                        return false;
                    }
                    self.depth.pop();
                }
            }
        }
    }

    fn classify_error(&mut self, line: &[u8]) {
        let word = line.split(|&b| b == b' ').next().unwrap_or(line);
        self.msg_type = match word {
            b"ERR" => MsgType::RspRedisErrorErr,
            b"OOM" => MsgType::RspRedisErrorOom,
            b"BUSY" => MsgType::RspRedisErrorBusy,
            b"NOAUTH" => MsgType::RspRedisErrorNoAuth,
            b"LOADING" => MsgType::RspRedisErrorLoading,
            b"BUSYKEY" => MsgType::RspRedisErrorBusyKey,
            b"MISCONF" => MsgType::RspRedisErrorMisconf,
            b"NOSCRIPT" => MsgType::RspRedisErrorNoScript,
            b"READONLY" => MsgType::RspRedisErrorReadonly,
            b"WRONGTYPE" => MsgType::RspRedisErrorWrongType,
            b"EXECABORT" => MsgType::RspRedisErrorExecAbort,
            b"MASTERDOWN" => MsgType::RspRedisErrorMasterDown,
            b"NOREPLICAS" => MsgType::RspRedisErrorNoReplicas,
            _ => MsgType::RspRedisError,
        };
    }

    pub fn feed(&mut self, buf: &[u8]) -> Step {
        use RspState::*;

        loop {
            match self.state {
                Type => {
                    if self.pos >= buf.len() {
                        return Step::Incomplete;
                    }
                    let top = self.top_level;
                    self.line_start = self.pos + 1;
                    self.state = match buf[self.pos] {
                        b'+' => {
                            if top {
                                self.msg_type = MsgType::RspRedisStatus;
                            }
                            StatusLine
                        }
                        b'-' => {
                            if top {
                                self.msg_type = MsgType::RspRedisError;
                                self.top_error = true;
                            }
                            ErrorLine
                        }
                        b':' => {
                            if top {
                                self.msg_type = MsgType::RspRedisInteger;
                            }
                            IntegerLine
                        }
                        b'$' => {
                            if top {
                                self.msg_type = MsgType::RspRedisBulk;
                            }
                            BulkLenLine
                        }
                        b'*' => {
                            if top {
                                self.msg_type = MsgType::RspRedisMultibulk;
                            }
                            MultibulkLenLine
                        }
                        _ => return Step::Error(ParseError::BadResponse),
                    };
                    self.top_level = false;
                    self.pos += 1;
                }

                StatusLine | ErrorLine => match find_crlf(buf, self.pos) {
                    Err(_) => return Step::Error(ParseError::BadResponse),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        if self.top_error {
                            let line = self.line_start..end - 2;
                            self.classify_error(&buf[line]);
                            self.top_error = false;
                        }
                        self.pos = end;
                        if self.value_done() {
                            return Step::Complete(self.pos);
                        }
                    }
                },

                IntegerLine => match find_crlf(buf, self.pos) {
                    Err(_) => return Step::Error(ParseError::BadResponse),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        let v = match parse_decimal(&buf[self.line_start..end - 2]) {
                            Some(v) => v,
                            None => return Step::Error(ParseError::BadResponse),
                        };
                        if self.depth.is_empty() {
                            self.integer = v;
                        }
                        self.pos = end;
                        if self.value_done() {
                            return Step::Complete(self.pos);
                        }
                    }
                },

                BulkLenLine => match find_crlf(buf, self.pos) {
                    Err(_) => return Step::Error(ParseError::BadResponse),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        match parse_decimal(&buf[self.line_start..end - 2]) {
                            Some(-1) => {
                                // Null bulk.
                                self.pos = end;
                                if self.value_done() {
                                    return Step::Complete(self.pos);
                                }
                            }
                            Some(n) if n >= 0 => {
                                self.data_end = end + n as usize;
                                self.pos = end;
                                self.state = BulkData;
                            }
                            _ => return Step::Error(ParseError::BadResponse),
                        }
                    }
                },

                BulkData => {
                    if buf.len() < self.data_end + 2 {
                        self.pos = buf.len().min(self.data_end);
                        return Step::Incomplete;
                    }
                    if buf[self.data_end] != CR || buf[self.data_end + 1] != LF {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.pos = self.data_end + 2;
                    if self.value_done() {
                        return Step::Complete(self.pos);
                    }
                }

                MultibulkLenLine => match find_crlf(buf, self.pos) {
                    Err(_) => return Step::Error(ParseError::BadResponse),
                    Ok(None) => {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    Ok(Some(end)) => {
                        let n = match parse_decimal(&buf[self.line_start..end - 2]) {
                            Some(n) if n >= -1 => n,
                            _ => return Step::Error(ParseError::BadResponse),
                        };
                        if self.depth.is_empty() {
                            self.narg = n.max(0) as u32;
                            self.header_end = end;
                        }
                        self.pos = end;
                        if n <= 0 {
                            // Null or empty array: a complete value.
                            if self.value_done() {
                                return Step::Complete(self.pos);
                            }
                        } else {
                            self.depth.push(n as u32);
                            self.state = Type;
                        }
                    }
                },
            }
        }
    }
}

/// Split a multi-key command into one sub-command per destination server.
/// For `MSET` each key carries its value bulk along.
pub(crate) fn fragment(req: &Request, mut route: impl FnMut(&[u8]) -> usize) -> Fragments {
    let (verb, kv): (&[u8], bool) = match req.msg_type {
        MsgType::ReqRedisMget => (b"mget", false),
        MsgType::ReqRedisDel => (b"del", false),
        MsgType::ReqRedisUnlink => (b"unlink", false),
        MsgType::ReqRedisTouch => (b"touch", false),
        MsgType::ReqRedisMset => (b"mset", true),
        _ => unreachable!("fragment() called for non-vector command"),
    };

    struct Sub {
        server: usize,
        body: BytesMut,
        narg: u32,
    }

    let mut subs: Vec<Sub> = Vec::new();
    let mut frag_seq = Vec::with_capacity(req.keys.len());

    for (i, range) in req.keys.iter().enumerate() {
        let key = &req.frame[range.clone()];
        let server = route(key);
        let ordinal = match subs.iter().position(|s| s.server == server) {
            Some(i) => i,
            None => {
                subs.push(Sub {
                    server,
                    body: BytesMut::new(),
                    narg: 0,
                });
                subs.len() - 1
            }
        };
        let sub = &mut subs[ordinal];
        sub.body
            .put_slice(format!("${}\r\n", key.len()).as_bytes());
        sub.body.put_slice(key);
        sub.body.put_slice(b"\r\n");
        sub.narg += 1;
        if kv {
            sub.body.put_slice(&req.frame[req.vals[i].clone()]);
            sub.narg += 1;
        }
        frag_seq.push(ordinal);
    }

    let subs = subs
        .into_iter()
        .map(|sub| {
            let mut frame = BytesMut::with_capacity(sub.body.len() + 32);
            frame.put_slice(
                format!("*{}\r\n${}\r\n", sub.narg + 1, verb.len()).as_bytes(),
            );
            frame.put_slice(verb);
            frame.put_slice(b"\r\n");
            frame.put_slice(&sub.body);
            SubRequest {
                server: sub.server,
                frame: frame.freeze(),
            }
        })
        .collect();

    Fragments { subs, frag_seq }
}

/// Scan one RESP element at `cursor` and return its full byte range,
/// advancing the cursor past it. Arrays are not expected inside an MGET
/// reply and are rejected.
fn copy_bulk(frame: &[u8], cursor: &mut usize) -> Result<Range<usize>, ParseError> {
    let start = *cursor;
    if start >= frame.len() {
        return Err(ParseError::BadResponse);
    }
    match frame[start] {
        b'$' => {
            let end = find_crlf(frame, start + 1)
                .map_err(|_| ParseError::BadResponse)?
                .ok_or(ParseError::BadResponse)?;
            match parse_decimal(&frame[start + 1..end - 2]) {
                Some(-1) => {
                    *cursor = end;
                    Ok(start..end)
                }
                Some(n) if n >= 0 => {
                    let total = end + n as usize + 2;
                    if frame.len() < total {
                        return Err(ParseError::BadResponse);
                    }
                    *cursor = total;
                    Ok(start..total)
                }
                _ => Err(ParseError::BadResponse),
            }
        }
        b':' | b'+' | b'-' => {
            let end = find_crlf(frame, start + 1)
                .map_err(|_| ParseError::BadResponse)?
                .ok_or(ParseError::BadResponse)?;
            *cursor = end;
            Ok(start..end)
        }
        _ => Err(ParseError::BadResponse),
    }
}

/// MGET: one multibulk, elements in original key order, header rewritten to
/// the total key count.
pub(crate) fn coalesce_mget(
    req: &Request,
    frags: &Fragments,
    responses: &[Response],
) -> Result<Bytes, ParseError> {
    let mut cursors = Vec::with_capacity(responses.len());
    for rsp in responses {
        if rsp.msg_type != MsgType::RspRedisMultibulk {
            return Err(ParseError::BadResponse);
        }
        cursors.push(rsp.header_end);
    }

    let mut out = BytesMut::new();
    out.put_slice(format!("*{}\r\n", req.keys.len()).as_bytes());
    for &ordinal in &frags.frag_seq {
        let frame = &responses[ordinal].frame;
        let range = copy_bulk(frame, &mut cursors[ordinal])?;
        out.put_slice(&frame[range]);
    }
    Ok(out.freeze())
}

/// DEL/UNLINK/TOUCH: fragment integer replies sum into one integer.
pub(crate) fn coalesce_integer(responses: &[Response]) -> Result<Bytes, ParseError> {
    let mut sum: i64 = 0;
    for rsp in responses {
        if rsp.msg_type != MsgType::RspRedisInteger {
            return Err(ParseError::BadResponse);
        }
        sum += rsp.integer;
    }
    Ok(Bytes::from(format!(":{sum}\r\n")))
}

/// MSET: every fragment must come back `+OK`.
pub(crate) fn coalesce_mset(responses: &[Response]) -> Result<Bytes, ParseError> {
    for rsp in responses {
        if rsp.msg_type != MsgType::RspRedisStatus {
            return Err(ParseError::BadResponse);
        }
    }
    Ok(Bytes::from_static(b"+OK\r\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_req(input: &[u8]) -> Request {
        let mut parser = ReqParser::new();
        match parser.feed(input) {
            Step::Complete(n) => {
                assert_eq!(n, input.len());
                parser.take(Bytes::copy_from_slice(input))
            }
            other => panic!("expected complete parse, got {other:?}"),
        }
    }

    fn parse_rsp(input: &[u8]) -> Response {
        let mut parser = RspParser::new();
        match parser.feed(input) {
            Step::Complete(n) => {
                assert_eq!(n, input.len());
                parser.take(Bytes::copy_from_slice(input))
            }
            other => panic!("expected complete parse, got {other:?}"),
        }
    }

    #[test]
    fn get_request() {
        let req = parse_req(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisGet);
        assert_eq!(req.keys.len(), 1);
        assert_eq!(req.key(0), b"k");
    }

    #[test]
    fn command_match_is_case_insensitive() {
        let req = parse_req(b"*2\r\n$3\r\nget\r\n$1\r\nk\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisGet);
        let req = parse_req(b"*2\r\n$3\r\nGeT\r\n$1\r\nk\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisGet);
    }

    #[test]
    fn set_request() {
        let req = parse_req(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisSet);
        assert_eq!(req.key(0), b"k");
    }

    #[test]
    fn mget_collects_all_keys() {
        let req = parse_req(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisMget);
        assert_eq!(req.keys.len(), 3);
        assert_eq!(req.key(2), b"c");
        assert!(req.fragmentable());
    }

    #[test]
    fn mset_collects_keys_and_value_bulks() {
        let input = b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n";
        let req = parse_req(input);
        assert_eq!(req.msg_type, MsgType::ReqRedisMset);
        assert_eq!(req.keys.len(), 2);
        assert_eq!(req.vals.len(), 2);
        assert_eq!(&req.frame[req.vals[0].clone()], b"$1\r\n1\r\n");
        assert_eq!(&req.frame[req.vals[1].clone()], b"$1\r\n2\r\n");
    }

    #[test]
    fn eval_keys_follow_numkeys() {
        let input =
            b"*5\r\n$4\r\nEVAL\r\n$10\r\nreturn 1+1\r\n$1\r\n2\r\n$2\r\nk1\r\n$2\r\nk2\r\n";
        let req = parse_req(input);
        assert_eq!(req.msg_type, MsgType::ReqRedisEval);
        assert_eq!(req.keys.len(), 2);
        assert_eq!(req.key(0), b"k1");
        assert_eq!(req.key(1), b"k2");
    }

    #[test]
    fn eval_zero_numkeys_is_rejected() {
        let input = b"*3\r\n$4\r\nEVAL\r\n$8\r\nreturn 1\r\n$1\r\n0\r\n";
        let mut parser = ReqParser::new();
        assert!(matches!(
            parser.feed(input),
            Step::Error(ParseError::BadArity)
        ));
    }

    #[test]
    fn ping_is_local() {
        let req = parse_req(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisPing);
        assert!(req.noforward);
        assert_eq!(
            crate::local_reply(&req).as_deref(),
            Some(&b"+PONG\r\n"[..])
        );
    }

    #[test]
    fn ping_with_message_is_still_local() {
        let req = parse_req(b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n");
        assert_eq!(req.msg_type, MsgType::ReqRedisPing);
        assert!(req.noforward);
        assert!(req.keys.is_empty());
    }

    #[test]
    fn quit_is_local_and_terminal() {
        let req = parse_req(b"*1\r\n$4\r\nQUIT\r\n");
        assert!(req.quit);
        assert!(req.noforward);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut parser = ReqParser::new();
        assert!(matches!(
            parser.feed(b"*1\r\n$8\r\nFLUSHALL\r\n"),
            Step::Error(ParseError::UnknownCommand)
        ));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        // GET with two keys.
        let mut parser = ReqParser::new();
        assert!(matches!(
            parser.feed(b"*3\r\n$3\r\nGET\r\n$1\r\na\r\n$1\r\nb\r\n"),
            Step::Error(ParseError::BadArity)
        ));
        // MSET with an unpaired key.
        let mut parser = ReqParser::new();
        assert!(matches!(
            parser.feed(b"*4\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n"),
            Step::Error(ParseError::BadArity)
        ));
    }

    #[test]
    fn inline_requests_are_rejected() {
        let mut parser = ReqParser::new();
        assert!(matches!(parser.feed(b"GET k\r\n"), Step::Error(_)));
    }

    #[test]
    fn request_resumes_across_feeds() {
        let input = b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n";
        let mut parser = ReqParser::new();
        for end in 1..input.len() {
            assert_eq!(parser.feed(&input[..end]), Step::Incomplete, "at {end}");
        }
        assert_eq!(parser.feed(input), Step::Complete(input.len()));
    }

    #[test]
    fn binary_safe_key_bytes() {
        let req = parse_req(b"*2\r\n$3\r\nGET\r\n$4\r\na\r\nb\r\n");
        assert_eq!(req.key(0), b"a\r\nb");
    }

    #[test]
    fn response_status_and_error() {
        let rsp = parse_rsp(b"+OK\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisStatus);

        let rsp = parse_rsp(b"-ERR unknown command\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisErrorErr);
        assert!(rsp.is_error());

        let rsp = parse_rsp(b"-WRONGTYPE Operation against a key\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisErrorWrongType);

        let rsp = parse_rsp(b"-LOADING Redis is loading the dataset\r\n");
        assert!(rsp.is_transient_failure());
        let rsp = parse_rsp(b"-BUSY Redis is busy\r\n");
        assert!(rsp.is_transient_failure());
        let rsp = parse_rsp(b"-OOM command not allowed\r\n");
        assert!(rsp.is_transient_failure());
        let rsp = parse_rsp(b"-MASTERDOWN Link with MASTER is down\r\n");
        assert!(!rsp.is_transient_failure());
    }

    #[test]
    fn response_integer() {
        let rsp = parse_rsp(b":1000\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisInteger);
        assert_eq!(rsp.integer, 1000);
        let rsp = parse_rsp(b":-1\r\n");
        assert_eq!(rsp.integer, -1);
    }

    #[test]
    fn response_bulk_and_nulls() {
        let rsp = parse_rsp(b"$5\r\nhello\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisBulk);

        let rsp = parse_rsp(b"$-1\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisBulk);

        let rsp = parse_rsp(b"*-1\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisMultibulk);

        let rsp = parse_rsp(b"$0\r\n\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisBulk);
    }

    #[test]
    fn response_multibulk() {
        let rsp = parse_rsp(b"*2\r\n$1\r\na\r\n$-1\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisMultibulk);
        assert_eq!(rsp.narg, 2);
        assert_eq!(rsp.header_end, 4);
    }

    #[test]
    fn response_nested_multibulk() {
        // SCAN-style reply: cursor plus nested element array.
        let input = b"*2\r\n$1\r\n0\r\n*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n";
        let rsp = parse_rsp(input);
        assert_eq!(rsp.msg_type, MsgType::RspRedisMultibulk);
    }

    #[test]
    fn response_resumes_across_feeds() {
        let input = b"*2\r\n$1\r\na\r\n$1\r\nb\r\n";
        let mut parser = RspParser::new();
        for end in 1..input.len() {
            assert_eq!(parser.feed(&input[..end]), Step::Incomplete, "at {end}");
        }
        assert_eq!(parser.feed(input), Step::Complete(input.len()));
    }

    #[test]
    fn mixed_array_elements() {
        let rsp = parse_rsp(b"*3\r\n:1\r\n+OK\r\n$2\r\nhi\r\n");
        assert_eq!(rsp.msg_type, MsgType::RspRedisMultibulk);
        // The top-level integer slot keeps the message-level value only.
        assert_eq!(rsp.integer, 0);
    }

    #[test]
    fn fragment_mget_groups_keys_by_server() {
        let req = parse_req(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        let frags = crate::fragment(&req, |key| if key == b"b" { 1 } else { 0 }).unwrap();
        assert_eq!(frags.subs.len(), 2);
        assert_eq!(
            &frags.subs[0].frame[..],
            b"*3\r\n$4\r\nmget\r\n$1\r\na\r\n$1\r\nc\r\n"
        );
        assert_eq!(
            &frags.subs[1].frame[..],
            b"*2\r\n$4\r\nmget\r\n$1\r\nb\r\n"
        );
        assert_eq!(frags.frag_seq, vec![0, 1, 0]);
    }

    #[test]
    fn fragment_del_uses_del_verb() {
        let req = parse_req(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        assert_eq!(&frags.subs[0].frame[..], b"*2\r\n$3\r\ndel\r\n$1\r\na\r\n");
        assert_eq!(&frags.subs[1].frame[..], b"*2\r\n$3\r\ndel\r\n$1\r\nb\r\n");
    }

    #[test]
    fn fragment_mset_carries_values() {
        let req =
            parse_req(b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        assert_eq!(
            &frags.subs[0].frame[..],
            b"*3\r\n$4\r\nmset\r\n$1\r\na\r\n$1\r\n1\r\n"
        );
        assert_eq!(
            &frags.subs[1].frame[..],
            b"*3\r\n$4\r\nmset\r\n$1\r\nb\r\n$1\r\n2\r\n"
        );
    }

    #[test]
    fn coalesce_mget_restores_key_order() {
        let req = parse_req(b"*4\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        let frags = crate::fragment(&req, |key| if key == b"b" { 1 } else { 0 }).unwrap();
        // Server 0 answers for a and c, server 1 for b.
        let r0 = parse_rsp(b"*2\r\n$2\r\nva\r\n$2\r\nvc\r\n");
        let r1 = parse_rsp(b"*1\r\n$2\r\nvb\r\n");
        let out = crate::coalesce(&req, &frags, &[r0, r1]).unwrap();
        assert_eq!(
            &out[..],
            b"*3\r\n$2\r\nva\r\n$2\r\nvb\r\n$2\r\nvc\r\n"
        );
    }

    #[test]
    fn coalesce_mget_with_missing_values() {
        let req = parse_req(b"*3\r\n$4\r\nMGET\r\n$1\r\na\r\n$1\r\nb\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        let r0 = parse_rsp(b"*1\r\n$-1\r\n");
        let r1 = parse_rsp(b"*1\r\n$2\r\nvb\r\n");
        let out = crate::coalesce(&req, &frags, &[r0, r1]).unwrap();
        assert_eq!(&out[..], b"*2\r\n$-1\r\n$2\r\nvb\r\n");
    }

    #[test]
    fn coalesce_del_sums_integers() {
        let req = parse_req(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        let r0 = parse_rsp(b":1\r\n");
        let r1 = parse_rsp(b":0\r\n");
        let out = crate::coalesce(&req, &frags, &[r0, r1]).unwrap();
        assert_eq!(&out[..], b":1\r\n");
    }

    #[test]
    fn coalesce_mset_is_single_ok() {
        let req =
            parse_req(b"*5\r\n$4\r\nMSET\r\n$1\r\na\r\n$1\r\n1\r\n$1\r\nb\r\n$1\r\n2\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        let r0 = parse_rsp(b"+OK\r\n");
        let r1 = parse_rsp(b"+OK\r\n");
        let out = crate::coalesce(&req, &frags, &[r0, r1]).unwrap();
        assert_eq!(&out[..], b"+OK\r\n");
    }

    #[test]
    fn coalesce_rejects_unexpected_fragment_reply() {
        let req = parse_req(b"*3\r\n$3\r\nDEL\r\n$1\r\na\r\n$1\r\nb\r\n");
        let frags = crate::fragment(&req, |key| usize::from(key == b"b")).unwrap();
        let r0 = parse_rsp(b":1\r\n");
        let r1 = parse_rsp(b"+OK\r\n");
        assert!(crate::coalesce(&req, &frags, &[r0, r1]).is_err());
    }
}
