//! Memcached ASCII protocol: request and response state machines, multi-key
//! `get`/`gets` fragmentation and reply coalescing.
//!
//! The request grammar is line-oriented:
//!
//! ```text
//! <verb> <key> [<key>...] [<flags> <expiry> <bytes> [noreply]]\r\n[<data>\r\n]
//! ```
//!
//! Parsing is byte-at-a-time and resumable: `feed` scans from the saved
//! cursor over the caller's growing buffer and never consumes bytes itself.

use crate::{Fragments, MsgType, ParseError, Request, Response, Step, SubRequest};
use bytes::{BufMut, Bytes, BytesMut};

pub const MAX_KEY_LENGTH: usize = 250;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Start,
    Verb,
    SpacesBeforeKey,
    Key,
    SpacesBeforeKeys,
    SpacesBeforeFlags,
    Flags,
    SpacesBeforeExpiry,
    Expiry,
    SpacesBeforeVlen,
    Vlen,
    SpacesBeforeCas,
    Cas,
    SpacesBeforeNum,
    Num,
    RunToCrlf,
    Noreply,
    AfterNoreply,
    RunToVal,
    Val,
    AlmostDone,
}

#[derive(Debug)]
pub struct ReqParser {
    state: ReqState,
    pos: usize,
    token: usize,
    msg_type: MsgType,
    keys: Vec<std::ops::Range<usize>>,
    vlen: u64,
    val_end: usize,
    noreply: bool,
    quit: bool,
}

impl ReqParser {
    pub fn new() -> ReqParser {
        ReqParser {
            state: ReqState::Start,
            pos: 0,
            token: 0,
            msg_type: MsgType::Unknown,
            keys: Vec::new(),
            vlen: 0,
            val_end: 0,
            noreply: false,
            quit: false,
        }
    }

    pub fn take(&mut self, frame: Bytes) -> Request {
        let req = Request {
            msg_type: self.msg_type,
            keys: std::mem::take(&mut self.keys),
            vals: Vec::new(),
            narg: 0,
            noreply: self.noreply,
            quit: self.quit,
            noforward: false,
            frame,
        };
        *self = ReqParser::new();
        req
    }

    pub fn feed(&mut self, buf: &[u8]) -> Step {
        use ReqState::*;

        while self.pos < buf.len() {
            let p = self.pos;
            let ch = buf[p];

            match self.state {
                Start => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_lowercase() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.token = p;
                    self.state = Verb;
                    self.pos += 1;
                }

                Verb => {
                    if ch != b' ' && ch != CR {
                        self.pos += 1;
                        continue;
                    }
                    self.msg_type = match &buf[self.token..p] {
                        b"get" => MsgType::ReqMcGet,
                        b"gets" => MsgType::ReqMcGets,
                        b"set" => MsgType::ReqMcSet,
                        b"add" => MsgType::ReqMcAdd,
                        b"cas" => MsgType::ReqMcCas,
                        b"incr" => MsgType::ReqMcIncr,
                        b"decr" => MsgType::ReqMcDecr,
                        b"quit" => MsgType::ReqMcQuit,
                        b"touch" => MsgType::ReqMcTouch,
                        b"append" => MsgType::ReqMcAppend,
                        b"delete" => MsgType::ReqMcDelete,
                        b"prepend" => MsgType::ReqMcPrepend,
                        b"replace" => MsgType::ReqMcReplace,
                        _ => return Step::Error(ParseError::UnknownCommand),
                    };
                    if self.msg_type == MsgType::ReqMcQuit {
                        if ch != CR {
                            return Step::Error(ParseError::BadRequest);
                        }
                        self.quit = true;
                        self.state = AlmostDone;
                        self.pos += 1;
                        continue;
                    }
                    if ch != b' ' {
                        // Every other verb takes at least a key.
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.state = SpacesBeforeKey;
                    self.pos += 1;
                }

                SpacesBeforeKey => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if ch == CR || ch == LF || ch < 0x21 || ch == 0x7f {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.token = p;
                    self.state = Key;
                    self.pos += 1;
                }

                Key => {
                    if ch == b' ' || ch == CR {
                        if p - self.token > MAX_KEY_LENGTH {
                            return Step::Error(ParseError::KeyTooLong);
                        }
                        self.keys.push(self.token..p);
                        let t = self.msg_type;
                        self.state = if t.mc_storage() {
                            SpacesBeforeFlags
                        } else if t.mc_arithmetic() || t == MsgType::ReqMcTouch {
                            SpacesBeforeNum
                        } else if t.mc_retrieval() {
                            SpacesBeforeKeys
                        } else {
                            // delete
                            RunToCrlf
                        };
                        if ch == CR {
                            if t.mc_storage() || t.mc_arithmetic() || t == MsgType::ReqMcTouch {
                                return Step::Error(ParseError::BadRequest);
                            }
                            // Let the next state see the CR.
                            continue;
                        }
                        self.pos += 1;
                        continue;
                    }
                    if ch < 0x21 || ch == 0x7f {
                        return Step::Error(ParseError::BadRequest);
                    }
                    if p - self.token >= MAX_KEY_LENGTH {
                        return Step::Error(ParseError::KeyTooLong);
                    }
                    self.pos += 1;
                }

                SpacesBeforeKeys => {
                    match ch {
                        b' ' => {
                            self.pos += 1;
                        }
                        CR => {
                            self.state = AlmostDone;
                            self.pos += 1;
                        }
                        _ if ch >= 0x21 && ch != 0x7f => {
                            self.token = p;
                            self.state = Key;
                            self.pos += 1;
                        }
                        _ => return Step::Error(ParseError::BadRequest),
                    }
                }

                SpacesBeforeFlags => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.state = Flags;
                    self.pos += 1;
                }

                Flags => {
                    if ch.is_ascii_digit() {
                        self.pos += 1;
                    } else if ch == b' ' {
                        self.state = SpacesBeforeExpiry;
                        self.pos += 1;
                    } else {
                        return Step::Error(ParseError::BadRequest);
                    }
                }

                SpacesBeforeExpiry => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.state = Expiry;
                    self.pos += 1;
                }

                Expiry => {
                    if ch.is_ascii_digit() {
                        self.pos += 1;
                    } else if ch == b' ' {
                        self.state = SpacesBeforeVlen;
                        self.pos += 1;
                    } else {
                        return Step::Error(ParseError::BadRequest);
                    }
                }

                SpacesBeforeVlen => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.vlen = 0;
                    self.state = Vlen;
                }

                Vlen => {
                    if ch.is_ascii_digit() {
                        self.vlen = self.vlen * 10 + (ch - b'0') as u64;
                        if self.vlen > u32::MAX as u64 {
                            return Step::Error(ParseError::BadRequest);
                        }
                        self.pos += 1;
                    } else if self.msg_type == MsgType::ReqMcCas {
                        if ch != b' ' {
                            return Step::Error(ParseError::BadRequest);
                        }
                        self.state = SpacesBeforeCas;
                        self.pos += 1;
                    } else if ch == b' ' || ch == CR {
                        self.state = RunToCrlf;
                    } else {
                        return Step::Error(ParseError::BadRequest);
                    }
                }

                SpacesBeforeCas => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.state = Cas;
                }

                Cas => {
                    if ch.is_ascii_digit() {
                        self.pos += 1;
                    } else if ch == b' ' || ch == CR {
                        self.state = RunToCrlf;
                    } else {
                        return Step::Error(ParseError::BadRequest);
                    }
                }

                SpacesBeforeNum => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.state = Num;
                }

                Num => {
                    if ch.is_ascii_digit() {
                        self.pos += 1;
                    } else if ch == b' ' || ch == CR {
                        self.state = RunToCrlf;
                    } else {
                        return Step::Error(ParseError::BadRequest);
                    }
                }

                RunToCrlf => match ch {
                    b' ' => {
                        self.pos += 1;
                    }
                    b'n' => {
                        self.token = p;
                        self.state = Noreply;
                    }
                    CR => {
                        self.state = if self.msg_type.mc_storage() {
                            RunToVal
                        } else {
                            AlmostDone
                        };
                        self.pos += 1;
                    }
                    _ => return Step::Error(ParseError::BadRequest),
                },

                Noreply => {
                    if ch != b' ' && ch != CR {
                        self.pos += 1;
                        continue;
                    }
                    if &buf[self.token..p] != b"noreply" {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.noreply = true;
                    self.state = AfterNoreply;
                }

                AfterNoreply => match ch {
                    b' ' => {
                        self.pos += 1;
                    }
                    CR => {
                        self.state = if self.msg_type.mc_storage() {
                            RunToVal
                        } else {
                            AlmostDone
                        };
                        self.pos += 1;
                    }
                    _ => return Step::Error(ParseError::BadRequest),
                },

                RunToVal => {
                    if ch != LF {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.val_end = p + 1 + self.vlen as usize;
                    self.state = Val;
                    self.pos += 1;
                }

                Val => {
                    // Jump over the data block; the byte after it must be CR.
                    if buf.len() <= self.val_end {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    if buf[self.val_end] != CR {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.pos = self.val_end + 1;
                    self.state = AlmostDone;
                }

                AlmostDone => {
                    if ch != LF {
                        return Step::Error(ParseError::BadRequest);
                    }
                    self.pos += 1;
                    return Step::Complete(self.pos);
                }
            }
        }

        Step::Incomplete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RspState {
    Start,
    Num,
    Str,
    SpacesBeforeKey,
    Key,
    SpacesBeforeFlags,
    Flags,
    SpacesBeforeVlen,
    Vlen,
    CasOrCrlf,
    RunToVal,
    Val,
    ValLf,
    ErrorLine,
    AlmostDone,
}

#[derive(Debug)]
pub struct RspParser {
    state: RspState,
    pos: usize,
    token: usize,
    msg_type: MsgType,
    vlen: u64,
    val_end: usize,
    integer: i64,
}

impl RspParser {
    pub fn new() -> RspParser {
        RspParser {
            state: RspState::Start,
            pos: 0,
            token: 0,
            msg_type: MsgType::Unknown,
            vlen: 0,
            val_end: 0,
            integer: 0,
        }
    }

    pub fn take(&mut self, frame: Bytes) -> Response {
        let rsp = Response {
            msg_type: self.msg_type,
            integer: self.integer,
            narg: 0,
            header_end: 0,
            frame,
        };
        *self = RspParser::new();
        rsp
    }

    pub fn feed(&mut self, buf: &[u8]) -> Step {
        use RspState::*;

        while self.pos < buf.len() {
            let p = self.pos;
            let ch = buf[p];

            match self.state {
                Start => {
                    if ch.is_ascii_digit() {
                        self.token = p;
                        self.msg_type = MsgType::RspMcNum;
                        self.state = Num;
                        continue;
                    }
                    if !ch.is_ascii_uppercase() {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.token = p;
                    self.state = Str;
                    self.pos += 1;
                }

                Num => {
                    if ch.is_ascii_digit() {
                        self.integer = self.integer.wrapping_mul(10) + (ch - b'0') as i64;
                        self.pos += 1;
                    } else if ch == CR {
                        self.state = AlmostDone;
                        self.pos += 1;
                    } else {
                        return Step::Error(ParseError::BadResponse);
                    }
                }

                Str => {
                    if ch != b' ' && ch != CR {
                        self.pos += 1;
                        continue;
                    }
                    let token = &buf[self.token..p];
                    match token {
                        b"VALUE" => {
                            self.msg_type = MsgType::RspMcValue;
                            if ch != b' ' {
                                return Step::Error(ParseError::BadResponse);
                            }
                            self.state = SpacesBeforeKey;
                            self.pos += 1;
                        }
                        b"END" => {
                            // Either a bare miss or the tail of a VALUE run.
                            if self.msg_type == MsgType::Unknown {
                                self.msg_type = MsgType::RspMcEnd;
                            }
                            if ch != CR {
                                return Step::Error(ParseError::BadResponse);
                            }
                            self.state = AlmostDone;
                            self.pos += 1;
                        }
                        b"STORED" | b"NOT_STORED" | b"EXISTS" | b"NOT_FOUND" | b"DELETED"
                        | b"TOUCHED" => {
                            self.msg_type = match token {
                                b"STORED" => MsgType::RspMcStored,
                                b"NOT_STORED" => MsgType::RspMcNotStored,
                                b"EXISTS" => MsgType::RspMcExists,
                                b"NOT_FOUND" => MsgType::RspMcNotFound,
                                b"DELETED" => MsgType::RspMcDeleted,
                                _ => MsgType::RspMcTouched,
                            };
                            if ch != CR {
                                return Step::Error(ParseError::BadResponse);
                            }
                            self.state = AlmostDone;
                            self.pos += 1;
                        }
                        b"ERROR" => {
                            self.msg_type = MsgType::RspMcError;
                            if ch != CR {
                                return Step::Error(ParseError::BadResponse);
                            }
                            self.state = AlmostDone;
                            self.pos += 1;
                        }
                        b"CLIENT_ERROR" => {
                            self.msg_type = MsgType::RspMcClientError;
                            self.state = ErrorLine;
                        }
                        b"SERVER_ERROR" => {
                            self.msg_type = MsgType::RspMcServerError;
                            self.state = ErrorLine;
                        }
                        _ => return Step::Error(ParseError::BadResponse),
                    }
                }

                ErrorLine => {
                    if ch == CR {
                        self.state = AlmostDone;
                    }
                    self.pos += 1;
                }

                SpacesBeforeKey => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    self.state = Key;
                }

                Key => {
                    if ch == b' ' {
                        self.state = SpacesBeforeFlags;
                    }
                    self.pos += 1;
                }

                SpacesBeforeFlags => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.state = Flags;
                }

                Flags => {
                    if ch.is_ascii_digit() {
                        self.pos += 1;
                    } else if ch == b' ' {
                        self.state = SpacesBeforeVlen;
                        self.pos += 1;
                    } else {
                        return Step::Error(ParseError::BadResponse);
                    }
                }

                SpacesBeforeVlen => {
                    if ch == b' ' {
                        self.pos += 1;
                        continue;
                    }
                    if !ch.is_ascii_digit() {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.vlen = 0;
                    self.state = Vlen;
                }

                Vlen => {
                    if ch.is_ascii_digit() {
                        self.vlen = self.vlen * 10 + (ch - b'0') as u64;
                        if self.vlen > u32::MAX as u64 {
                            return Step::Error(ParseError::BadResponse);
                        }
                        self.pos += 1;
                    } else if ch == b' ' || ch == CR {
                        self.state = CasOrCrlf;
                    } else {
                        return Step::Error(ParseError::BadResponse);
                    }
                }

                CasOrCrlf => match ch {
                    b' ' => {
                        self.pos += 1;
                    }
                    CR => {
                        self.state = RunToVal;
                        self.pos += 1;
                    }
                    _ if ch.is_ascii_digit() => {
                        self.pos += 1;
                    }
                    _ => return Step::Error(ParseError::BadResponse),
                },

                RunToVal => {
                    if ch != LF {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.val_end = p + 1 + self.vlen as usize;
                    self.state = Val;
                    self.pos += 1;
                }

                Val => {
                    if buf.len() <= self.val_end {
                        self.pos = buf.len();
                        return Step::Incomplete;
                    }
                    if buf[self.val_end] != CR {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.pos = self.val_end + 1;
                    self.state = ValLf;
                }

                ValLf => {
                    if ch != LF {
                        return Step::Error(ParseError::BadResponse);
                    }
                    // Next token: another VALUE, or the final END.
                    self.state = Str;
                    self.pos += 1;
                    self.token = self.pos;
                }

                AlmostDone => {
                    if ch != LF {
                        return Step::Error(ParseError::BadResponse);
                    }
                    self.pos += 1;
                    return Step::Complete(self.pos);
                }
            }
        }

        Step::Incomplete
    }
}

/// Split a multi-key `get`/`gets` into one retrieval per destination server,
/// keys grouped in first-seen order.
pub(crate) fn fragment(req: &Request, mut route: impl FnMut(&[u8]) -> usize) -> Fragments {
    let verb: &[u8] = if req.msg_type == MsgType::ReqMcGets {
        b"gets"
    } else {
        b"get"
    };

    let mut subs: Vec<(usize, BytesMut)> = Vec::new();
    let mut frag_seq = Vec::with_capacity(req.keys.len());

    for range in &req.keys {
        let key = &req.frame[range.clone()];
        let server = route(key);
        let ordinal = match subs.iter().position(|(s, _)| *s == server) {
            Some(i) => i,
            None => {
                let mut frame = BytesMut::with_capacity(verb.len() + key.len() + 3);
                frame.put_slice(verb);
                subs.push((server, frame));
                subs.len() - 1
            }
        };
        let frame = &mut subs[ordinal].1;
        frame.put_u8(b' ');
        frame.put_slice(key);
        frag_seq.push(ordinal);
    }

    let subs = subs
        .into_iter()
        .map(|(server, mut frame)| {
            frame.put_slice(b"\r\n");
            SubRequest {
                server,
                frame: frame.freeze(),
            }
        })
        .collect();

    Fragments { subs, frag_seq }
}

/// Merge fragment replies into one retrieval response: VALUE blocks
/// concatenated in fragment order, one trailing `END`.
pub(crate) fn coalesce(responses: &[Response]) -> Result<Bytes, ParseError> {
    const END: &[u8] = b"END\r\n";

    let mut out = BytesMut::new();
    for rsp in responses {
        match rsp.msg_type {
            MsgType::RspMcEnd => {}
            MsgType::RspMcValue => {
                let frame = &rsp.frame;
                if frame.len() < END.len() || !frame.ends_with(END) {
                    return Err(ParseError::BadResponse);
                }
                out.put_slice(&frame[..frame.len() - END.len()]);
            }
            _ => return Err(ParseError::BadResponse),
        }
    }
    out.put_slice(END);
    Ok(out.freeze())
}
