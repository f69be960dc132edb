//! Incremental HTTP/1.x stream decoder.
//!
//! `Htrd::feed` consumes an arbitrary slice of the byte stream and
//! suspends wherever the data runs out: mid header block, mid chunk
//! length, mid trailer. Feeding the same message whole or one byte at
//! a time produces the same `peek`/`poke` sequence.
//!
//! A response carrying neither a content length nor chunked framing is
//! read to connection close when the connection is closing; with
//! keep-alive there is no way to frame the body, so any bytes trailing
//! the header block are discarded for the feed at hand and later body
//! bytes fail as a bad message.

use crate::err::{Errnum, Error, Result};
use crate::htre::{HttpMethod, HttpVersion, Htre, HtreType};

/// Decoder options.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HtrdOption(u32);

impl HtrdOption {
    /// Accept request messages.
    pub const REQUEST: HtrdOption = HtrdOption(1 << 0);
    /// Accept response messages.
    pub const RESPONSE: HtrdOption = HtrdOption(1 << 1);
    /// Collect chunk trailers into the separate trailer table.
    pub const TRAILERS: HtrdOption = HtrdOption(1 << 2);
    /// Reject header lines without a colon instead of skipping them.
    pub const STRICT: HtrdOption = HtrdOption(1 << 3);
    /// Canonicalize the request path (`.` and `..` segments).
    pub const CANONQPATH: HtrdOption = HtrdOption(1 << 4);
    /// Do not expect a request/status line.
    pub const SKIP_INITIAL_LINE: HtrdOption = HtrdOption(1 << 5);
    /// Tolerate blank lines before the initial line.
    pub const SKIP_EMPTY_LINES: HtrdOption = HtrdOption(1 << 6);

    pub const fn contains(self, other: HtrdOption) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for HtrdOption {
    type Output = HtrdOption;
    fn bitor(self, rhs: HtrdOption) -> HtrdOption {
        HtrdOption(self.0 | rhs.0)
    }
}

impl Default for HtrdOption {
    fn default() -> HtrdOption {
        HtrdOption::REQUEST | HtrdOption::RESPONSE
    }
}

/// Handed to `peek`/`poke` so a callback can change how the rest of
/// the stream is treated.
#[derive(Default)]
pub struct FeedCtl {
    suspend: bool,
    dummify: bool,
}

impl FeedCtl {
    /// Pause the decoder at the next message boundary; feeding while
    /// suspended is an error until `Htrd::resume` is called.
    pub fn suspend(&mut self) {
        self.suspend = true;
    }

    /// Switch to raw pass-through: everything after the current
    /// message is delivered as content with no framing applied.
    pub fn dummify(&mut self) {
        self.dummify = true;
    }
}

/// Receives decoded message events.
pub trait HtrdHandler {
    /// The header block is complete; the body has not been read yet.
    fn peek(&mut self, re: &mut Htre, ctl: &mut FeedCtl) -> Result<()>;

    /// The body is complete (including trailers for chunked bodies).
    fn poke(&mut self, re: &mut Htre, ctl: &mut FeedCtl) -> Result<()>;

    /// Body bytes as they arrive. Return `true` to consume them;
    /// `false` lets the decoder append to the record's content buffer.
    fn push_content(&mut self, re: &mut Htre, data: &[u8]) -> Result<bool> {
        let _ = (re, data);
        Ok(false)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Phase {
    Header,
    Content,
    ChunkLen,
    ChunkCrlf,
    ChunkTrailers,
}

/// The incremental decoder.
pub struct Htrd {
    option: HtrdOption,
    re: Htre,

    phase: Phase,
    /// Raw header block accumulated across feeds.
    raw: Vec<u8>,
    /// Trailer block accumulated across feeds.
    tra: Vec<u8>,
    /// Line-ending tracker: 1 = CR seen, 2 = first LF seen, 3 = CR
    /// after the first LF. A LF at state >= 2 ends the block.
    crlf: u8,

    need: u64,
    consume_until_close: bool,
    chunked: bool,
    chunk_len: u64,
    chunk_count: usize,

    clean: bool,
    suspended: bool,
    dummified: bool,
}

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\r'
}

fn is_whspace(b: u8) -> bool {
    is_space(b) || b == b'\n'
}

fn is_pure_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn badre(msg: &str) -> Error {
    Error::with_msg(Errnum::Badre, msg)
}

impl Htrd {
    pub fn new(option: HtrdOption) -> Htrd {
        Htrd {
            option,
            re: Htre::new(),
            phase: Phase::Header,
            raw: Vec::new(),
            tra: Vec::new(),
            crlf: 0,
            need: 0,
            consume_until_close: false,
            chunked: false,
            chunk_len: 0,
            chunk_count: 0,
            clean: true,
            suspended: false,
            dummified: false,
        }
    }

    pub fn option(&self) -> HtrdOption {
        self.option
    }

    pub fn set_option(&mut self, option: HtrdOption) {
        self.option = option;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn resume(&mut self) {
        self.suspended = false;
    }

    pub fn is_dummified(&self) -> bool {
        self.dummified
    }

    pub fn undummify(&mut self) {
        self.dummified = false;
    }

    /// Drops all partial state and starts clean at a message boundary.
    pub fn reset(&mut self) {
        self.clear_feed();
        self.suspended = false;
        self.dummified = false;
    }

    fn clear_feed(&mut self) {
        self.re.clear();
        self.raw.clear();
        self.tra.clear();
        self.crlf = 0;
        self.need = 0;
        self.consume_until_close = false;
        self.chunked = false;
        self.chunk_len = 0;
        self.chunk_count = 0;
        self.phase = Phase::Header;
        self.clean = true;
    }

    fn push_content_out(&mut self, h: &mut dyn HtrdHandler, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if !h.push_content(&mut self.re, data)? {
            self.re.content.extend_from_slice(data);
        }
        Ok(())
    }

    fn finish_message(&mut self, h: &mut dyn HtrdHandler) -> Result<()> {
        self.re.complete_content();
        let mut ctl = FeedCtl::default();
        h.poke(&mut self.re, &mut ctl)?;
        self.suspended |= ctl.suspend;
        self.dummified |= ctl.dummify;
        self.clear_feed();
        Ok(())
    }

    /// Feeds a slice of the stream. Returns the number of consumed
    /// bytes: all of `data`, unless `stop_at_boundary` is set and a
    /// message completed first.
    pub fn feed(
        &mut self,
        data: &[u8],
        h: &mut dyn HtrdHandler,
        stop_at_boundary: bool,
    ) -> Result<usize> {
        if self.suspended {
            return Err(Error::with_msg(Errnum::Busy, "feeding while suspended"));
        }
        if self.dummified {
            // raw pass-through: no framing at all
            self.push_content_out(h, data)?;
            return Ok(data.len());
        }

        let mut pos = 0;
        while pos < data.len() {
            match self.phase {
                Phase::Header => {
                    let start = pos;
                    let mut completed = false;
                    while pos < data.len() {
                        let b = data[pos];
                        pos += 1;
                        match b {
                            0 => return Err(badre("NUL in header block")),
                            b'\n' => {
                                if self.crlf <= 1 {
                                    self.crlf = 2;
                                } else {
                                    completed = true;
                                    break;
                                }
                            }
                            b'\r' => {
                                self.crlf = if self.crlf == 0 || self.crlf == 2 {
                                    self.crlf + 1
                                } else {
                                    1
                                };
                            }
                            _ => self.crlf = 0,
                        }
                    }
                    self.raw.extend_from_slice(&data[start..pos]);
                    self.clean = false;
                    if !completed {
                        return Ok(pos); // header still incomplete
                    }
                    self.crlf = 0;

                    if !self.parse_initial_line_and_headers()? {
                        // a block of blank lines only; wait for a real
                        // message
                        self.clean = true;
                        continue;
                    }

                    let mut ctl = FeedCtl::default();
                    h.peek(&mut self.re, &mut ctl)?;
                    self.suspended |= ctl.suspend;
                    self.dummified |= ctl.dummify;

                    if self.re.flags.chunked {
                        self.chunked = true;
                        self.chunk_len = 0;
                        self.chunk_count = 0;
                        self.phase = Phase::ChunkLen;
                        continue;
                    }

                    let is_response = self.re.typ == HtreType::S;
                    if is_response && !self.re.flags.length && !self.re.flags.keepalive {
                        // no framing and the connection is closing:
                        // read until close, flushed by halt()
                        self.need = u64::MAX;
                        self.consume_until_close = true;
                        self.phase = Phase::Content;
                        continue;
                    }
                    if is_response && !self.re.flags.length && self.re.flags.keepalive {
                        // unframed body on a keep-alive connection:
                        // nothing tells us its size, so drop whatever
                        // trails the header in this feed
                        pos = data.len();
                        self.finish_message(h)?;
                        return Ok(pos);
                    }

                    self.need = self.re.content_length as u64;
                    if self.need > 0 {
                        self.phase = Phase::Content;
                        continue;
                    }

                    // no content at all
                    self.finish_message(h)?;
                    if stop_at_boundary {
                        return Ok(pos);
                    }
                    if pos < data.len() && self.suspended {
                        return Err(Error::with_msg(Errnum::Busy, "feeding while suspended"));
                    }
                    if self.dummified {
                        self.push_content_out(h, &data[pos..])?;
                        return Ok(data.len());
                    }
                }

                Phase::Content => {
                    let avail = data.len() - pos;
                    let take = (avail as u64).min(self.need) as usize;
                    self.push_content_out(h, &data[pos..pos + take])?;
                    pos += take;
                    if self.consume_until_close {
                        // never completes through a byte count
                        continue;
                    }
                    self.need -= take as u64;
                    if self.need > 0 {
                        return Ok(pos); // more content expected
                    }

                    if self.chunked {
                        self.phase = Phase::ChunkCrlf;
                        continue;
                    }

                    self.finish_message(h)?;
                    if stop_at_boundary {
                        return Ok(pos);
                    }
                    if pos < data.len() && self.suspended {
                        return Err(Error::with_msg(Errnum::Busy, "feeding while suspended"));
                    }
                    if self.dummified {
                        self.push_content_out(h, &data[pos..])?;
                        return Ok(data.len());
                    }
                }

                Phase::ChunkLen => {
                    if self.chunk_count == 0 {
                        // leading spaces before the first digit
                        while pos < data.len() && is_space(data[pos]) {
                            pos += 1;
                        }
                    }
                    while pos < data.len() {
                        let Some(v) = (data[pos] as char).to_digit(16) else {
                            break;
                        };
                        self.chunk_len = self
                            .chunk_len
                            .checked_mul(16)
                            .and_then(|l| l.checked_add(u64::from(v)))
                            .ok_or_else(|| badre("chunk length overflow"))?;
                        self.chunk_count += 1;
                        pos += 1;
                    }
                    while pos < data.len() && is_space(data[pos]) {
                        pos += 1;
                    }
                    if pos >= data.len() {
                        return Ok(pos); // length line cut short
                    }
                    if data[pos] != b'\n' {
                        return Err(badre("malformed chunk length line"));
                    }
                    pos += 1;

                    if self.chunk_count == 0 {
                        // a bare empty line: no more chunks
                        self.finish_message(h)?;
                        if stop_at_boundary {
                            return Ok(pos);
                        }
                        if pos < data.len() && self.suspended {
                            return Err(Error::with_msg(Errnum::Busy, "feeding while suspended"));
                        }
                        if self.dummified {
                            self.push_content_out(h, &data[pos..])?;
                            return Ok(data.len());
                        }
                    } else if self.chunk_len == 0 {
                        // last chunk; trailing headers follow. The next
                        // empty line alone completes the body, so seed
                        // the line tracker as if one line was read.
                        self.crlf = 2;
                        self.phase = Phase::ChunkTrailers;
                    } else {
                        self.need = self.chunk_len;
                        self.phase = Phase::Content;
                    }
                }

                Phase::ChunkCrlf => {
                    while pos < data.len() && is_space(data[pos]) {
                        pos += 1;
                    }
                    if pos >= data.len() {
                        return Ok(pos);
                    }
                    if data[pos] != b'\n' {
                        return Err(badre("redundant data after chunk"));
                    }
                    pos += 1;
                    self.chunk_len = 0;
                    self.chunk_count = 0;
                    self.phase = Phase::ChunkLen;
                }

                Phase::ChunkTrailers => {
                    let start = pos;
                    let mut completed = false;
                    while pos < data.len() {
                        let b = data[pos];
                        pos += 1;
                        match b {
                            0 => return Err(badre("NUL in trailers")),
                            b'\n' => {
                                if self.crlf <= 1 {
                                    self.crlf = 2;
                                } else {
                                    completed = true;
                                    break;
                                }
                            }
                            b'\r' => {
                                self.crlf = if self.crlf == 0 || self.crlf == 2 {
                                    self.crlf + 1
                                } else {
                                    1
                                };
                            }
                            _ => self.crlf = 0,
                        }
                    }
                    self.tra.extend_from_slice(&data[start..pos]);
                    if !completed {
                        return Ok(pos);
                    }
                    self.crlf = 0;

                    self.parse_trailers()?;
                    self.finish_message(h)?;
                    if stop_at_boundary {
                        return Ok(pos);
                    }
                    if pos < data.len() && self.suspended {
                        return Err(Error::with_msg(Errnum::Busy, "feeding while suspended"));
                    }
                    if self.dummified {
                        self.push_content_out(h, &data[pos..])?;
                        return Ok(data.len());
                    }
                }
            }
        }
        Ok(pos)
    }

    /// Completes a read-until-close body when the connection closed.
    /// Also flushes a message whose header block arrived but whose
    /// body was implicitly empty.
    pub fn halt(&mut self, h: &mut dyn HtrdHandler) -> Result<()> {
        if self.consume_until_close || !self.clean {
            self.re.complete_content();
            let mut ctl = FeedCtl::default();
            h.poke(&mut self.re, &mut ctl)?;
            self.suspended |= ctl.suspend;
            self.dummified |= ctl.dummify;
            self.clear_feed();
        }
        Ok(())
    }

    /*
     * ===== header block parsing =====
     */

    /// Returns false when the block held nothing but blank lines and
    /// the `SKIP_EMPTY_LINES` option tolerates that.
    fn parse_initial_line_and_headers(&mut self) -> Result<bool> {
        let raw = std::mem::take(&mut self.raw);
        let mut p = 0;

        if self.option.contains(HtrdOption::SKIP_EMPTY_LINES) {
            while p < raw.len() && is_whspace(raw[p]) {
                p += 1;
            }
            if p >= raw.len() {
                self.raw = raw;
                self.raw.clear();
                return Ok(false);
            }
        } else {
            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }
        }

        if !self.option.contains(HtrdOption::SKIP_INITIAL_LINE) {
            p = self.parse_initial_line(&raw, p)?;
        }

        loop {
            while p < raw.len() && is_whspace(raw[p]) {
                p += 1;
            }
            if p >= raw.len() {
                break;
            }
            p = self.parse_header_field(&raw, p, false)?;
        }
        self.raw = raw;
        self.raw.clear();
        Ok(true)
    }

    fn parse_trailers(&mut self) -> Result<()> {
        let tra = std::mem::take(&mut self.tra);
        let mut p = 0;
        let into_trailers = self.option.contains(HtrdOption::TRAILERS);
        loop {
            while p < tra.len() && is_whspace(tra[p]) {
                p += 1;
            }
            if p >= tra.len() {
                break;
            }
            p = self.parse_header_field_into(&tra, p, into_trailers)?;
        }
        self.tra = tra;
        self.tra.clear();
        Ok(())
    }

    fn parse_initial_line(&mut self, raw: &[u8], mut p: usize) -> Result<usize> {
        // the first token must be alphabetic: a method name, or HTTP/
        // for a status line
        let tok_start = p;
        while p < raw.len() && raw[p].is_ascii_alphabetic() {
            p += 1;
        }
        if p == tok_start {
            return Err(badre("malformed initial line"));
        }
        let token = std::str::from_utf8(&raw[tok_start..p])
            .map_err(|_| badre("non-ASCII initial line"))?;

        // a status line starts with HTTP/ where a request would have a
        // method name followed by a space
        let is_response = self.option.contains(HtrdOption::RESPONSE)
            && token.eq_ignore_ascii_case("HTTP")
            && raw.get(p) == Some(&b'/');

        if is_response {
            self.re.typ = HtreType::S;

            // HTTP/x.y
            if p + 3 >= raw.len() || raw[p] != b'/' || raw[p + 2] != b'.' {
                return Err(badre("malformed status line version"));
            }
            let major = (raw[p + 1] as char).to_digit(10);
            let minor = (raw[p + 3] as char).to_digit(10);
            let (Some(major), Some(minor)) = (major, minor) else {
                return Err(badre("malformed status line version"));
            };
            self.re.version = HttpVersion {
                major: major as u8,
                minor: minor as u8,
            };
            self.re.verstr = format!("HTTP/{}.{}", major, minor);
            p += 4;

            if p >= raw.len() || !is_space(raw[p]) {
                return Err(badre("malformed status line"));
            }
            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }

            let code_start = p;
            let mut code: u32 = 0;
            while p < raw.len() {
                let Some(d) = (raw[p] as char).to_digit(10) else {
                    break;
                };
                code = code * 10 + d;
                if code > 999 {
                    return Err(badre("status code out of range"));
                }
                p += 1;
            }
            if p == code_start || p >= raw.len() || !is_space(raw[p]) {
                return Err(badre("malformed status code"));
            }
            self.re.code = code as u16;

            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }
            let mesg_start = p;
            let mut mesg_end = p;
            while p < raw.len() && raw[p] != b'\n' {
                if !is_space(raw[p]) {
                    mesg_end = p + 1;
                }
                p += 1;
            }
            if p >= raw.len() {
                return Err(badre("status line not terminated"));
            }
            self.re.mesg = String::from_utf8_lossy(&raw[mesg_start..mesg_end]).into_owned();
            p += 1; // past the LF
        } else {
            if !self.option.contains(HtrdOption::REQUEST) {
                return Err(badre("unexpected request"));
            }
            self.re.typ = HtreType::Q;

            if p >= raw.len() || !is_space(raw[p]) {
                return Err(badre("method not followed by space"));
            }
            self.re.method = HttpMethod::from_name(token);
            self.re.method_name = token.to_string();

            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }

            // url: path[?param][#anchor]
            let path_start = p;
            while p < raw.len() && !is_whspace(raw[p]) && raw[p] != b'?' && raw[p] != b'#' {
                p += 1;
            }
            if p == path_start || p >= raw.len() {
                return Err(badre("malformed request target"));
            }
            let mut path = String::from_utf8_lossy(&raw[path_start..p]).into_owned();

            if p < raw.len() && raw[p] == b'?' {
                p += 1;
                let start = p;
                while p < raw.len() && !is_whspace(raw[p]) && raw[p] != b'#' {
                    p += 1;
                }
                self.re.param = String::from_utf8_lossy(&raw[start..p]).into_owned();
            }
            if p < raw.len() && raw[p] == b'#' {
                p += 1;
                let start = p;
                while p < raw.len() && !is_whspace(raw[p]) {
                    p += 1;
                }
                self.re.anchor = String::from_utf8_lossy(&raw[start..p]).into_owned();
            }

            if self.option.contains(HtrdOption::CANONQPATH) {
                path = canon_qpath(&path);
            }
            self.re.path = path;

            if p >= raw.len() || !is_space(raw[p]) {
                return Err(badre("request target not followed by space"));
            }
            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }

            // HTTP/x.y
            let ver = raw.get(p..p + 8).ok_or_else(|| badre("missing version"))?;
            if !ver[..4].eq_ignore_ascii_case(b"HTTP") || ver[4] != b'/' || ver[6] != b'.' {
                return Err(badre("malformed request version"));
            }
            let major = (ver[5] as char).to_digit(10);
            let minor = (ver[7] as char).to_digit(10);
            let (Some(major), Some(minor)) = (major, minor) else {
                return Err(badre("malformed request version"));
            };
            self.re.version = HttpVersion {
                major: major as u8,
                minor: minor as u8,
            };
            self.re.verstr = String::from_utf8_lossy(&raw[p..p + 8]).into_owned();
            p += 8;

            while p < raw.len() && is_space(raw[p]) {
                p += 1;
            }
            if p >= raw.len() || raw[p] != b'\n' {
                return Err(badre("request line not terminated"));
            }
            p += 1;
        }

        // keep-alive is the default from HTTP/1.1 on; the Connection
        // header may override it later
        if self.re.version.major > 1 || (self.re.version.major == 1 && self.re.version.minor >= 1)
        {
            self.re.flags.keepalive = true;
        }
        Ok(p)
    }

    fn parse_header_field(&mut self, raw: &[u8], p: usize, into_trailers: bool) -> Result<usize> {
        self.parse_header_field_into(raw, p, into_trailers)
    }

    fn parse_header_field_into(
        &mut self,
        raw: &[u8],
        mut p: usize,
        into_trailers: bool,
    ) -> Result<usize> {
        // field name
        let name_start = p;
        let mut name_end = p;
        while p < raw.len() && raw[p] != b'\n' && raw[p] != b':' {
            if !is_space(raw[p]) {
                name_end = p + 1;
            }
            p += 1;
        }

        if p >= raw.len() || raw[p] != b':' {
            if !self.option.contains(HtrdOption::STRICT) {
                while p < raw.len() && is_space(raw[p]) {
                    p += 1;
                }
                if p < raw.len() && raw[p] == b'\n' {
                    // tolerate a line without a colon
                    return Ok(p + 1);
                }
            }
            return Err(badre("malformed header field"));
        }
        let name = String::from_utf8_lossy(&raw[name_start..name_end]).into_owned();

        // skip the colon and the spaces after it
        p += 1;
        while p < raw.len() && is_space(raw[p]) {
            p += 1;
        }

        let mut value = String::new();
        let mut seg_start = p;
        let mut seg_end = p;
        while p < raw.len() && raw[p] != b'\n' {
            if !is_space(raw[p]) {
                seg_end = p + 1;
            }
            p += 1;
        }
        if p >= raw.len() {
            return Err(badre("header field not terminated"));
        }
        value.push_str(&String::from_utf8_lossy(&raw[seg_start..seg_end]));
        p += 1; // past the LF

        // folded continuation lines merge into the value with a single
        // space replacing the folding whitespace
        while p < raw.len() && is_pure_space(raw[p]) {
            while p < raw.len() && is_pure_space(raw[p]) {
                p += 1;
            }
            seg_start = p;
            seg_end = p;
            while p < raw.len() && raw[p] != b'\n' {
                if !is_space(raw[p]) {
                    seg_end = p + 1;
                }
                p += 1;
            }
            if p >= raw.len() {
                return Err(badre("folded header field not terminated"));
            }
            if seg_end > seg_start {
                value.push(' ');
                value.push_str(&String::from_utf8_lossy(&raw[seg_start..seg_end]));
            }
            p += 1;
        }

        if into_trailers {
            self.re.trailers.append(&name, value);
        } else {
            self.re.hdrtab.append(&name, value);
            self.capture_key_header(&name)?;
        }
        Ok(p)
    }

    /// Interprets the fields the decoder itself depends on. Acts on
    /// the most recent value, as values of a repeated field accumulate.
    fn capture_key_header(&mut self, name: &str) -> Result<()> {
        if name.eq_ignore_ascii_case("Connection") {
            let val = self.re.hdrtab.last_value("Connection").unwrap_or("");
            if find_word_in_comma_list(val, "close") {
                self.re.flags.keepalive = false;
            } else if find_word_in_comma_list(val, "keep-alive") {
                self.re.flags.keepalive = true;
            } else if self.re.version.major < 1
                || (self.re.version.major == 1 && self.re.version.minor == 0)
            {
                // HTTP/1.0 with an unrecognized value closes
                self.re.flags.keepalive = false;
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            let val = self.re.hdrtab.last_value("Content-Length").unwrap_or("");
            if val.is_empty() {
                return Err(badre("empty Content-Length"));
            }
            let mut len: usize = 0;
            for ch in val.chars() {
                let d = ch.to_digit(10).ok_or_else(|| badre("non-digit Content-Length"))?;
                len = len
                    .checked_mul(10)
                    .and_then(|l| l.checked_add(d as usize))
                    .ok_or_else(|| badre("Content-Length overflow"))?;
            }
            if self.re.flags.chunked && len > 0 {
                return Err(badre("Content-Length conflicts with chunked encoding"));
            }
            self.re.flags.length = true;
            self.re.content_length = len;
        } else if name.eq_ignore_ascii_case("Expect") {
            self.re.flags.expect = true;
            if let Some(vals) = self.re.hdrtab.values("Expect") {
                if vals.iter().any(|v| v.eq_ignore_ascii_case("100-continue")) {
                    self.re.flags.expect100 = true;
                }
            }
        } else if name.eq_ignore_ascii_case("Status") {
            self.re.status_hdr = self.re.hdrtab.last_value("Status").map(str::to_string);
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            let val = self.re.hdrtab.last_value("Transfer-Encoding").unwrap_or("");
            if val.eq_ignore_ascii_case("chunked") {
                if self.re.flags.length {
                    return Err(badre("chunked encoding conflicts with Content-Length"));
                }
                self.re.flags.chunked = true;
            } else {
                // no other transfer encoding is supported
                return Err(badre("unsupported transfer encoding"));
            }
        }
        Ok(())
    }
}

/// Case-insensitive word search in a comma-delimited list.
fn find_word_in_comma_list(list: &str, word: &str) -> bool {
    list.split(',')
        .any(|item| item.trim().eq_ignore_ascii_case(word))
}

/// Resolves `.` and `..` segments; `..` at the root stays at the root.
fn canon_qpath(path: &str) -> String {
    // a scheme prefix is canonicalized from its authority part on
    let (prefix, rest) = match path.find("://") {
        Some(idx) => {
            let after = idx + 3;
            match path[after..].find('/') {
                Some(slash) => path.split_at(after + slash),
                None => return path.to_string(),
            }
        }
        None => ("", path),
    };

    let absolute = rest.starts_with('/');
    let mut segs: Vec<&str> = Vec::new();
    for seg in rest.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            _ => segs.push(seg),
        }
    }

    let mut out = String::with_capacity(path.len());
    out.push_str(prefix);
    if absolute {
        out.push('/');
    }
    out.push_str(&segs.join("/"));
    if rest.ends_with('/') && !out.ends_with('/') {
        out.push('/');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Rec {
        peeks: usize,
        pokes: usize,
        method: Option<HttpMethod>,
        path: String,
        content: Vec<u8>,
        keepalive: Option<bool>,
        trailers: Vec<(String, String)>,
        suspend_on_peek: bool,
        dummify_on_peek: bool,
    }

    impl HtrdHandler for Rec {
        fn peek(&mut self, re: &mut Htre, ctl: &mut FeedCtl) -> Result<()> {
            self.peeks += 1;
            self.method = Some(re.method());
            self.path = re.path().to_string();
            self.keepalive = Some(re.flags().keepalive);
            if self.suspend_on_peek {
                ctl.suspend();
            }
            if self.dummify_on_peek {
                ctl.dummify();
            }
            Ok(())
        }

        fn poke(&mut self, re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
            self.pokes += 1;
            self.content = re.content().to_vec();
            self.trailers = re
                .trailers()
                .iter()
                .map(|(n, vs)| (n.to_string(), vs.join(",")))
                .collect();
            Ok(())
        }
    }

    const CHUNKED_POST: &[u8] =
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

    #[test]
    fn chunked_request_in_three_slices() {
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        for part in [&CHUNKED_POST[..30], &CHUNKED_POST[30..70], &CHUNKED_POST[70..]] {
            htrd.feed(part, &mut rec, false).unwrap();
        }
        assert_eq!(rec.peeks, 1);
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.method, Some(HttpMethod::Post));
        assert_eq!(rec.content, b"hello world");
        assert_eq!(rec.content.len(), 11);
    }

    #[test]
    fn byte_at_a_time_equals_whole_feed() {
        let mut whole = Rec::default();
        let mut htrd = Htrd::new(HtrdOption::default());
        htrd.feed(CHUNKED_POST, &mut whole, false).unwrap();

        let mut bytewise = Rec::default();
        let mut htrd = Htrd::new(HtrdOption::default());
        for b in CHUNKED_POST {
            htrd.feed(std::slice::from_ref(b), &mut bytewise, false).unwrap();
        }

        assert_eq!(whole.peeks, bytewise.peeks);
        assert_eq!(whole.pokes, bytewise.pokes);
        assert_eq!(whole.content, bytewise.content);
        assert_eq!(whole.path, bytewise.path);
    }

    #[test]
    fn content_length_body() {
        let msg = b"PUT /x HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\nabcdGET";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        let consumed = htrd.feed(msg, &mut rec, true).unwrap();
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.content, b"abcd");
        assert_eq!(&msg[consumed..], b"GET"); // pipelined leftover
    }

    #[test]
    fn lf_only_line_endings() {
        let msg = b"GET /p HTTP/1.0\nHost: x\n\n";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.peeks, 1);
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.keepalive, Some(false)); // HTTP/1.0 default
    }

    #[test]
    fn folded_header_merges_with_single_space() {
        let msg = b"GET / HTTP/1.1\r\nX-Long: first\r\n   continued here\r\n\r\n";

        struct Check;
        impl HtrdHandler for Check {
            fn peek(&mut self, re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
                assert_eq!(re.headers().last_value("x-long"), Some("first continued here"));
                Ok(())
            }
            fn poke(&mut self, _re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
                Ok(())
            }
        }
        let mut htrd = Htrd::new(HtrdOption::default());
        htrd.feed(msg, &mut Check, false).unwrap();
    }

    #[test]
    fn connection_close_overrides_11_default() {
        let msg = b"GET / HTTP/1.1\r\nConnection: foo, Close\r\n\r\n";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.keepalive, Some(false));
    }

    #[test]
    fn chunked_with_content_length_is_rejected() {
        let msg = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        let err = htrd.feed(msg, &mut rec, false).unwrap_err();
        assert_eq!(err.num(), Errnum::Badre);
    }

    #[test]
    fn trailers_into_separate_table() {
        let msg = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Sum: 9\r\n\r\n";
        let mut htrd = Htrd::new(HtrdOption::default() | HtrdOption::TRAILERS);
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.content, b"abc");
        assert_eq!(rec.trailers, vec![("X-Sum".to_string(), "9".to_string())]);
    }

    #[test]
    fn suspended_feed_is_an_error() {
        let msg = b"GET / HTTP/1.1\r\n\r\nGET /2 HTTP/1.1\r\n\r\n";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec {
            suspend_on_peek: true,
            ..Rec::default()
        };
        assert!(htrd.feed(msg, &mut rec, false).is_err());
        assert_eq!(rec.peeks, 1);
        assert!(htrd.is_suspended());
        htrd.resume();
        assert!(!htrd.is_suspended());
    }

    #[test]
    fn dummified_passes_raw_bytes() {
        let msg = b"GET / HTTP/1.1\r\n\r\nnot http anymore";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec {
            dummify_on_peek: true,
            ..Rec::default()
        };
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.pokes, 1);
        // leftover bytes flow into the next record as raw content
        struct Sink(Vec<u8>);
        impl HtrdHandler for Sink {
            fn peek(&mut self, _: &mut Htre, _: &mut FeedCtl) -> Result<()> {
                panic!("no peek in raw mode");
            }
            fn poke(&mut self, _: &mut Htre, _: &mut FeedCtl) -> Result<()> {
                panic!("no poke in raw mode");
            }
            fn push_content(&mut self, _: &mut Htre, data: &[u8]) -> Result<bool> {
                self.0.extend_from_slice(data);
                Ok(true)
            }
        }
        let mut sink = Sink(Vec::new());
        htrd.feed(b"anything at all", &mut sink, false).unwrap();
        assert_eq!(sink.0, b"anything at all");
    }

    #[test]
    fn skip_empty_lines_tolerates_leading_blank_lines() {
        let msg = b"\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let mut htrd = Htrd::new(HtrdOption::default() | HtrdOption::SKIP_EMPTY_LINES);
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.peeks, 1);
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.path, "/");
    }

    #[test]
    fn response_read_to_close() {
        let msg = b"HTTP/1.0 200 OK\r\nServer: s\r\n\r\npartial body";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.peeks, 1);
        assert_eq!(rec.pokes, 0); // body still open
        htrd.feed(b" more", &mut rec, false).unwrap();
        htrd.halt(&mut rec).unwrap();
        assert_eq!(rec.pokes, 1);
        assert_eq!(rec.content, b"partial body more");
    }

    #[test]
    fn keepalive_response_without_framing_drops_trailing_bytes() {
        let msg = b"HTTP/1.1 304 Not Modified\r\nConnection: keep-alive\r\n\r\ngarbage";
        let mut htrd = Htrd::new(HtrdOption::default());
        let mut rec = Rec::default();
        htrd.feed(msg, &mut rec, false).unwrap();
        assert_eq!(rec.pokes, 1);
        assert!(rec.content.is_empty());
    }

    #[test]
    fn canon_qpath_resolves_dot_segments() {
        assert_eq!(canon_qpath("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(canon_qpath("/../x"), "/x");
        assert_eq!(canon_qpath("http://h/a/../b"), "http://h/b");
        assert_eq!(canon_qpath("/a/b/"), "/a/b/");
    }

    #[test]
    fn multiple_same_named_headers_keep_order() {
        let msg =
            b"GET / HTTP/1.1\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        struct Check;
        impl HtrdHandler for Check {
            fn peek(&mut self, re: &mut Htre, _ctl: &mut FeedCtl) -> Result<()> {
                let vals = re.headers().values("set-cookie").unwrap();
                assert_eq!(vals, ["a=1".to_string(), "b=2".to_string()]);
                Ok(())
            }
            fn poke(&mut self, _: &mut Htre, _: &mut FeedCtl) -> Result<()> {
                Ok(())
            }
        }
        let mut htrd = Htrd::new(HtrdOption::default());
        htrd.feed(msg, &mut Check, false).unwrap();
    }
}
