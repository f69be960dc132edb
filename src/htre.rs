//! HTTP request/response records produced by the stream decoder.
//!
//! Header fields keep their arrival order and a same-named field keeps
//! every value it arrived with; values are never folded together, which
//! matters for fields like `Set-Cookie` whose values contain commas.

use std::fmt;

/// Request methods, with a catch-all for extension tokens.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HttpMethod {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
    Patch,
    Other,
}

impl HttpMethod {
    pub fn from_name(name: &str) -> HttpMethod {
        // an ASCII-only, case-sensitive token per the RFC
        match name {
            "OPTIONS" => HttpMethod::Options,
            "GET" => HttpMethod::Get,
            "HEAD" => HttpMethod::Head,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            "PATCH" => HttpMethod::Patch,
            _ => HttpMethod::Other,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Other => "(other)",
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

/// Whether a record is a request or a response.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HtreType {
    Q,
    S,
}

/// Message attributes discovered while parsing headers.
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct HtreFlags {
    pub length: bool,
    pub chunked: bool,
    pub keepalive: bool,
    pub expect: bool,
    pub expect100: bool,
}

struct Header {
    name: String,
    values: Vec<String>,
}

/// Ordered, case-insensitive header table with multi-value fields.
#[derive(Default)]
pub struct HeaderTable {
    entries: Vec<Header>,
}

impl HeaderTable {
    pub fn new() -> HeaderTable {
        HeaderTable {
            entries: Vec::new(),
        }
    }

    /// Adds a value; repeats of the same name extend its value list in
    /// arrival order.
    pub fn append(&mut self, name: &str, value: String) {
        match self
            .entries
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(h) => h.values.push(value),
            None => self.entries.push(Header {
                name: name.to_string(),
                values: vec![value],
            }),
        }
    }

    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.values.as_slice())
    }

    /// The most recently arrived value of a field, which is what the
    /// capture rules act on.
    pub fn last_value(&self, name: &str) -> Option<&str> {
        self.values(name)?.last().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|h| (h.name.as_str(), h.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// One decoded HTTP message.
pub struct Htre {
    pub(crate) typ: HtreType,
    pub(crate) version: HttpVersion,
    pub(crate) verstr: String,

    // request line
    pub(crate) method: HttpMethod,
    pub(crate) method_name: String,
    pub(crate) path: String,
    pub(crate) param: String,
    pub(crate) anchor: String,

    // status line
    pub(crate) code: u16,
    pub(crate) mesg: String,
    pub(crate) status_hdr: Option<String>,

    pub(crate) flags: HtreFlags,
    pub(crate) content_length: usize,
    pub(crate) hdrtab: HeaderTable,
    pub(crate) trailers: HeaderTable,
    pub(crate) content: Vec<u8>,
    pub(crate) content_complete: bool,
}

impl Htre {
    pub(crate) fn new() -> Htre {
        Htre {
            typ: HtreType::Q,
            version: HttpVersion::default(),
            verstr: String::new(),
            method: HttpMethod::Other,
            method_name: String::new(),
            path: String::new(),
            param: String::new(),
            anchor: String::new(),
            code: 0,
            mesg: String::new(),
            status_hdr: None,
            flags: HtreFlags::default(),
            content_length: 0,
            hdrtab: HeaderTable::new(),
            trailers: HeaderTable::new(),
            content: Vec::new(),
            content_complete: false,
        }
    }

    pub fn typ(&self) -> HtreType {
        self.typ
    }

    pub fn is_request(&self) -> bool {
        self.typ == HtreType::Q
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn version_str(&self) -> &str {
        &self.verstr
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn status_code(&self) -> u16 {
        self.code
    }

    pub fn status_mesg(&self) -> &str {
        &self.mesg
    }

    pub fn flags(&self) -> HtreFlags {
        self.flags
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn headers(&self) -> &HeaderTable {
        &self.hdrtab
    }

    pub fn trailers(&self) -> &HeaderTable {
        &self.trailers
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn is_content_complete(&self) -> bool {
        self.content_complete
    }

    pub(crate) fn complete_content(&mut self) {
        self.content_complete = true;
    }

    pub(crate) fn clear(&mut self) {
        *self = Htre::new();
    }
}
