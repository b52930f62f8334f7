//! Response assembly.

use std::time::SystemTime;

/// Ordered, case-insensitive header collection.
#[derive(Debug, Default, Clone)]
pub struct Header(Vec<(String, String)>);

impl Header {
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Replaces every value under `key` with the single given one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.0.push((key.to_string(), value.into()));
    }

    /// First value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn del(&mut self, key: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Accumulates one response while a handler runs, then serializes it.
///
/// `Server`, `Date` and `Content-Length` are emitted automatically;
/// anything placed in [`ResponseWriter::header`] follows them.
#[derive(Debug)]
pub struct ResponseWriter {
    head: Header,
    body: Vec<u8>,
    status: u16,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            head: Header::default(),
            body: Vec::new(),
            status: 200,
        }
    }

    pub fn header(&mut self) -> &mut Header {
        &mut self.head
    }

    /// Sets the status line; handlers that never call this send `200 OK`.
    pub fn write_header(&mut self, status: u16) {
        self.status = status;
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Serializes the response into wire bytes.
    pub(crate) fn finish(&self) -> Vec<u8> {
        let mut extra = String::new();
        for (k, v) in self.head.iter() {
            extra.push_str(k);
            extra.push_str(": ");
            extra.push_str(v);
            extra.push_str("\r\n");
        }
        let status = format!("{} {}", self.status, reason(self.status));
        let mut out = Vec::new();
        append_response(&mut out, &status, &extra, &self.body);
        out
    }
}

/// Appends a full response to `out`. `status` is the code plus text,
/// `head` zero or more CRLF-terminated header lines.
pub(crate) fn append_response(out: &mut Vec<u8>, status: &str, head: &str, body: &[u8]) {
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_bytes());
    out.extend_from_slice(b"\r\nServer: weir\r\nDate: ");
    out.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
    out.extend_from_slice(b"\r\n");
    if !body.is_empty() {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}
