//! Minimal HTTP/1.1 request representation and parser.
//!
//! The parser waits for a complete request (head plus declared body)
//! before producing anything: an incomplete request is reported by
//! returning a leftover slice as long as the input, which tells the
//! caller to keep buffering.

use std::borrow::Cow;

use thiserror::Error;

/// A request could not be parsed as HTTP at all.
#[derive(Debug, Error)]
#[error("malformed request")]
pub struct MalformedRequest;

/// One parsed HTTP request.
///
/// Fields are plain strings; the engine performs no header
/// normalization beyond what the parser extracts.
#[derive(Debug, Default, Clone)]
pub struct Request {
    pub proto: String,
    pub method: String,
    /// Escaped path, without the query string.
    pub path: String,
    pub query: String,
    /// Raw header block, trailing blank line included.
    pub head: String,
    pub body: String,
    pub remote_addr: String,
}

impl Request {
    /// Looks up a router-bound pattern parameter. Parameters live in the
    /// query string under a `:` prefix, key and value percent-encoded;
    /// this decodes both. Empty values count as absent.
    pub fn param(&self, key: &str) -> Option<String> {
        let want = format!(":{key}");
        for pair in self.query.split('&') {
            let (k, v) = match pair.split_once('=') {
                Some(kv) => kv,
                None => (pair, ""),
            };
            let k = urlencoding::decode(k).unwrap_or(Cow::Borrowed(k));
            if k == want {
                let val = urlencoding::decode(v)
                    .map(Cow::into_owned)
                    .unwrap_or_else(|_| v.to_string());
                if val.is_empty() {
                    return None;
                }
                return Some(val);
            }
        }
        None
    }
}

/// Parses one request out of `data`, returning the unconsumed tail.
///
/// A leftover slice the same length as `data` means the request is not
/// complete yet and no fields should be trusted. `MalformedRequest` is
/// returned when the input cannot even yield a protocol line.
pub fn parse_request<'a>(
    data: &'a [u8],
    req: &mut Request,
) -> Result<&'a [u8], MalformedRequest> {
    let mut i = 0;
    let mut s = 0;
    let mut proto_done = false;

    // method SP path[?query] SP proto CRLF
    while i < data.len() {
        if data[i] == b' ' {
            req.method = lossy(&data[s..i]);
            i += 1;
            s = i;
            let mut q: Option<usize> = None;
            while i < data.len() {
                if data[i] == b'?' && q.is_none() {
                    q = Some(i);
                } else if data[i] == b' ' {
                    match q {
                        Some(q) => {
                            req.path = lossy(&data[s..q]);
                            req.query = lossy(&data[q + 1..i]);
                        }
                        None => {
                            req.path = lossy(&data[s..i]);
                            req.query = String::new();
                        }
                    }
                    i += 1;
                    s = i;
                    while i < data.len() {
                        if data[i] == b'\n' && i > 0 && data[i - 1] == b'\r' {
                            req.proto = lossy(&data[s..i - 1]);
                            proto_done = true;
                            i += 1;
                            s = i;
                            break;
                        }
                        i += 1;
                    }
                    break;
                }
                i += 1;
            }
            break;
        }
        i += 1;
    }
    if !proto_done || req.proto.is_empty() {
        return Err(MalformedRequest);
    }

    let head_start = s;
    let mut content_length = 0usize;
    while i < data.len() {
        if i > 1 && data[i] == b'\n' && data[i - 1] == b'\r' {
            let line = &data[s..i - 1];
            s = i + 1;
            if line.is_empty() {
                req.head = lossy(&data[head_start..i + 1]);
                i += 1;
                if content_length > 0 {
                    if data.len() - i < content_length {
                        break; // body not fully buffered
                    }
                    req.body = lossy(&data[i..i + content_length]);
                    i += content_length;
                } else {
                    req.body = String::new();
                }
                return Ok(&data[i..]);
            }
            if let Some(rest) = line.strip_prefix(b"Content-Length:") {
                let value = String::from_utf8_lossy(rest);
                if let Ok(n) = value.trim().parse::<usize>() {
                    content_length = n;
                }
            }
        }
        i += 1;
    }
    // not enough data
    Ok(data)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
