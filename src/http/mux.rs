//! Pattern-matching request router.
//!
//! Patterns are literal paths with `:name` segments (`/user/:id/posts`)
//! and optional trailing-slash prefix matching (`/static/` matches
//! everything under it). Within one method, patterns are tried in
//! registration order and the first match wins. Matched parameters are
//! injected into the request's query string under a `:` prefix so
//! handlers read them through [`Request::param`].

use std::collections::HashMap;

use super::request::Request;
use super::response::ResponseWriter;

/// Responds to one matched request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, w: &mut ResponseWriter, r: &mut Request);
}

impl<F> Handler for F
where
    F: Fn(&mut ResponseWriter, &mut Request) + Send + Sync + 'static,
{
    fn handle(&self, w: &mut ResponseWriter, r: &mut Request) {
        self(w, r)
    }
}

pub struct PatternRouter {
    handlers: HashMap<String, Vec<PatternHandler>>,
    not_found: Option<Box<dyn Handler>>,
}

struct PatternHandler {
    pattern: String,
    handler: Box<dyn Handler>,
}

impl Default for PatternRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            not_found: None,
        }
    }

    /// Replaces the default 404 response. Set before serving.
    pub fn not_found(&mut self, handler: impl Handler) {
        self.not_found = Some(Box::new(handler));
    }

    pub fn head(&mut self, pattern: &str, handler: impl Handler) {
        self.add("HEAD", pattern, handler);
    }

    /// Registers for GET and, unless already taken, HEAD. Register HEAD
    /// first to override the implied handler.
    pub fn get(&mut self, pattern: &str, handler: impl Handler + Clone) {
        self.add("HEAD", pattern, handler.clone());
        self.add("GET", pattern, handler);
    }

    pub fn post(&mut self, pattern: &str, handler: impl Handler) {
        self.add("POST", pattern, handler);
    }

    pub fn put(&mut self, pattern: &str, handler: impl Handler) {
        self.add("PUT", pattern, handler);
    }

    pub fn del(&mut self, pattern: &str, handler: impl Handler) {
        self.add("DELETE", pattern, handler);
    }

    pub fn options(&mut self, pattern: &str, handler: impl Handler) {
        self.add("OPTIONS", pattern, handler);
    }

    pub fn patch(&mut self, pattern: &str, handler: impl Handler) {
        self.add("PATCH", pattern, handler);
    }

    /// Registers `pattern` for `method`. A pattern already registered for
    /// that method is left untouched.
    pub fn add(&mut self, method: &str, pattern: &str, handler: impl Handler) {
        let list = self.handlers.entry(method.to_string()).or_default();
        if list.iter().any(|ph| ph.pattern == pattern) {
            return;
        }
        list.push(PatternHandler {
            pattern: pattern.to_string(),
            handler: Box::new(handler),
        });
    }

    pub fn serve_http(&self, w: &mut ResponseWriter, r: &mut Request) {
        if let Some(list) = self.handlers.get(&r.method) {
            for ph in list {
                if let Some(params) = ph.try_match(&r.path) {
                    if !params.is_empty() {
                        let encoded = encode_params(&params);
                        r.query = if r.query.is_empty() {
                            encoded
                        } else {
                            format!("{encoded}&{}", r.query)
                        };
                    }
                    ph.handler.handle(w, r);
                    return;
                }
            }
        }

        if let Some(nf) = &self.not_found {
            nf.handle(w, r);
            return;
        }

        let mut allowed: Vec<&str> = Vec::new();
        for (method, list) in &self.handlers {
            if method == &r.method {
                continue;
            }
            if list.iter().any(|ph| ph.try_match(&r.path).is_some()) {
                allowed.push(method);
            }
        }
        if allowed.is_empty() {
            default_not_found(w);
            return;
        }
        allowed.sort_unstable();
        w.header().add("Allow", allowed.join(", "));
        w.write_header(405);
        w.set_body(b"Method Not Allowed\n".to_vec());
    }
}

pub(crate) fn default_not_found(w: &mut ResponseWriter) {
    w.write_header(404);
    w.set_body(b"404 page not found\n".to_vec());
}

impl PatternHandler {
    /// Matches `path` against the pattern, yielding `(":name", value)`
    /// pairs with values percent-decoded. A value that fails to decode
    /// fails the whole match.
    fn try_match(&self, path: &str) -> Option<Vec<(String, String)>> {
        let pat = self.pattern.as_bytes();
        let path = path.as_bytes();
        let mut params = Vec::new();
        let mut i = 0;
        let mut j = 0;
        while i < path.len() {
            if j >= pat.len() {
                if self.pattern != "/" && pat.last() == Some(&b'/') {
                    return Some(params);
                }
                return None;
            }
            if pat[j] == b':' {
                let (name, next, nj) = scan(pat, j + 1, is_alnum);
                j = nj;
                let (value, _, ni) = scan(path, i, |c| c != next && c != b'/');
                i = ni;
                let name = std::str::from_utf8(name).ok()?;
                let value = std::str::from_utf8(value).ok()?;
                let value = urlencoding::decode(value).ok()?;
                params.push((format!(":{name}"), value.into_owned()));
            } else if path[i] == pat[j] {
                i += 1;
                j += 1;
            } else {
                return None;
            }
        }
        if j != pat.len() {
            return None;
        }
        Some(params)
    }
}

/// Consumes bytes of `s` from `i` while `f` holds, returning the span,
/// the byte that stopped the scan (0 at end of input) and the new index.
fn scan(s: &[u8], i: usize, f: impl Fn(u8) -> bool) -> (&[u8], u8, usize) {
    let mut j = i;
    while j < s.len() && f(s[j]) {
        j += 1;
    }
    let next = if j < s.len() { s[j] } else { 0 };
    (&s[i..j], next, j)
}

fn is_alnum(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn encode_params(params: &[(String, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, path: &str) -> Request {
        Request {
            method: method.into(),
            path: path.into(),
            proto: "HTTP/1.1".into(),
            ..Request::default()
        }
    }

    fn echo_param(name: &'static str) -> impl Handler + Clone {
        move |w: &mut ResponseWriter, r: &mut Request| {
            let value = r.param(name).unwrap_or_default();
            w.set_body(value.into_bytes());
        }
    }

    fn body_of(w: ResponseWriter) -> String {
        let raw = String::from_utf8(w.finish()).unwrap();
        let split = raw.find("\r\n\r\n").unwrap();
        raw[split + 4..].to_string()
    }

    fn status_of(w: ResponseWriter) -> String {
        let raw = String::from_utf8(w.finish()).unwrap();
        raw.lines().next().unwrap().to_string()
    }

    #[test]
    fn binds_named_parameters() {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", echo_param("name"));
        let mut w = ResponseWriter::new();
        let mut r = request("GET", "/hello/alice");
        mux.serve_http(&mut w, &mut r);
        assert_eq!(body_of(w), "alice");
    }

    #[test]
    fn parameter_values_are_percent_decoded() {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", echo_param("name"));
        let mut w = ResponseWriter::new();
        let mut r = request("GET", "/hello/big%20sur");
        mux.serve_http(&mut w, &mut r);
        assert_eq!(body_of(w), "big sur");
    }

    #[test]
    fn trailing_slash_matches_prefix() {
        let mut mux = PatternRouter::new();
        mux.get("/static/", |w: &mut ResponseWriter, _: &mut Request| {
            w.set_body(b"file".to_vec());
        });
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/static/css/site.css"));
        assert_eq!(body_of(w), "file");

        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/staticfile"));
        assert!(status_of(w).contains("404"));
    }

    #[test]
    fn first_registered_pattern_wins() {
        let mut mux = PatternRouter::new();
        mux.get("/x/:a", echo_param("a"));
        mux.get("/x/:b", echo_param("b"));
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/x/1"));
        assert_eq!(body_of(w), "1");
    }

    #[test]
    fn get_implies_head() {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", echo_param("name"));
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("HEAD", "/hello/bob"));
        assert_eq!(body_of(w), "bob");
    }

    #[test]
    fn wrong_method_gets_405_with_allow() {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", echo_param("name"));
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("POST", "/hello/bob"));
        let raw = String::from_utf8(w.finish()).unwrap();
        assert!(raw.starts_with("HTTP/1.1 405"));
        assert!(raw.contains("Allow: GET, HEAD\r\n"));
    }

    #[test]
    fn unmatched_path_gets_404() {
        let mut mux = PatternRouter::new();
        mux.get("/hello/:name", echo_param("name"));
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/nope"));
        assert!(status_of(w).contains("404 Not Found"));
    }

    #[test]
    fn custom_not_found_takes_over() {
        let mut mux = PatternRouter::new();
        mux.not_found(|w: &mut ResponseWriter, _: &mut Request| {
            w.write_header(404);
            w.set_body(b"gone fishing".to_vec());
        });
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/anything"));
        assert_eq!(body_of(w), "gone fishing");
    }

    #[test]
    fn duplicate_pattern_keeps_the_first_handler() {
        let mut mux = PatternRouter::new();
        mux.add("GET", "/p", |w: &mut ResponseWriter, _: &mut Request| {
            w.set_body(b"first".to_vec());
        });
        mux.add("GET", "/p", |w: &mut ResponseWriter, _: &mut Request| {
            w.set_body(b"second".to_vec());
        });
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/p"));
        assert_eq!(body_of(w), "first");
    }

    #[test]
    fn multi_segment_pattern() {
        let mut mux = PatternRouter::new();
        mux.get("/user/:id/posts/:post", echo_param("post"));
        let mut w = ResponseWriter::new();
        mux.serve_http(&mut w, &mut request("GET", "/user/7/posts/42"));
        assert_eq!(body_of(w), "42");
    }
}
