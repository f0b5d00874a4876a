//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use thiserror::Error;

use super::multipart::{self, FilePart, Multipart};
use super::{Headers, Method, PathParams, Version};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete, more data needed")]
    Incomplete,

    #[error("malformed request: {reason}")]
    Malformed { reason: String },

    #[error("request exceeds maximum allowed size of {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

impl RequestError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

impl From<httparse::Error> for RequestError {
    fn from(err: httparse::Error) -> Self {
        Self::malformed(err.to_string())
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. Everything derived
/// from the raw bytes (query parameters, cookies, multipart parts) is computed
/// once at parse time. Path parameters are filled in by the router when a
/// route matches.
///
/// # Examples
///
/// ```
/// use socketry::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\nCookie: sid=abc\r\n\r\n";
/// let (request, _consumed) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.header("host"), Some("localhost"));
/// assert_eq!(request.cookie("sid"), Some("abc"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    version: Version,
    headers: Headers,
    body: Bytes,
    query_params: HashMap<String, String>,
    cookies: HashMap<String, String>,
    path_params: PathParams,
    multipart: Option<Multipart>,
    peer_addr: Option<SocketAddr>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the number of bytes of `buf` it
    /// occupies (head plus body). When a `Content-Length` header is present the
    /// body is exactly that long; otherwise every byte after the blank line is
    /// the body, unless the request asks for a protocol upgrade.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head or the announced body has not fully arrived.
    /// - [`RequestError::Malformed`]: the request line or a header cannot be
    ///   parsed, `Content-Length` is not a number, or a multipart body has no boundary.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        Self::parse_limited(buf, usize::MAX)
    }

    /// Like [`parse`](Self::parse), but rejects a request whose head plus
    /// announced body would exceed `max_size` bytes as soon as its head is
    /// complete, without waiting for the body.
    ///
    /// # Errors
    ///
    /// As [`parse`](Self::parse), plus [`RequestError::TooLarge`].
    pub fn parse_limited(buf: &[u8], max_size: usize) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        // A complete parse always carries all three request-line tokens.
        let (Some(method), Some(raw_path), Some(minor)) =
            (raw_req.method, raw_req.path, raw_req.version)
        else {
            return Err(RequestError::malformed("request line must have three tokens"));
        };

        let method: Method = match method.parse() {
            Ok(method) => method,
            Err(never) => match never {},
        };

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let body_end = match header_map.get("content-length") {
            Some(value) => {
                let len: usize = value
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::malformed("invalid Content-Length"))?;
                let end = body_offset
                    .checked_add(len)
                    .ok_or_else(|| RequestError::malformed("Content-Length too large"))?;
                if end > max_size {
                    return Err(RequestError::TooLarge { max_bytes: max_size });
                }
                if buf.len() < end {
                    return Err(RequestError::Incomplete);
                }
                end
            }
            // Bytes after an upgrade request's head already belong to the new protocol.
            None if header_map.contains("upgrade") => body_offset,
            None => buf.len(),
        };
        let body = Bytes::copy_from_slice(&buf[body_offset..body_end]);

        let multipart = match header_map.get("content-type") {
            Some(ct) if multipart::is_multipart(ct) => {
                let boundary = multipart::boundary(ct)
                    .ok_or_else(|| RequestError::malformed("multipart body without boundary"))?;
                Some(multipart::parse(&body, boundary))
            }
            _ => None,
        };

        let query_params = query.as_deref().map(parse_query_string).unwrap_or_default();
        let cookies = header_map.get("cookie").map(parse_cookies).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                query,
                version: Version::from_minor(minor),
                headers: header_map,
                body,
                query_params,
                cookies,
                path_params: PathParams::new(),
                multipart,
                peer_addr: None,
            },
            body_end,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the full request target: path plus `?query` when present.
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    /// Returns the protocol version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the protocol token, e.g. `HTTP/1.1`.
    pub fn protocol(&self) -> &'static str {
        self.version.as_str()
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Sets a header, replacing any previous value. Intended for middleware.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query_params.get(key).map(String::as_str)
    }

    pub fn query_params(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Replaces the body. Intended for middleware.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Deserializes the body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(&self.body)
    }

    /// Returns a cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// Returns a path parameter captured by the matched route.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name)
    }

    pub fn path_params(&self) -> &PathParams {
        &self.path_params
    }

    pub(crate) fn set_path_params(&mut self, params: PathParams) {
        self.path_params = params;
    }

    /// Returns the uploaded files of a multipart body, keyed by field name.
    pub fn files(&self) -> Option<&HashMap<String, FilePart>> {
        self.multipart.as_ref().map(|m| &m.files)
    }

    pub fn file(&self, name: &str) -> Option<&FilePart> {
        self.multipart.as_ref()?.files.get(name)
    }

    /// Returns a non-file field of a multipart body.
    pub fn form_field(&self, name: &str) -> Option<&str> {
        self.multipart.as_ref()?.fields.get(name).map(String::as_str)
    }

    /// Returns `true` if the `Content-Type` starts with `content_type` (case-insensitive).
    pub fn is(&self, content_type: &str) -> bool {
        self.headers.get("content-type").is_some_and(|ct| {
            ct.get(..content_type.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(content_type))
        })
    }

    /// Returns `true` if the `Accept` header lists `mime` or `*/*`.
    pub fn accepts(&self, mime: &str) -> bool {
        self.headers.get("accept").is_some_and(|accept| {
            accept.split(',').any(|entry| {
                let media = entry.split(';').next().unwrap_or("").trim();
                media == "*/*" || media.eq_ignore_ascii_case(mime)
            })
        })
    }

    /// Returns the `Host` header without its port.
    pub fn hostname(&self) -> Option<&str> {
        let host = self.headers.get("host")?;
        Some(match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        })
    }

    /// Returns the remote address of the connection this request arrived on.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = Some(addr);
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`,
/// percent-decoding keys and values and decoding `+` as a space.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

// `name=value; name2=value2`
fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_owned(), value.trim().to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap().0
    }

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.protocol(), "HTTP/1.1");
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(consumed, raw.len()); // no body
        assert!(req.body().is_empty());
    }

    #[test]
    fn parse_headers_cookies_and_body() {
        let req = parse(
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nCookie: name=value; session=12345\r\n\r\nbody",
        );
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.cookie("name"), Some("value"));
        assert_eq!(req.cookie("session"), Some("12345"));
        assert_eq!(&req.body()[..], b"body");
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /search?q=rust+lang&page=2&tag=a%26b HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let req = parse(raw);
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2&tag=a%26b"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("tag"), Some("a&b"));
        assert_eq!(req.target(), "/search?q=rust+lang&page=2&tag=a%26b");
    }

    #[test]
    fn duplicate_header_last_value_wins() {
        let req = parse(b"GET / HTTP/1.1\r\nX-Id: 1\r\nx-id: 2\r\n\r\n");
        assert_eq!(req.header("X-ID"), Some("2"));
        assert_eq!(req.headers().len(), 1);
    }

    #[test]
    fn upgrade_request_leaves_trailing_bytes() {
        let head = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        let mut raw = head.to_vec();
        raw.extend_from_slice(&[0x81, 0x80]);
        let (req, consumed) = Request::parse(&raw).unwrap();
        assert_eq!(consumed, head.len());
        assert!(req.body().is_empty());
    }

    #[test]
    fn overflowing_content_length_is_malformed() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::Malformed { .. })
        ));
    }

    #[test]
    fn content_length_over_limit_is_rejected_early() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 1000000000000\r\n\r\nabc";
        assert!(matches!(
            Request::parse_limited(raw, 1024),
            Err(RequestError::TooLarge { max_bytes: 1024 })
        ));
        // Within the limit the body is simply still incomplete.
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert!(matches!(
            Request::parse_limited(raw, 1024),
            Err(RequestError::Incomplete)
        ));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn malformed_request_line() {
        let raw = b"GARBAGE\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::Malformed { .. })
        ));
        let raw = b"GET /a b HTTP/1.1\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::Malformed { .. })
        ));
    }

    #[test]
    fn content_length_bounds_body() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhelloEXTRA";
        let (req, consumed) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&req.body()[..], b"hello");
        assert_eq!(&raw[consumed..], b"EXTRA");
    }

    #[test]
    fn content_length_waits_for_body() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn invalid_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::Malformed { .. })
        ));
    }

    #[test]
    fn multipart_files() {
        let mut raw = b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Type: multipart/form-data; boundary=----WebKitFormBoundary\r\n\r\n".to_vec();
        raw.extend_from_slice(b"------WebKitFormBoundary\r\nContent-Disposition: form-data; name=\"file\"; filename=\"example.txt\"\r\n\r\nTest content\r\n------WebKitFormBoundary--\r\n");
        let req = parse(&raw);
        assert!(req.is("multipart/form-data"));
        assert!(!req.is("application/json"));
        let files = req.files().unwrap();
        assert_eq!(files.len(), 1);
        let file = req.file("file").unwrap();
        assert_eq!(file.filename, "example.txt");
        assert_eq!(&file.content[..], b"Test content");
    }

    #[test]
    fn multipart_without_boundary_is_malformed() {
        let raw = b"POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::Malformed { .. })
        ));
    }

    #[test]
    fn accepts_and_hostname() {
        let req = parse(
            b"GET / HTTP/1.1\r\nHost: example.com:8080\r\nAccept: text/html, application/json;q=0.9\r\n\r\n",
        );
        assert!(req.accepts("application/json"));
        assert!(!req.accepts("image/png"));
        assert_eq!(req.hostname(), Some("example.com"));
    }

    #[test]
    fn middleware_mutation() {
        let mut req = parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
        req.set_header("User-Agent", "TestAgent");
        req.set_body("replaced");
        assert_eq!(req.header("user-agent"), Some("TestAgent"));
        assert_eq!(req.body_text(), "replaced");
    }
}
