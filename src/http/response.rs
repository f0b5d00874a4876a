//! HTTP/1.1 response builder.
//!
//! A [`Response`] is created with a default `200 OK`, mutated in place by
//! middleware and handlers through chained `&mut self` setters, and serialized
//! exactly once when the connection writes it out.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::{Headers, StatusCode, Version};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use socketry::http::{Response, StatusCode};
///
/// let mut response = Response::default();
/// response
///     .status(StatusCode::CREATED)
///     .header("X-Request-Id", "abc-123")
///     .text("made it");
///
/// let bytes = response.to_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
/// assert!(text.contains("X-Request-Id: abc-123\r\n"));
/// assert!(text.ends_with("\r\n\r\nmade it"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::Http11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Sets the status code.
    pub fn status(&mut self, status: impl Into<StatusCode>) -> &mut Self {
        self.status = status.into();
        self
    }

    /// Sets the protocol version written on the status line.
    pub fn version(&mut self, version: Version) -> &mut Self {
        self.version = version;
        self
    }

    /// Sets a header, replacing any same-named header. Casing is preserved.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name, value);
        self
    }

    /// Appends to a header as a comma-separated list.
    pub fn append(&mut self, name: impl Into<String>, value: impl AsRef<str>) -> &mut Self {
        self.headers.append(name, value);
        self
    }

    pub fn remove_header(&mut self, name: &str) -> &mut Self {
        self.headers.remove(name);
        self
    }

    /// Adds `field` to the `Vary` header.
    pub fn vary(&mut self, field: &str) -> &mut Self {
        self.append("Vary", field)
    }

    /// Replaces the body.
    pub fn body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    /// Appends bytes to the current body.
    pub fn append_body(&mut self, more: impl AsRef<[u8]>) -> &mut Self {
        self.body.extend_from_slice(more.as_ref());
        self
    }

    /// Sets a `text/plain` body.
    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        self.header("Content-Type", "text/plain")
            .body(text.into())
    }

    /// Sets a `text/html` body.
    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        self.header("Content-Type", "text/html")
            .body(html.into())
    }

    /// Sets an `application/json` body.
    ///
    /// If `value` cannot be serialized the response becomes a
    /// `500 Internal Server Error` instead.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> &mut Self {
        match serde_json::to_vec(value) {
            Ok(body) => self.header("Content-Type", "application/json").body(body),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize JSON response body");
                self.status(StatusCode::INTERNAL_SERVER_ERROR)
                    .text("Internal Server Error")
            }
        }
    }

    /// Turns the response into a `302 Found` redirect to `location`.
    pub fn redirect(&mut self, location: impl Into<String>) -> &mut Self {
        self.status(StatusCode::FOUND)
            .header("Location", location)
            .body(Vec::new())
    }

    /// Answers an `OPTIONS` request with the allowed methods.
    pub fn options(&mut self, allowed: &[&str]) -> &mut Self {
        self.header("Allow", allowed.join(", "))
            .status(StatusCode::OK)
            .body(Vec::new())
    }

    /// Answers a `HEAD` request: explicit `Content-Length`, empty body.
    pub fn head(&mut self, content_length: usize) -> &mut Self {
        self.header("Content-Length", content_length.to_string())
            .status(StatusCode::OK)
            .body(Vec::new())
    }

    /// Returns `true` if the `Content-Type` starts with `content_type`.
    pub fn is(&self, content_type: &str) -> bool {
        self.headers.get("content-type").is_some_and(|ct| {
            ct.get(..content_type.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(content_type))
        })
    }

    /// Returns the status code of this response.
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// Headers are written in insertion order with their original casing.
    /// A `Content-Length` header is added when none was set, unless the status
    /// forbids a body (1xx, 204, 304), in which case the body is not written either.
    pub fn to_bytes(&self) -> BytesMut {
        let no_body = self.status.forbids_body();
        let estimated_size = 128 + self.headers.len() * 64 + self.body.len();
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "{} {} {}\r\n",
                self.version,
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        if !no_body && !self.headers.contains("content-length") {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        if !no_body {
            buf.put(self.body.as_slice());
        }

        buf
    }

    /// Consuming variant of [`to_bytes`](Self::to_bytes).
    pub fn into_bytes(self) -> BytesMut {
        self.to_bytes()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}
