//! HTTP header map with case-insensitive name lookup.
//!
//! Names keep the casing they were inserted with; lookups ignore case
//! per [RFC 9110 §5].

use std::fmt;

/// A case-insensitive, case-preserving HTTP header map.
///
/// Each name holds a single value: inserting a name that is already present
/// (in any casing) replaces the old entry, so the last value wins. Use
/// [`append`](Self::append) to combine values into a comma-separated list.
///
/// # Examples
///
/// ```
/// use socketry::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("X-Custom", "first");
/// headers.insert("x-custom", "second");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// assert_eq!(headers.get("X-CUSTOM"), Some("second"));
/// assert_eq!(headers.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Sets a header, replacing any existing entry with the same name
    /// (case-insensitive). The new name's casing is the one kept.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(pos) => self.inner[pos] = (name, value),
            None => self.inner.push((name, value)),
        }
    }

    /// Appends `value` to an existing header as `existing, value`, or inserts
    /// the header if it is absent.
    pub fn append(&mut self, name: impl Into<String>, value: impl AsRef<str>) {
        let name = name.into();
        match self.position(&name) {
            Some(pos) => {
                let existing = &mut self.inner[pos].1;
                existing.push_str(", ");
                existing.push_str(value.as_ref());
            }
            None => self.inner.push((name, value.as_ref().to_owned())),
        }
    }

    /// Returns the value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|pos| self.inner[pos].1.as_str())
    }

    /// Removes the entry with the given header name (case-insensitive).
    ///
    /// Returns `true` if an entry was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains an entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Returns the number of header entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.inner
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.inner {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn last_value_wins_and_keeps_new_casing() {
        let mut h = Headers::new();
        h.insert("x-trace", "a");
        h.insert("X-Trace", "b");
        assert_eq!(h.len(), 1);
        assert_eq!(h.iter().next(), Some(("X-Trace", "b")));
    }

    #[test]
    fn append_joins_values() {
        let mut h = Headers::new();
        h.insert("X-Test-Header", "TestValue");
        h.append("x-test-header", "AnotherValue");
        assert_eq!(h.get("X-Test-Header"), Some("TestValue, AnotherValue"));

        h.append("Vary", "Origin");
        assert_eq!(h.get("vary"), Some("Origin"));
    }

    #[test]
    fn remove() {
        let mut h = Headers::new();
        h.insert("X-Foo", "bar");
        assert!(h.remove("x-foo"));
        assert!(h.is_empty());
        assert!(!h.remove("x-foo")); // already gone
    }

    #[test]
    fn contains() {
        let mut h = Headers::new();
        h.insert("Authorization", "Bearer token");
        assert!(h.contains("authorization"));
        assert!(!h.contains("x-missing"));
    }

    #[test]
    fn display_is_wire_format() {
        let mut h = Headers::new();
        h.insert("Host", "example.com");
        h.insert("Accept", "*/*");
        assert_eq!(h.to_string(), "Host: example.com\r\nAccept: */*\r\n");
    }
}
