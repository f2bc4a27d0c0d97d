//! Query string and form body parsing with percent-decoding.

use memchr::memchr;
use std::collections::{BTreeMap, HashMap};

/// Parser for `application/x-www-form-urlencoded` data.
///
/// Used for both request-URI query strings and form POST bodies. Keys and
/// values are percent-decoded and `+` becomes a space.
///
/// # Examples
/// ```rust
/// use pool_httpd::query::Query;
/// use std::collections::HashMap;
///
/// // Parse into Vec (preserves order)
/// let params: Vec<(String, String)> = Query::parse("name=john+doe&age=25&city", 10).unwrap();
/// assert_eq!(params[0], ("name".to_string(), "john doe".to_string()));
/// assert_eq!(params[2], ("city".to_string(), String::new()));
///
/// // Parse into HashMap (last value wins)
/// let params: HashMap<String, String> = Query::parse("?key=1&key=%32", 10).unwrap();
/// assert_eq!(params["key"], "2");
///
/// // Handle limits
/// let result = Query::parse::<Vec<(String, String)>>("a=1&b=2", 1);
/// assert!(result.is_err());
/// ```
pub struct Query;

impl Query {
    /// Parses a query string into a new collection.
    ///
    /// A leading `?` is skipped, so `?a=1` and `a=1` are equivalent. Empty
    /// input yields an empty collection.
    #[inline(always)]
    pub fn parse<C: QueryCollector>(query: &str, limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a query string into an existing collection, appending.
    #[inline]
    pub fn parse_into<C: QueryCollector>(
        result: &mut C,
        query: &str,
        limit: usize,
    ) -> Result<(), Error> {
        let data = query.strip_prefix('?').unwrap_or(query).as_bytes();

        let mut start = 0;
        while start < data.len() {
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            // "a=1&&b=2"
            if end == start {
                start = end + 1;
                continue;
            }

            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            let key = &data[start..split_index];
            let value: &[u8] = match split_index < end {
                true => &data[split_index + 1..end],
                false => b"",
            };

            result.add_param(decode_form(key), decode_form(value));
            start = end + 1;
        }

        Ok(())
    }
}

/// Storage for parsed parameters.
pub trait QueryCollector
where
    Self: Sized,
{
    fn add_param(&mut self, key: String, value: String);

    // `length` rather than `len` so implementors don't need `is_empty`.
    fn length(&self) -> usize;

    fn with_capacity(capacity: usize) -> Self;
}

impl QueryCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

impl QueryCollector for HashMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

impl QueryCollector for BTreeMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(_: usize) -> Self {
        BTreeMap::new()
    }
}

/// Query parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More parameters than the caller allowed.
    #[error("Query parameter limit exceeded: limit={0}")]
    OverLimit(usize),
}

#[inline]
fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_bytes(src: &[u8], plus_is_space: bool) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        match src[i] {
            b'%' if i + 2 < src.len() => {
                match (hex_val(src[i + 1]), hex_val(src[i + 2])) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b'+' if plus_is_space => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

#[inline]
fn decode_form(src: &[u8]) -> String {
    decode_bytes(src, true)
}

/// Percent-decodes a URI path component; `+` is kept literally.
///
/// Malformed escapes are passed through unchanged.
pub fn url_decode(src: &str) -> String {
    decode_bytes(src.as_bytes(), false)
}

/// Percent-encodes everything outside the unreserved set, for form bodies.
pub fn url_encode(src: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(src.len());
    for &b in src.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0xF) as usize] as char);
            }
        }
    }
    out
}

/// Builds a form body from pairs, e.g. for [`HttpClientSocket::post_form`](crate::HttpClientSocket::post_form).
pub fn encode_form<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (k, v) in pairs {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(&url_encode(k));
        out.push('=');
        out.push_str(&url_encode(v));
    }
    out
}
