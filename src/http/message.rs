/* STATIC Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};

use super::HttpParseError;

/// One header field exactly as it appeared on the wire (name case preserved).
///
/// Values are kept as raw bytes because nothing forces them to be UTF-8; use
/// [`HeaderField::value_str`] when a textual view is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered header list. Duplicates and relative order survive untouched, which is why
/// this is not an `http::HeaderMap` (that groups values by name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.fields.push(HeaderField::new(name, value));
    }

    pub fn push_field(&mut self, field: HeaderField) {
        self.fields.push(field);
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HeaderField> {
        self.fields.iter()
    }

    /// First value for `name`, as text.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .filter(|field| field.is(name))
            .find_map(HeaderField::value_str)
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a HeaderField> + 'n
    where
        'a: 'n,
    {
        self.fields.iter().filter(move |field| field.is(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// Removes every field called `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|field| !field.is(name));
        before - self.fields.len()
    }

    pub(crate) fn last_mut(&mut self) -> Option<&mut HeaderField> {
        self.fields.last_mut()
    }

    /// True when any comma-separated element of any `name` field equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .filter_map(HeaderField::value_str)
            .flat_map(|value| value.split(','))
            .any(|element| element.trim().eq_ignore_ascii_case(token))
    }

    pub fn is_chunked(&self) -> bool {
        self.has_token("transfer-encoding", "chunked")
    }

    /// Declared body length. Repeated or comma-joined values must all agree.
    pub fn content_length(&self) -> Result<Option<u64>, HttpParseError> {
        let mut declared: Option<u64> = None;
        for field in self.get_all("content-length") {
            let raw = field
                .value_str()
                .ok_or_else(|| HttpParseError::InvalidContentLength("<non-utf8>".into()))?;
            for element in raw.split(',') {
                let element = element.trim();
                if element.is_empty() || !element.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(HttpParseError::InvalidContentLength(raw.to_string()));
                }
                let len: u64 = element
                    .parse()
                    .map_err(|_| HttpParseError::InvalidContentLength(raw.to_string()))?;
                match declared {
                    Some(existing) if existing != len => {
                        return Err(HttpParseError::InvalidContentLength(raw.to_string()))
                    }
                    _ => declared = Some(len),
                }
            }
        }
        Ok(declared)
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HeaderField;
    type IntoIter = std::slice::Iter<'a, HeaderField>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

impl FromIterator<HeaderField> for Headers {
    fn from_iter<I: IntoIterator<Item = HeaderField>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    /// Request target as sent: origin-form, absolute-form, authority-form or `*`.
    pub target: String,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: Version,
    pub status: StatusCode,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

/// A fully framed HTTP message. Built by the readers on completion and never mutated
/// after it has been handed to event subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: StartLine,
    pub headers: Headers,
    /// Captured body; empty when capture is off or the body overflowed the capture limit.
    pub body: Bytes,
    /// Decoded body length as seen on the wire, regardless of capture.
    pub body_len: u64,
    pub body_truncated: bool,
    pub trailers: Headers,
}

impl HttpMessage {
    pub fn request_line(&self) -> Option<&RequestLine> {
        match &self.start_line {
            StartLine::Request(line) => Some(line),
            StartLine::Response(_) => None,
        }
    }

    pub fn status_line(&self) -> Option<&StatusLine> {
        match &self.start_line {
            StartLine::Response(line) => Some(line),
            StartLine::Request(_) => None,
        }
    }

    pub fn version(&self) -> Version {
        match &self.start_line {
            StartLine::Request(line) => line.version,
            StartLine::Response(line) => line.version,
        }
    }

    /// Whether the sender wants the connection kept open after this message.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("connection", "close") {
            return false;
        }
        match self.version() {
            Version::HTTP_10 => self.headers.has_token("connection", "keep-alive"),
            _ => true,
        }
    }
}

pub fn version_label(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Body capture buffer bounded by the capture-size limit.
///
/// Every byte is counted, but bytes are only retained while the running total stays
/// within `limit`. The first overflow drops what was retained and stops capturing, so a
/// captured body is either complete or empty.
#[derive(Debug, Default)]
pub struct BodyBuffer {
    data: BytesMut,
    limit: usize,
    wire_len: u64,
    overflowed: bool,
}

impl BodyBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
            wire_len: 0,
            overflowed: false,
        }
    }

    /// Lets a known length short-circuit capture before any byte arrives.
    pub fn expect_len(&mut self, declared: u64) {
        if declared > self.limit as u64 {
            self.overflow();
        }
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) {
        self.wire_len += chunk.len() as u64;
        if self.overflowed || chunk.is_empty() {
            return;
        }
        if self.data.len() + chunk.len() > self.limit {
            self.overflow();
            return;
        }
        self.data.extend_from_slice(chunk);
    }

    /// Counts `len` bytes that were never available for capture.
    pub fn skip(&mut self, len: u64) {
        self.wire_len += len;
        if len > 0 {
            self.overflow();
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn wire_len(&self) -> u64 {
        self.wire_len
    }

    pub fn is_truncated(&self) -> bool {
        self.overflowed
    }

    /// Hands out the captured bytes and resets the buffer for the next body.
    pub fn take(&mut self) -> (Bytes, u64, bool) {
        let captured = self.data.split().freeze();
        let result = (captured, self.wire_len, self.overflowed);
        self.wire_len = 0;
        self.overflowed = false;
        result
    }

    fn overflow(&mut self) {
        self.overflowed = true;
        self.data = BytesMut::new();
    }
}
