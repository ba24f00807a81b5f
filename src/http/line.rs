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

use bytes::Bytes;

use super::{message::HeaderField, HttpParseError};

/// Accumulates one protocol line across arbitrary feed boundaries.
///
/// The terminator is LF; a CR immediately before it is dropped, so CRLF and bare LF
/// both work even when the CR ends one feed and the LF starts the next.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Returns the completed line (if any) and the number of input bytes used.
    ///
    /// `budget` is how many more bytes this line may grow by before the head limit trips.
    pub(crate) fn take_line(
        &mut self,
        input: &[u8],
        budget: usize,
        limit: usize,
    ) -> Result<(Option<Vec<u8>>, usize), HttpParseError> {
        match input.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                if idx > budget {
                    return Err(HttpParseError::HeadTooLarge(limit));
                }
                self.buf.extend_from_slice(&input[..idx]);
                let mut line = std::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok((Some(line), idx + 1))
            }
            None => {
                if input.len() > budget {
                    return Err(HttpParseError::HeadTooLarge(limit));
                }
                self.buf.extend_from_slice(input);
                Ok((None, input.len()))
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Parses `name: value`, trimming optional whitespace around the value.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<HeaderField, HttpParseError> {
    let invalid = || HttpParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned());

    let colon = line.iter().position(|&b| b == b':').ok_or_else(invalid)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
        return Err(invalid());
    }

    let value = trim_ows(&line[colon + 1..]);
    let name = std::str::from_utf8(name).map_err(|_| invalid())?;
    Ok(HeaderField::new(name, Bytes::copy_from_slice(value)))
}

/// A header line starting with SP or HTAB continues the previous field (obs-fold).
pub(crate) fn is_folded(line: &[u8]) -> bool {
    matches!(line.first(), Some(b' ') | Some(b'\t'))
}

pub(crate) fn trim_ows(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

// RFC 7230 tchar
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
