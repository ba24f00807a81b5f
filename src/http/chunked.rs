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

use super::{
    line::{is_folded, parse_header_line, trim_ows, LineBuffer},
    message::{BodyBuffer, Headers},
    HttpParseError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub consumed: usize,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataEnd { saw_cr: bool },
    Trailers,
    Done,
}

/// Incremental decoder for one `Transfer-Encoding: chunked` body.
///
/// Decoded payload goes into the caller's [`BodyBuffer`], so capture limits apply the
/// same way they do for length-delimited bodies. Trailer fields are collected and handed
/// out by [`ChunkedBodyDecoder::take_trailers`] once the body is done.
#[derive(Debug)]
pub struct ChunkedBodyDecoder {
    state: ChunkState,
    line: LineBuffer,
    line_used: usize,
    trailers: Headers,
    trailer_used: usize,
    max_line_bytes: usize,
}

impl ChunkedBodyDecoder {
    /// `max_line_bytes` bounds a single size line and the whole trailer block.
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            state: ChunkState::Size,
            line: LineBuffer::default(),
            line_used: 0,
            trailers: Headers::new(),
            trailer_used: 0,
            max_line_bytes,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn take_trailers(&mut self) -> Headers {
        std::mem::take(&mut self.trailers)
    }

    /// Consumes as much of `input` as belongs to this body.
    ///
    /// Stops at the end of the trailer block; anything after it is left unconsumed.
    pub fn feed(
        &mut self,
        input: &[u8],
        body: &mut BodyBuffer,
    ) -> Result<ChunkProgress, HttpParseError> {
        let mut consumed = 0;

        while consumed < input.len() && self.state != ChunkState::Done {
            let rest = &input[consumed..];
            match self.state {
                ChunkState::Size => {
                    let budget = self.max_line_bytes.saturating_sub(self.line_used);
                    let (line, used) = self.line.take_line(rest, budget, self.max_line_bytes)?;
                    consumed += used;
                    self.line_used += used;
                    if let Some(line) = line {
                        self.line_used = 0;
                        let size = parse_chunk_size(&line)?;
                        self.state = if size == 0 {
                            ChunkState::Trailers
                        } else {
                            ChunkState::Data { remaining: size }
                        };
                    }
                }
                ChunkState::Data { remaining } => {
                    let take = remaining.min(rest.len() as u64) as usize;
                    body.push_bytes(&rest[..take]);
                    consumed += take;
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataEnd { saw_cr: false }
                    } else {
                        ChunkState::Data { remaining }
                    };
                }
                ChunkState::DataEnd { saw_cr } => {
                    consumed += 1;
                    match (rest[0], saw_cr) {
                        (b'\r', false) => self.state = ChunkState::DataEnd { saw_cr: true },
                        (b'\n', _) => self.state = ChunkState::Size,
                        _ => return Err(HttpParseError::MissingChunkTerminator),
                    }
                }
                ChunkState::Trailers => {
                    let budget = self.max_line_bytes.saturating_sub(self.trailer_used);
                    let (line, used) = self.line.take_line(rest, budget, self.max_line_bytes)?;
                    consumed += used;
                    self.trailer_used += used;
                    if let Some(line) = line {
                        self.push_trailer_line(&line)?;
                    }
                }
                ChunkState::Done => {}
            }
        }

        Ok(ChunkProgress {
            consumed,
            done: self.state == ChunkState::Done,
        })
    }

    fn push_trailer_line(&mut self, line: &[u8]) -> Result<(), HttpParseError> {
        if line.is_empty() {
            self.state = ChunkState::Done;
            return Ok(());
        }
        if is_folded(line) {
            let last = self.trailers.last_mut().ok_or_else(|| {
                HttpParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned())
            })?;
            let mut joined = last.value.to_vec();
            joined.push(b' ');
            joined.extend_from_slice(trim_ows(line));
            last.value = joined.into();
            return Ok(());
        }
        self.trailers.push_field(parse_header_line(line)?);
        Ok(())
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpParseError> {
    let invalid = || HttpParseError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned());

    let digits = match line.iter().position(|&b| b == b';') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let digits = trim_ows(digits);
    if digits.is_empty() {
        return Err(invalid());
    }

    let mut size: u64 = 0;
    for &b in digits {
        let nibble = (b as char).to_digit(16).ok_or_else(invalid)? as u64;
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(nibble))
            .ok_or_else(invalid)?;
    }
    Ok(size)
}
