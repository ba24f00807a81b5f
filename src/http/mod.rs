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

//! Incremental HTTP/1.x message framing.
//!
//! Nothing in here touches a socket. Callers push whatever bytes arrived into
//! [`HttpMessageReader::feed`] and get back how much was consumed plus an optional
//! [`ReaderEvent`]; the reader keeps every partial line, chunk and body between calls.

pub mod chunked;
mod line;
pub mod message;
pub mod reader;

pub use chunked::{ChunkProgress, ChunkedBodyDecoder};
pub use message::{
    BodyBuffer, HeaderField, Headers, HttpMessage, RequestLine, StartLine, StatusLine,
};
pub use reader::{HttpMessageReader, MessageKind, Progress, ReaderEvent};

use thiserror::Error;

/// Default ceiling for a start line plus header block (and for a trailer block).
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpParseError {
    #[error("invalid start line: {0:?}")]
    InvalidStartLine(String),

    #[error("unsupported HTTP version: {0:?}")]
    UnsupportedVersion(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk data not followed by CRLF")]
    MissingChunkTerminator,

    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("connection closed in the middle of a message")]
    UnexpectedEof,
}
