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

use std::collections::VecDeque;

use http::{Method, StatusCode, Version};
use tracing::debug;

use super::{
    chunked::ChunkedBodyDecoder,
    line::{is_folded, parse_header_line, trim_ows, LineBuffer},
    message::{BodyBuffer, Headers, HttpMessage, RequestLine, StartLine, StatusLine},
    HttpParseError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// Start line and headers are parsed; the body (if any) follows.
    HeadComplete,
    /// A 1xx response other than 101. The reader is ready for the final response.
    Interim(StatusCode),
    Complete(HttpMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub consumed: usize,
    pub event: Option<ReaderEvent>,
}

impl Progress {
    fn pending(consumed: usize) -> Self {
        Self {
            consumed,
            event: None,
        }
    }

    fn with(consumed: usize, event: ReaderEvent) -> Self {
        Self {
            consumed,
            event: Some(event),
        }
    }
}

#[derive(Debug)]
enum BodyFraming {
    Fixed { remaining: u64 },
    Chunked(ChunkedBodyDecoder),
    UntilClose,
}

#[derive(Debug)]
enum ReadState {
    StartLine,
    Headers,
    Body(BodyFraming),
}

/// Turns a byte stream into a sequence of HTTP/1.x messages.
///
/// One reader serves one direction of one connection for its whole life; it resets itself
/// after every completed message so keep-alive and pipelining need nothing special.
/// [`HttpMessageReader::feed`] stops right after it produces an event, so bytes that
/// belong to the next message are never swallowed.
#[derive(Debug)]
pub struct HttpMessageReader {
    kind: MessageKind,
    max_head_bytes: usize,
    state: ReadState,
    line: LineBuffer,
    head_used: usize,
    start_line: Option<StartLine>,
    headers: Headers,
    body: BodyBuffer,
    capture_limit: usize,
    // Methods of requests whose responses are still outstanding, oldest first.
    pending_methods: VecDeque<Method>,
}

impl HttpMessageReader {
    pub fn new(kind: MessageKind, capture_limit: usize, max_head_bytes: usize) -> Self {
        Self {
            kind,
            max_head_bytes,
            state: ReadState::StartLine,
            line: LineBuffer::default(),
            head_used: 0,
            start_line: None,
            headers: Headers::new(),
            body: BodyBuffer::with_limit(capture_limit),
            capture_limit,
            pending_methods: VecDeque::new(),
        }
    }

    pub fn requests(capture_limit: usize, max_head_bytes: usize) -> Self {
        Self::new(MessageKind::Request, capture_limit, max_head_bytes)
    }

    pub fn responses(capture_limit: usize, max_head_bytes: usize) -> Self {
        Self::new(MessageKind::Response, capture_limit, max_head_bytes)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Records the method of a forwarded request so the matching response is framed
    /// correctly (HEAD and CONNECT change the rules).
    pub fn expect_response_to(&mut self, method: &Method) {
        self.pending_methods.push_back(method.clone());
    }

    /// True between messages with no partial line buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, ReadState::StartLine) && self.line.is_empty()
    }

    /// The parsed head of the message in progress, available from `HeadComplete` until
    /// the message completes.
    pub fn head(&self) -> Option<(&StartLine, &Headers)> {
        match self.state {
            ReadState::Body(_) => self.start_line.as_ref().map(|line| (line, &self.headers)),
            _ => None,
        }
    }

    /// True when the current body runs until the peer closes the connection.
    pub fn reads_until_close(&self) -> bool {
        matches!(self.state, ReadState::Body(BodyFraming::UntilClose))
    }

    pub fn feed(&mut self, input: &[u8]) -> Result<Progress, HttpParseError> {
        let mut consumed = 0;

        loop {
            let rest = &input[consumed..];
            match &mut self.state {
                ReadState::StartLine | ReadState::Headers => {
                    if rest.is_empty() {
                        return Ok(Progress::pending(consumed));
                    }
                    let budget = self.max_head_bytes.saturating_sub(self.head_used);
                    let (line, used) = self.line.take_line(rest, budget, self.max_head_bytes)?;
                    consumed += used;
                    self.head_used += used;
                    let Some(line) = line else {
                        return Ok(Progress::pending(consumed));
                    };
                    if let Some(event) = self.on_head_line(&line)? {
                        return Ok(Progress::with(consumed, event));
                    }
                }
                ReadState::Body(BodyFraming::Fixed { remaining }) => {
                    let take = (*remaining).min(rest.len() as u64) as usize;
                    self.body.push_bytes(&rest[..take]);
                    consumed += take;
                    *remaining -= take as u64;
                    if *remaining > 0 {
                        return Ok(Progress::pending(consumed));
                    }
                    let message = self.finish_message(Headers::new())?;
                    return Ok(Progress::with(consumed, ReaderEvent::Complete(message)));
                }
                ReadState::Body(BodyFraming::Chunked(decoder)) => {
                    let progress = decoder.feed(rest, &mut self.body)?;
                    consumed += progress.consumed;
                    if !progress.done {
                        return Ok(Progress::pending(consumed));
                    }
                    let trailers = decoder.take_trailers();
                    let message = self.finish_message(trailers)?;
                    return Ok(Progress::with(consumed, ReaderEvent::Complete(message)));
                }
                ReadState::Body(BodyFraming::UntilClose) => {
                    self.body.push_bytes(rest);
                    consumed += rest.len();
                    return Ok(Progress::pending(consumed));
                }
            }
        }
    }

    /// Signals that the peer closed the connection.
    ///
    /// Completes a close-delimited body; returns `None` when no message was in progress.
    pub fn close(&mut self) -> Result<Option<HttpMessage>, HttpParseError> {
        match self.state {
            ReadState::Body(BodyFraming::UntilClose) => {
                self.finish_message(Headers::new()).map(Some)
            }
            ReadState::StartLine if self.line.is_empty() => Ok(None),
            _ => Err(HttpParseError::UnexpectedEof),
        }
    }

    fn on_head_line(&mut self, line: &[u8]) -> Result<Option<ReaderEvent>, HttpParseError> {
        if matches!(self.state, ReadState::StartLine) {
            if line.is_empty() {
                // Stray CRLF between messages.
                self.head_used = 0;
                return Ok(None);
            }
            self.start_line = Some(match self.kind {
                MessageKind::Request => StartLine::Request(parse_request_line(line)?),
                MessageKind::Response => StartLine::Response(parse_status_line(line)?),
            });
            self.state = ReadState::Headers;
            return Ok(None);
        }

        if line.is_empty() {
            return self.finish_head().map(Some);
        }

        if is_folded(line) {
            let last = self.headers.last_mut().ok_or_else(|| {
                HttpParseError::InvalidHeader(String::from_utf8_lossy(line).into_owned())
            })?;
            let mut joined = last.value.to_vec();
            joined.push(b' ');
            joined.extend_from_slice(trim_ows(line));
            last.value = joined.into();
            return Ok(None);
        }

        self.headers.push_field(parse_header_line(line)?);
        Ok(None)
    }

    fn finish_head(&mut self) -> Result<ReaderEvent, HttpParseError> {
        let framing = match &self.start_line {
            Some(StartLine::Response(status)) => {
                let status = status.status;
                if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
                    self.reset();
                    return Ok(ReaderEvent::Interim(status));
                }
                self.response_framing(status)?
            }
            Some(StartLine::Request(_)) => self.request_framing()?,
            None => return Err(HttpParseError::InvalidStartLine(String::new())),
        };

        if let BodyFraming::Fixed { remaining } = framing {
            self.body.expect_len(remaining);
        }
        self.state = ReadState::Body(framing);
        Ok(ReaderEvent::HeadComplete)
    }

    fn request_framing(&mut self) -> Result<BodyFraming, HttpParseError> {
        if self.headers.contains("transfer-encoding") {
            if !self.headers.is_chunked() {
                let value = self.headers.get("transfer-encoding").unwrap_or_default();
                return Err(HttpParseError::InvalidHeader(format!(
                    "Transfer-Encoding: {value}"
                )));
            }
            self.strip_conflicting_length();
            return Ok(BodyFraming::Chunked(ChunkedBodyDecoder::new(
                self.max_head_bytes,
            )));
        }
        let remaining = self.headers.content_length()?.unwrap_or(0);
        Ok(BodyFraming::Fixed { remaining })
    }

    fn response_framing(&mut self, status: StatusCode) -> Result<BodyFraming, HttpParseError> {
        let method = self.pending_methods.front();
        let bodiless = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || method == Some(&Method::HEAD)
            || (method == Some(&Method::CONNECT) && status.is_success());
        if bodiless {
            return Ok(BodyFraming::Fixed { remaining: 0 });
        }

        if self.headers.contains("transfer-encoding") {
            if self.headers.is_chunked() {
                self.strip_conflicting_length();
                return Ok(BodyFraming::Chunked(ChunkedBodyDecoder::new(
                    self.max_head_bytes,
                )));
            }
            return Ok(BodyFraming::UntilClose);
        }
        match self.headers.content_length()? {
            Some(remaining) => Ok(BodyFraming::Fixed { remaining }),
            None => Ok(BodyFraming::UntilClose),
        }
    }

    // Transfer-Encoding overrides Content-Length; the length must not reach the next hop.
    fn strip_conflicting_length(&mut self) {
        let removed = self.headers.remove("content-length");
        if removed > 0 {
            debug!(removed, "dropping Content-Length alongside chunked Transfer-Encoding");
        }
    }

    fn finish_message(&mut self, trailers: Headers) -> Result<HttpMessage, HttpParseError> {
        let start_line = self
            .start_line
            .take()
            .ok_or_else(|| HttpParseError::InvalidStartLine(String::new()))?;
        if matches!(start_line, StartLine::Response(_)) {
            self.pending_methods.pop_front();
        }
        let (body, body_len, body_truncated) = self.body.take();
        let message = HttpMessage {
            start_line,
            headers: std::mem::take(&mut self.headers),
            body,
            body_len,
            body_truncated,
            trailers,
        };
        self.reset();
        Ok(message)
    }

    fn reset(&mut self) {
        self.state = ReadState::StartLine;
        self.line.clear();
        self.head_used = 0;
        self.start_line = None;
        self.headers = Headers::new();
        self.body = BodyBuffer::with_limit(self.capture_limit);
    }
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, HttpParseError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpParseError::InvalidStartLine(String::from_utf8_lossy(line).into()))?;
    let invalid = || HttpParseError::InvalidStartLine(text.to_string());

    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if target.is_empty() {
        return Err(invalid());
    }
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| invalid())?;

    Ok(RequestLine {
        method,
        target: target.to_string(),
        version: parse_version(version)?,
    })
}

fn parse_status_line(line: &[u8]) -> Result<StatusLine, HttpParseError> {
    let text = String::from_utf8_lossy(line);
    let invalid = || HttpParseError::InvalidStartLine(text.to_string());

    let mut parts = text.splitn(3, ' ');
    let version = parts.next().ok_or_else(invalid)?;
    let code = parts.next().ok_or_else(invalid)?;
    let reason = parts.next().unwrap_or_default();

    let version = parse_version(version)?;
    if code.len() != 3 {
        return Err(invalid());
    }
    let status = StatusCode::from_bytes(code.as_bytes()).map_err(|_| invalid())?;

    Ok(StatusLine {
        version,
        status,
        reason: reason.to_string(),
    })
}

fn parse_version(raw: &str) -> Result<Version, HttpParseError> {
    match raw {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other if other.starts_with("HTTP/") => {
            Err(HttpParseError::UnsupportedVersion(other.to_string()))
        }
        other => Err(HttpParseError::InvalidStartLine(other.to_string())),
    }
}
