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

//! Passive HTTP/2 observer for decrypted tunnels.
//!
//! Bytes are relayed untouched; this side only parses the frame layer, keeps one HPACK
//! decoder per direction in step with the peers, and turns each stream into a
//! request/response pair for event subscribers.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
};

use http::{Method, StatusCode, Version};
use thiserror::Error;
use uuid::Uuid;

use super::relay::TrafficObserver;
use crate::{
    events::{EventHub, HttpSession, ProxyEvent, SessionProtocol},
    hpack::HpackDecoder,
    http::{BodyBuffer, HeaderField, Headers, HttpMessage, RequestLine, StartLine, StatusLine},
    utils::ProxyResult,
};

pub const CLIENT_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_PAYLOAD: usize = (1 << 24) - 1;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_RST_STREAM: u8 = 0x3;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PUSH_PROMISE: u8 = 0x5;
const FRAME_CONTINUATION: u8 = 0x9;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const FLAG_PADDED: u8 = 0x8;
const FLAG_PRIORITY: u8 = 0x20;

const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Http2FrameError {
    #[error("client did not send the HTTP/2 connection preface")]
    InvalidPreface,

    #[error("frame payload of {0} bytes exceeds the protocol maximum")]
    FrameTooLarge(usize),

    #[error("padding longer than the frame payload")]
    InvalidPadding,

    #[error("{frame} frame is too short")]
    ShortFrame { frame: &'static str },

    #[error("CONTINUATION for stream {0} without an open header block")]
    UnexpectedContinuation(u32),

    #[error("expected CONTINUATION for stream {expected}, got frame type {frame_type:#x}")]
    ExpectedContinuation { expected: u32, frame_type: u8 },

    #[error("header block is missing {0}")]
    MissingPseudoHeader(&'static str),

    #[error("invalid pseudo-header value for {0}")]
    InvalidPseudoHeader(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// Header block spread over HEADERS/PUSH_PROMISE plus CONTINUATION frames.
#[derive(Debug)]
struct OpenBlock {
    stream_id: u32,
    promised: Option<u32>,
    end_stream: bool,
    fragment: Vec<u8>,
}

#[derive(Debug)]
struct Direction {
    buf: Vec<u8>,
    decoder: HpackDecoder,
    awaiting_preface: bool,
    open_block: Option<OpenBlock>,
    /// SETTINGS this side sent that the other side has not acknowledged yet, reduced to
    /// the header table size each one carried.
    unacked_settings: VecDeque<Option<usize>>,
}

impl Direction {
    fn new(awaiting_preface: bool) -> Self {
        Self {
            buf: Vec::new(),
            decoder: HpackDecoder::new(),
            awaiting_preface,
            open_block: None,
            unacked_settings: VecDeque::new(),
        }
    }
}

#[derive(Debug)]
struct PartialMessage {
    start_line: Option<StartLine>,
    headers: Headers,
    trailers: Headers,
    body: BodyBuffer,
}

impl PartialMessage {
    fn new(capture_limit: usize) -> Self {
        Self {
            start_line: None,
            headers: Headers::new(),
            trailers: Headers::new(),
            body: BodyBuffer::with_limit(capture_limit),
        }
    }

    fn finish(&mut self) -> Option<HttpMessage> {
        let start_line = self.start_line.take()?;
        let (body, body_len, body_truncated) = self.body.take();
        Some(HttpMessage {
            start_line,
            headers: std::mem::take(&mut self.headers),
            body,
            body_len,
            body_truncated,
            trailers: std::mem::take(&mut self.trailers),
        })
    }
}

#[derive(Debug)]
struct StreamState {
    session_id: Uuid,
    request: PartialMessage,
    response: PartialMessage,
    sent_request: Option<HttpMessage>,
}

/// Tracks one decrypted HTTP/2 connection in both directions.
pub struct Http2Observer {
    hub: Arc<EventHub>,
    connection_id: Uuid,
    client_addr: SocketAddr,
    target: String,
    capture_limit: usize,
    client: Direction,
    server: Direction,
    streams: HashMap<u32, StreamState>,
}

impl Http2Observer {
    pub fn new(
        hub: Arc<EventHub>,
        connection_id: Uuid,
        client_addr: SocketAddr,
        target: String,
        capture_limit: usize,
    ) -> Self {
        Self {
            hub,
            connection_id,
            client_addr,
            target,
            capture_limit,
            client: Direction::new(true),
            server: Direction::new(false),
            streams: HashMap::new(),
        }
    }

    /// Streams with a request or response still in flight.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    fn direction(&mut self, side: Side) -> &mut Direction {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn ingest(&mut self, side: Side, bytes: &[u8]) -> ProxyResult<()> {
        let direction = self.direction(side);
        direction.buf.extend_from_slice(bytes);

        if direction.awaiting_preface {
            let seen = direction.buf.len().min(CLIENT_PREFACE.len());
            if direction.buf[..seen] != CLIENT_PREFACE[..seen] {
                return Err(Http2FrameError::InvalidPreface.into());
            }
            if seen < CLIENT_PREFACE.len() {
                return Ok(());
            }
            direction.buf.drain(..CLIENT_PREFACE.len());
            direction.awaiting_preface = false;
        }

        let buf = std::mem::take(&mut self.direction(side).buf);
        let mut cursor = 0;
        let outcome = loop {
            let rest = &buf[cursor..];
            if rest.len() < FRAME_HEADER_LEN {
                break Ok(());
            }
            let len = (usize::from(rest[0]) << 16) | (usize::from(rest[1]) << 8) | usize::from(rest[2]);
            if len > MAX_FRAME_PAYLOAD {
                break Err(Http2FrameError::FrameTooLarge(len).into());
            }
            if rest.len() < FRAME_HEADER_LEN + len {
                break Ok(());
            }
            let frame_type = rest[3];
            let flags = rest[4];
            let stream_id = u32::from_be_bytes([rest[5] & 0x7f, rest[6], rest[7], rest[8]]);
            let payload = &rest[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len];
            cursor += FRAME_HEADER_LEN + len;

            if let Err(err) = self.on_frame(side, frame_type, flags, stream_id, payload) {
                break Err(err);
            }
        };

        let direction = self.direction(side);
        direction.buf = buf;
        direction.buf.drain(..cursor);
        outcome
    }

    fn on_frame(
        &mut self,
        side: Side,
        frame_type: u8,
        flags: u8,
        stream_id: u32,
        payload: &[u8],
    ) -> ProxyResult<()> {
        if let Some(open) = &self.direction(side).open_block {
            if frame_type != FRAME_CONTINUATION || open.stream_id != stream_id {
                return Err(Http2FrameError::ExpectedContinuation {
                    expected: open.stream_id,
                    frame_type,
                }
                .into());
            }
        }

        match frame_type {
            FRAME_DATA => {
                let data = strip_padding(payload, flags, "DATA")?;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    let partial = match side {
                        Side::Client => &mut stream.request,
                        Side::Server => &mut stream.response,
                    };
                    partial.body.push_bytes(data);
                }
                if flags & FLAG_END_STREAM != 0 {
                    self.end_stream(side, stream_id);
                }
            }
            FRAME_HEADERS => {
                let mut fragment = strip_padding(payload, flags, "HEADERS")?;
                if flags & FLAG_PRIORITY != 0 {
                    fragment = fragment
                        .get(5..)
                        .ok_or(Http2FrameError::ShortFrame { frame: "HEADERS" })?;
                }
                self.open_block(side, flags, stream_id, None, fragment)?;
            }
            FRAME_PUSH_PROMISE => {
                let body = strip_padding(payload, flags, "PUSH_PROMISE")?;
                if body.len() < 4 {
                    return Err(Http2FrameError::ShortFrame {
                        frame: "PUSH_PROMISE",
                    }
                    .into());
                }
                let promised = u32::from_be_bytes([body[0] & 0x7f, body[1], body[2], body[3]]);
                // END_STREAM is not defined for PUSH_PROMISE.
                self.open_block(side, flags & !FLAG_END_STREAM, stream_id, Some(promised), &body[4..])?;
            }
            FRAME_CONTINUATION => {
                let direction = self.direction(side);
                let mut open = direction
                    .open_block
                    .take()
                    .ok_or(Http2FrameError::UnexpectedContinuation(stream_id))?;
                open.fragment.extend_from_slice(payload);
                if flags & FLAG_END_HEADERS == 0 {
                    direction.open_block = Some(open);
                } else {
                    self.finish_block(side, open)?;
                }
            }
            FRAME_SETTINGS if flags & FLAG_ACK == 0 => {
                let table_size = payload
                    .chunks_exact(6)
                    .filter(|entry| {
                        u16::from_be_bytes([entry[0], entry[1]]) == SETTINGS_HEADER_TABLE_SIZE
                    })
                    .map(|entry| {
                        u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]) as usize
                    })
                    .last();
                self.direction(side).unacked_settings.push_back(table_size);
            }
            FRAME_SETTINGS => {
                // The ACK means this side now encodes under the other side's oldest
                // outstanding settings; blocks it sent before then used the old limit.
                let (acking, settled) = match side {
                    Side::Client => (&mut self.client, &mut self.server),
                    Side::Server => (&mut self.server, &mut self.client),
                };
                if let Some(Some(table_size)) = settled.unacked_settings.pop_front() {
                    acking.decoder.set_max_allowed(table_size);
                }
            }
            FRAME_RST_STREAM => {
                self.streams.remove(&stream_id);
            }
            _ => {}
        }
        Ok(())
    }

    fn open_block(
        &mut self,
        side: Side,
        flags: u8,
        stream_id: u32,
        promised: Option<u32>,
        fragment: &[u8],
    ) -> ProxyResult<()> {
        let open = OpenBlock {
            stream_id,
            promised,
            end_stream: flags & FLAG_END_STREAM != 0,
            fragment: fragment.to_vec(),
        };
        if flags & FLAG_END_HEADERS == 0 {
            self.direction(side).open_block = Some(open);
            Ok(())
        } else {
            self.finish_block(side, open)
        }
    }

    fn finish_block(&mut self, side: Side, open: OpenBlock) -> ProxyResult<()> {
        let fields = self.direction(side).decoder.decode(&open.fragment)?;
        let capture_limit = self.capture_limit;

        if let Some(promised) = open.promised {
            let (start_line, headers) = request_head(fields)?;
            let mut stream = new_stream(capture_limit);
            stream.sent_request = Some(HttpMessage {
                start_line,
                headers,
                body: Default::default(),
                body_len: 0,
                body_truncated: false,
                trailers: Headers::new(),
            });
            self.streams.insert(promised, stream);
            return Ok(());
        }

        let stream = self
            .streams
            .entry(open.stream_id)
            .or_insert_with(|| new_stream(capture_limit));
        let partial = match side {
            Side::Client => &mut stream.request,
            Side::Server => &mut stream.response,
        };

        if partial.start_line.is_some() {
            partial.trailers = fields.into_iter().collect();
        } else {
            match side {
                Side::Client => {
                    let (start_line, headers) = request_head(fields)?;
                    partial.start_line = Some(start_line);
                    partial.headers = headers;
                }
                Side::Server => {
                    let (status, headers) = response_head(fields)?;
                    if status.is_informational() {
                        tracing::trace!(stream_id = open.stream_id, %status, "interim HTTP/2 response");
                        return Ok(());
                    }
                    partial.start_line = Some(StartLine::Response(StatusLine {
                        version: Version::HTTP_2,
                        status,
                        reason: status.canonical_reason().unwrap_or_default().to_string(),
                    }));
                    partial.headers = headers;
                }
            }
        }

        if open.end_stream {
            self.end_stream(side, open.stream_id);
        }
        Ok(())
    }

    fn end_stream(&mut self, side: Side, stream_id: u32) {
        match side {
            Side::Client => {
                let Some(stream) = self.streams.get_mut(&stream_id) else {
                    return;
                };
                let Some(request) = stream.request.finish() else {
                    return;
                };
                stream.sent_request = Some(request.clone());
                let session_id = stream.session_id;
                let session = self.session(session_id, stream_id, request, None);
                self.hub.publish(ProxyEvent::RequestSent(Arc::new(session)));
            }
            Side::Server => {
                let Some(mut stream) = self.streams.remove(&stream_id) else {
                    return;
                };
                let (Some(request), Some(response)) =
                    (stream.sent_request.take(), stream.response.finish())
                else {
                    tracing::debug!(stream_id, "HTTP/2 stream ended without a complete exchange");
                    return;
                };
                let session = self.session(stream.session_id, stream_id, request, Some(response));
                self.hub.publish(ProxyEvent::ResponseSent(Arc::new(session)));
            }
        }
    }

    fn session(
        &self,
        id: Uuid,
        stream_id: u32,
        request: HttpMessage,
        response: Option<HttpMessage>,
    ) -> HttpSession {
        HttpSession {
            id,
            connection_id: self.connection_id,
            client_addr: self.client_addr,
            target: self.target.clone(),
            is_https: true,
            protocol: SessionProtocol::Http2,
            stream_id: Some(stream_id),
            request,
            response,
        }
    }
}

impl TrafficObserver for Http2Observer {
    fn on_client_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        self.ingest(Side::Client, bytes)
    }

    fn on_server_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        self.ingest(Side::Server, bytes)
    }
}

fn new_stream(capture_limit: usize) -> StreamState {
    StreamState {
        session_id: Uuid::new_v4(),
        request: PartialMessage::new(capture_limit),
        response: PartialMessage::new(capture_limit),
        sent_request: None,
    }
}

fn strip_padding<'a>(
    payload: &'a [u8],
    flags: u8,
    frame: &'static str,
) -> Result<&'a [u8], Http2FrameError> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload
        .split_first()
        .ok_or(Http2FrameError::ShortFrame { frame })?;
    let pad_len = usize::from(pad_len);
    if pad_len > rest.len() {
        return Err(Http2FrameError::InvalidPadding);
    }
    Ok(&rest[..rest.len() - pad_len])
}

/// Splits pseudo-headers off a decoded block.
fn split_pseudo(fields: Vec<HeaderField>) -> (HashMap<String, String>, Headers) {
    let mut pseudo = HashMap::new();
    let mut headers = Headers::new();
    for field in fields {
        if field.name.starts_with(':') {
            let value = String::from_utf8_lossy(&field.value).into_owned();
            pseudo.entry(field.name).or_insert(value);
        } else {
            headers.push_field(field);
        }
    }
    (pseudo, headers)
}

fn request_head(fields: Vec<HeaderField>) -> Result<(StartLine, Headers), Http2FrameError> {
    let (mut pseudo, mut headers) = split_pseudo(fields);
    let method = pseudo
        .remove(":method")
        .ok_or(Http2FrameError::MissingPseudoHeader(":method"))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Http2FrameError::InvalidPseudoHeader(":method"))?;
    let authority = pseudo.remove(":authority");

    let target = match pseudo.remove(":path") {
        Some(path) => path,
        None if method == Method::CONNECT => authority
            .clone()
            .ok_or(Http2FrameError::MissingPseudoHeader(":authority"))?,
        None => return Err(Http2FrameError::MissingPseudoHeader(":path")),
    };

    if let Some(authority) = authority {
        if !headers.contains("host") {
            headers = std::iter::once(HeaderField::new("host", authority))
                .chain(headers.iter().cloned())
                .collect();
        }
    }

    Ok((
        StartLine::Request(RequestLine {
            method,
            target,
            version: Version::HTTP_2,
        }),
        headers,
    ))
}

fn response_head(fields: Vec<HeaderField>) -> Result<(StatusCode, Headers), Http2FrameError> {
    let (mut pseudo, headers) = split_pseudo(fields);
    let status = pseudo
        .remove(":status")
        .ok_or(Http2FrameError::MissingPseudoHeader(":status"))?;
    let status = StatusCode::from_bytes(status.as_bytes())
        .map_err(|_| Http2FrameError::InvalidPseudoHeader(":status"))?;
    Ok((status, headers))
}
