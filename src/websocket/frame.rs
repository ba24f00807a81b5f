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

use super::WebSocketError;
use crate::http::BodyBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Self {
        match raw & 0x0f {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xa => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xa,
            Opcode::Reserved(raw) => raw & 0x0f,
        }
    }

    /// Opcodes 0x8..=0xF are control frames.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    pub fn label(self) -> &'static str {
        match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
            Opcode::Reserved(_) => "reserved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketFrame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload_len: u64,
    /// Unmasked payload; empty when it overflowed the capture limit.
    pub payload: Bytes,
    pub payload_truncated: bool,
}

impl WebSocketFrame {
    /// Per-message-deflate marks compressed messages with RSV1 on the first frame.
    pub fn is_compressed(&self) -> bool {
        self.rsv1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStatus {
    Complete { frame: WebSocketFrame, consumed: usize },
    NeedMore { consumed: usize },
}

#[derive(Debug, Clone, Copy)]
struct FrameHead {
    fin: bool,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: u64,
}

#[derive(Debug)]
enum DecodeState {
    Head,
    Payload { head: FrameHead, received: u64 },
}

/// Incremental frame parser for one direction of a WebSocket connection.
#[derive(Debug)]
pub struct WebSocketFrameDecoder {
    capture_limit: usize,
    state: DecodeState,
    head_buf: Vec<u8>,
    payload: BodyBuffer,
}

impl WebSocketFrameDecoder {
    pub fn new(capture_limit: usize) -> Self {
        Self {
            capture_limit,
            state: DecodeState::Head,
            head_buf: Vec::with_capacity(14),
            payload: BodyBuffer::with_limit(capture_limit),
        }
    }

    /// Consumes bytes until one frame completes or the input runs out.
    ///
    /// On `Complete` the bytes after `consumed` belong to the next frame.
    pub fn decode(&mut self, input: &[u8]) -> Result<DecodeStatus, WebSocketError> {
        let mut consumed = 0;

        loop {
            match &mut self.state {
                DecodeState::Head => {
                    let needed = head_len(&self.head_buf);
                    let take = needed
                        .saturating_sub(self.head_buf.len())
                        .min(input.len() - consumed);
                    self.head_buf
                        .extend_from_slice(&input[consumed..consumed + take]);
                    consumed += take;

                    // The first two bytes decide how long the head really is.
                    if head_len(&self.head_buf) > self.head_buf.len() {
                        if consumed == input.len() {
                            return Ok(DecodeStatus::NeedMore { consumed });
                        }
                        continue;
                    }

                    let head = parse_head(&self.head_buf)?;
                    self.head_buf.clear();
                    self.payload = BodyBuffer::with_limit(self.capture_limit);
                    self.payload.expect_len(head.payload_len);
                    self.state = DecodeState::Payload { head, received: 0 };
                }
                DecodeState::Payload { head, received } => {
                    let remaining = head.payload_len - *received;
                    let take = remaining.min((input.len() - consumed) as u64) as usize;
                    let chunk = &input[consumed..consumed + take];

                    match head.mask {
                        Some(key) if !self.payload.is_truncated() => {
                            let offset = (*received % 4) as usize;
                            let unmasked: Vec<u8> = chunk
                                .iter()
                                .enumerate()
                                .map(|(i, byte)| byte ^ key[(offset + i) % 4])
                                .collect();
                            self.payload.push_bytes(&unmasked);
                        }
                        _ => self.payload.push_bytes(chunk),
                    }
                    consumed += take;
                    *received += take as u64;

                    if *received < head.payload_len {
                        return Ok(DecodeStatus::NeedMore { consumed });
                    }

                    let head = *head;
                    self.state = DecodeState::Head;
                    let frame = self.finish_frame(head);
                    return Ok(DecodeStatus::Complete { frame, consumed });
                }
            }
        }
    }

    fn finish_frame(&mut self, head: FrameHead) -> WebSocketFrame {
        let (payload, _, payload_truncated) = self.payload.take();
        WebSocketFrame {
            fin: head.fin,
            rsv1: head.rsv1,
            rsv2: head.rsv2,
            rsv3: head.rsv3,
            opcode: head.opcode,
            mask: head.mask,
            payload_len: head.payload_len,
            payload,
            payload_truncated,
        }
    }
}

/// Total head length implied by what has been buffered so far.
fn head_len(buf: &[u8]) -> usize {
    if buf.len() < 2 {
        return 2;
    }
    let masked = buf[1] & 0x80 != 0;
    let ext = match buf[1] & 0x7f {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    2 + ext + if masked { 4 } else { 0 }
}

fn parse_head(buf: &[u8]) -> Result<FrameHead, WebSocketError> {
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u8(buf[0]);
    let masked = buf[1] & 0x80 != 0;

    let (payload_len, mut pos) = match buf[1] & 0x7f {
        126 => (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4),
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(WebSocketError::LengthOverflow);
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(WebSocketError::FragmentedControlFrame(opcode));
        }
        if payload_len > 125 {
            return Err(WebSocketError::ControlFrameTooLong {
                opcode,
                len: payload_len,
            });
        }
    }

    let mask = if masked {
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };
    debug_assert_eq!(pos, buf.len());

    Ok(FrameHead {
        fin,
        rsv1: buf[0] & 0x40 != 0,
        rsv2: buf[0] & 0x20 != 0,
        rsv3: buf[0] & 0x10 != 0,
        opcode,
        mask,
        payload_len,
    })
}
