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
use uuid::Uuid;

use super::{Opcode, WebSocketError, WebSocketFrame};
use crate::http::BodyBuffer;

/// A complete WebSocket message: one unfragmented data frame, one control frame, or a
/// whole fragmented sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage {
    pub id: Uuid,
    /// Id of the HTTP session whose upgrade opened this WebSocket.
    pub session_id: Uuid,
    pub opcode: Opcode,
    pub payload: Bytes,
    pub payload_len: u64,
    pub payload_truncated: bool,
    pub compressed: bool,
}

impl WebSocketMessage {
    /// Builds a message from a single self-contained frame.
    pub fn from_frame(frame: WebSocketFrame, session_id: Uuid) -> Result<Self, WebSocketError> {
        if frame.opcode == Opcode::Continuation {
            return Err(WebSocketError::ContinuationFrame);
        }
        if !frame.fin {
            return Err(WebSocketError::NonFinalFrame);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            session_id,
            opcode: frame.opcode,
            payload: frame.payload,
            payload_len: frame.payload_len,
            payload_truncated: frame.payload_truncated,
            compressed: frame.rsv1,
        })
    }

    pub fn text(&self) -> Option<&str> {
        match self.opcode {
            Opcode::Text if !self.compressed => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Pending {
    opcode: Opcode,
    compressed: bool,
    payload: BodyBuffer,
}

/// Reassembles fragmented messages for one direction of a WebSocket connection.
///
/// Control frames may be interleaved with the fragments of a data message and pass
/// straight through.
#[derive(Debug)]
pub struct WebSocketMessageAssembler {
    session_id: Uuid,
    capture_limit: usize,
    pending: Option<Pending>,
}

impl WebSocketMessageAssembler {
    pub fn new(session_id: Uuid, capture_limit: usize) -> Self {
        Self {
            session_id,
            capture_limit,
            pending: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns a message when `frame` completes one, `None` while fragments accumulate.
    pub fn try_create_or_add(
        &mut self,
        frame: WebSocketFrame,
    ) -> Result<Option<WebSocketMessage>, WebSocketError> {
        if frame.opcode.is_control() {
            return WebSocketMessage::from_frame(frame, self.session_id).map(Some);
        }

        if frame.opcode == Opcode::Continuation {
            let pending = self
                .pending
                .as_mut()
                .ok_or(WebSocketError::UnexpectedContinuation)?;
            append(&mut pending.payload, &frame);
            if !frame.fin {
                return Ok(None);
            }
            return Ok(self.pending.take().map(|done| self.complete(done)));
        }

        if self.pending.is_some() {
            return Err(WebSocketError::MessageInProgress(frame.opcode));
        }
        if frame.fin {
            return WebSocketMessage::from_frame(frame, self.session_id).map(Some);
        }

        let mut payload = BodyBuffer::with_limit(self.capture_limit);
        append(&mut payload, &frame);
        self.pending = Some(Pending {
            opcode: frame.opcode,
            compressed: frame.rsv1,
            payload,
        });
        Ok(None)
    }

    fn complete(&self, mut done: Pending) -> WebSocketMessage {
        let (payload, payload_len, payload_truncated) = done.payload.take();
        WebSocketMessage {
            id: Uuid::new_v4(),
            session_id: self.session_id,
            opcode: done.opcode,
            payload,
            payload_len,
            payload_truncated,
            compressed: done.compressed,
        }
    }
}

fn append(buffer: &mut BodyBuffer, frame: &WebSocketFrame) {
    if frame.payload_truncated {
        buffer.skip(frame.payload_len);
    } else {
        buffer.push_bytes(&frame.payload);
    }
}
