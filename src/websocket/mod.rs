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

//! RFC 6455 framing for traffic that upgraded out of HTTP/1.1.
//!
//! [`WebSocketFrameDecoder`] turns raw bytes into frames, one direction at a time, and
//! [`WebSocketMessageAssembler`] folds fragmented data frames back into messages.

pub mod frame;
pub mod message;

pub use frame::{DecodeStatus, Opcode, WebSocketFrame, WebSocketFrameDecoder};
pub use message::{WebSocketMessage, WebSocketMessageAssembler};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WebSocketError {
    #[error("64-bit payload length has the most significant bit set")]
    LengthOverflow,

    #[error("control frame {0:?} is fragmented")]
    FragmentedControlFrame(Opcode),

    #[error("control frame {opcode:?} carries {len} bytes (max 125)")]
    ControlFrameTooLong { opcode: Opcode, len: u64 },

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new {0:?} frame while a fragmented message is still open")]
    MessageInProgress(Opcode),

    #[error("frame is not final and cannot form a message on its own")]
    NonFinalFrame,

    #[error("continuation frame cannot start a message")]
    ContinuationFrame,
}

/// Whether a completed HTTP exchange switches the connection to WebSocket framing.
pub fn is_upgrade(request: &crate::http::Headers, response: &crate::http::HttpMessage) -> bool {
    let switched = response
        .status_line()
        .map(|line| line.status == http::StatusCode::SWITCHING_PROTOCOLS)
        .unwrap_or(false);
    switched
        && response.headers.has_token("upgrade", "websocket")
        && request.has_token("upgrade", "websocket")
}
