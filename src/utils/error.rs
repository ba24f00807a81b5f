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

use thiserror::Error;

use crate::{
    hpack::HpackError, http::HttpParseError, proxy::http2::Http2FrameError,
    websocket::WebSocketError,
};

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed HTTP message: {0}")]
    HttpParse(#[from] HttpParseError),

    #[error("HPACK decoding failed: {0}")]
    Hpack(#[from] HpackError),

    #[error("HTTP/2 framing error: {0}")]
    Http2(#[from] Http2FrameError),

    #[error("WebSocket protocol error: {0}")]
    WebSocket(#[from] WebSocketError),

    #[error("certificate error: {0}")]
    Certificate(String),

    /// Raised at startup, before the listener accepts anything.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// Errors caused by the peer speaking a broken protocol (as opposed to I/O trouble).
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ProxyError::HttpParse(_)
                | ProxyError::Hpack(_)
                | ProxyError::Http2(_)
                | ProxyError::WebSocket(_)
        )
    }
}
