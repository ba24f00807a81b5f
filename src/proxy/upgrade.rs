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

use std::sync::Arc;

use uuid::Uuid;

use super::relay::TrafficObserver;
use crate::{
    events::{EventHub, ProxyEvent},
    utils::ProxyResult,
    websocket::{DecodeStatus, WebSocketFrameDecoder, WebSocketMessageAssembler},
};

struct Lane {
    decoder: WebSocketFrameDecoder,
    assembler: WebSocketMessageAssembler,
}

impl Lane {
    fn new(session_id: Uuid, capture_limit: usize) -> Self {
        Self {
            decoder: WebSocketFrameDecoder::new(capture_limit),
            assembler: WebSocketMessageAssembler::new(session_id, capture_limit),
        }
    }
}

/// Decodes both directions of an upgraded connection into [`ProxyEvent`]s.
pub struct WebSocketObserver {
    hub: Arc<EventHub>,
    connection_id: Uuid,
    client: Lane,
    server: Lane,
}

impl WebSocketObserver {
    /// `session_id` is the HTTP exchange that performed the upgrade.
    pub fn new(hub: Arc<EventHub>, connection_id: Uuid, session_id: Uuid, capture_limit: usize) -> Self {
        Self {
            hub,
            connection_id,
            client: Lane::new(session_id, capture_limit),
            server: Lane::new(session_id, capture_limit),
        }
    }
}

impl TrafficObserver for WebSocketObserver {
    fn on_client_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        let connection_id = self.connection_id;
        drain(&mut self.client, bytes, |message| {
            self.hub.publish(ProxyEvent::ClientWebSocketMessageSent {
                connection_id,
                message: Arc::new(message),
            })
        })
    }

    fn on_server_bytes(&mut self, bytes: &[u8]) -> ProxyResult<()> {
        let connection_id = self.connection_id;
        drain(&mut self.server, bytes, |message| {
            self.hub.publish(ProxyEvent::ServerWebSocketMessageSent {
                connection_id,
                message: Arc::new(message),
            })
        })
    }
}

fn drain(
    lane: &mut Lane,
    mut input: &[u8],
    mut emit: impl FnMut(crate::websocket::WebSocketMessage),
) -> ProxyResult<()> {
    loop {
        match lane.decoder.decode(input)? {
            DecodeStatus::Complete { frame, consumed } => {
                input = &input[consumed..];
                if let Some(message) = lane.assembler.try_create_or_add(frame)? {
                    emit(message);
                }
            }
            DecodeStatus::NeedMore { .. } => return Ok(()),
        }
    }
}
