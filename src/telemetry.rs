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

use serde_json::{json, Value};

use crate::{
    config::{TelemetryConfig, TelemetryMode},
    events::{EventSubscriber, HttpSession, ProxyEvent},
    http::{message::version_label, HttpMessage, StartLine},
    websocket::WebSocketMessage,
};

/// Built-in subscriber that renders every event as a log line or a JSON document.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: &TelemetryConfig) -> Self {
        Self {
            mode: cfg.mode.clone(),
        }
    }

    /// The JSON document emitted for `event` in `json` mode.
    pub fn render(event: &ProxyEvent) -> Value {
        json!({
            "event": event.name(),
            "connection_id": event.connection_id(),
            "payload": payload(event),
        })
    }
}

impl EventSubscriber for TelemetrySink {
    fn name(&self) -> &str {
        "telemetry"
    }

    fn on_event(&self, event: &ProxyEvent) -> anyhow::Result<()> {
        match self.mode {
            TelemetryMode::Stdout => {
                let connection_id = event.connection_id();
                tracing::info!(%connection_id, event = event.name(), payload = %payload(event));
            }
            TelemetryMode::Json => {
                println!("{}", Self::render(event));
            }
        }
        Ok(())
    }
}

fn payload(event: &ProxyEvent) -> Value {
    match event {
        ProxyEvent::ConnectionAdded(info) => json!({
            "client": info.client_addr.to_string(),
        }),
        ProxyEvent::RequestSent(session) | ProxyEvent::ResponseSent(session) => {
            session_payload(session)
        }
        ProxyEvent::ClientWebSocketMessageSent { message, .. }
        | ProxyEvent::ServerWebSocketMessageSent { message, .. } => websocket_payload(message),
        ProxyEvent::Disposing { .. } | ProxyEvent::ConnectionRemoved { .. } => Value::Null,
    }
}

fn session_payload(session: &HttpSession) -> Value {
    json!({
        "session_id": session.id,
        "target": session.target,
        "https": session.is_https,
        "stream_id": session.stream_id,
        "request": message_summary(&session.request),
        "response": session.response.as_ref().map(message_summary),
    })
}

fn message_summary(message: &HttpMessage) -> Value {
    let start = match &message.start_line {
        StartLine::Request(line) => json!({
            "method": line.method.as_str(),
            "target": line.target,
            "version": version_label(line.version),
        }),
        StartLine::Response(line) => json!({
            "status": line.status.as_u16(),
            "reason": line.reason,
            "version": version_label(line.version),
        }),
    };
    json!({
        "start": start,
        "headers": message.headers.len(),
        "body_len": message.body_len,
        "body_truncated": message.body_truncated,
    })
}

fn websocket_payload(message: &WebSocketMessage) -> Value {
    json!({
        "session_id": message.session_id,
        "opcode": message.opcode.label(),
        "len": message.payload_len,
        "compressed": message.compressed,
        "truncated": message.payload_truncated,
    })
}
