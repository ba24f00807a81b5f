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

//! Domain events published by live connections.
//!
//! Subscribers run synchronously on the publishing connection's task, in registration
//! order. A subscriber that errors or panics is isolated: the failure is reported on the
//! fatal channel and the connection carries on.

use std::{
    any::Any,
    net::SocketAddr,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::SystemTime,
};

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::error;
use uuid::Uuid;

use crate::{http::HttpMessage, websocket::WebSocketMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProtocol {
    Http1,
    Http2,
}

/// One request/response exchange.
#[derive(Debug, Clone)]
pub struct HttpSession {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub client_addr: SocketAddr,
    /// `host:port` of the origin.
    pub target: String,
    pub is_https: bool,
    pub protocol: SessionProtocol,
    /// HTTP/2 stream id; `None` for HTTP/1.x.
    pub stream_id: Option<u32>,
    pub request: HttpMessage,
    pub response: Option<HttpMessage>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub accepted_at: SystemTime,
}

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    ConnectionAdded(ConnectionInfo),
    /// The request head and body went out to the origin.
    RequestSent(Arc<HttpSession>),
    /// The response went back to the client. `response` is always set.
    ResponseSent(Arc<HttpSession>),
    ClientWebSocketMessageSent {
        connection_id: Uuid,
        message: Arc<WebSocketMessage>,
    },
    ServerWebSocketMessageSent {
        connection_id: Uuid,
        message: Arc<WebSocketMessage>,
    },
    Disposing {
        connection_id: Uuid,
    },
    ConnectionRemoved {
        connection_id: Uuid,
    },
}

impl ProxyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyEvent::ConnectionAdded(_) => "connection_added",
            ProxyEvent::RequestSent(_) => "request_sent",
            ProxyEvent::ResponseSent(_) => "response_sent",
            ProxyEvent::ClientWebSocketMessageSent { .. } => "client_websocket_message_sent",
            ProxyEvent::ServerWebSocketMessageSent { .. } => "server_websocket_message_sent",
            ProxyEvent::Disposing { .. } => "disposing",
            ProxyEvent::ConnectionRemoved { .. } => "connection_removed",
        }
    }

    pub fn connection_id(&self) -> Uuid {
        match self {
            ProxyEvent::ConnectionAdded(info) => info.id,
            ProxyEvent::RequestSent(session) | ProxyEvent::ResponseSent(session) => {
                session.connection_id
            }
            ProxyEvent::ClientWebSocketMessageSent { connection_id, .. }
            | ProxyEvent::ServerWebSocketMessageSent { connection_id, .. }
            | ProxyEvent::Disposing { connection_id }
            | ProxyEvent::ConnectionRemoved { connection_id } => *connection_id,
        }
    }
}

/// Receives every published [`ProxyEvent`].
pub trait EventSubscriber: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_event(&self, event: &ProxyEvent) -> anyhow::Result<()>;
}

/// A subscriber failure, surfaced on [`EventHub::fatal_errors`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub subscriber: String,
    pub event: &'static str,
    pub connection_id: Option<Uuid>,
    pub message: String,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "subscriber {} failed on {}: {}",
            self.subscriber, self.event, self.message
        )
    }
}

const FATAL_CHANNEL_CAPACITY: usize = 64;

pub struct EventHub {
    subscribers: ArcSwap<Vec<Arc<dyn EventSubscriber>>>,
    fatal: broadcast::Sender<FatalError>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (fatal, _) = broadcast::channel(FATAL_CHANNEL_CAPACITY);
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            fatal,
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(subscriber.clone());
            next
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }

    pub fn fatal_errors(&self) -> broadcast::Receiver<FatalError> {
        self.fatal.subscribe()
    }

    /// Reports a failure that did not come from a subscriber (accept loop, startup).
    pub fn report_fatal(&self, error: FatalError) {
        error!(subscriber = %error.subscriber, event = error.event, message = %error.message, "fatal error");
        let _ = self.fatal.send(error);
    }

    /// Delivers `event` to every subscriber. Never fails and never panics.
    pub fn publish(&self, event: ProxyEvent) {
        let subscribers = self.subscribers.load();
        for subscriber in subscribers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_event(&event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            self.report_fatal(FatalError {
                subscriber: subscriber.name().to_string(),
                event: event.name(),
                connection_id: Some(event.connection_id()),
                message,
            });
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "<non-string panic payload>"
    }
}
